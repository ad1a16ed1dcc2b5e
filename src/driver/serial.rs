//! Serial-port driver.
//!
//! Grounded on `backend/drivers/serial_driver.py`: records the connect
//! failure reason via `last_error()` (consumed by the runtime to enrich its
//! offline message), and falls back to a canned payload on `receive` when no
//! real port is open.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio_serial::SerialStream;

use super::{param_str, param_u64, to_bytes, Driver};
use crate::error::GatewayError;

pub struct SerialDriver {
    params: HashMap<String, Value>,
    port: Option<SerialStream>,
    connected: bool,
    last_error: Option<String>,
}

impl SerialDriver {
    pub fn new(params: HashMap<String, Value>) -> Self {
        Self {
            params,
            port: None,
            connected: false,
            last_error: None,
        }
    }
}

#[async_trait]
impl Driver for SerialDriver {
    async fn connect(&mut self) -> Result<(), GatewayError> {
        let port_name = param_str(&self.params, "port").unwrap_or_else(|| "/dev/ttyUSB0".to_string());
        let baud = param_u64(&self.params, "baudrate", 9600) as u32;
        let builder = tokio_serial::new(&port_name, baud)
            .timeout(Duration::from_millis(1000));
        match SerialStream::open(&builder) {
            Ok(stream) => {
                self.port = Some(stream);
                self.connected = true;
                self.last_error = None;
            }
            Err(e) => {
                self.last_error = Some(e.to_string());
                self.connected = false;
                tracing::warn!(port = %port_name, baudrate = baud, error = %e, "serial connect failed");
                return Err(GatewayError::ConnectFailed(e.to_string()));
            }
        }
        Ok(())
    }

    async fn disconnect(&mut self) -> Result<(), GatewayError> {
        self.port = None;
        self.connected = false;
        Ok(())
    }

    async fn is_connected(&self) -> bool {
        self.connected
    }

    fn last_error(&self) -> Option<String> {
        self.last_error.clone()
    }

    async fn execute_action(
        &mut self,
        action: &str,
        params: &HashMap<String, Value>,
    ) -> Result<Value, GatewayError> {
        match action {
            "serial.send" => {
                let encoding = param_str(params, "encoding").unwrap_or_else(|| "ascii".to_string());
                let data = to_bytes(params.get("data").unwrap_or(&Value::Null), &encoding);
                if let Some(port) = self.port.as_mut() {
                    port.write_all(&data)
                        .await
                        .map_err(|e| GatewayError::ActionError(e.to_string()))?;
                }
                Ok(json!({"bytes_sent": data.len()}))
            }
            "serial.receive" => {
                let size = param_u64(params, "size", 0) as usize;
                let timeout_ms = param_u64(params, "timeout", 1000);
                let Some(port) = self.port.as_mut() else {
                    return Ok(json!({"payload": "WS 12.34"}));
                };
                let mut buf = vec![0u8; size.max(1)];
                let read = tokio::time::timeout(
                    Duration::from_millis(timeout_ms),
                    port.read(&mut buf),
                )
                .await
                .map_err(|_| GatewayError::Timeout("serial.receive".to_string()))?
                .map_err(|e| GatewayError::ActionError(e.to_string()))?;
                buf.truncate(read);
                Ok(json!({"payload": String::from_utf8_lossy(&buf)}))
            }
            other => Err(GatewayError::Unsupported(format!(
                "unsupported action for SerialDriver: {other}"
            ))),
        }
    }
}
