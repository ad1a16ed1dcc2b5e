//! Raw TCP driver.
//!
//! Grounded on `backend/drivers/tcp_driver.py`: dev fallback when no
//! `host`/`port` configured, otherwise a plain `TcpStream`.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

use super::{param_str, param_u64, to_bytes, Driver};
use crate::error::GatewayError;

pub struct TcpDriver {
    params: HashMap<String, Value>,
    stream: Option<TcpStream>,
    connected: bool,
}

impl TcpDriver {
    pub fn new(params: HashMap<String, Value>) -> Self {
        Self {
            params,
            stream: None,
            connected: false,
        }
    }
}

#[async_trait]
impl Driver for TcpDriver {
    async fn connect(&mut self) -> Result<(), GatewayError> {
        let host = param_str(&self.params, "host");
        let port = param_u64(&self.params, "port", 0) as u16;

        let (Some(host), true) = (host.filter(|h| !h.is_empty()), port != 0) else {
            self.connected = true;
            return Ok(());
        };

        match TcpStream::connect((host.as_str(), port)).await {
            Ok(stream) => {
                self.stream = Some(stream);
                self.connected = true;
                Ok(())
            }
            Err(e) => {
                self.connected = false;
                Err(GatewayError::ConnectFailed(e.to_string()))
            }
        }
    }

    async fn disconnect(&mut self) -> Result<(), GatewayError> {
        self.stream = None;
        self.connected = false;
        Ok(())
    }

    async fn is_connected(&self) -> bool {
        self.connected
    }

    async fn execute_action(
        &mut self,
        action: &str,
        params: &HashMap<String, Value>,
    ) -> Result<Value, GatewayError> {
        match action {
            "tcp.send" => {
                let encoding = param_str(params, "encoding").unwrap_or_else(|| "ascii".to_string());
                let data = to_bytes(params.get("data").unwrap_or(&Value::Null), &encoding);
                if let Some(stream) = self.stream.as_mut() {
                    stream
                        .write_all(&data)
                        .await
                        .map_err(|e| GatewayError::ActionError(e.to_string()))?;
                }
                Ok(json!({"bytes_sent": data.len()}))
            }
            "tcp.receive" => {
                let size = param_u64(params, "size", 0) as usize;
                let timeout_ms = param_u64(params, "timeout", 1000);
                let Some(stream) = self.stream.as_mut() else {
                    return Ok(json!({"payload": "0.0"}));
                };
                let mut buf = vec![0u8; size.max(1)];
                let read = tokio::time::timeout(
                    Duration::from_millis(timeout_ms),
                    stream.read(&mut buf),
                )
                .await
                .map_err(|_| GatewayError::Timeout("tcp.receive".to_string()))?
                .map_err(|e| GatewayError::ActionError(e.to_string()))?;
                buf.truncate(read);
                Ok(json!({"payload": String::from_utf8_lossy(&buf)}))
            }
            other => Err(GatewayError::Unsupported(format!(
                "unsupported action for TcpDriver: {other}"
            ))),
        }
    }
}
