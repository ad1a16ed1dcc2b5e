//! Modbus TCP/RTU driver.
//!
//! Grounded on `backend/drivers/modbus_driver.py`: branches on `host` (TCP) vs
//! `port` without `host` (RTU) vs neither (bare dev fallback), and on
//! `simulate_on_connect_fail` for a synthetic-weight fallback when the wire
//! connect fails. tokio-modbus call shape follows the pack's own usages
//! (`tokio_modbus::client::tcp::connect_slave`, `rtu::attach_slave`).

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use rand::Rng;
use serde_json::{json, Value};
use tokio_modbus::client::{rtu, tcp, Context};
use tokio_modbus::prelude::*;
use tokio_serial::SerialStream;

use super::{param_bool, param_f64, param_str, param_u64, Driver};
use crate::error::GatewayError;

pub struct ModbusDriver {
    params: HashMap<String, Value>,
    simulate_on_connect_fail: bool,
    client: Option<Context>,
    connected: bool,
    last_error: Option<String>,
}

impl ModbusDriver {
    pub fn new(params: HashMap<String, Value>, simulate_on_connect_fail: bool) -> Self {
        Self {
            params,
            simulate_on_connect_fail,
            client: None,
            connected: false,
            last_error: None,
        }
    }

    fn simulate(&self, action: &str, params: &HashMap<String, Value>) -> Result<Value, GatewayError> {
        if action.starts_with("modbus.read") {
            let count = param_u64(params, "count", 2) as usize;
            let kg: f64 = rand::thread_rng().gen_range(0.0..30.0);
            let raw = (kg * 1000.0) as u32;
            let hi = (raw >> 16) & 0xFFFF;
            let lo = raw & 0xFFFF;
            let mut registers = vec![hi, lo];
            while registers.len() < count {
                registers.push(0);
            }
            registers.truncate(count.max(2));
            return Ok(json!({
                "registers": registers,
                "coils": [true, false, true, false],
            }));
        }
        if action.starts_with("modbus.write") {
            return Ok(json!({"ok": true}));
        }
        Err(GatewayError::Unsupported(format!(
            "unsupported action for ModbusDriver: {action}"
        )))
    }
}

#[async_trait]
impl Driver for ModbusDriver {
    async fn connect(&mut self) -> Result<(), GatewayError> {
        let host = param_str(&self.params, "host");
        let port_name = param_str(&self.params, "port");

        if let Some(host) = host.filter(|h| !h.is_empty()) {
            let port = param_u64(&self.params, "port", 502) as u16;
            let addr = format!("{host}:{port}")
                .parse()
                .map_err(|e| GatewayError::ConnectFailed(format!("invalid address: {e}")))?;
            let slave = Slave(param_u64(&self.params, "slave_id", 1) as u8);
            match tcp::connect_slave(addr, slave).await {
                Ok(ctx) => {
                    self.client = Some(ctx);
                    self.connected = true;
                    self.last_error = None;
                    return Ok(());
                }
                Err(e) => {
                    self.last_error = Some(e.to_string());
                    if self.simulate_on_connect_fail {
                        self.client = None;
                        self.connected = true;
                        return Ok(());
                    }
                    return Err(GatewayError::ConnectFailed(e.to_string()));
                }
            }
        }

        if let Some(port_name) = port_name.filter(|p| !p.is_empty()) {
            let baud = param_u64(&self.params, "baudrate", 9600) as u32;
            let timeout_ms = (param_f64(&self.params, "timeout", 1.0) * 1000.0) as u64;
            let builder = tokio_serial::new(&port_name, baud).timeout(Duration::from_millis(timeout_ms));
            match SerialStream::open(&builder) {
                Ok(stream) => {
                    let slave = Slave(param_u64(&self.params, "slave_id", 1) as u8);
                    self.client = Some(rtu::attach_slave(stream, slave));
                    self.connected = true;
                    self.last_error = None;
                    Ok(())
                }
                Err(e) => {
                    self.last_error = Some(e.to_string());
                    if self.simulate_on_connect_fail {
                        self.client = None;
                        self.connected = true;
                        return Ok(());
                    }
                    Err(GatewayError::ConnectFailed(e.to_string()))
                }
            }
        } else {
            // Dev fallback: no host and no port configured.
            self.connected = true;
            Ok(())
        }
    }

    async fn disconnect(&mut self) -> Result<(), GatewayError> {
        self.client = None;
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
        let Some(ctx) = self.client.as_mut() else {
            return self.simulate(action, params);
        };

        let slave_id = param_u64(params, "slave_id", 1) as u8;
        let address = param_u64(params, "address", 0) as u16;
        ctx.set_slave(Slave(slave_id));

        match action {
            "modbus.read_input_registers" => {
                let count = param_u64(params, "count", 2) as u16;
                let registers = ctx
                    .read_input_registers(address, count)
                    .await
                    .map_err(|e| GatewayError::ActionError(e.to_string()))?
                    .map_err(|e| GatewayError::ActionError(e.to_string()))?;
                Ok(json!({"registers": registers}))
            }
            "modbus.read_holding_registers" => {
                let count = param_u64(params, "count", 2) as u16;
                let registers = ctx
                    .read_holding_registers(address, count)
                    .await
                    .map_err(|e| GatewayError::ActionError(e.to_string()))?
                    .map_err(|e| GatewayError::ActionError(e.to_string()))?;
                Ok(json!({"registers": registers}))
            }
            "modbus.read_coils" => {
                let count = param_u64(params, "count", 8) as u16;
                let coils = ctx
                    .read_coils(address, count)
                    .await
                    .map_err(|e| GatewayError::ActionError(e.to_string()))?
                    .map_err(|e| GatewayError::ActionError(e.to_string()))?;
                Ok(json!({"coils": coils.into_iter().take(count as usize).collect::<Vec<_>>()}))
            }
            "modbus.read_discrete_inputs" => {
                let count = param_u64(params, "count", 8) as u16;
                let coils = ctx
                    .read_discrete_inputs(address, count)
                    .await
                    .map_err(|e| GatewayError::ActionError(e.to_string()))?
                    .map_err(|e| GatewayError::ActionError(e.to_string()))?;
                Ok(json!({"coils": coils.into_iter().take(count as usize).collect::<Vec<_>>()}))
            }
            "modbus.write_register" => {
                let value = param_u64(params, "value", 0) as u16;
                ctx.write_single_register(address, value)
                    .await
                    .map_err(|e| GatewayError::ActionError(e.to_string()))?
                    .map_err(|e| GatewayError::ActionError(e.to_string()))?;
                Ok(json!({"ok": true}))
            }
            "modbus.write_coil" => {
                let value = param_bool(params, "value", false);
                ctx.write_single_coil(address, value)
                    .await
                    .map_err(|e| GatewayError::ActionError(e.to_string()))?
                    .map_err(|e| GatewayError::ActionError(e.to_string()))?;
                Ok(json!({"ok": true}))
            }
            other => Err(GatewayError::Unsupported(format!(
                "unsupported action for ModbusDriver: {other}"
            ))),
        }
    }
}
