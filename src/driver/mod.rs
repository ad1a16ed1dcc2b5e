//! Driver abstraction: one wire-I/O adapter per protocol family.
//!
//! Grounded on `backend/drivers/base.py` + `backend/drivers/__init__.py` of the
//! original implementation: a closed capability set, built through a factory
//! keyed by `protocol_type`. Kept strictly I/O — all interpretation of
//! templates lives in the executor.

mod modbus;
mod mqtt;
mod serial;
mod tcp;

pub use modbus::ModbusDriver;
pub use mqtt::MqttDriver;
pub use serial::SerialDriver;
pub use tcp::TcpDriver;

use std::collections::HashMap;

use async_trait::async_trait;
use serde_json::Value;

use crate::error::GatewayError;
use crate::model::ProtocolType;

/// Invoked by a push-oriented driver (MQTT) for every inbound message. Must
/// be re-entrant and must not block waiting on the driver or the manager.
pub type MessageHandler =
    std::sync::Arc<dyn Fn(String, Vec<u8>) + Send + Sync + 'static>;

#[async_trait]
pub trait Driver: Send + Sync {
    async fn connect(&mut self) -> Result<(), GatewayError>;
    async fn disconnect(&mut self) -> Result<(), GatewayError>;
    async fn is_connected(&self) -> bool;
    async fn execute_action(
        &mut self,
        action: &str,
        params: &HashMap<String, Value>,
    ) -> Result<Value, GatewayError>;

    /// No-op default: only push-oriented drivers override this.
    fn register_message_handler(&mut self, _handler: MessageHandler) {}

    /// Populated by drivers that record a connect-failure reason (serial,
    /// modbus) so the runtime can enrich its `offline` message.
    fn last_error(&self) -> Option<String> {
        None
    }
}

pub fn build_driver(
    protocol_type: ProtocolType,
    connection_params: HashMap<String, Value>,
    simulate_on_connect_fail: bool,
) -> Box<dyn Driver> {
    match protocol_type {
        ProtocolType::ModbusTcp | ProtocolType::ModbusRtu => {
            Box::new(ModbusDriver::new(connection_params, simulate_on_connect_fail))
        }
        ProtocolType::Mqtt => Box::new(MqttDriver::new(connection_params)),
        ProtocolType::Serial => Box::new(SerialDriver::new(connection_params)),
        ProtocolType::Tcp => Box::new(TcpDriver::new(connection_params)),
    }
}

pub(crate) fn param_str(params: &HashMap<String, Value>, key: &str) -> Option<String> {
    params.get(key).map(|v| match v {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    })
}

pub(crate) fn param_u64(params: &HashMap<String, Value>, key: &str, default: u64) -> u64 {
    params
        .get(key)
        .and_then(|v| v.as_u64().or_else(|| v.as_str().and_then(|s| s.parse().ok())))
        .unwrap_or(default)
}

pub(crate) fn param_f64(params: &HashMap<String, Value>, key: &str, default: f64) -> f64 {
    params
        .get(key)
        .and_then(|v| v.as_f64().or_else(|| v.as_str().and_then(|s| s.parse().ok())))
        .unwrap_or(default)
}

pub(crate) fn param_bool(params: &HashMap<String, Value>, key: &str, default: bool) -> bool {
    params.get(key).and_then(|v| v.as_bool()).unwrap_or(default)
}

/// `encoding`-aware conversion of a request param into bytes, matching the
/// `_to_bytes` helper shared by the serial and TCP drivers upstream.
pub(crate) fn to_bytes(data: &Value, encoding: &str) -> Vec<u8> {
    let text = match data {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    };
    if encoding == "hex" {
        let cleaned: String = text.chars().filter(|c| !c.is_whitespace()).collect();
        hex::decode(cleaned).unwrap_or_default()
    } else {
        text.into_bytes()
    }
}
