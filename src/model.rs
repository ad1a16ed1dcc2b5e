//! Data model shared by the executor, driver layer, device manager and REST adapters.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::OnceLock;

fn device_code_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"^[A-Z0-9][A-Z0-9_-]{0,63}$").unwrap())
}

/// Uppercase + trim a device code, same as the persistence-time normalisation
/// the control-plane adapters apply on create/update/import.
pub fn normalize_device_code(raw: &str) -> Option<String> {
    let normalized = raw.trim().to_uppercase();
    if normalized.is_empty() || !device_code_pattern().is_match(&normalized) {
        return None;
    }
    Some(normalized)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProtocolType {
    ModbusTcp,
    ModbusRtu,
    Mqtt,
    Serial,
    Tcp,
}

impl ProtocolType {
    pub fn is_mqtt(self) -> bool {
        matches!(self, ProtocolType::Mqtt)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VariableType {
    String,
    Int,
    Float,
    Bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TemplateVariable {
    pub name: String,
    #[serde(rename = "type")]
    pub var_type: VariableType,
    pub default: Value,
    #[serde(default)]
    pub label: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Trigger {
    Poll,
    Manual,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "type")]
pub enum Parse {
    Expression { expression: String },
    Regex { pattern: String, #[serde(default = "default_group")] group: usize },
    Substring { start: i64, end: i64 },
    Struct { format: String, #[serde(default)] fields: Option<Vec<String>> },
}

fn default_group() -> usize {
    1
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Step {
    pub id: String,
    #[serde(default)]
    pub name: Option<String>,
    pub trigger: Trigger,
    pub action: String,
    #[serde(default)]
    pub params: HashMap<String, Value>,
    #[serde(default)]
    pub parse: Option<Parse>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageHandler {
    pub action: String,
    #[serde(default)]
    pub params: HashMap<String, Value>,
    #[serde(default)]
    pub parse: Option<Parse>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TemplateBody {
    #[serde(default)]
    pub variables: Vec<TemplateVariable>,
    #[serde(default)]
    pub setup_steps: Vec<Step>,
    #[serde(default)]
    pub steps: Vec<Step>,
    #[serde(default)]
    pub message_handler: Option<MessageHandler>,
    pub output: Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProtocolTemplate {
    pub id: u64,
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub protocol_type: ProtocolType,
    pub is_system: bool,
    pub template: TemplateBody,
}

impl ProtocolTemplate {
    /// Validator-time rejection of any poll-triggered step declaring a write
    /// action. Returns the offending step id, if any.
    pub fn find_poll_write_violation(&self) -> Option<&str> {
        self.template
            .steps
            .iter()
            .find(|s| s.trigger == Trigger::Poll && is_write_action(&s.action))
            .map(|s| s.id.as_str())
    }
}

pub fn is_write_action(action: &str) -> bool {
    matches!(
        action,
        "modbus.write_register" | "modbus.write_coil" | "mqtt.publish"
    )
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Device {
    pub id: u64,
    pub device_code: String,
    pub name: String,
    pub protocol_template_id: u64,
    #[serde(default)]
    pub connection_params: HashMap<String, Value>,
    #[serde(default)]
    pub template_variables: HashMap<String, Value>,
    #[serde(default = "default_poll_interval")]
    pub poll_interval: f64,
    #[serde(default = "default_true")]
    pub enabled: bool,
}

fn default_poll_interval() -> f64 {
    1.0
}

fn default_true() -> bool {
    true
}

impl Device {
    pub fn effective_poll_interval(&self) -> f64 {
        self.poll_interval.max(0.1)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RuntimeStatus {
    Offline,
    Online,
    Error,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepOutcome {
    pub result: Value,
}

/// Live, per-device snapshot. Cloned out to callers (`runtime_snapshot`,
/// publish) so readers never hold a reference into the runtime's own state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeState {
    pub device_id: u64,
    pub device_code: String,
    pub device_name: String,
    pub status: RuntimeStatus,
    pub weight: Option<f64>,
    pub unit: String,
    pub timestamp: DateTime<Utc>,
    pub error: Option<String>,
    #[serde(skip_serializing)]
    pub step_results: HashMap<String, StepOutcome>,
}

impl RuntimeState {
    pub fn offline(device_id: u64, device_code: &str, device_name: &str) -> Self {
        Self {
            device_id,
            device_code: device_code.to_string(),
            device_name: device_name.to_string(),
            status: RuntimeStatus::Offline,
            weight: None,
            unit: "kg".to_string(),
            timestamp: Utc::now(),
            error: None,
            step_results: HashMap::new(),
        }
    }

    pub fn mark_offline(&mut self, error: Option<String>) {
        self.status = RuntimeStatus::Offline;
        self.error = error;
        self.timestamp = Utc::now();
    }

    pub fn mark_online(&mut self, weight: Option<f64>, unit: String) {
        self.status = RuntimeStatus::Online;
        self.weight = weight;
        self.unit = unit;
        self.error = None;
        self.timestamp = Utc::now();
    }

    pub fn mark_error(&mut self, error: String) {
        self.status = RuntimeStatus::Error;
        self.error = Some(error);
        self.timestamp = Utc::now();
    }

    /// The message shape published on the Event Bus: `{type:"weight_update", ...}`.
    pub fn to_message(&self) -> Value {
        serde_json::json!({
            "type": "weight_update",
            "device_id": self.device_id,
            "device_code": self.device_code,
            "device_name": self.device_name,
            "status": self.status,
            "weight": self.weight,
            "unit": self.unit,
            "timestamp": self.timestamp,
            "error": self.error,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalizes_and_rejects_device_codes() {
        assert_eq!(normalize_device_code(" scale-01 "), Some("SCALE-01".to_string()));
        assert_eq!(normalize_device_code(""), None);
        assert_eq!(normalize_device_code("-bad"), None);
    }

    #[test]
    fn detects_poll_write_violation() {
        let tpl = ProtocolTemplate {
            id: 1,
            name: "t".into(),
            description: String::new(),
            protocol_type: ProtocolType::ModbusTcp,
            is_system: false,
            template: TemplateBody {
                variables: vec![],
                setup_steps: vec![],
                steps: vec![Step {
                    id: "w".into(),
                    name: None,
                    trigger: Trigger::Poll,
                    action: "modbus.write_register".into(),
                    params: HashMap::new(),
                    parse: None,
                }],
                message_handler: None,
                output: serde_json::json!({}),
            },
        };
        assert_eq!(tpl.find_poll_write_violation(), Some("w"));
    }
}
