//! In-memory template/device repositories (§1's reframed C7 scope: a thin
//! control-plane adapter over a map, not a real persistence tier).
//!
//! Grounded on `backend/api/protocols.py` (`_ensure_template_not_in_use`,
//! the `is_system`-forbidden-delete check) and `backend/api/devices.py` for
//! the CRUD/uniqueness rules, and `backend/database/models.py`'s
//! `seed_system_templates()` for the seed templates.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::RwLock;

use serde_json::json;

use crate::error::GatewayError;
use crate::model::{
    normalize_device_code, Device, Parse, ProtocolTemplate, ProtocolType, Step, TemplateBody,
    TemplateVariable, Trigger, VariableType,
};

/// In-memory store of protocol templates, keyed by surrogate id.
/// `is_system` rows are seeded at construction and refuse update/delete.
pub struct TemplateRepository {
    next_id: AtomicU64,
    rows: RwLock<HashMap<u64, ProtocolTemplate>>,
}

impl Default for TemplateRepository {
    fn default() -> Self {
        Self::new()
    }
}

impl TemplateRepository {
    pub fn new() -> Self {
        let repo = Self {
            next_id: AtomicU64::new(1),
            rows: RwLock::new(HashMap::new()),
        };
        for seed in system_templates() {
            repo.insert_seed(seed);
        }
        repo
    }

    fn insert_seed(&self, mut tpl: ProtocolTemplate) {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        tpl.id = id;
        self.rows.write().unwrap().insert(id, tpl);
    }

    pub fn get(&self, id: u64) -> Result<ProtocolTemplate, GatewayError> {
        self.rows
            .read()
            .unwrap()
            .get(&id)
            .cloned()
            .ok_or_else(|| GatewayError::NotFound(format!("template {id} not found")))
    }

    pub fn list(&self) -> Vec<ProtocolTemplate> {
        let mut out: Vec<_> = self.rows.read().unwrap().values().cloned().collect();
        out.sort_by_key(|t| t.id);
        out
    }

    pub fn create(&self, mut tpl: ProtocolTemplate) -> Result<ProtocolTemplate, GatewayError> {
        if let Some(step_id) = tpl.find_poll_write_violation() {
            return Err(GatewayError::Validation(format!(
                "poll step '{step_id}' declares a write action"
            )));
        }
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        tpl.id = id;
        tpl.is_system = false;
        self.rows.write().unwrap().insert(id, tpl.clone());
        Ok(tpl)
    }

    pub fn update(&self, id: u64, mut tpl: ProtocolTemplate) -> Result<ProtocolTemplate, GatewayError> {
        let mut rows = self.rows.write().unwrap();
        let existing = rows
            .get(&id)
            .ok_or_else(|| GatewayError::NotFound(format!("template {id} not found")))?;
        if existing.is_system {
            return Err(GatewayError::Forbidden("system templates are immutable".to_string()));
        }
        if let Some(step_id) = tpl.find_poll_write_violation() {
            return Err(GatewayError::Validation(format!(
                "poll step '{step_id}' declares a write action"
            )));
        }
        tpl.id = id;
        tpl.is_system = false;
        rows.insert(id, tpl.clone());
        Ok(tpl)
    }

    /// `in_use_check` is supplied by the caller (Manager) since only it knows
    /// which templates are currently referenced by a device.
    pub fn delete(&self, id: u64, in_use: bool) -> Result<(), GatewayError> {
        let mut rows = self.rows.write().unwrap();
        let existing = rows
            .get(&id)
            .ok_or_else(|| GatewayError::NotFound(format!("template {id} not found")))?;
        if existing.is_system {
            return Err(GatewayError::Forbidden("system templates cannot be deleted".to_string()));
        }
        if in_use {
            return Err(GatewayError::Conflict("template is in use by a device".to_string()));
        }
        rows.remove(&id);
        Ok(())
    }
}

/// In-memory store of devices, enforcing uniqueness on `device_code`/`name`.
pub struct DeviceRepository {
    next_id: AtomicU64,
    rows: RwLock<HashMap<u64, Device>>,
}

impl Default for DeviceRepository {
    fn default() -> Self {
        Self::new()
    }
}

impl DeviceRepository {
    pub fn new() -> Self {
        Self {
            next_id: AtomicU64::new(1),
            rows: RwLock::new(HashMap::new()),
        }
    }

    pub fn get(&self, id: u64) -> Result<Device, GatewayError> {
        self.rows
            .read()
            .unwrap()
            .get(&id)
            .cloned()
            .ok_or_else(|| GatewayError::NotFound(format!("device {id} not found")))
    }

    pub fn list(&self) -> Vec<Device> {
        let mut out: Vec<_> = self.rows.read().unwrap().values().cloned().collect();
        out.sort_by_key(|d| d.id);
        out
    }

    pub fn list_enabled(&self) -> Vec<Device> {
        self.list().into_iter().filter(|d| d.enabled).collect()
    }

    pub fn references_template(&self, template_id: u64) -> bool {
        self.rows
            .read()
            .unwrap()
            .values()
            .any(|d| d.protocol_template_id == template_id)
    }

    pub fn create(&self, mut device: Device) -> Result<Device, GatewayError> {
        let normalized = normalize_device_code(&device.device_code)
            .ok_or_else(|| GatewayError::Validation("invalid device_code".to_string()))?;
        let mut rows = self.rows.write().unwrap();
        if rows
            .values()
            .any(|d| d.device_code == normalized || d.name == device.name)
        {
            return Err(GatewayError::Conflict(
                "device_code or name already in use".to_string(),
            ));
        }
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        device.id = id;
        device.device_code = normalized;
        rows.insert(id, device.clone());
        Ok(device)
    }

    pub fn update(&self, id: u64, mut device: Device) -> Result<Device, GatewayError> {
        let normalized = normalize_device_code(&device.device_code)
            .ok_or_else(|| GatewayError::Validation("invalid device_code".to_string()))?;
        let mut rows = self.rows.write().unwrap();
        if !rows.contains_key(&id) {
            return Err(GatewayError::NotFound(format!("device {id} not found")));
        }
        if rows
            .iter()
            .any(|(&other_id, d)| other_id != id && (d.device_code == normalized || d.name == device.name))
        {
            return Err(GatewayError::Conflict(
                "device_code or name already in use".to_string(),
            ));
        }
        device.id = id;
        device.device_code = normalized;
        rows.insert(id, device.clone());
        Ok(device)
    }

    pub fn delete(&self, id: u64) -> Result<Device, GatewayError> {
        self.rows
            .write()
            .unwrap()
            .remove(&id)
            .ok_or_else(|| GatewayError::NotFound(format!("device {id} not found")))
    }

    pub fn set_enabled(&self, id: u64, enabled: bool) -> Result<Device, GatewayError> {
        let mut rows = self.rows.write().unwrap();
        let device = rows
            .get_mut(&id)
            .ok_or_else(|| GatewayError::NotFound(format!("device {id} not found")))?;
        device.enabled = enabled;
        Ok(device.clone())
    }
}

/// Merges a template's variable defaults with a device's overrides, the
/// shape the executor expects as `vars`.
pub fn resolve_template_vars(
    template: &ProtocolTemplate,
    device: &Device,
) -> HashMap<String, serde_json::Value> {
    let mut vars = HashMap::new();
    for v in &template.template.variables {
        vars.insert(v.name.clone(), v.default.clone());
    }
    for (k, v) in &device.template_variables {
        vars.insert(k.clone(), v.clone());
    }
    for (k, v) in &device.connection_params {
        vars.entry(k.clone()).or_insert_with(|| v.clone());
    }
    vars
}

fn system_templates() -> Vec<ProtocolTemplate> {
    vec![standard_modbus_scale(), mqtt_weight_topic()]
}

fn standard_modbus_scale() -> ProtocolTemplate {
    ProtocolTemplate {
        id: 0,
        name: "Standard Input-Register Scale".to_string(),
        description: "Reads two Modbus TCP input registers and combines them into a weight."
            .to_string(),
        protocol_type: ProtocolType::ModbusTcp,
        is_system: true,
        template: TemplateBody {
            variables: vec![
                TemplateVariable {
                    name: "slave_id".to_string(),
                    var_type: VariableType::Int,
                    default: json!(1),
                    label: Some("Slave ID".to_string()),
                },
                TemplateVariable {
                    name: "address".to_string(),
                    var_type: VariableType::Int,
                    default: json!(0),
                    label: Some("Register address".to_string()),
                },
            ],
            setup_steps: vec![],
            steps: vec![Step {
                id: "read_weight".to_string(),
                name: Some("Read weight registers".to_string()),
                trigger: Trigger::Poll,
                action: "modbus.read_input_registers".to_string(),
                params: HashMap::from([
                    ("slave_id".to_string(), json!("${slave_id}")),
                    ("address".to_string(), json!("${address}")),
                    ("count".to_string(), json!(2)),
                ]),
                parse: Some(Parse::Expression {
                    expression: "registers[0]*65536+registers[1]".to_string(),
                }),
            }],
            message_handler: None,
            output: json!({
                "weight": "${steps.read_weight.result}",
                "unit": "kg",
            }),
        },
    }
}

fn mqtt_weight_topic() -> ProtocolTemplate {
    ProtocolTemplate {
        id: 0,
        name: "MQTT Weight Topic".to_string(),
        description: "Subscribes to a weight topic and extracts the weight field from its JSON-ish payload."
            .to_string(),
        protocol_type: ProtocolType::Mqtt,
        is_system: true,
        template: TemplateBody {
            variables: vec![TemplateVariable {
                name: "topic".to_string(),
                var_type: VariableType::String,
                default: json!("sensor/weight"),
                label: Some("Topic".to_string()),
            }],
            setup_steps: vec![Step {
                id: "subscribe".to_string(),
                name: Some("Subscribe".to_string()),
                trigger: Trigger::Poll,
                action: "mqtt.subscribe".to_string(),
                params: HashMap::from([
                    ("topic".to_string(), json!("${topic}")),
                    ("qos".to_string(), json!(0)),
                ]),
                parse: None,
            }],
            steps: vec![],
            message_handler: Some(crate::model::MessageHandler {
                action: "mqtt.on_message".to_string(),
                params: HashMap::new(),
                parse: Some(Parse::Regex {
                    pattern: "\"weight\"\\s*:\\s*([-+]?[0-9]*\\.?[0-9]+)".to_string(),
                    group: 1,
                }),
            }),
            output: json!({
                "weight": "${steps.message_handler.result}",
                "unit": "kg",
            }),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn seeds_two_system_templates() {
        let repo = TemplateRepository::new();
        let all = repo.list();
        assert_eq!(all.len(), 2);
        assert!(all.iter().all(|t| t.is_system));
    }

    #[test]
    fn rejects_device_with_bad_code() {
        let repo = DeviceRepository::new();
        let device = Device {
            id: 0,
            device_code: "!!!".to_string(),
            name: "scale-1".to_string(),
            protocol_template_id: 1,
            connection_params: HashMap::new(),
            template_variables: HashMap::new(),
            poll_interval: 1.0,
            enabled: true,
        };
        assert!(repo.create(device).is_err());
    }

    #[test]
    fn rejects_duplicate_device_code() {
        let repo = DeviceRepository::new();
        let mk = |code: &str, name: &str| Device {
            id: 0,
            device_code: code.to_string(),
            name: name.to_string(),
            protocol_template_id: 1,
            connection_params: HashMap::new(),
            template_variables: HashMap::new(),
            poll_interval: 1.0,
            enabled: true,
        };
        repo.create(mk("SCALE-1", "scale one")).unwrap();
        let err = repo.create(mk("scale-1", "scale two")).unwrap_err();
        assert_eq!(err.kind(), "conflict");
    }

    #[test]
    fn system_template_delete_is_forbidden() {
        let repo = TemplateRepository::new();
        let err = repo.delete(1, false).unwrap_err();
        assert_eq!(err.kind(), "forbidden");
    }
}
