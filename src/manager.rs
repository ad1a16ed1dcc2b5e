//! Device Manager (§4.4): owns the `device_id -> Runtime` table, the
//! subscription surface, and the manual-step RPC path.
//!
//! Grounded on `backend/services/device_manager.py::DeviceManager`. The
//! `_runtimes` dict guarded by a single lock is preserved in spirit as a
//! `HashMap` behind a `tokio::sync::Mutex`; the mutex is never held across
//! driver I/O.

use std::collections::HashMap;
use std::sync::Arc;

use serde_json::Value;
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::driver::build_driver;
use crate::error::GatewayError;
use crate::event_bus::{EventBus, Subscription};
use crate::executor;
use crate::model::{ProtocolTemplate, RuntimeState};
use crate::repository::{resolve_template_vars, DeviceRepository, TemplateRepository};
use crate::runtime::Runtime;

pub struct DeviceManager {
    templates: Arc<TemplateRepository>,
    devices: Arc<DeviceRepository>,
    bus: Arc<EventBus>,
    simulate_on_connect_fail: bool,
    runtimes: Mutex<HashMap<u64, Runtime>>,
}

impl DeviceManager {
    pub fn new(
        templates: Arc<TemplateRepository>,
        devices: Arc<DeviceRepository>,
        bus: Arc<EventBus>,
        simulate_on_connect_fail: bool,
    ) -> Self {
        Self {
            templates,
            devices,
            bus,
            simulate_on_connect_fail,
            runtimes: Mutex::new(HashMap::new()),
        }
    }

    pub fn event_bus(&self) -> &EventBus {
        &self.bus
    }

    pub fn subscribe(&self) -> Subscription {
        self.bus.subscribe()
    }

    pub fn unsubscribe(&self, id: Uuid) {
        self.bus.unsubscribe(id);
    }

    /// Loads every enabled device and starts one runtime each.
    pub async fn startup(&self) -> Result<(), GatewayError> {
        for device in self.devices.list_enabled() {
            self.start_device(device.id).await?;
        }
        Ok(())
    }

    pub async fn start_device(&self, device_id: u64) -> Result<(), GatewayError> {
        self.stop_device_internal(device_id).await;

        let device = self.devices.get(device_id)?;
        let template = self.templates.get(device.protocol_template_id)?;
        let vars = resolve_template_vars(&template, &device);
        let driver = build_driver(
            template.protocol_type,
            device.connection_params.clone(),
            self.simulate_on_connect_fail,
        );

        let runtime = Runtime::spawn(device, Arc::new(template), driver, vars, self.bus.clone());
        self.runtimes.lock().await.insert(device_id, runtime);
        Ok(())
    }

    pub async fn stop_device(&self, device_id: u64) -> Result<(), GatewayError> {
        self.stop_device_internal(device_id).await;
        Ok(())
    }

    async fn stop_device_internal(&self, device_id: u64) {
        if let Some(runtime) = self.runtimes.lock().await.remove(&device_id) {
            runtime.stop().await;
        }
    }

    /// `reload_device(id)`: stop+start if the device is (still) enabled,
    /// stop-only otherwise.
    pub async fn reload_device(&self, device_id: u64) -> Result<(), GatewayError> {
        match self.devices.get(device_id) {
            Ok(device) if device.enabled => self.start_device(device_id).await,
            Ok(_) => {
                self.stop_device_internal(device_id).await;
                Ok(())
            }
            Err(_) => {
                self.stop_device_internal(device_id).await;
                Ok(())
            }
        }
    }

    pub async fn remove_device(&self, device_id: u64) -> Result<(), GatewayError> {
        self.stop_device(device_id).await
    }

    pub async fn execute_manual_step(
        &self,
        device_id: u64,
        step_id: &str,
        params_override: HashMap<String, Value>,
    ) -> Result<executor::ManualStepResult, GatewayError> {
        let runtimes = self.runtimes.lock().await;
        let runtime = runtimes
            .get(&device_id)
            .ok_or_else(|| GatewayError::NotFound(format!("no runtime for device {device_id}")))?;

        let template = runtime.template.clone();
        let driver = runtime.driver.clone();
        let state = runtime.state.clone();
        drop(runtimes);

        let device = self.devices.get(device_id)?;
        let vars = resolve_template_vars(&template, &device);
        let previous = state.lock().await.step_results.clone();

        let mut drv = driver.lock().await;
        executor::run_manual_step(&template, drv.as_mut(), step_id, &vars, &params_override, &previous).await
    }

    /// Dry-runs a single step without persisting it into any device's
    /// runtime state; used by the REST "test step" endpoint. The write gate
    /// is checked before any driver is constructed. The ephemeral driver is
    /// always disconnected, even if the step run fails.
    pub async fn test_step(
        &self,
        template: &ProtocolTemplate,
        step_id: &str,
        vars: &HashMap<String, Value>,
        params_override: &HashMap<String, Value>,
        allow_write: bool,
        connection_params: HashMap<String, Value>,
    ) -> Result<executor::ManualStepResult, GatewayError> {
        let step = template
            .template
            .steps
            .iter()
            .find(|s| s.id == step_id)
            .ok_or_else(|| GatewayError::NotFound(format!("step '{step_id}' not found")))?;

        if crate::model::is_write_action(&step.action) && !allow_write {
            return Err(GatewayError::Forbidden(format!(
                "write action '{}' requires allow_write=true",
                step.action
            )));
        }

        let mut driver = build_driver(
            template.protocol_type,
            connection_params,
            self.simulate_on_connect_fail,
        );
        let result = async {
            driver.connect().await?;
            executor::run_manual_step(
                template,
                driver.as_mut(),
                step_id,
                vars,
                params_override,
                &HashMap::new(),
            )
            .await
        }
        .await;
        let _ = driver.disconnect().await;
        result
    }

    pub async fn runtime_snapshot(&self, device_id: u64) -> RuntimeState {
        if let Some(runtime) = self.runtimes.lock().await.get(&device_id) {
            return runtime.state.lock().await.clone();
        }
        match self.devices.get(device_id) {
            Ok(device) => RuntimeState::offline(device.id, &device.device_code, &device.name),
            Err(_) => RuntimeState::offline(device_id, "unknown", "unknown"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Device;
    use std::collections::HashMap as Map;

    fn manager() -> DeviceManager {
        DeviceManager::new(
            Arc::new(TemplateRepository::new()),
            Arc::new(DeviceRepository::new()),
            Arc::new(EventBus::new()),
            true,
        )
    }

    #[tokio::test]
    async fn snapshot_of_unknown_device_is_offline() {
        let mgr = manager();
        let snap = mgr.runtime_snapshot(999).await;
        assert_eq!(snap.device_code, "unknown");
        assert!(matches!(snap.status, crate::model::RuntimeStatus::Offline));
    }

    #[tokio::test]
    async fn execute_manual_step_without_runtime_is_not_found() {
        let mgr = manager();
        let err = mgr.execute_manual_step(1, "tare", Map::new()).await.unwrap_err();
        assert_eq!(err.kind(), "not_found");
    }

    #[tokio::test]
    async fn start_stop_device_lifecycle() {
        let mgr = manager();
        let device = Device {
            id: 0,
            device_code: "TCP-1".to_string(),
            name: "tcp probe".to_string(),
            protocol_template_id: 1, // the seeded modbus_tcp system template
            connection_params: HashMap::new(),
            template_variables: HashMap::new(),
            poll_interval: 0.1,
            enabled: true,
        };
        let device = mgr.devices.create(device).unwrap();
        mgr.start_device(device.id).await.unwrap();
        assert_eq!(mgr.runtimes.lock().await.len(), 1);
        mgr.stop_device(device.id).await.unwrap();
        assert_eq!(mgr.runtimes.lock().await.len(), 0);
    }
}
