//! Per-device Runtime task (§4.4): the state machine driving one Device
//! through OFFLINE -> ONLINE -> ERROR, polling or message-dispatching through
//! the Template Executor against its Driver.
//!
//! Grounded on `backend/services/device_manager.py::_run_runtime`.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tokio::sync::{mpsc, Mutex};

use crate::driver::Driver;
use crate::event_bus::EventBus;
use crate::executor;
use crate::model::{Device, ProtocolTemplate, ProtocolType, RuntimeState};

const MIN_BACKOFF: Duration = Duration::from_secs(1);
const MAX_BACKOFF: Duration = Duration::from_secs(30);

/// A live runtime: the driver (exclusive access serialised through the
/// mutex) plus a shutdown signal. Held by the Manager's runtime table.
pub struct Runtime {
    pub driver: Arc<Mutex<Box<dyn Driver>>>,
    pub template: Arc<ProtocolTemplate>,
    pub state: Arc<Mutex<RuntimeState>>,
    stop_tx: mpsc::Sender<()>,
}

impl Runtime {
    /// Spawns the polling/event task and returns the handle the Manager
    /// keeps in its table. `vars` is the device's resolved template
    /// variables merged with its connection params, as the executor expects.
    pub fn spawn(
        device: Device,
        template: Arc<ProtocolTemplate>,
        driver: Box<dyn Driver>,
        vars: HashMap<String, Value>,
        bus: Arc<EventBus>,
    ) -> Self {
        let state = Arc::new(Mutex::new(RuntimeState::offline(
            device.id,
            &device.device_code,
            &device.name,
        )));
        let driver = Arc::new(Mutex::new(driver));
        let (stop_tx, stop_rx) = mpsc::channel(1);

        tokio::spawn(run_loop(
            device,
            template.clone(),
            driver.clone(),
            vars,
            bus,
            state.clone(),
            stop_rx,
        ));

        Runtime {
            driver,
            template,
            state,
            stop_tx,
        }
    }

    /// Signals the runtime task to stop. Idempotent: a closed/full channel
    /// means the task has already exited or is already stopping.
    pub async fn stop(&self) {
        let _ = self.stop_tx.send(()).await;
    }
}

async fn run_loop(
    device: Device,
    template: Arc<ProtocolTemplate>,
    driver: Arc<Mutex<Box<dyn Driver>>>,
    vars: HashMap<String, Value>,
    bus: Arc<EventBus>,
    state: Arc<Mutex<RuntimeState>>,
    mut stop_rx: mpsc::Receiver<()>,
) {
    let mut backoff = MIN_BACKOFF;
    let mut setup_done = false;
    let is_mqtt = template.protocol_type == ProtocolType::Mqtt;

    if is_mqtt {
        let bus = bus.clone();
        let state = state.clone();
        let template = template.clone();
        let vars_for_handler = vars.clone();
        let driver_for_handler = driver.clone();
        let mut guard = driver.lock().await;
        guard.register_message_handler(Arc::new(move |topic, payload| {
            let bus = bus.clone();
            let state = state.clone();
            let template = template.clone();
            let vars = vars_for_handler.clone();
            let driver = driver_for_handler.clone();
            tokio::spawn(async move {
                handle_message(&template, &driver, &topic, &payload, &vars, &state, &bus).await;
            });
        }));
        drop(guard);
    }

    loop {
        if stop_rx.try_recv().is_ok() {
            break;
        }

        let connected = driver.lock().await.is_connected().await;
        if !connected {
            let connect_result = driver.lock().await.connect().await;
            if let Err(err) = connect_result {
                let detail = driver
                    .lock()
                    .await
                    .last_error()
                    .map(|e| format!("connect failed: {e}"))
                    .unwrap_or_else(|| format!("connect failed: {err}"));
                let mut guard = state.lock().await;
                guard.mark_offline(Some(detail));
                bus.publish(guard.to_message());
                drop(guard);
                if sleep_or_stop(backoff, &mut stop_rx).await {
                    break;
                }
                backoff = (backoff * 2).min(MAX_BACKOFF);
                continue;
            }
        }
        backoff = MIN_BACKOFF;

        if !setup_done {
            let mut drv = driver.lock().await;
            match executor::run_setup_steps(&template, drv.as_mut(), &vars).await {
                Ok(results) => {
                    let mut guard = state.lock().await;
                    guard.step_results.extend(results);
                }
                Err(e) => {
                    let mut guard = state.lock().await;
                    guard.mark_error(e.to_string());
                    bus.publish(guard.to_message());
                }
            }
            setup_done = true;
        }

        if is_mqtt {
            if sleep_or_stop(
                Duration::from_secs_f64(device.effective_poll_interval().max(1.0)),
                &mut stop_rx,
            )
            .await
            {
                break;
            }
            continue;
        }

        let previous = state.lock().await.step_results.clone();
        let mut drv = driver.lock().await;
        match executor::run_poll_steps(&template, drv.as_mut(), &vars, &previous).await {
            Ok(steps) => {
                drop(drv);
                let out = executor::render_output(&template, &executor::build_context(&vars, &steps));
                let weight = out.get("weight").and_then(value_to_f64);
                let unit = out
                    .get("unit")
                    .and_then(|v| v.as_str())
                    .unwrap_or("kg")
                    .to_string();
                let mut guard = state.lock().await;
                guard.step_results = steps;
                guard.mark_online(weight, unit);
                bus.publish(guard.to_message());
            }
            Err(e) => {
                drop(drv);
                let mut guard = state.lock().await;
                guard.mark_error(e.to_string());
                bus.publish(guard.to_message());
                drop(guard);
                if sleep_or_stop(backoff, &mut stop_rx).await {
                    break;
                }
                backoff = (backoff * 2).min(MAX_BACKOFF);
            }
        }

        if sleep_or_stop(
            Duration::from_secs_f64(device.effective_poll_interval().max(0.1)),
            &mut stop_rx,
        )
        .await
        {
            break;
        }
    }

    let mut guard = state.lock().await;
    guard.mark_offline(Some("stopped".to_string()));
    bus.publish(guard.to_message());
    let _ = driver.lock().await.disconnect().await;
}

#[allow(clippy::too_many_arguments)]
async fn handle_message(
    template: &ProtocolTemplate,
    driver: &Arc<Mutex<Box<dyn Driver>>>,
    _topic: &str,
    payload: &[u8],
    vars: &HashMap<String, Value>,
    state: &Arc<Mutex<RuntimeState>>,
    bus: &Arc<EventBus>,
) {
    let previous = state.lock().await.step_results.clone();
    let mut drv = driver.lock().await;
    match executor::run_message_handler(template, drv.as_mut(), payload, vars, &previous).await {
        Ok((steps, out)) => {
            drop(drv);
            let weight = out.get("weight").and_then(value_to_f64);
            let unit = out
                .get("unit")
                .and_then(|v| v.as_str())
                .unwrap_or("kg")
                .to_string();
            let mut guard = state.lock().await;
            guard.step_results.extend(steps);
            guard.mark_online(weight, unit);
            bus.publish(guard.to_message());
        }
        Err(e) => {
            drop(drv);
            let mut guard = state.lock().await;
            guard.mark_error(e.to_string());
            bus.publish(guard.to_message());
        }
    }
}

fn value_to_f64(v: &Value) -> Option<f64> {
    v.as_f64().or_else(|| v.as_str().and_then(|s| s.parse().ok()))
}

/// Sleeps for `duration` but wakes early on a stop signal. Returns `true` if
/// the loop should break, so every backoff/poll-interval sleep in the
/// runtime doubles as a cancellation point.
async fn sleep_or_stop(duration: Duration, stop_rx: &mut mpsc::Receiver<()>) -> bool {
    tokio::select! {
        _ = tokio::time::sleep(duration) => false,
        _ = stop_rx.recv() => true,
    }
}
