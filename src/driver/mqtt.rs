//! MQTT driver: one `rumqttc::AsyncClient` per device, with its event-loop
//! poll spawned as a cooperative task that forwards inbound publishes to the
//! registered message handler.
//!
//! Grounded on `backend/drivers/mqtt_driver.py` for the action surface
//! (`mqtt.subscribe`/`mqtt.publish`/`mqtt.on_message`) and on the teacher's
//! `mqtt.rs::handle_events` for the rumqttc event-loop plumbing.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use rumqttc::{AsyncClient, Event, MqttOptions, Packet, QoS};
use serde_json::{json, Value};
use uuid::Uuid;

use super::{param_str, param_u64, Driver, MessageHandler};
use crate::error::GatewayError;

fn qos_from(level: u64) -> QoS {
    match level {
        1 => QoS::AtLeastOnce,
        2 => QoS::ExactlyOnce,
        _ => QoS::AtMostOnce,
    }
}

pub struct MqttDriver {
    params: HashMap<String, Value>,
    client: Option<AsyncClient>,
    connected: bool,
    handler: Option<MessageHandler>,
    event_task: Option<tokio::task::JoinHandle<()>>,
}

impl MqttDriver {
    pub fn new(params: HashMap<String, Value>) -> Self {
        Self {
            params,
            client: None,
            connected: false,
            handler: None,
            event_task: None,
        }
    }
}

#[async_trait]
impl Driver for MqttDriver {
    async fn connect(&mut self) -> Result<(), GatewayError> {
        let host = param_str(&self.params, "host").unwrap_or_else(|| "127.0.0.1".to_string());
        let port = param_u64(&self.params, "port", 1883) as u16;
        let client_id = format!("weighgate-{}", Uuid::new_v4().simple());

        let mut options = MqttOptions::new(client_id, host, port);
        options.set_keep_alive(Duration::from_secs(30));
        if let Some(username) = param_str(&self.params, "username") {
            let password = param_str(&self.params, "password").unwrap_or_default();
            options.set_credentials(username, password);
        }

        let (client, mut eventloop) = AsyncClient::new(options, 100);
        let handler = self.handler.clone();
        self.event_task = Some(tokio::spawn(async move {
            loop {
                match eventloop.poll().await {
                    Ok(Event::Incoming(Packet::Publish(publish))) => {
                        if let Some(handler) = handler.clone() {
                            let topic = publish.topic.clone();
                            let payload = publish.payload.to_vec();
                            tokio::task::spawn_blocking(move || handler(topic, payload));
                        }
                    }
                    Ok(_) => {}
                    Err(e) => {
                        tracing::warn!(error = %e, "mqtt event loop ended");
                        break;
                    }
                }
            }
        }));

        self.client = Some(client);
        self.connected = true;
        Ok(())
    }

    async fn disconnect(&mut self) -> Result<(), GatewayError> {
        if let Some(client) = self.client.take() {
            let _ = client.disconnect().await;
        }
        if let Some(task) = self.event_task.take() {
            task.abort();
        }
        self.connected = false;
        Ok(())
    }

    async fn is_connected(&self) -> bool {
        self.connected
    }

    fn register_message_handler(&mut self, handler: MessageHandler) {
        self.handler = Some(handler);
    }

    async fn execute_action(
        &mut self,
        action: &str,
        params: &HashMap<String, Value>,
    ) -> Result<Value, GatewayError> {
        match action {
            "mqtt.subscribe" => {
                let topic = param_str(params, "topic").unwrap_or_default();
                let qos = qos_from(param_u64(params, "qos", 0));
                if let Some(client) = &self.client {
                    client
                        .subscribe(&topic, qos)
                        .await
                        .map_err(|e| GatewayError::ActionError(e.to_string()))?;
                }
                Ok(json!({"topic": topic, "qos": param_u64(params, "qos", 0)}))
            }
            "mqtt.publish" => {
                let topic = param_str(params, "topic").unwrap_or_default();
                let payload = param_str(params, "payload").unwrap_or_default();
                let qos = qos_from(param_u64(params, "qos", 0));
                if let Some(client) = &self.client {
                    client
                        .publish(&topic, qos, false, payload)
                        .await
                        .map_err(|e| GatewayError::ActionError(e.to_string()))?;
                }
                Ok(json!({"topic": topic, "published": true}))
            }
            "mqtt.on_message" => Ok(json!({"ok": true})),
            other => Err(GatewayError::Unsupported(format!(
                "unsupported action for MqttDriver: {other}"
            ))),
        }
    }
}
