//! Weighgate
//!
//! Protocol-mediation gateway bridging industrial weighing/sensor devices
//! (Modbus TCP/RTU, MQTT, serial, raw TCP) to an HTTP+WebSocket control
//! plane.

mod api;
mod config;
mod driver;
mod error;
mod event_bus;
mod executor;
mod manager;
mod model;
mod repository;
mod runtime;

use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::{error, info};

use crate::config::GatewayConfig;
use crate::event_bus::EventBus;
use crate::manager::DeviceManager;
use crate::repository::{DeviceRepository, TemplateRepository};

/// Shared state handed to every axum handler. Cheap to clone: everything is
/// behind an `Arc`.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<GatewayConfig>,
    pub manager: Arc<DeviceManager>,
    pub templates: Arc<TemplateRepository>,
    pub devices: Arc<DeviceRepository>,
}

#[cfg(test)]
impl AppState {
    /// Minimal fixture for handler/middleware unit tests: a real in-memory
    /// manager wired to fresh repositories, with only `api_key` customised.
    pub fn test_fixture(api_key: &str) -> Self {
        let mut config = GatewayConfig::default();
        config.api_key = api_key.to_string();
        let config = Arc::new(config);
        let templates = Arc::new(TemplateRepository::new());
        let devices = Arc::new(DeviceRepository::new());
        let bus = Arc::new(EventBus::new());
        let manager = Arc::new(DeviceManager::new(
            templates.clone(),
            devices.clone(),
            bus,
            config.simulate_on_connect_fail,
        ));
        Self {
            config,
            manager,
            templates,
            devices,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    init_logging();

    info!("======================================");
    info!("  Weighgate v{}", env!("CARGO_PKG_VERSION"));
    info!("======================================");

    let config = GatewayConfig::load().context("failed to load configuration")?;
    info!(backend_host = %config.backend_host, backend_port = config.backend_port, "configuration loaded");

    let templates = Arc::new(TemplateRepository::new());
    let devices = Arc::new(DeviceRepository::new());
    let bus = Arc::new(EventBus::new());
    let manager = Arc::new(DeviceManager::new(
        templates.clone(),
        devices.clone(),
        bus,
        config.simulate_on_connect_fail,
    ));

    manager.startup().await.context("device manager startup failed")?;

    let state = AppState {
        config: Arc::new(config.clone()),
        manager,
        templates,
        devices,
    };

    let app = api::router(state);
    let addr = format!("{}:{}", config.backend_host, config.backend_port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    info!(%addr, "listening");

    let mut shutdown = setup_shutdown_handler();
    let server = axum::serve(listener, app.into_make_service());

    tokio::select! {
        result = server => {
            if let Err(e) = result {
                error!("server error: {e}");
            }
        }
        _ = shutdown.changed() => {
            info!("shutdown signal received, stopping");
        }
    }

    info!("weighgate shutdown complete");
    Ok(())
}

fn init_logging() {
    use tracing_subscriber::{fmt, prelude::*, EnvFilter};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let json_logs = std::env::var("WEIGHGATE_JSON_LOGS")
        .map(|v| matches!(v.to_lowercase().as_str(), "1" | "true" | "yes"))
        .unwrap_or(false);

    if json_logs {
        tracing_subscriber::registry()
            .with(fmt::layer().json())
            .with(filter)
            .init();
    } else {
        tracing_subscriber::registry()
            .with(fmt::layer().with_target(true))
            .with(filter)
            .init();
    }
}

fn setup_shutdown_handler() -> tokio::sync::watch::Receiver<bool> {
    let (tx, rx) = tokio::sync::watch::channel(false);

    ctrlc::set_handler(move || {
        info!("ctrl-c received");
        let _ = tx.send(true);
    })
    .expect("error setting ctrl-c handler");

    rx
}
