//! Gateway configuration, loaded from a YAML file with environment overrides.
//!
//! Grounded on the teacher agent's `AgentConfig::load`/`load_from` pattern:
//! `serde_yaml` parse, `anyhow::Context` on I/O, `#[serde(default = "...")]`
//! helpers for every optional field.

use std::fs;
use std::path::PathBuf;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

const DEFAULT_CONFIG_PATH: &str = "/etc/weighgate/config.yaml";

/// Process configuration (§6). `DB_*` fields are accepted and round-tripped
/// even though no database is opened in this repo — reserved for the
/// out-of-scope persistence layer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    #[serde(default = "default_db_type")]
    pub db_type: String,
    #[serde(default = "default_db_name")]
    pub db_name: String,
    #[serde(default)]
    pub db_user: Option<String>,
    #[serde(default)]
    pub db_password: Option<String>,
    #[serde(default)]
    pub db_host: Option<String>,
    #[serde(default = "default_db_port")]
    pub db_port: u16,

    /// Pre-shared key required on every REST/WS request (§6).
    pub api_key: String,

    #[serde(default = "default_log_level")]
    pub log_level: String,
    #[serde(default)]
    pub json_logs: bool,

    #[serde(default = "default_backend_host")]
    pub backend_host: String,
    #[serde(default = "default_backend_port")]
    pub backend_port: u16,

    /// Dev aid: Modbus returns synthetic registers on connect failure
    /// instead of propagating the error. Must be disableable for production.
    #[serde(default)]
    pub simulate_on_connect_fail: bool,
}

fn default_db_type() -> String {
    "sqlite".to_string()
}
fn default_db_name() -> String {
    "weighgate".to_string()
}
fn default_db_port() -> u16 {
    5432
}
fn default_log_level() -> String {
    "info".to_string()
}
fn default_backend_host() -> String {
    "0.0.0.0".to_string()
}
fn default_backend_port() -> u16 {
    8000
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            db_type: default_db_type(),
            db_name: default_db_name(),
            db_user: None,
            db_password: None,
            db_host: None,
            db_port: default_db_port(),
            api_key: "changeme".to_string(),
            log_level: default_log_level(),
            json_logs: false,
            backend_host: default_backend_host(),
            backend_port: default_backend_port(),
            simulate_on_connect_fail: false,
        }
    }
}

impl GatewayConfig {
    pub fn load() -> Result<Self> {
        Self::load_from(DEFAULT_CONFIG_PATH)
    }

    /// Reads the YAML file if present (falling back to defaults when it
    /// doesn't exist), then lets every environment variable in §6 override
    /// the corresponding field.
    pub fn load_from(path: &str) -> Result<Self> {
        let path = PathBuf::from(path);
        let mut config = if path.exists() {
            let content = fs::read_to_string(&path)
                .with_context(|| format!("failed to read config file: {}", path.display()))?;
            serde_yaml::from_str(&content)
                .with_context(|| format!("failed to parse config file: {}", path.display()))?
        } else {
            GatewayConfig::default()
        };
        config.apply_env_overrides();
        Ok(config)
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(v) = std::env::var("DB_TYPE") {
            self.db_type = v;
        }
        if let Ok(v) = std::env::var("DB_NAME") {
            self.db_name = v;
        }
        if let Ok(v) = std::env::var("DB_USER") {
            self.db_user = Some(v);
        }
        if let Ok(v) = std::env::var("DB_PASSWORD") {
            self.db_password = Some(v);
        }
        if let Ok(v) = std::env::var("DB_HOST") {
            self.db_host = Some(v);
        }
        if let Ok(v) = std::env::var("DB_PORT").ok().and_then(|v| v.parse().ok()) {
            self.db_port = v;
        }
        if let Ok(v) = std::env::var("API_KEY") {
            self.api_key = v;
        }
        if let Ok(v) = std::env::var("LOG_LEVEL") {
            self.log_level = v;
        }
        if let Ok(v) = std::env::var("BACKEND_HOST") {
            self.backend_host = v;
        }
        if let Ok(v) = std::env::var("BACKEND_PORT").ok().and_then(|v| v.parse().ok()) {
            self.backend_port = v;
        }
        if let Ok(v) = std::env::var("SIMULATE_ON_CONNECT_FAIL") {
            self.simulate_on_connect_fail = matches!(v.to_lowercase().as_str(), "1" | "true" | "yes");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_usable_without_a_file() {
        let config = GatewayConfig::load_from("/nonexistent/weighgate.yaml").unwrap();
        assert_eq!(config.backend_port, 8000);
        assert_eq!(config.log_level, "info");
    }

    #[test]
    fn env_overrides_win_over_file_defaults() {
        std::env::set_var("BACKEND_PORT", "9100");
        std::env::set_var("SIMULATE_ON_CONNECT_FAIL", "true");
        let config = GatewayConfig::load_from("/nonexistent/weighgate.yaml").unwrap();
        assert_eq!(config.backend_port, 9100);
        assert!(config.simulate_on_connect_fail);
        std::env::remove_var("BACKEND_PORT");
        std::env::remove_var("SIMULATE_ON_CONNECT_FAIL");
    }
}
