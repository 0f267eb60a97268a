//! Agent configuration
//!
//! Loaded from a TOML file. Credentials never live in the file: the MQTT
//! section names environment variables that are read when connecting.

use crate::store::validate_thing_name;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

/// Smallest report buffer that can hold a header and empty metrics
pub const MIN_BUFFER_SIZE: usize = 64;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AgentConfig {
    #[serde(default)]
    pub device: DeviceSection,
    pub mqtt: MqttSection,
    #[serde(default)]
    pub report: ReportSection,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct DeviceSection {
    /// Thing name provisioned into the store at startup
    pub thing_name: Option<String>,
    /// JSON file backing the key/value store; in-memory when absent
    pub store_path: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MqttSection {
    /// Broker URL, `mqtt://` or `mqtts://`
    pub broker_url: String,
    /// Defaults to the thing name
    pub client_id: Option<String>,
    /// Environment variable containing username
    pub username_env: Option<String>,
    /// Environment variable containing password
    pub password_env: Option<String>,
    #[serde(default = "default_keep_alive")]
    pub keep_alive_secs: u64,
    /// Upper bound on queueing a command with the MQTT client
    #[serde(default = "default_command_timeout")]
    pub command_timeout_secs: u64,
}

fn default_keep_alive() -> u64 {
    60
}

fn default_command_timeout() -> u64 {
    10
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ReportSection {
    /// Delay between report cycles (default: 300 = 5 minutes)
    #[serde(default = "default_interval")]
    pub interval_secs: u64,
    /// Bound on every acknowledgment and response wait
    #[serde(default = "default_response_timeout")]
    pub response_timeout_secs: u64,
    #[serde(default = "default_buffer_size")]
    pub buffer_size: usize,
    /// Maximum number of topics the inbound router holds
    #[serde(default = "default_router_capacity")]
    pub router_capacity: usize,
}

impl Default for ReportSection {
    fn default() -> Self {
        Self {
            interval_secs: default_interval(),
            response_timeout_secs: default_response_timeout(),
            buffer_size: default_buffer_size(),
            router_capacity: default_router_capacity(),
        }
    }
}

fn default_interval() -> u64 {
    300
}

fn default_response_timeout() -> u64 {
    30
}

fn default_buffer_size() -> usize {
    1024
}

fn default_router_capacity() -> usize {
    8
}

/// Runtime timing handed to the agent loop
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AgentTiming {
    pub report_interval: Duration,
    pub response_timeout: Duration,
}

impl Default for AgentTiming {
    fn default() -> Self {
        Self {
            report_interval: Duration::from_secs(default_interval()),
            response_timeout: Duration::from_secs(default_response_timeout()),
        }
    }
}

/// Configuration loading errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    FileRead(#[from] std::io::Error),
    #[error("Failed to parse TOML: {0}")]
    TomlParse(#[from] toml::de::Error),
    #[error("Invalid thing name: {0}")]
    InvalidThingName(String),
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

impl AgentConfig {
    /// Load and validate configuration from a TOML file
    pub fn load_from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml(&content)
    }

    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        let config: AgentConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if let Some(name) = &self.device.thing_name {
            validate_thing_name(name).map_err(|e| ConfigError::InvalidThingName(e.to_string()))?;
        }

        let url = url::Url::parse(&self.mqtt.broker_url).map_err(|e| {
            ConfigError::InvalidConfig(format!("broker_url '{}': {e}", self.mqtt.broker_url))
        })?;
        if !matches!(url.scheme(), "mqtt" | "mqtts") {
            return Err(ConfigError::InvalidConfig(format!(
                "broker_url scheme must be mqtt or mqtts, got '{}'",
                url.scheme()
            )));
        }

        let non_zero = [
            ("mqtt.keep_alive_secs", self.mqtt.keep_alive_secs),
            ("mqtt.command_timeout_secs", self.mqtt.command_timeout_secs),
            ("report.interval_secs", self.report.interval_secs),
            ("report.response_timeout_secs", self.report.response_timeout_secs),
        ];
        for (field, value) in non_zero {
            if value == 0 {
                return Err(ConfigError::InvalidConfig(format!("{field} must be non-zero")));
            }
        }

        if self.report.buffer_size < MIN_BUFFER_SIZE {
            return Err(ConfigError::InvalidConfig(format!(
                "report.buffer_size must be at least {MIN_BUFFER_SIZE}"
            )));
        }
        // Accepted and rejected topics
        if self.report.router_capacity < 2 {
            return Err(ConfigError::InvalidConfig(
                "report.router_capacity must be at least 2".to_string(),
            ));
        }

        Ok(())
    }

    pub fn timing(&self) -> AgentTiming {
        AgentTiming {
            report_interval: Duration::from_secs(self.report.interval_secs),
            response_timeout: Duration::from_secs(self.report.response_timeout_secs),
        }
    }

    /// MQTT client id, falling back to the thing name
    pub fn client_id(&self, thing_name: &str) -> String {
        self.mqtt
            .client_id
            .clone()
            .unwrap_or_else(|| thing_name.to_string())
    }

    /// Create a test configuration for unit testing
    #[cfg(test)]
    pub fn test_config() -> Self {
        let toml_content = r#"
[device]
thing_name = "thing-42"

[mqtt]
broker_url = "mqtt://localhost:1883"
"#;
        toml::from_str(toml_content).expect("Test config should parse")
    }
}

impl MqttSection {
    /// Helper method to get environment variable with consistent error handling
    fn get_env_var_optional(env_var_name: Option<&String>) -> Option<String> {
        env_var_name.and_then(|name| std::env::var(name).ok())
    }

    pub fn username(&self) -> Option<String> {
        Self::get_env_var_optional(self.username_env.as_ref())
    }

    pub fn password(&self) -> Option<String> {
        Self::get_env_var_optional(self.password_env.as_ref())
    }
}
