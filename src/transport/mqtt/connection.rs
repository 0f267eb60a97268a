//! Pure connection state management for the MQTT client
//!
//! Connection state, reconnect backoff and broker option construction. No
//! I/O happens here.

use crate::config::MqttSection;
use rumqttc::v5::MqttOptions;
use rumqttc::Transport as RumqttcTransport;
use std::time::Duration;
use thiserror::Error;
use url::Url;

/// Connection state for MQTT client
#[derive(Debug, Clone, PartialEq)]
pub enum ConnectionState {
    /// Initial state, waiting for the first ConnAck
    Connecting,
    Connected,
    Disconnected(String),
    /// Backing off before reconnection attempt N
    Reconnecting(u32),
}

impl ConnectionState {
    /// Commands may only be enqueued while connected
    pub fn can_send(&self) -> bool {
        matches!(self, ConnectionState::Connected)
    }
}

/// Reconnection configuration
#[derive(Debug, Clone)]
pub struct ReconnectConfig {
    /// Backoff pattern in milliseconds, indexed by attempt
    pub backoff_pattern: Vec<u64>,
    /// Delay to use after the pattern is exhausted
    pub sustained_delay: u64,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            backoff_pattern: vec![250, 500, 1_000, 2_000, 5_000],
            sustained_delay: 10_000,
        }
    }
}

impl ReconnectConfig {
    /// Backoff delay before reconnection `attempt` (1-based)
    pub fn calculate_backoff_delay(&self, attempt: u32) -> u64 {
        let index = attempt.saturating_sub(1) as usize;
        self.backoff_pattern
            .get(index)
            .copied()
            .unwrap_or(self.sustained_delay)
    }
}

#[derive(Debug, Error)]
pub enum MqttError {
    #[error("Invalid broker URL: {0}")]
    InvalidBrokerUrl(String),
    #[error("Not connected - current state: {state:?}")]
    NotConnected { state: ConnectionState },
    #[error("Request could not be queued")]
    RequestFailed(#[source] rumqttc::v5::ClientError),
    #[error("Request queue stayed full for {0:?}")]
    RequestTimeout(Duration),
    #[error("Event loop already started")]
    AlreadyStarted,
}

/// Build broker options for `client_id` from the MQTT section
pub fn configure_mqtt_options(
    client_id: &str,
    config: &MqttSection,
) -> Result<MqttOptions, MqttError> {
    let url = Url::parse(&config.broker_url)
        .map_err(|_| MqttError::InvalidBrokerUrl(config.broker_url.clone()))?;

    let tls = match url.scheme() {
        "mqtt" => false,
        "mqtts" => true,
        _ => return Err(MqttError::InvalidBrokerUrl(config.broker_url.clone())),
    };
    let host = url
        .host_str()
        .ok_or_else(|| MqttError::InvalidBrokerUrl(config.broker_url.clone()))?;
    let port = url.port().unwrap_or(if tls { 8883 } else { 1883 });

    let mut mqtt_options = MqttOptions::new(client_id, host, port);

    if tls {
        mqtt_options.set_transport(RumqttcTransport::tls_with_default_config());
    }

    if let Some(username) = config.username() {
        let password = config.password().unwrap_or_default();
        mqtt_options.set_credentials(username, password);
    }

    mqtt_options.set_keep_alive(Duration::from_secs(config.keep_alive_secs));
    mqtt_options.set_clean_start(true);

    Ok(mqtt_options)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_mqtt_config() -> MqttSection {
        MqttSection {
            broker_url: "mqtt://localhost:1883".to_string(),
            client_id: None,
            username_env: None,
            password_env: None,
            keep_alive_secs: 60,
            command_timeout_secs: 10,
        }
    }

    #[test]
    fn test_backoff_pattern_then_sustained() {
        let config = ReconnectConfig::default();
        assert_eq!(config.calculate_backoff_delay(1), 250);
        assert_eq!(config.calculate_backoff_delay(5), 5_000);
        assert_eq!(config.calculate_backoff_delay(6), 10_000);
        assert_eq!(config.calculate_backoff_delay(100), 10_000);
    }

    #[test]
    fn test_empty_pattern_uses_sustained_delay() {
        let config = ReconnectConfig {
            backoff_pattern: vec![],
            sustained_delay: 42,
        };
        assert_eq!(config.calculate_backoff_delay(1), 42);
    }

    #[test]
    fn test_configure_mqtt_options() {
        let options = configure_mqtt_options("thing-42", &test_mqtt_config()).unwrap();
        assert_eq!(options.client_id(), "thing-42");
        assert_eq!(options.broker_address(), ("localhost".to_string(), 1883));
        assert_eq!(options.keep_alive(), Duration::from_secs(60));
    }

    #[test]
    fn test_mqtts_default_port() {
        let mut config = test_mqtt_config();
        config.broker_url = "mqtts://example.iot.us-east-1.amazonaws.com".to_string();
        let options = configure_mqtt_options("thing-42", &config).unwrap();
        assert_eq!(options.broker_address().1, 8883);
    }

    #[test]
    fn test_invalid_broker_url() {
        let mut config = test_mqtt_config();
        config.broker_url = "invalid-url".to_string();
        assert!(matches!(
            configure_mqtt_options("thing-42", &config),
            Err(MqttError::InvalidBrokerUrl(_))
        ));

        config.broker_url = "http://localhost:1883".to_string();
        assert!(matches!(
            configure_mqtt_options("thing-42", &config),
            Err(MqttError::InvalidBrokerUrl(_))
        ));
    }

    #[test]
    fn test_only_connected_can_send() {
        assert!(ConnectionState::Connected.can_send());
        assert!(!ConnectionState::Connecting.can_send());
        assert!(!ConnectionState::Reconnecting(2).can_send());
        assert!(!ConnectionState::Disconnected("gone".into()).can_send());
    }
}
