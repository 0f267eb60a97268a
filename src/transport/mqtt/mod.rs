//! MQTT v5 transport built on rumqttc
//!
//! Pure functions are kept apart from I/O:
//!
//! - [`connection`] - connection state, backoff and broker options
//! - [`message_handler`] - event routing and acknowledgment bookkeeping
//! - [`client`] - the client handle and the event loop supervisor
//!
//! # Usage
//!
//! ```rust,no_run
//! use defender_agent::config::MqttSection;
//! use defender_agent::transport::mqtt::MqttClient;
//! use defender_agent::transport::TopicRouter;
//! use std::sync::Arc;
//!
//! # tokio_test::block_on(async {
//! let config = MqttSection {
//!     broker_url: "mqtts://example-ats.iot.us-east-1.amazonaws.com".to_string(),
//!     client_id: None,
//!     username_env: None,
//!     password_env: None,
//!     keep_alive_secs: 60,
//!     command_timeout_secs: 10,
//! };
//!
//! let mut client = MqttClient::new("thing-42", &config, Arc::new(TopicRouter::new(8)))?;
//! client.start()?;
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! # });
//! ```

pub mod client;
pub mod connection;
pub mod message_handler;

pub use client::MqttClient;
pub use connection::{ConnectionState, MqttError, ReconnectConfig};
pub use message_handler::{CommandKind, EventRoute, MessageHandler, PendingCommands};
