//! Transport layer for report publishing
//!
//! The agent talks to the broker only through the [`Transport`] trait. Every
//! command is accepted for dispatch first and completed later: the
//! [`CompletionCallback`] runs on the transport's own task once the broker
//! acknowledges (or the command is lost).

use std::sync::Arc;
use tokio::sync::watch;

pub mod mqtt;
pub mod router;

pub use router::{PublishHandler, RouterError, TopicRouter};

/// Final status of a dispatched command
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandStatus {
    /// Broker acknowledged with a success code
    Success,
    /// Broker acknowledged with a failure code
    Refused,
    /// Connection lost before an acknowledgment arrived
    Dropped,
}

/// Invoked exactly once with the command's final status
pub type CompletionCallback = Box<dyn FnOnce(CommandStatus) + Send + 'static>;

/// Publish/subscribe transport with at-least-once delivery
#[async_trait::async_trait]
pub trait Transport: Send + Sync {
    type Error: std::error::Error + Send + Sync + 'static;

    /// Block until the broker connection is up
    ///
    /// Returns `false` if `shutdown` fires first.
    async fn wait_for_connection(&self, shutdown: watch::Receiver<bool>) -> bool;

    async fn subscribe(&self, topic: &str, completion: CompletionCallback)
        -> Result<(), Self::Error>;

    async fn unsubscribe(
        &self,
        topic: &str,
        completion: CompletionCallback,
    ) -> Result<(), Self::Error>;

    async fn publish(
        &self,
        topic: &str,
        payload: Vec<u8>,
        completion: CompletionCallback,
    ) -> Result<(), Self::Error>;

    /// Router that inbound publishes are dispatched through
    fn router(&self) -> Arc<TopicRouter>;

    fn is_connected(&self) -> bool;
}

/// Type alias for the production transport
pub type MqttTransport = mqtt::MqttClient;
