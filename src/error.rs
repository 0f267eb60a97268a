//! Crate-level error taxonomy
//!
//! Each layer has its own error enum; [`AgentError`] wraps the ones agent
//! startup can hit, for callers that only need to know that setup failed and
//! why. Per-cycle failures are logged by the agent loop and never reach this
//! type.

use crate::agent::subscription::SubscriptionError;
use crate::protocol::TopicError;
use crate::store::StoreError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum AgentError {
    #[error("Startup failed: {reason}")]
    Startup { reason: String },

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Topic error: {0}")]
    Topic(#[from] TopicError),

    #[error("Subscription failed for {topic}: {source}")]
    Subscription {
        topic: String,
        #[source]
        source: SubscriptionError,
    },
}

impl AgentError {
    pub fn startup<S: Into<String>>(reason: S) -> Self {
        Self::Startup {
            reason: reason.into(),
        }
    }

    pub fn subscription<S: Into<String>>(topic: S, source: SubscriptionError) -> Self {
        Self::Subscription {
            topic: topic.into(),
            source,
        }
    }
}

pub type AgentResult<T> = Result<T, AgentError>;
