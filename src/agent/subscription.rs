//! Blocking subscribe/unsubscribe handshake
//!
//! The request is dispatched with a completion that writes into the shared
//! acknowledgment slot, and the caller waits on that slot for a bounded time.
//! The router is only touched once the broker has acknowledged: it is the
//! record of which response topics are live. No retries happen here.

use crate::sync::CommandAcks;
use crate::transport::{CommandStatus, PublishHandler, RouterError, Transport};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, warn, Instrument};

#[derive(Debug, Error)]
pub enum SubscriptionError {
    #[error("Request was not accepted for dispatch: {0}")]
    Dispatch(String),
    #[error("No acknowledgment before the response timeout")]
    Timeout,
    #[error("Broker answered {0:?}")]
    Refused(CommandStatus),
    #[error("Router rejected the handler: {0}")]
    Router(#[from] RouterError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscriptionOp {
    Subscribe,
    Unsubscribe,
}

impl SubscriptionOp {
    fn as_str(&self) -> &'static str {
        match self {
            SubscriptionOp::Subscribe => "subscribe",
            SubscriptionOp::Unsubscribe => "unsubscribe",
        }
    }
}

/// Perform `op` on `topic` and wait up to `timeout` for the broker's answer
///
/// On success a subscribe registers `handler` with the transport's router and
/// an unsubscribe deregisters it.
pub async fn subscribe_or_unsubscribe<T>(
    transport: &T,
    acks: &Arc<CommandAcks>,
    topic: &str,
    handler: &Arc<dyn PublishHandler>,
    op: SubscriptionOp,
    timeout: Duration,
) -> Result<(), SubscriptionError>
where
    T: Transport + ?Sized,
{
    let span = crate::mqtt_span!(op = op.as_str(), topic = topic);

    let result = async move {
        let (seq, completion) = acks.completion();
        let dispatched = match op {
            SubscriptionOp::Subscribe => transport.subscribe(topic, completion).await,
            SubscriptionOp::Unsubscribe => transport.unsubscribe(topic, completion).await,
        };
        dispatched.map_err(|e| SubscriptionError::Dispatch(e.to_string()))?;

        match acks.wait(seq, timeout).await {
            Some(CommandStatus::Success) => {}
            Some(status) => return Err(SubscriptionError::Refused(status)),
            None => return Err(SubscriptionError::Timeout),
        }

        let router = transport.router();
        match op {
            SubscriptionOp::Subscribe => router.register(topic, Arc::clone(handler))?,
            SubscriptionOp::Unsubscribe => router.deregister(topic, handler)?,
        }

        debug!("Broker acknowledged {}", op.as_str());
        Ok::<(), SubscriptionError>(())
    }
    .instrument(span)
    .await;

    if let Err(e) = &result {
        warn!(topic, op = op.as_str(), error = %e, "Subscription handshake failed");
    }
    result
}
