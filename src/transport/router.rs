//! Exact-match topic router for inbound publishes

use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};
use thiserror::Error;
use tracing::{debug, trace};

/// Receiver of messages published on a registered topic
///
/// Runs on the transport's dispatch task and must not block.
pub trait PublishHandler: Send + Sync {
    fn on_publish(&self, topic: &str, payload: &[u8]);
}

#[derive(Debug, Error, PartialEq)]
pub enum RouterError {
    #[error("Topic cannot be empty")]
    EmptyTopic,
    #[error("Topic already registered: {0}")]
    DuplicateTopic(String),
    #[error("Router is full ({capacity} topics)")]
    Full { capacity: usize },
    #[error("Handler not registered for topic: {0}")]
    NotRegistered(String),
}

struct Route {
    topic: String,
    handler: Arc<dyn PublishHandler>,
}

pub struct TopicRouter {
    capacity: usize,
    routes: RwLock<Vec<Route>>,
}

impl std::fmt::Debug for TopicRouter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TopicRouter")
            .field("capacity", &self.capacity)
            .field("topics", &self.topics())
            .finish()
    }
}

impl TopicRouter {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            routes: RwLock::new(Vec::with_capacity(capacity)),
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, Vec<Route>> {
        self.routes
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, Vec<Route>> {
        self.routes
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn register(
        &self,
        topic: &str,
        handler: Arc<dyn PublishHandler>,
    ) -> Result<(), RouterError> {
        if topic.is_empty() {
            return Err(RouterError::EmptyTopic);
        }

        let mut routes = self.write();
        if routes.iter().any(|r| r.topic == topic) {
            return Err(RouterError::DuplicateTopic(topic.to_string()));
        }
        if routes.len() >= self.capacity {
            return Err(RouterError::Full {
                capacity: self.capacity,
            });
        }

        routes.push(Route {
            topic: topic.to_string(),
            handler,
        });
        debug!(topic, "Registered publish handler");
        Ok(())
    }

    /// Remove the route for `topic` if it is bound to this exact handler
    pub fn deregister(
        &self,
        topic: &str,
        handler: &Arc<dyn PublishHandler>,
    ) -> Result<(), RouterError> {
        let mut routes = self.write();
        let position = routes
            .iter()
            .position(|r| r.topic == topic && Arc::ptr_eq(&r.handler, handler))
            .ok_or_else(|| RouterError::NotRegistered(topic.to_string()))?;

        routes.remove(position);
        debug!(topic, "Deregistered publish handler");
        Ok(())
    }

    /// Deliver a message to the handler registered for `topic`
    ///
    /// Returns `false` when no route matches.
    pub fn dispatch(&self, topic: &str, payload: &[u8]) -> bool {
        // Release the lock before calling out so handlers may touch the router
        let handler = self
            .read()
            .iter()
            .find(|r| r.topic == topic)
            .map(|r| Arc::clone(&r.handler));

        match handler {
            Some(handler) => {
                handler.on_publish(topic, payload);
                true
            }
            None => {
                trace!(topic, "No route for inbound publish");
                false
            }
        }
    }

    pub fn is_registered(&self, topic: &str) -> bool {
        self.read().iter().any(|r| r.topic == topic)
    }

    pub fn topics(&self) -> Vec<String> {
        self.read().iter().map(|r| r.topic.clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }
}
