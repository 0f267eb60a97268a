//! State owned by the agent task for its whole lifetime

use super::correlator::ReportResponseHandler;
use crate::protocol::{DefenderTopics, ResponseKind, TopicError};
use crate::sync::{CommandAcks, ResponseCorrelation};
use crate::transport::PublishHandler;
use std::sync::Arc;
use tracing::debug;

/// Response topics the agent subscribes to, in subscription order
pub const RESPONSE_KINDS: [ResponseKind; 2] = [ResponseKind::Accepted, ResponseKind::Rejected];

pub struct AgentContext {
    thing_name: String,
    topics: Option<DefenderTopics>,
    correlation: Arc<ResponseCorrelation>,
    acks: Arc<CommandAcks>,
    accepted_handler: Arc<dyn PublishHandler>,
    rejected_handler: Arc<dyn PublishHandler>,
    subscribed: Vec<ResponseKind>,
}

impl AgentContext {
    pub fn new<S: Into<String>>(thing_name: S) -> Self {
        let thing_name = thing_name.into();
        let correlation = Arc::new(ResponseCorrelation::new(thing_name.clone()));

        let accepted_handler: Arc<dyn PublishHandler> = Arc::new(ReportResponseHandler::new(
            ResponseKind::Accepted,
            Arc::clone(&correlation),
        ));
        let rejected_handler: Arc<dyn PublishHandler> = Arc::new(ReportResponseHandler::new(
            ResponseKind::Rejected,
            Arc::clone(&correlation),
        ));

        Self {
            thing_name,
            topics: None,
            correlation,
            acks: Arc::new(CommandAcks::new()),
            accepted_handler,
            rejected_handler,
            subscribed: Vec::new(),
        }
    }

    pub fn thing_name(&self) -> &str {
        &self.thing_name
    }

    /// Build the three topics from the thing name
    ///
    /// Fails without touching the context if they already exist.
    pub fn build_topics(&mut self) -> Result<&DefenderTopics, TopicError> {
        if self.topics.is_some() {
            return Err(TopicError::AlreadyBuilt);
        }
        let topics = DefenderTopics::build(&self.thing_name)?;
        Ok(self.topics.insert(topics))
    }

    pub fn topics(&self) -> Option<&DefenderTopics> {
        self.topics.as_ref()
    }

    pub fn correlation(&self) -> &Arc<ResponseCorrelation> {
        &self.correlation
    }

    pub fn acks(&self) -> &Arc<CommandAcks> {
        &self.acks
    }

    pub fn handler(&self, kind: ResponseKind) -> &Arc<dyn PublishHandler> {
        match kind {
            ResponseKind::Accepted => &self.accepted_handler,
            ResponseKind::Rejected => &self.rejected_handler,
        }
    }

    pub fn mark_subscribed(&mut self, kind: ResponseKind) {
        if !self.subscribed.contains(&kind) {
            self.subscribed.push(kind);
        }
    }

    pub fn is_subscribed(&self, kind: ResponseKind) -> bool {
        self.subscribed.contains(&kind)
    }

    /// Hand over the active subscriptions for teardown; empty on later calls
    pub fn take_subscriptions(&mut self) -> Vec<ResponseKind> {
        std::mem::take(&mut self.subscribed)
    }

    /// Drop the topics; returns false if they were already released
    pub fn release_topics(&mut self) -> bool {
        let released = self.topics.take().is_some();
        if released {
            debug!(thing_name = %self.thing_name, "Released topics");
        }
        released
    }
}

impl std::fmt::Debug for AgentContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AgentContext")
            .field("thing_name", &self.thing_name)
            .field("topics", &self.topics)
            .field("subscribed", &self.subscribed)
            .field("waiting", &self.correlation.is_waiting())
            .finish()
    }
}
