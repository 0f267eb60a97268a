//! Agent state machine
//!
//! ```text
//! Init -> Subscribing -> Running -> ShuttingDown -> Terminated
//!   \_________\______________________/
//!        setup failure or shutdown
//! ```
//!
//! Setup failures end the agent; per-cycle failures are logged and the next
//! cycle runs on schedule.

use super::context::{AgentContext, RESPONSE_KINDS};
use super::correlator::publish_and_await;
use super::report_id::ReportIdSource;
use super::subscription::{subscribe_or_unsubscribe, SubscriptionOp};
use crate::collectors::MetricsCollector;
use crate::config::{AgentTiming, MIN_BUFFER_SIZE};
use crate::error::{AgentError, AgentResult};
use crate::observability::logging::hex_dump;
use crate::observability::stats;
use crate::protocol::{build_report, ReportStatus};
use crate::store::{KvKey, KvStore};
use crate::sync::interruptible_sleep;
use crate::transport::Transport;
use std::fmt;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{debug, error, info, warn, Instrument};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AgentState {
    Init,
    Subscribing,
    Running,
    ShuttingDown,
    Terminated,
}

impl AgentState {
    pub fn as_str(&self) -> &'static str {
        match self {
            AgentState::Init => "init",
            AgentState::Subscribing => "subscribing",
            AgentState::Running => "running",
            AgentState::ShuttingDown => "shutting_down",
            AgentState::Terminated => "terminated",
        }
    }
}

impl fmt::Display for AgentState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How a run ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AgentOutcome {
    pub final_state: AgentState,
    /// Setup failed before the report loop was entered
    pub startup_failed: bool,
    /// Report cycles started
    pub cycles: u64,
}

/// Periodic report agent over any [`Transport`]
pub struct DefenderAgent<T>
where
    T: Transport + 'static,
{
    transport: Arc<T>,
    store: Arc<KvStore>,
    collector: Arc<dyn MetricsCollector>,
    report_ids: Arc<dyn ReportIdSource>,
    timing: AgentTiming,
    buffer_size: usize,
    state: AgentState,
}

impl<T> DefenderAgent<T>
where
    T: Transport + 'static,
{
    pub fn new(
        transport: Arc<T>,
        store: Arc<KvStore>,
        collector: Arc<dyn MetricsCollector>,
        report_ids: Arc<dyn ReportIdSource>,
    ) -> Self {
        Self {
            transport,
            store,
            collector,
            report_ids,
            timing: AgentTiming::default(),
            buffer_size: 1024,
            state: AgentState::Init,
        }
    }

    pub fn with_timing(mut self, timing: AgentTiming) -> Self {
        self.timing = timing;
        self
    }

    pub fn with_buffer_size(mut self, buffer_size: usize) -> Self {
        self.buffer_size = buffer_size.max(MIN_BUFFER_SIZE);
        self
    }

    pub fn state(&self) -> AgentState {
        self.state
    }

    fn transition(&mut self, next: AgentState) {
        if self.state != next {
            info!(from = %self.state, to = %next, "Agent state transition");
        }
        self.state = next;
        stats().set_agent_state(next.as_str());
    }

    /// Run until shutdown is requested or setup fails
    ///
    /// `shutdown` is checked once per cycle and interrupts the sleep between
    /// cycles; an in-flight wait always runs to its timeout.
    pub async fn run(&mut self, mut shutdown: watch::Receiver<bool>) -> AgentOutcome {
        self.transition(AgentState::Init);

        let mut startup_failed = false;
        let mut cycles = 0;
        let mut context = None;

        match self.fetch_identity() {
            Ok(thing_name) => {
                let span = crate::lifecycle_span!(thing_name = %thing_name);
                let mut ctx = AgentContext::new(thing_name);

                match self.startup(&mut ctx, &shutdown).instrument(span).await {
                    Ok(true) => {
                        self.transition(AgentState::Running);
                        cycles = self.report_loop(&ctx, &mut shutdown).await;
                    }
                    Ok(false) => info!("Shutdown requested before the broker connected"),
                    Err(e) => {
                        error!(error = %e, "Agent startup failed");
                        startup_failed = true;
                    }
                }
                context = Some(ctx);
            }
            Err(e) => {
                error!(error = %e, "Agent startup failed");
                startup_failed = true;
            }
        }

        self.transition(AgentState::ShuttingDown);
        if let Some(ctx) = context.as_mut() {
            self.teardown(ctx).await;
        }
        self.transition(AgentState::Terminated);

        let snapshot = stats().snapshot();
        info!(
            cycles,
            startup_failed,
            stats = %serde_json::to_string(&snapshot).unwrap_or_default(),
            "Agent terminated"
        );

        AgentOutcome {
            final_state: self.state,
            startup_failed,
            cycles,
        }
    }

    fn fetch_identity(&self) -> AgentResult<String> {
        self.store
            .get_string(KvKey::ThingName)?
            .ok_or_else(|| AgentError::startup("thing name is not provisioned"))
    }

    /// Build topics, wait for the broker and subscribe to both response topics
    ///
    /// Returns `Ok(false)` if shutdown was requested while waiting to connect.
    async fn startup(
        &mut self,
        ctx: &mut AgentContext,
        shutdown: &watch::Receiver<bool>,
    ) -> AgentResult<bool> {
        let publish_topic = ctx.build_topics()?.publish().to_string();
        info!(topic = %publish_topic, "Report topics built");

        info!("Waiting for broker connection");
        if !self.transport.wait_for_connection(shutdown.clone()).await {
            return Ok(false);
        }

        self.transition(AgentState::Subscribing);
        for kind in RESPONSE_KINDS {
            let topic = ctx
                .topics()
                .map(|t| t.response(kind).to_string())
                .ok_or_else(|| AgentError::startup("topics released during startup"))?;

            subscribe_or_unsubscribe(
                self.transport.as_ref(),
                ctx.acks(),
                &topic,
                ctx.handler(kind),
                SubscriptionOp::Subscribe,
                self.timing.response_timeout,
            )
            .await
            .map_err(|e| AgentError::subscription(topic.clone(), e))?;

            ctx.mark_subscribed(kind);
            info!(topic = %topic, "Subscribed to report responses");
        }

        Ok(true)
    }

    async fn report_loop(&self, ctx: &AgentContext, shutdown: &mut watch::Receiver<bool>) -> u64 {
        let mut cycles = 0;
        loop {
            if *shutdown.borrow() {
                break;
            }

            cycles += 1;
            self.run_cycle(ctx).await;

            if !interruptible_sleep(shutdown, self.timing.report_interval).await {
                break;
            }
        }
        cycles
    }

    /// One build, publish and wait; `None` if no report was published
    async fn run_cycle(&self, ctx: &AgentContext) -> Option<ReportStatus> {
        let report_id = match self.report_ids.next_id() {
            Ok(id) => id,
            Err(e) => {
                error!(error = %e, "Could not allocate a report id, skipping cycle");
                stats().build_failed();
                return None;
            }
        };

        let span = crate::cycle_span!(report_id);
        async move {
            stats().cycle_started(report_id);

            let Some(topic) = ctx.topics().map(|t| t.publish()) else {
                error!("Report topics are not built");
                return None;
            };

            let mut buf = vec![0u8; self.buffer_size];
            let len = match build_report(&mut buf, report_id, self.collector.as_ref()) {
                Ok(len) => len,
                Err(e) => {
                    error!(error = %e, "Report build failed, skipping cycle");
                    stats().build_failed();
                    return None;
                }
            };
            buf.truncate(len);
            debug!(bytes = len, payload = %hex_dump(&buf), "Report built");

            let status = publish_and_await(
                self.transport.as_ref(),
                ctx.acks(),
                ctx.correlation(),
                topic,
                report_id,
                buf,
                self.timing.response_timeout,
            )
            .await;

            stats().record_outcome(status);
            match status {
                ReportStatus::Accepted => info!("Report accepted"),
                ReportStatus::Rejected => warn!("Report rejected"),
                ReportStatus::Invalid => warn!("Report response failed validation"),
                ReportStatus::NotReceived => warn!("No response to report"),
            }
            Some(status)
        }
        .instrument(span)
        .await
    }

    /// Unsubscribe best-effort and release the topics; safe to repeat
    async fn teardown(&self, ctx: &mut AgentContext) {
        let subscriptions = ctx.take_subscriptions();

        if let Some(topics) = ctx.topics() {
            for kind in subscriptions {
                let topic = topics.response(kind);
                let handler = ctx.handler(kind);

                if let Err(e) = subscribe_or_unsubscribe(
                    self.transport.as_ref(),
                    ctx.acks(),
                    topic,
                    handler,
                    SubscriptionOp::Unsubscribe,
                    self.timing.response_timeout,
                )
                .await
                {
                    warn!(topic, error = %e, "Unsubscribe failed during teardown");
                    // Stop routing to the handler even though the broker may still deliver
                    if let Err(e) = self.transport.router().deregister(topic, handler) {
                        debug!(topic, error = %e, "Handler was not registered");
                    }
                }
            }
        }

        ctx.release_topics();
    }
}
