//! Publish a report and correlate the service's answer
//!
//! Two waits happen in order: first for the broker's publish acknowledgment,
//! then for a message on the accepted or rejected topic. Both are bounded by
//! the same response timeout.

use crate::observability::logging::hex_dump;
use crate::observability::stats;
use crate::protocol::{ReportStatus, ResponseKind};
use crate::sync::{CommandAcks, ResponseCorrelation};
use crate::transport::{CommandStatus, PublishHandler, Transport};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// Router handler for one of the two response topics
pub struct ReportResponseHandler {
    kind: ResponseKind,
    correlation: Arc<ResponseCorrelation>,
}

impl ReportResponseHandler {
    pub fn new(kind: ResponseKind, correlation: Arc<ResponseCorrelation>) -> Self {
        Self { kind, correlation }
    }
}

impl PublishHandler for ReportResponseHandler {
    fn on_publish(&self, topic: &str, payload: &[u8]) {
        debug!(
            topic,
            kind = ?self.kind,
            bytes = payload.len(),
            payload = %hex_dump(payload),
            "Report response received"
        );
        self.correlation.resolve(self.kind, payload);
    }
}

/// Publish `payload` as report `report_id` and classify the outcome
///
/// The correlation gate is open for exactly the duration of this call.
pub async fn publish_and_await<T>(
    transport: &T,
    acks: &Arc<CommandAcks>,
    correlation: &ResponseCorrelation,
    topic: &str,
    report_id: u64,
    payload: Vec<u8>,
    timeout: Duration,
) -> ReportStatus
where
    T: Transport + ?Sized,
{
    correlation.begin(report_id);
    let status = publish_then_wait(transport, acks, correlation, topic, payload, timeout).await;
    correlation.finish();
    status
}

async fn publish_then_wait<T>(
    transport: &T,
    acks: &Arc<CommandAcks>,
    correlation: &ResponseCorrelation,
    topic: &str,
    payload: Vec<u8>,
    timeout: Duration,
) -> ReportStatus
where
    T: Transport + ?Sized,
{
    let (seq, completion) = acks.completion();
    if let Err(e) = transport.publish(topic, payload, completion).await {
        warn!(topic, error = %e, "Report publish was not dispatched");
        stats().publish_failed();
        return ReportStatus::NotReceived;
    }

    match acks.wait(seq, timeout).await {
        Some(CommandStatus::Success) => debug!("Report publish acknowledged"),
        Some(status) => {
            warn!(?status, "Report publish not acknowledged by broker");
            stats().publish_failed();
            return ReportStatus::NotReceived;
        }
        None => {
            warn!(
                timeout_ms = timeout.as_millis() as u64,
                "Timed out waiting for publish acknowledgment"
            );
            stats().publish_failed();
            return ReportStatus::NotReceived;
        }
    }

    correlation
        .wait_outcome(timeout)
        .await
        .unwrap_or(ReportStatus::NotReceived)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::mocks::{MockAck, MockResponse, MockTransport};
    use crate::transport::TopicRouter;

    const PUBLISH: &str = "$aws/things/thing-42/defender/metrics/cbor";
    const ACCEPTED: &str = "$aws/things/thing-42/defender/metrics/cbor/accepted";
    const REJECTED: &str = "$aws/things/thing-42/defender/metrics/cbor/rejected";

    struct Fixture {
        transport: MockTransport,
        acks: Arc<CommandAcks>,
        correlation: Arc<ResponseCorrelation>,
    }

    fn fixture() -> Fixture {
        let transport = MockTransport::new();
        let correlation = Arc::new(ResponseCorrelation::new("thing-42"));
        register(&transport.router(), &correlation);
        Fixture {
            transport,
            acks: Arc::new(CommandAcks::new()),
            correlation,
        }
    }

    fn register(router: &TopicRouter, correlation: &Arc<ResponseCorrelation>) {
        for (topic, kind) in [
            (ACCEPTED, ResponseKind::Accepted),
            (REJECTED, ResponseKind::Rejected),
        ] {
            router
                .register(
                    topic,
                    Arc::new(ReportResponseHandler::new(kind, Arc::clone(correlation))),
                )
                .unwrap();
        }
    }

    async fn run(f: &Fixture, report_id: u64, timeout: Duration) -> ReportStatus {
        publish_and_await(
            &f.transport,
            &f.acks,
            &f.correlation,
            PUBLISH,
            report_id,
            crate::testing::mocks::encoded_report(report_id),
            timeout,
        )
        .await
    }

    #[tokio::test]
    async fn test_accepted_response() {
        let f = fixture();
        f.transport.script_response(MockResponse::Accepted);

        assert_eq!(run(&f, 17, Duration::from_secs(1)).await, ReportStatus::Accepted);
        assert!(!f.correlation.is_waiting());
        assert_eq!(f.transport.published().len(), 1);
    }

    #[tokio::test]
    async fn test_rejected_response() {
        let f = fixture();
        f.transport.script_response(MockResponse::Rejected {
            code: "InvalidPayload".to_string(),
            message: "bad".to_string(),
        });

        assert_eq!(run(&f, 17, Duration::from_secs(1)).await, ReportStatus::Rejected);
    }

    #[tokio::test(start_paused = true)]
    async fn test_no_response_is_not_received() {
        let f = fixture();

        assert_eq!(run(&f, 5, Duration::from_secs(30)).await, ReportStatus::NotReceived);
        assert!(!f.correlation.is_waiting());
    }

    #[tokio::test(start_paused = true)]
    async fn test_missing_puback_skips_response_wait() {
        let f = fixture();
        f.transport.script_publish(MockAck::Silent);
        f.transport.script_response(MockResponse::Accepted);

        assert_eq!(run(&f, 5, Duration::from_secs(30)).await, ReportStatus::NotReceived);
        assert!(!f.correlation.is_waiting());
    }

    #[tokio::test]
    async fn test_invalid_accepted_payload_is_invalid() {
        let f = fixture();
        f.transport.script_response(MockResponse::Raw {
            kind: ResponseKind::Accepted,
            payload: br#"{"thingName":"thing-42","status":"ACCEPTED"}"#.to_vec(),
        });

        assert_eq!(run(&f, 5, Duration::from_secs(1)).await, ReportStatus::Invalid);
    }

    #[tokio::test(start_paused = true)]
    async fn test_answer_for_another_report_is_not_an_outcome() {
        let f = fixture();
        f.transport.script_response(MockResponse::AcceptedFor(4));

        assert_eq!(run(&f, 5, Duration::from_secs(30)).await, ReportStatus::NotReceived);
        assert!(!f.correlation.is_waiting());
    }

    #[tokio::test]
    async fn test_dispatch_failure_is_not_received() {
        let f = fixture();
        f.transport.script_publish(MockAck::DispatchError);

        assert_eq!(run(&f, 5, Duration::from_secs(1)).await, ReportStatus::NotReceived);
        assert!(!f.correlation.is_waiting());
    }
}
