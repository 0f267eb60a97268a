//! End-to-end agent behavior against the scripted transport
//!
//! Time is paused in every test, so the five minute interval and thirty
//! second timeouts elapse instantly once the runtime is idle.


use defender_agent::agent::{
    publish_and_await, subscribe_or_unsubscribe, AgentContext, AgentOutcome, AgentState,
    DefenderAgent, SubscriptionOp,
};
use defender_agent::protocol::{ReportStatus, ResponseKind};
use defender_agent::store::KvStore;
use defender_agent::testing::{
    encoded_report, report_id_of, FailingCollector, MockAck, MockCall, MockResponse,
    MockTransport, StaticCollector,
};
use defender_agent::transport::{CommandStatus, Transport};
use std::sync::Arc;
use std::time::Duration;
use test_helpers::*;
use tokio::sync::watch;

/// Run `agent` and request shutdown after `secs` of (paused) time
async fn run_for(agent: &mut DefenderAgent<MockTransport>, secs: u64) -> AgentOutcome {
    let (tx, rx) = watch::channel(false);
    let stopper = tokio::spawn(async move {
        tokio::time::sleep(Duration::from_secs(secs)).await;
        let _ = tx.send(true);
    });

    let outcome = agent.run(rx).await;
    stopper.abort();
    outcome
}

/// Context subscribed to both response topics of the mock
async fn subscribed_context(transport: &MockTransport) -> AgentContext {
    let mut ctx = AgentContext::new(THING);
    ctx.build_topics().unwrap();

    for (kind, topic) in [
        (ResponseKind::Accepted, ACCEPTED_TOPIC),
        (ResponseKind::Rejected, REJECTED_TOPIC),
    ] {
        subscribe_or_unsubscribe(
            transport,
            ctx.acks(),
            topic,
            ctx.handler(kind),
            SubscriptionOp::Subscribe,
            Duration::from_secs(30),
        )
        .await
        .unwrap();
        ctx.mark_subscribed(kind);
    }
    ctx
}

async fn publish(transport: &MockTransport, ctx: &AgentContext, report_id: u64) -> ReportStatus {
    publish_and_await(
        transport,
        ctx.acks(),
        ctx.correlation(),
        PUBLISH_TOPIC,
        report_id,
        encoded_report(report_id),
        Duration::from_secs(30),
    )
    .await
}

#[tokio::test(start_paused = true)]
async fn test_accepted_cycle_then_shutdown_during_sleep() {
    let transport = Arc::new(MockTransport::new().with_default_response(MockResponse::Accepted));
    let (mut agent, ids) = build_agent(
        &transport,
        provisioned_store(),
        Arc::new(StaticCollector::sample()),
    );

    let outcome = run_for(&mut agent, 60).await;

    assert_eq!(
        outcome,
        AgentOutcome {
            final_state: AgentState::Terminated,
            startup_failed: false,
            cycles: 1,
        }
    );

    let published = transport.published();
    assert_eq!(published.len(), 1);
    assert_eq!(published[0].0, PUBLISH_TOPIC);
    assert_eq!(report_id_of(&published[0].1), Some(1000));
    assert_eq!(ids.issued(), vec![1000]);

    assert_eq!(transport.subscriptions(), vec![ACCEPTED_TOPIC, REJECTED_TOPIC]);
    assert_eq!(transport.unsubscriptions(), vec![ACCEPTED_TOPIC, REJECTED_TOPIC]);
    assert!(transport.router().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_cycles_repeat_on_the_interval() {
    let transport = Arc::new(MockTransport::new().with_default_response(MockResponse::Accepted));
    let (mut agent, ids) = build_agent(
        &transport,
        provisioned_store(),
        Arc::new(StaticCollector::sample()),
    );

    // Cycles start at 0s, 300s and 600s
    let outcome = run_for(&mut agent, 700).await;

    assert_eq!(outcome.cycles, 3);
    assert_eq!(ids.issued(), vec![1000, 1001, 1002]);
    let rids: Vec<_> = transport
        .published()
        .iter()
        .map(|(_, payload)| report_id_of(payload))
        .collect();
    assert_eq!(rids, vec![Some(1000), Some(1001), Some(1002)]);
}

#[tokio::test(start_paused = true)]
async fn test_unanswered_reports_do_not_stop_the_loop() {
    let transport = Arc::new(MockTransport::new());
    let (mut agent, _) = build_agent(
        &transport,
        provisioned_store(),
        Arc::new(StaticCollector::sample()),
    );

    // 0-30s wait, sleep to 330s, 330-360s wait, shutdown at 400s
    let outcome = run_for(&mut agent, 400).await;

    assert!(!outcome.startup_failed);
    assert_eq!(outcome.cycles, 2);
    assert_eq!(transport.published().len(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_unacknowledged_publish_defers_to_next_cycle() {
    let transport = Arc::new(MockTransport::new().with_default_response(MockResponse::Accepted));
    transport.script_publish(MockAck::Status(CommandStatus::Refused));
    let (mut agent, _) = build_agent(
        &transport,
        provisioned_store(),
        Arc::new(StaticCollector::sample()),
    );

    let outcome = run_for(&mut agent, 400).await;

    // No retry inside the first cycle
    assert_eq!(outcome.cycles, 2);
    assert_eq!(transport.published().len(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_build_failure_skips_publish_but_keeps_running() {
    let transport = Arc::new(MockTransport::new());
    let (mut agent, _) = build_agent(
        &transport,
        provisioned_store(),
        Arc::new(FailingCollector::new("tp")),
    );

    let outcome = run_for(&mut agent, 400).await;

    assert!(!outcome.startup_failed);
    assert_eq!(outcome.cycles, 2);
    assert!(transport.published().is_empty());
    assert_eq!(transport.unsubscriptions().len(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_undersized_buffer_never_publishes() {
    let transport = Arc::new(MockTransport::new());
    let (agent, _) = build_agent(
        &transport,
        provisioned_store(),
        Arc::new(StaticCollector::sample()),
    );
    let mut agent = agent.with_buffer_size(64);

    let outcome = run_for(&mut agent, 60).await;

    assert_eq!(outcome.cycles, 1);
    assert!(transport.published().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_missing_identity_never_subscribes() {
    let transport = Arc::new(MockTransport::new());
    let (mut agent, ids) = build_agent(
        &transport,
        Arc::new(KvStore::in_memory()),
        Arc::new(StaticCollector::sample()),
    );

    let outcome = run_for(&mut agent, 60).await;

    assert!(outcome.startup_failed);
    assert_eq!(outcome.final_state, AgentState::Terminated);
    assert!(transport.calls().is_empty());
    assert!(ids.issued().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_refused_subscription_aborts_startup() {
    let transport = Arc::new(MockTransport::new());
    transport.script_subscribe(REJECTED_TOPIC, MockAck::Status(CommandStatus::Refused));
    let (mut agent, _) = build_agent(
        &transport,
        provisioned_store(),
        Arc::new(StaticCollector::sample()),
    );

    let outcome = run_for(&mut agent, 60).await;

    assert!(outcome.startup_failed);
    assert_eq!(outcome.cycles, 0);
    assert!(transport.published().is_empty());
    // Only the subscription that succeeded is undone
    assert_eq!(transport.unsubscriptions(), vec![ACCEPTED_TOPIC]);
    assert!(transport.router().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_subscription_timeout_aborts_startup() {
    let transport = Arc::new(MockTransport::new());
    transport.script_subscribe(ACCEPTED_TOPIC, MockAck::Silent);
    let (mut agent, _) = build_agent(
        &transport,
        provisioned_store(),
        Arc::new(StaticCollector::sample()),
    );

    let outcome = run_for(&mut agent, 600).await;

    assert!(outcome.startup_failed);
    assert_eq!(transport.subscriptions(), vec![ACCEPTED_TOPIC]);
    assert!(transport.unsubscriptions().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_failed_unsubscribe_still_releases_handlers() {
    let transport = Arc::new(MockTransport::new());
    transport.script_unsubscribe(ACCEPTED_TOPIC, MockAck::Status(CommandStatus::Refused));
    let (mut agent, _) = build_agent(
        &transport,
        provisioned_store(),
        Arc::new(StaticCollector::sample()),
    );

    let outcome = run_for(&mut agent, 60).await;

    assert!(!outcome.startup_failed);
    assert_eq!(transport.unsubscriptions().len(), 2);
    assert!(transport.router().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_agent_waits_for_connection() {
    let transport = Arc::new(
        MockTransport::disconnected().with_default_response(MockResponse::Accepted),
    );
    let (mut agent, _) = build_agent(
        &transport,
        provisioned_store(),
        Arc::new(StaticCollector::sample()),
    );

    let connector = Arc::clone(&transport);
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_secs(10)).await;
        connector.connect();
    });

    let outcome = run_for(&mut agent, 120).await;

    assert!(!outcome.startup_failed);
    assert_eq!(outcome.cycles, 1);
    assert!(transport.is_connected());
}

#[tokio::test(start_paused = true)]
async fn test_no_response_within_timeout_is_not_received() {
    let transport = MockTransport::new();
    let ctx = subscribed_context(&transport).await;

    let started = tokio::time::Instant::now();
    let status = publish(&transport, &ctx, 1).await;

    assert_eq!(status, ReportStatus::NotReceived);
    assert!(!ctx.correlation().is_waiting());
    assert!(started.elapsed() >= Duration::from_secs(30));
    assert!(started.elapsed() < Duration::from_secs(31));
}

#[tokio::test(start_paused = true)]
async fn test_invalid_accepted_payload_is_classified_invalid() {
    let transport = MockTransport::new();
    let ctx = subscribed_context(&transport).await;

    transport.script_response(MockResponse::Raw {
        kind: ResponseKind::Accepted,
        payload: b"\xff\x00 not a response".to_vec(),
    });
    assert_eq!(publish(&transport, &ctx, 2).await, ReportStatus::Invalid);

    transport.script_response(MockResponse::Raw {
        kind: ResponseKind::Accepted,
        payload: br#"{"thingName":"thing-7","reportId":3,"status":"ACCEPTED"}"#.to_vec(),
    });
    assert_eq!(publish(&transport, &ctx, 3).await, ReportStatus::Invalid);
}

#[tokio::test(start_paused = true)]
async fn test_previous_report_answer_during_wait_is_ignored() {
    let transport = MockTransport::new();
    let ctx = subscribed_context(&transport).await;

    // The service answers report 20 while report 21 is in flight
    transport.script_response(MockResponse::AcceptedFor(20));
    assert_eq!(publish(&transport, &ctx, 21).await, ReportStatus::NotReceived);
    assert!(!ctx.correlation().is_waiting());

    transport.script_response(MockResponse::Accepted);
    assert_eq!(publish(&transport, &ctx, 22).await, ReportStatus::Accepted);
}

#[tokio::test(start_paused = true)]
async fn test_rejected_response_is_classified_rejected() {
    let transport = MockTransport::new();
    let ctx = subscribed_context(&transport).await;

    transport.script_response(MockResponse::Rejected {
        code: "InvalidPayload".to_string(),
        message: "Malformed report".to_string(),
    });
    assert_eq!(publish(&transport, &ctx, 4).await, ReportStatus::Rejected);
}

#[tokio::test(start_paused = true)]
async fn test_late_response_is_ignored_between_cycles() {
    let transport = MockTransport::new();
    let ctx = subscribed_context(&transport).await;

    // Answer arrives ten seconds after the wait gave up
    transport.script_delayed_response(MockResponse::Accepted, Duration::from_secs(40));
    assert_eq!(publish(&transport, &ctx, 10).await, ReportStatus::NotReceived);

    tokio::time::sleep(Duration::from_secs(15)).await;
    assert!(!ctx.correlation().is_waiting());

    transport.script_no_response();
    assert_eq!(publish(&transport, &ctx, 11).await, ReportStatus::NotReceived);

    transport.script_response(MockResponse::Accepted);
    assert_eq!(publish(&transport, &ctx, 12).await, ReportStatus::Accepted);
}

#[tokio::test]
async fn test_injected_message_outside_cycle_changes_nothing() {
    let transport = MockTransport::new();
    let ctx = subscribed_context(&transport).await;

    let payload = br#"{"thingName":"thing-42","reportId":5,"status":"ACCEPTED"}"#;
    assert!(transport.inject(ACCEPTED_TOPIC, payload));
    assert!(!ctx.correlation().is_waiting());

    // The next cycle does not see the stale acceptance
    transport.script_response(MockResponse::Rejected {
        code: "Throttled".to_string(),
        message: "slow down".to_string(),
    });
    assert_eq!(publish(&transport, &ctx, 5).await, ReportStatus::Rejected);
}

#[tokio::test]
async fn test_published_calls_are_recorded_in_order() {
    let transport = MockTransport::new();
    let ctx = subscribed_context(&transport).await;
    transport.script_response(MockResponse::Accepted);
    publish(&transport, &ctx, 7).await;

    let calls = transport.calls();
    assert_eq!(calls.len(), 3);
    assert_eq!(calls[0], MockCall::Subscribe(ACCEPTED_TOPIC.to_string()));
    assert_eq!(calls[1], MockCall::Subscribe(REJECTED_TOPIC.to_string()));
    assert!(matches!(&calls[2], MockCall::Publish { topic, .. } if topic == PUBLISH_TOPIC));
}
