//! Mock implementations for testing
//!
//! [`MockTransport`] acknowledges commands and answers reports from a script,
//! delivering everything from spawned tasks the way a broker connection
//! would. The collectors and id source make report contents deterministic.

use crate::agent::ReportIdSource;
use crate::collectors::{
    write_connections, write_network_stats, write_port_list, MetricsCollector, NetworkStats,
    CONNECTIONS_KEY, CONNECTIONS_MAX, NETWORK_STATS_KEY, TCP_PORTS_KEY, TCP_PORTS_MAX,
    UDP_PORTS_KEY, UDP_PORTS_MAX,
};
use crate::encoding::{EncodeError, StructuredWriter};
use crate::protocol::report::{HEADER_KEY, REPORT_ID_KEY};
use crate::protocol::{build_report, ReportResponse, ResponseKind, StatusDetails};
use crate::store::StoreError;
use crate::sync::shutdown_requested;
use crate::transport::{CommandStatus, CompletionCallback, TopicRouter, Transport};
use async_trait::async_trait;
use serde_cbor::Value;
use std::collections::{HashMap, VecDeque};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::watch;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// How the mock answers one command
#[derive(Debug, Clone, PartialEq)]
pub enum MockAck {
    /// Complete with this status
    Status(CommandStatus),
    /// Accept for dispatch but never complete
    Silent,
    /// Refuse to dispatch
    DispatchError,
}

/// Scripted answer to a published report
#[derive(Debug, Clone, PartialEq)]
pub enum MockResponse {
    /// Well-formed acceptance of the published report id
    Accepted,
    /// Well-formed rejection of the published report id
    Rejected { code: String, message: String },
    /// Acceptance carrying a different report id
    AcceptedFor(u64),
    /// Arbitrary bytes on the given response topic
    Raw { kind: ResponseKind, payload: Vec<u8> },
}

#[derive(Debug, Clone, PartialEq)]
pub enum MockCall {
    Subscribe(String),
    Unsubscribe(String),
    Publish { topic: String, payload: Vec<u8> },
}

#[derive(Debug, Error)]
pub enum MockTransportError {
    #[error("Mock dispatch failure for {0}")]
    Dispatch(String),
}

type ScriptedResponse = Option<(MockResponse, Duration)>;

/// Mock transport for testing
pub struct MockTransport {
    router: Arc<TopicRouter>,
    connected: watch::Sender<bool>,
    subscribe_acks: Mutex<HashMap<String, VecDeque<MockAck>>>,
    unsubscribe_acks: Mutex<HashMap<String, VecDeque<MockAck>>>,
    publish_acks: Mutex<VecDeque<MockAck>>,
    responses: Mutex<VecDeque<ScriptedResponse>>,
    default_response: Option<MockResponse>,
    calls: Mutex<Vec<MockCall>>,
}

impl Default for MockTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl MockTransport {
    /// Connected transport that acknowledges everything and never answers reports
    pub fn new() -> Self {
        Self::with_router_capacity(8)
    }

    pub fn with_router_capacity(capacity: usize) -> Self {
        let (connected, _) = watch::channel(true);
        Self {
            router: Arc::new(TopicRouter::new(capacity)),
            connected,
            subscribe_acks: Mutex::new(HashMap::new()),
            unsubscribe_acks: Mutex::new(HashMap::new()),
            publish_acks: Mutex::new(VecDeque::new()),
            responses: Mutex::new(VecDeque::new()),
            default_response: None,
            calls: Mutex::new(Vec::new()),
        }
    }

    /// Transport whose connection only comes up on [`MockTransport::connect`]
    pub fn disconnected() -> Self {
        let transport = Self::new();
        transport.connected.send_replace(false);
        transport
    }

    /// Answer every report without a scripted response this way
    pub fn with_default_response(mut self, response: MockResponse) -> Self {
        self.default_response = Some(response);
        self
    }

    pub fn connect(&self) {
        self.connected.send_replace(true);
    }

    pub fn script_subscribe(&self, topic: &str, ack: MockAck) {
        lock(&self.subscribe_acks)
            .entry(topic.to_string())
            .or_default()
            .push_back(ack);
    }

    pub fn script_unsubscribe(&self, topic: &str, ack: MockAck) {
        lock(&self.unsubscribe_acks)
            .entry(topic.to_string())
            .or_default()
            .push_back(ack);
    }

    pub fn script_publish(&self, ack: MockAck) {
        lock(&self.publish_acks).push_back(ack);
    }

    /// Answer the next acknowledged report immediately
    pub fn script_response(&self, response: MockResponse) {
        self.script_delayed_response(response, Duration::ZERO);
    }

    /// Answer the next acknowledged report after `delay`
    pub fn script_delayed_response(&self, response: MockResponse, delay: Duration) {
        lock(&self.responses).push_back(Some((response, delay)));
    }

    /// Leave the next acknowledged report unanswered
    pub fn script_no_response(&self) {
        lock(&self.responses).push_back(None);
    }

    /// Deliver a message as if the broker had sent it
    pub fn inject(&self, topic: &str, payload: &[u8]) -> bool {
        self.router.dispatch(topic, payload)
    }

    pub fn calls(&self) -> Vec<MockCall> {
        lock(&self.calls).clone()
    }

    pub fn subscriptions(&self) -> Vec<String> {
        self.calls()
            .into_iter()
            .filter_map(|call| match call {
                MockCall::Subscribe(topic) => Some(topic),
                _ => None,
            })
            .collect()
    }

    pub fn unsubscriptions(&self) -> Vec<String> {
        self.calls()
            .into_iter()
            .filter_map(|call| match call {
                MockCall::Unsubscribe(topic) => Some(topic),
                _ => None,
            })
            .collect()
    }

    pub fn published(&self) -> Vec<(String, Vec<u8>)> {
        self.calls()
            .into_iter()
            .filter_map(|call| match call {
                MockCall::Publish { topic, payload } => Some((topic, payload)),
                _ => None,
            })
            .collect()
    }

    fn next_ack(
        scripts: &Mutex<HashMap<String, VecDeque<MockAck>>>,
        topic: &str,
    ) -> MockAck {
        lock(scripts)
            .get_mut(topic)
            .and_then(|queue| queue.pop_front())
            .unwrap_or(MockAck::Status(CommandStatus::Success))
    }

    fn next_response(&self) -> ScriptedResponse {
        match lock(&self.responses).pop_front() {
            Some(scripted) => scripted,
            None => self
                .default_response
                .clone()
                .map(|response| (response, Duration::ZERO)),
        }
    }

    /// Complete `completion` from another task according to `ack`
    fn acknowledge(
        topic: &str,
        ack: MockAck,
        completion: CompletionCallback,
    ) -> Result<(), MockTransportError> {
        match ack {
            MockAck::Status(status) => {
                tokio::spawn(async move { completion(status) });
                Ok(())
            }
            MockAck::Silent => Ok(()),
            MockAck::DispatchError => Err(MockTransportError::Dispatch(topic.to_string())),
        }
    }
}

#[async_trait]
impl Transport for MockTransport {
    type Error = MockTransportError;

    async fn wait_for_connection(&self, mut shutdown: watch::Receiver<bool>) -> bool {
        let mut connected = self.connected.subscribe();
        let up = async {
            loop {
                if *connected.borrow_and_update() {
                    return true;
                }
                if connected.changed().await.is_err() {
                    return false;
                }
            }
        };

        tokio::select! {
            up = up => up,
            _ = shutdown_requested(&mut shutdown) => false,
        }
    }

    async fn subscribe(
        &self,
        topic: &str,
        completion: CompletionCallback,
    ) -> Result<(), Self::Error> {
        lock(&self.calls).push(MockCall::Subscribe(topic.to_string()));
        let ack = Self::next_ack(&self.subscribe_acks, topic);
        Self::acknowledge(topic, ack, completion)
    }

    async fn unsubscribe(
        &self,
        topic: &str,
        completion: CompletionCallback,
    ) -> Result<(), Self::Error> {
        lock(&self.calls).push(MockCall::Unsubscribe(topic.to_string()));
        let ack = Self::next_ack(&self.unsubscribe_acks, topic);
        Self::acknowledge(topic, ack, completion)
    }

    async fn publish(
        &self,
        topic: &str,
        payload: Vec<u8>,
        completion: CompletionCallback,
    ) -> Result<(), Self::Error> {
        lock(&self.calls).push(MockCall::Publish {
            topic: topic.to_string(),
            payload: payload.clone(),
        });

        let ack = lock(&self.publish_acks)
            .pop_front()
            .unwrap_or(MockAck::Status(CommandStatus::Success));

        // Only an acknowledged report gets an answer
        let Some((response, delay)) = (match ack {
            MockAck::Status(CommandStatus::Success) => self.next_response(),
            _ => None,
        }) else {
            return Self::acknowledge(topic, ack, completion);
        };

        let report_id = report_id_of(&payload).unwrap_or_default();
        let (kind, body) = response_for(topic, report_id, &response);
        let response_topic = format!("{topic}/{}", kind_suffix(kind));
        let router = Arc::clone(&self.router);

        tokio::spawn(async move {
            completion(CommandStatus::Success);
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            router.dispatch(&response_topic, &body);
        });
        Ok(())
    }

    fn router(&self) -> Arc<TopicRouter> {
        Arc::clone(&self.router)
    }

    fn is_connected(&self) -> bool {
        *self.connected.borrow()
    }
}

fn kind_suffix(kind: ResponseKind) -> &'static str {
    match kind {
        ResponseKind::Accepted => "accepted",
        ResponseKind::Rejected => "rejected",
    }
}

/// Thing name segment of a `$aws/things/<thing>/...` topic
fn thing_from_topic(topic: &str) -> Option<String> {
    topic.split('/').nth(2).map(str::to_string)
}

fn response_for(topic: &str, report_id: u64, response: &MockResponse) -> (ResponseKind, Vec<u8>) {
    let document = |report_id: u64, status: &str, details: Option<StatusDetails>| ReportResponse {
        thing_name: thing_from_topic(topic),
        report_id: Some(report_id),
        status: Some(status.to_string()),
        status_details: details,
    };

    match response {
        MockResponse::Accepted => (
            ResponseKind::Accepted,
            response_payload(&document(report_id, "ACCEPTED", None)),
        ),
        MockResponse::Rejected { code, message } => (
            ResponseKind::Rejected,
            response_payload(&document(
                report_id,
                "REJECTED",
                Some(StatusDetails {
                    error_code: Some(code.clone()),
                    error_message: Some(message.clone()),
                }),
            )),
        ),
        MockResponse::AcceptedFor(other) => (
            ResponseKind::Accepted,
            response_payload(&document(*other, "ACCEPTED", None)),
        ),
        MockResponse::Raw { kind, payload } => (*kind, payload.clone()),
    }
}

/// CBOR encoding of a response document
pub fn response_payload(response: &ReportResponse) -> Vec<u8> {
    serde_cbor::to_vec(response).unwrap_or_default()
}

/// Read `hed.rid` out of an encoded report
pub fn report_id_of(report: &[u8]) -> Option<u64> {
    let Value::Map(top) = serde_cbor::from_slice::<Value>(report).ok()? else {
        return None;
    };
    let Some(Value::Map(header)) = top.get(&Value::Text(HEADER_KEY.to_string())) else {
        return None;
    };
    match header.get(&Value::Text(REPORT_ID_KEY.to_string())) {
        Some(Value::Integer(id)) => u64::try_from(*id).ok(),
        _ => None,
    }
}

/// A report with empty metrics, as published for `report_id`
pub fn encoded_report(report_id: u64) -> Vec<u8> {
    let mut buf = vec![0u8; 256];
    match build_report(&mut buf, report_id, &EmptyCollector) {
        Ok(len) => {
            buf.truncate(len);
            buf
        }
        Err(_) => Vec::new(),
    }
}

/// Collector whose four calls append nothing
#[derive(Debug, Clone, Copy, Default)]
pub struct EmptyCollector;

impl MetricsCollector for EmptyCollector {
    fn network_stats(&self, _writer: &mut dyn StructuredWriter) -> Result<(), EncodeError> {
        Ok(())
    }

    fn listening_tcp_ports(&self, _writer: &mut dyn StructuredWriter) -> Result<(), EncodeError> {
        Ok(())
    }

    fn listening_udp_ports(&self, _writer: &mut dyn StructuredWriter) -> Result<(), EncodeError> {
        Ok(())
    }

    fn established_connections(
        &self,
        _writer: &mut dyn StructuredWriter,
    ) -> Result<(), EncodeError> {
        Ok(())
    }
}

/// Collector reporting fixed values
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StaticCollector {
    pub network: NetworkStats,
    pub tcp_ports: Vec<u16>,
    pub udp_ports: Vec<u16>,
    pub connections: Vec<SocketAddr>,
}

impl StaticCollector {
    /// A small gateway: ssh and https listening, dns and ntp over udp, one peer
    pub fn sample() -> Self {
        Self {
            network: NetworkStats {
                bytes_in: 1_048_576,
                bytes_out: 524_288,
                packets_in: 4_096,
                packets_out: 2_048,
            },
            tcp_ports: vec![22, 443],
            udp_ports: vec![53, 123],
            connections: vec![SocketAddr::from(([192, 0, 2, 10], 8883))],
        }
    }
}

impl MetricsCollector for StaticCollector {
    fn network_stats(&self, writer: &mut dyn StructuredWriter) -> Result<(), EncodeError> {
        write_network_stats(writer, &self.network)
    }

    fn listening_tcp_ports(&self, writer: &mut dyn StructuredWriter) -> Result<(), EncodeError> {
        write_port_list(writer, TCP_PORTS_KEY, &self.tcp_ports, TCP_PORTS_MAX)
    }

    fn listening_udp_ports(&self, writer: &mut dyn StructuredWriter) -> Result<(), EncodeError> {
        write_port_list(writer, UDP_PORTS_KEY, &self.udp_ports, UDP_PORTS_MAX)
    }

    fn established_connections(
        &self,
        writer: &mut dyn StructuredWriter,
    ) -> Result<(), EncodeError> {
        write_connections(writer, &self.connections, CONNECTIONS_MAX)
    }
}

/// Sample collector that fails the call for one metric key
#[derive(Debug, Clone)]
pub struct FailingCollector {
    metric: &'static str,
    inner: StaticCollector,
}

impl FailingCollector {
    /// `metric` is one of `ns`, `tp`, `up`, `tc`
    pub fn new(metric: &'static str) -> Self {
        Self {
            metric,
            inner: StaticCollector::sample(),
        }
    }

    fn check(&self, metric: &'static str) -> Result<(), EncodeError> {
        if self.metric == metric {
            Err(EncodeError::collector(metric, "scripted failure"))
        } else {
            Ok(())
        }
    }
}

impl MetricsCollector for FailingCollector {
    fn network_stats(&self, writer: &mut dyn StructuredWriter) -> Result<(), EncodeError> {
        self.check(NETWORK_STATS_KEY)?;
        self.inner.network_stats(writer)
    }

    fn listening_tcp_ports(&self, writer: &mut dyn StructuredWriter) -> Result<(), EncodeError> {
        self.check(TCP_PORTS_KEY)?;
        self.inner.listening_tcp_ports(writer)
    }

    fn listening_udp_ports(&self, writer: &mut dyn StructuredWriter) -> Result<(), EncodeError> {
        self.check(UDP_PORTS_KEY)?;
        self.inner.listening_udp_ports(writer)
    }

    fn established_connections(
        &self,
        writer: &mut dyn StructuredWriter,
    ) -> Result<(), EncodeError> {
        self.check(CONNECTIONS_KEY)?;
        self.inner.established_connections(writer)
    }
}

/// Deterministic ids counting up from a start value
#[derive(Debug)]
pub struct FixedReportIds {
    next: AtomicU64,
    issued: Mutex<Vec<u64>>,
}

impl FixedReportIds {
    pub fn starting_at(first: u64) -> Self {
        Self {
            next: AtomicU64::new(first),
            issued: Mutex::new(Vec::new()),
        }
    }

    pub fn issued(&self) -> Vec<u64> {
        lock(&self.issued).clone()
    }
}

impl ReportIdSource for FixedReportIds {
    fn next_id(&self) -> Result<u64, StoreError> {
        let id = self.next.fetch_add(1, Ordering::SeqCst);
        lock(&self.issued).push(id);
        Ok(id)
    }
}

/// Id source whose store is unavailable
#[derive(Debug, Clone, Copy, Default)]
pub struct UnavailableReportIds;

impl ReportIdSource for UnavailableReportIds {
    fn next_id(&self) -> Result<u64, StoreError> {
        Err(StoreError::Io(std::io::Error::other("store unavailable")))
    }
}
