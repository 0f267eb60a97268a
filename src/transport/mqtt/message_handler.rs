//! Pure routing of MQTT events and acknowledgment bookkeeping
//!
//! A completion is queued when its request is handed to rumqttc and bound to
//! the packet id once the event loop reports the packet as sent. Broker
//! acknowledgments then resolve completions by packet id.

use crate::transport::{CommandStatus, CompletionCallback};
use bytes::Bytes;
use rumqttc::v5::mqttbytes::v5::{Packet, PubAckReason, SubscribeReasonCode, UnsubAckReason};
use rumqttc::v5::Event;
use rumqttc::Outgoing;
use std::collections::{HashMap, VecDeque};
use std::sync::{Mutex, MutexGuard};
use tracing::debug;

/// Pure message routing decisions based on MQTT events
pub struct MessageHandler;

impl MessageHandler {
    /// Route MQTT event to appropriate handler (pure routing decision)
    pub fn route_mqtt_event(event: &Event) -> EventRoute {
        match event {
            Event::Incoming(incoming) => match incoming {
                Packet::ConnAck(_) => EventRoute::ConnectionAcknowledged,
                Packet::Publish(publish) => EventRoute::MessageReceived {
                    topic: String::from_utf8_lossy(&publish.topic).to_string(),
                    payload: publish.payload.clone(),
                    retain: publish.retain,
                },
                Packet::SubAck(suback) => EventRoute::Acknowledged {
                    kind: CommandKind::Subscribe,
                    pkid: suback.pkid,
                    status: Self::suback_status(&suback.return_codes),
                },
                Packet::UnsubAck(unsuback) => EventRoute::Acknowledged {
                    kind: CommandKind::Unsubscribe,
                    pkid: unsuback.pkid,
                    status: Self::unsuback_status(&unsuback.reasons),
                },
                Packet::PubAck(puback) => EventRoute::Acknowledged {
                    kind: CommandKind::Publish,
                    pkid: puback.pkid,
                    status: Self::puback_status(&puback.reason),
                },
                Packet::Disconnect(_) => EventRoute::Disconnected,
                other => EventRoute::InfrastructureEvent(format!("{other:?}")),
            },
            Event::Outgoing(outgoing) => match outgoing {
                Outgoing::Subscribe(pkid) => EventRoute::Sent {
                    kind: CommandKind::Subscribe,
                    pkid: *pkid,
                },
                Outgoing::Unsubscribe(pkid) => EventRoute::Sent {
                    kind: CommandKind::Unsubscribe,
                    pkid: *pkid,
                },
                Outgoing::Publish(pkid) => EventRoute::Sent {
                    kind: CommandKind::Publish,
                    pkid: *pkid,
                },
                _ => EventRoute::OutgoingEvent,
            },
        }
    }

    pub fn suback_status(codes: &[SubscribeReasonCode]) -> CommandStatus {
        if !codes.is_empty()
            && codes
                .iter()
                .all(|c| matches!(c, SubscribeReasonCode::Success(_)))
        {
            CommandStatus::Success
        } else {
            CommandStatus::Refused
        }
    }

    pub fn unsuback_status(reasons: &[UnsubAckReason]) -> CommandStatus {
        if reasons.iter().all(|r| matches!(r, UnsubAckReason::Success)) {
            CommandStatus::Success
        } else {
            CommandStatus::Refused
        }
    }

    /// "No matching subscribers" still means the broker took the message
    pub fn puback_status(reason: &PubAckReason) -> CommandStatus {
        match reason {
            PubAckReason::Success | PubAckReason::NoMatchingSubscribers => CommandStatus::Success,
            _ => CommandStatus::Refused,
        }
    }
}

/// Routing decisions for MQTT events
#[derive(Debug, Clone)]
pub enum EventRoute {
    ConnectionAcknowledged,
    MessageReceived {
        topic: String,
        payload: Bytes,
        retain: bool,
    },
    /// A command packet was written to the connection under `pkid`
    Sent {
        kind: CommandKind,
        pkid: u16,
    },
    Acknowledged {
        kind: CommandKind,
        pkid: u16,
        status: CommandStatus,
    },
    Disconnected,
    /// Infrastructure event (PingResp, etc.)
    InfrastructureEvent(String),
    OutgoingEvent,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CommandKind {
    Subscribe,
    Unsubscribe,
    Publish,
}

const KINDS: [CommandKind; 3] = [
    CommandKind::Subscribe,
    CommandKind::Unsubscribe,
    CommandKind::Publish,
];

/// Completions of one command kind
#[derive(Default)]
struct KindQueue {
    // Requests handed to rumqttc but not yet written, in request order
    unsent: VecDeque<CompletionCallback>,
    // Written requests waiting for the broker, by packet id
    in_flight: HashMap<u16, CompletionCallback>,
}

/// Completions waiting for broker acknowledgment
///
/// rumqttc writes requests in the order they were queued, so the oldest
/// unsent completion belongs to the next `Sent` event of its kind.
#[derive(Default)]
pub struct PendingCommands {
    subscribe: Mutex<KindQueue>,
    unsubscribe: Mutex<KindQueue>,
    publish: Mutex<KindQueue>,
}

impl PendingCommands {
    pub fn new() -> Self {
        Self::default()
    }

    fn queue(&self, kind: CommandKind) -> MutexGuard<'_, KindQueue> {
        let queue = match kind {
            CommandKind::Subscribe => &self.subscribe,
            CommandKind::Unsubscribe => &self.unsubscribe,
            CommandKind::Publish => &self.publish,
        };
        queue.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn push(&self, kind: CommandKind, completion: CompletionCallback) {
        self.queue(kind).unsent.push_back(completion);
    }

    /// Take back the most recent completion when its command was never sent
    pub fn cancel_last(&self, kind: CommandKind) -> Option<CompletionCallback> {
        self.queue(kind).unsent.pop_back()
    }

    /// Bind the oldest unsent completion of `kind` to `pkid`
    ///
    /// A packet id that is already in flight is a retransmission and keeps
    /// its completion. Packet id 0 is a QoS 0 publish, which the broker never
    /// acknowledges; it resolves as soon as it is written.
    pub fn sent(&self, kind: CommandKind, pkid: u16) {
        let completion = {
            let mut queue = self.queue(kind);
            if queue.in_flight.contains_key(&pkid) {
                debug!(?kind, pkid, "Retransmitted command");
                return;
            }
            let Some(completion) = queue.unsent.pop_front() else {
                debug!(?kind, pkid, "Sent command with no pending completion");
                return;
            };
            if pkid != 0 {
                queue.in_flight.insert(pkid, completion);
                return;
            }
            completion
        };
        completion(CommandStatus::Success);
    }

    /// Resolve the completion bound to `pkid`; false if none was waiting
    pub fn complete(&self, kind: CommandKind, pkid: u16, status: CommandStatus) -> bool {
        // Remove under the lock, call outside it
        let completion = self.queue(kind).in_flight.remove(&pkid);
        match completion {
            Some(completion) => {
                completion(status);
                true
            }
            None => {
                debug!(?kind, pkid, ?status, "Acknowledgment with no pending command");
                false
            }
        }
    }

    /// Resolve completions that the next session cannot acknowledge
    ///
    /// rumqttc replays unacknowledged publishes with their packet ids and
    /// still sends requests that were queued but unwritten. Written subscribe
    /// and unsubscribe packets are not replayed, so those are dropped.
    pub fn connection_lost(&self) -> usize {
        let mut dropped = Vec::new();
        for kind in [CommandKind::Subscribe, CommandKind::Unsubscribe] {
            dropped.extend(self.queue(kind).in_flight.drain().map(|(_, c)| c));
        }
        Self::resolve_dropped(dropped)
    }

    /// Resolve every pending completion as dropped
    pub fn drop_all(&self) -> usize {
        let mut dropped = Vec::new();
        for kind in KINDS {
            let mut queue = self.queue(kind);
            dropped.extend(queue.unsent.drain(..));
            dropped.extend(queue.in_flight.drain().map(|(_, c)| c));
        }
        Self::resolve_dropped(dropped)
    }

    fn resolve_dropped(dropped: Vec<CompletionCallback>) -> usize {
        let count = dropped.len();
        for completion in dropped {
            completion(CommandStatus::Dropped);
        }
        count
    }

    /// Completions of `kind` not yet resolved, sent or not
    pub fn pending(&self, kind: CommandKind) -> usize {
        let queue = self.queue(kind);
        queue.unsent.len() + queue.in_flight.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rumqttc::v5::mqttbytes::v5::{
        ConnAck, ConnectReturnCode, Disconnect, DisconnectReasonCode, PubAck, Publish,
    };
    use rumqttc::v5::mqttbytes::QoS;
    use std::sync::Arc;

    fn recording(log: &Arc<Mutex<Vec<(u8, CommandStatus)>>>, id: u8) -> CompletionCallback {
        let log = Arc::clone(log);
        Box::new(move |status| log.lock().unwrap().push((id, status)))
    }

    #[test]
    fn test_route_publish() {
        let event = Event::Incoming(Packet::Publish(Publish {
            dup: false,
            qos: QoS::AtLeastOnce,
            retain: false,
            topic: Bytes::from("a/b"),
            pkid: 1,
            payload: Bytes::from("payload"),
            properties: None,
        }));

        match MessageHandler::route_mqtt_event(&event) {
            EventRoute::MessageReceived { topic, payload, retain } => {
                assert_eq!(topic, "a/b");
                assert_eq!(payload, Bytes::from_static(b"payload"));
                assert!(!retain);
            }
            other => panic!("unexpected route {other:?}"),
        }
    }

    #[test]
    fn test_route_connection_events() {
        let connack = Event::Incoming(Packet::ConnAck(ConnAck {
            session_present: false,
            code: ConnectReturnCode::Success,
            properties: None,
        }));
        assert!(matches!(
            MessageHandler::route_mqtt_event(&connack),
            EventRoute::ConnectionAcknowledged
        ));

        let disconnect = Event::Incoming(Packet::Disconnect(Disconnect {
            reason_code: DisconnectReasonCode::NormalDisconnection,
            properties: None,
        }));
        assert!(matches!(
            MessageHandler::route_mqtt_event(&disconnect),
            EventRoute::Disconnected
        ));
    }

    #[test]
    fn test_route_puback() {
        let event = Event::Incoming(Packet::PubAck(PubAck {
            pkid: 7,
            reason: PubAckReason::Success,
            properties: None,
        }));
        assert!(matches!(
            MessageHandler::route_mqtt_event(&event),
            EventRoute::Acknowledged {
                kind: CommandKind::Publish,
                pkid: 7,
                status: CommandStatus::Success
            }
        ));
    }

    #[test]
    fn test_route_outgoing_commands_carry_packet_id() {
        assert!(matches!(
            MessageHandler::route_mqtt_event(&Event::Outgoing(Outgoing::Subscribe(3))),
            EventRoute::Sent {
                kind: CommandKind::Subscribe,
                pkid: 3
            }
        ));
        assert!(matches!(
            MessageHandler::route_mqtt_event(&Event::Outgoing(Outgoing::Publish(9))),
            EventRoute::Sent {
                kind: CommandKind::Publish,
                pkid: 9
            }
        ));
        assert!(matches!(
            MessageHandler::route_mqtt_event(&Event::Outgoing(Outgoing::PingReq)),
            EventRoute::OutgoingEvent
        ));
    }

    #[test]
    fn test_suback_status() {
        assert_eq!(
            MessageHandler::suback_status(&[SubscribeReasonCode::Success(QoS::AtLeastOnce)]),
            CommandStatus::Success
        );
        assert_eq!(
            MessageHandler::suback_status(&[SubscribeReasonCode::NotAuthorized]),
            CommandStatus::Refused
        );
        assert_eq!(MessageHandler::suback_status(&[]), CommandStatus::Refused);
    }

    #[test]
    fn test_puback_no_subscribers_is_success() {
        assert_eq!(
            MessageHandler::puback_status(&PubAckReason::NoMatchingSubscribers),
            CommandStatus::Success
        );
        assert_eq!(
            MessageHandler::puback_status(&PubAckReason::NotAuthorized),
            CommandStatus::Refused
        );
    }

    #[test]
    fn test_acks_resolve_by_packet_id() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let pending = PendingCommands::new();
        pending.push(CommandKind::Subscribe, recording(&log, 1));
        pending.push(CommandKind::Subscribe, recording(&log, 2));
        pending.push(CommandKind::Publish, recording(&log, 3));
        pending.sent(CommandKind::Subscribe, 10);
        pending.sent(CommandKind::Subscribe, 11);
        pending.sent(CommandKind::Publish, 12);

        assert!(pending.complete(CommandKind::Subscribe, 11, CommandStatus::Refused));
        assert!(pending.complete(CommandKind::Subscribe, 10, CommandStatus::Success));
        assert!(!pending.complete(CommandKind::Unsubscribe, 10, CommandStatus::Success));
        assert!(!pending.complete(CommandKind::Publish, 99, CommandStatus::Success));

        assert_eq!(
            log.lock().unwrap().as_slice(),
            &[(2, CommandStatus::Refused), (1, CommandStatus::Success)]
        );
        assert_eq!(pending.pending(CommandKind::Publish), 1);
    }

    #[test]
    fn test_ack_before_send_event_is_ignored() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let pending = PendingCommands::new();
        pending.push(CommandKind::Publish, recording(&log, 1));

        assert!(!pending.complete(CommandKind::Publish, 1, CommandStatus::Success));
        assert!(log.lock().unwrap().is_empty());
        assert_eq!(pending.pending(CommandKind::Publish), 1);
    }

    #[test]
    fn test_replayed_publish_ack_does_not_complete_newer_command() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let pending = PendingCommands::new();

        // First publish is written, then the connection drops before PUBACK
        pending.push(CommandKind::Publish, recording(&log, 1));
        pending.sent(CommandKind::Publish, 4);
        assert_eq!(pending.connection_lost(), 0);

        // A newer publish is queued; rumqttc replays the old packet first
        pending.push(CommandKind::Publish, recording(&log, 2));
        pending.sent(CommandKind::Publish, 4);
        pending.sent(CommandKind::Publish, 5);

        assert!(pending.complete(CommandKind::Publish, 4, CommandStatus::Success));
        assert_eq!(log.lock().unwrap().as_slice(), &[(1, CommandStatus::Success)]);

        assert!(pending.complete(CommandKind::Publish, 5, CommandStatus::Refused));
        assert_eq!(
            log.lock().unwrap().as_slice(),
            &[(1, CommandStatus::Success), (2, CommandStatus::Refused)]
        );
    }

    #[test]
    fn test_connection_lost_drops_written_subscriptions_only() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let pending = PendingCommands::new();
        pending.push(CommandKind::Subscribe, recording(&log, 1));
        pending.sent(CommandKind::Subscribe, 1);
        pending.push(CommandKind::Unsubscribe, recording(&log, 2));
        pending.push(CommandKind::Publish, recording(&log, 3));
        pending.sent(CommandKind::Publish, 2);

        assert_eq!(pending.connection_lost(), 1);
        assert_eq!(log.lock().unwrap().as_slice(), &[(1, CommandStatus::Dropped)]);
        assert_eq!(pending.pending(CommandKind::Unsubscribe), 1);
        assert_eq!(pending.pending(CommandKind::Publish), 1);
    }

    #[test]
    fn test_qos0_publish_resolves_when_written() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let pending = PendingCommands::new();
        pending.push(CommandKind::Publish, recording(&log, 1));
        pending.sent(CommandKind::Publish, 0);

        assert_eq!(log.lock().unwrap().as_slice(), &[(1, CommandStatus::Success)]);
        assert_eq!(pending.pending(CommandKind::Publish), 0);
    }

    #[test]
    fn test_drop_all_resolves_everything() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let pending = PendingCommands::new();
        pending.push(CommandKind::Unsubscribe, recording(&log, 1));
        pending.push(CommandKind::Publish, recording(&log, 2));
        pending.sent(CommandKind::Publish, 8);

        assert_eq!(pending.drop_all(), 2);
        let log = log.lock().unwrap();
        assert!(log.iter().all(|(_, s)| *s == CommandStatus::Dropped));
        assert_eq!(pending.pending(CommandKind::Publish), 0);
    }

    #[test]
    fn test_cancel_last_takes_newest() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let pending = PendingCommands::new();
        pending.push(CommandKind::Publish, recording(&log, 1));
        pending.push(CommandKind::Publish, recording(&log, 2));

        let cancelled = pending.cancel_last(CommandKind::Publish).unwrap();
        cancelled(CommandStatus::Dropped);
        assert_eq!(log.lock().unwrap().as_slice(), &[(2, CommandStatus::Dropped)]);
    }
}
