//! Impure I/O operations for the MQTT client
//!
//! A supervisor task owns the rumqttc event loop: it routes inbound publishes
//! through the [`TopicRouter`], binds command completions to packet ids as
//! packets are written and resolves them from broker acknowledgments. It keeps
//! polling through connection errors with backoff (rumqttc reconnects on the
//! next poll).

use super::connection::{configure_mqtt_options, ConnectionState, MqttError, ReconnectConfig};
use super::message_handler::{CommandKind, EventRoute, MessageHandler, PendingCommands};
use crate::config::MqttSection;
use crate::observability::stats;
use crate::sync::{interruptible_sleep, shutdown_requested};
use crate::transport::{CommandStatus, CompletionCallback, TopicRouter, Transport};
use async_trait::async_trait;
use rumqttc::v5::mqttbytes::QoS;
use rumqttc::v5::{AsyncClient, ClientError, EventLoop};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, trace, warn};

/// Capacity of the request channel between client handles and the event loop
const REQUEST_CHANNEL_CAPACITY: usize = 10;

pub struct MqttClient {
    client_id: String,
    client: AsyncClient,
    event_loop: Option<Arc<Mutex<EventLoop>>>,
    router: Arc<TopicRouter>,
    pending: Arc<PendingCommands>,
    // Held while a completion is queued and its request sent, so unsent
    // completions line up with the order rumqttc writes the packets
    send_lock: Arc<Mutex<()>>,
    state_tx: watch::Sender<ConnectionState>,
    state_rx: watch::Receiver<ConnectionState>,
    shutdown_tx: watch::Sender<bool>,
    event_loop_handle: Option<JoinHandle<()>>,
    reconnect_config: ReconnectConfig,
    command_timeout: Duration,
}

impl MqttClient {
    pub fn new(
        client_id: &str,
        config: &MqttSection,
        router: Arc<TopicRouter>,
    ) -> Result<Self, MqttError> {
        let mqtt_options = configure_mqtt_options(client_id, config)?;
        let (client, event_loop) = AsyncClient::new(mqtt_options, REQUEST_CHANNEL_CAPACITY);
        let (state_tx, state_rx) = watch::channel(ConnectionState::Connecting);
        let (shutdown_tx, _) = watch::channel(false);

        Ok(Self {
            client_id: client_id.to_string(),
            client,
            event_loop: Some(Arc::new(Mutex::new(event_loop))),
            router,
            pending: Arc::new(PendingCommands::new()),
            send_lock: Arc::new(Mutex::new(())),
            state_tx,
            state_rx,
            shutdown_tx,
            event_loop_handle: None,
            reconnect_config: ReconnectConfig::default(),
            command_timeout: Duration::from_secs(config.command_timeout_secs),
        })
    }

    pub fn with_reconnect_config(mut self, reconnect_config: ReconnectConfig) -> Self {
        self.reconnect_config = reconnect_config;
        self
    }

    /// Spawn the event loop supervisor; connection proceeds in the background
    pub fn start(&mut self) -> Result<(), MqttError> {
        let event_loop = self.event_loop.take().ok_or(MqttError::AlreadyStarted)?;

        let supervisor = EventLoopSupervisor {
            client_id: self.client_id.clone(),
            client: self.client.clone(),
            router: Arc::clone(&self.router),
            pending: Arc::clone(&self.pending),
            send_lock: Arc::clone(&self.send_lock),
            state_tx: self.state_tx.clone(),
            reconnect_config: self.reconnect_config.clone(),
        };
        let shutdown_rx = self.shutdown_tx.subscribe();

        self.event_loop_handle = Some(tokio::spawn(supervisor.run(event_loop, shutdown_rx)));
        Ok(())
    }

    /// Stop the supervisor and close the broker connection
    pub async fn disconnect(&mut self) -> Result<(), MqttError> {
        if self.state_rx.borrow().can_send() {
            if let Err(e) = self.client.try_disconnect() {
                warn!("Failed to queue MQTT disconnect: {}", e);
            }
            // Let the event loop flush the disconnect packet
            tokio::time::sleep(Duration::from_millis(100)).await;
        }

        let _ = self.shutdown_tx.send(true);

        if let Some(handle) = self.event_loop_handle.take() {
            match tokio::time::timeout(Duration::from_secs(2), handle).await {
                Ok(Ok(())) => info!("Event loop task shut down gracefully"),
                Ok(Err(e)) if !e.is_cancelled() => warn!("Event loop task ended with error: {}", e),
                Err(_) => warn!("Event loop task didn't shut down gracefully"),
                _ => {}
            }
        }

        let _ = self
            .state_tx
            .send(ConnectionState::Disconnected("Client disconnected".to_string()));
        info!(client_id = %self.client_id, "MQTT client disconnected");
        Ok(())
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.state_rx.borrow().clone()
    }

    fn check_connection_state(&self) -> Result<(), MqttError> {
        let state = self.connection_state();
        if !state.can_send() {
            return Err(MqttError::NotConnected { state });
        }
        Ok(())
    }

    /// Queue `completion`, then hand the request to rumqttc
    ///
    /// The completion is withdrawn if the request cannot be queued within the
    /// command timeout.
    async fn enqueue<Fut>(
        &self,
        kind: CommandKind,
        completion: CompletionCallback,
        request: Fut,
    ) -> Result<(), MqttError>
    where
        Fut: Future<Output = Result<(), ClientError>> + Send,
    {
        self.check_connection_state()?;

        let _guard = self.send_lock.lock().await;
        self.pending.push(kind, completion);

        let result = match tokio::time::timeout(self.command_timeout, request).await {
            Ok(Ok(())) => return Ok(()),
            Ok(Err(e)) => Err(MqttError::RequestFailed(e)),
            Err(_) => Err(MqttError::RequestTimeout(self.command_timeout)),
        };

        self.pending.cancel_last(kind);
        result
    }
}

#[async_trait]
impl Transport for MqttClient {
    type Error = MqttError;

    async fn wait_for_connection(&self, mut shutdown: watch::Receiver<bool>) -> bool {
        let mut state_rx = self.state_rx.clone();
        let connected = async {
            loop {
                if state_rx.borrow_and_update().can_send() {
                    return true;
                }
                if state_rx.changed().await.is_err() {
                    return false;
                }
            }
        };

        tokio::select! {
            connected = connected => connected,
            _ = shutdown_requested(&mut shutdown) => false,
        }
    }

    async fn subscribe(
        &self,
        topic: &str,
        completion: CompletionCallback,
    ) -> Result<(), MqttError> {
        debug!(topic, "Subscribing");
        self.enqueue(
            CommandKind::Subscribe,
            completion,
            self.client.subscribe(topic, QoS::AtLeastOnce),
        )
        .await
    }

    async fn unsubscribe(
        &self,
        topic: &str,
        completion: CompletionCallback,
    ) -> Result<(), MqttError> {
        debug!(topic, "Unsubscribing");
        self.enqueue(
            CommandKind::Unsubscribe,
            completion,
            self.client.unsubscribe(topic),
        )
        .await
    }

    async fn publish(
        &self,
        topic: &str,
        payload: Vec<u8>,
        completion: CompletionCallback,
    ) -> Result<(), MqttError> {
        debug!(topic, bytes = payload.len(), "Publishing");
        self.enqueue(
            CommandKind::Publish,
            completion,
            self.client.publish(topic, QoS::AtLeastOnce, false, payload),
        )
        .await
    }

    fn router(&self) -> Arc<TopicRouter> {
        Arc::clone(&self.router)
    }

    fn is_connected(&self) -> bool {
        self.state_rx.borrow().can_send()
    }
}

struct EventLoopSupervisor {
    client_id: String,
    client: AsyncClient,
    router: Arc<TopicRouter>,
    pending: Arc<PendingCommands>,
    send_lock: Arc<Mutex<()>>,
    state_tx: watch::Sender<ConnectionState>,
    reconnect_config: ReconnectConfig,
}

impl EventLoopSupervisor {
    async fn run(self, event_loop: Arc<Mutex<EventLoop>>, mut shutdown_rx: watch::Receiver<bool>) {
        info!(client_id = %self.client_id, "Starting MQTT event loop");
        let mut reconnect_attempts = 0u32;

        loop {
            let event = tokio::select! {
                _ = shutdown_requested(&mut shutdown_rx) => break,
                event = async {
                    let mut event_loop_guard = event_loop.lock().await;
                    event_loop_guard.poll().await
                } => event,
            };

            match event {
                Ok(event) => {
                    let route = MessageHandler::route_mqtt_event(&event);
                    self.process_event_route(route, &mut reconnect_attempts);
                }
                Err(e) => {
                    error!("MQTT event loop error: {}", e);
                    self.connection_lost(e.to_string());

                    reconnect_attempts = reconnect_attempts.saturating_add(1);
                    let delay_ms = self
                        .reconnect_config
                        .calculate_backoff_delay(reconnect_attempts);
                    let _ = self
                        .state_tx
                        .send(ConnectionState::Reconnecting(reconnect_attempts));
                    info!(
                        attempt = reconnect_attempts,
                        delay_ms, "Reconnecting to broker"
                    );

                    if !interruptible_sleep(&mut shutdown_rx, Duration::from_millis(delay_ms)).await
                    {
                        break;
                    }
                }
            }
        }

        let dropped = self.pending.drop_all();
        if dropped > 0 {
            debug!(dropped, "Dropped pending commands at shutdown");
        }
        info!(client_id = %self.client_id, "MQTT event loop stopped");
    }

    fn process_event_route(&self, route: EventRoute, reconnect_attempts: &mut u32) {
        match route {
            EventRoute::ConnectionAcknowledged => {
                let _ = self.state_tx.send(ConnectionState::Connected);
                stats().mqtt_connected();
                if *reconnect_attempts > 0 {
                    info!(attempts = *reconnect_attempts, "Reconnected to broker");
                } else {
                    info!("Connected to broker");
                }
                *reconnect_attempts = 0;
                self.resubscribe();
            }
            EventRoute::MessageReceived {
                topic,
                payload,
                retain,
            } => {
                trace!(topic = %topic, bytes = payload.len(), retain, "Inbound publish");
                if !self.router.dispatch(&topic, &payload) {
                    debug!(topic = %topic, "Dropping publish with no registered handler");
                }
            }
            EventRoute::Sent { kind, pkid } => {
                trace!(?kind, pkid, "Command sent");
                self.pending.sent(kind, pkid);
            }
            EventRoute::Acknowledged { kind, pkid, status } => {
                trace!(?kind, pkid, ?status, "Command acknowledged");
                self.pending.complete(kind, pkid, status);
            }
            EventRoute::Disconnected => {
                self.connection_lost("Broker sent DISCONNECT".to_string());
            }
            EventRoute::InfrastructureEvent(event) => {
                trace!(target: "mqtt_transport", "MQTT event: {}", event);
            }
            EventRoute::OutgoingEvent => {}
        }
    }

    fn connection_lost(&self, reason: String) {
        let _ = self.state_tx.send(ConnectionState::Disconnected(reason));
        stats().mqtt_connection_lost();

        let dropped = self.pending.connection_lost();
        if dropped > 0 {
            warn!(dropped, "Connection lost with subscriptions awaiting acknowledgment");
        }
    }

    /// Restore subscriptions for every routed topic after a reconnect
    ///
    /// Runs on its own task: the requests need this loop to keep polling.
    fn resubscribe(&self) {
        let topics = self.router.topics();
        if topics.is_empty() {
            return;
        }

        let client = self.client.clone();
        let pending = Arc::clone(&self.pending);
        let send_lock = Arc::clone(&self.send_lock);

        tokio::spawn(async move {
            let _guard = send_lock.lock().await;
            for topic in topics {
                let label = topic.clone();
                pending.push(
                    CommandKind::Subscribe,
                    Box::new(move |status| {
                        if status != CommandStatus::Success {
                            warn!(topic = %label, ?status, "Re-subscription not acknowledged");
                        }
                    }),
                );

                match client.subscribe(&topic, QoS::AtLeastOnce).await {
                    Ok(()) => debug!(topic = %topic, "Re-subscribed"),
                    Err(e) => {
                        pending.cancel_last(CommandKind::Subscribe);
                        error!("Failed to re-subscribe to {}: {}", topic, e);
                    }
                }
            }
        });
    }
}
