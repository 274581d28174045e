//! # Pub/Sub Transport
//!
//! Every server publishes framed envelopes on one shared channel and dispatches everything
//! it receives there, in arrival order. There is no reply path: a send resolves with
//! `SUCCESS` as soon as the envelope is queued for publishing.
//!
//! Three background flows run per transport:
//!
//! - the subscription loop (`DISCONNECTED -> SUBSCRIBING -> SUBSCRIBED`, resubscribing with
//!   backoff whenever the subscription fails or drops),
//! - the publisher loop draining the bounded outbox,
//! - the heartbeat loop announcing this server so idle peers still show up in
//!   [`Transport::connected_peers`].

use crate::config::MessagingConfig;
use crate::core::serialization::SerializationFormat;
use crate::error::constants::ERR_TRANSPORT_CLOSED;
use crate::error::{ProtocolError, Result};
use crate::protocol::dispatcher::Dispatcher;
use crate::protocol::envelope::Envelope;
use crate::protocol::message::WireMessage;
use crate::protocol::packet::BROADCAST;
use crate::protocol::response::Response;
use crate::transport::bus::MessageBus;
use crate::transport::{check_sender, InboundGate, PendingResponse, Transport};
use crate::utils::metrics::Metrics;
use crate::utils::timeout::{Backoff, RESPONSE_TIMEOUT};
use futures::StreamExt;
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, trace, warn};

/// Reserved type id for presence announcements. Never dispatched.
pub const HEARTBEAT_TYPE: &str = "interlink:heartbeat";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscriptionState {
    Disconnected,
    Subscribing,
    Subscribed,
}

struct Shared {
    identity: String,
    channel: String,
    format: SerializationFormat,
    filter_self: bool,
    peer_expiry: Duration,
    dispatcher: Dispatcher,
    gate: InboundGate,
    outbox: mpsc::Sender<Vec<u8>>,
    state: watch::Sender<SubscriptionState>,
    peers: Mutex<HashMap<String, Instant>>,
    metrics: Arc<Metrics>,
}

pub struct PubSubTransport {
    shared: Arc<Shared>,
    shutdown: CancellationToken,
}

impl PubSubTransport {
    /// Start the transport's flows. Must be called from within a Tokio runtime.
    ///
    /// Returns immediately; the subscription is established in the background. Use
    /// [`PubSubTransport::wait_for_state`] to wait for it.
    pub fn connect(
        config: &MessagingConfig,
        bus: Arc<dyn MessageBus>,
        dispatcher: Dispatcher,
    ) -> Result<Self> {
        let mut problems = config.identity.validate();
        problems.extend(config.pubsub.validate());
        if let Some(problem) = problems.into_iter().next() {
            return Err(ProtocolError::ConfigError(problem));
        }

        let metrics = Arc::clone(dispatcher.metrics());
        let gate = InboundGate::from_config(config, Arc::clone(&metrics))?;
        let (outbox, outbox_rx) = mpsc::channel(config.pubsub.publish_queue.max(1));
        let (state, _) = watch::channel(SubscriptionState::Disconnected);

        let shared = Arc::new(Shared {
            identity: config.identity.server_name.clone(),
            channel: config.pubsub.channel.clone(),
            format: dispatcher.registry().format(),
            filter_self: config.pubsub.filter_self,
            peer_expiry: config.pubsub.peer_expiry,
            dispatcher,
            gate,
            outbox,
            state,
            peers: Mutex::new(HashMap::new()),
            metrics,
        });
        let shutdown = CancellationToken::new();

        info!(
            server = %shared.identity,
            channel = %shared.channel,
            signed = shared.gate.is_signing(),
            "Starting pub/sub transport"
        );

        tokio::spawn(subscription_loop(
            Arc::clone(&shared),
            Arc::clone(&bus),
            Backoff::new(
                config.pubsub.retry_initial_delay,
                config.pubsub.retry_max_delay,
            ),
            shutdown.clone(),
        ));
        tokio::spawn(publisher_loop(
            Arc::clone(&shared),
            bus,
            outbox_rx,
            shutdown.clone(),
        ));
        tokio::spawn(heartbeat_loop(
            Arc::clone(&shared),
            config.pubsub.heartbeat_interval,
            shutdown.clone(),
        ));

        Ok(Self { shared, shutdown })
    }

    pub fn state(&self) -> SubscriptionState {
        *self.shared.state.borrow()
    }

    /// Wait until the subscription reaches `state`. Returns false if `within` elapses first.
    pub async fn wait_for_state(&self, state: SubscriptionState, within: Duration) -> bool {
        let mut rx = self.shared.state.subscribe();
        tokio::time::timeout(within, rx.wait_for(|current| *current == state))
            .await
            .map(|r| r.is_ok())
            .unwrap_or(false)
    }

    pub fn dispatcher(&self) -> &Dispatcher {
        &self.shared.dispatcher
    }

    pub fn metrics(&self) -> &Arc<Metrics> {
        &self.shared.metrics
    }
}

impl Transport for PubSubTransport {
    fn identity(&self) -> &str {
        &self.shared.identity
    }

    fn default_timeout(&self) -> Duration {
        RESPONSE_TIMEOUT
    }

    fn send_envelope(&self, envelope: Envelope, _timeout: Duration) -> Result<PendingResponse> {
        check_sender(&self.shared.identity, &envelope)?;
        if self.shutdown.is_cancelled() {
            return Err(ProtocolError::TransportError(ERR_TRANSPORT_CLOSED.to_string()));
        }

        let type_id = envelope.type_id().to_string();
        let bytes = self.shared.frame(envelope)?;
        let len = bytes.len() as u64;
        match self.shared.outbox.try_send(bytes) {
            Ok(()) => {
                self.shared.metrics.envelope_sent(len);
                trace!(type_id = %type_id, "Queued envelope for publish");
                Ok(PendingResponse::ready(Response::accepted()))
            }
            Err(mpsc::error::TrySendError::Full(_)) => {
                self.shared.metrics.send_failure();
                Err(ProtocolError::Backpressure(self.shared.channel.clone()))
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                Err(ProtocolError::TransportError(ERR_TRANSPORT_CLOSED.to_string()))
            }
        }
    }

    fn connected_peers(&self) -> HashSet<String> {
        let now = Instant::now();
        match self.shared.peers.lock() {
            Ok(peers) => peers
                .iter()
                .filter(|(_, seen)| now.duration_since(**seen) <= self.shared.peer_expiry)
                .map(|(name, _)| name.clone())
                .collect(),
            Err(_) => HashSet::new(),
        }
    }

    fn shutdown(&self) {
        if !self.shutdown.is_cancelled() {
            info!(server = %self.shared.identity, "Shutting down pub/sub transport");
            self.shutdown.cancel();
            self.shared.metrics.log_metrics();
        }
    }
}

impl Drop for PubSubTransport {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

impl std::fmt::Debug for PubSubTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PubSubTransport")
            .field("identity", &self.shared.identity)
            .field("channel", &self.shared.channel)
            .field("state", &self.state())
            .finish()
    }
}

impl Shared {
    fn set_state(&self, state: SubscriptionState) {
        self.state.send_replace(state);
    }

    fn frame(&self, envelope: Envelope) -> Result<Vec<u8>> {
        let envelope = self.gate.seal(envelope)?;
        WireMessage::Envelope(envelope)
            .to_frame(self.format)?
            .to_bytes()
    }

    fn saw_peer(&self, name: &str) {
        if name == self.identity {
            return;
        }
        if let Ok(mut peers) = self.peers.lock() {
            let now = Instant::now();
            let expiry = self.peer_expiry;
            peers.retain(|_, seen| now.duration_since(*seen) <= expiry);
            peers.insert(name.to_string(), now);
        }
    }

    async fn handle_message(&self, bytes: Vec<u8>) {
        let envelope = match WireMessage::envelope_from_bytes(&bytes) {
            Ok(envelope) => envelope,
            Err(e) => {
                self.metrics.decode_error();
                warn!(error = %e, len = bytes.len(), "Dropping undecodable message");
                return;
            }
        };

        match self.gate.admit(&envelope) {
            Ok(true) => {}
            Ok(false) => return,
            Err(e) => {
                warn!(sender = envelope.sender(), error = %e, "Rejected envelope");
                return;
            }
        }

        self.saw_peer(envelope.sender());
        if envelope.type_id() == HEARTBEAT_TYPE {
            return;
        }
        if self.filter_self && envelope.sender() == self.identity {
            trace!(id = envelope.id(), "Skipping self-published envelope");
            return;
        }

        self.metrics.envelope_received(bytes.len() as u64);
        let type_id = envelope.type_id().to_string();
        let response = self.dispatcher.dispatch(envelope).await;
        debug!(type_id = %type_id, status = ?response.status, "Dispatched bus message");
    }
}

#[instrument(skip_all, fields(server = %shared.identity, channel = %shared.channel))]
async fn subscription_loop(
    shared: Arc<Shared>,
    bus: Arc<dyn MessageBus>,
    mut backoff: Backoff,
    shutdown: CancellationToken,
) {
    'outer: loop {
        shared.set_state(SubscriptionState::Subscribing);
        let subscribed = tokio::select! {
            _ = shutdown.cancelled() => break,
            result = bus.subscribe(&shared.channel) => result,
        };

        match subscribed {
            Ok(mut stream) => {
                backoff.reset();
                shared.set_state(SubscriptionState::Subscribed);
                shared.metrics.connection_established();
                info!("Subscribed");

                loop {
                    tokio::select! {
                        _ = shutdown.cancelled() => {
                            shared.metrics.connection_closed();
                            break 'outer;
                        }
                        next = stream.next() => match next {
                            Some(bytes) => shared.handle_message(bytes).await,
                            None => break,
                        },
                    }
                }

                shared.metrics.connection_closed();
                warn!("Subscription dropped");
            }
            Err(e) => warn!(error = %e, "Subscribe failed"),
        }

        shared.set_state(SubscriptionState::Subscribing);
        shared.metrics.reconnect_attempt();
        let delay = backoff.next_delay();
        debug!(delay_ms = delay.as_millis() as u64, attempt = backoff.attempts(), "Resubscribing");
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = tokio::time::sleep(delay) => {}
        }
    }

    shared.set_state(SubscriptionState::Disconnected);
    debug!("Subscription loop stopped");
}

async fn publisher_loop(
    shared: Arc<Shared>,
    bus: Arc<dyn MessageBus>,
    mut outbox: mpsc::Receiver<Vec<u8>>,
    shutdown: CancellationToken,
) {
    loop {
        let bytes = tokio::select! {
            _ = shutdown.cancelled() => break,
            next = outbox.recv() => match next {
                Some(bytes) => bytes,
                None => break,
            },
        };

        if let Err(e) = bus.publish(&shared.channel, bytes).await {
            shared.metrics.send_failure();
            warn!(channel = %shared.channel, error = %e, "Publish failed, message dropped");
        }
    }
    debug!(server = %shared.identity, "Publisher loop stopped");
}

async fn heartbeat_loop(shared: Arc<Shared>, every: Duration, shutdown: CancellationToken) {
    let mut ticker = tokio::time::interval(every.max(Duration::from_millis(10)));
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = ticker.tick() => {}
        }

        let heartbeat =
            Envelope::from_parts(HEARTBEAT_TYPE, &*shared.identity, BROADCAST, Value::Null);
        let bytes = match shared.frame(heartbeat) {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!(error = %e, "Failed to encode heartbeat");
                continue;
            }
        };
        if shared.outbox.try_send(bytes).is_err() {
            trace!("Outbox full, heartbeat skipped");
        }
    }
}
