//! # Socket Transport
//!
//! Direct TCP links between servers. Each transport listens for inbound connections and
//! keeps one outbound connection open to every peer in its static table, redialing when a
//! link drops.
//!
//! Every connection starts with a hello exchange naming both ends, then carries frames in
//! both directions:
//!
//! - `Envelope` frames are checked, dispatched in arrival order, and answered with a
//!   `Response` frame on the same connection (except broadcasts, which get no reply);
//! - `Response` frames complete the matching in-flight send.
//!
//! A frame with a valid header but unusable contents is logged and skipped. Only a broken
//! stream (bad magic, oversized length, I/O failure) closes the connection.

use crate::config::{MessagingConfig, ReconnectConfig, ReconnectMode};
use crate::core::codec::FrameCodec;
use crate::core::frame::Frame;
use crate::core::serialization::SerializationFormat;
use crate::error::constants::ERR_TRANSPORT_CLOSED;
use crate::error::{DecodeError, ProtocolError, Result};
use crate::protocol::dispatcher::Dispatcher;
use crate::protocol::envelope::Envelope;
use crate::protocol::message::WireMessage;
use crate::protocol::response::Response;
use crate::transport::pending::{Completion, PendingReplies};
use crate::transport::{check_sender, InboundGate, PendingResponse, Transport};
use crate::utils::metrics::Metrics;
use crate::utils::timeout::{deadline_after, with_timeout_error, Backoff};
use futures::{SinkExt, StreamExt};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, Notify};
use tokio_util::codec::{FramedRead, FramedWrite};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, trace, warn};

type FrameReader = FramedRead<OwnedReadHalf, FrameCodec>;
type FrameWriter = FramedWrite<OwnedWriteHalf, FrameCodec>;

/// Lifecycle of the link to one peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerState {
    Unconnected,
    Connecting,
    Connected,
    Closing,
    Closed,
}

/// Which side opened a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Inbound,
    Outbound,
}

struct PeerLink {
    conn_id: u64,
    direction: Direction,
    address: SocketAddr,
    outbound: mpsc::Sender<Frame>,
    closer: CancellationToken,
}

struct Shared {
    identity: String,
    format: SerializationFormat,
    response_timeout: Duration,
    connect_timeout: Duration,
    max_frame_size: usize,
    send_queue: usize,
    reconnect: ReconnectConfig,
    dispatcher: Dispatcher,
    gate: InboundGate,
    pending: PendingReplies,
    links: RwLock<HashMap<String, Vec<PeerLink>>>,
    states: Mutex<HashMap<String, PeerState>>,
    state_changed: Notify,
    redial: HashMap<String, Arc<Notify>>,
    next_conn_id: AtomicU64,
    metrics: Arc<Metrics>,
    shutdown: CancellationToken,
}

pub struct SocketTransport {
    shared: Arc<Shared>,
    local_addr: SocketAddr,
}

impl SocketTransport {
    /// Bind the listener and start dialing every configured peer.
    pub async fn bind(config: &MessagingConfig, dispatcher: Dispatcher) -> Result<Self> {
        let identity = config.identity.server_name.clone();
        let mut problems = config.identity.validate();
        problems.extend(config.socket.validate(&identity));
        if let Some(problem) = problems.into_iter().next() {
            return Err(ProtocolError::ConfigError(problem));
        }

        let listener = TcpListener::bind(config.socket.bind_address()).await?;
        let local_addr = listener.local_addr()?;

        let metrics = Arc::clone(dispatcher.metrics());
        let gate = InboundGate::from_config(config, Arc::clone(&metrics))?;
        let peers: BTreeMap<String, String> = config
            .socket
            .peers
            .iter()
            .map(|(name, peer)| (name.clone(), peer.address()))
            .collect();

        let shared = Arc::new(Shared {
            identity,
            format: dispatcher.registry().format(),
            response_timeout: config.socket.response_timeout,
            connect_timeout: config.socket.connect_timeout,
            max_frame_size: config.socket.max_frame_size,
            send_queue: config.socket.send_queue,
            reconnect: config.socket.reconnect.clone(),
            dispatcher,
            gate,
            pending: PendingReplies::new(),
            links: RwLock::new(HashMap::new()),
            states: Mutex::new(
                peers
                    .keys()
                    .map(|name| (name.clone(), PeerState::Unconnected))
                    .collect(),
            ),
            state_changed: Notify::new(),
            redial: peers
                .keys()
                .map(|name| (name.clone(), Arc::new(Notify::new())))
                .collect(),
            next_conn_id: AtomicU64::new(1),
            metrics,
            shutdown: CancellationToken::new(),
        });

        info!(
            server = %shared.identity,
            address = %local_addr,
            peers = peers.len(),
            signed = shared.gate.is_signing(),
            "Socket transport listening"
        );

        tokio::spawn(accept_loop(Arc::clone(&shared), listener));
        for (name, address) in peers {
            tokio::spawn(dial_loop(Arc::clone(&shared), name, address));
        }

        Ok(Self { shared, local_addr })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn peer_state(&self, peer: &str) -> PeerState {
        self.shared.peer_state(peer)
    }

    /// Wait until at least one live link to `peer` exists.
    pub async fn wait_for_peer(&self, peer: &str, within: Duration) -> bool {
        let deadline = deadline_after(within);
        loop {
            let notified = self.shared.state_changed.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if self.shared.has_link(peer) {
                return true;
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return self.shared.has_link(peer);
            }
        }
    }

    /// Close every link to `peer` as an I/O failure would. Configured peers are redialed per
    /// the reconnect policy. Returns whether any link existed.
    pub fn disconnect(&self, peer: &str) -> bool {
        let closers: Vec<CancellationToken> = match self.shared.links.read() {
            Ok(links) => links
                .get(peer)
                .map(|l| l.iter().map(|link| link.closer.clone()).collect())
                .unwrap_or_default(),
            Err(_) => Vec::new(),
        };
        if closers.is_empty() {
            return false;
        }

        info!(peer, links = closers.len(), "Disconnecting peer");
        self.shared.set_state(peer, PeerState::Closing);
        for closer in closers {
            closer.cancel();
        }
        true
    }

    /// Wake the dial loop for a configured peer right away. Required to reconnect in
    /// [`ReconnectMode::Manual`] or after the attempt limit was reached.
    pub fn reconnect(&self, peer: &str) -> Result<()> {
        match self.shared.redial.get(peer) {
            Some(trigger) => {
                trigger.notify_one();
                Ok(())
            }
            None => Err(ProtocolError::NoConnection(peer.to_string())),
        }
    }

    pub fn dispatcher(&self) -> &Dispatcher {
        &self.shared.dispatcher
    }

    pub fn metrics(&self) -> &Arc<Metrics> {
        &self.shared.metrics
    }

    /// Number of sends still waiting for a response.
    pub fn in_flight(&self) -> usize {
        self.shared.pending.len()
    }

    fn broadcast(&self, envelope: Envelope) -> Result<PendingResponse> {
        let frame = WireMessage::Envelope(envelope).to_frame(self.shared.format)?;
        let len = frame.encoded_len() as u64;

        let targets: Vec<(String, mpsc::Sender<Frame>)> = match self.shared.links.read() {
            Ok(links) => links
                .iter()
                .filter_map(|(name, l)| {
                    preferred(l).map(|link| (name.clone(), link.outbound.clone()))
                })
                .collect(),
            Err(_) => Vec::new(),
        };

        for (peer, outbound) in targets {
            match outbound.try_send(frame.clone()) {
                Ok(()) => self.shared.metrics.envelope_sent(len),
                Err(e) => {
                    self.shared.metrics.send_failure();
                    warn!(peer = %peer, error = %e, "Broadcast not delivered to peer");
                }
            }
        }
        Ok(PendingResponse::ready(Response::accepted()))
    }
}

impl Transport for SocketTransport {
    fn identity(&self) -> &str {
        &self.shared.identity
    }

    fn default_timeout(&self) -> Duration {
        self.shared.response_timeout
    }

    fn send_envelope(&self, envelope: Envelope, timeout: Duration) -> Result<PendingResponse> {
        check_sender(&self.shared.identity, &envelope)?;
        if self.shared.shutdown.is_cancelled() {
            return Err(ProtocolError::TransportError(ERR_TRANSPORT_CLOSED.to_string()));
        }

        let envelope = self.shared.gate.seal(envelope)?;
        if envelope.is_broadcast() {
            return self.broadcast(envelope);
        }

        let peer = envelope.channel().to_string();
        let (conn_id, outbound) = self
            .shared
            .route(&peer)
            .ok_or_else(|| ProtocolError::NoConnection(peer.clone()))?;

        let id = envelope.id();
        let frame = WireMessage::Envelope(envelope).to_frame(self.shared.format)?;
        let len = frame.encoded_len() as u64;
        let pending = self
            .shared
            .pending
            .register(id, conn_id, timeout, Arc::clone(&self.shared.metrics));

        match outbound.try_send(frame) {
            Ok(()) => {
                self.shared.metrics.envelope_sent(len);
                trace!(peer = %peer, id, "Queued envelope");
                Ok(pending)
            }
            Err(mpsc::error::TrySendError::Full(_)) => {
                self.shared.metrics.send_failure();
                Err(ProtocolError::Backpressure(peer))
            }
            Err(mpsc::error::TrySendError::Closed(_)) => Err(ProtocolError::NoConnection(peer)),
        }
    }

    fn connected_peers(&self) -> HashSet<String> {
        match self.shared.links.read() {
            Ok(links) => links
                .iter()
                .filter(|(_, l)| !l.is_empty())
                .map(|(name, _)| name.clone())
                .collect(),
            Err(_) => HashSet::new(),
        }
    }

    fn shutdown(&self) {
        if self.shared.shutdown.is_cancelled() {
            return;
        }
        info!(server = %self.shared.identity, "Shutting down socket transport");
        let names: Vec<String> = match self.shared.states.lock() {
            Ok(states) => states.keys().cloned().collect(),
            Err(_) => Vec::new(),
        };
        for name in &names {
            self.shared.set_state(name, PeerState::Closing);
        }
        self.shared.shutdown.cancel();
        for name in &names {
            self.shared.set_state(name, PeerState::Closed);
        }
        self.shared.metrics.log_metrics();
    }
}

impl Drop for SocketTransport {
    fn drop(&mut self) {
        self.shared.shutdown.cancel();
    }
}

impl std::fmt::Debug for SocketTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SocketTransport")
            .field("identity", &self.shared.identity)
            .field("local_addr", &self.local_addr)
            .finish_non_exhaustive()
    }
}

// Outbound links win; among equals the oldest.
fn preferred(links: &[PeerLink]) -> Option<&PeerLink> {
    links
        .iter()
        .find(|link| link.direction == Direction::Outbound)
        .or_else(|| links.first())
}

impl Shared {
    fn peer_state(&self, peer: &str) -> PeerState {
        self.states
            .lock()
            .ok()
            .and_then(|states| states.get(peer).copied())
            .unwrap_or(PeerState::Unconnected)
    }

    fn set_state(&self, peer: &str, state: PeerState) {
        if let Ok(mut states) = self.states.lock() {
            let previous = states.insert(peer.to_string(), state);
            if previous != Some(state) {
                debug!(peer, ?state, "Peer state changed");
            }
        }
        self.state_changed.notify_waiters();
    }

    // Recompute the state after a link came or went.
    fn refresh_state(&self, peer: &str) {
        let state = if self.shutdown.is_cancelled() {
            PeerState::Closed
        } else if self.has_link(peer) {
            PeerState::Connected
        } else {
            PeerState::Unconnected
        };
        self.set_state(peer, state);
    }

    fn has_link(&self, peer: &str) -> bool {
        self.links
            .read()
            .map(|links| links.get(peer).is_some_and(|l| !l.is_empty()))
            .unwrap_or(false)
    }

    fn route(&self, peer: &str) -> Option<(u64, mpsc::Sender<Frame>)> {
        let links = self.links.read().ok()?;
        let link = preferred(links.get(peer)?)?;
        Some((link.conn_id, link.outbound.clone()))
    }

    fn install_link(&self, peer: &str, link: PeerLink) {
        debug!(
            peer,
            conn_id = link.conn_id,
            direction = ?link.direction,
            address = %link.address,
            "Link established"
        );
        if let Ok(mut links) = self.links.write() {
            links.entry(peer.to_string()).or_default().push(link);
        }
        self.refresh_state(peer);
    }

    fn remove_link(&self, peer: &str, conn_id: u64) {
        if let Ok(mut links) = self.links.write() {
            if let Some(entries) = links.get_mut(peer) {
                entries.retain(|link| link.conn_id != conn_id);
                if entries.is_empty() {
                    links.remove(peer);
                }
            }
        }
        let failed = self.pending.fail_connection(conn_id);
        if failed > 0 {
            warn!(peer, conn_id, failed, "In-flight sends lost with connection");
        }
        self.refresh_state(peer);
    }

    fn reply_frame(&self, id: u64, response: Response) -> Result<Frame> {
        WireMessage::Response {
            in_reply_to: id,
            response,
        }
        .to_frame(self.format)
    }

    fn split(&self, stream: TcpStream) -> (FrameReader, FrameWriter) {
        let (read_half, write_half) = stream.into_split();
        (
            FramedRead::new(read_half, FrameCodec::new(self.max_frame_size)),
            FramedWrite::new(write_half, FrameCodec::new(self.max_frame_size)),
        )
    }

    fn hello(&self) -> Result<Frame> {
        WireMessage::Hello {
            server: self.identity.clone(),
        }
        .to_frame(self.format)
    }
}

async fn read_hello(reader: &mut FrameReader, within: Duration) -> Result<String> {
    with_timeout_error(
        async {
            let frame = match reader.next().await {
                Some(frame) => frame?,
                None => return Err(ProtocolError::ConnectionClosed),
            };
            match WireMessage::from_frame(&frame)? {
                WireMessage::Hello { server } => Ok(server),
                _ => Err(DecodeError::UnexpectedFrame { expected: "hello" }.into()),
            }
        },
        within,
    )
    .await
}

/// Dial `address`, exchange hellos and check the far end is really `peer`.
async fn dial(
    shared: &Shared,
    peer: &str,
    address: &str,
) -> Result<(FrameReader, FrameWriter, SocketAddr)> {
    let stream = with_timeout_error(
        async { TcpStream::connect(address).await.map_err(ProtocolError::from) },
        shared.connect_timeout,
    )
    .await?;
    stream.set_nodelay(true)?;
    let remote = stream.peer_addr()?;

    let (mut reader, mut writer) = shared.split(stream);
    writer.send(shared.hello()?).await?;
    let name = read_hello(&mut reader, shared.connect_timeout).await?;
    if name != peer {
        return Err(ProtocolError::TransportError(format!(
            "Dialed '{peer}' at {address} but it introduced itself as '{name}'"
        )));
    }
    Ok((reader, writer, remote))
}

/// Answer an inbound hello.
async fn greet(shared: &Shared, stream: TcpStream) -> Result<(String, FrameReader, FrameWriter)> {
    stream.set_nodelay(true)?;
    let (mut reader, mut writer) = shared.split(stream);
    let name = read_hello(&mut reader, shared.connect_timeout).await?;
    if name.is_empty() || name == shared.identity || name == crate::protocol::packet::BROADCAST {
        return Err(ProtocolError::TransportError(format!(
            "Refusing peer introducing itself as '{name}'"
        )));
    }
    writer.send(shared.hello()?).await?;
    Ok((name, reader, writer))
}

#[instrument(skip_all, fields(server = %shared.identity))]
async fn accept_loop(shared: Arc<Shared>, listener: TcpListener) {
    loop {
        let (stream, address) = tokio::select! {
            _ = shared.shutdown.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok(accepted) => accepted,
                Err(e) => {
                    warn!(error = %e, "Accept failed");
                    tokio::time::sleep(Duration::from_millis(50)).await;
                    continue;
                }
            },
        };

        let shared = Arc::clone(&shared);
        tokio::spawn(async move {
            let greeted = tokio::select! {
                _ = shared.shutdown.cancelled() => return,
                greeted = greet(&shared, stream) => greeted,
            };
            match greeted {
                Ok((peer, reader, writer)) => {
                    serve(shared, peer, Direction::Inbound, address, reader, writer).await
                }
                Err(e) => warn!(%address, error = %e, "Inbound handshake failed"),
            }
        });
    }
    debug!("Accept loop stopped");
}

#[instrument(skip_all, fields(server = %shared.identity, peer = %peer))]
async fn dial_loop(shared: Arc<Shared>, peer: String, address: String) {
    let mut backoff = Backoff::new(shared.reconnect.initial_delay, shared.reconnect.max_delay);
    let trigger = shared.redial.get(&peer).cloned().unwrap_or_default();

    loop {
        shared.set_state(&peer, PeerState::Connecting);
        let dialed = tokio::select! {
            _ = shared.shutdown.cancelled() => break,
            dialed = dial(&shared, &peer, &address) => dialed,
        };

        match dialed {
            Ok((reader, writer, remote)) => {
                backoff.reset();
                info!(%remote, "Connected to peer");
                serve(
                    Arc::clone(&shared),
                    peer.clone(),
                    Direction::Outbound,
                    remote,
                    reader,
                    writer,
                )
                .await;
                if shared.shutdown.is_cancelled() {
                    break;
                }
                info!("Outbound link lost");
            }
            Err(e) => debug!(address = %address, error = %e, "Dial failed"),
        }
        shared.refresh_state(&peer);

        let limit = shared.reconnect.max_attempts;
        let automatic = shared.reconnect.mode == ReconnectMode::Backoff
            && (limit == 0 || backoff.attempts() < limit);

        if automatic {
            shared.metrics.reconnect_attempt();
            let delay = backoff.next_delay();
            debug!(
                delay_ms = delay.as_millis() as u64,
                attempt = backoff.attempts(),
                "Redialing"
            );
            tokio::select! {
                _ = shared.shutdown.cancelled() => break,
                _ = tokio::time::sleep(delay) => {}
                _ = trigger.notified() => {}
            }
        } else {
            if shared.reconnect.mode == ReconnectMode::Backoff {
                warn!(attempts = backoff.attempts(), "Reconnect attempts exhausted");
            }
            tokio::select! {
                _ = shared.shutdown.cancelled() => break,
                _ = trigger.notified() => {
                    backoff.reset();
                    shared.metrics.reconnect_attempt();
                }
            }
        }
    }
    shared.refresh_state(&peer);
    debug!("Dial loop stopped");
}

/// Run a greeted connection until it closes.
async fn serve(
    shared: Arc<Shared>,
    peer: String,
    direction: Direction,
    address: SocketAddr,
    mut reader: FrameReader,
    writer: FrameWriter,
) {
    let conn_id = shared.next_conn_id.fetch_add(1, Ordering::Relaxed);
    let closer = shared.shutdown.child_token();
    let (outbound, outbound_rx) = mpsc::channel(shared.send_queue.max(1));
    let (inbox, inbox_rx) = mpsc::channel(shared.send_queue.max(1));

    shared.install_link(
        &peer,
        PeerLink {
            conn_id,
            direction,
            address,
            outbound: outbound.clone(),
            closer: closer.clone(),
        },
    );
    shared.metrics.connection_established();

    let write_task = tokio::spawn(write_loop(
        writer,
        outbound_rx,
        closer.clone(),
        Arc::clone(&shared.metrics),
    ));
    let dispatch_task = tokio::spawn(dispatch_loop(
        Arc::clone(&shared),
        peer.clone(),
        inbox_rx,
        outbound,
        closer.clone(),
    ));

    loop {
        let next = tokio::select! {
            _ = closer.cancelled() => break,
            next = reader.next() => next,
        };
        match next {
            Some(Ok(frame)) => {
                if !route_frame(&shared, &peer, conn_id, frame, &inbox).await {
                    break;
                }
            }
            Some(Err(e)) => {
                shared.metrics.decode_error();
                warn!(peer = %peer, conn_id, error = %e, "Connection stream unusable");
                break;
            }
            None => {
                debug!(peer = %peer, conn_id, "Peer closed connection");
                break;
            }
        }
    }

    closer.cancel();
    drop(inbox);
    let _ = write_task.await;
    let _ = dispatch_task.await;

    shared.remove_link(&peer, conn_id);
    shared.metrics.connection_closed();
}

// Returns false once the dispatch side is gone. Responses only count when they arrive on the
// connection their request left on.
async fn route_frame(
    shared: &Shared,
    peer: &str,
    conn_id: u64,
    frame: Frame,
    inbox: &mpsc::Sender<(Envelope, usize)>,
) -> bool {
    let len = frame.encoded_len();
    match WireMessage::from_frame(&frame) {
        Ok(WireMessage::Envelope(envelope)) => inbox.send((envelope, len)).await.is_ok(),
        Ok(WireMessage::Response {
            in_reply_to,
            response,
        }) => {
            match shared.pending.complete(in_reply_to, conn_id, response) {
                Completion::Delivered => {}
                Completion::Unclaimed => {
                    debug!(peer, in_reply_to, "Discarding response nobody is waiting for");
                }
                Completion::WrongConnection => {
                    shared.metrics.decode_error();
                    warn!(peer, conn_id, in_reply_to, "Dropping response from another connection");
                }
            }
            true
        }
        Ok(WireMessage::Hello { .. }) => {
            debug!(peer, "Ignoring repeated hello");
            true
        }
        Err(e) => {
            shared.metrics.decode_error();
            warn!(peer, error = %e, "Skipping malformed frame");
            true
        }
    }
}

async fn dispatch_loop(
    shared: Arc<Shared>,
    peer: String,
    mut inbox: mpsc::Receiver<(Envelope, usize)>,
    replies: mpsc::Sender<Frame>,
    closer: CancellationToken,
) {
    while let Some((envelope, len)) = inbox.recv().await {
        if envelope.sender() != peer {
            shared.metrics.decode_error();
            warn!(
                peer = %peer,
                sender = envelope.sender(),
                "Dropping envelope with foreign sender"
            );
            continue;
        }
        match shared.gate.admit(&envelope) {
            Ok(true) => {}
            Ok(false) => continue,
            Err(e) => {
                warn!(peer = %peer, error = %e, "Rejected envelope");
                continue;
            }
        }
        shared.metrics.envelope_received(len as u64);

        let id = envelope.id();
        let broadcast = envelope.is_broadcast();
        let response = tokio::select! {
            _ = closer.cancelled() => break,
            response = shared.dispatcher.dispatch(envelope) => response,
        };
        if broadcast {
            continue;
        }

        let frame = match shared.reply_frame(id, response) {
            Ok(frame) => frame,
            Err(e) => {
                warn!(peer = %peer, id, error = %e, "Failed to encode response");
                match shared.reply_frame(id, Response::error(e.to_string())) {
                    Ok(frame) => frame,
                    Err(_) => continue,
                }
            }
        };
        if replies.send(frame).await.is_err() {
            break;
        }
    }
}

async fn write_loop(
    mut writer: FrameWriter,
    mut outbound: mpsc::Receiver<Frame>,
    closer: CancellationToken,
    metrics: Arc<Metrics>,
) {
    loop {
        let frame = tokio::select! {
            _ = closer.cancelled() => break,
            next = outbound.recv() => match next {
                Some(frame) => frame,
                None => break,
            },
        };
        if let Err(e) = writer.send(frame).await {
            metrics.send_failure();
            warn!(error = %e, "Write failed, closing connection");
            closer.cancel();
            break;
        }
    }
    let _ = writer.close().await;
}
