//! # Transports
//!
//! Two interchangeable ways of moving envelopes between servers:
//!
//! - [`pubsub::PubSubTransport`]: every server publishes to and subscribes on one shared
//!   channel of a [`bus::MessageBus`]. Sends resolve as soon as the message is queued.
//! - [`socket::SocketTransport`]: long-lived TCP links to statically configured peers, with
//!   responses correlated back to the caller.
//!
//! Both implement [`Transport`], so application code can switch between them without
//! changing how it builds and sends packets.

pub mod bus;
pub mod pending;
pub mod pubsub;
pub mod socket;

use crate::config::MessagingConfig;
use crate::error::{DecodeError, ProtocolError, Result};
use crate::protocol::envelope::Envelope;
use crate::protocol::packet::Packet;
use crate::protocol::signing::EnvelopeSigner;
use crate::utils::dedup::DedupCache;
use crate::utils::metrics::Metrics;
use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{debug, warn};

pub use pending::PendingResponse;

/// The send/peers contract shared by every transport.
pub trait Transport: Send + Sync {
    /// Server name this transport sends as.
    fn identity(&self) -> &str;

    /// Deadline applied by [`Transport::send`].
    fn default_timeout(&self) -> Duration;

    /// Transmit an envelope built by this server.
    ///
    /// Fails synchronously with [`ProtocolError::SenderMismatch`] if the envelope was built
    /// for another identity, [`ProtocolError::NoConnection`] if the destination is
    /// unreachable right now, or [`ProtocolError::Backpressure`] when the outbound queue is
    /// full. Everything after that point is reported through the returned future.
    fn send_envelope(&self, envelope: Envelope, timeout: Duration) -> Result<PendingResponse>;

    /// Best-effort snapshot of the peers currently reachable.
    fn connected_peers(&self) -> HashSet<String>;

    /// Stop every background flow. Idempotent.
    fn shutdown(&self);

    fn envelope_for<P: Packet>(&self, packet: &P) -> Result<Envelope>
    where
        Self: Sized,
    {
        Envelope::new(packet, self.identity())
    }

    fn send<P: Packet>(&self, packet: &P) -> Result<PendingResponse>
    where
        Self: Sized,
    {
        self.send_with_timeout(packet, self.default_timeout())
    }

    fn send_with_timeout<P: Packet>(&self, packet: &P, timeout: Duration) -> Result<PendingResponse>
    where
        Self: Sized,
    {
        let envelope = self.envelope_for(packet)?;
        self.send_envelope(envelope, timeout)
    }
}

pub(crate) fn check_sender(identity: &str, envelope: &Envelope) -> Result<()> {
    if envelope.sender() != identity {
        return Err(ProtocolError::SenderMismatch {
            expected: identity.to_string(),
            found: envelope.sender().to_string(),
        });
    }
    Ok(())
}

/// Checks applied to every envelope before it reaches the dispatcher, and the matching
/// signing step for envelopes leaving this process.
pub struct InboundGate {
    signer: Option<EnvelopeSigner>,
    max_age: Duration,
    dedup: Mutex<DedupCache>,
    metrics: Arc<Metrics>,
}

impl InboundGate {
    pub fn new(
        signer: Option<EnvelopeSigner>,
        window: Duration,
        capacity: usize,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            signer,
            max_age: window,
            dedup: Mutex::new(DedupCache::with_settings(window, capacity)),
            metrics,
        }
    }

    pub fn from_config(config: &MessagingConfig, metrics: Arc<Metrics>) -> Result<Self> {
        let signer = match &config.identity.shared_secret {
            Some(secret) => Some(EnvelopeSigner::new(secret)?),
            None => None,
        };
        Ok(Self::new(
            signer,
            config.dispatch.dedup_window,
            config.dispatch.dedup_capacity,
            metrics,
        ))
    }

    pub fn is_signing(&self) -> bool {
        self.signer.is_some()
    }

    /// Sign an outgoing envelope if a secret is configured.
    pub fn seal(&self, envelope: Envelope) -> Result<Envelope> {
        match &self.signer {
            Some(signer) => signer.sign(envelope),
            None => Ok(envelope),
        }
    }

    /// Decide whether an incoming envelope may be dispatched.
    ///
    /// `Ok(false)` means the envelope is a duplicate of one already admitted and should be
    /// dropped silently. Authentication failures come back as errors.
    pub fn admit(&self, envelope: &Envelope) -> std::result::Result<bool, DecodeError> {
        if let Some(signer) = &self.signer {
            if let Err(e) = signer.verify(envelope) {
                self.metrics.decode_error();
                return Err(e);
            }
            if u128::from(envelope.age_millis()) > self.max_age.as_millis() {
                self.metrics.decode_error();
                return Err(DecodeError::StaleEnvelope);
            }
        }

        let duplicate = match self.dedup.lock() {
            Ok(mut cache) => cache.is_duplicate(envelope.sender(), envelope.id()),
            Err(_) => {
                warn!("Dedup cache lock poisoned, admitting envelope");
                false
            }
        };
        if duplicate {
            self.metrics.duplicate_dropped();
            debug!(sender = envelope.sender(), id = envelope.id(), "Dropped duplicate envelope");
            return Ok(false);
        }
        Ok(true)
    }
}

impl std::fmt::Debug for InboundGate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InboundGate")
            .field("signing", &self.signer.is_some())
            .field("max_age", &self.max_age)
            .finish_non_exhaustive()
    }
}
