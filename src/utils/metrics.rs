//! Observability and Metrics
//!
//! Counters for envelope traffic, dispatch outcomes and connection churn.
//!
//! Each transport owns one [`Metrics`] instance behind an `Arc` and shares it with its
//! dispatcher, so two messaging stacks in the same process report independently.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;
use tracing::{debug, info};

#[derive(Debug)]
pub struct Metrics {
    /// Envelopes handed to a transport for sending
    pub envelopes_sent: AtomicU64,
    /// Envelopes received and admitted for dispatch
    pub envelopes_received: AtomicU64,
    /// Total bytes written
    pub bytes_sent: AtomicU64,
    /// Total bytes read
    pub bytes_received: AtomicU64,
    /// Frames or envelopes that failed to decode or verify
    pub decode_errors: AtomicU64,
    /// Handler errors and panics
    pub handler_errors: AtomicU64,
    /// Envelopes with no registered handler
    pub no_handler: AtomicU64,
    /// Envelopes dropped as duplicates
    pub duplicates_dropped: AtomicU64,
    /// Sends that ended in a timeout response
    pub timeouts: AtomicU64,
    /// Total connections or subscriptions established
    pub connections_total: AtomicU64,
    /// Currently active connections or subscriptions
    pub connections_active: AtomicU64,
    /// Reconnect or resubscribe attempts
    pub reconnect_attempts: AtomicU64,
    /// Failed publishes or writes
    pub send_failures: AtomicU64,
    start_time: Instant,
}

impl Metrics {
    pub fn new() -> Self {
        Self {
            envelopes_sent: AtomicU64::new(0),
            envelopes_received: AtomicU64::new(0),
            bytes_sent: AtomicU64::new(0),
            bytes_received: AtomicU64::new(0),
            decode_errors: AtomicU64::new(0),
            handler_errors: AtomicU64::new(0),
            no_handler: AtomicU64::new(0),
            duplicates_dropped: AtomicU64::new(0),
            timeouts: AtomicU64::new(0),
            connections_total: AtomicU64::new(0),
            connections_active: AtomicU64::new(0),
            reconnect_attempts: AtomicU64::new(0),
            send_failures: AtomicU64::new(0),
            start_time: Instant::now(),
        }
    }

    pub fn envelope_sent(&self, byte_count: u64) {
        self.envelopes_sent.fetch_add(1, Ordering::Relaxed);
        self.bytes_sent.fetch_add(byte_count, Ordering::Relaxed);
    }

    pub fn envelope_received(&self, byte_count: u64) {
        self.envelopes_received.fetch_add(1, Ordering::Relaxed);
        self.bytes_received.fetch_add(byte_count, Ordering::Relaxed);
    }

    pub fn decode_error(&self) {
        self.decode_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn handler_error(&self) {
        self.handler_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn no_handler(&self) {
        self.no_handler.fetch_add(1, Ordering::Relaxed);
    }

    pub fn duplicate_dropped(&self) {
        self.duplicates_dropped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn timeout(&self) {
        self.timeouts.fetch_add(1, Ordering::Relaxed);
    }

    pub fn connection_established(&self) {
        self.connections_total.fetch_add(1, Ordering::Relaxed);
        self.connections_active.fetch_add(1, Ordering::Relaxed);
    }

    pub fn connection_closed(&self) {
        self.connections_active.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn reconnect_attempt(&self) {
        self.reconnect_attempts.fetch_add(1, Ordering::Relaxed);
    }

    pub fn send_failure(&self) {
        self.send_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            envelopes_sent: self.envelopes_sent.load(Ordering::Relaxed),
            envelopes_received: self.envelopes_received.load(Ordering::Relaxed),
            bytes_sent: self.bytes_sent.load(Ordering::Relaxed),
            bytes_received: self.bytes_received.load(Ordering::Relaxed),
            decode_errors: self.decode_errors.load(Ordering::Relaxed),
            handler_errors: self.handler_errors.load(Ordering::Relaxed),
            no_handler: self.no_handler.load(Ordering::Relaxed),
            duplicates_dropped: self.duplicates_dropped.load(Ordering::Relaxed),
            timeouts: self.timeouts.load(Ordering::Relaxed),
            connections_total: self.connections_total.load(Ordering::Relaxed),
            connections_active: self.connections_active.load(Ordering::Relaxed),
            reconnect_attempts: self.reconnect_attempts.load(Ordering::Relaxed),
            send_failures: self.send_failures.load(Ordering::Relaxed),
            uptime_seconds: self.start_time.elapsed().as_secs(),
        }
    }

    pub fn log_metrics(&self) {
        let snapshot = self.snapshot();
        info!(
            envelopes_sent = snapshot.envelopes_sent,
            envelopes_received = snapshot.envelopes_received,
            bytes_sent = snapshot.bytes_sent,
            bytes_received = snapshot.bytes_received,
            decode_errors = snapshot.decode_errors,
            handler_errors = snapshot.handler_errors,
            no_handler = snapshot.no_handler,
            duplicates_dropped = snapshot.duplicates_dropped,
            timeouts = snapshot.timeouts,
            connections_total = snapshot.connections_total,
            connections_active = snapshot.connections_active,
            reconnect_attempts = snapshot.reconnect_attempts,
            send_failures = snapshot.send_failures,
            uptime_seconds = snapshot.uptime_seconds,
            "Messaging metrics snapshot"
        );
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Snapshot of metrics at a point in time
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MetricsSnapshot {
    pub envelopes_sent: u64,
    pub envelopes_received: u64,
    pub bytes_sent: u64,
    pub bytes_received: u64,
    pub decode_errors: u64,
    pub handler_errors: u64,
    pub no_handler: u64,
    pub duplicates_dropped: u64,
    pub timeouts: u64,
    pub connections_total: u64,
    pub connections_active: u64,
    pub reconnect_attempts: u64,
    pub send_failures: u64,
    pub uptime_seconds: u64,
}

/// Timer for measuring operation duration
pub struct Timer {
    start: Instant,
    operation: &'static str,
}

impl Timer {
    pub fn start(operation: &'static str) -> Self {
        Self {
            start: Instant::now(),
            operation,
        }
    }
}

impl Drop for Timer {
    fn drop(&mut self) {
        let duration = self.start.elapsed();
        debug!(
            operation = self.operation,
            duration_us = duration.as_micros() as u64,
            "Operation completed"
        );
    }
}
