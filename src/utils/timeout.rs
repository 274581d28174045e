//! Timeout defaults, async timeout wrappers and reconnect backoff.

use crate::error::{ProtocolError, Result};
use std::future::Future;
use std::time::Duration;
use tokio::time::Instant;

/// Default timeout for dialing a peer
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(3);

/// Default time a `send` waits for its response
pub const RESPONSE_TIMEOUT: Duration = Duration::from_secs(10);

/// Default interval between pub/sub presence heartbeats
pub const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(5);

/// Default first delay before a reconnect or resubscribe attempt
pub const RETRY_INITIAL_DELAY: Duration = Duration::from_millis(250);

/// Default ceiling for reconnect backoff
pub const RETRY_MAX_DELAY: Duration = Duration::from_secs(30);

// Stand-in for "never" when a caller asks for a wait longer than the clock can represent.
const FAR_FUTURE: Duration = Duration::from_secs(86_400 * 365 * 30);

/// The instant `timeout` from now, saturating to a far-future deadline instead of overflowing.
pub fn deadline_after(timeout: Duration) -> Instant {
    let now = Instant::now();
    now.checked_add(timeout)
        .or_else(|| now.checked_add(FAR_FUTURE))
        .unwrap_or(now)
}

/// Run a fallible future, failing with [`ProtocolError::Timeout`] when it overruns.
pub async fn with_timeout_error<F, T>(future: F, duration: Duration) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    match tokio::time::timeout(duration, future).await {
        Ok(result) => result,
        Err(_) => Err(ProtocolError::Timeout),
    }
}

/// Exponential backoff: each delay doubles until it reaches the ceiling.
#[derive(Debug, Clone)]
pub struct Backoff {
    initial: Duration,
    max: Duration,
    next: Duration,
    attempts: u32,
}

impl Backoff {
    pub fn new(initial: Duration, max: Duration) -> Self {
        let initial = initial.min(max);
        Self {
            initial,
            max,
            next: initial,
            attempts: 0,
        }
    }

    /// Delay to wait before the next attempt.
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.next;
        self.next = self.next.saturating_mul(2).min(self.max);
        self.attempts = self.attempts.saturating_add(1);
        delay
    }

    /// Number of delays handed out since the last reset.
    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    pub fn reset(&mut self) {
        self.next = self.initial;
        self.attempts = 0;
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Self::new(RETRY_INITIAL_DELAY, RETRY_MAX_DELAY)
    }
}
