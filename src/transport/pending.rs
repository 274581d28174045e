//! Response correlation for point-to-point sends.

use crate::error::constants::{ERR_CONNECTION_LOST, ERR_RESPONSE_DROPPED};
use crate::protocol::response::Response;
use crate::utils::metrics::Metrics;
use crate::utils::timeout::deadline_after;
use futures::future::BoxFuture;
use futures::FutureExt;
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex, Weak};
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::time::Instant;
use tracing::trace;

/// The eventual result of a `send`.
///
/// Resolves exactly once: with the peer's response, with a synthetic `SUCCESS` for
/// fire-and-forget sends, with `ERROR` if the connection died first, or with `TIMEOUT` once
/// the deadline fixed at send time passes. Dropping it abandons the wait and frees the
/// correlation slot.
pub struct PendingResponse {
    inner: BoxFuture<'static, Response>,
}

impl PendingResponse {
    /// Already-resolved response.
    pub fn ready(response: Response) -> Self {
        Self {
            inner: futures::future::ready(response).boxed(),
        }
    }

    fn awaiting(
        rx: oneshot::Receiver<Response>,
        deadline: Instant,
        guard: SlotGuard,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            inner: async move {
                let _guard = guard;
                match tokio::time::timeout_at(deadline, rx).await {
                    Ok(Ok(response)) => response,
                    Ok(Err(_)) => Response::error(ERR_RESPONSE_DROPPED),
                    Err(_) => {
                        metrics.timeout();
                        Response::timeout()
                    }
                }
            }
            .boxed(),
        }
    }
}

impl Future for PendingResponse {
    type Output = Response;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Response> {
        self.inner.as_mut().poll(cx)
    }
}

impl std::fmt::Debug for PendingResponse {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PendingResponse").finish_non_exhaustive()
    }
}

/// What became of a response handed to [`PendingReplies::complete`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Completion {
    Delivered,
    /// Nobody is waiting: the request timed out, was abandoned or never existed.
    Unclaimed,
    /// A request with this id is waiting, but on a different connection.
    WrongConnection,
}

struct Slot {
    connection: u64,
    tx: oneshot::Sender<Response>,
}

type SlotTable = Mutex<HashMap<u64, Slot>>;

/// Removes an abandoned slot when its `PendingResponse` goes away.
struct SlotGuard {
    table: Weak<SlotTable>,
    id: u64,
}

impl Drop for SlotGuard {
    fn drop(&mut self) {
        if let Some(table) = self.table.upgrade() {
            if let Ok(mut slots) = table.lock() {
                slots.remove(&self.id);
            }
        }
    }
}

/// In-flight requests keyed by envelope id.
#[derive(Default)]
pub struct PendingReplies {
    slots: Arc<SlotTable>,
}

impl PendingReplies {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reserve a slot for `id`, sent over `connection`, and return the future that will
    /// observe it.
    pub fn register(
        &self,
        id: u64,
        connection: u64,
        timeout: Duration,
        metrics: Arc<Metrics>,
    ) -> PendingResponse {
        let deadline = deadline_after(timeout);
        let (tx, rx) = oneshot::channel();
        if let Ok(mut slots) = self.slots.lock() {
            slots.insert(id, Slot { connection, tx });
        }
        let guard = SlotGuard {
            table: Arc::downgrade(&self.slots),
            id,
        };
        PendingResponse::awaiting(rx, deadline, guard, metrics)
    }

    /// Deliver a response that arrived on `connection`.
    ///
    /// Only the connection the request went out on may answer it; a reply from any other
    /// connection leaves the slot untouched.
    pub fn complete(&self, id: u64, connection: u64, response: Response) -> Completion {
        let slot = match self.slots.lock() {
            Ok(mut slots) => match slots.get(&id).map(|slot| slot.connection) {
                Some(owner) if owner == connection => slots.remove(&id),
                Some(_) => return Completion::WrongConnection,
                None => None,
            },
            Err(_) => None,
        };
        let delivered = match slot {
            Some(slot) => slot.tx.send(response).is_ok(),
            None => false,
        };
        if delivered {
            Completion::Delivered
        } else {
            trace!(id, "Reply without a waiting sender");
            Completion::Unclaimed
        }
    }

    /// Resolve every request sent over `connection` with an error.
    pub fn fail_connection(&self, connection: u64) -> usize {
        let failed: Vec<Slot> = match self.slots.lock() {
            Ok(mut slots) => {
                let ids: Vec<u64> = slots
                    .iter()
                    .filter(|(_, slot)| slot.connection == connection)
                    .map(|(id, _)| *id)
                    .collect();
                ids.iter().filter_map(|id| slots.remove(id)).collect()
            }
            Err(_) => Vec::new(),
        };

        let count = failed.len();
        for slot in failed {
            let _ = slot.tx.send(Response::error(ERR_CONNECTION_LOST));
        }
        count
    }

    pub fn len(&self) -> usize {
        self.slots.lock().map(|s| s.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
