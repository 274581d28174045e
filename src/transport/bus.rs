//! Publish/subscribe backends for [`PubSubTransport`](super::pubsub::PubSubTransport).

use crate::config::PubSubConfig;
use crate::error::{ProtocolError, Result};
use async_trait::async_trait;
use futures::stream::BoxStream;
use futures::StreamExt;
use redis::aio::MultiplexedConnection;
use redis::AsyncCommands;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use tokio::sync::broadcast;
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;
use tokio_stream::wrappers::BroadcastStream;
use tracing::{debug, warn};

/// A message bus with named channels.
///
/// A subscription stream ending means the subscription was lost; the caller decides whether
/// to subscribe again.
#[async_trait]
pub trait MessageBus: Send + Sync {
    async fn publish(&self, channel: &str, payload: Vec<u8>) -> Result<()>;

    async fn subscribe(&self, channel: &str) -> Result<BoxStream<'static, Vec<u8>>>;
}

/// A lazily opened connection shared by concurrent callers.
///
/// The lock only guards the cached handle. Dialing happens outside it, so a slow dial never
/// stalls callers that could use an already cached connection or are racing to open one.
#[derive(Debug)]
struct CachedConnection<C> {
    slot: Mutex<Option<C>>,
}

impl<C: Clone> CachedConnection<C> {
    fn new() -> Self {
        Self {
            slot: Mutex::new(None),
        }
    }

    fn cached(&self) -> Option<C> {
        self.slot.lock().ok().and_then(|slot| slot.clone())
    }

    async fn get_or_dial<F, Fut>(&self, dial: F) -> Result<C>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<C>>,
    {
        if let Some(conn) = self.cached() {
            return Ok(conn);
        }

        let dialed = dial().await?;
        let mut slot = self
            .slot
            .lock()
            .map_err(|_| ProtocolError::TransportError("Connection cache poisoned".to_string()))?;
        // A concurrent dial may have won the race; keep its connection.
        Ok(slot.get_or_insert(dialed).clone())
    }

    fn reset(&self) {
        if let Ok(mut slot) = self.slot.lock() {
            slot.take();
        }
    }
}

/// Redis (or Valkey) pub/sub.
pub struct RedisBus {
    client: redis::Client,
    publisher: CachedConnection<MultiplexedConnection>,
}

impl RedisBus {
    pub fn new(config: &PubSubConfig) -> Result<Self> {
        let client = redis::Client::open(config.url())
            .map_err(|e| ProtocolError::ConfigError(format!("Invalid bus address: {e}")))?;
        Ok(Self {
            client,
            publisher: CachedConnection::new(),
        })
    }

    async fn publisher(&self) -> Result<MultiplexedConnection> {
        self.publisher
            .get_or_dial(|| async {
                let conn = self
                    .client
                    .get_multiplexed_async_connection()
                    .await
                    .map_err(|e| ProtocolError::TransportError(e.to_string()))?;
                debug!("Opened publish connection");
                Ok(conn)
            })
            .await
    }
}

#[async_trait]
impl MessageBus for RedisBus {
    async fn publish(&self, channel: &str, payload: Vec<u8>) -> Result<()> {
        let mut conn = self.publisher().await?;
        if let Err(e) = conn.publish::<_, _, ()>(channel, payload).await {
            // Force a fresh connection on the next publish.
            self.publisher.reset();
            return Err(ProtocolError::TransportError(e.to_string()));
        }
        Ok(())
    }

    async fn subscribe(&self, channel: &str) -> Result<BoxStream<'static, Vec<u8>>> {
        let mut pubsub = self
            .client
            .get_async_pubsub()
            .await
            .map_err(|e| ProtocolError::TransportError(e.to_string()))?;
        pubsub
            .subscribe(channel)
            .await
            .map_err(|e| ProtocolError::TransportError(e.to_string()))?;

        Ok(pubsub
            .into_on_message()
            .map(|msg| msg.get_payload_bytes().to_vec())
            .boxed())
    }
}

impl std::fmt::Debug for RedisBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisBus").finish_non_exhaustive()
    }
}

/// In-process bus for tests and single-host deployments.
///
/// [`MemoryBus::sever`] ends every open subscription and [`MemoryBus::set_available`] makes
/// the bus refuse new operations, which together simulate a broker outage.
#[derive(Debug)]
pub struct MemoryBus {
    sender: Mutex<broadcast::Sender<(String, Vec<u8>)>>,
    capacity: usize,
    available: AtomicBool,
}

impl Default for MemoryBus {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryBus {
    pub fn new() -> Self {
        Self::with_capacity(1024)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self {
            sender: Mutex::new(sender),
            capacity: capacity.max(1),
            available: AtomicBool::new(true),
        }
    }

    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    pub fn is_available(&self) -> bool {
        self.available.load(Ordering::SeqCst)
    }

    /// Drop every current subscription.
    pub fn sever(&self) {
        if let Ok(mut sender) = self.sender.lock() {
            *sender = broadcast::channel(self.capacity).0;
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.lock().map(|s| s.receiver_count()).unwrap_or(0)
    }

    fn ensure_available(&self) -> Result<()> {
        if self.is_available() {
            Ok(())
        } else {
            Err(ProtocolError::TransportError("Bus unavailable".to_string()))
        }
    }
}

#[async_trait]
impl MessageBus for MemoryBus {
    async fn publish(&self, channel: &str, payload: Vec<u8>) -> Result<()> {
        self.ensure_available()?;
        let sender = self
            .sender
            .lock()
            .map_err(|_| ProtocolError::TransportError("Bus lock poisoned".to_string()))?;
        // No subscribers is not an error on a real broker either.
        let _ = sender.send((channel.to_string(), payload));
        Ok(())
    }

    async fn subscribe(&self, channel: &str) -> Result<BoxStream<'static, Vec<u8>>> {
        self.ensure_available()?;
        let receiver = self
            .sender
            .lock()
            .map_err(|_| ProtocolError::TransportError("Bus lock poisoned".to_string()))?
            .subscribe();

        let wanted = channel.to_string();
        Ok(BroadcastStream::new(receiver)
            .filter_map(move |item| {
                let keep = match item {
                    Ok((channel, payload)) if channel == wanted => Some(payload),
                    Ok(_) => None,
                    Err(BroadcastStreamRecvError::Lagged(skipped)) => {
                        warn!(skipped, "Subscriber lagged, messages lost");
                        None
                    }
                };
                futures::future::ready(keep)
            })
            .boxed())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    #[allow(clippy::unwrap_used)]
    async fn subscribers_only_see_their_channel() {
        let bus = MemoryBus::new();
        let mut stream = bus.subscribe("alpha").await.unwrap();

        bus.publish("beta", b"ignored".to_vec()).await.unwrap();
        bus.publish("alpha", b"hello".to_vec()).await.unwrap();

        let got = tokio::time::timeout(Duration::from_secs(1), stream.next())
            .await
            .unwrap();
        assert_eq!(got, Some(b"hello".to_vec()));
    }

    #[tokio::test]
    #[allow(clippy::unwrap_used)]
    async fn sever_ends_streams_and_outage_refuses_operations() {
        let bus = MemoryBus::new();
        let mut stream = bus.subscribe("alpha").await.unwrap();
        bus.sever();
        let ended = tokio::time::timeout(Duration::from_secs(1), stream.next())
            .await
            .unwrap();
        assert_eq!(ended, None);

        bus.set_available(false);
        assert!(bus.subscribe("alpha").await.is_err());
        assert!(bus.publish("alpha", vec![1]).await.is_err());
    }

    #[tokio::test]
    #[allow(clippy::unwrap_used)]
    async fn slow_dial_does_not_block_other_callers() {
        let cache = std::sync::Arc::new(CachedConnection::<u32>::new());
        let (release, hold) = tokio::sync::oneshot::channel::<()>();

        let slow = tokio::spawn({
            let cache = std::sync::Arc::clone(&cache);
            async move {
                cache
                    .get_or_dial(|| async move {
                        let _ = hold.await;
                        Ok(1)
                    })
                    .await
            }
        });
        tokio::task::yield_now().await;

        // The first dial is still parked; a second caller must get through regardless.
        let fast = tokio::time::timeout(
            Duration::from_secs(1),
            cache.get_or_dial(|| async { Ok(2) }),
        )
        .await
        .unwrap()
        .unwrap();
        assert_eq!(fast, 2);

        release.send(()).unwrap();
        // The slow dial loses the race and adopts the cached connection.
        assert_eq!(slow.await.unwrap().unwrap(), 2);
        assert_eq!(cache.cached(), Some(2));

        cache.reset();
        assert_eq!(cache.cached(), None);
    }

    #[tokio::test]
    async fn failed_dial_leaves_nothing_cached() {
        let cache = CachedConnection::<u32>::new();
        let result = cache
            .get_or_dial(|| async { Err(ProtocolError::TransportError("refused".into())) })
            .await;
        assert!(result.is_err());
        assert_eq!(cache.cached(), None);
    }
}
