//! Pub/sub broker
//!
//! Every gateway node subscribes to the shared topics and receives every
//! published payload. Delivery is at-most-once per subscriber; payloads
//! published while a node is not subscribed are lost.

use std::collections::HashMap;

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::StreamExt;
use parking_lot::Mutex;
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Client};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;

use crate::error::Result;

/// Buffered payloads per subscription before the forwarder waits
const SUBSCRIPTION_BUFFER: usize = 1024;

/// Default per-topic capacity of the in-memory broker
pub const DEFAULT_TOPIC_CAPACITY: usize = 1024;

/// Live subscription to one topic
///
/// Dropping it unsubscribes.
pub struct Subscription {
    topic: String,
    rx: mpsc::Receiver<Bytes>,
    task: JoinHandle<()>,
}

impl Subscription {
    /// Topic this subscription listens on
    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// Next payload, or `None` once the subscription has ended
    pub async fn recv(&mut self) -> Option<Bytes> {
        self.rx.recv().await
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.task.abort();
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("topic", &self.topic)
            .finish_non_exhaustive()
    }
}

/// Topic-based publish/subscribe
#[async_trait]
pub trait Broker: Send + Sync {
    /// Publish a payload to every current subscriber of `topic`
    async fn publish(&self, topic: &str, payload: Bytes) -> Result<()>;

    /// Subscribe to `topic`
    ///
    /// The subscription is active once this returns.
    async fn subscribe(&self, topic: &str) -> Result<Subscription>;
}

/// In-process broker for tests and single-node runs
#[derive(Debug)]
pub struct MemoryBroker {
    topics: Mutex<HashMap<String, broadcast::Sender<Bytes>>>,
    capacity: usize,
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_TOPIC_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            topics: Mutex::new(HashMap::new()),
            capacity: capacity.max(1),
        }
    }

    /// Number of live subscribers on `topic`
    pub fn subscriber_count(&self, topic: &str) -> usize {
        self.topics
            .lock()
            .get(topic)
            .map(|tx| tx.receiver_count())
            .unwrap_or(0)
    }
}

impl Default for MemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Broker for MemoryBroker {
    async fn publish(&self, topic: &str, payload: Bytes) -> Result<()> {
        let topics = self.topics.lock();
        if let Some(tx) = topics.get(topic) {
            // No receivers is not an error, same as PUBLISH to an empty channel
            let _ = tx.send(payload);
        }
        Ok(())
    }

    async fn subscribe(&self, topic: &str) -> Result<Subscription> {
        let mut source = {
            let mut topics = self.topics.lock();
            topics
                .entry(topic.to_string())
                .or_insert_with(|| broadcast::channel(self.capacity).0)
                .subscribe()
        };

        let (tx, rx) = mpsc::channel(SUBSCRIPTION_BUFFER);
        let name = topic.to_string();
        let task = tokio::spawn(async move {
            loop {
                match source.recv().await {
                    Ok(payload) => {
                        if tx.send(payload).await.is_err() {
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        tracing::warn!(topic = %name, skipped = skipped, "Subscriber lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });

        Ok(Subscription {
            topic: topic.to_string(),
            rx,
            task,
        })
    }
}

/// Broker backed by Redis PUBLISH/SUBSCRIBE
pub struct RedisBroker {
    client: Client,
    conn: ConnectionManager,
}

impl RedisBroker {
    /// Connect to `url`
    pub async fn connect(url: &str) -> Result<Self> {
        let client = Client::open(url)?;
        Self::from_client(client).await
    }

    pub async fn from_client(client: Client) -> Result<Self> {
        let conn = client.get_connection_manager().await?;
        Ok(Self { client, conn })
    }
}

#[async_trait]
impl Broker for RedisBroker {
    async fn publish(&self, topic: &str, payload: Bytes) -> Result<()> {
        let mut conn = self.conn.clone();
        let _: () = conn.publish(topic, payload.as_ref()).await?;
        Ok(())
    }

    async fn subscribe(&self, topic: &str) -> Result<Subscription> {
        let mut pubsub = self.client.get_async_pubsub().await?;
        pubsub.subscribe(topic).await?;
        tracing::info!(topic = topic, "Subscribed to redis topic");

        let (tx, rx) = mpsc::channel(SUBSCRIPTION_BUFFER);
        let name = topic.to_string();
        let task = tokio::spawn(async move {
            let mut messages = pubsub.into_on_message();
            while let Some(msg) = messages.next().await {
                let payload = Bytes::copy_from_slice(msg.get_payload_bytes());
                if tx.send(payload).await.is_err() {
                    break;
                }
            }
            tracing::info!(topic = %name, "Redis subscription ended");
        });

        Ok(Subscription {
            topic: topic.to_string(),
            rx,
            task,
        })
    }
}
