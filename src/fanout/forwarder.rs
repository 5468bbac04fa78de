//! Selective forwarding
//!
//! Instead of every node filtering every chat message, each chat session
//! registers its node's subscriber topic in `rc:forward:<channel_id>`. The
//! [`Forwarder`] consumes the shared message topic and republishes each
//! message only to the topics registered for its channel.

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::broker::Broker;
use super::topic::MESSAGE_TOPIC;
use crate::chat::domain::Message;
use crate::error::{Result, ResultExt};
use crate::pool::RetryPolicy;
use crate::store::keys;
use crate::store::CacheStore;
use crate::stats::DeliveryStats;

/// Directory of `(channel, user) -> subscriber topic`
#[derive(Clone)]
pub struct ForwardRepo {
    store: Arc<dyn CacheStore>,
}

impl ForwardRepo {
    pub fn new(store: Arc<dyn CacheStore>) -> Self {
        Self { store }
    }

    /// Route messages of `channel_id` to `subscriber` while `user_id` is
    /// connected there
    pub async fn register_channel_session(
        &self,
        channel_id: u64,
        user_id: u64,
        subscriber: &str,
    ) -> Result<()> {
        self.store
            .hset(&keys::forward(channel_id), &user_id.to_string(), subscriber)
            .await
            .context(format!(
                "register session of user {} in channel {}",
                user_id, channel_id
            ))
    }

    pub async fn remove_channel_session(&self, channel_id: u64, user_id: u64) -> Result<()> {
        self.store
            .hdel(&keys::forward(channel_id), &user_id.to_string())
            .await
            .context(format!(
                "remove session of user {} in channel {}",
                user_id, channel_id
            ))
    }

    /// Distinct subscriber topics of a channel
    pub async fn get_subscribers(&self, channel_id: u64) -> Result<BTreeSet<String>> {
        let sessions = self.store.hgetall(&keys::forward(channel_id)).await?;
        Ok(sessions.into_values().collect())
    }
}

/// Republishes chat messages to the nodes that hold their channel
pub struct Forwarder {
    broker: Arc<dyn Broker>,
    repo: ForwardRepo,
    retry: RetryPolicy,
    stats: Arc<DeliveryStats>,
}

impl Forwarder {
    pub fn new(broker: Arc<dyn Broker>, repo: ForwardRepo) -> Self {
        Self {
            broker,
            repo,
            retry: RetryPolicy::default(),
            stats: Arc::new(DeliveryStats::new()),
        }
    }

    /// Set the retry policy of each subscriber lookup and publish
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn stats(&self) -> &Arc<DeliveryStats> {
        &self.stats
    }

    /// Publish `payload` (an encoded `message`) to each subscriber topic of
    /// its channel
    ///
    /// Each topic is retried on its own; a topic that still fails is logged
    /// and counted as dropped without affecting the others. Returns the
    /// number of topics published to.
    pub async fn forward_message(&self, message: &Message, payload: Bytes) -> Result<usize> {
        let channel_id = message.channel_id;
        let subscribers = self
            .counted(|| self.repo.get_subscribers(channel_id))
            .await
            .context(format!("get subscribers of channel {}", channel_id))?;

        let mut published = 0;
        for topic in &subscribers {
            let sent = self
                .counted(|| self.broker.publish(topic, payload.clone()))
                .await;

            match sent {
                Ok(()) => published += 1,
                Err(e) => {
                    tracing::error!(
                        channel_id = channel_id,
                        topic = %topic,
                        error = %e,
                        "Failed to forward message"
                    );
                    self.stats.record_dropped();
                }
            }
        }

        Ok(published)
    }

    /// Run `op` under the retry policy, counting retries
    async fn counted<T, F, Fut>(&self, mut op: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = Result<T>>,
    {
        let calls = AtomicU64::new(0);
        let result = self
            .retry
            .run(|| {
                calls.fetch_add(1, Ordering::Relaxed);
                op()
            })
            .await;
        self.stats
            .record_retries(calls.load(Ordering::Relaxed).saturating_sub(1));
        result
    }

    /// Consume the shared message topic until `shutdown` is cancelled
    ///
    /// The subscription is active when this returns.
    pub async fn start(self: &Arc<Self>, shutdown: CancellationToken) -> Result<JoinHandle<()>> {
        let mut subscription = self.broker.subscribe(MESSAGE_TOPIC).await?;
        let forwarder = Arc::clone(self);

        Ok(tokio::spawn(async move {
            tracing::info!(topic = MESSAGE_TOPIC, "Forwarder started");

            loop {
                let payload = tokio::select! {
                    _ = shutdown.cancelled() => break,
                    payload = subscription.recv() => match payload {
                        Some(payload) => payload,
                        None => break,
                    },
                };
                forwarder.stats.record_received();

                let message = match Message::decode(&payload) {
                    Ok(message) => message,
                    Err(e) => {
                        tracing::error!(error = %e, "Failed to decode message");
                        forwarder.stats.record_decode_error();
                        continue;
                    }
                };

                match forwarder.forward_message(&message, payload).await {
                    Ok(topics) => forwarder.stats.record_delivered(topics),
                    Err(e) => {
                        tracing::error!(
                            channel_id = message.channel_id,
                            error = %e,
                            "Failed to forward message"
                        );
                        forwarder.stats.record_dropped();
                    }
                }
            }

            tracing::info!(topic = MESSAGE_TOPIC, "Forwarder stopped");
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use async_trait::async_trait;

    use crate::chat::domain::Event;
    use crate::error::Error;
    use crate::fanout::broker::Subscription;
    use crate::fanout::topic::node_subscriber;
    use crate::fanout::MemoryBroker;
    use crate::store::MemoryStore;

    /// Fails publishes to one topic a fixed number of times
    struct FlakyBroker {
        inner: MemoryBroker,
        topic: String,
        failures: AtomicU64,
    }

    #[async_trait]
    impl Broker for FlakyBroker {
        async fn publish(&self, topic: &str, payload: Bytes) -> Result<()> {
            if topic == self.topic {
                let left = self.failures.load(Ordering::SeqCst);
                if left > 0 {
                    self.failures.store(left - 1, Ordering::SeqCst);
                    return Err(Error::Broker("connection reset".into()));
                }
            }
            self.inner.publish(topic, payload).await
        }

        async fn subscribe(&self, topic: &str) -> Result<Subscription> {
            self.inner.subscribe(topic).await
        }
    }

    async fn flaky_setup(failures: u64) -> (Forwarder, Subscription, Subscription) {
        let gw1 = node_subscriber("gw-1");
        let gw2 = node_subscriber("gw-2");
        let broker = Arc::new(FlakyBroker {
            inner: MemoryBroker::new(),
            topic: gw1.clone(),
            failures: AtomicU64::new(failures),
        });
        let sub1 = broker.subscribe(&gw1).await.unwrap();
        let sub2 = broker.subscribe(&gw2).await.unwrap();

        let repo = ForwardRepo::new(Arc::new(MemoryStore::new()));
        repo.register_channel_session(5, 10, &gw1).await.unwrap();
        repo.register_channel_session(5, 11, &gw2).await.unwrap();

        (Forwarder::new(broker, repo), sub1, sub2)
    }

    async fn recv(sub: &mut Subscription) -> Bytes {
        tokio::time::timeout(Duration::from_secs(1), sub.recv())
            .await
            .unwrap()
            .unwrap()
    }

    fn message(channel_id: u64) -> Message {
        Message {
            message_id: 1,
            event: Event::Text,
            channel_id,
            user_id: 1,
            payload: "hi".into(),
            seen: false,
            time: 0,
        }
    }

    #[tokio::test]
    async fn test_subscribers_are_distinct() {
        let repo = ForwardRepo::new(Arc::new(MemoryStore::new()));
        let gw1 = node_subscriber("gw-1");
        let gw2 = node_subscriber("gw-2");

        repo.register_channel_session(1, 10, &gw1).await.unwrap();
        repo.register_channel_session(1, 11, &gw1).await.unwrap();
        repo.register_channel_session(1, 12, &gw2).await.unwrap();
        assert_eq!(repo.get_subscribers(1).await.unwrap().len(), 2);

        repo.remove_channel_session(1, 12).await.unwrap();
        let subs = repo.get_subscribers(1).await.unwrap();
        assert_eq!(subs.into_iter().collect::<Vec<_>>(), vec![gw1]);
        assert!(repo.get_subscribers(2).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_forward_only_to_registered_nodes() {
        let broker = Arc::new(MemoryBroker::new());
        let repo = ForwardRepo::new(Arc::new(MemoryStore::new()));
        let forwarder = Arc::new(Forwarder::new(broker.clone(), repo.clone()));

        let gw1 = node_subscriber("gw-1");
        let gw2 = node_subscriber("gw-2");
        let mut sub1 = broker.subscribe(&gw1).await.unwrap();
        let mut sub2 = broker.subscribe(&gw2).await.unwrap();
        repo.register_channel_session(5, 10, &gw1).await.unwrap();

        let shutdown = CancellationToken::new();
        let handle = forwarder.start(shutdown.clone()).await.unwrap();

        let payload = Bytes::from(message(5).encode().unwrap());
        broker.publish(MESSAGE_TOPIC, payload.clone()).await.unwrap();

        let got = tokio::time::timeout(Duration::from_secs(1), sub1.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(got, payload);

        shutdown.cancel();
        handle.await.unwrap();

        assert!(tokio::time::timeout(Duration::from_millis(20), sub2.recv())
            .await
            .is_err());
        assert_eq!(forwarder.stats().snapshot().delivered, 1);
    }

    #[tokio::test]
    async fn test_publish_failure_is_retried_per_topic() {
        let (forwarder, mut sub1, mut sub2) = flaky_setup(1).await;
        let payload = Bytes::from(message(5).encode().unwrap());

        let published = forwarder.forward_message(&message(5), payload.clone()).await;
        assert_eq!(published.unwrap(), 2);
        assert_eq!(recv(&mut sub1).await, payload);
        assert_eq!(recv(&mut sub2).await, payload);

        let snap = forwarder.stats().snapshot();
        assert_eq!(snap.retried, 1);
        assert_eq!(snap.dropped, 0);
    }

    #[tokio::test]
    async fn test_failed_topic_does_not_block_others() {
        let (forwarder, mut sub1, mut sub2) = flaky_setup(u64::MAX).await;
        let payload = Bytes::from(message(5).encode().unwrap());

        let published = forwarder.forward_message(&message(5), payload.clone()).await;
        assert_eq!(published.unwrap(), 1);
        assert_eq!(recv(&mut sub2).await, payload);
        assert!(tokio::time::timeout(Duration::from_millis(20), sub1.recv())
            .await
            .is_err());

        let snap = forwarder.stats().snapshot();
        assert_eq!(snap.dropped, 1);
        assert_eq!(snap.retried, 2);
    }
}
