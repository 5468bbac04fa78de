//! Broadcast-and-filter subscribers
//!
//! Every gateway node runs one [`MatchSubscriber`] and one
//! [`MessageSubscriber`]. Each consumes its topic, decodes payloads and
//! hands delivery to a [`WorkerPool`]. A pool task selects the local
//! sessions the payload is meant for and queues it on them; sessions on
//! other nodes are ignored here and served by those nodes' subscribers.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::broker::{Broker, Subscription};
use super::topic::MATCH_TOPIC;
use crate::chat::domain::Message;
use crate::error::Result;
use crate::matching::{MatchResult, MembershipWriter};
use crate::pool::{PoolOptions, RetryPolicy, Task, WorkerPool};
use crate::session::SessionRegistry;
use crate::stats::DeliveryStats;

/// Worker and retry settings of a subscriber
#[derive(Debug, Clone, Copy, Default)]
pub struct SubscriberOptions {
    /// Delivery workers (0 = available parallelism)
    pub workers: usize,
    /// Retry policy for membership writes during match delivery
    pub retry: RetryPolicy,
}

impl SubscriberOptions {
    pub fn workers(mut self, workers: usize) -> Self {
        self.workers = workers;
        self
    }

    pub fn retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }
}

/// Delivers match results to the two matched users' sessions
pub struct MatchSubscriber {
    broker: Arc<dyn Broker>,
    sessions: Arc<SessionRegistry>,
    membership: Arc<dyn MembershipWriter>,
    options: SubscriberOptions,
    stats: Arc<DeliveryStats>,
}

impl MatchSubscriber {
    pub fn new(
        broker: Arc<dyn Broker>,
        sessions: Arc<SessionRegistry>,
        membership: Arc<dyn MembershipWriter>,
        options: SubscriberOptions,
    ) -> Self {
        Self {
            broker,
            sessions,
            membership,
            options,
            stats: Arc::new(DeliveryStats::new()),
        }
    }

    /// Delivery counters
    pub fn stats(&self) -> &Arc<DeliveryStats> {
        &self.stats
    }

    /// Subscribe to the match topic and start delivering
    ///
    /// The subscription is active when this returns. The returned task ends
    /// when `shutdown` is cancelled, after in-flight deliveries finish.
    pub async fn start(&self, shutdown: CancellationToken) -> Result<JoinHandle<()>> {
        let subscription = self.broker.subscribe(MATCH_TOPIC).await?;
        let pool = WorkerPool::new(&shutdown, PoolOptions::default().workers(self.options.workers));
        pool.start();

        let sessions = Arc::clone(&self.sessions);
        let membership = Arc::clone(&self.membership);
        let retry = self.options.retry;
        let stats = Arc::clone(&self.stats);

        Ok(tokio::spawn(async move {
            let task_stats = Arc::clone(&stats);
            consume(subscription, pool, shutdown, stats, move |payload| {
                let result = match MatchResult::decode(&payload) {
                    Ok(result) => result,
                    Err(e) => {
                        tracing::error!(error = %e, "Failed to decode match result");
                        task_stats.record_decode_error();
                        return None;
                    }
                };
                Some(Task::detached(deliver_match_result(
                    Arc::clone(&sessions),
                    Arc::clone(&membership),
                    retry,
                    Arc::clone(&task_stats),
                    result,
                )))
            })
            .await;
        }))
    }
}

/// Delivers chat messages to the sessions attached to their channel
pub struct MessageSubscriber {
    broker: Arc<dyn Broker>,
    sessions: Arc<SessionRegistry>,
    topic: String,
    options: SubscriberOptions,
    stats: Arc<DeliveryStats>,
}

impl MessageSubscriber {
    /// Subscriber on `topic`: the shared message topic, or this node's
    /// forwarding topic when selective forwarding is on
    pub fn new(
        broker: Arc<dyn Broker>,
        sessions: Arc<SessionRegistry>,
        topic: impl Into<String>,
        options: SubscriberOptions,
    ) -> Self {
        Self {
            broker,
            sessions,
            topic: topic.into(),
            options,
            stats: Arc::new(DeliveryStats::new()),
        }
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// Delivery counters
    pub fn stats(&self) -> &Arc<DeliveryStats> {
        &self.stats
    }

    /// Subscribe and start delivering; see [`MatchSubscriber::start`]
    pub async fn start(&self, shutdown: CancellationToken) -> Result<JoinHandle<()>> {
        let subscription = self.broker.subscribe(&self.topic).await?;
        let pool = WorkerPool::new(&shutdown, PoolOptions::default().workers(self.options.workers));
        pool.start();

        let sessions = Arc::clone(&self.sessions);
        let stats = Arc::clone(&self.stats);

        Ok(tokio::spawn(async move {
            let task_stats = Arc::clone(&stats);
            consume(subscription, pool, shutdown, stats, move |payload| {
                let message = match Message::decode(&payload) {
                    Ok(message) => message,
                    Err(e) => {
                        tracing::error!(error = %e, "Failed to decode message");
                        task_stats.record_decode_error();
                        return None;
                    }
                };
                let sessions = Arc::clone(&sessions);
                let stats = Arc::clone(&task_stats);
                Some(Task::detached(async move {
                    deliver_message(&sessions, &stats, message)
                }))
            })
            .await;
        }))
    }
}

async fn consume<F>(
    mut subscription: Subscription,
    pool: WorkerPool,
    shutdown: CancellationToken,
    stats: Arc<DeliveryStats>,
    mut to_task: F,
) where
    F: FnMut(Bytes) -> Option<Task>,
{
    tracing::info!(topic = subscription.topic(), "Subscriber started");

    loop {
        let payload = tokio::select! {
            _ = shutdown.cancelled() => break,
            payload = subscription.recv() => match payload {
                Some(payload) => payload,
                None => {
                    tracing::warn!(topic = subscription.topic(), "Subscription closed");
                    break;
                }
            },
        };

        stats.record_received();
        if let Some(task) = to_task(payload) {
            if !pool.submit(task).await {
                stats.record_dropped();
            }
        }
    }

    pool.stop().await;
    tracing::info!(topic = subscription.topic(), "Subscriber stopped");
}

async fn deliver_match_result(
    sessions: Arc<SessionRegistry>,
    membership: Arc<dyn MembershipWriter>,
    retry: RetryPolicy,
    stats: Arc<DeliveryStats>,
    result: MatchResult,
) {
    let payload = match result.to_presenter().encode() {
        Ok(payload) => Bytes::from(payload),
        Err(e) => {
            tracing::error!(error = %e, "Failed to encode match result");
            stats.record_dropped();
            return;
        }
    };

    let users = result.users();
    let channel_id = result.channel_id;
    let membership = &*membership;

    for session in sessions.select(|attrs| attrs.is_matching_user(&users)) {
        let user_id = session.attrs().user_id;
        let calls = AtomicU64::new(0);
        let calls = &calls;

        let added = retry
            .run(move || {
                calls.fetch_add(1, Ordering::Relaxed);
                membership.add_user_to_channel(channel_id, user_id)
            })
            .await;
        stats.record_retries(calls.load(Ordering::Relaxed).saturating_sub(1));

        if let Err(e) = added {
            tracing::error!(
                channel_id = channel_id,
                user_id = user_id,
                error = %e,
                "Failed to add matched user to channel"
            );
            stats.record_dropped();
            continue;
        }

        if session.send(payload.clone()) {
            stats.record_delivered(1);
        } else {
            sessions.unregister(session.id());
        }
    }
}

/// Encode once and hand the message to every local session of its channel
///
/// Session queues are in-process and never fail transiently, so there is
/// nothing to retry here; a closed queue prunes its session.
fn deliver_message(sessions: &SessionRegistry, stats: &DeliveryStats, message: Message) {
    let channel_id = message.channel_id;
    match message.to_presenter().encode() {
        Ok(payload) => {
            let count = sessions.broadcast_filter(&Bytes::from(payload), |attrs| {
                attrs.is_in_channel(channel_id)
            });
            stats.record_delivered(count);
        }
        Err(e) => {
            tracing::error!(channel_id = channel_id, error = %e, "Failed to encode message");
            stats.record_dropped();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use async_trait::async_trait;

    use crate::chat::domain::{Event, MessagePresenter};
    use crate::error::Error;
    use crate::fanout::topic::MESSAGE_TOPIC;
    use crate::fanout::MemoryBroker;
    use crate::session::SessionAttrs;

    /// Fails the first `failures` calls
    struct FlakyMembership {
        failures: AtomicU64,
        added: parking_lot::Mutex<Vec<(u64, u64)>>,
    }

    impl FlakyMembership {
        fn new(failures: u64) -> Self {
            Self {
                failures: AtomicU64::new(failures),
                added: parking_lot::Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl MembershipWriter for FlakyMembership {
        async fn add_user_to_channel(&self, channel_id: u64, user_id: u64) -> Result<()> {
            let left = self.failures.load(Ordering::SeqCst);
            if left > 0 {
                self.failures.store(left - 1, Ordering::SeqCst);
                return Err(Error::Broker("unavailable".into()));
            }
            self.added.lock().push((channel_id, user_id));
            Ok(())
        }
    }

    fn matched(user_id: u64, peer_id: u64) -> MatchResult {
        MatchResult {
            matched: true,
            user_id,
            peer_id,
            channel_id: 77,
            access_token: "tok".into(),
        }
    }

    async fn recv(rx: &mut tokio::sync::mpsc::UnboundedReceiver<Bytes>) -> Bytes {
        tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .unwrap()
            .unwrap()
    }

    #[tokio::test]
    async fn test_match_result_reaches_both_users() {
        let broker = Arc::new(MemoryBroker::new());
        let sessions = Arc::new(SessionRegistry::new());
        let membership = Arc::new(FlakyMembership::new(1));
        let subscriber = MatchSubscriber::new(
            broker.clone(),
            Arc::clone(&sessions),
            membership.clone(),
            SubscriberOptions::default().workers(2),
        );

        let (_a, mut rx_a) = sessions.register(SessionAttrs::matching(1));
        let (_b, mut rx_b) = sessions.register(SessionAttrs::matching(2));
        let (_c, mut rx_c) = sessions.register(SessionAttrs::matching(3));

        let shutdown = CancellationToken::new();
        let handle = subscriber.start(shutdown.clone()).await.unwrap();

        let payload = matched(1, 2).encode().unwrap();
        broker.publish(MATCH_TOPIC, Bytes::from(payload)).await.unwrap();

        let expected = Bytes::from_static(br#"{"access_token":"tok"}"#);
        assert_eq!(recv(&mut rx_a).await, expected);
        assert_eq!(recv(&mut rx_b).await, expected);
        assert!(rx_c.try_recv().is_err());

        shutdown.cancel();
        handle.await.unwrap();

        let mut added = membership.added.lock().clone();
        added.sort_unstable();
        assert_eq!(added, vec![(77, 1), (77, 2)]);

        let snap = subscriber.stats().snapshot();
        assert_eq!(snap.received, 1);
        assert_eq!(snap.delivered, 2);
        assert_eq!(snap.retried, 1);
    }

    #[tokio::test]
    async fn test_membership_failure_drops_delivery() {
        let broker = Arc::new(MemoryBroker::new());
        let sessions = Arc::new(SessionRegistry::new());
        let subscriber = MatchSubscriber::new(
            broker.clone(),
            Arc::clone(&sessions),
            Arc::new(FlakyMembership::new(u64::MAX)),
            SubscriberOptions::default().workers(1),
        );
        let (_a, mut rx_a) = sessions.register(SessionAttrs::matching(1));

        let shutdown = CancellationToken::new();
        let handle = subscriber.start(shutdown.clone()).await.unwrap();
        broker
            .publish(MATCH_TOPIC, Bytes::from(matched(1, 2).encode().unwrap()))
            .await
            .unwrap();

        for _ in 0..50 {
            if subscriber.stats().snapshot().dropped > 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        shutdown.cancel();
        handle.await.unwrap();

        let snap = subscriber.stats().snapshot();
        assert_eq!(snap.dropped, 1);
        assert_eq!(snap.retried, 2);
        assert!(rx_a.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_message_filtered_by_channel() {
        let broker = Arc::new(MemoryBroker::new());
        let sessions = Arc::new(SessionRegistry::new());
        let subscriber = MessageSubscriber::new(
            broker.clone(),
            Arc::clone(&sessions),
            MESSAGE_TOPIC,
            SubscriberOptions::default().workers(2),
        );
        let (_a, mut rx_a) = sessions.register(SessionAttrs::chat(5, 1));
        let (_b, mut rx_b) = sessions.register(SessionAttrs::chat(6, 2));
        let (_m, mut rx_m) = sessions.register(SessionAttrs::matching(1));

        let shutdown = CancellationToken::new();
        let handle = subscriber.start(shutdown.clone()).await.unwrap();

        let msg = Message {
            message_id: 10,
            event: Event::Text,
            channel_id: 5,
            user_id: 1,
            payload: "hi".into(),
            seen: false,
            time: 1,
        };
        broker
            .publish(MESSAGE_TOPIC, Bytes::from(msg.encode().unwrap()))
            .await
            .unwrap();
        broker
            .publish(MESSAGE_TOPIC, Bytes::from_static(b"not json"))
            .await
            .unwrap();

        let got = MessagePresenter::decode(&recv(&mut rx_a).await).unwrap();
        assert_eq!(got, msg.to_presenter());

        for _ in 0..50 {
            if subscriber.stats().snapshot().decode_errors > 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        shutdown.cancel();
        handle.await.unwrap();

        assert!(rx_b.try_recv().is_err());
        assert!(rx_m.try_recv().is_err());
        let snap = subscriber.stats().snapshot();
        assert_eq!(snap.received, 2);
        assert_eq!(snap.decode_errors, 1);
        assert_eq!(subscriber.topic(), MESSAGE_TOPIC);
    }
}
