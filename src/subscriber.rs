//! [`Subscriber`] definition: message decoding, latency health-checking, and
//! out-of-order detection.
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures::future::BoxFuture;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{instrument, warn};

use crate::broker::{Broker, Subscription as BrokerSubscription};
use crate::message::Message;
use crate::node_id::NodeId;
use crate::topic::TopicSpec;

/// Window of received-message timestamps used for latency health checks. `spec.md` §4.4
/// calls this the "sliding-window log"; at least this much wall-clock time of data must
/// be present before checks fire.
const LATENCY_WINDOW: Duration = Duration::from_secs(1);

/// Poll interval used by [`Subscriber::get_msg`] and [`Subscriber::listen`] between
/// broker polls. `REDIS_SUB_SLEEP`, default 100 microseconds.
fn sub_sleep() -> Duration {
    env_duration_secs("REDIS_SUB_SLEEP", 0.0001)
}

/// Read a floating-point seconds duration from an environment variable, falling back to
/// `default` if unset or unparseable.
fn env_duration_secs(var: &str, default: f64) -> Duration {
    let secs = std::env::var(var)
        .ok()
        .and_then(|v| v.parse::<f64>().ok())
        .unwrap_or(default);
    Duration::from_secs_f64(secs.max(0.0))
}

/// One record in the latency window: when a message was received, and how stale it was.
struct LatencyRecord {
    msg_rcv_ts: Instant,
    msg_latency: Duration,
}

/// An asynchronous message callback. Boxed for storage; `spec.md` §4.4's "reject a
/// synchronous callback with a type-mismatch error" becomes, in a statically typed
/// language, simply requiring the callback to return a future -- there is no way to
/// pass a blocking function here at all.
pub type Callback<M> = Box<dyn Fn(M) -> BoxFuture<'static, ()> + Send + Sync>;

/// Receives, decodes, and health-checks messages of type `M` on one topic.
pub struct Subscriber<M: Message> {
    node_id: NodeId,
    topic_spec: TopicSpec<M>,
    callback: Option<Callback<M>>,
    subscription: Mutex<Option<Box<dyn BrokerSubscription>>>,
    expected_counters: Mutex<HashMap<NodeId, u64>>,
    latency_records: Mutex<Vec<LatencyRecord>>,
    latency_issue_count: std::sync::atomic::AtomicU64,
    unexpected_msgs: Mutex<Vec<M>>,
}

impl<M: Message> Subscriber<M> {
    /// Subscribe to `topic_spec.channel()`. `callback`, if present, is invoked
    /// sequentially (one in flight at a time) by [`Self::listen`].
    ///
    /// # Errors
    /// Returns [`NewError::Broker`] if the broker subscribe fails.
    pub async fn new(
        node_id: NodeId,
        topic_spec: TopicSpec<M>,
        callback: Option<Callback<M>>,
        broker: Arc<dyn Broker>,
    ) -> Result<Self, NewError> {
        let subscription = broker.subscribe(topic_spec.channel()).await?;
        Ok(Self {
            node_id,
            topic_spec,
            callback,
            subscription: Mutex::new(Some(subscription)),
            expected_counters: Mutex::new(HashMap::new()),
            latency_records: Mutex::new(Vec::new()),
            latency_issue_count: std::sync::atomic::AtomicU64::new(0),
            unexpected_msgs: Mutex::new(Vec::new()),
        })
    }

    /// This subscriber's owning node.
    #[must_use]
    pub fn node_id(&self) -> &NodeId {
        &self.node_id
    }

    /// The topic this subscriber listens on.
    #[must_use]
    pub fn topic_spec(&self) -> &TopicSpec<M> {
        &self.topic_spec
    }

    /// Run forever, awaiting messages and invoking the callback sequentially. Returns
    /// once the broker subscription reports closed (in practice: never, for a live
    /// broker connection -- callers rely on [`Self::close`]/task abort to stop this).
    #[instrument(skip_all, fields(channel = self.topic_spec.channel()))]
    pub async fn listen(&self) {
        let Some(callback) = &self.callback else {
            return;
        };
        loop {
            match self.get_msg(None).await {
                Some(msg) => callback(msg).await,
                // `get_msg(None)` only returns `None` when the subscription has been
                // closed (otherwise it loops internally until a message arrives).
                None => return,
            }
        }
    }

    /// Poll for the next data message, ignoring subscription-meta events, until one
    /// arrives or `timeout` elapses. `timeout = None` waits forever. Malformed messages
    /// (missing transport fields, or undecodable JSON) are logged and skipped, never
    /// returned and never fatal.
    pub async fn get_msg(&self, timeout: Option<Duration>) -> Option<M> {
        let start = Instant::now();
        loop {
            if let Some(timeout) = timeout {
                if start.elapsed() >= timeout {
                    return None;
                }
            }

            let payload = {
                let mut subscription = self.subscription.lock().await;
                match subscription.as_mut() {
                    Some(subscription) => subscription.try_recv().await,
                    None => return None,
                }
            };
            match payload {
                Ok(Some(bytes)) => match serde_json::from_slice::<M>(&bytes) {
                    Ok(msg) => {
                        if !self.validate_transport(&msg) {
                            continue;
                        }
                        self.check_latency(&msg).await;
                        self.check_ordering(msg.clone()).await;
                        return Some(msg);
                    }
                    Err(err) => {
                        warn!("malformed message on {}: {err}", self.topic_spec.channel());
                        continue;
                    }
                },
                Ok(None) => {}
                Err(err) => {
                    warn!("broker error on {}: {err}", self.topic_spec.channel());
                }
            }
            tokio::time::sleep(sub_sleep()).await;
        }
    }

    /// Transport fields populated check. `spec.md` §4.4: "Malformed messages (missing
    /// `pub_dt`, `sender_id`, or `pub_counter`) are logged and skipped."
    fn validate_transport(&self, msg: &M) -> bool {
        let transport = msg.transport();
        if transport.sender_id.is_none()
            || transport.pub_dt.is_none()
            || transport.pub_counter.is_none()
        {
            warn!(
                "malformed message on {}: missing transport fields",
                self.topic_spec.channel()
            );
            return false;
        }
        true
    }

    /// Append a latency record, trim the window, and raise single/average-latency
    /// warnings exactly as `spec.md` §4.4 prescribes.
    async fn check_latency(&self, msg: &M) {
        let Some(pub_dt) = msg.transport().pub_dt else {
            return;
        };
        let now = Utc::now();
        let msg_latency = (now - pub_dt)
            .to_std()
            .unwrap_or(Duration::ZERO);

        let mut records = self.latency_records.lock().await;
        records.push(LatencyRecord {
            msg_rcv_ts: Instant::now(),
            msg_latency,
        });

        let window_start = Instant::now()
            .checked_sub(LATENCY_WINDOW)
            .unwrap_or_else(Instant::now);
        let mut new_start_ix = 0;
        for (ix, record) in records.iter().enumerate() {
            if record.msg_rcv_ts > window_start {
                new_start_ix = ix.saturating_sub(1);
                break;
            }
            new_start_ix = ix + 1;
        }
        records.drain(..new_start_ix);

        let Some(oldest) = records.first() else {
            return;
        };
        if Instant::now().duration_since(oldest.msg_rcv_ts) < LATENCY_WINDOW {
            return;
        }

        let last_latency = records.last().map(|r| r.msg_latency).unwrap_or_default();
        if last_latency > self.topic_spec.single_latency_threshold() {
            warn!(
                "very late message on {}: latency={last_latency:?}",
                self.topic_spec.channel()
            );
            self.latency_issue_count
                .fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        }

        let avg_latency = {
            let total: Duration = records.iter().map(|r| r.msg_latency).sum();
            total / u32::try_from(records.len()).unwrap_or(1)
        };
        if avg_latency > self.topic_spec.avg_latency_threshold() {
            warn!(
                "average latency exceeded on {}: avg={avg_latency:?}",
                self.topic_spec.channel()
            );
            self.latency_issue_count
                .fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            records.clear();
        }
    }

    /// Track per-publisher `pub_counter` sequencing; record and resync on a gap.
    async fn check_ordering(&self, msg: M) {
        let (Some(sender_id), Some(pub_counter)) =
            (msg.transport().sender_id.clone(), msg.transport().pub_counter)
        else {
            return;
        };

        let mut counters = self.expected_counters.lock().await;
        match counters.get_mut(&sender_id) {
            None => {
                counters.insert(sender_id, pub_counter);
            }
            Some(expected) => {
                *expected += 1;
                if *expected != pub_counter {
                    warn!(
                        "out-of-order message on {} from {sender_id}: expected={expected} got={pub_counter}",
                        self.topic_spec.channel(),
                    );
                    self.unexpected_msgs.lock().await.push(msg);
                    *expected = pub_counter;
                }
            }
        }
    }

    /// Number of latency issues (single or average) observed so far.
    #[must_use]
    pub fn latency_issue_count(&self) -> u64 {
        self.latency_issue_count.load(std::sync::atomic::Ordering::SeqCst)
    }

    /// A snapshot of every out-of-order message observed so far.
    pub async fn unexpected_msgs(&self) -> Vec<M> {
        self.unexpected_msgs.lock().await.clone()
    }

    /// Clear per-publisher counters and close the underlying broker subscription.
    pub async fn close(&self) {
        self.expected_counters.lock().await.clear();
        self.subscription.lock().await.take();
    }
}

impl<M: Message> std::fmt::Debug for Subscriber<M> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscriber")
            .field("node_id", &self.node_id)
            .field("channel", &self.topic_spec.channel())
            .finish_non_exhaustive()
    }
}

/// Errors [`Subscriber::new`] may return.
#[derive(Debug, thiserror::Error)]
pub enum NewError {
    /// The broker could not open the subscription.
    #[error(transparent)]
    Broker(#[from] crate::broker::BrokerError),
}

/// Boxes an async closure into a [`Callback`].
pub fn callback<M, F, Fut>(f: F) -> Callback<M>
where
    M: Message,
    F: Fn(M) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    Box::new(move |msg| -> Pin<Box<dyn Future<Output = ()> + Send>> { Box::pin(f(msg)) })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::memory::MemoryBroker;
    use crate::broker_spec::BrokerSpec;
    use crate::message::Transport;
    use crate::publisher::Publisher;
    use serde::{Deserialize, Serialize};

    #[derive(Debug, Clone, Serialize, Deserialize)]
    struct Odometry {
        #[serde(flatten)]
        transport: Transport,
        position: f64,
    }
    crate::impl_message!(Odometry);

    fn topic() -> TopicSpec<Odometry> {
        TopicSpec::new(BrokerSpec::new("b", 1), "odometry")
    }

    #[tokio::test]
    async fn receives_in_publish_order() {
        let broker: Arc<dyn Broker> = Arc::new(MemoryBroker::new());
        let publisher = Publisher::new(NodeId::new("A"), topic(), broker.clone());
        let subscriber = Subscriber::new(NodeId::new("B"), topic(), None, broker)
            .await
            .unwrap();

        for position in [1.0, 2.0, 3.0] {
            publisher
                .publish(Odometry {
                    transport: Transport::default(),
                    position,
                })
                .await
                .unwrap();
        }

        for (expected_counter, expected_position) in [(0, 1.0), (1, 2.0), (2, 3.0)] {
            let msg = subscriber.get_msg(Some(Duration::from_secs(1))).await.unwrap();
            assert_eq!(msg.transport.pub_counter, Some(expected_counter));
            assert_eq!(msg.position, expected_position);
        }
        assert_eq!(subscriber.unexpected_msgs().await.len(), 0);
    }

    #[tokio::test]
    async fn out_of_order_message_counted_once() {
        let broker: Arc<dyn Broker> = Arc::new(MemoryBroker::new());
        let subscriber = Subscriber::new(NodeId::new("B"), topic(), None, broker.clone())
            .await
            .unwrap();

        let sender = NodeId::new("A");
        let send = |counter: u64| {
            let payload = serde_json::to_vec(&Odometry {
                transport: Transport {
                    sender_id: Some(sender.clone()),
                    pub_dt: Some(Utc::now()),
                    pub_counter: Some(counter),
                },
                position: 0.0,
            })
            .unwrap();
            payload
        };

        broker.publish(topic().channel(), send(0)).await.unwrap();
        broker.publish(topic().channel(), send(2)).await.unwrap();
        broker.publish(topic().channel(), send(3)).await.unwrap();

        for _ in 0..3 {
            subscriber.get_msg(Some(Duration::from_secs(1))).await;
        }

        assert_eq!(subscriber.unexpected_msgs().await.len(), 1);
    }

    #[tokio::test]
    async fn get_msg_times_out_without_a_message() {
        let broker: Arc<dyn Broker> = Arc::new(MemoryBroker::new());
        let subscriber = Subscriber::new(NodeId::new("B"), topic(), None, broker)
            .await
            .unwrap();
        let result = subscriber.get_msg(Some(Duration::from_millis(10))).await;
        assert!(result.is_none());
    }

    #[tokio::test]
    async fn no_latency_warnings_with_insufficient_data() {
        let broker: Arc<dyn Broker> = Arc::new(MemoryBroker::new());
        let publisher = Publisher::new(NodeId::new("A"), topic(), broker.clone());
        let subscriber = Subscriber::new(NodeId::new("B"), topic(), None, broker)
            .await
            .unwrap();

        publisher
            .publish(Odometry {
                transport: Transport::default(),
                position: 1.0,
            })
            .await
            .unwrap();
        subscriber.get_msg(Some(Duration::from_secs(1))).await;

        assert_eq!(subscriber.latency_issue_count(), 0);
    }
}
