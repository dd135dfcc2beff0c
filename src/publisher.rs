//! [`Publisher`] definition.
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tracing::instrument;

use crate::broker::{Broker, BrokerError};
use crate::message::Message;
use crate::node_id::NodeId;
use crate::topic::TopicSpec;

/// Publishes messages of type `M` on one topic, stamping transport fields on every
/// send. A publisher's type parameter makes the `spec.md` §4.3 "precondition: `msg` is
/// an instance of `topic_spec.msg_cls`" check a compile-time guarantee instead of a
/// runtime one -- there is no way to call [`Self::publish`] with the wrong type.
#[derive(Debug)]
pub struct Publisher<M: Message> {
    node_id: NodeId,
    topic_spec: TopicSpec<M>,
    broker: Arc<dyn Broker>,
    pub_counter: AtomicU64,
}

impl<M: Message> Publisher<M> {
    /// Create a publisher for `topic_spec`, identifying outgoing messages as coming
    /// from `node_id`. Starts its per-publisher counter at 0.
    #[must_use]
    pub fn new(node_id: NodeId, topic_spec: TopicSpec<M>, broker: Arc<dyn Broker>) -> Self {
        Self {
            node_id,
            topic_spec,
            broker,
            pub_counter: AtomicU64::new(0),
        }
    }

    /// The topic this publisher sends on.
    #[must_use]
    pub fn topic_spec(&self) -> &TopicSpec<M> {
        &self.topic_spec
    }

    /// Stamp `sender_id`, `pub_dt`, and `pub_counter`, serialize `msg`, and publish it
    /// on `topic_spec.channel`. The counter increments even if the serialize/publish
    /// step fails below it, matching "no retries; broker errors propagate" -- a failed
    /// send still consumed a sequence number, so the next attempt doesn't collide with
    /// what a subscriber may have already partially observed.
    ///
    /// # Errors
    /// Returns [`PublishError::Broker`] if serialization or the broker publish fails.
    #[instrument(skip_all, fields(channel = self.topic_spec.channel(), node = %self.node_id))]
    pub async fn publish(&self, mut msg: M) -> Result<(), PublishError> {
        let pub_counter = self.pub_counter.fetch_add(1, Ordering::SeqCst);
        *msg.transport_mut() = crate::message::Transport {
            sender_id: Some(self.node_id.clone()),
            pub_dt: Some(chrono::Utc::now()),
            pub_counter: Some(pub_counter),
        };

        let payload = serde_json::to_vec(&msg).map_err(PublishError::Serialize)?;
        self.broker
            .publish(self.topic_spec.channel(), payload)
            .await
            .map_err(PublishError::Broker)?;
        Ok(())
    }
}

/// Errors [`Publisher::publish`] may return.
#[derive(Debug, thiserror::Error)]
pub enum PublishError {
    /// The message could not be serialized to JSON.
    #[error("failed to serialize message: {0}")]
    Serialize(#[source] serde_json::Error),
    /// The broker rejected or failed the publish.
    #[error(transparent)]
    Broker(#[from] BrokerError),
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::memory::MemoryBroker;
    use crate::message::Transport;
    use serde::{Deserialize, Serialize};

    #[derive(Debug, Clone, Serialize, Deserialize)]
    struct Odometry {
        #[serde(flatten)]
        transport: Transport,
        position: f64,
    }
    crate::impl_message!(Odometry);

    #[tokio::test]
    async fn stamps_increasing_pub_counters() {
        let broker: Arc<dyn Broker> = Arc::new(MemoryBroker::new());
        let topic = TopicSpec::new(crate::broker_spec::BrokerSpec::new("b", 1), "odometry");
        let publisher = Publisher::new(NodeId::new("A"), topic.clone(), broker.clone());
        let mut sub = broker.subscribe(topic.channel()).await.unwrap();

        for position in [1.0, 2.0, 3.0] {
            publisher
                .publish(Odometry {
                    transport: Transport::default(),
                    position,
                })
                .await
                .unwrap();
        }

        for expected_counter in 0..3u64 {
            let payload = loop {
                if let Some(p) = sub.try_recv().await.unwrap() {
                    break p;
                }
            };
            let msg: Odometry = serde_json::from_slice(&payload).unwrap();
            assert_eq!(msg.transport.pub_counter, Some(expected_counter));
            assert_eq!(msg.transport.sender_id.unwrap().name(), "A");
        }
    }
}
