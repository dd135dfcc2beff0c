//! In-memory [`Broker`] implementation backing this crate's own tests. The real broker
//! is an out-of-scope external collaborator (`spec.md` §1); this double lets the
//! pub/sub, RPC, and node-runtime tests exercise real async fan-out without a Redis
//! instance, grounded in the `tokio::sync::broadcast` pattern.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use tokio::sync::broadcast;

use super::{Broker, BrokerError, Subscription};

/// Channel capacity for each topic's broadcast buffer. Generous enough that a slow
/// subscriber in a test doesn't lag and miss messages; this broker has no persistence
/// semantics to honor beyond "don't drop what's currently buffered."
const CHANNEL_CAPACITY: usize = 1024;

/// An in-process broker: one [`broadcast::Sender`] per channel, one [`Mutex`]-guarded
/// map for the key/value store.
#[derive(Debug, Default)]
pub struct MemoryBroker {
    /// Lazily created broadcast channels, one per pub/sub channel name.
    channels: Mutex<HashMap<String, broadcast::Sender<Vec<u8>>>>,
    /// The key/value store.
    kv: Mutex<HashMap<String, Vec<u8>>>,
}

impl MemoryBroker {
    /// Create a fresh, empty in-memory broker.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Get or create the broadcast sender for `channel`.
    fn sender_for(&self, channel: &str) -> broadcast::Sender<Vec<u8>> {
        let mut channels = self.channels.lock().unwrap_or_else(|err| err.into_inner());
        channels
            .entry(channel.to_string())
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0)
            .clone()
    }
}

#[async_trait]
impl Broker for MemoryBroker {
    async fn publish(&self, channel: &str, payload: Vec<u8>) -> Result<(), BrokerError> {
        // No subscribers is not an error -- matches Redis PUBLISH semantics.
        let _ = self.sender_for(channel).send(payload);
        Ok(())
    }

    async fn subscribe(&self, channel: &str) -> Result<Box<dyn Subscription>, BrokerError> {
        let receiver = self.sender_for(channel).subscribe();
        Ok(Box::new(MemorySubscription { receiver }))
    }

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, BrokerError> {
        let kv = self.kv.lock().unwrap_or_else(|err| err.into_inner());
        Ok(kv.get(key).cloned())
    }

    async fn set(&self, key: &str, value: Vec<u8>) -> Result<(), BrokerError> {
        let mut kv = self.kv.lock().unwrap_or_else(|err| err.into_inner());
        kv.insert(key.to_string(), value);
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), BrokerError> {
        let mut kv = self.kv.lock().unwrap_or_else(|err| err.into_inner());
        kv.remove(key);
        Ok(())
    }
}

/// One subscriber's handle onto a [`MemoryBroker`] channel.
struct MemorySubscription {
    receiver: broadcast::Receiver<Vec<u8>>,
}

#[async_trait]
impl Subscription for MemorySubscription {
    async fn try_recv(&mut self) -> Result<Option<Vec<u8>>, BrokerError> {
        loop {
            match self.receiver.try_recv() {
                Ok(payload) => return Ok(Some(payload)),
                Err(broadcast::error::TryRecvError::Empty) => return Ok(None),
                // A lagged receiver missed some messages; the caller's ordering check
                // will observe this as an out-of-order gap, which is the correct
                // behavior for a broker that dropped deliveries.
                Err(broadcast::error::TryRecvError::Lagged(_)) => continue,
                Err(broadcast::error::TryRecvError::Closed) => return Ok(None),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn publish_then_subscribe_misses_earlier_messages() {
        let broker = MemoryBroker::new();
        broker.publish("topic", b"before".to_vec()).await.unwrap();
        let mut sub = broker.subscribe("topic").await.unwrap();
        assert_eq!(sub.try_recv().await.unwrap(), None);
        broker.publish("topic", b"after".to_vec()).await.unwrap();
        assert_eq!(sub.try_recv().await.unwrap(), Some(b"after".to_vec()));
    }

    #[tokio::test]
    async fn kv_round_trip() {
        let broker = MemoryBroker::new();
        assert_eq!(broker.get("k").await.unwrap(), None);
        broker.set("k", b"v1".to_vec()).await.unwrap();
        assert_eq!(broker.get("k").await.unwrap(), Some(b"v1".to_vec()));
        broker.set("k", b"v2".to_vec()).await.unwrap();
        assert_eq!(broker.get("k").await.unwrap(), Some(b"v2".to_vec()));
        broker.delete("k").await.unwrap();
        assert_eq!(broker.get("k").await.unwrap(), None);
    }

    #[tokio::test]
    async fn two_subscribers_each_receive_every_message() {
        let broker = MemoryBroker::new();
        let mut a = broker.subscribe("topic").await.unwrap();
        let mut b = broker.subscribe("topic").await.unwrap();
        broker.publish("topic", b"msg".to_vec()).await.unwrap();
        assert_eq!(a.try_recv().await.unwrap(), Some(b"msg".to_vec()));
        assert_eq!(b.try_recv().await.unwrap(), Some(b"msg".to_vec()));
    }
}
