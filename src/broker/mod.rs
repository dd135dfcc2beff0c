//! [`Broker`] trait: the seam between core IPC logic and a concrete pub/sub +
//! key/value backend. Publishers, subscribers, and RPC agents hold an `Arc<dyn Broker>`
//! rather than depending on Redis directly, so this crate's own tests can run against
//! [`memory::MemoryBroker`] without an external service.

pub mod memory;
pub mod redis;

use async_trait::async_trait;

/// Errors a [`Broker`] implementation may surface. Broker I/O failures propagate to the
/// caller per the transport's error taxonomy; nothing here is swallowed.
#[derive(Debug, thiserror::Error)]
pub enum BrokerError {
    /// The underlying connection failed or was rejected by the broker.
    #[error("broker connection failed: {0}")]
    Connection(#[source] anyhow::Error),
    /// A publish, get, set, or delete operation failed.
    #[error("broker operation failed: {0}")]
    Operation(#[source] anyhow::Error),
    /// Subscribing to a channel failed.
    #[error("broker subscribe failed: {0}")]
    Subscribe(#[source] anyhow::Error),
}

/// One open subscription to a channel. Yields only data deliveries -- subscribe/
/// unsubscribe meta events are filtered out by the implementation before they ever
/// reach [`Self::try_recv`], matching `spec.md`'s "expose only the [data] deliveries."
#[async_trait]
pub trait Subscription: Send {
    /// Poll once for the next data delivery without blocking. Returns `Ok(None)` if
    /// nothing is available right now -- callers loop with their own sleep, matching
    /// the polling model `spec.md` describes (`REDIS_SUB_SLEEP`/`REDIS_GET_INTERVAL`).
    async fn try_recv(&mut self) -> Result<Option<Vec<u8>>, BrokerError>;
}

/// A pub/sub + key/value backend. One broker connection is conceptually scoped to a
/// single [`crate::broker_spec::BrokerSpec`] (host + port); callers obtain one via
/// [`redis::RedisBroker::connect`] or [`memory::MemoryBroker::new`].
#[async_trait]
pub trait Broker: Send + Sync + std::fmt::Debug {
    /// Publish raw bytes on `channel`. Fans out to every current subscriber; no
    /// persistence, matching `spec.md` §6.
    async fn publish(&self, channel: &str, payload: Vec<u8>) -> Result<(), BrokerError>;

    /// Open a new subscription to `channel`. Each call yields an independent
    /// subscription even if others are already open on the same channel.
    async fn subscribe(&self, channel: &str) -> Result<Box<dyn Subscription>, BrokerError>;

    /// Read the current value of `key`, or `None` if unset.
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, BrokerError>;

    /// Set `key` to `value`. Last-writer-wins.
    async fn set(&self, key: &str, value: Vec<u8>) -> Result<(), BrokerError>;

    /// Delete `key`, if present. Deleting an absent key is not an error.
    async fn delete(&self, key: &str) -> Result<(), BrokerError>;
}
