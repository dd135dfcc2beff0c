//! [`TopicSpec`] definition.
use std::marker::PhantomData;
use std::time::Duration;

use crate::broker_spec::BrokerSpec;
use crate::message::Message;

/// Default single-message latency threshold for application topics.
pub const DEFAULT_MAX_SINGLE_LATENCY: Duration = Duration::from_millis(50);
/// Default average-latency threshold for application topics.
pub const DEFAULT_MAX_AVG_LATENCY: Duration = Duration::from_millis(10);

/// Single-message latency threshold used by the four RPC-internal topics.
const RPC_INTERNAL_MAX_SINGLE_LATENCY: Duration = Duration::from_millis(100);
/// Average-latency threshold used by the four RPC-internal topics.
const RPC_INTERNAL_MAX_AVG_LATENCY: Duration = Duration::from_millis(100);

/// Identifies one topic: its broker, channel name, the message type bound to it, and the
/// latency thresholds its subscribers should enforce. Hashable/comparable by `(port, channel)`
/// alone, matching the broker-level identity of a topic.
#[derive(Debug, Clone)]
pub struct TopicSpec<M: Message> {
    broker_spec: BrokerSpec,
    channel: String,
    max_single_latency: Duration,
    max_avg_latency: Duration,
    _marker: PhantomData<fn() -> M>,
}

impl<M: Message> TopicSpec<M> {
    /// Create a topic spec with the default (non-RPC) latency thresholds.
    #[must_use]
    pub fn new(broker_spec: BrokerSpec, channel: impl Into<String>) -> Self {
        Self {
            broker_spec,
            channel: channel.into(),
            max_single_latency: DEFAULT_MAX_SINGLE_LATENCY,
            max_avg_latency: DEFAULT_MAX_AVG_LATENCY,
            _marker: PhantomData,
        }
    }

    /// Create a topic spec using the RPC-internal latency thresholds (100 ms / 100 ms).
    pub(crate) fn rpc_internal(broker_spec: BrokerSpec, channel: impl Into<String>) -> Self {
        Self {
            broker_spec,
            channel: channel.into(),
            max_single_latency: RPC_INTERNAL_MAX_SINGLE_LATENCY,
            max_avg_latency: RPC_INTERNAL_MAX_AVG_LATENCY,
            _marker: PhantomData,
        }
    }

    /// Override the single-message latency threshold.
    #[must_use]
    pub fn with_max_single_latency(mut self, max_single_latency: Duration) -> Self {
        self.max_single_latency = max_single_latency;
        self
    }

    /// Override the average-latency threshold.
    #[must_use]
    pub fn with_max_avg_latency(mut self, max_avg_latency: Duration) -> Self {
        self.max_avg_latency = max_avg_latency;
        self
    }

    /// This topic's broker.
    #[must_use]
    pub fn broker_spec(&self) -> &BrokerSpec {
        &self.broker_spec
    }

    /// The channel name on the broker.
    #[must_use]
    pub fn channel(&self) -> &str {
        &self.channel
    }

    /// The single-message latency threshold subscribers should enforce.
    #[must_use]
    pub fn single_latency_threshold(&self) -> Duration {
        self.max_single_latency
    }

    /// The average-latency threshold subscribers should enforce.
    #[must_use]
    pub fn avg_latency_threshold(&self) -> Duration {
        self.max_avg_latency
    }
}

impl<M: Message> PartialEq for TopicSpec<M> {
    fn eq(&self, other: &Self) -> bool {
        self.broker_spec.port() == other.broker_spec.port() && self.channel == other.channel
    }
}

impl<M: Message> Eq for TopicSpec<M> {}

impl<M: Message> std::hash::Hash for TopicSpec<M> {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.broker_spec.port().hash(state);
        self.channel.hash(state);
    }
}
