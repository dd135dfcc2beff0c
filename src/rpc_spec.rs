//! [`RpcSpec`] definition and its derived channel/topic addresses.
use std::marker::PhantomData;

use crate::broker_spec::BrokerSpec;
use crate::message::{Message, RpcCancel, RpcResponse, RpcReturn};
use crate::node_id::NodeId;
use crate::topic::TopicSpec;

/// Prefix shared by every string identifier (channel or status key) an [`RpcSpec`]
/// derives.
const RPC_SLUG: &str = "rpc-";

/// Specification for one remote procedure call. Covers communication only -- the
/// procedure implementation lives in business logic and is handed to
/// [`crate::rpc::server::RpcServer`] separately.
///
/// All four derived addresses (request topic, per-requester response topic, cancel
/// topic, status key) are pure functions of `base_channel` (and, for the response
/// topic, the requester's [`NodeId`]), so any two processes agreeing on `base_channel`
/// derive byte-identical addresses without further coordination.
#[derive(Debug, Clone)]
pub struct RpcSpec<Req: Message, Ret: RpcReturn> {
    broker_spec: BrokerSpec,
    base_channel: String,
    _marker: PhantomData<fn() -> (Req, Ret)>,
}

impl<Req: Message, Ret: RpcReturn> RpcSpec<Req, Ret> {
    /// Create a new RPC spec rooted at `base_channel`.
    #[must_use]
    pub fn new(broker_spec: BrokerSpec, base_channel: impl Into<String>) -> Self {
        Self {
            broker_spec,
            base_channel: base_channel.into(),
            _marker: PhantomData,
        }
    }

    /// This RPC's broker.
    #[must_use]
    pub fn broker_spec(&self) -> &BrokerSpec {
        &self.broker_spec
    }

    /// The common slug all four derived addresses share.
    #[must_use]
    pub fn base_channel(&self) -> &str {
        &self.base_channel
    }

    /// The topic requests are published on. The single server subscribes here.
    #[must_use]
    pub fn request_topic_spec(&self) -> TopicSpec<Req> {
        TopicSpec::rpc_internal(
            self.broker_spec.clone(),
            format!("{RPC_SLUG}request-{}", self.base_channel),
        )
    }

    /// The topic `requester_id` alone receives its responses on.
    #[must_use]
    pub fn response_topic_spec(&self, requester_id: &NodeId) -> TopicSpec<RpcResponse<Req, Ret>> {
        TopicSpec::rpc_internal(
            self.broker_spec.clone(),
            format!(
                "{RPC_SLUG}response-{}-{}",
                self.base_channel,
                requester_id.name()
            ),
        )
    }

    /// The topic cancellation signals are published on.
    #[must_use]
    pub fn cancel_topic_spec(&self) -> TopicSpec<RpcCancel> {
        TopicSpec::rpc_internal(
            self.broker_spec.clone(),
            format!("{RPC_SLUG}cancel-{}", self.base_channel),
        )
    }

    /// The key/value store key the server's [`crate::message::RpcStatus`] is kept under.
    #[must_use]
    pub fn status_key(&self) -> String {
        format!("{RPC_SLUG}status-{}", self.base_channel)
    }
}

impl<Req: Message, Ret: RpcReturn> PartialEq for RpcSpec<Req, Ret> {
    fn eq(&self, other: &Self) -> bool {
        self.broker_spec.port() == other.broker_spec.port()
            && self.base_channel == other.base_channel
    }
}

impl<Req: Message, Ret: RpcReturn> Eq for RpcSpec<Req, Ret> {}

impl<Req: Message, Ret: RpcReturn> std::hash::Hash for RpcSpec<Req, Ret> {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.broker_spec.port().hash(state);
        self.base_channel.hash(state);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::{RpcCancel, Transport};
    use serde::{Deserialize, Serialize};

    #[derive(Debug, Clone, Serialize, Deserialize)]
    struct TestRequest {
        #[serde(flatten)]
        transport: Transport,
    }
    crate::impl_message!(TestRequest);

    fn spec() -> RpcSpec<TestRequest, i64> {
        RpcSpec::new(BrokerSpec::new("test", 6379), "navigate")
    }

    #[test]
    fn derives_stable_channel_names() {
        let s = spec();
        assert_eq!(s.request_topic_spec().channel(), "rpc-request-navigate");
        assert_eq!(
            s.response_topic_spec(&NodeId::new("alice")).channel(),
            "rpc-response-navigate-alice"
        );
        assert_eq!(s.cancel_topic_spec().channel(), "rpc-cancel-navigate");
        assert_eq!(s.status_key(), "rpc-status-navigate");
    }

    #[test]
    fn derivation_is_deterministic_across_instances() {
        let a = spec();
        let b = spec();
        assert_eq!(a.request_topic_spec().channel(), b.request_topic_spec().channel());
        assert_eq!(a.status_key(), b.status_key());
    }

    #[test]
    fn response_topics_isolate_by_requester() {
        let s = spec();
        let c1 = s.response_topic_spec(&NodeId::new("c1"));
        let c2 = s.response_topic_spec(&NodeId::new("c2"));
        assert_ne!(c1.channel(), c2.channel());
    }

    #[allow(dead_code)]
    fn type_check(_: RpcCancel) {}
}
