//! IPC core for a small robotics control system: a broker-backed publish/subscribe and
//! request/response (RPC) substrate on which independent nodes exchange typed
//! messages.
//!
//! Four tightly-coupled layers, leaves first: the spec model
//! ([`broker_spec`]/[`node_id`]/[`message`]/[`topic`]/[`rpc_spec`]), the
//! [`broker`] adapter, [`publisher`]/[`subscriber`] pub/sub, [`rpc`] request/response,
//! and [`node`] task lifecycle.
#![forbid(unsafe_code)]
#![deny(nonstandard_style)]
#![warn(missing_docs, clippy::pedantic, clippy::unwrap_used)]
#![allow(clippy::unused_async)]

pub mod broker;
pub mod broker_spec;
pub mod message;
pub mod node;
pub mod node_id;
pub mod publisher;
pub mod rpc;
pub mod rpc_spec;
pub mod subscriber;
pub mod topic;
pub mod util;

pub use broker::Broker;
pub use broker_spec::BrokerSpec;
pub use message::Message;
pub use node::NodeRuntime;
pub use node_id::NodeId;
pub use publisher::Publisher;
pub use rpc::{RpcClient, RpcServer};
pub use rpc_spec::RpcSpec;
pub use subscriber::Subscriber;
pub use topic::TopicSpec;

/// Common imports for business nodes built on this crate.
pub mod prelude {
    pub use crate::impl_message;
    pub use crate::message::{Message, RpcReturn, Transport};
    pub use crate::node::NodeRuntime;
    pub use crate::node_id::NodeId;
    pub use crate::publisher::Publisher;
    pub use crate::rpc::{RpcClient, RpcServer};
    pub use crate::rpc_spec::RpcSpec;
    pub use crate::subscriber::Subscriber;
    pub use crate::topic::TopicSpec;
    pub use crate::BrokerSpec;
}
