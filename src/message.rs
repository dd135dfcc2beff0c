//! [`Transport`], the [`Message`] trait, and the RPC-protocol message types built on top of it.
use std::fmt;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::node_id::NodeId;

/// Transport fields every [`Message`] carries, stamped in by the publisher at send time.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Transport {
    /// The publishing node, set by [`crate::publisher::Publisher::publish`].
    pub sender_id: Option<NodeId>,
    /// Timezone-aware publish timestamp.
    pub pub_dt: Option<chrono::DateTime<chrono::Utc>>,
    /// Monotonically increasing per-publisher sequence number, starting at 0.
    pub pub_counter: Option<u64>,
}

/// A typed, transportable payload. Business messages extend this by embedding a
/// `#[serde(flatten)] transport: Transport` field and implementing the trait, most easily via
/// [`impl_message!`].
///
/// A bound is enforced at publish time by `M` itself (the compiler rejects publishing the wrong
/// type), so there is no runtime type-mismatch check here.
pub trait Message: Serialize + DeserializeOwned + Clone + fmt::Debug + Send + Sync + 'static {
    /// Borrow this message's transport fields.
    fn transport(&self) -> &Transport;
    /// Mutably borrow this message's transport fields, for the publisher to stamp.
    fn transport_mut(&mut self) -> &mut Transport;
}

/// Implements [`Message`] for a struct with a `transport: Transport` field.
#[macro_export]
macro_rules! impl_message {
    ($ty:ty) => {
        impl $crate::message::Message for $ty {
            fn transport(&self) -> &$crate::message::Transport {
                &self.transport
            }

            fn transport_mut(&mut self) -> &mut $crate::message::Transport {
                &mut self.transport
            }
        }
    };
}

/// Bound on an RPC's return payload: unlike a request or response, a return value is never
/// itself published standalone, so it carries no transport fields of its own.
pub trait RpcReturn: Serialize + DeserializeOwned + Clone + fmt::Debug + Send + Sync + 'static {}

impl<T> RpcReturn for T where T: Serialize + DeserializeOwned + Clone + fmt::Debug + Send + Sync + 'static
{}

/// A cancellation signal. Carries no payload; any client may cancel any running procedure on the
/// addressed server.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RpcCancel {
    #[serde(flatten)]
    transport: Transport,
}

impl_message!(RpcCancel);

/// The uniform response to one RPC call. Exactly one of `cancelled`, [`Self::errored`],
/// [`Self::completed`] holds.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(bound = "Req: Message, Ret: RpcReturn")]
pub struct RpcResponse<Req, Ret> {
    #[serde(flatten)]
    transport: Transport,
    /// Full echo of the originating request.
    pub request_msg: Req,
    /// Procedure wall-clock time, in seconds.
    pub duration: f64,
    /// The procedure's return value, present iff the call completed normally.
    pub return_val: Option<Ret>,
    /// Whether the procedure was cancelled mid-flight.
    pub cancelled: bool,
    /// Human-readable failure dump, present iff the procedure failed.
    pub traceback_str: Option<String>,
}

impl<Req, Ret> RpcResponse<Req, Ret> {
    /// Build a response for a procedure that returned normally.
    pub(crate) fn new_completed(request_msg: Req, duration: f64, return_val: Ret) -> Self {
        Self {
            transport: Transport::default(),
            request_msg,
            duration,
            return_val: Some(return_val),
            cancelled: false,
            traceback_str: None,
        }
    }

    /// Build a response for a procedure that failed (panicked or returned an error).
    pub(crate) fn new_errored(request_msg: Req, duration: f64, traceback_str: String) -> Self {
        Self {
            transport: Transport::default(),
            request_msg,
            duration,
            return_val: None,
            cancelled: false,
            traceback_str: Some(traceback_str),
        }
    }

    /// Build a response for a procedure that was cancelled mid-flight.
    pub(crate) fn new_cancelled(request_msg: Req, duration: f64) -> Self {
        Self {
            transport: Transport::default(),
            request_msg,
            duration,
            return_val: None,
            cancelled: true,
            traceback_str: None,
        }
    }

    /// The procedure raised or panicked.
    #[must_use]
    pub fn errored(&self) -> bool {
        self.traceback_str.is_some()
    }

    /// The procedure ran to completion without being cancelled or failing.
    #[must_use]
    pub fn completed(&self) -> bool {
        !self.cancelled && !self.errored()
    }
}

impl<Req, Ret> Message for RpcResponse<Req, Ret>
where
    Req: Message,
    Ret: RpcReturn,
{
    fn transport(&self) -> &Transport {
        &self.transport
    }

    fn transport_mut(&mut self) -> &mut Transport {
        &mut self.transport
    }
}

/// An RPC server's advertised liveness/busyness, persisted in the broker's key/value store
/// under the RPC's status key.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(bound = "Req: Message")]
pub struct RpcStatus<Req> {
    /// The node currently owning this RPC's status key.
    pub server_id: NodeId,
    /// The request currently executing, if any.
    pub cur_request: Option<Req>,
}

impl<Req: Message> RpcStatus<Req> {
    /// A status advertising readiness (no procedure running).
    #[must_use]
    pub fn new(server_id: NodeId) -> Self {
        Self {
            server_id,
            cur_request: None,
        }
    }

    /// A status advertising a procedure currently executing.
    #[must_use]
    pub fn busy(server_id: NodeId, cur_request: Req) -> Self {
        Self {
            server_id,
            cur_request: Some(cur_request),
        }
    }

    /// No procedure is currently executing.
    #[must_use]
    pub fn ready(&self) -> bool {
        self.cur_request.is_none()
    }
}
