//! [`RpcClient`] definition.
use std::sync::Arc;
use std::time::Duration;

use tracing::instrument;

use crate::broker::{Broker, BrokerError};
use crate::message::{Message, RpcCancel, RpcResponse, RpcReturn, RpcStatus};
use crate::node_id::NodeId;
use crate::publisher::{self, Publisher};
use crate::rpc_spec::RpcSpec;
use crate::subscriber::{self, Subscriber};

/// Makes RPC calls against the single server for one [`RpcSpec`], and can cancel
/// whatever procedure that server currently has running.
///
/// Correlates responses to requests purely by "next message on my own response
/// channel" (`spec.md` §4.6/§9) -- callers must not have more than one [`Self::call`]
/// in flight at a time; overlapping calls are unsupported, not merely undefined for
/// the wrong reason, since there is no call-ID to disambiguate them.
pub struct RpcClient<Req: Message, Ret: RpcReturn> {
    node_id: NodeId,
    rpc_spec: RpcSpec<Req, Ret>,
    broker: Arc<dyn Broker>,
    request_pub: Publisher<Req>,
    cancel_pub: Publisher<RpcCancel>,
    response_sub: Subscriber<RpcResponse<Req, Ret>>,
}

impl<Req: Message, Ret: RpcReturn> RpcClient<Req, Ret> {
    /// Create request/cancel publishers and a subscriber on this node's own response
    /// topic.
    ///
    /// # Errors
    /// Returns [`NewError::Broker`] if the response subscription cannot be opened.
    pub async fn new(
        node_id: NodeId,
        rpc_spec: RpcSpec<Req, Ret>,
        broker: Arc<dyn Broker>,
    ) -> Result<Self, NewError> {
        let request_pub = Publisher::new(
            node_id.clone(),
            rpc_spec.request_topic_spec(),
            broker.clone(),
        );
        let cancel_pub = Publisher::new(
            node_id.clone(),
            rpc_spec.cancel_topic_spec(),
            broker.clone(),
        );
        let response_sub = Subscriber::new(
            node_id.clone(),
            rpc_spec.response_topic_spec(&node_id),
            None,
            broker.clone(),
        )
        .await?;

        Ok(Self {
            node_id,
            rpc_spec,
            broker,
            request_pub,
            cancel_pub,
            response_sub,
        })
    }

    /// Publish `request_msg` and await exactly one response on this client's own
    /// response topic.
    ///
    /// # Errors
    /// Returns [`CallError::Publish`] if the request fails to publish.
    #[instrument(skip_all, fields(channel = self.rpc_spec.base_channel(), node = %self.node_id))]
    pub async fn call(&self, request_msg: Req) -> Result<RpcResponse<Req, Ret>, CallError> {
        self.request_pub.publish(request_msg).await?;
        let response = self.response_sub.get_msg(None).await;
        // `get_msg(None)` only returns `None` if the subscription has been closed,
        // which only happens via `Self::close` -- a call in flight when that happens
        // has no response to return.
        response.ok_or(CallError::SubscriptionClosed)
    }

    /// Cancel whatever procedure the server currently has running, if any. May affect
    /// a different client's in-flight call; `spec.md` §4.6 documents this as intended
    /// (coarse-grained cancellation, no call-ID targeting).
    ///
    /// # Errors
    /// Returns [`BrokerError`] if the cancel signal fails to publish.
    pub async fn cancel_running_procedure(&self) -> Result<(), publisher::PublishError> {
        self.cancel_pub.publish(RpcCancel::default()).await
    }

    /// Read and decode the server's current status, or `None` if the key is unset.
    ///
    /// # Errors
    /// Returns [`BrokerError`] if the key/value read fails.
    pub async fn get_status(&self) -> Result<Option<RpcStatus<Req>>, BrokerError> {
        let Some(raw) = self.broker.get(&self.rpc_spec.status_key()).await? else {
            return Ok(None);
        };
        Ok(serde_json::from_slice(&raw).ok())
    }

    /// Close the response subscription.
    pub async fn close(&self) {
        self.response_sub.close().await;
    }
}

/// Errors [`RpcClient::new`] may return.
#[derive(Debug, thiserror::Error)]
pub enum NewError {
    /// The response subscription could not be opened.
    #[error(transparent)]
    Subscriber(#[from] subscriber::NewError),
}

/// Errors [`RpcClient::call`] may return.
#[derive(Debug, thiserror::Error)]
pub enum CallError {
    /// The request failed to publish.
    #[error(transparent)]
    Publish(#[from] publisher::PublishError),
    /// The response subscription was closed before a response arrived.
    #[error("response subscription closed before a response arrived")]
    SubscriptionClosed,
}

/// Convenience wrapper around [`RpcClient::call`] that applies a timeout, since the
/// core itself defines none (`spec.md` §9: "callers wrap with their own timeout if
/// needed").
pub async fn call_with_timeout<Req: Message, Ret: RpcReturn>(
    client: &RpcClient<Req, Ret>,
    request_msg: Req,
    timeout: Duration,
) -> Result<RpcResponse<Req, Ret>, CallWithTimeoutError> {
    tokio::time::timeout(timeout, client.call(request_msg))
        .await
        .map_err(|_| CallWithTimeoutError::Timeout)?
        .map_err(CallWithTimeoutError::Call)
}

/// Errors [`call_with_timeout`] may return.
#[derive(Debug, thiserror::Error)]
pub enum CallWithTimeoutError {
    /// The call itself failed.
    #[error(transparent)]
    Call(#[from] CallError),
    /// No response arrived before the timeout elapsed.
    #[error("rpc call timed out")]
    Timeout,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::memory::MemoryBroker;
    use crate::broker_spec::BrokerSpec;
    use crate::message::Transport;
    use serde::{Deserialize, Serialize};

    #[derive(Debug, Clone, Serialize, Deserialize)]
    struct PingRequest {
        #[serde(flatten)]
        transport: Transport,
    }
    crate::impl_message!(PingRequest);

    fn rpc_spec() -> RpcSpec<PingRequest, ()> {
        RpcSpec::new(BrokerSpec::new("b", 1), "ping")
    }

    #[tokio::test]
    async fn get_status_is_none_before_any_server_exists() {
        let broker: Arc<dyn Broker> = Arc::new(MemoryBroker::new());
        let client = RpcClient::new(NodeId::new("client"), rpc_spec(), broker)
            .await
            .unwrap();
        assert!(client.get_status().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn call_with_timeout_times_out_with_no_server_running() {
        let broker: Arc<dyn Broker> = Arc::new(MemoryBroker::new());
        let client = RpcClient::new(NodeId::new("client"), rpc_spec(), broker)
            .await
            .unwrap();
        let request = PingRequest {
            transport: Transport::default(),
        };
        let result = call_with_timeout(&client, request, Duration::from_millis(20)).await;
        assert!(matches!(result, Err(CallWithTimeoutError::Timeout)));
    }
}
