//! [`RpcServer`] definition.
use std::sync::Arc;

use futures::future::BoxFuture;
use tokio::sync::Mutex;
use tokio::task::AbortHandle;
use tracing::{instrument, warn};

use crate::broker::{Broker, BrokerError};
use crate::message::{Message, RpcCancel, RpcResponse, RpcReturn, RpcStatus};
use crate::node_id::NodeId;
use crate::publisher::Publisher;
use crate::rpc_spec::RpcSpec;
use crate::subscriber::{self, Subscriber};

/// A procedure implementation: takes the request, returns the business result or a
/// first-class error (formatted into `traceback_str` on failure, per `spec.md` §7's
/// "business errors are a first-class payload, not out-of-band exceptions").
pub type ProcFunc<Req, Ret> =
    Box<dyn Fn(Req) -> BoxFuture<'static, Result<Ret, anyhow::Error>> + Send + Sync>;

/// State for the procedure currently executing, if any.
struct CurCall<Req> {
    request_msg: Req,
    abort_handle: AbortHandle,
}

/// Shared server state, referenced from both the request and cancel subscriber
/// callbacks.
struct Inner<Req: Message, Ret: RpcReturn> {
    node_id: NodeId,
    rpc_spec: RpcSpec<Req, Ret>,
    broker: Arc<dyn Broker>,
    proc_func: ProcFunc<Req, Ret>,
    cur_call: Mutex<Option<CurCall<Req>>>,
}

impl<Req: Message, Ret: RpcReturn> Inner<Req, Ret> {
    /// Republish this server's current status (ready, or busy with whatever request is
    /// stored in `cur_call` right now).
    async fn republish_status(&self) -> Result<(), BrokerError> {
        let status = {
            let cur_call = self.cur_call.lock().await;
            match cur_call.as_ref() {
                Some(call) => RpcStatus::busy(self.node_id.clone(), call.request_msg.clone()),
                None => RpcStatus::new(self.node_id.clone()),
            }
        };
        let payload = serde_json::to_vec(&status).map_err(|err| BrokerError::Operation(err.into()))?;
        self.broker.set(&self.rpc_spec.status_key(), payload).await
    }

    #[instrument(skip_all, fields(channel = self.rpc_spec.base_channel(), node = %self.node_id))]
    async fn handle_request(self: Arc<Self>, request_msg: Req) {
        let sender_id = request_msg.transport().sender_id.clone();
        let start = tokio::time::Instant::now();

        let task = tokio::spawn((self.proc_func)(request_msg.clone()));
        {
            let mut cur_call = self.cur_call.lock().await;
            *cur_call = Some(CurCall {
                request_msg: request_msg.clone(),
                abort_handle: task.abort_handle(),
            });
        }
        if let Err(err) = self.republish_status().await {
            warn!("failed to publish busy status: {err}");
        }

        let response = match task.await {
            Ok(Ok(return_val)) => {
                RpcResponse::new_completed(request_msg, start.elapsed().as_secs_f64(), return_val)
            }
            Ok(Err(err)) => RpcResponse::new_errored(
                request_msg,
                start.elapsed().as_secs_f64(),
                format!("{err:?}"),
            ),
            Err(join_err) if join_err.is_cancelled() => {
                RpcResponse::new_cancelled(request_msg, start.elapsed().as_secs_f64())
            }
            Err(join_err) => RpcResponse::new_errored(
                request_msg,
                start.elapsed().as_secs_f64(),
                format!("{join_err:?}"),
            ),
        };

        self.publish_response(response, sender_id).await;

        {
            let mut cur_call = self.cur_call.lock().await;
            *cur_call = None;
        }
        if let Err(err) = self.republish_status().await {
            warn!("failed to publish ready status: {err}");
        }
    }

    async fn publish_response(&self, response: RpcResponse<Req, Ret>, sender_id: Option<NodeId>) {
        let Some(sender_id) = sender_id else {
            warn!("malformed RPC response: request had no sender_id");
            return;
        };
        // Publishers are cheap; a throwaway one for this particular response matches
        // `spec.md` §4.5.
        let response_pub = Publisher::new(
            self.node_id.clone(),
            self.rpc_spec.response_topic_spec(&sender_id),
            self.broker.clone(),
        );
        if let Err(err) = response_pub.publish(response).await {
            warn!("failed to publish RPC response: {err}");
        }
    }

    async fn handle_cancel(self: Arc<Self>, _cancel_msg: RpcCancel) {
        let cur_call = self.cur_call.lock().await;
        if let Some(call) = cur_call.as_ref() {
            call.abort_handle.abort();
        }
    }
}

/// Dispatches requests for one [`RpcSpec`] to a user-provided procedure, handles
/// cancellation, and advertises liveness/busyness in the broker's key/value store.
/// Exactly one server may own an `RpcSpec`'s status key at a time; constructing a
/// second one fails with [`NewError::DuplicateServer`].
pub struct RpcServer<Req: Message, Ret: RpcReturn> {
    inner: Arc<Inner<Req, Ret>>,
    rpc_spec: RpcSpec<Req, Ret>,
    broker: Arc<dyn Broker>,
    request_sub: Subscriber<Req>,
    cancel_sub: Subscriber<RpcCancel>,
}

impl<Req: Message, Ret: RpcReturn> RpcServer<Req, Ret> {
    /// Claim `rpc_spec`'s status key for `node_id` and start listening for requests and
    /// cancellations. `proc_func` runs once per request, serialized by the request
    /// subscriber (one in flight at a time).
    ///
    /// # Errors
    /// Returns [`NewError::DuplicateServer`] if another node already owns the status
    /// key. This check is best-effort (TOCTOU) per `spec.md` §4.5/§9 -- it assumes
    /// server startup is rare, not that it's impossible to race. Returns
    /// [`NewError::MalformedStatus`] if the existing status key's value cannot be
    /// decoded -- matching `ipc/rpc.py`'s `_update_status`, which lets
    /// `RPCStatus.parse_raw` raise rather than treating an undecodable value as an
    /// absent one.
    pub async fn new(
        node_id: NodeId,
        rpc_spec: RpcSpec<Req, Ret>,
        proc_func: ProcFunc<Req, Ret>,
        broker: Arc<dyn Broker>,
    ) -> Result<Self, NewError> {
        if let Some(raw) = broker.get(&rpc_spec.status_key()).await? {
            let existing: RpcStatus<Req> =
                serde_json::from_slice(&raw).map_err(NewError::MalformedStatus)?;
            if existing.server_id != node_id {
                return Err(NewError::DuplicateServer(existing.server_id));
            }
        }

        let inner = Arc::new(Inner {
            node_id: node_id.clone(),
            rpc_spec: rpc_spec.clone(),
            broker: broker.clone(),
            proc_func,
            cur_call: Mutex::new(None),
        });
        inner.republish_status().await?;

        let request_inner = inner.clone();
        let request_sub = Subscriber::new(
            node_id.clone(),
            rpc_spec.request_topic_spec(),
            Some(subscriber::callback(move |msg| {
                let inner = request_inner.clone();
                async move { inner.handle_request(msg).await }
            })),
            broker.clone(),
        )
        .await?;

        let cancel_inner = inner.clone();
        let cancel_sub = Subscriber::new(
            node_id,
            rpc_spec.cancel_topic_spec(),
            Some(subscriber::callback(move |msg| {
                let inner = cancel_inner.clone();
                async move { inner.handle_cancel(msg).await }
            })),
            broker.clone(),
        )
        .await?;

        Ok(Self {
            inner,
            rpc_spec,
            broker,
            request_sub,
            cancel_sub,
        })
    }

    /// Run both the request and cancel listen-loops concurrently until the server is
    /// dropped or its subscriptions are closed.
    pub async fn serve(&self) {
        tokio::join!(self.request_sub.listen(), self.cancel_sub.listen());
    }

    /// Delete the status key and close both subscriptions.
    pub async fn close(&self) {
        if let Err(err) = self.broker.delete(&self.rpc_spec.status_key()).await {
            warn!("failed to delete RPC status key on close: {err}");
        }
        self.request_sub.close().await;
        self.cancel_sub.close().await;
    }
}

/// Errors [`RpcServer::new`] may return.
#[derive(Debug, thiserror::Error)]
pub enum NewError {
    /// Another node already owns this RPC's status key.
    #[error("RPC already served by node {0}")]
    DuplicateServer(NodeId),
    /// The existing status key's value could not be decoded as an [`RpcStatus`].
    #[error("existing RPC status key is malformed: {0}")]
    MalformedStatus(#[source] serde_json::Error),
    /// The broker could not be reached to check or write the status key, or a
    /// subscription could not be opened.
    #[error(transparent)]
    Broker(#[from] BrokerError),
    /// A subscriber could not be constructed.
    #[error(transparent)]
    Subscriber(#[from] subscriber::NewError),
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::memory::MemoryBroker;
    use crate::broker_spec::BrokerSpec;
    use crate::message::Transport;
    use crate::rpc::client::RpcClient;
    use serde::{Deserialize, Serialize};
    use std::time::Duration;

    #[derive(Debug, Clone, Serialize, Deserialize)]
    struct DebugRequest {
        #[serde(flatten)]
        transport: Transport,
        content: String,
    }
    crate::impl_message!(DebugRequest);

    fn rpc_spec() -> RpcSpec<DebugRequest, String> {
        RpcSpec::new(BrokerSpec::new("b", 1), "debug")
    }

    fn request(content: &str) -> DebugRequest {
        DebugRequest {
            transport: Transport::default(),
            content: content.to_string(),
        }
    }

    #[tokio::test]
    async fn second_server_rejects_with_duplicate_server() {
        let broker: Arc<dyn Broker> = Arc::new(MemoryBroker::new());
        let _server1 = RpcServer::new(
            NodeId::new("navigate_server"),
            rpc_spec(),
            Box::new(|req: DebugRequest| Box::pin(async move { Ok::<_, anyhow::Error>(req.content) })),
            broker.clone(),
        )
        .await
        .unwrap();

        let err = RpcServer::new(
            NodeId::new("navigate_server_2"),
            rpc_spec(),
            Box::new(|req: DebugRequest| Box::pin(async move { Ok::<_, anyhow::Error>(req.content) })),
            broker,
        )
        .await
        .unwrap_err();

        assert!(matches!(err, NewError::DuplicateServer(id) if id.name() == "navigate_server"));
    }

    #[tokio::test]
    async fn errored_procedure_surfaces_in_traceback_str() {
        let broker: Arc<dyn Broker> = Arc::new(MemoryBroker::new());
        let server = RpcServer::new(
            NodeId::new("server"),
            rpc_spec(),
            Box::new(|_req: DebugRequest| {
                Box::pin(async move { Err::<String, _>(anyhow::anyhow!("division by zero")) })
            }),
            broker.clone(),
        )
        .await
        .unwrap();
        let server = Arc::new(server);
        let serve_task = {
            let server = server.clone();
            tokio::spawn(async move { server.serve().await })
        };

        let client = RpcClient::new(NodeId::new("client"), rpc_spec(), broker)
            .await
            .unwrap();
        let response = client.call(request("divide")).await.unwrap();

        assert!(response.errored());
        assert!(!response.cancelled);
        assert!(!response.completed());
        assert!(response.traceback_str.unwrap().contains("division by zero"));
        assert!(response.duration >= 0.0);

        serve_task.abort();
    }

    #[tokio::test]
    async fn cancel_stops_a_running_procedure() {
        let broker: Arc<dyn Broker> = Arc::new(MemoryBroker::new());
        let server = RpcServer::new(
            NodeId::new("server"),
            rpc_spec(),
            Box::new(|req: DebugRequest| {
                Box::pin(async move {
                    tokio::time::sleep(Duration::from_secs(10)).await;
                    Ok::<_, anyhow::Error>(req.content)
                })
            }),
            broker.clone(),
        )
        .await
        .unwrap();
        let server = Arc::new(server);
        let serve_task = {
            let server = server.clone();
            tokio::spawn(async move { server.serve().await })
        };

        let client_x = RpcClient::new(NodeId::new("x"), rpc_spec(), broker.clone())
            .await
            .unwrap();
        let client_y = RpcClient::new(NodeId::new("y"), rpc_spec(), broker)
            .await
            .unwrap();

        let call_task = tokio::spawn(async move { client_x.call(request("slow")).await });
        tokio::time::sleep(Duration::from_millis(50)).await;
        client_y.cancel_running_procedure().await.unwrap();

        let response = tokio::time::timeout(Duration::from_secs(5), call_task)
            .await
            .unwrap()
            .unwrap()
            .unwrap();

        assert!(response.cancelled);
        assert!(response.traceback_str.is_none());
        assert!(response.return_val.is_none());
        assert!(response.duration < 10.0);

        serve_task.abort();
    }

    #[tokio::test]
    async fn cancel_with_no_running_procedure_is_a_no_op() {
        let broker: Arc<dyn Broker> = Arc::new(MemoryBroker::new());
        let server = RpcServer::new(
            NodeId::new("server"),
            rpc_spec(),
            Box::new(|req: DebugRequest| Box::pin(async move { Ok::<_, anyhow::Error>(req.content) })),
            broker.clone(),
        )
        .await
        .unwrap();
        let server = Arc::new(server);
        let serve_task = {
            let server = server.clone();
            tokio::spawn(async move { server.serve().await })
        };

        let client = RpcClient::new(NodeId::new("idle"), rpc_spec(), broker)
            .await
            .unwrap();
        client.cancel_running_procedure().await.unwrap();

        let response = client.call(request("hello")).await.unwrap();
        assert!(response.completed());
        assert_eq!(response.return_val.as_deref(), Some("hello"));

        serve_task.abort();
    }

    #[tokio::test]
    async fn two_clients_each_receive_only_their_own_response() {
        let broker: Arc<dyn Broker> = Arc::new(MemoryBroker::new());
        let server = RpcServer::new(
            NodeId::new("server"),
            rpc_spec(),
            Box::new(|req: DebugRequest| Box::pin(async move { Ok::<_, anyhow::Error>(req.content) })),
            broker.clone(),
        )
        .await
        .unwrap();
        let server = Arc::new(server);
        let serve_task = {
            let server = server.clone();
            tokio::spawn(async move { server.serve().await })
        };

        let c1 = RpcClient::new(NodeId::new("c1"), rpc_spec(), broker.clone())
            .await
            .unwrap();
        let c2 = RpcClient::new(NodeId::new("c2"), rpc_spec(), broker)
            .await
            .unwrap();

        let (r1, r2) = tokio::join!(c1.call(request("from c1")), c2.call(request("from c2")));
        let r1 = r1.unwrap();
        let r2 = r2.unwrap();

        assert_eq!(r1.request_msg.content, "from c1");
        assert_eq!(r2.request_msg.content, "from c2");
        assert_eq!(r1.return_val.as_deref(), Some("from c1"));
        assert_eq!(r2.return_val.as_deref(), Some("from c2"));

        serve_task.abort();
    }

    #[tokio::test]
    async fn status_key_reflects_current_request_while_executing() {
        let broker: Arc<dyn Broker> = Arc::new(MemoryBroker::new());
        let server = RpcServer::new(
            NodeId::new("server"),
            rpc_spec(),
            Box::new(|req: DebugRequest| {
                Box::pin(async move {
                    tokio::time::sleep(Duration::from_millis(200)).await;
                    Ok::<_, anyhow::Error>(req.content)
                })
            }),
            broker.clone(),
        )
        .await
        .unwrap();
        let server = Arc::new(server);
        let serve_task = {
            let server = server.clone();
            tokio::spawn(async move { server.serve().await })
        };

        let client = RpcClient::new(NodeId::new("client"), rpc_spec(), broker.clone())
            .await
            .unwrap();
        let status = client.get_status().await.unwrap().unwrap();
        assert!(status.ready());
        assert!(status.cur_request.is_none());

        let call_task = tokio::spawn(async move { client.call(request("busy")).await });
        tokio::time::sleep(Duration::from_millis(50)).await;

        let raw = broker.get(&rpc_spec().status_key()).await.unwrap().unwrap();
        let busy_status: RpcStatus<DebugRequest> = serde_json::from_slice(&raw).unwrap();
        assert!(!busy_status.ready());
        assert_eq!(busy_status.cur_request.unwrap().content, "busy");

        serve_task.abort();
        call_task.abort();
    }
}
