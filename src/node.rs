//! [`NodeRuntime`]: composes publishers, subscribers, RPC clients/servers, and
//! user-provided background tasks into one cooperatively-scheduled process.
//!
//! `spec.md` §4.7 describes a `BaseNode` holding dynamic registries of publishers and
//! subscribers keyed by spec, looked up again at publish/call time. That registry shape
//! only exists in the source because Python's `msg_cls` binding is a runtime value; here
//! each topic/RPC is already a distinct Rust type, so a business node holds its
//! `Publisher<M>` / `Subscriber<M>` / `RpcClient<Req, Ret>` / `RpcServer<Req, Ret>`
//! values directly as named fields and calls methods on them without a second lookup.
//! `NodeRuntime` is reduced to exactly what `spec.md` §4.7/§5 requires irrespective of
//! storage shape: task lifecycle, grounded in the teacher's
//! `Client::consumer_set: Arc<Mutex<JoinSet<...>>>` pattern.
use std::future::Future;

use tokio::task::JoinSet;
use tracing::{info, instrument, warn};

use crate::node_id::NodeId;
use crate::util::signal_stop;

/// A node is a long-lived process holding one [`NodeId`] and a set of tasks:
/// subscriber listen-loops, RPC server serve-loops, and user-provided background work
/// (async or blocking), all cooperatively scheduled on one [`JoinSet`].
pub struct NodeRuntime {
    node_id: NodeId,
    tasks: JoinSet<()>,
}

impl NodeRuntime {
    /// Create an empty node runtime for `node_id`.
    #[must_use]
    pub fn new(node_id: NodeId) -> Self {
        Self {
            node_id,
            tasks: JoinSet::new(),
        }
    }

    /// This node's identity.
    #[must_use]
    pub fn node_id(&self) -> &NodeId {
        &self.node_id
    }

    /// Register an asynchronous task (a subscriber's `listen()`, an RPC server's
    /// `serve()`, or a user async task function) to run on this node's cooperative
    /// scheduler.
    pub fn spawn<F>(&mut self, task: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.tasks.spawn(task);
    }

    /// Register a blocking task (e.g. a hardware read loop) onto Tokio's blocking
    /// thread pool -- this *is* the "bounded thread-pool executor" `spec.md` §4.7
    /// calls for; no hand-rolled pool is needed.
    pub fn spawn_blocking<F>(&mut self, task: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.tasks.spawn_blocking(task);
    }

    /// Await every registered task concurrently until either all complete, or a
    /// shutdown signal (`SIGINT`/`SIGTERM`) arrives -- the Rust analogue of the
    /// source's keyboard-interrupt handling. A task being cancelled (as happens to
    /// every still-running task once [`Self::stop`] runs) is not a failure, but a task
    /// that panics or is otherwise not joinable is `spec.md` §4.7's "any other
    /// exception... re-raises": it is collected and returned to the caller once
    /// cleanup has run, rather than silently logged forever.
    ///
    /// Always runs [`Self::stop`] on the way out, whichever path triggered it.
    ///
    /// # Errors
    /// Returns [`RunError::TaskFailed`] if any registered task panicked or could
    /// otherwise not be joined.
    #[instrument(skip_all, fields(node = %self.node_id))]
    pub async fn run(mut self) -> Result<(), RunError> {
        let result = tokio::select! {
            result = Self::drain(&mut self.tasks) => {
                if result.is_ok() {
                    info!("all tasks completed");
                }
                result
            }
            result = signal_stop() => {
                match result {
                    Ok(()) => info!("shutting down on signal"),
                    Err(err) => warn!("signal listener failed, shutting down anyway: {err}"),
                }
                Ok(())
            }
        };
        self.stop().await;
        result
    }

    /// Synchronous entry point: builds and owns a fresh single-threaded Tokio runtime
    /// and blocks on [`Self::run`]. Lets a node be started from a plain `fn main`
    /// without the caller needing an existing async context, matching `spec.md`
    /// §4.7's "`run()` is callable from a synchronous context."
    ///
    /// # Errors
    /// Returns [`RunError::TaskFailed`] if any registered task panicked or could
    /// otherwise not be joined.
    ///
    /// # Panics
    /// Panics if a current-thread Tokio runtime cannot be built.
    pub fn run_blocking(self) -> Result<(), RunError> {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .expect("failed to build node runtime");
        runtime.block_on(self.run())
    }

    /// Join every running task. A cancelled task is expected (it is how [`Self::stop`]
    /// tears things down) and is skipped; the first task that panicked or otherwise
    /// failed to join is recorded and returned once every task has been drained, so a
    /// real failure always surfaces to [`Self::run`]'s caller.
    async fn drain(tasks: &mut JoinSet<()>) -> Result<(), RunError> {
        let mut first_failure = None;
        while let Some(result) = tasks.join_next().await {
            if let Err(err) = result {
                if err.is_cancelled() {
                    continue;
                }
                warn!("node task failed: {err}");
                first_failure.get_or_insert(err);
            }
        }
        match first_failure {
            Some(err) => Err(RunError::TaskFailed(err.to_string())),
            None => Ok(()),
        }
    }

    /// Abort every still-running task without waiting for them to finish.
    pub async fn stop(&mut self) {
        self.tasks.abort_all();
        while self.tasks.join_next().await.is_some() {}
    }
}

/// Errors [`NodeRuntime::run`] and [`NodeRuntime::run_blocking`] may return.
#[derive(Debug, thiserror::Error)]
pub enum RunError {
    /// A registered task panicked or otherwise failed to join.
    #[error("node task failed: {0}")]
    TaskFailed(String),
}
