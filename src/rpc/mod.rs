//! RPC layer: request dispatch, cancellation, and server-status advertising, built on
//! top of [`crate::publisher::Publisher`] / [`crate::subscriber::Subscriber`].

pub mod client;
pub mod server;

pub use client::RpcClient;
pub use server::RpcServer;
