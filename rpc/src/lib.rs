//! Capability-based RPC with promise pipelining.
//!
//! Everything in this crate is single-threaded: clients, connections and
//! call contexts are `Rc`-based and background work is started with
//! `tokio::task::spawn_local`. Drive the system from inside a
//! [`tokio::task::LocalSet`].

mod cancel;
mod client;
pub mod config;
mod connection;
pub mod error;
mod local;
pub mod network;
mod payload;
mod pipeline;
mod queued;
mod request;
mod server;
mod system;
pub mod two_party;

pub use caprpc_protocol as protocol;
pub use caprpc_protocol::PipelineOp;
pub use caprpc_protocol::Value;
pub use client::Client;
pub use config::RpcConfig;
pub use error::Error;
pub use error::ErrorKind;
pub use error::Result;
pub use network::Connection;
pub use network::VatNetwork;
pub use payload::Payload;
pub use request::Pipeline;
pub use request::RemotePromise;
pub use request::Request;
pub use request::Response;
pub use server::CallContext;
pub use server::Server;
pub use server::unimplemented_method;
pub use system::BootstrapFactory;
pub use system::RpcSystem;

/// A pending result. All asynchronous operations in this crate return one.
pub type Promise<T> = futures::future::LocalBoxFuture<'static, Result<T>>;
