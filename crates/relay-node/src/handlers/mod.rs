//! # Handlers
//!
//! Broker consumers run by the node.

pub mod rpc_worker;

pub use rpc_worker::{compute_reply, ProcessError, RpcWorker};
