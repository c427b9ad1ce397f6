//! Broker-facing side of the gateway.
//!
//! The correlator publishes requests through the shared-bus
//! [`MessageBroker`](shared_bus::MessageBroker) and a per-instance reply
//! listener routes replies back to waiting callers.

pub mod correlator;
pub mod listener;
pub mod pool;

pub use correlator::{sweep_task, Correlator, Reply};
pub use listener::ReplyListener;
pub use pool::CorrelatorPool;
