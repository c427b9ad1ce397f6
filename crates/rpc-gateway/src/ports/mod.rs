//! Ports of the gateway.

pub mod inbound;

pub use inbound::CallHandler;
