//! # Node Container
//!
//! Configuration for everything the node wires together.

pub mod config;

pub use config::{NodeConfig, NodeConfigError, Overrides, WorkerConfig};
