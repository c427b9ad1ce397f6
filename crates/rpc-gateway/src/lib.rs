#![allow(missing_docs)]

//! RPC Gateway - synchronous call surface over an asynchronous message broker.
//!
//! Each call is published to a shared request queue with a fresh correlation
//! id and a reply destination; the caller suspends until a worker's reply
//! with the same id arrives or the call times out.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────┐
//! │                          RPC GATEWAY                                │
//! ├─────────────────────────────────────────────────────────────────────┤
//! │  ┌──────────────┐                      ┌──────────────┐             │
//! │  │  HTTP call   │                      │    Admin     │             │
//! │  │  Port 3000   │                      │  Port 3001   │             │
//! │  └──────┬───────┘                      └──────┬───────┘             │
//! │         │         CallHandler                 │                     │
//! │  ┌──────┴─────────────────────────────────────┴──────┐              │
//! │  │          CorrelatorPool (round-robin)              │              │
//! │  └──────┬─────────────────────────────────────────────┘              │
//! │  ┌──────┴───────┐   ┌──────────────┐   ┌──────────────┐             │
//! │  │  Correlator  │──▶│ PendingTable │◀──│ReplyListener │             │
//! │  │   submit()   │   │ local/shared │   │ + sweeper    │             │
//! │  └──────┬───────┘   └──────────────┘   └──────▲───────┘             │
//! └─────────┼──────────────────────────────────────┼─────────────────────┘
//!           │ publish(rpc_queue)                   │ reply_to
//!           ▼                                      │
//!      ┌─────────────────── Message Broker ────────┴──┐
//!      │   rpc_queue ──▶ workers ──▶ amq.gen-* queue  │
//!      └──────────────────────────────────────────────┘
//! ```
//!
//! # Guarantees
//!
//! - Every submission resolves exactly once: reply, timeout, publish
//!   failure, broker disconnect or cancellation.
//! - A pending entry never outlives its resolution.
//! - Replies for unknown ids (late, duplicate, pre-restart) are discarded.
//!
//! # Usage
//!
//! ```ignore
//! use rpc_gateway::{CorrelatorPool, GatewayConfig, GatewayService};
//!
//! let config = GatewayConfig::default();
//! let pool = Arc::new(CorrelatorPool::start(broker, &config).await?);
//! let service = GatewayService::new(config, pool)?;
//! service.serve(shutdown_rx).await?;
//! ```

#![warn(clippy::all)]
#![deny(unsafe_code)]

pub mod domain;
pub mod ipc;
pub mod metrics;
pub mod ports;
pub mod service;

use tokio::sync::watch;

// Re-exports for public API
pub use domain::config::GatewayConfig;
pub use domain::error::{ApiError, ApiResult, CallError, GatewayError};
pub use ipc::{Correlator, CorrelatorPool, Reply};
pub use metrics::CorrelatorMetrics;
pub use ports::CallHandler;
pub use service::{GatewayService, ProcessRequest, ProcessResponse};

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Resolve once the shutdown flag is set or its sender is gone.
pub(crate) async fn wait_for_shutdown(shutdown: &mut watch::Receiver<bool>) {
    loop {
        if *shutdown.borrow_and_update() {
            return;
        }
        if shutdown.changed().await.is_err() {
            return;
        }
    }
}
