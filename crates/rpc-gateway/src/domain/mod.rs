//! Domain types for the RPC gateway.
//!
//! Configuration, errors and the pending-request backends.

pub mod config;
pub mod error;
pub mod pending;
pub mod shared_store;

// Re-exports for convenience
pub use config::{
    BrokerConfig, ConfigError, CorrelationConfig, GatewayConfig, LimitsConfig, PendingBackend,
};
pub use error::{ApiError, ApiResult, CallError, GatewayError, PendingError};
pub use pending::{
    LocalPendingTable, Outcome, PendingInfo, PendingStats, PendingTable, Resolved, Waiter,
};
pub use shared_store::{EntryMetadata, InMemorySharedStore, SharedPendingTable, SharedStore};
pub use shared_types::CorrelationId;
