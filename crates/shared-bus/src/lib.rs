//! # Shared Bus - Broker Adapter for Request/Reply
//!
//! The minimal broker capability contract the correlation engine depends on,
//! plus an in-process implementation with AMQP-like semantics.
//!
//! ## Contract
//!
//! - `publish(destination, envelope)`: hand a message to the broker.
//! - `subscribe_replies(destination)`: unbounded stream of replies, in the
//!   order the broker delivers them, ending only when the connection drops.
//! - `consume(queue, prefetch)` + `Delivery::ack`: worker-side consumption
//!   with at-least-once semantics (unacked deliveries are redelivered).
//!
//! ## Request/Reply Flow
//!
//! ```text
//! ┌──────────────┐  publish(rpc_queue)   ┌──────────────┐
//! │   Gateway    │ ────────────────────▶ │   Workers    │
//! │ (Correlator) │                       │ (prefetch=1) │
//! │              │ ◀──────────────────── │              │
//! └──────────────┘  publish(reply_to)    └──────────────┘
//!        ▲                                      │
//!        │ subscribe_replies(amq.gen-*)         │ ack
//! ```
//!
//! Each gateway instance declares its own exclusive, server-named reply queue,
//! so replies always return to the process that is waiting for them.

// Nursery lints that are too strict
#![allow(clippy::missing_const_for_fn)]
// Allow in tests
#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]
#![cfg_attr(test, allow(clippy::panic))]

pub mod publisher;
pub mod subscriber;

// Re-export main types
pub use publisher::{BrokerError, BrokerStats, BrokerStatsSnapshot, InMemoryBroker, MessageBroker};
pub use subscriber::{Delivery, DeliveryHandle, DeliveryStream, ReplyStream};

/// Default number of unacknowledged deliveries a worker may hold.
pub const DEFAULT_PREFETCH: usize = 1;

/// Prefix for server-named exclusive reply queues.
pub const REPLY_QUEUE_PREFIX: &str = "amq.gen-";

/// Default request queue name.
pub const DEFAULT_REQUEST_QUEUE: &str = "rpc_queue";
