//! # Shared Types Crate
//!
//! Types that cross the broker boundary between the RPC gateway and the
//! worker pool.
//!
//! ## Design Principles
//!
//! - **Single Source of Truth**: the correlation id and envelope layout are
//!   defined once and used by the gateway, the broker adapter and the workers.
//! - **Opaque Payloads**: the gateway never interprets request or reply bytes.
//! - **Correlation in Headers**: the correlation id and reply destination travel
//!   as envelope headers, never inside the payload.

pub mod correlation;
pub mod envelope;

pub use correlation::CorrelationId;
pub use envelope::{Envelope, EnvelopeError, ReplyEnvelope, RequestEnvelope};
