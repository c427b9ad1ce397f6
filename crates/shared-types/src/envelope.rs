//! # Broker Envelope
//!
//! The wire wrapper for every message that crosses the broker.
//!
//! ## Header Rules
//!
//! - **Versioning**: every envelope carries a `version` for forward compatibility.
//! - **Correlation**: requests carry both `correlation_id` and `reply_to`;
//!   replies carry the `correlation_id` copied from the request and nothing else.
//! - **Opaque payload**: the body is raw bytes, never inspected in transit.

use crate::CorrelationId;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::time::{SystemTime, UNIX_EPOCH};
use thiserror::Error;

/// Errors raised when a raw envelope lacks the headers its role requires.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum EnvelopeError {
    /// The envelope has no correlation id header.
    #[error("envelope has no correlation id")]
    MissingCorrelationId,

    /// A request envelope has no reply destination.
    #[error("request envelope has no reply destination")]
    MissingReplyTo,

    /// The envelope was written by an unsupported protocol version.
    #[error("unsupported envelope version {received} (supported: {supported})")]
    UnsupportedVersion { received: u16, supported: u16 },
}

/// A message as it travels through the broker: headers plus opaque payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope {
    /// Protocol version for forward compatibility.
    pub version: u16,

    /// Correlation header. Present on requests and replies.
    pub correlation_id: Option<CorrelationId>,

    /// Destination the consumer must publish its reply to.
    /// Present on requests only.
    pub reply_to: Option<String>,

    /// Milliseconds since the Unix epoch when the envelope was created.
    pub timestamp_ms: u64,

    /// Message body.
    pub payload: Bytes,
}

impl Envelope {
    /// Current protocol version.
    pub const CURRENT_VERSION: u16 = 1;

    /// Create an envelope with no headers set.
    pub fn new(payload: impl Into<Bytes>) -> Self {
        Self {
            version: Self::CURRENT_VERSION,
            correlation_id: None,
            reply_to: None,
            timestamp_ms: now_ms(),
            payload: payload.into(),
        }
    }

    /// Set the correlation header.
    #[must_use]
    pub fn with_correlation_id(mut self, id: CorrelationId) -> Self {
        self.correlation_id = Some(id);
        self
    }

    /// Set the reply destination header.
    #[must_use]
    pub fn with_reply_to(mut self, reply_to: impl Into<String>) -> Self {
        self.reply_to = Some(reply_to.into());
        self
    }

    fn check_version(&self) -> Result<(), EnvelopeError> {
        if self.version != Self::CURRENT_VERSION {
            return Err(EnvelopeError::UnsupportedVersion {
                received: self.version,
                supported: Self::CURRENT_VERSION,
            });
        }
        Ok(())
    }
}

/// Outbound request published by the gateway.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestEnvelope {
    pub correlation_id: CorrelationId,
    pub reply_to: String,
    pub payload: Bytes,
}

impl RequestEnvelope {
    pub fn new(
        correlation_id: CorrelationId,
        reply_to: impl Into<String>,
        payload: impl Into<Bytes>,
    ) -> Self {
        Self {
            correlation_id,
            reply_to: reply_to.into(),
            payload: payload.into(),
        }
    }
}

impl From<RequestEnvelope> for Envelope {
    fn from(request: RequestEnvelope) -> Self {
        Envelope::new(request.payload)
            .with_correlation_id(request.correlation_id)
            .with_reply_to(request.reply_to)
    }
}

impl TryFrom<Envelope> for RequestEnvelope {
    type Error = EnvelopeError;

    fn try_from(envelope: Envelope) -> Result<Self, Self::Error> {
        envelope.check_version()?;
        let correlation_id = envelope
            .correlation_id
            .ok_or(EnvelopeError::MissingCorrelationId)?;
        let reply_to = envelope.reply_to.ok_or(EnvelopeError::MissingReplyTo)?;
        Ok(Self {
            correlation_id,
            reply_to,
            payload: envelope.payload,
        })
    }
}

/// Inbound reply consumed by the gateway's reply listener.
///
/// Not guaranteed to match any request this process submitted: stale replies
/// from timed-out requests or from before a restart are expected.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplyEnvelope {
    pub correlation_id: CorrelationId,
    pub payload: Bytes,
}

impl ReplyEnvelope {
    pub fn new(correlation_id: CorrelationId, payload: impl Into<Bytes>) -> Self {
        Self {
            correlation_id,
            payload: payload.into(),
        }
    }
}

impl From<ReplyEnvelope> for Envelope {
    fn from(reply: ReplyEnvelope) -> Self {
        Envelope::new(reply.payload).with_correlation_id(reply.correlation_id)
    }
}

impl TryFrom<Envelope> for ReplyEnvelope {
    type Error = EnvelopeError;

    fn try_from(envelope: Envelope) -> Result<Self, Self::Error> {
        envelope.check_version()?;
        let correlation_id = envelope
            .correlation_id
            .ok_or(EnvelopeError::MissingCorrelationId)?;
        Ok(Self {
            correlation_id,
            payload: envelope.payload,
        })
    }
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
