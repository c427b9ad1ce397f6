//! Inbound port: the call gateway boundary.

use crate::domain::error::{CallError, GatewayError};
use crate::domain::pending::PendingInfo;
use crate::ipc::{Correlator, CorrelatorPool, Reply};
use async_trait::async_trait;
use bytes::Bytes;
use std::time::Duration;

/// What the call surface needs from the correlation engine.
#[async_trait]
pub trait CallHandler: Send + Sync {
    /// Forward `input` and wait for its reply. `None` uses the default timeout.
    async fn handle(&self, input: Bytes, timeout: Option<Duration>) -> Result<Reply, CallError>;

    /// Requests currently waiting for a reply
    fn pending_count(&self) -> usize;

    fn pending_entries(&self) -> Vec<PendingInfo>;

    /// Whether the broker connection is up
    fn is_healthy(&self) -> bool;

    /// Metrics as JSON
    fn metrics_json(&self) -> serde_json::Value;

    /// Metrics in Prometheus text format
    #[cfg(feature = "metrics")]
    fn metrics_prometheus(&self) -> Result<String, GatewayError>;
}

#[async_trait]
impl CallHandler for Correlator {
    async fn handle(&self, input: Bytes, timeout: Option<Duration>) -> Result<Reply, CallError> {
        self.call(input, timeout).await
    }

    fn pending_count(&self) -> usize {
        Correlator::pending_count(self)
    }

    fn pending_entries(&self) -> Vec<PendingInfo> {
        Correlator::pending_entries(self)
    }

    fn is_healthy(&self) -> bool {
        self.is_connected()
    }

    fn metrics_json(&self) -> serde_json::Value {
        serde_json::json!({
            "instance": self.name(),
            "reply_to": self.reply_to(),
            "pending": self.table().len(),
            "table": self.table().stats().to_json(),
            "correlator": self.metrics().to_json(),
        })
    }

    #[cfg(feature = "metrics")]
    fn metrics_prometheus(&self) -> Result<String, GatewayError> {
        Ok(self.metrics().to_prometheus()?)
    }
}

#[async_trait]
impl CallHandler for CorrelatorPool {
    async fn handle(&self, input: Bytes, timeout: Option<Duration>) -> Result<Reply, CallError> {
        self.call(input, timeout).await
    }

    fn pending_count(&self) -> usize {
        CorrelatorPool::pending_count(self)
    }

    fn pending_entries(&self) -> Vec<PendingInfo> {
        CorrelatorPool::pending_entries(self)
    }

    fn is_healthy(&self) -> bool {
        self.is_connected()
    }

    fn metrics_json(&self) -> serde_json::Value {
        let instances: Vec<serde_json::Value> = self
            .instances()
            .iter()
            .map(|c| CallHandler::metrics_json(c.as_ref()))
            .collect();
        serde_json::json!({
            "pending": CorrelatorPool::pending_count(self),
            "instances": instances,
        })
    }

    #[cfg(feature = "metrics")]
    fn metrics_prometheus(&self) -> Result<String, GatewayError> {
        let instances: Vec<&crate::metrics::CorrelatorMetrics> = self
            .instances()
            .iter()
            .map(|c| c.metrics().as_ref())
            .collect();
        Ok(crate::metrics::render_prometheus(&instances)?)
    }
}
