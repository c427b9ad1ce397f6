//! Correlator metrics.
//!
//! Naming follows `relay_<component>_<metric>_<unit>`. Every correlator owns
//! a registry carrying an `instance` const label, so several correlators in
//! one process (or one test binary) never share a sample. Exported as JSON
//! for the admin server and, with the `metrics` feature, in Prometheus text
//! format.

use crate::domain::error::CallError;
use prometheus::{exponential_buckets, Histogram, HistogramOpts, IntCounter, Registry};
use std::collections::HashMap;
use std::time::Duration;

/// Per-correlator metrics
pub struct CorrelatorMetrics {
    registry: Registry,

    // Submission outcomes
    pub submitted: IntCounter,
    pub fulfilled: IntCounter,
    pub timeouts: IntCounter,
    pub publish_failures: IntCounter,
    pub disconnect_failures: IntCounter,
    pub cancelled: IntCounter,
    pub backend_errors: IntCounter,

    // Reply listener
    pub stale_replies: IntCounter,
    pub malformed_replies: IntCounter,
    pub disconnects: IntCounter,

    /// Registration to resolution, in seconds
    pub latency: Histogram,
}

fn counter(registry: &Registry, name: &str, help: &str) -> Result<IntCounter, prometheus::Error> {
    let counter = IntCounter::new(name, help)?;
    registry.register(Box::new(counter.clone()))?;
    Ok(counter)
}

impl CorrelatorMetrics {
    /// Create the metrics for correlator `instance` in a registry of their own.
    pub fn new(instance: &str) -> Result<Self, prometheus::Error> {
        let labels = HashMap::from([("instance".to_string(), instance.to_string())]);
        let registry = Registry::new_custom(None, Some(labels))?;

        // 0.5ms .. ~33s
        let latency = Histogram::with_opts(
            HistogramOpts::new(
                "relay_request_latency_seconds",
                "Time from registering a request to resolving it",
            )
            .buckets(exponential_buckets(0.0005, 2.0, 17)?),
        )?;
        registry.register(Box::new(latency.clone()))?;

        Ok(Self {
            submitted: counter(&registry, "relay_requests_submitted_total", "Requests submitted")?,
            fulfilled: counter(
                &registry,
                "relay_requests_fulfilled_total",
                "Requests answered by a worker",
            )?,
            timeouts: counter(&registry, "relay_requests_timeout_total", "Requests that timed out")?,
            publish_failures: counter(
                &registry,
                "relay_publish_failures_total",
                "Requests the broker refused",
            )?,
            disconnect_failures: counter(
                &registry,
                "relay_disconnect_failures_total",
                "Requests failed by a broker disconnect",
            )?,
            cancelled: counter(
                &registry,
                "relay_requests_cancelled_total",
                "Requests abandoned or cancelled",
            )?,
            backend_errors: counter(
                &registry,
                "relay_backend_errors_total",
                "Pending-state backend failures",
            )?,
            stale_replies: counter(
                &registry,
                "relay_stale_replies_total",
                "Replies with no pending request",
            )?,
            malformed_replies: counter(
                &registry,
                "relay_malformed_replies_total",
                "Replies without a usable correlation id",
            )?,
            disconnects: counter(
                &registry,
                "relay_broker_disconnects_total",
                "Reply stream disconnects",
            )?,
            latency,
            registry,
        })
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn record_submitted(&self) {
        self.submitted.inc();
    }

    /// Record a successful round trip
    pub fn record_fulfilled(&self, latency: Duration) {
        self.fulfilled.inc();
        self.latency.observe(latency.as_secs_f64());
    }

    /// Record a failed submission
    pub fn record_failure(&self, error: &CallError) {
        let counter = match error {
            CallError::Timeout { .. } => &self.timeouts,
            CallError::PublishFailed(_) => &self.publish_failures,
            CallError::BrokerDisconnected => &self.disconnect_failures,
            CallError::Cancelled => &self.cancelled,
            CallError::Backend(_) => &self.backend_errors,
        };
        counter.inc();
    }

    /// Record a caller that went away before its request resolved
    pub fn record_abandoned(&self) {
        self.cancelled.inc();
    }

    pub fn record_stale_reply(&self) {
        self.stale_replies.inc();
    }

    pub fn record_malformed_reply(&self) {
        self.malformed_replies.inc();
    }

    pub fn record_disconnect(&self) {
        self.disconnects.inc();
    }

    /// Get average latency in ms
    pub fn average_latency_ms(&self) -> f64 {
        let count = self.latency.get_sample_count();
        if count == 0 {
            0.0
        } else {
            self.latency.get_sample_sum() * 1000.0 / count as f64
        }
    }

    /// Export metrics as JSON
    pub fn to_json(&self) -> serde_json::Value {
        serde_json::json!({
            "requests": {
                "submitted": self.submitted.get(),
                "fulfilled": self.fulfilled.get(),
                "timeouts": self.timeouts.get(),
                "publish_failures": self.publish_failures.get(),
                "disconnect_failures": self.disconnect_failures.get(),
                "cancelled": self.cancelled.get(),
                "backend_errors": self.backend_errors.get(),
            },
            "replies": {
                "stale": self.stale_replies.get(),
                "malformed": self.malformed_replies.get(),
            },
            "broker": {
                "disconnects": self.disconnects.get(),
            },
            "latency": {
                "count": self.latency.get_sample_count(),
                "average_ms": self.average_latency_ms(),
            }
        })
    }

    /// Export metrics in Prometheus text format.
    #[cfg(feature = "metrics")]
    pub fn to_prometheus(&self) -> Result<String, prometheus::Error> {
        render_prometheus(&[self])
    }
}

/// Render several correlators' metrics as one Prometheus exposition.
///
/// Families with the same name are merged so each appears once, with one
/// sample set per instance.
#[cfg(feature = "metrics")]
pub fn render_prometheus(instances: &[&CorrelatorMetrics]) -> Result<String, prometheus::Error> {
    use prometheus::proto::MetricFamily;
    use prometheus::{Encoder, TextEncoder};
    use std::collections::BTreeMap;

    let mut merged: BTreeMap<String, MetricFamily> = BTreeMap::new();
    for metrics in instances {
        for mut family in metrics.registry.gather() {
            match merged.get_mut(family.get_name()) {
                Some(existing) => {
                    for metric in family.take_metric().into_iter() {
                        existing.mut_metric().push(metric);
                    }
                }
                None => {
                    merged.insert(family.get_name().to_string(), family);
                }
            }
        }
    }

    let families: Vec<MetricFamily> = merged.into_values().collect();
    let mut buffer = Vec::new();
    TextEncoder::new().encode(&families, &mut buffer)?;
    String::from_utf8(buffer).map_err(|e| prometheus::Error::Msg(e.to_string()))
}
