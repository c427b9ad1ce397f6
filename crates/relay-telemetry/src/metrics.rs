//! Prometheus metrics for the relay process.
//!
//! All metrics follow the naming convention: `relay_<component>_<metric>_<unit>`
//!
//! Correlator metrics live with the correlator itself; this registry holds
//! the worker side and process-wide gauges.

use lazy_static::lazy_static;
use prometheus::{
    exponential_buckets, Encoder, Histogram, HistogramOpts, IntCounter, IntCounterVec, IntGauge,
    Opts, Registry, TextEncoder,
};
use std::sync::OnceLock;

use crate::TelemetryError;

lazy_static! {
    /// Global metrics registry
    pub static ref REGISTRY: Registry = Registry::new();

    // =========================================================================
    // WORKER METRICS
    // =========================================================================

    /// Requests a worker answered and acknowledged
    pub static ref WORKER_MESSAGES_PROCESSED: IntCounter = IntCounter::new(
        "relay_worker_messages_processed_total",
        "Total requests answered by workers"
    ).expect("metric creation failed");

    /// Requests a worker could not answer, by reason
    pub static ref WORKER_PROCESSING_FAILURES: IntCounterVec = IntCounterVec::new(
        Opts::new("relay_worker_processing_failures_total", "Requests workers failed to answer"),
        &["reason"]  // reason: malformed/reply_failed
    ).expect("metric creation failed");

    /// Deliveries seen for the second time or later
    pub static ref WORKER_REDELIVERIES: IntCounter = IntCounter::new(
        "relay_worker_redeliveries_total",
        "Total redelivered requests consumed by workers"
    ).expect("metric creation failed");

    /// Time from delivery to reply publish
    pub static ref WORKER_PROCESSING_DURATION: Histogram = Histogram::with_opts(
        HistogramOpts::new(
            "relay_worker_processing_duration_seconds",
            "Time spent answering a request"
        ).buckets(exponential_buckets(0.0001, 2.0, 16).expect("valid buckets"))
    ).expect("metric creation failed");

    // =========================================================================
    // GATEWAY METRICS
    // =========================================================================

    /// Requests waiting for a reply across all correlator instances
    pub static ref GATEWAY_PENDING: IntGauge = IntGauge::new(
        "relay_gateway_pending_requests",
        "Requests currently waiting for a reply"
    ).expect("metric creation failed");
}

static REGISTERED: OnceLock<Result<(), String>> = OnceLock::new();

/// Register all metrics with the global registry. Safe to call more than once.
pub fn register_metrics() -> Result<(), TelemetryError> {
    REGISTERED
        .get_or_init(|| {
            let metrics: Vec<Box<dyn prometheus::core::Collector>> = vec![
                Box::new(WORKER_MESSAGES_PROCESSED.clone()),
                Box::new(WORKER_PROCESSING_FAILURES.clone()),
                Box::new(WORKER_REDELIVERIES.clone()),
                Box::new(WORKER_PROCESSING_DURATION.clone()),
                Box::new(GATEWAY_PENDING.clone()),
            ];

            for metric in metrics {
                REGISTRY.register(metric).map_err(|e| e.to_string())?;
            }
            Ok(())
        })
        .clone()
        .map_err(TelemetryError::MetricsInit)
}

/// Encode all metrics as Prometheus text format.
pub fn encode_metrics() -> Result<String, TelemetryError> {
    let encoder = TextEncoder::new();
    let metric_families = REGISTRY.gather();
    let mut buffer = Vec::new();
    encoder
        .encode(&metric_families, &mut buffer)
        .map_err(|e| TelemetryError::MetricsInit(e.to_string()))?;
    String::from_utf8(buffer).map_err(|e| TelemetryError::MetricsInit(e.to_string()))
}

/// Timer guard for automatic histogram observation.
pub struct HistogramTimer {
    histogram: Histogram,
    start: std::time::Instant,
}

impl HistogramTimer {
    /// Start a new timer for the given histogram.
    pub fn new(histogram: &Histogram) -> Self {
        Self {
            histogram: histogram.clone(),
            start: std::time::Instant::now(),
        }
    }
}

impl Drop for HistogramTimer {
    fn drop(&mut self) {
        self.histogram.observe(self.start.elapsed().as_secs_f64());
    }
}
