//! # RPC Worker
//!
//! Competing consumer on the request queue. For every delivery it computes
//! the reply, publishes it to the request's reply destination tagged with
//! the request's correlation id, and only then acknowledges the delivery.
//!
//! ```text
//! rpc_queue ──deliver(prefetch=1)──▶ RpcWorker ──publish(reply_to)──▶ amq.gen-*
//!     ▲                                  │
//!     └──────────── ack / requeue ───────┘
//! ```
//!
//! Requests without a correlation id or reply destination cannot be
//! answered; they are acknowledged and dropped so they are not redelivered
//! forever. A failed reply publish leaves the request unacknowledged so
//! another worker gets it.

use futures::StreamExt;
use relay_telemetry::{
    HistogramTimer, WORKER_MESSAGES_PROCESSED, WORKER_PROCESSING_DURATION,
    WORKER_PROCESSING_FAILURES, WORKER_REDELIVERIES,
};
use shared_bus::{BrokerError, Delivery, DeliveryStream, MessageBroker};
use shared_types::{EnvelopeError, ReplyEnvelope, RequestEnvelope};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, info, instrument, warn};

/// Why a delivery could not be answered.
#[derive(Debug, thiserror::Error)]
pub enum ProcessError {
    #[error("malformed request: {0}")]
    Malformed(#[from] EnvelopeError),

    #[error("reply publish failed: {0}")]
    ReplyFailed(#[from] BrokerError),
}

impl ProcessError {
    /// Metric label
    pub fn reason(&self) -> &'static str {
        match self {
            ProcessError::Malformed(_) => "malformed",
            ProcessError::ReplyFailed(_) => "reply_failed",
        }
    }
}

/// The reply for `input`: the input followed by `suffix`.
pub fn compute_reply(input: &[u8], suffix: &str) -> Vec<u8> {
    let mut output = Vec::with_capacity(input.len() + suffix.len());
    output.extend_from_slice(input);
    output.extend_from_slice(suffix.as_bytes());
    output
}

/// One worker consuming the request queue.
pub struct RpcWorker {
    id: usize,
    broker: Arc<dyn MessageBroker>,
    queue: String,
    prefetch: usize,
    reply_suffix: String,
    /// Pause before consuming again after a disconnect or failed reply
    retry_delay: Duration,
    shutdown: watch::Receiver<bool>,
}

impl RpcWorker {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        id: usize,
        broker: Arc<dyn MessageBroker>,
        queue: impl Into<String>,
        prefetch: usize,
        reply_suffix: impl Into<String>,
        retry_delay: Duration,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        Self {
            id,
            broker,
            queue: queue.into(),
            prefetch,
            reply_suffix: reply_suffix.into(),
            retry_delay,
            shutdown,
        }
    }

    /// Consume until shutdown, re-consuming after broker disconnects.
    #[instrument(name = "rpc_worker", skip_all, fields(worker = self.id))]
    pub async fn run(mut self) {
        info!(queue = %self.queue, prefetch = self.prefetch, "Worker started");

        while let Some(mut deliveries) = self.connect().await {
            if !self.drain(&mut deliveries).await {
                break;
            }
            warn!("Request stream ended, reconnecting");
        }

        info!("Worker stopped");
    }

    /// Open a consumer, retrying until it succeeds. `None` on shutdown.
    async fn connect(&mut self) -> Option<DeliveryStream> {
        loop {
            if *self.shutdown.borrow() {
                return None;
            }
            match self.broker.consume(&self.queue, self.prefetch).await {
                Ok(stream) => return Some(stream),
                Err(e) => debug!(error = %e, "Consume failed, retrying"),
            }
            if !self.pause().await {
                return None;
            }
        }
    }

    /// Process deliveries until the stream ends. Returns `false` on shutdown.
    async fn drain(&mut self, deliveries: &mut DeliveryStream) -> bool {
        loop {
            let delivery = tokio::select! {
                biased;
                _ = self.shutdown.changed() => return false,
                delivery = deliveries.next() => delivery,
            };

            let Some(delivery) = delivery else {
                return self.pause().await;
            };

            match self.process(delivery).await {
                Ok(()) => WORKER_MESSAGES_PROCESSED.inc(),
                Err(e) => {
                    WORKER_PROCESSING_FAILURES
                        .with_label_values(&[e.reason()])
                        .inc();
                    warn!(error = %e, "Request not answered");
                    if matches!(e, ProcessError::ReplyFailed(_)) && !self.pause().await {
                        return false;
                    }
                }
            }
        }
    }

    /// Answer one delivery.
    pub async fn process(&self, delivery: Delivery) -> Result<(), ProcessError> {
        if delivery.redelivered() {
            WORKER_REDELIVERIES.inc();
        }

        let request = match RequestEnvelope::try_from(delivery.envelope().clone()) {
            Ok(request) => request,
            Err(e) => {
                delivery.ack();
                return Err(e.into());
            }
        };

        let _timer = HistogramTimer::new(&WORKER_PROCESSING_DURATION);
        debug!(
            correlation_id = %request.correlation_id,
            reply_to = %request.reply_to,
            input_len = request.payload.len(),
            "Request received"
        );

        let output = compute_reply(&request.payload, &self.reply_suffix);
        let reply = ReplyEnvelope::new(request.correlation_id, output);

        if let Err(e) = self.broker.publish_reply(&request.reply_to, reply).await {
            delivery.nack(true);
            return Err(e.into());
        }

        delivery.ack();
        debug!(correlation_id = %request.correlation_id, "Reply published");
        Ok(())
    }

    /// Sleep for the retry delay. Returns `false` if shutdown arrived first.
    async fn pause(&mut self) -> bool {
        tokio::select! {
            biased;
            _ = self.shutdown.changed() => false,
            _ = tokio::time::sleep(self.retry_delay) => true,
        }
    }
}
