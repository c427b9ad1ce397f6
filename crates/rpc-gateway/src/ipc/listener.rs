//! Reply listener: the single consumption loop per correlator.

use crate::domain::config::BrokerConfig;
use crate::domain::error::CallError;
use crate::domain::pending::PendingTable;
use crate::metrics::CorrelatorMetrics;
use crate::wait_for_shutdown;
use futures::StreamExt;
use parking_lot::RwLock;
use shared_bus::{BrokerError, MessageBroker, ReplyStream};
use shared_types::ReplyEnvelope;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, error, info, instrument, warn};

/// Drains a reply stream and resolves pending entries by correlation id.
///
/// Unknown ids are expected (late replies after a timeout, replies from
/// before a restart) and are discarded. When the stream ends the broker is
/// considered disconnected: every pending entry fails with
/// `BrokerDisconnected` and the listener re-subscribes.
pub struct ReplyListener {
    correlator: String,
    broker: Arc<dyn MessageBroker>,
    table: Arc<dyn PendingTable>,
    metrics: Arc<CorrelatorMetrics>,
    reply_to: Arc<RwLock<String>>,
    reconnect_delay: Duration,
    max_reconnect_attempts: u32,
    shutdown: watch::Receiver<bool>,
}

impl ReplyListener {
    pub fn new(
        correlator: String,
        broker: Arc<dyn MessageBroker>,
        table: Arc<dyn PendingTable>,
        metrics: Arc<CorrelatorMetrics>,
        reply_to: Arc<RwLock<String>>,
        broker_config: &BrokerConfig,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        Self {
            correlator,
            broker,
            table,
            metrics,
            reply_to,
            reconnect_delay: broker_config.reconnect_delay,
            max_reconnect_attempts: broker_config.max_reconnect_attempts,
            shutdown,
        }
    }

    /// Run the listener loop until shutdown or reconnection gives up.
    #[instrument(name = "reply_listener", skip_all, fields(correlator = %self.correlator))]
    pub async fn run(mut self, mut replies: ReplyStream) {
        info!(reply_to = %self.reply_to.read(), "Reply listener started");

        loop {
            let next = tokio::select! {
                biased;
                _ = wait_for_shutdown(&mut self.shutdown) => break,
                next = replies.next() => next,
            };

            match next {
                Some(Ok(reply)) => self.handle_reply(reply),
                Some(Err(e)) => {
                    self.metrics.record_malformed_reply();
                    warn!(error = %e, "Discarding malformed reply");
                }
                None => {
                    self.metrics.record_disconnect();
                    let failed = self.table.fail_all(CallError::BrokerDisconnected);
                    warn!(failed = failed, "Reply stream ended, broker disconnected");

                    match self.resubscribe().await {
                        Some(stream) => replies = stream,
                        None => break,
                    }
                }
            }
        }

        info!("Reply listener stopped");
    }

    fn handle_reply(&self, reply: ReplyEnvelope) {
        let id = reply.correlation_id;
        if self.table.try_resolve(&id, reply.payload) {
            debug!(correlation_id = %id, "Reply routed to pending request");
        } else {
            self.metrics.record_stale_reply();
            debug!(correlation_id = %id, "Reply for unknown or expired correlation id");
        }
    }

    /// Re-subscribe to the reply destination, redeclaring it if the broker
    /// dropped it. Returns `None` on shutdown or when attempts run out.
    async fn resubscribe(&mut self) -> Option<ReplyStream> {
        let mut attempt: u32 = 0;

        loop {
            attempt += 1;
            if self.max_reconnect_attempts > 0 && attempt > self.max_reconnect_attempts {
                error!(
                    attempts = self.max_reconnect_attempts,
                    "Giving up on reply subscription"
                );
                return None;
            }

            tokio::select! {
                biased;
                _ = wait_for_shutdown(&mut self.shutdown) => return None,
                _ = tokio::time::sleep(self.reconnect_delay) => {}
            }

            let destination = self.reply_to.read().clone();
            match self.broker.subscribe_replies(&destination).await {
                Ok(stream) => {
                    info!(attempt = attempt, reply_to = %destination, "Reply listener resubscribed");
                    return Some(stream);
                }
                Err(BrokerError::QueueNotFound(_)) => match self.broker.declare_reply_queue().await {
                    Ok(fresh) => {
                        warn!(old = %destination, new = %fresh, "Reply queue redeclared");
                        *self.reply_to.write() = fresh;
                        if let Err(e) = self.broker.delete_queue(&destination).await {
                            debug!(queue = %destination, error = %e, "Old reply queue not deleted");
                        }
                    }
                    Err(e) => debug!(attempt = attempt, error = %e, "Reply queue redeclare failed"),
                },
                Err(e) => debug!(attempt = attempt, error = %e, "Resubscribe failed"),
            }
        }
    }
}
