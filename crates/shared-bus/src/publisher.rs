//! # Broker Contract and In-Memory Broker
//!
//! Defines the publishing side of the broker adapter and the in-process
//! implementation used by single-node deployments and tests.

use crate::subscriber::{ConnectionState, DeliveryStream, MemoryConsumer, Queue, ReplyStream};
use crate::REPLY_QUEUE_PREFIX;
use async_trait::async_trait;
use shared_types::{Envelope, ReplyEnvelope, RequestEnvelope};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use thiserror::Error;
use tokio::sync::watch;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Errors from broker operations.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum BrokerError {
    /// The connection to the broker is down.
    #[error("broker disconnected")]
    Disconnected,

    /// The broker refused the message.
    #[error("publish rejected: {0}")]
    PublishRejected(String),

    /// The queue has not been declared.
    #[error("queue not found: {0}")]
    QueueNotFound(String),
}

/// Minimal broker capability contract used by the gateway and the workers.
///
/// Implementations must deliver each queue's messages in FIFO order to its
/// consumers and redeliver any delivery that is dropped unacknowledged.
#[async_trait]
pub trait MessageBroker: Send + Sync {
    /// Declare a named queue. Idempotent.
    async fn declare_queue(&self, name: &str) -> Result<(), BrokerError>;

    /// Declare an exclusive queue with a broker-generated name and return
    /// that name. Used as a per-instance reply destination.
    async fn declare_reply_queue(&self) -> Result<String, BrokerError>;

    /// Delete a queue, ending its consumers' streams. Returns whether the
    /// queue existed.
    async fn delete_queue(&self, name: &str) -> Result<bool, BrokerError>;

    /// Publish an envelope to a destination queue.
    ///
    /// Publishing to an undeclared destination succeeds and the message is
    /// dropped, matching AMQP default-exchange routing.
    async fn publish(&self, destination: &str, envelope: Envelope) -> Result<(), BrokerError>;

    /// Subscribe to the replies arriving on `destination`.
    ///
    /// Replies are auto-acknowledged. The stream ends when the connection drops.
    async fn subscribe_replies(&self, destination: &str) -> Result<ReplyStream, BrokerError>;

    /// Consume from a work queue with at most `prefetch` unacknowledged
    /// deliveries outstanding.
    async fn consume(&self, queue: &str, prefetch: usize) -> Result<DeliveryStream, BrokerError>;

    /// Whether the broker connection is currently up.
    fn is_connected(&self) -> bool;

    /// Publish a request tagged with its correlation id and reply destination.
    async fn publish_request(
        &self,
        destination: &str,
        request: RequestEnvelope,
    ) -> Result<(), BrokerError> {
        self.publish(destination, request.into()).await
    }

    /// Publish a reply to the requester's reply destination.
    async fn publish_reply(&self, reply_to: &str, reply: ReplyEnvelope) -> Result<(), BrokerError> {
        self.publish(reply_to, reply.into()).await
    }
}

/// Counters describing broker traffic.
#[derive(Debug, Default)]
pub struct BrokerStats {
    published: AtomicU64,
    dropped: AtomicU64,
    delivered: AtomicU64,
    acknowledged: AtomicU64,
    redelivered: AtomicU64,
}

/// Point-in-time copy of [`BrokerStats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BrokerStatsSnapshot {
    pub published: u64,
    pub dropped: u64,
    pub delivered: u64,
    pub acknowledged: u64,
    pub redelivered: u64,
}

impl BrokerStats {
    pub(crate) fn record_delivered(&self) {
        self.delivered.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_acknowledged(&self) {
        self.acknowledged.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_redelivered(&self) {
        self.redelivered.fetch_add(1, Ordering::Relaxed);
    }

    /// Copy the current counter values.
    #[must_use]
    pub fn snapshot(&self) -> BrokerStatsSnapshot {
        BrokerStatsSnapshot {
            published: self.published.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
            delivered: self.delivered.load(Ordering::Relaxed),
            acknowledged: self.acknowledged.load(Ordering::Relaxed),
            redelivered: self.redelivered.load(Ordering::Relaxed),
        }
    }
}

/// In-memory broker with AMQP-like queue semantics.
///
/// - Competing consumers on a queue share its messages (each message goes to
///   exactly one consumer at a time).
/// - Unacknowledged deliveries return to the queue when dropped.
/// - `disconnect()` ends every live stream and fails publishes until
///   `reconnect()`; queue contents survive the outage.
///
/// Suitable for single-node operation; distributed deployments would put a
/// real broker (RabbitMQ, Redpanda) behind the same trait.
pub struct InMemoryBroker {
    /// Declared queues by name.
    queues: RwLock<HashMap<String, Arc<Queue>>>,

    /// Connection state observed by consumers.
    connection: watch::Sender<ConnectionState>,

    /// When set, every publish fails with this reason.
    publish_fault: Mutex<Option<String>>,

    /// Traffic counters.
    stats: Arc<BrokerStats>,
}

impl InMemoryBroker {
    /// Create a connected broker with no queues.
    #[must_use]
    pub fn new() -> Self {
        let (connection, _) = watch::channel(ConnectionState {
            connected: true,
            generation: 0,
        });
        Self {
            queues: RwLock::new(HashMap::new()),
            connection,
            publish_fault: Mutex::new(None),
            stats: Arc::new(BrokerStats::default()),
        }
    }

    /// Drop the connection: live consumer and reply streams end, publishes
    /// fail with [`BrokerError::Disconnected`].
    pub fn disconnect(&self) {
        self.connection.send_modify(|state| state.connected = false);
        warn!("Broker connection dropped");
    }

    /// Restore the connection. Streams opened before the outage stay closed;
    /// consumers must subscribe again.
    pub fn reconnect(&self) {
        self.connection.send_modify(|state| {
            state.connected = true;
            state.generation += 1;
        });
        info!("Broker connection restored");
    }

    /// Make every subsequent publish fail with `reason` (`None` clears).
    pub fn set_publish_fault(&self, reason: Option<String>) {
        *self
            .publish_fault
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = reason;
    }

    /// Number of messages waiting in a queue (not counting unacked deliveries).
    #[must_use]
    pub fn queue_depth(&self, name: &str) -> Option<usize> {
        self.queue(name).map(|q| q.depth())
    }

    /// Traffic counters.
    #[must_use]
    pub fn stats(&self) -> &BrokerStats {
        &self.stats
    }

    fn queue(&self, name: &str) -> Option<Arc<Queue>> {
        self.queues
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(name)
            .cloned()
    }

    fn ensure_connected(&self) -> Result<(), BrokerError> {
        if self.is_connected() {
            Ok(())
        } else {
            Err(BrokerError::Disconnected)
        }
    }

    fn insert_queue(&self, name: &str) {
        self.queues
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(Queue::new(name)));
    }

    fn consumer(&self, name: &str, prefetch: Option<usize>) -> Result<MemoryConsumer, BrokerError> {
        self.ensure_connected()?;
        let queue = self
            .queue(name)
            .ok_or_else(|| BrokerError::QueueNotFound(name.to_string()))?;
        Ok(MemoryConsumer::new(
            queue,
            prefetch,
            self.connection.subscribe(),
            Arc::clone(&self.stats),
        ))
    }
}

impl Default for InMemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl MessageBroker for InMemoryBroker {
    async fn declare_queue(&self, name: &str) -> Result<(), BrokerError> {
        self.ensure_connected()?;
        self.insert_queue(name);
        debug!(queue = name, "Queue declared");
        Ok(())
    }

    async fn declare_reply_queue(&self) -> Result<String, BrokerError> {
        self.ensure_connected()?;
        let name = format!("{}{}", REPLY_QUEUE_PREFIX, Uuid::new_v4().simple());
        self.insert_queue(&name);
        debug!(queue = %name, "Reply queue declared");
        Ok(name)
    }

    async fn delete_queue(&self, name: &str) -> Result<bool, BrokerError> {
        self.ensure_connected()?;
        let removed = self
            .queues
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(name);
        match removed {
            Some(queue) => {
                queue.delete();
                debug!(queue = name, depth = queue.depth(), "Queue deleted");
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn publish(&self, destination: &str, envelope: Envelope) -> Result<(), BrokerError> {
        self.ensure_connected()?;

        if let Some(reason) = self
            .publish_fault
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
        {
            return Err(BrokerError::PublishRejected(reason));
        }

        self.stats.published.fetch_add(1, Ordering::Relaxed);

        match self.queue(destination) {
            Some(queue) => {
                debug!(
                    queue = destination,
                    correlation_id = ?envelope.correlation_id,
                    "Message published"
                );
                queue.push(envelope, false);
            }
            None => {
                self.stats.dropped.fetch_add(1, Ordering::Relaxed);
                warn!(
                    queue = destination,
                    correlation_id = ?envelope.correlation_id,
                    "Message dropped (no such queue)"
                );
            }
        }
        Ok(())
    }

    async fn subscribe_replies(&self, destination: &str) -> Result<ReplyStream, BrokerError> {
        let consumer = self.consumer(destination, None)?;
        debug!(queue = destination, "Reply subscription created");
        Ok(consumer.into_reply_stream())
    }

    async fn consume(&self, queue: &str, prefetch: usize) -> Result<DeliveryStream, BrokerError> {
        let consumer = self.consumer(queue, Some(prefetch))?;
        debug!(queue = queue, prefetch = prefetch, "Consumer created");
        Ok(consumer.into_delivery_stream())
    }

    fn is_connected(&self) -> bool {
        self.connection.borrow().connected
    }
}
