//! # Consumer Side
//!
//! Deliveries, acknowledgement handles and the reply stream.

use crate::publisher::BrokerStats;
use futures::stream::{self, BoxStream, StreamExt};
use shared_types::{Envelope, EnvelopeError, ReplyEnvelope};
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, watch, Mutex, OwnedSemaphorePermit, Semaphore};
use tracing::debug;

/// Stream of worker-side deliveries. Ends when the broker connection drops.
pub type DeliveryStream = BoxStream<'static, Delivery>;

/// Stream of replies for a reply destination. Ends when the broker
/// connection drops. Envelopes without a usable correlation header are
/// surfaced as errors so the consumer can log and skip them.
pub type ReplyStream = BoxStream<'static, Result<ReplyEnvelope, EnvelopeError>>;

/// Broker-specific settlement of a single delivery.
///
/// Dropping a handle without settling it must make the message eligible for
/// redelivery (at-least-once).
pub trait DeliveryHandle: Send {
    /// Acknowledge: the broker may forget the message.
    fn ack(self: Box<Self>);

    /// Reject, optionally putting the message back on its queue.
    fn nack(self: Box<Self>, requeue: bool);
}

/// A message handed to a consumer, pending acknowledgement.
pub struct Delivery {
    envelope: Envelope,
    redelivered: bool,
    handle: Box<dyn DeliveryHandle>,
}

impl Delivery {
    /// Wrap an envelope with the handle that settles it.
    pub fn new(envelope: Envelope, redelivered: bool, handle: Box<dyn DeliveryHandle>) -> Self {
        Self {
            envelope,
            redelivered,
            handle,
        }
    }

    /// The delivered message.
    #[must_use]
    pub fn envelope(&self) -> &Envelope {
        &self.envelope
    }

    /// Whether this message was delivered before and not acknowledged.
    #[must_use]
    pub fn redelivered(&self) -> bool {
        self.redelivered
    }

    /// Acknowledge the delivery.
    pub fn ack(self) {
        self.handle.ack();
    }

    /// Reject the delivery.
    pub fn nack(self, requeue: bool) {
        self.handle.nack(requeue);
    }
}

impl fmt::Debug for Delivery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Delivery")
            .field("envelope", &self.envelope)
            .field("redelivered", &self.redelivered)
            .finish_non_exhaustive()
    }
}

/// Connection state shared between the broker and its consumers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct ConnectionState {
    pub connected: bool,
    pub generation: u64,
}

pub(crate) struct QueuedMessage {
    envelope: Envelope,
    redelivered: bool,
}

/// A named FIFO queue shared by competing consumers.
pub(crate) struct Queue {
    pub(crate) name: String,
    tx: mpsc::UnboundedSender<QueuedMessage>,
    rx: Mutex<mpsc::UnboundedReceiver<QueuedMessage>>,
    depth: AtomicUsize,
    deleted: watch::Sender<bool>,
}

impl Queue {
    pub(crate) fn new(name: impl Into<String>) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let (deleted, _) = watch::channel(false);
        Self {
            name: name.into(),
            tx,
            rx: Mutex::new(rx),
            depth: AtomicUsize::new(0),
            deleted,
        }
    }

    /// Mark the queue deleted. Its consumers' streams end.
    pub(crate) fn delete(&self) {
        self.deleted.send_replace(true);
    }

    async fn wait_deleted(&self) {
        let mut deleted = self.deleted.subscribe();
        // The sender lives in `self`, so this only returns once deleted.
        let _ = deleted.wait_for(|d| *d).await;
    }

    pub(crate) fn push(&self, envelope: Envelope, redelivered: bool) {
        self.depth.fetch_add(1, Ordering::Relaxed);
        // The receiver lives in `self`, so the channel cannot be closed here.
        let _ = self.tx.send(QueuedMessage {
            envelope,
            redelivered,
        });
    }

    pub(crate) fn depth(&self) -> usize {
        self.depth.load(Ordering::Relaxed)
    }

    async fn recv(&self) -> Option<QueuedMessage> {
        let mut rx = self.rx.lock().await;
        let message = rx.recv().await;
        if message.is_some() {
            self.depth.fetch_sub(1, Ordering::Relaxed);
        }
        message
    }
}

/// Resolves once the consumer's connection generation is no longer live.
async fn closed(connection: &mut watch::Receiver<ConnectionState>, generation: u64) {
    loop {
        {
            let state = connection.borrow_and_update();
            if !state.connected || state.generation != generation {
                return;
            }
        }
        if connection.changed().await.is_err() {
            // Broker dropped
            return;
        }
    }
}

/// In-memory consumer bound to one queue and one connection generation.
pub(crate) struct MemoryConsumer {
    queue: Arc<Queue>,
    /// `None` means auto-ack mode with no prefetch limit.
    prefetch: Option<Arc<Semaphore>>,
    connection: watch::Receiver<ConnectionState>,
    generation: u64,
    stats: Arc<BrokerStats>,
}

impl MemoryConsumer {
    pub(crate) fn new(
        queue: Arc<Queue>,
        prefetch: Option<usize>,
        connection: watch::Receiver<ConnectionState>,
        stats: Arc<BrokerStats>,
    ) -> Self {
        let generation = connection.borrow().generation;
        Self {
            queue,
            prefetch: prefetch.map(|n| Arc::new(Semaphore::new(n.max(1)))),
            connection,
            generation,
            stats,
        }
    }

    async fn next(&mut self) -> Option<Delivery> {
        let Self {
            queue,
            prefetch,
            connection,
            generation,
            stats,
        } = self;

        let permit = match prefetch {
            Some(semaphore) => tokio::select! {
                permit = Arc::clone(semaphore).acquire_owned() => Some(permit.ok()?),
                _ = closed(connection, *generation) => return None,
                _ = queue.wait_deleted() => return None,
            },
            None => None,
        };

        let message = tokio::select! {
            message = queue.recv() => message?,
            _ = closed(connection, *generation) => return None,
            _ = queue.wait_deleted() => return None,
        };

        stats.record_delivered();

        let handle = MemoryDeliveryHandle {
            envelope: Some(message.envelope.clone()),
            queue: Arc::clone(queue),
            stats: Arc::clone(stats),
            _permit: permit,
        };

        Some(Delivery::new(
            message.envelope,
            message.redelivered,
            Box::new(handle),
        ))
    }

    pub(crate) fn into_delivery_stream(self) -> DeliveryStream {
        stream::unfold(self, |mut consumer| async move {
            let delivery = consumer.next().await;
            if delivery.is_none() {
                debug!(queue = %consumer.queue.name, "Consumer stream ended");
            }
            delivery.map(|d| (d, consumer))
        })
        .boxed()
    }

    pub(crate) fn into_reply_stream(self) -> ReplyStream {
        self.into_delivery_stream()
            .map(|delivery| {
                let reply = ReplyEnvelope::try_from(delivery.envelope().clone());
                delivery.ack();
                reply
            })
            .boxed()
    }
}

struct MemoryDeliveryHandle {
    /// `Some` until the delivery is settled.
    envelope: Option<Envelope>,
    queue: Arc<Queue>,
    stats: Arc<BrokerStats>,
    _permit: Option<OwnedSemaphorePermit>,
}

impl MemoryDeliveryHandle {
    fn requeue(&mut self) {
        if let Some(envelope) = self.envelope.take() {
            self.stats.record_redelivered();
            self.queue.push(envelope, true);
        }
    }
}

impl DeliveryHandle for MemoryDeliveryHandle {
    fn ack(mut self: Box<Self>) {
        if self.envelope.take().is_some() {
            self.stats.record_acknowledged();
        }
    }

    fn nack(mut self: Box<Self>, requeue: bool) {
        if requeue {
            self.requeue();
        } else {
            self.envelope = None;
        }
    }
}

impl Drop for MemoryDeliveryHandle {
    fn drop(&mut self) {
        if self.envelope.is_some() {
            debug!(queue = %self.queue.name, "Unacknowledged delivery returned to queue");
            self.requeue();
        }
    }
}
