//! The correlator: turns a queue-mediated exchange into a blocking call.

use crate::domain::config::{BrokerConfig, CorrelationConfig};
use crate::domain::error::{CallError, GatewayError, PendingError};
use crate::domain::pending::{PendingInfo, PendingTable, Waiter};
use crate::ipc::listener::ReplyListener;
use crate::metrics::CorrelatorMetrics;
use crate::wait_for_shutdown;
use bytes::Bytes;
use parking_lot::{Mutex, RwLock};
use shared_bus::MessageBroker;
use shared_types::{CorrelationId, RequestEnvelope};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

/// Fresh ids to try when a generated id is already pending.
const MAX_ID_ATTEMPTS: usize = 3;

/// A successful round trip.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reply {
    pub correlation_id: CorrelationId,
    pub payload: Bytes,
    /// Time from registering the entry to resolving it
    pub latency: Duration,
}

/// Removes the pending entry if the submitting future is dropped early.
struct PendingGuard<'a> {
    table: &'a dyn PendingTable,
    metrics: &'a CorrelatorMetrics,
    id: CorrelationId,
    armed: bool,
}

impl<'a> PendingGuard<'a> {
    fn new(table: &'a dyn PendingTable, metrics: &'a CorrelatorMetrics, id: CorrelationId) -> Self {
        Self {
            table,
            metrics,
            id,
            armed: true,
        }
    }

    fn disarm(mut self) {
        self.armed = false;
    }
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        if self.armed && self.table.remove(&self.id) {
            self.metrics.record_abandoned();
            debug!(correlation_id = %self.id, "Caller went away, pending request removed");
        }
    }
}

/// One correlation engine instance.
///
/// Owns a pending table, an exclusive reply destination and the tasks that
/// drain replies and sweep expired entries.
pub struct Correlator {
    name: String,
    broker: Arc<dyn MessageBroker>,
    table: Arc<dyn PendingTable>,
    request_queue: String,
    /// Replaced if the reply queue has to be redeclared after a disconnect
    reply_to: Arc<RwLock<String>>,
    settings: CorrelationConfig,
    metrics: Arc<CorrelatorMetrics>,
    shutdown_tx: watch::Sender<bool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Correlator {
    /// Declare queues, subscribe to replies and start the background tasks.
    pub async fn start(
        name: impl Into<String>,
        broker: Arc<dyn MessageBroker>,
        table: Arc<dyn PendingTable>,
        settings: CorrelationConfig,
        broker_config: &BrokerConfig,
    ) -> Result<Arc<Self>, GatewayError> {
        let name = name.into();

        broker.declare_queue(&broker_config.request_queue).await?;
        let reply_to = broker.declare_reply_queue().await?;
        let replies = broker.subscribe_replies(&reply_to).await?;

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let metrics = Arc::new(CorrelatorMetrics::new(&name)?);
        let reply_to = Arc::new(RwLock::new(reply_to));

        let listener = ReplyListener::new(
            name.clone(),
            Arc::clone(&broker),
            Arc::clone(&table),
            Arc::clone(&metrics),
            Arc::clone(&reply_to),
            broker_config,
            shutdown_rx.clone(),
        );
        let listener_handle = tokio::spawn(listener.run(replies));
        let sweeper_handle = tokio::spawn(sweep_task(
            Arc::clone(&table),
            settings.sweep_interval,
            shutdown_rx,
        ));

        info!(
            correlator = %name,
            request_queue = %broker_config.request_queue,
            reply_to = %reply_to.read(),
            "Correlator started"
        );

        Ok(Arc::new(Self {
            name,
            broker,
            table,
            request_queue: broker_config.request_queue.clone(),
            reply_to,
            settings,
            metrics,
            shutdown_tx,
            tasks: Mutex::new(vec![listener_handle, sweeper_handle]),
        }))
    }

    /// Publish `input` and wait up to `timeout` for the correlated reply.
    pub async fn submit(
        &self,
        input: impl Into<Bytes>,
        timeout: Duration,
    ) -> Result<Reply, CallError> {
        if *self.shutdown_tx.borrow() {
            return Err(CallError::Cancelled);
        }

        self.metrics.record_submitted();
        let result = self.exchange(input.into(), timeout).await;
        match &result {
            Ok(reply) => self.metrics.record_fulfilled(reply.latency),
            Err(e) => self.metrics.record_failure(e),
        }
        result
    }

    async fn exchange(&self, input: Bytes, timeout: Duration) -> Result<Reply, CallError> {
        let (id, mut waiter) = self.register(timeout)?;
        let guard = PendingGuard::new(&*self.table, &self.metrics, id);
        let submitted_at = Instant::now();
        let deadline = submitted_at + timeout;

        // Shutdown may have run `fail_all` between the check in `submit` and
        // the insert above.
        if *self.shutdown_tx.borrow() {
            guard.disarm();
            self.table.remove(&id);
            return Err(CallError::Cancelled);
        }

        let reply_to = self.reply_to();
        let request = RequestEnvelope::new(id, reply_to.clone(), input);

        if let Err(e) = self.broker.publish_request(&self.request_queue, request).await {
            guard.disarm();
            self.table.remove(&id);
            warn!(
                correlator = %self.name,
                correlation_id = %id,
                error = %e,
                "Request publish failed"
            );
            return Err(CallError::PublishFailed(e.to_string()));
        }

        debug!(
            correlator = %self.name,
            correlation_id = %id,
            queue = %self.request_queue,
            reply_to = %reply_to,
            "Request published"
        );

        if timeout.is_zero() {
            // Give an already-delivered reply one chance to be resolved.
            tokio::task::yield_now().await;
        }

        let outcome = match tokio::time::timeout_at(deadline, &mut waiter).await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(_)) => Err(CallError::Cancelled),
            Err(_) => {
                // Whichever path removes the entry settles the waiter, this
                // one included.
                self.table.try_expire(&id);
                waiter.await.unwrap_or(Err(CallError::Cancelled))
            }
        };
        guard.disarm();

        match outcome {
            Ok(resolved) => {
                debug!(
                    correlator = %self.name,
                    correlation_id = %id,
                    latency_ms = resolved.latency.as_millis() as u64,
                    "Reply received"
                );
                Ok(Reply {
                    correlation_id: id,
                    payload: resolved.payload,
                    latency: resolved.latency,
                })
            }
            Err(e) => {
                warn!(
                    correlator = %self.name,
                    correlation_id = %id,
                    elapsed_ms = submitted_at.elapsed().as_millis() as u64,
                    error = %e,
                    "Request failed"
                );
                Err(e)
            }
        }
    }

    fn register(&self, timeout: Duration) -> Result<(CorrelationId, Waiter), CallError> {
        let mut attempts = 1;
        loop {
            let id = CorrelationId::new();
            match self.table.insert(id, timeout) {
                Ok(waiter) => return Ok((id, waiter)),
                Err(PendingError::Duplicate) if attempts < MAX_ID_ATTEMPTS => {
                    warn!(correlation_id = %id, "Generated correlation id already pending, retrying");
                    attempts += 1;
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    /// Submit with the configured default timeout, clamping caller-supplied
    /// values to `max_timeout`.
    pub async fn call(
        &self,
        input: impl Into<Bytes>,
        timeout: Option<Duration>,
    ) -> Result<Reply, CallError> {
        self.submit(input, self.settings.effective_timeout(timeout))
            .await
    }

    /// Instance name (for logs and metric labels)
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Current reply destination
    pub fn reply_to(&self) -> String {
        self.reply_to.read().clone()
    }

    /// Get pending request count
    pub fn pending_count(&self) -> usize {
        self.table.len()
    }

    /// Diagnostic listing of pending requests
    pub fn pending_entries(&self) -> Vec<PendingInfo> {
        self.table.entries()
    }

    /// The pending table (for diagnostics)
    pub fn table(&self) -> &Arc<dyn PendingTable> {
        &self.table
    }

    pub fn metrics(&self) -> &Arc<CorrelatorMetrics> {
        &self.metrics
    }

    /// Whether the broker connection is up
    pub fn is_connected(&self) -> bool {
        self.broker.is_connected()
    }

    /// Stop the background tasks and cancel every pending request.
    pub async fn shutdown(&self) {
        if self.shutdown_tx.send_replace(true) {
            return;
        }

        let cancelled = self.table.fail_all(CallError::Cancelled);
        let tasks: Vec<JoinHandle<()>> = std::mem::take(&mut *self.tasks.lock());
        for task in tasks {
            let _ = task.await;
        }

        let reply_to = self.reply_to();
        if let Err(e) = self.broker.delete_queue(&reply_to).await {
            warn!(correlator = %self.name, reply_to = %reply_to, error = %e, "Reply queue not deleted");
        }
        info!(correlator = %self.name, cancelled = cancelled, "Correlator stopped");
    }
}

/// Background task that expires overdue entries.
///
/// Complements the per-submit deadline: it catches entries whose caller is
/// not polling and entries the shared store has already dropped.
pub async fn sweep_task(
    table: Arc<dyn PendingTable>,
    interval: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            biased;
            _ = wait_for_shutdown(&mut shutdown) => break,
            _ = ticker.tick() => {}
        }
        let expired = table.expire_overdue();
        if expired > 0 {
            debug!(expired = expired, "Swept expired pending requests");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::pending::{LocalPendingTable, PendingStats};
    use crate::domain::shared_store::{InMemorySharedStore, SharedPendingTable, SharedStore};
    use async_trait::async_trait;
    use futures::StreamExt;
    use shared_bus::{BrokerError, DeliveryStream, InMemoryBroker, ReplyStream};
    use shared_types::{Envelope, ReplyEnvelope};
    use std::sync::{OnceLock, Weak};

    async fn start(broker: &Arc<InMemoryBroker>) -> Arc<Correlator> {
        Correlator::start(
            "test",
            Arc::clone(broker) as Arc<dyn MessageBroker>,
            Arc::new(LocalPendingTable::new()),
            CorrelationConfig::default(),
            &BrokerConfig::default(),
        )
        .await
        .unwrap()
    }

    /// Answer the next request on `rpc_queue` with `reply` after `delay`.
    async fn answer_once(broker: Arc<InMemoryBroker>, delay: Duration, reply: &'static str) {
        let mut requests = broker.consume("rpc_queue", 1).await.unwrap();
        let delivery = requests.next().await.unwrap();
        let request = RequestEnvelope::try_from(delivery.envelope().clone()).unwrap();
        tokio::time::sleep(delay).await;
        broker
            .publish_reply(
                &request.reply_to,
                ReplyEnvelope::new(request.correlation_id, reply),
            )
            .await
            .unwrap();
        delivery.ack();
    }

    /// Broker whose request publish delivers the reply before returning.
    struct EagerBroker {
        inner: InMemoryBroker,
    }

    #[async_trait]
    impl MessageBroker for EagerBroker {
        async fn declare_queue(&self, name: &str) -> Result<(), BrokerError> {
            self.inner.declare_queue(name).await
        }

        async fn declare_reply_queue(&self) -> Result<String, BrokerError> {
            self.inner.declare_reply_queue().await
        }

        async fn delete_queue(&self, name: &str) -> Result<bool, BrokerError> {
            self.inner.delete_queue(name).await
        }

        async fn publish(&self, destination: &str, envelope: Envelope) -> Result<(), BrokerError> {
            self.inner.publish(destination, envelope).await
        }

        async fn subscribe_replies(&self, destination: &str) -> Result<ReplyStream, BrokerError> {
            self.inner.subscribe_replies(destination).await
        }

        async fn consume(&self, queue: &str, prefetch: usize) -> Result<DeliveryStream, BrokerError> {
            self.inner.consume(queue, prefetch).await
        }

        fn is_connected(&self) -> bool {
            self.inner.is_connected()
        }

        async fn publish_request(
            &self,
            destination: &str,
            request: RequestEnvelope,
        ) -> Result<(), BrokerError> {
            let reply_to = request.reply_to.clone();
            let reply = ReplyEnvelope::new(request.correlation_id, "foo bar");
            self.inner.publish_request(destination, request).await?;
            self.inner.publish_reply(&reply_to, reply).await
        }
    }

    /// Local table that lets shutdown start right before each insert lands.
    struct ShutdownOnInsert {
        inner: LocalPendingTable,
        correlator: OnceLock<Weak<Correlator>>,
    }

    impl PendingTable for ShutdownOnInsert {
        fn insert(&self, id: CorrelationId, timeout: Duration) -> Result<Waiter, PendingError> {
            if let Some(correlator) = self.correlator.get().and_then(Weak::upgrade) {
                correlator.shutdown_tx.send_replace(true);
                self.inner.fail_all(CallError::Cancelled);
            }
            self.inner.insert(id, timeout)
        }

        fn try_resolve(&self, id: &CorrelationId, payload: Bytes) -> bool {
            self.inner.try_resolve(id, payload)
        }

        fn try_expire(&self, id: &CorrelationId) -> bool {
            self.inner.try_expire(id)
        }

        fn try_fail(&self, id: &CorrelationId, error: CallError) -> bool {
            self.inner.try_fail(id, error)
        }

        fn remove(&self, id: &CorrelationId) -> bool {
            self.inner.remove(id)
        }

        fn fail_all(&self, error: CallError) -> usize {
            self.inner.fail_all(error)
        }

        fn expire_overdue(&self) -> usize {
            self.inner.expire_overdue()
        }

        fn len(&self) -> usize {
            self.inner.len()
        }

        fn contains(&self, id: &CorrelationId) -> bool {
            self.inner.contains(id)
        }

        fn entries(&self) -> Vec<PendingInfo> {
            self.inner.entries()
        }

        fn stats(&self) -> &PendingStats {
            self.inner.stats()
        }
    }

    #[tokio::test]
    async fn test_start_declares_queues() {
        let broker = Arc::new(InMemoryBroker::new());
        let correlator = start(&broker).await;

        assert_eq!(broker.queue_depth("rpc_queue"), Some(0));
        assert!(correlator.reply_to().starts_with(shared_bus::REPLY_QUEUE_PREFIX));
        assert!(correlator.is_connected());
    }

    #[tokio::test]
    async fn test_submit_returns_reply_and_latency() {
        let broker = Arc::new(InMemoryBroker::new());
        let correlator = start(&broker).await;
        tokio::spawn(answer_once(
            Arc::clone(&broker),
            Duration::from_millis(20),
            "foo bar",
        ));

        let reply = correlator
            .submit("foo", Duration::from_secs(5))
            .await
            .unwrap();

        assert_eq!(reply.payload, "foo bar");
        assert!(reply.latency >= Duration::from_millis(20));
        assert_eq!(correlator.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_timeout_clears_entry() {
        let broker = Arc::new(InMemoryBroker::new());
        let correlator = start(&broker).await;

        let err = correlator
            .submit("foo", Duration::from_millis(30))
            .await
            .unwrap_err();

        assert_eq!(
            err,
            CallError::Timeout {
                after: Duration::from_millis(30)
            }
        );
        assert_eq!(correlator.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_publish_failure_leaves_nothing_pending() {
        let broker = Arc::new(InMemoryBroker::new());
        let correlator = start(&broker).await;
        broker.set_publish_fault(Some("channel closed".into()));

        let err = correlator
            .submit("foo", Duration::from_secs(5))
            .await
            .unwrap_err();

        assert!(matches!(err, CallError::PublishFailed(ref m) if m.contains("channel closed")));
        assert_eq!(correlator.pending_count(), 0);
        assert_eq!(correlator.metrics().publish_failures.get(), 1);
    }

    #[tokio::test]
    async fn test_dropped_caller_removes_entry() {
        let broker = Arc::new(InMemoryBroker::new());
        let correlator = start(&broker).await;

        let pending = {
            let correlator = Arc::clone(&correlator);
            tokio::spawn(async move { correlator.submit("foo", Duration::from_secs(30)).await })
        };

        // Wait until the request is on the queue, then abandon it.
        while broker.queue_depth("rpc_queue") != Some(1) {
            tokio::task::yield_now().await;
        }
        pending.abort();
        let _ = pending.await;

        assert_eq!(correlator.pending_count(), 0);
        assert_eq!(correlator.metrics().cancelled.get(), 1);
    }

    #[tokio::test]
    async fn test_call_applies_default_timeout() {
        let broker = Arc::new(InMemoryBroker::new());
        let correlator = start(&broker).await;
        tokio::spawn(answer_once(Arc::clone(&broker), Duration::ZERO, "ok"));

        let reply = correlator.call("x", None).await.unwrap();
        assert_eq!(reply.payload, "ok");
    }

    #[tokio::test]
    async fn test_shutdown_rejects_new_submits() {
        let broker = Arc::new(InMemoryBroker::new());
        let correlator = start(&broker).await;

        correlator.shutdown().await;

        assert_eq!(
            correlator.submit("foo", Duration::from_secs(1)).await,
            Err(CallError::Cancelled)
        );
    }

    #[tokio::test]
    async fn test_shutdown_racing_submit_cancels_it() {
        let broker = Arc::new(InMemoryBroker::new());
        let table = Arc::new(ShutdownOnInsert {
            inner: LocalPendingTable::new(),
            correlator: OnceLock::new(),
        });
        let correlator = Correlator::start(
            "test",
            Arc::clone(&broker) as Arc<dyn MessageBroker>,
            Arc::clone(&table) as Arc<dyn PendingTable>,
            CorrelationConfig::default(),
            &BrokerConfig::default(),
        )
        .await
        .unwrap();
        table.correlator.set(Arc::downgrade(&correlator)).unwrap();

        let result = tokio::time::timeout(
            Duration::from_secs(1),
            correlator.submit("foo", Duration::from_secs(30)),
        )
        .await
        .expect("submit should not wait out its timeout");

        assert_eq!(result, Err(CallError::Cancelled));
        assert_eq!(correlator.pending_count(), 0);
        assert_eq!(broker.queue_depth("rpc_queue"), Some(0));
    }

    #[tokio::test]
    async fn test_shutdown_deletes_reply_queue() {
        let broker = Arc::new(InMemoryBroker::new());
        let correlator = start(&broker).await;
        let reply_to = correlator.reply_to();
        assert_eq!(broker.queue_depth(&reply_to), Some(0));

        correlator.shutdown().await;

        assert_eq!(broker.queue_depth(&reply_to), None);
        assert_eq!(broker.queue_depth("rpc_queue"), Some(0));
    }

    #[tokio::test]
    async fn test_zero_timeout_takes_reply_already_delivered() {
        let broker = Arc::new(EagerBroker {
            inner: InMemoryBroker::new(),
        });
        let correlator = Correlator::start(
            "test",
            broker as Arc<dyn MessageBroker>,
            Arc::new(LocalPendingTable::new()),
            CorrelationConfig::default(),
            &BrokerConfig::default(),
        )
        .await
        .unwrap();

        let reply = correlator.submit("foo", Duration::ZERO).await.unwrap();

        assert_eq!(reply.payload, "foo bar");
        assert_eq!(correlator.pending_count(), 0);
        assert_eq!(correlator.metrics().fulfilled.get(), 1);
    }

    #[tokio::test]
    async fn test_shared_backend_times_out_when_store_entry_lapses() {
        let broker = Arc::new(InMemoryBroker::new());
        let store: Arc<dyn SharedStore> = Arc::new(InMemorySharedStore::new());
        let correlator = Correlator::start(
            "test",
            Arc::clone(&broker) as Arc<dyn MessageBroker>,
            Arc::new(SharedPendingTable::new(store, "gw", Duration::ZERO)),
            CorrelationConfig::default(),
            &BrokerConfig::default(),
        )
        .await
        .unwrap();

        let result = tokio::time::timeout(
            Duration::from_secs(3),
            correlator.submit("foo", Duration::from_millis(100)),
        )
        .await
        .expect("a lapsed store entry must still settle the caller");

        assert_eq!(
            result,
            Err(CallError::Timeout {
                after: Duration::from_millis(100)
            })
        );
        assert_eq!(correlator.pending_count(), 0);
        assert_eq!(correlator.metrics().timeouts.get(), 1);
    }

    #[tokio::test]
    async fn test_shutdown_cancels_pending() {
        let broker = Arc::new(InMemoryBroker::new());
        let correlator = start(&broker).await;

        let pending = {
            let correlator = Arc::clone(&correlator);
            tokio::spawn(async move { correlator.submit("foo", Duration::from_secs(30)).await })
        };
        while correlator.pending_count() != 1 {
            tokio::task::yield_now().await;
        }

        correlator.shutdown().await;

        assert_eq!(pending.await.unwrap(), Err(CallError::Cancelled));
    }

    #[tokio::test(start_paused = true)]
    async fn test_sweeper_expires_unpolled_entries() {
        let table: Arc<dyn PendingTable> = Arc::new(LocalPendingTable::new());
        let (tx, rx) = watch::channel(false);
        let id = CorrelationId::new();
        let waiter = table.insert(id, Duration::from_millis(100)).unwrap();

        let sweeper = tokio::spawn(sweep_task(
            Arc::clone(&table),
            Duration::from_millis(50),
            rx,
        ));

        assert!(matches!(
            waiter.await.unwrap(),
            Err(CallError::Timeout { .. })
        ));
        assert!(table.is_empty());

        tx.send_replace(true);
        sweeper.await.unwrap();
    }
}
