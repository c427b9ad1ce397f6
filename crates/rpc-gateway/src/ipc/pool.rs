//! Horizontal scaling: N independent correlators behind one call surface.

use crate::domain::config::{GatewayConfig, PendingBackend};
use crate::domain::error::{CallError, GatewayError};
use crate::domain::pending::{LocalPendingTable, PendingInfo, PendingTable};
use crate::domain::shared_store::{InMemorySharedStore, SharedPendingTable, SharedStore};
use crate::ipc::correlator::{Correlator, Reply};
use bytes::Bytes;
use shared_bus::MessageBroker;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

/// Round-robin pool of correlator instances.
///
/// Each instance has its own reply destination and reply listener, so a
/// reply always returns to the instance that holds its waiter. With the
/// shared backend all instances register their entries in one store.
pub struct CorrelatorPool {
    instances: Vec<Arc<Correlator>>,
    next: AtomicUsize,
}

impl CorrelatorPool {
    /// Start `config.correlation.instances` correlators on `broker`.
    ///
    /// The shared backend uses an in-process store; use
    /// [`CorrelatorPool::start_with_store`] to supply an external one.
    pub async fn start(
        broker: Arc<dyn MessageBroker>,
        config: &GatewayConfig,
    ) -> Result<Self, GatewayError> {
        let store: Arc<dyn SharedStore> = Arc::new(InMemorySharedStore::new());
        Self::start_with_store(broker, config, store).await
    }

    /// Start the pool, registering shared-backend entries in `store`.
    pub async fn start_with_store(
        broker: Arc<dyn MessageBroker>,
        config: &GatewayConfig,
        store: Arc<dyn SharedStore>,
    ) -> Result<Self, GatewayError> {
        config
            .validate()
            .map_err(|e| GatewayError::Config(e.to_string()))?;

        let settings = &config.correlation;
        let mut instances = Vec::with_capacity(settings.instances);

        for index in 0..settings.instances {
            let name = format!("correlator-{}", index);
            let table: Arc<dyn PendingTable> = match settings.backend {
                PendingBackend::Local => Arc::new(LocalPendingTable::new()),
                PendingBackend::Shared => Arc::new(SharedPendingTable::new(
                    Arc::clone(&store),
                    format!("{}/{}", std::process::id(), name),
                    settings.shared_ttl_grace,
                )),
            };

            let correlator = Correlator::start(
                name,
                Arc::clone(&broker),
                table,
                settings.clone(),
                &config.broker,
            )
            .await?;
            instances.push(correlator);
        }

        info!(
            instances = instances.len(),
            backend = ?settings.backend,
            "Correlator pool started"
        );

        Ok(Self {
            instances,
            next: AtomicUsize::new(0),
        })
    }

    /// Next instance in round-robin order.
    pub fn pick(&self) -> &Arc<Correlator> {
        let index = self.next.fetch_add(1, Ordering::Relaxed) % self.instances.len();
        &self.instances[index]
    }

    /// Submit through the next instance.
    pub async fn submit(
        &self,
        input: impl Into<Bytes>,
        timeout: Duration,
    ) -> Result<Reply, CallError> {
        self.pick().submit(input, timeout).await
    }

    /// Submit through the next instance with the configured default timeout.
    pub async fn call(
        &self,
        input: impl Into<Bytes>,
        timeout: Option<Duration>,
    ) -> Result<Reply, CallError> {
        self.pick().call(input, timeout).await
    }

    pub fn instances(&self) -> &[Arc<Correlator>] {
        &self.instances
    }

    /// Pending requests across all instances
    pub fn pending_count(&self) -> usize {
        self.instances.iter().map(|c| c.pending_count()).sum()
    }

    pub fn pending_entries(&self) -> Vec<PendingInfo> {
        self.instances
            .iter()
            .flat_map(|c| c.pending_entries())
            .collect()
    }

    /// Whether every instance sees a live broker connection
    pub fn is_connected(&self) -> bool {
        self.instances.iter().all(|c| c.is_connected())
    }

    /// Shut down every instance.
    pub async fn shutdown(&self) {
        for correlator in &self.instances {
            correlator.shutdown().await;
        }
    }
}
