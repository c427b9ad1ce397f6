//! # Relay Node
//!
//! Runs the gateway and its worker pool in one process.
//!
//! ## Modular Structure
//!
//! - `container/` - Node configuration (file, CLI and environment)
//! - `handlers/` - The RPC worker consuming the request queue
//!
//! ## Startup Sequence
//!
//! 1. Load and validate configuration
//! 2. Create the broker
//! 3. Start the correlator pool (declares the request queue and one
//!    exclusive reply queue per instance)
//! 4. Spawn the workers
//! 5. Serve the HTTP call surface and the admin server
//!
//! ```text
//! HTTP ──▶ GatewayService ──▶ CorrelatorPool ──publish──▶ rpc_queue
//!                                   ▲                        │
//!                                   │                        ▼
//!                             amq.gen-* ◀──publish_reply── RpcWorker × N
//! ```

pub mod container;
pub mod handlers;

use std::sync::Arc;

use axum::{http::StatusCode, response::IntoResponse, routing::get, Router};
use rpc_gateway::{CallHandler, CorrelatorPool, GatewayError, GatewayService};
use shared_bus::{InMemoryBroker, MessageBroker};
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::container::{NodeConfig, NodeConfigError};
use crate::handlers::RpcWorker;

/// Node startup and runtime errors.
#[derive(Debug, thiserror::Error)]
pub enum NodeError {
    #[error(transparent)]
    Config(#[from] NodeConfigError),

    #[error(transparent)]
    Gateway(#[from] GatewayError),
}

/// The running node.
pub struct RelayNode {
    config: NodeConfig,
    broker: Arc<InMemoryBroker>,
    pool: Arc<CorrelatorPool>,
    shutdown_tx: watch::Sender<bool>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl RelayNode {
    /// Validate `config`, start the correlator pool and spawn the workers.
    pub async fn start(config: NodeConfig) -> Result<Self, NodeError> {
        config.validate()?;

        info!(
            broker_url = %config.gateway.broker.url,
            "Using in-process broker"
        );
        let broker = Arc::new(InMemoryBroker::new());
        let pool = Arc::new(
            CorrelatorPool::start(
                Arc::clone(&broker) as Arc<dyn MessageBroker>,
                &config.gateway,
            )
            .await?,
        );

        let (shutdown_tx, _) = watch::channel(false);

        if config.workers.count == 0 {
            warn!("No workers configured, requests will wait for external consumers");
        }
        let workers = (0..config.workers.count)
            .map(|id| {
                let worker = RpcWorker::new(
                    id,
                    Arc::clone(&broker) as Arc<dyn MessageBroker>,
                    config.gateway.broker.request_queue.clone(),
                    config.workers.prefetch,
                    config.workers.reply_suffix.clone(),
                    config.gateway.broker.reconnect_delay,
                    shutdown_tx.subscribe(),
                );
                tokio::spawn(worker.run())
            })
            .collect();

        info!(
            instances = config.gateway.correlation.instances,
            workers = config.workers.count,
            "Relay node started"
        );

        Ok(Self {
            config,
            broker,
            pool,
            shutdown_tx,
            workers: Mutex::new(workers),
        })
    }

    pub fn config(&self) -> &NodeConfig {
        &self.config
    }

    pub fn broker(&self) -> &Arc<InMemoryBroker> {
        &self.broker
    }

    pub fn pool(&self) -> &Arc<CorrelatorPool> {
        &self.pool
    }

    /// Gateway service backed by this node's pool, with process metrics on
    /// the admin server at `/metrics/node`.
    pub fn service(&self) -> Result<GatewayService, GatewayError> {
        let handler: Arc<dyn CallHandler> = Arc::clone(&self.pool) as Arc<dyn CallHandler>;
        let service = GatewayService::new(self.config.gateway.clone(), handler)?;
        Ok(service.with_admin_routes(node_metrics_router(Arc::clone(&self.pool))))
    }

    /// Serve HTTP and admin until [`RelayNode::shutdown`] is called.
    pub async fn serve(&self) -> Result<(), NodeError> {
        self.service()?.serve(self.shutdown_tx.subscribe()).await?;
        Ok(())
    }

    /// Stop servers and workers, failing any in-flight calls.
    pub async fn shutdown(&self) {
        info!("Initiating graceful shutdown...");

        self.shutdown_tx.send_replace(true);
        self.pool.shutdown().await;

        for worker in self.workers.lock().await.drain(..) {
            if let Err(e) = worker.await {
                warn!(error = %e, "Worker task failed");
            }
        }

        info!("Shutdown complete");
    }
}

fn node_metrics_router(pool: Arc<CorrelatorPool>) -> Router {
    Router::new().route(
        "/metrics/node",
        get(move || {
            let pool = Arc::clone(&pool);
            async move {
                relay_telemetry::GATEWAY_PENDING.set(pool.pending_count() as i64);
                match relay_telemetry::encode_metrics() {
                    Ok(text) => (StatusCode::OK, text).into_response(),
                    Err(e) => (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response(),
                }
            }
        }),
    )
}
