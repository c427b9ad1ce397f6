//! Gateway service: the HTTP call surface and the admin server.

use crate::domain::config::GatewayConfig;
use crate::domain::error::{ApiError, ApiResult, GatewayError};
use crate::ports::CallHandler;
use crate::wait_for_shutdown;
use axum::{
    extract::State,
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tower::ServiceBuilder;
use tower_http::limit::RequestBodyLimitLayer;
use tower_http::trace::TraceLayer;
use tracing::{debug, info, warn};

/// Body of `POST /process`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessRequest {
    pub input: String,
    /// Per-call timeout; the configured default applies when absent
    #[serde(default)]
    pub timeout_ms: Option<u64>,
}

/// Successful response of `POST /process`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessResponse {
    pub result: String,
    pub latency_ms: u64,
}

/// HTTP front of the correlation engine
pub struct GatewayService {
    config: GatewayConfig,
    handler: Arc<dyn CallHandler>,
    /// Routes merged into the admin router
    extra_admin: Router,
}

impl GatewayService {
    /// Create a new gateway service
    pub fn new(config: GatewayConfig, handler: Arc<dyn CallHandler>) -> Result<Self, GatewayError> {
        config
            .validate()
            .map_err(|e| GatewayError::Config(e.to_string()))?;

        Ok(Self {
            config,
            handler,
            extra_admin: Router::new(),
        })
    }

    /// Serve `routes` on the admin server alongside the built-in endpoints.
    pub fn with_admin_routes(mut self, routes: Router) -> Self {
        self.extra_admin = self.extra_admin.merge(routes);
        self
    }

    /// Bind the enabled servers and serve until `shutdown` turns true.
    pub async fn serve(&self, shutdown: watch::Receiver<bool>) -> Result<(), GatewayError> {
        info!("Starting gateway servers...");

        let mut servers = Vec::new();

        if self.config.http.enabled {
            let addr = self.config.http_addr();
            let listener = TcpListener::bind(addr)
                .await
                .map_err(|e| GatewayError::Bind(format!("{}: {}", addr, e)))?;
            info!(addr = %addr, "HTTP server listening");
            servers.push(tokio::spawn(serve_router(
                listener,
                self.http_router(),
                shutdown.clone(),
            )));
        }

        if self.config.admin.enabled {
            let addr = self.config.admin_addr();
            let listener = TcpListener::bind(addr)
                .await
                .map_err(|e| GatewayError::Bind(format!("{}: {}", addr, e)))?;
            info!(addr = %addr, "Admin server listening");
            servers.push(tokio::spawn(serve_router(
                listener,
                self.admin_router(),
                shutdown.clone(),
            )));
        }

        for server in servers {
            match server.await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => warn!(error = %e, "Server error"),
                Err(e) => warn!(error = %e, "Server task failed"),
            }
        }

        info!("Gateway servers stopped");
        Ok(())
    }

    /// Router for the call surface
    pub fn http_router(&self) -> Router {
        let middleware = ServiceBuilder::new()
            .layer(TraceLayer::new_for_http())
            .layer(RequestBodyLimitLayer::new(self.config.limits.max_request_size));

        Router::new()
            .route("/process", post(handle_process))
            .route("/health", get(health_check))
            .layer(middleware)
            .with_state(Arc::clone(&self.handler))
    }

    /// Router for the admin server
    pub fn admin_router(&self) -> Router {
        let router = Router::new()
            .route("/health", get(health_check))
            .route("/metrics", get(metrics_json))
            .route("/pending", get(pending));

        #[cfg(feature = "metrics")]
        let router = router.route("/metrics/prometheus", get(metrics_prometheus));

        router
            .with_state(Arc::clone(&self.handler))
            .merge(self.extra_admin.clone())
    }
}

/// Serve `router` on `listener` until shutdown is signalled.
pub async fn serve_router(
    listener: TcpListener,
    router: Router,
    mut shutdown: watch::Receiver<bool>,
) -> std::io::Result<()> {
    axum::serve(listener, router)
        .with_graceful_shutdown(async move { wait_for_shutdown(&mut shutdown).await })
        .await
}

type HandlerState = State<Arc<dyn CallHandler>>;

/// Handle `POST /process`
async fn handle_process(
    State(handler): HandlerState,
    body: String,
) -> ApiResult<Json<ProcessResponse>> {
    let request: ProcessRequest = serde_json::from_str(&body)?;
    let timeout = request.timeout_ms.map(Duration::from_millis);

    info!(
        input_len = request.input.len(),
        timeout_ms = request.timeout_ms,
        "Request received"
    );

    let reply = handler
        .handle(Bytes::from(request.input), timeout)
        .await
        .map_err(ApiError::from)?;

    let result = String::from_utf8(reply.payload.to_vec())
        .map_err(|_| ApiError::internal("reply payload is not valid UTF-8"))?;
    let latency_ms = reply.latency.as_millis() as u64;

    info!(
        correlation_id = %reply.correlation_id,
        latency_ms = latency_ms,
        "Request completed"
    );

    Ok(Json(ProcessResponse { result, latency_ms }))
}

/// Health check endpoint
async fn health_check(State(handler): HandlerState) -> impl IntoResponse {
    let healthy = handler.is_healthy();
    let status = if healthy {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (
        status,
        Json(serde_json::json!({
            "status": if healthy { "healthy" } else { "degraded" },
            "service": "rpc-gateway",
            "version": crate::VERSION,
            "pending": handler.pending_count(),
        })),
    )
}

async fn metrics_json(State(handler): HandlerState) -> impl IntoResponse {
    Json(handler.metrics_json())
}

#[cfg(feature = "metrics")]
async fn metrics_prometheus(State(handler): HandlerState) -> ApiResult<impl IntoResponse> {
    let text = handler
        .metrics_prometheus()
        .map_err(|e| ApiError::internal(e.to_string()))?;
    Ok((
        [(
            axum::http::header::CONTENT_TYPE,
            "text/plain; version=0.0.4",
        )],
        text,
    ))
}

async fn pending(State(handler): HandlerState) -> impl IntoResponse {
    let entries = handler.pending_entries();
    debug!(count = entries.len(), "Pending requests listed");
    Json(serde_json::json!({
        "count": entries.len(),
        "entries": entries,
    }))
}
