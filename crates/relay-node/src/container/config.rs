//! # Node Configuration
//!
//! Gateway settings plus the in-process worker pool. Loaded from an optional
//! JSON file, then overridden from the command line and `RELAY_*` variables.

use rpc_gateway::domain::config::{ConfigError as GatewayConfigError, PendingBackend};
use rpc_gateway::GatewayConfig;
use serde::{Deserialize, Serialize};
use shared_bus::DEFAULT_PREFETCH;
use std::path::Path;
use std::time::Duration;

/// Complete node configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    /// Gateway: servers, correlation and broker settings.
    pub gateway: GatewayConfig,
    /// Worker pool.
    pub workers: WorkerConfig,
}

/// Worker pool configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    /// Number of competing consumers on the request queue.
    pub count: usize,
    /// Unacknowledged deliveries each worker may hold.
    pub prefetch: usize,
    /// Appended to every request payload to form the reply.
    pub reply_suffix: String,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            count: 2,
            prefetch: DEFAULT_PREFETCH,
            reply_suffix: " bar".to_string(),
        }
    }
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum NodeConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: String,
        source: std::io::Error,
    },

    #[error("failed to parse config file {path}: {source}")]
    Parse {
        path: String,
        source: serde_json::Error,
    },

    #[error("invalid gateway configuration: {0}")]
    Gateway(#[from] GatewayConfigError),

    #[error("worker prefetch must be at least 1")]
    ZeroPrefetch,
}

impl NodeConfig {
    /// Load configuration from a JSON file. Missing fields take defaults.
    pub fn from_file(path: &Path) -> Result<Self, NodeConfigError> {
        let display = path.display().to_string();
        let contents = std::fs::read_to_string(path).map_err(|source| NodeConfigError::Read {
            path: display.clone(),
            source,
        })?;
        serde_json::from_str(&contents).map_err(|source| NodeConfigError::Parse {
            path: display,
            source,
        })
    }

    /// Validate the whole configuration.
    pub fn validate(&self) -> Result<(), NodeConfigError> {
        self.gateway.validate()?;
        if self.workers.prefetch == 0 {
            return Err(NodeConfigError::ZeroPrefetch);
        }
        Ok(())
    }
}

/// Values supplied on the command line or through the environment.
#[derive(Debug, Clone, Default)]
pub struct Overrides {
    pub http_port: Option<u16>,
    pub admin_port: Option<u16>,
    pub timeout: Option<Duration>,
    pub workers: Option<usize>,
    pub instances: Option<usize>,
    pub broker_url: Option<String>,
    pub backend: Option<PendingBackend>,
}

impl Overrides {
    /// Apply every value that is set.
    pub fn apply(self, config: &mut NodeConfig) {
        if let Some(port) = self.http_port {
            config.gateway.http.port = port;
        }
        if let Some(port) = self.admin_port {
            config.gateway.admin.port = port;
        }
        if let Some(timeout) = self.timeout {
            let correlation = &mut config.gateway.correlation;
            correlation.default_timeout = timeout;
            correlation.max_timeout = correlation.max_timeout.max(timeout);
        }
        if let Some(count) = self.workers {
            config.workers.count = count;
        }
        if let Some(instances) = self.instances {
            config.gateway.correlation.instances = instances;
        }
        if let Some(url) = self.broker_url {
            config.gateway.broker.url = url;
        }
        if let Some(backend) = self.backend {
            config.gateway.correlation.backend = backend;
        }
    }
}
