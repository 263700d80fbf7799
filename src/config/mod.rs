//! Configuration types for the inference worker
//!
//! Everything the worker needs is fixed at startup: the upstream model server,
//! the log file it writes, the route table with per-route admission policy,
//! estimators and benchmark protocols, and the log patterns that drive health.
//! Built-in defaults describe the ASR deployment; an HCL file may replace them.

mod log_action;
mod route;

pub use log_action::LogActionConfig;
pub use route::{
    BenchmarkConfig, EstimatorConfig, GeneratorConfig, RouteConfig, MAX_QUEUE_SECS, RESERVED_PREFIX,
};

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::Path;

use crate::error::{Result, WorkerError};

/// Environment variable overriding the upstream model-server port
pub const ENV_SERVER_PORT: &str = "SERVER_PORT";
/// Environment variable overriding the model-server log path
pub const ENV_MODEL_LOG: &str = "MODEL_LOG";
/// Environment variable overriding the worker's listen port
pub const ENV_WORKER_PORT: &str = "WORKER_PORT";
/// Environment variable setting the autoscaler report URL
pub const ENV_REPORT_URL: &str = "REPORT_URL";

/// Top-level worker configuration
///
/// # HCL Example
///
/// ```hcl
/// listen = "0.0.0.0:3000"
///
/// upstream {
///   url  = "http://127.0.0.1"
///   port = 8000
/// }
///
/// log {
///   path = "/var/log/model/server.log"
/// }
///
/// routes = [
///   { path = "/health", max_queue_secs = 5, estimator = { kind = "constant", value = 0 } }
/// ]
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerConfig {
    /// Address the worker listens on
    #[serde(default = "default_listen")]
    pub listen: String,

    /// Model server the routes are forwarded to
    #[serde(default)]
    pub upstream: UpstreamConfig,

    /// Model server log source
    #[serde(default)]
    pub log: LogConfig,

    /// Log line patterns
    #[serde(default)]
    pub log_actions: LogActionConfig,

    /// Health state machine tuning
    #[serde(default)]
    pub health: HealthConfig,

    /// Benchmark scheduling
    #[serde(default)]
    pub benchmark: BenchmarkScheduleConfig,

    /// Metrics aggregation and reporting
    #[serde(default)]
    pub metrics: MetricsConfig,

    /// Proxied routes
    #[serde(default)]
    pub routes: Vec<RouteConfig>,

    /// Graceful shutdown timeout in seconds (default: 30)
    #[serde(default = "default_shutdown_timeout")]
    pub shutdown_timeout_secs: u64,
}

fn default_listen() -> String {
    "0.0.0.0:3000".to_string()
}

fn default_shutdown_timeout() -> u64 {
    30
}

impl WorkerConfig {
    /// Load configuration from an HCL file.
    pub async fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = tokio::fs::read_to_string(path).await.map_err(|e| {
            WorkerError::Config(format!(
                "Failed to read config file {}: {}",
                path.display(),
                e
            ))
        })?;
        Self::from_hcl(&content)
    }

    /// Parse configuration from an HCL string
    pub fn from_hcl(content: &str) -> Result<Self> {
        hcl::from_str(content)
            .map_err(|e| WorkerError::Config(format!("Failed to parse HCL config: {}", e)))
    }

    /// Apply `SERVER_PORT`, `MODEL_LOG`, `WORKER_PORT` and `REPORT_URL` from the process environment
    pub fn apply_env_overrides(&mut self) -> Result<()> {
        let overrides = EnvOverrides {
            server_port: std::env::var(ENV_SERVER_PORT).ok(),
            model_log: std::env::var(ENV_MODEL_LOG).ok(),
            worker_port: std::env::var(ENV_WORKER_PORT).ok(),
            report_url: std::env::var(ENV_REPORT_URL).ok(),
        };
        self.apply_overrides(&overrides)
    }

    /// Apply explicit overrides (empty values are ignored)
    pub fn apply_overrides(&mut self, overrides: &EnvOverrides) -> Result<()> {
        if let Some(port) = non_empty(&overrides.server_port) {
            self.upstream.port = port.parse().map_err(|_| {
                WorkerError::Config(format!("{} must be a port number, got '{}'", ENV_SERVER_PORT, port))
            })?;
        }
        if let Some(path) = non_empty(&overrides.model_log) {
            self.log.path = path.to_string();
        }
        if let Some(port) = non_empty(&overrides.worker_port) {
            let port: u16 = port.parse().map_err(|_| {
                WorkerError::Config(format!("{} must be a port number, got '{}'", ENV_WORKER_PORT, port))
            })?;
            let host = self
                .listen
                .rsplit_once(':')
                .map(|(host, _)| host.to_string())
                .unwrap_or_else(|| "0.0.0.0".to_string());
            self.listen = format!("{}:{}", host, port);
        }
        if let Some(url) = non_empty(&overrides.report_url) {
            self.metrics.report_url = Some(url.to_string());
        }
        Ok(())
    }

    /// Validate the configuration for consistency
    pub fn validate(&self) -> Result<()> {
        self.listen.parse::<std::net::SocketAddr>().map_err(|e| {
            WorkerError::Config(format!("Invalid listen address '{}': {}", self.listen, e))
        })?;

        reqwest::Url::parse(&self.upstream.base_url()).map_err(|e| {
            WorkerError::Config(format!(
                "Invalid upstream URL '{}': {}",
                self.upstream.base_url(),
                e
            ))
        })?;

        if self.routes.is_empty() {
            return Err(WorkerError::Config("No routes configured".to_string()));
        }

        let mut seen = HashSet::new();
        for route in &self.routes {
            route.validate()?;
            if !seen.insert(route.path.as_str()) {
                return Err(WorkerError::Config(format!(
                    "Duplicate route path '{}'",
                    route.path
                )));
            }
        }

        if self.log.poll_interval_ms == 0 {
            return Err(WorkerError::Config(
                "log.poll_interval_ms must be greater than 0".to_string(),
            ));
        }
        if self.metrics.window_secs == 0 {
            return Err(WorkerError::Config(
                "metrics.window_secs must be greater than 0".to_string(),
            ));
        }
        if self.metrics.report_interval_secs == 0 {
            return Err(WorkerError::Config(
                "metrics.report_interval_secs must be greater than 0".to_string(),
            ));
        }
        if self.benchmark.interval_secs == Some(0) {
            return Err(WorkerError::Config(
                "benchmark.interval_secs must be greater than 0".to_string(),
            ));
        }
        if let Some(ref url) = self.metrics.report_url {
            reqwest::Url::parse(url).map_err(|e| {
                WorkerError::Config(format!("Invalid metrics.report_url '{}': {}", url, e))
            })?;
        }

        Ok(())
    }
}

impl Default for WorkerConfig {
    fn default() -> Self {
        let transcribe = RouteConfig {
            path: "/v1/audio/transcriptions".to_string(),
            allow_parallel: true,
            max_queue_secs: 120.0,
            estimator: EstimatorConfig::Constant { value: 10.0 },
            benchmark: Some(BenchmarkConfig {
                generator: GeneratorConfig::SilenceWav {
                    seconds: 1.0,
                    sample_rate: 16_000,
                    language: Some("hi".to_string()),
                },
                runs: 4,
                concurrency: 1,
            }),
            streaming: None,
        };
        let transcribe_stream = RouteConfig {
            path: "/v1/audio/transcriptions/stream".to_string(),
            allow_parallel: true,
            max_queue_secs: 60.0,
            estimator: EstimatorConfig::Constant { value: 10.0 },
            benchmark: None,
            streaming: None,
        };
        let health = RouteConfig {
            path: "/health".to_string(),
            allow_parallel: true,
            max_queue_secs: 5.0,
            estimator: EstimatorConfig::Constant { value: 0.0 },
            benchmark: None,
            streaming: None,
        };

        Self {
            listen: default_listen(),
            upstream: UpstreamConfig::default(),
            log: LogConfig::default(),
            log_actions: LogActionConfig::default(),
            health: HealthConfig::default(),
            benchmark: BenchmarkScheduleConfig::default(),
            metrics: MetricsConfig::default(),
            routes: vec![transcribe, transcribe_stream, health],
            shutdown_timeout_secs: default_shutdown_timeout(),
        }
    }
}

/// Values read from the environment at startup
#[derive(Debug, Clone, Default)]
pub struct EnvOverrides {
    pub server_port: Option<String>,
    pub model_log: Option<String>,
    pub worker_port: Option<String>,
    pub report_url: Option<String>,
}

fn non_empty(value: &Option<String>) -> Option<&str> {
    value.as_deref().map(str::trim).filter(|v| !v.is_empty())
}

/// Upstream model server
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpstreamConfig {
    /// Scheme and host, without port (default: `http://127.0.0.1`)
    #[serde(default = "default_upstream_url")]
    pub url: String,

    /// Port (default: 8000)
    #[serde(default = "default_upstream_port")]
    pub port: u16,

    /// Whole-request timeout for buffered routes, in seconds (default: 600)
    #[serde(default = "default_upstream_timeout")]
    pub timeout_secs: u64,

    /// TCP connect timeout, in seconds (default: 5)
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,
}

fn default_upstream_url() -> String {
    "http://127.0.0.1".to_string()
}

fn default_upstream_port() -> u16 {
    8000
}

fn default_upstream_timeout() -> u64 {
    600
}

fn default_connect_timeout() -> u64 {
    5
}

impl UpstreamConfig {
    /// Base URL every route is appended to, e.g. `http://127.0.0.1:8000`
    pub fn base_url(&self) -> String {
        format!("{}:{}", self.url.trim_end_matches('/'), self.port)
    }
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            url: default_upstream_url(),
            port: default_upstream_port(),
            timeout_secs: default_upstream_timeout(),
            connect_timeout_secs: default_connect_timeout(),
        }
    }
}

/// Model server log source
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    /// Path of the log file (default: `/var/log/model/server.log`)
    #[serde(default = "default_log_path")]
    pub path: String,

    /// How often the file is polled for new lines, in milliseconds (default: 250)
    #[serde(default = "default_poll_interval")]
    pub poll_interval_ms: u64,

    /// Read lines already present when the file is first opened (default: true)
    #[serde(default = "default_true")]
    pub read_existing: bool,
}

fn default_log_path() -> String {
    "/var/log/model/server.log".to_string()
}

fn default_poll_interval() -> u64 {
    250
}

fn default_true() -> bool {
    true
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            path: default_log_path(),
            poll_interval_ms: default_poll_interval(),
            read_existing: true,
        }
    }
}

/// Health state machine tuning
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthConfig {
    /// Seconds without a new error line before Degraded recovers to Ready (default: 60)
    #[serde(default = "default_recovery_secs")]
    pub recovery_secs: u64,
}

fn default_recovery_secs() -> u64 {
    60
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            recovery_secs: default_recovery_secs(),
        }
    }
}

/// Benchmark scheduling
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BenchmarkScheduleConfig {
    /// Run benchmarks once the model server is ready (default: true)
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Re-run every N seconds after the first run (default: never)
    #[serde(default)]
    pub interval_secs: Option<u64>,
}

impl Default for BenchmarkScheduleConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_secs: None,
        }
    }
}

/// Metrics aggregation and optional push reporting
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsConfig {
    /// Rolling window for load figures, in seconds (default: 60)
    #[serde(default = "default_window_secs")]
    pub window_secs: u64,

    /// Autoscaler endpoint the snapshot is POSTed to (default: none, pull only)
    #[serde(default)]
    pub report_url: Option<String>,

    /// Push interval in seconds (default: 10)
    #[serde(default = "default_report_interval")]
    pub report_interval_secs: u64,
}

fn default_window_secs() -> u64 {
    60
}

fn default_report_interval() -> u64 {
    10
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            window_secs: default_window_secs(),
            report_url: None,
            report_interval_secs: default_report_interval(),
        }
    }
}
