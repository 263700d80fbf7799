//! Centralized error types for the inference worker

use bytes::Bytes;
use thiserror::Error;

/// Worker error types
#[derive(Debug, Error)]
pub enum WorkerError {
    /// Invalid configuration (fatal at startup)
    #[error("Configuration error: {0}")]
    Config(String),

    /// Request waited longer than the route's max queue time
    #[error("Admission timed out for route {route} after {waited_ms}ms")]
    AdmissionTimeout { route: String, waited_ms: u64 },

    /// No route is configured for the requested path
    #[error("No route configured for path {0}")]
    UnroutablePath(String),

    /// The model server could not be reached
    #[error("Upstream unavailable: {0}")]
    UpstreamUnavailable(String),

    /// The model server did not answer in time
    #[error("Upstream timed out after {0}ms")]
    UpstreamTimeout(u64),

    /// The model server answered with a non-success status
    #[error("Upstream returned status {status}")]
    UpstreamStatus {
        status: u16,
        headers: http::HeaderMap,
        body: Bytes,
    },

    /// A benchmark run produced no usable measurement
    #[error("Benchmark failed for route {route}: {reason}")]
    Benchmark { route: String, reason: String },

    /// A workload estimator panicked or returned an invalid cost
    #[error("Estimator fault on route {route}: {reason}")]
    EstimatorFault { route: String, reason: String },

    /// HTTP client error
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Generic error
    #[error("{0}")]
    Other(String),
}

impl WorkerError {
    /// Stable machine-readable kind, sent to callers in `x-worker-error`
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Config(_) => "config",
            Self::AdmissionTimeout { .. } => "admission_timeout",
            Self::UnroutablePath(_) => "unroutable_path",
            Self::UpstreamUnavailable(_) | Self::Http(_) => "upstream_unavailable",
            Self::UpstreamTimeout(_) => "upstream_timeout",
            Self::UpstreamStatus { .. } => "upstream_status",
            Self::Benchmark { .. } => "benchmark_failure",
            Self::EstimatorFault { .. } => "estimator_fault",
            Self::Io(_) | Self::Serialization(_) | Self::Other(_) => "internal",
        }
    }

    /// HTTP status surfaced to the caller for this error
    pub fn status_code(&self) -> http::StatusCode {
        use http::StatusCode;
        match self {
            Self::UnroutablePath(_) => StatusCode::NOT_FOUND,
            Self::AdmissionTimeout { .. } => StatusCode::SERVICE_UNAVAILABLE,
            Self::UpstreamUnavailable(_) | Self::Http(_) => StatusCode::BAD_GATEWAY,
            Self::UpstreamTimeout(_) => StatusCode::GATEWAY_TIMEOUT,
            Self::UpstreamStatus { status, .. } => {
                StatusCode::from_u16(*status).unwrap_or(StatusCode::BAD_GATEWAY)
            }
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

/// Convenience Result type alias
pub type Result<T> = std::result::Result<T, WorkerError>;
