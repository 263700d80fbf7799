//! Status API — reserved `/_worker/*` endpoints
//!
//! Serves health, the metrics snapshot (JSON and Prometheus text), the route
//! table and version info. Requests under the prefix never reach the
//! admission queue.

use crate::benchmark::{BenchmarkRunner, BenchmarkState};
use crate::config::RESERVED_PREFIX;
use crate::health::HealthTracker;
use crate::observability::metrics::MetricsReporter;
use crate::router::RouteTable;
use crate::HealthState;
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Instant;

/// Body of `/_worker/health`
#[derive(Debug, Clone, Serialize)]
pub struct HealthReport {
    pub state: HealthState,
    pub loaded: bool,
    pub last_error: Option<String>,
    pub uptime_secs: u64,
    pub benchmarks: BTreeMap<String, BenchmarkState>,
}

/// Worker version information
#[derive(Debug, Clone, Serialize)]
pub struct VersionInfo {
    pub name: &'static str,
    pub version: &'static str,
}

impl VersionInfo {
    pub(crate) fn current() -> Self {
        Self {
            name: env!("CARGO_PKG_NAME"),
            version: env!("CARGO_PKG_VERSION"),
        }
    }
}

/// Handler for the reserved status endpoints
pub struct StatusApi {
    health: Arc<HealthTracker>,
    reporter: Arc<MetricsReporter>,
    routes: Arc<RouteTable>,
    benchmark: Option<Arc<BenchmarkRunner>>,
    started_at: Instant,
}

impl StatusApi {
    pub fn new(
        health: Arc<HealthTracker>,
        reporter: Arc<MetricsReporter>,
        routes: Arc<RouteTable>,
        benchmark: Option<Arc<BenchmarkRunner>>,
    ) -> Self {
        Self {
            health,
            reporter,
            routes,
            benchmark,
            started_at: Instant::now(),
        }
    }

    /// Check if a request path belongs to the status API
    pub fn matches(&self, path: &str) -> bool {
        path == RESERVED_PREFIX || path.starts_with(&format!("{}/", RESERVED_PREFIX))
    }

    /// Handle a status request, `None` if the path is not reserved
    pub fn handle(&self, method: &http::Method, path: &str) -> Option<StatusResponse> {
        if !self.matches(path) {
            return None;
        }
        if method != http::Method::GET && method != http::Method::HEAD {
            return Some(StatusResponse::error(405, "method_not_allowed"));
        }

        let sub_path = path[RESERVED_PREFIX.len()..].trim_end_matches('/');
        let response = match sub_path {
            "/health" => {
                let report = self.health_report();
                // Load balancers probe this; only Ready counts as healthy
                let status = if report.state.is_ready() { 200 } else { 503 };
                StatusResponse::json(status, &report)
            }
            "/metrics" => StatusResponse::json(200, &self.reporter.snapshot()),
            "/metrics/prometheus" => StatusResponse {
                status: 200,
                content_type: "text/plain; version=0.0.4",
                body: self.reporter.render_prometheus(),
            },
            "/routes" => StatusResponse::json(200, &self.routes.routes_info()),
            "/version" => StatusResponse::json(200, &VersionInfo::current()),
            _ => StatusResponse::error(404, "not_found"),
        };
        Some(response)
    }

    fn health_report(&self) -> HealthReport {
        let snapshot = self.health.snapshot();
        HealthReport {
            state: snapshot.state,
            loaded: snapshot.loaded,
            last_error: snapshot.last_error,
            uptime_secs: self.started_at.elapsed().as_secs(),
            benchmarks: self
                .benchmark
                .as_ref()
                .map(|b| b.states())
                .unwrap_or_default(),
        }
    }
}

/// Response from the status API
#[derive(Debug, Clone)]
pub struct StatusResponse {
    pub status: u16,
    pub content_type: &'static str,
    pub body: String,
}

impl StatusResponse {
    fn json<T: Serialize>(status: u16, value: &T) -> Self {
        match serde_json::to_string_pretty(value) {
            Ok(body) => Self {
                status,
                content_type: "application/json",
                body,
            },
            Err(e) => {
                tracing::error!(error = %e, "Failed to serialize status response");
                Self::error(500, "internal")
            }
        }
    }

    fn error(status: u16, kind: &str) -> Self {
        Self {
            status,
            content_type: "application/json",
            body: serde_json::json!({ "error": kind }).to_string(),
        }
    }
}
