//! Structured access log — one entry per dispatched request
//!
//! Entries are emitted on the `access_log` tracing target so they can be
//! routed separately from operational logs.

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};

use super::metrics::CompletionEvent;

/// A single access log entry
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccessLogEntry {
    /// RFC 3339 timestamp
    pub timestamp: String,
    /// HTTP method
    pub method: String,
    /// Route path
    pub path: String,
    /// Status returned to the client (0 if the upstream never answered)
    pub status: u16,
    /// How the dispatch ended
    pub outcome: String,
    /// Response body bytes relayed
    pub response_bytes: u64,
    /// Time spent waiting for admission
    pub wait_ms: u64,
    /// Time spent at the upstream
    pub service_ms: u64,
    /// Estimated cost
    pub cost: f64,
    /// Benchmark traffic
    pub synthetic: bool,
}

impl AccessLogEntry {
    /// Build an entry from a completion event
    pub fn from_completion(
        method: &str,
        status: u16,
        response_bytes: u64,
        event: &CompletionEvent,
    ) -> Self {
        Self {
            timestamp: chrono::Utc::now().to_rfc3339(),
            method: method.to_string(),
            path: event.route.clone(),
            status,
            outcome: event.outcome.label().to_string(),
            response_bytes,
            wait_ms: event.wait.as_millis() as u64,
            service_ms: event.service.as_millis() as u64,
            cost: event.cost,
            synthetic: event.synthetic,
        }
    }
}

/// Access log emitter
#[derive(Default)]
pub struct AccessLog {
    total_entries: AtomicU64,
}

impl AccessLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record and emit a log entry
    pub fn record(&self, entry: &AccessLogEntry) {
        self.total_entries.fetch_add(1, Ordering::Relaxed);
        tracing::info!(
            target: "access_log",
            method = entry.method,
            path = entry.path,
            status = entry.status,
            outcome = entry.outcome,
            wait_ms = entry.wait_ms,
            service_ms = entry.service_ms,
            cost = entry.cost,
            synthetic = entry.synthetic,
            "{}",
            serde_json::to_string(entry).unwrap_or_default()
        );
    }

    /// Number of entries emitted so far
    pub fn total_entries(&self) -> u64 {
        self.total_entries.load(Ordering::Relaxed)
    }
}
