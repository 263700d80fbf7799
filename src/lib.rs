//! # Inference Worker
//!
//! An admission-control proxy that sits in front of a local model-inference
//! server (speech recognition in the default deployment) and turns it into a
//! worker an external autoscaler can reason about.
//!
//! ## Architecture
//!
//! ```text
//! Entrypoint → Admission Queue (estimator cost, max queue time) → Proxy Dispatcher → Model server
//!                                                                       │
//! Log Monitor ──▶ Health Tracker ──┐                                    ▼
//! Benchmark Runner ────────────────┴──────────────────────────▶ Metrics Reporter
//! ```
//!
//! ## Core Features
//!
//! - **Admission control**: per-route serialized or parallel execution with a
//!   bounded queue wait; late requests are rejected, never forwarded
//! - **Workload estimation**: per-route cost functions (constant, WAV duration)
//! - **Capacity benchmarking**: synthetic traffic once the model server is ready
//! - **Log-driven health**: `Starting → Ready ⇄ Degraded → Stopped` from the
//!   model server's own log
//! - **Metrics**: JSON and Prometheus snapshots, optional push to an autoscaler
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use inference_worker::{config::WorkerConfig, Worker};
//!
//! #[tokio::main]
//! async fn main() -> inference_worker::Result<()> {
//!     let mut config = WorkerConfig::default();
//!     config.apply_env_overrides()?;
//!     let worker = Worker::new(config)?;
//!     worker.start().await?;
//!     worker.wait_for_shutdown().await;
//!     Ok(())
//! }
//! ```

pub mod admission;
pub mod benchmark;
pub mod config;
pub mod entrypoint;
pub mod error;
pub mod estimator;
pub mod health;
pub mod monitor;
pub mod observability;
pub mod proxy;
pub mod router;
pub mod status;
pub mod worker;

#[cfg(test)]
mod testing;

// Re-export main types
pub use config::WorkerConfig;
pub use error::{Result, WorkerError};
pub use worker::Worker;

use serde::{Deserialize, Serialize};

/// Process-wide health of the model server, as seen through its log
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum HealthState {
    /// Model server has not reported itself loaded yet
    #[default]
    Starting,
    /// Model server is loaded and serving
    Ready,
    /// An error line was seen recently
    Degraded,
    /// Worker is shutting down
    Stopped,
}

impl HealthState {
    pub fn is_ready(&self) -> bool {
        matches!(self, Self::Ready)
    }
}

impl std::fmt::Display for HealthState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Starting => write!(f, "starting"),
            Self::Ready => write!(f, "ready"),
            Self::Degraded => write!(f, "degraded"),
            Self::Stopped => write!(f, "stopped"),
        }
    }
}
