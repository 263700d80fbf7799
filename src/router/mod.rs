//! Route table — exact-path lookup of the fixed set of proxied routes
//!
//! Built once at startup from `RouteConfig`s; estimators and benchmark
//! generators are instantiated here and shared read-only afterwards.

use crate::benchmark::generator::{build_generator, BenchmarkGenerator};
use crate::config::RouteConfig;
use crate::error::{Result, WorkerError};
use crate::estimator::{build_estimator, Estimator};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

/// A compiled route
pub struct Route {
    /// Request path, identical upstream
    pub path: String,
    /// Whether admitted requests may overlap
    pub allow_parallel: bool,
    /// Longest admission wait
    pub max_queue: Duration,
    /// Relay bodies incrementally
    pub streaming: bool,
    /// Workload estimator
    pub estimator: Arc<dyn Estimator>,
    /// Calibration protocol
    pub benchmark: Option<BenchmarkPlan>,
}

impl std::fmt::Debug for Route {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Route")
            .field("path", &self.path)
            .field("allow_parallel", &self.allow_parallel)
            .field("max_queue", &self.max_queue)
            .field("streaming", &self.streaming)
            .field("benchmark", &self.benchmark.is_some())
            .finish()
    }
}

/// Compiled benchmark protocol
#[derive(Clone)]
pub struct BenchmarkPlan {
    pub generator: Arc<dyn BenchmarkGenerator>,
    pub runs: u32,
    pub concurrency: u32,
}

impl Route {
    /// Compile a single route configuration
    pub fn from_config(config: &RouteConfig) -> Result<Self> {
        config.validate()?;
        let max_queue = Duration::try_from_secs_f64(config.max_queue_secs).map_err(|e| {
            WorkerError::Config(format!(
                "Route '{}': invalid max_queue_secs {}: {}",
                config.path, config.max_queue_secs, e
            ))
        })?;

        Ok(Self {
            path: config.path.clone(),
            allow_parallel: config.allow_parallel,
            max_queue,
            streaming: config.is_streaming(),
            estimator: build_estimator(&config.estimator),
            benchmark: config.benchmark.as_ref().map(|b| BenchmarkPlan {
                generator: build_generator(&b.generator),
                runs: b.runs,
                concurrency: b.concurrency,
            }),
        })
    }

    /// Route metadata for the status API
    pub fn info(&self) -> RouteInfo {
        RouteInfo {
            path: self.path.clone(),
            allow_parallel: self.allow_parallel,
            max_queue_secs: self.max_queue.as_secs_f64(),
            streaming: self.streaming,
            benchmark_runs: self.benchmark.as_ref().map(|b| b.runs),
            benchmark_concurrency: self.benchmark.as_ref().map(|b| b.concurrency),
        }
    }
}

/// Route information for the status API
#[derive(Debug, Clone, Serialize)]
pub struct RouteInfo {
    pub path: String,
    pub allow_parallel: bool,
    pub max_queue_secs: f64,
    pub streaming: bool,
    pub benchmark_runs: Option<u32>,
    pub benchmark_concurrency: Option<u32>,
}

/// Route table — immutable after construction
pub struct RouteTable {
    /// Routes in configuration order
    routes: Vec<Arc<Route>>,
    /// Path → index into `routes`
    by_path: HashMap<String, usize>,
}

impl RouteTable {
    /// Build a route table from configuration. Duplicate paths are rejected.
    pub fn from_config(configs: &[RouteConfig]) -> Result<Self> {
        let mut routes = Vec::with_capacity(configs.len());
        let mut by_path = HashMap::with_capacity(configs.len());

        for config in configs {
            if by_path.contains_key(&config.path) {
                return Err(WorkerError::Config(format!(
                    "Duplicate route path '{}'",
                    config.path
                )));
            }
            by_path.insert(config.path.clone(), routes.len());
            routes.push(Arc::new(Route::from_config(config)?));
        }

        Ok(Self { routes, by_path })
    }

    /// Look up a route by exact path
    pub fn get(&self, path: &str) -> Option<&Arc<Route>> {
        self.by_path.get(path).map(|&i| &self.routes[i])
    }

    /// All routes in configuration order
    pub fn routes(&self) -> &[Arc<Route>] {
        &self.routes
    }

    /// Number of routes
    pub fn len(&self) -> usize {
        self.routes.len()
    }

    /// Whether the table is empty
    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }

    /// Metadata for every route (for the status API)
    pub fn routes_info(&self) -> Vec<RouteInfo> {
        self.routes.iter().map(|r| r.info()).collect()
    }

    /// Swap a route's estimator before the table is shared
    #[cfg(test)]
    pub(crate) fn set_estimator(&mut self, path: &str, estimator: Arc<dyn Estimator>) {
        if let Some(&i) = self.by_path.get(path) {
            if let Some(route) = Arc::get_mut(&mut self.routes[i]) {
                route.estimator = estimator;
            }
        }
    }
}
