//! Benchmark runner — self-calibration of per-route capacity
//!
//! Once the model server is ready, each route with a benchmark protocol is
//! driven with `runs` sequential batches of `concurrency` synthetic requests.
//! Synthetic traffic goes through the same admission queue and dispatcher as
//! client traffic, one slot per request, so a serialized route is never held
//! for a whole run.

pub mod generator;

use crate::admission::AdmissionQueue;
use crate::error::{Result, WorkerError};
use crate::estimator::Payload;
use crate::health::HealthTracker;
use crate::observability::metrics::MetricsReporter;
use crate::proxy::{DispatchRequest, Dispatcher, ForwardBody};
use crate::router::{BenchmarkPlan, Route};
use generator::{SyntheticBody, SyntheticRequest};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};

/// Measured capacity of one route
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CapacityEstimate {
    pub route: String,
    /// Mean upstream latency of successful requests
    pub mean_latency_secs: f64,
    /// Successful requests per second of wall time
    pub throughput_per_sec: f64,
    /// Estimated cost served per second of wall time
    pub cost_per_sec: f64,
    pub successful_runs: u32,
    pub total_runs: u32,
    /// RFC 3339
    pub measured_at: String,
    /// Set when a later benchmark failed to replace this one
    pub stale: bool,
}

/// Per-route benchmark state
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum BenchmarkState {
    Idle,
    Running,
    Completed { estimate: CapacityEstimate },
    Failed { reason: String },
}

/// Runs benchmark protocols and publishes capacity estimates
pub struct BenchmarkRunner {
    queue: Arc<AdmissionQueue>,
    dispatcher: Arc<Dispatcher>,
    reporter: Arc<MetricsReporter>,
    states: RwLock<HashMap<String, BenchmarkState>>,
}

impl BenchmarkRunner {
    pub fn new(
        queue: Arc<AdmissionQueue>,
        dispatcher: Arc<Dispatcher>,
        reporter: Arc<MetricsReporter>,
    ) -> Self {
        let states = queue
            .routes()
            .routes()
            .iter()
            .filter(|r| r.benchmark.is_some())
            .map(|r| (r.path.clone(), BenchmarkState::Idle))
            .collect();
        Self {
            queue,
            dispatcher,
            reporter,
            states: RwLock::new(states),
        }
    }

    /// State of one route, `None` if it has no benchmark
    pub fn state(&self, route: &str) -> Option<BenchmarkState> {
        self.states.read().unwrap().get(route).cloned()
    }

    /// States of every benchmarked route
    pub fn states(&self) -> BTreeMap<String, BenchmarkState> {
        self.states
            .read()
            .unwrap()
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }

    fn set_state(&self, route: &str, state: BenchmarkState) {
        self.states.write().unwrap().insert(route.to_string(), state);
    }

    /// Benchmark every route that has a protocol, one route at a time.
    /// Returns the number of routes that produced an estimate.
    pub async fn run_all(&self) -> usize {
        let routes: Vec<Arc<Route>> = self
            .queue
            .routes()
            .routes()
            .iter()
            .filter(|r| r.benchmark.is_some())
            .cloned()
            .collect();

        let mut completed = 0;
        for route in routes {
            if self.run_route(&route).await.is_ok() {
                completed += 1;
            }
        }
        completed
    }

    /// Run one route's protocol
    pub async fn run_route(&self, route: &Arc<Route>) -> Result<CapacityEstimate> {
        let Some(plan) = route.benchmark.clone() else {
            return Err(WorkerError::Benchmark {
                route: route.path.clone(),
                reason: "no benchmark configured".to_string(),
            });
        };

        self.set_state(&route.path, BenchmarkState::Running);
        tracing::info!(
            route = route.path,
            runs = plan.runs,
            concurrency = plan.concurrency,
            "Benchmark started"
        );

        let (latencies, cost_ok, elapsed) = self.measure(route, &plan).await;
        let total = plan.runs * plan.concurrency;

        if latencies.is_empty() {
            let reason = format!("all {} synthetic requests failed", total);
            self.reporter.mark_capacity_stale(&route.path);
            self.reporter
                .record_warning("benchmark", format!("{}: {}", route.path, reason));
            tracing::warn!(route = route.path, reason, "Benchmark failed");
            self.set_state(
                &route.path,
                BenchmarkState::Failed {
                    reason: reason.clone(),
                },
            );
            return Err(WorkerError::Benchmark {
                route: route.path.clone(),
                reason,
            });
        }

        let elapsed_secs = elapsed.as_secs_f64().max(f64::EPSILON);
        let ok = latencies.len() as u32;
        let estimate = CapacityEstimate {
            route: route.path.clone(),
            mean_latency_secs: latencies.iter().map(Duration::as_secs_f64).sum::<f64>() / ok as f64,
            throughput_per_sec: ok as f64 / elapsed_secs,
            cost_per_sec: cost_ok / elapsed_secs,
            successful_runs: ok,
            total_runs: total,
            measured_at: chrono::Utc::now().to_rfc3339(),
            stale: false,
        };

        tracing::info!(
            route = route.path,
            mean_latency_secs = estimate.mean_latency_secs,
            throughput_per_sec = estimate.throughput_per_sec,
            successful = ok,
            total,
            "Benchmark completed"
        );
        self.reporter.record_capacity(estimate.clone());
        self.set_state(
            &route.path,
            BenchmarkState::Completed {
                estimate: estimate.clone(),
            },
        );
        Ok(estimate)
    }

    /// Run every batch; returns latencies and cost of successful requests and
    /// the total wall time
    async fn measure(&self, route: &Route, plan: &BenchmarkPlan) -> (Vec<Duration>, f64, Duration) {
        let started = Instant::now();
        let mut latencies = Vec::new();
        let mut cost_ok = 0.0;

        for run in 0..plan.runs {
            let batch = (0..plan.concurrency).map(|_| self.one_request(route, plan));
            for result in futures_util::future::join_all(batch).await {
                match result {
                    Ok((latency, cost)) => {
                        latencies.push(latency);
                        cost_ok += cost;
                    }
                    Err(e) => {
                        tracing::debug!(route = route.path, run, error = %e, "Synthetic request failed");
                    }
                }
            }
        }
        (latencies, cost_ok, started.elapsed())
    }

    async fn one_request(&self, route: &Route, plan: &BenchmarkPlan) -> Result<(Duration, f64)> {
        let synthetic = plan.generator.generate();
        let estimator_body = synthetic.estimator_body();
        let headers = http::HeaderMap::new();
        let payload = Payload::new(&headers, estimator_body.as_deref());

        let ticket = self.queue.submit_synthetic(&route.path, &payload).await?;
        let cost = ticket.cost();
        let started = Instant::now();
        let response = self
            .dispatcher
            .dispatch(ticket, into_dispatch_request(synthetic)?)
            .await?;
        response.into_bytes().await?;
        Ok((started.elapsed(), cost))
    }

    /// Benchmark after the first Ready, then every `interval` while Ready
    pub async fn run_scheduled(self: Arc<Self>, health: Arc<HealthTracker>, interval: Option<Duration>) {
        loop {
            if !health.wait_until_ready().await {
                return;
            }
            let completed = self.run_all().await;
            tracing::debug!(completed, "Benchmark pass finished");
            match interval {
                Some(interval) => tokio::time::sleep(interval).await,
                None => return,
            }
        }
    }
}

/// Turn a generated request into something the dispatcher can send
pub fn into_dispatch_request(synthetic: SyntheticRequest) -> Result<DispatchRequest> {
    let mut headers = http::HeaderMap::new();
    let body = match synthetic.body {
        SyntheticBody::Empty => ForwardBody::Empty,
        SyntheticBody::Json(value) => {
            headers.insert(
                http::header::CONTENT_TYPE,
                http::HeaderValue::from_static("application/json"),
            );
            ForwardBody::Full(serde_json::to_vec(&value)?.into())
        }
        SyntheticBody::Multipart { fields, file } => {
            let part = reqwest::multipart::Part::bytes(file.bytes.to_vec())
                .file_name(file.filename)
                .mime_str(&file.content_type)?;
            let form = fields
                .into_iter()
                .fold(reqwest::multipart::Form::new(), |form, (name, value)| {
                    form.text(name, value)
                })
                .part(file.field, part);
            ForwardBody::Multipart(form)
        }
    };
    Ok(DispatchRequest {
        method: synthetic.method,
        query: None,
        headers,
        body,
    })
}
