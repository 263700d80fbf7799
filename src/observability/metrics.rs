//! Worker metrics — per-route admission counters, rolling load and capacity
//!
//! Everything an external autoscaler needs lives here: the cost admitted over
//! a rolling window (current load), the latest benchmark estimate per route
//! (max perf), queue depth, health, and what the model-server log has said.
//! Snapshots only take atomics and short critical sections.

use crate::benchmark::CapacityEstimate;
use crate::health::HealthTracker;
use crate::monitor::{LogEvent, LogEventKind};
use crate::HealthState;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};

/// Warnings kept for the snapshot
const MAX_WARNINGS: usize = 32;

/// How a dispatched request ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompletionOutcome {
    Success,
    /// Upstream answered with a non-2xx status
    UpstreamStatus(u16),
    UpstreamUnavailable,
    UpstreamTimeout,
    /// The client went away before the body finished
    Aborted,
}

impl CompletionOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success)
    }

    /// Stable label used in logs
    pub fn label(&self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::UpstreamStatus(_) => "upstream_status",
            Self::UpstreamUnavailable => "upstream_unavailable",
            Self::UpstreamTimeout => "upstream_timeout",
            Self::Aborted => "aborted",
        }
    }
}

/// Emitted exactly once per dispatch
#[derive(Debug, Clone)]
pub struct CompletionEvent {
    pub route: String,
    /// Time between enqueue and admission
    pub wait: Duration,
    /// Time between admission and completion
    pub service: Duration,
    pub cost: f64,
    pub outcome: CompletionOutcome,
    pub synthetic: bool,
}

/// Per-route counters
#[derive(Default)]
struct RouteCounters {
    waiting: AtomicI64,
    in_flight: AtomicI64,
    admitted: AtomicU64,
    rejected_timeout: AtomicU64,
    completed: AtomicU64,
    failed: AtomicU64,
    synthetic: AtomicU64,
    estimator_faults: AtomicU64,
    wait_us_total: AtomicU64,
    service_us_total: AtomicU64,
    load: Mutex<RouteLoad>,
}

#[derive(Default)]
struct RouteLoad {
    cost_total: f64,
    /// (admitted at, cost) inside the rolling window
    window: VecDeque<(Instant, f64)>,
}

impl RouteLoad {
    fn prune(&mut self, now: Instant, window: Duration) {
        while let Some((at, _)) = self.window.front() {
            if now.saturating_duration_since(*at) > window {
                self.window.pop_front();
            } else {
                break;
            }
        }
    }
}

/// Per-route figures in a snapshot
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct RouteStats {
    pub waiting: i64,
    pub in_flight: i64,
    pub admitted: u64,
    pub rejected_timeout: u64,
    pub completed: u64,
    pub failed: u64,
    /// Benchmark requests (not included in admitted or load)
    pub synthetic: u64,
    pub estimator_faults: u64,
    pub cost_total: f64,
    pub window_requests: u64,
    pub window_cost: f64,
    pub mean_wait_ms: f64,
    pub mean_service_ms: f64,
}

/// A warning worth surfacing to operators
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Warning {
    /// RFC 3339
    pub at: String,
    pub source: String,
    pub message: String,
}

/// Point-in-time view of all metrics
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    /// RFC 3339
    pub timestamp: String,
    pub uptime_secs: u64,
    pub health: HealthState,
    /// Whether the model server has reported itself loaded
    pub loaded: bool,
    /// Most recent error line from the model server log
    pub error_message: Option<String>,
    pub window_secs: u64,
    /// Admitted cost per second over the window
    pub current_load: f64,
    /// Sum of fresh benchmark cost-per-second estimates
    pub max_perf: f64,
    pub queue_depth: i64,
    pub in_flight: i64,
    pub unroutable: u64,
    pub routes: BTreeMap<String, RouteStats>,
    pub capacity: BTreeMap<String, CapacityEstimate>,
    pub log_events: BTreeMap<String, u64>,
    pub warnings: Vec<Warning>,
}

/// Aggregates admission, dispatch, benchmark and log signals
pub struct MetricsReporter {
    started: Instant,
    window: Duration,
    health: Arc<HealthTracker>,
    routes: RwLock<HashMap<String, Arc<RouteCounters>>>,
    unroutable: AtomicU64,
    capacity: RwLock<HashMap<String, CapacityEstimate>>,
    log_events: RwLock<HashMap<LogEventKind, u64>>,
    warnings: Mutex<VecDeque<Warning>>,
}

impl MetricsReporter {
    pub fn new(health: Arc<HealthTracker>, window: Duration) -> Self {
        Self {
            started: Instant::now(),
            window,
            health,
            routes: RwLock::new(HashMap::new()),
            unroutable: AtomicU64::new(0),
            capacity: RwLock::new(HashMap::new()),
            log_events: RwLock::new(HashMap::new()),
            warnings: Mutex::new(VecDeque::new()),
        }
    }

    /// Make a route appear in snapshots before its first request
    pub fn register_route(&self, route: &str) {
        self.counters(route);
    }

    fn counters(&self, route: &str) -> Arc<RouteCounters> {
        if let Some(c) = self.routes.read().unwrap().get(route) {
            return c.clone();
        }
        let mut map = self.routes.write().unwrap();
        map.entry(route.to_string()).or_default().clone()
    }

    /// A request started waiting for a serialized route
    pub fn record_enqueued(&self, route: &str) {
        self.counters(route).waiting.fetch_add(1, Ordering::Relaxed);
    }

    /// A waiter left the queue (admitted or rejected)
    pub fn record_dequeued(&self, route: &str) {
        self.counters(route).waiting.fetch_sub(1, Ordering::Relaxed);
    }

    /// A request was admitted with the given cost
    pub fn record_admitted(&self, route: &str, cost: f64, synthetic: bool) {
        self.record_admitted_at(route, cost, synthetic, Instant::now());
    }

    fn record_admitted_at(&self, route: &str, cost: f64, synthetic: bool, now: Instant) {
        let c = self.counters(route);
        c.in_flight.fetch_add(1, Ordering::Relaxed);
        if synthetic {
            c.synthetic.fetch_add(1, Ordering::Relaxed);
            return;
        }
        c.admitted.fetch_add(1, Ordering::Relaxed);
        let mut load = c.load.lock().unwrap();
        load.cost_total += cost;
        load.window.push_back((now, cost));
        load.prune(now, self.window);
    }

    /// An admitted ticket was released
    pub fn record_released(&self, route: &str) {
        self.counters(route).in_flight.fetch_sub(1, Ordering::Relaxed);
    }

    /// A waiter hit its deadline
    pub fn record_rejected(&self, route: &str) {
        self.counters(route)
            .rejected_timeout
            .fetch_add(1, Ordering::Relaxed);
    }

    /// A request matched no route
    pub fn record_unroutable(&self) {
        self.unroutable.fetch_add(1, Ordering::Relaxed);
    }

    /// An estimator panicked or produced an invalid cost
    pub fn record_estimator_fault(&self, route: &str) {
        self.counters(route)
            .estimator_faults
            .fetch_add(1, Ordering::Relaxed);
    }

    /// A dispatch finished
    pub fn record_completion(&self, event: &CompletionEvent) {
        let c = self.counters(&event.route);
        if event.outcome.is_success() {
            c.completed.fetch_add(1, Ordering::Relaxed);
        } else {
            c.failed.fetch_add(1, Ordering::Relaxed);
        }
        c.wait_us_total
            .fetch_add(event.wait.as_micros() as u64, Ordering::Relaxed);
        c.service_us_total
            .fetch_add(event.service.as_micros() as u64, Ordering::Relaxed);
    }

    /// Replace a route's capacity estimate
    pub fn record_capacity(&self, estimate: CapacityEstimate) {
        let mut map = self.capacity.write().unwrap();
        map.insert(estimate.route.clone(), estimate);
    }

    /// Keep a route's estimate but flag it as no longer current
    pub fn mark_capacity_stale(&self, route: &str) {
        if let Some(est) = self.capacity.write().unwrap().get_mut(route) {
            est.stale = true;
        }
    }

    /// Latest estimate for a route
    pub fn capacity(&self, route: &str) -> Option<CapacityEstimate> {
        self.capacity.read().unwrap().get(route).cloned()
    }

    /// Record a warning; the oldest are dropped past a fixed bound
    pub fn record_warning(&self, source: &str, message: impl Into<String>) {
        let mut warnings = self.warnings.lock().unwrap();
        if warnings.len() == MAX_WARNINGS {
            warnings.pop_front();
        }
        warnings.push_back(Warning {
            at: chrono::Utc::now().to_rfc3339(),
            source: source.to_string(),
            message: message.into(),
        });
    }

    /// Count a classified log event
    pub fn record_log_event(&self, event: &LogEvent) {
        let mut map = self.log_events.write().unwrap();
        *map.entry(event.kind).or_insert(0) += 1;
    }

    /// Take a snapshot of all metrics
    pub fn snapshot(&self) -> MetricsSnapshot {
        self.snapshot_at(Instant::now())
    }

    fn snapshot_at(&self, now: Instant) -> MetricsSnapshot {
        let health = self.health.snapshot();
        let window_secs = self.window.as_secs_f64().max(1e-9);

        let counters: Vec<(String, Arc<RouteCounters>)> = self
            .routes
            .read()
            .unwrap()
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();

        let mut routes = BTreeMap::new();
        let mut window_cost_total = 0.0;
        let mut queue_depth = 0;
        let mut in_flight = 0;
        for (path, c) in counters {
            let (cost_total, window_requests, window_cost) = {
                let mut load = c.load.lock().unwrap();
                load.prune(now, self.window);
                let cost: f64 = load.window.iter().map(|(_, cost)| cost).sum();
                (load.cost_total, load.window.len() as u64, cost)
            };
            let completed = c.completed.load(Ordering::Relaxed);
            let failed = c.failed.load(Ordering::Relaxed);
            let finished = completed + failed;
            let mean_ms = |total_us: u64| {
                if finished == 0 {
                    0.0
                } else {
                    total_us as f64 / finished as f64 / 1000.0
                }
            };
            let stats = RouteStats {
                waiting: c.waiting.load(Ordering::Relaxed),
                in_flight: c.in_flight.load(Ordering::Relaxed),
                admitted: c.admitted.load(Ordering::Relaxed),
                rejected_timeout: c.rejected_timeout.load(Ordering::Relaxed),
                completed,
                failed,
                synthetic: c.synthetic.load(Ordering::Relaxed),
                estimator_faults: c.estimator_faults.load(Ordering::Relaxed),
                cost_total,
                window_requests,
                window_cost,
                mean_wait_ms: mean_ms(c.wait_us_total.load(Ordering::Relaxed)),
                mean_service_ms: mean_ms(c.service_us_total.load(Ordering::Relaxed)),
            };
            window_cost_total += window_cost;
            queue_depth += stats.waiting;
            in_flight += stats.in_flight;
            routes.insert(path, stats);
        }

        let capacity: BTreeMap<String, CapacityEstimate> = self
            .capacity
            .read()
            .unwrap()
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        let max_perf = capacity
            .values()
            .filter(|e| !e.stale)
            .map(|e| e.cost_per_sec)
            .sum();

        let log_events = self
            .log_events
            .read()
            .unwrap()
            .iter()
            .map(|(k, v)| (k.to_string(), *v))
            .collect();

        MetricsSnapshot {
            timestamp: chrono::Utc::now().to_rfc3339(),
            uptime_secs: now.saturating_duration_since(self.started).as_secs(),
            health: health.state,
            loaded: health.loaded,
            error_message: health.last_error,
            window_secs: self.window.as_secs(),
            current_load: window_cost_total / window_secs,
            max_perf,
            queue_depth,
            in_flight,
            unroutable: self.unroutable.load(Ordering::Relaxed),
            routes,
            capacity,
            log_events,
            warnings: self.warnings.lock().unwrap().iter().cloned().collect(),
        }
    }

    /// Render metrics in Prometheus text exposition format
    pub fn render_prometheus(&self) -> String {
        let snap = self.snapshot();
        let mut output = String::new();

        output.push_str("# HELP worker_health_state Current health state (1 = active)\n");
        output.push_str("# TYPE worker_health_state gauge\n");
        for state in [
            HealthState::Starting,
            HealthState::Ready,
            HealthState::Degraded,
            HealthState::Stopped,
        ] {
            output.push_str(&format!(
                "worker_health_state{{state=\"{}\"}} {}\n",
                state,
                u8::from(snap.health == state)
            ));
        }

        output.push_str("# HELP worker_current_load Admitted cost per second over the window\n");
        output.push_str("# TYPE worker_current_load gauge\n");
        output.push_str(&format!("worker_current_load {}\n", snap.current_load));

        output.push_str("# HELP worker_max_perf Benchmarked cost per second\n");
        output.push_str("# TYPE worker_max_perf gauge\n");
        output.push_str(&format!("worker_max_perf {}\n", snap.max_perf));

        output.push_str("# HELP worker_unroutable_total Requests matching no route\n");
        output.push_str("# TYPE worker_unroutable_total counter\n");
        output.push_str(&format!("worker_unroutable_total {}\n", snap.unroutable));

        let gauges: [(&str, &str, fn(&RouteStats) -> String); 2] = [
            ("worker_queue_depth", "Requests waiting for admission", |s| {
                s.waiting.to_string()
            }),
            ("worker_in_flight", "Admitted requests not yet released", |s| {
                s.in_flight.to_string()
            }),
        ];
        for (name, help, value) in gauges {
            output.push_str(&format!("# HELP {} {}\n# TYPE {} gauge\n", name, help, name));
            for (route, stats) in &snap.routes {
                output.push_str(&format!("{}{{route=\"{}\"}} {}\n", name, route, value(stats)));
            }
        }

        let counters: [(&str, &str, fn(&RouteStats) -> String); 7] = [
            ("worker_admitted_total", "Admitted requests", |s| {
                s.admitted.to_string()
            }),
            ("worker_rejected_total", "Requests rejected on queue timeout", |s| {
                s.rejected_timeout.to_string()
            }),
            ("worker_completed_total", "Successful dispatches", |s| {
                s.completed.to_string()
            }),
            ("worker_failed_total", "Failed dispatches", |s| s.failed.to_string()),
            ("worker_synthetic_total", "Benchmark requests", |s| {
                s.synthetic.to_string()
            }),
            ("worker_estimator_faults_total", "Estimator faults", |s| {
                s.estimator_faults.to_string()
            }),
            ("worker_cost_total", "Cumulative admitted cost", |s| {
                s.cost_total.to_string()
            }),
        ];
        for (name, help, value) in counters {
            output.push_str(&format!("# HELP {} {}\n# TYPE {} counter\n", name, help, name));
            for (route, stats) in &snap.routes {
                output.push_str(&format!("{}{{route=\"{}\"}} {}\n", name, route, value(stats)));
            }
        }

        if !snap.capacity.is_empty() {
            output.push_str(
                "# HELP worker_capacity_mean_latency_seconds Benchmarked mean latency\n",
            );
            output.push_str("# TYPE worker_capacity_mean_latency_seconds gauge\n");
            for (route, est) in &snap.capacity {
                output.push_str(&format!(
                    "worker_capacity_mean_latency_seconds{{route=\"{}\"}} {}\n",
                    route, est.mean_latency_secs
                ));
            }
            output.push_str(
                "# HELP worker_capacity_throughput Benchmarked requests per second\n",
            );
            output.push_str("# TYPE worker_capacity_throughput gauge\n");
            for (route, est) in &snap.capacity {
                output.push_str(&format!(
                    "worker_capacity_throughput{{route=\"{}\"}} {}\n",
                    route, est.throughput_per_sec
                ));
            }
        }

        if !snap.log_events.is_empty() {
            output.push_str("# HELP worker_log_events_total Classified model server log lines\n");
            output.push_str("# TYPE worker_log_events_total counter\n");
            for (kind, count) in &snap.log_events {
                output.push_str(&format!(
                    "worker_log_events_total{{kind=\"{}\"}} {}\n",
                    kind, count
                ));
            }
        }

        output
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn reporter() -> MetricsReporter {
        let health = Arc::new(HealthTracker::new(Duration::from_secs(60)));
        MetricsReporter::new(health, Duration::from_secs(10))
    }

    fn estimate(route: &str, cost_per_sec: f64) -> CapacityEstimate {
        CapacityEstimate {
            route: route.to_string(),
            mean_latency_secs: 0.5,
            throughput_per_sec: 2.0,
            cost_per_sec,
            successful_runs: 4,
            total_runs: 4,
            measured_at: chrono::Utc::now().to_rfc3339(),
            stale: false,
        }
    }

    #[test]
    fn test_registered_route_in_snapshot() {
        let m = reporter();
        m.register_route("/a");
        let snap = m.snapshot();
        assert_eq!(snap.routes["/a"], RouteStats::default());
        assert_eq!(snap.health, HealthState::Starting);
    }

    #[test]
    fn test_admission_and_completion() {
        let m = reporter();
        m.record_admitted("/a", 10.0, false);
        m.record_admitted("/a", 5.0, false);
        m.record_completion(&CompletionEvent {
            route: "/a".into(),
            wait: Duration::from_millis(10),
            service: Duration::from_millis(100),
            cost: 10.0,
            outcome: CompletionOutcome::Success,
            synthetic: false,
        });
        m.record_completion(&CompletionEvent {
            route: "/a".into(),
            wait: Duration::from_millis(30),
            service: Duration::from_millis(300),
            cost: 5.0,
            outcome: CompletionOutcome::UpstreamStatus(500),
            synthetic: false,
        });
        m.record_released("/a");

        let snap = m.snapshot();
        let a = &snap.routes["/a"];
        assert_eq!(a.admitted, 2);
        assert_eq!(a.completed, 1);
        assert_eq!(a.failed, 1);
        assert_eq!(a.in_flight, 1);
        assert_eq!(a.cost_total, 15.0);
        assert_eq!(a.window_requests, 2);
        assert!((a.mean_wait_ms - 20.0).abs() < 1e-9);
        assert!((a.mean_service_ms - 200.0).abs() < 1e-9);
        assert!((snap.current_load - 1.5).abs() < 1e-9);
        assert_eq!(snap.in_flight, 1);
    }

    #[test]
    fn test_synthetic_not_counted_as_load() {
        let m = reporter();
        m.record_admitted("/a", 10.0, true);
        let snap = m.snapshot();
        assert_eq!(snap.routes["/a"].synthetic, 1);
        assert_eq!(snap.routes["/a"].admitted, 0);
        assert_eq!(snap.current_load, 0.0);
    }

    #[test]
    fn test_window_expiry() {
        let m = reporter();
        let start = Instant::now();
        m.record_admitted_at("/a", 4.0, false, start);
        let snap = m.snapshot_at(start + Duration::from_secs(5));
        assert_eq!(snap.routes["/a"].window_requests, 1);
        let snap = m.snapshot_at(start + Duration::from_secs(11));
        assert_eq!(snap.routes["/a"].window_requests, 0);
        assert_eq!(snap.routes["/a"].cost_total, 4.0);
        assert_eq!(snap.current_load, 0.0);
    }

    #[test]
    fn test_queue_depth() {
        let m = reporter();
        m.record_enqueued("/a");
        m.record_enqueued("/a");
        m.record_enqueued("/b");
        m.record_dequeued("/a");
        m.record_rejected("/a");
        let snap = m.snapshot();
        assert_eq!(snap.queue_depth, 2);
        assert_eq!(snap.routes["/a"].rejected_timeout, 1);
    }

    #[test]
    fn test_max_perf_ignores_stale() {
        let m = reporter();
        m.record_capacity(estimate("/a", 20.0));
        m.record_capacity(estimate("/b", 5.0));
        assert_eq!(m.snapshot().max_perf, 25.0);

        m.mark_capacity_stale("/b");
        let snap = m.snapshot();
        assert_eq!(snap.max_perf, 20.0);
        assert!(snap.capacity["/b"].stale);
        assert!(m.capacity("/b").is_some());
    }

    #[test]
    fn test_warnings_bounded() {
        let m = reporter();
        for i in 0..(MAX_WARNINGS + 5) {
            m.record_warning("benchmark", format!("w{}", i));
        }
        let snap = m.snapshot();
        assert_eq!(snap.warnings.len(), MAX_WARNINGS);
        assert_eq!(snap.warnings[0].message, "w5");
    }

    #[test]
    fn test_log_events_and_health_fields() {
        let health = Arc::new(HealthTracker::new(Duration::from_secs(60)));
        let m = MetricsReporter::new(health.clone(), Duration::from_secs(60));
        let event = LogEvent {
            kind: LogEventKind::Error,
            line: "CUDA out of memory".into(),
            pattern: "CUDA out of memory".into(),
        };
        m.record_log_event(&event);
        health.apply(&event);

        let snap = m.snapshot();
        assert_eq!(snap.log_events["error"], 1);
        assert_eq!(snap.health, HealthState::Degraded);
        assert_eq!(snap.error_message.as_deref(), Some("CUDA out of memory"));
        assert!(!snap.loaded);
    }

    #[test]
    fn test_snapshot_serialization() {
        let m = reporter();
        m.record_admitted("/a", 1.0, false);
        m.record_capacity(estimate("/a", 3.0));
        let json = serde_json::to_string(&m.snapshot()).unwrap();
        let parsed: MetricsSnapshot = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.routes["/a"].admitted, 1);
        assert_eq!(parsed.capacity["/a"].cost_per_sec, 3.0);
    }

    #[test]
    fn test_prometheus_format() {
        let m = reporter();
        m.record_admitted("/v1/audio/transcriptions", 10.0, false);
        m.record_unroutable();
        m.record_capacity(estimate("/v1/audio/transcriptions", 20.0));

        let output = m.render_prometheus();
        assert!(output.contains("worker_health_state{state=\"starting\"} 1"));
        assert!(output.contains("worker_health_state{state=\"ready\"} 0"));
        assert!(output.contains("worker_admitted_total{route=\"/v1/audio/transcriptions\"} 1"));
        assert!(output.contains("worker_unroutable_total 1"));
        assert!(output.contains("worker_max_perf 20"));
        assert!(output.contains("# TYPE worker_queue_depth gauge"));
        assert!(output.contains("worker_capacity_throughput{route=\"/v1/audio/transcriptions\"} 2"));
    }
}
