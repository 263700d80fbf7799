//! Worker — orchestrates all components
//!
//! Builds the route table, admission queue, dispatcher and observers from a
//! validated [`WorkerConfig`], starts the listener and background tasks, and
//! drains in-flight work on shutdown.

use crate::admission::AdmissionQueue;
use crate::benchmark::BenchmarkRunner;
use crate::config::WorkerConfig;
use crate::entrypoint::{self, WorkerState};
use crate::error::Result;
use crate::health::HealthTracker;
use crate::monitor::{self, LogMonitor};
use crate::observability::{AccessLog, MetricsReporter, MetricsSnapshot, ReportPusher};
use crate::proxy::Dispatcher;
use crate::router::RouteTable;
use crate::status::StatusApi;
use crate::HealthState;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// How often the Degraded → Ready recovery timer is checked
const HEALTH_TICK: Duration = Duration::from_secs(1);
const LOG_EVENT_BUFFER: usize = 256;

/// The admission-control worker
pub struct Worker {
    config: WorkerConfig,
    health: Arc<HealthTracker>,
    reporter: Arc<MetricsReporter>,
    queue: Arc<AdmissionQueue>,
    dispatcher: Arc<Dispatcher>,
    benchmark: Arc<BenchmarkRunner>,
    shutdown: AtomicBool,
    local_addr: Mutex<Option<SocketAddr>>,
    listener: Mutex<Option<JoinHandle<()>>>,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl Worker {
    /// Build every component. Fails only on invalid configuration.
    pub fn new(config: WorkerConfig) -> Result<Self> {
        config.validate()?;

        let health = Arc::new(HealthTracker::new(Duration::from_secs(
            config.health.recovery_secs,
        )));
        let reporter = Arc::new(MetricsReporter::new(
            health.clone(),
            Duration::from_secs(config.metrics.window_secs),
        ));
        let routes = Arc::new(RouteTable::from_config(&config.routes)?);
        tracing::info!(routes = routes.len(), "Route table compiled");

        let queue = Arc::new(AdmissionQueue::new(routes, reporter.clone()));
        let dispatcher = Arc::new(Dispatcher::new(
            &config.upstream,
            reporter.clone(),
            Arc::new(AccessLog::new()),
        )?);
        let benchmark = Arc::new(BenchmarkRunner::new(
            queue.clone(),
            dispatcher.clone(),
            reporter.clone(),
        ));

        Ok(Self {
            config,
            health,
            reporter,
            queue,
            dispatcher,
            benchmark,
            shutdown: AtomicBool::new(false),
            local_addr: Mutex::new(None),
            listener: Mutex::new(None),
            handles: Mutex::new(Vec::new()),
        })
    }

    /// Bind the listener and start the background tasks
    pub async fn start(&self) -> Result<()> {
        let listener = entrypoint::bind(&self.config.listen).await?;
        let addr = listener.local_addr()?;
        *self.local_addr.lock().unwrap() = Some(addr);

        let state = Arc::new(WorkerState {
            queue: self.queue.clone(),
            dispatcher: self.dispatcher.clone(),
            status: StatusApi::new(
                self.health.clone(),
                self.reporter.clone(),
                self.queue.routes().clone(),
                Some(self.benchmark.clone()),
            ),
        });
        *self.listener.lock().unwrap() = Some(entrypoint::start_listener(listener, state));

        let mut handles = Vec::new();

        let (tx, rx) = mpsc::channel(LOG_EVENT_BUFFER);
        let log_monitor = LogMonitor::new(&self.config.log, &self.config.log_actions);
        handles.push(tokio::spawn(log_monitor.run(tx)));
        handles.push(tokio::spawn(monitor::run_event_consumer(
            rx,
            self.health.clone(),
            self.reporter.clone(),
            HEALTH_TICK,
        )));

        if self.config.benchmark.enabled {
            let interval = self
                .config
                .benchmark
                .interval_secs
                .map(Duration::from_secs);
            handles.push(tokio::spawn(
                self.benchmark
                    .clone()
                    .run_scheduled(self.health.clone(), interval),
            ));
        } else {
            tracing::info!("Benchmarking disabled");
        }

        if let Some(url) = &self.config.metrics.report_url {
            let pusher = ReportPusher::new(
                self.reporter.clone(),
                url.clone(),
                Duration::from_secs(self.config.metrics.report_interval_secs),
            );
            handles.push(tokio::spawn(async move { pusher.run().await }));
        }

        self.handles.lock().unwrap().extend(handles);

        tracing::info!(
            address = %addr,
            upstream = self.dispatcher.base_url(),
            log = self.config.log.path,
            "Worker started"
        );
        Ok(())
    }

    /// Stop accepting, let in-flight requests finish, then stop everything
    pub async fn shutdown(&self) {
        if self.shutdown.swap(true, Ordering::SeqCst) {
            return;
        }
        tracing::info!("Worker shutting down");

        if let Some(listener) = self.listener.lock().unwrap().take() {
            listener.abort();
        }
        self.health.stop();

        let timeout = Duration::from_secs(self.config.shutdown_timeout_secs);
        let drained = tokio::time::timeout(timeout, async {
            while self.reporter.snapshot().in_flight > 0 {
                tokio::time::sleep(Duration::from_millis(50)).await;
            }
        })
        .await;
        if drained.is_err() {
            tracing::warn!(
                in_flight = self.reporter.snapshot().in_flight,
                "Shutdown timeout reached with requests still in flight"
            );
        }

        let handles: Vec<_> = self.handles.lock().unwrap().drain(..).collect();
        for handle in handles {
            handle.abort();
        }
        tracing::info!("Worker stopped");
    }

    /// Block until SIGINT or SIGTERM, then shut down
    pub async fn wait_for_shutdown(&self) {
        wait_for_signal().await;
        self.shutdown().await;
    }

    /// Address the listener is bound to, once started
    pub fn local_addr(&self) -> Option<SocketAddr> {
        *self.local_addr.lock().unwrap()
    }

    pub fn health(&self) -> HealthState {
        self.health.state()
    }

    pub fn metrics(&self) -> MetricsSnapshot {
        self.reporter.snapshot()
    }

    pub fn config(&self) -> &WorkerConfig {
        &self.config
    }

    pub fn benchmark(&self) -> &Arc<BenchmarkRunner> {
        &self.benchmark
    }

    /// Check if shutdown has been requested
    pub fn is_shutdown(&self) -> bool {
        self.shutdown.load(Ordering::Relaxed)
    }
}

#[cfg(unix)]
async fn wait_for_signal() {
    use tokio::signal::unix::{signal, SignalKind};
    let mut term = match signal(SignalKind::terminate()) {
        Ok(term) => term,
        Err(e) => {
            tracing::warn!(error = %e, "Failed to install SIGTERM handler");
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::error!(error = %e, "Failed to listen for Ctrl+C");
            }
            return;
        }
    };
    tokio::select! {
        result = tokio::signal::ctrl_c() => {
            if let Err(e) = result {
                tracing::error!(error = %e, "Failed to listen for Ctrl+C");
            }
        }
        _ = term.recv() => {}
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "Failed to listen for Ctrl+C");
    }
}
