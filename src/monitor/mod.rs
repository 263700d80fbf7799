//! Log monitor — follows the model server's log and turns lines into health events
//!
//! The monitor never talks to the model server directly. A poll loop reads new
//! lines through [`tail::LogTailer`], classifies them, and sends the matches
//! over a channel; a consumer applies them to the health tracker and metrics.

pub mod classifier;
mod tail;

pub use classifier::LogClassifier;
pub use tail::LogTailer;

use crate::config::{LogActionConfig, LogConfig};
use crate::health::HealthTracker;
use crate::observability::metrics::MetricsReporter;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;

/// Category of a matched log line
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogEventKind {
    /// Model finished loading
    Load,
    /// Model server fault
    Error,
    /// Informational milestone
    Info,
}

impl std::fmt::Display for LogEventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Load => write!(f, "load"),
            Self::Error => write!(f, "error"),
            Self::Info => write!(f, "info"),
        }
    }
}

/// A log line that matched a configured pattern
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogEvent {
    pub kind: LogEventKind,
    /// The full line
    pub line: String,
    /// The pattern that matched
    pub pattern: String,
}

/// Polls the model-server log and emits classified events
pub struct LogMonitor {
    tailer: LogTailer,
    classifier: LogClassifier,
    poll_interval: Duration,
}

impl LogMonitor {
    pub fn new(log: &LogConfig, actions: &LogActionConfig) -> Self {
        Self {
            tailer: LogTailer::new(&log.path, log.read_existing),
            classifier: LogClassifier::new(actions),
            poll_interval: Duration::from_millis(log.poll_interval_ms.max(1)),
        }
    }

    /// Read whatever is new and classify it. Read errors are logged and yield nothing.
    pub async fn poll_once(&mut self) -> Vec<LogEvent> {
        match self.tailer.poll().await {
            Ok(lines) => lines
                .iter()
                .filter_map(|line| self.classifier.classify(line))
                .collect(),
            Err(e) => {
                tracing::warn!(
                    path = %self.tailer.path().display(),
                    error = %e,
                    "Failed to read model server log, retrying"
                );
                Vec::new()
            }
        }
    }

    /// Poll until the receiving side goes away
    pub async fn run(mut self, events: mpsc::Sender<LogEvent>) {
        tracing::info!(
            path = %self.tailer.path().display(),
            patterns = self.classifier.len(),
            "Log monitor started"
        );
        let mut ticker = tokio::time::interval(self.poll_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            for event in self.poll_once().await {
                if events.send(event).await.is_err() {
                    tracing::debug!("Log event consumer gone, stopping monitor");
                    return;
                }
            }
        }
    }
}

/// Apply log events to health and metrics, and drive the recovery timer
pub async fn run_event_consumer(
    mut events: mpsc::Receiver<LogEvent>,
    health: Arc<HealthTracker>,
    reporter: Arc<MetricsReporter>,
    tick: Duration,
) {
    let mut ticker = tokio::time::interval(tick);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            event = events.recv() => {
                let Some(event) = event else { break };
                match event.kind {
                    LogEventKind::Load => tracing::info!(line = %event.line, "Model server loaded"),
                    LogEventKind::Error => tracing::warn!(line = %event.line, "Model server error"),
                    LogEventKind::Info => tracing::info!(line = %event.line, "Model server milestone"),
                }
                reporter.record_log_event(&event);
                if let Some(t) = health.apply(&event) {
                    tracing::info!(from = %t.from, to = %t.to, "Health state changed");
                }
            }
            _ = ticker.tick() => {
                if let Some(t) = health.tick_at(Instant::now()) {
                    tracing::info!(from = %t.from, to = %t.to, "Health state recovered");
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::HealthState;
    use std::io::Write;

    fn log_config(path: &std::path::Path) -> LogConfig {
        LogConfig {
            path: path.display().to_string(),
            poll_interval_ms: 10,
            read_existing: true,
        }
    }

    #[test]
    fn test_kind_display_and_serde() {
        assert_eq!(LogEventKind::Load.to_string(), "load");
        assert_eq!(
            serde_json::to_string(&LogEventKind::Error).unwrap(),
            "\"error\""
        );
    }

    #[tokio::test]
    async fn test_poll_once_classifies() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("server.log");
        std::fs::write(
            &path,
            "INFO: Started server process\nWarming up GPU\nINFO: Application startup complete.\n",
        )
        .unwrap();

        let mut monitor = LogMonitor::new(&log_config(&path), &LogActionConfig::default());
        let events = monitor.poll_once().await;
        let kinds: Vec<_> = events.iter().map(|e| e.kind).collect();
        assert_eq!(kinds, vec![LogEventKind::Info, LogEventKind::Load]);
    }

    #[tokio::test]
    async fn test_monitor_drives_health() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("server.log");

        let health = Arc::new(HealthTracker::new(Duration::from_secs(60)));
        let reporter = Arc::new(MetricsReporter::new(health.clone(), Duration::from_secs(60)));
        let (tx, rx) = mpsc::channel(16);

        let monitor = LogMonitor::new(&log_config(&path), &LogActionConfig::default());
        let mon = tokio::spawn(monitor.run(tx));
        let consumer = tokio::spawn(run_event_consumer(
            rx,
            health.clone(),
            reporter.clone(),
            Duration::from_millis(10),
        ));

        // File does not exist yet; the monitor keeps polling
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(health.state(), HealthState::Starting);

        let mut f = std::fs::File::create(&path).unwrap();
        writeln!(f, "INFO:     Application startup complete.").unwrap();
        f.flush().unwrap();

        let ready = tokio::time::timeout(Duration::from_secs(2), health.wait_until_ready()).await;
        assert_eq!(ready.unwrap(), true);
        assert_eq!(reporter.snapshot().log_events.get("load"), Some(&1));

        mon.abort();
        consumer.abort();
    }
}
