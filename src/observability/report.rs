//! Report pusher — periodic POST of the metrics snapshot to an autoscaler

use super::metrics::MetricsReporter;
use crate::error::{Result, WorkerError};
use std::sync::Arc;
use std::time::Duration;

/// Pushes snapshots to a fixed URL on an interval
pub struct ReportPusher {
    reporter: Arc<MetricsReporter>,
    url: String,
    interval: Duration,
    client: reqwest::Client,
}

impl ReportPusher {
    pub fn new(reporter: Arc<MetricsReporter>, url: String, interval: Duration) -> Self {
        let client = reqwest::Client::builder()
            .timeout(interval.max(Duration::from_secs(1)))
            .build()
            .unwrap_or_default();
        Self {
            reporter,
            url,
            interval,
            client,
        }
    }

    /// Send one snapshot
    pub async fn push_once(&self) -> Result<()> {
        let snapshot = self.reporter.snapshot();
        let resp = self.client.post(&self.url).json(&snapshot).send().await?;
        if !resp.status().is_success() {
            return Err(WorkerError::Other(format!(
                "Report endpoint returned {}",
                resp.status()
            )));
        }
        Ok(())
    }

    /// Run the push loop (call from a spawned task)
    pub async fn run(&self) {
        tracing::info!(url = self.url, interval_secs = self.interval.as_secs(), "Report pusher started");
        let mut failing = false;
        loop {
            tokio::time::sleep(self.interval).await;
            match self.push_once().await {
                Ok(()) => {
                    if failing {
                        tracing::info!(url = self.url, "Report push recovered");
                    }
                    failing = false;
                }
                Err(e) => {
                    // Log the first failure of a streak only
                    if !failing {
                        tracing::warn!(url = self.url, error = %e, "Report push failed");
                    }
                    failing = true;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::health::HealthTracker;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    fn reporter() -> Arc<MetricsReporter> {
        let health = Arc::new(HealthTracker::new(Duration::from_secs(60)));
        Arc::new(MetricsReporter::new(health, Duration::from_secs(60)))
    }

    async fn one_shot_server(status: &'static str) -> (String, tokio::task::JoinHandle<String>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let handle = tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut received = Vec::new();
            let mut buf = [0u8; 4096];
            loop {
                let n = stream.read(&mut buf).await.unwrap();
                if n == 0 {
                    break;
                }
                received.extend_from_slice(&buf[..n]);
                let text = String::from_utf8_lossy(&received);
                if let Some(end) = text.find("\r\n\r\n") {
                    let len = text[..end]
                        .lines()
                        .find_map(|l| {
                            let (k, v) = l.split_once(':')?;
                            k.eq_ignore_ascii_case("content-length")
                                .then(|| v.trim().parse::<usize>().ok())
                                .flatten()
                        })
                        .unwrap_or(0);
                    if received.len() >= end + 4 + len {
                        break;
                    }
                }
            }
            let resp = format!("HTTP/1.1 {}\r\nContent-Length: 0\r\nConnection: close\r\n\r\n", status);
            stream.write_all(resp.as_bytes()).await.unwrap();
            String::from_utf8_lossy(&received).into_owned()
        });
        (format!("http://{}/report", addr), handle)
    }

    #[tokio::test]
    async fn test_push_once_posts_snapshot() {
        let (url, server) = one_shot_server("200 OK").await;
        let m = reporter();
        m.register_route("/v1/audio/transcriptions");
        let pusher = ReportPusher::new(m, url, Duration::from_secs(5));

        pusher.push_once().await.unwrap();
        let request = server.await.unwrap();
        assert!(request.starts_with("POST /report"));
        assert!(request.contains("\"current_load\""));
        assert!(request.contains("/v1/audio/transcriptions"));
    }

    #[tokio::test]
    async fn test_push_once_reports_status_failure() {
        let (url, server) = one_shot_server("500 Internal Server Error").await;
        let pusher = ReportPusher::new(reporter(), url, Duration::from_secs(5));
        assert!(pusher.push_once().await.is_err());
        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_push_once_unreachable() {
        let pusher = ReportPusher::new(
            reporter(),
            "http://127.0.0.1:1/report".to_string(),
            Duration::from_secs(1),
        );
        assert!(pusher.push_once().await.is_err());
    }
}
