//! Proxy dispatcher — forwards admitted requests to the model server
//!
//! Every route maps to the same fixed upstream base URL. Buffered routes get
//! a whole-request timeout; streaming routes only a connect timeout, and their
//! response body is relayed chunk by chunk through [`RelayStream`].

use super::streaming::{CompletionGuard, RelayStream};
use crate::admission::AdmissionTicket;
use crate::config::UpstreamConfig;
use crate::error::{Result, WorkerError};
use crate::observability::access_log::AccessLog;
use crate::observability::metrics::{CompletionOutcome, MetricsReporter};
use bytes::Bytes;
use std::sync::Arc;
use std::time::Duration;

/// Body forwarded upstream
pub enum ForwardBody {
    Empty,
    /// Fully buffered body
    Full(Bytes),
    /// Incrementally relayed body
    Stream(reqwest::Body),
    /// Multipart form built by the worker (benchmark traffic)
    Multipart(reqwest::multipart::Form),
}

impl std::fmt::Debug for ForwardBody {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Empty => write!(f, "Empty"),
            Self::Full(b) => write!(f, "Full({} bytes)", b.len()),
            Self::Stream(_) => write!(f, "Stream"),
            Self::Multipart(_) => write!(f, "Multipart"),
        }
    }
}

/// What to send upstream, apart from the route path
#[derive(Debug)]
pub struct DispatchRequest {
    pub method: http::Method,
    /// Query string without the leading `?`
    pub query: Option<String>,
    pub headers: http::HeaderMap,
    pub body: ForwardBody,
}

impl DispatchRequest {
    pub fn new(method: http::Method, body: ForwardBody) -> Self {
        Self {
            method,
            query: None,
            headers: http::HeaderMap::new(),
            body,
        }
    }
}

/// Response body handed back to the caller
pub enum DispatchBody {
    Buffered(Bytes),
    Streaming(RelayStream),
}

/// A successful (2xx) upstream response
pub struct DispatchResponse {
    pub status: http::StatusCode,
    pub headers: http::HeaderMap,
    pub body: DispatchBody,
}

impl DispatchResponse {
    /// Drain the body into memory
    pub async fn into_bytes(self) -> Result<Bytes> {
        use futures_util::TryStreamExt;
        match self.body {
            DispatchBody::Buffered(bytes) => Ok(bytes),
            DispatchBody::Streaming(stream) => {
                let chunks: Vec<Bytes> = stream.try_collect().await?;
                Ok(Bytes::from(chunks.concat()))
            }
        }
    }
}

/// Forwards admitted requests to the model server
pub struct Dispatcher {
    client: reqwest::Client,
    base_url: String,
    timeout: Duration,
    reporter: Arc<MetricsReporter>,
    access_log: Arc<AccessLog>,
}

impl Dispatcher {
    /// Create a dispatcher for the configured upstream
    pub fn new(
        upstream: &UpstreamConfig,
        reporter: Arc<MetricsReporter>,
        access_log: Arc<AccessLog>,
    ) -> Result<Self> {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(upstream.connect_timeout_secs))
            .pool_max_idle_per_host(32)
            // Redirects are relayed to the caller, never followed
            .redirect(reqwest::redirect::Policy::none())
            .build()?;

        Ok(Self {
            client,
            base_url: upstream.base_url(),
            timeout: Duration::from_secs(upstream.timeout_secs),
            reporter,
            access_log,
        })
    }

    /// Base URL every route is appended to
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Full upstream URL for a route path and query
    pub fn upstream_url(&self, path: &str, query: Option<&str>) -> String {
        match query.filter(|q| !q.is_empty()) {
            Some(q) => format!("{}{}?{}", self.base_url, path, q),
            None => format!("{}{}", self.base_url, path),
        }
    }

    /// Forward a request under an admission ticket.
    ///
    /// Exactly one completion event is reported per call: here for buffered
    /// and failed dispatches, or when a relayed stream ends or is dropped.
    pub async fn dispatch(
        &self,
        ticket: AdmissionTicket,
        request: DispatchRequest,
    ) -> Result<DispatchResponse> {
        let streaming = ticket.route().streaming;
        let url = self.upstream_url(ticket.path(), request.query.as_deref());
        let mut guard = CompletionGuard::new(
            ticket,
            request.method.clone(),
            self.reporter.clone(),
            self.access_log.clone(),
        );

        let mut builder = self.client.request(request.method, &url);
        if !streaming {
            builder = builder.timeout(self.timeout);
        }

        let multipart = matches!(request.body, ForwardBody::Multipart(_));
        for (name, value) in request.headers.iter() {
            if is_hop_by_hop(name.as_str()) || name == http::header::HOST {
                continue;
            }
            // The form sets its own boundary and length
            if multipart
                && (name == http::header::CONTENT_TYPE || name == http::header::CONTENT_LENGTH)
            {
                continue;
            }
            builder = builder.header(name.clone(), value.clone());
        }

        builder = match request.body {
            ForwardBody::Empty => builder,
            ForwardBody::Full(bytes) => builder.body(bytes),
            ForwardBody::Stream(body) => builder.body(body),
            ForwardBody::Multipart(form) => builder.multipart(form),
        };

        let response = match builder.send().await {
            Ok(response) => response,
            Err(e) => {
                let err = self.map_send_error(e, &url);
                guard.finish(outcome_for(&err));
                return Err(err);
            }
        };

        let status = response.status();
        let headers = strip_hop_by_hop(response.headers());
        guard.set_status(status.as_u16());

        if !status.is_success() {
            let body = match response.bytes().await {
                Ok(body) => body,
                Err(e) => {
                    tracing::debug!(url, error = %e, "Failed to read upstream error body");
                    Bytes::new()
                }
            };
            guard.add_bytes(body.len() as u64);
            guard.finish(CompletionOutcome::UpstreamStatus(status.as_u16()));
            tracing::warn!(url, status = status.as_u16(), "Upstream returned error status");
            return Err(WorkerError::UpstreamStatus {
                status: status.as_u16(),
                headers,
                body,
            });
        }

        if streaming {
            return Ok(DispatchResponse {
                status,
                headers,
                body: DispatchBody::Streaming(RelayStream::new(response.bytes_stream(), guard)),
            });
        }

        match response.bytes().await {
            Ok(body) => {
                guard.add_bytes(body.len() as u64);
                guard.finish(CompletionOutcome::Success);
                Ok(DispatchResponse {
                    status,
                    headers,
                    body: DispatchBody::Buffered(body),
                })
            }
            Err(e) => {
                let err = self.map_send_error(e, &url);
                guard.finish(outcome_for(&err));
                Err(err)
            }
        }
    }

    fn map_send_error(&self, e: reqwest::Error, url: &str) -> WorkerError {
        if e.is_timeout() {
            tracing::warn!(url, timeout_ms = self.timeout.as_millis() as u64, "Upstream timed out");
            WorkerError::UpstreamTimeout(self.timeout.as_millis() as u64)
        } else {
            tracing::warn!(url, error = %e, "Upstream unavailable");
            WorkerError::UpstreamUnavailable(format!("Cannot reach model server at {}: {}", url, e))
        }
    }
}

fn outcome_for(err: &WorkerError) -> CompletionOutcome {
    match err {
        WorkerError::UpstreamTimeout(_) => CompletionOutcome::UpstreamTimeout,
        WorkerError::UpstreamStatus { status, .. } => CompletionOutcome::UpstreamStatus(*status),
        _ => CompletionOutcome::UpstreamUnavailable,
    }
}

/// Copy response headers, dropping hop-by-hop ones
fn strip_hop_by_hop(headers: &http::HeaderMap) -> http::HeaderMap {
    headers
        .iter()
        .filter(|(name, _)| !is_hop_by_hop(name.as_str()))
        .map(|(name, value)| (name.clone(), value.clone()))
        .collect()
}

/// Check if a header is a hop-by-hop header that should not be forwarded
pub(crate) fn is_hop_by_hop(name: &str) -> bool {
    matches!(
        name.to_ascii_lowercase().as_str(),
        "connection"
            | "keep-alive"
            | "proxy-authenticate"
            | "proxy-authorization"
            | "proxy-connection"
            | "te"
            | "trailer"
            | "trailers"
            | "transfer-encoding"
            | "upgrade"
    )
}
