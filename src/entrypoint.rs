//! Entrypoint — the worker's HTTP/1.1 listener
//!
//! Accepts client connections and turns each request into
//! `submit → dispatch`, mapping the outcome to an HTTP response. Paths under
//! `/_worker` are answered by the status API instead.

use crate::admission::AdmissionQueue;
use crate::error::{Result, WorkerError};
use crate::estimator::Payload;
use crate::proxy::{DispatchBody, DispatchRequest, DispatchResponse, Dispatcher, ForwardBody};
use crate::status::{StatusApi, StatusResponse};
use bytes::Bytes;
use futures_util::TryStreamExt;
use http_body_util::combinators::UnsyncBoxBody;
use http_body_util::{BodyExt, Full, StreamBody};
use hyper::body::{Frame, Incoming};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper_util::rt::TokioIo;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;

/// Header naming the kind of every worker-generated failure
pub const ERROR_KIND_HEADER: &str = "x-worker-error";

/// Response body type served by the worker
pub type ResponseBody = UnsyncBoxBody<Bytes, std::io::Error>;

/// Shared state for request handling
pub struct WorkerState {
    pub queue: Arc<AdmissionQueue>,
    pub dispatcher: Arc<Dispatcher>,
    pub status: StatusApi,
}

/// Bind the listening socket
pub async fn bind(addr: &str) -> Result<TcpListener> {
    let addr: SocketAddr = addr
        .parse()
        .map_err(|e| WorkerError::Config(format!("Invalid listen address '{}': {}", addr, e)))?;
    TcpListener::bind(addr)
        .await
        .map_err(|e| WorkerError::Other(format!("Failed to bind {}: {}", addr, e)))
}

/// Serve connections on `listener` until the task is aborted
pub fn start_listener(
    listener: TcpListener,
    state: Arc<WorkerState>,
) -> tokio::task::JoinHandle<()> {
    if let Ok(addr) = listener.local_addr() {
        tracing::info!(address = %addr, "HTTP entrypoint listening");
    }

    tokio::spawn(async move {
        loop {
            let (stream, remote_addr) = match listener.accept().await {
                Ok(conn) => conn,
                Err(e) => {
                    tracing::error!(error = %e, "Failed to accept connection");
                    continue;
                }
            };

            let state = state.clone();
            tokio::spawn(async move {
                let io = TokioIo::new(stream);
                if let Err(e) = http1::Builder::new()
                    .serve_connection(
                        io,
                        service_fn(|req| handle_request(req, remote_addr, state.clone())),
                    )
                    .await
                {
                    tracing::debug!(remote = %remote_addr, error = %e, "Connection closed with error");
                }
            });
        }
    })
}

async fn handle_request(
    req: hyper::Request<Incoming>,
    remote_addr: SocketAddr,
    state: Arc<WorkerState>,
) -> std::result::Result<hyper::Response<ResponseBody>, hyper::Error> {
    let (parts, body) = req.into_parts();
    let path = parts.uri.path().to_string();

    if let Some(resp) = state.status.handle(&parts.method, &path) {
        return Ok(status_response(resp));
    }

    // Streaming routes hand the body through untouched; everything else is
    // buffered so the estimator can see it
    let streaming = state.queue.routes().get(&path).map(|r| r.streaming);
    let (buffered, stream_body) = match streaming {
        Some(true) => (None, Some(body)),
        Some(false) => match body.collect().await {
            Ok(collected) => (Some(collected.to_bytes()), None),
            Err(e) => {
                tracing::debug!(remote = %remote_addr, path, error = %e, "Failed to read request body");
                return Ok(error_body(
                    http::StatusCode::BAD_REQUEST,
                    "bad_request",
                    &e.to_string(),
                ));
            }
        },
        None => (None, None),
    };

    let payload = Payload::new(&parts.headers, buffered.as_deref());
    let ticket = match state.queue.submit(&path, &payload).await {
        Ok(ticket) => ticket,
        Err(e) => {
            tracing::debug!(remote = %remote_addr, path, error = %e, "Request not admitted");
            return Ok(error_response(e));
        }
    };

    let body = match (buffered, stream_body) {
        (_, Some(incoming)) => {
            ForwardBody::Stream(reqwest::Body::wrap_stream(incoming.into_data_stream()))
        }
        (Some(bytes), None) if !bytes.is_empty() => ForwardBody::Full(bytes),
        _ => ForwardBody::Empty,
    };
    let request = DispatchRequest {
        method: parts.method,
        query: parts.uri.query().map(str::to_string),
        headers: parts.headers,
        body,
    };

    match state.dispatcher.dispatch(ticket, request).await {
        Ok(resp) => Ok(dispatch_response(resp)),
        Err(e) => Ok(error_response(e)),
    }
}

fn full(bytes: impl Into<Bytes>) -> ResponseBody {
    Full::new(bytes.into())
        .map_err(|never| match never {})
        .boxed_unsync()
}

fn dispatch_response(resp: DispatchResponse) -> hyper::Response<ResponseBody> {
    let body = match resp.body {
        DispatchBody::Buffered(bytes) => full(bytes),
        DispatchBody::Streaming(relay) => StreamBody::new(relay.map_ok(Frame::data)).boxed_unsync(),
    };
    let mut response = hyper::Response::new(body);
    *response.status_mut() = resp.status;
    *response.headers_mut() = resp.headers;
    response
}

fn status_response(resp: StatusResponse) -> hyper::Response<ResponseBody> {
    let mut response = hyper::Response::new(full(resp.body));
    *response.status_mut() =
        http::StatusCode::from_u16(resp.status).unwrap_or(http::StatusCode::INTERNAL_SERVER_ERROR);
    response.headers_mut().insert(
        http::header::CONTENT_TYPE,
        http::HeaderValue::from_static(resp.content_type),
    );
    response
}

/// Map a failed request to its HTTP response
pub(crate) fn error_response(err: WorkerError) -> hyper::Response<ResponseBody> {
    let status = err.status_code();
    let kind = err.kind();

    // Upstream error responses are relayed as they are, only tagged
    if let WorkerError::UpstreamStatus { headers, body, .. } = err {
        let mut response = hyper::Response::new(full(body));
        *response.status_mut() = status;
        *response.headers_mut() = headers;
        response.headers_mut().insert(
            ERROR_KIND_HEADER,
            http::HeaderValue::from_static(kind),
        );
        return response;
    }

    let mut response = error_body(status, kind, &err.to_string());
    if let WorkerError::AdmissionTimeout { waited_ms, .. } = err {
        let retry_after = waited_ms.div_ceil(1000).max(1);
        if let Ok(value) = http::HeaderValue::from_str(&retry_after.to_string()) {
            response.headers_mut().insert(http::header::RETRY_AFTER, value);
        }
    }
    response
}

fn error_body(
    status: http::StatusCode,
    kind: &'static str,
    message: &str,
) -> hyper::Response<ResponseBody> {
    let body = serde_json::json!({ "error": kind, "message": message }).to_string();
    let mut response = hyper::Response::new(full(body));
    *response.status_mut() = status;
    let headers = response.headers_mut();
    headers.insert(
        http::header::CONTENT_TYPE,
        http::HeaderValue::from_static("application/json"),
    );
    headers.insert(ERROR_KIND_HEADER, http::HeaderValue::from_static(kind));
    response
}
