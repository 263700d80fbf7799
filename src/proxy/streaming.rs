//! Streaming relay — passes the upstream body through chunk by chunk
//!
//! The admission ticket rides along with the stream, so a serialized route
//! stays held until the client has received the last byte or gone away.

use crate::admission::AdmissionTicket;
use crate::observability::access_log::{AccessLog, AccessLogEntry};
use crate::observability::metrics::{CompletionEvent, CompletionOutcome, MetricsReporter};
use bytes::Bytes;
use futures_util::stream::BoxStream;
use futures_util::{Stream, StreamExt};
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

/// Owns a ticket and reports its completion exactly once
pub(crate) struct CompletionGuard {
    ticket: Option<AdmissionTicket>,
    method: http::Method,
    status: u16,
    bytes: u64,
    reporter: Arc<MetricsReporter>,
    access_log: Arc<AccessLog>,
}

impl CompletionGuard {
    pub(crate) fn new(
        ticket: AdmissionTicket,
        method: http::Method,
        reporter: Arc<MetricsReporter>,
        access_log: Arc<AccessLog>,
    ) -> Self {
        Self {
            ticket: Some(ticket),
            method,
            status: 0,
            bytes: 0,
            reporter,
            access_log,
        }
    }

    pub(crate) fn set_status(&mut self, status: u16) {
        self.status = status;
    }

    pub(crate) fn add_bytes(&mut self, n: u64) {
        self.bytes += n;
    }

    /// Report the outcome and release the ticket. Later calls are no-ops.
    pub(crate) fn finish(&mut self, outcome: CompletionOutcome) {
        let Some(ticket) = self.ticket.take() else {
            return;
        };
        let event = CompletionEvent {
            route: ticket.path().to_string(),
            wait: ticket.wait(),
            service: ticket.admitted_at().elapsed(),
            cost: ticket.cost(),
            outcome,
            synthetic: ticket.is_synthetic(),
        };
        self.reporter.record_completion(&event);
        self.access_log.record(&AccessLogEntry::from_completion(
            self.method.as_str(),
            self.status,
            self.bytes,
            &event,
        ));
    }
}

impl Drop for CompletionGuard {
    fn drop(&mut self) {
        self.finish(CompletionOutcome::Aborted);
    }
}

/// Response body relayed from the model server
pub struct RelayStream {
    inner: BoxStream<'static, reqwest::Result<Bytes>>,
    guard: CompletionGuard,
    done: bool,
}

impl RelayStream {
    pub(crate) fn new(
        inner: impl Stream<Item = reqwest::Result<Bytes>> + Send + 'static,
        guard: CompletionGuard,
    ) -> Self {
        Self {
            inner: inner.boxed(),
            guard,
            done: false,
        }
    }
}

impl Stream for RelayStream {
    type Item = Result<Bytes, std::io::Error>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = &mut *self;
        if this.done {
            return Poll::Ready(None);
        }
        match this.inner.poll_next_unpin(cx) {
            Poll::Ready(Some(Ok(chunk))) => {
                this.guard.add_bytes(chunk.len() as u64);
                Poll::Ready(Some(Ok(chunk)))
            }
            Poll::Ready(Some(Err(e))) => {
                this.done = true;
                let outcome = if e.is_timeout() {
                    CompletionOutcome::UpstreamTimeout
                } else {
                    CompletionOutcome::UpstreamUnavailable
                };
                tracing::warn!(error = %e, "Upstream stream failed mid-body");
                this.guard.finish(outcome);
                Poll::Ready(Some(Err(std::io::Error::other(e))))
            }
            Poll::Ready(None) => {
                this.done = true;
                this.guard.finish(CompletionOutcome::Success);
                Poll::Ready(None)
            }
            Poll::Pending => Poll::Pending,
        }
    }
}
