//! Observability — metrics, access logging, and autoscaler reporting

pub mod access_log;
pub mod metrics;
pub mod report;

pub use access_log::{AccessLog, AccessLogEntry};
pub use metrics::{CompletionEvent, CompletionOutcome, MetricsReporter, MetricsSnapshot};
pub use report::ReportPusher;
