//! Workload estimators — map an inbound payload to a relative cost
//!
//! The cost is used twice: for admission accounting and as the load signal
//! reported to the autoscaler. Units are route-specific (the ASR routes use
//! audio seconds); callers only compare costs within a route.

use crate::config::EstimatorConfig;
use crate::error::WorkerError;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

/// Byte rate of 16 kHz, 16-bit mono PCM
const PCM16_MONO_16K_BYTE_RATE: f64 = 32_000.0;

/// The view of a request an estimator may inspect
#[derive(Debug, Clone, Copy)]
pub struct Payload<'a> {
    /// Request headers
    pub headers: &'a http::HeaderMap,
    /// Buffered body, `None` for streamed routes
    pub body: Option<&'a [u8]>,
}

impl<'a> Payload<'a> {
    pub fn new(headers: &'a http::HeaderMap, body: Option<&'a [u8]>) -> Self {
        Self { headers, body }
    }

    /// Declared `Content-Length`, if any
    pub fn content_length(&self) -> Option<u64> {
        self.headers
            .get(http::header::CONTENT_LENGTH)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.trim().parse().ok())
    }
}

/// Estimates the relative cost of a request. Must be pure: no I/O, no shared state.
pub trait Estimator: Send + Sync {
    fn estimate(&self, payload: &Payload<'_>) -> f64;
}

/// Same cost for every request
#[derive(Debug, Clone, Copy)]
pub struct ConstantEstimator {
    value: f64,
}

impl ConstantEstimator {
    pub fn new(value: f64) -> Self {
        Self { value }
    }
}

impl Estimator for ConstantEstimator {
    fn estimate(&self, _payload: &Payload<'_>) -> f64 {
        self.value
    }
}

/// Audio duration in seconds, read from the first RIFF/WAVE header in the body
#[derive(Debug, Clone, Copy)]
pub struct WavDurationEstimator {
    default_seconds: f64,
}

impl WavDurationEstimator {
    pub fn new(default_seconds: f64) -> Self {
        Self { default_seconds }
    }
}

impl Estimator for WavDurationEstimator {
    fn estimate(&self, payload: &Payload<'_>) -> f64 {
        match payload.body {
            Some(body) => wav_duration_secs(body).unwrap_or(self.default_seconds),
            None => payload
                .content_length()
                .map(|len| len as f64 / PCM16_MONO_16K_BYTE_RATE)
                .unwrap_or(self.default_seconds),
        }
    }
}

/// Build the estimator a route is configured with
pub fn build_estimator(config: &EstimatorConfig) -> Arc<dyn Estimator> {
    match config {
        EstimatorConfig::Constant { value } => Arc::new(ConstantEstimator::new(*value)),
        EstimatorConfig::WavDuration { default_seconds } => {
            Arc::new(WavDurationEstimator::new(*default_seconds))
        }
    }
}

/// Run an estimator, converting panics and invalid results into `EstimatorFault`
pub fn guarded_estimate(
    route: &str,
    estimator: &dyn Estimator,
    payload: &Payload<'_>,
) -> Result<f64, WorkerError> {
    let result = catch_unwind(AssertUnwindSafe(|| estimator.estimate(payload)));
    match result {
        Ok(cost) if cost.is_finite() && cost >= 0.0 => Ok(cost),
        Ok(cost) => Err(WorkerError::EstimatorFault {
            route: route.to_string(),
            reason: format!("invalid cost {}", cost),
        }),
        Err(panic) => {
            let reason = panic
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| panic.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "estimator panicked".to_string());
            Err(WorkerError::EstimatorFault {
                route: route.to_string(),
                reason,
            })
        }
    }
}

/// Duration of the first WAV file embedded in `bytes` (raw or inside a multipart body)
pub fn wav_duration_secs(bytes: &[u8]) -> Option<f64> {
    let start = bytes.windows(4).position(|w| w == b"RIFF")?;
    let wav = &bytes[start..];
    if wav.len() < 12 || &wav[8..12] != b"WAVE" {
        return None;
    }

    let mut offset = 12;
    let mut byte_rate = None;
    while offset + 8 <= wav.len() {
        let id = &wav[offset..offset + 4];
        let size = read_u32(wav, offset + 4)? as usize;
        let data_start = offset + 8;

        if id == b"fmt " {
            byte_rate = Some(read_u32(wav, data_start + 8)?);
        } else if id == b"data" {
            let rate = byte_rate.filter(|r| *r > 0)? as f64;
            let available = wav.len() - data_start;
            // Streaming writers leave the size at 0 or u32::MAX
            let data_len = if size == 0 || size == u32::MAX as usize {
                available
            } else {
                size
            };
            return Some(data_len as f64 / rate);
        }

        // Chunks are word-aligned
        offset = data_start.checked_add(size)?.checked_add(size & 1)?;
    }
    None
}

fn read_u32(bytes: &[u8], at: usize) -> Option<u32> {
    let slice = bytes.get(at..at + 4)?;
    Some(u32::from_le_bytes([slice[0], slice[1], slice[2], slice[3]]))
}
