//! Route configuration — one entry per proxied model-server endpoint

use serde::{Deserialize, Serialize};

use crate::error::{WorkerError, Result};

/// Paths under this prefix are served by the worker itself
pub const RESERVED_PREFIX: &str = "/_worker";

/// Upper bound on a route's queue wait (one year)
pub const MAX_QUEUE_SECS: f64 = 365.0 * 86_400.0;

/// Route configuration — a model-server path the worker proxies
///
/// # Example
///
/// ```hcl
/// routes = [
///   {
///     path           = "/v1/audio/transcriptions"
///     allow_parallel = true
///     max_queue_secs = 120
///     estimator      = { kind = "constant", value = 10.0 }
///     benchmark      = {
///       runs        = 4
///       concurrency = 1
///       generator   = { kind = "silence_wav", seconds = 1.0, language = "hi" }
///     }
///   }
/// ]
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RouteConfig {
    /// Request path, forwarded unchanged to the model server
    pub path: String,

    /// Whether requests may overlap on this route (false = serialized)
    #[serde(default = "default_allow_parallel")]
    pub allow_parallel: bool,

    /// Longest a request may wait for admission before being rejected
    #[serde(default = "default_max_queue_secs")]
    pub max_queue_secs: f64,

    /// Workload estimator for this route
    #[serde(default)]
    pub estimator: EstimatorConfig,

    /// Calibration protocol (routes without one are never benchmarked)
    #[serde(default)]
    pub benchmark: Option<BenchmarkConfig>,

    /// Relay bodies incrementally. Defaults to true for paths ending in `/stream`.
    #[serde(default)]
    pub streaming: Option<bool>,
}

fn default_allow_parallel() -> bool {
    true
}

fn default_max_queue_secs() -> f64 {
    30.0
}

impl RouteConfig {
    /// Create a route with default settings for the given path
    pub fn new(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            allow_parallel: default_allow_parallel(),
            max_queue_secs: default_max_queue_secs(),
            estimator: EstimatorConfig::default(),
            benchmark: None,
            streaming: None,
        }
    }

    /// Whether bodies on this route are relayed as streams
    pub fn is_streaming(&self) -> bool {
        self.streaming
            .unwrap_or_else(|| self.path.trim_end_matches('/').ends_with("/stream"))
    }

    /// Validate a single route
    pub fn validate(&self) -> Result<()> {
        if !self.path.starts_with('/') {
            return Err(WorkerError::Config(format!(
                "Route path '{}' must start with '/'",
                self.path
            )));
        }
        if self.path.starts_with(RESERVED_PREFIX) {
            return Err(WorkerError::Config(format!(
                "Route path '{}' uses the reserved prefix {}",
                self.path, RESERVED_PREFIX
            )));
        }
        if !self.max_queue_secs.is_finite()
            || self.max_queue_secs < 0.0
            || self.max_queue_secs > MAX_QUEUE_SECS
        {
            return Err(WorkerError::Config(format!(
                "Route '{}' has invalid max_queue_secs {}",
                self.path, self.max_queue_secs
            )));
        }
        self.estimator.validate(&self.path)?;
        if let Some(ref bench) = self.benchmark {
            bench.validate(&self.path)?;
        }
        Ok(())
    }
}

/// Workload estimator selection
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum EstimatorConfig {
    /// Every request costs the same
    Constant { value: f64 },
    /// Cost is the audio duration in seconds of a WAV payload
    WavDuration {
        /// Used when the payload carries no readable WAV header
        #[serde(default = "default_wav_fallback")]
        default_seconds: f64,
    },
}

fn default_wav_fallback() -> f64 {
    10.0
}

impl Default for EstimatorConfig {
    fn default() -> Self {
        Self::Constant { value: 1.0 }
    }
}

impl EstimatorConfig {
    fn validate(&self, path: &str) -> Result<()> {
        let value = match self {
            Self::Constant { value } => *value,
            Self::WavDuration { default_seconds } => *default_seconds,
        };
        if !value.is_finite() || value < 0.0 {
            return Err(WorkerError::Config(format!(
                "Route '{}' estimator must produce a non-negative cost, got {}",
                path, value
            )));
        }
        Ok(())
    }
}

/// Benchmark protocol for a route
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BenchmarkConfig {
    /// Synthetic request generator
    pub generator: GeneratorConfig,

    /// Number of sequential batches
    #[serde(default = "default_runs")]
    pub runs: u32,

    /// Simultaneous requests per batch
    #[serde(default = "default_concurrency")]
    pub concurrency: u32,
}

fn default_runs() -> u32 {
    4
}

fn default_concurrency() -> u32 {
    1
}

impl BenchmarkConfig {
    fn validate(&self, path: &str) -> Result<()> {
        if self.runs == 0 {
            return Err(WorkerError::Config(format!(
                "Route '{}' benchmark runs must be at least 1",
                path
            )));
        }
        if self.concurrency == 0 {
            return Err(WorkerError::Config(format!(
                "Route '{}' benchmark concurrency must be at least 1",
                path
            )));
        }
        if let GeneratorConfig::SilenceWav { seconds, sample_rate, .. }
        | GeneratorConfig::JsonAudio { seconds, sample_rate, .. } = &self.generator
        {
            if !seconds.is_finite() || *seconds <= 0.0 || *sample_rate == 0 {
                return Err(WorkerError::Config(format!(
                    "Route '{}' benchmark audio must have a positive duration and sample rate",
                    path
                )));
            }
        }
        Ok(())
    }
}

/// Synthetic request generator selection
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum GeneratorConfig {
    /// Multipart upload of a silent WAV file plus a `language` field
    SilenceWav {
        #[serde(default = "default_audio_seconds")]
        seconds: f64,
        #[serde(default = "default_sample_rate")]
        sample_rate: u32,
        #[serde(default)]
        language: Option<String>,
    },
    /// JSON body with a base64-encoded silent WAV in `field`
    JsonAudio {
        #[serde(default = "default_audio_field")]
        field: String,
        #[serde(default = "default_audio_seconds")]
        seconds: f64,
        #[serde(default = "default_sample_rate")]
        sample_rate: u32,
        #[serde(default)]
        language: Option<String>,
    },
    /// Bodiless GET
    Empty,
}

fn default_audio_seconds() -> f64 {
    1.0
}

fn default_sample_rate() -> u32 {
    16_000
}

fn default_audio_field() -> String {
    "audio".to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_route_parse_minimal() {
        let hcl = r#"
            path = "/health"
        "#;
        let route: RouteConfig = hcl::from_str(hcl).unwrap();
        assert_eq!(route.path, "/health");
        assert!(route.allow_parallel);
        assert!((route.max_queue_secs - 30.0).abs() < f64::EPSILON);
        assert_eq!(route.estimator, EstimatorConfig::Constant { value: 1.0 });
        assert!(route.benchmark.is_none());
    }

    #[test]
    fn test_route_parse_full() {
        let hcl = r#"
            path           = "/v1/audio/transcriptions"
            allow_parallel = false
            max_queue_secs = 120.0
            estimator      = { kind = "wav_duration", default_seconds = 5.0 }
            benchmark      = {
              runs        = 2
              concurrency = 3
              generator   = { kind = "silence_wav", seconds = 2.0, language = "hi" }
            }
        "#;
        let route: RouteConfig = hcl::from_str(hcl).unwrap();
        assert!(!route.allow_parallel);
        assert_eq!(
            route.estimator,
            EstimatorConfig::WavDuration {
                default_seconds: 5.0
            }
        );
        let bench = route.benchmark.unwrap();
        assert_eq!(bench.runs, 2);
        assert_eq!(bench.concurrency, 3);
        assert_eq!(
            bench.generator,
            GeneratorConfig::SilenceWav {
                seconds: 2.0,
                sample_rate: 16_000,
                language: Some("hi".into()),
            }
        );
    }

    #[test]
    fn test_streaming_by_suffix() {
        assert!(RouteConfig::new("/v1/audio/transcriptions/stream").is_streaming());
        assert!(!RouteConfig::new("/v1/audio/transcriptions").is_streaming());
        assert!(!RouteConfig::new("/streaming").is_streaming());
    }

    #[test]
    fn test_streaming_override() {
        let mut route = RouteConfig::new("/v1/audio/transcriptions/stream");
        route.streaming = Some(false);
        assert!(!route.is_streaming());
    }

    #[test]
    fn test_validate_path_prefix() {
        let err = RouteConfig::new("health").validate().unwrap_err();
        assert!(err.to_string().contains("must start with '/'"));
    }

    #[test]
    fn test_validate_reserved_prefix() {
        let err = RouteConfig::new("/_worker/metrics").validate().unwrap_err();
        assert!(err.to_string().contains("reserved prefix"));
    }

    #[test]
    fn test_validate_negative_queue_time() {
        let mut route = RouteConfig::new("/a");
        route.max_queue_secs = -1.0;
        assert!(route.validate().is_err());
    }

    #[test]
    fn test_validate_queue_time_upper_bound() {
        let mut route = RouteConfig::new("/a");
        route.max_queue_secs = MAX_QUEUE_SECS;
        assert!(route.validate().is_ok());
        route.max_queue_secs = 1e19;
        let err = route.validate().unwrap_err().to_string();
        assert!(err.contains("invalid max_queue_secs"));
    }

    #[test]
    fn test_validate_zero_runs() {
        let mut route = RouteConfig::new("/a");
        route.benchmark = Some(BenchmarkConfig {
            generator: GeneratorConfig::Empty,
            runs: 0,
            concurrency: 1,
        });
        let err = route.validate().unwrap_err();
        assert!(err.to_string().contains("runs must be at least 1"));
    }

    #[test]
    fn test_validate_zero_concurrency() {
        let mut route = RouteConfig::new("/a");
        route.benchmark = Some(BenchmarkConfig {
            generator: GeneratorConfig::Empty,
            runs: 1,
            concurrency: 0,
        });
        let err = route.validate().unwrap_err();
        assert!(err.to_string().contains("concurrency must be at least 1"));
    }

    #[test]
    fn test_validate_negative_constant_cost() {
        let mut route = RouteConfig::new("/a");
        route.estimator = EstimatorConfig::Constant { value: -2.0 };
        assert!(route.validate().is_err());
    }
}
