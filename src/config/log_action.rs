//! Log action configuration — patterns that turn model-server log lines into events

use serde::{Deserialize, Serialize};

/// Substrings matched against each model-server log line
///
/// # Example
///
/// ```hcl
/// log_actions {
///   on_load  = ["Application startup complete."]
///   on_error = ["Traceback (most recent call last):", "CUDA out of memory"]
///   on_info  = ["Warming up GPU"]
/// }
/// ```
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct LogActionConfig {
    /// Lines signalling the model is loaded and serving
    #[serde(default)]
    pub on_load: Vec<String>,

    /// Lines signalling a model-server fault
    #[serde(default)]
    pub on_error: Vec<String>,

    /// Informational milestones
    #[serde(default)]
    pub on_info: Vec<String>,
}

impl Default for LogActionConfig {
    fn default() -> Self {
        Self {
            on_load: vec!["Application startup complete.".to_string()],
            on_error: vec![
                "Traceback (most recent call last):".to_string(),
                "RuntimeError:".to_string(),
                "CUDA out of memory".to_string(),
            ],
            on_info: vec!["Warming up GPU".to_string(), "Pipeline loaded".to_string()],
        }
    }
}

impl LogActionConfig {
    /// Whether any pattern is configured at all
    pub fn is_empty(&self) -> bool {
        self.on_load.is_empty() && self.on_error.is_empty() && self.on_info.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let cfg = LogActionConfig::default();
        assert_eq!(cfg.on_load, vec!["Application startup complete."]);
        assert_eq!(cfg.on_error.len(), 3);
        assert_eq!(cfg.on_info.len(), 2);
        assert!(!cfg.is_empty());
    }

    #[test]
    fn test_parse_partial() {
        let hcl = r#"
            on_load = ["Uvicorn running"]
        "#;
        let cfg: LogActionConfig = hcl::from_str(hcl).unwrap();
        assert_eq!(cfg.on_load, vec!["Uvicorn running"]);
        assert!(cfg.on_error.is_empty());
        assert!(cfg.on_info.is_empty());
    }
}
