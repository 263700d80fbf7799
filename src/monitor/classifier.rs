//! Log line classification against configured patterns

use super::{LogEvent, LogEventKind};
use crate::config::LogActionConfig;

/// Classifies log lines. Categories are tested error, then load, then info;
/// the first matching pattern wins.
#[derive(Debug, Clone)]
pub struct LogClassifier {
    /// (kind, pattern) in match priority order
    patterns: Vec<(LogEventKind, String)>,
}

impl LogClassifier {
    /// Build a classifier from log action configuration
    pub fn new(config: &LogActionConfig) -> Self {
        let mut patterns = Vec::new();
        for (kind, list) in [
            (LogEventKind::Error, &config.on_error),
            (LogEventKind::Load, &config.on_load),
            (LogEventKind::Info, &config.on_info),
        ] {
            patterns.extend(
                list.iter()
                    .filter(|p| !p.is_empty())
                    .map(|p| (kind, p.clone())),
            );
        }
        Self { patterns }
    }

    /// Classify a single line. Unmatched lines yield `None`.
    pub fn classify(&self, line: &str) -> Option<LogEvent> {
        self.patterns
            .iter()
            .find(|(_, pattern)| line.contains(pattern.as_str()))
            .map(|(kind, pattern)| LogEvent {
                kind: *kind,
                line: line.to_string(),
                pattern: pattern.clone(),
            })
    }

    /// Number of configured patterns
    pub fn len(&self) -> usize {
        self.patterns.len()
    }

    /// Whether no patterns are configured
    pub fn is_empty(&self) -> bool {
        self.patterns.is_empty()
    }
}
