//! Health tracker — the process-wide HealthState machine
//!
//! ```text
//! Starting ──load──▶ Ready ◀──quiet period──▶ Degraded
//!     │                 └──────error──────────▲
//!     └───────────────error───────────────────┘
//! any ──stop──▶ Stopped
//! ```
//!
//! Only log-derived events move the state. Dispatch failures are reported as
//! metrics and never touch health.

use crate::monitor::{LogEvent, LogEventKind};
use crate::HealthState;
use serde::{Deserialize, Serialize};
use std::sync::Mutex;
use std::time::{Duration, Instant};
use tokio::sync::watch;

/// Point-in-time view of the tracker
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthSnapshot {
    pub state: HealthState,
    /// Whether the model server has ever reported itself loaded
    pub loaded: bool,
    /// Most recent error line from the model server log
    pub last_error: Option<String>,
}

/// A state change caused by an event
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Transition {
    pub from: HealthState,
    pub to: HealthState,
}

struct HealthInner {
    state: HealthState,
    loaded: bool,
    last_error_at: Option<Instant>,
    last_error: Option<String>,
}

/// Owned health state machine behind a single mutex
pub struct HealthTracker {
    inner: Mutex<HealthInner>,
    state_tx: watch::Sender<HealthState>,
    recovery: Duration,
}

impl HealthTracker {
    /// Create a tracker in `Starting`. `recovery` is the error-free period after
    /// which a loaded, degraded worker returns to `Ready`.
    pub fn new(recovery: Duration) -> Self {
        let (state_tx, _) = watch::channel(HealthState::Starting);
        Self {
            inner: Mutex::new(HealthInner {
                state: HealthState::Starting,
                loaded: false,
                last_error_at: None,
                last_error: None,
            }),
            state_tx,
            recovery,
        }
    }

    /// Current state
    pub fn state(&self) -> HealthState {
        self.inner.lock().unwrap().state
    }

    /// Current state with context
    pub fn snapshot(&self) -> HealthSnapshot {
        let inner = self.inner.lock().unwrap();
        HealthSnapshot {
            state: inner.state,
            loaded: inner.loaded,
            last_error: inner.last_error.clone(),
        }
    }

    /// Subscribe to state changes
    pub fn subscribe(&self) -> watch::Receiver<HealthState> {
        self.state_tx.subscribe()
    }

    /// Apply a classified log event
    pub fn apply(&self, event: &LogEvent) -> Option<Transition> {
        self.apply_at(event, Instant::now())
    }

    /// Apply a classified log event observed at `now`
    pub fn apply_at(&self, event: &LogEvent, now: Instant) -> Option<Transition> {
        match event.kind {
            LogEventKind::Load => self.mark_loaded(),
            LogEventKind::Error => self.mark_error_at(&event.line, now),
            LogEventKind::Info => None,
        }
    }

    /// The model server reported itself loaded. Only the first call has an effect.
    pub fn mark_loaded(&self) -> Option<Transition> {
        let mut inner = self.inner.lock().unwrap();
        if inner.loaded || inner.state == HealthState::Stopped {
            return None;
        }
        inner.loaded = true;
        if inner.state == HealthState::Starting {
            return self.transition(&mut inner, HealthState::Ready);
        }
        None
    }

    /// The model server logged an error at `now`
    pub fn mark_error_at(&self, line: &str, now: Instant) -> Option<Transition> {
        let mut inner = self.inner.lock().unwrap();
        if inner.state == HealthState::Stopped {
            return None;
        }
        inner.last_error_at = Some(now);
        inner.last_error = Some(line.to_string());
        self.transition(&mut inner, HealthState::Degraded)
    }

    /// Recover from `Degraded` once the quiet period has elapsed
    pub fn tick_at(&self, now: Instant) -> Option<Transition> {
        let mut inner = self.inner.lock().unwrap();
        if inner.state != HealthState::Degraded || !inner.loaded {
            return None;
        }
        let quiet = inner
            .last_error_at
            .map(|at| now.saturating_duration_since(at) >= self.recovery)
            .unwrap_or(true);
        if quiet {
            return self.transition(&mut inner, HealthState::Ready);
        }
        None
    }

    /// Terminal transition on shutdown
    pub fn stop(&self) -> Option<Transition> {
        let mut inner = self.inner.lock().unwrap();
        self.transition(&mut inner, HealthState::Stopped)
    }

    /// Wait until the state is `Ready`. Returns false if the tracker stopped first.
    pub async fn wait_until_ready(&self) -> bool {
        let mut rx = self.subscribe();
        loop {
            match *rx.borrow_and_update() {
                HealthState::Ready => return true,
                HealthState::Stopped => return false,
                _ => {}
            }
            if rx.changed().await.is_err() {
                return false;
            }
        }
    }

    fn transition(&self, inner: &mut HealthInner, to: HealthState) -> Option<Transition> {
        let from = inner.state;
        if from == to {
            return None;
        }
        inner.state = to;
        self.state_tx.send_replace(to);
        match to {
            HealthState::Degraded => tracing::warn!(from = %from, to = %to, "Health state transition"),
            _ => tracing::info!(from = %from, to = %to, "Health state transition"),
        }
        Some(Transition { from, to })
    }
}
