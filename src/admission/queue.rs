//! Serialization gate — one admitted request at a time, FIFO waiters

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Instant;
use tokio::sync::oneshot;

/// Exclusive right to run on a serialized route. Dropping it passes the slot
/// to the next live waiter.
pub struct RouteSlot {
    gate: Arc<RouteGate>,
    armed: bool,
}

impl std::fmt::Debug for RouteSlot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RouteSlot")
            .field("route", &self.gate.route)
            .field("armed", &self.armed)
            .finish()
    }
}

impl Drop for RouteSlot {
    fn drop(&mut self) {
        if self.armed {
            self.armed = false;
            self.gate.release();
        }
    }
}

struct Waiter {
    id: u64,
    deadline: Instant,
    tx: oneshot::Sender<RouteSlot>,
}

#[derive(Default)]
struct GateState {
    busy: bool,
    waiters: VecDeque<Waiter>,
    next_id: u64,
}

/// Outcome of entering the gate
pub(crate) enum Entry {
    Admitted(RouteSlot),
    Queued(QueuedWaiter),
    /// Gate busy and no time left to wait
    Rejected,
}

/// A waiter's handle, consumed by [`RouteGate::wait`]
pub(crate) struct QueuedWaiter {
    id: u64,
    deadline: Instant,
    rx: oneshot::Receiver<RouteSlot>,
}

/// Per-route gate for routes that do not allow parallel requests
pub(crate) struct RouteGate {
    route: String,
    state: Mutex<GateState>,
}

impl RouteGate {
    pub(crate) fn new(route: impl Into<String>) -> Arc<Self> {
        Arc::new(Self {
            route: route.into(),
            state: Mutex::new(GateState::default()),
        })
    }

    /// Take the slot if it is free and nobody is queued, otherwise join the queue
    pub(crate) fn enter(self: &Arc<Self>, deadline: Instant, now: Instant) -> Entry {
        let mut state = self.state.lock().unwrap();
        if !state.busy && state.waiters.is_empty() {
            state.busy = true;
            return Entry::Admitted(RouteSlot {
                gate: self.clone(),
                armed: true,
            });
        }
        if deadline <= now {
            return Entry::Rejected;
        }
        let id = state.next_id;
        state.next_id += 1;
        let (tx, rx) = oneshot::channel();
        state.waiters.push_back(Waiter { id, deadline, tx });
        Entry::Queued(QueuedWaiter { id, deadline, rx })
    }

    /// Wait for the slot until the waiter's deadline. A slot that arrives
    /// late is passed on and the waiter is rejected.
    pub(crate) async fn wait(&self, waiter: QueuedWaiter) -> Option<RouteSlot> {
        let QueuedWaiter {
            id,
            deadline,
            mut rx,
        } = waiter;

        let result =
            tokio::time::timeout_at(tokio::time::Instant::from_std(deadline), &mut rx).await;
        match result {
            Ok(Ok(slot)) if Instant::now() <= deadline => Some(slot),
            Ok(Ok(_late)) => None,
            // Skipped by release() because the deadline had already passed
            Ok(Err(_)) => None,
            Err(_) => {
                self.remove(id);
                // A slot may have been sent between the timeout and the removal
                if let Ok(slot) = rx.try_recv() {
                    drop(slot);
                }
                None
            }
        }
    }

    /// Number of queued waiters
    pub(crate) fn queue_len(&self) -> usize {
        self.state.lock().unwrap().waiters.len()
    }

    /// Whether the slot is currently held
    pub(crate) fn is_busy(&self) -> bool {
        self.state.lock().unwrap().busy
    }

    fn remove(&self, id: u64) {
        let mut state = self.state.lock().unwrap();
        state.waiters.retain(|w| w.id != id);
    }

    fn release(self: &Arc<Self>) {
        let mut state = self.state.lock().unwrap();
        let now = Instant::now();
        while let Some(waiter) = state.waiters.pop_front() {
            if waiter.deadline < now {
                continue;
            }
            let slot = RouteSlot {
                gate: self.clone(),
                armed: true,
            };
            match waiter.tx.send(slot) {
                Ok(()) => return,
                Err(mut slot) => {
                    // Receiver gone; disarm so the drop does not re-enter release()
                    slot.armed = false;
                }
            }
        }
        state.busy = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn later(ms: u64) -> Instant {
        Instant::now() + Duration::from_millis(ms)
    }

    #[tokio::test]
    async fn test_first_entry_admitted() {
        let gate = RouteGate::new("/a");
        let entry = gate.enter(later(1000), Instant::now());
        assert!(matches!(entry, Entry::Admitted(_)));
        assert!(gate.is_busy());
        drop(entry);
        assert!(!gate.is_busy());
    }

    #[tokio::test]
    async fn test_busy_with_zero_wait_rejected() {
        let gate = RouteGate::new("/a");
        let _held = gate.enter(later(1000), Instant::now());
        let now = Instant::now();
        assert!(matches!(gate.enter(now, now), Entry::Rejected));
        assert_eq!(gate.queue_len(), 0);
    }

    #[tokio::test]
    async fn test_slot_handed_to_waiter() {
        let gate = RouteGate::new("/a");
        let held = gate.enter(later(1000), Instant::now());
        let Entry::Queued(waiter) = gate.enter(later(1000), Instant::now()) else {
            panic!("expected queued");
        };
        let g = gate.clone();
        let handle = tokio::spawn(async move { g.wait(waiter).await });

        tokio::time::sleep(Duration::from_millis(20)).await;
        drop(held);
        let slot = handle.await.unwrap();
        assert!(slot.is_some());
        // Slot was passed on, not freed
        assert!(gate.is_busy());
        drop(slot);
        assert!(!gate.is_busy());
    }

    #[tokio::test]
    async fn test_waiter_times_out() {
        let gate = RouteGate::new("/a");
        let _held = gate.enter(later(1000), Instant::now());
        let Entry::Queued(waiter) = gate.enter(later(30), Instant::now()) else {
            panic!("expected queued");
        };
        let started = Instant::now();
        assert!(gate.wait(waiter).await.is_none());
        assert!(started.elapsed() >= Duration::from_millis(25));
        assert_eq!(gate.queue_len(), 0);
    }

    #[tokio::test]
    async fn test_abandoned_waiter_is_skipped() {
        let gate = RouteGate::new("/a");
        let held = gate.enter(later(1000), Instant::now());
        let abandoned = gate.enter(later(1000), Instant::now());
        let Entry::Queued(waiter) = gate.enter(later(1000), Instant::now()) else {
            panic!("expected queued");
        };
        drop(abandoned);

        let g = gate.clone();
        let handle = tokio::spawn(async move { g.wait(waiter).await.is_some() });
        tokio::time::sleep(Duration::from_millis(20)).await;
        drop(held);
        assert!(handle.await.unwrap());
    }

    #[tokio::test]
    async fn test_expired_waiter_skipped_on_release() {
        let gate = RouteGate::new("/a");
        let held = gate.enter(later(1000), Instant::now());
        let Entry::Queued(expired) = gate.enter(later(10), Instant::now()) else {
            panic!("expected queued");
        };
        std::thread::sleep(Duration::from_millis(20));
        drop(held);
        // Nobody live was waiting, so the gate is free again
        assert!(!gate.is_busy());
        assert!(gate.wait(expired).await.is_none());
    }
}
