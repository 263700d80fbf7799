//! Admission queue — per-route gating before dispatch
//!
//! Every request is priced by its route's estimator exactly once, then
//! admitted immediately on parallel routes or queued FIFO on serialized ones.
//! A waiter that is still queued at its deadline is rejected; a slot that
//! reaches a waiter after its deadline is passed on, never used.

mod queue;

pub use queue::RouteSlot;

use crate::error::{Result, WorkerError};
use crate::estimator::{guarded_estimate, Payload};
use crate::observability::metrics::MetricsReporter;
use crate::router::{Route, RouteTable};
use queue::{Entry, RouteGate};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Stand-in deadline when a route's max queue time overflows `Instant`
const FAR_FUTURE: Duration = Duration::from_secs(100 * 365 * 86_400);

/// Proof of admission. Exactly one exists per in-flight request; dropping it
/// releases the route.
pub struct AdmissionTicket {
    route: Arc<Route>,
    enqueued_at: Instant,
    admitted_at: Instant,
    deadline: Instant,
    cost: f64,
    synthetic: bool,
    reporter: Arc<MetricsReporter>,
    slot: Option<RouteSlot>,
}

impl AdmissionTicket {
    /// The admitted route
    pub fn route(&self) -> &Arc<Route> {
        &self.route
    }

    /// Route path
    pub fn path(&self) -> &str {
        &self.route.path
    }

    /// Estimated cost
    pub fn cost(&self) -> f64 {
        self.cost
    }

    /// Benchmark traffic
    pub fn is_synthetic(&self) -> bool {
        self.synthetic
    }

    pub fn enqueued_at(&self) -> Instant {
        self.enqueued_at
    }

    pub fn admitted_at(&self) -> Instant {
        self.admitted_at
    }

    /// Latest instant admission could have happened
    pub fn deadline(&self) -> Instant {
        self.deadline
    }

    /// Time spent waiting for admission
    pub fn wait(&self) -> Duration {
        self.admitted_at.saturating_duration_since(self.enqueued_at)
    }

    /// Whether this ticket holds a serialized route's slot
    pub fn holds_slot(&self) -> bool {
        self.slot.is_some()
    }
}

impl std::fmt::Debug for AdmissionTicket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AdmissionTicket")
            .field("route", &self.route.path)
            .field("cost", &self.cost)
            .field("wait", &self.wait())
            .field("synthetic", &self.synthetic)
            .field("slot", &self.slot.is_some())
            .finish()
    }
}

impl Drop for AdmissionTicket {
    fn drop(&mut self) {
        self.reporter.record_released(&self.route.path);
        // `slot` drops after this and hands the route to the next waiter
    }
}

/// Decrements the waiting gauge however the wait ends
struct WaitingGuard<'a> {
    reporter: &'a MetricsReporter,
    route: &'a str,
}

impl<'a> WaitingGuard<'a> {
    fn new(reporter: &'a MetricsReporter, route: &'a str) -> Self {
        reporter.record_enqueued(route);
        Self { reporter, route }
    }
}

impl Drop for WaitingGuard<'_> {
    fn drop(&mut self) {
        self.reporter.record_dequeued(self.route);
    }
}

/// Admission control for every configured route
pub struct AdmissionQueue {
    routes: Arc<RouteTable>,
    gates: HashMap<String, Arc<RouteGate>>,
    reporter: Arc<MetricsReporter>,
}

impl AdmissionQueue {
    pub fn new(routes: Arc<RouteTable>, reporter: Arc<MetricsReporter>) -> Self {
        let gates = routes
            .routes()
            .iter()
            .filter(|r| !r.allow_parallel)
            .map(|r| (r.path.clone(), RouteGate::new(r.path.clone())))
            .collect();
        for route in routes.routes() {
            reporter.register_route(&route.path);
        }
        Self {
            routes,
            gates,
            reporter,
        }
    }

    /// The route table this queue admits against
    pub fn routes(&self) -> &Arc<RouteTable> {
        &self.routes
    }

    /// Admit a client request
    pub async fn submit(&self, path: &str, payload: &Payload<'_>) -> Result<AdmissionTicket> {
        self.admit(path, payload, false).await
    }

    /// Admit a benchmark request. Same gating, counted separately.
    pub async fn submit_synthetic(
        &self,
        path: &str,
        payload: &Payload<'_>,
    ) -> Result<AdmissionTicket> {
        self.admit(path, payload, true).await
    }

    /// Requests currently waiting on a serialized route
    pub fn queue_len(&self, path: &str) -> usize {
        self.gates.get(path).map(|g| g.queue_len()).unwrap_or(0)
    }

    async fn admit(
        &self,
        path: &str,
        payload: &Payload<'_>,
        synthetic: bool,
    ) -> Result<AdmissionTicket> {
        let Some(route) = self.routes.get(path) else {
            self.reporter.record_unroutable();
            return Err(WorkerError::UnroutablePath(path.to_string()));
        };

        let enqueued_at = Instant::now();
        let deadline = queue_deadline(enqueued_at, route.max_queue);

        let cost = match guarded_estimate(path, route.estimator.as_ref(), payload) {
            Ok(cost) => cost,
            Err(e) => {
                tracing::warn!(route = path, error = %e, "Estimator fault, admitting with zero cost");
                self.reporter.record_estimator_fault(path);
                0.0
            }
        };

        let slot = match self.gates.get(path) {
            None => None,
            Some(gate) => match gate.enter(deadline, enqueued_at) {
                Entry::Admitted(slot) => Some(slot),
                Entry::Rejected => return Err(self.reject(path, enqueued_at)),
                Entry::Queued(waiter) => {
                    let _waiting = WaitingGuard::new(&self.reporter, path);
                    match gate.wait(waiter).await {
                        Some(slot) => Some(slot),
                        None => return Err(self.reject(path, enqueued_at)),
                    }
                }
            },
        };

        let admitted_at = Instant::now();
        self.reporter.record_admitted(path, cost, synthetic);
        tracing::debug!(
            route = path,
            cost,
            wait_ms = admitted_at.saturating_duration_since(enqueued_at).as_millis() as u64,
            synthetic,
            "Request admitted"
        );

        Ok(AdmissionTicket {
            route: route.clone(),
            enqueued_at,
            admitted_at,
            deadline,
            cost,
            synthetic,
            reporter: self.reporter.clone(),
            slot,
        })
    }

    fn reject(&self, path: &str, enqueued_at: Instant) -> WorkerError {
        let waited_ms = enqueued_at.elapsed().as_millis() as u64;
        self.reporter.record_rejected(path);
        tracing::info!(route = path, waited_ms, "Admission timed out");
        WorkerError::AdmissionTimeout {
            route: path.to_string(),
            waited_ms,
        }
    }
}

/// Latest instant a request may still be admitted; saturates instead of overflowing
fn queue_deadline(enqueued_at: Instant, max_queue: Duration) -> Instant {
    enqueued_at
        .checked_add(max_queue)
        .or_else(|| enqueued_at.checked_add(FAR_FUTURE))
        .unwrap_or(enqueued_at)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{EstimatorConfig, RouteConfig, MAX_QUEUE_SECS};
    use crate::estimator::Estimator;
    use crate::health::HealthTracker;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    fn reporter() -> Arc<MetricsReporter> {
        let health = Arc::new(HealthTracker::new(Duration::from_secs(60)));
        Arc::new(MetricsReporter::new(health, Duration::from_secs(60)))
    }

    fn serialized(path: &str, max_queue_secs: f64) -> RouteConfig {
        RouteConfig {
            allow_parallel: false,
            max_queue_secs,
            estimator: EstimatorConfig::Constant { value: 2.0 },
            ..RouteConfig::new(path)
        }
    }

    fn queue(configs: &[RouteConfig]) -> (Arc<AdmissionQueue>, Arc<MetricsReporter>) {
        let table = Arc::new(RouteTable::from_config(configs).unwrap());
        let reporter = reporter();
        (
            Arc::new(AdmissionQueue::new(table, reporter.clone())),
            reporter,
        )
    }

    fn headers() -> http::HeaderMap {
        http::HeaderMap::new()
    }

    #[tokio::test]
    async fn test_unroutable() {
        let (q, reporter) = queue(&[RouteConfig::new("/a")]);
        let h = headers();
        let err = q.submit("/missing", &Payload::new(&h, None)).await.unwrap_err();
        assert_eq!(err.kind(), "unroutable_path");
        assert_eq!(reporter.snapshot().unroutable, 1);
    }

    #[tokio::test]
    async fn test_unroutable_does_not_call_estimator() {
        struct Counting(Arc<AtomicUsize>);
        impl Estimator for Counting {
            fn estimate(&self, _payload: &Payload<'_>) -> f64 {
                self.0.fetch_add(1, Ordering::SeqCst);
                1.0
            }
        }
        let calls = Arc::new(AtomicUsize::new(0));
        let mut table = RouteTable::from_config(&[RouteConfig::new("/a")]).unwrap();
        table.set_estimator("/a", Arc::new(Counting(calls.clone())));
        let q = AdmissionQueue::new(Arc::new(table), reporter());
        let h = headers();

        let _ = q.submit("/b", &Payload::new(&h, None)).await;
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        let _ticket = q.submit("/a", &Payload::new(&h, None)).await.unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_parallel_admits_immediately() {
        let (q, reporter) = queue(&[RouteConfig::new("/a")]);
        let h = headers();
        let t1 = q.submit("/a", &Payload::new(&h, None)).await.unwrap();
        let t2 = q.submit("/a", &Payload::new(&h, None)).await.unwrap();
        assert!(!t1.holds_slot());
        assert!(!t2.holds_slot());
        assert_eq!(reporter.snapshot().in_flight, 2);
        drop(t1);
        drop(t2);
        assert_eq!(reporter.snapshot().in_flight, 0);
    }

    #[tokio::test]
    async fn test_zero_queue_time_rejects_when_busy() {
        let (q, reporter) = queue(&[serialized("/a", 0.0)]);
        let h = headers();
        let held = q.submit("/a", &Payload::new(&h, None)).await.unwrap();
        assert!(held.holds_slot());

        let err = q.submit("/a", &Payload::new(&h, None)).await.unwrap_err();
        assert_eq!(err.kind(), "admission_timeout");
        assert_eq!(reporter.snapshot().routes["/a"].rejected_timeout, 1);

        drop(held);
        assert!(q.submit("/a", &Payload::new(&h, None)).await.is_ok());
    }

    #[test]
    fn test_queue_deadline_saturates() {
        let now = Instant::now();
        assert_eq!(queue_deadline(now, Duration::from_secs(2)), now + Duration::from_secs(2));
        let far = queue_deadline(now, Duration::MAX);
        assert!(far > now + Duration::from_secs(365 * 86_400));
    }

    #[tokio::test]
    async fn test_longest_allowed_queue_time_admits() {
        let parallel = RouteConfig {
            max_queue_secs: MAX_QUEUE_SECS,
            ..RouteConfig::new("/b")
        };
        let (q, _) = queue(&[serialized("/a", MAX_QUEUE_SECS), parallel]);
        let h = headers();
        let held = q.submit("/a", &Payload::new(&h, None)).await.unwrap();
        assert!(held.holds_slot());
        assert!(q.submit("/b", &Payload::new(&h, None)).await.is_ok());
    }

    #[tokio::test]
    async fn test_serialized_fifo_order() {
        let (q, _) = queue(&[serialized("/a", 5.0)]);
        let h = headers();
        let held = q.submit("/a", &Payload::new(&h, None)).await.unwrap();

        let order = Arc::new(Mutex::new(Vec::new()));
        let mut handles = Vec::new();
        for i in 0..5 {
            let qc = q.clone();
            let order = order.clone();
            handles.push(tokio::spawn(async move {
                let h = http::HeaderMap::new();
                let ticket = qc.submit("/a", &Payload::new(&h, None)).await.unwrap();
                order.lock().unwrap().push(i);
                tokio::time::sleep(Duration::from_millis(5)).await;
                drop(ticket);
            }));
            // Stagger submissions so arrival order is deterministic
            while q.queue_len("/a") < i + 1 {
                tokio::time::sleep(Duration::from_millis(1)).await;
            }
        }

        drop(held);
        for h in handles {
            h.await.unwrap();
        }
        assert_eq!(*order.lock().unwrap(), vec![0, 1, 2, 3, 4]);
    }

    #[tokio::test]
    async fn test_at_most_one_in_flight_on_serialized_route() {
        let (q, _) = queue(&[serialized("/a", 5.0)]);
        let active = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..8 {
            let q = q.clone();
            let active = active.clone();
            let peak = peak.clone();
            handles.push(tokio::spawn(async move {
                let h = http::HeaderMap::new();
                let ticket = q.submit("/a", &Payload::new(&h, None)).await.unwrap();
                let now = active.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(3)).await;
                active.fetch_sub(1, Ordering::SeqCst);
                drop(ticket);
            }));
        }
        for h in handles {
            h.await.unwrap();
        }
        assert_eq!(peak.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_waiter_rejected_at_deadline() {
        let (q, reporter) = queue(&[serialized("/a", 0.05)]);
        let h = headers();
        let held = q.submit("/a", &Payload::new(&h, None)).await.unwrap();

        let started = Instant::now();
        let err = q.submit("/a", &Payload::new(&h, None)).await.unwrap_err();
        assert_eq!(err.kind(), "admission_timeout");
        assert!(started.elapsed() >= Duration::from_millis(45));

        let snap = reporter.snapshot();
        assert_eq!(snap.routes["/a"].waiting, 0);
        assert_eq!(snap.queue_depth, 0);
        drop(held);
    }

    #[tokio::test]
    async fn test_no_admission_after_deadline() {
        let (q, _) = queue(&[serialized("/a", 0.05)]);
        let h = headers();
        let held = q.submit("/a", &Payload::new(&h, None)).await.unwrap();

        let q2 = q.clone();
        let waiter = tokio::spawn(async move {
            let h = http::HeaderMap::new();
            q2.submit("/a", &Payload::new(&h, None))
                .await
                .map(|t| t.admitted_at() <= t.deadline())
        });

        // Release only after the waiter's deadline has passed
        tokio::time::sleep(Duration::from_millis(80)).await;
        drop(held);
        assert!(waiter.await.unwrap().is_err());

        // The route is usable again
        assert!(q.submit("/a", &Payload::new(&h, None)).await.is_ok());
    }

    #[tokio::test]
    async fn test_cancelled_waiter_does_not_block_route() {
        let (q, _) = queue(&[serialized("/a", 5.0)]);
        let h = headers();
        let held = q.submit("/a", &Payload::new(&h, None)).await.unwrap();

        let q2 = q.clone();
        let cancelled = tokio::spawn(async move {
            let h = http::HeaderMap::new();
            let _ = q2.submit("/a", &Payload::new(&h, None)).await;
        });
        while q.queue_len("/a") < 1 {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
        cancelled.abort();
        let _ = cancelled.await;

        drop(held);
        let ticket = tokio::time::timeout(
            Duration::from_secs(1),
            q.submit("/a", &Payload::new(&h, None)),
        )
        .await
        .unwrap();
        assert!(ticket.is_ok());
    }

    #[tokio::test]
    async fn test_estimator_fault_admits_with_zero_cost() {
        struct Panicking;
        impl Estimator for Panicking {
            fn estimate(&self, _payload: &Payload<'_>) -> f64 {
                panic!("malformed payload")
            }
        }
        let mut table = RouteTable::from_config(&[RouteConfig::new("/a")]).unwrap();
        table.set_estimator("/a", Arc::new(Panicking));
        let reporter = reporter();
        let q = AdmissionQueue::new(Arc::new(table), reporter.clone());
        let h = headers();

        let ticket = q.submit("/a", &Payload::new(&h, None)).await.unwrap();
        assert_eq!(ticket.cost(), 0.0);
        assert_eq!(reporter.snapshot().routes["/a"].estimator_faults, 1);
    }

    #[tokio::test]
    async fn test_synthetic_counted_separately() {
        let (q, reporter) = queue(&[serialized("/a", 1.0)]);
        let h = headers();
        let ticket = q.submit_synthetic("/a", &Payload::new(&h, None)).await.unwrap();
        assert!(ticket.is_synthetic());
        assert!(ticket.holds_slot());
        let snap = reporter.snapshot();
        assert_eq!(snap.routes["/a"].synthetic, 1);
        assert_eq!(snap.routes["/a"].admitted, 0);
    }

    #[tokio::test]
    async fn test_ticket_fields() {
        let (q, _) = queue(&[serialized("/a", 2.0)]);
        let h = headers();
        let ticket = q.submit("/a", &Payload::new(&h, None)).await.unwrap();
        assert_eq!(ticket.path(), "/a");
        assert_eq!(ticket.cost(), 2.0);
        assert_eq!(
            ticket.deadline() - ticket.enqueued_at(),
            Duration::from_secs(2)
        );
        assert!(ticket.admitted_at() <= ticket.deadline());
    }
}
