//! Service and worker registry.
//!
//! All broker state lives here: the service table (by name), the worker
//! table (by identity), and the broker-global waiting set. Records are
//! arena-allocated and addressed by id, so nothing in the broker ever holds
//! a reference into a table while mutating another; the broker exclusively
//! owns every record and the outside world only ever sees a [`PeerId`].

use std::collections::{HashMap, HashSet, VecDeque};
use std::time::Instant;

use bytes::Bytes;
use ringproto::PeerId;
use slab::Slab;
use tracing::debug;

/// Arena handle for a [`Service`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ServiceId(usize);

/// Arena handle for a [`Worker`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct WorkerId(usize);

/// A named capability and its queue of pending requests.
pub struct Service {
    pub name: String,
    /// Pending request payloads, reply route first. FIFO.
    pub requests: VecDeque<Vec<Bytes>>,
    /// Idle workers offering this service, oldest first.
    pub waiting: Vec<WorkerId>,
    /// Workers attached to this service, idle or busy.
    pub workers: usize,
}

/// Broker-side proxy for a remote worker.
pub struct Worker {
    pub identity: PeerId,
    /// Set exactly once, by the worker's READY.
    pub service: Option<ServiceId>,
    /// Presumed dead after this instant unless a heartbeat refreshes it.
    pub expiry: Instant,
}

pub struct Registry {
    services: HashMap<String, ServiceId>,
    workers: HashMap<PeerId, WorkerId>,
    service_arena: Slab<Service>,
    worker_arena: Slab<Worker>,
    /// Workers eligible for dispatch, across all services.
    waiting: HashSet<WorkerId>,
}

impl Registry {
    pub fn new() -> Self {
        Registry {
            services: HashMap::new(),
            workers: HashMap::new(),
            service_arena: Slab::new(),
            worker_arena: Slab::new(),
            waiting: HashSet::new(),
        }
    }

    /// Look up a service by name, creating an empty one if needed.
    /// Creation is silent and unbounded.
    pub fn service_require(&mut self, name: &str) -> ServiceId {
        if let Some(&sid) = self.services.get(name) {
            return sid;
        }
        let sid = ServiceId(self.service_arena.insert(Service {
            name: name.to_owned(),
            requests: VecDeque::new(),
            waiting: Vec::new(),
            workers: 0,
        }));
        self.services.insert(name.to_owned(), sid);
        debug!(service = name, "created service");
        sid
    }

    pub fn lookup_service(&self, name: &str) -> Option<ServiceId> {
        self.services.get(name).copied()
    }

    pub fn service(&self, sid: ServiceId) -> &Service {
        &self.service_arena[sid.0]
    }

    /// Look up a worker by identity, creating a blank record if needed.
    /// The flag reports whether the identity was already registered.
    pub fn worker_require(&mut self, identity: &PeerId) -> (WorkerId, bool) {
        if let Some(&wid) = self.workers.get(identity) {
            return (wid, true);
        }
        let wid = WorkerId(self.worker_arena.insert(Worker {
            identity: identity.clone(),
            service: None,
            expiry: Instant::now(),
        }));
        self.workers.insert(identity.clone(), wid);
        (wid, false)
    }

    pub fn worker_by_identity(&self, identity: &PeerId) -> Option<WorkerId> {
        self.workers.get(identity).copied()
    }

    pub fn worker(&self, wid: WorkerId) -> &Worker {
        &self.worker_arena[wid.0]
    }

    pub fn worker_mut(&mut self, wid: WorkerId) -> &mut Worker {
        &mut self.worker_arena[wid.0]
    }

    /// Attach a worker to its service. Only valid once, at READY.
    pub fn attach(&mut self, wid: WorkerId, sid: ServiceId) {
        let worker = &mut self.worker_arena[wid.0];
        debug_assert!(worker.service.is_none(), "worker attached twice");
        worker.service = Some(sid);
        self.service_arena[sid.0].workers += 1;
    }

    /// Unlink a worker from every table and destroy the record.
    pub fn delete_worker(&mut self, wid: WorkerId) -> Worker {
        let worker = self.worker_arena.remove(wid.0);
        self.workers.remove(&worker.identity);
        self.waiting.remove(&wid);
        if let Some(sid) = worker.service {
            let service = &mut self.service_arena[sid.0];
            service.waiting.retain(|w| *w != wid);
            service.workers -= 1;
        }
        worker
    }

    /// Mark a worker idle: broker waiting set, back of its service's
    /// waiting list, and a refreshed expiry.
    pub fn mark_waiting(&mut self, wid: WorkerId, expiry: Instant) {
        let worker = &mut self.worker_arena[wid.0];
        worker.expiry = expiry;
        let Some(sid) = worker.service else {
            return;
        };
        if self.waiting.insert(wid) {
            self.service_arena[sid.0].waiting.push(wid);
        }
    }

    /// Take a worker out of the waiting structures (it is now busy).
    pub fn unmark_waiting(&mut self, wid: WorkerId) {
        if self.waiting.remove(&wid) {
            if let Some(sid) = self.worker_arena[wid.0].service {
                self.service_arena[sid.0].waiting.retain(|w| *w != wid);
            }
        }
    }

    pub fn is_waiting(&self, wid: WorkerId) -> bool {
        self.waiting.contains(&wid)
    }

    /// Snapshot of the waiting set, for heartbeat fan-out and purge scans.
    pub fn waiting_ids(&self) -> Vec<WorkerId> {
        self.waiting.iter().copied().collect()
    }

    /// Waiting workers whose expiry has passed. Collect pass of the
    /// two-pass purge.
    pub fn expired(&self, now: Instant) -> Vec<WorkerId> {
        self.waiting
            .iter()
            .copied()
            .filter(|wid| self.worker_arena[wid.0].expiry <= now)
            .collect()
    }

    /// The waiting worker with the freshest heartbeat; ties go to the
    /// earliest entry in the waiting list.
    pub fn freshest_waiting(&self, sid: ServiceId) -> Option<WorkerId> {
        let mut best: Option<WorkerId> = None;
        for &wid in &self.service_arena[sid.0].waiting {
            let expiry = self.worker_arena[wid.0].expiry;
            match best {
                Some(current) if self.worker_arena[current.0].expiry >= expiry => {}
                _ => best = Some(wid),
            }
        }
        best
    }

    pub fn push_request(&mut self, sid: ServiceId, payload: Vec<Bytes>) {
        self.service_arena[sid.0].requests.push_back(payload);
    }

    pub fn pop_request(&mut self, sid: ServiceId) -> Option<Vec<Bytes>> {
        self.service_arena[sid.0].requests.pop_front()
    }

    pub fn worker_count(&self) -> usize {
        self.worker_arena.len()
    }

    /// Diagnostic snapshot for logging.
    pub fn summary(&self) -> serde_json::Value {
        let services: Vec<_> = self
            .service_arena
            .iter()
            .map(|(_, service)| {
                serde_json::json!({
                    "name": service.name,
                    "workers": service.workers,
                    "waiting": service.waiting.len(),
                    "queued": service.requests.len(),
                })
            })
            .collect();

        serde_json::json!({
            "services": services,
            "workers": self.worker_arena.len(),
            "waiting": self.waiting.len(),
        })
    }

    /// Cross-table consistency checks used by the test suites.
    #[cfg(test)]
    pub(crate) fn assert_invariants(&self) {
        for (key, &wid) in &self.workers {
            assert_eq!(
                self.worker_arena[wid.0].identity, *key,
                "worker table key must equal the record identity"
            );
        }
        assert_eq!(
            self.workers.len(),
            self.worker_arena.len(),
            "every arena worker must be indexed by identity"
        );

        let mut attached: HashMap<usize, usize> = HashMap::new();
        for (slot, worker) in self.worker_arena.iter() {
            if let Some(sid) = worker.service {
                *attached.entry(sid.0).or_default() += 1;
            }
            let wid = WorkerId(slot);
            let in_service_list = worker
                .service
                .map(|sid| self.service_arena[sid.0].waiting.contains(&wid))
                .unwrap_or(false);
            assert_eq!(
                self.waiting.contains(&wid),
                in_service_list,
                "waiting set and service waiting lists must agree"
            );
        }
        for (slot, service) in self.service_arena.iter() {
            assert_eq!(
                service.workers,
                attached.get(&slot).copied().unwrap_or(0),
                "worker_count must equal the number of attached workers"
            );
            assert!(
                service.waiting.len() <= service.workers,
                "a service cannot have more idle workers than workers"
            );
        }
    }
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use proptest::prelude::*;
    use std::time::Duration;

    fn peer(n: u8) -> PeerId {
        PeerId::from_routing_id(u32::from(n))
    }

    #[test]
    fn service_require_is_idempotent() {
        let mut registry = Registry::new();
        let a = registry.service_require("echo");
        let b = registry.service_require("echo");
        assert_eq!(a, b);
        assert_eq!(registry.service(a).name, "echo");
        registry.assert_invariants();
    }

    #[test]
    fn worker_require_reports_prior_registration() {
        let mut registry = Registry::new();
        let (first, present) = registry.worker_require(&peer(1));
        assert!(!present);
        let (second, present) = registry.worker_require(&peer(1));
        assert!(present);
        assert_eq!(first, second);
    }

    #[test]
    fn waiting_set_and_service_list_stay_in_sync() {
        let mut registry = Registry::new();
        let sid = registry.service_require("echo");
        let (wid, _) = registry.worker_require(&peer(1));
        registry.attach(wid, sid);

        registry.mark_waiting(wid, Instant::now());
        assert!(registry.is_waiting(wid));
        assert_eq!(registry.service(sid).waiting, vec![wid]);
        registry.assert_invariants();

        registry.unmark_waiting(wid);
        assert!(!registry.is_waiting(wid));
        assert!(registry.service(sid).waiting.is_empty());
        assert_eq!(registry.service(sid).workers, 1);
        registry.assert_invariants();
    }

    #[test]
    fn mark_waiting_twice_does_not_duplicate() {
        let mut registry = Registry::new();
        let sid = registry.service_require("echo");
        let (wid, _) = registry.worker_require(&peer(1));
        registry.attach(wid, sid);

        let now = Instant::now();
        registry.mark_waiting(wid, now);
        registry.mark_waiting(wid, now + Duration::from_millis(5));
        assert_eq!(registry.service(sid).waiting.len(), 1);
        registry.assert_invariants();
    }

    #[test]
    fn delete_unlinks_everywhere() {
        let mut registry = Registry::new();
        let sid = registry.service_require("echo");
        let (wid, _) = registry.worker_require(&peer(1));
        registry.attach(wid, sid);
        registry.mark_waiting(wid, Instant::now());

        let record = registry.delete_worker(wid);
        assert_eq!(record.identity, peer(1));
        assert_eq!(registry.worker_count(), 0);
        assert_eq!(registry.service(sid).workers, 0);
        assert!(registry.service(sid).waiting.is_empty());
        assert!(registry.worker_by_identity(&peer(1)).is_none());
        registry.assert_invariants();
    }

    #[test]
    fn freshest_waiting_prefers_latest_expiry() {
        let mut registry = Registry::new();
        let sid = registry.service_require("echo");
        let base = Instant::now();

        let (stale, _) = registry.worker_require(&peer(1));
        registry.attach(stale, sid);
        registry.mark_waiting(stale, base);

        let (fresh, _) = registry.worker_require(&peer(2));
        registry.attach(fresh, sid);
        registry.mark_waiting(fresh, base + Duration::from_millis(100));

        assert_eq!(registry.freshest_waiting(sid), Some(fresh));
    }

    #[test]
    fn freshest_waiting_breaks_ties_by_list_order() {
        let mut registry = Registry::new();
        let sid = registry.service_require("echo");
        let expiry = Instant::now();

        let (first, _) = registry.worker_require(&peer(1));
        registry.attach(first, sid);
        registry.mark_waiting(first, expiry);

        let (second, _) = registry.worker_require(&peer(2));
        registry.attach(second, sid);
        registry.mark_waiting(second, expiry);

        assert_eq!(registry.freshest_waiting(sid), Some(first));
    }

    #[test]
    fn requests_are_fifo() {
        let mut registry = Registry::new();
        let sid = registry.service_require("echo");
        registry.push_request(sid, vec![Bytes::from_static(b"one")]);
        registry.push_request(sid, vec![Bytes::from_static(b"two")]);

        assert_eq!(
            registry.pop_request(sid),
            Some(vec![Bytes::from_static(b"one")])
        );
        assert_eq!(
            registry.pop_request(sid),
            Some(vec![Bytes::from_static(b"two")])
        );
        assert_eq!(registry.pop_request(sid), None);
    }

    #[test]
    fn expired_scans_only_the_waiting_set() {
        let mut registry = Registry::new();
        let sid = registry.service_require("echo");
        let now = Instant::now();

        let (idle, _) = registry.worker_require(&peer(1));
        registry.attach(idle, sid);
        registry.mark_waiting(idle, now);

        // Busy worker: attached but not waiting; never purged.
        let (busy, _) = registry.worker_require(&peer(2));
        registry.attach(busy, sid);
        registry.worker_mut(busy).expiry = now;

        let expired = registry.expired(now + Duration::from_millis(1));
        assert_eq!(expired, vec![idle]);
    }

    #[test]
    fn summary_counts_state() {
        let mut registry = Registry::new();
        let sid = registry.service_require("echo");
        let (wid, _) = registry.worker_require(&peer(1));
        registry.attach(wid, sid);
        registry.mark_waiting(wid, Instant::now());
        registry.push_request(sid, vec![Bytes::from_static(b"x")]);

        let summary = registry.summary();
        assert_eq!(summary["workers"], 1);
        assert_eq!(summary["waiting"], 1);
        assert_eq!(summary["services"][0]["name"], "echo");
        assert_eq!(summary["services"][0]["queued"], 1);
    }

    // Random op sequences must never break the cross-table invariants.
    #[derive(Debug, Clone)]
    enum Op {
        Ready { peer: u8, service: u8 },
        MarkWaiting { peer: u8 },
        UnmarkWaiting { peer: u8 },
        Delete { peer: u8 },
        Purge,
    }

    fn op_strategy() -> impl Strategy<Value = Op> {
        prop_oneof![
            (0..8u8, 0..4u8).prop_map(|(peer, service)| Op::Ready { peer, service }),
            (0..8u8).prop_map(|peer| Op::MarkWaiting { peer }),
            (0..8u8).prop_map(|peer| Op::UnmarkWaiting { peer }),
            (0..8u8).prop_map(|peer| Op::Delete { peer }),
            Just(Op::Purge),
        ]
    }

    proptest! {
        #[test]
        fn invariants_hold_under_random_lifecycles(ops in proptest::collection::vec(op_strategy(), 1..60)) {
            let mut registry = Registry::new();
            let start = Instant::now();
            for (step, op) in ops.into_iter().enumerate() {
                let now = start + Duration::from_millis(step as u64);
                match op {
                    Op::Ready { peer: p, service } => {
                        let (wid, present) = registry.worker_require(&peer(p));
                        if present {
                            registry.delete_worker(wid);
                        } else {
                            let sid = registry.service_require(&format!("svc-{service}"));
                            registry.attach(wid, sid);
                            registry.mark_waiting(wid, now);
                        }
                    }
                    Op::MarkWaiting { peer: p } => {
                        if let Some(wid) = registry.worker_by_identity(&peer(p)) {
                            registry.mark_waiting(wid, now);
                        }
                    }
                    Op::UnmarkWaiting { peer: p } => {
                        if let Some(wid) = registry.worker_by_identity(&peer(p)) {
                            registry.unmark_waiting(wid);
                        }
                    }
                    Op::Delete { peer: p } => {
                        if let Some(wid) = registry.worker_by_identity(&peer(p)) {
                            registry.delete_worker(wid);
                        }
                    }
                    Op::Purge => {
                        for wid in registry.expired(now) {
                            registry.delete_worker(wid);
                        }
                    }
                }
                registry.assert_invariants();
            }
        }
    }
}
