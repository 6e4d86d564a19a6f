//! Work unit cache: at most one active validation per message identity.
//!
//! The first sighting of an identity creates a pending [`WorkUnit`] and
//! runs the pipeline; every concurrent sighting attaches to the same unit and
//! awaits its verdict. Resolved units stay cached so re-gossiped duplicates
//! short-circuit, until they are evicted.
//!
//! # Design
//!
//! Each unit is a settle-once cell over a `tokio::sync::watch` channel
//! holding `Option<Verdict>`. A waiter subscribes and waits for `Some`; the
//! watch channel always exposes the latest value, so a waiter that attaches
//! after resolution sees it immediately and one that attaches before is
//! woken. Resolution only ever transitions `None → Some`.
//!
//! Resolved units are evicted in resolution order once more than
//! `capacity` are held or they are older than `ttl`. Pending units are never
//! evicted.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};

use braid_core::error::RejectReason;
use braid_core::types::MessageId;
use libp2p::PeerId;
use parking_lot::Mutex;
use tokio::sync::watch;

/// Final outcome of processing one message identity.
#[derive(Debug, Clone, PartialEq)]
pub enum Verdict {
    /// Validated and stored (possibly unsolid).
    Accepted,
    /// Terminally rejected.
    Rejected(RejectReason),
}

impl Verdict {
    pub fn is_accepted(&self) -> bool {
        matches!(self, Self::Accepted)
    }
}

/// Ephemeral processing state for one message identity.
#[derive(Debug)]
pub struct WorkUnit {
    id: MessageId,
    state: watch::Sender<Option<Verdict>>,
    /// Peers that delivered this identity.
    sources: Mutex<Vec<PeerId>>,
}

impl WorkUnit {
    fn new(id: MessageId) -> Self {
        let (state, _) = watch::channel(None);
        Self {
            id,
            state,
            sources: Mutex::new(Vec::new()),
        }
    }

    pub fn id(&self) -> MessageId {
        self.id
    }

    /// Settle the unit. Returns `false` (and changes nothing) if already resolved.
    pub fn resolve(&self, verdict: Verdict) -> bool {
        let mut verdict = Some(verdict);
        self.state.send_if_modified(|state| {
            if state.is_some() {
                return false;
            }
            *state = verdict.take();
            true
        })
    }

    /// The verdict, if resolved.
    pub fn verdict(&self) -> Option<Verdict> {
        self.state.borrow().clone()
    }

    pub fn is_pending(&self) -> bool {
        self.state.borrow().is_none()
    }

    /// Wait for the verdict.
    pub async fn wait(&self) -> Verdict {
        let mut rx = self.state.subscribe();
        let settled = match rx.wait_for(Option::is_some).await {
            Ok(state) => (*state).clone(),
            Err(_) => None,
        };
        settled.unwrap_or(Verdict::Rejected(RejectReason::Abandoned))
    }

    /// Record a peer that delivered this identity.
    pub fn add_source(&self, peer: PeerId) {
        let mut sources = self.sources.lock();
        if !sources.contains(&peer) {
            sources.push(peer);
        }
    }

    pub fn sources(&self) -> Vec<PeerId> {
        self.sources.lock().clone()
    }
}

struct CacheInner {
    units: HashMap<MessageId, Arc<WorkUnit>>,
    /// Resolved units in resolution order.
    resolved: VecDeque<(Instant, Arc<WorkUnit>)>,
}

/// Identity → work unit map with bounded retention of resolved units.
pub struct WorkUnitCache {
    inner: Mutex<CacheInner>,
    capacity: usize,
    ttl: Duration,
}

impl WorkUnitCache {
    pub fn new(capacity: usize, ttl: Duration) -> Self {
        Self {
            inner: Mutex::new(CacheInner {
                units: HashMap::new(),
                resolved: VecDeque::new(),
            }),
            capacity,
            ttl,
        }
    }

    /// Return the unit for `id`, creating a pending one if none exists.
    ///
    /// The boolean is `true` when the caller created the unit and is
    /// therefore responsible for resolving it.
    pub fn get_or_create(&self, id: MessageId) -> (Arc<WorkUnit>, bool) {
        let mut inner = self.inner.lock();
        Self::evict(&mut inner, self.capacity, self.ttl, Instant::now());
        if let Some(unit) = inner.units.get(&id) {
            return (Arc::clone(unit), false);
        }
        let unit = Arc::new(WorkUnit::new(id));
        inner.units.insert(id, Arc::clone(&unit));
        (unit, true)
    }

    /// Resolve `unit` and make it eligible for eviction.
    ///
    /// Returns `false` if the unit was already resolved.
    pub fn resolve(&self, unit: &Arc<WorkUnit>, verdict: Verdict) -> bool {
        if !unit.resolve(verdict) {
            return false;
        }
        let mut inner = self.inner.lock();
        let now = Instant::now();
        inner.resolved.push_back((now, Arc::clone(unit)));
        Self::evict(&mut inner, self.capacity, self.ttl, now);
        true
    }

    /// Look up a unit without creating one.
    pub fn get(&self, id: &MessageId) -> Option<Arc<WorkUnit>> {
        self.inner.lock().units.get(id).cloned()
    }

    /// Number of units held (pending and resolved).
    pub fn len(&self) -> usize {
        self.inner.lock().units.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().units.is_empty()
    }

    /// Number of pending units.
    pub fn pending(&self) -> usize {
        let inner = self.inner.lock();
        inner.units.len().saturating_sub(inner.resolved.len())
    }

    fn evict(inner: &mut CacheInner, capacity: usize, ttl: Duration, now: Instant) {
        while let Some((resolved_at, unit)) = inner.resolved.front() {
            let expired = now.duration_since(*resolved_at) >= ttl;
            if !expired && inner.resolved.len() <= capacity {
                break;
            }
            let id = unit.id();
            let same = inner.units.get(&id).is_some_and(|held| Arc::ptr_eq(held, unit));
            if same {
                inner.units.remove(&id);
            }
            inner.resolved.pop_front();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(seed: u8) -> MessageId {
        MessageId([seed; 32])
    }

    fn cache() -> WorkUnitCache {
        WorkUnitCache::new(100, Duration::from_secs(60))
    }

    #[test]
    fn first_sighting_creates() {
        let cache = cache();
        let (_, created) = cache.get_or_create(id(1));
        assert!(created);
        let (_, created_again) = cache.get_or_create(id(1));
        assert!(!created_again);
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn concurrent_sightings_share_unit() {
        let cache = cache();
        let (a, _) = cache.get_or_create(id(1));
        let (b, _) = cache.get_or_create(id(1));
        assert!(Arc::ptr_eq(&a, &b));
    }

    #[test]
    fn resolution_is_settle_once() {
        let cache = cache();
        let (unit, _) = cache.get_or_create(id(1));
        assert!(cache.resolve(&unit, Verdict::Accepted));
        let second = Verdict::Rejected(RejectReason::Abandoned);
        assert!(!cache.resolve(&unit, second));
        assert_eq!(unit.verdict(), Some(Verdict::Accepted));
    }

    #[test]
    fn pending_units_survive_eviction_pressure() {
        let cache = WorkUnitCache::new(1, Duration::ZERO);
        let (pending, _) = cache.get_or_create(id(1));
        for seed in 2..10 {
            let (unit, _) = cache.get_or_create(id(seed));
            cache.resolve(&unit, Verdict::Accepted);
        }
        assert!(pending.is_pending());
        assert!(Arc::ptr_eq(&cache.get(&id(1)).unwrap(), &pending));
    }

    #[test]
    fn capacity_evicts_oldest_resolved() {
        let cache = WorkUnitCache::new(2, Duration::from_secs(60));
        for seed in 1..=3 {
            let (unit, _) = cache.get_or_create(id(seed));
            cache.resolve(&unit, Verdict::Accepted);
        }
        assert!(cache.get(&id(1)).is_none());
        assert!(cache.get(&id(2)).is_some());
        assert!(cache.get(&id(3)).is_some());
    }

    #[test]
    fn ttl_expires_resolved_units() {
        let cache = WorkUnitCache::new(100, Duration::ZERO);
        let (unit, _) = cache.get_or_create(id(1));
        cache.resolve(&unit, Verdict::Accepted);
        let (_, created) = cache.get_or_create(id(1));
        assert!(created, "expired unit should be recreated");
    }

    #[test]
    fn eviction_does_not_remove_newer_unit() {
        let cache = WorkUnitCache::new(100, Duration::ZERO);
        let (old, _) = cache.get_or_create(id(1));
        cache.resolve(&old, Verdict::Accepted);
        // The expired unit is replaced by a new pending one on lookup.
        let (fresh, created) = cache.get_or_create(id(1));
        assert!(created);
        let (other, _) = cache.get_or_create(id(2));
        cache.resolve(&other, Verdict::Accepted);
        assert!(Arc::ptr_eq(&cache.get(&id(1)).unwrap(), &fresh));
    }

    #[test]
    fn sources_are_deduplicated() {
        let cache = cache();
        let (unit, _) = cache.get_or_create(id(1));
        let peer = PeerId::random();
        unit.add_source(peer);
        unit.add_source(peer);
        unit.add_source(PeerId::random());
        assert_eq!(unit.sources().len(), 2);
    }

    #[tokio::test]
    async fn waiter_after_resolution_sees_verdict() {
        let cache = cache();
        let (unit, _) = cache.get_or_create(id(1));
        cache.resolve(&unit, Verdict::Accepted);
        assert_eq!(unit.wait().await, Verdict::Accepted);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn all_waiters_observe_resolution() {
        let cache = Arc::new(cache());
        let (unit, _) = cache.get_or_create(id(1));

        let mut waiters = Vec::new();
        for _ in 0..16 {
            let cache = Arc::clone(&cache);
            waiters.push(tokio::spawn(async move {
                let (unit, created) = cache.get_or_create(id(1));
                assert!(!created);
                unit.wait().await
            }));
        }

        let reason = RejectReason::Stale { distance: 20, window: 15 };
        tokio::task::yield_now().await;
        cache.resolve(&unit, Verdict::Rejected(reason.clone()));

        for waiter in waiters {
            assert_eq!(waiter.await.unwrap(), Verdict::Rejected(reason.clone()));
        }
    }
}
