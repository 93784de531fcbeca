//! Single-flight cache for one resource kind.
//!
//! Each key maps to exactly one slot: either a pending construction shared by
//! every caller that asked for the key while it runs, or a ready handle. The
//! table step (install pending, swap to ready, remove) happens under the
//! key's shard lock; the constructor itself always runs outside of it, so a
//! slow construction never blocks unrelated keys.
//!
//! Constructions run on their own tokio task and are awaited through a
//! `futures::future::Shared` handle. A waiter that gives up (timeout,
//! cancelled request) simply drops its clone; the construction keeps going and
//! its result is still cached. A constructor that panics settles its flight
//! with `Error::ConstructionFailed` like any other failure.
//!
//! Recency is kept in an ordered index of `tick -> key`. Hits only bump the
//! slot's atomic tick; the index is corrected lazily when eviction looks at a
//! candidate whose tick has moved on.

use crate::disposal::{DisposalRegistry, Disposer};
use crate::error::{Error, Result};
use crate::key::{RecordId, ResourceKey, ResourceKind};
use crate::observability::PoolMetrics;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use futures::future::{BoxFuture, FutureExt, Shared};
use parking_lot::Mutex;
use std::any::Any;
use std::collections::BTreeMap;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::Instant;

type Construction<H> = Shared<BoxFuture<'static, Result<Arc<H>>>>;

struct Flight<H> {
    id: u64,
    construction: Construction<H>,
    /// Invalidated while running: the result is handed to the callers that
    /// were already waiting, but never cached.
    doomed: bool,
}

struct Ready<H> {
    handle: Arc<H>,
    last_used: AtomicU64,
}

enum Slot<H> {
    Pending(Flight<H>),
    Ready(Ready<H>),
}

impl<H> Slot<H> {
    fn is_flight(&self, id: u64) -> bool {
        matches!(self, Slot::Pending(flight) if flight.id == id)
    }
}

enum Placement {
    Cached(u64),
    Superseded,
    Shutdown,
}

struct CacheInner<H> {
    kind: ResourceKind,
    table: DashMap<ResourceKey, Slot<H>>,
    capacity: usize,
    ready: AtomicUsize,
    /// Source of flight ids and recency ticks.
    clock: AtomicU64,
    /// Ready keys by the tick they were last indexed at. May hold stale
    /// entries; a slot's own `last_used` is authoritative.
    recency: Mutex<BTreeMap<u64, ResourceKey>>,
    disposer: Option<Disposer<H>>,
    registry: Arc<DisposalRegistry>,
    metrics: Arc<dyn PoolMetrics>,
}

/// Handle cache with at most one construction in flight per key.
///
/// Cloning is cheap and yields another view of the same table.
pub struct SingleFlightCache<H> {
    inner: Arc<CacheInner<H>>,
}

impl<H> Clone for SingleFlightCache<H> {
    fn clone(&self) -> Self {
        SingleFlightCache {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<H: Send + Sync + 'static> SingleFlightCache<H> {
    /// Create a cache holding at most `capacity` ready handles.
    ///
    /// Handles of kinds that need an explicit release call get a `disposer`;
    /// pure value kinds pass `None` and are never tracked.
    pub fn new(
        kind: ResourceKind,
        capacity: usize,
        disposer: Option<Disposer<H>>,
        registry: Arc<DisposalRegistry>,
        metrics: Arc<dyn PoolMetrics>,
    ) -> Self {
        SingleFlightCache {
            inner: Arc::new(CacheInner {
                kind,
                table: DashMap::new(),
                capacity: capacity.max(1),
                ready: AtomicUsize::new(0),
                clock: AtomicU64::new(1),
                recency: Mutex::new(BTreeMap::new()),
                disposer,
                registry,
                metrics,
            }),
        }
    }

    pub fn kind(&self) -> ResourceKind {
        self.inner.kind
    }

    /// Return the cached handle for `key`, building it with `construct` on a
    /// miss.
    ///
    /// Concurrent callers for the same key share one construction and all
    /// observe the same handle or the same error. Failed constructions are
    /// not retained. A caller arriving after the key was cleared while a
    /// construction was pending waits for that construction to finish and
    /// then builds afresh.
    ///
    /// The construction is spawned on the current Tokio runtime, so dropping
    /// this future does not stop it.
    ///
    /// # Errors
    ///
    /// - `Error::PoolShutdown`: the pool is being disposed
    /// - `Error::ConstructionFailed`: `construct` panicked
    /// - whatever `construct` fails with, typically `Error::ConstructionFailed`
    pub async fn get<F, Fut>(&self, key: &ResourceKey, construct: F) -> Result<Arc<H>>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<H>> + Send + 'static,
    {
        if self.inner.registry.is_shutting_down() {
            return Err(Error::PoolShutdown);
        }
        if let Some(handle) = self.lookup_ready(key) {
            self.inner.metrics.record_hit(self.inner.kind);
            return Ok(handle);
        }

        let construction = loop {
            if self.inner.registry.is_shutting_down() {
                return Err(Error::PoolShutdown);
            }

            let (pending, stale) = match self.inner.table.entry(key.clone()) {
                Entry::Occupied(occupied) => match occupied.get() {
                    Slot::Ready(ready) => {
                        ready.last_used.store(self.inner.tick(), Ordering::Relaxed);
                        self.inner.metrics.record_hit(self.inner.kind);
                        return Ok(Arc::clone(&ready.handle));
                    }
                    Slot::Pending(flight) => (flight.construction.clone(), flight.doomed),
                },
                Entry::Vacant(vacant) => {
                    let flight = CacheInner::start(&self.inner, key, construct);
                    let construction = flight.construction.clone();
                    vacant.insert(Slot::Pending(flight));
                    break construction;
                }
            };

            debug!("Waiting on pending construction of {}", key);
            let outcome = pending.await;
            if !stale {
                return outcome;
            }
            debug!("Construction of {} was invalidated while pending, rebuilding", key);
        };

        self.inner.metrics.record_miss(self.inner.kind);
        debug!("✗ Cache miss for {}, constructing", key);
        construction.await
    }

    /// Build a handle that is never cached, for records without identity.
    ///
    /// Disposable handles are released once the caller drops the last
    /// reference, or at shutdown.
    pub async fn construct_uncached<Fut>(&self, label: &str, construct: Fut) -> Result<Arc<H>>
    where
        Fut: Future<Output = Result<H>> + Send,
    {
        if self.inner.registry.is_shutting_down() {
            return Err(Error::PoolShutdown);
        }
        // Release uncached handles dropped since the last lookup.
        self.inner.registry.sweep();

        let handle = Arc::new(construct.await?);
        if let Some(disposer) = &self.inner.disposer {
            let key = ResourceKey::new(self.inner.kind, RecordId::from(label))
                .with_variant("transient");
            self.inner
                .registry
                .defer(&key, &handle, Arc::clone(disposer));
        }
        debug!("Built uncached {} handle for {}", self.inner.kind, label);
        Ok(handle)
    }

    fn lookup_ready(&self, key: &ResourceKey) -> Option<Arc<H>> {
        let slot = self.inner.table.get(key)?;
        match slot.value() {
            Slot::Ready(ready) => {
                ready.last_used.store(self.inner.tick(), Ordering::Relaxed);
                Some(Arc::clone(&ready.handle))
            }
            Slot::Pending(_) => None,
        }
    }

    /// Peek at a ready handle without building or touching recency.
    pub fn get_if_present(&self, key: &ResourceKey) -> Option<Arc<H>> {
        match self.inner.table.get(key)?.value() {
            Slot::Ready(ready) => Some(Arc::clone(&ready.handle)),
            Slot::Pending(_) => None,
        }
    }

    /// Whether a ready handle is cached for `key`.
    pub fn contains(&self, key: &ResourceKey) -> bool {
        self.get_if_present(key).is_some()
    }

    /// Whether a construction is currently running for `key`.
    pub fn is_pending(&self, key: &ResourceKey) -> bool {
        matches!(
            self.inner.table.get(key).as_deref(),
            Some(Slot::Pending(_))
        )
    }

    /// Remove the entry for `key`.
    ///
    /// A ready handle is returned to the caller for disposal. A pending
    /// construction is flagged instead: its result goes to the callers already
    /// waiting on it and is then released, never cached. Never blocks on
    /// pending work.
    pub fn clear(&self, key: &ResourceKey) -> Option<Arc<H>> {
        let Entry::Occupied(mut occupied) = self.inner.table.entry(key.clone()) else {
            return None;
        };

        if let Slot::Pending(flight) = occupied.get_mut() {
            flight.doomed = true;
            debug!("Flagged pending construction of {} for disposal", key);
            return None;
        }

        match occupied.remove() {
            Slot::Ready(ready) => {
                self.inner.ready.fetch_sub(1, Ordering::SeqCst);
                debug!("Cleared {}", key);
                Some(ready.handle)
            }
            Slot::Pending(_) => None,
        }
    }

    /// Clear every variant cached for a record identity.
    pub fn clear_record(&self, identity: &RecordId) -> Vec<(ResourceKey, Arc<H>)> {
        let root = ResourceKey::new(self.inner.kind, identity.clone());
        self.clear_matching(|key| key.same_record(&root))
    }

    /// Clear every entry, flagging pending constructions.
    pub fn drain(&self) -> Vec<(ResourceKey, Arc<H>)> {
        self.clear_matching(|_| true)
    }

    fn clear_matching(&self, filter: impl Fn(&ResourceKey) -> bool) -> Vec<(ResourceKey, Arc<H>)> {
        let keys: Vec<ResourceKey> = self
            .inner
            .table
            .iter()
            .map(|entry| entry.key().clone())
            .filter(|key| filter(key))
            .collect();

        keys.into_iter()
            .filter_map(|key| self.clear(&key).map(|handle| (key, handle)))
            .collect()
    }

    /// Number of ready handles.
    pub fn len(&self) -> usize {
        self.inner.ready.load(Ordering::SeqCst)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of constructions in flight.
    pub fn pending(&self) -> usize {
        self.inner
            .table
            .iter()
            .filter(|entry| matches!(entry.value(), Slot::Pending(_)))
            .count()
    }

    pub fn capacity(&self) -> usize {
        self.inner.capacity
    }
}

impl<H: Send + Sync + 'static> CacheInner<H> {
    fn tick(&self) -> u64 {
        self.clock.fetch_add(1, Ordering::Relaxed)
    }

    fn start<F, Fut>(this: &Arc<Self>, key: &ResourceKey, construct: F) -> Flight<H>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<H>> + Send + 'static,
    {
        let id = this.tick();
        // Weak: the flight lives inside the table it would otherwise keep alive.
        let cache: Weak<Self> = Arc::downgrade(this);
        let key = key.clone();

        // Spawned so the construction finishes even when every waiter leaves.
        let task = {
            let cache = Weak::clone(&cache);
            let key = key.clone();
            tokio::spawn(async move {
                let started = Instant::now();
                let outcome = match AssertUnwindSafe(async move { construct().await })
                    .catch_unwind()
                    .await
                {
                    Ok(outcome) => outcome,
                    Err(payload) => Err(Error::ConstructionFailed {
                        key: key.clone(),
                        message: format!(
                            "constructor panicked: {}",
                            panic_message(payload.as_ref())
                        ),
                    }),
                };
                match cache.upgrade() {
                    Some(cache) => cache.complete(&key, id, outcome, started),
                    None => outcome.map(Arc::new),
                }
            })
        };

        let construction = async move {
            match task.await {
                Ok(settled) => settled,
                Err(joined) => {
                    // Only reachable when the runtime drops the task.
                    if let Some(cache) = cache.upgrade() {
                        cache.table.remove_if(&key, |_, slot| slot.is_flight(id));
                    }
                    Err(Error::ConstructionFailed {
                        key,
                        message: joined.to_string(),
                    })
                }
            }
        }
        .boxed()
        .shared();

        Flight {
            id,
            construction,
            doomed: false,
        }
    }

    /// Settle flight `id` for `key`. Runs exactly once per flight, on the
    /// construction task.
    fn complete(
        &self,
        key: &ResourceKey,
        id: u64,
        outcome: Result<H>,
        started: Instant,
    ) -> Result<Arc<H>> {
        let handle = match outcome {
            Ok(handle) => Arc::new(handle),
            Err(err) => {
                self.table.remove_if(key, |_, slot| slot.is_flight(id));
                warn!("✗ Construction of {} failed: {}", key, err);
                self.metrics.record_failure(self.kind, &err.to_string());
                return Err(err);
            }
        };
        self.metrics
            .record_construction(self.kind, started.elapsed());

        let placement = match self.table.entry(key.clone()) {
            Entry::Occupied(mut occupied) if occupied.get().is_flight(id) => {
                let doomed = matches!(occupied.get(), Slot::Pending(flight) if flight.doomed);
                if doomed && !self.registry.is_shutting_down() {
                    occupied.remove();
                    Placement::Superseded
                } else if !self.track(key, &handle) {
                    occupied.remove();
                    Placement::Shutdown
                } else {
                    let tick = self.tick();
                    occupied.insert(Slot::Ready(Ready {
                        handle: Arc::clone(&handle),
                        last_used: AtomicU64::new(tick),
                    }));
                    self.ready.fetch_add(1, Ordering::SeqCst);
                    Placement::Cached(tick)
                }
            }
            _ if self.registry.is_shutting_down() => {
                self.track(key, &handle);
                Placement::Shutdown
            }
            _ => Placement::Superseded,
        };

        match placement {
            Placement::Cached(tick) => {
                info!("✓ Built {} in {:?}", key, started.elapsed());
                self.index(tick, key);
                self.evict_overflow();
                Ok(handle)
            }
            Placement::Superseded => {
                debug!("Built {} after it was invalidated, not caching", key);
                if let Some(disposer) = &self.disposer {
                    self.registry.defer(key, &handle, Arc::clone(disposer));
                    self.registry.sweep();
                }
                Ok(handle)
            }
            Placement::Shutdown => {
                debug!("Built {} during shutdown, released", key);
                Err(Error::PoolShutdown)
            }
        }
    }

    /// Hand a fresh handle to the disposal registry. `false` means the pool is
    /// shutting down and the handle must not be cached.
    fn track(&self, key: &ResourceKey, handle: &Arc<H>) -> bool {
        match &self.disposer {
            Some(disposer) => self.registry.track(key, handle, Arc::clone(disposer)),
            None => !self.registry.is_shutting_down(),
        }
    }

    /// Record a ready key in the recency index, rebuilding the index from the
    /// table once stale entries outnumber live ones.
    ///
    /// Never called with a shard lock held: eviction takes the index lock
    /// first and the table second.
    fn index(&self, tick: u64, key: &ResourceKey) {
        let mut recency = self.recency.lock();
        recency.insert(tick, key.clone());

        if recency.len() > self.capacity.saturating_mul(2) + 16 {
            *recency = self
                .table
                .iter()
                .filter_map(|entry| match entry.value() {
                    Slot::Ready(ready) => {
                        Some((ready.last_used.load(Ordering::Relaxed), entry.key().clone()))
                    }
                    Slot::Pending(_) => None,
                })
                .collect();
            debug!("Rebuilt {} recency index ({} entries)", self.kind, recency.len());
        }
    }

    /// Current tick of a ready slot.
    fn last_used(&self, key: &ResourceKey) -> Option<u64> {
        match self.table.get(key).as_deref() {
            Some(Slot::Ready(ready)) => Some(ready.last_used.load(Ordering::Relaxed)),
            _ => None,
        }
    }

    /// Push least recently used handles out until the table fits capacity.
    ///
    /// The oldest index entry is only a candidate: if its slot was touched
    /// since, it goes back in under the newer tick. Every ready slot is
    /// indexed at or below its `last_used`, so the first candidate whose tick
    /// still matches is the true LRU entry.
    ///
    /// Evicted handles may still be in a caller's hands, so their release is
    /// deferred until the last reference is gone.
    fn evict_overflow(&self) {
        while self.ready.load(Ordering::SeqCst) > self.capacity {
            let Some((tick, candidate)) = self.recency.lock().pop_first() else {
                break;
            };

            match self.last_used(&candidate) {
                // Cleared or rebuilding; a new entry comes with the next insert.
                None => continue,
                Some(current) if current != tick => {
                    self.recency.lock().insert(current, candidate);
                    continue;
                }
                Some(_) => {}
            }

            let removed = self.table.remove_if(&candidate, |_, slot| {
                matches!(slot, Slot::Ready(ready) if ready.last_used.load(Ordering::Relaxed) == tick)
            });
            match removed {
                Some((_, Slot::Ready(ready))) => {
                    self.ready.fetch_sub(1, Ordering::SeqCst);
                    self.registry.release_when_idle(&ready.handle);
                    self.metrics.record_eviction(self.kind);
                    debug!("Evicted {} (capacity {})", candidate, self.capacity);
                }
                _ => {
                    // Touched between the check and the removal.
                    if let Some(current) = self.last_used(&candidate) {
                        self.recency.lock().insert(current, candidate);
                    }
                }
            }
        }
        self.registry.sweep();
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    payload
        .downcast_ref::<&str>()
        .map(|message| message.to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic payload".to_string())
}
