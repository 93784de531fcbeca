//! Exactly-once release of disposable handles.
//!
//! Handles are tracked by the address of their `Arc` allocation. The registry
//! keeps a clone of every tracked `Arc`, so an address cannot be reused while
//! its entry exists, and removing the entry from the map is the single atomic
//! step that decides which caller gets to run the disposer.

use crate::error::{DriverError, Error};
use crate::key::ResourceKey;
use crate::observability::PoolMetrics;
use dashmap::DashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Release function for one handle type.
pub type Disposer<H> = Arc<dyn Fn(&H) -> std::result::Result<(), DriverError> + Send + Sync>;

/// Identity of a tracked handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HandleId(usize);

impl HandleId {
    pub fn of<H>(handle: &Arc<H>) -> Self {
        HandleId(Arc::as_ptr(handle) as *const () as usize)
    }
}

trait Releasable: Send + Sync {
    /// Someone besides the registry still holds the handle.
    fn in_use(&self) -> bool;

    fn release(&self) -> std::result::Result<(), DriverError>;
}

struct TrackedHandle<H> {
    handle: Arc<H>,
    disposer: Disposer<H>,
}

impl<H: Send + Sync> Releasable for TrackedHandle<H> {
    fn in_use(&self) -> bool {
        Arc::strong_count(&self.handle) > 1
    }

    fn release(&self) -> std::result::Result<(), DriverError> {
        (self.disposer)(&self.handle)
    }
}

struct Tracked {
    key: ResourceKey,
    handle: Box<dyn Releasable>,
    /// Not cached; release once no caller holds it any more.
    deferred: bool,
}

/// Tracks disposable handles and releases each exactly once.
pub struct DisposalRegistry {
    tracked: DashMap<HandleId, Tracked>,
    shutting_down: AtomicBool,
    metrics: Arc<dyn PoolMetrics>,
}

impl DisposalRegistry {
    pub fn new(metrics: Arc<dyn PoolMetrics>) -> Self {
        DisposalRegistry {
            tracked: DashMap::new(),
            shutting_down: AtomicBool::new(false),
            metrics,
        }
    }

    /// Register `handle` for release by `disposer`.
    ///
    /// Returns `false` if the registry is already shutting down, in which case
    /// the handle has been released before returning.
    pub fn track<H>(&self, key: &ResourceKey, handle: &Arc<H>, disposer: Disposer<H>) -> bool
    where
        H: Send + Sync + 'static,
    {
        self.insert(key, handle, disposer, false);

        // dispose_all may have drained the map between our caller's shutdown
        // check and the insert above.
        if self.is_shutting_down() {
            self.release(HandleId::of(handle));
            return false;
        }
        true
    }

    /// Register a handle that is not cached and release it once every caller
    /// has dropped it.
    pub fn defer<H>(&self, key: &ResourceKey, handle: &Arc<H>, disposer: Disposer<H>)
    where
        H: Send + Sync + 'static,
    {
        self.insert(key, handle, disposer, true);
        debug!("Deferred disposal of {}", key);

        if self.is_shutting_down() {
            self.release(HandleId::of(handle));
        }
    }

    fn insert<H>(&self, key: &ResourceKey, handle: &Arc<H>, disposer: Disposer<H>, deferred: bool)
    where
        H: Send + Sync + 'static,
    {
        let tracked = Tracked {
            key: key.clone(),
            handle: Box::new(TrackedHandle {
                handle: Arc::clone(handle),
                disposer,
            }),
            deferred,
        };
        self.tracked.insert(HandleId::of(handle), tracked);
    }

    /// Switch a tracked handle to deferred release, e.g. after eviction.
    pub fn release_when_idle<H>(&self, handle: &Arc<H>) {
        if let Some(mut tracked) = self.tracked.get_mut(&HandleId::of(handle)) {
            tracked.deferred = true;
        }
    }

    /// Release `handle` if it is still tracked. Later calls are no-ops.
    pub fn dispose_once<H>(&self, handle: &Arc<H>) -> bool {
        self.release(HandleId::of(handle))
    }

    fn release(&self, id: HandleId) -> bool {
        let Some((_, tracked)) = self.tracked.remove(&id) else {
            return false;
        };

        match tracked.handle.release() {
            Ok(()) => {
                debug!("✓ Disposed {}", tracked.key);
            }
            Err(e) => {
                let err = Error::DisposalFailed {
                    key: tracked.key.clone(),
                    message: e.to_string(),
                };
                warn!("⚠ {}", err);
            }
        }
        self.metrics.record_disposal(tracked.key.kind());
        true
    }

    /// Release deferred handles nobody holds any more.
    pub fn sweep(&self) -> usize {
        let idle: Vec<HandleId> = self
            .tracked
            .iter()
            .filter(|entry| entry.deferred && !entry.handle.in_use())
            .map(|entry| *entry.key())
            .collect();

        idle.into_iter().filter(|id| self.release(*id)).count()
    }

    /// Stop accepting handles. Returns `true` for the call that flipped the
    /// flag.
    pub fn begin_shutdown(&self) -> bool {
        !self.shutting_down.swap(true, Ordering::SeqCst)
    }

    /// Stop accepting handles and release everything still tracked.
    pub fn dispose_all(&self) -> usize {
        self.begin_shutdown();

        let ids: Vec<HandleId> = self.tracked.iter().map(|entry| *entry.key()).collect();
        let released = ids.into_iter().filter(|id| self.release(*id)).count();

        if released > 0 {
            info!("✓ Disposed {} tracked handles", released);
        }
        released
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::SeqCst)
    }

    pub fn is_tracked<H>(&self, handle: &Arc<H>) -> bool {
        self.tracked.contains_key(&HandleId::of(handle))
    }

    /// Number of tracked handles, deferred ones included.
    pub fn len(&self) -> usize {
        self.tracked.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tracked.is_empty()
    }
}
