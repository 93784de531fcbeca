//! Catalog change listener.
//!
//! Turns catalog notifications into pool invalidations. A saved record may
//! have changed anything a handle was built from, so every save clears the
//! record's cached handles and cascades to their dependents; a removal also
//! forgets the record's dependency edges.

use crate::catalog::{Change, CatalogEvent};
use crate::driver::Drivers;
use crate::pool::{PoolInner, ResourcePool};
use std::sync::Weak;
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::task::JoinHandle;

/// Invalidates a pool on catalog changes.
///
/// Holds the pool weakly: a listener never keeps a disposed or dropped pool
/// alive.
pub struct ChangeListener<D: Drivers> {
    pool: Weak<PoolInner<D>>,
}

impl<D: Drivers> Clone for ChangeListener<D> {
    fn clone(&self) -> Self {
        ChangeListener {
            pool: Weak::clone(&self.pool),
        }
    }
}

impl<D: Drivers> ChangeListener<D> {
    pub(crate) fn new(pool: &ResourcePool<D>) -> Self {
        ChangeListener {
            pool: pool.downgrade(),
        }
    }

    /// Apply one notification. Returns the number of cached entries cleared.
    pub fn on_event(&self, event: &CatalogEvent) -> usize {
        let Some(pool) = ResourcePool::upgrade(&self.pool) else {
            return 0;
        };
        if pool.is_disposed() {
            return 0;
        }

        let kind = event.record_kind.resource_kind();
        let cleared = pool.invalidate(kind, &event.identity);
        if event.change == Change::Removed {
            pool.forget(kind, &event.identity);
        }

        debug!(
            "Catalog {:?} of {:?} {} cleared {} entries",
            event.change, event.record_kind, event.identity, cleared
        );
        cleared
    }

    /// Consume `events` on a background task until the channel closes or the
    /// pool goes away.
    ///
    /// Missed notifications cannot be replayed, so a lagging receiver clears
    /// every catalog-derived handle instead.
    pub fn spawn(self, mut events: broadcast::Receiver<CatalogEvent>) -> JoinHandle<()> {
        tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Ok(event) => {
                        self.on_event(&event);
                    }
                    Err(RecvError::Lagged(missed)) => {
                        let Some(pool) = ResourcePool::upgrade(&self.pool) else {
                            break;
                        };
                        warn!(
                            "⚠ Change listener missed {} catalog events, clearing catalog-derived resources",
                            missed
                        );
                        pool.clear_catalog_resources();
                    }
                    Err(RecvError::Closed) => {
                        debug!("Catalog event channel closed, stopping change listener");
                        break;
                    }
                }

                if self.pool.strong_count() == 0 {
                    break;
                }
            }
        })
    }
}
