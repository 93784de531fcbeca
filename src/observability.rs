//! Metrics hooks for pool activity.

use crate::key::ResourceKind;
use std::time::Duration;

/// Receives pool events for export to a metrics backend.
///
/// Every method has a no-op default, so implementors pick what they need.
pub trait PoolMetrics: Send + Sync {
    /// A ready handle was returned without construction.
    fn record_hit(&self, _kind: ResourceKind) {}

    /// A request started a new construction.
    fn record_miss(&self, _kind: ResourceKind) {}

    /// A construction succeeded.
    fn record_construction(&self, _kind: ResourceKind, _elapsed: Duration) {}

    /// A construction failed.
    fn record_failure(&self, _kind: ResourceKind, _message: &str) {}

    /// A ready handle was pushed out by the capacity bound.
    fn record_eviction(&self, _kind: ResourceKind) {}

    /// A tracked handle was released.
    fn record_disposal(&self, _kind: ResourceKind) {}
}

/// Default metrics sink that discards everything.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoOpMetrics;

impl PoolMetrics for NoOpMetrics {}
