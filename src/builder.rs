//! Builder for configured resource pools.

use crate::catalog::{Catalog, InMemoryCatalog};
use crate::config::PoolConfig;
use crate::driver::Drivers;
use crate::error::Result;
use crate::observability::{NoOpMetrics, PoolMetrics};
use crate::pool::ResourcePool;
use std::sync::Arc;

/// Fluent builder for a [`ResourcePool`].
///
/// Provides chainable methods to set the catalog, capacities and metrics.
///
/// # Example
///
/// ```ignore
/// let pool = ResourcePool::builder(PostgisDrivers::new())
///     .with_catalog(catalog.clone())
///     .with_config(PoolConfig::from_env()?)
///     .with_metrics(Arc::new(PrometheusMetrics::new()))
///     .build()?;
/// ```
pub struct ResourcePoolBuilder<D: Drivers> {
    drivers: D,
    catalog: Option<Arc<dyn Catalog>>,
    config: PoolConfig,
    metrics: Arc<dyn PoolMetrics>,
}

impl<D: Drivers> ResourcePoolBuilder<D> {
    /// Create a new builder with default settings.
    pub fn new(drivers: D) -> Self {
        Self {
            drivers,
            catalog: None,
            config: PoolConfig::default(),
            metrics: Arc::new(NoOpMetrics),
        }
    }

    /// Set the catalog used to resolve a schema's store and to disable
    /// failing stores.
    ///
    /// Without one the pool gets an empty [`InMemoryCatalog`].
    pub fn with_catalog(mut self, catalog: Arc<dyn Catalog>) -> Self {
        self.catalog = Some(catalog);
        self
    }

    /// Replace the configuration.
    ///
    /// # Example
    ///
    /// ```ignore
    /// builder.with_config(PoolConfig { schema_capacity: 500, ..Default::default() })
    /// ```
    pub fn with_config(mut self, config: PoolConfig) -> Self {
        self.config = config;
        self
    }

    /// Report hits, misses and constructions to `metrics`.
    pub fn with_metrics(mut self, metrics: Arc<dyn PoolMetrics>) -> Self {
        self.metrics = metrics;
        self
    }

    /// Validate the configuration and create the pool.
    ///
    /// # Errors
    ///
    /// Returns `Error::ConfigError` if a capacity is zero
    pub fn build(self) -> Result<ResourcePool<D>> {
        self.config.validate()?;
        let catalog = self
            .catalog
            .unwrap_or_else(|| Arc::new(InMemoryCatalog::new()));
        Ok(ResourcePool::from_parts(
            self.drivers,
            catalog,
            self.config,
            self.metrics,
        ))
    }
}
