//! # resource-pool
//!
//! A concurrent broker for expensive handles built from catalog records:
//! live store connections, feature-type schemas and their attribute lists,
//! parsed styles, coordinate reference systems and raster readers.
//!
//! ## Features
//!
//! - **Single-flight:** concurrent requests for the same record share one construction
//! - **Identity-stable:** an unchanged record always yields the same `Arc`
//! - **Change-driven:** catalog saves and removals clear affected handles, cascading to dependents
//! - **Exactly-once disposal:** connections and readers are released once, on clear, eviction or shutdown
//! - **Pluggable:** backends implement [`Drivers`], catalogs implement [`Catalog`]
//!
//! ## Quick Start
//!
//! ```ignore
//! use resource_pool::{InMemoryCatalog, ResourcePool, SchemaHints, SchemaRecord, StoreRecord};
//! use std::sync::Arc;
//!
//! // 1. Implement Drivers for your backends
//! struct PostgisDrivers;
//!
//! // 2. Create the pool and follow the catalog
//! let catalog = Arc::new(InMemoryCatalog::new());
//! let pool = ResourcePool::new(PostgisDrivers, catalog.clone());
//! pool.listener().spawn(catalog.subscribe());
//!
//! // 3. Ask for handles
//! catalog.save_store(StoreRecord::new("42", "lakes_db", "postgis"))?;
//! let lakes = SchemaRecord::new("ft-1", "lakes", "42");
//! let schema = pool.schema(&lakes, SchemaHints::default()).await?;
//! ```

#[macro_use]
extern crate log;

pub mod builder;
pub mod cache;
pub mod catalog;
pub mod config;
pub mod disposal;
pub mod driver;
pub mod env;
pub mod error;
pub mod graph;
pub mod key;
pub mod listener;
pub mod observability;
pub mod pool;
pub mod record;

// Re-exports for convenience
pub use builder::ResourcePoolBuilder;
pub use catalog::{Catalog, CatalogEvent, Change, InMemoryCatalog};
pub use config::PoolConfig;
pub use driver::Drivers;
pub use error::{DriverError, Error, Result};
pub use key::{RecordId, ResourceKey, ResourceKind};
pub use listener::ChangeListener;
pub use observability::{NoOpMetrics, PoolMetrics};
pub use pool::ResourcePool;
pub use record::{RecordKind, SchemaHints, SchemaRecord, StoreRecord, StyleRecord};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
