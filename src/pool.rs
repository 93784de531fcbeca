//! Resource pool - main entry point for handle lookups.

use crate::builder::ResourcePoolBuilder;
use crate::cache::SingleFlightCache;
use crate::catalog::Catalog;
use crate::config::PoolConfig;
use crate::disposal::{DisposalRegistry, Disposer};
use crate::driver::Drivers;
use crate::env::ParameterExpander;
use crate::error::{DriverError, Error, Result};
use crate::graph::DependencyGraph;
use crate::key::{RecordId, ResourceKey, ResourceKind};
use crate::listener::ChangeListener;
use crate::observability::PoolMetrics;
use crate::record::{SchemaHints, SchemaRecord, StoreRecord, StyleRecord};
use std::sync::{Arc, Weak};

pub(crate) struct PoolInner<D: Drivers> {
    drivers: Arc<D>,
    catalog: Arc<dyn Catalog>,
    expander: ParameterExpander,
    connections: SingleFlightCache<D::Connection>,
    schemas: SingleFlightCache<D::Schema>,
    attributes: SingleFlightCache<D::Attributes>,
    styles: SingleFlightCache<D::Style>,
    crs: SingleFlightCache<D::Crs>,
    readers: SingleFlightCache<D::Reader>,
    graph: DependencyGraph,
    registry: Arc<DisposalRegistry>,
}

/// Broker for expensive handles derived from catalog records.
///
/// One single-flight cache per resource kind. Concurrent requests for the
/// same record collapse into one construction, repeated requests for an
/// unchanged record return the identical `Arc`, and catalog changes clear the
/// affected entries, cascading to everything built from them.
///
/// The pool is an explicit instance owned by the surrounding service; clones
/// share the same caches.
///
/// # Example
///
/// ```ignore
/// let catalog = Arc::new(InMemoryCatalog::new());
/// let pool = ResourcePool::new(MyDrivers::default(), catalog.clone());
/// pool.listener().spawn(catalog.subscribe());
///
/// let schema = pool.schema(&lakes, SchemaHints::default()).await?;
/// ```
pub struct ResourcePool<D: Drivers> {
    inner: Arc<PoolInner<D>>,
}

impl<D: Drivers> Clone for ResourcePool<D> {
    fn clone(&self) -> Self {
        ResourcePool {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<D: Drivers> ResourcePool<D> {
    /// Create a pool with default configuration.
    pub fn new(drivers: D, catalog: Arc<dyn Catalog>) -> Self {
        ResourcePool::from_parts(
            drivers,
            catalog,
            PoolConfig::default(),
            Arc::new(crate::observability::NoOpMetrics),
        )
    }

    /// Start a builder for a configured pool.
    pub fn builder(drivers: D) -> ResourcePoolBuilder<D> {
        ResourcePoolBuilder::new(drivers)
    }

    pub(crate) fn from_parts(
        drivers: D,
        catalog: Arc<dyn Catalog>,
        config: PoolConfig,
        metrics: Arc<dyn PoolMetrics>,
    ) -> Self {
        let drivers = Arc::new(drivers);
        let registry = Arc::new(DisposalRegistry::new(Arc::clone(&metrics)));

        let release: Disposer<D::Connection> = {
            let drivers = Arc::clone(&drivers);
            Arc::new(move |connection: &D::Connection| -> std::result::Result<(), DriverError> {
                drivers.release_connection(connection)
            })
        };
        let release_reader: Disposer<D::Reader> = {
            let drivers = Arc::clone(&drivers);
            Arc::new(move |reader: &D::Reader| -> std::result::Result<(), DriverError> {
                drivers.release_reader(reader)
            })
        };

        let inner = PoolInner {
            expander: ParameterExpander::from_config(&config),
            connections: SingleFlightCache::new(
                ResourceKind::Connection,
                config.connection_capacity,
                Some(release),
                Arc::clone(&registry),
                Arc::clone(&metrics),
            ),
            // Regular and raw flavours share the table.
            schemas: SingleFlightCache::new(
                ResourceKind::Schema,
                config.schema_capacity.saturating_mul(2),
                None,
                Arc::clone(&registry),
                Arc::clone(&metrics),
            ),
            attributes: SingleFlightCache::new(
                ResourceKind::Attributes,
                config.attributes_capacity,
                None,
                Arc::clone(&registry),
                Arc::clone(&metrics),
            ),
            styles: SingleFlightCache::new(
                ResourceKind::Style,
                config.style_capacity,
                None,
                Arc::clone(&registry),
                Arc::clone(&metrics),
            ),
            crs: SingleFlightCache::new(
                ResourceKind::Crs,
                config.crs_capacity,
                None,
                Arc::clone(&registry),
                Arc::clone(&metrics),
            ),
            readers: SingleFlightCache::new(
                ResourceKind::Reader,
                config.reader_capacity,
                Some(release_reader),
                Arc::clone(&registry),
                Arc::clone(&metrics),
            ),
            graph: DependencyGraph::new(),
            drivers,
            catalog,
            registry,
        };

        info!(
            "✓ Resource pool initialized (connections: {}, schemas: {}, attributes: {}, styles: {}, crs: {}, readers: {})",
            config.connection_capacity,
            config.schema_capacity,
            config.attributes_capacity,
            config.style_capacity,
            config.crs_capacity,
            config.reader_capacity
        );

        ResourcePool {
            inner: Arc::new(inner),
        }
    }

    pub(crate) fn downgrade(&self) -> Weak<PoolInner<D>> {
        Arc::downgrade(&self.inner)
    }

    pub(crate) fn upgrade(inner: &Weak<PoolInner<D>>) -> Option<Self> {
        inner.upgrade().map(|inner| ResourcePool { inner })
    }

    /// A listener that invalidates this pool on catalog changes.
    pub fn listener(&self) -> ChangeListener<D> {
        ChangeListener::new(self)
    }

    // ------------------------------------------------------------------
    // Lookups
    // ------------------------------------------------------------------

    /// Live connection for a store.
    ///
    /// # Errors
    ///
    /// - `Error::ConstructionFailed`: the driver could not connect. When the
    ///   store asks for it, the catalog is told to disable the store.
    /// - `Error::PoolShutdown`: the pool has been disposed
    pub async fn connection(&self, store: &StoreRecord) -> Result<Arc<D::Connection>> {
        let expanded = self.clone_store(store, true);
        let drivers = Arc::clone(&self.inner.drivers);

        let key = match ResourceKey::for_record(ResourceKind::Connection, store.id.as_ref()) {
            Ok(key) => key,
            Err(_) => {
                let key = transient_key(ResourceKind::Connection, &store.name);
                let build = async move {
                    drivers
                        .open_connection(&expanded)
                        .await
                        .map_err(|e| Error::construction(&key, e))
                };
                return self
                    .inner
                    .connections
                    .construct_uncached(&store.name, build)
                    .await;
            }
        };

        let catalog = Arc::clone(&self.inner.catalog);
        let build_key = key.clone();
        self.inner
            .connections
            .get(&key, move || async move {
                match drivers.open_connection(&expanded).await {
                    Ok(connection) => Ok(connection),
                    Err(e) => {
                        if expanded.disable_on_conn_failure && expanded.enabled {
                            if let Some(id) = &expanded.id {
                                warn!("⚠ Disabling store {} after connection failure: {}", id, e);
                                catalog.disable_store(id);
                            }
                        }
                        Err(Error::construction(&build_key, e))
                    }
                }
            })
            .await
    }

    /// Schema for a feature type, built from its store's connection.
    ///
    /// The regular and raw (`handle_projection_policy == false`) flavours are
    /// cached side by side and invalidated together.
    ///
    /// # Errors
    ///
    /// - `Error::MissingDependency`: the backing store is not in the catalog
    /// - `Error::ConstructionFailed`: the connection or the schema failed
    /// - `Error::PoolShutdown`: the pool has been disposed
    pub async fn schema(&self, schema: &SchemaRecord, hints: SchemaHints) -> Result<Arc<D::Schema>> {
        let key = match ResourceKey::for_record(ResourceKind::Schema, schema.id.as_ref()) {
            Ok(key) => hints.qualify(key),
            Err(_) => return self.transient_schema(schema, hints).await,
        };

        let pool = self.downgrade();
        let record = schema.clone();
        let build_key = key.clone();
        self.inner
            .schemas
            .get(&key, move || async move {
                let pool = ResourcePool::upgrade(&pool).ok_or(Error::PoolShutdown)?;
                let store = pool.backing_store(&record, &build_key)?;

                // Edge goes in before the connection is read, so invalidating
                // the store from here on also reaches this construction.
                pool.inner.graph.reset(&build_key);
                if let Ok(store_key) =
                    ResourceKey::for_record(ResourceKind::Connection, store.id.as_ref())
                {
                    pool.inner.graph.record(&build_key, &store_key);
                }

                let connection = pool.connection(&store).await?;
                pool.inner
                    .drivers
                    .build_schema(&record, &hints, connection)
                    .await
                    .map_err(|e| Error::construction(&build_key, e))
            })
            .await
    }

    async fn transient_schema(
        &self,
        schema: &SchemaRecord,
        hints: SchemaHints,
    ) -> Result<Arc<D::Schema>> {
        let key = transient_key(ResourceKind::Schema, &schema.name);
        let store = self.backing_store(schema, &key)?;

        let connection = self.connection(&store).await?;
        let build = async {
            self.inner
                .drivers
                .build_schema(schema, &hints, connection)
                .await
                .map_err(|e| Error::construction(&key, e))
        };
        self.inner
            .schemas
            .construct_uncached(&schema.name, build)
            .await
    }

    /// Attribute list of a feature type, cached apart from its schema.
    ///
    /// Built from the regular schema flavour and cleared whenever that schema
    /// is. Records without identity are described afresh on every call.
    ///
    /// # Errors
    ///
    /// Same as [`schema`](Self::schema), plus `Error::ConstructionFailed`
    /// when the driver cannot describe the attributes.
    pub async fn attributes(&self, schema: &SchemaRecord) -> Result<Arc<D::Attributes>> {
        let key = match ResourceKey::for_record(ResourceKind::Attributes, schema.id.as_ref()) {
            Ok(key) => key,
            Err(_) => {
                let key = transient_key(ResourceKind::Attributes, &schema.name);
                let built = self.transient_schema(schema, SchemaHints::default()).await?;
                let build = async {
                    self.inner
                        .drivers
                        .describe_attributes(schema, built)
                        .await
                        .map_err(|e| Error::construction(&key, e))
                };
                return self
                    .inner
                    .attributes
                    .construct_uncached(&schema.name, build)
                    .await;
            }
        };

        let pool = self.downgrade();
        let record = schema.clone();
        let build_key = key.clone();
        self.inner
            .attributes
            .get(&key, move || async move {
                let pool = ResourcePool::upgrade(&pool).ok_or(Error::PoolShutdown)?;

                pool.inner.graph.reset(&build_key);
                let schema_key = ResourceKey::new(ResourceKind::Schema, build_key.identity().clone());
                pool.inner.graph.record(&build_key, &schema_key);

                let built = pool.schema(&record, SchemaHints::default()).await?;
                pool.inner
                    .drivers
                    .describe_attributes(&record, built)
                    .await
                    .map_err(|e| Error::construction(&build_key, e))
            })
            .await
    }

    fn backing_store(&self, schema: &SchemaRecord, key: &ResourceKey) -> Result<StoreRecord> {
        self.inner
            .catalog
            .store(&schema.store)
            .ok_or_else(|| Error::MissingDependency {
                key: key.clone(),
                dependency: schema.store.to_string(),
            })
    }

    /// Parsed style document.
    ///
    /// # Errors
    ///
    /// - `Error::ConstructionFailed`: the document could not be parsed
    /// - `Error::PoolShutdown`: the pool has been disposed
    pub async fn style(&self, style: &StyleRecord) -> Result<Arc<D::Style>> {
        let drivers = Arc::clone(&self.inner.drivers);

        let key = match ResourceKey::for_record(ResourceKind::Style, style.id.as_ref()) {
            Ok(key) => key,
            Err(_) => {
                let key = transient_key(ResourceKind::Style, &style.name);
                let build = async {
                    drivers
                        .parse_style(style)
                        .await
                        .map_err(|e| Error::construction(&key, e))
                };
                return self.inner.styles.construct_uncached(&style.name, build).await;
            }
        };

        let record = style.clone();
        let build_key = key.clone();
        self.inner
            .styles
            .get(&key, move || async move {
                drivers
                    .parse_style(&record)
                    .await
                    .map_err(|e| Error::construction(&build_key, e))
            })
            .await
    }

    /// Coordinate reference system by code, e.g. `EPSG:4326`.
    ///
    /// # Errors
    ///
    /// - `Error::InvalidKey`: empty code
    /// - `Error::ConstructionFailed`: unknown or undecodable code
    /// - `Error::PoolShutdown`: the pool has been disposed
    pub async fn crs(&self, code: &str) -> Result<Arc<D::Crs>> {
        let key = crs_key(code)?;
        let drivers = Arc::clone(&self.inner.drivers);
        let code = code.trim().to_string();
        let build_key = key.clone();

        self.inner
            .crs
            .get(&key, move || async move {
                drivers
                    .decode_crs(&code)
                    .await
                    .map_err(|e| Error::construction(&build_key, e))
            })
            .await
    }

    /// Raster reader for a coverage store.
    ///
    /// Readers are released through [`Drivers::release_reader`] when cleared,
    /// evicted (once no caller holds them) or at shutdown.
    ///
    /// # Errors
    ///
    /// - `Error::ConstructionFailed`: the driver could not open the coverage
    /// - `Error::PoolShutdown`: the pool has been disposed
    pub async fn reader(&self, store: &StoreRecord) -> Result<Arc<D::Reader>> {
        let expanded = self.clone_store(store, true);
        let drivers = Arc::clone(&self.inner.drivers);

        let key = match ResourceKey::for_record(ResourceKind::Reader, store.id.as_ref()) {
            Ok(key) => key,
            Err(_) => {
                let key = transient_key(ResourceKind::Reader, &store.name);
                let build = async move {
                    drivers
                        .open_reader(&expanded)
                        .await
                        .map_err(|e| Error::construction(&key, e))
                };
                return self.inner.readers.construct_uncached(&store.name, build).await;
            }
        };

        let build_key = key.clone();
        self.inner
            .readers
            .get(&key, move || async move {
                drivers
                    .open_reader(&expanded)
                    .await
                    .map_err(|e| Error::construction(&build_key, e))
            })
            .await
    }

    /// Uncached copy of a store record.
    ///
    /// With `allow_expansion` and environment parametrization enabled,
    /// `${name}` placeholders in the parameters are resolved.
    pub fn clone_store(&self, store: &StoreRecord, allow_expansion: bool) -> StoreRecord {
        if allow_expansion {
            self.inner.expander.expand_store(store)
        } else {
            store.clone()
        }
    }

    // ------------------------------------------------------------------
    // Invalidation
    // ------------------------------------------------------------------

    /// Drop the cached connection for a store, and everything built on it.
    pub fn clear_connection(&self, store: &StoreRecord) -> usize {
        store.id.as_ref().map_or(0, |id| {
            self.invalidate(ResourceKind::Connection, id)
        })
    }

    /// Drop every cached flavour of a feature type's schema.
    pub fn clear_schema(&self, schema: &SchemaRecord) -> usize {
        schema
            .id
            .as_ref()
            .map_or(0, |id| self.invalidate(ResourceKind::Schema, id))
    }

    /// Drop the cached attribute list of a feature type.
    pub fn clear_attributes(&self, schema: &SchemaRecord) -> usize {
        schema
            .id
            .as_ref()
            .map_or(0, |id| self.invalidate(ResourceKind::Attributes, id))
    }

    /// Drop and release the cached reader of a coverage store.
    pub fn clear_reader(&self, store: &StoreRecord) -> usize {
        store
            .id
            .as_ref()
            .map_or(0, |id| self.invalidate(ResourceKind::Reader, id))
    }

    pub fn clear_style(&self, style: &StyleRecord) -> usize {
        style
            .id
            .as_ref()
            .map_or(0, |id| self.invalidate(ResourceKind::Style, id))
    }

    pub fn clear_crs(&self, code: &str) -> usize {
        crs_key(code).map_or(0, |key| self.clear(&key))
    }

    /// Clear exactly `key`, then everything transitively built from it.
    ///
    /// Returns the number of ready entries removed.
    pub fn clear(&self, key: &ResourceKey) -> usize {
        let mut cleared = usize::from(self.clear_key(key));
        cleared += self.cascade(key);
        self.inner.registry.sweep();
        cleared
    }

    /// Clear every variant cached for a record, then cascade to dependents.
    ///
    /// Returns the number of ready entries removed.
    pub fn invalidate(&self, kind: ResourceKind, identity: &RecordId) -> usize {
        let root = ResourceKey::new(kind, identity.clone());

        let mut cleared = match kind {
            ResourceKind::Connection => self.release_all(self.inner.connections.clear_record(identity)),
            ResourceKind::Schema => self.release_all(self.inner.schemas.clear_record(identity)),
            ResourceKind::Attributes => {
                self.release_all(self.inner.attributes.clear_record(identity))
            }
            ResourceKind::Style => self.release_all(self.inner.styles.clear_record(identity)),
            ResourceKind::Crs => self.release_all(self.inner.crs.clear_record(identity)),
            ResourceKind::Reader => self.release_all(self.inner.readers.clear_record(identity)),
        };
        cleared += self.cascade(&root);
        self.inner.registry.sweep();

        if cleared > 0 {
            info!("✓ Invalidated {} ({} cached entries cleared)", root, cleared);
        }
        cleared
    }

    /// Drop the dependency edges of a removed record.
    pub(crate) fn forget(&self, kind: ResourceKind, identity: &RecordId) {
        self.inner.graph.forget(kind, identity);
    }

    fn cascade(&self, root: &ResourceKey) -> usize {
        let dependents = self.inner.graph.dependents_of(root);
        if !dependents.is_empty() {
            debug!("Cascading invalidation of {} to {} dependents", root, dependents.len());
        }
        dependents
            .iter()
            .filter(|dependent| self.clear_key(dependent))
            .count()
    }

    fn clear_key(&self, key: &ResourceKey) -> bool {
        match key.kind() {
            ResourceKind::Connection => self.release(self.inner.connections.clear(key)),
            ResourceKind::Schema => self.release(self.inner.schemas.clear(key)),
            ResourceKind::Attributes => self.release(self.inner.attributes.clear(key)),
            ResourceKind::Style => self.release(self.inner.styles.clear(key)),
            ResourceKind::Crs => self.release(self.inner.crs.clear(key)),
            ResourceKind::Reader => self.release(self.inner.readers.clear(key)),
        }
    }

    fn release<H>(&self, removed: Option<Arc<H>>) -> bool {
        match removed {
            Some(handle) => {
                self.inner.registry.dispose_once(&handle);
                true
            }
            None => false,
        }
    }

    fn release_all<H>(&self, removed: Vec<(ResourceKey, Arc<H>)>) -> usize {
        let cleared = removed.len();
        for (_, handle) in removed {
            self.inner.registry.dispose_once(&handle);
        }
        cleared
    }

    /// Clear every handle derived from catalog records. CRS objects do not
    /// depend on the catalog and are kept.
    pub fn clear_catalog_resources(&self) -> usize {
        let cleared = self.release_all(self.inner.connections.drain())
            + self.release_all(self.inner.schemas.drain())
            + self.release_all(self.inner.attributes.drain())
            + self.release_all(self.inner.styles.drain())
            + self.release_all(self.inner.readers.drain());
        self.inner.graph.clear();
        self.inner.registry.sweep();
        warn!("⚠ Cleared all catalog-derived resources ({} entries)", cleared);
        cleared
    }

    /// Clear and release every cached handle, keeping the pool usable.
    pub fn reset(&self) -> usize {
        let cleared = self.clear_catalog_resources() + self.release_all(self.inner.crs.drain());
        info!("✓ Resource pool reset ({} entries cleared)", cleared);
        cleared
    }

    /// Shut the pool down and release every tracked handle exactly once.
    ///
    /// Later lookups fail with `Error::PoolShutdown`; handles whose
    /// construction finishes afterwards are released instead of cached.
    pub fn dispose(&self) -> usize {
        if !self.inner.registry.begin_shutdown() {
            return 0;
        }

        self.inner.connections.drain();
        self.inner.schemas.drain();
        self.inner.attributes.drain();
        self.inner.styles.drain();
        self.inner.crs.drain();
        self.inner.readers.drain();
        self.inner.graph.clear();

        let released = self.inner.registry.dispose_all();
        info!("✓ Resource pool disposed ({} handles released)", released);
        released
    }

    pub fn is_disposed(&self) -> bool {
        self.inner.registry.is_shutting_down()
    }

    // ------------------------------------------------------------------
    // Diagnostics
    // ------------------------------------------------------------------

    /// Number of ready handles of one kind.
    pub fn size_of(&self, kind: ResourceKind) -> usize {
        match kind {
            ResourceKind::Connection => self.inner.connections.len(),
            ResourceKind::Schema => self.inner.schemas.len(),
            ResourceKind::Attributes => self.inner.attributes.len(),
            ResourceKind::Style => self.inner.styles.len(),
            ResourceKind::Crs => self.inner.crs.len(),
            ResourceKind::Reader => self.inner.readers.len(),
        }
    }

    /// Whether a ready handle is cached under `key`. Never builds.
    pub fn contains(&self, key: &ResourceKey) -> bool {
        match key.kind() {
            ResourceKind::Connection => self.inner.connections.contains(key),
            ResourceKind::Schema => self.inner.schemas.contains(key),
            ResourceKind::Attributes => self.inner.attributes.contains(key),
            ResourceKind::Style => self.inner.styles.contains(key),
            ResourceKind::Crs => self.inner.crs.contains(key),
            ResourceKind::Reader => self.inner.readers.contains(key),
        }
    }

    /// Whether a construction is running for `key`.
    pub fn is_pending(&self, key: &ResourceKey) -> bool {
        match key.kind() {
            ResourceKind::Connection => self.inner.connections.is_pending(key),
            ResourceKind::Schema => self.inner.schemas.is_pending(key),
            ResourceKind::Attributes => self.inner.attributes.is_pending(key),
            ResourceKind::Style => self.inner.styles.is_pending(key),
            ResourceKind::Crs => self.inner.crs.is_pending(key),
            ResourceKind::Reader => self.inner.readers.is_pending(key),
        }
    }

    pub fn peek_connection(&self, key: &ResourceKey) -> Option<Arc<D::Connection>> {
        self.inner.connections.get_if_present(key)
    }

    pub fn peek_schema(&self, key: &ResourceKey) -> Option<Arc<D::Schema>> {
        self.inner.schemas.get_if_present(key)
    }

    pub fn peek_attributes(&self, key: &ResourceKey) -> Option<Arc<D::Attributes>> {
        self.inner.attributes.get_if_present(key)
    }

    pub fn peek_style(&self, key: &ResourceKey) -> Option<Arc<D::Style>> {
        self.inner.styles.get_if_present(key)
    }

    pub fn peek_crs(&self, key: &ResourceKey) -> Option<Arc<D::Crs>> {
        self.inner.crs.get_if_present(key)
    }

    pub fn peek_reader(&self, key: &ResourceKey) -> Option<Arc<D::Reader>> {
        self.inner.readers.get_if_present(key)
    }

    /// Number of recorded dependency edges.
    pub fn dependency_count(&self) -> usize {
        self.inner.graph.len()
    }

    /// Number of disposable handles not yet released.
    pub fn tracked_handles(&self) -> usize {
        self.inner.registry.len()
    }
}

fn transient_key(kind: ResourceKind, name: &str) -> ResourceKey {
    ResourceKey::new(kind, RecordId::from(name)).with_variant("transient")
}

fn crs_key(code: &str) -> Result<ResourceKey> {
    let code = RecordId::from(code.trim());
    ResourceKey::for_record(ResourceKind::Crs, Some(&code))
}
