//! End-to-end scenarios: catalog changes flowing through a live pool.

use futures::future::join_all;
use parking_lot::Mutex;
use resource_pool::{
    Catalog, CatalogEvent, DriverError, Drivers, Error, InMemoryCatalog, PoolConfig, RecordId,
    RecordKind, ResourceKey, ResourceKind, ResourcePool, SchemaHints, SchemaRecord, StoreRecord,
    StyleRecord,
};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug)]
struct Connection {
    serial: usize,
    url: String,
}

#[derive(Debug)]
struct Schema {
    connection: Arc<Connection>,
    raw: bool,
}

#[derive(Debug)]
struct Reader {
    serial: usize,
}

#[derive(Default)]
struct Counters {
    attempts: AtomicUsize,
    opened: AtomicUsize,
    schemas: AtomicUsize,
    described: AtomicUsize,
    styles: AtomicUsize,
    readers: AtomicUsize,
    released: Mutex<Vec<usize>>,
    released_readers: Mutex<Vec<usize>>,
    failing: AtomicBool,
}

impl Counters {
    fn released(&self) -> Vec<usize> {
        let mut released = self.released.lock().clone();
        released.sort_unstable();
        released
    }
}

struct MockDrivers {
    counters: Arc<Counters>,
    connect_delay: Duration,
}

impl Drivers for MockDrivers {
    type Connection = Connection;
    type Schema = Schema;
    type Attributes = Vec<String>;
    type Style = usize;
    type Crs = String;
    type Reader = Reader;

    async fn open_connection(&self, store: &StoreRecord) -> Result<Connection, DriverError> {
        self.counters.attempts.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(self.connect_delay).await;
        if self.counters.failing.load(Ordering::SeqCst) {
            return Err("network unreachable".into());
        }
        Ok(Connection {
            serial: self.counters.opened.fetch_add(1, Ordering::SeqCst) + 1,
            url: store.params.get("url").cloned().unwrap_or_default(),
        })
    }

    async fn build_schema(
        &self,
        _schema: &SchemaRecord,
        hints: &SchemaHints,
        connection: Arc<Connection>,
    ) -> Result<Schema, DriverError> {
        self.counters.schemas.fetch_add(1, Ordering::SeqCst);
        Ok(Schema {
            connection,
            raw: !hints.handle_projection_policy,
        })
    }

    async fn describe_attributes(
        &self,
        schema: &SchemaRecord,
        _built: Arc<Schema>,
    ) -> Result<Vec<String>, DriverError> {
        self.counters.described.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(self.connect_delay).await;
        Ok(schema.attributes.clone())
    }

    async fn parse_style(&self, _style: &StyleRecord) -> Result<usize, DriverError> {
        Ok(self.counters.styles.fetch_add(1, Ordering::SeqCst) + 1)
    }

    async fn decode_crs(&self, code: &str) -> Result<String, DriverError> {
        match code {
            "EPSG:4326" | "EPSG:3857" => Ok(code.to_string()),
            _ => Err(format!("unknown authority code {}", code).into()),
        }
    }

    async fn open_reader(&self, _store: &StoreRecord) -> Result<Reader, DriverError> {
        Ok(Reader {
            serial: self.counters.readers.fetch_add(1, Ordering::SeqCst) + 1,
        })
    }

    fn release_connection(&self, connection: &Connection) -> Result<(), DriverError> {
        self.counters.released.lock().push(connection.serial);
        Ok(())
    }

    fn release_reader(&self, reader: &Reader) -> Result<(), DriverError> {
        self.counters.released_readers.lock().push(reader.serial);
        Ok(())
    }
}

struct Harness {
    pool: ResourcePool<MockDrivers>,
    catalog: Arc<InMemoryCatalog>,
    counters: Arc<Counters>,
}

fn harness_with(config: PoolConfig, connect_delay: Duration) -> Harness {
    let _ = env_logger::builder().is_test(true).try_init();

    let counters = Arc::new(Counters::default());
    let catalog = Arc::new(InMemoryCatalog::new());
    let pool = ResourcePool::builder(MockDrivers {
        counters: Arc::clone(&counters),
        connect_delay,
    })
    .with_catalog(catalog.clone())
    .with_config(config)
    .build()
    .expect("Failed to build pool");

    Harness {
        pool,
        catalog,
        counters,
    }
}

fn harness() -> Harness {
    harness_with(PoolConfig::default(), Duration::ZERO)
}

fn lakes_store() -> StoreRecord {
    StoreRecord::new("42", "lakes_db", "postgis").with_param("url", "postgres://localhost/gis")
}

fn lakes() -> SchemaRecord {
    SchemaRecord::new("ft-lakes", "lakes", "42")
}

fn lakes_key() -> ResourceKey {
    ResourceKey::new(ResourceKind::Schema, RecordId::from("ft-lakes"))
}

fn lakes_with_attributes() -> SchemaRecord {
    let mut lakes = lakes();
    lakes.attributes = vec!["name".to_string(), "area".to_string(), "geom".to_string()];
    lakes
}

fn attributes_key() -> ResourceKey {
    ResourceKey::new(ResourceKind::Attributes, RecordId::from("ft-lakes"))
}

fn store_saved() -> CatalogEvent {
    CatalogEvent::saved(RecordKind::Store, RecordId::from("42"))
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_schema_requests_share_one_construction() {
    let h = harness_with(PoolConfig::default(), Duration::from_millis(50));
    h.catalog.save_store(lakes_store()).expect("Failed to save");

    let requests = (0..5).map(|_| {
        let pool = h.pool.clone();
        tokio::spawn(async move { pool.schema(&lakes(), SchemaHints::default()).await })
    });
    let schemas: Vec<Arc<Schema>> = join_all(requests)
        .await
        .into_iter()
        .map(|joined| joined.expect("Task panicked").expect("Failed to build"))
        .collect();

    for schema in &schemas {
        assert!(Arc::ptr_eq(schema, &schemas[0]));
    }
    assert_eq!(h.counters.schemas.load(Ordering::SeqCst), 1);
    assert_eq!(h.counters.opened.load(Ordering::SeqCst), 1);
    assert_eq!(h.pool.dependency_count(), 1);
}

#[tokio::test]
async fn test_store_save_and_remove_lifecycle() {
    let h = harness();
    let listener = h.pool.listener();
    h.catalog.save_store(lakes_store()).expect("Failed to save");

    let first = h
        .pool
        .schema(&lakes(), SchemaHints::default())
        .await
        .expect("Failed to build");
    let again = h
        .pool
        .schema(&lakes(), SchemaHints::default())
        .await
        .expect("Failed to get");
    assert!(Arc::ptr_eq(&first, &again));

    // Saving the store clears its connection and cascades to the schema.
    h.catalog
        .save_store(lakes_store().with_param("url", "postgres://replica/gis"))
        .expect("Failed to save");
    assert_eq!(listener.on_event(&store_saved()), 2);
    assert_eq!(h.counters.released(), vec![1]);

    let second = h
        .pool
        .schema(&lakes(), SchemaHints::default())
        .await
        .expect("Failed to rebuild");
    assert!(!Arc::ptr_eq(&first, &second));
    assert_eq!(second.connection.serial, 2);
    assert_eq!(second.connection.url, "postgres://replica/gis");

    // Removing it releases the new connection once and forgets the edges.
    h.catalog.remove_store(&RecordId::from("42"));
    listener.on_event(&CatalogEvent::removed(RecordKind::Store, RecordId::from("42")));
    listener.on_event(&CatalogEvent::removed(RecordKind::Store, RecordId::from("42")));

    assert!(!h.pool.contains(&lakes_key()));
    assert_eq!(h.counters.released(), vec![1, 2]);
    assert_eq!(h.pool.dependency_count(), 0);

    let err = h
        .pool
        .schema(&lakes(), SchemaHints::default())
        .await
        .unwrap_err();
    assert!(matches!(err, Error::MissingDependency { .. }));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_connection_failure_is_shared_then_retried() {
    let h = harness_with(PoolConfig::default(), Duration::from_millis(50));
    h.counters.failing.store(true, Ordering::SeqCst);

    let requests = (0..5).map(|_| {
        let pool = h.pool.clone();
        tokio::spawn(async move { pool.connection(&lakes_store()).await })
    });
    for joined in join_all(requests).await {
        let err = joined.expect("Task panicked").unwrap_err();
        assert!(matches!(err, Error::ConstructionFailed { .. }));
        assert!(err.is_retryable());
    }
    assert_eq!(h.counters.attempts.load(Ordering::SeqCst), 1);
    assert_eq!(h.pool.size_of(ResourceKind::Connection), 0);

    h.counters.failing.store(false, Ordering::SeqCst);
    let connection = h
        .pool
        .connection(&lakes_store())
        .await
        .expect("Retry should succeed");
    assert_eq!(connection.serial, 1);
    assert_eq!(h.counters.attempts.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_failing_store_is_disabled_when_requested() {
    let h = harness();
    let mut store = lakes_store();
    store.disable_on_conn_failure = true;
    h.catalog.save_store(store.clone()).expect("Failed to save");
    h.counters.failing.store(true, Ordering::SeqCst);

    let err = h.pool.connection(&store).await.unwrap_err();
    assert!(matches!(err, Error::ConstructionFailed { .. }));

    let stored = h
        .catalog
        .store(&RecordId::from("42"))
        .expect("Store missing");
    assert!(!stored.enabled);
}

#[tokio::test]
async fn test_failing_store_stays_enabled_by_default() {
    let h = harness();
    h.catalog.save_store(lakes_store()).expect("Failed to save");
    h.counters.failing.store(true, Ordering::SeqCst);

    assert!(h.pool.connection(&lakes_store()).await.is_err());

    let stored = h
        .catalog
        .store(&RecordId::from("42"))
        .expect("Store missing");
    assert!(stored.enabled);
}

#[tokio::test]
async fn test_store_parameters_are_expanded() {
    let mut config = PoolConfig {
        allow_env_parametrization: true,
        ..Default::default()
    };
    config
        .properties
        .insert("db.host".to_string(), "db.internal".to_string());
    let h = harness_with(config, Duration::ZERO);

    let store = StoreRecord::new("42", "lakes_db", "postgis")
        .with_param("url", "postgres://${db.host}/gis");
    let connection = h.pool.connection(&store).await.expect("Failed to connect");

    assert_eq!(connection.url, "postgres://db.internal/gis");
    assert_eq!(store.params["url"], "postgres://${db.host}/gis");
    assert_eq!(
        h.pool.clone_store(&store, false).params["url"],
        "postgres://${db.host}/gis"
    );
    assert_eq!(
        h.pool.clone_store(&store, true).params["url"],
        "postgres://db.internal/gis"
    );
}

#[tokio::test]
async fn test_expansion_disabled_by_default() {
    let h = harness();
    let store = StoreRecord::new("42", "lakes_db", "postgis")
        .with_param("url", "postgres://${db.host}/gis");

    let connection = h.pool.connection(&store).await.expect("Failed to connect");
    assert_eq!(connection.url, "postgres://${db.host}/gis");
}

#[tokio::test]
async fn test_transient_records_are_never_cached() {
    let h = harness();
    let draft = StoreRecord::transient("draft", "postgis");

    let first = h.pool.connection(&draft).await.expect("Failed to connect");
    let second = h.pool.connection(&draft).await.expect("Failed to connect");

    assert!(!Arc::ptr_eq(&first, &second));
    assert_eq!(h.counters.opened.load(Ordering::SeqCst), 2);
    assert_eq!(h.pool.size_of(ResourceKind::Connection), 0);

    drop(first);
    drop(second);
    assert_eq!(h.pool.dispose(), 2);
    assert_eq!(h.counters.released(), vec![1, 2]);
}

#[tokio::test]
async fn test_transient_schema_uses_cached_connection() {
    let h = harness();
    h.catalog.save_store(lakes_store()).expect("Failed to save");
    let draft = SchemaRecord::transient("draft_lakes", "42");

    let first = h
        .pool
        .schema(&draft, SchemaHints::default())
        .await
        .expect("Failed to build");
    let second = h
        .pool
        .schema(&draft, SchemaHints::default())
        .await
        .expect("Failed to build");

    assert!(!Arc::ptr_eq(&first, &second));
    assert!(Arc::ptr_eq(&first.connection, &second.connection));
    assert_eq!(h.counters.schemas.load(Ordering::SeqCst), 2);
    assert_eq!(h.pool.size_of(ResourceKind::Schema), 0);
}

#[tokio::test]
async fn test_raw_variant_cached_separately_and_cleared_together() {
    let h = harness();
    h.catalog.save_store(lakes_store()).expect("Failed to save");

    let regular = h
        .pool
        .schema(&lakes(), SchemaHints::default())
        .await
        .expect("Failed to build");
    let raw = h
        .pool
        .schema(&lakes(), SchemaHints::raw())
        .await
        .expect("Failed to build");

    assert!(!Arc::ptr_eq(&regular, &raw));
    assert!(raw.raw);
    assert!(Arc::ptr_eq(&regular.connection, &raw.connection));
    assert_eq!(h.pool.size_of(ResourceKind::Schema), 2);

    assert_eq!(h.pool.clear_schema(&lakes()), 2);
    assert_eq!(h.pool.size_of(ResourceKind::Schema), 0);
    assert_eq!(h.pool.size_of(ResourceKind::Connection), 1);
}

#[tokio::test]
async fn test_attribute_list_cached_apart_from_schema() {
    let h = harness();
    let listener = h.pool.listener();
    h.catalog.save_store(lakes_store()).expect("Failed to save");

    let attributes = h
        .pool
        .attributes(&lakes_with_attributes())
        .await
        .expect("Failed to describe");
    assert_eq!(*attributes, vec!["name", "area", "geom"]);
    assert!(Arc::ptr_eq(
        &attributes,
        &h.pool
            .attributes(&lakes_with_attributes())
            .await
            .expect("Failed to describe")
    ));
    assert!(h.pool.contains(&lakes_key()));
    assert_eq!(h.counters.described.load(Ordering::SeqCst), 1);

    // Clearing the schema takes the attribute list with it.
    assert_eq!(h.pool.clear_schema(&lakes()), 2);
    assert!(!h.pool.contains(&attributes_key()));

    h.pool
        .attributes(&lakes_with_attributes())
        .await
        .expect("Failed to describe");
    assert_eq!(h.counters.described.load(Ordering::SeqCst), 2);

    // A store change cascades connection -> schema -> attributes.
    assert_eq!(listener.on_event(&store_saved()), 3);
    assert!(!h.pool.contains(&attributes_key()));
    assert_eq!(h.pool.size_of(ResourceKind::Schema), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_attribute_requests_share_one_construction() {
    let h = harness_with(PoolConfig::default(), Duration::from_millis(30));
    h.catalog.save_store(lakes_store()).expect("Failed to save");

    let requests = (0..8).map(|_| {
        let pool = h.pool.clone();
        tokio::spawn(async move { pool.attributes(&lakes_with_attributes()).await })
    });
    let lists: Vec<Arc<Vec<String>>> = join_all(requests)
        .await
        .into_iter()
        .map(|joined| joined.expect("Task panicked").expect("Failed to describe"))
        .collect();

    for list in &lists {
        assert!(Arc::ptr_eq(list, &lists[0]));
    }
    assert_eq!(h.counters.described.load(Ordering::SeqCst), 1);
    assert_eq!(h.counters.schemas.load(Ordering::SeqCst), 1);
    assert_eq!(h.counters.opened.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_transient_attributes_are_never_cached() {
    let h = harness();
    h.catalog.save_store(lakes_store()).expect("Failed to save");
    let mut draft = SchemaRecord::transient("draft_lakes", "42");
    draft.attributes = vec!["geom".to_string()];

    let first = h.pool.attributes(&draft).await.expect("Failed to describe");
    let second = h.pool.attributes(&draft).await.expect("Failed to describe");

    assert!(!Arc::ptr_eq(&first, &second));
    assert_eq!(*first, vec!["geom"]);
    assert_eq!(h.counters.described.load(Ordering::SeqCst), 2);
    assert_eq!(h.pool.size_of(ResourceKind::Attributes), 0);
    assert_eq!(h.pool.size_of(ResourceKind::Schema), 0);
}

#[tokio::test]
async fn test_dropped_coverage_store_releases_reader() {
    let h = harness();
    let listener = h.pool.listener();
    let dem = StoreRecord::new("dem", "elevation", "geotiff");
    h.catalog.save_coverage_store(dem.clone()).expect("Failed to save");

    let reader = h.pool.reader(&dem).await.expect("Failed to open reader");
    assert!(Arc::ptr_eq(
        &reader,
        &h.pool.reader(&dem).await.expect("Failed to open reader")
    ));
    assert_eq!(h.counters.readers.load(Ordering::SeqCst), 1);

    h.catalog.remove_coverage_store(&RecordId::from("dem"));
    assert_eq!(
        listener.on_event(&CatalogEvent::removed(
            RecordKind::CoverageStore,
            RecordId::from("dem")
        )),
        1
    );
    assert_eq!(*h.counters.released_readers.lock(), vec![1]);
    assert_eq!(h.pool.size_of(ResourceKind::Reader), 0);

    // Readers are released at shutdown like connections.
    let other = StoreRecord::new("ortho", "imagery", "geotiff");
    h.pool.reader(&other).await.expect("Failed to open reader");
    assert_eq!(h.pool.dispose(), 1);
    assert_eq!(*h.counters.released_readers.lock(), vec![1, 2]);
    assert!(h.counters.released().is_empty());
}

#[tokio::test]
async fn test_transient_connections_released_without_other_traffic() {
    let h = harness();
    let draft = StoreRecord::transient("draft", "postgis");

    for serial in 1..=5 {
        let connection = h.pool.connection(&draft).await.expect("Failed to connect");
        assert_eq!(connection.serial, serial);
    }

    // Every dropped connection but the last has been closed by a later lookup.
    assert_eq!(h.counters.released(), vec![1, 2, 3, 4]);
    assert_eq!(h.pool.tracked_handles(), 1);
}

#[tokio::test]
async fn test_abandoned_connection_still_cached() {
    let h = harness_with(PoolConfig::default(), Duration::from_millis(50));
    let key = ResourceKey::new(ResourceKind::Connection, RecordId::from("42"));

    let abandoned =
        tokio::time::timeout(Duration::from_millis(10), h.pool.connection(&lakes_store())).await;
    assert!(abandoned.is_err());
    assert!(h.pool.is_pending(&key));

    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(h.pool.contains(&key));

    let connection = h.pool.connection(&lakes_store()).await.expect("Failed to get");
    assert_eq!(connection.serial, 1);
    assert_eq!(h.counters.attempts.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_style_and_crs_lookups() {
    let h = harness();
    let water = StyleRecord::new("s1", "water", "sld", "<sld/>");

    let style = h.pool.style(&water).await.expect("Failed to parse");
    assert!(Arc::ptr_eq(
        &style,
        &h.pool.style(&water).await.expect("Failed to parse")
    ));
    assert_eq!(h.pool.clear_style(&water), 1);
    assert_eq!(*h.pool.style(&water).await.expect("Failed to parse"), 2);

    let wgs84 = h.pool.crs("EPSG:4326").await.expect("Failed to decode");
    assert!(Arc::ptr_eq(
        &wgs84,
        &h.pool.crs("EPSG:4326").await.expect("Failed to decode")
    ));
    assert!(matches!(
        h.pool.crs("EPSG:0").await.unwrap_err(),
        Error::ConstructionFailed { .. }
    ));
    assert!(matches!(h.pool.crs("").await.unwrap_err(), Error::InvalidKey(_)));
    assert_eq!(h.pool.clear_crs("EPSG:4326"), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_store_change_during_schema_construction() {
    let h = harness_with(PoolConfig::default(), Duration::from_millis(100));
    h.catalog.save_store(lakes_store()).expect("Failed to save");
    let listener = h.pool.listener();

    let early = {
        let pool = h.pool.clone();
        tokio::spawn(async move { pool.schema(&lakes(), SchemaHints::default()).await })
    };
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert!(h.pool.is_pending(&lakes_key()));

    // Nothing ready yet, but both pending constructions are flagged.
    assert_eq!(listener.on_event(&store_saved()), 0);

    let late = h
        .pool
        .schema(&lakes(), SchemaHints::default())
        .await
        .expect("Failed to rebuild");
    let early = early
        .await
        .expect("Task panicked")
        .expect("Early caller should get its schema");

    assert_eq!(early.connection.serial, 1);
    assert_eq!(late.connection.serial, 2);
    assert!(Arc::ptr_eq(
        &late,
        &h.pool.peek_schema(&lakes_key()).expect("Rebuilt schema not cached")
    ));

    // The superseded connection goes once nobody holds it.
    drop(early);
    h.pool.clear_crs("EPSG:4326");
    assert_eq!(h.counters.released(), vec![1]);
}

#[tokio::test]
async fn test_evicted_connection_released_after_last_holder() {
    let config = PoolConfig {
        connection_capacity: 1,
        ..Default::default()
    };
    let h = harness_with(config, Duration::ZERO);

    let a = h
        .pool
        .connection(&StoreRecord::new("a", "a", "postgis"))
        .await
        .expect("Failed to connect");
    let b = h
        .pool
        .connection(&StoreRecord::new("b", "b", "postgis"))
        .await
        .expect("Failed to connect");
    assert_eq!(h.pool.size_of(ResourceKind::Connection), 1);
    assert!(h.counters.released().is_empty());

    drop(a);
    h.pool
        .connection(&StoreRecord::new("c", "c", "postgis"))
        .await
        .expect("Failed to connect");

    // a is idle and released; b was evicted but is still held.
    assert_eq!(h.counters.released(), vec![1]);
    assert_eq!(b.serial, 2);
}

#[tokio::test]
async fn test_dispose_releases_everything_once() {
    let h = harness();

    h.pool
        .connection(&StoreRecord::new("a", "a", "postgis"))
        .await
        .expect("Failed to connect");
    let held = h
        .pool
        .connection(&StoreRecord::new("b", "b", "postgis"))
        .await
        .expect("Failed to connect");
    h.pool.crs("EPSG:4326").await.expect("Failed to decode");

    assert_eq!(h.pool.dispose(), 2);
    assert_eq!(h.pool.dispose(), 0);
    assert!(h.pool.is_disposed());
    assert_eq!(h.counters.released(), vec![1, 2]);
    assert_eq!(h.pool.tracked_handles(), 0);
    assert_eq!(held.serial, 2);

    let err = h
        .pool
        .connection(&StoreRecord::new("a", "a", "postgis"))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::PoolShutdown));
    assert!(matches!(
        h.pool.crs("EPSG:4326").await.unwrap_err(),
        Error::PoolShutdown
    ));
}

#[tokio::test]
async fn test_reset_keeps_pool_usable() {
    let h = harness();
    h.catalog.save_store(lakes_store()).expect("Failed to save");

    h.pool
        .schema(&lakes(), SchemaHints::default())
        .await
        .expect("Failed to build");
    h.pool.crs("EPSG:3857").await.expect("Failed to decode");

    assert_eq!(h.pool.reset(), 3);
    assert_eq!(h.counters.released(), vec![1]);
    assert_eq!(h.pool.dependency_count(), 0);

    let rebuilt = h
        .pool
        .schema(&lakes(), SchemaHints::default())
        .await
        .expect("Failed to rebuild");
    assert_eq!(rebuilt.connection.serial, 2);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_spawned_listener_follows_catalog() {
    let h = harness();
    h.catalog.save_store(lakes_store()).expect("Failed to save");
    let task = h.pool.listener().spawn(h.catalog.subscribe());

    h.pool
        .schema(&lakes(), SchemaHints::default())
        .await
        .expect("Failed to build");
    assert!(h.pool.contains(&lakes_key()));

    h.catalog.save_schema(lakes()).expect("Failed to save");

    tokio::time::timeout(Duration::from_secs(2), async {
        while h.pool.contains(&lakes_key()) {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("Listener did not clear the schema");

    // The connection is untouched by a schema change.
    assert_eq!(h.pool.size_of(ResourceKind::Connection), 1);
    task.abort();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_random_interleavings_release_each_connection_once() {
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    let config = PoolConfig {
        connection_capacity: 2,
        ..Default::default()
    };
    let h = harness_with(config, Duration::from_millis(1));
    let stores: Vec<StoreRecord> = (0..4)
        .map(|i| StoreRecord::new(format!("store-{}", i), "db", "postgis"))
        .collect();

    let workers = (0..8u64).map(|seed| {
        let pool = h.pool.clone();
        let stores = stores.clone();
        tokio::spawn(async move {
            let mut rng = StdRng::seed_from_u64(seed);
            for _ in 0..100 {
                let store = &stores[rng.random_range(0..stores.len())];
                if rng.random_bool(0.2) {
                    pool.clear_connection(store);
                } else {
                    let connection = pool.connection(store).await.expect("Failed to connect");
                    if rng.random_bool(0.5) {
                        tokio::task::yield_now().await;
                    }
                    drop(connection);
                }
            }
        })
    });
    for joined in join_all(workers).await {
        joined.expect("Worker panicked");
    }

    h.pool.dispose();

    let released = h.counters.released();
    let mut unique = released.clone();
    unique.dedup();
    assert_eq!(released, unique, "a connection was released twice");
    assert_eq!(released.len(), h.counters.opened.load(Ordering::SeqCst));
}
