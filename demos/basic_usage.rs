//! Basic usage example of the resource pool.

use resource_pool::{
    error::Result, DriverError, Drivers, InMemoryCatalog, RecordId, ResourcePool, SchemaHints,
    SchemaRecord, StoreRecord, StyleRecord,
};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Simulated database connection
#[derive(Debug)]
struct Connection {
    url: String,
    serial: usize,
}

/// Simulated feature type description
#[derive(Debug)]
struct FeatureType {
    table: String,
    columns: Vec<String>,
    connection: Arc<Connection>,
}

/// Simulated raster reader
#[derive(Debug)]
struct RasterReader {
    path: String,
}

/// Drivers that pretend to talk to a spatial database
#[derive(Default)]
struct DemoDrivers {
    opened: AtomicUsize,
}

impl Drivers for DemoDrivers {
    type Connection = Connection;
    type Schema = FeatureType;
    type Attributes = Vec<String>;
    type Style = String;
    type Crs = String;
    type Reader = RasterReader;

    async fn open_connection(&self, store: &StoreRecord) -> std::result::Result<Connection, DriverError> {
        let url = store.params.get("url").cloned().unwrap_or_default();
        println!("  [DB] Connecting to {}", url);
        tokio::time::sleep(Duration::from_millis(200)).await;
        Ok(Connection {
            url,
            serial: self.opened.fetch_add(1, Ordering::SeqCst) + 1,
        })
    }

    async fn build_schema(
        &self,
        schema: &SchemaRecord,
        _hints: &SchemaHints,
        connection: Arc<Connection>,
    ) -> std::result::Result<FeatureType, DriverError> {
        println!("  [DB] Describing table {}", schema.native_name);
        tokio::time::sleep(Duration::from_millis(100)).await;
        Ok(FeatureType {
            table: schema.native_name.clone(),
            columns: schema.attributes.clone(),
            connection,
        })
    }

    async fn describe_attributes(
        &self,
        _schema: &SchemaRecord,
        built: Arc<FeatureType>,
    ) -> std::result::Result<Vec<String>, DriverError> {
        Ok(built
            .columns
            .iter()
            .map(|column| format!("{}.{}", built.table, column))
            .collect())
    }

    async fn parse_style(&self, style: &StyleRecord) -> std::result::Result<String, DriverError> {
        Ok(format!("{} ({} bytes of {})", style.name, style.body.len(), style.format))
    }

    async fn decode_crs(&self, code: &str) -> std::result::Result<String, DriverError> {
        Ok(code.to_uppercase())
    }

    async fn open_reader(&self, store: &StoreRecord) -> std::result::Result<RasterReader, DriverError> {
        let path = store.params.get("path").cloned().unwrap_or_default();
        println!("  [FS] Opening raster {}", path);
        Ok(RasterReader { path })
    }

    fn release_connection(&self, connection: &Connection) -> std::result::Result<(), DriverError> {
        println!("  [DB] Closing connection #{} to {}", connection.serial, connection.url);
        Ok(())
    }

    fn release_reader(&self, reader: &RasterReader) -> std::result::Result<(), DriverError> {
        println!("  [FS] Closing raster {}", reader.path);
        Ok(())
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    env_logger::Builder::from_default_env()
        .filter_level(log::LevelFilter::Debug)
        .try_init()
        .ok();

    println!("\n=== Resource Pool - Basic Example ===\n");

    // 1. Catalog, pool and change listener
    println!("1. Creating catalog and pool...");
    let catalog = Arc::new(InMemoryCatalog::new());
    let pool = ResourcePool::new(DemoDrivers::default(), catalog.clone());
    let listener = pool.listener().spawn(catalog.subscribe());

    let store = StoreRecord::new("42", "lakes_db", "postgis")
        .with_param("url", "postgres://localhost/gis");
    catalog.save_store(store.clone())?;
    let mut lakes = SchemaRecord::new("ft-lakes", "lakes", "42");
    lakes.native_name = "lakes".to_string();
    lakes.attributes = vec!["name".to_string(), "geom".to_string()];
    println!("   ✓ Pool ready\n");

    // 2. Five concurrent requests share one construction
    println!("2. Five concurrent requests for the lakes schema:");
    let requests = (0..5).map(|_| {
        let pool = pool.clone();
        let lakes = lakes.clone();
        tokio::spawn(async move { pool.schema(&lakes, SchemaHints::default()).await })
    });
    let mut schemas = Vec::new();
    for request in futures::future::join_all(requests).await {
        match request {
            Ok(schema) => schemas.push(schema?),
            Err(e) => println!("   ✗ Request task failed: {}", e),
        }
    }
    if let Some(first) = schemas.first() {
        let shared = schemas.iter().all(|schema| Arc::ptr_eq(schema, first));
        println!(
            "   ✓ {} results, same handle: {}, table {} with {:?}\n",
            schemas.len(),
            shared,
            first.table,
            first.columns
        );
    }

    // 3. Saving the store invalidates the connection and the schema
    println!("3. Saving the store record:");
    catalog.save_store(store.with_param("url", "postgres://replica/gis"))?;
    tokio::time::sleep(Duration::from_millis(50)).await;

    let rebuilt = pool.schema(&lakes, SchemaHints::default()).await?;
    println!(
        "   ✓ Rebuilt schema on connection #{} to {}\n",
        rebuilt.connection.serial, rebuilt.connection.url
    );

    // 4. Attribute lists and raster readers
    println!("4. Attribute list and raster reader:");
    let attributes = pool.attributes(&lakes).await?;
    let dem = StoreRecord::new("dem", "elevation", "geotiff").with_param("path", "/data/dem.tif");
    catalog.save_coverage_store(dem.clone())?;
    let reader = pool.reader(&dem).await?;
    println!("   ✓ Attributes {:?}, reader on {}\n", attributes, reader.path);

    // 5. Transient records are never cached
    println!("5. Transient style (no identity yet):");
    let mut draft = StyleRecord::new("unused", "draft", "sld", "<StyledLayerDescriptor/>");
    draft.id = None;
    let first = pool.style(&draft).await?;
    let second = pool.style(&draft).await?;
    println!("   ✓ Parsed {}, cached: {}\n", first, Arc::ptr_eq(&first, &second));

    // 6. Removing the store forgets everything built from it
    println!("6. Removing the store record:");
    drop(schemas);
    drop(rebuilt);
    catalog.remove_store(&RecordId::from("42"));
    tokio::time::sleep(Duration::from_millis(50)).await;
    println!(
        "   ✓ Cached connections: {}, schemas: {}\n",
        pool.size_of(resource_pool::ResourceKind::Connection),
        pool.size_of(resource_pool::ResourceKind::Schema)
    );

    // 7. Shutdown
    println!("7. Disposing the pool:");
    let released = pool.dispose();
    listener.abort();
    println!("   ✓ Released {} handles\n", released);

    Ok(())
}
