//! Backend drivers: the constructors and disposers the pool calls.

use crate::error::DriverError;
use crate::record::{SchemaHints, SchemaRecord, StoreRecord, StyleRecord};
use std::future::Future;
use std::sync::Arc;

/// Builds handles from catalog records.
///
/// One constructor per resource kind, plus release calls for connections and
/// raster readers, the kinds holding native or I/O resources. Constructors may perform
/// blocking-looking I/O; they always run outside the pool's table locks and
/// are not assumed idempotent.
///
/// # Example
///
/// ```ignore
/// struct PostgisDrivers;
///
/// impl Drivers for PostgisDrivers {
///     type Connection = PgPool;
///     type Schema = FeatureType;
///     type Attributes = Vec<AttributeType>;
///     type Style = Style;
///     type Crs = Crs;
///     type Reader = GeoTiffReader;
///
///     async fn open_connection(&self, store: &StoreRecord) -> Result<PgPool, DriverError> {
///         Ok(PgPool::connect(&store.params["url"]).await?)
///     }
///     // ...
/// }
/// ```
pub trait Drivers: Send + Sync + 'static {
    type Connection: Send + Sync + 'static;
    type Schema: Send + Sync + 'static;
    type Attributes: Send + Sync + 'static;
    type Style: Send + Sync + 'static;
    type Crs: Send + Sync + 'static;
    type Reader: Send + Sync + 'static;

    /// Open a live connection to the store.
    ///
    /// Receives the parameter-expanded copy of the record when environment
    /// parametrization is enabled.
    fn open_connection(
        &self,
        store: &StoreRecord,
    ) -> impl Future<Output = Result<Self::Connection, DriverError>> + Send;

    /// Describe a feature type using its store's connection.
    fn build_schema(
        &self,
        schema: &SchemaRecord,
        hints: &SchemaHints,
        connection: Arc<Self::Connection>,
    ) -> impl Future<Output = Result<Self::Schema, DriverError>> + Send;

    /// List the attributes of a feature type from its built schema.
    fn describe_attributes(
        &self,
        schema: &SchemaRecord,
        built: Arc<Self::Schema>,
    ) -> impl Future<Output = Result<Self::Attributes, DriverError>> + Send;

    /// Decode a style document.
    fn parse_style(
        &self,
        style: &StyleRecord,
    ) -> impl Future<Output = Result<Self::Style, DriverError>> + Send;

    /// Decode a coordinate reference system from its code.
    fn decode_crs(&self, code: &str)
        -> impl Future<Output = Result<Self::Crs, DriverError>> + Send;

    /// Open a raster reader on a coverage store.
    fn open_reader(
        &self,
        store: &StoreRecord,
    ) -> impl Future<Output = Result<Self::Reader, DriverError>> + Send;

    /// Release a connection removed from the pool.
    fn release_connection(&self, _connection: &Self::Connection) -> Result<(), DriverError> {
        Ok(())
    }

    /// Release a reader removed from the pool.
    fn release_reader(&self, _reader: &Self::Reader) -> Result<(), DriverError> {
        Ok(())
    }
}
