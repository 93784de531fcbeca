//! Pool configuration.

use crate::error::{Error, Result};
use crate::key::ResourceKind;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Default number of ready handles kept per kind.
const DEFAULT_CAPACITY: usize = 100;

/// CRS objects are small and looked up constantly.
const DEFAULT_CRS_CAPACITY: usize = 500;

/// Raster readers hold file handles and decoded headers.
const DEFAULT_READER_CAPACITY: usize = 50;

/// Configuration for a [`ResourcePool`](crate::ResourcePool).
///
/// `schema_capacity` counts feature types: the regular and raw flavours of a
/// type are kept side by side, so the schema table holds up to twice as many
/// entries.
///
/// Every field has a default, so a partial JSON document is enough:
///
/// ```
/// use resource_pool::config::PoolConfig;
///
/// let config = PoolConfig::from_json(r#"{ "schema_capacity": 200 }"#).unwrap();
/// assert_eq!(config.schema_capacity, 200);
/// assert_eq!(config.connection_capacity, 100);
/// ```
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    pub connection_capacity: usize,
    pub schema_capacity: usize,
    pub attributes_capacity: usize,
    pub style_capacity: usize,
    pub crs_capacity: usize,
    pub reader_capacity: usize,
    /// Expand `${name}` placeholders in store parameters before connecting.
    pub allow_env_parametrization: bool,
    /// Placeholder values, consulted before the process environment.
    pub properties: BTreeMap<String, String>,
}

impl Default for PoolConfig {
    fn default() -> Self {
        PoolConfig {
            connection_capacity: DEFAULT_CAPACITY,
            schema_capacity: DEFAULT_CAPACITY,
            attributes_capacity: DEFAULT_CAPACITY,
            style_capacity: DEFAULT_CAPACITY,
            crs_capacity: DEFAULT_CRS_CAPACITY,
            reader_capacity: DEFAULT_READER_CAPACITY,
            allow_env_parametrization: false,
            properties: BTreeMap::new(),
        }
    }
}

impl PoolConfig {
    /// Parse configuration from JSON.
    ///
    /// # Errors
    /// Returns `Error::ConfigError` on malformed JSON or invalid values
    pub fn from_json(json: &str) -> Result<Self> {
        let config: PoolConfig = serde_json::from_str(json)
            .map_err(|e| Error::ConfigError(format!("Invalid pool configuration: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Defaults overridden by environment variables.
    ///
    /// Recognised variables:
    /// - `RESOURCE_POOL_CONNECTION_CAPACITY`
    /// - `RESOURCE_POOL_SCHEMA_CAPACITY`
    /// - `RESOURCE_POOL_ATTRIBUTES_CAPACITY`
    /// - `RESOURCE_POOL_STYLE_CAPACITY`
    /// - `RESOURCE_POOL_CRS_CAPACITY`
    /// - `RESOURCE_POOL_READER_CAPACITY`
    /// - `RESOURCE_POOL_ALLOW_ENV_PARAMETRIZATION` (`true`/`false`)
    ///
    /// # Errors
    /// Returns `Error::ConfigError` if a variable is set but unparsable
    pub fn from_env() -> Result<Self> {
        let mut config = PoolConfig::default();

        if let Some(value) = env_usize("RESOURCE_POOL_CONNECTION_CAPACITY")? {
            config.connection_capacity = value;
        }
        if let Some(value) = env_usize("RESOURCE_POOL_SCHEMA_CAPACITY")? {
            config.schema_capacity = value;
        }
        if let Some(value) = env_usize("RESOURCE_POOL_ATTRIBUTES_CAPACITY")? {
            config.attributes_capacity = value;
        }
        if let Some(value) = env_usize("RESOURCE_POOL_STYLE_CAPACITY")? {
            config.style_capacity = value;
        }
        if let Some(value) = env_usize("RESOURCE_POOL_CRS_CAPACITY")? {
            config.crs_capacity = value;
        }
        if let Some(value) = env_usize("RESOURCE_POOL_READER_CAPACITY")? {
            config.reader_capacity = value;
        }
        if let Ok(value) = std::env::var("RESOURCE_POOL_ALLOW_ENV_PARAMETRIZATION") {
            config.allow_env_parametrization = value.parse().map_err(|_| {
                Error::ConfigError(format!(
                    "RESOURCE_POOL_ALLOW_ENV_PARAMETRIZATION must be true or false, got {:?}",
                    value
                ))
            })?;
        }

        config.validate()?;
        Ok(config)
    }

    /// Reject capacities that would make caching impossible.
    pub fn validate(&self) -> Result<()> {
        for kind in ResourceKind::ALL {
            if self.capacity_for(kind) == 0 {
                return Err(Error::ConfigError(format!(
                    "{} capacity must be at least 1",
                    kind
                )));
            }
        }
        Ok(())
    }

    pub fn capacity_for(&self, kind: ResourceKind) -> usize {
        match kind {
            ResourceKind::Connection => self.connection_capacity,
            ResourceKind::Schema => self.schema_capacity,
            ResourceKind::Attributes => self.attributes_capacity,
            ResourceKind::Style => self.style_capacity,
            ResourceKind::Crs => self.crs_capacity,
            ResourceKind::Reader => self.reader_capacity,
        }
    }
}

fn env_usize(name: &str) -> Result<Option<usize>> {
    match std::env::var(name) {
        Ok(value) => value.parse::<usize>().map(Some).map_err(|_| {
            Error::ConfigError(format!("{} must be a number, got {:?}", name, value))
        }),
        Err(_) => Ok(None),
    }
}
