//! Catalog records the pool builds handles from.
//!
//! Records are owned by the catalog. The pool only reads them, and only the
//! `id` takes part in cache addressing.

use crate::key::{RecordId, ResourceKey, ResourceKind};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// A backend store (database, file set, remote service).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreRecord {
    pub id: Option<RecordId>,
    pub name: String,
    pub store_type: String,
    pub enabled: bool,
    /// Ask the catalog to disable the store when opening it fails.
    #[serde(default)]
    pub disable_on_conn_failure: bool,
    #[serde(default)]
    pub params: BTreeMap<String, String>,
}

impl StoreRecord {
    pub fn new(id: impl Into<RecordId>, name: &str, store_type: &str) -> Self {
        StoreRecord {
            id: Some(id.into()),
            name: name.to_string(),
            store_type: store_type.to_string(),
            enabled: true,
            disable_on_conn_failure: false,
            params: BTreeMap::new(),
        }
    }

    /// A store that has not been saved to the catalog yet.
    pub fn transient(name: &str, store_type: &str) -> Self {
        StoreRecord {
            id: None,
            ..StoreRecord::new("", name, store_type)
        }
    }

    pub fn with_param(mut self, key: &str, value: &str) -> Self {
        self.params.insert(key.to_string(), value.to_string());
        self
    }
}

/// A feature type published from a store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchemaRecord {
    pub id: Option<RecordId>,
    pub name: String,
    /// Identity of the backing store record.
    pub store: RecordId,
    pub native_name: String,
    #[serde(default)]
    pub attributes: Vec<String>,
}

impl SchemaRecord {
    pub fn new(id: impl Into<RecordId>, name: &str, store: impl Into<RecordId>) -> Self {
        SchemaRecord {
            id: Some(id.into()),
            name: name.to_string(),
            store: store.into(),
            native_name: name.to_string(),
            attributes: Vec::new(),
        }
    }

    pub fn transient(name: &str, store: impl Into<RecordId>) -> Self {
        SchemaRecord {
            id: None,
            ..SchemaRecord::new("", name, store)
        }
    }
}

/// A style document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StyleRecord {
    pub id: Option<RecordId>,
    pub name: String,
    pub format: String,
    pub body: String,
}

impl StyleRecord {
    pub fn new(id: impl Into<RecordId>, name: &str, format: &str, body: &str) -> Self {
        StyleRecord {
            id: Some(id.into()),
            name: name.to_string(),
            format: format.to_string(),
            body: body.to_string(),
        }
    }
}

/// Construction hints for schemas.
///
/// The regular schema honours the declared projection policy. The raw
/// flavour exposes the native CRS untouched and is cached separately.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SchemaHints {
    pub handle_projection_policy: bool,
}

impl SchemaHints {
    pub const RAW_VARIANT: &'static str = "raw";

    pub fn raw() -> Self {
        SchemaHints {
            handle_projection_policy: false,
        }
    }

    pub(crate) fn qualify(&self, key: ResourceKey) -> ResourceKey {
        if self.handle_projection_policy {
            key
        } else {
            key.with_variant(Self::RAW_VARIANT)
        }
    }
}

impl Default for SchemaHints {
    fn default() -> Self {
        SchemaHints {
            handle_projection_policy: true,
        }
    }
}

/// Kind of catalog record named in a change notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RecordKind {
    Store,
    /// Raster store; described by a [`StoreRecord`] like vector stores.
    CoverageStore,
    FeatureType,
    Style,
}

impl RecordKind {
    /// The cache family holding handles built from this record kind.
    ///
    /// Attribute lists hang off schemas through dependency edges, so a
    /// feature type change reaches them by cascade.
    pub fn resource_kind(&self) -> ResourceKind {
        match self {
            RecordKind::Store => ResourceKind::Connection,
            RecordKind::CoverageStore => ResourceKind::Reader,
            RecordKind::FeatureType => ResourceKind::Schema,
            RecordKind::Style => ResourceKind::Style,
        }
    }
}
