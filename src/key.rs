//! Resource keys.
//!
//! A key is derived from a record's persistent identity, never from its
//! mutable content, so the same record addresses the same cache slot across
//! saves.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

/// The family of handle a key addresses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ResourceKind {
    /// Live backend connection built from a store record.
    Connection,
    /// Parsed schema description built from a feature type record.
    Schema,
    /// Attribute list of a feature type, derived from its schema.
    Attributes,
    /// Decoded style document.
    Style,
    /// Coordinate reference system, keyed by its code.
    Crs,
    /// Native raster reader opened on a coverage store.
    Reader,
}

impl ResourceKind {
    pub const ALL: [ResourceKind; 6] = [
        ResourceKind::Connection,
        ResourceKind::Schema,
        ResourceKind::Attributes,
        ResourceKind::Style,
        ResourceKind::Crs,
        ResourceKind::Reader,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ResourceKind::Connection => "connection",
            ResourceKind::Schema => "schema",
            ResourceKind::Attributes => "attributes",
            ResourceKind::Style => "style",
            ResourceKind::Crs => "crs",
            ResourceKind::Reader => "reader",
        }
    }
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Persistent identity of a catalog record.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RecordId(Arc<str>);

impl RecordId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for RecordId {
    fn from(value: &str) -> Self {
        RecordId(Arc::from(value))
    }
}

impl From<String> for RecordId {
    fn from(value: String) -> Self {
        RecordId(Arc::from(value))
    }
}

impl fmt::Display for RecordId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Address of one cache entry.
///
/// Format when displayed: `"{kind}:{identity}"`, or
/// `"{kind}:{identity}#{variant}"` for hint-qualified entries.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ResourceKey {
    kind: ResourceKind,
    identity: RecordId,
    variant: Option<Arc<str>>,
}

impl ResourceKey {
    pub fn new(kind: ResourceKind, identity: RecordId) -> Self {
        ResourceKey {
            kind,
            identity,
            variant: None,
        }
    }

    /// Derive a key from a record identity that may not exist yet.
    ///
    /// # Errors
    ///
    /// `Error::InvalidKey` when the record is transient (never saved).
    pub fn for_record(kind: ResourceKind, identity: Option<&RecordId>) -> Result<Self> {
        match identity {
            Some(id) if !id.as_str().is_empty() => Ok(ResourceKey::new(kind, id.clone())),
            _ => Err(Error::InvalidKey(format!(
                "{} record has no persistent identity",
                kind
            ))),
        }
    }

    /// Qualify the key with a construction variant.
    pub fn with_variant(mut self, variant: &str) -> Self {
        self.variant = Some(Arc::from(variant));
        self
    }

    pub fn kind(&self) -> ResourceKind {
        self.kind
    }

    pub fn identity(&self) -> &RecordId {
        &self.identity
    }

    pub fn variant(&self) -> Option<&str> {
        self.variant.as_deref()
    }

    /// Same kind and identity, ignoring the variant.
    pub fn same_record(&self, other: &ResourceKey) -> bool {
        self.kind == other.kind && self.identity == other.identity
    }
}

impl fmt::Display for ResourceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.variant {
            Some(variant) => write!(f, "{}:{}#{}", self.kind, self.identity, variant),
            None => write!(f, "{}:{}", self.kind, self.identity),
        }
    }
}
