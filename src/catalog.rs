//! The metadata catalog the pool reads from.
//!
//! Record storage, validation and persistence belong to the surrounding
//! system. The pool needs a lookup for store records (to resolve a schema's
//! backing store), a way to disable a failing store, and a stream of change
//! notifications.

use crate::error::{Error, Result};
use crate::key::RecordId;
use crate::record::{RecordKind, SchemaRecord, StoreRecord, StyleRecord};
use dashmap::DashMap;
use tokio::sync::broadcast;

/// Buffered notifications per subscriber before it starts lagging.
const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Catalog lookups used by the pool.
pub trait Catalog: Send + Sync {
    /// Current state of a store record.
    fn store(&self, id: &RecordId) -> Option<StoreRecord>;

    /// Mark a store as disabled after its connection failed.
    fn disable_store(&self, id: &RecordId);
}

/// What happened to a record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Change {
    Saved,
    Removed,
}

/// A catalog mutation notification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CatalogEvent {
    pub change: Change,
    pub identity: RecordId,
    pub record_kind: RecordKind,
}

impl CatalogEvent {
    pub fn saved(record_kind: RecordKind, identity: RecordId) -> Self {
        CatalogEvent {
            change: Change::Saved,
            identity,
            record_kind,
        }
    }

    pub fn removed(record_kind: RecordKind, identity: RecordId) -> Self {
        CatalogEvent {
            change: Change::Removed,
            identity,
            record_kind,
        }
    }
}

/// In-memory catalog (for testing and embedding).
///
/// Every save or remove is published to subscribers.
pub struct InMemoryCatalog {
    stores: DashMap<RecordId, StoreRecord>,
    coverage_stores: DashMap<RecordId, StoreRecord>,
    schemas: DashMap<RecordId, SchemaRecord>,
    styles: DashMap<RecordId, StyleRecord>,
    events: broadcast::Sender<CatalogEvent>,
}

impl InMemoryCatalog {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        InMemoryCatalog {
            stores: DashMap::new(),
            coverage_stores: DashMap::new(),
            schemas: DashMap::new(),
            styles: DashMap::new(),
            events,
        }
    }

    /// Receive notifications for every later mutation.
    pub fn subscribe(&self) -> broadcast::Receiver<CatalogEvent> {
        self.events.subscribe()
    }

    fn publish(&self, event: CatalogEvent) {
        debug!("Catalog {:?} {:?} {}", event.change, event.record_kind, event.identity);
        // No subscribers is fine.
        let _ = self.events.send(event);
    }

    fn require_id(id: &Option<RecordId>, name: &str) -> Result<RecordId> {
        id.clone().ok_or_else(|| {
            Error::InvalidKey(format!("cannot save {} without an identity", name))
        })
    }

    /// Add or update a store.
    ///
    /// # Errors
    /// `Error::InvalidKey` when the record has no identity
    pub fn save_store(&self, store: StoreRecord) -> Result<()> {
        let id = Self::require_id(&store.id, &store.name)?;
        self.stores.insert(id.clone(), store);
        self.publish(CatalogEvent::saved(RecordKind::Store, id));
        Ok(())
    }

    /// Add or update a raster store.
    ///
    /// # Errors
    /// `Error::InvalidKey` when the record has no identity
    pub fn save_coverage_store(&self, store: StoreRecord) -> Result<()> {
        let id = Self::require_id(&store.id, &store.name)?;
        self.coverage_stores.insert(id.clone(), store);
        self.publish(CatalogEvent::saved(RecordKind::CoverageStore, id));
        Ok(())
    }

    /// Add or update a feature type.
    ///
    /// # Errors
    /// `Error::InvalidKey` when the record has no identity
    pub fn save_schema(&self, schema: SchemaRecord) -> Result<()> {
        let id = Self::require_id(&schema.id, &schema.name)?;
        self.schemas.insert(id.clone(), schema);
        self.publish(CatalogEvent::saved(RecordKind::FeatureType, id));
        Ok(())
    }

    /// Add or update a style.
    ///
    /// # Errors
    /// `Error::InvalidKey` when the record has no identity
    pub fn save_style(&self, style: StyleRecord) -> Result<()> {
        let id = Self::require_id(&style.id, &style.name)?;
        self.styles.insert(id.clone(), style);
        self.publish(CatalogEvent::saved(RecordKind::Style, id));
        Ok(())
    }

    pub fn remove_store(&self, id: &RecordId) -> Option<StoreRecord> {
        let (_, removed) = self.stores.remove(id)?;
        self.publish(CatalogEvent::removed(RecordKind::Store, id.clone()));
        Some(removed)
    }

    pub fn remove_coverage_store(&self, id: &RecordId) -> Option<StoreRecord> {
        let (_, removed) = self.coverage_stores.remove(id)?;
        self.publish(CatalogEvent::removed(RecordKind::CoverageStore, id.clone()));
        Some(removed)
    }

    pub fn remove_schema(&self, id: &RecordId) -> Option<SchemaRecord> {
        let (_, removed) = self.schemas.remove(id)?;
        self.publish(CatalogEvent::removed(RecordKind::FeatureType, id.clone()));
        Some(removed)
    }

    pub fn remove_style(&self, id: &RecordId) -> Option<StyleRecord> {
        let (_, removed) = self.styles.remove(id)?;
        self.publish(CatalogEvent::removed(RecordKind::Style, id.clone()));
        Some(removed)
    }

    pub fn coverage_store(&self, id: &RecordId) -> Option<StoreRecord> {
        self.coverage_stores.get(id).map(|entry| entry.value().clone())
    }

    pub fn schema(&self, id: &RecordId) -> Option<SchemaRecord> {
        self.schemas.get(id).map(|entry| entry.value().clone())
    }

    pub fn style(&self, id: &RecordId) -> Option<StyleRecord> {
        self.styles.get(id).map(|entry| entry.value().clone())
    }
}

impl Default for InMemoryCatalog {
    fn default() -> Self {
        Self::new()
    }
}

impl Catalog for InMemoryCatalog {
    fn store(&self, id: &RecordId) -> Option<StoreRecord> {
        self.stores.get(id).map(|entry| entry.value().clone())
    }

    fn disable_store(&self, id: &RecordId) {
        let updated = match self.stores.get_mut(id) {
            Some(mut store) if store.enabled => {
                store.enabled = false;
                true
            }
            _ => false,
        };
        if updated {
            warn!("⚠ Store {} disabled after connection failure", id);
            self.publish(CatalogEvent::saved(RecordKind::Store, id.clone()));
        }
    }
}
