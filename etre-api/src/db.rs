//! Datasource boundary.
//!
//! The store, schema manager, and CDC pipeline are written against the two
//! traits below; the production document-store driver is a plugin behind
//! them. `MemoryBackend` is the bundled reference implementation, used by
//! the test suite and the dev server. It mirrors the semantics the service
//! depends on: unique-index violations surface as dup-key errors, existence
//! checks treat an empty string as "not set", and patch application
//! increments `_rev` by exactly 1.

use std::collections::{BTreeSet, HashMap};

use async_trait::async_trait;
use etre_core::query::{Cond, Filter};
use etre_core::{CdcEvent, Entity, EventFilter, Value, META_LABEL_REV};
use parking_lot::RwLock;
use thiserror::Error;
use tokio::sync::{broadcast, mpsc};

// ============================================================================
// ERRORS
// ============================================================================

/// Errors surfaced by a datasource driver.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DbError {
    /// A write violated a unique index.
    #[error("duplicate key on index {index}")]
    DuplicateKey { index: String },

    /// The backing store allows one index build per collection at a time.
    #[error("index build already in progress on {collection}")]
    IndexBuildInProgress { collection: String },

    /// Transport or availability failure; the only retryable class.
    #[error("datasource unavailable: {0}")]
    Unavailable(String),

    /// The operation itself is malformed (semantic, never retried).
    #[error("invalid operation: {0}")]
    Invalid(String),

    #[error("datasource error: {0}")]
    Other(String),
}

impl DbError {
    /// Transport errors may be retried; semantic errors may not.
    pub fn is_transient(&self) -> bool {
        matches!(self, DbError::Unavailable(_))
    }
}

impl From<DbError> for etre_core::Error {
    fn from(err: DbError) -> Self {
        match err {
            DbError::DuplicateKey { index } => etre_core::Error::duplicate_entity(format!(
                "identifying labels conflict with another entity (index {})",
                index
            )),
            other => etre_core::Error::internal(other.to_string()),
        }
    }
}

// ============================================================================
// TRAITS
// ============================================================================

/// Index definition handed to the driver. Directions are encoded in the
/// name; drivers that support ordered indexes read them from there.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexModel {
    pub name: String,
    pub keys: Vec<String>,
    pub unique: bool,
    pub sparse: bool,
}

/// Entity-collection operations the core consumes.
#[async_trait]
pub trait EntityBackend: Send + Sync {
    /// All entities matching the filter, in the collection's natural order.
    async fn find(&self, collection: &str, filter: &Filter) -> Result<Vec<Entity>, DbError>;

    /// Unique values of one label across matching entities.
    async fn distinct(
        &self,
        collection: &str,
        label: &str,
        filter: &Filter,
    ) -> Result<Vec<Value>, DbError>;

    async fn insert_one(&self, collection: &str, entity: &Entity) -> Result<(), DbError>;

    /// Apply the patch to the first matching entity and increment its
    /// `_rev`; returns the document as it was before the update.
    async fn find_one_and_update(
        &self,
        collection: &str,
        filter: &Filter,
        patch: &Entity,
    ) -> Result<Option<Entity>, DbError>;

    /// Remove the first matching entity; returns the prior document.
    async fn find_one_and_delete(
        &self,
        collection: &str,
        filter: &Filter,
    ) -> Result<Option<Entity>, DbError>;

    /// Remove one label from the entity with the given id and increment its
    /// `_rev`; returns the document as it was before the update.
    async fn find_one_and_remove_label(
        &self,
        collection: &str,
        id: &str,
        label: &str,
    ) -> Result<Option<Entity>, DbError>;

    /// Idempotent index creation.
    async fn ensure_index(&self, collection: &str, index: &IndexModel) -> Result<(), DbError>;

    async fn list_indexes(&self, collection: &str) -> Result<Vec<String>, DbError>;

    async fn drop_index(&self, collection: &str, name: &str) -> Result<(), DbError>;

    /// Install or replace the collection's JSON-schema validator.
    async fn set_validator(
        &self,
        collection: &str,
        validator: serde_json::Value,
        level: &str,
    ) -> Result<(), DbError>;

    async fn remove_validator(&self, collection: &str) -> Result<(), DbError>;

    async fn ping(&self) -> Result<(), DbError>;
}

/// CDC-collection operations the core consumes.
#[async_trait]
pub trait EventBackend: Send + Sync {
    async fn append_event(&self, event: &CdcEvent) -> Result<(), DbError>;

    /// Events matching the filter, ordered by `ts` ascending with ties in
    /// write order.
    async fn read_events(&self, filter: &EventFilter) -> Result<Vec<CdcEvent>, DbError>;

    /// The store's native change stream: every event appended after this
    /// call, in write order.
    async fn watch_events(&self) -> Result<mpsc::Receiver<CdcEvent>, DbError>;

    async fn ping(&self) -> Result<(), DbError>;
}

// ============================================================================
// FILTER EVALUATION
// ============================================================================

/// Whether one condition holds for an entity. Shared by the memory driver;
/// a remote driver translates `Cond` to its own query language instead.
pub fn cond_matches(entity: &Entity, field: &str, cond: &Cond) -> bool {
    let value = entity.get(field);
    match cond {
        // Present-but-empty-string is indistinguishable from absent.
        Cond::Exists => value.map_or(false, |v| !v.is_empty_string()),
        Cond::NotExists => value.map_or(true, |v| v.is_empty_string()),
        Cond::Eq(want) => value == Some(want),
        Cond::Ne(want) => value != Some(want),
        Cond::Lt(want) => match (value, want) {
            (Some(Value::Int(a)), Value::Int(b)) => a < b,
            (Some(Value::String(a)), Value::String(b)) => a < b,
            _ => false,
        },
        Cond::Gt(want) => match (value, want) {
            (Some(Value::Int(a)), Value::Int(b)) => a > b,
            (Some(Value::String(a)), Value::String(b)) => a > b,
            _ => false,
        },
        Cond::In(set) => value.map_or(false, |v| set.contains(v)),
        Cond::NotIn(set) => value.map_or(true, |v| !set.contains(v)),
    }
}

/// Whether the whole conjunctive filter matches an entity.
pub fn filter_matches(entity: &Entity, filter: &Filter) -> bool {
    if let Some(id) = entity.id() {
        if filter.exclude_ids.iter().any(|x| x == id) {
            return false;
        }
    }
    filter
        .conds
        .iter()
        .all(|(field, cond)| cond_matches(entity, field, cond))
}

// ============================================================================
// MEMORY BACKEND
// ============================================================================

const WATCH_BUFFER: usize = 1024;

#[derive(Default)]
struct Collection {
    /// Insertion-ordered; reads scan in this order.
    docs: Vec<Entity>,
    indexes: Vec<IndexModel>,
    validator: Option<(serde_json::Value, String)>,
}

/// In-process reference driver implementing both backend traits.
pub struct MemoryBackend {
    collections: RwLock<HashMap<String, Collection>>,
    events: RwLock<Vec<CdcEvent>>,
    event_tx: broadcast::Sender<CdcEvent>,
}

impl Default for MemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryBackend {
    pub fn new() -> Self {
        let (event_tx, _) = broadcast::channel(WATCH_BUFFER);
        Self {
            collections: RwLock::new(HashMap::new()),
            events: RwLock::new(Vec::new()),
            event_tx,
        }
    }

    /// The key tuple an entity occupies in an index; None for a sparse
    /// index the entity does not participate in. A missing label counts as
    /// null, so two documents missing a non-sparse unique key conflict.
    fn index_key(index: &IndexModel, entity: &Entity) -> Option<Vec<Option<Value>>> {
        let key: Vec<Option<Value>> = index
            .keys
            .iter()
            .map(|k| entity.get(k).cloned())
            .collect();
        if index.sparse && key.iter().any(Option::is_none) {
            return None;
        }
        Some(key)
    }

    /// The installed validator and validation level for a collection.
    pub fn validator(&self, collection: &str) -> Option<(serde_json::Value, String)> {
        self.collections
            .read()
            .get(collection)
            .and_then(|c| c.validator.clone())
    }

    /// Check `candidate` against every unique index, ignoring the document
    /// with `skip_id` (the document being replaced).
    fn check_unique(
        coll: &Collection,
        candidate: &Entity,
        skip_id: Option<&str>,
    ) -> Result<(), DbError> {
        for index in coll.indexes.iter().filter(|i| i.unique) {
            let Some(key) = Self::index_key(index, candidate) else {
                continue;
            };
            for doc in &coll.docs {
                if skip_id.is_some() && doc.id() == skip_id {
                    continue;
                }
                if Self::index_key(index, doc) == Some(key.clone()) {
                    return Err(DbError::DuplicateKey {
                        index: index.name.clone(),
                    });
                }
            }
        }
        Ok(())
    }
}

#[async_trait]
impl EntityBackend for MemoryBackend {
    async fn find(&self, collection: &str, filter: &Filter) -> Result<Vec<Entity>, DbError> {
        let collections = self.collections.read();
        let Some(coll) = collections.get(collection) else {
            return Ok(Vec::new());
        };
        Ok(coll
            .docs
            .iter()
            .filter(|doc| filter_matches(doc, filter))
            .cloned()
            .collect())
    }

    async fn distinct(
        &self,
        collection: &str,
        label: &str,
        filter: &Filter,
    ) -> Result<Vec<Value>, DbError> {
        let collections = self.collections.read();
        let Some(coll) = collections.get(collection) else {
            return Ok(Vec::new());
        };
        let values: BTreeSet<Value> = coll
            .docs
            .iter()
            .filter(|doc| filter_matches(doc, filter))
            .filter_map(|doc| doc.get(label).cloned())
            .collect();
        Ok(values.into_iter().collect())
    }

    async fn insert_one(&self, collection: &str, entity: &Entity) -> Result<(), DbError> {
        let mut collections = self.collections.write();
        let coll = collections.entry(collection.to_string()).or_default();
        Self::check_unique(coll, entity, None)?;
        coll.docs.push(entity.clone());
        Ok(())
    }

    async fn find_one_and_update(
        &self,
        collection: &str,
        filter: &Filter,
        patch: &Entity,
    ) -> Result<Option<Entity>, DbError> {
        let mut collections = self.collections.write();
        let Some(coll) = collections.get_mut(collection) else {
            return Ok(None);
        };
        let Some(pos) = coll.docs.iter().position(|doc| filter_matches(doc, filter)) else {
            return Ok(None);
        };

        let prior = coll.docs[pos].clone();
        let mut updated = prior.clone();
        for (label, value) in patch.iter() {
            updated.insert(label.clone(), value.clone());
        }
        let rev = prior.rev().unwrap_or(0);
        updated.insert(META_LABEL_REV, Value::Int(rev + 1));

        Self::check_unique(coll, &updated, prior.id())?;
        coll.docs[pos] = updated;
        Ok(Some(prior))
    }

    async fn find_one_and_delete(
        &self,
        collection: &str,
        filter: &Filter,
    ) -> Result<Option<Entity>, DbError> {
        let mut collections = self.collections.write();
        let Some(coll) = collections.get_mut(collection) else {
            return Ok(None);
        };
        let Some(pos) = coll.docs.iter().position(|doc| filter_matches(doc, filter)) else {
            return Ok(None);
        };
        Ok(Some(coll.docs.remove(pos)))
    }

    async fn find_one_and_remove_label(
        &self,
        collection: &str,
        id: &str,
        label: &str,
    ) -> Result<Option<Entity>, DbError> {
        let mut collections = self.collections.write();
        let Some(coll) = collections.get_mut(collection) else {
            return Ok(None);
        };
        let Some(pos) = coll
            .docs
            .iter()
            .position(|doc| doc.id() == Some(id))
        else {
            return Ok(None);
        };

        let prior = coll.docs[pos].clone();
        let mut updated = prior.clone();
        updated.remove(label);
        let rev = prior.rev().unwrap_or(0);
        updated.insert(META_LABEL_REV, Value::Int(rev + 1));
        coll.docs[pos] = updated;
        Ok(Some(prior))
    }

    async fn ensure_index(&self, collection: &str, index: &IndexModel) -> Result<(), DbError> {
        let mut collections = self.collections.write();
        let coll = collections.entry(collection.to_string()).or_default();
        if !coll.indexes.iter().any(|i| i.name == index.name) {
            coll.indexes.push(index.clone());
        }
        Ok(())
    }

    async fn list_indexes(&self, collection: &str) -> Result<Vec<String>, DbError> {
        let collections = self.collections.read();
        Ok(collections
            .get(collection)
            .map(|c| c.indexes.iter().map(|i| i.name.clone()).collect())
            .unwrap_or_default())
    }

    async fn drop_index(&self, collection: &str, name: &str) -> Result<(), DbError> {
        let mut collections = self.collections.write();
        if let Some(coll) = collections.get_mut(collection) {
            coll.indexes.retain(|i| i.name != name);
        }
        Ok(())
    }

    async fn set_validator(
        &self,
        collection: &str,
        validator: serde_json::Value,
        level: &str,
    ) -> Result<(), DbError> {
        let mut collections = self.collections.write();
        let coll = collections.entry(collection.to_string()).or_default();
        coll.validator = Some((validator, level.to_string()));
        Ok(())
    }

    async fn remove_validator(&self, collection: &str) -> Result<(), DbError> {
        let mut collections = self.collections.write();
        if let Some(coll) = collections.get_mut(collection) {
            coll.validator = None;
        }
        Ok(())
    }

    async fn ping(&self) -> Result<(), DbError> {
        Ok(())
    }
}

#[async_trait]
impl EventBackend for MemoryBackend {
    async fn append_event(&self, event: &CdcEvent) -> Result<(), DbError> {
        self.events.write().push(event.clone());
        // No receivers is fine; the change-stream server may not be running.
        let _ = self.event_tx.send(event.clone());
        Ok(())
    }

    async fn read_events(&self, filter: &EventFilter) -> Result<Vec<CdcEvent>, DbError> {
        let mut events: Vec<CdcEvent> = self
            .events
            .read()
            .iter()
            .filter(|ev| filter.matches(ev))
            .cloned()
            .collect();
        // Stable sort keeps equal-ts events in write order.
        events.sort_by_key(|ev| ev.ts);
        Ok(events)
    }

    async fn watch_events(&self) -> Result<mpsc::Receiver<CdcEvent>, DbError> {
        let mut rx = self.event_tx.subscribe();
        let (tx, out) = mpsc::channel(WATCH_BUFFER);
        tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(event) => {
                        if tx.send(event).await.is_err() {
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        tracing::warn!(skipped = n, "change stream tail lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });
        Ok(out)
    }

    async fn ping(&self) -> Result<(), DbError> {
        Ok(())
    }
}
