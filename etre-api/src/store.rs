//! Entity store: the write and read paths for labeled entities.
//!
//! Every mutation that commits also emits one CDC event, after the commit.
//! Event delivery is best-effort from the caller's point of view: the CDC
//! store retries and falls back to disk, and a final failure is logged
//! rather than failing a request whose entity change is already visible.
//!
//! Writes are sequences of single-document operations, never batch updates,
//! so each affected entity can be observed before and after and its event
//! can carry the exact prior values.
//!
//! Every operation takes a cancellation token, checked at each suspension
//! point. A cancelled request stops between documents with its partial
//! result; it never stops between a commit and that commit's event.

use std::sync::Arc;

use etre_core::query::{translate, Query};
use etre_core::{
    is_meta_label, CdcEvent, Entity, Error, Op, QueryFilter, Result, Value, META_LABEL_ID,
    META_LABEL_REV, META_LABEL_TYPE, SET_LABEL_ID, SET_LABEL_OP, SET_LABEL_SIZE,
};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::cdc::CdcWriter;
use crate::db::EntityBackend;

// ============================================================================
// WRITE OP & RESULTS
// ============================================================================

/// Metadata common to every write: who, what type, and optional change-set
/// tags copied onto each CDC event of the call.
#[derive(Debug, Clone, Default)]
pub struct WriteOp {
    pub caller: String,
    pub entity_type: String,
    /// Target entity for by-id operations (delete label).
    pub entity_id: Option<String>,
    pub set_id: Option<String>,
    pub set_op: Option<String>,
    pub set_size: Option<i64>,
}

/// Outcome of a batched write: what committed, plus the terminal error when
/// the batch stopped early. Partial success is data, not an exception.
#[derive(Debug, Clone, PartialEq)]
pub struct WriteResult<T> {
    pub committed: Vec<T>,
    pub error: Option<Error>,
}

impl<T> WriteResult<T> {
    pub fn ok(committed: Vec<T>) -> Self {
        Self {
            committed,
            error: None,
        }
    }

    pub fn failed(committed: Vec<T>, error: Error) -> Self {
        Self {
            committed,
            error: Some(error),
        }
    }

    pub fn rejected(error: Error) -> Self {
        Self {
            committed: Vec::new(),
            error: Some(error),
        }
    }
}

/// Change-set tags for one mutation: the write op's tags, overridden by any
/// `_set*` labels lifted off the entity or patch. Lifted labels are removed
/// so they are never stored.
#[derive(Debug, Clone, Default)]
struct SetTags {
    id: Option<String>,
    op: Option<String>,
    size: Option<i64>,
}

impl SetTags {
    fn from_wo(wo: &WriteOp) -> Self {
        Self {
            id: wo.set_id.clone(),
            op: wo.set_op.clone(),
            size: wo.set_size,
        }
    }

    fn lift(entity: &mut Entity, wo: &WriteOp) -> Self {
        let mut tags = Self::from_wo(wo);
        if let Some(v) = entity.remove(SET_LABEL_ID) {
            tags.id = tag_string(v);
        }
        if let Some(v) = entity.remove(SET_LABEL_OP) {
            tags.op = tag_string(v);
        }
        if let Some(v) = entity.remove(SET_LABEL_SIZE) {
            tags.size = v.as_int();
        }
        tags
    }

    fn apply(&self, event: &mut CdcEvent) {
        event.set_id = self.id.clone();
        event.set_op = self.op.clone();
        event.set_size = self.size;
    }
}

fn tag_string(value: Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s),
        Value::Int(i) => Some(i.to_string()),
        _ => None,
    }
}

fn new_id() -> String {
    Uuid::new_v4().simple().to_string()
}

fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

fn cancelled() -> Error {
    Error::internal("request cancelled")
}

// ============================================================================
// STORE
// ============================================================================

pub struct Store {
    backend: Arc<dyn EntityBackend>,
    cdc: Arc<dyn CdcWriter>,
    entity_types: Vec<String>,
}

impl Store {
    pub fn new(
        backend: Arc<dyn EntityBackend>,
        cdc: Arc<dyn CdcWriter>,
        entity_types: Vec<String>,
    ) -> Self {
        Self {
            backend,
            cdc,
            entity_types,
        }
    }

    pub fn entity_types(&self) -> &[String] {
        &self.entity_types
    }

    /// Resolve an entity type to its backing collection. Each type maps to
    /// the collection of the same name.
    fn collection<'a>(&self, entity_type: &'a str) -> Result<&'a str> {
        if self.entity_types.iter().any(|t| t == entity_type) {
            Ok(entity_type)
        } else {
            Err(Error::invalid_param(format!(
                "unknown entity type: {}",
                entity_type
            )))
        }
    }

    // ========================================================================
    // READ
    // ========================================================================

    pub async fn read_entities(
        &self,
        ctx: &CancellationToken,
        entity_type: &str,
        query: &Query,
        filter: &QueryFilter,
    ) -> Result<Vec<Entity>> {
        let coll = self.collection(entity_type)?;
        filter.validate()?;
        if ctx.is_cancelled() {
            return Err(cancelled());
        }
        let db_filter = translate(query);

        if filter.distinct {
            let label = &filter.return_labels[0];
            let values = self.backend.distinct(coll, label, &db_filter).await?;
            return Ok(values
                .into_iter()
                .map(|v| {
                    let mut e = Entity::new();
                    e.insert(label.clone(), v);
                    e
                })
                .collect());
        }

        let entities = self.backend.find(coll, &db_filter).await?;
        Ok(entities
            .into_iter()
            .map(|e| e.project(&filter.return_labels))
            .collect())
    }

    // ========================================================================
    // INSERT
    // ========================================================================

    /// Insert a batch of new entities in order, stopping at the first
    /// failure. Returns the server-assigned ids of the committed inserts.
    pub async fn create_entities(
        &self,
        ctx: &CancellationToken,
        wo: &WriteOp,
        entities: Vec<Entity>,
    ) -> WriteResult<String> {
        let coll = match self.collection(&wo.entity_type) {
            Ok(c) => c,
            Err(e) => return WriteResult::rejected(e),
        };
        if entities.is_empty() {
            return WriteResult::rejected(Error::no_content());
        }
        // Validate the whole batch before touching the database.
        for entity in &entities {
            if let Err(e) = validate_new_entity(entity, &wo.entity_type) {
                return WriteResult::rejected(e);
            }
        }

        let mut ids: Vec<String> = Vec::new();
        for mut entity in entities {
            if ctx.is_cancelled() {
                return WriteResult::failed(ids, cancelled());
            }
            let tags = SetTags::lift(&mut entity, wo);

            let id = new_id();
            entity.insert(META_LABEL_ID, Value::String(id.clone()));
            entity.insert(META_LABEL_TYPE, Value::String(wo.entity_type.clone()));
            entity.insert(META_LABEL_REV, Value::Int(0));

            if let Err(e) = self.backend.insert_one(coll, &entity).await {
                tracing::warn!(
                    entity_type = %wo.entity_type,
                    committed = ids.len(),
                    error = %e,
                    "insert batch stopped"
                );
                return WriteResult::failed(ids, e.into());
            }

            let mut event = self.event(wo, Op::Insert, &id, 0);
            event.new = Some(entity.clone());
            tags.apply(&mut event);
            self.emit(event).await;

            ids.push(id);
        }

        WriteResult::ok(ids)
    }

    // ========================================================================
    // UPDATE
    // ========================================================================

    /// Patch every entity matching the query, one find-and-update at a
    /// time. Returns diff entities: `_id`, `_type`, pre-update `_rev`, and
    /// each patched label at its previous value.
    pub async fn update_entities(
        &self,
        ctx: &CancellationToken,
        wo: &WriteOp,
        query: &Query,
        mut patch: Entity,
    ) -> WriteResult<Entity> {
        let coll = match self.collection(&wo.entity_type) {
            Ok(c) => c,
            Err(e) => return WriteResult::rejected(e),
        };
        let tags = SetTags::lift(&mut patch, wo);
        if patch.is_empty() {
            return WriteResult::rejected(Error::no_content());
        }
        if let Some(label) = patch.iter().map(|(k, _)| k).find(|k| is_meta_label(k)) {
            return WriteResult::rejected(Error::invalid_param(format!(
                "patch cannot set meta-label {}",
                label
            )));
        }

        let base_filter = translate(query);
        let mut diffs: Vec<Entity> = Vec::new();
        let mut updated_ids: Vec<String> = Vec::new();

        loop {
            if ctx.is_cancelled() {
                return WriteResult::failed(diffs, cancelled());
            }
            // Excluding already-updated ids guarantees termination even
            // when the patch does not change any queried label.
            let mut filter = base_filter.clone();
            filter.exclude_ids = updated_ids.clone();

            let prior = match self.backend.find_one_and_update(coll, &filter, &patch).await {
                Ok(Some(prior)) => prior,
                Ok(None) => break,
                Err(e) => {
                    tracing::warn!(
                        entity_type = %wo.entity_type,
                        updated = diffs.len(),
                        error = %e,
                        "update loop stopped"
                    );
                    return WriteResult::failed(diffs, e.into());
                }
            };

            let Some(id) = prior.id().map(str::to_string) else {
                return WriteResult::failed(
                    diffs,
                    Error::internal("updated entity has no _id"),
                );
            };
            let prior_rev = prior.rev().unwrap_or(0);

            let mut diff = Entity::new();
            diff.insert(META_LABEL_ID, Value::String(id.clone()));
            diff.insert(
                META_LABEL_TYPE,
                Value::String(prior.entity_type().unwrap_or(wo.entity_type.as_str()).to_string()),
            );
            diff.insert(META_LABEL_REV, Value::Int(prior_rev));

            let mut old = Entity::new();
            let mut new = Entity::new();
            for (label, new_value) in patch.iter() {
                if let Some(prior_value) = prior.get(label) {
                    diff.insert(label.clone(), prior_value.clone());
                    old.insert(label.clone(), prior_value.clone());
                }
                new.insert(label.clone(), new_value.clone());
            }

            let mut event = self.event(wo, Op::Update, &id, prior_rev + 1);
            event.old = Some(old);
            event.new = Some(new);
            tags.apply(&mut event);
            self.emit(event).await;

            updated_ids.push(id);
            diffs.push(diff);
        }

        WriteResult::ok(diffs)
    }

    // ========================================================================
    // DELETE
    // ========================================================================

    /// Delete every entity matching the query, one find-and-delete at a
    /// time. Returns the prior documents in deletion order.
    pub async fn delete_entities(
        &self,
        ctx: &CancellationToken,
        wo: &WriteOp,
        query: &Query,
    ) -> WriteResult<Entity> {
        let coll = match self.collection(&wo.entity_type) {
            Ok(c) => c,
            Err(e) => return WriteResult::rejected(e),
        };
        let filter = translate(query);
        let tags = SetTags::from_wo(wo);
        let mut priors: Vec<Entity> = Vec::new();

        loop {
            if ctx.is_cancelled() {
                return WriteResult::failed(priors, cancelled());
            }
            let prior = match self.backend.find_one_and_delete(coll, &filter).await {
                Ok(Some(prior)) => prior,
                Ok(None) => break,
                Err(e) => {
                    tracing::warn!(
                        entity_type = %wo.entity_type,
                        deleted = priors.len(),
                        error = %e,
                        "delete loop stopped"
                    );
                    return WriteResult::failed(priors, e.into());
                }
            };

            let id = prior.id().unwrap_or_default().to_string();
            let prior_rev = prior.rev().unwrap_or(0);

            let mut event = self.event(wo, Op::Delete, &id, prior_rev + 1);
            event.old = Some(prior.clone());
            tags.apply(&mut event);
            self.emit(event).await;

            priors.push(prior);
        }

        WriteResult::ok(priors)
    }

    // ========================================================================
    // DELETE LABEL
    // ========================================================================

    /// Remove one label from the entity in `wo.entity_id`. Returns the
    /// entity's meta-labels and the deleted label as they were before.
    pub async fn delete_label(
        &self,
        ctx: &CancellationToken,
        wo: &WriteOp,
        label: &str,
    ) -> Result<Entity> {
        let coll = self.collection(&wo.entity_type)?;
        let id = wo
            .entity_id
            .as_deref()
            .ok_or_else(|| Error::missing_param("entityId"))?;
        if ctx.is_cancelled() {
            return Err(cancelled());
        }
        if is_meta_label(label) {
            return Err(Error::invalid_param(format!(
                "cannot delete meta-label {}",
                label
            )));
        }

        let prior = self
            .backend
            .find_one_and_remove_label(coll, id, label)
            .await?
            .ok_or_else(|| Error::entity_not_found(id))?;
        let prior_rev = prior.rev().unwrap_or(0);

        let mut old = Entity::new();
        if let Some(value) = prior.get(label) {
            old.insert(label.to_string(), value.clone());
        }

        let mut event = self.event(wo, Op::Update, id, prior_rev + 1);
        event.old = Some(old);
        event.new = Some(Entity::new());
        SetTags::from_wo(wo).apply(&mut event);
        self.emit(event).await;

        let mut returned = prior.project(&[
            META_LABEL_ID.to_string(),
            META_LABEL_TYPE.to_string(),
            META_LABEL_REV.to_string(),
        ]);
        if let Some(value) = prior.get(label) {
            returned.insert(label.to_string(), value.clone());
        }
        Ok(returned)
    }

    // ========================================================================
    // CDC EMISSION
    // ========================================================================

    fn event(&self, wo: &WriteOp, op: Op, entity_id: &str, entity_rev: i64) -> CdcEvent {
        CdcEvent {
            id: new_id(),
            ts: now_ms(),
            op,
            caller: wo.caller.clone(),
            entity_id: entity_id.to_string(),
            entity_type: wo.entity_type.clone(),
            entity_rev,
            old: None,
            new: None,
            set_id: None,
            set_op: None,
            set_size: None,
        }
    }

    /// Emit after commit. The CDC store retries and falls back to disk; if
    /// even that fails the entity change stays visible, so log and move on.
    /// The writer seam carries no request token: a committed mutation's
    /// event is recorded even when the caller is gone.
    async fn emit(&self, event: CdcEvent) {
        if let Err(e) = self.cdc.write(event).await {
            tracing::error!(error = %e, "failed to record CDC event");
        }
    }
}

fn validate_new_entity(entity: &Entity, entity_type: &str) -> Result<()> {
    if entity.contains_label(META_LABEL_ID) {
        return Err(Error::invalid_param("cannot set _id on insert"));
    }
    if entity.contains_label(META_LABEL_REV) {
        return Err(Error::invalid_param("cannot set _rev on insert"));
    }
    if let Some(t) = entity.entity_type() {
        if t != entity_type {
            return Err(Error::invalid_param(format!(
                "entity _type {} does not match endpoint type {}",
                t, entity_type
            )));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{IndexModel, MemoryBackend};
    use async_trait::async_trait;
    use etre_core::query::parse;
    use etre_core::ErrorKind;
    use parking_lot::Mutex;

    const TYPE: &str = "nodes";
    const CALLER: &str = "test_user";

    struct RecordingCdc {
        events: Mutex<Vec<CdcEvent>>,
    }

    #[async_trait]
    impl CdcWriter for RecordingCdc {
        async fn write(&self, event: CdcEvent) -> Result<()> {
            self.events.lock().push(event);
            Ok(())
        }
    }

    struct Fixture {
        store: Store,
        cdc: Arc<RecordingCdc>,
        /// Ids of the three standard test nodes.
        ids: Vec<String>,
    }

    impl Fixture {
        fn events(&self) -> Vec<CdcEvent> {
            self.cdc.events.lock().clone()
        }
    }

    fn wo() -> WriteOp {
        WriteOp {
            caller: CALLER.to_string(),
            entity_type: TYPE.to_string(),
            ..Default::default()
        }
    }

    fn ctx() -> CancellationToken {
        CancellationToken::new()
    }

    /// Three standard nodes behind a unique index on x:
    ///   {x:2, y:a, z:9, foo:""}, {x:4, y:b, bar:""}, {x:6, y:b, bar:""}
    async fn setup() -> Fixture {
        let backend = Arc::new(MemoryBackend::new());
        backend
            .ensure_index(
                TYPE,
                &IndexModel {
                    name: "IL_x".to_string(),
                    keys: vec!["x".to_string()],
                    unique: true,
                    sparse: false,
                },
            )
            .await
            .unwrap();

        let cdc = Arc::new(RecordingCdc {
            events: Mutex::new(Vec::new()),
        });
        let store = Store::new(backend, cdc.clone(), vec![TYPE.to_string()]);

        let nodes = vec![
            Entity::from([
                ("x", Value::from(2)),
                ("y", Value::from("a")),
                ("z", Value::from(9)),
                ("foo", Value::from("")),
            ]),
            Entity::from([
                ("x", Value::from(4)),
                ("y", Value::from("b")),
                ("bar", Value::from("")),
            ]),
            Entity::from([
                ("x", Value::from(6)),
                ("y", Value::from("b")),
                ("bar", Value::from("")),
            ]),
        ];
        let result = store.create_entities(&ctx(), &wo(), nodes).await;
        assert!(result.error.is_none(), "setup insert failed: {:?}", result.error);
        cdc.events.lock().clear();

        Fixture {
            store,
            cdc,
            ids: result.committed,
        }
    }

    async fn read(f: &Fixture, selector: &str) -> Vec<Entity> {
        f.store
            .read_entities(&ctx(), TYPE, &parse(selector).unwrap(), &QueryFilter::default())
            .await
            .unwrap()
    }

    // ------------------------------------------------------------------
    // Read
    // ------------------------------------------------------------------

    #[tokio::test]
    async fn test_read_entities_with_all_operators() {
        let f = setup().await;
        // Each selector matches only the first test node.
        let queries = [
            "y in (a, z)",
            "y notin (b, c)",
            "y = a",
            "y == a",
            "y != b",
            "z",
            "!bar",
            "z > 1",
            "z < 10",
        ];
        for selector in queries {
            let got = read(&f, selector).await;
            assert_eq!(got.len(), 1, "selector: {}", selector);
            assert_eq!(got[0].id(), Some(f.ids[0].as_str()), "selector: {}", selector);
            assert_eq!(got[0].rev(), Some(0));
            assert_eq!(got[0].entity_type(), Some(TYPE));
        }
    }

    #[tokio::test]
    async fn test_read_entities_matching() {
        let f = setup().await;

        // Multiple operators, still only the first node.
        let got = read(&f, "z, !bar, z>1").await;
        assert_eq!(got.len(), 1);
        assert_eq!(got[0].id(), Some(f.ids[0].as_str()));

        // All nodes carry label y.
        assert_eq!(read(&f, "y").await.len(), 3);

        // First node has x=2, so x>2 matches the other two.
        let got = read(&f, "x>2").await;
        assert_eq!(got.len(), 2);
        assert_eq!(got[0].id(), Some(f.ids[1].as_str()));
        assert_eq!(got[1].id(), Some(f.ids[2].as_str()));

        // All nodes have y but none with y=y.
        assert!(read(&f, "y=y").await.is_empty());
    }

    #[tokio::test]
    async fn test_read_empty_string_is_absent_for_existence() {
        let f = setup().await;
        // foo exists on the first node but is "": invisible to existence.
        assert!(read(&f, "foo").await.is_empty());
        let got = read(&f, "!foo").await;
        assert_eq!(got.len(), 3);
    }

    #[tokio::test]
    async fn test_read_filter_distinct() {
        let f = setup().await;
        let filter = QueryFilter {
            return_labels: vec!["y".to_string()],
            distinct: true,
        };
        let got = f
            .store
            .read_entities(&ctx(), TYPE, &parse("y").unwrap(), &filter)
            .await
            .unwrap();
        assert_eq!(
            got,
            vec![
                Entity::from([("y", Value::from("a"))]),
                Entity::from([("y", Value::from("b"))]),
            ]
        );
    }

    #[tokio::test]
    async fn test_read_distinct_requires_one_return_label() {
        let f = setup().await;
        let filter = QueryFilter {
            return_labels: vec![],
            distinct: true,
        };
        let err = f
            .store
            .read_entities(&ctx(), TYPE, &parse("y").unwrap(), &filter)
            .await
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::InvalidParam);
    }

    #[tokio::test]
    async fn test_read_filter_return_labels() {
        let f = setup().await;
        let filter = QueryFilter {
            return_labels: vec!["x".to_string()],
            distinct: false,
        };
        let got = f
            .store
            .read_entities(&ctx(), TYPE, &parse("y").unwrap(), &filter)
            .await
            .unwrap();
        assert_eq!(
            got,
            vec![
                Entity::from([("x", Value::from(2))]),
                Entity::from([("x", Value::from(4))]),
                Entity::from([("x", Value::from(6))]),
            ]
        );
    }

    #[tokio::test]
    async fn test_read_filter_return_meta_labels() {
        let f = setup().await;
        let filter = QueryFilter {
            return_labels: vec![
                "_id".to_string(),
                "_type".to_string(),
                "_rev".to_string(),
                "y".to_string(),
            ],
            distinct: false,
        };
        let got = f
            .store
            .read_entities(&ctx(), TYPE, &parse("y=a").unwrap(), &filter)
            .await
            .unwrap();
        assert_eq!(
            got,
            vec![Entity::from([
                ("_id", Value::from(f.ids[0].as_str())),
                ("_type", Value::from(TYPE)),
                ("_rev", Value::from(0)),
                ("y", Value::from("a")),
            ])]
        );
    }

    #[tokio::test]
    async fn test_read_unknown_type() {
        let f = setup().await;
        let err = f
            .store
            .read_entities(&ctx(), "bogus", &parse("y").unwrap(), &QueryFilter::default())
            .await
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::InvalidParam);
    }

    #[tokio::test]
    async fn test_read_by_id_selector() {
        // By-id reads go through the query path, the same way clients
        // express them.
        let f = setup().await;
        let got = read(&f, &format!("_id={}", f.ids[0])).await;
        assert_eq!(got.len(), 1);
        assert_eq!(got[0].get("y"), Some(&Value::from("a")));

        let missing = read(&f, "_id=ffffffffffffffffffffffffffffffff").await;
        assert!(missing.is_empty());
    }

    // ------------------------------------------------------------------
    // Create
    // ------------------------------------------------------------------

    #[tokio::test]
    async fn test_create_entities_multiple() {
        let f = setup().await;
        let batch = vec![
            Entity::from([("x", Value::from(7))]),
            Entity::from([("x", Value::from(8))]),
            Entity::from([
                ("x", Value::from(9)),
                ("_setId", Value::from("343")),
                ("_setOp", Value::from("something")),
                ("_setSize", Value::from(1)),
            ]),
        ];
        let result = f.store.create_entities(&ctx(), &wo(), batch).await;
        assert!(result.error.is_none());
        assert_eq!(result.committed.len(), 3);

        let events = f.events();
        assert_eq!(events.len(), 3);
        for (i, event) in events.iter().enumerate() {
            assert_eq!(event.op, Op::Insert);
            assert_eq!(event.caller, CALLER);
            assert_eq!(event.entity_type, TYPE);
            assert_eq!(event.entity_rev, 0);
            assert_eq!(event.entity_id, result.committed[i]);
            assert!(event.old.is_none());
            let new = event.new.as_ref().unwrap();
            assert_eq!(new.id(), Some(result.committed[i].as_str()));
            assert_eq!(new.rev(), Some(0));
            assert_eq!(new.get("x"), Some(&Value::from(7 + i as i64)));
            // Set tags ride on the event, never on the entity.
            assert!(!new.contains_label("_setId"));
        }
        assert_eq!(events[2].set_id.as_deref(), Some("343"));
        assert_eq!(events[2].set_op.as_deref(), Some("something"));
        assert_eq!(events[2].set_size, Some(1));
        assert!(events[0].set_id.is_none());

        // The stored entity carries no set tags either.
        let stored = read(&f, &format!("_id={}", result.committed[2])).await;
        assert_eq!(stored.len(), 1);
        assert!(!stored[0].contains_label("_setId"));
        assert_eq!(stored[0].get("x"), Some(&Value::from(9)));
    }

    #[tokio::test]
    async fn test_create_entities_partial_success_on_duplicate() {
        let f = setup().await;
        // x=5 inserts, x=6 duplicates a test node, x=7 is never attempted.
        let batch = vec![
            Entity::from([("x", Value::from(5))]),
            Entity::from([("x", Value::from(6))]),
            Entity::from([("x", Value::from(7))]),
        ];
        let result = f.store.create_entities(&ctx(), &wo(), batch).await;
        assert_eq!(result.committed.len(), 1);
        let err = result.error.unwrap();
        assert_eq!(err.kind, ErrorKind::DuplicateEntity);

        // Exactly one insert committed, exactly one "i" event.
        let events = f.events();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].op, Op::Insert);
        assert_eq!(events[0].entity_id, result.committed[0]);
        assert_eq!(
            events[0].new.as_ref().unwrap().get("x"),
            Some(&Value::from(5))
        );
    }

    #[tokio::test]
    async fn test_create_entities_validation() {
        let f = setup().await;

        let result = f.store.create_entities(&ctx(), &wo(), vec![]).await;
        assert_eq!(result.error.unwrap().kind, ErrorKind::NoContent);

        let result = f
            .store
            .create_entities(&ctx(), &wo(), vec![Entity::from([("_id", Value::from("abc"))])])
            .await;
        assert_eq!(result.error.unwrap().kind, ErrorKind::InvalidParam);

        let result = f
            .store
            .create_entities(&ctx(), &wo(), vec![Entity::from([("_rev", Value::from(1))])])
            .await;
        assert_eq!(result.error.unwrap().kind, ErrorKind::InvalidParam);

        let result = f
            .store
            .create_entities(
                &ctx(),
                &wo(),
                vec![Entity::from([("_type", Value::from("other"))])],
            )
            .await;
        assert_eq!(result.error.unwrap().kind, ErrorKind::InvalidParam);

        // A matching _type is allowed.
        let result = f
            .store
            .create_entities(
                &ctx(),
                &wo(),
                vec![Entity::from([
                    ("_type", Value::from(TYPE)),
                    ("x", Value::from(100)),
                ])],
            )
            .await;
        assert!(result.error.is_none());

        // No events for rejected batches beyond the accepted one.
        assert_eq!(f.events().len(), 1);
    }

    // ------------------------------------------------------------------
    // Update
    // ------------------------------------------------------------------

    #[tokio::test]
    async fn test_update_entities() {
        let f = setup().await;

        // Matches the first node: y=a -> y=y.
        let wo1 = WriteOp {
            set_id: Some("111".to_string()),
            set_op: Some("update-y1".to_string()),
            set_size: Some(1),
            ..wo()
        };
        let result = f
            .store
            .update_entities(
                &ctx(),
                &wo1,
                &parse("y=a").unwrap(),
                Entity::from([("y", Value::from("y"))]),
            )
            .await;
        assert!(result.error.is_none());
        assert_eq!(
            result.committed,
            vec![Entity::from([
                ("_id", Value::from(f.ids[0].as_str())),
                ("_type", Value::from(TYPE)),
                ("_rev", Value::from(0)),
                ("y", Value::from("a")),
            ])]
        );

        // Matches the 2nd and 3rd nodes: y=b -> y=c.
        let wo2 = WriteOp {
            set_id: Some("222".to_string()),
            set_op: Some("update-y2".to_string()),
            set_size: Some(1),
            ..wo()
        };
        let result = f
            .store
            .update_entities(
                &ctx(),
                &wo2,
                &parse("y=b").unwrap(),
                Entity::from([("y", Value::from("c"))]),
            )
            .await;
        assert!(result.error.is_none());
        assert_eq!(
            result.committed,
            vec![
                Entity::from([
                    ("_id", Value::from(f.ids[1].as_str())),
                    ("_type", Value::from(TYPE)),
                    ("_rev", Value::from(0)),
                    ("y", Value::from("b")),
                ]),
                Entity::from([
                    ("_id", Value::from(f.ids[2].as_str())),
                    ("_type", Value::from(TYPE)),
                    ("_rev", Value::from(0)),
                    ("y", Value::from("b")),
                ]),
            ]
        );

        let events = f.events();
        assert_eq!(events.len(), 3);
        for event in &events {
            assert_eq!(event.op, Op::Update);
            assert_eq!(event.entity_rev, 1);
            assert_eq!(event.caller, CALLER);
        }
        assert_eq!(events[0].entity_id, f.ids[0]);
        assert_eq!(events[0].old, Some(Entity::from([("y", Value::from("a"))])));
        assert_eq!(events[0].new, Some(Entity::from([("y", Value::from("y"))])));
        assert_eq!(events[0].set_id.as_deref(), Some("111"));
        assert_eq!(events[0].set_op.as_deref(), Some("update-y1"));

        assert_eq!(events[1].entity_id, f.ids[1]);
        assert_eq!(events[1].old, Some(Entity::from([("y", Value::from("b"))])));
        assert_eq!(events[1].new, Some(Entity::from([("y", Value::from("c"))])));
        assert_eq!(events[1].set_id.as_deref(), Some("222"));
        assert_eq!(events[2].entity_id, f.ids[2]);
        assert_eq!(events[2].set_id.as_deref(), Some("222"));

        // Revisions really advanced.
        let got = read(&f, "y=c").await;
        assert_eq!(got.len(), 2);
        assert_eq!(got[0].rev(), Some(1));
    }

    #[tokio::test]
    async fn test_update_entities_by_id_terminates() {
        // Querying _id and patching an unrelated label would loop forever
        // without the already-updated exclusion.
        let f = setup().await;
        let result = f
            .store
            .update_entities(
                &ctx(),
                &wo(),
                &parse(&format!("_id={}", f.ids[0])).unwrap(),
                Entity::from([("y", Value::from("y"))]),
            )
            .await;
        assert!(result.error.is_none());
        assert_eq!(result.committed.len(), 1);
        assert_eq!(
            result.committed[0].get("y"),
            Some(&Value::from("a"))
        );

        let events = f.events();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].entity_rev, 1);
    }

    #[tokio::test]
    async fn test_update_entities_duplicate() {
        let f = setup().await;
        // x=2 -> x=6 conflicts with the third node's unique x.
        let result = f
            .store
            .update_entities(
                &ctx(),
                &wo(),
                &parse("y=a").unwrap(),
                Entity::from([("x", Value::from(6))]),
            )
            .await;
        assert!(result.committed.is_empty());
        assert_eq!(result.error.unwrap().kind, ErrorKind::DuplicateEntity);
        assert!(f.events().is_empty());
    }

    #[tokio::test]
    async fn test_update_entities_validation() {
        let f = setup().await;

        let result = f
            .store
            .update_entities(&ctx(), &wo(), &parse("y=a").unwrap(), Entity::new())
            .await;
        assert_eq!(result.error.unwrap().kind, ErrorKind::NoContent);

        let result = f
            .store
            .update_entities(
                &ctx(),
                &wo(),
                &parse("y=a").unwrap(),
                Entity::from([("_rev", Value::from(9))]),
            )
            .await;
        assert_eq!(result.error.unwrap().kind, ErrorKind::InvalidParam);
        assert!(f.events().is_empty());
    }

    #[tokio::test]
    async fn test_update_lifts_set_tags_from_patch() {
        let f = setup().await;
        let result = f
            .store
            .update_entities(
                &ctx(),
                &wo(),
                &parse("y=a").unwrap(),
                Entity::from([
                    ("y", Value::from("q")),
                    ("_setId", Value::from("setfrompatch")),
                ]),
            )
            .await;
        assert!(result.error.is_none());

        let events = f.events();
        assert_eq!(events[0].set_id.as_deref(), Some("setfrompatch"));

        // The tag was not written to the entity.
        let got = read(&f, "y=q").await;
        assert!(!got[0].contains_label("_setId"));
    }

    // ------------------------------------------------------------------
    // Delete
    // ------------------------------------------------------------------

    #[tokio::test]
    async fn test_delete_entities() {
        let f = setup().await;

        let result = f
            .store
            .delete_entities(&ctx(), &wo(), &parse("y == a").unwrap())
            .await;
        assert!(result.error.is_none());
        assert_eq!(result.committed.len(), 1);
        assert_eq!(result.committed[0].id(), Some(f.ids[0].as_str()));

        let result = f
            .store
            .delete_entities(&ctx(), &wo(), &parse("y == b").unwrap())
            .await;
        assert!(result.error.is_none());
        assert_eq!(result.committed.len(), 2);

        let events = f.events();
        assert_eq!(events.len(), 3);
        for event in &events {
            assert_eq!(event.op, Op::Delete);
            assert_eq!(event.entity_rev, 1);
            assert!(event.new.is_none());
        }
        // Old carries the full prior entity.
        let old = events[0].old.as_ref().unwrap();
        assert_eq!(old.get("x"), Some(&Value::from(2)));
        assert_eq!(old.get("foo"), Some(&Value::from("")));
        assert_eq!(old.rev(), Some(0));

        assert!(read(&f, "y").await.is_empty());
    }

    // ------------------------------------------------------------------
    // Delete label
    // ------------------------------------------------------------------

    #[tokio::test]
    async fn test_delete_label() {
        let f = setup().await;
        let wo = WriteOp {
            entity_id: Some(f.ids[0].clone()),
            ..wo()
        };

        let prior = f.store.delete_label(&ctx(), &wo, "foo").await.unwrap();
        assert_eq!(
            prior,
            Entity::from([
                ("_id", Value::from(f.ids[0].as_str())),
                ("_type", Value::from(TYPE)),
                ("_rev", Value::from(0)),
                ("foo", Value::from("")),
            ])
        );

        // The label is gone and the revision advanced.
        let got = read(&f, "y=a").await;
        assert_eq!(got.len(), 1);
        assert!(!got[0].contains_label("foo"));
        assert_eq!(got[0].rev(), Some(1));

        let events = f.events();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].op, Op::Update);
        assert_eq!(events[0].entity_rev, 1);
        assert_eq!(
            events[0].old,
            Some(Entity::from([("foo", Value::from(""))]))
        );
        assert_eq!(events[0].new, Some(Entity::new()));
    }

    #[tokio::test]
    async fn test_delete_label_rejects_meta_labels() {
        let f = setup().await;
        let wo = WriteOp {
            entity_id: Some(f.ids[0].clone()),
            ..wo()
        };
        for label in ["_id", "_type", "_rev"] {
            let err = f.store.delete_label(&ctx(), &wo, label).await.unwrap_err();
            assert_eq!(err.kind, ErrorKind::InvalidParam, "label: {}", label);
        }
    }

    #[tokio::test]
    async fn test_delete_label_not_found() {
        let f = setup().await;
        let wo = WriteOp {
            entity_id: Some("ffffffffffffffffffffffffffffffff".to_string()),
            ..wo()
        };
        let err = f.store.delete_label(&ctx(), &wo, "foo").await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::EntityNotFound);
    }

    // ------------------------------------------------------------------
    // Cancellation
    // ------------------------------------------------------------------

    #[tokio::test]
    async fn test_cancelled_request_stops_before_writing() {
        let f = setup().await;
        let cancelled_ctx = ctx();
        cancelled_ctx.cancel();

        let err = f
            .store
            .read_entities(
                &cancelled_ctx,
                TYPE,
                &parse("y").unwrap(),
                &QueryFilter::default(),
            )
            .await
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::InternalError);

        let result = f
            .store
            .create_entities(
                &cancelled_ctx,
                &wo(),
                vec![Entity::from([("x", Value::from(7))])],
            )
            .await;
        assert!(result.committed.is_empty());
        assert!(result.error.is_some());

        let result = f
            .store
            .update_entities(
                &cancelled_ctx,
                &wo(),
                &parse("y=b").unwrap(),
                Entity::from([("y", Value::from("c"))]),
            )
            .await;
        assert!(result.committed.is_empty());
        assert!(result.error.is_some());

        let result = f
            .store
            .delete_entities(&cancelled_ctx, &wo(), &parse("y").unwrap())
            .await;
        assert!(result.committed.is_empty());
        assert!(result.error.is_some());

        // Nothing committed, nothing emitted, nothing changed.
        assert!(f.events().is_empty());
        assert_eq!(read(&f, "y").await.len(), 3);
    }
}
