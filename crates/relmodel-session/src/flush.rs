//! Flush ordering and execution.
//!
//! Pending work is written in three phases:
//! - INSERT parent-first (referenced rows exist before anything points at them)
//! - UPDATE, so links are repointed or cleared while every row still exists
//! - DELETE child-first (referencing rows go before the rows they reference)
//!
//! Table order comes from the registry's table dependencies. Sorting is
//! stable, so within one level the cascade order is preserved. Consecutive
//! operations on one table are executed as a batch.

use crate::context::{ManagedEntity, Pending};
use asupersync::{Cx, Outcome};
use relmodel_core::{Datastore, EntityKey, Error, MappingRegistry, Result, Statement};
use serde::Serialize;
use std::collections::{HashMap, HashSet};

/// A pending datastore write for one entity.
#[derive(Debug, Clone, PartialEq)]
pub enum PendingOp {
    Insert {
        entity: &'static str,
        key: EntityKey,
        statement: Statement,
    },
    Update {
        entity: &'static str,
        key: EntityKey,
        statement: Statement,
    },
    Delete {
        entity: &'static str,
        key: EntityKey,
        statement: Statement,
    },
}

impl PendingOp {
    /// Build the write for an entity's pending work.
    pub fn for_entity(registry: &MappingRegistry, managed: &ManagedEntity, pending: &Pending<'_>) -> Result<Self> {
        let entity = managed.name;
        let key = managed.key.clone();
        let table = managed.row.table();
        Ok(match pending {
            Pending::Insert => PendingOp::Insert {
                entity,
                key,
                statement: managed.row.insert_statement(),
            },
            Pending::Update(changed) => PendingOp::Update {
                entity,
                statement: Statement::Update {
                    table,
                    key_columns: registry.key_columns(entity)?.to_vec(),
                    key_values: key.values(),
                    set_columns: changed.iter().map(|c| c.name).collect(),
                    set_values: changed.iter().map(|c| c.value.clone()).collect(),
                },
                key,
            },
            Pending::Delete => PendingOp::Delete {
                entity,
                statement: Statement::Delete {
                    table,
                    key_columns: registry.key_columns(entity)?.to_vec(),
                    key_values: key.values(),
                },
                key,
            },
        })
    }

    /// Get the table name for this operation.
    pub fn table(&self) -> &'static str {
        self.statement().table()
    }

    pub fn entity(&self) -> &'static str {
        match self {
            PendingOp::Insert { entity, .. }
            | PendingOp::Update { entity, .. }
            | PendingOp::Delete { entity, .. } => entity,
        }
    }

    pub fn key(&self) -> &EntityKey {
        match self {
            PendingOp::Insert { key, .. } | PendingOp::Update { key, .. } | PendingOp::Delete { key, .. } => key,
        }
    }

    pub fn statement(&self) -> &Statement {
        match self {
            PendingOp::Insert { statement, .. }
            | PendingOp::Update { statement, .. }
            | PendingOp::Delete { statement, .. } => statement,
        }
    }

    /// Check if this is an insert operation.
    pub fn is_insert(&self) -> bool {
        matches!(self, PendingOp::Insert { .. })
    }

    /// Check if this is an update operation.
    pub fn is_update(&self) -> bool {
        matches!(self, PendingOp::Update { .. })
    }

    /// Check if this is a delete operation.
    pub fn is_delete(&self) -> bool {
        matches!(self, PendingOp::Delete { .. })
    }
}

/// Orders operations by table dependency level.
///
/// A table's level is one more than the highest level of the tables it
/// references; tables that reference nothing are level 0.
#[derive(Debug, Default)]
pub struct FlushOrderer {
    /// Table -> tables it references.
    dependencies: HashMap<&'static str, Vec<&'static str>>,
}

impl FlushOrderer {
    /// Create a new flush orderer.
    pub fn new() -> Self {
        Self::default()
    }

    /// An orderer that knows every dependency of the registry's tables.
    pub fn from_registry(registry: &MappingRegistry) -> Self {
        let mut orderer = Self::new();
        for dep in registry.table_dependencies() {
            orderer
                .dependencies
                .entry(dep.table)
                .or_default()
                .push(dep.references);
        }
        orderer
    }

    /// Register a table's dependencies directly.
    pub fn register_table(&mut self, table: &'static str, depends_on: Vec<&'static str>) {
        self.dependencies.insert(table, depends_on);
    }

    /// Dependency level of `table`.
    pub fn level(&self, table: &str) -> usize {
        self.level_inner(table, &mut HashSet::new())
    }

    fn level_inner<'a>(&'a self, table: &'a str, visiting: &mut HashSet<&'a str>) -> usize {
        let Some(deps) = self.dependencies.get(table) else {
            return 0;
        };
        if !visiting.insert(table) {
            tracing::warn!(table = table, "Cyclic table dependency; ordering by cascade order");
            return 0;
        }
        let level = deps
            .iter()
            .filter(|dep| **dep != table)
            .map(|dep| self.level_inner(dep, visiting) + 1)
            .max()
            .unwrap_or(0);
        visiting.remove(table);
        level
    }

    /// Order operations into a flush plan.
    ///
    /// - Inserts: lowest level first
    /// - Updates: in the order given
    /// - Deletes: highest level first
    pub fn order(&self, ops: Vec<PendingOp>) -> FlushPlan {
        let mut deletes = Vec::new();
        let mut inserts = Vec::new();
        let mut updates = Vec::new();

        for op in ops {
            match op {
                PendingOp::Delete { .. } => deletes.push(op),
                PendingOp::Insert { .. } => inserts.push(op),
                PendingOp::Update { .. } => updates.push(op),
            }
        }

        deletes.sort_by_key(|op| std::cmp::Reverse(self.level(op.table())));
        inserts.sort_by_key(|op| self.level(op.table()));

        FlushPlan {
            inserts,
            updates,
            deletes,
        }
    }
}

/// A plan for executing flush operations.
#[derive(Debug, Default)]
pub struct FlushPlan {
    /// Insert operations (ordered parent-first).
    pub inserts: Vec<PendingOp>,
    pub updates: Vec<PendingOp>,
    /// Delete operations (ordered child-first).
    pub deletes: Vec<PendingOp>,
}

impl FlushPlan {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.deletes.is_empty() && self.inserts.is_empty() && self.updates.is_empty()
    }

    pub fn len(&self) -> usize {
        self.deletes.len() + self.inserts.len() + self.updates.len()
    }

    /// Every operation in execution order.
    pub fn iter(&self) -> impl Iterator<Item = &PendingOp> {
        self.inserts.iter().chain(&self.updates).chain(&self.deletes)
    }

    /// Execute the flush plan against the datastore.
    ///
    /// Stops at the first failing statement.
    #[tracing::instrument(level = "info", skip(self, cx, store))]
    pub async fn execute<D: Datastore>(&self, cx: &Cx, store: &D) -> Outcome<FlushResult, Error> {
        tracing::info!(
            inserts = self.inserts.len(),
            updates = self.updates.len(),
            deletes = self.deletes.len(),
            "Executing flush plan"
        );

        let start = std::time::Instant::now();
        let mut result = FlushResult::default();

        for batch in Self::batch_by_table(&self.inserts) {
            match Self::execute_batch(cx, store, &batch).await {
                Outcome::Ok(count) => result.inserted += count,
                Outcome::Err(e) => return Outcome::Err(e),
                Outcome::Cancelled(r) => return Outcome::Cancelled(r),
                Outcome::Panicked(p) => return Outcome::Panicked(p),
            }
        }

        for batch in Self::batch_by_table(&self.updates) {
            match Self::execute_batch(cx, store, &batch).await {
                Outcome::Ok(count) => result.updated += count,
                Outcome::Err(e) => return Outcome::Err(e),
                Outcome::Cancelled(r) => return Outcome::Cancelled(r),
                Outcome::Panicked(p) => return Outcome::Panicked(p),
            }
        }

        for batch in Self::batch_by_table(&self.deletes) {
            match Self::execute_batch(cx, store, &batch).await {
                Outcome::Ok(count) => result.deleted += count,
                Outcome::Err(e) => return Outcome::Err(e),
                Outcome::Cancelled(r) => return Outcome::Cancelled(r),
                Outcome::Panicked(p) => return Outcome::Panicked(p),
            }
        }

        tracing::info!(
            elapsed_ms = start.elapsed().as_millis(),
            inserted = result.inserted,
            updated = result.updated,
            deleted = result.deleted,
            "Flush complete"
        );

        Outcome::Ok(result)
    }

    /// Group consecutive operations on the same table.
    fn batch_by_table(ops: &[PendingOp]) -> Vec<Vec<&PendingOp>> {
        let mut batches: Vec<Vec<&PendingOp>> = Vec::new();
        for op in ops {
            match batches.last_mut() {
                Some(batch) if batch.first().is_some_and(|first| first.table() == op.table()) => {
                    batch.push(op);
                }
                _ => batches.push(vec![op]),
            }
        }
        batches
    }

    #[tracing::instrument(level = "debug", skip(cx, store, ops), fields(table = ops.first().map(|op| op.table()), size = ops.len()))]
    async fn execute_batch<D: Datastore>(cx: &Cx, store: &D, ops: &[&PendingOp]) -> Outcome<usize, Error> {
        let mut count = 0;
        for op in ops {
            let statement = op.statement();
            tracing::trace!(sql = %statement.to_sql(), key = %op.key(), "Executing statement");
            match store.execute(cx, statement).await {
                Outcome::Ok(0) if !op.is_insert() => {
                    tracing::warn!(
                        entity = op.entity(),
                        key = %op.key(),
                        verb = statement.verb(),
                        "Statement affected no rows"
                    );
                    count += 1;
                }
                Outcome::Ok(_) => count += 1,
                Outcome::Err(e) => return Outcome::Err(e),
                Outcome::Cancelled(r) => return Outcome::Cancelled(r),
                Outcome::Panicked(p) => return Outcome::Panicked(p),
            }
        }
        Outcome::Ok(count)
    }
}

/// Result of a flush operation.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct FlushResult {
    /// Number of rows inserted.
    pub inserted: usize,
    /// Number of rows updated.
    pub updated: usize,
    /// Number of rows deleted.
    pub deleted: usize,
}

impl FlushResult {
    pub fn new() -> Self {
        Self::default()
    }

    /// Total number of operations performed.
    pub fn total(&self) -> usize {
        self.inserted + self.updated + self.deleted
    }
}

#[cfg(test)]
#[allow(clippy::manual_async_fn)] // Mock trait impls must match trait signatures
mod tests {
    use super::*;
    use asupersync::runtime::RuntimeBuilder;
    use relmodel_core::{
        AssociationInfo, AssociationKind, CascadeType, EntityMapping, JoinColumn, KeyComponentInfo,
        KeyShape, Lookup, QueryError, QueryErrorKind, Row, Value,
    };
    use std::future::Future;
    use std::sync::{Arc, Mutex};

    const CHILD_KEY: &[KeyComponentInfo] = &[
        KeyComponentInfo::column("id", "id"),
        KeyComponentInfo::embedded("parent", "parent", &["parent_id"]),
    ];
    const PARENT_ASSOCIATIONS: &[AssociationInfo] = &[AssociationInfo::new(
        "children",
        "child",
        AssociationKind::OneToMany,
    )
    .join_columns(&[JoinColumn::new("parent_id", "id")])
    .cascade(CascadeType::ALL)];

    fn registry() -> MappingRegistry {
        MappingRegistry::builder()
            .register(
                EntityMapping::new("parent", "parent", KeyShape::simple("id"))
                    .associations(PARENT_ASSOCIATIONS),
            )
            .register(EntityMapping::new("child", "child", KeyShape::composite(CHILD_KEY)))
            .build()
            .unwrap()
    }

    fn insert(table: &'static str, id: i32) -> PendingOp {
        PendingOp::Insert {
            entity: table,
            key: EntityKey::simple(id),
            statement: Statement::Insert {
                table,
                columns: vec!["id"],
                values: vec![Value::Int(id)],
            },
        }
    }

    fn delete(table: &'static str, id: i32) -> PendingOp {
        PendingOp::Delete {
            entity: table,
            key: EntityKey::simple(id),
            statement: Statement::Delete {
                table,
                key_columns: vec!["id"],
                key_values: vec![Value::Int(id)],
            },
        }
    }

    fn clear_link(table: &'static str, id: i32, column: &'static str) -> PendingOp {
        PendingOp::Update {
            entity: table,
            key: EntityKey::simple(id),
            statement: Statement::Update {
                table,
                key_columns: vec!["id"],
                key_values: vec![Value::Int(id)],
                set_columns: vec![column],
                set_values: vec![Value::Null],
            },
        }
    }

    fn unwrap_outcome<T: std::fmt::Debug>(outcome: Outcome<T, Error>) -> T {
        match outcome {
            Outcome::Ok(v) => v,
            other => std::panic::panic_any(format!("unexpected outcome: {other:?}")),
        }
    }

    #[derive(Debug, Default)]
    struct MockState {
        executed: Vec<String>,
        fail_on: Option<&'static str>,
    }

    #[derive(Debug, Clone, Default)]
    struct MockStore {
        state: Arc<Mutex<MockState>>,
    }

    impl Datastore for MockStore {
        fn execute(&self, _cx: &Cx, statement: &Statement) -> impl Future<Output = Outcome<u64, Error>> + Send {
            let state = Arc::clone(&self.state);
            let statement = statement.clone();
            async move {
                let mut guard = state.lock().expect("lock poisoned");
                if guard.fail_on == Some(statement.table()) {
                    return Outcome::Err(Error::Query(QueryError::new(
                        QueryErrorKind::ForeignKeyViolation,
                        statement.table(),
                        "rejected",
                    )));
                }
                guard.executed.push(format!("{} {}", statement.verb(), statement.table()));
                Outcome::Ok(1)
            }
        }

        fn query(&self, _cx: &Cx, _lookup: &Lookup) -> impl Future<Output = Outcome<Vec<Row>, Error>> + Send {
            async { Outcome::Ok(Vec::new()) }
        }

        fn begin(&self, _cx: &Cx) -> impl Future<Output = Outcome<(), Error>> + Send {
            async { Outcome::Ok(()) }
        }

        fn commit(&self, _cx: &Cx) -> impl Future<Output = Outcome<(), Error>> + Send {
            async { Outcome::Ok(()) }
        }

        fn rollback(&self, _cx: &Cx) -> impl Future<Output = Outcome<(), Error>> + Send {
            async { Outcome::Ok(()) }
        }
    }

    #[test]
    fn test_pending_op_accessors() {
        let op = insert("parent", 1);
        assert_eq!(op.table(), "parent");
        assert_eq!(op.entity(), "parent");
        assert_eq!(op.key(), &EntityKey::simple(1));
        assert!(op.is_insert());
        assert!(!op.is_update());
        assert!(delete("child", 1).is_delete());
    }

    #[test]
    fn test_levels_from_registry() {
        let orderer = FlushOrderer::from_registry(&registry());
        assert_eq!(orderer.level("parent"), 0);
        assert_eq!(orderer.level("child"), 1);
        assert_eq!(orderer.level("unknown"), 0);
    }

    #[test]
    fn test_cyclic_dependencies_terminate() {
        let mut orderer = FlushOrderer::new();
        orderer.register_table("a", vec!["b"]);
        orderer.register_table("b", vec!["a"]);
        assert!(orderer.level("a") <= 2);
    }

    #[test]
    fn test_orderer_inserts_parents_and_deletes_children_first() {
        let orderer = FlushOrderer::from_registry(&registry());
        let plan = orderer.order(vec![
            insert("child", 1),
            delete("parent", 7),
            insert("parent", 1),
            delete("child", 7),
            insert("child", 2),
        ]);
        let inserts: Vec<_> = plan.inserts.iter().map(PendingOp::table).collect();
        assert_eq!(inserts, vec!["parent", "child", "child"]);
        // Stable: cascade order kept within a level.
        assert_eq!(plan.inserts[1].key(), &EntityKey::simple(1));
        let deletes: Vec<_> = plan.deletes.iter().map(PendingOp::table).collect();
        assert_eq!(deletes, vec!["child", "parent"]);
        assert_eq!(plan.len(), 5);
    }

    #[test]
    fn test_batch_by_table_groups_consecutive_ops() {
        let ops = vec![insert("parent", 1), insert("child", 1), insert("child", 2), insert("parent", 2)];
        let batches = FlushPlan::batch_by_table(&ops);
        let sizes: Vec<_> = batches.iter().map(Vec::len).collect();
        assert_eq!(sizes, vec![1, 2, 1]);
        assert!(FlushPlan::batch_by_table(&[]).is_empty());
    }

    #[test]
    fn test_execute_runs_inserts_then_deletes() {
        let rt = RuntimeBuilder::current_thread().build().expect("create asupersync runtime");
        let cx = Cx::for_testing();
        let store = MockStore::default();
        let plan = FlushOrderer::from_registry(&registry()).order(vec![
            insert("parent", 1),
            insert("child", 1),
            delete("child", 9),
        ]);

        let result = rt.block_on(async { unwrap_outcome(plan.execute(&cx, &store).await) });
        assert_eq!(result, FlushResult { inserted: 2, updated: 0, deleted: 1 });
        assert_eq!(result.total(), 3);
        let executed = store.state.lock().unwrap().executed.clone();
        assert_eq!(executed, vec!["INSERT parent", "INSERT child", "DELETE child"]);
    }

    #[test]
    fn test_cleared_link_is_written_before_referenced_row_is_deleted() {
        let rt = RuntimeBuilder::current_thread().build().expect("create asupersync runtime");
        let cx = Cx::for_testing();
        let store = MockStore::default();
        let plan = FlushOrderer::from_registry(&registry()).order(vec![
            delete("parent", 1),
            clear_link("child", 1, "parent_id"),
            insert("parent", 2),
        ]);

        let order: Vec<_> = plan.iter().map(|op| op.statement().verb()).collect();
        assert_eq!(order, vec!["INSERT", "UPDATE", "DELETE"]);

        let result = rt.block_on(async { unwrap_outcome(plan.execute(&cx, &store).await) });
        assert_eq!(result, FlushResult { inserted: 1, updated: 1, deleted: 1 });
        let executed = store.state.lock().unwrap().executed.clone();
        assert_eq!(executed, vec!["INSERT parent", "UPDATE child", "DELETE parent"]);
    }

    #[test]
    fn test_execute_stops_at_first_failure() {
        let rt = RuntimeBuilder::current_thread().build().expect("create asupersync runtime");
        let cx = Cx::for_testing();
        let store = MockStore::default();
        store.state.lock().unwrap().fail_on = Some("child");
        let plan = FlushOrderer::from_registry(&registry()).order(vec![
            insert("parent", 1),
            insert("child", 1),
            insert("child", 2),
        ]);

        let outcome = rt.block_on(async { plan.execute(&cx, &store).await });
        match outcome {
            Outcome::Err(e) => assert!(e.is_constraint_violation()),
            other => panic!("expected error, got {other:?}"),
        }
        assert_eq!(store.state.lock().unwrap().executed, vec!["INSERT parent"]);
    }
}
