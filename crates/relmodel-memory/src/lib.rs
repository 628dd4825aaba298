//! In-memory datastore for relmodel.
//!
//! [`MemoryStore`] keeps every table as a vector of rows behind
//! `Arc<Mutex<>>` and implements [`Datastore`] by executing each statement
//! synchronously under the mutex. Constraints are checked immediately, per
//! statement:
//!
//! - primary keys are NOT NULL and unique; declared unique keys are unique
//!   among rows without NULLs
//! - foreign keys use MATCH SIMPLE: a reference with any NULL column is not
//!   checked
//! - a referenced row can be neither deleted nor have its referenced columns
//!   changed while another row still points at it
//!
//! `begin` snapshots all tables and `rollback` restores the snapshot. Every
//! successfully executed statement is appended to a log for assertions.

#![allow(clippy::result_large_err)]

use asupersync::{Cx, Outcome};
use relmodel_core::{
    ColumnInfo, Datastore, Error, Lookup, MappingRegistry, QueryError, QueryErrorKind, Result, Row,
    Statement, TransactionError, TransactionErrorKind, Value,
};
use std::collections::BTreeMap;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard};

/// A foreign key from `columns` to `referenced_columns` of `referenced_table`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ForeignKey {
    pub columns: Vec<&'static str>,
    pub referenced_table: &'static str,
    pub referenced_columns: Vec<&'static str>,
}

impl ForeignKey {
    pub fn new(
        columns: &[&'static str],
        referenced_table: &'static str,
        referenced_columns: &[&'static str],
    ) -> Self {
        Self {
            columns: columns.to_vec(),
            referenced_table,
            referenced_columns: referenced_columns.to_vec(),
        }
    }
}

/// Schema of one table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableDef {
    pub name: &'static str,
    pub columns: Vec<&'static str>,
    pub primary_key: Vec<&'static str>,
    pub unique: Vec<Vec<&'static str>>,
    pub foreign_keys: Vec<ForeignKey>,
}

impl TableDef {
    pub fn new(name: &'static str, columns: &[&'static str]) -> Self {
        Self {
            name,
            columns: columns.to_vec(),
            primary_key: Vec::new(),
            unique: Vec::new(),
            foreign_keys: Vec::new(),
        }
    }

    #[must_use]
    pub fn primary_key(mut self, columns: &[&'static str]) -> Self {
        self.primary_key = columns.to_vec();
        self
    }

    #[must_use]
    pub fn unique(mut self, columns: &[&'static str]) -> Self {
        self.unique.push(columns.to_vec());
        self
    }

    #[must_use]
    pub fn foreign_key(mut self, foreign_key: ForeignKey) -> Self {
        if !self.foreign_keys.contains(&foreign_key) {
            self.foreign_keys.push(foreign_key);
        }
        self
    }

    fn unique_keys(&self) -> impl Iterator<Item = (&[&'static str], bool)> {
        std::iter::once((self.primary_key.as_slice(), true))
            .filter(|(columns, _)| !columns.is_empty())
            .chain(self.unique.iter().map(|u| (u.as_slice(), false)))
    }
}

#[derive(Debug, Clone)]
struct Table {
    def: TableDef,
    columns: Arc<ColumnInfo>,
    rows: Vec<Vec<Value>>,
}

impl Table {
    fn new(def: TableDef) -> Self {
        let columns = Arc::new(ColumnInfo::new(
            def.columns.iter().map(|c| (*c).to_string()).collect(),
        ));
        Self {
            def,
            columns,
            rows: Vec::new(),
        }
    }

    fn index(&self, column: &str) -> Result<usize> {
        self.columns
            .index_of(column)
            .ok_or_else(|| missing_column(self.def.name, column))
    }

    fn check_columns(&self, columns: &[&str]) -> Result<()> {
        columns.iter().try_for_each(|c| self.index(c).map(|_| ()))
    }

    fn project(&self, row: &[Value], columns: &[&'static str]) -> Vec<Value> {
        columns
            .iter()
            .map(|c| {
                self.columns
                    .index_of(c)
                    .and_then(|i| row.get(i))
                    .cloned()
                    .unwrap_or(Value::Null)
            })
            .collect()
    }

    fn to_row(&self, values: &[Value]) -> Row {
        Row::with_columns(Arc::clone(&self.columns), values.to_vec())
    }
}

/// SQL equality: NULL never equals anything.
fn same(a: &[Value], b: &[Value]) -> bool {
    a.len() == b.len() && a.iter().zip(b).all(|(x, y)| !x.is_null() && x == y)
}

fn has_null(values: &[Value]) -> bool {
    values.iter().any(Value::is_null)
}

type Tables = BTreeMap<&'static str, Table>;

/// The effect of one statement on one table, checked before it is applied.
struct Change {
    table: &'static str,
    rows: Vec<Vec<Value>>,
    /// Indexes into `rows` of inserted or updated rows.
    touched: Vec<usize>,
    /// Previous versions of updated or deleted rows.
    released: Vec<Vec<Value>>,
    affected: u64,
}

#[derive(Debug, Default)]
struct MemoryInner {
    tables: Tables,
    snapshot: Option<Tables>,
    log: Vec<Statement>,
    fail_commit: Option<String>,
}

/// A transactional in-memory [`Datastore`].
///
/// Clones share the same tables.
#[derive(Debug, Clone)]
pub struct MemoryStore {
    inner: Arc<Mutex<MemoryInner>>,
}

impl MemoryStore {
    /// Create a store with the given tables.
    ///
    /// Every column named by a key or foreign key must exist, and every
    /// foreign key must reference a declared table with matching arity.
    pub fn new(tables: impl IntoIterator<Item = TableDef>) -> Result<Self> {
        let mut by_name = Tables::new();
        for def in tables {
            if by_name.contains_key(def.name) {
                return Err(Error::Query(QueryError::new(
                    QueryErrorKind::Database,
                    def.name,
                    format!("table '{}' declared twice", def.name),
                )));
            }
            by_name.insert(def.name, Table::new(def));
        }

        for table in by_name.values() {
            for (columns, _) in table.def.unique_keys() {
                table.check_columns(columns)?;
            }
            for fk in &table.def.foreign_keys {
                table.check_columns(&fk.columns)?;
                let target = by_name
                    .get(fk.referenced_table)
                    .ok_or_else(|| missing_table(fk.referenced_table))?;
                target.check_columns(&fk.referenced_columns)?;
                if fk.columns.len() != fk.referenced_columns.len() {
                    return Err(Error::Query(QueryError::new(
                        QueryErrorKind::Database,
                        table.def.name,
                        format!(
                            "foreign key {:?} has {} columns but references {}",
                            fk.columns,
                            fk.columns.len(),
                            fk.referenced_columns.len()
                        ),
                    )));
                }
            }
        }

        tracing::debug!(tables = by_name.len(), "Memory store created");
        Ok(Self {
            inner: Arc::new(Mutex::new(MemoryInner {
                tables: by_name,
                ..MemoryInner::default()
            })),
        })
    }

    /// Derive tables, primary keys and foreign keys from a mapping registry.
    pub fn from_registry(registry: &MappingRegistry) -> Result<Self> {
        let mut defs = Vec::new();
        for mapping in registry.entities() {
            let mut def = TableDef::new(mapping.table, registry.table_columns(mapping.name)?)
                .primary_key(registry.key_columns(mapping.name)?);
            for fk in registry.foreign_keys().iter().filter(|fk| fk.table == mapping.table) {
                def = def.foreign_key(ForeignKey::new(
                    &fk.columns,
                    fk.referenced_table,
                    &fk.referenced_columns,
                ));
            }
            defs.push(def);
        }
        Self::new(defs)
    }

    fn lock(&self) -> MutexGuard<'_, MemoryInner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Execute a statement synchronously, returning rows affected.
    #[tracing::instrument(level = "trace", skip(self, statement), fields(table = statement.table(), verb = statement.verb()))]
    pub fn execute_sync(&self, statement: &Statement) -> Result<u64> {
        let mut inner = self.lock();
        let table = inner
            .tables
            .get(statement.table())
            .ok_or_else(|| missing_table(statement.table()))?;

        let change = match statement {
            Statement::Insert { columns, values, .. } => plan_insert(table, columns, values)?,
            Statement::Update {
                key_columns,
                key_values,
                set_columns,
                set_values,
                ..
            } => plan_update(table, key_columns, key_values, set_columns, set_values)?,
            Statement::Delete {
                key_columns,
                key_values,
                ..
            } => plan_delete(table, key_columns, key_values)?,
        };

        if let Err(e) = check_constraints(&inner.tables, &change) {
            tracing::debug!(error = %e, "Statement rejected");
            return Err(attach_sql(e, statement));
        }

        let affected = change.affected;
        if let Some(table) = inner.tables.get_mut(change.table) {
            table.rows = change.rows;
        }
        inner.log.push(statement.clone());
        Ok(affected)
    }

    /// Run a lookup synchronously.
    pub fn query_sync(&self, lookup: &Lookup) -> Result<Vec<Row>> {
        let inner = self.lock();
        let table = inner
            .tables
            .get(lookup.table)
            .ok_or_else(|| missing_table(lookup.table))?;
        table.check_columns(&lookup.columns)?;
        Ok(table
            .rows
            .iter()
            .filter(|row| same(&table.project(row, &lookup.columns), &lookup.values))
            .map(|row| table.to_row(row))
            .collect())
    }

    fn begin_sync(&self) -> Result<()> {
        let mut inner = self.lock();
        if inner.snapshot.is_some() {
            return Err(transaction_error(
                TransactionErrorKind::AlreadyActive,
                "Already in a transaction",
            ));
        }
        inner.snapshot = Some(inner.tables.clone());
        tracing::debug!("Transaction started");
        Ok(())
    }

    fn commit_sync(&self) -> Result<()> {
        let mut inner = self.lock();
        if inner.snapshot.is_none() {
            return Err(transaction_error(
                TransactionErrorKind::NotActive,
                "Not in a transaction",
            ));
        }
        if let Some(message) = inner.fail_commit.take() {
            tracing::debug!(%message, "Injected commit failure");
            return Err(Error::Query(
                QueryError::new(QueryErrorKind::Database, "", message).with_sql("COMMIT"),
            ));
        }
        inner.snapshot = None;
        tracing::debug!("Transaction committed");
        Ok(())
    }

    fn rollback_sync(&self) -> Result<()> {
        let mut inner = self.lock();
        let Some(snapshot) = inner.snapshot.take() else {
            return Err(transaction_error(
                TransactionErrorKind::NotActive,
                "Not in a transaction",
            ));
        };
        inner.tables = snapshot;
        tracing::debug!("Transaction rolled back");
        Ok(())
    }

    // ========================================================================
    // Inspection
    // ========================================================================

    /// Every row of `table`, in insertion order.
    pub fn rows(&self, table: &'static str) -> Result<Vec<Row>> {
        self.query_sync(&Lookup::new(table, Vec::new(), Vec::new()))
    }

    /// Number of rows in `table`; zero for unknown tables.
    pub fn row_count(&self, table: &str) -> usize {
        self.lock().tables.get(table).map_or(0, |t| t.rows.len())
    }

    /// Schema of `table`.
    pub fn table_def(&self, table: &str) -> Option<TableDef> {
        self.lock().tables.get(table).map(|t| t.def.clone())
    }

    /// Statements executed successfully so far, rolled back ones included.
    pub fn statements(&self) -> Vec<Statement> {
        self.lock().log.clone()
    }

    pub fn clear_statements(&self) {
        self.lock().log.clear();
    }

    pub fn in_transaction(&self) -> bool {
        self.lock().snapshot.is_some()
    }

    /// Make the next commit fail with `message`, leaving the transaction open.
    pub fn fail_next_commit(&self, message: impl Into<String>) {
        self.lock().fail_commit = Some(message.into());
    }
}

fn plan_insert(table: &Table, columns: &[&'static str], values: &[Value]) -> Result<Change> {
    let mut row = vec![Value::Null; table.def.columns.len()];
    for (column, value) in columns.iter().zip(values) {
        row[table.index(column)?] = value.clone();
    }
    let mut rows = table.rows.clone();
    rows.push(row);
    Ok(Change {
        table: table.def.name,
        touched: vec![rows.len() - 1],
        rows,
        released: Vec::new(),
        affected: 1,
    })
}

fn plan_update(
    table: &Table,
    key_columns: &[&'static str],
    key_values: &[Value],
    set_columns: &[&'static str],
    set_values: &[Value],
) -> Result<Change> {
    table.check_columns(key_columns)?;
    let targets: Vec<usize> = set_columns
        .iter()
        .map(|c| table.index(c))
        .collect::<Result<_>>()?;

    let mut rows = table.rows.clone();
    let mut touched = Vec::new();
    let mut released = Vec::new();
    for (i, row) in rows.iter_mut().enumerate() {
        if !same(&table.project(row, key_columns), key_values) {
            continue;
        }
        released.push(row.clone());
        for (&idx, value) in targets.iter().zip(set_values) {
            row[idx] = value.clone();
        }
        touched.push(i);
    }
    Ok(Change {
        table: table.def.name,
        affected: touched.len() as u64,
        rows,
        touched,
        released,
    })
}

fn plan_delete(table: &Table, key_columns: &[&'static str], key_values: &[Value]) -> Result<Change> {
    table.check_columns(key_columns)?;
    let (released, rows): (Vec<_>, Vec<_>) = table
        .rows
        .iter()
        .cloned()
        .partition(|row| same(&table.project(row, key_columns), key_values));
    Ok(Change {
        table: table.def.name,
        affected: released.len() as u64,
        rows,
        touched: Vec::new(),
        released,
    })
}

/// Rows of `name` as they would be after `change`.
fn rows_after<'a>(tables: &'a Tables, change: &'a Change, name: &str) -> &'a [Vec<Value>] {
    if name == change.table {
        &change.rows
    } else {
        tables.get(name).map(|t| t.rows.as_slice()).unwrap_or_default()
    }
}

fn check_constraints(tables: &Tables, change: &Change) -> Result<()> {
    let Some(table) = tables.get(change.table) else {
        return Err(missing_table(change.table));
    };
    for &i in &change.touched {
        let row = &change.rows[i];
        for (columns, primary) in table.def.unique_keys() {
            let values = table.project(row, columns);
            if has_null(&values) {
                if primary {
                    return Err(Error::Query(QueryError::new(
                        QueryErrorKind::Database,
                        table.def.name,
                        format!("NOT NULL constraint failed: {}.{:?}", table.def.name, columns),
                    )));
                }
                continue;
            }
            let clash = change
                .rows
                .iter()
                .enumerate()
                .any(|(j, other)| j != i && same(&table.project(other, columns), &values));
            if clash {
                return Err(Error::Query(QueryError::new(
                    QueryErrorKind::UniqueViolation,
                    table.def.name,
                    format!("duplicate value {:?} for {:?}", values, columns),
                )));
            }
        }

        for fk in &table.def.foreign_keys {
            let values = table.project(row, &fk.columns);
            if has_null(&values) {
                continue;
            }
            let Some(target) = tables.get(fk.referenced_table) else {
                return Err(missing_table(fk.referenced_table));
            };
            let found = rows_after(tables, change, fk.referenced_table)
                .iter()
                .any(|r| same(&target.project(r, &fk.referenced_columns), &values));
            if !found {
                return Err(Error::Query(QueryError::new(
                    QueryErrorKind::ForeignKeyViolation,
                    table.def.name,
                    format!(
                        "{:?} = {:?} has no matching row in '{}'",
                        fk.columns, values, fk.referenced_table
                    ),
                )));
            }
        }
    }

    if change.released.is_empty() {
        return Ok(());
    }
    for referencing in tables.values() {
        for fk in referencing
            .def
            .foreign_keys
            .iter()
            .filter(|fk| fk.referenced_table == change.table)
        {
            for old in &change.released {
                let values = table.project(old, &fk.referenced_columns);
                if has_null(&values) {
                    continue;
                }
                let still_there = change
                    .rows
                    .iter()
                    .any(|r| same(&table.project(r, &fk.referenced_columns), &values));
                if still_there {
                    continue;
                }
                let referenced = rows_after(tables, change, referencing.def.name)
                    .iter()
                    .any(|r| same(&referencing.project(r, &fk.columns), &values));
                if referenced {
                    return Err(Error::Query(QueryError::new(
                        QueryErrorKind::ForeignKeyViolation,
                        table.def.name,
                        format!(
                            "row {:?} of '{}' is still referenced by '{}'",
                            values, change.table, referencing.def.name
                        ),
                    )));
                }
            }
        }
    }
    Ok(())
}

fn attach_sql(error: Error, statement: &Statement) -> Error {
    match error {
        Error::Query(q) => Error::Query(q.with_sql(statement.to_sql())),
        other => other,
    }
}

fn missing_table(table: &str) -> Error {
    Error::Query(QueryError::new(
        QueryErrorKind::MissingTable,
        table,
        format!("no such table: {table}"),
    ))
}

fn missing_column(table: &str, column: &str) -> Error {
    Error::Query(QueryError::new(
        QueryErrorKind::MissingColumn,
        table,
        format!("no such column: {table}.{column}"),
    ))
}

fn transaction_error(kind: TransactionErrorKind, message: &str) -> Error {
    Error::Transaction(TransactionError {
        kind,
        message: message.to_string(),
    })
}

// ── Datastore trait impl ──────────────────────────────────────────────────

impl Datastore for MemoryStore {
    fn execute(&self, _cx: &Cx, statement: &Statement) -> impl Future<Output = Outcome<u64, Error>> + Send {
        let result = self.execute_sync(statement);
        async move { result.map_or_else(Outcome::Err, Outcome::Ok) }
    }

    fn query(&self, _cx: &Cx, lookup: &Lookup) -> impl Future<Output = Outcome<Vec<Row>, Error>> + Send {
        let result = self.query_sync(lookup);
        async move { result.map_or_else(Outcome::Err, Outcome::Ok) }
    }

    fn begin(&self, _cx: &Cx) -> impl Future<Output = Outcome<(), Error>> + Send {
        let result = self.begin_sync();
        async move { result.map_or_else(Outcome::Err, Outcome::Ok) }
    }

    fn commit(&self, _cx: &Cx) -> impl Future<Output = Outcome<(), Error>> + Send {
        let result = self.commit_sync();
        async move { result.map_or_else(Outcome::Err, Outcome::Ok) }
    }

    fn rollback(&self, _cx: &Cx) -> impl Future<Output = Outcome<(), Error>> + Send {
        let result = self.rollback_sync();
        async move { result.map_or_else(Outcome::Err, Outcome::Ok) }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use asupersync::runtime::RuntimeBuilder;
    use relmodel_core::{
        AssociationInfo, AssociationKind, CascadeType, EntityMapping, JoinColumn, KeyComponentInfo,
        KeyShape,
    };

    fn store() -> MemoryStore {
        MemoryStore::new([
            TableDef::new("parent", &["id", "name"]).primary_key(&["id"]),
            TableDef::new("child", &["id", "parent_id", "name"])
                .primary_key(&["id", "parent_id"])
                .unique(&["name"])
                .foreign_key(ForeignKey::new(&["parent_id"], "parent", &["id"])),
            TableDef::new("note", &["id", "parent_id"])
                .primary_key(&["id"])
                .foreign_key(ForeignKey::new(&["parent_id"], "parent", &["id"])),
        ])
        .unwrap()
    }

    fn insert(table: &'static str, columns: &[&'static str], values: Vec<Value>) -> Statement {
        Statement::Insert {
            table,
            columns: columns.to_vec(),
            values,
        }
    }

    fn kind_of(err: &Error) -> QueryErrorKind {
        match err {
            Error::Query(q) => q.kind,
            other => panic!("expected query error, got {other:?}"),
        }
    }

    #[test]
    fn test_insert_and_query() {
        let store = store();
        store
            .execute_sync(&insert("parent", &["id", "name"], vec!["P".into(), "one".into()]))
            .unwrap();
        let rows = store
            .query_sync(&Lookup::new("parent", vec!["id"], vec!["P".into()]))
            .unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].get_by_name("name"), Some(&Value::from("one")));
        assert_eq!(store.statements().len(), 1);
    }

    #[test]
    fn test_primary_key_is_unique_and_not_null() {
        let store = store();
        let stmt = insert("parent", &["id"], vec!["P".into()]);
        store.execute_sync(&stmt).unwrap();
        let err = store.execute_sync(&stmt).unwrap_err();
        assert_eq!(kind_of(&err), QueryErrorKind::UniqueViolation);
        assert!(err.is_constraint_violation());

        let err = store
            .execute_sync(&insert("parent", &["name"], vec!["anon".into()]))
            .unwrap_err();
        assert_eq!(kind_of(&err), QueryErrorKind::Database);
        assert_eq!(store.row_count("parent"), 1);
        assert_eq!(store.statements().len(), 1);
    }

    #[test]
    fn test_unique_key_ignores_nulls() {
        let store = store();
        store.execute_sync(&insert("parent", &["id"], vec!["P".into()])).unwrap();
        for id in 1..=2 {
            store
                .execute_sync(&insert("child", &["id", "parent_id"], vec![Value::Int(id), "P".into()]))
                .unwrap();
        }
        let err = store
            .execute_sync(&Statement::Update {
                table: "child",
                key_columns: vec!["id", "parent_id"],
                key_values: vec![Value::Int(1), "P".into()],
                set_columns: vec!["name"],
                set_values: vec!["a".into()],
            })
            .and_then(|_| {
                store.execute_sync(&Statement::Update {
                    table: "child",
                    key_columns: vec!["id", "parent_id"],
                    key_values: vec![Value::Int(2), "P".into()],
                    set_columns: vec!["name"],
                    set_values: vec!["a".into()],
                })
            })
            .unwrap_err();
        assert_eq!(kind_of(&err), QueryErrorKind::UniqueViolation);
    }

    #[test]
    fn test_foreign_key_match_simple() {
        let store = store();
        let err = store
            .execute_sync(&insert("child", &["id", "parent_id"], vec![Value::Int(1), "P".into()]))
            .unwrap_err();
        assert_eq!(kind_of(&err), QueryErrorKind::ForeignKeyViolation);
        match err {
            Error::Query(q) => assert!(q.sql.unwrap().starts_with("INSERT INTO \"child\"")),
            _ => unreachable!(),
        }

        // A NULL reference is not checked.
        store.execute_sync(&insert("note", &["id"], vec![Value::Int(1)])).unwrap();
        let err = store
            .execute_sync(&insert("note", &["id", "parent_id"], vec![Value::Int(2), "P".into()]))
            .unwrap_err();
        assert_eq!(kind_of(&err), QueryErrorKind::ForeignKeyViolation);

        // A NULL primary key column is rejected even when it is also a reference.
        let err = store
            .execute_sync(&insert("child", &["id"], vec![Value::Int(1)]))
            .unwrap_err();
        assert_eq!(kind_of(&err), QueryErrorKind::Database);
    }

    #[test]
    fn test_referenced_row_cannot_be_deleted() {
        let store = store();
        store.execute_sync(&insert("parent", &["id"], vec!["P".into()])).unwrap();
        store
            .execute_sync(&insert("child", &["id", "parent_id"], vec![Value::Int(1), "P".into()]))
            .unwrap();

        let delete_parent = Statement::Delete {
            table: "parent",
            key_columns: vec!["id"],
            key_values: vec!["P".into()],
        };
        let err = store.execute_sync(&delete_parent).unwrap_err();
        assert_eq!(kind_of(&err), QueryErrorKind::ForeignKeyViolation);

        let delete_child = Statement::Delete {
            table: "child",
            key_columns: vec!["id", "parent_id"],
            key_values: vec![Value::Int(1), "P".into()],
        };
        assert_eq!(store.execute_sync(&delete_child).unwrap(), 1);
        assert_eq!(store.execute_sync(&delete_parent).unwrap(), 1);
        assert_eq!(store.execute_sync(&delete_parent).unwrap(), 0);
    }

    #[test]
    fn test_update_of_referenced_key_is_restricted() {
        let store = store();
        store.execute_sync(&insert("parent", &["id"], vec!["P".into()])).unwrap();
        store
            .execute_sync(&insert("child", &["id", "parent_id"], vec![Value::Int(1), "P".into()]))
            .unwrap();
        let err = store
            .execute_sync(&Statement::Update {
                table: "parent",
                key_columns: vec!["id"],
                key_values: vec!["P".into()],
                set_columns: vec!["id"],
                set_values: vec!["Q".into()],
            })
            .unwrap_err();
        assert_eq!(kind_of(&err), QueryErrorKind::ForeignKeyViolation);
    }

    #[test]
    fn test_unknown_table_and_column() {
        let store = store();
        let err = store.execute_sync(&insert("nope", &["id"], vec![Value::Int(1)])).unwrap_err();
        assert_eq!(kind_of(&err), QueryErrorKind::MissingTable);
        let err = store
            .execute_sync(&insert("parent", &["id", "bogus"], vec!["P".into(), Value::Int(1)]))
            .unwrap_err();
        assert_eq!(kind_of(&err), QueryErrorKind::MissingColumn);
    }

    #[test]
    fn test_rollback_restores_snapshot() {
        let rt = RuntimeBuilder::current_thread().build().expect("create asupersync runtime");
        let cx = Cx::for_testing();
        let store = store();

        rt.block_on(async {
            assert!(matches!(store.begin(&cx).await, Outcome::Ok(())));
            assert!(matches!(
                store.begin(&cx).await,
                Outcome::Err(Error::Transaction(TransactionError {
                    kind: TransactionErrorKind::AlreadyActive,
                    ..
                }))
            ));
            let outcome = store
                .execute(&cx, &insert("parent", &["id"], vec!["P".into()]))
                .await;
            assert!(matches!(outcome, Outcome::Ok(1)));
            assert!(matches!(store.rollback(&cx).await, Outcome::Ok(())));
        });

        assert_eq!(store.row_count("parent"), 0);
        assert!(!store.in_transaction());
        // The log keeps what was executed.
        assert_eq!(store.statements().len(), 1);
    }

    #[test]
    fn test_commit_outside_transaction_and_injected_failure() {
        let rt = RuntimeBuilder::current_thread().build().expect("create asupersync runtime");
        let cx = Cx::for_testing();
        let store = store();

        rt.block_on(async {
            assert!(matches!(
                store.commit(&cx).await,
                Outcome::Err(Error::Transaction(TransactionError {
                    kind: TransactionErrorKind::NotActive,
                    ..
                }))
            ));
            store.fail_next_commit("disk full");
            assert!(matches!(store.begin(&cx).await, Outcome::Ok(())));
            assert!(matches!(store.commit(&cx).await, Outcome::Err(Error::Query(_))));
            assert!(store.in_transaction());
            assert!(matches!(store.commit(&cx).await, Outcome::Ok(())));
        });
    }

    const CHILD_KEY: &[KeyComponentInfo] = &[
        KeyComponentInfo::column("id", "id"),
        KeyComponentInfo::embedded("parent", "parent", &["parent_id"]),
    ];
    const PARENT_ASSOCIATIONS: &[AssociationInfo] = &[
        AssociationInfo::new("children", "child", AssociationKind::OneToMany)
            .join_columns(&[JoinColumn::new("parent_id", "id")])
            .cascade(CascadeType::ALL)
            .orphan_removal(true),
        AssociationInfo::new("child", "child", AssociationKind::OneToOne)
            .join_columns(&[
                JoinColumn::new("id", "parent_id").read_only(),
                JoinColumn::new("child_id", "id").read_only(),
            ])
            .cascade(CascadeType::ALL),
    ];

    #[test]
    fn test_schema_from_registry() {
        let registry = MappingRegistry::builder()
            .register(
                EntityMapping::new("parent", "parent", KeyShape::simple("id"))
                    .associations(PARENT_ASSOCIATIONS),
            )
            .register(EntityMapping::new("child", "child", KeyShape::composite(CHILD_KEY)))
            .build()
            .unwrap();
        let store = MemoryStore::from_registry(&registry).unwrap();

        let child = store.table_def("child").unwrap();
        assert_eq!(child.primary_key, vec!["id", "parent_id"]);
        assert_eq!(
            child.foreign_keys,
            vec![ForeignKey::new(&["parent_id"], "parent", &["id"])]
        );
        let parent = store.table_def("parent").unwrap();
        assert!(parent.columns.contains(&"child_id"));

        // The read-only one-to-one reference is NULL, so it is never checked.
        store.execute_sync(&insert("parent", &["id"], vec!["P".into()])).unwrap();
        store
            .execute_sync(&insert("child", &["id", "parent_id"], vec![Value::Int(1), "P".into()]))
            .unwrap();
        assert_eq!(store.rows("child").unwrap().len(), 1);
    }
}
