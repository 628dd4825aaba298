//! The datastore contract.
//!
//! The session is the only component that talks to a datastore, and it does
//! so through a narrow interface: execute a [`Statement`], run a key-equality
//! [`Lookup`], and manage one transaction. All operations integrate with
//! asupersync's structured concurrency via `Cx` and return `Outcome`.

use crate::error::Error;
use crate::identifiers::quote_ident;
use crate::row::Row;
use crate::value::Value;
use asupersync::{Cx, Outcome};
use std::fmt::Write as _;
use std::future::Future;

/// A single write against one table.
#[derive(Debug, Clone, PartialEq)]
pub enum Statement {
    Insert {
        table: &'static str,
        columns: Vec<&'static str>,
        values: Vec<Value>,
    },
    Update {
        table: &'static str,
        key_columns: Vec<&'static str>,
        key_values: Vec<Value>,
        set_columns: Vec<&'static str>,
        set_values: Vec<Value>,
    },
    Delete {
        table: &'static str,
        key_columns: Vec<&'static str>,
        key_values: Vec<Value>,
    },
}

impl Statement {
    pub fn table(&self) -> &'static str {
        match self {
            Statement::Insert { table, .. }
            | Statement::Update { table, .. }
            | Statement::Delete { table, .. } => table,
        }
    }

    /// "INSERT", "UPDATE" or "DELETE".
    pub fn verb(&self) -> &'static str {
        match self {
            Statement::Insert { .. } => "INSERT",
            Statement::Update { .. } => "UPDATE",
            Statement::Delete { .. } => "DELETE",
        }
    }

    /// Bind parameters in placeholder order.
    pub fn params(&self) -> Vec<Value> {
        match self {
            Statement::Insert { values, .. } => values.clone(),
            Statement::Update {
                key_values,
                set_values,
                ..
            } => set_values.iter().chain(key_values).cloned().collect(),
            Statement::Delete { key_values, .. } => key_values.clone(),
        }
    }

    /// Render as ANSI SQL with `$n` placeholders.
    pub fn to_sql(&self) -> String {
        match self {
            Statement::Insert { table, columns, .. } => {
                let cols: Vec<String> = columns.iter().map(|c| quote_ident(c)).collect();
                let placeholders: Vec<String> = (1..=columns.len()).map(|i| format!("${i}")).collect();
                format!(
                    "INSERT INTO {} ({}) VALUES ({})",
                    quote_ident(table),
                    cols.join(", "),
                    placeholders.join(", ")
                )
            }
            Statement::Update {
                table,
                key_columns,
                set_columns,
                ..
            } => {
                let set_clauses: Vec<String> = set_columns
                    .iter()
                    .enumerate()
                    .map(|(i, c)| format!("{} = ${}", quote_ident(c), i + 1))
                    .collect();
                format!(
                    "UPDATE {} SET {} WHERE {}",
                    quote_ident(table),
                    set_clauses.join(", "),
                    where_clause(key_columns, set_columns.len() + 1)
                )
            }
            Statement::Delete {
                table, key_columns, ..
            } => format!(
                "DELETE FROM {} WHERE {}",
                quote_ident(table),
                where_clause(key_columns, 1)
            ),
        }
    }
}

/// Equality lookup: rows of `table` whose `columns` equal `values`.
#[derive(Debug, Clone, PartialEq)]
pub struct Lookup {
    pub table: &'static str,
    pub columns: Vec<&'static str>,
    pub values: Vec<Value>,
}

impl Lookup {
    pub fn new(table: &'static str, columns: Vec<&'static str>, values: Vec<Value>) -> Self {
        Self {
            table,
            columns,
            values,
        }
    }

    /// Render as ANSI SQL with `$n` placeholders.
    pub fn to_sql(&self) -> String {
        if self.columns.is_empty() {
            return format!("SELECT * FROM {}", quote_ident(self.table));
        }
        format!(
            "SELECT * FROM {} WHERE {}",
            quote_ident(self.table),
            where_clause(&self.columns, 1)
        )
    }
}

fn where_clause(columns: &[&'static str], first_placeholder: usize) -> String {
    let mut out = String::new();
    for (i, column) in columns.iter().enumerate() {
        if i > 0 {
            out.push_str(" AND ");
        }
        let _ = write!(out, "{} = ${}", quote_ident(column), first_placeholder + i);
    }
    out
}

/// A transactional relational datastore.
pub trait Datastore: Send + Sync {
    /// Execute a write and return the number of rows affected.
    fn execute(
        &self,
        cx: &Cx,
        statement: &Statement,
    ) -> impl Future<Output = Outcome<u64, Error>> + Send;

    /// Return every row matching the lookup.
    fn query(&self, cx: &Cx, lookup: &Lookup) -> impl Future<Output = Outcome<Vec<Row>, Error>> + Send;

    /// Return the first row matching the lookup, if any.
    fn query_one(
        &self,
        cx: &Cx,
        lookup: &Lookup,
    ) -> impl Future<Output = Outcome<Option<Row>, Error>> + Send {
        async move {
            match self.query(cx, lookup).await {
                Outcome::Ok(rows) => Outcome::Ok(rows.into_iter().next()),
                Outcome::Err(e) => Outcome::Err(e),
                Outcome::Cancelled(r) => Outcome::Cancelled(r),
                Outcome::Panicked(p) => Outcome::Panicked(p),
            }
        }
    }

    fn begin(&self, cx: &Cx) -> impl Future<Output = Outcome<(), Error>> + Send;

    fn commit(&self, cx: &Cx) -> impl Future<Output = Outcome<(), Error>> + Send;

    fn rollback(&self, cx: &Cx) -> impl Future<Output = Outcome<(), Error>> + Send;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_insert_sql() {
        let stmt = Statement::Insert {
            table: "child",
            columns: vec!["id", "parent_id"],
            values: vec![Value::Int(1), Value::from("SOME_PARENT")],
        };
        assert_eq!(
            stmt.to_sql(),
            "INSERT INTO \"child\" (\"id\", \"parent_id\") VALUES ($1, $2)"
        );
        assert_eq!(stmt.verb(), "INSERT");
        assert_eq!(stmt.params().len(), 2);
    }

    #[test]
    fn test_update_sql_binds_set_values_first() {
        let stmt = Statement::Update {
            table: "parent",
            key_columns: vec!["id"],
            key_values: vec![Value::from("SOME_PARENT")],
            set_columns: vec!["name"],
            set_values: vec![Value::from("renamed")],
        };
        assert_eq!(
            stmt.to_sql(),
            "UPDATE \"parent\" SET \"name\" = $1 WHERE \"id\" = $2"
        );
        assert_eq!(
            stmt.params(),
            vec![Value::from("renamed"), Value::from("SOME_PARENT")]
        );
    }

    #[test]
    fn test_delete_sql() {
        let stmt = Statement::Delete {
            table: "child",
            key_columns: vec!["id", "parent_id"],
            key_values: vec![Value::Int(2), Value::from("SOME_PARENT")],
        };
        assert_eq!(
            stmt.to_sql(),
            "DELETE FROM \"child\" WHERE \"id\" = $1 AND \"parent_id\" = $2"
        );
        assert_eq!(stmt.table(), "child");
    }

    #[test]
    fn test_lookup_sql() {
        let lookup = Lookup::new("child", vec!["parent_id"], vec![Value::from("P")]);
        assert_eq!(
            lookup.to_sql(),
            "SELECT * FROM \"child\" WHERE \"parent_id\" = $1"
        );
        let all = Lookup::new("child", Vec::new(), Vec::new());
        assert_eq!(all.to_sql(), "SELECT * FROM \"child\"");
    }
}
