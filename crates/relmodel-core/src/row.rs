//! Datastore row representation.

use crate::Result;
use crate::error::{Error, TypeError};
use crate::value::Value;
use std::collections::HashMap;
use std::sync::Arc;

/// Column metadata shared across all rows of one lookup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnInfo {
    names: Vec<String>,
    name_to_index: HashMap<String, usize>,
}

impl ColumnInfo {
    pub fn new(names: Vec<String>) -> Self {
        let name_to_index = names
            .iter()
            .enumerate()
            .map(|(i, name)| (name.clone(), i))
            .collect();
        Self {
            names,
            name_to_index,
        }
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }

    pub fn index_of(&self, name: &str) -> Option<usize> {
        self.name_to_index.get(name).copied()
    }

    pub fn names(&self) -> &[String] {
        &self.names
    }
}

/// A single row returned by [`Datastore::query`](crate::Datastore::query).
///
/// Rows provide index-based and name-based access to column values; column
/// metadata is shared via `Arc` between rows of the same result.
#[derive(Debug, Clone, PartialEq)]
pub struct Row {
    values: Vec<Value>,
    columns: Arc<ColumnInfo>,
}

impl Row {
    /// Create a row with its own column metadata.
    pub fn new(column_names: Vec<String>, values: Vec<Value>) -> Self {
        Self {
            values,
            columns: Arc::new(ColumnInfo::new(column_names)),
        }
    }

    /// Create a row sharing column metadata with other rows.
    pub fn with_columns(columns: Arc<ColumnInfo>, values: Vec<Value>) -> Self {
        Self { values, columns }
    }

    pub fn column_info(&self) -> Arc<ColumnInfo> {
        Arc::clone(&self.columns)
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&Value> {
        self.values.get(index)
    }

    pub fn get_by_name(&self, name: &str) -> Option<&Value> {
        self.columns.index_of(name).and_then(|i| self.values.get(i))
    }

    pub fn contains_column(&self, name: &str) -> bool {
        self.columns.index_of(name).is_some()
    }

    /// Get a typed value by column name.
    ///
    /// A missing column and a failed conversion are both reported as type
    /// errors naming the column.
    #[allow(clippy::result_large_err)]
    pub fn get_named<T>(&self, name: &str) -> Result<T>
    where
        T: TryFrom<Value, Error = Error>,
    {
        let value = self.get_by_name(name).ok_or_else(|| {
            Error::Type(TypeError {
                expected: std::any::type_name::<T>(),
                actual: format!("column '{}' not found", name),
                column: Some(name.to_string()),
            })
        })?;
        T::try_from(value.clone()).map_err(|e| match e {
            Error::Type(mut te) => {
                te.column = Some(name.to_string());
                Error::Type(te)
            }
            e => e,
        })
    }

    pub fn column_names(&self) -> impl Iterator<Item = &str> {
        self.columns.names().iter().map(String::as_str)
    }

    pub fn values(&self) -> impl Iterator<Item = &Value> {
        self.values.iter()
    }

    /// Iterate over (column name, value) pairs.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.column_names().zip(self.values.iter())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn child_row() -> Row {
        Row::new(
            vec!["id".to_string(), "parent_id".to_string()],
            vec![Value::Int(1), Value::Text("SOME_PARENT".to_string())],
        )
    }

    #[test]
    fn test_row_basic_access() {
        let row = child_row();
        assert_eq!(row.len(), 2);
        assert!(!row.is_empty());
        assert_eq!(row.get(0), Some(&Value::Int(1)));
        assert_eq!(row.get(2), None);
        assert_eq!(
            row.get_by_name("parent_id"),
            Some(&Value::Text("SOME_PARENT".to_string()))
        );
        assert_eq!(row.get_by_name("missing"), None);
        assert!(row.contains_column("id"));
    }

    #[test]
    fn test_row_typed_access() {
        let row = child_row();
        let id: i32 = row.get_named("id").unwrap();
        let parent: String = row.get_named("parent_id").unwrap();
        assert_eq!(id, 1);
        assert_eq!(parent, "SOME_PARENT");
    }

    #[test]
    fn test_row_type_errors_name_the_column() {
        let row = child_row();
        match row.get_named::<i64>("parent_id") {
            Err(Error::Type(e)) => assert_eq!(e.column.as_deref(), Some("parent_id")),
            other => panic!("expected type error, got {other:?}"),
        }
        assert!(row.get_named::<i32>("missing").is_err());
    }

    #[test]
    fn test_row_shared_columns() {
        let first = child_row();
        let second = Row::with_columns(first.column_info(), vec![Value::Int(2), Value::Null]);
        assert!(Arc::ptr_eq(&first.column_info(), &second.column_info()));
        let parent: Option<String> = second.get_named("parent_id").unwrap();
        assert!(parent.is_none());
        assert_eq!(
            second.iter().map(|(name, _)| name).collect::<Vec<_>>(),
            vec!["id", "parent_id"]
        );
    }
}
