//! Row images: the column values an entity writes to its table.
//!
//! A [`RowImage`] is built from the mapping, never from the entity alone: key
//! columns come from the resolved key, attribute columns from the entity's
//! attributes, join columns from the association's write-owning bindings.
//! Read-only bindings contribute nothing. A writable join column that
//! overlaps a key column is written once, from the key, and the association's
//! value must agree with it.

use relmodel_core::{
    ColumnWriter, Entity, EntityKey, Error, JoinSide, KeyOwner, KeyResolver, MappingError,
    MappingErrorKind, MappingRegistry, Related, Result, Row, Statement, Value,
};
use serde::Serialize;

/// One column of a row image.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RowColumn {
    pub name: &'static str,
    pub value: Value,
    /// Written by INSERT.
    pub insertable: bool,
    /// Written by UPDATE.
    pub updatable: bool,
}

/// Column values of one row, in mapping order.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RowImage {
    table: &'static str,
    columns: Vec<RowColumn>,
}

/// A join column written into a collection member's row by its owner.
#[derive(Debug, Clone, PartialEq)]
pub struct IncomingColumn {
    pub column: &'static str,
    pub value: Value,
    pub insertable: bool,
    pub updatable: bool,
    pub association: ColumnWriter,
}

impl RowImage {
    pub fn new(table: &'static str) -> Self {
        Self {
            table,
            columns: Vec::new(),
        }
    }

    pub fn table(&self) -> &'static str {
        self.table
    }

    pub fn get(&self, column: &str) -> Option<&Value> {
        self.column(column).map(|c| &c.value)
    }

    pub fn column(&self, column: &str) -> Option<&RowColumn> {
        self.columns.iter().find(|c| c.name == column)
    }

    pub fn columns(&self) -> &[RowColumn] {
        &self.columns
    }

    pub fn len(&self) -> usize {
        self.columns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.columns.is_empty()
    }

    /// Set a column, replacing any previous value and flags.
    pub fn set(&mut self, column: RowColumn) {
        match self.columns.iter_mut().find(|c| c.name == column.name) {
            Some(existing) => *existing = column,
            None => self.columns.push(column),
        }
    }

    /// Set only the value of an existing column.
    pub fn set_value(&mut self, column: &str, value: Value) -> bool {
        match self.columns.iter_mut().find(|c| c.name == column) {
            Some(existing) => {
                existing.value = value;
                true
            }
            None => false,
        }
    }

    /// Overwrite this image with every column of `other`.
    pub fn overlay(&mut self, other: &RowImage) {
        for column in &other.columns {
            self.set(column.clone());
        }
    }

    /// Merge another image of the same row; both must agree on shared columns.
    ///
    /// Returns the first conflicting column.
    pub fn merge(&mut self, other: &RowImage) -> std::result::Result<(), &'static str> {
        if let Some(conflict) = other
            .columns
            .iter()
            .find(|c| self.get(c.name).is_some_and(|v| *v != c.value))
        {
            return Err(conflict.name);
        }
        for column in &other.columns {
            if self.column(column.name).is_none() {
                self.columns.push(column.clone());
            }
        }
        Ok(())
    }

    /// Updatable columns whose value differs from `base`.
    pub fn changed_since(&self, base: &RowImage) -> Vec<&RowColumn> {
        self.columns
            .iter()
            .filter(|c| c.updatable && base.get(c.name) != Some(&c.value))
            .collect()
    }

    /// INSERT of every insertable column.
    pub fn insert_statement(&self) -> Statement {
        let (columns, values) = self
            .columns
            .iter()
            .filter(|c| c.insertable)
            .map(|c| (c.name, c.value.clone()))
            .unzip();
        Statement::Insert {
            table: self.table,
            columns,
            values,
        }
    }

    /// Build an image of a row read back from the datastore.
    pub fn from_row(registry: &MappingRegistry, entity: &str, row: &Row) -> Result<Self> {
        let mapping = registry.mapping(entity)?;
        let mut image = RowImage::new(mapping.table);
        for &column in registry.table_columns(entity)? {
            let (insertable, updatable) = column_flags(registry, mapping.table, column);
            image.set(RowColumn {
                name: column,
                value: row.get_by_name(column).cloned().unwrap_or(Value::Null),
                insertable,
                updatable,
            });
        }
        Ok(image)
    }

    /// Values of `columns`, `Null` for absent ones.
    pub fn values_of(&self, columns: &[&'static str]) -> Vec<Value> {
        columns
            .iter()
            .map(|c| self.get(c).cloned().unwrap_or(Value::Null))
            .collect()
    }
}

/// INSERT/UPDATE flags of a column, derived from its declared owner.
pub fn column_flags(registry: &MappingRegistry, table: &str, column: &str) -> (bool, bool) {
    match registry.owner_of(table, column) {
        Some(ColumnWriter::Key { .. }) => (true, false),
        Some(ColumnWriter::Attribute { .. }) => (true, true),
        Some(ColumnWriter::Association {
            entity,
            association,
        }) => registry
            .get(entity)
            .and_then(|m| m.association(association))
            .and_then(|a| a.join_columns.iter().find(|j| j.name == column))
            .map_or((false, false), |j| (j.insertable, j.updatable)),
        None => (false, false),
    }
}

/// Builds row images for entities against a registry.
#[derive(Debug, Clone, Copy)]
pub struct RowWriter<'r> {
    registry: &'r MappingRegistry,
}

impl<'r> RowWriter<'r> {
    pub fn new(registry: &'r MappingRegistry) -> Self {
        Self { registry }
    }

    /// Image holding only the key columns of `key`.
    pub fn key_row(&self, entity: &str, key: &EntityKey) -> Result<RowImage> {
        let mapping = self.registry.mapping(entity)?;
        let key_columns = self.registry.key_columns(entity)?;
        let values = key.values();
        if values.len() != key_columns.len() {
            return Err(Error::Mapping(MappingError::new(
                MappingErrorKind::KeyShape,
                mapping.name,
                format!(
                    "key {} has {} values, table '{}' has {} key columns",
                    key,
                    values.len(),
                    mapping.table,
                    key_columns.len()
                ),
            )));
        }
        let mut image = RowImage::new(mapping.table);
        for (&name, value) in key_columns.iter().zip(values) {
            image.set(RowColumn {
                name,
                value,
                insertable: true,
                updatable: false,
            });
        }
        Ok(image)
    }

    /// Full image of `entity`, whose key resolved to `key`.
    ///
    /// `incoming` holds join columns written by the collection that reached
    /// this entity.
    pub fn build(&self, entity: &Entity, key: &EntityKey, incoming: &[IncomingColumn]) -> Result<RowImage> {
        let mapping = self.registry.mapping(entity.name())?;
        let mut image = self.key_row(entity.name(), key)?;

        for (column, value) in entity.attributes() {
            if !mapping.has_attribute(column) {
                return Err(Error::Mapping(MappingError::new(
                    MappingErrorKind::UnknownColumn,
                    mapping.name,
                    format!("'{}' is not an attribute column of '{}'", column, mapping.table),
                )));
            }
            image.set(RowColumn {
                name: column,
                value: value.clone(),
                insertable: true,
                updatable: true,
            });
        }

        let resolver = KeyResolver::new(self.registry);
        for assoc in mapping.associations {
            if assoc.join_side() != JoinSide::Source || assoc.is_read_only() {
                continue;
            }
            let target = match entity.related(assoc.name) {
                None => continue,
                Some(Related::One(target)) => target.as_deref(),
                Some(Related::Many(_)) => {
                    return Err(Error::Mapping(MappingError::new(
                        MappingErrorKind::AssociationShape,
                        mapping.name,
                        format!("association '{}' is single-valued", assoc.name),
                    )));
                }
            };
            let target_key = match target {
                Some(t) => Some(resolver.resolve_with_owner(
                    t,
                    Some(KeyOwner {
                        entity: mapping.name,
                        key,
                    }),
                )?),
                None => None,
            };
            let writer = ColumnWriter::Association {
                entity: mapping.name,
                association: assoc.name,
            };
            for join in assoc.join_columns.iter().filter(|j| !j.is_read_only()) {
                let value = match (target, &target_key) {
                    (Some(t), Some(k)) => self.referenced_value(t, k, join.referenced)?,
                    _ => Value::Null,
                };
                write_association_column(
                    &mut image,
                    mapping.name,
                    &IncomingColumn {
                        column: join.name,
                        value,
                        insertable: join.insertable,
                        updatable: join.updatable,
                        association: writer,
                    },
                )?;
            }
        }

        for column in incoming {
            write_association_column(&mut image, mapping.name, column)?;
        }

        Ok(image)
    }

    /// Join columns a collection association writes into its members' rows,
    /// computed from the owner's row image.
    pub fn incoming_columns(
        &self,
        owner: &'static str,
        association: &'static str,
        owner_row: &RowImage,
    ) -> Result<Vec<IncomingColumn>> {
        let mapping = self.registry.mapping(owner)?;
        let Some(assoc) = mapping.association(association) else {
            return Err(Error::Mapping(MappingError::new(
                MappingErrorKind::UnknownAssociation,
                mapping.name,
                format!("no association named '{association}'"),
            )));
        };
        if assoc.join_side() != JoinSide::Target {
            return Ok(Vec::new());
        }
        let writer = ColumnWriter::Association {
            entity: mapping.name,
            association: assoc.name,
        };
        Ok(assoc
            .join_columns
            .iter()
            .filter(|j| !j.is_read_only())
            .map(|j| IncomingColumn {
                column: j.name,
                value: owner_row.get(j.referenced).cloned().unwrap_or(Value::Null),
                insertable: j.insertable,
                updatable: j.updatable,
                association: writer,
            })
            .collect())
    }

    /// Value of `column` on the target entity: from its key when it is a key
    /// column, otherwise from its attributes.
    fn referenced_value(&self, target: &Entity, key: &EntityKey, column: &str) -> Result<Value> {
        let key_columns = self.registry.key_columns(target.name())?;
        if let Some(idx) = key_columns.iter().position(|c| *c == column) {
            return Ok(key.values().swap_remove(idx));
        }
        match target.attr(column) {
            Some(value) => Ok(value.clone()),
            None => {
                tracing::warn!(
                    entity = target.name(),
                    column = column,
                    "Referenced column has no value on target; writing NULL"
                );
                Ok(Value::Null)
            }
        }
    }
}

/// Write a join column, deferring to a key column that already holds it.
fn write_association_column(image: &mut RowImage, entity: &'static str, column: &IncomingColumn) -> Result<()> {
    match image.column(column.column) {
        Some(existing) if !existing.updatable && existing.insertable => {
            // Key column: written once, from the key.
            if existing.value != column.value {
                return Err(Error::Mapping(MappingError::new(
                    MappingErrorKind::ColumnValueConflict,
                    entity,
                    format!(
                        "{} writes {} to '{}.{}', key holds {}",
                        column.association,
                        column.value,
                        image.table(),
                        column.column,
                        existing.value
                    ),
                )));
            }
            Ok(())
        }
        _ => {
            image.set(RowColumn {
                name: column.column,
                value: column.value.clone(),
                insertable: column.insertable,
                updatable: column.updatable,
            });
            Ok(())
        }
    }
}
