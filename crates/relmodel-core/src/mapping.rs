//! Per-entity mapping declarations.
//!
//! Mappings are plain `const`-constructible structs, so an application can
//! declare its whole model as `static` data and hand it to
//! [`MappingRegistry`](crate::registry::MappingRegistry) for validation.

use crate::association::AssociationInfo;

/// The shape of an entity's primary key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyShape {
    /// One scalar column.
    Simple { column: &'static str },
    /// Ordered named components.
    Composite(&'static [KeyComponentInfo]),
}

impl KeyShape {
    #[must_use]
    pub const fn simple(column: &'static str) -> Self {
        KeyShape::Simple { column }
    }

    #[must_use]
    pub const fn composite(components: &'static [KeyComponentInfo]) -> Self {
        KeyShape::Composite(components)
    }

    /// Number of named components (1 for a simple key).
    pub const fn arity(&self) -> usize {
        match self {
            KeyShape::Simple { .. } => 1,
            KeyShape::Composite(components) => components.len(),
        }
    }
}

/// Declaration of one component of a composite key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KeyComponentInfo {
    /// Component name, used in key drafts and error paths.
    pub name: &'static str,
    pub kind: KeyComponentKind,
}

/// Where a key component's value lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyComponentKind {
    /// A scalar stored in one column of this entity's table.
    Column(&'static str),
    /// Another entity's key, stored in these columns of this entity's table.
    ///
    /// `columns` map positionally onto the flattened key columns of `entity`.
    Embedded {
        entity: &'static str,
        columns: &'static [&'static str],
    },
}

impl KeyComponentInfo {
    /// A scalar component stored in `column`.
    #[must_use]
    pub const fn column(name: &'static str, column: &'static str) -> Self {
        Self {
            name,
            kind: KeyComponentKind::Column(column),
        }
    }

    /// A component holding the key of `entity`, stored in `columns`.
    #[must_use]
    pub const fn embedded(
        name: &'static str,
        entity: &'static str,
        columns: &'static [&'static str],
    ) -> Self {
        Self {
            name,
            kind: KeyComponentKind::Embedded { entity, columns },
        }
    }

    /// The local columns this component occupies.
    pub fn columns(&self) -> &[&'static str] {
        match &self.kind {
            KeyComponentKind::Column(column) => std::slice::from_ref(column),
            KeyComponentKind::Embedded { columns, .. } => columns,
        }
    }
}

/// Mapping of one entity type onto one table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EntityMapping {
    /// Entity type name.
    pub name: &'static str,
    pub table: &'static str,
    pub key: KeyShape,
    /// Plain attribute columns (not part of the key and not join columns).
    pub columns: &'static [&'static str],
    pub associations: &'static [AssociationInfo],
}

impl EntityMapping {
    /// Create a mapping with a key and no attributes or associations.
    #[must_use]
    pub const fn new(name: &'static str, table: &'static str, key: KeyShape) -> Self {
        Self {
            name,
            table,
            key,
            columns: &[],
            associations: &[],
        }
    }

    /// Set the attribute columns.
    #[must_use]
    pub const fn columns(mut self, columns: &'static [&'static str]) -> Self {
        self.columns = columns;
        self
    }

    /// Set the associations.
    #[must_use]
    pub const fn associations(mut self, associations: &'static [AssociationInfo]) -> Self {
        self.associations = associations;
        self
    }

    /// Find an association by name.
    pub fn association(&self, name: &str) -> Option<&'static AssociationInfo> {
        self.associations.iter().find(|a| a.name == name)
    }

    /// Is `column` one of this entity's attribute columns?
    pub fn has_attribute(&self, column: &str) -> bool {
        self.columns.contains(&column)
    }

    /// Local key columns in declaration order (embedded keys expanded).
    pub fn key_columns(&self) -> Vec<&'static str> {
        match &self.key {
            KeyShape::Simple { column } => vec![*column],
            KeyShape::Composite(components) => components
                .iter()
                .flat_map(|c| c.columns().iter().copied())
                .collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const CHILD_KEY: &[KeyComponentInfo] = &[
        KeyComponentInfo::column("id", "id"),
        KeyComponentInfo::embedded("parent", "parent", &["parent_id"]),
    ];

    #[test]
    fn test_key_columns_expand_embedded_components() {
        let child = EntityMapping::new("child", "child", KeyShape::composite(CHILD_KEY));
        assert_eq!(child.key_columns(), vec!["id", "parent_id"]);
        assert_eq!(child.key.arity(), 2);

        let parent = EntityMapping::new("parent", "parent", KeyShape::simple("id"))
            .columns(&["name"]);
        assert_eq!(parent.key_columns(), vec!["id"]);
        assert!(parent.has_attribute("name"));
        assert!(!parent.has_attribute("id"));
    }

    #[test]
    fn test_mapping_is_const_constructible() {
        const PARENT: EntityMapping = EntityMapping::new("parent", "parent", KeyShape::simple("id"));
        assert_eq!(PARENT.table, "parent");
        assert!(PARENT.association("children").is_none());
    }
}
