//! Validated collection of entity mappings.
//!
//! [`MappingRegistry::builder`] collects [`EntityMapping`]s and `build()`
//! checks them eagerly:
//!
//! - identifier syntax of entity, table, column, component and association names
//! - duplicates (entity names, tables, columns, associations, key components)
//! - association targets and embedded key targets are registered
//! - embedded key arity matches the embedded entity's key columns
//! - referenced join columns exist on the referenced table
//! - every physical column has at most one writer
//!
//! The built registry answers the questions the cascade engine and the
//! session need: key columns, table columns, the write owner of each column,
//! table dependencies for flush ordering and the foreign keys implied by the
//! mapping.

use crate::association::{AssociationInfo, JoinSide};
use crate::error::{ColumnOwnershipConflictError, Error, MappingErrorKind, Result};
use crate::identifiers::is_valid_identifier;
use crate::mapping::{EntityMapping, KeyComponentKind, KeyShape};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt;

/// Who may write a physical column.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ColumnWriter {
    /// Part of `entity`'s primary key.
    Key { entity: &'static str },
    /// A plain attribute column of `entity`.
    Attribute { entity: &'static str },
    /// A join column of `entity.association`.
    Association {
        entity: &'static str,
        association: &'static str,
    },
}

impl fmt::Display for ColumnWriter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ColumnWriter::Key { entity } => write!(f, "key of '{entity}'"),
            ColumnWriter::Attribute { entity } => write!(f, "attribute of '{entity}'"),
            ColumnWriter::Association {
                entity,
                association,
            } => write!(f, "association '{entity}.{association}'"),
        }
    }
}

/// Write ownership of one physical column.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnOwnership {
    pub table: &'static str,
    pub column: &'static str,
    /// The declared write owner; `None` when every binding is read-only.
    pub owner: Option<ColumnWriter>,
    /// Writable association bindings that overlap a key column. The key owns
    /// the column; the association's value must agree with it.
    pub shared_with: Vec<ColumnWriter>,
    /// Read-only association bindings.
    pub read_only: Vec<ColumnWriter>,
}

/// `table` holds columns that reference `references`; rows of `references`
/// must be inserted first and deleted last.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TableDependency {
    pub table: &'static str,
    pub references: &'static str,
}

/// A foreign key implied by an association or an embedded key.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ForeignKeyInfo {
    pub table: &'static str,
    pub columns: Vec<&'static str>,
    pub referenced_table: &'static str,
    pub referenced_columns: Vec<&'static str>,
}

#[derive(Debug, Clone)]
struct EntityEntry {
    mapping: EntityMapping,
    key_columns: Vec<&'static str>,
    table_columns: Vec<&'static str>,
}

/// Validated, immutable set of entity mappings.
#[derive(Debug, Clone)]
pub struct MappingRegistry {
    entries: Vec<EntityEntry>,
    by_name: HashMap<&'static str, usize>,
    by_table: HashMap<&'static str, usize>,
    ownership: BTreeMap<(&'static str, &'static str), ColumnOwnership>,
    dependencies: Vec<TableDependency>,
    foreign_keys: Vec<ForeignKeyInfo>,
}

/// Collects mappings for [`MappingRegistry`].
#[derive(Debug, Default)]
pub struct MappingRegistryBuilder {
    mappings: Vec<EntityMapping>,
}

impl MappingRegistryBuilder {
    /// Add an entity mapping.
    #[must_use]
    pub fn register(mut self, mapping: EntityMapping) -> Self {
        self.mappings.push(mapping);
        self
    }

    /// Validate every mapping and build the registry.
    #[tracing::instrument(level = "debug", skip(self), fields(entities = self.mappings.len()))]
    pub fn build(self) -> Result<MappingRegistry> {
        let mut by_name = HashMap::new();
        let mut by_table = HashMap::new();

        for (idx, mapping) in self.mappings.iter().enumerate() {
            validate_names(mapping)?;
            if by_name.insert(mapping.name, idx).is_some() {
                return Err(duplicate(mapping.name, format!("entity '{}' registered twice", mapping.name)));
            }
            if by_table.insert(mapping.table, idx).is_some() {
                return Err(duplicate(
                    mapping.name,
                    format!("table '{}' is mapped by more than one entity", mapping.table),
                ));
            }
        }

        let mut entries: Vec<EntityEntry> = self
            .mappings
            .iter()
            .map(|mapping| EntityEntry {
                mapping: *mapping,
                key_columns: mapping.key_columns(),
                table_columns: Vec::new(),
            })
            .collect();

        for entry in &entries {
            validate_references(&entry.mapping, &entries, &by_name)?;
        }
        check_embedded_cycles(&entries, &by_name)?;

        // Table columns: key, attributes, then join columns placed on this table.
        for idx in 0..entries.len() {
            let mapping = entries[idx].mapping;
            let mut columns = entries[idx].key_columns.clone();
            for &column in mapping.columns {
                push_unique(&mut columns, column);
            }
            for assoc in mapping.associations {
                if assoc.join_side() == JoinSide::Source {
                    for column in assoc.local_columns() {
                        push_unique(&mut columns, column);
                    }
                }
            }
            entries[idx].table_columns = columns;
        }
        for idx in 0..entries.len() {
            let mapping = entries[idx].mapping;
            for assoc in mapping.associations {
                if assoc.join_side() == JoinSide::Target {
                    let target = by_name[assoc.target];
                    for column in assoc.local_columns() {
                        push_unique(&mut entries[target].table_columns, column);
                    }
                }
            }
        }

        for entry in &entries {
            validate_referenced_columns(&entry.mapping, &entries, &by_name)?;
        }

        let ownership = build_ownership(&entries, &by_name)?;
        let (dependencies, foreign_keys) = derive_links(&entries, &by_name);

        tracing::debug!(
            entities = entries.len(),
            columns = ownership.len(),
            dependencies = dependencies.len(),
            "Mapping registry built"
        );

        Ok(MappingRegistry {
            entries,
            by_name,
            by_table,
            ownership,
            dependencies,
            foreign_keys,
        })
    }
}

impl MappingRegistry {
    pub fn builder() -> MappingRegistryBuilder {
        MappingRegistryBuilder::default()
    }

    /// Look up a mapping by entity name.
    pub fn get(&self, entity: &str) -> Option<&EntityMapping> {
        self.by_name.get(entity).map(|&idx| &self.entries[idx].mapping)
    }

    /// Look up a mapping by entity name, failing with `UnknownEntity`.
    pub fn mapping(&self, entity: &str) -> Result<&EntityMapping> {
        self.get(entity).ok_or_else(|| unknown_entity(entity))
    }

    /// Look up the entity mapped onto `table`.
    pub fn entity_for_table(&self, table: &str) -> Option<&EntityMapping> {
        self.by_table.get(table).map(|&idx| &self.entries[idx].mapping)
    }

    /// All mappings in registration order.
    pub fn entities(&self) -> impl Iterator<Item = &EntityMapping> {
        self.entries.iter().map(|e| &e.mapping)
    }

    /// The associations declared on `entity`, with their join columns and flags.
    pub fn associations(&self, entity: &str) -> Result<&'static [AssociationInfo]> {
        self.mapping(entity).map(|m| m.associations)
    }

    /// Associations of other entities whose join columns live on `entity`'s table.
    pub fn incoming(&self, entity: &str) -> Vec<(&'static str, &'static AssociationInfo)> {
        self.entries
            .iter()
            .flat_map(|e| {
                e.mapping
                    .associations
                    .iter()
                    .filter(move |a| a.target == entity && a.join_side() == JoinSide::Target)
                    .map(move |a| (e.mapping.name, a))
            })
            .collect()
    }

    /// Flattened key columns of `entity`.
    pub fn key_columns(&self, entity: &str) -> Result<&[&'static str]> {
        self.entry(entity).map(|e| e.key_columns.as_slice())
    }

    /// Every column of `entity`'s table.
    pub fn table_columns(&self, entity: &str) -> Result<&[&'static str]> {
        self.entry(entity).map(|e| e.table_columns.as_slice())
    }

    /// Ownership record of one physical column.
    pub fn ownership(&self, table: &str, column: &str) -> Option<&ColumnOwnership> {
        self.ownership
            .iter()
            .find(|((t, c), _)| *t == table && *c == column)
            .map(|(_, o)| o)
    }

    /// The declared write owner of one physical column.
    pub fn owner_of(&self, table: &str, column: &str) -> Option<ColumnWriter> {
        self.ownership(table, column).and_then(|o| o.owner)
    }

    /// Ownership records of every column of `table`.
    pub fn column_ownership<'a>(&'a self, table: &'a str) -> impl Iterator<Item = &'a ColumnOwnership> + 'a {
        self.ownership.values().filter(move |o| o.table == table)
    }

    /// Insert-order dependencies between tables (self references excluded).
    pub fn table_dependencies(&self) -> &[TableDependency] {
        &self.dependencies
    }

    /// Foreign keys implied by every association (read-only ones included)
    /// and every embedded key.
    pub fn foreign_keys(&self) -> &[ForeignKeyInfo] {
        &self.foreign_keys
    }

    fn entry(&self, entity: &str) -> Result<&EntityEntry> {
        self.by_name
            .get(entity)
            .map(|&idx| &self.entries[idx])
            .ok_or_else(|| unknown_entity(entity))
    }
}

fn push_unique(columns: &mut Vec<&'static str>, column: &'static str) {
    if !columns.contains(&column) {
        columns.push(column);
    }
}

fn unknown_entity(entity: &str) -> Error {
    Error::mapping(
        MappingErrorKind::UnknownEntity,
        None,
        format!("entity '{entity}' is not registered"),
    )
}

fn duplicate(entity: &'static str, message: String) -> Error {
    Error::mapping(MappingErrorKind::Duplicate, Some(entity), message)
}

fn check_identifier(entity: &'static str, what: &str, name: &str) -> Result<()> {
    if is_valid_identifier(name) {
        Ok(())
    } else {
        Err(Error::mapping(
            MappingErrorKind::InvalidIdentifier,
            Some(entity),
            format!("invalid {what} name '{name}'"),
        ))
    }
}

fn validate_names(mapping: &EntityMapping) -> Result<()> {
    let entity = mapping.name;
    check_identifier(entity, "entity", entity)?;
    check_identifier(entity, "table", mapping.table)?;

    let key_columns = mapping.key_columns();
    let mut seen = HashSet::new();
    for column in &key_columns {
        check_identifier(entity, "column", column)?;
        if !seen.insert(*column) {
            return Err(duplicate(entity, format!("key column '{column}' declared twice")));
        }
    }
    if let KeyShape::Composite(components) = &mapping.key {
        if components.is_empty() {
            return Err(Error::mapping(
                MappingErrorKind::KeyShape,
                Some(entity),
                "composite key has no components",
            ));
        }
        let mut names = HashSet::new();
        for component in *components {
            check_identifier(entity, "key component", component.name)?;
            if !names.insert(component.name) {
                return Err(duplicate(
                    entity,
                    format!("key component '{}' declared twice", component.name),
                ));
            }
        }
    }
    for column in mapping.columns {
        check_identifier(entity, "column", column)?;
        if !seen.insert(*column) {
            return Err(duplicate(
                entity,
                format!("column '{column}' is declared twice (or is also a key column)"),
            ));
        }
    }

    let mut associations = HashSet::new();
    for assoc in mapping.associations {
        check_identifier(entity, "association", assoc.name)?;
        if !associations.insert(assoc.name) {
            return Err(duplicate(entity, format!("association '{}' declared twice", assoc.name)));
        }
        if assoc.join_columns.is_empty() {
            return Err(Error::mapping(
                MappingErrorKind::AssociationShape,
                Some(entity),
                format!("association '{}' has no join columns", assoc.name),
            ));
        }
        let mut bound = HashSet::new();
        for join in assoc.join_columns {
            check_identifier(entity, "column", join.name)?;
            check_identifier(entity, "column", join.referenced)?;
            if !bound.insert(join.name) {
                return Err(duplicate(
                    entity,
                    format!("association '{}' binds column '{}' twice", assoc.name, join.name),
                ));
            }
        }
    }
    Ok(())
}

fn validate_references(
    mapping: &EntityMapping,
    entries: &[EntityEntry],
    by_name: &HashMap<&'static str, usize>,
) -> Result<()> {
    for assoc in mapping.associations {
        if !by_name.contains_key(assoc.target) {
            return Err(Error::mapping(
                MappingErrorKind::UnknownEntity,
                Some(mapping.name),
                format!(
                    "association '{}' targets unregistered entity '{}'",
                    assoc.name, assoc.target
                ),
            ));
        }
    }
    if let KeyShape::Composite(components) = &mapping.key {
        for component in *components {
            if let KeyComponentKind::Embedded { entity, columns } = &component.kind {
                let Some(&target) = by_name.get(entity) else {
                    return Err(Error::mapping(
                        MappingErrorKind::UnknownEntity,
                        Some(mapping.name),
                        format!(
                            "key component '{}' embeds unregistered entity '{}'",
                            component.name, entity
                        ),
                    ));
                };
                let expected = entries[target].key_columns.len();
                if columns.len() != expected {
                    return Err(Error::mapping(
                        MappingErrorKind::KeyShape,
                        Some(mapping.name),
                        format!(
                            "key component '{}' maps {} columns, '{}' has {} key columns",
                            component.name,
                            columns.len(),
                            entity,
                            expected
                        ),
                    ));
                }
            }
        }
    }
    Ok(())
}

fn check_embedded_cycles(entries: &[EntityEntry], by_name: &HashMap<&'static str, usize>) -> Result<()> {
    fn embeds(entry: &EntityEntry) -> Vec<&'static str> {
        match &entry.mapping.key {
            KeyShape::Simple { .. } => Vec::new(),
            KeyShape::Composite(components) => components
                .iter()
                .filter_map(|c| match c.kind {
                    KeyComponentKind::Embedded { entity, .. } => Some(entity),
                    KeyComponentKind::Column(_) => None,
                })
                .collect(),
        }
    }

    for start in entries {
        let mut stack = embeds(start);
        let mut seen = HashSet::new();
        while let Some(name) = stack.pop() {
            if name == start.mapping.name {
                return Err(Error::mapping(
                    MappingErrorKind::KeyShape,
                    Some(start.mapping.name),
                    "key embeds itself through embedded key components",
                ));
            }
            if seen.insert(name) {
                stack.extend(embeds(&entries[by_name[name]]));
            }
        }
    }
    Ok(())
}

fn validate_referenced_columns(
    mapping: &EntityMapping,
    entries: &[EntityEntry],
    by_name: &HashMap<&'static str, usize>,
) -> Result<()> {
    for assoc in mapping.associations {
        let referenced_entity = match assoc.join_side() {
            JoinSide::Source => assoc.target,
            JoinSide::Target => mapping.name,
        };
        let referenced = &entries[by_name[referenced_entity]];
        for join in assoc.join_columns {
            if !referenced.table_columns.contains(&join.referenced) {
                return Err(Error::mapping(
                    MappingErrorKind::UnknownColumn,
                    Some(mapping.name),
                    format!(
                        "association '{}' references unknown column '{}.{}'",
                        assoc.name, referenced.mapping.table, join.referenced
                    ),
                ));
            }
        }
    }
    Ok(())
}

fn build_ownership(
    entries: &[EntityEntry],
    by_name: &HashMap<&'static str, usize>,
) -> Result<BTreeMap<(&'static str, &'static str), ColumnOwnership>> {
    let mut ownership: BTreeMap<(&'static str, &'static str), ColumnOwnership> = BTreeMap::new();

    for entry in entries {
        let mapping = &entry.mapping;
        for &column in &entry.table_columns {
            let owner = if entry.key_columns.contains(&column) {
                Some(ColumnWriter::Key {
                    entity: mapping.name,
                })
            } else if mapping.has_attribute(column) {
                Some(ColumnWriter::Attribute {
                    entity: mapping.name,
                })
            } else {
                None
            };
            ownership.insert(
                (mapping.table, column),
                ColumnOwnership {
                    table: mapping.table,
                    column,
                    owner,
                    shared_with: Vec::new(),
                    read_only: Vec::new(),
                },
            );
        }
    }

    for entry in entries {
        let mapping = &entry.mapping;
        for assoc in mapping.associations {
            let table = match assoc.join_side() {
                JoinSide::Source => mapping.table,
                JoinSide::Target => entries[by_name[assoc.target]].mapping.table,
            };
            let writer = ColumnWriter::Association {
                entity: mapping.name,
                association: assoc.name,
            };
            for join in assoc.join_columns {
                let Some(record) = ownership.get_mut(&(table, join.name)) else {
                    continue;
                };
                if join.is_read_only() {
                    record.read_only.push(writer);
                    continue;
                }
                match record.owner {
                    None => record.owner = Some(writer),
                    Some(ColumnWriter::Key { .. }) => record.shared_with.push(writer),
                    Some(first) => {
                        return Err(Error::OwnershipConflict(ColumnOwnershipConflictError {
                            table,
                            column: join.name,
                            first: first.to_string(),
                            second: writer.to_string(),
                        }));
                    }
                }
            }
        }
    }

    Ok(ownership)
}

fn derive_links(
    entries: &[EntityEntry],
    by_name: &HashMap<&'static str, usize>,
) -> (Vec<TableDependency>, Vec<ForeignKeyInfo>) {
    let mut dependencies = Vec::new();
    let mut foreign_keys: Vec<ForeignKeyInfo> = Vec::new();

    let mut add_dependency = |table: &'static str, references: &'static str| {
        let dep = TableDependency { table, references };
        if table != references && !dependencies.contains(&dep) {
            dependencies.push(dep);
        }
    };

    for entry in entries {
        let mapping = &entry.mapping;

        if let KeyShape::Composite(components) = &mapping.key {
            for component in *components {
                if let KeyComponentKind::Embedded { entity, columns } = &component.kind {
                    let target = &entries[by_name[entity]];
                    add_dependency(mapping.table, target.mapping.table);
                    let fk = ForeignKeyInfo {
                        table: mapping.table,
                        columns: columns.to_vec(),
                        referenced_table: target.mapping.table,
                        referenced_columns: target.key_columns.clone(),
                    };
                    if !foreign_keys.contains(&fk) {
                        foreign_keys.push(fk);
                    }
                }
            }
        }

        for assoc in mapping.associations {
            let target = &entries[by_name[assoc.target]].mapping;
            let (table, referenced_table) = match assoc.join_side() {
                JoinSide::Source => (mapping.table, target.table),
                JoinSide::Target => (target.table, mapping.table),
            };
            if !assoc.is_read_only() {
                add_dependency(table, referenced_table);
            }
            let fk = ForeignKeyInfo {
                table,
                columns: assoc.local_columns().collect(),
                referenced_table,
                referenced_columns: assoc.referenced_columns().collect(),
            };
            if !foreign_keys.contains(&fk) {
                foreign_keys.push(fk);
            }
        }
    }

    (dependencies, foreign_keys)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::association::{AssociationKind, CascadeType, JoinColumn};
    use crate::mapping::KeyComponentInfo;

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

    const PARENT: EntityMapping = EntityMapping::new("parent", "parent", KeyShape::simple("id"))
        .associations(PARENT_ASSOCIATIONS);
    const CHILD: EntityMapping = EntityMapping::new("child", "child", KeyShape::composite(CHILD_KEY));

    fn registry() -> MappingRegistry {
        MappingRegistry::builder()
            .register(PARENT)
            .register(CHILD)
            .build()
            .unwrap()
    }

    #[test]
    fn test_table_columns_include_join_columns() {
        let registry = registry();
        assert_eq!(registry.table_columns("parent").unwrap(), &["id", "child_id"]);
        assert_eq!(registry.table_columns("child").unwrap(), &["id", "parent_id"]);
        assert_eq!(registry.key_columns("child").unwrap(), &["id", "parent_id"]);
    }

    #[test]
    fn test_key_owns_column_shared_with_writable_association() {
        let registry = registry();
        let record = registry.ownership("child", "parent_id").unwrap();
        assert_eq!(record.owner, Some(ColumnWriter::Key { entity: "child" }));
        assert_eq!(
            record.shared_with,
            vec![ColumnWriter::Association {
                entity: "parent",
                association: "children"
            }]
        );
    }

    #[test]
    fn test_read_only_binding_has_no_owner() {
        let registry = registry();
        let record = registry.ownership("parent", "child_id").unwrap();
        assert_eq!(record.owner, None);
        assert_eq!(record.read_only.len(), 1);
        assert_eq!(
            registry.owner_of("parent", "id"),
            Some(ColumnWriter::Key { entity: "parent" })
        );
    }

    #[test]
    fn test_two_writable_associations_conflict() {
        const CONFLICTING: &[AssociationInfo] = &[
            AssociationInfo::new("children", "child", AssociationKind::OneToMany)
                .join_columns(&[JoinColumn::new("owner_id", "id")]),
            AssociationInfo::new("favorites", "child", AssociationKind::OneToMany)
                .join_columns(&[JoinColumn::new("owner_id", "id")]),
        ];
        let result = MappingRegistry::builder()
            .register(
                EntityMapping::new("parent", "parent", KeyShape::simple("id"))
                    .associations(CONFLICTING),
            )
            .register(CHILD)
            .build();
        match result {
            Err(Error::OwnershipConflict(e)) => {
                assert_eq!(e.table, "child");
                assert_eq!(e.column, "owner_id");
            }
            other => panic!("expected ownership conflict, got {other:?}"),
        }
    }

    #[test]
    fn test_association_over_attribute_conflicts() {
        const ASSOC: &[AssociationInfo] = &[AssociationInfo::new(
            "owner",
            "parent",
            AssociationKind::ManyToOne,
        )
        .join_columns(&[JoinColumn::new("owner_id", "id")])];
        let result = MappingRegistry::builder()
            .register(EntityMapping::new("parent", "parent", KeyShape::simple("id")))
            .register(
                EntityMapping::new("pet", "pet", KeyShape::simple("id"))
                    .columns(&["owner_id"])
                    .associations(ASSOC),
            )
            .build();
        assert!(matches!(result, Err(Error::OwnershipConflict(_))));
    }

    #[test]
    fn test_unknown_target_is_rejected() {
        let result = MappingRegistry::builder().register(PARENT).build();
        assert!(matches!(
            result,
            Err(Error::Mapping(ref e)) if e.kind == MappingErrorKind::UnknownEntity
        ));
    }

    #[test]
    fn test_embedded_arity_is_checked() {
        const BAD_KEY: &[KeyComponentInfo] = &[
            KeyComponentInfo::column("id", "id"),
            KeyComponentInfo::embedded("parent", "parent", &["parent_a", "parent_b"]),
        ];
        let result = MappingRegistry::builder()
            .register(EntityMapping::new("parent", "parent", KeyShape::simple("id")))
            .register(EntityMapping::new("child", "child", KeyShape::composite(BAD_KEY)))
            .build();
        assert!(matches!(
            result,
            Err(Error::Mapping(ref e)) if e.kind == MappingErrorKind::KeyShape
        ));
    }

    #[test]
    fn test_invalid_identifier_is_rejected() {
        let result = MappingRegistry::builder()
            .register(EntityMapping::new("parent", "parent table", KeyShape::simple("id")))
            .build();
        assert!(matches!(
            result,
            Err(Error::Mapping(ref e)) if e.kind == MappingErrorKind::InvalidIdentifier
        ));
    }

    #[test]
    fn test_duplicates_are_rejected() {
        let result = MappingRegistry::builder()
            .register(EntityMapping::new("parent", "parent", KeyShape::simple("id")))
            .register(EntityMapping::new("parent", "other", KeyShape::simple("id")))
            .build();
        assert!(matches!(
            result,
            Err(Error::Mapping(ref e)) if e.kind == MappingErrorKind::Duplicate
        ));

        let result = MappingRegistry::builder()
            .register(EntityMapping::new("parent", "parent", KeyShape::simple("id")).columns(&["id"]))
            .build();
        assert!(matches!(
            result,
            Err(Error::Mapping(ref e)) if e.kind == MappingErrorKind::Duplicate
        ));
    }

    #[test]
    fn test_unknown_referenced_column_is_rejected() {
        const ASSOC: &[AssociationInfo] = &[AssociationInfo::new(
            "children",
            "child",
            AssociationKind::OneToMany,
        )
        .join_columns(&[JoinColumn::new("parent_id", "code")])];
        let result = MappingRegistry::builder()
            .register(EntityMapping::new("parent", "parent", KeyShape::simple("id")).associations(ASSOC))
            .register(CHILD)
            .build();
        assert!(matches!(
            result,
            Err(Error::Mapping(ref e)) if e.kind == MappingErrorKind::UnknownColumn
        ));
    }

    #[test]
    fn test_dependencies_and_foreign_keys() {
        let registry = registry();
        assert_eq!(
            registry.table_dependencies(),
            &[TableDependency {
                table: "child",
                references: "parent"
            }]
        );
        // children and the embedded key imply the same constraint; the
        // read-only one-to-one adds the reverse reference.
        let fks = registry.foreign_keys();
        assert_eq!(fks.len(), 2);
        assert!(fks.iter().any(|fk| fk.table == "child"
            && fk.columns == vec!["parent_id"]
            && fk.referenced_table == "parent"));
        assert!(fks.iter().any(|fk| fk.table == "parent"
            && fk.columns == vec!["id", "child_id"]
            && fk.referenced_columns == vec!["parent_id", "id"]));
    }

    #[test]
    fn test_incoming_associations() {
        let registry = registry();
        let incoming = registry.incoming("child");
        assert_eq!(incoming.len(), 1);
        assert_eq!(incoming[0].0, "parent");
        assert_eq!(incoming[0].1.name, "children");
        assert!(registry.incoming("parent").is_empty());
    }
}
