//! Cascade planning.
//!
//! [`CascadePlanner::plan`] expands a root entity into the ordered list of
//! entities an operation touches. Persist walks parent-before-child so every
//! dependent key can take its owner's resolved key; remove walks
//! child-before-parent so referencing rows are deleted first.
//!
//! Planning never touches the datastore or the persistence context. It either
//! produces a complete plan or fails, in which case nothing is scheduled.

use crate::context::AssociationRef;
use crate::write::{IncomingColumn, RowImage, RowWriter};
use relmodel_core::{
    AssociationInfo, Entity, EntityKey, Error, IdentityConflictError, KeyOwner, KeyResolver,
    MappingError, MappingErrorKind, MappingRegistry, Related, Result,
};
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};

/// Default bound on cascade depth.
pub const DEFAULT_MAX_DEPTH: usize = 64;

/// The operation a cascade propagates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum Operation {
    Persist,
    Remove,
}

impl Operation {
    /// Does `association` propagate this operation?
    pub fn cascades(self, association: &AssociationInfo) -> bool {
        match self {
            Operation::Persist => association.cascade.persist,
            Operation::Remove => {
                association.cascade.remove
                    || (association.orphan_removal && association.kind.is_collection())
            }
        }
    }
}

/// One entity touched by a cascade.
#[derive(Debug, Clone, PartialEq)]
pub struct PlannedOp {
    pub entity: &'static str,
    pub key: EntityKey,
    pub operation: Operation,
    /// Column values to write. Remove steps carry only key columns.
    pub row: RowImage,
    /// Association slots present on the entity, as target keys.
    pub refs: BTreeMap<&'static str, AssociationRef>,
    /// Distance from the root.
    pub depth: usize,
}

/// An ordered cascade expansion of one root.
#[derive(Debug, Clone, PartialEq)]
pub struct CascadePlan {
    pub operation: Operation,
    pub steps: Vec<PlannedOp>,
}

impl CascadePlan {
    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    /// The root step: first for persist, last for remove.
    pub fn root(&self) -> Option<&PlannedOp> {
        match self.operation {
            Operation::Persist => self.steps.first(),
            Operation::Remove => self.steps.last(),
        }
    }

    pub fn position(&self, entity: &str, key: &EntityKey) -> Option<usize> {
        self.steps
            .iter()
            .position(|s| s.entity == entity && s.key == *key)
    }
}

#[derive(Default)]
struct Walk {
    steps: Vec<PlannedOp>,
    visited: HashMap<(&'static str, EntityKey), usize>,
}

/// Expands entity graphs into cascade plans.
#[derive(Debug, Clone, Copy)]
pub struct CascadePlanner<'r> {
    registry: &'r MappingRegistry,
    max_depth: usize,
}

impl<'r> CascadePlanner<'r> {
    pub fn new(registry: &'r MappingRegistry) -> Self {
        Self {
            registry,
            max_depth: DEFAULT_MAX_DEPTH,
        }
    }

    #[must_use]
    pub fn with_max_depth(mut self, max_depth: usize) -> Self {
        self.max_depth = max_depth;
        self
    }

    /// Plan `operation` starting at `root`.
    #[tracing::instrument(level = "debug", skip(self, root), fields(root = root.name()))]
    pub fn plan(&self, root: &Entity, operation: Operation) -> Result<CascadePlan> {
        let mut walk = Walk::default();
        match operation {
            Operation::Persist => self.visit_persist(root, None, &[], 0, &mut walk)?,
            Operation::Remove => self.visit_remove(root, None, 0, &mut walk)?,
        }
        tracing::debug!(
            operation = ?operation,
            steps = walk.steps.len(),
            "Cascade planned"
        );
        Ok(CascadePlan {
            operation,
            steps: walk.steps,
        })
    }

    fn visit_persist(
        &self,
        entity: &Entity,
        owner: Option<KeyOwner<'_>>,
        incoming: &[IncomingColumn],
        depth: usize,
        walk: &mut Walk,
    ) -> Result<()> {
        self.check_depth(entity, depth)?;
        let mapping = self.registry.mapping(entity.name())?;
        let key = KeyResolver::new(self.registry).resolve_with_owner(entity, owner)?;
        let writer = RowWriter::new(self.registry);
        let row = writer.build(entity, &key, incoming)?;
        let refs = self.collect_refs(entity, &key)?;

        let identity = (mapping.name, key.clone());
        if let Some(&idx) = walk.visited.get(&identity) {
            let step = &mut walk.steps[idx];
            if step.row.merge(&row).is_err() || !merge_refs(&mut step.refs, refs) {
                return Err(Error::IdentityConflict(IdentityConflictError {
                    entity: mapping.name,
                    key,
                }));
            }
            tracing::trace!(entity = mapping.name, key = %key, "Already visited; merged");
        } else {
            walk.visited.insert(identity, walk.steps.len());
            walk.steps.push(PlannedOp {
                entity: mapping.name,
                key: key.clone(),
                operation: Operation::Persist,
                row: row.clone(),
                refs,
                depth,
            });
        }

        let this = KeyOwner {
            entity: mapping.name,
            key: &key,
        };
        for assoc in mapping.associations {
            if !Operation::Persist.cascades(assoc) {
                continue;
            }
            match entity.related(assoc.name) {
                None | Some(Related::One(None)) => {}
                Some(Related::One(Some(target))) => {
                    self.visit_persist(target, Some(this), &[], depth + 1, walk)?;
                }
                Some(Related::Many(members)) => {
                    let incoming = writer.incoming_columns(mapping.name, assoc.name, &row)?;
                    for member in members {
                        self.visit_persist(member, Some(this), &incoming, depth + 1, walk)?;
                    }
                }
            }
        }
        Ok(())
    }

    fn visit_remove(
        &self,
        entity: &Entity,
        owner: Option<KeyOwner<'_>>,
        depth: usize,
        walk: &mut Walk,
    ) -> Result<()> {
        self.check_depth(entity, depth)?;
        let mapping = self.registry.mapping(entity.name())?;
        let key = KeyResolver::new(self.registry).resolve_with_owner(entity, owner)?;
        let identity = (mapping.name, key.clone());
        if walk.visited.contains_key(&identity) {
            return Ok(());
        }
        // Marked on entry; the step itself is pushed after the children.
        walk.visited.insert(identity, usize::MAX);

        let this = KeyOwner {
            entity: mapping.name,
            key: &key,
        };
        for assoc in mapping.associations {
            if !Operation::Remove.cascades(assoc) {
                continue;
            }
            match entity.related(assoc.name) {
                None | Some(Related::One(None)) => {}
                Some(Related::One(Some(target))) => {
                    self.visit_remove(target, Some(this), depth + 1, walk)?;
                }
                Some(Related::Many(members)) => {
                    for member in members {
                        self.visit_remove(member, Some(this), depth + 1, walk)?;
                    }
                }
            }
        }

        let row = RowWriter::new(self.registry).key_row(mapping.name, &key)?;
        walk.visited.insert((mapping.name, key.clone()), walk.steps.len());
        walk.steps.push(PlannedOp {
            entity: mapping.name,
            key,
            operation: Operation::Remove,
            row,
            refs: BTreeMap::new(),
            depth,
        });
        Ok(())
    }

    /// Target keys of every association slot present on `entity`.
    pub(crate) fn collect_refs(
        &self,
        entity: &Entity,
        key: &EntityKey,
    ) -> Result<BTreeMap<&'static str, AssociationRef>> {
        let mapping = self.registry.mapping(entity.name())?;
        let resolver = KeyResolver::new(self.registry);
        let owner = KeyOwner {
            entity: mapping.name,
            key,
        };
        let mut refs = BTreeMap::new();
        for (name, related) in entity.associations() {
            let Some(assoc) = mapping.association(name) else {
                return Err(Error::Mapping(MappingError::new(
                    MappingErrorKind::UnknownAssociation,
                    mapping.name,
                    format!("no association named '{name}'"),
                )));
            };
            let value = match (assoc.kind.is_collection(), related) {
                (false, Related::One(None)) => AssociationRef::One(None),
                (false, Related::One(Some(target))) => {
                    AssociationRef::One(Some(resolver.resolve_with_owner(target, Some(owner))?))
                }
                (true, Related::Many(members)) => {
                    let mut keys: Vec<EntityKey> = Vec::with_capacity(members.len());
                    for member in members {
                        let member_key = resolver.resolve_with_owner(member, Some(owner))?;
                        if !keys.contains(&member_key) {
                            keys.push(member_key);
                        }
                    }
                    AssociationRef::Many(keys)
                }
                (is_collection, _) => {
                    return Err(Error::Mapping(MappingError::new(
                        MappingErrorKind::AssociationShape,
                        mapping.name,
                        format!(
                            "association '{}' is {}",
                            name,
                            if is_collection {
                                "collection-valued"
                            } else {
                                "single-valued"
                            }
                        ),
                    )));
                }
            };
            refs.insert(assoc.name, value);
        }
        Ok(refs)
    }

    fn check_depth(&self, entity: &Entity, depth: usize) -> Result<()> {
        if depth > self.max_depth {
            tracing::warn!(
                entity = entity.name(),
                max_depth = self.max_depth,
                "Cascade depth exceeded"
            );
            return Err(Error::Custom(format!(
                "cascade from '{}' exceeded the maximum depth of {}",
                entity.name(),
                self.max_depth
            )));
        }
        Ok(())
    }
}

/// Merge association slots seen on a second visit; false on disagreement.
fn merge_refs(
    existing: &mut BTreeMap<&'static str, AssociationRef>,
    incoming: BTreeMap<&'static str, AssociationRef>,
) -> bool {
    for (name, value) in incoming {
        match existing.get(name) {
            Some(current) if *current != value => return false,
            Some(_) => {}
            None => {
                existing.insert(name, value);
            }
        }
    }
    true
}
