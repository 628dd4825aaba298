//! The persistence context: managed entity state keyed by identity.
//!
//! Every managed entity keeps three row images:
//!
//! - `row`: the current state, updated by `persist`
//! - `flushed`: what the datastore holds inside the open transaction
//! - `committed`: what the datastore held at the last commit (or load)
//!
//! Pending work is never stored separately; it is derived by comparing these
//! images (see [`ManagedEntity::pending`]). Association membership is kept the
//! same way, so orphan detection compares `refs` against `flushed_refs`.

use crate::cascade::{CascadePlan, PlannedOp};
use crate::write::RowImage;
use relmodel_core::{
    AssociationKind, ColumnWriter, Entity, EntityKey, Error, JoinSide, MappingRegistry, Related,
    Result, Value,
};
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};

/// Target keys held by one association slot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AssociationRef {
    One(Option<EntityKey>),
    /// Explicit collection members, in insertion order.
    Many(Vec<EntityKey>),
}

impl AssociationRef {
    pub fn keys(&self) -> impl Iterator<Item = &EntityKey> {
        let (one, many) = match self {
            AssociationRef::One(key) => (key.as_ref(), [].as_slice()),
            AssociationRef::Many(keys) => (None, keys.as_slice()),
        };
        one.into_iter().chain(many)
    }

    pub fn contains(&self, key: &EntityKey) -> bool {
        self.keys().any(|k| k == key)
    }
}

/// Lifecycle state of an entity with respect to one session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum EntityState {
    /// Not known to the session.
    Transient,
    /// Tracked; its row is inserted (or will be on flush).
    Managed,
    /// Scheduled for deletion, or deleted by a committed transaction.
    Removed,
    /// Evicted from the session by `detach` or `clear`.
    Detached,
}

/// The pending datastore work for one entity.
#[derive(Debug, Clone, PartialEq)]
pub enum Pending<'a> {
    Insert,
    Update(Vec<&'a crate::write::RowColumn>),
    Delete,
}

/// State the context tracks for one entity.
#[derive(Debug, Clone)]
pub struct ManagedEntity {
    pub name: &'static str,
    pub key: EntityKey,
    pub state: EntityState,
    pub row: RowImage,
    pub refs: BTreeMap<&'static str, AssociationRef>,
    pub flushed: Option<RowImage>,
    pub flushed_refs: BTreeMap<&'static str, AssociationRef>,
    pub committed: Option<RowImage>,
    pub committed_refs: BTreeMap<&'static str, AssociationRef>,
    /// Order in which the entity became managed.
    pub seq: u64,
    /// Order in which the entity was scheduled for removal.
    pub remove_seq: Option<u64>,
}

impl ManagedEntity {
    /// The work a flush has to do for this entity, if any.
    pub fn pending(&self) -> Option<Pending<'_>> {
        match (self.state, &self.flushed) {
            (EntityState::Managed, None) => Some(Pending::Insert),
            (EntityState::Managed, Some(flushed)) => {
                let changed = self.row.changed_since(flushed);
                (!changed.is_empty()).then_some(Pending::Update(changed))
            }
            (EntityState::Removed, Some(_)) => Some(Pending::Delete),
            _ => None,
        }
    }
}

type Identity = (&'static str, EntityKey);

/// Managed entities of one session.
#[derive(Debug, Default)]
pub struct PersistenceContext {
    entities: HashMap<Identity, ManagedEntity>,
    /// Last known state of entities that left the context.
    tombstones: HashMap<Identity, EntityState>,
    next_seq: u64,
}

impl PersistenceContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, entity: &'static str, key: &EntityKey) -> Option<&ManagedEntity> {
        self.entities.get(&(entity, key.clone()))
    }

    pub fn contains(&self, entity: &'static str, key: &EntityKey) -> bool {
        self.entities.contains_key(&(entity, key.clone()))
    }

    pub fn state_of(&self, entity: &'static str, key: &EntityKey) -> EntityState {
        let identity = (entity, key.clone());
        if let Some(managed) = self.entities.get(&identity) {
            return managed.state;
        }
        self.tombstones
            .get(&identity)
            .copied()
            .unwrap_or(EntityState::Transient)
    }

    pub fn len(&self) -> usize {
        self.entities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entities.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &ManagedEntity> {
        self.entities.values()
    }

    fn next_seq(&mut self) -> u64 {
        self.next_seq += 1;
        self.next_seq
    }

    /// Apply a persist plan: new entities become pending inserts, managed ones
    /// take the planned values, removed ones are scheduled back in.
    pub fn apply_persist(&mut self, plan: &CascadePlan) {
        for step in &plan.steps {
            let identity = (step.entity, step.key.clone());
            match self.entities.get_mut(&identity) {
                Some(existing) => {
                    if existing.state == EntityState::Removed {
                        tracing::debug!(entity = step.entity, key = %step.key, "Removed entity persisted again");
                        existing.state = EntityState::Managed;
                        existing.remove_seq = None;
                    }
                    existing.row.overlay(&step.row);
                    for (name, value) in &step.refs {
                        existing.refs.insert(name, value.clone());
                    }
                }
                None => {
                    self.tombstones.remove(&identity);
                    let seq = self.next_seq();
                    self.entities.insert(identity, new_managed(step, seq));
                }
            }
        }
    }

    /// Apply a remove plan. Entities that never reached the datastore are
    /// dropped outright; flushed ones are scheduled for deletion.
    pub fn apply_remove(&mut self, plan: &CascadePlan) {
        for step in &plan.steps {
            let identity = (step.entity, step.key.clone());
            let Some(existing) = self.entities.get_mut(&identity) else {
                tracing::debug!(entity = step.entity, key = %step.key, "Remove cascade reached an unmanaged entity");
                continue;
            };
            if existing.state != EntityState::Managed {
                continue;
            }
            if existing.flushed.is_none() && existing.committed.is_none() {
                tracing::debug!(entity = step.entity, key = %step.key, "Pending insert cancelled");
                self.entities.remove(&identity);
            } else {
                let seq = self.next_seq();
                if let Some(existing) = self.entities.get_mut(&identity) {
                    existing.state = EntityState::Removed;
                    existing.remove_seq = Some(seq);
                }
            }
            self.forget_references(step.entity, &step.key);
        }
    }

    /// Drop every managed reference to a removed entity.
    fn forget_references(&mut self, entity: &'static str, key: &EntityKey) {
        for owner in self.entities.values_mut() {
            if owner.state != EntityState::Managed {
                continue;
            }
            for value in owner.refs.values_mut() {
                match value {
                    AssociationRef::One(target) if target.as_ref() == Some(key) => *target = None,
                    AssociationRef::Many(keys) => keys.retain(|k| k != key),
                    AssociationRef::One(_) => {}
                }
            }
        }
        tracing::trace!(entity = entity, key = %key, "References forgotten");
    }

    /// Track an entity read from the datastore.
    pub fn register_loaded(
        &mut self,
        entity: &'static str,
        key: EntityKey,
        row: RowImage,
        refs: BTreeMap<&'static str, AssociationRef>,
    ) {
        let identity = (entity, key.clone());
        if self.entities.contains_key(&identity) {
            return;
        }
        self.tombstones.remove(&identity);
        let seq = self.next_seq();
        self.entities.insert(
            identity,
            ManagedEntity {
                name: entity,
                key,
                state: EntityState::Managed,
                flushed: Some(row.clone()),
                committed: Some(row.clone()),
                row,
                flushed_refs: refs.clone(),
                committed_refs: refs.clone(),
                refs,
                seq,
                remove_seq: None,
            },
        );
    }

    /// Is `key` a member or target of any managed association other than
    /// `except`?
    fn is_referenced(
        &self,
        registry: &MappingRegistry,
        entity: &'static str,
        key: &EntityKey,
        except: (&Identity, &str),
    ) -> bool {
        self.entities.values().any(|owner| {
            owner.state == EntityState::Managed
                && owner.refs.iter().any(|(name, value)| {
                    let skip = owner.name == except.0.0 && owner.key == except.0.1 && *name == except.1;
                    let targets_entity = registry
                        .get(owner.name)
                        .and_then(|m| m.association(name))
                        .is_some_and(|a| a.target == entity);
                    !skip && targets_entity && value.contains(key)
                })
        })
    }

    /// Members that left an orphan-removing collection since the last flush
    /// and are no longer referenced by any managed association.
    pub fn orphans(&self, registry: &MappingRegistry) -> Vec<(&'static str, EntityKey)> {
        let mut owners: Vec<&ManagedEntity> = self
            .entities
            .values()
            .filter(|e| e.state == EntityState::Managed)
            .collect();
        owners.sort_by_key(|e| e.seq);

        let mut found = Vec::new();
        for owner in owners {
            let Some(mapping) = registry.get(owner.name) else {
                continue;
            };
            let identity = (owner.name, owner.key.clone());
            for assoc in mapping.associations {
                if !(assoc.orphan_removal && assoc.kind.is_collection()) {
                    continue;
                }
                let Some(AssociationRef::Many(previous)) = owner.flushed_refs.get(assoc.name) else {
                    continue;
                };
                let current = owner.refs.get(assoc.name);
                for key in previous {
                    if current.is_some_and(|c| c.contains(key)) {
                        continue;
                    }
                    let target_managed = self
                        .entities
                        .get(&(assoc.target, key.clone()))
                        .is_some_and(|t| t.state == EntityState::Managed);
                    if !target_managed || self.is_referenced(registry, assoc.target, key, (&identity, assoc.name)) {
                        continue;
                    }
                    let orphan = (assoc.target, key.clone());
                    if !found.contains(&orphan) {
                        tracing::debug!(
                            owner = owner.name,
                            association = assoc.name,
                            key = %key,
                            "Orphan detected"
                        );
                        found.push(orphan);
                    }
                }
            }
        }
        found
    }

    /// Bring join columns written by collections in line with membership.
    ///
    /// Members of a writable collection take the owner's referenced values.
    /// Members that left a collection without orphan removal have their
    /// updatable join columns cleared, unless they joined another owner.
    /// Single-valued slots emptied by a removal clear their own join columns.
    /// An owner pending deletion still clears the members that left it.
    pub fn sync_links(&mut self, registry: &MappingRegistry) {
        let mut writes: Vec<(Identity, &'static str, Value)> = Vec::new();
        for owner in self
            .entities
            .values()
            .filter(|e| matches!(e.state, EntityState::Managed | EntityState::Removed))
        {
            let Some(mapping) = registry.get(owner.name) else {
                continue;
            };
            let removed = owner.state == EntityState::Removed;
            for assoc in mapping.associations {
                if assoc.join_side() == JoinSide::Source {
                    if !removed && owner.refs.get(assoc.name) == Some(&AssociationRef::One(None)) {
                        for join in assoc.join_columns.iter().filter(|j| j.updatable) {
                            if matches!(
                                registry.owner_of(mapping.table, join.name),
                                Some(ColumnWriter::Association { .. })
                            ) && owner.row.get(join.name).is_some_and(|v| !v.is_null())
                            {
                                writes.push(((owner.name, owner.key.clone()), join.name, Value::Null));
                            }
                        }
                    }
                    continue;
                }
                if assoc.kind != AssociationKind::OneToMany {
                    continue;
                }
                let current = owner.refs.get(assoc.name);
                let Some(target_table) = registry.get(assoc.target).map(|m| m.table) else {
                    continue;
                };
                for join in assoc.join_columns.iter().filter(|j| !j.is_read_only()) {
                    if matches!(
                        registry.owner_of(target_table, join.name),
                        Some(ColumnWriter::Key { .. })
                    ) {
                        continue;
                    }
                    if let Some(current) = current.filter(|_| !removed) {
                        let value = owner.row.get(join.referenced).cloned().unwrap_or(Value::Null);
                        for key in current.keys() {
                            writes.push(((assoc.target, key.clone()), join.name, value.clone()));
                        }
                    }
                    if assoc.orphan_removal || !join.updatable {
                        continue;
                    }
                    if let Some(AssociationRef::Many(previous)) = owner.flushed_refs.get(assoc.name) {
                        for key in previous {
                            if current.is_some_and(|c| c.contains(key)) {
                                continue;
                            }
                            writes.push(((assoc.target, key.clone()), join.name, Value::Null));
                        }
                    }
                }
            }
        }

        // Membership wins over a cleared link.
        writes.sort_by_key(|(_, _, value)| !value.is_null());
        for (identity, column, value) in writes {
            if let Some(target) = self.entities.get_mut(&identity) {
                if target.state != EntityState::Managed {
                    continue;
                }
                if target.row.set_value(column, value.clone()) {
                    continue;
                }
                let (insertable, updatable) =
                    crate::write::column_flags(registry, target.row.table(), column);
                target.row.set(crate::write::RowColumn {
                    name: column,
                    value,
                    insertable,
                    updatable,
                });
            }
        }
    }

    /// Rebuild an owned entity graph from managed state.
    ///
    /// Targets that are not managed, and ancestors of the entity being built,
    /// come back as key-only references.
    pub fn materialize(&self, registry: &MappingRegistry, entity: &'static str, key: &EntityKey) -> Result<Entity> {
        let mut path = Vec::new();
        self.materialize_inner(registry, entity, key, &mut path)
    }

    fn materialize_inner(
        &self,
        registry: &MappingRegistry,
        entity: &'static str,
        key: &EntityKey,
        path: &mut Vec<Identity>,
    ) -> Result<Entity> {
        let identity = (entity, key.clone());
        let Some(managed) = self.entities.get(&identity) else {
            return Ok(Entity::reference(entity, key.clone()));
        };
        if path.contains(&identity) {
            return Ok(Entity::reference(entity, key.clone()));
        }
        let mapping = registry.mapping(entity)?;
        let mut out = Entity::reference(mapping.name, key.clone());
        for &column in mapping.columns {
            if let Some(value) = managed.row.get(column) {
                out.set_attr(column, value.clone());
            }
        }

        path.push(identity);
        for (&name, value) in &managed.refs {
            let Some(assoc) = mapping.association(name) else {
                continue;
            };
            let related = match value {
                AssociationRef::One(None) => Related::One(None),
                AssociationRef::One(Some(target)) => {
                    if self.state_of(assoc.target, target) == EntityState::Removed {
                        Related::One(None)
                    } else {
                        Related::One(Some(Box::new(self.materialize_inner(
                            registry,
                            assoc.target,
                            target,
                            path,
                        )?)))
                    }
                }
                AssociationRef::Many(targets) => {
                    let mut members = Vec::with_capacity(targets.len());
                    for target in targets {
                        if self.state_of(assoc.target, target) == EntityState::Removed {
                            continue;
                        }
                        members.push(self.materialize_inner(registry, assoc.target, target, path)?);
                    }
                    Related::Many(members.into_iter().collect())
                }
            };
            out.set_related(assoc.name, related);
        }
        path.pop();
        Ok(out)
    }

    /// Entities with pending work, in the order they entered the context
    /// (removals in the order they were scheduled).
    pub fn pending(&self) -> Vec<(&ManagedEntity, Pending<'_>)> {
        let mut out: Vec<(&ManagedEntity, Pending<'_>)> = self
            .entities
            .values()
            .filter_map(|e| e.pending().map(|p| (e, p)))
            .collect();
        out.sort_by_key(|(e, _)| (e.remove_seq.unwrap_or(0), e.seq));
        out
    }

    /// Record that every pending operation reached the datastore.
    pub fn mark_flushed(&mut self) {
        for entity in self.entities.values_mut() {
            match entity.state {
                EntityState::Managed => {
                    entity.flushed = Some(entity.row.clone());
                    entity.flushed_refs = entity.refs.clone();
                }
                EntityState::Removed => {
                    entity.flushed = None;
                    entity.flushed_refs.clear();
                }
                EntityState::Transient | EntityState::Detached => {}
            }
        }
    }

    /// Make flushed state durable and evict removed entities.
    pub fn mark_committed(&mut self) {
        let mut evicted = Vec::new();
        for (identity, entity) in &mut self.entities {
            match entity.state {
                EntityState::Managed => {
                    entity.committed = entity.flushed.clone();
                    entity.committed_refs = entity.flushed_refs.clone();
                }
                EntityState::Removed if entity.flushed.is_none() => evicted.push(identity.clone()),
                _ => {}
            }
        }
        for identity in evicted {
            self.entities.remove(&identity);
            self.tombstones.insert(identity, EntityState::Removed);
        }
    }

    /// Restore the state of the last commit; entities first seen in this
    /// transaction are forgotten.
    pub fn rollback(&mut self) {
        self.entities.retain(|_, entity| {
            let Some(committed) = entity.committed.clone() else {
                return false;
            };
            entity.state = EntityState::Managed;
            entity.row = committed.clone();
            entity.flushed = Some(committed);
            entity.refs = entity.committed_refs.clone();
            entity.flushed_refs = entity.committed_refs.clone();
            entity.remove_seq = None;
            true
        });
    }

    /// Evict one entity. Its pending work is dropped.
    pub fn detach(&mut self, entity: &'static str, key: &EntityKey) -> Result<()> {
        let identity = (entity, key.clone());
        match self.entities.remove(&identity) {
            Some(_) => {
                self.tombstones.insert(identity, EntityState::Detached);
                Ok(())
            }
            None => Err(Error::NotFound(relmodel_core::NotFoundError {
                entity,
                key: key.clone(),
            })),
        }
    }

    /// Evict everything.
    pub fn clear(&mut self) {
        for (identity, _) in self.entities.drain() {
            self.tombstones.insert(identity, EntityState::Detached);
        }
    }
}

fn new_managed(step: &PlannedOp, seq: u64) -> ManagedEntity {
    ManagedEntity {
        name: step.entity,
        key: step.key.clone(),
        state: EntityState::Managed,
        row: step.row.clone(),
        refs: step.refs.clone(),
        flushed: None,
        flushed_refs: BTreeMap::new(),
        committed: None,
        committed_refs: BTreeMap::new(),
        seq,
        remove_seq: None,
    }
}
