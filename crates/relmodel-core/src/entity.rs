//! Entity graph values.
//!
//! An [`Entity`] is an owned, dynamically typed application object: an entity
//! type name, a key draft, attribute values and association slots. Graphs are
//! built as owned trees and handed to the session; the session reads managed
//! state back as fresh `Entity` values.

use crate::key::{EntityKey, KeyDraft};
use crate::value::Value;
use std::collections::BTreeMap;

/// An application object of one mapped entity type.
#[derive(Debug, Clone, PartialEq)]
pub struct Entity {
    name: &'static str,
    key: KeyDraft,
    attributes: BTreeMap<&'static str, Value>,
    associations: BTreeMap<&'static str, Related>,
}

/// The value held by one association slot.
#[derive(Debug, Clone, PartialEq)]
pub enum Related {
    /// Single-valued association (`None` when unset).
    One(Option<Box<Entity>>),
    /// Collection-valued association.
    Many(Collection),
}

/// Members of a collection-valued association.
///
/// Membership is established only by explicit insertion; the position of a
/// member carries no meaning beyond iteration order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Collection {
    members: Vec<Entity>,
}

impl Entity {
    /// A transient entity with an unassigned key.
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            key: KeyDraft::Unassigned,
            attributes: BTreeMap::new(),
            associations: BTreeMap::new(),
        }
    }

    /// An entity carrying only a complete key.
    pub fn reference(name: &'static str, key: EntityKey) -> Self {
        Self::new(name).with_key(key)
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn key(&self) -> &KeyDraft {
        &self.key
    }

    pub fn key_mut(&mut self) -> &mut KeyDraft {
        &mut self.key
    }

    #[must_use]
    pub fn with_key(mut self, key: impl Into<KeyDraft>) -> Self {
        self.key = key.into();
        self
    }

    pub fn set_key(&mut self, key: impl Into<KeyDraft>) {
        self.key = key.into();
    }

    #[must_use]
    pub fn with_attr(mut self, column: &'static str, value: impl Into<Value>) -> Self {
        self.set_attr(column, value);
        self
    }

    pub fn set_attr(&mut self, column: &'static str, value: impl Into<Value>) {
        self.attributes.insert(column, value.into());
    }

    pub fn attr(&self, column: &str) -> Option<&Value> {
        self.attributes.get(column)
    }

    pub fn attributes(&self) -> impl Iterator<Item = (&'static str, &Value)> {
        self.attributes.iter().map(|(k, v)| (*k, v))
    }

    /// Set a single-valued association.
    #[must_use]
    pub fn with_one(mut self, association: &'static str, target: Option<Entity>) -> Self {
        self.set_one(association, target);
        self
    }

    pub fn set_one(&mut self, association: &'static str, target: Option<Entity>) {
        self.associations
            .insert(association, Related::One(target.map(Box::new)));
    }

    /// Target of a single-valued association, if set.
    pub fn one(&self, association: &str) -> Option<&Entity> {
        match self.associations.get(association) {
            Some(Related::One(Some(target))) => Some(target),
            _ => None,
        }
    }

    /// Explicitly add `member` to a collection-valued association.
    #[must_use]
    pub fn with_member(mut self, association: &'static str, member: Entity) -> Self {
        self.add_to(association, member);
        self
    }

    /// Explicitly add `member` to a collection-valued association.
    pub fn add_to(&mut self, association: &'static str, member: Entity) {
        self.collection_mut(association).push(member);
    }

    pub fn collection(&self, association: &str) -> Option<&Collection> {
        match self.associations.get(association) {
            Some(Related::Many(collection)) => Some(collection),
            _ => None,
        }
    }

    /// Mutable access to a collection, creating it empty when absent.
    ///
    /// A slot previously holding a single-valued association is replaced.
    pub fn collection_mut(&mut self, association: &'static str) -> &mut Collection {
        let slot = self
            .associations
            .entry(association)
            .or_insert_with(|| Related::Many(Collection::default()));
        if !matches!(slot, Related::Many(_)) {
            *slot = Related::Many(Collection::default());
        }
        match slot {
            Related::Many(collection) => collection,
            Related::One(_) => unreachable!("slot was just set to a collection"),
        }
    }

    pub fn related(&self, association: &str) -> Option<&Related> {
        self.associations.get(association)
    }

    pub fn set_related(&mut self, association: &'static str, related: Related) {
        self.associations.insert(association, related);
    }

    /// Association slots in name order.
    pub fn associations(&self) -> impl Iterator<Item = (&'static str, &Related)> {
        self.associations.iter().map(|(k, v)| (*k, v))
    }
}

impl Collection {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, member: Entity) {
        self.members.push(member);
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Entity> {
        self.members.iter()
    }

    pub fn iter_mut(&mut self) -> std::slice::IterMut<'_, Entity> {
        self.members.iter_mut()
    }

    /// Is there a member whose key is exactly `key`?
    pub fn contains_key(&self, key: &EntityKey) -> bool {
        self.members.iter().any(|m| m.key().matches(key))
    }

    /// Remove and return the member with key `key`.
    pub fn remove_key(&mut self, key: &EntityKey) -> Option<Entity> {
        let idx = self.members.iter().position(|m| m.key().matches(key))?;
        Some(self.members.remove(idx))
    }

    /// Keep only members for which `keep` returns true.
    pub fn retain(&mut self, keep: impl FnMut(&Entity) -> bool) {
        self.members.retain(keep);
    }

    pub fn clear(&mut self) {
        self.members.clear();
    }
}

impl FromIterator<Entity> for Collection {
    fn from_iter<I: IntoIterator<Item = Entity>>(iter: I) -> Self {
        Self {
            members: iter.into_iter().collect(),
        }
    }
}

impl<'a> IntoIterator for &'a Collection {
    type Item = &'a Entity;
    type IntoIter = std::slice::Iter<'a, Entity>;

    fn into_iter(self) -> Self::IntoIter {
        self.members.iter()
    }
}
