//! Entity identity: complete keys, key drafts and key resolution.
//!
//! A transient entity carries a [`KeyDraft`], which may be partially filled in
//! (or not assigned at all). Only a fully resolved key is an [`EntityKey`];
//! everything that addresses a row (the persistence context, row images,
//! datastore lookups) works with `EntityKey`s.
//!
//! Composite keys are ordered lists of named components. A component is either
//! a scalar column value or another entity's key (an *embedded* key), which
//! lets a child's identity include its parent's identity:
//!
//! ```ignore
//! // child key (id = 1, parent = "SOME_PARENT")
//! let key = EntityKey::composite(vec![
//!     KeyComponent::scalar("id", 1),
//!     KeyComponent::embedded("parent", EntityKey::simple("SOME_PARENT")),
//! ]);
//! ```

use crate::entity::Entity;
use crate::error::{Error, IncompleteKeyError, MappingErrorKind, Result};
use crate::mapping::{KeyComponentKind, KeyShape};
use crate::registry::MappingRegistry;
use crate::value::Value;
use serde::Serialize;
use std::fmt;

/// A fully resolved entity identifier.
///
/// Equality and hashing are structural: two keys are equal iff every
/// component is (recursively) equal. Integer components compare by value, so
/// `EntityKey::simple(1)` and `EntityKey::simple(1i64)` are the same key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub enum EntityKey {
    /// Single scalar key.
    Simple(Value),
    /// Ordered, named components in mapping declaration order.
    Composite(Vec<KeyComponent>),
}

/// One named component of a composite key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct KeyComponent {
    pub name: &'static str,
    pub value: KeyValue,
}

/// The value of a composite key component.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub enum KeyValue {
    Scalar(Value),
    /// Another entity's key, stored in this entity's columns.
    Embedded(EntityKey),
}

impl EntityKey {
    /// Build a single-column key.
    pub fn simple(value: impl Into<Value>) -> Self {
        EntityKey::Simple(value.into())
    }

    /// Build a composite key from its components.
    pub fn composite(components: Vec<KeyComponent>) -> Self {
        EntityKey::Composite(components)
    }

    /// Look up a component of a composite key by name.
    pub fn component(&self, name: &str) -> Option<&KeyValue> {
        match self {
            EntityKey::Simple(_) => None,
            EntityKey::Composite(components) => components
                .iter()
                .find(|c| c.name == name)
                .map(|c| &c.value),
        }
    }

    /// Flatten the key into column values, in declaration order.
    ///
    /// Embedded keys contribute their own flattened values in place.
    pub fn values(&self) -> Vec<Value> {
        let mut out = Vec::new();
        self.flatten_into(&mut out);
        out
    }

    /// Append the flattened column values of this key to `out`.
    pub fn flatten_into(&self, out: &mut Vec<Value>) {
        match self {
            EntityKey::Simple(v) => out.push(v.clone()),
            EntityKey::Composite(components) => {
                for component in components {
                    match &component.value {
                        KeyValue::Scalar(v) => out.push(v.clone()),
                        KeyValue::Embedded(key) => key.flatten_into(out),
                    }
                }
            }
        }
    }
}

impl KeyComponent {
    pub fn scalar(name: &'static str, value: impl Into<Value>) -> Self {
        Self {
            name,
            value: KeyValue::Scalar(value.into()),
        }
    }

    pub fn embedded(name: &'static str, key: EntityKey) -> Self {
        Self {
            name,
            value: KeyValue::Embedded(key),
        }
    }
}

impl fmt::Display for EntityKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EntityKey::Simple(v) => write!(f, "{v}"),
            EntityKey::Composite(components) => {
                write!(f, "(")?;
                for (i, component) in components.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    match &component.value {
                        KeyValue::Scalar(v) => write!(f, "{}={}", component.name, v)?,
                        KeyValue::Embedded(key) => write!(f, "{}={}", component.name, key)?,
                    }
                }
                write!(f, ")")
            }
        }
    }
}

impl From<Value> for EntityKey {
    fn from(value: Value) -> Self {
        EntityKey::Simple(value)
    }
}

/// A possibly incomplete key, as carried by a transient entity.
#[derive(Debug, Clone, Default, PartialEq)]
pub enum KeyDraft {
    /// No key assigned yet.
    #[default]
    Unassigned,
    Simple(Value),
    Composite(Vec<DraftComponent>),
}

/// One named component of a composite key draft.
#[derive(Debug, Clone, PartialEq)]
pub struct DraftComponent {
    pub name: &'static str,
    pub value: DraftValue,
}

/// The value of a draft component.
#[derive(Debug, Clone, Default, PartialEq)]
pub enum DraftValue {
    #[default]
    Unset,
    Scalar(Value),
    Embedded(KeyDraft),
    /// Filled with the key of the entity whose association reached this one.
    FromOwner,
}

impl KeyDraft {
    /// A draft for a single-column key.
    pub fn simple(value: impl Into<Value>) -> Self {
        KeyDraft::Simple(value.into())
    }

    /// An empty composite draft; add components with [`KeyDraft::with`].
    pub fn composite() -> Self {
        KeyDraft::Composite(Vec::new())
    }

    /// Set (or replace) a composite component.
    ///
    /// Turns an `Unassigned` draft into a composite one.
    #[must_use]
    pub fn with(mut self, name: &'static str, value: impl Into<DraftValue>) -> Self {
        self.set(name, value);
        self
    }

    /// Set (or replace) a composite component in place.
    pub fn set(&mut self, name: &'static str, value: impl Into<DraftValue>) {
        let value = value.into();
        match self {
            KeyDraft::Composite(components) => {
                if let Some(existing) = components.iter_mut().find(|c| c.name == name) {
                    existing.value = value;
                } else {
                    components.push(DraftComponent { name, value });
                }
            }
            KeyDraft::Unassigned | KeyDraft::Simple(_) => {
                *self = KeyDraft::Composite(vec![DraftComponent { name, value }]);
            }
        }
    }

    pub fn is_assigned(&self) -> bool {
        !matches!(self, KeyDraft::Unassigned)
    }

    /// Structural conversion to a complete key, without consulting a mapping.
    ///
    /// Returns `None` when any component is unset, null, or taken from an
    /// owner that is not known here.
    pub fn to_complete(&self) -> Option<EntityKey> {
        match self {
            KeyDraft::Unassigned => None,
            KeyDraft::Simple(v) if v.is_null() => None,
            KeyDraft::Simple(v) => Some(EntityKey::Simple(v.clone())),
            KeyDraft::Composite(components) => {
                let mut out = Vec::with_capacity(components.len());
                for component in components {
                    let value = match &component.value {
                        DraftValue::Scalar(v) if !v.is_null() => KeyValue::Scalar(v.clone()),
                        DraftValue::Embedded(draft) => KeyValue::Embedded(draft.to_complete()?),
                        _ => return None,
                    };
                    out.push(KeyComponent {
                        name: component.name,
                        value,
                    });
                }
                Some(EntityKey::Composite(out))
            }
        }
    }

    /// Does this draft describe exactly `key`?
    ///
    /// Components are compared by name, so the order they were written in
    /// does not matter, and a bare scalar matches a simple embedded key.
    /// `FromOwner` and unset components never match.
    pub fn matches(&self, key: &EntityKey) -> bool {
        match (self, key) {
            (KeyDraft::Simple(v), EntityKey::Simple(k)) => !v.is_null() && v == k,
            (KeyDraft::Composite(drafted), EntityKey::Composite(components)) => {
                drafted.len() == components.len()
                    && components.iter().all(|component| {
                        drafted
                            .iter()
                            .find(|d| d.name == component.name)
                            .is_some_and(|d| d.value.matches(&component.value))
                    })
            }
            _ => false,
        }
    }
}

impl DraftValue {
    fn matches(&self, value: &KeyValue) -> bool {
        match (self, value) {
            (DraftValue::Scalar(v), KeyValue::Scalar(k))
            | (DraftValue::Scalar(v), KeyValue::Embedded(EntityKey::Simple(k)))
            | (DraftValue::Embedded(KeyDraft::Simple(v)), KeyValue::Scalar(k)) => !v.is_null() && v == k,
            (DraftValue::Embedded(draft), KeyValue::Embedded(key)) => draft.matches(key),
            _ => false,
        }
    }
}

impl From<EntityKey> for KeyDraft {
    fn from(key: EntityKey) -> Self {
        match key {
            EntityKey::Simple(v) => KeyDraft::Simple(v),
            EntityKey::Composite(components) => KeyDraft::Composite(
                components
                    .into_iter()
                    .map(|c| DraftComponent {
                        name: c.name,
                        value: match c.value {
                            KeyValue::Scalar(v) => DraftValue::Scalar(v),
                            KeyValue::Embedded(key) => DraftValue::Embedded(key.into()),
                        },
                    })
                    .collect(),
            ),
        }
    }
}

impl From<&EntityKey> for KeyDraft {
    fn from(key: &EntityKey) -> Self {
        key.clone().into()
    }
}

macro_rules! scalar_draft_from {
    ($($ty:ty),*) => {
        $(
            impl From<$ty> for DraftValue {
                fn from(value: $ty) -> Self {
                    DraftValue::Scalar(value.into())
                }
            }
        )*
    };
}

scalar_draft_from!(Value, bool, i32, i64, u32, f64, String, &str, [u8; 16]);

impl From<KeyDraft> for DraftValue {
    fn from(draft: KeyDraft) -> Self {
        DraftValue::Embedded(draft)
    }
}

impl From<EntityKey> for DraftValue {
    fn from(key: EntityKey) -> Self {
        DraftValue::Embedded(key.into())
    }
}

/// The entity that reached the one being resolved, for `FromOwner` components.
#[derive(Debug, Clone, Copy)]
pub struct KeyOwner<'a> {
    pub entity: &'static str,
    pub key: &'a EntityKey,
}

/// Resolves key drafts into complete keys against a mapping registry.
#[derive(Debug, Clone, Copy)]
pub struct KeyResolver<'r> {
    registry: &'r MappingRegistry,
}

impl<'r> KeyResolver<'r> {
    pub fn new(registry: &'r MappingRegistry) -> Self {
        Self { registry }
    }

    /// Resolve an entity's key with no owner in scope.
    pub fn resolve(&self, entity: &Entity) -> Result<EntityKey> {
        self.resolve_with_owner(entity, None)
    }

    /// Resolve an entity's key; `FromOwner` components take `owner`'s key.
    pub fn resolve_with_owner(&self, entity: &Entity, owner: Option<KeyOwner<'_>>) -> Result<EntityKey> {
        self.resolve_draft(entity.name(), entity.key(), owner)
    }

    /// Resolve a draft for entity type `entity`.
    pub fn resolve_draft(
        &self,
        entity: &'static str,
        draft: &KeyDraft,
        owner: Option<KeyOwner<'_>>,
    ) -> Result<EntityKey> {
        let mut path = Vec::new();
        self.resolve_shape(entity, entity, draft, owner, &mut path)
    }

    /// Check a caller-supplied key against the entity's key shape and return
    /// it in canonical component order.
    pub fn normalize(&self, entity: &'static str, key: &EntityKey) -> Result<EntityKey> {
        self.resolve_draft(entity, &KeyDraft::from(key), None)
    }

    /// Rebuild a key from flattened column values (as read from a row).
    pub fn key_from_values(&self, entity: &'static str, values: &[Value]) -> Result<EntityKey> {
        let mut iter = values.iter();
        let key = self.unflatten(entity, entity, &mut iter, &mut Vec::new())?;
        if iter.next().is_some() {
            return Err(Error::mapping(
                MappingErrorKind::KeyShape,
                Some(entity),
                format!("too many key values ({}) for key shape", values.len()),
            ));
        }
        Ok(key)
    }

    fn resolve_shape(
        &self,
        root: &'static str,
        entity: &'static str,
        draft: &KeyDraft,
        owner: Option<KeyOwner<'_>>,
        path: &mut Vec<&'static str>,
    ) -> Result<EntityKey> {
        let mapping = self.registry.mapping(entity)?;
        match (&mapping.key, draft) {
            (KeyShape::Simple { column }, KeyDraft::Simple(v)) => {
                if v.is_null() {
                    return Err(incomplete(root, path, column));
                }
                Ok(EntityKey::Simple(v.clone()))
            }
            (KeyShape::Simple { column }, KeyDraft::Unassigned) => Err(incomplete(root, path, column)),
            (KeyShape::Composite(components), KeyDraft::Unassigned) => {
                let first = components.first().map_or("key", |c| c.name);
                Err(incomplete(root, path, first))
            }
            (KeyShape::Simple { .. }, KeyDraft::Composite(_)) => Err(Error::mapping(
                MappingErrorKind::KeyShape,
                Some(entity),
                "composite key draft given for a simple key",
            )),
            (KeyShape::Composite(_), KeyDraft::Simple(_)) => Err(Error::mapping(
                MappingErrorKind::KeyShape,
                Some(entity),
                "simple key draft given for a composite key",
            )),
            (KeyShape::Composite(shape), KeyDraft::Composite(drafted)) => {
                if let Some(stray) = drafted
                    .iter()
                    .find(|d| !shape.iter().any(|c| c.name == d.name))
                {
                    return Err(Error::mapping(
                        MappingErrorKind::KeyShape,
                        Some(entity),
                        format!("unknown key component '{}'", stray.name),
                    ));
                }

                let mut out = Vec::with_capacity(shape.len());
                for info in *shape {
                    let drafted_value = drafted
                        .iter()
                        .find(|d| d.name == info.name)
                        .map_or(&DraftValue::Unset, |d| &d.value);

                    let value = match (&info.kind, drafted_value) {
                        (_, DraftValue::Unset) => return Err(incomplete(root, path, info.name)),
                        (KeyComponentKind::Column(_), DraftValue::Scalar(v)) => {
                            if v.is_null() {
                                return Err(incomplete(root, path, info.name));
                            }
                            KeyValue::Scalar(v.clone())
                        }
                        (KeyComponentKind::Column(_), _) => {
                            return Err(Error::mapping(
                                MappingErrorKind::KeyShape,
                                Some(entity),
                                format!("key component '{}' is a column, not a key", info.name),
                            ));
                        }
                        (KeyComponentKind::Embedded { entity: target, .. }, DraftValue::Embedded(inner)) => {
                            path.push(info.name);
                            let key = self.resolve_shape(root, *target, inner, None, path)?;
                            path.pop();
                            KeyValue::Embedded(key)
                        }
                        (KeyComponentKind::Embedded { entity: target, .. }, DraftValue::Scalar(v)) => {
                            // A bare scalar stands in for a simple embedded key.
                            path.push(info.name);
                            let key =
                                self.resolve_shape(root, *target, &KeyDraft::Simple(v.clone()), None, path)?;
                            path.pop();
                            KeyValue::Embedded(key)
                        }
                        (KeyComponentKind::Embedded { entity: target, .. }, DraftValue::FromOwner) => {
                            match owner {
                                Some(owner) if owner.entity == *target => {
                                    KeyValue::Embedded(owner.key.clone())
                                }
                                Some(owner) => {
                                    return Err(Error::mapping(
                                        MappingErrorKind::KeyShape,
                                        Some(entity),
                                        format!(
                                            "key component '{}' expects a '{}' owner, reached from '{}'",
                                            info.name, target, owner.entity
                                        ),
                                    ));
                                }
                                None => return Err(incomplete(root, path, info.name)),
                            }
                        }
                    };
                    out.push(KeyComponent {
                        name: info.name,
                        value,
                    });
                }
                Ok(EntityKey::Composite(out))
            }
        }
    }

    fn unflatten<'v>(
        &self,
        root: &'static str,
        entity: &'static str,
        values: &mut impl Iterator<Item = &'v Value>,
        path: &mut Vec<&'static str>,
    ) -> Result<EntityKey> {
        let mapping = self.registry.mapping(entity)?;
        match &mapping.key {
            KeyShape::Simple { column } => match values.next() {
                Some(v) if !v.is_null() => Ok(EntityKey::Simple(v.clone())),
                _ => Err(incomplete(root, path, column)),
            },
            KeyShape::Composite(shape) => {
                let mut out = Vec::with_capacity(shape.len());
                for info in *shape {
                    let value = match &info.kind {
                        KeyComponentKind::Column(_) => match values.next() {
                            Some(v) if !v.is_null() => KeyValue::Scalar(v.clone()),
                            _ => return Err(incomplete(root, path, info.name)),
                        },
                        KeyComponentKind::Embedded { entity: target, .. } => {
                            path.push(info.name);
                            let key = self.unflatten(root, *target, values, path)?;
                            path.pop();
                            KeyValue::Embedded(key)
                        }
                    };
                    out.push(KeyComponent {
                        name: info.name,
                        value,
                    });
                }
                Ok(EntityKey::Composite(out))
            }
        }
    }
}

fn incomplete(entity: &'static str, path: &[&'static str], component: &str) -> Error {
    let mut dotted = path.join(".");
    if !dotted.is_empty() {
        dotted.push('.');
    }
    dotted.push_str(component);
    Error::IncompleteKey(IncompleteKeyError {
        entity,
        component: dotted,
    })
}
