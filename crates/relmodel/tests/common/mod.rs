//! Shared fixtures for session integration tests.
//!
//! A parent keyed by a string, and children whose composite key embeds the
//! parent's key. The parent reaches its children twice: through the
//! `children` collection (which owns `child.parent_id` through the embedded
//! key) and through a read-only `child` slot that aliases the same columns.

#![allow(dead_code)]

use std::sync::Arc;

use relmodel::prelude::*;
use relmodel::{Statement, Value};

pub const PARENT_KEY: &str = "SOME_PARENT";

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

pub fn registry() -> Arc<MappingRegistry> {
    Arc::new(
        MappingRegistry::builder()
            .register(
                EntityMapping::new("parent", "parent", KeyShape::simple("id"))
                    .columns(&["name"])
                    .associations(PARENT_ASSOCIATIONS),
            )
            .register(
                EntityMapping::new("child", "child", KeyShape::composite(CHILD_KEY)).columns(&["name"]),
            )
            .build()
            .expect("fixture mapping is valid"),
    )
}

pub fn unwrap_outcome<T: std::fmt::Debug>(outcome: Outcome<T, Error>) -> T {
    match outcome {
        Outcome::Ok(v) => v,
        other => std::panic::panic_any(format!("unexpected outcome: {other:?}")),
    }
}

/// A session over a fresh memory store, and a handle on that store.
pub fn memory_session() -> (Session<MemoryStore>, MemoryStore) {
    let session = SessionBuilder::new(registry())
        .build_memory()
        .expect("schema derives from the mapping");
    let store = session.store().clone();
    (session, store)
}

/// A transient child whose key takes the parent from whoever reaches it.
pub fn child(id: i32) -> Entity {
    Entity::new("child").with_key(
        KeyDraft::composite()
            .with("id", id)
            .with("parent", DraftValue::FromOwner),
    )
}

pub fn child_key(id: i32) -> EntityKey {
    EntityKey::composite(vec![
        KeyComponent::scalar("id", id),
        KeyComponent::embedded("parent", parent_key()),
    ])
}

pub fn parent_key() -> EntityKey {
    EntityKey::simple(PARENT_KEY)
}

/// Parent P with C1 in the single-valued slot and C2 added to `children`.
pub fn fixture_parent() -> Entity {
    Entity::new("parent")
        .with_key(KeyDraft::simple(PARENT_KEY))
        .with_attr("name", "p")
        .with_one("child", Some(child(1)))
        .with_member("children", child(2))
}

/// Verb and table of every logged statement.
pub fn shape(statements: &[Statement]) -> Vec<(&'static str, &'static str)> {
    statements.iter().map(|s| (s.verb(), s.table())).collect()
}

pub fn text(value: &str) -> Value {
    Value::from(value)
}
