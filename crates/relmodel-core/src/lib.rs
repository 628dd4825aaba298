//! Core types for relmodel.
//!
//! This crate provides the foundations the session builds on:
//!
//! - `Value` / `Row` for column data
//! - the identity model: `EntityKey`, `KeyDraft`, `KeyResolver`
//! - mapping declarations: `EntityMapping`, `KeyShape`, `AssociationInfo`
//! - `MappingRegistry`, which validates mappings and exposes column ownership
//! - `Entity` graph values
//! - the `Datastore` trait, with `Cx` and `Outcome` re-exported from asupersync

// Re-export asupersync primitives for structured concurrency
pub use asupersync::{Cx, Outcome};

pub mod association;
pub mod datastore;
pub mod entity;
pub mod error;
pub mod identifiers;
pub mod key;
pub mod mapping;
pub mod registry;
pub mod row;
pub mod value;

pub use association::{AssociationInfo, AssociationKind, CascadeType, JoinColumn, JoinSide};
pub use datastore::{Datastore, Lookup, Statement};
pub use entity::{Collection, Entity, Related};
pub use error::{
    ColumnOwnershipConflictError, Error, IdentityConflictError, IncompleteKeyError, MappingError,
    MappingErrorKind, NotFoundError, PersistenceFailure, QueryError, QueryErrorKind, Result,
    TransactionError, TransactionErrorKind, TypeError,
};
pub use identifiers::{is_valid_identifier, quote_ident};
pub use key::{
    DraftComponent, DraftValue, EntityKey, KeyComponent, KeyDraft, KeyOwner, KeyResolver, KeyValue,
};
pub use mapping::{EntityMapping, KeyComponentInfo, KeyComponentKind, KeyShape};
pub use registry::{
    ColumnOwnership, ColumnWriter, ForeignKeyInfo, MappingRegistry, MappingRegistryBuilder,
    TableDependency,
};
pub use row::{ColumnInfo, Row};
pub use value::Value;
