//! relmodel - composite-key relational mapping with cascade persistence.
//!
//! relmodel maps entity graphs onto relational tables through explicit,
//! programmatically declared mappings:
//!
//! - Simple and composite primary keys, including keys that embed another
//!   entity's key
//! - One-to-one and one-to-many associations whose join columns may overlap,
//!   with exactly one write owner per physical column
//! - Persist and remove cascades, and orphan removal for collections
//! - A unit-of-work session that buffers work and flushes it in dependency
//!   order inside one transaction
//!
//! # Quick Start
//!
//! ```ignore
//! use relmodel::prelude::*;
//!
//! const CHILD_KEY: &[KeyComponentInfo] = &[
//!     KeyComponentInfo::column("id", "id"),
//!     KeyComponentInfo::embedded("parent", "parent", &["parent_id"]),
//! ];
//! const PARENT_ASSOCIATIONS: &[AssociationInfo] = &[
//!     AssociationInfo::new("children", "child", AssociationKind::OneToMany)
//!         .join_columns(&[JoinColumn::new("parent_id", "id")])
//!         .cascade(CascadeType::ALL)
//!         .orphan_removal(true),
//! ];
//!
//! let registry = MappingRegistry::builder()
//!     .register(EntityMapping::new("parent", "parent", KeyShape::simple("id"))
//!         .associations(PARENT_ASSOCIATIONS))
//!     .register(EntityMapping::new("child", "child", KeyShape::composite(CHILD_KEY)))
//!     .build()?;
//!
//! let mut session = SessionBuilder::new(registry).build_memory()?;
//!
//! let child = Entity::new("child")
//!     .with_key(KeyDraft::composite().with("id", 1).with("parent", DraftValue::FromOwner));
//! let parent = Entity::new("parent")
//!     .with_key(KeyDraft::simple("SOME_PARENT"))
//!     .with_member("children", child);
//!
//! session.persist(&parent)?;
//! session.commit(&cx).await?;
//!
//! let parent = session.find(&cx, "parent", &EntityKey::simple("SOME_PARENT")).await?;
//! ```

// Re-export all public types from sub-crates
pub use relmodel_core::{
    // Mapping declarations
    AssociationInfo,
    AssociationKind,
    CascadeType,
    // Registry
    ColumnOwnership,
    ColumnWriter,
    // asupersync re-exports
    Cx,
    // Datastore contract
    Datastore,
    // Identity model
    DraftValue,
    // Entity graphs
    Collection,
    ColumnInfo,
    Entity,
    EntityKey,
    EntityMapping,
    // Errors
    Error,
    ForeignKeyInfo,
    JoinColumn,
    JoinSide,
    KeyComponent,
    KeyComponentInfo,
    KeyComponentKind,
    KeyDraft,
    KeyOwner,
    KeyResolver,
    KeyShape,
    KeyValue,
    Lookup,
    MappingRegistry,
    MappingRegistryBuilder,
    Outcome,
    Related,
    Result,
    Row,
    Statement,
    TableDependency,
    Value,
};

pub use relmodel_core::{
    ColumnOwnershipConflictError, IdentityConflictError, IncompleteKeyError, MappingError,
    MappingErrorKind, NotFoundError, PersistenceFailure, QueryError, QueryErrorKind,
    TransactionError, TransactionErrorKind,
};

pub use relmodel_session::{
    AssociationRef, CascadePlan, CascadePlanner, EntityState, FlushOrderer, FlushPlan, FlushResult,
    Operation, PendingCounts, PlannedOp, RowImage, RowWriter, Session, SessionConfig,
    SessionDebugInfo, SessionEvent,
};

pub use relmodel_memory::{ForeignKey, MemoryStore, TableDef};

// Session construction
pub mod session;
pub use session::SessionBuilder;

/// Prelude module for convenient imports.
///
/// ```ignore
/// use relmodel::prelude::*;
/// ```
pub mod prelude {
    pub use crate::{
        // Mapping
        AssociationInfo,
        AssociationKind,
        CascadeType,
        // asupersync
        Cx,
        Datastore,
        DraftValue,
        // Entities and keys
        Entity,
        EntityKey,
        EntityMapping,
        EntityState,
        Error,
        JoinColumn,
        KeyComponent,
        KeyComponentInfo,
        KeyDraft,
        KeyShape,
        MappingRegistry,
        // Datastore
        MemoryStore,
        Outcome,
        Result,
        // Session
        Session,
        SessionBuilder,
        SessionConfig,
        Value,
    };
}
