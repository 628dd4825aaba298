//! Association metadata.
//!
//! Associations are declared as static metadata on each [`EntityMapping`]
//! (see [`crate::mapping`]). Join column placement follows the usual
//! relational convention:
//!
//! - `OneToOne` / `ManyToOne`: `JoinColumn::name` is a column of the source
//!   entity's table and `referenced` is a column of the target's table.
//! - `OneToMany`: `JoinColumn::name` is a column of the target's table and
//!   `referenced` is a column of the source's table.
//!
//! Several associations may bind the same physical column. Only one binding
//! per column may be writable; the others must be declared read-only
//! (`insertable = false, updatable = false`).
//!
//! [`EntityMapping`]: crate::mapping::EntityMapping

/// The type of association between two entities.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum AssociationKind {
    /// One-to-one: `Parent` has one designated `Child`.
    OneToOne,
    /// Many-to-one: many `Child`ren point at one `Parent`.
    #[default]
    ManyToOne,
    /// One-to-many: one `Parent` owns a collection of `Child`ren.
    OneToMany,
}

impl AssociationKind {
    /// Collection-valued?
    pub const fn is_collection(self) -> bool {
        matches!(self, AssociationKind::OneToMany)
    }
}

/// Which table holds an association's join columns.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JoinSide {
    /// The declaring entity's table.
    Source,
    /// The target entity's table.
    Target,
}

/// One column binding of an association.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct JoinColumn {
    /// Column on the join-side table.
    pub name: &'static str,
    /// Column on the other table that `name` points at.
    pub referenced: &'static str,
    pub insertable: bool,
    pub updatable: bool,
}

impl JoinColumn {
    /// A writable binding of `name` to `referenced`.
    #[must_use]
    pub const fn new(name: &'static str, referenced: &'static str) -> Self {
        Self {
            name,
            referenced,
            insertable: true,
            updatable: true,
        }
    }

    /// Mark this binding as neither insertable nor updatable.
    #[must_use]
    pub const fn read_only(mut self) -> Self {
        self.insertable = false;
        self.updatable = false;
        self
    }

    #[must_use]
    pub const fn insertable(mut self, value: bool) -> Self {
        self.insertable = value;
        self
    }

    #[must_use]
    pub const fn updatable(mut self, value: bool) -> Self {
        self.updatable = value;
        self
    }

    pub const fn is_read_only(&self) -> bool {
        !self.insertable && !self.updatable
    }
}

/// Which operations propagate across an association.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CascadeType {
    pub persist: bool,
    pub remove: bool,
}

impl CascadeType {
    pub const NONE: Self = Self {
        persist: false,
        remove: false,
    };
    pub const PERSIST: Self = Self {
        persist: true,
        remove: false,
    };
    pub const REMOVE: Self = Self {
        persist: false,
        remove: true,
    };
    pub const ALL: Self = Self {
        persist: true,
        remove: true,
    };
}

/// Metadata about an association from one entity to another.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AssociationInfo {
    /// Association (field) name on the source entity.
    pub name: &'static str,

    /// Target entity type name.
    pub target: &'static str,

    pub kind: AssociationKind,

    /// Ordered column bindings; see the module docs for placement.
    pub join_columns: &'static [JoinColumn],

    pub cascade: CascadeType,

    /// Delete collection members that disappear from the collection.
    pub orphan_removal: bool,
}

impl AssociationInfo {
    /// Create an association with no join columns and no cascades.
    #[must_use]
    pub const fn new(name: &'static str, target: &'static str, kind: AssociationKind) -> Self {
        Self {
            name,
            target,
            kind,
            join_columns: &[],
            cascade: CascadeType::NONE,
            orphan_removal: false,
        }
    }

    #[must_use]
    pub const fn join_columns(mut self, columns: &'static [JoinColumn]) -> Self {
        self.join_columns = columns;
        self
    }

    #[must_use]
    pub const fn cascade(mut self, cascade: CascadeType) -> Self {
        self.cascade = cascade;
        self
    }

    #[must_use]
    pub const fn orphan_removal(mut self, value: bool) -> Self {
        self.orphan_removal = value;
        self
    }

    /// Table side that holds the join columns.
    pub const fn join_side(&self) -> JoinSide {
        match self.kind {
            AssociationKind::OneToMany => JoinSide::Target,
            AssociationKind::OneToOne | AssociationKind::ManyToOne => JoinSide::Source,
        }
    }

    /// True when no binding of this association writes its column.
    pub fn is_read_only(&self) -> bool {
        self.join_columns.iter().all(JoinColumn::is_read_only)
    }

    /// Join-side column names, in binding order.
    pub fn local_columns(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.join_columns.iter().map(|c| c.name)
    }

    /// Referenced column names, in binding order.
    pub fn referenced_columns(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.join_columns.iter().map(|c| c.referenced)
    }
}
