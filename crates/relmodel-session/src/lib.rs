//! Persistence session for relmodel.
//!
//! `relmodel-session` is the **unit-of-work layer**. It expands entity graphs
//! with the cascade planner, tracks managed state in a persistence context and
//! writes pending work to a [`Datastore`] in dependency order.
//!
//! # Role In The Architecture
//!
//! - **Cascade planning**: `persist`/`remove` expand a root into every entity
//!   the operation reaches, resolving keys parent-first.
//! - **Persistence context**: one managed state per (entity type, key), with
//!   flushed and committed images for dirty checking, orphan detection and
//!   rollback.
//! - **Transactional safety**: `commit` flushes and commits; any datastore
//!   failure rolls the transaction back and restores the context.
//!
//! # Example
//!
//! ```ignore
//! let mut session = Session::new(store, registry);
//!
//! // Parent and everything reachable through cascading associations.
//! session.persist(&parent)?;
//! session.commit(&cx).await?;
//!
//! let parent = session.find(&cx, "parent", &EntityKey::simple("SOME_PARENT")).await?;
//! ```

pub mod cascade;
pub mod context;
pub mod flush;
pub mod load;
pub mod write;

pub use cascade::{CascadePlan, CascadePlanner, Operation, PlannedOp};
pub use context::{AssociationRef, EntityState, ManagedEntity, Pending, PersistenceContext};
pub use flush::{FlushOrderer, FlushPlan, FlushResult, PendingOp};
pub use write::{RowColumn, RowImage, RowWriter};

use asupersync::{Cx, Outcome};
use relmodel_core::{
    Datastore, Entity, EntityKey, Error, KeyResolver, MappingRegistry, NotFoundError,
    PersistenceFailure, Result,
};
use serde::Serialize;
use std::sync::Arc;

// ============================================================================
// Session Events
// ============================================================================

/// Callbacks receive no arguments; returning `Err` aborts the operation.
type SessionEventFn = Box<dyn FnMut() -> Result<()> + Send>;

/// Registered session-level event callbacks.
#[derive(Default)]
pub struct SessionEventCallbacks {
    before_flush: Vec<SessionEventFn>,
    after_flush: Vec<SessionEventFn>,
    before_commit: Vec<SessionEventFn>,
    after_commit: Vec<SessionEventFn>,
    after_rollback: Vec<SessionEventFn>,
}

impl std::fmt::Debug for SessionEventCallbacks {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionEventCallbacks")
            .field("before_flush", &self.before_flush.len())
            .field("after_flush", &self.after_flush.len())
            .field("before_commit", &self.before_commit.len())
            .field("after_commit", &self.after_commit.len())
            .field("after_rollback", &self.after_rollback.len())
            .finish()
    }
}

impl SessionEventCallbacks {
    #[allow(clippy::result_large_err)]
    fn fire(&mut self, event: SessionEvent) -> Result<()> {
        let callbacks = match event {
            SessionEvent::BeforeFlush => &mut self.before_flush,
            SessionEvent::AfterFlush => &mut self.after_flush,
            SessionEvent::BeforeCommit => &mut self.before_commit,
            SessionEvent::AfterCommit => &mut self.after_commit,
            SessionEvent::AfterRollback => &mut self.after_rollback,
        };
        for cb in callbacks.iter_mut() {
            cb()?;
        }
        Ok(())
    }
}

/// Session lifecycle events.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEvent {
    /// Fired before flush executes pending changes.
    BeforeFlush,
    /// Fired after flush completes successfully.
    AfterFlush,
    /// Fired before commit (after flush).
    BeforeCommit,
    /// Fired after commit completes successfully.
    AfterCommit,
    /// Fired after rollback completes.
    AfterRollback,
}

// ============================================================================
// Session Configuration
// ============================================================================

/// Configuration for Session behavior.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Begin a datastore transaction on the first flush that writes.
    pub auto_begin: bool,
    /// Deepest cascade the planner follows before giving up.
    pub max_cascade_depth: usize,
    /// Flush pending work before `find` reads from the datastore.
    pub flush_before_find: bool,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            auto_begin: true,
            max_cascade_depth: cascade::DEFAULT_MAX_DEPTH,
            flush_before_find: false,
        }
    }
}

impl SessionConfig {
    #[must_use]
    pub const fn auto_begin(mut self, value: bool) -> Self {
        self.auto_begin = value;
        self
    }

    #[must_use]
    pub const fn max_cascade_depth(mut self, value: usize) -> Self {
        self.max_cascade_depth = value;
        self
    }

    #[must_use]
    pub const fn flush_before_find(mut self, value: bool) -> Self {
        self.flush_before_find = value;
        self
    }
}

// ============================================================================
// Session
// ============================================================================

/// The Session is the central unit-of-work manager.
///
/// A session is single-owner: every method takes `&mut self` and only
/// datastore round trips suspend.
pub struct Session<D: Datastore> {
    store: D,
    registry: Arc<MappingRegistry>,
    context: PersistenceContext,
    in_transaction: bool,
    config: SessionConfig,
    event_callbacks: SessionEventCallbacks,
}

impl<D: Datastore> std::fmt::Debug for Session<D> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("tracked", &self.context.len())
            .field("in_transaction", &self.in_transaction)
            .field("config", &self.config)
            .field("event_callbacks", &self.event_callbacks)
            .finish_non_exhaustive()
    }
}

impl<D: Datastore> Session<D> {
    /// Create a new session over `store`.
    pub fn new(store: D, registry: Arc<MappingRegistry>) -> Self {
        Self::with_config(store, registry, SessionConfig::default())
    }

    /// Create a new session with custom configuration.
    pub fn with_config(store: D, registry: Arc<MappingRegistry>, config: SessionConfig) -> Self {
        Self {
            store,
            registry,
            context: PersistenceContext::new(),
            in_transaction: false,
            config,
            event_callbacks: SessionEventCallbacks::default(),
        }
    }

    pub fn store(&self) -> &D {
        &self.store
    }

    pub fn registry(&self) -> &MappingRegistry {
        &self.registry
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub fn in_transaction(&self) -> bool {
        self.in_transaction
    }

    // ========================================================================
    // Event Callbacks
    // ========================================================================

    pub fn on_before_flush(&mut self, f: impl FnMut() -> Result<()> + Send + 'static) {
        self.event_callbacks.before_flush.push(Box::new(f));
    }

    pub fn on_after_flush(&mut self, f: impl FnMut() -> Result<()> + Send + 'static) {
        self.event_callbacks.after_flush.push(Box::new(f));
    }

    /// Returning `Err` from a before-commit callback aborts the commit.
    pub fn on_before_commit(&mut self, f: impl FnMut() -> Result<()> + Send + 'static) {
        self.event_callbacks.before_commit.push(Box::new(f));
    }

    pub fn on_after_commit(&mut self, f: impl FnMut() -> Result<()> + Send + 'static) {
        self.event_callbacks.after_commit.push(Box::new(f));
    }

    pub fn on_after_rollback(&mut self, f: impl FnMut() -> Result<()> + Send + 'static) {
        self.event_callbacks.after_rollback.push(Box::new(f));
    }

    // ========================================================================
    // Persist / Remove
    // ========================================================================

    fn planner(&self) -> CascadePlanner<'_> {
        CascadePlanner::new(&self.registry).with_max_depth(self.config.max_cascade_depth)
    }

    /// Persist `root` and everything reachable through persist cascades.
    ///
    /// Planning is all-or-nothing: on error nothing is scheduled. Returns the
    /// resolved key of the root, under which its managed state is tracked.
    #[tracing::instrument(level = "debug", skip(self, root), fields(entity = root.name()))]
    pub fn persist(&mut self, root: &Entity) -> Result<EntityKey> {
        let plan = self.planner().plan(root, Operation::Persist)?;
        let Some(key) = plan.root().map(|step| step.key.clone()) else {
            return Err(Error::Custom("persist plan has no root".to_string()));
        };
        self.context.apply_persist(&plan);
        self.context.sync_links(&self.registry);
        tracing::debug!(steps = plan.len(), key = %key, "Persist scheduled");
        Ok(key)
    }

    /// Remove a managed entity and everything reachable through remove cascades.
    pub fn remove(&mut self, root: &Entity) -> Result<()> {
        let key = KeyResolver::new(&self.registry).resolve(root)?;
        self.remove_key(root.name(), &key)
    }

    /// Remove the managed entity `entity` with key `key`.
    ///
    /// The cascade follows the managed state, not a caller-supplied graph.
    /// An entity whose insert was never flushed is simply forgotten.
    #[tracing::instrument(level = "debug", skip(self, key), fields(key = %key))]
    pub fn remove_key(&mut self, entity: &str, key: &EntityKey) -> Result<()> {
        let (name, key) = self.identity(entity, key)?;
        if self.context.state_of(name, &key) != EntityState::Managed {
            return Err(Error::NotFound(NotFoundError { entity: name, key }));
        }
        let tree = self.context.materialize(&self.registry, name, &key)?;
        let plan = self.planner().plan(&tree, Operation::Remove)?;
        self.context.apply_remove(&plan);
        self.context.sync_links(&self.registry);
        tracing::debug!(steps = plan.len(), "Remove scheduled");
        Ok(())
    }

    /// Evict one entity from the session, dropping its pending work.
    pub fn detach(&mut self, entity: &str, key: &EntityKey) -> Result<()> {
        let (name, key) = self.identity(entity, key)?;
        self.context.detach(name, &key)
    }

    /// Evict every entity.
    pub fn clear(&mut self) {
        tracing::debug!(tracked = self.context.len(), "Clearing session");
        self.context.clear();
    }

    // ========================================================================
    // Introspection
    // ========================================================================

    /// Lifecycle state of an entity; unknown entity types are `Transient`.
    pub fn state_of(&self, entity: &str, key: &EntityKey) -> EntityState {
        match self.identity(entity, key) {
            Ok((name, key)) => self.context.state_of(name, &key),
            Err(_) => EntityState::Transient,
        }
    }

    pub fn contains(&self, entity: &str, key: &EntityKey) -> bool {
        self.state_of(entity, key) == EntityState::Managed
    }

    /// The managed state of an entity as an owned graph.
    pub fn get(&self, entity: &str, key: &EntityKey) -> Option<Entity> {
        let (name, key) = self.identity(entity, key).ok()?;
        if self.context.state_of(name, &key) != EntityState::Managed {
            return None;
        }
        self.context.materialize(&self.registry, name, &key).ok()
    }

    pub fn pending_counts(&self) -> PendingCounts {
        let mut counts = PendingCounts::default();
        for (_, pending) in self.context.pending() {
            match pending {
                Pending::Insert => counts.new += 1,
                Pending::Update(_) => counts.dirty += 1,
                Pending::Delete => counts.deleted += 1,
            }
        }
        counts
    }

    /// Dump session state for debugging.
    pub fn debug_state(&self) -> SessionDebugInfo {
        let counts = self.pending_counts();
        let mut entities: Vec<TrackedEntity> = self
            .context
            .iter()
            .map(|e| TrackedEntity {
                entity: e.name,
                key: e.key.clone(),
                state: e.state,
                seq: e.seq,
            })
            .collect();
        entities.sort_by_key(|e| e.seq);
        SessionDebugInfo {
            tracked: self.context.len(),
            pending_new: counts.new,
            pending_dirty: counts.dirty,
            pending_delete: counts.deleted,
            in_transaction: self.in_transaction,
            entities,
        }
    }

    fn identity(&self, entity: &str, key: &EntityKey) -> Result<(&'static str, EntityKey)> {
        let name = self.registry.mapping(entity)?.name;
        let key = KeyResolver::new(&self.registry).normalize(name, key)?;
        Ok((name, key))
    }

    // ========================================================================
    // Find
    // ========================================================================

    /// Find an entity by key, with its associations.
    ///
    /// Managed state answers first; otherwise the graph is read from the
    /// datastore and becomes managed.
    #[tracing::instrument(level = "debug", skip(self, cx, key), fields(key = %key))]
    pub async fn find(&mut self, cx: &Cx, entity: &str, key: &EntityKey) -> Outcome<Entity, Error> {
        let (name, key) = match self.identity(entity, key) {
            Ok(identity) => identity,
            Err(e) => return Outcome::Err(e),
        };

        match self.context.state_of(name, &key) {
            EntityState::Managed => {
                tracing::debug!("Found in persistence context");
                return match self.context.materialize(&self.registry, name, &key) {
                    Ok(found) => Outcome::Ok(found),
                    Err(e) => Outcome::Err(e),
                };
            }
            EntityState::Removed => {
                return Outcome::Err(Error::NotFound(NotFoundError { entity: name, key }));
            }
            EntityState::Transient | EntityState::Detached => {}
        }

        if self.config.flush_before_find && !self.pending_counts().is_empty() {
            match self.flush(cx).await {
                Outcome::Ok(_) => {}
                Outcome::Err(e) => return Outcome::Err(e),
                Outcome::Cancelled(r) => return Outcome::Cancelled(r),
                Outcome::Panicked(p) => return Outcome::Panicked(p),
            }
        }

        match load::load_graph(cx, &self.store, &self.registry, &mut self.context, name, &key).await {
            Outcome::Ok(loaded) => tracing::debug!(loaded, "Loaded from datastore"),
            Outcome::Err(e) => return Outcome::Err(e),
            Outcome::Cancelled(r) => return Outcome::Cancelled(r),
            Outcome::Panicked(p) => return Outcome::Panicked(p),
        }

        match self.context.materialize(&self.registry, name, &key) {
            Ok(found) => Outcome::Ok(found),
            Err(e) => Outcome::Err(e),
        }
    }

    // ========================================================================
    // Transaction Management
    // ========================================================================

    /// Begin a transaction.
    pub async fn begin(&mut self, cx: &Cx) -> Outcome<(), Error> {
        if self.in_transaction {
            return Outcome::Ok(());
        }

        match self.store.begin(cx).await {
            Outcome::Ok(()) => {
                self.in_transaction = true;
                Outcome::Ok(())
            }
            Outcome::Err(e) => Outcome::Err(e),
            Outcome::Cancelled(r) => Outcome::Cancelled(r),
            Outcome::Panicked(p) => Outcome::Panicked(p),
        }
    }

    /// Schedule removal of every orphan, until none are left.
    fn cascade_orphans(&mut self) -> Result<usize> {
        let mut removed = 0;
        loop {
            let orphans = self.context.orphans(&self.registry);
            if orphans.is_empty() {
                return Ok(removed);
            }
            for (entity, key) in orphans {
                if self.context.state_of(entity, &key) != EntityState::Managed {
                    continue;
                }
                let tree = self.context.materialize(&self.registry, entity, &key)?;
                let plan = self.planner().plan(&tree, Operation::Remove)?;
                self.context.apply_remove(&plan);
                removed += 1;
            }
        }
    }

    fn pending_ops(&self) -> Result<Vec<PendingOp>> {
        self.context
            .pending()
            .iter()
            .map(|(managed, pending)| PendingOp::for_entity(&self.registry, managed, pending))
            .collect()
    }

    /// Flush pending changes to the datastore.
    ///
    /// Detects orphans, then executes INSERT, UPDATE and DELETE statements
    /// but does NOT commit.
    #[tracing::instrument(level = "info", skip(self, cx))]
    pub async fn flush(&mut self, cx: &Cx) -> Outcome<FlushResult, Error> {
        if let Err(e) = self.event_callbacks.fire(SessionEvent::BeforeFlush) {
            return Outcome::Err(e);
        }

        match self.cascade_orphans() {
            Ok(0) => {}
            Ok(orphans) => tracing::debug!(orphans, "Orphans scheduled for removal"),
            Err(e) => return Outcome::Err(e),
        }
        self.context.sync_links(&self.registry);

        let ops = match self.pending_ops() {
            Ok(ops) => ops,
            Err(e) => return Outcome::Err(e),
        };

        let mut result = FlushResult::default();
        if !ops.is_empty() {
            if self.config.auto_begin && !self.in_transaction {
                match self.begin(cx).await {
                    Outcome::Ok(()) => {}
                    Outcome::Err(e) => return Outcome::Err(e),
                    Outcome::Cancelled(r) => return Outcome::Cancelled(r),
                    Outcome::Panicked(p) => return Outcome::Panicked(p),
                }
            }

            let plan = FlushOrderer::from_registry(&self.registry).order(ops);
            match plan.execute(cx, &self.store).await {
                Outcome::Ok(r) => result = r,
                Outcome::Err(e) => return Outcome::Err(e),
                Outcome::Cancelled(r) => return Outcome::Cancelled(r),
                Outcome::Panicked(p) => return Outcome::Panicked(p),
            }
        }
        self.context.mark_flushed();

        if let Err(e) = self.event_callbacks.fire(SessionEvent::AfterFlush) {
            return Outcome::Err(e);
        }

        Outcome::Ok(result)
    }

    /// Commit the current transaction.
    ///
    /// Any datastore failure rolls the transaction back and is reported as
    /// [`Error::Persistence`] carrying the cause.
    #[tracing::instrument(level = "info", skip(self, cx))]
    pub async fn commit(&mut self, cx: &Cx) -> Outcome<(), Error> {
        match self.flush(cx).await {
            Outcome::Ok(_) => {}
            Outcome::Err(e) => {
                return Outcome::Err(self.fail_and_rollback(cx, "flush failed during commit", e).await);
            }
            Outcome::Cancelled(r) => return Outcome::Cancelled(r),
            Outcome::Panicked(p) => return Outcome::Panicked(p),
        }

        // Fire before_commit event (can abort)
        if let Err(e) = self.event_callbacks.fire(SessionEvent::BeforeCommit) {
            return Outcome::Err(e);
        }

        if self.in_transaction {
            match self.store.commit(cx).await {
                Outcome::Ok(()) => {
                    self.in_transaction = false;
                }
                Outcome::Err(e) => {
                    return Outcome::Err(self.fail_and_rollback(cx, "datastore commit failed", e).await);
                }
                Outcome::Cancelled(r) => return Outcome::Cancelled(r),
                Outcome::Panicked(p) => return Outcome::Panicked(p),
            }
        }

        self.context.mark_committed();
        tracing::info!(tracked = self.context.len(), "Committed");

        if let Err(e) = self.event_callbacks.fire(SessionEvent::AfterCommit) {
            return Outcome::Err(e);
        }

        Outcome::Ok(())
    }

    async fn fail_and_rollback(&mut self, cx: &Cx, message: &str, source: Error) -> Error {
        tracing::warn!(error = %source, "{message}; rolling back");
        let rolled_back = matches!(self.rollback(cx).await, Outcome::Ok(()));
        Error::Persistence(PersistenceFailure {
            message: message.to_string(),
            rolled_back,
            source: Box::new(source),
        })
    }

    /// Rollback the current transaction.
    ///
    /// Pending work is discarded and the context returns to the state of the
    /// last commit.
    #[tracing::instrument(level = "info", skip(self, cx))]
    pub async fn rollback(&mut self, cx: &Cx) -> Outcome<(), Error> {
        let mut failure = None;
        if self.in_transaction {
            match self.store.rollback(cx).await {
                Outcome::Ok(()) => {}
                Outcome::Err(e) => failure = Some(e),
                Outcome::Cancelled(r) => return Outcome::Cancelled(r),
                Outcome::Panicked(p) => return Outcome::Panicked(p),
            }
            self.in_transaction = false;
        }

        self.context.rollback();

        if let Some(e) = failure {
            tracing::warn!(error = %e, "Datastore rollback failed");
            return Outcome::Err(e);
        }

        if let Err(e) = self.event_callbacks.fire(SessionEvent::AfterRollback) {
            return Outcome::Err(e);
        }

        Outcome::Ok(())
    }
}

/// Count of pending operations by type.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PendingCounts {
    /// Entities pending INSERT.
    pub new: usize,
    /// Entities pending UPDATE.
    pub dirty: usize,
    /// Entities pending DELETE.
    pub deleted: usize,
}

impl PendingCounts {
    /// Total number of pending operations.
    #[must_use]
    pub fn total(&self) -> usize {
        self.new + self.dirty + self.deleted
    }

    /// Check if there are no pending operations.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.total() == 0
    }
}

/// Debug information about session state.
#[derive(Debug, Clone, Serialize)]
pub struct SessionDebugInfo {
    /// Total tracked entities.
    pub tracked: usize,
    /// Entities pending INSERT.
    pub pending_new: usize,
    /// Entities pending UPDATE.
    pub pending_dirty: usize,
    /// Entities pending DELETE.
    pub pending_delete: usize,
    /// Whether in a transaction.
    pub in_transaction: bool,
    pub entities: Vec<TrackedEntity>,
}

/// One tracked entity in a [`SessionDebugInfo`].
#[derive(Debug, Clone, Serialize)]
pub struct TrackedEntity {
    pub entity: &'static str,
    pub key: EntityKey,
    pub state: EntityState,
    #[serde(skip)]
    seq: u64,
}

impl SessionDebugInfo {
    /// Render as pretty-printed JSON.
    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string_pretty(self).map_err(|e| Error::Custom(format!("debug state: {e}")))
    }
}

// ============================================================================
// Unit Tests
// ============================================================================
