//! Session construction.
//!
//! A [`SessionBuilder`] pairs a mapping registry with session configuration
//! and builds a [`Session`] over any datastore.
//!
//! # Example
//!
//! ```rust,ignore
//! use relmodel::prelude::*;
//!
//! // Session over an existing datastore
//! let session = SessionBuilder::new(registry.clone()).build(store);
//!
//! // Session over an in-memory store whose schema comes from the registry
//! let session = SessionBuilder::new(registry)
//!     .flush_before_find(true)
//!     .build_memory()?;
//! ```

use std::sync::Arc;

use relmodel_core::{Datastore, MappingRegistry, Result};
use relmodel_memory::MemoryStore;
use relmodel_session::{Session, SessionConfig};

/// Builder for creating configured sessions.
#[derive(Debug, Clone)]
pub struct SessionBuilder {
    registry: Arc<MappingRegistry>,
    config: SessionConfig,
}

impl SessionBuilder {
    /// Create a builder for sessions over `registry`.
    pub fn new(registry: impl Into<Arc<MappingRegistry>>) -> Self {
        Self {
            registry: registry.into(),
            config: SessionConfig::default(),
        }
    }

    /// Replace the whole configuration.
    #[must_use]
    pub fn config(mut self, config: SessionConfig) -> Self {
        self.config = config;
        self
    }

    #[must_use]
    pub fn auto_begin(mut self, value: bool) -> Self {
        self.config = self.config.auto_begin(value);
        self
    }

    #[must_use]
    pub fn max_cascade_depth(mut self, value: usize) -> Self {
        self.config = self.config.max_cascade_depth(value);
        self
    }

    #[must_use]
    pub fn flush_before_find(mut self, value: bool) -> Self {
        self.config = self.config.flush_before_find(value);
        self
    }

    /// The registry sessions will share.
    pub fn registry(&self) -> &Arc<MappingRegistry> {
        &self.registry
    }

    /// Build a session over `store`.
    pub fn build<D: Datastore>(self, store: D) -> Session<D> {
        Session::with_config(store, self.registry, self.config)
    }

    /// Build a session over a fresh [`MemoryStore`] derived from the registry.
    pub fn build_memory(self) -> Result<Session<MemoryStore>> {
        let store = MemoryStore::from_registry(&self.registry)?;
        Ok(self.build(store))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use relmodel_core::{EntityMapping, KeyShape};

    fn registry() -> MappingRegistry {
        MappingRegistry::builder()
            .register(EntityMapping::new("parent", "parent", KeyShape::simple("id")).columns(&["name"]))
            .build()
            .unwrap()
    }

    #[test]
    fn test_builder_passes_configuration() {
        let session = SessionBuilder::new(registry())
            .auto_begin(false)
            .max_cascade_depth(8)
            .build_memory()
            .unwrap();
        assert!(!session.config().auto_begin);
        assert_eq!(session.config().max_cascade_depth, 8);
        assert!(!session.config().flush_before_find);
        assert_eq!(
            session.store().table_def("parent").unwrap().primary_key,
            vec!["id"]
        );
    }

    #[test]
    fn test_builder_shares_registry() {
        let builder = SessionBuilder::new(registry());
        let registry = Arc::clone(builder.registry());
        let a = builder.clone().build_memory().unwrap();
        let b = builder.build_memory().unwrap();
        assert!(a.registry().get("parent").is_some());
        assert!(b.registry().get("parent").is_some());
        assert_eq!(Arc::strong_count(&registry), 3);
    }
}
