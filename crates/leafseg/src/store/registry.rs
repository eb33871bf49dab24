use std::collections::BTreeMap;

use crate::{FileStore, LockStore, MemoryBackend, StoreConfig, StoreError};

/// Type id of the in-process [`MemoryStore`](crate::MemoryStore).
pub const MEMORY_STORE: &str = "memory";
/// Type id of the directory-backed [`FileStore`].
pub const FILE_STORE: &str = "file";

/// Builds a store session from resolved connection parameters.
pub type StoreFactory = fn(&StoreConfig) -> Result<Box<dyn LockStore>, StoreError>;

/// Maps `store.type` identifiers to [`StoreFactory`] functions.
///
/// Kept apart from the allocator: a generator can be handed a session
/// directly and never consult a registry.
#[derive(Clone, Debug)]
pub struct StoreRegistry {
    factories: BTreeMap<String, StoreFactory>,
}

impl StoreRegistry {
    /// An empty registry.
    pub const fn empty() -> Self {
        Self {
            factories: BTreeMap::new(),
        }
    }

    /// A registry with the built-in [`MEMORY_STORE`] and [`FILE_STORE`]
    /// adapters.
    pub fn with_defaults() -> Self {
        let mut registry = Self::empty();
        registry.register(MEMORY_STORE, MemoryBackend::open);
        registry.register(FILE_STORE, FileStore::open);
        registry
    }

    /// Registers `factory` under `store_type`, returning the factory it
    /// replaced.
    pub fn register(
        &mut self,
        store_type: impl Into<String>,
        factory: StoreFactory,
    ) -> Option<StoreFactory> {
        self.factories.insert(store_type.into(), factory)
    }

    /// Whether a factory is registered for `store_type`.
    pub fn contains(&self, store_type: &str) -> bool {
        self.factories.contains_key(store_type)
    }

    /// Opens a session for `config.store_type`.
    ///
    /// # Errors
    ///
    /// - [`StoreError::UnknownType`] when nothing is registered for the type.
    /// - Whatever the factory reports.
    pub fn open(&self, config: &StoreConfig) -> Result<Box<dyn LockStore>, StoreError> {
        let factory = self
            .factories
            .get(&config.store_type)
            .ok_or_else(|| StoreError::UnknownType(config.store_type.clone()))?;
        factory(config)
    }
}

impl Default for StoreRegistry {
    fn default() -> Self {
        Self::with_defaults()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(store_type: &str, server: &str) -> StoreConfig {
        StoreConfig {
            store_type: store_type.into(),
            servers: vec![server.into()],
            namespace: "leaf_segment".into(),
        }
    }

    #[test]
    fn defaults_cover_builtin_adapters() {
        let registry = StoreRegistry::with_defaults();
        assert!(registry.contains(MEMORY_STORE));
        assert!(registry.contains(FILE_STORE));
        assert!(!registry.contains("zookeeper"));
    }

    #[test]
    fn unknown_type_is_rejected() {
        let registry = StoreRegistry::with_defaults();
        match registry.open(&config("zookeeper", "127.0.0.1:2181")) {
            Err(StoreError::UnknownType(t)) => assert_eq!(t, "zookeeper"),
            Err(e) => panic!("unexpected error {e}"),
            Ok(_) => panic!("zookeeper should not be registered"),
        }
    }

    #[test]
    fn memory_sessions_share_by_server_list() {
        let registry = StoreRegistry::with_defaults();
        let cfg = config(MEMORY_STORE, "registry-test-shared");
        let mut a = registry.open(&cfg).unwrap();
        let b = registry.open(&cfg).unwrap();
        a.persist("/order", "5").unwrap();
        assert_eq!(b.get("/order").unwrap().as_deref(), Some("5"));
    }

    #[test]
    fn custom_factory_can_alias_builtin() {
        let mut registry = StoreRegistry::empty();
        assert!(registry.register("zookeeper", MemoryBackend::open).is_none());
        assert!(registry.register("zookeeper", MemoryBackend::open).is_some());
        assert!(registry.open(&config("zookeeper", "registry-test-alias")).is_ok());
    }
}
