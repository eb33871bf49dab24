use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use parking_lot::{Mutex, const_mutex};
use portable_atomic::{AtomicU64, Ordering};

use crate::{LockStore, StoreConfig, StoreError};

// Backends looked up by `server.list`, so sessions opened through the
// registry with the same servers see the same data.
static SHARED: Mutex<BTreeMap<String, Arc<MemoryBackend>>> = const_mutex(BTreeMap::new());

/// Process-local stand-in for a coordination service.
///
/// Holds the persisted values and the lock owner table. Every
/// [`MemoryStore`] session created from the same backend observes the same
/// state and contends for the same locks.
#[derive(Debug, Default)]
pub struct MemoryBackend {
    values: Mutex<HashMap<String, String>>,
    owners: Mutex<HashMap<String, u64>>,
    next_session: AtomicU64,
}

impl MemoryBackend {
    /// Creates an isolated backend.
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Returns the backend registered under `name`, creating it on first use.
    pub fn shared(name: &str) -> Arc<Self> {
        Arc::clone(SHARED.lock().entry(name.to_owned()).or_default())
    }

    /// Opens a new session whose keys live under `/<namespace>`.
    pub fn session(self: &Arc<Self>, namespace: &str) -> MemoryStore {
        MemoryStore {
            backend: Arc::clone(self),
            namespace: format!("/{namespace}"),
            session: self.next_session.fetch_add(1, Ordering::Relaxed) + 1,
            lock: None,
            held: false,
        }
    }

    /// Opens a session for the given store configuration.
    ///
    /// # Errors
    ///
    /// Infallible today; the signature matches [`StoreFactory`].
    ///
    /// [`StoreFactory`]: crate::StoreFactory
    pub fn open(config: &StoreConfig) -> Result<Box<dyn LockStore>, StoreError> {
        let backend = Self::shared(&config.servers.join(","));
        Ok(Box::new(backend.session(&config.namespace)))
    }
}

/// A session against a [`MemoryBackend`].
///
/// Dropping the session releases its lock, mirroring an ephemeral lock node
/// disappearing with its client.
#[derive(Debug)]
pub struct MemoryStore {
    backend: Arc<MemoryBackend>,
    namespace: String,
    session: u64,
    lock: Option<String>,
    held: bool,
}

impl MemoryStore {
    fn path(&self, key: &str) -> String {
        format!("{}{}", self.namespace, key)
    }
}

impl LockStore for MemoryStore {
    fn init_lock(&mut self, key: &str) -> Result<(), StoreError> {
        self.try_release()?;
        self.lock = Some(self.path(key));
        Ok(())
    }

    fn try_lock(&mut self) -> Result<bool, StoreError> {
        let path = self.lock.as_ref().ok_or(StoreError::LockNotInitialized)?;
        let mut owners = self.backend.owners.lock();
        let owner = *owners.entry(path.clone()).or_insert(self.session);
        self.held = owner == self.session;
        Ok(self.held)
    }

    fn try_release(&mut self) -> Result<(), StoreError> {
        if !self.held {
            return Ok(());
        }
        if let Some(path) = &self.lock {
            let mut owners = self.backend.owners.lock();
            if owners.get(path) == Some(&self.session) {
                owners.remove(path);
            }
        }
        self.held = false;
        Ok(())
    }

    fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        Ok(self.backend.values.lock().get(&self.path(key)).cloned())
    }

    fn persist(&mut self, key: &str, value: &str) -> Result<(), StoreError> {
        self.backend
            .values
            .lock()
            .insert(self.path(key), value.to_owned());
        Ok(())
    }
}

impl Drop for MemoryStore {
    fn drop(&mut self) {
        let _ = self.try_release();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lock_is_exclusive_between_sessions() {
        let backend = MemoryBackend::new();
        let mut a = backend.session("ns");
        let mut b = backend.session("ns");
        a.init_lock("/order").unwrap();
        b.init_lock("/order").unwrap();

        assert!(a.try_lock().unwrap());
        assert!(!b.try_lock().unwrap());
        // re-entrant for the holder
        assert!(a.try_lock().unwrap());

        a.try_release().unwrap();
        assert!(b.try_lock().unwrap());
        assert!(!a.try_lock().unwrap());
    }

    #[test]
    fn release_by_non_holder_is_noop() {
        let backend = MemoryBackend::new();
        let mut a = backend.session("ns");
        let mut b = backend.session("ns");
        a.init_lock("/order").unwrap();
        b.init_lock("/order").unwrap();

        assert!(a.try_lock().unwrap());
        b.try_release().unwrap();
        assert!(!b.try_lock().unwrap());
    }

    #[test]
    fn dropping_session_releases_lock() {
        let backend = MemoryBackend::new();
        let mut b = backend.session("ns");
        b.init_lock("/order").unwrap();
        {
            let mut a = backend.session("ns");
            a.init_lock("/order").unwrap();
            assert!(a.try_lock().unwrap());
            assert!(!b.try_lock().unwrap());
        }
        assert!(b.try_lock().unwrap());
    }

    #[test]
    fn try_lock_requires_init() {
        let mut a = MemoryBackend::new().session("ns");
        assert!(matches!(a.try_lock(), Err(StoreError::LockNotInitialized)));
    }

    #[test]
    fn values_are_namespaced_and_shared() {
        let backend = MemoryBackend::new();
        let mut a = backend.session("ns");
        let b = backend.session("ns");
        let other = backend.session("elsewhere");

        assert_eq!(a.get("/order").unwrap(), None);
        a.persist("/order", "20").unwrap();
        assert_eq!(b.get("/order").unwrap().as_deref(), Some("20"));
        assert_eq!(other.get("/order").unwrap(), None);
    }

    #[test]
    fn shared_backends_are_keyed_by_name() {
        let x = MemoryBackend::shared("memory-test-shared-a");
        let y = MemoryBackend::shared("memory-test-shared-a");
        let z = MemoryBackend::shared("memory-test-shared-b");
        assert!(Arc::ptr_eq(&x, &y));
        assert!(!Arc::ptr_eq(&x, &z));
    }
}
