use crate::StoreError;

/// The narrow contract the allocator needs from a distributed lock/key-value
/// store.
///
/// One value is the session for a single logical key: [`init_lock`] binds the
/// lock, after which [`try_lock`] and [`try_release`] operate on it. Values
/// are plain decimal strings.
///
/// Implementations must give linearizable read-after-write for a key while
/// the lock protocol is followed, and lock acquisition must eventually
/// succeed once contention subsides. Sessions are moved onto the prefetch
/// worker thread after bootstrap, hence the `Send` bound.
///
/// [`init_lock`]: LockStore::init_lock
/// [`try_lock`]: LockStore::try_lock
/// [`try_release`]: LockStore::try_release
pub trait LockStore: Send {
    /// Prepares the mutual-exclusion lock for `key`.
    ///
    /// # Errors
    ///
    /// Returns an error if the backend cannot create the lock.
    fn init_lock(&mut self, key: &str) -> Result<(), StoreError>;

    /// Attempts to take the lock without blocking.
    ///
    /// Returns `Ok(false)` when another session holds it. Callers loop.
    ///
    /// # Errors
    ///
    /// Returns an error on backend failure or if no lock was initialized.
    fn try_lock(&mut self) -> Result<bool, StoreError>;

    /// Releases the lock. A no-op when this session does not hold it.
    ///
    /// # Errors
    ///
    /// Returns an error on backend failure.
    fn try_release(&mut self) -> Result<(), StoreError>;

    /// Reads the value stored for `key`, if any.
    ///
    /// # Errors
    ///
    /// Returns an error on backend failure.
    fn get(&self, key: &str) -> Result<Option<String>, StoreError>;

    /// Durably stores `value` for `key`.
    ///
    /// # Errors
    ///
    /// Returns an error on backend failure.
    fn persist(&mut self, key: &str, value: &str) -> Result<(), StoreError>;
}

impl<S: LockStore + ?Sized> LockStore for Box<S> {
    fn init_lock(&mut self, key: &str) -> Result<(), StoreError> {
        (**self).init_lock(key)
    }

    fn try_lock(&mut self) -> Result<bool, StoreError> {
        (**self).try_lock()
    }

    fn try_release(&mut self) -> Result<(), StoreError> {
        (**self).try_release()
    }

    fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        (**self).get(key)
    }

    fn persist(&mut self, key: &str, value: &str) -> Result<(), StoreError> {
        (**self).persist(key, value)
    }
}
