use core::time::Duration;

/// Failures surfaced by a [`LockStore`] session.
///
/// The allocator treats every variant as fatal to the reservation attempt in
/// flight. Lock *contention* is not an error; it is reported by
/// [`LockStore::try_lock`] returning `false`.
///
/// [`LockStore`]: crate::LockStore
/// [`LockStore::try_lock`]: crate::LockStore::try_lock
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum StoreError {
    /// The backing medium failed (file system, socket, ...).
    #[error("store I/O failed during `{op}`: {source}")]
    Io {
        op: &'static str,
        #[source]
        source: std::io::Error,
    },

    /// `store.type` did not match any registered factory.
    #[error("no store adapter registered for type `{0}`")]
    UnknownType(String),

    /// The persisted boundary could not be parsed as an unsigned integer.
    #[error("persisted value `{value}` for `{key}` is not a valid boundary")]
    CorruptValue { key: String, value: String },

    /// The key lock could not be obtained within the configured bound.
    #[error("lock for `{key}` not acquired within {waited:?}")]
    LockTimeout { key: String, waited: Duration },

    /// An operation was attempted before [`LockStore::init_lock`].
    ///
    /// [`LockStore::init_lock`]: crate::LockStore::init_lock
    #[error("lock was not initialized before use")]
    LockNotInitialized,

    /// Adapter-specific failure that does not fit the variants above.
    #[error("store backend error: {0}")]
    Backend(String),
}

impl StoreError {
    pub(crate) const fn io(op: &'static str, source: std::io::Error) -> Self {
        Self::Io { op, source }
    }
}
