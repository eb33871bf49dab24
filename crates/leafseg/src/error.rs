use core::time::Duration;

use crate::{ConfigError, StoreError};

/// Result alias defaulting to this crate's [`Error`].
pub type Result<T, E = Error> = core::result::Result<T, E>;

/// Why the prefetch worker could not reserve the next segment.
///
/// Delivered to the allocator through the hand-off slot in place of a
/// segment, so a failed refill is never mistaken for a usable boundary.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum RefillError {
    /// The persisted boundary vanished after bootstrap had written it.
    #[error("no persisted boundary for `{key}`; it must exist once bootstrap has reserved")]
    BoundaryMissing { key: String },

    /// The store failed while reading, persisting or locking.
    #[error(transparent)]
    Store(#[from] StoreError),

    /// The next boundary does not fit in a `u64`.
    #[error("next boundary for `{key}` overflows")]
    Overflow { key: String },

    /// The reserved segment starts below an ID this generator already
    /// issued, so the store was rewound behind its back.
    #[error("boundary for `{key}` went back to {persisted}, {issued} already issued")]
    BoundaryRegressed {
        key: String,
        persisted: u64,
        issued: u64,
    },
}

/// Errors returned by [`SegmentKeyGenerator`](crate::SegmentKeyGenerator).
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum Error {
    /// The properties were rejected; no store was contacted.
    #[error("invalid configuration: {0}")]
    Config(#[from] ConfigError),

    /// The first reservation could not be made. The store session is kept
    /// and the next call retries it.
    #[error("bootstrap failed: {0}")]
    Bootstrap(#[from] StoreError),

    /// The background reservation failed. A new reservation has been queued
    /// and the sequence is untouched.
    #[error("generation unavailable: {0}")]
    Unavailable(#[from] RefillError),

    /// No segment arrived within `handoff.timeout.millis`. The reservation
    /// stays queued and a later call picks it up.
    #[error("no segment handed off within {0:?}")]
    HandoffTimeout(Duration),

    /// The prefetch worker is gone; the generator cannot make progress.
    #[error("prefetch worker stopped")]
    WorkerStopped,

    /// The ID space for the key is exhausted.
    #[error("id space exhausted for `{key}`")]
    Overflow { key: String },

    /// The prefetch thread could not be started. The store session is kept
    /// and bootstrap is retried on the next call.
    #[error("failed to start prefetch worker: {0}")]
    Spawn(#[source] std::io::Error),
}
