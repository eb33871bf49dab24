use core::time::Duration;
use std::time::Instant;

use rand::Rng;

use crate::{LockStore, StoreError};

/// Polling policy used while waiting for a key lock.
///
/// Acquisition first spins `spin_limit` times, then sleeps with exponential
/// backoff (with jitter) starting at `initial_backoff` and capped at
/// `max_backoff`. With `timeout` unset, acquisition blocks until the lock is
/// obtained.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LockRetry {
    pub spin_limit: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    pub timeout: Option<Duration>,
}

impl LockRetry {
    pub const DEFAULT_SPIN_LIMIT: u32 = 64;
    pub const DEFAULT_INITIAL_BACKOFF: Duration = Duration::from_micros(50);
    pub const DEFAULT_MAX_BACKOFF: Duration = Duration::from_millis(10);

    /// Returns a copy of this policy bounded by `timeout`.
    #[must_use]
    pub const fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Blocks until `store` grants its lock or the timeout elapses.
    ///
    /// # Errors
    ///
    /// - [`StoreError::LockTimeout`] if `timeout` elapsed first.
    /// - Any error reported by [`LockStore::try_lock`].
    pub fn acquire<S>(&self, store: &mut S, key: &str) -> Result<(), StoreError>
    where
        S: LockStore + ?Sized,
    {
        let started = Instant::now();
        let mut spins = 0_u32;
        let mut backoff = self.initial_backoff;

        loop {
            if store.try_lock()? {
                return Ok(());
            }

            let waited = started.elapsed();
            if let Some(limit) = self.timeout {
                if waited >= limit {
                    return Err(StoreError::LockTimeout {
                        key: key.to_owned(),
                        waited,
                    });
                }
            }

            if spins < self.spin_limit {
                spins += 1;
                core::hint::spin_loop();
                continue;
            }

            let mut pause = jitter(backoff);
            if let Some(limit) = self.timeout {
                pause = pause.min(limit.saturating_sub(waited));
            }
            std::thread::sleep(pause);
            backoff = backoff.saturating_mul(2).min(self.max_backoff);
        }
    }
}

impl Default for LockRetry {
    fn default() -> Self {
        Self {
            spin_limit: Self::DEFAULT_SPIN_LIMIT,
            initial_backoff: Self::DEFAULT_INITIAL_BACKOFF,
            max_backoff: Self::DEFAULT_MAX_BACKOFF,
            timeout: None,
        }
    }
}

// Uniform in [backoff / 2, backoff] so competing sessions drift apart.
fn jitter(backoff: Duration) -> Duration {
    if backoff.is_zero() {
        return backoff;
    }
    rand::rng().random_range(backoff / 2..=backoff)
}

/// Runs `f` while holding the key lock, releasing it afterwards even when `f`
/// fails.
///
/// A release failure is reported only if `f` itself succeeded.
pub(crate) fn with_lock<S, T, E>(
    store: &mut S,
    key: &str,
    retry: &LockRetry,
    f: impl FnOnce(&mut S) -> Result<T, E>,
) -> Result<T, E>
where
    S: LockStore + ?Sized,
    E: From<StoreError>,
{
    retry.acquire(store, key)?;
    let outcome = f(store);
    let released = store.try_release();
    let value = outcome?;
    released?;
    Ok(value)
}
