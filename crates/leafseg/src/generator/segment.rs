use portable_atomic::{AtomicU64, Ordering};

#[cfg(feature = "tracing")]
use tracing::instrument;

use crate::{
    Error, KeyGenerator, LEAF_SEGMENT, LockStore, Properties, RefillError, Result,
    SegmentConfig, StoreRegistry,
    generator::{
        handoff::HandoffError,
        prefetch::{PrefetchRequest, PrefetchWorker, read_boundary},
    },
    store::with_lock,
};

#[cfg(not(feature = "cache-padded"))]
use parking_lot::Mutex;
#[cfg(feature = "cache-padded")]
type Mutex<T> = crossbeam_utils::CachePadded<parking_lot::Mutex<T>>;

/// Counters describing allocator activity.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SegmentStats {
    /// Segments adopted from the prefetch worker.
    pub adoptions: u64,
    /// Reservations submitted to the prefetch worker, bootstrap included.
    pub reservations_requested: u64,
    /// Results (segments or failures) taken from the hand-off slot.
    pub handoffs: u64,
}

enum State {
    /// Not bootstrapped. Holds the session when one was supplied up front.
    Idle(Option<Box<dyn LockStore>>),
    Running(Allocator),
}

struct Allocator {
    current_id: u64,
    worker: PrefetchWorker,
}

/// A segment-based generator for one logical key.
///
/// IDs are reserved from a shared [`LockStore`] in segments of `step` and
/// handed out from memory. A background worker keeps the next segment
/// reserved, so callers only block on the store when they outrun it.
///
/// Construction validates the configuration without touching the store. The
/// first [`generate`](Self::generate) call bootstraps: it opens the store,
/// reserves the first segment synchronously and starts the prefetch worker.
///
/// ## Guarantees
/// - IDs from one instance strictly increase, by exactly one within a
///   segment.
/// - Instances sharing a key and store never issue the same ID: every ID lies
///   in a segment reserved under the key lock.
/// - IDs reserved but not issued before a restart are skipped.
///
/// ## Example
/// ```
/// use leafseg::{KeyGenerator, Properties, SegmentKeyGenerator};
///
/// let properties = Properties::new()
///     .with("key.name", "t_order")
///     .with("segment.step", 5)
///     .with("server.list", "doc-example")
///     .with("store.type", "memory");
///
/// let generator = SegmentKeyGenerator::new(&properties).unwrap();
/// let ids: Vec<u64> = (0..7).map(|_| generator.generate().unwrap()).collect();
/// assert_eq!(ids, [1, 2, 3, 4, 5, 6, 7]);
/// ```
pub struct SegmentKeyGenerator {
    config: SegmentConfig,
    registry: StoreRegistry,
    state: Mutex<State>,
    adoptions: AtomicU64,
    reservations: AtomicU64,
    handoffs: AtomicU64,
}

impl SegmentKeyGenerator {
    /// Builds a generator using the built-in store adapters.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] if `properties` are invalid.
    pub fn new(properties: &Properties) -> Result<Self> {
        Self::with_registry(properties, StoreRegistry::with_defaults())
    }

    /// Builds a generator that resolves `store.type` through `registry`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] if `properties` are invalid.
    pub fn with_registry(properties: &Properties, registry: StoreRegistry) -> Result<Self> {
        let config = SegmentConfig::from_properties(properties)?;
        Ok(Self::build(config, registry, None))
    }

    /// Builds a generator around an already opened store session.
    /// `store.type` is not consulted.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] if `properties` are invalid; `store` is left
    /// untouched in that case.
    pub fn with_store(properties: &Properties, store: impl LockStore + 'static) -> Result<Self> {
        let config = SegmentConfig::from_properties(properties)?;
        Ok(Self::build(config, StoreRegistry::empty(), Some(Box::new(store))))
    }

    /// Builds a generator from a validated configuration.
    pub fn from_config(config: SegmentConfig, registry: StoreRegistry) -> Self {
        Self::build(config, registry, None)
    }

    fn build(
        config: SegmentConfig,
        registry: StoreRegistry,
        store: Option<Box<dyn LockStore>>,
    ) -> Self {
        let state = parking_lot::Mutex::new(State::Idle(store));
        Self {
            config,
            registry,
            #[cfg(feature = "cache-padded")]
            state: crossbeam_utils::CachePadded::new(state),
            #[cfg(not(feature = "cache-padded"))]
            state,
            adoptions: AtomicU64::new(0),
            reservations: AtomicU64::new(0),
            handoffs: AtomicU64::new(0),
        }
    }

    /// The validated configuration this generator was built from.
    pub fn config(&self) -> &SegmentConfig {
        &self.config
    }

    /// Snapshot of the activity counters. Readable while other threads
    /// generate.
    pub fn stats(&self) -> SegmentStats {
        SegmentStats {
            adoptions: self.adoptions.load(Ordering::Relaxed),
            reservations_requested: self.reservations.load(Ordering::Relaxed),
            handoffs: self.handoffs.load(Ordering::Relaxed),
        }
    }

    /// Returns the next ID.
    ///
    /// Calls are serialized per instance. A call blocks only while
    /// bootstrapping or when the next segment has not been reserved yet.
    ///
    /// # Errors
    ///
    /// - [`Error::Bootstrap`] or [`Error::Spawn`] if bootstrap failed; the
    ///   store session is kept and the next call retries.
    /// - [`Error::Unavailable`] if the background reservation failed; a new
    ///   one is queued and the sequence is unaffected.
    /// - [`Error::HandoffTimeout`] if `handoff.timeout.millis` elapsed.
    /// - [`Error::WorkerStopped`] if the prefetch worker is gone.
    /// - [`Error::Overflow`] if the key's ID space is exhausted.
    pub fn generate(&self) -> Result<u64> {
        let mut state = self.state.lock();
        match &mut *state {
            State::Running(allocator) => self.advance(allocator),
            State::Idle(store) => {
                let allocator = self.bootstrap(store)?;
                let id = allocator.current_id;
                *state = State::Running(allocator);
                Ok(id)
            }
        }
    }

    #[cfg_attr(
        feature = "tracing",
        instrument(level = "debug", skip(self, pending), fields(key = %self.config.key))
    )]
    fn bootstrap(&self, pending: &mut Option<Box<dyn LockStore>>) -> Result<Allocator> {
        let mut store = match pending.take() {
            Some(store) => store,
            None => self.registry.open(&self.config.store)?,
        };

        match self.reserve_first(&mut *store) {
            Ok(id) => {
                let spawned = PrefetchWorker::spawn(
                    store,
                    self.config.key.clone(),
                    self.config.lock_retry.clone(),
                );
                let worker = match spawned {
                    Ok(worker) => worker,
                    Err(failed) => {
                        *pending = failed.store;
                        return Err(failed.error);
                    }
                };
                // The first segment is reserved either way; a worker that is
                // already gone shows up as `WorkerStopped` at the first
                // adoption.
                if let Err(_e) = self.request_segment(&worker) {
                    #[cfg(feature = "tracing")]
                    tracing::warn!(error = %_e, "prefetch worker stopped during bootstrap");
                }

                #[cfg(feature = "tracing")]
                tracing::info!(first_id = id, step = self.config.step, "segment generator ready");

                Ok(Allocator {
                    current_id: id,
                    worker,
                })
            }
            Err(e) => {
                *pending = Some(store);
                Err(e)
            }
        }
    }

    /// Resolves the first ID and persists the end of its segment.
    fn reserve_first(&self, store: &mut dyn LockStore) -> Result<u64> {
        let SegmentConfig {
            key,
            step,
            initial_value,
            lock_retry,
            ..
        } = &self.config;

        store.init_lock(key.as_str())?;
        with_lock(store, key.as_str(), lock_retry, |store| {
            let id = match read_boundary(&*store, key)? {
                Some(persisted) => persisted.checked_add(1).ok_or_else(|| self.overflow())?,
                None => *initial_value,
            };
            let ceiling = first_ceiling(id, *step).ok_or_else(|| self.overflow())?;
            store.persist(key.as_str(), &ceiling.to_string())?;
            Ok(id)
        })
    }

    fn advance(&self, allocator: &mut Allocator) -> Result<u64> {
        if allocator.current_id % self.config.step == 0 {
            self.adopt(allocator)?;
        }
        allocator.current_id = allocator
            .current_id
            .checked_add(1)
            .ok_or_else(|| self.overflow())?;
        Ok(allocator.current_id)
    }

    /// Moves the cursor onto the next reserved segment and queues the one
    /// after it.
    fn adopt(&self, allocator: &mut Allocator) -> Result<()> {
        let taken = allocator.worker.take(self.config.handoff_timeout);
        self.handoffs.store(allocator.worker.handoffs(), Ordering::Relaxed);

        match taken {
            Ok(Ok(segment)) if segment.floor < allocator.current_id => {
                let regressed = RefillError::BoundaryRegressed {
                    key: self.config.key.to_string(),
                    persisted: segment.floor,
                    issued: allocator.current_id,
                };
                self.requeue(allocator, regressed)
            }
            Ok(Ok(segment)) => {
                #[cfg(feature = "tracing")]
                tracing::debug!(
                    key = %self.config.key,
                    from = allocator.current_id,
                    floor = segment.floor,
                    ceiling = segment.ceiling,
                    "adopting segment"
                );

                allocator.current_id = segment.floor;
                self.adoptions.fetch_add(1, Ordering::Relaxed);
                self.request_segment(&allocator.worker)
            }
            Ok(Err(refill)) => self.requeue(allocator, refill),
            Err(HandoffError::TimedOut(waited)) => Err(Error::HandoffTimeout(waited)),
            Err(HandoffError::Closed) => Err(Error::WorkerStopped),
        }
    }

    /// Leaves the cursor on the boundary and queues another reservation.
    fn requeue(&self, allocator: &Allocator, refill: RefillError) -> Result<()> {
        #[cfg(feature = "tracing")]
        tracing::warn!(key = %self.config.key, error = %refill, "refill rejected, requeueing");

        self.request_segment(&allocator.worker)?;
        Err(Error::Unavailable(refill))
    }

    fn request_segment(&self, worker: &PrefetchWorker) -> Result<()> {
        worker.submit(PrefetchRequest::Reserve {
            step: self.config.step,
        })?;
        self.reservations.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn overflow(&self) -> Error {
        Error::Overflow {
            key: self.config.key.to_string(),
        }
    }
}

impl KeyGenerator for SegmentKeyGenerator {
    fn type_name(&self) -> &'static str {
        LEAF_SEGMENT
    }

    fn generate(&self) -> Result<u64> {
        self.generate()
    }
}

/// End of the first segment: the next multiple of `step` above `id`.
pub(crate) fn first_ceiling(id: u64, step: u64) -> Option<u64> {
    id.checked_add(step - id % step)
}
