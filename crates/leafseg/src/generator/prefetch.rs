//! Background segment reservation.
//!
//! One worker thread per generator owns the store session once bootstrap
//! is done. It drains reservation requests in submission order and hands each
//! result to the allocator through a [`HandoffSlot`].

use core::time::Duration;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::mpsc;

use crate::{
    Error, LockRetry, LockStore, LogicalKey, RefillError, StoreError,
    generator::handoff::{HandoffError, HandoffSlot},
    store::with_lock,
};

/// A reserved, contiguous ID range `(floor, ceiling]`.
///
/// The allocator adopts a segment by moving its cursor to `floor`; the next
/// issued ID is `floor + 1` and the last is `ceiling`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct Segment {
    pub(crate) floor: u64,
    pub(crate) ceiling: u64,
}

pub(crate) type Refill = Result<Segment, RefillError>;

#[derive(Debug)]
pub(crate) enum PrefetchRequest {
    Reserve { step: u64 },
}

/// How far a reservation starting at `floor` advances the store: up to the
/// next multiple of `step`.
pub(crate) const fn refill_amount(floor: u64, step: u64) -> u64 {
    step - floor % step
}

/// Reads and parses the persisted boundary. Blank values count as absent.
pub(crate) fn read_boundary<S>(store: &S, key: &LogicalKey) -> Result<Option<u64>, StoreError>
where
    S: LockStore + ?Sized,
{
    let Some(raw) = store.get(key.as_str())? else {
        return Ok(None);
    };
    let raw = raw.trim();
    if raw.is_empty() {
        return Ok(None);
    }
    raw.parse()
        .map(Some)
        .map_err(|_| StoreError::CorruptValue {
            key: key.to_string(),
            value: raw.to_owned(),
        })
}

/// Reserves the segment following the persisted boundary, under the key
/// lock.
#[cfg_attr(feature = "tracing", tracing::instrument(level = "debug", skip(store, retry)))]
pub(crate) fn reserve_segment<S>(
    store: &mut S,
    key: &LogicalKey,
    step: u64,
    retry: &LockRetry,
) -> Refill
where
    S: LockStore + ?Sized,
{
    with_lock(store, key.as_str(), retry, |store| {
        let floor = read_boundary(&*store, key)?.ok_or_else(|| RefillError::BoundaryMissing {
            key: key.to_string(),
        })?;
        let ceiling = floor
            .checked_add(refill_amount(floor, step))
            .ok_or_else(|| RefillError::Overflow {
                key: key.to_string(),
            })?;
        store.persist(key.as_str(), &ceiling.to_string())?;
        Ok(Segment { floor, ceiling })
    })
}

/// A worker thread that could not be started, with the session it was
/// given.
pub(crate) struct SpawnFailure {
    pub(crate) store: Option<Box<dyn LockStore>>,
    pub(crate) error: Error,
}

impl core::fmt::Debug for SpawnFailure {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("SpawnFailure")
            .field("store", &self.store.as_ref().map(|_| "<dyn LockStore>"))
            .field("error", &self.error)
            .finish()
    }
}

/// Handle to the prefetch thread. Dropping it stops the worker.
pub(crate) struct PrefetchWorker {
    requests: mpsc::UnboundedSender<PrefetchRequest>,
    slot: Arc<HandoffSlot<Refill>>,
}

impl PrefetchWorker {
    /// Moves `store` onto a new worker thread.
    pub(crate) fn spawn(
        store: Box<dyn LockStore>,
        key: LogicalKey,
        retry: LockRetry,
    ) -> Result<Self, SpawnFailure> {
        let builder =
            std::thread::Builder::new().name(format!("leafseg-prefetch:{}", key.name()));
        Self::spawn_on(builder, store, key, retry)
    }

    fn spawn_on(
        builder: std::thread::Builder,
        store: Box<dyn LockStore>,
        key: LogicalKey,
        retry: LockRetry,
    ) -> Result<Self, SpawnFailure> {
        let (requests, rx) = mpsc::unbounded_channel();
        let slot = Arc::new(HandoffSlot::new());
        let worker_slot = Arc::clone(&slot);
        // The session waits here until the thread runs, so a failed spawn
        // can hand it back.
        let handover = Arc::new(Mutex::new(Some(store)));
        let worker_store = Arc::clone(&handover);

        let spawned = builder.spawn(move || {
            let Some(store) = worker_store.lock().take() else {
                worker_slot.close();
                return;
            };
            worker_loop(rx, store, &key, &retry, &worker_slot);
        });

        match spawned {
            Ok(_) => Ok(Self { requests, slot }),
            Err(e) => Err(SpawnFailure {
                store: handover.lock().take(),
                error: Error::Spawn(e),
            }),
        }
    }

    /// Queues a reservation without blocking.
    pub(crate) fn submit(&self, request: PrefetchRequest) -> Result<(), Error> {
        self.requests
            .send(request)
            .map_err(|_| Error::WorkerStopped)
    }

    /// Waits for the next reservation result.
    pub(crate) fn take(&self, timeout: Option<Duration>) -> Result<Refill, HandoffError> {
        self.slot.take(timeout)
    }

    pub(crate) fn handoffs(&self) -> u64 {
        self.slot.taken()
    }
}

impl Drop for PrefetchWorker {
    fn drop(&mut self) {
        // The request channel closes with `self.requests`; closing the slot
        // unblocks a worker parked in `put`.
        self.slot.close();
    }
}

// Closes the slot however the worker exits, so a waiting caller sees
// `WorkerStopped` instead of hanging.
struct CloseOnExit<'a>(&'a HandoffSlot<Refill>);

impl Drop for CloseOnExit<'_> {
    fn drop(&mut self) {
        self.0.close();
    }
}

fn worker_loop(
    mut rx: mpsc::UnboundedReceiver<PrefetchRequest>,
    mut store: Box<dyn LockStore>,
    key: &LogicalKey,
    retry: &LockRetry,
    slot: &HandoffSlot<Refill>,
) {
    let _close = CloseOnExit(slot);

    #[cfg(feature = "tracing")]
    tracing::trace!(key = %key, "prefetch worker started");

    while let Some(request) = rx.blocking_recv() {
        match request {
            PrefetchRequest::Reserve { step } => {
                let refill = reserve_segment(&mut *store, key, step, retry);

                #[cfg(feature = "tracing")]
                {
                    match &refill {
                        Ok(segment) => tracing::debug!(
                            key = %key,
                            floor = segment.floor,
                            ceiling = segment.ceiling,
                            "segment reserved"
                        ),
                        Err(e) => {
                            tracing::warn!(key = %key, error = %e, "segment reservation failed");
                        }
                    }
                }

                if slot.put(refill).is_err() {
                    break;
                }
            }
        }
    }

    #[cfg(feature = "tracing")]
    tracing::trace!(key = %key, "prefetch worker stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::MemoryBackend;

    fn key() -> LogicalKey {
        LogicalKey::new("t_order").unwrap()
    }

    #[cfg(target_pointer_width = "64")]
    #[test]
    fn failed_spawn_hands_the_session_back() {
        let backend = MemoryBackend::new();
        let mut store = backend.session("ns");
        store.persist(key().as_str(), "7").unwrap();

        // no host can map a stack this large
        let builder = std::thread::Builder::new().stack_size(1 << 62);
        match PrefetchWorker::spawn_on(builder, Box::new(store), key(), LockRetry::default()) {
            Err(SpawnFailure {
                store: Some(store),
                error: Error::Spawn(_),
            }) => assert_eq!(read_boundary(&*store, &key()).unwrap(), Some(7)),
            Err(SpawnFailure { error, .. }) => panic!("session lost, error {error}"),
            Ok(_) => panic!("spawn with an unmappable stack succeeded"),
        }
    }

    #[test]
    fn refill_amount_stops_at_next_multiple() {
        assert_eq!(refill_amount(10, 5), 5);
        assert_eq!(refill_amount(0, 5), 5);
        // non-aligned floors only reserve up to the next multiple of step
        assert_eq!(refill_amount(12, 5), 3);
        assert_eq!(refill_amount(17, 5), 3);
        assert_eq!(refill_amount(19, 5), 1);
        assert_eq!(refill_amount(41, 1), 1);
    }

    #[test]
    fn reserve_advances_persisted_boundary() {
        let backend = MemoryBackend::new();
        let mut store = backend.session("ns");
        store.init_lock(key().as_str()).unwrap();
        store.persist(key().as_str(), "10").unwrap();

        let segment = reserve_segment(&mut store, &key(), 5, &LockRetry::default()).unwrap();
        assert_eq!(segment, Segment { floor: 10, ceiling: 15 });
        assert_eq!(store.get(key().as_str()).unwrap().as_deref(), Some("15"));

        store.persist(key().as_str(), "17").unwrap();
        let segment = reserve_segment(&mut store, &key(), 5, &LockRetry::default()).unwrap();
        assert_eq!(segment, Segment { floor: 17, ceiling: 20 });
    }

    #[test]
    fn reserve_reports_missing_boundary() {
        let backend = MemoryBackend::new();
        let mut store = backend.session("ns");
        store.init_lock(key().as_str()).unwrap();

        let refill = reserve_segment(&mut store, &key(), 5, &LockRetry::default());
        assert!(matches!(refill, Err(RefillError::BoundaryMissing { .. })));
        // the lock was released
        let mut other = backend.session("ns");
        other.init_lock(key().as_str()).unwrap();
        assert!(other.try_lock().unwrap());
    }

    #[test]
    fn reserve_rejects_corrupt_and_overflowing_values() {
        let backend = MemoryBackend::new();
        let mut store = backend.session("ns");
        store.init_lock(key().as_str()).unwrap();

        store.persist(key().as_str(), "abc").unwrap();
        assert!(matches!(
            reserve_segment(&mut store, &key(), 5, &LockRetry::default()),
            Err(RefillError::Store(StoreError::CorruptValue { .. }))
        ));

        store.persist(key().as_str(), &(u64::MAX - 1).to_string()).unwrap();
        assert!(matches!(
            reserve_segment(&mut store, &key(), 5, &LockRetry::default()),
            Err(RefillError::Overflow { .. })
        ));
    }

    #[test]
    fn blank_value_reads_as_absent() {
        let backend = MemoryBackend::new();
        let mut store = backend.session("ns");
        store.persist(key().as_str(), "  ").unwrap();
        assert_eq!(read_boundary(&store, &key()).unwrap(), None);
        store.persist(key().as_str(), " 42\n").unwrap();
        assert_eq!(read_boundary(&store, &key()).unwrap(), Some(42));
    }

    #[test]
    fn worker_processes_requests_in_order() {
        let backend = MemoryBackend::new();
        let mut store = backend.session("ns");
        store.init_lock(key().as_str()).unwrap();
        store.persist(key().as_str(), "0").unwrap();

        let worker = PrefetchWorker::spawn(Box::new(store), key(), LockRetry::default()).unwrap();
        for _ in 0..3 {
            worker.submit(PrefetchRequest::Reserve { step: 4 }).unwrap();
        }

        let floors: Vec<u64> = (0..3)
            .map(|_| worker.take(None).unwrap().unwrap().floor)
            .collect();
        assert_eq!(floors, [0, 4, 8]);
        assert_eq!(worker.handoffs(), 3);
    }

    #[test]
    fn worker_holds_second_result_until_first_is_taken() {
        let backend = MemoryBackend::new();
        let mut store = backend.session("ns");
        store.init_lock(key().as_str()).unwrap();
        store.persist(key().as_str(), "0").unwrap();
        let observer = backend.session("ns");

        let worker = PrefetchWorker::spawn(Box::new(store), key(), LockRetry::default()).unwrap();
        worker.submit(PrefetchRequest::Reserve { step: 4 }).unwrap();
        worker.submit(PrefetchRequest::Reserve { step: 4 }).unwrap();
        worker.submit(PrefetchRequest::Reserve { step: 4 }).unwrap();

        // first result sits in the slot, second is reserved but parked in
        // `put`, third has not started
        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        while observer.get(key().as_str()).unwrap().as_deref() != Some("8") {
            assert!(std::time::Instant::now() < deadline, "worker never reserved");
            std::thread::yield_now();
        }
        std::thread::sleep(Duration::from_millis(50));
        assert_eq!(observer.get(key().as_str()).unwrap().as_deref(), Some("8"));
        assert_eq!(worker.handoffs(), 0);

        assert_eq!(worker.take(None).unwrap().unwrap().floor, 0);
        assert_eq!(worker.take(None).unwrap().unwrap().floor, 4);
        assert_eq!(worker.take(None).unwrap().unwrap().floor, 8);
        assert_eq!(observer.get(key().as_str()).unwrap().as_deref(), Some("12"));
    }

    #[test]
    fn dropping_handle_stops_worker() {
        let backend = MemoryBackend::new();
        let mut store = backend.session("ns");
        store.init_lock(key().as_str()).unwrap();
        store.persist(key().as_str(), "0").unwrap();
        let observer = backend.session("ns");

        let worker = PrefetchWorker::spawn(Box::new(store), key(), LockRetry::default()).unwrap();
        for _ in 0..4 {
            worker.submit(PrefetchRequest::Reserve { step: 4 }).unwrap();
        }
        drop(worker);

        // at most one result in the slot and one parked producer; the worker
        // gives up on the first failed put
        std::thread::sleep(Duration::from_millis(100));
        let persisted = observer.get(key().as_str()).unwrap().unwrap();
        assert!(
            ["0", "4", "8"].contains(&persisted.as_str()),
            "worker kept reserving after drop: {persisted}"
        );
    }
}
