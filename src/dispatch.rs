//! Batch dispatcher: buffers published events and flushes them to batch
//! consumers at a fixed cadence.
//!
//! Two buffers swap on flush so the hot path never allocates. Coalescible
//! events overwrite their queued slot (last write wins, first-seen position
//! kept) so per-frame work stays bounded under bursty state updates.

use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use log::error;
use stream_source::BusEvent;

use crate::coalesce::{coalesce_key, CoalesceKey};

/// Default flush cadence, aligned to a ~60 Hz redraw budget.
pub const DEFAULT_FLUSH_INTERVAL: Duration = Duration::from_millis(16);

/// Token identifying one registered batch consumer.
pub type BatchConsumerId = u64;

type BatchConsumer = Arc<dyn Fn(&[BusEvent]) + Send + Sync>;

/// Monotonic counters describing dispatcher throughput.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DispatchCounters {
    /// Events accepted by `enqueue`.
    pub enqueued: u64,
    /// Events overwritten by a later same-key event in the same window.
    pub coalesced: u64,
    /// Events handed to at least one consumer.
    pub delivered: u64,
    /// Events flushed while no consumer was registered.
    pub dropped: u64,
    /// Flush passes executed, including empty ones.
    pub flushes: u64,
}

#[derive(Default)]
struct Window {
    queue: Vec<BusEvent>,
    spare: Vec<BusEvent>,
    index: HashMap<CoalesceKey, usize>,
}

#[derive(Default)]
struct Counters {
    enqueued: AtomicU64,
    coalesced: AtomicU64,
    delivered: AtomicU64,
    dropped: AtomicU64,
    flushes: AtomicU64,
}

struct DispatcherInner {
    window: Mutex<Window>,
    consumers: Mutex<Vec<(BatchConsumerId, BatchConsumer)>>,
    next_consumer_id: AtomicU64,
    counters: Counters,
    shutdown: AtomicBool,
}

/// Frame-batching stage between the bus and enrichment.
pub struct BatchDispatcher {
    inner: Arc<DispatcherInner>,
    timer: Mutex<Option<JoinHandle<()>>>,
}

impl BatchDispatcher {
    /// Creates a dispatcher with a timer thread flushing every `interval`.
    #[must_use]
    pub fn start(interval: Duration) -> Self {
        let dispatcher = Self::manual();
        let inner = Arc::clone(&dispatcher.inner);
        let timer = thread::Builder::new()
            .name("stream-loom-flush".to_string())
            .spawn(move || {
                while !inner.shutdown.load(Ordering::SeqCst) {
                    thread::sleep(interval);
                    if inner.shutdown.load(Ordering::SeqCst) {
                        break;
                    }
                    flush(&inner);
                }
            });

        match timer {
            Ok(handle) => {
                *lock_unpoisoned(&dispatcher.timer) = Some(handle);
            }
            Err(spawn_error) => {
                // Without a timer the dispatcher still works through
                // flush_now; callers in degraded environments keep going.
                error!("failed to spawn flush timer thread: {spawn_error}");
            }
        }

        dispatcher
    }

    /// Creates a dispatcher with no timer thread; flushing is driven by
    /// `flush_now`. For headless hosts and tests.
    #[must_use]
    pub fn manual() -> Self {
        Self {
            inner: Arc::new(DispatcherInner {
                window: Mutex::new(Window::default()),
                consumers: Mutex::new(Vec::new()),
                next_consumer_id: AtomicU64::new(0),
                counters: Counters::default(),
                shutdown: AtomicBool::new(false),
            }),
            timer: Mutex::new(None),
        }
    }

    /// Buffers one event for the current window.
    ///
    /// Coalescible events replace the queued event for their key; the slot
    /// keeps its first-seen position so flush order remains the order
    /// entities first changed within the window.
    pub fn enqueue(&self, event: BusEvent) {
        self.inner.counters.enqueued.fetch_add(1, Ordering::Relaxed);

        let key = coalesce_key(&event);
        let mut window = lock_unpoisoned(&self.inner.window);
        match key {
            Some(key) => {
                if let Some(&slot) = window.index.get(&key) {
                    window.queue[slot] = event;
                    self.inner.counters.coalesced.fetch_add(1, Ordering::Relaxed);
                } else {
                    let slot = window.queue.len();
                    window.index.insert(key, slot);
                    window.queue.push(event);
                }
            }
            None => window.queue.push(event),
        }
    }

    /// Flushes the current window immediately, returning how many events
    /// were handed to consumers (or dropped when none are registered).
    ///
    /// The timer calls this on cadence; headless hosts call it directly,
    /// the same escape hatch the runtime controller gives non-ticking
    /// environments.
    pub fn flush_now(&self) -> usize {
        flush(&self.inner)
    }

    /// Registers a consumer receiving one batch per flush.
    pub fn subscribe_batches(
        &self,
        consumer: impl Fn(&[BusEvent]) + Send + Sync + 'static,
    ) -> BatchConsumerId {
        let id = self.inner.next_consumer_id.fetch_add(1, Ordering::SeqCst);
        lock_unpoisoned(&self.inner.consumers).push((id, Arc::new(consumer)));
        id
    }

    /// Removes a consumer. Unknown ids are a no-op.
    pub fn unsubscribe_batches(&self, id: BatchConsumerId) {
        lock_unpoisoned(&self.inner.consumers).retain(|(existing, _)| *existing != id);
    }

    /// Snapshot of the throughput counters.
    #[must_use]
    pub fn counters(&self) -> DispatchCounters {
        DispatchCounters {
            enqueued: self.inner.counters.enqueued.load(Ordering::Relaxed),
            coalesced: self.inner.counters.coalesced.load(Ordering::Relaxed),
            delivered: self.inner.counters.delivered.load(Ordering::Relaxed),
            dropped: self.inner.counters.dropped.load(Ordering::Relaxed),
            flushes: self.inner.counters.flushes.load(Ordering::Relaxed),
        }
    }

    /// Stops the timer thread. Idempotent; `flush_now` keeps working.
    pub fn shutdown(&self) {
        self.inner.shutdown.store(true, Ordering::SeqCst);
        if let Some(handle) = lock_unpoisoned(&self.timer).take() {
            if handle.thread().id() != thread::current().id() {
                let _ = handle.join();
            }
        }
    }
}

impl Drop for BatchDispatcher {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn flush(inner: &DispatcherInner) -> usize {
    inner.counters.flushes.fetch_add(1, Ordering::Relaxed);

    let mut batch = {
        let mut window = lock_unpoisoned(&inner.window);
        if window.queue.is_empty() {
            return 0;
        }

        // Swap buffers so enqueue keeps filling the (empty) front buffer
        // while this flush walks the back buffer without holding the lock.
        let spare = std::mem::take(&mut window.spare);
        let batch = std::mem::replace(&mut window.queue, spare);
        window.index.clear();
        batch
    };

    let consumers: Vec<BatchConsumer> = lock_unpoisoned(&inner.consumers)
        .iter()
        .map(|(_, consumer)| Arc::clone(consumer))
        .collect();

    let flushed = batch.len();
    if consumers.is_empty() {
        inner
            .counters
            .dropped
            .fetch_add(flushed as u64, Ordering::Relaxed);
    } else {
        for consumer in consumers {
            let outcome = catch_unwind(AssertUnwindSafe(|| consumer(&batch)));
            if outcome.is_err() {
                error!("batch consumer panicked; continuing delivery");
            }
        }
        inner
            .counters
            .delivered
            .fetch_add(flushed as u64, Ordering::Relaxed);
    }

    // Hand the (cleared) buffer back so the next flush reuses its capacity.
    batch.clear();
    lock_unpoisoned(&inner.window).spare = batch;

    flushed
}

fn lock_unpoisoned<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}
