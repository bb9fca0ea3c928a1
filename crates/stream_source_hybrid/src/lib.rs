//! Hybrid adapter: consumes a replayable sequenced channel and a secondary
//! callback channel concurrently, republishing both.
//!
//! The replay channel may drop mid-stream; the worker reconnects with the
//! last seen sequence number and skips any frames replayed from before it,
//! so resume overlap never duplicates events. The secondary channel runs on
//! the source's own context, sharing one translator with the worker.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::RecvTimeoutError;
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use log::warn;
use stream_source::{
    CancelSignal, EventSink, HybridSource, LifecyclePublisher, ReplayItem, SourceBinding,
    SourceContext, SourceError, SourceUnit, UnitTranslator,
};

/// Consecutive unexplained channel drops tolerated before giving up.
const MAX_RECONNECTS: usize = 3;

/// Poll granularity for the replay receiver; bounds how long disposal
/// waits on an idle connection.
const RECV_POLL: Duration = Duration::from_millis(20);

/// Starts the hybrid consumer for `handle`. The returned binding owns the
/// worker and must be disposed when the run ends.
pub fn start<S: HybridSource>(
    mut handle: S,
    sink: Arc<dyn EventSink>,
    context: SourceContext,
) -> Result<HybridBinding, String> {
    let cancel: CancelSignal = Arc::new(AtomicBool::new(false));
    let publisher = Arc::new(LifecyclePublisher::new(sink, context.clone()));
    let translator = Arc::new(Mutex::new(UnitTranslator::new(context.clone())));

    handle.set_side_listener(side_listener(&cancel, &translator, &publisher));
    publisher.started();

    let worker_publisher = Arc::clone(&publisher);
    let worker_cancel = Arc::clone(&cancel);
    let worker_translator = Arc::clone(&translator);
    let worker = thread::Builder::new()
        .name(format!("hybrid-source-{}", context.source_id))
        .spawn(move || {
            run_replay_loop(
                handle,
                &worker_translator,
                &worker_publisher,
                &worker_cancel,
            );
        })
        .map_err(|error| {
            let message = format!("failed to spawn hybrid worker: {error}");
            publisher.errored(message.clone());
            message
        })?;

    Ok(HybridBinding {
        cancel,
        publisher,
        worker: Some(worker),
        disposed: false,
    })
}

fn side_listener(
    cancel: &CancelSignal,
    translator: &Arc<Mutex<UnitTranslator>>,
    publisher: &Arc<LifecyclePublisher>,
) -> Box<dyn FnMut(SourceUnit) + Send> {
    let cancel = Arc::clone(cancel);
    let translator = Arc::clone(translator);
    let publisher = Arc::clone(publisher);
    Box::new(move |unit| {
        if cancel.load(Ordering::SeqCst) {
            return;
        }
        let event = lock_unpoisoned(&translator).translate(unit);
        if let Some(event) = event {
            publisher.publish_event(event);
        }
    })
}

enum ReplayEnd {
    Ended,
    Aborted,
    Failed(String),
}

fn run_replay_loop<S: HybridSource>(
    mut handle: S,
    translator: &Arc<Mutex<UnitTranslator>>,
    publisher: &LifecyclePublisher,
    cancel: &CancelSignal,
) {
    let outcome = catch_unwind(AssertUnwindSafe(|| {
        consume_replay(&mut handle, translator, publisher, cancel)
    }));

    // The handle owns the side listener; drop it before the handle goes
    // away so late side events cannot observe a half-torn-down source.
    handle.clear_side_listener();

    match outcome {
        Ok(ReplayEnd::Ended) => {
            publisher.ended();
        }
        Ok(ReplayEnd::Aborted) => {
            publisher.aborted();
        }
        Ok(ReplayEnd::Failed(message)) => {
            publisher.errored(message);
        }
        Err(_) => {
            publisher.errored("hybrid source panicked");
        }
    }
}

fn consume_replay<S: HybridSource>(
    handle: &mut S,
    translator: &Arc<Mutex<UnitTranslator>>,
    publisher: &LifecyclePublisher,
    cancel: &CancelSignal,
) -> ReplayEnd {
    let mut last_seq: Option<u64> = None;
    let mut reconnects = 0usize;

    loop {
        if cancel.load(Ordering::SeqCst) {
            return ReplayEnd::Aborted;
        }

        let frames = match handle.connect(last_seq) {
            Ok(frames) => frames,
            Err(SourceError::Cancelled) => return ReplayEnd::Aborted,
            Err(error) => return ReplayEnd::Failed(error.to_string()),
        };

        loop {
            if cancel.load(Ordering::SeqCst) {
                return ReplayEnd::Aborted;
            }

            match frames.recv_timeout(RECV_POLL) {
                Ok(ReplayItem::Frame(seq, unit)) => {
                    // Resume may replay frames the consumer already saw.
                    if last_seq.is_some_and(|seen| seq <= seen) {
                        continue;
                    }
                    last_seq = Some(seq);
                    reconnects = 0;
                    let event = lock_unpoisoned(translator).translate(unit);
                    if let Some(event) = event {
                        publisher.publish_event(event);
                    }
                }
                Ok(ReplayItem::Completed) => return ReplayEnd::Ended,
                Ok(ReplayItem::Failed(message)) => return ReplayEnd::Failed(message),
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => {
                    reconnects += 1;
                    if reconnects > MAX_RECONNECTS {
                        return ReplayEnd::Failed(
                            "replay channel dropped repeatedly without completing".to_string(),
                        );
                    }
                    break;
                }
            }
        }
    }
}

/// Running hybrid adapter bound to one handle.
pub struct HybridBinding {
    cancel: CancelSignal,
    publisher: Arc<LifecyclePublisher>,
    worker: Option<JoinHandle<()>>,
    disposed: bool,
}

impl SourceBinding for HybridBinding {
    fn dispose(&mut self) {
        if self.disposed {
            return;
        }
        self.disposed = true;

        self.cancel.store(true, Ordering::SeqCst);

        if let Some(worker) = self.worker.take() {
            if worker.thread().id() != thread::current().id() && worker.join().is_err() {
                warn!("hybrid worker panicked during disposal");
            }
        }

        if !self.publisher.is_terminal() {
            self.publisher.aborted();
        }
    }

    fn is_disposed(&self) -> bool {
        self.disposed
    }
}

fn lock_unpoisoned<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}
