//! Pipeline wiring: Adapter → Bus → Dispatcher → Correlation → Echo → Store.
//!
//! Data flows one direction. The pipeline is the dispatcher's sole internal
//! consumer: each flushed batch is enriched, stale events are dropped, text
//! deltas pass echo suppression, surviving events mutate the part store,
//! and the enriched batch goes out to external batch subscribers.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use log::{debug, trace};
use stream_source::{
    BusEvent, EventPayload, EventSink, RunId, SessionId, SourceBinding,
};

use crate::bus::EventBus;
use crate::config::PipelineConfig;
use crate::correlate::{CorrelationService, Disposition, EnrichedEvent};
use crate::dispatch::{BatchDispatcher, DispatchCounters};
use crate::echo::EchoSuppressor;
use crate::part::Part;
use crate::store::{DocumentStore, UsageTotals};

/// Token identifying one registered enriched-batch subscriber.
pub type BatchSubscriptionId = u64;

type BatchSubscriber = Arc<dyn Fn(&[EnrichedEvent]) + Send + Sync>;

/// Correlation, echo suppression, and the part store share one logical
/// owner: batches mutate them strictly in flush order.
struct Shared {
    correlation: CorrelationService,
    echo: EchoSuppressor,
    store: DocumentStore,
}

/// The assembled ingestion pipeline.
pub struct Pipeline {
    bus: Arc<EventBus>,
    dispatcher: Arc<BatchDispatcher>,
    shared: Arc<Mutex<Shared>>,
    subscribers: Arc<Mutex<Vec<(BatchSubscriptionId, BatchSubscriber)>>>,
    next_subscriber_id: AtomicU64,
    adapters: Mutex<Vec<Box<dyn SourceBinding>>>,
}

impl Pipeline {
    /// Builds a pipeline whose dispatcher flushes on a timer at the
    /// configured cadence.
    #[must_use]
    pub fn new(config: PipelineConfig) -> Self {
        let dispatcher = Arc::new(BatchDispatcher::start(config.flush_interval));
        Self::assemble(config, dispatcher)
    }

    /// Builds a pipeline without a flush timer; callers drive `flush_now`.
    /// For headless hosts and tests.
    #[must_use]
    pub fn headless(config: PipelineConfig) -> Self {
        let dispatcher = Arc::new(BatchDispatcher::manual());
        Self::assemble(config, dispatcher)
    }

    fn assemble(config: PipelineConfig, dispatcher: Arc<BatchDispatcher>) -> Self {
        let bus = Arc::new(EventBus::new());
        let shared = Arc::new(Mutex::new(Shared {
            correlation: CorrelationService::new(),
            echo: EchoSuppressor::new(),
            store: DocumentStore::new(),
        }));
        let subscribers: Arc<Mutex<Vec<(BatchSubscriptionId, BatchSubscriber)>>> =
            Arc::new(Mutex::new(Vec::new()));

        let dispatcher_for_bus = Arc::clone(&dispatcher);
        bus.subscribe_all(move |event| dispatcher_for_bus.enqueue(event.clone()));

        if config.debug_log {
            let preview_chars = config.preview_chars;
            bus.subscribe_all(move |event| log_event(event, preview_chars));
        }

        let shared_for_batches = Arc::clone(&shared);
        let subscribers_for_batches = Arc::clone(&subscribers);
        dispatcher.subscribe_batches(move |batch| {
            process_batch(&shared_for_batches, &subscribers_for_batches, batch);
        });

        Self {
            bus,
            dispatcher,
            shared,
            subscribers,
            next_subscriber_id: AtomicU64::new(0),
            adapters: Mutex::new(Vec::new()),
        }
    }

    /// The bus backing this pipeline. Orchestrators publish agent and task
    /// events here using the same taxonomy as the adapters.
    #[must_use]
    pub fn bus(&self) -> Arc<EventBus> {
        Arc::clone(&self.bus)
    }

    /// The bus as an adapter-facing sink.
    #[must_use]
    pub fn sink(&self) -> Arc<dyn EventSink> {
        Arc::clone(&self.bus) as Arc<dyn EventSink>
    }

    /// Declares the active run; events tagged with any other run are
    /// enriched but dropped. Clears echo state for the new run.
    pub fn register_run(&self, run_id: RunId, session_id: SessionId) {
        let mut shared = self.lock_shared();
        shared.correlation.register_run(run_id, session_id);
        shared.echo.reset();
    }

    /// Takes ownership of a started adapter binding for the active run.
    pub fn attach(&self, binding: Box<dyn SourceBinding>) {
        lock_unpoisoned(&self.adapters).push(binding);
    }

    /// Cancels the active run: disposes every bound adapter, then advances
    /// the run marker so anything still in flight is dropped during
    /// enrichment.
    pub fn cancel_active_run(&self) {
        let mut adapters = std::mem::take(&mut *lock_unpoisoned(&self.adapters));
        for binding in &mut adapters {
            binding.dispose();
        }

        let mut shared = self.lock_shared();
        shared.correlation.reset();
        shared.echo.reset();
    }

    /// Registers text the backend is expected to echo back after a tool
    /// result; matching deltas are suppressed.
    pub fn expect_echo(&self, text: impl Into<String>) {
        self.lock_shared().echo.expect_echo(text);
    }

    /// Registers a consumer receiving one enriched, coalesced batch per
    /// flush tick.
    pub fn subscribe_batches(
        &self,
        consumer: impl Fn(&[EnrichedEvent]) + Send + Sync + 'static,
    ) -> BatchSubscriptionId {
        let id = self.next_subscriber_id.fetch_add(1, Ordering::SeqCst);
        lock_unpoisoned(&self.subscribers).push((id, Arc::new(consumer)));
        id
    }

    /// Removes a batch consumer. Unknown ids are a no-op.
    pub fn unsubscribe_batches(&self, id: BatchSubscriptionId) {
        lock_unpoisoned(&self.subscribers).retain(|(existing, _)| *existing != id);
    }

    /// Cloned, ordered parts of one message for rendering.
    #[must_use]
    pub fn snapshot(&self, run_id: RunId) -> Option<Vec<Part>> {
        self.lock_shared().store.snapshot(run_id)
    }

    /// Latest usage snapshot recorded for one message.
    #[must_use]
    pub fn usage(&self, run_id: RunId) -> Option<UsageTotals> {
        self.lock_shared()
            .store
            .message(run_id)
            .and_then(|message| message.usage())
    }

    /// Dispatcher throughput counters.
    #[must_use]
    pub fn counters(&self) -> DispatchCounters {
        self.dispatcher.counters()
    }

    /// Flushes the current window immediately. Headless escape hatch; the
    /// timer calls this on cadence in `Pipeline::new` mode.
    pub fn flush_now(&self) -> usize {
        self.dispatcher.flush_now()
    }

    /// Stops the flush timer and disposes any still-bound adapters.
    pub fn shutdown(&self) {
        let mut adapters = std::mem::take(&mut *lock_unpoisoned(&self.adapters));
        for binding in &mut adapters {
            binding.dispose();
        }
        self.dispatcher.shutdown();
    }

    fn lock_shared(&self) -> MutexGuard<'_, Shared> {
        lock_unpoisoned(&self.shared)
    }
}

impl Drop for Pipeline {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn process_batch(
    shared: &Arc<Mutex<Shared>>,
    subscribers: &Arc<Mutex<Vec<(BatchSubscriptionId, BatchSubscriber)>>>,
    batch: &[BusEvent],
) {
    let enriched_batch = {
        let mut shared = lock_unpoisoned(shared);
        let mut out = Vec::with_capacity(batch.len());

        for event in batch {
            let mut enriched = shared.correlation.enrich(event.clone());
            if enriched.disposition == Disposition::StaleRun {
                trace!(
                    "dropping stale {:?} event for run {}",
                    enriched.event.kind(),
                    enriched.event.run_id
                );
                continue;
            }

            if let EventPayload::TextDelta { delta } = &enriched.event.payload {
                let forwarded = shared.echo.filter_delta(delta);
                if forwarded.is_empty() {
                    // Withheld by echo suppression; nothing to render yet.
                    continue;
                }
                let rewritten = forwarded != *delta;
                if rewritten {
                    enriched.event.payload = EventPayload::TextDelta { delta: forwarded };
                }
            }

            shared.store.apply(&enriched);
            out.push(enriched);
        }

        out
    };

    if enriched_batch.is_empty() {
        return;
    }

    // Deliver outside the shared lock so subscribers can read snapshots.
    let subscribers: Vec<BatchSubscriber> = lock_unpoisoned(subscribers)
        .iter()
        .map(|(_, subscriber)| Arc::clone(subscriber))
        .collect();
    for subscriber in subscribers {
        let outcome = catch_unwind(AssertUnwindSafe(|| subscriber(&enriched_batch)));
        if outcome.is_err() {
            log::error!("batch subscriber panicked; continuing delivery");
        }
    }
}

/// Debug hook body: one line per event with a truncated payload preview.
fn log_event(event: &BusEvent, preview_chars: usize) {
    let rendered = serde_json::to_string(&event.payload)
        .unwrap_or_else(|_| "<unrenderable payload>".to_string());
    let preview: String = rendered.chars().take(preview_chars).collect();
    let ellipsis = if rendered.chars().count() > preview_chars {
        "…"
    } else {
        ""
    };
    debug!(
        "[{}] {:?} run={} {preview}{ellipsis}",
        event.timestamp_ms,
        event.kind(),
        event.run_id
    );
}

fn lock_unpoisoned<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use serde_json::json;
    use stream_source::{
        BusEvent, EventKind, EventPayload, SessionId, ToolOutcome,
    };

    use super::Pipeline;
    use crate::config::PipelineConfig;
    use crate::correlate::EnrichedEvent;
    use crate::part::Part;

    const RUN: u64 = 1;

    fn pipeline() -> (Pipeline, SessionId) {
        let pipeline = Pipeline::headless(PipelineConfig::default());
        let session = SessionId::new();
        pipeline.register_run(RUN, session);
        (pipeline, session)
    }

    fn publish(pipeline: &Pipeline, session: SessionId, run: u64, payload: EventPayload) {
        pipeline
            .bus()
            .publish(BusEvent::new(session, run, payload))
            .expect("event publishes");
    }

    fn collecting_subscriber(pipeline: &Pipeline) -> Arc<Mutex<Vec<Vec<EnrichedEvent>>>> {
        let batches = Arc::new(Mutex::new(Vec::new()));
        let batches_in_subscriber = Arc::clone(&batches);
        pipeline.subscribe_batches(move |batch| {
            batches_in_subscriber
                .lock()
                .expect("batches lock")
                .push(batch.to_vec());
        });
        batches
    }

    #[test]
    fn published_events_reach_store_and_subscribers_after_flush() {
        let (pipeline, session) = pipeline();
        let batches = collecting_subscriber(&pipeline);

        publish(&pipeline, session, RUN, EventPayload::TextDelta {
            delta: "hello".to_string(),
        });
        assert!(pipeline.snapshot(RUN).is_none());

        pipeline.flush_now();

        let parts = pipeline.snapshot(RUN).expect("message exists");
        assert!(matches!(&parts[0], Part::Text(text) if text.content == "hello"));
        assert_eq!(batches.lock().expect("batches lock").len(), 1);
    }

    #[test]
    fn tool_completions_coalesce_within_one_window() {
        let (pipeline, session) = pipeline();
        let batches = collecting_subscriber(&pipeline);

        publish(&pipeline, session, RUN, EventPayload::ToolStart {
            tool_id: "call_1".to_string(),
            tool_name: "read".to_string(),
            arguments: json!({}),
            owner_agent_id: None,
            supersedes: None,
        });
        for output in ["first", "second", "third"] {
            publish(&pipeline, session, RUN, EventPayload::ToolComplete {
                tool_id: "call_1".to_string(),
                outcome: ToolOutcome::Completed,
                output: json!(output),
                supersedes: None,
            });
        }
        pipeline.flush_now();

        let batches = batches.lock().expect("batches lock");
        let completions: Vec<_> = batches[0]
            .iter()
            .filter(|enriched| enriched.event.kind() == EventKind::ToolComplete)
            .collect();
        assert_eq!(completions.len(), 1);
        match &completions[0].event.payload {
            EventPayload::ToolComplete { output, .. } => assert_eq!(output, &json!("third")),
            other => panic!("expected tool completion, got {other:?}"),
        }
        assert_eq!(pipeline.counters().coalesced, 2);
    }

    #[test]
    fn stale_run_events_are_dropped_before_the_store() {
        let (pipeline, session) = pipeline();
        let batches = collecting_subscriber(&pipeline);

        publish(&pipeline, session, RUN + 1, EventPayload::TextDelta {
            delta: "stale".to_string(),
        });
        pipeline.flush_now();

        assert!(pipeline.snapshot(RUN + 1).is_none());
        assert!(batches.lock().expect("batches lock").is_empty());
    }

    #[test]
    fn register_run_supersedes_the_previous_run() {
        let (pipeline, session) = pipeline();

        publish(&pipeline, session, RUN, EventPayload::TextDelta {
            delta: "from run 1".to_string(),
        });
        pipeline.register_run(RUN + 1, session);
        pipeline.flush_now();

        // The run-1 delta was still queued but is stale by flush time.
        assert!(pipeline.snapshot(RUN).is_none());
    }

    #[test]
    fn echo_suppression_rewrites_text_deltas() {
        let (pipeline, session) = pipeline();
        let batches = collecting_subscriber(&pipeline);
        pipeline.expect_echo("Hello world");

        for delta in ["Hel", "lo wor"] {
            publish(&pipeline, session, RUN, EventPayload::TextDelta {
                delta: delta.to_string(),
            });
        }
        pipeline.flush_now();
        assert!(pipeline.snapshot(RUN).is_none());
        assert!(batches.lock().expect("batches lock").is_empty());

        publish(&pipeline, session, RUN, EventPayload::TextDelta {
            delta: "ld! Extra.".to_string(),
        });
        pipeline.flush_now();

        let parts = pipeline.snapshot(RUN).expect("message exists");
        assert!(matches!(&parts[0], Part::Text(text) if text.content == "! Extra."));
    }

    #[test]
    fn usage_is_exposed_per_message() {
        let (pipeline, session) = pipeline();

        publish(&pipeline, session, RUN, EventPayload::Usage {
            input_tokens: 12,
            output_tokens: 3,
        });
        pipeline.flush_now();

        let usage = pipeline.usage(RUN).expect("usage recorded");
        assert_eq!(usage.input_tokens, 12);
    }

    #[test]
    fn unsubscribed_batch_consumer_stops_receiving() {
        let (pipeline, session) = pipeline();
        let batches = Arc::new(Mutex::new(Vec::new()));
        let batches_in_subscriber = Arc::clone(&batches);
        let id = pipeline.subscribe_batches(move |batch| {
            batches_in_subscriber
                .lock()
                .expect("batches lock")
                .push(batch.to_vec());
        });

        publish(&pipeline, session, RUN, EventPayload::TextDelta {
            delta: "seen".to_string(),
        });
        pipeline.flush_now();
        pipeline.unsubscribe_batches(id);
        publish(&pipeline, session, RUN, EventPayload::TextDelta {
            delta: "unseen".to_string(),
        });
        pipeline.flush_now();

        assert_eq!(batches.lock().expect("batches lock").len(), 1);
    }

    #[test]
    fn subscribers_can_read_snapshots_during_delivery() {
        let (pipeline, session) = pipeline();
        let pipeline = Arc::new(pipeline);
        let observed = Arc::new(Mutex::new(Vec::new()));

        let pipeline_in_subscriber = Arc::clone(&pipeline);
        let observed_in_subscriber = Arc::clone(&observed);
        pipeline.subscribe_batches(move |_| {
            let parts = pipeline_in_subscriber.snapshot(RUN);
            observed_in_subscriber
                .lock()
                .expect("observed lock")
                .push(parts.is_some());
        });

        publish(&pipeline, session, RUN, EventPayload::TextDelta {
            delta: "hello".to_string(),
        });
        pipeline.flush_now();

        assert_eq!(*observed.lock().expect("observed lock"), vec![true]);
    }
}
