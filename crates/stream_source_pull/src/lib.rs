//! Pull-loop adapter: drives a lazy pull handle on its own worker thread,
//! publishing translated events until completion or disposal.
//!
//! The worker asks the handle for the next unit in a loop; the handle's
//! contract makes the pull return promptly once the shared cancel flag is
//! set, so disposal interrupts an in-flight pull without dangling state.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use log::warn;
use stream_source::{
    CancelSignal, EventSink, LifecyclePublisher, PullSource, SourceBinding, SourceContext,
    SourceError, UnitTranslator,
};

/// Starts the pull loop for `handle`. The returned binding owns the worker
/// and must be disposed when the run ends.
pub fn start<S: PullSource>(
    handle: S,
    sink: Arc<dyn EventSink>,
    context: SourceContext,
) -> Result<PullBinding, String> {
    let cancel: CancelSignal = Arc::new(AtomicBool::new(false));
    let publisher = Arc::new(LifecyclePublisher::new(sink, context.clone()));
    let translator = UnitTranslator::new(context.clone());

    let worker_publisher = Arc::clone(&publisher);
    let worker_cancel = Arc::clone(&cancel);
    let worker = thread::Builder::new()
        .name(format!("pull-source-{}", context.source_id))
        .spawn(move || run_pull_loop(handle, translator, &worker_publisher, &worker_cancel))
        .map_err(|error| {
            let message = format!("failed to spawn pull worker: {error}");
            publisher.errored(message.clone());
            message
        })?;

    Ok(PullBinding {
        cancel,
        publisher,
        worker: Some(worker),
        disposed: false,
    })
}

enum PullEnd {
    Ended,
    Aborted,
    Failed(String),
}

fn run_pull_loop<S: PullSource>(
    mut handle: S,
    mut translator: UnitTranslator,
    publisher: &LifecyclePublisher,
    cancel: &CancelSignal,
) {
    publisher.started();

    let outcome = catch_unwind(AssertUnwindSafe(|| loop {
        if cancel.load(Ordering::SeqCst) {
            return PullEnd::Aborted;
        }

        match handle.next_unit(cancel) {
            Ok(Some(unit)) => {
                if let Some(event) = translator.translate(unit) {
                    publisher.publish_event(event);
                }
            }
            Ok(None) => return PullEnd::Ended,
            Err(SourceError::Cancelled) => return PullEnd::Aborted,
            Err(error) => return PullEnd::Failed(error.to_string()),
        }
    }));

    match outcome {
        Ok(PullEnd::Ended) => {
            publisher.ended();
        }
        Ok(PullEnd::Aborted) => {
            publisher.aborted();
        }
        Ok(PullEnd::Failed(message)) => {
            publisher.errored(message);
        }
        Err(_) => {
            publisher.errored("pull source panicked");
        }
    }
}

/// Running pull adapter bound to one handle.
pub struct PullBinding {
    cancel: CancelSignal,
    publisher: Arc<LifecyclePublisher>,
    worker: Option<JoinHandle<()>>,
    disposed: bool,
}

impl SourceBinding for PullBinding {
    fn dispose(&mut self) {
        if self.disposed {
            return;
        }
        self.disposed = true;

        // The flag is set, never cleared: an error path racing this
        // disposal always reads a coherent cancellation state.
        self.cancel.store(true, Ordering::SeqCst);

        if let Some(worker) = self.worker.take() {
            if worker.thread().id() != thread::current().id() && worker.join().is_err() {
                warn!("pull worker panicked during disposal");
            }
        }

        // Every worker exit path publishes a terminal event; this covers a
        // worker that never ran at all.
        if !self.publisher.is_terminal() {
            self.publisher.aborted();
        }
    }

    fn is_disposed(&self) -> bool {
        self.disposed
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use serde_json::json;
    use stream_source::{
        EventKind, EventSink, SessionId, SourceBinding, SourceContext, SourceError, SourceUnit,
        ToolOutcome,
    };
    use stream_source_mock::{PullStep, RecordingSink, ScriptedPullSource};

    use super::start;

    fn context() -> SourceContext {
        SourceContext::new(SessionId::new(), 1, "pull-1")
    }

    fn wait_for_terminal(sink: &RecordingSink) {
        assert!(
            sink.wait_until(Duration::from_secs(2), |events| {
                events.iter().any(|event| event.payload.is_terminal_lifecycle())
            }),
            "adapter did not publish a terminal lifecycle event"
        );
    }

    #[test]
    fn completed_script_publishes_start_units_then_end() {
        let sink = RecordingSink::new();
        let source = ScriptedPullSource::new(vec![
            PullStep::Unit(SourceUnit::Text {
                delta: "Hello ".to_string(),
            }),
            PullStep::Unit(SourceUnit::Text {
                delta: "world".to_string(),
            }),
        ]);

        let mut binding = start(
            source,
            sink.clone() as std::sync::Arc<dyn EventSink>,
            context(),
        )
        .expect("pull adapter starts");
        wait_for_terminal(&sink);
        binding.dispose();

        let kinds = sink.kinds();
        assert_eq!(kinds.first(), Some(&EventKind::LifecycleStart));
        assert_eq!(kinds.last(), Some(&EventKind::LifecycleEnd));
        assert_eq!(
            kinds
                .iter()
                .filter(|kind| **kind == EventKind::TextDelta)
                .count(),
            2
        );
        assert_eq!(sink.terminal_count(), 1);
    }

    #[test]
    fn tool_units_round_trip_through_translation() {
        let sink = RecordingSink::new();
        let source = ScriptedPullSource::new(vec![
            PullStep::Unit(SourceUnit::ToolStarted {
                call_id: None,
                tool_name: "read".to_string(),
                arguments: json!({ "path": "src/lib.rs" }),
                owner_agent_id: None,
            }),
            PullStep::Unit(SourceUnit::ToolFinished {
                call_id: "call_1".to_string(),
                tool_name: "read".to_string(),
                outcome: ToolOutcome::Completed,
                output: json!("contents"),
            }),
        ]);

        let mut binding = start(
            source,
            sink.clone() as std::sync::Arc<dyn EventSink>,
            context(),
        )
        .expect("pull adapter starts");
        wait_for_terminal(&sink);
        binding.dispose();

        let kinds = sink.kinds();
        assert!(kinds.contains(&EventKind::ToolStart));
        assert!(kinds.contains(&EventKind::ToolComplete));
    }

    #[test]
    fn failing_handle_surfaces_as_lifecycle_error() {
        let sink = RecordingSink::new();
        let source = ScriptedPullSource::new(vec![
            PullStep::Unit(SourceUnit::Text {
                delta: "partial".to_string(),
            }),
            PullStep::Fail(SourceError::Transport("socket dropped".to_string())),
        ]);

        let mut binding = start(
            source,
            sink.clone() as std::sync::Arc<dyn EventSink>,
            context(),
        )
        .expect("pull adapter starts");
        wait_for_terminal(&sink);
        binding.dispose();

        assert_eq!(sink.kinds().last(), Some(&EventKind::LifecycleError));
        assert_eq!(sink.terminal_count(), 1);
    }

    #[test]
    fn dispose_interrupts_an_in_flight_pull_promptly() {
        let sink = RecordingSink::new();
        let source = ScriptedPullSource::new(vec![
            PullStep::Unit(SourceUnit::Text {
                delta: "before block".to_string(),
            }),
            PullStep::BlockUntilCancel,
            PullStep::Unit(SourceUnit::Text {
                delta: "never delivered".to_string(),
            }),
        ]);

        let mut binding = start(
            source,
            sink.clone() as std::sync::Arc<dyn EventSink>,
            context(),
        )
        .expect("pull adapter starts");
        assert!(sink.wait_until(Duration::from_secs(2), |events| {
            events
                .iter()
                .any(|event| event.kind() == EventKind::TextDelta)
        }));

        binding.dispose();
        assert!(binding.is_disposed());

        let kinds = sink.kinds();
        assert_eq!(kinds.last(), Some(&EventKind::LifecycleAbort));
        assert_eq!(sink.terminal_count(), 1);

        // Nothing publishes after disposal returns.
        let count_after_dispose = sink.events().len();
        std::thread::sleep(Duration::from_millis(30));
        assert_eq!(sink.events().len(), count_after_dispose);
    }

    #[test]
    fn dispose_twice_is_a_no_op() {
        let sink = RecordingSink::new();
        let source = ScriptedPullSource::new(vec![PullStep::BlockUntilCancel]);

        let mut binding = start(
            source,
            sink.clone() as std::sync::Arc<dyn EventSink>,
            context(),
        )
        .expect("pull adapter starts");
        binding.dispose();
        binding.dispose();

        assert_eq!(sink.terminal_count(), 1);
    }
}
