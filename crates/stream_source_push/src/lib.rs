//! Push-style adapter: registers one callback per native event family and
//! republishes everything the source delivers from its own context.
//!
//! No worker thread of its own; the source drives delivery. Disposal
//! unregisters all callbacks, and a cancel flag shared with the callbacks
//! silences any invocation already racing the disposal.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use stream_source::{
    CancelSignal, EventSink, LifecyclePublisher, PushCallbacks, PushSource, SourceBinding,
    SourceContext, SourceError, SourceUnit, UnitTranslator,
};

/// Registers callbacks on `handle`. The returned binding owns the handle
/// and must be disposed when the run ends.
pub fn start<S: PushSource>(
    mut handle: S,
    sink: Arc<dyn EventSink>,
    context: SourceContext,
) -> Result<PushBinding<S>, String> {
    let cancel: CancelSignal = Arc::new(AtomicBool::new(false));
    let publisher = Arc::new(LifecyclePublisher::new(sink, context.clone()));
    let translator = Arc::new(Mutex::new(UnitTranslator::new(context)));

    publisher.started();

    let callbacks = PushCallbacks {
        on_content: forwarding_callback(&cancel, &translator, &publisher),
        on_tool: forwarding_callback(&cancel, &translator, &publisher),
        on_agent: forwarding_callback(&cancel, &translator, &publisher),
        on_status: forwarding_callback(&cancel, &translator, &publisher),
        on_closed: closing_callback(&publisher),
    };

    if let Err(error) = handle.register(callbacks) {
        let message = format!("failed to register push callbacks: {error}");
        publisher.errored(message.clone());
        return Err(message);
    }

    Ok(PushBinding {
        handle,
        cancel,
        publisher,
        disposed: false,
    })
}

fn forwarding_callback(
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

fn closing_callback(
    publisher: &Arc<LifecyclePublisher>,
) -> Box<dyn FnMut(Result<(), SourceError>) + Send> {
    let publisher = Arc::clone(publisher);
    Box::new(move |result| match result {
        Ok(()) => {
            publisher.ended();
        }
        Err(SourceError::Cancelled) => {
            publisher.aborted();
        }
        Err(error) => {
            publisher.errored(error.to_string());
        }
    })
}

/// Running push adapter bound to one handle.
pub struct PushBinding<S: PushSource> {
    handle: S,
    cancel: CancelSignal,
    publisher: Arc<LifecyclePublisher>,
    disposed: bool,
}

impl<S: PushSource> SourceBinding for PushBinding<S> {
    fn dispose(&mut self) {
        if self.disposed {
            return;
        }
        self.disposed = true;

        // Set before unregistering so a callback already past the source's
        // dispatch check publishes nothing.
        self.cancel.store(true, Ordering::SeqCst);
        self.handle.unregister();

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
