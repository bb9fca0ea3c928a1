//! In-process typed publish/subscribe hub.
//!
//! Delivery is synchronous and fan-out is non-blocking: `publish` validates
//! the event, snapshots the matching handlers, and invokes them in
//! registration order with per-handler fault isolation.

use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Mutex, MutexGuard};

use log::{error, warn};
use stream_source::{BusEvent, EventKind, EventSink, ValidationError};

/// Token returned by `subscribe`/`subscribe_all`; passing it to
/// `unsubscribe` removes the handler. Safe to unsubscribe twice or from
/// inside a handler.
pub type SubscriptionId = u64;

type Handler = Arc<dyn Fn(&BusEvent) + Send + Sync>;

struct HandlerEntry {
    id: SubscriptionId,
    handler: Handler,
}

#[derive(Default)]
struct BusState {
    by_kind: HashMap<EventKind, Vec<HandlerEntry>>,
    wildcard: Vec<HandlerEntry>,
    next_id: SubscriptionId,
}

/// Typed event hub adapters and the orchestrator publish into.
#[derive(Default)]
pub struct EventBus {
    state: Mutex<BusState>,
}

impl EventBus {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a handler for one event kind.
    pub fn subscribe(
        &self,
        kind: EventKind,
        handler: impl Fn(&BusEvent) + Send + Sync + 'static,
    ) -> SubscriptionId {
        let mut state = self.lock_state();
        let id = state.next_id;
        state.next_id += 1;
        state.by_kind.entry(kind).or_default().push(HandlerEntry {
            id,
            handler: Arc::new(handler),
        });
        id
    }

    /// Registers a handler for every event kind.
    pub fn subscribe_all(
        &self,
        handler: impl Fn(&BusEvent) + Send + Sync + 'static,
    ) -> SubscriptionId {
        let mut state = self.lock_state();
        let id = state.next_id;
        state.next_id += 1;
        state.wildcard.push(HandlerEntry {
            id,
            handler: Arc::new(handler),
        });
        id
    }

    /// Removes a previously registered handler. Unknown ids are a no-op, so
    /// calling twice is safe. Takes effect on the next publish when called
    /// from inside a handler.
    pub fn unsubscribe(&self, id: SubscriptionId) {
        let mut state = self.lock_state();
        for entries in state.by_kind.values_mut() {
            entries.retain(|entry| entry.id != id);
        }
        state.wildcard.retain(|entry| entry.id != id);
    }

    /// Validates and delivers one event.
    ///
    /// Invalid events are logged and rejected without reaching any handler.
    /// A panicking handler is caught, logged, and does not block remaining
    /// handlers or poison bus state.
    pub fn publish(&self, event: BusEvent) -> Result<(), ValidationError> {
        if let Err(validation) = event.validate() {
            warn!("rejected {:?} event: {validation}", event.kind());
            return Err(validation);
        }

        let handlers = self.snapshot_handlers(event.kind());
        for handler in handlers {
            let outcome = catch_unwind(AssertUnwindSafe(|| handler(&event)));
            if outcome.is_err() {
                error!(
                    "bus handler panicked while handling {:?} event; continuing delivery",
                    event.kind()
                );
            }
        }

        Ok(())
    }

    /// Handlers for `kind` plus wildcard handlers, merged in overall
    /// registration order.
    fn snapshot_handlers(&self, kind: EventKind) -> Vec<Handler> {
        let state = self.lock_state();
        let mut entries: Vec<(SubscriptionId, Handler)> = Vec::new();

        if let Some(kind_entries) = state.by_kind.get(&kind) {
            entries.extend(
                kind_entries
                    .iter()
                    .map(|entry| (entry.id, Arc::clone(&entry.handler))),
            );
        }
        entries.extend(
            state
                .wildcard
                .iter()
                .map(|entry| (entry.id, Arc::clone(&entry.handler))),
        );

        entries.sort_by_key(|(id, _)| *id);
        entries.into_iter().map(|(_, handler)| handler).collect()
    }

    fn lock_state(&self) -> MutexGuard<'_, BusState> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

impl EventSink for EventBus {
    fn publish(&self, event: BusEvent) -> Result<(), ValidationError> {
        EventBus::publish(self, event)
    }
}
