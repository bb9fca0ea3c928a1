//! Scripted fake handles and a recording sink for exercising the source
//! contract without a real backend.
//!
//! Scripts are deterministic; time only enters through explicit `Wait`
//! steps, so adapter tests stay reproducible under load.

use std::collections::VecDeque;
use std::sync::atomic::Ordering;
use std::sync::mpsc::{self, Receiver};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread;
use std::time::{Duration, Instant};

use stream_source::{
    BusEvent, CancelSignal, EventKind, EventSink, HybridSource, PullSource, PushCallbacks,
    PushSource, ReplayItem, SourceError, SourceUnit, ValidationError,
};

/// One scripted step of a pull handle.
pub enum PullStep {
    /// Yield this unit.
    Unit(SourceUnit),
    /// Sleep before the next step, observing cancellation.
    Wait(Duration),
    /// Fail the pull with this error.
    Fail(SourceError),
    /// Block until the adapter cancels, then report cancellation. Models
    /// an in-flight pull interrupted by disposal.
    BlockUntilCancel,
}

/// Pull handle yielding a fixed script, then end-of-stream.
pub struct ScriptedPullSource {
    steps: VecDeque<PullStep>,
}

impl ScriptedPullSource {
    #[must_use]
    pub fn new(steps: Vec<PullStep>) -> Self {
        Self {
            steps: steps.into(),
        }
    }
}

impl PullSource for ScriptedPullSource {
    fn next_unit(&mut self, cancel: &CancelSignal) -> Result<Option<SourceUnit>, SourceError> {
        loop {
            if cancel.load(Ordering::SeqCst) {
                return Err(SourceError::Cancelled);
            }

            match self.steps.pop_front() {
                None => return Ok(None),
                Some(PullStep::Unit(unit)) => return Ok(Some(unit)),
                Some(PullStep::Fail(error)) => return Err(error),
                Some(PullStep::Wait(duration)) => {
                    sleep_observing_cancel(duration, cancel);
                }
                Some(PullStep::BlockUntilCancel) => {
                    while !cancel.load(Ordering::SeqCst) {
                        thread::sleep(Duration::from_millis(2));
                    }
                    return Err(SourceError::Cancelled);
                }
            }
        }
    }
}

fn sleep_observing_cancel(duration: Duration, cancel: &CancelSignal) {
    let deadline = Instant::now() + duration;
    while Instant::now() < deadline {
        if cancel.load(Ordering::SeqCst) {
            return;
        }
        thread::sleep(Duration::from_millis(1));
    }
}

#[derive(Default)]
struct PushInner {
    callbacks: Option<PushCallbacks>,
    closed: bool,
}

/// Push handle whose delivery is driven externally through a [`PushDriver`].
#[derive(Default)]
pub struct ScriptedPushSource {
    inner: Arc<Mutex<PushInner>>,
}

impl ScriptedPushSource {
    /// Creates the handle plus the driver a test uses to fire native
    /// events from its own thread.
    #[must_use]
    pub fn new() -> (Self, PushDriver) {
        let inner = Arc::new(Mutex::new(PushInner::default()));
        (
            Self {
                inner: Arc::clone(&inner),
            },
            PushDriver { inner },
        )
    }
}

impl PushSource for ScriptedPushSource {
    fn register(&mut self, callbacks: PushCallbacks) -> Result<(), SourceError> {
        let mut inner = lock_unpoisoned(&self.inner);
        if inner.closed {
            return Err(SourceError::Closed);
        }
        if inner.callbacks.is_some() {
            return Err(SourceError::Protocol(
                "callbacks already registered".to_string(),
            ));
        }
        inner.callbacks = Some(callbacks);
        Ok(())
    }

    fn unregister(&mut self) {
        lock_unpoisoned(&self.inner).callbacks = None;
    }
}

/// Remote control for a [`ScriptedPushSource`].
#[derive(Clone)]
pub struct PushDriver {
    inner: Arc<Mutex<PushInner>>,
}

impl PushDriver {
    /// Fires a content unit. Returns false when no callbacks are
    /// registered (for example after disposal).
    pub fn fire_content(&self, unit: SourceUnit) -> bool {
        let mut inner = lock_unpoisoned(&self.inner);
        match inner.callbacks.as_mut() {
            Some(callbacks) => {
                (callbacks.on_content)(unit);
                true
            }
            None => false,
        }
    }

    /// Fires a tool unit.
    pub fn fire_tool(&self, unit: SourceUnit) -> bool {
        let mut inner = lock_unpoisoned(&self.inner);
        match inner.callbacks.as_mut() {
            Some(callbacks) => {
                (callbacks.on_tool)(unit);
                true
            }
            None => false,
        }
    }

    /// Fires an agent unit.
    pub fn fire_agent(&self, unit: SourceUnit) -> bool {
        let mut inner = lock_unpoisoned(&self.inner);
        match inner.callbacks.as_mut() {
            Some(callbacks) => {
                (callbacks.on_agent)(unit);
                true
            }
            None => false,
        }
    }

    /// Fires a status unit.
    pub fn fire_status(&self, unit: SourceUnit) -> bool {
        let mut inner = lock_unpoisoned(&self.inner);
        match inner.callbacks.as_mut() {
            Some(callbacks) => {
                (callbacks.on_status)(unit);
                true
            }
            None => false,
        }
    }

    /// Ends the stream, invoking `on_closed` exactly once.
    pub fn close(&self, result: Result<(), SourceError>) -> bool {
        let mut inner = lock_unpoisoned(&self.inner);
        if inner.closed {
            return false;
        }
        inner.closed = true;
        match inner.callbacks.as_mut() {
            Some(callbacks) => {
                (callbacks.on_closed)(result);
                true
            }
            None => false,
        }
    }

    /// True while callbacks are registered.
    #[must_use]
    pub fn is_registered(&self) -> bool {
        lock_unpoisoned(&self.inner).callbacks.is_some()
    }
}

/// One scripted step of a hybrid replay connection.
pub enum HybridStep {
    /// Send this item on the replay channel.
    Item(ReplayItem),
    /// Pause the feeder before the next step.
    Wait(Duration),
    /// Drop the channel without a terminal item, simulating a transport
    /// failure the adapter must survive by reconnecting.
    Disconnect,
}

struct HybridInner {
    connections: VecDeque<Vec<HybridStep>>,
    side_listener: Option<Box<dyn FnMut(SourceUnit) + Send>>,
    resume_args: Vec<Option<u64>>,
}

/// Hybrid handle replaying scripted connections; each `connect` call
/// consumes the next script.
pub struct ScriptedHybridSource {
    inner: Arc<Mutex<HybridInner>>,
}

impl ScriptedHybridSource {
    /// Creates the handle plus a driver for the secondary callback channel.
    #[must_use]
    pub fn new(connections: Vec<Vec<HybridStep>>) -> (Self, HybridDriver) {
        let inner = Arc::new(Mutex::new(HybridInner {
            connections: connections.into(),
            side_listener: None,
            resume_args: Vec::new(),
        }));
        (
            Self {
                inner: Arc::clone(&inner),
            },
            HybridDriver { inner },
        )
    }
}

impl HybridSource for ScriptedHybridSource {
    fn connect(&mut self, resume_after: Option<u64>) -> Result<Receiver<ReplayItem>, SourceError> {
        let script = {
            let mut inner = lock_unpoisoned(&self.inner);
            inner.resume_args.push(resume_after);
            inner.connections.pop_front()
        };
        let Some(script) = script else {
            return Err(SourceError::Closed);
        };

        let (sender, receiver) = mpsc::channel();
        thread::Builder::new()
            .name("mock-hybrid-feeder".to_string())
            .spawn(move || {
                for step in script {
                    match step {
                        HybridStep::Item(item) => {
                            if sender.send(item).is_err() {
                                return;
                            }
                        }
                        HybridStep::Wait(duration) => thread::sleep(duration),
                        HybridStep::Disconnect => return,
                    }
                }
            })
            .map_err(|error| SourceError::Transport(format!("feeder spawn failed: {error}")))?;

        Ok(receiver)
    }

    fn set_side_listener(&mut self, listener: Box<dyn FnMut(SourceUnit) + Send>) {
        lock_unpoisoned(&self.inner).side_listener = Some(listener);
    }

    fn clear_side_listener(&mut self) {
        lock_unpoisoned(&self.inner).side_listener = None;
    }
}

/// Remote control for a [`ScriptedHybridSource`] secondary channel.
#[derive(Clone)]
pub struct HybridDriver {
    inner: Arc<Mutex<HybridInner>>,
}

impl HybridDriver {
    /// Fires a unit on the secondary callback channel. Returns false when
    /// no listener is installed.
    pub fn fire_side(&self, unit: SourceUnit) -> bool {
        let mut inner = lock_unpoisoned(&self.inner);
        match inner.side_listener.as_mut() {
            Some(listener) => {
                listener(unit);
                true
            }
            None => false,
        }
    }

    /// Resume arguments observed by `connect`, in call order.
    #[must_use]
    pub fn resume_args(&self) -> Vec<Option<u64>> {
        lock_unpoisoned(&self.inner).resume_args.clone()
    }
}

/// Sink that validates like the bus and records everything it accepts.
#[derive(Default)]
pub struct RecordingSink {
    events: Mutex<Vec<BusEvent>>,
}

impl RecordingSink {
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Snapshot of accepted events in publication order.
    #[must_use]
    pub fn events(&self) -> Vec<BusEvent> {
        lock_unpoisoned(&self.events).clone()
    }

    /// Kind tags of accepted events in publication order.
    #[must_use]
    pub fn kinds(&self) -> Vec<EventKind> {
        self.events().iter().map(BusEvent::kind).collect()
    }

    /// Number of terminal lifecycle events recorded.
    #[must_use]
    pub fn terminal_count(&self) -> usize {
        self.events()
            .iter()
            .filter(|event| event.payload.is_terminal_lifecycle())
            .count()
    }

    /// Polls until `predicate` holds or `timeout` elapses.
    pub fn wait_until(
        &self,
        timeout: Duration,
        mut predicate: impl FnMut(&[BusEvent]) -> bool,
    ) -> bool {
        let deadline = Instant::now() + timeout;
        while Instant::now() < deadline {
            if predicate(&self.events()) {
                return true;
            }
            thread::sleep(Duration::from_millis(2));
        }
        predicate(&self.events())
    }
}

impl EventSink for RecordingSink {
    fn publish(&self, event: BusEvent) -> Result<(), ValidationError> {
        event.validate()?;
        lock_unpoisoned(&self.events).push(event);
        Ok(())
    }
}

fn lock_unpoisoned<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}
