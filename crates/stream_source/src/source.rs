use std::fmt;
use std::sync::atomic::AtomicBool;
use std::sync::mpsc::Receiver;
use std::sync::Arc;

use serde_json::Value;

use crate::event::{
    AgentOutcome, BusEvent, EventPayload, QuestionOverlay, SessionState, ToolOutcome,
    ValidationError,
};
use crate::ids::{RunId, SessionId};

/// Shared cancellation flag for one bound source.
///
/// Set by disposal, read by workers and error paths concurrently. The flag
/// is only ever set, never replaced, so a late reader always observes a
/// coherent value.
pub type CancelSignal = Arc<AtomicBool>;

/// Error reported by a backend handle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SourceError {
    /// The handle observed cancellation and stopped early.
    Cancelled,
    /// The handle is closed and cannot deliver further units.
    Closed,
    /// The backend produced data the handle could not interpret.
    Protocol(String),
    /// The underlying delivery mechanism failed.
    Transport(String),
}

impl fmt::Display for SourceError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Cancelled => write!(f, "source was cancelled"),
            Self::Closed => write!(f, "source is closed"),
            Self::Protocol(message) => write!(f, "source protocol failure: {message}"),
            Self::Transport(message) => write!(f, "source transport failure: {message}"),
        }
    }
}

impl std::error::Error for SourceError {}

/// One native unit of backend output, shared across the three delivery
/// shapes. Adapters translate units into [`BusEvent`]s.
#[derive(Debug, Clone, PartialEq)]
pub enum SourceUnit {
    Text {
        delta: String,
    },
    TextDone {
        text: String,
    },
    Reasoning {
        delta: String,
    },
    ReasoningDone {
        text: String,
    },
    ToolStarted {
        /// Canonical call id when the backend already knows it; `None`
        /// makes the adapter mint a provisional id.
        call_id: Option<String>,
        tool_name: String,
        arguments: Value,
        owner_agent_id: Option<String>,
    },
    ToolProgress {
        call_id: String,
        question: Option<QuestionOverlay>,
    },
    ToolFinished {
        call_id: String,
        tool_name: String,
        outcome: ToolOutcome,
        output: Value,
    },
    AgentSpawned {
        agent_id: String,
        spawned_by: Option<String>,
        task: String,
        background: bool,
    },
    AgentProgress {
        agent_id: String,
        note: Option<String>,
    },
    AgentFinished {
        agent_id: String,
        outcome: AgentOutcome,
    },
    StatusChanged {
        state: SessionState,
        detail: Option<String>,
    },
    UsageReported {
        input_tokens: u64,
        output_tokens: u64,
    },
}

/// Identity stamped onto every event an adapter publishes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceContext {
    pub session_id: SessionId,
    pub run_id: RunId,
    /// Stable label for the bound source, used to scope provisional ids
    /// and name worker threads.
    pub source_id: String,
}

impl SourceContext {
    #[must_use]
    pub fn new(session_id: SessionId, run_id: RunId, source_id: impl Into<String>) -> Self {
        Self {
            session_id,
            run_id,
            source_id: source_id.into(),
        }
    }

    /// Wraps a payload into a bus event stamped with this context.
    #[must_use]
    pub fn event(&self, payload: EventPayload) -> BusEvent {
        BusEvent::new(self.session_id, self.run_id, payload)
    }
}

/// Destination adapters publish into. Implemented by the pipeline's bus.
pub trait EventSink: Send + Sync {
    /// Validates and delivers one event. Rejection is the caller's signal
    /// that the event never reached a handler.
    fn publish(&self, event: BusEvent) -> Result<(), ValidationError>;
}

/// Handle exposing the lazy pull shape: the adapter asks for the next unit
/// until the stream ends.
pub trait PullSource: Send + 'static {
    /// Blocks until the next unit is available, the stream ends (`None`),
    /// or the handle fails. Implementations must return promptly once
    /// `cancel` is set, typically with [`SourceError::Cancelled`].
    fn next_unit(&mut self, cancel: &CancelSignal) -> Result<Option<SourceUnit>, SourceError>;
}

/// Callback set a push-style handle invokes as native events arrive.
///
/// One slot per native event family; `on_closed` fires exactly once when the
/// stream ends or fails.
pub struct PushCallbacks {
    pub on_content: Box<dyn FnMut(SourceUnit) + Send>,
    pub on_tool: Box<dyn FnMut(SourceUnit) + Send>,
    pub on_agent: Box<dyn FnMut(SourceUnit) + Send>,
    pub on_status: Box<dyn FnMut(SourceUnit) + Send>,
    pub on_closed: Box<dyn FnMut(Result<(), SourceError>) + Send>,
}

/// Handle exposing the push shape: the adapter registers callbacks and the
/// source drives delivery from its own context.
pub trait PushSource: Send + 'static {
    /// Installs the callback set. Fails when the handle is already closed
    /// or already has a registration.
    fn register(&mut self, callbacks: PushCallbacks) -> Result<(), SourceError>;

    /// Removes a registration. Safe to call when none is installed.
    fn unregister(&mut self);
}

/// One item on a hybrid handle's replay channel.
#[derive(Debug, Clone, PartialEq)]
pub enum ReplayItem {
    /// A sequenced unit. Sequence numbers are strictly increasing within a
    /// connection; reconnection may replay frames the consumer already saw.
    Frame(u64, SourceUnit),
    /// The stream finished normally. No further frames follow.
    Completed,
    /// The stream failed. No further frames follow.
    Failed(String),
}

/// Handle exposing the hybrid shape: a replayable sequenced channel plus a
/// secondary callback channel, consumed concurrently.
pub trait HybridSource: Send + 'static {
    /// Opens (or reopens) the replay channel. `resume_after` asks the
    /// source to start past the given sequence number; sources may replay
    /// earlier frames anyway and consumers must skip them.
    fn connect(&mut self, resume_after: Option<u64>) -> Result<Receiver<ReplayItem>, SourceError>;

    /// Installs the secondary callback listener.
    fn set_side_listener(&mut self, listener: Box<dyn FnMut(SourceUnit) + Send>);

    /// Removes the secondary listener. Safe to call when none is installed.
    fn clear_side_listener(&mut self);
}

/// A started adapter. Dropping without `dispose` leaks the worker; callers
/// own the binding for the handle's lifetime.
pub trait SourceBinding: Send {
    /// Stops the adapter: interrupts in-flight delivery, unregisters
    /// callbacks, joins the worker. Idempotent and infallible from the
    /// caller's perspective; internal failures are logged and swallowed.
    fn dispose(&mut self);

    /// Returns true once `dispose` has completed.
    fn is_disposed(&self) -> bool;
}
