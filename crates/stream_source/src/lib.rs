//! Source-agnostic contract for feeding one backend stream into the pipeline.
//!
//! This crate intentionally defines only the shared event taxonomy, payload
//! validation, sortable identifiers, and the three backend delivery shapes
//! (pull, push, hybrid replay). It excludes transport details, batching,
//! correlation, and rendering concerns.

mod event;
mod ids;
mod source;
mod translate;

pub use event::{
    now_ms, AgentOutcome, BusEvent, EventKind, EventPayload, QuestionOverlay, SessionState,
    TaskState, ToolOutcome, ToolPhase, ValidationError,
};
pub use ids::{
    is_provisional_tool_id, provisional_tool_id, RunId, SessionId, PROVISIONAL_TOOL_PREFIX,
};
pub use source::{
    CancelSignal, EventSink, HybridSource, PullSource, PushCallbacks, PushSource, ReplayItem,
    SourceBinding, SourceContext, SourceError, SourceUnit,
};
pub use translate::{LifecyclePublisher, UnitTranslator};
