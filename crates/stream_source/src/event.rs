use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::ids::{is_provisional_tool_id, RunId, SessionId};

/// Closed set of event kinds the pipeline understands.
///
/// One variant per [`EventPayload`] shape; subscription and coalescing key
/// off this enum so downstream dispatch stays exhaustive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    TextDelta,
    TextComplete,
    ReasoningDelta,
    ReasoningComplete,
    ToolStart,
    ToolUpdate,
    ToolComplete,
    AgentStart,
    AgentUpdate,
    AgentComplete,
    TaskUpdate,
    SessionStatus,
    SessionError,
    Usage,
    LifecycleStart,
    LifecycleEnd,
    LifecycleAbort,
    LifecycleError,
}

/// Non-terminal phase reported by a tool state snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolPhase {
    Pending,
    Running,
}

/// Terminal outcome of a tool invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolOutcome {
    Completed,
    Error,
    Interrupted,
}

/// Terminal outcome of a tracked agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentOutcome {
    Completed,
    Error,
    Interrupted,
}

/// State of one orchestrator task row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    Pending,
    InProgress,
    Completed,
}

/// Coarse session activity reported by status events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Idle,
    Working,
    AwaitingInput,
}

/// Interactive question attached to a tool invocation.
///
/// Pending while `answer` is `None`; resolved once the host records one.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuestionOverlay {
    pub prompt: String,
    pub options: Vec<String>,
    pub answer: Option<String>,
}

/// Payload of one bus event, tagged by kind.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum EventPayload {
    TextDelta {
        delta: String,
    },
    TextComplete {
        text: String,
    },
    ReasoningDelta {
        delta: String,
    },
    ReasoningComplete {
        text: String,
    },
    ToolStart {
        tool_id: String,
        tool_name: String,
        arguments: Value,
        owner_agent_id: Option<String>,
        /// Provisional id this canonical id replaces, when the invocation
        /// was first published before its canonical id was known.
        supersedes: Option<String>,
    },
    ToolUpdate {
        tool_id: String,
        phase: ToolPhase,
        question: Option<QuestionOverlay>,
    },
    ToolComplete {
        tool_id: String,
        outcome: ToolOutcome,
        output: Value,
        supersedes: Option<String>,
    },
    AgentStart {
        agent_id: String,
        /// Tool invocation that spawned this agent, possibly provisional.
        parent_tool_id: Option<String>,
        task: String,
        background: bool,
    },
    AgentUpdate {
        agent_id: String,
        note: Option<String>,
    },
    AgentComplete {
        agent_id: String,
        outcome: AgentOutcome,
    },
    TaskUpdate {
        task_id: String,
        title: String,
        state: TaskState,
    },
    SessionStatus {
        state: SessionState,
        detail: Option<String>,
    },
    SessionError {
        message: String,
    },
    Usage {
        input_tokens: u64,
        output_tokens: u64,
    },
    LifecycleStart,
    LifecycleEnd,
    LifecycleAbort,
    LifecycleError {
        message: String,
    },
}

impl EventPayload {
    /// Returns the kind tag for this payload.
    #[must_use]
    pub fn kind(&self) -> EventKind {
        match self {
            Self::TextDelta { .. } => EventKind::TextDelta,
            Self::TextComplete { .. } => EventKind::TextComplete,
            Self::ReasoningDelta { .. } => EventKind::ReasoningDelta,
            Self::ReasoningComplete { .. } => EventKind::ReasoningComplete,
            Self::ToolStart { .. } => EventKind::ToolStart,
            Self::ToolUpdate { .. } => EventKind::ToolUpdate,
            Self::ToolComplete { .. } => EventKind::ToolComplete,
            Self::AgentStart { .. } => EventKind::AgentStart,
            Self::AgentUpdate { .. } => EventKind::AgentUpdate,
            Self::AgentComplete { .. } => EventKind::AgentComplete,
            Self::TaskUpdate { .. } => EventKind::TaskUpdate,
            Self::SessionStatus { .. } => EventKind::SessionStatus,
            Self::SessionError { .. } => EventKind::SessionError,
            Self::Usage { .. } => EventKind::Usage,
            Self::LifecycleStart => EventKind::LifecycleStart,
            Self::LifecycleEnd => EventKind::LifecycleEnd,
            Self::LifecycleAbort => EventKind::LifecycleAbort,
            Self::LifecycleError { .. } => EventKind::LifecycleError,
        }
    }

    /// Returns true when this payload terminates a handle's lifecycle.
    #[must_use]
    pub fn is_terminal_lifecycle(&self) -> bool {
        matches!(
            self,
            Self::LifecycleEnd | Self::LifecycleAbort | Self::LifecycleError { .. }
        )
    }
}

/// Error rejecting an event at the bus boundary.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("{kind:?} event carries run id 0")]
    ZeroRunId { kind: EventKind },

    #[error("{kind:?} event carries timestamp 0")]
    ZeroTimestamp { kind: EventKind },

    #[error("{kind:?} payload has empty {field}")]
    EmptyField {
        kind: EventKind,
        field: &'static str,
    },

    #[error("{kind:?} supersedes '{supersedes}', which is not a provisional id")]
    NonProvisionalSupersedes { kind: EventKind, supersedes: String },

    #[error("{kind:?} event for '{tool_id}' supersedes itself")]
    SelfSupersedes { kind: EventKind, tool_id: String },
}

/// Immutable, schema-validated record of one thing that happened in a
/// streaming session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BusEvent {
    pub session_id: SessionId,
    pub run_id: RunId,
    pub timestamp_ms: u64,
    #[serde(flatten)]
    pub payload: EventPayload,
}

impl BusEvent {
    /// Builds an event stamped with the current wall clock.
    #[must_use]
    pub fn new(session_id: SessionId, run_id: RunId, payload: EventPayload) -> Self {
        Self {
            session_id,
            run_id,
            timestamp_ms: now_ms(),
            payload,
        }
    }

    /// Returns the kind tag of the payload.
    #[must_use]
    pub fn kind(&self) -> EventKind {
        self.payload.kind()
    }

    /// Checks the structural invariants declared for this event's kind.
    ///
    /// The bus calls this before delivery; events that fail are rejected,
    /// logged, and never reach a handler.
    pub fn validate(&self) -> Result<(), ValidationError> {
        let kind = self.kind();

        if self.run_id == 0 {
            return Err(ValidationError::ZeroRunId { kind });
        }
        if self.timestamp_ms == 0 {
            return Err(ValidationError::ZeroTimestamp { kind });
        }

        match &self.payload {
            EventPayload::TextDelta { delta } | EventPayload::ReasoningDelta { delta } => {
                require_non_empty(kind, "delta", delta)
            }
            EventPayload::TextComplete { .. } | EventPayload::ReasoningComplete { .. } => Ok(()),
            EventPayload::ToolStart {
                tool_id,
                tool_name,
                supersedes,
                ..
            } => {
                require_non_empty(kind, "tool_id", tool_id)?;
                require_non_empty(kind, "tool_name", tool_name)?;
                validate_supersedes(kind, tool_id, supersedes.as_deref())
            }
            EventPayload::ToolUpdate { tool_id, .. } => require_non_empty(kind, "tool_id", tool_id),
            EventPayload::ToolComplete {
                tool_id,
                supersedes,
                ..
            } => {
                require_non_empty(kind, "tool_id", tool_id)?;
                validate_supersedes(kind, tool_id, supersedes.as_deref())
            }
            EventPayload::AgentStart {
                agent_id,
                parent_tool_id,
                ..
            } => {
                require_non_empty(kind, "agent_id", agent_id)?;
                match parent_tool_id.as_deref() {
                    Some("") => Err(ValidationError::EmptyField {
                        kind,
                        field: "parent_tool_id",
                    }),
                    _ => Ok(()),
                }
            }
            EventPayload::AgentUpdate { agent_id, .. }
            | EventPayload::AgentComplete { agent_id, .. } => {
                require_non_empty(kind, "agent_id", agent_id)
            }
            EventPayload::TaskUpdate { task_id, title, .. } => {
                require_non_empty(kind, "task_id", task_id)?;
                require_non_empty(kind, "title", title)
            }
            EventPayload::SessionStatus { .. } => Ok(()),
            EventPayload::SessionError { message }
            | EventPayload::LifecycleError { message } => {
                require_non_empty(kind, "message", message)
            }
            EventPayload::Usage { .. } => Ok(()),
            EventPayload::LifecycleStart
            | EventPayload::LifecycleEnd
            | EventPayload::LifecycleAbort => Ok(()),
        }
    }
}

fn require_non_empty(
    kind: EventKind,
    field: &'static str,
    value: &str,
) -> Result<(), ValidationError> {
    if value.is_empty() {
        Err(ValidationError::EmptyField { kind, field })
    } else {
        Ok(())
    }
}

fn validate_supersedes(
    kind: EventKind,
    tool_id: &str,
    supersedes: Option<&str>,
) -> Result<(), ValidationError> {
    let Some(supersedes) = supersedes else {
        return Ok(());
    };

    if supersedes == tool_id {
        return Err(ValidationError::SelfSupersedes {
            kind,
            tool_id: tool_id.to_string(),
        });
    }
    if !is_provisional_tool_id(supersedes) {
        return Err(ValidationError::NonProvisionalSupersedes {
            kind,
            supersedes: supersedes.to_string(),
        });
    }

    Ok(())
}

/// Current wall clock in unix milliseconds, clamped to be non-zero.
#[must_use]
pub fn now_ms() -> u64 {
    let nanos = time::OffsetDateTime::now_utc().unix_timestamp_nanos();
    u64::try_from(nanos / 1_000_000).unwrap_or(1).max(1)
}
