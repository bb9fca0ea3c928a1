//! Renderable part model.
//!
//! Each part carries an opaque sortable identifier encoding creation time
//! plus a monotonic tie-break counter, so lexicographic order equals
//! chronological order even for same-millisecond parts. One message's parts
//! live in one array sorted by this identifier.

use std::fmt;

use serde_json::Value;
use stream_source::{
    now_ms, AgentOutcome, QuestionOverlay, SessionState, TaskState, ToolOutcome,
};

/// Sortable part identifier: creation time plus tie-break counter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PartId {
    pub timestamp_ms: u64,
    pub seq: u64,
}

impl fmt::Display for PartId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Zero-padded so the string form sorts the same way the value does.
        write!(f, "{:013}-{:08}", self.timestamp_ms, self.seq)
    }
}

/// Issues strictly increasing part ids. Owned by the document store; not an
/// ambient global.
#[derive(Debug, Default)]
pub struct PartIdGen {
    last_ms: u64,
    next_seq: u64,
}

impl PartIdGen {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Next id. The timestamp never moves backwards even when the wall
    /// clock does, and the counter alone breaks same-millisecond ties.
    pub fn next(&mut self) -> PartId {
        let now = now_ms();
        if now > self.last_ms {
            self.last_ms = now;
        }
        let id = PartId {
            timestamp_ms: self.last_ms,
            seq: self.next_seq,
        };
        self.next_seq += 1;
        id
    }
}

/// Tool invocation state machine: `Pending → Running → terminal`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ToolState {
    Pending,
    Running,
    Completed,
    Error,
    Interrupted,
}

impl ToolState {
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Error | Self::Interrupted)
    }

    #[must_use]
    pub fn from_outcome(outcome: ToolOutcome) -> Self {
        match outcome {
            ToolOutcome::Completed => Self::Completed,
            ToolOutcome::Error => Self::Error,
            ToolOutcome::Interrupted => Self::Interrupted,
        }
    }
}

/// Sub-agent lifecycle state, independent per tracked agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AgentRunState {
    Pending,
    Running,
    Completed,
    Error,
    Interrupted,
}

impl AgentRunState {
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Error | Self::Interrupted)
    }

    #[must_use]
    pub fn from_outcome(outcome: AgentOutcome) -> Self {
        match outcome {
            AgentOutcome::Completed => Self::Completed,
            AgentOutcome::Error => Self::Error,
            AgentOutcome::Interrupted => Self::Interrupted,
        }
    }
}

/// Streaming text block.
#[derive(Debug, Clone, PartialEq)]
pub struct TextPart {
    pub id: PartId,
    pub content: String,
    /// Still receiving deltas. A tool call interrupting streaming closes
    /// the block so later text opens a new, correctly-ordered part.
    pub open: bool,
}

/// Streaming reasoning block.
#[derive(Debug, Clone, PartialEq)]
pub struct ReasoningPart {
    pub id: PartId,
    pub content: String,
    pub open: bool,
}

/// One tool invocation. Terminal states are immutable; later mutations are
/// ignored by the store.
#[derive(Debug, Clone, PartialEq)]
pub struct ToolPart {
    pub id: PartId,
    pub tool_id: String,
    pub tool_name: String,
    pub arguments: Value,
    pub state: ToolState,
    pub output: Option<Value>,
    /// Interactive question attached to the tool, not a separate part.
    pub question: Option<QuestionOverlay>,
}

impl ToolPart {
    /// Moves a pending tool to running. Returns false when the state is
    /// already terminal.
    pub fn set_running(&mut self) -> bool {
        if self.state.is_terminal() {
            return false;
        }
        self.state = ToolState::Running;
        true
    }

    /// Applies a terminal outcome. Returns false when already terminal.
    pub fn finish(&mut self, outcome: ToolOutcome, output: Value) -> bool {
        if self.state.is_terminal() {
            return false;
        }
        self.state = ToolState::from_outcome(outcome);
        self.output = Some(output);
        true
    }
}

/// Tool invocation recorded under its owning sub-agent rather than the
/// top-level transcript.
#[derive(Debug, Clone, PartialEq)]
pub struct NestedToolCall {
    pub tool_id: String,
    pub tool_name: String,
    pub state: ToolState,
}

/// One tracked sub-agent inside a group.
#[derive(Debug, Clone, PartialEq)]
pub struct AgentEntry {
    pub agent_id: String,
    pub task: String,
    pub state: AgentRunState,
    /// Detached agents are not finalized when the spawning call returns.
    pub background: bool,
    pub note: Option<String>,
    pub tools: Vec<NestedToolCall>,
}

impl AgentEntry {
    pub fn set_running(&mut self) -> bool {
        if self.state.is_terminal() {
            return false;
        }
        self.state = AgentRunState::Running;
        true
    }

    pub fn finish(&mut self, outcome: AgentOutcome) -> bool {
        if self.state.is_terminal() {
            return false;
        }
        self.state = AgentRunState::from_outcome(outcome);
        true
    }
}

/// Group of tracked sub-agents sharing a spawn point.
#[derive(Debug, Clone, PartialEq)]
pub struct AgentGroupPart {
    pub id: PartId,
    pub spawn_tool_id: String,
    pub entries: Vec<AgentEntry>,
}

impl AgentGroupPart {
    #[must_use]
    pub fn entry(&self, agent_id: &str) -> Option<&AgentEntry> {
        self.entries.iter().find(|entry| entry.agent_id == agent_id)
    }

    pub fn entry_mut(&mut self, agent_id: &str) -> Option<&mut AgentEntry> {
        self.entries
            .iter_mut()
            .find(|entry| entry.agent_id == agent_id)
    }
}

/// One orchestrator task row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskItem {
    pub task_id: String,
    pub title: String,
    pub state: TaskState,
}

/// Task list maintained from orchestrator task updates.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskListPart {
    pub id: PartId,
    pub items: Vec<TaskItem>,
}

/// Auxiliary session status / error display.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusPart {
    pub id: PartId,
    pub state: Option<SessionState>,
    pub detail: Option<String>,
    pub error: Option<String>,
}

/// Unit of renderable content.
#[derive(Debug, Clone, PartialEq)]
pub enum Part {
    Text(TextPart),
    Reasoning(ReasoningPart),
    Tool(ToolPart),
    AgentGroup(AgentGroupPart),
    TaskList(TaskListPart),
    Status(StatusPart),
}

impl Part {
    /// The sortable identifier ordering this part within its message.
    #[must_use]
    pub fn id(&self) -> PartId {
        match self {
            Self::Text(part) => part.id,
            Self::Reasoning(part) => part.id,
            Self::Tool(part) => part.id,
            Self::AgentGroup(part) => part.id,
            Self::TaskList(part) => part.id,
            Self::Status(part) => part.id,
        }
    }
}

/// Inserts or replaces `part` keeping the array sorted by identifier.
///
/// Binary search; an existing part with the same id is replaced in place
/// (reconciliation), otherwise the part is inserted at its position.
pub fn upsert(parts: &mut Vec<Part>, part: Part) {
    match parts.binary_search_by(|existing| existing.id().cmp(&part.id())) {
        Ok(index) => parts[index] = part,
        Err(index) => parts.insert(index, part),
    }
}
