//! Ordered part store: the canonical sorted sequence of renderable parts
//! per message, mutated by applying enriched events.
//!
//! Only the pipeline mutates a message's part array, so no locking happens
//! here. Applying an event to a terminal part is logged and ignored; the
//! worst case anywhere in this module is a stale part, never a panic.

use std::collections::HashMap;

use log::{debug, warn};
use serde_json::Value;
use stream_source::{EventPayload, RunId, SessionId, SessionState, ToolOutcome, ToolPhase};

use crate::correlate::{Disposition, EnrichedEvent};
use crate::part::{
    upsert, AgentEntry, AgentGroupPart, AgentRunState, NestedToolCall, Part, PartId, PartIdGen,
    ReasoningPart, StatusPart, TaskItem, TaskListPart, TextPart, ToolPart, ToolState,
};

/// Latest usage snapshot reported for a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct UsageTotals {
    pub input_tokens: u64,
    pub output_tokens: u64,
}

/// One message's parts plus the indices used for reconciliation.
#[derive(Debug, Default)]
pub struct MessageDoc {
    session_id: Option<SessionId>,
    parts: Vec<Part>,
    /// Every id a tool part is known under (canonical, provisional, raw).
    tool_part_ids: HashMap<String, PartId>,
    /// Spawn key -> agent-group part.
    group_part_ids: HashMap<String, PartId>,
    /// Agent id -> owning agent-group part.
    group_of_agent: HashMap<String, PartId>,
    task_list_id: Option<PartId>,
    status_id: Option<PartId>,
    usage: Option<UsageTotals>,
}

impl MessageDoc {
    /// Parts in identifier (chronological) order.
    #[must_use]
    pub fn parts(&self) -> &[Part] {
        &self.parts
    }

    /// Latest usage snapshot, if any was reported.
    #[must_use]
    pub fn usage(&self) -> Option<UsageTotals> {
        self.usage
    }

    /// Session this message belongs to.
    #[must_use]
    pub fn session_id(&self) -> Option<SessionId> {
        self.session_id
    }

    fn part_mut(&mut self, id: PartId) -> Option<&mut Part> {
        match self.parts.binary_search_by(|part| part.id().cmp(&id)) {
            Ok(index) => Some(&mut self.parts[index]),
            Err(_) => None,
        }
    }
}

/// All messages of the active surface, keyed by run.
#[derive(Debug, Default)]
pub struct DocumentStore {
    ids: PartIdGen,
    messages: HashMap<RunId, MessageDoc>,
}

impl DocumentStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Applies one enriched event. Stale events are dropped here as the
    /// last line of defense; the pipeline normally filters them first.
    pub fn apply(&mut self, enriched: &EnrichedEvent) {
        if enriched.disposition == Disposition::StaleRun {
            debug!(
                "dropping stale {:?} event for run {}",
                enriched.event.kind(),
                enriched.event.run_id
            );
            return;
        }

        let ids = &mut self.ids;
        let doc = self.messages.entry(enriched.event.run_id).or_default();
        doc.session_id.get_or_insert(enriched.event.session_id);
        apply_to_doc(ids, doc, enriched);
    }

    /// Cloned parts for rendering; `None` when the run has no message.
    #[must_use]
    pub fn snapshot(&self, run_id: RunId) -> Option<Vec<Part>> {
        self.messages.get(&run_id).map(|doc| doc.parts.clone())
    }

    /// Read access to one message.
    #[must_use]
    pub fn message(&self, run_id: RunId) -> Option<&MessageDoc> {
        self.messages.get(&run_id)
    }
}

fn apply_to_doc(ids: &mut PartIdGen, doc: &mut MessageDoc, enriched: &EnrichedEvent) {
    match &enriched.event.payload {
        EventPayload::TextDelta { delta } => {
            if let Some(Part::Text(text)) = doc.parts.last_mut() {
                if text.open {
                    text.content.push_str(delta);
                    return;
                }
            }
            let part = TextPart {
                id: ids.next(),
                content: delta.clone(),
                open: true,
            };
            upsert(&mut doc.parts, Part::Text(part));
        }
        EventPayload::TextComplete { text } => {
            if let Some(Part::Text(existing)) = doc.parts.last_mut() {
                if existing.open {
                    existing.content = text.clone();
                    existing.open = false;
                    return;
                }
            }
            let part = TextPart {
                id: ids.next(),
                content: text.clone(),
                open: false,
            };
            upsert(&mut doc.parts, Part::Text(part));
        }
        EventPayload::ReasoningDelta { delta } => {
            if let Some(Part::Reasoning(reasoning)) = doc.parts.last_mut() {
                if reasoning.open {
                    reasoning.content.push_str(delta);
                    return;
                }
            }
            let part = ReasoningPart {
                id: ids.next(),
                content: delta.clone(),
                open: true,
            };
            upsert(&mut doc.parts, Part::Reasoning(part));
        }
        EventPayload::ReasoningComplete { text } => {
            if let Some(Part::Reasoning(existing)) = doc.parts.last_mut() {
                if existing.open {
                    existing.content = text.clone();
                    existing.open = false;
                    return;
                }
            }
            let part = ReasoningPart {
                id: ids.next(),
                content: text.clone(),
                open: false,
            };
            upsert(&mut doc.parts, Part::Reasoning(part));
        }
        EventPayload::ToolStart {
            tool_id,
            tool_name,
            arguments,
            supersedes,
            ..
        } => {
            if enriched.suppress_from_main_chat {
                record_nested_tool(
                    doc,
                    enriched,
                    tool_id,
                    supersedes.as_deref(),
                    Some(tool_name),
                    ToolState::Pending,
                );
                return;
            }

            let canonical = resolved_tool_id(enriched, tool_id);
            if let Some(part_id) = find_tool_part(doc, &canonical, tool_id, supersedes.as_deref())
            {
                alias_tool(doc, &canonical, tool_id, supersedes.as_deref(), part_id);
                if let Some(Part::Tool(tool)) = doc.part_mut(part_id) {
                    if tool.state.is_terminal() {
                        debug!("ignoring start for terminal tool part '{canonical}'");
                        return;
                    }
                    tool.tool_id = canonical;
                    tool.tool_name = tool_name.clone();
                    tool.arguments = arguments.clone();
                }
                return;
            }

            let part = ToolPart {
                id: ids.next(),
                tool_id: canonical.clone(),
                tool_name: tool_name.clone(),
                arguments: arguments.clone(),
                state: ToolState::Pending,
                output: None,
                question: None,
            };
            let part_id = part.id;
            upsert(&mut doc.parts, Part::Tool(part));
            alias_tool(doc, &canonical, tool_id, supersedes.as_deref(), part_id);
        }
        EventPayload::ToolUpdate {
            tool_id,
            phase,
            question,
        } => {
            if enriched.suppress_from_main_chat {
                record_nested_tool(doc, enriched, tool_id, None, None, ToolState::Running);
                return;
            }

            let canonical = resolved_tool_id(enriched, tool_id);
            let Some(part_id) = find_tool_part(doc, &canonical, tool_id, None) else {
                warn!("tool update for unknown tool '{canonical}'");
                return;
            };
            if let Some(Part::Tool(tool)) = doc.part_mut(part_id) {
                if tool.state.is_terminal() {
                    debug!("ignoring update for terminal tool part '{canonical}'");
                    return;
                }
                if *phase == ToolPhase::Running {
                    tool.set_running();
                }
                tool.question = question.clone();
            }
        }
        EventPayload::ToolComplete {
            tool_id,
            outcome,
            output,
            supersedes,
        } => {
            let canonical = resolved_tool_id(enriched, tool_id);

            if enriched.suppress_from_main_chat {
                record_nested_tool(
                    doc,
                    enriched,
                    tool_id,
                    supersedes.as_deref(),
                    None,
                    ToolState::from_outcome(*outcome),
                );
            } else if let Some(part_id) =
                find_tool_part(doc, &canonical, tool_id, supersedes.as_deref())
            {
                alias_tool(doc, &canonical, tool_id, supersedes.as_deref(), part_id);
                if let Some(Part::Tool(tool)) = doc.part_mut(part_id) {
                    if tool.state.is_terminal() {
                        debug!("ignoring completion for terminal tool part '{canonical}'");
                    } else {
                        tool.tool_id = canonical.clone();
                        tool.finish(*outcome, output.clone());
                    }
                }
            } else {
                // Completion without a visible start still renders.
                let part = ToolPart {
                    id: ids.next(),
                    tool_id: canonical.clone(),
                    tool_name: canonical.clone(),
                    arguments: Value::Null,
                    state: ToolState::from_outcome(*outcome),
                    output: Some(output.clone()),
                    question: None,
                };
                let part_id = part.id;
                upsert(&mut doc.parts, Part::Tool(part));
                alias_tool(doc, &canonical, tool_id, supersedes.as_deref(), part_id);
            }

            // The spawning call returning finalizes foreground sub-agents;
            // background agents stay on their own track.
            finalize_group_for_spawn_tool(doc, &canonical, *outcome);
        }
        EventPayload::AgentStart {
            agent_id,
            task,
            background,
            ..
        } => {
            let spawn_key = enriched
                .resolved_tool_id
                .clone()
                .unwrap_or_else(|| format!("agent:{agent_id}"));

            let group_id = match doc.group_part_ids.get(&spawn_key) {
                Some(&id) => id,
                None => {
                    let part = AgentGroupPart {
                        id: ids.next(),
                        spawn_tool_id: spawn_key.clone(),
                        entries: Vec::new(),
                    };
                    let id = part.id;
                    upsert(&mut doc.parts, Part::AgentGroup(part));
                    doc.group_part_ids.insert(spawn_key.clone(), id);
                    id
                }
            };

            if let Some(Part::AgentGroup(group)) = doc.part_mut(group_id) {
                match group.entry_mut(agent_id) {
                    Some(entry) => {
                        entry.task = task.clone();
                        entry.background = *background;
                    }
                    None => group.entries.push(AgentEntry {
                        agent_id: agent_id.clone(),
                        task: task.clone(),
                        state: AgentRunState::Pending,
                        background: *background,
                        note: None,
                        tools: Vec::new(),
                    }),
                }
            }
            doc.group_of_agent.insert(agent_id.clone(), group_id);
        }
        EventPayload::AgentUpdate { agent_id, note } => {
            let Some(entry) = agent_entry_mut(doc, agent_id) else {
                warn!("agent update for untracked agent '{agent_id}'");
                return;
            };
            if entry.state.is_terminal() {
                debug!("ignoring update for terminal agent '{agent_id}'");
                return;
            }
            entry.set_running();
            entry.note = note.clone();
        }
        EventPayload::AgentComplete { agent_id, outcome } => {
            let Some(entry) = agent_entry_mut(doc, agent_id) else {
                warn!("agent completion for untracked agent '{agent_id}'");
                return;
            };
            if !entry.finish(*outcome) {
                debug!("ignoring completion for terminal agent '{agent_id}'");
            }
        }
        EventPayload::TaskUpdate {
            task_id,
            title,
            state,
        } => {
            let list_id = match doc.task_list_id {
                Some(id) => id,
                None => {
                    let part = TaskListPart {
                        id: ids.next(),
                        items: Vec::new(),
                    };
                    let id = part.id;
                    upsert(&mut doc.parts, Part::TaskList(part));
                    doc.task_list_id = Some(id);
                    id
                }
            };

            if let Some(Part::TaskList(list)) = doc.part_mut(list_id) {
                match list.items.iter_mut().find(|item| item.task_id == *task_id) {
                    Some(item) => {
                        item.title = title.clone();
                        item.state = *state;
                    }
                    None => list.items.push(TaskItem {
                        task_id: task_id.clone(),
                        title: title.clone(),
                        state: *state,
                    }),
                }
            }
        }
        EventPayload::SessionStatus { state, detail } => {
            let status_id = ensure_status_part(ids, doc);
            if let Some(Part::Status(status)) = doc.part_mut(status_id) {
                status.state = Some(*state);
                status.detail = detail.clone();
            }
        }
        EventPayload::SessionError { message } => {
            let status_id = ensure_status_part(ids, doc);
            if let Some(Part::Status(status)) = doc.part_mut(status_id) {
                status.error = Some(message.clone());
            }
        }
        EventPayload::Usage {
            input_tokens,
            output_tokens,
        } => {
            doc.usage = Some(UsageTotals {
                input_tokens: *input_tokens,
                output_tokens: *output_tokens,
            });
        }
        EventPayload::LifecycleStart => {}
        EventPayload::LifecycleEnd => {
            close_open_content(doc);
        }
        EventPayload::LifecycleAbort => {
            close_open_content(doc);
            interrupt_in_flight(doc);
        }
        EventPayload::LifecycleError { message } => {
            close_open_content(doc);
            let status_id = ensure_status_part(ids, doc);
            if let Some(Part::Status(status)) = doc.part_mut(status_id) {
                status.error = Some(message.clone());
            }
        }
    }
}

fn resolved_tool_id(enriched: &EnrichedEvent, raw: &str) -> String {
    enriched
        .resolved_tool_id
        .clone()
        .unwrap_or_else(|| raw.to_string())
}

fn find_tool_part(
    doc: &MessageDoc,
    canonical: &str,
    raw: &str,
    supersedes: Option<&str>,
) -> Option<PartId> {
    doc.tool_part_ids
        .get(canonical)
        .or_else(|| doc.tool_part_ids.get(raw))
        .or_else(|| supersedes.and_then(|provisional| doc.tool_part_ids.get(provisional)))
        .copied()
}

fn alias_tool(
    doc: &mut MessageDoc,
    canonical: &str,
    raw: &str,
    supersedes: Option<&str>,
    part_id: PartId,
) {
    doc.tool_part_ids.insert(canonical.to_string(), part_id);
    doc.tool_part_ids.insert(raw.to_string(), part_id);
    if let Some(provisional) = supersedes {
        doc.tool_part_ids.insert(provisional.to_string(), part_id);
    }
}

/// Records a sub-agent-owned tool under its owning agent group entry.
fn record_nested_tool(
    doc: &mut MessageDoc,
    enriched: &EnrichedEvent,
    raw: &str,
    supersedes: Option<&str>,
    tool_name: Option<&str>,
    state: ToolState,
) {
    let canonical = resolved_tool_id(enriched, raw);
    let Some(owner) = enriched.resolved_agent_id.as_deref() else {
        warn!("sub-agent tool '{canonical}' has no resolved owner");
        return;
    };
    let Some(&group_id) = doc.group_of_agent.get(owner) else {
        warn!("sub-agent tool '{canonical}' owned by untracked agent '{owner}'");
        return;
    };
    let Some(Part::AgentGroup(group)) = doc.part_mut(group_id) else {
        return;
    };
    let Some(entry) = group.entry_mut(owner) else {
        return;
    };

    let existing = entry.tools.iter_mut().find(|tool| {
        tool.tool_id == canonical
            || tool.tool_id == raw
            || supersedes.is_some_and(|provisional| tool.tool_id == provisional)
    });
    match existing {
        Some(tool) => {
            if tool.state.is_terminal() {
                debug!("ignoring mutation of terminal nested tool '{canonical}'");
                return;
            }
            tool.tool_id = canonical;
            if let Some(name) = tool_name {
                tool.tool_name = name.to_string();
            }
            tool.state = state;
        }
        None => entry.tools.push(NestedToolCall {
            tool_id: canonical.clone(),
            tool_name: tool_name.unwrap_or(&canonical).to_string(),
            state,
        }),
    }
}

fn agent_entry_mut<'doc>(
    doc: &'doc mut MessageDoc,
    agent_id: &str,
) -> Option<&'doc mut AgentEntry> {
    let group_id = *doc.group_of_agent.get(agent_id)?;
    match doc.part_mut(group_id) {
        Some(Part::AgentGroup(group)) => group.entry_mut(agent_id),
        _ => None,
    }
}

fn ensure_status_part(ids: &mut PartIdGen, doc: &mut MessageDoc) -> PartId {
    match doc.status_id {
        Some(id) => id,
        None => {
            let part = StatusPart {
                id: ids.next(),
                state: None::<SessionState>,
                detail: None,
                error: None,
            };
            let id = part.id;
            upsert(&mut doc.parts, Part::Status(part));
            doc.status_id = Some(id);
            id
        }
    }
}

fn finalize_group_for_spawn_tool(doc: &mut MessageDoc, spawn_tool_id: &str, outcome: ToolOutcome) {
    let Some(&group_id) = doc.group_part_ids.get(spawn_tool_id) else {
        return;
    };
    let Some(Part::AgentGroup(group)) = doc.part_mut(group_id) else {
        return;
    };

    let state = match outcome {
        ToolOutcome::Completed => AgentRunState::Completed,
        ToolOutcome::Error => AgentRunState::Error,
        ToolOutcome::Interrupted => AgentRunState::Interrupted,
    };
    for entry in &mut group.entries {
        if !entry.background && !entry.state.is_terminal() {
            entry.state = state;
        }
    }
}

fn close_open_content(doc: &mut MessageDoc) {
    for part in &mut doc.parts {
        match part {
            Part::Text(text) => text.open = false,
            Part::Reasoning(reasoning) => reasoning.open = false,
            _ => {}
        }
    }
}

/// Run teardown: whatever is still in flight renders as interrupted.
/// Background agents are detached and survive the run.
fn interrupt_in_flight(doc: &mut MessageDoc) {
    for part in &mut doc.parts {
        match part {
            Part::Tool(tool) => {
                if !tool.state.is_terminal() {
                    tool.state = ToolState::Interrupted;
                }
            }
            Part::AgentGroup(group) => {
                for entry in &mut group.entries {
                    if !entry.background && !entry.state.is_terminal() {
                        entry.state = AgentRunState::Interrupted;
                    }
                    for tool in &mut entry.tools {
                        if !tool.state.is_terminal() {
                            tool.state = ToolState::Interrupted;
                        }
                    }
                }
            }
            _ => {}
        }
    }
}
