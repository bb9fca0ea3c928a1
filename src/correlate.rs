//! Correlation service: resolves provisional identifiers to final tool and
//! agent ownership, tags sub-agent-owned tool events, and discards events
//! belonging to a cancelled or superseded run.
//!
//! All state lives here and is mutated only through `register_run`,
//! `enrich`, and `reset`; there is no ambient active-run flag.

use std::collections::{HashMap, HashSet};

use log::{debug, warn};
use stream_source::{is_provisional_tool_id, BusEvent, EventPayload, RunId, SessionId};

/// What the pipeline should do with an enriched event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// Apply to the part store and deliver to batch consumers.
    Apply,
    /// The event belongs to a non-active run; discard after enrichment.
    /// Expected under normal cancellation, not an error.
    StaleRun,
}

/// A bus event plus resolved ownership, produced only by enrichment and
/// discarded after application.
#[derive(Debug, Clone, PartialEq)]
pub struct EnrichedEvent {
    pub event: BusEvent,
    /// Canonical tool id for events that referenced a provisional one, or
    /// the spawn point of an agent event.
    pub resolved_tool_id: Option<String>,
    /// Owning agent for tool events, or the subject of agent events.
    pub resolved_agent_id: Option<String>,
    /// True when a tracked sub-agent owns this tool event.
    pub is_subagent_tool: bool,
    /// True when the event must not render in the top-level transcript.
    pub suppress_from_main_chat: bool,
    pub disposition: Disposition,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct ActiveRun {
    run_id: RunId,
    session_id: SessionId,
}

/// Per-run correlation state. Owned exclusively by the pipeline.
#[derive(Default)]
pub struct CorrelationService {
    active: Option<ActiveRun>,
    canonical_by_provisional: HashMap<String, String>,
    /// Agent id -> resolved spawn tool id, for every tracked sub-agent.
    subagent_spawn_tool: HashMap<String, String>,
    /// Tool id -> owning agent id.
    tool_owner: HashMap<String, String>,
    /// Tool ids known to belong to a sub-agent.
    subagent_tools: HashSet<String>,
}

impl CorrelationService {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Declares `run_id` the active run, superseding the previous one and
    /// clearing all per-run state. The marker is monotonic: registering an
    /// older run than the current one is ignored.
    pub fn register_run(&mut self, run_id: RunId, session_id: SessionId) {
        if let Some(active) = self.active {
            if run_id < active.run_id {
                warn!(
                    "ignoring register_run({run_id}): run {} is already active",
                    active.run_id
                );
                return;
            }
            if run_id == active.run_id {
                return;
            }
        }

        self.clear_run_state();
        self.active = Some(ActiveRun { run_id, session_id });
    }

    /// Clears all state at run termination.
    pub fn reset(&mut self) {
        self.active = None;
        self.clear_run_state();
    }

    /// The currently active run, if any.
    #[must_use]
    pub fn active_run(&self) -> Option<RunId> {
        self.active.map(|active| active.run_id)
    }

    /// Resolves ownership for one event.
    ///
    /// Stale events are enriched with the current maps but never mutate
    /// them; attribution is first-seen-wins throughout, so a sub-agent
    /// reference arriving after its owning tool completed does not re-tag
    /// earlier events.
    pub fn enrich(&mut self, event: BusEvent) -> EnrichedEvent {
        let stale = self
            .active
            .map_or(true, |active| active.run_id != event.run_id);
        let disposition = if stale {
            Disposition::StaleRun
        } else {
            Disposition::Apply
        };

        let payload = event.payload.clone();
        let mut enriched = EnrichedEvent {
            event,
            resolved_tool_id: None,
            resolved_agent_id: None,
            is_subagent_tool: false,
            suppress_from_main_chat: false,
            disposition,
        };

        match payload {
            EventPayload::ToolStart {
                tool_id,
                owner_agent_id,
                supersedes,
                ..
            } => {
                if !stale {
                    if let Some(provisional) = &supersedes {
                        self.record_supersede(provisional, &tool_id);
                    }
                }
                let resolved = self.resolve_tool_id(&tool_id);
                if !stale {
                    if let Some(owner) = owner_agent_id {
                        self.record_tool_owner(&resolved, owner);
                    }
                }
                self.tag_tool_event(&mut enriched, resolved);
            }
            EventPayload::ToolUpdate { tool_id, .. } => {
                let resolved = self.resolve_tool_id(&tool_id);
                self.tag_tool_event(&mut enriched, resolved);
            }
            EventPayload::ToolComplete {
                tool_id,
                supersedes,
                ..
            } => {
                if !stale {
                    if let Some(provisional) = &supersedes {
                        self.record_supersede(provisional, &tool_id);
                    }
                }
                let resolved = self.resolve_tool_id(&tool_id);
                self.tag_tool_event(&mut enriched, resolved);
            }
            EventPayload::AgentStart {
                agent_id,
                parent_tool_id,
                ..
            } => {
                let resolved_parent = parent_tool_id.map(|parent| self.resolve_tool_id(&parent));
                if !stale {
                    if let Some(parent) = &resolved_parent {
                        self.subagent_spawn_tool
                            .entry(agent_id.clone())
                            .or_insert_with(|| parent.clone());
                    }
                }
                enriched.resolved_tool_id = resolved_parent;
                enriched.resolved_agent_id = Some(agent_id);
            }
            EventPayload::AgentUpdate { agent_id, .. }
            | EventPayload::AgentComplete { agent_id, .. } => {
                enriched.resolved_tool_id = self.subagent_spawn_tool.get(&agent_id).cloned();
                enriched.resolved_agent_id = Some(agent_id);
            }
            _ => {}
        }

        enriched
    }

    fn tag_tool_event(&self, enriched: &mut EnrichedEvent, resolved: String) {
        enriched.is_subagent_tool = self.subagent_tools.contains(&resolved);
        enriched.suppress_from_main_chat = enriched.is_subagent_tool;
        enriched.resolved_agent_id = self.tool_owner.get(&resolved).cloned();
        enriched.resolved_tool_id = Some(resolved);
    }

    fn resolve_tool_id(&self, tool_id: &str) -> String {
        match self.canonical_by_provisional.get(tool_id) {
            Some(canonical) => canonical.clone(),
            None => tool_id.to_string(),
        }
    }

    /// First-seen-wins: once a provisional id has a canonical id, later
    /// claims are ignored. State recorded under the provisional id migrates
    /// to the canonical one.
    fn record_supersede(&mut self, provisional: &str, canonical: &str) {
        if !is_provisional_tool_id(provisional) {
            return;
        }
        if let Some(existing) = self.canonical_by_provisional.get(provisional) {
            if existing != canonical {
                debug!(
                    "provisional '{provisional}' already resolved to '{existing}'; \
                     ignoring later claim '{canonical}'"
                );
            }
            return;
        }

        self.canonical_by_provisional
            .insert(provisional.to_string(), canonical.to_string());

        if let Some(owner) = self.tool_owner.remove(provisional) {
            self.tool_owner
                .entry(canonical.to_string())
                .or_insert(owner);
        }
        if self.subagent_tools.remove(provisional) {
            self.subagent_tools.insert(canonical.to_string());
        }
        for spawn_tool in self.subagent_spawn_tool.values_mut() {
            if spawn_tool == provisional {
                *spawn_tool = canonical.to_string();
            }
        }
    }

    fn record_tool_owner(&mut self, tool_id: &str, owner: String) {
        let owned_by_subagent = self.subagent_spawn_tool.contains_key(&owner);
        self.tool_owner
            .entry(tool_id.to_string())
            .or_insert(owner);
        if owned_by_subagent {
            self.subagent_tools.insert(tool_id.to_string());
        }
    }

    fn clear_run_state(&mut self) {
        self.canonical_by_provisional.clear();
        self.subagent_spawn_tool.clear();
        self.tool_owner.clear();
        self.subagent_tools.clear();
    }
}
