//! Coalescing key function.
//!
//! Maps an event to "never merge" (`None`) or a merge key. Within one flush
//! window only the most recent event per key survives; events without a key
//! are all preserved in arrival order.

use stream_source::{BusEvent, EventPayload, RunId, SessionId};

/// Composite merge key: the variant encodes the event kind, the field the
/// entity whose state the event replaces. Distinct kinds never collide.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum CoalesceKey {
    TextComplete(RunId),
    ReasoningComplete(RunId),
    ToolStart(String),
    ToolUpdate(String),
    ToolComplete(String),
    AgentStart(String),
    AgentUpdate(String),
    AgentComplete(String),
    TaskUpdate(String),
    SessionStatus(SessionId),
    SessionError(SessionId),
    Usage(RunId),
}

/// Returns the merge key for `event`, or `None` when every instance must be
/// preserved (incremental content deltas and lifecycle signals).
#[must_use]
pub fn coalesce_key(event: &BusEvent) -> Option<CoalesceKey> {
    match &event.payload {
        EventPayload::TextDelta { .. } | EventPayload::ReasoningDelta { .. } => None,
        EventPayload::LifecycleStart
        | EventPayload::LifecycleEnd
        | EventPayload::LifecycleAbort
        | EventPayload::LifecycleError { .. } => None,
        EventPayload::TextComplete { .. } => Some(CoalesceKey::TextComplete(event.run_id)),
        EventPayload::ReasoningComplete { .. } => {
            Some(CoalesceKey::ReasoningComplete(event.run_id))
        }
        EventPayload::ToolStart { tool_id, .. } => Some(CoalesceKey::ToolStart(tool_id.clone())),
        EventPayload::ToolUpdate { tool_id, .. } => Some(CoalesceKey::ToolUpdate(tool_id.clone())),
        EventPayload::ToolComplete { tool_id, .. } => {
            Some(CoalesceKey::ToolComplete(tool_id.clone()))
        }
        EventPayload::AgentStart { agent_id, .. } => {
            Some(CoalesceKey::AgentStart(agent_id.clone()))
        }
        EventPayload::AgentUpdate { agent_id, .. } => {
            Some(CoalesceKey::AgentUpdate(agent_id.clone()))
        }
        EventPayload::AgentComplete { agent_id, .. } => {
            Some(CoalesceKey::AgentComplete(agent_id.clone()))
        }
        EventPayload::TaskUpdate { task_id, .. } => Some(CoalesceKey::TaskUpdate(task_id.clone())),
        EventPayload::SessionStatus { .. } => Some(CoalesceKey::SessionStatus(event.session_id)),
        EventPayload::SessionError { .. } => Some(CoalesceKey::SessionError(event.session_id)),
        EventPayload::Usage { .. } => Some(CoalesceKey::Usage(event.run_id)),
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;
    use stream_source::{BusEvent, EventPayload, SessionId, ToolOutcome};

    use super::{coalesce_key, CoalesceKey};

    fn event(payload: EventPayload) -> BusEvent {
        BusEvent::new(SessionId::new(), 4, payload)
    }

    #[test]
    fn content_deltas_never_merge() {
        assert_eq!(
            coalesce_key(&event(EventPayload::TextDelta {
                delta: "a".to_string(),
            })),
            None
        );
        assert_eq!(
            coalesce_key(&event(EventPayload::ReasoningDelta {
                delta: "b".to_string(),
            })),
            None
        );
    }

    #[test]
    fn lifecycle_signals_never_merge() {
        assert_eq!(coalesce_key(&event(EventPayload::LifecycleStart)), None);
        assert_eq!(coalesce_key(&event(EventPayload::LifecycleEnd)), None);
    }

    #[test]
    fn tool_state_events_key_by_kind_and_tool_id() {
        let start = coalesce_key(&event(EventPayload::ToolStart {
            tool_id: "call_1".to_string(),
            tool_name: "read".to_string(),
            arguments: json!({}),
            owner_agent_id: None,
            supersedes: None,
        }));
        let complete = coalesce_key(&event(EventPayload::ToolComplete {
            tool_id: "call_1".to_string(),
            outcome: ToolOutcome::Completed,
            output: json!("ok"),
            supersedes: None,
        }));

        assert_eq!(start, Some(CoalesceKey::ToolStart("call_1".to_string())));
        assert_eq!(
            complete,
            Some(CoalesceKey::ToolComplete("call_1".to_string()))
        );
        assert_ne!(start, complete);
    }

    #[test]
    fn same_kind_different_entities_do_not_collide() {
        let first = coalesce_key(&event(EventPayload::AgentUpdate {
            agent_id: "agent-1".to_string(),
            note: None,
        }));
        let second = coalesce_key(&event(EventPayload::AgentUpdate {
            agent_id: "agent-2".to_string(),
            note: None,
        }));

        assert_ne!(first, second);
    }
}
