//! Shared normalization from native source units to bus events.
//!
//! Delivery mechanics differ per adapter; what a unit *means* does not.
//! Every adapter owns one [`UnitTranslator`] for id normalization and one
//! [`LifecyclePublisher`] for the exactly-one-terminal-event guarantee.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use log::warn;

use crate::event::{BusEvent, EventPayload, ToolPhase};
use crate::ids::provisional_tool_id;
use crate::source::{EventSink, SourceContext, SourceUnit};

/// Translates native units into bus events, minting provisional tool ids
/// for invocations whose canonical id is not known yet and pairing later
/// canonical ids back to them (per tool name, oldest first).
pub struct UnitTranslator {
    context: SourceContext,
    next_provisional: u64,
    outstanding: HashMap<String, VecDeque<String>>,
    known_call_ids: HashSet<String>,
}

impl UnitTranslator {
    #[must_use]
    pub fn new(context: SourceContext) -> Self {
        Self {
            context,
            next_provisional: 0,
            outstanding: HashMap::new(),
            known_call_ids: HashSet::new(),
        }
    }

    /// Returns the context this translator stamps onto events.
    #[must_use]
    pub fn context(&self) -> &SourceContext {
        &self.context
    }

    /// Translates one unit. Empty content deltas produce no event, matching
    /// how providers skip empty chunks.
    pub fn translate(&mut self, unit: SourceUnit) -> Option<BusEvent> {
        let payload = match unit {
            SourceUnit::Text { delta } => {
                if delta.is_empty() {
                    return None;
                }
                EventPayload::TextDelta { delta }
            }
            SourceUnit::TextDone { text } => EventPayload::TextComplete { text },
            SourceUnit::Reasoning { delta } => {
                if delta.is_empty() {
                    return None;
                }
                EventPayload::ReasoningDelta { delta }
            }
            SourceUnit::ReasoningDone { text } => EventPayload::ReasoningComplete { text },
            SourceUnit::ToolStarted {
                call_id,
                tool_name,
                arguments,
                owner_agent_id,
            } => {
                let tool_id = match call_id {
                    Some(id) => {
                        self.known_call_ids.insert(id.clone());
                        id
                    }
                    None => self.mint_provisional(&tool_name),
                };
                EventPayload::ToolStart {
                    tool_id,
                    tool_name,
                    arguments,
                    owner_agent_id,
                    supersedes: None,
                }
            }
            SourceUnit::ToolProgress { call_id, question } => EventPayload::ToolUpdate {
                tool_id: call_id,
                phase: ToolPhase::Running,
                question,
            },
            SourceUnit::ToolFinished {
                call_id,
                tool_name,
                outcome,
                output,
            } => {
                let supersedes = if self.known_call_ids.contains(&call_id) {
                    None
                } else {
                    self.take_outstanding(&tool_name)
                };
                self.known_call_ids.insert(call_id.clone());
                EventPayload::ToolComplete {
                    tool_id: call_id,
                    outcome,
                    output,
                    supersedes,
                }
            }
            SourceUnit::AgentSpawned {
                agent_id,
                spawned_by,
                task,
                background,
            } => EventPayload::AgentStart {
                agent_id,
                parent_tool_id: spawned_by,
                task,
                background,
            },
            SourceUnit::AgentProgress { agent_id, note } => {
                EventPayload::AgentUpdate { agent_id, note }
            }
            SourceUnit::AgentFinished { agent_id, outcome } => {
                EventPayload::AgentComplete { agent_id, outcome }
            }
            SourceUnit::StatusChanged { state, detail } => {
                EventPayload::SessionStatus { state, detail }
            }
            SourceUnit::UsageReported {
                input_tokens,
                output_tokens,
            } => EventPayload::Usage {
                input_tokens,
                output_tokens,
            },
        };

        Some(self.context.event(payload))
    }

    fn mint_provisional(&mut self, tool_name: &str) -> String {
        let id = provisional_tool_id(&self.context.source_id, self.next_provisional);
        self.next_provisional += 1;
        self.outstanding
            .entry(tool_name.to_string())
            .or_default()
            .push_back(id.clone());
        id
    }

    fn take_outstanding(&mut self, tool_name: &str) -> Option<String> {
        self.outstanding
            .get_mut(tool_name)
            .and_then(VecDeque::pop_front)
    }
}

/// Publishes lifecycle events for one bound handle, guaranteeing exactly one
/// terminal event no matter how delivery and disposal interleave.
pub struct LifecyclePublisher {
    sink: Arc<dyn EventSink>,
    context: SourceContext,
    terminal_emitted: AtomicBool,
}

impl LifecyclePublisher {
    #[must_use]
    pub fn new(sink: Arc<dyn EventSink>, context: SourceContext) -> Self {
        Self {
            sink,
            context,
            terminal_emitted: AtomicBool::new(false),
        }
    }

    /// Publishes `LifecycleStart`.
    pub fn started(&self) {
        self.publish(EventPayload::LifecycleStart);
    }

    /// Publishes `LifecycleEnd` unless a terminal event was already sent.
    pub fn ended(&self) -> bool {
        self.terminal(EventPayload::LifecycleEnd)
    }

    /// Publishes `LifecycleAbort` unless a terminal event was already sent.
    pub fn aborted(&self) -> bool {
        self.terminal(EventPayload::LifecycleAbort)
    }

    /// Publishes `LifecycleError` unless a terminal event was already sent.
    pub fn errored(&self, message: impl Into<String>) -> bool {
        self.terminal(EventPayload::LifecycleError {
            message: message.into(),
        })
    }

    /// Returns true once a terminal event has been published.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        self.terminal_emitted.load(Ordering::SeqCst)
    }

    /// Validates-and-publishes a non-lifecycle event through the sink,
    /// logging rejections instead of surfacing them to delivery loops.
    pub fn publish(&self, payload: EventPayload) {
        let event = self.context.event(payload);
        if let Err(error) = self.sink.publish(event) {
            warn!(
                "source '{}' event rejected at the bus boundary: {error}",
                self.context.source_id
            );
        }
    }

    /// Forwards an already-built event, logging rejections.
    pub fn publish_event(&self, event: BusEvent) {
        if let Err(error) = self.sink.publish(event) {
            warn!(
                "source '{}' event rejected at the bus boundary: {error}",
                self.context.source_id
            );
        }
    }

    fn terminal(&self, payload: EventPayload) -> bool {
        if self.terminal_emitted.swap(true, Ordering::SeqCst) {
            return false;
        }

        self.publish(payload);
        true
    }
}
