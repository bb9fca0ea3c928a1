//! Deterministic ingestion, ordering, and aggregation pipeline for
//! transcript-style agent streams.
//!
//! Takes streaming output from backends with incompatible delivery shapes
//! (pull, push, hybrid replay — see the `stream_source` contract crate) and
//! produces one chronologically-ordered, incrementally-appendable document
//! model a terminal UI can render without tearing, duplication, or
//! reordering, at interactive frame rates under bursty load.
//!
//! # Public API Overview
//! - Assemble the stages with [`Pipeline`] and feed it through its bus.
//! - Subscribe to enriched, coalesced batches once per flush tick.
//! - Read ordered [`Part`] snapshots per message for rendering.
//! - Individual stages ([`EventBus`], [`BatchDispatcher`],
//!   [`CorrelationService`], [`EchoSuppressor`], [`DocumentStore`]) are
//!   public for hosts that compose their own wiring.

pub mod bus;
pub mod coalesce;
pub mod config;
pub mod correlate;
pub mod dispatch;
pub mod echo;
pub mod part;
pub mod pipeline;
pub mod store;

/// Validated synchronous event fan-out.
pub use crate::bus::{EventBus, SubscriptionId};
/// Merge-key function deciding what may coalesce within a flush window.
pub use crate::coalesce::{coalesce_key, CoalesceKey};
/// Builder + environment configuration.
pub use crate::config::PipelineConfig;
/// Enrichment: ownership resolution and stale-run dispositions.
pub use crate::correlate::{CorrelationService, Disposition, EnrichedEvent};
/// Frame batching with last-write-wins coalescing.
pub use crate::dispatch::{
    BatchConsumerId, BatchDispatcher, DispatchCounters, DEFAULT_FLUSH_INTERVAL,
};
/// Verbatim tool-result echo filtering.
pub use crate::echo::EchoSuppressor;
/// Renderable part model and ordered upsert.
pub use crate::part::{
    upsert, AgentEntry, AgentGroupPart, AgentRunState, NestedToolCall, Part, PartId, PartIdGen,
    ReasoningPart, StatusPart, TaskItem, TaskListPart, TextPart, ToolPart, ToolState,
};
/// Assembled pipeline.
pub use crate::pipeline::{BatchSubscriptionId, Pipeline};
/// Canonical per-message part sequences.
pub use crate::store::{DocumentStore, MessageDoc, UsageTotals};
