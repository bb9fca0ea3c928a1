use std::sync::{Arc, Mutex};

use serde_json::json;
use stream_loom::{AgentRunState, EnrichedEvent, Part, Pipeline, PipelineConfig, ToolState};
use stream_source::{
    BusEvent, EventKind, EventPayload, SessionId, TaskState, ToolOutcome,
};

const RUN: u64 = 1;

fn setup() -> (Pipeline, SessionId, Arc<Mutex<Vec<EnrichedEvent>>>) {
    let _ = env_logger::builder().is_test(true).try_init();
    let pipeline = Pipeline::headless(PipelineConfig::default());
    let session = SessionId::new();
    pipeline.register_run(RUN, session);

    let enriched = Arc::new(Mutex::new(Vec::new()));
    let enriched_in_subscriber = Arc::clone(&enriched);
    pipeline.subscribe_batches(move |batch| {
        enriched_in_subscriber
            .lock()
            .expect("enriched lock")
            .extend(batch.iter().cloned());
    });

    (pipeline, session, enriched)
}

fn publish(pipeline: &Pipeline, session: SessionId, payload: EventPayload) {
    pipeline
        .bus()
        .publish(BusEvent::new(session, RUN, payload))
        .expect("event publishes");
}

fn tool_start(tool_id: &str, owner: Option<&str>) -> EventPayload {
    EventPayload::ToolStart {
        tool_id: tool_id.to_string(),
        tool_name: "task".to_string(),
        arguments: json!({}),
        owner_agent_id: owner.map(str::to_string),
        supersedes: None,
    }
}

fn tool_complete(tool_id: &str) -> EventPayload {
    EventPayload::ToolComplete {
        tool_id: tool_id.to_string(),
        outcome: ToolOutcome::Completed,
        output: json!("done"),
        supersedes: None,
    }
}

fn agent_start(agent_id: &str, parent: &str) -> EventPayload {
    EventPayload::AgentStart {
        agent_id: agent_id.to_string(),
        parent_tool_id: Some(parent.to_string()),
        task: "explore".to_string(),
        background: false,
    }
}

#[test]
fn concurrent_subagents_resolve_to_their_spawn_tool() {
    let (pipeline, session, enriched) = setup();

    publish(&pipeline, session, tool_start("t1", None));
    publish(&pipeline, session, agent_start("agent-a", "t1"));
    publish(&pipeline, session, agent_start("agent-b", "t1"));
    publish(&pipeline, session, tool_start("t2", Some("agent-a")));
    publish(&pipeline, session, tool_complete("t2"));
    publish(&pipeline, session, tool_complete("t1"));
    pipeline.flush_now();

    let enriched = enriched.lock().expect("enriched lock");

    // Both agent starts resolve to the spawning tool.
    let agent_starts: Vec<_> = enriched
        .iter()
        .filter(|event| event.event.kind() == EventKind::AgentStart)
        .collect();
    assert_eq!(agent_starts.len(), 2);
    for start in &agent_starts {
        assert_eq!(start.resolved_tool_id.as_deref(), Some("t1"));
    }

    // The nested tool is tagged sub-agent-owned; the spawning tool is not.
    let nested_complete = enriched
        .iter()
        .find(|event| {
            matches!(
                &event.event.payload,
                EventPayload::ToolComplete { tool_id, .. } if tool_id == "t2"
            )
        })
        .expect("nested completion delivered");
    assert!(nested_complete.is_subagent_tool);
    assert!(nested_complete.suppress_from_main_chat);
    assert_eq!(nested_complete.resolved_agent_id.as_deref(), Some("agent-a"));

    let spawn_complete = enriched
        .iter()
        .find(|event| {
            matches!(
                &event.event.payload,
                EventPayload::ToolComplete { tool_id, .. } if tool_id == "t1"
            )
        })
        .expect("spawn completion delivered");
    assert!(!spawn_complete.is_subagent_tool);

    // Document shape: the nested tool lives under agent-a, not top-level.
    let parts = pipeline.snapshot(RUN).expect("message exists");
    let top_level_tools: Vec<_> = parts
        .iter()
        .filter_map(|part| match part {
            Part::Tool(tool) => Some(tool.tool_id.as_str()),
            _ => None,
        })
        .collect();
    assert_eq!(top_level_tools, vec!["t1"]);

    let group = parts
        .iter()
        .find_map(|part| match part {
            Part::AgentGroup(group) => Some(group),
            _ => None,
        })
        .expect("agent group exists");
    assert_eq!(group.spawn_tool_id, "t1");
    assert_eq!(group.entries.len(), 2);
    let entry = group.entry("agent-a").expect("agent-a tracked");
    assert_eq!(entry.tools.len(), 1);
    assert_eq!(entry.tools[0].state, ToolState::Completed);

    // The spawning call returning finalizes the foreground agents.
    assert_eq!(entry.state, AgentRunState::Completed);

    pipeline.shutdown();
}

#[test]
fn provisional_tool_upgrades_in_place_across_the_pipeline() {
    let (pipeline, session, _enriched) = setup();

    publish(&pipeline, session, tool_start("prov:pull-1:0", None));
    pipeline.flush_now();
    publish(
        &pipeline,
        session,
        EventPayload::ToolComplete {
            tool_id: "call_9".to_string(),
            outcome: ToolOutcome::Completed,
            output: json!("late id"),
            supersedes: Some("prov:pull-1:0".to_string()),
        },
    );
    pipeline.flush_now();

    let parts = pipeline.snapshot(RUN).expect("message exists");
    let tools: Vec<_> = parts
        .iter()
        .filter_map(|part| match part {
            Part::Tool(tool) => Some(tool),
            _ => None,
        })
        .collect();
    assert_eq!(tools.len(), 1, "provisional and canonical are one part");
    assert_eq!(tools[0].tool_id, "call_9");
    assert_eq!(tools[0].state, ToolState::Completed);

    pipeline.shutdown();
}

#[test]
fn late_subagent_reference_keeps_first_seen_attribution() {
    let (pipeline, session, enriched) = setup();

    // The tool starts and completes before anything marks its owner.
    publish(&pipeline, session, tool_start("t1", Some("agent-late")));
    publish(&pipeline, session, tool_complete("t1"));
    pipeline.flush_now();

    // Only afterwards does the owner get tracked as a sub-agent.
    publish(&pipeline, session, agent_start("agent-late", "t0"));
    publish(&pipeline, session, tool_start("t2", Some("agent-late")));
    pipeline.flush_now();

    let enriched = enriched.lock().expect("enriched lock");
    let early = enriched
        .iter()
        .find(|event| {
            matches!(
                &event.event.payload,
                EventPayload::ToolComplete { tool_id, .. } if tool_id == "t1"
            )
        })
        .expect("early completion delivered");
    assert!(
        !early.is_subagent_tool,
        "first-seen attribution is authoritative"
    );

    let fresh = enriched
        .iter()
        .find(|event| {
            matches!(
                &event.event.payload,
                EventPayload::ToolStart { tool_id, .. } if tool_id == "t2"
            )
        })
        .expect("fresh start delivered");
    assert!(fresh.is_subagent_tool, "new tools get the sub-agent tag");

    pipeline.shutdown();
}

#[test]
fn orchestrator_task_and_status_events_build_auxiliary_parts() {
    let (pipeline, session, _enriched) = setup();

    publish(
        &pipeline,
        session,
        EventPayload::TaskUpdate {
            task_id: "1".to_string(),
            title: "survey the codebase".to_string(),
            state: TaskState::InProgress,
        },
    );
    publish(
        &pipeline,
        session,
        EventPayload::SessionStatus {
            state: stream_source::SessionState::Working,
            detail: Some("running task 1".to_string()),
        },
    );
    pipeline.flush_now();
    publish(
        &pipeline,
        session,
        EventPayload::TaskUpdate {
            task_id: "1".to_string(),
            title: "survey the codebase".to_string(),
            state: TaskState::Completed,
        },
    );
    pipeline.flush_now();

    let parts = pipeline.snapshot(RUN).expect("message exists");
    let task_list = parts
        .iter()
        .find_map(|part| match part {
            Part::TaskList(list) => Some(list),
            _ => None,
        })
        .expect("task list part exists");
    assert_eq!(task_list.items.len(), 1);
    assert_eq!(task_list.items[0].state, TaskState::Completed);

    let status = parts
        .iter()
        .find_map(|part| match part {
            Part::Status(status) => Some(status),
            _ => None,
        })
        .expect("status part exists");
    assert_eq!(status.detail.as_deref(), Some("running task 1"));

    pipeline.shutdown();
}
