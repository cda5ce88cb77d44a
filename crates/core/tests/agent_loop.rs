//! End-to-end agent loop scenarios against a scripted LLM and an
//! in-memory session store.

use std::sync::Arc;

use parking_lot::Mutex;
use serde_json::{json, Value};

use gp_core::agent::{AgentLoop, CANCELLED_TEXT, MAX_STEPS_TEXT};
use gp_core::cancel::CancelMap;
use gp_core::summarizer::Summarizer;
use gp_domain::bus::{handler, EventBus};
use gp_domain::events::{Event, EventType};
use gp_domain::tool::{ContentBlock, MessageContent, Role, ToolResult};
use gp_providers::mock::MockLlm;
use gp_sessions::SessionStore;
use gp_tools::{Tool, ToolExecutor, ToolInfo};

// ── Test tools ─────────────────────────────────────────────────────

/// Single dispatcher-style tool: routes `action` like the real backend
/// dispatchers do.
struct DispatchTool;

#[async_trait::async_trait]
impl Tool for DispatchTool {
    fn info(&self) -> ToolInfo {
        ToolInfo {
            name: "dispatch".into(),
            description: "Backend operations via action routing.".into(),
            parameters: json!({"type": "object", "properties": {"action": {"type": "string"}}}),
        }
    }

    async fn run(&self, params: Value) -> ToolResult {
        match params.get("action").and_then(|v| v.as_str()) {
            Some("list_models") => ToolResult::success("model_a.safetensors"),
            Some("queue_prompt") => ToolResult::success("Workflow submitted. prompt_id: p-77")
                .with_data("prompt_id", json!("p-77"))
                .with_data(
                    "workflow",
                    json!({"1": {"class_type": "KSampler", "inputs": {}}}),
                ),
            other => ToolResult::error(format!("Unknown action: {other:?}")),
        }
    }
}

struct EchoTool;

#[async_trait::async_trait]
impl Tool for EchoTool {
    fn info(&self) -> ToolInfo {
        ToolInfo {
            name: "echo".into(),
            description: "Echo.".into(),
            parameters: json!({"type": "object"}),
        }
    }

    async fn run(&self, _params: Value) -> ToolResult {
        ToolResult::success("ok")
    }
}

/// Panics when run — exercises the executor's failure isolation.
struct BoomTool;

#[async_trait::async_trait]
impl Tool for BoomTool {
    fn info(&self) -> ToolInfo {
        ToolInfo {
            name: "boom".into(),
            description: "Always explodes.".into(),
            parameters: json!({"type": "object"}),
        }
    }

    async fn run(&self, _params: Value) -> ToolResult {
        panic!("kaboom");
    }
}

/// Cancels its own session's turn when invoked.
struct CancelTool {
    cancel_map: Arc<CancelMap>,
    session_id: String,
}

#[async_trait::async_trait]
impl Tool for CancelTool {
    fn info(&self) -> ToolInfo {
        ToolInfo {
            name: "pull_plug".into(),
            description: "Requests cancellation of the running turn.".into(),
            parameters: json!({"type": "object"}),
        }
    }

    async fn run(&self, _params: Value) -> ToolResult {
        self.cancel_map.cancel(&self.session_id);
        ToolResult::success("cancel requested")
    }
}

// ── Harness ────────────────────────────────────────────────────────

struct Harness {
    llm: Arc<MockLlm>,
    sessions: Arc<SessionStore>,
    bus: Arc<EventBus>,
    events: Arc<Mutex<Vec<Event>>>,
    session_id: String,
}

impl Harness {
    fn new() -> Self {
        let llm = Arc::new(MockLlm::new());
        let sessions = Arc::new(SessionStore::in_memory());
        let bus = Arc::new(EventBus::new());
        let session_id = sessions.create_session("test").unwrap();

        let events = Arc::new(Mutex::new(Vec::new()));
        let sink = events.clone();
        let sub = bus.on_all(handler(move |event| {
            let sink = sink.clone();
            async move {
                sink.lock().push(event);
                Ok(())
            }
        }));
        std::mem::forget(sub);

        Self {
            llm,
            sessions,
            bus,
            events,
            session_id,
        }
    }

    fn agent(&self, tools: Vec<Arc<dyn Tool>>, max_iterations: usize) -> AgentLoop {
        AgentLoop::new(
            self.llm.clone(),
            Arc::new(ToolExecutor::with_default_timeout(tools)),
            self.sessions.clone(),
            self.bus.clone(),
        )
        .with_max_iterations(max_iterations)
    }

    fn event_types(&self) -> Vec<EventType> {
        self.events.lock().iter().map(|e| e.event_type).collect()
    }

    fn events_of(&self, ty: EventType) -> Vec<Event> {
        self.events
            .lock()
            .iter()
            .filter(|e| e.event_type == ty)
            .cloned()
            .collect()
    }

    fn stored(&self) -> Vec<(Role, MessageContent)> {
        self.sessions
            .load_messages(&self.session_id)
            .unwrap()
            .into_iter()
            .map(|m| (m.role, m.content))
            .collect()
    }
}

// ── S1: simple answer, no tools ────────────────────────────────────

#[tokio::test]
async fn s1_simple_answer_without_tools() {
    let h = Harness::new();
    h.llm.enqueue_text("hello");
    let agent = h.agent(vec![], 20);

    let answer = agent.run(&h.session_id, "hi").await.unwrap();
    assert_eq!(answer, "hello");

    // Stored: [user "hi", assistant "hello"].
    let stored = h.stored();
    assert_eq!(stored.len(), 2);
    assert_eq!(stored[0].0, Role::User);
    assert_eq!(stored[0].1.text(), Some("hi"));
    assert_eq!(stored[1].0, Role::Assistant);
    assert_eq!(stored[1].1.text(), Some("hello"));

    // All protocol events present.
    let types = h.event_types();
    for expected in [
        EventType::StateConversationStart,
        EventType::MessageUser,
        EventType::TurnStart,
        EventType::StateThinking,
        EventType::StateResponding,
        EventType::MessageAssistant,
        EventType::StateConversationEnd,
        EventType::TurnEnd,
    ] {
        assert!(types.contains(&expected), "missing {expected}");
    }

    let turn_end = &h.events_of(EventType::TurnEnd)[0];
    assert_eq!(turn_end.data["iterations"], 1);
    assert_eq!(turn_end.data["usage"]["input_tokens"], 10);
}

// ── S2: one tool round-trip with action display name ───────────────

#[tokio::test]
async fn s2_single_tool_round_trip() {
    let h = Harness::new();
    h.llm.enqueue_tool_calls(
        "",
        vec![("t1", "dispatch", json!({"action": "list_models"}))],
    );
    h.llm.enqueue_text("I found model_a.");
    let agent = h.agent(vec![Arc::new(DispatchTool)], 20);

    let answer = agent.run(&h.session_id, "list models").await.unwrap();
    assert_eq!(answer, "I found model_a.");

    // Stored: user, assistant-with-tool-use, carrier, assistant-final.
    let stored = h.stored();
    assert_eq!(stored.len(), 4);
    match &stored[1].1 {
        MessageContent::Blocks(blocks) => {
            assert!(matches!(&blocks[0], ContentBlock::ToolUse { id, .. } if id == "t1"));
        }
        other => panic!("expected tool_use blocks, got {other:?}"),
    }
    match &stored[2].1 {
        MessageContent::Blocks(blocks) => match &blocks[0] {
            ContentBlock::ToolResult {
                tool_use_id,
                content,
                is_error,
            } => {
                assert_eq!(tool_use_id, "t1");
                assert_eq!(content, "model_a.safetensors");
                assert!(!is_error);
            }
            other => panic!("expected tool_result, got {other:?}"),
        },
        other => panic!("expected carrier blocks, got {other:?}"),
    }

    // The display name comes from the action field.
    let tool_results = h.events_of(EventType::MessageToolResult);
    assert_eq!(tool_results.len(), 1);
    assert_eq!(tool_results[0].data["tool_name"], "list_models");

    // No workflow was submitted.
    assert!(h.events_of(EventType::WorkflowSubmitted).is_empty());
    assert_eq!(h.llm.call_count(), 2);
}

// ── S3: parallel tools with one failure ────────────────────────────

#[tokio::test]
async fn s3_parallel_batch_with_one_failure() {
    let h = Harness::new();
    h.llm.enqueue_tool_calls(
        "",
        vec![
            ("t1", "echo", json!({})),
            ("t2", "boom", json!({})),
        ],
    );
    h.llm.enqueue_text("one tool failed");
    let agent = h.agent(vec![Arc::new(EchoTool), Arc::new(BoomTool)], 20);

    let answer = agent.run(&h.session_id, "do both").await.unwrap();
    assert_eq!(answer, "one tool failed");

    // Carrier holds both results in call order.
    let stored = h.stored();
    match &stored[2].1 {
        MessageContent::Blocks(blocks) => {
            assert_eq!(blocks.len(), 2);
            match (&blocks[0], &blocks[1]) {
                (
                    ContentBlock::ToolResult {
                        tool_use_id: id1,
                        content: c1,
                        is_error: e1,
                    },
                    ContentBlock::ToolResult {
                        tool_use_id: id2,
                        content: c2,
                        is_error: e2,
                    },
                ) => {
                    assert_eq!(id1, "t1");
                    assert_eq!(c1, "ok");
                    assert!(!e1);
                    assert_eq!(id2, "t2");
                    assert!(c2.starts_with("Tool 'boom' failed:"));
                    assert!(e2);
                }
                other => panic!("unexpected blocks {other:?}"),
            }
        }
        other => panic!("expected carrier, got {other:?}"),
    }

    // Both completion events fired, failure included.
    assert_eq!(h.events_of(EventType::StateToolCompleted).len(), 1);
    assert_eq!(h.events_of(EventType::StateToolFailed).len(), 1);

    // The second LLM call received both tool_results.
    let requests = h.llm.requests();
    let carrier = requests[1].messages.last().unwrap();
    match &carrier.content {
        MessageContent::Blocks(blocks) => assert_eq!(blocks.len(), 2),
        other => panic!("expected carrier in request, got {other:?}"),
    }
}

// ── S4: cancellation between iterations ────────────────────────────

#[tokio::test]
async fn s4_cancellation_mid_turn() {
    let h = Harness::new();
    // Iterations 1 and 2 both ask for tools; the tool in iteration 2
    // cancels the session, so the loop exits before iteration 3.
    h.llm.enqueue_tool_calls("", vec![("t1", "echo", json!({}))]);
    h.llm
        .enqueue_tool_calls("", vec![("t2", "pull_plug", json!({}))]);

    let cancel_map = Arc::new(CancelMap::new());
    let tools: Vec<Arc<dyn Tool>> = vec![
        Arc::new(CancelTool {
            cancel_map: cancel_map.clone(),
            session_id: h.session_id.clone(),
        }),
        Arc::new(EchoTool),
    ];
    let agent = h.agent(tools, 20).with_cancel_map(cancel_map.clone());

    let answer = agent.run(&h.session_id, "go").await.unwrap();
    assert_eq!(answer, CANCELLED_TEXT);

    // Final stored message is the cancellation text.
    let stored = h.stored();
    assert_eq!(stored.last().unwrap().1.text(), Some(CANCELLED_TEXT));

    let turn_end = &h.events_of(EventType::TurnEnd)[0];
    assert_eq!(turn_end.data["iterations"], 2);

    // Cancel flag cleared on exit.
    assert!(!cancel_map.is_running(&h.session_id));
    assert_eq!(h.llm.call_count(), 2);
}

// ── S5: iteration exhaustion ───────────────────────────────────────

#[tokio::test]
async fn s5_iteration_exhaustion() {
    let h = Harness::new();
    for i in 0..3 {
        let id = format!("t{i}");
        h.llm
            .enqueue_tool_calls("", vec![(id.as_str(), "echo", json!({}))]);
    }
    let agent = h.agent(vec![Arc::new(EchoTool)], 3);

    let answer = agent.run(&h.session_id, "loop forever").await.unwrap();
    assert_eq!(answer, MAX_STEPS_TEXT);

    // user + 3 × (assistant + carrier) + final text.
    let stored = h.stored();
    assert_eq!(stored.len(), 8);
    assert_eq!(stored.last().unwrap().1.text(), Some(MAX_STEPS_TEXT));

    let turn_end = &h.events_of(EventType::TurnEnd)[0];
    assert_eq!(turn_end.data["iterations"], 3);
    assert_eq!(h.llm.call_count(), 3);
}

// ── S6: summary checkpoint ─────────────────────────────────────────

#[tokio::test]
async fn s6_summary_checkpoint() {
    let h = Harness::new();

    // 39 persisted messages (~200 chars each); the new user turn makes 40.
    for i in 0..39 {
        let role = if i % 2 == 0 { Role::User } else { Role::Assistant };
        h.sessions
            .append_message(
                &h.session_id,
                role,
                &MessageContent::Text(format!("turn {i}: {}", "x".repeat(200))),
            )
            .unwrap();
    }

    let summary_llm = Arc::new(MockLlm::new());
    summary_llm.enqueue_text("built several txt2img workflows with sdxl");
    let summarizer = Summarizer::new(
        summary_llm.clone(),
        h.sessions.clone(),
        h.bus.clone(),
    )
    .with_limits(500, 10);

    h.llm.enqueue_text("done");
    let agent = h.agent(vec![], 20).with_summarizer(summarizer);

    let answer = agent.run(&h.session_id, "continue please").await.unwrap();
    assert_eq!(answer, "done");
    assert_eq!(summary_llm.call_count(), 1);

    // 40 in-memory messages − keep_recent 10 = 30 summarized.
    let summarized = h.events_of(EventType::ContextSummarized);
    assert_eq!(summarized.len(), 1);
    assert_eq!(summarized[0].data["messages_summarized"], 30);
    assert!(
        summarized[0].data["summary_tokens"].as_u64().unwrap()
            < summarized[0].data["original_tokens"].as_u64().unwrap()
    );

    // Checkpoint installed; reload resumes from the summary.
    let meta = h.sessions.get_session_meta(&h.session_id).unwrap().unwrap();
    let checkpoint = meta.summary_message_id.expect("checkpoint recorded");
    let resumed = h
        .sessions
        .load_messages_from(&h.session_id, checkpoint)
        .unwrap();
    assert!(resumed[0]
        .content
        .text()
        .unwrap()
        .starts_with("[Previous conversation summary]"));
    // The final answer landed after the checkpoint.
    assert_eq!(resumed.last().unwrap().content.text(), Some("done"));

    // The LLM call after summarization saw the compressed history.
    let request = &h.llm.requests()[0];
    assert!(request.messages.len() <= 11);
    assert!(request.messages[0]
        .content
        .text()
        .unwrap()
        .starts_with("[Previous conversation summary]"));
}

// ── Workflow submission surfaces as an event ───────────────────────

#[tokio::test]
async fn workflow_data_reemitted_as_event() {
    let h = Harness::new();
    h.llm.enqueue_tool_calls(
        "",
        vec![("t1", "dispatch", json!({"action": "queue_prompt"}))],
    );
    h.llm.enqueue_text("submitted!");
    let agent = h.agent(vec![Arc::new(DispatchTool)], 20);

    agent.run(&h.session_id, "make an image").await.unwrap();

    let submitted = h.events_of(EventType::WorkflowSubmitted);
    assert_eq!(submitted.len(), 1);
    assert_eq!(submitted[0].data["prompt_id"], "p-77");
    assert_eq!(
        submitted[0].data["workflow"]["1"]["class_type"],
        "KSampler"
    );
}

// ── Fatal LLM failure still ends the turn ──────────────────────────

#[tokio::test]
async fn llm_failure_emits_error_and_turn_end() {
    let h = Harness::new();
    h.llm
        .enqueue_error(gp_domain::Error::Other("provider exploded".into()));
    let agent = h.agent(vec![], 20);

    let result = agent.run(&h.session_id, "hi").await;
    assert!(result.is_err());

    let errors = h.events_of(EventType::StateError);
    assert_eq!(errors.len(), 1);
    assert_eq!(errors[0].data["error"], "provider exploded");
    // turn.end is emitted even on failure.
    assert_eq!(h.events_of(EventType::TurnEnd).len(), 1);
}

// ── Loop detection warns the model ─────────────────────────────────

#[tokio::test]
async fn loop_detection_appends_warning() {
    let h = Harness::new();
    for i in 0..3 {
        let id = format!("t{i}");
        h.llm.enqueue_tool_calls(
            "",
            vec![(id.as_str(), "dispatch", json!({"action": "list_models"}))],
        );
    }
    h.llm.enqueue_text("giving up");
    let agent = h.agent(vec![Arc::new(DispatchTool)], 20);

    agent.run(&h.session_id, "keep listing").await.unwrap();

    let requests = h.llm.requests();
    // After three identical display names, the fourth call carries the warning.
    assert!(!requests[2].system.contains("Loop Warning"));
    assert!(requests[3].system.contains("Loop Warning"));
    assert!(requests[3].system.contains("'list_models'"));
}
