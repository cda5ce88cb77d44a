//! The agent loop: user input → LLM → tool calls → repeat → response.
//!
//! One [`AgentLoop::run`] call drives a full turn:
//!
//! 1. Load history from the last summary checkpoint, append the user
//!    message (memory + store), emit `message.user` / `turn.start`.
//! 2. Each iteration: check cancellation, summarize + compact context,
//!    build the system prompt (intent + environment + canvas + loop
//!    detection), call the LLM.
//! 3. Tool calls dispatch as one parallel batch; results come back in
//!    call order as a tool-result carrier message, and the loop
//!    continues. A plain text response ends the turn.
//!
//! Every appended message is persisted immediately, so a crash can lose
//! at most the in-flight LLM call. Every exit path — answer, cancel,
//! exhaustion, failure — emits `turn.end` and clears the cancel flag.

use std::sync::Arc;
use std::time::Instant;

use parking_lot::Mutex;
use serde_json::{json, Value};

use gp_domain::bus::EventBus;
use gp_domain::error::{Error, Result};
use gp_domain::events::{Event, EventType};
use gp_domain::stream::Usage;
use gp_domain::tool::{ContentBlock, Message, MessageContent, Role, ToolCall};
use gp_providers::{ChatRequest, LlmClient, LlmResponse};
use gp_sessions::SessionStore;
use gp_tools::ToolExecutor;

use crate::cancel::{CancelMap, CancelToken};
use crate::canvas::CanvasTracker;
use crate::context::ContextManager;
use crate::intent::IntentAnalyzer;
use crate::probe::EnvironmentProbe;
use crate::prompt::PromptBuilder;
use crate::state_machine::StateMachine;
use crate::summarizer::Summarizer;

/// Final text when a turn is cancelled.
pub const CANCELLED_TEXT: &str = "Request cancelled.";

/// Final text when the iteration budget runs out.
pub const MAX_STEPS_TEXT: &str =
    "I've reached the maximum number of steps. Here's what I've done so far.";

/// Consecutive identical tool display names before the loop warning.
const LOOP_DETECT_THRESHOLD: usize = 3;

enum TurnOutcome {
    Final(String),
    Cancelled,
    Exhausted,
}

/// The reason/act scheduler for one agent.
pub struct AgentLoop {
    llm: Arc<dyn LlmClient>,
    executor: Arc<ToolExecutor>,
    sessions: Arc<SessionStore>,
    bus: Arc<EventBus>,
    state: Mutex<StateMachine>,
    cancel_map: Arc<CancelMap>,
    max_iterations: usize,
    context: ContextManager,
    summarizer: Option<Summarizer>,
    prompt_builder: Option<Arc<PromptBuilder>>,
    intent: Option<IntentAnalyzer>,
    probe: Option<Arc<EnvironmentProbe>>,
    canvas: Option<Arc<CanvasTracker>>,
    system_prompt_override: Option<String>,
}

impl AgentLoop {
    pub fn new(
        llm: Arc<dyn LlmClient>,
        executor: Arc<ToolExecutor>,
        sessions: Arc<SessionStore>,
        bus: Arc<EventBus>,
    ) -> Self {
        Self {
            llm,
            executor,
            sessions,
            bus,
            state: Mutex::new(StateMachine::new()),
            cancel_map: Arc::new(CancelMap::new()),
            max_iterations: 20,
            context: ContextManager::new("", 8192, 0),
            summarizer: None,
            prompt_builder: None,
            intent: None,
            probe: None,
            canvas: None,
            system_prompt_override: None,
        }
    }

    // ── Builder knobs ──────────────────────────────────────────────

    pub fn with_max_iterations(mut self, max_iterations: usize) -> Self {
        self.max_iterations = max_iterations.max(1);
        self
    }

    pub fn with_context_manager(mut self, context: ContextManager) -> Self {
        self.context = context;
        self
    }

    pub fn with_summarizer(mut self, summarizer: Summarizer) -> Self {
        self.summarizer = Some(summarizer);
        self
    }

    pub fn with_prompt_builder(mut self, builder: Arc<PromptBuilder>) -> Self {
        self.prompt_builder = Some(builder);
        self
    }

    pub fn with_intent_analyzer(mut self, analyzer: IntentAnalyzer) -> Self {
        self.intent = Some(analyzer);
        self
    }

    pub fn with_environment_probe(mut self, probe: Arc<EnvironmentProbe>) -> Self {
        self.probe = Some(probe);
        self
    }

    pub fn with_canvas_tracker(mut self, canvas: Arc<CanvasTracker>) -> Self {
        self.canvas = Some(canvas);
        self
    }

    /// Fixed system prompt (sub-agents); bypasses the prompt builder.
    pub fn with_system_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.system_prompt_override = Some(prompt.into());
        self
    }

    /// Share a cancel map with the hosting interface.
    pub fn with_cancel_map(mut self, cancel_map: Arc<CancelMap>) -> Self {
        self.cancel_map = cancel_map;
        self
    }

    /// Request cancellation of a running turn.
    pub fn cancel(&self, session_id: &str) -> bool {
        self.cancel_map.cancel(session_id)
    }

    pub fn cancel_map(&self) -> Arc<CancelMap> {
        self.cancel_map.clone()
    }

    // ── The turn ───────────────────────────────────────────────────

    /// Run one user turn to completion; returns the final assistant text.
    pub async fn run(&self, session_id: &str, user_input: &str) -> Result<String> {
        self.emit(session_id, Event::new(EventType::StateConversationStart))
            .await;
        self.state.lock().process(EventType::StateConversationStart);

        let meta = self
            .sessions
            .get_session_meta(session_id)?
            .ok_or_else(|| Error::Session(format!("unknown session: {session_id}")))?;
        let from_id = meta.summary_message_id.unwrap_or(0);
        let mut messages = self.sessions.load_messages_from(session_id, from_id)?;

        messages.push(Message::user(user_input));
        self.sessions.append_message(
            session_id,
            Role::User,
            &MessageContent::Text(user_input.to_owned()),
        )?;
        self.emit(
            session_id,
            Event::with_data(EventType::MessageUser, json!({ "content": user_input })),
        )
        .await;

        let started = Instant::now();
        self.emit(session_id, Event::new(EventType::TurnStart)).await;

        let cancel = self.cancel_map.register(session_id);
        let mut usage = Usage::default();
        let mut iterations = 0usize;

        let outcome = self
            .drive(
                session_id,
                user_input,
                &mut messages,
                &cancel,
                &mut usage,
                &mut iterations,
            )
            .await;
        // The cancel flag is cleared on every exit path.
        self.cancel_map.remove(session_id);

        match outcome {
            Ok(TurnOutcome::Final(text)) => {
                self.record_usage(session_id, &usage);
                self.finish_turn(session_id, started, iterations, &usage).await;
                Ok(text)
            }
            Ok(TurnOutcome::Cancelled) => {
                tracing::info!(session_id, "turn cancelled");
                self.append_final_text(session_id, CANCELLED_TEXT);
                self.record_usage(session_id, &usage);
                self.finish_turn(session_id, started, iterations, &usage).await;
                Ok(CANCELLED_TEXT.to_owned())
            }
            Ok(TurnOutcome::Exhausted) => {
                tracing::warn!(session_id, "max iterations reached");
                self.append_final_text(session_id, MAX_STEPS_TEXT);
                self.record_usage(session_id, &usage);
                self.finish_turn(session_id, started, iterations, &usage).await;
                Ok(MAX_STEPS_TEXT.to_owned())
            }
            Err(e) => {
                tracing::error!(session_id, error = %e, "agent loop failed");
                self.state.lock().process(EventType::StateError);
                self.emit(
                    session_id,
                    Event::with_data(EventType::StateError, json!({ "error": e.to_string() })),
                )
                .await;
                self.finish_turn(session_id, started, iterations, &usage).await;
                Err(e)
            }
        }
    }

    async fn drive(
        &self,
        session_id: &str,
        user_input: &str,
        messages: &mut Vec<Message>,
        cancel: &CancelToken,
        usage: &mut Usage,
        iterations: &mut usize,
    ) -> Result<TurnOutcome> {
        let mut recent_display_names: Vec<String> = Vec::new();

        for iteration in 1..=self.max_iterations {
            if cancel.is_cancelled() {
                return Ok(TurnOutcome::Cancelled);
            }
            *iterations = iteration;
            tracing::debug!(session_id, iteration, max = self.max_iterations, "loop iteration");

            self.state.lock().process(EventType::StateThinking);
            self.emit(session_id, Event::new(EventType::StateThinking)).await;

            // Semantic compression first (may mutate store + messages),
            // then the pure context compaction for this call.
            if let Some(summarizer) = &self.summarizer {
                let current = std::mem::take(messages);
                *messages = summarizer.maybe_summarize(session_id, current).await;
            }
            let call_messages = self.context.prepare(messages);

            let system = self
                .build_system_prompt(user_input, &recent_display_names)
                .await;

            let response = self
                .llm
                .chat(ChatRequest {
                    messages: call_messages,
                    tools: self.executor.schemas().to_vec(),
                    system,
                    max_tokens: None,
                })
                .await?;
            usage.add(&response.usage);

            if response.has_tool_calls() {
                let assistant_msg = build_assistant_message(&response);
                self.sessions
                    .append_message(session_id, Role::Assistant, &assistant_msg.content)?;
                messages.push(assistant_msg);
                self.emit(
                    session_id,
                    Event::with_data(
                        EventType::MessageAssistant,
                        json!({
                            "content": response.text,
                            "tool_calls": response.tool_calls.len(),
                        }),
                    ),
                )
                .await;

                let blocks = self
                    .run_tool_batch(session_id, &response.tool_calls, &mut recent_display_names)
                    .await;
                let carrier = Message::tool_results(blocks);
                self.sessions
                    .append_message(session_id, Role::User, &carrier.content)?;
                messages.push(carrier);
                continue;
            }

            // Final answer.
            self.state.lock().process(EventType::StateResponding);
            self.emit(session_id, Event::new(EventType::StateResponding)).await;
            self.sessions.append_message(
                session_id,
                Role::Assistant,
                &MessageContent::Text(response.text.clone()),
            )?;
            messages.push(Message::assistant(response.text.clone()));
            self.emit(
                session_id,
                Event::with_data(
                    EventType::MessageAssistant,
                    json!({ "content": response.text, "tool_calls": 0 }),
                ),
            )
            .await;
            return Ok(TurnOutcome::Final(response.text));
        }

        Ok(TurnOutcome::Exhausted)
    }

    /// Dispatch one batch of tool calls in parallel; results come back
    /// in call order as tool_result blocks for the carrier message.
    async fn run_tool_batch(
        &self,
        session_id: &str,
        tool_calls: &[ToolCall],
        recent_display_names: &mut Vec<String>,
    ) -> Vec<ContentBlock> {
        self.state.lock().process(EventType::StateToolPlanned);
        self.emit(session_id, Event::new(EventType::StateToolPlanned)).await;

        for tc in tool_calls {
            self.emit(
                session_id,
                Event::with_data(
                    EventType::StateToolExecuting,
                    json!({ "tool_name": tc.display_name(), "tool_id": tc.id }),
                ),
            )
            .await;
        }
        self.state.lock().process(EventType::StateToolExecuting);

        let futures: Vec<_> = tool_calls
            .iter()
            .map(|tc| self.executor.execute(&tc.name, tc.input.clone()))
            .collect();
        let results = futures_util::future::join_all(futures).await;

        let mut any_failed = false;
        let mut blocks = Vec::with_capacity(tool_calls.len());

        for (tc, result) in tool_calls.iter().zip(results) {
            let display = tc.display_name();
            recent_display_names.push(display.clone());

            if result.is_error {
                any_failed = true;
                self.emit(
                    session_id,
                    Event::with_data(
                        EventType::StateToolFailed,
                        json!({ "tool_name": display, "error": result.text }),
                    ),
                )
                .await;
            } else {
                self.emit(
                    session_id,
                    Event::with_data(
                        EventType::StateToolCompleted,
                        json!({ "tool_name": display }),
                    ),
                )
                .await;
            }

            let preview: String = result.text.chars().take(500).collect();
            self.emit(
                session_id,
                Event::with_data(
                    EventType::MessageToolResult,
                    json!({ "tool_name": display, "result": preview }),
                ),
            )
            .await;

            // A submitted workflow rides in the result data; surface it
            // for the canvas tracker and UI clients.
            if let Some(workflow) = result.data.get("workflow") {
                let prompt_id = result.data.get("prompt_id").cloned().unwrap_or(Value::Null);
                self.emit(
                    session_id,
                    Event::with_data(
                        EventType::WorkflowSubmitted,
                        json!({ "workflow": workflow, "prompt_id": prompt_id }),
                    ),
                )
                .await;
            }

            blocks.push(ContentBlock::ToolResult {
                tool_use_id: tc.id.clone(),
                content: result.text,
                is_error: result.is_error,
            });
        }

        self.state.lock().process(if any_failed {
            EventType::StateToolFailed
        } else {
            EventType::StateToolCompleted
        });

        blocks
    }

    async fn build_system_prompt(
        &self,
        user_input: &str,
        recent_display_names: &[String],
    ) -> String {
        let mut prompt = if let Some(fixed) = &self.system_prompt_override {
            fixed.clone()
        } else if let Some(builder) = &self.prompt_builder {
            let intent = match &self.intent {
                Some(analyzer) => Some(analyzer.analyze(user_input).await),
                None => None,
            };
            let environment = match &self.probe {
                Some(probe) => Some(probe.get_snapshot().await),
                None => None,
            };
            let canvas = self
                .canvas
                .as_ref()
                .map(|c| c.summary())
                .unwrap_or_default();
            builder.build(intent.as_ref(), environment.as_ref(), &canvas)
        } else {
            "You are an assistant.".to_owned()
        };

        if let Some(name) = repeated_tool(recent_display_names) {
            prompt.push_str(&format!(
                "\n\n## Loop Warning\nYour last {LOOP_DETECT_THRESHOLD} tool calls all \
                 invoked '{name}'. Do not repeat this call again — take a different \
                 approach or explain the situation to the user."
            ));
        }
        prompt
    }

    fn append_final_text(&self, session_id: &str, text: &str) {
        if let Err(e) = self.sessions.append_message(
            session_id,
            Role::Assistant,
            &MessageContent::Text(text.to_owned()),
        ) {
            tracing::warn!(session_id, error = %e, "failed to persist final text");
        }
    }

    fn record_usage(&self, session_id: &str, usage: &Usage) {
        if usage.input_tokens == 0 && usage.output_tokens == 0 {
            return;
        }
        if let Err(e) = self.sessions.add_token_usage(
            session_id,
            usage.input_tokens as i64,
            usage.output_tokens as i64,
        ) {
            tracing::warn!(session_id, error = %e, "failed to record token usage");
        }
    }

    /// End of turn: state machine back to idle, `state.conversation_end`
    /// then `turn.end` with duration, iteration count, and usage.
    async fn finish_turn(
        &self,
        session_id: &str,
        started: Instant,
        iterations: usize,
        usage: &Usage,
    ) {
        self.state.lock().process(EventType::StateConversationEnd);
        self.emit(session_id, Event::new(EventType::StateConversationEnd))
            .await;
        self.emit(
            session_id,
            Event::with_data(
                EventType::TurnEnd,
                json!({
                    "duration": started.elapsed().as_secs_f64(),
                    "iterations": iterations,
                    "usage": {
                        "input_tokens": usage.input_tokens,
                        "output_tokens": usage.output_tokens,
                    },
                }),
            ),
        )
        .await;
    }

    async fn emit(&self, session_id: &str, event: Event) {
        self.bus.emit(event.for_session(session_id)).await;
    }
}

/// Assistant message carrying optional text plus tool_use blocks.
fn build_assistant_message(response: &LlmResponse) -> Message {
    let mut blocks = Vec::new();
    if !response.text.is_empty() {
        blocks.push(ContentBlock::Text {
            text: response.text.clone(),
        });
    }
    for tc in &response.tool_calls {
        blocks.push(ContentBlock::ToolUse {
            id: tc.id.clone(),
            name: tc.name.clone(),
            input: tc.input.clone(),
        });
    }
    Message {
        role: Role::Assistant,
        content: MessageContent::Blocks(blocks),
    }
}

/// The repeated display name when the last N entries are identical.
fn repeated_tool(recent: &[String]) -> Option<&str> {
    if recent.len() < LOOP_DETECT_THRESHOLD {
        return None;
    }
    let tail = &recent[recent.len() - LOOP_DETECT_THRESHOLD..];
    let first = tail[0].as_str();
    tail.iter().all(|n| n == first).then_some(first)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn repeated_tool_needs_full_window() {
        let names: Vec<String> = vec!["a".into(), "a".into()];
        assert_eq!(repeated_tool(&names), None);

        let names: Vec<String> = vec!["b".into(), "a".into(), "a".into(), "a".into()];
        assert_eq!(repeated_tool(&names), Some("a"));

        let names: Vec<String> = vec!["a".into(), "b".into(), "a".into()];
        assert_eq!(repeated_tool(&names), None);
    }

    #[test]
    fn assistant_message_skips_empty_text() {
        let resp = LlmResponse {
            text: String::new(),
            tool_calls: vec![ToolCall {
                id: "t1".into(),
                name: "graph_monitor".into(),
                input: json!({"action": "get_queue"}),
            }],
            stop_reason: "tool_use".into(),
            usage: Usage::default(),
        };
        let msg = build_assistant_message(&resp);
        match &msg.content {
            MessageContent::Blocks(blocks) => {
                assert_eq!(blocks.len(), 1);
                assert!(matches!(blocks[0], ContentBlock::ToolUse { .. }));
            }
            other => panic!("unexpected content {other:?}"),
        }
    }
}
