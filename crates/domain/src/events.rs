//! Event taxonomy for the agent runtime.
//!
//! Four layers, namespaced by dotted prefixes:
//! - `stream.*`  — raw LLM streaming (text deltas, tool call assembly)
//! - `state.*`   — agent state transitions
//! - `message.*` — complete messages (user, assistant, tool results)
//! - `turn.*`    — per-turn analytics (duration, iterations, tokens)
//!
//! Plus `workflow.*` (graph submissions), `context.*` (compression),
//! `llm.*` (retries), `subagent.*` (delegation), and `backend.*`
//! (relayed execution-backend frames).

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventType {
    StreamTextDelta,
    StreamToolCallStart,
    StreamToolCallDelta,
    StreamMessageStop,

    StateConversationStart,
    StateThinking,
    StateResponding,
    StateToolPlanned,
    StateToolExecuting,
    StateToolCompleted,
    StateToolFailed,
    StateConversationEnd,
    StateError,

    MessageUser,
    MessageAssistant,
    MessageToolResult,

    TurnStart,
    TurnEnd,

    WorkflowSubmitted,
    ContextSummarized,
    LlmRetry,

    SubagentStart,
    SubagentEnd,

    BackendProgress,
    BackendExecuting,
    BackendExecuted,
    BackendError,
    BackendQueueUpdate,
    BackendPreview,
}

impl EventType {
    /// The dotted wire name, used for prefix subscriptions and the
    /// WebSocket `event_type` field.
    pub fn as_str(&self) -> &'static str {
        match self {
            EventType::StreamTextDelta => "stream.text_delta",
            EventType::StreamToolCallStart => "stream.tool_call_start",
            EventType::StreamToolCallDelta => "stream.tool_call_delta",
            EventType::StreamMessageStop => "stream.message_stop",

            EventType::StateConversationStart => "state.conversation_start",
            EventType::StateThinking => "state.thinking",
            EventType::StateResponding => "state.responding",
            EventType::StateToolPlanned => "state.tool_planned",
            EventType::StateToolExecuting => "state.tool_executing",
            EventType::StateToolCompleted => "state.tool_completed",
            EventType::StateToolFailed => "state.tool_failed",
            EventType::StateConversationEnd => "state.conversation_end",
            EventType::StateError => "state.error",

            EventType::MessageUser => "message.user",
            EventType::MessageAssistant => "message.assistant",
            EventType::MessageToolResult => "message.tool_result",

            EventType::TurnStart => "turn.start",
            EventType::TurnEnd => "turn.end",

            EventType::WorkflowSubmitted => "workflow.submitted",
            EventType::ContextSummarized => "context.summarized",
            EventType::LlmRetry => "llm.retry",

            EventType::SubagentStart => "subagent.start",
            EventType::SubagentEnd => "subagent.end",

            EventType::BackendProgress => "backend.progress",
            EventType::BackendExecuting => "backend.executing",
            EventType::BackendExecuted => "backend.executed",
            EventType::BackendError => "backend.error",
            EventType::BackendQueueUpdate => "backend.queue_update",
            EventType::BackendPreview => "backend.preview",
        }
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single event flowing through the bus.
#[derive(Debug, Clone, Serialize)]
pub struct Event {
    pub event_type: EventType,
    pub data: Value,
    pub session_id: Option<String>,
    /// Seconds since the Unix epoch.
    pub timestamp: f64,
}

impl Event {
    pub fn new(event_type: EventType) -> Self {
        Self {
            event_type,
            data: Value::Object(Default::default()),
            session_id: None,
            timestamp: now_secs(),
        }
    }

    pub fn with_data(event_type: EventType, data: Value) -> Self {
        Self {
            data,
            ..Self::new(event_type)
        }
    }

    pub fn for_session(mut self, session_id: impl Into<String>) -> Self {
        self.session_id = Some(session_id.into());
        self
    }
}

fn now_secs() -> f64 {
    chrono::Utc::now().timestamp_millis() as f64 / 1000.0
}

/// The finite set of agent states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentState {
    Idle,
    Thinking,
    Responding,
    PlanningTool,
    AwaitingToolResult,
    Error,
}

/// A state transition observed by state-machine subscribers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StateChange {
    pub prev: AgentState,
    pub current: AgentState,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wire_names_are_namespaced() {
        assert_eq!(EventType::StateThinking.as_str(), "state.thinking");
        assert_eq!(EventType::WorkflowSubmitted.as_str(), "workflow.submitted");
        assert_eq!(EventType::SubagentStart.as_str(), "subagent.start");
        assert!(EventType::BackendQueueUpdate.as_str().starts_with("backend."));
    }

    #[test]
    fn event_builder_sets_session() {
        let ev = Event::new(EventType::TurnStart).for_session("s1");
        assert_eq!(ev.session_id.as_deref(), Some("s1"));
        assert!(ev.timestamp > 0.0);
    }
}
