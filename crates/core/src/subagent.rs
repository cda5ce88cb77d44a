//! Sub-agent delegation tool.
//!
//! `delegate_task` runs a restricted child agent: its own child session,
//! a read-only tool set, a smaller iteration budget, and a fixed system
//! prompt. The child's final text comes back as an ordinary tool result,
//! so from the parent loop's point of view this is just another tool.

use std::sync::Arc;

use serde_json::{json, Value};

use gp_domain::bus::EventBus;
use gp_domain::events::{Event, EventType};
use gp_domain::tool::ToolResult;
use gp_providers::LlmClient;
use gp_sessions::SessionStore;
use gp_tools::{Tool, ToolExecutor, ToolInfo};

use crate::agent::AgentLoop;

const SUBAGENT_MAX_ITERATIONS: usize = 10;

const SUBAGENT_SYSTEM_PROMPT: &str = "\
You are a research assistant for a graph-workflow agent. Your job is to \
investigate a specific question about nodes, models, or workflows and \
return a clear, concise answer.

You have access to read-only backend tools. Use them to gather \
information, then provide your findings as a final text response.

Rules:
- Be concise — your output will be fed back to the main agent as context
- Do NOT attempt to queue prompts or modify anything
- Focus on answering the specific question asked
- If you can't find the answer, say so clearly
";

/// Delegates exploration tasks to a child agent with read-only tools.
pub struct SubAgentTool {
    llm: Arc<dyn LlmClient>,
    sessions: Arc<SessionStore>,
    bus: Arc<EventBus>,
    read_only_tools: Vec<Arc<dyn Tool>>,
    max_iterations: usize,
}

impl SubAgentTool {
    pub fn new(
        llm: Arc<dyn LlmClient>,
        sessions: Arc<SessionStore>,
        bus: Arc<EventBus>,
        read_only_tools: Vec<Arc<dyn Tool>>,
    ) -> Self {
        Self {
            llm,
            sessions,
            bus,
            read_only_tools,
            max_iterations: SUBAGENT_MAX_ITERATIONS,
        }
    }
}

#[async_trait::async_trait]
impl Tool for SubAgentTool {
    fn info(&self) -> ToolInfo {
        ToolInfo {
            name: "delegate_task".into(),
            description: (
                "Delegate a research or exploration task to a sub-agent. The \
                 sub-agent has read-only access to backend tools (search_nodes, \
                 get_node_detail, get_connectable, list_models, system_stats). \
                 Use this for complex investigations that require multiple tool \
                 calls, so you can continue focusing on the main task."
            )
                .into(),
            parameters: json!({
                "type": "object",
                "properties": {
                    "task": {
                        "type": "string",
                        "description": "A clear description of what to investigate."
                    }
                },
                "required": ["task"]
            }),
        }
    }

    async fn run(&self, params: Value) -> ToolResult {
        let Some(task) = params
            .get("task")
            .and_then(|v| v.as_str())
            .filter(|t| !t.is_empty())
        else {
            return ToolResult::error("task parameter is required");
        };

        let title: String = format!("Sub-agent: {}", &task.chars().take(50).collect::<String>());
        let child_session_id = match self.sessions.create_child_session("subagent", &title) {
            Ok(id) => id,
            Err(e) => return ToolResult::error(format!("Sub-agent failed: {e}")),
        };

        self.bus
            .emit(Event::with_data(
                EventType::SubagentStart,
                json!({ "task": task, "child_session_id": child_session_id }),
            ))
            .await;

        let sub_agent = AgentLoop::new(
            self.llm.clone(),
            Arc::new(ToolExecutor::with_default_timeout(
                self.read_only_tools.clone(),
            )),
            self.sessions.clone(),
            self.bus.clone(),
        )
        .with_max_iterations(self.max_iterations)
        .with_system_prompt(SUBAGENT_SYSTEM_PROMPT);

        match sub_agent.run(&child_session_id, task).await {
            Ok(result_text) => {
                let preview: String = result_text.chars().take(200).collect();
                self.bus
                    .emit(Event::with_data(
                        EventType::SubagentEnd,
                        json!({ "result_preview": preview }),
                    ))
                    .await;
                ToolResult::success(result_text)
            }
            Err(e) => {
                tracing::error!(task, error = %e, "sub-agent failed");
                self.bus
                    .emit(Event::with_data(
                        EventType::SubagentEnd,
                        json!({ "result_preview": format!("Error: {e}") }),
                    ))
                    .await;
                ToolResult::error(format!("Sub-agent failed: {e}"))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use gp_providers::mock::MockLlm;

    fn subagent(llm: Arc<MockLlm>) -> (SubAgentTool, Arc<EventBus>, Arc<SessionStore>) {
        let sessions = Arc::new(SessionStore::in_memory());
        let bus = Arc::new(EventBus::new());
        let tool = SubAgentTool::new(llm, sessions.clone(), bus.clone(), Vec::new());
        (tool, bus, sessions)
    }

    #[tokio::test]
    async fn runs_child_turn_and_reports() {
        let llm = Arc::new(MockLlm::new());
        llm.enqueue_text("Found three upscaler nodes.");
        let (tool, bus, sessions) = subagent(llm);

        let result = tool
            .run(json!({ "task": "find upscaler nodes" }))
            .await;
        assert!(!result.is_error);
        assert_eq!(result.text, "Found three upscaler nodes.");

        // Events mark start and end.
        assert_eq!(bus.history(Some(EventType::SubagentStart)).len(), 1);
        let ends = bus.history(Some(EventType::SubagentEnd));
        assert_eq!(ends.len(), 1);
        assert_eq!(ends[0].data["result_preview"], "Found three upscaler nodes.");

        // Child session exists but is hidden from top-level listings.
        assert!(sessions.list_sessions().unwrap().is_empty());
    }

    #[tokio::test]
    async fn missing_task_is_error() {
        let (tool, _bus, _sessions) = subagent(Arc::new(MockLlm::new()));
        let result = tool.run(json!({})).await;
        assert!(result.is_error);
    }

    #[tokio::test]
    async fn child_failure_becomes_error_result() {
        // Empty script → the child's LLM call fails.
        let (tool, bus, _sessions) = subagent(Arc::new(MockLlm::new()));
        let result = tool.run(json!({ "task": "explode" })).await;
        assert!(result.is_error);
        assert!(result.text.starts_with("Sub-agent failed:"));
        let ends = bus.history(Some(EventType::SubagentEnd));
        assert!(ends[0].data["result_preview"]
            .as_str()
            .unwrap()
            .starts_with("Error:"));
    }
}
