//! Execution tools — submit workflows to the backend.

use std::sync::Arc;

use serde_json::{json, Value};

use gp_backend::GraphClient;
use gp_domain::tool::ToolResult;

use crate::{Tool, ToolInfo};

/// Submit a workflow for execution.
///
/// The submitted workflow rides along in `data` so the agent loop can
/// re-emit it as a `workflow.submitted` event for the canvas tracker.
pub struct QueuePromptTool {
    client: Arc<GraphClient>,
}

impl QueuePromptTool {
    pub fn new(client: Arc<GraphClient>) -> Self {
        Self { client }
    }
}

#[async_trait::async_trait]
impl Tool for QueuePromptTool {
    fn info(&self) -> ToolInfo {
        ToolInfo {
            name: "graph_queue_prompt".into(),
            description: (
                "Submit a workflow for execution. The workflow must be in API format \
                 (dict of node_id -> {class_type, inputs}). Always use validate_workflow \
                 first to check for errors. Returns a prompt_id for tracking."
            )
                .into(),
            parameters: json!({
                "type": "object",
                "properties": {
                    "workflow": {
                        "type": "object",
                        "description": "Workflow in API format"
                    }
                },
                "required": ["workflow"]
            }),
        }
    }

    async fn run(&self, params: Value) -> ToolResult {
        let Some(workflow) = params.get("workflow").filter(|w| w.is_object()) else {
            return ToolResult::error("workflow parameter is required");
        };
        match self.client.queue_prompt(workflow).await {
            Ok(result) => {
                let prompt_id = result
                    .get("prompt_id")
                    .and_then(|v| v.as_str())
                    .unwrap_or("unknown")
                    .to_owned();
                ToolResult::success(format!("Workflow submitted. prompt_id: {prompt_id}"))
                    .with_data("prompt_id", Value::String(prompt_id))
                    .with_data("workflow", workflow.clone())
            }
            Err(e) => ToolResult::error(format!("Failed to queue prompt: {e}")),
        }
    }
}

/// Interrupt the currently running execution.
pub struct InterruptTool {
    client: Arc<GraphClient>,
}

impl InterruptTool {
    pub fn new(client: Arc<GraphClient>) -> Self {
        Self { client }
    }
}

#[async_trait::async_trait]
impl Tool for InterruptTool {
    fn info(&self) -> ToolInfo {
        ToolInfo {
            name: "graph_interrupt".into(),
            description: "Interrupt the currently running execution immediately.".into(),
            parameters: json!({"type": "object", "properties": {}, "required": []}),
        }
    }

    async fn run(&self, _params: Value) -> ToolResult {
        match self.client.interrupt().await {
            Ok(()) => ToolResult::success("Execution interrupted."),
            Err(e) => ToolResult::error(format!("Failed to interrupt: {e}")),
        }
    }
}
