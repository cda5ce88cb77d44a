//! Monitoring tools — system stats, models, queue, history.

use std::sync::Arc;

use serde_json::{json, Value};

use gp_backend::GraphClient;
use gp_domain::tool::ToolResult;

use crate::{Tool, ToolInfo};

/// Backend system statistics.
pub struct SystemStatsTool {
    client: Arc<GraphClient>,
}

impl SystemStatsTool {
    pub fn new(client: Arc<GraphClient>) -> Self {
        Self { client }
    }
}

#[async_trait::async_trait]
impl Tool for SystemStatsTool {
    fn info(&self) -> ToolInfo {
        ToolInfo {
            name: "graph_system_stats".into(),
            description: "Get backend system statistics including GPU info, VRAM usage, and version."
                .into(),
            parameters: json!({"type": "object", "properties": {}, "required": []}),
        }
    }

    async fn run(&self, _params: Value) -> ToolResult {
        match self.client.get_system_stats().await {
            Ok(stats) => ToolResult::success(
                serde_json::to_string_pretty(&stats).unwrap_or_else(|_| stats.to_string()),
            ),
            Err(e) => ToolResult::error(format!("Failed to get system stats: {e}")),
        }
    }
}

/// List model files available to the backend.
pub struct ListModelsTool {
    client: Arc<GraphClient>,
}

impl ListModelsTool {
    pub fn new(client: Arc<GraphClient>) -> Self {
        Self { client }
    }
}

#[async_trait::async_trait]
impl Tool for ListModelsTool {
    fn info(&self) -> ToolInfo {
        ToolInfo {
            name: "graph_list_models".into(),
            description: (
                "List available models. Folder can be: checkpoints, loras, vae, \
                 controlnet, upscale_models, embeddings, clip, etc. Defaults to \
                 'checkpoints'. Always use the exact filenames returned here in \
                 workflow inputs — never guess model names."
            )
                .into(),
            parameters: json!({
                "type": "object",
                "properties": {
                    "folder": {
                        "type": "string",
                        "description": "Model folder to list (default: checkpoints)",
                        "default": "checkpoints"
                    }
                },
                "required": []
            }),
        }
    }

    async fn run(&self, params: Value) -> ToolResult {
        let folder = params
            .get("folder")
            .and_then(|v| v.as_str())
            .unwrap_or("checkpoints");
        match self.client.list_models(folder).await {
            Ok(models) if models.is_empty() => {
                ToolResult::success(format!("No models found in '{folder}'."))
            }
            Ok(models) => {
                let mut text = format!("Models in '{folder}' ({}):\n", models.len());
                for model in models {
                    text.push_str(&format!("  - {model}\n"));
                }
                ToolResult::success(text)
            }
            Err(e) => ToolResult::error(format!("Failed to list models: {e}")),
        }
    }
}

/// Queue status.
pub struct GetQueueTool {
    client: Arc<GraphClient>,
}

impl GetQueueTool {
    pub fn new(client: Arc<GraphClient>) -> Self {
        Self { client }
    }
}

#[async_trait::async_trait]
impl Tool for GetQueueTool {
    fn info(&self) -> ToolInfo {
        ToolInfo {
            name: "graph_get_queue".into(),
            description: "Get the current execution queue status.".into(),
            parameters: json!({"type": "object", "properties": {}, "required": []}),
        }
    }

    async fn run(&self, _params: Value) -> ToolResult {
        match self.client.get_queue().await {
            Ok(queue) => {
                let running = queue
                    .get("queue_running")
                    .and_then(|v| v.as_array())
                    .cloned()
                    .unwrap_or_default();
                let pending = queue
                    .get("queue_pending")
                    .and_then(|v| v.as_array())
                    .cloned()
                    .unwrap_or_default();

                let mut text = format!(
                    "Queue: {} running, {} pending\n",
                    running.len(),
                    pending.len()
                );
                for item in &running {
                    if let Some(id) = item.get(1) {
                        text.push_str(&format!("  [running] {id}\n"));
                    }
                }
                for item in pending.iter().take(10) {
                    if let Some(id) = item.get(1) {
                        text.push_str(&format!("  [pending] {id}\n"));
                    }
                }
                if pending.len() > 10 {
                    text.push_str(&format!("  ... and {} more\n", pending.len() - 10));
                }
                ToolResult::success(text)
            }
            Err(e) => ToolResult::error(format!("Failed to get queue: {e}")),
        }
    }
}

/// Execution history and outputs.
pub struct GetHistoryTool {
    client: Arc<GraphClient>,
}

impl GetHistoryTool {
    pub fn new(client: Arc<GraphClient>) -> Self {
        Self { client }
    }
}

#[async_trait::async_trait]
impl Tool for GetHistoryTool {
    fn info(&self) -> ToolInfo {
        ToolInfo {
            name: "graph_get_history".into(),
            description: (
                "Get execution history. With a prompt_id, returns output details \
                 including image URLs. Without, lists recent executions. Use this \
                 to check results after queue_prompt or to diagnose errors."
            )
                .into(),
            parameters: json!({
                "type": "object",
                "properties": {
                    "prompt_id": {
                        "type": "string",
                        "description": "Specific prompt_id to get details for"
                    }
                },
                "required": []
            }),
        }
    }

    async fn run(&self, params: Value) -> ToolResult {
        let prompt_id = params.get("prompt_id").and_then(|v| v.as_str());
        let history = match self.client.get_history(prompt_id).await {
            Ok(h) => h,
            Err(e) => return ToolResult::error(format!("Failed to get history: {e}")),
        };

        if let Some(pid) = prompt_id {
            if let Some(entry) = history.get(pid) {
                let status = entry
                    .get("status")
                    .and_then(|s| s.get("status_str"))
                    .and_then(|v| v.as_str())
                    .unwrap_or("unknown");
                let mut text = format!("Execution {pid}:\n  Status: {status}\n");
                if let Some(outputs) = entry.get("outputs").and_then(|v| v.as_object()) {
                    text.push_str("  Outputs:\n");
                    for (node_id, output) in outputs {
                        let Some(images) = output.get("images").and_then(|v| v.as_array()) else {
                            continue;
                        };
                        for img in images {
                            let filename = img.get("filename").and_then(|v| v.as_str()).unwrap_or("");
                            let subfolder = img.get("subfolder").and_then(|v| v.as_str()).unwrap_or("");
                            let folder_type = img.get("type").and_then(|v| v.as_str()).unwrap_or("output");
                            let url = self.client.get_image_url(filename, subfolder, folder_type);
                            text.push_str(&format!("    Node {node_id}: {url}\n"));
                        }
                    }
                }
                return ToolResult::success(text);
            }
        }

        let entries: Vec<&String> = history
            .as_object()
            .map(|m| m.keys().collect::<Vec<_>>())
            .unwrap_or_default();
        let shown = entries.len().min(10);
        let mut text = format!(
            "Recent executions ({} total, showing {shown}):\n",
            entries.len()
        );
        for pid in entries.iter().rev().take(10) {
            let status = history[pid.as_str()]
                .get("status")
                .and_then(|s| s.get("status_str"))
                .and_then(|v| v.as_str())
                .unwrap_or("unknown");
            text.push_str(&format!("  - {pid} [{status}]\n"));
        }
        ToolResult::success(text)
    }
}
