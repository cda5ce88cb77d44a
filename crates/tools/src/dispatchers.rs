//! Group dispatchers — backend operations grouped into four focused
//! tools with `{"action": …, "params": {…}}` routing.
//!
//! The LLM gets shorter, focused tool descriptions; the loop's
//! display-name rule makes each action appear to the user as its own
//! tool. Internal tool names drop the `graph_` prefix to become action
//! names (`graph_list_models` → `list_models`).

use std::collections::HashMap;
use std::sync::Arc;

use serde_json::{json, Value};

use gp_backend::{GraphClient, NodeIndex, WebClient};
use gp_domain::tool::ToolResult;

use crate::discovery::{
    GetConnectableTool, GetNodeDetailTool, SearchNodesTool, ValidateWorkflowTool,
};
use crate::execution::{InterruptTool, QueuePromptTool};
use crate::management::{
    DownloadModelTool, FreeMemoryTool, GetFolderPathsTool, InstallCustomNodeTool,
    RefreshNodeIndexTool, UploadImageTool,
};
use crate::monitoring::{GetHistoryTool, GetQueueTool, ListModelsTool, SystemStatsTool};
use crate::{Tool, ToolInfo};

/// Routes `action` to an internal tool.
struct ActionRouter {
    actions: HashMap<String, Arc<dyn Tool>>,
}

impl ActionRouter {
    fn new(tools: Vec<Arc<dyn Tool>>) -> Self {
        let actions = tools
            .into_iter()
            .map(|t| {
                let name = t
                    .info()
                    .name
                    .trim_start_matches("graph_")
                    .to_owned();
                (name, t)
            })
            .collect();
        Self { actions }
    }

    async fn dispatch(&self, params: Value) -> ToolResult {
        let action = params
            .get("action")
            .and_then(|v| v.as_str())
            .unwrap_or("")
            .to_owned();
        let action_params = params.get("params").cloned().unwrap_or(json!({}));

        let Some(tool) = self.actions.get(&action) else {
            let mut known: Vec<&str> = self.actions.keys().map(String::as_str).collect();
            known.sort();
            return ToolResult::error(format!(
                "Unknown action: '{action}'. Available: {known:?}"
            ));
        };
        tool.run(action_params).await
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// graph_discover
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Node discovery and workflow validation.
pub struct DiscoverDispatcher {
    router: ActionRouter,
}

impl DiscoverDispatcher {
    pub fn new(index: Arc<NodeIndex>) -> Self {
        Self {
            router: ActionRouter::new(vec![
                Arc::new(SearchNodesTool::new(index.clone())),
                Arc::new(GetNodeDetailTool::new(index.clone())),
                Arc::new(GetConnectableTool::new(index.clone())),
                Arc::new(ValidateWorkflowTool::new(index)),
            ]),
        }
    }
}

#[async_trait::async_trait]
impl Tool for DiscoverDispatcher {
    fn info(&self) -> ToolInfo {
        ToolInfo {
            name: "graph_discover".into(),
            description: (
                "Discover backend nodes and validate workflows. This is your primary \
                 research tool — always start here when building or modifying workflows.\n\n\
                 Actions:\n\
                 - search_nodes(query?, category?) — Search nodes by keyword (e.g. 'upscale', \
                 'controlnet') or browse a category. Returns top matches with class name, \
                 display name, category, and description. Call with no args to list all categories.\n\
                 - get_node_detail(node_class) — Full specification of a node type: \
                 required/optional inputs with types and allowed values, output types and names. \
                 Only call for complex nodes (KSampler, ControlNetApply, etc.) — skip simple \
                 nodes like CLIPTextEncode, EmptyLatentImage, VAEDecode, SaveImage whose \
                 inputs are obvious.\n\
                 - get_connectable(output_type?) — Given a data type (MODEL, CLIP, LATENT, \
                 CONDITIONING, IMAGE, VAE, etc.), list which nodes produce it and which consume it. \
                 Critical for finding compatible nodes when building pipelines. \
                 Call with no args for a summary of all connection types.\n\
                 - validate_workflow(workflow) — Check a workflow dict for errors: missing nodes, \
                 invalid connections, type mismatches, missing required inputs. \
                 Always call this before submitting a workflow with graph_execute. \
                 If validation fails, fix the specific error and re-validate ONCE."
            )
                .into(),
            parameters: json!({
                "type": "object",
                "properties": {
                    "action": {
                        "type": "string",
                        "enum": ["search_nodes", "get_node_detail", "get_connectable", "validate_workflow"],
                        "description": "The discovery operation to perform"
                    },
                    "params": {
                        "type": "object",
                        "description": "Action-specific parameters: search_nodes({query?, category?}), get_node_detail({node_class}), get_connectable({output_type?}), validate_workflow({workflow})"
                    }
                },
                "required": ["action"]
            }),
        }
    }

    async fn run(&self, params: Value) -> ToolResult {
        self.router.dispatch(params).await
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// graph_execute
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Workflow submission and execution control.
pub struct ExecuteDispatcher {
    router: ActionRouter,
}

impl ExecuteDispatcher {
    pub fn new(client: Arc<GraphClient>) -> Self {
        Self {
            router: ActionRouter::new(vec![
                Arc::new(QueuePromptTool::new(client.clone())),
                Arc::new(InterruptTool::new(client)),
            ]),
        }
    }
}

#[async_trait::async_trait]
impl Tool for ExecuteDispatcher {
    fn info(&self) -> ToolInfo {
        ToolInfo {
            name: "graph_execute".into(),
            description: (
                "Submit workflows to the backend for execution and control running jobs.\n\n\
                 Actions:\n\
                 - queue_prompt(workflow) — Submit a workflow dict for execution. The workflow \
                 must be in API format: {node_id: {class_type, inputs}}. Node connections \
                 use [source_node_id, output_index] references. Always validate_workflow first. \
                 Returns a prompt_id for tracking. IMPORTANT: After queue_prompt succeeds, \
                 IMMEDIATELY give a final text response to the user — tell them the workflow \
                 was submitted with the prompt_id and describe what it will produce. \
                 Do NOT call any more tools after a successful queue_prompt.\n\
                 - interrupt() — Cancel the currently running execution immediately. \
                 Use when the user wants to stop a long-running generation."
            )
                .into(),
            parameters: json!({
                "type": "object",
                "properties": {
                    "action": {
                        "type": "string",
                        "enum": ["queue_prompt", "interrupt"],
                        "description": "The execution operation to perform"
                    },
                    "params": {
                        "type": "object",
                        "description": "Action-specific parameters: queue_prompt({workflow}), interrupt(no params)"
                    }
                },
                "required": ["action"]
            }),
        }
    }

    async fn run(&self, params: Value) -> ToolResult {
        self.router.dispatch(params).await
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// graph_monitor
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// System monitoring and status.
pub struct MonitorDispatcher {
    router: ActionRouter,
}

impl MonitorDispatcher {
    pub fn new(client: Arc<GraphClient>) -> Self {
        Self {
            router: ActionRouter::new(vec![
                Arc::new(SystemStatsTool::new(client.clone())),
                Arc::new(ListModelsTool::new(client.clone())),
                Arc::new(GetQueueTool::new(client.clone())),
                Arc::new(GetHistoryTool::new(client)),
            ]),
        }
    }
}

#[async_trait::async_trait]
impl Tool for MonitorDispatcher {
    fn info(&self) -> ToolInfo {
        ToolInfo {
            name: "graph_monitor".into(),
            description: (
                "Monitor backend system status, available resources, and execution history.\n\n\
                 Actions:\n\
                 - system_stats() — GPU device info, VRAM usage (total/free), and backend \
                 version. Useful for checking if the system can handle a workload.\n\
                 - list_models(folder?) — List model files in a folder: checkpoints, loras, \
                 vae, controlnet, upscale_models, embeddings, clip, clip_vision, etc. \
                 Defaults to 'checkpoints'. IMPORTANT: Always use the exact filenames \
                 returned by this tool in workflow inputs — never guess or fabricate names.\n\
                 - get_queue() — How many jobs are running and pending in the queue.\n\
                 - get_history(prompt_id?) — Execution results. With a prompt_id, returns \
                 output details including image filenames and node outputs. Without, lists \
                 recent executions. Use this to check results after queue_prompt or to \
                 diagnose execution errors."
            )
                .into(),
            parameters: json!({
                "type": "object",
                "properties": {
                    "action": {
                        "type": "string",
                        "enum": ["system_stats", "list_models", "get_queue", "get_history"],
                        "description": "The monitoring operation to perform"
                    },
                    "params": {
                        "type": "object",
                        "description": "Action-specific parameters: system_stats(no params), list_models({folder?}), get_queue(no params), get_history({prompt_id?})"
                    }
                },
                "required": ["action"]
            }),
        }
    }

    async fn run(&self, params: Value) -> ToolResult {
        self.router.dispatch(params).await
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// graph_manage
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Resource management.
pub struct ManageDispatcher {
    router: ActionRouter,
}

impl ManageDispatcher {
    pub fn new(client: Arc<GraphClient>, index: Arc<NodeIndex>, web: Arc<WebClient>) -> Self {
        Self {
            router: ActionRouter::new(vec![
                Arc::new(UploadImageTool::new(client.clone(), web.clone())),
                Arc::new(DownloadModelTool::new(client.clone(), web)),
                Arc::new(InstallCustomNodeTool::new(client.clone())),
                Arc::new(FreeMemoryTool::new(client.clone())),
                Arc::new(GetFolderPathsTool::new(client.clone())),
                Arc::new(RefreshNodeIndexTool::new(client, index)),
            ]),
        }
    }
}

#[async_trait::async_trait]
impl Tool for ManageDispatcher {
    fn info(&self) -> ToolInfo {
        ToolInfo {
            name: "graph_manage".into(),
            description: (
                "Manage backend resources: upload images, download models, install custom \
                 nodes, and manage GPU memory.\n\n\
                 Actions:\n\
                 - upload_image(url?, filepath?, filename?) — Upload an image to the \
                 backend's input directory for use in img2img, ControlNet, or other \
                 image-input workflows. Provide either a URL (downloaded automatically) \
                 or a local filepath. Returns the filename to reference in workflow inputs.\n\
                 - download_model(url, folder, filename?) — Download a model file from a URL \
                 (HuggingFace, Civitai, or direct link) into a model folder. Use \
                 get_folder_paths() first to see available folders and their disk paths.\n\
                 - install_custom_node(git_url) — Clone a custom node repository into the \
                 backend's custom_nodes/ directory and install its dependencies. \
                 Requires a backend restart to take effect. After restart, call \
                 refresh_index to update the node search index.\n\
                 - free_memory(unload_models?, free_memory?) — Release GPU VRAM by \
                 unloading models and clearing caches. Useful before loading large models \
                 or when VRAM is running low.\n\
                 - get_folder_paths() — List backend storage directories: where models, \
                 outputs, inputs, and custom nodes are stored on disk.\n\
                 - refresh_index() — Rebuild the node search index from the backend's \
                 current node registry. Required after new custom nodes become available."
            )
                .into(),
            parameters: json!({
                "type": "object",
                "properties": {
                    "action": {
                        "type": "string",
                        "enum": [
                            "upload_image", "download_model", "install_custom_node",
                            "free_memory", "get_folder_paths", "refresh_index",
                        ],
                        "description": "The management operation to perform"
                    },
                    "params": {
                        "type": "object",
                        "description": "Action-specific parameters: upload_image({url?, filepath?, filename?}), download_model({url, folder, filename?}), install_custom_node({git_url}), free_memory({unload_models?, free_memory?}), get_folder_paths(no params), refresh_index(no params)"
                    }
                },
                "required": ["action"]
            }),
        }
    }

    async fn run(&self, params: Value) -> ToolResult {
        self.router.dispatch(params).await
    }
}
