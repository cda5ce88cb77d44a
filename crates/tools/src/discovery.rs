//! Discovery tools — node search, detail, connectivity, validation.

use std::sync::Arc;

use serde_json::{json, Value};

use gp_backend::NodeIndex;
use gp_domain::tool::ToolResult;

use crate::{Tool, ToolInfo};

/// Search nodes by keyword, or browse by category.
pub struct SearchNodesTool {
    index: Arc<NodeIndex>,
}

impl SearchNodesTool {
    pub fn new(index: Arc<NodeIndex>) -> Self {
        Self { index }
    }
}

#[async_trait::async_trait]
impl Tool for SearchNodesTool {
    fn info(&self) -> ToolInfo {
        ToolInfo {
            name: "graph_search_nodes".into(),
            description: (
                "Search for node types by keyword or browse by category. \
                 Use this to find the right nodes for a task. \
                 Examples: search_nodes(query='upscale'), search_nodes(category='loaders'), \
                 search_nodes() to list all categories."
            )
                .into(),
            parameters: json!({
                "type": "object",
                "properties": {
                    "query": {
                        "type": "string",
                        "description": "Search keyword (e.g., 'sampler', 'upscale', 'controlnet')"
                    },
                    "category": {
                        "type": "string",
                        "description": "Browse a specific category (e.g., 'loaders', 'sampling')"
                    }
                },
                "required": []
            }),
        }
    }

    async fn run(&self, params: Value) -> ToolResult {
        let query = params.get("query").and_then(|v| v.as_str());
        let category = params.get("category").and_then(|v| v.as_str());

        match (query, category) {
            (Some(q), _) if !q.is_empty() => ToolResult::success(self.index.search(q, 20)),
            (_, Some(c)) if !c.is_empty() => ToolResult::success(self.index.list_category(c)),
            _ => ToolResult::success(self.index.list_categories()),
        }
    }
}

/// Condensed detail for one node type.
pub struct GetNodeDetailTool {
    index: Arc<NodeIndex>,
}

impl GetNodeDetailTool {
    pub fn new(index: Arc<NodeIndex>) -> Self {
        Self { index }
    }
}

#[async_trait::async_trait]
impl Tool for GetNodeDetailTool {
    fn info(&self) -> ToolInfo {
        ToolInfo {
            name: "graph_get_node_detail".into(),
            description: (
                "Get detailed information about a specific node type: its inputs \
                 (required/optional with types), outputs, and description. \
                 Use search_nodes first to find the right node class name."
            )
                .into(),
            parameters: json!({
                "type": "object",
                "properties": {
                    "node_class": {
                        "type": "string",
                        "description": "Exact node class name (e.g., 'KSampler', 'CheckpointLoaderSimple')"
                    }
                },
                "required": ["node_class"]
            }),
        }
    }

    async fn run(&self, params: Value) -> ToolResult {
        let Some(node_class) = params.get("node_class").and_then(|v| v.as_str()) else {
            return ToolResult::error("node_class is required");
        };
        ToolResult::success(self.index.get_detail(node_class))
    }
}

/// Which nodes produce or consume a given data type.
pub struct GetConnectableTool {
    index: Arc<NodeIndex>,
}

impl GetConnectableTool {
    pub fn new(index: Arc<NodeIndex>) -> Self {
        Self { index }
    }
}

#[async_trait::async_trait]
impl Tool for GetConnectableTool {
    fn info(&self) -> ToolInfo {
        ToolInfo {
            name: "graph_get_connectable".into(),
            description: (
                "Given a data type (MODEL, CLIP, LATENT, CONDITIONING, IMAGE, VAE, …), \
                 list which nodes produce it and which consume it. Critical for finding \
                 compatible nodes when building pipelines. Call with no args for a \
                 summary of all connection types."
            )
                .into(),
            parameters: json!({
                "type": "object",
                "properties": {
                    "output_type": {
                        "type": "string",
                        "description": "Data type to look up (e.g., 'MODEL', 'LATENT')"
                    }
                },
                "required": []
            }),
        }
    }

    async fn run(&self, params: Value) -> ToolResult {
        let output_type = params
            .get("output_type")
            .and_then(|v| v.as_str())
            .filter(|s| !s.is_empty());
        ToolResult::success(self.index.get_connectable(output_type))
    }
}

/// Validate a workflow before submitting it.
pub struct ValidateWorkflowTool {
    index: Arc<NodeIndex>,
}

impl ValidateWorkflowTool {
    pub fn new(index: Arc<NodeIndex>) -> Self {
        Self { index }
    }
}

#[async_trait::async_trait]
impl Tool for ValidateWorkflowTool {
    fn info(&self) -> ToolInfo {
        ToolInfo {
            name: "graph_validate_workflow".into(),
            description: (
                "Validate a workflow before submitting. Checks that all node types \
                 exist, required inputs are provided, and connections are valid. \
                 Always validate before queue_prompt."
            )
                .into(),
            parameters: json!({
                "type": "object",
                "properties": {
                    "workflow": {
                        "type": "object",
                        "description": "Workflow in API format (node_id -> {class_type, inputs})"
                    }
                },
                "required": ["workflow"]
            }),
        }
    }

    async fn run(&self, params: Value) -> ToolResult {
        let Some(workflow) = params.get("workflow") else {
            return ToolResult::error("workflow is required");
        };
        ToolResult::success(self.index.validate_workflow(workflow))
    }
}
