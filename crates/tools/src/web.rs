//! Web tools — search and URL fetching for the agent.

use std::sync::Arc;

use serde_json::{json, Value};

use gp_backend::WebClient;
use gp_domain::tool::ToolResult;

use crate::{Tool, ToolInfo};

/// Search the web for documentation, models, or node packages.
pub struct WebSearchTool {
    web: Arc<WebClient>,
}

impl WebSearchTool {
    pub fn new(web: Arc<WebClient>) -> Self {
        Self { web }
    }
}

#[async_trait::async_trait]
impl Tool for WebSearchTool {
    fn info(&self) -> ToolInfo {
        ToolInfo {
            name: "web_search".into(),
            description: (
                "Search the web. Use for finding model download pages, custom node \
                 documentation, or workflow techniques you don't already know."
            )
                .into(),
            parameters: json!({
                "type": "object",
                "properties": {
                    "query": { "type": "string", "description": "Search query" },
                    "max_results": {
                        "type": "integer",
                        "description": "Number of results (default 5)",
                        "default": 5
                    }
                },
                "required": ["query"]
            }),
        }
    }

    async fn run(&self, params: Value) -> ToolResult {
        let Some(query) = params.get("query").and_then(|v| v.as_str()) else {
            return ToolResult::error("query is required");
        };
        let max_results = params
            .get("max_results")
            .and_then(|v| v.as_u64())
            .unwrap_or(5) as usize;

        match self.web.search(query, max_results).await {
            Ok(results) if results.is_empty() => {
                ToolResult::success(format!("No results for '{query}'."))
            }
            Ok(results) => {
                let mut text = format!("Search results for '{query}':\n");
                for (i, r) in results.iter().enumerate() {
                    text.push_str(&format!("{}. {}\n   {}\n   {}\n", i + 1, r.title, r.url, r.snippet));
                }
                ToolResult::success(text)
            }
            Err(e) => ToolResult::error(format!("Search failed: {e}")),
        }
    }
}

/// Fetch a URL and return its readable text.
pub struct WebFetchTool {
    web: Arc<WebClient>,
}

impl WebFetchTool {
    pub fn new(web: Arc<WebClient>) -> Self {
        Self { web }
    }
}

#[async_trait::async_trait]
impl Tool for WebFetchTool {
    fn info(&self) -> ToolInfo {
        ToolInfo {
            name: "web_fetch".into(),
            description: (
                "Fetch a URL and return its readable text content. \
                 Use after web_search to read a promising page."
            )
                .into(),
            parameters: json!({
                "type": "object",
                "properties": {
                    "url": { "type": "string", "description": "URL to fetch" }
                },
                "required": ["url"]
            }),
        }
    }

    async fn run(&self, params: Value) -> ToolResult {
        let Some(url) = params.get("url").and_then(|v| v.as_str()) else {
            return ToolResult::error("url is required");
        };
        match self.web.fetch_url(url).await {
            Ok(resp) if resp.status_code >= 400 => {
                ToolResult::error(format!("Fetch returned HTTP {}", resp.status_code))
            }
            Ok(resp) => ToolResult::success(resp.content),
            Err(e) => ToolResult::error(format!("Fetch failed: {e}")),
        }
    }
}
