//! Tool registration, lookup, and execution.
//!
//! The executor enforces a per-call timeout, truncates oversized text
//! output (head + tail, marker in the middle), and isolates failures:
//! an unknown name, a timeout, or a panicking tool all become
//! error-tagged results — the loop never sees an exception.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;

use gp_domain::tool::{ToolDefinition, ToolResult};

use crate::Tool;

/// Default per-call timeout.
pub const DEFAULT_TIMEOUT_SECS: u64 = 60;

/// Tool text output beyond this is truncated to head + tail halves.
pub const MAX_TOOL_RESULT_CHARS: usize = 15_000;

/// Owns the tool registry and runs individual calls.
pub struct ToolExecutor {
    tools: HashMap<String, Arc<dyn Tool>>,
    timeout: Duration,
    schemas: Vec<ToolDefinition>,
}

impl ToolExecutor {
    pub fn new(tools: Vec<Arc<dyn Tool>>, timeout: Duration) -> Self {
        let schemas = tools
            .iter()
            .map(|t| {
                let info = t.info();
                ToolDefinition {
                    name: info.name,
                    description: info.description,
                    input_schema: info.parameters,
                }
            })
            .collect();
        let tools = tools
            .into_iter()
            .map(|t| (t.info().name, t))
            .collect();
        Self {
            tools,
            timeout,
            schemas,
        }
    }

    pub fn with_default_timeout(tools: Vec<Arc<dyn Tool>>) -> Self {
        Self::new(tools, Duration::from_secs(DEFAULT_TIMEOUT_SECS))
    }

    /// LLM-facing schema list, in registration order.
    pub fn schemas(&self) -> &[ToolDefinition] {
        &self.schemas
    }

    pub fn get(&self, name: &str) -> Option<&Arc<dyn Tool>> {
        self.tools.get(name)
    }

    /// Execute one tool call with timeout, truncation, and isolation.
    pub async fn execute(&self, name: &str, params: Value) -> ToolResult {
        let Some(tool) = self.tools.get(name) else {
            return ToolResult::error(format!("Unknown tool: {name}"));
        };

        let tool = tool.clone();
        // Run in a task so a panicking tool is contained as a JoinError.
        let fut = tokio::spawn(async move { tool.run(params).await });

        match tokio::time::timeout(self.timeout, fut).await {
            Err(_) => {
                tracing::warn!(tool = name, "tool timed out");
                ToolResult::error(format!(
                    "Tool '{name}' timed out after {} seconds",
                    self.timeout.as_secs()
                ))
            }
            Ok(Err(join_err)) => {
                tracing::error!(tool = name, error = %join_err, "tool task failed");
                ToolResult::error(format!("Tool '{name}' failed: {join_err}"))
            }
            Ok(Ok(mut result)) => {
                result.text = truncate_output(&result.text, MAX_TOOL_RESULT_CHARS);
                tracing::info!(
                    tool = name,
                    outcome = if result.is_error { "error" } else { "ok" },
                    "tool completed"
                );
                result
            }
        }
    }
}

/// Truncate large tool output, keeping the first and last halves with a
/// `[N lines truncated]` marker replacing the middle.
pub fn truncate_output(text: &str, max_len: usize) -> String {
    if text.len() <= max_len {
        return text.to_owned();
    }
    let half = max_len / 2;
    // Back off to char boundaries so multi-byte text can't split a char.
    let mut head_end = half.min(text.len());
    while !text.is_char_boundary(head_end) {
        head_end -= 1;
    }
    let mut tail_start = text.len() - half;
    while !text.is_char_boundary(tail_start) {
        tail_start += 1;
    }
    let mid_lines = text[head_end..tail_start].matches('\n').count();
    format!(
        "{}\n\n... [{} lines truncated] ...\n\n{}",
        &text[..head_end],
        mid_lines,
        &text[tail_start..]
    )
}
