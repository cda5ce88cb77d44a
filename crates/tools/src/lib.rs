//! The agent's tool layer.
//!
//! Every capability the LLM can invoke implements [`Tool`]. The
//! [`executor::ToolExecutor`] owns the registry and enforces timeouts,
//! output truncation, and failure isolation. Backend operations are
//! grouped into four action dispatchers so the LLM sees a handful of
//! focused tools instead of fifteen flat ones.

pub mod dispatchers;
pub mod discovery;
pub mod execution;
pub mod executor;
pub mod factory;
pub mod management;
pub mod monitoring;
pub mod web;

use serde_json::Value;

use gp_domain::tool::ToolResult;

/// Tool metadata exposed to the LLM.
#[derive(Debug, Clone)]
pub struct ToolInfo {
    pub name: String,
    pub description: String,
    /// JSON Schema for the tool's input.
    pub parameters: Value,
}

/// A capability the agent can invoke.
///
/// Failures are returned as error-tagged [`ToolResult`]s rather than
/// `Err` — the executor and the LLM both treat errors as data.
#[async_trait::async_trait]
pub trait Tool: Send + Sync {
    /// Metadata sent to the LLM as part of the tools list.
    fn info(&self) -> ToolInfo;

    /// Execute with the input from the LLM's tool_use call.
    async fn run(&self, params: Value) -> ToolResult;
}

pub use executor::ToolExecutor;
pub use factory::{create_all_tools, create_readonly_tools};
