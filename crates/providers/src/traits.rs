use gp_domain::error::Result;
use gp_domain::stream::Usage;
use gp_domain::tool::{Message, ToolCall, ToolDefinition};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Request / Response types
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// A provider-agnostic chat completion request.
#[derive(Debug, Clone, Default)]
pub struct ChatRequest {
    /// The conversation messages to send.
    pub messages: Vec<Message>,
    /// Tool definitions the model may invoke.
    pub tools: Vec<ToolDefinition>,
    /// System prompt. Empty = none.
    pub system: String,
    /// Maximum tokens in the response. `None` uses the adapter default.
    pub max_tokens: Option<u32>,
}

/// A normalized chat completion response.
#[derive(Debug, Clone, Default)]
pub struct LlmResponse {
    /// Assembled text content.
    pub text: String,
    /// Tool calls emitted by the model, in declaration order.
    pub tool_calls: Vec<ToolCall>,
    /// The provider's stop reason (e.g. "end_turn", "tool_use").
    pub stop_reason: String,
    pub usage: Usage,
}

impl LlmResponse {
    pub fn has_tool_calls(&self) -> bool {
        !self.tool_calls.is_empty()
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Core client trait
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Trait every LLM adapter implements.
///
/// Streaming happens inside the adapter: text deltas and tool-call
/// assembly progress surface as `stream.*` events on the bus while the
/// caller awaits the fully assembled response.
#[async_trait::async_trait]
pub trait LlmClient: Send + Sync {
    async fn chat(&self, req: ChatRequest) -> Result<LlmResponse>;
}
