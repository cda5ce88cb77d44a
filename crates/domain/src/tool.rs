use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A tool invocation request emitted by the LLM.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolCall {
    pub id: String,
    pub name: String,
    pub input: Value,
}

impl ToolCall {
    /// Display name used for events, loop detection, and the UI.
    ///
    /// Dispatcher tools route on an `action` field; when present, the
    /// action string is what the user should see instead of the
    /// dispatcher name.
    pub fn display_name(&self) -> String {
        self.input
            .get("action")
            .and_then(|v| v.as_str())
            .map(str::to_owned)
            .unwrap_or_else(|| self.name.clone())
    }
}

/// Tool definition exposed to the LLM.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolDefinition {
    pub name: String,
    pub description: String,
    /// JSON Schema for the tool's input.
    pub input_schema: Value,
}

/// Result of a tool execution. Failures travel as data (`is_error`), not
/// as errors, so the LLM can reason about them.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ToolResult {
    pub text: String,
    /// Structured side-channel data for routing (e.g. a submitted
    /// workflow that must be re-emitted as an event). Never truncated.
    #[serde(default)]
    pub data: serde_json::Map<String, Value>,
    #[serde(default)]
    pub is_error: bool,
    /// Image URLs or base64 payloads produced by the tool.
    #[serde(default)]
    pub images: Vec<String>,
}

impl ToolResult {
    pub fn success(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            ..Self::default()
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            text: message.into(),
            is_error: true,
            ..Self::default()
        }
    }

    pub fn with_data(mut self, key: &str, value: Value) -> Self {
        self.data.insert(key.to_owned(), value);
        self
    }
}

/// A message in the conversation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub content: MessageContent,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::User => "user",
            Role::Assistant => "assistant",
        }
    }

    pub fn parse(s: &str) -> Option<Role> {
        match s {
            "user" => Some(Role::User),
            "assistant" => Some(Role::Assistant),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MessageContent {
    Text(String),
    Blocks(Vec<ContentBlock>),
}

/// A tagged content variant inside a structured message.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ContentBlock {
    #[serde(rename = "text")]
    Text { text: String },
    #[serde(rename = "tool_use")]
    ToolUse {
        id: String,
        name: String,
        input: Value,
    },
    #[serde(rename = "tool_result")]
    ToolResult {
        tool_use_id: String,
        content: String,
        #[serde(default)]
        is_error: bool,
    },
}

// ── Convenience constructors ───────────────────────────────────────

impl Message {
    pub fn user(text: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: MessageContent::Text(text.into()),
        }
    }

    pub fn assistant(text: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: MessageContent::Text(text.into()),
        }
    }

    /// The synthetic user-role carrier holding a batch of tool results.
    pub fn tool_results(blocks: Vec<ContentBlock>) -> Self {
        Self {
            role: Role::User,
            content: MessageContent::Blocks(blocks),
        }
    }

    /// True when this is a tool-result carrier rather than real user input.
    pub fn is_tool_result_carrier(&self) -> bool {
        self.role == Role::User
            && matches!(
                &self.content,
                MessageContent::Blocks(blocks)
                    if blocks.first().is_some_and(|b| matches!(b, ContentBlock::ToolResult { .. }))
            )
    }
}

impl MessageContent {
    /// Extract the plain-text content (the text, or the first text block).
    pub fn text(&self) -> Option<&str> {
        match self {
            MessageContent::Text(t) => Some(t.as_str()),
            MessageContent::Blocks(blocks) => blocks.iter().find_map(|b| match b {
                ContentBlock::Text { text } => Some(text.as_str()),
                _ => None,
            }),
        }
    }

    /// All text that counts toward the token estimate: text blocks,
    /// tool-result content, and the JSON form of tool_use inputs.
    pub fn estimable_text(&self) -> String {
        match self {
            MessageContent::Text(t) => t.clone(),
            MessageContent::Blocks(blocks) => {
                let parts: Vec<String> = blocks
                    .iter()
                    .map(|b| match b {
                        ContentBlock::Text { text } => text.clone(),
                        ContentBlock::ToolResult { content, .. } => content.clone(),
                        ContentBlock::ToolUse { input, .. } => input.to_string(),
                    })
                    .collect();
                parts.join(" ")
            }
        }
    }
}
