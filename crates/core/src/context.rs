//! Context window management.
//!
//! Prevents token overflow by compacting messages before each LLM call.
//! Token counts use a local ~4 chars/token heuristic — no API calls.
//!
//! Compression stages (by increasing aggressiveness):
//! 1. Truncate old tool results (past the keep-recent window)
//! 2. Emergency trim: keep only the last real user turn

use gp_domain::tool::{ContentBlock, Message, MessageContent};

/// Model name → context window tokens. Prefix matches cover dated
/// snapshot suffixes; anything unknown gets the default.
const MODEL_CONTEXT_SIZES: &[(&str, usize)] = &[
    ("claude-opus-4-6", 200_000),
    ("claude-sonnet-4-5-20250929", 200_000),
    ("claude-haiku-4-5-20251001", 200_000),
    ("claude-sonnet-4-20250514", 200_000),
    ("claude-3-5-sonnet-20241022", 200_000),
    ("claude-3-5-haiku-20241022", 200_000),
    ("claude-3-opus-20240229", 200_000),
];
const DEFAULT_CONTEXT_SIZE: usize = 200_000;

// Overhead tokens reserved for system prompt, tool schemas, and safety.
const SYSTEM_OVERHEAD: usize = 2_000;
const TOOL_SCHEMA_OVERHEAD: usize = 3_000;
const SAFETY_BUFFER: usize = 5_000;

/// Per-message role overhead in tokens.
const ROLE_OVERHEAD: usize = 4;

fn resolve_context_size(model: &str) -> usize {
    for (key, size) in MODEL_CONTEXT_SIZES {
        if model == *key {
            return *size;
        }
    }
    for (key, size) in MODEL_CONTEXT_SIZES {
        if model.starts_with(key) {
            return *size;
        }
    }
    DEFAULT_CONTEXT_SIZE
}

/// Estimate token count for a string (~4 chars/token, minimum 1).
pub fn estimate_tokens(text: &str) -> usize {
    (text.len() / 4).max(1)
}

/// Estimate total tokens for a message list.
pub fn estimate_messages_tokens(messages: &[Message]) -> usize {
    messages
        .iter()
        .map(|m| ROLE_OVERHEAD + estimate_tokens(&m.content.estimable_text()))
        .sum()
}

/// Compacts conversation history to fit the model's context window.
pub struct ContextManager {
    history_budget: usize,
}

impl ContextManager {
    /// `context_budget` overrides the auto-resolved window when nonzero.
    pub fn new(model: &str, max_output_tokens: usize, context_budget: usize) -> Self {
        let context_size = if context_budget > 0 {
            context_budget
        } else {
            resolve_context_size(model)
        };
        let history_budget = context_size
            .saturating_sub(SYSTEM_OVERHEAD)
            .saturating_sub(TOOL_SCHEMA_OVERHEAD)
            .saturating_sub(max_output_tokens)
            .saturating_sub(SAFETY_BUFFER);
        tracing::info!(
            context_size,
            history_budget,
            model = if model.is_empty() { "default" } else { model },
            "context manager ready"
        );
        Self { history_budget }
    }

    pub fn history_budget(&self) -> usize {
        self.history_budget
    }

    /// Compact messages to fit the history budget. Pure: returns a new
    /// list, the input is untouched.
    pub fn prepare(&self, messages: &[Message]) -> Vec<Message> {
        let tokens = estimate_messages_tokens(messages);
        if tokens <= self.history_budget {
            return messages.to_vec();
        }

        tracing::info!(
            tokens,
            budget = self.history_budget,
            "context compaction needed"
        );

        // Stage 1: truncate old tool results.
        let compacted = compact_tool_results(messages, 6, 500, 200);
        let tokens = estimate_messages_tokens(&compacted);
        if tokens <= self.history_budget {
            tracing::info!(tokens, "after tool-result truncation");
            return compacted;
        }

        // Stage 2: emergency — keep only the last real user turn.
        tracing::warn!(
            tokens,
            budget = self.history_budget,
            "emergency trim"
        );
        let trimmed = emergency_trim(&compacted);
        tracing::info!(
            tokens = estimate_messages_tokens(&trimmed),
            "after emergency trim"
        );
        trimmed
    }
}

/// Truncate oversized `tool_result` content in messages older than the
/// last `keep_recent` positions.
fn compact_tool_results(
    messages: &[Message],
    keep_recent: usize,
    max_result_chars: usize,
    kept_prefix_chars: usize,
) -> Vec<Message> {
    let cutoff = messages.len().saturating_sub(keep_recent);

    messages
        .iter()
        .enumerate()
        .map(|(i, msg)| {
            if i >= cutoff {
                return msg.clone();
            }
            let MessageContent::Blocks(blocks) = &msg.content else {
                return msg.clone();
            };

            let mut changed = false;
            let new_blocks: Vec<ContentBlock> = blocks
                .iter()
                .map(|block| match block {
                    ContentBlock::ToolResult {
                        tool_use_id,
                        content,
                        is_error,
                    } if content.len() > max_result_chars => {
                        changed = true;
                        let mut prefix_end = kept_prefix_chars.min(content.len());
                        while !content.is_char_boundary(prefix_end) {
                            prefix_end -= 1;
                        }
                        ContentBlock::ToolResult {
                            tool_use_id: tool_use_id.clone(),
                            content: format!(
                                "{}\n\n... [truncated, was {} chars]",
                                &content[..prefix_end],
                                content.len()
                            ),
                            is_error: *is_error,
                        }
                    }
                    other => other.clone(),
                })
                .collect();

            if changed {
                Message {
                    role: msg.role,
                    content: MessageContent::Blocks(new_blocks),
                }
            } else {
                msg.clone()
            }
        })
        .collect()
}

/// Keep the last user message that is *not* a tool-result carrier and
/// everything after it. Falls back to the last two messages.
fn emergency_trim(messages: &[Message]) -> Vec<Message> {
    for i in (0..messages.len()).rev() {
        let msg = &messages[i];
        if msg.role == gp_domain::tool::Role::User && !msg.is_tool_result_carrier() {
            return messages[i..].to_vec();
        }
    }
    let start = messages.len().saturating_sub(2);
    messages[start..].to_vec()
}
