//! Semantic history compression.
//!
//! When the conversation crosses the token threshold, the oldest prefix
//! is summarized through the LLM and replaced with a single synthetic
//! user message. The summary is also appended to the session as a real
//! message and becomes the new load checkpoint, so a restart resumes
//! from the compressed state.

use std::sync::Arc;

use serde_json::json;

use gp_domain::bus::EventBus;
use gp_domain::error::Result;
use gp_domain::events::{Event, EventType};
use gp_domain::tool::{ContentBlock, Message, MessageContent, Role};
use gp_providers::{ChatRequest, LlmClient};
use gp_sessions::{MetaUpdate, SessionStore};

use crate::context::estimate_messages_tokens;

/// Summarize when the estimated history exceeds this many tokens.
const SUMMARIZE_THRESHOLD: usize = 80_000;
/// Keep the most recent N messages unsummarized.
const KEEP_RECENT: usize = 10;
/// Rendered line cap when condensing for the summary prompt.
const LINE_CAP: usize = 500;

const SUMMARIZE_PROMPT: &str = "\
You are a conversation summarizer. Summarize the following conversation \
between a user and a graph-workflow assistant. Focus on:

1. What the user wanted to accomplish
2. Key decisions made (node types chosen, model names, parameters)
3. Workflows that were built or submitted (include prompt_ids)
4. Any errors encountered and how they were resolved
5. Current state of the conversation

Be concise but preserve all technical details that would be needed to \
continue the conversation. Output a single summary paragraph.

Conversation to summarize:
";

/// Compresses old history via the LLM and installs summary checkpoints.
pub struct Summarizer {
    llm: Arc<dyn LlmClient>,
    sessions: Arc<SessionStore>,
    bus: Arc<EventBus>,
    threshold: usize,
    keep_recent: usize,
}

impl Summarizer {
    pub fn new(llm: Arc<dyn LlmClient>, sessions: Arc<SessionStore>, bus: Arc<EventBus>) -> Self {
        Self {
            llm,
            sessions,
            bus,
            threshold: SUMMARIZE_THRESHOLD,
            keep_recent: KEEP_RECENT,
        }
    }

    pub fn with_limits(mut self, threshold: usize, keep_recent: usize) -> Self {
        self.threshold = threshold;
        self.keep_recent = keep_recent;
        self
    }

    /// Summarize if over threshold; returns the (possibly compressed)
    /// message list. Failures leave the input unchanged — the turn
    /// proceeds uncompressed.
    pub async fn maybe_summarize(&self, session_id: &str, messages: Vec<Message>) -> Vec<Message> {
        let total_tokens = estimate_messages_tokens(&messages);
        if total_tokens <= self.threshold {
            return messages;
        }
        if messages.len() <= self.keep_recent + 2 {
            // Not enough history to summarize meaningfully.
            return messages;
        }

        tracing::info!(
            total_tokens,
            threshold = self.threshold,
            messages = messages.len(),
            "summarization triggered"
        );

        match self.summarize(session_id, &messages, total_tokens).await {
            Ok(new_messages) => new_messages,
            Err(e) => {
                tracing::warn!(error = %e, "summarization failed, continuing with full history");
                messages
            }
        }
    }

    async fn summarize(
        &self,
        session_id: &str,
        messages: &[Message],
        total_tokens: usize,
    ) -> Result<Vec<Message>> {
        let cutoff = messages.len() - self.keep_recent;
        let old = &messages[..cutoff];
        let recent = &messages[cutoff..];

        let summary_text = self.generate_summary(old).await?;
        let summary_content = format!("[Previous conversation summary]\n{summary_text}");

        let mut new_messages = vec![Message::user(summary_content.clone())];
        new_messages.extend_from_slice(recent);

        // Persist the checkpoint; later loads resume from it.
        let summary_id = self.sessions.append_message(
            session_id,
            Role::User,
            &MessageContent::Text(summary_content),
        )?;
        self.sessions.update_session_meta(
            session_id,
            MetaUpdate {
                summary_message_id: Some(summary_id),
                ..Default::default()
            },
        )?;

        let summary_tokens = estimate_messages_tokens(&new_messages);
        self.bus
            .emit(
                Event::with_data(
                    EventType::ContextSummarized,
                    json!({
                        "original_tokens": total_tokens,
                        "summary_tokens": summary_tokens,
                        "messages_summarized": old.len(),
                    }),
                )
                .for_session(session_id),
            )
            .await;

        tracing::info!(
            summarized = old.len(),
            original_tokens = total_tokens,
            summary_tokens,
            "history summarized"
        );
        Ok(new_messages)
    }

    async fn generate_summary(&self, messages: &[Message]) -> Result<String> {
        let condensed = condense_for_summary(messages);
        let prompt = format!("{SUMMARIZE_PROMPT}{condensed}");

        let resp = self
            .llm
            .chat(ChatRequest {
                messages: vec![Message::user(prompt)],
                tools: Vec::new(),
                system: "You are a concise summarizer. Output only the summary.".into(),
                max_tokens: None,
            })
            .await?;
        Ok(resp.text)
    }
}

/// Render messages as role-prefixed lines for the summary prompt.
/// Long lines are capped; tool blocks become compact markers.
fn condense_for_summary(messages: &[Message]) -> String {
    let mut parts = Vec::new();
    for msg in messages {
        let text = match &msg.content {
            MessageContent::Text(t) => t.clone(),
            MessageContent::Blocks(blocks) => {
                let rendered: Vec<String> = blocks
                    .iter()
                    .map(|b| match b {
                        ContentBlock::Text { text } => text.clone(),
                        ContentBlock::ToolUse { name, input, .. } => {
                            format!("[Tool: {name}({})]", cap(&input.to_string(), 200))
                        }
                        ContentBlock::ToolResult { content, .. } => {
                            format!("[Result: {}]", cap(content, 300))
                        }
                    })
                    .collect();
                rendered.join(" ")
            }
        };
        parts.push(format!("{}: {}", msg.role.as_str(), cap(&text, LINE_CAP)));
    }
    parts.join("\n")
}

fn cap(text: &str, limit: usize) -> String {
    if text.len() <= limit {
        return text.to_owned();
    }
    let mut end = limit;
    while !text.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}...", &text[..end])
}
