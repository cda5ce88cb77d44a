//! Pre-scripted mock LLM client for tests.
//!
//! Each call to `chat` pops the next scripted response from the front of
//! the queue, so tests can specify exact multi-turn sequences — including
//! tool calls and transient failures — without network access.

use std::collections::VecDeque;

use parking_lot::Mutex;
use serde_json::Value;

use gp_domain::error::{Error, Result};
use gp_domain::stream::Usage;
use gp_domain::tool::ToolCall;

use crate::traits::{ChatRequest, LlmClient, LlmResponse};

pub struct MockLlm {
    script: Mutex<VecDeque<Result<LlmResponse>>>,
    /// Every request seen, in order, so tests can inspect what was sent.
    requests: Mutex<Vec<ChatRequest>>,
}

impl Default for MockLlm {
    fn default() -> Self {
        Self::new()
    }
}

impl MockLlm {
    pub fn new() -> Self {
        Self {
            script: Mutex::new(VecDeque::new()),
            requests: Mutex::new(Vec::new()),
        }
    }

    /// Queue a plain text response.
    pub fn enqueue_text(&self, text: impl Into<String>) {
        self.script.lock().push_back(Ok(LlmResponse {
            text: text.into(),
            tool_calls: Vec::new(),
            stop_reason: "end_turn".into(),
            usage: Usage {
                input_tokens: 10,
                output_tokens: 5,
            },
        }));
    }

    /// Queue a response containing tool calls (with optional leading text).
    pub fn enqueue_tool_calls(&self, text: impl Into<String>, calls: Vec<(&str, &str, Value)>) {
        let tool_calls = calls
            .into_iter()
            .map(|(id, name, input)| ToolCall {
                id: id.into(),
                name: name.into(),
                input,
            })
            .collect();
        self.script.lock().push_back(Ok(LlmResponse {
            text: text.into(),
            tool_calls,
            stop_reason: "tool_use".into(),
            usage: Usage {
                input_tokens: 10,
                output_tokens: 5,
            },
        }));
    }

    /// Queue a raw response.
    pub fn enqueue(&self, resp: LlmResponse) {
        self.script.lock().push_back(Ok(resp));
    }

    /// Queue an error.
    pub fn enqueue_error(&self, error: Error) {
        self.script.lock().push_back(Err(error));
    }

    pub fn call_count(&self) -> usize {
        self.requests.lock().len()
    }

    /// Snapshot of every request received so far.
    pub fn requests(&self) -> Vec<ChatRequest> {
        self.requests.lock().clone()
    }
}

#[async_trait::async_trait]
impl LlmClient for MockLlm {
    async fn chat(&self, req: ChatRequest) -> Result<LlmResponse> {
        self.requests.lock().push(req);
        self.script
            .lock()
            .pop_front()
            .unwrap_or_else(|| Err(Error::Other("mock script exhausted".into())))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn pops_scripted_responses_in_order() {
        let mock = MockLlm::new();
        mock.enqueue_tool_calls("", vec![("t1", "graph_monitor", json!({"action": "get_queue"}))]);
        mock.enqueue_text("done");

        let first = mock.chat(ChatRequest::default()).await.unwrap();
        assert!(first.has_tool_calls());
        assert_eq!(first.tool_calls[0].id, "t1");

        let second = mock.chat(ChatRequest::default()).await.unwrap();
        assert_eq!(second.text, "done");
        assert_eq!(mock.call_count(), 2);
    }

    #[tokio::test]
    async fn exhausted_script_errors() {
        let mock = MockLlm::new();
        assert!(mock.chat(ChatRequest::default()).await.is_err());
    }
}
