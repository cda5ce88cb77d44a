//! Anthropic Messages API adapter.
//!
//! Streams every completion over SSE, assembling text and tool calls from
//! content blocks while re-emitting `stream.*` events on the bus. System
//! text goes in the Anthropic-specific top-level `system` field; tool
//! results ride as user messages with `tool_result` content blocks.
//!
//! Transient failures (HTTP 429 and 5xx) are retried with exponential
//! backoff and ±20% jitter; a parseable `Retry-After` header overrides
//! the computed delay. Each retry emits `llm.retry`.

use std::collections::HashMap;
use std::sync::Arc;

use serde_json::{json, Value};

use gp_domain::bus::EventBus;
use gp_domain::config::LlmConfig;
use gp_domain::error::{Error, Result};
use gp_domain::events::{Event, EventType};
use gp_domain::stream::{StreamEvent, Usage};
use gp_domain::tool::{Message, MessageContent, Role, ToolCall, ToolDefinition};

use crate::sse::drain_data_lines;
use crate::traits::{ChatRequest, LlmClient, LlmResponse};

const ANTHROPIC_VERSION: &str = "2023-06-01";
const DEFAULT_BASE_URL: &str = "https://api.anthropic.com";

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Adapter struct
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Streaming Anthropic client with tool use and retry.
pub struct AnthropicClient {
    base_url: String,
    api_key: String,
    model: String,
    max_tokens: u32,
    temperature: f32,
    max_retries: u32,
    retry_base_delay_ms: u64,
    retry_max_delay_ms: u64,
    bus: Option<Arc<EventBus>>,
    client: reqwest::Client,
}

impl AnthropicClient {
    pub fn from_config(cfg: &LlmConfig, bus: Option<Arc<EventBus>>) -> Result<Self> {
        let api_key = cfg.resolve_api_key();
        if api_key.is_empty() {
            return Err(Error::Config(format!(
                "{}_API_KEY not set — configure llm.api_key or the environment variable",
                cfg.provider.to_uppercase()
            )));
        }

        let base_url = if cfg.base_url.is_empty() {
            DEFAULT_BASE_URL.to_owned()
        } else {
            cfg.base_url.trim_end_matches('/').to_owned()
        };

        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(300))
            .build()
            .map_err(|e| Error::Http(e.to_string()))?;

        Ok(Self {
            base_url,
            api_key,
            model: cfg.model.clone(),
            max_tokens: cfg.max_tokens,
            temperature: cfg.temperature,
            max_retries: cfg.max_retries.max(1),
            retry_base_delay_ms: cfg.retry_base_delay_ms,
            retry_max_delay_ms: cfg.retry_max_delay_ms,
            bus,
            client,
        })
    }

    /// The configured model id.
    pub fn model(&self) -> &str {
        &self.model
    }

    async fn emit(&self, event: Event) {
        if let Some(bus) = &self.bus {
            bus.emit(event).await;
        }
    }

    fn build_body(&self, req: &ChatRequest) -> Value {
        let api_messages: Vec<Value> = req.messages.iter().map(message_to_api).collect();

        let mut body = json!({
            "model": self.model,
            "messages": api_messages,
            "max_tokens": req.max_tokens.unwrap_or(self.max_tokens),
            "temperature": self.temperature,
            "stream": true,
        });

        if !req.system.is_empty() {
            body["system"] = Value::String(req.system.clone());
        }
        if !req.tools.is_empty() {
            let tools: Vec<Value> = req.tools.iter().map(tool_to_api).collect();
            body["tools"] = Value::Array(tools);
        }

        body
    }

    // ── Single streaming attempt ───────────────────────────────────

    async fn chat_once(&self, req: &ChatRequest) -> std::result::Result<LlmResponse, CallError> {
        let url = format!("{}/v1/messages", self.base_url);
        let body = self.build_body(req);

        tracing::debug!(model = %self.model, url = %url, "anthropic stream request");

        let resp = self
            .client
            .post(&url)
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", ANTHROPIC_VERSION)
            .header("Content-Type", "application/json")
            .json(&body)
            .send()
            .await
            .map_err(|e| CallError::Fatal(Error::Http(e.to_string())))?;

        let status = resp.status();
        if status.as_u16() == 429 || status.is_server_error() {
            let retry_after_ms = parse_retry_after(resp.headers());
            let text = resp.text().await.unwrap_or_default();
            return Err(CallError::Transient {
                status: status.as_u16(),
                retry_after_ms,
                message: format!("HTTP {} - {}", status.as_u16(), text),
            });
        }
        if !status.is_success() {
            let text = resp.text().await.unwrap_or_default();
            return Err(CallError::Fatal(Error::Provider {
                provider: "anthropic".into(),
                message: format!("HTTP {} - {}", status.as_u16(), text),
            }));
        }

        self.consume_stream(resp).await
    }

    /// Read the SSE body to completion, emitting `stream.*` events and
    /// assembling the final response.
    async fn consume_stream(
        &self,
        mut resp: reqwest::Response,
    ) -> std::result::Result<LlmResponse, CallError> {
        let mut buffer = String::new();
        let mut state = StreamState::new();
        let mut out = LlmResponse::default();

        loop {
            let chunk = resp
                .chunk()
                .await
                .map_err(|e| CallError::Fatal(Error::Http(e.to_string())))?;
            let Some(bytes) = chunk else {
                // Stream ended — flush any remaining partial event.
                if !buffer.trim().is_empty() {
                    buffer.push_str("\n\n");
                    for data in drain_data_lines(&mut buffer) {
                        self.apply_events(parse_sse(&data, &mut state), &mut out)
                            .await?;
                    }
                }
                break;
            };

            buffer.push_str(&String::from_utf8_lossy(&bytes));
            for data in drain_data_lines(&mut buffer) {
                self.apply_events(parse_sse(&data, &mut state), &mut out)
                    .await?;
            }
        }

        tracing::debug!(
            stop_reason = %out.stop_reason,
            tool_calls = out.tool_calls.len(),
            input_tokens = out.usage.input_tokens,
            output_tokens = out.usage.output_tokens,
            "anthropic response assembled"
        );
        Ok(out)
    }

    async fn apply_events(
        &self,
        events: Vec<StreamEvent>,
        out: &mut LlmResponse,
    ) -> std::result::Result<(), CallError> {
        for event in events {
            match event {
                StreamEvent::Token { text } => {
                    out.text.push_str(&text);
                    self.emit(Event::with_data(
                        EventType::StreamTextDelta,
                        json!({ "text": text }),
                    ))
                    .await;
                }
                StreamEvent::ToolCallStarted { call_id, tool_name } => {
                    self.emit(Event::with_data(
                        EventType::StreamToolCallStart,
                        json!({ "tool_name": tool_name, "tool_id": call_id }),
                    ))
                    .await;
                }
                StreamEvent::ToolCallDelta { delta, .. } => {
                    self.emit(Event::with_data(
                        EventType::StreamToolCallDelta,
                        json!({ "partial_json": delta }),
                    ))
                    .await;
                }
                StreamEvent::ToolCallFinished {
                    call_id,
                    tool_name,
                    arguments,
                } => {
                    out.tool_calls.push(ToolCall {
                        id: call_id,
                        name: tool_name,
                        input: arguments,
                    });
                }
                StreamEvent::Done { usage, stop_reason } => {
                    if let Some(usage) = usage {
                        out.usage = usage;
                    }
                    if let Some(reason) = stop_reason {
                        out.stop_reason = reason;
                    }
                    self.emit(Event::with_data(
                        EventType::StreamMessageStop,
                        json!({ "stop_reason": out.stop_reason }),
                    ))
                    .await;
                }
                StreamEvent::Error { message } => {
                    return Err(CallError::Fatal(Error::Provider {
                        provider: "anthropic".into(),
                        message,
                    }));
                }
            }
        }
        Ok(())
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Retry policy
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

enum CallError {
    /// Rate-limit or server-side failure; retried with backoff.
    Transient {
        status: u16,
        retry_after_ms: Option<u64>,
        message: String,
    },
    /// Everything else; propagated immediately.
    Fatal(Error),
}

/// `min(base · 2^(attempt−1) · jitter, cap)`, jitter in [0.8, 1.2].
fn compute_delay_ms(attempt: u32, base_ms: u64, cap_ms: u64, jitter: f64) -> u64 {
    let exp = base_ms.saturating_mul(1u64 << (attempt.saturating_sub(1)).min(32));
    let delayed = (exp as f64 * jitter) as u64;
    delayed.min(cap_ms)
}

fn parse_retry_after(headers: &reqwest::header::HeaderMap) -> Option<u64> {
    headers
        .get("retry-after")
        .and_then(|v| v.to_str().ok())
        .and_then(|s| s.trim().parse::<f64>().ok())
        .map(|secs| (secs * 1000.0) as u64)
}

#[async_trait::async_trait]
impl LlmClient for AnthropicClient {
    async fn chat(&self, req: ChatRequest) -> Result<LlmResponse> {
        let mut last_message = String::new();
        let mut last_status = 0u16;

        for attempt in 1..=self.max_retries {
            match self.chat_once(&req).await {
                Ok(resp) => return Ok(resp),
                Err(CallError::Fatal(e)) => return Err(e),
                Err(CallError::Transient {
                    status,
                    retry_after_ms,
                    message,
                }) => {
                    last_message = message.clone();
                    last_status = status;
                    if attempt == self.max_retries {
                        break;
                    }

                    let jitter = rand::Rng::gen_range(&mut rand::thread_rng(), 0.8..=1.2);
                    let delay_ms = retry_after_ms.unwrap_or_else(|| {
                        compute_delay_ms(
                            attempt,
                            self.retry_base_delay_ms,
                            self.retry_max_delay_ms,
                            jitter,
                        )
                    });

                    tracing::warn!(
                        attempt,
                        max_retries = self.max_retries,
                        status,
                        delay_ms,
                        "transient LLM failure — retrying"
                    );
                    self.emit(Event::with_data(
                        EventType::LlmRetry,
                        json!({
                            "attempt": attempt,
                            "max_retries": self.max_retries,
                            "delay_ms": delay_ms,
                            "error": message,
                        }),
                    ))
                    .await;

                    tokio::time::sleep(std::time::Duration::from_millis(delay_ms)).await;
                }
            }
        }

        Err(Error::Provider {
            provider: "anthropic".into(),
            message: format!("retries exhausted (HTTP {last_status}): {last_message}"),
        })
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Message serialization
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

fn message_to_api(msg: &Message) -> Value {
    let role = msg.role.as_str();
    match &msg.content {
        MessageContent::Text(t) => {
            if msg.role == Role::Assistant {
                json!({ "role": role, "content": [{"type": "text", "text": t}] })
            } else {
                json!({ "role": role, "content": t })
            }
        }
        // Content blocks mirror the wire format exactly.
        MessageContent::Blocks(blocks) => {
            json!({ "role": role, "content": blocks })
        }
    }
}

fn tool_to_api(tool: &ToolDefinition) -> Value {
    json!({
        "name": tool.name,
        "description": tool.description,
        "input_schema": tool.input_schema,
    })
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Streaming SSE parsing
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Assembly state for tool calls arriving over streamed content blocks.
struct StreamState {
    /// block index -> (call_id, name, args_buffer)
    active_tool_calls: HashMap<u64, (String, String, String)>,
    usage: Option<Usage>,
    done_emitted: bool,
}

impl StreamState {
    fn new() -> Self {
        Self {
            active_tool_calls: HashMap::new(),
            usage: None,
            done_emitted: false,
        }
    }
}

/// Parse one Anthropic SSE payload into zero or more stream events.
fn parse_sse(data: &str, state: &mut StreamState) -> Vec<StreamEvent> {
    let mut events = Vec::new();

    let v: Value = match serde_json::from_str(data) {
        Ok(v) => v,
        Err(e) => {
            tracing::debug!(error = %e, "unparseable SSE payload, skipping");
            return events;
        }
    };

    let event_type = v.get("type").and_then(|v| v.as_str()).unwrap_or("");

    match event_type {
        "message_start" => {
            if let Some(msg) = v.get("message") {
                state.usage = msg.get("usage").and_then(parse_usage);
            }
        }

        "content_block_start" => {
            let idx = v.get("index").and_then(|v| v.as_u64()).unwrap_or(0);
            if let Some(block) = v.get("content_block") {
                let block_type = block.get("type").and_then(|v| v.as_str()).unwrap_or("");
                if block_type == "tool_use" {
                    let call_id = str_field(block, "id");
                    let name = str_field(block, "name");
                    events.push(StreamEvent::ToolCallStarted {
                        call_id: call_id.clone(),
                        tool_name: name.clone(),
                    });
                    state
                        .active_tool_calls
                        .insert(idx, (call_id, name, String::new()));
                }
            }
        }

        "content_block_delta" => {
            let idx = v.get("index").and_then(|v| v.as_u64()).unwrap_or(0);
            if let Some(delta) = v.get("delta") {
                let delta_type = delta.get("type").and_then(|v| v.as_str()).unwrap_or("");
                match delta_type {
                    "text_delta" => {
                        if let Some(text) = delta.get("text").and_then(|v| v.as_str()) {
                            if !text.is_empty() {
                                events.push(StreamEvent::Token {
                                    text: text.to_owned(),
                                });
                            }
                        }
                    }
                    "input_json_delta" => {
                        if let Some(partial) = delta.get("partial_json").and_then(|v| v.as_str()) {
                            if let Some(tc) = state.active_tool_calls.get_mut(&idx) {
                                tc.2.push_str(partial);
                                events.push(StreamEvent::ToolCallDelta {
                                    call_id: tc.0.clone(),
                                    delta: partial.to_owned(),
                                });
                            }
                        }
                    }
                    _ => {}
                }
            }
        }

        "content_block_stop" => {
            let idx = v.get("index").and_then(|v| v.as_u64()).unwrap_or(0);
            if let Some((call_id, tool_name, args_str)) = state.active_tool_calls.remove(&idx) {
                let arguments: Value =
                    serde_json::from_str(&args_str).unwrap_or(Value::Object(Default::default()));
                events.push(StreamEvent::ToolCallFinished {
                    call_id,
                    tool_name,
                    arguments,
                });
            }
        }

        "message_delta" => {
            if let Some(usage_val) = v.get("usage") {
                if let Some(output) = usage_val.get("output_tokens").and_then(|v| v.as_u64()) {
                    let u = state.usage.get_or_insert_with(Usage::default);
                    u.output_tokens = output as u32;
                }
            }
            let stop_reason = v
                .get("delta")
                .and_then(|d| d.get("stop_reason"))
                .and_then(|v| v.as_str())
                .map(str::to_owned);
            if let Some(reason) = stop_reason {
                state.done_emitted = true;
                events.push(StreamEvent::Done {
                    usage: state.usage,
                    stop_reason: Some(reason),
                });
            }
        }

        "message_stop" => {
            if !state.done_emitted {
                state.done_emitted = true;
                events.push(StreamEvent::Done {
                    usage: state.usage,
                    stop_reason: Some("end_turn".into()),
                });
            }
        }

        "error" => {
            let msg = v
                .get("error")
                .and_then(|e| e.get("message"))
                .and_then(|v| v.as_str())
                .unwrap_or("unknown error");
            events.push(StreamEvent::Error {
                message: msg.to_owned(),
            });
        }

        _ => {
            // ping and unknown event types — ignore.
        }
    }

    events
}

fn parse_usage(v: &Value) -> Option<Usage> {
    let input = v.get("input_tokens")?.as_u64()? as u32;
    let output = v
        .get("output_tokens")
        .and_then(|v| v.as_u64())
        .unwrap_or(0) as u32;
    Some(Usage {
        input_tokens: input,
        output_tokens: output,
    })
}

fn str_field(v: &Value, key: &str) -> String {
    v.get(key)
        .and_then(|v| v.as_str())
        .unwrap_or("")
        .to_owned()
}

#[cfg(test)]
mod tests {
    use super::*;
    use gp_domain::tool::ContentBlock;

    #[test]
    fn delay_doubles_per_attempt() {
        assert_eq!(compute_delay_ms(1, 2000, 60_000, 1.0), 2000);
        assert_eq!(compute_delay_ms(2, 2000, 60_000, 1.0), 4000);
        assert_eq!(compute_delay_ms(3, 2000, 60_000, 1.0), 8000);
    }

    #[test]
    fn delay_is_capped() {
        assert_eq!(compute_delay_ms(10, 2000, 60_000, 1.2), 60_000);
    }

    #[test]
    fn delay_jitter_applies_before_cap() {
        assert_eq!(compute_delay_ms(1, 2000, 60_000, 0.8), 1600);
        assert_eq!(compute_delay_ms(1, 2000, 60_000, 1.2), 2400);
    }

    #[test]
    fn user_text_message_stays_plain() {
        let api = message_to_api(&Message::user("hi"));
        assert_eq!(api["role"], "user");
        assert_eq!(api["content"], "hi");
    }

    #[test]
    fn assistant_text_wraps_in_block() {
        let api = message_to_api(&Message::assistant("hello"));
        assert_eq!(api["content"][0]["type"], "text");
        assert_eq!(api["content"][0]["text"], "hello");
    }

    #[test]
    fn tool_result_carrier_serializes_blocks() {
        let msg = Message::tool_results(vec![ContentBlock::ToolResult {
            tool_use_id: "t1".into(),
            content: "ok".into(),
            is_error: false,
        }]);
        let api = message_to_api(&msg);
        assert_eq!(api["role"], "user");
        assert_eq!(api["content"][0]["type"], "tool_result");
        assert_eq!(api["content"][0]["tool_use_id"], "t1");
    }

    #[test]
    fn sse_text_delta_produces_token() {
        let mut state = StreamState::new();
        let events = parse_sse(
            r#"{"type":"content_block_delta","index":0,"delta":{"type":"text_delta","text":"hi"}}"#,
            &mut state,
        );
        assert!(matches!(&events[0], StreamEvent::Token { text } if text == "hi"));
    }

    #[test]
    fn sse_tool_call_assembly() {
        let mut state = StreamState::new();

        let started = parse_sse(
            r#"{"type":"content_block_start","index":1,"content_block":{"type":"tool_use","id":"t1","name":"graph_monitor"}}"#,
            &mut state,
        );
        assert!(matches!(&started[0], StreamEvent::ToolCallStarted { call_id, .. } if call_id == "t1"));

        parse_sse(
            r#"{"type":"content_block_delta","index":1,"delta":{"type":"input_json_delta","partial_json":"{\"action\":"}}"#,
            &mut state,
        );
        parse_sse(
            r#"{"type":"content_block_delta","index":1,"delta":{"type":"input_json_delta","partial_json":"\"get_queue\"}"}}"#,
            &mut state,
        );

        let finished = parse_sse(r#"{"type":"content_block_stop","index":1}"#, &mut state);
        match &finished[0] {
            StreamEvent::ToolCallFinished {
                call_id,
                tool_name,
                arguments,
            } => {
                assert_eq!(call_id, "t1");
                assert_eq!(tool_name, "graph_monitor");
                assert_eq!(arguments["action"], "get_queue");
            }
            other => panic!("expected ToolCallFinished, got {other:?}"),
        }
    }

    #[test]
    fn sse_usage_flows_into_done() {
        let mut state = StreamState::new();
        parse_sse(
            r#"{"type":"message_start","message":{"usage":{"input_tokens":12,"output_tokens":0}}}"#,
            &mut state,
        );
        let events = parse_sse(
            r#"{"type":"message_delta","delta":{"stop_reason":"end_turn"},"usage":{"output_tokens":7}}"#,
            &mut state,
        );
        match &events[0] {
            StreamEvent::Done { usage, stop_reason } => {
                let usage = usage.expect("usage");
                assert_eq!(usage.input_tokens, 12);
                assert_eq!(usage.output_tokens, 7);
                assert_eq!(stop_reason.as_deref(), Some("end_turn"));
            }
            other => panic!("expected Done, got {other:?}"),
        }
    }

    #[test]
    fn sse_message_stop_is_fallback_done() {
        let mut state = StreamState::new();
        let events = parse_sse(r#"{"type":"message_stop"}"#, &mut state);
        assert!(matches!(&events[0], StreamEvent::Done { .. }));

        // Not duplicated when message_delta already closed the stream.
        let mut state = StreamState::new();
        parse_sse(
            r#"{"type":"message_delta","delta":{"stop_reason":"tool_use"}}"#,
            &mut state,
        );
        let events = parse_sse(r#"{"type":"message_stop"}"#, &mut state);
        assert!(events.is_empty());
    }

    #[test]
    fn sse_error_event_surfaces() {
        let mut state = StreamState::new();
        let events = parse_sse(
            r#"{"type":"error","error":{"message":"overloaded"}}"#,
            &mut state,
        );
        assert!(matches!(&events[0], StreamEvent::Error { message } if message == "overloaded"));
    }
}
