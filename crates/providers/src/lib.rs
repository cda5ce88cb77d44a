//! LLM provider adapters.
//!
//! The agent loop speaks [`traits::LlmClient`]; the Anthropic adapter
//! translates that into the Messages API with SSE streaming and tool use,
//! re-emitting stream progress on the event bus and retrying transient
//! failures with exponential backoff. [`mock::MockLlm`] provides a
//! scripted client for tests.

pub mod anthropic;
pub mod mock;
pub mod sse;
pub mod traits;

pub use anthropic::AnthropicClient;
pub use traits::{ChatRequest, LlmClient, LlmResponse};
