//! Intent pre-analysis — lightweight LLM classification of user input.
//!
//! One compact LLM call decides topic tags, whether environment info is
//! needed, and which prompt sections to inject. Fails open: any error
//! or malformed response returns the default that includes everything.

use std::sync::Arc;

use serde_json::Value;

use gp_domain::context::IntentResult;
use gp_domain::tool::Message;
use gp_providers::{ChatRequest, LlmClient};

const ANALYSIS_PROMPT: &str = "\
Classify this user message for a graph-workflow assistant. Respond in JSON only.
{\"topics\": [\"tag1\", \"tag2\"], \"env_needed\": true/false, \"sections\": [\"section_name\", ...], \"knowledge_tags\": [\"tag\", ...]}

Rules:
- topics: 2-3 keyword tags describing the intent
- env_needed: true if the message asks about GPU, models, system status, or needs model names for workflow building
- sections: which context sections to include. Options: environment, workflow_strategy, tool_reference, rules, error_handling
- knowledge_tags: keywords to select relevant knowledge sections, empty for all

Message: ";

/// Pre-analyzes user intent before the main loop.
pub struct IntentAnalyzer {
    llm: Arc<dyn LlmClient>,
}

impl IntentAnalyzer {
    pub fn new(llm: Arc<dyn LlmClient>) -> Self {
        Self { llm }
    }

    /// Analyze user input; returns the fail-open default on any failure.
    pub async fn analyze(&self, user_input: &str) -> IntentResult {
        let prompt = format!("{ANALYSIS_PROMPT}{user_input}");
        let resp = self
            .llm
            .chat(ChatRequest {
                messages: vec![Message::user(prompt)],
                tools: Vec::new(),
                system: "You are a classifier. Output JSON only, no explanation.".into(),
                max_tokens: Some(512),
            })
            .await;

        match resp {
            Ok(resp) => parse_response(&resp.text),
            Err(e) => {
                tracing::warn!(error = %e, "intent analysis failed, using defaults");
                IntentResult::default()
            }
        }
    }
}

/// Parse the classifier's JSON, tolerating fenced code blocks.
fn parse_response(response_text: &str) -> IntentResult {
    let text = strip_code_fence(response_text.trim());

    let Ok(data) = serde_json::from_str::<Value>(text) else {
        tracing::warn!("intent response was not JSON, using defaults");
        return IntentResult::default();
    };
    if !data.is_object() {
        return IntentResult::default();
    }

    let defaults = IntentResult::default();
    IntentResult {
        topics: string_list(&data, "topics")
            .map(|mut topics| {
                topics.truncate(3);
                topics
            })
            .unwrap_or(defaults.topics),
        environment_needed: data
            .get("env_needed")
            .and_then(|v| v.as_bool())
            .unwrap_or(true),
        suggested_sections: string_list(&data, "sections").unwrap_or(defaults.suggested_sections),
        knowledge_tags: string_list(&data, "knowledge_tags").unwrap_or_default(),
    }
}

fn string_list(data: &Value, key: &str) -> Option<Vec<String>> {
    data.get(key).and_then(|v| v.as_array()).map(|arr| {
        arr.iter()
            .filter_map(|v| v.as_str().map(str::to_owned))
            .collect()
    })
}

fn strip_code_fence(text: &str) -> &str {
    let Some(stripped) = text.strip_prefix("```") else {
        return text;
    };
    // Drop the fence line ("```json" or bare "```"), then the closing fence.
    let body = stripped.split_once('\n').map(|(_, rest)| rest).unwrap_or("");
    body.trim_end().strip_suffix("```").unwrap_or(body).trim()
}

#[cfg(test)]
mod tests {
    use super::*;
    use gp_providers::mock::MockLlm;

    #[test]
    fn parses_plain_json() {
        let result = parse_response(
            r#"{"topics": ["upscale", "models"], "env_needed": false, "sections": ["workflow_strategy"], "knowledge_tags": ["upscaling"]}"#,
        );
        assert_eq!(result.topics, vec!["upscale", "models"]);
        assert!(!result.environment_needed);
        assert_eq!(result.suggested_sections, vec!["workflow_strategy"]);
        assert_eq!(result.knowledge_tags, vec!["upscaling"]);
    }

    #[test]
    fn parses_fenced_json() {
        let result = parse_response(
            "```json\n{\"topics\": [\"status\"], \"env_needed\": true, \"sections\": []}\n```",
        );
        assert_eq!(result.topics, vec!["status"]);
        assert!(result.environment_needed);
        assert!(result.suggested_sections.is_empty());
    }

    #[test]
    fn topics_capped_at_three() {
        let result =
            parse_response(r#"{"topics": ["a", "b", "c", "d", "e"], "env_needed": true}"#);
        assert_eq!(result.topics.len(), 3);
    }

    #[test]
    fn garbage_fails_open() {
        let result = parse_response("I think you want to build a workflow!");
        let defaults = IntentResult::default();
        assert!(result.environment_needed);
        assert_eq!(result.suggested_sections, defaults.suggested_sections);
        assert_eq!(result.topics, defaults.topics);
    }

    #[test]
    fn non_object_json_fails_open() {
        let result = parse_response("[1, 2, 3]");
        assert!(result.environment_needed);
        assert_eq!(
            result.suggested_sections,
            IntentResult::default().suggested_sections
        );
    }

    #[test]
    fn missing_fields_use_defaults() {
        let result = parse_response(r#"{"env_needed": false}"#);
        assert!(!result.environment_needed);
        assert_eq!(result.topics, IntentResult::default().topics);
        assert!(!result.suggested_sections.is_empty());
    }

    #[tokio::test]
    async fn llm_error_fails_open() {
        let mock = Arc::new(MockLlm::new());
        mock.enqueue_error(gp_domain::Error::Other("down".into()));
        let analyzer = IntentAnalyzer::new(mock);
        let result = analyzer.analyze("hi").await;
        assert!(result.environment_needed);
        assert_eq!(
            result.suggested_sections,
            IntentResult::default().suggested_sections
        );
    }

    #[tokio::test]
    async fn end_to_end_classification() {
        let mock = Arc::new(MockLlm::new());
        mock.enqueue_text(r#"{"topics": ["models"], "env_needed": true, "sections": ["environment"]}"#);
        let analyzer = IntentAnalyzer::new(mock);
        let result = analyzer.analyze("what checkpoints do I have?").await;
        assert_eq!(result.topics, vec!["models"]);
        assert_eq!(result.suggested_sections, vec!["environment"]);
    }
}
