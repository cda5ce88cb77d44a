//! Modular system prompt assembly.
//!
//! Registered sections plus freshly injected environment and canvas
//! sections are filtered by intent, ordered by category, and budgeted
//! by tokens. The registry is shared: the experience synthesizer
//! hot-registers new sections between turns.

use std::collections::HashMap;

use parking_lot::RwLock;

use gp_domain::context::{ContextSection, EnvironmentSnapshot, IntentResult, SectionCategory};

use crate::context::estimate_tokens;

/// Categories included regardless of intent filtering.
const ALWAYS_INCLUDE: [SectionCategory; 3] = [
    SectionCategory::Identity,
    SectionCategory::WorkflowStrategy,
    SectionCategory::Rules,
];

const FALLBACK_PROMPT: &str = "You are an assistant.";

/// Assembles the system prompt from registered [`ContextSection`]s.
pub struct PromptBuilder {
    token_budget: usize,
    sections: RwLock<HashMap<String, ContextSection>>,
}

impl PromptBuilder {
    pub fn new(token_budget: usize) -> Self {
        Self {
            token_budget: if token_budget > 0 { token_budget } else { 12_000 },
            sections: RwLock::new(HashMap::new()),
        }
    }

    /// Register (or replace) a section. Missing token estimates are
    /// computed here.
    pub fn register_section(&self, mut section: ContextSection) {
        if section.token_estimate == 0 {
            section.token_estimate = estimate_tokens(&section.content);
        }
        self.sections.write().insert(section.name.clone(), section);
    }

    /// Assemble the final system prompt.
    pub fn build(
        &self,
        intent: Option<&IntentResult>,
        environment: Option<&EnvironmentSnapshot>,
        canvas_summary: &str,
    ) -> String {
        let mut sections: Vec<ContextSection> = self.sections.read().values().cloned().collect();

        // Inject dynamic sections, replacing stale copies by name.
        if let Some(env) = environment {
            let text = env.to_prompt_text();
            sections.retain(|s| s.name != "environment");
            sections.push(ContextSection {
                name: "environment".into(),
                category: SectionCategory::Environment,
                token_estimate: estimate_tokens(&text),
                content: text,
                priority: 0,
            });
        }
        if !canvas_summary.trim().is_empty() {
            sections.retain(|s| s.name != "canvas");
            sections.push(ContextSection {
                name: "canvas".into(),
                category: SectionCategory::Environment,
                token_estimate: estimate_tokens(canvas_summary),
                content: canvas_summary.to_owned(),
                priority: 1,
            });
        }

        if let Some(intent) = intent {
            sections.retain(|s| keep_section(s, intent));
            if !intent.environment_needed {
                sections.retain(|s| s.category != SectionCategory::Environment);
            }
        }

        sections.sort_by_key(|s| (s.category.rank(), s.priority));

        // Token budget: drop what does not fit, keep walking.
        let mut kept = Vec::new();
        let mut running = 0usize;
        for section in sections {
            if running + section.token_estimate > self.token_budget {
                tracing::info!(
                    section = %section.name,
                    tokens = section.token_estimate,
                    "token budget: dropping section"
                );
                continue;
            }
            running += section.token_estimate;
            kept.push(section);
        }

        if kept.is_empty() {
            return FALLBACK_PROMPT.to_owned();
        }

        kept.iter()
            .map(|s| s.content.as_str())
            .collect::<Vec<_>>()
            .join("\n\n")
    }
}

impl Default for PromptBuilder {
    fn default() -> Self {
        Self::new(12_000)
    }
}

fn keep_section(section: &ContextSection, intent: &IntentResult) -> bool {
    if ALWAYS_INCLUDE.contains(&section.category) {
        return true;
    }
    // Knowledge and experience are always present, but knowledge tags
    // narrow the knowledge set when provided.
    if section.category == SectionCategory::Knowledge {
        if intent.knowledge_tags.is_empty() {
            return true;
        }
        return intent
            .knowledge_tags
            .iter()
            .any(|tag| section.name.contains(tag.as_str()));
    }
    if section.category == SectionCategory::Experience {
        return true;
    }
    intent
        .suggested_sections
        .iter()
        .any(|s| s == &section.name || s == section.category.as_str())
}

/// The built-in section set: identity, strategy, tool reference, rules,
/// and error handling for the graph-workflow assistant.
pub fn default_sections() -> Vec<ContextSection> {
    vec![
        ContextSection::new(
            "identity",
            SectionCategory::Identity,
            "You are a graph-workflow assistant. You help users create, manage, \
             and debug node-graph image-generation workflows through natural language.\n\n\
             Backend tools use {\"action\": \"<name>\", \"params\": {...}} routing. \
             See each tool description for available actions.",
        ),
        ContextSection::new(
            "workflow_strategy",
            SectionCategory::WorkflowStrategy,
            "## Workflow Building Strategy\n\n\
             Think in LINKS first, then convert to JSON.\n\n\
             Step 1: Plan the node chain using link notation:\n\
             \x20 CheckpointLoaderSimple_0 --MODEL--> KSampler_0.model\n\
             \x20 CheckpointLoaderSimple_0 --CLIP--> CLIPTextEncode_0.clip\n\
             \x20 CheckpointLoaderSimple_0 --CLIP--> CLIPTextEncode_1.clip\n\
             \x20 CLIPTextEncode_0 --CONDITIONING--> KSampler_0.positive\n\
             \x20 CLIPTextEncode_1 --CONDITIONING--> KSampler_0.negative\n\
             \x20 EmptyLatentImage_0 --LATENT--> KSampler_0.latent_image\n\
             \x20 KSampler_0 --LATENT--> VAEDecode_0.samples\n\
             \x20 CheckpointLoaderSimple_0 --VAE--> VAEDecode_0.vae\n\
             \x20 VAEDecode_0 --IMAGE--> SaveImage_0.images\n\n\
             Step 2: Convert to API JSON format:\n\
             \x20 Each unique NodeType_N becomes a node entry with a string ID.\n\
             \x20 Each link becomes an input reference: [source_node_id, output_index].\n\n\
             Use get_connectable(output_type) to check which nodes can produce \
             or consume a given type.\n\n\
             ## Workflow Building Process\n\n\
             1. Search for relevant nodes: graph_discover(action=\"search_nodes\", params={\"query\": \"...\"})\n\
             2. Check type compatibility: graph_discover(action=\"get_connectable\", params={\"output_type\": \"MODEL\"})\n\
             3. Get node details for KEY nodes only (checkpoint loader, sampler) \
             — skip simple nodes like CLIPTextEncode, EmptyLatentImage, VAEDecode, SaveImage\n\
             4. Plan the link chain, then build the workflow in API format\n\
             5. Validate: graph_discover(action=\"validate_workflow\", params={\"workflow\": {...}})\n\
             6. Submit: graph_execute(action=\"queue_prompt\", params={\"workflow\": {...}})\n\
             7. IMMEDIATELY give a final text response to the user \
             — do NOT call more tools after queue_prompt",
        ),
        ContextSection::new(
            "tool_reference",
            SectionCategory::ToolReference,
            "## Workflow API Format\n\n\
             A workflow is a dict of node_id -> {class_type, inputs}.\n\
             Node connections use [source_node_id, output_index] format.\n\n\
             Example txt2img:\n\
             {\n\
             \x20 \"1\": {\"class_type\": \"CheckpointLoaderSimple\", \"inputs\": {\"ckpt_name\": \"model.safetensors\"}},\n\
             \x20 \"2\": {\"class_type\": \"CLIPTextEncode\", \"inputs\": {\"text\": \"a photo of a cat\", \"clip\": [\"1\", 1]}},\n\
             \x20 \"3\": {\"class_type\": \"CLIPTextEncode\", \"inputs\": {\"text\": \"bad quality\", \"clip\": [\"1\", 1]}},\n\
             \x20 \"4\": {\"class_type\": \"EmptyLatentImage\", \"inputs\": {\"width\": 1024, \"height\": 1024, \"batch_size\": 1}},\n\
             \x20 \"5\": {\"class_type\": \"KSampler\", \"inputs\": {\"model\": [\"1\", 0], \"positive\": [\"2\", 0], \"negative\": [\"3\", 0], \"latent_image\": [\"4\", 0], \"seed\": 42, \"steps\": 20, \"cfg\": 7.0, \"sampler_name\": \"euler\", \"scheduler\": \"normal\", \"denoise\": 1.0}},\n\
             \x20 \"6\": {\"class_type\": \"VAEDecode\", \"inputs\": {\"samples\": [\"5\", 0], \"vae\": [\"1\", 2]}},\n\
             \x20 \"7\": {\"class_type\": \"SaveImage\", \"inputs\": {\"images\": [\"6\", 0], \"filename_prefix\": \"output\"}}\n\
             }\n\n\
             ## CRITICAL: When to Stop Calling Tools\n\n\
             After queue_prompt succeeds, you MUST immediately give a final text response:\n\
             - Tell the user the workflow was submitted\n\
             - Mention the prompt_id so they can track it\n\
             - Describe what the workflow will produce\n\
             - Do NOT call any more tools after queue_prompt succeeds\n\n\
             Other stopping conditions:\n\
             - After answering a question with text, just respond\n\
             - If you're unsure what to do next, ask the user\n\
             - After 5 tool calls, summarize what you've done and respond\n\n\
             NEVER call tools endlessly. Your goal is to help the user, \
             not to keep calling tools.",
        ),
        ContextSection::new(
            "rules",
            SectionCategory::Rules,
            "## Rules\n\n\
             - Always search_nodes and get_node_detail before using a node type you're unsure about\n\
             - Always validate_workflow before queue_prompt\n\
             - Use the actual model names from list_models, not guessed names\n\
             - Node connections: [node_id_string, output_index_int]\n\
             - After install_custom_node, use refresh_index to update the node index\n\
             - Be efficient: combine what you know, don't call get_node_detail for every single node",
        ),
        ContextSection::new(
            "error_handling",
            SectionCategory::ErrorHandling,
            "## Error Handling\n\n\
             - If a tool call fails, analyze the error and try a DIFFERENT approach \
             — do NOT repeat the same call\n\
             - If validate_workflow fails, fix the specific error mentioned, then re-validate ONCE\n\
             - If queue_prompt fails, explain the error to the user and ask if they want to retry\n\
             - Never call the same tool more than 3 times in a row \
             — if stuck, explain the situation to the user\n\
             - When an execution error occurs, check get_history for details before attempting fixes",
        ),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    fn builder_with_defaults() -> PromptBuilder {
        let builder = PromptBuilder::new(12_000);
        for section in default_sections() {
            builder.register_section(section);
        }
        builder
    }

    fn snapshot() -> EnvironmentSnapshot {
        EnvironmentSnapshot {
            connection_ok: true,
            backend_version: "0.3.26".into(),
            gpu_name: "RTX 4090".into(),
            ..Default::default()
        }
    }

    #[test]
    fn sections_render_in_category_order() {
        let builder = builder_with_defaults();
        let prompt = builder.build(None, Some(&snapshot()), "## Canvas (7 nodes)");

        let identity_pos = prompt.find("graph-workflow assistant").unwrap();
        let env_pos = prompt.find("## Environment").unwrap();
        let canvas_pos = prompt.find("## Canvas").unwrap();
        let strategy_pos = prompt.find("## Workflow Building Strategy").unwrap();
        let rules_pos = prompt.find("## Rules").unwrap();
        let errors_pos = prompt.find("## Error Handling").unwrap();

        assert!(identity_pos < env_pos);
        assert!(env_pos < canvas_pos); // priority tiebreak within Environment
        assert!(canvas_pos < strategy_pos);
        assert!(strategy_pos < rules_pos);
        assert!(rules_pos < errors_pos);
    }

    #[test]
    fn intent_filter_keeps_always_include() {
        let builder = builder_with_defaults();
        let intent = IntentResult {
            topics: vec!["chat".into()],
            environment_needed: false,
            suggested_sections: vec![],
            knowledge_tags: vec![],
        };
        let prompt = builder.build(Some(&intent), Some(&snapshot()), "");

        // identity / workflow_strategy / rules survive an empty suggestion set.
        assert!(prompt.contains("graph-workflow assistant"));
        assert!(prompt.contains("## Workflow Building Strategy"));
        assert!(prompt.contains("## Rules"));
        // tool_reference and error_handling were not suggested.
        assert!(!prompt.contains("## Workflow API Format"));
        assert!(!prompt.contains("## Error Handling"));
        // environment_needed=false drops injected environment sections.
        assert!(!prompt.contains("## Environment"));
    }

    #[test]
    fn suggested_sections_match_by_category_value() {
        let builder = builder_with_defaults();
        let intent = IntentResult {
            topics: vec![],
            environment_needed: true,
            suggested_sections: vec!["error_handling".into()],
            knowledge_tags: vec![],
        };
        let prompt = builder.build(Some(&intent), None, "");
        assert!(prompt.contains("## Error Handling"));
        assert!(!prompt.contains("## Workflow API Format"));
    }

    #[test]
    fn knowledge_sections_filtered_by_tags() {
        let builder = PromptBuilder::new(12_000);
        builder.register_section(ContextSection::new(
            "knowledge_upscaling",
            SectionCategory::Knowledge,
            "Upscaling lore.",
        ));
        builder.register_section(ContextSection::new(
            "knowledge_controlnet",
            SectionCategory::Knowledge,
            "ControlNet lore.",
        ));

        let intent = IntentResult {
            topics: vec![],
            environment_needed: false,
            suggested_sections: vec![],
            knowledge_tags: vec!["upscaling".into()],
        };
        let prompt = builder.build(Some(&intent), None, "");
        assert!(prompt.contains("Upscaling lore."));
        assert!(!prompt.contains("ControlNet lore."));

        // No tags → all knowledge present.
        let intent_no_tags = IntentResult {
            knowledge_tags: vec![],
            ..intent
        };
        let prompt = builder.build(Some(&intent_no_tags), None, "");
        assert!(prompt.contains("ControlNet lore."));
    }

    #[test]
    fn experience_always_present() {
        let builder = PromptBuilder::new(12_000);
        builder.register_section(ContextSection::new(
            "experience_validation-recovery",
            SectionCategory::Experience,
            "Feature: Workflow Validation Recovery",
        ));
        let intent = IntentResult {
            topics: vec![],
            environment_needed: false,
            suggested_sections: vec![],
            knowledge_tags: vec![],
        };
        let prompt = builder.build(Some(&intent), None, "");
        assert!(prompt.contains("Validation Recovery"));
    }

    #[test]
    fn budget_drops_but_keeps_walking() {
        let builder = PromptBuilder::new(30);
        builder.register_section(ContextSection::new(
            "identity",
            SectionCategory::Identity,
            "short",
        ));
        builder.register_section(ContextSection::new(
            "big_knowledge",
            SectionCategory::Knowledge,
            "k".repeat(4000),
        ));
        builder.register_section(
            ContextSection::new("rules", SectionCategory::Rules, "tiny rules"),
        );

        let prompt = builder.build(None, None, "");
        assert!(prompt.contains("short"));
        assert!(prompt.contains("tiny rules"));
        assert!(!prompt.contains("kkkk"));
    }

    #[test]
    fn empty_output_falls_back() {
        let builder = PromptBuilder::new(12_000);
        assert_eq!(builder.build(None, None, ""), FALLBACK_PROMPT);
    }

    #[test]
    fn registration_replaces_by_name() {
        let builder = PromptBuilder::new(12_000);
        builder.register_section(ContextSection::new(
            "identity",
            SectionCategory::Identity,
            "old identity",
        ));
        builder.register_section(ContextSection::new(
            "identity",
            SectionCategory::Identity,
            "new identity",
        ));
        let prompt = builder.build(None, None, "");
        assert!(prompt.contains("new identity"));
        assert!(!prompt.contains("old identity"));
    }

    #[test]
    fn environment_injection_replaces_previous() {
        let builder = PromptBuilder::new(12_000);
        let snap1 = snapshot();
        let _ = builder.build(None, Some(&snap1), "");

        let mut snap2 = snapshot();
        snap2.backend_version = "0.4.0".into();
        let prompt = builder.build(None, Some(&snap2), "");
        assert!(prompt.contains("v0.4.0"));
        assert!(!prompt.contains("v0.3.26"));
    }
}
