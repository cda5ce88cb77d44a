//! Prompt-context models: sections, environment snapshots, intent
//! analysis results, and identity features.

use serde::{Deserialize, Serialize};

/// Ordered categories for system prompt sections. The declaration order
/// is the render order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SectionCategory {
    Identity,
    Knowledge,
    Experience,
    Environment,
    WorkflowStrategy,
    ToolReference,
    Rules,
    ErrorHandling,
}

impl SectionCategory {
    pub const ALL: [SectionCategory; 8] = [
        SectionCategory::Identity,
        SectionCategory::Knowledge,
        SectionCategory::Experience,
        SectionCategory::Environment,
        SectionCategory::WorkflowStrategy,
        SectionCategory::ToolReference,
        SectionCategory::Rules,
        SectionCategory::ErrorHandling,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            SectionCategory::Identity => "identity",
            SectionCategory::Knowledge => "knowledge",
            SectionCategory::Experience => "experience",
            SectionCategory::Environment => "environment",
            SectionCategory::WorkflowStrategy => "workflow_strategy",
            SectionCategory::ToolReference => "tool_reference",
            SectionCategory::Rules => "rules",
            SectionCategory::ErrorHandling => "error_handling",
        }
    }

    /// Index into the fixed render order.
    pub fn rank(&self) -> usize {
        Self::ALL.iter().position(|c| c == self).unwrap_or(usize::MAX)
    }
}

/// An independent block within the system prompt.
#[derive(Debug, Clone)]
pub struct ContextSection {
    pub name: String,
    pub category: SectionCategory,
    pub content: String,
    /// Tie-breaker within a category; lower renders first.
    pub priority: i32,
    /// Lazily computed when zero.
    pub token_estimate: usize,
}

impl ContextSection {
    pub fn new(
        name: impl Into<String>,
        category: SectionCategory,
        content: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            category,
            content: content.into(),
            priority: 0,
            token_estimate: 0,
        }
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }
}

/// Point-in-time snapshot of the graph execution backend.
#[derive(Debug, Clone, Default, Serialize)]
pub struct EnvironmentSnapshot {
    pub connection_ok: bool,
    pub backend_version: String,
    pub gpu_name: String,
    pub vram_total_mb: f64,
    pub vram_free_mb: f64,
    pub checkpoint_models: Vec<String>,
    pub queue_running: usize,
    pub queue_pending: usize,
    pub node_count: usize,
    pub node_categories: Vec<String>,
    /// Seconds since the Unix epoch at collection time.
    pub collected_at: f64,
    pub errors: Vec<String>,
}

impl EnvironmentSnapshot {
    /// Render as human-readable text for system prompt injection.
    pub fn to_prompt_text(&self) -> String {
        let mut lines = vec!["## Environment".to_owned()];
        if !self.connection_ok {
            lines.push("⚠ Graph backend is NOT connected".to_owned());
            if !self.errors.is_empty() {
                lines.push(format!("Errors: {}", self.errors.join(", ")));
            }
            return lines.join("\n");
        }

        lines.push(format!("- Backend: v{}", self.backend_version));
        lines.push(format!("- GPU: {}", self.gpu_name));
        lines.push(format!(
            "- VRAM: {:.0}MB free / {:.0}MB total",
            self.vram_free_mb, self.vram_total_mb
        ));
        let checkpoints = if self.checkpoint_models.is_empty() {
            "none".to_owned()
        } else {
            self.checkpoint_models.join(", ")
        };
        lines.push(format!("- Checkpoints: {checkpoints}"));
        lines.push(format!(
            "- Queue: {} running, {} pending",
            self.queue_running, self.queue_pending
        ));
        lines.push(format!(
            "- Nodes: {} types in {} categories",
            self.node_count,
            self.node_categories.len()
        ));
        if !self.errors.is_empty() {
            lines.push(format!("- Probe errors: {}", self.errors.join(", ")));
        }
        lines.join("\n")
    }
}

/// Result of lightweight intent pre-analysis.
#[derive(Debug, Clone, Serialize)]
pub struct IntentResult {
    pub topics: Vec<String>,
    pub environment_needed: bool,
    pub suggested_sections: Vec<String>,
    pub knowledge_tags: Vec<String>,
}

impl Default for IntentResult {
    /// Fail-open default: include everything.
    fn default() -> Self {
        Self {
            topics: vec!["general".to_owned()],
            environment_needed: true,
            suggested_sections: SectionCategory::ALL
                .iter()
                .filter(|c| **c != SectionCategory::Identity)
                .map(|c| c.as_str().to_owned())
                .collect(),
            knowledge_tags: Vec::new(),
        }
    }
}

/// Identity feature kinds recognized in the RoleX directory layout.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdentityKind {
    Persona,
    Knowledge,
    Experience,
    Voice,
}

/// A parsed identity feature file (Gherkin source preserved verbatim).
#[derive(Debug, Clone)]
pub struct IdentityFeature {
    pub kind: IdentityKind,
    pub name: String,
    pub content: String,
    pub source_file: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn category_order_is_fixed() {
        assert_eq!(SectionCategory::Identity.rank(), 0);
        assert_eq!(SectionCategory::ErrorHandling.rank(), 7);
        assert!(SectionCategory::Knowledge.rank() < SectionCategory::Environment.rank());
        assert!(SectionCategory::WorkflowStrategy.rank() < SectionCategory::Rules.rank());
    }

    #[test]
    fn snapshot_disconnected_renders_warning() {
        let snap = EnvironmentSnapshot {
            connection_ok: false,
            errors: vec!["health_check: connection refused".into()],
            ..Default::default()
        };
        let text = snap.to_prompt_text();
        assert!(text.contains("NOT connected"));
        assert!(text.contains("connection refused"));
        assert!(!text.contains("VRAM"));
    }

    #[test]
    fn snapshot_connected_renders_fixed_line_set() {
        let snap = EnvironmentSnapshot {
            connection_ok: true,
            backend_version: "0.3.26".into(),
            gpu_name: "NVIDIA RTX 4090".into(),
            vram_total_mb: 24_000.0,
            vram_free_mb: 18_000.0,
            checkpoint_models: vec!["sdxl.safetensors".into()],
            queue_running: 1,
            queue_pending: 2,
            node_count: 120,
            node_categories: vec!["loaders".into(), "sampling".into()],
            ..Default::default()
        };
        let text = snap.to_prompt_text();
        assert!(text.contains("v0.3.26"));
        assert!(text.contains("18000MB free / 24000MB total"));
        assert!(text.contains("sdxl.safetensors"));
        assert!(text.contains("1 running, 2 pending"));
        assert!(text.contains("120 types in 2 categories"));
    }

    #[test]
    fn snapshot_empty_checkpoints_say_none() {
        let snap = EnvironmentSnapshot {
            connection_ok: true,
            ..Default::default()
        };
        assert!(snap.to_prompt_text().contains("Checkpoints: none"));
    }

    #[test]
    fn default_intent_includes_everything() {
        let intent = IntentResult::default();
        assert!(intent.environment_needed);
        assert!(intent
            .suggested_sections
            .contains(&"workflow_strategy".to_owned()));
        assert!(!intent.suggested_sections.contains(&"identity".to_owned()));
        assert!(intent.knowledge_tags.is_empty());
    }
}
