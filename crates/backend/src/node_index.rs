//! In-memory index of the backend's node registry.
//!
//! Built once at startup from `/api/object_info`, then queried by the
//! discovery tools. Keeps the full registry out of the LLM context:
//! tools return condensed, ranked text instead of raw JSON.

use std::collections::{BTreeMap, HashMap};

use parking_lot::RwLock;
use serde_json::Value;

use crate::client::GraphClient;
use gp_domain::error::Result;

#[derive(Default)]
struct Inner {
    /// class_name → raw node info
    nodes: HashMap<String, Value>,
    /// category → class names
    by_category: BTreeMap<String, Vec<String>>,
    /// class_name → lowercased searchable text
    search_corpus: HashMap<String, String>,
    built: bool,
}

/// Searchable node registry index.
#[derive(Default)]
pub struct NodeIndex {
    inner: RwLock<Inner>,
}

impl NodeIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_built(&self) -> bool {
        self.inner.read().built
    }

    pub fn node_count(&self) -> usize {
        self.inner.read().nodes.len()
    }

    pub fn categories(&self) -> Vec<String> {
        self.inner.read().by_category.keys().cloned().collect()
    }

    /// Fetch the full registry from the backend and rebuild the index.
    pub async fn build(&self, client: &GraphClient) -> Result<()> {
        let all_info = client.get_object_info(None).await?;
        self.install(all_info);
        Ok(())
    }

    /// Rebuild the index from a raw `object_info` document.
    pub fn install(&self, all_info: Value) {
        let Some(map) = all_info.as_object() else {
            tracing::warn!("object_info was not an object; index not built");
            return;
        };

        let mut inner = self.inner.write();
        inner.nodes.clear();
        inner.by_category.clear();
        inner.search_corpus.clear();

        for (class_name, info) in map {
            let category = info
                .get("category")
                .and_then(|v| v.as_str())
                .unwrap_or("uncategorized")
                .to_owned();
            inner
                .by_category
                .entry(category.clone())
                .or_default()
                .push(class_name.clone());

            let display = info
                .get("display_name")
                .and_then(|v| v.as_str())
                .unwrap_or(class_name.as_str());
            let desc = info
                .get("description")
                .and_then(|v| v.as_str())
                .unwrap_or("");
            inner.search_corpus.insert(
                class_name.clone(),
                format!("{class_name} {display} {category} {desc}").to_lowercase(),
            );
            inner.nodes.insert(class_name.clone(), info.clone());
        }

        inner.built = true;
        tracing::info!(
            nodes = inner.nodes.len(),
            categories = inner.by_category.len(),
            "node index built"
        );
    }

    // ── Queries (condensed text for tool output) ───────────────────

    pub fn list_categories(&self) -> String {
        let inner = self.inner.read();
        if !inner.built {
            return "Node index not built yet. The backend may not be connected.".into();
        }
        let mut lines = vec![format!("Node categories ({}):", inner.by_category.len())];
        for (cat, nodes) in &inner.by_category {
            lines.push(format!("  [{cat}] ({} nodes)", nodes.len()));
        }
        lines.join("\n")
    }

    pub fn list_category(&self, category: &str) -> String {
        let inner = self.inner.read();
        if !inner.built {
            return "Node index not built yet.".into();
        }

        let matched = inner
            .by_category
            .keys()
            .find(|c| c.eq_ignore_ascii_case(category))
            .or_else(|| {
                inner
                    .by_category
                    .keys()
                    .find(|c| c.to_lowercase().contains(&category.to_lowercase()))
            })
            .cloned();

        let Some(matched) = matched else {
            return format!("Category '{category}' not found. Use search_nodes to find nodes.");
        };

        let mut names = inner.by_category[&matched].clone();
        names.sort();
        let mut lines = vec![format!("Nodes in [{matched}] ({}):", names.len())];
        for name in names {
            let display = inner.nodes[&name]
                .get("display_name")
                .and_then(|v| v.as_str())
                .unwrap_or(name.as_str())
                .to_owned();
            lines.push(format!("  - {name} ({display})"));
        }
        lines.join("\n")
    }

    /// Keyword search over name, display name, category, and description.
    pub fn search(&self, query: &str, limit: usize) -> String {
        let inner = self.inner.read();
        if !inner.built {
            return "Node index not built yet.".into();
        }

        let query_lower = query.to_lowercase();
        let terms: Vec<&str> = query_lower.split_whitespace().collect();

        let mut scored: Vec<(i32, &String)> = Vec::new();
        for (class_name, corpus) in &inner.search_corpus {
            let mut score = 0;
            for term in &terms {
                if corpus.contains(term) {
                    score += 1;
                }
                // Exact class-name hits rank first.
                if class_name.to_lowercase().contains(term) {
                    score += 2;
                }
            }
            if score > 0 {
                scored.push((score, class_name));
            }
        }

        scored.sort_by(|a, b| b.0.cmp(&a.0).then_with(|| a.1.cmp(b.1)));

        if scored.is_empty() {
            return format!("No nodes found matching '{query}'.");
        }

        let total = scored.len();
        let shown = total.min(limit);
        let mut lines = vec![format!(
            "Search results for '{query}' ({total} matches, showing {shown}):"
        )];
        for (_, name) in scored.iter().take(limit) {
            let info = &inner.nodes[*name];
            let display = info
                .get("display_name")
                .and_then(|v| v.as_str())
                .unwrap_or(name.as_str());
            let category = info.get("category").and_then(|v| v.as_str()).unwrap_or("");
            lines.push(format!("  - {name} [{category}] ({display})"));
        }
        if total > limit {
            lines.push(format!(
                "  ... {} more results. Refine your search.",
                total - limit
            ));
        }
        lines.join("\n")
    }

    /// Condensed detail for one node type.
    pub fn get_detail(&self, class_name: &str) -> String {
        let inner = self.inner.read();
        if !inner.built {
            return "Node index not built yet.".into();
        }

        let resolved = if inner.nodes.contains_key(class_name) {
            Some(class_name.to_owned())
        } else {
            inner
                .nodes
                .keys()
                .find(|n| n.eq_ignore_ascii_case(class_name))
                .cloned()
        };
        let Some(name) = resolved else {
            return format!("Node '{class_name}' not found.");
        };
        let info = &inner.nodes[&name];

        let mut lines = vec![format!("Node: {name}")];
        lines.push(format!(
            "  Display: {}",
            info.get("display_name")
                .and_then(|v| v.as_str())
                .unwrap_or(name.as_str())
        ));
        lines.push(format!(
            "  Category: {}",
            info.get("category").and_then(|v| v.as_str()).unwrap_or("unknown")
        ));
        if let Some(desc) = info.get("description").and_then(|v| v.as_str()) {
            if !desc.is_empty() {
                lines.push(format!("  Description: {desc}"));
            }
        }

        for (label, key) in [("Required inputs", "required"), ("Optional inputs", "optional")] {
            if let Some(params) = info.get("input").and_then(|i| i.get(key)).and_then(|v| v.as_object()) {
                if !params.is_empty() {
                    lines.push(format!("  {label}:"));
                    for (param, spec) in params {
                        lines.push(format!("    {param}: {}", format_param(spec)));
                    }
                }
            }
        }

        if let Some(output_types) = info.get("output").and_then(|v| v.as_array()) {
            if !output_types.is_empty() {
                let output_names = info
                    .get("output_name")
                    .and_then(|v| v.as_array())
                    .cloned()
                    .unwrap_or_default();
                lines.push("  Outputs:".into());
                for (i, otype) in output_types.iter().enumerate() {
                    let oname = output_names
                        .get(i)
                        .and_then(|v| v.as_str())
                        .map(str::to_owned)
                        .unwrap_or_else(|| format!("output_{i}"));
                    lines.push(format!(
                        "    [{i}] {oname}: {}",
                        otype.as_str().unwrap_or("?")
                    ));
                }
            }
        }

        lines.join("\n")
    }

    /// For a data type, which nodes produce it and which consume it.
    /// Without a type, a summary of all connection types.
    pub fn get_connectable(&self, output_type: Option<&str>) -> String {
        let inner = self.inner.read();
        if !inner.built {
            return "Node index not built yet.".into();
        }

        let Some(wanted) = output_type else {
            // Summary: every output type with its producer count.
            let mut counts: BTreeMap<String, usize> = BTreeMap::new();
            for info in inner.nodes.values() {
                if let Some(outputs) = info.get("output").and_then(|v| v.as_array()) {
                    for otype in outputs.iter().filter_map(|v| v.as_str()) {
                        *counts.entry(otype.to_owned()).or_default() += 1;
                    }
                }
            }
            let mut lines = vec![format!("Connection types ({}):", counts.len())];
            for (otype, count) in counts {
                lines.push(format!("  {otype}: {count} producers"));
            }
            return lines.join("\n");
        };

        let mut producers: Vec<&String> = Vec::new();
        let mut consumers: Vec<&String> = Vec::new();

        for (name, info) in &inner.nodes {
            if let Some(outputs) = info.get("output").and_then(|v| v.as_array()) {
                if outputs.iter().filter_map(|v| v.as_str()).any(|t| t == wanted) {
                    producers.push(name);
                }
            }
            let consumes = ["required", "optional"].iter().any(|key| {
                info.get("input")
                    .and_then(|i| i.get(key))
                    .and_then(|v| v.as_object())
                    .is_some_and(|params| {
                        params.values().any(|spec| {
                            spec.get(0).and_then(|v| v.as_str()) == Some(wanted)
                        })
                    })
            });
            if consumes {
                consumers.push(name);
            }
        }

        producers.sort();
        consumers.sort();

        let mut lines = vec![format!("Type {wanted}:")];
        lines.push(format!("  Produced by ({}):", producers.len()));
        for name in producers.iter().take(15) {
            lines.push(format!("    - {name}"));
        }
        if producers.len() > 15 {
            lines.push(format!("    ... {} more", producers.len() - 15));
        }
        lines.push(format!("  Consumed by ({}):", consumers.len()));
        for name in consumers.iter().take(15) {
            lines.push(format!("    - {name}"));
        }
        if consumers.len() > 15 {
            lines.push(format!("    ... {} more", consumers.len() - 15));
        }
        lines.join("\n")
    }

    /// Check a workflow for unknown node types, missing required inputs,
    /// and unrecognized inputs.
    pub fn validate_workflow(&self, workflow: &Value) -> String {
        let inner = self.inner.read();
        if !inner.built {
            return "Node index not built yet. Cannot validate.".into();
        }
        let Some(nodes) = workflow.as_object() else {
            return "Workflow must be an object of node_id -> {class_type, inputs}.".into();
        };

        let mut errors: Vec<String> = Vec::new();
        let mut warnings: Vec<String> = Vec::new();

        for (node_id, node_config) in nodes {
            let class_type = node_config
                .get("class_type")
                .and_then(|v| v.as_str())
                .unwrap_or("");
            if class_type.is_empty() {
                errors.push(format!("Node {node_id}: missing class_type"));
                continue;
            }
            let Some(node_info) = inner.nodes.get(class_type) else {
                errors.push(format!("Node {node_id}: unknown class_type '{class_type}'"));
                continue;
            };

            let empty = serde_json::Map::new();
            let required = node_info
                .get("input")
                .and_then(|i| i.get("required"))
                .and_then(|v| v.as_object())
                .unwrap_or(&empty);
            let optional = node_info
                .get("input")
                .and_then(|i| i.get("optional"))
                .and_then(|v| v.as_object())
                .unwrap_or(&empty);
            let provided = node_config
                .get("inputs")
                .and_then(|v| v.as_object())
                .unwrap_or(&empty);

            for param in required.keys() {
                if !provided.contains_key(param) {
                    errors.push(format!(
                        "Node {node_id} ({class_type}): missing required input '{param}'"
                    ));
                }
            }
            for param in provided.keys() {
                if !required.contains_key(param) && !optional.contains_key(param) {
                    warnings.push(format!(
                        "Node {node_id} ({class_type}): unknown input '{param}'"
                    ));
                }
            }
        }

        if errors.is_empty() && warnings.is_empty() {
            return format!("Workflow valid: {} nodes, all checks passed.", nodes.len());
        }

        let mut lines = Vec::new();
        if !errors.is_empty() {
            lines.push(format!("Errors ({}):", errors.len()));
            for e in &errors {
                lines.push(format!("  ✗ {e}"));
            }
        }
        if !warnings.is_empty() {
            lines.push(format!("Warnings ({}):", warnings.len()));
            for w in &warnings {
                lines.push(format!("  ⚠ {w}"));
            }
        }
        lines.join("\n")
    }
}

/// Render a parameter spec (`[type_or_options, constraints?]`) concisely.
fn format_param(spec: &Value) -> String {
    let Some(arr) = spec.as_array() else {
        return spec.to_string();
    };
    let Some(type_info) = arr.first() else {
        return spec.to_string();
    };

    if let Some(options) = type_info.as_array() {
        let rendered: Vec<String> = options
            .iter()
            .take(5)
            .map(|v| v.as_str().map(str::to_owned).unwrap_or_else(|| v.to_string()))
            .collect();
        if options.len() <= 5 {
            return format!("enum[{}]", rendered.join(", "));
        }
        return format!(
            "enum[{}, ... ({} options)]",
            rendered[..3].join(", "),
            options.len()
        );
    }

    if let Some(type_name) = type_info.as_str() {
        let mut parts = vec![type_name.to_owned()];
        if let Some(constraints) = arr.get(1).and_then(|v| v.as_object()) {
            for key in ["default", "min", "max"] {
                if let Some(v) = constraints.get(key) {
                    parts.push(format!("{key}={v}"));
                }
            }
        }
        return parts.join(" ");
    }

    spec.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sample_registry() -> Value {
        json!({
            "CheckpointLoaderSimple": {
                "display_name": "Load Checkpoint",
                "category": "loaders",
                "description": "Loads a model checkpoint.",
                "input": { "required": { "ckpt_name": [["sdxl.safetensors", "dream.safetensors"]] } },
                "output": ["MODEL", "CLIP", "VAE"],
                "output_name": ["MODEL", "CLIP", "VAE"]
            },
            "KSampler": {
                "display_name": "KSampler",
                "category": "sampling",
                "input": {
                    "required": {
                        "model": ["MODEL"],
                        "seed": ["INT", {"default": 0, "min": 0}],
                        "steps": ["INT", {"default": 20, "min": 1, "max": 10000}],
                        "latent_image": ["LATENT"]
                    }
                },
                "output": ["LATENT"],
                "output_name": ["LATENT"]
            },
            "EmptyLatentImage": {
                "display_name": "Empty Latent Image",
                "category": "latent",
                "input": { "required": { "width": ["INT", {"default": 512}], "height": ["INT", {"default": 512}] } },
                "output": ["LATENT"],
                "output_name": ["LATENT"]
            }
        })
    }

    fn index() -> NodeIndex {
        let idx = NodeIndex::new();
        idx.install(sample_registry());
        idx
    }

    #[test]
    fn install_builds_index() {
        let idx = index();
        assert!(idx.is_built());
        assert_eq!(idx.node_count(), 3);
        assert_eq!(idx.categories(), vec!["latent", "loaders", "sampling"]);
    }

    #[test]
    fn unbuilt_index_reports_itself() {
        let idx = NodeIndex::new();
        assert!(idx.search("sampler", 10).contains("not built"));
        assert!(idx.validate_workflow(&json!({})).contains("not built"));
    }

    #[test]
    fn search_ranks_class_name_hits_first() {
        let idx = index();
        let result = idx.search("latent", 10);
        let first_hit = result.lines().nth(1).unwrap();
        assert!(first_hit.contains("EmptyLatentImage"), "got: {first_hit}");
        assert!(result.contains("KSampler"));
    }

    #[test]
    fn search_no_match() {
        let idx = index();
        assert!(idx.search("controlnet", 10).contains("No nodes found"));
    }

    #[test]
    fn category_browse_is_fuzzy() {
        let idx = index();
        assert!(idx.list_category("LOADERS").contains("CheckpointLoaderSimple"));
        assert!(idx.list_category("samp").contains("KSampler"));
        assert!(idx.list_category("nonexistent").contains("not found"));
    }

    #[test]
    fn detail_renders_inputs_and_outputs() {
        let idx = index();
        let detail = idx.get_detail("KSampler");
        assert!(detail.contains("model: MODEL"));
        assert!(detail.contains("steps: INT default=20 min=1 max=10000"));
        assert!(detail.contains("[0] LATENT: LATENT"));
    }

    #[test]
    fn detail_is_case_insensitive() {
        let idx = index();
        assert!(idx.get_detail("ksampler").contains("Node: KSampler"));
        assert!(idx.get_detail("NoSuchNode").contains("not found"));
    }

    #[test]
    fn connectable_lists_producers_and_consumers() {
        let idx = index();
        let result = idx.get_connectable(Some("LATENT"));
        assert!(result.contains("KSampler"));
        assert!(result.contains("EmptyLatentImage"));
        assert!(result.contains("Produced by (2)"));
        assert!(result.contains("Consumed by (1)"));
    }

    #[test]
    fn connectable_summary_without_type() {
        let idx = index();
        let result = idx.get_connectable(None);
        assert!(result.contains("MODEL: 1 producers"));
        assert!(result.contains("LATENT: 2 producers"));
    }

    #[test]
    fn validate_passes_good_workflow() {
        let idx = index();
        let workflow = json!({
            "1": { "class_type": "CheckpointLoaderSimple", "inputs": { "ckpt_name": "sdxl.safetensors" } },
            "2": { "class_type": "EmptyLatentImage", "inputs": { "width": 1024, "height": 1024 } }
        });
        let result = idx.validate_workflow(&workflow);
        assert!(result.contains("Workflow valid: 2 nodes"));
    }

    #[test]
    fn validate_flags_unknown_class_and_missing_input() {
        let idx = index();
        let workflow = json!({
            "1": { "class_type": "NoSuchNode", "inputs": {} },
            "2": { "class_type": "KSampler", "inputs": { "model": ["1", 0], "bogus": 1 } }
        });
        let result = idx.validate_workflow(&workflow);
        assert!(result.contains("unknown class_type 'NoSuchNode'"));
        assert!(result.contains("missing required input 'seed'"));
        assert!(result.contains("unknown input 'bogus'"));
    }

    #[test]
    fn enum_param_formatting() {
        let idx = index();
        let detail = idx.get_detail("CheckpointLoaderSimple");
        assert!(detail.contains("enum[sdxl.safetensors, dream.safetensors]"));
    }
}
