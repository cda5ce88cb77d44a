//! Canvas tracker — remembers the most recently submitted workflow.
//!
//! Listens for `workflow.submitted` and keeps a compact text summary
//! (node types, checkpoint, positive prompt, dimensions) for prompt
//! injection, so the LLM knows what is already on the canvas.

use std::sync::Arc;

use parking_lot::Mutex;
use serde_json::Value;

use gp_domain::bus::{handler, EventBus, Subscription};
use gp_domain::events::EventType;

const EMPTY_CANVAS: &str = "Canvas is empty — no workflow has been submitted yet.";

/// Tracks the latest workflow on the backend canvas.
#[derive(Default)]
pub struct CanvasTracker {
    summary: Mutex<String>,
    prompt_id: Mutex<String>,
}

impl CanvasTracker {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Subscribe to `workflow.submitted` on the bus.
    pub fn attach(self: &Arc<Self>, bus: &Arc<EventBus>) -> Subscription {
        let tracker = self.clone();
        bus.on(
            EventType::WorkflowSubmitted,
            handler(move |event| {
                let tracker = tracker.clone();
                async move {
                    tracker.on_workflow_submitted(&event.data);
                    Ok(())
                }
            }),
        )
    }

    /// The current canvas summary for prompt injection.
    pub fn summary(&self) -> String {
        let summary = self.summary.lock();
        if summary.is_empty() {
            EMPTY_CANVAS.to_owned()
        } else {
            summary.clone()
        }
    }

    pub fn prompt_id(&self) -> String {
        self.prompt_id.lock().clone()
    }

    fn on_workflow_submitted(&self, data: &Value) {
        let Some(workflow) = data.get("workflow").filter(|w| w.is_object()) else {
            tracing::warn!("workflow.submitted missing valid workflow data");
            return;
        };
        *self.prompt_id.lock() = data
            .get("prompt_id")
            .and_then(|v| v.as_str())
            .unwrap_or("")
            .to_owned();
        *self.summary.lock() = build_summary(workflow);
    }
}

/// Build a concise text summary from a workflow document.
fn build_summary(workflow: &Value) -> String {
    let Some(nodes) = workflow.as_object() else {
        return String::new();
    };
    if nodes.is_empty() {
        return String::new();
    }

    let mut class_types: Vec<&str> = Vec::new();
    let mut checkpoint = "";
    let mut prompt_text = "";
    let mut width = 0u64;
    let mut height = 0u64;

    for node in nodes.values() {
        let class_type = node.get("class_type").and_then(|v| v.as_str()).unwrap_or("");
        if !class_type.is_empty() {
            class_types.push(class_type);
        }
        let inputs = node.get("inputs");
        match class_type {
            "CheckpointLoaderSimple" => {
                checkpoint = inputs
                    .and_then(|i| i.get("ckpt_name"))
                    .and_then(|v| v.as_str())
                    .unwrap_or("");
            }
            // First text encoder is the positive prompt by convention.
            "CLIPTextEncode" if prompt_text.is_empty() => {
                prompt_text = inputs
                    .and_then(|i| i.get("text"))
                    .and_then(|v| v.as_str())
                    .unwrap_or("");
            }
            "EmptyLatentImage" => {
                width = inputs
                    .and_then(|i| i.get("width"))
                    .and_then(|v| v.as_u64())
                    .unwrap_or(0);
                height = inputs
                    .and_then(|i| i.get("height"))
                    .and_then(|v| v.as_u64())
                    .unwrap_or(0);
            }
            _ => {}
        }
    }

    let mut lines = vec![format!("## Canvas ({} nodes)", nodes.len())];
    lines.push(format!("- Node types: {}", class_types.join(", ")));
    if !checkpoint.is_empty() {
        lines.push(format!("- Checkpoint: {checkpoint}"));
    }
    if !prompt_text.is_empty() {
        let preview = if prompt_text.len() > 80 {
            let mut end = 80;
            while !prompt_text.is_char_boundary(end) {
                end -= 1;
            }
            format!("{}...", &prompt_text[..end])
        } else {
            prompt_text.to_owned()
        };
        lines.push(format!("- Prompt: {preview}"));
    }
    if width > 0 && height > 0 {
        lines.push(format!("- Size: {width}×{height}"));
    }
    lines.join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use gp_domain::events::Event;
    use serde_json::json;

    fn txt2img_workflow() -> Value {
        json!({
            "1": { "class_type": "CheckpointLoaderSimple", "inputs": { "ckpt_name": "sdxl.safetensors" } },
            "2": { "class_type": "CLIPTextEncode", "inputs": { "text": "a watercolor fox" } },
            "3": { "class_type": "CLIPTextEncode", "inputs": { "text": "bad quality" } },
            "4": { "class_type": "EmptyLatentImage", "inputs": { "width": 1024, "height": 768 } },
            "5": { "class_type": "KSampler", "inputs": {} }
        })
    }

    #[test]
    fn empty_canvas_has_fixed_text() {
        let tracker = CanvasTracker::new();
        assert_eq!(
            tracker.summary(),
            "Canvas is empty — no workflow has been submitted yet."
        );
    }

    #[tokio::test]
    async fn submission_builds_summary() {
        let bus = Arc::new(EventBus::new());
        let tracker = CanvasTracker::new();
        let _sub = tracker.attach(&bus);

        bus.emit(Event::with_data(
            EventType::WorkflowSubmitted,
            json!({ "workflow": txt2img_workflow(), "prompt_id": "p-123" }),
        ))
        .await;

        let summary = tracker.summary();
        assert!(summary.contains("## Canvas (5 nodes)"));
        assert!(summary.contains("CheckpointLoaderSimple"));
        assert!(summary.contains("- Checkpoint: sdxl.safetensors"));
        assert!(summary.contains("- Prompt: a watercolor fox"));
        assert!(summary.contains("- Size: 1024×768"));
        assert_eq!(tracker.prompt_id(), "p-123");
    }

    #[tokio::test]
    async fn invalid_payload_keeps_previous_summary() {
        let bus = Arc::new(EventBus::new());
        let tracker = CanvasTracker::new();
        let _sub = tracker.attach(&bus);

        bus.emit(Event::with_data(
            EventType::WorkflowSubmitted,
            json!({ "workflow": txt2img_workflow(), "prompt_id": "p-1" }),
        ))
        .await;
        bus.emit(Event::with_data(
            EventType::WorkflowSubmitted,
            json!({ "prompt_id": "p-2" }),
        ))
        .await;

        assert!(tracker.summary().contains("## Canvas"));
        assert_eq!(tracker.prompt_id(), "p-1");
    }

    #[test]
    fn long_prompt_is_previewed() {
        let workflow = json!({
            "1": { "class_type": "CLIPTextEncode", "inputs": { "text": "x".repeat(200) } }
        });
        let summary = build_summary(&workflow);
        assert!(summary.contains("..."));
        assert!(!summary.contains(&"x".repeat(100)));
    }
}
