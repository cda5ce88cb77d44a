//! Experience synthesizer — post-turn reflection that persists learnings.
//!
//! Three layers:
//! 1. Passive: tool failure/recovery patterns tracked from events.
//! 2. Active: after a notable turn, an LLM reflection distills the
//!    conversation into a Gherkin experience feature.
//! 3. Hot-load: new experiences register into the prompt builder
//!    immediately, so the next turn already benefits.
//!
//! Trivial turns (greetings, no real work) are skipped — no wasted LLM
//! calls. Saves are rate-limited by a cooldown. Every failure here is
//! logged and swallowed; reflection never fails a turn.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde_json::Value;

use gp_domain::bus::{handler, EventBus, Subscription};
use gp_domain::context::{ContextSection, SectionCategory};
use gp_domain::events::{Event, EventType};
use gp_domain::tool::Message;
use gp_providers::{ChatRequest, LlmClient};

use crate::identity::IdentityLoader;
use crate::prompt::PromptBuilder;

/// Minimum interval between experience saves.
const SAVE_COOLDOWN: Duration = Duration::from_secs(120);

const REFLECTION_MAX_TOKENS: u32 = 2000;

const SYNTHESIZE_GUIDE: &str = "\
Transform this raw encounter into structured experience. Write your \
reflection as a Gherkin Feature file:

```gherkin
Feature: <Experience Title — what was learned>
  <Optional: one-line context about why this matters>

  Scenario: <Specific lesson or pattern discovered>
    Given <the situation or context>
    When <what happened or what action was taken>
    Then <what was learned or what the outcome was>
    And <additional insight or implication>
```

Rules:
- Feature name should be a clear, reusable lesson title
- Each Scenario captures ONE concrete learning
- Given/When/Then should be specific, not generic
- Include node names, connection types, or parameter values when relevant
- Multiple Scenarios are OK if the conversation had multiple learnings
- Focus on workflow patterns, node combinations, user preferences, or \
error recovery strategies
";

/// Per-session statistics gathered from events.
#[derive(Default, Clone)]
struct SessionStats {
    tool_count: usize,
    error_count: usize,
    tools_used: HashSet<String>,
    workflow_nodes: Vec<String>,
    workflow_submitted: bool,
    user_corrections: usize,
}

/// Detects learning opportunities and persists experiences.
pub struct ExperienceSynthesizer {
    identity: Arc<IdentityLoader>,
    role_name: String,
    llm: Option<Arc<dyn LlmClient>>,
    prompt_builder: Option<Arc<PromptBuilder>>,
    last_save: Mutex<Option<Instant>>,
    stats: Mutex<HashMap<String, SessionStats>>,
    /// session_id → last validation error, pending a recovery.
    validation_failures: Mutex<HashMap<String, String>>,
}

impl ExperienceSynthesizer {
    pub fn new(
        identity: Arc<IdentityLoader>,
        role_name: impl Into<String>,
        llm: Option<Arc<dyn LlmClient>>,
        prompt_builder: Option<Arc<PromptBuilder>>,
    ) -> Arc<Self> {
        Arc::new(Self {
            identity,
            role_name: role_name.into(),
            llm,
            prompt_builder,
            last_save: Mutex::new(None),
            stats: Mutex::new(HashMap::new()),
            validation_failures: Mutex::new(HashMap::new()),
        })
    }

    /// Subscribe to the events this synthesizer learns from.
    pub fn attach(self: &Arc<Self>, bus: &Arc<EventBus>) -> Vec<Subscription> {
        let mut subs = Vec::new();

        for (event_type, f) in [
            (
                EventType::StateToolFailed,
                Self::on_tool_failed as fn(&Self, &Event),
            ),
            (EventType::StateToolCompleted, Self::on_tool_completed),
            (EventType::WorkflowSubmitted, Self::on_workflow_submitted),
            (EventType::MessageUser, Self::on_user_message),
        ] {
            let this = self.clone();
            subs.push(bus.on(
                event_type,
                handler(move |event| {
                    let this = this.clone();
                    async move {
                        f(&this, &event);
                        Ok(())
                    }
                }),
            ));
        }

        // Reflection is async — it may call the LLM.
        let this = self.clone();
        subs.push(bus.on(
            EventType::TurnEnd,
            handler(move |event| {
                let this = this.clone();
                async move {
                    this.on_turn_end(&event).await;
                    Ok(())
                }
            }),
        ));

        subs
    }

    // ── Layer 1: passive tracking ──────────────────────────────────

    fn on_tool_failed(&self, event: &Event) {
        let sid = session_of(event);
        let tool_name = str_data(event, "tool_name");
        let error = str_data(event, "error");

        let mut stats = self.stats.lock();
        let entry = stats.entry(sid.clone()).or_default();
        entry.error_count += 1;
        entry.tools_used.insert(tool_name.clone());
        drop(stats);

        if tool_name.contains("validate") {
            let capped: String = error.chars().take(300).collect();
            self.validation_failures.lock().insert(sid, capped);
        }
    }

    fn on_tool_completed(&self, event: &Event) {
        let sid = session_of(event);
        let tool_name = str_data(event, "tool_name");

        {
            let mut stats = self.stats.lock();
            let entry = stats.entry(sid.clone()).or_default();
            entry.tool_count += 1;
            entry.tools_used.insert(tool_name.clone());
        }

        // Validation recovery: a failure followed by a success is a lesson.
        if tool_name.contains("validate") {
            if let Some(prev_error) = self.validation_failures.lock().remove(&sid) {
                let name = format!("validation-recovery-{}", chrono::Utc::now().timestamp());
                self.save_and_hotload(&name, &format_validation_experience(&prev_error));
            }
        }
    }

    fn on_workflow_submitted(&self, event: &Event) {
        let sid = session_of(event);
        let mut stats = self.stats.lock();
        let entry = stats.entry(sid).or_default();
        entry.workflow_submitted = true;

        if let Some(nodes) = event.data.get("workflow").and_then(|v| v.as_object()) {
            for node in nodes.values() {
                if let Some(class_type) = node.get("class_type").and_then(|v| v.as_str()) {
                    entry.workflow_nodes.push(class_type.to_owned());
                }
            }
        }
    }

    fn on_user_message(&self, event: &Event) {
        let content = str_data(event, "content").to_lowercase();
        const CORRECTION_SIGNALS: [&str; 5] = ["wrong", "don't", "should", "instead", "not what"];
        if CORRECTION_SIGNALS.iter().any(|s| content.contains(s)) {
            let sid = session_of(event);
            self.stats.lock().entry(sid).or_default().user_corrections += 1;
        }
    }

    // ── Layer 2: active reflection ─────────────────────────────────

    async fn on_turn_end(&self, event: &Event) {
        let sid = session_of(event);
        let Some(stats) = self.stats.lock().remove(&sid) else {
            self.validation_failures.lock().remove(&sid);
            return;
        };
        self.validation_failures.lock().remove(&sid);

        let worth_reflecting = stats.workflow_submitted
            || stats.user_corrections > 0
            || (stats.error_count > 0 && stats.tool_count > stats.error_count)
            || stats.tool_count >= 5;

        if !worth_reflecting {
            tracing::debug!(session_id = %sid, "skipping reflection: turn not notable");
            return;
        }

        let duration = event.data.get("duration").and_then(|v| v.as_f64()).unwrap_or(0.0);
        if let Some(llm) = &self.llm {
            if let Err(e) = self.reflect(llm, &stats, duration).await {
                tracing::warn!(error = %e, "reflection failed");
            }
        }
    }

    async fn reflect(
        &self,
        llm: &Arc<dyn LlmClient>,
        stats: &SessionStats,
        duration: f64,
    ) -> gp_domain::Result<()> {
        let mut tools_used: Vec<&str> = stats.tools_used.iter().map(String::as_str).collect();
        tools_used.sort();

        let mut context = format!(
            "Review this completed agent conversation and extract learnings.\n\n\
             {SYNTHESIZE_GUIDE}\n\
             Conversation context:\n\
             - Tool calls: {}\n\
             - Tools used: {}\n\
             - Duration: {duration:.1}s\n\
             - Errors: {}\n",
            stats.tool_count,
            if tools_used.is_empty() {
                "none".to_owned()
            } else {
                tools_used.join(", ")
            },
            stats.error_count,
        );
        if !stats.workflow_nodes.is_empty() {
            let mut unique: Vec<&str> = stats
                .workflow_nodes
                .iter()
                .map(String::as_str)
                .collect::<HashSet<_>>()
                .into_iter()
                .collect();
            unique.sort();
            context.push_str(&format!("- Workflow nodes used: {}\n", unique.join(", ")));
        }
        if stats.user_corrections > 0 {
            context.push_str(&format!(
                "- User corrections detected: {}\n",
                stats.user_corrections
            ));
        }
        context.push_str(
            "\nBased on this conversation, write a Gherkin experience Feature.\n\
             If the conversation was trivial (simple greeting, no real work), \
             respond with exactly \"NONE\".",
        );

        let resp = llm
            .chat(ChatRequest {
                messages: vec![Message::user(context)],
                tools: Vec::new(),
                system: "You are a concise experience recorder for a graph-workflow agent. \
                         Output only valid Gherkin Feature text, or exactly NONE."
                    .into(),
                max_tokens: Some(REFLECTION_MAX_TOKENS),
            })
            .await?;

        let text = strip_fences(resp.text.trim());
        if text.eq_ignore_ascii_case("NONE") || !text.starts_with("Feature:") {
            tracing::debug!("reflection: no notable experience extracted");
            return Ok(());
        }

        let name = format!("reflection-{}", chrono::Utc::now().timestamp());
        self.save_and_hotload(&name, &text);
        Ok(())
    }

    // ── Layer 3: save + hot-load ───────────────────────────────────

    fn save_and_hotload(&self, name: &str, gherkin: &str) {
        {
            let last = self.last_save.lock();
            if let Some(at) = *last {
                if at.elapsed() < SAVE_COOLDOWN {
                    tracing::debug!("experience save skipped (cooldown)");
                    return;
                }
            }
        }

        if let Err(e) = self.identity.save_experience(&self.role_name, name, gherkin) {
            tracing::warn!(error = %e, "failed to persist experience");
            return;
        }
        *self.last_save.lock() = Some(Instant::now());

        if let Some(builder) = &self.prompt_builder {
            // Low priority — trimmed first under the token budget.
            builder.register_section(
                ContextSection::new(
                    format!("experience_{name}"),
                    SectionCategory::Experience,
                    gherkin,
                )
                .with_priority(99),
            );
            tracing::info!(name, "experience hot-loaded into prompt");
        }
    }
}

fn session_of(event: &Event) -> String {
    event.session_id.clone().unwrap_or_default()
}

fn str_data(event: &Event, key: &str) -> String {
    event
        .data
        .get(key)
        .and_then(Value::as_str)
        .unwrap_or("")
        .to_owned()
}

fn format_validation_experience(error: &str) -> String {
    format!(
        "Feature: Workflow Validation Recovery\n\
         \x20 Scenario: Validation error corrected\n\
         \x20   Given a workflow validation failed with: {error}\n\
         \x20   When the workflow was corrected and re-validated\n\
         \x20   Then the validation succeeded\n\
         \x20   And this error pattern should be avoided in future workflows\n"
    )
}

fn strip_fences(text: &str) -> String {
    if !text.starts_with("```") {
        return text.to_owned();
    }
    text.lines()
        .filter(|line| !line.trim_start().starts_with("```"))
        .collect::<Vec<_>>()
        .join("\n")
        .trim()
        .to_owned()
}
