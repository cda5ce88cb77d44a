//! Component wiring: configuration → a fully assembled runtime.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use parking_lot::RwLock;

use gp_backend::{GraphClient, NodeIndex, WebClient};
use gp_core::agent::AgentLoop;
use gp_core::canvas::CanvasTracker;
use gp_core::context::ContextManager;
use gp_core::experience::ExperienceSynthesizer;
use gp_core::identity::{features_to_sections, IdentityLoader};
use gp_core::intent::IntentAnalyzer;
use gp_core::probe::EnvironmentProbe;
use gp_core::prompt::{default_sections, PromptBuilder};
use gp_core::subagent::SubAgentTool;
use gp_core::summarizer::Summarizer;
use gp_domain::bus::EventBus;
use gp_domain::config::AppConfig;
use gp_providers::{AnthropicClient, LlmClient};
use gp_sessions::SessionStore;
use gp_tools::{create_all_tools, create_readonly_tools, Tool, ToolExecutor};

use crate::state::AppState;

/// Assemble every runtime component from the configuration.
///
/// Connects to the backend (best effort — the agent runs degraded when
/// the backend is down), builds the node index, loads identity, and
/// wires the event-driven components onto the bus.
pub async fn build_state(config: AppConfig, config_path: PathBuf) -> anyhow::Result<AppState> {
    let bus = Arc::new(EventBus::new());

    // ── Backend client + node index ──────────────────────────────────
    let backend = Arc::new(
        GraphClient::from_config(&config.backend, Some(bus.clone()))
            .context("initializing backend client")?,
    );
    let node_index = Arc::new(NodeIndex::new());

    let backend_ok = backend.health_check().await;
    if backend_ok {
        tracing::info!(url = %config.backend.base_url, "backend connected");
        if let Err(e) = backend.connect_ws().await {
            tracing::warn!(error = %e, "backend websocket unavailable");
        }
        if let Err(e) = node_index.build(&backend).await {
            tracing::warn!(error = %e, "node index build failed");
        } else {
            tracing::info!(
                nodes = node_index.node_count(),
                categories = node_index.categories().len(),
                "node index ready"
            );
        }
    } else {
        tracing::warn!(url = %config.backend.base_url, "backend not reachable");
    }

    // ── LLM client ───────────────────────────────────────────────────
    let llm: Arc<dyn LlmClient> = Arc::new(
        AnthropicClient::from_config(&config.llm, Some(bus.clone()))
            .context("initializing LLM client")?,
    );
    tracing::info!(model = %config.llm.model, "LLM client ready");

    // ── Session store ────────────────────────────────────────────────
    let sessions = Arc::new(SessionStore::new(&config.agent.session_db));
    tracing::info!(path = %config.agent.session_db, "session store ready");

    // ── Web client + tools ───────────────────────────────────────────
    let web = Arc::new(WebClient::from_config(&config.web).context("initializing web client")?);
    let mut tools = create_all_tools(backend.clone(), node_index.clone(), web);
    let readonly_tools = create_readonly_tools(backend.clone(), node_index.clone());
    tools.push(Arc::new(SubAgentTool::new(
        llm.clone(),
        sessions.clone(),
        bus.clone(),
        readonly_tools,
    )) as Arc<dyn Tool>);
    let executor = Arc::new(ToolExecutor::with_default_timeout(tools));
    tracing::info!(tools = executor.schemas().len(), "tool executor ready");

    // ── Prompt builder + identity ────────────────────────────────────
    let prompt_builder = Arc::new(PromptBuilder::default());
    for section in default_sections() {
        prompt_builder.register_section(section);
    }

    let identity = Arc::new(IdentityLoader::new(&config.identity.rolex_dir));
    if !config.identity.role_name.is_empty() {
        let features = identity.load_identity(&config.identity.role_name);
        let sections = features_to_sections(&features, &config.identity.role_name);
        let count = sections.len();
        for section in sections {
            prompt_builder.register_section(section);
        }
        tracing::info!(
            sections = count,
            role = %config.identity.role_name,
            "identity sections registered"
        );

        // Post-turn reflection persists learnings and hot-loads them.
        let synthesizer = ExperienceSynthesizer::new(
            identity.clone(),
            config.identity.role_name.clone(),
            Some(llm.clone()),
            Some(prompt_builder.clone()),
        );
        // Handlers stay registered for the process lifetime.
        drop(synthesizer.attach(&bus));
        tracing::info!(role = %config.identity.role_name, "experience synthesizer wired");
    }

    // ── Environment awareness ────────────────────────────────────────
    let probe = Arc::new(EnvironmentProbe::new(backend.clone(), node_index.clone()));
    let canvas = CanvasTracker::new();
    drop(canvas.attach(&bus));

    // ── Agent loop ───────────────────────────────────────────────────
    let agent = AgentLoop::new(llm.clone(), executor, sessions.clone(), bus.clone())
        .with_max_iterations(config.agent.max_iterations)
        .with_context_manager(ContextManager::new(
            &config.llm.model,
            config.llm.max_tokens as usize,
            config.agent.context_budget,
        ))
        .with_summarizer(Summarizer::new(llm.clone(), sessions.clone(), bus.clone()))
        .with_prompt_builder(prompt_builder)
        .with_intent_analyzer(IntentAnalyzer::new(llm))
        .with_environment_probe(probe)
        .with_canvas_tracker(canvas);
    tracing::info!(max_iterations = config.agent.max_iterations, "agent loop ready");

    Ok(AppState {
        config: Arc::new(RwLock::new(config)),
        config_path: Arc::new(config_path),
        bus,
        backend,
        node_index,
        sessions,
        agent: Arc::new(agent),
    })
}
