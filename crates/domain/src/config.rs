//! Application configuration, loaded from `config.toml`.
//!
//! Every section has serde defaults so a missing file (or a partial one)
//! yields a fully usable configuration. API keys resolve from the config
//! first, then from `{PROVIDER}_API_KEY`-style environment variables.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct AppConfig {
    #[serde(default)]
    pub backend: BackendConfig,
    #[serde(default)]
    pub llm: LlmConfig,
    #[serde(default)]
    pub agent: AgentConfig,
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub web: WebConfig,
    #[serde(default)]
    pub identity: IdentityConfig,
}

impl AppConfig {
    /// Load from a TOML file; a missing file yields the defaults.
    pub fn load(path: impl AsRef<Path>) -> Result<AppConfig> {
        let path = path.as_ref();
        if !path.exists() {
            return Ok(AppConfig::default());
        }
        let raw = std::fs::read_to_string(path)?;
        toml::from_str(&raw).map_err(|e| Error::Config(format!("{}: {e}", path.display())))
    }
}

// ── Backend ────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackendConfig {
    #[serde(default = "default_backend_base_url")]
    pub base_url: String,
    #[serde(default = "default_backend_ws_url")]
    pub ws_url: String,
    /// Request timeout in seconds.
    #[serde(default = "default_backend_timeout")]
    pub timeout: u64,
}

fn default_backend_base_url() -> String {
    "http://127.0.0.1:6006".into()
}
fn default_backend_ws_url() -> String {
    "ws://127.0.0.1:6006/ws".into()
}
fn default_backend_timeout() -> u64 {
    30
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            base_url: default_backend_base_url(),
            ws_url: default_backend_ws_url(),
            timeout: default_backend_timeout(),
        }
    }
}

// ── LLM ────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmConfig {
    #[serde(default = "default_llm_provider")]
    pub provider: String,
    #[serde(default = "default_llm_model")]
    pub model: String,
    #[serde(default = "default_llm_max_tokens")]
    pub max_tokens: u32,
    #[serde(default = "default_llm_temperature")]
    pub temperature: f32,
    #[serde(default)]
    pub api_key: String,
    #[serde(default)]
    pub base_url: String,
    #[serde(default = "default_llm_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_llm_retry_base_delay_ms")]
    pub retry_base_delay_ms: u64,
    #[serde(default = "default_llm_retry_max_delay_ms")]
    pub retry_max_delay_ms: u64,
}

fn default_llm_provider() -> String {
    "anthropic".into()
}
fn default_llm_model() -> String {
    "claude-sonnet-4-5-20250929".into()
}
fn default_llm_max_tokens() -> u32 {
    8192
}
fn default_llm_temperature() -> f32 {
    0.7
}
fn default_llm_max_retries() -> u32 {
    5
}
fn default_llm_retry_base_delay_ms() -> u64 {
    2000
}
fn default_llm_retry_max_delay_ms() -> u64 {
    60_000
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            provider: default_llm_provider(),
            model: default_llm_model(),
            max_tokens: default_llm_max_tokens(),
            temperature: default_llm_temperature(),
            api_key: String::new(),
            base_url: String::new(),
            max_retries: default_llm_max_retries(),
            retry_base_delay_ms: default_llm_retry_base_delay_ms(),
            retry_max_delay_ms: default_llm_retry_max_delay_ms(),
        }
    }
}

impl LlmConfig {
    /// Config key, else `{PROVIDER}_API_KEY` from the environment.
    pub fn resolve_api_key(&self) -> String {
        if !self.api_key.is_empty() {
            return self.api_key.clone();
        }
        let var = format!("{}_API_KEY", self.provider.to_uppercase());
        std::env::var(&var).unwrap_or_default()
    }
}

// ── Agent ──────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    #[serde(default = "default_agent_max_iterations")]
    pub max_iterations: usize,
    #[serde(default = "default_agent_session_db")]
    pub session_db: String,
    /// Context window override in tokens; 0 = auto-resolve from model.
    #[serde(default)]
    pub context_budget: usize,
}

fn default_agent_max_iterations() -> usize {
    20
}
fn default_agent_session_db() -> String {
    "data/sessions.db".into()
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            max_iterations: default_agent_max_iterations(),
            session_db: default_agent_session_db(),
            context_budget: 0,
        }
    }
}

// ── Server ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_server_host")]
    pub host: String,
    #[serde(default = "default_server_port")]
    pub port: u16,
    #[serde(default = "default_cors_origins")]
    pub cors_origins: Vec<String>,
}

fn default_server_host() -> String {
    "0.0.0.0".into()
}
fn default_server_port() -> u16 {
    5200
}
fn default_cors_origins() -> Vec<String> {
    vec!["*".into()]
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_server_host(),
            port: default_server_port(),
            cors_origins: default_cors_origins(),
        }
    }
}

// ── Logging ────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default = "default_log_dir")]
    pub log_dir: String,
}

fn default_log_level() -> String {
    "info".into()
}
fn default_log_dir() -> String {
    "data/logs".into()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            log_dir: default_log_dir(),
        }
    }
}

// ── Web search / fetch ─────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebConfig {
    /// Empty = use the scrape fallback instead of the Tavily API.
    #[serde(default)]
    pub tavily_api_key: String,
    #[serde(default = "default_web_timeout")]
    pub timeout: u64,
}

fn default_web_timeout() -> u64 {
    30
}

impl Default for WebConfig {
    fn default() -> Self {
        Self {
            tavily_api_key: String::new(),
            timeout: default_web_timeout(),
        }
    }
}

impl WebConfig {
    pub fn resolve_tavily_key(&self) -> String {
        if !self.tavily_api_key.is_empty() {
            return self.tavily_api_key.clone();
        }
        std::env::var("TAVILY_API_KEY").unwrap_or_default()
    }
}

// ── Identity (RoleX) ───────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IdentityConfig {
    #[serde(default = "default_rolex_dir")]
    pub rolex_dir: String,
    /// Empty = skip identity loading.
    #[serde(default)]
    pub role_name: String,
}

fn default_rolex_dir() -> String {
    "~/.rolex".into()
}

impl Default for IdentityConfig {
    fn default() -> Self {
        Self {
            rolex_dir: default_rolex_dir(),
            role_name: String::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_complete() {
        let cfg = AppConfig::default();
        assert_eq!(cfg.backend.base_url, "http://127.0.0.1:6006");
        assert_eq!(cfg.agent.max_iterations, 20);
        assert_eq!(cfg.llm.max_retries, 5);
        assert_eq!(cfg.llm.retry_base_delay_ms, 2000);
        assert_eq!(cfg.server.port, 5200);
        assert_eq!(cfg.server.cors_origins, vec!["*".to_owned()]);
        assert_eq!(cfg.agent.context_budget, 0);
    }

    #[test]
    fn partial_toml_fills_defaults() {
        let cfg: AppConfig = toml::from_str(
            r#"
            [llm]
            model = "claude-haiku-4-5-20251001"

            [server]
            port = 8080
            "#,
        )
        .unwrap();
        assert_eq!(cfg.llm.model, "claude-haiku-4-5-20251001");
        assert_eq!(cfg.llm.max_tokens, 8192);
        assert_eq!(cfg.server.port, 8080);
        assert_eq!(cfg.server.host, "0.0.0.0");
        assert_eq!(cfg.backend.timeout, 30);
    }

    #[test]
    fn api_key_prefers_config_value() {
        let mut llm = LlmConfig::default();
        llm.api_key = "sk-test".into();
        assert_eq!(llm.resolve_api_key(), "sk-test");
    }
}
