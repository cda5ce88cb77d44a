use std::path::PathBuf;
use std::sync::Arc;

use parking_lot::RwLock;

use gp_backend::{GraphClient, NodeIndex};
use gp_core::AgentLoop;
use gp_domain::bus::EventBus;
use gp_domain::config::AppConfig;
use gp_sessions::SessionStore;

/// Shared application state passed to all API handlers.
#[derive(Clone)]
pub struct AppState {
    /// Live configuration; `PUT /api/config` mutates it.
    pub config: Arc<RwLock<AppConfig>>,
    /// Where the configuration file lives (for persistence).
    pub config_path: Arc<PathBuf>,
    pub bus: Arc<EventBus>,
    pub backend: Arc<GraphClient>,
    pub node_index: Arc<NodeIndex>,
    pub sessions: Arc<SessionStore>,
    pub agent: Arc<AgentLoop>,
}
