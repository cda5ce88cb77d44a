//! Tool factory — assembles the dispatcher sets.

use std::sync::Arc;

use gp_backend::{GraphClient, NodeIndex, WebClient};

use crate::dispatchers::{
    DiscoverDispatcher, ExecuteDispatcher, ManageDispatcher, MonitorDispatcher,
};
use crate::web::{WebFetchTool, WebSearchTool};
use crate::Tool;

/// The full tool set for the main agent.
pub fn create_all_tools(
    client: Arc<GraphClient>,
    index: Arc<NodeIndex>,
    web: Arc<WebClient>,
) -> Vec<Arc<dyn Tool>> {
    vec![
        Arc::new(DiscoverDispatcher::new(index.clone())),
        Arc::new(ExecuteDispatcher::new(client.clone())),
        Arc::new(MonitorDispatcher::new(client.clone())),
        Arc::new(ManageDispatcher::new(client, index, web.clone())),
        Arc::new(WebSearchTool::new(web.clone())),
        Arc::new(WebFetchTool::new(web)),
    ]
}

/// Read-only subset for sub-agents: discovery and monitoring only —
/// nothing that submits, uploads, or mutates backend state.
pub fn create_readonly_tools(
    client: Arc<GraphClient>,
    index: Arc<NodeIndex>,
) -> Vec<Arc<dyn Tool>> {
    vec![
        Arc::new(DiscoverDispatcher::new(index)),
        Arc::new(MonitorDispatcher::new(client)),
    ]
}
