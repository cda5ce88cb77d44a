//! Clients for the world outside the agent: the node-graph execution
//! backend (HTTP + WebSocket) and the web (search + fetch).

pub mod client;
pub mod node_index;
pub mod web;

pub use client::GraphClient;
pub use node_index::NodeIndex;
pub use web::WebClient;
