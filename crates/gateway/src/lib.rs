//! GraphPilot gateway: the HTTP/WebSocket API, the interactive CLI, and
//! the wiring that assembles the runtime from configuration.

pub mod api;
pub mod bootstrap;
pub mod cli;
pub mod state;
