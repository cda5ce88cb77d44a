//! The agent runtime: the reason/act loop and everything it leans on.
//!
//! [`agent::AgentLoop`] drives one user turn to completion: it loads
//! history from the last summary checkpoint, compresses and compacts
//! context, assembles the system prompt from intent analysis and live
//! environment signals, calls the LLM, dispatches tool batches in
//! parallel, and persists every message incrementally — emitting typed
//! events at every step.

pub mod agent;
pub mod cancel;
pub mod canvas;
pub mod context;
pub mod convert;
pub mod experience;
pub mod identity;
pub mod intent;
pub mod probe;
pub mod prompt;
pub mod state_machine;
pub mod subagent;
pub mod summarizer;

pub use agent::AgentLoop;
pub use cancel::CancelMap;
pub use state_machine::StateMachine;
