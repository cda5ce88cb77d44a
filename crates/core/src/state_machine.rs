//! Agent state machine.
//!
//! A fixed Mealy-style table maps `(current state, event type)` to the
//! next state. Unknown pairs are no-ops: the state is preserved and
//! observers are not notified.

use gp_domain::events::{AgentState, EventType, StateChange};

type ChangeHandler = Box<dyn Fn(&StateChange) + Send + Sync>;

/// Look up the transition table.
fn transition(state: AgentState, event: EventType) -> Option<AgentState> {
    use AgentState::*;
    use EventType::*;

    match (state, event) {
        (Idle, StateConversationStart) => Some(Thinking),

        (Thinking, StateResponding) => Some(Responding),

        (Thinking, StateToolPlanned) => Some(PlanningTool),
        (Responding, StateToolPlanned) => Some(PlanningTool),

        (PlanningTool, StateToolExecuting) => Some(AwaitingToolResult),

        (AwaitingToolResult, StateToolCompleted) => Some(Thinking),
        (AwaitingToolResult, StateToolFailed) => Some(Thinking),

        (Responding, StateConversationEnd) => Some(Idle),
        (Thinking, StateConversationEnd) => Some(Idle),

        (Thinking, StateError) => Some(Error),
        (Responding, StateError) => Some(Error),
        (PlanningTool, StateError) => Some(Error),
        (AwaitingToolResult, StateError) => Some(Error),

        (Error, StateConversationEnd) => Some(Idle),

        _ => None,
    }
}

/// Tracks the current [`AgentState`] and notifies observers on change.
pub struct StateMachine {
    state: AgentState,
    handlers: Vec<ChangeHandler>,
}

impl Default for StateMachine {
    fn default() -> Self {
        Self::new()
    }
}

impl StateMachine {
    pub fn new() -> Self {
        Self {
            state: AgentState::Idle,
            handlers: Vec::new(),
        }
    }

    pub fn state(&self) -> AgentState {
        self.state
    }

    /// Process an event; returns the (possibly unchanged) state.
    /// Observers fire only when the state actually changes.
    pub fn process(&mut self, event: EventType) -> AgentState {
        if let Some(next) = transition(self.state, event) {
            if next != self.state {
                let change = StateChange {
                    prev: self.state,
                    current: next,
                };
                self.state = next;
                tracing::debug!(prev = ?change.prev, current = ?change.current, event = %event, "state transition");
                self.notify(&change);
            }
        }
        self.state
    }

    /// Subscribe to state changes.
    pub fn on_change(&mut self, handler: impl Fn(&StateChange) + Send + Sync + 'static) {
        self.handlers.push(Box::new(handler));
    }

    /// Force back to idle, notifying if that is a change.
    pub fn reset(&mut self) {
        if self.state != AgentState::Idle {
            let change = StateChange {
                prev: self.state,
                current: AgentState::Idle,
            };
            self.state = AgentState::Idle;
            self.notify(&change);
        }
    }

    fn notify(&self, change: &StateChange) {
        for handler in &self.handlers {
            handler(change);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn conversation_happy_path() {
        let mut sm = StateMachine::new();
        assert_eq!(sm.state(), AgentState::Idle);

        assert_eq!(
            sm.process(EventType::StateConversationStart),
            AgentState::Thinking
        );
        assert_eq!(sm.process(EventType::StateResponding), AgentState::Responding);
        assert_eq!(sm.process(EventType::StateConversationEnd), AgentState::Idle);
    }

    #[test]
    fn tool_cycle_returns_to_thinking() {
        let mut sm = StateMachine::new();
        sm.process(EventType::StateConversationStart);
        assert_eq!(sm.process(EventType::StateToolPlanned), AgentState::PlanningTool);
        assert_eq!(
            sm.process(EventType::StateToolExecuting),
            AgentState::AwaitingToolResult
        );
        assert_eq!(sm.process(EventType::StateToolCompleted), AgentState::Thinking);

        // Failure path also returns to thinking.
        sm.process(EventType::StateToolPlanned);
        sm.process(EventType::StateToolExecuting);
        assert_eq!(sm.process(EventType::StateToolFailed), AgentState::Thinking);
    }

    #[test]
    fn error_from_any_active_state_and_recovery() {
        for setup in [
            vec![EventType::StateConversationStart],
            vec![EventType::StateConversationStart, EventType::StateResponding],
            vec![EventType::StateConversationStart, EventType::StateToolPlanned],
            vec![
                EventType::StateConversationStart,
                EventType::StateToolPlanned,
                EventType::StateToolExecuting,
            ],
        ] {
            let mut sm = StateMachine::new();
            for ev in setup {
                sm.process(ev);
            }
            assert_eq!(sm.process(EventType::StateError), AgentState::Error);
            assert_eq!(sm.process(EventType::StateConversationEnd), AgentState::Idle);
        }
    }

    #[test]
    fn unknown_transitions_are_noops() {
        let mut sm = StateMachine::new();
        // Idle + responding is not in the table.
        assert_eq!(sm.process(EventType::StateResponding), AgentState::Idle);
        // Idle + error is not in the table either.
        assert_eq!(sm.process(EventType::StateError), AgentState::Idle);
        // Unrelated event types never move the machine.
        assert_eq!(sm.process(EventType::MessageUser), AgentState::Idle);
    }

    #[test]
    fn observers_fire_only_on_change() {
        let mut sm = StateMachine::new();
        let count = Arc::new(AtomicUsize::new(0));
        let count_ref = count.clone();
        sm.on_change(move |_| {
            count_ref.fetch_add(1, Ordering::SeqCst);
        });

        sm.process(EventType::StateConversationStart); // change
        sm.process(EventType::StateResponding); // change
        sm.process(EventType::MessageUser); // no-op
        sm.process(EventType::StateError); // change
        assert_eq!(count.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn reset_notifies_when_not_idle() {
        let mut sm = StateMachine::new();
        let count = Arc::new(AtomicUsize::new(0));
        let count_ref = count.clone();
        sm.on_change(move |_| {
            count_ref.fetch_add(1, Ordering::SeqCst);
        });

        sm.reset(); // already idle — no notification
        assert_eq!(count.load(Ordering::SeqCst), 0);

        sm.process(EventType::StateConversationStart);
        sm.reset();
        assert_eq!(sm.state(), AgentState::Idle);
        assert_eq!(count.load(Ordering::SeqCst), 2);
    }
}
