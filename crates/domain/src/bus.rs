//! In-process event bus with exact, prefix, and catch-all subscriptions.
//!
//! Handler execution order within one `emit` is deterministic: exact-match
//! handlers first, then prefix, then all — registration order within each
//! group. Async handlers are awaited in order. A failing handler is logged
//! and never prevents later handlers from seeing the event; emission
//! itself cannot fail.

use std::collections::VecDeque;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;

use crate::error::Result;
use crate::events::{Event, EventType};
use crate::stream::BoxFuture;

/// An event handler: an async closure invoked for each matching event.
pub type EventHandler = Arc<dyn Fn(Event) -> BoxFuture<'static, Result<()>> + Send + Sync>;

/// Wrap an async closure into an [`EventHandler`].
pub fn handler<F, Fut>(f: F) -> EventHandler
where
    F: Fn(Event) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<()>> + Send + 'static,
{
    Arc::new(move |event| Box::pin(f(event)))
}

enum SubKind {
    Exact,
    Prefix,
    All,
}

/// Opaque unsubscribe capability returned by the subscribe methods.
pub struct Subscription {
    bus: Weak<EventBus>,
    id: u64,
    kind: SubKind,
}

impl Subscription {
    pub fn unsubscribe(self) {
        let Some(bus) = self.bus.upgrade() else {
            return;
        };
        match self.kind {
            SubKind::Exact => bus.exact.lock().retain(|(id, _, _)| *id != self.id),
            SubKind::Prefix => bus.prefix.lock().retain(|(id, _, _)| *id != self.id),
            SubKind::All => bus.all.lock().retain(|(id, _)| *id != self.id),
        }
    }
}

/// Central pub/sub bus for agent-internal communication.
pub struct EventBus {
    exact: Mutex<Vec<(u64, EventType, EventHandler)>>,
    prefix: Mutex<Vec<(u64, String, EventHandler)>>,
    all: Mutex<Vec<(u64, EventHandler)>>,
    history: Mutex<VecDeque<Event>>,
    history_size: usize,
    next_id: AtomicU64,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBus {
    pub fn new() -> Self {
        Self::with_history_size(100)
    }

    pub fn with_history_size(history_size: usize) -> Self {
        Self {
            exact: Mutex::new(Vec::new()),
            prefix: Mutex::new(Vec::new()),
            all: Mutex::new(Vec::new()),
            history: Mutex::new(VecDeque::new()),
            history_size,
            next_id: AtomicU64::new(1),
        }
    }

    /// Subscribe to a specific event type.
    pub fn on(self: &Arc<Self>, event_type: EventType, handler: EventHandler) -> Subscription {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.exact.lock().push((id, event_type, handler));
        Subscription {
            bus: Arc::downgrade(self),
            id,
            kind: SubKind::Exact,
        }
    }

    /// Subscribe to all events whose type name begins with `prefix`
    /// (e.g. `"state."`, `"backend."`).
    pub fn on_prefix(self: &Arc<Self>, prefix: &str, handler: EventHandler) -> Subscription {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.prefix.lock().push((id, prefix.to_owned(), handler));
        Subscription {
            bus: Arc::downgrade(self),
            id,
            kind: SubKind::Prefix,
        }
    }

    /// Subscribe to every event.
    pub fn on_all(self: &Arc<Self>, handler: EventHandler) -> Subscription {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.all.lock().push((id, handler));
        Subscription {
            bus: Arc::downgrade(self),
            id,
            kind: SubKind::All,
        }
    }

    /// Emit an event to all matching subscribers.
    pub async fn emit(&self, event: Event) {
        {
            let mut history = self.history.lock();
            history.push_back(event.clone());
            while history.len() > self.history_size {
                history.pop_front();
            }
        }

        // Snapshot matching handlers before awaiting anything, so handlers
        // may themselves subscribe or unsubscribe without deadlocking.
        let mut handlers: Vec<EventHandler> = Vec::new();
        {
            let exact = self.exact.lock();
            handlers.extend(
                exact
                    .iter()
                    .filter(|(_, t, _)| *t == event.event_type)
                    .map(|(_, _, h)| h.clone()),
            );
        }
        {
            let name = event.event_type.as_str();
            let prefix = self.prefix.lock();
            handlers.extend(
                prefix
                    .iter()
                    .filter(|(_, p, _)| name.starts_with(p.as_str()))
                    .map(|(_, _, h)| h.clone()),
            );
        }
        {
            let all = self.all.lock();
            handlers.extend(all.iter().map(|(_, h)| h.clone()));
        }

        for h in handlers {
            if let Err(e) = h(event.clone()).await {
                tracing::warn!(
                    event_type = %event.event_type,
                    error = %e,
                    "event handler failed"
                );
            }
        }
    }

    /// Snapshot of recent events, optionally filtered by type.
    pub fn history(&self, event_type: Option<EventType>) -> Vec<Event> {
        let history = self.history.lock();
        match event_type {
            None => history.iter().cloned().collect(),
            Some(ty) => history
                .iter()
                .filter(|e| e.event_type == ty)
                .cloned()
                .collect(),
        }
    }

    /// Drop all handlers and history.
    pub fn clear(&self) {
        self.exact.lock().clear();
        self.prefix.lock().clear();
        self.all.lock().clear();
        self.history.lock().clear();
    }
}
