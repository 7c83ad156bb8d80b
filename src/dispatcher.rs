//! Named-event publish/subscribe registry

use std::collections::HashMap;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::{Arc, PoisonError, RwLock};

use tracing::error;

/// An event that can be routed by name
pub trait Event {
    fn name(&self) -> &'static str;
}

type Handler<E> = Arc<dyn Fn(&E) + Send + Sync>;

/// Handlers keyed by event name, called in registration order.
pub struct EventDispatcher<E> {
    handlers: RwLock<HashMap<String, Vec<Handler<E>>>>,
}

impl<E> Default for EventDispatcher<E> {
    fn default() -> Self {
        Self {
            handlers: RwLock::new(HashMap::new()),
        }
    }
}

impl<E> std::fmt::Debug for EventDispatcher<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let handlers = self.handlers.read().unwrap_or_else(PoisonError::into_inner);
        let mut names: Vec<&String> = handlers.keys().collect();
        names.sort();
        f.debug_struct("EventDispatcher")
            .field("events", &names)
            .finish()
    }
}

impl<E: Event> EventDispatcher<E> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a handler for `name`
    pub fn register<F>(&self, name: &str, handler: F) -> &Self
    where
        F: Fn(&E) + Send + Sync + 'static,
    {
        self.handlers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(name.to_string())
            .or_default()
            .push(Arc::new(handler));
        self
    }

    /// Call every handler registered under the event's name.
    ///
    /// Handlers run on a snapshot of the registry, so a handler may register
    /// more handlers without deadlocking. A panicking handler is logged and
    /// the remaining handlers still run.
    pub fn dispatch(&self, event: &E) {
        let name = event.name();
        let snapshot: Vec<Handler<E>> = match self
            .handlers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(name)
        {
            Some(handlers) => handlers.clone(),
            None => return,
        };

        for handler in snapshot {
            if catch_unwind(AssertUnwindSafe(|| handler(event))).is_err() {
                error!("Handler for `{}` panicked", name);
            }
        }
    }

    pub fn handler_count(&self, name: &str) -> usize {
        self.handlers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(name)
            .map_or(0, Vec::len)
    }
}
