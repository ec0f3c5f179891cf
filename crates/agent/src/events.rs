//! Typed signal bus with one listener list per event kind.

use std::collections::HashMap;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;

use parking_lot::RwLock;
use proto::{ChatEvent, EventKind};
use tracing::{trace, warn};

/// Error a listener may report. It is logged, never propagated.
pub type ListenerError = Box<dyn std::error::Error + Send + Sync>;

type Listener = Arc<dyn Fn(&ChatEvent) -> Result<(), ListenerError> + Send + Sync>;

/// Publish/subscribe hub for [`ChatEvent`]s.
///
/// A listener that fails or panics is logged and skipped; delivery to the
/// remaining listeners continues.
#[derive(Default)]
pub struct EventBus {
    listeners: RwLock<HashMap<EventKind, Vec<Listener>>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a listener for one kind of event.
    pub fn subscribe<F>(&self, kind: EventKind, listener: F)
    where
        F: Fn(&ChatEvent) -> Result<(), ListenerError> + Send + Sync + 'static,
    {
        self.listeners
            .write()
            .entry(kind)
            .or_default()
            .push(Arc::new(listener));
    }

    /// Registers one listener for every kind.
    pub fn subscribe_all<F>(&self, listener: F)
    where
        F: Fn(&ChatEvent) -> Result<(), ListenerError> + Send + Sync + 'static,
    {
        let listener: Listener = Arc::new(listener);
        let mut listeners = self.listeners.write();
        for kind in EventKind::ALL {
            listeners.entry(kind).or_default().push(Arc::clone(&listener));
        }
    }

    /// Number of listeners registered for `kind`.
    pub fn listener_count(&self, kind: EventKind) -> usize {
        self.listeners.read().get(&kind).map_or(0, Vec::len)
    }

    /// Delivers an event to every listener of its kind. Returns how many
    /// listeners handled it without error.
    pub fn emit(&self, event: &ChatEvent) -> usize {
        let kind = event.kind();
        // Snapshot so listeners may subscribe without deadlocking.
        let snapshot: Vec<Listener> = self
            .listeners
            .read()
            .get(&kind)
            .cloned()
            .unwrap_or_default();
        trace!(?kind, listeners = snapshot.len(), "Emitting event");

        let mut delivered = 0;
        for listener in snapshot {
            match catch_unwind(AssertUnwindSafe(|| listener(event))) {
                Ok(Ok(())) => delivered += 1,
                Ok(Err(e)) => warn!(?kind, error = %e, "Event listener failed"),
                Err(_) => warn!(?kind, "Event listener panicked"),
            }
        }
        delivered
    }
}
