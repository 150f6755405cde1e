//! Environment signals (network online/offline, app foregrounded).

use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

/// Host environment events that affect connectivity.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum EnvironmentSignal {
    Online,
    Offline,
    VisibilityRestored,
}

/// Something that reacts to environment signals.
pub trait EnvironmentListener: Send + Sync {
    fn on_signal(&self, signal: EnvironmentSignal);
}

/// Registration handle returned by `Environment::register`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ListenerId(pub u64);

/// Fan-out point for environment signals.
///
/// Listeners are held weakly; one that has been dropped is skipped and
/// pruned on the next emit.
#[derive(Default)]
pub struct Environment {
    listeners: RwLock<HashMap<ListenerId, Weak<dyn EnvironmentListener>>>,
    next_id: AtomicU64,
}

impl Environment {
    /// Creates a hub with no listeners.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a listener. Dead listeners are pruned on emit.
    pub fn register(&self, listener: Weak<dyn EnvironmentListener>) -> ListenerId {
        let id = ListenerId(self.next_id.fetch_add(1, Ordering::SeqCst) + 1);
        self.listeners.write().insert(id, listener);
        id
    }

    /// Returns false if `id` was not registered.
    pub fn deregister(&self, id: ListenerId) -> bool {
        self.listeners.write().remove(&id).is_some()
    }

    /// Number of registered listeners, including dead ones not yet pruned.
    pub fn listener_count(&self) -> usize {
        self.listeners.read().len()
    }

    /// Deliver a signal. Returns the number of listeners reached.
    pub fn emit(&self, signal: EnvironmentSignal) -> usize {
        let mut live: Vec<Arc<dyn EnvironmentListener>> = Vec::new();
        let mut dead = Vec::new();
        {
            let listeners = self.listeners.read();
            for (id, weak) in listeners.iter() {
                match weak.upgrade() {
                    Some(listener) => live.push(listener),
                    None => dead.push(*id),
                }
            }
        }

        if !dead.is_empty() {
            let mut listeners = self.listeners.write();
            for id in dead {
                listeners.remove(&id);
            }
        }

        tracing::debug!(?signal, listeners = live.len(), "environment signal");
        for listener in &live {
            listener.on_signal(signal);
        }
        live.len()
    }
}
