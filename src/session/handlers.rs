//! Caller-supplied callbacks for a subscription.

use crate::config::ManagerConfig;
use crate::error::{RealtimeError, Result};
use crate::store::EntityStore;
use crate::types::{
    ChangeEvent, ChildAdded, ChildRemoved, ConnectionStatus, StatusTransition, Table, WatchFilter,
};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

/// Per-table change callback.
pub type ChangeCallback = Arc<dyn Fn(&ChangeEvent) + Send + Sync>;
/// Status-field transition callback.
pub type TransitionCallback = Arc<dyn Fn(&StatusTransition) + Send + Sync>;
/// Connection status callback.
pub type StatusCallback = Arc<dyn Fn(ConnectionStatus) + Send + Sync>;
/// Enriched membership insert callback.
pub type ChildAddedCallback = Arc<dyn Fn(&ChildAdded) + Send + Sync>;
/// Membership delete callback.
pub type ChildRemovedCallback = Arc<dyn Fn(&ChildRemoved) + Send + Sync>;

/// Routing table from change events to caller code.
///
/// Callbacks run on transport, timer or worker threads. Connection status
/// callbacks are delivered with no lock held and may call back into the
/// [`SessionManager`](crate::SessionManager). Change callbacks block delivery.
///
/// ```
/// use hive_realtime::{Handlers, Table};
///
/// let handlers = Handlers::new()
///     .on_change(Table::Messages, |event| println!("{:?}", event.kind))
///     .on_connection_status(|status| println!("now {}", status));
/// assert!(handlers.has_table(Table::Messages));
/// ```
#[derive(Clone, Default)]
pub struct Handlers {
    pub(crate) tables: HashMap<Table, ChangeCallback>,
    pub(crate) store: Option<Arc<dyn EntityStore>>,
    pub(crate) status_transition: Option<TransitionCallback>,
    pub(crate) connection_status: Option<StatusCallback>,
    pub(crate) child_added: Option<ChildAddedCallback>,
    pub(crate) child_removed: Option<ChildRemovedCallback>,
}

impl Handlers {
    /// Creates a table with no callbacks.
    pub fn new() -> Self {
        Self::default()
    }

    /// Handle every change on `table`. Replaces an earlier handler.
    pub fn on_change<F>(mut self, table: Table, f: F) -> Self
    where
        F: Fn(&ChangeEvent) + Send + Sync + 'static,
    {
        self.tables.insert(table, Arc::new(f));
        self
    }

    /// Mirror every change into a local entity store.
    pub fn with_store(mut self, store: Arc<dyn EntityStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Called when a watched status field changes value.
    pub fn on_status_transition<F>(mut self, f: F) -> Self
    where
        F: Fn(&StatusTransition) + Send + Sync + 'static,
    {
        self.status_transition = Some(Arc::new(f));
        self
    }

    /// Called on every visible connection status change.
    pub fn on_connection_status<F>(mut self, f: F) -> Self
    where
        F: Fn(ConnectionStatus) + Send + Sync + 'static,
    {
        self.connection_status = Some(Arc::new(f));
        self
    }

    /// Called with the full child entity when a membership is inserted.
    pub fn on_child_added<F>(mut self, f: F) -> Self
    where
        F: Fn(&ChildAdded) + Send + Sync + 'static,
    {
        self.child_added = Some(Arc::new(f));
        self
    }

    /// Called with the parent and child ids when a membership is deleted.
    pub fn on_child_removed<F>(mut self, f: F) -> Self
    where
        F: Fn(&ChildRemoved) + Send + Sync + 'static,
    {
        self.child_removed = Some(Arc::new(f));
        self
    }

    /// Whether events for `table` are routed anywhere.
    pub fn has_table(&self, table: Table) -> bool {
        self.tables.contains_key(&table)
    }

    /// Whether events for `table` reach some caller code.
    fn routes(&self, table: Table, config: &ManagerConfig) -> bool {
        self.store.is_some()
            || self.tables.contains_key(&table)
            || (table == config.status_watch.table && self.status_transition.is_some())
            || (table == config.membership.table
                && (self.child_added.is_some() || self.child_removed.is_some()))
    }

    pub(crate) fn emit_status(&self, status: ConnectionStatus) {
        if let Some(cb) = &self.connection_status {
            cb(status);
        }
    }
}

impl fmt::Debug for Handlers {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut tables: Vec<&Table> = self.tables.keys().collect();
        tables.sort();
        f.debug_struct("Handlers")
            .field("tables", &tables)
            .field("store", &self.store.is_some())
            .field("status_transition", &self.status_transition.is_some())
            .field("connection_status", &self.connection_status.is_some())
            .field("child_added", &self.child_added.is_some())
            .field("child_removed", &self.child_removed.is_some())
            .finish()
    }
}

/// Reject subscriptions that would silently drop events.
pub(crate) fn validate_subscription(
    channel: &str,
    filters: &[WatchFilter],
    handlers: &Handlers,
    config: &ManagerConfig,
    has_lookup: bool,
) -> Result<()> {
    if channel.trim().is_empty() {
        return Err(RealtimeError::EmptyChannelKey);
    }
    if filters.is_empty() {
        return Err(RealtimeError::EmptyFilters);
    }
    for filter in filters {
        if !handlers.routes(filter.table, config) {
            return Err(RealtimeError::MissingHandler(filter.table));
        }
    }
    if handlers.child_added.is_some() && !has_lookup {
        return Err(RealtimeError::InvalidConfig(
            "child-added handler needs an entity lookup".to_string(),
        ));
    }
    Ok(())
}
