//! Subscription session management.
//!
//! A [`SessionManager`] owns one logical subscription to the change feed:
//! - Opens a transport connection per attempt and closes the previous one first
//! - Retries failed connections with exponential backoff, then gives up
//! - Routes change events to [`Handlers`] only while connected
//! - Turns status-field transitions into notifications
//! - Enriches membership inserts with a lookup before reporting them
//!
//! # Example
//!
//! ```ignore
//! let manager = SessionManager::builder(transport, Arc::new(ThreadScheduler::new()))
//!     .sink(Arc::new(TracingSink))
//!     .lookup(store.clone())
//!     .build()?;
//!
//! manager.subscribe(
//!     format!("swarm:{}", swarm_id),
//!     vec![
//!         WatchFilter::table(Table::Messages).filter(Predicate::eq("swarm_id", &swarm_id)),
//!         WatchFilter::table(Table::SwarmAgents).filter(Predicate::eq("swarm_id", &swarm_id)),
//!         WatchFilter::table(Table::Swarms).on(EventFilter::Update).filter(Predicate::eq("id", &swarm_id)),
//!     ],
//!     Handlers::new()
//!         .with_store(store.clone())
//!         .on_child_added(|added| println!("{} joined", added.child.id()))
//!         .on_child_removed(|removed| println!("{} left", removed.child_id)),
//! )?;
//! ```

mod handlers;
mod manager;

pub use handlers::{
    ChangeCallback, ChildAddedCallback, ChildRemovedCallback, Handlers, StatusCallback,
    TransitionCallback,
};
pub use manager::{SessionManager, SessionManagerBuilder};
