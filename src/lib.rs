//! # HIVE Realtime
//!
//! A reconnecting subscription session for the HIVE change feed: swarms,
//! agents, swarm memberships, messages and swarm actions.
//!
//! ## Core Concepts
//!
//! - **Session**: One logical subscription kept alive across transport drops
//! - **Backoff**: Retries at 2s, 4s, 8s, 16s and 32s, then an error status
//! - **Dispatch**: Change events routed to per-table handlers while connected
//! - **Transitions**: Status-field changes turned into user notifications
//! - **Enrichment**: Membership inserts resolved to full child entities
//! - **Environment**: Online, offline and visibility signals drive reconnects
//!
//! ## Example
//!
//! ```ignore
//! use hive_realtime::{
//!     ChangeFeed, Handlers, Predicate, SessionManager, Table, ThreadScheduler, WatchFilter,
//! };
//! use std::sync::Arc;
//!
//! let feed = Arc::new(ChangeFeed::new());
//! let manager = SessionManager::builder(feed.clone(), Arc::new(ThreadScheduler::new())).build()?;
//!
//! manager.subscribe(
//!     "swarm:s1",
//!     vec![WatchFilter::table(Table::Messages).filter(Predicate::eq("swarm_id", "s1"))],
//!     Handlers::new().on_change(Table::Messages, |event| println!("{:?}", event.after)),
//! )?;
//! ```

pub mod config;
pub mod environment;
pub mod error;
pub mod machine;
pub mod notify;
pub mod runtime;
pub mod session;
pub mod store;
pub mod transport;
pub mod types;

// Re-exports
pub use config::{FeedConfig, ManagerConfig, MembershipWatch, StatusWatch};
pub use environment::{Environment, EnvironmentListener, EnvironmentSignal, ListenerId};
pub use error::{RealtimeError, Result};
pub use machine::{Effect, ReconnectMachine, ReconnectPolicy, SessionInput, SessionState};
pub use notify::{
    connection_lost_notification, status_notification, ChannelSink, CollectingSink,
    NotificationSink, TracingSink,
};
pub use runtime::{ManualScheduler, Scheduler, Task, ThreadScheduler, TimerId};
pub use session::{Handlers, SessionManager, SessionManagerBuilder};
pub use store::{EntityLookup, EntityStore, MemoryStore};
pub use transport::{ChangeFeed, ConnectionHandle, ConnectionObserver, Transport, TransportSink};
pub use types::*;
