//! Error types for realtime subscriptions.

use crate::types::Table;
use thiserror::Error;

/// Main error type for subscription operations.
#[derive(Debug, Error)]
pub enum RealtimeError {
    #[error("Channel key must not be empty")]
    EmptyChannelKey,

    #[error("Subscription needs at least one filter")]
    EmptyFilters,

    #[error("No handler registered for table: {0}")]
    MissingHandler(Table),

    #[error("Invalid predicate: {0}")]
    InvalidPredicate(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Unknown table: {0}")]
    UnknownTable(String),

    #[error("Invalid payload for {table}: {reason}")]
    InvalidPayload { table: Table, reason: String },

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Lookup failed: {0}")]
    Lookup(String),
}

/// Result type for subscription operations.
pub type Result<T> = std::result::Result<T, RealtimeError>;
