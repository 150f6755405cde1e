//! Manager and feed configuration.

use crate::error::{RealtimeError, Result};
use crate::machine::ReconnectPolicy;
use crate::types::Table;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Subscription manager configuration.
///
/// Every field has a default, so a partial JSON document is enough:
///
/// ```
/// use hive_realtime::ManagerConfig;
///
/// let config = ManagerConfig::from_json_str(r#"{"base_delay_ms": 500}"#).unwrap();
/// assert_eq!(config.base_delay_ms, 500);
/// assert_eq!(config.max_reconnect_attempts, 5);
/// ```
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ManagerConfig {
    /// Delay before the first automatic retry; doubled for each later one.
    /// Default: 2000ms
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,

    /// Automatic retries before giving up.
    /// Default: 5
    #[serde(default = "default_max_reconnect_attempts")]
    pub max_reconnect_attempts: u32,

    /// Optional ceiling for a single retry delay.
    /// Default: None (pure doubling)
    #[serde(default)]
    pub max_delay_ms: Option<u64>,

    /// Status field whose transitions produce notifications.
    #[serde(default)]
    pub status_watch: StatusWatch,

    /// Child-relationship table whose inserts are enriched.
    #[serde(default)]
    pub membership: MembershipWatch,
}

fn default_base_delay_ms() -> u64 {
    2000
}

fn default_max_reconnect_attempts() -> u32 {
    5
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            base_delay_ms: default_base_delay_ms(),
            max_reconnect_attempts: default_max_reconnect_attempts(),
            max_delay_ms: None,
            status_watch: StatusWatch::default(),
            membership: MembershipWatch::default(),
        }
    }
}

impl ManagerConfig {
    /// Parse and validate a JSON configuration document.
    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: ManagerConfig = serde_json::from_str(json)
            .map_err(|e| RealtimeError::InvalidConfig(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Rejects zero or inverted delays and inconsistent watch columns.
    pub fn validate(&self) -> Result<()> {
        if self.base_delay_ms == 0 {
            return Err(RealtimeError::InvalidConfig(
                "base_delay_ms must be positive".to_string(),
            ));
        }
        if let Some(max) = self.max_delay_ms {
            if max < self.base_delay_ms {
                return Err(RealtimeError::InvalidConfig(format!(
                    "max_delay_ms ({}) is below base_delay_ms ({})",
                    max, self.base_delay_ms
                )));
            }
        }
        if self.membership.table == self.membership.child_table {
            return Err(RealtimeError::InvalidConfig(format!(
                "membership table {} cannot be its own child table",
                self.membership.table
            )));
        }
        if self.membership.parent_key.is_empty()
            || self.membership.child_key.is_empty()
            || self.status_watch.field.is_empty()
        {
            return Err(RealtimeError::InvalidConfig(
                "watch column names must not be empty".to_string(),
            ));
        }
        Ok(())
    }

    /// Builds the backoff policy these settings describe.
    pub fn reconnect_policy(&self) -> ReconnectPolicy {
        ReconnectPolicy {
            base_delay: Duration::from_millis(self.base_delay_ms),
            max_attempts: self.max_reconnect_attempts,
            max_delay: self.max_delay_ms.map(Duration::from_millis),
        }
    }
}

/// The distinguished status column.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusWatch {
    pub table: Table,
    pub field: String,
}

impl Default for StatusWatch {
    fn default() -> Self {
        Self {
            table: Table::Swarms,
            field: "status".to_string(),
        }
    }
}

/// The distinguished parent/child membership table.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct MembershipWatch {
    /// Table whose rows link a child to a parent.
    pub table: Table,
    /// Column holding the parent id.
    pub parent_key: String,
    /// Column holding the child id.
    pub child_key: String,
    /// Table the child id is looked up in.
    pub child_table: Table,
}

impl Default for MembershipWatch {
    fn default() -> Self {
        Self {
            table: Table::SwarmAgents,
            parent_key: "swarm_id".to_string(),
            child_key: "agent_id".to_string(),
            child_table: Table::Agents,
        }
    }
}

/// In-process change feed configuration.
#[derive(Clone, Debug)]
pub struct FeedConfig {
    /// Max buffered messages per connection before it is dropped.
    /// Default: 1000
    pub buffer_size: usize,
}

impl Default for FeedConfig {
    fn default() -> Self {
        Self { buffer_size: 1000 }
    }
}
