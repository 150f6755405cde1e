//! Core types for change-feed subscriptions.

use crate::error::{RealtimeError, Result};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use std::str::FromStr;

/// Tables the HIVE change feed publishes.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Table {
    Swarms,
    Agents,
    SwarmAgents,
    Messages,
    SwarmActions,
}

impl Table {
    /// Every table, in declaration order.
    pub const ALL: [Table; 5] = [
        Table::Swarms,
        Table::Agents,
        Table::SwarmAgents,
        Table::Messages,
        Table::SwarmActions,
    ];

    /// Table name as it appears on the wire.
    pub fn as_str(&self) -> &'static str {
        match self {
            Table::Swarms => "swarms",
            Table::Agents => "agents",
            Table::SwarmAgents => "swarm_agents",
            Table::Messages => "messages",
            Table::SwarmActions => "swarm_actions",
        }
    }
}

impl fmt::Display for Table {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Table {
    type Err = RealtimeError;

    fn from_str(s: &str) -> Result<Self> {
        Table::ALL
            .iter()
            .copied()
            .find(|t| t.as_str() == s)
            .ok_or_else(|| RealtimeError::UnknownTable(s.to_string()))
    }
}

/// Kind of row change delivered by the feed.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    Insert,
    Update,
    Delete,
}

/// Which event kinds a watch filter accepts.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventFilter {
    Insert,
    Update,
    Delete,
    #[default]
    Any,
}

impl EventFilter {
    /// Whether events of `kind` pass this filter.
    pub fn accepts(&self, kind: EventKind) -> bool {
        matches!(
            (self, kind),
            (EventFilter::Any, _)
                | (EventFilter::Insert, EventKind::Insert)
                | (EventFilter::Update, EventKind::Update)
                | (EventFilter::Delete, EventKind::Delete)
        )
    }
}

/// Row predicate in `column=op.value` form (`eq`, `neq`, `in`).
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Predicate {
    Eq { column: String, value: String },
    Neq { column: String, value: String },
    In { column: String, values: Vec<String> },
}

impl Predicate {
    /// `column = value`.
    pub fn eq(column: impl Into<String>, value: impl Into<String>) -> Self {
        Predicate::Eq {
            column: column.into(),
            value: value.into(),
        }
    }

    /// Parse `user_id=eq.42`, `status=neq.archived` or `id=in.(a,b)`.
    pub fn parse(input: &str) -> Result<Self> {
        let invalid = || RealtimeError::InvalidPredicate(input.to_string());

        let (column, rest) = input.split_once('=').ok_or_else(invalid)?;
        let (op, operand) = rest.split_once('.').ok_or_else(invalid)?;
        let column = column.trim();
        if column.is_empty() {
            return Err(invalid());
        }

        match op {
            "eq" => Ok(Predicate::eq(column, operand)),
            "neq" => Ok(Predicate::Neq {
                column: column.to_string(),
                value: operand.to_string(),
            }),
            "in" => {
                let inner = operand
                    .strip_prefix('(')
                    .and_then(|s| s.strip_suffix(')'))
                    .ok_or_else(invalid)?;
                let values: Vec<String> = inner
                    .split(',')
                    .map(|v| v.trim().to_string())
                    .filter(|v| !v.is_empty())
                    .collect();
                if values.is_empty() {
                    return Err(invalid());
                }
                Ok(Predicate::In {
                    column: column.to_string(),
                    values,
                })
            }
            _ => Err(invalid()),
        }
    }

    /// Column the predicate tests.
    pub fn column(&self) -> &str {
        match self {
            Predicate::Eq { column, .. }
            | Predicate::Neq { column, .. }
            | Predicate::In { column, .. } => column,
        }
    }

    /// Check a raw JSON row. A missing column never matches.
    pub fn matches(&self, row: &Value) -> bool {
        let Some(actual) = row.get(self.column()).and_then(scalar_text) else {
            return false;
        };
        match self {
            Predicate::Eq { value, .. } => actual == *value,
            Predicate::Neq { value, .. } => actual != *value,
            Predicate::In { values, .. } => values.iter().any(|v| *v == actual),
        }
    }
}

impl fmt::Display for Predicate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Predicate::Eq { column, value } => write!(f, "{}=eq.{}", column, value),
            Predicate::Neq { column, value } => write!(f, "{}=neq.{}", column, value),
            Predicate::In { column, values } => write!(f, "{}=in.({})", column, values.join(",")),
        }
    }
}

fn scalar_text(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

/// One (table, event, predicate) watch handed to the transport.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct WatchFilter {
    pub table: Table,
    pub event: EventFilter,
    pub predicate: Option<Predicate>,
}

impl WatchFilter {
    /// Watch every event on a table.
    pub fn table(table: Table) -> Self {
        Self {
            table,
            event: EventFilter::Any,
            predicate: None,
        }
    }

    /// Restricts the watch to one event kind.
    pub fn on(mut self, event: EventFilter) -> Self {
        self.event = event;
        self
    }

    /// Adds a row predicate.
    pub fn filter(mut self, predicate: Predicate) -> Self {
        self.predicate = Some(predicate);
        self
    }

    /// Whether a raw change passes this watch.
    pub fn matches(&self, change: &RawChange) -> bool {
        if self.table != change.table || !self.event.accepts(change.kind) {
            return false;
        }
        match &self.predicate {
            None => true,
            // Deletes only carry the old row.
            Some(p) => change.new.as_ref().map_or(false, |r| p.matches(r))
                || change.old.as_ref().map_or(false, |r| p.matches(r)),
        }
    }
}

/// Status signal exposed to callers.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionStatus {
    #[default]
    Disconnected,
    Connecting,
    Connected,
    Error,
}

impl fmt::Display for ConnectionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ConnectionStatus::Disconnected => "disconnected",
            ConnectionStatus::Connecting => "connecting",
            ConnectionStatus::Connected => "connected",
            ConnectionStatus::Error => "error",
        };
        f.write_str(s)
    }
}

/// Ways a transport connection can fail.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum FailureKind {
    Closed,
    TimedOut,
    ChannelError,
}

impl FailureKind {
    /// Status shown while recovering from this failure.
    pub fn status(&self) -> ConnectionStatus {
        match self {
            FailureKind::ChannelError => ConnectionStatus::Error,
            FailureKind::Closed | FailureKind::TimedOut => ConnectionStatus::Disconnected,
        }
    }
}

/// Status reported by a transport connection.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TransportStatus {
    Subscribed,
    Failed(FailureKind),
}

/// Undecoded change as it arrives from the feed.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RawChange {
    pub table: Table,
    pub kind: EventKind,
    pub old: Option<Value>,
    pub new: Option<Value>,
}

impl RawChange {
    /// An INSERT carrying the new row.
    pub fn insert(table: Table, new: Value) -> Self {
        Self {
            table,
            kind: EventKind::Insert,
            old: None,
            new: Some(new),
        }
    }

    /// An UPDATE carrying old and new rows.
    pub fn update(table: Table, old: Value, new: Value) -> Self {
        Self {
            table,
            kind: EventKind::Update,
            old: Some(old),
            new: Some(new),
        }
    }

    /// A DELETE carrying the old row.
    pub fn delete(table: Table, old: Value) -> Self {
        Self {
            table,
            kind: EventKind::Delete,
            old: Some(old),
            new: None,
        }
    }
}

// --- Rows ---

/// Row of the `swarms` table.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SwarmRow {
    pub id: String,
    #[serde(default)]
    pub user_id: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    pub status: String,
    #[serde(default)]
    pub updated_at: Option<String>,
}

/// Row of the `agents` table.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AgentRow {
    pub id: String,
    #[serde(default)]
    pub user_id: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub role: Option<String>,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub framework: Option<String>,
}

/// Membership of an agent inside a swarm.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SwarmAgentRow {
    #[serde(default)]
    pub id: Option<String>,
    pub swarm_id: String,
    pub agent_id: String,
    #[serde(default)]
    pub added_at: Option<String>,
}

/// Row of the `messages` table.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct MessageRow {
    pub id: String,
    pub swarm_id: String,
    #[serde(default)]
    pub sender_type: Option<String>,
    #[serde(default)]
    pub sender_id: Option<String>,
    #[serde(default)]
    pub content: String,
    #[serde(default)]
    pub created_at: Option<String>,
}

/// Row of the `swarm_actions` table.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SwarmActionRow {
    pub id: String,
    pub swarm_id: String,
    #[serde(default)]
    pub action_type: Option<String>,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub created_at: Option<String>,
}

/// Old image that carries fewer columns than the full row, usually just
/// the primary key.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct KeyRow {
    #[serde(skip)]
    pub table: Table,
    #[serde(flatten)]
    pub columns: Map<String, Value>,
}

/// A decoded row, tagged by the table it belongs to.
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(untagged)]
pub enum Row {
    Swarm(SwarmRow),
    Agent(AgentRow),
    SwarmAgent(SwarmAgentRow),
    Message(MessageRow),
    SwarmAction(SwarmActionRow),
    Key(KeyRow),
}

impl Row {
    /// Decode a raw JSON row for `table`.
    pub fn decode(table: Table, value: Value) -> Result<Self> {
        let invalid = |e: serde_json::Error| RealtimeError::InvalidPayload {
            table,
            reason: e.to_string(),
        };
        let row = match table {
            Table::Swarms => Row::Swarm(serde_json::from_value(value).map_err(invalid)?),
            Table::Agents => Row::Agent(serde_json::from_value(value).map_err(invalid)?),
            Table::SwarmAgents => Row::SwarmAgent(serde_json::from_value(value).map_err(invalid)?),
            Table::Messages => Row::Message(serde_json::from_value(value).map_err(invalid)?),
            Table::SwarmActions => {
                Row::SwarmAction(serde_json::from_value(value).map_err(invalid)?)
            }
        };
        Ok(row)
    }

    /// Decode an old image. Feeds send only the primary key unless the
    /// table publishes full old rows, so a row that does not fit the full
    /// shape is kept as a [`KeyRow`] as long as its key is present.
    pub fn decode_old(table: Table, value: Value) -> Result<Self> {
        let full_err = match Row::decode(table, value.clone()) {
            Ok(row) => return Ok(row),
            Err(e) => e,
        };
        let Value::Object(columns) = value else {
            return Err(full_err);
        };

        let has = |column: &str| columns.get(column).and_then(scalar_text).is_some();
        let keyed = has("id") || (table == Table::SwarmAgents && has("swarm_id") && has("agent_id"));
        if !keyed {
            return Err(full_err);
        }
        Ok(Row::Key(KeyRow { table, columns }))
    }

    /// Table the row belongs to.
    pub fn table(&self) -> Table {
        match self {
            Row::Swarm(_) => Table::Swarms,
            Row::Agent(_) => Table::Agents,
            Row::SwarmAgent(_) => Table::SwarmAgents,
            Row::Message(_) => Table::Messages,
            Row::SwarmAction(_) => Table::SwarmActions,
            Row::Key(r) => r.table,
        }
    }

    /// Whether only part of the row's columns are known.
    pub fn is_partial(&self) -> bool {
        matches!(self, Row::Key(_))
    }

    /// Primary key. Memberships without an id are keyed by `swarm_id:agent_id`.
    pub fn id(&self) -> String {
        match self {
            Row::Swarm(r) => r.id.clone(),
            Row::Agent(r) => r.id.clone(),
            Row::SwarmAgent(r) => r
                .id
                .clone()
                .unwrap_or_else(|| format!("{}:{}", r.swarm_id, r.agent_id)),
            Row::Message(r) => r.id.clone(),
            Row::SwarmAction(r) => r.id.clone(),
            Row::Key(r) => {
                let column = |name: &str| r.columns.get(name).and_then(scalar_text);
                column("id")
                    .or_else(|| Some(format!("{}:{}", column("swarm_id")?, column("agent_id")?)))
                    .unwrap_or_default()
            }
        }
    }

    /// Scalar field by column name, as text.
    pub fn text_field(&self, name: &str) -> Option<String> {
        if let Row::Key(r) = self {
            return r.columns.get(name).and_then(scalar_text);
        }
        let value = serde_json::to_value(self).ok()?;
        value.get(name).and_then(scalar_text)
    }
}

/// A validated change event.
#[derive(Clone, Debug, PartialEq)]
pub struct ChangeEvent {
    pub table: Table,
    pub kind: EventKind,
    pub before: Option<Row>,
    pub after: Option<Row>,
}

impl ChangeEvent {
    /// Decode and validate a raw change at the transport boundary.
    pub fn from_raw(raw: RawChange) -> Result<Self> {
        let table = raw.table;
        let missing = |what: &str| RealtimeError::InvalidPayload {
            table,
            reason: format!("{:?} event without {} row", raw.kind, what),
        };

        let (needs_old, needs_new) = match raw.kind {
            EventKind::Insert => (false, true),
            EventKind::Update => (true, true),
            EventKind::Delete => (true, false),
        };
        if needs_old && raw.old.is_none() {
            return Err(missing("old"));
        }
        if needs_new && raw.new.is_none() {
            return Err(missing("new"));
        }

        // Inserts and deletes only keep the side that exists.
        let before = match raw.old {
            Some(v) if needs_old => Some(Row::decode_old(table, v)?),
            _ => None,
        };
        let after = match raw.new {
            Some(v) if needs_new => Some(Row::decode(table, v)?),
            _ => None,
        };

        Ok(Self {
            table,
            kind: raw.kind,
            before,
            after,
        })
    }

    /// The row that identifies this event (`after`, or `before` for deletes).
    pub fn row(&self) -> Option<&Row> {
        self.after.as_ref().or(self.before.as_ref())
    }
}

/// Last observed change of a watched status field.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StatusTransition {
    pub entity_id: String,
    pub previous: String,
    pub current: String,
}

/// A child entity that joined a parent, after enrichment.
#[derive(Clone, Debug, PartialEq)]
pub struct ChildAdded {
    pub parent_id: String,
    pub child: Row,
}

/// A child entity that left a parent.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ChildRemoved {
    pub parent_id: String,
    pub child_id: String,
}

/// Severity of a user notification.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationKind {
    Info,
    Error,
}

/// User-facing notification.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Notification {
    pub kind: NotificationKind,
    pub title: String,
    pub body: String,
}
