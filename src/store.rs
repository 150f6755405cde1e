//! Local entity store and id lookups.

use crate::error::Result;
use crate::types::{ChangeEvent, EventKind, Row, Table};
use parking_lot::RwLock;
use std::collections::HashMap;

/// Cache that mirrors the rows a subscription watches.
pub trait EntityStore: Send + Sync {
    fn apply_change(&self, event: &ChangeEvent);
}

/// Fetch a full entity by id (used to enrich membership inserts).
pub trait EntityLookup: Send + Sync {
    fn fetch_by_id(&self, table: Table, id: &str) -> Result<Option<Row>>;
}

/// In-memory rows keyed by table and id.
#[derive(Debug, Default)]
pub struct MemoryStore {
    tables: RwLock<HashMap<Table, HashMap<String, Row>>>,
}

impl MemoryStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace a row.
    pub fn put(&self, row: Row) {
        self.tables
            .write()
            .entry(row.table())
            .or_default()
            .insert(row.id(), row);
    }

    /// Removes a row by id, returning it.
    pub fn remove(&self, table: Table, id: &str) -> Option<Row> {
        self.tables.write().get_mut(&table)?.remove(id)
    }

    /// Looks up a row by id.
    pub fn get(&self, table: Table, id: &str) -> Option<Row> {
        self.tables.read().get(&table)?.get(id).cloned()
    }

    /// All rows of a table, ordered by id.
    pub fn rows(&self, table: Table) -> Vec<Row> {
        let tables = self.tables.read();
        let mut rows: Vec<Row> = tables
            .get(&table)
            .map(|t| t.values().cloned().collect())
            .unwrap_or_default();
        rows.sort_by_key(|r| r.id());
        rows
    }

    /// Number of rows held for `table`.
    pub fn len(&self, table: Table) -> usize {
        self.tables.read().get(&table).map_or(0, |t| t.len())
    }

    /// Whether no table holds any rows.
    pub fn is_empty(&self) -> bool {
        self.tables.read().values().all(|t| t.is_empty())
    }
}

impl EntityStore for MemoryStore {
    fn apply_change(&self, event: &ChangeEvent) {
        match event.kind {
            EventKind::Insert | EventKind::Update => {
                if let Some(row) = &event.after {
                    self.put(row.clone());
                }
            }
            EventKind::Delete => {
                if let Some(row) = &event.before {
                    self.remove(event.table, &row.id());
                }
            }
        }
    }
}

impl EntityLookup for MemoryStore {
    fn fetch_by_id(&self, table: Table, id: &str) -> Result<Option<Row>> {
        Ok(self.get(table, id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::RawChange;
    use serde_json::json;

    fn event(raw: RawChange) -> ChangeEvent {
        ChangeEvent::from_raw(raw).unwrap()
    }

    #[test]
    fn test_apply_insert_update_delete() {
        let store = MemoryStore::new();
        assert!(store.is_empty());

        store.apply_change(&event(RawChange::insert(
            Table::Swarms,
            json!({"id": "s1", "status": "draft"}),
        )));
        assert_eq!(store.len(Table::Swarms), 1);

        store.apply_change(&event(RawChange::update(
            Table::Swarms,
            json!({"id": "s1", "status": "draft"}),
            json!({"id": "s1", "status": "active"}),
        )));
        let row = store.get(Table::Swarms, "s1").unwrap();
        assert_eq!(row.text_field("status").as_deref(), Some("active"));

        store.apply_change(&event(RawChange::delete(
            Table::Swarms,
            json!({"id": "s1", "status": "active"}),
        )));
        assert!(store.get(Table::Swarms, "s1").is_none());
        assert!(store.is_empty());
    }

    #[test]
    fn test_key_only_delete_removes_row() {
        let store = MemoryStore::new();
        store.put(Row::decode(Table::Messages, json!({"id": "m1", "swarm_id": "s1"})).unwrap());

        store.apply_change(&event(RawChange::delete(Table::Messages, json!({"id": "m1"}))));
        assert!(store.get(Table::Messages, "m1").is_none());
    }

    #[test]
    fn test_lookup_and_ordering() {
        let store = MemoryStore::new();
        for id in ["a2", "a1", "a3"] {
            store.put(Row::decode(Table::Agents, json!({"id": id, "name": id})).unwrap());
        }

        let ids: Vec<String> = store.rows(Table::Agents).iter().map(|r| r.id()).collect();
        assert_eq!(ids, vec!["a1", "a2", "a3"]);

        assert!(store.fetch_by_id(Table::Agents, "a2").unwrap().is_some());
        assert!(store.fetch_by_id(Table::Agents, "zz").unwrap().is_none());
        assert!(store.fetch_by_id(Table::Swarms, "a2").unwrap().is_none());
    }
}
