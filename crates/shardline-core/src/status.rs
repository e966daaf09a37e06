//! Per-table load status for readiness reporting

use std::collections::HashMap;

use parking_lot::RwLock;
use serde::Serialize;

/// Load state of one table
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum TableStatus {
    #[default]
    NotSet,
    Loading,
    Serving,
}

/// Tracks table status independently of the published view
#[derive(Debug, Default)]
pub struct StatusTracker {
    tables: RwLock<HashMap<String, TableStatus>>,
}

impl StatusTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, table: &str, status: TableStatus) {
        self.tables.write().insert(table.to_string(), status);
    }

    pub fn get(&self, table: &str) -> TableStatus {
        self.tables.read().get(table).copied().unwrap_or_default()
    }

    pub fn remove(&self, table: &str) {
        self.tables.write().remove(table);
    }

    pub fn clear(&self) {
        self.tables.write().clear();
    }

    /// True iff no table is currently loading
    pub fn is_serving(&self) -> bool {
        !self
            .tables
            .read()
            .values()
            .any(|s| *s == TableStatus::Loading)
    }

    /// Copy of all entries, sorted by table name
    pub fn snapshot(&self) -> Vec<(String, TableStatus)> {
        let mut entries: Vec<_> = self
            .tables
            .read()
            .iter()
            .map(|(k, v)| (k.clone(), *v))
            .collect();
        entries.sort_by(|a, b| a.0.cmp(&b.0));
        entries
    }
}
