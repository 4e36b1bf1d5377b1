use std::collections::BTreeMap;
use std::sync::{Arc, PoisonError, RwLock};

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::table::TableName;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FeedState {
    Connecting,
    Live,
    Reconnecting,
    Stopped,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FeedStatus {
    pub state: FeedState,
    pub reconnects: u64,
    pub events: u64,
    pub since: DateTime<Utc>,
}

/// Per-table feed health shared between the adapter tasks and readers.
#[derive(Debug, Clone, Default)]
pub struct FeedStatusBoard {
    inner: Arc<RwLock<BTreeMap<TableName, FeedStatus>>>,
}

impl FeedStatusBoard {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_state(&self, table: TableName, state: FeedState) {
        let mut map = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        let now = Utc::now();
        let entry = map.entry(table).or_insert(FeedStatus {
            state,
            reconnects: 0,
            events: 0,
            since: now,
        });
        if entry.state != state {
            if state == FeedState::Reconnecting {
                entry.reconnects += 1;
            }
            entry.state = state;
            entry.since = now;
        }
    }

    pub fn record_event(&self, table: TableName) {
        let mut map = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        if let Some(entry) = map.get_mut(&table) {
            entry.events += 1;
        }
    }

    pub fn get(&self, table: TableName) -> Option<FeedStatus> {
        self.inner
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&table)
            .cloned()
    }

    pub fn snapshot(&self) -> BTreeMap<TableName, FeedStatus> {
        self.inner
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}
