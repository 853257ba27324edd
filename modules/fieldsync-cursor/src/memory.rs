//! In-memory cursor store for tests. No database required.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::{Map, Value};

use crate::error::{CursorError, Result};
use crate::store::CursorStore;
use crate::types::Cursor;

/// Thread-safe in-memory [`CursorStore`].
///
/// Every successful `set` is also appended to a history so tests can check
/// that a cursor only ever moved forward.
#[derive(Default)]
pub struct MemoryCursorStore {
    cursors: Mutex<BTreeMap<String, Cursor>>,
    history: Mutex<Vec<Cursor>>,
    fail_sets: AtomicBool,
}

impl MemoryCursorStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent `set` fail until turned off again.
    pub fn fail_sets(&self, fail: bool) {
        self.fail_sets.store(fail, Ordering::SeqCst);
    }

    /// Every successful write in order (for test assertions).
    pub fn history(&self) -> Vec<Cursor> {
        self.history.lock().unwrap().clone()
    }

    /// Current value without creating it.
    pub fn peek(&self, name: &str) -> Option<Cursor> {
        self.cursors.lock().unwrap().get(name).cloned()
    }
}

#[async_trait]
impl CursorStore for MemoryCursorStore {
    async fn get(&self, name: &str) -> Result<Cursor> {
        let mut cursors = self.cursors.lock().unwrap();
        Ok(cursors
            .entry(name.to_string())
            .or_insert_with(|| Cursor::at_epoch(name))
            .clone())
    }

    async fn set(
        &self,
        name: &str,
        timestamp: DateTime<Utc>,
        last_key: Map<String, Value>,
    ) -> Result<()> {
        if self.fail_sets.load(Ordering::SeqCst) {
            return Err(CursorError::Unavailable(format!("write of cursor {name} refused")));
        }
        let cursor = Cursor {
            name: name.to_string(),
            last_timestamp: timestamp,
            last_key,
            updated_at: Some(Utc::now()),
        };
        self.cursors
            .lock()
            .unwrap()
            .insert(name.to_string(), cursor.clone());
        self.history.lock().unwrap().push(cursor);
        Ok(())
    }

    async fn list(&self) -> Result<Vec<Cursor>> {
        Ok(self.cursors.lock().unwrap().values().cloned().collect())
    }
}
