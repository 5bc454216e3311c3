use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use async_trait::async_trait;
use parking_lot::Mutex;

use super::history::HistoryStore;
use crate::error::{CoreError, Result};
use crate::models::{HistoryKey, Message};

/// Process-local history storage. Also lets callers simulate an
/// unavailable backend.
#[derive(Debug, Default)]
pub struct MemoryHistoryStore {
    histories: Mutex<HashMap<HistoryKey, Vec<Message>>>,
    saves: AtomicUsize,
    fail_fetch: AtomicBool,
    fail_save: AtomicBool,
}

impl MemoryHistoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replaces a history as if another process had written it.
    pub fn put(&self, key: HistoryKey, history: Vec<Message>) {
        self.histories.lock().insert(key, history);
    }

    pub fn get(&self, key: &HistoryKey) -> Option<Vec<Message>> {
        self.histories.lock().get(key).cloned()
    }

    pub fn save_count(&self) -> usize {
        self.saves.load(Ordering::SeqCst)
    }

    pub fn set_fail_fetch(&self, fail: bool) {
        self.fail_fetch.store(fail, Ordering::SeqCst);
    }

    pub fn set_fail_save(&self, fail: bool) {
        self.fail_save.store(fail, Ordering::SeqCst);
    }
}

#[async_trait]
impl HistoryStore for MemoryHistoryStore {
    async fn fetch(&self, key: &HistoryKey) -> Result<Vec<Message>> {
        if self.fail_fetch.load(Ordering::SeqCst) {
            return Err(CoreError::HistoryFetch("store unavailable".into()));
        }
        Ok(self.get(key).unwrap_or_default())
    }

    async fn save(&self, key: &HistoryKey, history: &[Message]) -> Result<()> {
        if key.is_ephemeral() {
            return Err(CoreError::EphemeralTopic(key.topic_id.clone()));
        }
        if self.fail_save.load(Ordering::SeqCst) {
            return Err(CoreError::HistorySave("store unavailable".into()));
        }
        self.saves.fetch_add(1, Ordering::SeqCst);
        self.put(key.clone(), history.to_vec());
        Ok(())
    }
}
