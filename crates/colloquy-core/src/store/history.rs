use async_trait::async_trait;

use crate::error::Result;
use crate::models::{HistoryKey, Message};

/// Durable history storage owned by the host.
///
/// The core only ever fetches or replaces a whole list. `save` is never
/// called for ephemeral topics.
#[async_trait]
pub trait HistoryStore: Send + Sync {
    async fn fetch(&self, key: &HistoryKey) -> Result<Vec<Message>>;

    async fn save(&self, key: &HistoryKey, history: &[Message]) -> Result<()>;
}

/// Thinking placeholders are transient and never written.
pub fn without_thinking(history: &[Message]) -> Vec<Message> {
    history.iter().filter(|m| !m.is_thinking).cloned().collect()
}
