use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tracing::debug;
use uuid::Uuid;

use super::history::HistoryStore;
use crate::constants::{HISTORY_FILE_NAME, TOPICS_DIR};
use crate::error::{CoreError, Result};
use crate::models::{HistoryKey, Message};

/// History files laid out as `<data_dir>/<owner>/topics/<topic>/history.json`.
#[derive(Debug, Clone)]
pub struct JsonHistoryStore {
    root: PathBuf,
}

impl JsonHistoryStore {
    pub fn new<P: AsRef<Path>>(root: P) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
        }
    }

    pub fn history_path(&self, key: &HistoryKey) -> Result<PathBuf> {
        check_segment(key.owner.id())?;
        check_segment(&key.topic_id)?;
        Ok(self
            .root
            .join(key.owner.id())
            .join(TOPICS_DIR)
            .join(&key.topic_id)
            .join(HISTORY_FILE_NAME))
    }
}

/// Ids become path segments; anything that could escape the data dir is
/// rejected.
fn check_segment(segment: &str) -> Result<()> {
    let unsafe_segment = segment.is_empty()
        || segment == "."
        || segment == ".."
        || segment.contains(['/', '\\', '\0']);
    if unsafe_segment {
        return Err(CoreError::InvalidContext(format!(
            "'{}' is not a valid storage id",
            segment
        )));
    }
    Ok(())
}

#[async_trait]
impl HistoryStore for JsonHistoryStore {
    async fn fetch(&self, key: &HistoryKey) -> Result<Vec<Message>> {
        let path = self.history_path(key)?;
        match tokio::fs::read_to_string(&path).await {
            Ok(contents) if contents.trim().is_empty() => Ok(Vec::new()),
            Ok(contents) => Ok(serde_json::from_str(&contents)?),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!("No history file at {}", path.display());
                Ok(Vec::new())
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn save(&self, key: &HistoryKey, history: &[Message]) -> Result<()> {
        if key.is_ephemeral() {
            return Err(CoreError::EphemeralTopic(key.topic_id.clone()));
        }
        let path = self.history_path(key)?;
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let json = serde_json::to_string_pretty(history)?;
        // one temp file per save; concurrent saves of a topic must not share it
        let tmp = path.with_extension(format!("json.{}.tmp", Uuid::new_v4().simple()));
        if let Err(e) = tokio::fs::write(&tmp, json).await {
            let _ = tokio::fs::remove_file(&tmp).await;
            return Err(e.into());
        }
        tokio::fs::rename(&tmp, &path).await?;
        debug!("Saved {} messages to {}", history.len(), path.display());
        Ok(())
    }
}
