use thiserror::Error;

pub type Result<T> = std::result::Result<T, CoreError>;

#[derive(Debug, Error)]
pub enum CoreError {
    #[error("Invalid delivery context: {0}")]
    InvalidContext(String),

    #[error("Message {message_id} not found in history of topic {topic_id}")]
    MessageNotFound { message_id: String, topic_id: String },

    #[error("Stream {0} is already finalized")]
    StreamClosed(String),

    #[error("Topic {0} is ephemeral and is never persisted")]
    EphemeralTopic(String),

    #[error("Failed to fetch history: {0}")]
    HistoryFetch(String),

    #[error("Failed to save history: {0}")]
    HistorySave(String),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Invalid regex rule '{title}': {reason}")]
    InvalidRule { title: String, reason: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}
