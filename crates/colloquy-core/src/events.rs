#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NoticeLevel {
    Info,
    Warning,
    Error,
}

/// Events the core pushes to the host application.
#[derive(Debug, Clone)]
pub enum CoreEvent {
    /// A stream was committed to its history.
    StreamFinalized {
        message_id: String,
        finish_reason: String,
    },
    /// Transient notification the UI should show (toast / status line)
    Notification { level: NoticeLevel, text: String },
}

impl CoreEvent {
    pub fn error(text: impl Into<String>) -> Self {
        Self::Notification {
            level: NoticeLevel::Error,
            text: text.into(),
        }
    }
}
