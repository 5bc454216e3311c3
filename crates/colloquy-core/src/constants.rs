//! Application-wide constants
//!
//! Defaults and magic strings shared between the streaming, rendering and
//! storage layers.

// Streaming defaults
/// Tick interval of the smooth-streaming pacer.
pub const DEFAULT_SMOOTH_STREAM_INTERVAL_MS: u64 = 25;
/// Minimum number of characters released per pacer tick.
pub const DEFAULT_MIN_CHUNK_BUFFER_SIZE: usize = 1;
/// Chunks held for a message whose start has not completed yet. Beyond this
/// the stream is forced into the ready phase.
pub const DEFAULT_PRE_BUFFER_LIMIT: usize = 512;
/// Queued characters above which the pacer flushes the whole backlog at once.
pub const DEFAULT_MAX_QUEUED_UNITS: usize = 1200;
/// How long finalized stream state is retained to absorb late events.
pub const DEFAULT_STREAM_RETENTION_MS: u64 = 5000;

// Finish reasons
pub const FINISH_COMPLETED: &str = "completed";
pub const FINISH_ERROR: &str = "error";
pub const FINISH_CANCELLED: &str = "cancelled";

/// Topic id prefixes of sessions that are never written to durable storage
/// (voice chat windows, transient assistant popups).
pub const EPHEMERAL_TOPIC_PREFIXES: &[&str] = &["voicechat_", "assistant_"];

// History storage layout
pub const TOPICS_DIR: &str = "topics";
pub const HISTORY_FILE_NAME: &str = "history.json";
pub const SETTINGS_FILE_NAME: &str = "settings.json";
pub const REGEX_RULES_FILE_NAME: &str = "regex_rules.json";

// Display defaults
pub const DEFAULT_USER_NAME: &str = "User";
pub const DEFAULT_AGENT_NAME: &str = "AI";
pub const DEFAULT_GROUP_MEMBER_NAME: &str = "Group member";
pub const DEFAULT_USER_AVATAR: &str = "assets/default_user_avatar.png";
pub const DEFAULT_AVATAR: &str = "assets/default_avatar.png";
pub const DEFAULT_THINKING_TEXT: &str = "Thinking";
pub const MALFORMED_CONTENT_TEXT: &str = "[malformed message content]";
/// Avatars whose file name carries this marker are placeholders and never sampled.
pub const DEFAULT_AVATAR_MARKER: &str = "default_";

/// Marker appended to raw chunks the transport failed to parse.
pub const CHUNK_PARSE_ERROR_MARKER: &str = " (parse error)";

/// Kind/id pair under which the user's avatar color is persisted.
pub const USER_COLOR_KIND: &str = "user";
pub const USER_COLOR_ID: &str = "user_global";
pub const AGENT_COLOR_KIND: &str = "agent";

// Model request defaults
pub const DEFAULT_MODEL: &str = "gemini-pro";
pub const DEFAULT_TEMPERATURE: f32 = 0.7;
