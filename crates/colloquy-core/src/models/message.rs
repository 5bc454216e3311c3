use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::{Map, Value};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
    System,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::User => "user",
            Role::Assistant => "assistant",
            Role::System => "system",
        }
    }
}

/// Message body as stored in history files: either a bare string or a
/// `{ "text": ... }` wrapper. Anything else is kept verbatim so it survives
/// a fetch/save round trip.
#[derive(Debug, Clone, PartialEq)]
pub enum MessageContent {
    Text(String),
    Wrapped { text: String },
    Other(Value),
}

impl MessageContent {
    /// Renderable text, `None` for unrecognised shapes.
    pub fn text(&self) -> Option<&str> {
        match self {
            MessageContent::Text(text) | MessageContent::Wrapped { text } => Some(text),
            MessageContent::Other(_) => None,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.text().map(str::is_empty).unwrap_or(false)
    }
}

impl Default for MessageContent {
    fn default() -> Self {
        MessageContent::Text(String::new())
    }
}

impl From<&str> for MessageContent {
    fn from(text: &str) -> Self {
        MessageContent::Text(text.to_string())
    }
}

impl From<String> for MessageContent {
    fn from(text: String) -> Self {
        MessageContent::Text(text)
    }
}

impl Serialize for MessageContent {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            MessageContent::Text(text) => serializer.serialize_str(text),
            MessageContent::Wrapped { text } => {
                let mut map = Map::new();
                map.insert("text".to_string(), Value::String(text.clone()));
                Value::Object(map).serialize(serializer)
            }
            MessageContent::Other(value) => value.serialize(serializer),
        }
    }
}

impl<'de> Deserialize<'de> for MessageContent {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let value = Value::deserialize(deserializer)?;
        Ok(match value {
            Value::Null => MessageContent::default(),
            Value::String(text) => MessageContent::Text(text),
            Value::Object(ref map) => match map.get("text") {
                Some(Value::String(text)) => MessageContent::Wrapped { text: text.clone() },
                _ => MessageContent::Other(value),
            },
            other => MessageContent::Other(other),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Attachment {
    /// MIME type, e.g. `image/png`
    #[serde(rename = "type", default)]
    pub mime: String,
    #[serde(default)]
    pub src: String,
    #[serde(default)]
    pub name: String,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

fn is_false(value: &bool) -> bool {
    !*value
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    #[serde(default)]
    pub id: String,
    pub role: Role,
    #[serde(default)]
    pub content: MessageContent,
    /// Milliseconds since the epoch, 0 when unknown
    #[serde(default)]
    pub timestamp: i64,
    #[serde(default, skip_serializing_if = "is_false")]
    pub is_thinking: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finish_reason: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub attachments: Vec<Attachment>,
    #[serde(default, skip_serializing_if = "is_false")]
    pub is_group_message: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub avatar_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub avatar_color: Option<String>,
    /// Fields this crate does not interpret (topic ids, host metadata).
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Message {
    pub fn new(id: impl Into<String>, role: Role, content: impl Into<MessageContent>) -> Self {
        Self {
            id: id.into(),
            role,
            content: content.into(),
            timestamp: 0,
            is_thinking: false,
            finish_reason: None,
            attachments: Vec::new(),
            is_group_message: false,
            agent_id: None,
            name: None,
            avatar_url: None,
            avatar_color: None,
            extra: Map::new(),
        }
    }

    pub fn with_timestamp(mut self, timestamp: i64) -> Self {
        self.timestamp = timestamp;
        self
    }

    pub fn text(&self) -> Option<&str> {
        self.content.text()
    }

    /// Generates an id in the host's `msg_<millis>_<random>` shape.
    pub fn generate_id() -> String {
        let millis = chrono::Utc::now().timestamp_millis();
        let random = uuid::Uuid::new_v4().simple().to_string();
        format!("msg_{}_{}", millis, &random[..8])
    }
}
