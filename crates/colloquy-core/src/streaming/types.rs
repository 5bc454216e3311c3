use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::constants::{CHUNK_PARSE_ERROR_MARKER, FINISH_COMPLETED};
use crate::models::DeliveryContext;

/// The text-bearing shapes a streamed chunk arrives in.
#[derive(Debug, Clone, PartialEq)]
pub enum ChunkPayload {
    /// Bare string
    Text(String),
    /// `{ "content": "..." }`
    Content(String),
    /// OpenAI-style `{ "choices": [{ "delta": { "content": ... } }] }` or a
    /// top level `{ "delta": { "content": ... } }`
    Delta(String),
    /// Body the transport could not parse, passed through verbatim.
    Raw { raw: String, error: bool },
    Empty,
}

impl ChunkPayload {
    pub fn from_value(value: &Value) -> Self {
        if let Some(text) = value
            .pointer("/choices/0/delta/content")
            .and_then(Value::as_str)
        {
            return ChunkPayload::Delta(text.to_string());
        }
        if let Some(text) = value.pointer("/delta/content").and_then(Value::as_str) {
            return ChunkPayload::Delta(text.to_string());
        }
        if let Some(text) = value.get("content").and_then(Value::as_str) {
            return ChunkPayload::Content(text.to_string());
        }
        if let Some(text) = value.as_str() {
            return ChunkPayload::Text(text.to_string());
        }
        if let Some(raw) = value.get("raw").and_then(Value::as_str) {
            let error = value
                .get("error")
                .map(|e| !e.is_null() && e != &Value::Bool(false))
                .unwrap_or(false);
            return ChunkPayload::Raw {
                raw: raw.to_string(),
                error,
            };
        }
        ChunkPayload::Empty
    }

    /// Text to append; a raw chunk with an error gets an inline marker.
    pub fn text(&self) -> String {
        match self {
            ChunkPayload::Text(text) | ChunkPayload::Content(text) | ChunkPayload::Delta(text) => {
                text.clone()
            }
            ChunkPayload::Raw { raw, error: true } => format!("{}{}", raw, CHUNK_PARSE_ERROR_MARKER),
            ChunkPayload::Raw { raw, error: false } => raw.clone(),
            ChunkPayload::Empty => String::new(),
        }
    }
}

impl From<&str> for ChunkPayload {
    fn from(text: &str) -> Self {
        ChunkPayload::Text(text.to_string())
    }
}

impl From<&Value> for ChunkPayload {
    fn from(value: &Value) -> Self {
        ChunkPayload::from_value(value)
    }
}

pub fn normalize_chunk(value: &Value) -> String {
    ChunkPayload::from_value(value).text()
}

fn default_finish_reason() -> String {
    FINISH_COMPLETED.to_string()
}

/// Out-of-band stream events as delivered by the transport.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StreamEvent {
    /// Group member is composing; shown as a thinking bubble in the current view.
    AgentThinking {
        #[serde(rename = "messageId")]
        message_id: String,
        #[serde(default)]
        context: Option<DeliveryContext>,
    },
    Start {
        #[serde(rename = "messageId")]
        message_id: String,
        #[serde(default)]
        context: Option<DeliveryContext>,
        #[serde(default)]
        timestamp: Option<i64>,
    },
    Data {
        #[serde(rename = "messageId")]
        message_id: String,
        #[serde(default)]
        chunk: Value,
        #[serde(default)]
        context: Option<DeliveryContext>,
    },
    End {
        #[serde(rename = "messageId")]
        message_id: String,
        #[serde(default = "default_finish_reason")]
        finish_reason: String,
        #[serde(default)]
        context: Option<DeliveryContext>,
    },
    Error {
        #[serde(rename = "messageId")]
        message_id: String,
        #[serde(default)]
        error: String,
        #[serde(default)]
        context: Option<DeliveryContext>,
    },
    RemoveMessage {
        #[serde(rename = "messageId")]
        message_id: String,
        #[serde(default)]
        context: Option<DeliveryContext>,
    },
}

impl StreamEvent {
    pub fn message_id(&self) -> &str {
        match self {
            StreamEvent::AgentThinking { message_id, .. }
            | StreamEvent::Start { message_id, .. }
            | StreamEvent::Data { message_id, .. }
            | StreamEvent::End { message_id, .. }
            | StreamEvent::Error { message_id, .. }
            | StreamEvent::RemoveMessage { message_id, .. } => message_id,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_chunk_shapes() {
        assert_eq!(normalize_chunk(&json!("plain")), "plain");
        assert_eq!(normalize_chunk(&json!({"content": "c"})), "c");
        assert_eq!(
            normalize_chunk(&json!({"choices": [{"delta": {"content": "d"}}]})),
            "d"
        );
        assert_eq!(normalize_chunk(&json!({"delta": {"content": "top"}})), "top");
    }

    #[test]
    fn test_delta_wins_over_content() {
        let chunk = json!({"choices": [{"delta": {"content": "delta"}}], "content": "flat"});
        assert_eq!(ChunkPayload::from_value(&chunk), ChunkPayload::Delta("delta".into()));
    }

    #[test]
    fn test_raw_fallback_with_error_marker() {
        assert_eq!(
            normalize_chunk(&json!({"raw": "data: {oops", "error": "bad json"})),
            "data: {oops (parse error)"
        );
        assert_eq!(normalize_chunk(&json!({"raw": "ok"})), "ok");
    }

    #[test]
    fn test_non_text_chunks_are_empty() {
        assert_eq!(normalize_chunk(&json!({"choices": [{"delta": {}}]})), "");
        assert_eq!(normalize_chunk(&json!(null)), "");
        assert_eq!(normalize_chunk(&json!(42)), "");
    }

    #[test]
    fn test_stream_event_parsing() {
        let end: StreamEvent = serde_json::from_value(json!({
            "type": "end", "messageId": "m1",
            "context": {"agentId": "a1", "topicId": "t1"}
        }))
        .unwrap();
        match end {
            StreamEvent::End { finish_reason, context, .. } => {
                assert_eq!(finish_reason, "completed");
                assert_eq!(context.unwrap().topic_id, "t1");
            }
            other => panic!("unexpected event {:?}", other),
        }

        let data: StreamEvent = serde_json::from_value(json!({
            "type": "data", "messageId": "m1", "chunk": {"content": "x"}
        }))
        .unwrap();
        assert_eq!(data.message_id(), "m1");
    }
}
