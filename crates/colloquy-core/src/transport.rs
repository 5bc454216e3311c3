use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::constants::{DEFAULT_MODEL, DEFAULT_TEMPERATURE, FINISH_COMPLETED};
use crate::content::{turn_depth, ContentPipeline};
use crate::error::Result;
use crate::models::{DeliveryContext, Message, MessageContent, Role};

/// One entry of the conversation sent to the model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: MessageContent,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelConfig {
    pub model: String,
    pub temperature: f32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub top_p: Option<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub top_k: Option<u32>,
    pub stream: bool,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            model: DEFAULT_MODEL.to_string(),
            temperature: DEFAULT_TEMPERATURE,
            max_tokens: None,
            top_p: None,
            top_k: None,
            stream: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatRequest {
    pub endpoint: String,
    pub api_key: String,
    pub messages: Vec<ChatMessage>,
    pub model: ModelConfig,
    /// Id of the assistant message the reply streams into
    pub message_id: String,
    pub context: DeliveryContext,
}

impl ChatRequest {
    /// Builds a request from a conversation history. Thinking placeholders
    /// and the reply's own message are left out; context rules are applied
    /// to every text entry at its turn depth.
    pub fn from_history(
        endpoint: impl Into<String>,
        api_key: impl Into<String>,
        history: &[Message],
        pipeline: &ContentPipeline,
        model: ModelConfig,
        message_id: impl Into<String>,
        context: DeliveryContext,
    ) -> Self {
        let message_id = message_id.into();
        let messages = history
            .iter()
            .filter(|m| !m.is_thinking && m.id != message_id)
            .map(|m| {
                let content = match m.content.text() {
                    Some(text) => MessageContent::Text(pipeline.for_context(
                        text,
                        m.role,
                        turn_depth(history, &m.id),
                    )),
                    None => m.content.clone(),
                };
                ChatMessage {
                    role: m.role,
                    content,
                }
            })
            .collect();
        Self {
            endpoint: endpoint.into(),
            api_key: api_key.into(),
            messages,
            model,
            message_id,
            context,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ChoiceMessage {
    #[serde(default)]
    pub content: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Choice {
    #[serde(default)]
    pub index: u32,
    #[serde(default)]
    pub message: ChoiceMessage,
    #[serde(default)]
    pub finish_reason: Option<String>,
}

impl Choice {
    pub fn finish_reason(&self) -> &str {
        self.finish_reason.as_deref().unwrap_or(FINISH_COMPLETED)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ChatResponse {
    /// Chunks will arrive as stream events.
    StreamingStarted,
    /// Whole reply in one response.
    Choices(Vec<Choice>),
}

/// Chat backend. Implementations own connection handling and timeouts.
#[async_trait]
pub trait ChatTransport: Send + Sync {
    async fn send_chat_request(&self, request: ChatRequest) -> Result<ChatResponse>;

    /// Asks the backend to stop producing the reply for `message_id`.
    async fn interrupt(&self, message_id: &str) -> Result<()>;
}
