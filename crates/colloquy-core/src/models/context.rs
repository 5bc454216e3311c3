use serde::{Deserialize, Serialize};

use crate::constants::EPHEMERAL_TOPIC_PREFIXES;
use crate::error::{CoreError, Result};

/// Owner of a conversation history: a single agent or a group.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Owner {
    Agent(String),
    Group(String),
}

impl Owner {
    pub fn id(&self) -> &str {
        match self {
            Owner::Agent(id) | Owner::Group(id) => id,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Owner::Agent(_) => "agent",
            Owner::Group(_) => "group",
        }
    }
}

/// Identifies one persisted history list.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct HistoryKey {
    pub owner: Owner,
    pub topic_id: String,
}

impl HistoryKey {
    pub fn new(owner: Owner, topic_id: impl Into<String>) -> Self {
        Self {
            owner,
            topic_id: topic_id.into(),
        }
    }

    pub fn is_ephemeral(&self) -> bool {
        is_ephemeral_topic(&self.topic_id)
    }
}

pub fn is_ephemeral_topic(topic_id: &str) -> bool {
    EPHEMERAL_TOPIC_PREFIXES
        .iter()
        .any(|prefix| topic_id.starts_with(prefix))
}

/// Where a streamed message belongs, plus the display metadata the
/// transport sends along with it.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct DeliveryContext {
    pub agent_id: Option<String>,
    pub group_id: Option<String>,
    pub topic_id: String,
    pub is_group_message: bool,
    pub agent_name: Option<String>,
    pub avatar_url: Option<String>,
    pub avatar_color: Option<String>,
}

impl DeliveryContext {
    pub fn agent(agent_id: impl Into<String>, topic_id: impl Into<String>) -> Self {
        Self {
            agent_id: Some(agent_id.into()),
            topic_id: topic_id.into(),
            ..Default::default()
        }
    }

    pub fn group(
        group_id: impl Into<String>,
        topic_id: impl Into<String>,
        speaker_id: impl Into<String>,
    ) -> Self {
        Self {
            group_id: Some(group_id.into()),
            agent_id: Some(speaker_id.into()),
            topic_id: topic_id.into(),
            is_group_message: true,
            ..Default::default()
        }
    }

    /// The group owns the history when set; `agent_id` is then only the speaker.
    pub fn owner(&self) -> Option<Owner> {
        let non_empty = |id: &Option<String>| id.as_ref().filter(|id| !id.is_empty()).cloned();
        non_empty(&self.group_id)
            .map(Owner::Group)
            .or_else(|| non_empty(&self.agent_id).map(Owner::Agent))
    }

    pub fn history_key(&self) -> Option<HistoryKey> {
        if self.topic_id.is_empty() {
            return None;
        }
        self.owner()
            .map(|owner| HistoryKey::new(owner, self.topic_id.clone()))
    }

    pub fn validate(&self) -> Result<HistoryKey> {
        if self.topic_id.trim().is_empty() {
            return Err(CoreError::InvalidContext("missing topic id".into()));
        }
        self.history_key()
            .ok_or_else(|| CoreError::InvalidContext("missing agent or group id".into()))
    }

    pub fn is_ephemeral(&self) -> bool {
        is_ephemeral_topic(&self.topic_id)
    }
}

/// The conversation currently on screen, as reported by the host.
#[derive(Debug, Clone, PartialEq)]
pub struct ActiveSelection {
    pub owner: Owner,
    pub topic_id: String,
    pub name: Option<String>,
    pub avatar_url: Option<String>,
    pub avatar_color: Option<String>,
}

impl ActiveSelection {
    pub fn new(owner: Owner, topic_id: impl Into<String>) -> Self {
        Self {
            owner,
            topic_id: topic_id.into(),
            name: None,
            avatar_url: None,
            avatar_color: None,
        }
    }

    pub fn matches(&self, owner: &Owner, topic_id: &str) -> bool {
        &self.owner == owner && self.topic_id == topic_id
    }

    pub fn matches_context(&self, context: &DeliveryContext) -> bool {
        match context.owner() {
            Some(owner) => self.matches(&owner, &context.topic_id),
            None => false,
        }
    }
}
