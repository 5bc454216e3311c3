use chrono::TimeZone;

use crate::config::GlobalSettings;
use crate::constants::{
    DEFAULT_AGENT_NAME, DEFAULT_AVATAR, DEFAULT_GROUP_MEMBER_NAME, DEFAULT_USER_AVATAR,
    DEFAULT_USER_NAME,
};
use crate::models::{ActiveSelection, Attachment, Message, Role};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Layout {
    /// Avatar, name and content bubble
    Bubble,
    /// Centered system notice without avatar
    System,
}

#[derive(Debug, Clone, PartialEq)]
pub struct AvatarNode {
    pub src: String,
    pub alt: String,
    /// Border color derived from the avatar image
    pub accent: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct NameNode {
    pub text: String,
    pub accent: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum AttachmentNode {
    Image { src: String, name: String },
    Audio { src: String, name: String },
    Video { src: String, name: String },
    File { src: String, name: String, mime: String },
}

impl AttachmentNode {
    pub fn from_attachment(attachment: &Attachment) -> Self {
        let src = attachment.src.clone();
        let name = attachment.name.clone();
        let kind = attachment.mime.split('/').next().unwrap_or_default();
        match kind {
            "image" => AttachmentNode::Image { src, name },
            "audio" => AttachmentNode::Audio { src, name },
            "video" => AttachmentNode::Video { src, name },
            _ => AttachmentNode::File {
                src,
                name,
                mime: attachment.mime.clone(),
            },
        }
    }
}

/// Display node for one message. `content_html` is the content slot.
#[derive(Debug, Clone, PartialEq)]
pub struct MessageNode {
    pub message_id: String,
    pub role: Role,
    pub layout: Layout,
    pub classes: Vec<String>,
    pub timestamp: i64,
    pub agent_id: Option<String>,
    pub avatar: Option<AvatarNode>,
    pub name: Option<NameNode>,
    pub timestamp_label: Option<String>,
    pub content_html: String,
    pub attachments: Vec<AttachmentNode>,
    pub streaming: bool,
}

impl MessageNode {
    pub fn has_class(&self, class: &str) -> bool {
        self.classes.iter().any(|c| c == class)
    }
}

/// Local `HH:MM` label for a millisecond timestamp.
pub fn timestamp_label(timestamp: i64) -> Option<String> {
    if timestamp <= 0 {
        return None;
    }
    chrono::Local
        .timestamp_millis_opt(timestamp)
        .single()
        .map(|time| time.format("%H:%M").to_string())
}

fn non_empty(value: Option<&String>) -> Option<String> {
    value.filter(|v| !v.is_empty()).cloned()
}

/// Builds the empty node for `message`. Pure: same inputs, same node.
pub fn build_skeleton(
    message: &Message,
    settings: &GlobalSettings,
    selection: Option<&ActiveSelection>,
) -> MessageNode {
    let mut classes = vec!["message-item".to_string(), message.role.as_str().to_string()];
    if message.is_group_message {
        classes.push("group-message-item".to_string());
    }
    if message.is_thinking {
        classes.push("thinking".to_string());
    }

    let (layout, avatar, name) = match message.role {
        Role::System => (Layout::System, None, None),
        Role::User => {
            let name = non_empty(message.name.as_ref())
                .or_else(|| non_empty(Some(&settings.user_name)))
                .unwrap_or_else(|| DEFAULT_USER_NAME.to_string());
            let accent = settings.user_avatar_calculated_color.clone();
            let avatar = AvatarNode {
                src: non_empty(settings.user_avatar_url.as_ref())
                    .unwrap_or_else(|| DEFAULT_USER_AVATAR.to_string()),
                alt: name.clone(),
                accent: accent.clone(),
            };
            (Layout::Bubble, Some(avatar), Some(NameNode { text: name, accent }))
        }
        Role::Assistant if message.is_group_message => {
            let name = non_empty(message.name.as_ref())
                .unwrap_or_else(|| DEFAULT_GROUP_MEMBER_NAME.to_string());
            let accent = message.avatar_color.clone();
            let avatar = AvatarNode {
                src: non_empty(message.avatar_url.as_ref())
                    .unwrap_or_else(|| DEFAULT_AVATAR.to_string()),
                alt: name.clone(),
                accent: accent.clone(),
            };
            (Layout::Bubble, Some(avatar), Some(NameNode { text: name, accent }))
        }
        Role::Assistant => {
            let name = selection
                .and_then(|s| non_empty(s.name.as_ref()))
                .unwrap_or_else(|| DEFAULT_AGENT_NAME.to_string());
            let accent = selection.and_then(|s| s.avatar_color.clone());
            let avatar = AvatarNode {
                src: selection
                    .and_then(|s| non_empty(s.avatar_url.as_ref()))
                    .unwrap_or_else(|| DEFAULT_AVATAR.to_string()),
                alt: name.clone(),
                accent: accent.clone(),
            };
            (Layout::Bubble, Some(avatar), Some(NameNode { text: name, accent }))
        }
    };

    let timestamp_label = if message.is_thinking || layout == Layout::System {
        None
    } else {
        timestamp_label(message.timestamp)
    };

    MessageNode {
        message_id: message.id.clone(),
        role: message.role,
        layout,
        classes,
        timestamp: message.timestamp,
        agent_id: message.agent_id.clone(),
        avatar,
        name,
        timestamp_label,
        content_html: String::new(),
        attachments: message
            .attachments
            .iter()
            .map(AttachmentNode::from_attachment)
            .collect(),
        streaming: false,
    }
}
