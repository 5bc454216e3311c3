use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, warn};

use super::color::{
    AvatarColors, ColorPersister, ColorSampler, ColorTarget, ImageColorSampler, NoopColorPersister,
};
use super::display::DisplaySurface;
use super::markdown::{CmarkEngine, MarkdownEngine};
use super::skeleton::{build_skeleton, timestamp_label, MessageNode};
use crate::config::SharedSettings;
use crate::constants::{DEFAULT_AVATAR_MARKER, DEFAULT_THINKING_TEXT, MALFORMED_CONTENT_TEXT};
use crate::content::blocks::escape_html;
use crate::content::{turn_depth, ContentPipeline};
use crate::models::{ActiveSelection, Message, Owner, Role};
use crate::store::ActiveView;
use crate::streaming::StreamRenderer;

/// Turns messages into display nodes for the conversation on screen.
pub struct MessageRenderer {
    view: Arc<ActiveView>,
    settings: SharedSettings,
    display: Arc<dyn DisplaySurface>,
    pipeline: Arc<ContentPipeline>,
    markdown: Arc<dyn MarkdownEngine>,
    colors: AvatarColors,
    persister: Arc<dyn ColorPersister>,
}

impl std::fmt::Debug for MessageRenderer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MessageRenderer").finish_non_exhaustive()
    }
}

impl MessageRenderer {
    pub fn new(
        view: Arc<ActiveView>,
        settings: SharedSettings,
        display: Arc<dyn DisplaySurface>,
        pipeline: Arc<ContentPipeline>,
    ) -> Self {
        Self {
            view,
            settings,
            display,
            pipeline,
            markdown: Arc::new(CmarkEngine::new()),
            colors: AvatarColors::new(Arc::new(ImageColorSampler)),
            persister: Arc::new(NoopColorPersister),
        }
    }

    pub fn with_markdown(mut self, markdown: Arc<dyn MarkdownEngine>) -> Self {
        self.markdown = markdown;
        self
    }

    pub fn with_color_sampler(mut self, sampler: Arc<dyn ColorSampler>) -> Self {
        self.colors = AvatarColors::new(sampler);
        self
    }

    pub fn with_color_persister(mut self, persister: Arc<dyn ColorPersister>) -> Self {
        self.persister = persister;
        self
    }

    pub fn display(&self) -> &Arc<dyn DisplaySurface> {
        &self.display
    }

    /// Builds and displays the node for `message`.
    ///
    /// Thinking placeholders seen during an initial history load are stale:
    /// they are dropped from the live history and the display instead.
    pub async fn render(&self, mut message: Message, is_initial_load: bool) -> Option<MessageNode> {
        if message.is_thinking && is_initial_load {
            debug!("Dropping stale thinking message {} on load", message.id);
            self.view.remove_message(&message.id);
            self.display.remove(&message.id);
            return None;
        }
        if message.id.is_empty() {
            message.id = Message::generate_id();
        }

        let settings = self.settings.snapshot();
        let selection = self.view.selection();
        let mut node = build_skeleton(&message, &settings, selection.as_ref());
        node.content_html = if message.is_thinking {
            thinking_html(&message)
        } else {
            self.content_html(&message)
        };
        self.display.upsert(node.clone());

        if let Some(accent) = self.resolve_accent(&message, selection.as_ref()).await {
            self.display.set_accent(&message.id, &accent);
            if let Some(avatar) = node.avatar.as_mut() {
                avatar.accent = Some(accent.clone());
            }
            if let Some(name) = node.name.as_mut() {
                name.accent = Some(accent);
            }
        }

        self.display.scroll_to_end();
        Some(node)
    }

    /// Removes a message from the live history and the display.
    pub fn remove_message(&self, message_id: &str) -> bool {
        let in_history = self.view.remove_message(message_id).is_some();
        let on_screen = self.display.remove(message_id);
        in_history || on_screen
    }

    /// Re-renders the content slot of an existing node.
    pub fn redraw_content(&self, message: &Message) -> bool {
        self.display.set_content(&message.id, &self.content_html(message))
    }

    /// Shows a stream failure inline when the node exists, otherwise as a
    /// system message in the current view.
    pub async fn show_stream_error(&self, message_id: &str, error: &str) {
        let escaped = escape_html(error);
        if self.display.contains(message_id) {
            self.display.append_content(
                message_id,
                &format!("<p class=\"stream-error\"><strong>Stream error: {}</strong></p>", escaped),
            );
            self.display.set_streaming(message_id, false);
            return;
        }
        let notice = Message::new(
            format!("err_{}", message_id),
            Role::System,
            format!("Stream error (ID: {}): {}", message_id, error),
        )
        .with_timestamp(chrono::Utc::now().timestamp_millis());
        self.view.push_message(notice.clone());
        self.render(notice, false).await;
    }

    fn content_html(&self, message: &Message) -> String {
        match message.content.text() {
            Some(text) => self.text_html(text, message.role, &message.id),
            None => {
                warn!("Unexpected content shape in message {}", message.id);
                format!(
                    "<p class=\"malformed-content\">{}</p>",
                    escape_html(MALFORMED_CONTENT_TEXT)
                )
            }
        }
    }

    fn text_html(&self, text: &str, role: Role, message_id: &str) -> String {
        let depth = turn_depth(&self.view.history(), message_id);
        let processed = self.pipeline.preprocess(text, role, depth);
        self.markdown.render(&processed)
    }

    /// Explicit colors are already on the skeleton; otherwise the avatar is
    /// sampled and the result saved back for the owning user or agent.
    async fn resolve_accent(
        &self,
        message: &Message,
        selection: Option<&ActiveSelection>,
    ) -> Option<String> {
        let (explicit, url) = match message.role {
            Role::System => return None,
            Role::User => self
                .settings
                .read(|s| (s.user_avatar_calculated_color.clone(), s.user_avatar_url.clone())),
            Role::Assistant if message.is_group_message => {
                (message.avatar_color.clone(), message.avatar_url.clone())
            }
            Role::Assistant => (
                selection.and_then(|s| s.avatar_color.clone()),
                selection.and_then(|s| s.avatar_url.clone()),
            ),
        };
        if explicit.is_some() {
            return None;
        }
        let url = url.filter(|u| !u.is_empty() && !u.contains(DEFAULT_AVATAR_MARKER))?;

        let fresh = self.colors.cached(&url).is_none();
        let color = self.colors.dominant_color(&url).await?;
        if fresh {
            if let Some(target) = color_target(message, selection) {
                self.persist_accent(&target, &color).await;
            }
        }
        Some(color)
    }

    async fn persist_accent(&self, target: &ColorTarget, color: &str) {
        if let Err(e) = self.persister.persist_color(target, color).await {
            warn!(
                "Failed to save {} avatar color for {}: {}",
                target.kind(),
                target.id(),
                e
            );
            return;
        }
        match target {
            ColorTarget::User => self
                .settings
                .update(|s| s.user_avatar_calculated_color = Some(color.to_string())),
            ColorTarget::Agent(agent_id) => {
                let is_selected = self
                    .view
                    .selection()
                    .is_some_and(|s| s.owner == Owner::Agent(agent_id.clone()));
                if is_selected {
                    self.view
                        .update_selection(|s| s.avatar_color = Some(color.to_string()));
                }
            }
        }
    }
}

fn color_target(message: &Message, selection: Option<&ActiveSelection>) -> Option<ColorTarget> {
    match message.role {
        Role::User => Some(ColorTarget::User),
        Role::Assistant if message.is_group_message => {
            message.agent_id.clone().map(ColorTarget::Agent)
        }
        Role::Assistant => match selection.map(|s| &s.owner) {
            Some(Owner::Agent(id)) => Some(ColorTarget::Agent(id.clone())),
            _ => None,
        },
        Role::System => None,
    }
}

fn thinking_html(message: &Message) -> String {
    let label = message
        .content
        .text()
        .filter(|t| !t.is_empty())
        .unwrap_or(DEFAULT_THINKING_TEXT);
    format!(
        "<span class=\"thinking-indicator\">{}<span class=\"thinking-indicator-dots\">...</span></span>",
        escape_html(label)
    )
}

#[async_trait]
impl StreamRenderer for MessageRenderer {
    async fn show_placeholder(&self, message: &Message) -> Option<MessageNode> {
        let mut node = self.render(message.clone(), false).await?;
        self.display.set_streaming(&node.message_id, true);
        node.streaming = true;
        node.classes.push("streaming".to_string());
        Some(node)
    }

    fn show_partial(&self, message: &Message, text: &str) {
        let html = self.text_html(text, message.role, &message.id);
        if !self.display.set_content(&message.id, &html) {
            debug!("No node for streaming message {}", message.id);
        }
    }

    async fn show_final(&self, message: &Message) {
        self.redraw_content(message);
        self.display.set_streaming(&message.id, false);
        self.display.backfill_timestamp(
            &message.id,
            message.timestamp,
            timestamp_label(message.timestamp),
        );
        self.display.scroll_to_end();
    }
}
