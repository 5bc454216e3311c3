use parking_lot::Mutex;

use super::skeleton::MessageNode;

/// Where rendered message nodes end up. Calls must be cheap; implementations
/// forward to whatever actually paints the conversation.
pub trait DisplaySurface: Send + Sync {
    /// Inserts `node`, or replaces the node with the same message id in place.
    fn upsert(&self, node: MessageNode);
    fn remove(&self, message_id: &str) -> bool;
    fn contains(&self, message_id: &str) -> bool;
    fn set_content(&self, message_id: &str, html: &str) -> bool;
    fn append_content(&self, message_id: &str, html: &str) -> bool;
    fn set_streaming(&self, message_id: &str, streaming: bool);
    fn set_accent(&self, message_id: &str, accent: &str);
    fn backfill_timestamp(&self, message_id: &str, timestamp: i64, label: Option<String>);
    fn scroll_to_end(&self);
    /// Drops every node, e.g. when another conversation is opened.
    fn clear(&self);
    /// Reorders nodes to follow `ids`. Unlisted nodes keep their relative
    /// order after the listed ones.
    fn reorder(&self, ids: &[String]);
}

/// Ordered in-memory node list. Used by headless hosts and tests.
#[derive(Debug, Default)]
pub struct DisplayList {
    nodes: Mutex<Vec<MessageNode>>,
    scrolls: Mutex<usize>,
}

impl DisplayList {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn nodes(&self) -> Vec<MessageNode> {
        self.nodes.lock().clone()
    }

    pub fn node(&self, message_id: &str) -> Option<MessageNode> {
        self.nodes
            .lock()
            .iter()
            .find(|n| n.message_id == message_id)
            .cloned()
    }

    pub fn ids(&self) -> Vec<String> {
        self.nodes.lock().iter().map(|n| n.message_id.clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.nodes.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.lock().is_empty()
    }

    pub fn scroll_count(&self) -> usize {
        *self.scrolls.lock()
    }

    fn with_node(&self, message_id: &str, f: impl FnOnce(&mut MessageNode)) -> bool {
        let mut nodes = self.nodes.lock();
        match nodes.iter_mut().find(|n| n.message_id == message_id) {
            Some(node) => {
                f(node);
                true
            }
            None => false,
        }
    }
}

impl DisplaySurface for DisplayList {
    fn upsert(&self, node: MessageNode) {
        let mut nodes = self.nodes.lock();
        match nodes.iter_mut().find(|n| n.message_id == node.message_id) {
            Some(existing) => *existing = node,
            None => nodes.push(node),
        }
    }

    fn remove(&self, message_id: &str) -> bool {
        let mut nodes = self.nodes.lock();
        let before = nodes.len();
        nodes.retain(|n| n.message_id != message_id);
        nodes.len() != before
    }

    fn contains(&self, message_id: &str) -> bool {
        self.nodes.lock().iter().any(|n| n.message_id == message_id)
    }

    fn set_content(&self, message_id: &str, html: &str) -> bool {
        self.with_node(message_id, |node| node.content_html = html.to_string())
    }

    fn append_content(&self, message_id: &str, html: &str) -> bool {
        self.with_node(message_id, |node| node.content_html.push_str(html))
    }

    fn set_streaming(&self, message_id: &str, streaming: bool) {
        self.with_node(message_id, |node| {
            node.streaming = streaming;
            node.classes.retain(|c| c != "streaming");
            if streaming {
                node.classes.push("streaming".to_string());
            }
        });
    }

    fn set_accent(&self, message_id: &str, accent: &str) {
        self.with_node(message_id, |node| {
            if let Some(avatar) = node.avatar.as_mut() {
                avatar.accent = Some(accent.to_string());
            }
            if let Some(name) = node.name.as_mut() {
                name.accent = Some(accent.to_string());
            }
        });
    }

    fn backfill_timestamp(&self, message_id: &str, timestamp: i64, label: Option<String>) {
        self.with_node(message_id, |node| {
            node.timestamp = timestamp;
            if node.timestamp_label.is_none() {
                node.timestamp_label = label;
            }
        });
    }

    fn reorder(&self, ids: &[String]) {
        let mut nodes = self.nodes.lock();
        let rank = |node: &MessageNode| {
            ids.iter()
                .position(|id| *id == node.message_id)
                .unwrap_or(usize::MAX)
        };
        nodes.sort_by_key(|node| rank(node));
    }

    fn scroll_to_end(&self) {
        *self.scrolls.lock() += 1;
    }

    fn clear(&self) {
        self.nodes.lock().clear();
    }
}
