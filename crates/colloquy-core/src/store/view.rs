use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;

use crate::models::{ActiveSelection, DeliveryContext, HistoryKey, Message, Owner};

/// The conversation on screen and its in-memory history.
///
/// The history is held as `Arc<Vec<Message>>` and every mutation swaps in a
/// fully built list, so a snapshot taken by a reader never changes under it.
#[derive(Debug, Default)]
pub struct ActiveView {
    selection: RwLock<Option<ActiveSelection>>,
    history: RwLock<Arc<Vec<Message>>>,
    editing: AtomicBool,
}

impl ActiveView {
    pub fn new() -> Self {
        Self::default()
    }

    /// Called by the host when the user switches conversation.
    pub fn select(&self, selection: Option<ActiveSelection>, history: Vec<Message>) {
        let mut current = self.selection.write();
        let mut live = self.history.write();
        *current = selection;
        *live = Arc::new(history);
    }

    pub fn selection(&self) -> Option<ActiveSelection> {
        self.selection.read().clone()
    }

    pub fn update_selection(&self, f: impl FnOnce(&mut ActiveSelection)) {
        if let Some(selection) = self.selection.write().as_mut() {
            f(selection);
        }
    }

    pub fn is_current(&self, context: &DeliveryContext) -> bool {
        self.selection
            .read()
            .as_ref()
            .map(|s| s.matches_context(context))
            .unwrap_or(false)
    }

    pub fn is_current_key(&self, owner: &Owner, topic_id: &str) -> bool {
        self.selection
            .read()
            .as_ref()
            .map(|s| s.matches(owner, topic_id))
            .unwrap_or(false)
    }

    pub fn current_key(&self) -> Option<HistoryKey> {
        self.selection
            .read()
            .as_ref()
            .map(|s| HistoryKey::new(s.owner.clone(), s.topic_id.clone()))
    }

    pub fn history(&self) -> Arc<Vec<Message>> {
        self.history.read().clone()
    }

    pub fn replace_history(&self, history: Vec<Message>) {
        *self.history.write() = Arc::new(history);
    }

    pub fn message(&self, message_id: &str) -> Option<Message> {
        self.history
            .read()
            .iter()
            .find(|m| m.id == message_id)
            .cloned()
    }

    /// Applies `f` to the message with `message_id`. Returns false if absent.
    pub fn update_message(&self, message_id: &str, f: impl FnOnce(&mut Message)) -> bool {
        let mut guard = self.history.write();
        let Some(index) = guard.iter().position(|m| m.id == message_id) else {
            return false;
        };
        let history = Arc::make_mut(&mut *guard);
        f(&mut history[index]);
        true
    }

    /// Runs `f` on the history under the write lock. Readers see either the
    /// list before `f` or the list after it.
    pub fn modify_history<R>(&self, f: impl FnOnce(&mut Vec<Message>) -> R) -> R {
        let mut guard = self.history.write();
        f(Arc::make_mut(&mut *guard))
    }

    /// Like [`modify_history`](Self::modify_history), but only while
    /// `context` is the conversation on screen. The check and the write
    /// happen under the same locks, so a concurrent [`select`](Self::select)
    /// lands either before or after, never between.
    pub fn modify_current<R>(
        &self,
        context: &DeliveryContext,
        f: impl FnOnce(&mut Vec<Message>) -> R,
    ) -> Option<R> {
        let selection = self.selection.read();
        if !selection.as_ref().is_some_and(|s| s.matches_context(context)) {
            return None;
        }
        let mut guard = self.history.write();
        Some(f(Arc::make_mut(&mut *guard)))
    }

    pub fn push_message(&self, message: Message) {
        let mut guard = self.history.write();
        Arc::make_mut(&mut *guard).push(message);
    }

    pub fn remove_message(&self, message_id: &str) -> Option<Message> {
        let mut guard = self.history.write();
        let index = guard.iter().position(|m| m.id == message_id)?;
        Some(Arc::make_mut(&mut *guard).remove(index))
    }

    /// Raised by the UI while the user edits a message in place.
    pub fn set_editing(&self, editing: bool) {
        self.editing.store(editing, Ordering::SeqCst);
    }

    pub fn is_editing(&self) -> bool {
        self.editing.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Role;

    #[test]
    fn test_snapshots_are_stable_across_updates() {
        let view = ActiveView::new();
        view.select(
            Some(ActiveSelection::new(Owner::Agent("a1".into()), "t1")),
            vec![Message::new("m1", Role::User, "hi")],
        );
        let before = view.history();
        assert!(view.update_message("m1", |m| m.content = "changed".into()));
        view.push_message(Message::new("m2", Role::Assistant, ""));

        assert_eq!(before.len(), 1);
        assert_eq!(before[0].text(), Some("hi"), "old snapshot untouched");
        let after = view.history();
        assert_eq!(after.len(), 2);
        assert_eq!(after[0].text(), Some("changed"));
    }

    #[test]
    fn test_current_view_checks() {
        let view = ActiveView::new();
        assert!(!view.is_current(&DeliveryContext::agent("a1", "t1")));
        view.select(Some(ActiveSelection::new(Owner::Agent("a1".into()), "t1")), Vec::new());
        assert!(view.is_current(&DeliveryContext::agent("a1", "t1")));
        assert!(!view.is_current(&DeliveryContext::agent("a1", "t2")));
        assert!(view.is_current_key(&Owner::Agent("a1".into()), "t1"));
        assert!(view.remove_message("nope").is_none());
        assert!(!view.update_message("nope", |_| {}));
    }

    #[test]
    fn test_modify_current_only_touches_selected_view() {
        let view = ActiveView::new();
        view.select(
            Some(ActiveSelection::new(Owner::Agent("a1".into()), "t1")),
            vec![Message::new("u1", Role::User, "hi")],
        );
        let other = DeliveryContext::agent("a2", "t9");
        assert!(view.modify_current(&other, |h| h.clear()).is_none());
        assert_eq!(view.history().len(), 1, "other conversation must not write here");

        let ids = view.modify_current(&DeliveryContext::agent("a1", "t1"), |h| {
            h.push(Message::new("m1", Role::Assistant, ""));
            h.iter().map(|m| m.id.clone()).collect::<Vec<_>>()
        });
        assert_eq!(ids, Some(vec!["u1".to_string(), "m1".to_string()]));
        assert_eq!(view.history().len(), 2);
    }
}
