use std::cmp::Ordering;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::error::Result;
use crate::models::{HistoryKey, Message, Owner};
use crate::render::MessageRenderer;
use crate::store::{ActiveView, HistoryStore};
use crate::streaming::StreamManager;

/// Outcome of one reconciliation pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncReport {
    pub skipped: bool,
    pub removed: usize,
    pub modified: usize,
    pub added: usize,
}

impl SyncReport {
    fn skipped() -> Self {
        Self {
            skipped: true,
            ..Self::default()
        }
    }

    pub fn is_noop(&self) -> bool {
        self.removed == 0 && self.modified == 0 && self.added == 0
    }
}

#[derive(Debug, Default)]
struct MergePlan {
    removed: Vec<String>,
    modified: Vec<Message>,
    added: Vec<Message>,
}

/// Brings the live history of the current view in line with its persisted
/// copy after an external change, leaving the streaming message alone.
pub struct HistoryReconciler {
    view: Arc<ActiveView>,
    store: Arc<dyn HistoryStore>,
    renderer: Arc<MessageRenderer>,
    streams: StreamManager,
}

impl HistoryReconciler {
    pub fn new(
        view: Arc<ActiveView>,
        store: Arc<dyn HistoryStore>,
        renderer: Arc<MessageRenderer>,
        streams: StreamManager,
    ) -> Self {
        Self {
            view,
            store,
            renderer,
            streams,
        }
    }

    pub async fn sync(&self, owner: &Owner, topic_id: &str) -> Result<SyncReport> {
        if !self.may_sync(owner, topic_id) {
            return Ok(SyncReport::skipped());
        }

        let key = HistoryKey::new(owner.clone(), topic_id);
        let fetched = match self.store.fetch(&key).await {
            Ok(history) => history,
            Err(e) => {
                warn!("Sync of {} topic {} failed to fetch history: {}", owner.id(), topic_id, e);
                return Err(e);
            }
        };

        // the view may have changed while fetching
        if !self.may_sync(owner, topic_id) {
            return Ok(SyncReport::skipped());
        }

        let active = self.streams.active_streaming_id();
        let (plan, order) = self.view.modify_history(|history| {
            let plan = merge(history, fetched, active.as_deref());
            let order: Vec<String> = history.iter().map(|m| m.id.clone()).collect();
            (plan, order)
        });

        let report = SyncReport {
            skipped: false,
            removed: plan.removed.len(),
            modified: plan.modified.len(),
            added: plan.added.len(),
        };

        let display = self.renderer.display();
        for id in &plan.removed {
            display.remove(id);
        }
        for message in &plan.modified {
            self.renderer.redraw_content(message);
        }
        let added = !plan.added.is_empty();
        for message in plan.added {
            self.renderer.render(message, true).await;
        }
        if added {
            display.reorder(&order);
        }

        if !report.is_noop() {
            info!(
                "Synced topic {}: {} removed, {} modified, {} added",
                topic_id, report.removed, report.modified, report.added
            );
        }
        Ok(report)
    }

    fn may_sync(&self, owner: &Owner, topic_id: &str) -> bool {
        if self.view.is_editing() {
            debug!("Skipping sync of topic {} while a message is being edited", topic_id);
            return false;
        }
        if !self.view.is_current_key(owner, topic_id) {
            debug!("Skipping sync of topic {}: not the current view", topic_id);
            return false;
        }
        true
    }
}

/// Applies `fetched` to `history` in place. The message with id `active`
/// is never touched and ends up last.
fn merge(history: &mut Vec<Message>, fetched: Vec<Message>, active: Option<&str>) -> MergePlan {
    let is_active = |id: &str| active == Some(id);
    let known: HashSet<String> = history.iter().map(|m| m.id.clone()).collect();

    let mut plan = MergePlan::default();
    let mut incoming: HashMap<String, Message> = HashMap::with_capacity(fetched.len());
    for message in fetched {
        if message.is_thinking || is_active(&message.id) {
            continue;
        }
        if known.contains(&message.id) {
            incoming.insert(message.id.clone(), message);
        } else {
            plan.added.push(message);
        }
    }

    history.retain_mut(|message| {
        if is_active(&message.id) {
            return true;
        }
        match incoming.remove(&message.id) {
            None => {
                plan.removed.push(message.id.clone());
                false
            }
            Some(newer) => {
                if newer.content != message.content {
                    *message = newer;
                    plan.modified.push(message.clone());
                }
                true
            }
        }
    });
    history.extend(plan.added.iter().cloned());

    history.sort_by(|a, b| match (is_active(&a.id), is_active(&b.id)) {
        (true, false) => Ordering::Greater,
        (false, true) => Ordering::Less,
        _ => a.timestamp.cmp(&b.timestamp),
    });
    plan
}
