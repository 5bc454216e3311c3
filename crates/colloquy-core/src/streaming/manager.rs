use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::mpsc::UnboundedSender;
use tracing::{debug, error, info, warn};

use super::pacer::{ChunkQueue, PacerHandle};
use super::types::ChunkPayload;
use crate::config::{GlobalSettings, SharedSettings};
use crate::error::{CoreError, Result};
use crate::events::CoreEvent;
use crate::models::{DeliveryContext, HistoryKey, Message, MessageContent};
use crate::render::MessageNode;
use crate::store::{without_thinking, ActiveView, HistoryStore};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamPhase {
    /// Start is in flight or has not been called; chunks are buffered.
    Pending,
    Ready,
    /// Absorbing. Retained briefly so late events stay no-ops.
    Finalized,
}

/// Display side of streaming. Only called for the conversation on screen.
#[async_trait]
pub trait StreamRenderer: Send + Sync {
    async fn show_placeholder(&self, message: &Message) -> Option<MessageNode>;

    /// `text` is everything released so far.
    fn show_partial(&self, message: &Message, text: &str);

    async fn show_final(&self, message: &Message);
}

type PendingChunk = (String, Option<DeliveryContext>);

#[derive(Debug)]
struct StreamState {
    phase: StreamPhase,
    started: bool,
    starting: bool,
    context: Option<DeliveryContext>,
    accumulated: String,
    /// Byte length of `accumulated` already handed to the display.
    released: usize,
    queue: Option<ChunkQueue>,
    pre_buffer: Vec<PendingChunk>,
    deferred_finish: Option<(String, Option<DeliveryContext>)>,
    finalized_at: Option<Instant>,
}

impl StreamState {
    fn pending() -> Self {
        Self {
            phase: StreamPhase::Pending,
            started: false,
            starting: false,
            context: None,
            accumulated: String::new(),
            released: 0,
            queue: None,
            pre_buffer: Vec::new(),
            deferred_finish: None,
            finalized_at: None,
        }
    }

    fn tombstone() -> Self {
        Self {
            phase: StreamPhase::Finalized,
            finalized_at: Some(Instant::now()),
            ..Self::pending()
        }
    }

    fn displayed(&self) -> &str {
        &self.accumulated[..self.released]
    }
}

struct Inner {
    view: Arc<ActiveView>,
    store: Arc<dyn HistoryStore>,
    renderer: Arc<dyn StreamRenderer>,
    settings: SharedSettings,
    events: Mutex<Option<UnboundedSender<CoreEvent>>>,
    streams: Mutex<HashMap<String, StreamState>>,
    active_streaming_id: Mutex<Option<String>>,
}

/// Per-message streaming state machine: `pending -> ready -> finalized`.
///
/// One instance per application session; clones share state.
#[derive(Clone)]
pub struct StreamManager {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for StreamManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamManager")
            .field("streams", &self.inner.streams.lock().len())
            .field("active_streaming_id", &*self.inner.active_streaming_id.lock())
            .finish()
    }
}

impl StreamManager {
    pub fn new(
        view: Arc<ActiveView>,
        store: Arc<dyn HistoryStore>,
        renderer: Arc<dyn StreamRenderer>,
        settings: SharedSettings,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                view,
                store,
                renderer,
                settings,
                events: Mutex::new(None),
                streams: Mutex::new(HashMap::new()),
                active_streaming_id: Mutex::new(None),
            }),
        }
    }

    pub fn set_event_sender(&self, sender: UnboundedSender<CoreEvent>) {
        *self.inner.events.lock() = Some(sender);
    }

    /// Registers the placeholder for `message` in its history and moves the
    /// stream to `ready`, replaying any chunks that arrived meanwhile.
    pub async fn start(
        &self,
        message: Message,
        context: DeliveryContext,
    ) -> Result<Option<MessageNode>> {
        let key = context.validate()?;
        let settings = self.inner.settings.snapshot();
        self.inner.prune_expired(settings.stream_retention_ms);

        let mut placeholder = message;
        if placeholder.id.is_empty() {
            placeholder.id = Message::generate_id();
        }
        let id = placeholder.id.clone();

        {
            let mut streams = self.inner.streams.lock();
            let state = streams
                .entry(id.clone())
                .or_insert_with(StreamState::pending);
            if state.phase == StreamPhase::Finalized {
                return Err(CoreError::StreamClosed(id));
            }
            if state.started {
                debug!("Stream {} already started", id);
                return Ok(None);
            }
            state.started = true;
            state.starting = true;
            state.context = Some(context.clone());
        }
        *self.inner.active_streaming_id.lock() = Some(id.clone());

        placeholder.content = MessageContent::default();
        placeholder.is_thinking = false;
        placeholder.finish_reason = None;
        if placeholder.timestamp == 0 {
            placeholder.timestamp = chrono::Utc::now().timestamp_millis();
        }
        apply_group_metadata(&mut placeholder, &context);

        let ephemeral = context.is_ephemeral();
        let node = if self.inner.view.is_current(&context) {
            self.inner.renderer.show_placeholder(&placeholder).await
        } else {
            None
        };

        // the view may have changed while the placeholder was rendered
        let live = self.inner.view.modify_current(&context, |history| {
            upsert(history, placeholder.clone());
            history.clone()
        });
        let is_current = live.is_some();
        match live {
            Some(history) if !ephemeral => self.inner.persist(&key, &history).await,
            Some(_) => {}
            None if ephemeral => {
                debug!("Ephemeral topic {} left before {} started", key.topic_id, id);
            }
            None => match self.inner.store.fetch(&key).await {
                Ok(mut history) => {
                    upsert(&mut history, placeholder);
                    self.inner.persist(&key, &history).await;
                }
                Err(e) => error!(
                    "Failed to load history for background stream {} (topic {}): {}",
                    id, key.topic_id, e
                ),
            },
        }

        let deferred = {
            let mut streams = self.inner.streams.lock();
            match streams.get_mut(&id) {
                Some(state) => {
                    state.starting = false;
                    if state.phase == StreamPhase::Pending {
                        self.inner.promote(&id, state, &settings);
                    } else {
                        // forced ready by pre-buffer overflow before the placeholder existed
                        self.inner.show_released(&id, state);
                    }
                    state.deferred_finish.take()
                }
                None => None,
            }
        };
        info!("Stream {} ready (current view: {})", id, is_current);

        if let Some((reason, context)) = deferred {
            if let Err(e) = self.finalize(&id, &reason, context).await {
                warn!("Deferred finalize of {} failed: {}", id, e);
            }
        }
        Ok(node)
    }

    /// Adds a chunk. Never fails: chunks for ids that are not ready yet are
    /// buffered, chunks for finalized ids are dropped.
    pub fn append(
        &self,
        message_id: &str,
        chunk: impl Into<ChunkPayload>,
        context: Option<DeliveryContext>,
    ) {
        let text = chunk.into().text();
        if text.is_empty() {
            return;
        }
        let settings = self.inner.settings.snapshot();
        let mut streams = self.inner.streams.lock();
        let state = streams
            .entry(message_id.to_string())
            .or_insert_with(StreamState::pending);

        match state.phase {
            StreamPhase::Finalized => {
                debug!("Ignoring chunk for finalized stream {}", message_id);
            }
            StreamPhase::Pending => {
                state.pre_buffer.push((text, context));
                if state.pre_buffer.len() > settings.pre_buffer_limit {
                    warn!(
                        "Pre-buffer of stream {} exceeded {} chunks, forcing ready",
                        message_id, settings.pre_buffer_limit
                    );
                    self.inner.promote(message_id, state, &settings);
                }
            }
            StreamPhase::Ready => {
                self.inner.apply_chunk(message_id, state, &text, context, &settings);
            }
        }
    }

    /// Commits the accumulated text to history and closes the stream.
    pub async fn finalize(
        &self,
        message_id: &str,
        finish_reason: &str,
        context: Option<DeliveryContext>,
    ) -> Result<()> {
        let settings = self.inner.settings.snapshot();
        let (text, context) = {
            let mut streams = self.inner.streams.lock();
            let Some(state) = streams.get_mut(message_id) else {
                debug!("Finalize for unknown stream {}, nothing to commit", message_id);
                streams.insert(message_id.to_string(), StreamState::tombstone());
                return Ok(());
            };
            if state.starting {
                // also when an overflow forced ready: the placeholder is not stored yet
                debug!("Deferring finalize of {} until start completes", message_id);
                state.deferred_finish = Some((finish_reason.to_string(), context));
                return Ok(());
            }
            match state.phase {
                StreamPhase::Finalized => {
                    debug!("Stream {} already finalized", message_id);
                    return Ok(());
                }
                StreamPhase::Pending => self.inner.promote(message_id, state, &settings),
                StreamPhase::Ready => {}
            }

            if let Some(mut queue) = state.queue.take() {
                let rest = queue.drain_all();
                self.inner.release(message_id, state, &rest);
            }
            state.phase = StreamPhase::Finalized;
            state.finalized_at = Some(Instant::now());
            let context = context.or_else(|| state.context.clone());
            (state.accumulated.clone(), context)
        };

        {
            let mut active = self.inner.active_streaming_id.lock();
            if active.as_deref() == Some(message_id) {
                *active = None;
            }
        }
        self.inner
            .schedule_cleanup(message_id, settings.stream_retention_ms);

        let Some(context) = context else {
            warn!("Stream {} finalized without a delivery context", message_id);
            return Err(CoreError::InvalidContext(format!(
                "no context for stream {}",
                message_id
            )));
        };
        let key = context.validate()?;
        let ephemeral = context.is_ephemeral();

        let commit = |message: &mut Message| {
            message.content = MessageContent::Text(text.clone());
            message.finish_reason = Some(finish_reason.to_string());
            message.is_thinking = false;
            apply_group_metadata(message, &context);
        };

        // source is decided by the view at commit time, not at start
        let live = self.inner.view.modify_current(&context, |history| {
            let message = history.iter_mut().find(|m| m.id == message_id)?;
            commit(message);
            Some(history.clone())
        });
        let is_current = live.is_some();
        let history = match live {
            Some(found) => found,
            // ephemeral histories only exist in their own live view
            None if ephemeral => None,
            None => {
                let mut history = match self.inner.store.fetch(&key).await {
                    Ok(history) => history,
                    Err(e) => {
                        error!("Failed to load history to finalize {}: {}", message_id, e);
                        self.inner.notify(CoreEvent::error(format!(
                            "Could not save the reply: {}",
                            e
                        )));
                        return Err(e);
                    }
                };
                history
                    .iter_mut()
                    .find(|m| m.id == message_id)
                    .map(commit)
                    .map(|_| history)
            }
        };

        let Some(history) = history else {
            if ephemeral {
                debug!(
                    "Stream {} not found in ephemeral topic {}, treating as reset",
                    message_id, key.topic_id
                );
                return Ok(());
            }
            error!(
                "Message {} not found in history of topic {} at finalize",
                message_id, key.topic_id
            );
            self.inner.notify(CoreEvent::error(format!(
                "Message {} could not be found in its conversation",
                message_id
            )));
            return Err(CoreError::MessageNotFound {
                message_id: message_id.to_string(),
                topic_id: key.topic_id,
            });
        };

        if !ephemeral {
            self.inner.persist(&key, &history).await;
        }
        if is_current {
            if let Some(message) = self.inner.view.message(message_id) {
                self.inner.renderer.show_final(&message).await;
            }
        }

        info!("Stream {} finalized ({})", message_id, finish_reason);
        self.inner.notify(CoreEvent::StreamFinalized {
            message_id: message_id.to_string(),
            finish_reason: finish_reason.to_string(),
        });
        Ok(())
    }

    /// One pacer release across all paced streams.
    pub fn tick(&self) {
        let settings = self.inner.settings.snapshot();
        {
            let mut streams = self.inner.streams.lock();
            for (id, state) in streams.iter_mut() {
                if state.phase != StreamPhase::Ready {
                    continue;
                }
                let Some(queue) = state.queue.as_mut() else {
                    continue;
                };
                if queue.is_empty() {
                    continue;
                }
                let batch = if exceeds_backlog(queue, &settings) {
                    queue.drain_all()
                } else {
                    queue.release(settings.min_chunk_buffer_size)
                };
                self.inner.release(id, state, &batch);
            }
        }
        self.inner.prune_expired(settings.stream_retention_ms);
    }

    /// Starts the smooth-streaming timer. Must be called inside a tokio
    /// runtime; the timer stops when the handle or the manager is dropped.
    pub fn spawn_pacer(&self) -> PacerHandle {
        let interval = Duration::from_millis(
            self.inner
                .settings
                .read(|s| s.smooth_stream_interval_ms),
        );
        let weak: Weak<Inner> = Arc::downgrade(&self.inner);
        PacerHandle::spawn(interval, move || match weak.upgrade() {
            Some(inner) => {
                StreamManager { inner }.tick();
                true
            }
            None => false,
        })
    }

    pub fn is_initialized(&self, message_id: &str) -> bool {
        self.phase(message_id)
            .map(|phase| phase != StreamPhase::Pending)
            .unwrap_or(false)
    }

    pub fn phase(&self, message_id: &str) -> Option<StreamPhase> {
        self.inner.streams.lock().get(message_id).map(|s| s.phase)
    }

    pub fn accumulated_text(&self, message_id: &str) -> Option<String> {
        self.inner
            .streams
            .lock()
            .get(message_id)
            .map(|s| s.accumulated.clone())
    }

    pub fn active_streaming_id(&self) -> Option<String> {
        self.inner.active_streaming_id.lock().clone()
    }

    pub fn stream_count(&self) -> usize {
        self.inner.streams.lock().len()
    }
}

impl Inner {
    /// Moves a pending stream to ready and replays its buffered chunks in
    /// arrival order.
    fn promote(&self, id: &str, state: &mut StreamState, settings: &GlobalSettings) {
        state.phase = StreamPhase::Ready;
        if settings.enable_smooth_streaming {
            state.queue = Some(ChunkQueue::new());
        }
        for (text, context) in std::mem::take(&mut state.pre_buffer) {
            self.apply_chunk(id, state, &text, context, settings);
        }
    }

    fn apply_chunk(
        &self,
        id: &str,
        state: &mut StreamState,
        text: &str,
        context: Option<DeliveryContext>,
        settings: &GlobalSettings,
    ) {
        if state.context.is_none() {
            state.context = context;
        }
        state.accumulated.push_str(text);

        let batch = match state.queue.as_mut() {
            Some(queue) => {
                queue.push_str(text);
                if exceeds_backlog(queue, settings) {
                    debug!("Queue of {} over {} units, flushing", id, settings.max_queued_units);
                    queue.drain_all()
                } else {
                    return;
                }
            }
            None => text.to_string(),
        };
        self.release(id, state, &batch);
    }

    /// Marks `batch` as displayed; renders only for the current view.
    fn release(&self, id: &str, state: &mut StreamState, batch: &str) {
        if batch.is_empty() {
            return;
        }
        state.released = (state.released + batch.len()).min(state.accumulated.len());
        self.show_released(id, state);
    }

    fn show_released(&self, id: &str, state: &StreamState) {
        let Some(context) = state.context.as_ref() else {
            return;
        };
        let displayed = state.displayed();
        let updated = self.view.modify_current(context, |history| {
            let message = history.iter_mut().find(|m| m.id == id)?;
            message.content = MessageContent::Text(displayed.to_string());
            if context.is_group_message {
                if message.name.is_none() {
                    message.name = context.agent_name.clone();
                }
                if message.agent_id.is_none() {
                    message.agent_id = context.agent_id.clone();
                }
            }
            Some(message.clone())
        });
        if let Some(Some(message)) = updated {
            self.renderer.show_partial(&message, displayed);
        }
    }

    async fn persist(&self, key: &HistoryKey, history: &[Message]) {
        if let Err(e) = self.store.save(key, &without_thinking(history)).await {
            warn!("Failed to save history for topic {}: {}", key.topic_id, e);
        }
    }

    fn notify(&self, event: CoreEvent) {
        if let Some(sender) = self.events.lock().as_ref() {
            let _ = sender.send(event);
        }
    }

    fn schedule_cleanup(self: &Arc<Self>, id: &str, retention_ms: u64) {
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            debug!("No runtime for delayed cleanup of {}, pruning lazily", id);
            return;
        };
        let weak = Arc::downgrade(self);
        let id = id.to_string();
        handle.spawn(async move {
            tokio::time::sleep(Duration::from_millis(retention_ms)).await;
            if let Some(inner) = weak.upgrade() {
                let mut streams = inner.streams.lock();
                if streams.get(&id).map(|s| s.phase) == Some(StreamPhase::Finalized) {
                    streams.remove(&id);
                    debug!("Cleaned up stream state for {}", id);
                }
            }
        });
    }

    fn prune_expired(&self, retention_ms: u64) {
        let retention = Duration::from_millis(retention_ms);
        self.streams.lock().retain(|_, state| match state.finalized_at {
            Some(at) => at.elapsed() < retention,
            None => true,
        });
    }
}

fn exceeds_backlog(queue: &ChunkQueue, settings: &GlobalSettings) -> bool {
    settings.max_queued_units > 0 && queue.len() > settings.max_queued_units
}

fn apply_group_metadata(message: &mut Message, context: &DeliveryContext) {
    if !context.is_group_message {
        return;
    }
    message.is_group_message = true;
    if let Some(name) = &context.agent_name {
        message.name = Some(name.clone());
    }
    if let Some(agent_id) = &context.agent_id {
        message.agent_id = Some(agent_id.clone());
    }
}

/// Replaces the entry with the same id, or appends.
fn upsert(history: &mut Vec<Message>, message: Message) {
    match history.iter_mut().find(|m| m.id == message.id) {
        Some(existing) => *existing = message,
        None => history.push(message),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};

    use tokio::sync::Notify;

    use crate::models::{ActiveSelection, Owner, Role};
    use crate::store::MemoryHistoryStore;

    #[derive(Default)]
    struct RecordingRenderer {
        placeholders: Mutex<Vec<String>>,
        partials: Mutex<Vec<String>>,
        finals: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl StreamRenderer for RecordingRenderer {
        async fn show_placeholder(&self, message: &Message) -> Option<MessageNode> {
            self.placeholders.lock().push(message.id.clone());
            None
        }

        fn show_partial(&self, _message: &Message, text: &str) {
            self.partials.lock().push(text.to_string());
        }

        async fn show_final(&self, message: &Message) {
            self.finals
                .lock()
                .push(message.text().unwrap_or_default().to_string());
        }
    }

    struct Harness {
        manager: StreamManager,
        view: Arc<ActiveView>,
        store: Arc<MemoryHistoryStore>,
        renderer: Arc<RecordingRenderer>,
        settings: SharedSettings,
    }

    fn harness() -> Harness {
        let view = Arc::new(ActiveView::new());
        let store = Arc::new(MemoryHistoryStore::new());
        let renderer = Arc::new(RecordingRenderer::default());
        let settings = SharedSettings::default();
        let manager = StreamManager::new(
            view.clone(),
            store.clone(),
            renderer.clone(),
            settings.clone(),
        );
        Harness {
            manager,
            view,
            store,
            renderer,
            settings,
        }
    }

    fn key(agent: &str, topic: &str) -> HistoryKey {
        HistoryKey::new(Owner::Agent(agent.into()), topic)
    }

    fn assistant(id: &str) -> Message {
        Message::new(id, Role::Assistant, "").with_timestamp(100)
    }

    fn select(view: &ActiveView, agent: &str, topic: &str) {
        view.select(
            Some(ActiveSelection::new(Owner::Agent(agent.into()), topic)),
            Vec::new(),
        );
    }

    #[tokio::test]
    async fn test_background_stream_persists_final_message() {
        let h = harness();
        let ctx = DeliveryContext::agent("a1", "t1");

        h.manager.start(assistant("m1"), ctx.clone()).await.unwrap();
        let placeholder = h.store.get(&key("a1", "t1")).unwrap();
        assert_eq!(placeholder.len(), 1);
        assert_eq!(placeholder[0].text(), Some(""));

        h.manager.append("m1", "Hel", Some(ctx.clone()));
        h.manager.append("m1", "lo", None);
        h.manager.finalize("m1", "completed", Some(ctx)).await.unwrap();

        let history = h.store.get(&key("a1", "t1")).unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].text(), Some("Hello"));
        assert_eq!(history[0].finish_reason.as_deref(), Some("completed"));
        assert!(!history[0].is_thinking);
        assert!(h.renderer.partials.lock().is_empty(), "background streams never render");
        assert!(h.renderer.placeholders.lock().is_empty());
    }

    #[tokio::test]
    async fn test_invalid_context_creates_no_state() {
        let h = harness();
        let err = h
            .manager
            .start(assistant("m1"), DeliveryContext::agent("a1", ""))
            .await
            .unwrap_err();
        assert!(matches!(err, CoreError::InvalidContext(_)));
        assert_eq!(h.manager.stream_count(), 0);
        assert!(!h.manager.is_initialized("m1"));
    }

    #[tokio::test]
    async fn test_chunks_before_start_are_replayed_once() {
        let h = harness();
        let ctx = DeliveryContext::agent("a1", "t1");
        h.manager.append("m9", "early ", Some(ctx.clone()));
        h.manager.append("m9", "bird", None);
        assert_eq!(h.manager.phase("m9"), Some(StreamPhase::Pending));
        assert!(!h.manager.is_initialized("m9"));

        h.manager.start(assistant("m9"), ctx.clone()).await.unwrap();
        assert!(h.manager.is_initialized("m9"));
        assert_eq!(h.manager.accumulated_text("m9").as_deref(), Some("early bird"));

        h.manager.append("m9", "!", None);
        h.manager.finalize("m9", "completed", None).await.unwrap();
        let history = h.store.get(&key("a1", "t1")).unwrap();
        assert_eq!(history[0].text(), Some("early bird!"));
    }

    #[tokio::test]
    async fn test_pre_buffer_overflow_forces_ready() {
        let h = harness();
        h.settings.update(|s| s.pre_buffer_limit = 2);
        let ctx = DeliveryContext::agent("a1", "t1");
        for part in ["a", "b", "c"] {
            h.manager.append("m1", part, Some(ctx.clone()));
        }
        assert_eq!(h.manager.phase("m1"), Some(StreamPhase::Ready));
        assert_eq!(h.manager.accumulated_text("m1").as_deref(), Some("abc"));

        h.manager.start(assistant("m1"), ctx).await.unwrap();
        h.manager.append("m1", "d", None);
        h.manager.finalize("m1", "completed", None).await.unwrap();
        assert_eq!(h.store.get(&key("a1", "t1")).unwrap()[0].text(), Some("abcd"));
    }

    #[tokio::test]
    async fn test_finalize_is_absorbing() {
        let h = harness();
        let ctx = DeliveryContext::agent("a1", "t1");
        h.manager.start(assistant("m1"), ctx.clone()).await.unwrap();
        h.manager.append("m1", "done", None);
        h.manager.finalize("m1", "completed", None).await.unwrap();
        let saves = h.store.save_count();

        h.manager.append("m1", " more", None);
        h.manager.finalize("m1", "error", None).await.unwrap();
        assert_eq!(h.manager.accumulated_text("m1").as_deref(), Some("done"));
        assert_eq!(h.store.save_count(), saves);
        let history = h.store.get(&key("a1", "t1")).unwrap();
        assert_eq!(history[0].finish_reason.as_deref(), Some("completed"));
        assert!(matches!(
            h.manager.start(assistant("m1"), ctx).await,
            Err(CoreError::StreamClosed(_))
        ));
    }

    #[tokio::test]
    async fn test_current_view_updates_live_history_and_renders() {
        let h = harness();
        select(&h.view, "a1", "t1");
        let ctx = DeliveryContext::agent("a1", "t1");

        h.manager.start(assistant("m1"), ctx.clone()).await.unwrap();
        assert_eq!(h.manager.active_streaming_id().as_deref(), Some("m1"));
        assert_eq!(*h.renderer.placeholders.lock(), vec!["m1".to_string()]);

        h.manager.append("m1", "Hi", Some(ctx.clone()));
        assert_eq!(h.view.message("m1").unwrap().text(), Some("Hi"));
        h.manager.append("m1", " there", None);
        assert_eq!(*h.renderer.partials.lock(), vec!["Hi".to_string(), "Hi there".to_string()]);

        h.manager.finalize("m1", "completed", None).await.unwrap();
        assert_eq!(h.manager.active_streaming_id(), None);
        assert_eq!(*h.renderer.finals.lock(), vec!["Hi there".to_string()]);
        assert_eq!(h.store.get(&key("a1", "t1")).unwrap()[0].text(), Some("Hi there"));
    }

    #[tokio::test]
    async fn test_paced_release_and_finalize_drain() {
        let h = harness();
        h.settings.update(|s| {
            s.enable_smooth_streaming = true;
            s.min_chunk_buffer_size = 2;
        });
        select(&h.view, "a1", "t1");
        let ctx = DeliveryContext::agent("a1", "t1");
        h.manager.start(assistant("m1"), ctx.clone()).await.unwrap();

        h.manager.append("m1", "abcde", None);
        assert_eq!(h.manager.accumulated_text("m1").as_deref(), Some("abcde"));
        assert!(h.renderer.partials.lock().is_empty(), "paced text waits for a tick");

        h.manager.tick();
        h.manager.tick();
        assert_eq!(*h.renderer.partials.lock(), vec!["ab".to_string(), "abcd".to_string()]);

        h.manager.finalize("m1", "completed", None).await.unwrap();
        assert_eq!(h.renderer.partials.lock().last().map(String::as_str), Some("abcde"));
        assert_eq!(h.view.message("m1").unwrap().text(), Some("abcde"));
    }

    #[tokio::test]
    async fn test_backlog_over_limit_is_flushed() {
        let h = harness();
        h.settings.update(|s| {
            s.enable_smooth_streaming = true;
            s.max_queued_units = 4;
        });
        select(&h.view, "a1", "t1");
        let ctx = DeliveryContext::agent("a1", "t1");
        h.manager.start(assistant("m1"), ctx).await.unwrap();

        h.manager.append("m1", "abc", None);
        assert!(h.renderer.partials.lock().is_empty());
        h.manager.append("m1", "def", None);
        assert_eq!(*h.renderer.partials.lock(), vec!["abcdef".to_string()]);
    }

    #[tokio::test]
    async fn test_paced_background_stream_keeps_order() {
        let h = harness();
        h.settings.update(|s| s.enable_smooth_streaming = true);
        let ctx = DeliveryContext::agent("a1", "t1");
        h.manager.append("m1", "one ", Some(ctx.clone()));
        h.manager.start(assistant("m1"), ctx).await.unwrap();
        h.manager.append("m1", "two ", None);
        h.manager.tick();
        h.manager.append("m1", "three", None);
        h.manager.finalize("m1", "completed", None).await.unwrap();
        assert_eq!(
            h.store.get(&key("a1", "t1")).unwrap()[0].text(),
            Some("one two three")
        );
    }

    #[tokio::test]
    async fn test_missing_message_in_persisted_topic_is_reported() {
        let h = harness();
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        h.manager.set_event_sender(tx);
        let ctx = DeliveryContext::agent("a1", "t1");
        h.manager.start(assistant("m1"), ctx.clone()).await.unwrap();
        h.store.put(key("a1", "t1"), Vec::new());

        let err = h.manager.finalize("m1", "completed", Some(ctx)).await.unwrap_err();
        assert!(matches!(err, CoreError::MessageNotFound { .. }));
        assert!(matches!(rx.try_recv(), Ok(CoreEvent::Notification { .. })));
    }

    #[tokio::test]
    async fn test_ephemeral_topic_is_never_persisted() {
        let h = harness();
        select(&h.view, "a1", "voicechat_a1");
        let ctx = DeliveryContext::agent("a1", "voicechat_a1");
        h.manager.start(assistant("m1"), ctx.clone()).await.unwrap();
        h.manager.append("m1", "spoken", None);
        h.manager.finalize("m1", "completed", None).await.unwrap();
        assert_eq!(h.store.save_count(), 0);
        assert_eq!(h.view.message("m1").unwrap().text(), Some("spoken"));

        // voice window closed and reset: not found is benign
        h.view.replace_history(Vec::new());
        h.manager.start(assistant("m2"), ctx.clone()).await.unwrap();
        h.view.replace_history(Vec::new());
        assert!(h.manager.finalize("m2", "completed", None).await.is_ok());
    }

    #[tokio::test]
    async fn test_save_failure_does_not_block_transitions() {
        let h = harness();
        h.store.set_fail_save(true);
        select(&h.view, "a1", "t1");
        let ctx = DeliveryContext::agent("a1", "t1");
        h.manager.start(assistant("m1"), ctx).await.unwrap();
        assert!(h.manager.is_initialized("m1"));
        h.manager.append("m1", "kept", None);
        h.manager.finalize("m1", "completed", None).await.unwrap();
        assert_eq!(h.view.message("m1").unwrap().text(), Some("kept"));
    }

    #[tokio::test]
    async fn test_group_metadata_from_context() {
        let h = harness();
        let mut ctx = DeliveryContext::group("g1", "t1", "a7");
        ctx.agent_name = Some("Nova".into());
        h.manager.start(assistant("m1"), ctx.clone()).await.unwrap();
        h.manager.append("m1", "hey", None);
        h.manager.finalize("m1", "completed", Some(ctx)).await.unwrap();

        let history = h
            .store
            .get(&HistoryKey::new(Owner::Group("g1".into()), "t1"))
            .unwrap();
        assert_eq!(history[0].name.as_deref(), Some("Nova"));
        assert_eq!(history[0].agent_id.as_deref(), Some("a7"));
        assert!(history[0].is_group_message);
    }

    #[tokio::test]
    async fn test_unknown_finalize_leaves_tombstone() {
        let h = harness();
        h.manager.finalize("ghost", "completed", None).await.unwrap();
        h.manager.append("ghost", "late", None);
        assert_eq!(h.manager.phase("ghost"), Some(StreamPhase::Finalized));
        assert_eq!(h.manager.accumulated_text("ghost").as_deref(), Some(""));
    }

    #[tokio::test]
    async fn test_finalized_state_is_pruned_after_retention() {
        let h = harness();
        h.settings.update(|s| s.stream_retention_ms = 0);
        let ctx = DeliveryContext::agent("a1", "t1");
        h.manager.start(assistant("m1"), ctx).await.unwrap();
        h.manager.finalize("m1", "completed", None).await.unwrap();
        h.manager.tick();
        assert_eq!(h.manager.stream_count(), 0);
    }

    #[tokio::test]
    async fn test_thinking_messages_not_persisted() {
        let h = harness();
        let mut thinking = Message::new("t0", Role::Assistant, "...");
        thinking.is_thinking = true;
        h.store.put(key("a1", "t1"), vec![thinking]);

        h.manager
            .start(assistant("m1"), DeliveryContext::agent("a1", "t1"))
            .await
            .unwrap();
        let history = h.store.get(&key("a1", "t1")).unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].id, "m1");
    }

    fn ids(history: &[Message]) -> Vec<&str> {
        history.iter().map(|m| m.id.as_str()).collect()
    }

    /// Switches the view to another conversation while the placeholder is
    /// being drawn, like a user clicking away during avatar decoding.
    struct SwitchingRenderer {
        view: Arc<ActiveView>,
        switch_to: Mutex<Option<(ActiveSelection, Vec<Message>)>>,
    }

    #[async_trait]
    impl StreamRenderer for SwitchingRenderer {
        async fn show_placeholder(&self, _message: &Message) -> Option<MessageNode> {
            tokio::task::yield_now().await;
            if let Some((selection, history)) = self.switch_to.lock().take() {
                self.view.select(Some(selection), history);
            }
            None
        }

        fn show_partial(&self, _message: &Message, _text: &str) {}

        async fn show_final(&self, _message: &Message) {}
    }

    #[tokio::test]
    async fn test_view_switch_during_placeholder_keeps_histories_apart() {
        let view = Arc::new(ActiveView::new());
        let store = Arc::new(MemoryHistoryStore::new());
        let own = vec![Message::new("u1", Role::User, "question").with_timestamp(50)];
        store.put(key("a1", "tA"), own.clone());
        view.select(
            Some(ActiveSelection::new(Owner::Agent("a1".into()), "tA")),
            own,
        );
        let renderer = Arc::new(SwitchingRenderer {
            view: view.clone(),
            switch_to: Mutex::new(Some((
                ActiveSelection::new(Owner::Agent("b1".into()), "tB"),
                vec![Message::new("other", Role::User, "elsewhere")],
            ))),
        });
        let manager = StreamManager::new(
            view.clone(),
            store.clone(),
            renderer,
            SharedSettings::default(),
        );
        let ctx = DeliveryContext::agent("a1", "tA");

        manager.start(assistant("m1"), ctx.clone()).await.unwrap();
        assert_eq!(ids(&store.get(&key("a1", "tA")).unwrap()), vec!["u1", "m1"]);
        assert_eq!(ids(&view.history()), vec!["other"], "placeholder leaked into tB");

        manager.append("m1", "answer", None);
        manager.finalize("m1", "completed", None).await.unwrap();
        let history = store.get(&key("a1", "tA")).unwrap();
        assert_eq!(ids(&history), vec!["u1", "m1"]);
        assert_eq!(history[1].text(), Some("answer"));
        assert_eq!(ids(&view.history()), vec!["other"]);
        assert!(store.get(&key("b1", "tB")).is_none());
    }

    /// Holds the first fetch until the test opens the gate.
    #[derive(Default)]
    struct GatedStore {
        inner: MemoryHistoryStore,
        gated: AtomicBool,
        entered: Notify,
        gate: Notify,
    }

    #[async_trait]
    impl HistoryStore for GatedStore {
        async fn fetch(&self, key: &HistoryKey) -> Result<Vec<Message>> {
            if !self.gated.swap(true, Ordering::SeqCst) {
                self.entered.notify_one();
                self.gate.notified().await;
            }
            self.inner.fetch(key).await
        }

        async fn save(&self, key: &HistoryKey, history: &[Message]) -> Result<()> {
            self.inner.save(key, history).await
        }
    }

    #[tokio::test]
    async fn test_finalize_waits_for_start_after_forced_ready() {
        let store = Arc::new(GatedStore::default());
        let settings = SharedSettings::default();
        settings.update(|s| s.pre_buffer_limit = 2);
        let manager = StreamManager::new(
            Arc::new(ActiveView::new()),
            store.clone(),
            Arc::new(RecordingRenderer::default()),
            settings,
        );
        let ctx = DeliveryContext::agent("a1", "t1");

        let starting = {
            let manager = manager.clone();
            let ctx = ctx.clone();
            tokio::spawn(async move { manager.start(assistant("m1"), ctx).await })
        };
        store.entered.notified().await;

        for part in ["a", "b", "c", "d"] {
            manager.append("m1", part, Some(ctx.clone()));
        }
        assert_eq!(manager.phase("m1"), Some(StreamPhase::Ready));
        manager.finalize("m1", "completed", Some(ctx)).await.unwrap();
        assert_eq!(manager.phase("m1"), Some(StreamPhase::Ready), "finalize must wait for start");

        store.gate.notify_one();
        starting.await.unwrap().unwrap();

        let history = store.inner.get(&key("a1", "t1")).unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].text(), Some("abcd"));
        assert_eq!(history[0].finish_reason.as_deref(), Some("completed"));
        assert_eq!(manager.phase("m1"), Some(StreamPhase::Finalized));
    }

    #[tokio::test]
    async fn test_finalize_after_switching_away_commits_to_store() {
        let h = harness();
        let own = vec![Message::new("u1", Role::User, "hi").with_timestamp(50)];
        h.store.put(key("a1", "t1"), own.clone());
        h.view.select(
            Some(ActiveSelection::new(Owner::Agent("a1".into()), "t1")),
            own,
        );
        let ctx = DeliveryContext::agent("a1", "t1");
        h.manager.start(assistant("m1"), ctx.clone()).await.unwrap();
        h.manager.append("m1", "Hi", None);

        h.view.select(
            Some(ActiveSelection::new(Owner::Agent("a2".into()), "t2")),
            vec![Message::new("x", Role::User, "other chat")],
        );
        h.manager.append("m1", " there", None);
        h.manager.finalize("m1", "completed", Some(ctx)).await.unwrap();

        let history = h.store.get(&key("a1", "t1")).unwrap();
        assert_eq!(ids(&history), vec!["u1", "m1"]);
        assert_eq!(history[1].text(), Some("Hi there"));
        assert_eq!(history[1].finish_reason.as_deref(), Some("completed"));
        assert_eq!(ids(&h.view.history()), vec!["x"]);
        assert_eq!(*h.renderer.partials.lock(), vec!["Hi".to_string()]);
        assert!(h.renderer.finals.lock().is_empty());
    }

    #[tokio::test]
    async fn test_finalize_after_switching_in_updates_live_view() {
        let h = harness();
        select(&h.view, "a2", "t2");
        let ctx = DeliveryContext::agent("a1", "t1");
        h.manager.start(assistant("m1"), ctx.clone()).await.unwrap();
        h.manager.append("m1", "Hel", None);
        assert!(h.renderer.placeholders.lock().is_empty());

        // the host loads the stored history, placeholder included
        h.view.select(
            Some(ActiveSelection::new(Owner::Agent("a1".into()), "t1")),
            h.store.get(&key("a1", "t1")).unwrap(),
        );
        h.manager.append("m1", "lo", None);
        assert_eq!(h.view.message("m1").unwrap().text(), Some("Hello"));

        h.manager.finalize("m1", "completed", Some(ctx)).await.unwrap();
        let live = h.view.message("m1").unwrap();
        assert_eq!(live.text(), Some("Hello"));
        assert_eq!(live.finish_reason.as_deref(), Some("completed"));
        assert_eq!(h.store.get(&key("a1", "t1")).unwrap()[0].text(), Some("Hello"));
        assert_eq!(*h.renderer.finals.lock(), vec!["Hello".to_string()]);
    }
}
