use std::sync::Arc;

use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tracing::{debug, error, info, warn};

use crate::config::{CoreConfig, GlobalSettings, SharedSettings};
use crate::constants::{FINISH_CANCELLED, FINISH_ERROR};
use crate::content::{ContentPipeline, RuleSet};
use crate::error::{CoreError, Result};
use crate::events::CoreEvent;
use crate::models::{ActiveSelection, DeliveryContext, HistoryKey, Message, Owner, Role};
use crate::render::{ColorPersister, DisplaySurface, FileColorPersister, MessageNode, MessageRenderer};
use crate::store::{without_thinking, ActiveView, HistoryStore, JsonHistoryStore};
use crate::streaming::{PacerHandle, StreamEvent, StreamManager};
use crate::sync::{HistoryReconciler, SyncReport};
use crate::transport::{ChatRequest, ChatResponse, ChatTransport};

/// Session-scoped assembly of the streaming and rendering core.
pub struct CoreRuntime {
    config: CoreConfig,
    settings: SharedSettings,
    view: Arc<ActiveView>,
    store: Arc<dyn HistoryStore>,
    pipeline: Arc<ContentPipeline>,
    renderer: Arc<MessageRenderer>,
    streams: StreamManager,
    reconciler: HistoryReconciler,
    transport: Option<Arc<dyn ChatTransport>>,
    event_tx: UnboundedSender<CoreEvent>,
    event_rx: Option<UnboundedReceiver<CoreEvent>>,
    pacer: Option<PacerHandle>,
}

impl CoreRuntime {
    /// File-backed runtime: settings, regex rules and histories live under
    /// `config.data_dir`.
    pub fn new(config: CoreConfig, display: Arc<dyn DisplaySurface>) -> Result<Self> {
        std::fs::create_dir_all(&config.data_dir)?;
        let settings = GlobalSettings::load_from_file(&config.settings_path())?;
        let rules = RuleSet::load_from_file(&config.rules_path())?;
        let store: Arc<dyn HistoryStore> = Arc::new(JsonHistoryStore::new(&config.data_dir));
        let persister: Arc<dyn ColorPersister> = Arc::new(FileColorPersister::new(
            &config.data_dir,
            config.settings_path(),
        ));
        info!("Core runtime using data dir {}", config.data_dir.display());
        Ok(Self::from_parts(config, settings, rules, store, display, persister))
    }

    pub fn from_parts(
        config: CoreConfig,
        settings: GlobalSettings,
        rules: RuleSet,
        store: Arc<dyn HistoryStore>,
        display: Arc<dyn DisplaySurface>,
        persister: Arc<dyn ColorPersister>,
    ) -> Self {
        let settings = SharedSettings::new(settings);
        let view = Arc::new(ActiveView::new());
        let pipeline = Arc::new(ContentPipeline::new(rules));
        let renderer = Arc::new(
            MessageRenderer::new(view.clone(), settings.clone(), display, pipeline.clone())
                .with_color_persister(persister),
        );
        let streams = StreamManager::new(
            view.clone(),
            store.clone(),
            renderer.clone(),
            settings.clone(),
        );
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        streams.set_event_sender(event_tx.clone());
        let reconciler =
            HistoryReconciler::new(view.clone(), store.clone(), renderer.clone(), streams.clone());

        Self {
            config,
            settings,
            view,
            store,
            pipeline,
            renderer,
            streams,
            reconciler,
            transport: None,
            event_tx,
            event_rx: Some(event_rx),
            pacer: None,
        }
    }

    pub fn with_transport(mut self, transport: Arc<dyn ChatTransport>) -> Self {
        self.transport = Some(transport);
        self
    }

    /// The receiver can only be taken once.
    pub fn take_event_receiver(&mut self) -> Option<UnboundedReceiver<CoreEvent>> {
        self.event_rx.take()
    }

    /// Starts the smooth-streaming timer. Requires a tokio runtime.
    pub fn start_pacer(&mut self) {
        if self.pacer.as_ref().is_some_and(|p| !p.is_finished()) {
            return;
        }
        self.pacer = Some(self.streams.spawn_pacer());
    }

    pub fn config(&self) -> &CoreConfig {
        &self.config
    }

    pub fn settings(&self) -> &SharedSettings {
        &self.settings
    }

    pub fn view(&self) -> &Arc<ActiveView> {
        &self.view
    }

    pub fn streams(&self) -> &StreamManager {
        &self.streams
    }

    pub fn renderer(&self) -> &Arc<MessageRenderer> {
        &self.renderer
    }

    pub fn save_settings(&self) -> Result<()> {
        self.settings.snapshot().save_to_file(&self.config.settings_path())
    }

    pub fn set_rules(&self, rules: RuleSet) {
        self.pipeline.set_rules(rules);
    }

    /// Makes `selection` the current view, loading and rendering its history.
    pub async fn open_conversation(&self, selection: ActiveSelection) -> Result<usize> {
        let key = HistoryKey::new(selection.owner.clone(), selection.topic_id.clone());
        let history = if key.is_ephemeral() {
            Vec::new()
        } else {
            self.store.fetch(&key).await?
        };
        self.view.select(Some(selection), history.clone());
        self.renderer.display().clear();

        let mut rendered = 0;
        for message in history {
            if self.renderer.render(message, true).await.is_some() {
                rendered += 1;
            }
        }
        debug!("Opened topic {} with {} messages", key.topic_id, rendered);
        Ok(rendered)
    }

    /// Appends a complete message to the current view and saves it.
    pub async fn add_message(&self, message: Message) -> Result<Option<MessageNode>> {
        let Some(key) = self.view.current_key() else {
            return Err(CoreError::InvalidContext("no conversation selected".into()));
        };
        self.view.push_message(message.clone());
        if !key.is_ephemeral() {
            let history = without_thinking(&self.view.history());
            if let Err(e) = self.store.save(&key, &history).await {
                warn!("Failed to save history for topic {}: {}", key.topic_id, e);
            }
        }
        Ok(self.renderer.render(message, false).await)
    }

    pub async fn sync(&self, owner: &Owner, topic_id: &str) -> Result<SyncReport> {
        self.reconciler.sync(owner, topic_id).await
    }

    /// Dispatches one transport event to the stream manager and renderer.
    pub async fn handle_stream_event(&self, event: StreamEvent) -> Result<()> {
        match event {
            StreamEvent::AgentThinking {
                message_id,
                context,
            } => {
                let Some(context) = context else {
                    debug!("Thinking event for {} without context", message_id);
                    return Ok(());
                };
                let mut thinking = assistant_from_context(&message_id, &context);
                thinking.is_thinking = true;
                thinking.is_group_message = true;
                let pushed = self
                    .view
                    .modify_current(&context, |history| history.push(thinking.clone()))
                    .is_some();
                if !pushed {
                    debug!("Thinking event for {} outside the current view", message_id);
                    return Ok(());
                }
                self.renderer.render(thinking, false).await;
                Ok(())
            }
            StreamEvent::Start {
                message_id,
                context,
                timestamp,
            } => {
                let context = context.ok_or_else(|| {
                    CoreError::InvalidContext(format!("start of {} without context", message_id))
                })?;
                let mut placeholder = assistant_from_context(&message_id, &context);
                placeholder.timestamp =
                    timestamp.unwrap_or_else(|| chrono::Utc::now().timestamp_millis());
                self.streams.start(placeholder, context).await.map(|_| ())
            }
            StreamEvent::Data {
                message_id,
                chunk,
                context,
            } => {
                self.streams.append(&message_id, &chunk, context);
                Ok(())
            }
            StreamEvent::End {
                message_id,
                finish_reason,
                context,
            } => self.streams.finalize(&message_id, &finish_reason, context).await,
            StreamEvent::Error {
                message_id,
                error,
                context,
            } => {
                error!("Stream {} failed: {}", message_id, error);
                let result = self
                    .streams
                    .finalize(&message_id, FINISH_ERROR, context.clone())
                    .await;
                if context.as_ref().is_some_and(|c| self.view.is_current(c)) {
                    self.renderer.show_stream_error(&message_id, &error).await;
                }
                result
            }
            StreamEvent::RemoveMessage {
                message_id,
                context,
            } => {
                if context.as_ref().is_some_and(|c| self.view.is_current(c)) {
                    self.renderer.remove_message(&message_id);
                }
                Ok(())
            }
        }
    }

    /// Starts `placeholder` as a stream and sends `request`. A full response
    /// is committed through the same stream; a transport failure finalizes
    /// it with `error`.
    pub async fn send(&self, request: ChatRequest, mut placeholder: Message) -> Result<()> {
        let Some(transport) = self.transport.clone() else {
            return Err(CoreError::Transport("no chat transport configured".into()));
        };
        let context = request.context.clone();
        placeholder.id = request.message_id.clone();
        let message_id = placeholder.id.clone();
        self.streams.start(placeholder, context.clone()).await?;

        match transport.send_chat_request(request).await {
            Ok(ChatResponse::StreamingStarted) => {
                debug!("Streaming started for {}", message_id);
                Ok(())
            }
            Ok(ChatResponse::Choices(choices)) => match choices.first() {
                Some(choice) => {
                    self.streams
                        .append(&message_id, choice.message.content.as_str(), None);
                    self.streams
                        .finalize(&message_id, choice.finish_reason(), None)
                        .await
                }
                None => {
                    self.fail_stream(&message_id, &context, "empty response from backend")
                        .await;
                    Err(CoreError::Transport("empty response".into()))
                }
            },
            Err(e) => {
                self.fail_stream(&message_id, &context, &e.to_string()).await;
                Err(e)
            }
        }
    }

    /// Asks the backend to stop; if that fails the stream is closed locally
    /// as cancelled so it cannot stay open.
    pub async fn interrupt(&self, message_id: &str) -> Result<()> {
        if let Some(transport) = &self.transport {
            match transport.interrupt(message_id).await {
                Ok(()) => {
                    info!("Interrupt sent for {}", message_id);
                    return Ok(());
                }
                Err(e) => warn!("Remote interrupt of {} failed: {}", message_id, e),
            }
        }
        self.streams.finalize(message_id, FINISH_CANCELLED, None).await
    }

    async fn fail_stream(&self, message_id: &str, context: &DeliveryContext, reason: &str) {
        if let Err(e) = self
            .streams
            .finalize(message_id, FINISH_ERROR, Some(context.clone()))
            .await
        {
            warn!("Failed to close stream {}: {}", message_id, e);
        }
        if self.view.is_current(context) {
            self.renderer.show_stream_error(message_id, reason).await;
        } else {
            let _ = self
                .event_tx
                .send(CoreEvent::error(format!("Request failed: {}", reason)));
        }
    }
}

fn assistant_from_context(message_id: &str, context: &DeliveryContext) -> Message {
    let mut message = Message::new(message_id, Role::Assistant, "");
    message.name = context.agent_name.clone();
    message.agent_id = context.agent_id.clone();
    message.avatar_url = context.avatar_url.clone();
    message.avatar_color = context.avatar_color.clone();
    message.is_group_message = context.is_group_message;
    message
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::constants::FINISH_COMPLETED;
    use crate::render::{DisplayList, NoopColorPersister};
    use crate::store::MemoryHistoryStore;
    use crate::streaming::StreamPhase;
    use crate::transport::{Choice, ChoiceMessage, ModelConfig};
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use serde_json::json;

    struct ScriptedTransport {
        response: Mutex<Option<Result<ChatResponse>>>,
        interrupt_ok: bool,
        interrupted: Mutex<Vec<String>>,
    }

    impl ScriptedTransport {
        fn new(response: Result<ChatResponse>, interrupt_ok: bool) -> Self {
            Self {
                response: Mutex::new(Some(response)),
                interrupt_ok,
                interrupted: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl ChatTransport for ScriptedTransport {
        async fn send_chat_request(&self, _request: ChatRequest) -> Result<ChatResponse> {
            self.response
                .lock()
                .take()
                .unwrap_or(Ok(ChatResponse::StreamingStarted))
        }

        async fn interrupt(&self, message_id: &str) -> Result<()> {
            self.interrupted.lock().push(message_id.to_string());
            if self.interrupt_ok {
                Ok(())
            } else {
                Err(CoreError::Transport("unreachable".into()))
            }
        }
    }

    struct Harness {
        runtime: CoreRuntime,
        store: Arc<MemoryHistoryStore>,
        display: Arc<DisplayList>,
    }

    fn harness() -> Harness {
        harness_with(None)
    }

    fn harness_with(transport: Option<Arc<dyn ChatTransport>>) -> Harness {
        let store = Arc::new(MemoryHistoryStore::new());
        let display = Arc::new(DisplayList::new());
        let mut runtime = CoreRuntime::from_parts(
            CoreConfig::new("unused"),
            GlobalSettings::default(),
            RuleSet::default(),
            store.clone(),
            display.clone(),
            Arc::new(NoopColorPersister),
        );
        if let Some(transport) = transport {
            runtime = runtime.with_transport(transport);
        }
        Harness {
            runtime,
            store,
            display,
        }
    }

    fn key() -> HistoryKey {
        HistoryKey::new(Owner::Agent("a1".into()), "t1")
    }

    fn ctx_json() -> serde_json::Value {
        json!({"agentId": "a1", "topicId": "t1", "agentName": "Nova"})
    }

    fn event(value: serde_json::Value) -> StreamEvent {
        serde_json::from_value(value).unwrap()
    }

    async fn open(h: &Harness) {
        let mut selection = ActiveSelection::new(Owner::Agent("a1".into()), "t1");
        selection.name = Some("Nova".into());
        h.runtime.open_conversation(selection).await.unwrap();
    }

    fn request(message_id: &str) -> ChatRequest {
        ChatRequest {
            endpoint: "http://localhost".into(),
            api_key: String::new(),
            messages: Vec::new(),
            model: ModelConfig::default(),
            message_id: message_id.into(),
            context: DeliveryContext::agent("a1", "t1"),
        }
    }

    #[tokio::test]
    async fn test_stream_events_end_to_end() {
        let mut h = harness();
        let mut events = h.runtime.take_event_receiver().unwrap();
        open(&h).await;

        for e in [
            json!({"type": "data", "messageId": "m1", "chunk": "early ", "context": ctx_json()}),
            json!({"type": "start", "messageId": "m1", "context": ctx_json(), "timestamp": 1000}),
            json!({"type": "data", "messageId": "m1", "chunk": {"choices": [{"delta": {"content": "reply"}}]}}),
            json!({"type": "end", "messageId": "m1", "context": ctx_json()}),
        ] {
            h.runtime.handle_stream_event(event(e)).await.unwrap();
        }

        let node = h.display.node("m1").unwrap();
        assert!(node.content_html.contains("early reply"));
        assert!(!node.streaming);
        assert_eq!(node.name.unwrap().text, "Nova");
        let saved = h.store.get(&key()).unwrap();
        assert_eq!(saved[0].text(), Some("early reply"));
        assert_eq!(saved[0].finish_reason.as_deref(), Some(FINISH_COMPLETED));
        assert!(matches!(
            events.try_recv(),
            Ok(CoreEvent::StreamFinalized { .. })
        ));
    }

    #[tokio::test]
    async fn test_error_event_inline_and_background() {
        let h = harness();
        open(&h).await;
        h.runtime
            .handle_stream_event(event(json!({"type": "start", "messageId": "m1", "context": ctx_json()})))
            .await
            .unwrap();
        h.runtime
            .handle_stream_event(event(json!({"type": "error", "messageId": "m1", "error": "boom", "context": ctx_json()})))
            .await
            .unwrap();
        assert!(h.display.node("m1").unwrap().content_html.contains("boom"));
        assert_eq!(h.runtime.streams().phase("m1"), Some(StreamPhase::Finalized));

        // background conversation: finalized, nothing shown
        let other = json!({"agentId": "a2", "topicId": "t9"});
        h.runtime
            .handle_stream_event(event(json!({"type": "start", "messageId": "m2", "context": other.clone()})))
            .await
            .unwrap();
        h.runtime
            .handle_stream_event(event(json!({"type": "error", "messageId": "m2", "error": "x", "context": other})))
            .await
            .unwrap();
        assert!(!h.display.contains("err_m2"));
        assert_eq!(h.runtime.streams().phase("m2"), Some(StreamPhase::Finalized));
    }

    #[tokio::test]
    async fn test_agent_thinking_replaced_by_stream() {
        let h = harness();
        open(&h).await;
        let group_ctx = json!({"agentId": "a1", "topicId": "t1", "agentName": "Kai"});
        h.runtime
            .handle_stream_event(event(json!({"type": "agent_thinking", "messageId": "g1", "context": group_ctx.clone()})))
            .await
            .unwrap();
        assert!(h.display.node("g1").unwrap().has_class("thinking"));

        h.runtime
            .handle_stream_event(event(json!({"type": "start", "messageId": "g1", "context": group_ctx})))
            .await
            .unwrap();
        assert!(!h.display.node("g1").unwrap().has_class("thinking"));
        assert_eq!(h.runtime.view().history().len(), 1);
        assert!(!h.runtime.view().message("g1").unwrap().is_thinking);
    }

    #[tokio::test]
    async fn test_remove_message_event() {
        let h = harness();
        open(&h).await;
        h.runtime
            .add_message(Message::new("u1", Role::User, "hello"))
            .await
            .unwrap();
        assert_eq!(h.store.get(&key()).unwrap().len(), 1);
        h.runtime
            .handle_stream_event(event(json!({"type": "remove_message", "messageId": "u1", "context": ctx_json()})))
            .await
            .unwrap();
        assert!(!h.display.contains("u1"));
        assert!(h.runtime.view().message("u1").is_none());
    }

    #[tokio::test]
    async fn test_send_full_response() {
        let transport = ScriptedTransport::new(
            Ok(ChatResponse::Choices(vec![Choice {
                index: 0,
                message: ChoiceMessage {
                    content: "whole answer".into(),
                },
                finish_reason: Some("stop".into()),
            }])),
            true,
        );
        let h = harness_with(Some(Arc::new(transport)));
        open(&h).await;

        h.runtime
            .send(request("r1"), Message::new("", Role::Assistant, ""))
            .await
            .unwrap();
        let saved = h.store.get(&key()).unwrap();
        assert_eq!(saved[0].id, "r1");
        assert_eq!(saved[0].text(), Some("whole answer"));
        assert_eq!(saved[0].finish_reason.as_deref(), Some("stop"));
    }

    #[tokio::test]
    async fn test_send_failure_finalizes_with_error() {
        let transport = ScriptedTransport::new(Err(CoreError::Transport("refused".into())), true);
        let h = harness_with(Some(Arc::new(transport)));
        open(&h).await;

        let err = h
            .runtime
            .send(request("r1"), Message::new("", Role::Assistant, ""))
            .await
            .unwrap_err();
        assert!(matches!(err, CoreError::Transport(_)));
        assert_eq!(h.runtime.streams().phase("r1"), Some(StreamPhase::Finalized));
        assert!(h.display.node("r1").unwrap().content_html.contains("refused"));
        assert_eq!(
            h.store.get(&key()).unwrap()[0].finish_reason.as_deref(),
            Some(FINISH_ERROR)
        );
    }

    #[tokio::test]
    async fn test_interrupt_falls_back_to_local_cancel() {
        let transport = Arc::new(ScriptedTransport::new(Ok(ChatResponse::StreamingStarted), false));
        let h = harness_with(Some(transport.clone()));
        open(&h).await;
        h.runtime
            .send(request("r1"), Message::new("", Role::Assistant, ""))
            .await
            .unwrap();
        assert_eq!(h.runtime.streams().phase("r1"), Some(StreamPhase::Ready));

        h.runtime.interrupt("r1").await.unwrap();
        assert_eq!(*transport.interrupted.lock(), vec!["r1".to_string()]);
        assert_eq!(
            h.store.get(&key()).unwrap()[0].finish_reason.as_deref(),
            Some(FINISH_CANCELLED)
        );
    }

    #[tokio::test]
    async fn test_open_conversation_drops_thinking() {
        let h = harness();
        let mut thinking = Message::new("t0", Role::Assistant, "");
        thinking.is_thinking = true;
        h.store.put(
            key(),
            vec![Message::new("u1", Role::User, "hi").with_timestamp(1), thinking],
        );
        let rendered = h
            .runtime
            .open_conversation(ActiveSelection::new(Owner::Agent("a1".into()), "t1"))
            .await
            .unwrap();
        assert_eq!(rendered, 1);
        assert_eq!(h.display.ids(), vec!["u1"]);
        assert_eq!(h.runtime.view().history().len(), 1);
    }

    #[tokio::test]
    async fn test_file_backed_runtime_loads_settings_and_rules() {
        let dir = tempfile::tempdir().unwrap();
        let config = CoreConfig::new(dir.path());
        GlobalSettings {
            user_name: "Ada".into(),
            ..Default::default()
        }
        .save_to_file(&config.settings_path())
        .unwrap();
        std::fs::write(
            config.rules_path(),
            r#"[{"title": "shout", "findPattern": "/hi/g", "replaceWith": "HI", "applyToRoles": ["user"]}]"#,
        )
        .unwrap();

        let display = Arc::new(DisplayList::new());
        let runtime = CoreRuntime::new(config, display.clone()).unwrap();
        assert_eq!(runtime.settings().snapshot().user_name, "Ada");
        runtime
            .open_conversation(ActiveSelection::new(Owner::Agent("a1".into()), "t1"))
            .await
            .unwrap();
        runtime
            .add_message(Message::new("u1", Role::User, "hi there"))
            .await
            .unwrap();
        let node = display.node("u1").unwrap();
        assert!(node.content_html.contains("HI there"));
        assert_eq!(node.name.unwrap().text, "Ada");
        assert!(dir
            .path()
            .join("a1")
            .join("topics")
            .join("t1")
            .join("history.json")
            .exists());
    }
}
