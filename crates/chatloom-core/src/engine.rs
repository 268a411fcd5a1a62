//! Send, regenerate, branch and stop: the flows that tie the store, the
//! transports and stream recovery together.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use chatloom_llm::{
    ChatMessage, ChatOptions, ChatRequest, ChatTransport, Error as TransportError, Role,
    TokenUsage,
};
use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::mpsc;

use crate::branch::{build_message_tree, get_active_path, switch_to_branch};
use crate::collab::{ImagePipeline, UsageTracker};
use crate::config::EngineConfig;
use crate::error::{EngineError, Result};
use crate::event::EngineEvent;
use crate::ingest::{AbortSignal, ContentUpdate, IngestEffect, Ingestor, StreamPhase};
use crate::model::{Attachment, Message, StreamStatus, now_ms, temp_id};
use crate::recovery::{StreamState, StreamStateManager};
use crate::store::ConversationStore;
use crate::title::{derive_title, should_retitle};
use crate::tree::{context_before, path_to_root};

pub const LOCAL_MODEL_PREFIX: &str = "ollama/";
pub const BRANCH_PLACEHOLDER: &str = "🌿 Generating alternative response...";
pub const BRANCH_INSTRUCTION: &str = "\n\n[Please provide an alternative response with a different perspective, approach, or style. Be creative and offer a unique take on this request.]";
pub const BRANCH_TEMPERATURE: f32 = 0.9;

const IMAGE_MODELS: &[&str] = &["gpt-image-1", "dall-e-3", "dall-e-2"];
const IMAGE_KEY_ERROR: &str =
    "⚠️ Failed to generate image. Please check your API key and try again.";
const ABORT_REASON: &str = "User cancelled";
const STOP_REASON: &str = "User stopped generation";

#[derive(Debug, Clone, Default)]
pub struct SendOptions {
    /// Overrides the conversation's model for this request.
    pub model: Option<String>,
    pub temperature: Option<f32>,
    pub web_search: bool,
    pub image_generation: Option<Value>,
}

/// How a generation ended.
#[derive(Debug, Clone, PartialEq)]
pub struct GenerationOutcome {
    pub stream_id: String,
    pub message_id: String,
    pub status: StreamStatus,
    pub content: String,
    pub tokens: u64,
    pub usage: Option<TokenUsage>,
}

enum StreamEnd {
    Completed,
    Aborted,
    Errored(TransportError),
}

// ---------------------------------------------------------------------------
// Active stream registry
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
struct ActiveStream {
    abort: AbortSignal,
    stream_id: Option<String>,
}

type ActiveStreams = Arc<Mutex<HashMap<String, ActiveStream>>>;

/// Holds a conversation's stream slot. Dropping it frees the slot.
struct StreamSlot {
    active: ActiveStreams,
    conversation_id: String,
    abort: AbortSignal,
}

impl StreamSlot {
    fn set_stream_id(&self, stream_id: &str) {
        if let Some(entry) = self.active.lock().get_mut(&self.conversation_id) {
            entry.stream_id = Some(stream_id.to_string());
        }
    }
}

impl Drop for StreamSlot {
    fn drop(&mut self) {
        self.active.lock().remove(&self.conversation_id);
    }
}

// ---------------------------------------------------------------------------
// Engine
// ---------------------------------------------------------------------------

pub struct ChatEngine {
    store: Arc<ConversationStore>,
    transport: Arc<dyn ChatTransport>,
    local_transport: Option<Arc<dyn ChatTransport>>,
    recovery: Arc<StreamStateManager>,
    image_pipeline: Option<Arc<dyn ImagePipeline>>,
    usage_tracker: Option<Arc<dyn UsageTracker>>,
    events: Option<mpsc::UnboundedSender<EngineEvent>>,
    active: ActiveStreams,
    /// Branch the user picked per conversation.
    selections: Mutex<HashMap<String, String>>,
    config: EngineConfig,
}

impl ChatEngine {
    pub fn new(
        store: Arc<ConversationStore>,
        transport: Arc<dyn ChatTransport>,
        recovery: Arc<StreamStateManager>,
    ) -> Self {
        let config = store.config().clone();
        Self {
            store,
            transport,
            local_transport: None,
            recovery,
            image_pipeline: None,
            usage_tracker: None,
            events: None,
            active: Arc::new(Mutex::new(HashMap::new())),
            selections: Mutex::new(HashMap::new()),
            config,
        }
    }

    pub fn local_transport(&mut self, transport: Arc<dyn ChatTransport>) -> &mut Self {
        self.local_transport = Some(transport);
        self
    }

    pub fn image_pipeline(&mut self, pipeline: Arc<dyn ImagePipeline>) -> &mut Self {
        self.image_pipeline = Some(pipeline);
        self
    }

    pub fn usage_tracker(&mut self, tracker: Arc<dyn UsageTracker>) -> &mut Self {
        self.usage_tracker = Some(tracker);
        self
    }

    pub fn config(&mut self, config: EngineConfig) -> &mut Self {
        self.config = config;
        self
    }

    /// Start receiving [`EngineEvent`]s. Replaces any previous subscriber.
    pub fn subscribe(&mut self) -> mpsc::UnboundedReceiver<EngineEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.events = Some(tx);
        rx
    }

    pub fn store(&self) -> &Arc<ConversationStore> {
        &self.store
    }

    pub fn recovery(&self) -> &Arc<StreamStateManager> {
        &self.recovery
    }

    pub fn is_streaming(&self, conversation_id: &str) -> bool {
        self.active_key(conversation_id).is_some()
    }

    // -----------------------------------------------------------------------
    // Flows
    // -----------------------------------------------------------------------

    /// Append a user message under the active leaf and stream a reply to it.
    pub async fn send_message(
        &self,
        conversation_id: &str,
        content: &str,
        attachments: Vec<Attachment>,
        options: SendOptions,
    ) -> Result<GenerationOutcome> {
        let conversation_id = self.store.resolve_id(conversation_id);
        let conversation = self
            .store
            .conversation(&conversation_id)
            .ok_or_else(|| EngineError::ConversationNotFound(conversation_id.clone()))?;
        let slot = self.reserve(&conversation_id)?;

        let model = options
            .model
            .clone()
            .unwrap_or_else(|| conversation.model.clone());
        let parent_id = self.active_path(&conversation_id).last().map(|m| m.id.clone());

        let user = Message::new(temp_id(), &conversation_id, Role::User, content)
            .parent(parent_id)
            .model(model.clone())
            .attachments(attachments)
            .created_at(self.next_created_at(&conversation_id));
        let user = self.store.add_message(user).await;

        let assistant = self.insert_placeholder(&conversation_id, Some(user.id.clone()), &model, "");
        self.select(&conversation_id, &assistant.id);

        let context = self.context_for(&conversation_id, &assistant.id);
        let request = ChatRequest::new(model, context)
            .conversation(conversation_id.clone())
            .options(chat_options(&options));

        let outcome = self
            .run_stream(slot, &conversation_id, &assistant.id, request)
            .await;

        if outcome.status == StreamStatus::Complete {
            self.maybe_retitle(&conversation_id);
        }
        Ok(outcome)
    }

    /// Replace the latest assistant reply with a freshly generated sibling.
    pub async fn regenerate(
        &self,
        conversation_id: &str,
        message_id: &str,
    ) -> Result<GenerationOutcome> {
        let conversation_id = self.store.resolve_id(conversation_id);
        let conversation = self
            .store
            .conversation(&conversation_id)
            .ok_or_else(|| EngineError::ConversationNotFound(conversation_id.clone()))?;
        let message_id = self.store.resolve_message_id(message_id);
        let message_id = message_id.as_str();

        let messages = self.store.messages(&conversation_id);
        let target = messages
            .iter()
            .find(|m| m.id == message_id)
            .ok_or_else(|| EngineError::MessageNotFound(message_id.to_string()))?;
        let has_children = messages
            .iter()
            .any(|m| m.parent_id.as_deref() == Some(message_id));
        if target.role != Role::Assistant || has_children {
            return Err(EngineError::NotRegenerable(message_id.to_string()));
        }

        let slot = self.reserve(&conversation_id)?;
        let model = target
            .model
            .clone()
            .unwrap_or_else(|| conversation.model.clone());
        let parent_id = target.parent_id.clone();
        let context: Vec<ChatMessage> = context_before(&messages, message_id)
            .iter()
            .map(Message::to_chat_message)
            .collect();

        self.store.delete_message(&conversation_id, message_id);
        let assistant = self.insert_placeholder(&conversation_id, parent_id, &model, "");
        self.select(&conversation_id, &assistant.id);

        let request = ChatRequest::new(model, context).conversation(conversation_id.clone());
        Ok(self
            .run_stream(slot, &conversation_id, &assistant.id, request)
            .await)
    }

    /// Generate an alternative reply next to `from_message_id`, keeping it.
    pub async fn create_branch(
        &self,
        conversation_id: &str,
        from_message_id: &str,
    ) -> Result<GenerationOutcome> {
        let conversation_id = self.store.resolve_id(conversation_id);
        let conversation = self
            .store
            .conversation(&conversation_id)
            .ok_or_else(|| EngineError::ConversationNotFound(conversation_id.clone()))?;
        let from_message_id = self.store.resolve_message_id(from_message_id);
        let from_message_id = from_message_id.as_str();

        let messages = self.store.messages(&conversation_id);
        if !messages.iter().any(|m| m.id == from_message_id) {
            return Err(EngineError::MessageNotFound(from_message_id.to_string()));
        }
        let prompt = prompting_user_message(&messages, from_message_id)
            .ok_or_else(|| EngineError::NoPromptForBranch(from_message_id.to_string()))?;

        let slot = self.reserve(&conversation_id)?;
        let model = messages
            .iter()
            .find(|m| m.id == from_message_id && m.role == Role::Assistant)
            .and_then(|m| m.model.clone())
            .unwrap_or_else(|| conversation.model.clone());

        let mut context: Vec<ChatMessage> = context_before(&messages, &prompt.id)
            .iter()
            .map(Message::to_chat_message)
            .collect();
        context.push(prompt.to_chat_message());
        if let Some(last_user) = context.iter_mut().rev().find(|m| m.role == Role::User) {
            last_user.content.push_str(BRANCH_INSTRUCTION);
        }

        let assistant = self.insert_placeholder(
            &conversation_id,
            Some(prompt.id.clone()),
            &model,
            BRANCH_PLACEHOLDER,
        );
        self.select(&conversation_id, &assistant.id);

        let request = ChatRequest::new(model, context)
            .conversation(conversation_id.clone())
            .options(ChatOptions {
                temperature: Some(BRANCH_TEMPERATURE),
                ..ChatOptions::default()
            });
        Ok(self
            .run_stream(slot, &conversation_id, &assistant.id, request)
            .await)
    }

    /// Cancel the conversation's running generation. Returns false when
    /// nothing was streaming.
    pub fn stop_generation(&self, conversation_id: &str) -> bool {
        let Some(key) = self.active_key(conversation_id) else {
            return false;
        };
        let Some(active) = self.active.lock().get(&key).cloned() else {
            return false;
        };
        active.abort.abort();
        if let Some(stream_id) = active.stream_id.as_deref() {
            self.recovery.mark_stream_aborted(stream_id, Some(STOP_REASON));
        }
        tracing::info!(conversation_id = %key, "generation stopped");
        true
    }

    /// Root-to-leaf messages along the selected branches.
    pub fn active_path(&self, conversation_id: &str) -> Vec<Message> {
        let conversation_id = self.store.resolve_id(conversation_id);
        let tree = build_message_tree(&self.store.messages(&conversation_id));
        let selected = self
            .selections
            .lock()
            .get(&conversation_id)
            .map(|id| self.store.resolve_message_id(id));
        match selected {
            Some(id) if tree.get(&id).is_some() => get_active_path(&switch_to_branch(&tree, &id)),
            _ => get_active_path(&tree),
        }
    }

    pub fn switch_branch(&self, conversation_id: &str, message_id: &str) -> Result<Vec<Message>> {
        let conversation_id = self.store.resolve_id(conversation_id);
        let Some(message) = self.store.message(&conversation_id, message_id) else {
            return Err(EngineError::MessageNotFound(message_id.to_string()));
        };
        self.select(&conversation_id, &message.id);
        Ok(self.active_path(&conversation_id))
    }

    // -----------------------------------------------------------------------
    // Streaming
    // -----------------------------------------------------------------------

    async fn run_stream(
        &self,
        slot: StreamSlot,
        conversation_id: &str,
        message_id: &str,
        request: ChatRequest,
    ) -> GenerationOutcome {
        let abort = slot.abort.clone();
        let mut phase = StreamPhase::Idle;
        self.set_phase(&mut phase, StreamPhase::Sending, conversation_id, message_id);

        let mut state = StreamState::start(
            conversation_id,
            message_id,
            request.model.clone(),
            request.messages.clone(),
        );
        slot.set_stream_id(&state.stream_id);
        self.recovery.begin(&state);
        let stream_id = state.stream_id.clone();
        self.store
            .update_message_with(conversation_id, message_id, |m| {
                m.stream_id = Some(stream_id.clone());
                m.stream_state = Some(StreamStatus::Streaming);
                m.is_complete = Some(false);
            });

        let model = request.model.clone();
        let transport = self.select_transport(&model).await;
        tracing::info!(
            conversation_id,
            message_id,
            stream_id = %stream_id,
            transport = transport.name(),
            model = %model,
            "starting generation"
        );

        let mut stream = transport.stream_chat(request);
        let mut ingestor = Ingestor::new(
            self.config.progress_interval(),
            self.config.idle_content_threshold,
        );

        let end = loop {
            if let Some(update) = ingestor.take_idle() {
                tokio::task::yield_now().await;
                self.apply_content(conversation_id, message_id, update);
            }

            let next = tokio::select! {
                biased;
                _ = abort.aborted() => break StreamEnd::Aborted,
                chunk = stream.next() => chunk,
            };

            match next {
                None => break StreamEnd::Completed,
                Some(Err(err)) => break StreamEnd::Errored(err),
                Some(Ok(bytes)) => {
                    if phase == StreamPhase::Sending {
                        self.set_phase(&mut phase, StreamPhase::Streaming, conversation_id, message_id);
                    }
                    let effects = ingestor.push(&bytes, Instant::now());
                    self.apply_effects(conversation_id, message_id, effects);
                    self.recovery.record_progress(&mut state, ingestor.tokens());
                }
            }
        };
        drop(stream);

        let effects = match &end {
            StreamEnd::Completed => ingestor.finish(Instant::now()),
            _ => ingestor.take_idle().map(IngestEffect::Content).into_iter().collect(),
        };
        self.apply_effects(conversation_id, message_id, effects);

        let (status, next_phase, content) = match end {
            StreamEnd::Completed => {
                self.recovery.mark_stream_complete(&stream_id);
                (StreamStatus::Complete, StreamPhase::Completed, None)
            }
            StreamEnd::Aborted => {
                self.recovery.mark_stream_aborted(&stream_id, Some(ABORT_REASON));
                (StreamStatus::Aborted, StreamPhase::Aborted, None)
            }
            StreamEnd::Errored(err) => {
                tracing::warn!(conversation_id, message_id, error = %err, "generation failed");
                let marker = error_content(&model, &err);
                self.recovery.mark_stream_error(&stream_id, Some(&err.user_message()));
                (StreamStatus::Error, StreamPhase::Errored, Some(marker))
            }
        };
        self.recovery.settle_tokens(&stream_id, ingestor.tokens());

        let content = match content {
            Some(marker) => marker,
            None if ingestor.image_requested() => self
                .store
                .message(conversation_id, message_id)
                .map(|m| m.content)
                .unwrap_or_default(),
            None => ingestor.content().to_string(),
        };
        let write_content = status == StreamStatus::Error
            || (!ingestor.image_requested() && !ingestor.content().is_empty());
        let tokens = ingestor.tokens();
        let usage = ingestor.usage();

        self.store
            .update_message_with(conversation_id, message_id, |m| {
                if write_content {
                    m.content = content.clone();
                }
                m.stream_state = Some(status);
                m.is_complete = Some(status == StreamStatus::Complete);
                m.tokens_generated = Some(tokens);
                m.total_tokens = usage.map(|u| u.total());
            });
        if status == StreamStatus::Error {
            self.emit(EngineEvent::ContentUpdated {
                conversation_id: conversation_id.to_string(),
                message_id: message_id.to_string(),
                content: content.clone(),
                priority: crate::ingest::UpdatePriority::Transition,
            });
        }
        self.store.commit_message(conversation_id, message_id);
        // A pending image publishes once the pipeline has the final content.
        let image_pending = ingestor.image_requested() && self.image_pipeline.is_some();
        if status != StreamStatus::Error && !image_pending {
            self.store.publish_message(conversation_id, message_id).await;
        }
        self.set_phase(&mut phase, next_phase, conversation_id, message_id);

        tracing::info!(
            conversation_id,
            message_id,
            stream_id = %stream_id,
            status = status.as_str(),
            tokens,
            "generation finished"
        );

        let content = self
            .store
            .message(conversation_id, message_id)
            .map(|m| m.content)
            .unwrap_or(content);
        GenerationOutcome {
            stream_id,
            message_id: message_id.to_string(),
            status,
            content,
            tokens,
            usage,
        }
    }

    fn apply_effects(&self, conversation_id: &str, message_id: &str, effects: Vec<IngestEffect>) {
        for effect in effects {
            match effect {
                IngestEffect::Content(update) => {
                    self.apply_content(conversation_id, message_id, update);
                }
                IngestEffect::Tokens(tokens) => {
                    self.store
                        .update_message_with(conversation_id, message_id, |m| {
                            m.tokens_generated = Some(tokens);
                        });
                    self.emit(EngineEvent::TokensUpdated {
                        message_id: message_id.to_string(),
                        tokens,
                        usage: None,
                    });
                }
                IngestEffect::Usage { usage, battery } => {
                    if let Some(tracker) = &self.usage_tracker {
                        tracker.record_usage(usage, battery);
                    }
                    self.store
                        .update_message_with(conversation_id, message_id, |m| {
                            m.tokens_generated = Some(usage.total());
                            m.total_tokens = Some(usage.total());
                        });
                    self.emit(EngineEvent::TokensUpdated {
                        message_id: message_id.to_string(),
                        tokens: usage.total(),
                        usage: Some(usage),
                    });
                }
                IngestEffect::Image(request) => {
                    self.spawn_image_pipeline(conversation_id, message_id, request);
                }
                IngestEffect::Progress => self.emit(EngineEvent::Progress {
                    message_id: message_id.to_string(),
                }),
            }
        }
    }

    fn apply_content(&self, conversation_id: &str, message_id: &str, update: ContentUpdate) {
        self.store
            .update_message(conversation_id, message_id, &update.content);
        self.emit(EngineEvent::ContentUpdated {
            conversation_id: conversation_id.to_string(),
            message_id: message_id.to_string(),
            content: update.content,
            priority: update.priority,
        });
    }

    fn spawn_image_pipeline(
        &self,
        conversation_id: &str,
        message_id: &str,
        request: chatloom_llm::ImageGenerationRequest,
    ) {
        let Some(pipeline) = self.image_pipeline.clone() else {
            tracing::warn!(message_id, "image generated but no image pipeline is configured");
            return;
        };
        let store = self.store.clone();
        let events = self.events.clone();
        let conversation_id = conversation_id.to_string();
        let message_id = message_id.to_string();

        tokio::spawn(async move {
            let content = match pipeline.process(&request).await {
                Ok(url) => format!("![Generated Image]({url})"),
                Err(err) => {
                    tracing::warn!(message_id = %message_id, error = %err, "image processing failed");
                    format!("❌ Error processing image: {err}")
                }
            };
            store.update_message(&conversation_id, &message_id, &content);
            store.commit_message(&conversation_id, &message_id);
            store.publish_message(&conversation_id, &message_id).await;
            if let Some(events) = events {
                let _ = events.send(EngineEvent::ImageResolved {
                    message_id,
                    content,
                });
            }
        });
    }

    // -----------------------------------------------------------------------
    // Helpers
    // -----------------------------------------------------------------------

    fn reserve(&self, conversation_id: &str) -> Result<StreamSlot> {
        if self.active_key(conversation_id).is_some() {
            return Err(EngineError::StreamInProgress(conversation_id.to_string()));
        }
        let mut active = self.active.lock();
        if active.contains_key(conversation_id) {
            return Err(EngineError::StreamInProgress(conversation_id.to_string()));
        }
        let abort = AbortSignal::new();
        active.insert(
            conversation_id.to_string(),
            ActiveStream {
                abort: abort.clone(),
                stream_id: None,
            },
        );
        Ok(StreamSlot {
            active: self.active.clone(),
            conversation_id: conversation_id.to_string(),
            abort,
        })
    }

    /// Registry key for a conversation, following temporary-id aliases.
    fn active_key(&self, conversation_id: &str) -> Option<String> {
        let wanted = self.store.resolve_id(conversation_id);
        let keys: Vec<String> = self.active.lock().keys().cloned().collect();
        keys.into_iter()
            .find(|key| key == conversation_id || self.store.resolve_id(key) == wanted)
    }

    async fn select_transport(&self, model: &str) -> Arc<dyn ChatTransport> {
        if model.starts_with(LOCAL_MODEL_PREFIX)
            && let Some(local) = &self.local_transport
        {
            if local.is_available().await {
                return local.clone();
            }
            tracing::warn!(model, "local model server unavailable, using backend");
        }
        self.transport.clone()
    }

    fn insert_placeholder(
        &self,
        conversation_id: &str,
        parent_id: Option<String>,
        model: &str,
        content: &str,
    ) -> Message {
        let mut message = Message::new(temp_id(), conversation_id, Role::Assistant, content)
            .parent(parent_id)
            .model(model)
            .created_at(self.next_created_at(conversation_id));
        message.stream_state = Some(StreamStatus::Streaming);
        message.is_complete = Some(false);
        self.store.insert_message(message)
    }

    fn context_for(&self, conversation_id: &str, message_id: &str) -> Vec<ChatMessage> {
        context_before(&self.store.messages(conversation_id), message_id)
            .iter()
            .map(Message::to_chat_message)
            .collect()
    }

    /// Strictly after every existing message, so sibling order is stable.
    fn next_created_at(&self, conversation_id: &str) -> i64 {
        let latest = self
            .store
            .messages(conversation_id)
            .iter()
            .map(|m| m.created_at_ms)
            .max();
        match latest {
            Some(latest) => now_ms().max(latest + 1),
            None => now_ms(),
        }
    }

    fn select(&self, conversation_id: &str, message_id: &str) {
        self.selections
            .lock()
            .insert(conversation_id.to_string(), message_id.to_string());
    }

    fn maybe_retitle(&self, conversation_id: &str) {
        let Some(conversation) = self.store.conversation(conversation_id) else {
            return;
        };
        let messages = self.store.messages(conversation_id);
        if !should_retitle(&conversation.title, messages.len()) {
            return;
        }
        let Some(first) = messages.iter().find(|m| m.role == Role::User) else {
            return;
        };
        let title = derive_title(&first.content);
        if self.store.rename_conversation(conversation_id, &title) {
            self.emit(EngineEvent::TitleUpdated {
                conversation_id: conversation.id,
                title,
            });
        }
    }

    fn set_phase(
        &self,
        phase: &mut StreamPhase,
        next: StreamPhase,
        conversation_id: &str,
        message_id: &str,
    ) {
        if phase.transition(next) {
            self.emit(EngineEvent::PhaseChanged {
                conversation_id: conversation_id.to_string(),
                message_id: message_id.to_string(),
                phase: next,
            });
        }
    }

    fn emit(&self, event: EngineEvent) {
        if let Some(events) = &self.events {
            let _ = events.send(event);
        }
    }
}

fn chat_options(options: &SendOptions) -> ChatOptions {
    ChatOptions {
        temperature: options.temperature,
        web_search: options.web_search,
        image_generation: options.image_generation.clone(),
    }
}

/// The user message a reply to `message_id` answers: the message itself if
/// it is a user message, otherwise the nearest user ancestor, otherwise the
/// last user message listed before it.
fn prompting_user_message(messages: &[Message], message_id: &str) -> Option<Message> {
    let path = path_to_root(messages, message_id);
    if let Some(found) = path.messages.iter().rev().find(|m| m.role == Role::User) {
        return Some((*found).clone());
    }
    let index = messages.iter().position(|m| m.id == message_id)?;
    messages[..index]
        .iter()
        .rev()
        .find(|m| m.role == Role::User)
        .cloned()
}

fn error_content(model: &str, err: &TransportError) -> String {
    let message = err.user_message();
    let bare_model = model.strip_prefix(LOCAL_MODEL_PREFIX).unwrap_or(model);
    if IMAGE_MODELS.contains(&bare_model) && message.contains("API") {
        return IMAGE_KEY_ERROR.to_string();
    }
    format!("⚠️ Error: {message}")
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use chatloom_llm::{Error, Role};
    use serde_json::json;
    use tokio::sync::mpsc::UnboundedReceiver;

    use super::{BRANCH_INSTRUCTION, ChatEngine, SendOptions};
    use crate::error::EngineError;
    use crate::event::EngineEvent;
    use crate::ingest::{IMAGE_PLACEHOLDER, StreamPhase};
    use crate::migrate::DefaultMigrator;
    use crate::model::StreamStatus;
    use crate::recovery::{MemoryStreamStateStore, StreamStateManager, StreamStateStore};
    use crate::store::ConversationStore;
    use crate::testing::{
        FakeImages, FakeOffline, FakeRemote, FakeSync, FakeTransport, FakeUsage, Script,
    };

    struct Harness {
        engine: Arc<ChatEngine>,
        events: UnboundedReceiver<EngineEvent>,
        transport: Arc<FakeTransport>,
        remote: Arc<FakeRemote>,
        streams: Arc<MemoryStreamStateStore>,
        conversation_id: String,
    }

    async fn harness(configure: impl FnOnce(&mut ChatEngine)) -> Harness {
        let remote = Arc::new(FakeRemote::default());
        let store = Arc::new(ConversationStore::new(
            Arc::new(FakeOffline::default()),
            remote.clone(),
            Arc::new(FakeSync::online()),
            Arc::new(DefaultMigrator),
        ));
        let conversation = store.create_conversation(None, Some("gpt-4o")).await;
        let transport = Arc::new(FakeTransport::new("backend"));
        let streams = Arc::new(MemoryStreamStateStore::new());
        let recovery = Arc::new(StreamStateManager::new(streams.clone()));

        let mut engine = ChatEngine::new(store, transport.clone(), recovery);
        let events = engine.subscribe();
        configure(&mut engine);

        Harness {
            engine: Arc::new(engine),
            events,
            transport,
            remote,
            streams,
            conversation_id: conversation.id,
        }
    }

    /// Serve every message the engine has published back under fresh server
    /// ids, keeping the parent ids it posted.
    fn echo_published(h: &Harness) {
        let records = h
            .remote
            .created_messages()
            .into_iter()
            .enumerate()
            .map(|(index, (conversation_id, message))| {
                let created_at = h
                    .engine
                    .store()
                    .message(&conversation_id, &message.client_id)
                    .map(|m| m.created_at_ms)
                    .unwrap_or_default();
                json!({
                    "id": format!("s-{index}"),
                    "conversationId": conversation_id,
                    "role": message.role.as_str(),
                    "content": message.content,
                    "parentId": message.parent_id,
                    "createdAt": created_at,
                })
            })
            .collect();
        h.remote.set_messages(&h.conversation_id, records);
    }

    async fn wait_for(
        events: &mut UnboundedReceiver<EngineEvent>,
        mut matches: impl FnMut(&EngineEvent) -> bool,
    ) -> EngineEvent {
        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                let event = events.recv().await.expect("event channel closed");
                if matches(&event) {
                    return event;
                }
            }
        })
        .await
        .expect("timed out waiting for engine event")
    }

    #[tokio::test]
    async fn send_streams_reply_and_titles_conversation() {
        let mut h = harness(|_| {}).await;
        h.transport.reply(&["Knead ", "the dough"]);

        let outcome = h
            .engine
            .send_message(&h.conversation_id, "How to bake bread?", Vec::new(), SendOptions::default())
            .await
            .unwrap();

        assert_eq!(outcome.status, StreamStatus::Complete);
        assert_eq!(outcome.content, "Knead the dough");

        let path = h.engine.active_path(&h.conversation_id);
        assert_eq!(path.len(), 2);
        assert_eq!(path[0].role, Role::User);
        assert_eq!(path[1].parent_id.as_deref(), Some(path[0].id.as_str()));
        assert_eq!(path[1].is_complete, Some(true));

        let request = &h.transport.requests()[0];
        assert_eq!(request.messages.len(), 1);
        assert_eq!(request.messages[0].content, "How to bake bread?");

        let title = h.engine.store().conversation(&h.conversation_id).unwrap().title;
        assert!(title.starts_with("How to bake bread"), "{title}");
        wait_for(&mut h.events, |e| matches!(e, EngineEvent::TitleUpdated { .. })).await;

        let record = h.streams.load(&outcome.stream_id).unwrap().unwrap();
        assert_eq!(record.status, StreamStatus::Complete);
    }

    #[tokio::test]
    async fn usage_frame_sets_token_count() {
        let usage = Arc::new(FakeUsage::default());
        let tracker = usage.clone();
        let h = harness(move |engine| {
            engine.usage_tracker(tracker);
        })
        .await;
        h.transport.script(Script::Chunks(vec![
            b"data: {\"content\":\"one two three\"}\n".to_vec(),
            b"data: {\"type\":\"usage\",\"usage\":{\"inputTokens\":12,\"outputTokens\":40}}\n"
                .to_vec(),
        ]));

        let outcome = h
            .engine
            .send_message(&h.conversation_id, "count", Vec::new(), SendOptions::default())
            .await
            .unwrap();
        assert_eq!(outcome.tokens, 52);
        assert_eq!(outcome.content, "one two three");
        assert_eq!(usage.records.lock().len(), 1);
    }

    #[tokio::test]
    async fn stop_keeps_partial_content() {
        let mut h = harness(|_| {}).await;
        h.transport.script(Script::ChunksThenHang(vec![
            b"data: {\"content\":\"partial\"}\n".to_vec(),
        ]));

        let task = {
            let engine = h.engine.clone();
            let id = h.conversation_id.clone();
            tokio::spawn(async move {
                engine
                    .send_message(&id, "go", Vec::new(), SendOptions::default())
                    .await
            })
        };
        wait_for(&mut h.events, |e| {
            matches!(e, EngineEvent::ContentUpdated { content, .. } if content == "partial")
        })
        .await;

        let second = h
            .engine
            .send_message(&h.conversation_id, "again", Vec::new(), SendOptions::default())
            .await;
        assert!(matches!(second, Err(EngineError::StreamInProgress(_))));

        assert!(h.engine.stop_generation(&h.conversation_id));
        let outcome = task.await.unwrap().unwrap();
        assert_eq!(outcome.status, StreamStatus::Aborted);
        assert_eq!(outcome.content, "partial");
        assert!(!h.engine.is_streaming(&h.conversation_id));

        let record = h.streams.load(&outcome.stream_id).unwrap().unwrap();
        assert_eq!(record.status, StreamStatus::Aborted);
        assert_eq!(record.detail.as_deref(), Some("User stopped generation"));
        wait_for(&mut h.events, |e| {
            matches!(e, EngineEvent::PhaseChanged { phase: StreamPhase::Aborted, .. })
        })
        .await;
    }

    #[tokio::test]
    async fn transport_error_becomes_visible_marker() {
        let h = harness(|_| {}).await;
        h.transport.script(Script::Fail(Error::Api {
            code: "500".into(),
            message: "boom".into(),
        }));

        let outcome = h
            .engine
            .send_message(&h.conversation_id, "hi", Vec::new(), SendOptions::default())
            .await
            .unwrap();
        assert_eq!(outcome.status, StreamStatus::Error);
        assert_eq!(outcome.content, "⚠️ Error: boom");
    }

    #[tokio::test]
    async fn image_model_api_errors_get_a_specific_message() {
        let h = harness(|_| {}).await;
        h.transport.script(Script::Fail(Error::Api {
            code: "401".into(),
            message: "Invalid API key".into(),
        }));
        let options = SendOptions {
            model: Some("dall-e-3".into()),
            ..SendOptions::default()
        };
        let outcome = h
            .engine
            .send_message(&h.conversation_id, "a cat", Vec::new(), options)
            .await
            .unwrap();
        assert_eq!(
            outcome.content,
            "⚠️ Failed to generate image. Please check your API key and try again."
        );
    }

    #[tokio::test]
    async fn regenerate_replaces_leaf_with_sibling() {
        let h = harness(|_| {}).await;
        h.transport.reply(&["first"]);
        h.transport.reply(&["alternative"]);
        h.transport.reply(&["second"]);

        let first = h
            .engine
            .send_message(&h.conversation_id, "question", Vec::new(), SendOptions::default())
            .await
            .unwrap();
        let branch = h
            .engine
            .create_branch(&h.conversation_id, &first.message_id)
            .await
            .unwrap();
        let user_id = h
            .engine
            .store()
            .message(&h.conversation_id, &first.message_id)
            .unwrap()
            .parent_id
            .unwrap();

        let regenerated = h
            .engine
            .regenerate(&h.conversation_id, &branch.message_id)
            .await
            .unwrap();
        assert_eq!(regenerated.content, "second");

        let messages = h.engine.store().messages(&h.conversation_id);
        assert_eq!(messages.len(), 3);
        assert!(messages.iter().all(|m| m.id != branch.message_id));
        let siblings: Vec<&str> = messages
            .iter()
            .filter(|m| m.parent_id.as_deref() == Some(user_id.as_str()))
            .map(|m| m.content.as_str())
            .collect();
        assert_eq!(siblings, vec!["first", "second"]);

        let not_leaf = h.engine.regenerate(&h.conversation_id, &user_id).await;
        assert!(matches!(not_leaf, Err(EngineError::NotRegenerable(_))));
    }

    #[tokio::test]
    async fn branch_asks_for_an_alternative() {
        let h = harness(|_| {}).await;
        h.transport.reply(&["first"]);
        h.transport.reply(&["other"]);

        let first = h
            .engine
            .send_message(&h.conversation_id, "question", Vec::new(), SendOptions::default())
            .await
            .unwrap();
        let branch = h
            .engine
            .create_branch(&h.conversation_id, &first.message_id)
            .await
            .unwrap();
        assert_eq!(branch.content, "other");

        let request = &h.transport.requests()[1];
        assert_eq!(request.options.temperature, Some(0.9));
        assert_eq!(
            request.messages.last().unwrap().content,
            format!("question{BRANCH_INSTRUCTION}")
        );

        let path = h.engine.active_path(&h.conversation_id);
        assert_eq!(path.last().unwrap().id, branch.message_id);
        let switched = h
            .engine
            .switch_branch(&h.conversation_id, &first.message_id)
            .unwrap();
        assert_eq!(switched.last().unwrap().id, first.message_id);
    }

    #[tokio::test]
    async fn branches_survive_message_resync() {
        let h = harness(|_| {}).await;
        h.transport.reply(&["first answer"]);
        h.transport.reply(&["second answer"]);
        h.transport.reply(&["alternative answer"]);

        h.engine
            .send_message(&h.conversation_id, "one", Vec::new(), SendOptions::default())
            .await
            .unwrap();
        let second = h
            .engine
            .send_message(&h.conversation_id, "two", Vec::new(), SendOptions::default())
            .await
            .unwrap();
        let branch = h
            .engine
            .create_branch(&h.conversation_id, &second.message_id)
            .await
            .unwrap();
        assert_eq!(h.engine.active_path(&h.conversation_id).len(), 4);

        echo_published(&h);
        let count = h
            .engine
            .store()
            .sync_messages(&h.conversation_id)
            .await
            .unwrap();
        assert_eq!(count, 5);

        let messages = h.engine.store().messages(&h.conversation_id);
        assert!(messages.iter().all(|m| m.id.starts_with("s-")));
        assert_eq!(messages.iter().filter(|m| m.parent_id.is_none()).count(), 1);

        let path = h.engine.active_path(&h.conversation_id);
        let contents: Vec<&str> = path.iter().map(|m| m.content.as_str()).collect();
        assert_eq!(contents, vec!["one", "first answer", "two", "alternative answer"]);
        assert_eq!(path[3].id, h.engine.store().resolve_message_id(&branch.message_id));

        let switched = h
            .engine
            .switch_branch(&h.conversation_id, &second.message_id)
            .unwrap();
        assert_eq!(switched.last().unwrap().content, "second answer");
        let regenerated = h
            .engine
            .regenerate(&h.conversation_id, &branch.message_id)
            .await;
        assert!(regenerated.is_ok());
    }

    #[tokio::test]
    async fn local_models_use_the_local_transport() {
        let local = Arc::new(FakeTransport::new("ollama"));
        local.reply(&["local reply"]);
        let local_handle = local.clone();
        let h = harness(move |engine| {
            engine.local_transport(local_handle);
        })
        .await;

        let options = SendOptions {
            model: Some("ollama/llama3".into()),
            ..SendOptions::default()
        };
        let outcome = h
            .engine
            .send_message(&h.conversation_id, "hi", Vec::new(), options)
            .await
            .unwrap();
        assert_eq!(outcome.content, "local reply");
        assert_eq!(local.requests().len(), 1);
        assert!(h.transport.requests().is_empty());
    }

    #[tokio::test]
    async fn unreachable_local_server_falls_back_to_backend() {
        let local = Arc::new(FakeTransport::new("ollama").unavailable());
        let local_handle = local.clone();
        let h = harness(move |engine| {
            engine.local_transport(local_handle);
        })
        .await;
        h.transport.reply(&["backend reply"]);

        let options = SendOptions {
            model: Some("ollama/llama3".into()),
            ..SendOptions::default()
        };
        let outcome = h
            .engine
            .send_message(&h.conversation_id, "hi", Vec::new(), options)
            .await
            .unwrap();
        assert_eq!(outcome.status, StreamStatus::Complete);
        assert_eq!(outcome.content, "backend reply");
        assert!(local.requests().is_empty());
        let requests = h.transport.requests();
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].model, "ollama/llama3");
    }

    #[tokio::test]
    async fn finished_stream_record_has_final_token_count() {
        let h = harness(|_| {}).await;
        h.transport.reply(&[
            "one two three four five six seven eight nine ten",
            " eleven twelve thirteen",
        ]);

        let outcome = h
            .engine
            .send_message(&h.conversation_id, "count", Vec::new(), SendOptions::default())
            .await
            .unwrap();
        assert_eq!(outcome.tokens, 13);
        let record = h.streams.load(&outcome.stream_id).unwrap().unwrap();
        assert_eq!(record.status, StreamStatus::Complete);
        assert_eq!(record.tokens_generated, 13);
    }

    #[tokio::test]
    async fn generated_images_are_resolved_in_the_background() {
        let mut h = harness(|engine| {
            engine.image_pipeline(Arc::new(FakeImages::ok("https://cdn/cat.png")));
        })
        .await;
        let inner = json!({
            "type": "image_generation", "url": "https://tmp/cat.png", "model": "dall-e-3", "prompt": "cat"
        })
        .to_string();
        let frame = json!({ "choices": [{ "delta": { "content": inner } }] });
        h.transport
            .script(Script::Chunks(vec![format!("data: {frame}\n").into_bytes()]));

        let outcome = h
            .engine
            .send_message(&h.conversation_id, "draw a cat", Vec::new(), SendOptions::default())
            .await
            .unwrap();
        assert_eq!(outcome.status, StreamStatus::Complete);

        let resolved = wait_for(&mut h.events, |e| matches!(e, EngineEvent::ImageResolved { .. })).await;
        let EngineEvent::ImageResolved { content, .. } = resolved else {
            unreachable!()
        };
        assert_eq!(content, "![Generated Image](https://cdn/cat.png)");
        let stored = h
            .engine
            .store()
            .message(&h.conversation_id, &outcome.message_id)
            .unwrap();
        assert_ne!(stored.content, IMAGE_PLACEHOLDER);
    }

    #[tokio::test]
    async fn generated_image_is_published_once_resolved() {
        let mut h = harness(|engine| {
            engine.image_pipeline(Arc::new(FakeImages::ok("https://cdn/cat.png")));
        })
        .await;
        let inner = json!({
            "type": "image_generation", "url": "https://tmp/cat.png", "model": "dall-e-3", "prompt": "cat"
        })
        .to_string();
        let frame = json!({ "choices": [{ "delta": { "content": inner } }] });
        h.transport
            .script(Script::Chunks(vec![format!("data: {frame}\n").into_bytes()]));

        h.engine
            .send_message(&h.conversation_id, "draw a cat", Vec::new(), SendOptions::default())
            .await
            .unwrap();
        wait_for(&mut h.events, |e| matches!(e, EngineEvent::ImageResolved { .. })).await;

        let replies: Vec<String> = h
            .remote
            .created_messages()
            .into_iter()
            .filter(|(_, m)| m.role == Role::Assistant)
            .map(|(_, m)| m.content)
            .collect();
        assert_eq!(replies, vec!["![Generated Image](https://cdn/cat.png)".to_string()]);

        echo_published(&h);
        h.engine
            .store()
            .sync_messages(&h.conversation_id)
            .await
            .unwrap();
        let messages = h.engine.store().messages(&h.conversation_id);
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[1].content, "![Generated Image](https://cdn/cat.png)");
    }

    #[tokio::test]
    async fn failed_image_processing_is_reported_in_the_message() {
        let mut h = harness(|engine| {
            engine.image_pipeline(Arc::new(FakeImages::failing("upload rejected")));
        })
        .await;
        let inner = json!({ "type": "image_generation", "base64": "AAAA", "model": "gpt-image-1", "prompt": "x" })
            .to_string();
        let frame = json!({ "choices": [{ "delta": { "content": inner } }] });
        h.transport
            .script(Script::Chunks(vec![format!("data: {frame}\n").into_bytes()]));

        h.engine
            .send_message(&h.conversation_id, "draw", Vec::new(), SendOptions::default())
            .await
            .unwrap();
        let resolved = wait_for(&mut h.events, |e| matches!(e, EngineEvent::ImageResolved { .. })).await;
        assert!(matches!(
            resolved,
            EngineEvent::ImageResolved { content, .. } if content == "❌ Error processing image: upload rejected"
        ));
    }

    #[tokio::test]
    async fn unknown_conversation_is_an_error() {
        let h = harness(|_| {}).await;
        let result = h
            .engine
            .send_message("missing", "hi", Vec::new(), SendOptions::default())
            .await;
        assert!(matches!(result, Err(EngineError::ConversationNotFound(_))));
        assert!(!h.engine.stop_generation("missing"));
    }
}
