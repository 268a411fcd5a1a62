//! In-memory collaborators for unit tests.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use async_trait::async_trait;
use chatloom_llm::{
    BatteryDelta, ByteStream, ChatRequest, ChatTransport, Error, ImageGenerationRequest,
    TokenUsage,
};
use futures::StreamExt;
use parking_lot::Mutex;
use serde_json::{Value, json};
use tokio::sync::Notify;

use crate::collab::{
    BoxError, ImagePipeline, NewConversation, NewMessage, OfflineStorage, RemoteApi, RemoteError,
    SyncOperation, SyncService, UsageTracker,
};
use crate::model::{Conversation, Message, now_ms};

// ---------------------------------------------------------------------------
// Offline storage
// ---------------------------------------------------------------------------

#[derive(Default)]
pub struct FakeOffline {
    conversations: Mutex<HashMap<String, Conversation>>,
    deleted_conversations: Mutex<Vec<String>>,
    messages: Mutex<HashMap<String, Message>>,
    queue: Mutex<Vec<SyncOperation>>,
}

impl FakeOffline {
    pub fn queue(&self) -> Vec<SyncOperation> {
        self.queue.lock().clone()
    }

    pub fn deleted_conversations(&self) -> Vec<String> {
        self.deleted_conversations.lock().clone()
    }

    pub fn saved_message(&self, id: &str) -> Option<Message> {
        self.messages.lock().get(id).cloned()
    }
}

impl OfflineStorage for FakeOffline {
    fn save_conversation(&self, conversation: &Conversation) -> Result<(), BoxError> {
        self.conversations
            .lock()
            .insert(conversation.id.clone(), conversation.clone());
        Ok(())
    }

    fn delete_conversation(&self, id: &str) -> Result<(), BoxError> {
        self.conversations.lock().remove(id);
        self.deleted_conversations.lock().push(id.to_string());
        Ok(())
    }

    fn save_message(&self, message: &Message) -> Result<(), BoxError> {
        self.messages
            .lock()
            .insert(message.id.clone(), message.clone());
        Ok(())
    }

    fn save_messages(&self, conversation_id: &str, messages: &[Message]) -> Result<(), BoxError> {
        let mut stored = self.messages.lock();
        stored.retain(|_, m| m.conversation_id != conversation_id);
        for message in messages {
            stored.insert(message.id.clone(), message.clone());
        }
        Ok(())
    }

    fn delete_message(&self, id: &str) -> Result<(), BoxError> {
        self.messages.lock().remove(id);
        Ok(())
    }

    fn add_to_sync_queue(&self, operation: &SyncOperation) -> Result<(), BoxError> {
        self.queue.lock().push(operation.clone());
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Remote API
// ---------------------------------------------------------------------------

#[derive(Default)]
struct RemoteState {
    conversations: Vec<Value>,
    messages: HashMap<String, Vec<Value>>,
    created_messages: Vec<(String, NewMessage)>,
    next_id: usize,
}

#[derive(Default)]
pub struct FakeRemote {
    state: Mutex<RemoteState>,
    fail_writes: AtomicBool,
    fail_reads: AtomicBool,
    hold_creates: AtomicBool,
    create_started: Notify,
    create_released: Notify,
}

impl FakeRemote {
    pub fn fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    pub fn fail_reads(&self, fail: bool) {
        self.fail_reads.store(fail, Ordering::SeqCst);
    }

    /// Make `create_conversation` wait for [`release_creates`](Self::release_creates).
    pub fn hold_creates(&self) {
        self.hold_creates.store(true, Ordering::SeqCst);
    }

    pub fn release_creates(&self) {
        self.create_released.notify_one();
    }

    pub async fn wait_for_create(&self) {
        self.create_started.notified().await;
    }

    pub fn set_conversations(&self, records: Vec<Value>) {
        self.state.lock().conversations = records;
    }

    pub fn set_messages(&self, conversation_id: &str, records: Vec<Value>) {
        self.state
            .lock()
            .messages
            .insert(conversation_id.to_string(), records);
    }

    pub fn created_messages(&self) -> Vec<(String, NewMessage)> {
        self.state.lock().created_messages.clone()
    }

    fn check(&self, flag: &AtomicBool) -> Result<(), RemoteError> {
        if flag.load(Ordering::SeqCst) {
            return Err(RemoteError::Transport("connection refused".into()));
        }
        Ok(())
    }
}

#[async_trait]
impl RemoteApi for FakeRemote {
    async fn create_conversation(&self, input: &NewConversation) -> Result<Value, RemoteError> {
        if self.hold_creates.load(Ordering::SeqCst) {
            self.create_started.notify_one();
            self.create_released.notified().await;
        }
        self.check(&self.fail_writes)?;
        let mut state = self.state.lock();
        state.next_id += 1;
        Ok(json!({
            "id": format!("srv-{}", state.next_id),
            "title": input.title,
            "model": input.model,
            "createdAt": now_ms(),
            "updatedAt": now_ms(),
        }))
    }

    async fn delete_conversation(&self, _id: &str) -> Result<(), RemoteError> {
        self.check(&self.fail_writes)
    }

    async fn create_message(
        &self,
        conversation_id: &str,
        message: &NewMessage,
    ) -> Result<Value, RemoteError> {
        self.check(&self.fail_writes)?;
        self.state
            .lock()
            .created_messages
            .push((conversation_id.to_string(), message.clone()));
        Ok(json!({ "id": message.client_id, "conversationId": conversation_id }))
    }

    async fn list_conversations(&self) -> Result<Vec<Value>, RemoteError> {
        self.check(&self.fail_reads)?;
        Ok(self.state.lock().conversations.clone())
    }

    async fn list_messages(&self, conversation_id: &str) -> Result<Vec<Value>, RemoteError> {
        self.check(&self.fail_reads)?;
        Ok(self
            .state
            .lock()
            .messages
            .get(conversation_id)
            .cloned()
            .unwrap_or_default())
    }
}

// ---------------------------------------------------------------------------
// Sync service
// ---------------------------------------------------------------------------

pub struct FakeSync {
    online: AtomicBool,
    drained: AtomicUsize,
}

impl FakeSync {
    pub fn online() -> Self {
        Self {
            online: AtomicBool::new(true),
            drained: AtomicUsize::new(0),
        }
    }

    pub fn drained(&self) -> usize {
        self.drained.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl SyncService for FakeSync {
    fn is_online(&self) -> bool {
        self.online.load(Ordering::SeqCst)
    }

    async fn process_sync_queue(&self) -> Result<usize, BoxError> {
        self.drained.fetch_add(1, Ordering::SeqCst);
        Ok(0)
    }
}

// ---------------------------------------------------------------------------
// Transport
// ---------------------------------------------------------------------------

pub enum Script {
    /// Yield the chunks, then end.
    Chunks(Vec<Vec<u8>>),
    /// Yield the chunks, then never end.
    ChunksThenHang(Vec<Vec<u8>>),
    Fail(Error),
}

pub struct FakeTransport {
    name: String,
    available: bool,
    scripts: Mutex<VecDeque<Script>>,
    requests: Mutex<Vec<ChatRequest>>,
}

impl FakeTransport {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            available: true,
            scripts: Mutex::new(VecDeque::new()),
            requests: Mutex::new(Vec::new()),
        }
    }

    pub fn unavailable(mut self) -> Self {
        self.available = false;
        self
    }

    pub fn script(&self, script: Script) {
        self.scripts.lock().push_back(script);
    }

    /// Queue a reply made of `data:` frames with the given text pieces.
    pub fn reply(&self, pieces: &[&str]) {
        let chunks = pieces
            .iter()
            .map(|piece| format!("data: {}\n", json!({ "content": piece })).into_bytes())
            .chain(std::iter::once(b"data: [DONE]\n".to_vec()))
            .collect();
        self.script(Script::Chunks(chunks));
    }

    pub fn requests(&self) -> Vec<ChatRequest> {
        self.requests.lock().clone()
    }
}

#[async_trait]
impl ChatTransport for FakeTransport {
    fn name(&self) -> &str {
        &self.name
    }

    async fn is_available(&self) -> bool {
        self.available
    }

    fn stream_chat(&self, request: ChatRequest) -> ByteStream {
        self.requests.lock().push(request);
        match self.scripts.lock().pop_front() {
            Some(Script::Chunks(chunks)) => ByteStream::from_chunks(chunks),
            Some(Script::ChunksThenHang(chunks)) => ByteStream::new(
                futures::stream::iter(chunks.into_iter().map(Ok))
                    .chain(futures::stream::pending()),
            ),
            Some(Script::Fail(err)) => ByteStream::failed(err),
            None => ByteStream::from_chunks(Vec::new()),
        }
    }
}

// ---------------------------------------------------------------------------
// Side channels
// ---------------------------------------------------------------------------

pub struct FakeImages {
    result: Result<String, String>,
}

impl FakeImages {
    pub fn ok(url: &str) -> Self {
        Self {
            result: Ok(url.to_string()),
        }
    }

    pub fn failing(reason: &str) -> Self {
        Self {
            result: Err(reason.to_string()),
        }
    }
}

#[async_trait]
impl ImagePipeline for FakeImages {
    async fn process(&self, _request: &ImageGenerationRequest) -> Result<String, BoxError> {
        self.result.clone().map_err(Into::into)
    }
}

#[derive(Default)]
pub struct FakeUsage {
    pub records: Mutex<Vec<(TokenUsage, Option<BatteryDelta>)>>,
}

impl UsageTracker for FakeUsage {
    fn record_usage(&self, usage: TokenUsage, battery: Option<BatteryDelta>) {
        self.records.lock().push((usage, battery));
    }
}
