//! Optimistic conversation/message state with an offline cache and a
//! replayable queue of remote writes.
//!
//! Every mutation lands in memory first, then in the offline cache, then on
//! the server. A failed server write is queued and local state is kept. The
//! state mutex is never held across an `.await`.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use chatloom_llm::Role;
use parking_lot::Mutex;
use serde_json::Value;

use crate::collab::{
    BoxError, Migrator, NewConversation, NewMessage, OfflineStorage, QueuedMessage, RemoteApi,
    RemoteError, SyncOperation, SyncService,
};
use crate::config::EngineConfig;
use crate::model::{Conversation, Message, is_temporary_id, now_ms};
use crate::sync::{RecentlyDeleted, merge_conversations, merge_messages};

#[derive(Debug, Default)]
struct StoreState {
    /// Newest first.
    conversations: Vec<Conversation>,
    current: Option<String>,
    messages: HashMap<String, Vec<Message>>,
    recently_deleted: RecentlyDeleted,
    /// Temporary id -> server id, for callers still holding the old id.
    aliases: HashMap<String, String>,
    /// Temporary message id -> server message id, learned on resync.
    message_aliases: HashMap<String, String>,
    is_syncing: bool,
}

impl StoreState {
    fn resolve(&self, id: &str) -> String {
        self.aliases
            .get(id)
            .cloned()
            .unwrap_or_else(|| id.to_string())
    }

    fn resolve_message(&self, id: &str) -> String {
        self.message_aliases
            .get(id)
            .cloned()
            .unwrap_or_else(|| id.to_string())
    }

    fn conversation_mut(&mut self, id: &str) -> Option<&mut Conversation> {
        self.conversations.iter_mut().find(|c| c.id == id)
    }

    fn message_mut(&mut self, conversation_id: &str, message_id: &str) -> Option<&mut Message> {
        self.messages
            .get_mut(conversation_id)?
            .iter_mut()
            .find(|m| m.id == message_id)
    }

    fn touch(&mut self, conversation_id: &str) {
        if let Some(conversation) = self.conversation_mut(conversation_id) {
            conversation.updated_at_ms = now_ms();
        }
    }
}

pub struct ConversationStore {
    state: Mutex<StoreState>,
    offline: Arc<dyn OfflineStorage>,
    remote: Arc<dyn RemoteApi>,
    sync: Arc<dyn SyncService>,
    migrator: Arc<dyn Migrator>,
    config: EngineConfig,
}

impl ConversationStore {
    pub fn new(
        offline: Arc<dyn OfflineStorage>,
        remote: Arc<dyn RemoteApi>,
        sync: Arc<dyn SyncService>,
        migrator: Arc<dyn Migrator>,
    ) -> Self {
        Self {
            state: Mutex::new(StoreState::default()),
            offline,
            remote,
            sync,
            migrator,
            config: EngineConfig::default(),
        }
    }

    pub fn with_config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Load previously cached state. Replaces whatever is in memory.
    pub fn hydrate(&self, conversations: Vec<Conversation>, messages: HashMap<String, Vec<Message>>) {
        let mut state = self.state.lock();
        state.conversations = conversations;
        state
            .conversations
            .sort_by(|a, b| b.updated_at_ms.cmp(&a.updated_at_ms));
        state.messages = messages;
        for bucket in state.messages.values_mut() {
            bucket.sort_by_key(|m| m.created_at_ms);
        }
        tracing::debug!(
            conversations = state.conversations.len(),
            "hydrated conversation store"
        );
    }

    /// Follow a temporary id to the server id it was replaced with.
    pub fn resolve_id(&self, id: &str) -> String {
        self.state.lock().resolve(id)
    }

    /// Follow a temporary message id to the server id that replaced it.
    pub fn resolve_message_id(&self, id: &str) -> String {
        self.state.lock().resolve_message(id)
    }

    pub fn is_syncing(&self) -> bool {
        self.state.lock().is_syncing
    }

    // -----------------------------------------------------------------------
    // Conversations
    // -----------------------------------------------------------------------

    pub fn conversations(&self) -> Vec<Conversation> {
        self.state.lock().conversations.clone()
    }

    pub fn conversation(&self, id: &str) -> Option<Conversation> {
        let state = self.state.lock();
        let id = state.resolve(id);
        state.conversations.iter().find(|c| c.id == id).cloned()
    }

    pub fn current_conversation(&self) -> Option<Conversation> {
        let state = self.state.lock();
        let current = state.current.as_deref()?;
        state.conversations.iter().find(|c| c.id == current).cloned()
    }

    pub fn set_current_conversation(&self, id: Option<&str>) {
        let mut state = self.state.lock();
        let resolved = id.map(|id| state.resolve(id));
        state.current = resolved;
    }

    /// Create a conversation locally and try to register it on the server.
    ///
    /// Returns the server record when that succeeded, the local one otherwise.
    pub async fn create_conversation(&self, title: Option<&str>, model: Option<&str>) -> Conversation {
        let local = Conversation::new_local(
            title.unwrap_or(&self.config.default_title),
            model.unwrap_or(&self.config.default_model),
        );
        {
            let mut state = self.state.lock();
            state.conversations.insert(0, local.clone());
            state.messages.entry(local.id.clone()).or_default();
            state.current = Some(local.id.clone());
        }
        self.cache("save conversation", self.offline.save_conversation(&local));

        let input = NewConversation {
            title: local.title.clone(),
            model: local.model.clone(),
        };
        let created = match self.remote.create_conversation(&input).await {
            Ok(raw) => self
                .migrator
                .migrate_conversation(raw)
                .map_err(|err| RemoteError::Decode(err.to_string())),
            Err(err) => Err(err),
        };

        match created {
            Ok(server) => {
                if !self.rekey_conversation(&local.id, server.clone()) {
                    // Deleted locally while the create was in flight.
                    self.delete_conversation(&server.id).await;
                }
                server
            }
            Err(err) => {
                tracing::warn!(conversation_id = %local.id, error = %err, "conversation create failed, queued");
                self.enqueue(SyncOperation::CreateConversation {
                    local_id: local.id.clone(),
                    conversation: input,
                });
                local
            }
        }
    }

    /// Swap a temporary conversation for its server record, moving its
    /// messages along in the same step. Returns false when the temporary
    /// conversation no longer exists.
    fn rekey_conversation(&self, temp_id: &str, server: Conversation) -> bool {
        let messages = {
            let mut state = self.state.lock();
            state.aliases.insert(temp_id.to_string(), server.id.clone());
            let Some(at) = state.conversations.iter().position(|c| c.id == temp_id) else {
                return false;
            };
            state.conversations[at] = server.clone();

            let mut moved = state.messages.remove(temp_id).unwrap_or_default();
            for message in &mut moved {
                message.conversation_id = server.id.clone();
            }

            let bucket = state.messages.entry(server.id.clone()).or_default();
            bucket.extend(moved);
            bucket.sort_by_key(|m| m.created_at_ms);
            let messages = bucket.clone();

            if state.current.as_deref() == Some(temp_id) {
                state.current = Some(server.id.clone());
            }
            messages
        };

        tracing::debug!(temp_id, server_id = %server.id, "conversation confirmed by server");
        self.cache("save conversation", self.offline.save_conversation(&server));
        self.cache("delete conversation", self.offline.delete_conversation(temp_id));
        self.cache(
            "save messages",
            self.offline.save_messages(&server.id, &messages),
        );
        true
    }

    pub async fn delete_conversation(&self, id: &str) {
        let id = {
            let mut state = self.state.lock();
            let id = state.resolve(id);
            state.conversations.retain(|c| c.id != id);
            state.messages.remove(&id);
            state.recently_deleted.insert(id.clone());
            if state.current.as_deref() == Some(id.as_str()) {
                state.current = None;
            }
            id
        };
        self.cache("delete conversation", self.offline.delete_conversation(&id));

        if is_temporary_id(&id) {
            self.confirm_deleted(&id);
            return;
        }

        match self.remote.delete_conversation(&id).await {
            Ok(()) => self.confirm_deleted(&id),
            Err(err) => {
                tracing::warn!(conversation_id = %id, error = %err, "conversation delete failed, queued");
                self.enqueue(SyncOperation::DeleteConversation { id });
            }
        }
    }

    fn confirm_deleted(&self, id: &str) {
        self.state
            .lock()
            .recently_deleted
            .confirm(id, self.config.deleted_grace(), Instant::now());
    }

    pub fn rename_conversation(&self, id: &str, title: &str) -> bool {
        let renamed = {
            let mut state = self.state.lock();
            let id = state.resolve(id);
            state.conversation_mut(&id).map(|conversation| {
                conversation.title = title.to_string();
                conversation.updated_at_ms = now_ms();
                conversation.clone()
            })
        };
        match renamed {
            Some(conversation) => {
                self.cache("save conversation", self.offline.save_conversation(&conversation));
                true
            }
            None => false,
        }
    }

    // -----------------------------------------------------------------------
    // Messages
    // -----------------------------------------------------------------------

    pub fn messages(&self, conversation_id: &str) -> Vec<Message> {
        let state = self.state.lock();
        let id = state.resolve(conversation_id);
        state.messages.get(&id).cloned().unwrap_or_default()
    }

    pub fn message(&self, conversation_id: &str, message_id: &str) -> Option<Message> {
        let state = self.state.lock();
        let id = state.resolve(conversation_id);
        let message_id = state.resolve_message(message_id);
        state
            .messages
            .get(&id)?
            .iter()
            .find(|m| m.id == message_id)
            .cloned()
    }

    /// Add a message locally and in the cache, without telling the server.
    /// Used for replies that are still streaming.
    pub fn insert_message(&self, mut message: Message) -> Message {
        {
            let mut state = self.state.lock();
            let conversation_id = state.resolve(&message.conversation_id);
            message.conversation_id = conversation_id.clone();
            state
                .messages
                .entry(conversation_id.clone())
                .or_default()
                .push(message.clone());
            state.touch(&conversation_id);
        }
        self.cache("save message", self.offline.save_message(&message));
        message
    }

    /// Add a message and persist it to the server, queueing on failure.
    pub async fn add_message(&self, message: Message) -> Message {
        let message = self.insert_message(message);
        self.publish(&message).await;
        message
    }

    /// Send the current state of a stored message to the server.
    pub async fn publish_message(&self, conversation_id: &str, message_id: &str) {
        if let Some(message) = self.message(conversation_id, message_id) {
            self.publish(&message).await;
        }
    }

    async fn publish(&self, message: &Message) {
        let queued = QueuedMessage {
            conversation_id: message.conversation_id.clone(),
            message: NewMessage::from(message),
        };

        // The server does not know this conversation yet; the queued create
        // goes first on replay.
        if is_temporary_id(&message.conversation_id) {
            self.enqueue(SyncOperation::CreateMessage(queued));
            return;
        }

        if let Err(err) = self
            .remote
            .create_message(&queued.conversation_id, &queued.message)
            .await
        {
            tracing::warn!(message_id = %message.id, error = %err, "message persist failed, queued");
            self.enqueue(SyncOperation::CreateMessage(queued));
        }
    }

    /// Replace a message's content. In-memory only; see [`commit_message`](Self::commit_message).
    pub fn update_message(&self, conversation_id: &str, message_id: &str, content: &str) -> bool {
        self.update_message_with(conversation_id, message_id, |message| {
            message.content = content.to_string();
        })
    }

    pub fn update_message_with(
        &self,
        conversation_id: &str,
        message_id: &str,
        update: impl FnOnce(&mut Message),
    ) -> bool {
        let mut state = self.state.lock();
        let id = state.resolve(conversation_id);
        let message_id = state.resolve_message(message_id);
        match state.message_mut(&id, &message_id) {
            Some(message) => {
                update(message);
                message.updated_at_ms = Some(now_ms());
                true
            }
            None => false,
        }
    }

    /// Write a message's current state to the offline cache.
    pub fn commit_message(&self, conversation_id: &str, message_id: &str) -> Option<Message> {
        let message = self.message(conversation_id, message_id)?;
        self.cache("save message", self.offline.save_message(&message));
        Some(message)
    }

    pub fn delete_message(&self, conversation_id: &str, message_id: &str) -> Option<Message> {
        let removed = {
            let mut state = self.state.lock();
            let id = state.resolve(conversation_id);
            let message_id = state.resolve_message(message_id);
            let bucket = state.messages.get_mut(&id)?;
            let at = bucket.iter().position(|m| m.id == message_id)?;
            bucket.remove(at)
        };
        self.cache("delete message", self.offline.delete_message(&removed.id));
        Some(removed)
    }

    pub fn clear_conversation_messages(&self, conversation_id: &str) {
        let id = {
            let mut state = self.state.lock();
            let id = state.resolve(conversation_id);
            state.messages.insert(id.clone(), Vec::new());
            id
        };
        self.cache("clear messages", self.offline.save_messages(&id, &[]));
    }

    // -----------------------------------------------------------------------
    // Resync
    // -----------------------------------------------------------------------

    /// Replay queued writes, then merge the server's conversation list.
    ///
    /// A failed fetch leaves local state untouched.
    pub async fn sync_conversations(&self) -> Result<usize, RemoteError> {
        let _syncing = SyncingGuard::new(&self.state);

        if self.sync.is_online() {
            match self.sync.process_sync_queue().await {
                Ok(0) => {}
                Ok(delivered) => tracing::info!(delivered, "replayed queued writes"),
                Err(err) => tracing::warn!(error = %err, "sync queue replay failed"),
            }
        }

        let raw = self.remote.list_conversations().await?;
        let server: Vec<Conversation> = raw
            .into_iter()
            .filter_map(|record| match self.migrator.migrate_conversation(record) {
                Ok(conversation) => Some(conversation),
                Err(err) => {
                    tracing::warn!(error = %err, "skipping unreadable conversation record");
                    None
                }
            })
            .collect();

        let (merged, to_cache) = {
            let mut guard = self.state.lock();
            let state = &mut *guard;
            let deleted = state.recently_deleted.snapshot(Instant::now());
            let to_cache: Vec<Conversation> = server
                .iter()
                .filter(|c| !deleted.contains(&c.id))
                .cloned()
                .collect();
            let messages = &state.messages;
            let merged = merge_conversations(server, &state.conversations, &deleted, |id| {
                messages.get(id).is_some_and(|m| !m.is_empty())
            });
            state.conversations = merged.clone();
            (merged, to_cache)
        };

        for conversation in &to_cache {
            self.cache("save conversation", self.offline.save_conversation(conversation));
        }
        tracing::debug!(count = merged.len(), "conversations synced");
        Ok(merged.len())
    }

    /// Merge the server's messages for one conversation into local state.
    pub async fn sync_messages(&self, conversation_id: &str) -> Result<usize, RemoteError> {
        let id = self.resolve_id(conversation_id);
        if is_temporary_id(&id) {
            return Ok(self.messages(&id).len());
        }
        if self
            .state
            .lock()
            .recently_deleted
            .contains(&id, Instant::now())
        {
            return Ok(0);
        }

        let raw = self.remote.list_messages(&id).await?;
        let server: Vec<Message> = raw
            .into_iter()
            .enumerate()
            .map(|(index, record)| self.migrate_message(&id, index, record))
            .collect();

        let merged = {
            let mut state = self.state.lock();
            if state.recently_deleted.contains(&id, Instant::now()) {
                return Ok(0);
            }
            let local = state.messages.get(&id).cloned().unwrap_or_default();
            let merge = merge_messages(server, &local, self.config.dedupe_window_ms);
            if !merge.rekeyed.is_empty() {
                tracing::debug!(conversation_id = %id, rekeyed = merge.rekeyed.len(), "temporary messages matched server records");
                state.message_aliases.extend(merge.rekeyed);
            }
            state.messages.insert(id.clone(), merge.messages.clone());
            merge.messages
        };

        self.cache("save messages", self.offline.save_messages(&id, &merged));
        Ok(merged.len())
    }

    /// Merge the server's messages for every known conversation. A failing
    /// conversation is logged and skipped. Returns how many were merged.
    pub async fn sync_all_messages(&self) -> usize {
        let ids: Vec<String> = self.conversations().into_iter().map(|c| c.id).collect();
        let mut synced = 0;
        for id in ids {
            match self.sync_messages(&id).await {
                Ok(_) => synced += 1,
                Err(err) => {
                    tracing::warn!(conversation_id = %id, error = %err, "message resync failed");
                }
            }
        }
        synced
    }

    fn migrate_message(&self, conversation_id: &str, index: usize, mut record: Value) -> Message {
        if let Some(fields) = record.as_object_mut()
            && !fields.contains_key("conversationId")
            && !fields.contains_key("conversation_id")
        {
            fields.insert("conversationId".into(), Value::from(conversation_id));
        }

        match self.migrator.migrate_message(record.clone()) {
            Ok(message) => message,
            Err(err) => {
                tracing::warn!(conversation_id, index, error = %err, "message migration failed, using fallback");
                fallback_message(conversation_id, index, &record)
            }
        }
    }

    // -----------------------------------------------------------------------
    // Helpers
    // -----------------------------------------------------------------------

    fn enqueue(&self, operation: SyncOperation) {
        let kind = operation.kind();
        if let Err(err) = self.offline.add_to_sync_queue(&operation) {
            tracing::warn!(kind, error = %err, "failed to queue sync operation");
        }
    }

    fn cache(&self, what: &str, result: Result<(), BoxError>) {
        if let Err(err) = result {
            tracing::warn!(operation = what, error = %err, "offline cache write failed");
        }
    }
}

/// Minimal reconstruction of a record the migrator rejected.
fn fallback_message(conversation_id: &str, index: usize, record: &Value) -> Message {
    let field = |key: &str| record.get(key).and_then(Value::as_str);
    let id = field("id")
        .or_else(|| field("_id"))
        .map(str::to_string)
        .unwrap_or_else(|| format!("fallback-{}-{index}", now_ms()));
    let role = field("role")
        .and_then(|r| Role::parse(&r.to_ascii_lowercase()))
        .unwrap_or(Role::Assistant);
    let content = match record.get("content") {
        Some(Value::String(s)) => s.clone(),
        Some(Value::Null) | None => String::new(),
        Some(other) => other.to_string(),
    };
    Message::new(id, conversation_id, role, content)
}

struct SyncingGuard<'a> {
    state: &'a Mutex<StoreState>,
}

impl<'a> SyncingGuard<'a> {
    fn new(state: &'a Mutex<StoreState>) -> Self {
        state.lock().is_syncing = true;
        Self { state }
    }
}

impl Drop for SyncingGuard<'_> {
    fn drop(&mut self) {
        self.state.lock().is_syncing = false;
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use chatloom_llm::Role;
    use serde_json::json;

    use super::ConversationStore;
    use crate::collab::SyncOperation;
    use crate::migrate::DefaultMigrator;
    use crate::model::{Message, is_temporary_id};
    use crate::testing::{FakeOffline, FakeRemote, FakeSync};

    fn store(remote: Arc<FakeRemote>) -> (ConversationStore, Arc<FakeOffline>, Arc<FakeSync>) {
        let offline = Arc::new(FakeOffline::default());
        let sync = Arc::new(FakeSync::online());
        let store = ConversationStore::new(
            offline.clone(),
            remote,
            sync.clone(),
            Arc::new(DefaultMigrator),
        );
        (store, offline, sync)
    }

    #[tokio::test]
    async fn create_rekeys_messages_to_server_id() {
        let remote = Arc::new(FakeRemote::default());
        remote.hold_creates();
        let (store, offline, _) = store(remote.clone());
        let store = Arc::new(store);

        let task = {
            let store = store.clone();
            tokio::spawn(async move { store.create_conversation(None, None).await })
        };
        remote.wait_for_create().await;
        let temp = store.current_conversation().unwrap().id;
        assert!(is_temporary_id(&temp));

        store.insert_message(Message::new("temp-m1", temp.clone(), Role::User, "hi"));
        remote.release_creates();
        let created = task.await.unwrap();

        assert_eq!(created.id, "srv-1");
        assert_eq!(store.resolve_id(&temp), "srv-1");
        assert!(store.conversation(&temp).is_some());
        let messages = store.messages("srv-1");
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].conversation_id, "srv-1");
        assert_eq!(store.current_conversation().unwrap().id, "srv-1");
        assert!(offline.deleted_conversations().contains(&temp));
    }

    #[tokio::test]
    async fn failed_create_is_queued() {
        let remote = Arc::new(FakeRemote::default());
        remote.fail_writes(true);
        let (store, offline, _) = store(remote);

        let conversation = store.create_conversation(Some("Draft"), Some("gpt-4o")).await;
        assert!(conversation.is_temporary());
        assert_eq!(store.conversations().len(), 1);
        assert!(matches!(
            offline.queue().as_slice(),
            [SyncOperation::CreateConversation { local_id, .. }] if *local_id == conversation.id
        ));
    }

    #[tokio::test]
    async fn messages_on_temporary_conversations_are_queued() {
        let remote = Arc::new(FakeRemote::default());
        remote.fail_writes(true);
        let (store, offline, _) = store(remote.clone());
        let conversation = store.create_conversation(None, None).await;

        store
            .add_message(Message::new("temp-m", conversation.id.clone(), Role::User, "hello"))
            .await;
        assert_eq!(offline.queue().len(), 2);
        assert_eq!(remote.created_messages().len(), 0);
    }

    #[tokio::test]
    async fn resync_never_restores_deleted_conversation() {
        let remote = Arc::new(FakeRemote::default());
        remote.set_conversations(vec![
            json!({ "id": "a", "title": "A", "updatedAt": 1_000 }),
            json!({ "id": "b", "title": "B", "updatedAt": 2_000 }),
        ]);
        let (store, _, sync) = store(remote.clone());

        store.sync_conversations().await.unwrap();
        assert_eq!(store.conversations().len(), 2);
        assert_eq!(sync.drained(), 1);

        remote.fail_writes(true);
        store.delete_conversation("b").await;
        store.sync_conversations().await.unwrap();

        let ids: Vec<String> = store.conversations().into_iter().map(|c| c.id).collect();
        assert_eq!(ids, vec!["a".to_string()]);
        assert!(!store.is_syncing());
    }

    #[tokio::test]
    async fn failed_fetch_keeps_local_state() {
        let remote = Arc::new(FakeRemote::default());
        let (store, _, _) = store(remote.clone());
        let local = store.create_conversation(None, None).await;
        remote.fail_reads(true);

        assert!(store.sync_conversations().await.is_err());
        assert_eq!(store.conversations()[0].id, local.id);
    }

    #[tokio::test]
    async fn message_resync_dedupes_and_falls_back() {
        let remote = Arc::new(FakeRemote::default());
        remote.set_conversations(vec![json!({ "id": "c1", "updatedAt": 1 })]);
        let (store, _, _) = store(remote.clone());
        store.sync_conversations().await.unwrap();

        store.insert_message(
            Message::new("temp-u", "c1", Role::User, "hi").created_at(1_700_000_000_500),
        );
        remote.set_messages(
            "c1",
            vec![
                json!({ "id": "m1", "role": "user", "content": "hi", "createdAt": 1_700_000_000_000i64 }),
                json!({ "role": "robot", "content": "??" }),
            ],
        );

        let count = store.sync_messages("c1").await.unwrap();
        assert_eq!(count, 2);
        let messages = store.messages("c1");
        assert!(messages.iter().any(|m| m.id == "m1"));
        assert!(messages.iter().all(|m| m.id != "temp-u"));
        assert!(messages.iter().any(|m| m.id.starts_with("fallback-")));
        assert_eq!(store.resolve_message_id("temp-u"), "m1");
        assert_eq!(store.message("c1", "temp-u").unwrap().id, "m1");
    }

    #[tokio::test]
    async fn full_resync_pulls_messages_for_every_conversation() {
        let remote = Arc::new(FakeRemote::default());
        remote.set_conversations(vec![
            json!({ "id": "a", "updatedAt": 2 }),
            json!({ "id": "b", "updatedAt": 1 }),
        ]);
        remote.set_messages(
            "a",
            vec![
                json!({ "id": "a1", "role": "user", "content": "hi", "createdAt": 1 }),
                json!({ "id": "a2", "role": "assistant", "content": "hello", "parentId": "a1", "createdAt": 2 }),
            ],
        );
        remote.set_messages(
            "b",
            vec![json!({ "id": "b1", "role": "user", "content": "yo", "createdAt": 1 })],
        );
        let (store, offline, _) = store(remote);

        store.sync_conversations().await.unwrap();
        assert!(store.messages("a").is_empty());

        assert_eq!(store.sync_all_messages().await, 2);
        assert_eq!(store.messages("a").len(), 2);
        assert_eq!(store.messages("b").len(), 1);
        assert_eq!(offline.saved_message("a2").unwrap().parent_id.as_deref(), Some("a1"));
    }

    #[tokio::test]
    async fn deleting_current_conversation_clears_selection() {
        let remote = Arc::new(FakeRemote::default());
        let (store, _, _) = store(remote);
        let older = store.create_conversation(Some("Older"), None).await;
        let newer = store.create_conversation(Some("Newer"), None).await;
        assert_eq!(store.current_conversation().unwrap().id, newer.id);

        store.delete_conversation(&newer.id).await;
        assert!(store.current_conversation().is_none());
        assert_eq!(store.conversations().len(), 1);
        assert_eq!(store.conversations()[0].id, older.id);

        store.set_current_conversation(Some(&older.id));
        store.delete_conversation(&newer.id).await;
        assert_eq!(store.current_conversation().unwrap().id, older.id);
    }

    #[tokio::test]
    async fn update_and_delete_message() {
        let remote = Arc::new(FakeRemote::default());
        let (store, offline, _) = store(remote);
        store.insert_message(Message::new("m1", "c1", Role::Assistant, ""));

        assert!(store.update_message("c1", "m1", "partial"));
        assert!(!store.update_message("c1", "nope", "x"));
        assert_eq!(store.commit_message("c1", "m1").unwrap().content, "partial");
        assert_eq!(offline.saved_message("m1").unwrap().content, "partial");

        assert!(store.delete_message("c1", "m1").is_some());
        assert!(store.messages("c1").is_empty());
    }
}
