//! SQLite-backed offline cache and stream record store.

use std::collections::HashMap;
use std::path::Path;

use chatloom_core::{
    BoxError, Conversation, Message, OfflineStorage, StreamState, StreamStateStore, SyncOperation,
};
use chatloom_db::{PendingOperation, Store};
use parking_lot::Mutex;

pub struct SqliteOffline {
    store: Mutex<Store>,
}

impl SqliteOffline {
    pub fn open(path: &Path) -> chatloom_db::Result<Self> {
        Ok(Self {
            store: Mutex::new(Store::open(path)?),
        })
    }

    #[cfg(test)]
    pub fn open_in_memory() -> chatloom_db::Result<Self> {
        Ok(Self {
            store: Mutex::new(Store::open_in_memory()?),
        })
    }

    /// Everything cached, for hydrating a fresh conversation store.
    pub fn snapshot(
        &self,
    ) -> chatloom_db::Result<(Vec<Conversation>, HashMap<String, Vec<Message>>)> {
        let mut store = self.store.lock();
        let conversations = store.conversations().list()?;
        let messages = store.messages().list_all()?;
        Ok((conversations, messages))
    }

    pub fn conversation(&self, id: &str) -> chatloom_db::Result<Option<Conversation>> {
        self.store.lock().conversations().get(id)
    }

    pub fn pending_operations(&self) -> chatloom_db::Result<Vec<PendingOperation>> {
        self.store.lock().sync_queue().pending()
    }

    pub fn complete_operation(&self, seq: i64) -> chatloom_db::Result<()> {
        self.store.lock().sync_queue().remove(seq)
    }

    pub fn fail_operation(&self, seq: i64, error: &str) -> chatloom_db::Result<()> {
        self.store.lock().sync_queue().record_failure(seq, error)
    }

    /// Move a queued-then-created conversation from its temporary id to the
    /// server's, messages included.
    pub fn rekey_conversation(
        &self,
        temp_id: &str,
        server: &Conversation,
    ) -> chatloom_db::Result<()> {
        self.store.lock().conversations().rekey(temp_id, server)
    }
}

impl OfflineStorage for SqliteOffline {
    fn save_conversation(&self, conversation: &Conversation) -> Result<(), BoxError> {
        Ok(self.store.lock().conversations().upsert(conversation)?)
    }

    fn delete_conversation(&self, id: &str) -> Result<(), BoxError> {
        self.store.lock().conversations().delete(id)?;
        Ok(())
    }

    fn save_message(&self, message: &Message) -> Result<(), BoxError> {
        Ok(self.store.lock().messages().upsert(message)?)
    }

    fn save_messages(&self, conversation_id: &str, messages: &[Message]) -> Result<(), BoxError> {
        Ok(self
            .store
            .lock()
            .messages()
            .replace_all(conversation_id, messages)?)
    }

    fn delete_message(&self, id: &str) -> Result<(), BoxError> {
        self.store.lock().messages().delete(id)?;
        Ok(())
    }

    fn add_to_sync_queue(&self, operation: &SyncOperation) -> Result<(), BoxError> {
        let seq = self.store.lock().sync_queue().push(operation)?;
        tracing::debug!(seq, kind = operation.kind(), "queued remote write");
        Ok(())
    }
}

impl StreamStateStore for SqliteOffline {
    fn save(&self, state: &StreamState) -> Result<(), BoxError> {
        Ok(self.store.lock().stream_states().save(state)?)
    }

    fn load(&self, stream_id: &str) -> Result<Option<StreamState>, BoxError> {
        Ok(self.store.lock().stream_states().load(stream_id)?)
    }

    fn list(&self) -> Result<Vec<StreamState>, BoxError> {
        Ok(self.store.lock().stream_states().list()?)
    }

    fn remove(&self, stream_id: &str) -> Result<(), BoxError> {
        Ok(self.store.lock().stream_states().remove(stream_id)?)
    }
}

#[cfg(test)]
mod tests {
    use chatloom_core::{Conversation, Message, OfflineStorage};
    use chatloom_llm::Role;

    use super::SqliteOffline;

    #[test]
    fn rekey_moves_messages_to_server_id() {
        let storage = SqliteOffline::open_in_memory().unwrap();
        let local = Conversation::new_local("New Chat", "gpt-4o");
        storage.save_conversation(&local).unwrap();
        storage
            .save_message(&Message::new("m1", &local.id, Role::User, "hi").created_at(1))
            .unwrap();

        let server = Conversation {
            id: "srv-1".into(),
            ..local.clone()
        };
        storage.rekey_conversation(&local.id, &server).unwrap();

        let (conversations, messages) = storage.snapshot().unwrap();
        assert_eq!(conversations.len(), 1);
        assert_eq!(conversations[0].id, "srv-1");
        assert_eq!(messages["srv-1"][0].conversation_id, "srv-1");
        assert!(!messages.contains_key(&local.id));
    }
}
