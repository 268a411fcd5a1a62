//! Replays queued remote writes in order.
//!
//! Conversations created offline carry a temporary id. Their create goes
//! first in the queue; once the server answers, later operations that still
//! name the temporary id are rewritten to the server id before they are sent.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use chatloom_core::{BoxError, DefaultMigrator, Migrator, RemoteApi, SyncOperation, SyncService};
use chatloom_remote::HttpBackend;

use crate::storage::SqliteOffline;

pub struct QueueSync {
    storage: Arc<SqliteOffline>,
    remote: Arc<dyn RemoteApi>,
    backend: Option<HttpBackend>,
}

impl QueueSync {
    pub fn new(storage: Arc<SqliteOffline>, backend: HttpBackend) -> Self {
        Self {
            storage,
            remote: Arc::new(backend.clone()),
            backend: Some(backend),
        }
    }

    #[cfg(test)]
    fn with_remote(storage: Arc<SqliteOffline>, remote: Arc<dyn RemoteApi>) -> Self {
        Self {
            storage,
            remote,
            backend: None,
        }
    }

    async fn replay(
        &self,
        operation: SyncOperation,
        created: &mut HashMap<String, String>,
        dropped: &HashSet<String>,
    ) -> Result<Replay, BoxError> {
        match operation {
            SyncOperation::CreateConversation {
                local_id,
                conversation,
            } => {
                if self.storage.conversation(&local_id)?.is_none() {
                    return Ok(Replay::Dropped(Some(local_id)));
                }
                let raw = self.remote.create_conversation(&conversation).await?;
                let server = DefaultMigrator.migrate_conversation(raw)?;
                self.storage.rekey_conversation(&local_id, &server)?;
                tracing::info!(local_id = %local_id, server_id = %server.id, "queued conversation created");
                created.insert(local_id, server.id);
                Ok(Replay::Sent)
            }
            SyncOperation::DeleteConversation { id } => {
                let id = created.get(&id).cloned().unwrap_or(id);
                self.remote.delete_conversation(&id).await?;
                Ok(Replay::Sent)
            }
            SyncOperation::CreateMessage(mut queued) => {
                if dropped.contains(&queued.conversation_id) {
                    return Ok(Replay::Dropped(None));
                }
                if let Some(server_id) = created.get(&queued.conversation_id) {
                    queued.conversation_id = server_id.clone();
                }
                self.remote
                    .create_message(&queued.conversation_id, &queued.message)
                    .await?;
                Ok(Replay::Sent)
            }
        }
    }
}

enum Replay {
    Sent,
    /// The operation targets a conversation deleted locally before it ever
    /// reached the server.
    Dropped(Option<String>),
}

#[async_trait]
impl SyncService for QueueSync {
    fn is_online(&self) -> bool {
        self.backend.as_ref().is_none_or(HttpBackend::is_online)
    }

    async fn process_sync_queue(&self) -> Result<usize, BoxError> {
        let pending = self.storage.pending_operations()?;
        if pending.is_empty() {
            return Ok(0);
        }
        tracing::info!(pending = pending.len(), "replaying sync queue");

        let mut created = HashMap::new();
        let mut dropped = HashSet::new();
        let mut sent = 0;
        for entry in pending {
            let kind = entry.operation.kind();
            match self.replay(entry.operation, &mut created, &dropped).await {
                Ok(Replay::Sent) => {
                    self.storage.complete_operation(entry.seq)?;
                    sent += 1;
                }
                Ok(Replay::Dropped(conversation)) => {
                    tracing::debug!(seq = entry.seq, kind, "dropping queued write for deleted conversation");
                    dropped.extend(conversation);
                    self.storage.complete_operation(entry.seq)?;
                }
                Err(err) => {
                    // Later operations may depend on this one.
                    tracing::warn!(seq = entry.seq, kind, error = %err, "sync replay failed, stopping");
                    self.storage.fail_operation(entry.seq, &err.to_string())?;
                    break;
                }
            }
        }
        Ok(sent)
    }
}
