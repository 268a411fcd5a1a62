//! Collaborators the engine talks to but does not own.
//!
//! Storage, the REST backend, the sync queue, the image pipeline and the
//! usage meter sit behind these traits so they can be swapped for fakes.

use async_trait::async_trait;
use chatloom_llm::{BatteryDelta, ImageGenerationRequest, Role, TokenUsage};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::migrate::MigrationError;
use crate::model::{Attachment, Conversation, Message};

pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

// ---------------------------------------------------------------------------
// Wire types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewConversation {
    pub title: String,
    pub model: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewMessage {
    /// Client-side id, echoed back so the server record can be matched.
    pub client_id: String,
    pub role: Role,
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<String>,
    #[serde(default)]
    pub attachments: Vec<Attachment>,
}

impl From<&Message> for NewMessage {
    fn from(message: &Message) -> Self {
        Self {
            client_id: message.id.clone(),
            role: message.role,
            content: message.content.clone(),
            model: message.model.clone(),
            parent_id: message.parent_id.clone(),
            attachments: message.attachments.clone(),
        }
    }
}

/// A message write waiting in the sync queue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueuedMessage {
    pub conversation_id: String,
    #[serde(flatten)]
    pub message: NewMessage,
}

/// A remote write that failed at call time and must be replayed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum SyncOperation {
    CreateConversation {
        local_id: String,
        #[serde(flatten)]
        conversation: NewConversation,
    },
    DeleteConversation {
        id: String,
    },
    CreateMessage(QueuedMessage),
}

impl SyncOperation {
    pub fn kind(&self) -> &'static str {
        match self {
            SyncOperation::CreateConversation { .. } => "create_conversation",
            SyncOperation::DeleteConversation { .. } => "delete_conversation",
            SyncOperation::CreateMessage(_) => "create_message",
        }
    }
}

// ---------------------------------------------------------------------------
// Remote
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum RemoteError {
    #[error("server returned {code}: {body}")]
    Status { code: u16, body: String },

    #[error("transport error: {0}")]
    Transport(String),

    #[error("decode error: {0}")]
    Decode(String),
}

/// The conversation/message REST API. Records come back as raw JSON and go
/// through a [`Migrator`] before use.
#[async_trait]
pub trait RemoteApi: Send + Sync {
    async fn create_conversation(&self, input: &NewConversation) -> Result<Value, RemoteError>;
    async fn delete_conversation(&self, id: &str) -> Result<(), RemoteError>;
    async fn create_message(
        &self,
        conversation_id: &str,
        message: &NewMessage,
    ) -> Result<Value, RemoteError>;
    async fn list_conversations(&self) -> Result<Vec<Value>, RemoteError>;
    async fn list_messages(&self, conversation_id: &str) -> Result<Vec<Value>, RemoteError>;
}

#[async_trait]
pub trait SyncService: Send + Sync {
    fn is_online(&self) -> bool;

    /// Replay queued writes. Returns how many were delivered.
    async fn process_sync_queue(&self) -> Result<usize, BoxError>;
}

// ---------------------------------------------------------------------------
// Local
// ---------------------------------------------------------------------------

/// Best-effort local cache. Callers log failures and carry on.
pub trait OfflineStorage: Send + Sync {
    fn save_conversation(&self, conversation: &Conversation) -> Result<(), BoxError>;
    fn delete_conversation(&self, id: &str) -> Result<(), BoxError>;
    fn save_message(&self, message: &Message) -> Result<(), BoxError>;
    fn save_messages(&self, conversation_id: &str, messages: &[Message]) -> Result<(), BoxError>;
    fn delete_message(&self, id: &str) -> Result<(), BoxError>;
    fn add_to_sync_queue(&self, operation: &SyncOperation) -> Result<(), BoxError>;
}

/// Normalises records of any schema version into the current model.
pub trait Migrator: Send + Sync {
    fn migrate_conversation(&self, raw: Value) -> Result<Conversation, MigrationError>;
    fn migrate_message(&self, raw: Value) -> Result<Message, MigrationError>;
}

// ---------------------------------------------------------------------------
// Side channels
// ---------------------------------------------------------------------------

/// Downloads, compresses and stores a generated image. Returns the final URL.
#[async_trait]
pub trait ImagePipeline: Send + Sync {
    async fn process(&self, request: &ImageGenerationRequest) -> Result<String, BoxError>;
}

pub trait UsageTracker: Send + Sync {
    fn record_usage(&self, usage: TokenUsage, battery: Option<BatteryDelta>);
}

#[cfg(test)]
mod tests {
    use chatloom_llm::Role;
    use serde_json::json;

    use super::{NewConversation, NewMessage, QueuedMessage, SyncOperation};

    #[test]
    fn sync_operations_are_tagged() {
        let op = SyncOperation::CreateConversation {
            local_id: "temp-1".into(),
            conversation: NewConversation {
                title: "New Chat".into(),
                model: "gpt-4o".into(),
            },
        };
        let value = serde_json::to_value(&op).unwrap();
        assert_eq!(
            value,
            json!({
                "type": "create_conversation",
                "data": { "local_id": "temp-1", "title": "New Chat", "model": "gpt-4o" }
            })
        );
        assert_eq!(serde_json::from_value::<SyncOperation>(value).unwrap(), op);
    }

    #[test]
    fn queued_message_flattens_the_body() {
        let op = SyncOperation::CreateMessage(QueuedMessage {
            conversation_id: "c1".into(),
            message: NewMessage {
                client_id: "temp-m".into(),
                role: Role::User,
                content: "hi".into(),
                model: None,
                parent_id: None,
                attachments: Vec::new(),
            },
        });
        let value = serde_json::to_value(&op).unwrap();
        assert_eq!(value["type"], "create_message");
        assert_eq!(value["data"]["conversationId"], "c1");
        assert_eq!(value["data"]["content"], "hi");
        assert_eq!(op.kind(), "create_message");
    }
}
