pub mod branch;
pub mod collab;
pub mod config;
pub mod engine;
pub mod error;
pub mod event;
pub mod ingest;
pub mod migrate;
pub mod model;
pub mod recovery;
pub mod store;
pub mod sync;
pub mod title;
pub mod tree;

#[cfg(test)]
mod testing;

pub use branch::{MessageTree, build_message_tree, get_active_path, switch_to_branch};
pub use collab::{
    BoxError, ImagePipeline, Migrator, NewConversation, NewMessage, OfflineStorage, QueuedMessage,
    RemoteApi, RemoteError, SyncOperation, SyncService, UsageTracker,
};
pub use config::EngineConfig;
pub use engine::{ChatEngine, GenerationOutcome, SendOptions};
pub use error::EngineError;
pub use event::EngineEvent;
pub use ingest::{AbortSignal, ContentUpdate, IngestEffect, Ingestor, StreamPhase, UpdatePriority};
pub use migrate::{DefaultMigrator, MigrationError};
pub use model::{Attachment, Conversation, Message, StreamStatus, is_temporary_id, now_ms, temp_id};
pub use recovery::{
    MemoryStreamStateStore, StreamState, StreamStateManager, StreamStateStore, create_stream_id,
};
pub use store::ConversationStore;
pub use sync::{MessageMerge, RecentlyDeleted, dedupe_key, merge_conversations, merge_messages};
pub use title::{derive_title, should_retitle};
pub use tree::{RootPath, children_of, context_before, parent_of, path_to_root};
