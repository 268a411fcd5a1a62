mod conversations;
mod database;
pub mod error;
mod messages;
mod migration;
mod rows;
mod store;
mod stream_states;
mod sync_queue;

pub use conversations::Conversations;
pub use error::{Error, Result};
pub use messages::Messages;
pub use store::Store;
pub use stream_states::StreamStates;
pub use sync_queue::{PendingOperation, SyncQueue};
