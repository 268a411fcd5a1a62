use std::path::Path;

use crate::conversations::Conversations;
use crate::database::Database;
use crate::error::Result;
use crate::messages::Messages;
use crate::stream_states::StreamStates;
use crate::sync_queue::SyncQueue;

/// The offline cache. One SQLite file per user data directory.
pub struct Store {
    db: Database,
}

impl Store {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        Ok(Self {
            db: Database::open(path.as_ref())?,
        })
    }

    pub fn open_in_memory() -> Result<Self> {
        Ok(Self {
            db: Database::open_in_memory()?,
        })
    }

    pub fn conversations(&mut self) -> Conversations<'_> {
        Conversations { db: &mut self.db }
    }

    pub fn messages(&mut self) -> Messages<'_> {
        Messages { db: &mut self.db }
    }

    pub fn sync_queue(&mut self) -> SyncQueue<'_> {
        SyncQueue { db: &mut self.db }
    }

    pub fn stream_states(&mut self) -> StreamStates<'_> {
        StreamStates { db: &mut self.db }
    }
}
