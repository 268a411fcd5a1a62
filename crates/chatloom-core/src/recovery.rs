//! Periodic snapshots of in-flight generations.
//!
//! Every stream gets a record keyed by its own id. Records still marked
//! `streaming` after a restart are generations that were interrupted. Nothing
//! here is allowed to fail a conversation: storage errors are logged and
//! dropped.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use chatloom_llm::ChatMessage;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::collab::BoxError;
use crate::model::{StreamStatus, now_ms};

pub const DEFAULT_SAVE_EVERY_TOKENS: u64 = 10;

pub fn create_stream_id() -> String {
    format!("stream_{}_{}", now_ms(), uuid::Uuid::new_v4().simple())
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamState {
    pub stream_id: String,
    pub conversation_id: String,
    pub message_id: String,
    pub model: String,
    pub started_at_ms: i64,
    pub tokens_generated: u64,
    pub last_chunk_at_ms: Option<i64>,
    /// The request context the generation was started with.
    pub messages: Vec<ChatMessage>,
    pub status: StreamStatus,
    pub detail: Option<String>,
    pub finished_at_ms: Option<i64>,
}

impl StreamState {
    pub fn start(
        conversation_id: impl Into<String>,
        message_id: impl Into<String>,
        model: impl Into<String>,
        messages: Vec<ChatMessage>,
    ) -> Self {
        Self {
            stream_id: create_stream_id(),
            conversation_id: conversation_id.into(),
            message_id: message_id.into(),
            model: model.into(),
            started_at_ms: now_ms(),
            tokens_generated: 0,
            last_chunk_at_ms: None,
            messages,
            status: StreamStatus::Streaming,
            detail: None,
            finished_at_ms: None,
        }
    }
}

/// Where stream records live. Implementations must be cheap to call from
/// inside the streaming loop.
pub trait StreamStateStore: Send + Sync {
    fn save(&self, state: &StreamState) -> Result<(), BoxError>;
    fn load(&self, stream_id: &str) -> Result<Option<StreamState>, BoxError>;
    fn list(&self) -> Result<Vec<StreamState>, BoxError>;
    fn remove(&self, stream_id: &str) -> Result<(), BoxError>;
}

#[derive(Debug, Default)]
pub struct MemoryStreamStateStore {
    records: Mutex<HashMap<String, StreamState>>,
}

impl MemoryStreamStateStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl StreamStateStore for MemoryStreamStateStore {
    fn save(&self, state: &StreamState) -> Result<(), BoxError> {
        self.records
            .lock()
            .insert(state.stream_id.clone(), state.clone());
        Ok(())
    }

    fn load(&self, stream_id: &str) -> Result<Option<StreamState>, BoxError> {
        Ok(self.records.lock().get(stream_id).cloned())
    }

    fn list(&self) -> Result<Vec<StreamState>, BoxError> {
        let mut records: Vec<StreamState> = self.records.lock().values().cloned().collect();
        records.sort_by_key(|r| r.started_at_ms);
        Ok(records)
    }

    fn remove(&self, stream_id: &str) -> Result<(), BoxError> {
        self.records.lock().remove(stream_id);
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Manager
// ---------------------------------------------------------------------------

pub struct StreamStateManager {
    store: Arc<dyn StreamStateStore>,
    save_every: u64,
    /// Live streams in this process -> token count at their last save.
    last_saved: Mutex<HashMap<String, u64>>,
    finished: Mutex<HashSet<String>>,
}

impl StreamStateManager {
    pub fn new(store: Arc<dyn StreamStateStore>) -> Self {
        Self {
            store,
            save_every: DEFAULT_SAVE_EVERY_TOKENS,
            last_saved: Mutex::new(HashMap::new()),
            finished: Mutex::new(HashSet::new()),
        }
    }

    pub fn save_every(mut self, tokens: u64) -> Self {
        self.save_every = tokens.max(1);
        self
    }

    /// Register a new stream and write its first snapshot.
    pub fn begin(&self, state: &StreamState) {
        self.last_saved
            .lock()
            .insert(state.stream_id.clone(), state.tokens_generated);
        self.save_stream_state(state);
    }

    /// Overwrite the stored snapshot.
    pub fn save_stream_state(&self, state: &StreamState) {
        if let Err(err) = self.store.save(state) {
            tracing::warn!(stream_id = %state.stream_id, error = %err, "failed to save stream state");
        }
    }

    pub fn load_stream_state(&self, stream_id: &str) -> Option<StreamState> {
        match self.store.load(stream_id) {
            Ok(state) => state,
            Err(err) => {
                tracing::warn!(stream_id, error = %err, "failed to load stream state");
                None
            }
        }
    }

    /// Update the running token count and persist it once enough tokens have
    /// accrued since the last save. Returns whether a save happened.
    pub fn record_progress(&self, state: &mut StreamState, tokens: u64) -> bool {
        state.tokens_generated = tokens;
        state.last_chunk_at_ms = Some(now_ms());

        if self.finished.lock().contains(&state.stream_id) {
            return false;
        }

        {
            let mut last_saved = self.last_saved.lock();
            let last = last_saved.get(&state.stream_id).copied().unwrap_or(0);
            if tokens < last.saturating_add(self.save_every) {
                return false;
            }
            last_saved.insert(state.stream_id.clone(), tokens);
        }

        self.save_stream_state(state);
        true
    }

    /// Raise the stored token count to the final one. Status is left alone,
    /// so this is safe after a terminal transition.
    pub fn settle_tokens(&self, stream_id: &str, tokens: u64) {
        let Some(mut state) = self.load_stream_state(stream_id) else {
            return;
        };
        if state.tokens_generated >= tokens {
            return;
        }
        state.tokens_generated = tokens;
        self.save_stream_state(&state);
    }

    pub fn mark_stream_complete(&self, stream_id: &str) {
        self.finish(stream_id, StreamStatus::Complete, None);
    }

    pub fn mark_stream_aborted(&self, stream_id: &str, reason: Option<&str>) {
        self.finish(stream_id, StreamStatus::Aborted, reason);
    }

    pub fn mark_stream_error(&self, stream_id: &str, error: Option<&str>) {
        self.finish(stream_id, StreamStatus::Error, error);
    }

    pub fn is_finished(&self, stream_id: &str) -> bool {
        self.finished.lock().contains(stream_id)
    }

    /// Records left in `streaming` by a previous run.
    pub fn interrupted_streams(&self) -> Vec<StreamState> {
        let records = match self.store.list() {
            Ok(records) => records,
            Err(err) => {
                tracing::warn!(error = %err, "failed to list stream states");
                return Vec::new();
            }
        };
        let live = self.last_saved.lock();
        records
            .into_iter()
            .filter(|r| r.status == StreamStatus::Streaming && !live.contains_key(&r.stream_id))
            .collect()
    }

    /// Delete terminal records that finished more than `older_than` ago.
    pub fn prune_finished(&self, older_than: Duration) -> usize {
        let cutoff = now_ms() - older_than.as_millis() as i64;
        let records = match self.store.list() {
            Ok(records) => records,
            Err(err) => {
                tracing::warn!(error = %err, "failed to list stream states");
                return 0;
            }
        };

        let mut pruned = 0;
        for record in records {
            let expired = record.status.is_terminal()
                && record.finished_at_ms.unwrap_or(record.started_at_ms) < cutoff;
            if !expired {
                continue;
            }
            match self.store.remove(&record.stream_id) {
                Ok(()) => pruned += 1,
                Err(err) => {
                    tracing::warn!(stream_id = %record.stream_id, error = %err, "failed to prune stream state");
                }
            }
        }
        pruned
    }

    /// First terminal transition wins; later ones are ignored.
    fn finish(&self, stream_id: &str, status: StreamStatus, detail: Option<&str>) {
        if !self.finished.lock().insert(stream_id.to_string()) {
            tracing::debug!(stream_id, status = status.as_str(), "stream already finished");
            return;
        }
        let last_saved = self.last_saved.lock().remove(stream_id);

        let Some(mut state) = self.load_stream_state(stream_id) else {
            tracing::warn!(stream_id, "no stream state to finish");
            return;
        };
        if let Some(tokens) = last_saved {
            state.tokens_generated = state.tokens_generated.max(tokens);
        }
        state.status = status;
        state.detail = detail.map(str::to_string);
        state.finished_at_ms = Some(now_ms());
        self.save_stream_state(&state);
    }
}
