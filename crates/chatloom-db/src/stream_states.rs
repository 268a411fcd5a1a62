use chatloom_core::StreamState;
use rusqlite::{OptionalExtension, params};

use crate::database::Database;
use crate::error::{Error, Result};
use crate::rows::{collect_rows, now_ms, parse_json_column};

/// Recovery records, one per generation. The record itself is stored as
/// JSON; the indexed columns mirror it for listing.
pub struct StreamStates<'db> {
    pub(crate) db: &'db mut Database,
}

impl StreamStates<'_> {
    pub fn save(&mut self, state: &StreamState) -> Result<()> {
        self.db.conn.execute(
            "INSERT INTO stream_states (
                stream_id, conversation_id, message_id, status, state, updated_at_ms
             ) VALUES (?1, ?2, ?3, ?4, ?5, ?6)
             ON CONFLICT(stream_id) DO UPDATE SET
                conversation_id = excluded.conversation_id,
                message_id = excluded.message_id,
                status = excluded.status,
                state = excluded.state,
                updated_at_ms = excluded.updated_at_ms",
            params![
                state.stream_id,
                state.conversation_id,
                state.message_id,
                state.status.as_str(),
                serde_json::to_string(state)?,
                now_ms(),
            ],
        )?;
        Ok(())
    }

    pub fn load(&self, stream_id: &str) -> Result<Option<StreamState>> {
        self.db
            .conn
            .query_row(
                "SELECT state FROM stream_states WHERE stream_id = ?1",
                params![stream_id],
                |row| parse_json_column(row, 0),
            )
            .optional()
            .map_err(Error::from)
    }

    pub fn list(&self) -> Result<Vec<StreamState>> {
        let mut stmt = self
            .db
            .conn
            .prepare("SELECT state FROM stream_states ORDER BY updated_at_ms ASC")?;
        let rows = stmt.query_map([], |row| parse_json_column(row, 0))?;
        collect_rows(rows)
    }

    pub fn remove(&mut self, stream_id: &str) -> Result<()> {
        self.db.conn.execute(
            "DELETE FROM stream_states WHERE stream_id = ?1",
            params![stream_id],
        )?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use chatloom_core::{StreamState, StreamStatus};
    use chatloom_llm::ChatMessage;

    use crate::Store;

    #[test]
    fn records_are_overwritten_by_stream_id() {
        let mut store = Store::open_in_memory().unwrap();
        let mut state = StreamState::start("c1", "m1", "gpt-4o", vec![ChatMessage::user("hi")]);
        store.stream_states().save(&state).unwrap();

        state.tokens_generated = 20;
        state.status = StreamStatus::Complete;
        store.stream_states().save(&state).unwrap();

        let listed = store.stream_states().list().unwrap();
        assert_eq!(listed, vec![state.clone()]);
        assert_eq!(store.stream_states().load(&state.stream_id).unwrap(), Some(state.clone()));

        store.stream_states().remove(&state.stream_id).unwrap();
        assert_eq!(store.stream_states().load(&state.stream_id).unwrap(), None);
    }
}
