use chatloom_core::Conversation;
use rusqlite::{Connection, OptionalExtension, params};

use crate::database::Database;
use crate::error::{Error, Result};
use crate::rows::{CONVERSATION_COLUMNS, collect_rows, row_to_conversation};

pub struct Conversations<'db> {
    pub(crate) db: &'db mut Database,
}

impl Conversations<'_> {
    pub fn upsert(&mut self, conversation: &Conversation) -> Result<()> {
        upsert_conversation(&self.db.conn, conversation)
    }

    pub fn get(&self, id: &str) -> Result<Option<Conversation>> {
        self.db
            .conn
            .query_row(
                &format!("SELECT {CONVERSATION_COLUMNS} FROM conversations WHERE id = ?1"),
                params![id],
                row_to_conversation,
            )
            .optional()
            .map_err(Error::from)
    }

    /// Newest first.
    pub fn list(&self) -> Result<Vec<Conversation>> {
        let mut stmt = self.db.conn.prepare(&format!(
            "SELECT {CONVERSATION_COLUMNS}
             FROM conversations
             ORDER BY updated_at_ms DESC, id ASC"
        ))?;
        let rows = stmt.query_map([], row_to_conversation)?;
        collect_rows(rows)
    }

    /// Replace a temporary conversation with the server's record, moving its
    /// messages across. All or nothing.
    pub fn rekey(&mut self, temp_id: &str, server: &Conversation) -> Result<()> {
        let tx = self.db.conn.transaction()?;
        upsert_conversation(&tx, server)?;
        if temp_id != server.id {
            tx.execute(
                "UPDATE messages SET conversation_id = ?2 WHERE conversation_id = ?1",
                params![temp_id, server.id],
            )?;
            tx.execute("DELETE FROM conversations WHERE id = ?1", params![temp_id])?;
        }
        tx.commit()?;
        Ok(())
    }

    /// Remove a conversation and its messages. Returns whether it existed.
    pub fn delete(&mut self, id: &str) -> Result<bool> {
        let tx = self.db.conn.transaction()?;
        tx.execute("DELETE FROM messages WHERE conversation_id = ?1", params![id])?;
        let removed = tx.execute("DELETE FROM conversations WHERE id = ?1", params![id])?;
        tx.commit()?;
        Ok(removed > 0)
    }
}

fn upsert_conversation(conn: &Connection, conversation: &Conversation) -> Result<()> {
    conn.execute(
        "INSERT INTO conversations (
            id, user_id, title, model, created_at_ms, updated_at_ms, is_archived
         ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
         ON CONFLICT(id) DO UPDATE SET
            user_id = excluded.user_id,
            title = excluded.title,
            model = excluded.model,
            updated_at_ms = excluded.updated_at_ms,
            is_archived = excluded.is_archived",
        params![
            conversation.id,
            conversation.user_id,
            conversation.title,
            conversation.model,
            conversation.created_at_ms,
            conversation.updated_at_ms,
            conversation.is_archived,
        ],
    )?;
    Ok(())
}
