use std::collections::HashMap;

use chatloom_core::Message;
use rusqlite::{OptionalExtension, params};

use crate::database::Database;
use crate::error::{Error, Result};
use crate::rows::{MESSAGE_COLUMNS, collect_rows, insert_message, row_to_message};

pub struct Messages<'db> {
    pub(crate) db: &'db mut Database,
}

impl Messages<'_> {
    pub fn upsert(&mut self, message: &Message) -> Result<()> {
        insert_message(&self.db.conn, message)
    }

    pub fn get(&self, id: &str) -> Result<Option<Message>> {
        self.db
            .conn
            .query_row(
                &format!("SELECT {MESSAGE_COLUMNS} FROM messages WHERE id = ?1"),
                params![id],
                row_to_message,
            )
            .optional()
            .map_err(Error::from)
    }

    /// Oldest first.
    pub fn list(&self, conversation_id: &str) -> Result<Vec<Message>> {
        let mut stmt = self.db.conn.prepare(&format!(
            "SELECT {MESSAGE_COLUMNS}
             FROM messages
             WHERE conversation_id = ?1
             ORDER BY created_at_ms ASC, rowid ASC"
        ))?;
        let rows = stmt.query_map(params![conversation_id], row_to_message)?;
        collect_rows(rows)
    }

    /// Every cached message, grouped by conversation.
    pub fn list_all(&self) -> Result<HashMap<String, Vec<Message>>> {
        let mut stmt = self.db.conn.prepare(&format!(
            "SELECT {MESSAGE_COLUMNS}
             FROM messages
             ORDER BY conversation_id, created_at_ms ASC, rowid ASC"
        ))?;
        let rows = stmt.query_map([], row_to_message)?;

        let mut grouped: HashMap<String, Vec<Message>> = HashMap::new();
        for message in collect_rows(rows)? {
            grouped
                .entry(message.conversation_id.clone())
                .or_default()
                .push(message);
        }
        Ok(grouped)
    }

    /// Make `messages` the complete set cached for the conversation.
    pub fn replace_all(&mut self, conversation_id: &str, messages: &[Message]) -> Result<()> {
        let tx = self.db.conn.transaction()?;
        tx.execute(
            "DELETE FROM messages WHERE conversation_id = ?1",
            params![conversation_id],
        )?;
        for message in messages {
            insert_message(&tx, message)?;
        }
        tx.commit()?;
        Ok(())
    }

    pub fn delete(&mut self, id: &str) -> Result<bool> {
        let removed = self
            .db
            .conn
            .execute("DELETE FROM messages WHERE id = ?1", params![id])?;
        Ok(removed > 0)
    }
}

#[cfg(test)]
mod tests {
    use chatloom_core::{Attachment, Message, StreamStatus};
    use chatloom_llm::Role;

    use crate::Store;

    fn streamed_reply() -> Message {
        let mut message = Message::new("m2", "c1", Role::Assistant, "partial")
            .parent(Some("m1".into()))
            .model("gpt-4o")
            .created_at(20)
            .attachments(vec![Attachment {
                name: "notes.txt".into(),
                mime_type: "text/plain".into(),
                url: None,
                size: Some(12),
            }]);
        message.is_complete = Some(false);
        message.stream_state = Some(StreamStatus::Aborted);
        message.tokens_generated = Some(7);
        message.stream_id = Some("stream_1".into());
        message
    }

    #[test]
    fn messages_keep_every_field() {
        let mut store = Store::open_in_memory().unwrap();
        let reply = streamed_reply();
        store.messages().upsert(&reply).unwrap();
        assert_eq!(store.messages().get("m2").unwrap(), Some(reply));
    }

    #[test]
    fn replace_all_swaps_one_conversation_only() {
        let mut store = Store::open_in_memory().unwrap();
        let mut messages = store.messages();
        messages
            .upsert(&Message::new("m1", "c1", Role::User, "hi").created_at(10))
            .unwrap();
        messages
            .upsert(&Message::new("x1", "c2", Role::User, "other").created_at(5))
            .unwrap();

        messages
            .replace_all(
                "c1",
                &[
                    Message::new("s2", "c1", Role::Assistant, "hello").created_at(30),
                    Message::new("s1", "c1", Role::User, "hi").created_at(10),
                ],
            )
            .unwrap();

        let ids: Vec<String> = messages.list("c1").unwrap().into_iter().map(|m| m.id).collect();
        assert_eq!(ids, vec!["s1", "s2"]);
        assert_eq!(messages.list("c2").unwrap().len(), 1);
        assert_eq!(messages.list_all().unwrap().len(), 2);
        assert!(messages.delete("x1").unwrap());
    }
}
