//! Row mapping shared by the accessors.

use std::time::{SystemTime, UNIX_EPOCH};

use chatloom_core::{Conversation, Message, StreamStatus};
use chatloom_llm::Role;
use rusqlite::types::Type;
use rusqlite::{Row, params_from_iter};
use serde::de::DeserializeOwned;

use crate::error::Result;

pub(crate) const CONVERSATION_COLUMNS: &str =
    "id, user_id, title, model, created_at_ms, updated_at_ms, is_archived";

pub(crate) const MESSAGE_COLUMNS: &str = "id, conversation_id, role, content, model, parent_id, \
     created_at_ms, updated_at_ms, attachments, is_complete, stream_state, tokens_generated, \
     total_tokens, stream_id";

pub(crate) fn row_to_conversation(row: &Row<'_>) -> rusqlite::Result<Conversation> {
    Ok(Conversation {
        id: row.get(0)?,
        user_id: row.get(1)?,
        title: row.get(2)?,
        model: row.get(3)?,
        created_at_ms: row.get(4)?,
        updated_at_ms: row.get(5)?,
        is_archived: row.get(6)?,
    })
}

pub(crate) fn row_to_message(row: &Row<'_>) -> rusqlite::Result<Message> {
    let role: String = row.get(2)?;
    let stream_state: Option<String> = row.get(10)?;
    Ok(Message {
        id: row.get(0)?,
        conversation_id: row.get(1)?,
        role: Role::parse(&role).ok_or_else(|| invalid_text(2, format!("unknown role '{role}'")))?,
        content: row.get(3)?,
        model: row.get(4)?,
        parent_id: row.get(5)?,
        created_at_ms: row.get(6)?,
        updated_at_ms: row.get(7)?,
        attachments: parse_json_column(row, 8)?,
        is_complete: row.get(9)?,
        stream_state: stream_state
            .map(|raw| {
                StreamStatus::parse(&raw)
                    .ok_or_else(|| invalid_text(10, format!("unknown stream state '{raw}'")))
            })
            .transpose()?,
        tokens_generated: row.get::<_, Option<i64>>(11)?.map(|n| n.max(0) as u64),
        total_tokens: row.get::<_, Option<i64>>(12)?.map(|n| n.max(0) as u64),
        stream_id: row.get(13)?,
    })
}

/// Positional parameters for an `INSERT ... (MESSAGE_COLUMNS)`.
pub(crate) fn message_params(message: &Message) -> Result<[rusqlite::types::Value; 14]> {
    use rusqlite::types::Value;

    let text = |s: &str| Value::Text(s.to_string());
    let opt_text = |s: Option<&str>| s.map_or(Value::Null, |s| Value::Text(s.to_string()));
    let opt_int = |n: Option<i64>| n.map_or(Value::Null, Value::Integer);

    Ok([
        text(&message.id),
        text(&message.conversation_id),
        text(message.role.as_str()),
        text(&message.content),
        opt_text(message.model.as_deref()),
        opt_text(message.parent_id.as_deref()),
        Value::Integer(message.created_at_ms),
        opt_int(message.updated_at_ms),
        Value::Text(serde_json::to_string(&message.attachments)?),
        opt_int(message.is_complete.map(i64::from)),
        opt_text(message.stream_state.map(StreamStatus::as_str)),
        opt_int(message.tokens_generated.map(|n| n as i64)),
        opt_int(message.total_tokens.map(|n| n as i64)),
        opt_text(message.stream_id.as_deref()),
    ])
}

pub(crate) fn insert_message(conn: &rusqlite::Connection, message: &Message) -> Result<()> {
    conn.execute(
        &format!(
            "INSERT OR REPLACE INTO messages ({MESSAGE_COLUMNS})
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)"
        ),
        params_from_iter(message_params(message)?),
    )?;
    Ok(())
}

pub(crate) fn parse_json_column<T: DeserializeOwned>(
    row: &Row<'_>,
    idx: usize,
) -> rusqlite::Result<T> {
    let raw: String = row.get(idx)?;
    serde_json::from_str(&raw)
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

fn invalid_text(idx: usize, reason: String) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, reason.into())
}

pub(crate) fn collect_rows<T, F>(iter: rusqlite::MappedRows<'_, F>) -> Result<Vec<T>>
where
    F: FnMut(&Row<'_>) -> rusqlite::Result<T>,
{
    let mut rows = Vec::new();
    for row in iter {
        rows.push(row?);
    }
    Ok(rows)
}

pub(crate) fn now_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as i64
}
