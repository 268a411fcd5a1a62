//! Lenient decoding of server and cache records.
//!
//! Older clients and the server disagree on field casing and timestamp
//! format. Everything is accepted as long as the identity fields exist.

use chatloom_llm::Role;
use chrono::{DateTime, NaiveDateTime};
use serde_json::{Map, Value};

use crate::collab::Migrator;
use crate::config::{DEFAULT_MODEL, DEFAULT_TITLE};
use crate::model::{Attachment, Conversation, Message, StreamStatus, now_ms};

/// Epoch values below this are taken to be seconds, not milliseconds.
const SECONDS_THRESHOLD: i64 = 100_000_000_000;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum MigrationError {
    #[error("record is not a JSON object")]
    NotAnObject,

    #[error("missing field: {0}")]
    MissingField(&'static str),

    #[error("invalid value for {field}: {value}")]
    InvalidField { field: &'static str, value: String },
}

#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultMigrator;

impl Migrator for DefaultMigrator {
    fn migrate_conversation(&self, raw: Value) -> Result<Conversation, MigrationError> {
        let record = Record::new(&raw)?;
        let id = record.required_id(&["id", "_id"])?;
        let created_at_ms = record
            .timestamp("created", &["createdAt", "created_at", "createdAtMs", "created_at_ms"])?
            .unwrap_or_else(now_ms);
        let updated_at_ms = record
            .timestamp("updated", &["updatedAt", "updated_at", "updatedAtMs", "updated_at_ms"])?
            .unwrap_or(created_at_ms);

        Ok(Conversation {
            id,
            user_id: record.string(&["userId", "user_id"]).unwrap_or_default(),
            title: record
                .string(&["title"])
                .filter(|t| !t.trim().is_empty())
                .unwrap_or_else(|| DEFAULT_TITLE.to_string()),
            model: record
                .string(&["model"])
                .filter(|m| !m.is_empty())
                .unwrap_or_else(|| DEFAULT_MODEL.to_string()),
            created_at_ms,
            updated_at_ms,
            is_archived: record.flag(&["isArchived", "is_archived"]).unwrap_or(false),
        })
    }

    fn migrate_message(&self, raw: Value) -> Result<Message, MigrationError> {
        let record = Record::new(&raw)?;
        let id = record.required_id(&["id", "_id"])?;
        let conversation_id = record
            .string(&["conversationId", "conversation_id"])
            .ok_or(MigrationError::MissingField("conversationId"))?;
        let role_text = record
            .string(&["role"])
            .ok_or(MigrationError::MissingField("role"))?;
        let role = Role::parse(&role_text.to_ascii_lowercase()).ok_or(
            MigrationError::InvalidField {
                field: "role",
                value: role_text,
            },
        )?;

        let stream_state = match record.string(&["streamState", "stream_state"]) {
            Some(text) => Some(StreamStatus::parse(&text).ok_or(MigrationError::InvalidField {
                field: "streamState",
                value: text,
            })?),
            None => None,
        };

        Ok(Message {
            id,
            conversation_id,
            role,
            content: record.text(&["content"]),
            model: record.string(&["model"]),
            parent_id: record
                .string(&["parentId", "parent_id", "parentMessageId"])
                .filter(|p| !p.is_empty()),
            created_at_ms: record
                .timestamp("created", &["createdAt", "created_at", "createdAtMs", "created_at_ms", "timestamp"])?
                .unwrap_or_else(now_ms),
            updated_at_ms: record
                .timestamp("updated", &["updatedAt", "updated_at", "updatedAtMs", "updated_at_ms"])?,
            attachments: record.attachments(),
            is_complete: record.flag(&["isComplete", "is_complete"]),
            stream_state,
            tokens_generated: record.count(&["tokensGenerated", "tokens_generated"]),
            total_tokens: record.count(&["totalTokens", "total_tokens"]),
            stream_id: record.string(&["streamId", "stream_id"]),
        })
    }
}

// ---------------------------------------------------------------------------
// Field access
// ---------------------------------------------------------------------------

struct Record<'a> {
    fields: &'a Map<String, Value>,
}

impl<'a> Record<'a> {
    fn new(raw: &'a Value) -> Result<Self, MigrationError> {
        raw.as_object()
            .map(|fields| Self { fields })
            .ok_or(MigrationError::NotAnObject)
    }

    fn first(&self, keys: &[&str]) -> Option<&'a Value> {
        keys.iter()
            .filter_map(|key| self.fields.get(*key))
            .find(|value| !value.is_null())
    }

    fn string(&self, keys: &[&str]) -> Option<String> {
        match self.first(keys)? {
            Value::String(s) => Some(s.clone()),
            Value::Number(n) => Some(n.to_string()),
            _ => None,
        }
    }

    fn required_id(&self, keys: &[&str]) -> Result<String, MigrationError> {
        self.string(keys)
            .filter(|id| !id.is_empty())
            .ok_or(MigrationError::MissingField("id"))
    }

    /// Message text. Non-string content is kept in its JSON form.
    fn text(&self, keys: &[&str]) -> String {
        match self.first(keys) {
            Some(Value::String(s)) => s.clone(),
            Some(other) => other.to_string(),
            None => String::new(),
        }
    }

    fn flag(&self, keys: &[&str]) -> Option<bool> {
        match self.first(keys)? {
            Value::Bool(b) => Some(*b),
            Value::Number(n) => n.as_i64().map(|n| n != 0),
            Value::String(s) => match s.as_str() {
                "true" | "1" => Some(true),
                "false" | "0" => Some(false),
                _ => None,
            },
            _ => None,
        }
    }

    fn count(&self, keys: &[&str]) -> Option<u64> {
        match self.first(keys)? {
            Value::Number(n) => n.as_u64().or_else(|| n.as_f64().map(|f| f.max(0.0) as u64)),
            Value::String(s) => s.parse().ok(),
            _ => None,
        }
    }

    fn timestamp(&self, field: &'static str, keys: &[&str]) -> Result<Option<i64>, MigrationError> {
        let Some(value) = self.first(keys) else {
            return Ok(None);
        };
        parse_timestamp(value)
            .map(Some)
            .ok_or_else(|| MigrationError::InvalidField {
                field,
                value: value.to_string(),
            })
    }

    fn attachments(&self) -> Vec<Attachment> {
        let Some(Value::Array(items)) = self.first(&["attachments"]) else {
            return Vec::new();
        };
        items
            .iter()
            .filter_map(|item| serde_json::from_value(item.clone()).ok())
            .collect()
    }
}

/// Epoch seconds or milliseconds, RFC 3339, or `YYYY-MM-DD HH:MM:SS` (UTC).
pub fn parse_timestamp(value: &Value) -> Option<i64> {
    match value {
        Value::Number(n) => n
            .as_i64()
            .or_else(|| n.as_f64().map(|f| f as i64))
            .map(normalise_epoch),
        Value::String(s) => {
            let s = s.trim();
            if let Ok(n) = s.parse::<i64>() {
                return Some(normalise_epoch(n));
            }
            if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
                return Some(dt.timestamp_millis());
            }
            NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S")
                .ok()
                .map(|dt| dt.and_utc().timestamp_millis())
        }
        _ => None,
    }
}

fn normalise_epoch(value: i64) -> i64 {
    if value.abs() < SECONDS_THRESHOLD {
        value * 1000
    } else {
        value
    }
}
