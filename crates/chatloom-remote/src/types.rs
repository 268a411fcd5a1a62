//! Backend wire types.
//!
//! Records (conversations, messages) stay raw `serde_json::Value`s: the
//! store runs them through its migrator, which knows every shape the
//! backend has ever produced.

use std::collections::HashMap;

use chatloom_llm::{ChatMessage, ChatRequest};
use serde::{Deserialize, Serialize};
use serde_json::Value;

// ---------------------------------------------------------------------------
// Chat
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatBody {
    pub messages: Vec<ChatMessage>,
    pub model: String,
    pub stream: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub conversation_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub web_search: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub image_generation: Option<Value>,
    #[serde(flatten)]
    pub extra: HashMap<String, Value>,
}

impl ChatBody {
    pub fn from_request(request: &ChatRequest) -> Self {
        Self {
            messages: request.messages.clone(),
            model: request.model.clone(),
            stream: true,
            conversation_id: request.conversation_id.clone(),
            temperature: request.options.temperature,
            web_search: request.options.web_search,
            image_generation: request.options.image_generation.clone(),
            extra: request.metadata.clone(),
        }
    }
}

// ---------------------------------------------------------------------------
// REST envelopes
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
pub struct ConversationEnvelope {
    pub conversation: Value,
}

#[derive(Debug, Deserialize)]
pub struct ConversationList {
    #[serde(default)]
    pub conversations: Vec<Value>,
}

#[derive(Debug, Deserialize)]
pub struct MessageEnvelope {
    pub message: Value,
}

#[derive(Debug, Deserialize)]
pub struct MessageList {
    #[serde(default)]
    pub messages: Vec<Value>,
}

#[derive(Debug, Deserialize)]
pub struct UploadResponse {
    pub url: String,
}

/// Unwrap `{"<key>": record}`, or take the body as the record itself.
pub fn unwrap_envelope<T>(body: Value, extract: impl FnOnce(T) -> Value) -> Value
where
    T: for<'de> Deserialize<'de>,
{
    match serde_json::from_value::<T>(body.clone()) {
        Ok(envelope) => extract(envelope),
        Err(_) => body,
    }
}

#[cfg(test)]
mod tests {
    use chatloom_llm::{ChatMessage, ChatOptions, ChatRequest};
    use serde_json::json;

    use super::{ChatBody, ConversationEnvelope, unwrap_envelope};

    #[test]
    fn chat_body_matches_backend_shape() {
        let request = ChatRequest::new("gpt-4o", vec![ChatMessage::user("hi")])
            .conversation("c1")
            .options(ChatOptions {
                temperature: Some(0.9),
                ..ChatOptions::default()
            })
            .meta("ollamaBaseUrl", "http://localhost:11434");

        let body = serde_json::to_value(ChatBody::from_request(&request)).unwrap();
        assert_eq!(
            body,
            json!({
                "messages": [{ "role": "user", "content": "hi" }],
                "model": "gpt-4o",
                "stream": true,
                "conversationId": "c1",
                "temperature": 0.9f32,
                "ollamaBaseUrl": "http://localhost:11434",
            })
        );
    }

    #[test]
    fn bare_records_pass_through() {
        let wrapped = json!({ "conversation": { "id": "c1" } });
        let bare = json!({ "id": "c2" });
        let extract = |e: ConversationEnvelope| e.conversation;
        assert_eq!(unwrap_envelope(wrapped, extract)["id"], "c1");
        assert_eq!(unwrap_envelope(bare, extract)["id"], "c2");
    }
}
