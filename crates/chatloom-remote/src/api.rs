//! Conversation and message REST endpoints.

use async_trait::async_trait;
use chatloom_core::{NewConversation, NewMessage, RemoteApi, RemoteError};
use serde::de::DeserializeOwned;
use serde_json::Value;

use crate::types::{
    ConversationEnvelope, ConversationList, MessageEnvelope, MessageList, unwrap_envelope,
};
use crate::{BackendState, HttpBackend};

impl BackendState {
    /// Send a request and decode a 2xx JSON body. Non-2xx answers become
    /// [`RemoteError::Status`] carrying the body text.
    pub(crate) async fn call<T: DeserializeOwned>(
        &self,
        request: reqwest::RequestBuilder,
    ) -> Result<T, RemoteError> {
        let sent = self.authorize(request).send().await;
        self.observe(&sent);
        let resp = sent.map_err(|e| RemoteError::Transport(e.to_string()))?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(RemoteError::Status {
                code: status.as_u16(),
                body,
            });
        }

        let bytes = resp
            .bytes()
            .await
            .map_err(|e| RemoteError::Transport(e.to_string()))?;
        if bytes.is_empty() {
            return serde_json::from_value(Value::Null)
                .map_err(|e| RemoteError::Decode(e.to_string()));
        }
        serde_json::from_slice(&bytes).map_err(|e| RemoteError::Decode(e.to_string()))
    }
}

#[async_trait]
impl RemoteApi for HttpBackend {
    async fn create_conversation(&self, input: &NewConversation) -> Result<Value, RemoteError> {
        let state = &self.state;
        let body: Value = state
            .call(state.client.post(state.url("/api/conversations")).json(input))
            .await?;
        Ok(unwrap_envelope(body, |e: ConversationEnvelope| e.conversation))
    }

    async fn delete_conversation(&self, id: &str) -> Result<(), RemoteError> {
        let state = &self.state;
        let _: Value = state
            .call(state.client.delete(state.url(&format!("/api/conversations/{id}"))))
            .await?;
        Ok(())
    }

    async fn create_message(
        &self,
        conversation_id: &str,
        message: &NewMessage,
    ) -> Result<Value, RemoteError> {
        let state = &self.state;
        let url = state.url(&format!("/api/conversations/{conversation_id}/messages"));
        let body: Value = state.call(state.client.post(url).json(message)).await?;
        Ok(unwrap_envelope(body, |e: MessageEnvelope| e.message))
    }

    async fn list_conversations(&self) -> Result<Vec<Value>, RemoteError> {
        let state = &self.state;
        let list: ConversationList = state
            .call(state.client.get(state.url("/api/conversations")))
            .await?;
        Ok(list.conversations)
    }

    async fn list_messages(&self, conversation_id: &str) -> Result<Vec<Value>, RemoteError> {
        let state = &self.state;
        let url = state.url(&format!("/api/conversations/{conversation_id}/messages"));
        let list: MessageList = state.call(state.client.get(url)).await?;
        Ok(list.messages)
    }
}
