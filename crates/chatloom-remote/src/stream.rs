//! Opens the backend's streaming chat endpoint and hands back raw body
//! chunks. Frame decoding happens in the engine.

use crate::BackendState;
use crate::types::ChatBody;
use chatloom_llm::Error;
use futures::Stream;
use std::sync::Arc;
use tokio_stream::StreamExt;

pub fn open(
    state: Arc<BackendState>,
    body: ChatBody,
) -> impl Stream<Item = Result<Vec<u8>, Error>> + Send {
    async_stream::try_stream! {
        let url = state.url("/api/chat");
        tracing::debug!(model = %body.model, messages = body.messages.len(), "opening chat stream");

        let sent = state.authorize(state.client.post(&url)).json(&body).send().await;
        state.observe(&sent);
        let resp = sent.map_err(|e| Error::Http(Box::new(e)))?;

        if !resp.status().is_success() {
            let status = resp.status();
            let body_text = resp.text().await.unwrap_or_default();
            Err(Error::Api {
                code: status.as_str().to_string(),
                message: error_text(&body_text),
            })?;
            unreachable!();
        }

        let mut bytes = std::pin::pin!(resp.bytes_stream());
        while let Some(chunk) = bytes.next().await {
            let chunk = chunk.map_err(|e| Error::Http(Box::new(e)))?;
            yield chunk.to_vec();
        }
    }
}

/// The backend reports failures as `{"error": "..."}`; fall back to the
/// raw body for anything else.
fn error_text(body: &str) -> String {
    serde_json::from_str::<serde_json::Value>(body)
        .ok()
        .and_then(|value| {
            value
                .get("error")
                .and_then(|e| e.as_str().or_else(|| e.get("message")?.as_str()))
                .map(ToString::to_string)
        })
        .unwrap_or_else(|| body.to_string())
}

#[cfg(test)]
mod tests {
    use super::error_text;

    #[test]
    fn error_bodies_are_unwrapped() {
        assert_eq!(error_text(r#"{"error":"Invalid API key"}"#), "Invalid API key");
        assert_eq!(
            error_text(r#"{"error":{"message":"quota exceeded"}}"#),
            "quota exceeded"
        );
        assert_eq!(error_text("Bad Gateway"), "Bad Gateway");
    }
}
