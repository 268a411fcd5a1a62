//! Direct transport to a local Ollama server.
//!
//! Ollama streams newline-delimited JSON rather than `data:` frames; each
//! line is re-framed so the engine sees the same protocol as the backend.

mod reframe;

pub use reframe::Reframer;

use async_trait::async_trait;
use chatloom_llm::{ByteStream, ChatMessage, ChatRequest, ChatTransport, Error};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio_stream::StreamExt;

/// Model ids with this prefix are routed here; the prefix is stripped
/// before the request goes out.
pub const MODEL_PREFIX: &str = "ollama/";

const AVAILABILITY_TIMEOUT: Duration = Duration::from_secs(2);

// ---------------------------------------------------------------------------
// Public API
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct OllamaConfig {
    pub base_url: String,
}

impl Default for OllamaConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:11434".into(),
        }
    }
}

impl OllamaConfig {
    /// Read `OLLAMA_BASE_URL`, defaulting to the standard local port.
    pub fn from_env() -> Self {
        match std::env::var("OLLAMA_BASE_URL") {
            Ok(url) if !url.trim().is_empty() => Self {
                base_url: url.trim().trim_end_matches('/').to_string(),
            },
            _ => Self::default(),
        }
    }
}

#[derive(Clone)]
pub struct OllamaTransport {
    state: Arc<TransportState>,
}

impl OllamaTransport {
    pub fn new(config: OllamaConfig) -> Self {
        Self {
            state: Arc::new(TransportState {
                client: reqwest::Client::new(),
                config,
            }),
        }
    }

    pub fn from_env() -> Self {
        Self::new(OllamaConfig::from_env())
    }
}

#[async_trait]
impl ChatTransport for OllamaTransport {
    fn name(&self) -> &str {
        "ollama"
    }

    async fn is_available(&self) -> bool {
        let url = format!("{}/api/tags", self.state.config.base_url);
        match self
            .state
            .client
            .get(&url)
            .timeout(AVAILABILITY_TIMEOUT)
            .send()
            .await
        {
            Ok(resp) => resp.status().is_success(),
            Err(err) => {
                tracing::debug!(url = %url, error = %err, "ollama not reachable");
                false
            }
        }
    }

    fn stream_chat(&self, request: ChatRequest) -> ByteStream {
        let body = OllamaChat {
            model: request
                .model
                .strip_prefix(MODEL_PREFIX)
                .unwrap_or(&request.model)
                .to_string(),
            messages: request.messages,
            stream: true,
            options: request.options.temperature.map(|temperature| OllamaOptions { temperature }),
        };
        ByteStream::new(open(Arc::clone(&self.state), body))
    }
}

// ---------------------------------------------------------------------------
// Internals
// ---------------------------------------------------------------------------

struct TransportState {
    client: reqwest::Client,
    config: OllamaConfig,
}

#[derive(Debug, Serialize)]
struct OllamaChat {
    model: String,
    messages: Vec<ChatMessage>,
    stream: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    options: Option<OllamaOptions>,
}

#[derive(Debug, Serialize)]
struct OllamaOptions {
    temperature: f32,
}

fn open(
    state: Arc<TransportState>,
    body: OllamaChat,
) -> impl futures::Stream<Item = Result<Vec<u8>, Error>> + Send {
    async_stream::try_stream! {
        let url = format!("{}/api/chat", state.config.base_url);
        tracing::debug!(model = %body.model, "opening ollama stream");

        let resp = state
            .client
            .post(&url)
            .json(&body)
            .send()
            .await
            .map_err(|e| Error::Http(Box::new(e)))?;

        if !resp.status().is_success() {
            let status = resp.status();
            let body_text = resp.text().await.unwrap_or_default();
            Err(Error::Api {
                code: status.as_str().to_string(),
                message: body_text,
            })?;
            unreachable!();
        }

        let mut reframer = Reframer::new();
        let mut bytes = std::pin::pin!(resp.bytes_stream());
        while let Some(chunk) = bytes.next().await {
            let chunk = chunk.map_err(|e| Error::Http(Box::new(e)))?;
            let framed = reframer.push(&chunk);
            if !framed.is_empty() {
                yield framed;
            }
        }
        let tail = reframer.finish();
        if !tail.is_empty() {
            yield tail;
        }
    }
}

#[cfg(test)]
mod tests {
    use chatloom_llm::{ChatMessage, ChatOptions, ChatRequest};

    use super::{OllamaConfig, OllamaTransport};

    #[test]
    fn default_points_at_local_server() {
        assert_eq!(OllamaConfig::default().base_url, "http://localhost:11434");
    }

    #[tokio::test]
    async fn unreachable_server_is_unavailable() {
        use chatloom_llm::ChatTransport;

        // Port 9 (discard) is closed on test machines.
        let transport = OllamaTransport::new(OllamaConfig {
            base_url: "http://127.0.0.1:9".into(),
        });
        assert!(!transport.is_available().await);

        let mut stream = transport.stream_chat(
            ChatRequest::new("ollama/llama3", vec![ChatMessage::user("hi")]).options(
                ChatOptions {
                    temperature: Some(0.9),
                    ..ChatOptions::default()
                },
            ),
        );
        assert!(matches!(stream.next().await, Some(Err(_))));
    }
}
