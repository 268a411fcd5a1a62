mod api;
mod images;
mod stream;
mod types;

pub use images::ImageError;

use async_trait::async_trait;
use chatloom_llm::{ByteStream, ChatRequest, ChatTransport};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

// ---------------------------------------------------------------------------
// Public API
// ---------------------------------------------------------------------------

/// Where the chat backend lives and how to authenticate against it.
#[derive(Debug, Clone)]
pub struct BackendConfig {
    pub base_url: String,
    pub api_key: Option<String>,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:3000".into(),
            api_key: None,
        }
    }
}

impl BackendConfig {
    /// Read `CHATLOOM_BASE_URL` and `CHATLOOM_API_KEY`, keeping defaults for
    /// whatever is unset.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Ok(base_url) = std::env::var("CHATLOOM_BASE_URL")
            && !base_url.trim().is_empty()
        {
            config.base_url = base_url.trim().trim_end_matches('/').to_string();
        }
        config.api_key = std::env::var("CHATLOOM_API_KEY")
            .ok()
            .filter(|key| !key.trim().is_empty());
        config
    }
}

/// HTTP client for the chat backend.
///
/// One value serves as the chat transport, the conversation REST API and
/// the image upload pipeline. Clones share the connection pool and the
/// connectivity flag.
#[derive(Clone)]
pub struct HttpBackend {
    state: Arc<BackendState>,
}

impl HttpBackend {
    pub fn new(config: BackendConfig) -> Self {
        Self {
            state: Arc::new(BackendState {
                client: reqwest::Client::new(),
                config,
                online: AtomicBool::new(true),
            }),
        }
    }

    pub fn from_env() -> Self {
        Self::new(BackendConfig::from_env())
    }

    pub fn config(&self) -> &BackendConfig {
        &self.state.config
    }

    /// Whether the last request reached the server.
    pub fn is_online(&self) -> bool {
        self.state.online.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ChatTransport for HttpBackend {
    fn name(&self) -> &str {
        "backend"
    }

    fn stream_chat(&self, request: ChatRequest) -> ByteStream {
        let body = types::ChatBody::from_request(&request);
        ByteStream::new(stream::open(Arc::clone(&self.state), body))
    }
}

// ---------------------------------------------------------------------------
// Internals
// ---------------------------------------------------------------------------

struct BackendState {
    client: reqwest::Client,
    config: BackendConfig,
    online: AtomicBool,
}

impl BackendState {
    fn url(&self, path: &str) -> String {
        format!("{}{}", self.config.base_url.trim_end_matches('/'), path)
    }

    fn authorize(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.config.api_key {
            Some(key) => request.bearer_auth(key),
            None => request,
        }
    }

    /// Record whether a request got an answer. Any HTTP response counts.
    fn observe<T>(&self, result: &Result<T, reqwest::Error>) {
        let reached = match result {
            Ok(_) => true,
            Err(err) => !(err.is_connect() || err.is_timeout()),
        };
        let was = self.online.swap(reached, Ordering::SeqCst);
        if was != reached {
            tracing::info!(online = reached, base_url = %self.config.base_url, "backend connectivity changed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{BackendConfig, HttpBackend};

    #[test]
    fn urls_join_without_double_slashes() {
        let backend = HttpBackend::new(BackendConfig {
            base_url: "http://example.test/".into(),
            api_key: None,
        });
        assert_eq!(
            backend.state.url("/api/chat"),
            "http://example.test/api/chat"
        );
        assert!(backend.is_online());
    }
}
