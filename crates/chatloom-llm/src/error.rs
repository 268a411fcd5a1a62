/// Errors that can occur while talking to a chat backend.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("http error: {0}")]
    Http(Box<dyn std::error::Error + Send + Sync>),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    /// The backend answered with a non-2xx status. `message` is the raw body.
    #[error("api error ({code}): {message}")]
    Api { code: String, message: String },

    #[error("{0}")]
    Other(String),
}

impl Error {
    /// Text suitable for showing in place of the assistant reply.
    pub fn user_message(&self) -> String {
        match self {
            Error::Api { message, .. } if !message.trim().is_empty() => message.trim().to_string(),
            Error::Api { .. } => "Failed to send message".to_string(),
            Error::Http(err) => err.to_string(),
            other => other.to_string(),
        }
    }
}
