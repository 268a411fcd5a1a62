/// Failures surfaced by [`ChatEngine`](crate::ChatEngine) operations.
///
/// Transport errors never show up here: they end the stream and are written
/// into the assistant message instead.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum EngineError {
    #[error("conversation not found: {0}")]
    ConversationNotFound(String),

    #[error("message not found: {0}")]
    MessageNotFound(String),

    #[error("message '{0}' is not the latest assistant reply")]
    NotRegenerable(String),

    #[error("no user message precedes '{0}'")]
    NoPromptForBranch(String),

    #[error("a response is already streaming in conversation '{0}'")]
    StreamInProgress(String),
}

pub type Result<T> = std::result::Result<T, EngineError>;
