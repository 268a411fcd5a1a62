use chatloom_llm::TokenUsage;

use crate::ingest::{StreamPhase, UpdatePriority};

// ---------------------------------------------------------------------------
// Engine events
// ---------------------------------------------------------------------------

/// Events emitted by the engine while a reply streams in.
///
/// ```text
/// PhaseChanged(Sending)
/// PhaseChanged(Streaming)
/// (ContentUpdated | TokensUpdated | Progress)*
/// PhaseChanged(Completed | Aborted | Errored)
/// (TitleUpdated)?
/// (ImageResolved)?   ← may arrive after the phase change
/// ```
#[derive(Debug, Clone, PartialEq)]
pub enum EngineEvent {
    PhaseChanged {
        conversation_id: String,
        message_id: String,
        phase: StreamPhase,
    },

    /// The assistant message text changed. `content` is the full text.
    ContentUpdated {
        conversation_id: String,
        message_id: String,
        content: String,
        priority: UpdatePriority,
    },

    /// Displayed token count. `usage` is set once the server reported it.
    TokensUpdated {
        message_id: String,
        tokens: u64,
        usage: Option<TokenUsage>,
    },

    /// Throttled "keep the view scrolled" signal.
    Progress { message_id: String },

    /// The image pipeline finished (or failed) and rewrote the message.
    ImageResolved {
        message_id: String,
        content: String,
    },

    TitleUpdated {
        conversation_id: String,
        title: String,
    },
}
