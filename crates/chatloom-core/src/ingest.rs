//! Folding a chunked `data:` stream into assistant message content.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use chatloom_llm::{
    BatteryDelta, ImageGenerationRequest, LineDecoder, Payload, TokenUsage, classify, frame_data,
};
use tokio::sync::Notify;

pub const IMAGE_PLACEHOLDER: &str = "🎨 Generating and compressing image...";

pub fn inline_image_markdown(base64: &str) -> String {
    format!("![Generated Image](data:image/png;base64,{base64})")
}

// ---------------------------------------------------------------------------
// Phase
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StreamPhase {
    #[default]
    Idle,
    Sending,
    Streaming,
    Completed,
    Aborted,
    Errored,
}

impl StreamPhase {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            StreamPhase::Completed | StreamPhase::Aborted | StreamPhase::Errored
        )
    }

    pub fn can_transition_to(self, next: StreamPhase) -> bool {
        use StreamPhase::*;
        matches!(
            (self, next),
            (Idle, Sending)
                | (Sending, Streaming)
                | (Sending | Streaming, Completed | Aborted | Errored)
        )
    }

    /// Move to `next` if allowed. Returns whether the phase changed.
    pub fn transition(&mut self, next: StreamPhase) -> bool {
        if !self.can_transition_to(next) {
            tracing::warn!(from = ?*self, to = ?next, "invalid stream phase transition");
            return false;
        }
        *self = next;
        true
    }
}

// ---------------------------------------------------------------------------
// Cancellation
// ---------------------------------------------------------------------------

/// One-shot cancellation flag shared between the caller and a stream loop.
#[derive(Debug, Clone, Default)]
pub struct AbortSignal {
    inner: Arc<AbortInner>,
}

#[derive(Debug, Default)]
struct AbortInner {
    aborted: AtomicBool,
    notify: Notify,
}

impl AbortSignal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn abort(&self) {
        if !self.inner.aborted.swap(true, Ordering::SeqCst) {
            self.inner.notify.notify_waiters();
        }
    }

    pub fn is_aborted(&self) -> bool {
        self.inner.aborted.load(Ordering::SeqCst)
    }

    /// Resolves once [`abort`](Self::abort) has been called.
    pub async fn aborted(&self) {
        loop {
            let notified = self.inner.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.is_aborted() {
                return;
            }
            notified.await;
        }
    }
}

// ---------------------------------------------------------------------------
// Ingestor
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdatePriority {
    /// Render promptly.
    Transition,
    /// Large payload; render when nothing else is pending.
    Idle,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ContentUpdate {
    pub content: String,
    pub priority: UpdatePriority,
}

#[derive(Debug, Clone, PartialEq)]
pub enum IngestEffect {
    Content(ContentUpdate),
    /// Estimated token count, before the server reports real usage.
    Tokens(u64),
    Usage {
        usage: TokenUsage,
        battery: Option<BatteryDelta>,
    },
    Image(ImageGenerationRequest),
    Progress,
}

/// Per-request accumulator. Feed it raw chunks, get back what changed.
#[derive(Debug)]
pub struct Ingestor {
    decoder: LineDecoder,
    content: String,
    tokens: u64,
    usage: Option<TokenUsage>,
    image_content: bool,
    image_requested: bool,
    pending_idle: Option<ContentUpdate>,
    last_progress: Option<Instant>,
    progress_interval: Duration,
    idle_threshold: usize,
}

impl Default for Ingestor {
    fn default() -> Self {
        Self::new(Duration::from_millis(100), 10_000)
    }
}

impl Ingestor {
    pub fn new(progress_interval: Duration, idle_threshold: usize) -> Self {
        Self {
            decoder: LineDecoder::new(),
            content: String::new(),
            tokens: 0,
            usage: None,
            image_content: false,
            image_requested: false,
            pending_idle: None,
            last_progress: None,
            progress_interval,
            idle_threshold,
        }
    }

    pub fn content(&self) -> &str {
        &self.content
    }

    pub fn tokens(&self) -> u64 {
        self.tokens
    }

    pub fn usage(&self) -> Option<TokenUsage> {
        self.usage
    }

    pub fn image_requested(&self) -> bool {
        self.image_requested
    }

    /// Take the coalesced idle-priority update, if one is waiting.
    pub fn take_idle(&mut self) -> Option<ContentUpdate> {
        self.pending_idle.take()
    }

    pub fn push(&mut self, chunk: &[u8], now: Instant) -> Vec<IngestEffect> {
        let mut effects = Vec::new();
        for line in self.decoder.push(chunk) {
            self.ingest_line(&line, now, &mut effects);
        }
        effects
    }

    /// Handle the unterminated tail of the stream and flush idle content.
    pub fn finish(&mut self, now: Instant) -> Vec<IngestEffect> {
        let mut effects = Vec::new();
        if let Some(line) = self.decoder.finish() {
            self.ingest_line(&line, now, &mut effects);
        }
        if let Some(update) = self.pending_idle.take() {
            effects.push(IngestEffect::Content(update));
        }
        effects
    }

    fn ingest_line(&mut self, line: &str, now: Instant, effects: &mut Vec<IngestEffect>) {
        let Some(data) = frame_data(line) else {
            return;
        };
        match classify(data) {
            Ok(payload) => self.apply(payload, now, effects),
            Err(err) => {
                tracing::warn!(error = %err, line = %truncate(data, 200), "skipping malformed stream frame");
            }
        }
    }

    fn apply(&mut self, payload: Payload, now: Instant, effects: &mut Vec<IngestEffect>) {
        match payload {
            Payload::Usage { usage, battery } => {
                self.usage = Some(usage);
                self.tokens = usage.total();
                effects.push(IngestEffect::Usage { usage, battery });
                return;
            }
            Payload::Text(text) => {
                self.content.push_str(&text);
                if self.usage.is_none() {
                    let words = text.split_whitespace().count() as u64;
                    if words > 0 {
                        self.tokens += words;
                        effects.push(IngestEffect::Tokens(self.tokens));
                    }
                }
            }
            Payload::ImageGeneration(request) => {
                self.content = IMAGE_PLACEHOLDER.to_string();
                self.image_content = true;
                self.image_requested = true;
                effects.push(IngestEffect::Image(request));
            }
            Payload::InlineImage { base64 } => {
                self.content = inline_image_markdown(&base64);
                self.image_content = true;
            }
            Payload::Unrecognized => {
                tracing::debug!("ignoring unrecognized stream frame");
                return;
            }
        }

        self.emit_content(effects);
        let due = self
            .last_progress
            .is_none_or(|last| now.duration_since(last) >= self.progress_interval);
        if due {
            self.last_progress = Some(now);
            effects.push(IngestEffect::Progress);
        }
    }

    fn emit_content(&mut self, effects: &mut Vec<IngestEffect>) {
        let idle = self.image_content && self.content.len() > self.idle_threshold;
        if idle {
            self.pending_idle = Some(ContentUpdate {
                content: self.content.clone(),
                priority: UpdatePriority::Idle,
            });
            return;
        }
        self.pending_idle = None;
        effects.push(IngestEffect::Content(ContentUpdate {
            content: self.content.clone(),
            priority: UpdatePriority::Transition,
        }));
    }
}

fn truncate(text: &str, max: usize) -> &str {
    match text.char_indices().nth(max) {
        Some((idx, _)) => &text[..idx],
        None => text,
    }
}
