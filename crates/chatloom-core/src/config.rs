use std::time::Duration;

use serde::{Deserialize, Serialize};

pub const DEFAULT_MODEL: &str = "gpt-4o";
pub const DEFAULT_TITLE: &str = "New Chat";

/// Engine tunables. Every field has a default, so partial config files work.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub default_model: String,
    pub default_title: String,
    /// Stream snapshots are written after this many new tokens.
    pub save_every_tokens: u64,
    /// Minimum wall time between progress signals.
    pub progress_interval_ms: u64,
    /// Image content longer than this is delivered at idle priority.
    pub idle_content_threshold: usize,
    /// How long a confirmed deletion keeps masking sync results.
    pub deleted_grace_ms: u64,
    /// Bucket width used when deduplicating messages during resync.
    pub dedupe_window_ms: i64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            default_model: DEFAULT_MODEL.to_string(),
            default_title: DEFAULT_TITLE.to_string(),
            save_every_tokens: 10,
            progress_interval_ms: 100,
            idle_content_threshold: 10_000,
            deleted_grace_ms: 5_000,
            dedupe_window_ms: 5_000,
        }
    }
}

impl EngineConfig {
    pub fn progress_interval(&self) -> Duration {
        Duration::from_millis(self.progress_interval_ms)
    }

    pub fn deleted_grace(&self) -> Duration {
        Duration::from_millis(self.deleted_grace_ms)
    }
}
