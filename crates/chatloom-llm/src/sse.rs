//! Line framing for `data: <json>` event streams.
//!
//! Network chunks can end anywhere, including in the middle of a UTF-8
//! sequence, so bytes are buffered and only complete lines are decoded.

pub const DATA_PREFIX: &str = "data: ";
pub const DONE_SENTINEL: &str = "[DONE]";

/// Splits a chunked byte stream into complete lines.
#[derive(Debug, Default)]
pub struct LineDecoder {
    buffer: Vec<u8>,
}

impl LineDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed a chunk and return every line it completed, without the `\n`.
    /// The trailing partial line stays buffered.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        self.buffer.extend_from_slice(chunk);

        let mut lines = Vec::new();
        let mut start = 0;
        while let Some(offset) = self.buffer[start..].iter().position(|&b| b == b'\n') {
            let end = start + offset;
            lines.push(String::from_utf8_lossy(&self.buffer[start..end]).into_owned());
            start = end + 1;
        }
        self.buffer.drain(..start);
        lines
    }

    /// Take whatever partial line is left once the stream has ended.
    pub fn finish(&mut self) -> Option<String> {
        if self.buffer.is_empty() {
            return None;
        }
        let rest = std::mem::take(&mut self.buffer);
        Some(String::from_utf8_lossy(&rest).into_owned())
    }

    /// Number of bytes waiting for a line terminator.
    pub fn pending(&self) -> usize {
        self.buffer.len()
    }
}

/// The payload of a `data: ` line, trimmed. Blank payloads, the `[DONE]`
/// sentinel, and lines that are not data frames yield `None`.
pub fn frame_data(line: &str) -> Option<&str> {
    let data = line.strip_prefix(DATA_PREFIX)?.trim();
    if data.is_empty() || data == DONE_SENTINEL {
        return None;
    }
    Some(data)
}
