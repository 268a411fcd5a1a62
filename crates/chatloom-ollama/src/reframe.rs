use chatloom_llm::{DATA_PREFIX, DONE_SENTINEL, LineDecoder};
use serde::Deserialize;
use serde_json::json;

/// Turns NDJSON chat lines into `data:` frames.
///
/// The final `done: true` line carries Ollama's token counts; it is
/// replaced by a usage frame followed by `[DONE]`.
#[derive(Debug, Default)]
pub struct Reframer {
    lines: LineDecoder,
}

#[derive(Debug, Deserialize)]
struct Stats {
    #[serde(default)]
    done: bool,
    prompt_eval_count: Option<u64>,
    eval_count: Option<u64>,
}

impl Reframer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, chunk: &[u8]) -> Vec<u8> {
        let mut out = Vec::new();
        for line in self.lines.push(chunk) {
            frame_line(&line, &mut out);
        }
        out
    }

    pub fn finish(&mut self) -> Vec<u8> {
        let mut out = Vec::new();
        if let Some(line) = self.lines.finish() {
            frame_line(&line, &mut out);
        }
        out
    }
}

fn frame_line(line: &str, out: &mut Vec<u8>) {
    let line = line.trim();
    if line.is_empty() {
        return;
    }

    if let Ok(stats) = serde_json::from_str::<Stats>(line)
        && stats.done
    {
        if let (Some(input), Some(output)) = (stats.prompt_eval_count, stats.eval_count) {
            let usage = json!({
                "type": "usage",
                "usage": { "inputTokens": input, "outputTokens": output },
            });
            push_frame(out, &usage.to_string());
        } else {
            // The last line may still carry text.
            push_frame(out, line);
        }
        push_frame(out, DONE_SENTINEL);
        return;
    }

    push_frame(out, line);
}

fn push_frame(out: &mut Vec<u8>, data: &str) {
    out.extend_from_slice(DATA_PREFIX.as_bytes());
    out.extend_from_slice(data.as_bytes());
    out.push(b'\n');
}

#[cfg(test)]
mod tests {
    use super::Reframer;

    #[test]
    fn lines_become_data_frames_across_chunks() {
        let mut reframer = Reframer::new();
        let mut out = reframer.push(b"{\"message\":{\"content\":\"Hel");
        assert!(out.is_empty());
        out.extend(reframer.push(b"lo\"},\"done\":false}\n{\"message\":{\"content\":\"!\"},\"done\":false}\n"));
        assert_eq!(
            String::from_utf8(out).unwrap(),
            "data: {\"message\":{\"content\":\"Hello\"},\"done\":false}\n\
             data: {\"message\":{\"content\":\"!\"},\"done\":false}\n"
        );
    }

    #[test]
    fn final_stats_become_usage_and_done() {
        let mut reframer = Reframer::new();
        reframer.push(b"\n");
        let out = reframer.push(
            b"{\"message\":{\"content\":\"\"},\"done\":true,\"prompt_eval_count\":12,\"eval_count\":40}",
        );
        assert!(out.is_empty());
        let tail = String::from_utf8(reframer.finish()).unwrap();
        assert_eq!(
            tail,
            "data: {\"type\":\"usage\",\"usage\":{\"inputTokens\":12,\"outputTokens\":40}}\n\
             data: [DONE]\n"
        );
    }
}
