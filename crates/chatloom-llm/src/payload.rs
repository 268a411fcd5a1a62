//! Classification of `data:` payloads.
//!
//! Backends and local providers do not agree on a schema, so a payload is
//! read leniently and matched against every shape we know about.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Authoritative token counts reported by the server.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TokenUsage {
    #[serde(default)]
    pub input_tokens: u64,
    #[serde(default)]
    pub output_tokens: u64,
}

impl TokenUsage {
    pub fn total(&self) -> u64 {
        self.input_tokens + self.output_tokens
    }
}

/// Quota change attached to a usage frame.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BatteryDelta {
    #[serde(default)]
    pub new_balance: f64,
    #[serde(default)]
    pub battery_used: f64,
}

/// Side-channel instruction to fetch and store a generated image.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageGenerationRequest {
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub base64: Option<String>,
    #[serde(default)]
    pub model: String,
    #[serde(default)]
    pub prompt: String,
}

/// What a single `data:` payload means for the transcript.
#[derive(Debug, Clone, PartialEq)]
pub enum Payload {
    /// Token accounting. Never displayed.
    Usage {
        usage: TokenUsage,
        battery: Option<BatteryDelta>,
    },
    /// An incremental piece of assistant text.
    Text(String),
    /// A content delta that was actually image-generation metadata.
    ImageGeneration(ImageGenerationRequest),
    /// Legacy inline image: replaces everything accumulated so far.
    InlineImage { base64: String },
    /// Valid JSON in a shape we do not know. Contributes nothing.
    Unrecognized,
}

// ---------------------------------------------------------------------------
// Wire shapes
// ---------------------------------------------------------------------------

#[derive(Debug, Default, Deserialize)]
struct RawPayload {
    #[serde(rename = "type")]
    kind: Option<String>,
    usage: Option<TokenUsage>,
    battery: Option<BatteryDelta>,
    content: Option<Value>,
    choices: Option<Vec<RawChoice>>,
    message: Option<RawMessage>,
    done: Option<bool>,
    response: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RawChoice {
    delta: Option<RawDelta>,
}

#[derive(Debug, Deserialize)]
struct RawDelta {
    content: Option<Value>,
    image_data: Option<RawImageData>,
}

#[derive(Debug, Deserialize)]
struct RawImageData {
    #[serde(rename = "type")]
    kind: Option<String>,
    data: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RawMessage {
    content: Option<Value>,
}

#[derive(Debug, Deserialize)]
struct EmbeddedMarker {
    #[serde(rename = "type")]
    kind: String,
}

/// Classify one frame payload. Only malformed JSON is an error.
pub fn classify(data: &str) -> Result<Payload, serde_json::Error> {
    let raw: RawPayload = serde_json::from_str(data)?;

    if raw.kind.as_deref() == Some("usage")
        && let Some(usage) = raw.usage
    {
        return Ok(Payload::Usage {
            usage,
            battery: raw.battery,
        });
    }

    if let Some(text) = non_empty_str(raw.content.as_ref()) {
        return Ok(Payload::Text(text.to_string()));
    }

    let delta = raw
        .choices
        .as_ref()
        .and_then(|choices| choices.first())
        .and_then(|choice| choice.delta.as_ref());

    if let Some(delta) = delta {
        if let Some(text) = non_empty_str(delta.content.as_ref()) {
            if let Some(request) = embedded_image_request(text) {
                return Ok(Payload::ImageGeneration(request));
            }
            return Ok(Payload::Text(text.to_string()));
        }

        if let Some(image) = &delta.image_data {
            return Ok(match (image.kind.as_deref(), image.data.as_deref()) {
                (Some("base64"), Some(data)) if !data.is_empty() => Payload::InlineImage {
                    base64: data.to_string(),
                },
                _ => Payload::Unrecognized,
            });
        }
    }

    // Ollama chat format.
    if let Some(text) = non_empty_str(raw.message.as_ref().and_then(|m| m.content.as_ref())) {
        return Ok(Payload::Text(text.to_string()));
    }

    // Ollama generate format.
    if raw.done == Some(false)
        && let Some(response) = raw.response.filter(|r| !r.is_empty())
    {
        return Ok(Payload::Text(response));
    }

    Ok(Payload::Unrecognized)
}

fn non_empty_str(value: Option<&Value>) -> Option<&str> {
    value.and_then(Value::as_str).filter(|s| !s.is_empty())
}

fn embedded_image_request(text: &str) -> Option<ImageGenerationRequest> {
    let trimmed = text.trim_start();
    if !trimmed.starts_with('{') {
        return None;
    }
    let marker: EmbeddedMarker = serde_json::from_str(trimmed).ok()?;
    if marker.kind != "image_generation" {
        return None;
    }
    serde_json::from_str(trimmed).ok()
}
