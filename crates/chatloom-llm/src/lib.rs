pub mod error;
pub mod payload;
pub mod request;
pub mod sse;
pub mod transport;

pub use error::Error;
pub use payload::{BatteryDelta, ImageGenerationRequest, Payload, TokenUsage, classify};
pub use request::{ChatMessage, ChatOptions, ChatRequest, Role};
pub use sse::{DATA_PREFIX, DONE_SENTINEL, LineDecoder, frame_data};
pub use transport::{ByteStream, ChatTransport};
