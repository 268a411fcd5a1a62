use crate::error::Error;
use crate::request::ChatRequest;
use futures::Stream;
use std::pin::Pin;
use tokio_stream::StreamExt;

/// The raw response body of a streaming chat request.
///
/// Items are byte chunks exactly as they came off the wire; chunk boundaries
/// carry no meaning. A failed request (connection error or non-2xx status)
/// surfaces as an `Err` item, normally the first one.
pub struct ByteStream {
    inner: Pin<Box<dyn Stream<Item = Result<Vec<u8>, Error>> + Send>>,
}

impl ByteStream {
    pub fn new(stream: impl Stream<Item = Result<Vec<u8>, Error>> + Send + 'static) -> Self {
        Self {
            inner: Box::pin(stream),
        }
    }

    /// A stream that yields the given chunks and then ends.
    pub fn from_chunks(chunks: Vec<Vec<u8>>) -> Self {
        Self::new(tokio_stream::iter(chunks.into_iter().map(Ok)))
    }

    /// A stream whose only item is the given error.
    pub fn failed(error: Error) -> Self {
        Self::new(tokio_stream::once(Err(error)))
    }

    /// Next chunk, or `None` once the body is exhausted.
    pub async fn next(&mut self) -> Option<Result<Vec<u8>, Error>> {
        self.inner.next().await
    }
}

/// Something that can open a streaming chat request.
///
/// Implementations return the body lazily: no network I/O happens until the
/// stream is first polled, and dropping it cancels the request.
#[async_trait::async_trait]
pub trait ChatTransport: Send + Sync {
    /// Short name for logs (e.g. `"backend"`, `"ollama"`).
    fn name(&self) -> &str;

    /// Whether the endpoint is reachable right now.
    async fn is_available(&self) -> bool {
        true
    }

    /// Open a streaming request. The body is `\n`-delimited `data: <json>` frames.
    fn stream_chat(&self, request: ChatRequest) -> ByteStream;
}
