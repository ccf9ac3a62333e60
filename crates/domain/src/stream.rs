use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::pin::Pin;

/// A boxed async stream, used for LLM streaming responses.
pub type BoxStream<'a, T> = Pin<Box<dyn futures_core::Stream<Item = T> + Send + 'a>>;

/// One streamed fragment of a completion.
///
/// Intermediate chunks carry incremental `content`/`thinking`; the final
/// chunk has `done = true` and carries the full response metadata.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct StreamChunk {
    #[serde(default)]
    pub content: String,
    #[serde(default)]
    pub thinking: Option<String>,
    #[serde(default)]
    pub done: bool,
    #[serde(default)]
    pub metadata: Option<Value>,
}

/// A complete (non-streaming) completion result.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatOutcome {
    pub content: String,
    pub model: String,
    pub provider: String,
    #[serde(default)]
    pub metadata: Value,
    #[serde(default)]
    pub thinking: Option<String>,
}
