//! Upstream LLM provider adapters.
//!
//! One uniform [`ChatProvider`] interface hides the two wire dialects:
//! the chat-completion style (SSE `data:` lines, `choices[].delta`) and
//! the generate style (newline-delimited JSON, top-level `done`).

pub mod ollama;
pub mod openai;
pub mod registry;
pub mod traits;
pub(crate) mod lines;
pub(crate) mod util;

pub use registry::ProviderRegistry;
pub use traits::{ChatControls, ChatProvider, ChatRequest, ModelInfo};
