use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use weft_domain::frame::ProviderKind;
use weft_domain::stream::{BoxStream, ChatOutcome, StreamChunk};
use weft_domain::Result;
use weft_session::CancellationToken;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Request types
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Generation parameters forwarded from the client's `chat_controls`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ChatControls {
    #[serde(default)]
    pub temperature: Option<f32>,
    #[serde(default)]
    pub max_tokens: Option<u32>,
    #[serde(default)]
    pub top_p: Option<f32>,
    /// Forces the reasoning-model dialect regardless of model name.
    #[serde(default)]
    pub reasoning: Option<bool>,
    /// `low` | `medium` | `high`; only sent for reasoning models.
    #[serde(default)]
    pub reasoning_effort: Option<String>,
}

impl ChatControls {
    /// Lenient parse from the raw `chat_controls` object; unknown fields
    /// are ignored, a non-object yields the defaults.
    pub fn from_value(value: &Value) -> Self {
        serde_json::from_value(value.clone()).unwrap_or_default()
    }
}

/// A provider-agnostic chat request for one turn.
#[derive(Debug, Clone, Default)]
pub struct ChatRequest {
    /// Fully resolved system prompt (may be empty).
    pub system_prompt: String,
    /// The user's message for this turn.
    pub user_message: String,
    /// Raw provider settings from the client, parsed per adapter.
    pub settings: Value,
    pub controls: ChatControls,
}

/// A model advertised by a provider's listing endpoint.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ModelInfo {
    pub name: String,
    #[serde(default)]
    pub details: Value,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Core provider trait
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Trait every upstream adapter implements.
///
/// Streaming contract: chunks are yielded in generation order; the token
/// is checked before each yield, and on cancellation the remainder of the
/// upstream body is dropped silently. The final chunk has `done = true`
/// and carries the full response metadata.
#[async_trait::async_trait]
pub trait ChatProvider: Send + Sync {
    fn kind(&self) -> ProviderKind;

    /// Check that `settings` carries the fields this adapter requires.
    fn validate(&self, settings: &Value) -> Result<()>;

    /// One-shot completion.
    async fn send(&self, req: &ChatRequest, token: Arc<CancellationToken>) -> Result<ChatOutcome>;

    /// Streaming completion.
    async fn stream(
        &self,
        req: &ChatRequest,
        token: Arc<CancellationToken>,
    ) -> Result<BoxStream<'static, Result<StreamChunk>>>;

    /// Cheap reachability probe used by the connection-test endpoint.
    async fn test_connection(&self, settings: &Value) -> Result<bool>;

    /// Models the upstream currently serves.
    async fn list_models(&self, settings: &Value) -> Result<Vec<ModelInfo>>;
}
