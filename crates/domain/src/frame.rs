//! The WebSocket wire protocol.
//!
//! Outbound frames use the `{type, data}` envelope. Inbound messages are
//! routed by `type`; unknown types are logged and ignored by the
//! connection layer.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Pipeline phase reported through `stage_update` frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProcessingStage {
    /// Resolving the system prompt (stages 1–2).
    ThinkingBefore,
    /// Streaming the main response (stage 3).
    Generating,
    /// Running post-response modules (stages 4–5).
    ThinkingAfter,
}

/// Outbound frame, serialized as `{"type": ..., "data": {...}}`.
#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum Frame {
    SessionStart {
        session_id: String,
    },
    ChatSessionStart {
        chat_session_id: String,
    },
    StageUpdate {
        stage: ProcessingStage,
        message: String,
    },
    Chunk {
        content: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        thinking: Option<String>,
        done: bool,
        /// Present on the final chunk only.
        #[serde(skip_serializing_if = "Option::is_none")]
        metadata: Option<Value>,
    },
    Done {
        metadata: Value,
    },
    PostResponseComplete {
        message: String,
        chat_session_id: String,
    },
    Cancelled {
        message: String,
        session_id: String,
    },
    Error {
        error: String,
        session_id: String,
    },
    Pong,
}

/// Inbound client message.
///
/// Note the asymmetry the protocol fixes: `chat` wraps its payload in
/// `data`, while `cancel` carries the **chat**-session id (not the socket
/// session id) at the top level.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    Chat { data: ChatPayload },
    Cancel { session_id: String },
    Ping,
    #[serde(other)]
    Unknown,
}

/// Upstream provider family selected by the client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ProviderKind {
    #[default]
    Ollama,
    #[serde(rename = "openai")]
    OpenAi,
}

impl std::fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ProviderKind::Ollama => f.write_str("ollama"),
            ProviderKind::OpenAi => f.write_str("openai"),
        }
    }
}

/// Body of an inbound `chat` message.
#[derive(Debug, Clone, Deserialize)]
pub struct ChatPayload {
    pub message: String,
    #[serde(default)]
    pub provider: ProviderKind,
    #[serde(default)]
    pub persona_id: Option<String>,
    #[serde(default)]
    pub conversation_id: Option<String>,
    #[serde(default)]
    pub provider_settings: Value,
    #[serde(default)]
    pub chat_controls: Value,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn frames_use_type_data_envelope() {
        let frame = Frame::SessionStart {
            session_id: "s1".into(),
        };
        assert_eq!(
            serde_json::to_value(&frame).unwrap(),
            json!({"type": "session_start", "data": {"session_id": "s1"}})
        );
    }

    #[test]
    fn pong_has_no_data() {
        assert_eq!(
            serde_json::to_value(Frame::Pong).unwrap(),
            json!({"type": "pong"})
        );
    }

    #[test]
    fn chunk_omits_absent_metadata() {
        let frame = Frame::Chunk {
            content: "hi".into(),
            thinking: None,
            done: false,
            metadata: None,
        };
        let value = serde_json::to_value(&frame).unwrap();
        assert!(value["data"].get("metadata").is_none());
        assert!(value["data"].get("thinking").is_none());
    }

    #[test]
    fn stage_update_uses_wire_names() {
        let frame = Frame::StageUpdate {
            stage: ProcessingStage::ThinkingBefore,
            message: "Resolving system prompt...".into(),
        };
        let value = serde_json::to_value(&frame).unwrap();
        assert_eq!(value["data"]["stage"], "thinking_before");
    }

    #[test]
    fn chat_message_parses_with_defaults() {
        let msg: ClientMessage = serde_json::from_value(json!({
            "type": "chat",
            "data": {"message": "hello"}
        }))
        .unwrap();
        match msg {
            ClientMessage::Chat { data } => {
                assert_eq!(data.message, "hello");
                assert_eq!(data.provider, ProviderKind::Ollama);
                assert!(data.persona_id.is_none());
            }
            other => panic!("unexpected parse: {other:?}"),
        }
    }

    #[test]
    fn cancel_carries_chat_session_id_at_top_level() {
        let msg: ClientMessage = serde_json::from_value(json!({
            "type": "cancel",
            "session_id": "chat-42"
        }))
        .unwrap();
        assert!(matches!(msg, ClientMessage::Cancel { session_id } if session_id == "chat-42"));
    }

    #[test]
    fn unknown_type_is_tolerated() {
        let msg: ClientMessage =
            serde_json::from_value(json!({"type": "telemetry"})).unwrap();
        assert!(matches!(msg, ClientMessage::Unknown));
    }

    #[test]
    fn openai_provider_parses() {
        let payload: ChatPayload = serde_json::from_value(json!({
            "message": "hi",
            "provider": "openai"
        }))
        .unwrap();
        assert_eq!(payload.provider, ProviderKind::OpenAi);
    }
}
