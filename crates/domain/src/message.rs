//! Conversation messages.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Speaker role for a conversation message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    User,
    Assistant,
    System,
}

/// One message in a conversation's append-only history.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredMessage {
    pub id: Uuid,
    pub conversation_id: Uuid,
    pub role: Role,
    pub content: String,
    /// Reasoning trace attached to assistant messages, when the model
    /// produced one.
    #[serde(default)]
    pub thinking: Option<String>,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub token_count: Option<u32>,
}

/// A compressed summary covering a contiguous range of earlier messages.
///
/// Memories are append-only and ordered by a monotone `sequence` assigned
/// by the store; the whole list may be cleared wholesale.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConversationMemory {
    pub id: Uuid,
    pub conversation_id: Uuid,
    pub sequence: u32,
    pub compressed_content: String,
    /// The original message-index range this memory replaces, e.g. `"25-35"`.
    pub original_message_range: String,
    /// Id of the first message covered by this memory.
    #[serde(default)]
    pub first_message_id: Option<String>,
    /// Total message count at the time of compression.
    pub message_count_at_compression: u32,
    pub created_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn role_serializes_snake_case() {
        assert_eq!(serde_json::to_string(&Role::User).unwrap(), "\"user\"");
        assert_eq!(
            serde_json::to_string(&Role::Assistant).unwrap(),
            "\"assistant\""
        );
    }
}
