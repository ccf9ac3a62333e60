//! Durable per-conversation module state.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// Free-form script output variables keyed by name.
pub type VariableBag = serde_json::Map<String, Value>;

/// Which post-response stage produced a state record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStage {
    Stage4,
    Stage5,
}

impl std::fmt::Display for ExecutionStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ExecutionStage::Stage4 => f.write_str("stage4"),
            ExecutionStage::Stage5 => f.write_str("stage5"),
        }
    }
}

/// Outcome metadata recorded alongside a state upsert.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionMetadata {
    pub success: bool,
    pub duration_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// One (conversation, module, stage) state record. The store keeps exactly
/// one per tuple; the latest execution overwrites prior state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConversationStateRecord {
    pub conversation_id: Uuid,
    pub module_id: Uuid,
    pub stage: ExecutionStage,
    pub variables: VariableBag,
    pub execution_metadata: ExecutionMetadata,
    pub executed_at: DateTime<Utc>,
}
