//! Durable per-conversation state: message history, module state bags,
//! and long-term memory, behind a backend-agnostic interface.
//!
//! The pipeline never inspects the physical representation. Uniqueness on
//! (conversation, module, stage) is a store-level invariant.

pub mod file;
pub mod memory;

use serde::Serialize;
use uuid::Uuid;

use weft_domain::message::{ConversationMemory, Role, StoredMessage};
use weft_domain::module::{Module, Persona};
use weft_domain::state::{ExecutionMetadata, ExecutionStage, VariableBag};
use weft_domain::Result;

pub use file::FileStore;
pub use memory::MemoryStore;

/// Aggregate view of a conversation's memory compression.
#[derive(Debug, Clone, Serialize, Default)]
pub struct MemoryStatus {
    pub memory_count: usize,
    pub latest_sequence: u32,
    /// Number of original messages covered by compressed memories.
    pub messages_compressed: u32,
}

/// Interface the resolution pipeline consumes for durable state.
pub trait StateStore: Send + Sync {
    /// Latest state bag for a (conversation, module) pair, regardless of
    /// which post-response stage wrote it most recently.
    fn latest_state(&self, conversation: Uuid, module: Uuid) -> Result<Option<VariableBag>>;

    /// Write-or-overwrite the state for (conversation, module, stage).
    fn upsert_state(
        &self,
        conversation: Uuid,
        module: Uuid,
        stage: ExecutionStage,
        variables: VariableBag,
        metadata: ExecutionMetadata,
    ) -> Result<()>;

    /// Page of conversation messages in chronological order.
    fn messages(&self, conversation: Uuid, offset: usize, limit: usize)
        -> Result<Vec<StoredMessage>>;

    /// Append a message; creates the conversation on first write.
    fn append_message(
        &self,
        conversation: Uuid,
        role: Role,
        content: &str,
        thinking: Option<String>,
    ) -> Result<StoredMessage>;

    fn message_count(&self, conversation: Uuid) -> Result<usize>;

    /// Append a compressed memory. The store assigns the next monotone
    /// sequence number.
    fn append_memory(
        &self,
        conversation: Uuid,
        summary: &str,
        original_message_range: &str,
        first_message_id: Option<String>,
        message_count_at_compression: u32,
    ) -> Result<ConversationMemory>;

    /// The most recent `limit` memories, in ascending sequence order.
    fn recent_memories(&self, conversation: Uuid, limit: usize)
        -> Result<Vec<ConversationMemory>>;

    /// Remove all memories for a conversation, returning how many.
    fn clear_memories(&self, conversation: Uuid) -> Result<usize>;

    fn memory_status(&self, conversation: Uuid) -> Result<MemoryStatus>;
}

/// Read-only access to the module/persona catalog. Mutation happens only
/// through the CRUD surface, outside the pipeline.
pub trait ModuleCatalog: Send + Sync {
    fn persona(&self, id: Uuid) -> Result<Option<Persona>>;

    /// Active modules whose names appear in `names`, in catalog order.
    fn active_modules_by_name(&self, names: &[String]) -> Result<Vec<Module>>;
}
