//! JSON-file store backend.
//!
//! Persists each concern in its own file under the configured state
//! directory (`messages.json`, `states.json`, `memories.json`,
//! `modules.json`, `personas.json`). Loaded once at startup, flushed
//! after every mutation.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use chrono::Utc;
use parking_lot::RwLock;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use uuid::Uuid;

use weft_domain::message::{ConversationMemory, Role, StoredMessage};
use weft_domain::module::{Module, Persona};
use weft_domain::state::{
    ConversationStateRecord, ExecutionMetadata, ExecutionStage, VariableBag,
};
use weft_domain::{Error, Result};

use crate::{MemoryStatus, ModuleCatalog, StateStore};

#[derive(Default, Serialize, Deserialize)]
struct Durable {
    #[serde(default)]
    messages: HashMap<Uuid, Vec<StoredMessage>>,
    /// Flat list; the (conversation, module, stage) key is inside each record.
    #[serde(default)]
    states: Vec<ConversationStateRecord>,
    #[serde(default)]
    memories: HashMap<Uuid, Vec<ConversationMemory>>,
}

/// File-backed store for conversations, module state and memories, plus a
/// read-only module/persona catalog loaded from the same directory.
pub struct FileStore {
    dir: PathBuf,
    durable: RwLock<Durable>,
    modules: Vec<Module>,
    personas: HashMap<Uuid, Persona>,
}

impl FileStore {
    /// Load or create the store under `dir`.
    pub fn open(dir: &Path) -> Result<Self> {
        std::fs::create_dir_all(dir)?;

        let durable = Durable {
            messages: load_json(&dir.join("messages.json"))?,
            states: load_json(&dir.join("states.json"))?,
            memories: load_json(&dir.join("memories.json"))?,
        };
        let modules: Vec<Module> = load_json(&dir.join("modules.json"))?;
        let personas_list: Vec<Persona> = load_json(&dir.join("personas.json"))?;
        let personas = personas_list.into_iter().map(|p| (p.id, p)).collect();

        tracing::info!(
            path = %dir.display(),
            modules = modules.len(),
            "file store loaded"
        );

        Ok(Self {
            dir: dir.to_path_buf(),
            durable: RwLock::new(durable),
            modules,
            personas,
        })
    }

    fn flush(&self) -> Result<()> {
        let durable = self.durable.read();
        write_json(&self.dir.join("messages.json"), &durable.messages)?;
        write_json(&self.dir.join("states.json"), &durable.states)?;
        write_json(&self.dir.join("memories.json"), &durable.memories)?;
        Ok(())
    }
}

fn load_json<T: DeserializeOwned + Default>(path: &Path) -> Result<T> {
    if !path.exists() {
        return Ok(T::default());
    }
    let raw = std::fs::read_to_string(path)?;
    serde_json::from_str(&raw)
        .map_err(|e| Error::Store(format!("corrupt store file {}: {e}", path.display())))
}

fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let json = serde_json::to_string_pretty(value)
        .map_err(|e| Error::Store(format!("serializing {}: {e}", path.display())))?;
    std::fs::write(path, json)?;
    Ok(())
}

impl StateStore for FileStore {
    fn latest_state(&self, conversation: Uuid, module: Uuid) -> Result<Option<VariableBag>> {
        let durable = self.durable.read();
        Ok(durable
            .states
            .iter()
            .filter(|r| r.conversation_id == conversation && r.module_id == module)
            .max_by_key(|r| r.executed_at)
            .map(|r| r.variables.clone()))
    }

    fn upsert_state(
        &self,
        conversation: Uuid,
        module: Uuid,
        stage: ExecutionStage,
        variables: VariableBag,
        metadata: ExecutionMetadata,
    ) -> Result<()> {
        {
            let mut durable = self.durable.write();
            durable.states.retain(|r| {
                !(r.conversation_id == conversation
                    && r.module_id == module
                    && r.stage == stage)
            });
            durable.states.push(ConversationStateRecord {
                conversation_id: conversation,
                module_id: module,
                stage,
                variables,
                execution_metadata: metadata,
                executed_at: Utc::now(),
            });
        }
        self.flush()
    }

    fn messages(
        &self,
        conversation: Uuid,
        offset: usize,
        limit: usize,
    ) -> Result<Vec<StoredMessage>> {
        let durable = self.durable.read();
        Ok(durable
            .messages
            .get(&conversation)
            .map(|all| all.iter().skip(offset).take(limit).cloned().collect())
            .unwrap_or_default())
    }

    fn append_message(
        &self,
        conversation: Uuid,
        role: Role,
        content: &str,
        thinking: Option<String>,
    ) -> Result<StoredMessage> {
        let message = StoredMessage {
            id: Uuid::new_v4(),
            conversation_id: conversation,
            role,
            content: content.to_owned(),
            thinking,
            created_at: Utc::now(),
            token_count: None,
        };
        self.durable
            .write()
            .messages
            .entry(conversation)
            .or_default()
            .push(message.clone());
        self.flush()?;
        Ok(message)
    }

    fn message_count(&self, conversation: Uuid) -> Result<usize> {
        Ok(self
            .durable
            .read()
            .messages
            .get(&conversation)
            .map_or(0, Vec::len))
    }

    fn append_memory(
        &self,
        conversation: Uuid,
        summary: &str,
        original_message_range: &str,
        first_message_id: Option<String>,
        message_count_at_compression: u32,
    ) -> Result<ConversationMemory> {
        let memory = {
            let mut durable = self.durable.write();
            let list = durable.memories.entry(conversation).or_default();
            let sequence = list.last().map_or(1, |m| m.sequence + 1);
            let memory = ConversationMemory {
                id: Uuid::new_v4(),
                conversation_id: conversation,
                sequence,
                compressed_content: summary.to_owned(),
                original_message_range: original_message_range.to_owned(),
                first_message_id,
                message_count_at_compression,
                created_at: Utc::now(),
            };
            list.push(memory.clone());
            memory
        };
        self.flush()?;
        Ok(memory)
    }

    fn recent_memories(
        &self,
        conversation: Uuid,
        limit: usize,
    ) -> Result<Vec<ConversationMemory>> {
        let durable = self.durable.read();
        Ok(durable
            .memories
            .get(&conversation)
            .map(|list| {
                let skip = list.len().saturating_sub(limit);
                list.iter().skip(skip).cloned().collect()
            })
            .unwrap_or_default())
    }

    fn clear_memories(&self, conversation: Uuid) -> Result<usize> {
        let removed = self
            .durable
            .write()
            .memories
            .remove(&conversation)
            .map_or(0, |list| list.len());
        if removed > 0 {
            self.flush()?;
        }
        Ok(removed)
    }

    fn memory_status(&self, conversation: Uuid) -> Result<MemoryStatus> {
        let durable = self.durable.read();
        Ok(durable
            .memories
            .get(&conversation)
            .map(|list| MemoryStatus {
                memory_count: list.len(),
                latest_sequence: list.last().map_or(0, |m| m.sequence),
                messages_compressed: list
                    .iter()
                    .map(|m| {
                        m.original_message_range
                            .split_once('-')
                            .and_then(|(a, b)| {
                                let a: u32 = a.trim().parse().ok()?;
                                let b: u32 = b.trim().parse().ok()?;
                                Some(b.saturating_sub(a) + 1)
                            })
                            .unwrap_or(0)
                    })
                    .sum(),
            })
            .unwrap_or_default())
    }
}

impl ModuleCatalog for FileStore {
    fn persona(&self, id: Uuid) -> Result<Option<Persona>> {
        Ok(self.personas.get(&id).filter(|p| p.is_active).cloned())
    }

    fn active_modules_by_name(&self, names: &[String]) -> Result<Vec<Module>> {
        Ok(self
            .modules
            .iter()
            .filter(|m| m.is_active && names.iter().any(|n| n == &m.name))
            .cloned()
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn meta_ok() -> ExecutionMetadata {
        ExecutionMetadata {
            success: true,
            duration_ms: 1,
            error: None,
        }
    }

    #[test]
    fn round_trips_across_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let conv = Uuid::new_v4();
        let module = Uuid::new_v4();

        {
            let store = FileStore::open(dir.path()).unwrap();
            store
                .append_message(conv, Role::User, "hello", None)
                .unwrap();
            let mut bag = VariableBag::new();
            bag.insert("n".into(), json!(7));
            store
                .upsert_state(conv, module, ExecutionStage::Stage4, bag, meta_ok())
                .unwrap();
            store.append_memory(conv, "summary", "1-3", None, 3).unwrap();
        }

        let store = FileStore::open(dir.path()).unwrap();
        assert_eq!(store.message_count(conv).unwrap(), 1);
        let state = store.latest_state(conv, module).unwrap().unwrap();
        assert_eq!(state["n"], json!(7));
        let memories = store.recent_memories(conv, 10).unwrap();
        assert_eq!(memories.len(), 1);
        assert_eq!(memories[0].sequence, 1);
    }

    #[test]
    fn upsert_keeps_one_record_per_tuple() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStore::open(dir.path()).unwrap();
        let conv = Uuid::new_v4();
        let module = Uuid::new_v4();

        for n in 1..=3 {
            let mut bag = VariableBag::new();
            bag.insert("n".into(), json!(n));
            store
                .upsert_state(conv, module, ExecutionStage::Stage4, bag, meta_ok())
                .unwrap();
        }

        assert_eq!(store.durable.read().states.len(), 1);
        assert_eq!(
            store.latest_state(conv, module).unwrap().unwrap()["n"],
            json!(3)
        );
    }

    #[test]
    fn missing_directory_is_created() {
        let dir = tempfile::tempdir().unwrap();
        let nested = dir.path().join("a/b");
        let store = FileStore::open(&nested).unwrap();
        assert_eq!(store.message_count(Uuid::new_v4()).unwrap(), 0);
    }
}
