//! In-memory store backend, used by tests and as the fallback when no
//! state directory is configured.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use parking_lot::RwLock;
use uuid::Uuid;

use weft_domain::message::{ConversationMemory, Role, StoredMessage};
use weft_domain::module::{Module, Persona};
use weft_domain::state::{
    ConversationStateRecord, ExecutionMetadata, ExecutionStage, VariableBag,
};
use weft_domain::Result;

use crate::{MemoryStatus, ModuleCatalog, StateStore};

#[derive(Default)]
struct Tables {
    messages: HashMap<Uuid, Vec<StoredMessage>>,
    // Keyed on the (conversation, module, stage) uniqueness tuple.
    states: HashMap<(Uuid, Uuid, ExecutionStage), ConversationStateRecord>,
    memories: HashMap<Uuid, Vec<ConversationMemory>>,
    modules: Vec<Module>,
    personas: HashMap<Uuid, Persona>,
}

/// RwLock-guarded hash-map store. Cloning shares the underlying tables.
#[derive(Clone, Default)]
pub struct MemoryStore {
    tables: Arc<RwLock<Tables>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed a persona (test/CRUD-side helper).
    pub fn insert_persona(&self, persona: Persona) {
        self.tables.write().personas.insert(persona.id, persona);
    }

    /// Seed a module (test/CRUD-side helper).
    pub fn insert_module(&self, module: Module) {
        self.tables.write().modules.push(module);
    }
}

impl StateStore for MemoryStore {
    fn latest_state(&self, conversation: Uuid, module: Uuid) -> Result<Option<VariableBag>> {
        let tables = self.tables.read();
        let latest = [ExecutionStage::Stage4, ExecutionStage::Stage5]
            .iter()
            .filter_map(|stage| tables.states.get(&(conversation, module, *stage)))
            .max_by_key(|record| record.executed_at);
        Ok(latest.map(|record| record.variables.clone()))
    }

    fn upsert_state(
        &self,
        conversation: Uuid,
        module: Uuid,
        stage: ExecutionStage,
        variables: VariableBag,
        metadata: ExecutionMetadata,
    ) -> Result<()> {
        let record = ConversationStateRecord {
            conversation_id: conversation,
            module_id: module,
            stage,
            variables,
            execution_metadata: metadata,
            executed_at: Utc::now(),
        };
        self.tables
            .write()
            .states
            .insert((conversation, module, stage), record);
        Ok(())
    }

    fn messages(
        &self,
        conversation: Uuid,
        offset: usize,
        limit: usize,
    ) -> Result<Vec<StoredMessage>> {
        let tables = self.tables.read();
        Ok(tables
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
        self.tables
            .write()
            .messages
            .entry(conversation)
            .or_default()
            .push(message.clone());
        Ok(message)
    }

    fn message_count(&self, conversation: Uuid) -> Result<usize> {
        Ok(self
            .tables
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
        let mut tables = self.tables.write();
        let list = tables.memories.entry(conversation).or_default();
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
        Ok(memory)
    }

    fn recent_memories(
        &self,
        conversation: Uuid,
        limit: usize,
    ) -> Result<Vec<ConversationMemory>> {
        let tables = self.tables.read();
        Ok(tables
            .memories
            .get(&conversation)
            .map(|list| {
                let skip = list.len().saturating_sub(limit);
                list.iter().skip(skip).cloned().collect()
            })
            .unwrap_or_default())
    }

    fn clear_memories(&self, conversation: Uuid) -> Result<usize> {
        Ok(self
            .tables
            .write()
            .memories
            .remove(&conversation)
            .map_or(0, |list| list.len()))
    }

    fn memory_status(&self, conversation: Uuid) -> Result<MemoryStatus> {
        let tables = self.tables.read();
        let status = tables
            .memories
            .get(&conversation)
            .map(|list| MemoryStatus {
                memory_count: list.len(),
                latest_sequence: list.last().map_or(0, |m| m.sequence),
                messages_compressed: list
                    .iter()
                    .map(|m| range_len(&m.original_message_range))
                    .sum(),
            })
            .unwrap_or_default();
        Ok(status)
    }
}

impl ModuleCatalog for MemoryStore {
    fn persona(&self, id: Uuid) -> Result<Option<Persona>> {
        Ok(self
            .tables
            .read()
            .personas
            .get(&id)
            .filter(|p| p.is_active)
            .cloned())
    }

    fn active_modules_by_name(&self, names: &[String]) -> Result<Vec<Module>> {
        let tables = self.tables.read();
        Ok(tables
            .modules
            .iter()
            .filter(|m| m.is_active && names.iter().any(|n| n == &m.name))
            .cloned()
            .collect())
    }
}

/// Number of messages covered by an `"a-b"` range string.
fn range_len(range: &str) -> u32 {
    range
        .split_once('-')
        .and_then(|(a, b)| {
            let a: u32 = a.trim().parse().ok()?;
            let b: u32 = b.trim().parse().ok()?;
            Some(b.saturating_sub(a) + 1)
        })
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn bag(pairs: &[(&str, serde_json::Value)]) -> VariableBag {
        pairs
            .iter()
            .map(|(k, v)| ((*k).to_owned(), v.clone()))
            .collect()
    }

    fn meta_ok() -> ExecutionMetadata {
        ExecutionMetadata {
            success: true,
            duration_ms: 1,
            error: None,
        }
    }

    #[test]
    fn upsert_overwrites_same_tuple() {
        let store = MemoryStore::new();
        let conv = Uuid::new_v4();
        let module = Uuid::new_v4();

        store
            .upsert_state(conv, module, ExecutionStage::Stage4, bag(&[("n", json!(1))]), meta_ok())
            .unwrap();
        store
            .upsert_state(conv, module, ExecutionStage::Stage4, bag(&[("n", json!(2))]), meta_ok())
            .unwrap();

        let latest = store.latest_state(conv, module).unwrap().unwrap();
        assert_eq!(latest["n"], json!(2));
    }

    #[test]
    fn latest_state_prefers_most_recent_stage() {
        let store = MemoryStore::new();
        let conv = Uuid::new_v4();
        let module = Uuid::new_v4();

        store
            .upsert_state(conv, module, ExecutionStage::Stage4, bag(&[("s", json!("four"))]), meta_ok())
            .unwrap();
        store
            .upsert_state(conv, module, ExecutionStage::Stage5, bag(&[("s", json!("five"))]), meta_ok())
            .unwrap();

        let latest = store.latest_state(conv, module).unwrap().unwrap();
        assert_eq!(latest["s"], json!("five"));
    }

    #[test]
    fn latest_state_none_without_prior_writes() {
        let store = MemoryStore::new();
        assert!(store
            .latest_state(Uuid::new_v4(), Uuid::new_v4())
            .unwrap()
            .is_none());
    }

    #[test]
    fn messages_paginate_in_order() {
        let store = MemoryStore::new();
        let conv = Uuid::new_v4();
        for i in 0..5 {
            store
                .append_message(conv, Role::User, &format!("m{i}"), None)
                .unwrap();
        }
        let page = store.messages(conv, 1, 2).unwrap();
        assert_eq!(page.len(), 2);
        assert_eq!(page[0].content, "m1");
        assert_eq!(page[1].content, "m2");
        assert_eq!(store.message_count(conv).unwrap(), 5);
    }

    #[test]
    fn memory_sequence_is_monotone() {
        let store = MemoryStore::new();
        let conv = Uuid::new_v4();
        let m1 = store.append_memory(conv, "one", "1-10", None, 10).unwrap();
        let m2 = store.append_memory(conv, "two", "11-20", None, 20).unwrap();
        assert_eq!(m1.sequence, 1);
        assert_eq!(m2.sequence, 2);

        let status = store.memory_status(conv).unwrap();
        assert_eq!(status.memory_count, 2);
        assert_eq!(status.latest_sequence, 2);
        assert_eq!(status.messages_compressed, 20);
    }

    #[test]
    fn recent_memories_returns_tail_ascending() {
        let store = MemoryStore::new();
        let conv = Uuid::new_v4();
        for i in 1..=4 {
            store
                .append_memory(conv, &format!("s{i}"), "1-2", None, 2)
                .unwrap();
        }
        let recent = store.recent_memories(conv, 2).unwrap();
        assert_eq!(recent.len(), 2);
        assert_eq!(recent[0].sequence, 3);
        assert_eq!(recent[1].sequence, 4);
    }

    #[test]
    fn clear_memories_counts_removals() {
        let store = MemoryStore::new();
        let conv = Uuid::new_v4();
        store.append_memory(conv, "s", "1-2", None, 2).unwrap();
        assert_eq!(store.clear_memories(conv).unwrap(), 1);
        assert_eq!(store.clear_memories(conv).unwrap(), 0);
    }

    #[test]
    fn catalog_filters_inactive() {
        use weft_domain::module::{ExecutionContext, ModuleKind};

        let store = MemoryStore::new();
        store.insert_module(Module {
            id: Uuid::new_v4(),
            name: "live".into(),
            kind: ModuleKind::Simple,
            execution_context: ExecutionContext::Immediate,
            requires_ai: false,
            trigger_pattern: None,
            content: "x".into(),
            script: String::new(),
            is_active: true,
            persona_id: None,
        });
        store.insert_module(Module {
            id: Uuid::new_v4(),
            name: "dead".into(),
            kind: ModuleKind::Simple,
            execution_context: ExecutionContext::Immediate,
            requires_ai: false,
            trigger_pattern: None,
            content: "x".into(),
            script: String::new(),
            is_active: false,
            persona_id: None,
        });

        let found = store
            .active_modules_by_name(&["live".into(), "dead".into()])
            .unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].name, "live");
    }
}
