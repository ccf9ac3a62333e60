//! Long-term memory plugins: buffer inspection, compression gating, and
//! memory storage/retrieval.
//!
//! A conversation's "buffer" is the run of messages not yet covered by a
//! compressed memory. Post-response modules use these plugins to slice
//! the buffer, summarize it through `ask_ai`, and store the summary.

use serde_json::{json, Value};

use weft_domain::message::ConversationMemory;
use weft_domain::Result;

use super::{PluginArgs, PluginCaps, PluginRegistry};

const DEFAULT_BUFFER_SIZE: usize = 20;
/// Compression never starts before a conversation has this many messages.
const DEFAULT_MIN_MESSAGES: usize = 36;
const DEFAULT_MEMORY_LIMIT: usize = 10;

pub(super) fn register(registry: &PluginRegistry) {
    registry.register("get_buffer_messages", get_buffer_messages);
    registry.register("should_compress_buffer", should_compress_buffer);
    registry.register("store_memory", store_memory);
    registry.register("get_recent_memories", get_recent_memories);
    registry.register("get_memory_status", get_memory_status);
    registry.register("clear_memories", clear_memories);
}

fn memory_json(memory: &ConversationMemory) -> Value {
    json!({
        "sequence": memory.sequence,
        "content": memory.compressed_content,
        "original_message_range": memory.original_message_range,
        "first_message_id": memory.first_message_id,
        "message_count_at_compression": memory.message_count_at_compression,
        "created_at": memory.created_at.to_rfc3339(),
    })
}

/// Messages past the compressed span, oldest first, capped at
/// `buffer_size`.
fn get_buffer_messages(args: &PluginArgs, caps: &PluginCaps) -> Result<Value> {
    let buffer_size = args.usize_or("buffer_size", DEFAULT_BUFFER_SIZE);
    let conversation = caps.conversation()?;
    let compressed = caps.store.memory_status(conversation)?.messages_compressed as usize;
    let messages = caps.store.messages(conversation, compressed, buffer_size)?;
    Ok(Value::Array(
        messages
            .iter()
            .enumerate()
            .map(|(offset, m)| {
                json!({
                    "id": m.id.to_string(),
                    "index": compressed + offset + 1,
                    "role": match m.role {
                        weft_domain::message::Role::User => "user",
                        weft_domain::message::Role::Assistant => "assistant",
                        weft_domain::message::Role::System => "system",
                    },
                    "content": m.content,
                })
            })
            .collect(),
    ))
}

/// True when the uncompressed buffer has filled and the conversation is
/// long enough to be worth compressing.
fn should_compress_buffer(args: &PluginArgs, caps: &PluginCaps) -> Result<Value> {
    let buffer_size = args.usize_or("buffer_size", DEFAULT_BUFFER_SIZE);
    let min_messages = args.usize_or("min_messages", DEFAULT_MIN_MESSAGES);
    let conversation = caps.conversation()?;

    let total = caps.store.message_count(conversation)?;
    let compressed = caps.store.memory_status(conversation)?.messages_compressed as usize;
    let pending = total.saturating_sub(compressed);

    Ok(Value::Bool(total >= min_messages && pending >= buffer_size))
}

/// Store a compressed summary covering messages `start..=end` (1-based).
fn store_memory(args: &PluginArgs, caps: &PluginCaps) -> Result<Value> {
    let summary = args.require_str("summary")?;
    let start = args.require_int("start")?.max(1) as usize;
    let end = args.require_int("end")?.max(1) as usize;
    let conversation = caps.conversation()?;

    let first_message_id = caps
        .store
        .messages(conversation, start - 1, 1)?
        .first()
        .map(|m| m.id.to_string());
    let total = caps.store.message_count(conversation)? as u32;

    let memory = caps.store.append_memory(
        conversation,
        summary,
        &format!("{start}-{end}"),
        first_message_id,
        total,
    )?;
    tracing::info!(
        conversation = %conversation,
        sequence = memory.sequence,
        range = %memory.original_message_range,
        "stored compressed memory"
    );
    Ok(memory_json(&memory))
}

fn get_recent_memories(args: &PluginArgs, caps: &PluginCaps) -> Result<Value> {
    let limit = args.usize_or("limit", DEFAULT_MEMORY_LIMIT);
    let conversation = match caps.conversation_id {
        Some(id) => id,
        None => return Ok(json!([])),
    };
    let memories = caps.store.recent_memories(conversation, limit)?;
    Ok(Value::Array(memories.iter().map(memory_json).collect()))
}

fn get_memory_status(_args: &PluginArgs, caps: &PluginCaps) -> Result<Value> {
    let conversation = caps.conversation()?;
    let status = caps.store.memory_status(conversation)?;
    Ok(json!({
        "memory_count": status.memory_count,
        "latest_sequence": status.latest_sequence,
        "messages_compressed": status.messages_compressed,
    }))
}

fn clear_memories(_args: &PluginArgs, caps: &PluginCaps) -> Result<Value> {
    let conversation = caps.conversation()?;
    let removed = caps.store.clear_memories(conversation)?;
    tracing::info!(conversation = %conversation, removed, "cleared memories");
    Ok(json!(removed))
}
