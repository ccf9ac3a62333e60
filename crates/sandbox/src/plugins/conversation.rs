//! Conversation-inspection plugins: message counts, recent history,
//! ranges, and summaries.

use serde_json::{json, Value};

use weft_domain::message::{Role, StoredMessage};
use weft_domain::Result;

use super::{PluginArgs, PluginCaps, PluginRegistry};

const DEFAULT_RECENT_LIMIT: usize = 10;

pub(super) fn register(registry: &PluginRegistry) {
    registry.register("get_message_count", get_message_count);
    registry.register("get_recent_messages", get_recent_messages);
    registry.register("get_message_range", get_message_range);
    registry.register("get_conversation_summary", get_conversation_summary);
}

fn role_str(role: Role) -> &'static str {
    match role {
        Role::User => "user",
        Role::Assistant => "assistant",
        Role::System => "system",
    }
}

fn message_json(message: &StoredMessage) -> Value {
    json!({
        "id": message.id.to_string(),
        "role": role_str(message.role),
        "content": message.content,
        "timestamp": message.created_at.to_rfc3339(),
    })
}

fn get_message_count(_args: &PluginArgs, caps: &PluginCaps) -> Result<Value> {
    let conversation = match caps.conversation_id {
        Some(id) => id,
        None => return Ok(json!(0)),
    };
    Ok(json!(caps.store.message_count(conversation)?))
}

fn get_recent_messages(args: &PluginArgs, caps: &PluginCaps) -> Result<Value> {
    let limit = args.usize_or("limit", DEFAULT_RECENT_LIMIT);
    let conversation = match caps.conversation_id {
        Some(id) => id,
        None => return Ok(json!([])),
    };
    let total = caps.store.message_count(conversation)?;
    let offset = total.saturating_sub(limit);
    let messages = caps.store.messages(conversation, offset, limit)?;
    Ok(Value::Array(messages.iter().map(message_json).collect()))
}

/// Fetch messages by 1-based inclusive index range.
fn get_message_range(args: &PluginArgs, caps: &PluginCaps) -> Result<Value> {
    let start = args.require_int("start")?.max(1) as usize;
    let end = args.require_int("end")?.max(0) as usize;
    let conversation = caps.conversation()?;
    if end < start {
        return Ok(json!([]));
    }
    let messages = caps
        .store
        .messages(conversation, start - 1, end - start + 1)?;
    Ok(Value::Array(messages.iter().map(message_json).collect()))
}

fn get_conversation_summary(_args: &PluginArgs, caps: &PluginCaps) -> Result<Value> {
    let conversation = match caps.conversation_id {
        Some(id) => id,
        None => return Ok(json!({"message_count": 0})),
    };
    let total = caps.store.message_count(conversation)?;
    let messages = caps.store.messages(conversation, 0, total)?;

    let user_messages = messages.iter().filter(|m| m.role == Role::User).count();
    let assistant_messages = messages
        .iter()
        .filter(|m| m.role == Role::Assistant)
        .count();

    Ok(json!({
        "message_count": total,
        "user_messages": user_messages,
        "assistant_messages": assistant_messages,
        "first_message_at": messages.first().map(|m| m.created_at.to_rfc3339()),
        "last_message_at": messages.last().map(|m| m.created_at.to_rfc3339()),
    }))
}
