//! The plugin registry: named capability functions callable from scripts.
//!
//! Plugins follow a two-argument convention: `fn(&PluginArgs, &PluginCaps)`.
//! The args bag carries whatever the script passed; the caps record carries
//! the store handle, conversation identifiers, the cancellation token and
//! (for AI stages only) a provider handle. Caps deliberately carry no
//! connection-manager handle — plugins cannot reach the socket.

mod conversation;
mod memory;

use std::collections::HashMap;
use std::sync::{Arc, OnceLock};

use parking_lot::RwLock;
use serde_json::Value;
use uuid::Uuid;

use weft_domain::{Error, Result};
use weft_providers::{ChatControls, ChatProvider, ChatRequest};
use weft_session::CancellationToken;
use weft_store::StateStore;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Capability record & args bag
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Provider access granted to scripts in AI-enabled stages.
#[derive(Clone)]
pub struct AiCapability {
    pub provider: Arc<dyn ChatProvider>,
    pub settings: Value,
    pub controls: ChatControls,
    /// Runtime handle for blocking on provider calls; scripts execute on a
    /// blocking thread.
    pub runtime: tokio::runtime::Handle,
}

/// Everything a plugin may touch, built once per script execution.
#[derive(Clone)]
pub struct PluginCaps {
    pub conversation_id: Option<Uuid>,
    pub persona_id: Option<Uuid>,
    pub store: Arc<dyn StateStore>,
    pub token: Option<Arc<CancellationToken>>,
    /// `None` outside stages 2 and 5.
    pub ai: Option<AiCapability>,
}

impl PluginCaps {
    pub fn conversation(&self) -> Result<Uuid> {
        self.conversation_id
            .ok_or_else(|| Error::Script("no conversation bound to this execution".into()))
    }
}

/// Named arguments a script passed to a plugin call.
#[derive(Debug, Clone, Default)]
pub struct PluginArgs(pub serde_json::Map<String, Value>);

impl PluginArgs {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, name: &str, value: Value) -> Self {
        self.0.insert(name.to_owned(), value);
        self
    }

    pub fn str(&self, name: &str) -> Option<&str> {
        self.0.get(name).and_then(Value::as_str)
    }

    pub fn int(&self, name: &str) -> Option<i64> {
        self.0.get(name).and_then(Value::as_i64)
    }

    pub fn usize_or(&self, name: &str, default: usize) -> usize {
        self.int(name).map(|v| v.max(0) as usize).unwrap_or(default)
    }

    pub fn require_str(&self, name: &str) -> Result<&str> {
        self.str(name)
            .ok_or_else(|| Error::Script(format!("missing required argument '{name}'")))
    }

    pub fn require_int(&self, name: &str) -> Result<i64> {
        self.int(name)
            .ok_or_else(|| Error::Script(format!("missing required argument '{name}'")))
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Registry
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub type PluginFn = Arc<dyn Fn(&PluginArgs, &PluginCaps) -> Result<Value> + Send + Sync>;

/// Process-global name → function map. The built-in set is loaded eagerly
/// on first use; the map is effectively immutable afterwards.
pub struct PluginRegistry {
    functions: RwLock<HashMap<String, PluginFn>>,
}

static GLOBAL: OnceLock<PluginRegistry> = OnceLock::new();

impl PluginRegistry {
    /// The process-global registry, with built-ins loaded.
    pub fn global() -> &'static PluginRegistry {
        GLOBAL.get_or_init(|| {
            let registry = PluginRegistry {
                functions: RwLock::new(HashMap::new()),
            };
            registry.load_builtins();
            registry
        })
    }

    pub fn register<F>(&self, name: &str, func: F)
    where
        F: Fn(&PluginArgs, &PluginCaps) -> Result<Value> + Send + Sync + 'static,
    {
        self.functions
            .write()
            .insert(name.to_owned(), Arc::new(func));
    }

    pub fn get(&self, name: &str) -> Option<PluginFn> {
        self.functions.read().get(name).cloned()
    }

    pub fn has(&self, name: &str) -> bool {
        self.functions.read().contains_key(name)
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.functions.read().keys().cloned().collect();
        names.sort();
        names
    }

    /// Invoke a plugin by name with the caps threaded in.
    pub fn call(&self, name: &str, args: &PluginArgs, caps: &PluginCaps) -> Result<Value> {
        let func = self
            .get(name)
            .ok_or_else(|| Error::Script(format!("unknown plugin function '{name}'")))?;
        func(args, caps).map_err(|e| {
            tracing::warn!(plugin = name, error = %e, "plugin call failed");
            e
        })
    }

    fn load_builtins(&self) {
        conversation::register(self);
        memory::register(self);
        self.register("ask_ai", ask_ai);
        self.register("is_cancelled", is_cancelled);
        tracing::debug!(count = self.functions.read().len(), "built-in plugins loaded");
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Cross-cutting built-ins
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// One-shot AI call with the turn's live provider settings. Only available
/// in AI-enabled stages (2 and 5).
fn ask_ai(args: &PluginArgs, caps: &PluginCaps) -> Result<Value> {
    let prompt = args.require_str("prompt")?;
    let ai = caps
        .ai
        .as_ref()
        .ok_or_else(|| Error::Script("ask_ai is not available in this stage".into()))?;

    if let Some(token) = &caps.token {
        token.check()?;
    }
    let token = caps
        .token
        .clone()
        .unwrap_or_else(|| Arc::new(CancellationToken::new("ask-ai", None)));

    let request = ChatRequest {
        system_prompt: String::new(),
        user_message: prompt.to_owned(),
        settings: ai.settings.clone(),
        controls: ai.controls.clone(),
    };
    let provider = Arc::clone(&ai.provider);
    let outcome = ai
        .runtime
        .block_on(async move { provider.send(&request, token).await })?;
    Ok(Value::String(outcome.content))
}

/// Cooperative cancellation probe for long-running scripts.
fn is_cancelled(_args: &PluginArgs, caps: &PluginCaps) -> Result<Value> {
    Ok(Value::Bool(
        caps.token.as_ref().is_some_and(|t| t.is_cancelled()),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use weft_store::MemoryStore;

    fn caps() -> PluginCaps {
        PluginCaps {
            conversation_id: Some(Uuid::new_v4()),
            persona_id: None,
            store: Arc::new(MemoryStore::new()),
            token: None,
            ai: None,
        }
    }

    #[test]
    fn global_registry_has_builtins() {
        let registry = PluginRegistry::global();
        for name in [
            "get_message_count",
            "get_recent_messages",
            "get_message_range",
            "get_conversation_summary",
            "get_buffer_messages",
            "should_compress_buffer",
            "store_memory",
            "get_recent_memories",
            "get_memory_status",
            "clear_memories",
            "ask_ai",
            "is_cancelled",
        ] {
            assert!(registry.has(name), "missing builtin plugin {name}");
        }
    }

    #[test]
    fn unknown_plugin_errors() {
        let err = PluginRegistry::global()
            .call("nope", &PluginArgs::new(), &caps())
            .unwrap_err();
        assert!(err.to_string().contains("unknown plugin"));
    }

    #[test]
    fn ask_ai_requires_ai_capability() {
        let args = PluginArgs::new().with("prompt", Value::String("hi".into()));
        let err = PluginRegistry::global()
            .call("ask_ai", &args, &caps())
            .unwrap_err();
        assert!(err.to_string().contains("not available"));
    }

    #[test]
    fn is_cancelled_reflects_token() {
        let mut c = caps();
        assert_eq!(
            PluginRegistry::global()
                .call("is_cancelled", &PluginArgs::new(), &c)
                .unwrap(),
            Value::Bool(false)
        );

        let token = Arc::new(CancellationToken::new("s", None));
        token.activate();
        token.cancel();
        c.token = Some(token);
        assert_eq!(
            PluginRegistry::global()
                .call("is_cancelled", &PluginArgs::new(), &c)
                .unwrap(),
            Value::Bool(true)
        );
    }

    #[test]
    fn custom_registration_is_callable() {
        let registry = PluginRegistry::global();
        registry.register("echo_test_plugin", |args, _caps| {
            Ok(Value::String(args.require_str("text")?.to_owned()))
        });
        let out = registry
            .call(
                "echo_test_plugin",
                &PluginArgs::new().with("text", Value::String("ping".into())),
                &caps(),
            )
            .unwrap();
        assert_eq!(out, Value::String("ping".into()));
    }
}
