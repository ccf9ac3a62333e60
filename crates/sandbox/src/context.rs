//! The execution context scripts see as `ctx`.
//!
//! A cheap clone-able handle over shared interior state: conversation and
//! persona identifiers, the turn's live provider settings, user variables,
//! the plugin capability record, and the reflection-safety bookkeeping.

use std::sync::Arc;

use parking_lot::Mutex;
use serde_json::Value;
use uuid::Uuid;

use weft_domain::module::ExecutionContext;
use weft_domain::state::VariableBag;

use crate::plugins::PluginCaps;

/// Hard cap on nested reflection.
pub const MAX_REFLECTION_DEPTH: usize = 3;
/// Bound on the retained reflection audit chain.
pub const MAX_REFLECTION_CHAIN: usize = 10;

#[derive(Debug, Clone)]
struct ReflectionEntry {
    module: String,
    depth: usize,
}

#[derive(Default)]
struct ReflectionState {
    depth: usize,
    chain: Vec<ReflectionEntry>,
}

struct Inner {
    conversation_id: Option<Uuid>,
    persona_id: Option<Uuid>,
    provider: String,
    provider_settings: Value,
    chat_controls: Value,
    trigger_data: Value,
    /// Name of the module whose script is executing.
    current_module: Option<String>,
    /// Execution context of the current module.
    timing: ExecutionContext,
    /// Names currently being resolved by the stage executor.
    resolution_stack: Vec<String>,
    caps: PluginCaps,
    user_variables: Mutex<VariableBag>,
    reflection: Mutex<ReflectionState>,
}

/// Handle passed into the engine and bound to `ctx` in script scope.
#[derive(Clone)]
pub struct ScriptContext(Arc<Inner>);

pub struct ScriptContextBuilder {
    conversation_id: Option<Uuid>,
    persona_id: Option<Uuid>,
    provider: String,
    provider_settings: Value,
    chat_controls: Value,
    trigger_data: Value,
    current_module: Option<String>,
    timing: ExecutionContext,
    resolution_stack: Vec<String>,
    caps: PluginCaps,
}

impl ScriptContextBuilder {
    pub fn new(caps: PluginCaps) -> Self {
        Self {
            conversation_id: caps.conversation_id,
            persona_id: caps.persona_id,
            provider: String::new(),
            provider_settings: Value::Null,
            chat_controls: Value::Null,
            trigger_data: Value::Null,
            current_module: None,
            timing: ExecutionContext::Immediate,
            resolution_stack: Vec::new(),
            caps,
        }
    }

    pub fn provider(mut self, provider: impl Into<String>) -> Self {
        self.provider = provider.into();
        self
    }

    pub fn provider_settings(mut self, settings: Value) -> Self {
        self.provider_settings = settings;
        self
    }

    pub fn chat_controls(mut self, controls: Value) -> Self {
        self.chat_controls = controls;
        self
    }

    pub fn trigger_data(mut self, data: Value) -> Self {
        self.trigger_data = data;
        self
    }

    pub fn current_module(mut self, name: impl Into<String>, timing: ExecutionContext) -> Self {
        self.current_module = Some(name.into());
        self.timing = timing;
        self
    }

    pub fn resolution_stack(mut self, stack: Vec<String>) -> Self {
        self.resolution_stack = stack;
        self
    }

    pub fn build(self) -> ScriptContext {
        ScriptContext(Arc::new(Inner {
            conversation_id: self.conversation_id,
            persona_id: self.persona_id,
            provider: self.provider,
            provider_settings: self.provider_settings,
            chat_controls: self.chat_controls,
            trigger_data: self.trigger_data,
            current_module: self.current_module,
            timing: self.timing,
            resolution_stack: self.resolution_stack,
            caps: self.caps,
            user_variables: Mutex::new(VariableBag::new()),
            reflection: Mutex::new(ReflectionState::default()),
        }))
    }
}

impl ScriptContext {
    pub fn caps(&self) -> &PluginCaps {
        &self.0.caps
    }

    pub fn conversation_id(&self) -> Option<Uuid> {
        self.0.conversation_id
    }

    pub fn conversation_id_str(&self) -> String {
        self.0
            .conversation_id
            .map(|id| id.to_string())
            .unwrap_or_default()
    }

    pub fn persona_id_str(&self) -> String {
        self.0
            .persona_id
            .map(|id| id.to_string())
            .unwrap_or_default()
    }

    pub fn provider(&self) -> &str {
        &self.0.provider
    }

    pub fn provider_settings(&self) -> &Value {
        &self.0.provider_settings
    }

    pub fn chat_controls(&self) -> &Value {
        &self.0.chat_controls
    }

    pub fn trigger_data(&self) -> &Value {
        &self.0.trigger_data
    }

    pub fn current_module(&self) -> Option<&str> {
        self.0.current_module.as_deref()
    }

    pub fn timing(&self) -> ExecutionContext {
        self.0.timing
    }

    // ── User variables ─────────────────────────────────────────────

    pub fn set_variable(&self, name: &str, value: Value) {
        self.0.user_variables.lock().insert(name.to_owned(), value);
    }

    pub fn get_variable(&self, name: &str) -> Option<Value> {
        self.0.user_variables.lock().get(name).cloned()
    }

    pub fn variables(&self) -> VariableBag {
        self.0.user_variables.lock().clone()
    }

    // ── Reflection safety ──────────────────────────────────────────

    pub fn reflection_depth(&self) -> usize {
        self.0.reflection.lock().depth
    }

    /// Whether a plugin may re-enter the resolver for `module` with the
    /// given timing. False when the depth budget is spent, when the module
    /// is already mid-resolution at non-zero depth, or when an immediate
    /// module attempts nested reflection.
    pub fn can_reflect(&self, module: &str, timing: ExecutionContext) -> bool {
        if module.is_empty() {
            return false;
        }
        let reflection = self.0.reflection.lock();
        if reflection.depth >= MAX_REFLECTION_DEPTH {
            tracing::debug!(module, "reflection blocked: max depth reached");
            return false;
        }
        if reflection.depth > 0 && self.0.resolution_stack.iter().any(|m| m == module) {
            tracing::debug!(module, "reflection blocked: module already resolving");
            return false;
        }
        if timing == ExecutionContext::Immediate && reflection.depth > 0 {
            tracing::debug!(module, "reflection blocked: nested immediate reflection");
            return false;
        }
        true
    }

    pub fn enter_reflection(&self, module: &str) {
        let mut reflection = self.0.reflection.lock();
        reflection.depth += 1;
        let depth = reflection.depth;
        reflection.chain.push(ReflectionEntry {
            module: module.to_owned(),
            depth,
        });
        if reflection.chain.len() > MAX_REFLECTION_CHAIN {
            let excess = reflection.chain.len() - MAX_REFLECTION_CHAIN;
            reflection.chain.drain(..excess);
        }
    }

    pub fn exit_reflection(&self) {
        let mut reflection = self.0.reflection.lock();
        if reflection.depth == 0 {
            tracing::warn!("exit_reflection with zero depth");
            return;
        }
        reflection.depth -= 1;
    }

    /// Modules that entered reflection, oldest first.
    pub fn reflection_chain(&self) -> Vec<String> {
        self.0
            .reflection
            .lock()
            .chain
            .iter()
            .map(|e| e.module.clone())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use weft_store::MemoryStore;

    fn context() -> ScriptContext {
        ScriptContextBuilder::new(PluginCaps {
            conversation_id: Some(Uuid::new_v4()),
            persona_id: None,
            store: Arc::new(MemoryStore::new()),
            token: None,
            ai: None,
        })
        .current_module("scorer", ExecutionContext::PostResponse)
        .resolution_stack(vec!["scorer".into()])
        .build()
    }

    #[test]
    fn variables_round_trip() {
        let ctx = context();
        ctx.set_variable("mood", serde_json::json!("calm"));
        assert_eq!(ctx.get_variable("mood"), Some(serde_json::json!("calm")));
        assert_eq!(ctx.variables().len(), 1);
        assert!(ctx.get_variable("missing").is_none());
    }

    #[test]
    fn reflection_allowed_at_zero_depth() {
        let ctx = context();
        assert!(ctx.can_reflect("scorer", ExecutionContext::PostResponse));
        assert!(ctx.can_reflect("other", ExecutionContext::Immediate));
    }

    #[test]
    fn reflection_blocked_at_max_depth() {
        let ctx = context();
        for _ in 0..MAX_REFLECTION_DEPTH {
            ctx.enter_reflection("m");
        }
        assert!(!ctx.can_reflect("fresh", ExecutionContext::PostResponse));
    }

    #[test]
    fn nested_reflection_of_resolving_module_is_blocked() {
        let ctx = context();
        // At depth 0 a module may reflect during its own execution.
        assert!(ctx.can_reflect("scorer", ExecutionContext::PostResponse));
        ctx.enter_reflection("scorer");
        // At depth > 0 re-resolving the same module is a loop.
        assert!(!ctx.can_reflect("scorer", ExecutionContext::PostResponse));
    }

    #[test]
    fn nested_immediate_reflection_is_blocked() {
        let ctx = context();
        ctx.enter_reflection("a");
        assert!(!ctx.can_reflect("b", ExecutionContext::Immediate));
        assert!(ctx.can_reflect("b", ExecutionContext::PostResponse));
    }

    #[test]
    fn empty_module_never_reflects() {
        let ctx = context();
        assert!(!ctx.can_reflect("", ExecutionContext::PostResponse));
    }

    #[test]
    fn exit_reflection_is_bounded() {
        let ctx = context();
        ctx.enter_reflection("a");
        ctx.exit_reflection();
        ctx.exit_reflection(); // extra exit must not underflow
        assert_eq!(ctx.reflection_depth(), 0);
    }

    #[test]
    fn chain_is_capped() {
        let ctx = context();
        for i in 0..(MAX_REFLECTION_CHAIN + 5) {
            ctx.enter_reflection(&format!("m{i}"));
            ctx.exit_reflection();
        }
        let chain = ctx.reflection_chain();
        assert_eq!(chain.len(), MAX_REFLECTION_CHAIN);
        assert_eq!(chain.last().unwrap(), &format!("m{}", MAX_REFLECTION_CHAIN + 4));
    }
}
