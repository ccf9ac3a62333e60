//! The module/persona data model.
//!
//! Modules are the unit of prompt composition. They are created and edited
//! through the CRUD surface; the resolution pipeline treats them as
//! read-only. Name validity (`^[a-z][a-z0-9_]{0,49}$`) is enforced at CRUD
//! time — the pipeline relies on that invariant.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Maximum length of a module name.
pub const MODULE_NAME_MAX_LEN: usize = 50;

/// How a module produces its content.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModuleKind {
    /// Static template text only.
    Simple,
    /// Carries a script executed in the sandbox.
    Advanced,
}

/// When a module executes relative to the main LLM call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionContext {
    /// Before the main LLM call (stages 1–2).
    Immediate,
    /// After the main LLM call (stages 4–5).
    PostResponse,
}

/// A user-authored prompt module.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Module {
    pub id: Uuid,
    pub name: String,
    pub kind: ModuleKind,
    pub execution_context: ExecutionContext,
    /// Whether this module's script calls the AI provider.
    #[serde(default)]
    pub requires_ai: bool,
    /// Optional trigger pattern gating script execution.
    #[serde(default)]
    pub trigger_pattern: Option<String>,
    /// Template text spliced into the prompt (may contain `@refs`/`${vars}`).
    #[serde(default)]
    pub content: String,
    /// Script body; empty for `simple` modules.
    #[serde(default)]
    pub script: String,
    #[serde(default = "default_true")]
    pub is_active: bool,
    /// Persona this module belongs to, if scoped.
    #[serde(default)]
    pub persona_id: Option<Uuid>,
}

impl Module {
    /// Check the simple/advanced invariant: `simple` modules carry no
    /// script and no AI flag.
    pub fn check_invariants(&self) -> crate::Result<()> {
        if self.kind == ModuleKind::Simple && (!self.script.is_empty() || self.requires_ai) {
            return Err(crate::Error::Config(format!(
                "simple module '{}' must have empty script and no AI flag",
                self.name
            )));
        }
        if !validate_module_name(&self.name) {
            return Err(crate::Error::Config(format!(
                "invalid module name '{}'",
                self.name
            )));
        }
        Ok(())
    }
}

/// A persona: a display name plus the template the pipeline resolves.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Persona {
    pub id: Uuid,
    pub name: String,
    /// Template string containing `@name` module references.
    #[serde(default)]
    pub template: String,
    #[serde(default = "default_true")]
    pub is_active: bool,
}

fn default_true() -> bool {
    true
}

/// Validate a module name against `^[a-z][a-z0-9_]{0,49}$`.
pub fn validate_module_name(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c.is_ascii_lowercase() => {}
        _ => return false,
    }
    if name.len() > MODULE_NAME_MAX_LEN {
        return false;
    }
    chars.all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_')
}

#[cfg(test)]
mod tests {
    use super::*;

    fn module(kind: ModuleKind, script: &str, ai: bool) -> Module {
        Module {
            id: Uuid::new_v4(),
            name: "greeting".into(),
            kind,
            execution_context: ExecutionContext::Immediate,
            requires_ai: ai,
            trigger_pattern: None,
            content: "Hello".into(),
            script: script.into(),
            is_active: true,
            persona_id: None,
        }
    }

    #[test]
    fn valid_names() {
        assert!(validate_module_name("a"));
        assert!(validate_module_name("mood_tracker"));
        assert!(validate_module_name("m2_counter"));
        // exactly 50 chars
        assert!(validate_module_name(&format!("a{}", "b".repeat(49))));
    }

    #[test]
    fn invalid_names() {
        assert!(!validate_module_name(""));
        assert!(!validate_module_name("Upper"));
        assert!(!validate_module_name("2start"));
        assert!(!validate_module_name("_lead"));
        assert!(!validate_module_name("has-dash"));
        assert!(!validate_module_name(&format!("a{}", "b".repeat(50))));
    }

    #[test]
    fn simple_module_with_script_fails_invariant() {
        let m = module(ModuleKind::Simple, "x = 1;", false);
        assert!(m.check_invariants().is_err());
    }

    #[test]
    fn simple_module_with_ai_flag_fails_invariant() {
        let m = module(ModuleKind::Simple, "", true);
        assert!(m.check_invariants().is_err());
    }

    #[test]
    fn advanced_module_may_have_both() {
        let m = module(ModuleKind::Advanced, "x = 1;", true);
        assert!(m.check_invariants().is_ok());
    }
}
