//! Stage executors: one resolver parameterised by the stage number.
//!
//! | Stage | Selects | AI |
//! |-------|---------|----|
//! | 1 | simple, immediate non-AI scripts, prior post-response state | no |
//! | 2 | immediate AI scripts | yes |
//! | 4 | post-response non-AI scripts | no |
//! | 5 | post-response AI scripts | yes |
//!
//! Stages 1–2 splice content into the template; stages 4–5 execute for
//! their side effects and upsert each successful module's output bag into
//! the state store.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use serde_json::Value;
use uuid::Uuid;

use weft_domain::module::{ExecutionContext, Module, ModuleKind};
use weft_domain::state::{ExecutionMetadata, ExecutionStage, VariableBag};
use weft_domain::Result;
use weft_sandbox::{AiCapability, PluginCaps, ScriptContextBuilder, ScriptEngine};
use weft_session::CancellationToken;
use weft_store::{ModuleCatalog, StateStore};

use crate::template;
use crate::trigger::{self, TriggerContext};
use crate::warnings::{ResolutionWarning, WarningKind};

/// Recursion cap for nested `@ref` resolution.
pub const MAX_RESOLUTION_DEPTH: usize = 10;

/// Whether a module belongs to the given stage.
pub fn stage_filter(stage: u8, module: &Module) -> bool {
    let advanced = module.kind == ModuleKind::Advanced;
    match stage {
        // Simple text, cheap immediate scripts, and the stored-state
        // injection path for post-response modules.
        1 => {
            module.kind == ModuleKind::Simple
                || (advanced
                    && module.execution_context == ExecutionContext::Immediate
                    && !module.requires_ai)
                || (advanced && module.execution_context == ExecutionContext::PostResponse)
        }
        2 => {
            advanced
                && module.execution_context == ExecutionContext::Immediate
                && module.requires_ai
        }
        4 => {
            advanced
                && module.execution_context == ExecutionContext::PostResponse
                && !module.requires_ai
        }
        5 => {
            advanced
                && module.execution_context == ExecutionContext::PostResponse
                && module.requires_ai
        }
        _ => false,
    }
}

/// Shared per-turn handles and identifiers the stage executors need.
pub struct StageEnv {
    pub catalog: Arc<dyn ModuleCatalog>,
    pub store: Arc<dyn StateStore>,
    pub engine: Arc<ScriptEngine>,
    pub token: Option<Arc<CancellationToken>>,
    pub conversation_id: Option<Uuid>,
    pub persona_id: Option<Uuid>,
    pub provider_name: String,
    pub provider_settings: Value,
    pub chat_controls: Value,
    /// Present only when the orchestrator grants AI to this turn's AI
    /// stages (2 and 5).
    pub ai: Option<AiCapability>,
}

/// One stage execution over one turn. Accumulates warnings and resolved
/// module names across stages when reused.
pub struct StageExecutor<'a> {
    env: &'a StageEnv,
    stage: u8,
    trigger_context: &'a TriggerContext,
    pub warnings: Vec<ResolutionWarning>,
    pub resolved: Vec<String>,
    stack: Vec<String>,
}

impl<'a> StageExecutor<'a> {
    pub fn new(env: &'a StageEnv, stage: u8, trigger_context: &'a TriggerContext) -> Self {
        Self {
            env,
            stage,
            trigger_context,
            warnings: Vec::new(),
            resolved: Vec::new(),
            stack: Vec::new(),
        }
    }

    /// Active modules reachable from `template` (by name) that match this
    /// stage's filter. Catalog failures degrade to an empty selection.
    pub fn select_modules(&mut self, template: &str) -> Vec<Module> {
        let names = template::parse_module_references(template);
        if names.is_empty() {
            return Vec::new();
        }
        match self.env.catalog.active_modules_by_name(&names) {
            Ok(modules) => modules
                .into_iter()
                .filter(|m| stage_filter(self.stage, m))
                .collect(),
            Err(e) => {
                tracing::error!(stage = self.stage, error = %e, "module selection failed");
                self.warnings.push(
                    ResolutionWarning::new(
                        "",
                        WarningKind::ProcessingError,
                        format!("module selection failed: {e}"),
                    )
                    .at_stage(self.stage),
                );
                Vec::new()
            }
        }
    }

    /// Stage 1/2 entry point: resolve this stage's modules into the
    /// template. Fails only on cancellation.
    pub fn resolve(&mut self, template: &str) -> Result<String> {
        let selected = self.select_modules(template);
        if selected.is_empty() {
            return Ok(template.to_owned());
        }
        let by_name: HashMap<String, Module> =
            selected.into_iter().map(|m| (m.name.clone(), m)).collect();
        self.resolve_in(template, &by_name, 0)
    }

    fn resolve_in(
        &mut self,
        template: &str,
        modules: &HashMap<String, Module>,
        depth: usize,
    ) -> Result<String> {
        if depth >= MAX_RESOLUTION_DEPTH {
            let module = self.stack.last().cloned().unwrap_or_default();
            tracing::warn!(stage = self.stage, module = %module, "max resolution depth exceeded");
            self.warnings.push(
                ResolutionWarning::new(
                    module,
                    WarningKind::MaxDepthExceeded,
                    format!("resolution depth exceeded {MAX_RESOLUTION_DEPTH}"),
                )
                .at_stage(self.stage),
            );
            return Ok(template.to_owned());
        }

        let mut result = template.to_owned();
        for name in template::parse_module_references(template) {
            let module = match modules.get(&name) {
                Some(m) => m,
                None => continue, // not this stage's concern
            };
            if let Some(token) = &self.env.token {
                token.check()?;
            }
            if self.stack.contains(&name) {
                self.warnings.push(
                    ResolutionWarning::new(
                        name.clone(),
                        WarningKind::CircularDependency,
                        format!("circular dependency detected with module '{name}'"),
                    )
                    .at_stage(self.stage),
                );
                continue;
            }

            self.stack.push(name.clone());
            let processed = self.process_module(module, modules, depth);
            self.stack.pop();

            if let Some(content) = processed? {
                result = template::replace_module_ref(&result, &name, &content);
                if !self.resolved.contains(&name) {
                    self.resolved.push(name);
                }
            }
        }
        Ok(result)
    }

    /// Produce the content to splice in for one module, or `None` to leave
    /// the `@name` reference untouched (a warning has been recorded).
    fn process_module(
        &mut self,
        module: &Module,
        modules: &HashMap<String, Module>,
        depth: usize,
    ) -> Result<Option<String>> {
        match module.kind {
            // Simple content may itself reference same-stage modules.
            ModuleKind::Simple => Ok(Some(self.resolve_in(&module.content, modules, depth + 1)?)),
            ModuleKind::Advanced => {
                // Stage 1 injects a post-response module's content with the
                // latest stored state — no script, no trigger gate.
                if self.stage == 1
                    && module.execution_context == ExecutionContext::PostResponse
                {
                    let bag = self.stored_state(module).unwrap_or_default();
                    return Ok(Some(template::substitute_variables(&module.content, &bag)));
                }

                if !trigger::should_execute(module.trigger_pattern.as_deref(), self.trigger_context)
                {
                    tracing::debug!(module = %module.name, "trigger did not match");
                    return Ok(Some(module.content.clone()));
                }

                match self.execute_script(module) {
                    Some(outputs) => {
                        Ok(Some(template::substitute_variables(&module.content, &outputs)))
                    }
                    None => Ok(None),
                }
            }
        }
    }

    /// Stage 4/5 entry point: execute each selected module's script for
    /// its side effects and upsert successful output bags. Modules run in
    /// deterministic name order; cancellation stops before the next
    /// module, never mid-upsert. Returns the committed (module, bag)
    /// pairs for the tracker.
    pub fn run_post_response(
        &mut self,
        persona_template: &str,
        stage: ExecutionStage,
    ) -> Vec<(String, VariableBag)> {
        let mut modules = self.select_modules(persona_template);
        modules.sort_by(|a, b| a.name.cmp(&b.name));

        let mut committed = Vec::new();
        for module in &modules {
            if self
                .env
                .token
                .as_ref()
                .is_some_and(|t| t.is_cancelled())
            {
                tracing::info!(
                    stage = self.stage,
                    "cancellation observed, skipping remaining post-response modules"
                );
                break;
            }
            if !trigger::should_execute(module.trigger_pattern.as_deref(), self.trigger_context) {
                tracing::debug!(module = %module.name, "trigger did not match");
                continue;
            }

            let started = Instant::now();
            let Some(outputs) = self.execute_script(module) else {
                continue; // failure already recorded as a warning
            };
            let metadata = ExecutionMetadata {
                success: true,
                duration_ms: started.elapsed().as_millis() as u64,
                error: None,
            };

            if let Some(conversation) = self.env.conversation_id {
                if let Err(e) = self.env.store.upsert_state(
                    conversation,
                    module.id,
                    stage,
                    outputs.clone(),
                    metadata,
                ) {
                    // The module's state is rolled back; the turn goes on.
                    tracing::error!(module = %module.name, error = %e, "state upsert failed");
                    continue;
                }
            }
            if !self.resolved.contains(&module.name) {
                self.resolved.push(module.name.clone());
            }
            committed.push((module.name.clone(), outputs));
        }
        committed
    }

    /// After stages 1–2: warn once for each surviving unescaped reference
    /// that names no active module, then unescape `\@name` regions.
    pub fn finish(&mut self, template: &str) -> String {
        let remaining = template::parse_module_references(template);
        if !remaining.is_empty() {
            let known: Vec<String> = match self.env.catalog.active_modules_by_name(&remaining) {
                Ok(modules) => modules.into_iter().map(|m| m.name).collect(),
                Err(_) => Vec::new(),
            };
            for name in remaining {
                if !known.contains(&name) {
                    self.warnings.push(
                        ResolutionWarning::new(
                            name.clone(),
                            WarningKind::ModuleNotFound,
                            format!("module '{name}' not found or inactive"),
                        )
                        .at_stage(self.stage),
                    );
                }
            }
        }
        template::unescape_module_refs(template)
    }

    fn stored_state(&self, module: &Module) -> Option<VariableBag> {
        let conversation = self.env.conversation_id?;
        match self.env.store.latest_state(conversation, module.id) {
            Ok(bag) => bag,
            Err(e) => {
                tracing::error!(module = %module.name, error = %e, "state lookup failed");
                None
            }
        }
    }

    /// Run a module's script in the sandbox. `None` on failure (after
    /// recording a `script_execution_failed` warning).
    fn execute_script(&mut self, module: &Module) -> Option<VariableBag> {
        let caps = PluginCaps {
            conversation_id: self.env.conversation_id,
            persona_id: self.env.persona_id,
            store: Arc::clone(&self.env.store),
            token: self.env.token.clone(),
            ai: if module.requires_ai {
                self.env.ai.clone()
            } else {
                None
            },
        };
        let ctx = ScriptContextBuilder::new(caps)
            .provider(&self.env.provider_name)
            .provider_settings(self.env.provider_settings.clone())
            .chat_controls(self.env.chat_controls.clone())
            .trigger_data(self.trigger_context.to_value())
            .current_module(&module.name, module.execution_context)
            .resolution_stack(self.stack.clone())
            .build();

        // Post-response scripts see their own prior state as ctx
        // variables, giving read-modify-write across turns.
        if module.execution_context == ExecutionContext::PostResponse {
            if let Some(bag) = self.stored_state(module) {
                for (name, value) in bag {
                    ctx.set_variable(&name, value);
                }
            }
        }

        let outcome = self.env.engine.execute(&module.script, &ctx);
        if outcome.success {
            Some(outcome.outputs)
        } else {
            let error = outcome.error.unwrap_or_else(|| "unknown error".into());
            tracing::warn!(module = %module.name, stage = self.stage, error = %error, "script failed");
            self.warnings.push(
                ResolutionWarning::new(
                    module.name.clone(),
                    WarningKind::ScriptExecutionFailed,
                    error,
                )
                .at_stage(self.stage),
            );
            None
        }
    }
}
