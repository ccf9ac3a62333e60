//! The hardened Rhai engine and script output extraction.

use std::time::{Duration, Instant};

use rhai::{Dynamic, Engine, Scope};
use serde_json::Value;

use weft_domain::state::VariableBag;

use crate::context::ScriptContext;
use crate::plugins::{PluginArgs, PluginRegistry};

/// Result of one sandboxed execution.
#[derive(Debug, Clone)]
pub struct ScriptOutcome {
    pub success: bool,
    /// Top-level script variables that survived output filtering.
    pub outputs: VariableBag,
    pub error: Option<String>,
    pub duration_ms: u64,
}

impl ScriptOutcome {
    fn ok(outputs: VariableBag, started: Instant) -> Self {
        Self {
            success: true,
            outputs,
            error: None,
            duration_ms: started.elapsed().as_millis() as u64,
        }
    }

    fn failed(error: impl Into<String>, started: Instant) -> Self {
        Self {
            success: false,
            outputs: VariableBag::new(),
            error: Some(error.into()),
            duration_ms: started.elapsed().as_millis() as u64,
        }
    }
}

/// Executes module scripts with engine-level limits, a soft wall-clock
/// deadline checked after execution, and cooperative cancellation through
/// the engine's progress hook.
pub struct ScriptEngine {
    deadline: Duration,
    max_operations: u64,
}

impl Default for ScriptEngine {
    fn default() -> Self {
        Self::new(Duration::from_secs(30), 5_000_000)
    }
}

impl ScriptEngine {
    pub fn new(deadline: Duration, max_operations: u64) -> Self {
        Self {
            deadline,
            max_operations,
        }
    }

    /// Run `script` with `ctx` bound in scope. Never panics and never
    /// propagates script failures as errors — the outcome carries them.
    pub fn execute(&self, script: &str, ctx: &ScriptContext) -> ScriptOutcome {
        let started = Instant::now();

        if script.trim().is_empty() {
            return ScriptOutcome::ok(VariableBag::new(), started);
        }
        if let Some(token) = &ctx.caps().token {
            if token.is_cancelled() {
                return ScriptOutcome::failed("cancelled before execution", started);
            }
        }

        let engine = self.build_engine(ctx);

        let ast = match engine.compile(script) {
            Ok(ast) => ast,
            Err(e) => return ScriptOutcome::failed(format!("compilation error: {e}"), started),
        };

        let mut scope = Scope::new();
        // Pushed as a plain variable: method calls take `&mut` receivers,
        // which Rhai refuses on constants.
        scope.push("ctx", ctx.clone());

        if let Err(e) = engine.run_ast_with_scope(&mut scope, &ast) {
            let cancelled = ctx
                .caps()
                .token
                .as_ref()
                .is_some_and(|t| t.is_cancelled());
            let message = if cancelled {
                "cancelled during execution".to_owned()
            } else {
                format!("runtime error: {e}")
            };
            return ScriptOutcome::failed(message, started);
        }

        if started.elapsed() > self.deadline {
            return ScriptOutcome::failed(
                format!(
                    "script execution timeout after {}s",
                    self.deadline.as_secs()
                ),
                started,
            );
        }

        let outputs = extract_outputs(&scope);
        tracing::debug!(
            outputs = outputs.len(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "script executed"
        );
        ScriptOutcome::ok(outputs, started)
    }

    /// Build a locked-down engine with the context surface registered.
    fn build_engine(&self, ctx: &ScriptContext) -> Engine {
        let mut engine = Engine::new();

        engine.set_max_operations(self.max_operations);
        engine.set_max_call_levels(32);
        engine.set_max_string_size(1_000_000);
        engine.set_max_array_size(100_000);
        engine.set_max_map_size(100_000);
        // No module resolver and no import budget: scripts get only the
        // injected context.
        engine.set_max_modules(0);

        if let Some(token) = ctx.caps().token.clone() {
            engine.on_progress(move |_ops| {
                if token.is_cancelled() {
                    Some(Dynamic::UNIT)
                } else {
                    None
                }
            });
        }

        register_context(&mut engine);
        engine
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Context registration
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

type FnResult = Result<Dynamic, Box<rhai::EvalAltResult>>;

fn plugin_call(ctx: &ScriptContext, name: &str, args: PluginArgs) -> FnResult {
    let value = PluginRegistry::global()
        .call(name, &args, ctx.caps())
        .map_err(|e| Box::<rhai::EvalAltResult>::from(e.to_string()))?;
    rhai::serde::to_dynamic(&value)
}

fn dynamic_to_value(value: &Dynamic) -> Value {
    rhai::serde::from_dynamic::<Value>(value).unwrap_or_else(|_| Value::String(value.to_string()))
}

fn register_context(engine: &mut Engine) {
    engine.register_type_with_name::<ScriptContext>("Context");

    // ── Identity & live chat-session context ───────────────────────
    engine.register_get("conversation_id", |ctx: &mut ScriptContext| {
        ctx.conversation_id_str()
    });
    engine.register_get("persona_id", |ctx: &mut ScriptContext| ctx.persona_id_str());
    engine.register_get("provider", |ctx: &mut ScriptContext| {
        ctx.provider().to_owned()
    });
    engine.register_fn("provider_settings", |ctx: &mut ScriptContext| -> FnResult {
        rhai::serde::to_dynamic(ctx.provider_settings())
    });
    engine.register_fn("chat_controls", |ctx: &mut ScriptContext| -> FnResult {
        rhai::serde::to_dynamic(ctx.chat_controls())
    });
    engine.register_fn("trigger", |ctx: &mut ScriptContext| -> FnResult {
        rhai::serde::to_dynamic(ctx.trigger_data())
    });

    // ── User variables ─────────────────────────────────────────────
    engine.register_fn("set_var", |ctx: &mut ScriptContext, name: &str, value: Dynamic| {
        ctx.set_variable(name, dynamic_to_value(&value));
    });
    engine.register_fn("get_var", |ctx: &mut ScriptContext, name: &str| -> FnResult {
        match ctx.get_variable(name) {
            Some(value) => rhai::serde::to_dynamic(&value),
            None => Ok(Dynamic::UNIT),
        }
    });
    engine.register_fn(
        "get_var",
        |ctx: &mut ScriptContext, name: &str, default: Dynamic| -> FnResult {
            match ctx.get_variable(name) {
                Some(value) => rhai::serde::to_dynamic(&value),
                None => Ok(default),
            }
        },
    );

    // ── Reflection safety ──────────────────────────────────────────
    engine.register_fn(
        "can_reflect",
        |ctx: &mut ScriptContext, module: &str, timing: &str| -> bool {
            let timing = match timing.to_lowercase().as_str() {
                "post_response" => weft_domain::module::ExecutionContext::PostResponse,
                _ => weft_domain::module::ExecutionContext::Immediate,
            };
            ctx.can_reflect(module, timing)
        },
    );

    // ── Plugin sugar: each registered plugin is a `ctx` method ─────
    engine.register_fn("get_message_count", |ctx: &mut ScriptContext| -> FnResult {
        plugin_call(ctx, "get_message_count", PluginArgs::new())
    });
    engine.register_fn("get_recent_messages", |ctx: &mut ScriptContext| -> FnResult {
        plugin_call(ctx, "get_recent_messages", PluginArgs::new())
    });
    engine.register_fn(
        "get_recent_messages",
        |ctx: &mut ScriptContext, limit: i64| -> FnResult {
            plugin_call(
                ctx,
                "get_recent_messages",
                PluginArgs::new().with("limit", limit.into()),
            )
        },
    );
    engine.register_fn(
        "get_message_range",
        |ctx: &mut ScriptContext, start: i64, end: i64| -> FnResult {
            plugin_call(
                ctx,
                "get_message_range",
                PluginArgs::new()
                    .with("start", start.into())
                    .with("end", end.into()),
            )
        },
    );
    engine.register_fn(
        "get_conversation_summary",
        |ctx: &mut ScriptContext| -> FnResult {
            plugin_call(ctx, "get_conversation_summary", PluginArgs::new())
        },
    );
    engine.register_fn("get_buffer_messages", |ctx: &mut ScriptContext| -> FnResult {
        plugin_call(ctx, "get_buffer_messages", PluginArgs::new())
    });
    engine.register_fn(
        "get_buffer_messages",
        |ctx: &mut ScriptContext, buffer_size: i64| -> FnResult {
            plugin_call(
                ctx,
                "get_buffer_messages",
                PluginArgs::new().with("buffer_size", buffer_size.into()),
            )
        },
    );
    engine.register_fn(
        "should_compress_buffer",
        |ctx: &mut ScriptContext| -> FnResult {
            plugin_call(ctx, "should_compress_buffer", PluginArgs::new())
        },
    );
    engine.register_fn(
        "should_compress_buffer",
        |ctx: &mut ScriptContext, buffer_size: i64, min_messages: i64| -> FnResult {
            plugin_call(
                ctx,
                "should_compress_buffer",
                PluginArgs::new()
                    .with("buffer_size", buffer_size.into())
                    .with("min_messages", min_messages.into()),
            )
        },
    );
    engine.register_fn(
        "store_memory",
        |ctx: &mut ScriptContext, summary: &str, start: i64, end: i64| -> FnResult {
            plugin_call(
                ctx,
                "store_memory",
                PluginArgs::new()
                    .with("summary", summary.into())
                    .with("start", start.into())
                    .with("end", end.into()),
            )
        },
    );
    engine.register_fn("get_recent_memories", |ctx: &mut ScriptContext| -> FnResult {
        plugin_call(ctx, "get_recent_memories", PluginArgs::new())
    });
    engine.register_fn(
        "get_recent_memories",
        |ctx: &mut ScriptContext, limit: i64| -> FnResult {
            plugin_call(
                ctx,
                "get_recent_memories",
                PluginArgs::new().with("limit", limit.into()),
            )
        },
    );
    engine.register_fn("get_memory_status", |ctx: &mut ScriptContext| -> FnResult {
        plugin_call(ctx, "get_memory_status", PluginArgs::new())
    });
    engine.register_fn("clear_memories", |ctx: &mut ScriptContext| -> FnResult {
        plugin_call(ctx, "clear_memories", PluginArgs::new())
    });
    engine.register_fn("ask_ai", |ctx: &mut ScriptContext, prompt: &str| -> FnResult {
        plugin_call(ctx, "ask_ai", PluginArgs::new().with("prompt", prompt.into()))
    });
    engine.register_fn("is_cancelled", |ctx: &mut ScriptContext| -> FnResult {
        plugin_call(ctx, "is_cancelled", PluginArgs::new())
    });

    // Escape hatch for plugins registered at runtime.
    engine.register_fn(
        "invoke",
        |ctx: &mut ScriptContext, name: &str, args: rhai::Map| -> FnResult {
            let mut bag = PluginArgs::new();
            for (key, value) in args {
                bag.0.insert(key.to_string(), dynamic_to_value(&value));
            }
            plugin_call(ctx, name, bag)
        },
    );
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Output extraction
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// The output bag: every top-level variable that is not the context
/// binding, not `_`-prefixed, and not a function value. Values that fail
/// JSON conversion fall back to their display string.
fn extract_outputs(scope: &Scope) -> VariableBag {
    let mut outputs = VariableBag::new();
    for (name, _is_constant, value) in scope.iter() {
        if name == "ctx" || name.starts_with('_') {
            continue;
        }
        if value.is::<rhai::FnPtr>() {
            continue;
        }
        outputs.insert(name.to_owned(), dynamic_to_value(&value));
    }
    outputs
}
