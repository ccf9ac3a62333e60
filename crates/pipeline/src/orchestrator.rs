//! The pipeline orchestrator: runs one chat turn end to end.
//!
//! Owns the turn's cancellation token (via the session registry) and the
//! prompt-state tracker; stage executors and the provider client receive
//! them by reference. Frames flow out through the per-connection channel
//! owned by the connection manager.

use std::sync::Arc;
use std::time::Instant;

use futures_util::StreamExt;
use serde_json::Value;
use tokio::sync::mpsc;
use uuid::Uuid;

use weft_domain::frame::{ChatPayload, Frame, ProcessingStage};
use weft_domain::message::Role;
use weft_domain::module::Persona;
use weft_domain::state::ExecutionStage;
use weft_domain::{Error, Result};
use weft_providers::{ChatControls, ChatRequest, ProviderRegistry};
use weft_sandbox::{AiCapability, ScriptEngine};
use weft_session::{CancellationToken, SessionRegistry};
use weft_store::{ModuleCatalog, StateStore};

use crate::prompt_state::SystemPromptState;
use crate::stage::{StageEnv, StageExecutor};
use crate::trigger::TriggerContext;
use crate::warnings::ResolutionWarning;

/// Shared handles a turn needs; built once at startup.
#[derive(Clone)]
pub struct TurnDeps {
    pub catalog: Arc<dyn ModuleCatalog>,
    pub store: Arc<dyn StateStore>,
    pub providers: Arc<ProviderRegistry>,
    pub sessions: Arc<SessionRegistry>,
    pub engine: Arc<ScriptEngine>,
}

/// Runs chat turns. One instance serves the whole process.
pub struct Orchestrator {
    deps: TurnDeps,
    /// When set, a [`SystemPromptState`] is assembled per turn and logged.
    pub track_prompt_state: bool,
}

struct StagePassOutput {
    resolved_prompt: String,
    warnings: Vec<ResolutionWarning>,
    resolved_modules: Vec<String>,
    stage1_prompt: String,
    stage1_ms: u64,
    stage2_ms: u64,
}

impl Orchestrator {
    pub fn new(deps: TurnDeps) -> Self {
        Self {
            deps,
            track_prompt_state: true,
        }
    }

    /// Run one turn for a `chat` frame. All outcomes — `done`,
    /// `cancelled`, `error` — are reported through `outbound`; this
    /// function itself never fails.
    pub async fn run_turn(
        &self,
        outbound: mpsc::Sender<Frame>,
        socket_session_id: &str,
        payload: ChatPayload,
    ) {
        let chat_session_id = Uuid::new_v4().to_string();

        let token = match self
            .deps
            .sessions
            .register(&chat_session_id, payload.conversation_id.clone())
        {
            Ok(token) => token,
            Err(e) => {
                tracing::warn!(error = %e, "chat session registration failed");
                send(&outbound, Frame::Error {
                    error: format!("failed to register chat session: {e}"),
                    session_id: socket_session_id.to_owned(),
                })
                .await;
                return;
            }
        };

        tracing::info!(
            ws_session = socket_session_id,
            chat_session = %chat_session_id,
            provider = %payload.provider,
            "chat turn started"
        );
        send(&outbound, Frame::ChatSessionStart {
            chat_session_id: chat_session_id.clone(),
        })
        .await;
        // Let the frame reach the client before stage work begins, so the
        // cancel control can bind to the chat session id.
        tokio::task::yield_now().await;

        let result = self
            .run_turn_inner(&outbound, socket_session_id, &chat_session_id, &payload, &token)
            .await;

        match result {
            Ok(()) => {}
            Err(e) if e.is_cancelled() => {
                send(&outbound, Frame::Cancelled {
                    message: "Message generation was stopped".into(),
                    session_id: socket_session_id.to_owned(),
                })
                .await;
            }
            Err(e) => {
                tracing::error!(chat_session = %chat_session_id, error = %e, "turn failed");
                send(&outbound, Frame::Error {
                    error: e.to_string(),
                    session_id: socket_session_id.to_owned(),
                })
                .await;
            }
        }

        self.deps.sessions.complete(&chat_session_id);
        self.deps.sessions.remove(&chat_session_id);
    }

    /// The turn body. Returns `Err(Cancelled)` only while a `cancelled`
    /// frame is still due (before `done` went out).
    async fn run_turn_inner(
        &self,
        outbound: &mpsc::Sender<Frame>,
        socket_session_id: &str,
        chat_session_id: &str,
        payload: &ChatPayload,
        token: &Arc<CancellationToken>,
    ) -> Result<()> {
        let conversation_id = parse_uuid_opt(payload.conversation_id.as_deref(), "conversation")?;

        let persona: Option<Persona> = match payload.persona_id.as_deref() {
            Some(raw) => {
                let id = parse_uuid(raw, "persona")?;
                Some(self.deps.catalog.persona(id)?.ok_or_else(|| {
                    Error::Config(format!("persona {raw} not found or inactive"))
                })?)
            }
            None => None,
        };

        let provider = self.deps.providers.get(payload.provider)?;
        provider.validate(&payload.provider_settings)?;
        let controls = ChatControls::from_value(&payload.chat_controls);

        let mut prompt_state = self.track_prompt_state.then(|| {
            SystemPromptState::new(
                persona
                    .as_ref()
                    .map(|p| p.template.clone())
                    .unwrap_or_default(),
            )
        });

        let env = Arc::new(StageEnv {
            catalog: Arc::clone(&self.deps.catalog),
            store: Arc::clone(&self.deps.store),
            engine: Arc::clone(&self.deps.engine),
            token: Some(Arc::clone(token)),
            conversation_id,
            persona_id: persona.as_ref().map(|p| p.id),
            provider_name: payload.provider.to_string(),
            provider_settings: payload.provider_settings.clone(),
            chat_controls: payload.chat_controls.clone(),
            ai: Some(AiCapability {
                provider: Arc::clone(&provider),
                settings: payload.provider_settings.clone(),
                controls: controls.clone(),
                runtime: tokio::runtime::Handle::current(),
            }),
        });

        // ── Stages 1–2: resolve the system prompt ────────────────────
        send(outbound, Frame::StageUpdate {
            stage: ProcessingStage::ThinkingBefore,
            message: "Resolving system prompt...".into(),
        })
        .await;

        let mut resolved_prompt = String::new();
        if let Some(persona) = &persona {
            if !persona.template.is_empty() {
                let output = self
                    .resolve_prompt(Arc::clone(&env), persona.template.clone(), payload.message.clone())
                    .await?;

                for warning in &output.warnings {
                    tracing::warn!(
                        module = %warning.module,
                        kind = warning.kind.as_str(),
                        "{}",
                        warning.message
                    );
                }
                if let Some(state) = prompt_state.as_mut() {
                    state.record_stage(1, Some(&output.stage1_prompt), output.stage1_ms);
                    state.record_stage(2, Some(&output.resolved_prompt), output.stage2_ms);
                    state.record_resolved(&output.resolved_modules);
                    state.record_warnings(&output.warnings);
                }
                resolved_prompt = output.resolved_prompt;
            }
        }
        token.check()?;
        tracing::debug!(chars = resolved_prompt.len(), "system prompt resolved");

        // ── Stage 3: stream the main response ────────────────────────
        send(outbound, Frame::StageUpdate {
            stage: ProcessingStage::Generating,
            message: "Generating AI response...".into(),
        })
        .await;
        token.set_stage(3);

        let request = ChatRequest {
            system_prompt: resolved_prompt.clone(),
            user_message: payload.message.clone(),
            settings: payload.provider_settings.clone(),
            controls,
        };
        let mut stream = provider.stream(&request, Arc::clone(token)).await?;

        let mut content = String::new();
        let mut thinking = String::new();
        let mut metadata = Value::Object(Default::default());
        while let Some(item) = stream.next().await {
            let chunk = item?;
            if !chunk.content.is_empty() {
                content.push_str(&chunk.content);
            }
            if let Some(t) = &chunk.thinking {
                thinking.push_str(t);
            }
            if chunk.done {
                if let Some(m) = &chunk.metadata {
                    metadata = m.clone();
                }
            }
            send(outbound, Frame::Chunk {
                content: chunk.content,
                thinking: chunk.thinking,
                done: chunk.done,
                metadata: chunk.metadata,
            })
            .await;
        }
        // A silently dropped remainder means cancellation hit a chunk
        // boundary: the chunks already sent stand, `done` must not go out.
        token.check()?;

        send(outbound, Frame::Done {
            metadata: metadata.clone(),
        })
        .await;
        tracing::debug!(chars = content.len(), "main response complete");

        // ── Past `done`: failures stay local from here on ────────────
        if let Some(conversation) = conversation_id {
            let thinking_opt = (!thinking.is_empty()).then(|| thinking.clone());
            if let Err(e) = self
                .deps
                .store
                .append_message(conversation, Role::User, &payload.message, None)
            {
                tracing::error!(error = %e, "failed to persist user message");
            } else if let Err(e) =
                self.deps
                    .store
                    .append_message(conversation, Role::Assistant, &content, thinking_opt)
            {
                tracing::error!(error = %e, "failed to persist assistant message");
            }
        }

        // ── Stages 4–5: post-response modules ────────────────────────
        if let Some(persona) = &persona {
            send(outbound, Frame::StageUpdate {
                stage: ProcessingStage::ThinkingAfter,
                message: "Executing post-response modules...".into(),
            })
            .await;

            let env2 = Arc::clone(&env);
            let template = persona.template.clone();
            let user_message = payload.message.clone();
            let ai_message = content.clone();
            let token2 = Arc::clone(token);
            let post = tokio::task::spawn_blocking(move || {
                let trigger = TriggerContext::new(user_message).with_ai_message(ai_message);
                token2.set_stage(4);
                let mut stage4 = StageExecutor::new(&env2, 4, &trigger);
                let committed4 = stage4.run_post_response(&template, ExecutionStage::Stage4);
                token2.set_stage(5);
                let mut stage5 = StageExecutor::new(&env2, 5, &trigger);
                let committed5 = stage5.run_post_response(&template, ExecutionStage::Stage5);
                let mut warnings = stage4.warnings;
                warnings.extend(stage5.warnings);
                (committed4, committed5, warnings)
            })
            .await;

            match post {
                Ok((committed4, committed5, warnings)) => {
                    for warning in &warnings {
                        tracing::warn!(
                            module = %warning.module,
                            kind = warning.kind.as_str(),
                            "{}",
                            warning.message
                        );
                    }
                    if let Some(state) = prompt_state.as_mut() {
                        state.record_stage(4, None, 0);
                        state.record_stage(5, None, 0);
                        state.record_warnings(&warnings);
                        for (module, bag) in &committed4 {
                            state.record_post_response(4, module, bag);
                        }
                        for (module, bag) in &committed5 {
                            state.record_post_response(5, module, bag);
                        }
                    }
                    tracing::info!(
                        stage4 = committed4.len(),
                        stage5 = committed5.len(),
                        "post-response modules committed"
                    );
                }
                Err(e) => {
                    tracing::error!(error = %e, "post-response task panicked");
                }
            }
        }

        send(outbound, Frame::PostResponseComplete {
            message: "Background processing complete".into(),
            chat_session_id: chat_session_id.to_owned(),
        })
        .await;

        if let Some(state) = prompt_state {
            tracing::debug!(
                ws_session = socket_session_id,
                prompt_state = %state.to_value(),
                "turn prompt state"
            );
        }
        Ok(())
    }

    /// Run stages 1 and 2 on a blocking thread (scripts are synchronous
    /// and may block on AI calls).
    async fn resolve_prompt(
        &self,
        env: Arc<StageEnv>,
        template: String,
        user_message: String,
    ) -> Result<StagePassOutput> {
        let handle = tokio::task::spawn_blocking(move || -> Result<StagePassOutput> {
            let trigger = TriggerContext::new(user_message);

            if let Some(token) = &env.token {
                token.set_stage(1);
            }
            let started1 = Instant::now();
            let mut stage1 = StageExecutor::new(&env, 1, &trigger);
            let after_stage1 = stage1.resolve(&template)?;
            let stage1_ms = started1.elapsed().as_millis() as u64;

            if let Some(token) = &env.token {
                token.set_stage(2);
            }
            let started2 = Instant::now();
            let mut stage2 = StageExecutor::new(&env, 2, &trigger);
            let after_stage2 = stage2.resolve(&after_stage1)?;
            let resolved_prompt = stage2.finish(&after_stage2);
            let stage2_ms = started2.elapsed().as_millis() as u64;

            let mut warnings = stage1.warnings;
            warnings.extend(stage2.warnings);
            let mut resolved_modules = stage1.resolved;
            for name in stage2.resolved {
                if !resolved_modules.contains(&name) {
                    resolved_modules.push(name);
                }
            }

            Ok(StagePassOutput {
                resolved_prompt,
                warnings,
                resolved_modules,
                stage1_prompt: after_stage1,
                stage1_ms,
                stage2_ms,
            })
        });
        handle
            .await
            .map_err(|e| Error::Other(format!("stage task panicked: {e}")))?
    }
}

async fn send(outbound: &mpsc::Sender<Frame>, frame: Frame) {
    if outbound.send(frame).await.is_err() {
        // Connection gone; the manager already dropped the session.
        tracing::debug!("outbound channel closed, dropping frame");
    }
}

fn parse_uuid(raw: &str, what: &str) -> Result<Uuid> {
    Uuid::parse_str(raw).map_err(|_| Error::Config(format!("invalid {what} id '{raw}'")))
}

fn parse_uuid_opt(raw: Option<&str>, what: &str) -> Result<Option<Uuid>> {
    raw.map(|r| parse_uuid(r, what)).transpose()
}
