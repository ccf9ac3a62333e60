//! End-to-end turn tests against an in-memory store and a scripted mock
//! provider: frame ordering, cancellation mid-stream, and post-response
//! state carry-over across turns.

use std::sync::Arc;

use parking_lot::Mutex;
use serde_json::{json, Value};
use tokio::sync::{mpsc, Semaphore};
use uuid::Uuid;

use weft_domain::frame::{ChatPayload, Frame, ProcessingStage, ProviderKind};
use weft_domain::module::{ExecutionContext, Module, ModuleKind, Persona};
use weft_domain::stream::{BoxStream, ChatOutcome, StreamChunk};
use weft_domain::Result;
use weft_pipeline::{Orchestrator, TurnDeps};
use weft_providers::{ChatProvider, ChatRequest, ModelInfo, ProviderRegistry};
use weft_sandbox::ScriptEngine;
use weft_session::{CancellationToken, SessionRegistry};
use weft_store::MemoryStore;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Mock provider
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

struct MockProvider {
    chunks: Vec<StreamChunk>,
    /// When set, one permit is consumed per chunk — lets a test hold the
    /// stream at an exact chunk boundary.
    gate: Option<Arc<Semaphore>>,
    seen_prompts: Arc<Mutex<Vec<String>>>,
    fail_stream: bool,
}

impl MockProvider {
    fn scripted(chunks: Vec<StreamChunk>) -> Self {
        Self {
            chunks,
            gate: None,
            seen_prompts: Arc::new(Mutex::new(Vec::new())),
            fail_stream: false,
        }
    }

    fn text_chunks(parts: &[&str]) -> Vec<StreamChunk> {
        let mut chunks: Vec<StreamChunk> = parts
            .iter()
            .map(|part| StreamChunk {
                content: (*part).to_owned(),
                ..Default::default()
            })
            .collect();
        chunks.push(StreamChunk {
            done: true,
            metadata: Some(json!({"eval_count": parts.len()})),
            ..Default::default()
        });
        chunks
    }
}

#[async_trait::async_trait]
impl ChatProvider for MockProvider {
    fn kind(&self) -> ProviderKind {
        ProviderKind::Ollama
    }

    fn validate(&self, _settings: &Value) -> Result<()> {
        Ok(())
    }

    async fn send(
        &self,
        req: &ChatRequest,
        _token: Arc<CancellationToken>,
    ) -> Result<ChatOutcome> {
        Ok(ChatOutcome {
            content: format!("echo:{}", req.user_message),
            model: "mock".into(),
            provider: "ollama".into(),
            metadata: Value::Null,
            thinking: None,
        })
    }

    async fn stream(
        &self,
        req: &ChatRequest,
        token: Arc<CancellationToken>,
    ) -> Result<BoxStream<'static, Result<StreamChunk>>> {
        self.seen_prompts.lock().push(req.system_prompt.clone());
        if self.fail_stream {
            return Err(weft_domain::Error::ProviderConnection {
                provider: "ollama".into(),
                message: "connection refused".into(),
            });
        }
        let chunks = self.chunks.clone();
        let gate = self.gate.clone();
        Ok(Box::pin(async_stream::stream! {
            for chunk in chunks {
                if let Some(gate) = &gate {
                    gate.acquire().await.expect("gate open").forget();
                }
                if token.check().is_err() {
                    break;
                }
                yield Ok(chunk);
            }
        }))
    }

    async fn test_connection(&self, _settings: &Value) -> Result<bool> {
        Ok(true)
    }

    async fn list_models(&self, _settings: &Value) -> Result<Vec<ModelInfo>> {
        Ok(Vec::new())
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Fixture
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

struct Harness {
    orchestrator: Orchestrator,
    sessions: Arc<SessionRegistry>,
    store: MemoryStore,
    seen_prompts: Arc<Mutex<Vec<String>>>,
}

fn harness(provider: MockProvider) -> Harness {
    let store = MemoryStore::new();
    let sessions = Arc::new(SessionRegistry::default());
    let seen_prompts = Arc::clone(&provider.seen_prompts);

    let mut providers = ProviderRegistry::empty();
    providers.insert(ProviderKind::Ollama, Arc::new(provider));

    let deps = TurnDeps {
        catalog: Arc::new(store.clone()),
        store: Arc::new(store.clone()),
        providers: Arc::new(providers),
        sessions: Arc::clone(&sessions),
        engine: Arc::new(ScriptEngine::default()),
    };
    Harness {
        orchestrator: Orchestrator::new(deps),
        sessions,
        store,
        seen_prompts,
    }
}

fn persona_with_template(store: &MemoryStore, template: &str) -> Persona {
    let persona = Persona {
        id: Uuid::new_v4(),
        name: "Test".into(),
        template: template.into(),
        is_active: true,
    };
    store.insert_persona(persona.clone());
    persona
}

fn counter_module(store: &MemoryStore) -> Module {
    let module = Module {
        id: Uuid::new_v4(),
        name: "counter".into(),
        kind: ModuleKind::Advanced,
        execution_context: ExecutionContext::PostResponse,
        requires_ai: false,
        trigger_pattern: None,
        content: "n=${n}".into(),
        script: "let n = ctx.get_var(\"n\", 0) + 1;".into(),
        is_active: true,
        persona_id: None,
    };
    store.insert_module(module.clone());
    module
}

fn payload(persona: Option<&Persona>, conversation: Option<Uuid>) -> ChatPayload {
    ChatPayload {
        message: "hello".into(),
        provider: ProviderKind::Ollama,
        persona_id: persona.map(|p| p.id.to_string()),
        conversation_id: conversation.map(|c| c.to_string()),
        provider_settings: json!({"host": "http://mock", "model": "mock"}),
        chat_controls: json!({}),
    }
}

async fn drain(mut rx: mpsc::Receiver<Frame>) -> Vec<Frame> {
    let mut frames = Vec::new();
    while let Some(frame) = rx.recv().await {
        frames.push(frame);
    }
    frames
}

fn frame_kinds(frames: &[Frame]) -> Vec<&'static str> {
    frames
        .iter()
        .map(|f| match f {
            Frame::SessionStart { .. } => "session_start",
            Frame::ChatSessionStart { .. } => "chat_session_start",
            Frame::StageUpdate { stage, .. } => match stage {
                ProcessingStage::ThinkingBefore => "stage:thinking_before",
                ProcessingStage::Generating => "stage:generating",
                ProcessingStage::ThinkingAfter => "stage:thinking_after",
            },
            Frame::Chunk { done, .. } => {
                if *done {
                    "chunk:done"
                } else {
                    "chunk"
                }
            }
            Frame::Done { .. } => "done",
            Frame::PostResponseComplete { .. } => "post_response_complete",
            Frame::Cancelled { .. } => "cancelled",
            Frame::Error { .. } => "error",
            Frame::Pong => "pong",
        })
        .collect()
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tests
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[tokio::test(flavor = "multi_thread")]
async fn full_turn_emits_frames_in_order() {
    let h = harness(MockProvider::scripted(MockProvider::text_chunks(&[
        "Hel", "lo",
    ])));
    let persona = persona_with_template(&h.store, "Be kind.");
    let conversation = Uuid::new_v4();

    let (tx, rx) = mpsc::channel(64);
    h.orchestrator
        .run_turn(tx, "ws-1", payload(Some(&persona), Some(conversation)))
        .await;

    let frames = drain(rx).await;
    assert_eq!(
        frame_kinds(&frames),
        vec![
            "chat_session_start",
            "stage:thinking_before",
            "stage:generating",
            "chunk",
            "chunk",
            "chunk:done",
            "done",
            "stage:thinking_after",
            "post_response_complete",
        ]
    );

    // Both turn messages were persisted.
    use weft_store::StateStore;
    assert_eq!(h.store.message_count(conversation).unwrap(), 2);
    let messages = h.store.messages(conversation, 0, 10).unwrap();
    assert_eq!(messages[1].content, "Hello");

    // The session was completed and swept.
    assert_eq!(h.sessions.active_count(), 0);
}

#[tokio::test(flavor = "multi_thread")]
async fn turn_without_persona_skips_prompt_resolution() {
    let h = harness(MockProvider::scripted(MockProvider::text_chunks(&["x"])));
    let (tx, rx) = mpsc::channel(64);
    h.orchestrator.run_turn(tx, "ws-1", payload(None, None)).await;

    let frames = drain(rx).await;
    let kinds = frame_kinds(&frames);
    // The stage announcement still goes out, but no post-response stage
    // runs without a persona — omissions only at the tail.
    assert!(kinds.contains(&"stage:thinking_before"));
    assert!(!kinds.contains(&"stage:thinking_after"));
    assert!(kinds.contains(&"done"));
    // Empty system prompt reached the provider.
    assert_eq!(h.seen_prompts.lock().as_slice(), &[String::new()]);
}

#[tokio::test(flavor = "multi_thread")]
async fn cancel_mid_stream_keeps_sent_chunks_and_never_sends_done() {
    let gate = Arc::new(Semaphore::new(2));
    let mut provider = MockProvider::scripted(MockProvider::text_chunks(&["a", "b", "c"]));
    provider.gate = Some(Arc::clone(&gate));
    let h = harness(provider);
    let persona = persona_with_template(&h.store, "Short.");

    let (tx, mut rx) = mpsc::channel(64);
    let orchestrator = h.orchestrator;
    let turn_payload = payload(Some(&persona), None);
    let turn = tokio::spawn(async move {
        orchestrator.run_turn(tx, "ws-1", turn_payload).await;
    });

    // Read frames until the second content chunk has arrived.
    let mut seen = Vec::new();
    let mut chat_session_id = String::new();
    let mut chunk_count = 0;
    while let Some(frame) = rx.recv().await {
        if let Frame::ChatSessionStart { chat_session_id: id } = &frame {
            chat_session_id = id.clone();
        }
        if matches!(frame, Frame::Chunk { .. }) {
            chunk_count += 1;
        }
        seen.push(frame);
        if chunk_count == 2 {
            break;
        }
    }

    // Cancel via the registry — the single source of truth — then let the
    // provider attempt the remaining chunks.
    assert!(h.sessions.cancel(&chat_session_id));
    gate.add_permits(10);

    while let Some(frame) = rx.recv().await {
        seen.push(frame);
    }
    turn.await.unwrap();

    let kinds = frame_kinds(&seen);
    assert!(!kinds.contains(&"done"), "no done after cancel: {kinds:?}");
    assert_eq!(
        kinds.iter().filter(|k| **k == "cancelled").count(),
        1,
        "exactly one cancelled frame: {kinds:?}"
    );
    // Two chunks went out before the cancel; at most one more after.
    let chunk_total = kinds.iter().filter(|k| k.starts_with("chunk")).count();
    assert!(chunk_total <= 3, "too many chunks after cancel: {kinds:?}");
    assert_eq!(kinds.last().unwrap(), &"cancelled");
}

#[tokio::test(flavor = "multi_thread")]
async fn post_response_state_carries_over_turns() {
    let h = harness(MockProvider::scripted(MockProvider::text_chunks(&["ok"])));
    let persona = persona_with_template(&h.store, "@counter");
    let module = counter_module(&h.store);
    let conversation = Uuid::new_v4();

    for _ in 0..3 {
        let (tx, rx) = mpsc::channel(64);
        h.orchestrator
            .run_turn(tx, "ws-1", payload(Some(&persona), Some(conversation)))
            .await;
        let frames = drain(rx).await;
        assert!(frame_kinds(&frames).contains(&"post_response_complete"));
    }

    // Stage 1 of each turn injected the previous turn's counter value.
    assert_eq!(
        h.seen_prompts.lock().as_slice(),
        &["n=".to_string(), "n=1".to_string(), "n=2".to_string()]
    );

    use weft_store::StateStore;
    let stored = h.store.latest_state(conversation, module.id).unwrap().unwrap();
    assert_eq!(stored["n"], json!(3));
}

#[tokio::test(flavor = "multi_thread")]
async fn provider_failure_surfaces_as_error_frame() {
    let mut provider = MockProvider::scripted(Vec::new());
    provider.fail_stream = true;
    let h = harness(provider);

    let (tx, rx) = mpsc::channel(64);
    h.orchestrator.run_turn(tx, "ws-1", payload(None, None)).await;

    let frames = drain(rx).await;
    let kinds = frame_kinds(&frames);
    assert!(kinds.contains(&"error"));
    assert!(!kinds.contains(&"done"));
    assert_eq!(h.sessions.active_count(), 0);
}

#[tokio::test(flavor = "multi_thread")]
async fn unknown_persona_aborts_with_error() {
    let h = harness(MockProvider::scripted(MockProvider::text_chunks(&["x"])));
    let mut p = payload(None, None);
    p.persona_id = Some(Uuid::new_v4().to_string());

    let (tx, rx) = mpsc::channel(64);
    h.orchestrator.run_turn(tx, "ws-1", p).await;

    let frames = drain(rx).await;
    let kinds = frame_kinds(&frames);
    assert!(kinds.contains(&"error"));
    assert!(!kinds.contains(&"stage:generating"));
}

#[tokio::test(flavor = "multi_thread")]
async fn escaped_and_missing_refs_resolve_per_contract() {
    let h = harness(MockProvider::scripted(MockProvider::text_chunks(&["x"])));
    let persona = persona_with_template(&h.store, r"Hi \@user, see @nope");

    let (tx, rx) = mpsc::channel(64);
    h.orchestrator
        .run_turn(tx, "ws-1", payload(Some(&persona), None))
        .await;
    drain(rx).await;

    // Escape unescaped; missing module ref left literally in place.
    assert_eq!(
        h.seen_prompts.lock().as_slice(),
        &["Hi @user, see @nope".to_string()]
    );
}

#[tokio::test(flavor = "multi_thread")]
async fn stage2_ai_module_enriches_prompt() {
    let h = harness(MockProvider::scripted(MockProvider::text_chunks(&["x"])));
    let persona = persona_with_template(&h.store, "@enricher");
    h.store.insert_module(Module {
        id: Uuid::new_v4(),
        name: "enricher".into(),
        kind: ModuleKind::Advanced,
        execution_context: ExecutionContext::Immediate,
        requires_ai: true,
        trigger_pattern: None,
        content: "context: ${summary}".into(),
        script: r#"let summary = ctx.ask_ai("summarize");"#.into(),
        is_active: true,
        persona_id: None,
    });

    let (tx, rx) = mpsc::channel(64);
    h.orchestrator
        .run_turn(tx, "ws-1", payload(Some(&persona), None))
        .await;
    drain(rx).await;

    // The mock's send() echoes the prompt it was asked.
    assert_eq!(
        h.seen_prompts.lock().as_slice(),
        &["context: echo:summarize".to_string()]
    );
}
