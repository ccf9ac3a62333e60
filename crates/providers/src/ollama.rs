//! Generate-style adapter (Ollama wire dialect).
//!
//! Streams newline-delimited JSON. Chunks carry `message.{content,
//! thinking}` and a top-level `done`; the final chunk adds the timing and
//! token-count metrics.

use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;
use serde_json::{json, Value};

use weft_domain::frame::ProviderKind;
use weft_domain::stream::{BoxStream, ChatOutcome, StreamChunk};
use weft_domain::{Error, Result};
use weft_session::CancellationToken;

use crate::lines::chunk_stream;
use crate::traits::{ChatProvider, ChatRequest, ModelInfo};
use crate::util::{from_reqwest, from_status};

const PROVIDER: &str = "ollama";

/// Metric keys copied from the final chunk into response metadata.
const METRIC_KEYS: &[&str] = &[
    "total_duration",
    "load_duration",
    "prompt_eval_count",
    "prompt_eval_duration",
    "eval_count",
    "eval_duration",
];

/// Settings the generate-style adapter requires from the client.
#[derive(Debug, Clone, Deserialize)]
pub struct OllamaSettings {
    pub host: String,
    pub model: String,
}

impl OllamaSettings {
    pub fn parse(settings: &Value) -> Result<Self> {
        let parsed: OllamaSettings = serde_json::from_value(settings.clone())
            .map_err(|e| Error::Config(format!("ollama settings: {e}")))?;
        if parsed.host.trim().is_empty() {
            return Err(Error::Config("ollama settings: host must not be empty".into()));
        }
        if parsed.model.trim().is_empty() {
            return Err(Error::Config("ollama settings: model must not be empty".into()));
        }
        Ok(parsed)
    }

    fn base(&self) -> &str {
        self.host.trim_end_matches('/')
    }
}

/// Generate-style provider client.
pub struct OllamaProvider {
    client: reqwest::Client,
}

impl OllamaProvider {
    pub fn new(request_timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(request_timeout)
            .build()
            .map_err(|e| from_reqwest(PROVIDER, e))?;
        Ok(Self { client })
    }

    // ── Pure request builders ──────────────────────────────────────

    pub fn build_url(settings: &OllamaSettings) -> String {
        format!("{}/api/chat", settings.base())
    }

    pub fn build_payload(req: &ChatRequest, settings: &OllamaSettings, stream: bool) -> Value {
        let mut messages = Vec::new();
        if !req.system_prompt.is_empty() {
            messages.push(json!({"role": "system", "content": req.system_prompt}));
        }
        messages.push(json!({"role": "user", "content": req.user_message}));

        let mut options = serde_json::Map::new();
        if let Some(t) = req.controls.temperature {
            options.insert("temperature".into(), json!(t));
        }
        if let Some(n) = req.controls.max_tokens {
            options.insert("num_predict".into(), json!(n));
        }
        if let Some(p) = req.controls.top_p {
            options.insert("top_p".into(), json!(p));
        }

        let mut payload = json!({
            "model": settings.model,
            "messages": messages,
            "stream": stream,
        });
        if !options.is_empty() {
            payload["options"] = Value::Object(options);
        }
        payload
    }

    // ── Pure response parsers ──────────────────────────────────────

    pub fn parse_response(body: &Value) -> Result<ChatOutcome> {
        let content = body
            .pointer("/message/content")
            .and_then(Value::as_str)
            .ok_or_else(|| Error::ProviderConnection {
                provider: PROVIDER.into(),
                message: "response missing message content".into(),
            })?
            .to_owned();
        let thinking = body
            .pointer("/message/thinking")
            .and_then(Value::as_str)
            .map(str::to_owned);
        let model = body
            .get("model")
            .and_then(Value::as_str)
            .unwrap_or("unknown")
            .to_owned();

        Ok(ChatOutcome {
            content,
            model,
            provider: PROVIDER.into(),
            metadata: extract_metadata(body),
            thinking,
        })
    }

    /// Parse one NDJSON line; `None` for blanks and malformed chunks
    /// (logged and skipped without aborting the stream).
    pub fn parse_chunk(line: &str) -> Option<StreamChunk> {
        let line = line.trim();
        if line.is_empty() {
            return None;
        }
        let value: Value = match serde_json::from_str(line) {
            Ok(v) => v,
            Err(e) => {
                tracing::warn!(error = %e, "skipping malformed generate chunk");
                return None;
            }
        };

        let done = value.get("done").and_then(Value::as_bool).unwrap_or(false);
        let content = value
            .pointer("/message/content")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_owned();
        let thinking = value
            .pointer("/message/thinking")
            .and_then(Value::as_str)
            .map(str::to_owned);

        Some(StreamChunk {
            content,
            thinking,
            done,
            metadata: done.then(|| extract_metadata(&value)),
        })
    }
}

fn extract_metadata(value: &Value) -> Value {
    let mut metadata = serde_json::Map::new();
    if let Some(created) = value.get("created_at") {
        metadata.insert("created_at".into(), created.clone());
    }
    if let Some(model) = value.get("model") {
        metadata.insert("model".into(), model.clone());
    }
    for key in METRIC_KEYS {
        if let Some(v) = value.get(*key) {
            metadata.insert((*key).to_owned(), v.clone());
        }
    }
    Value::Object(metadata)
}

#[async_trait::async_trait]
impl ChatProvider for OllamaProvider {
    fn kind(&self) -> ProviderKind {
        ProviderKind::Ollama
    }

    fn validate(&self, settings: &Value) -> Result<()> {
        OllamaSettings::parse(settings).map(|_| ())
    }

    async fn send(&self, req: &ChatRequest, token: Arc<CancellationToken>) -> Result<ChatOutcome> {
        let settings = OllamaSettings::parse(&req.settings)?;
        let url = Self::build_url(&settings);
        let payload = Self::build_payload(req, &settings, false);

        tracing::debug!(url = %url, model = %settings.model, "generate request");
        let _op = token.enter_operation()?;

        let resp = self
            .client
            .post(&url)
            .json(&payload)
            .send()
            .await
            .map_err(|e| from_reqwest(PROVIDER, e))?;

        let status = resp.status();
        let text = resp.text().await.map_err(|e| from_reqwest(PROVIDER, e))?;
        if !status.is_success() {
            return Err(from_status(PROVIDER, status, &text));
        }

        let body: Value = serde_json::from_str(&text)?;
        let mut outcome = Self::parse_response(&body)?;
        outcome.metadata["debug"] = json!({
            "request_payload": payload,
            "raw_response": body,
        });
        Ok(outcome)
    }

    async fn stream(
        &self,
        req: &ChatRequest,
        token: Arc<CancellationToken>,
    ) -> Result<BoxStream<'static, Result<StreamChunk>>> {
        let settings = OllamaSettings::parse(&req.settings)?;
        let url = Self::build_url(&settings);
        let payload = Self::build_payload(req, &settings, true);

        tracing::debug!(url = %url, model = %settings.model, "generate stream request");
        token.check()?;

        let resp = self
            .client
            .post(&url)
            .json(&payload)
            .send()
            .await
            .map_err(|e| from_reqwest(PROVIDER, e))?;

        let status = resp.status();
        if !status.is_success() {
            let text = resp.text().await.unwrap_or_default();
            return Err(from_status(PROVIDER, status, &text));
        }

        Ok(chunk_stream(PROVIDER, resp, token, Self::parse_chunk))
    }

    async fn test_connection(&self, settings: &Value) -> Result<bool> {
        let settings = OllamaSettings::parse(settings)?;
        let url = format!("{}/api/tags", settings.base());
        match self.client.get(&url).send().await {
            Ok(resp) => Ok(resp.status().is_success()),
            Err(e) => {
                tracing::debug!(error = %e, "generate connection test failed");
                Ok(false)
            }
        }
    }

    async fn list_models(&self, settings: &Value) -> Result<Vec<ModelInfo>> {
        let settings = OllamaSettings::parse(settings)?;
        let url = format!("{}/api/tags", settings.base());

        let resp = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| from_reqwest(PROVIDER, e))?;
        let status = resp.status();
        let text = resp.text().await.map_err(|e| from_reqwest(PROVIDER, e))?;
        if !status.is_success() {
            return Err(from_status(PROVIDER, status, &text));
        }

        let body: Value = serde_json::from_str(&text)?;
        Ok(body
            .get("models")
            .and_then(Value::as_array)
            .map(|models| {
                models
                    .iter()
                    .filter_map(|m| {
                        Some(ModelInfo {
                            name: m.get("name")?.as_str()?.to_owned(),
                            details: m.get("details").cloned().unwrap_or(Value::Null),
                        })
                    })
                    .collect()
            })
            .unwrap_or_default())
    }
}
