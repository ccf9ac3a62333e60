//! Chat-completion-style adapter (OpenAI wire dialect).
//!
//! Streams SSE: one `data: <json>` payload per line, terminated by
//! `data: [DONE]`. Chunks carry `choices[0].delta.{content, reasoning}`
//! and `choices[0].finish_reason`.

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

const PROVIDER: &str = "openai";
const DEFAULT_BASE_URL: &str = "https://api.openai.com/v1";

/// Model-name patterns that select the reasoning dialect.
const REASONING_PATTERNS: &[&str] = &["o1-", "reasoning", "think"];

/// Settings the chat-completion-style adapter requires from the client.
#[derive(Debug, Clone, Deserialize)]
pub struct OpenAiSettings {
    pub api_key: String,
    pub model: String,
    #[serde(default)]
    pub base_url: Option<String>,
    #[serde(default)]
    pub organization: Option<String>,
    #[serde(default)]
    pub project: Option<String>,
}

impl OpenAiSettings {
    pub fn parse(settings: &Value) -> Result<Self> {
        let parsed: OpenAiSettings = serde_json::from_value(settings.clone())
            .map_err(|e| Error::Config(format!("openai settings: {e}")))?;
        if parsed.api_key.trim().is_empty() {
            return Err(Error::Config("openai settings: api_key must not be empty".into()));
        }
        if parsed.model.trim().is_empty() {
            return Err(Error::Config("openai settings: model must not be empty".into()));
        }
        Ok(parsed)
    }

    fn base(&self) -> String {
        self.base_url
            .as_deref()
            .unwrap_or(DEFAULT_BASE_URL)
            .trim_end_matches('/')
            .to_owned()
    }
}

/// Chat-completion-style provider client.
pub struct OpenAiProvider {
    client: reqwest::Client,
}

impl OpenAiProvider {
    pub fn new(request_timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(request_timeout)
            .build()
            .map_err(|e| from_reqwest(PROVIDER, e))?;
        Ok(Self { client })
    }

    // ── Pure request builders ──────────────────────────────────────

    pub fn build_url(settings: &OpenAiSettings) -> String {
        format!("{}/chat/completions", settings.base())
    }

    pub fn build_headers(settings: &OpenAiSettings) -> Vec<(&'static str, String)> {
        let mut headers = vec![
            ("Authorization", format!("Bearer {}", settings.api_key)),
            ("Content-Type", "application/json".to_owned()),
        ];
        if let Some(org) = &settings.organization {
            headers.push(("OpenAI-Organization", org.clone()));
        }
        if let Some(project) = &settings.project {
            headers.push(("OpenAI-Project", project.clone()));
        }
        headers
    }

    /// True when the request should use the reasoning-model dialect:
    /// either the model name matches a known pattern, or the client set
    /// the `reasoning` toggle.
    pub fn is_reasoning_model(model: &str, req: &ChatRequest) -> bool {
        if req.controls.reasoning == Some(true) {
            return true;
        }
        let model = model.to_lowercase();
        REASONING_PATTERNS.iter().any(|p| model.contains(p))
    }

    pub fn build_payload(req: &ChatRequest, settings: &OpenAiSettings, stream: bool) -> Value {
        let mut messages = Vec::new();
        if !req.system_prompt.is_empty() {
            messages.push(json!({"role": "system", "content": req.system_prompt}));
        }
        messages.push(json!({"role": "user", "content": req.user_message}));

        let mut payload = json!({
            "model": settings.model,
            "messages": messages,
            "stream": stream,
        });

        let reasoning = Self::is_reasoning_model(&settings.model, req);
        if let Some(max) = req.controls.max_tokens {
            // Reasoning models reject `max_tokens`.
            let key = if reasoning { "max_completion_tokens" } else { "max_tokens" };
            payload[key] = json!(max);
        }
        if reasoning {
            if let Some(effort) = &req.controls.reasoning_effort {
                if matches!(effort.as_str(), "low" | "medium" | "high") {
                    payload["reasoning_effort"] = json!(effort);
                }
            }
        } else {
            if let Some(t) = req.controls.temperature {
                payload["temperature"] = json!(t);
            }
            if let Some(p) = req.controls.top_p {
                payload["top_p"] = json!(p);
            }
        }
        payload
    }

    // ── Pure response parsers ──────────────────────────────────────

    pub fn parse_response(body: &Value) -> Result<ChatOutcome> {
        let choice = body
            .pointer("/choices/0")
            .ok_or_else(|| Error::ProviderConnection {
                provider: PROVIDER.into(),
                message: "no choices in response".into(),
            })?;
        let content = choice
            .pointer("/message/content")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_owned();
        let thinking = choice
            .pointer("/message/reasoning")
            .and_then(Value::as_str)
            .map(str::to_owned);
        let model = body
            .get("model")
            .and_then(Value::as_str)
            .unwrap_or("unknown")
            .to_owned();

        let mut metadata = serde_json::Map::new();
        if let Some(usage) = body.get("usage") {
            metadata.insert("usage".into(), usage.clone());
        }
        if let Some(fr) = choice.get("finish_reason") {
            metadata.insert("finish_reason".into(), fr.clone());
        }
        metadata.insert("model".into(), json!(model));

        Ok(ChatOutcome {
            content,
            model,
            provider: PROVIDER.into(),
            metadata: Value::Object(metadata),
            thinking,
        })
    }

    /// Parse one SSE line. Returns `None` for framing noise (blank lines,
    /// non-`data:` fields, `[DONE]`, malformed JSON).
    pub fn parse_chunk(line: &str) -> Option<StreamChunk> {
        let line = line.trim();
        let data = line.strip_prefix("data:").map(str::trim).unwrap_or(line);
        if data.is_empty() || data == "[DONE]" {
            return None;
        }
        // Lines without the data: prefix that are not JSON are SSE field
        // noise (`event:`, `id:`, ...).
        let value: Value = match serde_json::from_str(data) {
            Ok(v) => v,
            Err(e) => {
                if line.starts_with("data:") {
                    tracing::warn!(error = %e, "skipping malformed completion chunk");
                }
                return None;
            }
        };

        let choice = value.pointer("/choices/0")?;
        let finish_reason = choice
            .get("finish_reason")
            .and_then(Value::as_str)
            .map(str::to_owned);

        let content = choice
            .pointer("/delta/content")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_owned();
        let thinking = choice
            .pointer("/delta/reasoning")
            .and_then(Value::as_str)
            .map(str::to_owned);

        let done = finish_reason.is_some();
        let metadata = done.then(|| {
            let mut metadata = serde_json::Map::new();
            metadata.insert("finish_reason".into(), json!(finish_reason));
            if let Some(model) = value.get("model") {
                metadata.insert("model".into(), model.clone());
            }
            if let Some(usage) = value.get("usage") {
                metadata.insert("usage".into(), usage.clone());
            }
            Value::Object(metadata)
        });

        Some(StreamChunk {
            content,
            thinking,
            done,
            metadata,
        })
    }

    fn authed_post(&self, url: &str, settings: &OpenAiSettings) -> reqwest::RequestBuilder {
        let mut builder = self.client.post(url);
        for (name, value) in Self::build_headers(settings) {
            builder = builder.header(name, value);
        }
        builder
    }

    fn authed_get(&self, url: &str, settings: &OpenAiSettings) -> reqwest::RequestBuilder {
        let mut builder = self.client.get(url);
        for (name, value) in Self::build_headers(settings) {
            builder = builder.header(name, value);
        }
        builder
    }
}

#[async_trait::async_trait]
impl ChatProvider for OpenAiProvider {
    fn kind(&self) -> ProviderKind {
        ProviderKind::OpenAi
    }

    fn validate(&self, settings: &Value) -> Result<()> {
        OpenAiSettings::parse(settings).map(|_| ())
    }

    async fn send(&self, req: &ChatRequest, token: Arc<CancellationToken>) -> Result<ChatOutcome> {
        let settings = OpenAiSettings::parse(&req.settings)?;
        let url = Self::build_url(&settings);
        let payload = Self::build_payload(req, &settings, false);

        tracing::debug!(url = %url, model = %settings.model, "completion request");
        let _op = token.enter_operation()?;

        let resp = self
            .authed_post(&url, &settings)
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
        let settings = OpenAiSettings::parse(&req.settings)?;
        let url = Self::build_url(&settings);
        let payload = Self::build_payload(req, &settings, true);

        tracing::debug!(url = %url, model = %settings.model, "completion stream request");
        token.check()?;

        let resp = self
            .authed_post(&url, &settings)
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
        let settings = OpenAiSettings::parse(settings)?;
        let url = format!("{}/models", settings.base());
        match self.authed_get(&url, &settings).send().await {
            Ok(resp) if resp.status() == reqwest::StatusCode::UNAUTHORIZED => {
                Err(Error::ProviderAuth {
                    provider: PROVIDER.into(),
                })
            }
            Ok(resp) => Ok(resp.status().is_success()),
            Err(e) => {
                tracing::debug!(error = %e, "completion connection test failed");
                Ok(false)
            }
        }
    }

    async fn list_models(&self, settings: &Value) -> Result<Vec<ModelInfo>> {
        let settings = OpenAiSettings::parse(settings)?;
        let url = format!("{}/models", settings.base());

        let resp = self
            .authed_get(&url, &settings)
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
            .get("data")
            .and_then(Value::as_array)
            .map(|models| {
                models
                    .iter()
                    .filter_map(|m| {
                        Some(ModelInfo {
                            name: m.get("id")?.as_str()?.to_owned(),
                            details: m.get("owned_by").cloned().unwrap_or(Value::Null),
                        })
                    })
                    .collect()
            })
            .unwrap_or_default())
    }
}
