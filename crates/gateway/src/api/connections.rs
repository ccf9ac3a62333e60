//! REST endpoints that enter the provider client: connection tests and
//! model listing, plus a liveness probe.

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::Json;
use serde::Serialize;
use serde_json::{json, Value};

use weft_domain::frame::ProviderKind;
use weft_domain::Error;
use weft_providers::ModelInfo;

use crate::state::AppState;

#[derive(Serialize)]
pub struct ConnectionTestResponse {
    pub success: bool,
    pub message: String,
}

#[derive(Serialize)]
pub struct ModelsListResponse {
    pub models: Vec<ModelInfo>,
}

fn parse_provider(raw: &str) -> Result<ProviderKind, (StatusCode, Json<Value>)> {
    match raw {
        "ollama" => Ok(ProviderKind::Ollama),
        "openai" => Ok(ProviderKind::OpenAi),
        other => Err((
            StatusCode::NOT_FOUND,
            Json(json!({"error": format!("unknown provider '{other}'")})),
        )),
    }
}

fn error_response(e: Error) -> (StatusCode, Json<Value>) {
    let status = match &e {
        Error::Config(_) => StatusCode::BAD_REQUEST,
        Error::ProviderAuth { .. } => StatusCode::UNAUTHORIZED,
        Error::ProviderConnection { .. } => StatusCode::BAD_GATEWAY,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    (status, Json(json!({"error": e.to_string()})))
}

/// POST /api/connections/:provider/test — body: provider settings.
pub async fn test_connection(
    Path(provider): Path<String>,
    State(state): State<AppState>,
    Json(settings): Json<Value>,
) -> Result<Json<ConnectionTestResponse>, (StatusCode, Json<Value>)> {
    let kind = parse_provider(&provider)?;
    let adapter = state.providers.get(kind).map_err(error_response)?;
    adapter.validate(&settings).map_err(error_response)?;

    match adapter.test_connection(&settings).await {
        Ok(true) => Ok(Json(ConnectionTestResponse {
            success: true,
            message: format!("Successfully connected to {kind}"),
        })),
        Ok(false) => Ok(Json(ConnectionTestResponse {
            success: false,
            message: format!("Could not reach {kind}"),
        })),
        Err(e) => Err(error_response(e)),
    }
}

/// POST /api/connections/:provider/models — body: provider settings.
pub async fn list_models(
    Path(provider): Path<String>,
    State(state): State<AppState>,
    Json(settings): Json<Value>,
) -> Result<Json<ModelsListResponse>, (StatusCode, Json<Value>)> {
    let kind = parse_provider(&provider)?;
    let adapter = state.providers.get(kind).map_err(error_response)?;
    adapter.validate(&settings).map_err(error_response)?;

    let models = adapter.list_models(&settings).await.map_err(error_response)?;
    Ok(Json(ModelsListResponse { models }))
}

/// GET /api/health
pub async fn health(State(state): State<AppState>) -> Json<Value> {
    Json(json!({
        "status": "ok",
        "connections": state.connections.count(),
        "active_chat_sessions": state.sessions.active_count(),
    }))
}
