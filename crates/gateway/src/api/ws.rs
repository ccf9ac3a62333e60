//! WebSocket chat endpoint.
//!
//! Flow:
//! 1. Client connects to `/ws/chat`; the gateway registers the socket and
//!    immediately sends `session_start`.
//! 2. Inbound messages are dispatched sequentially: `chat` spawns an
//!    independent turn task (so a later `cancel` frame can overtake it),
//!    `cancel` resolves against the session registry, `ping` answers
//!    `pong` synchronously. Unknown types are logged and ignored.
//! 3. One socket serves many sequential turns, each with its own
//!    chat-session id and cancellation token.

use axum::extract::ws::{Message, WebSocket};
use axum::extract::{State, WebSocketUpgrade};
use axum::response::IntoResponse;
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;

use weft_domain::frame::{ClientMessage, Frame};

use crate::state::AppState;

/// GET /ws/chat — upgrade to WebSocket.
pub async fn chat_ws(ws: WebSocketUpgrade, State(state): State<AppState>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(socket: WebSocket, state: AppState) {
    let session_id = uuid::Uuid::new_v4().to_string();
    let (mut ws_sink, mut ws_stream) = socket.split();

    // Writer task: the single write path for this connection. Frames from
    // concurrent turn tasks serialize through this channel.
    let (outbound_tx, mut outbound_rx) = mpsc::channel::<Frame>(64);
    state.connections.register(&session_id, outbound_tx.clone());

    let writer_session = session_id.clone();
    let writer = tokio::spawn(async move {
        while let Some(frame) = outbound_rx.recv().await {
            let json = match serde_json::to_string(&frame) {
                Ok(json) => json,
                Err(e) => {
                    tracing::error!(session_id = %writer_session, error = %e, "frame serialization failed");
                    continue;
                }
            };
            if ws_sink.send(Message::Text(json)).await.is_err() {
                break;
            }
        }
    });

    state
        .connections
        .send(&session_id, Frame::SessionStart {
            session_id: session_id.clone(),
        })
        .await;

    // Reader loop: sequential dispatch of inbound messages.
    while let Some(Ok(msg)) = ws_stream.next().await {
        match msg {
            Message::Text(text) => {
                let parsed: ClientMessage = match serde_json::from_str(&text) {
                    Ok(parsed) => parsed,
                    Err(e) => {
                        tracing::warn!(session_id = %session_id, error = %e, "unparseable message");
                        continue;
                    }
                };
                dispatch(&state, &session_id, &outbound_tx, parsed).await;
            }
            Message::Close(_) => break,
            // axum answers WS-level ping/pong automatically.
            _ => {}
        }
    }

    writer.abort();
    state.connections.remove(&session_id);
}

async fn dispatch(
    state: &AppState,
    session_id: &str,
    outbound: &mpsc::Sender<Frame>,
    message: ClientMessage,
) {
    match message {
        ClientMessage::Chat { data } => {
            if data.message.is_empty() {
                state
                    .connections
                    .send(session_id, Frame::Error {
                        error: "No message provided".into(),
                        session_id: session_id.to_owned(),
                    })
                    .await;
                return;
            }
            // Independent task per turn: the reader loop stays free to
            // receive a cancel frame while the turn runs.
            let orchestrator = state.orchestrator.clone();
            let outbound = outbound.clone();
            let ws_session = session_id.to_owned();
            tokio::spawn(async move {
                orchestrator.run_turn(outbound, &ws_session, data).await;
            });
        }
        ClientMessage::Cancel { session_id: chat_session_id } => {
            handle_cancel(state, session_id, &chat_session_id).await;
        }
        ClientMessage::Ping => {
            state.connections.send(session_id, Frame::Pong).await;
        }
        ClientMessage::Unknown => {
            tracing::warn!(session_id, "ignoring unknown message type");
        }
    }
}

/// Resolve a `cancel` frame against the registry. The turn itself emits
/// the single `cancelled` frame when it observes the token; an unknown or
/// already-finished chat session answers with an `error` frame.
async fn handle_cancel(state: &AppState, ws_session_id: &str, chat_session_id: &str) {
    tracing::info!(ws_session_id, chat_session_id, "cancel requested");
    if !state.sessions.cancel(chat_session_id) {
        state
            .connections
            .send(ws_session_id, Frame::Error {
                error: "Session not found or already finished".into(),
                session_id: ws_session_id.to_owned(),
            })
            .await;
    }
}
