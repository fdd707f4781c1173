//! Terminal API routes
//!
//! The WebSocket terminal channel plus REST endpoints for inspecting and
//! closing sessions.

use std::time::Duration;

use axum::extract::ws::{close_code, CloseFrame, Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::IntoResponse;
use axum::routing::{any, delete, get};
use axum::{Json, Router};
use futures::stream::SplitSink;
use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio::time;
use tracing::{debug, error, info, warn};

use super::process::TerminalSize;
use super::types::{
    ClientChannel, ClientEnd, ClientInput, ClientMessage, ServerMessage, SessionInfo,
    TerminalEvent,
};
use crate::auth::{bearer_token, AuthError, Identity};
use crate::errors::{ErrorBody, LiveError, LiveResult};
use crate::service::AppState;

/// How long a new socket may take to send its `init` message.
const INIT_TIMEOUT: Duration = Duration::from_secs(10);
const CLIENT_CHANNEL_SIZE: usize = 256;

/// Build terminal routes
pub fn terminal_routes() -> Router<AppState> {
    Router::new()
        .route("/api/terminal-session", any(terminal_websocket))
        .route("/api/terminal/sessions", get(list_sessions))
        .route("/api/terminal/sessions/{session_id}", delete(close_session))
}

fn authorize(state: &AppState, headers: &HeaderMap) -> LiveResult<Identity> {
    let header_value = headers
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok());
    let token = bearer_token(header_value).ok_or(AuthError::Missing)?;
    Ok(state.validator.verify(token)?)
}

/// List active terminal sessions
#[utoipa::path(
    get,
    path = "/api/terminal/sessions",
    tag = "terminal",
    responses(
        (status = 200, description = "Active terminal sessions", body = [SessionInfo]),
        (status = 401, description = "Missing or invalid token", body = ErrorBody)
    )
)]
pub async fn list_sessions(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> LiveResult<Json<Vec<SessionInfo>>> {
    authorize(&state, &headers)?;
    Ok(Json(state.sessions.list()))
}

/// Close a terminal session
#[utoipa::path(
    delete,
    path = "/api/terminal/sessions/{session_id}",
    tag = "terminal",
    params(
        ("session_id" = String, Path, description = "Terminal session ID")
    ),
    responses(
        (status = 204, description = "Session closed or already gone"),
        (status = 401, description = "Missing or invalid token", body = ErrorBody)
    )
)]
pub async fn close_session(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
    headers: HeaderMap,
) -> LiveResult<StatusCode> {
    let identity = authorize(&state, &headers)?;
    let closed = state.sessions.close(&session_id).await;
    info!(
        "[terminal] Close requested for {} by {} (was open: {})",
        session_id, identity.user_id, closed
    );
    Ok(StatusCode::NO_CONTENT)
}

async fn terminal_websocket(State(state): State<AppState>, ws: WebSocketUpgrade) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_terminal_websocket(socket, state))
}

fn text(message: &ServerMessage) -> Message {
    match serde_json::to_string(message) {
        Ok(json) => Message::Text(json.into()),
        Err(e) => {
            error!("[ws] Failed to serialize server message: {}", e);
            Message::Text("{\"type\":\"error\",\"code\":\"INTERNAL_ERROR\"}".into())
        }
    }
}

fn error_message(err: &LiveError) -> ServerMessage {
    ServerMessage::Error {
        code: err.code().to_string(),
        error: err.to_string(),
    }
}

/// Wait for `{"type":"init", ...}`. Anything else first is a protocol error.
async fn read_init(socket: &mut WebSocket) -> LiveResult<(String, String)> {
    let next = time::timeout(INIT_TIMEOUT, socket.recv())
        .await
        .map_err(|_| LiveError::InvalidRequest("no init message received".into()))?;
    let raw = match next {
        Some(Ok(Message::Text(raw))) => raw,
        Some(Ok(_)) => {
            return Err(LiveError::InvalidRequest(
                "first message must be a text init message".into(),
            ))
        }
        Some(Err(_)) | None => return Err(LiveError::TransportClosed),
    };
    match serde_json::from_str::<ClientMessage>(raw.as_str()) {
        Ok(ClientMessage::Init {
            auth_token,
            host_ref,
        }) => Ok((auth_token, host_ref)),
        Ok(_) => Err(LiveError::InvalidRequest(
            "first message must be init".into(),
        )),
        Err(e) => Err(LiveError::InvalidRequest(format!("malformed init: {e}"))),
    }
}

async fn reject(mut socket: WebSocket, err: &LiveError) {
    let _ = socket.send(text(&error_message(err))).await;
    let _ = socket
        .send(Message::Close(Some(CloseFrame {
            code: close_code::POLICY,
            reason: err.code().into(),
        })))
        .await;
}

async fn handle_terminal_websocket(mut socket: WebSocket, state: AppState) {
    let (token, host_ref) = match read_init(&mut socket).await {
        Ok(init) => init,
        Err(LiveError::TransportClosed) => return,
        Err(e) => {
            warn!("[ws] Rejected terminal socket: {}", e);
            reject(socket, &e).await;
            return;
        }
    };

    let session_id = match state.sessions.open(&host_ref, &token).await {
        Ok(id) => id,
        Err(e) => {
            warn!("[ws] Failed to open session for {}: {}", host_ref, e);
            reject(socket, &e).await;
            return;
        }
    };

    let (channel, client) = ClientChannel::pair(CLIENT_CHANNEL_SIZE);
    if let Err(e) = state.sessions.attach(&session_id, channel) {
        error!("[ws:{}] Attach failed: {}", session_id, e);
        reject(socket, &e).await;
        state.sessions.close(&session_id).await;
        return;
    }

    let connected = ServerMessage::Connected {
        session_id: session_id.clone(),
        host_ref,
    };
    if socket.send(text(&connected)).await.is_err() {
        // Dropping the client end tears the session down.
        return;
    }
    info!("[ws:{}] Terminal WebSocket connected", session_id);

    bridge(socket, client, &session_id).await;
    info!("[ws:{}] Terminal WebSocket finished", session_id);
}

/// Shuttle frames until either side ends. Dropping `client` on the way out
/// tells the session its client is gone.
async fn bridge(socket: WebSocket, client: ClientEnd, session_id: &str) {
    let ClientEnd { input, output } = client;
    let (ws_sender, mut ws_receiver) = socket.split();
    let (reply_tx, reply_rx) = mpsc::channel::<ServerMessage>(8);

    let mut output_task = tokio::spawn(forward_session_output(
        session_id.to_string(),
        ws_sender,
        output,
        reply_rx,
    ));

    loop {
        let msg = tokio::select! {
            msg = ws_receiver.next() => msg,
            _ = &mut output_task => return,
        };
        let forwarded = match msg {
            Some(Ok(Message::Binary(bytes))) => input.send(ClientInput::Data(bytes.to_vec())).await,
            Some(Ok(Message::Text(raw))) => match serde_json::from_str::<ClientMessage>(raw.as_str()) {
                Ok(ClientMessage::Input { data }) => {
                    input.send(ClientInput::Data(data.into_bytes())).await
                }
                Ok(ClientMessage::Resize { cols, rows }) => {
                    input
                        .send(ClientInput::Resize(TerminalSize { cols, rows }))
                        .await
                }
                Ok(ClientMessage::Ping) => {
                    let _ = reply_tx.send(ServerMessage::Pong).await;
                    Ok(())
                }
                Ok(ClientMessage::Close) => input.send(ClientInput::Close).await,
                Ok(ClientMessage::Init { .. }) => {
                    debug!("[ws:{}] Ignoring repeated init", session_id);
                    Ok(())
                }
                Err(e) => {
                    warn!("[ws:{}] Ignoring malformed control message: {}", session_id, e);
                    Ok(())
                }
            },
            Some(Ok(Message::Close(_))) | None => {
                info!("[ws:{}] Client closed connection", session_id);
                break;
            }
            Some(Err(e)) => {
                debug!("[ws:{}] WebSocket error: {}", session_id, e);
                break;
            }
            Some(Ok(_)) => Ok(()),
        };
        if forwarded.is_err() {
            break;
        }
    }

    drop(input);
    // Let the session deliver its exit frame if the socket can still take it.
    if time::timeout(Duration::from_secs(15), &mut output_task)
        .await
        .is_err()
    {
        output_task.abort();
    }
}

async fn forward_session_output(
    session_id: String,
    mut ws_sender: SplitSink<WebSocket, Message>,
    mut output: mpsc::Receiver<TerminalEvent>,
    mut replies: mpsc::Receiver<ServerMessage>,
) {
    loop {
        let message = tokio::select! {
            event = output.recv() => match event {
                Some(TerminalEvent::Output(bytes)) => Message::Binary(bytes.into()),
                Some(TerminalEvent::Ended(exit)) => {
                    let _ = ws_sender.send(text(&ServerMessage::from(&exit))).await;
                    let _ = ws_sender
                        .send(Message::Close(Some(CloseFrame {
                            code: close_code::NORMAL,
                            reason: "session ended".into(),
                        })))
                        .await;
                    break;
                }
                None => break,
            },
            Some(reply) = replies.recv() => text(&reply),
        };
        if ws_sender.send(message).await.is_err() {
            debug!("[ws:{}] Socket closed while sending output", session_id);
            break;
        }
    }
    let _ = ws_sender.close().await;
}
