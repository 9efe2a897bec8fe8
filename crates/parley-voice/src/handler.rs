//! Voice signaling WebSocket handler.
//!
//! The connection flow:
//!
//! 1. Client connects to /voice
//! 2. Authenticates with `identify` and gets `ready` plus the ICE servers
//! 3. Joins a channel or places/accepts a direct call
//! 4. Exchanges offers, answers and candidates with every roster peer
//!    through the relay; media then flows peer to peer
//! 5. Leaves, hangs up, or disconnects → cleanup
//!
//! Each connection runs two tasks: a writer that drains the connection's
//! outbound queue into the socket, and the receive loop below that feeds the
//! session one signal at a time.

use axum::{
    extract::{
        ws::{Message, WebSocket},
        Path, State, WebSocketUpgrade,
    },
    response::Response,
    routing::get,
    Json, Router,
};
use futures_util::{SinkExt, StreamExt};
use parley_common::config::IceServerConfig;
use parley_common::signal::{ClientSignal, ServerSignal};
use parley_common::{ChannelId, ContextId, ParleyError, ParleyResult, RosterMember, ServerId};
use serde_json::{json, Value};
use std::sync::Arc;
use tokio::sync::mpsc;

use crate::registry::VoiceStats;
use crate::session::{SessionFlow, VoiceSession};
use crate::VoiceServerState;

/// Build the voice signaling router.
pub fn build_router(state: Arc<VoiceServerState>) -> Router {
    Router::new()
        .route("/voice", get(ws_handler))
        .route("/voice/stats", get(stats))
        .route("/voice/ice-servers", get(ice_servers))
        .route("/voice/channels/{server_id}/{channel_id}", get(channel_roster))
        .route("/health", get(health))
        .with_state(state)
}

/// WebSocket upgrade handler.
async fn ws_handler(ws: WebSocketUpgrade, State(state): State<Arc<VoiceServerState>>) -> Response {
    ws.on_upgrade(move |socket| handle_voice_connection(socket, state))
}

/// Handle a single voice signaling WebSocket connection.
async fn handle_voice_connection(socket: WebSocket, state: Arc<VoiceServerState>) {
    let (mut sender, mut receiver) = socket.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<ServerSignal>();
    let heartbeat_timeout = state.config.heartbeat_timeout();

    let mut session = VoiceSession::new(state, tx);
    let session_id = session.session_id().to_string();

    tracing::debug!(session = %session_id, "Voice WebSocket connected");

    let mut writer = tokio::spawn(async move {
        while let Some(signal) = rx.recv().await {
            let json = match serde_json::to_string(&signal) {
                Ok(json) => json,
                Err(e) => {
                    tracing::error!("Failed to serialize voice signal: {e}");
                    continue;
                }
            };
            if sender.send(Message::Text(json.into())).await.is_err() {
                break;
            }
        }
        let _ = sender.close().await;
    });

    loop {
        let msg = tokio::select! {
            _ = &mut writer => break,
            msg = tokio::time::timeout(heartbeat_timeout, receiver.next()) => msg,
        };

        let msg = match msg {
            Ok(Some(Ok(msg))) => msg,
            Ok(Some(Err(e))) => {
                tracing::debug!(session = %session_id, "Voice WebSocket error: {e}");
                break;
            }
            Ok(None) => break,
            Err(_) => {
                tracing::info!(session = %session_id, "Voice heartbeat timed out");
                break;
            }
        };

        match msg {
            Message::Text(text) => {
                let signal = match serde_json::from_str::<ClientSignal>(&text) {
                    Ok(signal) => signal,
                    Err(e) => {
                        session.reject_malformed(&e);
                        continue;
                    }
                };
                if session.handle(signal).await == SessionFlow::Close {
                    break;
                }
            }
            Message::Close(_) => break,
            _ => {}
        }
    }

    // Cleanup on disconnect
    session.close().await;
    drop(session);
    writer.abort();

    tracing::info!(session = %session_id, "Voice WebSocket disconnected");
}

async fn stats(State(state): State<Arc<VoiceServerState>>) -> Json<VoiceStats> {
    Json(state.registry.stats().await)
}

async fn ice_servers(State(state): State<Arc<VoiceServerState>>) -> Json<Vec<IceServerConfig>> {
    Json(state.config.ice_servers.clone())
}

/// Members of a channel, for presence UIs that are not in voice themselves.
async fn channel_roster(
    State(state): State<Arc<VoiceServerState>>,
    Path((server_id, channel_id)): Path<(String, String)>,
) -> ParleyResult<Json<Vec<RosterMember>>> {
    let context = ContextId::Channel {
        server_id: ServerId::new(server_id),
        channel_id: ChannelId::new(channel_id),
    };
    let roster = state.registry.get_roster(&context).await;
    if roster.is_empty() {
        return Err(ParleyError::NotFound {
            resource: format!("Voice channel {context}"),
        });
    }
    Ok(Json(roster))
}

async fn health() -> Json<Value> {
    Json(json!({ "status": "ok", "service": "parley-voice" }))
}
