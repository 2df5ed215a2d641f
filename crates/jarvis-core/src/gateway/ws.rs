//! Real-time multiplexer: one authenticated duplex transport exposing
//! five logical channels (`cluster`, `events`, `terminal`, `chat`, `voice`)
//! over a single `/api/v1/ws` upgrade.
//!
//! A tagged command enum dispatched via `tokio::select!` between the event
//! bus and the socket. Chat and voice turns stream many outbound frames
//! concurrently with inbound confirm/cancel messages, so the socket's write
//! half is split out behind a mutex shared with the spawned streaming
//! tasks, rather than passing a single `&mut socket` down the call stack.

use std::sync::Arc;

use axum::extract::{
    ws::{Message, WebSocket},
    Query, State, WebSocketUpgrade,
};
use axum::response::IntoResponse;
use futures::{stream::SplitSink, SinkExt, StreamExt};
use serde::Deserialize;
use serde_json::json;
use tokio::sync::Mutex as AsyncMutex;

use crate::event_bus::AppEvent;

use super::{
    auth::verify_handshake_token,
    chat, terminal,
    state::GatewayState,
    voice::{self, VoiceState},
};

pub type OutSink = Arc<AsyncMutex<SplitSink<WebSocket, Message>>>;

pub async fn send_json(out: &OutSink, value: serde_json::Value) {
    let text = value.to_string();
    if out.lock().await.send(Message::Text(text.into())).await.is_err() {
        tracing::debug!("ws: client disconnected mid-send");
    }
}

#[derive(Debug, Deserialize)]
pub struct WsUpgradeQuery {
    token: Option<String>,
}

/// `GET /api/v1/ws?token=...`. The token travels as a query parameter
/// because a browser cannot set `Authorization` on the upgrade request.
pub async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<GatewayState>,
    Query(q): Query<WsUpgradeQuery>,
) -> impl IntoResponse {
    let Some(token) = q.token else {
        return axum::http::StatusCode::UNAUTHORIZED.into_response();
    };
    if !verify_handshake_token(&format!("token={token}"), &state.jwt_secret) {
        return axum::http::StatusCode::UNAUTHORIZED.into_response();
    }
    ws.on_upgrade(move |socket| handle_socket(socket, state)).into_response()
}

/// Tagged on the JSON `type` field. Several variants carry the channel name
/// in the tag itself (`chat:send`, `voice:audio_start`, ...); `terminal`'s
/// and `cluster`'s tags are bare because only one channel uses those names.
#[derive(Debug, Deserialize)]
#[serde(tag = "type")]
enum WsInbound {
    #[serde(rename = "requestRefresh")]
    RequestRefresh,

    #[serde(rename = "start")]
    TerminalStart { node: String },
    #[serde(rename = "data")]
    TerminalData { data: String },
    #[serde(rename = "resize")]
    TerminalResize { cols: u32, rows: u32 },
    #[serde(rename = "stop")]
    TerminalStop,

    #[serde(rename = "chat:send")]
    ChatSend {
        #[serde(rename = "sessionId")]
        session_id: Option<String>,
        message: String,
        #[serde(rename = "voiceMode")]
        voice_mode: Option<bool>,
    },
    #[serde(rename = "chat:confirm")]
    ChatConfirm {
        #[serde(rename = "sessionId")]
        session_id: String,
        #[serde(rename = "toolUseId")]
        tool_use_id: String,
        confirmed: bool,
    },

    #[serde(rename = "voice:audio_start")]
    VoiceAudioStart,
    #[serde(rename = "voice:audio_chunk")]
    VoiceAudioChunk { seq: u64, audio: String },
    #[serde(rename = "voice:audio_end")]
    VoiceAudioEnd,
    #[serde(rename = "voice:ping")]
    VoicePing,
}

/// Per-connection state shared across the chat/voice/terminal handlers
/// spawned for this socket.
pub struct Connection {
    pub out: OutSink,
    pub state: GatewayState,
    pub pending: dashmap::DashMap<String, chat::PendingEntry>,
    pub cancel: parking_lot::Mutex<Option<crate::ai::CancelFlag>>,
    pub terminal: AsyncMutex<Option<Arc<crate::infra::PtyHandle>>>,
    pub voice: AsyncMutex<VoiceState>,
}

async fn handle_socket(socket: WebSocket, state: GatewayState) {
    let (sink, mut stream) = socket.split();
    let conn = Arc::new(Connection {
        out: Arc::new(AsyncMutex::new(sink)),
        state: state.clone(),
        pending: dashmap::DashMap::new(),
        cancel: parking_lot::Mutex::new(None),
        terminal: AsyncMutex::new(None),
        voice: AsyncMutex::new(VoiceState::new()),
    });

    send_cluster_snapshot(&conn).await;

    let mut bus_rx = state.bus.subscribe();

    loop {
        tokio::select! {
            event = bus_rx.recv() => {
                match event {
                    Ok(ev) => forward_bus_event(&conn, ev).await,
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                        tracing::warn!("ws: cluster/events subscriber lagged, missed {n} events");
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                }
            }
            msg = stream.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => dispatch(&conn, &text).await,
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Err(_)) => break,
                    _ => {}
                }
            }
        }
    }

    terminal::on_disconnect(&conn).await;
}

/// `cluster` and `events` have no inbound shape beyond `requestRefresh`;
/// every bus event that isn't chat/voice-scoped is broadcast to every
/// connected client on those two channels.
async fn forward_bus_event(conn: &Arc<Connection>, event: AppEvent) {
    let frame = match event {
        AppEvent::ClusterUpdate { kind, payload } => json!({"type": kind, "payload": payload}),
        AppEvent::AlertNotification { cause, message } => {
            json!({"type": "alert:notification", "cause": cause, "message": message})
        }
        _ => return,
    };
    send_json(&conn.out, frame).await;
}

/// Full snapshot on connect and on explicit `requestRefresh`, split into one
/// outbound frame per kind to match the `cluster` channel's outbound list.
async fn send_cluster_snapshot(conn: &Arc<Connection>) {
    let snapshot = conn.state.telemetry.snapshot().await;
    for kind in ["nodes", "vms", "storage", "quorum", "temperature", "voice_agents"] {
        send_json(&conn.out, json!({"type": kind, "payload": snapshot[kind]})).await;
    }
}

async fn dispatch(conn: &Arc<Connection>, raw: &str) {
    let inbound: WsInbound = match serde_json::from_str(raw) {
        Ok(v) => v,
        Err(e) => {
            send_json(&conn.out, json!({"type": "error", "error": format!("invalid message: {e}")})).await;
            return;
        }
    };

    match inbound {
        WsInbound::RequestRefresh => send_cluster_snapshot(conn).await,

        WsInbound::TerminalStart { node } => terminal::start(conn, &node).await,
        WsInbound::TerminalData { data } => terminal::data(conn, &data).await,
        WsInbound::TerminalResize { cols, rows } => terminal::resize(conn, cols, rows).await,
        WsInbound::TerminalStop => terminal::stop(conn).await,

        WsInbound::ChatSend { session_id, message, voice_mode } => {
            chat::handle_send(conn.clone(), session_id, message, voice_mode.unwrap_or(false)).await;
        }
        WsInbound::ChatConfirm { session_id, tool_use_id, confirmed } => {
            chat::handle_confirm(conn.clone(), session_id, tool_use_id, confirmed).await;
        }

        WsInbound::VoiceAudioStart => voice::audio_start(conn.clone()).await,
        WsInbound::VoiceAudioChunk { seq, audio } => voice::audio_chunk(conn.clone(), seq, &audio).await,
        WsInbound::VoiceAudioEnd => voice::audio_end(conn.clone()).await,
        WsInbound::VoicePing => send_json(&conn.out, json!({"type": "voice:pong"})).await,
    }
}
