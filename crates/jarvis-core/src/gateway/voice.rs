//! Voice channel (`voice:*` events) for the real-time multiplexer.
//!
//! A server-driven state machine (`idle → listening → capturing →
//! processing → speaking → idle`) wires speech transcription to intent
//! routing, the agentic loop, sentence splitting and TTS — the same
//! pipeline `chat.rs` drives, with two differences: there is no `sessionId`
//! in the
//! wire protocol (a connection-lifetime session id is generated lazily on
//! first transcript and reused across turns), and RED/ORANGE confirmations
//! have no UI here, so they are auto-declined rather than parked.

use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::{Duration, Instant},
};

use async_trait::async_trait;
use serde_json::json;
use tokio::sync::Mutex as AsyncMutex;
use uuid::Uuid;

use crate::{
    agent::{AgentLoop, Message as AgentMessage, PendingConfirmation, ProviderKind, StreamSink},
    ai::CancelFlag,
    error::JarvisError,
    event_bus::AppEvent,
    persistence::{ChatMessage, ChatRole},
    security::Tier,
    stt::TranscribeOptions,
    timing::{Mark, PipelineTimer},
    tts::{EngineLock, SentenceStreamer},
};

use super::{
    state::{GatewayState, SessionState},
    ws::{send_json, Connection},
};

/// No audio chunk for this long ends capture and moves on to transcription.
const INACTIVITY_GUARD: Duration = Duration::from_secs(2);
/// Absolute cap on one capture, regardless of activity, so a stuck client
/// can't hold a session open indefinitely.
const HARD_CAP: Duration = Duration::from_secs(30);
const WATCHDOG_TICK: Duration = Duration::from_millis(250);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Idle,
    Listening,
    Capturing,
    Processing,
    Speaking,
}

pub struct VoiceState {
    phase: Phase,
    buffer: Vec<u8>,
    started_at: Option<Instant>,
    last_activity: Instant,
    session_id: Option<Uuid>,
    /// Bumped on every `audio_start`/re-arm; the watchdog and any
    /// in-flight finalize compare against the token they were spawned
    /// with, so a superseded or already-finalized capture never fires a
    /// second time.
    turn_token: u64,
}

impl VoiceState {
    pub fn new() -> Self {
        Self {
            phase: Phase::Idle,
            buffer: Vec::new(),
            started_at: None,
            last_activity: Instant::now(),
            session_id: None,
            turn_token: 0,
        }
    }
}

impl Default for VoiceState {
    fn default() -> Self {
        Self::new()
    }
}

fn session_uuid(session_id: &str) -> Uuid {
    Uuid::parse_str(session_id).unwrap_or_else(|_| Uuid::new_v5(&Uuid::NAMESPACE_OID, session_id.as_bytes()))
}

fn loop_for(state: &GatewayState, kind: ProviderKind) -> Arc<AgentLoop> {
    match kind {
        ProviderKind::Agentic => state.agentic_loop.clone(),
        ProviderKind::Conversational => state.conversational_loop.clone(),
    }
}

pub async fn audio_start(conn: Arc<Connection>) {
    let token = arm_listening(&conn).await;
    tokio::spawn(watchdog_loop(conn, token));
}

pub async fn audio_chunk(conn: Arc<Connection>, seq: u64, audio: &str) {
    // Ordering is trusted to the client; chunks are appended as they
    // arrive rather than resequenced by `seq`.
    let _ = seq;
    let Ok(bytes) = hex::decode(audio) else {
        send_json(&conn.out, json!({"type": "voice:error", "error": "invalid audio encoding"})).await;
        return;
    };

    let mut voice = conn.voice.lock().await;
    if voice.phase == Phase::Idle {
        return;
    }
    voice.phase = Phase::Capturing;
    voice.buffer.extend_from_slice(&bytes);
    voice.last_activity = Instant::now();
}

pub async fn audio_end(conn: Arc<Connection>) {
    let token = {
        let voice = conn.voice.lock().await;
        if voice.phase == Phase::Idle {
            return;
        }
        voice.turn_token
    };
    finalize_capture(conn, token).await;
}

async fn arm_listening(conn: &Arc<Connection>) -> u64 {
    let token = {
        let mut voice = conn.voice.lock().await;
        voice.turn_token += 1;
        voice.phase = Phase::Listening;
        voice.buffer.clear();
        voice.started_at = Some(Instant::now());
        voice.last_activity = Instant::now();
        voice.turn_token
    };
    send_json(&conn.out, json!({"type": "voice:listening"})).await;
    token
}

async fn set_idle(conn: &Arc<Connection>) {
    conn.voice.lock().await.phase = Phase::Idle;
}

async fn watchdog_loop(conn: Arc<Connection>, token: u64) {
    loop {
        tokio::time::sleep(WATCHDOG_TICK).await;
        let expired = {
            let voice = conn.voice.lock().await;
            if voice.turn_token != token || !matches!(voice.phase, Phase::Listening | Phase::Capturing) {
                return;
            }
            let idle = voice.last_activity.elapsed() >= INACTIVITY_GUARD;
            let capped = voice.started_at.map(|t| t.elapsed() >= HARD_CAP).unwrap_or(false);
            idle || capped
        };
        if expired {
            finalize_capture(conn, token).await;
            return;
        }
    }
}

async fn finalize_capture(conn: Arc<Connection>, token: u64) {
    let (buffer, session) = {
        let mut voice = conn.voice.lock().await;
        if voice.turn_token != token {
            return;
        }
        voice.phase = Phase::Processing;
        let buffer = std::mem::take(&mut voice.buffer);
        let session = *voice.session_id.get_or_insert_with(Uuid::new_v4);
        (buffer, session)
    };

    send_json(&conn.out, json!({"type": "voice:processing"})).await;

    if buffer.is_empty() {
        send_json(&conn.out, json!({"type": "voice:error", "error": "No audio received"})).await;
        let next_token = arm_listening(&conn).await;
        tokio::spawn(watchdog_loop(conn, next_token));
        return;
    }

    let transcript = match conn.state.stt.transcribe(&buffer, TranscribeOptions { language: None }).await {
        Ok(t) => t,
        Err(e) => {
            send_json(&conn.out, json!({"type": "voice:error", "error": e.to_string()})).await;
            set_idle(&conn).await;
            return;
        }
    };

    send_json(
        &conn.out,
        json!({
            "type": "voice:transcript",
            "text": transcript.text,
            "processingTimeSeconds": transcript.processing_time_seconds,
        }),
    )
    .await;

    run_turn(conn, session, transcript.text).await;
}

async fn run_turn(conn: Arc<Connection>, session_uuid: Uuid, user_text: String) {
    let session_id = session_uuid.to_string();
    let session = conn.state.session(&session_id);
    let previous_provider = *session.last_provider.lock();

    let decision = conn.state.router.route(&user_text, previous_provider);
    tracing::debug!(reason = %decision.reason, provider = ?decision.provider, "voice turn routed");
    *session.last_provider.lock() = Some(decision.provider);

    session.context.push(AgentMessage::user(user_text.clone())).await;
    let messages = session.context.build_context(256).await;

    let user_msg = ChatMessage::new(session_uuid, ChatRole::User, user_text.clone());
    if let Err(e) = conn.state.persistence.save_message(&user_msg).await {
        tracing::warn!("failed to persist voice user message: {e}");
    }

    send_json(&conn.out, json!({"type": "voice:thinking"})).await;

    let cancel: CancelFlag = Arc::new(AtomicBool::new(false));
    *conn.cancel.lock() = Some(cancel.clone());

    let sink = Arc::new(VoiceSink::new(conn.clone(), session_id.clone(), session.clone(), decision.provider));
    let agent_loop = loop_for(&conn.state, decision.provider);

    let result = agent_loop.run(messages, user_text, sink.clone(), cancel).await;
    handle_loop_result(conn, session_id, decision.provider, sink, result).await;
}

/// Boxed because this recurses through a confirmation auto-decline: an
/// async fn can't directly call itself (its own future would be
/// infinitely sized), so the recursive call is heap-allocated instead.
fn handle_loop_result(
    conn: Arc<Connection>,
    session_id: String,
    kind: ProviderKind,
    sink: Arc<VoiceSink>,
    result: crate::error::JarvisResult<Option<PendingConfirmation>>,
) -> std::pin::Pin<Box<dyn std::future::Future<Output = ()> + Send>> {
    Box::pin(async move {
        match result {
            Ok(Some(pending)) => {
                let name = pending.pending_call.name.clone();
                let tier = pending.tier;
                let reason = format!("auto-declined in voice mode (tier {tier:?}, no confirmation UI available)");

                let payload = json!({"tool_name": name, "tier": tier, "reason": reason});
                if let Err(e) = conn.state.persistence.save_event("action_blocked", payload).await {
                    tracing::warn!("failed to persist voice auto-decline event: {e}");
                }
                let _ = conn.state.bus.publish(AppEvent::SafetyDenied {
                    tool_name: name,
                    reason,
                });

                let cancel = conn.cancel.lock().clone().unwrap_or_else(|| Arc::new(AtomicBool::new(false)));
                let agent_loop = loop_for(&conn.state, kind);
                let next = agent_loop.resume_after_confirmation(pending, false, sink.clone(), cancel).await;
                handle_loop_result(conn, session_id, kind, sink, next).await;
            }
            Ok(None) => sink.finalize(&conn, &session_id).await,
            Err(e) => {
                send_json(&conn.out, json!({"type": "voice:error", "error": e.to_string()})).await;
                set_idle(&conn).await;
            }
        }
    })
}

/// Turns `StreamSink` callbacks into accumulated text/sentences for TTS.
/// Unlike `WsChatSink`, nothing is streamed to the client until synthesis —
/// the voice channel has no token/sentence text frames, only spoken audio.
pub struct VoiceSink {
    conn: Arc<Connection>,
    session_id: String,
    session: Arc<SessionState>,
    kind: ProviderKind,
    timer: AsyncMutex<PipelineTimer>,
    sentences: AsyncMutex<SentenceStreamer>,
    collected: AsyncMutex<Vec<(usize, String)>>,
    text: AsyncMutex<String>,
    first_token_seen: AtomicBool,
}

impl VoiceSink {
    fn new(conn: Arc<Connection>, session_id: String, session: Arc<SessionState>, kind: ProviderKind) -> Self {
        let mut timer = PipelineTimer::start();
        timer.mark(Mark::Received);
        timer.mark(Mark::Routed);
        Self {
            conn,
            session_id,
            session,
            kind,
            timer: AsyncMutex::new(timer),
            sentences: AsyncMutex::new(SentenceStreamer::new()),
            collected: AsyncMutex::new(Vec::new()),
            text: AsyncMutex::new(String::new()),
            first_token_seen: AtomicBool::new(false),
        }
    }

    async fn emit(&self, frame: serde_json::Value) {
        send_json(&self.conn.out, frame).await;
    }

    async fn finalize(&self, conn: &Arc<Connection>, session_id: &str) {
        let mut flushed = Vec::new();
        {
            let mut streamer = self.sentences.lock().await;
            if let Some((idx, sentence)) = streamer.flush() {
                flushed.push((idx, sentence));
            }
        }
        self.collected.lock().await.extend(flushed);

        let final_text = self.text.lock().await.clone();
        let assistant_msg = ChatMessage::new(session_uuid(session_id), ChatRole::Assistant, final_text.clone());
        if let Err(e) = conn.state.persistence.save_message(&assistant_msg).await {
            tracing::warn!("failed to persist assistant voice message: {e}");
        }

        self.session.context.push(AgentMessage::assistant(final_text)).await;
        let agent_loop = loop_for(&conn.state, self.kind);
        self.session
            .context
            .maybe_summarize_in_background(agent_loop.provider(), agent_loop.model().to_owned());

        self.speak_and_emit(conn, session_id).await;

        {
            let mut timer = self.timer.lock().await;
            timer.mark(Mark::LlmDone);
            tracing::info!("{}", timer.log_line());
        }

        set_idle(conn).await;
    }

    async fn speak_and_emit(&self, conn: &Arc<Connection>, session_id: &str) {
        let sentences = self.collected.lock().await.clone();
        if sentences.is_empty() {
            self.emit(json!({"type": "voice:tts_done"})).await;
            return;
        }

        conn.voice.lock().await.phase = Phase::Speaking;
        self.timer.lock().await.mark(Mark::TtsQueued);
        let lock = Arc::new(EngineLock::new());
        let results = conn.state.tts.synthesize_response(sentences, lock).await;

        let mut first = true;
        for result in results {
            match result {
                Ok(chunk) => {
                    if first {
                        self.timer.lock().await.mark(Mark::TtsFirst);
                        first = false;
                    }
                    self.emit(json!({
                        "type": "voice:tts_chunk",
                        "index": chunk.index,
                        "engine": chunk.produced_by.as_str(),
                        "audio": hex::encode(&chunk.bytes),
                    }))
                    .await;
                }
                Err(e) => {
                    tracing::warn!("tts synthesis failed for voice session {session_id}: {e}");
                }
            }
        }
        self.timer.lock().await.mark(Mark::AudioDelivered);
        self.emit(json!({"type": "voice:tts_done"})).await;
    }
}

#[async_trait]
impl StreamSink for VoiceSink {
    async fn on_text_delta(&self, delta: &str) {
        if !self.first_token_seen.swap(true, Ordering::Relaxed) {
            self.timer.lock().await.mark(Mark::FirstToken);
        }
        self.text.lock().await.push_str(delta);

        let emitted = self.sentences.lock().await.push(delta);
        for (idx, sentence) in emitted {
            self.collected.lock().await.push((idx, sentence));
        }
    }

    async fn on_tool_use(&self, _name: &str, _args: &serde_json::Value, _id: &str, _tier: Tier) {}

    async fn on_tool_result(&self, id: &str, result: &str, _is_error: bool) {
        self.session.context.push(AgentMessage::tool_result(id, result)).await;
    }

    async fn on_confirmation_needed(&self, _name: &str, _args: &serde_json::Value, _id: &str, _tier: Tier) {
        // Handled by the caller (`handle_loop_result`): voice mode has no
        // confirmation UI, so a pending call is an auto-decline, not a
        // prompt the operator can answer.
    }

    async fn on_blocked(&self, name: &str, reason: &str, _tier: Tier) {
        tracing::debug!(tool = name, reason, session_id = %self.session_id, "voice turn: tool call blocked");
    }

    async fn on_done(&self, _usage: crate::ai::TokenUsage) {}

    async fn on_error(&self, err: &JarvisError) {
        self.emit(json!({"type": "voice:error", "error": err.to_string()})).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_state_starts_idle() {
        let state = VoiceState::new();
        assert_eq!(state.phase, Phase::Idle);
        assert!(state.buffer.is_empty());
    }

    #[test]
    fn session_uuid_is_stable_for_a_valid_uuid_string() {
        let id = Uuid::new_v4();
        assert_eq!(session_uuid(&id.to_string()), id);
    }

    #[test]
    fn session_uuid_falls_back_deterministically_for_non_uuid_ids() {
        let a = session_uuid("not-a-uuid");
        let b = session_uuid("not-a-uuid");
        assert_eq!(a, b);
    }
}
