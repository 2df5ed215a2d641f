//! Chat channel (`chat:*` events) for the real-time multiplexer.
//!
//! Wires intent routing to the agentic loop and, when the turn requests
//! spoken output, to sentence splitting and TTS. Confirmation
//! is a real continuation rather than a blocking wait: a RED/ORANGE tool
//! call parks its `PendingConfirmation` — together with the `StreamSink`
//! that produced it — in the connection's pending map, keyed by
//! `toolUseId`, and the turn only resumes once `chat:confirm` arrives.

use std::sync::{atomic::AtomicBool, Arc};

use async_trait::async_trait;
use serde_json::json;
use tokio::sync::Mutex as AsyncMutex;
use uuid::Uuid;

use crate::{
    agent::{AgentLoop, Message as AgentMessage, PendingConfirmation, ProviderKind, StreamSink},
    ai::CancelFlag,
    error::JarvisError,
    persistence::{ChatMessage, ChatRole},
    security::Tier,
    timing::{Mark, PipelineTimer},
    tts::{EngineLock, SentenceStreamer},
};

use super::{
    state::{GatewayState, SessionState},
    ws::{send_json, Connection},
};

/// A paused turn: the loop state to resume with, plus the exact sink that
/// was streaming its output, so resumption continues the same accumulated
/// text/sentence state rather than starting a fresh response.
pub struct PendingEntry {
    pub kind: ProviderKind,
    pub pending: PendingConfirmation,
    pub sink: Arc<WsChatSink>,
    pub cancel: CancelFlag,
}

fn session_uuid(session_id: &str) -> Uuid {
    Uuid::parse_str(session_id).unwrap_or_else(|_| Uuid::new_v5(&Uuid::NAMESPACE_OID, session_id.as_bytes()))
}

pub async fn handle_send(conn: Arc<Connection>, session_id: Option<String>, message: String, voice_mode: bool) {
    let session_id = session_id.unwrap_or_else(|| Uuid::new_v4().to_string());
    tokio::spawn(run_turn(conn, session_id, message, voice_mode));
}

pub async fn handle_confirm(conn: Arc<Connection>, session_id: String, tool_use_id: String, confirmed: bool) {
    let Some((_, entry)) = conn.pending.remove(&tool_use_id) else {
        send_json(
            &conn.out,
            json!({"type": "chat:error", "sessionId": session_id, "error": format!("no pending confirmation '{tool_use_id}'")}),
        )
        .await;
        return;
    };

    *conn.cancel.lock() = Some(entry.cancel.clone());

    let agent_loop = loop_for(&conn.state, entry.kind);
    let result = agent_loop
        .resume_after_confirmation(entry.pending, confirmed, entry.sink.clone(), entry.cancel)
        .await;

    handle_loop_result(conn, session_id, entry.kind, entry.sink, result).await;
}

fn loop_for(state: &GatewayState, kind: ProviderKind) -> Arc<AgentLoop> {
    match kind {
        ProviderKind::Agentic => state.agentic_loop.clone(),
        ProviderKind::Conversational => state.conversational_loop.clone(),
    }
}

async fn run_turn(conn: Arc<Connection>, session_id: String, user_text: String, voice_mode: bool) {
    let session = conn.state.session(&session_id);
    let previous_provider = *session.last_provider.lock();

    let decision = conn.state.router.route(&user_text, previous_provider);
    tracing::debug!(reason = %decision.reason, provider = ?decision.provider, "chat turn routed");
    *session.last_provider.lock() = Some(decision.provider);

    session.context.push(AgentMessage::user(user_text.clone())).await;
    // The system prompt lives inside the AgentLoop, not the context
    // manager, so its token cost is approximated rather than measured here.
    let messages = session.context.build_context(256).await;

    let user_msg = ChatMessage::new(session_uuid(&session_id), ChatRole::User, user_text.clone());
    if let Err(e) = conn.state.persistence.save_message(&user_msg).await {
        tracing::warn!("failed to persist user chat message: {e}");
    }

    let mut timer = PipelineTimer::start();
    timer.mark(Mark::Received);
    timer.mark(Mark::Routed);

    let cancel: CancelFlag = Arc::new(AtomicBool::new(false));
    *conn.cancel.lock() = Some(cancel.clone());

    let sink = Arc::new(WsChatSink::new(
        conn.clone(),
        session_id.clone(),
        session.clone(),
        decision.provider,
        timer,
        voice_mode,
    ));
    let agent_loop = loop_for(&conn.state, decision.provider);

    let result = agent_loop.run(messages, user_text, sink.clone(), cancel).await;
    handle_loop_result(conn, session_id, decision.provider, sink, result).await;
}

async fn handle_loop_result(
    conn: Arc<Connection>,
    session_id: String,
    kind: ProviderKind,
    sink: Arc<WsChatSink>,
    result: crate::error::JarvisResult<Option<PendingConfirmation>>,
) {
    match result {
        Ok(Some(pending)) => {
            let cancel = conn.cancel.lock().clone().unwrap_or_else(|| Arc::new(AtomicBool::new(false)));
            conn.pending.insert(
                pending.pending_call.id.clone(),
                PendingEntry { kind, pending, sink, cancel },
            );
        }
        Ok(None) => sink.finalize(&conn, &session_id).await,
        Err(e) => {
            send_json(&conn.out, json!({"type": "chat:error", "sessionId": session_id, "error": e.to_string()})).await;
        }
    }
}

/// Turns `StreamSink` callbacks into outbound `chat:*` frames, and
/// accumulates the text and synthesized sentences needed to persist the
/// final assistant message and (if `voiceMode`) produce its audio.
pub struct WsChatSink {
    conn: Arc<Connection>,
    session_id: String,
    session: Arc<SessionState>,
    kind: ProviderKind,
    timer: AsyncMutex<PipelineTimer>,
    sentences: AsyncMutex<SentenceStreamer>,
    collected: AsyncMutex<Vec<(usize, String)>>,
    text: AsyncMutex<String>,
    first_token_seen: AtomicBool,
    voice_mode: bool,
}

impl WsChatSink {
    fn new(
        conn: Arc<Connection>,
        session_id: String,
        session: Arc<SessionState>,
        kind: ProviderKind,
        timer: PipelineTimer,
        voice_mode: bool,
    ) -> Self {
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
            voice_mode,
        }
    }

    async fn emit(&self, frame: serde_json::Value) {
        send_json(&self.conn.out, frame).await;
    }

    /// Called once the loop has fully completed (no further confirmation
    /// pending): flush the sentence streamer, persist the assistant turn,
    /// synthesize audio if requested, and close out the response.
    async fn finalize(&self, conn: &Arc<Connection>, session_id: &str) {
        let mut flushed_sentences = Vec::new();
        {
            let mut streamer = self.sentences.lock().await;
            if let Some((idx, sentence)) = streamer.flush() {
                self.emit(json!({"type": "chat:sentence", "sessionId": session_id, "index": idx, "text": sentence}))
                    .await;
                flushed_sentences.push((idx, sentence));
            }
        }
        self.collected.lock().await.extend(flushed_sentences);

        let final_text = self.text.lock().await.clone();
        let assistant_msg = ChatMessage::new(session_uuid(session_id), ChatRole::Assistant, final_text.clone());
        if let Err(e) = conn.state.persistence.save_message(&assistant_msg).await {
            tracing::warn!("failed to persist assistant chat message: {e}");
        }

        self.session.context.push(AgentMessage::assistant(final_text)).await;
        let agent_loop = loop_for(&conn.state, self.kind);
        self.session
            .context
            .maybe_summarize_in_background(agent_loop.provider(), agent_loop.model().to_owned());

        if self.voice_mode {
            self.synthesize_and_emit(conn, session_id).await;
        }

        {
            let mut timer = self.timer.lock().await;
            timer.mark(Mark::LlmDone);
            self.emit(json!({"type": "chat:timing", "sessionId": session_id, "breakdown": timer.breakdown(), "totalMs": timer.total_ms()}))
                .await;
            tracing::info!("{}", timer.log_line());
        }

        conn.pending.retain(|_, entry| entry.sink.session_id != session_id);
        self.emit(json!({"type": "chat:done", "sessionId": session_id})).await;
    }

    async fn synthesize_and_emit(&self, conn: &Arc<Connection>, session_id: &str) {
        let sentences = self.collected.lock().await.clone();
        if sentences.is_empty() {
            self.emit(json!({"type": "chat:audio_done", "sessionId": session_id})).await;
            return;
        }

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
                        "type": "chat:audio_chunk",
                        "sessionId": session_id,
                        "index": chunk.index,
                        "engine": chunk.produced_by.as_str(),
                        "audio": hex::encode(&chunk.bytes),
                    }))
                    .await;
                }
                Err(e) => {
                    tracing::warn!("tts synthesis failed for session {session_id}: {e}");
                }
            }
        }
        self.timer.lock().await.mark(Mark::AudioDelivered);
        self.emit(json!({"type": "chat:audio_done", "sessionId": session_id})).await;
    }
}

#[async_trait]
impl StreamSink for WsChatSink {
    async fn on_text_delta(&self, delta: &str) {
        if !self.first_token_seen.swap(true, std::sync::atomic::Ordering::Relaxed) {
            self.timer.lock().await.mark(Mark::FirstToken);
        }
        self.text.lock().await.push_str(delta);
        self.emit(json!({"type": "chat:token", "sessionId": self.session_id, "text": delta})).await;

        let emitted = self.sentences.lock().await.push(delta);
        for (idx, sentence) in emitted {
            self.emit(json!({"type": "chat:sentence", "sessionId": self.session_id, "index": idx, "text": sentence.clone()}))
                .await;
            self.collected.lock().await.push((idx, sentence));
        }
    }

    async fn on_tool_use(&self, name: &str, args: &serde_json::Value, id: &str, tier: Tier) {
        self.emit(json!({"type": "chat:tool_use", "sessionId": self.session_id, "toolUseId": id, "name": name, "args": args, "tier": tier}))
            .await;
    }

    async fn on_tool_result(&self, id: &str, result: &str, is_error: bool) {
        self.session.context.push(AgentMessage::tool_result(id, result)).await;
        self.emit(json!({"type": "chat:tool_result", "sessionId": self.session_id, "toolUseId": id, "result": result, "isError": is_error}))
            .await;
    }

    async fn on_confirmation_needed(&self, name: &str, args: &serde_json::Value, id: &str, tier: Tier) {
        self.emit(json!({"type": "chat:confirm_needed", "sessionId": self.session_id, "toolUseId": id, "name": name, "args": args, "tier": tier}))
            .await;
    }

    async fn on_blocked(&self, name: &str, reason: &str, tier: Tier) {
        self.emit(json!({"type": "chat:blocked", "sessionId": self.session_id, "name": name, "reason": reason, "tier": tier}))
            .await;
    }

    async fn on_done(&self, usage: crate::ai::TokenUsage) {
        let _ = usage;
        // Finalization (persistence, TTS, `chat:done`) happens once the
        // caller observes `run`/`resume_after_confirmation` returning
        // `Ok(None)` — see `handle_loop_result` — since only the caller
        // knows whether this completion was the terminal one.
    }

    async fn on_error(&self, err: &JarvisError) {
        self.emit(json!({"type": "chat:error", "sessionId": self.session_id, "error": err.to_string()})).await;
    }
}
