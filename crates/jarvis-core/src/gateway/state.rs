//! Shared daemon state handed to every HTTP and WebSocket handler.
//!
//! A single `Arc`-wrapped struct reaching every subsystem a request might
//! touch, rather than a bare event bus handle — this daemon's surface is
//! broad enough that threading individual handles through each handler
//! would be unwieldy.

use std::sync::Arc;

use dashmap::DashMap;

use crate::{
    agent::{AgentLoop, ContextManager, IntentRouter},
    config::schema::{ProxmoxNodeConfig, SecurityConfig},
    event_bus::EventBus,
    infra::{ProxmoxClient, SshPool},
    persistence::Persistence,
    security::SecurityPolicy,
    stt::SttPort,
    telemetry::TelemetryEmitter,
    tools::{ToolExecutor, ToolRegistry},
    tts::TtsPipeline,
};

/// Per-session conversational state, created lazily on first use and kept
/// for the lifetime of the daemon process (sessions are not persisted
/// beyond the chat history already written to `Persistence`).
pub struct SessionState {
    pub context: Arc<ContextManager>,
    pub last_provider: parking_lot::Mutex<Option<crate::agent::ProviderKind>>,
}

impl SessionState {
    fn new(window_turns: usize, token_budget: u32, summarize_threshold: u32) -> Self {
        Self {
            context: Arc::new(ContextManager::new(window_turns, token_budget, summarize_threshold)),
            last_provider: parking_lot::Mutex::new(None),
        }
    }
}

#[derive(Clone)]
pub struct GatewayState(pub Arc<GatewayStateInner>);

impl std::ops::Deref for GatewayState {
    type Target = GatewayStateInner;
    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

pub struct GatewayStateInner {
    pub bus: Arc<dyn EventBus>,
    pub persistence: Arc<dyn Persistence>,
    pub proxmox: Arc<ProxmoxClient>,
    pub ssh: Arc<SshPool>,
    pub ssh_deadline_ms: u64,
    pub nodes: Vec<ProxmoxNodeConfig>,
    pub registry: Arc<ToolRegistry>,
    pub executor: Arc<ToolExecutor>,
    pub policy: Arc<SecurityPolicy>,
    pub router: Arc<IntentRouter>,
    pub conversational_loop: Arc<AgentLoop>,
    pub agentic_loop: Arc<AgentLoop>,
    pub tts: Arc<TtsPipeline>,
    pub stt: Arc<dyn SttPort>,
    pub telemetry: Arc<TelemetryEmitter>,
    pub sessions: DashMap<String, Arc<SessionState>>,
    pub security_config: SecurityConfig,
    pub jwt_secret: String,
    pub password: String,
    pub context_window_turns: usize,
    pub context_token_budget: u32,
    pub summarize_threshold_tokens: u32,
}

impl GatewayStateInner {
    pub fn session(&self, session_id: &str) -> Arc<SessionState> {
        self.sessions
            .entry(session_id.to_owned())
            .or_insert_with(|| {
                Arc::new(SessionState::new(
                    self.context_window_turns,
                    self.context_token_budget,
                    self.summarize_threshold_tokens,
                ))
            })
            .clone()
    }
}
