//! Cross-cutting internal event bus.
//!
//! This carries events that more than one component needs to observe
//! independent of any single chat/voice/terminal connection: tool-invocation
//! audit records, the approval handshake between a chat socket and the
//! agentic loop, cluster telemetry pushed to every `cluster` subscriber, and
//! cluster-health alerts. Per-connection chat/voice/terminal traffic is
//! carried over the connection's own channel (see `gateway::ws`), not this
//! bus — those events have exactly one destination and do not need fan-out.

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AppEvent {
    /// A tool was executed or blocked; mirrors a persisted `ToolInvocation`.
    ToolInvocation {
        id: String,
        tool_name: String,
        tier: String,
        decision: String,
        ok: bool,
        duration_ms: u64,
    },
    SafetyDenied {
        tool_name: String,
        reason: String,
    },
    ApprovalNeeded {
        session_id: String,
        tool_use_id: String,
        tool_name: String,
        tier: String,
    },
    ApprovalResponse {
        session_id: String,
        tool_use_id: String,
        confirmed: bool,
    },
    ClusterUpdate {
        kind: String,
        payload: serde_json::Value,
    },
    AlertNotification {
        cause: String,
        message: String,
    },
    HeartbeatTick {
        timestamp: String,
    },
    CronFired {
        job_id: String,
    },
    ProviderHealthChange {
        provider_id: String,
        healthy: bool,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum EventType {
    ToolInvocation,
    SafetyDenied,
    ApprovalNeeded,
    ApprovalResponse,
    ClusterUpdate,
    AlertNotification,
    HeartbeatTick,
    CronFired,
    ProviderHealthChange,
    All,
}

impl EventType {
    pub fn matches(&self, event: &AppEvent) -> bool {
        match self {
            Self::All => true,
            Self::ToolInvocation => matches!(event, AppEvent::ToolInvocation { .. }),
            Self::SafetyDenied => matches!(event, AppEvent::SafetyDenied { .. }),
            Self::ApprovalNeeded => matches!(event, AppEvent::ApprovalNeeded { .. }),
            Self::ApprovalResponse => matches!(event, AppEvent::ApprovalResponse { .. }),
            Self::ClusterUpdate => matches!(event, AppEvent::ClusterUpdate { .. }),
            Self::AlertNotification => matches!(event, AppEvent::AlertNotification { .. }),
            Self::HeartbeatTick => matches!(event, AppEvent::HeartbeatTick { .. }),
            Self::CronFired => matches!(event, AppEvent::CronFired { .. }),
            Self::ProviderHealthChange => matches!(event, AppEvent::ProviderHealthChange { .. }),
        }
    }
}

#[derive(Debug, Clone)]
pub struct EventFilter {
    pub event_types: Vec<EventType>,
}

impl EventFilter {
    pub fn new(event_types: Vec<EventType>) -> Self {
        Self { event_types }
    }

    pub fn matches(&self, event: &AppEvent) -> bool {
        self.event_types.iter().any(|t| t.matches(event))
    }
}

/// Central pub/sub bus for cross-component events.
pub trait EventBus: Send + Sync {
    fn publish(&self, event: AppEvent) -> Result<(), String>;
    fn subscribe(&self) -> broadcast::Receiver<AppEvent>;
    fn subscribe_filtered(&self, filter: EventFilter) -> broadcast::Receiver<AppEvent>;
}
