//! TOML configuration schema for JARVIS.
//!
//! All fields have `#[serde(default)]` so a partially-filled `jarvis.toml`
//! works correctly. Missing sections fall back to their `Default` impl.
//!
//! Example `<dataDir>/jarvis.toml`:
//! ```toml
//! [server]
//! port = 8443
//!
//! [security]
//! autonomy_level = "supervised"
//! override_key = "jarvis-unlock"
//! approval_keyword = "confirmed"
//!
//! [proxmox]
//! tls_insecure = true
//!
//! [[proxmox.nodes]]
//! name = "pve"
//! host = "192.168.1.10"
//! token_id = "root@pam!jarvis"
//! ```

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

// ─── ServerConfig ──────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ServerConfig {
    pub port: u16,
    pub jwt_secret: String,
    pub cors_origins: Vec<String>,
    pub data_dir: Option<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: 8080,
            jwt_secret: String::new(),
            cors_origins: vec!["*".to_owned()],
            data_dir: None,
        }
    }
}

// ─── SecurityConfig ────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SecurityConfig {
    /// Autonomy level: `"readonly"`, `"supervised"`, or `"autonomous"`.
    pub autonomy_level: String,
    /// Shared bearer-auth password (also settable via `JARVIS_PASSWORD`).
    pub password: String,
    /// Widens tier permissions for the remainder of the turn it appears in.
    pub override_key: String,
    /// Human-typed keyword ORANGE tools require to have appeared in the turn.
    pub approval_keyword: String,
    /// Commands blocked regardless of autonomy level.
    pub blocked_commands: Vec<String>,
    pub rate_limit_per_minute: u32,
    pub rate_limit_per_hour: u32,
    pub protected: ProtectedResources,
    /// Per-tool execution deadline in seconds (spec default 30s).
    pub tool_deadline_secs: u64,
}

impl Default for SecurityConfig {
    fn default() -> Self {
        Self {
            autonomy_level: "supervised".to_owned(),
            password: String::new(),
            override_key: String::new(),
            approval_keyword: "confirmed".to_owned(),
            blocked_commands: Vec::new(),
            rate_limit_per_minute: 60,
            rate_limit_per_hour: 600,
            protected: ProtectedResources::default(),
            tool_deadline_secs: 30,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct ProtectedResources {
    pub nodes: Vec<String>,
    pub vmids: Vec<u64>,
    pub services: Vec<String>,
    pub ips: Vec<String>,
}

// ─── ProxmoxConfig ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct ProxmoxNodeConfig {
    pub name: String,
    pub host: String,
    pub token_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ProxmoxConfig {
    pub nodes: Vec<ProxmoxNodeConfig>,
    /// `PVE_TOKEN_SECRET` — shared across nodes in this homelab's topology.
    pub token_secret: String,
    pub tls_insecure: bool,
    pub request_timeout_secs: u64,
    /// TTL in seconds for the `/cluster/resources` and `/cluster/status` cache.
    pub cache_ttl_secs: u64,
}

impl Default for ProxmoxConfig {
    fn default() -> Self {
        Self {
            nodes: Vec::new(),
            token_secret: String::new(),
            tls_insecure: true,
            request_timeout_secs: 15,
            cache_ttl_secs: 2,
        }
    }
}

// ─── SshConfig ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SshConfig {
    pub key_path: String,
    pub user: String,
    pub connect_timeout_secs: u64,
    pub command_timeout_secs: u64,
}

impl Default for SshConfig {
    fn default() -> Self {
        Self {
            key_path: String::new(),
            user: "root".to_owned(),
            connect_timeout_secs: 10,
            command_timeout_secs: 30,
        }
    }
}

// ─── DatabaseConfig ────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct DatabaseConfig {
    pub path: String,
    pub episodic_retention_days: u32,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: "jarvis.db".to_owned(),
            episodic_retention_days: 30,
        }
    }
}

// ─── TtsConfig ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct TtsConfig {
    pub primary_endpoint: String,
    pub fallback_endpoint: String,
    pub cache_dir: String,
    pub cache_max_memory: usize,
    pub cache_max_disk_per_engine: usize,
    pub max_parallel: usize,
    pub opus_enabled: bool,
    pub opus_bitrate: u32,
    pub synth_deadline_ms: u64,
    pub health_check_interval_secs: u64,
    pub restart_cooldown_secs: u64,
    pub prewarm_grace_secs: u64,
    pub prewarm_phrases: Vec<String>,
    /// Bind-mounted Docker-compatible control socket used to restart the
    /// primary engine's container after repeated health-probe failures.
    pub restart_socket_path: String,
    pub primary_container_name: String,
}

impl Default for TtsConfig {
    fn default() -> Self {
        Self {
            primary_endpoint: String::new(),
            fallback_endpoint: String::new(),
            cache_dir: "tts-cache".to_owned(),
            cache_max_memory: 200,
            cache_max_disk_per_engine: 500,
            max_parallel: 2,
            opus_enabled: false,
            opus_bitrate: 32_000,
            synth_deadline_ms: 8_000,
            health_check_interval_secs: 30,
            restart_cooldown_secs: 300,
            prewarm_grace_secs: 10,
            prewarm_phrases: vec![
                "Good morning.".to_owned(),
                "Right away.".to_owned(),
                "Done.".to_owned(),
            ],
            restart_socket_path: "/var/run/docker.sock".to_owned(),
            primary_container_name: "jarvis-tts-primary".to_owned(),
        }
    }
}

// ─── SttConfig ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SttConfig {
    pub endpoint: String,
    pub request_timeout_secs: u64,
}

impl Default for SttConfig {
    fn default() -> Self {
        Self {
            endpoint: String::new(),
            request_timeout_secs: 30,
        }
    }
}

// ─── LlmConfig ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct LlmConfig {
    pub conversational_endpoint: String,
    pub agentic_endpoint: String,
    pub agentic_api_key: String,
    pub request_timeout_secs: u64,
    pub max_retries: u32,
    pub max_iterations: u32,
    pub context_window_turns: usize,
    pub context_token_budget: u32,
    pub summarize_threshold_tokens: u32,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            conversational_endpoint: String::new(),
            agentic_endpoint: String::new(),
            agentic_api_key: String::new(),
            request_timeout_secs: 60,
            max_retries: 3,
            max_iterations: 10,
            context_window_turns: 20,
            context_token_budget: 6000,
            summarize_threshold_tokens: 4000,
        }
    }
}

// ─── TelemetryConfig ───────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct TelemetryConfig {
    pub nodes_interval_secs: u64,
    pub quorum_interval_secs: u64,
    pub vms_interval_secs: u64,
    pub storage_interval_secs: u64,
    pub temperature_interval_secs: u64,
    pub voice_agents_interval_secs: u64,
    pub alert_cooldown_secs: u64,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            nodes_interval_secs: 10,
            quorum_interval_secs: 10,
            vms_interval_secs: 15,
            storage_interval_secs: 30,
            temperature_interval_secs: 30,
            voice_agents_interval_secs: 10,
            alert_cooldown_secs: 300,
        }
    }
}

// ─── AppConfig ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub security: SecurityConfig,
    pub proxmox: ProxmoxConfig,
    pub ssh: SshConfig,
    pub database: DatabaseConfig,
    pub tts: TtsConfig,
    pub stt: SttConfig,
    pub llm: LlmConfig,
    pub telemetry: TelemetryConfig,
    /// Free-form extension point, unused by the core but kept for a
    /// per-category notification map supplied by operators.
    pub extra: HashMap<String, String>,
}
