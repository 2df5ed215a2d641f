use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChatRole {
    User,
    Assistant,
    Tool,
    System,
}

/// Append-only within a session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub id: Uuid,
    pub session_id: Uuid,
    pub role: ChatRole,
    pub content: String,
    pub model: Option<String>,
    pub timestamp: DateTime<Utc>,
    pub tokens_in: Option<u32>,
    pub tokens_out: Option<u32>,
    pub cost_usd: Option<f64>,
}

impl ChatMessage {
    pub fn new(session_id: Uuid, role: ChatRole, content: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            session_id,
            role,
            content: content.into(),
            model: None,
            timestamp: Utc::now(),
            tokens_in: None,
            tokens_out: None,
            cost_usd: None,
        }
    }
}

/// A persisted event: tool invocations, safety denials, cron firings, and
/// anything else durable that isn't a chat message. Distinct from the
/// in-process `AppEvent` bus — this is the append-only record of it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PersistedEvent {
    pub id: Uuid,
    pub event_type: String,
    pub payload: Value,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default)]
pub struct EventQueryFilter {
    pub event_type: Option<String>,
    pub since: Option<DateTime<Utc>>,
    pub limit: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MemoryTier {
    Semantic,
    Episodic,
    Working,
}

/// Semantic/preference memories never expire; episodic memories expire
/// after the configured retention window.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryRecord {
    pub tier: MemoryTier,
    pub category: String,
    pub key: String,
    pub content: String,
    pub source: String,
    pub session_id: Option<Uuid>,
    pub created_at: DateTime<Utc>,
    pub last_accessed_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CostEntry {
    pub provider: String,
    pub tokens_in: u32,
    pub tokens_out: u32,
    pub usd: f64,
    pub ts: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CostRange {
    Day,
    Week,
    Month,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CostSummary {
    pub total_usd: f64,
    pub total_tokens_in: u64,
    pub total_tokens_out: u64,
    pub by_provider: std::collections::HashMap<String, f64>,
}

/// A thin port over conversations, events, memories, preferences, and the
/// cost ledger. Consumers MUST NOT rely on synchronous durability — writes
/// may be batched by the backing store.
#[async_trait]
pub trait Persistence: Send + Sync {
    async fn save_message(&self, msg: &ChatMessage) -> Result<(), String>;
    async fn get_session_messages(
        &self,
        session_id: Uuid,
        limit: usize,
    ) -> Result<Vec<ChatMessage>, String>;

    async fn save_event(&self, event_type: &str, payload: Value) -> Result<(), String>;
    async fn get_events(&self, filter: &EventQueryFilter) -> Result<Vec<PersistedEvent>, String>;

    async fn upsert_memory(&self, record: &MemoryRecord) -> Result<(), String>;
    async fn search_memories(
        &self,
        query: &str,
        tier: Option<MemoryTier>,
        limit: usize,
    ) -> Result<Vec<MemoryRecord>, String>;

    async fn get_preference(&self, key: &str) -> Result<Option<String>, String>;
    async fn set_preference(&self, key: &str, value: &str) -> Result<(), String>;

    async fn append_cost(&self, entry: &CostEntry) -> Result<(), String>;
    async fn summarize_cost(&self, range: CostRange) -> Result<CostSummary, String>;

    /// Delete episodic memories and conversations older than `retention_days`.
    /// Returns the number of rows removed. Intended to run on a background
    /// timer, not per-request.
    async fn expire_episodic(&self, retention_days: u32) -> Result<u64, String>;
}
