//! SQLite-backed implementation of [`Persistence`].
//!
//! Mirrors the embedded-DDL-const pattern used elsewhere in this codebase:
//! schema is executed via `execute_batch` on open rather than through a
//! migration runner, so a fresh database and an in-memory test database
//! initialise identically.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::{Connection, OptionalExtension, params};
use uuid::Uuid;

use super::traits::{
    ChatMessage, ChatRole, CostEntry, CostRange, CostSummary, EventQueryFilter, MemoryRecord,
    MemoryTier, Persistence, PersistedEvent,
};

const SCHEMA_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS chat_messages (
    id TEXT PRIMARY KEY NOT NULL,
    session_id TEXT NOT NULL,
    role TEXT NOT NULL,
    content TEXT NOT NULL,
    model TEXT,
    timestamp TEXT NOT NULL,
    tokens_in INTEGER,
    tokens_out INTEGER,
    cost_usd REAL
);
CREATE INDEX IF NOT EXISTS idx_chat_messages_session ON chat_messages (session_id, timestamp);

CREATE TABLE IF NOT EXISTS events (
    id TEXT PRIMARY KEY NOT NULL,
    event_type TEXT NOT NULL,
    payload TEXT NOT NULL,
    created_at TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_events_type_time ON events (event_type, created_at);

CREATE TABLE IF NOT EXISTS memories (
    id TEXT PRIMARY KEY NOT NULL,
    tier TEXT NOT NULL,
    category TEXT NOT NULL,
    key TEXT NOT NULL UNIQUE,
    content TEXT NOT NULL,
    source TEXT NOT NULL,
    session_id TEXT,
    created_at TEXT NOT NULL,
    last_accessed_at TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_memories_tier ON memories (tier);

CREATE VIRTUAL TABLE IF NOT EXISTS memories_fts USING fts5(
    content,
    content='memories',
    content_rowid='rowid'
);
CREATE TRIGGER IF NOT EXISTS memories_ai AFTER INSERT ON memories BEGIN
    INSERT INTO memories_fts(rowid, content) VALUES (new.rowid, new.content);
END;
CREATE TRIGGER IF NOT EXISTS memories_ad AFTER DELETE ON memories BEGIN
    INSERT INTO memories_fts(memories_fts, rowid, content) VALUES('delete', old.rowid, old.content);
END;
CREATE TRIGGER IF NOT EXISTS memories_au AFTER UPDATE ON memories BEGIN
    INSERT INTO memories_fts(memories_fts, rowid, content) VALUES('delete', old.rowid, old.content);
    INSERT INTO memories_fts(rowid, content) VALUES (new.rowid, new.content);
END;

CREATE TABLE IF NOT EXISTS preferences (
    key TEXT PRIMARY KEY NOT NULL,
    value TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS cost_ledger (
    id TEXT PRIMARY KEY NOT NULL,
    provider TEXT NOT NULL,
    tokens_in INTEGER NOT NULL,
    tokens_out INTEGER NOT NULL,
    usd REAL NOT NULL,
    ts TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_cost_ledger_ts ON cost_ledger (ts);
"#;

pub struct SqlitePersistence {
    conn: Arc<Mutex<Connection>>,
}

impl SqlitePersistence {
    /// Open (or create) a database at `path` with the durability posture
    /// spec'd for JARVIS: WAL journaling, `synchronous=NORMAL`, and a
    /// ~64 MiB page cache (negative value => KiB, per SQLite's convention).
    pub fn open(path: &str) -> Result<Self, String> {
        let conn = Connection::open(path).map_err(|e| format!("sqlite open error: {e}"))?;
        conn.query_row("PRAGMA journal_mode=WAL", [], |_| Ok(()))
            .map_err(|e| format!("sqlite pragma error: {e}"))?;
        conn.execute_batch("PRAGMA synchronous=NORMAL; PRAGMA cache_size=-65536;")
            .map_err(|e| format!("sqlite pragma error: {e}"))?;
        conn.execute_batch(SCHEMA_SQL)
            .map_err(|e| format!("sqlite schema error: {e}"))?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    pub fn in_memory() -> Result<Self, String> {
        let conn =
            Connection::open_in_memory().map_err(|e| format!("sqlite in-memory error: {e}"))?;
        conn.execute_batch(SCHEMA_SQL)
            .map_err(|e| format!("sqlite schema error: {e}"))?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, Connection>, String> {
        self.conn.lock().map_err(|e| format!("sqlite lock error: {e}"))
    }
}

fn role_to_str(role: ChatRole) -> &'static str {
    match role {
        ChatRole::User => "user",
        ChatRole::Assistant => "assistant",
        ChatRole::Tool => "tool",
        ChatRole::System => "system",
    }
}

fn str_to_role(s: &str) -> ChatRole {
    match s {
        "assistant" => ChatRole::Assistant,
        "tool" => ChatRole::Tool,
        "system" => ChatRole::System,
        _ => ChatRole::User,
    }
}

fn tier_to_str(tier: MemoryTier) -> &'static str {
    match tier {
        MemoryTier::Semantic => "semantic",
        MemoryTier::Episodic => "episodic",
        MemoryTier::Working => "working",
    }
}

fn str_to_tier(s: &str) -> MemoryTier {
    match s {
        "episodic" => MemoryTier::Episodic,
        "working" => MemoryTier::Working,
        _ => MemoryTier::Semantic,
    }
}

fn parse_ts(s: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now())
}

/// Escape a free-text query into a safe FTS5 MATCH expression, quoting each
/// whitespace-delimited token so user input can't inject FTS5 operators.
fn sanitise_fts_query(query: &str) -> String {
    query
        .split_whitespace()
        .map(|tok| format!("\"{}\"", tok.replace('"', "\"\"")))
        .collect::<Vec<_>>()
        .join(" ")
}

#[async_trait]
impl Persistence for SqlitePersistence {
    async fn save_message(&self, msg: &ChatMessage) -> Result<(), String> {
        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO chat_messages
                (id, session_id, role, content, model, timestamp, tokens_in, tokens_out, cost_usd)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            params![
                msg.id.to_string(),
                msg.session_id.to_string(),
                role_to_str(msg.role),
                msg.content,
                msg.model,
                msg.timestamp.to_rfc3339(),
                msg.tokens_in,
                msg.tokens_out,
                msg.cost_usd,
            ],
        )
        .map_err(|e| format!("sqlite insert error: {e}"))?;
        Ok(())
    }

    async fn get_session_messages(
        &self,
        session_id: Uuid,
        limit: usize,
    ) -> Result<Vec<ChatMessage>, String> {
        let conn = self.lock()?;
        let mut stmt = conn
            .prepare(
                "SELECT id, session_id, role, content, model, timestamp, tokens_in, tokens_out, cost_usd
                 FROM chat_messages WHERE session_id = ?1 ORDER BY timestamp ASC LIMIT ?2",
            )
            .map_err(|e| format!("sqlite prepare error: {e}"))?;

        let rows = stmt
            .query_map(params![session_id.to_string(), limit as i64], |row| {
                let id: String = row.get(0)?;
                let session: String = row.get(1)?;
                let role: String = row.get(2)?;
                let ts: String = row.get(5)?;
                Ok(ChatMessage {
                    id: Uuid::parse_str(&id).unwrap_or_default(),
                    session_id: Uuid::parse_str(&session).unwrap_or_default(),
                    role: str_to_role(&role),
                    content: row.get(3)?,
                    model: row.get(4)?,
                    timestamp: parse_ts(&ts),
                    tokens_in: row.get(6)?,
                    tokens_out: row.get(7)?,
                    cost_usd: row.get(8)?,
                })
            })
            .map_err(|e| format!("sqlite query error: {e}"))?;

        Ok(rows.filter_map(Result::ok).collect())
    }

    async fn save_event(&self, event_type: &str, payload: serde_json::Value) -> Result<(), String> {
        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO events (id, event_type, payload, created_at) VALUES (?1, ?2, ?3, ?4)",
            params![
                Uuid::new_v4().to_string(),
                event_type,
                payload.to_string(),
                Utc::now().to_rfc3339(),
            ],
        )
        .map_err(|e| format!("sqlite insert error: {e}"))?;
        Ok(())
    }

    async fn get_events(&self, filter: &EventQueryFilter) -> Result<Vec<PersistedEvent>, String> {
        let conn = self.lock()?;
        let limit = if filter.limit == 0 { 100 } else { filter.limit };

        let mut sql = String::from(
            "SELECT id, event_type, payload, created_at FROM events WHERE 1=1",
        );
        if filter.event_type.is_some() {
            sql.push_str(" AND event_type = ?1");
        }
        if filter.since.is_some() {
            sql.push_str(if filter.event_type.is_some() {
                " AND created_at >= ?2"
            } else {
                " AND created_at >= ?1"
            });
        }
        sql.push_str(" ORDER BY created_at DESC LIMIT ?");
        sql.push_str(&(filter.event_type.is_some() as usize + filter.since.is_some() as usize + 1).to_string());

        let mut stmt = conn.prepare(&sql).map_err(|e| format!("sqlite prepare error: {e}"))?;

        let mut bound: Vec<Box<dyn rusqlite::ToSql>> = Vec::new();
        if let Some(t) = &filter.event_type {
            bound.push(Box::new(t.clone()));
        }
        if let Some(s) = &filter.since {
            bound.push(Box::new(s.to_rfc3339()));
        }
        bound.push(Box::new(limit as i64));

        let params_ref: Vec<&dyn rusqlite::ToSql> = bound.iter().map(|b| b.as_ref()).collect();

        let rows = stmt
            .query_map(params_ref.as_slice(), |row| {
                let id: String = row.get(0)?;
                let payload_str: String = row.get(2)?;
                let created: String = row.get(3)?;
                Ok(PersistedEvent {
                    id: Uuid::parse_str(&id).unwrap_or_default(),
                    event_type: row.get(1)?,
                    payload: serde_json::from_str(&payload_str).unwrap_or(serde_json::Value::Null),
                    created_at: parse_ts(&created),
                })
            })
            .map_err(|e| format!("sqlite query error: {e}"))?;

        Ok(rows.filter_map(Result::ok).collect())
    }

    async fn upsert_memory(&self, record: &MemoryRecord) -> Result<(), String> {
        let conn = self.lock()?;
        let existing: Option<(String, String)> = conn
            .query_row(
                "SELECT id, created_at FROM memories WHERE key = ?1",
                params![record.key],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()
            .map_err(|e| format!("sqlite query error: {e}"))?;

        let (id, created_at) = existing.unwrap_or_else(|| {
            (
                Uuid::new_v4().to_string(),
                record.created_at.to_rfc3339(),
            )
        });

        conn.execute(
            "INSERT INTO memories
                (id, tier, category, key, content, source, session_id, created_at, last_accessed_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
             ON CONFLICT(key) DO UPDATE SET
                tier = excluded.tier,
                category = excluded.category,
                content = excluded.content,
                source = excluded.source,
                session_id = excluded.session_id,
                last_accessed_at = excluded.last_accessed_at",
            params![
                id,
                tier_to_str(record.tier),
                record.category,
                record.key,
                record.content,
                record.source,
                record.session_id.map(|u| u.to_string()),
                created_at,
                record.last_accessed_at.to_rfc3339(),
            ],
        )
        .map_err(|e| format!("sqlite insert error: {e}"))?;
        Ok(())
    }

    async fn search_memories(
        &self,
        query: &str,
        tier: Option<MemoryTier>,
        limit: usize,
    ) -> Result<Vec<MemoryRecord>, String> {
        if limit == 0 {
            return Ok(Vec::new());
        }
        let conn = self.lock()?;

        let to_record = |row: &rusqlite::Row| -> rusqlite::Result<MemoryRecord> {
            let tier_str: String = row.get(1)?;
            let session: Option<String> = row.get(6)?;
            let created: String = row.get(7)?;
            let accessed: String = row.get(8)?;
            Ok(MemoryRecord {
                tier: str_to_tier(&tier_str),
                category: row.get(2)?,
                key: row.get(3)?,
                content: row.get(4)?,
                source: row.get(5)?,
                session_id: session.and_then(|s| Uuid::parse_str(&s).ok()),
                created_at: parse_ts(&created),
                last_accessed_at: parse_ts(&accessed),
            })
        };

        let mut results: Vec<MemoryRecord> = if query.trim().is_empty() {
            let mut stmt = conn
                .prepare(
                    "SELECT id, tier, category, key, content, source, session_id, created_at, last_accessed_at
                     FROM memories ORDER BY last_accessed_at DESC LIMIT ?1",
                )
                .map_err(|e| format!("sqlite prepare error: {e}"))?;
            let rows = stmt
                .query_map(params![limit as i64], to_record)
                .map_err(|e| format!("sqlite query error: {e}"))?;
            rows.filter_map(Result::ok).collect()
        } else {
            let fts_query = sanitise_fts_query(query);
            let mut stmt = conn
                .prepare(
                    "SELECT m.id, m.tier, m.category, m.key, m.content, m.source, m.session_id,
                            m.created_at, m.last_accessed_at
                     FROM memories_fts
                     JOIN memories m ON m.rowid = memories_fts.rowid
                     WHERE memories_fts MATCH ?1
                     ORDER BY -bm25(memories_fts) DESC
                     LIMIT ?2",
                )
                .map_err(|e| format!("sqlite prepare error: {e}"))?;
            let rows = stmt
                .query_map(params![fts_query, limit as i64], to_record)
                .map_err(|e| format!("sqlite query error: {e}"))?;
            let mut out: Vec<MemoryRecord> = rows.filter_map(Result::ok).collect();

            if out.is_empty() {
                let like_pat = format!("%{}%", query.replace('%', "\\%").replace('_', "\\_"));
                let mut fallback = conn
                    .prepare(
                        "SELECT id, tier, category, key, content, source, session_id, created_at, last_accessed_at
                         FROM memories WHERE content LIKE ?1 ESCAPE '\\' LIMIT ?2",
                    )
                    .map_err(|e| format!("sqlite prepare error: {e}"))?;
                let fb_rows = fallback
                    .query_map(params![like_pat, limit as i64], to_record)
                    .map_err(|e| format!("sqlite query error: {e}"))?;
                out = fb_rows.filter_map(Result::ok).collect();
            }
            out
        };

        if let Some(t) = tier {
            results.retain(|r| r.tier == t);
        }
        Ok(results)
    }

    async fn get_preference(&self, key: &str) -> Result<Option<String>, String> {
        let conn = self.lock()?;
        conn.query_row(
            "SELECT value FROM preferences WHERE key = ?1",
            params![key],
            |row| row.get(0),
        )
        .optional()
        .map_err(|e| format!("sqlite query error: {e}"))
    }

    async fn set_preference(&self, key: &str, value: &str) -> Result<(), String> {
        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO preferences (key, value) VALUES (?1, ?2)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value",
            params![key, value],
        )
        .map_err(|e| format!("sqlite insert error: {e}"))?;
        Ok(())
    }

    async fn append_cost(&self, entry: &CostEntry) -> Result<(), String> {
        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO cost_ledger (id, provider, tokens_in, tokens_out, usd, ts)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                Uuid::new_v4().to_string(),
                entry.provider,
                entry.tokens_in,
                entry.tokens_out,
                entry.usd,
                entry.ts.to_rfc3339(),
            ],
        )
        .map_err(|e| format!("sqlite insert error: {e}"))?;
        Ok(())
    }

    async fn summarize_cost(&self, range: CostRange) -> Result<CostSummary, String> {
        let conn = self.lock()?;
        let cutoff = match range {
            CostRange::Day => Utc::now() - chrono::Duration::days(1),
            CostRange::Week => Utc::now() - chrono::Duration::weeks(1),
            CostRange::Month => Utc::now() - chrono::Duration::days(30),
        };

        let mut stmt = conn
            .prepare("SELECT provider, tokens_in, tokens_out, usd FROM cost_ledger WHERE ts >= ?1")
            .map_err(|e| format!("sqlite prepare error: {e}"))?;

        let rows = stmt
            .query_map(params![cutoff.to_rfc3339()], |row| {
                let provider: String = row.get(0)?;
                let tokens_in: i64 = row.get(1)?;
                let tokens_out: i64 = row.get(2)?;
                let usd: f64 = row.get(3)?;
                Ok((provider, tokens_in as u64, tokens_out as u64, usd))
            })
            .map_err(|e| format!("sqlite query error: {e}"))?;

        let mut summary = CostSummary::default();
        for row in rows.filter_map(Result::ok) {
            let (provider, tokens_in, tokens_out, usd) = row;
            summary.total_usd += usd;
            summary.total_tokens_in += tokens_in;
            summary.total_tokens_out += tokens_out;
            *summary.by_provider.entry(provider).or_insert(0.0) += usd;
        }
        Ok(summary)
    }

    async fn expire_episodic(&self, retention_days: u32) -> Result<u64, String> {
        let conn = self.lock()?;
        let cutoff = (Utc::now() - chrono::Duration::days(retention_days as i64)).to_rfc3339();

        let memories_deleted = conn
            .execute(
                "DELETE FROM memories WHERE tier = 'episodic' AND last_accessed_at < ?1",
                params![cutoff],
            )
            .map_err(|e| format!("sqlite delete error: {e}"))?;

        let messages_deleted = conn
            .execute(
                "DELETE FROM chat_messages WHERE timestamp < ?1",
                params![cutoff],
            )
            .map_err(|e| format!("sqlite delete error: {e}"))?;

        Ok((memories_deleted + messages_deleted) as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> SqlitePersistence {
        SqlitePersistence::in_memory().expect("in-memory sqlite")
    }

    #[tokio::test]
    async fn save_and_fetch_session_messages() {
        let db = store();
        let session = Uuid::new_v4();
        db.save_message(&ChatMessage::new(session, ChatRole::User, "status"))
            .await
            .unwrap();
        db.save_message(&ChatMessage::new(session, ChatRole::Assistant, "all green"))
            .await
            .unwrap();

        let msgs = db.get_session_messages(session, 10).await.unwrap();
        assert_eq!(msgs.len(), 2);
        assert_eq!(msgs[0].role, ChatRole::User);
        assert_eq!(msgs[1].content, "all green");
    }

    #[tokio::test]
    async fn messages_from_other_sessions_are_excluded() {
        let db = store();
        db.save_message(&ChatMessage::new(Uuid::new_v4(), ChatRole::User, "a"))
            .await
            .unwrap();
        let session = Uuid::new_v4();
        db.save_message(&ChatMessage::new(session, ChatRole::User, "b"))
            .await
            .unwrap();

        let msgs = db.get_session_messages(session, 10).await.unwrap();
        assert_eq!(msgs.len(), 1);
        assert_eq!(msgs[0].content, "b");
    }

    #[tokio::test]
    async fn save_and_filter_events() {
        let db = store();
        db.save_event("tool_invocation", serde_json::json!({"name": "stop_vm"}))
            .await
            .unwrap();
        db.save_event("safety_denied", serde_json::json!({"reason": "blocked"}))
            .await
            .unwrap();

        let all = db.get_events(&EventQueryFilter::default()).await.unwrap();
        assert_eq!(all.len(), 2);

        let filtered = db
            .get_events(&EventQueryFilter {
                event_type: Some("safety_denied".to_owned()),
                since: None,
                limit: 10,
            })
            .await
            .unwrap();
        assert_eq!(filtered.len(), 1);
        assert_eq!(filtered[0].event_type, "safety_denied");
    }

    #[tokio::test]
    async fn memory_round_trip_and_search() {
        let db = store();
        let now = Utc::now();
        db.upsert_memory(&MemoryRecord {
            tier: MemoryTier::Semantic,
            category: "preference".to_owned(),
            key: "favorite_node".to_owned(),
            content: "pve2 is the GPU box".to_owned(),
            source: "user".to_owned(),
            session_id: None,
            created_at: now,
            last_accessed_at: now,
        })
        .await
        .unwrap();

        let results = db.search_memories("GPU box", None, 5).await.unwrap();
        assert!(!results.is_empty());
        assert_eq!(results[0].key, "favorite_node");
    }

    #[tokio::test]
    async fn memory_upsert_preserves_id_and_created_at() {
        let db = store();
        let now = Utc::now();
        let record = MemoryRecord {
            tier: MemoryTier::Working,
            category: "scratch".to_owned(),
            key: "k".to_owned(),
            content: "first".to_owned(),
            source: "llm".to_owned(),
            session_id: None,
            created_at: now,
            last_accessed_at: now,
        };
        db.upsert_memory(&record).await.unwrap();
        db.upsert_memory(&MemoryRecord {
            content: "second".to_owned(),
            ..record
        })
        .await
        .unwrap();

        let results = db.search_memories("second", None, 5).await.unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].content, "second");
    }

    #[tokio::test]
    async fn preference_round_trip() {
        let db = store();
        assert_eq!(db.get_preference("theme").await.unwrap(), None);
        db.set_preference("theme", "dark").await.unwrap();
        assert_eq!(db.get_preference("theme").await.unwrap(), Some("dark".to_owned()));
        db.set_preference("theme", "light").await.unwrap();
        assert_eq!(db.get_preference("theme").await.unwrap(), Some("light".to_owned()));
    }

    #[tokio::test]
    async fn cost_ledger_summarizes_by_provider() {
        let db = store();
        db.append_cost(&CostEntry {
            provider: "agentic".to_owned(),
            tokens_in: 100,
            tokens_out: 50,
            usd: 0.01,
            ts: Utc::now(),
        })
        .await
        .unwrap();
        db.append_cost(&CostEntry {
            provider: "conversational".to_owned(),
            tokens_in: 20,
            tokens_out: 20,
            usd: 0.002,
            ts: Utc::now(),
        })
        .await
        .unwrap();

        let summary = db.summarize_cost(CostRange::Day).await.unwrap();
        assert_eq!(summary.total_tokens_in, 120);
        assert!((summary.total_usd - 0.012).abs() < 1e-9);
        assert_eq!(summary.by_provider.len(), 2);
    }

    #[tokio::test]
    async fn cost_ledger_excludes_entries_outside_range() {
        let db = store();
        db.append_cost(&CostEntry {
            provider: "agentic".to_owned(),
            tokens_in: 10,
            tokens_out: 10,
            usd: 0.001,
            ts: Utc::now() - chrono::Duration::days(45),
        })
        .await
        .unwrap();

        let summary = db.summarize_cost(CostRange::Month).await.unwrap();
        assert_eq!(summary.total_tokens_in, 0);
    }

    #[tokio::test]
    async fn expire_episodic_removes_old_rows_only() {
        let db = store();
        let old = Utc::now() - chrono::Duration::days(40);
        db.upsert_memory(&MemoryRecord {
            tier: MemoryTier::Episodic,
            category: "conversation".to_owned(),
            key: "old_entry".to_owned(),
            content: "stale".to_owned(),
            source: "llm".to_owned(),
            session_id: None,
            created_at: old,
            last_accessed_at: old,
        })
        .await
        .unwrap();
        let now = Utc::now();
        db.upsert_memory(&MemoryRecord {
            tier: MemoryTier::Semantic,
            category: "preference".to_owned(),
            key: "fresh_entry".to_owned(),
            content: "kept".to_owned(),
            source: "user".to_owned(),
            session_id: None,
            created_at: now,
            last_accessed_at: now,
        })
        .await
        .unwrap();

        let removed = db.expire_episodic(30).await.unwrap();
        assert_eq!(removed, 1);

        let remaining = db.search_memories("", None, 10).await.unwrap();
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].key, "fresh_entry");
    }
}
