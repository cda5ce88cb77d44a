//! SQLite-backed session and message storage.
//!
//! Messages are append-only; compression never rewrites rows — a summary
//! checkpoint message is appended and `summary_message_id` moves forward,
//! so older rows stay on disk but are skipped on load. The connection
//! opens lazily and serializes writes behind a mutex; per-session write
//! ordering follows from the append call order within a session's turn.

use std::path::PathBuf;

use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension};
use serde::Serialize;

use gp_domain::error::{Error, Result};
use gp_domain::tool::{ContentBlock, Message, MessageContent, Role};

/// Schema version recorded in `PRAGMA user_version`.
const SCHEMA_VERSION: i32 = 2;

const SCHEMA_V1: &str = r#"
CREATE TABLE IF NOT EXISTS sessions (
    id TEXT PRIMARY KEY,
    title TEXT NOT NULL DEFAULT '',
    created_at REAL NOT NULL,
    updated_at REAL NOT NULL
);

CREATE TABLE IF NOT EXISTS messages (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    session_id TEXT NOT NULL,
    role TEXT NOT NULL,
    content TEXT NOT NULL,
    created_at REAL NOT NULL,
    FOREIGN KEY (session_id) REFERENCES sessions(id) ON DELETE CASCADE
);

CREATE INDEX IF NOT EXISTS idx_messages_session ON messages(session_id, id);
"#;

/// V2: sub-agent parentage, summary checkpoints, token counters, ordinals.
/// Applied idempotently — a failed ALTER means the column already exists.
const MIGRATION_V2: &[&str] = &[
    "ALTER TABLE sessions ADD COLUMN parent_session_id TEXT DEFAULT NULL",
    "ALTER TABLE sessions ADD COLUMN summary_message_id INTEGER DEFAULT NULL",
    "ALTER TABLE sessions ADD COLUMN total_input_tokens INTEGER DEFAULT 0",
    "ALTER TABLE sessions ADD COLUMN total_output_tokens INTEGER DEFAULT 0",
    "ALTER TABLE messages ADD COLUMN ordinal INTEGER DEFAULT 0",
];

/// Session metadata row.
#[derive(Debug, Clone, Serialize)]
pub struct SessionMeta {
    pub id: String,
    pub title: String,
    pub created_at: f64,
    pub updated_at: f64,
    pub parent_session_id: Option<String>,
    pub summary_message_id: Option<i64>,
    pub total_input_tokens: i64,
    pub total_output_tokens: i64,
}

/// Updatable metadata fields. Anything not listed here cannot be changed
/// after creation.
#[derive(Debug, Clone, Default)]
pub struct MetaUpdate {
    pub title: Option<String>,
    pub summary_message_id: Option<i64>,
    pub total_input_tokens: Option<i64>,
    pub total_output_tokens: Option<i64>,
}

/// SQLite-backed session store.
pub struct SessionStore {
    path: PathBuf,
    conn: Mutex<Option<Connection>>,
}

impl SessionStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            conn: Mutex::new(None),
        }
    }

    /// In-memory store for tests.
    pub fn in_memory() -> Self {
        Self::new(":memory:")
    }

    fn open(&self) -> Result<Connection> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let conn = Connection::open(&self.path).map_err(store_err)?;
        conn.execute_batch(SCHEMA_V1).map_err(store_err)?;
        conn.pragma_update(None, "journal_mode", "WAL")
            .map_err(store_err)?;
        migrate(&conn)?;
        Ok(conn)
    }

    fn with_conn<T>(&self, f: impl FnOnce(&Connection) -> rusqlite::Result<T>) -> Result<T> {
        let mut guard = self.conn.lock();
        if guard.is_none() {
            *guard = Some(self.open()?);
        }
        f(guard.as_ref().expect("connection just opened")).map_err(store_err)
    }

    // ── Sessions ───────────────────────────────────────────────────

    pub fn create_session(&self, title: &str) -> Result<String> {
        let id = uuid::Uuid::new_v4().to_string();
        let now = now_secs();
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO sessions (id, title, created_at, updated_at) VALUES (?1, ?2, ?3, ?4)",
                params![id, title, now, now],
            )
        })?;
        Ok(id)
    }

    /// Create a child session for a sub-agent run. Children are hidden
    /// from top-level listings.
    pub fn create_child_session(&self, parent_id: &str, title: &str) -> Result<String> {
        let id = uuid::Uuid::new_v4().to_string();
        let now = now_secs();
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO sessions (id, title, created_at, updated_at, parent_session_id) \
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![id, title, now, now, parent_id],
            )
        })?;
        Ok(id)
    }

    pub fn list_sessions(&self) -> Result<Vec<SessionMeta>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, title, created_at, updated_at, parent_session_id, \
                        summary_message_id, total_input_tokens, total_output_tokens \
                 FROM sessions WHERE parent_session_id IS NULL ORDER BY updated_at DESC",
            )?;
            let rows = stmt.query_map([], row_to_meta)?;
            rows.collect()
        })
    }

    /// Delete a session; messages cascade.
    pub fn delete_session(&self, session_id: &str) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute("DELETE FROM messages WHERE session_id = ?1", [session_id])?;
            conn.execute("DELETE FROM sessions WHERE id = ?1", [session_id])?;
            Ok(())
        })
    }

    pub fn get_session_meta(&self, session_id: &str) -> Result<Option<SessionMeta>> {
        self.with_conn(|conn| {
            conn.query_row(
                "SELECT id, title, created_at, updated_at, parent_session_id, \
                        summary_message_id, total_input_tokens, total_output_tokens \
                 FROM sessions WHERE id = ?1",
                [session_id],
                row_to_meta,
            )
            .optional()
        })
    }

    pub fn update_session_meta(&self, session_id: &str, update: MetaUpdate) -> Result<()> {
        let mut sets: Vec<&str> = Vec::new();
        let mut values: Vec<Box<dyn rusqlite::ToSql>> = Vec::new();

        if let Some(title) = update.title {
            sets.push("title = ?");
            values.push(Box::new(title));
        }
        if let Some(id) = update.summary_message_id {
            sets.push("summary_message_id = ?");
            values.push(Box::new(id));
        }
        if let Some(n) = update.total_input_tokens {
            sets.push("total_input_tokens = ?");
            values.push(Box::new(n));
        }
        if let Some(n) = update.total_output_tokens {
            sets.push("total_output_tokens = ?");
            values.push(Box::new(n));
        }
        if sets.is_empty() {
            return Ok(());
        }

        sets.push("updated_at = ?");
        values.push(Box::new(now_secs()));
        values.push(Box::new(session_id.to_owned()));

        let sql = format!(
            "UPDATE sessions SET {} WHERE id = ?",
            sets.join(", ")
        );
        self.with_conn(|conn| {
            conn.execute(&sql, rusqlite::params_from_iter(values.iter().map(|v| v.as_ref())))?;
            Ok(())
        })
    }

    /// Accumulate token usage onto the session counters.
    pub fn add_token_usage(&self, session_id: &str, input: i64, output: i64) -> Result<()> {
        let now = now_secs();
        self.with_conn(|conn| {
            conn.execute(
                "UPDATE sessions SET total_input_tokens = total_input_tokens + ?1, \
                        total_output_tokens = total_output_tokens + ?2, updated_at = ?3 \
                 WHERE id = ?4",
                params![input, output, now, session_id],
            )?;
            Ok(())
        })
    }

    // ── Messages ───────────────────────────────────────────────────

    /// Append one message; the next ordinal is assigned atomically with
    /// the insert. Returns the row id.
    pub fn append_message(
        &self,
        session_id: &str,
        role: Role,
        content: &MessageContent,
    ) -> Result<i64> {
        let encoded = encode_content(content)?;
        let now = now_secs();
        self.with_conn(|conn| {
            let ordinal: i64 = conn.query_row(
                "SELECT COALESCE(MAX(ordinal), -1) + 1 FROM messages WHERE session_id = ?1",
                [session_id],
                |row| row.get(0),
            )?;
            conn.execute(
                "INSERT INTO messages (session_id, role, content, created_at, ordinal) \
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![session_id, role.as_str(), encoded, now, ordinal],
            )?;
            let id = conn.last_insert_rowid();
            conn.execute(
                "UPDATE sessions SET updated_at = ?1 WHERE id = ?2",
                params![now, session_id],
            )?;
            Ok(id)
        })
    }

    pub fn load_messages(&self, session_id: &str) -> Result<Vec<Message>> {
        self.load_messages_from(session_id, 0)
    }

    /// Load messages starting from a message id — the summary-checkpoint
    /// resume path.
    pub fn load_messages_from(&self, session_id: &str, from_id: i64) -> Result<Vec<Message>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT role, content FROM messages \
                 WHERE session_id = ?1 AND id >= ?2 ORDER BY id",
            )?;
            let rows = stmt.query_map(params![session_id, from_id], |row| {
                let role: String = row.get(0)?;
                let content: String = row.get(1)?;
                Ok((role, content))
            })?;

            let mut messages = Vec::new();
            for row in rows {
                let (role, content) = row?;
                let role = Role::parse(&role).unwrap_or(Role::User);
                messages.push(Message {
                    role,
                    content: decode_content(&content),
                });
            }
            Ok(messages)
        })
    }

    /// Ordinals in insertion order, for diagnostics and tests.
    pub fn message_ordinals(&self, session_id: &str) -> Result<Vec<i64>> {
        self.with_conn(|conn| {
            let mut stmt = conn
                .prepare("SELECT ordinal FROM messages WHERE session_id = ?1 ORDER BY id")?;
            let rows = stmt.query_map([session_id], |row| row.get(0))?;
            rows.collect()
        })
    }

    /// Bulk replace (legacy path): clears and re-inserts.
    pub fn save_messages(&self, session_id: &str, messages: &[Message]) -> Result<()> {
        let now = now_secs();
        let encoded: Vec<(String, String)> = messages
            .iter()
            .map(|m| Ok((m.role.as_str().to_owned(), encode_content(&m.content)?)))
            .collect::<Result<_>>()?;

        self.with_conn(|conn| {
            conn.execute("DELETE FROM messages WHERE session_id = ?1", [session_id])?;
            for (ordinal, (role, content)) in encoded.iter().enumerate() {
                conn.execute(
                    "INSERT INTO messages (session_id, role, content, created_at, ordinal) \
                     VALUES (?1, ?2, ?3, ?4, ?5)",
                    params![session_id, role, content, now, ordinal as i64],
                )?;
            }
            conn.execute(
                "UPDATE sessions SET updated_at = ?1 WHERE id = ?2",
                params![now, session_id],
            )?;
            Ok(())
        })
    }

    /// Close the connection. A later call reopens lazily.
    pub fn close(&self) {
        *self.conn.lock() = None;
    }
}

// ── Helpers ────────────────────────────────────────────────────────

fn migrate(conn: &Connection) -> Result<()> {
    let version: i32 = conn
        .query_row("PRAGMA user_version", [], |row| row.get(0))
        .map_err(store_err)?;

    if version < SCHEMA_VERSION {
        for stmt in MIGRATION_V2 {
            // Column may already exist from a partial migration.
            let _ = conn.execute(stmt, []);
        }
        conn.pragma_update(None, "user_version", SCHEMA_VERSION)
            .map_err(store_err)?;
        tracing::info!(version = SCHEMA_VERSION, "session db migrated");
    }
    Ok(())
}

fn encode_content(content: &MessageContent) -> Result<String> {
    match content {
        MessageContent::Text(t) => Ok(t.clone()),
        MessageContent::Blocks(blocks) => Ok(serde_json::to_string(blocks)?),
    }
}

fn decode_content(raw: &str) -> MessageContent {
    match serde_json::from_str::<Vec<ContentBlock>>(raw) {
        Ok(blocks) => MessageContent::Blocks(blocks),
        Err(_) => MessageContent::Text(raw.to_owned()),
    }
}

fn row_to_meta(row: &rusqlite::Row<'_>) -> rusqlite::Result<SessionMeta> {
    Ok(SessionMeta {
        id: row.get(0)?,
        title: row.get(1)?,
        created_at: row.get(2)?,
        updated_at: row.get(3)?,
        parent_session_id: row.get(4)?,
        summary_message_id: row.get(5)?,
        total_input_tokens: row.get(6)?,
        total_output_tokens: row.get(7)?,
    })
}

fn store_err(e: rusqlite::Error) -> Error {
    Error::Session(e.to_string())
}

fn now_secs() -> f64 {
    chrono::Utc::now().timestamp_millis() as f64 / 1000.0
}

#[cfg(test)]
mod tests {
    use super::*;
    use gp_domain::tool::ContentBlock;
    use serde_json::json;

    fn store() -> SessionStore {
        SessionStore::in_memory()
    }

    #[test]
    fn create_and_get_meta() {
        let store = store();
        let id = store.create_session("First").unwrap();
        let meta = store.get_session_meta(&id).unwrap().unwrap();
        assert_eq!(meta.title, "First");
        assert!(meta.parent_session_id.is_none());
        assert!(meta.summary_message_id.is_none());
        assert_eq!(meta.total_input_tokens, 0);
    }

    #[test]
    fn append_assigns_monotonic_ordinals() {
        let store = store();
        let sid = store.create_session("s").unwrap();

        let mut ids = Vec::new();
        for i in 0..5 {
            let id = store
                .append_message(&sid, Role::User, &MessageContent::Text(format!("m{i}")))
                .unwrap();
            ids.push(id);
        }

        assert!(ids.windows(2).all(|w| w[0] < w[1]));
        assert_eq!(store.message_ordinals(&sid).unwrap(), vec![0, 1, 2, 3, 4]);

        let messages = store.load_messages(&sid).unwrap();
        let texts: Vec<_> = messages
            .iter()
            .filter_map(|m| m.content.text())
            .collect();
        assert_eq!(texts, vec!["m0", "m1", "m2", "m3", "m4"]);
    }

    #[test]
    fn block_content_round_trips_as_json() {
        let store = store();
        let sid = store.create_session("s").unwrap();

        let blocks = MessageContent::Blocks(vec![
            ContentBlock::Text {
                text: "checking".into(),
            },
            ContentBlock::ToolUse {
                id: "t1".into(),
                name: "graph_monitor".into(),
                input: json!({"action": "get_queue"}),
            },
        ]);
        store
            .append_message(&sid, Role::Assistant, &blocks)
            .unwrap();

        let loaded = store.load_messages(&sid).unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].role, Role::Assistant);
        match &loaded[0].content {
            MessageContent::Blocks(blocks) => {
                assert_eq!(blocks.len(), 2);
                assert!(matches!(&blocks[1], ContentBlock::ToolUse { name, .. } if name == "graph_monitor"));
            }
            other => panic!("expected blocks, got {other:?}"),
        }
    }

    #[test]
    fn plain_text_survives_load() {
        let store = store();
        let sid = store.create_session("s").unwrap();
        store
            .append_message(&sid, Role::User, &MessageContent::Text("hello".into()))
            .unwrap();
        let loaded = store.load_messages(&sid).unwrap();
        assert!(matches!(&loaded[0].content, MessageContent::Text(t) if t == "hello"));
    }

    #[test]
    fn summary_checkpoint_resume() {
        let store = store();
        let sid = store.create_session("s").unwrap();

        for i in 0..10 {
            store
                .append_message(&sid, Role::User, &MessageContent::Text(format!("old{i}")))
                .unwrap();
        }
        let checkpoint = store
            .append_message(
                &sid,
                Role::User,
                &MessageContent::Text("[Previous conversation summary]\n…".into()),
            )
            .unwrap();
        store
            .append_message(&sid, Role::Assistant, &MessageContent::Text("recent".into()))
            .unwrap();

        store
            .update_session_meta(
                &sid,
                MetaUpdate {
                    summary_message_id: Some(checkpoint),
                    ..Default::default()
                },
            )
            .unwrap();

        let meta = store.get_session_meta(&sid).unwrap().unwrap();
        assert_eq!(meta.summary_message_id, Some(checkpoint));

        let resumed = store.load_messages_from(&sid, checkpoint).unwrap();
        assert_eq!(resumed.len(), 2);
        assert!(resumed[0]
            .content
            .text()
            .unwrap()
            .starts_with("[Previous conversation summary]"));
    }

    #[test]
    fn child_sessions_hidden_from_listing() {
        let store = store();
        let parent = store.create_session("parent").unwrap();
        let child = store
            .create_child_session(&parent, "Sub-agent: research")
            .unwrap();

        let listed = store.list_sessions().unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].id, parent);

        let child_meta = store.get_session_meta(&child).unwrap().unwrap();
        assert_eq!(child_meta.parent_session_id.as_deref(), Some(parent.as_str()));
    }

    #[test]
    fn delete_cascades_messages() {
        let store = store();
        let sid = store.create_session("s").unwrap();
        store
            .append_message(&sid, Role::User, &MessageContent::Text("hi".into()))
            .unwrap();
        store.delete_session(&sid).unwrap();

        assert!(store.get_session_meta(&sid).unwrap().is_none());
        assert!(store.load_messages(&sid).unwrap().is_empty());
    }

    #[test]
    fn save_messages_replaces_all() {
        let store = store();
        let sid = store.create_session("s").unwrap();
        store
            .append_message(&sid, Role::User, &MessageContent::Text("old".into()))
            .unwrap();

        store
            .save_messages(
                &sid,
                &[Message::user("new1"), Message::assistant("new2")],
            )
            .unwrap();

        let loaded = store.load_messages(&sid).unwrap();
        assert_eq!(loaded.len(), 2);
        assert_eq!(loaded[0].content.text(), Some("new1"));
        assert_eq!(store.message_ordinals(&sid).unwrap(), vec![0, 1]);
    }

    #[test]
    fn token_usage_accumulates() {
        let store = store();
        let sid = store.create_session("s").unwrap();
        store.add_token_usage(&sid, 100, 20).unwrap();
        store.add_token_usage(&sid, 50, 5).unwrap();

        let meta = store.get_session_meta(&sid).unwrap().unwrap();
        assert_eq!(meta.total_input_tokens, 150);
        assert_eq!(meta.total_output_tokens, 25);
    }

    #[test]
    fn schema_version_recorded_on_file_db() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sessions.db");
        let store = SessionStore::new(&path);
        store.create_session("s").unwrap();
        store.close();

        // Reopening migrates idempotently.
        let store = SessionStore::new(&path);
        let sessions = store.list_sessions().unwrap();
        assert_eq!(sessions.len(), 1);
    }
}
