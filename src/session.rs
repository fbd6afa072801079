//! Durable conversation persistence over a single SQLite file.
//!
//! The handle lives behind a mutex: the store is reached from handler code
//! on the reactor thread and from upstream workers persisting completed
//! turns. WAL mode keeps concurrent readers cheap.

use rand::RngCore;
use rusqlite::{params, Connection, OptionalExtension};
use serde_json::{json, Value};
use std::path::Path;
use std::sync::Mutex;

use crate::error::{GatewayError, Result};

pub const DEFAULT_HISTORY_LIMIT: u32 = 50;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    User,
    Assistant,
    System,
}

impl Role {
    pub fn as_str(self) -> &'static str {
        match self {
            Role::User => "user",
            Role::Assistant => "assistant",
            Role::System => "system",
        }
    }
}

pub struct SessionStore {
    conn: Mutex<Connection>,
}

impl SessionStore {
    pub fn open(path: &Path) -> Result<SessionStore> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let conn = Connection::open(path)?;
        Self::init(conn)
    }

    pub fn open_in_memory() -> Result<SessionStore> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<SessionStore> {
        conn.execute_batch(
            "PRAGMA journal_mode=WAL;
             PRAGMA synchronous=NORMAL;",
        )?;
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS sessions (
                id TEXT PRIMARY KEY,
                channel_id TEXT NOT NULL,
                created_at INTEGER NOT NULL,
                updated_at INTEGER NOT NULL
            );
            CREATE TABLE IF NOT EXISTS messages (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                session_id TEXT NOT NULL,
                role TEXT NOT NULL,
                content TEXT NOT NULL,
                created_at INTEGER NOT NULL,
                FOREIGN KEY (session_id) REFERENCES sessions(id)
            );
            CREATE INDEX IF NOT EXISTS idx_messages_session ON messages(session_id);",
        )?;
        Ok(SessionStore {
            conn: Mutex::new(conn),
        })
    }

    /// Create a session with a fresh random id (128 bits, 32 hex chars).
    pub fn create_session(&self, channel_id: &str) -> Result<String> {
        let id = generate_session_id();
        let now = now_unix();
        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO sessions (id, channel_id, created_at, updated_at) VALUES (?1, ?2, ?3, ?4)",
            params![id, channel_id, now, now],
        )?;
        Ok(id)
    }

    /// Make sure a session row exists for a caller-supplied id (webhook
    /// continuity). Existing rows are left untouched.
    pub fn ensure_session(&self, session_id: &str, channel_id: &str) -> Result<()> {
        let now = now_unix();
        let conn = self.lock()?;
        conn.execute(
            "INSERT OR IGNORE INTO sessions (id, channel_id, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4)",
            params![session_id, channel_id, now, now],
        )?;
        Ok(())
    }

    pub fn session_exists(&self, session_id: &str) -> Result<bool> {
        let conn = self.lock()?;
        let found: Option<String> = conn
            .query_row(
                "SELECT id FROM sessions WHERE id = ?1",
                params![session_id],
                |row| row.get(0),
            )
            .optional()?;
        Ok(found.is_some())
    }

    /// Append a message and bump the session's updated_at.
    pub fn add_message(&self, session_id: &str, role: Role, content: &str) -> Result<()> {
        let now = now_unix();
        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO messages (session_id, role, content, created_at) VALUES (?1, ?2, ?3, ?4)",
            params![session_id, role.as_str(), content, now],
        )?;
        conn.execute(
            "UPDATE sessions SET updated_at = ?1 WHERE id = ?2",
            params![now, session_id],
        )?;
        Ok(())
    }

    /// History rows for a session, newest first, as a JSON array of
    /// `{role, content}`. String fields go through serde_json.
    pub fn history_json(&self, session_id: &str, limit: u32) -> Result<Value> {
        let rows = self.history(session_id, limit)?;
        Ok(Value::Array(
            rows.into_iter()
                .map(|(role, content)| json!({ "role": role, "content": content }))
                .collect(),
        ))
    }

    /// History rows, newest first.
    pub fn history(&self, session_id: &str, limit: u32) -> Result<Vec<(String, String)>> {
        let limit = if limit == 0 { DEFAULT_HISTORY_LIMIT } else { limit };
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT role, content FROM messages WHERE session_id = ?1
             ORDER BY created_at DESC, id DESC LIMIT ?2",
        )?;
        let rows = stmt.query_map(params![session_id, limit], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
        })?;

        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    pub fn count_sessions(&self) -> Result<u64> {
        let conn = self.lock()?;
        Ok(conn.query_row("SELECT COUNT(*) FROM sessions", [], |row| row.get(0))?)
    }

    pub fn count_messages(&self) -> Result<u64> {
        let conn = self.lock()?;
        Ok(conn.query_row("SELECT COUNT(*) FROM messages", [], |row| row.get(0))?)
    }

    pub fn count_session_messages(&self, session_id: &str) -> Result<u64> {
        let conn = self.lock()?;
        Ok(conn.query_row(
            "SELECT COUNT(*) FROM messages WHERE session_id = ?1",
            params![session_id],
            |row| row.get(0),
        )?)
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| GatewayError::Store("session store mutex poisoned".into()))
    }
}

fn generate_session_id() -> String {
    let mut bytes = [0u8; 16];
    rand::rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}

fn now_unix() -> i64 {
    chrono::Utc::now().timestamp()
}
