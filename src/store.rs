//! Embedded session store.
//!
//! SQLite (WAL mode) holds the durable session index and the per-session
//! pattern state that the event engine folds across turns. The connection is
//! wrapped in a mutex; every public operation is a single critical section,
//! which is all the consistency the single-writer-per-session model needs.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{SecondsFormat, Utc};
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension};
use tracing::info;

use crate::error::StoreError;

pub const PRAGMAS: &str = r#"
PRAGMA journal_mode = WAL;
PRAGMA foreign_keys = ON;
PRAGMA busy_timeout = 5000;
PRAGMA synchronous = NORMAL;
"#;

pub const CREATE_TABLES: &str = r#"
CREATE TABLE IF NOT EXISTS sessions (
    id TEXT PRIMARY KEY,
    client_session_id TEXT UNIQUE,
    provider TEXT NOT NULL,
    upstream TEXT NOT NULL,
    created_at TEXT NOT NULL,
    last_activity TEXT NOT NULL,
    last_seq INTEGER NOT NULL DEFAULT 1,
    file_path TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS pattern_state (
    session_id TEXT PRIMARY KEY REFERENCES sessions(id),
    turn_count INTEGER NOT NULL DEFAULT 0,
    session_tool_count INTEGER NOT NULL DEFAULT 0,
    tool_streak INTEGER NOT NULL DEFAULT 0,
    retry_count INTEGER NOT NULL DEFAULT 0,
    last_tool_name TEXT NOT NULL DEFAULT '',
    last_was_error INTEGER NOT NULL DEFAULT 0,
    pending_tool_ids TEXT NOT NULL DEFAULT '{}'
);

CREATE INDEX IF NOT EXISTS idx_sessions_client ON sessions(client_session_id);
"#;

/// Behavioral counters for one session, rewritten atomically after each turn.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PatternState {
    pub turn_count: u64,
    pub session_tool_count: u64,
    pub tool_streak: u64,
    pub retry_count: u64,
    pub last_tool_name: String,
    pub last_was_error: bool,
    /// tool_use_id -> tool_name for calls awaiting their result.
    pub pending_tool_ids: HashMap<String, String>,
}

/// Thread-safe handle to the session database.
pub struct SessionStore {
    conn: Arc<Mutex<Connection>>,
    path: PathBuf,
}

impl Clone for SessionStore {
    fn clone(&self) -> Self {
        SessionStore {
            conn: self.conn.clone(),
            path: self.path.clone(),
        }
    }
}

impl SessionStore {
    /// Open or create the database at `path`.
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| StoreError::Io(format!("create dir: {e}")))?;
        }
        let conn = Connection::open(path)?;
        Self::init(&conn)?;
        info!(path = %path.display(), "session store opened");
        Ok(SessionStore {
            conn: Arc::new(Mutex::new(conn)),
            path: path.to_owned(),
        })
    }

    /// In-memory store for tests.
    pub fn in_memory() -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory()?;
        Self::init(&conn)?;
        Ok(SessionStore {
            conn: Arc::new(Mutex::new(conn)),
            path: PathBuf::from(":memory:"),
        })
    }

    fn init(conn: &Connection) -> Result<(), StoreError> {
        conn.execute_batch(PRAGMAS)
            .map_err(|e| StoreError::Database(format!("pragmas: {e}")))?;
        conn.execute_batch(CREATE_TABLES)
            .map_err(|e| StoreError::Database(format!("schema: {e}")))?;
        Ok(())
    }

    fn with_conn<F, T>(&self, f: F) -> Result<T, StoreError>
    where
        F: FnOnce(&Connection) -> Result<T, StoreError>,
    {
        let conn = self.conn.lock();
        f(&conn)
    }

    pub fn create_session(
        &self,
        id: &str,
        provider: &str,
        upstream: &str,
        file_path: &str,
    ) -> Result<(), StoreError> {
        self.insert_session(id, None, provider, upstream, file_path)
    }

    pub fn create_session_with_client_id(
        &self,
        id: &str,
        client_session_id: &str,
        provider: &str,
        upstream: &str,
        file_path: &str,
    ) -> Result<(), StoreError> {
        self.insert_session(id, Some(client_session_id), provider, upstream, file_path)
    }

    fn insert_session(
        &self,
        id: &str,
        client_session_id: Option<&str>,
        provider: &str,
        upstream: &str,
        file_path: &str,
    ) -> Result<(), StoreError> {
        let now = Utc::now().to_rfc3339_opts(SecondsFormat::Nanos, true);
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO sessions (id, client_session_id, provider, upstream, created_at, last_activity, last_seq, file_path)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?5, 1, ?6)",
                params![id, client_session_id, provider, upstream, now, file_path],
            )?;
            Ok(())
        })
    }

    /// Resolve a client-supplied session id to our session id, if seen.
    pub fn find_by_client_session_id(
        &self,
        client_session_id: &str,
    ) -> Result<Option<String>, StoreError> {
        self.with_conn(|conn| {
            let id = conn
                .query_row(
                    "SELECT id FROM sessions WHERE client_session_id = ?1",
                    [client_session_id],
                    |row| row.get(0),
                )
                .optional()?;
            Ok(id)
        })
    }

    /// Returns `(client_session_id, provider, upstream, last_seq)`.
    pub fn get_session_with_client_id(
        &self,
        id: &str,
    ) -> Result<(Option<String>, String, String, u64), StoreError> {
        self.with_conn(|conn| {
            conn.query_row(
                "SELECT client_session_id, provider, upstream, last_seq FROM sessions WHERE id = ?1",
                [id],
                |row| {
                    Ok((
                        row.get::<_, Option<String>>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, u64>(3)?,
                    ))
                },
            )
            .optional()?
            .ok_or_else(|| StoreError::NotFound(format!("session {id}")))
        })
    }

    /// The relative journal path recorded when the session was created.
    pub fn session_file_path(&self, id: &str) -> Result<String, StoreError> {
        self.with_conn(|conn| {
            conn.query_row(
                "SELECT file_path FROM sessions WHERE id = ?1",
                [id],
                |row| row.get(0),
            )
            .optional()?
            .ok_or_else(|| StoreError::NotFound(format!("session {id}")))
        })
    }

    /// Atomically record a new sequence number and bump activity.
    pub fn update_session_seq(&self, id: &str, seq: u64) -> Result<(), StoreError> {
        let now = Utc::now().to_rfc3339_opts(SecondsFormat::Nanos, true);
        self.with_conn(|conn| {
            let updated = conn.execute(
                "UPDATE sessions SET last_seq = ?2, last_activity = ?3 WHERE id = ?1",
                params![id, seq, now],
            )?;
            if updated == 0 {
                return Err(StoreError::NotFound(format!("session {id}")));
            }
            Ok(())
        })
    }

    pub fn load_pattern_state(&self, id: &str) -> Result<Option<PatternState>, StoreError> {
        self.with_conn(|conn| load_pattern_state_locked(conn, id))
    }

    /// Upsert the whole pattern-state row in one statement.
    pub fn update_pattern_state(&self, id: &str, state: &PatternState) -> Result<(), StoreError> {
        let pending = serde_json::to_string(&state.pending_tool_ids)
            .map_err(|e| StoreError::Database(format!("pending ids: {e}")))?;
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO pattern_state
                     (session_id, turn_count, session_tool_count, tool_streak, retry_count,
                      last_tool_name, last_was_error, pending_tool_ids)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
                 ON CONFLICT(session_id) DO UPDATE SET
                     turn_count = excluded.turn_count,
                     session_tool_count = excluded.session_tool_count,
                     tool_streak = excluded.tool_streak,
                     retry_count = excluded.retry_count,
                     last_tool_name = excluded.last_tool_name,
                     last_was_error = excluded.last_was_error,
                     pending_tool_ids = excluded.pending_tool_ids",
                params![
                    id,
                    state.turn_count,
                    state.session_tool_count,
                    state.tool_streak,
                    state.retry_count,
                    state.last_tool_name,
                    state.last_was_error,
                    pending,
                ],
            )?;
            Ok(())
        })
    }

    /// Remove a pending tool id and return the tool name it mapped to, or an
    /// empty string if the id was never pending.
    pub fn clear_matched_tool_id(
        &self,
        id: &str,
        tool_use_id: &str,
    ) -> Result<String, StoreError> {
        self.with_conn(|conn| {
            let Some(mut state) = load_pattern_state_locked(conn, id)? else {
                return Ok(String::new());
            };
            let Some(name) = state.pending_tool_ids.remove(tool_use_id) else {
                return Ok(String::new());
            };
            let pending = serde_json::to_string(&state.pending_tool_ids)
                .map_err(|e| StoreError::Database(format!("pending ids: {e}")))?;
            conn.execute(
                "UPDATE pattern_state SET pending_tool_ids = ?2 WHERE session_id = ?1",
                params![id, pending],
            )?;
            Ok(name)
        })
    }
}

fn load_pattern_state_locked(
    conn: &Connection,
    id: &str,
) -> Result<Option<PatternState>, StoreError> {
    let row = conn
        .query_row(
            "SELECT turn_count, session_tool_count, tool_streak, retry_count,
                    last_tool_name, last_was_error, pending_tool_ids
             FROM pattern_state WHERE session_id = ?1",
            [id],
            |row| {
                Ok((
                    row.get::<_, u64>(0)?,
                    row.get::<_, u64>(1)?,
                    row.get::<_, u64>(2)?,
                    row.get::<_, u64>(3)?,
                    row.get::<_, String>(4)?,
                    row.get::<_, bool>(5)?,
                    row.get::<_, String>(6)?,
                ))
            },
        )
        .optional()?;

    let Some((turn_count, session_tool_count, tool_streak, retry_count, last_tool_name, last_was_error, pending_json)) =
        row
    else {
        return Ok(None);
    };

    let pending_tool_ids: HashMap<String, String> =
        serde_json::from_str(&pending_json).unwrap_or_default();

    Ok(Some(PatternState {
        turn_count,
        session_tool_count,
        tool_streak,
        retry_count,
        last_tool_name,
        last_was_error,
        pending_tool_ids,
    }))
}
