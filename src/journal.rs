//! Append-only per-session journals.
//!
//! Every session gets one JSONL file at
//! `{root}/{upstream}/{YYYY-MM-DD}/{session_id}.jsonl`; each entry is a
//! single JSON object terminated by `\n`. File handles are opened lazily in
//! append mode and cached per session; intermediate directories are created
//! on first use. Appends to a given file are serialized through a
//! per-session lock, so two writers never race on the same path.

use std::collections::BTreeMap;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{SecondsFormat, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::fs::{File, OpenOptions};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::debug;

/// Envelope attached to every journal entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Meta {
    /// RFC3339 timestamp with nanosecond precision, UTC.
    pub ts: String,
    /// `user@hostname` of the machine running the proxy.
    pub machine: String,
    /// Upstream host for the session.
    pub host: String,
    /// Session id the entry belongs to.
    pub session: String,
    /// Per-HTTP-request UUID; absent on entries not tied to one request.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
}

impl Meta {
    pub fn new(machine: &str, host: &str, session: &str, request_id: Option<String>) -> Self {
        Meta {
            ts: now_rfc3339_nanos(),
            machine: machine.to_string(),
            host: host.to_string(),
            session: session.to_string(),
            request_id,
        }
    }
}

/// Current time in the journal's timestamp format.
pub fn now_rfc3339_nanos() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Nanos, true)
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct ResponseTiming {
    pub ttfb_ms: i64,
    pub total_ms: i64,
}

/// One captured piece of a streaming response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamChunk {
    pub ts: String,
    /// Milliseconds since the request started.
    pub delta_ms: i64,
    pub raw: String,
}

/// Pattern counters snapshot carried on `turn_end`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PatternSnapshot {
    pub turn_count: u64,
    pub session_tool_count: u64,
    pub tool_streak: u64,
    pub retry_count: u64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    pub input_tokens: u64,
    pub output_tokens: u64,
}

/// A single journal line: tagged payload plus the `_meta` envelope.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JournalEntry {
    #[serde(flatten)]
    pub payload: EntryPayload,
    #[serde(rename = "_meta")]
    pub meta: Meta,
}

impl JournalEntry {
    pub fn new(payload: EntryPayload, meta: Meta) -> Self {
        JournalEntry { payload, meta }
    }
}

/// Journal entry payloads. The `fork` variant is reserved by the schema for
/// forward compatibility; nothing currently emits it.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EntryPayload {
    SessionStart {
        provider: String,
        upstream: String,
    },
    Request {
        seq: u64,
        method: String,
        path: String,
        headers: BTreeMap<String, Vec<String>>,
        body: String,
        size: u64,
    },
    Response {
        seq: u64,
        status: u16,
        headers: BTreeMap<String, Vec<String>>,
        timing: ResponseTiming,
        size: u64,
        #[serde(skip_serializing_if = "Option::is_none")]
        body: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        chunks: Option<Vec<StreamChunk>>,
    },
    Fork {
        from_seq: u64,
        parent_session: String,
        reason: String,
    },
    TurnStart {
        turn_depth: u64,
        error_recovered: bool,
    },
    TurnEnd {
        stop_reason: String,
        is_retry: bool,
        error_type: String,
        patterns: PatternSnapshot,
        tokens: TokenUsage,
    },
    ToolCall {
        tool_name: String,
        tool_index: u64,
        tool_use_id: String,
    },
    ToolResult {
        tool_name: String,
        tool_use_id: String,
        is_error: bool,
    },
}

impl EntryPayload {
    /// The wire tag of this payload, used as the export `log_type` label.
    pub fn log_type(&self) -> &'static str {
        match self {
            EntryPayload::SessionStart { .. } => "session_start",
            EntryPayload::Request { .. } => "request",
            EntryPayload::Response { .. } => "response",
            EntryPayload::Fork { .. } => "fork",
            EntryPayload::TurnStart { .. } => "turn_start",
            EntryPayload::TurnEnd { .. } => "turn_end",
            EntryPayload::ToolCall { .. } => "tool_call",
            EntryPayload::ToolResult { .. } => "tool_result",
        }
    }
}

type Handle = Arc<Mutex<File>>;

/// Append-only journal writer with a lazy per-session handle cache.
pub struct Journal {
    root: PathBuf,
    handles: DashMap<String, Handle>,
    paths: DashMap<String, PathBuf>,
}

impl Journal {
    /// Create a journal rooted at `root`, creating the directory if needed.
    pub fn new(root: impl Into<PathBuf>) -> io::Result<Self> {
        let root = root.into();
        std::fs::create_dir_all(&root)?;
        Ok(Journal {
            root,
            handles: DashMap::new(),
            paths: DashMap::new(),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Pin the relative file path for a session. Continued sessions keep
    /// writing to the file recorded at creation time, even across days.
    pub fn register_session(&self, session_id: &str, relative_path: impl Into<PathBuf>) {
        self.paths
            .insert(session_id.to_string(), relative_path.into());
    }

    /// Append one entry to the session's journal file.
    pub async fn log(&self, entry: &JournalEntry) -> io::Result<()> {
        let handle = self.handle_for(&entry.meta).await?;
        let mut line = serde_json::to_string(entry)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        line.push('\n');

        let mut file = handle.lock().await;
        file.write_all(line.as_bytes()).await?;
        file.flush().await?;
        Ok(())
    }

    async fn handle_for(&self, meta: &Meta) -> io::Result<Handle> {
        if let Some(handle) = self.handles.get(&meta.session) {
            return Ok(handle.clone());
        }

        let relative = match self.paths.get(&meta.session) {
            Some(p) => p.clone(),
            // Unregistered session: derive the conventional layout from the
            // envelope so the entry still lands somewhere sensible.
            None => {
                let date = Utc::now().format("%Y-%m-%d").to_string();
                PathBuf::from(&meta.host)
                    .join(date)
                    .join(format!("{}.jsonl", meta.session))
            }
        };

        let path = self.root.join(&relative);
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await?;
        debug!(session = %meta.session, path = %path.display(), "opened journal file");

        // Two tasks may race to open the same file; the entry API keeps a
        // single winner and every writer goes through its lock.
        let handle = self
            .handles
            .entry(meta.session.clone())
            .or_insert_with(|| Arc::new(Mutex::new(file)))
            .clone();
        Ok(handle)
    }

    /// Flush and release all cached handles.
    pub async fn close(&self) {
        let sessions: Vec<String> = self.handles.iter().map(|e| e.key().clone()).collect();
        for session in sessions {
            if let Some((_, handle)) = self.handles.remove(&session) {
                let mut file = handle.lock().await;
                let _ = file.flush().await;
                let _ = file.sync_all().await;
            }
        }
        self.paths.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn meta(session: &str) -> Meta {
        Meta::new("tester@host", "api.anthropic.com", session, None)
    }

    fn session_start(session: &str) -> JournalEntry {
        JournalEntry::new(
            EntryPayload::SessionStart {
                provider: "anthropic".to_string(),
                upstream: "api.anthropic.com".to_string(),
            },
            meta(session),
        )
    }

    #[tokio::test]
    async fn appends_one_json_line_per_entry() {
        let dir = TempDir::new().unwrap();
        let journal = Journal::new(dir.path()).unwrap();
        journal.register_session("s1", "api.anthropic.com/2026-08-02/s1.jsonl");

        journal.log(&session_start("s1")).await.unwrap();
        journal.log(&session_start("s1")).await.unwrap();

        let contents =
            std::fs::read_to_string(dir.path().join("api.anthropic.com/2026-08-02/s1.jsonl"))
                .unwrap();
        let lines: Vec<&str> = contents.lines().collect();
        assert_eq!(lines.len(), 2);

        let parsed: serde_json::Value = serde_json::from_str(lines[0]).unwrap();
        assert_eq!(parsed["type"], "session_start");
        assert_eq!(parsed["provider"], "anthropic");
        assert_eq!(parsed["_meta"]["session"], "s1");
        assert_eq!(parsed["_meta"]["machine"], "tester@host");
    }

    #[tokio::test]
    async fn creates_intermediate_directories() {
        let dir = TempDir::new().unwrap();
        let journal = Journal::new(dir.path()).unwrap();
        journal.register_session("deep", "example.com/2026-01-01/deep.jsonl");

        journal.log(&session_start("deep")).await.unwrap();
        assert!(dir.path().join("example.com/2026-01-01/deep.jsonl").exists());
    }

    #[tokio::test]
    async fn unregistered_session_derives_path_from_meta() {
        let dir = TempDir::new().unwrap();
        let journal = Journal::new(dir.path()).unwrap();

        journal.log(&session_start("orphan")).await.unwrap();

        let date = Utc::now().format("%Y-%m-%d").to_string();
        assert!(dir
            .path()
            .join(format!("api.anthropic.com/{date}/orphan.jsonl"))
            .exists());
    }

    #[tokio::test]
    async fn reopen_appends_rather_than_truncating() {
        let dir = TempDir::new().unwrap();
        let rel = "api.anthropic.com/2026-08-02/again.jsonl";
        {
            let journal = Journal::new(dir.path()).unwrap();
            journal.register_session("again", rel);
            journal.log(&session_start("again")).await.unwrap();
            journal.close().await;
        }
        {
            let journal = Journal::new(dir.path()).unwrap();
            journal.register_session("again", rel);
            journal.log(&session_start("again")).await.unwrap();
            journal.close().await;
        }

        let contents = std::fs::read_to_string(dir.path().join(rel)).unwrap();
        assert_eq!(contents.lines().count(), 2);
    }

    #[tokio::test]
    async fn concurrent_sessions_write_independent_files() {
        let dir = TempDir::new().unwrap();
        let journal = Arc::new(Journal::new(dir.path()).unwrap());

        let mut tasks = Vec::new();
        for i in 0..4 {
            let journal = journal.clone();
            tasks.push(tokio::spawn(async move {
                let session = format!("s{i}");
                for _ in 0..10 {
                    journal.log(&session_start(&session)).await.unwrap();
                }
            }));
        }
        for t in tasks {
            t.await.unwrap();
        }

        let date = Utc::now().format("%Y-%m-%d").to_string();
        for i in 0..4 {
            let contents = std::fs::read_to_string(
                dir.path()
                    .join(format!("api.anthropic.com/{date}/s{i}.jsonl")),
            )
            .unwrap();
            assert_eq!(contents.lines().count(), 10);
        }
    }

    #[test]
    fn entry_serialization_shape() {
        let entry = JournalEntry::new(
            EntryPayload::Request {
                seq: 1,
                method: "POST".to_string(),
                path: "/v1/messages".to_string(),
                headers: BTreeMap::new(),
                body: "{}".to_string(),
                size: 2,
            },
            meta("s9"),
        );
        let json = serde_json::to_string(&entry).unwrap();
        let value: serde_json::Value = serde_json::from_str(&json).unwrap();
        assert_eq!(value["type"], "request");
        assert_eq!(value["seq"], 1);
        assert!(value["_meta"]["ts"].as_str().unwrap().ends_with('Z'));
        // request_id is omitted, not null
        assert!(value["_meta"].get("request_id").is_none());
    }

    #[test]
    fn log_type_matches_wire_tag() {
        let payload = EntryPayload::TurnEnd {
            stop_reason: "end_turn".to_string(),
            is_retry: false,
            error_type: String::new(),
            patterns: PatternSnapshot::default(),
            tokens: TokenUsage::default(),
        };
        assert_eq!(payload.log_type(), "turn_end");
        let json = serde_json::to_value(&payload).unwrap();
        assert_eq!(json["type"], "turn_end");
    }
}
