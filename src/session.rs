//! Session tracking.
//!
//! A session is our durable identity for one client conversation. Clients
//! that send a session id of their own (Claude Code puts one inside
//! `metadata.user_id`) get a stable mapping to our id; everything else gets
//! a fresh session per request. There is deliberately no content-based
//! fallback: merging sessions by message similarity produced cross-session
//! collisions and is forbidden.
//!
//! The manager serializes lookup-allocate-update under one coarse lock, so
//! sequence numbers are strictly increasing and contiguous per session.

use std::path::{Path, PathBuf};

use chrono::Utc;
use hyper::HeaderMap;
use parking_lot::Mutex;
use rand::Rng;
use serde_json::Value;
use tracing::warn;

use crate::error::StoreError;
use crate::routes::Provider;
use crate::store::{PatternState, SessionStore};

/// Result of resolving a request to a session.
#[derive(Debug, Clone)]
pub struct SessionHandle {
    pub session_id: String,
    pub seq: u64,
    pub is_new: bool,
    /// Journal path relative to the log root.
    pub file_path: PathBuf,
}

pub struct SessionManager {
    base_dir: PathBuf,
    store: SessionStore,
    lock: Mutex<()>,
}

impl SessionManager {
    /// Open the manager rooted at `base_dir`; the session database lives at
    /// `{base_dir}/sessions.db`.
    pub fn open(base_dir: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let base_dir = base_dir.into();
        std::fs::create_dir_all(&base_dir).map_err(|e| StoreError::Io(format!("create dir: {e}")))?;
        let store = SessionStore::open(&base_dir.join("sessions.db"))?;
        Ok(SessionManager {
            base_dir,
            store,
            lock: Mutex::new(()),
        })
    }

    pub fn store(&self) -> &SessionStore {
        &self.store
    }

    /// Resolve the session for a request: continue a known client session,
    /// or create a fresh one.
    pub fn get_or_create_session(
        &self,
        body: &[u8],
        provider: Provider,
        upstream: &str,
        headers: &HeaderMap,
        path: &str,
    ) -> Result<SessionHandle, StoreError> {
        let _guard = self.lock.lock();

        let client_session_id = extract_client_session_id(body, provider, headers, path);
        if client_session_id.is_empty() {
            return self.create_session_locked(None, provider, upstream);
        }

        if let Some(existing) = self.store.find_by_client_session_id(&client_session_id)? {
            let (_, _, _, last_seq) = self.store.get_session_with_client_id(&existing)?;
            let next_seq = last_seq + 1;
            self.store.update_session_seq(&existing, next_seq)?;
            let file_path = PathBuf::from(self.store.session_file_path(&existing)?);
            return Ok(SessionHandle {
                session_id: existing,
                seq: next_seq,
                is_new: false,
                file_path,
            });
        }

        self.create_session_locked(Some(&client_session_id), provider, upstream)
    }

    fn create_session_locked(
        &self,
        client_session_id: Option<&str>,
        provider: Provider,
        upstream: &str,
    ) -> Result<SessionHandle, StoreError> {
        let session_id = generate_session_id();
        let file_path = session_file_path(upstream, &session_id);

        let log_dir = self.base_dir.join(file_path.parent().unwrap_or(Path::new("")));
        std::fs::create_dir_all(&log_dir).map_err(|e| StoreError::Io(format!("create dir: {e}")))?;

        let file_path_str = file_path.to_string_lossy();
        match client_session_id {
            Some(client_id) => self.store.create_session_with_client_id(
                &session_id,
                client_id,
                provider.as_str(),
                upstream,
                &file_path_str,
            )?,
            None => {
                self.store
                    .create_session(&session_id, provider.as_str(), upstream, &file_path_str)?
            }
        }

        Ok(SessionHandle {
            session_id,
            seq: 1,
            is_new: true,
            file_path,
        })
    }

    /// A session handle that exists only for this request. Used when the
    /// store is unavailable or the path is not conversation traffic; nothing
    /// is persisted.
    pub fn synthetic_session(&self, upstream: &str) -> SessionHandle {
        let session_id = generate_session_id();
        SessionHandle {
            file_path: session_file_path(upstream, &session_id),
            session_id,
            seq: 1,
            is_new: true,
        }
    }

    /// Stored pattern state, or a fresh zero state. Store failures degrade
    /// to the fresh state with a warning; telemetry never blocks traffic.
    pub fn load_pattern_state(&self, session_id: &str) -> PatternState {
        match self.store.load_pattern_state(session_id) {
            Ok(Some(state)) => state,
            Ok(None) => PatternState::default(),
            Err(e) => {
                warn!(session = session_id, error = %e, "failed to load pattern state");
                PatternState::default()
            }
        }
    }

    pub fn update_pattern_state(&self, session_id: &str, state: &PatternState) {
        if let Err(e) = self.store.update_pattern_state(session_id, state) {
            warn!(session = session_id, error = %e, "failed to persist pattern state");
        }
    }

    /// Remove a pending tool id, returning the tool name it mapped to.
    pub fn clear_matched_tool_id(&self, session_id: &str, tool_use_id: &str) -> String {
        match self.store.clear_matched_tool_id(session_id, tool_use_id) {
            Ok(name) => name,
            Err(e) => {
                warn!(session = session_id, error = %e, "failed to clear tool id");
                String::new()
            }
        }
    }
}

fn session_file_path(upstream: &str, session_id: &str) -> PathBuf {
    let date = Utc::now().format("%Y-%m-%d").to_string();
    PathBuf::from(upstream)
        .join(date)
        .join(format!("{session_id}.jsonl"))
}

/// `YYYYMMDD-HHMMSS-<4 hex>`, UTC.
pub fn generate_session_id() -> String {
    let now = Utc::now().format("%Y%m%d-%H%M%S");
    let suffix: u16 = rand::thread_rng().gen();
    format!("{now}-{suffix:04x}")
}

/// Pull the client-supplied session id out of a request, if any.
///
/// Anthropic (and Bedrock) requests carry it as the suffix of
/// `metadata.user_id` after the last `_session_` marker. OpenAI chat
/// requests may carry a conversation id in a header or under `metadata`.
pub fn extract_client_session_id(
    body: &[u8],
    provider: Provider,
    headers: &HeaderMap,
    path: &str,
) -> String {
    match provider {
        Provider::Anthropic if path == "/v1/messages" || path.starts_with("/model/") => {
            anthropic_session_id(body)
        }
        Provider::OpenAi if path == "/v1/chat/completions" => {
            if let Some(value) = headers
                .get("x-conversation-id")
                .and_then(|v| v.to_str().ok())
                .filter(|v| !v.is_empty())
            {
                return value.to_string();
            }
            serde_json::from_slice::<Value>(body)
                .ok()
                .and_then(|v| {
                    v.get("metadata")
                        .and_then(|m| m.get("conversation_id"))
                        .and_then(Value::as_str)
                        .map(str::to_string)
                })
                .unwrap_or_default()
        }
        _ => String::new(),
    }
}

fn anthropic_session_id(body: &[u8]) -> String {
    let Ok(value) = serde_json::from_slice::<Value>(body) else {
        return String::new();
    };
    let Some(user_id) = value
        .get("metadata")
        .and_then(|m| m.get("user_id"))
        .and_then(Value::as_str)
    else {
        return String::new();
    };
    match user_id.rfind("_session_") {
        Some(idx) => user_id[idx + "_session_".len()..].to_string(),
        None => String::new(),
    }
}
