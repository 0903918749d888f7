//! Semantic event engine.
//!
//! Runs once per completed request/response cycle on conversation paths and
//! reconstructs turn-level telemetry: `turn_start`, `tool_call`,
//! `tool_result`, `turn_end`. Tool calls and their eventual results are
//! correlated by `tool_use_id` through the per-session pending map.
//!
//! Ordering inside a turn is load-bearing:
//!
//! 1. `error_recovered` is captured from `last_was_error` as persisted by the
//!    previous turn, *before* this request's tool results are folded.
//! 2. The tool results are folded (emitting `tool_result` events and
//!    rewriting `last_was_error`).
//! 3. `turn_start` is emitted with the captured value, so an error reported
//!    in this request marks the *next* turn as recovered, not this one.
//! 4. Retry detection then reads the freshly folded `last_was_error`.

use async_trait::async_trait;
use serde_json::Value;

use crate::journal::{PatternSnapshot, TokenUsage};
use crate::parser::{ContentBlock, ParsedResponse};
use crate::session::SessionManager;
use crate::store::PatternState;

/// A tool invocation extracted from an assistant response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolCall {
    pub tool_use_id: String,
    pub tool_name: String,
    /// Position among the response's `tool_use` blocks, 0-based.
    pub tool_index: u64,
}

/// A tool result extracted from a client request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolResult {
    pub tool_use_id: String,
    pub is_error: bool,
}

/// Identity fields shared by every event of one turn.
#[derive(Debug, Clone)]
pub struct TurnContext {
    pub session_id: String,
    pub provider: String,
    pub upstream: String,
    pub machine: String,
    pub request_id: Option<String>,
}

/// Receiver for emitted events. The production sink journals and exports
/// them; tests capture them directly.
#[async_trait]
pub trait EventSink: Send + Sync {
    async fn turn_start(&self, ctx: &TurnContext, turn_depth: u64, error_recovered: bool);
    #[allow(clippy::too_many_arguments)]
    async fn turn_end(
        &self,
        ctx: &TurnContext,
        stop_reason: &str,
        is_retry: bool,
        error_type: &str,
        patterns: PatternSnapshot,
        tokens: TokenUsage,
    );
    async fn tool_call(&self, ctx: &TurnContext, tool_name: &str, tool_index: u64, tool_use_id: &str);
    async fn tool_result(&self, ctx: &TurnContext, tool_name: &str, tool_use_id: &str, is_error: bool);
}

pub struct EventEngine {
    sessions: std::sync::Arc<SessionManager>,
}

impl EventEngine {
    pub fn new(sessions: std::sync::Arc<SessionManager>) -> Self {
        EventEngine { sessions }
    }

    /// Fold one completed turn into events and updated pattern state.
    pub async fn process_turn(
        &self,
        sink: &dyn EventSink,
        ctx: &TurnContext,
        request_body: &str,
        response: &ParsedResponse,
        status: u16,
        raw_response_body: Option<&str>,
    ) {
        let mut state = self.sessions.load_pattern_state(&ctx.session_id);

        // Step 1: capture before the fold below overwrites it.
        let error_recovered = state.last_was_error;

        let results = extract_tool_results(request_body.as_bytes());
        let mut any_error = false;
        for result in &results {
            let tool_name = self
                .sessions
                .clear_matched_tool_id(&ctx.session_id, &result.tool_use_id);
            state.pending_tool_ids.remove(&result.tool_use_id);
            any_error = any_error || result.is_error;
            sink.tool_result(ctx, &tool_name, &result.tool_use_id, result.is_error)
                .await;
        }
        state.last_was_error = any_error;

        let turn_depth = state.turn_count + 1;
        sink.turn_start(ctx, turn_depth, error_recovered).await;

        let calls = extract_tool_calls(&response.blocks);
        for call in &calls {
            sink.tool_call(ctx, &call.tool_name, call.tool_index, &call.tool_use_id)
                .await;
            state
                .pending_tool_ids
                .insert(call.tool_use_id.clone(), call.tool_name.clone());
        }

        let first_tool = calls
            .first()
            .map(|c| c.tool_name.clone())
            .unwrap_or_default();
        let is_retry = compute_patterns(&mut state, &first_tool);
        state.session_tool_count += calls.len() as u64;
        state.turn_count += 1;

        let error_type = classify_error(status, raw_response_body);
        sink.turn_end(
            ctx,
            &response.stop_reason,
            is_retry,
            &error_type,
            PatternSnapshot {
                turn_count: state.turn_count,
                session_tool_count: state.session_tool_count,
                tool_streak: state.tool_streak,
                retry_count: state.retry_count,
            },
            response.usage,
        )
        .await;

        self.sessions.update_pattern_state(&ctx.session_id, &state);
    }
}

/// Update streak/retry counters for a turn whose first tool was
/// `first_tool_name` (empty when the turn used no tools). Returns whether
/// the turn is a retry. Does not touch `last_was_error`; the fold owns it.
pub fn compute_patterns(state: &mut PatternState, first_tool_name: &str) -> bool {
    if first_tool_name.is_empty() {
        state.tool_streak = 0;
        state.retry_count = 0;
        return false;
    }

    let is_retry = first_tool_name == state.last_tool_name && state.last_was_error;

    if first_tool_name == state.last_tool_name {
        state.tool_streak += 1;
    } else {
        state.tool_streak = 1;
    }
    if is_retry {
        state.retry_count += 1;
    } else {
        state.retry_count = 0;
    }
    state.last_tool_name = first_tool_name.to_string();

    is_retry
}

/// Pull `tool_result` blocks out of the user messages of a request body.
pub fn extract_tool_results(body: &[u8]) -> Vec<ToolResult> {
    let Ok(value) = serde_json::from_slice::<Value>(body) else {
        return Vec::new();
    };
    let Some(messages) = value.get("messages").and_then(Value::as_array) else {
        return Vec::new();
    };

    let mut results = Vec::new();
    for message in messages {
        if message.get("role").and_then(Value::as_str) != Some("user") {
            continue;
        }
        let Some(blocks) = message.get("content").and_then(Value::as_array) else {
            continue;
        };
        for block in blocks {
            if block.get("type").and_then(Value::as_str) != Some("tool_result") {
                continue;
            }
            let Some(tool_use_id) = block.get("tool_use_id").and_then(Value::as_str) else {
                continue;
            };
            results.push(ToolResult {
                tool_use_id: tool_use_id.to_string(),
                is_error: block
                    .get("is_error")
                    .and_then(Value::as_bool)
                    .unwrap_or(false),
            });
        }
    }
    results
}

/// Enumerate `tool_use` blocks in response order with contiguous indices.
pub fn extract_tool_calls(blocks: &[ContentBlock]) -> Vec<ToolCall> {
    let mut calls = Vec::new();
    for block in blocks {
        if let ContentBlock::ToolUse { id, name, .. } = block {
            calls.push(ToolCall {
                tool_use_id: id.clone(),
                tool_name: name.clone(),
                tool_index: calls.len() as u64,
            });
        }
    }
    calls
}

/// Short classifier for a failed upstream response; empty when the turn
/// succeeded.
pub fn classify_error(status: u16, body: Option<&str>) -> String {
    match status {
        429 => "rate_limited".to_string(),
        529 => "overloaded".to_string(),
        s if s >= 500 => "upstream_error".to_string(),
        s if s >= 400 => body
            .and_then(|b| serde_json::from_str::<Value>(b).ok())
            .and_then(|v| {
                v.get("error")
                    .and_then(|e| e.get("type"))
                    .and_then(Value::as_str)
                    .map(str::to_string)
            })
            .unwrap_or_else(|| "invalid_request".to_string()),
        _ => String::new(),
    }
}

/// Production sink: events become journal entries and ride the fan-out.
/// Telemetry write failures are logged and swallowed; they never reach the
/// request path.
pub struct JournalSink {
    writer: std::sync::Arc<crate::fanout::FanOutWriter>,
}

impl JournalSink {
    pub fn new(writer: std::sync::Arc<crate::fanout::FanOutWriter>) -> Self {
        JournalSink { writer }
    }

    async fn log(&self, ctx: &TurnContext, payload: crate::journal::EntryPayload) {
        let entry = crate::journal::JournalEntry::new(
            payload,
            crate::journal::Meta::new(
                &ctx.machine,
                &ctx.upstream,
                &ctx.session_id,
                ctx.request_id.clone(),
            ),
        );
        if let Err(e) = self.writer.log(&entry, &ctx.provider).await {
            tracing::warn!(session = %ctx.session_id, error = %e, "failed to journal event");
        }
    }
}

#[async_trait]
impl EventSink for JournalSink {
    async fn turn_start(&self, ctx: &TurnContext, turn_depth: u64, error_recovered: bool) {
        self.log(
            ctx,
            crate::journal::EntryPayload::TurnStart {
                turn_depth,
                error_recovered,
            },
        )
        .await;
    }

    async fn turn_end(
        &self,
        ctx: &TurnContext,
        stop_reason: &str,
        is_retry: bool,
        error_type: &str,
        patterns: PatternSnapshot,
        tokens: TokenUsage,
    ) {
        self.log(
            ctx,
            crate::journal::EntryPayload::TurnEnd {
                stop_reason: stop_reason.to_string(),
                is_retry,
                error_type: error_type.to_string(),
                patterns,
                tokens,
            },
        )
        .await;
    }

    async fn tool_call(
        &self,
        ctx: &TurnContext,
        tool_name: &str,
        tool_index: u64,
        tool_use_id: &str,
    ) {
        self.log(
            ctx,
            crate::journal::EntryPayload::ToolCall {
                tool_name: tool_name.to_string(),
                tool_index,
                tool_use_id: tool_use_id.to_string(),
            },
        )
        .await;
    }

    async fn tool_result(
        &self,
        ctx: &TurnContext,
        tool_name: &str,
        tool_use_id: &str,
        is_error: bool,
    ) {
        self.log(
            ctx,
            crate::journal::EntryPayload::ToolResult {
                tool_name: tool_name.to_string(),
                tool_use_id: tool_use_id.to_string(),
                is_error,
            },
        )
        .await;
    }
}
