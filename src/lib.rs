//! llm-proxy - transparent logging reverse proxy for LLM API traffic.
//!
//! The proxy sits between AI-agent clients (Claude Code, OpenAI-compatible
//! SDKs, Bedrock-targeted SDKs) and their upstream providers. Every request
//! and response is mirrored to per-session append-only journals and
//! optionally pushed to a Loki-compatible endpoint, while the stream of
//! bytes to the client stays untouched: status, headers, body and streaming
//! cadence all pass through as the upstream produced them.
//!
//! On top of the raw mirror, the proxy reconstructs conversational
//! semantics: sessions (continued across requests via client-supplied ids),
//! monotonic sequence numbers, and turn-level telemetry events
//! (`turn_start`, `turn_end`, `tool_call`, `tool_result`) with
//! tool-use/tool-result correlation and retry detection.

pub mod bedrock;
pub mod config;
pub mod error;
pub mod events;
pub mod eventstream;
pub mod exporter;
pub mod fanout;
pub mod forwarder;
pub mod journal;
pub mod obfuscate;
pub mod parser;
pub mod portfile;
pub mod routes;
pub mod server;
pub mod session;
pub mod store;
