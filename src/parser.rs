//! Provider payload parsing.
//!
//! Provider JSON is heterogeneous and versioned out from under us, so the
//! parsers here never fail a request: unknown shapes degrade to empty or
//! [`ContentBlock::Unknown`] and the caller carries on. Only the fields the
//! event engine consumes are modelled.

use serde::Deserialize;
use serde_json::Value;

use crate::journal::TokenUsage;
use crate::routes::Provider;

/// One assistant/user content block in the Anthropic shape.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentBlock {
    Text {
        #[serde(default)]
        text: String,
    },
    Thinking {
        #[serde(default)]
        thinking: String,
    },
    ToolUse {
        #[serde(default)]
        id: String,
        #[serde(default)]
        name: String,
        #[serde(default)]
        input: Value,
    },
    ToolResult {
        #[serde(default)]
        tool_use_id: String,
        #[serde(default)]
        content: Value,
        #[serde(default)]
        is_error: bool,
    },
    /// Anything we do not recognize; preserved as a block so ordering of the
    /// known blocks around it stays intact.
    #[serde(other)]
    Unknown,
}

/// Typed view over a provider request body.
#[derive(Debug, Clone, Default)]
pub struct ParsedRequest {
    pub model: String,
    pub max_tokens: u64,
    pub system: String,
    pub messages: Vec<ParsedMessage>,
}

#[derive(Debug, Clone, Default)]
pub struct ParsedMessage {
    pub role: String,
    /// First text content, for convenience.
    pub text: String,
    pub blocks: Vec<ContentBlock>,
}

/// Typed view over a provider response body.
#[derive(Debug, Clone, Default)]
pub struct ParsedResponse {
    pub blocks: Vec<ContentBlock>,
    pub usage: TokenUsage,
    pub stop_reason: String,
}

impl ParsedResponse {
    /// A synthetic response carrying only accumulated streaming text.
    pub fn from_text(text: String) -> Self {
        ParsedResponse {
            blocks: vec![ContentBlock::Text { text }],
            ..Default::default()
        }
    }
}

pub fn parse_request_body(body: &str) -> ParsedRequest {
    let Ok(raw) = serde_json::from_str::<Value>(body) else {
        return ParsedRequest::default();
    };

    let mut parsed = ParsedRequest {
        model: str_field(&raw, "model"),
        max_tokens: raw.get("max_tokens").and_then(Value::as_u64).unwrap_or(0),
        system: str_field(&raw, "system"),
        messages: Vec::new(),
    };

    if let Some(messages) = raw.get("messages").and_then(Value::as_array) {
        for message in messages {
            parsed.messages.push(parse_message(message));
        }
    }

    parsed
}

fn parse_message(message: &Value) -> ParsedMessage {
    let mut parsed = ParsedMessage {
        role: str_field(message, "role"),
        ..Default::default()
    };

    match message.get("content") {
        Some(Value::String(text)) => parsed.text = text.clone(),
        Some(Value::Array(blocks)) => {
            for block in blocks {
                parsed.blocks.push(parse_block(block));
            }
            for block in &parsed.blocks {
                if let ContentBlock::Text { text } = block {
                    if parsed.text.is_empty() {
                        parsed.text = text.clone();
                    }
                }
            }
        }
        _ => {}
    }

    parsed
}

fn parse_block(block: &Value) -> ContentBlock {
    serde_json::from_value(block.clone()).unwrap_or(ContentBlock::Unknown)
}

pub fn parse_response_body(body: &str, provider: Provider) -> ParsedResponse {
    match provider {
        Provider::Anthropic => parse_anthropic_response(body),
        Provider::OpenAi => parse_openai_response(body),
    }
}

fn parse_anthropic_response(body: &str) -> ParsedResponse {
    let Ok(raw) = serde_json::from_str::<Value>(body) else {
        return ParsedResponse::default();
    };

    let mut parsed = ParsedResponse {
        stop_reason: str_field(&raw, "stop_reason"),
        ..Default::default()
    };

    if let Some(content) = raw.get("content").and_then(Value::as_array) {
        for block in content {
            parsed.blocks.push(parse_block(block));
        }
    }

    if let Some(usage) = raw.get("usage") {
        parsed.usage = TokenUsage {
            input_tokens: usage
                .get("input_tokens")
                .and_then(Value::as_u64)
                .unwrap_or(0),
            output_tokens: usage
                .get("output_tokens")
                .and_then(Value::as_u64)
                .unwrap_or(0),
        };
    }

    parsed
}

fn parse_openai_response(body: &str) -> ParsedResponse {
    let Ok(raw) = serde_json::from_str::<Value>(body) else {
        return ParsedResponse::default();
    };

    let mut parsed = ParsedResponse::default();

    if let Some(choice) = raw
        .get("choices")
        .and_then(Value::as_array)
        .and_then(|c| c.first())
    {
        parsed.stop_reason = str_field(choice, "finish_reason");
        if let Some(content) = choice
            .get("message")
            .and_then(|m| m.get("content"))
            .and_then(Value::as_str)
        {
            parsed.blocks.push(ContentBlock::Text {
                text: content.to_string(),
            });
        }
    }

    if let Some(usage) = raw.get("usage") {
        parsed.usage = TokenUsage {
            input_tokens: usage
                .get("prompt_tokens")
                .and_then(Value::as_u64)
                .unwrap_or(0),
            output_tokens: usage
                .get("completion_tokens")
                .and_then(Value::as_u64)
                .unwrap_or(0),
        };
    }

    parsed
}

/// Extract delta text from one SSE line, if it carries any.
///
/// Anthropic sends `content_block_delta` events whose `delta.text` holds the
/// increment; OpenAI sends `choices[0].delta.content`. Non-`data:` lines and
/// the `[DONE]` sentinel yield nothing.
pub fn extract_delta_text(line: &str, provider: Provider) -> Option<String> {
    let payload = line.strip_prefix("data: ").or_else(|| line.strip_prefix("data:"))?;
    let payload = payload.trim();
    if payload.is_empty() || payload == "[DONE]" {
        return None;
    }
    let value: Value = serde_json::from_str(payload).ok()?;

    match provider {
        Provider::Anthropic => {
            if value.get("type").and_then(Value::as_str) != Some("content_block_delta") {
                return None;
            }
            let delta = value.get("delta")?;
            if delta.get("type").and_then(Value::as_str) != Some("text_delta") {
                return None;
            }
            delta
                .get("text")
                .and_then(Value::as_str)
                .map(str::to_string)
        }
        Provider::OpenAi => value
            .get("choices")
            .and_then(Value::as_array)
            .and_then(|c| c.first())
            .and_then(|c| c.get("delta"))
            .and_then(|d| d.get("content"))
            .and_then(Value::as_str)
            .map(str::to_string),
    }
}

/// Whether the client asked for a streaming response.
pub fn is_streaming_request(body: &[u8]) -> bool {
    serde_json::from_slice::<Value>(body)
        .ok()
        .and_then(|v| v.get("stream").and_then(Value::as_bool))
        .unwrap_or(false)
}

fn str_field(value: &Value, key: &str) -> String {
    value
        .get(key)
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string()
}
