//! URL dispatch for the proxied surface.
//!
//! The server accepts three shapes of path:
//!
//! 1. `/{provider}/{upstream_host}/{remaining_path}` - generic pass-through
//!    to an Anthropic- or OpenAI-compatible upstream.
//! 2. `/model/{model_id}/invoke` and
//!    `/model/{model_id}/invoke-with-response-stream` - the SigV4-signed
//!    Bedrock backend.
//! 3. `/health` - liveness probe.
//!
//! Routing is a pure function of the raw (still percent-encoded) path; no
//! header or body inspection happens here.

use crate::error::ProxyError;

/// Upstream provider family. Bedrock traffic is attributed to
/// [`Provider::Anthropic`] so that session tracking and export labels line
/// up regardless of which backend carried the request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Provider {
    Anthropic,
    OpenAi,
}

impl Provider {
    pub fn as_str(&self) -> &'static str {
        match self {
            Provider::Anthropic => "anthropic",
            Provider::OpenAi => "openai",
        }
    }

    fn from_path_segment(s: &str) -> Option<Self> {
        match s {
            "anthropic" => Some(Provider::Anthropic),
            "openai" => Some(Provider::OpenAi),
            _ => None,
        }
    }
}

impl std::fmt::Display for Provider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Resolved routing decision for an incoming path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Route {
    Health,
    Proxy {
        provider: Provider,
        upstream: String,
        /// Remaining path with its leading `/` preserved.
        path: String,
    },
    Bedrock {
        model_id: String,
        streaming: bool,
    },
}

/// Parse the server-local path into a [`Route`].
pub fn parse_route(path: &str) -> Result<Route, ProxyError> {
    if path == "/health" {
        return Ok(Route::Health);
    }

    if let Some(rest) = path.strip_prefix("/model/") {
        return parse_bedrock_route(rest);
    }

    let trimmed = path.strip_prefix('/').unwrap_or(path);
    let (provider_seg, rest) = trimmed
        .split_once('/')
        .ok_or_else(|| ProxyError::BadRequest(format!("invalid proxy path: {path}")))?;

    let provider = Provider::from_path_segment(provider_seg)
        .ok_or_else(|| ProxyError::BadRequest(format!("unknown provider: {provider_seg}")))?;

    let (upstream, remaining) = match rest.split_once('/') {
        Some((host, tail)) => (host, format!("/{tail}")),
        None => (rest, "/".to_string()),
    };

    if upstream.is_empty() {
        return Err(ProxyError::BadRequest(format!(
            "missing upstream host in path: {path}"
        )));
    }

    Ok(Route::Proxy {
        provider,
        upstream: upstream.to_string(),
        path: remaining,
    })
}

fn parse_bedrock_route(rest: &str) -> Result<Route, ProxyError> {
    let (model_id, op) = rest
        .split_once('/')
        .ok_or_else(|| ProxyError::BadRequest(format!("invalid bedrock path: /model/{rest}")))?;

    if !is_valid_model_id(model_id) {
        return Err(ProxyError::BadRequest(format!(
            "invalid model id: {model_id}"
        )));
    }

    let streaming = match op {
        "invoke" => false,
        "invoke-with-response-stream" => true,
        other => {
            return Err(ProxyError::BadRequest(format!(
                "unknown bedrock operation: {other}"
            )))
        }
    };

    Ok(Route::Bedrock {
        model_id: model_id.to_string(),
        streaming,
    })
}

/// Model ids are restricted to `[A-Za-z0-9._:-]+`. Rejecting everything else
/// (notably `%` and whitespace) keeps percent-encoded or injected segments
/// out of the signed upstream URL.
pub fn is_valid_model_id(model_id: &str) -> bool {
    !model_id.is_empty()
        && model_id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | ':' | '-'))
}

/// Paths that carry conversation traffic and therefore participate in
/// session tracking and event emission.
pub fn is_conversation_path(path: &str) -> bool {
    if path == "/v1/messages" || path == "/v1/chat/completions" {
        return true;
    }
    path.starts_with("/model/")
        && (path.ends_with("/invoke") || path.ends_with("/invoke-with-response-stream"))
}
