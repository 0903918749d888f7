//! Request forwarding with byte-faithful capture.
//!
//! The forwarder buffers each request body once (it is read twice: upstream
//! dispatch and journaling), forwards to the upstream with hop-by-hop
//! headers removed and `Host` rewritten, and mirrors the response back to
//! the client. SSE responses are passed through frame by frame while each
//! chunk is captured with timing; everything else is buffered whole.
//!
//! Capture and telemetry never change what the client sees: the upstream
//! status, headers and body bytes go back unmodified, and journal failures
//! after a successful upstream exchange only produce log lines.

use std::collections::BTreeMap;
use std::convert::Infallible;
use std::sync::Arc;
use std::time::Instant;

use bytes::Bytes;
use http_body_util::combinators::BoxBody;
use http_body_util::{BodyExt, Full, StreamBody};
use hyper::body::{Body, Frame};
use hyper::header::{self, HeaderValue};
use hyper::{HeaderMap, Request, Response};
use hyper_rustls::{HttpsConnector, HttpsConnectorBuilder};
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::{ProxyError, ProxyResult};
use crate::events::TurnContext;
use crate::journal::{
    now_rfc3339_nanos, EntryPayload, JournalEntry, Meta, ResponseTiming, StreamChunk,
};
use crate::obfuscate::obfuscate_headers;
use crate::parser::{extract_delta_text, parse_response_body, ParsedResponse};
use crate::routes::{is_conversation_path, Provider};
use crate::server::ProxyState;
use crate::session::SessionHandle;

/// Shared upstream client: HTTPS with native roots, HTTP/1.1 and HTTP/2.
pub type HttpsClient = Client<HttpsConnector<HttpConnector>, Full<Bytes>>;

/// Body type returned toward the client.
pub type ProxyBody = BoxBody<Bytes, Infallible>;

pub fn full_body(bytes: Bytes) -> ProxyBody {
    BoxBody::new(Full::new(bytes))
}

/// Build the shared upstream client.
pub fn build_client() -> ProxyResult<HttpsClient> {
    let _ = rustls::crypto::ring::default_provider().install_default();

    let mut http_connector = HttpConnector::new();
    http_connector.set_nodelay(true);
    http_connector.enforce_http(false);

    let https_connector = HttpsConnectorBuilder::new()
        .with_native_roots()?
        .https_or_http()
        .enable_http1()
        .enable_http2()
        .wrap_connector(http_connector);

    Ok(Client::builder(TokioExecutor::new())
        .pool_max_idle_per_host(32)
        .pool_idle_timeout(std::time::Duration::from_secs(90))
        .build(https_connector))
}

/// Hop-by-hop headers are connection-scoped and must not cross the proxy.
fn is_hop_by_hop(name: &str) -> bool {
    matches!(
        name.to_ascii_lowercase().as_str(),
        "connection"
            | "keep-alive"
            | "proxy-authenticate"
            | "proxy-authorization"
            | "te"
            | "trailer"
            | "trailers"
            | "transfer-encoding"
            | "upgrade"
    )
}

/// Local upstreams speak plain HTTP; everything else gets TLS.
fn is_localhost(host: &str) -> bool {
    host.starts_with("127.0.0.1") || host.starts_with("localhost")
}

/// Forward one request to `{provider}`'s upstream and mirror the response.
pub async fn forward<B>(
    state: Arc<ProxyState>,
    provider: Provider,
    upstream: String,
    path: String,
    req: Request<B>,
) -> ProxyResult<Response<ProxyBody>>
where
    B: Body,
    B::Error: std::fmt::Display,
{
    let started = Instant::now();
    let (parts, body) = req.into_parts();
    let body_bytes = body
        .collect()
        .await
        .map_err(|e| ProxyError::ClientBody(e.to_string()))?
        .to_bytes();

    let request_id = Uuid::new_v4().to_string();
    let tracked = is_conversation_path(&path);
    let session = resolve_session(&state, tracked, &body_bytes, provider, &upstream, &parts.headers, &path);
    state
        .writer
        .journal()
        .register_session(&session.session_id, &session.file_path);

    if session.is_new {
        let entry = JournalEntry::new(
            EntryPayload::SessionStart {
                provider: provider.as_str().to_string(),
                upstream: upstream.clone(),
            },
            Meta::new(&state.machine, &upstream, &session.session_id, None),
        );
        log_entry(&state, &entry, provider).await;
    }

    let request_entry = JournalEntry::new(
        EntryPayload::Request {
            seq: session.seq,
            method: parts.method.to_string(),
            path: path.clone(),
            headers: obfuscate_headers(&parts.headers),
            body: String::from_utf8_lossy(&body_bytes).into_owned(),
            size: body_bytes.len() as u64,
        },
        Meta::new(
            &state.machine,
            &upstream,
            &session.session_id,
            Some(request_id.clone()),
        ),
    );
    log_entry(&state, &request_entry, provider).await;

    let upstream_req = build_upstream_request(&parts, &upstream, &path, body_bytes.clone())?;
    let response = match state.client.request(upstream_req).await {
        Ok(response) => response,
        Err(e) => {
            let elapsed = started.elapsed().as_millis() as i64;
            let entry = JournalEntry::new(
                EntryPayload::Response {
                    seq: session.seq,
                    status: 502,
                    headers: BTreeMap::new(),
                    timing: ResponseTiming {
                        ttfb_ms: elapsed,
                        total_ms: elapsed,
                    },
                    size: 0,
                    body: Some(format!("upstream request failed: {e}")),
                    chunks: None,
                },
                Meta::new(
                    &state.machine,
                    &upstream,
                    &session.session_id,
                    Some(request_id.clone()),
                ),
            );
            log_entry(&state, &entry, provider).await;
            return Err(ProxyError::Upstream(e.to_string()));
        }
    };
    let ttfb_ms = started.elapsed().as_millis() as i64;

    let (mut rparts, rbody) = response.into_parts();
    strip_hop_by_hop(&mut rparts.headers);

    let turn = tracked.then(|| TurnContext {
        session_id: session.session_id.clone(),
        provider: provider.as_str().to_string(),
        upstream: upstream.clone(),
        machine: state.machine.clone(),
        request_id: Some(request_id.clone()),
    });

    let capture = CaptureCtx {
        state: state.clone(),
        provider,
        upstream,
        session_id: session.session_id.clone(),
        seq: session.seq,
        request_id,
        request_body: String::from_utf8_lossy(&body_bytes).into_owned(),
        turn,
        started,
        ttfb_ms,
        status: rparts.status.as_u16(),
        response_headers: headers_to_map(&rparts.headers),
    };

    if is_sse_response(&rparts.headers) {
        let (tx, rx) = mpsc::channel::<Result<Frame<Bytes>, Infallible>>(32);
        tokio::spawn(capture_stream(capture, rbody, tx));
        let body = BoxBody::new(StreamBody::new(ReceiverStream::new(rx)));
        Ok(Response::from_parts(rparts, body))
    } else {
        match rbody.collect().await {
            Ok(collected) => {
                let resp_bytes = collected.to_bytes();
                finalize_buffered(&capture, &resp_bytes).await;
                Ok(Response::from_parts(rparts, full_body(resp_bytes)))
            }
            Err(e) => {
                let elapsed = started.elapsed().as_millis() as i64;
                let entry = JournalEntry::new(
                    EntryPayload::Response {
                        seq: capture.seq,
                        status: 502,
                        headers: capture.response_headers.clone(),
                        timing: ResponseTiming {
                            ttfb_ms: capture.ttfb_ms,
                            total_ms: elapsed,
                        },
                        size: 0,
                        body: Some(format!("failed to read upstream body: {e}")),
                        chunks: None,
                    },
                    capture.meta(),
                );
                log_entry(&capture.state, &entry, provider).await;
                Err(ProxyError::Upstream(format!(
                    "failed to read upstream body: {e}"
                )))
            }
        }
    }
}

/// Everything a response-capture task needs once the handler has returned.
struct CaptureCtx {
    state: Arc<ProxyState>,
    provider: Provider,
    upstream: String,
    session_id: String,
    seq: u64,
    request_id: String,
    request_body: String,
    turn: Option<TurnContext>,
    started: Instant,
    ttfb_ms: i64,
    status: u16,
    response_headers: BTreeMap<String, Vec<String>>,
}

impl CaptureCtx {
    fn meta(&self) -> Meta {
        Meta::new(
            &self.state.machine,
            &self.upstream,
            &self.session_id,
            Some(self.request_id.clone()),
        )
    }
}

/// Stream the upstream SSE body to the client while capturing every chunk,
/// then journal the response and run the event engine.
async fn capture_stream(
    ctx: CaptureCtx,
    mut body: hyper::body::Incoming,
    tx: mpsc::Sender<Result<Frame<Bytes>, Infallible>>,
) {
    let mut chunks: Vec<StreamChunk> = Vec::new();
    let mut accumulated = String::new();
    let mut line_buf = String::new();
    let mut size: u64 = 0;

    loop {
        let frame = match body.frame().await {
            Some(Ok(frame)) => frame,
            Some(Err(e)) => {
                warn!(session = %ctx.session_id, error = %e, "upstream stream error");
                break;
            }
            None => break,
        };
        let Ok(data) = frame.into_data() else {
            continue;
        };
        if data.is_empty() {
            continue;
        }
        size += data.len() as u64;

        // Forward before capturing; a closed receiver means the client went
        // away and copying stops, but the captured prefix is still logged.
        if tx.send(Ok(Frame::data(data.clone()))).await.is_err() {
            debug!(session = %ctx.session_id, "client disconnected mid-stream");
            break;
        }

        let text = String::from_utf8_lossy(&data).into_owned();
        chunks.push(StreamChunk {
            ts: now_rfc3339_nanos(),
            delta_ms: ctx.started.elapsed().as_millis() as i64,
            raw: text.clone(),
        });

        line_buf.push_str(&text);
        while let Some(pos) = line_buf.find('\n') {
            let line: String = line_buf.drain(..=pos).collect();
            if let Some(delta) = extract_delta_text(line.trim_end(), ctx.provider) {
                accumulated.push_str(&delta);
            }
        }
    }
    drop(tx);

    let total_ms = ctx.started.elapsed().as_millis() as i64;
    let entry = JournalEntry::new(
        EntryPayload::Response {
            seq: ctx.seq,
            status: ctx.status,
            headers: ctx.response_headers.clone(),
            timing: ResponseTiming {
                ttfb_ms: ctx.ttfb_ms,
                total_ms,
            },
            size,
            body: None,
            chunks: Some(chunks),
        },
        ctx.meta(),
    );
    log_entry(&ctx.state, &entry, ctx.provider).await;

    if let Some(turn) = &ctx.turn {
        let response = ParsedResponse::from_text(accumulated);
        ctx.state
            .engine
            .process_turn(
                &ctx.state.sink,
                turn,
                &ctx.request_body,
                &response,
                ctx.status,
                None,
            )
            .await;
    }
}

/// Journal a buffered response and run the event engine.
async fn finalize_buffered(ctx: &CaptureCtx, resp_bytes: &Bytes) {
    let total_ms = ctx.started.elapsed().as_millis() as i64;
    let body_text = String::from_utf8_lossy(resp_bytes).into_owned();

    let entry = JournalEntry::new(
        EntryPayload::Response {
            seq: ctx.seq,
            status: ctx.status,
            headers: ctx.response_headers.clone(),
            timing: ResponseTiming {
                ttfb_ms: ctx.ttfb_ms,
                total_ms,
            },
            size: resp_bytes.len() as u64,
            body: Some(body_text.clone()),
            chunks: None,
        },
        ctx.meta(),
    );
    log_entry(&ctx.state, &entry, ctx.provider).await;

    if let Some(turn) = &ctx.turn {
        let response = parse_response_body(&body_text, ctx.provider);
        ctx.state
            .engine
            .process_turn(
                &ctx.state.sink,
                turn,
                &ctx.request_body,
                &response,
                ctx.status,
                Some(&body_text),
            )
            .await;
    }
}

fn resolve_session(
    state: &ProxyState,
    tracked: bool,
    body: &[u8],
    provider: Provider,
    upstream: &str,
    headers: &HeaderMap,
    path: &str,
) -> SessionHandle {
    if !tracked {
        return state.sessions.synthetic_session(upstream);
    }
    match state
        .sessions
        .get_or_create_session(body, provider, upstream, headers, path)
    {
        Ok(handle) => handle,
        Err(e) => {
            warn!(error = %e, "session store unavailable; using synthetic session");
            state.sessions.synthetic_session(upstream)
        }
    }
}

pub(crate) async fn log_entry(state: &ProxyState, entry: &JournalEntry, provider: Provider) {
    if let Err(e) = state.writer.log(entry, provider.as_str()).await {
        warn!(session = %entry.meta.session, error = %e, "journal write failed");
    }
}

fn build_upstream_request(
    parts: &http::request::Parts,
    upstream: &str,
    path: &str,
    body: Bytes,
) -> ProxyResult<Request<Full<Bytes>>> {
    let scheme = if is_localhost(upstream) { "http" } else { "https" };
    let mut uri = format!("{scheme}://{upstream}{path}");
    if let Some(query) = parts.uri.query() {
        uri.push('?');
        uri.push_str(query);
    }

    let mut builder = Request::builder().method(parts.method.clone()).uri(&uri);
    let headers = builder
        .headers_mut()
        .ok_or_else(|| ProxyError::Upstream("request builder in invalid state".to_string()))?;
    for (name, value) in parts.headers.iter() {
        let name_str = name.as_str();
        // accept-encoding is dropped so the captured response bytes stay
        // uncompressed; the client still receives exactly what upstream sent.
        if is_hop_by_hop(name_str) || name_str == "host" || name_str == "accept-encoding" {
            continue;
        }
        headers.append(name.clone(), value.clone());
    }
    headers.insert(
        header::HOST,
        HeaderValue::from_str(upstream)
            .map_err(|_| ProxyError::BadRequest(format!("invalid upstream host: {upstream}")))?,
    );

    builder
        .body(Full::new(body))
        .map_err(|e| ProxyError::Upstream(e.to_string()))
}

fn is_sse_response(headers: &HeaderMap) -> bool {
    headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.starts_with("text/event-stream"))
        .unwrap_or(false)
}

fn strip_hop_by_hop(headers: &mut HeaderMap) {
    let doomed: Vec<_> = headers
        .keys()
        .filter(|name| is_hop_by_hop(name.as_str()))
        .cloned()
        .collect();
    for name in doomed {
        headers.remove(name);
    }
}

pub(crate) fn headers_to_map(headers: &HeaderMap) -> BTreeMap<String, Vec<String>> {
    let mut map: BTreeMap<String, Vec<String>> = BTreeMap::new();
    for (name, value) in headers.iter() {
        map.entry(name.as_str().to_string())
            .or_default()
            .push(String::from_utf8_lossy(value.as_bytes()).into_owned());
    }
    map
}

#[cfg(test)]
mod tests {
    use super::*;
    use hyper::Method;

    fn parts_for(uri: &str, headers: &[(&str, &str)]) -> http::request::Parts {
        let mut builder = Request::builder().method(Method::POST).uri(uri);
        for (name, value) in headers {
            builder = builder.header(*name, *value);
        }
        builder.body(()).unwrap().into_parts().0
    }

    #[test]
    fn hop_by_hop_headers() {
        for name in [
            "connection",
            "Connection",
            "keep-alive",
            "proxy-authenticate",
            "proxy-authorization",
            "te",
            "trailer",
            "transfer-encoding",
            "upgrade",
        ] {
            assert!(is_hop_by_hop(name), "{name} should be hop-by-hop");
        }
        for name in ["content-type", "authorization", "x-api-key", "user-agent"] {
            assert!(!is_hop_by_hop(name), "{name} should pass through");
        }
    }

    #[test]
    fn localhost_detection() {
        assert!(is_localhost("127.0.0.1:8080"));
        assert!(is_localhost("localhost"));
        assert!(is_localhost("localhost:3000"));
        assert!(!is_localhost("api.anthropic.com"));
    }

    #[test]
    fn upstream_request_rewrites_host_and_scheme() {
        let parts = parts_for(
            "/anthropic/api.anthropic.com/v1/messages",
            &[
                ("host", "localhost:8080"),
                ("content-type", "application/json"),
                ("x-api-key", "sk-ant-test"),
                ("connection", "keep-alive"),
                ("accept-encoding", "gzip, br"),
            ],
        );
        let req =
            build_upstream_request(&parts, "api.anthropic.com", "/v1/messages", Bytes::new())
                .unwrap();

        assert_eq!(req.uri().to_string(), "https://api.anthropic.com/v1/messages");
        assert_eq!(req.headers()["host"], "api.anthropic.com");
        assert_eq!(req.headers()["content-type"], "application/json");
        assert_eq!(req.headers()["x-api-key"], "sk-ant-test");
        assert!(!req.headers().contains_key("connection"));
        assert!(!req.headers().contains_key("accept-encoding"));
    }

    #[test]
    fn upstream_request_uses_http_for_localhost_and_keeps_query() {
        let parts = parts_for("/openai/localhost:9999/v1/chat/completions?beta=true", &[]);
        let req = build_upstream_request(
            &parts,
            "localhost:9999",
            "/v1/chat/completions",
            Bytes::new(),
        )
        .unwrap();
        assert_eq!(
            req.uri().to_string(),
            "http://localhost:9999/v1/chat/completions?beta=true"
        );
    }

    #[test]
    fn sse_detection() {
        let mut headers = HeaderMap::new();
        headers.insert(header::CONTENT_TYPE, "text/event-stream".parse().unwrap());
        assert!(is_sse_response(&headers));

        headers.insert(
            header::CONTENT_TYPE,
            "text/event-stream; charset=utf-8".parse().unwrap(),
        );
        assert!(is_sse_response(&headers));

        headers.insert(header::CONTENT_TYPE, "application/json".parse().unwrap());
        assert!(!is_sse_response(&headers));

        assert!(!is_sse_response(&HeaderMap::new()));
    }

    #[test]
    fn strip_hop_by_hop_from_response() {
        let mut headers = HeaderMap::new();
        headers.insert("content-type", "application/json".parse().unwrap());
        headers.insert("transfer-encoding", "chunked".parse().unwrap());
        headers.insert("connection", "keep-alive".parse().unwrap());
        strip_hop_by_hop(&mut headers);
        assert!(headers.contains_key("content-type"));
        assert!(!headers.contains_key("transfer-encoding"));
        assert!(!headers.contains_key("connection"));
    }
}
