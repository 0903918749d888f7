//! Shared test harness: raw HTTP/1.1 mock upstreams and journal helpers.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tempfile::TempDir;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

use llm_proxy::config::Config;
use llm_proxy::server::{ProxyService, ProxyState};

/// One request as seen by a mock upstream.
#[derive(Debug, Clone)]
pub struct CapturedRequest {
    pub method: String,
    pub path: String,
    /// Lower-cased header names.
    pub headers: Vec<(String, String)>,
    pub body: String,
}

impl CapturedRequest {
    pub fn header(&self, name: &str) -> Option<&str> {
        let name = name.to_lowercase();
        self.headers
            .iter()
            .find(|(n, _)| *n == name)
            .map(|(_, v)| v.as_str())
    }
}

/// What a mock upstream should send back.
#[allow(dead_code)]
pub enum MockResponse {
    /// 200 with `application/json`.
    Json(String),
    /// Arbitrary status, content type and body.
    Status(u16, String, String),
    /// `text/event-stream`, one write+flush per frame with a pause between.
    Sse(Vec<String>),
    /// Arbitrary content type with binary segments written with pauses.
    Raw {
        content_type: String,
        segments: Vec<Vec<u8>>,
    },
    /// Accept the connection, then stall without responding.
    Hang,
}

pub struct MockUpstream {
    pub addr: String,
    requests: Arc<tokio::sync::Mutex<Vec<CapturedRequest>>>,
}

impl MockUpstream {
    pub async fn requests(&self) -> Vec<CapturedRequest> {
        self.requests.lock().await.clone()
    }
}

/// Spawn a mock upstream; `respond` is called with the 0-based request index.
pub async fn spawn_upstream<F>(respond: F) -> MockUpstream
where
    F: Fn(usize, &CapturedRequest) -> MockResponse + Send + Sync + 'static,
{
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap().to_string();
    let requests: Arc<tokio::sync::Mutex<Vec<CapturedRequest>>> = Arc::default();

    let captured = requests.clone();
    let respond = Arc::new(respond);
    tokio::spawn(async move {
        let mut index = 0usize;
        loop {
            let Ok((mut stream, _)) = listener.accept().await else {
                break;
            };
            let Some(request) = read_request(&mut stream).await else {
                continue;
            };
            let response = respond(index, &request);
            index += 1;
            captured.lock().await.push(request);
            write_response(&mut stream, response).await;
        }
    });

    MockUpstream { addr, requests }
}

async fn read_request(stream: &mut TcpStream) -> Option<CapturedRequest> {
    let mut buf = Vec::new();
    let mut tmp = [0u8; 4096];
    let header_end = loop {
        let n = stream.read(&mut tmp).await.ok()?;
        if n == 0 {
            return None;
        }
        buf.extend_from_slice(&tmp[..n]);
        if let Some(pos) = find(&buf, b"\r\n\r\n") {
            break pos + 4;
        }
        if buf.len() > 64 * 1024 {
            return None;
        }
    };

    let head = String::from_utf8_lossy(&buf[..header_end]).into_owned();
    let mut lines = head.lines();
    let request_line = lines.next()?;
    let mut parts = request_line.split_whitespace();
    let method = parts.next()?.to_string();
    let path = parts.next()?.to_string();

    let mut headers = Vec::new();
    let mut content_length = 0usize;
    for line in lines {
        if let Some((name, value)) = line.split_once(':') {
            let name = name.trim().to_lowercase();
            let value = value.trim().to_string();
            if name == "content-length" {
                content_length = value.parse().unwrap_or(0);
            }
            headers.push((name, value));
        }
    }

    let mut body = buf[header_end..].to_vec();
    while body.len() < content_length {
        let n = stream.read(&mut tmp).await.ok()?;
        if n == 0 {
            break;
        }
        body.extend_from_slice(&tmp[..n]);
    }

    Some(CapturedRequest {
        method,
        path,
        headers,
        body: String::from_utf8_lossy(&body).into_owned(),
    })
}

async fn write_response(stream: &mut TcpStream, response: MockResponse) {
    match response {
        MockResponse::Json(body) => {
            write_simple(stream, 200, "application/json", body.as_bytes()).await;
        }
        MockResponse::Status(status, content_type, body) => {
            write_simple(stream, status, &content_type, body.as_bytes()).await;
        }
        MockResponse::Sse(frames) => {
            let head = "HTTP/1.1 200 OK\r\nContent-Type: text/event-stream\r\nCache-Control: no-cache\r\nConnection: close\r\n\r\n";
            let _ = stream.write_all(head.as_bytes()).await;
            let _ = stream.flush().await;
            for frame in frames {
                tokio::time::sleep(Duration::from_millis(50)).await;
                let _ = stream.write_all(frame.as_bytes()).await;
                let _ = stream.flush().await;
            }
            let _ = stream.shutdown().await;
        }
        MockResponse::Raw {
            content_type,
            segments,
        } => {
            let head = format!(
                "HTTP/1.1 200 OK\r\nContent-Type: {content_type}\r\nConnection: close\r\n\r\n"
            );
            let _ = stream.write_all(head.as_bytes()).await;
            let _ = stream.flush().await;
            for segment in segments {
                tokio::time::sleep(Duration::from_millis(30)).await;
                let _ = stream.write_all(&segment).await;
                let _ = stream.flush().await;
            }
            let _ = stream.shutdown().await;
        }
        MockResponse::Hang => {
            tokio::time::sleep(Duration::from_secs(120)).await;
        }
    }
}

async fn write_simple(stream: &mut TcpStream, status: u16, content_type: &str, body: &[u8]) {
    let head = format!(
        "HTTP/1.1 {status} MOCK\r\nContent-Type: {content_type}\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
        body.len()
    );
    let _ = stream.write_all(head.as_bytes()).await;
    let _ = stream.write_all(body).await;
    let _ = stream.flush().await;
    let _ = stream.shutdown().await;
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}

/// A proxy service over a temp log directory.
#[allow(dead_code)]
pub struct TestProxy {
    pub dir: TempDir,
    pub service: ProxyService,
}

#[allow(dead_code)]
pub fn test_proxy() -> TestProxy {
    test_proxy_with(None)
}

pub fn test_proxy_with(bedrock: Option<llm_proxy::bedrock::BedrockBackend>) -> TestProxy {
    let dir = TempDir::new().unwrap();
    let config = Config {
        log_dir: dir.path().to_path_buf(),
        ..Default::default()
    };
    let state = ProxyState::build(&config, bedrock).unwrap();
    TestProxy {
        dir,
        service: ProxyService::new(state),
    }
}

/// All journal entries under `dir`, ordered by `_meta.ts`.
pub fn journal_entries(dir: &Path) -> Vec<Value> {
    let mut entries = Vec::new();
    collect_jsonl(dir, &mut entries);
    entries.sort_by(|a, b| {
        let ts_a = a["_meta"]["ts"].as_str().unwrap_or_default();
        let ts_b = b["_meta"]["ts"].as_str().unwrap_or_default();
        ts_a.cmp(ts_b)
    });
    entries
}

fn collect_jsonl(dir: &Path, entries: &mut Vec<Value>) {
    let Ok(read_dir) = std::fs::read_dir(dir) else {
        return;
    };
    for entry in read_dir.flatten() {
        let path = entry.path();
        if path.is_dir() {
            collect_jsonl(&path, entries);
        } else if path.extension().map(|e| e == "jsonl").unwrap_or(false) {
            let Ok(contents) = std::fs::read_to_string(&path) else {
                continue;
            };
            for line in contents.lines() {
                if let Ok(value) = serde_json::from_str(line) {
                    entries.push(value);
                }
            }
        }
    }
}

/// Poll until at least `min_entries` journal entries exist (streaming
/// capture journals from a background task).
#[allow(dead_code)]
pub async fn wait_for_journal(dir: &Path, min_entries: usize) -> Vec<Value> {
    for _ in 0..150 {
        let entries = journal_entries(dir);
        if entries.len() >= min_entries {
            return entries;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    journal_entries(dir)
}

#[allow(dead_code)]
pub fn entry_types(entries: &[Value]) -> Vec<String> {
    entries
        .iter()
        .map(|e| e["type"].as_str().unwrap_or_default().to_string())
        .collect()
}
