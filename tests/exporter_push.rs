//! Exporter behavior against live mock endpoints: wire format, overflow
//! accounting, drop-not-block.

use std::io::Read;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;

use llm_proxy::exporter::{Exporter, ExporterConfig};
use llm_proxy::journal::{EntryPayload, JournalEntry, Meta};

fn entry(session: &str) -> JournalEntry {
    JournalEntry::new(
        EntryPayload::Request {
            seq: 1,
            method: "POST".to_string(),
            path: "/v1/messages".to_string(),
            headers: Default::default(),
            body: "{}".to_string(),
            size: 2,
        },
        Meta::new("tester@host", "api.anthropic.com", session, None),
    )
}

/// A push endpoint that answers 204 and captures request bodies.
async fn spawn_loki() -> (String, Arc<tokio::sync::Mutex<Vec<Vec<u8>>>>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap().to_string();
    let bodies: Arc<tokio::sync::Mutex<Vec<Vec<u8>>>> = Arc::default();

    let captured = bodies.clone();
    tokio::spawn(async move {
        loop {
            let Ok((mut stream, _)) = listener.accept().await else {
                break;
            };
            let mut buf = Vec::new();
            let mut tmp = [0u8; 4096];
            let header_end = loop {
                let Ok(n) = stream.read(&mut tmp).await else {
                    break 0;
                };
                if n == 0 {
                    break 0;
                }
                buf.extend_from_slice(&tmp[..n]);
                if let Some(pos) = buf.windows(4).position(|w| w == b"\r\n\r\n") {
                    break pos + 4;
                }
            };
            if header_end == 0 {
                continue;
            }
            let head = String::from_utf8_lossy(&buf[..header_end]).to_lowercase();
            let content_length: usize = head
                .lines()
                .find_map(|l| l.strip_prefix("content-length:"))
                .and_then(|v| v.trim().parse().ok())
                .unwrap_or(0);
            let mut body = buf[header_end..].to_vec();
            while body.len() < content_length {
                let Ok(n) = stream.read(&mut tmp).await else {
                    break;
                };
                if n == 0 {
                    break;
                }
                body.extend_from_slice(&tmp[..n]);
            }
            captured.lock().await.push(body);
            let _ = stream
                .write_all(b"HTTP/1.1 204 No Content\r\nContent-Length: 0\r\nConnection: close\r\n\r\n")
                .await;
            let _ = stream.shutdown().await;
        }
    });

    (addr, bodies)
}

#[tokio::test]
async fn batches_reach_the_endpoint_with_fixed_labels() {
    let (addr, bodies) = spawn_loki().await;
    let exporter = Exporter::new(ExporterConfig {
        url: format!("http://{addr}/loki/api/v1/push"),
        batch_wait: Duration::from_millis(100),
        use_gzip: false,
        environment: "testing".to_string(),
        ..Default::default()
    })
    .unwrap();

    exporter.push(&entry("s1"), "anthropic");
    exporter.push(&entry("s1"), "anthropic");
    exporter.push(&entry("s2"), "openai");

    tokio::time::sleep(Duration::from_millis(400)).await;
    exporter.close().await.unwrap();

    let stats = exporter.stats();
    assert_eq!(stats.sent, 3);
    assert_eq!(stats.dropped, 0);
    assert_eq!(stats.failed, 0);
    assert!(stats.batches_sent >= 1);

    let bodies = bodies.lock().await;
    assert!(!bodies.is_empty());
    let payload: serde_json::Value = serde_json::from_slice(&bodies[0]).unwrap();
    let streams = payload["streams"].as_array().unwrap();
    assert!(!streams.is_empty());

    for stream in streams {
        let labels = stream["stream"].as_object().unwrap();
        let mut keys: Vec<&str> = labels.keys().map(String::as_str).collect();
        keys.sort_unstable();
        assert_eq!(
            keys,
            vec!["app", "environment", "log_type", "machine", "provider"]
        );
        assert_eq!(labels["app"], "llm-proxy");
        assert_eq!(labels["environment"], "testing");
        assert_eq!(labels["log_type"], "request");

        for value in stream["values"].as_array().unwrap() {
            let pair = value.as_array().unwrap();
            assert_eq!(pair.len(), 2);
            // Unix nanos as a decimal string.
            assert!(pair[0].as_str().unwrap().chars().all(|c| c.is_ascii_digit()));
            let line: serde_json::Value = serde_json::from_str(pair[1].as_str().unwrap()).unwrap();
            assert_eq!(line["type"], "request");
            assert!(line["_meta"]["session"].as_str().is_some());
        }
    }
}

#[tokio::test]
async fn gzip_payloads_decode_to_the_same_wire_format() {
    let (addr, bodies) = spawn_loki().await;
    let exporter = Exporter::new(ExporterConfig {
        url: format!("http://{addr}/loki/api/v1/push"),
        batch_wait: Duration::from_millis(100),
        use_gzip: true,
        ..Default::default()
    })
    .unwrap();

    exporter.push(&entry("s1"), "anthropic");
    tokio::time::sleep(Duration::from_millis(400)).await;
    exporter.close().await.unwrap();

    let bodies = bodies.lock().await;
    assert!(!bodies.is_empty());
    let mut decoder = flate2::read::GzDecoder::new(&bodies[0][..]);
    let mut decoded = String::new();
    decoder.read_to_string(&mut decoded).unwrap();
    let payload: serde_json::Value = serde_json::from_str(&decoded).unwrap();
    assert!(payload["streams"].is_array());
}

#[tokio::test]
async fn overflow_drops_without_blocking_push() {
    // An endpoint that accepts and then stalls: the first batch wedges the
    // worker so the queue fills.
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap().to_string();
    tokio::spawn(async move {
        loop {
            let Ok((stream, _)) = listener.accept().await else {
                break;
            };
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_secs(120)).await;
                drop(stream);
            });
        }
    });

    let exporter = Exporter::new(ExporterConfig {
        url: format!("http://{addr}/loki/api/v1/push"),
        batch_size: 1,
        batch_wait: Duration::from_millis(20),
        buffer_size: 4,
        retry_max: 0,
        shutdown_timeout: Duration::from_millis(200),
        ..Default::default()
    })
    .unwrap();

    // Give the worker a moment to pull the first entry and wedge on it.
    exporter.push(&entry("s0"), "anthropic");
    tokio::time::sleep(Duration::from_millis(100)).await;

    let started = Instant::now();
    for i in 0..99 {
        exporter.push(&entry(&format!("s{i}")), "anthropic");
    }
    let push_elapsed = started.elapsed();
    assert!(
        push_elapsed < Duration::from_millis(500),
        "push must never block: {push_elapsed:?}"
    );

    let stats = exporter.stats();
    assert!(stats.dropped >= 90, "stats: {stats:?}");

    // Drain cannot finish while the endpoint stalls.
    assert!(exporter.close().await.is_err());
}

#[tokio::test]
async fn failed_batches_keep_the_accounting_identity() {
    // Fast 500s: every batch fails after retries.
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap().to_string();
    tokio::spawn(async move {
        loop {
            let Ok((mut stream, _)) = listener.accept().await else {
                break;
            };
            let mut tmp = [0u8; 4096];
            let _ = stream.read(&mut tmp).await;
            let _ = stream
                .write_all(b"HTTP/1.1 500 MOCK\r\nContent-Length: 0\r\nConnection: close\r\n\r\n")
                .await;
            let _ = stream.shutdown().await;
        }
    });

    let exporter = Exporter::new(ExporterConfig {
        url: format!("http://{addr}/loki/api/v1/push"),
        batch_wait: Duration::from_millis(50),
        retry_max: 1,
        retry_wait_base: Duration::from_millis(1),
        retry_wait_cap: Duration::from_millis(2),
        ..Default::default()
    })
    .unwrap();

    for i in 0..10 {
        exporter.push(&entry(&format!("s{i}")), "anthropic");
    }
    tokio::time::sleep(Duration::from_millis(500)).await;
    exporter.close().await.unwrap();

    let stats = exporter.stats();
    assert_eq!(stats.sent + stats.failed + stats.dropped, 10, "stats: {stats:?}");
    assert_eq!(stats.failed, 10);
    assert_eq!(stats.batches_sent, 0);
}
