//! Async fan-out to a Loki-compatible push endpoint.
//!
//! The exporter is strictly best-effort: `push` never blocks the request
//! path. Entries go into a bounded queue; when the queue is full they are
//! dropped and counted. A single worker owns the batch buffer and flushes on
//! size, on idle timeout, and on shutdown, with capped exponential backoff
//! plus jitter around the HTTP push.
//!
//! Labels are the closed set `{app, provider, environment, machine,
//! log_type}`. Session ids, request ids, paths and statuses ride inside the
//! JSON log line, never in labels; [`StreamLabels`] makes adding a label key
//! a compile-time decision rather than a runtime one.

use std::io::Write;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use flate2::write::GzEncoder;
use flate2::Compression;
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::ExporterError;
use crate::journal::JournalEntry;

/// Exporter configuration. Zero/empty knobs fall back to the documented
/// defaults at construction time, mirroring how the rest of the config layer
/// treats unset env vars.
#[derive(Debug, Clone)]
pub struct ExporterConfig {
    /// Full push endpoint URL, e.g. `http://loki:3100/loki/api/v1/push`.
    pub url: String,
    /// Optional bearer token.
    pub auth_token: Option<String>,
    /// Flush when this many entries have accumulated.
    pub batch_size: usize,
    /// Flush after this much idle time regardless of size.
    pub batch_wait: Duration,
    /// Maximum retry attempts per batch.
    pub retry_max: u32,
    /// Base delay between retries.
    pub retry_wait_base: Duration,
    /// Ceiling on the exponential delay.
    pub retry_wait_cap: Duration,
    pub use_gzip: bool,
    /// Static `environment` label.
    pub environment: String,
    /// Bounded queue capacity.
    pub buffer_size: usize,
    /// Bound on drain-on-close.
    pub shutdown_timeout: Duration,
}

impl Default for ExporterConfig {
    fn default() -> Self {
        ExporterConfig {
            url: String::new(),
            auth_token: None,
            batch_size: 1000,
            batch_wait: Duration::from_secs(5),
            retry_max: 5,
            retry_wait_base: Duration::from_millis(100),
            retry_wait_cap: Duration::from_secs(10),
            use_gzip: true,
            environment: "development".to_string(),
            buffer_size: 10_000,
            shutdown_timeout: Duration::from_secs(30),
        }
    }
}

impl ExporterConfig {
    fn normalized(mut self) -> Self {
        let defaults = ExporterConfig::default();
        if self.batch_size == 0 {
            self.batch_size = defaults.batch_size;
        }
        if self.batch_wait.is_zero() {
            self.batch_wait = defaults.batch_wait;
        }
        if self.retry_wait_base.is_zero() {
            self.retry_wait_base = defaults.retry_wait_base;
        }
        if self.retry_wait_cap.is_zero() {
            self.retry_wait_cap = defaults.retry_wait_cap;
        }
        if self.buffer_size == 0 {
            self.buffer_size = defaults.buffer_size;
        }
        if self.shutdown_timeout.is_zero() {
            self.shutdown_timeout = defaults.shutdown_timeout;
        }
        self
    }
}

/// Monotonic counters; readable from any thread without tearing.
#[derive(Debug, Default)]
struct Counters {
    sent: AtomicU64,
    failed: AtomicU64,
    dropped: AtomicU64,
    batches_sent: AtomicU64,
}

/// Point-in-time view of the exporter counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ExporterStats {
    pub sent: u64,
    pub failed: u64,
    pub dropped: u64,
    pub batches_sent: u64,
}

/// The fixed label set. There is deliberately no way to attach another key.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize)]
pub struct StreamLabels {
    app: &'static str,
    provider: String,
    environment: String,
    machine: String,
    log_type: String,
}

#[derive(Serialize)]
struct LokiStream {
    stream: StreamLabels,
    values: Vec<[String; 2]>,
}

#[derive(Serialize)]
struct PushRequest {
    streams: Vec<LokiStream>,
}

/// One queued entry. Produced by the fan-out writer, consumed by the worker;
/// never shared.
struct QueuedEntry {
    entry: JournalEntry,
    provider: String,
    timestamp: DateTime<Utc>,
    log_type: &'static str,
    machine: String,
}

/// Handle to the background export worker.
#[derive(Debug)]
pub struct Exporter {
    tx: mpsc::Sender<QueuedEntry>,
    counters: Arc<Counters>,
    cancel: CancellationToken,
    worker: Mutex<Option<JoinHandle<()>>>,
    shutdown_timeout: Duration,
}

impl Exporter {
    /// Validate the configuration and spawn the worker. Must be called from
    /// within a tokio runtime.
    pub fn new(config: ExporterConfig) -> Result<Arc<Self>, ExporterError> {
        if config.url.is_empty() {
            return Err(ExporterError::MissingUrl);
        }
        let config = config.normalized();

        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| ExporterError::Init(e.to_string()))?;

        let (tx, rx) = mpsc::channel(config.buffer_size);
        let counters = Arc::new(Counters::default());
        let cancel = CancellationToken::new();
        let shutdown_timeout = config.shutdown_timeout;

        let worker = tokio::spawn(run_worker(
            config,
            client,
            rx,
            counters.clone(),
            cancel.clone(),
        ));

        Ok(Arc::new(Exporter {
            tx,
            counters,
            cancel,
            worker: Mutex::new(Some(worker)),
            shutdown_timeout,
        }))
    }

    /// Enqueue an entry for export. Never blocks; drops (and counts) when the
    /// queue is full.
    pub fn push(&self, entry: &JournalEntry, provider: &str) {
        let timestamp = DateTime::parse_from_rfc3339(&entry.meta.ts)
            .map(|dt| dt.with_timezone(&Utc))
            .unwrap_or_else(|_| Utc::now());

        let queued = QueuedEntry {
            provider: provider.to_string(),
            timestamp,
            log_type: entry.payload.log_type(),
            machine: entry.meta.machine.clone(),
            entry: entry.clone(),
        };

        if self.tx.try_send(queued).is_err() {
            self.counters.dropped.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn stats(&self) -> ExporterStats {
        ExporterStats {
            sent: self.counters.sent.load(Ordering::Relaxed),
            failed: self.counters.failed.load(Ordering::Relaxed),
            dropped: self.counters.dropped.load(Ordering::Relaxed),
            batches_sent: self.counters.batches_sent.load(Ordering::Relaxed),
        }
    }

    /// Signal shutdown, drain the queue, send the final batch, and wait up to
    /// `shutdown_timeout`. Idempotent; later calls return `Ok(())`.
    pub async fn close(&self) -> Result<(), ExporterError> {
        self.cancel.cancel();
        let handle = self.worker.lock().take();
        match handle {
            Some(handle) => match tokio::time::timeout(self.shutdown_timeout, handle).await {
                Ok(_) => Ok(()),
                Err(_) => Err(ExporterError::ShutdownTimeout(self.shutdown_timeout)),
            },
            None => Ok(()),
        }
    }
}

async fn run_worker(
    config: ExporterConfig,
    client: reqwest::Client,
    mut rx: mpsc::Receiver<QueuedEntry>,
    counters: Arc<Counters>,
    cancel: CancellationToken,
) {
    let mut batch: Vec<QueuedEntry> = Vec::with_capacity(config.batch_size);
    let idle = tokio::time::sleep(config.batch_wait);
    tokio::pin!(idle);

    loop {
        tokio::select! {
            maybe = rx.recv() => {
                match maybe {
                    Some(entry) => {
                        batch.push(entry);
                        if batch.len() >= config.batch_size {
                            send_batch(&config, &client, &counters, std::mem::take(&mut batch)).await;
                            idle.as_mut().reset(tokio::time::Instant::now() + config.batch_wait);
                        }
                    }
                    None => {
                        if !batch.is_empty() {
                            send_batch(&config, &client, &counters, std::mem::take(&mut batch)).await;
                        }
                        return;
                    }
                }
            }
            () = &mut idle => {
                if !batch.is_empty() {
                    send_batch(&config, &client, &counters, std::mem::take(&mut batch)).await;
                }
                idle.as_mut().reset(tokio::time::Instant::now() + config.batch_wait);
            }
            () = cancel.cancelled() => {
                // Drain whatever is queued, flush once, and exit.
                while let Ok(entry) = rx.try_recv() {
                    batch.push(entry);
                }
                if !batch.is_empty() {
                    send_batch(&config, &client, &counters, std::mem::take(&mut batch)).await;
                }
                return;
            }
        }
    }
}

async fn send_batch(
    config: &ExporterConfig,
    client: &reqwest::Client,
    counters: &Counters,
    entries: Vec<QueuedEntry>,
) {
    if entries.is_empty() {
        return;
    }

    let mut streams: std::collections::BTreeMap<StreamLabels, Vec<[String; 2]>> =
        std::collections::BTreeMap::new();
    let mut included: u64 = 0;

    for queued in &entries {
        let line = match serde_json::to_string(&queued.entry) {
            Ok(line) => line,
            Err(e) => {
                warn!(error = %e, "failed to serialize log entry for export");
                counters.failed.fetch_add(1, Ordering::Relaxed);
                continue;
            }
        };
        let labels = StreamLabels {
            app: "llm-proxy",
            provider: queued.provider.clone(),
            environment: config.environment.clone(),
            machine: queued.machine.clone(),
            log_type: queued.log_type.to_string(),
        };
        let ts = queued
            .timestamp
            .timestamp_nanos_opt()
            .unwrap_or_default()
            .to_string();
        streams.entry(labels).or_default().push([ts, line]);
        included += 1;
    }

    if included == 0 {
        return;
    }

    let request = PushRequest {
        streams: streams
            .into_iter()
            .map(|(stream, values)| LokiStream { stream, values })
            .collect(),
    };

    for attempt in 0..=config.retry_max {
        if attempt > 0 {
            let delay = backoff_delay(attempt, config.retry_wait_base, config.retry_wait_cap);
            let jitter = delay.mul_f64(0.25 * rand::random::<f64>());
            tokio::time::sleep(delay + jitter).await;
        }

        match do_send(config, client, &request).await {
            Ok(()) => {
                counters.sent.fetch_add(included, Ordering::Relaxed);
                counters.batches_sent.fetch_add(1, Ordering::Relaxed);
                return;
            }
            Err(e) => {
                debug!(attempt, error = %e, "export push failed");
            }
        }
    }

    counters.failed.fetch_add(included, Ordering::Relaxed);
}

/// Deterministic part of the retry delay: `min(cap, base * 2^(attempt-1))`.
pub(crate) fn backoff_delay(attempt: u32, base: Duration, cap: Duration) -> Duration {
    match 1u32.checked_shl(attempt.saturating_sub(1)) {
        Some(factor) => base.saturating_mul(factor).min(cap),
        None => cap,
    }
}

async fn do_send(
    config: &ExporterConfig,
    client: &reqwest::Client,
    request: &PushRequest,
) -> Result<(), String> {
    let payload = serde_json::to_vec(request).map_err(|e| e.to_string())?;

    let mut req = client
        .post(&config.url)
        .header("Content-Type", "application/json");

    let body = if config.use_gzip {
        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(&payload).map_err(|e| e.to_string())?;
        req = req.header("Content-Encoding", "gzip");
        encoder.finish().map_err(|e| e.to_string())?
    } else {
        payload
    };

    if let Some(token) = &config.auth_token {
        req = req.header("Authorization", format!("Bearer {token}"));
    }

    let response = req.body(body).send().await.map_err(|e| e.to_string())?;
    let status = response.status();
    if status.is_success() {
        Ok(())
    } else {
        Err(format!("push endpoint returned status {status}"))
    }
}
