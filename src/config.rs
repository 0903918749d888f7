//! Runtime configuration.
//!
//! Everything can be set through `LLM_PROXY_*` environment variables; the
//! CLI flags in `main.rs` override the result. Configuration is read once at
//! startup and never reloaded.

use std::path::PathBuf;
use std::time::Duration;

use crate::exporter::ExporterConfig;

#[derive(Debug, Clone)]
pub struct Config {
    /// Port to listen on.
    pub port: u16,
    /// Bind address.
    pub bind: String,
    /// Root directory for journals and the session database.
    pub log_dir: PathBuf,
    /// AWS region for the Bedrock backend; unset leaves the backend off.
    pub bedrock_region: Option<String>,
    /// Concurrency bound on in-flight Bedrock dispatches.
    pub bedrock_max_concurrent: usize,
    /// Remote push exporter; `None` when disabled.
    pub exporter: Option<ExporterConfig>,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            port: 8080,
            bind: "127.0.0.1".to_string(),
            log_dir: PathBuf::from("./logs"),
            bedrock_region: None,
            bedrock_max_concurrent: 4,
            exporter: None,
        }
    }
}

impl Config {
    /// Load configuration from environment variables with defaults.
    ///
    /// - `LLM_PROXY_PORT` (default: 8080)
    /// - `LLM_PROXY_BIND` (default: 127.0.0.1)
    /// - `LLM_PROXY_LOG_DIR` (default: ./logs)
    /// - `LLM_PROXY_BEDROCK_REGION` / `AWS_REGION`
    /// - `LLM_PROXY_BEDROCK_MAX_CONCURRENT` (default: 4)
    /// - `LLM_PROXY_LOKI_ENABLED`, `LLM_PROXY_LOKI_URL`,
    ///   `LLM_PROXY_LOKI_AUTH_TOKEN`, `LLM_PROXY_LOKI_BATCH_SIZE`,
    ///   `LLM_PROXY_LOKI_BATCH_WAIT_SECS`, `LLM_PROXY_LOKI_RETRY_MAX`,
    ///   `LLM_PROXY_LOKI_USE_GZIP`, `LLM_PROXY_LOKI_ENVIRONMENT`,
    ///   `LLM_PROXY_LOKI_BUFFER_SIZE`, `LLM_PROXY_LOKI_SHUTDOWN_TIMEOUT_SECS`
    pub fn from_env() -> Self {
        let default = Config::default();

        let bedrock_region = std::env::var("LLM_PROXY_BEDROCK_REGION")
            .ok()
            .or_else(|| std::env::var("AWS_REGION").ok())
            .filter(|s| !s.is_empty());

        Config {
            port: env_parse("LLM_PROXY_PORT").unwrap_or(default.port),
            bind: std::env::var("LLM_PROXY_BIND").unwrap_or(default.bind),
            log_dir: std::env::var("LLM_PROXY_LOG_DIR")
                .map(PathBuf::from)
                .unwrap_or(default.log_dir),
            bedrock_region,
            bedrock_max_concurrent: env_parse("LLM_PROXY_BEDROCK_MAX_CONCURRENT")
                .unwrap_or(default.bedrock_max_concurrent),
            exporter: exporter_from_env(),
        }
    }
}

fn exporter_from_env() -> Option<ExporterConfig> {
    let enabled = std::env::var("LLM_PROXY_LOKI_ENABLED")
        .map(|v| v == "true" || v == "1")
        .unwrap_or(false);
    if !enabled {
        return None;
    }

    let default = ExporterConfig::default();
    Some(ExporterConfig {
        url: std::env::var("LLM_PROXY_LOKI_URL").unwrap_or_default(),
        auth_token: std::env::var("LLM_PROXY_LOKI_AUTH_TOKEN")
            .ok()
            .filter(|s| !s.is_empty()),
        batch_size: env_parse("LLM_PROXY_LOKI_BATCH_SIZE").unwrap_or(default.batch_size),
        batch_wait: env_parse("LLM_PROXY_LOKI_BATCH_WAIT_SECS")
            .map(Duration::from_secs)
            .unwrap_or(default.batch_wait),
        retry_max: env_parse("LLM_PROXY_LOKI_RETRY_MAX").unwrap_or(default.retry_max),
        retry_wait_base: default.retry_wait_base,
        retry_wait_cap: default.retry_wait_cap,
        use_gzip: env_parse("LLM_PROXY_LOKI_USE_GZIP").unwrap_or(default.use_gzip),
        environment: std::env::var("LLM_PROXY_LOKI_ENVIRONMENT").unwrap_or(default.environment),
        buffer_size: env_parse("LLM_PROXY_LOKI_BUFFER_SIZE").unwrap_or(default.buffer_size),
        shutdown_timeout: env_parse("LLM_PROXY_LOKI_SHUTDOWN_TIMEOUT_SECS")
            .map(Duration::from_secs)
            .unwrap_or(default.shutdown_timeout),
    })
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|v| v.parse().ok())
}
