//! Error types for the proxy.

use bytes::Bytes;
use http_body_util::Full;
use hyper::{Response, StatusCode};
use thiserror::Error;

/// Errors produced while handling a proxied request.
///
/// Each variant maps to a single client-visible HTTP status via
/// [`ProxyError::to_response`]; everything else about a failure stays in the
/// logs.
#[derive(Error, Debug)]
pub enum ProxyError {
    /// Malformed proxy path, invalid model id, or unknown provider.
    #[error("bad request: {0}")]
    BadRequest(String),

    /// The Bedrock backend was addressed but is not configured.
    #[error("bedrock backend not configured")]
    BedrockUnavailable,

    /// Upstream unreachable or returned framing we cannot forward.
    #[error("upstream request failed: {0}")]
    Upstream(String),

    /// Failure reading the client request body.
    #[error("failed to read client body: {0}")]
    ClientBody(String),

    /// SigV4 signing failure.
    #[error("request signing failed: {0}")]
    Signing(String),

    /// Component construction failed at startup.
    #[error("initialization failed: {0}")]
    Init(String),

    /// I/O error during journaling or connection handling.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// HTTP protocol error.
    #[error("HTTP error: {0}")]
    Http(#[from] hyper::Error),

    /// Embedded session store failure.
    #[error(transparent)]
    Store(#[from] StoreError),
}

impl ProxyError {
    /// The client-visible status for this error.
    pub fn status(&self) -> StatusCode {
        match self {
            ProxyError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ProxyError::BedrockUnavailable => StatusCode::SERVICE_UNAVAILABLE,
            ProxyError::Upstream(_) => StatusCode::BAD_GATEWAY,
            ProxyError::ClientBody(_)
            | ProxyError::Signing(_)
            | ProxyError::Init(_)
            | ProxyError::Io(_)
            | ProxyError::Http(_)
            | ProxyError::Store(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Convert the error into a plain-text HTTP response.
    pub fn to_response(&self) -> Response<Full<Bytes>> {
        let status = self.status();
        let message = match self {
            ProxyError::BadRequest(msg) => format!("400 Bad Request\n\n{msg}"),
            ProxyError::BedrockUnavailable => {
                "503 Service Unavailable\n\nBedrock backend is not configured.".to_string()
            }
            ProxyError::Upstream(msg) => format!("502 Bad Gateway\n\n{msg}"),
            _ => "500 Internal Server Error\n\nAn internal error occurred.".to_string(),
        };

        Response::builder()
            .status(status)
            .header("Content-Type", "text/plain")
            .body(Full::new(Bytes::from(message)))
            .unwrap_or_else(|_| {
                Response::builder()
                    .status(StatusCode::INTERNAL_SERVER_ERROR)
                    .body(Full::new(Bytes::from("500 Internal Server Error")))
                    .unwrap()
            })
    }
}

/// Result type alias for proxy operations.
pub type ProxyResult<T> = Result<T, ProxyError>;

/// Errors from the embedded session store.
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(String),

    /// Insert conflicted with an existing row.
    #[error("session already exists: {0}")]
    Conflict(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("I/O error: {0}")]
    Io(String),
}

impl From<rusqlite::Error> for StoreError {
    fn from(e: rusqlite::Error) -> Self {
        if let rusqlite::Error::SqliteFailure(err, _) = &e {
            if err.code == rusqlite::ErrorCode::ConstraintViolation {
                return StoreError::Conflict(e.to_string());
            }
        }
        StoreError::Database(e.to_string())
    }
}

/// Errors from the remote log exporter.
#[derive(Error, Debug)]
pub enum ExporterError {
    #[error("exporter URL is required")]
    MissingUrl,

    #[error("failed to initialize export client: {0}")]
    Init(String),

    /// Drain-on-close exceeded the configured timeout.
    #[error("shutdown timed out after {0:?}")]
    ShutdownTimeout(std::time::Duration),
}
