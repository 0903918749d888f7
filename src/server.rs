//! Service dispatch.
//!
//! [`ProxyService`] is the single entry point for every request the listener
//! accepts: `/health` is answered inline, `/model/...` goes to the Bedrock
//! backend, and everything else is parsed as `/{provider}/{upstream}/{path}`
//! and forwarded.

use std::sync::Arc;

use bytes::Bytes;
use hyper::body::{Body, Incoming};
use hyper::{Request, Response, StatusCode};
use tower::Service;
use tracing::info;

use crate::bedrock::{self, BedrockBackend};
use crate::config::Config;
use crate::error::{ProxyError, ProxyResult};
use crate::events::{EventEngine, JournalSink};
use crate::exporter::Exporter;
use crate::fanout::FanOutWriter;
use crate::forwarder::{self, full_body, HttpsClient, ProxyBody};
use crate::journal::Journal;
use crate::routes::{parse_route, Route};
use crate::session::SessionManager;

/// Everything a request handler needs, shared across connections.
pub struct ProxyState {
    pub machine: String,
    pub sessions: Arc<SessionManager>,
    pub writer: Arc<FanOutWriter>,
    pub engine: EventEngine,
    pub sink: JournalSink,
    pub client: HttpsClient,
    pub bedrock: Option<BedrockBackend>,
}

impl ProxyState {
    /// Assemble the component graph from configuration.
    pub fn build(config: &Config, bedrock: Option<BedrockBackend>) -> ProxyResult<Arc<Self>> {
        let journal = Journal::new(&config.log_dir)?;
        let exporter = match &config.exporter {
            Some(exporter_config) => {
                let exporter = Exporter::new(exporter_config.clone())
                    .map_err(|e| ProxyError::Init(e.to_string()))?;
                info!(url = %exporter_config.url, "remote log export enabled");
                Some(exporter)
            }
            None => None,
        };
        let writer = Arc::new(FanOutWriter::new(journal, exporter));
        let sessions = Arc::new(SessionManager::open(&config.log_dir)?);

        Ok(Arc::new(ProxyState {
            machine: machine_label(),
            engine: EventEngine::new(sessions.clone()),
            sink: JournalSink::new(writer.clone()),
            sessions,
            writer,
            client: forwarder::build_client()?,
            bedrock,
        }))
    }
}

/// `user@hostname`, used as the `_meta.machine` field and export label.
pub fn machine_label() -> String {
    let user = std::env::var("USER").unwrap_or_else(|_| "unknown".to_string());
    let host = std::env::var("HOSTNAME").unwrap_or_else(|_| "unknown".to_string());
    format!("{user}@{host}")
}

/// The proxy service handed to each connection.
pub struct ProxyService {
    state: Arc<ProxyState>,
}

impl Clone for ProxyService {
    fn clone(&self) -> Self {
        ProxyService {
            state: self.state.clone(),
        }
    }
}

impl ProxyService {
    pub fn new(state: Arc<ProxyState>) -> Self {
        ProxyService { state }
    }

    pub fn state(&self) -> &Arc<ProxyState> {
        &self.state
    }

    /// Route and handle one request.
    pub async fn handle<B>(&self, req: Request<B>) -> ProxyResult<Response<ProxyBody>>
    where
        B: Body + Send,
        B::Data: Send,
        B::Error: std::fmt::Display,
    {
        match parse_route(req.uri().path())? {
            Route::Health => Ok(Response::builder()
                .status(StatusCode::OK)
                .body(full_body(Bytes::from_static(b"ok")))
                .map_err(|e| ProxyError::Upstream(e.to_string()))?),
            Route::Proxy {
                provider,
                upstream,
                path,
            } => forwarder::forward(self.state.clone(), provider, upstream, path, req).await,
            Route::Bedrock {
                model_id,
                streaming,
            } => bedrock::serve(self.state.clone(), model_id, streaming, req).await,
        }
    }
}

impl Service<Request<Incoming>> for ProxyService {
    type Response = Response<ProxyBody>;
    type Error = ProxyError;
    type Future = std::pin::Pin<
        Box<dyn std::future::Future<Output = Result<Self::Response, Self::Error>> + Send>,
    >;

    fn poll_ready(
        &mut self,
        _cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<Result<(), Self::Error>> {
        std::task::Poll::Ready(Ok(()))
    }

    fn call(&mut self, req: Request<Incoming>) -> Self::Future {
        let service = self.clone();
        Box::pin(async move { service.handle(req).await })
    }
}
