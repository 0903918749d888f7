//! llm-proxy entrypoint: config, listener, graceful shutdown.

use mimalloc::MiMalloc;

#[global_allocator]
static GLOBAL: MiMalloc = MiMalloc;

use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;
use http_body_util::BodyExt;
use hyper::body::Incoming;
use hyper::Request;
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast;
use tokio_util::task::TaskTracker;
use tower::Service;
use tracing::{error, info, warn};

use llm_proxy::bedrock::BedrockBackend;
use llm_proxy::config::Config;
use llm_proxy::portfile;
use llm_proxy::server::{ProxyService, ProxyState};

#[derive(Parser, Debug)]
#[command(
    name = "llm-proxy",
    version,
    about = "Transparent logging reverse proxy for LLM API traffic"
)]
struct Cli {
    /// Port to listen on (0 picks a free port)
    #[arg(short, long)]
    port: Option<u16>,

    /// Bind address
    #[arg(short, long)]
    bind: Option<String>,

    /// Directory for journals and the session database
    #[arg(long)]
    log_dir: Option<PathBuf>,

    /// Skip writing the portfile
    #[arg(long)]
    no_portfile: bool,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let mut config = Config::from_env();
    if let Some(port) = cli.port {
        config.port = port;
    }
    if let Some(bind) = cli.bind {
        config.bind = bind;
    }
    if let Some(log_dir) = cli.log_dir {
        config.log_dir = log_dir;
    }

    let bedrock = match &config.bedrock_region {
        Some(region) => load_bedrock_backend(region.clone(), config.bedrock_max_concurrent).await,
        None => None,
    };
    let bedrock_enabled = bedrock.is_some();

    let state = ProxyState::build(&config, bedrock)?;
    let service = ProxyService::new(state.clone());

    let addr = format!("{}:{}", config.bind, config.port);
    let listener = TcpListener::bind(&addr).await?;
    let local_port = listener.local_addr()?.port();

    if !cli.no_portfile {
        let path = portfile::default_portfile_path();
        if let Err(e) = portfile::write_portfile(&path, local_port) {
            warn!(path = %path.display(), error = %e, "failed to write portfile");
        }
    }

    info!(
        bind = %config.bind,
        port = local_port,
        log_dir = %config.log_dir.display(),
        bedrock = bedrock_enabled,
        "llm-proxy starting"
    );

    let (shutdown_tx, _) = broadcast::channel::<()>(1);
    setup_signal_handlers(shutdown_tx.clone());

    let tracker = TaskTracker::new();
    let mut shutdown_rx = shutdown_tx.subscribe();

    loop {
        tokio::select! {
            result = listener.accept() => {
                match result {
                    Ok((stream, peer_addr)) => {
                        let service = service.clone();
                        let mut conn_shutdown = shutdown_tx.subscribe();
                        tracker.spawn(async move {
                            if let Err(e) = handle_connection(stream, service, &mut conn_shutdown).await {
                                error!(peer = %peer_addr, error = %e, "connection error");
                            }
                        });
                    }
                    Err(e) => {
                        error!(error = %e, "failed to accept connection");
                    }
                }
            }
            _ = shutdown_rx.recv() => {
                info!("shutdown signal received, stopping new connections");
                break;
            }
        }
    }

    // Let in-flight requests finish, then drain the exporter and flush the
    // journal. The exporter applies its own shutdown timeout inside close().
    tracker.close();
    if tokio::time::timeout(Duration::from_secs(30), tracker.wait())
        .await
        .is_err()
    {
        warn!("timed out waiting for in-flight requests");
    }
    state.writer.close().await;
    info!("shutdown complete");
    Ok(())
}

async fn load_bedrock_backend(region: String, max_concurrent: usize) -> Option<BedrockBackend> {
    let aws_config = aws_config::load_defaults(aws_config::BehaviorVersion::latest()).await;
    let Some(credentials) = aws_config.credentials_provider() else {
        warn!("bedrock region configured but no AWS credentials resolved");
        return None;
    };
    let mut backend = BedrockBackend::new(region.clone(), credentials, max_concurrent);
    if let Ok(endpoint) = std::env::var("LLM_PROXY_BEDROCK_ENDPOINT") {
        if !endpoint.is_empty() {
            backend = backend.with_endpoint(endpoint);
        }
    }
    info!(region = %region, max_concurrent, "bedrock backend enabled");
    Some(backend)
}

fn setup_signal_handlers(shutdown_tx: broadcast::Sender<()>) {
    let shutdown_sigint = shutdown_tx.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                info!("received SIGINT, initiating graceful shutdown");
                let _ = shutdown_sigint.send(());
            }
            Err(e) => {
                error!(error = %e, "failed to listen for SIGINT");
            }
        }
    });

    #[cfg(unix)]
    {
        tokio::spawn(async move {
            match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
                Ok(mut sigterm) => {
                    sigterm.recv().await;
                    info!("received SIGTERM, initiating graceful shutdown");
                    let _ = shutdown_tx.send(());
                }
                Err(e) => {
                    error!(error = %e, "failed to listen for SIGTERM");
                }
            }
        });
    }
}

async fn handle_connection(
    stream: TcpStream,
    service: ProxyService,
    shutdown_rx: &mut broadcast::Receiver<()>,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    stream.set_nodelay(true)?;
    let io = TokioIo::new(stream);

    let svc_fn = hyper::service::service_fn(move |req: Request<Incoming>| {
        let mut svc = service.clone();
        async move {
            let result: Result<_, std::convert::Infallible> = match svc.call(req).await {
                Ok(response) => Ok(response),
                Err(e) => {
                    warn!(error = %e, "request failed");
                    Ok(e.to_response().map(BodyExt::boxed))
                }
            };
            result
        }
    });

    let builder = auto::Builder::new(TokioExecutor::new());
    let conn = builder.serve_connection_with_upgrades(io, svc_fn);
    tokio::pin!(conn);

    tokio::select! {
        result = &mut conn => {
            result?;
        }
        _ = shutdown_rx.recv() => {
            conn.as_mut().graceful_shutdown();
            let _ = tokio::time::timeout(Duration::from_secs(5), conn).await;
        }
    }

    Ok(())
}
