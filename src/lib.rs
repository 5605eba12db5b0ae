pub mod access;
pub mod admission;
pub mod api;
pub mod app_state;
pub mod config;
pub mod error;
pub mod media;
pub mod mime;
pub mod range;
pub mod registry;
pub mod relay;
pub mod remote;

use axum::Router;
use axum::body::Body;
use axum::extract::{ConnectInfo, Extension};
use axum::http::Request;
use axum::routing::{get, post};
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper_util::rt::{TokioIo, TokioTimer};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;
use app_state::OpenConnection;
use tower::Service as _;
use tower_http::cors::{Any, CorsLayer};
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::TraceLayer;
use tracing::{debug, info, warn};

//
// Re-export
//
pub use access::AccessPolicy;
pub use admission::{AdmissionController, AdmissionLimits, AdmissionPermit, Rejection};
pub use app_state::{AppState, ConnectionGauge};
pub use config::Config;
pub use error::RelayError;
pub use media::MediaDescriptor;
pub use mime::MimeResolver;
pub use registry::{FileEntry, RegistryStore, TokenRegistry};
pub use relay::{ConnectionCloser, Disposition, RelaySettings, StreamRelay, StreamRequest};
pub use remote::{ChunkStream, FetchRequest, OpendalSource, RemoteError, RemoteSource};

/// Per-connection settings applied by the accept loop.
#[derive(Debug, Clone, Copy)]
pub struct ConnectionOptions {
    pub header_read_timeout: Duration,
    pub keep_alive: bool,
}

impl From<&Config> for ConnectionOptions {
    fn from(config: &Config) -> Self {
        Self {
            header_read_timeout: config.header_read_timeout(),
            keep_alive: config.keep_alive,
        }
    }
}

fn cors() -> CorsLayer {
    CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any)
}

/// Routes served to media clients.
pub fn public_router(state: AppState, request_timeout: Duration) -> Router {
    Router::new()
        .route("/health", get(api::health))
        .route("/stream/{token}", get(api::stream_file))
        .route("/download/{token}", get(api::download_file))
        .fallback(api::not_found)
        .layer(TimeoutLayer::new(request_timeout))
        .layer(axum::middleware::from_fn(api::log_request_errors))
        .layer(TraceLayer::new_for_http())
        .layer(cors())
        .layer(Extension(state))
}

/// Routes for the registering front-end.
pub fn internal_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(api::health))
        .route("/files", post(api::register_file))
        .route("/stats", get(api::stats))
        .fallback(api::not_found)
        .layer(axum::middleware::from_fn(api::log_request_errors))
        .layer(TraceLayer::new_for_http())
        .layer(Extension(state))
}

/// Assemble the shared state around an already built remote source.
pub async fn build_state(config: &Config, source: Arc<dyn RemoteSource>) -> AppState {
    let registry = match &config.registry_path {
        Some(path) => {
            let store = RegistryStore::new(path, config.registry_debounce());
            TokenRegistry::with_store(config.max_registry_entries, store).await
        }
        None => {
            info!("No registry path configured, tokens are kept in memory only");
            TokenRegistry::new(config.max_registry_entries)
        }
    };

    AppState::new(
        registry,
        AdmissionController::new(config.admission_limits()),
        StreamRelay::new(source, config.relay_settings()),
        AccessPolicy::new(config.allowed_users.iter().cloned()),
        config.public_base_url.clone(),
    )
    .with_trust_forwarded_for(config.trust_forwarded_for)
}

/// Run until Ctrl-C or SIGTERM.
pub async fn run(config: Config) -> anyhow::Result<()> {
    let cancel = CancellationToken::new();
    tokio::spawn(shutdown_signal(cancel.clone()));
    run_until_cancelled(config, cancel).await
}

/// Run both listeners until `cancel` fires, then flush the registry.
pub async fn run_until_cancelled(config: Config, cancel: CancellationToken) -> anyhow::Result<()> {
    let backend = config.storage()?;
    let source = OpendalSource::new(&backend)?;
    let state = build_state(&config, Arc::new(source)).await;

    let public_app = public_router(state.clone(), config.request_timeout());
    let internal_app = internal_router(state.clone());

    let public_addr = format!("{}:{}", config.bind_address, config.listen_on_port);
    let public_listener = TcpListener::bind(&public_addr).await?;
    info!("Public API listening on {public_addr}");

    let internal_addr = format!("{}:{}", config.bind_address, config.internal_port);
    let internal_listener = TcpListener::bind(&internal_addr).await?;
    info!("Internal API listening on {internal_addr}");

    let options = ConnectionOptions::from(&config);
    tokio::join!(
        accept_loop(
            public_listener,
            public_app,
            options,
            Some(state.connections.clone()),
            cancel.clone(),
        ),
        accept_loop(internal_listener, internal_app, options, None, cancel.clone()),
    );

    state.registry.flush().await;
    info!("Shutdown complete");
    Ok(())
}

async fn accept_loop(
    listener: TcpListener,
    app: Router,
    options: ConnectionOptions,
    gauge: Option<ConnectionGauge>,
    cancel: CancellationToken,
) {
    loop {
        tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    let open = gauge.as_ref().map(ConnectionGauge::open);
                    tokio::spawn(handle_connection(
                        stream,
                        peer,
                        app.clone(),
                        options,
                        cancel.clone(),
                        open,
                    ));
                }
                Err(error) => {
                    debug!(?error, "Accept error");
                }
            },
            _ = cancel.cancelled() => break,
        }
    }
}

async fn handle_connection(
    stream: TcpStream,
    peer: SocketAddr,
    app: Router,
    options: ConnectionOptions,
    cancel: CancellationToken,
    _open: Option<OpenConnection>,
) {
    let io = TokioIo::new(stream);
    let closer = ConnectionCloser::new();
    let service = {
        let closer = closer.clone();
        hyper::service::service_fn(move |mut req: Request<Incoming>| {
            req.extensions_mut().insert(ConnectInfo(peer));
            req.extensions_mut().insert(closer.clone());
            app.clone().call(req.map(Body::new))
        })
    };

    let mut builder = http1::Builder::new();
    builder
        .timer(TokioTimer::new())
        .keep_alive(options.keep_alive)
        .header_read_timeout(options.header_read_timeout);
    let connection = builder.serve_connection(io, service);

    // Dropping the connection drops any open response body along with the
    // bytes hyper still has queued for it.
    tokio::select! {
        result = connection => {
            if let Err(error) = result {
                debug!(%peer, ?error, "Connection error");
            }
        }
        _ = closer.closed() => {
            debug!(%peer, "Closing connection of a stalled stream");
        }
        _ = cancel.cancelled() => {
            debug!(%peer, "Closing connection for shutdown");
        }
    }
}

/// Wait for a shutdown signal (SIGINT or SIGTERM), then fire `cancel`.
async fn shutdown_signal(cancel: CancellationToken) {
    let ctrl_c = async {
        if let Err(error) = tokio::signal::ctrl_c().await {
            warn!(?error, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(error) => {
                warn!(?error, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
        _ = cancel.cancelled() => {}
    }

    info!("Shutdown signal received");
    cancel.cancel();
}
