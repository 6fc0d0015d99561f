//! Server wiring: config → recorder → acceptor → shutdown.

use std::net::SocketAddr;
use std::sync::Arc;

use metrics_exporter_prometheus::BuildError;
use tokio::sync::broadcast;

use crate::config::ServerConfig;
use crate::lifecycle::{wait_for_signal, Shutdown};
use crate::net::{Acceptor, HandlerContext, ListenerError};
use crate::observability::metrics;
use crate::recorder::{ProcessRecorder, Recorder};
use crate::render::Translator;

/// Fatal startup failures.
#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error(transparent)]
    Listener(#[from] ListenerError),

    #[error("cannot create session directory {path}: {source}")]
    StoreDir {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid metrics address {0:?}")]
    MetricsAddress(String),

    #[error("cannot start metrics exporter: {0}")]
    Metrics(#[from] BuildError),
}

/// A bound render proxy, ready to accept.
pub struct RenderServer {
    acceptor: Acceptor,
    local_addr: SocketAddr,
}

impl RenderServer {
    /// Bind the listener with the given recorder behind every connection.
    pub async fn bind(config: &ServerConfig, recorder: Arc<dyn Recorder>) -> Result<Self, ServerError> {
        let context = Arc::new(HandlerContext {
            translator: Translator::new(
                config.renderer.default_user_agent.clone(),
                config.renderer.default_accept.clone(),
            ),
            recorder,
            max_frame_bytes: config.listener.max_frame_bytes,
            read_buffer_bytes: config.listener.read_buffer_bytes,
        });
        let acceptor = Acceptor::bind(&config.listener, context).await?;
        let local_addr = acceptor
            .local_addr()
            .map_err(|source| ListenerError::Bind {
                address: config.listener.bind_address(),
                source,
            })?;
        Ok(Self {
            acceptor,
            local_addr,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Serve until `shutdown` fires and in-flight connections drain.
    ///
    /// Returns the number of connections accepted.
    pub async fn run(self, shutdown: broadcast::Receiver<()>) -> u64 {
        self.acceptor.run(shutdown).await
    }
}

/// Production entry point: recorder with a file store, metrics, signals.
pub async fn serve(config: ServerConfig) -> Result<(), ServerError> {
    let store_dir = &config.recorder.store_dir;
    std::fs::create_dir_all(store_dir).map_err(|source| ServerError::StoreDir {
        path: store_dir.display().to_string(),
        source,
    })?;

    if config.observability.metrics_enabled {
        let addr: SocketAddr = config
            .observability
            .metrics_address
            .parse()
            .map_err(|_| ServerError::MetricsAddress(config.observability.metrics_address.clone()))?;
        metrics::init_metrics(addr)?;
    }

    let recorder = ProcessRecorder::with_file_store(&config);
    recorder.preflight();

    let server = RenderServer::bind(&config, Arc::new(recorder)).await?;
    tracing::info!(
        address = %server.local_addr(),
        store_dir = %store_dir.display(),
        "render-proxy started"
    );

    let shutdown = Shutdown::new();
    let stop = shutdown.subscribe();
    let trigger = shutdown.clone();
    let signals = tokio::spawn(async move {
        match wait_for_signal().await {
            Ok(name) => tracing::info!(signal = name, "Shutdown requested"),
            Err(e) => tracing::error!(error = %e, "Signal handling failed, shutting down"),
        }
        trigger.trigger();
    });

    let accepted = server.run(stop).await;
    signals.abort();
    tracing::info!(accepted, "Shutdown complete");
    Ok(())
}
