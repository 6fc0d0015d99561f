//! TCP acceptor with backpressure.
//!
//! # Responsibilities
//! - Own the listening socket and the identity counter
//! - Enforce max_connections limit via semaphore
//! - Spawn one independent handler per accepted connection
//! - Stop accepting on shutdown and drain in-flight handlers

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpListener;
use tokio::sync::{broadcast, Semaphore};

use crate::config::ListenerConfig;
use crate::error::ConnectionError;
use crate::net::connection::{ConnectionHandler, ConnectionTracker, HandlerContext};
use crate::net::identity::IdentityAllocator;
use crate::observability::metrics;

/// Pause after a failed accept so persistent errors (EMFILE) do not spin.
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

/// Error type for listener operations.
#[derive(Debug, thiserror::Error)]
pub enum ListenerError {
    #[error("failed to bind {address}: {source}")]
    Bind {
        address: String,
        #[source]
        source: std::io::Error,
    },
}

/// Accepts clients and dispatches them to handlers.
pub struct Acceptor {
    inner: TcpListener,
    connection_limit: Arc<Semaphore>,
    identities: IdentityAllocator,
    tracker: ConnectionTracker,
    context: Arc<HandlerContext>,
    drain: Duration,
}

impl Acceptor {
    /// Bind to the configured address with connection limits.
    pub async fn bind(
        config: &ListenerConfig,
        context: Arc<HandlerContext>,
    ) -> Result<Self, ListenerError> {
        let address = config.bind_address();
        let listener = TcpListener::bind(&address)
            .await
            .map_err(|source| ListenerError::Bind {
                address: address.clone(),
                source,
            })?;
        let local_addr = listener
            .local_addr()
            .map_err(|source| ListenerError::Bind { address, source })?;

        tracing::info!(
            address = %local_addr,
            max_connections = config.max_connections,
            "Listener bound"
        );

        Ok(Self {
            inner: listener,
            connection_limit: Arc::new(Semaphore::new(config.max_connections)),
            identities: IdentityAllocator::new(),
            tracker: ConnectionTracker::new(),
            context,
            drain: Duration::from_secs(config.drain_secs),
        })
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.inner.local_addr()
    }

    /// Handle to the in-flight connection count.
    pub fn tracker(&self) -> ConnectionTracker {
        self.tracker.clone()
    }

    /// Accept until `shutdown` fires, then wait for handlers to finish.
    ///
    /// Returns the number of identities handed out.
    pub async fn run(mut self, mut shutdown: broadcast::Receiver<()>) -> u64 {
        loop {
            // Acquire a slot first (backpressure), then accept.
            let permit = tokio::select! {
                permit = Arc::clone(&self.connection_limit).acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
                _ = shutdown.recv() => break,
            };

            let (stream, peer) = tokio::select! {
                accepted = self.inner.accept() => match accepted {
                    Ok(pair) => pair,
                    Err(e) => {
                        tracing::warn!(error = %e, "Accept failed");
                        drop(permit);
                        if back_off(&mut shutdown, ACCEPT_BACKOFF).await {
                            continue;
                        }
                        break;
                    }
                },
                _ = shutdown.recv() => break,
            };

            let identity = self.identities.allocate();
            tracing::debug!(
                identity = %identity,
                peer_addr = %peer,
                available_permits = self.connection_limit.available_permits(),
                "Connection accepted"
            );

            let guard = self.tracker.track(identity);
            let handler = ConnectionHandler::new(identity, peer, stream, Arc::clone(&self.context));
            tokio::spawn(async move {
                let _permit = permit;
                let _guard = guard;
                match handler.run().await {
                    Ok(outcome) => tracing::debug!(
                        identity = %identity,
                        succeeded = outcome.succeeded(),
                        "Connection served"
                    ),
                    Err(e) => {
                        if let ConnectionError::Protocol(protocol) = &e {
                            metrics::record_protocol_error(protocol.label());
                        }
                        tracing::warn!(identity = %identity, peer_addr = %peer, kind = e.kind(), error = %e, "Connection aborted");
                    }
                }
            });
        }

        let accepted = self.identities.allocated();
        drop(self.inner);
        tracing::info!(
            active = self.tracker.active_count(),
            drain_secs = self.drain.as_secs(),
            "Stopped accepting, draining connections"
        );
        let remaining = self.tracker.drain(self.drain).await;
        if remaining > 0 {
            tracing::warn!(remaining, "Drain deadline passed with connections still open");
        }
        accepted
    }
}

/// Sleep for `delay` unless shutdown fires first. Returns false on shutdown.
async fn back_off(shutdown: &mut broadcast::Receiver<()>, delay: Duration) -> bool {
    tokio::select! {
        _ = tokio::time::sleep(delay) => true,
        _ = shutdown.recv() => false,
    }
}
