//! Connection handler state machine and lifecycle tracking.
//!
//! # Responsibilities
//! - Drive one client through `AwaitingFrame → FrameReady → Recording → Closed`
//! - Serve exactly one BulkRequest per connection
//! - Track in-flight handlers for graceful shutdown

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::watch;

use crate::error::{ConnectionError, ProtocolError};
use crate::net::identity::ClientIdentity;
use crate::observability::metrics;
use crate::protocol::{BulkRequest, LengthValueParser};
use crate::recorder::{Recorder, RecordingOutcome};
use crate::render::Translator;

/// Where a connection is in its single request cycle.
#[derive(Debug)]
pub enum ConnectionState {
    /// Reading until the decoder releases a frame.
    AwaitingFrame,
    /// A BulkRequest was decoded and awaits translation.
    FrameReady(BulkRequest),
    /// Driver script built; the recorder runs once the socket is writable.
    Recording(String),
    /// Done. No further reads are issued.
    Closed,
}

impl ConnectionState {
    pub fn name(&self) -> &'static str {
        match self {
            ConnectionState::AwaitingFrame => "awaiting_frame",
            ConnectionState::FrameReady(_) => "frame_ready",
            ConnectionState::Recording(_) => "recording",
            ConnectionState::Closed => "closed",
        }
    }
}

/// Shared, read-only collaborators of every handler.
pub struct HandlerContext {
    pub translator: Translator,
    pub recorder: Arc<dyn Recorder>,
    pub max_frame_bytes: usize,
    pub read_buffer_bytes: usize,
}

/// Owns one client socket for the duration of its request.
pub struct ConnectionHandler {
    identity: ClientIdentity,
    peer: SocketAddr,
    stream: TcpStream,
    parser: LengthValueParser,
    context: Arc<HandlerContext>,
}

impl ConnectionHandler {
    pub fn new(
        identity: ClientIdentity,
        peer: SocketAddr,
        stream: TcpStream,
        context: Arc<HandlerContext>,
    ) -> Self {
        Self {
            identity,
            peer,
            parser: LengthValueParser::with_max_frame_bytes(context.max_frame_bytes),
            stream,
            context,
        }
    }

    /// Run the state machine to completion.
    ///
    /// The socket is closed when this returns, on every path.
    pub async fn run(mut self) -> Result<RecordingOutcome, ConnectionError> {
        let mut state = ConnectionState::AwaitingFrame;
        let mut outcome = None;

        loop {
            tracing::trace!(identity = %self.identity, state = state.name(), "Connection state");
            state = match state {
                ConnectionState::AwaitingFrame => {
                    let payload = self.read_frame().await?;
                    ConnectionState::FrameReady(BulkRequest::from_frame(&payload)?)
                }
                ConnectionState::FrameReady(request) => {
                    ConnectionState::Recording(self.context.translator.translate_bulk(&request)?)
                }
                ConnectionState::Recording(script) => {
                    self.stream.writable().await?;
                    tracing::info!(
                        identity = %self.identity,
                        peer_addr = %self.peer,
                        "Recording started"
                    );
                    let recorded = self.context.recorder.record(self.identity, script).await?;
                    // Empty acknowledgment, then close.
                    self.stream.write_all(&[]).await?;
                    self.stream.shutdown().await?;
                    outcome = Some(recorded);
                    ConnectionState::Closed
                }
                ConnectionState::Closed => break,
            };
        }

        outcome.ok_or_else(|| {
            ConnectionError::Io(std::io::Error::other("connection closed without a recording"))
        })
    }

    async fn read_frame(&mut self) -> Result<bytes::Bytes, ConnectionError> {
        let mut buf = vec![0u8; self.context.read_buffer_bytes.max(1)];
        loop {
            let n = self.stream.read(&mut buf).await?;
            if n == 0 {
                return Err(ProtocolError::Truncated {
                    buffered: self.parser.buffered(),
                }
                .into());
            }
            if let Some(frame) = self.parser.parse(&buf[..n])? {
                tracing::debug!(identity = %self.identity, bytes = frame.len(), "Frame received");
                return Ok(frame);
            }
        }
    }
}

/// Tracks active connections for graceful shutdown.
#[derive(Debug, Clone)]
pub struct ConnectionTracker {
    active: Arc<watch::Sender<u64>>,
}

impl ConnectionTracker {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(0);
        Self {
            active: Arc::new(tx),
        }
    }

    /// Record a new active connection. Returns a guard that decrements on drop.
    pub fn track(&self, identity: ClientIdentity) -> ConnectionGuard {
        self.active.send_modify(|n| *n += 1);
        metrics::record_connection_opened();
        ConnectionGuard {
            active: Arc::clone(&self.active),
            identity,
        }
    }

    pub fn active_count(&self) -> u64 {
        *self.active.borrow()
    }

    /// Wait until every tracked connection has closed, or `limit` passes.
    ///
    /// Returns the number still open.
    pub async fn drain(&self, limit: Duration) -> u64 {
        let mut rx = self.active.subscribe();
        let _ = tokio::time::timeout(limit, rx.wait_for(|n| *n == 0)).await;
        self.active_count()
    }
}

impl Default for ConnectionTracker {
    fn default() -> Self {
        Self::new()
    }
}

/// Held by a handler for its whole lifetime.
#[derive(Debug)]
pub struct ConnectionGuard {
    active: Arc<watch::Sender<u64>>,
    identity: ClientIdentity,
}

impl ConnectionGuard {
    pub fn identity(&self) -> ClientIdentity {
        self.identity
    }
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        self.active.send_modify(|n| *n = n.saturating_sub(1));
        metrics::record_connection_closed();
        tracing::debug!(identity = %self.identity, "Connection closed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn connection_tracker_counts() {
        let tracker = ConnectionTracker::new();
        assert_eq!(tracker.active_count(), 0);

        let guard1 = tracker.track(ClientIdentity::new(0));
        assert_eq!(tracker.active_count(), 1);

        let guard2 = tracker.track(ClientIdentity::new(1));
        assert_eq!(tracker.active_count(), 2);
        assert_eq!(guard2.identity(), ClientIdentity::new(1));

        drop(guard1);
        assert_eq!(tracker.active_count(), 1);

        drop(guard2);
        assert_eq!(tracker.active_count(), 0);
    }

    #[tokio::test]
    async fn drain_waits_for_guards() {
        let tracker = ConnectionTracker::new();
        let guard = tracker.track(ClientIdentity::new(0));
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            drop(guard);
        });
        assert_eq!(tracker.drain(Duration::from_secs(5)).await, 0);
    }

    #[tokio::test]
    async fn drain_gives_up_at_the_deadline() {
        let tracker = ConnectionTracker::new();
        let _guard = tracker.track(ClientIdentity::new(0));
        assert_eq!(tracker.drain(Duration::from_millis(20)).await, 1);
    }

    #[test]
    fn state_names() {
        assert_eq!(ConnectionState::AwaitingFrame.name(), "awaiting_frame");
        assert_eq!(ConnectionState::Recording(String::new()).name(), "recording");
        assert_eq!(ConnectionState::Closed.name(), "closed");
    }
}
