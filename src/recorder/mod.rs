//! Isolated process recording subsystem.
//!
//! # Data Flow
//! ```text
//! (identity, script)
//!     → namespace.rs (namespace + veth pair + /30 link, released on exit)
//!     → session.rs (session opened in the store, writer task started)
//!     → intercept.rs (recording proxy on the egress address, DNAT to it)
//!     → process.rs (renderer spawned inside the namespace, script on stdin)
//!     → renderer exits → proxy drained → session sealed → namespace released
//! ```
//!
//! # Design Decisions
//! - `Recorder` is the seam the connection handler depends on
//! - A non-zero renderer exit is part of the recording, not an error
//! - Namespace resources are released on every path, including failures

use async_trait::async_trait;

use crate::error::ResourceError;
use crate::net::identity::ClientIdentity;

pub mod intercept;
pub mod namespace;
pub mod process;
pub mod session;

pub use process::ProcessRecorder;
pub use session::{
    FileSessionStore, MemorySessionStore, RecordedSession, SessionSeal, SessionStore,
    SessionSummary,
};

/// Result of one completed recording.
#[derive(Debug, Clone)]
pub struct RecordingOutcome {
    pub identity: ClientIdentity,
    pub seal: SessionSeal,
    pub summary: SessionSummary,
}

impl RecordingOutcome {
    /// Whether the renderer exited cleanly.
    pub fn succeeded(&self) -> bool {
        self.seal.succeeded()
    }
}

/// Runs a driver script in isolation and records its traffic.
#[async_trait]
pub trait Recorder: Send + Sync + 'static {
    /// Blocks until the renderer has exited and the session is sealed.
    async fn record(
        &self,
        identity: ClientIdentity,
        script: String,
    ) -> Result<RecordingOutcome, ResourceError>;
}
