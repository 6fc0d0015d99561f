//! Error taxonomy for the render proxy.
//!
//! # Propagation
//! ```text
//! ProtocolError  → offending connection closed, server continues
//! ResourceError  → connection aborted, identity never reused
//! child exit     → recorded in the session seal, not an error
//! startup errors → fatal, one line on stderr, EXIT_FAILURE
//! ```

use std::io;

use crate::net::identity::ClientIdentity;

/// Malformed input on the wire.
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    /// The length prefix announces more bytes than we are willing to buffer.
    #[error("frame length {length} exceeds limit of {limit} bytes")]
    FrameTooLarge { length: usize, limit: usize },

    /// The peer closed before a complete frame arrived.
    #[error("connection closed with {buffered} bytes of an incomplete frame")]
    Truncated { buffered: usize },

    /// The frame payload is not a valid BulkRequest.
    #[error("undecodable bulk request: {0}")]
    Decode(#[from] prost::DecodeError),

    /// The scheme field holds a value outside the enum.
    #[error("unknown scheme value {0}")]
    UnknownScheme(i32),

    /// The embedded HTTP request could not be parsed.
    #[error("malformed HTTP request: {0}")]
    MalformedRequest(String),
}

impl ProtocolError {
    /// Metric label for the error variant.
    pub fn label(&self) -> &'static str {
        match self {
            ProtocolError::FrameTooLarge { .. } => "frame_too_large",
            ProtocolError::Truncated { .. } => "truncated",
            ProtocolError::Decode(_) => "decode",
            ProtocolError::UnknownScheme(_) => "unknown_scheme",
            ProtocolError::MalformedRequest(_) => "malformed_request",
        }
    }
}

/// Failure to acquire or drive an isolation resource.
#[derive(Debug, thiserror::Error)]
pub enum ResourceError {
    /// An interface name would exceed the kernel limit.
    #[error("interface name {name:?} is longer than {limit} bytes")]
    InterfaceName { name: String, limit: usize },

    /// Every link of the address pool is held by a live namespace.
    #[error("address pool exhausted ({links} links in use)")]
    AddressPoolExhausted { links: u64 },

    /// A namespace plumbing command exited unsuccessfully.
    #[error("`{command}` failed: {stderr}")]
    Command { command: String, stderr: String },

    /// The session store refused to open a new session.
    #[error("cannot open session for {identity}: {source}")]
    SessionStore {
        identity: ClientIdentity,
        #[source]
        source: io::Error,
    },

    /// The renderer process could not be started.
    #[error("cannot spawn renderer: {0}")]
    Spawn(#[source] io::Error),

    /// Other OS-level failures (binding the interception listener, pipes).
    #[error(transparent)]
    Io(#[from] io::Error),
}

/// Everything that can end a single client connection early.
#[derive(Debug, thiserror::Error)]
pub enum ConnectionError {
    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    #[error(transparent)]
    Resource(#[from] ResourceError),

    #[error("socket error: {0}")]
    Io(#[from] io::Error),
}

impl ConnectionError {
    /// Short label used for logs and metrics.
    pub fn kind(&self) -> &'static str {
        match self {
            ConnectionError::Protocol(_) => "protocol",
            ConnectionError::Resource(_) => "resource",
            ConnectionError::Io(_) => "io",
        }
    }
}
