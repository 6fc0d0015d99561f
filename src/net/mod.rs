//! Network layer subsystem.
//!
//! # Data Flow
//! ```text
//! Incoming TCP connection
//!     → listener.rs (accept loop, connection limits, identity allocation)
//!     → connection.rs (one-shot state machine)
//!     → recorder (isolated renderer run)
//!
//! Connection States:
//!     AwaitingFrame → FrameReady → Recording → Closed
//! ```
//!
//! # Design Decisions
//! - Only the acceptor touches the identity counter
//! - Handlers share nothing mutable with each other
//! - Each connection tracked for graceful shutdown

pub mod connection;
pub mod identity;
pub mod listener;

pub use connection::{ConnectionHandler, ConnectionState, ConnectionTracker, HandlerContext};
pub use identity::{ClientIdentity, IdentityAllocator};
pub use listener::{Acceptor, ListenerError};
