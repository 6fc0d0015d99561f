//! Lifecycle management subsystem.
//!
//! # Data Flow
//! ```text
//! Startup (main.rs / server.rs):
//!     Parse args → Load config → Init logging → Clear env → Bind → Accept
//!
//! Shutdown (shutdown.rs):
//!     Signal received → Stop accepting → Drain connections → Exit
//!
//! Environment (environment.rs):
//!     Clear inherited variables before any thread or child exists
//!
//! Signals (signals.rs):
//!     SIGTERM/SIGINT → Trigger graceful shutdown
//! ```
//!
//! # Design Decisions
//! - Ordered shutdown: stop accept, drain, close
//! - Draining is bounded; remaining recordings are abandoned at the deadline

pub mod environment;
pub mod shutdown;
pub mod signals;

pub use environment::clear_environment;
pub use shutdown::Shutdown;
pub use signals::wait_for_signal;
