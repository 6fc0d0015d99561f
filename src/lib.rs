//! Record-capable rendering proxy.
//!
//! Clients send one length-prefixed BulkRequest per connection. The proxy
//! turns it into a headless-browser driver script, runs the renderer in a
//! network namespace of its own, records all of the renderer's TCP traffic,
//! then acknowledges with an empty write and closes.
//!
//! ```text
//!   client ──frame──▶ net::listener ──▶ net::connection
//!                                         │ protocol::framing + message
//!                                         │ render::translate
//!                                         ▼
//!                                       recorder::process
//!                                         ├─ recorder::namespace (netns, veth, DNAT)
//!                                         ├─ recorder::intercept (SO_ORIGINAL_DST relay)
//!                                         └─ recorder::session  (append-only store)
//! ```

pub mod config;
pub mod error;
pub mod lifecycle;
pub mod net;
pub mod observability;
pub mod protocol;
pub mod recorder;
pub mod render;
pub mod server;

pub use config::ServerConfig;
pub use lifecycle::Shutdown;
pub use server::{serve, RenderServer, ServerError};
