//! Driver script generation.
//!
//! # Data Flow
//! ```text
//! BulkRequest
//!     → translate.rs (url, user agent, custom headers, POST body)
//!     → script.rs templates (setup, load, load-with-POST)
//!     → script text piped to the renderer's stdin
//! ```
//!
//! # Design Decisions
//! - Translation is pure and deterministic: same request, same bytes
//! - Missing Host is not an error; the renderer reports the failed load
//! - Header values are embedded unescaped (see translate.rs)

pub mod script;
pub mod translate;

pub use translate::Translator;
