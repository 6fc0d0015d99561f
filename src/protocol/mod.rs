//! Wire protocol subsystem.
//!
//! # Data Flow
//! ```text
//! socket bytes
//!     → framing.rs (length-value parser, one payload per complete frame)
//!     → message.rs (protobuf BulkRequest { scheme, request })
//!     → HttpRequest (start line, headers, body, parsed on demand)
//! ```
//!
//! # Design Decisions
//! - The parser owns the partial-frame buffer; callers only feed bytes
//! - Frames larger than the configured limit are protocol errors, not retried
//! - The raw HTTP request is kept verbatim until the translator asks for it

pub mod framing;
pub mod message;

pub use framing::{encode_frame, LengthValueParser};
pub use message::{BulkRequest, HttpRequest, Scheme};
