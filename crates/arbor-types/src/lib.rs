//! Pure data types for arbor — file records, command requests, handshake records.
//!
//! This crate is a leaf dependency with no async runtime, no sockets, no I/O.
//! Everything here travels over the wire, so every type is serde-serializable
//! and carries only plain data.

pub mod file;
pub mod message;
pub mod request;

// Flat re-exports for convenience
pub use file::*;
pub use message::*;
pub use request::*;
