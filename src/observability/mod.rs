//! Observability helpers.
//!
//! Structured logging itself is plain `tracing`, initialized in
//! `main.rs`; this module carries the wire hexdump formatter.

pub mod hexdump;
