//! Lifecycle management subsystem.
//!
//! Startup lives in `main.rs` (config → validate → bind → run); this
//! module carries the shutdown coordinator shared between the accept
//! loop and the signal handler.

pub mod shutdown;

pub use shutdown::Shutdown;
