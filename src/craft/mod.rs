//! The crafting engine: validated specs in, pathological bytes out.
//!
//! # Data Flow
//! ```text
//! gate-checked Spec
//!     → engine.rs (serialize, fire actions at byte offsets)
//!     → frames.rs (WebSocket handshake + frame assembly)
//!     → Stream (plaintext or TLS)
//!     → Outcome → dispatcher → log buffer
//! ```

pub mod engine;
pub mod frames;

pub use engine::{Engine, Outcome};
pub use frames::{accept_key, build_frame, read_frame, upgrade_response, Frame};
