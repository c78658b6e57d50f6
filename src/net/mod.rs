//! Network layer subsystem.
//!
//! # Data Flow
//! ```text
//! Incoming TCP connection
//!     → listener.rs (accept loop, connection limits)
//!     → tls.rs (optional TLS handshake, SNI cert resolution)
//!     → stream.rs (plaintext/TLS stream, mid-connection upgrade)
//!     → Hand off to the dispatcher
//! ```
//!
//! # Design Decisions
//! - Bounded accept queue prevents resource exhaustion
//! - TLS may start at accept time or after a proxy CONNECT
//! - Abrupt disconnects bypass the TLS close-notify on purpose

pub mod connection;
pub mod listener;
pub mod stream;
pub mod tls;

pub use connection::ConnectionId;
pub use listener::{ConnectionPermit, Listener, ListenerError};
pub use stream::{BufStream, Stream};
pub use tls::{TlsContext, TlsError};
