//! HTTP layer: request parsing and per-connection dispatch.
//!
//! # Data Flow
//! ```text
//! accepted stream
//!     → request.rs (request line + header parsing, validation)
//!     → dispatcher.rs (CONNECT / upgrade / HTTP routing, spec
//!       resolution, gate + engine invocation, logging)
//! ```

pub mod dispatcher;
pub mod request;

pub use dispatcher::{Dispatcher, CRAFT_PREFIX};
pub use request::{percent_decode, HeadError, ProtocolError, RequestHead};
