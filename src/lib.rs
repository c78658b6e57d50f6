//! wirecraft: a pathological protocol-testing daemon.
//!
//! Accepts TCP/TLS connections speaking HTTP/1.x or WebSocket and,
//! instead of serving normal responses, executes a small crafting
//! specification supplied by the request path (or a server-side anchor
//! mapping) to produce deliberately malformed, oversized, delayed,
//! truncated or disconnect-triggering wire traffic.
//!
//! # Architecture Overview
//!
//! ```text
//!                    ┌──────────────────────────────────────────────┐
//!                    │                 WIRECRAFT                     │
//!                    │                                               │
//!   TCP/TLS client   │  ┌─────────┐   ┌────────────┐   ┌─────────┐  │
//!   ─────────────────┼─▶│   net   │──▶│ dispatcher │──▶│  spec   │  │
//!                    │  │listener │   │ (http/ws/  │   │ parser  │  │
//!                    │  └─────────┘   │  connect)  │   └────┬────┘  │
//!                    │                └─────┬──────┘        │       │
//!                    │                      │          ┌────▼────┐  │
//!                    │                      │          │ safety  │  │
//!                    │                      │          │  gate   │  │
//!                    │                      │          └────┬────┘  │
//!   crafted bytes    │  ┌─────────┐   ┌─────▼──────┐   ┌────▼────┐  │
//!   ◀────────────────┼──│ stream  │◀──│  crafting  │◀──│ checked │  │
//!                    │  │(tcp/tls)│   │   engine   │   │  spec   │  │
//!                    │  └─────────┘   └─────┬──────┘   └─────────┘  │
//!                    │                      │                       │
//!                    │                ┌─────▼──────┐                │
//!                    │                │ log buffer │                │
//!                    │                │ (FIFO ring)│                │
//!                    │                └────────────┘                │
//!                    └──────────────────────────────────────────────┘
//! ```

// Core subsystems
pub mod config;
pub mod craft;
pub mod http;
pub mod net;
pub mod spec;

// Shared state
pub mod daemon;
pub mod logbuf;

// Cross-cutting concerns
pub mod lifecycle;
pub mod observability;

pub use config::DaemonConfig;
pub use daemon::Daemon;
pub use lifecycle::Shutdown;
pub use logbuf::{LogBuffer, LogEntry, LogKind, LOGBUF};
