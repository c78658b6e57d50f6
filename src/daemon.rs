//! The daemon: accept loop plus shared state.
//!
//! # Responsibilities
//! - Own the immutable config, the TLS context and the log buffer
//! - Spawn one dispatcher task per accepted connection
//! - Expose the log query surface for embedding callers
//!
//! # Design Decisions
//! - Connection tasks share only `Arc<DaemonConfig>` and the log
//!   buffer handle; specs and outcomes stay task-local

use std::sync::Arc;

use serde_json::{Map, Value};
use tokio::sync::broadcast;

use crate::config::DaemonConfig;
use crate::http::Dispatcher;
use crate::logbuf::{LogBuffer, LogEntry, LogKind};
use crate::net::{Listener, ListenerError, TlsContext, TlsError};

pub struct Daemon {
    config: Arc<DaemonConfig>,
    logbuf: LogBuffer,
    tls: Option<TlsContext>,
}

impl Daemon {
    /// Build a daemon from a validated config, loading TLS certificates
    /// up front so bad PEM files fail at startup.
    pub fn new(config: DaemonConfig) -> Result<Self, TlsError> {
        let tls = config
            .listener
            .tls
            .as_ref()
            .map(TlsContext::from_settings)
            .transpose()?;
        Ok(Self {
            config: Arc::new(config),
            logbuf: LogBuffer::new(),
            tls,
        })
    }

    pub fn config(&self) -> &DaemonConfig {
        &self.config
    }

    /// A shareable handle to the event log.
    pub fn log(&self) -> LogBuffer {
        self.logbuf.clone()
    }

    // Log query surface, mirrored from the buffer for embedding callers.

    pub fn get_log(&self) -> Vec<LogEntry> {
        self.logbuf.get_log()
    }

    pub fn log_by_id(&self, id: u64) -> Option<LogEntry> {
        self.logbuf.log_by_id(id)
    }

    pub fn last_log(&self) -> Option<LogEntry> {
        self.logbuf.last_log()
    }

    pub fn clear_log(&self) {
        self.logbuf.clear()
    }

    /// Inject a custom entry, e.g. a marker from a test harness.
    pub fn add_log(&self, fields: Map<String, Value>) -> u64 {
        self.logbuf.add(LogKind::Request, fields)
    }

    /// Accept connections until the shutdown signal fires.
    pub async fn run(
        &self,
        listener: Listener,
        mut shutdown: broadcast::Receiver<()>,
    ) -> Result<(), ListenerError> {
        loop {
            tokio::select! {
                _ = shutdown.recv() => {
                    tracing::info!("Shutdown signal received");
                    return Ok(());
                }
                accepted = listener.accept() => {
                    let (stream, peer, permit) = accepted?;
                    let dispatcher = Dispatcher::new(
                        Arc::clone(&self.config),
                        self.logbuf.clone(),
                        self.tls.clone(),
                    );
                    tokio::spawn(async move {
                        let _permit = permit;
                        dispatcher.handle(stream, peer).await;
                    });
                }
            }
        }
    }
}
