//! Bounded, ID-indexed log of request/response events.
//!
//! # Responsibilities
//! - Record structured events (requests, responses, errors, timeouts)
//! - Evict oldest entries once the buffer is full (FIFO ring)
//! - Serve best-effort lookups by entry ID
//!
//! # Design Decisions
//! - Fixed capacity; the buffer never grows past `LOGBUF`
//! - Handle is `Clone` and shared by every connection task
//! - Mutations and reads go through one mutex so readers always observe
//!   a consistent snapshot

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::SystemTime;

use serde::Serialize;
use serde_json::{Map, Value};

/// Default ring capacity.
pub const LOGBUF: usize = 500;

/// What kind of event an entry records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LogKind {
    Request,
    Response,
    Error,
    Timeout,
}

/// A single recorded event. Never mutated after insertion.
#[derive(Debug, Clone, Serialize)]
pub struct LogEntry {
    pub id: u64,
    #[serde(rename = "type")]
    pub kind: LogKind,
    pub timestamp: SystemTime,
    #[serde(flatten)]
    pub fields: Map<String, Value>,
}

impl LogEntry {
    /// Fetch a top-level field.
    pub fn field(&self, key: &str) -> Option<&Value> {
        self.fields.get(key)
    }

    /// The `msg` field, if the entry carries one.
    pub fn msg(&self) -> Option<&str> {
        self.fields.get("msg").and_then(Value::as_str)
    }
}

struct Inner {
    entries: VecDeque<LogEntry>,
    next_id: u64,
}

/// Shared handle to the daemon's event log.
#[derive(Clone)]
pub struct LogBuffer {
    inner: Arc<Mutex<Inner>>,
    capacity: usize,
}

impl LogBuffer {
    /// Create a buffer with the default [`LOGBUF`] capacity.
    pub fn new() -> Self {
        Self::with_capacity(LOGBUF)
    }

    /// Create a buffer holding at most `capacity` entries.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner {
                entries: VecDeque::with_capacity(capacity),
                next_id: 0,
            })),
            capacity,
        }
    }

    /// Append an entry, evicting the oldest one if the ring is full.
    /// Returns the assigned ID.
    pub fn add(&self, kind: LogKind, fields: Map<String, Value>) -> u64 {
        let mut inner = self.inner.lock().expect("log buffer poisoned");
        let id = inner.next_id;
        inner.next_id += 1;
        if inner.entries.len() == self.capacity {
            inner.entries.pop_front();
        }
        inner.entries.push_back(LogEntry {
            id,
            kind,
            timestamp: SystemTime::now(),
            fields,
        });
        id
    }

    /// Snapshot of all entries, oldest first.
    pub fn get_log(&self) -> Vec<LogEntry> {
        self.inner
            .lock()
            .expect("log buffer poisoned")
            .entries
            .iter()
            .cloned()
            .collect()
    }

    /// Best-effort lookup; `None` once the entry has been evicted.
    pub fn log_by_id(&self, id: u64) -> Option<LogEntry> {
        self.inner
            .lock()
            .expect("log buffer poisoned")
            .entries
            .iter()
            .find(|e| e.id == id)
            .cloned()
    }

    /// The most recently added entry.
    pub fn last_log(&self) -> Option<LogEntry> {
        self.inner
            .lock()
            .expect("log buffer poisoned")
            .entries
            .back()
            .cloned()
    }

    /// Drop every entry. IDs keep counting up.
    pub fn clear(&self) {
        self.inner
            .lock()
            .expect("log buffer poisoned")
            .entries
            .clear();
    }

    /// Number of entries currently held.
    pub fn len(&self) -> usize {
        self.inner.lock().expect("log buffer poisoned").entries.len()
    }

    /// True when the buffer holds no entries.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for LogBuffer {
    fn default() -> Self {
        Self::new()
    }
}

/// Build a `fields` map from key/value pairs.
#[macro_export]
macro_rules! log_fields {
    ($($key:expr => $value:expr),* $(,)?) => {{
        let mut map = serde_json::Map::new();
        $(map.insert($key.to_string(), serde_json::json!($value));)*
        map
    }};
}
