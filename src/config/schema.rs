//! Configuration schema definitions.
//!
//! This module defines the complete configuration structure for the daemon.
//! All types derive Serde traits for deserialization from config files.

use std::collections::BTreeMap;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Root configuration for the daemon. Loaded once at startup and shared
/// read-only with every connection task.
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
#[serde(default)]
pub struct DaemonConfig {
    /// Listener configuration (bind address, TLS).
    pub listener: ListenerConfig,

    /// Crafting policy: kill-switches, size limit, sandbox root.
    pub craft: CraftPolicy,

    /// Timeout configuration.
    pub timeouts: TimeoutConfig,

    /// Path-pattern anchors served when the request does not carry an
    /// inline spec.
    pub anchors: Vec<AnchorConfig>,

    /// Named specs, referenced from request paths as `=name`.
    pub specs: BTreeMap<String, String>,
}

/// Listener configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ListenerConfig {
    /// Bind address (e.g., "0.0.0.0:9999").
    pub bind_address: String,

    /// Optional TLS configuration.
    pub tls: Option<TlsSettings>,

    /// Maximum concurrent connections (backpressure).
    pub max_connections: usize,
}

impl Default for ListenerConfig {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0:9999".to_string(),
            tls: None,
            max_connections: 10_000,
        }
    }
}

/// TLS settings for the listener.
///
/// Certificate generation is out of scope; every entry names a resolved
/// PEM pair on disk.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct TlsSettings {
    /// Certificates keyed by SNI pattern. The first matching entry wins;
    /// `*` matches any name.
    pub certs: Vec<CertEntry>,

    /// Expected common name of the served certificate, recorded with
    /// handshake logs.
    pub cn: Option<String>,

    /// Handshake as soon as a connection is accepted. When false the
    /// certificates only serve post-CONNECT tunnel upgrades.
    pub immediate: bool,

    /// Leave the tunnel plaintext after a proxy CONNECT instead of
    /// upgrading it to TLS.
    pub not_after_connect: bool,
}

impl Default for TlsSettings {
    fn default() -> Self {
        Self {
            certs: Vec::new(),
            cn: None,
            immediate: true,
            not_after_connect: false,
        }
    }
}

/// A single SNI pattern → certificate mapping.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct CertEntry {
    /// SNI pattern: exact hostname or `*`.
    pub sni: String,

    /// Path to certificate chain file (PEM).
    pub cert_path: PathBuf,

    /// Path to private key file (PEM).
    pub key_path: PathBuf,
}

/// Crafting policy enforced by the safety gate.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct CraftPolicy {
    /// Refuse any spec that needs raw-crafting capability.
    pub nocraft: bool,

    /// Refuse any spec containing a pause.
    pub nohang: bool,

    /// Hexdump crafted wire bytes to the debug log.
    pub hexdump: bool,

    /// Maximum declared response body size in bytes.
    pub size_limit: u64,

    /// Directory file-sourced bodies are confined to. `None` denies all
    /// file reads.
    pub sandbox_root: Option<PathBuf>,
}

impl Default for CraftPolicy {
    fn default() -> Self {
        Self {
            nocraft: false,
            nohang: false,
            hexdump: false,
            size_limit: 100 * 1024 * 1024,
            sandbox_root: None,
        }
    }
}

/// Timeout configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct TimeoutConfig {
    /// Per-read/write deadline on a connection, in milliseconds.
    pub request_ms: u64,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self { request_ms: 30_000 }
    }
}

/// A path pattern mapped to a fixed specification.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct AnchorConfig {
    /// Path prefix to match.
    pub pattern: String,

    /// Specification to execute on a match.
    pub spec: String,
}

/// Parse a byte size with an optional `b`/`k`/`m`/`g` suffix, as the
/// spec language does. Used for CLI overrides.
pub fn parse_size(s: &str) -> Result<u64, String> {
    let s = s.trim();
    let split = s.find(|c: char| !c.is_ascii_digit()).unwrap_or(s.len());
    let (digits, suffix) = s.split_at(split);
    let n: u64 = digits
        .parse()
        .map_err(|_| format!("invalid size \"{}\"", s))?;
    let mult: u64 = match suffix {
        "" | "b" => 1,
        "k" => 1024,
        "m" => 1024 * 1024,
        "g" => 1024 * 1024 * 1024,
        _ => return Err(format!("unknown size suffix \"{}\"", suffix)),
    };
    n.checked_mul(mult)
        .ok_or_else(|| format!("size \"{}\" overflows", s))
}
