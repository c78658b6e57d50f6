//! TLS acceptor setup and certificate loading.
//!
//! # Responsibilities
//! - Load PEM certificate/key pairs named in the config
//! - Resolve the served certificate from the client's SNI
//! - Hand the dispatcher an acceptor usable both at accept time and
//!   after a proxy CONNECT
//!
//! # Design Decisions
//! - Certificate *generation* is out of scope; only resolved PEM pairs
//!   on disk are consumed
//! - SNI patterns are checked first-match-wins; `*` matches anything,
//!   `*.example.com` matches one label

use std::fmt;
use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use std::sync::Arc;

use rustls::crypto::ring::sign::any_supported_type;
use rustls::server::{ClientHello, ResolvesServerCert};
use rustls::sign::CertifiedKey;
use thiserror::Error;
use tokio_rustls::TlsAcceptor;

use crate::config::TlsSettings;

/// Error type for TLS setup.
#[derive(Debug, Error)]
pub enum TlsError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: std::path::PathBuf,
        source: std::io::Error,
    },
    #[error("no certificates found in {0}")]
    EmptyCertChain(std::path::PathBuf),
    #[error("no private key found in {0}")]
    NoPrivateKey(std::path::PathBuf),
    #[error("unusable private key in {0}: {1}")]
    BadPrivateKey(std::path::PathBuf, rustls::Error),
    #[error("no certificate entries configured")]
    NoEntries,
}

/// Everything the dispatcher needs to speak TLS: the acceptor plus the
/// config knobs that shape CONNECT handling.
#[derive(Clone)]
pub struct TlsContext {
    acceptor: TlsAcceptor,
    /// Expected certificate common name, recorded with handshake logs.
    pub cn: Option<String>,
    /// Handshake as soon as a connection is accepted.
    pub immediate: bool,
    /// Keep the tunnel plaintext after a proxy CONNECT.
    pub not_after_connect: bool,
}

impl TlsContext {
    /// Build an acceptor from the configured certificate entries.
    pub fn from_settings(settings: &TlsSettings) -> Result<Self, TlsError> {
        if settings.certs.is_empty() {
            return Err(TlsError::NoEntries);
        }

        let mut entries = Vec::with_capacity(settings.certs.len());
        for entry in &settings.certs {
            let key = load_certified_key(&entry.cert_path, &entry.key_path)?;
            entries.push((entry.sni.clone(), Arc::new(key)));
        }

        let mut config = rustls::ServerConfig::builder_with_provider(Arc::new(
            rustls::crypto::ring::default_provider(),
        ))
        .with_safe_default_protocol_versions()
        .expect("ring provider supports default protocol versions")
        .with_no_client_auth()
        .with_cert_resolver(Arc::new(PatternResolver { entries }));
        config.alpn_protocols = vec![b"http/1.1".to_vec()];

        Ok(Self {
            acceptor: TlsAcceptor::from(Arc::new(config)),
            cn: settings.cn.clone(),
            immediate: settings.immediate,
            not_after_connect: settings.not_after_connect,
        })
    }

    pub fn acceptor(&self) -> &TlsAcceptor {
        &self.acceptor
    }
}

/// First-match-wins SNI certificate selection. A missing SNI falls back
/// to the first entry.
struct PatternResolver {
    entries: Vec<(String, Arc<CertifiedKey>)>,
}

impl PatternResolver {
    fn matches(pattern: &str, name: &str) -> bool {
        if pattern == "*" {
            return true;
        }
        if let Some(suffix) = pattern.strip_prefix("*.") {
            return name
                .strip_suffix(suffix)
                .is_some_and(|head| head.len() > 1 && head.ends_with('.'));
        }
        pattern.eq_ignore_ascii_case(name)
    }
}

impl fmt::Debug for PatternResolver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PatternResolver")
            .field(
                "patterns",
                &self.entries.iter().map(|(p, _)| p).collect::<Vec<_>>(),
            )
            .finish()
    }
}

impl ResolvesServerCert for PatternResolver {
    fn resolve(&self, client_hello: ClientHello<'_>) -> Option<Arc<CertifiedKey>> {
        match client_hello.server_name() {
            Some(sni) => self
                .entries
                .iter()
                .find(|(pattern, _)| Self::matches(pattern, sni))
                .map(|(_, key)| Arc::clone(key)),
            None => self.entries.first().map(|(_, key)| Arc::clone(key)),
        }
    }
}

fn load_certified_key(cert_path: &Path, key_path: &Path) -> Result<CertifiedKey, TlsError> {
    let read_err = |path: &Path| {
        let path = path.to_path_buf();
        move |source| TlsError::Read { path, source }
    };

    let mut reader = BufReader::new(File::open(cert_path).map_err(read_err(cert_path))?);
    let certs: Vec<_> = rustls_pemfile::certs(&mut reader)
        .collect::<Result<_, _>>()
        .map_err(read_err(cert_path))?;
    if certs.is_empty() {
        return Err(TlsError::EmptyCertChain(cert_path.to_path_buf()));
    }

    let mut reader = BufReader::new(File::open(key_path).map_err(read_err(key_path))?);
    let key = rustls_pemfile::private_key(&mut reader)
        .map_err(read_err(key_path))?
        .ok_or_else(|| TlsError::NoPrivateKey(key_path.to_path_buf()))?;
    let signing_key = any_supported_type(&key)
        .map_err(|e| TlsError::BadPrivateKey(key_path.to_path_buf(), e))?;

    Ok(CertifiedKey::new(certs, signing_key))
}
