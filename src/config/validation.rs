//! Configuration validation.
//!
//! # Responsibilities
//! - Semantic validation (serde handles syntactic)
//! - Parse every anchor and named spec so bad specs fail at startup,
//!   not on the first matching request
//! - Validate value ranges and referenced files
//!
//! # Design Decisions
//! - Returns all validation errors, not just the first
//! - Validation is a pure function over the config plus path existence
//! - Runs before the config is accepted into the daemon

use std::net::SocketAddr;

use thiserror::Error;

use crate::config::schema::DaemonConfig;
use crate::spec::{self, Spec};

/// A single reason the configuration was refused.
#[derive(Debug, Error)]
pub enum ValidationError {
    #[error("invalid bind address \"{0}\": {1}")]
    BindAddress(String, std::net::AddrParseError),
    #[error("size limit must be greater than zero")]
    ZeroSizeLimit,
    #[error("max_connections must be greater than zero")]
    ZeroMaxConnections,
    #[error("anchor \"{pattern}\": {error}")]
    BadAnchorSpec {
        pattern: String,
        error: spec::ParseError,
    },
    #[error("anchor \"{pattern}\": spec is not servable")]
    UnservableAnchor { pattern: String },
    #[error("named spec \"{name}\": {error}")]
    BadNamedSpec {
        name: String,
        error: spec::ParseError,
    },
    #[error("TLS enabled but no certificates configured")]
    NoCerts,
    #[error("certificate file {0} does not exist")]
    MissingCertFile(std::path::PathBuf),
    #[error("sandbox root {0} does not exist")]
    MissingSandboxRoot(std::path::PathBuf),
}

/// Check everything, collecting every failure.
pub fn validate_config(config: &DaemonConfig) -> Result<(), Vec<ValidationError>> {
    let mut errors = Vec::new();

    if let Err(e) = config.listener.bind_address.parse::<SocketAddr>() {
        errors.push(ValidationError::BindAddress(
            config.listener.bind_address.clone(),
            e,
        ));
    }
    if config.listener.max_connections == 0 {
        errors.push(ValidationError::ZeroMaxConnections);
    }
    if config.craft.size_limit == 0 {
        errors.push(ValidationError::ZeroSizeLimit);
    }

    for anchor in &config.anchors {
        match spec::parse(&anchor.spec) {
            Err(error) => errors.push(ValidationError::BadAnchorSpec {
                pattern: anchor.pattern.clone(),
                error,
            }),
            // anchors must resolve to something the engine can serve
            Ok(Spec::Request(_)) | Ok(Spec::NamedRef(_)) | Ok(Spec::Frame(_)) => {
                errors.push(ValidationError::UnservableAnchor {
                    pattern: anchor.pattern.clone(),
                })
            }
            Ok(_) => {}
        }
    }

    for (name, text) in &config.specs {
        if let Err(error) = spec::parse(text) {
            errors.push(ValidationError::BadNamedSpec {
                name: name.clone(),
                error,
            });
        }
    }

    if let Some(tls) = &config.listener.tls {
        if tls.certs.is_empty() {
            errors.push(ValidationError::NoCerts);
        }
        for entry in &tls.certs {
            for path in [&entry.cert_path, &entry.key_path] {
                if !path.exists() {
                    errors.push(ValidationError::MissingCertFile(path.clone()));
                }
            }
        }
    }

    if let Some(root) = &config.craft.sandbox_root {
        if !root.is_dir() {
            errors.push(ValidationError::MissingSandboxRoot(root.clone()));
        }
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}
