//! Policy checks applied to a parsed spec before execution.
//!
//! # Responsibilities
//! - Enforce the crafting / pause kill-switches
//! - Enforce the response size limit without allocating the body
//! - Confine file-sourced bodies to the sandbox root
//!
//! # Design Decisions
//! - Every rule yields a distinct rejection, surfaced as a sentinel 800
//!   response and an error log entry; the connection itself survives
//! - Sandbox confinement is a lexical check so nonexistent paths are
//!   rejected the same way as existing ones

use std::path::{Component, Path, PathBuf};

use thiserror::Error;

use super::ast::{ActionKind, FramePayload, Spec, ValueSpec};
use crate::config::CraftPolicy;

/// Why the gate refused to execute a spec.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum Rejection {
    #[error("Crafting disabled")]
    CraftingDisabled,
    #[error("Pauses have been disabled")]
    PausesDisabled,
    #[error("Response too large: {size} bytes exceeds limit of {limit}")]
    TooLarge { size: u64, limit: u64 },
    #[error("File access denied: {path}")]
    FileAccessDenied { path: String },
    #[error("Not found: no such spec \"{name}\"")]
    NoSuchSpec { name: String },
    #[error("Not a response specification")]
    NotAResponse,
}

/// Validate `spec` against the active policy. Purely read-only; the
/// engine re-resolves file paths through [`sandboxed_path`] at read time.
pub fn check(spec: &Spec, policy: &CraftPolicy) -> Result<(), Rejection> {
    match spec {
        Spec::Request(_) => return Err(Rejection::NotAResponse),
        Spec::NamedRef(name) => {
            // unresolved references never reach the engine
            return Err(Rejection::NoSuchSpec { name: name.clone() });
        }
        Spec::Response(_) | Spec::WebSocket(_) | Spec::Frame(_) => {}
    }

    if policy.nocraft && spec.requires_crafting() {
        return Err(Rejection::CraftingDisabled);
    }

    if policy.nohang
        && spec
            .actions()
            .iter()
            .any(|a| matches!(a.kind, ActionKind::Pause(_)))
    {
        return Err(Rejection::PausesDisabled);
    }

    if let Some(size) = declared_body_size(spec) {
        if size > policy.size_limit {
            return Err(Rejection::TooLarge {
                size,
                limit: policy.size_limit,
            });
        }
    }

    for path in file_refs(spec) {
        sandboxed_path(policy.sandbox_root.as_deref(), path)?;
    }

    Ok(())
}

/// Resolve `file` inside the sandbox root, refusing absolute paths,
/// parent traversal and configurations with no sandbox at all.
pub fn sandboxed_path(root: Option<&Path>, file: &str) -> Result<PathBuf, Rejection> {
    let denied = || Rejection::FileAccessDenied {
        path: file.to_string(),
    };
    let root = root.ok_or_else(denied)?;
    let rel = Path::new(file);
    if rel.is_absolute() {
        return Err(denied());
    }
    for component in rel.components() {
        match component {
            Component::Normal(_) | Component::CurDir => {}
            _ => return Err(denied()),
        }
    }
    Ok(root.join(rel))
}

/// Sum of literal and filler body sizes. File sizes are not declared in
/// the spec and are streamed, so they do not count against the limit.
fn declared_body_size(spec: &Spec) -> Option<u64> {
    let value = match spec {
        Spec::Response(r) => r.body.as_ref(),
        Spec::Frame(f) => match &f.payload {
            Some(FramePayload::Value(v)) => Some(v),
            _ => None,
        },
        _ => None,
    };
    value.and_then(ValueSpec::declared_len)
}

fn file_refs(spec: &Spec) -> impl Iterator<Item = &str> {
    let value = match spec {
        Spec::Response(r) => r.body.as_ref(),
        Spec::Frame(f) => match &f.payload {
            Some(FramePayload::Value(v)) => Some(v),
            _ => None,
        },
        _ => None,
    };
    value
        .into_iter()
        .filter_map(|v| match v {
            ValueSpec::File(path) => Some(path.as_str()),
            _ => None,
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::spec::parser::parse;

    fn policy() -> CraftPolicy {
        CraftPolicy {
            nocraft: false,
            nohang: false,
            hexdump: false,
            size_limit: 100 * 1024 * 1024,
            sandbox_root: Some(PathBuf::from("/srv/static")),
        }
    }

    #[test]
    fn plain_response_passes() {
        assert!(check(&parse("200:b'hello'").unwrap(), &policy()).is_ok());
    }

    #[test]
    fn nocraft_rejects_raw_bytes() {
        let p = CraftPolicy {
            nocraft: true,
            ..policy()
        };
        assert_eq!(
            check(&parse(r"200:b'\xf0'").unwrap(), &p),
            Err(Rejection::CraftingDisabled)
        );
        // plain text stays allowed
        assert!(check(&parse("200:b'ok'").unwrap(), &p).is_ok());
        // pauses and disconnects are crafting too
        assert_eq!(
            check(&parse("200:d10").unwrap(), &p),
            Err(Rejection::CraftingDisabled)
        );
    }

    #[test]
    fn nohang_rejects_pauses() {
        let p = CraftPolicy {
            nohang: true,
            ..policy()
        };
        let err = check(&parse("200:p0,0").unwrap(), &p).unwrap_err();
        assert!(err.to_string().contains("Pauses have been disabled"));
        // non-pause actions survive nohang
        assert!(check(&parse("200:d10").unwrap(), &p).is_ok());
    }

    #[test]
    fn size_limit_enforced() {
        let p = CraftPolicy {
            size_limit: 1024 * 1024,
            ..policy()
        };
        let err = check(&parse("200:b@1g").unwrap(), &p).unwrap_err();
        assert!(err.to_string().contains("too large"));
        assert!(check(&parse("200:b@1k").unwrap(), &p).is_ok());
    }

    #[test]
    fn sandbox_confinement() {
        let p = policy();
        assert!(check(&parse("200:b<file").unwrap(), &p).is_ok());
        assert_eq!(
            check(&parse("200:b</foo").unwrap(), &p),
            Err(Rejection::FileAccessDenied {
                path: "/foo".into()
            })
        );
        assert_eq!(
            check(&parse("200:b<../../etc/passwd").unwrap(), &p),
            Err(Rejection::FileAccessDenied {
                path: "../../etc/passwd".into()
            })
        );
        // no sandbox configured: all file reads denied
        let p = CraftPolicy {
            sandbox_root: None,
            ..policy()
        };
        assert!(matches!(
            check(&parse("200:b<file").unwrap(), &p),
            Err(Rejection::FileAccessDenied { .. })
        ));
    }

    #[test]
    fn request_specs_never_execute() {
        assert_eq!(
            check(&parse("get:/p/200").unwrap(), &policy()),
            Err(Rejection::NotAResponse)
        );
    }
}
