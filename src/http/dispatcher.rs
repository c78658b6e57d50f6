//! Per-connection protocol dispatch.
//!
//! # State Machine
//! ```text
//! Accepted → (TLS handshake, optionally deferred until after CONNECT)
//!          → RequestLine → Headers
//!          → {HTTP | WebSocketUpgrade | ProxyConnect}
//!          → Execute (safety gate + crafting engine)
//!          → Closed (or back to RequestLine on keep-alive)
//! ```
//!
//! # Design Decisions
//! - One dispatcher invocation per accepted connection; tasks share
//!   only the log buffer and the read-only config
//! - Gate rejections answer with the sentinel 800 and keep the
//!   connection usable; protocol errors close it without a response
//! - Absolute-URI request lines are self-looped: the daemon acts as
//!   the far-end target and serves the URI's own path

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Map, Value};
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use url::Url;

use crate::config::DaemonConfig;
use crate::craft::{self, Engine, Outcome};
use crate::log_fields;
use crate::logbuf::{LogBuffer, LogKind};
use crate::net::{BufStream, ConnectionId, Stream, TlsContext};
use crate::spec::{self, Rejection, ResponseSpec, Spec, WebSocketSpec};

use super::request::{self, HeadError, RequestHead};

/// Path prefix under which a request carries its own inline spec.
pub const CRAFT_PREFIX: &str = "/p/";

/// Handles every request on one accepted connection.
pub struct Dispatcher {
    config: Arc<DaemonConfig>,
    logbuf: LogBuffer,
    tls: Option<TlsContext>,
}

impl Dispatcher {
    pub fn new(config: Arc<DaemonConfig>, logbuf: LogBuffer, tls: Option<TlsContext>) -> Self {
        Self {
            config,
            logbuf,
            tls,
        }
    }

    /// Drive the connection until it closes, one way or another.
    pub async fn handle(&self, tcp: TcpStream, peer: SocketAddr) {
        let id = ConnectionId::new();
        let mut io = BufStream::new(Stream::Plain(tcp));

        if let Some(tls) = &self.tls {
            if tls.immediate && !self.handshake(&mut io, tls, peer).await {
                return;
            }
        }

        let deadline = Duration::from_millis(self.config.timeouts.request_ms);
        let engine = Engine::new(&self.config.craft);

        loop {
            let head = match tokio::time::timeout(deadline, request::read_head(&mut io)).await {
                Err(_) => {
                    self.log_timeout(peer);
                    if let Some(stream) = io.take_stream() {
                        stream.abort();
                    }
                    return;
                }
                Ok(Err(HeadError::Io(e))) => {
                    self.logbuf.add(
                        LogKind::Error,
                        log_fields! {
                            "msg" => format!("read failed: {}", e),
                            "peer" => peer.to_string(),
                        },
                    );
                    return;
                }
                Ok(Err(HeadError::Protocol(e))) => {
                    // malformed head: log and close without a response
                    self.logbuf.add(
                        LogKind::Error,
                        log_fields! {
                            "msg" => e.to_string(),
                            "peer" => peer.to_string(),
                        },
                    );
                    tracing::debug!(connection = %id, error = %e, "protocol error");
                    return;
                }
                Ok(Ok(None)) => return,
                Ok(Ok(Some(head))) => head,
            };

            tracing::debug!(
                connection = %id,
                method = %head.method,
                target = %head.target,
                "request received"
            );

            if head.is_http2_preface() {
                let msg = "HTTP/2 is not supported";
                let _ = engine
                    .send_response(&mut io, &ResponseSpec::sentinel(msg))
                    .await;
                self.log_rejection(&head, msg, &io, peer);
                return;
            }

            if head.method.eq_ignore_ascii_case("CONNECT") {
                if !self.establish_tunnel(&mut io, peer).await {
                    return;
                }
                continue;
            }

            let content_length = match head.content_length() {
                Ok(n) => n,
                Err(e) => {
                    self.logbuf.add(
                        LogKind::Error,
                        self.with_base(
                            &head,
                            &io,
                            peer,
                            log_fields! { "msg" => e.to_string() },
                        ),
                    );
                    return;
                }
            };
            if content_length > 0 {
                match tokio::time::timeout(deadline, io.discard(content_length)).await {
                    Err(_) => {
                        self.log_timeout(peer);
                        if let Some(stream) = io.take_stream() {
                            stream.abort();
                        }
                        return;
                    }
                    Ok(Err(e)) => {
                        self.logbuf.add(
                            LogKind::Error,
                            log_fields! {
                                "msg" => format!("read failed: {}", e),
                                "peer" => peer.to_string(),
                            },
                        );
                        return;
                    }
                    Ok(Ok(())) => {}
                }
            }

            let path = request::percent_decode(&target_path(&head));
            let is_ws = head.is_websocket_upgrade();

            let resolved = self.resolve_spec(&path, is_ws);
            let spec = match resolved {
                Ok(spec) => spec,
                Err(msg) => {
                    let _ = engine
                        .send_response(&mut io, &ResponseSpec::sentinel(&msg))
                        .await;
                    self.log_rejection(&head, &msg, &io, peer);
                    if !io.is_open() {
                        return;
                    }
                    continue;
                }
            };

            if let Err(rejection) = spec::check(&spec, &self.config.craft) {
                let msg = rejection.to_string();
                let _ = engine
                    .send_response(&mut io, &ResponseSpec::sentinel(&msg))
                    .await;
                self.log_rejection(&head, &msg, &io, peer);
                if !io.is_open() {
                    return;
                }
                continue;
            }

            match spec {
                Spec::Response(response) => {
                    let outcome = engine.send_response(&mut io, &response).await;
                    if outcome.bytes_written == 0 && !outcome.closed_early {
                        // body source failed before a single byte went out
                        if let Some(err) = outcome.error.clone() {
                            let _ = engine
                                .send_response(&mut io, &ResponseSpec::sentinel(&err))
                                .await;
                            self.log_rejection(&head, &err, &io, peer);
                            if !io.is_open() {
                                return;
                            }
                            continue;
                        }
                    }
                    self.log_response(&head, &outcome, &io, peer);
                    if outcome.closed_early || outcome.error.is_some() || !io.is_open() {
                        return;
                    }
                }
                Spec::WebSocket(ws) => {
                    if !is_ws {
                        let msg = "Not a websocket handshake";
                        let _ = engine
                            .send_response(&mut io, &ResponseSpec::sentinel(msg))
                            .await;
                        self.log_rejection(&head, msg, &io, peer);
                        if !io.is_open() {
                            return;
                        }
                        continue;
                    }
                    self.serve_websocket(&mut io, &engine, &ws, &head, deadline, peer)
                        .await;
                    return;
                }
                Spec::Frame(_) => {
                    let msg = Rejection::NotAResponse.to_string();
                    let _ = engine
                        .send_response(&mut io, &ResponseSpec::sentinel(&msg))
                        .await;
                    self.log_rejection(&head, &msg, &io, peer);
                    if !io.is_open() {
                        return;
                    }
                }
                // both are turned into rejections by the gate above
                Spec::Request(_) | Spec::NamedRef(_) => unreachable!(),
            }
        }
    }

    /// Run the TLS handshake, logging a failure the way the tests
    /// expect ("TLS" in the message).
    async fn handshake(&self, io: &mut BufStream, tls: &TlsContext, peer: SocketAddr) -> bool {
        match io.upgrade_tls(tls.acceptor()).await {
            Ok(()) => {
                if let Some(stream) = io.stream() {
                    tracing::debug!(
                        peer = %peer,
                        sni = stream.sni().as_deref().unwrap_or("-"),
                        cn = tls.cn.as_deref().unwrap_or("-"),
                        "TLS handshake complete"
                    );
                }
                true
            }
            Err(e) => {
                self.logbuf.add(
                    LogKind::Error,
                    log_fields! {
                        "msg" => format!("TLS handshake failed: {}", e),
                        "peer" => peer.to_string(),
                    },
                );
                false
            }
        }
    }

    /// Answer a proxy CONNECT and, unless configured otherwise, upgrade
    /// the tunnel to TLS. The inner request is then read off the same
    /// connection.
    async fn establish_tunnel(&self, io: &mut BufStream, peer: SocketAddr) -> bool {
        let established = async {
            let stream = io.stream_mut()?;
            stream
                .write_all(b"HTTP/1.1 200 Connection established\r\n\r\n")
                .await?;
            stream.flush().await
        }
        .await;
        if let Err(e) = established {
            self.logbuf.add(
                LogKind::Error,
                log_fields! {
                    "msg" => format!("write failed: {}", e),
                    "peer" => peer.to_string(),
                },
            );
            return false;
        }

        match &self.tls {
            Some(tls) if !tls.not_after_connect => self.handshake(io, tls, peer).await,
            _ => true,
        }
    }

    /// Complete the upgrade, then reflect every incoming frame: its
    /// payload is parsed as a frame spec and crafted straight back.
    async fn serve_websocket(
        &self,
        io: &mut BufStream,
        engine: &Engine<'_>,
        ws: &WebSocketSpec,
        head: &RequestHead,
        deadline: Duration,
        peer: SocketAddr,
    ) {
        let Some(key) = head.websocket_key() else {
            let msg = "Invalid websocket handshake: missing key";
            let _ = engine
                .send_response(io, &ResponseSpec::sentinel(msg))
                .await;
            self.log_rejection(head, msg, io, peer);
            return;
        };

        let upgrade = craft::upgrade_response(ws, key);
        let outcome = engine.send_response(io, &upgrade).await;
        self.log_response(head, &outcome, io, peer);
        if outcome.closed_early || outcome.error.is_some() || !io.is_open() {
            return;
        }

        loop {
            let frame = match tokio::time::timeout(deadline, craft::read_frame(io)).await {
                Err(_) => {
                    self.log_timeout(peer);
                    if let Some(stream) = io.take_stream() {
                        stream.abort();
                    }
                    return;
                }
                Ok(Err(e)) => {
                    self.logbuf.add(
                        LogKind::Error,
                        log_fields! {
                            "msg" => format!("websocket read failed: {}", e),
                            "peer" => peer.to_string(),
                        },
                    );
                    return;
                }
                Ok(Ok(frame)) => frame,
            };
            if frame.is_close() {
                return;
            }

            let text = String::from_utf8_lossy(&frame.payload).into_owned();
            let parsed = spec::parse(&text);
            let frame_spec = match parsed {
                Ok(Spec::Frame(f)) => f,
                Ok(_) | Err(_) => {
                    // reflection only understands frame specs; the log
                    // entry may trail the frame I/O that provoked it
                    self.logbuf.add(
                        LogKind::Error,
                        log_fields! {
                            "msg" => format!("Parse error in frame payload: {:.60}", text),
                            "peer" => peer.to_string(),
                        },
                    );
                    continue;
                }
            };

            let wrapped = Spec::Frame(frame_spec);
            if let Err(rejection) = spec::check(&wrapped, &self.config.craft) {
                self.logbuf.add(
                    LogKind::Error,
                    self.with_base(
                        head,
                        io,
                        peer,
                        log_fields! {
                            "msg" => rejection.to_string(),
                            "response" => json!({ "status": 0, "msg": rejection.to_string() }),
                        },
                    ),
                );
                continue;
            }
            let Spec::Frame(frame_spec) = wrapped else {
                unreachable!()
            };

            let outcome = engine.send_frame(io, &frame_spec).await;
            let mut fields = log_fields! {
                "response" => json!({
                    "frame": true,
                    "bytes_written": outcome.bytes_written,
                    "closed_early": outcome.closed_early,
                }),
            };
            let kind = if let Some(err) = &outcome.error {
                fields.insert("msg".into(), json!(err));
                LogKind::Error
            } else {
                LogKind::Response
            };
            self.logbuf.add(kind, self.with_base(head, io, peer, fields));
            if outcome.closed_early || outcome.error.is_some() || !io.is_open() {
                return;
            }
        }
    }

    /// Turn a request path into a spec: inline under `/p/`, else the
    /// anchor table, else a "not found" rejection message.
    fn resolve_spec(&self, path: &str, is_ws: bool) -> Result<Spec, String> {
        if let Some(text) = path.strip_prefix(CRAFT_PREFIX) {
            if text.trim().is_empty() {
                return if is_ws {
                    Ok(Spec::WebSocket(WebSocketSpec::default()))
                } else {
                    Err("Not found: empty specification".to_string())
                };
            }
            return match spec::parse(text) {
                Ok(Spec::NamedRef(name)) => match self.config.specs.get(&name) {
                    // stored specs were parse-checked at startup
                    Some(stored) => spec::parse(stored).map_err(|e| e.to_string()),
                    None => Err(Rejection::NoSuchSpec { name }.to_string()),
                },
                Ok(spec) => Ok(spec),
                Err(e) => Err(format!("Parse error: {}", e)),
            };
        }

        for anchor in &self.config.anchors {
            if path.starts_with(&anchor.pattern) {
                return spec::parse(&anchor.spec).map_err(|e| e.to_string());
            }
        }
        Err(format!("Not found: no anchor matches {}", path))
    }

    // ---- logging ---------------------------------------------------------

    fn with_base(
        &self,
        head: &RequestHead,
        io: &BufStream,
        peer: SocketAddr,
        mut fields: Map<String, Value>,
    ) -> Map<String, Value> {
        fields.insert(
            "request".into(),
            json!({ "method": head.method, "path": head.target }),
        );
        fields.insert("peer".into(), json!(peer.to_string()));
        if let Some(stream) = io.stream() {
            if let Some((name, bits)) = stream.cipher_info() {
                fields.insert("cipher".into(), json!([name, bits]));
            }
            if let Some(sni) = stream.sni() {
                fields.insert("sni".into(), json!(sni));
            }
        }
        if let Some(cn) = self.tls.as_ref().and_then(|t| t.cn.as_deref()) {
            fields.insert("cn".into(), json!(cn));
        }
        fields
    }

    fn log_response(
        &self,
        head: &RequestHead,
        outcome: &Outcome,
        io: &BufStream,
        peer: SocketAddr,
    ) {
        let mut fields = log_fields! {
            "response" => json!({
                "status": outcome.status,
                "bytes_written": outcome.bytes_written,
                "closed_early": outcome.closed_early,
            }),
        };
        let kind = if let Some(err) = &outcome.error {
            fields.insert("msg".into(), json!(err));
            LogKind::Error
        } else {
            LogKind::Response
        };
        self.logbuf.add(kind, self.with_base(head, io, peer, fields));
    }

    fn log_rejection(&self, head: &RequestHead, msg: &str, io: &BufStream, peer: SocketAddr) {
        self.logbuf.add(
            LogKind::Error,
            self.with_base(
                head,
                io,
                peer,
                log_fields! {
                    "msg" => msg,
                    "response" => json!({ "status": 800, "msg": msg }),
                },
            ),
        );
    }

    fn log_timeout(&self, peer: SocketAddr) {
        self.logbuf.add(
            LogKind::Timeout,
            log_fields! {
                "msg" => "connection timed out",
                "peer" => peer.to_string(),
            },
        );
    }
}

/// The path a request is really asking for. Absolute-URI request lines
/// (proxy style) are self-looped onto this daemon.
fn target_path(head: &RequestHead) -> String {
    if head.target.starts_with("http://") || head.target.starts_with("https://") {
        if let Ok(url) = Url::parse(&head.target) {
            return url.path().to_string();
        }
    }
    head.target.clone()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn head_for(target: &str) -> RequestHead {
        RequestHead {
            method: "GET".into(),
            target: target.into(),
            version: "HTTP/1.1".into(),
            headers: Vec::new(),
        }
    }

    #[test]
    fn absolute_uri_self_loops() {
        assert_eq!(target_path(&head_for("http://foo.com/p/202")), "/p/202");
        assert_eq!(target_path(&head_for("/p/202")), "/p/202");
    }

    fn dispatcher(config: DaemonConfig) -> Dispatcher {
        Dispatcher::new(
            Arc::new(config),
            crate::logbuf::LogBuffer::with_capacity(16),
            None,
        )
    }

    #[test]
    fn inline_spec_resolution() {
        let d = dispatcher(DaemonConfig::default());
        assert!(matches!(
            d.resolve_spec("/p/202", false),
            Ok(Spec::Response(r)) if r.status == 202
        ));
        assert!(d.resolve_spec("/p/", false).is_err());
        assert!(matches!(
            d.resolve_spec("/p/", true),
            Ok(Spec::WebSocket(_))
        ));
        let err = d.resolve_spec("/p/200:zz", false).unwrap_err();
        assert!(err.contains("Parse error"));
    }

    #[test]
    fn anchor_resolution() {
        let mut config = DaemonConfig::default();
        config.anchors.push(crate::config::AnchorConfig {
            pattern: "/anchor".into(),
            spec: "202".into(),
        });
        let d = dispatcher(config);
        assert!(matches!(
            d.resolve_spec("/anchor/foo", false),
            Ok(Spec::Response(r)) if r.status == 202
        ));
        let err = d.resolve_spec("/other", false).unwrap_err();
        assert!(err.contains("Not found"));
    }

    #[test]
    fn named_spec_resolution() {
        let mut config = DaemonConfig::default();
        config.specs.insert("hello".into(), "200:b'hi'".into());
        let d = dispatcher(config);
        assert!(matches!(
            d.resolve_spec("/p/=hello", false),
            Ok(Spec::Response(r)) if r.status == 200
        ));
        let err = d.resolve_spec("/p/=nonexistent", false).unwrap_err();
        assert!(err.contains("no such spec"));
    }
}
