//! Directive execution against a live connection.
//!
//! # Responsibilities
//! - Serialize status line, headers and body bytes
//! - Fire pause / inject / disconnect actions at exact byte offsets
//! - Stream filler and file bodies in bounded chunks
//! - Report every execution as an [`Outcome`] for the log
//!
//! # Design Decisions
//! - Offsets index the serialized base message; injected bytes do not
//!   shift later offsets
//! - Actions at equal offsets fire in specification order (stable sort)
//! - A write error aborts immediately and is never retried

use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use rand::distributions::Alphanumeric;
use rand::Rng;
use tokio::io::{AsyncReadExt, AsyncWriteExt};

use crate::config::CraftPolicy;
use crate::net::BufStream;
use crate::observability::hexdump;
use crate::spec::{
    sandboxed_path, Action, ActionKind, FramePayload, FrameSpec, Offset, PauseDuration,
    ResponseSpec, Spec, ValueSpec,
};

use super::frames::build_frame;

/// Sleep used for `p<off>,f`; in practice the peer or the socket gives
/// up first.
const PAUSE_FOREVER: Duration = Duration::from_secs(365 * 24 * 60 * 60);

/// Emission chunk size for filler and file bodies.
const CHUNK: usize = 64 * 1024;

/// What an execution did to the wire.
#[derive(Debug, Clone, Default)]
pub struct Outcome {
    /// Status code on the emitted status line (0 for raw frames).
    pub status: u16,
    pub bytes_written: u64,
    /// The spec tore the transport down mid-stream.
    pub closed_early: bool,
    pub error: Option<String>,
}

/// Executes validated specs. Holds no per-connection state; one engine
/// value serves a whole connection task.
pub struct Engine<'a> {
    policy: &'a CraftPolicy,
}

impl<'a> Engine<'a> {
    pub fn new(policy: &'a CraftPolicy) -> Self {
        Self { policy }
    }

    /// Emit a crafted HTTP response.
    pub async fn send_response(&self, io: &mut BufStream, spec: &ResponseSpec) -> Outcome {
        let mut outcome = Outcome {
            status: spec.status,
            ..Default::default()
        };

        let body = match self.open_body(spec.body.as_ref()).await {
            Ok(body) => body,
            Err(e) => {
                outcome.error = Some(e.to_string());
                return outcome;
            }
        };

        let head = build_head(spec, body.len());
        self.emit(io, head, body, &spec.actions, &mut outcome).await;
        outcome
    }

    /// Emit one crafted WebSocket frame.
    pub async fn send_frame(&self, io: &mut BufStream, spec: &FrameSpec) -> Outcome {
        let mut outcome = Outcome::default();
        let payload = match self.render_payload(spec.payload.as_ref()).await {
            Ok(p) => p,
            Err(e) => {
                outcome.error = Some(e.to_string());
                return outcome;
            }
        };
        let frame = build_frame(spec, &payload);
        self.emit(io, frame, Body::None, &spec.actions, &mut outcome)
            .await;
        outcome
    }

    /// Walk the serialized message, firing actions at their offsets.
    async fn emit(
        &self,
        io: &mut BufStream,
        head: Vec<u8>,
        mut body: Body,
        actions: &[Action],
        outcome: &mut Outcome,
    ) {
        let total = head.len() as u64 + body.len();
        let mut ordered: Vec<(u64, &ActionKind)> = actions
            .iter()
            .map(|a| {
                let at = match a.offset {
                    Offset::Bytes(n) => n.min(total),
                    Offset::After => total,
                };
                (at, &a.kind)
            })
            .collect();
        // stable: equal offsets keep specification order
        ordered.sort_by_key(|(at, _)| *at);

        let mut cursor = 0u64;
        for (at, kind) in ordered {
            if let Err(e) = self
                .write_span(io, &head, &mut body, cursor, at, outcome)
                .await
            {
                outcome.error = Some(e.to_string());
                return;
            }
            cursor = at;

            match kind {
                ActionKind::Pause(duration) => {
                    if let Err(e) = self.flush(io).await {
                        outcome.error = Some(e.to_string());
                        return;
                    }
                    let duration = match duration {
                        PauseDuration::Secs(s) => Duration::from_secs(*s),
                        PauseDuration::Forever => PAUSE_FOREVER,
                    };
                    tracing::debug!(offset = cursor, ?duration, "pausing emission");
                    tokio::time::sleep(duration).await;
                }
                ActionKind::Inject(bytes) => {
                    if let Err(e) = self.write_chunk(io, bytes).await {
                        outcome.error = Some(e.to_string());
                        return;
                    }
                    outcome.bytes_written += bytes.len() as u64;
                }
                ActionKind::Disconnect => {
                    let _ = self.flush(io).await;
                    if let Some(stream) = io.take_stream() {
                        stream.abort();
                    }
                    tracing::debug!(offset = cursor, "abrupt disconnect");
                    outcome.closed_early = true;
                    return;
                }
            }
        }

        if let Err(e) = self
            .write_span(io, &head, &mut body, cursor, total, outcome)
            .await
            .and(self.flush(io).await)
        {
            outcome.error = Some(e.to_string());
        }
    }

    /// Write base-stream bytes in `[from, to)`, spanning head and body.
    async fn write_span(
        &self,
        io: &mut BufStream,
        head: &[u8],
        body: &mut Body,
        from: u64,
        to: u64,
        outcome: &mut Outcome,
    ) -> std::io::Result<()> {
        let head_len = head.len() as u64;
        if from < head_len {
            let slice = &head[from as usize..to.min(head_len) as usize];
            self.write_chunk(io, slice).await?;
            outcome.bytes_written += slice.len() as u64;
        }
        if to > head_len {
            let body_from = from.max(head_len) - head_len;
            let body_to = to - head_len;
            let mut remaining = body_to - body_from;
            while remaining > 0 {
                let take = remaining.min(CHUNK as u64) as usize;
                let chunk = body.next_chunk(take).await?;
                self.write_chunk(io, &chunk).await?;
                outcome.bytes_written += chunk.len() as u64;
                remaining -= chunk.len() as u64;
            }
        }
        Ok(())
    }

    async fn write_chunk(&self, io: &mut BufStream, bytes: &[u8]) -> std::io::Result<()> {
        if bytes.is_empty() {
            return Ok(());
        }
        if self.policy.hexdump {
            for line in hexdump::lines(bytes) {
                tracing::debug!(">> {}", line);
            }
        }
        io.stream_mut()?.write_all(bytes).await
    }

    async fn flush(&self, io: &mut BufStream) -> std::io::Result<()> {
        io.stream_mut()?.flush().await
    }

    /// Resolve a body source before any byte of the response is sent,
    /// so an unreadable file fails the whole exchange cleanly.
    async fn open_body(&self, value: Option<&ValueSpec>) -> std::io::Result<Body> {
        match value {
            None => Ok(Body::None),
            Some(ValueSpec::Literal(bytes)) => Ok(Body::Literal {
                bytes: bytes.clone(),
                pos: 0,
            }),
            Some(ValueSpec::Filler(n)) => Ok(Body::Filler(*n)),
            Some(ValueSpec::File(path)) => {
                let resolved = sandboxed_path(self.policy.sandbox_root.as_deref(), path)
                    .map_err(|e| std::io::Error::new(std::io::ErrorKind::PermissionDenied, e))?;
                let file = tokio::fs::File::open(&resolved).await?;
                let len = file.metadata().await?.len();
                Ok(Body::File { file, len })
            }
        }
    }

    /// Render a frame payload: literal/filler/file bytes, or the fully
    /// crafted bytes of a nested frame spec.
    fn render_payload<'s>(
        &'s self,
        payload: Option<&'s FramePayload>,
    ) -> Pin<Box<dyn Future<Output = std::io::Result<Vec<u8>>> + Send + 's>> {
        Box::pin(async move {
            match payload {
                None => Ok(Vec::new()),
                Some(FramePayload::Value(value)) => {
                    let mut body = self.open_body(Some(value)).await?;
                    let mut out = Vec::new();
                    let mut remaining = body.len();
                    while remaining > 0 {
                        let chunk = body.next_chunk(remaining.min(CHUNK as u64) as usize).await?;
                        remaining -= chunk.len() as u64;
                        out.extend_from_slice(&chunk);
                    }
                    Ok(out)
                }
                Some(FramePayload::Crafted(spec_text)) => {
                    let text = std::str::from_utf8(spec_text).map_err(|_| {
                        std::io::Error::new(
                            std::io::ErrorKind::InvalidData,
                            "nested spec is not UTF-8",
                        )
                    })?;
                    let nested = crate::spec::parse(text).map_err(|e| {
                        std::io::Error::new(std::io::ErrorKind::InvalidData, e.to_string())
                    })?;
                    let Spec::Frame(nested) = nested else {
                        return Err(std::io::Error::new(
                            std::io::ErrorKind::InvalidData,
                            "nested payload must be a frame spec",
                        ));
                    };
                    let inner = self.render_payload(nested.payload.as_ref()).await?;
                    Ok(build_frame(&nested, &inner))
                }
            }
        })
    }
}

/// A body being streamed. Chunks are requested strictly in order, so
/// file reads stay sequential.
enum Body {
    None,
    Literal { bytes: Vec<u8>, pos: usize },
    Filler(u64),
    File { file: tokio::fs::File, len: u64 },
}

impl Body {
    fn len(&self) -> u64 {
        match self {
            Body::None => 0,
            Body::Literal { bytes, .. } => bytes.len() as u64,
            Body::Filler(n) => *n,
            Body::File { len, .. } => *len,
        }
    }

    async fn next_chunk(&mut self, take: usize) -> std::io::Result<Vec<u8>> {
        match self {
            Body::None => Ok(Vec::new()),
            Body::Literal { bytes, pos } => {
                let end = (*pos + take).min(bytes.len());
                let chunk = bytes[*pos..end].to_vec();
                *pos = end;
                Ok(chunk)
            }
            Body::Filler(_) => Ok(rand::thread_rng()
                .sample_iter(&Alphanumeric)
                .take(take)
                .collect()),
            Body::File { file, .. } => {
                let mut chunk = vec![0u8; take];
                let mut read = 0;
                while read < take {
                    let n = file.read(&mut chunk[read..]).await?;
                    if n == 0 {
                        break;
                    }
                    read += n;
                }
                chunk.truncate(read);
                if read == 0 && take > 0 {
                    return Err(std::io::Error::new(
                        std::io::ErrorKind::UnexpectedEof,
                        "file shrank while being served",
                    ));
                }
                Ok(chunk)
            }
        }
    }
}

/// Serialize the status line and headers. `Server` and `Content-Length`
/// are filled in unless the spec supplies its own.
fn build_head(spec: &ResponseSpec, body_len: u64) -> Vec<u8> {
    let mut head = Vec::with_capacity(256);
    head.extend_from_slice(b"HTTP/1.1 ");
    head.extend_from_slice(spec.status.to_string().as_bytes());
    head.push(b' ');
    match &spec.reason {
        Some(reason) => head.extend_from_slice(reason),
        None => head.extend_from_slice(reason_phrase(spec.status).as_bytes()),
    }
    head.extend_from_slice(b"\r\n");

    let has = |name: &str| {
        spec.headers
            .iter()
            .any(|(k, _)| k.eq_ignore_ascii_case(name.as_bytes()))
    };

    if !has("server") {
        head.extend_from_slice(
            format!("Server: wirecraft/{}\r\n", env!("CARGO_PKG_VERSION")).as_bytes(),
        );
    }
    if spec.status != 101 && !has("content-length") {
        head.extend_from_slice(format!("Content-Length: {}\r\n", body_len).as_bytes());
    }
    for (k, v) in &spec.headers {
        head.extend_from_slice(k);
        head.extend_from_slice(b": ");
        head.extend_from_slice(v);
        head.extend_from_slice(b"\r\n");
    }
    head.extend_from_slice(b"\r\n");
    head
}

fn reason_phrase(status: u16) -> &'static str {
    match status {
        100 => "Continue",
        101 => "Switching Protocols",
        200 => "OK",
        201 => "Created",
        202 => "Accepted",
        204 => "No Content",
        301 => "Moved Permanently",
        302 => "Found",
        304 => "Not Modified",
        400 => "Bad Request",
        401 => "Unauthorized",
        403 => "Forbidden",
        404 => "Not Found",
        418 => "I'm a teapot",
        500 => "Internal Server Error",
        502 => "Bad Gateway",
        503 => "Service Unavailable",
        800 => "Daemon error",
        _ => "Unknown",
    }
}

impl ResponseSpec {
    /// The daemon-private sentinel response: status 800 with the
    /// rejection message as reason phrase and body.
    pub fn sentinel(msg: &str) -> Self {
        Self {
            status: 800,
            reason: Some(msg.as_bytes().to_vec()),
            headers: Vec::new(),
            body: Some(ValueSpec::Literal(msg.as_bytes().to_vec())),
            actions: Vec::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::spec::parse;

    fn response(input: &str) -> ResponseSpec {
        match parse(input).unwrap() {
            Spec::Response(r) => r,
            other => panic!("expected response spec, got {:?}", other),
        }
    }

    #[test]
    fn head_contains_status_and_lengths() {
        let head = build_head(&response("200:b'hello'"), 5);
        let text = String::from_utf8(head).unwrap();
        assert!(text.starts_with("HTTP/1.1 200 OK\r\n"));
        assert!(text.contains("Content-Length: 5\r\n"));
        assert!(text.contains("Server: wirecraft/"));
        assert!(text.ends_with("\r\n\r\n"));
    }

    #[test]
    fn user_headers_override_defaults() {
        let head = build_head(&response("200:h'Content-Length'='999'"), 0);
        let text = String::from_utf8(head).unwrap();
        assert!(text.contains("Content-Length: 999\r\n"));
        assert!(!text.contains("Content-Length: 0"));
    }

    #[test]
    fn reason_override_and_sentinel() {
        let head = build_head(&response("400:m'Go Away'"), 0);
        assert!(String::from_utf8(head).unwrap().starts_with("HTTP/1.1 400 Go Away\r\n"));

        let sentinel = ResponseSpec::sentinel("Crafting disabled");
        assert_eq!(sentinel.status, 800);
        let head = build_head(&sentinel, 17);
        assert!(String::from_utf8(head)
            .unwrap()
            .starts_with("HTTP/1.1 800 Crafting disabled\r\n"));
    }

    #[test]
    fn switching_protocols_has_no_content_length() {
        let head = build_head(&response("101"), 0);
        assert!(!String::from_utf8(head).unwrap().contains("Content-Length"));
    }

    #[tokio::test]
    async fn literal_body_chunks_in_order() {
        let mut body = Body::Literal {
            bytes: b"abcdef".to_vec(),
            pos: 0,
        };
        assert_eq!(body.next_chunk(4).await.unwrap(), b"abcd");
        assert_eq!(body.next_chunk(4).await.unwrap(), b"ef");
    }

    #[tokio::test]
    async fn filler_yields_requested_sizes() {
        let mut body = Body::Filler(10);
        assert_eq!(body.next_chunk(7).await.unwrap().len(), 7);
        assert_eq!(body.next_chunk(3).await.unwrap().len(), 3);
    }
}
