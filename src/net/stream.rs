//! A connection stream that may be plaintext or TLS, and may switch
//! mid-connection.
//!
//! # Design Decisions
//! - One enum instead of trait objects so the dispatcher can take the
//!   plaintext stream back out for a deferred TLS handshake after a
//!   proxy CONNECT
//! - Abrupt teardown drops the TCP socket without a TLS close-notify,
//!   so the peer observes an unexpected end-of-stream

use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};

use bytes::{Buf, Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, ReadBuf};
use tokio::net::TcpStream;
use tokio_rustls::server::TlsStream;
use tokio_rustls::TlsAcceptor;

/// Either side of the TLS decision. All request parsing and crafting is
/// written against this type.
pub enum Stream {
    Plain(TcpStream),
    Tls(Box<TlsStream<TcpStream>>),
}

impl Stream {
    /// Run a server-side TLS handshake over the current transport.
    ///
    /// Only a plaintext stream can be upgraded; upgrading twice is a
    /// protocol bug and surfaces as `InvalidInput`.
    pub async fn upgrade_tls(self, acceptor: &TlsAcceptor) -> io::Result<Stream> {
        match self {
            Stream::Plain(tcp) => {
                let tls = acceptor.accept(tcp).await?;
                Ok(Stream::Tls(Box::new(tls)))
            }
            Stream::Tls(_) => Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "connection is already TLS",
            )),
        }
    }

    /// Tear the transport down without a graceful shutdown. For TLS this
    /// skips the close-notify alert entirely.
    pub fn abort(self) {
        match self {
            Stream::Plain(tcp) => drop(tcp),
            Stream::Tls(tls) => {
                let (tcp, _conn) = tls.into_inner();
                drop(tcp);
            }
        }
    }

    /// True once a TLS handshake has completed on this connection.
    pub fn is_tls(&self) -> bool {
        matches!(self, Stream::Tls(_))
    }

    /// Negotiated cipher suite as `(name, strength bits)`, if TLS.
    pub fn cipher_info(&self) -> Option<(String, u32)> {
        let Stream::Tls(tls) = self else { return None };
        let (_, conn) = tls.get_ref();
        let suite = conn.negotiated_cipher_suite()?;
        let name = format!("{:?}", suite.suite());
        let bits = if name.contains("AES_256") || name.contains("CHACHA20") {
            256
        } else if name.contains("AES_128") {
            128
        } else if name.contains("3DES") {
            112
        } else {
            0
        };
        Some((name, bits))
    }

    /// SNI name the client sent, if TLS.
    pub fn sni(&self) -> Option<String> {
        let Stream::Tls(tls) = self else { return None };
        let (_, conn) = tls.get_ref();
        conn.server_name().map(str::to_owned)
    }
}

/// Buffered wrapper around a [`Stream`].
///
/// Reads go through an internal buffer so leftover bytes survive across
/// keep-alive requests and WebSocket frames; writes bypass it. The
/// stream slot is an `Option` so a mid-connection abrupt disconnect can
/// consume the transport while the wrapper stays behind to report it.
pub struct BufStream {
    stream: Option<Stream>,
    buf: BytesMut,
}

/// Hard cap on a single head line; anything longer is not a request
/// we are willing to parse.
const MAX_LINE: usize = 16 * 1024;

impl BufStream {
    pub fn new(stream: Stream) -> Self {
        Self {
            stream: Some(stream),
            buf: BytesMut::with_capacity(4 * 1024),
        }
    }

    /// The underlying transport, for writing.
    pub fn stream_mut(&mut self) -> io::Result<&mut Stream> {
        self.stream
            .as_mut()
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotConnected, "connection torn down"))
    }

    pub fn stream(&self) -> Option<&Stream> {
        self.stream.as_ref()
    }

    /// Remove the transport, e.g. to abort it.
    pub fn take_stream(&mut self) -> Option<Stream> {
        self.stream.take()
    }

    pub fn is_open(&self) -> bool {
        self.stream.is_some()
    }

    /// Swap the plaintext transport for a TLS one (post-CONNECT upgrade).
    /// Any buffered plaintext bytes would predate the handshake, so they
    /// are dropped.
    pub async fn upgrade_tls(&mut self, acceptor: &TlsAcceptor) -> io::Result<()> {
        let stream = self
            .take_stream()
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotConnected, "connection torn down"))?;
        self.buf.clear();
        self.stream = Some(stream.upgrade_tls(acceptor).await?);
        Ok(())
    }

    /// Pull more bytes into the buffer. Returns 0 at EOF.
    async fn fill(&mut self) -> io::Result<usize> {
        let stream = self
            .stream
            .as_mut()
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotConnected, "connection torn down"))?;
        let n = stream.read_buf(&mut self.buf).await?;
        Ok(n)
    }

    /// Read one `\n`-terminated line, stripping the terminator and any
    /// trailing `\r`. `None` means the peer closed before sending a
    /// complete line.
    pub async fn read_line(&mut self) -> io::Result<Option<String>> {
        loop {
            if let Some(pos) = self.buf.iter().position(|&b| b == b'\n') {
                let mut line = self.buf.split_to(pos + 1);
                line.truncate(pos);
                if line.last() == Some(&b'\r') {
                    line.truncate(line.len() - 1);
                }
                return Ok(Some(String::from_utf8_lossy(&line).into_owned()));
            }
            if self.buf.len() > MAX_LINE {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidData,
                    "head line too long",
                ));
            }
            if self.fill().await? == 0 {
                return Ok(None);
            }
        }
    }

    /// Read exactly `n` bytes.
    pub async fn read_exact(&mut self, n: usize) -> io::Result<Bytes> {
        while self.buf.len() < n {
            if self.fill().await? == 0 {
                return Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "peer closed mid-read",
                ));
            }
        }
        Ok(self.buf.split_to(n).freeze())
    }

    /// Discard exactly `n` bytes (e.g. an uninteresting request body).
    pub async fn discard(&mut self, mut n: u64) -> io::Result<()> {
        while n > 0 {
            if self.buf.is_empty() && self.fill().await? == 0 {
                return Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "peer closed mid-body",
                ));
            }
            let take = self.buf.len().min(n.min(usize::MAX as u64) as usize);
            self.buf.advance(take);
            n -= take as u64;
        }
        Ok(())
    }
}

impl AsyncRead for Stream {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match &mut *self {
            Stream::Plain(s) => Pin::new(s).poll_read(cx, buf),
            Stream::Tls(s) => Pin::new(s).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for Stream {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match &mut *self {
            Stream::Plain(s) => Pin::new(s).poll_write(cx, buf),
            Stream::Tls(s) => Pin::new(s).poll_write(cx, buf),
        }
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match &mut *self {
            Stream::Plain(s) => Pin::new(s).poll_flush(cx),
            Stream::Tls(s) => Pin::new(s).poll_flush(cx),
        }
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match &mut *self {
            Stream::Plain(s) => Pin::new(s).poll_shutdown(cx),
            Stream::Tls(s) => Pin::new(s).poll_shutdown(cx),
        }
    }
}
