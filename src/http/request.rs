//! Raw HTTP/1.x request-head parsing.
//!
//! # Responsibilities
//! - Read and split the request line
//! - Read headers, refusing names or values with control characters
//! - Validate Content-Length before any spec executes
//!
//! # Design Decisions
//! - Hand-rolled over the buffered stream: the daemon deliberately
//!   accepts and emits traffic no framework parser would
//! - Header *syntax* errors fail the connection; a bad Content-Length
//!   is its own error so the log can name it

use thiserror::Error;

use crate::net::BufStream;

/// A malformed request head.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("Invalid request line: {0}")]
    BadRequestLine(String),
    #[error("Invalid headers")]
    InvalidHeaders,
    #[error("Unparseable Content Length")]
    UnparseableContentLength,
}

/// Head-read failure: transport or protocol.
#[derive(Debug, Error)]
pub enum HeadError {
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
}

/// Parsed request line plus headers. The body, if any, is left on the
/// stream for the caller to consume.
#[derive(Debug, Clone)]
pub struct RequestHead {
    pub method: String,
    pub target: String,
    pub version: String,
    pub headers: Vec<(String, String)>,
}

impl RequestHead {
    /// First header with this name, case-insensitive.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// Declared body length. Absent means zero; non-numeric is the
    /// daemon's "Unparseable Content Length" protocol error.
    pub fn content_length(&self) -> Result<u64, ProtocolError> {
        match self.header("content-length") {
            None => Ok(0),
            Some(v) => v
                .trim()
                .parse()
                .map_err(|_| ProtocolError::UnparseableContentLength),
        }
    }

    /// True for a `Connection: upgrade` + `Upgrade: websocket` pair.
    pub fn is_websocket_upgrade(&self) -> bool {
        self.header("upgrade")
            .is_some_and(|v| v.eq_ignore_ascii_case("websocket"))
    }

    pub fn websocket_key(&self) -> Option<&str> {
        self.header("sec-websocket-key")
    }

    /// The HTTP/2 client connection preface starts with a pseudo-request
    /// the daemon recognizes and refuses.
    pub fn is_http2_preface(&self) -> bool {
        self.method == "PRI" && self.version == "HTTP/2.0"
    }
}

/// Read one request head. `Ok(None)` is a clean close before the first
/// byte of a request.
pub async fn read_head(io: &mut BufStream) -> Result<Option<RequestHead>, HeadError> {
    let Some(line) = io.read_line().await? else {
        return Ok(None);
    };
    if line.is_empty() {
        // tolerate a stray blank line before the request line
        return Box::pin(read_head(io)).await;
    }

    let mut parts = line.split_whitespace();
    let (Some(method), Some(target), Some(version)) = (parts.next(), parts.next(), parts.next())
    else {
        return Err(ProtocolError::BadRequestLine(line).into());
    };
    if parts.next().is_some() || !version.starts_with("HTTP/") {
        return Err(ProtocolError::BadRequestLine(line).into());
    }

    let mut head = RequestHead {
        method: method.to_string(),
        target: target.to_string(),
        version: version.to_string(),
        headers: Vec::new(),
    };

    loop {
        let Some(line) = io.read_line().await? else {
            return Err(ProtocolError::InvalidHeaders.into());
        };
        if line.is_empty() {
            return Ok(Some(head));
        }
        let Some((name, value)) = line.split_once(':') else {
            return Err(ProtocolError::InvalidHeaders.into());
        };
        let name = name.trim_end();
        let value = value.trim();
        if name.is_empty() || !name.bytes().all(is_token_byte) {
            return Err(ProtocolError::InvalidHeaders.into());
        }
        if value.bytes().any(|b| b.is_ascii_control()) {
            return Err(ProtocolError::InvalidHeaders.into());
        }
        head.headers.push((name.to_string(), value.to_string()));
    }
}

/// RFC 7230 token characters; anything else in a header name (a bare
/// tab, a space, a control byte) is invalid.
fn is_token_byte(b: u8) -> bool {
    b.is_ascii_alphanumeric()
        || matches!(
            b,
            b'!' | b'#'
                | b'$'
                | b'%'
                | b'&'
                | b'\''
                | b'*'
                | b'+'
                | b'-'
                | b'.'
                | b'^'
                | b'_'
                | b'`'
                | b'|'
                | b'~'
        )
}

/// Decode `%XX` escapes; malformed escapes pass through untouched.
/// Request paths carry spec strings, which use characters that strict
/// clients percent-encode.
pub fn percent_decode(input: &str) -> String {
    let hexdigit = |b: Option<&u8>| b.and_then(|&b| (b as char).to_digit(16));
    let bytes = input.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' {
            if let (Some(hi), Some(lo)) = (hexdigit(bytes.get(i + 1)), hexdigit(bytes.get(i + 2)))
            {
                out.push((hi * 16 + lo) as u8);
                i += 3;
                continue;
            }
        }
        out.push(bytes[i]);
        i += 1;
    }
    String::from_utf8_lossy(&out).into_owned()
}
