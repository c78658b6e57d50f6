//! Typed directive tree produced by the parser.
//!
//! A parsed specification is immutable and owned by the connection task
//! that parsed it. Directive kinds are a closed enum; the crafting engine
//! matches exhaustively, so a new kind is a compile error until every
//! consumer handles it.

use std::fmt;

/// Where a body or payload's bytes come from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ValueSpec {
    /// Literal bytes from a quoted or byte-quoted token.
    Literal(Vec<u8>),
    /// `@N` filler: N bytes of generated printable data.
    Filler(u64),
    /// `<path` file reference, resolved against the sandbox root at
    /// execution time. Stored as written; never touched by the parser.
    File(String),
}

impl ValueSpec {
    /// Declared size in bytes. File sizes are unknown until gate time.
    pub fn declared_len(&self) -> Option<u64> {
        match self {
            ValueSpec::Literal(bytes) => Some(bytes.len() as u64),
            ValueSpec::Filler(n) => Some(*n),
            ValueSpec::File(_) => None,
        }
    }
}

/// Byte position at which a wire action fires.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Offset {
    /// Absolute offset into the serialized message.
    Bytes(u64),
    /// After the final byte (`a`, as in `da` / `pa,5`).
    After,
}

/// How long a pause lasts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PauseDuration {
    Secs(u64),
    /// `f`: sleep until the peer gives up.
    Forever,
}

/// A timed or destructive side effect interleaved with emission.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ActionKind {
    Pause(PauseDuration),
    Disconnect,
    Inject(Vec<u8>),
}

/// An action bound to a byte offset.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Action {
    pub offset: Offset,
    pub kind: ActionKind,
}

/// An HTTP response to craft: `code[:directive]*`.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ResponseSpec {
    pub status: u16,
    /// `m` directive: overrides the reason phrase.
    pub reason: Option<Vec<u8>>,
    pub headers: Vec<(Vec<u8>, Vec<u8>)>,
    pub body: Option<ValueSpec>,
    pub actions: Vec<Action>,
}

/// A WebSocket upgrade to accept: `ws[:/path][:directive]*`.
///
/// Headers and actions apply to the 101 handshake response.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct WebSocketSpec {
    pub path: Option<String>,
    pub headers: Vec<(Vec<u8>, Vec<u8>)>,
    pub actions: Vec<Action>,
}

/// Masking-key override for a crafted frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FrameKey {
    /// `k'...'`: use exactly these key bytes.
    Bytes(Vec<u8>),
    /// `knone`: set no key bytes even if the mask bit says otherwise.
    None,
}

/// Payload of a crafted frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FramePayload {
    Value(ValueSpec),
    /// `f'...'`: the value is itself a spec string; its crafted bytes
    /// become the payload.
    Crafted(Vec<u8>),
}

/// A single WebSocket frame to craft: `wf[:directive]*`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FrameSpec {
    /// `c<int>`; defaults to 1 (text).
    pub opcode: u8,
    /// `mask` / `-mask`; `None` keeps the server default (unmasked).
    pub mask: Option<bool>,
    pub key: Option<FrameKey>,
    /// `l<int>`: declared payload length sent on the wire, whether or
    /// not it matches the actual payload.
    pub length_override: Option<u64>,
    pub payload: Option<FramePayload>,
    pub actions: Vec<Action>,
}

impl Default for FrameSpec {
    fn default() -> Self {
        Self {
            opcode: 1,
            mask: None,
            key: None,
            length_override: None,
            payload: None,
            actions: Vec::new(),
        }
    }
}

/// A client-style request spec: `get:/path[:directive]*`.
///
/// Part of the language for anchor files and reverse tooling; the daemon
/// itself never executes one.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestSpec {
    pub method: String,
    pub path: String,
    pub headers: Vec<(Vec<u8>, Vec<u8>)>,
    pub body: Option<ValueSpec>,
    pub actions: Vec<Action>,
}

/// Any parsed specification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Spec {
    Response(ResponseSpec),
    WebSocket(WebSocketSpec),
    Frame(FrameSpec),
    Request(RequestSpec),
    /// `=name`: reference to a server-side named spec.
    NamedRef(String),
}

impl Spec {
    /// True when executing this spec requires raw-crafting capability,
    /// i.e. anything beyond status, headers and a plain literal body.
    pub fn requires_crafting(&self) -> bool {
        match self {
            Spec::Response(r) => {
                !r.actions.is_empty()
                    || match &r.body {
                        None => false,
                        // A plain printable literal is an ordinary response;
                        // raw bytes, fillers and file reads are crafting.
                        Some(ValueSpec::Literal(b)) => !b.iter().all(|&c| {
                            c.is_ascii_graphic() || matches!(c, b' ' | b'\t' | b'\r' | b'\n')
                        }),
                        Some(_) => true,
                    }
            }
            Spec::WebSocket(w) => !w.actions.is_empty(),
            Spec::Frame(_) => true,
            Spec::Request(_) => false,
            Spec::NamedRef(_) => false,
        }
    }

    /// All actions attached to the spec, for policy checks.
    pub fn actions(&self) -> &[Action] {
        match self {
            Spec::Response(r) => &r.actions,
            Spec::WebSocket(w) => &w.actions,
            Spec::Frame(f) => &f.actions,
            Spec::Request(r) => &r.actions,
            Spec::NamedRef(_) => &[],
        }
    }
}

impl fmt::Display for Offset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Offset::Bytes(n) => write!(f, "{}", n),
            Offset::After => write!(f, "a"),
        }
    }
}
