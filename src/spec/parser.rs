//! Recursive-descent parser for the crafting language.
//!
//! # Responsibilities
//! - Turn a specification string into a typed [`Spec`] in one
//!   left-to-right scan
//! - Decode quoting, backslash escapes and `\xNN` byte escapes
//! - Apply `k`/`m`/`g` unit multipliers to numeric literals
//!
//! # Design Decisions
//! - Purely syntactic: no filesystem access, no sandbox or size checks
//! - Colons separate clauses, but a colon inside a quoted value does not
//! - Errors carry the offending fragment so the log can show it

use thiserror::Error;

use super::ast::{
    Action, ActionKind, FrameKey, FramePayload, FrameSpec, Offset, PauseDuration, RequestSpec,
    ResponseSpec, Spec, ValueSpec, WebSocketSpec,
};

/// A malformed specification string.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("{message} at \"{fragment}\"")]
pub struct ParseError {
    /// The part of the input the parser was looking at.
    pub fragment: String,
    pub message: String,
}

/// Parse a complete specification string.
pub fn parse(input: &str) -> Result<Spec, ParseError> {
    let mut c = Cursor::new(input.trim());
    let spec = c.parse_spec()?;
    if !c.at_end() {
        return Err(c.err("trailing input"));
    }
    Ok(spec)
}

struct Cursor<'a> {
    input: &'a str,
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn new(input: &'a str) -> Self {
        Self { input, pos: 0 }
    }

    fn rest(&self) -> &'a str {
        &self.input[self.pos..]
    }

    fn at_end(&self) -> bool {
        self.pos >= self.input.len()
    }

    fn peek(&self) -> Option<u8> {
        self.input.as_bytes().get(self.pos).copied()
    }

    fn bump(&mut self) -> Option<u8> {
        let b = self.peek()?;
        self.pos += 1;
        Some(b)
    }

    fn eat(&mut self, b: u8) -> bool {
        if self.peek() == Some(b) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn eat_str(&mut self, s: &str) -> bool {
        if self.rest().starts_with(s) {
            self.pos += s.len();
            true
        } else {
            false
        }
    }

    fn err(&self, message: impl Into<String>) -> ParseError {
        let fragment: String = self.rest().chars().take(24).collect();
        ParseError {
            fragment: if fragment.is_empty() {
                "<end of spec>".to_string()
            } else {
                fragment
            },
            message: message.into(),
        }
    }

    // ---- entry points ----------------------------------------------------

    fn parse_spec(&mut self) -> Result<Spec, ParseError> {
        match self.peek() {
            None => Err(self.err("empty specification")),
            Some(b'=') => {
                self.bump();
                let name = self.rest().to_string();
                self.pos = self.input.len();
                if name.is_empty() || name.contains(':') {
                    Err(self.err("invalid spec name"))
                } else {
                    Ok(Spec::NamedRef(name))
                }
            }
            Some(b'0'..=b'9') => self.parse_response().map(Spec::Response),
            Some(_) => {
                let verb = self.take_while(|b| b.is_ascii_alphabetic());
                match verb {
                    "" => Err(self.err("expected status code or verb")),
                    "ws" => self.parse_websocket().map(Spec::WebSocket),
                    "wf" => self.parse_frame().map(Spec::Frame),
                    _ => {
                        let verb = verb.to_string();
                        self.parse_request(verb).map(Spec::Request)
                    }
                }
            }
        }
    }

    fn parse_response(&mut self) -> Result<ResponseSpec, ParseError> {
        let status = self.plain_number()?;
        if !(100..=999).contains(&status) {
            return Err(self.err(format!("invalid status code {}", status)));
        }
        let mut spec = ResponseSpec {
            status: status as u16,
            ..Default::default()
        };
        while self.eat(b':') {
            self.response_directive(&mut spec)?;
        }
        Ok(spec)
    }

    fn parse_websocket(&mut self) -> Result<WebSocketSpec, ParseError> {
        let mut spec = WebSocketSpec::default();
        let mut first = true;
        while self.eat(b':') {
            if first && matches!(self.peek(), Some(b'/') | Some(b'\'') | Some(b'"')) {
                spec.path = Some(self.parse_path()?);
            } else {
                match self.peek() {
                    Some(b'h') => {
                        self.bump();
                        let (k, v) = self.header_pair()?;
                        spec.headers.push((k, v));
                    }
                    _ => {
                        let action = self.action_directive()?;
                        spec.actions.push(action);
                    }
                }
            }
            first = false;
        }
        Ok(spec)
    }

    fn parse_frame(&mut self) -> Result<FrameSpec, ParseError> {
        let mut spec = FrameSpec::default();
        while self.eat(b':') {
            if self.eat_str("-mask") {
                spec.mask = Some(false);
            } else if self.eat_str("mask") {
                spec.mask = Some(true);
            } else {
                match self.peek() {
                    Some(b'b') => {
                        self.bump();
                        let value = self.parse_value()?;
                        self.set_frame_payload(&mut spec, FramePayload::Value(value))?;
                    }
                    Some(b'f') => {
                        self.bump();
                        let value = self.parse_value()?;
                        let ValueSpec::Literal(bytes) = value else {
                            return Err(self.err("crafted payload must be a quoted spec"));
                        };
                        self.set_frame_payload(&mut spec, FramePayload::Crafted(bytes))?;
                    }
                    Some(b'c') => {
                        self.bump();
                        let code = self.plain_number()?;
                        if code > 0xf {
                            return Err(self.err("opcode out of range"));
                        }
                        spec.opcode = code as u8;
                    }
                    Some(b'l') => {
                        self.bump();
                        spec.length_override = Some(self.number_with_unit()?);
                    }
                    Some(b'k') => {
                        self.bump();
                        spec.key = Some(if self.eat_str("none") {
                            FrameKey::None
                        } else {
                            match self.parse_value()? {
                                ValueSpec::Literal(bytes) => FrameKey::Bytes(bytes),
                                _ => return Err(self.err("masking key must be literal bytes")),
                            }
                        });
                    }
                    _ => {
                        let action = self.action_directive()?;
                        spec.actions.push(action);
                    }
                }
            }
        }
        Ok(spec)
    }

    fn parse_request(&mut self, method: String) -> Result<RequestSpec, ParseError> {
        if !self.eat(b':') {
            return Err(self.err("expected path after request verb"));
        }
        let path = self.parse_path()?;
        let mut spec = RequestSpec {
            method,
            path,
            headers: Vec::new(),
            body: None,
            actions: Vec::new(),
        };
        while self.eat(b':') {
            match self.peek() {
                Some(b'b') => {
                    self.bump();
                    let value = self.parse_value()?;
                    if spec.body.replace(value).is_some() {
                        return Err(self.err("duplicate body clause"));
                    }
                }
                Some(b'h') => {
                    self.bump();
                    let (k, v) = self.header_pair()?;
                    spec.headers.push((k, v));
                }
                _ => {
                    let action = self.action_directive()?;
                    spec.actions.push(action);
                }
            }
        }
        Ok(spec)
    }

    // ---- directives ------------------------------------------------------

    fn response_directive(&mut self, spec: &mut ResponseSpec) -> Result<(), ParseError> {
        match self.peek() {
            None => Err(self.err("empty clause")),
            Some(b'b') => {
                self.bump();
                let value = self.parse_value()?;
                if spec.body.replace(value).is_some() {
                    return Err(self.err("duplicate body clause"));
                }
                Ok(())
            }
            Some(b'h') => {
                self.bump();
                let (k, v) = self.header_pair()?;
                spec.headers.push((k, v));
                Ok(())
            }
            Some(b'm') => {
                self.bump();
                let value = self.parse_value()?;
                let ValueSpec::Literal(bytes) = value else {
                    return Err(self.err("reason message must be literal"));
                };
                if spec.reason.replace(bytes).is_some() {
                    return Err(self.err("duplicate reason clause"));
                }
                Ok(())
            }
            Some(_) => {
                let action = self.action_directive()?;
                spec.actions.push(action);
                Ok(())
            }
        }
    }

    /// `i<off>,<value>` / `p<off>,<secs|f>` / `d<off>` / `da`.
    fn action_directive(&mut self) -> Result<Action, ParseError> {
        match self.peek() {
            Some(b'i') => {
                self.bump();
                let offset = self.parse_offset()?;
                if !self.eat(b',') {
                    return Err(self.err("expected ',' after inject offset"));
                }
                let ValueSpec::Literal(bytes) = self.parse_value()? else {
                    return Err(self.err("inject value must be literal bytes"));
                };
                Ok(Action {
                    offset,
                    kind: ActionKind::Inject(bytes),
                })
            }
            Some(b'p') => {
                self.bump();
                let offset = self.parse_offset()?;
                if !self.eat(b',') {
                    return Err(self.err("expected ',' after pause offset"));
                }
                let duration = if self.eat(b'f') {
                    PauseDuration::Forever
                } else {
                    PauseDuration::Secs(self.plain_number()?)
                };
                Ok(Action {
                    offset,
                    kind: ActionKind::Pause(duration),
                })
            }
            Some(b'd') => {
                self.bump();
                let offset = self.parse_offset()?;
                Ok(Action {
                    offset,
                    kind: ActionKind::Disconnect,
                })
            }
            _ => Err(self.err("unknown directive")),
        }
    }

    fn header_pair(&mut self) -> Result<(Vec<u8>, Vec<u8>), ParseError> {
        let ValueSpec::Literal(k) = self.parse_value()? else {
            return Err(self.err("header name must be literal"));
        };
        if !self.eat(b'=') {
            return Err(self.err("expected '=' between header name and value"));
        }
        let ValueSpec::Literal(v) = self.parse_value()? else {
            return Err(self.err("header value must be literal"));
        };
        Ok((k, v))
    }

    fn set_frame_payload(
        &self,
        spec: &mut FrameSpec,
        payload: FramePayload,
    ) -> Result<(), ParseError> {
        if spec.payload.replace(payload).is_some() {
            return Err(self.err("duplicate payload clause"));
        }
        Ok(())
    }

    // ---- terminals -------------------------------------------------------

    fn take_while(&mut self, pred: impl Fn(u8) -> bool) -> &'a str {
        let start = self.pos;
        while let Some(b) = self.peek() {
            if !pred(b) {
                break;
            }
            self.pos += 1;
        }
        &self.input[start..self.pos]
    }

    /// A value: quoted literal (optional `b` prefix), `@N` filler or
    /// `<path` file reference.
    fn parse_value(&mut self) -> Result<ValueSpec, ParseError> {
        match self.peek() {
            Some(b'\'') | Some(b'"') => {
                let raw = self.quoted()?;
                Ok(ValueSpec::Literal(self.unescape(raw)?))
            }
            Some(b'b')
                if matches!(
                    self.input.as_bytes().get(self.pos + 1),
                    Some(b'\'') | Some(b'"')
                ) =>
            {
                self.bump();
                let raw = self.quoted()?;
                Ok(ValueSpec::Literal(self.unescape(raw)?))
            }
            Some(b'@') => {
                self.bump();
                Ok(ValueSpec::Filler(self.number_with_unit()?))
            }
            Some(b'<') => {
                self.bump();
                let path = match self.peek() {
                    Some(b'\'') | Some(b'"') => {
                        let raw = self.quoted()?;
                        let bytes = self.unescape(raw)?;
                        String::from_utf8(bytes)
                            .map_err(|_| self.err("file path must be valid UTF-8"))?
                    }
                    _ => self
                        .take_while(|b| !matches!(b, b':' | b',' | b'='))
                        .to_string(),
                };
                if path.is_empty() {
                    return Err(self.err("empty file path"));
                }
                Ok(ValueSpec::File(path))
            }
            _ => Err(self.err("expected value")),
        }
    }

    /// A request path: quoted value or bare token up to the next clause.
    fn parse_path(&mut self) -> Result<String, ParseError> {
        match self.peek() {
            Some(b'\'') | Some(b'"') => {
                let raw = self.quoted()?;
                let bytes = self.unescape(raw)?;
                String::from_utf8(bytes).map_err(|_| self.err("path must be valid UTF-8"))
            }
            _ => {
                let path = self.take_while(|b| b != b':').to_string();
                if path.is_empty() {
                    Err(self.err("expected path"))
                } else {
                    Ok(path)
                }
            }
        }
    }

    /// The raw interior of a quoted token; escapes are left in place.
    fn quoted(&mut self) -> Result<&'a str, ParseError> {
        let delim = self.bump().expect("caller checked delimiter");
        let start = self.pos;
        loop {
            match self.bump() {
                None => return Err(self.err("unterminated string literal")),
                Some(b'\\') => {
                    // keep the escape for unescape(); skip its argument
                    self.bump();
                }
                Some(b) if b == delim => {
                    return Ok(&self.input[start..self.pos - 1]);
                }
                Some(_) => {}
            }
        }
    }

    fn unescape(&self, raw: &str) -> Result<Vec<u8>, ParseError> {
        let mut out = Vec::with_capacity(raw.len());
        let mut bytes = raw.bytes();
        while let Some(b) = bytes.next() {
            if b != b'\\' {
                out.push(b);
                continue;
            }
            match bytes.next() {
                Some(b'n') => out.push(b'\n'),
                Some(b'r') => out.push(b'\r'),
                Some(b't') => out.push(b'\t'),
                Some(b'0') => out.push(0),
                Some(b'\\') => out.push(b'\\'),
                Some(b'\'') => out.push(b'\''),
                Some(b'"') => out.push(b'"'),
                Some(b'x') => {
                    let digit = |b: Option<u8>| b.and_then(|b| (b as char).to_digit(16));
                    let (Some(hi), Some(lo)) = (digit(bytes.next()), digit(bytes.next())) else {
                        return Err(self.err("invalid \\x escape"));
                    };
                    out.push((hi * 16 + lo) as u8);
                }
                Some(other) => {
                    return Err(self.err(format!("invalid escape \\{}", other as char)));
                }
                None => return Err(self.err("dangling backslash")),
            }
        }
        Ok(out)
    }

    /// Digits with an optional `b`/`k`/`m`/`g` unit suffix.
    fn number_with_unit(&mut self) -> Result<u64, ParseError> {
        let n = self.plain_number()?;
        let mult: u64 = match self.peek() {
            Some(b'b') => 1,
            Some(b'k') => 1024,
            Some(b'm') => 1024 * 1024,
            Some(b'g') => 1024 * 1024 * 1024,
            _ => return Ok(n),
        };
        self.bump();
        n.checked_mul(mult)
            .ok_or_else(|| self.err("size overflows"))
    }

    fn plain_number(&mut self) -> Result<u64, ParseError> {
        let digits = self.take_while(|b| b.is_ascii_digit());
        if digits.is_empty() {
            return Err(self.err("expected number"));
        }
        digits
            .parse()
            .map_err(|_| self.err(format!("number {} out of range", digits)))
    }

    fn parse_offset(&mut self) -> Result<Offset, ParseError> {
        if self.eat(b'a') {
            Ok(Offset::After)
        } else {
            Ok(Offset::Bytes(self.number_with_unit()?))
        }
    }
}
