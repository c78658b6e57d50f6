//! WebSocket handshake and frame assembly.
//!
//! # Responsibilities
//! - Compute the `Sec-WebSocket-Accept` token for the 101 handshake
//! - Serialize crafted frames, honoring mask/key/length overrides even
//!   where they violate the framing rules
//! - Parse incoming client frames so their payloads can be reflected
//!
//! # Design Decisions
//! - A `knone` key override sets the mask bit but sends no key bytes;
//!   an `l` override sends the declared length as-is. Neither is ever
//!   corrected: producing malformed frames is the point

use bytes::{BufMut, Bytes, BytesMut};
use rand::RngCore;
use sha1::{Digest, Sha1};

use crate::net::BufStream;
use crate::spec::{FrameKey, FrameSpec, ResponseSpec, WebSocketSpec};

/// GUID nonce fixed by RFC 6455.
const WS_GUID: &[u8] = b"258EAFA5-E914-47DA-95CA-C5AB0DC85B11";

/// Incoming payloads only carry spec strings; anything bigger is abuse.
const MAX_INBOUND_PAYLOAD: u64 = 16 * 1024 * 1024;

/// Compute the accept token for a client's `Sec-WebSocket-Key`.
pub fn accept_key(client_key: &str) -> String {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine as _;

    let mut hasher = Sha1::new();
    hasher.update(client_key.trim().as_bytes());
    hasher.update(WS_GUID);
    STANDARD.encode(hasher.finalize())
}

/// Build the 101 response for an upgrade request. Extra headers and
/// actions from the `ws` spec ride along on the handshake response.
pub fn upgrade_response(spec: &WebSocketSpec, client_key: &str) -> ResponseSpec {
    let mut headers: Vec<(Vec<u8>, Vec<u8>)> = vec![
        (b"Upgrade".to_vec(), b"websocket".to_vec()),
        (b"Connection".to_vec(), b"Upgrade".to_vec()),
        (
            b"Sec-WebSocket-Accept".to_vec(),
            accept_key(client_key).into_bytes(),
        ),
    ];
    headers.extend(spec.headers.iter().cloned());
    ResponseSpec {
        status: 101,
        reason: None,
        headers,
        body: None,
        actions: spec.actions.clone(),
    }
}

/// Serialize a crafted frame around an already-rendered payload.
///
/// The header says whatever the spec tells it to; the payload is masked
/// only when real key bytes end up on the wire.
pub fn build_frame(spec: &FrameSpec, payload: &[u8]) -> Vec<u8> {
    let masked = match spec.mask {
        Some(explicit) => explicit,
        None => matches!(spec.key, Some(FrameKey::Bytes(_))),
    };
    let key_bytes: Option<[u8; 4]> = if masked {
        match &spec.key {
            Some(FrameKey::None) => None,
            Some(FrameKey::Bytes(k)) => {
                let mut key = [0u8; 4];
                for (i, b) in key.iter_mut().enumerate() {
                    *b = k.get(i).copied().unwrap_or(0);
                }
                Some(key)
            }
            None => {
                let mut key = [0u8; 4];
                rand::thread_rng().fill_bytes(&mut key);
                Some(key)
            }
        }
    } else {
        None
    };

    let declared = spec.length_override.unwrap_or(payload.len() as u64);
    let mut frame = BytesMut::with_capacity(payload.len() + 14);
    frame.put_u8(0x80 | (spec.opcode & 0x0f));

    let mask_bit = if masked { 0x80 } else { 0 };
    if declared < 126 {
        frame.put_u8(mask_bit | declared as u8);
    } else if declared <= u16::MAX as u64 {
        frame.put_u8(mask_bit | 126);
        frame.put_u16(declared as u16);
    } else {
        frame.put_u8(mask_bit | 127);
        frame.put_u64(declared);
    }

    match key_bytes {
        Some(key) => {
            frame.put_slice(&key);
            for (i, b) in payload.iter().enumerate() {
                frame.put_u8(b ^ key[i % 4]);
            }
        }
        None => frame.put_slice(payload),
    }

    frame.to_vec()
}

/// A parsed incoming frame.
#[derive(Debug)]
pub struct Frame {
    pub fin: bool,
    pub opcode: u8,
    pub payload: Bytes,
}

impl Frame {
    /// Control opcode for a clean close.
    pub fn is_close(&self) -> bool {
        self.opcode == 0x8
    }
}

/// Read one frame off the connection, unmasking the payload if the peer
/// masked it. Declared lengths are trusted; a peer that lies about the
/// length stalls or truncates here, surfacing as an I/O error upstream.
pub async fn read_frame(reader: &mut BufStream) -> std::io::Result<Frame> {
    let head = reader.read_exact(2).await?;
    let fin = head[0] & 0x80 != 0;
    let opcode = head[0] & 0x0f;
    let masked = head[1] & 0x80 != 0;
    let mut len = (head[1] & 0x7f) as u64;
    if len == 126 {
        let ext = reader.read_exact(2).await?;
        len = u16::from_be_bytes([ext[0], ext[1]]) as u64;
    } else if len == 127 {
        let ext = reader.read_exact(8).await?;
        len = u64::from_be_bytes(ext[..8].try_into().expect("8 bytes read"));
    }

    // a peer can declare any length; don't let it size our allocation
    if len > MAX_INBOUND_PAYLOAD {
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            format!("frame declares {} byte payload", len),
        ));
    }

    let key = if masked {
        let k = reader.read_exact(4).await?;
        Some([k[0], k[1], k[2], k[3]])
    } else {
        None
    };

    let payload = reader.read_exact(len as usize).await?;
    let payload = match key {
        Some(key) => {
            let mut unmasked = BytesMut::with_capacity(payload.len());
            for (i, b) in payload.iter().enumerate() {
                unmasked.put_u8(b ^ key[i % 4]);
            }
            unmasked.freeze()
        }
        None => payload,
    };

    Ok(Frame {
        fin,
        opcode,
        payload,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::spec::parse;

    fn frame_spec(input: &str) -> FrameSpec {
        match parse(input).unwrap() {
            crate::spec::Spec::Frame(f) => f,
            other => panic!("expected frame spec, got {:?}", other),
        }
    }

    #[test]
    fn rfc_accept_key_example() {
        assert_eq!(
            accept_key("dGhlIHNhbXBsZSBub25jZQ=="),
            "s3pPLMBiTxaQ9kYGzzhZRbK+xOo="
        );
    }

    #[test]
    fn unmasked_text_frame() {
        let bytes = build_frame(&frame_spec("wf"), b"test");
        assert_eq!(bytes, vec![0x81, 0x04, b't', b'e', b's', b't']);
    }

    #[test]
    fn explicit_key_masks_payload() {
        let bytes = build_frame(&frame_spec(r"wf:k'\x00\x00\x00\x00'"), b"ab");
        // zero key: masked payload equals plaintext, key bytes on wire
        assert_eq!(bytes, vec![0x81, 0x82, 0, 0, 0, 0, b'a', b'b']);
    }

    #[test]
    fn knone_sets_mask_bit_without_key() {
        let bytes = build_frame(&frame_spec("wf:mask:knone"), b"x");
        assert_eq!(bytes, vec![0x81, 0x81, b'x']);
    }

    #[test]
    fn unmask_override_wins_over_key() {
        let bytes = build_frame(&frame_spec(r"wf:-mask:k'abcd'"), b"x");
        assert_eq!(bytes, vec![0x81, 0x01, b'x']);
    }

    #[test]
    fn length_override_sent_as_declared() {
        let bytes = build_frame(&frame_spec("wf:l10"), b"abc");
        assert_eq!(bytes[1], 10);
        assert_eq!(&bytes[2..], b"abc");
    }

    #[test]
    fn extended_lengths() {
        let payload = vec![0u8; 200];
        let bytes = build_frame(&frame_spec("wf"), &payload);
        assert_eq!(bytes[1], 126);
        assert_eq!(u16::from_be_bytes([bytes[2], bytes[3]]), 200);

        let bytes = build_frame(&frame_spec("wf:l70k"), b"");
        assert_eq!(bytes[1], 127);
        assert_eq!(
            u64::from_be_bytes(bytes[2..10].try_into().unwrap()),
            70 * 1024
        );
    }

    #[test]
    fn opcode_override() {
        let bytes = build_frame(&frame_spec("wf:c9"), b"");
        assert_eq!(bytes[0], 0x89);
    }
}
