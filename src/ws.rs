//! RFC 6455 WebSocket upgrade handshake and frame codec.
//!
//! Frames are parsed from the connection's buffered byte stream, never from
//! the socket directly, so an incomplete frame simply waits for the next
//! readiness event. Client-to-server frames must be masked; server-to-client
//! frames are never masked.

use base64::{prelude::BASE64_STANDARD, Engine};
use sha1::{Digest, Sha1};

use crate::error::{GatewayError, Result};
use crate::http::{limits, ParsedRequest};

const WS_GUID: &str = "258EAFA5-E914-47DA-95CA-C5AB0DC85B11";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Opcode {
    Continuation,
    Text,
    Binary,
    Close,
    Ping,
    Pong,
}

impl Opcode {
    fn from_u8(v: u8) -> Result<Opcode> {
        match v {
            0x0 => Ok(Opcode::Continuation),
            0x1 => Ok(Opcode::Text),
            0x2 => Ok(Opcode::Binary),
            0x8 => Ok(Opcode::Close),
            0x9 => Ok(Opcode::Ping),
            0xA => Ok(Opcode::Pong),
            other => Err(GatewayError::Protocol(format!(
                "unknown WebSocket opcode {other:#x}"
            ))),
        }
    }

    fn to_u8(self) -> u8 {
        match self {
            Opcode::Continuation => 0x0,
            Opcode::Text => 0x1,
            Opcode::Binary => 0x2,
            Opcode::Close => 0x8,
            Opcode::Ping => 0x9,
            Opcode::Pong => 0xA,
        }
    }
}

#[derive(Debug)]
pub struct Frame {
    pub fin: bool,
    pub opcode: Opcode,
    pub payload: Vec<u8>,
}

/// True when the request asks for a WebSocket upgrade.
pub fn is_upgrade_request(req: &ParsedRequest) -> bool {
    let upgrade = req
        .header("Upgrade")
        .map(|v| v.eq_ignore_ascii_case("websocket"))
        .unwrap_or(false);
    upgrade && req.header("Sec-WebSocket-Key").is_some()
}

/// `base64(SHA1(key ++ GUID))` per RFC 6455 §4.2.2.
pub fn accept_key(sec_websocket_key: &str) -> String {
    let mut sha1 = Sha1::new();
    sha1.update(sec_websocket_key.as_bytes());
    sha1.update(WS_GUID.as_bytes());
    BASE64_STANDARD.encode(sha1.finalize())
}

/// The 101 handshake reply. Raw bytes: the switching-protocols response
/// carries no body and no Content-Length.
pub fn upgrade_response(sec_websocket_key: &str) -> Vec<u8> {
    format!(
        "HTTP/1.1 101 Switching Protocols\r\n\
         Upgrade: websocket\r\n\
         Connection: Upgrade\r\n\
         Sec-WebSocket-Accept: {}\r\n\r\n",
        accept_key(sec_websocket_key)
    )
    .into_bytes()
}

/// Parse one client frame from the front of `buf`.
///
/// Returns `Ok(None)` when the frame is incomplete, otherwise the frame and
/// the number of bytes it occupied. Unmasked client frames are a protocol
/// error.
pub fn parse_frame(buf: &[u8]) -> Result<Option<(Frame, usize)>> {
    if buf.len() < 2 {
        return Ok(None);
    }

    let fin = buf[0] & 0x80 != 0;
    let opcode = Opcode::from_u8(buf[0] & 0x0F)?;
    let masked = buf[1] & 0x80 != 0;
    let mut payload_len = (buf[1] & 0x7F) as usize;
    let mut offset = 2;

    if payload_len == 126 {
        if buf.len() < 4 {
            return Ok(None);
        }
        payload_len = u16::from_be_bytes([buf[2], buf[3]]) as usize;
        offset = 4;
    } else if payload_len == 127 {
        if buf.len() < 10 {
            return Ok(None);
        }
        let len = u64::from_be_bytes([
            buf[2], buf[3], buf[4], buf[5], buf[6], buf[7], buf[8], buf[9],
        ]);
        payload_len = usize::try_from(len)
            .map_err(|_| GatewayError::Protocol("frame length overflow".into()))?;
        offset = 10;
    }

    if payload_len > limits::MAX_BODY_LEN {
        return Err(GatewayError::Protocol("frame payload too large".into()));
    }

    if !masked {
        return Err(GatewayError::Protocol("client frame is not masked".into()));
    }

    if buf.len() < offset + 4 {
        return Ok(None);
    }
    let mask = [buf[offset], buf[offset + 1], buf[offset + 2], buf[offset + 3]];
    offset += 4;

    if buf.len() < offset + payload_len {
        return Ok(None);
    }

    let mut payload = buf[offset..offset + payload_len].to_vec();
    for (i, byte) in payload.iter_mut().enumerate() {
        *byte ^= mask[i % 4];
    }

    Ok(Some((
        Frame { fin, opcode, payload },
        offset + payload_len,
    )))
}

/// Build a final server-to-client frame (unmasked).
pub fn build_frame(opcode: Opcode, payload: &[u8]) -> Vec<u8> {
    let mut frame = Vec::with_capacity(10 + payload.len());
    frame.push(0x80 | opcode.to_u8());

    let len = payload.len();
    if len < 126 {
        frame.push(len as u8);
    } else if len <= u16::MAX as usize {
        frame.push(126);
        frame.extend_from_slice(&(len as u16).to_be_bytes());
    } else {
        frame.push(127);
        frame.extend_from_slice(&(len as u64).to_be_bytes());
    }

    frame.extend_from_slice(payload);
    frame
}

pub fn text_frame(text: &str) -> Vec<u8> {
    build_frame(Opcode::Text, text.as_bytes())
}
