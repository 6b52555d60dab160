//! Device socket wire format: `[opcode: u8][optional JSON body]`.
//!
//! There is no length prefix. Only REGISTER carries a body, and a JSON body delimits itself, so
//! [`decode_next`] pulls whole frames out of a read buffer however the bytes were segmented.

use bytes::{Buf, BytesMut};
use serde::Deserialize;
use thiserror::Error;

/// Largest frame accepted from a client, opcode byte included.
pub const MAX_FRAME_LEN: usize = 4096;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Opcode {
    Ping,
    Pong,
    Register,
    Ack,
    /// Reserved, not handled by this version.
    Push,
    Error,
    Unknown(u8),
}

impl Opcode {
    pub fn from_byte(b: u8) -> Self {
        match b {
            0x01 => Opcode::Ping,
            0x02 => Opcode::Pong,
            0x03 => Opcode::Register,
            0x04 => Opcode::Ack,
            0x05 => Opcode::Push,
            0xFF => Opcode::Error,
            other => Opcode::Unknown(other),
        }
    }

    pub fn as_byte(self) -> u8 {
        match self {
            Opcode::Ping => 0x01,
            Opcode::Pong => 0x02,
            Opcode::Register => 0x03,
            Opcode::Ack => 0x04,
            Opcode::Push => 0x05,
            Opcode::Error => 0xFF,
            Opcode::Unknown(b) => b,
        }
    }

    /// Client frames with a JSON body after the opcode.
    pub fn carries_body(self) -> bool {
        self == Opcode::Register
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("frame exceeds {MAX_FRAME_LEN} bytes")]
    FrameTooLarge,
    #[error("unknown opcode 0x{0:02x}")]
    UnknownOpcode(u8),
    #[error("unsupported opcode 0x{0:02x}")]
    Unsupported(u8),
    #[error("connection already registered")]
    AlreadyRegistered,
}

/// JSON body carried after the opcode byte.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct WireMessage {
    #[serde(
        default,
        rename = "appId",
        alias = "app_id",
        deserialize_with = "crate::serde_u64_string::deserialize"
    )]
    pub app_id: u64,
    #[serde(default, alias = "deviceToken", alias = "device_token")]
    pub token: String,
    #[serde(default)]
    pub platform: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Body {
    Empty,
    Json(WireMessage),
    /// Body bytes that did not parse as a [`WireMessage`], kept verbatim.
    Raw(Vec<u8>),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub opcode: Opcode,
    pub body: Body,
}

impl Frame {
    /// Structured body, or an empty message when the body was absent or opaque.
    pub fn message(&self) -> WireMessage {
        match &self.body {
            Body::Json(m) => m.clone(),
            Body::Empty | Body::Raw(_) => WireMessage::default(),
        }
    }
}

/// Take the next complete frame off the front of `buf`. `Ok(None)` means more bytes are needed.
///
/// A REGISTER body that is not valid JSON has no end we can find, so it takes the rest of the
/// buffer as a raw body.
pub fn decode_next(buf: &mut BytesMut) -> Result<Option<Frame>, ProtocolError> {
    let Some(&op) = buf.first() else {
        return Ok(None);
    };
    let opcode = Opcode::from_byte(op);
    if !opcode.carries_body() {
        buf.advance(1);
        return Ok(Some(Frame {
            opcode,
            body: Body::Empty,
        }));
    }

    let mut values = serde_json::Deserializer::from_slice(&buf[1..]).into_iter::<serde_json::Value>();
    let (body, len) = match values.next() {
        Some(Ok(value)) => {
            let len = 1 + values.byte_offset();
            let body = match serde_json::from_value::<WireMessage>(value) {
                Ok(m) => Body::Json(m),
                Err(_) => Body::Raw(buf[1..len].to_vec()),
            };
            (body, len)
        }
        Some(Err(e)) if !e.is_eof() => (Body::Raw(buf[1..].to_vec()), buf.len()),
        _ if buf.len() > MAX_FRAME_LEN => return Err(ProtocolError::FrameTooLarge),
        _ => return Ok(None),
    };
    if len > MAX_FRAME_LEN {
        return Err(ProtocolError::FrameTooLarge);
    }
    buf.advance(len);
    Ok(Some(Frame { opcode, body }))
}

pub fn encode(opcode: Opcode, body: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(1 + body.len());
    out.push(opcode.as_byte());
    out.extend_from_slice(body);
    out
}

pub fn pong() -> Vec<u8> {
    encode(Opcode::Pong, &[])
}

pub fn ack(success: bool) -> Vec<u8> {
    encode(Opcode::Ack, &[u8::from(success)])
}

pub fn error(message: &str) -> Vec<u8> {
    encode(Opcode::Error, message.as_bytes())
}
