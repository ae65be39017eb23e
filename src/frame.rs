//! RFC 6455 frame codec
//!
//! Header layout: two fixed bytes (FIN/RSV/opcode, MASK/length code),
//! a 0/2/8-byte big-endian extended length, and a 0/4-byte masking key.
//! Decoding validates everything the RFC requires of an endpoint: reserved
//! bits, reserved opcodes, control-frame shape, masking direction, and
//! minimal length encoding.

use std::io::Read;

use bytes::{BufMut, BytesMut};

use crate::error::{Error, Result};
use crate::mask::apply_mask;
use crate::{MAX_CONTROL_PAYLOAD, MEDIUM_PAYLOAD_MAX, SMALL_PAYLOAD_MAX};

/// WebSocket opcode
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum OpCode {
    /// Continuation frame
    Continuation = 0x0,
    /// Text frame
    Text = 0x1,
    /// Binary frame
    Binary = 0x2,
    /// Connection close
    Close = 0x8,
    /// Ping
    Ping = 0x9,
    /// Pong
    Pong = 0xA,
}

impl OpCode {
    /// Parse an opcode nibble; reserved values return `None`
    #[inline]
    pub fn from_u8(byte: u8) -> Option<Self> {
        match byte {
            0x0 => Some(OpCode::Continuation),
            0x1 => Some(OpCode::Text),
            0x2 => Some(OpCode::Binary),
            0x8 => Some(OpCode::Close),
            0x9 => Some(OpCode::Ping),
            0xA => Some(OpCode::Pong),
            _ => None,
        }
    }

    /// Check if this is a control frame
    #[inline]
    pub fn is_control(&self) -> bool {
        (*self as u8) >= 0x8
    }

    /// Check if this is a data frame
    #[inline]
    pub fn is_data(&self) -> bool {
        (*self as u8) <= 0x2
    }
}

/// A decoded WebSocket frame header
#[derive(Debug, Clone)]
pub struct FrameHeader {
    /// Final fragment flag
    pub fin: bool,
    /// Per-message deflate flag on the first data frame of a message
    pub rsv1: bool,
    /// Frame opcode
    pub opcode: OpCode,
    /// Payload length declared by the header
    pub payload_len: u64,
    /// Masking key, present iff the MASK bit was set
    pub key: Option<[u8; 4]>,
}

/// Frame decoder with the connection's validation parameters baked in
#[derive(Debug, Clone)]
pub struct Codec {
    /// Server endpoints require inbound masking; clients forbid it
    server: bool,
    /// Whether RSV1 may appear on first data frames
    deflate: bool,
    /// Frames declaring more payload than this are rejected with 1009
    max_payload: usize,
}

impl Codec {
    /// Create a codec for one side of a connection
    pub fn new(server: bool, deflate: bool, max_payload: usize) -> Self {
        Self {
            server,
            deflate,
            max_payload,
        }
    }

    /// Read and validate one frame header
    pub fn decode_header<R: Read>(&self, r: &mut R) -> Result<FrameHeader> {
        let mut fixed = [0u8; 2];
        r.read_exact(&mut fixed)?;
        let (b0, b1) = (fixed[0], fixed[1]);

        let fin = b0 & 0x80 != 0;
        let rsv1 = b0 & 0x40 != 0;
        if b0 & 0x30 != 0 {
            return Err(Error::Protocol("RSV2 and RSV3 must be 0"));
        }

        let opcode = OpCode::from_u8(b0 & 0x0F).ok_or(Error::Protocol("reserved opcode"))?;

        if rsv1 {
            if !self.deflate {
                return Err(Error::Protocol("RSV1 set without negotiated extension"));
            }
            if opcode.is_control() {
                return Err(Error::Protocol("RSV1 on control frame"));
            }
            if opcode == OpCode::Continuation {
                return Err(Error::Protocol("RSV1 on non-first fragment"));
            }
        }

        if opcode.is_control() && !fin {
            return Err(Error::Protocol("fragmented control frame"));
        }

        let masked = b1 & 0x80 != 0;
        if self.server && !masked {
            return Err(Error::Protocol("client frames must be masked"));
        }
        if !self.server && masked {
            return Err(Error::Protocol("server frames must not be masked"));
        }

        let payload_len: u64 = match b1 & 0x7F {
            len @ 0..=125 => len as u64,
            126 => {
                let mut ext = [0u8; 2];
                r.read_exact(&mut ext)?;
                let len = u16::from_be_bytes(ext) as u64;
                if len <= SMALL_PAYLOAD_MAX as u64 {
                    return Err(Error::Protocol("non-minimal length encoding"));
                }
                len
            }
            _ => {
                let mut ext = [0u8; 8];
                r.read_exact(&mut ext)?;
                let len = u64::from_be_bytes(ext);
                if len >> 63 != 0 {
                    return Err(Error::Protocol("length high bit must be 0"));
                }
                if len <= MEDIUM_PAYLOAD_MAX as u64 {
                    return Err(Error::Protocol("non-minimal length encoding"));
                }
                len
            }
        };

        if opcode.is_control() && payload_len > MAX_CONTROL_PAYLOAD as u64 {
            return Err(Error::Protocol("control frame payload exceeds 125 bytes"));
        }
        if payload_len > self.max_payload as u64 {
            return Err(Error::MessageTooLarge);
        }

        let key = if masked {
            let mut key = [0u8; 4];
            r.read_exact(&mut key)?;
            Some(key)
        } else {
            None
        };

        Ok(FrameHeader {
            fin,
            rsv1,
            opcode,
            payload_len,
            key,
        })
    }
}

/// Append an encoded frame header to `buf`
pub fn encode_header(
    buf: &mut BytesMut,
    opcode: OpCode,
    payload_len: usize,
    fin: bool,
    rsv1: bool,
    key: Option<[u8; 4]>,
) {
    let mut b0 = opcode as u8;
    if fin {
        b0 |= 0x80;
    }
    if rsv1 {
        b0 |= 0x40;
    }
    buf.put_u8(b0);

    let mask_bit = if key.is_some() { 0x80 } else { 0x00 };
    if payload_len <= SMALL_PAYLOAD_MAX {
        buf.put_u8(mask_bit | payload_len as u8);
    } else if payload_len <= MEDIUM_PAYLOAD_MAX {
        buf.put_u8(mask_bit | 126);
        buf.put_u16(payload_len as u16);
    } else {
        buf.put_u8(mask_bit | 127);
        buf.put_u64(payload_len as u64);
    }

    if let Some(key) = key {
        buf.put_slice(&key);
    }
}

/// Append a complete frame (header plus payload) to `buf`
///
/// When `key` is present the payload copy in `buf` is masked; the input
/// slice is left untouched.
pub fn encode_frame(
    buf: &mut BytesMut,
    opcode: OpCode,
    payload: &[u8],
    fin: bool,
    rsv1: bool,
    key: Option<[u8; 4]>,
) {
    buf.reserve(crate::MAX_FRAME_HEADER_SIZE + payload.len());
    encode_header(buf, opcode, payload.len(), fin, rsv1, key);

    let start = buf.len();
    buf.put_slice(payload);
    if let Some(key) = key {
        apply_mask(&mut buf[start..], key);
    }
}
