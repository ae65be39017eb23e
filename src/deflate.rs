//! Per-message deflate (RFC 7692)
//!
//! Compression contexts are raw deflate streams flushed with an empty
//! stored block; the trailing `0x00 0x00 0xFF 0xFF` is stripped on the wire
//! and restored before inflating. Context takeover is modelled explicitly:
//! each context is reset per message and primed with the retained sliding
//! window as a preset dictionary, which keeps the compressor state
//! reconstructible. The broadcast path relies on that property.

use flate2::{Compress, Compression, Decompress, FlushCompress, FlushDecompress, Status};

use crate::error::{Error, Result};

/// Bytes removed after compression and restored before decompression
const DEFLATE_TAIL: [u8; 4] = [0x00, 0x00, 0xff, 0xff];

/// Smallest negotiable LZ77 window (256 bytes)
pub const MIN_WINDOW_BITS: u8 = 8;

/// Largest negotiable LZ77 window (32KB)
pub const MAX_WINDOW_BITS: u8 = 15;

/// Negotiated per-message deflate parameters
///
/// Produced by the handshake layer; the engine only consumes them. The
/// `no_context_takeover` bits from the wire are represented by their
/// negations here.
#[derive(Debug, Clone)]
pub struct PermessageDeflate {
    /// Whether the extension was negotiated at all
    pub enabled: bool,
    /// Server may retain its compression window across messages
    pub server_context_takeover: bool,
    /// Client may retain its compression window across messages
    pub client_context_takeover: bool,
    /// Negotiated server window bits (8-15)
    pub server_max_window_bits: u8,
    /// Negotiated client window bits (8-15)
    pub client_max_window_bits: u8,
    /// Payloads below this size are sent uncompressed
    pub threshold: usize,
    /// Deflate compression level (0-9)
    pub level: u32,
}

impl Default for PermessageDeflate {
    fn default() -> Self {
        Self {
            enabled: false,
            server_context_takeover: true,
            client_context_takeover: true,
            server_max_window_bits: MAX_WINDOW_BITS,
            client_max_window_bits: MAX_WINDOW_BITS,
            threshold: 512,
            level: 6,
        }
    }
}

impl PermessageDeflate {
    /// Parameters with the extension switched on and every default kept
    pub fn enabled() -> Self {
        Self {
            enabled: true,
            ..Self::default()
        }
    }

    /// Takeover flag governing the dictionary for inbound messages
    pub(crate) fn recv_takeover(&self, server: bool) -> bool {
        if server {
            self.server_context_takeover
        } else {
            self.client_context_takeover
        }
    }

    /// Takeover flag governing the dictionary for outbound messages
    ///
    /// Mirrors the read side with the peer's flag: each side's send window
    /// is what the other will use to decompress.
    pub(crate) fn send_takeover(&self, server: bool) -> bool {
        if server {
            self.client_context_takeover
        } else {
            self.server_context_takeover
        }
    }

    /// Window bits bounding the inbound sliding window
    pub(crate) fn recv_window_bits(&self, server: bool) -> u8 {
        if server {
            self.server_max_window_bits
        } else {
            self.client_max_window_bits
        }
    }

    /// Window bits bounding the outbound sliding window
    pub(crate) fn send_window_bits(&self, server: bool) -> u8 {
        if server {
            self.client_max_window_bits
        } else {
            self.server_max_window_bits
        }
    }
}

/// Clamp negotiated window bits to what zlib accepts for raw deflate
///
/// zlib cannot produce raw deflate with a 256-byte window; a negotiated 8
/// is promoted to 9 for the codec context while the sliding window keeps
/// the negotiated bound.
fn codec_window_bits(bits: u8) -> u8 {
    bits.clamp(9, MAX_WINDOW_BITS)
}

/// Trailing uncompressed history retained as the next preset dictionary
///
/// Bounded by 2^window_bits; disabled windows discard everything written to
/// them and never yield a dictionary.
#[derive(Debug)]
pub struct SlidingWindow {
    enabled: bool,
    size: usize,
    dict: Vec<u8>,
}

impl SlidingWindow {
    /// Create a window backed by `buf` (usually drawn from a pool)
    pub fn new(enabled: bool, window_bits: u8, mut buf: Vec<u8>) -> Self {
        buf.clear();
        Self {
            enabled,
            size: 1usize << window_bits.clamp(MIN_WINDOW_BITS, MAX_WINDOW_BITS),
            dict: buf,
        }
    }

    /// A window that retains nothing
    pub fn disabled() -> Self {
        Self {
            enabled: false,
            size: 0,
            dict: Vec::new(),
        }
    }

    /// Whether this side negotiated context takeover
    pub fn enabled(&self) -> bool {
        self.enabled
    }

    /// Current dictionary, if there is retained history to prime with
    pub fn dict(&self) -> Option<&[u8]> {
        (self.enabled && !self.dict.is_empty()).then_some(self.dict.as_slice())
    }

    /// Append uncompressed payload bytes, keeping only the trailing window
    pub fn write(&mut self, payload: &[u8]) {
        if !self.enabled {
            return;
        }
        if payload.len() >= self.size {
            self.dict.clear();
            self.dict.extend_from_slice(&payload[payload.len() - self.size..]);
            return;
        }
        let overflow = (self.dict.len() + payload.len()).saturating_sub(self.size);
        if overflow > 0 {
            self.dict.drain(..overflow);
        }
        self.dict.extend_from_slice(payload);
    }

    /// Give the backing buffer up, e.g. to return it to a pool
    pub fn into_buffer(self) -> Option<Vec<u8>> {
        self.enabled.then_some(self.dict)
    }
}

/// Per-connection compressor for outbound messages
pub struct Deflater {
    ctx: Compress,
}

impl Deflater {
    /// Create a compressor with the negotiated level and window bits
    pub fn new(level: u32, window_bits: u8) -> Self {
        Self {
            ctx: Compress::new_with_window_bits(
                Compression::new(level),
                false,
                codec_window_bits(window_bits),
            ),
        }
    }

    /// Compress one message payload, priming with `dict` when present
    ///
    /// The context is reset per message, so the same (payload, dict) input
    /// always yields the same bytes. The RFC 7692 tail is stripped.
    pub fn compress(&mut self, payload: &[u8], dict: Option<&[u8]>) -> Result<Vec<u8>> {
        self.ctx.reset();
        if let Some(dict) = dict {
            self.ctx
                .set_dictionary(dict)
                .map_err(|e| Error::Compression(e.to_string()))?;
        }

        let mut out = Vec::with_capacity(payload.len() / 2 + 64);
        let mut consumed = 0usize;
        loop {
            if out.len() == out.capacity() {
                out.reserve(out.capacity().max(256));
            }
            let before = self.ctx.total_in();
            let status = self
                .ctx
                .compress_vec(&payload[consumed..], &mut out, FlushCompress::Sync)
                .map_err(|e| Error::Compression(e.to_string()))?;
            consumed += (self.ctx.total_in() - before) as usize;

            match status {
                Status::StreamEnd => break,
                Status::Ok | Status::BufError => {
                    if consumed == payload.len() && out.len() < out.capacity() {
                        break;
                    }
                }
            }
        }

        if out.ends_with(&DEFLATE_TAIL) {
            out.truncate(out.len() - DEFLATE_TAIL.len());
        }
        Ok(out)
    }
}

/// Per-connection decompressor for inbound messages
pub struct Inflater {
    ctx: Decompress,
}

impl Inflater {
    /// Create a decompressor with the negotiated window bits
    pub fn new(window_bits: u8) -> Self {
        Self {
            ctx: Decompress::new_with_window_bits(false, codec_window_bits(window_bits)),
        }
    }

    /// Inflate one message payload, priming with `dict` when present
    ///
    /// Restores the RFC 7692 tail before inflating. Output larger than
    /// `limit` aborts with the message-size error.
    pub fn inflate(&mut self, payload: &[u8], dict: Option<&[u8]>, limit: usize) -> Result<Vec<u8>> {
        self.ctx.reset(false);
        if let Some(dict) = dict {
            self.ctx
                .set_dictionary(dict)
                .map_err(|e| Error::Compression(e.to_string()))?;
        }

        let mut input = Vec::with_capacity(payload.len() + DEFLATE_TAIL.len());
        input.extend_from_slice(payload);
        input.extend_from_slice(&DEFLATE_TAIL);

        let mut out = Vec::with_capacity((payload.len() * 2).clamp(256, 16 * 1024));
        let mut consumed = 0usize;
        loop {
            if out.len() > limit {
                return Err(Error::MessageTooLarge);
            }
            if out.len() == out.capacity() {
                out.reserve(out.capacity().max(4096));
            }
            let before = self.ctx.total_in();
            let status = self
                .ctx
                .decompress_vec(&input[consumed..], &mut out, FlushDecompress::Sync)
                .map_err(|e| Error::Compression(e.to_string()))?;
            consumed += (self.ctx.total_in() - before) as usize;

            match status {
                Status::StreamEnd => break,
                Status::Ok | Status::BufError => {
                    if consumed == input.len() && out.len() < out.capacity() {
                        break;
                    }
                }
            }
        }

        if out.len() > limit {
            return Err(Error::MessageTooLarge);
        }
        Ok(out)
    }
}
