//! Write pipeline: frame assembly, compression, masking, async submission
//!
//! All wire output funnels through `emit_frame` under the write lock, so
//! concurrent writers can never interleave bytes inside a frame. Client
//! connections mask every frame with a fresh key; servers write payloads
//! straight from the caller's slice.

use std::collections::BTreeMap;
use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use parking_lot::Mutex;

use crate::conn::{Conn, WriteState};
use crate::deflate::Deflater;
use crate::error::{Error, Result};
use crate::frame::{encode_frame, encode_header, OpCode};
use crate::mask::generate_key;
use crate::MAX_CONTROL_PAYLOAD;

impl Conn {
    /// Send a single non-fragmented message
    ///
    /// Compresses when the extension is negotiated and the payload reaches
    /// the threshold. A transport failure tears the connection down and is
    /// returned to the caller.
    pub fn write_message(&self, opcode: OpCode, payload: &[u8]) -> Result<()> {
        if opcode.is_control() {
            return self.write_control(opcode, payload);
        }
        if self.is_closed() {
            return Err(self.stored_error());
        }
        if payload.len() > self.config.write_max_payload_size {
            return Err(Error::MessageTooLarge);
        }

        let mut state = self.write_state.lock();
        let res = self.write_data_frame(&mut state, opcode, payload);
        drop(state);
        if let Err(err) = &res {
            self.emit_error(err);
        }
        res
    }

    /// Send a ping control frame
    pub fn write_ping(&self, payload: &[u8]) -> Result<()> {
        self.write_control(OpCode::Ping, payload)
    }

    /// Send a pong control frame
    pub fn write_pong(&self, payload: &[u8]) -> Result<()> {
        self.write_control(OpCode::Pong, payload)
    }

    /// Enqueue a message on the per-connection work queue
    ///
    /// Never blocks beyond the enqueue itself; the callback observes the
    /// write's result from a worker thread. Submission order is delivery
    /// order unless parallelism was enabled in the configuration.
    pub fn write_async(
        self: &Arc<Self>,
        opcode: OpCode,
        payload: Bytes,
        callback: impl FnOnce(Result<()>) + Send + 'static,
    ) {
        let conn = Arc::clone(self);
        self.write_queue.push(Box::new(move || {
            let res = conn.write_message(opcode, &payload);
            callback(res);
        }));
    }

    fn write_control(&self, opcode: OpCode, payload: &[u8]) -> Result<()> {
        if payload.len() > MAX_CONTROL_PAYLOAD {
            return Err(Error::Protocol("control frame payload exceeds 125 bytes"));
        }
        if self.is_closed() {
            return Err(self.stored_error());
        }

        let mut state = self.write_state.lock();
        let res = self.emit_frame(&mut state.scratch, opcode, payload, false);
        drop(state);
        if let Err(err) = &res {
            self.emit_error(err);
        }
        res
    }

    /// Frame emission that skips the closed check; teardown uses this to
    /// get the close frame out after the flag is already set
    pub(crate) fn write_frame_raw(&self, opcode: OpCode, payload: &[u8]) -> Result<()> {
        let mut state = self.write_state.lock();
        self.emit_frame(&mut state.scratch, opcode, payload, false)
    }

    /// Compress if eligible, then emit one data frame
    fn write_data_frame(
        &self,
        state: &mut WriteState,
        opcode: OpCode,
        payload: &[u8],
    ) -> Result<()> {
        if payload.len() >= self.pd.threshold {
            let WriteState {
                deflater,
                window,
                scratch,
            } = state;
            if let Some(deflater) = deflater.as_mut() {
                let body = deflater.compress(payload, window.dict())?;
                window.write(payload);
                return self.emit_frame(scratch, opcode, &body, true);
            }
        }
        self.emit_frame(&mut state.scratch, opcode, payload, false)
    }

    /// Assemble and write one frame while the write lock is held
    pub(crate) fn emit_frame(
        &self,
        scratch: &mut BytesMut,
        opcode: OpCode,
        body: &[u8],
        rsv1: bool,
    ) -> Result<()> {
        scratch.clear();
        if self.role.is_server() {
            // Header and payload in two writes; the payload goes out from
            // the caller's slice untouched
            encode_header(scratch, opcode, body.len(), true, rsv1, None);
            self.transport.write_all(scratch)?;
            self.transport.write_all(body)?;
        } else {
            encode_frame(scratch, opcode, body, true, rsv1, Some(generate_key()));
            self.transport.write_all(scratch)?;
        }
        self.transport.flush()?;
        Ok(())
    }
}

/// One logical payload fanned out to many connections
///
/// The frame body is computed once per distinct negotiated send window:
/// compression (for connections that negotiated it) runs with no preset
/// dictionary at the recipient's window bits, so the peer's inflater can
/// always resolve the back-references and connections sharing a
/// negotiation get byte-identical frames. Connections whose send side
/// retains context still have their window advanced, keeping later
/// dictionary-assisted messages in sync with the peer's inflater.
pub struct Broadcaster {
    opcode: OpCode,
    payload: Bytes,
    /// Compressed body per negotiated send-window bits
    compressed: Mutex<BTreeMap<u8, Bytes>>,
}

impl Broadcaster {
    /// Prepare a broadcast of `payload` as `opcode` frames
    pub fn new(opcode: OpCode, payload: impl Into<Bytes>) -> Self {
        Self {
            opcode,
            payload: payload.into(),
            compressed: Mutex::new(BTreeMap::new()),
        }
    }

    /// Send the payload to one connection
    pub fn broadcast(&self, conn: &Arc<Conn>) -> Result<()> {
        if conn.is_closed() {
            return Err(conn.stored_error());
        }
        if self.payload.len() > conn.config.write_max_payload_size {
            return Err(Error::MessageTooLarge);
        }

        let mut state = conn.write_state.lock();
        let res = self.send_one(conn, &mut state);
        drop(state);
        if let Err(err) = &res {
            conn.emit_error(err);
        }
        res
    }

    fn send_one(&self, conn: &Arc<Conn>, state: &mut WriteState) -> Result<()> {
        if state.deflater.is_some() && self.payload.len() >= conn.pd.threshold {
            let bits = conn.pd.send_window_bits(conn.role.is_server());
            let body = self.compressed_for(bits)?;
            state.window.write(&self.payload);
            conn.emit_frame(&mut state.scratch, self.opcode, &body, true)
        } else {
            conn.emit_frame(&mut state.scratch, self.opcode, &self.payload, false)
        }
    }

    /// Compress once per window size, lazily; recipients that negotiated
    /// the same bits share the result
    fn compressed_for(&self, window_bits: u8) -> Result<Bytes> {
        let mut cache = self.compressed.lock();
        if let Some(body) = cache.get(&window_bits) {
            return Ok(body.clone());
        }
        let mut deflater = Deflater::new(6, window_bits);
        let body = Bytes::from(deflater.compress(&self.payload, None)?);
        cache.insert(window_bits, body.clone());
        Ok(body)
    }
}
