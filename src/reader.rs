//! Read pipeline: frame dispatch, fragment reassembly, validation
//!
//! One `read_message` call consumes exactly one frame. Control frames are
//! answered inline (Ping) or start teardown (Close); data frames feed the
//! continuation machine until a FIN completes the message, at which point
//! it is decompressed, validated, and delivered.

use std::io::Read;
use std::sync::Arc;

use bytes::{Bytes, BytesMut};

use crate::conn::{Conn, Continuation, Message, ReadState};
use crate::error::{Error, Result};
use crate::frame::{FrameHeader, OpCode};
use crate::mask::apply_mask;
use crate::utf8::validate_utf8;

impl ReadState {
    /// Inflate a complete message and roll the receive window forward
    fn inflate(&mut self, data: &[u8], limit: usize) -> Result<Bytes> {
        let ReadState {
            inflater, window, ..
        } = self;
        let inflater = match inflater {
            Some(inflater) => inflater,
            None => return Err(Error::Protocol("compressed frame without negotiated extension")),
        };
        let out = inflater.inflate(data, window.dict(), limit)?;
        window.write(&out);
        Ok(Bytes::from(out))
    }
}

impl Conn {
    /// Read and dispatch exactly one frame
    pub(crate) fn read_message(self: &Arc<Self>, state: &mut ReadState) -> Result<()> {
        let header = state.codec.decode_header(&mut state.br)?;

        state.scratch.clear();
        state.scratch.resize(header.payload_len as usize, 0);
        state.br.read_exact(&mut state.scratch[..])?;
        if let Some(key) = header.key {
            apply_mask(&mut state.scratch, key);
        }

        match header.opcode {
            OpCode::Ping => {
                let payload = state.scratch.split().freeze();
                self.write_pong(&payload)?;
                self.handler.on_ping(self, payload);
                Ok(())
            }
            OpCode::Pong => {
                let payload = state.scratch.split().freeze();
                self.handler.on_pong(self, payload);
                Ok(())
            }
            OpCode::Close => {
                let payload = state.scratch.split().freeze();
                Err(self.emit_close(&payload))
            }
            OpCode::Text | OpCode::Binary => self.on_data_frame(state, &header),
            OpCode::Continuation => self.on_continuation(state, &header),
        }
    }

    /// A Text or Binary frame: either a whole message or the start of one
    fn on_data_frame(self: &Arc<Self>, state: &mut ReadState, header: &FrameHeader) -> Result<()> {
        if !matches!(state.continuation, Continuation::Idle) {
            return Err(Error::Protocol("data frame inside fragmented message"));
        }

        if header.fin {
            let raw = state.scratch.split().freeze();
            let payload = if header.rsv1 {
                state.inflate(&raw, self.config.read_max_payload_size)?
            } else {
                raw
            };
            return self.deliver(header.opcode, payload);
        }

        let mut buf = BytesMut::with_capacity(state.scratch.len().max(64) * 2);
        buf.extend_from_slice(&state.scratch);
        state.scratch.clear();
        state.continuation = Continuation::InProgress {
            opcode: header.opcode,
            compressed: header.rsv1,
            buf,
        };
        Ok(())
    }

    /// A continuation frame: append, and finalize on FIN
    fn on_continuation(self: &Arc<Self>, state: &mut ReadState, header: &FrameHeader) -> Result<()> {
        match &mut state.continuation {
            Continuation::Idle => {
                return Err(Error::Protocol("continuation without a message"));
            }
            Continuation::InProgress { buf, .. } => {
                if buf.len() + state.scratch.len() > self.config.read_max_payload_size {
                    return Err(Error::MessageTooLarge);
                }
                buf.extend_from_slice(&state.scratch);
                state.scratch.clear();
            }
        }

        if !header.fin {
            return Ok(());
        }

        match std::mem::replace(&mut state.continuation, Continuation::Idle) {
            Continuation::InProgress {
                opcode,
                compressed,
                buf,
            } => {
                let data = buf.freeze();
                let payload = if compressed {
                    state.inflate(&data, self.config.read_max_payload_size)?
                } else {
                    data
                };
                self.deliver(opcode, payload)
            }
            Continuation::Idle => Err(Error::Protocol("continuation without a message")),
        }
    }

    /// Validate a finished message and hand it to the handler
    fn deliver(self: &Arc<Self>, opcode: OpCode, payload: Bytes) -> Result<()> {
        let msg = match opcode {
            OpCode::Text => {
                if self.config.check_utf8 && !validate_utf8(&payload) {
                    return Err(Error::InvalidUtf8);
                }
                Message::Text(payload)
            }
            _ => Message::Binary(payload),
        };
        self.handler.on_message(self, msg);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::deflate::{Deflater, PermessageDeflate, SlidingWindow, MAX_WINDOW_BITS};
    use crate::error::close_code;
    use crate::frame::encode_frame;
    use crate::testutil::{
        client_codec, next_event, read_frame, spawn_server, Event, TEST_KEY,
    };
    use crate::transport::Transport;
    use crate::Config;
    use bytes::BytesMut;
    use std::sync::Arc;

    fn send_client_frame(
        pipe: &dyn Transport,
        opcode: OpCode,
        payload: &[u8],
        fin: bool,
        rsv1: bool,
    ) {
        let mut buf = BytesMut::new();
        encode_frame(&mut buf, opcode, payload, fin, rsv1, Some(TEST_KEY));
        pipe.write_all(&buf).unwrap();
    }

    #[test]
    fn test_single_text_message() {
        let (_conn, rx, pipe) = spawn_server(Arc::default(), PermessageDeflate::default());

        assert!(matches!(next_event(&rx), Event::Open));
        send_client_frame(&pipe, OpCode::Text, b"hello", true, false);

        match next_event(&rx) {
            Event::Message(Message::Text(b)) => assert_eq!(&b[..], b"hello"),
            other => panic!("unexpected event: {other:?}"),
        }

        pipe.shutdown().unwrap();
        assert!(matches!(next_event(&rx), Event::Close(_)));
    }

    #[test]
    fn test_fragmented_message_delivered_once() {
        let (_conn, rx, pipe) = spawn_server(Arc::default(), PermessageDeflate::default());
        assert!(matches!(next_event(&rx), Event::Open));

        send_client_frame(&pipe, OpCode::Text, b"He", false, false);
        send_client_frame(&pipe, OpCode::Continuation, b"llo", true, false);

        match next_event(&rx) {
            Event::Message(Message::Text(b)) => assert_eq!(&b[..], b"Hello"),
            other => panic!("unexpected event: {other:?}"),
        }

        pipe.shutdown().unwrap();
        assert!(matches!(next_event(&rx), Event::Close(_)));
    }

    #[test]
    fn test_control_frame_between_fragments() {
        let (_conn, rx, pipe) = spawn_server(Arc::default(), PermessageDeflate::default());
        assert!(matches!(next_event(&rx), Event::Open));

        send_client_frame(&pipe, OpCode::Text, b"He", false, false);
        send_client_frame(&pipe, OpCode::Ping, b"mid", true, false);
        send_client_frame(&pipe, OpCode::Continuation, b"llo", true, false);

        let (header, payload) = read_frame(&pipe, &client_codec(false));
        assert_eq!(header.opcode, OpCode::Pong);
        assert_eq!(payload, b"mid");

        assert!(matches!(next_event(&rx), Event::Ping(_)));
        match next_event(&rx) {
            Event::Message(Message::Text(b)) => assert_eq!(&b[..], b"Hello"),
            other => panic!("unexpected event: {other:?}"),
        }
        pipe.shutdown().unwrap();
    }

    #[test]
    fn test_ping_answered_before_later_data() {
        let (_conn, rx, pipe) = spawn_server(Arc::default(), PermessageDeflate::default());
        assert!(matches!(next_event(&rx), Event::Open));

        send_client_frame(&pipe, OpCode::Ping, b"pq", true, false);

        // The pong reply is on the wire before the server does anything else
        let (header, payload) = read_frame(&pipe, &client_codec(false));
        assert_eq!(header.opcode, OpCode::Pong);
        assert_eq!(payload, b"pq");

        match next_event(&rx) {
            Event::Ping(b) => assert_eq!(&b[..], b"pq"),
            other => panic!("unexpected event: {other:?}"),
        }

        pipe.shutdown().unwrap();
    }

    #[test]
    fn test_close_with_code_and_reason() {
        let (_conn, rx, pipe) = spawn_server(Arc::default(), PermessageDeflate::default());
        assert!(matches!(next_event(&rx), Event::Open));

        let mut payload = 1000u16.to_be_bytes().to_vec();
        payload.extend_from_slice(b"bye");
        send_client_frame(&pipe, OpCode::Close, &payload, true, false);

        // Echo carries 1000 and no reason
        let (header, reply) = read_frame(&pipe, &client_codec(false));
        assert_eq!(header.opcode, OpCode::Close);
        assert_eq!(reply, 1000u16.to_be_bytes());

        match next_event(&rx) {
            Event::Close(Error::Close(info)) => {
                assert_eq!(info.code, 1000);
                assert_eq!(&info.reason[..], b"bye");
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[test]
    fn test_close_with_one_byte_payload() {
        let (_conn, rx, pipe) = spawn_server(Arc::default(), PermessageDeflate::default());
        assert!(matches!(next_event(&rx), Event::Open));

        send_client_frame(&pipe, OpCode::Close, &[0x03], true, false);

        let (header, reply) = read_frame(&pipe, &client_codec(false));
        assert_eq!(header.opcode, OpCode::Close);
        assert_eq!(reply, close_code::PROTOCOL_ERROR.to_be_bytes());

        match next_event(&rx) {
            Event::Close(Error::Close(info)) => {
                assert_eq!(info.code, 3);
                assert!(info.reason.is_empty());
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[test]
    fn test_close_with_empty_payload() {
        let (_conn, rx, pipe) = spawn_server(Arc::default(), PermessageDeflate::default());
        assert!(matches!(next_event(&rx), Event::Open));

        send_client_frame(&pipe, OpCode::Close, &[], true, false);

        let (header, reply) = read_frame(&pipe, &client_codec(false));
        assert_eq!(header.opcode, OpCode::Close);
        assert!(reply.is_empty());

        match next_event(&rx) {
            Event::Close(Error::Close(info)) => {
                assert_eq!(info.code, 0);
                assert!(info.reason.is_empty());
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[test]
    fn test_close_code_policy_on_the_wire() {
        for (sent, echoed) in [
            (999u16, close_code::PROTOCOL_ERROR),
            (1001, close_code::NORMAL),
            (1005, close_code::PROTOCOL_ERROR),
            (1015, close_code::PROTOCOL_ERROR),
            (2999, close_code::PROTOCOL_ERROR),
            (3500, 3500),
            (4999, 4999),
            (5000, close_code::PROTOCOL_ERROR),
        ] {
            let (_conn, rx, pipe) = spawn_server(Arc::default(), PermessageDeflate::default());
            assert!(matches!(next_event(&rx), Event::Open));

            send_client_frame(&pipe, OpCode::Close, &sent.to_be_bytes(), true, false);
            let (_, reply) = read_frame(&pipe, &client_codec(false));
            assert_eq!(reply, echoed.to_be_bytes(), "sent code {sent}");
        }
    }

    #[test]
    fn test_close_reason_invalid_utf8() {
        let (_conn, rx, pipe) = spawn_server(Arc::default(), PermessageDeflate::default());
        assert!(matches!(next_event(&rx), Event::Open));

        let mut payload = 1000u16.to_be_bytes().to_vec();
        payload.extend_from_slice(&[0xC3, 0x28]);
        send_client_frame(&pipe, OpCode::Close, &payload, true, false);

        let (_, reply) = read_frame(&pipe, &client_codec(false));
        assert_eq!(reply, close_code::UNSUPPORTED_DATA.to_be_bytes());
    }

    #[test]
    fn test_utf8_codepoint_straddling_fragments() {
        let (_conn, rx, pipe) = spawn_server(Arc::default(), PermessageDeflate::default());
        assert!(matches!(next_event(&rx), Event::Open));

        // U+00E9 split across two fragments; only the aggregate validates
        send_client_frame(&pipe, OpCode::Text, &[0xC3], false, false);
        send_client_frame(&pipe, OpCode::Continuation, &[0xA9], true, false);

        match next_event(&rx) {
            Event::Message(Message::Text(b)) => assert_eq!(&b[..], "\u{e9}".as_bytes()),
            other => panic!("unexpected event: {other:?}"),
        }
        pipe.shutdown().unwrap();
    }

    #[test]
    fn test_invalid_utf8_text_closes_1007() {
        let (_conn, rx, pipe) = spawn_server(Arc::default(), PermessageDeflate::default());
        assert!(matches!(next_event(&rx), Event::Open));

        send_client_frame(&pipe, OpCode::Text, &[0xC3, 0x28], true, false);

        let (header, reply) = read_frame(&pipe, &client_codec(false));
        assert_eq!(header.opcode, OpCode::Close);
        assert_eq!(
            reply[..2],
            close_code::UNSUPPORTED_DATA.to_be_bytes()
        );
        assert!(matches!(next_event(&rx), Event::Close(Error::InvalidUtf8)));
    }

    #[test]
    fn test_data_frame_inside_fragmented_message() {
        let (_conn, rx, pipe) = spawn_server(Arc::default(), PermessageDeflate::default());
        assert!(matches!(next_event(&rx), Event::Open));

        send_client_frame(&pipe, OpCode::Text, b"He", false, false);
        send_client_frame(&pipe, OpCode::Text, b"llo", true, false);

        let (header, reply) = read_frame(&pipe, &client_codec(false));
        assert_eq!(header.opcode, OpCode::Close);
        assert_eq!(reply[..2], close_code::PROTOCOL_ERROR.to_be_bytes());
        assert!(matches!(next_event(&rx), Event::Close(Error::Protocol(_))));
    }

    #[test]
    fn test_continuation_without_start() {
        let (_conn, rx, pipe) = spawn_server(Arc::default(), PermessageDeflate::default());
        assert!(matches!(next_event(&rx), Event::Open));

        send_client_frame(&pipe, OpCode::Continuation, b"tail", true, false);

        let (header, reply) = read_frame(&pipe, &client_codec(false));
        assert_eq!(header.opcode, OpCode::Close);
        assert_eq!(reply[..2], close_code::PROTOCOL_ERROR.to_be_bytes());
        assert!(matches!(next_event(&rx), Event::Close(Error::Protocol(_))));
    }

    #[test]
    fn test_aggregate_exceeding_limit_closes_1009() {
        let config = Arc::new(
            Config::builder()
                .read_max_payload_size(100)
                .build(),
        );
        let (_conn, rx, pipe) = spawn_server(config, PermessageDeflate::default());
        assert!(matches!(next_event(&rx), Event::Open));

        send_client_frame(&pipe, OpCode::Binary, &[0u8; 60], false, false);
        send_client_frame(&pipe, OpCode::Continuation, &[0u8; 60], true, false);

        let (header, reply) = read_frame(&pipe, &client_codec(false));
        assert_eq!(header.opcode, OpCode::Close);
        assert_eq!(reply[..2], close_code::MESSAGE_TOO_BIG.to_be_bytes());
        assert!(matches!(
            next_event(&rx),
            Event::Close(Error::MessageTooLarge)
        ));
    }

    #[test]
    fn test_compressed_inbound_with_context_takeover() {
        let pd = PermessageDeflate::enabled();
        let (_conn, rx, pipe) = spawn_server(Arc::default(), pd.clone());
        assert!(matches!(next_event(&rx), Event::Open));

        // Hand-rolled client compressor: its send window pairs with the
        // server's receive window (both follow server_context_takeover)
        let mut deflater = Deflater::new(pd.level, MAX_WINDOW_BITS);
        let mut window = SlidingWindow::new(true, MAX_WINDOW_BITS, Vec::new());

        for text in ["first compressed message", "second compressed message"] {
            let body = deflater.compress(text.as_bytes(), window.dict()).unwrap();
            window.write(text.as_bytes());
            send_client_frame(&pipe, OpCode::Text, &body, true, true);

            match next_event(&rx) {
                Event::Message(Message::Text(b)) => assert_eq!(&b[..], text.as_bytes()),
                other => panic!("unexpected event: {other:?}"),
            }
        }
        pipe.shutdown().unwrap();
    }

    #[test]
    fn test_compressed_fragmented_message() {
        let pd = PermessageDeflate::enabled();
        let (_conn, rx, pipe) = spawn_server(Arc::default(), pd.clone());
        assert!(matches!(next_event(&rx), Event::Open));

        let mut deflater = Deflater::new(pd.level, MAX_WINDOW_BITS);
        let text = b"a compressed message split across two frames";
        let body = deflater.compress(text, None).unwrap();
        let mid = body.len() / 2;

        // RSV1 only on the first fragment
        send_client_frame(&pipe, OpCode::Text, &body[..mid], false, true);
        send_client_frame(&pipe, OpCode::Continuation, &body[mid..], true, false);

        match next_event(&rx) {
            Event::Message(Message::Text(b)) => assert_eq!(&b[..], &text[..]),
            other => panic!("unexpected event: {other:?}"),
        }
        pipe.shutdown().unwrap();
    }
}
