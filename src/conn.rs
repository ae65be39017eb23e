//! Connection object and lifecycle
//!
//! A [`Conn`] owns the upgraded transport and every piece of per-connection
//! state: the buffered reader and continuation machine on the read side,
//! the deflater and its sliding window behind the write lock, the atomic
//! closed flag and the one-shot error slot that make teardown idempotent.
//!
//! Exactly one thread drives [`Conn::read_loop`]; writes may come from any
//! thread. Handlers are invoked synchronously from the read driver; a slow
//! handler should hand work to its own executor rather than block the
//! reader.

use std::io::BufReader;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::deflate::{Deflater, Inflater, PermessageDeflate, SlidingWindow};
use crate::error::{close_code, echo_policy, CloseCodeEcho, CloseInfo, Error, Result};
use crate::frame::{Codec, OpCode};
use crate::queue::WorkQueue;
use crate::session::Session;
use crate::transport::{Transport, TransportReader};
use crate::utf8::validate_utf8;
use crate::{Config, MAX_CONTROL_PAYLOAD};

/// WebSocket endpoint role
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Server (requires masked input, sends unmasked)
    Server,
    /// Client (masks every outbound frame)
    Client,
}

impl Role {
    /// Whether this is the server side
    #[inline]
    pub fn is_server(&self) -> bool {
        matches!(self, Role::Server)
    }
}

/// A complete data message, possibly reassembled from fragments
#[derive(Debug, Clone)]
pub enum Message {
    /// Text message; UTF-8 validated when `check_utf8` is enabled
    Text(Bytes),
    /// Binary message
    Binary(Bytes),
}

impl Message {
    /// The opcode this message travels as
    #[inline]
    pub fn opcode(&self) -> OpCode {
        match self {
            Message::Text(_) => OpCode::Text,
            Message::Binary(_) => OpCode::Binary,
        }
    }

    /// Payload bytes
    #[inline]
    pub fn as_bytes(&self) -> &[u8] {
        match self {
            Message::Text(b) | Message::Binary(b) => b,
        }
    }

    /// Payload as text, if this is a text message with valid UTF-8
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Message::Text(b) => std::str::from_utf8(b).ok(),
            Message::Binary(_) => None,
        }
    }

    /// Consume the message, keeping the payload
    pub fn into_bytes(self) -> Bytes {
        match self {
            Message::Text(b) | Message::Binary(b) => b,
        }
    }
}

/// Connection event callbacks
///
/// Handlers receive a borrowed `Arc` so replies can go straight back
/// through the connection. Every method except `on_close` defaults to a
/// no-op.
pub trait Handler: Send + Sync {
    /// Connection is up; fires before any other callback
    fn on_open(&self, conn: &Arc<Conn>) {
        let _ = conn;
    }

    /// Connection torn down; fires exactly once, after all messages
    fn on_close(&self, conn: &Arc<Conn>, err: &Error);

    /// A complete data message arrived
    fn on_message(&self, conn: &Arc<Conn>, msg: Message) {
        let _ = (conn, msg);
    }

    /// A ping arrived; the engine has already queued the pong reply
    fn on_ping(&self, conn: &Arc<Conn>, payload: Bytes) {
        let _ = (conn, payload);
    }

    /// A pong arrived
    fn on_pong(&self, conn: &Arc<Conn>, payload: Bytes) {
        let _ = (conn, payload);
    }
}

/// Everything the handshake layer hands over to build a connection
pub struct ConnOptions {
    /// The upgraded byte stream
    pub transport: Arc<dyn Transport>,
    /// Which side of the connection this is
    pub role: Role,
    /// Event callbacks
    pub handler: Arc<dyn Handler>,
    /// Negotiated subprotocol, empty if none
    pub subprotocol: String,
    /// Negotiated per-message deflate parameters
    pub permessage_deflate: PermessageDeflate,
    /// Bytes the handshake over-read past the upgrade request
    pub buffered: Bytes,
    /// Engine configuration
    pub config: Arc<Config>,
}

impl ConnOptions {
    /// Options with defaults for everything the handshake does not dictate
    pub fn new(transport: Arc<dyn Transport>, role: Role, handler: Arc<dyn Handler>) -> Self {
        Self {
            transport,
            role,
            handler,
            subprotocol: String::new(),
            permessage_deflate: PermessageDeflate::default(),
            buffered: Bytes::new(),
            config: Arc::new(Config::default()),
        }
    }
}

/// Reassembly state for a fragmented message
pub(crate) enum Continuation {
    /// No message in flight
    Idle,
    /// A non-FIN data frame opened a message
    InProgress {
        opcode: OpCode,
        /// RSV1 of the first fragment
        compressed: bool,
        buf: BytesMut,
    },
}

/// State owned by the single reader
pub(crate) struct ReadState {
    pub(crate) br: BufReader<TransportReader>,
    pub(crate) codec: Codec,
    pub(crate) continuation: Continuation,
    pub(crate) inflater: Option<Inflater>,
    pub(crate) window: SlidingWindow,
    pub(crate) scratch: BytesMut,
}

/// State guarded by the write lock
pub(crate) struct WriteState {
    pub(crate) deflater: Option<Deflater>,
    pub(crate) window: SlidingWindow,
    pub(crate) scratch: BytesMut,
}

/// One WebSocket connection
pub struct Conn {
    pub(crate) transport: Arc<dyn Transport>,
    pub(crate) role: Role,
    pub(crate) subprotocol: String,
    pub(crate) pd: PermessageDeflate,
    pub(crate) config: Arc<Config>,
    pub(crate) handler: Arc<dyn Handler>,
    pub(crate) session: Session,
    pub(crate) closed: AtomicBool,
    pub(crate) err: OnceLock<Error>,
    pub(crate) read_state: Mutex<ReadState>,
    pub(crate) write_state: Mutex<WriteState>,
    pub(crate) write_queue: WorkQueue,
}

impl Conn {
    /// Build a connection from the handshake hand-off
    pub fn new(opts: ConnOptions) -> Arc<Self> {
        let server = opts.role.is_server();
        let pd = opts.permessage_deflate;
        let config = opts.config;

        let mut inflater = None;
        let mut deflater = None;
        let mut recv_window = SlidingWindow::disabled();
        let mut send_window = SlidingWindow::disabled();
        if pd.enabled {
            inflater = Some(Inflater::new(pd.recv_window_bits(server)));
            deflater = Some(Deflater::new(pd.level, pd.send_window_bits(server)));
            // Dictionaries are pooled on the server, throwaway on clients
            let dict = |enabled: bool| {
                if enabled && server {
                    config.window_pool.get()
                } else {
                    Vec::new()
                }
            };
            if pd.recv_takeover(server) {
                recv_window =
                    SlidingWindow::new(true, pd.recv_window_bits(server), dict(true));
            }
            if pd.send_takeover(server) {
                send_window =
                    SlidingWindow::new(true, pd.send_window_bits(server), dict(true));
            }
        }

        let reader = TransportReader::new(Arc::clone(&opts.transport), opts.buffered);
        let read_state = ReadState {
            br: BufReader::with_capacity(config.read_buffer_size, reader),
            codec: Codec::new(server, pd.enabled, config.read_max_payload_size),
            continuation: Continuation::Idle,
            inflater,
            window: recv_window,
            scratch: BytesMut::new(),
        };
        let write_state = WriteState {
            deflater,
            window: send_window,
            scratch: BytesMut::with_capacity(config.write_buffer_size),
        };

        Arc::new(Self {
            transport: opts.transport,
            role: opts.role,
            subprotocol: opts.subprotocol,
            pd,
            write_queue: WorkQueue::new(config.write_concurrency()),
            config,
            handler: opts.handler,
            session: Session::new(),
            closed: AtomicBool::new(false),
            err: OnceLock::new(),
            read_state: Mutex::new(read_state),
            write_state: Mutex::new(write_state),
        })
    }

    /// Drive the connection until it closes
    ///
    /// Fires `on_open`, reads messages until any error, then fires
    /// `on_close` exactly once with the stored error. Must be called from
    /// exactly one thread per connection; it blocks until teardown.
    pub fn read_loop(self: &Arc<Self>) {
        self.handler.on_open(self);

        {
            let mut state = self.read_state.lock();
            loop {
                if let Err(err) = self.read_message(&mut state) {
                    self.emit_error(&err);
                    break;
                }
            }
        }

        let stored = self.stored_error();
        self.handler.on_close(self, &stored);
        debug!(role = ?self.role, error = %stored, "connection finished");

        if self.role.is_server() {
            self.reclaim_windows();
        }
    }

    /// Return pooled dictionary buffers after teardown
    fn reclaim_windows(&self) {
        let recv = {
            let mut state = self.read_state.lock();
            std::mem::replace(&mut state.window, SlidingWindow::disabled())
        };
        if let Some(buf) = recv.into_buffer() {
            self.config.window_pool.put(buf);
        }
        let send = {
            let mut state = self.write_state.lock();
            std::mem::replace(&mut state.window, SlidingWindow::disabled())
        };
        if let Some(buf) = send.into_buffer() {
            self.config.window_pool.put(buf);
        }
    }

    /// Whether teardown has begun
    #[inline]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// The stored error, or the closed sentinel if none was recorded
    pub(crate) fn stored_error(&self) -> Error {
        self.err.get().cloned().unwrap_or(Error::ConnClosed)
    }

    /// Tear the connection down because of a local error
    ///
    /// First caller wins; the close frame carries the code mapped from the
    /// error class plus the error text as reason.
    pub(crate) fn emit_error(&self, err: &Error) {
        if self
            .closed
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return;
        }
        let _ = self.err.set(err.clone());

        let code = err.close_code();
        debug!(code, error = %err, "closing connection");

        let mut payload = BytesMut::with_capacity(MAX_CONTROL_PAYLOAD);
        payload.extend_from_slice(&code.to_be_bytes());
        let text = err.to_string();
        let mut cut = text.len().min(MAX_CONTROL_PAYLOAD - 2);
        while !text.is_char_boundary(cut) {
            cut -= 1;
        }
        payload.extend_from_slice(&text.as_bytes()[..cut]);

        let _ = self.write_frame_raw(OpCode::Close, &payload);
        let _ = self.transport.shutdown();
    }

    /// Answer a Close frame received from the peer
    ///
    /// Returns the sentinel error that stops the read loop; `emit_error`
    /// then sees the closed flag already set and stays quiet.
    pub(crate) fn emit_close(&self, payload: &[u8]) -> Error {
        let (reply, observed) = match payload.len() {
            0 => (None, CloseInfo::empty()),
            1 => {
                warn!(
                    observed = payload[0],
                    responded = close_code::PROTOCOL_ERROR,
                    "close frame with one-byte payload"
                );
                (
                    Some(close_code::PROTOCOL_ERROR),
                    CloseInfo::new(payload[0] as u16, Bytes::new()),
                )
            }
            _ => {
                let real = u16::from_be_bytes([payload[0], payload[1]]);
                let reason = Bytes::copy_from_slice(&payload[2..]);

                let mut responded = match echo_policy(real) {
                    CloseCodeEcho::Normal => close_code::NORMAL,
                    CloseCodeEcho::AsIs => real,
                    CloseCodeEcho::Reject => {
                        warn!(
                            observed = real,
                            responded = close_code::PROTOCOL_ERROR,
                            "reserved or out-of-range close code"
                        );
                        close_code::PROTOCOL_ERROR
                    }
                };
                if self.config.check_utf8 && !validate_utf8(&reason) {
                    responded = close_code::UNSUPPORTED_DATA;
                }
                (Some(responded), CloseInfo::new(real, reason))
            }
        };

        if self
            .closed
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            let _ = self.err.set(Error::Close(observed));
            let reply_payload = match reply {
                Some(code) => Bytes::copy_from_slice(&code.to_be_bytes()),
                None => Bytes::new(),
            };
            let _ = self.write_frame_raw(OpCode::Close, &reply_payload);
            let _ = self.transport.shutdown();
        }

        Error::ConnClosed
    }

    /// Initiate the close handshake locally
    ///
    /// Idempotent: only the first closer (local or remote) sends a frame
    /// and shuts the transport down; later callers get the closed error.
    pub fn write_close(&self, code: u16, reason: &[u8]) -> Result<()> {
        if self
            .closed
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(self.stored_error());
        }

        let cut = reason.len().min(MAX_CONTROL_PAYLOAD - 2);
        let reason = Bytes::copy_from_slice(&reason[..cut]);
        let _ = self
            .err
            .set(Error::Close(CloseInfo::new(code, reason.clone())));

        let mut payload = BytesMut::with_capacity(2 + reason.len());
        payload.extend_from_slice(&code.to_be_bytes());
        payload.extend_from_slice(&reason);

        let res = self.write_frame_raw(OpCode::Close, &payload);
        let _ = self.transport.shutdown();
        res
    }

    // ------------------------------------------------------------------
    // Transport plumbing
    // ------------------------------------------------------------------

    /// Deadline for both reads and writes
    pub fn set_deadline(&self, timeout: Option<Duration>) -> Result<()> {
        self.set_read_deadline(timeout)?;
        self.set_write_deadline(timeout)
    }

    /// Deadline for subsequent reads; expiry tears the connection down
    pub fn set_read_deadline(&self, timeout: Option<Duration>) -> Result<()> {
        if let Err(e) = self.transport.set_read_timeout(timeout) {
            let err = Error::from(e);
            self.emit_error(&err);
            return Err(err);
        }
        Ok(())
    }

    /// Deadline for subsequent writes; expiry tears the connection down
    pub fn set_write_deadline(&self, timeout: Option<Duration>) -> Result<()> {
        if let Err(e) = self.transport.set_write_timeout(timeout) {
            let err = Error::from(e);
            self.emit_error(&err);
            return Err(err);
        }
        Ok(())
    }

    /// Local socket address
    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.transport.local_addr()
    }

    /// Peer socket address
    pub fn remote_addr(&self) -> std::io::Result<SocketAddr> {
        self.transport.peer_addr()
    }

    /// Toggle Nagle's algorithm on the underlying socket
    pub fn set_nodelay(&self, nodelay: bool) -> std::io::Result<()> {
        self.transport.set_nodelay(nodelay)
    }

    /// The raw transport handed over at construction
    pub fn transport(&self) -> &Arc<dyn Transport> {
        &self.transport
    }

    /// Endpoint role
    pub fn role(&self) -> Role {
        self.role
    }

    /// Negotiated subprotocol, empty if none
    pub fn subprotocol(&self) -> &str {
        &self.subprotocol
    }

    /// Per-connection session storage
    pub fn session(&self) -> &Session {
        &self.session
    }
}

impl std::fmt::Debug for Conn {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Conn")
            .field("role", &self.role)
            .field("subprotocol", &self.subprotocol)
            .field("closed", &self.is_closed())
            .finish()
    }
}
