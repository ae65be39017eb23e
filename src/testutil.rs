//! Shared helpers for the engine tests

use std::io::Read;
use std::sync::mpsc;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;

use crate::conn::{Conn, ConnOptions, Handler, Message, Role};
use crate::deflate::PermessageDeflate;
use crate::error::Error;
use crate::frame::{Codec, FrameHeader};
use crate::mask::apply_mask;
use crate::transport::{mem, Transport};
use crate::Config;

/// Everything a handler can observe, in arrival order
#[derive(Debug)]
pub(crate) enum Event {
    Open,
    Message(Message),
    Ping(Bytes),
    Pong(Bytes),
    Close(Error),
}

/// Handler that forwards every callback into a channel
pub(crate) struct Recorder {
    tx: mpsc::Sender<Event>,
}

impl Recorder {
    pub(crate) fn new() -> (Arc<Self>, mpsc::Receiver<Event>) {
        let (tx, rx) = mpsc::channel();
        (Arc::new(Self { tx }), rx)
    }
}

impl Handler for Recorder {
    fn on_open(&self, _conn: &Arc<Conn>) {
        let _ = self.tx.send(Event::Open);
    }

    fn on_close(&self, _conn: &Arc<Conn>, err: &Error) {
        let _ = self.tx.send(Event::Close(err.clone()));
    }

    fn on_message(&self, _conn: &Arc<Conn>, msg: Message) {
        let _ = self.tx.send(Event::Message(msg));
    }

    fn on_ping(&self, _conn: &Arc<Conn>, payload: Bytes) {
        let _ = self.tx.send(Event::Ping(payload));
    }

    fn on_pong(&self, _conn: &Arc<Conn>, payload: Bytes) {
        let _ = self.tx.send(Event::Pong(payload));
    }
}

/// Wait for the next event with a generous timeout
pub(crate) fn next_event(rx: &mpsc::Receiver<Event>) -> Event {
    rx.recv_timeout(Duration::from_secs(5)).expect("event")
}

/// A server connection with its read loop running, plus the peer's pipe end
/// for driving the wire by hand
pub(crate) fn spawn_server(
    config: Arc<Config>,
    pd: PermessageDeflate,
) -> (Arc<Conn>, mpsc::Receiver<Event>, mem::Pipe) {
    let (server_end, client_end) = mem::pair();
    let (handler, rx) = Recorder::new();
    let conn = Conn::new(ConnOptions {
        permessage_deflate: pd,
        config,
        ..ConnOptions::new(Arc::new(server_end), Role::Server, handler)
    });
    let driver = Arc::clone(&conn);
    std::thread::spawn(move || driver.read_loop());
    (conn, rx, client_end)
}

/// A fully wired server/client pair, both read loops running
pub(crate) fn spawn_pair(
    config: Arc<Config>,
    pd: PermessageDeflate,
) -> (
    Arc<Conn>,
    mpsc::Receiver<Event>,
    Arc<Conn>,
    mpsc::Receiver<Event>,
) {
    let (server_end, client_end) = mem::pair();

    let (server_handler, server_rx) = Recorder::new();
    let server = Conn::new(ConnOptions {
        permessage_deflate: pd.clone(),
        config: Arc::clone(&config),
        ..ConnOptions::new(Arc::new(server_end), Role::Server, server_handler)
    });

    let (client_handler, client_rx) = Recorder::new();
    let client = Conn::new(ConnOptions {
        permessage_deflate: pd,
        config,
        ..ConnOptions::new(Arc::new(client_end), Role::Client, client_handler)
    });

    let driver = Arc::clone(&server);
    std::thread::spawn(move || driver.read_loop());
    let driver = Arc::clone(&client);
    std::thread::spawn(move || driver.read_loop());

    (server, server_rx, client, client_rx)
}

struct TransportRead<'a>(&'a dyn Transport);

impl Read for TransportRead<'_> {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        self.0.read(buf)
    }
}

/// Read one frame off the wire, unmasking the payload
pub(crate) fn read_frame(t: &dyn Transport, codec: &Codec) -> (FrameHeader, Vec<u8>) {
    let mut r = TransportRead(t);
    let header = codec.decode_header(&mut r).expect("frame header");
    let mut payload = vec![0u8; header.payload_len as usize];
    r.read_exact(&mut payload).expect("frame payload");
    if let Some(key) = header.key {
        apply_mask(&mut payload, key);
    }
    (header, payload)
}

/// Codec with client-side expectations (unmasked server frames)
pub(crate) fn client_codec(deflate: bool) -> Codec {
    Codec::new(false, deflate, 64 * 1024 * 1024)
}

/// A fixed masking key for hand-built client frames
pub(crate) const TEST_KEY: [u8; 4] = [0x37, 0xfa, 0x21, 0x3d];
