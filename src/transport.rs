//! Transport seam between the engine and the upgraded byte stream
//!
//! The engine drives any full-duplex stream through [`Transport`]. Methods
//! take `&self` because the single reader and the serialized writers
//! operate on the same connection concurrently; implementations are
//! expected to support that the way `TcpStream` does.

use std::io::{self, Read, Write};
use std::net::{Shutdown, SocketAddr, TcpStream};
use std::time::Duration;

use bytes::{Buf, Bytes};

/// An upgraded byte stream the connection engine can drive
pub trait Transport: Send + Sync {
    /// Read into `buf`, blocking until data, EOF, or deadline expiry
    fn read(&self, buf: &mut [u8]) -> io::Result<usize>;

    /// Write from `buf`, returning the number of bytes accepted
    fn write(&self, buf: &[u8]) -> io::Result<usize>;

    /// Flush buffered output, if the transport buffers at all
    fn flush(&self) -> io::Result<()> {
        Ok(())
    }

    /// Tear the stream down in both directions
    fn shutdown(&self) -> io::Result<()>;

    /// Local socket address
    fn local_addr(&self) -> io::Result<SocketAddr>;

    /// Peer socket address
    fn peer_addr(&self) -> io::Result<SocketAddr>;

    /// Toggle Nagle's algorithm where the transport supports it
    fn set_nodelay(&self, nodelay: bool) -> io::Result<()>;

    /// Deadline for subsequent reads; `None` blocks indefinitely
    fn set_read_timeout(&self, timeout: Option<Duration>) -> io::Result<()>;

    /// Deadline for subsequent writes; `None` blocks indefinitely
    fn set_write_timeout(&self, timeout: Option<Duration>) -> io::Result<()>;

    /// Write the whole of `buf`, retrying partial writes
    fn write_all(&self, mut buf: &[u8]) -> io::Result<()> {
        while !buf.is_empty() {
            match self.write(buf) {
                Ok(0) => {
                    return Err(io::Error::new(
                        io::ErrorKind::WriteZero,
                        "transport accepted no bytes",
                    ));
                }
                Ok(n) => buf = &buf[n..],
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }
}

impl Transport for TcpStream {
    fn read(&self, buf: &mut [u8]) -> io::Result<usize> {
        Read::read(&mut &*self, buf)
    }

    fn write(&self, buf: &[u8]) -> io::Result<usize> {
        Write::write(&mut &*self, buf)
    }

    fn flush(&self) -> io::Result<()> {
        Write::flush(&mut &*self)
    }

    fn shutdown(&self) -> io::Result<()> {
        TcpStream::shutdown(self, Shutdown::Both)
    }

    fn local_addr(&self) -> io::Result<SocketAddr> {
        TcpStream::local_addr(self)
    }

    fn peer_addr(&self) -> io::Result<SocketAddr> {
        TcpStream::peer_addr(self)
    }

    fn set_nodelay(&self, nodelay: bool) -> io::Result<()> {
        TcpStream::set_nodelay(self, nodelay)
    }

    fn set_read_timeout(&self, timeout: Option<Duration>) -> io::Result<()> {
        TcpStream::set_read_timeout(self, timeout)
    }

    fn set_write_timeout(&self, timeout: Option<Duration>) -> io::Result<()> {
        TcpStream::set_write_timeout(self, timeout)
    }
}

/// `io::Read` adapter the buffered reader wraps
///
/// Drains bytes the handshake over-read before touching the transport, so
/// frames that arrived piggybacked on the upgrade request are not lost.
pub(crate) struct TransportReader {
    pending: Bytes,
    transport: std::sync::Arc<dyn Transport>,
}

impl TransportReader {
    pub(crate) fn new(transport: std::sync::Arc<dyn Transport>, pending: Bytes) -> Self {
        Self { pending, transport }
    }
}

impl Read for TransportReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if !self.pending.is_empty() {
            let n = self.pending.len().min(buf.len());
            buf[..n].copy_from_slice(&self.pending[..n]);
            self.pending.advance(n);
            return Ok(n);
        }
        self.transport.read(buf)
    }
}
