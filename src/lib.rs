//! # Strand-WS: WebSocket connection engine
//!
//! An RFC 6455 WebSocket endpoint library built around a thread-scheduled
//! connection engine, with full RFC 7692 per-message deflate support
//! including context-takeover sliding windows and broadcast-safe
//! dictionary handling.
//!
//! The crate deliberately does **not** perform the HTTP upgrade handshake
//! or construct transports. A handshake layer hands the engine an upgraded
//! byte stream together with the negotiated parameters; from there the
//! engine owns framing, fragmentation, control frames, compression, and the
//! close handshake.
//!
//! ## Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use strand_ws::{Conn, ConnOptions, Config, Handler, Message, Role};
//!
//! struct Echo;
//!
//! impl Handler for Echo {
//!     fn on_message(&self, conn: &Arc<Conn>, msg: Message) {
//!         let _ = conn.write_message(msg.opcode(), msg.as_bytes());
//!     }
//!     fn on_close(&self, _conn: &Arc<Conn>, err: &strand_ws::Error) {
//!         println!("closed: {err}");
//!     }
//! }
//!
//! // `transport` comes from the handshake layer (e.g. an accepted TcpStream
//! // whose upgrade request has already been answered).
//! let conn = Conn::new(ConnOptions::new(transport, Role::Server, Arc::new(Echo)));
//! conn.read_loop();
//! ```

pub mod conn;
pub mod deflate;
pub mod error;
pub mod frame;
pub mod mask;
pub mod pool;
pub mod queue;
pub mod reader;
pub mod session;
pub mod transport;
pub mod utf8;
pub mod writer;

#[cfg(test)]
mod testutil;

pub use conn::{Conn, ConnOptions, Handler, Message, Role};
pub use deflate::PermessageDeflate;
pub use error::{CloseInfo, Error, Result};
pub use frame::{FrameHeader, OpCode};
pub use pool::BufferPool;
pub use session::Session;
pub use transport::Transport;
pub use writer::Broadcaster;

/// Maximum WebSocket frame header size (2 + 8 + 4 = 14 bytes)
pub const MAX_FRAME_HEADER_SIZE: usize = 14;

/// Largest payload representable with the base 7-bit length code
pub const SMALL_PAYLOAD_MAX: usize = 125;

/// Largest payload representable with the 2-byte extended length
pub const MEDIUM_PAYLOAD_MAX: usize = 65535;

/// Control frames carry at most this many payload bytes (RFC 6455 §5.5)
pub const MAX_CONTROL_PAYLOAD: usize = 125;

/// Configuration for WebSocket connections
///
/// # Example
///
/// ```
/// use strand_ws::Config;
///
/// let config = Config::builder()
///     .read_max_payload_size(16 * 1024 * 1024)
///     .check_utf8(true)
///     .parallel(true, 8)
///     .build();
/// ```
#[derive(Debug)]
pub struct Config {
    /// Maximum inbound message size; larger frames or aggregates close the
    /// connection with 1009 (default: 16MB)
    pub read_max_payload_size: usize,
    /// Maximum outbound message size (default: 16MB)
    pub write_max_payload_size: usize,
    /// Strict UTF-8 validation of Text payloads and Close reasons
    /// (default: true)
    pub check_utf8: bool,
    /// Allow more than one in-flight `write_async` job per connection
    /// (default: false, which preserves submission order)
    pub parallel_enabled: bool,
    /// Maximum outstanding `write_async` jobs when parallelism is enabled
    /// (default: 8)
    pub parallel_limit: u32,
    /// Buffered reader capacity (default: 4KB)
    pub read_buffer_size: usize,
    /// Write scratch capacity reserved for masking/compression
    /// (default: 4KB)
    pub write_buffer_size: usize,
    /// Pool that server-role connections borrow sliding-window dictionaries
    /// from and return them to on close
    pub window_pool: std::sync::Arc<BufferPool>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            read_max_payload_size: 16 * 1024 * 1024,
            write_max_payload_size: 16 * 1024 * 1024,
            check_utf8: true,
            parallel_enabled: false,
            parallel_limit: 8,
            read_buffer_size: 4 * 1024,
            write_buffer_size: 4 * 1024,
            window_pool: std::sync::Arc::new(BufferPool::new(
                1 << deflate::MAX_WINDOW_BITS,
                64,
            )),
        }
    }
}

impl Config {
    /// Create a new config builder
    pub fn builder() -> ConfigBuilder {
        ConfigBuilder::new()
    }

    /// Concurrency limit the write queue runs with
    pub(crate) fn write_concurrency(&self) -> u32 {
        if self.parallel_enabled {
            self.parallel_limit.max(1)
        } else {
            1
        }
    }
}

/// Builder for WebSocket configuration
#[derive(Debug, Default)]
pub struct ConfigBuilder {
    config: Config,
}

impl ConfigBuilder {
    /// Create a new builder with default values
    pub fn new() -> Self {
        Self {
            config: Config::default(),
        }
    }

    /// Set the maximum inbound message size
    pub fn read_max_payload_size(mut self, size: usize) -> Self {
        self.config.read_max_payload_size = size;
        self
    }

    /// Set the maximum outbound message size
    pub fn write_max_payload_size(mut self, size: usize) -> Self {
        self.config.write_max_payload_size = size;
        self
    }

    /// Enable or disable strict UTF-8 validation
    pub fn check_utf8(mut self, enabled: bool) -> Self {
        self.config.check_utf8 = enabled;
        self
    }

    /// Configure `write_async` parallelism
    pub fn parallel(mut self, enabled: bool, limit: u32) -> Self {
        self.config.parallel_enabled = enabled;
        self.config.parallel_limit = limit;
        self
    }

    /// Set the buffered reader capacity
    pub fn read_buffer_size(mut self, size: usize) -> Self {
        self.config.read_buffer_size = size;
        self
    }

    /// Set the write scratch capacity
    pub fn write_buffer_size(mut self, size: usize) -> Self {
        self.config.write_buffer_size = size;
        self
    }

    /// Use a shared dictionary pool
    pub fn window_pool(mut self, pool: std::sync::Arc<BufferPool>) -> Self {
        self.config.window_pool = pool;
        self
    }

    /// Build the configuration
    pub fn build(self) -> Config {
        self.config
    }
}

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::Config;
    pub use crate::conn::{Conn, ConnOptions, Handler, Message, Role};
    pub use crate::deflate::PermessageDeflate;
    pub use crate::error::{CloseInfo, Error, Result};
    pub use crate::frame::OpCode;
}
