//! # chatter-ws: server-side WebSocket endpoint
//!
//! Accepts an HTTP/1.1 upgrade, then speaks the RFC 6455 frame protocol
//! over the same socket. Decoded text and binary messages are handed to
//! the application layer, which owns all cross-connection state.
//!
//! ## Layers
//!
//! - [`handshake`]: validates the upgrade request and builds the 101 response
//! - [`frame`]: incremental frame decoder and unmasked frame encoder
//! - [`protocol`]: fragment reassembly and control-frame parsing
//! - [`session`]: per-connection state machine, free of I/O
//! - [`connection`]: tokio driver that moves bytes between a socket and a session
//!
//! ## Example
//!
//! ```ignore
//! use chatter_ws::{Config, Connection, Event};
//! use tokio::net::TcpListener;
//!
//! let listener = TcpListener::bind("127.0.0.1:3210").await?;
//! let (stream, _) = listener.accept().await?;
//! let mut conn = Connection::accept(stream, Config::default()).await?;
//!
//! while let Some(event) = conn.next_event().await {
//!     if let Event::Message { payload, is_text } = event {
//!         conn.send(payload, is_text).await?;
//!     }
//! }
//! ```

use std::time::Duration;

pub mod connection;
pub mod error;
pub mod frame;
pub mod handshake;
pub mod mask;
pub mod protocol;
pub mod session;
pub mod utf8;

pub use connection::{Command, Connection, ConnectionHandle};
pub use error::{CloseReason, Error, ErrorKind, HandshakeError, Result};
pub use frame::{DecodeEvent, Frame, FrameDecoder, OpCode};
pub use protocol::{Message, Protocol};
pub use session::{ConnectionState, Event, Session};

/// Default receive buffer size (64KB)
pub const RECV_BUFFER_SIZE: usize = 64 * 1024;

/// Largest payload carried with the 7-bit length field
pub const SMALL_MESSAGE_THRESHOLD: usize = 125;

/// Largest payload carried with the 16-bit extended length
pub const MEDIUM_MESSAGE_THRESHOLD: usize = 65535;

/// Control frames never carry more than this many payload bytes
pub const MAX_CONTROL_PAYLOAD: usize = 125;

/// WebSocket GUID for handshake
pub const WS_GUID: &str = "258EAFA5-E914-47DA-95CA-C5AB0DC85B11";

/// Configuration for WebSocket sessions
///
/// # Example
///
/// ```
/// use chatter_ws::Config;
///
/// let config = Config::builder()
///     .max_payload_length(1024 * 1024)
///     .protocol("json")
///     .build();
/// assert_eq!(config.max_frame_size, 1024 * 1024);
/// ```
#[derive(Debug, Clone)]
pub struct Config {
    /// Maximum declared length of a single frame (default: 16MB)
    pub max_frame_size: usize,
    /// Maximum size of a reassembled message (default: 64MB)
    pub max_message_size: usize,
    /// Subprotocols the server is willing to speak
    pub protocols: Vec<String>,
    /// Reject frames the peer did not mask (default: true)
    pub require_masking: bool,
    /// Socket read buffer size (default: 64KB)
    pub read_buffer_size: usize,
    /// How long a locally initiated close waits for the peer's Close (default: 5s)
    pub close_timeout: Duration,
    /// Capacity of the command channel made by `Connection::command_channel` (default: 64)
    pub channel_capacity: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            max_frame_size: 16 * 1024 * 1024,
            max_message_size: 64 * 1024 * 1024,
            protocols: Vec::new(),
            require_masking: true,
            read_buffer_size: RECV_BUFFER_SIZE,
            close_timeout: Duration::from_secs(5),
            channel_capacity: 64,
        }
    }
}

impl Config {
    /// Create a new config builder
    pub fn builder() -> ConfigBuilder {
        ConfigBuilder::new()
    }
}

/// Builder for WebSocket configuration
#[derive(Debug, Clone)]
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

    /// Set both the frame and the message size limit
    pub fn max_payload_length(mut self, size: usize) -> Self {
        self.config.max_message_size = size;
        self.config.max_frame_size = size;
        self
    }

    /// Set maximum message size
    pub fn max_message_size(mut self, size: usize) -> Self {
        self.config.max_message_size = size;
        self
    }

    /// Set maximum frame size
    pub fn max_frame_size(mut self, size: usize) -> Self {
        self.config.max_frame_size = size;
        self
    }

    /// Add a supported subprotocol
    pub fn protocol(mut self, protocol: impl Into<String>) -> Self {
        self.config.protocols.push(protocol.into());
        self
    }

    /// Require (or stop requiring) masked frames from the peer
    pub fn require_masking(mut self, required: bool) -> Self {
        self.config.require_masking = required;
        self
    }

    /// Set the socket read buffer size
    pub fn read_buffer_size(mut self, size: usize) -> Self {
        self.config.read_buffer_size = size;
        self
    }

    /// Set how long to wait for the peer's Close after sending ours
    pub fn close_timeout(mut self, timeout: Duration) -> Self {
        self.config.close_timeout = timeout;
        self
    }

    /// Set the command channel capacity used by `Connection::command_channel`
    pub fn channel_capacity(mut self, capacity: usize) -> Self {
        self.config.channel_capacity = capacity.max(1);
        self
    }

    /// Build the configuration
    pub fn build(self) -> Config {
        self.config
    }
}

impl Default for ConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::Config;
    pub use crate::connection::{Command, Connection, ConnectionHandle};
    pub use crate::error::{CloseReason, Error, ErrorKind, Result};
    pub use crate::session::{ConnectionState, Event};
}
