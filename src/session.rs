//! Per-connection state machine
//!
//! A [`Session`] never touches a socket. Bytes read from the peer go into
//! [`Session::receive`], which yields [`Event`]s for the application; bytes
//! that must be written back (the handshake response, Pongs, Close frames,
//! application sends) accumulate in an outbound buffer drained with
//! [`Session::take_outbound`].
//!
//! ```text
//! CONNECTING --101--> OPEN --Close sent/received, error--> CLOSING --socket shut--> CLOSED
//!      \--400------------------------------------------------------------------^
//! ```

use bytes::{Bytes, BytesMut};
use tracing::{debug, trace, warn};

use crate::error::{CloseReason, Error, ErrorKind, Result};
use crate::frame::{OpCode, close_payload, encode};
use crate::handshake::{ServerHandshake, parse_request, reject_response};
use crate::protocol::{Message, Protocol};
use crate::utf8::validate_utf8;
use crate::{Config, MAX_CONTROL_PAYLOAD};

/// Longest reason text that fits in a Close frame next to the status code
pub const MAX_CLOSE_REASON: usize = MAX_CONTROL_PAYLOAD - 2;

/// Lifecycle of one connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Waiting for the upgrade request
    Connecting,
    /// Handshake done, messages flow both ways
    Open,
    /// A Close frame was sent or received
    Closing,
    /// Socket shut down; terminal
    Closed,
}

/// Notification delivered to the application layer
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    /// A complete text or binary message
    Message {
        /// Message payload
        payload: Bytes,
        /// Whether the payload arrived as text (valid UTF-8)
        is_text: bool,
    },
    /// The peer closed the connection
    ///
    /// `code` is 1005 when the peer's Close carried no status and 1006 when
    /// the socket ended without a Close frame.
    PeerClose {
        /// Close status code
        code: u16,
        /// Reason text
        reason: String,
    },
    /// Reply to one of our pings
    Pong(Bytes),
    /// The session failed and is closing
    Error(ErrorKind),
}

/// Sans-IO WebSocket server session
#[derive(Debug)]
pub struct Session {
    state: ConnectionState,
    handshake: ServerHandshake,
    /// Request head bytes while CONNECTING
    handshake_buf: BytesMut,
    protocol: Protocol,
    outbound: BytesMut,
    scratch: Vec<Message>,
    path: Option<String>,
    subprotocol: Option<String>,
    close_sent: bool,
    close_received: bool,
    /// Input is no longer decoded after a protocol failure
    failed: bool,
}

impl Session {
    /// Create a session waiting for the upgrade request
    pub fn new(config: &Config) -> Self {
        Self {
            state: ConnectionState::Connecting,
            handshake: ServerHandshake::from_config(config),
            handshake_buf: BytesMut::new(),
            protocol: Protocol::from_config(config),
            outbound: BytesMut::new(),
            scratch: Vec::new(),
            path: None,
            subprotocol: None,
            close_sent: false,
            close_received: false,
            failed: false,
        }
    }

    /// Current state
    #[inline]
    pub fn state(&self) -> ConnectionState {
        self.state
    }

    /// Subprotocol agreed during the handshake
    pub fn subprotocol(&self) -> Option<&str> {
        self.subprotocol.as_deref()
    }

    /// Request path of the upgrade request
    pub fn path(&self) -> Option<&str> {
        self.path.as_deref()
    }

    fn set_state(&mut self, state: ConnectionState) {
        if self.state != state {
            debug!(from = ?self.state, to = ?state, "session state change");
            self.state = state;
        }
    }

    /// Feed bytes read from the socket
    ///
    /// While CONNECTING, a rejected upgrade queues a `400` response, moves
    /// the session to CLOSED and returns `Error::Handshake`. Once OPEN,
    /// protocol failures do not return `Err`; they queue the matching Close
    /// frame and are reported as [`Event::Error`].
    pub fn receive(&mut self, data: &[u8]) -> Result<Vec<Event>> {
        match self.state {
            ConnectionState::Connecting => self.receive_handshake(data),
            ConnectionState::Open | ConnectionState::Closing => Ok(self.receive_frames(data)),
            ConnectionState::Closed => Err(Error::ConnectionClosed),
        }
    }

    fn receive_handshake(&mut self, data: &[u8]) -> Result<Vec<Event>> {
        self.handshake_buf.extend_from_slice(data);

        let parsed = parse_request(&self.handshake_buf).and_then(|parsed| match parsed {
            Some((req, len)) => {
                let response = self.handshake.accept(&req)?;
                Ok(Some((response, req.path.to_string(), len)))
            }
            None => Ok(None),
        });

        let (response, path, len) = match parsed {
            Ok(Some(accepted)) => accepted,
            Ok(None) => return Ok(Vec::new()),
            Err(err) => {
                warn!(error = %err, "rejecting upgrade request");
                self.outbound.extend_from_slice(&reject_response(&err));
                self.handshake_buf = BytesMut::new();
                self.set_state(ConnectionState::Closed);
                return Err(err.into());
            }
        };

        debug!(path = %path, protocol = ?response.protocol, "upgrade accepted");
        self.outbound.extend_from_slice(&response.to_bytes());
        self.subprotocol = response.protocol;
        self.path = Some(path);

        // Frames pipelined behind the request head
        let leftover = self.handshake_buf.split_off(len);
        self.handshake_buf = BytesMut::new();
        self.set_state(ConnectionState::Open);

        if leftover.is_empty() {
            Ok(Vec::new())
        } else {
            Ok(self.receive_frames(&leftover))
        }
    }

    fn receive_frames(&mut self, data: &[u8]) -> Vec<Event> {
        let mut events = Vec::new();
        if self.failed || self.close_received {
            trace!(len = data.len(), "ignoring bytes after close");
            return events;
        }

        let mut messages = std::mem::take(&mut self.scratch);
        let result = self.protocol.process_into(data, &mut messages);
        for message in messages.drain(..) {
            self.handle_message(message, &mut events);
        }
        self.scratch = messages;

        if let Err(err) = result {
            self.fail(err, &mut events);
        }
        events
    }

    fn handle_message(&mut self, message: Message, events: &mut Vec<Event>) {
        match message {
            Message::Text(payload) => events.push(Event::Message {
                payload,
                is_text: true,
            }),
            Message::Binary(payload) => events.push(Event::Message {
                payload,
                is_text: false,
            }),
            Message::Ping(payload) => {
                if !self.close_sent {
                    trace!(len = payload.len(), "answering ping");
                    self.write_frame(OpCode::Pong, &payload);
                }
            }
            Message::Pong(payload) => events.push(Event::Pong(payload)),
            Message::Close(reason) => {
                self.close_received = true;
                let (code, reason) = match reason {
                    Some(r) => (r.code, r.reason),
                    None => (CloseReason::NO_STATUS, String::new()),
                };
                debug!(code, reason = %reason, "peer sent close");

                if !self.close_sent {
                    let reply = if code == CloseReason::NO_STATUS {
                        CloseReason::NORMAL
                    } else {
                        code
                    };
                    self.queue_close(reply, "");
                }
                self.set_state(ConnectionState::Closing);
                events.push(Event::PeerClose { code, reason });
            }
        }
    }

    /// Close with the status the error calls for and report it upward
    fn fail(&mut self, err: Error, events: &mut Vec<Event>) {
        warn!(error = %err, "closing session after protocol failure");
        self.failed = true;
        self.protocol.reset();

        if !self.close_sent {
            let code = err.close_code().unwrap_or(CloseReason::INTERNAL);
            self.queue_close(code, "");
        }
        self.set_state(ConnectionState::Closing);
        events.push(Event::Error(err.kind()));
    }

    fn queue_close(&mut self, code: u16, reason: &str) {
        self.write_frame(OpCode::Close, &close_payload(code, reason));
        self.close_sent = true;
    }

    fn write_frame(&mut self, opcode: OpCode, payload: &[u8]) {
        self.outbound.extend_from_slice(&encode(opcode, payload));
    }

    fn ensure_open(&self) -> Result<()> {
        match self.state {
            ConnectionState::Open => Ok(()),
            ConnectionState::Connecting => Err(Error::InvalidState("handshake not complete")),
            ConnectionState::Closing | ConnectionState::Closed => Err(Error::ConnectionClosed),
        }
    }

    /// Queue a single-frame text or binary message
    pub fn send(&mut self, payload: &[u8], is_text: bool) -> Result<()> {
        self.ensure_open()?;
        let opcode = if is_text {
            if !validate_utf8(payload) {
                return Err(Error::InvalidUtf8);
            }
            OpCode::Text
        } else {
            OpCode::Binary
        };
        self.write_frame(opcode, payload);
        Ok(())
    }

    /// Start the closing handshake
    pub fn send_close(&mut self, code: u16, reason: &str) -> Result<()> {
        self.ensure_open()?;
        if !CloseReason::is_valid_code(code) {
            return Err(Error::InvalidCloseCode(code));
        }
        if reason.len() > MAX_CLOSE_REASON {
            return Err(Error::Protocol("close reason exceeds 123 bytes"));
        }
        debug!(code, reason, "sending close");
        self.queue_close(code, reason);
        self.set_state(ConnectionState::Closing);
        Ok(())
    }

    /// Queue a Ping
    pub fn ping(&mut self, payload: &[u8]) -> Result<()> {
        self.ensure_open()?;
        if payload.len() > MAX_CONTROL_PAYLOAD {
            return Err(Error::Protocol("ping payload exceeds 125 bytes"));
        }
        self.write_frame(OpCode::Ping, payload);
        Ok(())
    }

    /// Whether bytes are waiting to be written
    #[inline]
    pub fn has_outbound(&self) -> bool {
        !self.outbound.is_empty()
    }

    /// Take the bytes that must be written to the socket, in order
    pub fn take_outbound(&mut self) -> Bytes {
        self.outbound.split().freeze()
    }

    /// Whether we sent a Close and are still waiting for the peer's
    pub fn awaiting_close_reply(&self) -> bool {
        self.state == ConnectionState::Closing && !self.close_received && !self.failed
    }

    /// Whether the socket should be shut down once outbound bytes are written
    pub fn wants_shutdown(&self) -> bool {
        match self.state {
            ConnectionState::Closing => self.failed || (self.close_sent && self.close_received),
            ConnectionState::Closed => true,
            _ => false,
        }
    }

    /// Record that the socket is gone, in either direction
    ///
    /// Returns `PeerClose(1006)` if the peer vanished while the session was
    /// OPEN. Partial frames and messages are dropped.
    pub fn socket_closed(&mut self) -> Option<Event> {
        let event = (self.state == ConnectionState::Open).then(|| {
            debug!("socket closed without close frame");
            Event::PeerClose {
                code: CloseReason::ABNORMAL,
                reason: String::new(),
            }
        });

        self.protocol.reset();
        self.handshake_buf = BytesMut::new();
        self.outbound = BytesMut::new();
        self.set_state(ConnectionState::Closed);
        event
    }
}
