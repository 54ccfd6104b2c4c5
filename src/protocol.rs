//! WebSocket message layer
//!
//! Turns decoded frames into complete messages:
//! - Fragment reassembly, with the running size checked against the
//!   message limit and text validated as fragments arrive
//! - Close payload parsing and validation
//! - Ping/Pong surfaced as messages so the session can answer them

use bytes::{Bytes, BytesMut};

use crate::Config;
use crate::error::{CloseReason, Error, Result};
use crate::frame::{Frame, FrameDecoder, OpCode};
use crate::utf8::{validate_utf8, validate_utf8_incomplete};

/// WebSocket message (complete, possibly assembled from fragments)
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    /// Text message (UTF-8 validated)
    Text(Bytes),
    /// Binary message
    Binary(Bytes),
    /// Ping message
    Ping(Bytes),
    /// Pong message
    Pong(Bytes),
    /// Close message; `None` when the peer sent no status code
    Close(Option<CloseReason>),
}

/// Reassembles fragmented data messages
#[derive(Debug)]
pub struct MessageAssembler {
    /// Opcode of the message in progress
    opcode: Option<OpCode>,
    buf: BytesMut,
    max_message_size: usize,
}

impl MessageAssembler {
    /// Create an assembler capping messages at `max_message_size` bytes
    pub fn new(max_message_size: usize) -> Self {
        Self {
            opcode: None,
            buf: BytesMut::new(),
            max_message_size,
        }
    }

    /// Discard any partial message
    pub fn reset(&mut self) {
        self.opcode = None;
        self.buf = BytesMut::new();
    }

    /// Accept one data frame; returns the message it completes, if any
    pub fn push(&mut self, frame: Frame) -> Result<Option<Message>> {
        let opcode = frame.header.opcode;
        match (opcode, self.opcode) {
            (OpCode::Text | OpCode::Binary, Some(_)) => {
                return Err(Error::Protocol("expected continuation frame"));
            }
            (OpCode::Continuation, None) => {
                return Err(Error::Protocol("unexpected continuation frame"));
            }
            (OpCode::Text | OpCode::Binary | OpCode::Continuation, _) => {}
            _ => return Err(Error::Protocol("control frame passed to assembler")),
        }

        let total = self.buf.len() + frame.payload.len();
        if total > self.max_message_size {
            return Err(Error::PayloadTooLarge {
                declared: total as u64,
                limit: self.max_message_size as u64,
            });
        }

        // Unfragmented message, no copy
        if frame.header.fin && opcode != OpCode::Continuation {
            return Self::finish(opcode, frame.payload).map(Some);
        }

        if opcode != OpCode::Continuation {
            self.opcode = Some(opcode);
        }
        self.buf.extend_from_slice(&frame.payload);

        let message_opcode = self.opcode.unwrap_or(opcode);
        if !frame.header.fin {
            if message_opcode == OpCode::Text && !validate_utf8_incomplete(&self.buf) {
                return Err(Error::InvalidUtf8);
            }
            return Ok(None);
        }

        self.opcode = None;
        let data = self.buf.split().freeze();
        Self::finish(message_opcode, data).map(Some)
    }

    fn finish(opcode: OpCode, data: Bytes) -> Result<Message> {
        match opcode {
            OpCode::Text => {
                if !validate_utf8(&data) {
                    return Err(Error::InvalidUtf8);
                }
                Ok(Message::Text(data))
            }
            OpCode::Binary => Ok(Message::Binary(data)),
            _ => Err(Error::Protocol("invalid fragment opcode")),
        }
    }
}

/// Parse and validate a Close frame payload
pub fn parse_close_payload(payload: &[u8]) -> Result<Option<CloseReason>> {
    match payload.len() {
        0 => Ok(None),
        1 => Err(Error::Protocol("invalid close frame payload")),
        _ => {
            let code = u16::from_be_bytes([payload[0], payload[1]]);
            if !CloseReason::is_valid_code(code) {
                return Err(Error::InvalidCloseCode(code));
            }
            let reason =
                simdutf8::basic::from_utf8(&payload[2..]).map_err(|_| Error::InvalidUtf8)?;
            Ok(Some(CloseReason::new(code, reason)))
        }
    }
}

/// WebSocket protocol handler
///
/// Owns the frame decoder and the assembler for one connection.
#[derive(Debug)]
pub struct Protocol {
    decoder: FrameDecoder,
    assembler: MessageAssembler,
    /// A Close frame was decoded; later bytes are ignored
    close_received: bool,
}

impl Protocol {
    /// Create a new protocol handler
    pub fn new(max_frame_size: usize, max_message_size: usize, expect_masked: bool) -> Self {
        Self {
            decoder: FrameDecoder::new(max_frame_size, expect_masked),
            assembler: MessageAssembler::new(max_message_size),
            close_received: false,
        }
    }

    /// Create a handler from session configuration
    pub fn from_config(config: &Config) -> Self {
        Self::new(
            config.max_frame_size,
            config.max_message_size,
            config.require_masking,
        )
    }

    /// Whether a Close frame has been decoded
    #[inline]
    pub fn close_received(&self) -> bool {
        self.close_received
    }

    /// Process incoming bytes and return complete messages
    pub fn process(&mut self, data: &[u8]) -> Result<Vec<Message>> {
        let mut messages = Vec::new();
        self.process_into(data, &mut messages)?;
        Ok(messages)
    }

    /// Process incoming bytes into a reusable message buffer
    ///
    /// `messages` is cleared first. On error it still holds every message
    /// decoded ahead of the offending frame, in order.
    pub fn process_into(&mut self, data: &[u8], messages: &mut Vec<Message>) -> Result<()> {
        messages.clear();
        if self.close_received {
            return Ok(());
        }

        self.decoder.extend(data);
        while let Some(frame) = self.decoder.next_frame().inspect_err(|_| self.reset())? {
            let message = match frame.header.opcode {
                OpCode::Ping => Some(Message::Ping(frame.payload)),
                OpCode::Pong => Some(Message::Pong(frame.payload)),
                OpCode::Close => {
                    let reason =
                        parse_close_payload(&frame.payload).inspect_err(|_| self.reset())?;
                    self.close_received = true;
                    self.reset();
                    messages.push(Message::Close(reason));
                    break;
                }
                _ => self.assembler.push(frame).inspect_err(|_| self.reset())?,
            };
            if let Some(message) = message {
                messages.push(message);
            }
        }

        Ok(())
    }

    /// Discard partial frames and messages
    pub fn reset(&mut self) {
        self.decoder.reset();
        self.assembler.reset();
    }
}
