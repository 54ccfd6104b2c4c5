//! WebSocket frame parsing and serialization
//!
//! This module implements RFC 6455 frame handling:
//! - An incremental decoder that accepts reads of any size and never
//!   assumes one read holds exactly one frame
//! - Declared lengths are checked against the configured maximum before
//!   any payload space is reserved
//! - Minimal-length encoding for outbound frames

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::{Error, Result};
use crate::mask::apply_mask;
use crate::{MAX_CONTROL_PAYLOAD, MEDIUM_MESSAGE_THRESHOLD, SMALL_MESSAGE_THRESHOLD};

/// WebSocket opcode
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum OpCode {
    /// Continuation frame
    Continuation = 0x0,
    /// Text frame
    Text = 0x1,
    /// Binary frame
    Binary = 0x2,
    /// Connection close
    Close = 0x8,
    /// Ping
    Ping = 0x9,
    /// Pong
    Pong = 0xA,
}

impl OpCode {
    /// Parse opcode from the low nibble of the first header byte.
    ///
    /// Reserved values (0x3-0x7, 0xB-0xF) yield `None`.
    #[inline]
    pub fn from_u8(byte: u8) -> Option<Self> {
        match byte {
            0x0 => Some(OpCode::Continuation),
            0x1 => Some(OpCode::Text),
            0x2 => Some(OpCode::Binary),
            0x8 => Some(OpCode::Close),
            0x9 => Some(OpCode::Ping),
            0xA => Some(OpCode::Pong),
            _ => None,
        }
    }

    /// Check if this is a control frame
    #[inline]
    pub fn is_control(&self) -> bool {
        (*self as u8) >= 0x8
    }
}

/// A parsed WebSocket frame header
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FrameHeader {
    /// Final fragment flag
    pub fin: bool,
    /// RSV1
    pub rsv1: bool,
    /// RSV2
    pub rsv2: bool,
    /// RSV3
    pub rsv3: bool,
    /// Frame opcode
    pub opcode: OpCode,
    /// Mask flag
    pub masked: bool,
    /// Payload length
    pub payload_len: u64,
    /// Masking key, present iff `masked`
    pub mask: Option<[u8; 4]>,
}

/// A complete WebSocket frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// Frame header
    pub header: FrameHeader,
    /// Frame payload (already unmasked)
    pub payload: Bytes,
}

impl Frame {
    /// Create a new unmasked frame
    pub fn new(opcode: OpCode, payload: Bytes, fin: bool) -> Self {
        Self {
            header: FrameHeader {
                fin,
                rsv1: false,
                rsv2: false,
                rsv3: false,
                opcode,
                masked: false,
                payload_len: payload.len() as u64,
                mask: None,
            },
            payload,
        }
    }

    /// Create a text frame
    #[inline]
    pub fn text(data: impl Into<Bytes>) -> Self {
        Self::new(OpCode::Text, data.into(), true)
    }

    /// Create a binary frame
    #[inline]
    pub fn binary(data: impl Into<Bytes>) -> Self {
        Self::new(OpCode::Binary, data.into(), true)
    }

    /// Create a close frame carrying a status code and reason
    #[inline]
    pub fn close(code: u16, reason: &str) -> Self {
        Self::new(OpCode::Close, close_payload(code, reason), true)
    }

    /// Mask this frame with `key` when it is serialized
    pub fn with_mask(mut self, key: [u8; 4]) -> Self {
        self.header.masked = true;
        self.header.mask = Some(key);
        self
    }

    /// Serialize header and payload, masking the payload if a key is set
    pub fn encode(&self, buf: &mut BytesMut) {
        encode_frame(
            buf,
            self.header.opcode,
            &self.payload,
            self.header.fin,
            self.header.mask,
        );
    }
}

/// Build a Close payload: big-endian status code followed by UTF-8 reason
pub fn close_payload(code: u16, reason: &str) -> Bytes {
    let mut payload = BytesMut::with_capacity(2 + reason.len());
    payload.put_u16(code);
    payload.put_slice(reason.as_bytes());
    payload.freeze()
}

/// Outcome of feeding bytes to a [`FrameDecoder`]
#[derive(Debug)]
pub enum DecodeEvent {
    /// A complete frame, payload already unmasked
    FrameReady(Frame),
    /// The buffered bytes do not yet hold a complete frame
    NeedMoreBytes,
    /// The stream is malformed; the decoder accepts no further input
    Error(Error),
}

/// Incremental frame decoder
///
/// Bytes are appended to an internal accumulator; a header is consumed
/// only once all of its bytes (including extended length and masking key)
/// are present, and a payload only once it is complete. Leftover bytes
/// belonging to the next frame stay buffered.
#[derive(Debug)]
pub struct FrameDecoder {
    buf: BytesMut,
    /// Header whose payload is still arriving
    pending: Option<FrameHeader>,
    max_frame_size: u64,
    /// Whether the peer is required to mask (server side)
    expect_masked: bool,
    failed: bool,
}

impl FrameDecoder {
    /// Create a new decoder
    pub fn new(max_frame_size: usize, expect_masked: bool) -> Self {
        Self {
            buf: BytesMut::new(),
            pending: None,
            max_frame_size: max_frame_size as u64,
            expect_masked,
            failed: false,
        }
    }

    /// Number of bytes buffered but not yet consumed by a complete frame
    pub fn buffered(&self) -> usize {
        self.buf.len()
    }

    /// Whether a previous call hit a malformed frame
    pub fn is_failed(&self) -> bool {
        self.failed
    }

    /// Drop any partial frame and buffered bytes
    pub fn reset(&mut self) {
        self.buf = BytesMut::new();
        self.pending = None;
    }

    /// Append bytes and decode every frame they complete
    ///
    /// `NeedMoreBytes` is reported only when the call completed no frame
    /// and hit no error.
    pub fn feed(&mut self, data: &[u8]) -> Vec<DecodeEvent> {
        self.extend(data);

        let mut events = Vec::new();
        loop {
            match self.next_frame() {
                Ok(Some(frame)) => events.push(DecodeEvent::FrameReady(frame)),
                Ok(None) => {
                    if events.is_empty() {
                        events.push(DecodeEvent::NeedMoreBytes);
                    }
                    break;
                }
                Err(e) => {
                    events.push(DecodeEvent::Error(e));
                    break;
                }
            }
        }
        events
    }

    /// Append bytes without decoding
    #[inline]
    pub fn extend(&mut self, data: &[u8]) {
        if !self.failed {
            self.buf.extend_from_slice(data);
        }
    }

    /// Decode the next complete frame from the buffered bytes
    ///
    /// Returns:
    /// - Ok(Some(frame)) if a complete frame was decoded
    /// - Ok(None) if more data is needed
    /// - Err(e) if the stream is malformed; every later call fails too
    pub fn next_frame(&mut self) -> Result<Option<Frame>> {
        if self.failed {
            return Err(Error::InvalidState("decoder failed on earlier input"));
        }

        let result = self.advance();
        if result.is_err() {
            self.failed = true;
            self.reset();
        }
        result
    }

    fn advance(&mut self) -> Result<Option<Frame>> {
        let header = match self.pending.take() {
            Some(header) => header,
            None => match self.parse_header()? {
                Some(header) => header,
                None => return Ok(None),
            },
        };

        // Bounded by max_frame_size in parse_header
        let len = header.payload_len as usize;
        if self.buf.len() < len {
            self.buf.reserve(len - self.buf.len());
            self.pending = Some(header);
            return Ok(None);
        }

        let mut payload = self.buf.split_to(len);
        if let Some(key) = header.mask {
            apply_mask(&mut payload, key);
        }

        tracing::trace!(
            opcode = ?header.opcode,
            fin = header.fin,
            len,
            "decoded frame"
        );

        Ok(Some(Frame {
            header,
            payload: payload.freeze(),
        }))
    }

    /// Parse a header from the front of the buffer without consuming
    /// anything until every header byte is present.
    fn parse_header(&mut self) -> Result<Option<FrameHeader>> {
        if self.buf.len() < 2 {
            return Ok(None);
        }

        let b0 = self.buf[0];
        let b1 = self.buf[1];

        let fin = b0 & 0x80 != 0;
        let rsv1 = b0 & 0x40 != 0;
        let rsv2 = b0 & 0x20 != 0;
        let rsv3 = b0 & 0x10 != 0;

        // No extension is ever negotiated
        if rsv1 || rsv2 || rsv3 {
            return Err(Error::Protocol("reserved bits must be 0"));
        }

        let opcode = OpCode::from_u8(b0 & 0x0F).ok_or(Error::Protocol("reserved opcode"))?;

        if opcode.is_control() && !fin {
            return Err(Error::Protocol("control frame must not be fragmented"));
        }

        let masked = b1 & 0x80 != 0;
        if self.expect_masked && !masked {
            return Err(Error::Protocol("client frames must be masked"));
        }
        if !self.expect_masked && masked {
            return Err(Error::Protocol("server frames must not be masked"));
        }

        let len_byte = b1 & 0x7F;
        let ext_len = match len_byte {
            126 => 2,
            127 => 8,
            _ => 0,
        };
        if self.buf.len() < 2 + ext_len {
            return Ok(None);
        }

        let payload_len = match len_byte {
            126 => {
                let len = u16::from_be_bytes([self.buf[2], self.buf[3]]) as u64;
                if len <= SMALL_MESSAGE_THRESHOLD as u64 {
                    return Err(Error::Protocol("payload length not minimal"));
                }
                len
            }
            127 => {
                let mut raw = [0u8; 8];
                raw.copy_from_slice(&self.buf[2..10]);
                let len = u64::from_be_bytes(raw);
                if len >> 63 != 0 {
                    return Err(Error::Protocol("payload length MSB must be 0"));
                }
                if len <= MEDIUM_MESSAGE_THRESHOLD as u64 {
                    return Err(Error::Protocol("payload length not minimal"));
                }
                len
            }
            n => n as u64,
        };

        if opcode.is_control() && payload_len > MAX_CONTROL_PAYLOAD as u64 {
            return Err(Error::Protocol("control frame too large"));
        }

        if payload_len > self.max_frame_size {
            return Err(Error::PayloadTooLarge {
                declared: payload_len,
                limit: self.max_frame_size,
            });
        }

        let header_size = 2 + ext_len + if masked { 4 } else { 0 };
        if self.buf.len() < header_size {
            return Ok(None);
        }

        let mask = if masked {
            let at = 2 + ext_len;
            Some([
                self.buf[at],
                self.buf[at + 1],
                self.buf[at + 2],
                self.buf[at + 3],
            ])
        } else {
            None
        };

        self.buf.advance(header_size);

        Ok(Some(FrameHeader {
            fin,
            rsv1,
            rsv2,
            rsv3,
            opcode,
            masked,
            payload_len,
            mask,
        }))
    }
}

/// Encode a single final, unmasked frame
///
/// This is the server-side encoder: server frames are never masked and
/// outbound messages are never fragmented.
#[inline]
pub fn encode(opcode: OpCode, payload: &[u8]) -> Bytes {
    let mut buf = BytesMut::new();
    encode_frame(&mut buf, opcode, payload, true, None);
    buf.freeze()
}

/// Encode a frame into a buffer
///
/// Chooses the 7-bit, 16-bit or 64-bit length encoding, whichever is
/// smallest. When `mask` is set the payload is copied and masked.
pub fn encode_frame(
    buf: &mut BytesMut,
    opcode: OpCode,
    payload: &[u8],
    fin: bool,
    mask: Option<[u8; 4]>,
) {
    let payload_len = payload.len();

    let header_size = 2
        + if payload_len > MEDIUM_MESSAGE_THRESHOLD {
            8
        } else if payload_len > SMALL_MESSAGE_THRESHOLD {
            2
        } else {
            0
        }
        + if mask.is_some() { 4 } else { 0 };

    buf.reserve(header_size + payload_len);

    let mut b0 = opcode as u8;
    if fin {
        b0 |= 0x80;
    }
    buf.put_u8(b0);

    let mask_bit = if mask.is_some() { 0x80 } else { 0x00 };

    if payload_len <= SMALL_MESSAGE_THRESHOLD {
        buf.put_u8(mask_bit | payload_len as u8);
    } else if payload_len <= MEDIUM_MESSAGE_THRESHOLD {
        buf.put_u8(mask_bit | 126);
        buf.put_u16(payload_len as u16);
    } else {
        buf.put_u8(mask_bit | 127);
        buf.put_u64(payload_len as u64);
    }

    if let Some(m) = mask {
        buf.put_slice(&m);

        let start = buf.len();
        buf.put_slice(payload);
        apply_mask(&mut buf[start..], m);
    } else {
        buf.put_slice(payload);
    }
}
