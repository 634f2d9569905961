//! Codec for VNSI request and response frames.
//!
//! Request frame (all fields big-endian):
//! ```text
//! +---------+------------+---------+-------------+-----------+
//! | Channel | Request id | Opcode  | Payload len |  Payload  |
//! | u32 = 1 |    u32     |   u32   | u32 <= 200k | variable  |
//! +---------+------------+---------+-------------+-----------+
//! ```
//!
//! Response, status and scan frames:
//! ```text
//! +---------+----------------------+-------------+-----------+
//! |  Kind   | Request id / event   | Payload len |  Payload  |
//! +---------+----------------------+-------------+-----------+
//! ```
//!
//! Stream frames carry a 40-byte header:
//! `kind | opcode | stream id | duration | pts (s64) | dts (s64) | serial | payload len`.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::{ProtocolError, ReturnCode};
use crate::types::*;

/// Decoded request header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RequestHeader {
    /// Channel id, must be [`CONTROL_CHANNEL`].
    pub channel: u32,
    /// Client-chosen id echoed in the response.
    pub request_id: u32,
    /// Raw opcode; unknown values are dispatched as such.
    pub opcode: u32,
    /// Number of payload bytes following the header.
    pub payload_len: u32,
}

impl RequestHeader {
    /// Parse the four header words without validating them.
    pub fn from_bytes(buf: &[u8; REQUEST_HEADER_SIZE]) -> Self {
        let mut b = &buf[..];
        Self {
            channel: b.get_u32(),
            request_id: b.get_u32(),
            opcode: b.get_u32(),
            payload_len: b.get_u32(),
        }
    }

    /// Reject headers that must close the connection.
    pub fn validate(&self) -> Result<(), ProtocolError> {
        if self.channel != CONTROL_CHANNEL {
            return Err(ProtocolError::InvalidChannel(self.channel));
        }
        if self.payload_len > MAX_PAYLOAD_SIZE {
            return Err(ProtocolError::PayloadTooLarge(
                self.payload_len,
                MAX_PAYLOAD_SIZE,
            ));
        }
        Ok(())
    }
}

/// Decode and validate a request header.
///
/// Returns `Ok(None)` if `buf` is shorter than a header.
pub fn decode_request_header(buf: &[u8]) -> Result<Option<RequestHeader>, ProtocolError> {
    let Some(raw) = buf.get(..REQUEST_HEADER_SIZE) else {
        return Ok(None);
    };
    let mut fixed = [0u8; REQUEST_HEADER_SIZE];
    fixed.copy_from_slice(raw);
    let header = RequestHeader::from_bytes(&fixed);
    header.validate()?;
    Ok(Some(header))
}

/// Encode a complete request frame.
pub fn encode_request(request_id: u32, opcode: u32, payload: &[u8]) -> Bytes {
    let mut buf = BytesMut::with_capacity(REQUEST_HEADER_SIZE + payload.len());
    buf.put_u32(CONTROL_CHANNEL);
    buf.put_u32(request_id);
    buf.put_u32(opcode);
    buf.put_u32(payload.len() as u32);
    buf.put_slice(payload);
    buf.freeze()
}

/// Typed field writers shared by requests and responses.
pub trait FieldWriter {
    /// Buffer the fields are appended to.
    fn buffer(&mut self) -> &mut BytesMut;

    fn add_u8(&mut self, value: u8) -> &mut Self
    where
        Self: Sized,
    {
        self.buffer().put_u8(value);
        self
    }

    fn add_u32(&mut self, value: u32) -> &mut Self
    where
        Self: Sized,
    {
        self.buffer().put_u32(value);
        self
    }

    fn add_s32(&mut self, value: i32) -> &mut Self
    where
        Self: Sized,
    {
        self.buffer().put_i32(value);
        self
    }

    fn add_u64(&mut self, value: u64) -> &mut Self
    where
        Self: Sized,
    {
        self.buffer().put_u64(value);
        self
    }

    fn add_s64(&mut self, value: i64) -> &mut Self
    where
        Self: Sized,
    {
        self.buffer().put_i64(value);
        self
    }

    /// Append a NUL-terminated string. Interior NULs end the string early on the peer.
    fn add_string(&mut self, value: &str) -> &mut Self
    where
        Self: Sized,
    {
        let buf = self.buffer();
        buf.put_slice(value.as_bytes());
        buf.put_u8(0);
        self
    }

    fn add_bytes(&mut self, value: &[u8]) -> &mut Self
    where
        Self: Sized,
    {
        self.buffer().put_slice(value);
        self
    }

    fn add_status(&mut self, code: ReturnCode) -> &mut Self
    where
        Self: Sized,
    {
        self.add_u32(code.into())
    }
}

/// Builder for request payloads.
#[derive(Debug, Default)]
pub struct RequestBuilder {
    buf: BytesMut,
}

impl RequestBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Encode the accumulated payload as a request frame.
    pub fn encode(&self, request_id: u32, opcode: Opcode) -> Bytes {
        encode_request(request_id, opcode.into(), &self.buf)
    }

    pub fn payload(&self) -> &[u8] {
        &self.buf
    }
}

impl FieldWriter for RequestBuilder {
    fn buffer(&mut self) -> &mut BytesMut {
        &mut self.buf
    }
}

/// A received request with a read cursor over its payload.
#[derive(Debug, Clone)]
pub struct RequestPacket {
    request_id: u32,
    opcode: u32,
    payload: Bytes,
    pos: usize,
}

impl RequestPacket {
    pub fn new(request_id: u32, opcode: u32, payload: Bytes) -> Self {
        Self {
            request_id,
            opcode,
            payload,
            pos: 0,
        }
    }

    pub fn request_id(&self) -> u32 {
        self.request_id
    }

    pub fn opcode(&self) -> u32 {
        self.opcode
    }

    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    pub fn payload_len(&self) -> usize {
        self.payload.len()
    }

    /// Unread payload bytes.
    pub fn remaining(&self) -> usize {
        self.payload.len() - self.pos
    }

    /// True once every payload byte has been extracted.
    pub fn end(&self) -> bool {
        self.pos >= self.payload.len()
    }

    fn take(&mut self, needed: usize) -> Result<&[u8], ProtocolError> {
        let available = self.remaining();
        if needed > available {
            return Err(ProtocolError::Truncated {
                offset: self.pos,
                needed,
                available,
            });
        }
        let start = self.pos;
        self.pos += needed;
        Ok(&self.payload[start..self.pos])
    }

    pub fn extract_u8(&mut self) -> Result<u8, ProtocolError> {
        Ok(self.take(1)?[0])
    }

    pub fn extract_u32(&mut self) -> Result<u32, ProtocolError> {
        Ok(self.take(4)?.get_u32())
    }

    pub fn extract_s32(&mut self) -> Result<i32, ProtocolError> {
        Ok(self.take(4)?.get_i32())
    }

    pub fn extract_u64(&mut self) -> Result<u64, ProtocolError> {
        Ok(self.take(8)?.get_u64())
    }

    pub fn extract_s64(&mut self) -> Result<i64, ProtocolError> {
        Ok(self.take(8)?.get_i64())
    }

    /// Extract a NUL-terminated UTF-8 string.
    pub fn extract_string(&mut self) -> Result<String, ProtocolError> {
        let start = self.pos;
        let rest = &self.payload[start..];
        let Some(nul) = rest.iter().position(|&b| b == 0) else {
            return Err(ProtocolError::UnterminatedString(start));
        };
        let value = std::str::from_utf8(&rest[..nul])
            .map_err(|_| ProtocolError::InvalidString(start))?
            .to_string();
        self.pos += nul + 1;
        Ok(value)
    }
}

/// Fields of a stream frame header after the kind word.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamHeader {
    pub opcode: u32,
    pub stream_id: u32,
    pub duration: u32,
    pub pts: i64,
    pub dts: i64,
    pub serial: u32,
}

/// Decoded header of a server frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResponseHeader {
    pub kind: ResponseKind,
    /// Request id for responses, event id for status/scan, stream opcode for stream frames.
    pub id: u32,
    pub payload_len: u32,
    /// Present for [`ResponseKind::Stream`] frames.
    pub stream: Option<StreamHeader>,
}

impl ResponseHeader {
    pub fn header_len(&self) -> usize {
        if self.stream.is_some() {
            STREAM_HEADER_SIZE
        } else {
            RESPONSE_HEADER_SIZE
        }
    }

    /// Total frame length, header included.
    pub fn frame_len(&self) -> usize {
        self.header_len() + self.payload_len as usize
    }
}

/// Decode the header of a server frame.
///
/// Returns `Ok(None)` if `buf` does not yet hold the whole header.
pub fn decode_response_header(buf: &[u8]) -> Result<Option<ResponseHeader>, ProtocolError> {
    if buf.len() < 4 {
        return Ok(None);
    }
    let mut b = buf;
    let kind_raw = b.get_u32();
    let kind = ResponseKind::try_from(kind_raw).map_err(ProtocolError::UnknownKind)?;

    if kind == ResponseKind::Stream {
        if buf.len() < STREAM_HEADER_SIZE {
            return Ok(None);
        }
        let opcode = b.get_u32();
        let stream = StreamHeader {
            opcode,
            stream_id: b.get_u32(),
            duration: b.get_u32(),
            pts: b.get_i64(),
            dts: b.get_i64(),
            serial: b.get_u32(),
        };
        let payload_len = b.get_u32();
        return Ok(Some(ResponseHeader {
            kind,
            id: opcode,
            payload_len,
            stream: Some(stream),
        }));
    }

    if buf.len() < RESPONSE_HEADER_SIZE {
        return Ok(None);
    }
    let id = b.get_u32();
    let payload_len = b.get_u32();
    Ok(Some(ResponseHeader {
        kind,
        id,
        payload_len,
        stream: None,
    }))
}

/// An outgoing frame under construction.
///
/// The header is written up front with a zero length; [`ResponsePacket::finalise`]
/// stamps the payload length into it.
#[derive(Debug, Clone)]
pub struct ResponsePacket {
    kind: ResponseKind,
    header_len: usize,
    buf: BytesMut,
}

impl ResponsePacket {
    fn with_header(kind: ResponseKind, id: u32) -> Self {
        let mut buf = BytesMut::with_capacity(512);
        buf.put_u32(kind.into());
        buf.put_u32(id);
        buf.put_u32(0);
        Self {
            kind,
            header_len: RESPONSE_HEADER_SIZE,
            buf,
        }
    }

    /// Reply to the request with `request_id`.
    pub fn response(request_id: u32) -> Self {
        Self::with_header(ResponseKind::Response, request_id)
    }

    /// Asynchronous status notification.
    pub fn status(event: StatusEvent) -> Self {
        Self::with_header(ResponseKind::Status, event as u32)
    }

    /// Channel scan progress notification.
    pub fn scan(event: ScanEventKind) -> Self {
        Self::with_header(ResponseKind::Scan, event as u32)
    }

    /// Live stream frame.
    pub fn stream(
        opcode: StreamPacketType,
        stream_id: u32,
        duration: u32,
        pts: i64,
        dts: i64,
        serial: u32,
    ) -> Self {
        let mut buf = BytesMut::with_capacity(STREAM_HEADER_SIZE + 2048);
        buf.put_u32(ResponseKind::Stream.into());
        buf.put_u32(opcode as u32);
        buf.put_u32(stream_id);
        buf.put_u32(duration);
        buf.put_i64(pts);
        buf.put_i64(dts);
        buf.put_u32(serial);
        buf.put_u32(0);
        Self {
            kind: ResponseKind::Stream,
            header_len: STREAM_HEADER_SIZE,
            buf,
        }
    }

    /// Rebuild a packet from a finalised frame.
    pub fn from_frame(frame: &[u8]) -> Result<Self, ProtocolError> {
        let header = decode_response_header(frame)?.ok_or(ProtocolError::IncompleteFrame {
            expected: RESPONSE_HEADER_SIZE,
            actual: frame.len(),
        })?;
        let expected = header.frame_len();
        if frame.len() != expected {
            return Err(ProtocolError::IncompleteFrame {
                expected,
                actual: frame.len(),
            });
        }
        let header_len = header.header_len();
        let mut buf = BytesMut::from(frame);
        // length is re-stamped by finalise
        buf[header_len - 4..header_len].fill(0);
        Ok(Self {
            kind: header.kind,
            header_len,
            buf,
        })
    }

    pub fn kind(&self) -> ResponseKind {
        self.kind
    }

    /// Second header word: request id, event id or stream opcode.
    pub fn id(&self) -> u32 {
        (&self.buf[4..8]).get_u32()
    }

    pub fn payload(&self) -> &[u8] {
        &self.buf[self.header_len..]
    }

    pub fn payload_len(&self) -> usize {
        self.buf.len() - self.header_len
    }

    /// Grow the payload by `len` zeroed bytes and return them for direct writing.
    pub fn reserve(&mut self, len: usize) -> &mut [u8] {
        let start = self.buf.len();
        self.buf.resize(start + len, 0);
        &mut self.buf[start..]
    }

    /// Drop the last `len` payload bytes, typically the unused tail of a reservation.
    pub fn unreserve(&mut self, len: usize) {
        let len = len.min(self.payload_len());
        let new_len = self.buf.len() - len;
        self.buf.truncate(new_len);
    }

    /// Stamp the payload length and return the wire frame.
    pub fn finalise(mut self) -> Bytes {
        let len = self.payload_len() as u32;
        let at = self.header_len - 4;
        self.buf[at..at + 4].copy_from_slice(&len.to_be_bytes());
        self.buf.freeze()
    }
}

impl FieldWriter for ResponsePacket {
    fn buffer(&mut self) -> &mut BytesMut {
        &mut self.buf
    }
}
