//! Wire protocol definitions for the VNSI streaming server.
//!
//! Requests arrive on the control channel with a 16-byte big-endian header;
//! the server answers on the same socket with response frames, interleaved
//! with asynchronous status/scan notifications and live stream frames.
//!
//! # Example
//!
//! ```rust
//! use vnsi_protocol::{decode_request_header, FieldWriter, Opcode, RequestBuilder, ResponsePacket, ReturnCode};
//!
//! let mut req = RequestBuilder::new();
//! req.add_u32(11).add_u8(0).add_string("client");
//! let frame = req.encode(1, Opcode::Login);
//! let header = decode_request_header(&frame).unwrap().unwrap();
//! assert_eq!(header.payload_len as usize, frame.len() - 16);
//!
//! let mut resp = ResponsePacket::response(header.request_id);
//! resp.add_status(ReturnCode::Ok);
//! assert_eq!(resp.finalise().len(), 16);
//! ```

pub mod codec;
pub mod error;
pub mod types;

pub use codec::{
    decode_request_header, decode_response_header, encode_request, FieldWriter, RequestBuilder,
    RequestHeader, RequestPacket, ResponseHeader, ResponsePacket, StreamHeader,
};
pub use error::{ProtocolError, ReturnCode};
pub use types::{
    scan_support, Opcode, ResponseKind, ScanEventKind, StatusEvent, StreamPacketType,
    CONTROL_CHANNEL, MAX_PAYLOAD_SIZE, MIN_PROTOCOL_VERSION, NO_PTS, PICON_PROTOCOL_VERSION,
    PROTOCOL_VERSION, RDS_PROTOCOL_VERSION, REQUEST_HEADER_SIZE, RESPONSE_HEADER_SIZE,
    SERVER_NAME, STREAM_HEADER_SIZE,
};
