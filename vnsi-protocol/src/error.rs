//! Error types for the VNSI wire protocol.

use thiserror::Error;

/// Protocol-level errors raised while framing or parsing packets.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    /// Request was not addressed to the control channel.
    #[error("Invalid channel id: {0}")]
    InvalidChannel(u32),

    /// Declared payload length exceeds the sanity ceiling.
    #[error("Payload too large: {0} bytes (max: {1})")]
    PayloadTooLarge(u32, u32),

    /// A field extraction ran past the end of the payload.
    #[error("Truncated payload: needed {needed} bytes at offset {offset}, {available} available")]
    Truncated {
        offset: usize,
        needed: usize,
        available: usize,
    },

    /// A string field had no terminating NUL.
    #[error("Unterminated string at offset {0}")]
    UnterminatedString(usize),

    /// A string field was not valid UTF-8.
    #[error("Invalid UTF-8 string at offset {0}")]
    InvalidString(usize),

    /// Frame buffer is shorter than its header claims.
    #[error("Incomplete frame: expected {expected} bytes, got {actual}")]
    IncompleteFrame { expected: usize, actual: usize },

    /// Unknown frame kind.
    #[error("Unknown frame kind: {0}")]
    UnknownKind(u32),
}

/// Status code carried inside response payloads.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum ReturnCode {
    /// Operation succeeded.
    Ok = 0,
    /// Timer is currently recording.
    RecordingRunning = 1,
    /// Operation is not available.
    NotSupported = 995,
    /// Referenced object does not exist.
    DataUnknown = 996,
    /// Resource is in use.
    DataLocked = 997,
    /// Request data is invalid.
    DataInvalid = 998,
    /// Generic failure.
    Error = 999,
}

impl From<u32> for ReturnCode {
    fn from(value: u32) -> Self {
        match value {
            0 => ReturnCode::Ok,
            1 => ReturnCode::RecordingRunning,
            995 => ReturnCode::NotSupported,
            996 => ReturnCode::DataUnknown,
            997 => ReturnCode::DataLocked,
            998 => ReturnCode::DataInvalid,
            _ => ReturnCode::Error,
        }
    }
}

impl From<ReturnCode> for u32 {
    fn from(value: ReturnCode) -> Self {
        value as u32
    }
}

impl ReturnCode {
    /// Returns true if this code indicates success.
    pub fn is_ok(self) -> bool {
        self == ReturnCode::Ok
    }
}
