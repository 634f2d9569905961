//! Opcode handler table.
//!
//! Every opcode maps to exactly one [`HandlerEntry`] describing the request
//! fields it reads and the shape of its reply. The table is checked for
//! completeness when the server is built.

use std::collections::{HashMap, HashSet};

use futures::future::BoxFuture;
use thiserror::Error;
use vnsi_protocol::{Opcode, ProtocolError, RequestPacket, ResponsePacket};

use super::session::ClientSession;

/// One wire field of a request or reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Field {
    U8,
    U32,
    S32,
    U64,
    S64,
    Str,
    /// Fields after this marker may be absent.
    Optional,
}

impl Field {
    /// Smallest encoded width.
    fn min_width(self) -> usize {
        match self {
            Field::U8 | Field::Str => 1,
            Field::U32 | Field::S32 => 4,
            Field::U64 | Field::S64 => 8,
            Field::Optional => 0,
        }
    }

    /// Consume one field from `buf`, returning the rest.
    fn skip(self, buf: &[u8]) -> Option<&[u8]> {
        match self {
            Field::Str => {
                let nul = buf.iter().position(|b| *b == 0)?;
                Some(&buf[nul + 1..])
            }
            Field::Optional => Some(buf),
            other => buf.get(other.min_width()..),
        }
    }
}

pub type RequestSchema = &'static [Field];

/// Minimum payload length of a request schema.
pub fn mandatory_len(schema: RequestSchema) -> usize {
    schema
        .iter()
        .take_while(|f| **f != Field::Optional)
        .map(|f| f.min_width())
        .sum()
}

/// Shape of a reply payload.
#[derive(Debug, Clone, Copy)]
pub enum ResponseShape {
    Empty,
    Fields(&'static [Field]),
    /// Zero or more records of the given fields.
    Records(&'static [Field]),
    /// Fixed fields followed by records.
    Prefixed(&'static [Field], &'static [Field]),
    OneOf(&'static [ResponseShape]),
    /// Opaque bytes.
    Raw,
    /// The handler never lets the dispatcher write a reply.
    NoReply,
}

fn skip_fields<'a>(fields: &[Field], mut buf: &'a [u8]) -> Option<&'a [u8]> {
    for field in fields {
        buf = field.skip(buf)?;
    }
    Some(buf)
}

fn skip_records(fields: &[Field], mut buf: &[u8]) -> bool {
    if fields.is_empty() {
        return buf.is_empty();
    }
    while !buf.is_empty() {
        match skip_fields(fields, buf) {
            Some(rest) => buf = rest,
            None => return false,
        }
    }
    true
}

impl ResponseShape {
    pub fn conforms(&self, payload: &[u8]) -> bool {
        match self {
            ResponseShape::Empty => payload.is_empty(),
            ResponseShape::Fields(fields) => skip_fields(fields, payload).map_or(false, |rest| rest.is_empty()),
            ResponseShape::Records(fields) => skip_records(fields, payload),
            ResponseShape::Prefixed(prefix, fields) => {
                skip_fields(prefix, payload).map_or(false, |rest| skip_records(fields, rest))
            }
            ResponseShape::OneOf(shapes) => shapes.iter().any(|s| s.conforms(payload)),
            ResponseShape::Raw => true,
            ResponseShape::NoReply => false,
        }
    }
}

/// What the dispatcher does after a handler returns.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// Write the response.
    Reply,
    /// Write nothing; the handler answered (or deliberately did not).
    Silent,
    /// End the connection without a reply.
    Close,
}

pub type HandlerResult = Result<Disposition, ProtocolError>;

pub type SyncHandler = fn(&mut ClientSession, &mut RequestPacket, &mut ResponsePacket) -> HandlerResult;

pub type AsyncHandler = for<'a> fn(
    &'a mut ClientSession,
    &'a mut RequestPacket,
    &'a mut ResponsePacket,
) -> BoxFuture<'a, HandlerResult>;

#[derive(Clone, Copy)]
pub enum Handler {
    Sync(SyncHandler),
    Async(AsyncHandler),
}

#[derive(Clone, Copy)]
pub struct HandlerEntry {
    pub opcode: Opcode,
    pub name: &'static str,
    pub request: RequestSchema,
    pub response: ResponseShape,
    pub handler: Handler,
}

impl std::fmt::Debug for HandlerEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandlerEntry")
            .field("opcode", &self.opcode)
            .field("name", &self.name)
            .finish()
    }
}

/// Build a [`HandlerEntry`] named after its opcode.
macro_rules! entry {
    (sync $op:ident, $request:expr, $response:expr, $f:expr) => {
        $crate::server::registry::HandlerEntry {
            opcode: vnsi_protocol::Opcode::$op,
            name: stringify!($op),
            request: $request,
            response: $response,
            handler: $crate::server::registry::Handler::Sync($f),
        }
    };
    (async $op:ident, $request:expr, $response:expr, $f:expr) => {
        $crate::server::registry::HandlerEntry {
            opcode: vnsi_protocol::Opcode::$op,
            name: stringify!($op),
            request: $request,
            response: $response,
            handler: $crate::server::registry::Handler::Async($f),
        }
    };
}
pub(crate) use entry;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RegistryError {
    #[error("No handler for opcode {0:?}")]
    Missing(Opcode),

    #[error("Opcode {0:?} has more than one handler")]
    Duplicate(Opcode),
}

#[derive(Debug)]
pub struct HandlerRegistry {
    entries: Vec<HandlerEntry>,
    by_opcode: HashMap<u32, usize>,
}

impl HandlerRegistry {
    pub fn new(entries: Vec<HandlerEntry>) -> Self {
        let mut by_opcode = HashMap::with_capacity(entries.len());
        for (i, entry) in entries.iter().enumerate() {
            by_opcode.entry(entry.opcode as u32).or_insert(i);
        }
        Self { entries, by_opcode }
    }

    /// Table with every handler this server implements.
    pub fn standard() -> Self {
        Self::new(super::handlers::all())
    }

    /// Check that each opcode has exactly one entry.
    pub fn validate(&self) -> Result<(), RegistryError> {
        let mut seen = HashSet::new();
        for entry in &self.entries {
            if !seen.insert(entry.opcode) {
                return Err(RegistryError::Duplicate(entry.opcode));
            }
        }
        for opcode in Opcode::ALL {
            if !seen.contains(opcode) {
                return Err(RegistryError::Missing(*opcode));
            }
        }
        Ok(())
    }

    pub fn get(&self, opcode: u32) -> Option<&HandlerEntry> {
        self.by_opcode.get(&opcode).map(|i| &self.entries[*i])
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }
}
