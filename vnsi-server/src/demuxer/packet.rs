//! Transport packet header parsing and byte-stream alignment.

use thiserror::Error;

/// TS packet size.
pub const TS_PACKET_SIZE: usize = 188;
/// TS sync byte.
pub const SYNC_BYTE: u8 = 0x47;

/// Well-known PIDs.
pub mod pid {
    pub const PAT: u16 = 0x0000;
    pub const NULL: u16 = 0x1FFF;
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PacketError {
    #[error("Short packet: {0} bytes")]
    Short(usize),

    #[error("Lost sync: first byte 0x{0:02X}")]
    LostSync(u8),

    #[error("Adaptation field length {0} overruns the packet")]
    BadAdaptation(usize),
}

/// Parsed 4-byte transport header plus the adaptation field flags the demuxer uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TsHeader {
    pub transport_error: bool,
    pub payload_unit_start: bool,
    pub pid: u16,
    /// Transport scrambling control, non-zero when scrambled.
    pub scrambling: u8,
    pub has_payload: bool,
    pub continuity_counter: u8,
    /// Discontinuity indicator from the adaptation field.
    pub discontinuity: bool,
    /// Random access indicator from the adaptation field.
    pub random_access: bool,
    /// Offset of the payload within the packet.
    pub payload_offset: usize,
}

impl TsHeader {
    pub fn parse(packet: &[u8]) -> Result<Self, PacketError> {
        if packet.len() < TS_PACKET_SIZE {
            return Err(PacketError::Short(packet.len()));
        }
        if packet[0] != SYNC_BYTE {
            return Err(PacketError::LostSync(packet[0]));
        }

        let adaptation_control = (packet[3] >> 4) & 0x03;
        let has_adaptation = adaptation_control & 0x02 != 0;
        let has_payload = adaptation_control & 0x01 != 0;

        let mut discontinuity = false;
        let mut random_access = false;
        let mut payload_offset = 4;
        if has_adaptation {
            let length = packet[4] as usize;
            if 5 + length > TS_PACKET_SIZE {
                return Err(PacketError::BadAdaptation(length));
            }
            if length > 0 {
                discontinuity = packet[5] & 0x80 != 0;
                random_access = packet[5] & 0x40 != 0;
            }
            payload_offset = 5 + length;
        }

        Ok(Self {
            transport_error: packet[1] & 0x80 != 0,
            payload_unit_start: packet[1] & 0x40 != 0,
            pid: ((packet[1] as u16 & 0x1F) << 8) | packet[2] as u16,
            scrambling: (packet[3] >> 6) & 0x03,
            has_payload: has_payload && payload_offset < TS_PACKET_SIZE,
            continuity_counter: packet[3] & 0x0F,
            discontinuity,
            random_access,
            payload_offset,
        })
    }

    /// Payload bytes of `packet`, empty if the packet carries none.
    pub fn payload<'a>(&self, packet: &'a [u8]) -> &'a [u8] {
        if self.has_payload {
            &packet[self.payload_offset..TS_PACKET_SIZE]
        } else {
            &[]
        }
    }
}

/// Splits an arbitrary byte stream into sync-aligned transport packets.
///
/// A candidate sync byte is accepted when the byte one packet later is also a
/// sync byte (or not yet received); everything else is skipped.
#[derive(Debug, Default)]
pub struct PacketAligner {
    pending: Vec<u8>,
    skipped: u64,
}

impl PacketAligner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bytes discarded while searching for sync.
    pub fn skipped(&self) -> u64 {
        self.skipped
    }

    /// Append `data` and hand every complete packet to `emit`.
    pub fn push(&mut self, data: &[u8], mut emit: impl FnMut(&[u8])) {
        self.pending.extend_from_slice(data);

        let mut offset = 0;
        while self.pending.len() - offset >= TS_PACKET_SIZE {
            let synced = self.pending[offset] == SYNC_BYTE
                && self
                    .pending
                    .get(offset + TS_PACKET_SIZE)
                    .map_or(true, |&b| b == SYNC_BYTE);
            if synced {
                emit(&self.pending[offset..offset + TS_PACKET_SIZE]);
                offset += TS_PACKET_SIZE;
            } else {
                offset += 1;
                self.skipped += 1;
            }
        }

        self.pending.drain(..offset);
    }

    pub fn reset(&mut self) {
        self.pending.clear();
    }
}
