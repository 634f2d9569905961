//! Frame index of a recording.
//!
//! TS recordings store one 8-byte little-endian entry per frame:
//! bits 0-39 byte offset, bits 40-46 reserved, bit 47 independent flag,
//! bits 48-63 segment number. Legacy PES recordings use
//! `offset: i32, type: u8 (1 = I-frame), segment: u8, reserved: i16`.

use std::fs;
use std::io;
use std::path::Path;

/// Size of one index entry on disk.
pub const INDEX_ENTRY_SIZE: usize = 8;

/// Index file name of TS recordings.
pub const TS_INDEX_FILE: &str = "index";
/// Index file name of PES recordings.
pub const PES_INDEX_FILE: &str = "index.vdr";

const PES_I_FRAME: u8 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IndexFormat {
    Ts,
    Pes,
}

/// Location of one frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct FrameIndexEntry {
    pub segment: u16,
    pub offset: u64,
    pub independent: bool,
}

impl FrameIndexEntry {
    fn decode(raw: [u8; INDEX_ENTRY_SIZE], format: IndexFormat) -> Self {
        match format {
            IndexFormat::Ts => {
                let word = u64::from_le_bytes(raw);
                Self {
                    offset: word & 0xFF_FFFF_FFFF,
                    independent: (word >> 47) & 1 == 1,
                    segment: (word >> 48) as u16,
                }
            }
            IndexFormat::Pes => Self {
                offset: i32::from_le_bytes([raw[0], raw[1], raw[2], raw[3]]).max(0) as u64,
                independent: raw[4] == PES_I_FRAME,
                segment: raw[5] as u16,
            },
        }
    }

    #[cfg(test)]
    pub fn encode(&self) -> [u8; INDEX_ENTRY_SIZE] {
        let word = (self.offset & 0xFF_FFFF_FFFF)
            | ((self.independent as u64) << 47)
            | ((self.segment as u64) << 48);
        word.to_le_bytes()
    }
}

/// In-memory copy of a frame index; entries are ordered by (segment, offset).
#[derive(Debug, Clone, Default)]
pub struct FrameIndex {
    entries: Vec<FrameIndexEntry>,
}

impl FrameIndex {
    pub fn load(path: &Path, format: IndexFormat) -> io::Result<Self> {
        let data = fs::read(path)?;
        Ok(Self::from_bytes(&data, format))
    }

    /// Parse whole entries; a trailing partial entry (index still being written) is ignored.
    pub fn from_bytes(data: &[u8], format: IndexFormat) -> Self {
        let entries = data
            .chunks_exact(INDEX_ENTRY_SIZE)
            .map(|chunk| {
                let mut raw = [0u8; INDEX_ENTRY_SIZE];
                raw.copy_from_slice(chunk);
                FrameIndexEntry::decode(raw, format)
            })
            .collect();
        Self::from_entries(entries)
    }

    pub fn from_entries(entries: Vec<FrameIndexEntry>) -> Self {
        Self { entries }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, frame: u32) -> Option<&FrameIndexEntry> {
        self.entries.get(frame as usize)
    }

    /// Frame whose data contains `(segment, offset)`: the last entry not after it.
    pub fn frame_at(&self, segment: u16, offset: u64) -> Option<u32> {
        let after = self
            .entries
            .partition_point(|e| (e.segment, e.offset) <= (segment, offset));
        after.checked_sub(1).map(|i| i as u32)
    }

    /// Nearest independent frame strictly after (`forward`) or before `frame`.
    pub fn next_independent(&self, frame: u32, forward: bool) -> Option<u32> {
        let frame = frame as usize;
        if forward {
            (frame + 1..self.entries.len())
                .find(|&i| self.entries[i].independent)
                .map(|i| i as u32)
        } else {
            (0..frame.min(self.entries.len()))
                .rev()
                .find(|&i| self.entries[i].independent)
                .map(|i| i as u32)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(segment: u16, offset: u64, independent: bool) -> FrameIndexEntry {
        FrameIndexEntry {
            segment,
            offset,
            independent,
        }
    }

    #[test]
    fn test_ts_entry_bit_layout() {
        let e = entry(2, 0x12_3456_789A, true);
        let raw = e.encode();
        let word = u64::from_le_bytes(raw);
        assert_eq!(word & 0xFF_FFFF_FFFF, 0x12_3456_789A);
        assert_eq!(word >> 48, 2);
        assert_eq!((word >> 47) & 1, 1);
        assert_eq!(FrameIndexEntry::decode(raw, IndexFormat::Ts), e);
    }

    #[test]
    fn test_pes_entry() {
        let raw = [0x10, 0x00, 0x00, 0x00, 1, 3, 0, 0];
        let e = FrameIndexEntry::decode(raw, IndexFormat::Pes);
        assert_eq!(e, entry(3, 16, true));
    }

    #[test]
    fn test_partial_trailing_entry_ignored() {
        let mut data = Vec::new();
        data.extend_from_slice(&entry(1, 0, true).encode());
        data.extend_from_slice(&entry(1, 188, false).encode());
        data.extend_from_slice(&[1, 2, 3]);
        let index = FrameIndex::from_bytes(&data, IndexFormat::Ts);
        assert_eq!(index.len(), 2);
    }

    #[test]
    fn test_frame_at() {
        let index = FrameIndex::from_entries(vec![
            entry(1, 0, true),
            entry(1, 1000, false),
            entry(1, 2000, false),
            entry(2, 0, true),
            entry(2, 500, false),
        ]);
        assert_eq!(index.frame_at(1, 0), Some(0));
        assert_eq!(index.frame_at(1, 999), Some(0));
        assert_eq!(index.frame_at(1, 1000), Some(1));
        assert_eq!(index.frame_at(1, 50_000), Some(2));
        assert_eq!(index.frame_at(2, 499), Some(3));
        assert_eq!(index.frame_at(2, 10_000), Some(4));
        assert_eq!(index.frame_at(0, 10), None);
    }

    #[test]
    fn test_next_independent() {
        let index = FrameIndex::from_entries(vec![
            entry(1, 0, true),
            entry(1, 10, false),
            entry(1, 20, false),
            entry(1, 30, true),
            entry(1, 40, false),
        ]);
        assert_eq!(index.next_independent(0, true), Some(3));
        assert_eq!(index.next_independent(3, true), None);
        assert_eq!(index.next_independent(4, false), Some(3));
        assert_eq!(index.next_independent(3, false), Some(0));
        assert_eq!(index.next_independent(0, false), None);
        assert_eq!(index.next_independent(100, false), Some(3));
    }
}
