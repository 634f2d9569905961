//! PAT/PMT section collection and parsing.

use std::collections::HashMap;

use crc::{Crc, CRC_32_MPEG_2};

const CRC: Crc<u32> = Crc::<u32>::new(&CRC_32_MPEG_2);

/// Table IDs.
pub mod table_id {
    pub const PAT: u8 = 0x00;
    pub const PMT: u8 = 0x02;
}

/// Descriptor tags the demuxer interprets.
pub mod descriptor_tag {
    pub const ISO_639_LANGUAGE: u8 = 0x0A;
    pub const TELETEXT: u8 = 0x56;
    pub const SUBTITLING: u8 = 0x59;
    pub const AC3: u8 = 0x6A;
    pub const ENHANCED_AC3: u8 = 0x7A;
    pub const DTS: u8 = 0x7B;
}

/// Reassembles PSI sections split over transport packets, one buffer per PID.
#[derive(Debug, Default)]
pub struct SectionCollector {
    buffers: HashMap<u16, SectionBuffer>,
}

#[derive(Debug, Default)]
struct SectionBuffer {
    data: Vec<u8>,
    continuity_counter: Option<u8>,
}

impl SectionCollector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one packet payload; returns every section completed by it.
    pub fn push(&mut self, pid: u16, payload: &[u8], unit_start: bool, cc: u8) -> Vec<Vec<u8>> {
        let buffer = self.buffers.entry(pid).or_default();
        let mut sections = Vec::new();

        if unit_start {
            let Some((&pointer, rest)) = payload.split_first() else {
                return sections;
            };
            let pointer = pointer as usize;
            if pointer > rest.len() {
                buffer.data.clear();
                return sections;
            }
            // bytes before the pointer finish the previous section
            if !buffer.data.is_empty() {
                buffer.data.extend_from_slice(&rest[..pointer]);
                take_sections(&mut buffer.data, &mut sections);
            }
            buffer.data.clear();
            buffer.data.extend_from_slice(&rest[pointer..]);
            buffer.continuity_counter = Some(cc);
        } else {
            match buffer.continuity_counter {
                Some(prev) if (prev + 1) & 0x0F == cc => {}
                _ => {
                    buffer.data.clear();
                    buffer.continuity_counter = None;
                    return sections;
                }
            }
            buffer.continuity_counter = Some(cc);
            buffer.data.extend_from_slice(payload);
        }

        take_sections(&mut buffer.data, &mut sections);
        sections
    }

    pub fn reset(&mut self) {
        self.buffers.clear();
    }
}

fn take_sections(data: &mut Vec<u8>, out: &mut Vec<Vec<u8>>) {
    loop {
        // 0xFF table id is stuffing
        if data.len() < 3 || data[0] == 0xFF {
            if data.first() == Some(&0xFF) {
                data.clear();
            }
            return;
        }
        let total = 3 + section_length(data);
        if data.len() < total {
            return;
        }
        out.push(data.drain(..total).collect());
    }
}

fn section_length(section: &[u8]) -> usize {
    ((section[1] as usize & 0x0F) << 8) | section[2] as usize
}

/// Common long-form section header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct LongHeader {
    table_id: u8,
    table_id_extension: u16,
    version: u8,
    current_next: bool,
    /// End of the table body, excluding CRC.
    body_end: usize,
}

fn long_header(section: &[u8]) -> Option<LongHeader> {
    if section.len() < 12 {
        return None;
    }
    let total = 3 + section_length(section);
    if total > section.len() || total < 12 {
        return None;
    }
    if !crc_matches(&section[..total]) {
        return None;
    }
    Some(LongHeader {
        table_id: section[0],
        table_id_extension: ((section[3] as u16) << 8) | section[4] as u16,
        version: (section[5] >> 1) & 0x1F,
        current_next: section[5] & 0x01 != 0,
        body_end: total - 4,
    })
}

/// True when the trailing CRC-32/MPEG-2 matches the section bytes before it.
fn crc_matches(section: &[u8]) -> bool {
    let (data, crc) = section.split_at(section.len() - 4);
    let expected = u32::from_be_bytes([crc[0], crc[1], crc[2], crc[3]]);
    CRC.checksum(data) == expected
}

/// One program of the PAT.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PatEntry {
    pub program_number: u16,
    pub pmt_pid: u16,
}

/// Parsed program association table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PatTable {
    pub transport_stream_id: u16,
    pub version: u8,
    pub programs: Vec<PatEntry>,
}

impl PatTable {
    pub fn parse(section: &[u8]) -> Option<Self> {
        let header = long_header(section)?;
        if header.table_id != table_id::PAT || !header.current_next {
            return None;
        }
        let programs = section[8..header.body_end]
            .chunks_exact(4)
            .map(|entry| PatEntry {
                program_number: ((entry[0] as u16) << 8) | entry[1] as u16,
                pmt_pid: ((entry[2] as u16 & 0x1F) << 8) | entry[3] as u16,
            })
            // program 0 points at the NIT
            .filter(|entry| entry.program_number != 0)
            .collect();
        Some(Self {
            transport_stream_id: header.table_id_extension,
            version: header.version,
            programs,
        })
    }

    /// Program for `service_id`, or the first program if the service is absent or 0.
    pub fn program_for(&self, service_id: u16) -> Option<PatEntry> {
        self.programs
            .iter()
            .find(|p| service_id != 0 && p.program_number == service_id)
            .or_else(|| self.programs.first())
            .copied()
    }
}

/// One elementary stream entry of a PMT.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PmtStream {
    pub stream_type: u8,
    pub pid: u16,
    pub descriptors: Vec<u8>,
}

impl PmtStream {
    /// Iterate `(tag, body)` pairs of the ES info descriptor loop.
    pub fn descriptors(&self) -> DescriptorIter<'_> {
        DescriptorIter {
            data: &self.descriptors,
        }
    }

    pub fn has_descriptor(&self, tag: u8) -> bool {
        self.descriptors().any(|(t, _)| t == tag)
    }
}

/// Parsed program map table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PmtTable {
    pub program_number: u16,
    pub version: u8,
    pub pcr_pid: u16,
    pub streams: Vec<PmtStream>,
}

impl PmtTable {
    pub fn parse(section: &[u8]) -> Option<Self> {
        let header = long_header(section)?;
        if header.table_id != table_id::PMT || !header.current_next {
            return None;
        }
        let data = &section[8..header.body_end];
        if data.len() < 4 {
            return None;
        }
        let pcr_pid = ((data[0] as u16 & 0x1F) << 8) | data[1] as u16;
        let program_info_length = ((data[2] as usize & 0x0F) << 8) | data[3] as usize;
        let mut offset = 4 + program_info_length;

        let mut streams = Vec::new();
        while offset + 5 <= data.len() {
            let stream_type = data[offset];
            let pid = ((data[offset + 1] as u16 & 0x1F) << 8) | data[offset + 2] as u16;
            let es_info_length = ((data[offset + 3] as usize & 0x0F) << 8) | data[offset + 4] as usize;
            offset += 5;
            if offset + es_info_length > data.len() {
                break;
            }
            streams.push(PmtStream {
                stream_type,
                pid,
                descriptors: data[offset..offset + es_info_length].to_vec(),
            });
            offset += es_info_length;
        }

        Some(Self {
            program_number: header.table_id_extension,
            version: header.version,
            pcr_pid,
            streams,
        })
    }
}

/// Iterator over a descriptor loop; stops at the first malformed entry.
pub struct DescriptorIter<'a> {
    data: &'a [u8],
}

impl<'a> Iterator for DescriptorIter<'a> {
    type Item = (u8, &'a [u8]);

    fn next(&mut self) -> Option<Self::Item> {
        if self.data.len() < 2 {
            return None;
        }
        let tag = self.data[0];
        let len = self.data[1] as usize;
        if 2 + len > self.data.len() {
            self.data = &[];
            return None;
        }
        let body = &self.data[2..2 + len];
        self.data = &self.data[2 + len..];
        Some((tag, body))
    }
}
