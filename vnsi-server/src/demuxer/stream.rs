//! Elementary stream descriptions and PES reassembly.

use thiserror::Error;

use super::packet::TsHeader;
use super::psi::{descriptor_tag, PmtStream};

/// Wire stream id flag marking the virtual RDS stream of an audio PID.
pub const RDS_STREAM_FLAG: u32 = 0x1_0000;

/// Codec of an elementary stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StreamType {
    Mpeg2Video,
    H264,
    Hevc,
    Mpeg2Audio,
    Ac3,
    Eac3,
    Aac,
    AacLatm,
    Dts,
    DvbSub,
    Teletext,
    Rds,
}

/// Broad category of a stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StreamContent {
    Video,
    Audio,
    Subtitle,
    Teletext,
    Rds,
}

/// Private data (type 0x06) streams, identified by descriptor in this order.
const PRIVATE_DATA_TYPES: [(u8, StreamType); 5] = [
    (descriptor_tag::AC3, StreamType::Ac3),
    (descriptor_tag::ENHANCED_AC3, StreamType::Eac3),
    (descriptor_tag::DTS, StreamType::Dts),
    (descriptor_tag::SUBTITLING, StreamType::DvbSub),
    (descriptor_tag::TELETEXT, StreamType::Teletext),
];

impl StreamType {
    /// Map a PMT entry to a stream type, consulting descriptors for private data.
    pub fn from_pmt(stream: &PmtStream) -> Option<Self> {
        match stream.stream_type {
            0x01 | 0x02 => Some(StreamType::Mpeg2Video),
            0x1B => Some(StreamType::H264),
            0x24 => Some(StreamType::Hevc),
            0x03 | 0x04 => Some(StreamType::Mpeg2Audio),
            0x0F => Some(StreamType::Aac),
            0x11 => Some(StreamType::AacLatm),
            0x81 => Some(StreamType::Ac3),
            0x87 => Some(StreamType::Eac3),
            0x06 => PRIVATE_DATA_TYPES
                .iter()
                .find(|(tag, _)| stream.has_descriptor(*tag))
                .map(|&(_, stream_type)| stream_type),
            _ => None,
        }
    }

    pub fn content(self) -> StreamContent {
        match self {
            StreamType::Mpeg2Video | StreamType::H264 | StreamType::Hevc => StreamContent::Video,
            StreamType::Mpeg2Audio
            | StreamType::Ac3
            | StreamType::Eac3
            | StreamType::Aac
            | StreamType::AacLatm
            | StreamType::Dts => StreamContent::Audio,
            StreamType::DvbSub => StreamContent::Subtitle,
            StreamType::Teletext => StreamContent::Teletext,
            StreamType::Rds => StreamContent::Rds,
        }
    }

    /// Codec name sent in stream change packets.
    pub fn wire_name(self) -> &'static str {
        match self {
            StreamType::Mpeg2Video => "MPEG2VIDEO",
            StreamType::H264 => "H264",
            StreamType::Hevc => "HEVC",
            StreamType::Mpeg2Audio => "MPEG2AUDIO",
            StreamType::Ac3 => "AC3",
            StreamType::Eac3 => "EAC3",
            StreamType::Aac => "AAC",
            StreamType::AacLatm => "AAC_LATM",
            StreamType::Dts => "DTS",
            StreamType::DvbSub => "DVBSUB",
            StreamType::Teletext => "TELETEXT",
            StreamType::Rds => "RDS",
        }
    }
}

/// Metadata of one tracked elementary stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamInfo {
    pub pid: u16,
    pub stream_type: StreamType,
    pub content: StreamContent,
    /// ISO 639 code, empty if unknown.
    pub language: String,
    pub subtitling_type: u8,
    pub composition_page_id: u16,
    pub ancillary_page_id: u16,
    /// Audio stream whose frames carry RDS data.
    pub handle_rds: bool,
}

impl StreamInfo {
    pub fn new(pid: u16, stream_type: StreamType) -> Self {
        Self {
            pid,
            stream_type,
            content: stream_type.content(),
            language: String::new(),
            subtitling_type: 0,
            composition_page_id: 0,
            ancillary_page_id: 0,
            handle_rds: false,
        }
    }

    /// Build from a PMT entry; `None` for streams the demuxer does not track.
    pub fn from_pmt(stream: &PmtStream) -> Option<Self> {
        let stream_type = StreamType::from_pmt(stream)?;
        let mut info = Self::new(stream.pid, stream_type);

        for (tag, body) in stream.descriptors() {
            match tag {
                descriptor_tag::ISO_639_LANGUAGE if body.len() >= 3 => {
                    info.language = language_code(&body[..3]);
                }
                descriptor_tag::SUBTITLING if body.len() >= 8 => {
                    info.language = language_code(&body[..3]);
                    info.subtitling_type = body[3];
                    info.composition_page_id = u16::from_be_bytes([body[4], body[5]]);
                    info.ancillary_page_id = u16::from_be_bytes([body[6], body[7]]);
                }
                descriptor_tag::TELETEXT if body.len() >= 3 && info.language.is_empty() => {
                    info.language = language_code(&body[..3]);
                }
                _ => {}
            }
        }
        Some(info)
    }

    /// Virtual stream carrying the RDS data of `audio`.
    pub fn rds_for(audio: &StreamInfo) -> Self {
        let mut info = Self::new(audio.pid, StreamType::Rds);
        info.language = audio.language.clone();
        info
    }

    /// Stream id used on the wire.
    pub fn wire_id(&self) -> u32 {
        match self.stream_type {
            StreamType::Rds => RDS_STREAM_FLAG | self.pid as u32,
            _ => self.pid as u32,
        }
    }

    pub fn is_video(&self) -> bool {
        self.content == StreamContent::Video
    }
}

fn language_code(bytes: &[u8]) -> String {
    bytes
        .iter()
        .filter(|b| b.is_ascii_alphabetic())
        .map(|&b| (b as char).to_ascii_lowercase())
        .collect()
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PesError {
    #[error("PES start code missing")]
    StartCode,

    #[error("Continuity error: expected {expected}, got {actual}")]
    Continuity { expected: u8, actual: u8 },

    #[error("Malformed PES header")]
    Header,
}

/// One reassembled PES unit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PesUnit {
    /// Raw 33-bit presentation timestamp.
    pub pts: Option<u64>,
    /// Raw 33-bit decoding timestamp.
    pub dts: Option<u64>,
    /// Elementary stream bytes.
    pub data: Vec<u8>,
    /// Random access indicator of the first packet.
    pub random_access: bool,
}

/// Collects transport payloads of one PID into PES units.
#[derive(Debug, Default)]
pub struct PesAssembler {
    buffer: Vec<u8>,
    expected_len: Option<usize>,
    continuity: Option<u8>,
    random_access: bool,
    started: bool,
}

impl PesAssembler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Drop any partial unit.
    pub fn reset(&mut self) {
        self.buffer.clear();
        self.expected_len = None;
        self.continuity = None;
        self.started = false;
    }

    /// Feed one packet; completed units are appended to `out`.
    pub fn push(
        &mut self,
        header: &TsHeader,
        payload: &[u8],
        out: &mut Vec<PesUnit>,
    ) -> Result<(), PesError> {
        if let Some(prev) = self.continuity {
            let expected = (prev + 1) & 0x0F;
            let duplicate = header.continuity_counter == prev;
            if header.has_payload && !duplicate && header.continuity_counter != expected && !header.discontinuity {
                self.reset();
                self.continuity = Some(header.continuity_counter);
                if !header.payload_unit_start {
                    return Err(PesError::Continuity {
                        expected,
                        actual: header.continuity_counter,
                    });
                }
            } else if duplicate && header.has_payload {
                return Ok(());
            }
        }
        if header.has_payload {
            self.continuity = Some(header.continuity_counter);
        }
        if payload.is_empty() {
            return Ok(());
        }

        let mut result = Ok(());
        if header.payload_unit_start {
            // a unit without a declared length ends at the next start
            if self.started && !self.buffer.is_empty() {
                match self.finish() {
                    Ok(Some(unit)) => out.push(unit),
                    Ok(None) => {}
                    Err(e) => result = Err(e),
                }
            }
            if payload.len() < 6 || payload[..3] != [0, 0, 1] {
                self.reset();
                return Err(PesError::StartCode);
            }
            let declared = u16::from_be_bytes([payload[4], payload[5]]) as usize;
            self.expected_len = (declared != 0).then_some(6 + declared);
            self.buffer.clear();
            self.buffer.extend_from_slice(payload);
            self.random_access = header.random_access;
            self.started = true;
        } else if self.started {
            self.buffer.extend_from_slice(payload);
        } else {
            return Ok(());
        }

        if let Some(expected) = self.expected_len {
            if self.buffer.len() >= expected {
                self.buffer.truncate(expected);
                if let Some(unit) = self.finish()? {
                    out.push(unit);
                }
            }
        }
        result
    }

    fn finish(&mut self) -> Result<Option<PesUnit>, PesError> {
        self.started = false;
        self.expected_len = None;
        let buffer = std::mem::take(&mut self.buffer);
        parse_pes(&buffer, self.random_access)
    }
}

fn has_optional_header(stream_id: u8) -> bool {
    // program stream map, padding, private 2, ECM, EMM, directory, DSMCC, H.222.1 type E
    !matches!(stream_id, 0xBC | 0xBE | 0xBF | 0xF0 | 0xF1 | 0xFF | 0xF2 | 0xF8)
}

fn parse_pes(buf: &[u8], random_access: bool) -> Result<Option<PesUnit>, PesError> {
    if buf.len() < 6 || buf[..3] != [0, 0, 1] {
        return Err(PesError::StartCode);
    }
    let stream_id = buf[3];
    if stream_id == 0xBE {
        return Ok(None);
    }
    if !has_optional_header(stream_id) {
        return Ok(Some(PesUnit {
            pts: None,
            dts: None,
            data: buf[6..].to_vec(),
            random_access,
        }));
    }
    if buf.len() < 9 {
        return Err(PesError::Header);
    }
    let flags = buf[7];
    let header_len = buf[8] as usize;
    let start = 9 + header_len;
    if start > buf.len() {
        return Err(PesError::Header);
    }

    let pts = if flags & 0x80 != 0 && header_len >= 5 {
        Some(parse_timestamp(&buf[9..14]))
    } else {
        None
    };
    let dts = if flags & 0xC0 == 0xC0 && header_len >= 10 {
        Some(parse_timestamp(&buf[14..19]))
    } else {
        None
    };

    Ok(Some(PesUnit {
        pts,
        dts,
        data: buf[start..].to_vec(),
        random_access,
    }))
}

/// Decode a 5-byte PES timestamp field.
pub fn parse_timestamp(b: &[u8]) -> u64 {
    (((b[0] as u64 >> 1) & 0x07) << 30)
        | ((b[1] as u64) << 22)
        | (((b[2] as u64) >> 1) << 15)
        | ((b[3] as u64) << 7)
        | ((b[4] as u64) >> 1)
}

/// Whether a completed unit starts an independently decodable picture.
pub fn is_keyframe(stream_type: StreamType, data: &[u8], random_access: bool) -> bool {
    if random_access {
        return true;
    }
    match stream_type {
        StreamType::Mpeg2Video => start_codes(data).any(|(code, rest)| {
            // picture header: temporal reference (10 bits) then coding type (3 bits)
            code == 0x00 && rest.len() >= 2 && (rest[1] >> 3) & 0x07 == 1
        }),
        StreamType::H264 => start_codes(data).any(|(nal, _)| matches!(nal & 0x1F, 5 | 7)),
        StreamType::Hevc => start_codes(data).any(|(nal, _)| {
            let nal_type = (nal >> 1) & 0x3F;
            (16..=21).contains(&nal_type) || nal_type == 32
        }),
        _ => true,
    }
}

/// Iterate `(byte after 00 00 01, remaining bytes after it)`.
fn start_codes(data: &[u8]) -> impl Iterator<Item = (u8, &[u8])> {
    data.windows(4)
        .enumerate()
        .filter(|(_, w)| w[0] == 0 && w[1] == 0 && w[2] == 1)
        .map(move |(i, w)| (w[3], &data[i + 4..]))
}

/// UECP bytes carried at the end of an MPEG audio frame, if any.
///
/// The frame ends with `0xFD`, preceded by a length byte and the data in reverse order.
pub fn extract_rds(frame: &[u8]) -> Option<Vec<u8>> {
    let n = frame.len();
    if n < 3 || frame[n - 1] != 0xFD {
        return None;
    }
    let len = frame[n - 2] as usize;
    if len == 0 || len + 2 > n {
        return None;
    }
    Some(frame[n - 2 - len..n - 2].iter().rev().copied().collect())
}

#[cfg(test)]
pub(crate) mod test_util {
    /// Encode a PES header with an optional PTS.
    pub fn pes(stream_id: u8, pts: Option<u64>, es: &[u8], bounded: bool) -> Vec<u8> {
        let mut header = vec![0x80, 0x00, 0x00];
        if let Some(pts) = pts {
            header[1] = 0x80;
            header[2] = 5;
            header.extend_from_slice(&encode_timestamp(0x2, pts));
        }
        let len = if bounded { header.len() + es.len() } else { 0 };
        let mut out = vec![0, 0, 1, stream_id, (len >> 8) as u8, len as u8];
        out.extend_from_slice(&header);
        out.extend_from_slice(es);
        out
    }

    pub fn encode_timestamp(prefix: u8, ts: u64) -> [u8; 5] {
        [
            (prefix << 4) | (((ts >> 30) as u8 & 0x07) << 1) | 1,
            (ts >> 22) as u8,
            (((ts >> 15) as u8) << 1) | 1,
            (ts >> 7) as u8,
            ((ts as u8) << 1) | 1,
        ]
    }
}
