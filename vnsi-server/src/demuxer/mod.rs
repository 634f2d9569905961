//! Transport stream demultiplexer for live sessions.
//!
//! Reads packets from a [`VideoBuffer`], follows PAT/PMT to find the
//! channel's elementary streams, reassembles PES units per PID and emits
//! them with wrap-corrected timestamps.

pub mod packet;
pub mod psi;
pub mod pts_wrap;
pub mod stream;

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use bytes::Bytes;
use log::{debug, trace};

use crate::live::buffer::{BufferRead, VideoBuffer};
use packet::{pid, TsHeader};
use psi::{PatTable, PmtTable, SectionCollector};
use pts_wrap::{ticks_to_micros, PtsWrapState};
use stream::{extract_rds, is_keyframe, PesAssembler, PesError, PesUnit, StreamInfo, StreamType};

/// Sticky error flags reported through [`Demuxer::take_error`].
pub mod error_flags {
    pub const PES_GENERAL: u16 = 0x01;
    pub const SCRAMBLED: u16 = 0x02;
    pub const PES_STARTCODE: u16 = 0x04;
    pub const NO_DATA: u16 = 0x10;
    pub const NO_TABLES: u16 = 0x40;
    pub const NO_SIGNAL: u16 = 0x80;
}

/// One demultiplexed media packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DemuxPacket {
    /// Wire stream id.
    pub stream_id: u32,
    pub stream_type: StreamType,
    /// Unwrapped 90 kHz timestamps.
    pub pts: Option<u64>,
    pub dts: Option<u64>,
    /// Frame duration in microseconds, 0 if unknown.
    pub duration: u32,
    pub keyframe: bool,
    pub serial: u32,
    pub data: Bytes,
}

/// Outcome of one [`Demuxer::read`] call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DemuxRead {
    Packet {
        packet: DemuxPacket,
        side_data: Option<DemuxPacket>,
    },
    /// Stream table changed; the snapshot is the new list.
    StreamChange(Arc<Vec<StreamInfo>>),
    /// Stream tables not seen yet.
    NotReady,
    /// Packet consumed without output.
    Skipped,
    /// Buffer has nothing new.
    NoData,
    /// Buffer closed or detached.
    EndOfStream,
}

/// Buffered range reported to clients.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufferStatus {
    pub timeshift: bool,
    /// Wall-clock ms of the oldest buffered data.
    pub start: i64,
    /// Wall-clock ms of the newest buffered data.
    pub end: i64,
}

#[derive(Debug)]
struct Track {
    info: StreamInfo,
    assembler: PesAssembler,
    last_pts: Option<u64>,
}

/// Channel parameters the demuxer needs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DemuxTarget {
    pub service_id: u16,
    pub radio: bool,
}

pub struct Demuxer {
    buffer: Option<Box<dyn VideoBuffer>>,
    target: DemuxTarget,
    allow_rds: bool,
    sections: SectionCollector,
    pmt_pid: Option<u16>,
    program: Option<u16>,
    pmt_version: Option<u8>,
    /// Replaced wholesale so emitted snapshots never change under a reader.
    streams: Arc<Vec<StreamInfo>>,
    tracks: HashMap<u16, Track>,
    pts: PtsWrapState,
    pending: VecDeque<(DemuxPacket, Option<DemuxPacket>)>,
    serial: u32,
    wait_iframe: bool,
    set_ref_time: bool,
    new_ref_time: Option<i64>,
    error: u16,
    first_packet_ms: Option<i64>,
    pmt_timeout_ms: i64,
    dropped: u64,
}

impl Demuxer {
    pub fn new(allow_rds: bool, pmt_timeout_ms: i64) -> Self {
        Self {
            buffer: None,
            target: DemuxTarget {
                service_id: 0,
                radio: false,
            },
            allow_rds,
            sections: SectionCollector::new(),
            pmt_pid: None,
            program: None,
            pmt_version: None,
            streams: Arc::default(),
            tracks: HashMap::new(),
            pts: PtsWrapState::new(),
            pending: VecDeque::new(),
            serial: 0,
            wait_iframe: true,
            set_ref_time: true,
            new_ref_time: None,
            error: error_flags::NO_DATA,
            first_packet_ms: None,
            pmt_timeout_ms,
            dropped: 0,
        }
    }

    /// Bind to a channel buffer, discarding all previous state except the serial.
    pub fn open(&mut self, target: DemuxTarget, buffer: Box<dyn VideoBuffer>) {
        self.close();
        self.target = target;
        self.buffer = Some(buffer);
        self.wait_iframe = true;
        self.set_ref_time = true;
    }

    pub fn close(&mut self) {
        self.buffer = None;
        self.sections.reset();
        self.pmt_pid = None;
        self.program = None;
        self.pmt_version = None;
        self.tracks.clear();
        self.streams = Arc::default();
        self.pts.reset();
        self.pending.clear();
        self.new_ref_time = None;
        self.first_packet_ms = None;
        self.error = error_flags::NO_DATA;
    }

    pub fn serial(&self) -> u32 {
        self.serial
    }

    /// Return the sticky flags and reset them to "no data since last poll".
    pub fn take_error(&mut self) -> u16 {
        std::mem::replace(&mut self.error, error_flags::NO_DATA)
    }

    /// Reference time set by the first packet after open or seek, once.
    pub fn take_ref_time(&mut self) -> Option<i64> {
        self.new_ref_time.take()
    }

    pub fn dropped_packets(&self) -> u64 {
        self.dropped
    }

    pub fn buffer_status(&self) -> Option<BufferStatus> {
        let buffer = self.buffer.as_ref()?;
        let (start, end) = buffer.time_window()?;
        Some(BufferStatus {
            timeshift: buffer.has_timeshift(),
            start,
            end,
        })
    }

    /// Reposition to `time_ms`; returns the new serial, or `None` with no state change.
    pub fn seek_time(&mut self, time_ms: i64) -> Option<u32> {
        let buffer = self.buffer.as_mut()?;
        if !buffer.seek_time(time_ms) {
            return None;
        }
        self.reset_parsers();
        self.wait_iframe = true;
        self.set_ref_time = true;
        self.serial = self.serial.wrapping_add(1);
        debug!(
            "Seek to {} ms, position {}, serial {}",
            time_ms,
            self.buffer.as_ref().map_or(0, |b| b.position()),
            self.serial
        );
        Some(self.serial)
    }

    /// Drop partial units and per-stream timing.
    fn reset_parsers(&mut self) {
        for track in self.tracks.values_mut() {
            track.assembler.reset();
            track.last_pts = None;
        }
        self.pending.clear();
    }

    /// Install the streams of `pmt`; returns true if the stream list changed.
    fn ensure_parsers(&mut self, pmt: &PmtTable) -> bool {
        let mut streams: Vec<StreamInfo> = pmt.streams.iter().filter_map(StreamInfo::from_pmt).collect();

        if self.allow_rds && self.target.radio {
            let rds = streams
                .iter_mut()
                .find(|s| s.stream_type == StreamType::Mpeg2Audio)
                .map(|audio| {
                    audio.handle_rds = true;
                    StreamInfo::rds_for(audio)
                });
            streams.extend(rds);
        }

        self.error &= !error_flags::NO_TABLES;
        if *self.streams == streams {
            return false;
        }

        let mut tracks = HashMap::new();
        for info in streams.iter().filter(|s| s.stream_type != StreamType::Rds) {
            let track = match self.tracks.remove(&info.pid) {
                Some(mut old) if old.info.stream_type == info.stream_type => {
                    old.info = info.clone();
                    old
                }
                _ => Track {
                    info: info.clone(),
                    assembler: PesAssembler::new(),
                    last_pts: None,
                },
            };
            tracks.insert(info.pid, track);
        }
        self.tracks = tracks;
        debug!("Stream table: {} streams", streams.len());
        self.streams = Arc::new(streams);
        true
    }

    fn has_video(&self) -> bool {
        self.tracks.values().any(|t| t.info.is_video())
    }

    /// Advance by at most one input packet.
    pub fn read(&mut self) -> DemuxRead {
        if let Some((packet, side_data)) = self.pending.pop_front() {
            return DemuxRead::Packet { packet, side_data };
        }

        let Some(buffer) = self.buffer.as_mut() else {
            return DemuxRead::EndOfStream;
        };
        let (data, time_ms) = match buffer.read_packet() {
            BufferRead::Packet { data, time_ms } => (data, time_ms),
            BufferRead::Empty => return DemuxRead::NoData,
            BufferRead::Closed => return DemuxRead::EndOfStream,
        };
        self.error &= !error_flags::NO_DATA;
        self.first_packet_ms.get_or_insert(time_ms);

        let header = match TsHeader::parse(&data) {
            Ok(header) => header,
            Err(e) => {
                self.dropped += 1;
                trace!("Dropping packet: {}", e);
                return DemuxRead::Skipped;
            }
        };
        if header.transport_error || header.pid == pid::NULL {
            return DemuxRead::Skipped;
        }

        let payload = header.payload(&data);
        if header.pid == pid::PAT || Some(header.pid) == self.pmt_pid {
            return self.handle_psi(&header, payload, time_ms);
        }

        let Some(track) = self.tracks.get_mut(&header.pid) else {
            return self.not_ready_or_skip(time_ms);
        };
        if header.scrambling != 0 {
            self.error |= error_flags::SCRAMBLED;
            return DemuxRead::Skipped;
        }

        let mut units = Vec::new();
        if let Err(e) = track.assembler.push(&header, payload, &mut units) {
            self.error |= match e {
                PesError::StartCode => error_flags::PES_STARTCODE,
                _ => error_flags::PES_GENERAL,
            };
        }
        let pid = header.pid;
        for unit in units {
            self.emit(pid, unit, time_ms);
        }

        match self.pending.pop_front() {
            Some((packet, side_data)) => DemuxRead::Packet { packet, side_data },
            None => DemuxRead::Skipped,
        }
    }

    fn not_ready_or_skip(&mut self, time_ms: i64) -> DemuxRead {
        if !self.tracks.is_empty() {
            return DemuxRead::Skipped;
        }
        if let Some(first) = self.first_packet_ms {
            if time_ms - first >= self.pmt_timeout_ms {
                self.error |= error_flags::NO_TABLES;
            }
        }
        DemuxRead::NotReady
    }

    fn handle_psi(&mut self, header: &TsHeader, payload: &[u8], time_ms: i64) -> DemuxRead {
        let sections =
            self.sections
                .push(header.pid, payload, header.payload_unit_start, header.continuity_counter);
        let mut changed = false;

        for section in sections {
            if header.pid == pid::PAT {
                let Some(pat) = PatTable::parse(&section) else {
                    continue;
                };
                let selected = pat.program_for(self.target.service_id);
                let pmt_pid = selected.map(|p| p.pmt_pid);
                if pmt_pid != self.pmt_pid {
                    debug!("PAT v{}: PMT on PID 0x{:04X}", pat.version, pmt_pid.unwrap_or(0));
                    self.pmt_pid = pmt_pid;
                    self.program = selected.map(|p| p.program_number);
                    self.pmt_version = None;
                }
            } else if let Some(pmt) = PmtTable::parse(&section) {
                if Some(pmt.program_number) != self.program || Some(pmt.version) == self.pmt_version {
                    continue;
                }
                self.pmt_version = Some(pmt.version);
                changed |= self.ensure_parsers(&pmt);
            }
        }

        if changed {
            DemuxRead::StreamChange(Arc::clone(&self.streams))
        } else {
            self.not_ready_or_skip(time_ms)
        }
    }

    fn emit(&mut self, pid: u16, unit: PesUnit, time_ms: i64) {
        let has_video = self.has_video();
        let Some(track) = self.tracks.get(&pid) else {
            return;
        };
        let keyframe = is_keyframe(track.info.stream_type, &unit.data, unit.random_access);

        if self.wait_iframe {
            if has_video && !(track.info.is_video() && keyframe) {
                return;
            }
            self.wait_iframe = false;
        }

        let pts = unit.pts.map(|raw| self.pts.observe(raw, time_ms));
        let dts = unit.dts.map(|raw| self.pts.correct(raw)).or(pts);

        let Some(track) = self.tracks.get_mut(&pid) else {
            return;
        };
        let duration = match (pts, track.last_pts) {
            (Some(now), Some(last)) if now > last => {
                u32::try_from(ticks_to_micros(now - last)).unwrap_or(0)
            }
            _ => 0,
        };
        if pts.is_some() {
            track.last_pts = pts;
        }

        if self.set_ref_time {
            self.set_ref_time = false;
            self.new_ref_time = Some(time_ms);
        }

        let side_data = if self.allow_rds && track.info.handle_rds {
            extract_rds(&unit.data).map(|rds| DemuxPacket {
                stream_id: StreamInfo::rds_for(&track.info).wire_id(),
                stream_type: StreamType::Rds,
                pts,
                dts,
                duration: 0,
                keyframe: true,
                serial: self.serial,
                data: Bytes::from(rds),
            })
        } else {
            None
        };

        let packet = DemuxPacket {
            stream_id: track.info.wire_id(),
            stream_type: track.info.stream_type,
            pts,
            dts,
            duration,
            keyframe,
            serial: self.serial,
            data: Bytes::from(unit.data),
        };
        self.pending.push_back((packet, side_data));
    }
}

#[cfg(test)]
pub(crate) mod test_util {
    use super::packet::test_util::{ts_packet, ts_packet_with_flags};
    use super::psi::test_util::{pat_section, pmt_section, psi_payload};
    use super::stream::test_util::pes;
    use super::*;
    use crate::live::buffer::TimeshiftBuffer;

    pub const PMT_PID: u16 = 0x1000;
    pub const VIDEO_PID: u16 = 0x100;
    pub const AUDIO_PID: u16 = 0x101;

    /// PMT section of a one-program H.264/MPEG-audio service.
    pub fn service_pmt(sid: u16, version: u8) -> Vec<u8> {
        pmt_section(
            sid,
            version,
            VIDEO_PID,
            &[(0x1B, VIDEO_PID, vec![]), (0x03, AUDIO_PID, vec![0x0A, 4, b'e', b'n', b'g', 0])],
        )
    }

    /// PAT + PMT packets for that service.
    pub fn table_packets(sid: u16, version: u8) -> Vec<[u8; 188]> {
        let pat = pat_section(1, 0, &[(sid, PMT_PID)]);
        let pmt = service_pmt(sid, version);
        vec![
            ts_packet(pid::PAT, true, 0, &psi_payload(&pat)),
            ts_packet(PMT_PID, true, version & 0x0F, &psi_payload(&pmt)),
        ]
    }

    /// One single-packet video PES unit; IDR when `key` is set.
    pub fn video_packet(cc: u8, pts: u64, key: bool) -> [u8; 188] {
        let nal = if key { 0x65 } else { 0x41 };
        let unit = pes(0xE0, Some(pts), &[0, 0, 0, 1, nal, 0x80, 0x80], true);
        ts_packet_with_flags(VIDEO_PID, true, cc, &unit, false)
    }

    pub fn audio_packet(cc: u8, pts: u64, es: &[u8]) -> [u8; 188] {
        let unit = pes(0xC0, Some(pts), es, true);
        ts_packet(AUDIO_PID, true, cc, &unit)
    }

    pub fn push_packets(buffer: &TimeshiftBuffer, packets: &[[u8; 188]], time_ms: i64) {
        let mut data = Vec::with_capacity(packets.len() * 188);
        for p in packets {
            data.extend_from_slice(p);
        }
        buffer.push_chunk(Bytes::from(data), time_ms);
    }

    /// Read until something other than Skipped/NotReady comes out.
    pub fn next_output(demux: &mut Demuxer) -> DemuxRead {
        loop {
            match demux.read() {
                DemuxRead::Skipped | DemuxRead::NotReady => continue,
                other => return other,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::test_util::*;
    use super::*;
    use crate::live::buffer::TimeshiftBuffer;

    fn open(radio: bool, allow_rds: bool, timeshift: bool) -> (Arc<TimeshiftBuffer>, Demuxer) {
        let buffer = TimeshiftBuffer::new(188 * 1000, timeshift);
        let mut demux = Demuxer::new(allow_rds, 5_000);
        demux.open(
            DemuxTarget {
                service_id: 0x10,
                radio,
            },
            Box::new(buffer.reader()),
        );
        (buffer, demux)
    }

    #[test]
    fn test_not_ready_before_tables() {
        let (buffer, mut demux) = open(false, false, false);
        push_packets(&buffer, &[video_packet(0, 0, true)], 1_000);
        assert_eq!(demux.read(), DemuxRead::NotReady);
        assert_eq!(demux.read(), DemuxRead::NoData);
    }

    #[test]
    fn test_tables_then_packets() {
        let (buffer, mut demux) = open(false, false, false);
        push_packets(&buffer, &table_packets(0x10, 1), 1_000);

        let DemuxRead::StreamChange(streams) = next_output(&mut demux) else {
            panic!("expected stream change");
        };
        assert_eq!(streams.len(), 2);
        assert_eq!(streams[0].stream_type, StreamType::H264);
        assert_eq!(streams[1].language, "eng");

        // audio before the first key frame is held back
        push_packets(
            &buffer,
            &[
                audio_packet(0, 900, &[0xAA; 8]),
                video_packet(0, 1_800, false),
                video_packet(1, 3_600, true),
                audio_packet(1, 4_500, &[0xBB; 8]),
            ],
            1_040,
        );
        let DemuxRead::Packet { packet, side_data } = next_output(&mut demux) else {
            panic!("expected packet");
        };
        assert_eq!(packet.stream_id, VIDEO_PID as u32);
        assert!(packet.keyframe);
        assert_eq!(packet.pts, Some(3_600));
        assert!(side_data.is_none());
        assert_eq!(demux.take_ref_time(), Some(1_040));
        assert_eq!(demux.take_ref_time(), None);

        let DemuxRead::Packet { packet, .. } = next_output(&mut demux) else {
            panic!("expected packet");
        };
        assert_eq!(packet.stream_id, AUDIO_PID as u32);
        assert_eq!(packet.data.as_ref(), &[0xBB; 8]);
        assert_eq!(next_output(&mut demux), DemuxRead::NoData);
    }

    #[test]
    fn test_repeated_pmt_is_not_a_change() {
        let (buffer, mut demux) = open(false, false, false);
        push_packets(&buffer, &table_packets(0x10, 1), 0);
        assert!(matches!(next_output(&mut demux), DemuxRead::StreamChange(_)));
        push_packets(&buffer, &table_packets(0x10, 2), 10);
        assert_eq!(next_output(&mut demux), DemuxRead::NoData);
    }

    #[test]
    fn test_corrupted_pmt_ignored_until_clean_copy() {
        let (buffer, mut demux) = open(false, false, false);
        let mut tables = table_packets(0x10, 1);
        // flip a bit in the first ES info length of the PMT
        let section_start = 188 - service_pmt(0x10, 1).len();
        tables[1][section_start + 15] ^= 0x04;
        push_packets(&buffer, &tables, 0);
        assert_eq!(next_output(&mut demux), DemuxRead::NoData);

        // the same version arriving intact is still accepted
        push_packets(&buffer, &table_packets(0x10, 1)[1..], 10);
        let DemuxRead::StreamChange(streams) = next_output(&mut demux) else {
            panic!("expected stream change");
        };
        assert_eq!(streams.len(), 2);
        assert_eq!(streams[0].pid, VIDEO_PID);
    }

    #[test]
    fn test_scrambled_sets_sticky_flag() {
        let (buffer, mut demux) = open(false, false, false);
        push_packets(&buffer, &table_packets(0x10, 1), 0);
        next_output(&mut demux);
        let mut pkt = video_packet(0, 0, true);
        pkt[3] |= 0x80;
        push_packets(&buffer, &[pkt], 10);
        assert_eq!(demux.read(), DemuxRead::Skipped);
        let flags = demux.take_error();
        assert_ne!(flags & error_flags::SCRAMBLED, 0);
        assert_eq!(demux.take_error(), error_flags::NO_DATA);
    }

    #[test]
    fn test_no_tables_after_timeout() {
        let (buffer, mut demux) = open(false, false, false);
        push_packets(&buffer, &[video_packet(0, 0, true)], 0);
        push_packets(&buffer, &[video_packet(1, 0, true)], 6_000);
        assert_eq!(demux.read(), DemuxRead::NotReady);
        assert_eq!(demux.read(), DemuxRead::NotReady);
        assert_ne!(demux.take_error() & error_flags::NO_TABLES, 0);
    }

    #[test]
    fn test_rds_side_data_for_radio() {
        let (buffer, mut demux) = open(true, true, false);
        let pat = psi::test_util::pat_section(1, 0, &[(0x10, PMT_PID)]);
        let pmt = psi::test_util::pmt_section(0x10, 0, AUDIO_PID, &[(0x03, AUDIO_PID, vec![])]);
        push_packets(
            &buffer,
            &[
                packet::test_util::ts_packet(pid::PAT, true, 0, &psi::test_util::psi_payload(&pat)),
                packet::test_util::ts_packet(PMT_PID, true, 0, &psi::test_util::psi_payload(&pmt)),
            ],
            0,
        );
        let DemuxRead::StreamChange(streams) = next_output(&mut demux) else {
            panic!("expected stream change");
        };
        assert_eq!(streams.len(), 2);
        assert_eq!(streams[1].stream_type, StreamType::Rds);

        push_packets(&buffer, &[audio_packet(0, 90, &[0xFF, 0xFB, 0x22, 0x11, 2, 0xFD])], 10);
        let DemuxRead::Packet { packet, side_data } = next_output(&mut demux) else {
            panic!("expected packet");
        };
        assert_eq!(packet.stream_id, AUDIO_PID as u32);
        let side = side_data.unwrap();
        assert_eq!(side.stream_id, stream::RDS_STREAM_FLAG | AUDIO_PID as u32);
        assert_eq!(side.data.as_ref(), &[0x11, 0x22]);
    }

    #[test]
    fn test_seek_bumps_serial_and_waits_for_keyframe() {
        let (buffer, mut demux) = open(false, false, true);
        push_packets(&buffer, &table_packets(0x10, 1), 1_000);
        push_packets(&buffer, &[video_packet(0, 0, true)], 1_000);
        push_packets(&buffer, &[video_packet(1, 3_600, false)], 2_000);
        push_packets(&buffer, &[video_packet(2, 7_200, true)], 3_000);
        while next_output(&mut demux) != DemuxRead::NoData {}

        let serial = demux.serial();
        assert_eq!(demux.seek_time(2_500), Some(serial + 1));
        // the first unit after the seek point is not a key frame and is dropped
        let DemuxRead::Packet { packet, .. } = next_output(&mut demux) else {
            panic!("expected packet");
        };
        assert_eq!(packet.serial, serial + 1);
        assert_eq!(packet.pts, Some(7_200));
        assert_eq!(demux.take_ref_time(), Some(3_000));

        assert_eq!(demux.seek_time(10_000), None);
        assert_eq!(demux.serial(), serial + 1);
    }

    #[test]
    fn test_buffer_status_window() {
        let (buffer, demux) = open(false, false, true);
        assert_eq!(demux.buffer_status(), None);
        push_packets(&buffer, &[video_packet(0, 0, true)], 5_000);
        push_packets(&buffer, &[video_packet(1, 0, true)], 9_000);
        assert_eq!(
            demux.buffer_status(),
            Some(BufferStatus {
                timeshift: true,
                start: 5_000,
                end: 9_000
            })
        );
    }
}
