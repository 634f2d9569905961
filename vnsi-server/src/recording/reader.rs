//! Random access over a segmented recording.

use std::fs::File;
use std::io::{self, Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};

use log::{debug, warn};
use thiserror::Error;

use super::index::{FrameIndex, IndexFormat, PES_INDEX_FILE, TS_INDEX_FILE};

/// Largest block a single read may return.
pub const MAX_BLOCK_SIZE: usize = 500_000;

/// Highest segment number a recording may use.
const MAX_SEGMENTS: u16 = 65_535;

#[derive(Error, Debug)]
pub enum RecordingError {
    #[error("No segments found in {0}")]
    NoSegments(PathBuf),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

#[derive(Debug, Clone)]
struct Segment {
    number: u16,
    path: PathBuf,
    size: u64,
    /// Absolute position of the first byte.
    start: u64,
}

/// Result of an I-frame search.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IFrame {
    pub position: u64,
    pub frame: u32,
    pub length: u32,
}

/// Read-only view of one recording directory.
#[derive(Debug)]
pub struct RecordingReader {
    dir: PathBuf,
    format: IndexFormat,
    segments: Vec<Segment>,
    index: FrameIndex,
    total_len: u64,
    /// Cached handle of the segment read last.
    open: Option<(usize, File)>,
}

fn segment_path(dir: &Path, format: IndexFormat, number: u16) -> PathBuf {
    match format {
        IndexFormat::Ts => dir.join(format!("{:05}.ts", number)),
        IndexFormat::Pes => dir.join(format!("{:03}.vdr", number)),
    }
}

impl RecordingReader {
    pub fn open(dir: &Path) -> Result<Self, RecordingError> {
        let format = if segment_path(dir, IndexFormat::Ts, 1).exists() {
            IndexFormat::Ts
        } else if segment_path(dir, IndexFormat::Pes, 1).exists() {
            IndexFormat::Pes
        } else {
            return Err(RecordingError::NoSegments(dir.to_path_buf()));
        };

        let mut reader = Self {
            dir: dir.to_path_buf(),
            format,
            segments: Vec::new(),
            index: FrameIndex::default(),
            total_len: 0,
            open: None,
        };
        reader.rescan();
        debug!(
            "[Recording] Opened {:?}: {} segments, {} bytes, {} frames",
            dir,
            reader.segments.len(),
            reader.total_len,
            reader.index.len()
        );
        Ok(reader)
    }

    /// Re-read segment sizes and the index to pick up a growing recording.
    pub fn rescan(&mut self) {
        let mut segments = Vec::new();
        let mut start = 0;
        for number in 1..=MAX_SEGMENTS {
            let path = segment_path(&self.dir, self.format, number);
            let Ok(meta) = std::fs::metadata(&path) else {
                break;
            };
            segments.push(Segment {
                number,
                path,
                size: meta.len(),
                start,
            });
            start += meta.len();
        }
        self.segments = segments;
        self.total_len = start;
        self.open = None;

        let index_name = match self.format {
            IndexFormat::Ts => TS_INDEX_FILE,
            IndexFormat::Pes => PES_INDEX_FILE,
        };
        self.index = match FrameIndex::load(&self.dir.join(index_name), self.format) {
            Ok(index) => index,
            Err(e) => {
                warn!("[Recording] No usable index in {:?}: {}", self.dir, e);
                FrameIndex::default()
            }
        };
    }

    pub fn total_len(&self) -> u64 {
        self.total_len
    }

    pub fn frame_count(&self) -> u32 {
        self.index.len() as u32
    }

    pub fn is_pes(&self) -> bool {
        self.format == IndexFormat::Pes
    }

    fn segment_for_position(&self, position: u64) -> Option<usize> {
        if position >= self.total_len {
            return None;
        }
        let after = self.segments.partition_point(|s| s.start <= position);
        after.checked_sub(1)
    }

    fn segment_by_number(&self, number: u16) -> Option<&Segment> {
        // segments are numbered consecutively from 1
        self.segments
            .get((number as usize).checked_sub(1)?)
            .filter(|s| s.number == number)
    }

    fn file_for(&mut self, segment: usize) -> io::Result<&mut File> {
        let cached = matches!(&self.open, Some((idx, _)) if *idx == segment);
        if !cached {
            let file = File::open(&self.segments[segment].path)?;
            self.open = Some((segment, file));
        }
        match &mut self.open {
            Some((_, file)) => Ok(file),
            None => Err(io::Error::new(io::ErrorKind::Other, "segment handle missing")),
        }
    }

    /// Fill `buf` from `position`, crossing segment boundaries.
    ///
    /// Returns the number of bytes read; 0 past the end, for oversized requests
    /// or when the first segment read fails.
    pub fn get_block(&mut self, position: u64, buf: &mut [u8]) -> usize {
        if buf.len() > MAX_BLOCK_SIZE {
            return 0;
        }
        let Some(mut segment) = self.segment_for_position(position) else {
            return 0;
        };

        let mut filled = 0;
        let mut position = position;
        while filled < buf.len() && segment < self.segments.len() {
            let seg_start = self.segments[segment].start;
            let seg_size = self.segments[segment].size;
            let offset = position - seg_start;
            let want = (buf.len() - filled).min((seg_size - offset) as usize);

            let result = self.file_for(segment).and_then(|file| {
                file.seek(SeekFrom::Start(offset))?;
                read_up_to(file, &mut buf[filled..filled + want])
            });
            match result {
                Ok(n) => {
                    filled += n;
                    position += n as u64;
                    if n < want {
                        // segment shorter than at the last scan
                        break;
                    }
                }
                Err(e) => {
                    warn!("[Recording] Read error at {}: {}", position, e);
                    self.open = None;
                    break;
                }
            }
            segment += 1;
        }
        filled
    }

    /// Absolute position of `frame`; the total length if the frame is past the index.
    pub fn position_from_frame(&self, frame: u32) -> u64 {
        if self.index.is_empty() {
            return 0;
        }
        let Some(entry) = self.index.get(frame) else {
            return self.total_len;
        };
        self.segment_by_number(entry.segment)
            .map_or(self.total_len, |s| s.start + entry.offset)
    }

    /// Frame containing `position`; the last frame for positions past the end.
    pub fn frame_from_position(&self, position: u64) -> u32 {
        if self.index.is_empty() {
            return 0;
        }
        let Some(segment) = self.segment_for_position(position) else {
            return self.frame_count() - 1;
        };
        let segment = &self.segments[segment];
        self.index
            .frame_at(segment.number, position - segment.start)
            .unwrap_or(0)
    }

    /// Next independent frame after (`forward`) or before `frame`.
    pub fn next_iframe(&self, frame: u32, forward: bool) -> Option<IFrame> {
        let found = self.index.next_independent(frame, forward)?;
        let entry = self.index.get(found)?;
        let segment = self.segment_by_number(entry.segment)?;
        let position = segment.start + entry.offset;

        // frame ends where the next one starts, or at the segment end
        let end = match self.index.get(found + 1) {
            Some(next) if next.segment == entry.segment => segment.start + next.offset,
            _ => segment.start + segment.size,
        };
        Some(IFrame {
            position,
            frame: found,
            length: end.saturating_sub(position).min(u32::MAX as u64) as u32,
        })
    }
}

fn read_up_to(file: &mut File, buf: &mut [u8]) -> io::Result<usize> {
    let mut read = 0;
    while read < buf.len() {
        match file.read(&mut buf[read..]) {
            Ok(0) => break,
            Ok(n) => read += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(read)
}

#[cfg(test)]
pub(crate) mod test_util {
    use std::fs;
    use std::path::{Path, PathBuf};
    use std::sync::atomic::{AtomicU32, Ordering};

    use super::super::index::FrameIndexEntry;

    static COUNTER: AtomicU32 = AtomicU32::new(0);

    /// Fresh empty directory under the system temp dir.
    pub fn temp_dir(tag: &str) -> PathBuf {
        let n = COUNTER.fetch_add(1, Ordering::SeqCst);
        let dir = std::env::temp_dir().join(format!("vnsi-{}-{}-{}", tag, std::process::id(), n));
        let _ = fs::remove_dir_all(&dir);
        fs::create_dir_all(&dir).unwrap();
        dir
    }

    /// Write segments of the given sizes (byte value = segment number) and an index.
    pub fn write_recording(dir: &Path, sizes: &[usize], entries: &[FrameIndexEntry]) {
        for (i, size) in sizes.iter().enumerate() {
            let number = i + 1;
            fs::write(dir.join(format!("{:05}.ts", number)), vec![number as u8; *size]).unwrap();
        }
        let index: Vec<u8> = entries.iter().flat_map(|e| e.encode()).collect();
        fs::write(dir.join("index"), index).unwrap();
    }
}
