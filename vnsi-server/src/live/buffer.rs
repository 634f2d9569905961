//! Ring buffer of time-stamped transport packets feeding a live session.
//!
//! Packets are addressed by absolute byte position since the buffer was
//! created; the oldest packets are evicted once capacity is reached. In
//! live-only mode the ring is small and seeking is refused.

use std::collections::VecDeque;
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::futures::Notified;
use tokio::sync::Notify;

use crate::demuxer::packet::TS_PACKET_SIZE;

/// Result of reading the next packet from a buffer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BufferRead {
    Packet { data: Bytes, time_ms: i64 },
    /// Nothing buffered past the cursor yet.
    Empty,
    /// Producer is gone and the cursor reached the end.
    Closed,
}

/// Source of packets for a [`crate::demuxer::Demuxer`].
pub trait VideoBuffer: Send {
    fn read_packet(&mut self) -> BufferRead;

    /// Whether the buffer keeps history that can be seeked.
    fn has_timeshift(&self) -> bool;

    /// Wall-clock ms of the oldest and newest buffered packet.
    fn time_window(&self) -> Option<(i64, i64)>;

    /// Move the cursor to the first packet carrying the latest stamp at or
    /// before `time_ms`.
    ///
    /// Returns false and leaves the cursor alone if the time is outside the window.
    fn seek_time(&mut self, time_ms: i64) -> bool;

    /// Absolute byte position of the cursor.
    fn position(&self) -> u64;
}

#[derive(Debug)]
struct Stamped {
    data: Bytes,
    time_ms: i64,
}

#[derive(Debug)]
struct Ring {
    packets: VecDeque<Stamped>,
    /// Absolute position of `packets[0]`.
    start_pos: u64,
    capacity: usize,
    closed: bool,
}

impl Ring {
    fn end_pos(&self) -> u64 {
        self.start_pos + (self.packets.len() * TS_PACKET_SIZE) as u64
    }

    fn index_of(&self, pos: u64) -> Option<usize> {
        if pos < self.start_pos || pos >= self.end_pos() {
            return None;
        }
        Some(((pos - self.start_pos) / TS_PACKET_SIZE as u64) as usize)
    }
}

/// Shared ring written by an input feed and read by one session.
#[derive(Debug)]
pub struct TimeshiftBuffer {
    ring: Mutex<Ring>,
    notify: Notify,
    timeshift: bool,
}

impl TimeshiftBuffer {
    pub fn new(capacity_bytes: usize, timeshift: bool) -> Arc<Self> {
        let capacity = (capacity_bytes / TS_PACKET_SIZE).max(1);
        Arc::new(Self {
            ring: Mutex::new(Ring {
                packets: VecDeque::new(),
                start_pos: 0,
                capacity,
                closed: false,
            }),
            notify: Notify::new(),
            timeshift,
        })
    }

    /// Append a chunk of whole packets stamped with `time_ms`.
    pub fn push_chunk(&self, chunk: Bytes, time_ms: i64) {
        {
            let mut ring = self.ring.lock();
            let mut offset = 0;
            while offset + TS_PACKET_SIZE <= chunk.len() {
                ring.packets.push_back(Stamped {
                    data: chunk.slice(offset..offset + TS_PACKET_SIZE),
                    time_ms,
                });
                offset += TS_PACKET_SIZE;
            }
            while ring.packets.len() > ring.capacity {
                ring.packets.pop_front();
                ring.start_pos += TS_PACKET_SIZE as u64;
            }
        }
        self.notify.notify_waiters();
    }

    /// Mark the producer as finished.
    pub fn close(&self) {
        self.ring.lock().closed = true;
        self.notify.notify_waiters();
    }

    /// Future completing on the next push or close.
    pub fn notified(&self) -> Notified<'_> {
        self.notify.notified()
    }

    /// New reader positioned at the oldest buffered packet.
    pub fn reader(self: &Arc<Self>) -> BufferReader {
        let pos = self.ring.lock().start_pos;
        BufferReader {
            buffer: Arc::clone(self),
            pos,
        }
    }

    fn time_window(&self) -> Option<(i64, i64)> {
        let ring = self.ring.lock();
        Some((ring.packets.front()?.time_ms, ring.packets.back()?.time_ms))
    }
}

/// Cursor over a [`TimeshiftBuffer`].
#[derive(Debug)]
pub struct BufferReader {
    buffer: Arc<TimeshiftBuffer>,
    pos: u64,
}

impl VideoBuffer for BufferReader {
    fn read_packet(&mut self) -> BufferRead {
        let ring = self.buffer.ring.lock();
        if self.pos < ring.start_pos {
            // overrun: the writer lapped us
            self.pos = ring.start_pos;
        }
        match ring.index_of(self.pos) {
            Some(index) => {
                let packet = &ring.packets[index];
                self.pos += TS_PACKET_SIZE as u64;
                BufferRead::Packet {
                    data: packet.data.clone(),
                    time_ms: packet.time_ms,
                }
            }
            None if ring.closed => BufferRead::Closed,
            None => BufferRead::Empty,
        }
    }

    fn has_timeshift(&self) -> bool {
        self.buffer.timeshift
    }

    fn time_window(&self) -> Option<(i64, i64)> {
        self.buffer.time_window()
    }

    fn seek_time(&mut self, time_ms: i64) -> bool {
        if !self.buffer.timeshift {
            return false;
        }
        let ring = self.buffer.ring.lock();
        let (Some(first), Some(last)) = (ring.packets.front(), ring.packets.back()) else {
            return false;
        };
        if time_ms < first.time_ms || time_ms > last.time_ms {
            return false;
        }
        // stamps are non-decreasing and shared by every packet of a chunk
        let after = ring.packets.partition_point(|p| p.time_ms <= time_ms);
        let stamp = ring.packets[after - 1].time_ms;
        let index = ring.packets.partition_point(|p| p.time_ms < stamp);
        self.pos = ring.start_pos + (index * TS_PACKET_SIZE) as u64;
        true
    }

    fn position(&self) -> u64 {
        self.pos
    }
}
