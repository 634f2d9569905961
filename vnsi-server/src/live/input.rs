//! Transport stream inputs and the feed task that fills a session buffer.

use std::io;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use log::{debug, info, warn};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use vnsi_protocol::ReturnCode;

use super::buffer::TimeshiftBuffer;
use super::tuner::{TunerError, TunerLease, TunerPool};
use crate::demuxer::packet::{PacketAligner, TS_PACKET_SIZE};
use crate::store::Channel;

/// Bytes read from the input per iteration.
const READ_CHUNK_SIZE: usize = TS_PACKET_SIZE * 348;

pub type TsReader = Box<dyn AsyncRead + Send + Unpin>;

/// Source of a channel's transport stream.
pub trait TsInput: Send + Sync {
    fn open(&self, channel: &Channel) -> io::Result<TsReader>;

    /// Target delivery rate; `None` reads as fast as the source allows.
    fn pace_bytes_per_sec(&self) -> Option<u64> {
        None
    }

    /// Reopen the source when it reaches its end.
    fn restart_on_eof(&self) -> bool {
        false
    }
}

/// Replays the `.ts` file named by the channel's `source`.
#[derive(Debug, Clone)]
pub struct FileReplayInput {
    bitrate_kbps: u32,
    looping: bool,
}

impl FileReplayInput {
    pub fn new(bitrate_kbps: u32, looping: bool) -> Self {
        Self {
            bitrate_kbps,
            looping,
        }
    }

    fn source_path(channel: &Channel) -> io::Result<PathBuf> {
        channel.source.clone().ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::NotFound,
                format!("channel {} has no source", channel.number),
            )
        })
    }
}

impl TsInput for FileReplayInput {
    fn open(&self, channel: &Channel) -> io::Result<TsReader> {
        let path = Self::source_path(channel)?;
        let file = std::fs::File::open(&path)?;
        debug!("Replaying {:?} for channel {}", path, channel.number);
        Ok(Box::new(tokio::fs::File::from_std(file)))
    }

    fn pace_bytes_per_sec(&self) -> Option<u64> {
        (self.bitrate_kbps > 0).then(|| self.bitrate_kbps as u64 * 1000 / 8)
    }

    fn restart_on_eof(&self) -> bool {
        self.looping
    }
}

/// Live session start/retune failures.
#[derive(Debug, Error)]
pub enum StreamError {
    #[error("Unknown channel {0:#010x}")]
    UnknownChannel(u32),

    #[error("Channel scan in progress")]
    ScanActive,

    #[error("Tuner unavailable: {0}")]
    Tuner(#[from] TunerError),

    #[error("Input failed: {0}")]
    Input(#[from] io::Error),

    #[error("Streamer has stopped")]
    Stopped,
}

impl StreamError {
    pub fn return_code(&self) -> ReturnCode {
        match self {
            StreamError::UnknownChannel(_) => ReturnCode::DataInvalid,
            StreamError::ScanActive => ReturnCode::NotSupported,
            StreamError::Tuner(_) | StreamError::Input(_) => ReturnCode::DataLocked,
            StreamError::Stopped => ReturnCode::Error,
        }
    }
}

fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// Read from `reader`, align on packet boundaries and push into `buffer`
/// until cancelled or the input ends.
///
/// The buffer stays open when the input ends so the session reports
/// missing data instead of tearing down.
pub fn spawn_feed(
    input: Arc<dyn TsInput>,
    channel: Channel,
    mut reader: TsReader,
    buffer: Arc<TimeshiftBuffer>,
    cancel: CancellationToken,
) {
    tokio::spawn(async move {
        let mut aligner = PacketAligner::new();
        let mut buf = vec![0u8; READ_CHUNK_SIZE];
        let pace = input.pace_bytes_per_sec();
        let mut started = Instant::now();
        let mut delivered: u64 = 0;

        loop {
            let n = tokio::select! {
                _ = cancel.cancelled() => break,
                result = reader.read(&mut buf) => match result {
                    Ok(n) => n,
                    Err(e) => {
                        warn!("Input read error on channel {}: {}", channel.number, e);
                        break;
                    }
                },
            };

            if n == 0 {
                if !input.restart_on_eof() {
                    info!("Input for channel {} ended", channel.number);
                    break;
                }
                match input.open(&channel) {
                    Ok(next) => {
                        reader = next;
                        aligner.reset();
                        continue;
                    }
                    Err(e) => {
                        warn!("Reopen of channel {} failed: {}", channel.number, e);
                        break;
                    }
                }
            }

            let mut aligned = Vec::with_capacity(n);
            aligner.push(&buf[..n], |packet| aligned.extend_from_slice(packet));
            if !aligned.is_empty() {
                buffer.push_chunk(Bytes::from(aligned), now_ms());
            }

            if let Some(rate) = pace {
                delivered += n as u64;
                let due = started + Duration::from_millis(delivered * 1000 / rate.max(1));
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep_until(due) => {}
                }
                // keep the counters small on long runs
                if delivered > rate * 60 {
                    started = Instant::now();
                    delivered = 0;
                }
            }
        }

        if aligner.skipped() > 0 {
            debug!(
                "Feed for channel {} skipped {} bytes to resync",
                channel.number,
                aligner.skipped()
            );
        }
    });
}

/// Tuner lease, buffer and feed task behind one live session.
pub struct SourceBinding {
    pub channel: Channel,
    pub buffer: Arc<TimeshiftBuffer>,
    pub lease: TunerLease,
    feed_cancel: CancellationToken,
}

impl Drop for SourceBinding {
    fn drop(&mut self) {
        self.feed_cancel.cancel();
        self.buffer.close();
    }
}

/// Tuners and input shared by all live sessions.
pub struct LiveSources {
    tuners: Arc<TunerPool>,
    input: Arc<dyn TsInput>,
    live_buffer_bytes: usize,
}

impl LiveSources {
    pub fn new(tuners: Arc<TunerPool>, input: Arc<dyn TsInput>, live_buffer_bytes: usize) -> Self {
        Self {
            tuners,
            input,
            live_buffer_bytes,
        }
    }

    #[cfg(test)]
    pub fn tuners(&self) -> &Arc<TunerPool> {
        &self.tuners
    }

    /// Acquire a tuner, open the input and start feeding a fresh buffer.
    ///
    /// `timeshift_bytes` selects a seekable buffer of that capacity.
    pub fn bind(
        &self,
        channel: &Channel,
        priority: i32,
        timeshift_bytes: Option<usize>,
    ) -> Result<SourceBinding, StreamError> {
        let lease = self.tuners.acquire(channel, priority)?;
        let reader = self.input.open(channel)?;

        let buffer = match timeshift_bytes {
            Some(capacity) => TimeshiftBuffer::new(capacity, true),
            None => TimeshiftBuffer::new(self.live_buffer_bytes, false),
        };
        let feed_cancel = CancellationToken::new();
        spawn_feed(
            Arc::clone(&self.input),
            channel.clone(),
            reader,
            Arc::clone(&buffer),
            feed_cancel.clone(),
        );

        Ok(SourceBinding {
            channel: channel.clone(),
            buffer,
            lease,
            feed_cancel,
        })
    }
}

#[cfg(test)]
pub(crate) mod test_util {
    use super::*;
    use std::collections::HashMap;

    /// Serves fixed byte streams keyed by channel number.
    #[derive(Default)]
    pub struct MemoryInput {
        pub streams: HashMap<u32, Vec<u8>>,
    }

    impl TsInput for MemoryInput {
        fn open(&self, channel: &Channel) -> io::Result<TsReader> {
            let data = self
                .streams
                .get(&channel.number)
                .cloned()
                .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, "no stream"))?;
            Ok(Box::new(io::Cursor::new(data)))
        }
    }
}
