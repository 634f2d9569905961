//! Live streaming task: pumps demultiplexed packets to the client as stream frames.

use std::io;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use log::{debug, info, warn};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use vnsi_protocol::{FieldWriter, ResponsePacket, ReturnCode, StreamPacketType, NO_PTS};

use super::input::{LiveSources, SourceBinding, StreamError};
use crate::demuxer::pts_wrap::ticks_to_micros;
use crate::demuxer::stream::{StreamContent, StreamInfo};
use crate::demuxer::{error_flags, DemuxPacket, DemuxRead, DemuxTarget, Demuxer};
use crate::server::writer::SharedWriter;
use crate::store::Channel;

/// Demuxer reads per batch before yielding.
const BATCH_SIZE: usize = 256;

/// Longest wait for new data before re-checking timers.
const IDLE_POLL: Duration = Duration::from_millis(100);

/// Bound on waiting for the task to finish when closing.
const STOP_TIMEOUT: Duration = Duration::from_secs(3);

const STATUS_REPORTED: u16 = error_flags::NO_SIGNAL | error_flags::SCRAMBLED | error_flags::NO_TABLES;

#[derive(Debug, Clone)]
pub struct StreamerConfig {
    pub allow_rds: bool,
    pub pmt_timeout_ms: i64,
    /// No data for this long is reported as lost signal.
    pub signal_timeout: Duration,
    pub priority: i32,
    /// Capacity of the seekable buffer; `None` streams live only.
    pub timeshift_bytes: Option<usize>,
}

enum Command {
    Seek {
        time_ms: i64,
        reply: oneshot::Sender<Option<u32>>,
    },
    Retune {
        channel: Channel,
        reply: oneshot::Sender<Result<(), StreamError>>,
    },
}

/// Cloneable control handle of a running streamer.
#[derive(Clone)]
pub struct LiveHandle {
    channel_uid: u32,
    commands: mpsc::Sender<Command>,
}

impl LiveHandle {
    pub fn channel_uid(&self) -> u32 {
        self.channel_uid
    }

    /// Seek the session buffer; returns the new serial on success.
    pub async fn seek(&self, time_ms: i64) -> Option<u32> {
        let (reply, rx) = oneshot::channel();
        self.commands.send(Command::Seek { time_ms, reply }).await.ok()?;
        rx.await.ok().flatten()
    }

    /// Rebind the session to the channel's current tuning data.
    pub async fn retune(&self, channel: Channel) -> Result<(), StreamError> {
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(Command::Retune { channel, reply })
            .await
            .map_err(|_| StreamError::Stopped)?;
        rx.await.map_err(|_| StreamError::Stopped)?
    }
}

/// A live session owned by one connection.
pub struct LiveStreamer {
    id: u64,
    handle: LiveHandle,
    cancel: CancellationToken,
    task: Option<JoinHandle<()>>,
}

impl LiveStreamer {
    /// Write the OK reply for `request_id` and start pumping `binding`.
    pub async fn start(
        id: u64,
        request_id: u32,
        binding: SourceBinding,
        sources: Arc<LiveSources>,
        config: StreamerConfig,
        writer: SharedWriter,
    ) -> io::Result<Self> {
        let channel_uid = binding.channel.uid();
        let mut demuxer = Demuxer::new(config.allow_rds, config.pmt_timeout_ms);
        demuxer.open(target_for(&binding.channel), Box::new(binding.buffer.reader()));

        let mut ok = ResponsePacket::response(request_id);
        ok.add_status(ReturnCode::Ok);
        writer.send(ok.finalise()).await?;

        info!(
            "[Streamer {}] Streaming channel {} '{}' on tuner {} (timeshift {})",
            id,
            binding.channel.number,
            binding.channel.name,
            binding.lease.device(),
            config.timeshift_bytes.is_some()
        );

        let (tx, rx) = mpsc::channel(8);
        let cancel = CancellationToken::new();
        let pump = Pump {
            id,
            binding: Some(binding),
            sources,
            demuxer,
            writer,
            cancel: cancel.clone(),
            commands: rx,
            last_error: 0,
            config,
            last_data: Instant::now(),
        };
        let task = tokio::spawn(pump.run());

        Ok(Self {
            id,
            handle: LiveHandle {
                channel_uid,
                commands: tx,
            },
            cancel,
            task: Some(task),
        })
    }

    pub fn handle(&self) -> LiveHandle {
        self.handle.clone()
    }

    pub async fn seek(&self, time_ms: i64) -> Option<u32> {
        self.handle.seek(time_ms).await
    }

    /// False once the task has ended, on its own or through [`close`](Self::close).
    pub fn is_running(&self) -> bool {
        self.task.as_ref().map_or(false, |t| !t.is_finished())
    }

    /// Stop the task and wait for it; safe to call more than once.
    pub async fn close(&mut self) {
        self.cancel.cancel();
        let Some(mut task) = self.task.take() else {
            return;
        };
        if tokio::time::timeout(STOP_TIMEOUT, &mut task).await.is_err() {
            warn!("[Streamer {}] Did not stop in time, aborting", self.id);
            task.abort();
        }
        debug!("[Streamer {}] Closed", self.id);
    }
}

impl Drop for LiveStreamer {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

fn target_for(channel: &Channel) -> DemuxTarget {
    DemuxTarget {
        service_id: channel.sid,
        radio: channel.is_radio(),
    }
}

/// Message for a change of the reported status flags.
fn status_message(current: u16, previous: u16) -> Option<&'static str> {
    let current = current & STATUS_REPORTED;
    if current == previous & STATUS_REPORTED {
        return None;
    }
    Some(if current & error_flags::NO_SIGNAL != 0 {
        "Channel: no signal"
    } else if current & error_flags::SCRAMBLED != 0 {
        "Channel: scrambled"
    } else if current & error_flags::NO_TABLES != 0 {
        "Channel: no stream tables"
    } else {
        "Channel: streaming"
    })
}

fn change_frame(streams: &[StreamInfo]) -> Bytes {
    let mut resp = ResponsePacket::stream(StreamPacketType::Change, 0, 0, 0, 0, 0);
    for stream in streams {
        resp.add_u32(stream.wire_id())
            .add_string(stream.stream_type.wire_name());
        match stream.content {
            StreamContent::Audio | StreamContent::Rds => {
                resp.add_string(&stream.language);
            }
            StreamContent::Subtitle | StreamContent::Teletext => {
                resp.add_string(&stream.language)
                    .add_u32(stream.composition_page_id as u32)
                    .add_u32(stream.ancillary_page_id as u32);
            }
            StreamContent::Video => {}
        }
    }
    resp.finalise()
}

fn packet_frame(packet: &DemuxPacket) -> Bytes {
    let to_wire = |ts: Option<u64>| ts.map_or(NO_PTS, ticks_to_micros);
    let mut resp = ResponsePacket::stream(
        StreamPacketType::MuxPkt,
        packet.stream_id,
        packet.duration,
        to_wire(packet.pts),
        to_wire(packet.dts),
        packet.serial,
    );
    resp.reserve(packet.data.len()).copy_from_slice(&packet.data);
    resp.finalise()
}

enum Wake {
    Stop,
    Command(Command),
    Continue,
}

struct Pump {
    id: u64,
    binding: Option<SourceBinding>,
    sources: Arc<LiveSources>,
    demuxer: Demuxer,
    writer: SharedWriter,
    cancel: CancellationToken,
    commands: mpsc::Receiver<Command>,
    /// Status flags last reported to the client.
    last_error: u16,
    config: StreamerConfig,
    last_data: Instant,
}

impl Pump {
    async fn run(mut self) {
        let mut next_tick = Instant::now() + Duration::from_secs(1);

        loop {
            if self.cancel.is_cancelled() {
                break;
            }
            if self.is_preempted() {
                warn!("[Streamer {}] Tuner taken by a higher priority session", self.id);
                let _ = self.send_status("Channel: preempted").await;
                break;
            }
            while let Ok(command) = self.commands.try_recv() {
                if !self.handle_command(command).await {
                    return self.finish();
                }
            }
            if Instant::now() >= next_tick {
                next_tick = Instant::now() + Duration::from_secs(1);
                if let Err(e) = self.tick().await {
                    debug!("[Streamer {}] Write failed: {}", self.id, e);
                    break;
                }
            }

            match self.pump_batch().await {
                Ok(true) => continue,
                Ok(false) => {}
                Err(e) => {
                    debug!("[Streamer {}] Write failed: {}", self.id, e);
                    break;
                }
            }

            match self.wait().await {
                Wake::Stop => break,
                Wake::Command(command) => {
                    if !self.handle_command(command).await {
                        break;
                    }
                }
                Wake::Continue => {}
            }
        }
        self.finish();
    }

    fn finish(mut self) {
        self.demuxer.close();
        info!(
            "[Streamer {}] Stopped (serial {}, {} packets dropped)",
            self.id,
            self.demuxer.serial(),
            self.demuxer.dropped_packets()
        );
    }

    fn is_preempted(&self) -> bool {
        self.binding
            .as_ref()
            .map_or(false, |b| b.lease.preempted().is_cancelled())
    }

    async fn wait(&mut self) -> Wake {
        let buffer = self.binding.as_ref().map(|b| Arc::clone(&b.buffer));
        let preempted = self
            .binding
            .as_ref()
            .map(|b| b.lease.preempted().clone())
            .unwrap_or_else(CancellationToken::new);
        let notified = async {
            match &buffer {
                Some(buffer) => buffer.notified().await,
                None => std::future::pending().await,
            }
        };

        tokio::select! {
            _ = self.cancel.cancelled() => Wake::Stop,
            _ = preempted.cancelled() => Wake::Continue,
            command = self.commands.recv() => match command {
                Some(command) => Wake::Command(command),
                None => Wake::Stop,
            },
            _ = notified => Wake::Continue,
            _ = tokio::time::sleep(IDLE_POLL) => Wake::Continue,
        }
    }

    /// Returns false when the task should stop.
    async fn handle_command(&mut self, command: Command) -> bool {
        match command {
            Command::Seek { time_ms, reply } => {
                let serial = self.demuxer.seek_time(time_ms);
                debug!("[Streamer {}] Seek to {} -> {:?}", self.id, time_ms, serial);
                let _ = reply.send(serial);
                true
            }
            Command::Retune { channel, reply } => {
                info!(
                    "[Streamer {}] Retuning to channel {} '{}'",
                    self.id, channel.number, channel.name
                );
                // release the old tuner before claiming one for the new data
                self.demuxer.close();
                self.binding = None;
                match self
                    .sources
                    .bind(&channel, self.config.priority, self.config.timeshift_bytes)
                {
                    Ok(binding) => {
                        self.demuxer.open(
                            target_for(&channel),
                            Box::new(binding.buffer.reader()),
                        );
                        self.binding = Some(binding);
                        self.last_data = Instant::now();
                        let _ = reply.send(Ok(()));
                        true
                    }
                    Err(e) => {
                        warn!("[Streamer {}] Retune failed: {}", self.id, e);
                        let _ = reply.send(Err(e));
                        let _ = self.send_status("Channel: retune failed").await;
                        false
                    }
                }
            }
        }
    }

    /// Drain up to one batch of demuxer output. Returns whether data was processed.
    async fn pump_batch(&mut self) -> io::Result<bool> {
        for _ in 0..BATCH_SIZE {
            match self.demuxer.read() {
                DemuxRead::Packet { packet, side_data } => {
                    self.last_data = Instant::now();
                    self.send_packet(&packet).await?;
                    if let Some(side) = side_data {
                        self.writer.send(packet_frame(&side)).await?;
                    }
                }
                DemuxRead::StreamChange(streams) => {
                    self.last_data = Instant::now();
                    debug!("[Streamer {}] {} streams", self.id, streams.len());
                    self.writer.send(change_frame(&streams)).await?;
                }
                DemuxRead::NotReady | DemuxRead::Skipped => {
                    self.last_data = Instant::now();
                }
                DemuxRead::NoData | DemuxRead::EndOfStream => return Ok(false),
            }
        }
        tokio::task::yield_now().await;
        Ok(true)
    }

    async fn send_packet(&mut self, packet: &DemuxPacket) -> io::Result<()> {
        if let Some(ref_ms) = self.demuxer.take_ref_time() {
            let mut resp =
                ResponsePacket::stream(StreamPacketType::RefTime, 0, 0, 0, 0, packet.serial);
            resp.add_u32((ref_ms / 1000) as u32);
            self.writer.send(resp.finalise()).await?;
        }
        self.writer.send(packet_frame(packet)).await
    }

    async fn send_status(&mut self, message: &str) -> io::Result<()> {
        let mut resp = ResponsePacket::stream(StreamPacketType::Status, 0, 0, 0, 0, 0);
        resp.add_string(message);
        self.writer.send(resp.finalise()).await
    }

    /// Once-per-second reporting of status changes and buffer statistics.
    async fn tick(&mut self) -> io::Result<()> {
        let mut flags = self.demuxer.take_error() & !error_flags::NO_DATA;
        if self.last_data.elapsed() >= self.config.signal_timeout {
            flags |= error_flags::NO_SIGNAL;
        }
        let previous = std::mem::replace(&mut self.last_error, flags);
        if let Some(message) = status_message(flags, previous) {
            info!("[Streamer {}] {}", self.id, message);
            self.send_status(message).await?;
        }

        if let Some(status) = self.demuxer.buffer_status().filter(|s| s.timeshift) {
            let mut resp = ResponsePacket::stream(StreamPacketType::BufferStats, 0, 0, 0, 0, 0);
            resp.add_u8(1)
                .add_u32((status.start / 1000) as u32)
                .add_u32((status.end / 1000) as u32);
            self.writer.send(resp.finalise()).await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::demuxer::test_util::{audio_packet, table_packets, video_packet, AUDIO_PID, VIDEO_PID};
    use crate::live::buffer::{TimeshiftBuffer, VideoBuffer};
    use crate::live::input::test_util::MemoryInput;
    use crate::live::tuner::TunerPool;
    use crate::store::models::test_util::channel;
    use tokio::io::{AsyncReadExt, DuplexStream};
    use vnsi_protocol::{decode_response_header, ResponseHeader, ResponseKind};

    async fn read_frame(client: &mut DuplexStream) -> (ResponseHeader, Vec<u8>) {
        let mut head = vec![0u8; 12];
        client.read_exact(&mut head).await.unwrap();
        let header = match decode_response_header(&head).unwrap() {
            Some(header) => header,
            None => {
                let mut rest = vec![0u8; 28];
                client.read_exact(&mut rest).await.unwrap();
                head.extend(rest);
                decode_response_header(&head).unwrap().unwrap()
            }
        };
        let mut payload = vec![0u8; header.payload_len as usize];
        client.read_exact(&mut payload).await.unwrap();
        (header, payload)
    }

    fn stream_bytes() -> Vec<u8> {
        let mut packets = table_packets(10, 1);
        packets.push(video_packet(0, 90_000, true));
        packets.push(audio_packet(0, 90_900, &[0xAA; 8]));
        packets.concat()
    }

    fn config(timeshift_bytes: Option<usize>) -> StreamerConfig {
        StreamerConfig {
            allow_rds: false,
            pmt_timeout_ms: 5_000,
            signal_timeout: Duration::from_secs(10),
            priority: 0,
            timeshift_bytes,
        }
    }

    async fn start_with(
        input: MemoryInput,
        timeshift_bytes: Option<usize>,
    ) -> (LiveStreamer, DuplexStream, Arc<LiveSources>, Arc<TimeshiftBuffer>) {
        let sources = Arc::new(LiveSources::new(TunerPool::new(1), Arc::new(input), 1 << 20));
        let binding = sources.bind(&channel(1, "One", 10), 0, timeshift_bytes).unwrap();
        let buffer = Arc::clone(&binding.buffer);
        let (client, server) = tokio::io::duplex(1 << 16);
        let streamer = LiveStreamer::start(
            7,
            42,
            binding,
            Arc::clone(&sources),
            config(timeshift_bytes),
            SharedWriter::new(server),
        )
        .await
        .unwrap();
        (streamer, client, sources, buffer)
    }

    async fn start(input: MemoryInput) -> (LiveStreamer, DuplexStream, Arc<LiveSources>) {
        let (streamer, client, sources, _) = start_with(input, None).await;
        (streamer, client, sources)
    }

    async fn next_mux_packet(client: &mut DuplexStream) -> vnsi_protocol::StreamHeader {
        loop {
            let (header, _) = read_frame(client).await;
            if header.id == StreamPacketType::MuxPkt as u32 {
                return header.stream.unwrap();
            }
        }
    }

    #[tokio::test]
    async fn test_reply_then_change_then_packets() {
        let mut input = MemoryInput::default();
        input.streams.insert(1, stream_bytes());
        let (mut streamer, mut client, sources) = start(input).await;

        let (header, payload) = read_frame(&mut client).await;
        assert_eq!(header.kind, ResponseKind::Response);
        assert_eq!(header.id, 42);
        assert_eq!(payload, 0u32.to_be_bytes());

        let (header, payload) = read_frame(&mut client).await;
        assert_eq!(header.id, StreamPacketType::Change as u32);
        assert_eq!(&payload[..4], &(VIDEO_PID as u32).to_be_bytes());
        assert_eq!(&payload[4..9], b"H264\0");

        let (header, payload) = read_frame(&mut client).await;
        assert_eq!(header.id, StreamPacketType::RefTime as u32);
        assert_eq!(payload.len(), 4);

        let (header, _) = read_frame(&mut client).await;
        let stream = header.stream.unwrap();
        assert_eq!(header.id, StreamPacketType::MuxPkt as u32);
        assert_eq!(stream.stream_id, VIDEO_PID as u32);
        assert_eq!(stream.pts, 1_000_000);
        assert_eq!(stream.serial, 0);

        let (header, _) = read_frame(&mut client).await;
        assert_eq!(header.stream.unwrap().stream_id, AUDIO_PID as u32);

        assert!(streamer.is_running());
        streamer.close().await;
        streamer.close().await;
        assert!(!streamer.is_running());
        assert_eq!(sources.tuners().holders(0), 0);
    }

    #[tokio::test]
    async fn test_seek_refused_without_timeshift() {
        let mut input = MemoryInput::default();
        input.streams.insert(1, stream_bytes());
        let (mut streamer, mut client, _sources) = start(input).await;
        // wait until the feed has filled the buffer
        next_mux_packet(&mut client).await;
        assert_eq!(streamer.seek(0).await, None);
        assert!(streamer.is_running());
        streamer.close().await;
    }

    #[tokio::test]
    async fn test_seek_serial_carried_by_following_packets() {
        let mut input = MemoryInput::default();
        input.streams.insert(1, stream_bytes());
        let (mut streamer, mut client, _sources, buffer) = start_with(input, Some(1 << 20)).await;

        // the whole input arrives as one chunk, so every packet shares one stamp
        for pid in [VIDEO_PID, AUDIO_PID] {
            let live = next_mux_packet(&mut client).await;
            assert_eq!((live.stream_id, live.serial), (pid as u32, 0));
        }
        let (oldest, newest) = buffer.reader().time_window().unwrap();
        assert_eq!(oldest, newest);

        let serial = streamer.seek(oldest).await.unwrap();
        assert_eq!(serial, 1);
        // replay starts at the chunk's first packet, not its last
        let video = next_mux_packet(&mut client).await;
        assert_eq!(video.stream_id, VIDEO_PID as u32);
        assert_eq!(video.serial, serial);
        let audio = next_mux_packet(&mut client).await;
        assert_eq!(audio.stream_id, AUDIO_PID as u32);
        assert_eq!(audio.serial, serial);
        streamer.close().await;
    }

    #[tokio::test]
    async fn test_retune_failure_stops_streamer() {
        let mut input = MemoryInput::default();
        input.streams.insert(1, stream_bytes());
        let (mut streamer, _client, _sources) = start(input).await;

        let err = streamer.handle().retune(channel(9, "Gone", 90)).await.unwrap_err();
        assert!(matches!(err, StreamError::Input(_)));
        for _ in 0..50 {
            if !streamer.is_running() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(!streamer.is_running());
        streamer.close().await;
    }

    #[test]
    fn test_status_message_changes_only() {
        assert_eq!(status_message(0, 0), None);
        assert_eq!(
            status_message(error_flags::SCRAMBLED, 0),
            Some("Channel: scrambled")
        );
        assert_eq!(
            status_message(error_flags::SCRAMBLED | error_flags::PES_GENERAL, error_flags::SCRAMBLED),
            None
        );
        assert_eq!(
            status_message(error_flags::NO_SIGNAL | error_flags::SCRAMBLED, error_flags::SCRAMBLED),
            Some("Channel: no signal")
        );
        assert_eq!(
            status_message(0, error_flags::NO_SIGNAL),
            Some("Channel: streaming")
        );
    }
}
