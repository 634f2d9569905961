//! Per-connection command loop.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use log::{debug, info, trace, warn};
use tokio::io::AsyncRead;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use vnsi_protocol::{
    Opcode, ProtocolError, RequestHeader, RequestPacket, ResponsePacket, REQUEST_HEADER_SIZE,
};

use super::context::ServerContext;
use super::io::{read_exact_deadline, ReadOutcome};
use super::registry::{mandatory_len, Disposition, Handler};
use super::status::{EpgUpdate, EpgUpdates, LiveSlot, StatusForwarder};
use super::writer::SharedWriter;
use crate::live::LiveStreamer;
use crate::recording::RecordingReader;

/// Bound on waiting for the scan event task when the connection closes.
const SCAN_TASK_TIMEOUT: Duration = Duration::from_secs(2);

/// Connection lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Unauthenticated,
    Authenticated,
    Closed,
}

/// State of one client connection. Handlers receive it mutably.
pub struct ClientSession {
    id: u64,
    ctx: Arc<ServerContext>,
    writer: SharedWriter,
    shutdown: CancellationToken,
    state: SessionState,
    protocol_version: u32,
    client_name: String,
    rds: bool,
    streamer: Option<LiveStreamer>,
    live: LiveSlot,
    recording: Option<RecordingReader>,
    status: Option<StatusForwarder>,
    epg_updates: EpgUpdates,
    scan_task: Option<JoinHandle<()>>,
    osd_connected: bool,
    automatic_groups: bool,
}

impl ClientSession {
    pub fn new(id: u64, ctx: Arc<ServerContext>, writer: SharedWriter, shutdown: CancellationToken) -> Self {
        Self {
            id,
            ctx,
            writer,
            shutdown,
            state: SessionState::Unauthenticated,
            protocol_version: 0,
            client_name: String::new(),
            rds: false,
            streamer: None,
            live: LiveSlot::default(),
            recording: None,
            status: None,
            epg_updates: EpgUpdates::default(),
            scan_task: None,
            osd_connected: false,
            automatic_groups: false,
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn ctx(&self) -> &Arc<ServerContext> {
        &self.ctx
    }

    pub fn writer(&self) -> &SharedWriter {
        &self.writer
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn protocol_version(&self) -> u32 {
        self.protocol_version
    }

    pub fn rds_enabled(&self) -> bool {
        self.rds
    }

    /// Record the outcome of a login request.
    pub fn login(&mut self, version: u32, name: String, authenticated: bool, rds: bool) {
        self.protocol_version = version;
        self.client_name = name;
        self.rds = rds;
        self.state = if authenticated {
            SessionState::Authenticated
        } else {
            SessionState::Unauthenticated
        };
    }

    pub fn client_name(&self) -> &str {
        &self.client_name
    }

    pub fn streamer(&self) -> Option<&LiveStreamer> {
        self.streamer.as_ref()
    }

    /// True while a live stream task is running for this connection.
    pub fn is_streaming(&self) -> bool {
        self.streamer.as_ref().map_or(false, LiveStreamer::is_running)
    }

    pub fn set_streamer(&mut self, streamer: LiveStreamer) {
        *self.live.lock() = Some(streamer.handle());
        self.streamer = Some(streamer);
    }

    /// Forget a live stream whose task ended on its own, e.g. after a failed retune.
    fn reap_streamer(&mut self) {
        if self.streamer.is_some() && !self.is_streaming() {
            info!("[Client {}] Live stream ended", self.id);
            *self.live.lock() = None;
            self.streamer = None;
        }
    }

    /// Stop the live stream, waiting for its task to end.
    pub async fn stop_streaming(&mut self) {
        *self.live.lock() = None;
        if let Some(mut streamer) = self.streamer.take() {
            streamer.close().await;
        }
    }

    pub fn recording(&mut self) -> Option<&mut RecordingReader> {
        self.recording.as_mut()
    }

    pub fn has_recording(&self) -> bool {
        self.recording.is_some()
    }

    pub fn set_recording(&mut self, reader: Option<RecordingReader>) {
        self.recording = reader;
    }

    pub fn epg_updates(&self) -> &EpgUpdates {
        &self.epg_updates
    }

    /// Follow guide updates of a channel listed to the client.
    pub fn follow_epg(&self, uid: u32) {
        self.epg_updates.lock().entry(uid).or_default();
    }

    /// The client fetched the guide up to `last_event`.
    pub fn epg_fetched(&self, uid: u32, last_event: u32) {
        self.epg_updates.lock().insert(
            uid,
            EpgUpdate {
                last_event,
                attempts: 0,
            },
        );
    }

    pub fn set_status_interface(&mut self, enabled: bool) {
        if enabled == self.status.is_some() {
            return;
        }
        if enabled {
            self.status = Some(StatusForwarder::spawn(
                self.id,
                Arc::clone(&self.ctx),
                self.writer.clone(),
                Arc::clone(&self.epg_updates),
                Arc::clone(&self.live),
            ));
        } else {
            // dropping cancels the task
            self.status = None;
        }
        info!(
            "[Client {}] Status interface {}",
            self.id,
            if enabled { "enabled" } else { "disabled" }
        );
    }

    pub fn set_scan_task(&mut self, task: JoinHandle<()>) {
        if let Some(old) = self.scan_task.replace(task) {
            old.abort();
        }
    }

    pub fn osd_connected(&self) -> bool {
        self.osd_connected
    }

    pub fn set_osd_connected(&mut self, connected: bool) {
        self.osd_connected = connected;
    }

    /// Channel groups follow providers rather than the configured groups.
    pub fn automatic_groups(&self) -> bool {
        self.automatic_groups
    }

    pub fn set_automatic_groups(&mut self, automatic: bool) {
        self.automatic_groups = automatic;
    }

    /// Serve requests until the peer leaves, a transport error occurs, or shutdown.
    pub async fn run<R>(&mut self, mut reader: R)
    where
        R: AsyncRead + Unpin,
    {
        loop {
            let mut head = [0u8; REQUEST_HEADER_SIZE];
            let outcome = tokio::select! {
                _ = self.shutdown.cancelled() => {
                    info!("[Client {}] Server shutting down", self.id);
                    break;
                }
                outcome = read_exact_deadline(&mut reader, &mut head, None) => outcome,
            };
            if !self.check_read(outcome, "header") {
                break;
            }

            let header = RequestHeader::from_bytes(&head);
            if let Err(e) = header.validate() {
                warn!("[Client {}] Bad request header: {}", self.id, e);
                break;
            }

            let mut payload = vec![0u8; header.payload_len as usize];
            if !payload.is_empty() {
                let outcome =
                    read_exact_deadline(&mut reader, &mut payload, Some(self.ctx.settings.read_timeout)).await;
                if !self.check_read(outcome, "payload") {
                    break;
                }
            }

            if !self.dispatch(header, Bytes::from(payload)).await {
                break;
            }
        }
        self.cleanup().await;
    }

    fn check_read(&self, outcome: ReadOutcome, what: &str) -> bool {
        match outcome {
            ReadOutcome::Complete => true,
            ReadOutcome::Closed => {
                info!("[Client {}] Disconnected", self.id);
                false
            }
            ReadOutcome::TimedOut => {
                warn!("[Client {}] Timed out reading {}", self.id, what);
                false
            }
            ReadOutcome::Failed(e) => {
                warn!("[Client {}] Read error: {}", self.id, e);
                false
            }
        }
    }

    /// Run one request. Returns false when the connection must close.
    async fn dispatch(&mut self, header: RequestHeader, payload: Bytes) -> bool {
        if self.state != SessionState::Authenticated && header.opcode != Opcode::Login as u32 {
            warn!(
                "[Client {}] Opcode {} before login, closing",
                self.id, header.opcode
            );
            return false;
        }

        self.reap_streamer();

        let ctx = Arc::clone(&self.ctx);
        let Some(entry) = ctx.registry.get(header.opcode) else {
            warn!("[Client {}] Unknown opcode {}", self.id, header.opcode);
            return true;
        };

        let min_len = mandatory_len(entry.request);
        if payload.len() < min_len {
            warn!(
                "[Client {}] {}: {}",
                self.id,
                entry.name,
                ProtocolError::Truncated {
                    offset: 0,
                    needed: min_len,
                    available: payload.len(),
                }
            );
            return false;
        }

        trace!(
            "[Client {}] {} #{} ({} bytes)",
            self.id,
            entry.name,
            header.request_id,
            payload.len()
        );
        let mut request = RequestPacket::new(header.request_id, header.opcode, payload);
        let mut response = ResponsePacket::response(header.request_id);
        let result = match entry.handler {
            Handler::Sync(handler) => handler(self, &mut request, &mut response),
            Handler::Async(handler) => handler(self, &mut request, &mut response).await,
        };

        match result {
            Ok(Disposition::Reply) => {
                if !entry.response.conforms(response.payload()) {
                    warn!(
                        "[Client {}] {} reply does not match its declared shape",
                        self.id, entry.name
                    );
                }
                if let Err(e) = self.writer.send(response.finalise()).await {
                    debug!("[Client {}] Write failed: {}", self.id, e);
                    return false;
                }
                true
            }
            Ok(Disposition::Silent) => true,
            Ok(Disposition::Close) => {
                info!("[Client {}] {} closed the connection", self.id, entry.name);
                false
            }
            Err(e) => {
                warn!("[Client {}] {}: {}", self.id, entry.name, e);
                false
            }
        }
    }

    /// Stop every task that writes to the socket, then close it.
    async fn cleanup(&mut self) {
        self.state = SessionState::Closed;
        self.stop_streaming().await;
        self.recording = None;

        if let Some(status) = self.status.take() {
            status.stop().await;
        }

        if self.ctx.scan.owner() == Some(self.id) {
            info!("[Scan] Client {} left, stopping scan", self.id);
            let _ = self.ctx.scan.stop(self.id);
        }
        if let Some(mut task) = self.scan_task.take() {
            if tokio::time::timeout(SCAN_TASK_TIMEOUT, &mut task).await.is_err() {
                task.abort();
            }
        }

        if self.osd_connected {
            self.ctx.osd.disconnect(self.id);
            self.osd_connected = false;
        }

        let _ = self.writer.shutdown().await;
        info!("[Client {}] Session closed ({})", self.id, self.client_name);
    }
}


#[cfg(test)]
mod tests {
    use super::test_util::*;
    use super::*;
    use crate::demuxer::test_util::{table_packets, video_packet};
    use crate::live::input::test_util::MemoryInput;
    use crate::scan::UnsupportedScanner;
    use crate::server::context::test_util::{test_context, test_context_with};
    use tokio::io::AsyncWriteExt;
    use vnsi_protocol::{ResponseKind, ReturnCode, StatusEvent, StreamPacketType, PROTOCOL_VERSION};

    fn code(payload: &[u8]) -> u32 {
        u32::from_be_bytes([payload[0], payload[1], payload[2], payload[3]])
    }

    #[tokio::test]
    async fn test_oversize_payload_closes_silently() {
        let (ctx, _store) = test_context();
        let mut client = connect(ctx, 1);
        client.login(PROTOCOL_VERSION).await;

        let mut head = Vec::new();
        for word in [1u32, 7, Opcode::Ping as u32, 200_001] {
            head.extend_from_slice(&word.to_be_bytes());
        }
        client.stream.write_all(&head).await.unwrap();
        assert!(client.drain().await.is_empty());
        client.session.await.unwrap();
    }

    #[tokio::test]
    async fn test_wrong_channel_closes() {
        let (ctx, _store) = test_context();
        let mut client = connect(ctx, 1);
        let mut head = Vec::new();
        for word in [2u32, 7, Opcode::Login as u32, 0] {
            head.extend_from_slice(&word.to_be_bytes());
        }
        client.stream.write_all(&head).await.unwrap();
        assert!(client.drain().await.is_empty());
    }

    #[tokio::test]
    async fn test_request_before_login_closes() {
        let (ctx, _store) = test_context();
        let mut client = connect(ctx, 1);
        client.send(5, Opcode::Ping, &[]).await;
        assert!(client.drain().await.is_empty());
        client.session.await.unwrap();
    }

    #[tokio::test]
    async fn test_old_client_stays_unauthenticated() {
        let (ctx, _store) = test_context();
        let mut client = connect(ctx, 1);
        let reply = client.login(4).await;
        assert_eq!(code(&reply), PROTOCOL_VERSION);
        client.send(2, Opcode::Ping, &[]).await;
        assert!(client.drain().await.is_empty());
    }

    #[tokio::test]
    async fn test_login_ping_and_relogin() {
        let (ctx, _store) = test_context();
        let mut client = connect(ctx, 1);
        let reply = client.login(PROTOCOL_VERSION).await;
        assert_eq!(code(&reply), PROTOCOL_VERSION);
        assert!(reply[12..].starts_with(b"VDR-Network-Streaming-Interface (VNSI) Server\0"));

        assert_eq!(client.call(2, Opcode::Ping, &[]).await, 1u32.to_be_bytes());
        client.login(9).await;
        assert_eq!(client.call(3, Opcode::Ping, &[]).await, 1u32.to_be_bytes());
    }

    #[tokio::test]
    async fn test_unknown_opcode_keeps_connection() {
        let (ctx, _store) = test_context();
        let mut client = connect(ctx, 1);
        client.login(PROTOCOL_VERSION).await;
        let frame = vnsi_protocol::encode_request(9, 4, &[]);
        client.stream.write_all(&frame).await.unwrap();
        assert_eq!(client.call(10, Opcode::Ping, &[]).await, 1u32.to_be_bytes());
    }

    #[tokio::test]
    async fn test_short_payload_closes() {
        let (ctx, _store) = test_context();
        let mut client = connect(ctx, 1);
        client.login(PROTOCOL_VERSION).await;
        // seek needs an s64
        client.send(4, Opcode::ChannelStreamSeek, &[0, 0, 0, 1]).await;
        assert!(client.drain().await.is_empty());
    }

    #[tokio::test]
    async fn test_payload_timeout_closes() {
        let (ctx, _store) = test_context();
        let mut client = connect(ctx, 1);
        client.login(PROTOCOL_VERSION).await;
        let mut head = Vec::new();
        for word in [1u32, 7, Opcode::GetSetup as u32, 10] {
            head.extend_from_slice(&word.to_be_bytes());
        }
        client.stream.write_all(&head).await.unwrap();
        client.stream.write_all(b"Pmt").await.unwrap();
        assert!(client.drain().await.is_empty());
    }

    #[tokio::test]
    async fn test_unresolvable_live_open() {
        let (ctx, _store) = test_context();
        let mut client = connect(Arc::clone(&ctx), 1);
        client.login(PROTOCOL_VERSION).await;

        let mut payload = 0xDEAD_BEEFu32.to_be_bytes().to_vec();
        payload.extend_from_slice(&0i32.to_be_bytes());
        payload.push(0);
        payload.extend_from_slice(&0u32.to_be_bytes());
        let reply = client.call(2, Opcode::ChannelStreamOpen, &payload).await;
        assert_eq!(code(&reply), ReturnCode::DataInvalid as u32);
        assert_eq!(ctx.sources.tuners().holders(0), 0);

        // no streamer: seek reports an error and serial 0
        let reply = client
            .call(3, Opcode::ChannelStreamSeek, &0i64.to_be_bytes())
            .await;
        assert_eq!(reply, [0, 0, 3, 0xE7, 0, 0, 0, 0]);
    }

    #[tokio::test]
    async fn test_live_stream_then_disconnect_releases_tuner() {
        let mut stream = Vec::new();
        for packet in table_packets(10, 1) {
            stream.extend_from_slice(&packet);
        }
        stream.extend_from_slice(&video_packet(0, 90_000, true));
        let mut input = MemoryInput::default();
        input.streams.insert(1, stream);
        let (ctx, _store) = test_context_with(input, Arc::new(UnsupportedScanner));
        let one = ctx.channels.channel_by_number(1).unwrap();

        let mut client = connect(Arc::clone(&ctx), 1);
        client.login(PROTOCOL_VERSION).await;
        let mut payload = one.uid().to_be_bytes().to_vec();
        payload.extend_from_slice(&0i32.to_be_bytes());
        payload.push(0);
        let reply = client.call(2, Opcode::ChannelStreamOpen, &payload).await;
        assert_eq!(code(&reply), 0);

        let (header, _) = client.read_frame().await;
        assert_eq!(header.kind, ResponseKind::Stream);
        assert_eq!(header.id, StreamPacketType::Change as u32);
        assert_eq!(ctx.sources.tuners().holders(0), 1);

        drop(client.stream);
        client.session.await.unwrap();
        assert_eq!(ctx.sources.tuners().holders(0), 0);
    }

    #[tokio::test]
    async fn test_status_and_replies_never_interleave() {
        let (ctx, store) = test_context();
        let mut client = connect(Arc::clone(&ctx), 1);
        client.login(PROTOCOL_VERSION).await;
        assert_eq!(code(&client.call(2, Opcode::EnableStatusInterface, &[1]).await), 0);
        tokio::time::sleep(Duration::from_millis(20)).await;

        let pusher = tokio::spawn(async move {
            for i in 0..200 {
                let _ = store.events().send(crate::store::StoreEvent::Message(format!("message {}", i)));
                tokio::task::yield_now().await;
            }
        });
        for i in 0..200u32 {
            client.send(100 + i, Opcode::GetTime, &[]).await;
        }
        pusher.await.unwrap();

        let mut replies = 0;
        while replies < 200 {
            let (header, payload) = client.read_frame().await;
            match header.kind {
                ResponseKind::Response => {
                    assert_eq!(header.id, 100 + replies);
                    assert_eq!(payload.len(), 8);
                    replies += 1;
                }
                ResponseKind::Status => {
                    assert_eq!(header.id, StatusEvent::Message as u32);
                    assert!(payload.starts_with(&[0, 0, 0, 0]));
                    assert_eq!(payload.last(), Some(&0));
                }
                other => panic!("unexpected frame kind {:?}", other),
            }
        }
        client.shutdown.cancel();
        client.session.await.unwrap();
    }
}
