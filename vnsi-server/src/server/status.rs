//! Per-connection forwarding of collaborator change events.

use std::collections::HashMap;
use std::io;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use log::{debug, info, warn};
use parking_lot::Mutex;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use vnsi_protocol::{FieldWriter, ResponsePacket, StatusEvent};

use super::context::ServerContext;
use super::writer::SharedWriter;
use crate::live::LiveHandle;
use crate::store::StoreEvent;

/// Unanswered EPG notifications sent per channel before giving up.
const MAX_EPG_ATTEMPTS: u8 = 3;

const EPG_CHECK_INTERVAL: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EpgUpdate {
    /// Start of the newest event the client fetched.
    pub last_event: u32,
    pub attempts: u8,
}

/// Channels whose guide this connection follows, keyed by uid.
pub type EpgUpdates = Arc<Mutex<HashMap<u32, EpgUpdate>>>;

/// Control handle of the connection's live stream, if any.
pub type LiveSlot = Arc<Mutex<Option<LiveHandle>>>;

pub struct StatusForwarder {
    cancel: CancellationToken,
    task: Option<JoinHandle<()>>,
}

impl StatusForwarder {
    pub fn spawn(
        client_id: u64,
        ctx: Arc<ServerContext>,
        writer: SharedWriter,
        epg: EpgUpdates,
        live: LiveSlot,
    ) -> Self {
        let cancel = CancellationToken::new();
        let forwarder = Forwarder {
            client_id,
            ctx,
            writer,
            epg,
            live,
        };
        let task = tokio::spawn(forwarder.run(cancel.clone()));
        Self {
            cancel,
            task: Some(task),
        }
    }

    /// Cancel the task and wait for its last write to finish.
    pub async fn stop(mut self) {
        self.cancel.cancel();
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
    }
}

impl Drop for StatusForwarder {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

fn status_frame(event: StatusEvent) -> Bytes {
    ResponsePacket::status(event).finalise()
}

/// Channels that need an EPGCHANGE push now; bumps their attempt counters.
pub fn due_epg_updates(ctx: &ServerContext, epg: &EpgUpdates) -> Vec<u32> {
    let mut due = Vec::new();
    for (uid, last_start) in ctx.epg.last_events() {
        let Some(channel) = ctx.channels.channel_by_uid(uid) else {
            continue;
        };
        if !ctx.setup.passes_filter(&channel) {
            continue;
        }
        let mut updates = epg.lock();
        let Some(entry) = updates.get_mut(&uid) else {
            continue;
        };
        if entry.last_event >= last_start || entry.attempts >= MAX_EPG_ATTEMPTS {
            continue;
        }
        entry.attempts += 1;
        due.push(uid);
    }
    due
}

struct Forwarder {
    client_id: u64,
    ctx: Arc<ServerContext>,
    writer: SharedWriter,
    epg: EpgUpdates,
    live: LiveSlot,
}

impl Forwarder {
    async fn run(self, cancel: CancellationToken) {
        let mut events = self.ctx.events.subscribe();
        let mut epg_tick = tokio::time::interval(EPG_CHECK_INTERVAL);
        debug!("[Client {}] Status interface enabled", self.client_id);

        loop {
            let result = tokio::select! {
                _ = cancel.cancelled() => break,
                _ = epg_tick.tick() => self.push_epg_updates().await,
                event = events.recv() => match event {
                    Ok(event) => self.forward(event).await,
                    Err(RecvError::Lagged(count)) => {
                        warn!("[Client {}] Status events lagged, skipped {}", self.client_id, count);
                        Ok(())
                    }
                    Err(RecvError::Closed) => break,
                },
            };
            if let Err(e) = result {
                debug!("[Client {}] Status push failed: {}", self.client_id, e);
                break;
            }
        }
        debug!("[Client {}] Status interface stopped", self.client_id);
    }

    async fn push_epg_updates(&self) -> io::Result<()> {
        for uid in due_epg_updates(&self.ctx, &self.epg) {
            info!("[Client {}] Trigger EPG update for channel {:#010x}", self.client_id, uid);
            let mut resp = ResponsePacket::status(StatusEvent::EpgChange);
            resp.add_u32(uid);
            self.writer.send(resp.finalise()).await?;
        }
        Ok(())
    }

    async fn forward(&self, event: StoreEvent) -> io::Result<()> {
        match event {
            StoreEvent::TimersChanged => self.writer.send(status_frame(StatusEvent::TimerChange)).await,
            StoreEvent::ChannelsChanged => self.writer.send(status_frame(StatusEvent::ChannelChange)).await,
            StoreEvent::ChannelModified(uid) => {
                self.retune_if_streaming(uid).await;
                Ok(())
            }
            StoreEvent::RecordingsChanged => {
                self.writer.send(status_frame(StatusEvent::RecordingsChange)).await
            }
            StoreEvent::EpgChanged => self.push_epg_updates().await,
            StoreEvent::Recording {
                device,
                on,
                name,
                file,
            } => {
                let mut resp = ResponsePacket::status(StatusEvent::Recording);
                resp.add_u32(device)
                    .add_u32(on as u32)
                    .add_string(&name)
                    .add_string(&file);
                self.writer.send(resp.finalise()).await
            }
            StoreEvent::Message(text) => {
                let mut resp = ResponsePacket::status(StatusEvent::Message);
                resp.add_u32(0).add_string(&text);
                self.writer.send(resp.finalise()).await
            }
        }
    }

    async fn retune_if_streaming(&self, uid: u32) {
        let handle = self.live.lock().clone();
        let Some(handle) = handle.filter(|h| h.channel_uid() == uid) else {
            return;
        };
        let Some(channel) = self.ctx.channels.channel_by_uid(uid) else {
            return;
        };
        info!(
            "[Client {}] Channel {} '{}' changed, retuning",
            self.client_id, channel.number, channel.name
        );
        if let Err(e) = handle.retune(channel).await {
            warn!("[Client {}] Retune failed: {}", self.client_id, e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::server::context::test_util::test_context;
    use tokio::io::AsyncReadExt;
    use vnsi_protocol::{decode_response_header, ResponseKind};

    fn follow(epg: &EpgUpdates, uid: u32) {
        epg.lock().insert(uid, EpgUpdate::default());
    }

    #[test]
    fn test_epg_updates_capped() {
        let (ctx, _store) = test_context();
        let one = ctx.channels.channel_by_number(1).unwrap().uid();
        let epg: EpgUpdates = Arc::default();

        // not followed yet
        assert!(due_epg_updates(&ctx, &epg).is_empty());

        follow(&epg, one);
        for _ in 0..MAX_EPG_ATTEMPTS {
            assert_eq!(due_epg_updates(&ctx, &epg), vec![one]);
        }
        assert!(due_epg_updates(&ctx, &epg).is_empty());

        // fetched up to the newest event
        epg.lock().insert(
            one,
            EpgUpdate {
                last_event: 2_000_003_600,
                attempts: 0,
            },
        );
        assert!(due_epg_updates(&ctx, &epg).is_empty());
    }

    #[test]
    fn test_epg_updates_respect_filter() {
        let (ctx, _store) = test_context();
        let one = ctx.channels.channel_by_number(1).unwrap().uid();
        let epg: EpgUpdates = Arc::default();
        follow(&epg, one);
        ctx.setup
            .update_filter(|f| f.set_blacklist(false, vec![one]))
            .unwrap();
        assert!(due_epg_updates(&ctx, &epg).is_empty());
    }

    #[tokio::test]
    async fn test_forwards_store_events() {
        let (ctx, _store) = test_context();
        let (mut client, server) = tokio::io::duplex(4096);
        let forwarder = StatusForwarder::spawn(
            1,
            Arc::clone(&ctx),
            SharedWriter::new(server),
            Arc::default(),
            Arc::default(),
        );
        // let the task subscribe
        tokio::time::sleep(Duration::from_millis(20)).await;

        ctx.events.send(StoreEvent::TimersChanged).unwrap();
        ctx.events.send(StoreEvent::Message("hello".to_string())).unwrap();

        let mut frame = [0u8; 12];
        client.read_exact(&mut frame).await.unwrap();
        let header = decode_response_header(&frame).unwrap().unwrap();
        assert_eq!(header.kind, ResponseKind::Status);
        assert_eq!(header.id, StatusEvent::TimerChange as u32);
        assert_eq!(header.payload_len, 0);

        let mut frame = [0u8; 12 + 10];
        client.read_exact(&mut frame).await.unwrap();
        let header = decode_response_header(&frame).unwrap().unwrap();
        assert_eq!(header.id, StatusEvent::Message as u32);
        assert_eq!(&frame[12..], b"\0\0\0\0hello\0");

        tokio::time::timeout(Duration::from_secs(1), forwarder.stop())
            .await
            .unwrap();
        // nothing writes after stop
        ctx.events.send(StoreEvent::TimersChanged).ok();
        let mut rest = [0u8; 1];
        let read = tokio::time::timeout(Duration::from_millis(50), client.read(&mut rest)).await;
        assert!(!matches!(read, Ok(Ok(n)) if n > 0));
    }
}
