//! Live stream open, close and seek.

use std::sync::Arc;
use std::time::Duration;

use futures::future::{BoxFuture, FutureExt};
use log::{info, warn};
use vnsi_protocol::{FieldWriter, RequestPacket, ResponsePacket, ReturnCode};

use crate::live::{LiveStreamer, StreamError, StreamerConfig};
use crate::server::registry::{entry, Disposition, Field::*, HandlerEntry, HandlerResult, ResponseShape};
use crate::server::session::ClientSession;
use crate::store::{setup_names, timeshift_mode, Channel};

/// Timeshift capacity per `TimeshiftBufferSize` unit.
const TIMESHIFT_UNIT_BYTES: usize = 100 * 1024 * 1024;

pub fn entries() -> Vec<HandlerEntry> {
    vec![
        // the streamer writes the OK status itself; refusals go through the dispatcher
        entry!(async ChannelStreamOpen, &[U32, S32, U8, Optional, U32], ResponseShape::Fields(&[U32]), open),
        entry!(async ChannelStreamClose, &[], ResponseShape::NoReply, close),
        entry!(async ChannelStreamSeek, &[S64], ResponseShape::Fields(&[U32, U32]), seek),
    ]
}

fn resolve(session: &ClientSession, uid: u32) -> Option<Channel> {
    let channels = &session.ctx().channels;
    channels
        .channel_by_uid(uid)
        .or_else(|| channels.channel_by_number(uid))
}

/// Buffer capacity for a session asking for timeshift.
fn timeshift_bytes(session: &ClientSession, requested: bool) -> Option<usize> {
    if !requested {
        return None;
    }
    let setup = &session.ctx().setup;
    match setup.get(setup_names::TIMESHIFT).unwrap_or(timeshift_mode::OFF) {
        timeshift_mode::OFF => None,
        mode => {
            if mode == timeshift_mode::FILE {
                info!("[Client {}] File timeshift unavailable, using RAM", session.id());
            }
            let units = setup.get(setup_names::TIMESHIFT_BUFFER_SIZE).unwrap_or(1).max(1);
            Some(units as usize * TIMESHIFT_UNIT_BYTES)
        }
    }
}

fn open<'a>(
    session: &'a mut ClientSession,
    req: &'a mut RequestPacket,
    resp: &'a mut ResponsePacket,
) -> BoxFuture<'a, HandlerResult> {
    async move {
        let uid = req.extract_u32()?;
        let priority = req.extract_s32()?;
        let timeshift = req.extract_u8()? != 0;
        let timeout_secs = if req.end() { 0 } else { req.extract_u32()? };

        session.stop_streaming().await;

        let result = match resolve(session, uid) {
            None => Err(StreamError::UnknownChannel(uid)),
            Some(_) if session.ctx().scan.is_active() => Err(StreamError::ScanActive),
            Some(channel) => {
                let timeshift_bytes = timeshift_bytes(session, timeshift);
                session
                    .ctx()
                    .sources
                    .bind(&channel, priority, timeshift_bytes)
                    .map(|binding| (binding, timeshift_bytes))
            }
        };
        let (binding, timeshift_bytes) = match result {
            Ok(bound) => bound,
            Err(e) => {
                warn!("[Client {}] Live open of {:#010x} failed: {}", session.id(), uid, e);
                resp.add_status(e.return_code());
                return Ok(Disposition::Reply);
            }
        };

        let ctx = Arc::clone(session.ctx());
        let pmt_timeout = ctx.setup.get(setup_names::PMT_TIMEOUT).unwrap_or(5);
        let signal_timeout = if timeout_secs == 0 {
            ctx.settings.stream_timeout
        } else {
            Duration::from_secs(timeout_secs as u64)
        };
        let config = StreamerConfig {
            allow_rds: session.rds_enabled(),
            pmt_timeout_ms: pmt_timeout as i64 * 1000,
            signal_timeout,
            priority,
            timeshift_bytes,
        };

        match LiveStreamer::start(
            session.id(),
            req.request_id(),
            binding,
            Arc::clone(&ctx.sources),
            config,
            session.writer().clone(),
        )
        .await
        {
            Ok(streamer) => {
                session.set_streamer(streamer);
                Ok(Disposition::Silent)
            }
            Err(e) => {
                warn!("[Client {}] Live open reply failed: {}", session.id(), e);
                Ok(Disposition::Close)
            }
        }
    }
    .boxed()
}

fn close<'a>(
    session: &'a mut ClientSession,
    _req: &'a mut RequestPacket,
    _resp: &'a mut ResponsePacket,
) -> BoxFuture<'a, HandlerResult> {
    async move {
        if session.is_streaming() {
            info!("[Client {}] Live stream closed", session.id());
        }
        session.stop_streaming().await;
        Ok(Disposition::Silent)
    }
    .boxed()
}

fn seek<'a>(
    session: &'a mut ClientSession,
    req: &'a mut RequestPacket,
    resp: &'a mut ResponsePacket,
) -> BoxFuture<'a, HandlerResult> {
    async move {
        let time_ms = req.extract_s64()?;
        let serial = match session.streamer() {
            Some(streamer) => streamer.seek(time_ms).await,
            None => None,
        };
        match serial {
            Some(serial) => resp.add_status(ReturnCode::Ok).add_u32(serial),
            None => resp.add_status(ReturnCode::Error).add_u32(0),
        };
        Ok(Disposition::Reply)
    }
    .boxed()
}
