//! Programme guide for one channel.

use log::debug;
use vnsi_protocol::{FieldWriter, RequestPacket, ResponsePacket};

use super::unix_now;
use crate::server::registry::{entry, Disposition, Field::*, HandlerEntry, HandlerResult, ResponseShape};
use crate::server::session::ClientSession;
use crate::store::EpgEvent;

pub fn entries() -> Vec<HandlerEntry> {
    vec![entry!(
        sync EpgGetForChannel,
        &[U32, U32, U32],
        ResponseShape::OneOf(&[
            ResponseShape::Records(&[U32, U32, U32, U32, U32, Str, Str, Str]),
            ResponseShape::Fields(&[U32]),
        ]),
        get_for_channel
    )]
}

/// Whether an event overlaps `[start, start + duration)`; a zero duration is unbounded.
fn in_window(event: &EpgEvent, now: u32, start: u32, duration: u32) -> bool {
    let end = event.end();
    end >= now && end > start && (duration == 0 || event.start < start.saturating_add(duration))
}

fn get_for_channel(session: &mut ClientSession, req: &mut RequestPacket, resp: &mut ResponsePacket) -> HandlerResult {
    let uid = req.extract_u32()?;
    let start = req.extract_u32()?;
    let duration = req.extract_u32()?;

    let schedule = match session.ctx().channels.channel_by_uid(uid) {
        Some(_) => session.ctx().epg.schedule(uid),
        None => {
            debug!("[Client {}] Guide requested for unknown channel {:#010x}", session.id(), uid);
            None
        }
    };
    let Some(events) = schedule else {
        resp.add_u32(0);
        return Ok(Disposition::Reply);
    };

    let now = unix_now();
    let mut written = 0;
    for event in events.iter().filter(|e| in_window(e, now, start, duration)) {
        resp.add_u32(event.id)
            .add_u32(event.start)
            .add_u32(event.duration)
            .add_u32(event.content)
            .add_u32(event.rating)
            .add_string(&event.title)
            .add_string(&event.subtitle)
            .add_string(&event.description);
        written += 1;
    }
    if written == 0 {
        resp.add_u32(0);
    }

    if let Some(last) = events.last() {
        session.epg_fetched(uid, last.start);
    }
    debug!("[Client {}] Sent {} guide events for {:#010x}", session.id(), written, uid);
    Ok(Disposition::Reply)
}
