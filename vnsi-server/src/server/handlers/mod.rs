//! Opcode handlers grouped by protocol area.

mod channels;
mod deleted;
mod epg;
mod general;
mod live;
mod osd;
mod recording;
mod recordings;
mod scan;
mod timers;

use super::registry::HandlerEntry;

/// Every handler entry, one per opcode.
pub fn all() -> Vec<HandlerEntry> {
    let mut entries = Vec::new();
    entries.extend(general::entries());
    entries.extend(live::entries());
    entries.extend(recording::entries());
    entries.extend(channels::entries());
    entries.extend(timers::entries());
    entries.extend(recordings::entries());
    entries.extend(epg::entries());
    entries.extend(scan::entries());
    entries.extend(osd::entries());
    entries.extend(deleted::entries());
    entries
}

/// Seconds since the epoch as a wire `u32`.
fn unix_now() -> u32 {
    chrono::Utc::now().timestamp().max(0) as u32
}

/// Local UTC offset in seconds.
fn utc_offset() -> i32 {
    chrono::Local::now().offset().local_minus_utc()
}
