//! Recording catalog: disk usage, listing, rename, delete and cut marks.

use log::{info, warn};
use vnsi_protocol::{FieldWriter, RequestPacket, ResponsePacket, ReturnCode};

use crate::server::registry::{entry, Disposition, Field, Field::*, HandlerEntry, HandlerResult, ResponseShape};
use crate::server::session::ClientSession;
use crate::store::Recording;

pub(super) const RECORDING_RECORD: &[Field] = &[U32, U32, U32, U32, Str, Str, Str, Str, Str, U32];

/// Edit-list entry type for a cut.
const EDL_CUT: i32 = 2;

pub fn entries() -> Vec<HandlerEntry> {
    vec![
        entry!(sync RecordingsDiskSize, &[], ResponseShape::Fields(&[U32, U32, U32]), disk_size),
        entry!(sync RecordingsGetCount, &[], ResponseShape::Fields(&[U32]), get_count),
        entry!(sync RecordingsGetList, &[], ResponseShape::Records(RECORDING_RECORD), get_list),
        entry!(sync RecordingsRename, &[U32, Str], ResponseShape::Fields(&[U32]), rename),
        entry!(sync RecordingsDelete, &[U32], ResponseShape::Fields(&[U32]), delete),
        entry!(sync RecordingsGetEdl, &[U32], ResponseShape::Records(&[U64, U64, S32]), get_edl),
    ]
}

/// Listing record shared with the deleted-recordings list.
pub(super) fn add_recording_record(resp: &mut ResponsePacket, recording: &Recording) {
    resp.add_u32(recording.start)
        .add_u32(recording.duration)
        .add_u32(recording.priority)
        .add_u32(recording.lifetime)
        .add_string(&recording.channel_name)
        .add_string(recording.title())
        .add_string(&recording.subtitle)
        .add_string(&recording.description)
        .add_string(&recording.directory())
        .add_u32(recording.uid);
}

fn disk_size(session: &mut ClientSession, _req: &mut RequestPacket, resp: &mut ResponsePacket) -> HandlerResult {
    let disk = session.ctx().recordings.disk_space();
    resp.add_u32(disk.total_mb)
        .add_u32(disk.free_mb)
        .add_u32(disk.percent_used);
    Ok(Disposition::Reply)
}

fn get_count(session: &mut ClientSession, _req: &mut RequestPacket, resp: &mut ResponsePacket) -> HandlerResult {
    resp.add_u32(session.ctx().recordings.recordings().len() as u32);
    Ok(Disposition::Reply)
}

fn get_list(session: &mut ClientSession, _req: &mut RequestPacket, resp: &mut ResponsePacket) -> HandlerResult {
    for recording in session.ctx().recordings.recordings().iter() {
        add_recording_record(resp, recording);
    }
    Ok(Disposition::Reply)
}

fn rename(session: &mut ClientSession, req: &mut RequestPacket, resp: &mut ResponsePacket) -> HandlerResult {
    let uid = req.extract_u32()?;
    let title = req.extract_string()?;
    let code = match session.ctx().recordings.rename_recording(uid, &title) {
        Ok(()) => ReturnCode::Ok,
        Err(e) => {
            warn!("[Client {}] Rename of recording {:#010x} failed: {}", session.id(), uid, e);
            ReturnCode::DataInvalid
        }
    };
    resp.add_status(code);
    Ok(Disposition::Reply)
}

fn delete(session: &mut ClientSession, req: &mut RequestPacket, resp: &mut ResponsePacket) -> HandlerResult {
    let uid = req.extract_u32()?;
    let code = match session.ctx().recordings.delete_recording(uid) {
        Ok(()) => {
            info!("[Client {}] Deleted recording {:#010x}", session.id(), uid);
            ReturnCode::Ok
        }
        Err(e) => {
            warn!("[Client {}] Delete of recording {:#010x} failed: {}", session.id(), uid, e);
            e.return_code()
        }
    };
    resp.add_status(code);
    Ok(Disposition::Reply)
}

fn get_edl(session: &mut ClientSession, req: &mut RequestPacket, resp: &mut ResponsePacket) -> HandlerResult {
    let uid = req.extract_u32()?;
    if let Some(recording) = session.ctx().recordings.recording_by_uid(uid) {
        for (start, end) in recording.edit_list() {
            resp.add_u64(start).add_u64(end).add_s32(EDL_CUT);
        }
    }
    Ok(Disposition::Reply)
}
