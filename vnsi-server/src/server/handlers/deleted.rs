//! Deleted recordings: listing, purge and restore.

use log::{info, warn};
use vnsi_protocol::{FieldWriter, RequestPacket, ResponsePacket, ReturnCode};

use super::recordings::{add_recording_record, RECORDING_RECORD};
use crate::server::registry::{entry, Disposition, Field::*, HandlerEntry, HandlerResult, ResponseShape};
use crate::server::session::ClientSession;
use crate::store::StoreError;

pub fn entries() -> Vec<HandlerEntry> {
    vec![
        entry!(sync RecordingsDeletedSupported, &[], ResponseShape::Fields(&[U32]), supported),
        entry!(sync RecordingsDeletedGetCount, &[], ResponseShape::Fields(&[U32]), get_count),
        entry!(sync RecordingsDeletedGetList, &[], ResponseShape::Records(RECORDING_RECORD), get_list),
        entry!(sync RecordingsDeletedDelete, &[U32], ResponseShape::Fields(&[U32]), delete),
        entry!(sync RecordingsDeletedUndelete, &[U32], ResponseShape::Fields(&[U32]), undelete),
        entry!(sync RecordingsDeletedDeleteAll, &[], ResponseShape::Fields(&[U32]), delete_all),
    ]
}

fn status_of(session: &ClientSession, what: &str, uid: u32, result: Result<(), StoreError>) -> ReturnCode {
    match result {
        Ok(()) => {
            info!("[Client {}] {} recording {:#010x}", session.id(), what, uid);
            ReturnCode::Ok
        }
        Err(e @ StoreError::NotFound(_)) => {
            warn!("[Client {}] {}: {}", session.id(), what, e);
            ReturnCode::DataUnknown
        }
        Err(e) => {
            warn!("[Client {}] {}: {}", session.id(), what, e);
            ReturnCode::Error
        }
    }
}

fn supported(_session: &mut ClientSession, _req: &mut RequestPacket, resp: &mut ResponsePacket) -> HandlerResult {
    resp.add_status(ReturnCode::Ok);
    Ok(Disposition::Reply)
}

fn get_count(session: &mut ClientSession, _req: &mut RequestPacket, resp: &mut ResponsePacket) -> HandlerResult {
    resp.add_u32(session.ctx().recordings.deleted_recordings().len() as u32);
    Ok(Disposition::Reply)
}

fn get_list(session: &mut ClientSession, _req: &mut RequestPacket, resp: &mut ResponsePacket) -> HandlerResult {
    for recording in session.ctx().recordings.deleted_recordings().iter() {
        add_recording_record(resp, recording);
    }
    Ok(Disposition::Reply)
}

fn delete(session: &mut ClientSession, req: &mut RequestPacket, resp: &mut ResponsePacket) -> HandlerResult {
    let uid = req.extract_u32()?;
    let result = session.ctx().recordings.purge_recording(uid);
    resp.add_status(status_of(session, "Purged", uid, result));
    Ok(Disposition::Reply)
}

fn undelete(session: &mut ClientSession, req: &mut RequestPacket, resp: &mut ResponsePacket) -> HandlerResult {
    let uid = req.extract_u32()?;
    let result = session.ctx().recordings.undelete_recording(uid);
    resp.add_status(status_of(session, "Restored", uid, result));
    Ok(Disposition::Reply)
}

fn delete_all(session: &mut ClientSession, _req: &mut RequestPacket, resp: &mut ResponsePacket) -> HandlerResult {
    let code = match session.ctx().recordings.purge_all() {
        Ok(()) => ReturnCode::Ok,
        Err(e) => {
            warn!("[Client {}] Purging deleted recordings failed: {}", session.id(), e);
            ReturnCode::Error
        }
    };
    resp.add_status(code);
    Ok(Disposition::Reply)
}
