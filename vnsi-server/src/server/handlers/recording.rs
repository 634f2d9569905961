//! Recording playback: open, block reads and frame lookups.

use log::{info, warn};
use vnsi_protocol::{FieldWriter, RequestPacket, ResponsePacket, ReturnCode};

use crate::recording::{RecordingReader, MAX_BLOCK_SIZE};
use crate::server::registry::{entry, Disposition, Field::*, HandlerEntry, HandlerResult, ResponseShape};
use crate::server::session::ClientSession;

pub fn entries() -> Vec<HandlerEntry> {
    vec![
        entry!(
            sync RecStreamOpen,
            &[U32],
            ResponseShape::OneOf(&[ResponseShape::Fields(&[U32, U32, U64, U8]), ResponseShape::Fields(&[U32])]),
            open
        ),
        entry!(sync RecStreamClose, &[], ResponseShape::Fields(&[U32]), close),
        entry!(sync RecStreamGetBlock, &[U64, U32], ResponseShape::Raw, get_block),
        entry!(sync RecStreamPositionFromFrame, &[U32], ResponseShape::Fields(&[U64]), position_from_frame),
        entry!(sync RecStreamFrameFromPosition, &[U64], ResponseShape::Fields(&[U32]), frame_from_position),
        entry!(
            sync RecStreamGetIFrame,
            &[U32, U32],
            ResponseShape::OneOf(&[ResponseShape::Fields(&[U64, U32, U32]), ResponseShape::Fields(&[U32])]),
            get_iframe
        ),
        entry!(sync RecStreamGetLength, &[], ResponseShape::Fields(&[U64]), get_length),
    ]
}

fn open(session: &mut ClientSession, req: &mut RequestPacket, resp: &mut ResponsePacket) -> HandlerResult {
    let uid = req.extract_u32()?;

    let reader = if session.has_recording() {
        warn!("[Recording] Client {} already plays a recording", session.id());
        None
    } else {
        session.ctx().recordings.recording_by_uid(uid).and_then(|recording| {
            match RecordingReader::open(&recording.path) {
                Ok(reader) => {
                    info!("[Recording] Client {} plays '{}'", session.id(), recording.name);
                    Some(reader)
                }
                Err(e) => {
                    warn!("[Recording] Cannot open '{}': {}", recording.name, e);
                    None
                }
            }
        })
    };

    match reader {
        Some(reader) => {
            resp.add_status(ReturnCode::Ok)
                .add_u32(reader.frame_count())
                .add_u64(reader.total_len())
                .add_u8(reader.is_pes() as u8);
            session.set_recording(Some(reader));
        }
        None => {
            resp.add_status(ReturnCode::DataUnknown);
        }
    }
    Ok(Disposition::Reply)
}

fn close(session: &mut ClientSession, _req: &mut RequestPacket, resp: &mut ResponsePacket) -> HandlerResult {
    session.set_recording(None);
    resp.add_status(ReturnCode::Ok);
    Ok(Disposition::Reply)
}

fn get_block(session: &mut ClientSession, req: &mut RequestPacket, resp: &mut ResponsePacket) -> HandlerResult {
    if session.is_streaming() {
        warn!("[Recording] Client {} requested a block while live streaming", session.id());
        return Ok(Disposition::Close);
    }
    let position = req.extract_u64()?;
    let amount = (req.extract_u32()? as usize).min(MAX_BLOCK_SIZE);
    let Some(reader) = session.recording() else {
        warn!("[Recording] Block request without an open recording");
        return Ok(Disposition::Close);
    };

    let read = reader.get_block(position, resp.reserve(amount));
    if read == 0 {
        resp.unreserve(amount);
        resp.add_u32(0);
    } else {
        resp.unreserve(amount - read);
    }
    Ok(Disposition::Reply)
}

fn position_from_frame(session: &mut ClientSession, req: &mut RequestPacket, resp: &mut ResponsePacket) -> HandlerResult {
    let frame = req.extract_u32()?;
    let position = session.recording().map_or(0, |r| r.position_from_frame(frame));
    resp.add_u64(position);
    Ok(Disposition::Reply)
}

fn frame_from_position(session: &mut ClientSession, req: &mut RequestPacket, resp: &mut ResponsePacket) -> HandlerResult {
    let position = req.extract_u64()?;
    let frame = session.recording().map_or(0, |r| r.frame_from_position(position));
    resp.add_u32(frame);
    Ok(Disposition::Reply)
}

fn get_iframe(session: &mut ClientSession, req: &mut RequestPacket, resp: &mut ResponsePacket) -> HandlerResult {
    let frame = req.extract_u32()?;
    let forward = req.extract_u32()? == 1;
    match session.recording().and_then(|r| r.next_iframe(frame, forward)) {
        Some(iframe) => {
            resp.add_u64(iframe.position)
                .add_u32(iframe.frame)
                .add_u32(iframe.length);
        }
        None => {
            resp.add_u32(0);
        }
    }
    Ok(Disposition::Reply)
}

fn get_length(session: &mut ClientSession, _req: &mut RequestPacket, resp: &mut ResponsePacket) -> HandlerResult {
    let length = match session.recording() {
        Some(reader) => {
            reader.rescan();
            reader.total_len()
        }
        None => 0,
    };
    resp.add_u64(length);
    Ok(Disposition::Reply)
}
