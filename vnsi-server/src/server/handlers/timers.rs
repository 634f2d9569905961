//! Timer listing and editing.

use chrono::{Local, TimeZone};
use log::{info, warn};
use vnsi_protocol::{FieldWriter, ProtocolError, RequestPacket, ResponsePacket, ReturnCode};

use super::unix_now;
use crate::server::registry::{entry, Disposition, Field, Field::*, HandlerEntry, HandlerResult, ResponseShape};
use crate::server::session::ClientSession;
use crate::store::{StoreError, Timer};

const TIMER_RECORD: &[Field] =
    &[U32, U32, U32, U32, U32, U32, U32, U32, U32, U32, U32, U32, Str];

/// Width of an update that only toggles the active flag.
const TOGGLE_PAYLOAD_LEN: usize = 8;

pub fn entries() -> Vec<HandlerEntry> {
    vec![
        entry!(sync TimerGetCount, &[], ResponseShape::Fields(&[U32]), get_count),
        entry!(
            sync TimerGet,
            &[U32],
            ResponseShape::OneOf(&[
                ResponseShape::Prefixed(&[U32], TIMER_RECORD),
                ResponseShape::Fields(&[U32]),
            ]),
            get
        ),
        entry!(sync TimerGetList, &[], ResponseShape::Prefixed(&[U32], TIMER_RECORD), get_list),
        entry!(
            sync TimerAdd,
            &[U32, U32, U32, U32, U32, U32, U32, U32, Str, Str],
            ResponseShape::Fields(&[U32]),
            add
        ),
        entry!(sync TimerDelete, &[U32, U32], ResponseShape::Fields(&[U32]), delete),
        entry!(sync TimerUpdate, &[U32, U32], ResponseShape::Fields(&[U32]), update),
    ]
}

/// Local midnight of the day containing `time`.
fn local_midnight(time: u32) -> u32 {
    Local
        .timestamp_opt(time as i64, 0)
        .single()
        .and_then(|t| t.date_naive().and_hms_opt(0, 0, 0))
        .and_then(|midnight| Local.from_local_datetime(&midnight).earliest())
        .map_or(time, |midnight| midnight.timestamp().max(0) as u32)
}

fn add_timer_record(session: &ClientSession, resp: &mut ResponsePacket, number: u32, timer: &Timer) {
    let channel_number = session
        .ctx()
        .channels
        .channel_by_uid(timer.channel_uid)
        .map_or(0, |c| c.number);
    resp.add_u32(number)
        .add_u32(timer.active as u32)
        .add_u32(timer.recording as u32)
        .add_u32(timer.pending as u32)
        .add_u32(timer.priority)
        .add_u32(timer.lifetime)
        .add_u32(channel_number)
        .add_u32(timer.channel_uid)
        .add_u32(timer.start)
        .add_u32(timer.stop)
        .add_u32(timer.day)
        .add_u32(timer.weekdays)
        .add_string(&timer.file);
}

/// Read the timer definition following the active flag.
fn read_timer(req: &mut RequestPacket, active: bool, instant_start: bool) -> Result<Timer, ProtocolError> {
    let priority = req.extract_u32()?;
    let lifetime = req.extract_u32()?;
    let channel_uid = req.extract_u32()?;
    let mut start = req.extract_u32()?;
    let stop = req.extract_u32()?;
    let mut day = req.extract_u32()?;
    let weekdays = req.extract_u32()?;
    let file = req.extract_string()?;
    let aux = req.extract_string()?;

    if instant_start && (start == 0 || start == u32::MAX) {
        start = unix_now();
    }
    if day == 0 {
        day = local_midnight(start);
    }
    Ok(Timer {
        active,
        recording: false,
        pending: false,
        priority,
        lifetime,
        channel_uid,
        start,
        stop,
        day,
        weekdays,
        file,
        aux,
    })
}

fn report(session: &ClientSession, what: &str, result: Result<(), StoreError>) -> ReturnCode {
    match result {
        Ok(()) => ReturnCode::Ok,
        Err(e) => {
            warn!("[Client {}] {} failed: {}", session.id(), what, e);
            e.return_code()
        }
    }
}

fn get_count(session: &mut ClientSession, _req: &mut RequestPacket, resp: &mut ResponsePacket) -> HandlerResult {
    resp.add_u32(session.ctx().timers.timers().len() as u32);
    Ok(Disposition::Reply)
}

fn get(session: &mut ClientSession, req: &mut RequestPacket, resp: &mut ResponsePacket) -> HandlerResult {
    let number = req.extract_u32()?;
    let timers = session.ctx().timers.timers();
    match number.checked_sub(1).and_then(|i| timers.get(i as usize)) {
        Some(timer) => {
            resp.add_status(ReturnCode::Ok);
            add_timer_record(session, resp, number, timer);
        }
        None => {
            resp.add_status(ReturnCode::DataUnknown);
        }
    }
    Ok(Disposition::Reply)
}

fn get_list(session: &mut ClientSession, _req: &mut RequestPacket, resp: &mut ResponsePacket) -> HandlerResult {
    let timers = session.ctx().timers.timers();
    resp.add_u32(timers.len() as u32);
    for (index, timer) in timers.iter().enumerate() {
        add_timer_record(session, resp, index as u32 + 1, timer);
    }
    Ok(Disposition::Reply)
}

fn add(session: &mut ClientSession, req: &mut RequestPacket, resp: &mut ResponsePacket) -> HandlerResult {
    let active = req.extract_u32()? != 0;
    let timer = read_timer(req, active, true)?;
    let file = timer.file.clone();
    let code = report(session, "Adding timer", session.ctx().timers.add_timer(timer));
    if code == ReturnCode::Ok {
        info!("[Client {}] Timer '{}' added", session.id(), file);
    }
    resp.add_status(code);
    Ok(Disposition::Reply)
}

fn delete(session: &mut ClientSession, req: &mut RequestPacket, resp: &mut ResponsePacket) -> HandlerResult {
    let number = req.extract_u32()?;
    let force = req.extract_u32()? != 0;
    let code = report(session, "Deleting timer", session.ctx().timers.delete_timer(number, force));
    resp.add_status(code);
    Ok(Disposition::Reply)
}

fn update(session: &mut ClientSession, req: &mut RequestPacket, resp: &mut ResponsePacket) -> HandlerResult {
    let toggle_only = req.payload_len() == TOGGLE_PAYLOAD_LEN;
    let number = req.extract_u32()?;
    let active = req.extract_u32()? != 0;

    let timers = session.ctx().timers.timers();
    let Some(current) = number.checked_sub(1).and_then(|i| timers.get(i as usize)) else {
        warn!("[Client {}] Timer {} not defined", session.id(), number);
        resp.add_status(ReturnCode::DataUnknown);
        return Ok(Disposition::Reply);
    };

    let updated = if toggle_only {
        Timer {
            active,
            ..current.clone()
        }
    } else {
        let edited = read_timer(req, active, false)?;
        Timer {
            recording: current.recording,
            pending: current.pending,
            ..edited
        }
    };
    let code = report(session, "Updating timer", session.ctx().timers.update_timer(number, updated));
    resp.add_status(code);
    Ok(Disposition::Reply)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::server::context::test_util::test_context;
    use crate::server::session::test_util::connect;
    use crate::store::TimerStore;
    use vnsi_protocol::{Opcode, PROTOCOL_VERSION};

    fn code(payload: &[u8]) -> u32 {
        u32::from_be_bytes([payload[0], payload[1], payload[2], payload[3]])
    }

    fn timer_payload(active: u32, channel_uid: u32, start: u32, stop: u32, file: &str) -> Vec<u8> {
        let mut payload = Vec::new();
        for word in [active, 50, 99, channel_uid, start, stop, 0, 0] {
            payload.extend_from_slice(&word.to_be_bytes());
        }
        payload.extend_from_slice(file.as_bytes());
        payload.push(0);
        payload.push(0);
        payload
    }

    #[test]
    fn test_local_midnight_is_same_day() {
        let time = 1_700_000_000;
        let midnight = local_midnight(time);
        assert!(midnight <= time);
        assert!(time - midnight < 25 * 3600);
        assert_eq!(local_midnight(midnight), midnight);
    }

    #[tokio::test]
    async fn test_get_and_list() {
        let (ctx, _store) = test_context();
        let one = ctx.channels.channel_by_number(1).unwrap();
        let mut client = connect(ctx, 1);
        client.login(PROTOCOL_VERSION).await;

        assert_eq!(client.call(2, Opcode::TimerGetCount, &[]).await, 1u32.to_be_bytes());

        let reply = client.call(3, Opcode::TimerGet, &1u32.to_be_bytes()).await;
        assert_eq!(code(&reply), 0);
        assert_eq!(code(&reply[4..]), 1);
        assert_eq!(code(&reply[28..]), 1);
        assert_eq!(code(&reply[32..]), one.uid());
        assert_eq!(code(&reply[36..]), 1_700_000_000);
        assert!(reply.ends_with(b"News\0"));

        let reply = client.call(4, Opcode::TimerGet, &2u32.to_be_bytes()).await;
        assert_eq!(reply, (ReturnCode::DataUnknown as u32).to_be_bytes());
        let reply = client.call(5, Opcode::TimerGet, &0u32.to_be_bytes()).await;
        assert_eq!(reply, (ReturnCode::DataUnknown as u32).to_be_bytes());

        let list = client.call(6, Opcode::TimerGetList, &[]).await;
        assert_eq!(code(&list), 1);
        assert_eq!(&list[4..], &client.call(7, Opcode::TimerGet, &1u32.to_be_bytes()).await[4..]);
    }

    #[tokio::test]
    async fn test_add_validates_and_rejects_duplicates() {
        let (ctx, store) = test_context();
        let two = ctx.channels.channel_by_number(2).unwrap();
        let mut client = connect(ctx, 1);
        client.login(PROTOCOL_VERSION).await;

        let payload = timer_payload(1, two.uid(), 1_800_000_000, 1_800_003_600, "Show");
        assert_eq!(code(&client.call(2, Opcode::TimerAdd, &payload).await), 0);
        assert_eq!(
            code(&client.call(3, Opcode::TimerAdd, &payload).await),
            ReturnCode::DataLocked as u32
        );

        let unknown = timer_payload(1, 0xDEAD, 1_800_000_000, 1_800_003_600, "Show");
        assert_eq!(
            code(&client.call(4, Opcode::TimerAdd, &unknown).await),
            ReturnCode::DataInvalid as u32
        );
        let nameless = timer_payload(1, two.uid(), 1_900_000_000, 1_900_003_600, "");
        assert_eq!(
            code(&client.call(5, Opcode::TimerAdd, &nameless).await),
            ReturnCode::DataInvalid as u32
        );

        let timers = store.timers();
        assert_eq!(timers.len(), 2);
        assert_eq!(timers[1].day, local_midnight(1_800_000_000));
    }

    #[tokio::test]
    async fn test_instant_timer_starts_now() {
        let (ctx, store) = test_context();
        let two = ctx.channels.channel_by_number(2).unwrap();
        let mut client = connect(ctx, 1);
        client.login(PROTOCOL_VERSION).await;

        let before = unix_now();
        let payload = timer_payload(1, two.uid(), u32::MAX, u32::MAX, "Now");
        assert_eq!(code(&client.call(2, Opcode::TimerAdd, &payload).await), 0);
        let timers = store.timers();
        assert!(timers[1].start >= before);
        assert!(timers[1].start <= unix_now());
    }

    #[tokio::test]
    async fn test_delete_codes() {
        let (ctx, store) = test_context();
        let mut catalog = crate::store::sample_catalog();
        catalog.timers[0].recording = true;
        store.reload(catalog);

        let mut client = connect(ctx, 1);
        client.login(PROTOCOL_VERSION).await;

        let request = |number: u32, force: u32| {
            let mut payload = number.to_be_bytes().to_vec();
            payload.extend_from_slice(&force.to_be_bytes());
            payload
        };
        assert_eq!(
            code(&client.call(2, Opcode::TimerDelete, &request(5, 0)).await),
            ReturnCode::DataInvalid as u32
        );
        assert_eq!(
            code(&client.call(3, Opcode::TimerDelete, &request(1, 0)).await),
            ReturnCode::RecordingRunning as u32
        );
        assert_eq!(code(&client.call(4, Opcode::TimerDelete, &request(1, 1)).await), 0);
        assert!(store.timers().is_empty());
    }

    #[tokio::test]
    async fn test_update_toggle_and_full() {
        let (ctx, store) = test_context();
        let one = ctx.channels.channel_by_number(1).unwrap();
        let mut client = connect(ctx, 1);
        client.login(PROTOCOL_VERSION).await;

        let mut toggle = 1u32.to_be_bytes().to_vec();
        toggle.extend_from_slice(&0u32.to_be_bytes());
        assert_eq!(code(&client.call(2, Opcode::TimerUpdate, &toggle).await), 0);
        assert!(!store.timers()[0].active);
        assert_eq!(store.timers()[0].file, "News");

        let mut full = 1u32.to_be_bytes().to_vec();
        full.extend_from_slice(&timer_payload(1, one.uid(), 1_700_000_000, 1_700_007_200, "Late News"));
        assert_eq!(code(&client.call(3, Opcode::TimerUpdate, &full).await), 0);
        let timer = store.timers()[0].clone();
        assert!(timer.active);
        assert_eq!(timer.stop, 1_700_007_200);
        assert_eq!(timer.file, "Late News");

        let mut unknown = 9u32.to_be_bytes().to_vec();
        unknown.extend_from_slice(&1u32.to_be_bytes());
        assert_eq!(
            code(&client.call(4, Opcode::TimerUpdate, &unknown).await),
            ReturnCode::DataUnknown as u32
        );

        let mut invalid = 1u32.to_be_bytes().to_vec();
        invalid.extend_from_slice(&timer_payload(1, 0xDEAD, 1_700_000_000, 1_700_007_200, "x"));
        assert_eq!(
            code(&client.call(5, Opcode::TimerUpdate, &invalid).await),
            ReturnCode::DataInvalid as u32
        );
    }
}
