//! Channel scan control and scan event forwarding.

use std::sync::Arc;

use futures::future::{BoxFuture, FutureExt};
use log::{debug, info, warn};
use tokio::sync::mpsc;
use vnsi_protocol::{FieldWriter, RequestPacket, ResponsePacket, ReturnCode};

use crate::scan::{ScanCoordinator, ScanEntry, ScanError, ScanEvent, ScanSetup};
use crate::server::registry::{entry, Disposition, Field::*, HandlerEntry, HandlerResult, ResponseShape};
use crate::server::session::ClientSession;
use crate::server::writer::SharedWriter;

pub fn entries() -> Vec<HandlerEntry> {
    vec![
        entry!(sync ScanSupported, &[], ResponseShape::Fields(&[U32]), supported),
        entry!(sync ScanSupportedTypes, &[], ResponseShape::Fields(&[U32]), supported_types),
        entry!(
            sync ScanGetCountries,
            &[],
            ResponseShape::Prefixed(&[U32], &[U32, Str, Str]),
            countries
        ),
        entry!(
            sync ScanGetSatellites,
            &[],
            ResponseShape::Prefixed(&[U32], &[U32, Str, Str]),
            satellites
        ),
        entry!(
            async ScanStart,
            &[U32, U8, U8, U8, U8, U8, U32, U32, U32, U32, U32, U32, U32],
            ResponseShape::Fields(&[U32]),
            start
        ),
        entry!(sync ScanStop, &[], ResponseShape::Fields(&[U32]), stop),
    ]
}

fn scan_code(error: &ScanError) -> ReturnCode {
    match error {
        ScanError::Unsupported | ScanError::Busy => ReturnCode::NotSupported,
        ScanError::Refused(_) => ReturnCode::Error,
    }
}

fn add_entries(session: &ClientSession, resp: &mut ResponsePacket, entries: Vec<ScanEntry>) {
    if !session.ctx().scan.scanner().is_supported() {
        resp.add_status(ReturnCode::NotSupported);
        return;
    }
    resp.add_status(ReturnCode::Ok);
    for entry in entries {
        resp.add_u32(entry.index)
            .add_string(&entry.name)
            .add_string(&entry.long_name);
    }
}

fn read_setup(req: &mut RequestPacket) -> Result<ScanSetup, vnsi_protocol::ProtocolError> {
    Ok(ScanSetup {
        delivery: req.extract_u32()?,
        tv: req.extract_u8()? != 0,
        radio: req.extract_u8()? != 0,
        fta: req.extract_u8()? != 0,
        scrambled: req.extract_u8()? != 0,
        hd: req.extract_u8()? != 0,
        country: req.extract_u32()?,
        dvbc_inversion: req.extract_u32()?,
        dvbc_symbolrate: req.extract_u32()?,
        dvbc_qam: req.extract_u32()?,
        dvbt_inversion: req.extract_u32()?,
        sat_index: req.extract_u32()?,
        atsc_type: req.extract_u32()?,
    })
}

/// Push scan events to the owning connection until the scan ends.
async fn forward_events(
    client: u64,
    coordinator: Arc<ScanCoordinator>,
    writer: SharedWriter,
    mut events: mpsc::UnboundedReceiver<ScanEvent>,
) {
    while let Some(event) = events.recv().await {
        let finished = event == ScanEvent::Finished;
        if finished {
            info!("[Scan] Finished for client {}", client);
            coordinator.release(client);
        }
        if let Err(e) = writer.send(event.to_frame()).await {
            debug!("[Scan] Client {} gone: {}", client, e);
            break;
        }
        if finished {
            break;
        }
    }
}

fn supported(session: &mut ClientSession, _req: &mut RequestPacket, resp: &mut ResponsePacket) -> HandlerResult {
    let scan = &session.ctx().scan;
    let code = if scan.scanner().is_supported() && !scan.is_active() {
        ReturnCode::Ok
    } else {
        ReturnCode::NotSupported
    };
    resp.add_status(code);
    Ok(Disposition::Reply)
}

fn supported_types(session: &mut ClientSession, _req: &mut RequestPacket, resp: &mut ResponsePacket) -> HandlerResult {
    let scanner = session.ctx().scan.scanner();
    let types = if scanner.is_supported() {
        scanner.supported_types()
    } else {
        0
    };
    resp.add_u32(types);
    Ok(Disposition::Reply)
}

fn countries(session: &mut ClientSession, _req: &mut RequestPacket, resp: &mut ResponsePacket) -> HandlerResult {
    let entries = session.ctx().scan.scanner().countries();
    add_entries(session, resp, entries);
    Ok(Disposition::Reply)
}

fn satellites(session: &mut ClientSession, _req: &mut RequestPacket, resp: &mut ResponsePacket) -> HandlerResult {
    let entries = session.ctx().scan.scanner().satellites();
    add_entries(session, resp, entries);
    Ok(Disposition::Reply)
}

fn start<'a>(
    session: &'a mut ClientSession,
    req: &'a mut RequestPacket,
    resp: &'a mut ResponsePacket,
) -> BoxFuture<'a, HandlerResult> {
    async move {
        let setup = read_setup(req)?;
        let coordinator = Arc::clone(&session.ctx().scan);
        let events = match coordinator.start(session.id(), &setup) {
            Ok(events) => events,
            Err(e) => {
                warn!("[Client {}] Scan start refused: {}", session.id(), e);
                resp.add_status(scan_code(&e));
                return Ok(Disposition::Reply);
            }
        };

        // the reply goes out before the first event
        let mut ok = ResponsePacket::response(req.request_id());
        ok.add_status(ReturnCode::Ok);
        if let Err(e) = session.writer().send(ok.finalise()).await {
            debug!("[Client {}] Scan reply failed: {}", session.id(), e);
            coordinator.release(session.id());
            return Ok(Disposition::Close);
        }

        let task = tokio::spawn(forward_events(
            session.id(),
            Arc::clone(&coordinator),
            session.writer().clone(),
            events,
        ));
        session.set_scan_task(task);
        Ok(Disposition::Silent)
    }
    .boxed()
}

fn stop(session: &mut ClientSession, _req: &mut RequestPacket, resp: &mut ResponsePacket) -> HandlerResult {
    let code = match session.ctx().scan.stop(session.id()) {
        Ok(()) => ReturnCode::Ok,
        Err(e) => {
            warn!("[Client {}] Scan stop: {}", session.id(), e);
            scan_code(&e)
        }
    };
    resp.add_status(code);
    Ok(Disposition::Reply)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::live::input::test_util::MemoryInput;
    use crate::scan::test_util::ScriptedScanner;
    use crate::server::context::test_util::{test_context, test_context_with};
    use crate::server::session::test_util::connect;
    use vnsi_protocol::{scan_support, Opcode, ResponseKind, ScanEventKind, PROTOCOL_VERSION};

    fn start_payload() -> Vec<u8> {
        let mut payload = scan_support::DVB_T.to_be_bytes().to_vec();
        payload.extend_from_slice(&[1, 1, 1, 0, 1]);
        for _ in 0..7 {
            payload.extend_from_slice(&0u32.to_be_bytes());
        }
        payload
    }

    #[tokio::test]
    async fn test_unsupported_scanner() {
        let (ctx, _store) = test_context();
        let mut client = connect(ctx, 1);
        client.login(PROTOCOL_VERSION).await;

        let not_supported = (ReturnCode::NotSupported as u32).to_be_bytes();
        assert_eq!(client.call(2, Opcode::ScanSupported, &[]).await, not_supported);
        assert_eq!(client.call(3, Opcode::ScanSupportedTypes, &[]).await, 0u32.to_be_bytes());
        assert_eq!(client.call(4, Opcode::ScanGetCountries, &[]).await, not_supported);
        assert_eq!(client.call(5, Opcode::ScanStart, &start_payload()).await, not_supported);
        assert_eq!(client.call(6, Opcode::ScanStop, &[]).await, not_supported);
    }

    #[tokio::test]
    async fn test_scan_runs_and_releases() {
        let scanner = ScriptedScanner {
            events: vec![
                ScanEvent::Percentage(40),
                ScanEvent::NewChannel {
                    radio: false,
                    encrypted: false,
                    hd: true,
                    name: "Found".to_string(),
                },
                ScanEvent::Finished,
            ],
            ..Default::default()
        };
        let (ctx, _store) = test_context_with(MemoryInput::default(), Arc::new(scanner));
        let mut client = connect(Arc::clone(&ctx), 7);
        client.login(PROTOCOL_VERSION).await;

        assert_eq!(client.call(2, Opcode::ScanSupported, &[]).await, 0u32.to_be_bytes());
        assert_eq!(
            client.call(3, Opcode::ScanSupportedTypes, &[]).await,
            (scan_support::DVB_T | scan_support::DVB_C).to_be_bytes()
        );
        let countries = client.call(4, Opcode::ScanGetCountries, &[]).await;
        assert_eq!(&countries[..8], &[0, 0, 0, 0, 0, 0, 0, 0]);
        assert_eq!(&countries[8..], b"DE\0Germany\0");
        assert_eq!(client.call(5, Opcode::ScanGetSatellites, &[]).await, 0u32.to_be_bytes());

        client.send(6, Opcode::ScanStart, &start_payload()).await;
        let (header, payload) = client.read_frame().await;
        assert_eq!(header.kind, ResponseKind::Response);
        assert_eq!(header.id, 6);
        assert_eq!(payload, 0u32.to_be_bytes());

        let mut kinds = Vec::new();
        for _ in 0..3 {
            let (header, _) = client.read_frame().await;
            assert_eq!(header.kind, ResponseKind::Scan);
            kinds.push(header.id);
        }
        assert_eq!(
            kinds,
            [
                ScanEventKind::Percentage as u32,
                ScanEventKind::NewChannel as u32,
                ScanEventKind::Finished as u32
            ]
        );

        // the forwarder released ownership after FINISHED
        assert_eq!(client.call(7, Opcode::ScanSupported, &[]).await, 0u32.to_be_bytes());
        assert!(!ctx.scan.is_active());
    }

    #[tokio::test]
    async fn test_stop_by_owner_and_refused_start() {
        let (ctx, _store) = test_context_with(MemoryInput::default(), Arc::new(ScriptedScanner::default()));
        let mut client = connect(Arc::clone(&ctx), 1);
        client.login(PROTOCOL_VERSION).await;

        client.send(2, Opcode::ScanStart, &start_payload()).await;
        let (_, payload) = client.read_frame().await;
        assert_eq!(payload, 0u32.to_be_bytes());
        assert_eq!(ctx.scan.owner(), Some(1));

        // a second connection can neither start nor stop it
        let mut other = connect(Arc::clone(&ctx), 2);
        other.login(PROTOCOL_VERSION).await;
        let not_supported = (ReturnCode::NotSupported as u32).to_be_bytes();
        assert_eq!(other.call(2, Opcode::ScanStart, &start_payload()).await, not_supported);
        assert_eq!(other.call(3, Opcode::ScanStop, &[]).await, not_supported);

        assert_eq!(client.call(3, Opcode::ScanStop, &[]).await, 0u32.to_be_bytes());
        assert!(!ctx.scan.is_active());

        let refusing = ScriptedScanner {
            refuse: true,
            ..Default::default()
        };
        let (ctx, _store) = test_context_with(MemoryInput::default(), Arc::new(refusing));
        let mut client = connect(ctx, 1);
        client.login(PROTOCOL_VERSION).await;
        assert_eq!(
            client.call(2, Opcode::ScanStart, &start_payload()).await,
            (ReturnCode::Error as u32).to_be_bytes()
        );
    }
}
