//! Remote OSD access.

use log::info;
use vnsi_protocol::{FieldWriter, RequestPacket, ResponsePacket};

use crate::server::registry::{entry, Disposition, Field::*, HandlerEntry, HandlerResult, ResponseShape};
use crate::server::session::ClientSession;

pub fn entries() -> Vec<HandlerEntry> {
    vec![
        entry!(sync OsdConnect, &[], ResponseShape::Fields(&[U32, U32]), connect),
        entry!(sync OsdDisconnect, &[], ResponseShape::NoReply, disconnect),
        entry!(sync OsdHitKey, &[U32], ResponseShape::NoReply, hit_key),
    ]
}

fn connect(session: &mut ClientSession, _req: &mut RequestPacket, resp: &mut ResponsePacket) -> HandlerResult {
    let (width, height) = session.ctx().osd.connect(session.id());
    session.set_osd_connected(true);
    info!("[Client {}] OSD connected ({}x{})", session.id(), width, height);
    resp.add_u32(width).add_u32(height);
    Ok(Disposition::Reply)
}

fn disconnect(session: &mut ClientSession, _req: &mut RequestPacket, _resp: &mut ResponsePacket) -> HandlerResult {
    if session.osd_connected() {
        session.ctx().osd.disconnect(session.id());
        session.set_osd_connected(false);
        info!("[Client {}] OSD disconnected", session.id());
    }
    Ok(Disposition::Silent)
}

fn hit_key(session: &mut ClientSession, req: &mut RequestPacket, _resp: &mut ResponsePacket) -> HandlerResult {
    let key = req.extract_u32()?;
    if session.osd_connected() {
        session.ctx().osd.hit_key(session.id(), key);
    }
    Ok(Disposition::Silent)
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use crate::live::input::test_util::MemoryInput;
    use crate::live::TunerPool;
    use crate::osd::HeadlessOsd;
    use crate::scan::{ScanCoordinator, UnsupportedScanner};
    use crate::server::context::{ServerContext, SessionSettings};
    use crate::server::session::test_util::connect;
    use crate::live::LiveSources;
    use crate::store::{sample_store, SetupStore};
    use vnsi_protocol::{Opcode, PROTOCOL_VERSION};

    #[tokio::test]
    async fn test_keys_forwarded_while_connected() {
        let (store, _events) = sample_store();
        let osd = Arc::new(HeadlessOsd::new(1280, 720));
        let sources = Arc::new(LiveSources::new(
            TunerPool::new(1),
            Arc::new(MemoryInput::default()),
            188 * 64,
        ));
        let ctx = ServerContext::new(
            store,
            Arc::new(SetupStore::in_memory()),
            sources,
            ScanCoordinator::new(Arc::new(UnsupportedScanner)),
            osd.clone(),
            SessionSettings::default(),
        )
        .unwrap();

        let mut client = connect(ctx, 3);
        client.login(PROTOCOL_VERSION).await;

        // ignored before connecting
        client.send(2, Opcode::OsdHitKey, &5u32.to_be_bytes()).await;
        let mut size = 1280u32.to_be_bytes().to_vec();
        size.extend_from_slice(&720u32.to_be_bytes());
        assert_eq!(client.call(3, Opcode::OsdConnect, &[]).await, size);
        assert_eq!(osd.connected(), 1);

        client.send(4, Opcode::OsdHitKey, &6u32.to_be_bytes()).await;
        client.send(5, Opcode::OsdDisconnect, &[]).await;
        client.send(6, Opcode::OsdHitKey, &7u32.to_be_bytes()).await;
        // replies are ordered, so the ping proves the earlier requests ran
        assert_eq!(client.call(7, Opcode::Ping, &[]).await, 1u32.to_be_bytes());

        assert_eq!(osd.keys(), vec![(3, 6)]);
        assert_eq!(osd.connected(), 0);
    }
}
