//! Login, time, ping and setup values.

use log::{info, warn};
use vnsi_protocol::{
    FieldWriter, RequestPacket, ResponsePacket, ReturnCode, MIN_PROTOCOL_VERSION,
    PROTOCOL_VERSION, RDS_PROTOCOL_VERSION, SERVER_NAME,
};

use super::{unix_now, utc_offset};
use crate::server::registry::{entry, Disposition, Field::*, HandlerEntry, HandlerResult, ResponseShape};
use crate::server::session::ClientSession;

pub fn entries() -> Vec<HandlerEntry> {
    vec![
        entry!(sync Login, &[U32, U8, Str], ResponseShape::Fields(&[U32, U32, S32, Str, Str]), login),
        entry!(sync GetTime, &[], ResponseShape::Fields(&[U32, S32]), get_time),
        entry!(sync EnableStatusInterface, &[U8], ResponseShape::Fields(&[U32]), enable_status_interface),
        entry!(sync Ping, &[], ResponseShape::Fields(&[U32]), ping),
        entry!(
            sync GetSetup,
            &[Str],
            ResponseShape::OneOf(&[ResponseShape::Fields(&[U32]), ResponseShape::Empty]),
            get_setup
        ),
        entry!(sync StoreSetup, &[Str, U32], ResponseShape::Fields(&[U32]), store_setup),
    ]
}

fn login(session: &mut ClientSession, req: &mut RequestPacket, resp: &mut ResponsePacket) -> HandlerResult {
    if req.payload_len() <= 4 {
        return Ok(Disposition::Close);
    }
    let version = req.extract_u32()?;
    let _capabilities = req.extract_u8()?;
    let name = req.extract_string()?;

    let authenticated = version >= MIN_PROTOCOL_VERSION;
    let rds = version >= RDS_PROTOCOL_VERSION;
    if authenticated {
        info!(
            "[Client {}] Welcome '{}' (protocol {}{})",
            session.id(),
            name,
            version,
            if rds { ", RDS" } else { "" }
        );
    } else {
        warn!(
            "[Client {}] '{}' speaks protocol {}, need at least {}",
            session.id(),
            name,
            version,
            MIN_PROTOCOL_VERSION
        );
    }
    session.login(version, name, authenticated, rds);

    resp.add_u32(PROTOCOL_VERSION)
        .add_u32(unix_now())
        .add_s32(utc_offset())
        .add_string(SERVER_NAME)
        .add_string(env!("CARGO_PKG_VERSION"));
    Ok(Disposition::Reply)
}

fn get_time(_session: &mut ClientSession, _req: &mut RequestPacket, resp: &mut ResponsePacket) -> HandlerResult {
    resp.add_u32(unix_now()).add_s32(utc_offset());
    Ok(Disposition::Reply)
}

fn enable_status_interface(
    session: &mut ClientSession,
    req: &mut RequestPacket,
    resp: &mut ResponsePacket,
) -> HandlerResult {
    let enabled = req.extract_u8()? != 0;
    session.set_status_interface(enabled);
    resp.add_status(ReturnCode::Ok);
    Ok(Disposition::Reply)
}

fn ping(_session: &mut ClientSession, _req: &mut RequestPacket, resp: &mut ResponsePacket) -> HandlerResult {
    resp.add_u32(1);
    Ok(Disposition::Reply)
}

fn get_setup(session: &mut ClientSession, req: &mut RequestPacket, resp: &mut ResponsePacket) -> HandlerResult {
    let name = req.extract_string()?;
    if let Some(value) = session.ctx().setup.get(&name) {
        resp.add_u32(value);
    }
    Ok(Disposition::Reply)
}

fn store_setup(session: &mut ClientSession, req: &mut RequestPacket, resp: &mut ResponsePacket) -> HandlerResult {
    let name = req.extract_string()?;
    let value = req.extract_u32()?;
    let code = match session.ctx().setup.set(&name, value) {
        Ok(_) => ReturnCode::Ok,
        Err(e) => {
            warn!("[Client {}] Storing setup {} failed: {}", session.id(), name, e);
            ReturnCode::Error
        }
    };
    resp.add_status(code);
    Ok(Disposition::Reply)
}

#[cfg(test)]
mod tests {
    use crate::server::context::test_util::test_context;
    use crate::server::session::test_util::connect;
    use vnsi_protocol::{Opcode, PROTOCOL_VERSION};

    #[tokio::test]
    async fn test_setup_roundtrip() {
        let (ctx, _store) = test_context();
        let mut client = connect(ctx, 1);
        client.login(PROTOCOL_VERSION).await;

        assert_eq!(client.call(2, Opcode::GetSetup, b"pmttimeout\0").await, 5u32.to_be_bytes());
        assert!(client.call(3, Opcode::GetSetup, b"Bogus\0").await.is_empty());

        let mut store = b"Timeshift\0".to_vec();
        store.extend_from_slice(&1u32.to_be_bytes());
        assert_eq!(client.call(4, Opcode::StoreSetup, &store).await, 0u32.to_be_bytes());
        assert_eq!(client.call(5, Opcode::GetSetup, b"Timeshift\0").await, 1u32.to_be_bytes());
    }

    #[tokio::test]
    async fn test_short_login_closes() {
        let (ctx, _store) = test_context();
        let mut client = connect(ctx, 1);
        client.send(1, Opcode::Login, &[0, 0, 0, 11]).await;
        assert!(client.drain().await.is_empty());
    }
}
