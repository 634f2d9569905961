//! Channel listing, channel groups and the provider/channel filter.

use std::collections::BTreeSet;

use log::{debug, warn};
use vnsi_protocol::{FieldWriter, RequestPacket, ResponsePacket, PICON_PROTOCOL_VERSION};

use crate::server::registry::{entry, Disposition, Field::*, HandlerEntry, HandlerResult, ResponseShape};
use crate::server::session::ClientSession;
use crate::store::{Channel, ProviderEntry};

pub fn entries() -> Vec<HandlerEntry> {
    vec![
        entry!(sync ChannelsGetCount, &[], ResponseShape::Fields(&[U32]), get_count),
        entry!(
            sync ChannelsGetChannels,
            &[U32, U8],
            ResponseShape::OneOf(&[
                ResponseShape::Records(&[U32, Str, Str, U32, U32, Str, Str]),
                ResponseShape::Records(&[U32, Str, Str, U32, U32, Str]),
            ]),
            get_channels
        ),
        entry!(sync ChannelGroupGetCount, &[U32], ResponseShape::Fields(&[U32]), group_count),
        entry!(sync ChannelGroupList, &[U8], ResponseShape::Records(&[Str, U8]), group_list),
        entry!(sync ChannelGroupMembers, &[Str, U8, U8], ResponseShape::Records(&[U32, U32]), group_members),
        entry!(sync ChannelsGetCaids, &[U32], ResponseShape::Records(&[U32]), get_caids),
        entry!(sync ChannelsGetWhitelist, &[U8], ResponseShape::Records(&[Str, U32]), get_whitelist),
        entry!(sync ChannelsGetBlacklist, &[U8], ResponseShape::Records(&[U32]), get_blacklist),
        entry!(sync ChannelsSetWhitelist, &[U8], ResponseShape::Empty, set_whitelist),
        entry!(sync ChannelsSetBlacklist, &[U8], ResponseShape::Empty, set_blacklist),
    ]
}

/// Whether a channel appears in listings of the given kind.
fn listed(session: &ClientSession, channel: &Channel, radio: bool, filter: bool) -> bool {
    channel.sid != 0
        && channel.is_radio() == radio
        && (!filter || session.ctx().setup.passes_filter(channel))
}

/// Group a channel belongs to under the session's grouping mode.
fn group_of(channel: &Channel, automatic: bool) -> Option<&str> {
    if automatic {
        Some(channel.provider.as_str()).filter(|p| !p.is_empty())
    } else {
        channel.group.as_deref()
    }
}

fn group_names(channels: &[Channel], automatic: bool, radio: bool) -> BTreeSet<String> {
    channels
        .iter()
        .filter(|c| c.sid != 0 && c.is_radio() == radio)
        .filter_map(|c| group_of(c, automatic))
        .map(str::to_string)
        .collect()
}

fn get_count(session: &mut ClientSession, _req: &mut RequestPacket, resp: &mut ResponsePacket) -> HandlerResult {
    resp.add_u32(session.ctx().channels.max_number());
    Ok(Disposition::Reply)
}

fn get_channels(session: &mut ClientSession, req: &mut RequestPacket, resp: &mut ResponsePacket) -> HandlerResult {
    if req.payload_len() != 5 {
        warn!(
            "[Client {}] Channel list request of {} bytes",
            session.id(),
            req.payload_len()
        );
        return Ok(Disposition::Close);
    }
    let radio = req.extract_u32()? != 0;
    let filter = req.extract_u8()? != 0;
    let picons = session.protocol_version() >= PICON_PROTOCOL_VERSION;

    let channels = session.ctx().channels.channels();
    let mut count = 0;
    for channel in channels.iter().filter(|c| listed(session, c, radio, filter)) {
        let uid = channel.uid();
        resp.add_u32(channel.number)
            .add_string(&channel.name)
            .add_string(&channel.provider)
            .add_u32(uid)
            .add_u32(channel.first_caid())
            .add_string(&channel.caid_string());
        if picons {
            resp.add_string(&channel.picon_ref());
        }
        session.follow_epg(uid);
        count += 1;
    }
    debug!(
        "[Client {}] Listed {} {} channels",
        session.id(),
        count,
        if radio { "radio" } else { "TV" }
    );
    Ok(Disposition::Reply)
}

fn group_count(session: &mut ClientSession, req: &mut RequestPacket, resp: &mut ResponsePacket) -> HandlerResult {
    let automatic = req.extract_u32()? == 1;
    session.set_automatic_groups(automatic);

    let channels = session.ctx().channels.channels();
    let count = group_names(&channels, automatic, false).len() + group_names(&channels, automatic, true).len();
    resp.add_u32(count as u32);
    Ok(Disposition::Reply)
}

fn group_list(session: &mut ClientSession, req: &mut RequestPacket, resp: &mut ResponsePacket) -> HandlerResult {
    let radio = req.extract_u8()? != 0;
    let channels = session.ctx().channels.channels();
    for name in group_names(&channels, session.automatic_groups(), radio) {
        resp.add_string(&name).add_u8(radio as u8);
    }
    Ok(Disposition::Reply)
}

fn group_members(session: &mut ClientSession, req: &mut RequestPacket, resp: &mut ResponsePacket) -> HandlerResult {
    let name = req.extract_string()?;
    let radio = req.extract_u8()? != 0;
    let filter = req.extract_u8()? != 0;
    let automatic = session.automatic_groups();

    let channels = session.ctx().channels.channels();
    let members = channels
        .iter()
        .filter(|c| group_of(c, automatic) == Some(name.as_str()))
        .filter(|c| listed(session, c, radio, filter));
    for (index, channel) in members.enumerate() {
        resp.add_u32(channel.uid()).add_u32(index as u32 + 1);
    }
    Ok(Disposition::Reply)
}

fn get_caids(session: &mut ClientSession, req: &mut RequestPacket, resp: &mut ResponsePacket) -> HandlerResult {
    let uid = req.extract_u32()?;
    if let Some(channel) = session.ctx().channels.channel_by_uid(uid) {
        for caid in channel.caids.iter().take_while(|&&c| c != 0) {
            resp.add_u32(*caid as u32);
        }
    }
    Ok(Disposition::Reply)
}

fn get_whitelist(session: &mut ClientSession, req: &mut RequestPacket, resp: &mut ResponsePacket) -> HandlerResult {
    let radio = req.extract_u8()? != 0;
    let filter = session.ctx().setup.filter();
    for provider in filter.whitelist(radio) {
        resp.add_string(&provider.name).add_u32(provider.caid);
    }
    Ok(Disposition::Reply)
}

fn get_blacklist(session: &mut ClientSession, req: &mut RequestPacket, resp: &mut ResponsePacket) -> HandlerResult {
    let radio = req.extract_u8()? != 0;
    let filter = session.ctx().setup.filter();
    for uid in filter.blacklist(radio) {
        resp.add_u32(*uid);
    }
    Ok(Disposition::Reply)
}

fn set_whitelist(session: &mut ClientSession, req: &mut RequestPacket, _resp: &mut ResponsePacket) -> HandlerResult {
    let radio = req.extract_u8()? != 0;
    let mut providers = Vec::new();
    while !req.end() {
        let name = req.extract_string()?;
        let caid = req.extract_u32()?;
        providers.push(ProviderEntry { name, caid });
    }
    debug!("[Client {}] Whitelist ({}) set to {} providers", session.id(), radio, providers.len());
    if let Err(e) = session
        .ctx()
        .setup
        .update_filter(|filter| filter.set_whitelist(radio, providers))
    {
        warn!("[Client {}] Saving whitelist failed: {}", session.id(), e);
    }
    Ok(Disposition::Reply)
}

fn set_blacklist(session: &mut ClientSession, req: &mut RequestPacket, _resp: &mut ResponsePacket) -> HandlerResult {
    let radio = req.extract_u8()? != 0;
    let mut uids = Vec::new();
    while !req.end() {
        uids.push(req.extract_u32()?);
    }
    debug!("[Client {}] Blacklist ({}) set to {} channels", session.id(), radio, uids.len());
    if let Err(e) = session
        .ctx()
        .setup
        .update_filter(|filter| filter.set_blacklist(radio, uids))
    {
        warn!("[Client {}] Saving blacklist failed: {}", session.id(), e);
    }
    Ok(Disposition::Reply)
}
