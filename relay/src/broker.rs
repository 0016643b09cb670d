//! The relay's socket-channel broker: three-phase establishment,
//! data routing, and disconnect handling. Free functions taking `&Relay`
//! rather than methods on it, since they only ever touch one channel's
//! `sockets`/`clients` state and are easier to reason about split out of
//! `Relay`'s own lifecycle methods.

use std::sync::Arc;

use codec::{
    CreateSocketChannelPacket, DisconnectSocketChannelPacket, Packet, PacketType, SocketChannelRef,
};
use uuid::Uuid;

use crate::{
    error::{Error, Result},
    membership::SocketChannel,
    relay::{ChannelState, Relay},
};

pub async fn handle_socket_connect(
    relay: &Arc<Relay>,
    channel: &Arc<ChannelState>,
    from: Uuid,
    packet: Packet,
) -> Result<()> {
    let body: CreateSocketChannelPacket = packet.body()?;

    match body.id {
        None => create(relay, channel, from, body).await,
        Some(id) => finalize(relay, channel, from, id, body).await,
    }
}

/// Phase 1: a source agent requests a fresh socket-channel.
async fn create(
    relay: &Arc<Relay>,
    channel: &Arc<ChannelState>,
    from: Uuid,
    body: CreateSocketChannelPacket,
) -> Result<()> {
    let sink_id = body.sink.id;
    let Some(sink) = relay.member(channel, sink_id) else {
        let error = Packet::error_text(
            PacketType::Error,
            format!("sink member {sink_id} is not present in channel {}", channel.name),
        )?;
        if let Some(source) = relay.member(channel, from) {
            source.transport.write(error).await;
        }
        return Err(Error::SinkMissing {
            channel: channel.name.clone(),
            sink: sink_id,
        });
    };

    let id = Uuid::new_v4();
    relay
        .socket_channels(channel)
        .lock()
        .push(SocketChannel {
            id,
            source: from,
            sink: sink_id,
            initialized: false,
        });

    relay
        .observer()
        .on_socket_channel_open(&channel.name, id, from, sink_id);

    let forwarded = Packet::with_body(
        PacketType::SocketConnect,
        SocketChannelRef::new(id),
        &CreateSocketChannelPacket {
            id: Some(id),
            request_id: body.request_id,
            source: body.source,
            sink: body.sink,
            forwarding_rule: body.forwarding_rule,
        },
    )?;

    sink.transport.write(forwarded).await;
    Ok(())
}

/// Phase 3: the sink confirms after dialing out; relay to the source.
async fn finalize(
    relay: &Arc<Relay>,
    channel: &Arc<ChannelState>,
    from: Uuid,
    id: Uuid,
    body: CreateSocketChannelPacket,
) -> Result<()> {
    let source_id = {
        let mut sockets = relay.socket_channels(channel).lock();
        let Some(sc) = sockets.iter_mut().find(|sc| sc.id == id && !sc.initialized) else {
            return Err(Error::ChannelUnknown { id });
        };
        sc.initialized = true;
        sc.source
    };

    let Some(source) = relay.member(channel, source_id) else {
        return Err(Error::ChannelUnknown { id });
    };

    let _ = from; // the sink's own id is implicit in `body.sink`
    let forwarded = Packet::with_body(
        PacketType::SocketConnect,
        SocketChannelRef::new(id),
        &body,
    )?;

    source.transport.write(forwarded).await;
    Ok(())
}

/// Routes a `Data` packet along an established socket-channel to the
/// opposite endpoint. Unknown or not-yet-initialized channels are logged
/// and dropped — the sender is not disconnected.
pub async fn handle_data(
    relay: &Arc<Relay>,
    channel: &Arc<ChannelState>,
    from: Uuid,
    packet: Packet,
) -> Result<()> {
    let Some(id) = packet.chan.id else {
        return Err(Error::ChannelUnknown { id: Uuid::nil() });
    };

    let destination = {
        let sockets = relay.socket_channels(channel).lock();
        sockets
            .iter()
            .find(|sc| sc.id == id)
            .filter(|sc| sc.initialized)
            .and_then(|sc| sc.other(from))
    };

    let Some(destination) = destination else {
        log::debug!("unknown channel {id}, dropping Data packet from {from}");
        return Err(Error::ChannelUnknown { id });
    };

    if let Some(member) = relay.member(channel, destination) {
        member.transport.write(packet).await;
    }

    Ok(())
}

/// Forwards a `SocketDisconnect` to the opposite endpoint and removes the
/// record. Unknown ids are dropped silently.
pub async fn handle_socket_disconnect(
    relay: &Arc<Relay>,
    channel: &Arc<ChannelState>,
    from: Uuid,
    packet: Packet,
) -> Result<()> {
    let body: DisconnectSocketChannelPacket = packet.body()?;

    let removed = {
        let mut sockets = relay.socket_channels(channel).lock();
        let position = sockets.iter().position(|sc| sc.id == body.id);
        position.map(|idx| sockets.remove(idx))
    };

    let Some(sc) = removed else {
        return Ok(());
    };

    relay
        .observer()
        .on_socket_channel_close(&channel.name, sc.id);

    if let Some(destination) = sc.other(from) {
        if let Some(member) = relay.member(channel, destination) {
            let forwarded = Packet::with_body(
                PacketType::SocketDisconnect,
                SocketChannelRef::new(sc.id),
                &body,
            )?;
            member.transport.write(forwarded).await;
        }
    }

    Ok(())
}
