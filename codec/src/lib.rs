//! Wire protocol for the channel-multiplexing forwarding overlay.
//!
//! A [`Packet`] is the unit exchanged between an agent and the relay over
//! the framed transport. [`framing`] turns one into bytes and back again.

pub mod error;
pub mod framing;
pub mod packet;

pub use error::Error;
pub use packet::{
    ChannelMember, ChannelStateInfo, CreateSocketChannelPacket, DisconnectSocketChannelPacket,
    ForwardingRule, Packet, PacketType, SocketChannelRef,
};
