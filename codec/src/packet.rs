use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// The type tag of a [`Packet`], in wire order.
///
/// Order matters only in the sense that it is fixed once deployed: this
/// enum is encoded by discriminant, so reordering variants breaks
/// compatibility with already-deployed peers.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum PacketType {
    Data = 0,
    Error = 1,
    CriticalError = 2,
    ChannelState = 3,
    MemberInfo = 4,
    SocketConnect = 5,
    SocketDisconnect = 6,
}

/// A reference to a socket-channel. Absent (`id = None`) on a `SocketConnect`
/// that is requesting fresh establishment.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SocketChannelRef {
    pub id: Option<Uuid>,
}

impl SocketChannelRef {
    pub fn new(id: Uuid) -> Self {
        Self { id: Some(id) }
    }

    pub fn none() -> Self {
        Self { id: None }
    }
}

impl From<Uuid> for SocketChannelRef {
    fn from(id: Uuid) -> Self {
        Self::new(id)
    }
}

/// A single record exchanged over the transport.
///
/// `data` is the raw TCP payload when `r#type == PacketType::Data`; for
/// every other type it holds a JSON-encoded structured body (see the
/// `*_body` helpers below).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Packet {
    pub r#type: PacketType,
    pub chan: SocketChannelRef,
    pub data: Vec<u8>,
}

impl Packet {
    pub fn data(chan: Uuid, payload: Vec<u8>) -> Self {
        Self {
            r#type: PacketType::Data,
            chan: SocketChannelRef::new(chan),
            data: payload,
        }
    }

    /// Builds a packet whose body is JSON-serialized from `body`.
    ///
    /// # Example
    ///
    /// ```
    /// use waypoint_codec::{Packet, PacketType, SocketChannelRef, DisconnectSocketChannelPacket};
    /// use uuid::Uuid;
    ///
    /// let id = Uuid::new_v4();
    /// let packet = Packet::with_body(
    ///     PacketType::SocketDisconnect,
    ///     SocketChannelRef::new(id),
    ///     &DisconnectSocketChannelPacket { id },
    /// )
    /// .unwrap();
    ///
    /// let body: DisconnectSocketChannelPacket = packet.body().unwrap();
    /// assert_eq!(body.id, id);
    /// ```
    pub fn with_body<T: Serialize>(
        r#type: PacketType,
        chan: SocketChannelRef,
        body: &T,
    ) -> Result<Self, crate::Error> {
        Ok(Self {
            r#type,
            chan,
            data: serde_json::to_vec(body)?,
        })
    }

    /// Decodes this packet's `data` as a JSON structured body.
    pub fn body<'de, T: Deserialize<'de>>(&'de self) -> Result<T, crate::Error> {
        Ok(serde_json::from_slice(&self.data)?)
    }

    /// Builds an `Error`/`CriticalError` packet whose body is a plain
    /// UTF-8 message, JSON-encoded as a string.
    pub fn error_text(r#type: PacketType, message: impl Into<String>) -> Result<Self, crate::Error> {
        Self::with_body(r#type, SocketChannelRef::none(), &message.into())
    }
}

/// An agent-declared rule: accept TCP on `local_port`, forward to the peer
/// named `remote_client` at `remote_host:remote_port`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ForwardingRule {
    pub local_port: u16,
    pub remote_client: String,
    #[serde(default = "default_remote_host")]
    pub remote_host: String,
    pub remote_port: u16,
    /// Derived: whether `remote_client` is currently present in the
    /// channel. Recomputed on every channel-state update, never set by
    /// the operator directly.
    #[serde(default)]
    pub valid: bool,
}

fn default_remote_host() -> String {
    "localhost".to_string()
}

impl ForwardingRule {
    pub fn new(local_port: u16, remote_client: String, remote_port: u16) -> Self {
        Self {
            local_port,
            remote_client,
            remote_host: default_remote_host(),
            remote_port,
            valid: false,
        }
    }
}

/// An agent's self-advertised identity and rule set, as published in
/// `MemberInfo` and echoed back in `ChannelState.current_members`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChannelMember {
    pub id: Uuid,
    pub name: String,
    pub forwarding_rules: Vec<ForwardingRule>,
}

/// Body of a `ChannelState` packet.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChannelStateInfo {
    pub your_id: Uuid,
    pub current_members: Vec<ChannelMember>,
}

/// Body of a `SocketConnect` packet, carried through all three
/// establishment phases (see the relay's socket-channel broker).
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateSocketChannelPacket {
    /// Absent on the initial request from the source; assigned by the
    /// relay and present on every subsequent phase.
    pub id: Option<Uuid>,
    /// Opaque value chosen by the source for correlating the eventual
    /// confirmation with its outstanding request. Echoed through
    /// unchanged by the relay and the sink.
    pub request_id: Uuid,
    pub source: ChannelMember,
    pub sink: ChannelMember,
    pub forwarding_rule: ForwardingRule,
}

/// Body of a `SocketDisconnect` packet.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct DisconnectSocketChannelPacket {
    pub id: Uuid,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn forwarding_rule_defaults_remote_host() {
        let json = r#"{"localPort":8080,"remoteClient":"b","remotePort":80}"#;
        let rule: ForwardingRule = serde_json::from_str(json).unwrap();
        assert_eq!(rule.remote_host, "localhost");
        assert!(!rule.valid);
    }

    #[test]
    fn socket_connect_body_round_trips() {
        let body = CreateSocketChannelPacket {
            id: None,
            request_id: Uuid::new_v4(),
            source: ChannelMember {
                id: Uuid::new_v4(),
                name: "a".into(),
                forwarding_rules: vec![ForwardingRule::new(8080, "b".into(), 80)],
            },
            sink: ChannelMember {
                id: Uuid::new_v4(),
                name: "b".into(),
                forwarding_rules: vec![],
            },
            forwarding_rule: ForwardingRule::new(8080, "b".into(), 80),
        };

        let packet =
            Packet::with_body(PacketType::SocketConnect, SocketChannelRef::none(), &body).unwrap();
        let decoded: CreateSocketChannelPacket = packet.body().unwrap();
        assert_eq!(decoded, body);
    }

    #[test]
    fn error_text_round_trips() {
        let packet =
            Packet::error_text(PacketType::CriticalError, "Invalid password for channel: c")
                .unwrap();
        let message: String = packet.body().unwrap();
        assert_eq!(message, "Invalid password for channel: c");
    }
}
