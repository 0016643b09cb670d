use codec::ChannelMember;
use parking_lot::Mutex;
use uuid::Uuid;

use crate::transport::TransportHandle;

/// A connected agent's session state, relay-side.
pub struct AgentSession {
    pub id: Uuid,
    pub transport: TransportHandle,
    member_info: Mutex<Option<ChannelMember>>,
}

impl AgentSession {
    pub fn new(id: Uuid, transport: TransportHandle) -> Self {
        Self {
            id,
            transport,
            member_info: Mutex::new(None),
        }
    }

    pub fn member_info(&self) -> Option<ChannelMember> {
        self.member_info.lock().clone()
    }

    pub fn set_member_info(&self, info: ChannelMember) {
        *self.member_info.lock() = Some(info);
    }
}

/// A logical byte stream multiplexed between two agents in the same
/// channel.
#[derive(Clone, Copy)]
pub struct SocketChannel {
    pub id: Uuid,
    pub source: Uuid,
    pub sink: Uuid,
    pub initialized: bool,
}

impl SocketChannel {
    /// Returns the id of the endpoint opposite `from`, if `from` is one
    /// of this channel's two endpoints.
    pub fn other(&self, from: Uuid) -> Option<Uuid> {
        if from == self.source {
            Some(self.sink)
        } else if from == self.sink {
            Some(self.source)
        } else {
            None
        }
    }

    pub fn involves(&self, agent: Uuid) -> bool {
        self.source == agent || self.sink == agent
    }
}
