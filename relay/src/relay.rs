//! Owns every channel's authoritative state. A single `Arc<Relay>` is
//! built once in `main` and threaded through the HTTP router's state —
//! there is no module-level singleton.

use std::sync::Arc;

use ahash::RandomState;
use codec::{ChannelMember, ChannelStateInfo, Packet, PacketType, SocketChannelRef};
use parking_lot::Mutex;
use uuid::Uuid;

use crate::{
    error::{Error, Result},
    membership::{AgentSession, SocketChannel},
    observer::RelayObserver,
    transport::Transport,
};

/// One named channel's membership and socket-channel catalog.
///
/// Lock ordering: `clients` before `sockets`. Never hold either
/// while writing to a peer's transport — release, write, and if a
/// follow-up state change is needed, re-acquire.
pub struct ChannelState {
    pub name: String,
    password: Mutex<Option<String>>,
    /// The *clients mutex*: held during add, remove, and
    /// broadcast-preparation.
    clients: Mutex<Vec<Arc<AgentSession>>>,
    /// The *socket mutex*.
    sockets: Mutex<Vec<SocketChannel>>,
}

impl ChannelState {
    fn new(name: String) -> Self {
        Self {
            name,
            password: Mutex::new(None),
            clients: Mutex::new(Vec::new()),
            sockets: Mutex::new(Vec::new()),
        }
    }

    fn is_empty(&self) -> bool {
        self.clients.lock().is_empty()
    }

    fn member(&self, id: Uuid) -> Option<Arc<AgentSession>> {
        self.clients.lock().iter().find(|m| m.id == id).cloned()
    }

    /// Snapshot of every member who has published `MemberInfo`, in join
    /// order, alongside the full member list (including not-yet-ready
    /// members) for id lookups.
    fn snapshot(&self) -> (Vec<Arc<AgentSession>>, Vec<ChannelMember>) {
        let clients = self.clients.lock();
        let infos = clients.iter().filter_map(|m| m.member_info()).collect();
        (clients.clone(), infos)
    }
}

pub struct Relay {
    channels: Mutex<std::collections::HashMap<String, Arc<ChannelState>, RandomState>>,
    observer: Arc<dyn RelayObserver>,
}

impl Relay {
    pub fn new(observer: Arc<dyn RelayObserver>) -> Arc<Self> {
        Arc::new(Self {
            channels: Mutex::new(std::collections::HashMap::default()),
            observer,
        })
    }

    fn channel_of(&self, name: &str) -> Arc<ChannelState> {
        self.channels
            .lock()
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(ChannelState::new(name.to_string())))
            .clone()
    }

    /// Runs the full lifecycle of one agent connection: authenticate,
    /// join, dispatch packets until the transport closes, then leave and
    /// clean up.
    pub async fn handle_connection(
        self: &Arc<Self>,
        channel_name: String,
        client_name: String,
        password: String,
        socket: axum::extract::ws::WebSocket,
    ) {
        let mut transport = Transport::spawn(socket);
        let channel = self.channel_of(&channel_name);

        let session = match self.authenticate_and_join(&channel, password, &transport.handle) {
            Ok(session) => session,
            Err(Error::Authentication { channel }) => {
                let _ = transport
                    .handle
                    .write(
                        Packet::error_text(
                            PacketType::CriticalError,
                            format!("Invalid password for channel: {channel}"),
                        )
                        .expect("error text always encodes"),
                    )
                    .await;
                transport.handle.close();
                return;
            }
            Err(err) => {
                log::warn!("join failed for {client_name}@{channel_name}: {err}");
                return;
            }
        };

        self.observer.on_join(&channel_name, session.id);
        self.broadcast(&channel).await;

        loop {
            let (packet, ok) = transport.read().await;
            if !ok {
                log::debug!("{}", Error::TransportLost { id: session.id });
                break;
            }
            let Some(packet) = packet else { break };

            if let Err(err) = self.dispatch(&channel, &session, packet).await {
                log::debug!("{channel_name}: {err}");
            }
        }

        self.leave(&channel, session.id).await;
    }

    fn authenticate_and_join(
        &self,
        channel: &Arc<ChannelState>,
        password: String,
        transport: &crate::transport::TransportHandle,
    ) -> Result<Arc<AgentSession>> {
        let mut guard = channel.password.lock();
        match guard.as_ref() {
            Some(existing) if existing != &password => {
                return Err(Error::Authentication {
                    channel: channel.name.clone(),
                });
            }
            Some(_) => {}
            None => *guard = Some(password),
        }
        drop(guard);

        let session = Arc::new(AgentSession::new(Uuid::new_v4(), transport.clone()));
        channel.clients.lock().push(session.clone());
        Ok(session)
    }

    async fn dispatch(
        &self,
        channel: &Arc<ChannelState>,
        session: &Arc<AgentSession>,
        packet: Packet,
    ) -> Result<()> {
        match packet.r#type {
            PacketType::MemberInfo => {
                let info: ChannelMember = packet.body()?;
                session.set_member_info(info);
                self.broadcast(channel).await;
                Ok(())
            }
            PacketType::SocketConnect => {
                crate::broker::handle_socket_connect(self, channel, session.id, packet).await
            }
            PacketType::SocketDisconnect => {
                crate::broker::handle_socket_disconnect(self, channel, session.id, packet).await
            }
            PacketType::Data => crate::broker::handle_data(self, channel, session.id, packet).await,
            other => {
                log::debug!("ignoring unexpected packet type from agent: {other:?}");
                Ok(())
            }
        }
    }

    /// Removes `agent` from `channel`, tears down every socket-channel
    /// that referenced it, and broadcasts the
    /// resulting state to survivors. Destroys the channel if it is now
    /// empty.
    pub async fn leave(self: &Arc<Self>, channel: &Arc<ChannelState>, agent: Uuid) {
        let removed = {
            let mut clients = channel.clients.lock();
            let before = clients.len();
            clients.retain(|m| m.id != agent);
            clients.len() != before
        };

        if !removed {
            return;
        }

        self.observer.on_leave(&channel.name, agent);

        let orphaned: Vec<SocketChannel> = {
            let mut sockets = channel.sockets.lock();
            let (orphaned, remaining): (Vec<_>, Vec<_>) =
                sockets.drain(..).partition(|sc| sc.involves(agent));
            *sockets = remaining;
            orphaned
        };

        for sc in orphaned {
            self.observer.on_socket_channel_close(&channel.name, sc.id);
            if let Some(survivor) = sc.other(agent) {
                if let Some(member) = channel.member(survivor) {
                    let packet = Packet::with_body(
                        PacketType::SocketDisconnect,
                        SocketChannelRef::new(sc.id),
                        &codec::DisconnectSocketChannelPacket { id: sc.id },
                    );
                    if let Ok(packet) = packet {
                        member.transport.write(packet).await;
                    }
                }
            }
        }

        self.broadcast(channel).await;

        if channel.is_empty() {
            self.channels.lock().remove(&channel.name);
        }
    }

    /// Sends every current member a `ChannelState` packet with their own
    /// `yourId` and the set of members who have published `MemberInfo`.
    /// Best-effort: a write failure to one member is logged, others
    /// still receive the update.
    pub async fn broadcast(&self, channel: &Arc<ChannelState>) {
        let (members, infos) = channel.snapshot();

        for member in members {
            let body = ChannelStateInfo {
                your_id: member.id,
                current_members: infos.clone(),
            };
            match Packet::with_body(PacketType::ChannelState, SocketChannelRef::none(), &body) {
                Ok(packet) => {
                    if !member.transport.write(packet).await {
                        log::debug!("channel-state broadcast skipped for closed member {}", member.id);
                    }
                }
                Err(err) => log::warn!("failed to encode channel-state broadcast: {err}"),
            }
        }
    }

    pub(crate) fn socket_channels<'a>(&self, channel: &'a Arc<ChannelState>) -> &'a Mutex<Vec<SocketChannel>> {
        &channel.sockets
    }

    pub(crate) fn member(&self, channel: &Arc<ChannelState>, id: Uuid) -> Option<Arc<AgentSession>> {
        channel.member(id)
    }

    pub(crate) fn observer(&self) -> &Arc<dyn RelayObserver> {
        &self.observer
    }
}
