//! Owns local TCP listeners, the socket registry, and the packet pumps
//! that move bytes between local sockets and the relay.

use std::{collections::HashMap, sync::Arc, time::Duration};

use anyhow::Context;
use codec::{
    framing::MAX_DATA_FRAGMENT_SIZE, CreateSocketChannelPacket, DisconnectSocketChannelPacket,
    Packet, PacketType, SocketChannelRef,
};
use parking_lot::Mutex;
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::{
        tcp::{OwnedReadHalf, OwnedWriteHalf},
        TcpListener, TcpStream,
    },
    sync::broadcast,
    task::JoinHandle,
};
use uuid::Uuid;

use crate::{
    error::{Error, Result},
    metrics::Metrics,
    notify::Notifier,
    state::StateManager,
    transport::TransportHandle,
};

const ESTABLISHMENT_TIMEOUT: Duration = Duration::from_secs(5);
const CREATED_CHANNEL_CAPACITY: usize = 10;

struct ListenerHandle {
    local_port: u16,
    accept_task: JoinHandle<()>,
}

pub struct SocketManager {
    transport: TransportHandle,
    state: Arc<StateManager>,
    notifier: Arc<Notifier>,
    metrics: Metrics,
    /// The *listener mutex*.
    listeners: Mutex<Vec<ListenerHandle>>,
    /// The *socket mutex*. Maps a socket-channel id to the write halves
    /// of every locally-accepted/dialed TCP connection sharing that id —
    /// normally exactly one. A `tokio::sync::Mutex`, not `parking_lot`,
    /// because delivery holds it across the socket write itself (§5's
    /// one named exception to "never hold a lock across an await") so a
    /// full TCP send buffer applies backpressure rather than silently
    /// dropping bytes.
    sockets: tokio::sync::Mutex<HashMap<Uuid, Vec<OwnedWriteHalf>>>,
    /// The shared "created" event channel: every confirmed
    /// establishment is broadcast here; each waiting accept task filters
    /// for its own `request_id`.
    created: broadcast::Sender<CreateSocketChannelPacket>,
}

impl SocketManager {
    pub fn new(transport: TransportHandle, state: Arc<StateManager>, notifier: Arc<Notifier>) -> Arc<Self> {
        let (created, _) = broadcast::channel(CREATED_CHANNEL_CAPACITY);
        Arc::new(Self {
            transport,
            state,
            notifier,
            metrics: Metrics::default(),
            listeners: Mutex::new(Vec::new()),
            sockets: Mutex::new(HashMap::new()),
            created,
        })
    }

    pub fn metrics(&self) -> &Metrics {
        &self.metrics
    }

    /// Binds a listener for every rule this agent owns. A bind failure is
    /// fatal — the caller should treat an `Err` as cause to exit.
    ///
    /// Waits for the state manager's initialization latch first, so rule
    /// validity always reflects at least one `ChannelState` even if this
    /// is ever called before the caller has observed one itself.
    pub async fn bind_all(self: &Arc<Self>) -> anyhow::Result<()> {
        self.state.wait_until_initialized().await;
        for rule in self.state.rules() {
            self.bind(rule.local_port).await?;
        }
        Ok(())
    }

    async fn bind(self: &Arc<Self>, local_port: u16) -> anyhow::Result<()> {
        let listener = TcpListener::bind(("0.0.0.0", local_port))
            .await
            .with_context(|| format!("failed to bind local port {local_port}"))?;

        let this = self.clone();
        let accept_task = tokio::spawn(async move { this.accept_loop(listener, local_port).await });
        self.listeners.lock().push(ListenerHandle {
            local_port,
            accept_task,
        });
        Ok(())
    }

    async fn accept_loop(self: Arc<Self>, listener: TcpListener, local_port: u16) {
        loop {
            match listener.accept().await {
                Ok((stream, _addr)) => {
                    let this = self.clone();
                    tokio::spawn(async move { this.accept(stream, local_port).await });
                }
                Err(err) => {
                    log::warn!("accept loop on port {local_port} stopped: {err}");
                    break;
                }
            }
        }
    }

    /// Source-side accept path: establish a socket-channel through the
    /// relay, then hand the socket off to a packet pump.
    async fn accept(self: Arc<Self>, stream: TcpStream, local_port: u16) {
        let Some(rule) = self
            .state
            .rules()
            .into_iter()
            .find(|r| r.local_port == local_port)
        else {
            return;
        };

        let sink = self
            .state
            .members()
            .into_iter()
            .find(|m| m.name == rule.remote_client)
            .unwrap_or_else(|| {
                // The peer isn't currently present in the channel — still
                // send the request with a placeholder sink so the relay's
                // own SinkMissing handling and the 5s establishment
                // timeout run their normal course, rather than
                // short-circuiting locally with a different error.
                self.notifier
                    .set(format!("peer {} is not currently present", rule.remote_client));
                codec::ChannelMember {
                    id: Uuid::nil(),
                    name: rule.remote_client.clone(),
                    forwarding_rules: vec![],
                }
            });

        let request_id = Uuid::new_v4();
        let mut created_rx = self.created.subscribe();

        let request = Packet::with_body(
            PacketType::SocketConnect,
            SocketChannelRef::none(),
            &CreateSocketChannelPacket {
                id: None,
                request_id,
                source: self.state.member_info(),
                sink,
                forwarding_rule: rule,
            },
        );
        let Ok(request) = request else { return };
        self.transport.write(request).await;

        let established = tokio::time::timeout(ESTABLISHMENT_TIMEOUT, async {
            loop {
                match created_rx.recv().await {
                    Ok(body) if body.request_id == request_id => return Some(body),
                    Ok(_) => continue,
                    Err(broadcast::error::RecvError::Closed) => return None,
                    Err(broadcast::error::RecvError::Lagged(_)) => continue,
                }
            }
        })
        .await;

        let Ok(Some(body)) = established else {
            self.notifier.set(Error::EstablishmentTimeout.to_string());
            return;
        };

        let id = body.id.expect("the relay always assigns an id by phase 3");
        self.register(id, stream).await;
    }

    /// Sink-side inbound path and source-side confirmation, both arrive
    /// as `SocketConnect`.
    pub async fn handle_socket_connect(self: &Arc<Self>, packet: Packet) -> Result<()> {
        let body: CreateSocketChannelPacket = packet.body()?;

        if body.source.id == self.state.self_id() {
            let _ = self.created.send(body);
            return Ok(());
        }

        let id = body.id.expect("sink side always receives an assigned id");
        let addr = format!(
            "{}:{}",
            body.forwarding_rule.remote_host, body.forwarding_rule.remote_port
        );

        let stream = match TcpStream::connect(&addr).await {
            Ok(stream) => stream,
            Err(err) => {
                log::warn!("dial {addr} failed for socket-channel {id}: {err}");
                return Ok(());
            }
        };

        self.register(id, stream).await;

        let confirmation = Packet::with_body(PacketType::SocketConnect, SocketChannelRef::new(id), &body)?;
        self.transport.write(confirmation).await;
        Ok(())
    }

    /// Registers a connected socket under `id` and spawns its pump.
    async fn register(self: &Arc<Self>, id: Uuid, stream: TcpStream) {
        let (read_half, write_half) = stream.into_split();
        self.sockets.lock().await.entry(id).or_default().push(write_half);

        let this = self.clone();
        tokio::spawn(async move { this.pump(id, read_half).await });
    }

    /// socket → relay: reads up to 1 MiB per iteration and forwards each
    /// read as one `Data` packet.
    async fn pump(self: Arc<Self>, id: Uuid, mut read_half: OwnedReadHalf) {
        let mut buf = vec![0u8; MAX_DATA_FRAGMENT_SIZE];
        loop {
            match read_half.read(&mut buf).await {
                Ok(0) => {
                    self.disconnect_local(id, true).await;
                    break;
                }
                Ok(n) => {
                    self.metrics.add_rx(n as u64);
                    let packet = Packet::data(id, buf[..n].to_vec());
                    self.transport.write(packet).await;
                }
                Err(err) => {
                    log::debug!("socket-channel {id} read error: {err}");
                    self.disconnect_local(id, true).await;
                    break;
                }
            }
        }
    }

    /// relay → socket: delivers a `Data` packet to every local socket
    /// registered under its channel id.
    pub async fn handle_data(self: &Arc<Self>, packet: Packet) -> Result<()> {
        let Some(id) = packet.chan.id else {
            return Err(Error::ChannelUnknown(Uuid::nil()));
        };

        let mut any_write_failed = false;
        {
            let mut sockets = self.sockets.lock().await;
            let Some(list) = sockets.get_mut(&id) else {
                return Err(Error::ChannelUnknown(id));
            };

            // Held across the write itself — the one exception §5 names
            // to "never hold a lock across an await" — so a full TCP
            // send buffer applies backpressure instead of silently
            // dropping bytes.
            let mut survivors = Vec::with_capacity(list.len());
            for mut half in list.drain(..) {
                match half.write_all(&packet.data).await {
                    Ok(()) => survivors.push(half),
                    Err(err) => {
                        log::debug!("{}", Error::SocketWriteFailed(err));
                        any_write_failed = true;
                    }
                }
            }
            *list = survivors;

            if list.is_empty() {
                sockets.remove(&id);
            }
        }

        self.metrics.add_tx(packet.data.len() as u64);

        if any_write_failed {
            self.disconnect_local(id, true).await;
        }

        Ok(())
    }

    /// Peer-initiated disconnect: close and remove locally, without
    /// re-sending `SocketDisconnect`.
    pub async fn handle_socket_disconnect(self: &Arc<Self>, packet: Packet) -> Result<()> {
        let body: DisconnectSocketChannelPacket = packet.body()?;
        self.disconnect_local(body.id, false).await;
        Ok(())
    }

    /// Locally-initiated disconnect: send `SocketDisconnect`, then close
    /// and remove.
    async fn disconnect_local(self: &Arc<Self>, id: Uuid, notify_relay: bool) {
        self.sockets.lock().await.remove(&id);

        if notify_relay {
            if let Ok(packet) = Packet::with_body(
                PacketType::SocketDisconnect,
                SocketChannelRef::new(id),
                &DisconnectSocketChannelPacket { id },
            ) {
                self.transport.write(packet).await;
            }
        }
    }

    /// Closes every listener (stopping accepts) and every registered
    /// socket. Does not touch the transport.
    pub async fn close(&self) {
        for listener in self.listeners.lock().drain(..) {
            listener.accept_task.abort();
        }
        self.sockets.lock().await.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{notify::Notifier, state::StateManager, transport::TransportHandle};

    /// A connected loopback TCP pair: `(accepted, client)`.
    async fn connected_pair() -> (TcpStream, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let accept = async { listener.accept().await.unwrap().0 };
        let connect = TcpStream::connect(addr);
        let (accepted, client) = tokio::join!(accept, connect);
        (accepted, client.unwrap())
    }

    #[tokio::test]
    async fn register_holds_exactly_one_socket_per_channel_id() {
        let (transport, _outbound) = TransportHandle::for_test();
        let state = Arc::new(StateManager::new(Uuid::new_v4(), "a".into(), vec![]));
        let notifier = Arc::new(Notifier::default());
        let manager = SocketManager::new(transport, state, notifier);

        let (accepted, _client) = connected_pair().await;
        let id = Uuid::new_v4();
        manager.register(id, accepted).await;

        let sockets = manager.sockets.lock().await;
        let list = sockets.get(&id).expect("socket should be registered under its id");
        assert_eq!(
            list.len(),
            1,
            "the registry should hold exactly one socket per channel id in the common case"
        );
    }
}
