//! Orchestrates the state manager and socket manager, routes inbound
//! packets by type, and owns the reconnection state machine.

use std::{sync::Arc, time::Duration};

use anyhow::Context;
use codec::{ForwardingRule, Packet, PacketType, SocketChannelRef};
use tokio::sync::watch;
use uuid::Uuid;

use crate::{
    config::AgentSettings, error::Error, metrics::tick_forever, notify::Notifier, socket::SocketManager,
    state::StateManager, transport,
};

const RECONNECT_INTERVAL: Duration = Duration::from_millis(500);

/// Runs the agent forever: the initial connection, then — should it ever
/// drop — an uncapped 500ms reconnection loop. `shutdown` fires on
/// SIGINT/SIGTERM; `run` closes the active transport and returns cleanly
/// rather than reconnecting once it has. Returns an `Err` only if the
/// *initial* connection attempt fails.
pub async fn run(
    settings: AgentSettings,
    rules: Vec<ForwardingRule>,
    notifier: Arc<Notifier>,
    mut shutdown: watch::Receiver<bool>,
) -> anyhow::Result<()> {
    let transport = transport::connect(&settings)
        .await
        .context("initial connection to the relay failed")?;
    if drive_session(transport, &rules, &settings, &notifier, &mut shutdown).await.is_shutdown() {
        return Ok(());
    }

    let mut frame = 0usize;
    loop {
        notifier.set(crate::notify::RECONNECT_FRAMES[frame % crate::notify::RECONNECT_FRAMES.len()]);
        frame += 1;

        tokio::select! {
            _ = shutdown.changed() => return Ok(()),
            connected = transport::connect(&settings) => match connected {
                Ok(transport) => {
                    frame = 0;
                    if drive_session(transport, &rules, &settings, &notifier, &mut shutdown).await.is_shutdown() {
                        return Ok(());
                    }
                }
                Err(err) => {
                    log::debug!("reconnect attempt failed: {err}");
                    tokio::time::sleep(RECONNECT_INTERVAL).await;
                }
            },
        }
    }
}

enum SessionEnd {
    TransportClosed,
    Shutdown,
}

impl SessionEnd {
    fn is_shutdown(&self) -> bool {
        matches!(self, Self::Shutdown)
    }
}

/// Drives one connected session to completion: dispatches every inbound
/// packet, binds listeners and publishes `MemberInfo` once the first
/// `ChannelState` lands, runs the metrics ticker, and returns once the
/// transport closes or shutdown is requested.
async fn drive_session(
    mut transport: transport::Transport,
    rules: &[ForwardingRule],
    settings: &AgentSettings,
    notifier: &Arc<Notifier>,
    shutdown: &mut watch::Receiver<bool>,
) -> SessionEnd {
    let state = Arc::new(StateManager::new(Uuid::new_v4(), settings.name.clone(), rules.to_vec()));
    let socket = SocketManager::new(transport.handle.clone(), state.clone(), notifier.clone());

    let ticker_socket = socket.clone();
    let ticker = tokio::spawn(async move { tick_forever(ticker_socket).await });

    let mut initialized = false;
    let end = loop {
        let (packet, ok) = tokio::select! {
            _ = shutdown.changed() => break SessionEnd::Shutdown,
            read = transport.read() => read,
        };
        if !ok {
            log::debug!("{}", Error::TransportLost);
            break SessionEnd::TransportClosed;
        }
        let Some(packet) = packet else {
            log::debug!("{}", Error::TransportLost);
            break SessionEnd::TransportClosed;
        };

        match packet.r#type {
            PacketType::ChannelState => {
                let Ok(info) = packet.body() else {
                    log::warn!("malformed ChannelState, ignoring");
                    continue;
                };
                let changed = state.apply(info);

                if !initialized {
                    initialized = true;
                    if let Err(err) = socket.bind_all().await {
                        log::error!("fatal: {err}");
                        std::process::exit(1);
                    }
                    publish_member_info(&transport, &state).await;
                } else if changed {
                    publish_member_info(&transport, &state).await;
                }
            }
            PacketType::Data => {
                if let Err(Error::ChannelUnknown(id)) = socket.handle_data(packet).await {
                    notifier.set(format!("received data for an unknown socket-channel ({id})"));
                }
            }
            PacketType::Error => {
                let text: String = packet.body().unwrap_or_default();
                log::debug!("relay error: {text}");
                notifier.set(text);
            }
            PacketType::CriticalError => {
                let text: String = packet.body().unwrap_or_default();
                log::error!("{}", Error::CriticalError(text));
                std::process::exit(1);
            }
            PacketType::SocketConnect => {
                if let Err(err) = socket.handle_socket_connect(packet).await {
                    log::debug!("socket connect: {err}");
                }
            }
            PacketType::SocketDisconnect => {
                if let Err(err) = socket.handle_socket_disconnect(packet).await {
                    log::debug!("socket disconnect: {err}");
                }
            }
        }
    };

    ticker.abort();
    socket.close().await;

    if matches!(end, SessionEnd::Shutdown) {
        transport.handle.close();
    }

    end
}

async fn publish_member_info(transport: &transport::Transport, state: &StateManager) {
    let body = state.member_info();
    match Packet::with_body(PacketType::MemberInfo, SocketChannelRef::none(), &body) {
        Ok(packet) => {
            transport.handle.write(packet).await;
        }
        Err(err) => log::warn!("failed to encode MemberInfo: {err}"),
    }
}
