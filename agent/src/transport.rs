//! The agent's half of the framed bidirectional byte-packet channel.
//! Dials out with `tokio-tungstenite`; the resulting duplex has
//! the same read/write/close shape as the relay's transport so the rest
//! of the agent never needs to know which side of the connection it is.

use std::time::Duration;

use base64::{engine::general_purpose::STANDARD, Engine};
use codec::{framing, Packet};
use futures_util::{SinkExt, StreamExt};
use tokio::sync::{mpsc, watch};
use tokio_tungstenite::tungstenite::{client::IntoClientRequest, Message};

use crate::config::AgentSettings;

const BUFFER_CAPACITY: usize = 1024;
const CLOSE_FLUSH_DEADLINE: Duration = Duration::from_secs(1);

#[derive(Clone)]
pub struct TransportHandle {
    outbound: mpsc::Sender<Packet>,
    closed_tx: watch::Sender<bool>,
    closed_rx: watch::Receiver<bool>,
}

impl TransportHandle {
    pub async fn write(&self, packet: Packet) -> bool {
        if *self.closed_rx.borrow() {
            return false;
        }
        self.outbound.send(packet).await.is_ok()
    }

    pub fn close(&self) {
        let _ = self.closed_tx.send(true);
    }

    pub fn is_closed(&self) -> bool {
        *self.closed_rx.borrow()
    }

    pub async fn closed(&self) {
        let mut rx = self.closed_rx.clone();
        if *rx.borrow() {
            return;
        }
        let _ = rx.changed().await;
    }
}

#[cfg(test)]
impl TransportHandle {
    /// A handle with no backing socket, for driving `SocketManager` in
    /// tests without a real relay connection. The returned receiver drains
    /// whatever the code under test writes.
    pub fn for_test() -> (Self, mpsc::Receiver<Packet>) {
        let (outbound, outbound_rx) = mpsc::channel(BUFFER_CAPACITY);
        let (closed_tx, closed_rx) = watch::channel(false);
        (
            Self {
                outbound,
                closed_tx,
                closed_rx,
            },
            outbound_rx,
        )
    }
}

pub struct Transport {
    pub handle: TransportHandle,
    inbound: mpsc::Receiver<Packet>,
}

/// Dials the relay named by `settings.proxy`, completing the join
/// handshake via query parameters and the `Authorization` header. A
/// rejected handshake (non-101 response, or TCP/TLS failure) surfaces as
/// an `Err` before any packet exchange.
pub async fn connect(settings: &AgentSettings) -> anyhow::Result<Transport> {
    let mut url = url::Url::parse(&settings.proxy)?;
    url.set_path("/api/ws/connect");
    url.query_pairs_mut()
        .append_pair("channel", &settings.channel)
        .append_pair("clientName", &settings.name);

    let mut request = url.as_str().into_client_request()?;
    let basic = STANDARD.encode(settings.password.as_bytes());
    request
        .headers_mut()
        .insert("Authorization", format!("Basic {basic}").parse()?);

    let (stream, _response) = tokio_tungstenite::connect_async(request).await?;
    Ok(Transport::spawn(stream))
}

impl Transport {
    fn spawn<S>(stream: tokio_tungstenite::WebSocketStream<S>) -> Self
    where
        S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin + Send + 'static,
    {
        let (mut sink, mut ws_stream) = stream.split();
        let (outbound_tx, mut outbound_rx) = mpsc::channel::<Packet>(BUFFER_CAPACITY);
        let (inbound_tx, inbound_rx) = mpsc::channel::<Packet>(BUFFER_CAPACITY);
        let (closed_tx, closed_rx) = watch::channel(false);

        let reader_closed_tx = closed_tx.clone();
        tokio::spawn(async move {
            loop {
                match ws_stream.next().await {
                    Some(Ok(Message::Binary(bytes))) => match framing::decode(&bytes) {
                        Ok(packet) => {
                            if inbound_tx.send(packet).await.is_err() {
                                break;
                            }
                        }
                        Err(err) => {
                            log::warn!("dropping connection on decode error: {err}");
                            break;
                        }
                    },
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => continue,
                    Some(Err(err)) => {
                        log::debug!("transport read error: {err}");
                        break;
                    }
                }
            }
            let _ = reader_closed_tx.send(true);
        });

        let mut writer_closed_rx = closed_rx.clone();
        tokio::spawn(async move {
            'writer: loop {
                tokio::select! {
                    biased;

                    changed = writer_closed_rx.changed() => {
                        if changed.is_err() || *writer_closed_rx.borrow() {
                            // A write enqueued just before close() may
                            // already be sitting in the channel by the time
                            // this branch is polled. Drain it before
                            // honoring the close signal so no queued packet
                            // is silently dropped.
                            while let Ok(packet) = outbound_rx.try_recv() {
                                match framing::encode(&packet) {
                                    Ok(bytes) => {
                                        if sink.send(Message::Binary(bytes)).await.is_err() {
                                            break;
                                        }
                                    }
                                    Err(err) => log::warn!("failed to encode outgoing packet: {err}"),
                                }
                            }
                            break 'writer;
                        }
                    }
                    maybe_packet = outbound_rx.recv() => {
                        match maybe_packet {
                            Some(packet) => match framing::encode(&packet) {
                                Ok(bytes) => {
                                    if sink.send(Message::Binary(bytes)).await.is_err() {
                                        break 'writer;
                                    }
                                }
                                Err(err) => log::warn!("failed to encode outgoing packet: {err}"),
                            },
                            None => break 'writer,
                        }
                    }
                }
            }

            let _ = tokio::time::timeout(CLOSE_FLUSH_DEADLINE, sink.send(Message::Close(None)))
                .await;
        });

        Self {
            handle: TransportHandle {
                outbound: outbound_tx,
                closed_tx,
                closed_rx,
            },
            inbound: inbound_rx,
        }
    }

    pub async fn read(&mut self) -> (Option<Packet>, bool) {
        match self.inbound.recv().await {
            Some(packet) => (Some(packet), true),
            None => (None, false),
        }
    }
}
