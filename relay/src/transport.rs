//! The relay's half of the framed bidirectional byte-packet channel.
//! Wraps an already-upgraded [`axum::extract::ws::WebSocket`] in
//! a reader task and a writer task, connected to the rest of the relay
//! through bounded queues.

use std::time::Duration;

use axum::extract::ws::{Message, WebSocket};
use codec::{framing, Packet};
use futures_util::{SinkExt, StreamExt};
use tokio::sync::{mpsc, watch};

/// Transport buffer capacity in both directions.
const BUFFER_CAPACITY: usize = 1024;
const CLOSE_FLUSH_DEADLINE: Duration = Duration::from_secs(1);

/// The write/close half of a transport. Cheaply cloneable; handed out to
/// every part of the relay that needs to send a packet to one agent.
#[derive(Clone)]
pub struct TransportHandle {
    outbound: mpsc::Sender<Packet>,
    closed_tx: watch::Sender<bool>,
    closed_rx: watch::Receiver<bool>,
}

impl TransportHandle {
    /// Enqueues `packet` for delivery. Blocks (providing backpressure)
    /// when the outbound buffer is full; returns `false` if the
    /// transport is already closed, in which case the write is dropped
    /// silently.
    pub async fn write(&self, packet: Packet) -> bool {
        if *self.closed_rx.borrow() {
            return false;
        }
        self.outbound.send(packet).await.is_ok()
    }

    /// Idempotent. Signals the writer task to flush a close frame and
    /// stop; fires the close event for any waiters.
    pub fn close(&self) {
        let _ = self.closed_tx.send(true);
    }

    pub fn is_closed(&self) -> bool {
        *self.closed_rx.borrow()
    }

    /// Resolves once the transport has closed, from either end.
    pub async fn closed(&self) {
        let mut rx = self.closed_rx.clone();
        if *rx.borrow() {
            return;
        }
        let _ = rx.changed().await;
    }
}

/// The read half plus a handle to the write half. Owned by the task
/// driving one agent's connection handler.
pub struct Transport {
    pub handle: TransportHandle,
    inbound: mpsc::Receiver<Packet>,
}

impl Transport {
    /// Spawns the reader and writer tasks over `socket` and returns the
    /// resulting duplex.
    pub fn spawn(socket: WebSocket) -> Self {
        let (mut sink, mut stream) = socket.split();
        let (outbound_tx, mut outbound_rx) = mpsc::channel::<Packet>(BUFFER_CAPACITY);
        let (inbound_tx, inbound_rx) = mpsc::channel::<Packet>(BUFFER_CAPACITY);
        let (closed_tx, closed_rx) = watch::channel(false);

        // Reader: decode frames off the socket until it closes or a
        // frame fails to decode (fatal to the transport).
        let reader_closed_tx = closed_tx.clone();
        tokio::spawn(async move {
            loop {
                match stream.next().await {
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

        // Writer: drain the outbound queue until told to close, then
        // flush a close frame with a 1s deadline.
        let mut writer_closed_rx = closed_rx.clone();
        tokio::spawn(async move {
            'writer: loop {
                tokio::select! {
                    biased;

                    changed = writer_closed_rx.changed() => {
                        if changed.is_err() || *writer_closed_rx.borrow() {
                            // A write enqueued just before close() (e.g. a
                            // CriticalError followed immediately by close)
                            // may already be sitting in the channel by the
                            // time this branch is polled. Drain it before
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

    /// Blocking pull from the inbound queue. Returns `(_, false)` once the
    /// peer has closed and no further packets will arrive.
    pub async fn read(&mut self) -> (Option<Packet>, bool) {
        match self.inbound.recv().await {
            Some(packet) => (Some(packet), true),
            None => (None, false),
        }
    }
}
