//! A local extension point: the broker and membership logic are generic
//! over this trait rather than hard-coding a specific notification
//! backend. Every method defaults to a no-op so a binary that only wants
//! logging need not implement anything.

use uuid::Uuid;

pub trait RelayObserver: Send + Sync + 'static {
    fn on_join(&self, _channel: &str, _agent: Uuid) {}

    fn on_leave(&self, _channel: &str, _agent: Uuid) {}

    fn on_socket_channel_open(&self, _channel: &str, _id: Uuid, _source: Uuid, _sink: Uuid) {}

    fn on_socket_channel_close(&self, _channel: &str, _id: Uuid) {}
}

/// The default observer: logs every event at debug level and does
/// nothing else.
pub struct LoggingObserver;

impl RelayObserver for LoggingObserver {
    fn on_join(&self, channel: &str, agent: Uuid) {
        log::debug!("agent {agent} joined channel {channel}");
    }

    fn on_leave(&self, channel: &str, agent: Uuid) {
        log::debug!("agent {agent} left channel {channel}");
    }

    fn on_socket_channel_open(&self, channel: &str, id: Uuid, source: Uuid, sink: Uuid) {
        log::debug!("socket-channel {id} opened in {channel}: {source} -> {sink}");
    }

    fn on_socket_channel_close(&self, channel: &str, id: Uuid) {
        log::debug!("socket-channel {id} closed in {channel}");
    }
}
