//! Rolling Tx/Rx rate estimates. Observation-only — nothing
//! downstream acts on these values, they exist for the agent's own
//! state-observation interface.

use std::sync::{atomic::{AtomicU64, Ordering}, Arc};
use std::time::Duration;

use crate::socket::SocketManager;

#[derive(Default)]
pub struct Metrics {
    tx: AtomicU64,
    rx: AtomicU64,
    tx_accum: AtomicU64,
    rx_accum: AtomicU64,
}

impl Metrics {
    pub fn add_tx(&self, bytes: u64) {
        self.tx_accum.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn add_rx(&self, bytes: u64) {
        self.rx_accum.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn tx(&self) -> u64 {
        self.tx.load(Ordering::Relaxed)
    }

    pub fn rx(&self) -> u64 {
        self.rx.load(Ordering::Relaxed)
    }

    /// One tick of the exponential average `new = (old + accumulator) /
    /// 2` (alpha = 0.5): an idle tick still halves the previous value,
    /// so a burst decays to background over a few seconds rather than
    /// dropping to zero on the very next tick.
    pub fn tick(&self) {
        let tx = self.tx.load(Ordering::Relaxed);
        let tx_accum = self.tx_accum.swap(0, Ordering::Relaxed);
        self.tx.store((tx + tx_accum) / 2, Ordering::Relaxed);

        let rx = self.rx.load(Ordering::Relaxed);
        let rx_accum = self.rx_accum.swap(0, Ordering::Relaxed);
        self.rx.store((rx + rx_accum) / 2, Ordering::Relaxed);
    }
}

/// One metrics-tick task per agent session: ticks every second until
/// aborted by the caller on session teardown.
pub async fn tick_forever(socket: Arc<SocketManager>) {
    let mut interval = tokio::time::interval(Duration::from_secs(1));
    loop {
        interval.tick().await;
        socket.metrics().tick();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decays_toward_zero_on_idle_ticks() {
        let metrics = Metrics::default();
        metrics.add_tx(100);
        metrics.tick();
        assert_eq!(metrics.tx(), 50);

        metrics.tick();
        assert_eq!(metrics.tx(), 25);
    }

    #[test]
    fn accumulates_between_ticks() {
        let metrics = Metrics::default();
        metrics.add_rx(10);
        metrics.add_rx(20);
        metrics.tick();
        assert_eq!(metrics.rx(), 15);
    }
}
