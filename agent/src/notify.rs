//! The single user-facing notification string: a place for
//! higher-layer UI code to read current status without scraping logs.
//! Deliberately separate from the logger — a consuming UI may itself be
//! writing to standard error.

use parking_lot::Mutex;

pub struct Notifier {
    message: Mutex<String>,
}

impl Default for Notifier {
    fn default() -> Self {
        Self {
            message: Mutex::new(String::new()),
        }
    }
}

impl Notifier {
    pub fn set(&self, message: impl Into<String>) {
        *self.message.lock() = message.into();
    }

    pub fn get(&self) -> String {
        self.message.lock().clone()
    }
}

/// The cycling "connection lost, reconnecting..." animation frames used
/// while the reconnection loop spins.
pub const RECONNECT_FRAMES: &[&str] = &[
    "connection lost, reconnecting.",
    "connection lost, reconnecting..",
    "connection lost, reconnecting...",
];
