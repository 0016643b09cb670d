//! Mirrors channel membership on the agent side and derives forwarding
//! rule validity from peer presence.

use codec::{ChannelMember, ChannelStateInfo, ForwardingRule};
use parking_lot::Mutex;
use tokio::sync::watch;
use uuid::Uuid;

pub struct StateManager {
    self_id: Mutex<Uuid>,
    self_name: String,
    members: Mutex<Vec<ChannelMember>>,
    rules: Mutex<Vec<ForwardingRule>>,
    initialized_tx: watch::Sender<bool>,
    initialized_rx: watch::Receiver<bool>,
}

impl StateManager {
    pub fn new(self_id: Uuid, self_name: String, rules: Vec<ForwardingRule>) -> Self {
        let (initialized_tx, initialized_rx) = watch::channel(false);
        Self {
            self_id: Mutex::new(self_id),
            self_name,
            members: Mutex::new(Vec::new()),
            rules: Mutex::new(rules),
            initialized_tx,
            initialized_rx,
        }
    }

    pub fn self_id(&self) -> Uuid {
        *self.self_id.lock()
    }

    pub fn rules(&self) -> Vec<ForwardingRule> {
        self.rules.lock().clone()
    }

    pub fn members(&self) -> Vec<ChannelMember> {
        self.members.lock().clone()
    }

    /// This agent's current self-description, published via `MemberInfo`.
    pub fn member_info(&self) -> ChannelMember {
        ChannelMember {
            id: self.self_id(),
            name: self.self_name.clone(),
            forwarding_rules: self.rules(),
        }
    }

    /// Applies an incoming `ChannelState`. Returns `true` if any rule's
    /// `valid` flag changed, in which case the caller must re-publish
    /// `MemberInfo`.
    pub fn apply(&self, info: ChannelStateInfo) -> bool {
        *self.self_id.lock() = info.your_id;
        *self.members.lock() = info.current_members.clone();

        let mut changed = false;
        let mut rules = self.rules.lock();
        for rule in rules.iter_mut() {
            let valid = info
                .current_members
                .iter()
                .any(|m| m.name == rule.remote_client);
            if valid != rule.valid {
                rule.valid = valid;
                changed = true;
            }
        }
        drop(rules);

        let _ = self.initialized_tx.send(true);
        changed
    }

    /// Resolves once the first `ChannelState` has been applied.
    pub async fn wait_until_initialized(&self) {
        let mut rx = self.initialized_rx.clone();
        if *rx.borrow() {
            return;
        }
        let _ = rx.changed().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn member(name: &str) -> ChannelMember {
        ChannelMember {
            id: Uuid::new_v4(),
            name: name.to_string(),
            forwarding_rules: vec![],
        }
    }

    #[test]
    fn rule_validity_tracks_peer_presence() {
        let state = StateManager::new(
            Uuid::new_v4(),
            "a".into(),
            vec![ForwardingRule::new(8080, "b".into(), 80)],
        );

        let changed = state.apply(ChannelStateInfo {
            your_id: Uuid::new_v4(),
            current_members: vec![member("a"), member("b")],
        });
        assert!(changed);
        assert!(state.rules()[0].valid);

        let changed = state.apply(ChannelStateInfo {
            your_id: state.self_id(),
            current_members: vec![member("a")],
        });
        assert!(changed);
        assert!(!state.rules()[0].valid);
    }

    #[tokio::test]
    async fn initialization_latch_completes_once() {
        let state = StateManager::new(Uuid::new_v4(), "a".into(), vec![]);
        state.apply(ChannelStateInfo {
            your_id: Uuid::new_v4(),
            current_members: vec![],
        });
        state.wait_until_initialized().await;
    }
}
