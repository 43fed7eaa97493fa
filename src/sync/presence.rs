//! Presence: ephemeral per-participant state.
//!
//! Each participant owns one state entry tagged with its client id and a
//! clock it bumps on every change. Entries are never cached. A peer's entry
//! goes away when it announces a `None` state, when the relay reports its
//! connection closed, or when nothing was heard from it within the timeout.

use std::collections::BTreeMap;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

use super::transport::WireMessage;
use crate::state::Peers;

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PresenceState {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub active_feature: Option<String>,
}

#[derive(Debug)]
struct Peer {
    clock: u64,
    state: PresenceState,
    seen: Instant,
}

#[derive(Debug)]
pub struct Awareness {
    client: u64,
    clock: u64,
    local: Option<PresenceState>,
    peers: BTreeMap<u64, Peer>,
}

impl Awareness {
    pub fn new(client: u64) -> Self {
        Self {
            client,
            clock: 0,
            local: None,
            peers: BTreeMap::new(),
        }
    }

    pub fn client(&self) -> u64 {
        self.client
    }

    /// Replace the local state. Returns the broadcast message if it changed.
    pub fn set_local(&mut self, state: PresenceState) -> Option<WireMessage> {
        if self.local.as_ref() == Some(&state) {
            return None;
        }
        self.local = Some(state);
        self.clock += 1;
        Some(self.encode_local())
    }

    /// Announce the current local state again, e.g. after reconnecting.
    pub fn encode_local(&self) -> WireMessage {
        WireMessage::Awareness {
            client: self.client,
            clock: self.clock,
            state: self.local.clone(),
        }
    }

    /// Announce that this participant is gone.
    pub fn leave(&mut self) -> WireMessage {
        self.local = None;
        self.clock += 1;
        self.encode_local()
    }

    /// Merge a peer's announcement. Returns whether the peer map changed.
    pub fn apply_remote(
        &mut self,
        client: u64,
        clock: u64,
        state: Option<PresenceState>,
        now: Instant,
    ) -> bool {
        if client == self.client {
            return false;
        }
        let known = self.peers.get(&client).map(|p| p.clock);
        match known {
            Some(known) if clock < known => return false,
            // A removal at the same clock still applies
            Some(known) if clock == known && state.is_some() => {
                if let Some(peer) = self.peers.get_mut(&client) {
                    peer.seen = now;
                }
                return false;
            }
            _ => {}
        }

        match state {
            Some(state) => {
                let changed = self.peers.get(&client).is_none_or(|p| p.state != state);
                self.peers.insert(
                    client,
                    Peer {
                        clock,
                        state,
                        seen: now,
                    },
                );
                changed
            }
            None => self.peers.remove(&client).is_some(),
        }
    }

    /// Drop peers not heard from within `timeout`. Returns whether any were dropped.
    pub fn expire(&mut self, now: Instant, timeout: Duration) -> bool {
        let before = self.peers.len();
        self.peers
            .retain(|_, peer| now.saturating_duration_since(peer.seen) < timeout);
        self.peers.len() != before
    }

    pub fn peers(&self) -> Peers {
        self.peers
            .iter()
            .map(|(client, peer)| (*client, peer.state.clone()))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn on(id: &str) -> PresenceState {
        PresenceState {
            active_feature: Some(id.into()),
        }
    }

    #[test]
    fn test_set_local_only_broadcasts_changes() {
        let mut awareness = Awareness::new(1);
        let msg = awareness.set_local(on("a")).unwrap();
        assert_eq!(
            msg,
            WireMessage::Awareness {
                client: 1,
                clock: 1,
                state: Some(on("a")),
            }
        );
        assert!(awareness.set_local(on("a")).is_none());
    }

    #[test]
    fn test_stale_clock_is_ignored() {
        let now = Instant::now();
        let mut awareness = Awareness::new(1);
        assert!(awareness.apply_remote(2, 3, Some(on("a")), now));
        assert!(!awareness.apply_remote(2, 2, Some(on("b")), now));
        assert_eq!(awareness.peers()[&2], on("a"));
        assert!(!awareness.apply_remote(1, 9, Some(on("own")), now));
    }

    #[test]
    fn test_removal_clears_peer() {
        let now = Instant::now();
        let mut awareness = Awareness::new(1);
        awareness.apply_remote(2, 1, Some(on("a")), now);
        assert!(awareness.apply_remote(2, 1, None, now));
        assert!(awareness.peers().is_empty());
    }

    #[test]
    fn test_silent_peers_expire() {
        let start = Instant::now();
        let mut awareness = Awareness::new(1);
        awareness.apply_remote(2, 1, Some(on("a")), start);
        awareness.apply_remote(3, 1, Some(on("b")), start + Duration::from_secs(20));

        assert!(awareness.expire(start + Duration::from_secs(31), Duration::from_secs(30)));
        assert_eq!(awareness.peers().keys().copied().collect::<Vec<_>>(), vec![3]);
    }

    #[test]
    fn test_renewal_keeps_peer_alive() {
        let start = Instant::now();
        let mut awareness = Awareness::new(1);
        awareness.apply_remote(2, 1, Some(on("a")), start);
        // Same clock, same state: only refreshes the timestamp
        assert!(!awareness.apply_remote(2, 1, Some(on("a")), start + Duration::from_secs(25)));
        assert!(!awareness.expire(start + Duration::from_secs(40), Duration::from_secs(30)));
    }
}
