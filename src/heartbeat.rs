//! Peer liveness tracking (spec §4.1): dual front/back ping streams per
//! peer, so a slow-but-alive backend network doesn't falsely mark a node
//! down on the client-facing side, and vice versa.
//!
//! Grounded on the teacher's `client/pull.rs` use of `tokio::time::interval`
//! for periodic background work, and on `cluster_map.rs::MapCache` for the
//! "read-mostly, replaced wholesale" state-sharing pattern.

use std::collections::HashMap;

use crate::types::NodeId;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Link {
    Front,
    Back,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PeerHealth {
    Up,
    /// No pong on this link within the grace period; not yet reported down.
    Suspect,
    Down,
}

struct LinkState {
    last_ping_sent: i64,
    last_pong_received: Option<i64>,
}

impl LinkState {
    fn new(now: i64) -> Self {
        Self { last_ping_sent: now, last_pong_received: Some(now) }
    }

    fn health(&self, now: i64, suspect_after: i64, down_after: i64) -> PeerHealth {
        let since_pong = self.last_pong_received.map(|t| now - t).unwrap_or(i64::MAX);
        if since_pong >= down_after {
            PeerHealth::Down
        } else if since_pong >= suspect_after {
            PeerHealth::Suspect
        } else {
            PeerHealth::Up
        }
    }
}

struct PeerState {
    front: LinkState,
    back: LinkState,
}

/// Tracks liveness of every peer this node has an active link to. A peer
/// counts as down for cluster-map-report purposes only once *both* links
/// have gone silent past `down_after` (spec §4.1: "a peer is reported down
/// only when both its front and back links have gone silent, since a
/// one-sided network partition should not unilaterally evict a healthy
/// peer").
pub struct HeartbeatTracker {
    peers: HashMap<NodeId, PeerState>,
    suspect_after: i64,
    down_after: i64,
}

impl HeartbeatTracker {
    pub fn new(suspect_after: i64, down_after: i64) -> Self {
        Self { peers: HashMap::new(), suspect_after, down_after }
    }

    pub fn note_ping_sent(&mut self, peer: NodeId, link: Link, now: i64) {
        let state = self.peers.entry(peer).or_insert_with(|| PeerState {
            front: LinkState::new(now),
            back: LinkState::new(now),
        });
        let link_state = match link {
            Link::Front => &mut state.front,
            Link::Back => &mut state.back,
        };
        link_state.last_ping_sent = now;
    }

    pub fn note_pong_received(&mut self, peer: NodeId, link: Link, now: i64) {
        let state = self.peers.entry(peer).or_insert_with(|| PeerState {
            front: LinkState::new(now),
            back: LinkState::new(now),
        });
        let link_state = match link {
            Link::Front => &mut state.front,
            Link::Back => &mut state.back,
        };
        link_state.last_pong_received = Some(now);
    }

    pub fn link_health(&self, peer: NodeId, link: Link, now: i64) -> PeerHealth {
        match self.peers.get(&peer) {
            None => PeerHealth::Up, // never pinged yet: assume up until proven otherwise
            Some(state) => {
                let link_state = match link {
                    Link::Front => &state.front,
                    Link::Back => &state.back,
                };
                link_state.health(now, self.suspect_after, self.down_after)
            }
        }
    }

    /// Combined liveness used to decide whether to report a peer down to
    /// the monitor (spec §4.1).
    pub fn overall_health(&self, peer: NodeId, now: i64) -> PeerHealth {
        let front = self.link_health(peer, Link::Front, now);
        let back = self.link_health(peer, Link::Back, now);
        if front == PeerHealth::Down && back == PeerHealth::Down {
            PeerHealth::Down
        } else if front == PeerHealth::Up && back == PeerHealth::Up {
            PeerHealth::Up
        } else {
            PeerHealth::Suspect
        }
    }

    /// Every peer whose combined liveness is `Down`, a candidate set for a
    /// down-report message to the monitor quorum.
    pub fn down_peers(&self, now: i64) -> Vec<NodeId> {
        self.peers
            .keys()
            .copied()
            .filter(|&peer| self.overall_health(peer, now) == PeerHealth::Down)
            .collect()
    }

    pub fn forget(&mut self, peer: NodeId) {
        self.peers.remove(&peer);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn peer_starts_up_and_requires_silence_on_both_links_to_report_down() {
        let mut tracker = HeartbeatTracker::new(10, 30);
        tracker.note_ping_sent(7, Link::Front, 0);
        tracker.note_pong_received(7, Link::Front, 0);
        tracker.note_ping_sent(7, Link::Back, 0);
        tracker.note_pong_received(7, Link::Back, 0);
        assert_eq!(tracker.overall_health(7, 0), PeerHealth::Up);

        // Back link goes silent, front stays healthy: not reported down.
        assert_eq!(tracker.overall_health(7, 40), PeerHealth::Suspect);
        assert!(tracker.down_peers(40).is_empty());
    }

    #[test]
    fn both_links_silent_marks_peer_down() {
        let mut tracker = HeartbeatTracker::new(10, 30);
        tracker.note_ping_sent(7, Link::Front, 0);
        tracker.note_pong_received(7, Link::Front, 0);
        tracker.note_ping_sent(7, Link::Back, 0);
        tracker.note_pong_received(7, Link::Back, 0);
        assert_eq!(tracker.overall_health(7, 35), PeerHealth::Down);
        assert_eq!(tracker.down_peers(35), vec![7]);
    }

    #[test]
    fn forgetting_a_peer_drops_its_state() {
        let mut tracker = HeartbeatTracker::new(10, 30);
        tracker.note_pong_received(7, Link::Front, 0);
        tracker.forget(7);
        assert_eq!(tracker.overall_health(7, 0), PeerHealth::Up); // unknown peer defaults up
    }
}
