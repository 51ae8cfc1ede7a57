/* This file is part of Meridian (https://meridian.network)
 *
 * Copyright (C) 2020-2024 Meridian developers
 *
 * This program is free software: you can redistribute it and/or modify
 * it under the terms of the GNU Affero General Public License as
 * published by the Free Software Foundation, either version 3 of the
 * License, or (at your option) any later version.
 *
 * This program is distributed in the hope that it will be useful,
 * but WITHOUT ANY WARRANTY; without even the implied warranty of
 * MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
 * GNU Affero General Public License for more details.
 *
 * You should have received a copy of the GNU Affero General Public License
 * along with this program.  If not, see <https://www.gnu.org/licenses/>.
 */

//! Shared retry coordinator for content-by-hash acquisition jobs. Holds the
//! rotating peer set, the single-shot timeout and the progress flag; the
//! content-specific logic lives in the job that embeds this state. No
//! inheritance, no downcasts.

use std::collections::HashMap;

use log::warn;

use crate::{
    crypto::{Hash256, NodeId},
    net::{PeerMessage, PeerPtr},
};

/// What a timer fire observed.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TimerEvent {
    /// Data arrived since the last fire
    Progress,
    /// Nothing arrived; carries the consecutive no-progress count
    NoProgress(u32),
}

struct PeerEntry {
    handle: PeerPtr,
    requests: u32,
}

/// Timed, retriable request state for content addressed by `target`.
pub struct PeerSetState {
    target: Hash256,
    timeout_ms: u64,
    peers: HashMap<NodeId, PeerEntry>,
    timeouts: u32,
    complete: bool,
    failed: bool,
    progress: bool,
    deadline: Option<u64>,
}

impl PeerSetState {
    pub fn new(target: Hash256, timeout_ms: u64) -> Self {
        assert!(timeout_ms > 10 && timeout_ms < 30_000);
        Self {
            target,
            timeout_ms,
            peers: HashMap::new(),
            timeouts: 0,
            complete: false,
            failed: false,
            progress: true,
            deadline: None,
        }
    }

    pub fn target(&self) -> Hash256 {
        self.target
    }

    /// Add a peer as a source. Returns true when it was not yet present,
    /// in which case the job should issue it an immediate request.
    pub fn insert_peer(&mut self, peer: PeerPtr) -> bool {
        let id = peer.id();
        if self.peers.contains_key(&id) {
            return false
        }
        self.peers.insert(id, PeerEntry { handle: peer, requests: 0 });
        true
    }

    pub fn remove_peer(&mut self, id: &NodeId) {
        self.peers.remove(id);
    }

    pub fn peer_count(&self) -> usize {
        self.peers.len()
    }

    /// Adopt another job's peer set, dropping our own.
    pub fn take_peers_from(&mut self, other: &PeerSetState) -> usize {
        self.peers.clear();
        for (id, entry) in &other.peers {
            self.peers.insert(*id, PeerEntry { handle: entry.handle.clone(), requests: 0 });
        }
        self.peers.len()
    }

    /// Send a request to one selected peer, or to every peer in the set.
    pub fn send_request(&mut self, message: &PeerMessage, peer: Option<&PeerPtr>) {
        if let Some(peer) = peer {
            peer.send(message);
            if let Some(entry) = self.peers.get_mut(&peer.id()) {
                entry.requests += 1;
            }
            return
        }
        for entry in self.peers.values_mut() {
            entry.handle.send(message);
            entry.requests += 1;
        }
    }

    // ===============
    // Timer machinery
    // ===============

    /// Arm the single-shot timer.
    pub fn reset_timer(&mut self, now_ms: u64) {
        self.deadline = Some(now_ms + self.timeout_ms);
    }

    /// Consume a due timer. After completion or failure all fires are
    /// no-ops. A fire with the progress flag set clears it; one without
    /// increments the consecutive timeout count.
    pub fn fire_timer(&mut self, now_ms: u64) -> Option<TimerEvent> {
        let deadline = self.deadline?;
        if now_ms < deadline || self.complete || self.failed {
            return None
        }
        self.deadline = None;

        if self.progress {
            self.progress = false;
            return Some(TimerEvent::Progress)
        }

        self.timeouts += 1;
        warn!(
            target: "meridian::sync::peer_set",
            "Timeout({}) pc={} acquiring {}", self.timeouts, self.peers.len(), self.target
        );
        Some(TimerEvent::NoProgress(self.timeouts))
    }

    /// Flag that useful data arrived; consumed by the next timer fire.
    pub fn note_progress(&mut self) {
        self.progress = true;
    }

    pub fn timeouts(&self) -> u32 {
        self.timeouts
    }

    pub fn set_complete(&mut self) {
        self.complete = true;
    }

    pub fn set_failed(&mut self) {
        self.failed = true;
    }

    pub fn is_complete(&self) -> bool {
        self.complete
    }

    pub fn is_failed(&self) -> bool {
        self.failed
    }

    pub fn is_terminal(&self) -> bool {
        self.complete || self.failed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::sha512_half;

    struct SinkPeer(NodeId);

    impl crate::net::Peer for SinkPeer {
        fn id(&self) -> NodeId {
            self.0
        }

        fn public_key(&self) -> Vec<u8> {
            vec![]
        }

        fn send(&self, _message: &PeerMessage) {}

        fn has_ledger(&self, _hash: &crate::crypto::Hash256) -> bool {
            false
        }

        fn closed_ledger(&self) -> Option<crate::crypto::Hash256> {
            None
        }

        fn punish(&self, _reason: &str) {}
    }

    #[test]
    fn peer_set_transfer() {
        let mut donor = PeerSetState::new(sha512_half(b"a"), 750);
        for n in 0..3 {
            assert!(donor.insert_peer(std::sync::Arc::new(SinkPeer(NodeId([n; 20])))));
        }
        assert!(!donor.insert_peer(std::sync::Arc::new(SinkPeer(NodeId([0; 20])))));
        assert_eq!(donor.peer_count(), 3);

        let mut taker = PeerSetState::new(sha512_half(b"b"), 750);
        taker.insert_peer(std::sync::Arc::new(SinkPeer(NodeId([9; 20]))));
        assert_eq!(taker.take_peers_from(&donor), 3);
        assert_eq!(taker.peer_count(), 3);

        taker.remove_peer(&NodeId([1; 20]));
        assert_eq!(taker.peer_count(), 2);
    }

    #[test]
    fn timer_counts_no_progress_fires_only() {
        let mut set = PeerSetState::new(sha512_half(b"content"), 750);
        assert!(set.fire_timer(10_000).is_none(), "unarmed timer never fires");

        set.reset_timer(0);
        assert!(set.fire_timer(100).is_none(), "not due yet");

        // Initial progress flag absorbs the first fire
        assert_eq!(set.fire_timer(750), Some(TimerEvent::Progress));
        assert_eq!(set.timeouts(), 0);

        set.reset_timer(750);
        assert_eq!(set.fire_timer(1500), Some(TimerEvent::NoProgress(1)));

        set.reset_timer(1500);
        set.note_progress();
        assert_eq!(set.fire_timer(2250), Some(TimerEvent::Progress));
        assert_eq!(set.timeouts(), 1);

        set.reset_timer(2250);
        set.set_complete();
        assert!(set.fire_timer(3000).is_none(), "terminal sets ignore the timer");
    }
}
