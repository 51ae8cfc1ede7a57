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

//! Acquisition of a single proposed transaction set during consensus.
//! Owned by the round and serialized under its lock.

use log::{trace, warn};

use crate::{
    crypto::Hash256,
    net::{GetLedger, LedgerItemType, PeerMessage, PeerPtr},
    shamap::ShaMap,
    store::{ConsensusSetFilter, ObjectStore},
    sync::peer_set::{PeerSetState, TimerEvent},
};

pub const TX_ACQUIRE_TIMEOUT_MS: u64 = 250;

/// Missing-node batch cap per request
const NODE_BATCH: usize = 256;

/// A proposed transaction set we are trying to acquire.
pub struct TxSetAcquire {
    set: PeerSetState,
    map: ShaMap,
    have_root: bool,
    objects: ObjectStore,
}

impl TxSetAcquire {
    pub fn new(hash: Hash256, objects: ObjectStore, now_ms: u64) -> Self {
        trace!(target: "meridian::sync::txset", "Acquiring transaction set {hash}");
        let mut map = ShaMap::new();
        map.set_synching();
        let mut set = PeerSetState::new(hash, TX_ACQUIRE_TIMEOUT_MS);
        set.reset_timer(now_ms);
        Self { set, map, have_root: false, objects }
    }

    pub fn target(&self) -> Hash256 {
        self.set.target()
    }

    pub fn is_complete(&self) -> bool {
        self.set.is_complete()
    }

    pub fn is_failed(&self) -> bool {
        self.set.is_failed()
    }

    /// The completed set.
    pub fn map(&self) -> &ShaMap {
        &self.map
    }

    pub fn into_map(self) -> ShaMap {
        self.map
    }

    pub fn peer_count(&self) -> usize {
        self.set.peer_count()
    }

    pub fn peer_has(&mut self, peer: PeerPtr) {
        if self.set.insert_peer(peer.clone()) {
            self.trigger(Some(&peer));
        }
    }

    pub fn bad_peer(&mut self, peer: &PeerPtr) {
        self.set.remove_peer(&peer.id());
    }

    /// Timer service. Transaction-set fetches never give up on timeouts;
    /// the round discards them when it ends.
    pub fn tick(&mut self, now_ms: u64) {
        match self.set.fire_timer(now_ms) {
            None => return,
            Some(TimerEvent::Progress) => {}
            Some(TimerEvent::NoProgress(_)) => self.trigger(None),
        }
        if !self.set.is_terminal() {
            self.set.reset_timer(now_ms);
        }
    }

    /// Ingest nodes from a peer. Malformed data demerits the sender.
    pub fn take_nodes(&mut self, ids: &[Vec<u8>], bodies: &[Vec<u8>], from: Option<&PeerPtr>) -> bool {
        if self.set.is_complete() {
            return true
        }
        if self.set.is_failed() || ids.len() != bodies.len() {
            return false
        }

        let target = self.set.target();
        let mut filter = ConsensusSetFilter { store: self.objects.clone() };

        for (id, body) in ids.iter().zip(bodies.iter()) {
            let accepted = if ShaMap::is_root_id(id) {
                if self.have_root {
                    warn!(target: "meridian::sync::txset", "Got root node, already have it");
                    return false
                }
                if self.map.add_root_node(target, body, &mut filter) {
                    self.have_root = true;
                    true
                } else {
                    false
                }
            } else {
                self.map.add_known_node(id, body, &mut filter)
            };

            if !accepted {
                warn!(target: "meridian::sync::txset", "Peer sent junk set node data");
                if let Some(peer) = from {
                    peer.punish("bad tx set node");
                }
                return false
            }
        }

        self.set.note_progress();
        self.trigger(from);
        true
    }

    /// Issue requests for whatever is still missing, or conclude the job.
    pub fn trigger(&mut self, peer: Option<&PeerPtr>) {
        if self.set.is_terminal() {
            return
        }
        let target = self.set.target();

        if !self.have_root {
            let message = PeerMessage::GetLedger(GetLedger {
                ledger_hash: target,
                ledger_seq: 0,
                itype: LedgerItemType::TxCandidate,
                node_ids: vec![ShaMap::root_node_id()],
            });
            self.set.send_request(&message, peer);
            return
        }

        let mut filter = ConsensusSetFilter { store: self.objects.clone() };
        let node_ids = self.map.missing_nodes(NODE_BATCH, &mut filter);
        if node_ids.is_empty() {
            if self.map.is_valid() {
                self.map.clear_synching();
                self.set.set_complete();
            } else {
                self.set.set_failed();
            }
            return
        }

        let message = PeerMessage::GetLedger(GetLedger {
            ledger_hash: target,
            ledger_seq: 0,
            itype: LedgerItemType::TxCandidate,
            node_ids,
        });
        self.set.send_request(&message, peer);
    }
}
