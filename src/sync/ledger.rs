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

//! Acquisition of one full ledger from peers: the base header plus the
//! transaction and account-state maps, pulled node batch by node batch.

use std::sync::{Arc, Mutex};

use log::{debug, trace, warn};

use crate::{
    crypto::Hash256,
    ledger::{Ledger, LedgerHeader},
    net::{GetLedger, LedgerItemType, PeerDirectoryPtr, PeerMessage, PeerPtr},
    shamap::{ShaMap, SyncFilter},
    store::{ObjectKind, ObjectStore, StateTreeFilter, TxTreeFilter},
    sync::peer_set::{PeerSetState, TimerEvent},
};

pub const LEDGER_ACQUIRE_TIMEOUT_MS: u64 = 750;

/// Consecutive no-progress timeouts after which the job fails
pub const LEDGER_ACQUIRE_MAX_TIMEOUTS: u32 = 6;

/// Missing-node batch cap per request
const NODE_BATCH: usize = 128;

pub type LedgerAcquirePtr = Arc<LedgerAcquire>;
pub type OnComplete = Box<dyn FnOnce(LedgerAcquirePtr) + Send>;

struct Inner {
    set: PeerSetState,
    ledger: Option<Ledger>,
    have_base: bool,
    have_txs: bool,
    have_state: bool,
    aborted: bool,
    signaled: bool,
    on_complete: Vec<OnComplete>,
}

/// A ledger we are trying to acquire.
pub struct LedgerAcquire {
    objects: ObjectStore,
    directory: PeerDirectoryPtr,
    inner: Mutex<Inner>,
}

impl LedgerAcquire {
    pub fn new(hash: Hash256, objects: ObjectStore, directory: PeerDirectoryPtr) -> LedgerAcquirePtr {
        trace!(target: "meridian::sync::ledger", "Acquiring ledger {hash}");
        Arc::new(Self {
            objects,
            directory,
            inner: Mutex::new(Inner {
                set: PeerSetState::new(hash, LEDGER_ACQUIRE_TIMEOUT_MS),
                ledger: None,
                have_base: false,
                have_txs: false,
                have_state: false,
                aborted: false,
                signaled: false,
                on_complete: vec![],
            }),
        })
    }

    pub fn target(&self) -> Hash256 {
        self.inner.lock().unwrap().set.target()
    }

    pub fn is_complete(&self) -> bool {
        self.inner.lock().unwrap().set.is_complete()
    }

    pub fn is_failed(&self) -> bool {
        self.inner.lock().unwrap().set.is_failed()
    }

    pub fn timeouts(&self) -> u32 {
        self.inner.lock().unwrap().set.timeouts()
    }

    pub fn have_base(&self) -> bool {
        self.inner.lock().unwrap().have_base
    }

    pub fn have_tx_set(&self) -> bool {
        self.inner.lock().unwrap().have_txs
    }

    pub fn have_state(&self) -> bool {
        self.inner.lock().unwrap().have_state
    }

    /// The assembled ledger, once complete.
    pub fn ledger(&self) -> Option<Ledger> {
        self.inner.lock().unwrap().ledger.clone()
    }

    pub fn abort(&self) {
        self.inner.lock().unwrap().aborted = true;
    }

    /// Register a completion callback. A job that already finished invokes
    /// it inline.
    pub fn add_on_complete(self: &Arc<Self>, callback: OnComplete) {
        {
            let mut inner = self.inner.lock().unwrap();
            if !inner.signaled {
                inner.on_complete.push(callback);
                return
            }
        }
        callback(self.clone());
    }

    /// Kick off the job: local fetch first, then the peer set.
    pub fn start(self: &Arc<Self>, now_ms: u64) {
        {
            let mut inner = self.inner.lock().unwrap();
            self.try_local(&mut inner);
            if !inner.set.is_terminal() {
                self.add_peers(&mut inner);
                self.trigger(&mut inner, None);
                inner.set.reset_timer(now_ms);
            }
        }
        self.maybe_signal();
    }

    /// A peer advertised the target; add it as a source and ask it.
    pub fn peer_has(self: &Arc<Self>, peer: PeerPtr) {
        {
            let mut inner = self.inner.lock().unwrap();
            if !inner.set.insert_peer(peer.clone()) {
                return
            }
            self.trigger(&mut inner, Some(&peer));
        }
        self.maybe_signal();
    }

    pub fn bad_peer(&self, peer: &PeerPtr) {
        self.inner.lock().unwrap().set.remove_peer(&peer.id());
    }

    /// Timer service entrypoint.
    pub fn tick(self: &Arc<Self>, now_ms: u64) {
        {
            let mut inner = self.inner.lock().unwrap();
            if inner.aborted {
                return
            }
            match inner.set.fire_timer(now_ms) {
                None => return,
                Some(TimerEvent::Progress) => {}
                Some(TimerEvent::NoProgress(count)) => {
                    if count > LEDGER_ACQUIRE_MAX_TIMEOUTS {
                        warn!(
                            target: "meridian::sync::ledger",
                            "Ledger {} acquisition failed after {} timeouts",
                            inner.set.target(), count
                        );
                        inner.set.set_failed();
                    } else if inner.set.peer_count() == 0 {
                        self.add_peers(&mut inner);
                    } else {
                        self.trigger(&mut inner, None);
                    }
                }
            }
            if !inner.set.is_terminal() {
                inner.set.reset_timer(now_ms);
            }
        }
        self.maybe_signal();
    }

    fn add_peers(&self, inner: &mut Inner) {
        let target = inner.set.target();
        let all = self.directory.peers();
        let mut found = false;
        for peer in &all {
            if peer.has_ledger(&target) {
                found = true;
                inner.set.insert_peer(peer.clone());
            }
        }
        if !found {
            for peer in all {
                inner.set.insert_peer(peer);
            }
        }
    }

    /// Attempt to assemble from the hashed-object store before asking the
    /// network. Returns true when nothing more is needed.
    fn try_local(&self, inner: &mut Inner) -> bool {
        let target = inner.set.target();
        if let Some(body) = self.objects.retrieve(&target) {
            match LedgerHeader::from_bytes(&body) {
                Ok(header) if header.hash() == target => {
                    self.accept_base(inner, header);
                }
                _ => {
                    warn!(target: "meridian::sync::ledger", "Corrupt stored header for {target}");
                    return false
                }
            }
            self.fetch_roots_local(inner);
            // Absorb any locally held map nodes
            self.update_maps(inner);
        }
        inner.have_base && inner.have_txs && inner.have_state
    }

    /// Pull the map root nodes from the object store when present.
    fn fetch_roots_local(&self, inner: &mut Inner) {
        let Some(mut ledger) = inner.ledger.take() else { return };
        let header = ledger.header().clone();

        if ledger.tx_map().is_synching() && !ledger.tx_map().root_known() {
            if let Some(body) = self.objects.retrieve(&header.tx_set_hash) {
                let mut filter = self.tree_filter(true, header.seq);
                ledger.tx_map_mut().add_root_node(header.tx_set_hash, &body, filter.as_mut());
            }
        }
        if ledger.state_map().is_synching() && !ledger.state_map().root_known() {
            if let Some(body) = self.objects.retrieve(&header.state_hash) {
                let mut filter = self.tree_filter(false, header.seq);
                ledger.state_map_mut().add_root_node(header.state_hash, &body, filter.as_mut());
            }
        }
        inner.ledger = Some(ledger);
    }

    fn accept_base(&self, inner: &mut Inner, header: LedgerHeader) {
        if header.tx_set_hash.is_zero() {
            inner.have_txs = true;
        }
        if header.state_hash.is_zero() {
            inner.have_state = true;
        }
        inner.ledger = Some(Ledger::from_header(header));
        inner.have_base = true;
        inner.set.note_progress();
    }

    /// Parse and validate a received base header. A hash mismatch aborts
    /// the job.
    pub fn take_base(self: &Arc<Self>, data: &[u8]) -> bool {
        let outcome = {
            let mut inner = self.inner.lock().unwrap();
            if inner.have_base {
                true
            } else {
                let target = inner.set.target();
                match LedgerHeader::from_bytes(data) {
                    Ok(header) if header.hash() == target => {
                        self.objects.store(ObjectKind::Ledger, header.seq, data, target);
                        self.accept_base(&mut inner, header);
                        true
                    }
                    _ => {
                        warn!(target: "meridian::sync::ledger", "Acquire hash mismatch for {target}");
                        inner.set.set_failed();
                        false
                    }
                }
            }
        };
        self.maybe_signal();
        outcome
    }

    /// Ingest transaction-map nodes.
    pub fn take_tx_nodes(self: &Arc<Self>, ids: &[Vec<u8>], bodies: &[Vec<u8>]) -> bool {
        self.take_map_nodes(ids, bodies, true)
    }

    /// Ingest account-state-map nodes.
    pub fn take_as_nodes(self: &Arc<Self>, ids: &[Vec<u8>], bodies: &[Vec<u8>]) -> bool {
        self.take_map_nodes(ids, bodies, false)
    }

    fn take_map_nodes(self: &Arc<Self>, ids: &[Vec<u8>], bodies: &[Vec<u8>], tx_tree: bool) -> bool {
        if ids.len() != bodies.len() {
            return false
        }
        let ok = {
            let mut inner = self.inner.lock().unwrap();
            if !inner.have_base {
                debug!(target: "meridian::sync::ledger", "Node data before base");
                return false
            }
            let Some(mut ledger) = inner.ledger.take() else { return false };
            let header = ledger.header().clone();
            let mut ok = true;

            {
                let mut filter = self.tree_filter(tx_tree, header.seq);
                let (map, expected_root) = if tx_tree {
                    (ledger.tx_map_mut(), header.tx_set_hash)
                } else {
                    (ledger.state_map_mut(), header.state_hash)
                };

                for (id, body) in ids.iter().zip(bodies.iter()) {
                    let accepted = if ShaMap::is_root_id(id) {
                        map.add_root_node(expected_root, body, filter.as_mut())
                    } else {
                        map.add_known_node(id, body, filter.as_mut())
                    };
                    if !accepted {
                        warn!(target: "meridian::sync::ledger", "Rejected map node");
                        ok = false;
                        break
                    }
                }
            }

            inner.ledger = Some(ledger);
            if ok {
                inner.set.note_progress();
                self.update_maps(&mut inner);
            }
            ok
        };
        self.maybe_signal();
        ok
    }

    /// Accept a map root embedded in a base reply.
    pub fn take_root_node(self: &Arc<Self>, data: &[u8], tx_tree: bool) -> bool {
        let id = ShaMap::root_node_id();
        self.take_map_nodes(&[id], &[data.to_vec()], tx_tree)
    }

    fn tree_filter(&self, tx_tree: bool, ledger_seq: u32) -> Box<dyn SyncFilter> {
        if tx_tree {
            Box::new(TxTreeFilter { store: self.objects.clone(), ledger_seq })
        } else {
            Box::new(StateTreeFilter { store: self.objects.clone(), ledger_seq })
        }
    }

    /// Refresh the three completion bits from the maps, absorbing locally
    /// available nodes through the store filter.
    fn update_maps(&self, inner: &mut Inner) {
        let Some(mut ledger) = inner.ledger.take() else { return };
        let seq = ledger.header().seq;

        if !inner.have_txs && ledger.tx_map().root_known() {
            let mut filter = self.tree_filter(true, seq);
            let missing = ledger.tx_map_mut().missing_nodes(1, filter.as_mut());
            if missing.is_empty() {
                if ledger.tx_map().is_valid() {
                    ledger.tx_map_mut().clear_synching();
                    inner.have_txs = true;
                } else {
                    inner.set.set_failed();
                }
            }
        }

        if !inner.have_state && ledger.state_map().root_known() {
            let mut filter = self.tree_filter(false, seq);
            let missing = ledger.state_map_mut().missing_nodes(1, filter.as_mut());
            if missing.is_empty() {
                if ledger.state_map().is_valid() {
                    ledger.state_map_mut().clear_synching();
                    inner.have_state = true;
                } else {
                    inner.set.set_failed();
                }
            }
        }

        inner.ledger = Some(ledger);
        if inner.have_base && inner.have_txs && inner.have_state {
            inner.set.set_complete();
        }
    }

    /// Issue the next requests for whatever is still missing. `peer`
    /// selects a single target; None broadcasts to the job's peer set.
    pub fn trigger_requests(self: &Arc<Self>, peer: Option<&PeerPtr>) {
        {
            let mut inner = self.inner.lock().unwrap();
            self.trigger(&mut inner, peer);
        }
        self.maybe_signal();
    }

    fn trigger(&self, inner: &mut Inner, peer: Option<&PeerPtr>) {
        if inner.aborted || inner.set.is_terminal() {
            return
        }
        let target = inner.set.target();

        if !inner.have_base {
            trace!(target: "meridian::sync::ledger", "Requesting base for {target}");
            let message = PeerMessage::GetLedger(GetLedger {
                ledger_hash: target,
                ledger_seq: 0,
                itype: LedgerItemType::Base,
                node_ids: vec![],
            });
            inner.set.send_request(&message, peer);
            return
        }

        self.update_maps(inner);
        let Some(mut ledger) = inner.ledger.take() else { return };
        let seq = ledger.header().seq;

        if !inner.have_txs {
            let node_ids = if ledger.tx_map().root_known() {
                let mut filter = self.tree_filter(true, seq);
                ledger.tx_map_mut().missing_nodes(NODE_BATCH, filter.as_mut())
            } else {
                vec![ShaMap::root_node_id()]
            };
            if !node_ids.is_empty() {
                let message = PeerMessage::GetLedger(GetLedger {
                    ledger_hash: target,
                    ledger_seq: seq,
                    itype: LedgerItemType::TxNode,
                    node_ids,
                });
                inner.set.send_request(&message, peer);
            }
        }

        if !inner.have_state {
            let node_ids = if ledger.state_map().root_known() {
                let mut filter = self.tree_filter(false, seq);
                ledger.state_map_mut().missing_nodes(NODE_BATCH, filter.as_mut())
            } else {
                vec![ShaMap::root_node_id()]
            };
            if !node_ids.is_empty() {
                let message = PeerMessage::GetLedger(GetLedger {
                    ledger_hash: target,
                    ledger_seq: seq,
                    itype: LedgerItemType::AsNode,
                    node_ids,
                });
                inner.set.send_request(&message, peer);
            }
        }

        inner.ledger = Some(ledger);
        self.update_maps(inner);
    }

    /// Fire completion callbacks exactly once after the job goes terminal.
    fn maybe_signal(self: &Arc<Self>) {
        let callbacks = {
            let mut inner = self.inner.lock().unwrap();
            if !inner.set.is_terminal() || inner.signaled {
                return
            }
            inner.signaled = true;
            trace!(
                target: "meridian::sync::ledger",
                "Done acquiring ledger {} complete={} failed={}",
                inner.set.target(), inner.set.is_complete(), inner.set.is_failed()
            );
            std::mem::take(&mut inner.on_complete)
        };
        for callback in callbacks {
            callback(self.clone());
        }
    }
}
