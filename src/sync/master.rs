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

use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
};

use log::{debug, info, warn};

use crate::{
    crypto::Hash256,
    net::{LedgerData, LedgerItemType, PeerDirectoryPtr, PeerPtr},
    store::ObjectStore,
    sync::ledger::{LedgerAcquire, LedgerAcquirePtr},
};

/// Registry and deduplicator of active ledger acquisitions, keyed by the
/// target ledger hash. At most one in-flight job per hash.
#[derive(Clone)]
pub struct AcquireMaster {
    objects: ObjectStore,
    directory: PeerDirectoryPtr,
    ledgers: Arc<Mutex<HashMap<Hash256, LedgerAcquirePtr>>>,
}

impl AcquireMaster {
    pub fn new(objects: ObjectStore, directory: PeerDirectoryPtr) -> Self {
        Self { objects, directory, ledgers: Arc::new(Mutex::new(HashMap::new())) }
    }

    /// Find the job for `hash`, creating and starting it if absent.
    pub fn find_create(&self, hash: Hash256, now_ms: u64) -> LedgerAcquirePtr {
        assert!(!hash.is_zero());
        let acquire = {
            let mut ledgers = self.ledgers.lock().unwrap();
            if let Some(existing) = ledgers.get(&hash) {
                return existing.clone()
            }
            let acquire = LedgerAcquire::new(hash, self.objects.clone(), self.directory.clone());
            ledgers.insert(hash, acquire.clone());
            acquire
        };
        acquire.start(now_ms);
        acquire
    }

    pub fn find(&self, hash: &Hash256) -> Option<LedgerAcquirePtr> {
        self.ledgers.lock().unwrap().get(hash).cloned()
    }

    pub fn has_ledger(&self, hash: &Hash256) -> bool {
        self.ledgers.lock().unwrap().contains_key(hash)
    }

    pub fn drop_ledger(&self, hash: &Hash256) {
        self.ledgers.lock().unwrap().remove(hash);
    }

    /// Service every job's timer.
    pub fn tick(&self, now_ms: u64) {
        let jobs: Vec<LedgerAcquirePtr> =
            self.ledgers.lock().unwrap().values().cloned().collect();
        for job in jobs {
            job.tick(now_ms);
        }
    }

    /// Route a `LedgerData` reply to the job acquiring that ledger.
    /// Returns false when no such job is active or the data is unusable.
    pub fn got_ledger_data(&self, data: &LedgerData, from: Option<PeerPtr>) -> bool {
        let Some(acquire) = self.find(&data.ledger_hash) else {
            debug!(
                target: "meridian::sync::master",
                "Data for ledger we are not acquiring: {}", data.ledger_hash
            );
            return false
        };

        match data.itype {
            LedgerItemType::Base => {
                if data.nodes.is_empty() {
                    warn!(target: "meridian::sync::master", "Empty base reply");
                    return false
                }
                if !acquire.take_base(&data.nodes[0].body) {
                    warn!(target: "meridian::sync::master", "Invalid base reply");
                    if let Some(peer) = &from {
                        peer.punish("invalid ledger base");
                    }
                    return false
                }
                if data.nodes.len() > 1 && !acquire.take_root_node(&data.nodes[1].body, false) {
                    debug!(target: "meridian::sync::master", "Embedded state root unusable");
                }
                if data.nodes.len() > 2 && !acquire.take_root_node(&data.nodes[2].body, true) {
                    debug!(target: "meridian::sync::master", "Embedded tx root unusable");
                }
                acquire.trigger_requests(from.as_ref());
                true
            }

            LedgerItemType::TxNode | LedgerItemType::AsNode => {
                if data.nodes.is_empty() {
                    info!(target: "meridian::sync::master", "Reply carries no nodes");
                    return false
                }
                let ids: Vec<Vec<u8>> = data.nodes.iter().map(|n| n.id.clone()).collect();
                let bodies: Vec<Vec<u8>> = data.nodes.iter().map(|n| n.body.clone()).collect();

                let accepted = if data.itype == LedgerItemType::TxNode {
                    acquire.take_tx_nodes(&ids, &bodies)
                } else {
                    acquire.take_as_nodes(&ids, &bodies)
                };
                if !accepted {
                    if let Some(peer) = &from {
                        peer.punish("bad ledger node data");
                    }
                    return false
                }
                acquire.trigger_requests(from.as_ref());
                true
            }

            LedgerItemType::TxCandidate => {
                // Candidate sets belong to the consensus round, not here
                false
            }
        }
    }
}
