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
    collections::{BTreeMap, HashMap},
    sync::{Arc, Mutex},
};

use log::info;

use crate::{
    crypto::Hash256,
    ledger::Ledger,
    shamap::ShaMap,
    tx::AccountId,
};

struct StoreInner {
    by_hash: HashMap<Hash256, Arc<Ledger>>,
    by_seq: BTreeMap<u32, Hash256>,
    /// Last closed ledger
    closed: Arc<Ledger>,
    /// Open ledger accumulating candidate transactions
    current: Ledger,
    /// txId → (account, ledgerSeq) index, filled on accept
    account_txs: HashMap<Hash256, Vec<(AccountId, u32)>>,
}

/// Ledger registry plus the master open/closed pair.
///
/// The inner mutex is the master-ledger lock: the accept routine installs
/// its results under a single acquisition of it.
#[derive(Clone)]
pub struct LedgerStore {
    inner: Arc<Mutex<StoreInner>>,
}

impl LedgerStore {
    /// Initialize with a closed genesis ledger and fork the first open
    /// ledger from it.
    pub fn new(genesis: Ledger, ledger_seconds: u32, now: u32) -> Self {
        let current = Ledger::child_open(&genesis, ledger_seconds, now);
        let closed = Arc::new(genesis);
        let mut by_hash = HashMap::new();
        let mut by_seq = BTreeMap::new();
        by_hash.insert(closed.hash(), closed.clone());
        by_seq.insert(closed.seq(), closed.hash());

        Self {
            inner: Arc::new(Mutex::new(StoreInner {
                by_hash,
                by_seq,
                closed,
                current,
                account_txs: HashMap::new(),
            })),
        }
    }

    pub fn closed_ledger(&self) -> Arc<Ledger> {
        self.inner.lock().unwrap().closed.clone()
    }

    pub fn get_by_hash(&self, hash: &Hash256) -> Option<Arc<Ledger>> {
        self.inner.lock().unwrap().by_hash.get(hash).cloned()
    }

    pub fn get_by_seq(&self, seq: u32) -> Option<Arc<Ledger>> {
        let inner = self.inner.lock().unwrap();
        let hash = inner.by_seq.get(&seq)?;
        inner.by_hash.get(hash).cloned()
    }

    /// Index a closed ledger obtained from acquisition or acceptance.
    pub fn store_ledger(&self, ledger: Ledger) -> Arc<Ledger> {
        let mut inner = self.inner.lock().unwrap();
        let hash = ledger.hash();
        let entry = inner.by_hash.entry(hash).or_insert_with(|| Arc::new(ledger));
        let entry = entry.clone();
        inner.by_seq.insert(entry.seq(), hash);
        entry
    }

    // =================
    // Open ledger state
    // =================

    pub fn current_seq(&self) -> u32 {
        self.inner.lock().unwrap().current.seq()
    }

    pub fn current_close_time(&self) -> u32 {
        self.inner.lock().unwrap().current.header().close_time
    }

    /// Root hash of the open ledger's transaction set.
    pub fn current_tx_hash(&self) -> Hash256 {
        self.inner.lock().unwrap().current.tx_map().root_hash()
    }

    /// Immutable snapshot of the open ledger's transaction set.
    pub fn current_tx_snapshot(&self) -> ShaMap {
        self.inner.lock().unwrap().current.tx_map().snapshot()
    }

    /// Add a candidate transaction to the open ledger.
    pub fn add_current_tx(&self, tx_id: Hash256, body: Vec<u8>) -> bool {
        let mut inner = self.inner.lock().unwrap();
        inner.current.add_tx(tx_id, body).unwrap_or(false)
    }

    /// Snapshot of the whole open ledger, for applying its transactions
    /// against a freshly built one.
    pub fn current_snapshot(&self) -> Ledger {
        self.inner.lock().unwrap().current.snapshot(false)
    }

    // ==================
    // Master ledger swap
    // ==================

    /// Install a newly accepted ledger and the open ledger forked from it.
    /// One lock acquisition; this is the accept routine's install step.
    pub fn push_ledger(&self, new_closed: Ledger, new_open: Ledger) -> Arc<Ledger> {
        let mut inner = self.inner.lock().unwrap();
        let hash = new_closed.hash();
        let closed = Arc::new(new_closed);
        inner.by_hash.insert(hash, closed.clone());
        inner.by_seq.insert(closed.seq(), hash);
        inner.closed = closed.clone();
        inner.current = new_open;
        info!(
            target: "meridian::ledger::store",
            "Installed closed ledger {} seq {}", hash, closed.seq()
        );
        closed
    }

    /// Jump to a different last-closed ledger (consensus view changed).
    pub fn switch_ledgers(&self, new_closed: Arc<Ledger>, new_open: Ledger) {
        let mut inner = self.inner.lock().unwrap();
        let hash = new_closed.hash();
        inner.by_hash.insert(hash, new_closed.clone());
        inner.by_seq.insert(new_closed.seq(), hash);
        inner.closed = new_closed;
        inner.current = new_open;
    }

    // =========================
    // AccountTransactions index
    // =========================

    pub fn record_account_tx(&self, tx_id: Hash256, accounts: &[AccountId], ledger_seq: u32) {
        if accounts.is_empty() {
            return
        }
        let mut inner = self.inner.lock().unwrap();
        let entry = inner.account_txs.entry(tx_id).or_default();
        for account in accounts {
            entry.push((*account, ledger_seq));
        }
    }

    pub fn account_txs(&self, tx_id: &Hash256) -> Vec<(AccountId, u32)> {
        self.inner.lock().unwrap().account_txs.get(tx_id).cloned().unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::content_hash;

    #[test]
    fn push_and_lookup() {
        let genesis = Ledger::genesis(1_000_000, 700_000_000, 30);
        let genesis_hash = genesis.hash();
        let store = LedgerStore::new(genesis, 15, 700_000_000);

        assert_eq!(store.closed_ledger().hash(), genesis_hash);
        assert_eq!(store.current_seq(), 1);
        assert!(store.current_tx_hash().is_zero());

        let body = b"payment".to_vec();
        let tx_id = content_hash(&body);
        assert!(store.add_current_tx(tx_id, body));
        assert!(!store.current_tx_hash().is_zero());

        // Build and install the next closed ledger
        let prev = store.closed_ledger();
        let mut next = Ledger::child_open(&prev, 15, 700_000_000);
        next.set_accepted(700_000_015, 30, true);
        let next_open = Ledger::child_open(&next, 15, 700_000_015);
        let installed = store.push_ledger(next, next_open);

        assert_eq!(store.closed_ledger().hash(), installed.hash());
        assert_eq!(store.get_by_seq(1).unwrap().hash(), installed.hash());
        assert!(store.get_by_hash(&genesis_hash).is_some());
        assert_eq!(store.current_seq(), 2);
    }
}
