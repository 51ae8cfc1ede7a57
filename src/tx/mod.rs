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

//! The opaque transaction-engine boundary. The core never interprets
//! transaction bodies; it applies them through [`TxEngine`] and reacts to
//! the outcome, retrying `Retry` results in a fixed-point loop.

use std::{collections::BTreeMap, fmt, sync::Arc};

use log::{debug, info};

use crate::{crypto::Hash256, ledger::Ledger, shamap::ShaMap};

/// 20-byte account identifier, opaque to the core.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct AccountId(pub [u8; 20]);

impl fmt::Debug for AccountId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "AccountId({})", hex::encode(&self.0[..6]))
    }
}

/// Result of applying one transaction to a ledger.
#[derive(Clone, Debug)]
pub enum ApplyOutcome {
    /// Applied; the accounts it touched are reported for indexing
    Applied { affected: Vec<AccountId> },
    /// Not applicable yet; retry after other transactions land
    Retry,
    /// Permanently rejected against this ledger
    Failed,
}

/// External transaction engine.
pub trait TxEngine: Send + Sync {
    /// Apply `body` to `ledger`, mutating its state map. The engine must
    /// not touch the ledger's transaction set; the caller records applied
    /// transactions there.
    fn apply(
        &self,
        ledger: &mut Ledger,
        tx_id: &Hash256,
        body: &[u8],
        open_ledger: bool,
    ) -> ApplyOutcome;
}

pub type TxEnginePtr = Arc<dyn TxEngine>;

/// Retry queue holding transactions in canonical (ascending id) order.
#[derive(Default)]
pub struct CanonicalTxSet {
    txs: BTreeMap<Hash256, Vec<u8>>,
}

impl CanonicalTxSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, tx_id: Hash256, body: Vec<u8>) {
        self.txs.insert(tx_id, body);
    }

    pub fn len(&self) -> usize {
        self.txs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.txs.is_empty()
    }
}

/// Apply every transaction in `set` to `apply_to`, skipping those already
/// present in `check`. `Retry` results land in `failed`. Returns the
/// (txId, affected accounts) pairs that applied.
pub fn apply_tx_set(
    engine: &dyn TxEngine,
    set: &ShaMap,
    apply_to: &mut Ledger,
    check: &Ledger,
    failed: &mut CanonicalTxSet,
    open_ledger: bool,
) -> Vec<(Hash256, Vec<AccountId>)> {
    let mut applied = vec![];

    for (tx_id, body) in set.items() {
        if check.has_tx(tx_id) {
            continue
        }
        info!(target: "meridian::tx", "Processing candidate transaction {tx_id}");
        match engine.apply(apply_to, tx_id, body, open_ledger) {
            ApplyOutcome::Applied { affected } => {
                let _ = apply_to.add_tx(*tx_id, body.clone());
                applied.push((*tx_id, affected));
            }
            ApplyOutcome::Retry => {
                debug!(target: "meridian::tx", "retry {tx_id}");
                failed.push(*tx_id, body.clone());
            }
            ApplyOutcome::Failed => {
                debug!(target: "meridian::tx", "hard fail {tx_id}");
            }
        }
    }

    applied
}

/// Re-apply the retry queue until a pass makes no progress.
pub fn retry_failed(
    engine: &dyn TxEngine,
    apply_to: &mut Ledger,
    failed: &mut CanonicalTxSet,
    open_ledger: bool,
) -> Vec<(Hash256, Vec<AccountId>)> {
    let mut applied = vec![];

    loop {
        let mut successes = 0;
        let pending: Vec<(Hash256, Vec<u8>)> =
            failed.txs.iter().map(|(id, body)| (*id, body.clone())).collect();

        for (tx_id, body) in pending {
            match engine.apply(apply_to, &tx_id, &body, open_ledger) {
                ApplyOutcome::Applied { affected } => {
                    let _ = apply_to.add_tx(tx_id, body);
                    applied.push((tx_id, affected));
                    failed.txs.remove(&tx_id);
                    successes += 1;
                }
                ApplyOutcome::Failed => {
                    failed.txs.remove(&tx_id);
                }
                ApplyOutcome::Retry => {}
            }
        }

        if successes == 0 {
            break
        }
    }

    applied
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::content_hash;

    /// Engine that admits `lead` unconditionally, any body of "bad"
    /// never, and everything else only after `lead` landed.
    struct OrderedEngine {
        lead: Hash256,
    }

    impl TxEngine for OrderedEngine {
        fn apply(
            &self,
            ledger: &mut Ledger,
            tx_id: &Hash256,
            body: &[u8],
            _open_ledger: bool,
        ) -> ApplyOutcome {
            if body == &b"bad"[..] {
                return ApplyOutcome::Failed
            }
            if *tx_id != self.lead && !ledger.has_tx(&self.lead) {
                return ApplyOutcome::Retry
            }
            ledger.state_map_mut().add_item(content_hash(tx_id.as_bytes()), body.to_vec());
            ApplyOutcome::Applied { affected: vec![] }
        }
    }

    fn build_ledger(set: &ShaMap, engine: &dyn TxEngine) -> Ledger {
        let genesis = Ledger::genesis(1_000_000, 700_000_000, 30);
        let mut next = Ledger::child_open(&genesis, 15, 700_000_000);
        let check = next.snapshot(false);
        let mut failed = CanonicalTxSet::new();
        apply_tx_set(engine, set, &mut next, &check, &mut failed, false);
        retry_failed(engine, &mut next, &mut failed, false);
        next.set_accepted(700_000_015, 30, true);
        next
    }

    #[test]
    fn retry_reaches_fixed_point() {
        // Make sure a dependent transaction sorts before its lead, so the
        // first pass must park it in the retry queue
        let (first, second) = (b"tx one".to_vec(), b"tx two".to_vec());
        let (id_a, id_b) = (content_hash(&first), content_hash(&second));
        let (follow_id, lead_id, follow, lead) =
            if id_a < id_b { (id_a, id_b, first, second) } else { (id_b, id_a, second, first) };

        let mut set = ShaMap::new();
        set.add_item(follow_id, follow);
        set.add_item(lead_id, lead);
        set.add_item(content_hash(b"bad"), b"bad".to_vec());

        let engine = OrderedEngine { lead: lead_id };
        let ledger = build_ledger(&set, &engine);

        assert!(ledger.has_tx(&lead_id));
        assert!(ledger.has_tx(&follow_id), "retried transaction never landed");
        assert!(!ledger.has_tx(&content_hash(b"bad")), "hard failure leaked in");
    }

    #[test]
    fn application_is_deterministic() {
        let mut set = ShaMap::new();
        let lead_body = vec![0u8; 6];
        let lead_id = content_hash(&lead_body);
        set.add_item(lead_id, lead_body);
        for n in 1u8..4 {
            let body = vec![n; 6];
            set.add_item(content_hash(&body), body);
        }
        let engine = OrderedEngine { lead: lead_id };

        let once = build_ledger(&set, &engine);
        let again = build_ledger(&set, &engine);
        assert_eq!(once.hash(), again.hash());
        assert_eq!(once.tx_map().len(), 4);
    }
}
