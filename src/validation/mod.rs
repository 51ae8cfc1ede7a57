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
    collections::{HashMap, VecDeque},
    sync::{Arc, Mutex},
};

use log::trace;

use crate::{
    crypto::{sha512_half, verify_signature, Hash256, NodeId, NodeKey},
    net::ValidationMessage,
    Error, Result,
};

/// Hashing prefix for validation signatures, shared with the ledger header
pub const VALIDATION_HASH_PREFIX: u32 = 0x4C57_5200;

/// Flag bit marking a full validation (signer is a fully synced validator)
pub const VALIDATION_FLAG_FULL: u32 = 0x0001_0000;

/// Bound on the dead-ledger blacklist
const DEAD_LEDGER_CAP: usize = 256;

/// A signed assertion that a ledger is the accepted one at its sequence.
#[derive(Clone, Debug)]
pub struct SignedValidation {
    ledger_hash: Hash256,
    sign_time: u32,
    flags: u32,
    pub_key: Vec<u8>,
    signature: Vec<u8>,
}

fn signing_hash(ledger_hash: &Hash256, sign_time: u32, flags: u32, pub_key: &[u8]) -> Hash256 {
    let mut buf = Vec::with_capacity(4 + 32 + 4 + 4 + 1 + pub_key.len());
    buf.extend_from_slice(&VALIDATION_HASH_PREFIX.to_be_bytes());
    buf.extend_from_slice(ledger_hash.as_bytes());
    buf.extend_from_slice(&sign_time.to_be_bytes());
    buf.extend_from_slice(&flags.to_be_bytes());
    buf.push(pub_key.len() as u8);
    buf.extend_from_slice(pub_key);
    sha512_half(&buf)
}

impl SignedValidation {
    pub fn new(key: &NodeKey, ledger_hash: Hash256, sign_time: u32, full: bool) -> Self {
        let flags = if full { VALIDATION_FLAG_FULL } else { 0 };
        let pub_key = key.public_key();
        let hash = signing_hash(&ledger_hash, sign_time, flags, &pub_key);
        Self { ledger_hash, sign_time, flags, pub_key, signature: key.sign(hash.as_bytes()) }
    }

    /// Parse and verify a received validation.
    pub fn from_message(message: &ValidationMessage) -> Result<Self> {
        let hash =
            signing_hash(&message.ledger_hash, message.sign_time, message.flags, &message.pub_key);
        if !verify_signature(&message.pub_key, hash.as_bytes(), &message.signature) {
            return Err(Error::ValidationSignatureMismatch)
        }
        Ok(Self {
            ledger_hash: message.ledger_hash,
            sign_time: message.sign_time,
            flags: message.flags,
            pub_key: message.pub_key.clone(),
            signature: message.signature.clone(),
        })
    }

    pub fn to_message(&self) -> ValidationMessage {
        ValidationMessage {
            ledger_hash: self.ledger_hash,
            sign_time: self.sign_time,
            flags: self.flags,
            pub_key: self.pub_key.clone(),
            signature: self.signature.clone(),
        }
    }

    pub fn ledger_hash(&self) -> Hash256 {
        self.ledger_hash
    }

    pub fn sign_time(&self) -> u32 {
        self.sign_time
    }

    pub fn signer(&self) -> NodeId {
        NodeId::from_public_key(&self.pub_key)
    }

    pub fn is_full(&self) -> bool {
        self.flags & VALIDATION_FLAG_FULL != 0
    }
}

struct CollectionInner {
    /// Newest validation per signer
    current: HashMap<NodeId, SignedValidation>,
    /// All current validations indexed by ledger hash
    by_ledger: HashMap<Hash256, HashMap<NodeId, SignedValidation>>,
    /// Superseded validations, kept for later inspection
    stale: Vec<SignedValidation>,
    /// Soft blacklist of ledgers known bad
    dead: VecDeque<Hash256>,
}

/// Result of inserting a validation into the collection.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum AddOutcome {
    /// Accepted; `replaced` names the ledger the signer previously validated
    Added { replaced: Option<Hash256> },
    /// The signer already has a validation at least as new
    Stale,
}

impl AddOutcome {
    pub fn is_added(&self) -> bool {
        matches!(self, Self::Added { .. })
    }
}

/// Collection of signed validations, answering "how many nodes validated
/// ledger X" and "which ledger dominates right now".
#[derive(Clone)]
pub struct ValidationCollection {
    inner: Arc<Mutex<CollectionInner>>,
}

impl Default for ValidationCollection {
    fn default() -> Self {
        Self::new()
    }
}

impl ValidationCollection {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(CollectionInner {
                current: HashMap::new(),
                by_ledger: HashMap::new(),
                stale: Vec::new(),
                dead: VecDeque::new(),
            })),
        }
    }

    /// Insert a validation. Rejected when the signer already has one at
    /// least as new. On success carries the ledger hash of the validation
    /// it replaced, if any.
    pub fn add_validation(&self, validation: SignedValidation) -> AddOutcome {
        let signer = validation.signer();
        let mut inner = self.inner.lock().unwrap();

        let mut replaced = None;
        if let Some(existing) = inner.current.get(&signer) {
            if existing.sign_time() >= validation.sign_time() {
                return AddOutcome::Stale
            }
            replaced = Some(existing.ledger_hash());
            let old = inner.current.remove(&signer).unwrap();
            if let Some(set) = inner.by_ledger.get_mut(&old.ledger_hash()) {
                set.remove(&signer);
                if set.is_empty() {
                    inner.by_ledger.remove(&old.ledger_hash());
                }
            }
            inner.stale.push(old);
        }

        trace!(
            target: "meridian::validation",
            "Validation of {} by {}", validation.ledger_hash(), signer
        );
        inner.by_ledger.entry(validation.ledger_hash()).or_default().insert(signer, validation.clone());
        inner.current.insert(signer, validation);
        AddOutcome::Added { replaced }
    }

    /// Count of current validations per ledger hash.
    pub fn current_validations(&self) -> HashMap<Hash256, usize> {
        let inner = self.inner.lock().unwrap();
        let mut counts = HashMap::new();
        for validation in inner.current.values() {
            *counts.entry(validation.ledger_hash()).or_insert(0) += 1;
        }
        counts
    }

    /// Count validations of `ledger` whose signer the caller trusts.
    pub fn trusted_validation_count(
        &self,
        ledger: &Hash256,
        is_trusted: &dyn Fn(&NodeId) -> bool,
    ) -> usize {
        let inner = self.inner.lock().unwrap();
        inner
            .by_ledger
            .get(ledger)
            .map(|set| set.keys().filter(|signer| is_trusted(signer)).count())
            .unwrap_or(0)
    }

    /// Count current validations signed after `after_time`.
    pub fn current_validation_count(&self, after_time: u32) -> usize {
        let inner = self.inner.lock().unwrap();
        inner.current.values().filter(|v| v.sign_time() > after_time).count()
    }

    pub fn validations_for(&self, ledger: &Hash256) -> Vec<SignedValidation> {
        let inner = self.inner.lock().unwrap();
        inner.by_ledger.get(ledger).map(|set| set.values().cloned().collect()).unwrap_or_default()
    }

    pub fn stale_count(&self) -> usize {
        self.inner.lock().unwrap().stale.len()
    }

    /// Blacklist a ledger known bad. Bounded FIFO; oldest entry evicted.
    pub fn add_dead_ledger(&self, hash: Hash256) {
        let mut inner = self.inner.lock().unwrap();
        if inner.dead.contains(&hash) {
            return
        }
        if inner.dead.len() >= DEAD_LEDGER_CAP {
            inner.dead.pop_front();
        }
        inner.dead.push_back(hash);
    }

    pub fn is_dead_ledger(&self, hash: &Hash256) -> bool {
        self.inner.lock().unwrap().dead.contains(hash)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn validation(seed: u8, ledger: &[u8], sign_time: u32) -> SignedValidation {
        let key = NodeKey::from_seed([seed; 32]);
        SignedValidation::new(&key, sha512_half(ledger), sign_time, true)
    }

    #[test]
    fn newer_supersedes_older_rejects_stale() {
        let collection = ValidationCollection::new();
        let ledger_a = sha512_half(b"A");
        let ledger_b = sha512_half(b"B");

        assert!(collection.add_validation(validation(1, b"A", 100)).is_added());
        assert!(collection.add_validation(validation(2, b"A", 101)).is_added());
        assert_eq!(collection.current_validations()[&ledger_a], 2);

        // Same signer, newer validation for another ledger
        let outcome = collection.add_validation(validation(1, b"B", 150));
        assert_eq!(outcome, AddOutcome::Added { replaced: Some(ledger_a) });
        assert_eq!(collection.current_validations()[&ledger_a], 1);
        assert_eq!(collection.current_validations()[&ledger_b], 1);
        assert_eq!(collection.stale_count(), 1);

        // Stale or same-time insert from that signer is rejected
        assert_eq!(collection.add_validation(validation(1, b"A", 150)), AddOutcome::Stale);
        assert_eq!(collection.add_validation(validation(1, b"A", 120)), AddOutcome::Stale);

        // At most one current validation per signer
        let total: usize = collection.current_validations().values().sum();
        assert_eq!(total, 2);
    }

    #[test]
    fn trusted_and_time_filters() {
        let collection = ValidationCollection::new();
        let ledger = sha512_half(b"L");
        assert!(collection.add_validation(validation(1, b"L", 100)).is_added());
        assert!(collection.add_validation(validation(2, b"L", 200)).is_added());
        assert!(collection.add_validation(validation(3, b"L", 300)).is_added());

        let trusted_signer = NodeKey::from_seed([2u8; 32]).node_id();
        let count = collection.trusted_validation_count(&ledger, &|id| *id == trusted_signer);
        assert_eq!(count, 1);

        assert_eq!(collection.current_validation_count(150), 2);
        assert_eq!(collection.current_validation_count(300), 0);
    }

    #[test]
    fn dead_ledger_fifo_is_bounded() {
        let collection = ValidationCollection::new();
        let first = sha512_half(&0u32.to_be_bytes());
        for n in 0u32..300 {
            collection.add_dead_ledger(sha512_half(&n.to_be_bytes()));
        }
        assert!(!collection.is_dead_ledger(&first), "oldest entries evicted");
        assert!(collection.is_dead_ledger(&sha512_half(&299u32.to_be_bytes())));
    }
}
