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

use crate::{
    crypto::Hash256,
    shamap::{ShaMap, SyncFilter},
};

/// Kind tag attached to every stored object.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ObjectKind {
    Ledger,
    Transaction,
    TransactionNode,
    AccountNode,
}

struct StoredObject {
    kind: ObjectKind,
    ledger_seq: u32,
    body: Vec<u8>,
}

/// Content-addressed node store, keyed by object hash.
///
/// Internally synchronized; callers hold no external lock.
#[derive(Clone, Default)]
pub struct ObjectStore {
    inner: Arc<Mutex<HashMap<Hash256, StoredObject>>>,
}

impl ObjectStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn store(&self, kind: ObjectKind, ledger_seq: u32, body: &[u8], hash: Hash256) {
        let mut inner = self.inner.lock().unwrap();
        inner.entry(hash).or_insert_with(|| StoredObject { kind, ledger_seq, body: body.to_vec() });
    }

    pub fn retrieve(&self, hash: &Hash256) -> Option<Vec<u8>> {
        self.inner.lock().unwrap().get(hash).map(|obj| obj.body.clone())
    }

    pub fn kind(&self, hash: &Hash256) -> Option<ObjectKind> {
        self.inner.lock().unwrap().get(hash).map(|obj| obj.kind)
    }

    pub fn contains(&self, hash: &Hash256) -> bool {
        self.inner.lock().unwrap().contains_key(hash)
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().unwrap().is_empty()
    }
}

/// Sync filter writing transaction-map nodes through to the object store,
/// tagged with the owning ledger's sequence.
pub struct TxTreeFilter {
    pub store: ObjectStore,
    pub ledger_seq: u32,
}

impl SyncFilter for TxTreeFilter {
    fn got_node(&mut self, node_hash: Hash256, body: &[u8], is_leaf: bool) {
        let kind = if is_leaf { ObjectKind::Transaction } else { ObjectKind::TransactionNode };
        self.store.store(kind, self.ledger_seq, body, node_hash);
    }

    fn have_node(&mut self, node_hash: Hash256) -> Option<Vec<u8>> {
        self.store.retrieve(&node_hash)
    }
}

/// Sync filter writing account-state nodes through to the object store.
pub struct StateTreeFilter {
    pub store: ObjectStore,
    pub ledger_seq: u32,
}

impl SyncFilter for StateTreeFilter {
    fn got_node(&mut self, node_hash: Hash256, body: &[u8], _is_leaf: bool) {
        self.store.store(ObjectKind::AccountNode, self.ledger_seq, body, node_hash);
    }

    fn have_node(&mut self, node_hash: Hash256) -> Option<Vec<u8>> {
        self.store.retrieve(&node_hash)
    }
}

/// Sync filter for proposed transaction sets during consensus: bodies are
/// cached so a set another round references can be rebuilt locally.
pub struct ConsensusSetFilter {
    pub store: ObjectStore,
}

impl SyncFilter for ConsensusSetFilter {
    fn got_node(&mut self, node_hash: Hash256, body: &[u8], is_leaf: bool) {
        let kind = if is_leaf { ObjectKind::Transaction } else { ObjectKind::TransactionNode };
        self.store.store(kind, 0, body, node_hash);
    }

    fn have_node(&mut self, node_hash: Hash256) -> Option<Vec<u8>> {
        self.store.retrieve(&node_hash)
    }
}

/// Snapshot a map's nodes into the store so later local fetches
/// (`have_node`) and peer requests can be answered without the map.
/// The root manifest is stored under the map's root hash.
pub fn store_map_nodes(store: &ObjectStore, map: &ShaMap, kind: ObjectKind, ledger_seq: u32) {
    use crate::crypto::content_hash;
    for (_, body) in map.items() {
        store.store(kind, ledger_seq, body, content_hash(body));
    }
    let root = map.root_hash();
    if !root.is_zero() {
        let root_kind = match kind {
            ObjectKind::Transaction => ObjectKind::TransactionNode,
            other => other,
        };
        store.store(root_kind, ledger_seq, &map.root_node_body(), root);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::content_hash;

    #[test]
    fn store_and_retrieve() {
        let store = ObjectStore::new();
        let body = b"node body".to_vec();
        let hash = content_hash(&body);

        assert!(store.retrieve(&hash).is_none());
        store.store(ObjectKind::TransactionNode, 7, &body, hash);
        assert_eq!(store.retrieve(&hash).unwrap(), body);
        assert_eq!(store.kind(&hash), Some(ObjectKind::TransactionNode));

        // First write wins; the store is content-addressed
        store.store(ObjectKind::AccountNode, 9, &body, hash);
        assert_eq!(store.kind(&hash), Some(ObjectKind::TransactionNode));
    }
}
