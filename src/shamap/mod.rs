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

//! Authenticated key→value map with a root hash that uniquely identifies
//! its contents, plus the node pull protocol used to synchronize one from
//! peers: a root node carrying the (key, body-hash) manifest, and one leaf
//! node per item body.
//!
//! Two maps with equal root hashes hold equal contents. The empty map
//! hashes to zero.

use std::collections::BTreeMap;

use darkfi_serial::{deserialize, serialize, SerialDecodable, SerialEncodable};

use crate::crypto::{content_hash, Hash256, ZERO_HASH};

/// Map node identifier prefix for leaf nodes. The root node id is empty.
const LEAF_ID_PREFIX: u8 = 0x01;

/// Serialized form of the root node: the ordered (key, body hash) manifest.
#[derive(Clone, SerialEncodable, SerialDecodable)]
struct Manifest {
    entries: Vec<ManifestEntry>,
}

#[derive(Clone, SerialEncodable, SerialDecodable)]
struct ManifestEntry {
    key: Hash256,
    body_hash: Hash256,
}

/// One side of a map difference: the item exists only in one of the maps.
#[derive(Clone, Debug)]
pub enum MapDiff {
    Ours(Vec<u8>),
    Theirs(Vec<u8>),
}

/// Store-through hook invoked as nodes arrive during synchronization.
pub trait SyncFilter {
    /// A node body was received and verified.
    fn got_node(&mut self, node_hash: Hash256, body: &[u8], is_leaf: bool);

    /// Give the body for a node hash if it is available locally.
    fn have_node(&mut self, node_hash: Hash256) -> Option<Vec<u8>>;
}

/// Filter that stores nothing and knows nothing.
pub struct NullFilter;

impl SyncFilter for NullFilter {
    fn got_node(&mut self, _node_hash: Hash256, _body: &[u8], _is_leaf: bool) {}

    fn have_node(&mut self, _node_hash: Hash256) -> Option<Vec<u8>> {
        None
    }
}

#[derive(Clone, Default)]
pub struct ShaMap {
    /// Item bodies, in canonical (ascending key) order
    items: BTreeMap<Hash256, Vec<u8>>,
    /// Target manifest, known once the root node arrives during sync
    manifest: Option<Vec<(Hash256, Hash256)>>,
    synching: bool,
}

impl ShaMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// The root node id on the wire.
    pub fn root_node_id() -> Vec<u8> {
        vec![]
    }

    /// The wire id of the leaf node holding `key`.
    pub fn leaf_node_id(key: &Hash256) -> Vec<u8> {
        let mut id = Vec::with_capacity(33);
        id.push(LEAF_ID_PREFIX);
        id.extend_from_slice(key.as_bytes());
        id
    }

    fn parse_leaf_id(id: &[u8]) -> Option<Hash256> {
        if id.len() != 33 || id[0] != LEAF_ID_PREFIX {
            return None
        }
        Hash256::from_slice(&id[1..]).ok()
    }

    pub fn is_root_id(id: &[u8]) -> bool {
        id.is_empty()
    }

    fn manifest_from_items(&self) -> Manifest {
        Manifest {
            entries: self
                .items
                .iter()
                .map(|(key, body)| ManifestEntry { key: *key, body_hash: content_hash(body) })
                .collect(),
        }
    }

    /// Root hash identifying the contents. Zero for the empty map.
    pub fn root_hash(&self) -> Hash256 {
        if let Some(manifest) = &self.manifest {
            if manifest.is_empty() {
                return ZERO_HASH
            }
            let entries = manifest
                .iter()
                .map(|(key, body_hash)| ManifestEntry { key: *key, body_hash: *body_hash })
                .collect();
            return content_hash(&serialize(&Manifest { entries }))
        }

        if self.items.is_empty() {
            return ZERO_HASH
        }
        content_hash(&serialize(&self.manifest_from_items()))
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty() && self.manifest.as_ref().map_or(true, |m| m.is_empty())
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn has_item(&self, key: &Hash256) -> bool {
        self.items.contains_key(key)
    }

    pub fn item(&self, key: &Hash256) -> Option<&Vec<u8>> {
        self.items.get(key)
    }

    /// Insert an item. Returns false if the key is already present.
    pub fn add_item(&mut self, key: Hash256, body: Vec<u8>) -> bool {
        if self.items.contains_key(&key) {
            return false
        }
        self.items.insert(key, body);
        true
    }

    pub fn delete_item(&mut self, key: &Hash256) -> bool {
        self.items.remove(key).is_some()
    }

    /// Items in canonical order.
    pub fn items(&self) -> impl Iterator<Item = (&Hash256, &Vec<u8>)> {
        self.items.iter()
    }

    /// Detached copy of the current contents. Snapshots never carry
    /// synchronization state.
    pub fn snapshot(&self) -> ShaMap {
        ShaMap { items: self.items.clone(), manifest: None, synching: false }
    }

    // ===================
    // Synchronization API
    // ===================

    pub fn set_synching(&mut self) {
        self.synching = true;
    }

    pub fn clear_synching(&mut self) {
        self.synching = false;
        self.manifest = None;
    }

    pub fn is_synching(&self) -> bool {
        self.synching
    }

    /// Whether the root node (the manifest) is already in hand.
    pub fn root_known(&self) -> bool {
        !self.synching || self.manifest.is_some()
    }

    /// Accept the root node. The body must hash to `expected_root`.
    pub fn add_root_node(
        &mut self,
        expected_root: Hash256,
        body: &[u8],
        filter: &mut dyn SyncFilter,
    ) -> bool {
        if content_hash(body) != expected_root {
            return false
        }
        let Ok(manifest) = deserialize::<Manifest>(body) else { return false };
        filter.got_node(expected_root, body, false);
        self.manifest = Some(manifest.entries.iter().map(|e| (e.key, e.body_hash)).collect());
        // Drop any stale bodies that are not part of the target contents
        let wanted: BTreeMap<Hash256, Hash256> =
            manifest.entries.iter().map(|e| (e.key, e.body_hash)).collect();
        self.items.retain(|key, body| wanted.get(key) == Some(&content_hash(body)));
        true
    }

    /// Accept a leaf node by wire id. The body must match the manifest.
    pub fn add_known_node(&mut self, id: &[u8], body: &[u8], filter: &mut dyn SyncFilter) -> bool {
        let Some(manifest) = &self.manifest else { return false };
        let Some(key) = Self::parse_leaf_id(id) else { return false };
        let Some((_, expected)) = manifest.iter().find(|(k, _)| *k == key) else { return false };
        let body_hash = content_hash(body);
        if body_hash != *expected {
            return false
        }
        filter.got_node(body_hash, body, true);
        self.items.insert(key, body.to_vec());
        true
    }

    /// Wire ids of up to `max` nodes still needed to complete the map.
    /// Nodes the filter can supply are absorbed instead of reported.
    pub fn missing_nodes(&mut self, max: usize, filter: &mut dyn SyncFilter) -> Vec<Vec<u8>> {
        let Some(manifest) = self.manifest.clone() else { return vec![Self::root_node_id()] };

        let mut missing = vec![];
        for (key, body_hash) in manifest {
            if self.items.contains_key(&key) {
                continue
            }
            if let Some(body) = filter.have_node(body_hash) {
                if content_hash(&body) == body_hash {
                    self.items.insert(key, body);
                    continue
                }
            }
            missing.push(Self::leaf_node_id(&key));
            if missing.len() >= max {
                break
            }
        }
        missing
    }

    /// A synching map is valid once every manifest entry has a body with
    /// the right hash. Maps built locally are always valid.
    pub fn is_valid(&self) -> bool {
        let Some(manifest) = &self.manifest else { return true };
        manifest.iter().all(|(key, body_hash)| {
            self.items.get(key).map_or(false, |body| content_hash(body) == *body_hash)
        })
    }

    // ============
    // Serving side
    // ============

    /// The root node body served to synchronizing peers.
    pub fn root_node_body(&self) -> Vec<u8> {
        serialize(&self.manifest_from_items())
    }

    /// The body of the node with the given wire id, if we hold it.
    pub fn node_body(&self, id: &[u8]) -> Option<Vec<u8>> {
        if Self::is_root_id(id) {
            return Some(self.root_node_body())
        }
        let key = Self::parse_leaf_id(id)?;
        self.items.get(&key).cloned()
    }

    /// Keys present in exactly one of the two maps, with the present body.
    /// Stops after `limit` differences.
    pub fn diff(&self, other: &ShaMap, limit: usize) -> BTreeMap<Hash256, MapDiff> {
        let mut differences = BTreeMap::new();

        for (key, body) in &self.items {
            if differences.len() >= limit {
                return differences
            }
            if !other.items.contains_key(key) {
                differences.insert(*key, MapDiff::Ours(body.clone()));
            }
        }
        for (key, body) in &other.items {
            if differences.len() >= limit {
                return differences
            }
            if !self.items.contains_key(key) {
                differences.insert(*key, MapDiff::Theirs(body.clone()));
            }
        }
        differences
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn item(n: u8) -> (Hash256, Vec<u8>) {
        let body = vec![n; 8];
        (content_hash(&body), body)
    }

    #[test]
    fn equal_contents_equal_roots() {
        let mut a = ShaMap::new();
        let mut b = ShaMap::new();
        assert!(a.root_hash().is_zero());

        let (k1, v1) = item(1);
        let (k2, v2) = item(2);

        // insertion order must not matter
        assert!(a.add_item(k1, v1.clone()));
        assert!(a.add_item(k2, v2.clone()));
        assert!(b.add_item(k2, v2));
        assert!(b.add_item(k1, v1.clone()));
        assert_eq!(a.root_hash(), b.root_hash());

        assert!(!a.add_item(k1, v1));
        assert!(a.delete_item(&k1));
        assert_ne!(a.root_hash(), b.root_hash());
    }

    #[test]
    fn diff_reports_both_sides() {
        let mut a = ShaMap::new();
        let mut b = ShaMap::new();
        let (k1, v1) = item(1);
        let (k2, v2) = item(2);
        let (k3, v3) = item(3);
        a.add_item(k1, v1);
        a.add_item(k2, v2.clone());
        b.add_item(k2, v2);
        b.add_item(k3, v3);

        let differences = a.diff(&b, 16384);
        assert_eq!(differences.len(), 2);
        assert!(matches!(differences.get(&k1), Some(MapDiff::Ours(_))));
        assert!(matches!(differences.get(&k3), Some(MapDiff::Theirs(_))));
    }

    #[test]
    fn sync_via_node_pull() {
        // Source map to replicate
        let mut source = ShaMap::new();
        for n in 0..5 {
            let (k, v) = item(n);
            source.add_item(k, v);
        }
        let target_root = source.root_hash();

        let mut synched = ShaMap::new();
        synched.set_synching();
        assert!(!synched.root_known());
        assert_eq!(synched.missing_nodes(256, &mut NullFilter), vec![ShaMap::root_node_id()]);

        // Deliver the root, then every missing leaf
        assert!(synched.add_root_node(target_root, &source.root_node_body(), &mut NullFilter));
        assert_eq!(synched.root_hash(), target_root);

        let missing = synched.missing_nodes(256, &mut NullFilter);
        assert_eq!(missing.len(), 5);
        for id in missing {
            let body = source.node_body(&id).unwrap();
            assert!(synched.add_known_node(&id, &body, &mut NullFilter));
        }

        assert!(synched.missing_nodes(256, &mut NullFilter).is_empty());
        assert!(synched.is_valid());
        synched.clear_synching();
        assert_eq!(synched.root_hash(), target_root);
        assert_eq!(synched.len(), 5);
    }

    #[test]
    fn bad_nodes_rejected() {
        let mut source = ShaMap::new();
        let (k, v) = item(9);
        source.add_item(k, v);
        let root = source.root_hash();

        let mut synched = ShaMap::new();
        synched.set_synching();
        assert!(!synched.add_root_node(root, b"garbage", &mut NullFilter));
        assert!(synched.add_root_node(root, &source.root_node_body(), &mut NullFilter));

        // Wrong body for a known leaf id
        let id = ShaMap::leaf_node_id(&k);
        assert!(!synched.add_known_node(&id, b"not the body", &mut NullFilter));
        assert!(!synched.is_valid());
    }
}
