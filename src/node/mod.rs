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

use std::{collections::HashSet, sync::Arc};

use log::info;

use crate::{
    crypto::{NodeId, NodeKey},
    ledger::{store::LedgerStore, Ledger},
    net::PeerDirectoryPtr,
    settings::Settings,
    store::ObjectStore,
    sync::AcquireMaster,
    system::Clock,
    tx::TxEnginePtr,
    validation::ValidationCollection,
    Result,
};

/// Everything a consensus round and the network tracker need, wired
/// explicitly at construction. No global state.
pub struct Env {
    pub settings: Settings,
    pub clock: Clock,
    pub peers: PeerDirectoryPtr,
    pub objects: ObjectStore,
    pub ledgers: LedgerStore,
    pub validations: ValidationCollection,
    pub acquires: AcquireMaster,
    pub engine: TxEnginePtr,
    /// Node identity and signing key
    pub node_key: NodeKey,
    /// Whether a validation seed was configured
    pub validating: bool,
    trusted: HashSet<NodeId>,
}

pub type EnvPtr = Arc<Env>;

impl Env {
    pub fn new(
        settings: Settings,
        clock: Clock,
        peers: PeerDirectoryPtr,
        engine: TxEnginePtr,
        genesis: Ledger,
    ) -> Result<EnvPtr> {
        let (node_key, validating) = match &settings.validation_seed {
            Some(seed) => (NodeKey::from_hex_seed(seed)?, true),
            None => (NodeKey::random(), false),
        };

        let mut trusted = HashSet::new();
        for pub_key in &settings.trusted_validators {
            let bytes = hex::decode(pub_key).map_err(|_| crate::Error::InvalidPublicKey)?;
            trusted.insert(NodeId::from_public_key(&bytes));
        }

        let objects = ObjectStore::new();
        let now = clock.network_time();
        let ledgers = LedgerStore::new(genesis, settings.ledger_seconds, now);
        let acquires = AcquireMaster::new(objects.clone(), peers.clone());

        info!(
            target: "meridian::node",
            "Node {} initialized, validating={validating}", node_key.node_id()
        );

        Ok(Arc::new(Self {
            settings,
            clock,
            peers,
            objects,
            ledgers,
            validations: ValidationCollection::new(),
            acquires,
            engine,
            node_key,
            validating,
            trusted,
        }))
    }

    /// Trust predicate over validation signers.
    pub fn is_trusted(&self, id: &NodeId) -> bool {
        self.trusted.contains(id)
    }
}
