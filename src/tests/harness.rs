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

//! Multi-node loopback harness: peers are in-memory queues, time is a
//! manual clock, and the network is pumped to a fixed point after every
//! simulated tick.

use std::{
    collections::VecDeque,
    sync::{Arc, Mutex},
};

use crate::{
    crypto::{content_hash, Hash256, NodeId},
    ledger::Ledger,
    net::{
        ledger_data_for, GetLedger, LedgerData, LedgerItemType, LedgerNode, Peer, PeerDirectory,
        PeerMessage, PeerPtr,
    },
    node::{Env, EnvPtr},
    ops::NetworkOps,
    settings::Settings,
    shamap::ShaMap,
    store::ObjectKind,
    system::{Clock, ManualClock},
    tx::{AccountId, ApplyOutcome, TxEngine},
};

/// Network-time origin for all harness clocks.
pub const GENESIS_TIME: u32 = 700_000_000;

/// Transaction engine for tests: applies everything, deriving one state
/// entry and one affected account from the transaction id.
pub struct TestEngine;

impl TxEngine for TestEngine {
    fn apply(
        &self,
        ledger: &mut Ledger,
        tx_id: &Hash256,
        body: &[u8],
        _open_ledger: bool,
    ) -> ApplyOutcome {
        let mut state_key = Vec::with_capacity(38);
        state_key.extend_from_slice(tx_id.as_bytes());
        state_key.extend_from_slice(b"state");
        ledger.state_map_mut().add_item(content_hash(&state_key), body.to_vec());

        let mut account = [0u8; 20];
        account.copy_from_slice(&tx_id.as_bytes()[..20]);
        ApplyOutcome::Applied { affected: vec![AccountId(account)] }
    }
}

type Inbox = Arc<Mutex<VecDeque<(NodeId, PeerMessage)>>>;

/// A handle to a remote node, as one node's directory entry.
struct LoopbackPeer {
    sender: NodeId,
    remote_id: NodeId,
    remote_key: Vec<u8>,
    remote_env: EnvPtr,
    remote_inbox: Inbox,
}

impl Peer for LoopbackPeer {
    fn id(&self) -> NodeId {
        self.remote_id
    }

    fn public_key(&self) -> Vec<u8> {
        self.remote_key.clone()
    }

    fn send(&self, message: &PeerMessage) {
        self.remote_inbox.lock().unwrap().push_back((self.sender, message.clone()));
    }

    fn has_ledger(&self, hash: &Hash256) -> bool {
        self.remote_env.ledgers.get_by_hash(hash).is_some()
    }

    fn closed_ledger(&self) -> Option<Hash256> {
        Some(self.remote_env.ledgers.closed_ledger().hash())
    }

    fn punish(&self, reason: &str) {
        log::warn!(target: "meridian::tests::harness", "punish {}: {reason}", self.remote_id);
    }
}

/// Directory filled in after every node exists.
#[derive(Default)]
pub struct LoopbackDirectory {
    peers: Mutex<Vec<PeerPtr>>,
}

impl PeerDirectory for LoopbackDirectory {
    fn peers(&self) -> Vec<PeerPtr> {
        self.peers.lock().unwrap().clone()
    }

    fn get(&self, id: &NodeId) -> Option<PeerPtr> {
        self.peers.lock().unwrap().iter().find(|p| p.id() == *id).cloned()
    }

    fn broadcast(&self, message: &PeerMessage) {
        for peer in self.peers.lock().unwrap().iter() {
            peer.send(message);
        }
    }
}

pub struct TestNode {
    pub ops: Arc<NetworkOps>,
    pub env: EnvPtr,
    pub id: NodeId,
    inbox: Inbox,
    directory: Arc<LoopbackDirectory>,
}

pub struct TestNet {
    pub clock: Clock,
    pub clock_handle: Arc<ManualClock>,
    pub nodes: Vec<TestNode>,
}

impl TestNet {
    /// Build `n` fully meshed validating nodes over one genesis ledger.
    pub fn new(n: usize) -> Self {
        Self::with_settings(n, |_| Settings::default())
    }

    pub fn with_settings(n: usize, mut settings_for: impl FnMut(usize) -> Settings) -> Self {
        let (clock, clock_handle) = Clock::manual(GENESIS_TIME);

        let mut nodes = Vec::with_capacity(n);
        for i in 0..n {
            let mut settings = settings_for(i);
            if settings.validation_seed.is_none() {
                let mut seed = [0x40u8; 32];
                seed[0] = i as u8 + 1;
                settings.validation_seed = Some(hex::encode(seed));
            }
            let directory = Arc::new(LoopbackDirectory::default());
            let genesis = Ledger::genesis(1_000_000_000, GENESIS_TIME, 30);
            let env = Env::new(
                settings,
                clock.clone(),
                directory.clone(),
                Arc::new(TestEngine),
                genesis,
            )
            .unwrap();
            let ops = NetworkOps::new(env.clone());
            let id = env.node_key.node_id();
            nodes.push(TestNode {
                ops,
                env,
                id,
                inbox: Arc::new(Mutex::new(VecDeque::new())),
                directory,
            });
        }

        // Full mesh
        for i in 0..n {
            for j in 0..n {
                if i == j {
                    continue
                }
                let handle: PeerPtr = Arc::new(LoopbackPeer {
                    sender: nodes[i].id,
                    remote_id: nodes[j].id,
                    remote_key: nodes[j].env.node_key.public_key(),
                    remote_env: nodes[j].env.clone(),
                    remote_inbox: nodes[j].inbox.clone(),
                });
                nodes[i].directory.peers.lock().unwrap().push(handle);
            }
        }

        Self { clock, clock_handle, nodes }
    }

    /// Advance simulated time, ticking every node and pumping messages to
    /// a fixed point after each step.
    pub fn run(&self, total_ms: u64, step_ms: u64) {
        let mut elapsed = 0;
        while elapsed < total_ms {
            self.clock_handle.advance_ms(step_ms);
            elapsed += step_ms;
            for node in &self.nodes {
                node.ops.state_tick();
            }
            self.pump();
        }
    }

    /// Deliver queued messages until every inbox is empty.
    pub fn pump(&self) {
        loop {
            let mut any = false;
            for node in &self.nodes {
                loop {
                    let entry = node.inbox.lock().unwrap().pop_front();
                    let Some((from, message)) = entry else { break };
                    any = true;
                    deliver(node, from, &message);
                }
            }
            if !any {
                break
            }
        }
    }
}

/// Dispatch one message into a node, answering data requests from its
/// stores the way a daemon's peer layer would.
fn deliver(node: &TestNode, from: NodeId, message: &PeerMessage) {
    match message {
        PeerMessage::Proposal(proposal) => {
            node.ops.recv_proposal(proposal);
        }
        PeerMessage::Validation(validation) => {
            let _ = node.ops.recv_validation(validation);
        }
        PeerMessage::HaveTxSet(have) => {
            if let Some(peer) = node.directory.get(&from) {
                node.ops.recv_have_tx_set(peer, have.hash, have.status);
            }
        }
        PeerMessage::LedgerData(data) => {
            let peer = node.directory.get(&from);
            node.ops.recv_ledger_data(data, peer);
        }
        PeerMessage::GetLedger(request) => {
            if let Some(reply) = serve_get_ledger(&node.env, request) {
                if let Some(peer) = node.directory.get(&from) {
                    peer.send(&PeerMessage::LedgerData(reply));
                }
            }
        }
        PeerMessage::StatusChange(_) => {}
    }
}

/// Answer a ledger-content request from the node's ledger and object
/// stores.
pub fn serve_get_ledger(env: &EnvPtr, request: &GetLedger) -> Option<LedgerData> {
    if request.itype == LedgerItemType::TxCandidate {
        // Candidate sets are served from the content-addressed store
        let mut nodes = vec![];
        for id in &request.node_ids {
            let body = if ShaMap::is_root_id(id) {
                env.objects.retrieve(&request.ledger_hash)?
            } else {
                if id.len() != 33 {
                    return None
                }
                let key = Hash256::from_slice(&id[1..]).ok()?;
                env.objects.retrieve(&key)?
            };
            nodes.push(LedgerNode { id: id.clone(), body });
        }
        return Some(LedgerData {
            ledger_hash: request.ledger_hash,
            ledger_seq: 0,
            itype: LedgerItemType::TxCandidate,
            nodes,
        })
    }

    let ledger = env.ledgers.get_by_hash(&request.ledger_hash)?;
    ledger_data_for(&ledger, request)
}

/// Build, apply and accept a successor ledger directly on a node,
/// bypassing consensus. Returns the installed closed ledger.
pub fn force_close_with_tx(node: &TestNode, body: &[u8], now: u32) -> Arc<Ledger> {
    let prev = node.env.ledgers.closed_ledger();
    let mut next = Ledger::child_open(&prev, node.env.settings.ledger_seconds, now);
    let tx_id = content_hash(body);
    TestEngine.apply(&mut next, &tx_id, body, false);
    let _ = next.add_tx(tx_id, body.to_vec());
    next.set_accepted(now - now % 30, 30, true);
    // Keep its nodes servable for acquisitions
    crate::store::store_map_nodes(&node.env.objects, next.tx_map(), ObjectKind::Transaction, next.seq());
    crate::store::store_map_nodes(&node.env.objects, next.state_map(), ObjectKind::AccountNode, next.seq());
    node.env.objects.store(
        ObjectKind::Ledger,
        next.seq(),
        &next.header_bytes(),
        next.hash(),
    );
    let open = Ledger::child_open(&next, node.env.settings.ledger_seconds, now);
    node.env.ledgers.push_ledger(next, open)
}
