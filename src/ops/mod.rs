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

//! Network-facing state machine: tracks the operating mode, selects the
//! last closed ledger the network is on, switches to it when we fall off,
//! and arms consensus rounds as close time approaches.

use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
};

use log::{debug, error, info, warn};
use tinyjson::JsonValue;

use crate::{
    consensus::{
        round::RoundStats,
        timing::{LEDGER_GRANULARITY_MS, LEDGER_IDLE_INTERVAL, LEDGER_WOBBLE_TIME},
        ConsensusRound, RoundState,
    },
    crypto::{Hash256, NodeId},
    ledger::Ledger,
    net::{
        LedgerData, LedgerItemType, PeerPtr, ProposalMessage, TxSetStatus, ValidationMessage,
    },
    node::EnvPtr,
    validation::SignedValidation,
    Result,
};

/// Default state-timer interval, in milliseconds
const NET_TIMER_DEFAULT_MS: u64 = 10_000;

/// Faster interval used while degraded or waiting on an acquisition
const NET_TIMER_FAST_MS: u64 = 5000;

/// How we process transactions and account requests.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum OperatingMode {
    /// Not ready to process requests
    Disconnected,
    /// Convinced we are talking to the network
    Connected,
    /// Convinced we agree with the network
    Tracking,
    /// We have the ledger and can even validate
    Full,
}

/// Weighted tally of support for one closed-ledger hash. Ordered
/// lexicographically; the final tie-break is the greater node public key.
#[derive(Clone, Default)]
struct ValidationCount {
    trusted: usize,
    untrusted: usize,
    nodes_using: usize,
    high_node: Vec<u8>,
}

impl ValidationCount {
    fn beats(&self, other: &ValidationCount) -> bool {
        if self.trusted != other.trusted {
            return self.trusted > other.trusted
        }
        if self.untrusted != other.untrusted {
            return self.untrusted > other.untrusted
        }
        if self.nodes_using != other.nodes_using {
            return self.nodes_using > other.nodes_using
        }
        self.high_node > other.high_node
    }
}

struct OpsInner {
    mode: OperatingMode,
    consensus: Option<Arc<ConsensusRound>>,
    last_close_proposers: usize,
    last_close_converge_ms: u64,
    /// Local estimate of the last close, for rounds after a disagreed close
    last_close_time: u32,
    /// Proposals carried over from an aborted round for replay
    stored_proposals: Vec<ProposalMessage>,
}

/// Master operational handler and network-mode tracker.
pub struct NetworkOps {
    env: EnvPtr,
    inner: Mutex<OpsInner>,
}

impl NetworkOps {
    pub fn new(env: EnvPtr) -> Arc<Self> {
        let last_close_time = env.clock.network_time();
        Arc::new(Self {
            env,
            inner: Mutex::new(OpsInner {
                mode: OperatingMode::Disconnected,
                consensus: None,
                last_close_proposers: 0,
                last_close_converge_ms: LEDGER_IDLE_INTERVAL as u64 * 1000,
                last_close_time,
                stored_proposals: vec![],
            }),
        })
    }

    pub fn env(&self) -> &EnvPtr {
        &self.env
    }

    pub fn mode(&self) -> OperatingMode {
        self.inner.lock().unwrap().mode
    }

    pub fn consensus_round(&self) -> Option<Arc<ConsensusRound>> {
        self.inner.lock().unwrap().consensus.clone()
    }

    fn set_mode(&self, inner: &mut OpsInner, mode: OperatingMode) {
        if inner.mode == mode {
            return
        }
        if mode < inner.mode {
            warn!(target: "meridian::ops", "STATE->{mode:?}");
        } else {
            info!(target: "meridian::ops", "STATE->{mode:?}");
        }
        inner.mode = mode;
    }

    // ====================
    // Network state machine
    // ====================

    /// One tick of the state timer. Returns the delay until the next tick,
    /// in milliseconds.
    pub fn state_tick(&self) -> u64 {
        let now_ms = self.env.clock.monotonic_ms();
        self.env.acquires.tick(now_ms);

        let mut inner = self.inner.lock().unwrap();
        let peers = self.env.peers.peers();

        // Sufficient peers? If not, we are disconnected.
        if peers.len() < self.env.settings.network_quorum {
            if inner.mode != OperatingMode::Disconnected {
                self.set_mode(&mut inner, OperatingMode::Disconnected);
                warn!(
                    target: "meridian::ops",
                    "Node count ({}) has fallen below quorum ({})",
                    peers.len(), self.env.settings.network_quorum
                );
            }
            return NET_TIMER_FAST_MS
        }
        if inner.mode == OperatingMode::Disconnected {
            self.set_mode(&mut inner, OperatingMode::Connected);
            info!(target: "meridian::ops", "Node count ({}) is sufficient", peers.len());
        }

        // Which closed ledger does the network dominantly use?
        let our_closed = self.env.ledgers.closed_ledger();
        let our_closed_hash = our_closed.hash();
        let (net_lgr, switch) = self.check_last_closed_ledger(&peers, our_closed_hash);

        let in_accept = inner
            .consensus
            .as_ref()
            .map(|round| matches!(round.state(), RoundState::Finished | RoundState::Accepted))
            .unwrap_or(false);

        if switch && !in_accept {
            warn!(target: "meridian::ops", "We are not running on the consensus ledger");
            info!(target: "meridian::ops", "Our LCL {our_closed_hash}");
            info!(target: "meridian::ops", "Net LCL {net_lgr}");
            if inner.mode >= OperatingMode::Tracking {
                self.set_mode(&mut inner, OperatingMode::Tracking);
            }

            let consensus_ledger = match self.env.ledgers.get_by_hash(&net_lgr) {
                Some(ledger) => Some(ledger),
                None => {
                    info!(target: "meridian::ops", "Acquiring consensus ledger {net_lgr}");
                    let acquire = self.env.acquires.find_create(net_lgr, now_ms);
                    if acquire.is_failed() {
                        self.env.acquires.drop_ledger(&net_lgr);
                        error!(target: "meridian::ops", "Network ledger cannot be acquired");
                        return NET_TIMER_DEFAULT_MS
                    }
                    if !acquire.is_complete() {
                        for peer in &peers {
                            if peer.closed_ledger() == Some(net_lgr) {
                                acquire.peer_has(peer.clone());
                            }
                        }
                        return NET_TIMER_FAST_MS
                    }
                    let acquired = acquire.ledger().map(|ledger| self.env.ledgers.store_ledger(ledger));
                    self.env.acquires.drop_ledger(&net_lgr);
                    acquired
                }
            };

            if let Some(ledger) = consensus_ledger {
                self.switch_last_closed_ledger(&mut inner, ledger);
            }
        } else if !switch {
            // Promotions happen only while we agree with the network
            if inner.mode == OperatingMode::Connected {
                self.set_mode(&mut inner, OperatingMode::Tracking);
            }
            if inner.mode == OperatingMode::Tracking {
                let have_parent = our_closed.seq() == 0 ||
                    self.env.ledgers.get_by_hash(&our_closed.header().parent_hash).is_some();
                if have_parent {
                    self.set_mode(&mut inner, OperatingMode::Full);
                }
            }
        }

        // Arm consensus as close time approaches
        let network_time = self.env.clock.network_time();
        let seconds_to_close =
            self.env.ledgers.current_close_time().saturating_sub(network_time);
        if inner.consensus.is_none() && seconds_to_close < LEDGER_WOBBLE_TIME {
            let net_lcl = if switch { net_lgr } else { our_closed_hash };
            self.begin_consensus(&mut inner, net_lcl);
        }

        // Drive the active round
        if let Some(round) = inner.consensus.clone() {
            round.timer_entry();
            if round.state() == RoundState::Accepted {
                self.end_consensus(&mut inner, round.stats());
            }
            return LEDGER_GRANULARITY_MS
        }

        // Idle: wake up near the close target
        let to_close_ms = (seconds_to_close.saturating_sub(LEDGER_WOBBLE_TIME)) as u64 * 1000;
        NET_TIMER_DEFAULT_MS.min(to_close_ms.max(LEDGER_GRANULARITY_MS))
    }

    /// Tally peer closed-ledger advertisements and validations. Returns the
    /// dominant hash and whether it differs from ours.
    fn check_last_closed_ledger(
        &self,
        peers: &[PeerPtr],
        our_closed_hash: Hash256,
    ) -> (Hash256, bool) {
        let mut ledgers: HashMap<Hash256, ValidationCount> = HashMap::new();

        for peer in peers {
            let Some(peer_ledger) = peer.closed_ledger() else {
                debug!(target: "meridian::ops", "Peer with no closed ledger in tally");
                continue
            };
            let count = ledgers.entry(peer_ledger).or_default();
            count.nodes_using += 1;
            let pub_key = peer.public_key();
            if count.high_node < pub_key {
                count.high_node = pub_key;
            }
        }

        {
            let ours = ledgers.entry(our_closed_hash).or_default();
            ours.nodes_using += 1;
            let our_key = self.env.node_key.public_key();
            if ours.high_node < our_key {
                ours.high_node = our_key;
            }
        }

        // Weigh in validations, trusted ones first
        for (hash, count) in ledgers.iter_mut() {
            let trusted =
                self.env.validations.trusted_validation_count(hash, &|id| self.env.is_trusted(id));
            let total = self.env.validations.validations_for(hash).len();
            count.trusted = trusted;
            count.untrusted = total - trusted;
        }

        let mut best_hash = our_closed_hash;
        let mut best = ledgers.remove(&our_closed_hash).unwrap_or_default();
        let mut switch = false;
        for (hash, count) in ledgers {
            if count.beats(&best) {
                best = count;
                best_hash = hash;
                switch = true;
            }
        }
        (best_hash, switch)
    }

    /// Jump our last closed ledger to the network's. Abnormal path.
    fn switch_last_closed_ledger(&self, inner: &mut OpsInner, new_closed: Arc<Ledger>) {
        error!(
            target: "meridian::ops",
            "ABNORMAL Switching last closed ledger to {}", new_closed.hash()
        );

        if let Some(round) = inner.consensus.take() {
            round.abort();
            inner.stored_proposals.extend(round.take_deferred());
        }

        // The branch we abandon is not a candidate again this session
        let abandoned = self.env.ledgers.closed_ledger().hash();
        self.env.validations.add_dead_ledger(abandoned);

        let network_time = self.env.clock.network_time();
        let open =
            Ledger::child_open(&new_closed, self.env.settings.ledger_seconds, network_time);
        self.env.ledgers.switch_ledgers(new_closed, open);
    }

    /// Create the round that will close the current open ledger.
    fn begin_consensus(&self, inner: &mut OpsInner, network_lcl: Hash256) {
        let closed = self.env.ledgers.closed_ledger();
        info!(
            target: "meridian::ops",
            "Ledger close time for ledger {}", self.env.ledgers.current_seq()
        );

        if let Some(round) = inner.consensus.take() {
            round.abort();
        }

        let round = ConsensusRound::new(
            self.env.clone(),
            network_lcl,
            closed,
            self.env.ledgers.current_close_time(),
            inner.last_close_time,
            inner.last_close_proposers,
            inner.last_close_converge_ms,
            inner.mode == OperatingMode::Full,
        );

        // Replay proposals that survived an LCL switch
        for message in std::mem::take(&mut inner.stored_proposals) {
            round.peer_position(&message);
        }

        debug!(target: "meridian::ops", "Pre-close time, initiating consensus engine");
        inner.consensus = Some(round);
    }

    /// Fold a finished round's results back into our state.
    fn end_consensus(&self, inner: &mut OpsInner, stats: RoundStats) {
        inner.last_close_proposers = stats.proposers;
        inner.last_close_converge_ms = stats.converge_ms.max(1);
        inner.last_close_time = stats.our_close_time;
        if !stats.have_correct_lcl {
            self.set_mode(inner, OperatingMode::Tracking);
        }
        inner.consensus = None;
    }

    // =====================
    // Peer input endpoints
    // =====================

    /// A proposal arrived from the network boundary.
    pub fn recv_proposal(&self, message: &ProposalMessage) -> bool {
        let (mode, round) = {
            let inner = self.inner.lock().unwrap();
            (inner.mode, inner.consensus.clone())
        };
        if mode != OperatingMode::Full {
            debug!(target: "meridian::ops", "Received proposal when not full: {mode:?}");
        }
        match round {
            Some(round) => round.peer_position(message),
            None => true,
        }
    }

    /// A validation arrived; verify and record it.
    pub fn recv_validation(&self, message: &ValidationMessage) -> Result<bool> {
        let validation = SignedValidation::from_message(message)?;
        Ok(self.env.validations.add_validation(validation).is_added())
    }

    /// Route incoming ledger data: candidate sets feed the round, base and
    /// map nodes feed the acquisition registry.
    pub fn recv_ledger_data(&self, data: &LedgerData, from: Option<PeerPtr>) -> bool {
        if data.itype == LedgerItemType::TxCandidate {
            let Some(peer) = from else { return false };
            let Some(round) = self.consensus_round() else { return false };
            let ids: Vec<Vec<u8>> = data.nodes.iter().map(|n| n.id.clone()).collect();
            let bodies: Vec<Vec<u8>> = data.nodes.iter().map(|n| n.body.clone()).collect();
            return round.peer_gave_nodes(peer, data.ledger_hash, &ids, &bodies)
        }
        self.env.acquires.got_ledger_data(data, from)
    }

    /// A peer advertised a transaction set.
    pub fn recv_have_tx_set(&self, peer: PeerPtr, hash: Hash256, status: TxSetStatus) -> bool {
        match self.consensus_round() {
            Some(round) => round.peer_has_set(peer, hash, status),
            None => false,
        }
    }

    /// A peer disconnected.
    pub fn peer_disconnected(&self, peer: &NodeId) {
        if let Some(round) = self.consensus_round() {
            round.remove_peer(peer);
        }
    }

    /// Diagnostic snapshot.
    pub fn to_json(&self) -> JsonValue {
        let inner = self.inner.lock().unwrap();
        let mut map: HashMap<String, JsonValue> = HashMap::new();
        map.insert("mode".into(), JsonValue::from(format!("{:?}", inner.mode)));
        map.insert(
            "last_close_proposers".into(),
            JsonValue::from(inner.last_close_proposers as f64),
        );
        map.insert(
            "last_close_converge_ms".into(),
            JsonValue::from(inner.last_close_converge_ms as f64),
        );
        map.insert("consensus_active".into(), JsonValue::from(inner.consensus.is_some()));
        JsonValue::from(map)
    }
}
