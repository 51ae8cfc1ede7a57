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

//! One round of ledger agreement: close the open ledger, trade positions
//! with peers, resolve per-transaction disputes under the avalanche
//! schedule, converge on a close time, then build, validate and install
//! the new last closed ledger.
//!
//! All entrypoints serialize on the round lock; the round is never
//! re-entered. The ledger-store lock nests inside it during the install.

use std::{
    collections::{BTreeMap, HashMap, HashSet, VecDeque},
    sync::{Arc, Mutex},
};

use log::{debug, error, info, trace, warn};
use tinyjson::JsonValue;

use crate::{
    consensus::{
        dispute::DisputedTx,
        proposal::LedgerProposal,
        timing::{
            self, needed_weight, LEDGER_MIN_CONSENSUS_MS,
        },
    },
    crypto::{Hash256, NodeId},
    ledger::Ledger,
    net::{
        HaveTxSet, NodeEvent, PeerMessage, PeerPtr, ProposalMessage, StatusChange, TxSetStatus,
    },
    node::EnvPtr,
    shamap::{MapDiff, ShaMap},
    store::{store_map_nodes, ObjectKind},
    sync::{LedgerAcquirePtr, TxSetAcquire},
    tx::{apply_tx_set, retry_failed, CanonicalTxSet},
    validation::SignedValidation,
};

/// Cap on dispute creation per position pair
const DISPUTE_DIFF_LIMIT: usize = 16384;

/// Round states. Transitions are monotonic.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RoundState {
    /// Our ledger is open; others may already have closed
    PreClose,
    /// Establishing consensus on the transaction set and close time
    Establish,
    /// Converged; the accept routine is building the ledger
    Finished,
    /// The new last closed ledger is installed
    Accepted,
}

/// Snapshot of round results handed back to the network-state tracker.
#[derive(Clone, Debug)]
pub struct RoundStats {
    pub proposers: usize,
    pub converge_ms: u64,
    pub new_ledger_hash: Option<Hash256>,
    pub have_correct_lcl: bool,
    pub our_close_time: u32,
}

struct RoundInner {
    state: RoundState,
    aborted: bool,

    prev_ledger_hash: Hash256,
    prev_ledger: Arc<Ledger>,
    acquiring_prev: Option<LedgerAcquirePtr>,
    have_correct_lcl: bool,

    proposing: bool,
    validating: bool,

    /// Our wall-clock close time for this round
    close_time: u32,
    /// Local estimate of when the last close happened, used when the
    /// previous ledger closed without agreement
    last_close_time: u32,
    close_resolution: u8,
    have_close_time_consensus: bool,

    start_ms: u64,
    current_ms: u64,
    close_percent: u64,
    previous_proposers: usize,
    previous_ms: u64,

    our_position: Option<LedgerProposal>,
    peer_positions: HashMap<NodeId, LedgerProposal>,

    /// Completed transaction sets, by root hash
    complete_sets: HashMap<Hash256, ShaMap>,
    /// Sets whose acquisition failed; never re-fetched this round
    failed_sets: HashSet<Hash256>,
    /// In-flight set acquisitions, uniquely owned by the round
    acquiring_sets: HashMap<Hash256, TxSetAcquire>,
    /// Peers known to have a given set
    set_sources: HashMap<Hash256, Vec<NodeId>>,

    disputes: HashMap<Hash256, DisputedTx>,
    /// Seq-0 close-time estimates, for telemetry
    close_times: BTreeMap<u32, usize>,

    /// Proposals referencing a previous ledger that is not ours, buffered
    /// for replay after an LCL switch
    deferred: HashMap<NodeId, VecDeque<ProposalMessage>>,

    new_ledger_hash: Option<Hash256>,
}

/// A single consensus round.
pub struct ConsensusRound {
    env: EnvPtr,
    inner: Mutex<RoundInner>,
}

/// Group peer close times into resolution buckets and find the winning
/// bucket, if any. Returns (consensus reached, consensus close time or 0).
/// With no peer positions, consensus is trivially our own bucket.
pub fn reconcile_close_times(
    peer_close_times: &[u32],
    our_close_time: u32,
    resolution: u8,
    proposing: bool,
    percent_time: u64,
) -> (bool, u32) {
    let resolution = resolution as u32;
    let our_bucket = our_close_time - our_close_time % resolution;

    if peer_close_times.is_empty() {
        return (true, our_bucket)
    }

    let mut buckets: BTreeMap<u32, usize> = BTreeMap::new();
    for close_time in peer_close_times {
        *buckets.entry(close_time - close_time % resolution).or_insert(0) += 1;
    }

    let mut participants = peer_close_times.len();
    if proposing {
        *buckets.entry(our_bucket).or_insert(0) += 1;
        participants += 1;
    }

    let mut threshold = participants * needed_weight(percent_time) as usize / 100;
    if threshold == 0 {
        threshold = 1;
    }

    let mut consensus_time = 0;
    let mut have_consensus = false;
    for (bucket, count) in buckets {
        trace!(
            target: "meridian::consensus::round",
            "CCTime: {bucket} has {count} out of {threshold}"
        );
        if count > threshold {
            have_consensus = true;
            consensus_time = bucket;
            threshold = count;
        }
    }

    (have_consensus, consensus_time)
}

impl ConsensusRound {
    /// Arm a round over `prev_ledger`. `prev_lcl_hash` is the previous
    /// ledger the network expects; when it differs from the ledger we
    /// hold, the round starts by acquiring it and stays silent meanwhile.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        env: EnvPtr,
        prev_lcl_hash: Hash256,
        prev_ledger: Arc<Ledger>,
        close_time: u32,
        last_close_time: u32,
        previous_proposers: usize,
        previous_ms: u64,
        proposing: bool,
    ) -> Arc<Self> {
        let validating = env.validating;
        let close_resolution = timing::next_close_resolution(
            prev_ledger.header().close_resolution,
            prev_ledger.header().close_agree(),
            prev_ledger.seq() + 1,
        );

        debug!(target: "meridian::consensus::round", "Creating consensus round");
        trace!(
            target: "meridian::consensus::round",
            "LCL: {} ct={close_time}", prev_ledger.hash()
        );
        if validating {
            info!(target: "meridian::consensus::round", "Entering consensus process, validating");
        } else {
            info!(target: "meridian::consensus::round", "Entering consensus process, watching");
        }

        let round = Arc::new(Self {
            env: env.clone(),
            inner: Mutex::new(RoundInner {
                state: RoundState::PreClose,
                aborted: false,
                prev_ledger_hash: prev_lcl_hash,
                prev_ledger,
                acquiring_prev: None,
                have_correct_lcl: true,
                proposing: proposing && validating,
                validating,
                close_time,
                last_close_time,
                close_resolution,
                have_close_time_consensus: false,
                start_ms: env.clock.monotonic_ms(),
                current_ms: 0,
                close_percent: 0,
                previous_proposers,
                previous_ms: previous_ms.max(1),
                our_position: None,
                peer_positions: HashMap::new(),
                complete_sets: HashMap::new(),
                failed_sets: HashSet::new(),
                acquiring_sets: HashMap::new(),
                set_sources: HashMap::new(),
                disputes: HashMap::new(),
                close_times: BTreeMap::new(),
                deferred: HashMap::new(),
                new_ledger_hash: None,
            }),
        });

        {
            let mut inner = round.inner.lock().unwrap();
            round.handle_lcl(&mut inner, prev_lcl_hash);
            if !inner.have_correct_lcl {
                info!(
                    target: "meridian::consensus::round",
                    "Entering consensus with wrong LCL, correct is {prev_lcl_hash}"
                );
            }
        }
        round
    }

    pub fn state(&self) -> RoundState {
        self.inner.lock().unwrap().state
    }

    pub fn prev_ledger_hash(&self) -> Hash256 {
        self.inner.lock().unwrap().prev_ledger_hash
    }

    pub fn have_correct_lcl(&self) -> bool {
        self.inner.lock().unwrap().have_correct_lcl
    }

    pub fn stats(&self) -> RoundStats {
        let inner = self.inner.lock().unwrap();
        RoundStats {
            proposers: inner.peer_positions.len(),
            converge_ms: inner.current_ms,
            new_ledger_hash: inner.new_ledger_hash,
            have_correct_lcl: inner.have_correct_lcl,
            our_close_time: inner.close_time,
        }
    }

    /// Drain the proposals buffered for other previous ledgers, in their
    /// per-peer arrival order. Used to carry them across an LCL switch.
    pub fn take_deferred(&self) -> Vec<ProposalMessage> {
        let mut inner = self.inner.lock().unwrap();
        let mut messages = vec![];
        for (_, queue) in std::mem::take(&mut inner.deferred) {
            messages.extend(queue);
        }
        messages
    }

    /// Abandon the round; all further entrypoints become no-ops.
    pub fn abort(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.aborted = true;
        if let Some(acquire) = inner.acquiring_prev.take() {
            acquire.abort();
        }
    }

    // ====================
    // Periodic timer entry
    // ====================

    pub fn timer_entry(&self) {
        let mut inner = self.inner.lock().unwrap();
        if inner.aborted {
            return
        }

        if !inner.have_correct_lcl {
            self.poll_prev_acquire(&mut inner);
            self.check_lcl(&mut inner);
        }

        let now_ms = self.env.clock.monotonic_ms();
        inner.current_ms = now_ms.saturating_sub(inner.start_ms);
        inner.close_percent = inner.current_ms * 100 / inner.previous_ms;

        self.service_set_acquires(&mut inner, now_ms);

        match inner.state {
            RoundState::PreClose => self.state_pre_close(&mut inner),
            RoundState::Establish => self.state_establish(&mut inner),
            RoundState::Finished => {}
            RoundState::Accepted => {}
        }
    }

    fn state_pre_close(&self, inner: &mut RoundInner) {
        let any_transactions = !self.env.ledgers.current_tx_hash().is_zero();
        let proposers_closed = inner.peer_positions.len();
        let network_time = self.env.clock.network_time();

        // Seconds since the last close, from consensus timing when the
        // previous ledger closed with agreement, else from our estimate
        let reference = if inner.have_correct_lcl && inner.prev_ledger.header().close_agree() {
            inner.prev_ledger.header().close_time
        } else {
            inner.last_close_time
        };
        let since_close = network_time.saturating_sub(reference);

        let threshold = timing::should_close(
            any_transactions,
            inner.previous_proposers,
            proposers_closed,
            (inner.previous_ms / 1000) as u32,
            since_close,
        );

        if since_close >= threshold {
            info!(target: "meridian::consensus::round", "Closing ledger");
            inner.state = RoundState::Establish;
            inner.start_ms = self.env.clock.monotonic_ms();
            inner.current_ms = 0;
            inner.close_percent = 0;
            inner.close_time = network_time;
            inner.last_close_time = network_time;
            let prev = inner.prev_ledger.clone();
            self.status_change(inner, NodeEvent::ClosingLedger, &prev);
            self.take_initial_position(inner);
        } else if inner.have_correct_lcl {
            self.check_lcl(inner);
        }
    }

    fn state_establish(&self, inner: &mut RoundInner) {
        if inner.current_ms < LEDGER_MIN_CONSENSUS_MS {
            return
        }
        self.update_our_positions(inner);

        if !inner.have_close_time_consensus {
            if self.have_consensus(inner) {
                info!(
                    target: "meridian::consensus::round",
                    "We have TX consensus but not CT consensus"
                );
            }
            return
        }

        if self.have_consensus(inner) {
            info!(target: "meridian::consensus::round", "Converge cutoff");
            inner.state = RoundState::Finished;
            self.begin_accept(inner);
        }
    }

    // =========================
    // Previous-ledger selection
    // =========================

    /// Harvest a finished previous-ledger acquisition into the store so
    /// `handle_lcl` can pick it up.
    fn poll_prev_acquire(&self, inner: &mut RoundInner) {
        let Some(acquire) = inner.acquiring_prev.clone() else { return };

        if acquire.is_complete() {
            if let Some(ledger) = acquire.ledger() {
                self.env.ledgers.store_ledger(ledger);
            }
            self.env.acquires.drop_ledger(&acquire.target());
            inner.acquiring_prev = None;
            let target = inner.prev_ledger_hash;
            self.handle_lcl(inner, target);
        } else if acquire.is_failed() {
            warn!(
                target: "meridian::consensus::round",
                "Failed to acquire consensus ledger {}", acquire.target()
            );
            self.env.acquires.drop_ledger(&acquire.target());
            inner.acquiring_prev = None;
        }
    }

    fn check_lcl(&self, inner: &mut RoundInner) {
        let mut net_lgr = inner.prev_ledger_hash;
        // A challenger needs at least the configured vote count
        let mut net_count = self.env.settings.min_votes_for_consensus.saturating_sub(1);

        for (hash, count) in self.env.validations.current_validations() {
            if count > net_count && !self.env.validations.is_dead_ledger(&hash) {
                net_lgr = hash;
                net_count = count;
            }
        }

        if net_lgr != inner.prev_ledger_hash {
            warn!(
                target: "meridian::consensus::round",
                "View of consensus changed during consensus ({net_count})"
            );
            self.handle_lcl(inner, net_lgr);
        }
    }

    fn handle_lcl(&self, inner: &mut RoundInner, lcl_hash: Hash256) {
        inner.prev_ledger_hash = lcl_hash;
        if inner.prev_ledger.hash() == lcl_hash {
            inner.have_correct_lcl = true;
            inner.acquiring_prev = None;
            return
        }

        if let Some(ledger) = self.env.ledgers.get_by_hash(&lcl_hash) {
            info!(
                target: "meridian::consensus::round",
                "Acquired the consensus ledger {lcl_hash}"
            );
            inner.prev_ledger = ledger;
            inner.have_correct_lcl = true;
            inner.acquiring_prev = None;
            inner.close_resolution = timing::next_close_resolution(
                inner.prev_ledger.header().close_resolution,
                inner.prev_ledger.header().close_agree(),
                inner.prev_ledger.seq() + 1,
            );
            self.playback_proposals(inner);
            return
        }

        if let Some(acquire) = &inner.acquiring_prev {
            if acquire.target() == lcl_hash {
                return
            }
        }

        warn!(target: "meridian::consensus::round", "Need consensus ledger {lcl_hash}");
        let now_ms = self.env.clock.monotonic_ms();
        inner.acquiring_prev = Some(self.env.acquires.find_create(lcl_hash, now_ms));
        inner.have_correct_lcl = false;
        inner.proposing = false;
        inner.validating = false;
    }

    /// Replay buffered proposals that reference the previous ledger we
    /// just switched to, in the order they arrived.
    fn playback_proposals(&self, inner: &mut RoundInner) {
        let deferred = std::mem::take(&mut inner.deferred);
        for (_, proposals) in deferred {
            for message in proposals {
                if message.prev_ledger == inner.prev_ledger_hash {
                    info!(target: "meridian::consensus::round", "Applying deferred proposal");
                    self.peer_position_locked(inner, &message);
                }
            }
        }
    }

    // ================
    // Position taking
    // ================

    fn take_initial_position(&self, inner: &mut RoundInner) {
        let initial_set = self.env.ledgers.current_tx_snapshot();
        let set_hash = initial_set.root_hash();

        // Process disputes against peers that already took a position
        let mut seen = HashSet::new();
        let mut contrary = vec![];
        for position in inner.peer_positions.values() {
            let hash = position.tx_set_hash();
            if seen.insert(hash) {
                if let Some(set) = inner.complete_sets.get(&hash) {
                    contrary.push(set.clone());
                }
            }
        }
        for theirs in contrary {
            self.create_disputes(inner, &initial_set, &theirs);
        }

        let proposal = LedgerProposal::new_ours(
            &self.env.node_key,
            inner.prev_ledger.hash(),
            set_hash,
            inner.close_time,
        );
        inner.our_position = Some(proposal);
        self.map_complete(inner, set_hash, initial_set, false);

        if inner.proposing {
            self.propose(inner);
        }
    }

    fn propose(&self, inner: &RoundInner) {
        let Some(position) = &inner.our_position else { return };
        trace!(
            target: "meridian::consensus::round",
            "We propose: {} seq {}", position.tx_set_hash(), position.seq()
        );
        self.env.peers.broadcast(&PeerMessage::Proposal(position.to_message()));
    }

    fn status_change(&self, inner: &RoundInner, event: NodeEvent, ledger: &Ledger) {
        let event = if inner.have_correct_lcl { event } else { NodeEvent::LostSync };
        let message = PeerMessage::StatusChange(StatusChange {
            event,
            ledger_seq: ledger.seq(),
            network_time: self.env.clock.network_time(),
            prev_hash: ledger.header().parent_hash,
            hash: ledger.hash(),
        });
        self.env.peers.broadcast(&message);
    }

    fn create_disputes(&self, inner: &mut RoundInner, ours: &ShaMap, theirs: &ShaMap) {
        let differences = ours.diff(theirs, DISPUTE_DIFF_LIMIT);
        for (tx_id, side) in differences {
            let body = match side {
                MapDiff::Ours(body) => body,
                MapDiff::Theirs(body) => body,
            };
            self.add_disputed_tx(inner, tx_id, body);
        }
    }

    fn add_disputed_tx(&self, inner: &mut RoundInner, tx_id: Hash256, body: Vec<u8>) {
        if inner.disputes.contains_key(&tx_id) {
            return
        }
        trace!(target: "meridian::consensus::round", "Transaction {tx_id} is disputed");

        let our_vote = match &inner.our_position {
            Some(position) => match inner.complete_sets.get(&position.tx_set_hash()) {
                Some(set) => set.has_item(&tx_id),
                None => {
                    error!(target: "meridian::consensus::round", "We don't have our own position");
                    false
                }
            },
            None => false,
        };

        let mut dispute = DisputedTx::new(tx_id, body, our_vote);
        for (peer, position) in &inner.peer_positions {
            if let Some(set) = inner.complete_sets.get(&position.tx_set_hash()) {
                dispute.set_vote(*peer, set.has_item(&tx_id));
            }
        }
        inner.disputes.insert(tx_id, dispute);
    }

    /// A transaction set is now complete (acquired, or built locally).
    /// Disputes are created against our position, every peer proposing it
    /// is re-voted exactly once, and its availability is advertised.
    fn map_complete(&self, inner: &mut RoundInner, hash: Hash256, map: ShaMap, acquired: bool) {
        if acquired {
            info!(target: "meridian::consensus::round", "We have acquired TXS {hash}");
        }
        inner.acquiring_sets.remove(&hash);

        if inner.complete_sets.contains_key(&hash) {
            return
        }
        debug_assert_eq!(map.root_hash(), hash);

        if let Some(position) = &inner.our_position {
            let our_hash = position.tx_set_hash();
            if hash != our_hash {
                if let Some(ours) = inner.complete_sets.get(&our_hash).cloned() {
                    self.create_disputes(inner, &ours, &map);
                } else {
                    error!(target: "meridian::consensus::round", "We don't have our own position");
                }
            }
        }

        // Keep the nodes servable for peers pulling this set from us
        store_map_nodes(&self.env.objects, &map, ObjectKind::Transaction, 0);
        inner.complete_sets.insert(hash, map.clone());

        let proposers: Vec<NodeId> = inner
            .peer_positions
            .iter()
            .filter(|(_, position)| position.tx_set_hash() == hash)
            .map(|(peer, _)| *peer)
            .collect();
        if !proposers.is_empty() {
            self.adjust_count(inner, &map, &proposers);
        } else if acquired {
            warn!(
                target: "meridian::consensus::round",
                "By the time we got the set {hash} no peers were proposing it"
            );
        }

        self.env
            .peers
            .broadcast(&PeerMessage::HaveTxSet(HaveTxSet { status: TxSetStatus::Have, hash }));
    }

    /// Re-vote every open dispute for the peers taking this position.
    fn adjust_count(&self, inner: &mut RoundInner, map: &ShaMap, peers: &[NodeId]) {
        for dispute in inner.disputes.values_mut() {
            let set_has = map.has_item(&dispute.tx_id());
            for peer in peers {
                dispute.set_vote(*peer, set_has);
            }
        }
    }

    fn update_our_positions(&self, inner: &mut RoundInner) {
        let Some(our_position) = inner.our_position.clone() else {
            error!(target: "meridian::consensus::round", "Updating positions without one");
            return
        };

        let mut changes = false;
        let mut new_set: Option<ShaMap> = None;
        let close_percent = inner.close_percent;
        let proposing = inner.proposing;

        // Let each dispute re-evaluate; mutate our candidate set on flips
        let flips: Vec<(Hash256, bool, Vec<u8>)> = inner
            .disputes
            .values_mut()
            .filter_map(|dispute| {
                if dispute.update_position(close_percent, proposing) {
                    Some((dispute.tx_id(), dispute.our_vote(), dispute.body().to_vec()))
                } else {
                    None
                }
            })
            .collect();

        for (tx_id, now_yes, body) in flips {
            if !changes {
                let Some(base) = inner.complete_sets.get(&our_position.tx_set_hash()) else {
                    error!(target: "meridian::consensus::round", "Our position set is missing");
                    return
                };
                new_set = Some(base.snapshot());
                changes = true;
            }
            let set = new_set.as_mut().unwrap();
            if now_yes {
                set.add_item(tx_id, body);
            } else {
                set.delete_item(&tx_id);
            }
        }

        // Close-time reconciliation over the peers' current positions
        let peer_close_times: Vec<u32> =
            inner.peer_positions.values().map(|p| p.close_time()).collect();
        let (have_ct_consensus, consensus_close) = reconcile_close_times(
            &peer_close_times,
            our_position.close_time(),
            inner.close_resolution,
            proposing,
            close_percent,
        );
        inner.have_close_time_consensus = have_ct_consensus;
        if have_ct_consensus {
            trace!(
                target: "meridian::consensus::round",
                "Close time consensus reached: {consensus_close}"
            );
        }

        let resolution = inner.close_resolution as u32;
        let our_bucket = our_position.close_time() - our_position.close_time() % resolution;
        if consensus_close != our_bucket && !changes {
            let Some(base) = inner.complete_sets.get(&our_position.tx_set_hash()) else {
                error!(target: "meridian::consensus::round", "Our position set is missing");
                return
            };
            new_set = Some(base.snapshot());
            changes = true;
        }

        if changes {
            let set = new_set.unwrap();
            let new_hash = set.root_hash();
            let mut position = our_position;
            position.change_position(&self.env.node_key, new_hash, consensus_close);
            info!(
                target: "meridian::consensus::round",
                "Position change: CTime {consensus_close}, tx {new_hash}"
            );
            inner.our_position = Some(position);
            if inner.proposing {
                self.propose(inner);
            }
            self.map_complete(inner, new_hash, set, false);
        }
    }

    fn have_consensus(&self, inner: &RoundInner) -> bool {
        let Some(position) = &inner.our_position else { return false };
        let our_hash = position.tx_set_hash();

        let mut agree = 0;
        let mut disagree = 0;
        for peer_position in inner.peer_positions.values() {
            if peer_position.tx_set_hash() == our_hash {
                agree += 1;
            } else {
                disagree += 1;
            }
        }

        let current_validations = self
            .env
            .validations
            .current_validation_count(inner.prev_ledger.header().close_time);

        timing::have_consensus(
            inner.previous_proposers,
            agree + disagree,
            agree,
            current_validations,
            inner.previous_ms,
            inner.current_ms,
        )
    }

    // ====================
    // Peer input endpoints
    // ====================

    /// Ingest a peer's proposal. Idempotent under seq monotonicity.
    pub fn peer_position(&self, message: &ProposalMessage) -> bool {
        let mut inner = self.inner.lock().unwrap();
        if inner.aborted {
            return false
        }
        self.peer_position_locked(&mut inner, message)
    }

    fn peer_position_locked(&self, inner: &mut RoundInner, message: &ProposalMessage) -> bool {
        // A proposal for a different previous ledger is useless now but
        // may matter after an LCL switch
        if message.prev_ledger != inner.prev_ledger_hash {
            self.defer_proposal(inner, message);
            return false
        }

        let proposal = match LedgerProposal::from_message(message) {
            Ok(proposal) => proposal,
            Err(e) => {
                warn!(target: "meridian::consensus::round", "Ledger proposal fails check: {e}");
                return false
            }
        };
        let peer = proposal.peer();

        if let Some(current) = inner.peer_positions.get(&peer) {
            if proposal.seq() <= current.seq() {
                return false
            }
        }

        if proposal.seq() == 0 {
            trace!(
                target: "meridian::consensus::round",
                "Peer reports close time as {}", proposal.close_time()
            );
            *inner.close_times.entry(proposal.close_time()).or_insert(0) += 1;
        }

        info!(
            target: "meridian::consensus::round",
            "Processing peer proposal {}/{}", proposal.seq(), proposal.tx_set_hash()
        );
        let set_hash = proposal.tx_set_hash();
        inner.peer_positions.insert(peer, proposal);

        if let Some(set) = self.get_transaction_tree(inner, set_hash, true) {
            for dispute in inner.disputes.values_mut() {
                dispute.set_vote(peer, set.has_item(&dispute.tx_id()));
            }
        } else {
            trace!(target: "meridian::consensus::round", "Don't have that tx set");
        }

        true
    }

    fn defer_proposal(&self, inner: &mut RoundInner, message: &ProposalMessage) {
        let cap = inner.previous_proposers + 10;
        let peer = NodeId::from_public_key(&message.pub_key);
        let queue = inner.deferred.entry(peer).or_default();
        if queue.len() >= cap {
            queue.pop_front();
        }
        queue.push_back(message.clone());
    }

    /// Fetch a transaction set, optionally starting an acquisition.
    fn get_transaction_tree(
        &self,
        inner: &mut RoundInner,
        hash: Hash256,
        do_acquire: bool,
    ) -> Option<ShaMap> {
        if let Some(set) = inner.complete_sets.get(&hash) {
            return Some(set.clone())
        }

        if inner.state == RoundState::PreClose {
            let current = self.env.ledgers.current_tx_snapshot();
            if current.root_hash() == hash {
                info!(target: "meridian::consensus::round", "Peer proposes our open set");
                self.map_complete(inner, hash, current.clone(), false);
                return Some(current)
            }
        }

        if !do_acquire || inner.failed_sets.contains(&hash) {
            return None
        }

        if hash.is_zero() {
            let empty = ShaMap::new();
            self.map_complete(inner, hash, empty.clone(), false);
            return Some(empty)
        }

        if !inner.acquiring_sets.contains_key(&hash) {
            let now_ms = self.env.clock.monotonic_ms();
            let mut acquire = TxSetAcquire::new(hash, self.env.objects.clone(), now_ms);
            // Seed with peers known to have this set
            if let Some(sources) = inner.set_sources.get(&hash) {
                for peer_id in sources.clone() {
                    if let Some(peer) = self.env.peers.get(&peer_id) {
                        acquire.peer_has(peer);
                    }
                }
            }
            acquire.trigger(None);
            inner.acquiring_sets.insert(hash, acquire);
            self.sweep_set_acquire(inner, hash);
        }
        None
    }

    /// A peer advertised holding a transaction set.
    pub fn peer_has_set(&self, peer: PeerPtr, hash: Hash256, status: TxSetStatus) -> bool {
        if status != TxSetStatus::Have {
            // Indirect availability is future work
            return true
        }
        let mut inner = self.inner.lock().unwrap();
        if inner.aborted {
            return false
        }

        let sources = inner.set_sources.entry(hash).or_default();
        if sources.contains(&peer.id()) {
            return false
        }
        sources.push(peer.id());

        if let Some(acquire) = inner.acquiring_sets.get_mut(&hash) {
            acquire.peer_has(peer);
            self.sweep_set_acquire(&mut inner, hash);
        }
        true
    }

    /// A peer delivered nodes for a set we are acquiring.
    pub fn peer_gave_nodes(
        &self,
        peer: PeerPtr,
        set_hash: Hash256,
        node_ids: &[Vec<u8>],
        node_bodies: &[Vec<u8>],
    ) -> bool {
        let mut inner = self.inner.lock().unwrap();
        if inner.aborted {
            return false
        }
        let Some(acquire) = inner.acquiring_sets.get_mut(&set_hash) else { return false };
        let accepted = acquire.take_nodes(node_ids, node_bodies, Some(&peer));
        self.sweep_set_acquire(&mut inner, set_hash);
        accepted
    }

    /// A peer disconnected: drop its position and votes.
    pub fn remove_peer(&self, peer: &NodeId) {
        let mut inner = self.inner.lock().unwrap();
        inner.peer_positions.remove(peer);
        for dispute in inner.disputes.values_mut() {
            dispute.unvote(peer);
        }
    }

    fn service_set_acquires(&self, inner: &mut RoundInner, now_ms: u64) {
        let hashes: Vec<Hash256> = inner.acquiring_sets.keys().copied().collect();
        for hash in hashes {
            if let Some(acquire) = inner.acquiring_sets.get_mut(&hash) {
                acquire.tick(now_ms);
            }
            self.sweep_set_acquire(inner, hash);
        }
    }

    /// Publish a finished set acquisition into the round.
    fn sweep_set_acquire(&self, inner: &mut RoundInner, hash: Hash256) {
        let Some(acquire) = inner.acquiring_sets.get(&hash) else { return };
        if acquire.is_complete() {
            let acquire = inner.acquiring_sets.remove(&hash).unwrap();
            self.map_complete(inner, hash, acquire.into_map(), true);
        } else if acquire.is_failed() {
            inner.acquiring_sets.remove(&hash);
            inner.failed_sets.insert(hash);
            warn!(
                target: "meridian::consensus::round",
                "A trusted node directed us to acquire an invalid set {hash}"
            );
        }
    }

    // ==============
    // Accept routine
    // ==============

    fn begin_accept(&self, inner: &mut RoundInner) {
        let Some(position) = &inner.our_position else {
            error!(target: "meridian::consensus::round", "Accepting without a position");
            return
        };
        let Some(consensus_set) = inner.complete_sets.get(&position.tx_set_hash()).cloned() else {
            // The set we just agreed on must exist; this is unrecoverable
            panic!("consensus transaction set {} is missing", position.tx_set_hash());
        };
        self.accept(inner, consensus_set);
    }

    fn accept(&self, inner: &mut RoundInner, consensus_set: ShaMap) {
        let position = inner.our_position.clone().expect("checked by begin_accept");
        let resolution = inner.close_resolution as u32;
        let mut close_time = position.close_time() - position.close_time() % resolution;

        info!(target: "meridian::consensus::round", "Computing new LCL based on network consensus");
        if inner.have_correct_lcl {
            info!(
                target: "meridian::consensus::round",
                "CNF tx {}, close {close_time}", position.tx_set_hash()
            );
        }

        // Build the new closed ledger from the consensus set
        let network_time = self.env.clock.network_time();
        let mut new_lcl = Ledger::child_open(
            &inner.prev_ledger,
            self.env.settings.ledger_seconds,
            network_time,
        );
        let mut failed = CanonicalTxSet::new();
        let check = new_lcl.snapshot(false);
        let mut applied =
            apply_tx_set(self.env.engine.as_ref(), &consensus_set, &mut new_lcl, &check, &mut failed, false);
        applied.extend(retry_failed(self.env.engine.as_ref(), &mut new_lcl, &mut failed, false));
        new_lcl.close();

        let mut close_time_correct = true;
        if close_time == 0 {
            // We agreed to disagree on the close time
            close_time_correct = false;
            close_time = inner.prev_ledger.header().close_time + 1;
            info!(target: "meridian::consensus::round", "CNF badclose {close_time}");
        }
        new_lcl.set_accepted(close_time, inner.close_resolution, close_time_correct);
        let new_lcl_hash = new_lcl.hash();

        self.status_change(inner, NodeEvent::AcceptedLedger, &new_lcl);

        if inner.validating {
            let validation = SignedValidation::new(
                &self.env.node_key,
                new_lcl_hash,
                network_time,
                inner.proposing,
            );
            info!(target: "meridian::consensus::round", "CNF Val {new_lcl_hash}");
            let _ = self.env.validations.add_validation(validation.clone());
            self.env.peers.broadcast(&PeerMessage::Validation(validation.to_message()));
        } else {
            info!(target: "meridian::consensus::round", "CNF newLCL {new_lcl_hash}");
        }

        // Fork the next open ledger and carry forward what didn't make it
        let mut new_open = Ledger::child_open(&new_lcl, self.env.settings.ledger_seconds, network_time);

        for dispute in inner.disputes.values() {
            if !dispute.our_vote() {
                trace!(
                    target: "meridian::consensus::round",
                    "Test applying disputed transaction that did not get in"
                );
                let mut one = ShaMap::new();
                one.add_item(dispute.tx_id(), dispute.body().to_vec());
                apply_tx_set(self.env.engine.as_ref(), &one, &mut new_open, &new_lcl, &mut failed, true);
            }
        }

        info!(target: "meridian::consensus::round", "Applying transactions from current ledger");
        let open_txs = self.env.ledgers.current_tx_snapshot();
        apply_tx_set(self.env.engine.as_ref(), &open_txs, &mut new_open, &new_lcl, &mut failed, true);
        retry_failed(self.env.engine.as_ref(), &mut new_open, &mut failed, true);

        // Install under the master-ledger lock
        let new_seq = new_lcl.seq();
        self.env.ledgers.push_ledger(new_lcl, new_open);
        for (tx_id, accounts) in &applied {
            self.env.ledgers.record_account_tx(*tx_id, accounts, new_seq);
        }

        inner.new_ledger_hash = Some(new_lcl_hash);
        inner.state = RoundState::Accepted;

        // How close was our close-time estimate to the network's?
        if inner.validating && !position.tx_set_hash().is_zero() {
            let mut close_total = inner.close_time as u64;
            let mut close_count = 1u64;
            for (time, votes) in &inner.close_times {
                close_count += *votes as u64;
                close_total += *time as u64 * *votes as u64;
            }
            close_total += close_count / 2;
            close_total /= close_count;
            let offset = close_total as i64 - inner.close_time as i64;
            info!(
                target: "meridian::consensus::round",
                "Our close offset is estimated at {offset} ({close_count})"
            );
        }
    }

    // ==========
    // Reporting
    // ==========

    /// Diagnostic snapshot of the round.
    pub fn to_json(&self) -> JsonValue {
        let inner = self.inner.lock().unwrap();
        let mut map: HashMap<String, JsonValue> = HashMap::new();

        map.insert("proposing".into(), JsonValue::from(inner.proposing));
        map.insert("validating".into(), JsonValue::from(inner.validating));
        map.insert("proposers".into(), JsonValue::from(inner.peer_positions.len() as f64));

        if inner.have_correct_lcl {
            map.insert("synched".into(), JsonValue::from(true));
            map.insert(
                "ledger_seq".into(),
                JsonValue::from((inner.prev_ledger.seq() + 1) as f64),
            );
            map.insert(
                "close_granularity".into(),
                JsonValue::from(inner.close_resolution as f64),
            );
        } else {
            map.insert("synched".into(), JsonValue::from(false));
        }

        let state = match inner.state {
            RoundState::PreClose => "open",
            RoundState::Establish => "consensus",
            RoundState::Finished => "finished",
            RoundState::Accepted => "accepted",
        };
        map.insert("state".into(), JsonValue::from(state.to_string()));

        if !inner.disputes.is_empty() {
            map.insert("disputes".into(), JsonValue::from(inner.disputes.len() as f64));
        }
        if let Some(position) = &inner.our_position {
            map.insert(
                "our_position".into(),
                JsonValue::from(position.tx_set_hash().to_string()),
            );
        }

        JsonValue::from(map)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn close_time_buckets() {
        // Four peers in two buckets of two: nobody exceeds the bar
        let peers = [100, 103, 131, 133];
        let (reached, _) = reconcile_close_times(&peers, 101, 30, false, 60);
        assert!(!reached);

        // Our own proposal at 101 makes bucket 90 hold three of five:
        // threshold (5 * 65 / 100) = 3 is not strictly exceeded
        let (reached, _) = reconcile_close_times(&peers, 101, 30, true, 60);
        assert!(!reached);

        // A fifth peer at 90 pushes the bucket to four > 3
        let peers = [100, 103, 131, 133, 90];
        let (reached, time) = reconcile_close_times(&peers, 101, 30, true, 60);
        assert!(reached);
        assert_eq!(time, 90);
    }

    #[test]
    fn no_peers_consensus_on_own_bucket() {
        let (reached, time) = reconcile_close_times(&[], 101, 30, true, 10);
        assert!(reached);
        assert_eq!(time, 90);
    }
}
