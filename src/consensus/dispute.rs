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

use std::collections::HashMap;

use log::trace;

use crate::{
    consensus::timing::needed_weight,
    crypto::{Hash256, NodeId},
};

/// A transaction whose membership in the closing ledger is contested.
/// Tracks each peer's vote and our own position, which flips as weighted
/// evidence accumulates over the round.
pub struct DisputedTx {
    tx_id: Hash256,
    body: Vec<u8>,
    our_vote: bool,
    yays: usize,
    nays: usize,
    votes: HashMap<NodeId, bool>,
}

impl DisputedTx {
    pub fn new(tx_id: Hash256, body: Vec<u8>, our_vote: bool) -> Self {
        Self { tx_id, body, our_vote, yays: 0, nays: 0, votes: HashMap::new() }
    }

    pub fn tx_id(&self) -> Hash256 {
        self.tx_id
    }

    pub fn body(&self) -> &[u8] {
        &self.body
    }

    pub fn our_vote(&self) -> bool {
        self.our_vote
    }

    pub fn yays(&self) -> usize {
        self.yays
    }

    pub fn nays(&self) -> usize {
        self.nays
    }

    pub fn vote_count(&self) -> usize {
        self.votes.len()
    }

    /// Record or update a peer's vote.
    pub fn set_vote(&mut self, peer: NodeId, votes_yes: bool) {
        match self.votes.insert(peer, votes_yes) {
            None => {
                if votes_yes {
                    trace!(target: "meridian::consensus::dispute", "Peer {peer} votes YES on {}", self.tx_id);
                    self.yays += 1;
                } else {
                    trace!(target: "meridian::consensus::dispute", "Peer {peer} votes NO on {}", self.tx_id);
                    self.nays += 1;
                }
            }
            Some(previous) if previous != votes_yes => {
                if votes_yes {
                    self.nays -= 1;
                    self.yays += 1;
                } else {
                    self.yays -= 1;
                    self.nays += 1;
                }
            }
            Some(_) => {}
        }
    }

    /// Forget a departed peer's vote.
    pub fn unvote(&mut self, peer: &NodeId) {
        if let Some(voted_yes) = self.votes.remove(peer) {
            if voted_yes {
                self.yays -= 1;
            } else {
                self.nays -= 1;
            }
        }
    }

    /// Re-evaluate our position. Returns true iff it flipped.
    ///
    /// When proposing we weigh our own vote in and demand a yes-weight that
    /// grows over the round; otherwise we merely recognize the majority.
    pub fn update_position(&mut self, percent_time: u64, proposing: bool) -> bool {
        if self.our_vote && self.nays == 0 {
            return false
        }
        if !self.our_vote && self.yays == 0 {
            return false
        }

        let new_position = if proposing {
            let weight = (self.yays as u64 * 100 + if self.our_vote { 100 } else { 0 }) /
                (self.nays as u64 + self.yays as u64 + 1);
            weight > needed_weight(percent_time) as u64
        } else {
            self.yays > self.nays
        };

        if new_position == self.our_vote {
            return false
        }

        self.our_vote = new_position;
        trace!(
            target: "meridian::consensus::dispute",
            "We now vote {} on {}", if new_position { "YES" } else { "NO" }, self.tx_id
        );
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::sha512_half;

    fn peer(n: u8) -> NodeId {
        NodeId([n; 20])
    }

    #[test]
    fn tallies_stay_consistent() {
        let mut dispute = DisputedTx::new(sha512_half(b"tx"), b"tx".to_vec(), false);

        dispute.set_vote(peer(1), true);
        dispute.set_vote(peer(2), false);
        dispute.set_vote(peer(3), true);
        assert_eq!((dispute.yays(), dispute.nays()), (2, 1));
        assert_eq!(dispute.yays() + dispute.nays(), dispute.vote_count());

        // Changing a vote moves the tally, duplicates do not
        dispute.set_vote(peer(2), true);
        dispute.set_vote(peer(2), true);
        assert_eq!((dispute.yays(), dispute.nays()), (3, 0));

        dispute.unvote(&peer(1));
        assert_eq!((dispute.yays(), dispute.nays()), (2, 0));
        assert_eq!(dispute.yays() + dispute.nays(), dispute.vote_count());
    }

    #[test]
    fn majority_flips_us_past_the_mid_bar() {
        // Two honest peers carry tx X, we do not: weight 66 > 65 at 60%
        let mut dispute = DisputedTx::new(sha512_half(b"X"), b"X".to_vec(), false);
        dispute.set_vote(peer(1), true);
        dispute.set_vote(peer(2), true);

        assert!(dispute.update_position(60, true));
        assert!(dispute.our_vote());

        // Already at the decision: no further flip
        assert!(!dispute.update_position(60, true));
    }

    #[test]
    fn bar_rises_late_in_the_round() {
        // weight = (2*100)/(1+2+1) = 50: over no bar
        let mut dispute = DisputedTx::new(sha512_half(b"Y"), b"Y".to_vec(), false);
        dispute.set_vote(peer(1), true);
        dispute.set_vote(peer(2), true);
        dispute.set_vote(peer(3), false);
        assert!(!dispute.update_position(40, true));

        // One more yes: weight = 300/5 = 60 > 50 early, but not > 65 mid
        dispute.set_vote(peer(4), true);
        assert!(!dispute.update_position(60, true));
        assert!(dispute.update_position(40, true));
    }

    #[test]
    fn observers_follow_plain_majority() {
        let mut dispute = DisputedTx::new(sha512_half(b"Z"), b"Z".to_vec(), false);
        dispute.set_vote(peer(1), true);
        assert!(dispute.update_position(95, false));
        assert!(dispute.our_vote());

        // A tie is not a strict majority: observers drop back to NO
        dispute.set_vote(peer(2), false);
        assert!(dispute.update_position(95, false));
        assert!(!dispute.our_vote());

        // No votes at all: no decision to take
        dispute.unvote(&peer(1));
        dispute.unvote(&peer(2));
        assert!(!dispute.update_position(95, false));
    }
}
