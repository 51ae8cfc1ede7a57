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

use crate::{
    crypto::{sha512_half, verify_signature, Hash256, NodeId, NodeKey},
    net::ProposalMessage,
    Error, Result,
};

/// Hashing prefix for proposal signatures ("PRP\0")
pub const PROPOSAL_HASH_PREFIX: u32 = 0x5052_5000;

/// A signed consensus position: "in the round following `prev_ledger`, my
/// position revision `seq` is transaction set `tx_set_hash` closing at
/// `close_time`".
///
/// Per (peer, prev_ledger), only a strictly greater `seq` supersedes.
#[derive(Clone, Debug)]
pub struct LedgerProposal {
    peer: NodeId,
    pub_key: Vec<u8>,
    prev_ledger: Hash256,
    tx_set_hash: Hash256,
    close_time: u32,
    seq: u32,
    signature: Vec<u8>,
}

fn signing_hash(
    prev_ledger: &Hash256,
    tx_set_hash: &Hash256,
    close_time: u32,
    seq: u32,
) -> Hash256 {
    let mut buf = Vec::with_capacity(4 + 32 + 32 + 4 + 4);
    buf.extend_from_slice(&PROPOSAL_HASH_PREFIX.to_be_bytes());
    buf.extend_from_slice(prev_ledger.as_bytes());
    buf.extend_from_slice(tx_set_hash.as_bytes());
    buf.extend_from_slice(&close_time.to_be_bytes());
    buf.extend_from_slice(&seq.to_be_bytes());
    sha512_half(&buf)
}

impl LedgerProposal {
    /// Our initial position for a round, at revision zero.
    pub fn new_ours(
        key: &NodeKey,
        prev_ledger: Hash256,
        tx_set_hash: Hash256,
        close_time: u32,
    ) -> Self {
        let hash = signing_hash(&prev_ledger, &tx_set_hash, close_time, 0);
        Self {
            peer: key.node_id(),
            pub_key: key.public_key(),
            prev_ledger,
            tx_set_hash,
            close_time,
            seq: 0,
            signature: key.sign(hash.as_bytes()),
        }
    }

    /// Parse and verify a peer's proposal.
    pub fn from_message(message: &ProposalMessage) -> Result<Self> {
        let hash = signing_hash(
            &message.prev_ledger,
            &message.tx_set_hash,
            message.close_time,
            message.seq,
        );
        if !verify_signature(&message.pub_key, hash.as_bytes(), &message.signature) {
            return Err(Error::ProposalSignatureMismatch)
        }
        Ok(Self {
            peer: NodeId::from_public_key(&message.pub_key),
            pub_key: message.pub_key.clone(),
            prev_ledger: message.prev_ledger,
            tx_set_hash: message.tx_set_hash,
            close_time: message.close_time,
            seq: message.seq,
            signature: message.signature.clone(),
        })
    }

    /// Advance our position to a new set and close time, bumping `seq`.
    pub fn change_position(&mut self, key: &NodeKey, tx_set_hash: Hash256, close_time: u32) {
        self.seq += 1;
        self.tx_set_hash = tx_set_hash;
        self.close_time = close_time;
        let hash = signing_hash(&self.prev_ledger, &tx_set_hash, close_time, self.seq);
        self.signature = key.sign(hash.as_bytes());
    }

    pub fn to_message(&self) -> ProposalMessage {
        ProposalMessage {
            prev_ledger: self.prev_ledger,
            tx_set_hash: self.tx_set_hash,
            close_time: self.close_time,
            seq: self.seq,
            pub_key: self.pub_key.clone(),
            signature: self.signature.clone(),
        }
    }

    pub fn peer(&self) -> NodeId {
        self.peer
    }

    pub fn prev_ledger(&self) -> Hash256 {
        self.prev_ledger
    }

    pub fn tx_set_hash(&self) -> Hash256 {
        self.tx_set_hash
    }

    pub fn close_time(&self) -> u32 {
        self.close_time
    }

    pub fn seq(&self) -> u32 {
        self.seq
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sign_verify_supersede() {
        let key = NodeKey::from_seed([3u8; 32]);
        let prev = sha512_half(b"prev");
        let set = sha512_half(b"set");

        let mut ours = LedgerProposal::new_ours(&key, prev, set, 700_000_030);
        assert_eq!(ours.seq(), 0);

        let parsed = LedgerProposal::from_message(&ours.to_message()).unwrap();
        assert_eq!(parsed.peer(), key.node_id());
        assert_eq!(parsed.tx_set_hash(), set);

        // Tampered close time must not verify
        let mut tampered = ours.to_message();
        tampered.close_time += 1;
        assert!(LedgerProposal::from_message(&tampered).is_err());

        let new_set = sha512_half(b"new set");
        ours.change_position(&key, new_set, 700_000_060);
        assert_eq!(ours.seq(), 1);
        assert!(LedgerProposal::from_message(&ours.to_message()).is_ok());
    }
}
