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
    crypto::{sha512_half, Hash256},
    shamap::ShaMap,
    Error, Result,
};

/// Ledger registry and the master open/closed ledger pair
pub mod store;

/// Hashing prefix for the ledger header ("LWR\0")
pub const LEDGER_HASH_PREFIX: u32 = 0x4C57_5200;

/// Canonical ledger-header encoding length
pub const HEADER_LEN: usize = 118;

/// Header flag: the network agreed on this close time
pub const CLOSE_FLAG_AGREE: u8 = 0x01;

/// Ledger header. Hash covers the canonical 118-byte encoding.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct LedgerHeader {
    pub seq: u32,
    pub total_coins: u64,
    pub parent_hash: Hash256,
    pub tx_set_hash: Hash256,
    pub state_hash: Hash256,
    pub close_time: u32,
    pub parent_close_time: u32,
    pub close_resolution: u8,
    pub close_flags: u8,
}

impl LedgerHeader {
    /// Canonical big-endian encoding, fixed at 118 bytes.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(HEADER_LEN);
        buf.extend_from_slice(&self.seq.to_be_bytes());
        buf.extend_from_slice(&self.total_coins.to_be_bytes());
        buf.extend_from_slice(self.parent_hash.as_bytes());
        buf.extend_from_slice(self.tx_set_hash.as_bytes());
        buf.extend_from_slice(self.state_hash.as_bytes());
        buf.extend_from_slice(&self.close_time.to_be_bytes());
        buf.extend_from_slice(&self.parent_close_time.to_be_bytes());
        buf.push(self.close_resolution);
        buf.push(self.close_flags);
        buf
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.len() != HEADER_LEN {
            return Err(Error::ParseFailed("ledger header must be 118 bytes"))
        }
        Ok(Self {
            seq: u32::from_be_bytes(bytes[0..4].try_into().unwrap()),
            total_coins: u64::from_be_bytes(bytes[4..12].try_into().unwrap()),
            parent_hash: Hash256::from_slice(&bytes[12..44])?,
            tx_set_hash: Hash256::from_slice(&bytes[44..76])?,
            state_hash: Hash256::from_slice(&bytes[76..108])?,
            close_time: u32::from_be_bytes(bytes[108..112].try_into().unwrap()),
            parent_close_time: u32::from_be_bytes(bytes[112..116].try_into().unwrap()),
            close_resolution: bytes[116],
            close_flags: bytes[117],
        })
    }

    /// Ledger hash: SHA-512-half over the prefix byte string and the
    /// canonical encoding.
    pub fn hash(&self) -> Hash256 {
        let mut buf = Vec::with_capacity(4 + HEADER_LEN);
        buf.extend_from_slice(&LEDGER_HASH_PREFIX.to_be_bytes());
        buf.extend_from_slice(&self.to_bytes());
        sha512_half(&buf)
    }

    pub fn close_agree(&self) -> bool {
        self.close_flags & CLOSE_FLAG_AGREE != 0
    }
}

/// A ledger: header plus the transaction-set and account-state maps.
///
/// Built open, then closed (the transaction set freezes), then accepted
/// (validated). Each ledger exclusively owns its two map snapshots.
#[derive(Clone)]
pub struct Ledger {
    header: LedgerHeader,
    txs: ShaMap,
    state: ShaMap,
    closed: bool,
    accepted: bool,
    immutable: bool,
}

impl Ledger {
    /// The first ledger: empty maps, already closed and accepted.
    pub fn genesis(total_coins: u64, close_time: u32, close_resolution: u8) -> Self {
        let header = LedgerHeader {
            seq: 0,
            total_coins,
            close_time,
            close_resolution,
            close_flags: CLOSE_FLAG_AGREE,
            ..Default::default()
        };
        Self { header, txs: ShaMap::new(), state: ShaMap::new(), closed: true, accepted: true, immutable: true }
    }

    /// A partial ledger reconstructed from an acquired header. Its maps
    /// enter synchronization mode until their nodes arrive.
    pub fn from_header(header: LedgerHeader) -> Self {
        let mut txs = ShaMap::new();
        let mut state = ShaMap::new();
        if !header.tx_set_hash.is_zero() {
            txs.set_synching();
        }
        if !header.state_hash.is_zero() {
            state.set_synching();
        }
        Self { header, txs, state, closed: true, accepted: false, immutable: true }
    }

    /// The open ledger following `prev`: fresh transaction set, account
    /// state carried forward, close target one interval after the parent.
    pub fn child_open(prev: &Ledger, ledger_seconds: u32, now: u32) -> Self {
        let parent_hash = prev.hash();
        let close_time = if prev.header.close_time == 0 {
            let t = now + ledger_seconds - 1;
            t - (t % ledger_seconds)
        } else {
            prev.header.close_time + ledger_seconds
        };
        let header = LedgerHeader {
            seq: prev.header.seq + 1,
            total_coins: prev.header.total_coins,
            parent_hash,
            parent_close_time: prev.header.close_time,
            close_time,
            close_resolution: prev.header.close_resolution,
            ..Default::default()
        };
        Self {
            header,
            txs: ShaMap::new(),
            state: prev.state.snapshot(),
            closed: false,
            accepted: false,
            immutable: false,
        }
    }

    /// Detached copy. A mutable snapshot may be modified by its single
    /// owner; an immutable one is safe to share.
    pub fn snapshot(&self, mutable: bool) -> Self {
        let mut copy = self.clone();
        copy.immutable = !mutable;
        copy
    }

    pub fn header(&self) -> &LedgerHeader {
        &self.header
    }

    pub fn seq(&self) -> u32 {
        self.header.seq
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    pub fn is_accepted(&self) -> bool {
        self.accepted
    }

    /// Current ledger hash. Refreshes the map hashes in the header first,
    /// unless the ledger is immutable.
    pub fn hash(&self) -> Hash256 {
        if self.immutable {
            return self.header.hash()
        }
        let mut header = self.header.clone();
        header.tx_set_hash = self.txs.root_hash();
        header.state_hash = self.state.root_hash();
        header.hash()
    }

    /// Canonical header bytes with map hashes refreshed. This is the body
    /// served for a base-ledger request.
    pub fn header_bytes(&self) -> Vec<u8> {
        if self.immutable {
            return self.header.to_bytes()
        }
        let mut header = self.header.clone();
        header.tx_set_hash = self.txs.root_hash();
        header.state_hash = self.state.root_hash();
        header.to_bytes()
    }

    pub fn tx_map(&self) -> &ShaMap {
        &self.txs
    }

    pub fn tx_map_mut(&mut self) -> &mut ShaMap {
        &mut self.txs
    }

    pub fn state_map(&self) -> &ShaMap {
        &self.state
    }

    pub fn state_map_mut(&mut self) -> &mut ShaMap {
        &mut self.state
    }

    pub fn has_tx(&self, tx_id: &Hash256) -> bool {
        self.txs.has_item(tx_id)
    }

    /// Add a transaction blob to the set. Fails on a frozen set.
    pub fn add_tx(&mut self, tx_id: Hash256, body: Vec<u8>) -> Result<bool> {
        if self.immutable || self.accepted {
            return Err(Error::LedgerImmutable)
        }
        Ok(self.txs.add_item(tx_id, body))
    }

    /// Freeze the transaction set.
    pub fn close(&mut self) {
        self.closed = true;
    }

    /// Mark accepted with the agreed close time, stamping map hashes into
    /// the header. The ledger becomes immutable.
    pub fn set_accepted(&mut self, close_time: u32, close_resolution: u8, close_agree: bool) {
        self.header.tx_set_hash = self.txs.root_hash();
        self.header.state_hash = self.state.root_hash();
        self.header.close_time = close_time;
        self.header.close_resolution = close_resolution;
        self.header.close_flags = if close_agree { CLOSE_FLAG_AGREE } else { 0 };
        self.closed = true;
        self.accepted = true;
        self.immutable = true;
    }

    /// Whether either map is still pulling nodes.
    pub fn is_acquiring(&self) -> bool {
        self.txs.is_synching() || self.state.is_synching()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::content_hash;

    #[test]
    fn header_round_trip() {
        let header = LedgerHeader {
            seq: 42,
            total_coins: 100_000_000_000,
            parent_hash: sha512_half(b"parent"),
            tx_set_hash: sha512_half(b"txs"),
            state_hash: sha512_half(b"state"),
            close_time: 700_000_230,
            parent_close_time: 700_000_200,
            close_resolution: 30,
            close_flags: CLOSE_FLAG_AGREE,
        };

        let bytes = header.to_bytes();
        assert_eq!(bytes.len(), HEADER_LEN);
        let decoded = LedgerHeader::from_bytes(&bytes).unwrap();
        assert_eq!(decoded, header);
        assert_eq!(decoded.hash(), header.hash());

        assert!(LedgerHeader::from_bytes(&bytes[1..]).is_err());
    }

    #[test]
    fn ledger_lifecycle() {
        let genesis = Ledger::genesis(1_000_000, 700_000_000, 30);
        assert!(genesis.is_closed() && genesis.is_accepted());

        let mut open = Ledger::child_open(&genesis, 15, 700_000_000);
        assert_eq!(open.seq(), 1);
        assert_eq!(open.header().parent_hash, genesis.hash());
        assert_eq!(open.header().close_time, 700_000_015);

        let body = b"tx body".to_vec();
        let tx_id = content_hash(&body);
        assert!(open.add_tx(tx_id, body).unwrap());
        assert!(open.has_tx(&tx_id));

        open.set_accepted(700_000_020, 30, true);
        assert!(open.is_accepted());
        assert_eq!(open.header().tx_set_hash, open.tx_map().root_hash());
        assert!(open.header().close_agree());
        assert!(open.add_tx(content_hash(b"late"), b"late".to_vec()).is_err());

        // A header round-tripped through acquisition identifies the same ledger
        let partial = Ledger::from_header(LedgerHeader::from_bytes(&open.header_bytes()).unwrap());
        assert_eq!(partial.hash(), open.hash());
        assert!(partial.is_acquiring());
    }
}
