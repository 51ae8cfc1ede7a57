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

//! Peer-protocol messages and the narrow boundary the network layer
//! implements. Wire framing, transports and handshakes live outside the
//! core; these types define only the payloads and the operations the core
//! needs from a connected peer.

use std::{io, sync::Arc};

use darkfi_serial::{Decodable, Encodable, SerialDecodable, SerialEncodable};

use crate::{
    crypto::{Hash256, NodeId},
    ledger::Ledger,
    shamap::ShaMap,
};

/// Content selector for ledger data requests.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LedgerItemType {
    /// The ledger base header (plus map roots when available)
    Base,
    /// Transaction-map nodes
    TxNode,
    /// Account-state-map nodes
    AsNode,
    /// A proposed transaction set during consensus
    TxCandidate,
}

impl Encodable for LedgerItemType {
    fn encode<S: io::Write>(&self, s: &mut S) -> io::Result<usize> {
        let tag: u8 = match self {
            Self::Base => 0,
            Self::TxNode => 1,
            Self::AsNode => 2,
            Self::TxCandidate => 3,
        };
        tag.encode(s)
    }
}

impl Decodable for LedgerItemType {
    fn decode<D: io::Read>(d: &mut D) -> io::Result<Self> {
        match u8::decode(d)? {
            0 => Ok(Self::Base),
            1 => Ok(Self::TxNode),
            2 => Ok(Self::AsNode),
            3 => Ok(Self::TxCandidate),
            _ => Err(io::Error::new(io::ErrorKind::InvalidData, "bad ledger item type")),
        }
    }
}

/// Request for ledger content addressed by hash.
#[derive(Clone, Debug, SerialEncodable, SerialDecodable)]
pub struct GetLedger {
    pub ledger_hash: Hash256,
    /// Zero when unknown
    pub ledger_seq: u32,
    pub itype: LedgerItemType,
    pub node_ids: Vec<Vec<u8>>,
}

/// One node in a [`LedgerData`] reply.
#[derive(Clone, Debug, SerialEncodable, SerialDecodable)]
pub struct LedgerNode {
    pub id: Vec<u8>,
    pub body: Vec<u8>,
}

/// Reply carrying requested nodes. For `Base` replies, `nodes[0]` is the
/// header, `nodes[1]` (optional) the state root, `nodes[2]` (optional) the
/// transaction root.
#[derive(Clone, Debug, SerialEncodable, SerialDecodable)]
pub struct LedgerData {
    pub ledger_hash: Hash256,
    pub ledger_seq: u32,
    pub itype: LedgerItemType,
    pub nodes: Vec<LedgerNode>,
}

/// A peer's signed consensus position.
#[derive(Clone, Debug, SerialEncodable, SerialDecodable)]
pub struct ProposalMessage {
    pub prev_ledger: Hash256,
    pub tx_set_hash: Hash256,
    pub close_time: u32,
    pub seq: u32,
    pub pub_key: Vec<u8>,
    pub signature: Vec<u8>,
}

/// A signed assertion that a ledger is the accepted one.
#[derive(Clone, Debug, SerialEncodable, SerialDecodable)]
pub struct ValidationMessage {
    pub ledger_hash: Hash256,
    pub sign_time: u32,
    pub flags: u32,
    pub pub_key: Vec<u8>,
    pub signature: Vec<u8>,
}

/// Advertisement of a transaction set.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TxSetStatus {
    Have,
    CanGet,
}

impl Encodable for TxSetStatus {
    fn encode<S: io::Write>(&self, s: &mut S) -> io::Result<usize> {
        let tag: u8 = match self {
            Self::Have => 0,
            Self::CanGet => 1,
        };
        tag.encode(s)
    }
}

impl Decodable for TxSetStatus {
    fn decode<D: io::Read>(d: &mut D) -> io::Result<Self> {
        match u8::decode(d)? {
            0 => Ok(Self::Have),
            1 => Ok(Self::CanGet),
            _ => Err(io::Error::new(io::ErrorKind::InvalidData, "bad tx set status")),
        }
    }
}

#[derive(Clone, Debug, SerialEncodable, SerialDecodable)]
pub struct HaveTxSet {
    pub status: TxSetStatus,
    pub hash: Hash256,
}

/// Node lifecycle events broadcast to peers.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum NodeEvent {
    ClosingLedger,
    AcceptedLedger,
    LostSync,
}

impl Encodable for NodeEvent {
    fn encode<S: io::Write>(&self, s: &mut S) -> io::Result<usize> {
        let tag: u8 = match self {
            Self::ClosingLedger => 0,
            Self::AcceptedLedger => 1,
            Self::LostSync => 2,
        };
        tag.encode(s)
    }
}

impl Decodable for NodeEvent {
    fn decode<D: io::Read>(d: &mut D) -> io::Result<Self> {
        match u8::decode(d)? {
            0 => Ok(Self::ClosingLedger),
            1 => Ok(Self::AcceptedLedger),
            2 => Ok(Self::LostSync),
            _ => Err(io::Error::new(io::ErrorKind::InvalidData, "bad node event")),
        }
    }
}

#[derive(Clone, Debug, SerialEncodable, SerialDecodable)]
pub struct StatusChange {
    pub event: NodeEvent,
    pub ledger_seq: u32,
    pub network_time: u32,
    pub prev_hash: Hash256,
    pub hash: Hash256,
}

/// Every message the core sends or consumes.
#[derive(Clone, Debug)]
pub enum PeerMessage {
    GetLedger(GetLedger),
    LedgerData(LedgerData),
    Proposal(ProposalMessage),
    Validation(ValidationMessage),
    HaveTxSet(HaveTxSet),
    StatusChange(StatusChange),
}

impl Encodable for PeerMessage {
    fn encode<S: io::Write>(&self, s: &mut S) -> io::Result<usize> {
        let mut n = 0;
        match self {
            Self::GetLedger(m) => {
                n += 0u8.encode(s)?;
                n += m.encode(s)?;
            }
            Self::LedgerData(m) => {
                n += 1u8.encode(s)?;
                n += m.encode(s)?;
            }
            Self::Proposal(m) => {
                n += 2u8.encode(s)?;
                n += m.encode(s)?;
            }
            Self::Validation(m) => {
                n += 3u8.encode(s)?;
                n += m.encode(s)?;
            }
            Self::HaveTxSet(m) => {
                n += 4u8.encode(s)?;
                n += m.encode(s)?;
            }
            Self::StatusChange(m) => {
                n += 5u8.encode(s)?;
                n += m.encode(s)?;
            }
        }
        Ok(n)
    }
}

impl Decodable for PeerMessage {
    fn decode<D: io::Read>(d: &mut D) -> io::Result<Self> {
        match u8::decode(d)? {
            0 => Ok(Self::GetLedger(GetLedger::decode(d)?)),
            1 => Ok(Self::LedgerData(LedgerData::decode(d)?)),
            2 => Ok(Self::Proposal(ProposalMessage::decode(d)?)),
            3 => Ok(Self::Validation(ValidationMessage::decode(d)?)),
            4 => Ok(Self::HaveTxSet(HaveTxSet::decode(d)?)),
            5 => Ok(Self::StatusChange(StatusChange::decode(d)?)),
            _ => Err(io::Error::new(io::ErrorKind::InvalidData, "bad peer message tag")),
        }
    }
}

/// A connected peer, as seen by the core.
pub trait Peer: Send + Sync {
    /// The peer's node identity
    fn id(&self) -> NodeId;

    /// The peer's raw public key
    fn public_key(&self) -> Vec<u8>;

    /// Queue a message to this peer
    fn send(&self, message: &PeerMessage);

    /// Whether the peer advertised holding the given ledger
    fn has_ledger(&self, hash: &Hash256) -> bool;

    /// The closed-ledger hash the peer last advertised
    fn closed_ledger(&self) -> Option<Hash256>;

    /// Demerit the peer for malformed or dishonest data
    fn punish(&self, reason: &str);
}

pub type PeerPtr = Arc<dyn Peer>;

/// Directory of currently connected peers.
pub trait PeerDirectory: Send + Sync {
    fn peers(&self) -> Vec<PeerPtr>;

    fn get(&self, id: &NodeId) -> Option<PeerPtr>;

    /// Relay a message to every connected peer
    fn broadcast(&self, message: &PeerMessage);
}

pub type PeerDirectoryPtr = Arc<dyn PeerDirectory>;

/// Build the reply for a base/tx/state request against a ledger we hold.
/// Returns None when we cannot serve it.
pub fn ledger_data_for(ledger: &Ledger, request: &GetLedger) -> Option<LedgerData> {
    let mut nodes = vec![];

    match request.itype {
        LedgerItemType::Base => {
            // nodes[1] and nodes[2] carry the map roots so the requester can
            // skip one round trip; the receiver applies only the ones whose
            // header hash is nonzero.
            nodes.push(LedgerNode { id: ShaMap::root_node_id(), body: ledger.header_bytes() });
            nodes.push(LedgerNode {
                id: ShaMap::root_node_id(),
                body: ledger.state_map().root_node_body(),
            });
            nodes.push(LedgerNode {
                id: ShaMap::root_node_id(),
                body: ledger.tx_map().root_node_body(),
            });
        }
        LedgerItemType::TxNode => {
            for id in &request.node_ids {
                let body = ledger.tx_map().node_body(id)?;
                nodes.push(LedgerNode { id: id.clone(), body });
            }
        }
        LedgerItemType::AsNode => {
            for id in &request.node_ids {
                let body = ledger.state_map().node_body(id)?;
                nodes.push(LedgerNode { id: id.clone(), body });
            }
        }
        LedgerItemType::TxCandidate => return None,
    }

    Some(LedgerData {
        ledger_hash: request.ledger_hash,
        ledger_seq: ledger.seq(),
        itype: request.itype,
        nodes,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use darkfi_serial::{deserialize, serialize};

    #[test]
    fn message_round_trip() {
        let msg = PeerMessage::GetLedger(GetLedger {
            ledger_hash: crate::crypto::sha512_half(b"lgr"),
            ledger_seq: 9,
            itype: LedgerItemType::TxNode,
            node_ids: vec![vec![], vec![1, 2, 3]],
        });

        let bytes = serialize(&msg);
        let decoded: PeerMessage = deserialize(&bytes).unwrap();
        let PeerMessage::GetLedger(decoded) = decoded else { panic!("wrong variant") };
        assert_eq!(decoded.ledger_seq, 9);
        assert_eq!(decoded.itype, LedgerItemType::TxNode);
        assert_eq!(decoded.node_ids.len(), 2);
    }

    #[test]
    fn bad_tag_rejected() {
        let bytes = vec![250u8];
        assert!(deserialize::<PeerMessage>(&bytes).is_err());
    }
}
