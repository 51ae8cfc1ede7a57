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

use std::{fmt, io};

use darkfi_serial::{Decodable, Encodable};
use ed25519_compact::{KeyPair, Noise, PublicKey, Seed, Signature};
use sha2::{Digest, Sha512};

use crate::{Error, Result};

/// 32-byte content hash. Value equality only.
#[derive(Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Hash256(pub [u8; 32]);

pub const ZERO_HASH: Hash256 = Hash256([0u8; 32]);

impl Hash256 {
    pub fn is_zero(&self) -> bool {
        self.0 == [0u8; 32]
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    pub fn from_slice(bytes: &[u8]) -> Result<Self> {
        if bytes.len() != 32 {
            return Err(Error::ParseFailed("Hash256 must be 32 bytes"))
        }
        let mut buf = [0u8; 32];
        buf.copy_from_slice(bytes);
        Ok(Self(buf))
    }
}

impl fmt::Display for Hash256 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

impl fmt::Debug for Hash256 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Hash256({})", hex::encode(&self.0[..8]))
    }
}

impl Encodable for Hash256 {
    fn encode<S: io::Write>(&self, s: &mut S) -> io::Result<usize> {
        s.write_all(&self.0)?;
        Ok(32)
    }
}

impl Decodable for Hash256 {
    fn decode<D: io::Read>(d: &mut D) -> io::Result<Self> {
        let mut buf = [0u8; 32];
        d.read_exact(&mut buf)?;
        Ok(Self(buf))
    }
}

/// 20-byte public-key fingerprint identifying a node. Total order.
#[derive(Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(pub [u8; 20]);

impl NodeId {
    /// Derive the fingerprint of a raw public key.
    pub fn from_public_key(public_key: &[u8]) -> Self {
        let digest = sha512_half(public_key);
        let mut buf = [0u8; 20];
        buf.copy_from_slice(&digest.0[..20]);
        Self(buf)
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

impl fmt::Debug for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "NodeId({})", hex::encode(&self.0[..6]))
    }
}

impl Encodable for NodeId {
    fn encode<S: io::Write>(&self, s: &mut S) -> io::Result<usize> {
        s.write_all(&self.0)?;
        Ok(20)
    }
}

impl Decodable for NodeId {
    fn decode<D: io::Read>(d: &mut D) -> io::Result<Self> {
        let mut buf = [0u8; 20];
        d.read_exact(&mut buf)?;
        Ok(Self(buf))
    }
}

/// First half of SHA-512. Used for the ledger and validation hashing
/// contracts, which pin this construction.
pub fn sha512_half(data: &[u8]) -> Hash256 {
    let digest = Sha512::digest(data);
    let mut buf = [0u8; 32];
    buf.copy_from_slice(&digest[..32]);
    Hash256(buf)
}

/// Content hash for transaction bodies and map nodes.
pub fn content_hash(data: &[u8]) -> Hash256 {
    Hash256(blake3::hash(data).into())
}

/// Node signing key, derived deterministically from a 32-byte seed.
pub struct NodeKey {
    keypair: KeyPair,
}

impl NodeKey {
    pub fn from_seed(seed: [u8; 32]) -> Self {
        Self { keypair: KeyPair::from_seed(Seed::new(seed)) }
    }

    /// Parse a hex-encoded 32-byte seed, as carried in the configuration.
    pub fn from_hex_seed(hex_seed: &str) -> Result<Self> {
        let bytes = hex::decode(hex_seed).map_err(|_| Error::InvalidSigningSeed)?;
        let mut seed = [0u8; 32];
        if bytes.len() != 32 {
            return Err(Error::InvalidSigningSeed)
        }
        seed.copy_from_slice(&bytes);
        Ok(Self::from_seed(seed))
    }

    pub fn random() -> Self {
        Self { keypair: KeyPair::from_seed(Seed::new(rand::random())) }
    }

    pub fn public_key(&self) -> Vec<u8> {
        self.keypair.pk[..].to_vec()
    }

    pub fn node_id(&self) -> NodeId {
        NodeId::from_public_key(&self.keypair.pk[..])
    }

    pub fn sign(&self, message: &[u8]) -> Vec<u8> {
        self.keypair.sk.sign(message, Some(Noise::default())).to_vec()
    }
}

/// Verify `signature` over `message` under a raw public key.
pub fn verify_signature(public_key: &[u8], message: &[u8], signature: &[u8]) -> bool {
    let Ok(pk) = PublicKey::from_slice(public_key) else { return false };
    let Ok(sig) = Signature::from_slice(signature) else { return false };
    pk.verify(message, &sig).is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sign_and_verify() {
        let key = NodeKey::from_seed([7u8; 32]);
        let msg = b"the ledger closes at dawn";
        let sig = key.sign(msg);
        assert!(verify_signature(&key.public_key(), msg, &sig));
        assert!(!verify_signature(&key.public_key(), b"another message", &sig));

        // Deterministic identity from the seed
        let again = NodeKey::from_seed([7u8; 32]);
        assert_eq!(key.node_id(), again.node_id());
    }

    #[test]
    fn sha512_half_is_stable() {
        let a = sha512_half(b"meridian");
        let b = sha512_half(b"meridian");
        assert_eq!(a, b);
        assert_ne!(a, sha512_half(b"meridiam"));
        assert!(!a.is_zero());
    }
}
