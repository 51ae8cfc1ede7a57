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

/// Main result type used throughout the crate
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type used throughout the crate
#[derive(Debug, thiserror::Error)]
pub enum Error {
    // ==============
    // Parsing errors
    // ==============
    #[error("Parse failed: {0}")]
    ParseFailed(&'static str),

    #[error("Decode error: {0}")]
    DecodeError(&'static str),

    #[error("io error: {0:?}")]
    Io(std::io::ErrorKind),

    #[error("TOML deserialization error: {0}")]
    TomlDeserializeError(String),

    // ===================
    // Crypto-layer errors
    // ===================
    #[error("Invalid signature")]
    InvalidSignature,

    #[error("Invalid public key")]
    InvalidPublicKey,

    #[error("Invalid signing seed")]
    InvalidSigningSeed,

    // ====================
    // Ledger-layer errors
    // ====================
    #[error("Ledger header hash mismatch")]
    LedgerHashMismatch,

    #[error("Ledger not found: {0}")]
    LedgerNotFound(String),

    #[error("Ledger is immutable")]
    LedgerImmutable,

    #[error("Authenticated map is missing node {0}")]
    MapMissingNode(String),

    #[error("Authenticated map is corrupt")]
    MapCorrupt,

    // =======================
    // Consensus-layer errors
    // =======================
    #[error("Proposal signature verification failed")]
    ProposalSignatureMismatch,

    #[error("Validation signature verification failed")]
    ValidationSignatureMismatch,

    #[error("Consensus round is missing its own position")]
    MissingOwnPosition,

    #[error("Consensus set not found: {0}")]
    ConsensusSetNotFound(String),

    // ==============
    // Network errors
    // ==============
    #[error("Malformed peer message: {0}")]
    MalformedMessage(&'static str),

    #[error("Unknown peer: {0}")]
    UnknownPeer(String),
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Self::Io(err.kind())
    }
}

impl From<toml::de::Error> for Error {
    fn from(err: toml::de::Error) -> Self {
        Self::TomlDeserializeError(err.to_string())
    }
}
