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

//! Meridian node core: the ledger-consensus engine and the pull-based
//! ledger-acquisition subsystem that feeds it. Networking transports,
//! persistence and RPC surfaces live outside this crate and plug in
//! through the narrow traits in [`net`] and [`tx`].

/// Error and result types
pub mod error;
pub use error::{Error, Result};

/// Node configuration
pub mod settings;
pub use settings::Settings;

/// Clocks and timers
pub mod system;

/// Hashes, node identities and signing keys
pub mod crypto;

/// Authenticated key→value maps and their sync protocol
pub mod shamap;

/// Ledgers, headers and the ledger store
pub mod ledger;

/// Content-addressed object store
pub mod store;

/// Peer-protocol messages and the network boundary
pub mod net;

/// The transaction-engine boundary
pub mod tx;

/// Peer-set driven acquisition jobs
pub mod sync;

/// The consensus round and its policies
pub mod consensus;

/// Signed validations and their collection
pub mod validation;

/// Network mode tracking and round scheduling
pub mod ops;

/// Explicit environment wiring
pub mod node;

/// Async driver tasks
pub mod task;

#[cfg(test)]
mod tests;
