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

/// Pure close/consensus timing policy
pub mod timing;

/// Signed position records
pub mod proposal;
pub use proposal::LedgerProposal;

/// Per-transaction vote tallies
pub mod dispute;
pub use dispute::DisputedTx;

/// The consensus round state machine
pub mod round;
pub use round::{ConsensusRound, RoundState, RoundStats};
