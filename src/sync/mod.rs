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

/// Shared timed/retriable request coordination
pub mod peer_set;
pub use peer_set::{PeerSetState, TimerEvent};

/// Full-ledger acquisition jobs
pub mod ledger;
pub use ledger::{LedgerAcquire, LedgerAcquirePtr, LEDGER_ACQUIRE_MAX_TIMEOUTS};

/// Registry of active ledger acquisitions
pub mod master;
pub use master::AcquireMaster;

/// Proposed-transaction-set acquisition jobs
pub mod txset;
pub use txset::{TxSetAcquire, TX_ACQUIRE_TIMEOUT_MS};
