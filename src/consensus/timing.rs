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

//! Pure timing policy for the continuous ledger close cycle: when to close,
//! when agreement amounts to consensus, and how the close-time resolution
//! adapts to the network's recent behavior.

/// Seconds a ledger may remain idle before closing
pub const LEDGER_IDLE_INTERVAL: u32 = 15;

/// Minimum milliseconds of a round before consensus can be declared
pub const LEDGER_MIN_CONSENSUS_MS: u64 = 2000;

/// How often the round state machine is serviced, in milliseconds
pub const LEDGER_GRANULARITY_MS: u64 = 1000;

/// Seconds before the open ledger's close target at which a round is armed
pub const LEDGER_WOBBLE_TIME: u32 = 2;

/// Close-time resolution ladder, in seconds. First and last repeat so the
/// walk clamps at the ends.
pub const LEDGER_TIME_RESOLUTION: [u8; 8] = [10, 10, 20, 30, 60, 90, 120, 120];

/// Raise resolution every this many agreeing ledgers
pub const LEDGER_RES_INCREASE: u32 = 8;

/// Lower resolution on every disagreeing ledger
pub const LEDGER_RES_DECREASE: u32 = 1;

/// Avalanche schedule: required yes-weight before the mid point
pub const AV_INIT_CONSENSUS_PCT: u32 = 50;

/// Percent of previous round time at which the bar rises
pub const AV_MID_CONSENSUS_TIME: u64 = 50;
pub const AV_MID_CONSENSUS_PCT: u32 = 65;

pub const AV_LATE_CONSENSUS_TIME: u64 = 85;
pub const AV_LATE_CONSENSUS_PCT: u32 = 70;

/// The yes-weight a position flip requires at this point of the round.
pub fn needed_weight(percent_time: u64) -> u32 {
    if percent_time < AV_MID_CONSENSUS_TIME {
        AV_INIT_CONSENSUS_PCT
    } else if percent_time < AV_LATE_CONSENSUS_TIME {
        AV_MID_CONSENSUS_PCT
    } else {
        AV_LATE_CONSENSUS_PCT
    }
}

/// How many seconds the open ledger should stay open, given where the
/// network is. Returns the threshold `since_close` is compared against.
pub fn should_close(
    any_transactions: bool,
    previous_proposers: usize,
    proposers_closed: usize,
    previous_seconds: u32,
    current_seconds: u32,
) -> u32 {
    if !any_transactions &&
        proposers_closed <= previous_proposers / 4 &&
        previous_seconds <= LEDGER_IDLE_INTERVAL + 2
    {
        // Nothing to do and the network is not ahead of us
        return LEDGER_IDLE_INTERVAL
    }

    // Slow networks synchronize close times on coarser boundaries
    if previous_seconds > 8 {
        return current_seconds - current_seconds % 4
    }
    if previous_seconds > 4 {
        return current_seconds - current_seconds % 2
    }
    current_seconds
}

/// Whether the round has converged. Once true, our vote is locked in.
pub fn have_consensus(
    previous_proposers: usize,
    current_proposers: usize,
    current_agree: usize,
    current_closed: usize,
    previous_agree_time_ms: u64,
    current_agree_time_ms: u64,
) -> bool {
    if current_agree_time_ms <= LEDGER_MIN_CONSENSUS_MS {
        return false
    }

    // Under 3/4 of the last round's proposers present: allow more time
    if current_proposers < previous_proposers * 3 / 4 &&
        current_agree_time_ms < previous_agree_time_ms + 2000
    {
        return false
    }

    let proposers = current_proposers as i64;
    if (current_agree as i64 * 100 + 100) / (proposers + 1) > 80 {
        return true
    }

    if (current_closed as i64 * 100 - 100) / (proposers + 1) > 50 {
        return true
    }

    false
}

/// Walk the resolution ladder: up on sustained agreement, down on any
/// disagreement, clamped to the endpoints.
pub fn next_close_resolution(previous_resolution: u8, previous_agree: bool, ledger_seq: u32) -> u8 {
    debug_assert!(ledger_seq != 0);

    let mut i = 1;
    while LEDGER_TIME_RESOLUTION[i] != previous_resolution {
        i += 1;
        if i >= LEDGER_TIME_RESOLUTION.len() - 1 {
            return previous_resolution
        }
    }

    if !previous_agree && ledger_seq % LEDGER_RES_DECREASE == 0 {
        return LEDGER_TIME_RESOLUTION[i - 1]
    }

    if previous_agree && ledger_seq % LEDGER_RES_INCREASE == 0 {
        return LEDGER_TIME_RESOLUTION[i + 1]
    }

    previous_resolution
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn idle_network_stays_idle() {
        assert_eq!(should_close(false, 8, 2, 10, 3), LEDGER_IDLE_INTERVAL);
        // Too many proposers already closed: we missed something
        assert_eq!(should_close(false, 8, 3, 10, 3), 3);
    }

    #[test]
    fn close_time_snapping() {
        // Fast network closes immediately
        assert_eq!(should_close(true, 8, 0, 3, 7), 7);
        // Medium networks snap to even seconds
        assert_eq!(should_close(true, 8, 0, 6, 7), 6);
        // Slow networks snap to multiples of four
        assert_eq!(should_close(true, 8, 0, 9, 7), 4);
    }

    #[test]
    fn unanimous_agreement_is_consensus() {
        // For any proposer count, full agreement after the minimum time
        for p in 0..10 {
            assert!(have_consensus(p, p, p, 0, 5000, LEDGER_MIN_CONSENSUS_MS + 1));
            assert!(!have_consensus(p, p, p, 0, 5000, LEDGER_MIN_CONSENSUS_MS));
        }
    }

    #[test]
    fn missing_proposers_delay_consensus() {
        // Half the proposers vanished; inside the grace window no consensus
        assert!(!have_consensus(8, 4, 4, 0, 6000, 3000));
        // After the grace window unanimity among the present wins
        assert!(have_consensus(8, 4, 4, 0, 6000, 8001));
    }

    #[test]
    fn closed_majority_is_consensus() {
        // All 5 proposers closed, nobody agrees with our set yet
        assert!(have_consensus(5, 5, 0, 5, 4000, 2500));
        // 4 of 5 closed lands exactly on the 50% bar, which must not pass
        assert!(!have_consensus(5, 5, 0, 4, 4000, 2500));
    }

    #[test]
    fn resolution_ladder_clamps() {
        // Fixed point at the bottom on disagreement
        assert_eq!(next_close_resolution(LEDGER_TIME_RESOLUTION[1], false, 7), 10);
        // Fixed point at the top on agreement
        assert_eq!(
            next_close_resolution(LEDGER_TIME_RESOLUTION[6], true, LEDGER_RES_INCREASE),
            120
        );
        // Ordinary moves
        assert_eq!(next_close_resolution(30, false, 5), 20);
        assert_eq!(next_close_resolution(30, true, 16), 60);
        assert_eq!(next_close_resolution(30, true, 17), 30);
    }
}
