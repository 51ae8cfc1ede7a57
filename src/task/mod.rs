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

//! Async driver tasks a daemon spawns on its executor. The core state
//! machines are synchronous; this loop feeds them timer ticks. Ledger
//! acquisitions are serviced from the same tick.

use std::{sync::Arc, time::Duration};

use log::info;

use crate::{ops::NetworkOps, Result};

/// Drive the network state machine until the node shuts down. The tick
/// itself decides how soon it wants to run again.
pub async fn state_timer_task(ops: Arc<NetworkOps>) -> Result<()> {
    info!(target: "meridian::task::state_timer_task", "Starting network state task...");
    loop {
        let delay_ms = ops.state_tick();
        smol::Timer::after(Duration::from_millis(delay_ms)).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{ops::OperatingMode, tests::harness::TestNet};

    #[test]
    fn state_timer_task_drives_ticks() {
        let net = TestNet::new(2);
        let ops = net.nodes[0].ops.clone();

        // The task ticks once before its first sleep; cut it off shortly
        // after with a race against a real timer.
        smol::block_on(smol::future::or(
            async {
                let _ = state_timer_task(ops.clone()).await;
            },
            async {
                smol::Timer::after(Duration::from_millis(50)).await;
            },
        ));

        // One tick was enough to promote past Disconnected
        assert_eq!(ops.mode(), OperatingMode::Full);
    }
}
