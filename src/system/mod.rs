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

use std::{
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::{Instant, SystemTime, UNIX_EPOCH},
};

/// Clock used by all core components.
///
/// Components never read wall time directly. They take a [`Clock`] handle so
/// tests can drive the timer-based state machines deterministically with a
/// [`ManualClock`], while a daemon runs on the system clock.
#[derive(Clone)]
pub struct Clock(ClockSource);

#[derive(Clone)]
enum ClockSource {
    System(Instant),
    Manual(Arc<ManualClock>),
}

impl Clock {
    /// Create a system clock. Monotonic time starts at zero here.
    pub fn system() -> Self {
        Self(ClockSource::System(Instant::now()))
    }

    /// Create a manually driven clock starting at the given network time.
    pub fn manual(network_time: u32) -> (Self, Arc<ManualClock>) {
        let manual = Arc::new(ManualClock {
            base_secs: AtomicU64::new(network_time as u64),
            elapsed_ms: AtomicU64::new(0),
        });
        (Self(ClockSource::Manual(manual.clone())), manual)
    }

    /// Current network time, in seconds.
    pub fn network_time(&self) -> u32 {
        match &self.0 {
            ClockSource::System(_) => {
                SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_secs() as u32
            }
            ClockSource::Manual(m) => {
                (m.base_secs.load(Ordering::SeqCst) +
                    m.elapsed_ms.load(Ordering::SeqCst) / 1000) as u32
            }
        }
    }

    /// Monotonic milliseconds since the clock was created.
    pub fn monotonic_ms(&self) -> u64 {
        match &self.0 {
            ClockSource::System(start) => start.elapsed().as_millis() as u64,
            ClockSource::Manual(m) => m.elapsed_ms.load(Ordering::SeqCst),
        }
    }
}

/// Hand-cranked time source backing [`Clock::manual`].
pub struct ManualClock {
    base_secs: AtomicU64,
    elapsed_ms: AtomicU64,
}

impl ManualClock {
    /// Advance the clock by the given number of milliseconds.
    pub fn advance_ms(&self, ms: u64) {
        self.elapsed_ms.fetch_add(ms, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn manual_clock_advances() {
        let (clock, handle) = Clock::manual(700_000_000);
        assert_eq!(clock.network_time(), 700_000_000);
        assert_eq!(clock.monotonic_ms(), 0);

        handle.advance_ms(2500);
        assert_eq!(clock.monotonic_ms(), 2500);
        assert_eq!(clock.network_time(), 700_000_002);
    }
}
