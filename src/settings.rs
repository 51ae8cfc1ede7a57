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

use serde::Deserialize;
use url::Url;

use crate::Result;

/// Node configuration.
///
/// Loaded from a TOML section by the daemon; unrecognized keys are ignored.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Minimum connected peer count to leave Disconnected mode
    pub network_quorum: usize,

    /// Hex-encoded 32-byte signing seed; presence enables validating mode
    pub validation_seed: Option<String>,

    /// Default inter-close interval, in seconds
    pub ledger_seconds: u32,

    /// Minimum votes needed to call a network ledger the consensus ledger
    pub min_votes_for_consensus: usize,

    /// Hex-encoded public keys of trusted validators
    pub trusted_validators: Vec<String>,

    /// Known peer endpoints for daemon bootstrap
    pub peers: Vec<Url>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            network_quorum: 1,
            validation_seed: None,
            ledger_seconds: 15,
            min_votes_for_consensus: 4,
            trusted_validators: vec![],
            peers: vec![],
        }
    }
}

impl Settings {
    /// Parse settings from a TOML document.
    pub fn from_toml(contents: &str) -> Result<Self> {
        Ok(toml::from_str(contents)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_with_defaults() {
        let settings = Settings::from_toml(
            r#"
            network_quorum = 3
            validation_seed = "0101010101010101010101010101010101010101010101010101010101010101"
            peers = ["tcp://127.0.0.1:18340"]
            some_unknown_key = true
            "#,
        )
        .unwrap();

        assert_eq!(settings.network_quorum, 3);
        assert!(settings.validation_seed.is_some());
        assert_eq!(settings.ledger_seconds, 15);
        assert_eq!(settings.min_votes_for_consensus, 4);
        assert_eq!(settings.peers.len(), 1);
    }
}
