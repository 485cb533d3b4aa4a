//! Tunables for the core. Every field has a default so an empty `[core]`
//! table is a valid configuration.

use crate::error::ConfigError;
use serde::{Deserialize, Serialize};

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq, Eq)]
pub struct CoreConfig {
    /// Decrypted plaintexts kept in memory
    #[serde(default = "default_decrypt_cache_capacity")]
    pub decrypt_cache_capacity: usize,
    /// Recently normalized relay URLs kept in memory
    #[serde(default = "default_relay_cache_capacity")]
    pub relay_cache_capacity: usize,
    /// Subtracted from "now" when an EOSE advances a relay cursor
    #[serde(default = "default_eose_clock_skew_secs")]
    pub eose_clock_skew_secs: u64,
    /// Direct messages older than this are trimmed (except the latest per
    /// conversation)
    #[serde(default = "default_dm_retention_secs")]
    pub dm_retention_secs: u64,
    #[serde(default = "default_trim_interval_secs")]
    pub trim_interval_secs: u64,
    /// Deleted ids (and, separately, deleted addresses) remembered
    #[serde(default = "default_tombstone_capacity")]
    pub tombstone_capacity: usize,
    /// Deletion requests that never matched a stored event are forgotten
    /// after this long
    #[serde(default = "default_tombstone_retention_secs")]
    pub tombstone_retention_secs: u64,
    #[serde(default = "default_true")]
    pub retain_superseded_versions: bool,
    /// Drop unsigned events arriving from relays. Locally unwrapped rumors
    /// are inserted directly and unaffected.
    #[serde(default = "default_true")]
    pub require_relay_signatures: bool,
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self {
            decrypt_cache_capacity: default_decrypt_cache_capacity(),
            relay_cache_capacity: default_relay_cache_capacity(),
            eose_clock_skew_secs: default_eose_clock_skew_secs(),
            dm_retention_secs: default_dm_retention_secs(),
            trim_interval_secs: default_trim_interval_secs(),
            tombstone_capacity: default_tombstone_capacity(),
            tombstone_retention_secs: default_tombstone_retention_secs(),
            retain_superseded_versions: true,
            require_relay_signatures: true,
        }
    }
}

impl CoreConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.decrypt_cache_capacity == 0 {
            return Err(ConfigError::Zero {
                field: "decrypt_cache_capacity",
            });
        }
        if self.relay_cache_capacity == 0 {
            return Err(ConfigError::Zero {
                field: "relay_cache_capacity",
            });
        }
        if self.tombstone_capacity == 0 {
            return Err(ConfigError::Zero {
                field: "tombstone_capacity",
            });
        }
        if self.trim_interval_secs == 0 {
            return Err(ConfigError::Zero {
                field: "trim_interval_secs",
            });
        }
        Ok(())
    }
}

fn default_decrypt_cache_capacity() -> usize {
    2000
}

fn default_relay_cache_capacity() -> usize {
    1024
}

fn default_eose_clock_skew_secs() -> u64 {
    60
}

fn default_dm_retention_secs() -> u64 {
    7 * 24 * 60 * 60
}

fn default_trim_interval_secs() -> u64 {
    300
}

fn default_tombstone_capacity() -> usize {
    10_000
}

fn default_tombstone_retention_secs() -> u64 {
    30 * 24 * 60 * 60
}

fn default_true() -> bool {
    true
}
