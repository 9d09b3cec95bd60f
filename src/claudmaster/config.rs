//! Engine configuration.
//!
//! Constructed in code; no config-file parsing. The only environment input
//! is `DM20_STORAGE_DIR`, which selects the campaign root directory (absent,
//! the current working directory is used).

use crate::claudmaster::party::server::PartyServerConfig;
use crate::claudmaster::prefetch::PrefetchIntensity;
use crate::claudmaster::session::SessionConfig;
use std::path::PathBuf;

/// Environment variable selecting the campaign root.
pub const STORAGE_DIR_ENV: &str = "DM20_STORAGE_DIR";

/// Top-level engine knobs.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Campaign root directory. See [`EngineConfig::from_env`].
    pub storage_root: PathBuf,
    /// Whole-turn budget; exceeding it aggregates what arrived and degrades.
    pub turn_budget_ms: u64,
    pub session: SessionConfig,
    pub party: PartyServerConfig,
    pub prefetch_intensity: PrefetchIntensity,
    /// Ambiguity gap handed to the intent classifier.
    pub score_gap: u32,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            storage_root: PathBuf::from("."),
            turn_budget_ms: 60_000,
            session: SessionConfig::default(),
            party: PartyServerConfig::default(),
            prefetch_intensity: PrefetchIntensity::Conservative,
            score_gap: 1,
        }
    }
}

impl EngineConfig {
    /// Resolve the storage root from `DM20_STORAGE_DIR`, falling back to the
    /// current working directory.
    pub fn from_env() -> Self {
        let storage_root = std::env::var(STORAGE_DIR_ENV)
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("."));
        Self {
            storage_root,
            ..Self::default()
        }
    }

    /// Override the storage root (builder pattern).
    pub fn with_storage_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.storage_root = root.into();
        self
    }

    /// Override the per-turn budget (builder pattern).
    pub fn with_turn_budget_ms(mut self, turn_budget_ms: u64) -> Self {
        self.turn_budget_ms = turn_budget_ms;
        self
    }
}
