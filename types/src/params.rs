//! Governance parameters with TOML file support.
//!
//! The superblock cadence, funding threshold, and timing windows are network
//! governance constants that differ between instances of this network family,
//! so every one of them is configuration rather than a literal.

use serde::{Deserialize, Serialize};
use std::path::Path;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ParamsError {
    #[error("cannot read parameters file: {0}")]
    Io(String),

    #[error("cannot parse parameters file: {0}")]
    Parse(String),
}

/// Network and engine parameters for the governance cache.
///
/// Can be loaded from a TOML file via [`GovernanceParams::from_toml_file`] or
/// built programmatically (e.g. for tests). Defaults match the mainnet of the
/// reference network.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct GovernanceParams {
    /// Blocks between superblocks (one funding cycle). Mainnet: 43200,
    /// roughly 30 days.
    #[serde(default = "default_superblock_interval")]
    pub superblock_interval: u64,

    /// Blocks before a superblock at which voting closes. Mainnet: 2880,
    /// roughly 2 days.
    #[serde(default = "default_voting_deadline_blocks")]
    pub voting_deadline_blocks: u64,

    /// Nominal seconds between blocks, used to extrapolate timestamps for
    /// heights beyond the chain tip.
    #[serde(default = "default_block_interval_secs")]
    pub block_interval_secs: u64,

    /// Fraction of the active masternode population a proposal's absolute
    /// yes count must reach to be funding-eligible. Mainnet: 0.10.
    #[serde(default = "default_funding_threshold")]
    pub funding_threshold: f64,

    /// Maximum random offset (either direction, seconds) applied to a cast
    /// vote's signature time so one owner's masternodes cannot be correlated
    /// by identical vote timestamps. Zero disables the jitter.
    #[serde(default = "default_vote_time_jitter_secs")]
    pub vote_time_jitter_secs: u64,

    /// How long a proposal's synced votes stay fresh before the next refresh
    /// cycle re-reads them from the network.
    #[serde(default = "default_voting_reload_secs")]
    pub voting_reload_secs: u64,

    /// How long a reconciled proposal snapshot stays fresh before the next
    /// refresh cycle re-fetches it from the network.
    #[serde(default = "default_proposals_cache_valid_secs")]
    pub proposals_cache_valid_secs: u64,

    /// Clock-skew tolerance subtracted from the vote watermark when deciding
    /// which network votes are old enough to skip.
    #[serde(default = "default_vote_sync_grace_secs")]
    pub vote_sync_grace_secs: u64,

    /// Abort a reconcile when more than this fraction of snapshot records is
    /// malformed.
    #[serde(default = "default_max_snapshot_error_ratio")]
    pub max_snapshot_error_ratio: f64,

    /// Retries for external-attribute URL fetches on transient errors.
    #[serde(default = "default_url_fetch_retries")]
    pub url_fetch_retries: u32,

    /// URL template for the external proposal-attribute service; `%HASH%` is
    /// replaced with the proposal hash. Empty disables the fetch.
    #[serde(default)]
    pub ext_attribute_url: String,
}

// ── Serde default helpers ──────────────────────────────────────────────

fn default_superblock_interval() -> u64 {
    43200
}

fn default_voting_deadline_blocks() -> u64 {
    2880
}

fn default_block_interval_secs() -> u64 {
    60
}

fn default_funding_threshold() -> f64 {
    0.10
}

fn default_vote_time_jitter_secs() -> u64 {
    1800
}

fn default_voting_reload_secs() -> u64 {
    3600
}

fn default_proposals_cache_valid_secs() -> u64 {
    3600
}

fn default_vote_sync_grace_secs() -> u64 {
    3600
}

fn default_max_snapshot_error_ratio() -> f64 {
    0.10
}

fn default_url_fetch_retries() -> u32 {
    2
}

impl Default for GovernanceParams {
    fn default() -> Self {
        Self {
            superblock_interval: default_superblock_interval(),
            voting_deadline_blocks: default_voting_deadline_blocks(),
            block_interval_secs: default_block_interval_secs(),
            funding_threshold: default_funding_threshold(),
            vote_time_jitter_secs: default_vote_time_jitter_secs(),
            voting_reload_secs: default_voting_reload_secs(),
            proposals_cache_valid_secs: default_proposals_cache_valid_secs(),
            vote_sync_grace_secs: default_vote_sync_grace_secs(),
            max_snapshot_error_ratio: default_max_snapshot_error_ratio(),
            url_fetch_retries: default_url_fetch_retries(),
            ext_attribute_url: String::new(),
        }
    }
}

impl GovernanceParams {
    /// Load parameters from a TOML file.
    pub fn from_toml_file(path: impl AsRef<Path>) -> Result<Self, ParamsError> {
        let content = std::fs::read_to_string(path).map_err(|e| ParamsError::Io(e.to_string()))?;
        Self::from_toml_str(&content)
    }

    /// Parse parameters from a TOML string.
    pub fn from_toml_str(s: &str) -> Result<Self, ParamsError> {
        toml::from_str(s).map_err(|e| ParamsError::Parse(e.to_string()))
    }
}
