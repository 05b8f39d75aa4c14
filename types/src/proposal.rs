//! The proposal entity held in the cache.

use serde::{Deserialize, Serialize};

use crate::hash::{ProposalHash, TxHash};
use crate::time::Timestamp;

/// Funding-eligibility classification of a proposal, derived from vote
/// tallies, the masternode population, and superblock timing.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum VotingStatus {
    /// Voting in progress and the proposal currently clears the funding
    /// threshold.
    Eligible,
    /// Voting in progress but more yes votes are needed.
    NeedsVotes,
    /// Voting window closed; historical funding status is not recorded.
    #[default]
    Closed,
}

/// A spending proposal subject to masternode vote, as mirrored into the
/// local cache.
///
/// Identity: `hash` is the immutable network identifier; `fee_hash`
/// references the funding transaction. The cache row id is assigned by the
/// store on first persist and is tracked alongside, not inside, this struct.
///
/// Rows are deactivated rather than deleted when a proposal disappears from
/// the network, so vote history stays referentially intact.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Proposal {
    // Identity
    pub hash: ProposalHash,
    pub fee_hash: TxHash,

    // Descriptive
    pub name: String,
    /// Display title from the external attribute source; falls back to
    /// `name` when unset.
    pub title: String,
    pub url: String,
    pub owner: String,
    pub payment_address: String,

    // Schedule
    pub block_start: u64,
    pub block_end: u64,
    pub payment_start_time: Timestamp,
    pub payment_end_time: Timestamp,
    /// Timestamp of the fee transaction; fetched once at first sighting and
    /// treated as immutable afterwards.
    pub creation_time: Timestamp,

    // Tallies
    pub yes_count: u32,
    pub no_count: u32,
    pub abstain_count: u32,
    /// `yes_count - no_count`; may be negative.
    pub absolute_yes_count: i64,
    pub total_payment_count: u32,
    /// Locally recomputed; the network-reported value is unreliable and is
    /// ignored.
    pub remaining_payment_count: u32,
    pub ratio: f64,
    pub total_payment: f64,
    pub monthly_payment: f64,

    // Network validity flags
    pub is_established: bool,
    pub is_valid: bool,
    pub is_valid_reason: String,
    pub ext_attributes_loaded: bool,

    // Cache lifecycle
    pub active: bool,
    pub created_at: Timestamp,
    pub deactivated_at: Option<Timestamp>,
    /// When this proposal's votes were last synced from the network;
    /// `Timestamp::EPOCH` means never.
    pub voting_last_read_time: Timestamp,

    // Derived, recomputed after every reconcile/sync
    pub voting_in_progress: bool,
    pub voting_status: VotingStatus,
    pub voting_status_caption: String,
}

impl Proposal {
    /// The title to display: the external-attribute title when present,
    /// otherwise the on-chain name.
    pub fn display_title(&self) -> &str {
        if self.title.is_empty() {
            &self.name
        } else {
            &self.title
        }
    }
}
