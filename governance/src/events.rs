//! Consumer notifications.

use govsync_types::ProposalHash;

/// Callbacks fired after committed state changes.
///
/// Invoked from whichever worker thread ran the refresh; consumers needing
/// thread affinity dispatch on their own side.
pub trait GovernanceEvents: Send + Sync {
    /// The proposal list or proposal fields changed.
    fn on_proposals_changed(&self) {}

    /// New or repointed votes were committed for this proposal.
    fn on_votes_changed(&self, _proposal: &ProposalHash) {}
}

/// No-op event sink for embedders that poll instead.
pub struct NullEvents;

impl GovernanceEvents for NullEvents {}
