//! Funding-eligibility classification.

use govsync_types::VotingStatus;

/// Classify a proposal from its vote tally and the active masternode
/// population.
///
/// A proposal is funding-eligible while voting is in progress and its
/// absolute yes count (yes − no) reaches `funding_threshold` of the active
/// population. The returned caption is the human-readable status line shown
/// next to the proposal.
///
/// Pure function; the threshold is a network governance constant supplied by
/// configuration.
pub fn classify(
    voting_in_progress: bool,
    absolute_yes_count: i64,
    active_masternode_count: usize,
    funding_threshold: f64,
) -> (VotingStatus, String) {
    if !voting_in_progress {
        return (VotingStatus::Closed, "Unavailable".to_string());
    }

    let threshold = active_masternode_count as f64 * funding_threshold;
    let needed = threshold as i64;
    if absolute_yes_count as f64 >= threshold {
        (
            VotingStatus::Eligible,
            format!(
                "Passing +{} ({} of {} needed)",
                absolute_yes_count - needed,
                absolute_yes_count,
                needed
            ),
        )
    } else {
        (
            VotingStatus::NeedsVotes,
            format!("Needs additional {} votes", needed - absolute_yes_count),
        )
    }
}
