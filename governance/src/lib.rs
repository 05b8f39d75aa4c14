//! Governance synchronization core.
//!
//! Keeps the local cache of proposals and votes consistent with the remote
//! network and serves consumers a low-latency view of governance state:
//!
//! - [`ProposalRegistry`] reconciles network snapshots into the cache
//!   (insert new, update changed, deactivate vanished, merge resurrected
//!   duplicates);
//! - [`VoteLedger`] ingests per-proposal votes incrementally, deduplicates
//!   them by content hash, and aggregates the latest vote per masternode;
//! - [`classifier`] derives a proposal's funding eligibility;
//! - [`VoteCaster`] assembles and submits signed votes and folds the result
//!   back into local state;
//! - [`GovernanceSync`] drives one refresh cycle over all of the above.
//!
//! All slow network I/O happens outside the cache session; only persist
//! steps take it, each committing one atomic batch.

pub mod cancel;
pub mod caster;
pub mod classifier;
pub mod error;
pub mod events;
pub mod ledger;
pub mod registry;
pub mod sync;

pub use cancel::CancelFlag;
pub use caster::{CastDecision, CastSummary, SignedVote, VoteCaster, VoteSigner, VoteTarget};
pub use error::GovernanceError;
pub use events::{GovernanceEvents, NullEvents};
pub use ledger::{VoteLedger, VoteSyncPlan, VoteSyncStats};
pub use registry::{ProposalRegistry, ReconcilePlan, ReconcileStats};
pub use sync::{GovernanceSync, RefreshSummary};

/// Live-config symbol: epoch seconds of the last successful proposal
/// reconcile.
pub const CFG_PROPOSALS_LAST_READ_TIME: &str = "proposals_last_read_time";

/// Live-config symbol: maximum vote timestamp seen by any vote sync (the
/// incremental-fetch watermark).
pub const CFG_VOTES_MAX_TIMESTAMP: &str = "prop_votes_max_timestamp";

use govsync_cache::{CacheSession, SessionHandle};
use tracing::error;

/// Run `f` inside an acquired session: commit on success, roll back on
/// error, release in every case.
pub(crate) fn with_session<R>(
    cache: &CacheSession,
    f: impl FnOnce(&SessionHandle<'_>) -> Result<R, GovernanceError>,
) -> Result<R, GovernanceError> {
    let handle = cache.acquire()?;
    match f(&handle) {
        Ok(value) => {
            let committed = cache.commit();
            let released = cache.release();
            committed?;
            released?;
            Ok(value)
        }
        Err(e) => {
            if let Err(rb) = cache.rollback() {
                error!(error = %rb, "rollback failed after session error");
            }
            if let Err(rl) = cache.release() {
                error!(error = %rl, "release failed after session error");
            }
            Err(e)
        }
    }
}
