use thiserror::Error;

use govsync_cache::CacheError;
use govsync_chain::ChainError;
use govsync_types::ProposalHash;

#[derive(Debug, Error)]
pub enum GovernanceError {
    #[error(transparent)]
    Cache(#[from] CacheError),

    #[error(transparent)]
    Chain(#[from] ChainError),

    /// Too many malformed records in one snapshot; nothing was applied and
    /// the cache should be treated as possibly stale.
    #[error("reconcile aborted: {errors} of {total} snapshot records malformed")]
    ReconcileAborted { errors: usize, total: usize },

    /// The network returned no proposals at all. Treated as "source
    /// unavailable", never as "all proposals vanished".
    #[error("empty proposal snapshot; treating source as unavailable")]
    EmptySnapshot,

    /// The external signer produced a signature for a different identity
    /// than the voter it was asked to sign for.
    #[error("signer identity mismatch: expected {expected}, got {actual}")]
    SignatureMismatch { expected: String, actual: String },

    /// The external signer failed outright.
    #[error("signing failed: {0}")]
    Signer(String),

    /// The proposal is not in the registry (not active, or never synced).
    #[error("unknown proposal {0}")]
    UnknownProposal(ProposalHash),

    /// Cooperative cancellation observed at a loop boundary; uncommitted
    /// work from the current unit was discarded.
    #[error("operation cancelled")]
    Cancelled,
}
