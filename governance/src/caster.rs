//! Cast-vote construction, signing, submission, and write-back.
//!
//! The caster assembles the canonical signing payload for each target
//! masternode, hands it to the external signer (a hardware device or
//! equivalent; this engine performs no cryptography itself), submits the
//! signed vote to the network, and folds successful casts into local state.
//! The per-proposal vote read time is then forced backward so the next sync
//! cycle re-reads this vote from the authoritative source instead of
//! trusting only the local write.

use rand::Rng;

use govsync_cache::CacheSession;
use govsync_chain::{ChainClient, VoteSubmission};
use govsync_types::{
    GovernanceParams, MasternodeIdent, ProposalHash, Timestamp, TxHash, VoteResult,
};
use tracing::{info, warn};

use crate::ledger::VoteLedger;
use crate::registry::ProposalRegistry;
use crate::{with_session, GovernanceError};

/// The daemon answers this exact string on a successful raw-vote submission.
const SUBMIT_SUCCESS: &str = "Voted successfully";

/// A masternode the user can vote on behalf of.
#[derive(Debug, Clone)]
pub struct VoteTarget {
    pub ident: MasternodeIdent,
    pub collateral_tx: TxHash,
    pub collateral_tx_index: u32,
    /// The voting address the signer is expected to sign with; a signature
    /// from any other identity aborts the target.
    pub voting_address: String,
}

/// A signature produced by the external signer, together with the identity
/// it actually signed with.
#[derive(Debug, Clone)]
pub struct SignedVote {
    pub signature: String,
    pub signer_address: String,
}

/// External signing collaborator.
pub trait VoteSigner: Send + Sync {
    fn sign(&self, target: &VoteTarget, payload: &str) -> Result<SignedVote, GovernanceError>;
}

/// Caller decision after a per-target failure in a multi-target cast.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CastDecision {
    Continue,
    Abort,
}

/// Aggregate outcome of one cast call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CastSummary {
    pub succeeded: usize,
    pub failed: usize,
    /// Whether the caller aborted the remaining targets after a failure.
    pub aborted: bool,
}

/// The canonical pipe-delimited payload the voter signs:
/// `ident | proposal_hash | 1 | vote_code | sig_time`
/// ("1" is the governance object type of a proposal).
pub fn signing_payload(
    ident: &MasternodeIdent,
    proposal_hash: &ProposalHash,
    result: VoteResult,
    sig_time: Timestamp,
) -> String {
    format!(
        "{}|{}|1|{}|{}",
        ident,
        proposal_hash,
        result.wire_code(),
        sig_time.as_secs()
    )
}

pub struct VoteCaster<'a> {
    chain: &'a dyn ChainClient,
    signer: &'a dyn VoteSigner,
    params: &'a GovernanceParams,
}

impl<'a> VoteCaster<'a> {
    pub fn new(
        chain: &'a dyn ChainClient,
        signer: &'a dyn VoteSigner,
        params: &'a GovernanceParams,
    ) -> Self {
        Self {
            chain,
            signer,
            params,
        }
    }

    /// Signature time for one target: now, optionally jittered by a random
    /// offset so one owner's masternodes cannot be correlated by identical
    /// vote timestamps.
    fn sig_time(&self) -> Timestamp {
        let now = Timestamp::now();
        let jitter = self.params.vote_time_jitter_secs;
        if jitter == 0 {
            return now;
        }
        let offset = rand::thread_rng().gen_range(-(jitter as i64)..=(jitter as i64));
        if offset >= 0 {
            now.plus_secs(offset as u64)
        } else {
            now.minus_secs(offset.unsigned_abs())
        }
    }

    fn cast_one(
        &self,
        proposal_hash: &ProposalHash,
        target: &VoteTarget,
        result: VoteResult,
    ) -> Result<Timestamp, GovernanceError> {
        let sig_time = self.sig_time();
        let payload = signing_payload(&target.ident, proposal_hash, result, sig_time);

        let signed = self.signer.sign(target, &payload)?;
        if signed.signer_address != target.voting_address {
            return Err(GovernanceError::SignatureMismatch {
                expected: target.voting_address.clone(),
                actual: signed.signer_address,
            });
        }

        let submission = VoteSubmission {
            collateral_tx: target.collateral_tx,
            collateral_tx_index: target.collateral_tx_index,
            proposal_hash: *proposal_hash,
            signal: "funding".to_string(),
            vote: result,
            sig_time,
            signature: signed.signature,
        };
        let answer = self.chain.submit_vote(&submission)?;
        if answer != SUBMIT_SUCCESS {
            return Err(GovernanceError::Chain(govsync_chain::ChainError::Network(
                format!("daemon rejected vote: {}", answer),
            )));
        }
        Ok(sig_time)
    }

    /// Sign and submit `result` on `proposal_hash` for each target in turn.
    /// Slow (hardware signing + network); takes no lock and touches no
    /// shared state.
    ///
    /// Per-target failures do not stop the batch unless `on_failure` asks to
    /// abort (it is consulted only when further targets remain). Returns the
    /// aggregate summary plus the successfully cast votes for
    /// [`VoteCaster::record`].
    pub fn submit(
        &self,
        proposal_hash: &ProposalHash,
        targets: &[VoteTarget],
        result: VoteResult,
        mut on_failure: impl FnMut(&VoteTarget, &GovernanceError) -> CastDecision,
    ) -> (CastSummary, Vec<(MasternodeIdent, Timestamp)>) {
        let mut summary = CastSummary::default();
        let mut cast_votes: Vec<(MasternodeIdent, Timestamp)> = Vec::new();

        for (index, target) in targets.iter().enumerate() {
            match self.cast_one(proposal_hash, target, result) {
                Ok(sig_time) => {
                    info!(proposal = %proposal_hash, voter = %target.ident, %result, "vote cast");
                    cast_votes.push((target.ident.clone(), sig_time));
                    summary.succeeded += 1;
                }
                Err(e) => {
                    warn!(proposal = %proposal_hash, voter = %target.ident, error = %e, "vote failed");
                    summary.failed += 1;
                    if index < targets.len() - 1
                        && on_failure(target, &e) == CastDecision::Abort
                    {
                        summary.aborted = true;
                        break;
                    }
                }
            }
        }

        (summary, cast_votes)
    }

    /// Fold successfully cast votes into local state: apply each to the
    /// ledger under the usual latest-wins rule and push the proposal's vote
    /// read time backward (persisted in one transaction) so the next sync
    /// re-reads this vote from the authoritative source.
    pub fn record(
        &self,
        registry: &mut ProposalRegistry,
        ledger: &mut VoteLedger,
        cache: &CacheSession,
        proposal_hash: &ProposalHash,
        cast_votes: &[(MasternodeIdent, Timestamp)],
        result: VoteResult,
    ) -> Result<(), GovernanceError> {
        if cast_votes.is_empty() {
            return Ok(());
        }
        let proposal_id = registry
            .row_id(proposal_hash)
            .ok_or(GovernanceError::UnknownProposal(*proposal_hash))?;
        let reread_at = Timestamp::now().minus_secs(self.params.voting_reload_secs);
        with_session(cache, |handle| {
            if let Some(mut proposal) = registry.get(proposal_hash) {
                proposal.voting_last_read_time = reread_at;
                handle.update_proposal(proposal_id, &proposal)?;
                registry.set_proposal(proposal_hash, proposal);
            }
            for (ident, sig_time) in cast_votes {
                ledger.apply_vote(proposal_id, ident.clone(), *sig_time, result);
            }
            Ok(())
        })
    }

    /// Submit and record in one call, for callers without concurrent
    /// readers.
    #[allow(clippy::too_many_arguments)]
    pub fn cast(
        &self,
        registry: &mut ProposalRegistry,
        ledger: &mut VoteLedger,
        cache: &CacheSession,
        proposal_hash: &ProposalHash,
        targets: &[VoteTarget],
        result: VoteResult,
        on_failure: impl FnMut(&VoteTarget, &GovernanceError) -> CastDecision,
    ) -> Result<CastSummary, GovernanceError> {
        registry
            .row_id(proposal_hash)
            .ok_or(GovernanceError::UnknownProposal(*proposal_hash))?;
        let (summary, cast_votes) = self.submit(proposal_hash, targets, result, on_failure);
        self.record(registry, ledger, cache, proposal_hash, &cast_votes, result)?;
        Ok(summary)
    }
}
