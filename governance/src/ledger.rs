//! Vote ingestion, deduplication, and per-masternode aggregation.
//!
//! Votes arrive from the network keyed by a content hash that is unique per
//! logical vote; the ledger inserts each at most once, repoints rows whose
//! proposal pointer became stale after a duplicate-row merge, and keeps an
//! in-memory aggregate of the latest vote per masternode per proposal
//! (latest by vote timestamp wins, regardless of arrival order).
//!
//! Sync is incremental: a persisted watermark records the newest vote
//! timestamp ever seen, and votes older than the watermark minus a grace
//! period (clock-skew tolerance) are assumed stored and skipped without a
//! store lookup, unless a full reload is requested.

use std::collections::{HashMap, HashSet};

use govsync_cache::CacheSession;
use govsync_chain::ChainClient;
use govsync_types::{
    GovernanceParams, MasternodeIdent, ProposalHash, Timestamp, TxHash, Vote, VoteResult,
};
use tracing::{debug, info, warn};

use crate::registry::ProposalRegistry;
use crate::{with_session, CancelFlag, GovernanceError, CFG_VOTES_MAX_TIMESTAMP};

/// Outcome counts of one vote sync.
#[derive(Debug, Clone, Default)]
pub struct VoteSyncStats {
    pub synced_proposals: usize,
    pub inserted: usize,
    pub repointed: usize,
    /// Proposals whose vote fetch failed; the rest of the batch proceeded.
    pub failed_proposals: usize,
    /// Network vote records that could not be parsed.
    pub skipped_votes: usize,
    /// Proposals that received new or repointed votes, for change
    /// notifications.
    pub proposals_with_new_votes: Vec<ProposalHash>,
}

/// One parsed network vote awaiting dedup against the store.
struct CandidateVote {
    ident: MasternodeIdent,
    timestamp: Timestamp,
    result: VoteResult,
    content_hash: TxHash,
}

struct FetchedProposal {
    hash: ProposalHash,
    id: u64,
    votes: Vec<CandidateVote>,
}

/// The fetched-and-parsed outcome of the slow half of a vote sync, ready to
/// dedup against the store and persist.
///
/// Produced by [`VoteLedger::plan_sync`] (read-only, network-bound) and
/// consumed by [`VoteLedger::apply_sync`] (mutating, holds the cache session
/// only briefly).
pub struct VoteSyncPlan {
    fetched: Vec<FetchedProposal>,
    watermark: u64,
    max_seen: u64,
    failed_proposals: usize,
    skipped_votes: usize,
}

/// Latest-vote-per-masternode aggregates, keyed by proposal row id.
#[derive(Default)]
pub struct VoteLedger {
    aggregates: HashMap<u64, HashMap<MasternodeIdent, (Timestamp, VoteResult)>>,
}

impl VoteLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// The latest vote a masternode cast on a proposal, if any.
    pub fn latest_vote(
        &self,
        proposal_id: u64,
        ident: &MasternodeIdent,
    ) -> Option<(Timestamp, VoteResult)> {
        self.aggregates.get(&proposal_id)?.get(ident).copied()
    }

    /// Latest vote of every masternode that voted on a proposal.
    pub fn latest_votes(&self, proposal_id: u64) -> Vec<(MasternodeIdent, Timestamp, VoteResult)> {
        self.aggregates
            .get(&proposal_id)
            .map(|by_mn| {
                by_mn
                    .iter()
                    .map(|(ident, (ts, result))| (ident.clone(), *ts, *result))
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Fold one vote into the aggregate. Only a strictly newer timestamp
    /// replaces a stored vote; an older or equal one never overwrites.
    /// Returns whether the aggregate changed.
    pub fn apply_vote(
        &mut self,
        proposal_id: u64,
        ident: MasternodeIdent,
        timestamp: Timestamp,
        result: VoteResult,
    ) -> bool {
        let by_mn = self.aggregates.entry(proposal_id).or_default();
        match by_mn.get_mut(&ident) {
            Some(stored) => {
                if timestamp > stored.0 {
                    *stored = (timestamp, result);
                    true
                } else {
                    false
                }
            }
            None => {
                by_mn.insert(ident, (timestamp, result));
                true
            }
        }
    }

    /// Forget the aggregates of a proposal (used when its row disappears).
    pub fn forget_proposal(&mut self, proposal_id: u64) {
        self.aggregates.remove(&proposal_id);
    }

    /// Populate aggregates from the stored votes of the given proposals
    /// (startup path).
    pub fn load_from_cache(
        &mut self,
        cache: &CacheSession,
        proposal_ids: &[u64],
    ) -> Result<usize, GovernanceError> {
        let mut rows: Vec<Vote> = Vec::new();
        with_session(cache, |handle| {
            for id in proposal_ids {
                for (_, vote) in handle.votes_for_proposal(*id)? {
                    rows.push(vote);
                }
            }
            Ok(())
        })?;
        let count = rows.len();
        for vote in rows {
            self.apply_vote(
                vote.proposal_id,
                vote.masternode_ident,
                vote.timestamp,
                vote.result,
            );
        }
        info!(votes = count, "loaded votes from cache");
        Ok(count)
    }

    /// Full stored vote history of one proposal, oldest row first.
    pub fn vote_history(
        &self,
        cache: &CacheSession,
        proposal_id: u64,
    ) -> Result<Vec<Vote>, GovernanceError> {
        with_session(cache, |handle| {
            Ok(handle
                .votes_for_proposal(proposal_id)?
                .into_iter()
                .map(|(_, vote)| vote)
                .collect())
        })
    }

    /// The slow half of a vote sync: fetch and parse every target's votes,
    /// filtering out votes older than the persisted watermark minus the
    /// grace period (unless `full_reload`). Read-only on the registry; the
    /// cache session is taken only for the one watermark read.
    ///
    /// A network failure on one proposal skips only that proposal.
    #[allow(clippy::too_many_arguments)]
    pub fn plan_sync(
        registry: &ProposalRegistry,
        cache: &CacheSession,
        chain: &dyn ChainClient,
        targets: &[ProposalHash],
        full_reload: bool,
        params: &GovernanceParams,
        cancel: &CancelFlag,
    ) -> Result<VoteSyncPlan, GovernanceError> {
        let watermark = with_session(cache, |handle| {
            Ok(handle.live_config_u64(CFG_VOTES_MAX_TIMESTAMP)?)
        })?
        .unwrap_or(0);
        let cutoff = watermark.saturating_sub(params.vote_sync_grace_secs);

        info!(
            proposals = targets.len(),
            watermark, full_reload, "reading voting data from network"
        );

        // Network phase, outside the session: fetch and parse every target's
        // votes, tracking the newest timestamp seen anywhere.
        let mut fetched: Vec<FetchedProposal> = Vec::new();
        let mut failed_proposals = 0usize;
        let mut skipped_votes = 0usize;
        let mut max_seen = watermark;

        for hash in targets {
            if cancel.is_cancelled() {
                return Err(GovernanceError::Cancelled);
            }
            let (id, name) = match (registry.row_id(hash), registry.get(hash)) {
                (Some(id), Some(proposal)) => (id, proposal.name),
                _ => continue,
            };
            let raw_votes = match chain.fetch_votes(&name) {
                Ok(votes) => votes,
                Err(e) => {
                    warn!(proposal = %hash, error = %e, "vote fetch failed; skipping proposal");
                    failed_proposals += 1;
                    continue;
                }
            };

            let mut votes = Vec::new();
            for raw in raw_votes {
                let ident = raw.masternode_ident.trim();
                let timestamp = u64::try_from(raw.timestamp).unwrap_or(0);
                let parsed = (
                    TxHash::from_hex(&raw.content_hash),
                    VoteResult::parse(&raw.result),
                );
                let (content_hash, result) = match parsed {
                    (Ok(content_hash), Some(result)) if !ident.is_empty() && timestamp > 0 => {
                        (content_hash, result)
                    }
                    _ => {
                        debug!(proposal = %hash, "skipping malformed vote record");
                        skipped_votes += 1;
                        continue;
                    }
                };
                if timestamp > max_seen {
                    max_seen = timestamp;
                }
                if full_reload || timestamp >= cutoff {
                    votes.push(CandidateVote {
                        ident: MasternodeIdent::new(ident),
                        timestamp: Timestamp::new(timestamp),
                        result,
                        content_hash,
                    });
                }
            }
            fetched.push(FetchedProposal {
                hash: *hash,
                id,
                votes,
            });
        }

        Ok(VoteSyncPlan {
            fetched,
            watermark,
            max_seen,
            failed_proposals,
            skipped_votes,
        })
    }

    /// The fast half of a vote sync: dedup a fetched plan against the store
    /// and persist it in one transaction (inserts, repoints, per-proposal
    /// read times, and the advanced watermark together). A store failure
    /// rolls back the entire batch.
    pub fn apply_sync(
        &mut self,
        registry: &mut ProposalRegistry,
        cache: &CacheSession,
        plan: VoteSyncPlan,
        cancel: &CancelFlag,
    ) -> Result<VoteSyncStats, GovernanceError> {
        let VoteSyncPlan {
            fetched,
            watermark,
            max_seen,
            failed_proposals,
            skipped_votes,
        } = plan;
        let now = Timestamp::now();
        let synced_proposals = fetched.len();
        let stats = with_session(cache, |handle| {
            let mut inserted = 0usize;
            let mut repointed = 0usize;
            let mut staged_content: HashSet<TxHash> = HashSet::new();
            let mut proposals_with_new_votes: Vec<ProposalHash> = Vec::new();
            let mut folds: Vec<(u64, MasternodeIdent, Timestamp, VoteResult)> = Vec::new();
            let mut read_time_updates: Vec<(ProposalHash, govsync_types::Proposal)> = Vec::new();

            for fetched_proposal in &fetched {
                if cancel.is_cancelled() {
                    return Err(GovernanceError::Cancelled);
                }
                let mut new_votes = false;
                for vote in &fetched_proposal.votes {
                    let row = Vote {
                        proposal_id: fetched_proposal.id,
                        masternode_ident: vote.ident.clone(),
                        timestamp: vote.timestamp,
                        result: vote.result,
                        content_hash: vote.content_hash,
                    };
                    match handle.vote_by_content(&vote.content_hash)? {
                        None => {
                            // Also staged-this-batch dedup: the same content
                            // hash can show up under two snapshot names.
                            if staged_content.insert(vote.content_hash) {
                                handle.insert_vote(&row)?;
                                inserted += 1;
                                new_votes = true;
                            }
                        }
                        Some((_, stored)) if stored.proposal_id == fetched_proposal.id => {}
                        Some((vote_id, _)) => {
                            // Same logical vote stored against another
                            // (stale) row of this proposal's hash: repoint
                            // rather than duplicate.
                            handle.update_vote(vote_id, &row)?;
                            repointed += 1;
                            new_votes = true;
                        }
                    }
                    folds.push((
                        fetched_proposal.id,
                        vote.ident.clone(),
                        vote.timestamp,
                        vote.result,
                    ));
                }

                if let Some(mut proposal) = registry.get(&fetched_proposal.hash) {
                    proposal.voting_last_read_time = now;
                    handle.update_proposal(fetched_proposal.id, &proposal)?;
                    read_time_updates.push((fetched_proposal.hash, proposal));
                }
                if new_votes {
                    proposals_with_new_votes.push(fetched_proposal.hash);
                }
            }

            if max_seen > watermark {
                handle.set_live_config_u64(CFG_VOTES_MAX_TIMESTAMP, max_seen)?;
            }

            // Staging succeeded; fold into memory while the session is held.
            for (proposal_id, ident, timestamp, result) in folds {
                self.apply_vote(proposal_id, ident, timestamp, result);
            }
            for (hash, proposal) in read_time_updates {
                registry.set_proposal(&hash, proposal);
            }

            Ok(VoteSyncStats {
                synced_proposals,
                inserted,
                repointed,
                failed_proposals,
                skipped_votes,
                proposals_with_new_votes,
            })
        })?;

        info!(
            proposals = stats.synced_proposals,
            inserted = stats.inserted,
            repointed = stats.repointed,
            failed = stats.failed_proposals,
            "finished reading voting data from network"
        );
        Ok(stats)
    }

    /// Plan and apply in one call, for callers without concurrent readers.
    #[allow(clippy::too_many_arguments)]
    pub fn sync(
        &mut self,
        registry: &mut ProposalRegistry,
        cache: &CacheSession,
        chain: &dyn ChainClient,
        targets: &[ProposalHash],
        full_reload: bool,
        params: &GovernanceParams,
        cancel: &CancelFlag,
    ) -> Result<VoteSyncStats, GovernanceError> {
        let plan =
            Self::plan_sync(registry, cache, chain, targets, full_reload, params, cancel)?;
        self.apply_sync(registry, cache, plan, cancel)
    }
}
