//! The refresh-cycle orchestrator.
//!
//! One [`GovernanceSync::refresh`] call runs the full cycle described by the
//! engine's control flow: timing context, masternode population, snapshot
//! reconcile (when the cached snapshot is stale), external attributes, vote
//! sync for open proposals, and derived-status recompute with consumer
//! notifications.
//!
//! Concurrency: consumer reads go through short read locks on the shared
//! state; every slow operation (snapshot fetch, per-proposal vote fetch,
//! attribute fetch, signing) runs without holding the write lock or the
//! cache session, so readers always see either the pre- or post-cycle
//! state, never a stall and never a torn value.

use std::sync::{Arc, Mutex, RwLock, RwLockReadGuard, RwLockWriteGuard};

use govsync_cache::CacheSession;
use govsync_chain::{
    BlockTimeEstimator, ChainClient, ExtAttributeSource, ExtAttributes, SuperblockTiming,
};
use govsync_types::{
    masternode::active_count, GovernanceParams, Masternode, MasternodeIdent, Proposal,
    ProposalHash, Timestamp, Vote, VoteResult,
};
use tracing::{info, warn};

use crate::caster::{CastDecision, CastSummary, VoteCaster, VoteSigner, VoteTarget};
use crate::events::{GovernanceEvents, NullEvents};
use crate::ledger::{VoteLedger, VoteSyncStats};
use crate::registry::{ProposalRegistry, ReconcileStats};
use crate::{with_session, CancelFlag, GovernanceError, CFG_PROPOSALS_LAST_READ_TIME};

struct EngineState {
    registry: ProposalRegistry,
    ledger: VoteLedger,
    masternodes: Vec<Masternode>,
    timing: Option<SuperblockTiming>,
    loaded: bool,
}

/// What one refresh cycle did.
#[derive(Debug, Default)]
pub struct RefreshSummary {
    pub active_masternodes: usize,
    pub reconcile: Option<ReconcileStats>,
    /// Set when the snapshot could not be reconciled (empty snapshot or too
    /// many malformed records); the rest of the cycle still ran and the
    /// cache should be treated as possibly stale.
    pub reconcile_error: Option<String>,
    pub ext_attributes_updated: usize,
    pub votes: Option<VoteSyncStats>,
}

/// Synchronization engine tying the cache, the remote node, and consumers
/// together.
pub struct GovernanceSync {
    cache: Arc<CacheSession>,
    chain: Arc<dyn ChainClient>,
    ext_attrs: Option<Arc<dyn ExtAttributeSource>>,
    events: Arc<dyn GovernanceEvents>,
    params: GovernanceParams,
    cancel: CancelFlag,
    /// Serializes refresh cycles; consumer reads bypass it.
    refresh_gate: Mutex<()>,
    state: RwLock<EngineState>,
}

impl GovernanceSync {
    pub fn new(
        cache: Arc<CacheSession>,
        chain: Arc<dyn ChainClient>,
        params: GovernanceParams,
    ) -> Self {
        Self {
            cache,
            chain,
            ext_attrs: None,
            events: Arc::new(NullEvents),
            params,
            cancel: CancelFlag::new(),
            refresh_gate: Mutex::new(()),
            state: RwLock::new(EngineState {
                registry: ProposalRegistry::new(),
                ledger: VoteLedger::new(),
                masternodes: Vec::new(),
                timing: None,
                loaded: false,
            }),
        }
    }

    pub fn with_events(mut self, events: Arc<dyn GovernanceEvents>) -> Self {
        self.events = events;
        self
    }

    pub fn with_ext_attributes(mut self, source: Arc<dyn ExtAttributeSource>) -> Self {
        self.ext_attrs = Some(source);
        self
    }

    fn read_state(&self) -> RwLockReadGuard<'_, EngineState> {
        self.state.read().expect("engine state lock poisoned")
    }

    fn write_state(&self) -> RwLockWriteGuard<'_, EngineState> {
        self.state.write().expect("engine state lock poisoned")
    }

    // ── Consumer accessors ──────────────────────────────────────────────

    /// Snapshot of every active proposal.
    pub fn proposals(&self) -> Vec<Proposal> {
        self.read_state().registry.proposals()
    }

    pub fn proposal(&self, hash: &ProposalHash) -> Option<Proposal> {
        self.read_state().registry.get(hash)
    }

    /// Latest vote per masternode on one proposal, from the in-memory
    /// aggregates.
    pub fn latest_votes(
        &self,
        hash: &ProposalHash,
    ) -> Vec<(MasternodeIdent, Timestamp, VoteResult)> {
        let state = self.read_state();
        match state.registry.row_id(hash) {
            Some(id) => state.ledger.latest_votes(id),
            None => Vec::new(),
        }
    }

    /// Full stored vote history of one proposal.
    pub fn vote_history(&self, hash: &ProposalHash) -> Result<Vec<Vote>, GovernanceError> {
        let state = self.read_state();
        let id = state
            .registry
            .row_id(hash)
            .ok_or(GovernanceError::UnknownProposal(*hash))?;
        state.ledger.vote_history(&self.cache, id)
    }

    pub fn masternodes(&self) -> Vec<Masternode> {
        self.read_state().masternodes.clone()
    }

    pub fn timing(&self) -> Option<SuperblockTiming> {
        self.read_state().timing
    }

    /// The cancellation flag shared with in-flight operations.
    pub fn cancel_flag(&self) -> CancelFlag {
        self.cancel.clone()
    }

    /// Ask in-flight operations to unwind at their next loop boundary.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    // ── Refresh cycle ───────────────────────────────────────────────────

    /// Run one refresh cycle. Only one cycle runs at a time; a failure to
    /// obtain the block tip aborts the whole cycle.
    pub fn refresh(&self) -> Result<RefreshSummary, GovernanceError> {
        let _gate = self.refresh_gate.lock().expect("refresh gate poisoned");
        if self.cancel.is_cancelled() {
            return Err(GovernanceError::Cancelled);
        }

        let estimator =
            BlockTimeEstimator::new(self.chain.as_ref(), self.params.block_interval_secs);
        let timing = estimator.superblock_timing(
            self.params.superblock_interval,
            self.params.voting_deadline_blocks,
        )?;
        let masternodes = self.chain.masternode_list()?;
        let active = active_count(&masternodes);
        info!(
            tip = timing.tip.height,
            masternodes = masternodes.len(),
            active,
            "refresh cycle started"
        );

        {
            let mut state = self.write_state();
            state.timing = Some(timing);
            state.masternodes = masternodes;
        }
        self.load_once(&timing, active)?;

        let mut summary = RefreshSummary {
            active_masternodes: active,
            ..Default::default()
        };

        if self.cancel.is_cancelled() {
            return Err(GovernanceError::Cancelled);
        }

        if self.snapshot_is_stale()? {
            let snapshot = self.chain.fetch_proposals()?;
            let plan = {
                let state = self.read_state();
                state.registry.plan_reconcile(
                    self.chain.as_ref(),
                    &timing,
                    &snapshot,
                    active,
                    &self.params,
                    &self.cancel,
                )
            };
            match plan {
                Ok(plan) => {
                    let stats = {
                        let mut state = self.write_state();
                        state.registry.apply_reconcile(&self.cache, plan, &self.cancel)?
                    };
                    if stats.added > 0 || stats.updated > 0 || stats.deactivated > 0 {
                        self.events.on_proposals_changed();
                    }
                    summary.reconcile = Some(stats);
                }
                Err(
                    e @ (GovernanceError::EmptySnapshot
                    | GovernanceError::ReconcileAborted { .. }),
                ) => {
                    warn!(error = %e, "snapshot not reconciled; cache may be stale");
                    summary.reconcile_error = Some(e.to_string());
                }
                Err(e) => return Err(e),
            }
        }

        {
            let mut state = self.write_state();
            state.registry.refresh_status(&timing, active, &self.params);
        }

        summary.ext_attributes_updated = self.refresh_ext_attributes()?;
        if summary.ext_attributes_updated > 0 {
            self.events.on_proposals_changed();
        }

        let targets = self.vote_sync_targets();
        if !targets.is_empty() {
            summary.votes = Some(self.sync_votes(&targets, false)?);
        }

        info!("refresh cycle finished");
        Ok(summary)
    }

    /// Re-read votes for specific proposals on demand (the consumer's
    /// "refresh votes" action). `full_reload` bypasses the incremental
    /// watermark and re-checks every network vote against the store.
    pub fn sync_votes(
        &self,
        proposals: &[ProposalHash],
        full_reload: bool,
    ) -> Result<VoteSyncStats, GovernanceError> {
        let plan = {
            let state = self.read_state();
            VoteLedger::plan_sync(
                &state.registry,
                &self.cache,
                self.chain.as_ref(),
                proposals,
                full_reload,
                &self.params,
                &self.cancel,
            )?
        };
        let stats = {
            let mut state = self.write_state();
            let state = &mut *state;
            state
                .ledger
                .apply_sync(&mut state.registry, &self.cache, plan, &self.cancel)?
        };
        for hash in &stats.proposals_with_new_votes {
            self.events.on_votes_changed(hash);
        }
        Ok(stats)
    }

    /// Cast a vote on one proposal for each of the caller's masternodes.
    /// Signing and submission run without any lock; only the final fold
    /// takes the state write lock and the cache session.
    pub fn cast_votes(
        &self,
        signer: &dyn VoteSigner,
        proposal_hash: &ProposalHash,
        targets: &[VoteTarget],
        result: VoteResult,
        on_failure: impl FnMut(&VoteTarget, &GovernanceError) -> CastDecision,
    ) -> Result<CastSummary, GovernanceError> {
        {
            let state = self.read_state();
            state
                .registry
                .row_id(proposal_hash)
                .ok_or(GovernanceError::UnknownProposal(*proposal_hash))?;
        }

        let caster = VoteCaster::new(self.chain.as_ref(), signer, &self.params);
        let (summary, cast_votes) = caster.submit(proposal_hash, targets, result, on_failure);
        if !cast_votes.is_empty() {
            let mut state = self.write_state();
            let state = &mut *state;
            caster.record(
                &mut state.registry,
                &mut state.ledger,
                &self.cache,
                proposal_hash,
                &cast_votes,
                result,
            )?;
            self.events.on_votes_changed(proposal_hash);
        }
        Ok(summary)
    }

    // ── Cycle steps ─────────────────────────────────────────────────────

    /// First cycle only: populate memory from the cache so consumers have
    /// data before the first network round-trip completes.
    fn load_once(
        &self,
        timing: &SuperblockTiming,
        active_masternode_count: usize,
    ) -> Result<(), GovernanceError> {
        let mut state = self.write_state();
        if state.loaded {
            return Ok(());
        }
        state.registry.load_from_cache(&self.cache)?;
        let ids: Vec<u64> = state
            .registry
            .proposals()
            .iter()
            .filter_map(|p| state.registry.row_id(&p.hash))
            .collect();
        state.ledger.load_from_cache(&self.cache, &ids)?;
        state
            .registry
            .refresh_status(timing, active_masternode_count, &self.params);
        state.loaded = true;
        drop(state);
        self.events.on_proposals_changed();
        Ok(())
    }

    /// Whether the persisted snapshot watermark is old enough to warrant a
    /// network fetch.
    fn snapshot_is_stale(&self) -> Result<bool, GovernanceError> {
        if self.read_state().registry.is_empty() {
            return Ok(true);
        }
        let last_read = with_session(&self.cache, |handle| {
            Ok(handle.live_config_u64(CFG_PROPOSALS_LAST_READ_TIME)?)
        })?
        .unwrap_or(0);
        let age = Timestamp::new(last_read).elapsed_since(Timestamp::now());
        Ok(age > self.params.proposals_cache_valid_secs)
    }

    /// Proposals whose votes are due for a re-read: never read, or read
    /// longer ago than the reload window while their voting window is open.
    fn vote_sync_targets(&self) -> Vec<ProposalHash> {
        let now = Timestamp::now();
        self.read_state()
            .registry
            .proposals()
            .iter()
            .filter(|p| {
                p.voting_last_read_time.elapsed_since(now) > self.params.voting_reload_secs
                    && (p.voting_in_progress || p.voting_last_read_time == Timestamp::EPOCH)
            })
            .map(|p| p.hash)
            .collect()
    }

    /// Fetch owner/title metadata for proposals that never got theirs, then
    /// persist the whole batch in one transaction. Per-proposal fetch
    /// failures leave the proposal unmarked so it is retried next cycle.
    fn refresh_ext_attributes(&self) -> Result<usize, GovernanceError> {
        let source = match &self.ext_attrs {
            Some(source) => source,
            None => return Ok(0),
        };
        let pending: Vec<ProposalHash> = self
            .read_state()
            .registry
            .proposals()
            .iter()
            .filter(|p| !p.ext_attributes_loaded)
            .map(|p| p.hash)
            .collect();
        if pending.is_empty() {
            return Ok(0);
        }
        info!(proposals = pending.len(), "reading external proposal attributes");

        let mut fetched: Vec<(ProposalHash, Option<ExtAttributes>)> = Vec::new();
        for hash in &pending {
            if self.cancel.is_cancelled() {
                return Err(GovernanceError::Cancelled);
            }
            match source.fetch(hash) {
                Ok(attrs) => fetched.push((*hash, attrs)),
                Err(e) => {
                    warn!(proposal = %hash, error = %e, "attribute fetch failed; will retry")
                }
            }
        }
        if fetched.is_empty() {
            return Ok(0);
        }

        let mut state = self.write_state();
        let state = &mut *state;
        with_session(&self.cache, |handle| {
            let mut updated = 0usize;
            for (hash, attrs) in &fetched {
                if self.cancel.is_cancelled() {
                    return Err(GovernanceError::Cancelled);
                }
                let id = match state.registry.row_id(hash) {
                    Some(id) => id,
                    None => continue,
                };
                let mut proposal = match state.registry.get(hash) {
                    Some(proposal) => proposal,
                    None => continue,
                };
                let mut modified = false;
                if let Some(attrs) = attrs {
                    if let Some(owner) = attrs.owner.as_deref().filter(|s| !s.is_empty()) {
                        if proposal.owner != owner {
                            proposal.owner = owner.to_string();
                            modified = true;
                        }
                    }
                    if let Some(title) = attrs.title.as_deref().filter(|s| !s.is_empty()) {
                        if proposal.title != title {
                            proposal.title = title.to_string();
                            modified = true;
                        }
                    }
                }
                // Even an empty answer marks the proposal as loaded, so the
                // same question is not asked again next cycle.
                proposal.ext_attributes_loaded = true;
                handle.update_proposal(id, &proposal)?;
                state.registry.set_proposal(hash, proposal);
                if modified {
                    updated += 1;
                }
            }
            Ok(updated)
        })
    }
}
