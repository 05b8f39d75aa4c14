//! In-memory proposal registry and snapshot reconciliation.
//!
//! The registry mirrors every active proposal, keyed by network hash and by
//! cache row id. [`ProposalRegistry::reconcile`] merges a freshly fetched
//! snapshot into the cache: new proposals are inserted, changed ones
//! updated, vanished ones deactivated in place, and proposals the network
//! transiently dropped and re-added are merged back onto their original row
//! so vote history survives.
//!
//! Parsing and derived-field computation (including the header fetches they
//! need) happen before the cache session is taken; only the persist step
//! holds it, committing the whole reconciliation as one batch.

use std::collections::{HashMap, HashSet};

use govsync_cache::CacheSession;
use govsync_chain::{BlockTimeEstimator, ChainClient, RawProposal, SuperblockTiming};
use govsync_types::{GovernanceParams, Proposal, ProposalHash, Timestamp, TxHash};
use tracing::{debug, info, warn};

use crate::{classifier, with_session, CancelFlag, GovernanceError, CFG_PROPOSALS_LAST_READ_TIME};

/// Outcome counts of one reconcile, for caller notification.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReconcileStats {
    pub added: usize,
    pub updated: usize,
    pub deactivated: usize,
    /// Malformed snapshot records that were logged and skipped.
    pub skipped: usize,
}

struct Entry {
    id: u64,
    proposal: Proposal,
}

/// A snapshot record validated into typed fields.
struct ParsedRecord {
    hash: ProposalHash,
    fee_hash: TxHash,
    name: String,
    url: String,
    payment_address: String,
    block_start: u64,
    total_payment_count: u32,
    yes_count: u32,
    no_count: u32,
    abstain_count: u32,
    ratio: f64,
    total_payment: f64,
    monthly_payment: f64,
    is_established: bool,
    is_valid: bool,
    is_valid_reason: String,
}

/// A record ready to persist, with its full derived state computed.
struct StagedRecord {
    proposal: Proposal,
    is_new: bool,
    modified: bool,
}

/// The computed outcome of the slow half of a reconcile, ready to persist.
///
/// Produced by [`ProposalRegistry::plan_reconcile`] (read-only, may issue
/// network calls) and consumed by [`ProposalRegistry::apply_reconcile`]
/// (mutating, holds the cache session only briefly). The split keeps
/// consumers' read access unblocked while the network is slow.
pub struct ReconcilePlan {
    staged: Vec<StagedRecord>,
    seen: HashSet<ProposalHash>,
    skipped: usize,
}

enum MemOp {
    Upsert(u64, Proposal),
    Remove(ProposalHash, u64),
}

/// The in-memory collection of active proposals backing all read access.
#[derive(Default)]
pub struct ProposalRegistry {
    entries: HashMap<ProposalHash, Entry>,
    ids: HashMap<u64, ProposalHash>,
}

impl ProposalRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Snapshot of every active proposal. Cloned so consumers never observe
    /// a half-applied mutation.
    pub fn proposals(&self) -> Vec<Proposal> {
        self.entries.values().map(|e| e.proposal.clone()).collect()
    }

    pub fn get(&self, hash: &ProposalHash) -> Option<Proposal> {
        self.entries.get(hash).map(|e| e.proposal.clone())
    }

    pub fn row_id(&self, hash: &ProposalHash) -> Option<u64> {
        self.entries.get(hash).map(|e| e.id)
    }

    pub fn hash_of(&self, id: u64) -> Option<ProposalHash> {
        self.ids.get(&id).copied()
    }

    pub(crate) fn set_proposal(&mut self, hash: &ProposalHash, proposal: Proposal) {
        if let Some(entry) = self.entries.get_mut(hash) {
            entry.proposal = proposal;
        }
    }

    fn insert_entry(&mut self, id: u64, proposal: Proposal) {
        let hash = proposal.hash;
        if let Some(old) = self.entries.insert(hash, Entry { id, proposal }) {
            self.ids.remove(&old.id);
        }
        self.ids.insert(id, hash);
    }

    /// Populate the registry from the cache's active rows (startup path).
    pub fn load_from_cache(&mut self, cache: &CacheSession) -> Result<usize, GovernanceError> {
        let rows = with_session(cache, |handle| Ok(handle.active_proposals()?))?;
        let count = rows.len();
        for (id, proposal) in rows {
            if self.entries.contains_key(&proposal.hash) {
                warn!(hash = %proposal.hash, id, "duplicate active row for hash; keeping newest");
            }
            self.insert_entry(id, proposal);
        }
        info!(proposals = count, "loaded proposals from cache");
        Ok(count)
    }

    /// Recompute the derived voting window and classification for every
    /// proposal. Memory-only; callers run it after reconcile/sync and
    /// whenever the timing context or masternode population changes.
    pub fn refresh_status(
        &mut self,
        timing: &SuperblockTiming,
        active_masternode_count: usize,
        params: &GovernanceParams,
    ) {
        for entry in self.entries.values_mut() {
            let p = &mut entry.proposal;
            p.voting_in_progress =
                voting_window_open(p.payment_start_time, p.payment_end_time, timing);
            if p.title.is_empty() {
                p.title = p.name.clone();
            }
            let (status, caption) = classifier::classify(
                p.voting_in_progress,
                p.absolute_yes_count,
                active_masternode_count,
                params.funding_threshold,
            );
            p.voting_status = status;
            p.voting_status_caption = caption;
        }
    }

    /// The slow half of a reconcile: parse, validate, and compute the
    /// derived state of every snapshot record, including the header and
    /// fee-transaction fetches this needs. Read-only on the registry, so
    /// consumers keep reading while it runs.
    ///
    /// An empty snapshot is treated as "source unavailable", never as "all
    /// proposals vanished". A snapshot whose malformed-record share exceeds
    /// the configured ratio aborts before anything is staged.
    pub fn plan_reconcile(
        &self,
        chain: &dyn ChainClient,
        timing: &SuperblockTiming,
        snapshot: &[RawProposal],
        active_masternode_count: usize,
        params: &GovernanceParams,
        cancel: &CancelFlag,
    ) -> Result<ReconcilePlan, GovernanceError> {
        if snapshot.is_empty() {
            warn!("no proposals returned from the network; keeping cached state");
            return Err(GovernanceError::EmptySnapshot);
        }

        info!(records = snapshot.len(), "reconciling proposal snapshot");
        let estimator = BlockTimeEstimator::new(chain, params.block_interval_secs);

        let mut staged: Vec<StagedRecord> = Vec::new();
        let mut seen: HashSet<ProposalHash> = HashSet::new();
        let mut skipped = 0usize;

        for raw in snapshot {
            if cancel.is_cancelled() {
                return Err(GovernanceError::Cancelled);
            }
            let parsed = match parse_record(raw) {
                Ok(parsed) => parsed,
                Err(reason) => {
                    warn!(hash = %raw.hash, reason = %reason, "skipping malformed snapshot record");
                    skipped += 1;
                    continue;
                }
            };
            if !seen.insert(parsed.hash) {
                warn!(hash = %parsed.hash, "duplicate hash within snapshot; skipping");
                skipped += 1;
                continue;
            }
            match self.build_record(
                &parsed,
                chain,
                &estimator,
                timing,
                active_masternode_count,
                params,
            ) {
                Ok(record) => staged.push(record),
                Err(e) => {
                    warn!(hash = %parsed.hash, error = %e, "cannot complete snapshot record");
                    seen.remove(&parsed.hash);
                    skipped += 1;
                }
            }
        }

        if (skipped as f64) > snapshot.len() as f64 * params.max_snapshot_error_ratio {
            return Err(GovernanceError::ReconcileAborted {
                errors: skipped,
                total: snapshot.len(),
            });
        }

        Ok(ReconcilePlan {
            staged,
            seen,
            skipped,
        })
    }

    /// The fast half of a reconcile: persist a computed plan and fold it
    /// into memory.
    ///
    /// The whole persist runs as one transaction; a mid-batch failure rolls
    /// everything back and leaves both memory and cache at their previous
    /// state.
    pub fn apply_reconcile(
        &mut self,
        cache: &CacheSession,
        plan: ReconcilePlan,
        cancel: &CancelFlag,
    ) -> Result<ReconcileStats, GovernanceError> {
        let ReconcilePlan {
            staged,
            seen,
            skipped,
        } = plan;
        let now = Timestamp::now();
        let stats = with_session(cache, |handle| {
            let mut added = 0usize;
            let mut updated = 0usize;
            let mut deactivated = 0usize;
            let mut mem_ops: Vec<MemOp> = Vec::new();

            for record in &staged {
                if cancel.is_cancelled() {
                    return Err(GovernanceError::Cancelled);
                }
                match (record.is_new, self.entries.get(&record.proposal.hash)) {
                    (false, Some(entry)) => {
                        if record.modified {
                            handle.update_proposal(entry.id, &record.proposal)?;
                            updated += 1;
                            debug!(hash = %record.proposal.hash, id = entry.id, "updating proposal");
                        }
                        mem_ops.push(MemOp::Upsert(entry.id, record.proposal.clone()));
                    }
                    // The entry can disappear between plan and apply; treat
                    // the record as new in that case.
                    _ => {
                        added += self.stage_new(handle, record, &mut mem_ops)?;
                    }
                }
            }

            // Anything loaded but absent from the snapshot vanished from the
            // network: deactivate in place, never delete.
            let vanished: Vec<(ProposalHash, u64, Proposal)> = self
                .entries
                .iter()
                .filter(|(hash, _)| !seen.contains(*hash))
                .map(|(hash, entry)| (*hash, entry.id, entry.proposal.clone()))
                .collect();
            for (hash, id, mut proposal) in vanished {
                if cancel.is_cancelled() {
                    return Err(GovernanceError::Cancelled);
                }
                proposal.active = false;
                proposal.deactivated_at = Some(now);
                handle.update_proposal(id, &proposal)?;
                info!(hash = %hash, id, "deactivating proposal absent from snapshot");
                mem_ops.push(MemOp::Remove(hash, id));
                deactivated += 1;
            }

            handle.set_live_config_u64(CFG_PROPOSALS_LAST_READ_TIME, now.as_secs())?;

            // All staging succeeded; fold the outcome into memory while the
            // session is still held so readers never see a torn state.
            for op in mem_ops {
                match op {
                    MemOp::Upsert(id, proposal) => self.insert_entry(id, proposal),
                    MemOp::Remove(hash, id) => {
                        self.entries.remove(&hash);
                        self.ids.remove(&id);
                    }
                }
            }

            Ok(ReconcileStats {
                added,
                updated,
                deactivated,
                skipped,
            })
        })?;

        info!(
            added = stats.added,
            updated = stats.updated,
            deactivated = stats.deactivated,
            skipped = stats.skipped,
            "reconcile finished"
        );
        Ok(stats)
    }

    /// Plan and apply in one call, for callers without concurrent readers.
    #[allow(clippy::too_many_arguments)]
    pub fn reconcile(
        &mut self,
        cache: &CacheSession,
        chain: &dyn ChainClient,
        timing: &SuperblockTiming,
        snapshot: &[RawProposal],
        active_masternode_count: usize,
        params: &GovernanceParams,
        cancel: &CancelFlag,
    ) -> Result<ReconcileStats, GovernanceError> {
        let plan = self.plan_reconcile(
            chain,
            timing,
            snapshot,
            active_masternode_count,
            params,
            cancel,
        )?;
        self.apply_reconcile(cache, plan, cancel)
    }

    /// Stage a record with no in-memory entry: reuse an existing cache row
    /// for the same hash when one exists (the network transiently dropped
    /// and re-added the proposal), otherwise insert a fresh row. Returns the
    /// number of proposals added.
    fn stage_new(
        &self,
        handle: &govsync_cache::SessionHandle<'_>,
        record: &StagedRecord,
        mem_ops: &mut Vec<MemOp>,
    ) -> Result<usize, GovernanceError> {
        let hash = record.proposal.hash;
        let rows = handle.proposals_by_hash(&hash)?;

        let reuse = rows
            .iter()
            .find(|(_, p)| !p.active)
            .or_else(|| rows.first())
            .map(|(id, p)| (*id, p.clone()));

        match reuse {
            Some((reuse_id, old)) => {
                let mut merged = record.proposal.clone();
                merged.created_at = old.created_at;
                merged.creation_time = old.creation_time;
                merged.voting_last_read_time = old.voting_last_read_time;
                merged.ext_attributes_loaded = old.ext_attributes_loaded;
                if !old.owner.is_empty() {
                    merged.owner = old.owner;
                }
                if !old.title.is_empty() {
                    merged.title = old.title;
                }
                merged.active = true;
                merged.deactivated_at = None;

                // Repoint votes recorded against any other row of this hash
                // onto the surviving row, then drop the duplicates.
                for (other_id, _) in rows.iter().filter(|(id, _)| *id != reuse_id) {
                    for (vote_id, mut vote) in handle.votes_for_proposal(*other_id)? {
                        vote.proposal_id = reuse_id;
                        handle.update_vote(vote_id, &vote)?;
                    }
                    handle.delete_proposal(*other_id)?;
                    warn!(hash = %hash, id = other_id, "deleted duplicate proposal row");
                }

                handle.update_proposal(reuse_id, &merged)?;
                info!(hash = %hash, id = reuse_id, "re-activating cached proposal");
                mem_ops.push(MemOp::Upsert(reuse_id, merged));
            }
            None => {
                let id = handle.insert_proposal(&record.proposal)?;
                info!(hash = %hash, id, "adding new proposal");
                mem_ops.push(MemOp::Upsert(id, record.proposal.clone()));
            }
        }
        Ok(1)
    }

    /// Compute a snapshot record's full derived state and merge it with the
    /// in-memory entry when one exists.
    fn build_record(
        &self,
        parsed: &ParsedRecord,
        chain: &dyn ChainClient,
        estimator: &BlockTimeEstimator<'_>,
        timing: &SuperblockTiming,
        active_masternode_count: usize,
        params: &GovernanceParams,
    ) -> Result<StagedRecord, GovernanceError> {
        let schedule = PaymentSchedule::compute(
            parsed.block_start,
            parsed.total_payment_count,
            timing.tip.height,
            params.superblock_interval,
        );
        let payment_start_time = estimator.time_of_block(parsed.block_start, &timing.tip)?;
        let payment_end_time = estimator.time_of_block(schedule.block_end, &timing.tip)?;
        let absolute_yes_count = parsed.yes_count as i64 - parsed.no_count as i64;

        match self.entries.get(&parsed.hash) {
            Some(entry) => {
                let mut updated = entry.proposal.clone();
                let mut modified = false;
                set_field(&mut updated.name, &parsed.name, &mut modified);
                set_field(&mut updated.url, &parsed.url, &mut modified);
                set_field(&mut updated.fee_hash, &parsed.fee_hash, &mut modified);
                set_field(
                    &mut updated.payment_address,
                    &parsed.payment_address,
                    &mut modified,
                );
                set_field(&mut updated.block_start, &parsed.block_start, &mut modified);
                set_field(&mut updated.block_end, &schedule.block_end, &mut modified);
                set_field(
                    &mut updated.total_payment_count,
                    &parsed.total_payment_count,
                    &mut modified,
                );
                set_field(
                    &mut updated.remaining_payment_count,
                    &schedule.remaining,
                    &mut modified,
                );
                set_field(&mut updated.yes_count, &parsed.yes_count, &mut modified);
                set_field(&mut updated.no_count, &parsed.no_count, &mut modified);
                set_field(
                    &mut updated.abstain_count,
                    &parsed.abstain_count,
                    &mut modified,
                );
                set_field(
                    &mut updated.absolute_yes_count,
                    &absolute_yes_count,
                    &mut modified,
                );
                set_field(&mut updated.ratio, &parsed.ratio, &mut modified);
                set_field(
                    &mut updated.total_payment,
                    &parsed.total_payment,
                    &mut modified,
                );
                set_field(
                    &mut updated.monthly_payment,
                    &parsed.monthly_payment,
                    &mut modified,
                );
                set_field(
                    &mut updated.is_established,
                    &parsed.is_established,
                    &mut modified,
                );
                set_field(&mut updated.is_valid, &parsed.is_valid, &mut modified);
                set_field(
                    &mut updated.is_valid_reason,
                    &parsed.is_valid_reason,
                    &mut modified,
                );
                set_field(
                    &mut updated.payment_start_time,
                    &payment_start_time,
                    &mut modified,
                );
                set_field(
                    &mut updated.payment_end_time,
                    &payment_end_time,
                    &mut modified,
                );
                // `creation_time` is immutable after first sighting: not
                // recomputed here.
                apply_derived(&mut updated, timing, active_masternode_count, params, &mut modified);
                Ok(StagedRecord {
                    proposal: updated,
                    is_new: false,
                    modified,
                })
            }
            None => {
                // First sighting: the creation time comes from the fee
                // transaction and is fetched exactly once.
                let creation_time = chain.raw_transaction(&parsed.fee_hash)?.time;
                let mut proposal = Proposal {
                    hash: parsed.hash,
                    fee_hash: parsed.fee_hash,
                    name: parsed.name.clone(),
                    title: String::new(),
                    url: parsed.url.clone(),
                    owner: String::new(),
                    payment_address: parsed.payment_address.clone(),
                    block_start: parsed.block_start,
                    block_end: schedule.block_end,
                    payment_start_time,
                    payment_end_time,
                    creation_time,
                    yes_count: parsed.yes_count,
                    no_count: parsed.no_count,
                    abstain_count: parsed.abstain_count,
                    absolute_yes_count,
                    total_payment_count: parsed.total_payment_count,
                    remaining_payment_count: schedule.remaining,
                    ratio: parsed.ratio,
                    total_payment: parsed.total_payment,
                    monthly_payment: parsed.monthly_payment,
                    is_established: parsed.is_established,
                    is_valid: parsed.is_valid,
                    is_valid_reason: parsed.is_valid_reason.clone(),
                    ext_attributes_loaded: false,
                    active: true,
                    created_at: Timestamp::now(),
                    deactivated_at: None,
                    voting_last_read_time: Timestamp::EPOCH,
                    voting_in_progress: false,
                    voting_status: Default::default(),
                    voting_status_caption: String::new(),
                };
                let mut modified = true;
                apply_derived(
                    &mut proposal,
                    timing,
                    active_masternode_count,
                    params,
                    &mut modified,
                );
                Ok(StagedRecord {
                    proposal,
                    is_new: true,
                    modified: true,
                })
            }
        }
    }
}

/// Payment-window block arithmetic.
///
/// `block_end` is the block of the LAST payment:
/// `block_start + (total_payment_count - 1) * superblock_interval`. Network
/// clients that add a whole extra interval plus half are computing a
/// deletion threshold, not the payment window; that quantity is not this
/// one.
struct PaymentSchedule {
    block_end: u64,
    remaining: u32,
}

impl PaymentSchedule {
    fn compute(
        block_start: u64,
        total_payment_count: u32,
        tip_height: u64,
        superblock_interval: u64,
    ) -> Self {
        let block_end = block_start
            + (total_payment_count.saturating_sub(1) as u64).saturating_mul(superblock_interval);

        // The network's own remaining-payment count is unreliable; derive it
        // from the tip position instead. The payment at block_start counts as
        // made once the tip reaches it.
        let remaining = if tip_height > block_end {
            0
        } else if tip_height < block_start {
            total_payment_count
        } else {
            let payments_made = (tip_height - block_start) / superblock_interval + 1;
            total_payment_count.saturating_sub(payments_made as u32)
        };

        Self {
            block_end,
            remaining,
        }
    }
}

fn voting_window_open(
    payment_start: Timestamp,
    payment_end: Timestamp,
    timing: &SuperblockTiming,
) -> bool {
    match (timing.last_superblock_time, timing.next_superblock_time) {
        (Some(last_sb), Some(next_sb)) => payment_start > last_sb || payment_end > next_sb,
        _ => false,
    }
}

fn apply_derived(
    proposal: &mut Proposal,
    timing: &SuperblockTiming,
    active_masternode_count: usize,
    params: &GovernanceParams,
    modified: &mut bool,
) {
    let in_progress = voting_window_open(
        proposal.payment_start_time,
        proposal.payment_end_time,
        timing,
    );
    set_field(&mut proposal.voting_in_progress, &in_progress, modified);
    if proposal.title.is_empty() {
        let name = proposal.name.clone();
        set_field(&mut proposal.title, &name, modified);
    }
    let (status, caption) = classifier::classify(
        proposal.voting_in_progress,
        proposal.absolute_yes_count,
        active_masternode_count,
        params.funding_threshold,
    );
    set_field(&mut proposal.voting_status, &status, modified);
    set_field(&mut proposal.voting_status_caption, &caption, modified);
}

/// Assign `value` into `slot` and raise the dirty bit when it differs.
fn set_field<T: Clone + PartialEq>(slot: &mut T, value: &T, modified: &mut bool) {
    if slot != value {
        *slot = value.clone();
        *modified = true;
    }
}

fn parse_record(raw: &RawProposal) -> Result<ParsedRecord, String> {
    let hash = ProposalHash::from_hex(&raw.hash).map_err(|e| e.to_string())?;
    let fee_hash = TxHash::from_hex(&raw.fee_hash).map_err(|e| format!("fee hash: {}", e))?;
    if raw.name.is_empty() {
        return Err("missing name".to_string());
    }
    let block_start = u64::try_from(raw.block_start).map_err(|_| "negative block start")?;
    if block_start == 0 {
        return Err("missing block start".to_string());
    }
    let total_payment_count = u32::try_from(raw.total_payment_count)
        .ok()
        .filter(|count| *count >= 1)
        .ok_or("missing total payment count")?;
    let yes_count = u32::try_from(raw.yes_count).map_err(|_| "negative yes count")?;
    let no_count = u32::try_from(raw.no_count).map_err(|_| "negative no count")?;
    let abstain_count = u32::try_from(raw.abstain_count).map_err(|_| "negative abstain count")?;
    let ratio = raw.ratio.as_f64().ok_or("unparseable ratio")?;
    let total_payment = raw.total_payment.as_f64().ok_or("unparseable total payment")?;
    let monthly_payment = raw
        .monthly_payment
        .as_f64()
        .ok_or("unparseable monthly payment")?;

    Ok(ParsedRecord {
        hash,
        fee_hash,
        name: raw.name.clone(),
        url: raw.url.clone(),
        payment_address: raw.payment_address.clone(),
        block_start,
        total_payment_count,
        yes_count,
        no_count,
        abstain_count,
        ratio,
        total_payment,
        monthly_payment,
        is_established: raw.is_established,
        is_valid: raw.is_valid,
        is_valid_reason: raw.is_valid_reason.clone(),
    })
}
