//! Integration tests exercising the full governance pipeline:
//! network snapshot → reconcile → LMDB persistence → vote sync → cast,
//! wiring together the components that are normally only connected inside
//! `GovernanceSync`.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use govsync_cache::CacheSession;
use govsync_chain::{
    BlockHeader, ChainClient, ChainError, ChainTip, ExtAttributeSource, ExtAttributes, FlexNum,
    RawProposal, RawVote, SuperblockTiming, TxInfo, VoteSubmission,
};
use govsync_governance::{
    CancelFlag, CastDecision, GovernanceError, GovernanceEvents, GovernanceSync, ProposalRegistry,
    SignedVote, VoteCaster, VoteLedger, VoteSigner, VoteTarget,
};
use govsync_types::{
    GovernanceParams, Masternode, MasternodeIdent, MasternodeStatus, ProposalHash, Timestamp,
    TxHash, Vote, VoteResult, VotingStatus,
};

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

const GENESIS_TIME: u64 = 1_000_000;
const BLOCK_INTERVAL: u64 = 60;

/// A deterministic chain: the block at height H has a hash whose first 8
/// bytes are H (big-endian) and a header time of `GENESIS_TIME + H * 60`.
struct MockChain {
    tip_height: Mutex<u64>,
    next_superblock: u64,
    proposals: Mutex<Vec<RawProposal>>,
    votes: Mutex<HashMap<String, Vec<RawVote>>>,
    failing_vote_fetches: Mutex<HashSet<String>>,
    masternodes: Mutex<Vec<Masternode>>,
    submit_answer: Mutex<String>,
    submitted: Mutex<Vec<VoteSubmission>>,
    creation_time_fetches: AtomicUsize,
}

impl MockChain {
    fn new(tip_height: u64) -> Self {
        Self {
            tip_height: Mutex::new(tip_height),
            next_superblock: tip_height + 1000,
            proposals: Mutex::new(Vec::new()),
            votes: Mutex::new(HashMap::new()),
            failing_vote_fetches: Mutex::new(HashSet::new()),
            masternodes: Mutex::new(enabled_masternodes(100)),
            submit_answer: Mutex::new("Voted successfully".to_string()),
            submitted: Mutex::new(Vec::new()),
            creation_time_fetches: AtomicUsize::new(0),
        }
    }

    fn set_proposals(&self, proposals: Vec<RawProposal>) {
        *self.proposals.lock().unwrap() = proposals;
    }

    fn set_votes(&self, name: &str, votes: Vec<RawVote>) {
        self.votes.lock().unwrap().insert(name.to_string(), votes);
    }

    fn fail_votes_for(&self, name: &str) {
        self.failing_vote_fetches
            .lock()
            .unwrap()
            .insert(name.to_string());
    }

    fn submissions(&self) -> Vec<VoteSubmission> {
        self.submitted.lock().unwrap().clone()
    }
}

impl ChainClient for MockChain {
    fn fetch_proposals(&self) -> Result<Vec<RawProposal>, ChainError> {
        Ok(self.proposals.lock().unwrap().clone())
    }

    fn fetch_votes(&self, proposal_name: &str) -> Result<Vec<RawVote>, ChainError> {
        if self
            .failing_vote_fetches
            .lock()
            .unwrap()
            .contains(proposal_name)
        {
            return Err(ChainError::Network("connection reset".to_string()));
        }
        Ok(self
            .votes
            .lock()
            .unwrap()
            .get(proposal_name)
            .cloned()
            .unwrap_or_default())
    }

    fn block_count(&self) -> Result<u64, ChainError> {
        Ok(*self.tip_height.lock().unwrap())
    }

    fn block_hash(&self, height: u64) -> Result<govsync_types::BlockHash, ChainError> {
        let mut bytes = [0u8; 32];
        bytes[..8].copy_from_slice(&height.to_be_bytes());
        Ok(govsync_types::BlockHash::new(bytes))
    }

    fn block_header(&self, hash: &govsync_types::BlockHash) -> Result<BlockHeader, ChainError> {
        let mut height_bytes = [0u8; 8];
        height_bytes.copy_from_slice(&hash.as_bytes()[..8]);
        let height = u64::from_be_bytes(height_bytes);
        Ok(BlockHeader {
            time: Timestamp::new(GENESIS_TIME + height * BLOCK_INTERVAL),
        })
    }

    fn raw_transaction(&self, _tx: &TxHash) -> Result<TxInfo, ChainError> {
        self.creation_time_fetches.fetch_add(1, Ordering::SeqCst);
        Ok(TxInfo {
            time: Timestamp::new(GENESIS_TIME),
        })
    }

    fn next_superblock(&self) -> Result<u64, ChainError> {
        Ok(self.next_superblock)
    }

    fn masternode_list(&self) -> Result<Vec<Masternode>, ChainError> {
        Ok(self.masternodes.lock().unwrap().clone())
    }

    fn submit_vote(&self, submission: &VoteSubmission) -> Result<String, ChainError> {
        self.submitted.lock().unwrap().push(submission.clone());
        Ok(self.submit_answer.lock().unwrap().clone())
    }
}

fn enabled_masternodes(count: usize) -> Vec<Masternode> {
    (0..count)
        .map(|i| Masternode {
            ident: MasternodeIdent::new(format!("{:064x}-0", i)),
            status: MasternodeStatus::Enabled,
            protocol_version: 70208,
        })
        .collect()
}

fn temp_cache() -> (tempfile::TempDir, Arc<CacheSession>) {
    let dir = tempfile::tempdir().expect("temp dir");
    let session = CacheSession::new(dir.path().join("cache"));
    assert!(session.is_active());
    (dir, Arc::new(session))
}

fn params() -> GovernanceParams {
    GovernanceParams {
        block_interval_secs: BLOCK_INTERVAL,
        ..GovernanceParams::default()
    }
}

/// Timing context with the tip at `tip_height` and superblock boundaries
/// placed so that future payment windows count as voting-in-progress.
fn timing(tip_height: u64) -> SuperblockTiming {
    let tip_time = Timestamp::new(GENESIS_TIME + tip_height * BLOCK_INTERVAL);
    SuperblockTiming {
        tip: ChainTip {
            height: tip_height,
            time: tip_time,
        },
        next_superblock_height: Some(tip_height + 1000),
        last_superblock_time: Some(Timestamp::new(GENESIS_TIME)),
        next_superblock_time: Some(tip_time.plus_secs(1000 * BLOCK_INTERVAL)),
        next_voting_deadline: Some(tip_time.plus_secs(900 * BLOCK_INTERVAL)),
        voting_deadline_passed: false,
    }
}

fn prop_hash(byte: u8) -> ProposalHash {
    ProposalHash::new([byte; 32])
}

fn raw_proposal(hash_byte: u8, name: &str, block_start: u64) -> RawProposal {
    RawProposal {
        hash: format!("{:02x}", hash_byte).repeat(32),
        name: name.to_string(),
        url: format!("https://proposals.example/{}", name),
        fee_hash: format!("{:02x}", hash_byte.wrapping_add(1)).repeat(32),
        block_start: block_start as i64,
        total_payment_count: 3,
        payment_address: "yPayment111".to_string(),
        ratio: FlexNum::Float(0.9),
        yes_count: 20,
        no_count: 3,
        abstain_count: 1,
        total_payment: FlexNum::Int(300),
        monthly_payment: FlexNum::Int(100),
        is_established: true,
        is_valid: true,
        is_valid_reason: String::new(),
    }
}

fn raw_vote(ident: &str, time: u64, content_byte: u8, result: &str) -> RawVote {
    RawVote {
        masternode_ident: ident.to_string(),
        timestamp: time as i64,
        content_hash: format!("{:02x}", content_byte).repeat(32),
        result: result.to_string(),
    }
}

/// Run one reconcile with the standard fixture wiring.
fn reconcile(
    registry: &mut ProposalRegistry,
    cache: &CacheSession,
    chain: &MockChain,
    tip_height: u64,
    snapshot: &[RawProposal],
) -> Result<govsync_governance::ReconcileStats, GovernanceError> {
    registry.reconcile(
        cache,
        chain,
        &timing(tip_height),
        snapshot,
        100,
        &params(),
        &CancelFlag::new(),
    )
}

// ---------------------------------------------------------------------------
// 1. Reconciliation
// ---------------------------------------------------------------------------

#[test]
fn reconcile_inserts_new_proposals_and_is_idempotent() {
    let (_dir, cache) = temp_cache();
    let chain = MockChain::new(5000);
    let mut registry = ProposalRegistry::new();
    let snapshot = vec![
        raw_proposal(0x11, "alpha", 6000),
        raw_proposal(0x22, "beta", 7000),
    ];

    let stats = reconcile(&mut registry, &cache, &chain, 5000, &snapshot).expect("reconcile");
    assert_eq!(stats.added, 2);
    assert_eq!(stats.updated, 0);
    assert_eq!(stats.deactivated, 0);
    assert_eq!(registry.len(), 2);

    // Same snapshot, same tip: nothing to do.
    let stats = reconcile(&mut registry, &cache, &chain, 5000, &snapshot).expect("reconcile");
    assert_eq!(stats.added, 0);
    assert_eq!(stats.updated, 0);
    assert_eq!(stats.deactivated, 0);
}

#[test]
fn reconcile_updates_only_changed_proposals() {
    let (_dir, cache) = temp_cache();
    let chain = MockChain::new(5000);
    let mut registry = ProposalRegistry::new();
    let mut snapshot = vec![
        raw_proposal(0x11, "alpha", 6000),
        raw_proposal(0x22, "beta", 7000),
    ];
    reconcile(&mut registry, &cache, &chain, 5000, &snapshot).expect("reconcile");

    snapshot[0].yes_count = 25;
    let stats = reconcile(&mut registry, &cache, &chain, 5000, &snapshot).expect("reconcile");
    assert_eq!(stats.added, 0);
    assert_eq!(stats.updated, 1);

    let alpha = registry.get(&prop_hash(0x11)).expect("alpha");
    assert_eq!(alpha.yes_count, 25);
    assert_eq!(alpha.absolute_yes_count, 22);
}

#[test]
fn reconcile_computes_payment_window_fields() {
    let (_dir, cache) = temp_cache();
    let chain = MockChain::new(1000);
    let mut registry = ProposalRegistry::new();
    let snapshot = vec![raw_proposal(0x11, "alpha", 1000)];
    reconcile(&mut registry, &cache, &chain, 1000, &snapshot).expect("reconcile");

    let alpha = registry.get(&prop_hash(0x11)).expect("alpha");
    assert_eq!(alpha.block_end, 1000 + 2 * 43200);
    // The tip sits on block_start, so the first payment counts as made.
    assert_eq!(alpha.remaining_payment_count, 2);
    // payment start is the tip block itself here, so its time is exact
    assert_eq!(
        alpha.payment_start_time,
        Timestamp::new(GENESIS_TIME + 1000 * BLOCK_INTERVAL)
    );
    // payment end is extrapolated at the nominal interval
    assert_eq!(
        alpha.payment_end_time,
        Timestamp::new(GENESIS_TIME + (1000 + 2 * 43200) * BLOCK_INTERVAL)
    );
    assert!(alpha.voting_in_progress);
    assert_eq!(alpha.voting_status, VotingStatus::Eligible);
}

#[test]
fn reconcile_fetches_creation_time_only_at_first_sighting() {
    let (_dir, cache) = temp_cache();
    let chain = MockChain::new(5000);
    let mut registry = ProposalRegistry::new();
    let snapshot = vec![raw_proposal(0x11, "alpha", 6000)];

    reconcile(&mut registry, &cache, &chain, 5000, &snapshot).expect("reconcile");
    assert_eq!(chain.creation_time_fetches.load(Ordering::SeqCst), 1);

    reconcile(&mut registry, &cache, &chain, 5000, &snapshot).expect("reconcile");
    assert_eq!(
        chain.creation_time_fetches.load(Ordering::SeqCst),
        1,
        "creation time is immutable after first sighting"
    );
}

#[test]
fn vanished_proposal_is_deactivated_not_deleted() {
    let (_dir, cache) = temp_cache();
    let chain = MockChain::new(5000);
    let mut registry = ProposalRegistry::new();
    reconcile(
        &mut registry,
        &cache,
        &chain,
        5000,
        &[raw_proposal(0x11, "alpha", 6000), raw_proposal(0x22, "beta", 7000)],
    )
    .expect("reconcile");

    let stats = reconcile(
        &mut registry,
        &cache,
        &chain,
        5000,
        &[raw_proposal(0x22, "beta", 7000)],
    )
    .expect("reconcile");
    assert_eq!(stats.deactivated, 1);
    assert_eq!(registry.len(), 1);
    assert!(registry.get(&prop_hash(0x11)).is_none());

    // The row survives in the cache, retrievable by hash, inactive.
    let handle = cache.acquire().expect("acquire");
    let rows = handle.proposals_by_hash(&prop_hash(0x11)).expect("by hash");
    assert_eq!(rows.len(), 1);
    assert!(!rows[0].1.active);
    assert!(rows[0].1.deactivated_at.is_some());
    cache.release().expect("release");
}

#[test]
fn resurrected_proposal_merges_onto_one_active_row() {
    let (_dir, cache) = temp_cache();
    let chain = MockChain::new(5000);
    let mut registry = ProposalRegistry::new();
    let alpha = raw_proposal(0x11, "alpha", 6000);

    // Sighting, vote, disappearance.
    reconcile(&mut registry, &cache, &chain, 5000, std::slice::from_ref(&alpha))
        .expect("reconcile 1");
    let original_id = registry.row_id(&prop_hash(0x11)).expect("row id");

    let mut ledger = VoteLedger::new();
    chain.set_votes("alpha", vec![raw_vote("mn-1", 500, 0xAA, "YES")]);
    ledger
        .sync(
            &mut registry,
            &cache,
            &chain,
            &[prop_hash(0x11)],
            false,
            &params(),
            &CancelFlag::new(),
        )
        .expect("vote sync");

    reconcile(&mut registry, &cache, &chain, 5000, &[]).expect_err("empty is an error");
    reconcile(
        &mut registry,
        &cache,
        &chain,
        5000,
        &[raw_proposal(0x22, "beta", 7000)],
    )
    .expect("reconcile 2");
    assert!(registry.get(&prop_hash(0x11)).is_none());

    // Reappearance: exactly one active row for the hash, on the original
    // row id, with the vote still attached.
    reconcile(
        &mut registry,
        &cache,
        &chain,
        5000,
        &[raw_proposal(0x22, "beta", 7000), alpha],
    )
    .expect("reconcile 3");

    assert_eq!(registry.row_id(&prop_hash(0x11)), Some(original_id));
    let handle = cache.acquire().expect("acquire");
    let rows = handle.proposals_by_hash(&prop_hash(0x11)).expect("by hash");
    let active: Vec<_> = rows.iter().filter(|(_, p)| p.active).collect();
    assert_eq!(active.len(), 1, "exactly one active row after resurrection");
    assert_eq!(rows.len(), 1, "no duplicate rows left behind");

    let votes = handle.votes_for_proposal(original_id).expect("votes");
    assert_eq!(votes.len(), 1);
    assert_eq!(votes[0].1.masternode_ident, MasternodeIdent::new("mn-1"));
    cache.release().expect("release");
}

#[test]
fn empty_snapshot_never_deactivates() {
    let (_dir, cache) = temp_cache();
    let chain = MockChain::new(5000);
    let mut registry = ProposalRegistry::new();
    reconcile(
        &mut registry,
        &cache,
        &chain,
        5000,
        &[raw_proposal(0x11, "alpha", 6000)],
    )
    .expect("reconcile");

    let err = reconcile(&mut registry, &cache, &chain, 5000, &[]).unwrap_err();
    assert!(matches!(err, GovernanceError::EmptySnapshot));

    // State unchanged, in memory and in the cache.
    assert_eq!(registry.len(), 1);
    let handle = cache.acquire().expect("acquire");
    assert_eq!(handle.active_proposals().expect("rows").len(), 1);
    cache.release().expect("release");
}

#[test]
fn reconcile_aborts_when_too_many_records_are_malformed() {
    let (_dir, cache) = temp_cache();
    let chain = MockChain::new(5000);
    let mut registry = ProposalRegistry::new();

    let mut snapshot: Vec<RawProposal> = (0..10)
        .map(|i| raw_proposal(0x30 + i, &format!("p{}", i), 6000 + i as u64))
        .collect();
    snapshot[0].hash = "garbage".to_string();
    snapshot[1].name.clear();

    let err = reconcile(&mut registry, &cache, &chain, 5000, &snapshot).unwrap_err();
    assert!(matches!(
        err,
        GovernanceError::ReconcileAborted {
            errors: 2,
            total: 10
        }
    ));
    assert!(registry.is_empty(), "nothing was applied");
}

#[test]
fn reconcile_tolerates_malformed_records_under_the_threshold() {
    let (_dir, cache) = temp_cache();
    let chain = MockChain::new(5000);
    let mut registry = ProposalRegistry::new();

    let mut snapshot: Vec<RawProposal> = (0..10)
        .map(|i| raw_proposal(0x30 + i, &format!("p{}", i), 6000 + i as u64))
        .collect();
    snapshot[0].hash = "garbage".to_string();

    let stats = reconcile(&mut registry, &cache, &chain, 5000, &snapshot).expect("reconcile");
    assert_eq!(stats.skipped, 1);
    assert_eq!(stats.added, 9);
}

#[test]
fn registry_reloads_from_cache_across_restarts() {
    let (_dir, cache) = temp_cache();
    let chain = MockChain::new(5000);
    let mut registry = ProposalRegistry::new();
    reconcile(
        &mut registry,
        &cache,
        &chain,
        5000,
        &[raw_proposal(0x11, "alpha", 6000)],
    )
    .expect("reconcile");
    let id = registry.row_id(&prop_hash(0x11)).expect("id");

    let mut reloaded = ProposalRegistry::new();
    let count = reloaded.load_from_cache(&cache).expect("load");
    assert_eq!(count, 1);
    assert_eq!(reloaded.row_id(&prop_hash(0x11)), Some(id));
    assert_eq!(reloaded.get(&prop_hash(0x11)).expect("alpha").name, "alpha");
}

// ---------------------------------------------------------------------------
// 2. Vote sync
// ---------------------------------------------------------------------------

struct VoteFixture {
    _dir: tempfile::TempDir,
    cache: Arc<CacheSession>,
    chain: MockChain,
    registry: ProposalRegistry,
    ledger: VoteLedger,
}

impl VoteFixture {
    fn new() -> Self {
        let (_dir, cache) = temp_cache();
        let chain = MockChain::new(5000);
        let mut registry = ProposalRegistry::new();
        reconcile(
            &mut registry,
            &cache,
            &chain,
            5000,
            &[raw_proposal(0x11, "alpha", 6000)],
        )
        .expect("reconcile");
        Self {
            _dir,
            cache,
            chain,
            registry,
            ledger: VoteLedger::new(),
        }
    }

    fn sync(&mut self, full_reload: bool) -> govsync_governance::VoteSyncStats {
        self.ledger
            .sync(
                &mut self.registry,
                &self.cache,
                &self.chain,
                &[prop_hash(0x11)],
                full_reload,
                &params(),
                &CancelFlag::new(),
            )
            .expect("vote sync")
    }

    fn alpha_id(&self) -> u64 {
        self.registry.row_id(&prop_hash(0x11)).expect("row id")
    }

    fn stored_votes(&self) -> Vec<Vote> {
        let handle = self.cache.acquire().expect("acquire");
        let votes = handle
            .votes_for_proposal(self.alpha_id())
            .expect("votes")
            .into_iter()
            .map(|(_, vote)| vote)
            .collect();
        self.cache.release().expect("release");
        votes
    }
}

#[test]
fn vote_sync_inserts_and_deduplicates_by_content_hash() {
    let mut fx = VoteFixture::new();
    fx.chain.set_votes(
        "alpha",
        vec![
            raw_vote("mn-1", 500, 0xAA, "YES"),
            raw_vote("mn-2", 600, 0xBB, "NO"),
        ],
    );

    let stats = fx.sync(false);
    assert_eq!(stats.inserted, 2);
    assert_eq!(fx.stored_votes().len(), 2);

    // The same votes again: idempotent.
    let stats = fx.sync(true);
    assert_eq!(stats.inserted, 0);
    assert_eq!(stats.repointed, 0);
    assert_eq!(fx.stored_votes().len(), 2);
}

#[test]
fn vote_sync_applies_latest_wins_in_either_order() {
    // Newer vote first.
    let mut fx = VoteFixture::new();
    fx.chain.set_votes(
        "alpha",
        vec![
            raw_vote("mn-1", 100, 0xAA, "NO"),
            raw_vote("mn-1", 50, 0xBB, "YES"),
        ],
    );
    fx.sync(false);
    let id = fx.alpha_id();
    assert_eq!(
        fx.ledger.latest_vote(id, &MasternodeIdent::new("mn-1")),
        Some((Timestamp::new(100), VoteResult::No))
    );

    // Older vote first.
    let mut fx = VoteFixture::new();
    fx.chain.set_votes(
        "alpha",
        vec![
            raw_vote("mn-1", 50, 0xBB, "YES"),
            raw_vote("mn-1", 100, 0xAA, "NO"),
        ],
    );
    fx.sync(false);
    let id = fx.alpha_id();
    assert_eq!(
        fx.ledger.latest_vote(id, &MasternodeIdent::new("mn-1")),
        Some((Timestamp::new(100), VoteResult::No))
    );
}

#[test]
fn vote_sync_repoints_votes_stored_under_a_stale_row() {
    let mut fx = VoteFixture::new();
    let id = fx.alpha_id();

    // Fabricate a vote row pointing at a row id that no longer backs the
    // proposal (as left behind by an interrupted duplicate merge).
    let stale = Vote {
        proposal_id: id + 1000,
        masternode_ident: MasternodeIdent::new("mn-1"),
        timestamp: Timestamp::new(400),
        result: VoteResult::Yes,
        content_hash: TxHash::new([0xAA; 32]),
    };
    let handle = fx.cache.acquire().expect("acquire");
    handle.insert_vote(&stale).expect("insert");
    fx.cache.commit().expect("commit");
    fx.cache.release().expect("release");

    fx.chain
        .set_votes("alpha", vec![raw_vote("mn-1", 400, 0xAA, "YES")]);
    let stats = fx.sync(true);
    assert_eq!(stats.inserted, 0);
    assert_eq!(stats.repointed, 1);

    let votes = fx.stored_votes();
    assert_eq!(votes.len(), 1);
    assert_eq!(votes[0].proposal_id, id);
}

#[test]
fn vote_sync_skips_old_votes_unless_full_reload() {
    let mut fx = VoteFixture::new();

    // First sync advances the watermark well past the old vote.
    let recent = 2_000_000_000u64;
    fx.chain
        .set_votes("alpha", vec![raw_vote("mn-1", recent, 0xAA, "YES")]);
    fx.sync(false);

    // An old vote (older than watermark - grace) is not even checked.
    fx.chain.set_votes(
        "alpha",
        vec![
            raw_vote("mn-1", recent, 0xAA, "YES"),
            raw_vote("mn-2", 1000, 0xBB, "NO"),
        ],
    );
    let stats = fx.sync(false);
    assert_eq!(stats.inserted, 0);
    assert_eq!(fx.stored_votes().len(), 1);

    // A full reload backfills it.
    let stats = fx.sync(true);
    assert_eq!(stats.inserted, 1);
    assert_eq!(fx.stored_votes().len(), 2);
}

#[test]
fn vote_sync_updates_last_read_time_and_watermark() {
    let mut fx = VoteFixture::new();
    fx.chain
        .set_votes("alpha", vec![raw_vote("mn-1", 700, 0xAA, "YES")]);

    let before = Timestamp::now();
    fx.sync(false);

    let alpha = fx.registry.get(&prop_hash(0x11)).expect("alpha");
    assert!(alpha.voting_last_read_time >= before);

    // Watermark persisted alongside.
    let handle = fx.cache.acquire().expect("acquire");
    assert_eq!(
        handle
            .live_config_u64("prop_votes_max_timestamp")
            .expect("watermark"),
        Some(700)
    );
    fx.cache.release().expect("release");
}

#[test]
fn vote_fetch_failure_skips_only_that_proposal() {
    let (_dir, cache) = temp_cache();
    let chain = MockChain::new(5000);
    let mut registry = ProposalRegistry::new();
    reconcile(
        &mut registry,
        &cache,
        &chain,
        5000,
        &[
            raw_proposal(0x11, "alpha", 6000),
            raw_proposal(0x22, "beta", 7000),
        ],
    )
    .expect("reconcile");

    chain.fail_votes_for("alpha");
    chain.set_votes("beta", vec![raw_vote("mn-1", 500, 0xCC, "YES")]);

    let mut ledger = VoteLedger::new();
    let stats = ledger
        .sync(
            &mut registry,
            &cache,
            &chain,
            &[prop_hash(0x11), prop_hash(0x22)],
            false,
            &params(),
            &CancelFlag::new(),
        )
        .expect("vote sync");

    assert_eq!(stats.failed_proposals, 1);
    assert_eq!(stats.synced_proposals, 1);
    assert_eq!(stats.inserted, 1);

    // Only beta's read time advanced.
    assert_eq!(
        registry
            .get(&prop_hash(0x11))
            .expect("alpha")
            .voting_last_read_time,
        Timestamp::EPOCH
    );
    assert_ne!(
        registry
            .get(&prop_hash(0x22))
            .expect("beta")
            .voting_last_read_time,
        Timestamp::EPOCH
    );
}

#[test]
fn ledger_reloads_aggregates_from_cache() {
    let mut fx = VoteFixture::new();
    fx.chain.set_votes(
        "alpha",
        vec![
            raw_vote("mn-1", 500, 0xAA, "YES"),
            raw_vote("mn-2", 600, 0xBB, "NO"),
        ],
    );
    fx.sync(false);
    let id = fx.alpha_id();

    let mut reloaded = VoteLedger::new();
    let count = reloaded
        .load_from_cache(&fx.cache, &[id])
        .expect("load votes");
    assert_eq!(count, 2);
    assert_eq!(
        reloaded.latest_vote(id, &MasternodeIdent::new("mn-1")),
        Some((Timestamp::new(500), VoteResult::Yes))
    );
}

// ---------------------------------------------------------------------------
// 3. Vote casting
// ---------------------------------------------------------------------------

/// Signer that signs as whatever address it is configured with.
struct MockSigner {
    address_override: Option<String>,
    calls: AtomicUsize,
}

impl MockSigner {
    fn honest() -> Self {
        Self {
            address_override: None,
            calls: AtomicUsize::new(0),
        }
    }

    fn impersonating(address: &str) -> Self {
        Self {
            address_override: Some(address.to_string()),
            calls: AtomicUsize::new(0),
        }
    }
}

impl VoteSigner for MockSigner {
    fn sign(&self, target: &VoteTarget, payload: &str) -> Result<SignedVote, GovernanceError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(SignedVote {
            signature: format!("sig({})", payload),
            signer_address: self
                .address_override
                .clone()
                .unwrap_or_else(|| target.voting_address.clone()),
        })
    }
}

fn target(n: u8) -> VoteTarget {
    VoteTarget {
        ident: MasternodeIdent::new(format!("{:02x}-1", n)),
        collateral_tx: TxHash::new([n; 32]),
        collateral_tx_index: 1,
        voting_address: format!("yVoter{}", n),
    }
}

#[test]
fn cast_submits_signed_votes_and_folds_them_into_state() {
    let mut fx = VoteFixture::new();
    let signer = MockSigner::honest();
    let params_binding = params();
    let caster = VoteCaster::new(&fx.chain, &signer, &params_binding);

    let summary = caster
        .cast(
            &mut fx.registry,
            &mut fx.ledger,
            &fx.cache,
            &prop_hash(0x11),
            &[target(1), target(2)],
            VoteResult::Yes,
            |_, _| CastDecision::Continue,
        )
        .expect("cast");
    let after = Timestamp::now();

    assert_eq!(summary.succeeded, 2);
    assert_eq!(summary.failed, 0);
    assert!(!summary.aborted);

    let submissions = fx.chain.submissions();
    assert_eq!(submissions.len(), 2);
    assert_eq!(submissions[0].signal, "funding");
    assert_eq!(submissions[0].vote, VoteResult::Yes);
    assert!(submissions[0].signature.starts_with("sig("));

    // Folded into the ledger under latest-wins.
    let id = fx.alpha_id();
    assert!(fx.ledger.latest_vote(id, &target(1).ident).is_some());

    // Read time pushed back so the next sync re-reads from the network.
    let alpha = fx.registry.get(&prop_hash(0x11)).expect("alpha");
    assert_ne!(alpha.voting_last_read_time, Timestamp::EPOCH);
    assert!(alpha.voting_last_read_time <= after.minus_secs(params().voting_reload_secs));
}

#[test]
fn cast_rejects_signature_from_wrong_identity() {
    let mut fx = VoteFixture::new();
    let signer = MockSigner::impersonating("ySomebodyElse");
    let params_binding = params();
    let caster = VoteCaster::new(&fx.chain, &signer, &params_binding);

    let mut failures = Vec::new();
    let summary = caster
        .cast(
            &mut fx.registry,
            &mut fx.ledger,
            &fx.cache,
            &prop_hash(0x11),
            &[target(1)],
            VoteResult::No,
            |t, e| {
                failures.push((t.ident.clone(), e.to_string()));
                CastDecision::Continue
            },
        )
        .expect("cast");

    assert_eq!(summary.succeeded, 0);
    assert_eq!(summary.failed, 1);
    // The mismatch aborted the target before submission.
    assert!(fx.chain.submissions().is_empty());
    // Single-target cast: the failure callback is not consulted.
    assert!(failures.is_empty());
}

#[test]
fn cast_abort_decision_stops_remaining_targets() {
    let mut fx = VoteFixture::new();
    *fx.chain.submit_answer.lock().unwrap() = "Error: unknown masternode".to_string();
    let signer = MockSigner::honest();
    let params_binding = params();
    let caster = VoteCaster::new(&fx.chain, &signer, &params_binding);

    let summary = caster
        .cast(
            &mut fx.registry,
            &mut fx.ledger,
            &fx.cache,
            &prop_hash(0x11),
            &[target(1), target(2), target(3)],
            VoteResult::Yes,
            |_, _| CastDecision::Abort,
        )
        .expect("cast");

    assert_eq!(summary.succeeded, 0);
    assert_eq!(summary.failed, 1);
    assert!(summary.aborted);
    assert_eq!(fx.chain.submissions().len(), 1, "remaining targets skipped");
}

#[test]
fn cast_continue_decision_tries_every_target() {
    let mut fx = VoteFixture::new();
    *fx.chain.submit_answer.lock().unwrap() = "Error: unknown masternode".to_string();
    let signer = MockSigner::honest();
    let params_binding = params();
    let caster = VoteCaster::new(&fx.chain, &signer, &params_binding);

    let summary = caster
        .cast(
            &mut fx.registry,
            &mut fx.ledger,
            &fx.cache,
            &prop_hash(0x11),
            &[target(1), target(2), target(3)],
            VoteResult::Yes,
            |_, _| CastDecision::Continue,
        )
        .expect("cast");

    assert_eq!(summary.failed, 3);
    assert!(!summary.aborted);
    assert_eq!(fx.chain.submissions().len(), 3);
}

#[test]
fn cast_on_unknown_proposal_is_an_error() {
    let mut fx = VoteFixture::new();
    let signer = MockSigner::honest();
    let params_binding = params();
    let caster = VoteCaster::new(&fx.chain, &signer, &params_binding);

    let err = caster
        .cast(
            &mut fx.registry,
            &mut fx.ledger,
            &fx.cache,
            &prop_hash(0x99),
            &[target(1)],
            VoteResult::Yes,
            |_, _| CastDecision::Continue,
        )
        .unwrap_err();
    assert!(matches!(err, GovernanceError::UnknownProposal(_)));
}

// ---------------------------------------------------------------------------
// 4. Full refresh cycle
// ---------------------------------------------------------------------------

#[derive(Default)]
struct CountingEvents {
    proposals_changed: AtomicUsize,
    votes_changed: AtomicUsize,
}

impl GovernanceEvents for CountingEvents {
    fn on_proposals_changed(&self) {
        self.proposals_changed.fetch_add(1, Ordering::SeqCst);
    }

    fn on_votes_changed(&self, _proposal: &ProposalHash) {
        self.votes_changed.fetch_add(1, Ordering::SeqCst);
    }
}

struct MapAttributeSource {
    attrs: HashMap<ProposalHash, ExtAttributes>,
}

impl ExtAttributeSource for MapAttributeSource {
    fn fetch(&self, hash: &ProposalHash) -> Result<Option<ExtAttributes>, ChainError> {
        Ok(self.attrs.get(hash).cloned())
    }
}

#[test]
fn refresh_cycle_populates_everything_and_notifies() {
    let (_dir, cache) = temp_cache();
    let chain = MockChain::new(5000);
    chain.set_proposals(vec![
        raw_proposal(0x11, "alpha", 6000),
        raw_proposal(0x22, "beta", 7000),
    ]);
    chain.set_votes("alpha", vec![raw_vote("mn-1", 500, 0xAA, "YES")]);
    chain.set_votes("beta", vec![raw_vote("mn-2", 600, 0xBB, "NO")]);

    let mut attrs = HashMap::new();
    attrs.insert(
        prop_hash(0x11),
        ExtAttributes {
            owner: Some("alice".to_string()),
            title: Some("Alpha proposal".to_string()),
        },
    );

    let events = Arc::new(CountingEvents::default());
    let engine = GovernanceSync::new(
        Arc::clone(&cache),
        Arc::new(chain),
        params(),
    )
    .with_events(Arc::clone(&events) as Arc<dyn GovernanceEvents>)
    .with_ext_attributes(Arc::new(MapAttributeSource { attrs }));

    let summary = engine.refresh().expect("refresh");
    assert_eq!(summary.active_masternodes, 100);
    let reconcile_stats = summary.reconcile.expect("reconcile ran");
    assert_eq!(reconcile_stats.added, 2);
    assert_eq!(summary.ext_attributes_updated, 1);
    let vote_stats = summary.votes.expect("vote sync ran");
    assert_eq!(vote_stats.inserted, 2);

    // Consumer view.
    let proposals = engine.proposals();
    assert_eq!(proposals.len(), 2);
    let alpha = engine.proposal(&prop_hash(0x11)).expect("alpha");
    assert_eq!(alpha.owner, "alice");
    assert_eq!(alpha.title, "Alpha proposal");
    assert!(alpha.ext_attributes_loaded);
    assert_eq!(alpha.voting_status, VotingStatus::Eligible);
    // beta had no external attributes but is marked loaded anyway, with the
    // title falling back to the name.
    let beta = engine.proposal(&prop_hash(0x22)).expect("beta");
    assert!(beta.ext_attributes_loaded);
    assert_eq!(beta.title, "beta");

    assert_eq!(engine.latest_votes(&prop_hash(0x11)).len(), 1);
    assert_eq!(engine.vote_history(&prop_hash(0x22)).expect("history").len(), 1);

    assert!(events.proposals_changed.load(Ordering::SeqCst) >= 2);
    assert_eq!(events.votes_changed.load(Ordering::SeqCst), 2);
}

#[test]
fn second_refresh_skips_fresh_snapshot_and_synced_votes() {
    let (_dir, cache) = temp_cache();
    let chain = MockChain::new(5000);
    chain.set_proposals(vec![raw_proposal(0x11, "alpha", 6000)]);
    chain.set_votes("alpha", vec![raw_vote("mn-1", 500, 0xAA, "YES")]);

    let engine = GovernanceSync::new(Arc::clone(&cache), Arc::new(chain), params());
    engine.refresh().expect("first refresh");

    let summary = engine.refresh().expect("second refresh");
    assert!(
        summary.reconcile.is_none(),
        "snapshot watermark is fresh; no network re-read"
    );
    assert!(
        summary.votes.is_none(),
        "votes were read moments ago; no re-read"
    );
}

#[test]
fn refresh_reports_empty_snapshot_without_touching_state() {
    let (_dir, cache) = temp_cache();
    let chain = MockChain::new(5000);
    chain.set_proposals(vec![raw_proposal(0x11, "alpha", 6000)]);

    let engine = GovernanceSync::new(Arc::clone(&cache), Arc::new(chain), params());
    engine.refresh().expect("first refresh");
    assert_eq!(engine.proposals().len(), 1);

    // Fresh engine over the same cache, now fed an empty snapshot with an
    // expired snapshot watermark.
    let handle = cache.acquire().expect("acquire");
    handle
        .set_live_config_u64("proposals_last_read_time", 1)
        .expect("stage");
    cache.commit().expect("commit");
    cache.release().expect("release");

    let chain = MockChain::new(5000);
    chain.set_proposals(vec![]);
    let engine = GovernanceSync::new(Arc::clone(&cache), Arc::new(chain), params());
    let summary = engine.refresh().expect("refresh");
    assert!(summary.reconcile_error.is_some());
    assert_eq!(engine.proposals().len(), 1, "cached state preserved");
}

#[test]
fn on_demand_vote_sync_picks_up_new_votes() {
    let (_dir, cache) = temp_cache();
    let chain = Arc::new(MockChain::new(5000));
    chain.set_proposals(vec![raw_proposal(0x11, "alpha", 6000)]);
    let engine = GovernanceSync::new(
        Arc::clone(&cache),
        Arc::clone(&chain) as Arc<dyn ChainClient>,
        params(),
    );
    engine.refresh().expect("refresh");
    assert!(engine.latest_votes(&prop_hash(0x11)).is_empty());

    // A vote lands between cycles; the consumer refreshes just that
    // proposal without waiting for the reload window.
    chain.set_votes("alpha", vec![raw_vote("mn-1", 500, 0xAA, "YES")]);
    let stats = engine
        .sync_votes(&[prop_hash(0x11)], false)
        .expect("sync votes");
    assert_eq!(stats.inserted, 1);
    assert_eq!(engine.latest_votes(&prop_hash(0x11)).len(), 1);
}

#[test]
fn cancelled_engine_refuses_to_refresh() {
    let (_dir, cache) = temp_cache();
    let chain = MockChain::new(5000);
    let engine = GovernanceSync::new(Arc::clone(&cache), Arc::new(chain), params());
    engine.cancel();
    assert!(matches!(
        engine.refresh().unwrap_err(),
        GovernanceError::Cancelled
    ));
}
