//! LMDB environment and databases backing the governance cache.
//!
//! One environment holds every table:
//! - `proposals`: row id (u64 BE) → bincode [`Proposal`]
//! - `proposal_hash_idx`: composite key `hash(32) ++ row_id_be(8)` → empty.
//!   Kept for active AND inactive rows, because a deactivated row may coexist
//!   with a newer active row of the same hash until the reconciler merges
//!   them; prefix scans find every row for a hash.
//! - `votes`: row id (u64 BE) → bincode [`Vote`]
//! - `vote_content_idx`: vote content hash (32) → vote row id (unique)
//! - `vote_proposal_idx`: composite key `proposal_id_be(8) ++ vote_id_be(8)`
//!   → empty, for per-proposal vote listing
//! - `live_config`: symbol string → value bytes (sync watermarks)
//! - `meta`: row-id counters, schema version

use std::ops::Bound;
use std::path::Path;

use heed::types::Bytes;
use heed::{Database, Env, EnvOpenOptions};

use govsync_types::{Proposal, ProposalHash, TxHash, Vote};

use crate::CacheError;

const MAP_SIZE: usize = 256 * 1024 * 1024;
const MAX_DBS: u32 = 8;

const NEXT_PROPOSAL_ID_KEY: &[u8] = b"next_proposal_id";
const NEXT_VOTE_ID_KEY: &[u8] = b"next_vote_id";

/// A staged cache mutation, buffered by the session and applied by
/// [`CacheDb::apply`] inside a single write transaction.
#[derive(Debug, Clone)]
pub(crate) enum WriteOp {
    /// Insert or overwrite a proposal row.
    PutProposal { id: u64, proposal: Proposal },
    /// Remove a proposal row entirely. Only used when merging duplicate rows
    /// of one hash; regular disappearance deactivates instead.
    DeleteProposal { id: u64 },
    /// Insert or overwrite a vote row (overwrite repoints the row when its
    /// proposal id changed).
    PutVote { id: u64, vote: Vote },
    /// Set a live-config symbol to a u64 value.
    PutLiveU64 { symbol: String, value: u64 },
}

/// The open connection to the cache store.
///
/// Opened lazily by the session on depth 0→1 and dropped on depth 1→0.
pub struct CacheDb {
    env: Env,
    proposals_db: Database<Bytes, Bytes>,
    proposal_hash_db: Database<Bytes, Bytes>,
    votes_db: Database<Bytes, Bytes>,
    vote_content_db: Database<Bytes, Bytes>,
    vote_proposal_db: Database<Bytes, Bytes>,
    live_config_db: Database<Bytes, Bytes>,
    meta_db: Database<Bytes, Bytes>,
}

fn id_key(id: u64) -> [u8; 8] {
    id.to_be_bytes()
}

/// Composite key `hash(32) ++ row_id_be(8)` for `proposal_hash_idx`.
fn hash_idx_key(hash: &ProposalHash, id: u64) -> [u8; 40] {
    let mut key = [0u8; 40];
    key[..32].copy_from_slice(hash.as_bytes());
    key[32..].copy_from_slice(&id.to_be_bytes());
    key
}

/// Composite key `proposal_id_be(8) ++ vote_id_be(8)` for `vote_proposal_idx`.
fn vote_idx_key(proposal_id: u64, vote_id: u64) -> [u8; 16] {
    let mut key = [0u8; 16];
    key[..8].copy_from_slice(&proposal_id.to_be_bytes());
    key[8..].copy_from_slice(&vote_id.to_be_bytes());
    key
}

/// Exclusive upper bound for a prefix scan, or `None` when the prefix is all
/// 0xFF and the scan is unbounded above.
fn prefix_upper_bound(prefix: &[u8]) -> Option<Vec<u8>> {
    let mut upper = prefix.to_vec();
    while let Some(last) = upper.last_mut() {
        if *last == 0xFF {
            upper.pop();
        } else {
            *last += 1;
            return Some(upper);
        }
    }
    None
}

fn parse_id(bytes: &[u8], what: &str) -> Result<u64, CacheError> {
    let arr: [u8; 8] = bytes
        .try_into()
        .map_err(|_| CacheError::Corrupt(format!("{} has unexpected byte length", what)))?;
    Ok(u64::from_be_bytes(arr))
}

impl CacheDb {
    /// Open or create the cache environment at `path` (a directory).
    pub fn open(path: &Path) -> Result<Self, CacheError> {
        std::fs::create_dir_all(path)
            .map_err(|e| CacheError::Backend(format!("cannot create cache dir: {}", e)))?;

        let env = unsafe {
            EnvOpenOptions::new()
                .map_size(MAP_SIZE)
                .max_dbs(MAX_DBS)
                .open(path)?
        };

        let mut wtxn = env.write_txn()?;
        let proposals_db = env.create_database(&mut wtxn, Some("proposals"))?;
        let proposal_hash_db = env.create_database(&mut wtxn, Some("proposal_hash_idx"))?;
        let votes_db = env.create_database(&mut wtxn, Some("votes"))?;
        let vote_content_db = env.create_database(&mut wtxn, Some("vote_content_idx"))?;
        let vote_proposal_db = env.create_database(&mut wtxn, Some("vote_proposal_idx"))?;
        let live_config_db = env.create_database(&mut wtxn, Some("live_config"))?;
        let meta_db = env.create_database(&mut wtxn, Some("meta"))?;
        wtxn.commit()?;

        Ok(Self {
            env,
            proposals_db,
            proposal_hash_db,
            votes_db,
            vote_content_db,
            vote_proposal_db,
            live_config_db,
            meta_db,
        })
    }

    // ── Row-id counters ─────────────────────────────────────────────────

    /// Committed values of the proposal and vote row-id counters.
    /// Counters start at 1 so that 0 is never a valid row id.
    pub(crate) fn next_ids(&self) -> Result<(u64, u64), CacheError> {
        let rtxn = self.env.read_txn()?;
        let read = |key: &[u8]| -> Result<u64, CacheError> {
            match self.meta_db.get(&rtxn, key)? {
                Some(bytes) => parse_id(bytes, "row-id counter"),
                None => Ok(1),
            }
        };
        Ok((read(NEXT_PROPOSAL_ID_KEY)?, read(NEXT_VOTE_ID_KEY)?))
    }

    // ── Proposal reads ──────────────────────────────────────────────────

    pub fn proposal(&self, id: u64) -> Result<Option<Proposal>, CacheError> {
        let rtxn = self.env.read_txn()?;
        match self.proposals_db.get(&rtxn, &id_key(id))? {
            Some(bytes) => Ok(Some(bincode::deserialize(bytes)?)),
            None => Ok(None),
        }
    }

    /// Every row (active or not) stored under `hash`, in row-id order.
    pub fn proposals_by_hash(&self, hash: &ProposalHash) -> Result<Vec<(u64, Proposal)>, CacheError> {
        let rtxn = self.env.read_txn()?;
        let prefix = hash.as_bytes().as_slice();
        let upper = prefix_upper_bound(prefix);
        let bounds = (
            Bound::Included(prefix),
            upper.as_deref().map_or(Bound::Unbounded, Bound::Excluded),
        );

        let mut out = Vec::new();
        for entry in self.proposal_hash_db.range(&rtxn, &bounds)? {
            let (key, _) = entry?;
            let id = parse_id(&key[32..], "proposal hash index key")?;
            let bytes = self
                .proposals_db
                .get(&rtxn, &id_key(id))?
                .ok_or_else(|| CacheError::Corrupt(format!("dangling hash index for row {}", id)))?;
            out.push((id, bincode::deserialize(bytes)?));
        }
        Ok(out)
    }

    /// All rows currently marked active, in row-id order.
    pub fn active_proposals(&self) -> Result<Vec<(u64, Proposal)>, CacheError> {
        let rtxn = self.env.read_txn()?;
        let mut out = Vec::new();
        for entry in self.proposals_db.iter(&rtxn)? {
            let (key, bytes) = entry?;
            let proposal: Proposal = bincode::deserialize(bytes)?;
            if proposal.active {
                out.push((parse_id(key, "proposal row key")?, proposal));
            }
        }
        Ok(out)
    }

    // ── Vote reads ──────────────────────────────────────────────────────

    pub fn vote_by_content(&self, content_hash: &TxHash) -> Result<Option<(u64, Vote)>, CacheError> {
        let rtxn = self.env.read_txn()?;
        let id = match self.vote_content_db.get(&rtxn, content_hash.as_bytes())? {
            Some(bytes) => parse_id(bytes, "vote content index value")?,
            None => return Ok(None),
        };
        let bytes = self
            .votes_db
            .get(&rtxn, &id_key(id))?
            .ok_or_else(|| CacheError::Corrupt(format!("dangling content index for vote {}", id)))?;
        Ok(Some((id, bincode::deserialize(bytes)?)))
    }

    pub fn votes_for_proposal(&self, proposal_id: u64) -> Result<Vec<(u64, Vote)>, CacheError> {
        let rtxn = self.env.read_txn()?;
        let prefix = proposal_id.to_be_bytes();
        let upper = prefix_upper_bound(&prefix);
        let bounds = (
            Bound::Included(prefix.as_slice()),
            upper.as_deref().map_or(Bound::Unbounded, Bound::Excluded),
        );

        let mut out = Vec::new();
        for entry in self.vote_proposal_db.range(&rtxn, &bounds)? {
            let (key, _) = entry?;
            let vote_id = parse_id(&key[8..], "vote proposal index key")?;
            let bytes = self
                .votes_db
                .get(&rtxn, &id_key(vote_id))?
                .ok_or_else(|| {
                    CacheError::Corrupt(format!("dangling proposal index for vote {}", vote_id))
                })?;
            out.push((vote_id, bincode::deserialize(bytes)?));
        }
        Ok(out)
    }

    // ── Live config ─────────────────────────────────────────────────────

    pub fn live_config_u64(&self, symbol: &str) -> Result<Option<u64>, CacheError> {
        let rtxn = self.env.read_txn()?;
        match self.live_config_db.get(&rtxn, symbol.as_bytes())? {
            Some(bytes) => Ok(Some(parse_id(bytes, "live config value")?)),
            None => Ok(None),
        }
    }

    // ── Batch apply ─────────────────────────────────────────────────────

    /// Apply a staged batch and the advanced row-id counters in one write
    /// transaction. This is the only fsync in the entire batch; if anything
    /// fails, nothing is persisted.
    pub(crate) fn apply(
        &self,
        ops: &[WriteOp],
        next_proposal_id: u64,
        next_vote_id: u64,
    ) -> Result<(), CacheError> {
        let mut wtxn = self.env.write_txn()?;

        for op in ops {
            match op {
                WriteOp::PutProposal { id, proposal } => {
                    let bytes = bincode::serialize(proposal)?;
                    let key = id_key(*id);
                    let is_new = self.proposals_db.get(&wtxn, &key)?.is_none();
                    self.proposals_db.put(&mut wtxn, &key, &bytes)?;
                    if is_new {
                        self.proposal_hash_db
                            .put(&mut wtxn, &hash_idx_key(&proposal.hash, *id), &[])?;
                    }
                }
                WriteOp::DeleteProposal { id } => {
                    let key = id_key(*id);
                    if let Some(bytes) = self.proposals_db.get(&wtxn, &key)? {
                        let proposal: Proposal = bincode::deserialize(bytes)?;
                        self.proposal_hash_db
                            .delete(&mut wtxn, &hash_idx_key(&proposal.hash, *id))?;
                    }
                    self.proposals_db.delete(&mut wtxn, &key)?;
                    // Sweep any vote-index leftovers for the dropped row.
                    let prefix = id.to_be_bytes();
                    let upper = prefix_upper_bound(&prefix);
                    let bounds = (
                        Bound::Included(prefix.as_slice()),
                        upper.as_deref().map_or(Bound::Unbounded, Bound::Excluded),
                    );
                    let mut stale: Vec<Vec<u8>> = Vec::new();
                    for entry in self.vote_proposal_db.range(&wtxn, &bounds)? {
                        let (key, _) = entry?;
                        stale.push(key.to_vec());
                    }
                    for key in stale {
                        self.vote_proposal_db.delete(&mut wtxn, &key)?;
                    }
                }
                WriteOp::PutVote { id, vote } => {
                    let key = id_key(*id);
                    if let Some(bytes) = self.votes_db.get(&wtxn, &key)? {
                        let old: Vote = bincode::deserialize(bytes)?;
                        if old.proposal_id != vote.proposal_id {
                            self.vote_proposal_db
                                .delete(&mut wtxn, &vote_idx_key(old.proposal_id, *id))?;
                        }
                    }
                    let bytes = bincode::serialize(vote)?;
                    self.votes_db.put(&mut wtxn, &key, &bytes)?;
                    self.vote_content_db.put(
                        &mut wtxn,
                        vote.content_hash.as_bytes(),
                        &id.to_be_bytes(),
                    )?;
                    self.vote_proposal_db
                        .put(&mut wtxn, &vote_idx_key(vote.proposal_id, *id), &[])?;
                }
                WriteOp::PutLiveU64 { symbol, value } => {
                    self.live_config_db
                        .put(&mut wtxn, symbol.as_bytes(), &value.to_be_bytes())?;
                }
            }
        }

        self.meta_db
            .put(&mut wtxn, NEXT_PROPOSAL_ID_KEY, &next_proposal_id.to_be_bytes())?;
        self.meta_db
            .put(&mut wtxn, NEXT_VOTE_ID_KEY, &next_vote_id.to_be_bytes())?;

        wtxn.commit()?;
        Ok(())
    }
}
