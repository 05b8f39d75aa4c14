//! Reentrant, depth-counted session over the cache store.
//!
//! Semantics, chosen to match a per-store database handle shared by many
//! worker threads:
//!
//! - `acquire` grants the calling thread exclusive use of the store; other
//!   threads block in `acquire` until the owner fully releases.
//! - Repeated acquires from the owning thread nest: each returns a handle to
//!   the same underlying connection and bumps a depth counter. The connection
//!   is opened on depth 0→1 and dropped on depth 1→0.
//! - `release`, `commit`, and `rollback` without an acquired session are
//!   errors ([`CacheError::SessionNotAcquired`]), not no-ops.
//! - Ownership is an explicit thread id + depth counter guarded by a plain
//!   `Mutex`/`Condvar` pair rather than a reentrant-lock primitive, so the
//!   error contract above holds exactly.
//!
//! Writes made through a [`SessionHandle`] are staged in order and applied by
//! `commit` in one LMDB write transaction; `rollback` discards the staged
//! batch. Reads always see the last committed state.

use std::path::{Path, PathBuf};
use std::sync::{Condvar, Mutex, MutexGuard};
use std::thread::{self, ThreadId};

use govsync_types::{Proposal, ProposalHash, TxHash, Vote};
use tracing::{debug, error, warn};

use crate::environment::{CacheDb, WriteOp};
use crate::CacheError;

struct SessionState {
    owner: Option<ThreadId>,
    depth: u32,
    conn: Option<CacheDb>,
    staged: Vec<WriteOp>,
    /// In-session mirrors of the persisted row-id counters; staged inserts
    /// allocate from these so callers can reference new rows before commit.
    next_proposal_id: u64,
    next_vote_id: u64,
}

/// Coordinates access to the governance cache from multiple threads.
pub struct CacheSession {
    path: PathBuf,
    active: bool,
    state: Mutex<SessionState>,
    cond: Condvar,
}

/// Proof of an acquired session; exposes the store operations.
///
/// The handle stays bound to the acquiring thread: operations through a
/// handle after the session was fully released (or from another thread) fail
/// with [`CacheError::SessionNotAcquired`].
pub struct SessionHandle<'a> {
    session: &'a CacheSession,
}

impl<'a> std::fmt::Debug for SessionHandle<'a> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionHandle").finish()
    }
}

impl CacheSession {
    /// Create the session and verify the store can be opened.
    ///
    /// The store is opened once to create missing tables and then closed
    /// again; the first `acquire` reopens it. If the open fails, the session
    /// is permanently inactive and every operation returns
    /// [`CacheError::StoreInactive`].
    pub fn new(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let active = match CacheDb::open(&path) {
            Ok(_) => true,
            Err(e) => {
                error!(path = %path.display(), error = %e, "cache store initialization failed");
                false
            }
        };
        Self {
            path,
            active,
            state: Mutex::new(SessionState {
                owner: None,
                depth: 0,
                conn: None,
                staged: Vec::new(),
                next_proposal_id: 1,
                next_vote_id: 1,
            }),
            cond: Condvar::new(),
        }
    }

    /// Whether the underlying store opened successfully at construction.
    pub fn is_active(&self) -> bool {
        self.active
    }

    /// Directory holding the store files.
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn lock_state(&self) -> MutexGuard<'_, SessionState> {
        self.state.lock().expect("cache session state lock poisoned")
    }

    /// Acquire the session for the calling thread, blocking while another
    /// thread holds it. Reentrant: nested acquires return a handle to the
    /// same connection and must be paired with the same number of
    /// [`CacheSession::release`] calls.
    pub fn acquire(&self) -> Result<SessionHandle<'_>, CacheError> {
        if !self.active {
            return Err(CacheError::StoreInactive);
        }
        let me = thread::current().id();
        let mut st = self.lock_state();
        while st.owner.is_some() && st.owner != Some(me) {
            st = self
                .cond
                .wait(st)
                .expect("cache session state lock poisoned");
        }

        if st.depth == 0 {
            let conn = CacheDb::open(&self.path)?;
            let (next_proposal_id, next_vote_id) = conn.next_ids()?;
            st.conn = Some(conn);
            st.next_proposal_id = next_proposal_id;
            st.next_vote_id = next_vote_id;
            st.staged.clear();
        }
        st.owner = Some(me);
        st.depth += 1;
        debug!(depth = st.depth, "acquired cache session");
        Ok(SessionHandle { session: self })
    }

    /// Release one level of the calling thread's session. On the final
    /// release the connection is closed and any uncommitted staged writes
    /// are discarded.
    pub fn release(&self) -> Result<(), CacheError> {
        if !self.active {
            warn!("cannot release a session on an inactive store");
            return Err(CacheError::StoreInactive);
        }
        let mut st = self.lock_state();
        if st.depth == 0 || st.owner != Some(thread::current().id()) {
            return Err(CacheError::SessionNotAcquired);
        }
        st.depth -= 1;
        debug!(depth = st.depth, "released cache session");
        if st.depth == 0 {
            if !st.staged.is_empty() {
                warn!(
                    discarded = st.staged.len(),
                    "closing cache session with uncommitted staged writes"
                );
                st.staged.clear();
            }
            st.conn = None;
            st.owner = None;
            self.cond.notify_all();
        }
        Ok(())
    }

    /// Persist every staged write in one transaction. Requires an acquired
    /// session. On failure nothing is persisted and the staged batch is kept
    /// so the caller may retry or roll back.
    pub fn commit(&self) -> Result<(), CacheError> {
        if !self.active {
            warn!("cannot commit on an inactive store");
            return Err(CacheError::StoreInactive);
        }
        let mut st = self.lock_state();
        if st.depth == 0 || st.owner != Some(thread::current().id()) {
            return Err(CacheError::SessionNotAcquired);
        }
        if st.staged.is_empty() {
            return Ok(());
        }
        let staged = std::mem::take(&mut st.staged);
        let (next_proposal_id, next_vote_id) = (st.next_proposal_id, st.next_vote_id);
        let conn = st.conn.as_ref().ok_or(CacheError::SessionNotAcquired)?;
        if let Err(e) = conn.apply(&staged, next_proposal_id, next_vote_id) {
            st.staged = staged;
            return Err(e);
        }
        Ok(())
    }

    /// Discard every staged write. Requires an acquired session.
    pub fn rollback(&self) -> Result<(), CacheError> {
        if !self.active {
            warn!("cannot rollback on an inactive store");
            return Err(CacheError::StoreInactive);
        }
        let mut st = self.lock_state();
        if st.depth == 0 || st.owner != Some(thread::current().id()) {
            return Err(CacheError::SessionNotAcquired);
        }
        st.staged.clear();
        let conn = st.conn.as_ref().ok_or(CacheError::SessionNotAcquired)?;
        let (next_proposal_id, next_vote_id) = conn.next_ids()?;
        st.next_proposal_id = next_proposal_id;
        st.next_vote_id = next_vote_id;
        Ok(())
    }
}

impl Drop for CacheSession {
    fn drop(&mut self) {
        let st = self.lock_state();
        if st.depth > 0 {
            error!(depth = st.depth, "cache session leaked: dropped while still acquired");
        }
    }
}

impl SessionHandle<'_> {
    fn with_state<R>(
        &self,
        f: impl FnOnce(&mut SessionState) -> Result<R, CacheError>,
    ) -> Result<R, CacheError> {
        let mut st = self.session.lock_state();
        if st.depth == 0 || st.owner != Some(thread::current().id()) || st.conn.is_none() {
            return Err(CacheError::SessionNotAcquired);
        }
        f(&mut st)
    }

    // ── Proposal operations ─────────────────────────────────────────────

    /// Stage the insertion of a new proposal row, returning its row id.
    pub fn insert_proposal(&self, proposal: &Proposal) -> Result<u64, CacheError> {
        self.with_state(|st| {
            let id = st.next_proposal_id;
            st.next_proposal_id += 1;
            st.staged.push(WriteOp::PutProposal {
                id,
                proposal: proposal.clone(),
            });
            Ok(id)
        })
    }

    /// Stage an overwrite of an existing proposal row.
    pub fn update_proposal(&self, id: u64, proposal: &Proposal) -> Result<(), CacheError> {
        self.with_state(|st| {
            st.staged.push(WriteOp::PutProposal {
                id,
                proposal: proposal.clone(),
            });
            Ok(())
        })
    }

    /// Stage the removal of a duplicate proposal row.
    pub fn delete_proposal(&self, id: u64) -> Result<(), CacheError> {
        self.with_state(|st| {
            st.staged.push(WriteOp::DeleteProposal { id });
            Ok(())
        })
    }

    pub fn proposal(&self, id: u64) -> Result<Option<Proposal>, CacheError> {
        self.with_state(|st| st.conn.as_ref().expect("checked").proposal(id))
    }

    /// Every committed row (active or not) stored under `hash`.
    pub fn proposals_by_hash(
        &self,
        hash: &ProposalHash,
    ) -> Result<Vec<(u64, Proposal)>, CacheError> {
        self.with_state(|st| st.conn.as_ref().expect("checked").proposals_by_hash(hash))
    }

    /// All committed rows currently marked active.
    pub fn active_proposals(&self) -> Result<Vec<(u64, Proposal)>, CacheError> {
        self.with_state(|st| st.conn.as_ref().expect("checked").active_proposals())
    }

    // ── Vote operations ─────────────────────────────────────────────────

    /// Stage the insertion of a new vote row, returning its row id.
    pub fn insert_vote(&self, vote: &Vote) -> Result<u64, CacheError> {
        self.with_state(|st| {
            let id = st.next_vote_id;
            st.next_vote_id += 1;
            st.staged.push(WriteOp::PutVote {
                id,
                vote: vote.clone(),
            });
            Ok(id)
        })
    }

    /// Stage an overwrite of an existing vote row (e.g. repointing it to a
    /// different proposal row).
    pub fn update_vote(&self, id: u64, vote: &Vote) -> Result<(), CacheError> {
        self.with_state(|st| {
            st.staged.push(WriteOp::PutVote {
                id,
                vote: vote.clone(),
            });
            Ok(())
        })
    }

    pub fn vote_by_content(&self, content_hash: &TxHash) -> Result<Option<(u64, Vote)>, CacheError> {
        self.with_state(|st| st.conn.as_ref().expect("checked").vote_by_content(content_hash))
    }

    pub fn votes_for_proposal(&self, proposal_id: u64) -> Result<Vec<(u64, Vote)>, CacheError> {
        self.with_state(|st| {
            st.conn
                .as_ref()
                .expect("checked")
                .votes_for_proposal(proposal_id)
        })
    }

    // ── Live config ─────────────────────────────────────────────────────

    pub fn live_config_u64(&self, symbol: &str) -> Result<Option<u64>, CacheError> {
        self.with_state(|st| st.conn.as_ref().expect("checked").live_config_u64(symbol))
    }

    pub fn set_live_config_u64(&self, symbol: &str, value: u64) -> Result<(), CacheError> {
        self.with_state(|st| {
            st.staged.push(WriteOp::PutLiveU64 {
                symbol: symbol.to_string(),
                value,
            });
            Ok(())
        })
    }
}
