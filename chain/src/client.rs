//! The network data source consumed by the engine.

use govsync_types::{BlockHash, Masternode, ProposalHash, Timestamp, TxHash, VoteResult};

use crate::error::ChainError;
use crate::raw::{RawProposal, RawVote};

/// Header fields the engine needs from `getblockheader`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockHeader {
    pub time: Timestamp,
}

/// Transaction fields the engine needs from `getrawtransaction` (the fee
/// transaction's own timestamp, used as a proposal's creation time).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TxInfo {
    pub time: Timestamp,
}

/// A fully assembled vote ready for the daemon's raw-vote RPC.
#[derive(Debug, Clone)]
pub struct VoteSubmission {
    pub collateral_tx: TxHash,
    pub collateral_tx_index: u32,
    pub proposal_hash: ProposalHash,
    /// Vote signal; governance funding votes use "funding".
    pub signal: String,
    pub vote: VoteResult,
    pub sig_time: Timestamp,
    /// Signature produced by the external signer, already encoded for the
    /// wire.
    pub signature: String,
}

/// Everything the engine asks of the remote node.
///
/// Implementations own transport, authentication, connection selection, and
/// their timeout/retry policy; the engine treats every call as fail-fast.
/// Calls may be slow; the engine never invokes them while holding the cache
/// session.
pub trait ChainClient: Send + Sync {
    /// Current governance proposal snapshot.
    fn fetch_proposals(&self) -> Result<Vec<RawProposal>, ChainError>;

    /// All current votes on one proposal, identified by name.
    fn fetch_votes(&self, proposal_name: &str) -> Result<Vec<RawVote>, ChainError>;

    fn block_count(&self) -> Result<u64, ChainError>;

    fn block_hash(&self, height: u64) -> Result<BlockHash, ChainError>;

    fn block_header(&self, hash: &BlockHash) -> Result<BlockHeader, ChainError>;

    fn raw_transaction(&self, tx: &TxHash) -> Result<TxInfo, ChainError>;

    /// Height of the next superblock.
    fn next_superblock(&self) -> Result<u64, ChainError>;

    /// Current masternode population snapshot.
    fn masternode_list(&self) -> Result<Vec<Masternode>, ChainError>;

    /// Broadcast a signed vote; returns the daemon's result string
    /// (successful submissions answer "Voted successfully").
    fn submit_vote(&self, submission: &VoteSubmission) -> Result<String, ChainError>;
}
