//! Fundamental types for the govsync governance cache.
//!
//! This crate defines the core types shared across every other crate in the
//! workspace: network hashes, masternode identities, timestamps, vote values,
//! the proposal and vote entities held in the cache, and the governance
//! parameters that vary between network instances.

pub mod hash;
pub mod ident;
pub mod masternode;
pub mod params;
pub mod proposal;
pub mod time;
pub mod vote;

pub use hash::{BlockHash, HashParseError, ProposalHash, TxHash};
pub use ident::MasternodeIdent;
pub use masternode::{Masternode, MasternodeStatus};
pub use params::{GovernanceParams, ParamsError};
pub use proposal::{Proposal, VotingStatus};
pub use time::Timestamp;
pub use vote::{Vote, VoteResult};
