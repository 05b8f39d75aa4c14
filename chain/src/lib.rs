//! Remote-node interface for the govsync engine.
//!
//! The engine never talks to a daemon directly; it consumes the
//! [`ChainClient`] trait, which an embedding application implements over its
//! RPC transport of choice. This crate also provides:
//!
//! - [`BlockTimeEstimator`]: block height → epoch time, exact at or below the
//!   chain tip and linearly extrapolated above it;
//! - the superblock timing context derived once per refresh cycle;
//! - the external proposal-attribute fetcher (owner/title metadata from a
//!   governance web service).

pub mod client;
pub mod error;
pub mod estimator;
pub mod ext_attrs;
pub mod raw;

pub use client::{BlockHeader, ChainClient, TxInfo, VoteSubmission};
pub use error::ChainError;
pub use estimator::{BlockTimeEstimator, ChainTip, SuperblockTiming};
pub use ext_attrs::{ExtAttributeSource, ExtAttributes, HttpAttributeSource};
pub use raw::{FlexNum, RawProposal, RawVote};
