//! Vote values and the stored vote record.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::hash::TxHash;
use crate::ident::MasternodeIdent;
use crate::time::Timestamp;

/// The value of a single masternode vote on a proposal.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum VoteResult {
    Yes,
    No,
    Abstain,
}

impl VoteResult {
    /// The single-character code used in the canonical signing payload.
    pub fn wire_code(&self) -> &'static str {
        match self {
            Self::Yes => "1",
            Self::No => "2",
            Self::Abstain => "3",
        }
    }

    /// The lower-case word submitted to the daemon's vote RPC.
    pub fn submit_word(&self) -> &'static str {
        match self {
            Self::Yes => "yes",
            Self::No => "no",
            Self::Abstain => "abstain",
        }
    }

    /// Parse the value reported by the network. The daemon is not consistent
    /// about case, so matching is case-insensitive.
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_uppercase().as_str() {
            "YES" => Some(Self::Yes),
            "NO" => Some(Self::No),
            "ABSTAIN" => Some(Self::Abstain),
            _ => None,
        }
    }
}

impl fmt::Display for VoteResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::Yes => "YES",
            Self::No => "NO",
            Self::Abstain => "ABSTAIN",
        };
        write!(f, "{}", label)
    }
}

/// A single masternode vote as stored in the cache.
///
/// `content_hash` is the network-supplied identifier of the vote message and
/// is unique per logical vote; the cache never stores two rows with the same
/// content hash.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Vote {
    /// Cache row id of the proposal this vote belongs to.
    pub proposal_id: u64,
    pub masternode_ident: MasternodeIdent,
    pub timestamp: Timestamp,
    pub result: VoteResult,
    pub content_hash: TxHash,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_is_case_insensitive() {
        assert_eq!(VoteResult::parse("yes"), Some(VoteResult::Yes));
        assert_eq!(VoteResult::parse("No"), Some(VoteResult::No));
        assert_eq!(VoteResult::parse("ABSTAIN"), Some(VoteResult::Abstain));
        assert_eq!(VoteResult::parse("maybe"), None);
    }

    #[test]
    fn wire_codes_match_protocol() {
        assert_eq!(VoteResult::Yes.wire_code(), "1");
        assert_eq!(VoteResult::No.wire_code(), "2");
        assert_eq!(VoteResult::Abstain.wire_code(), "3");
    }
}
