//! Raw governance records as the daemon reports them.
//!
//! These are deliberately loose: every field is optional or defaulted, and
//! numeric fields accept whatever representation the daemon emits for them
//! that day. Validation into typed records happens in the registry, where a
//! malformed record can be skipped and counted instead of poisoning the
//! whole snapshot.

use serde::{Deserialize, Serialize};

/// A numeric JSON field that different daemon versions emit as a float, an
/// integer, or a string (sometimes with a comma as the decimal separator).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FlexNum {
    Int(i64),
    Float(f64),
    Text(String),
}

impl FlexNum {
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Self::Float(v) => Some(*v),
            Self::Int(v) => Some(*v as f64),
            Self::Text(s) => s.replace(',', ".").trim().parse().ok(),
        }
    }
}

impl Default for FlexNum {
    fn default() -> Self {
        Self::Int(0)
    }
}

/// One proposal record from the network snapshot (`mnbudget show`).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RawProposal {
    #[serde(rename = "Hash")]
    pub hash: String,
    #[serde(rename = "Name")]
    pub name: String,
    #[serde(rename = "URL")]
    pub url: String,
    #[serde(rename = "FeeHash")]
    pub fee_hash: String,
    #[serde(rename = "BlockStart")]
    pub block_start: i64,
    #[serde(rename = "TotalPaymentCount")]
    pub total_payment_count: i64,
    #[serde(rename = "PaymentAddress")]
    pub payment_address: String,
    #[serde(rename = "Ratio")]
    pub ratio: FlexNum,
    #[serde(rename = "Yeas")]
    pub yes_count: i64,
    #[serde(rename = "Nays")]
    pub no_count: i64,
    #[serde(rename = "Abstains")]
    pub abstain_count: i64,
    #[serde(rename = "TotalPayment")]
    pub total_payment: FlexNum,
    #[serde(rename = "MonthlyPayment")]
    pub monthly_payment: FlexNum,
    #[serde(rename = "IsEstablished")]
    pub is_established: bool,
    #[serde(rename = "IsValid")]
    pub is_valid: bool,
    #[serde(rename = "IsValidReason")]
    pub is_valid_reason: String,
}

/// One vote record from the per-proposal vote listing
/// (`mnbudget getvotes <name>`), flattened from the ident-keyed map the
/// daemon returns.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RawVote {
    pub masternode_ident: String,
    /// Epoch seconds (`nTime`).
    #[serde(rename = "nTime", alias = "timestamp")]
    pub timestamp: i64,
    /// Network identifier of the vote message (`nHash`).
    #[serde(rename = "nHash", alias = "content_hash")]
    pub content_hash: String,
    /// "YES" / "NO" / "ABSTAIN" in whatever case the daemon uses.
    #[serde(rename = "Vote", alias = "result")]
    pub result: String,
}
