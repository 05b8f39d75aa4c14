//! Masternode identity type.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::hash::TxHash;

/// The stable identity of a masternode, derived from its collateral
/// transaction: `"<collateral_txid>-<collateral_tx_index>"`.
///
/// This is the key under which the network reports votes, and it survives
/// masternode restarts and IP changes.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MasternodeIdent(String);

impl MasternodeIdent {
    /// Create an identity from a raw string already in `txid-index` form.
    pub fn new(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }

    /// Build the identity from the collateral transaction reference.
    pub fn from_collateral(tx: &TxHash, index: u32) -> Self {
        Self(format!("{}-{}", tx, index))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for MasternodeIdent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<String> for MasternodeIdent {
    fn from(s: String) -> Self {
        Self(s)
    }
}
