//! Masternode snapshot records, read-only to this engine.
//!
//! The engine only needs the masternode population to size vote-eligibility
//! thresholds; everything else about masternode management lives outside.

use serde::{Deserialize, Serialize};

use crate::ident::MasternodeIdent;

/// The status the network reports for a masternode.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum MasternodeStatus {
    Enabled,
    PreEnabled,
    NewStartRequired,
    WatchdogExpired,
    Expired,
    /// Any status string this client does not recognise.
    Other(String),
}

impl MasternodeStatus {
    pub fn parse(s: &str) -> Self {
        match s {
            "ENABLED" => Self::Enabled,
            "PRE_ENABLED" => Self::PreEnabled,
            "NEW_START_REQUIRED" => Self::NewStartRequired,
            "WATCHDOG_EXPIRED" => Self::WatchdogExpired,
            "EXPIRED" => Self::Expired,
            other => Self::Other(other.to_string()),
        }
    }

    /// Whether this masternode counts toward the active voting population
    /// used by the funding-eligibility threshold.
    pub fn counts_as_active(&self) -> bool {
        matches!(self, Self::Enabled | Self::PreEnabled)
    }
}

/// A point-in-time view of one masternode, as reported by the network.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Masternode {
    pub ident: MasternodeIdent,
    pub status: MasternodeStatus,
    pub protocol_version: u32,
}

/// Count the masternodes eligible to vote right now.
pub fn active_count(masternodes: &[Masternode]) -> usize {
    masternodes
        .iter()
        .filter(|mn| mn.status.counts_as_active())
        .count()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mn(ident: &str, status: &str) -> Masternode {
        Masternode {
            ident: MasternodeIdent::new(ident),
            status: MasternodeStatus::parse(status),
            protocol_version: 70208,
        }
    }

    #[test]
    fn active_count_includes_enabled_and_pre_enabled_only() {
        let list = vec![
            mn("a-0", "ENABLED"),
            mn("b-0", "PRE_ENABLED"),
            mn("c-0", "NEW_START_REQUIRED"),
            mn("d-0", "EXPIRED"),
            mn("e-0", "SENTINEL_PING_EXPIRED"),
        ];
        assert_eq!(active_count(&list), 2);
    }

    #[test]
    fn unknown_status_is_preserved() {
        let status = MasternodeStatus::parse("SOMETHING_NEW");
        assert_eq!(status, MasternodeStatus::Other("SOMETHING_NEW".to_string()));
        assert!(!status.counts_as_active());
    }
}
