use thiserror::Error;

#[derive(Debug, Error)]
pub enum ChainError {
    /// A network call failed. Recoverable per item: the caller skips the
    /// affected proposal/vote and carries on.
    #[error("network error: {0}")]
    Network(String),

    /// The data source itself is unavailable (e.g. the block tip cannot be
    /// fetched). Fatal to the whole refresh cycle.
    #[error("chain data source unavailable: {0}")]
    Unavailable(String),

    /// The remote returned data this client cannot interpret.
    #[error("malformed network response: {0}")]
    Malformed(String),
}

impl ChainError {
    /// Escalate a per-item network error into a cycle-fatal one. Used for
    /// the block-tip and superblock fetches, where failure means no timing
    /// context can exist for the cycle.
    pub fn fatal(self) -> Self {
        match self {
            Self::Network(msg) => Self::Unavailable(msg),
            other => other,
        }
    }
}
