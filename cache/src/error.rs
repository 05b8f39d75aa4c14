use thiserror::Error;

#[derive(Debug, Error)]
pub enum CacheError {
    /// The store could not be opened at construction; the session is
    /// permanently inactive and every operation fails fast with this error.
    #[error("cache store is not active")]
    StoreInactive,

    /// A session operation (release/commit/rollback/store access) was made
    /// by a thread that does not currently hold an acquired session.
    #[error("cache session not acquired by this thread")]
    SessionNotAcquired,

    #[error("LMDB error: {0}")]
    Backend(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("corrupt cache entry: {0}")]
    Corrupt(String),
}

impl From<heed::Error> for CacheError {
    fn from(e: heed::Error) -> Self {
        CacheError::Backend(e.to_string())
    }
}

impl From<bincode::Error> for CacheError {
    fn from(e: bincode::Error) -> Self {
        CacheError::Serialization(e.to_string())
    }
}
