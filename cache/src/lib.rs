//! Persistent governance cache with a reentrant session layer.
//!
//! The cache mirrors proposals and votes from the network into LMDB so that
//! consumers always have a low-latency local view, even when the remote node
//! is slow or unreachable. All access goes through [`CacheSession`]:
//!
//! - at most one thread holds the session at a time (a global reentrant lock
//!   serializes the underlying store across threads);
//! - repeated acquires from the owning thread nest via a depth counter, and
//!   the store connection is opened on depth 0→1 and closed on depth 1→0;
//! - writes are staged inside the session and applied by [`CacheSession::commit`]
//!   in a single LMDB write transaction, so a failure anywhere in a batch
//!   leaves the cache untouched.

pub mod environment;
pub mod error;
pub mod session;

pub use environment::CacheDb;
pub use error::CacheError;
pub use session::{CacheSession, SessionHandle};
