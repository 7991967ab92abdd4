//! Error types for forksync.

use crate::process::Pid;
use crate::section::SectionId;
use std::path::PathBuf;
use thiserror::Error;

/// Result type alias using forksync's Error.
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for forksync operations.
///
/// Transport failures (a dead peer, a full pipe) are normally folded into
/// `false` returns by the section API. The variants here surface where a
/// caller has to react: setup failures, protocol misuse and malformed input.
#[derive(Error, Debug)]
pub enum Error {
    /// Named pipe creation or open failed.
    #[error("failed to open channel {}: {source}", path.display())]
    ChannelOpenFailed {
        /// Path of the named pipe.
        path: PathBuf,
        /// Underlying system error.
        source: rustix::io::Errno,
    },

    /// The peer process is dead or the channel pair is incomplete.
    #[error("link to process {0} is broken")]
    LinkBroken(Pid),

    /// An ownership-gated operation was invoked without holding the lock.
    #[error("critical section {0} is not owned by this process")]
    NotOwned(SectionId),

    /// A request/response round-trip did not complete.
    #[error("operation timed out")]
    OperationTimeout,

    /// A received frame could not be decoded.
    #[error("invalid frame: {0}")]
    InvalidFrame(String),

    /// Snapshot serialization failed (rkyv).
    #[error("serialization failed: {0}")]
    Serialization(String),

    /// Forking or initializing a thread failed.
    #[error("failed to spawn thread: {0}")]
    Spawn(String),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// System call error (via rustix).
    #[error("system error: {0}")]
    System(#[from] rustix::io::Errno),
}
