//! Error types for bucket operations.

use thiserror::Error;

/// Errors surfaced by the bucket storage engine.
#[derive(Debug, Error)]
pub enum BucketError {
    /// The per-ledger batch from the transaction layer is malformed
    /// (a key appears in more than one of the init/live/dead lists, or
    /// twice within one list). Fatal for the current ledger close.
    #[error("batch invariant violated: {0}")]
    BatchInvariantViolated(String),

    /// A merge was interrupted by cooperative shutdown. Transient: the
    /// persisted archive state restarts the merge on the next startup.
    #[error("merge aborted by shutdown")]
    MergeAborted,

    /// A bucket file's contents do not match its name, or a read failed
    /// to parse. Fatal; the node cannot safely advance.
    #[error("bucket corrupt: {0}")]
    BucketCorrupt(String),

    /// INIT or META observed on input to a merge whose effective
    /// protocol predates them.
    #[error("protocol violation: {0}")]
    ProtocolViolation(String),

    /// A bucket referenced by hash has no file on disk.
    #[error("bucket not found: {0}")]
    NotFound(String),

    /// A FutureBucket operation was invoked in the wrong state.
    #[error("future bucket in unexpected state: {0}")]
    FutureState(String),

    /// Failure encoding an entry to XDR.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Underlying disk failure, after bounded retries.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}
