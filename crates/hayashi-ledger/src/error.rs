//! Error types for ledger-close operations.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum LedgerError {
    /// A close was requested out of order. The ledger is not advanced.
    #[error("cannot close ledger {actual}, expected {expected}")]
    InvalidSequence { expected: u32, actual: u32 },

    /// The bucket layer rejected the batch or failed internally.
    #[error(transparent)]
    Bucket(#[from] hayashi_bucket::BucketError),

    /// Failure encoding a ledger header.
    #[error("XDR error: {0}")]
    Xdr(#[from] stellar_xdr::curr::Error),
}
