//! Error types for archive-state handling.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum HistoryError {
    /// Malformed archive-state JSON.
    #[error("archive state JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Failure reading or writing the archive-state file.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// A bucket referenced by the archive state is missing or corrupt.
    #[error(transparent)]
    Bucket(#[from] hayashi_bucket::BucketError),
}
