//! Durable archive state for the hayashi bucket list.
//!
//! This crate carries the restart protocol: capturing the bucket list
//! (including in-flight merges) as JSON before shutdown, and assuming
//! it after startup so the node resumes to bit-identical state.

mod archive_state;
mod error;

pub use archive_state::{HistoryArchiveState, HISTORY_ARCHIVE_STATE_VERSION};
pub use error::HistoryError;
