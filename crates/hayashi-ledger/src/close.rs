//! The ledger-close adapter.
//!
//! Per closed ledger, the transaction-processing layer hands over a
//! `(init, live, dead)` batch; this adapter pushes it into the bucket
//! list, then stamps the resulting bucket-list hash and skip list into
//! the new ledger header. Closes are strictly sequential: re-closing an
//! already-closed ledger (or skipping ahead) is rejected before any
//! state changes.

use stellar_xdr::curr::{LedgerEntry, LedgerHeader, LedgerKey};
use tracing::{debug, info};

use hayashi_bucket::BucketManager;
use hayashi_common::Hash256;

use crate::header::{compute_header_hash, next_header};
use crate::{LedgerError, Result};

/// One ledger's entry changes, as produced by the transaction layer.
///
/// Within a batch no key appears in more than one list, and init keys
/// are keys with no currently-live entry.
#[derive(Debug, Default, Clone)]
pub struct CloseBatch {
    pub init: Vec<LedgerEntry>,
    pub live: Vec<LedgerEntry>,
    pub dead: Vec<LedgerKey>,
}

/// Seam to the transaction-processing collaborator: yields the entry
/// batch for the ledger being closed.
pub trait BatchSource {
    fn take_batch(&mut self, ledger_seq: u32) -> CloseBatch;
}

/// Everything consensus hands us to close one ledger.
#[derive(Debug, Clone)]
pub struct LedgerCloseData {
    pub ledger_seq: u32,
    pub protocol: u32,
    pub close_time: u64,
    pub batch: CloseBatch,
}

/// Sequences ledger closes against a bucket manager.
pub struct LedgerCloser {
    manager: BucketManager,
    last_closed: LedgerHeader,
    last_closed_hash: Hash256,
}

impl LedgerCloser {
    /// Start from a last-closed header. The manager's bucket list must
    /// already describe that ledger's state (freshly created for a
    /// genesis header, or assumed from archive state).
    pub fn new(manager: BucketManager, last_closed: LedgerHeader) -> Result<Self> {
        let last_closed_hash = compute_header_hash(&last_closed)?;
        Ok(Self {
            manager,
            last_closed,
            last_closed_hash,
        })
    }

    pub fn last_closed_header(&self) -> &LedgerHeader {
        &self.last_closed
    }

    pub fn last_closed_hash(&self) -> Hash256 {
        self.last_closed_hash
    }

    pub fn manager(&self) -> &BucketManager {
        &self.manager
    }

    pub fn manager_mut(&mut self) -> &mut BucketManager {
        &mut self.manager
    }

    pub fn into_manager(self) -> BucketManager {
        self.manager
    }

    /// Close one ledger: apply the batch, then produce the new header
    /// carrying the bucket-list hash and skip list.
    ///
    /// Fails without advancing anything when `ledger_seq` is not
    /// exactly one past the last closed ledger; fails and discards the
    /// close when the batch is rejected by the bucket layer.
    pub fn close_ledger(&mut self, data: LedgerCloseData) -> Result<&LedgerHeader> {
        let expected = self.last_closed.ledger_seq + 1;
        if data.ledger_seq != expected {
            return Err(LedgerError::InvalidSequence {
                expected,
                actual: data.ledger_seq,
            });
        }

        debug!(
            ledger = data.ledger_seq,
            init = data.batch.init.len(),
            live = data.batch.live.len(),
            dead = data.batch.dead.len(),
            "closing ledger"
        );
        self.manager.add_batch(
            data.ledger_seq,
            data.protocol,
            data.batch.init,
            data.batch.live,
            data.batch.dead,
        )?;

        let mut header = next_header(&self.last_closed, self.last_closed_hash, data.close_time);
        header.ledger_version = data.protocol;
        self.manager.snapshot_ledger(&mut header);

        self.last_closed_hash = compute_header_hash(&header)?;
        self.last_closed = header;
        info!(
            ledger = data.ledger_seq,
            hash = %self.last_closed_hash,
            "ledger closed"
        );
        Ok(&self.last_closed)
    }
}
