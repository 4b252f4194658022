//! Ledger header utilities.

use stellar_xdr::curr::LedgerHeader;

use hayashi_common::Hash256;

use crate::Result;

/// The canonical hash identifying a ledger: SHA-256 of the header's XDR
/// encoding.
pub fn compute_header_hash(header: &LedgerHeader) -> Result<Hash256> {
    Ok(Hash256::hash_xdr(header)?)
}

/// Build the header for the next ledger in the chain.
///
/// Chains `previous_ledger_hash`, advances the sequence number, and
/// carries the previous skip list forward; the bucket manager rewrites
/// the skip-list slots and `bucket_list_hash` when the ledger is
/// snapshotted.
pub fn next_header(prev: &LedgerHeader, prev_hash: Hash256, close_time: u64) -> LedgerHeader {
    let mut header = prev.clone();
    header.previous_ledger_hash = prev_hash.into();
    header.ledger_seq = prev.ledger_seq + 1;
    header.scp_value.close_time = stellar_xdr::curr::TimePoint(close_time);
    header
}
