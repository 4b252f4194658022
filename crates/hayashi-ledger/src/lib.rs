//! Ledger headers and the ledger-close adapter for the hayashi node.
//!
//! Consensus decides what to apply; the transaction layer computes the
//! per-ledger entry batch; this crate carries the batch into the bucket
//! storage engine and produces each new ledger header with its
//! bucket-list hash and skip list.

mod close;
mod error;
mod header;

pub use close::{BatchSource, CloseBatch, LedgerCloseData, LedgerCloser};
pub use error::LedgerError;
pub use header::{compute_header_hash, next_header};

/// Result alias for ledger operations.
pub type Result<T> = std::result::Result<T, LedgerError>;

#[cfg(test)]
pub(crate) mod test_fixtures {
    use stellar_xdr::curr::{
        AccountEntry, AccountEntryExt, AccountId, Hash, LedgerEntry, LedgerEntryData,
        LedgerEntryExt, LedgerHeader, LedgerHeaderExt, PublicKey, SequenceNumber, String32,
        StellarValue, StellarValueExt, Thresholds, TimePoint, Uint256, VecM,
    };

    pub fn account_entry(bytes: [u8; 32], balance: i64) -> LedgerEntry {
        LedgerEntry {
            last_modified_ledger_seq: 1,
            data: LedgerEntryData::Account(AccountEntry {
                account_id: AccountId(PublicKey::PublicKeyTypeEd25519(Uint256(bytes))),
                balance,
                seq_num: SequenceNumber(1),
                num_sub_entries: 0,
                inflation_dest: None,
                flags: 0,
                home_domain: String32::default(),
                thresholds: Thresholds([1, 0, 0, 0]),
                signers: VecM::default(),
                ext: AccountEntryExt::V0,
            }),
            ext: LedgerEntryExt::V0,
        }
    }

    pub fn genesis_header(protocol: u32) -> LedgerHeader {
        LedgerHeader {
            ledger_version: protocol,
            previous_ledger_hash: Hash([0u8; 32]),
            scp_value: StellarValue {
                tx_set_hash: Hash([0u8; 32]),
                close_time: TimePoint(0),
                upgrades: VecM::default(),
                ext: StellarValueExt::Basic,
            },
            tx_set_result_hash: Hash([0u8; 32]),
            bucket_list_hash: Hash([0u8; 32]),
            ledger_seq: 0,
            total_coins: 1_000_000_000,
            fee_pool: 0,
            inflation_seq: 0,
            id_pool: 0,
            base_fee: 100,
            base_reserve: 100_000_000,
            max_tx_set_size: 100,
            skip_list: std::array::from_fn(|_| Hash([0u8; 32])),
            ext: LedgerHeaderExt::V0,
        }
    }
}
