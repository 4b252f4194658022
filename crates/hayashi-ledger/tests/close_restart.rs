//! Ledger-close integration: header chains across a stop and restart
//! must match an uninterrupted control run.

use stellar_xdr::curr::{
    AccountEntry, AccountEntryExt, AccountId, Hash, LedgerEntry, LedgerEntryData, LedgerEntryExt,
    LedgerHeader, LedgerHeaderExt, PublicKey, SequenceNumber, String32, StellarValue,
    StellarValueExt, Thresholds, TimePoint, Uint256, VecM,
};

use hayashi_bucket::BucketManager;
use hayashi_common::Hash256;
use hayashi_ledger::{CloseBatch, LedgerCloseData, LedgerCloser};

const PROTOCOL: u32 = 11;

fn account(bytes: [u8; 32], balance: i64) -> LedgerEntry {
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

fn genesis() -> LedgerHeader {
    LedgerHeader {
        ledger_version: PROTOCOL,
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

fn close_data(seq: u32) -> LedgerCloseData {
    LedgerCloseData {
        ledger_seq: seq,
        protocol: PROTOCOL,
        close_time: u64::from(seq) * 5,
        batch: CloseBatch {
            init: vec![account([seq as u8; 32], i64::from(seq))],
            live: vec![],
            dead: vec![],
        },
    }
}

#[test]
fn test_header_chain_survives_restart() {
    let stop_at: u32 = 38;
    let end: u32 = 60;

    // Control run straight through.
    let control_dir = tempfile::tempdir().unwrap();
    let manager = BucketManager::new(control_dir.path().join("buckets")).unwrap();
    let mut control = LedgerCloser::new(manager, genesis()).unwrap();
    let mut control_hashes = Vec::new();
    for seq in 1..=end {
        control.close_ledger(close_data(seq)).unwrap();
        control_hashes.push(control.last_closed_hash());
    }

    // Interrupted run: stop mid-way, persist the level state and the
    // last closed header, restart, continue.
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("buckets");
    let manager = BucketManager::new(&path).unwrap();
    let mut closer = LedgerCloser::new(manager, genesis()).unwrap();
    let mut hashes = Vec::new();
    for seq in 1..=stop_at {
        closer.close_ledger(close_data(seq)).unwrap();
        hashes.push(closer.last_closed_hash());
    }

    let saved_header = closer.last_closed_header().clone();
    let captured = closer.manager().capture_levels();
    let mut manager = closer.into_manager();
    manager.shutdown();
    drop(manager);

    let mut manager = BucketManager::new(&path).unwrap();
    manager.assume_state(&captured, stop_at, PROTOCOL).unwrap();
    let mut closer = LedgerCloser::new(manager, saved_header).unwrap();
    for seq in stop_at + 1..=end {
        closer.close_ledger(close_data(seq)).unwrap();
        hashes.push(closer.last_closed_hash());
    }

    assert_eq!(hashes, control_hashes);
    assert_eq!(
        Hash256::from(
            closer
                .last_closed_header()
                .bucket_list_hash
                .clone()
        ),
        closer.manager().bucket_list().hash()
    );
}
