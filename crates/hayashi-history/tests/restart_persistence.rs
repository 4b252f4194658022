//! Archive-state persistence tests: the serialize/deserialize round
//! trip, and restart equivalence for a node stopped mid-merge.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use stellar_xdr::curr::{
    AccountEntry, AccountEntryExt, AccountId, LedgerEntry, LedgerEntryData, LedgerEntryExt,
    PublicKey, SequenceNumber, String32, Thresholds, Uint256, VecM,
};

use hayashi_bucket::{BucketManager, FIRST_PROTOCOL_SUPPORTING_INITENTRY_AND_METAENTRY};
use hayashi_common::Hash256;
use hayashi_history::HistoryArchiveState;

const PROTOCOL: u32 = FIRST_PROTOCOL_SUPPORTING_INITENTRY_AND_METAENTRY;

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

fn random_account(rng: &mut StdRng) -> LedgerEntry {
    let mut bytes = [0u8; 32];
    rng.fill(&mut bytes[..]);
    account(bytes, rng.gen_range(1..1_000_000))
}

#[test]
fn test_round_trip_through_json_continues_identically() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("buckets");
    let mut rng = StdRng::seed_from_u64(11);
    let batches: Vec<LedgerEntry> = (0..41).map(|_| random_account(&mut rng)).collect();

    let mut manager = BucketManager::new(&path).unwrap();
    for seq in 1..=40u32 {
        manager
            .add_batch(seq, PROTOCOL, vec![batches[seq as usize].clone()], vec![], vec![])
            .unwrap();
    }

    // Serialize all the way to JSON and back, as a real shutdown would.
    let state = HistoryArchiveState::capture(&manager);
    let json = state.to_json().unwrap();
    manager.shutdown();
    drop(manager);

    let reloaded = HistoryArchiveState::from_json(&json).unwrap();
    assert_eq!(reloaded.current_ledger, 40);

    let mut restarted = BucketManager::new(&path).unwrap();
    reloaded.assume(&mut restarted, PROTOCOL).unwrap();

    // An uninterrupted control over the same schedule.
    let control_dir = tempfile::tempdir().unwrap();
    let mut control = BucketManager::new(control_dir.path().join("buckets")).unwrap();
    for seq in 1..=40u32 {
        control
            .add_batch(seq, PROTOCOL, vec![batches[seq as usize].clone()], vec![], vec![])
            .unwrap();
    }
    assert_eq!(restarted.bucket_list().hash(), control.bucket_list().hash());

    // The next ledger lands bit-identically on both.
    let next = account([0xaau8; 32], 7);
    restarted
        .add_batch(41, PROTOCOL, vec![next.clone()], vec![], vec![])
        .unwrap();
    control
        .add_batch(41, PROTOCOL, vec![next], vec![], vec![])
        .unwrap();
    assert_eq!(restarted.bucket_list().hash(), control.bucket_list().hash());
}

/// A key injected early and again right before the pause makes the
/// interrupted merge sensitive to shadow reconstruction: the restarted
/// merge must rebuild the same shadow set from the recipe or its output
/// hash diverges.
#[test]
fn test_pause_mid_merge_with_shadowed_entry() {
    let pause: u32 = 65;
    let end: u32 = 100;
    let mut rng = StdRng::seed_from_u64(65);

    let mut batches: Vec<Vec<LedgerEntry>> =
        (0..=end).map(|_| vec![random_account(&mut rng)]).collect();
    let alice = account([0x5au8; 32], 1);
    batches[2].push(alice.clone());
    batches[pause as usize - 2].push(account([0x5au8; 32], 2));

    let run = |path: &std::path::Path, upto: u32| -> BucketManager {
        let mut manager = BucketManager::new(path).unwrap();
        for seq in 1..=upto {
            let (init, live) = if seq == 1 {
                (batches[1].clone(), vec![])
            } else {
                // Only brand-new keys go in as creations; the repeated
                // key re-enters as a live update.
                let batch = &batches[seq as usize];
                let (mut init, mut live) = (vec![], vec![]);
                for entry in batch {
                    if seq == pause - 2
                        && matches!(&entry.data, LedgerEntryData::Account(a)
                            if a.account_id == AccountId(PublicKey::PublicKeyTypeEd25519(Uint256([0x5au8; 32]))))
                    {
                        live.push(entry.clone());
                    } else {
                        init.push(entry.clone());
                    }
                }
                (init, live)
            };
            manager.add_batch(seq, PROTOCOL, init, live, vec![]).unwrap();
        }
        manager
    };

    // Control: straight through to the end.
    let control_dir = tempfile::tempdir().unwrap();
    let mut control = run(&control_dir.path().join("buckets"), end);

    // Test: stop at the pause point with merges in flight.
    let test_dir = tempfile::tempdir().unwrap();
    let test_path = test_dir.path().join("buckets");
    let mut manager = run(&test_path, pause);

    let state = HistoryArchiveState::capture(&manager);
    assert!(
        !state.futures_all_resolved(),
        "expected an in-flight merge at the pause point"
    );
    let json = state.to_json().unwrap();
    manager.shutdown();
    drop(manager);

    let mut restarted = BucketManager::new(&test_path).unwrap();
    HistoryArchiveState::from_json(&json)
        .unwrap()
        .assume(&mut restarted, PROTOCOL)
        .unwrap();

    for seq in pause + 1..=end {
        restarted
            .add_batch(seq, PROTOCOL, batches[seq as usize].clone(), vec![], vec![])
            .unwrap();
    }

    control.resolve_all_merges().unwrap();
    restarted.resolve_all_merges().unwrap();
    assert_eq!(restarted.bucket_list().hash(), control.bucket_list().hash());
}

#[test]
fn test_assume_fails_when_bucket_files_missing() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("buckets");
    let mut manager = BucketManager::new(&path).unwrap();
    for seq in 1..=10u32 {
        manager
            .add_batch(seq, PROTOCOL, vec![account([seq as u8; 32], 1)], vec![], vec![])
            .unwrap();
    }
    manager.resolve_all_merges().unwrap();
    let state = HistoryArchiveState::capture(&manager);
    manager.shutdown();
    drop(manager);

    // Delete one referenced bucket file out from under the state.
    let victim = state
        .referenced_bucket_hashes()
        .into_iter()
        .next()
        .expect("state references at least one bucket");
    std::fs::remove_file(path.join(format!("bucket-{}.xdr", victim.to_hex()))).unwrap();

    let mut restarted = BucketManager::new(&path).unwrap();
    let err = state.assume(&mut restarted, PROTOCOL).unwrap_err();
    assert!(matches!(
        err,
        hayashi_history::HistoryError::Bucket(_)
    ));
}

#[test]
fn test_capture_references_only_existing_files() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("buckets");
    let mut manager = BucketManager::new(&path).unwrap();
    for seq in 1..=50u32 {
        manager
            .add_batch(seq, PROTOCOL, vec![account([seq as u8; 32], 1)], vec![], vec![])
            .unwrap();
    }
    let state = HistoryArchiveState::capture(&manager);
    for hash in state.referenced_bucket_hashes() {
        assert_ne!(hash, Hash256::ZERO);
        assert!(
            path.join(format!("bucket-{}.xdr", hash.to_hex())).exists(),
            "referenced bucket {hash} missing on disk"
        );
    }
}
