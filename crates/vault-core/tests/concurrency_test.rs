//! Concurrent uploads and deletes against one vault.

mod common;

use std::sync::Barrier;
use std::thread;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use common::{owner, Harness};
use vault_core::{ReferenceId, VaultError, VaultOptions};
use vault_ledger::OwnerId;

const THREADS: usize = 16;

#[test]
fn test_concurrent_identical_uploads_from_many_owners() {
    let h = Harness::new();
    let data = vec![0x5Au8; 64 * 1024];
    let barrier = Barrier::new(THREADS);

    let receipts: Vec<_> = thread::scope(|s| {
        let handles: Vec<_> = (0..THREADS)
            .map(|i| {
                let vault = &h.vault;
                let barrier = &barrier;
                let data = &data;
                s.spawn(move || {
                    let who = owner(&format!("user-{i}"));
                    barrier.wait();
                    vault.create_reference(&who, "same.bin", &data[..], None)
                })
            })
            .collect();
        handles.into_iter().map(|handle| handle.join().unwrap()).collect()
    });

    let receipts: Vec<_> = receipts.into_iter().map(Result::unwrap).collect();
    let created = receipts.iter().filter(|r| !r.deduplicated).count();
    assert_eq!(created, 1);

    let record = h.vault.ledger().get(&receipts[0].fingerprint).unwrap().unwrap();
    assert_eq!(record.reference_count, THREADS as u64);
    assert_eq!(h.blobs.store_count(), 1);
    assert_eq!(h.blobs.blob_count(), 1);
    h.assert_consistent();
}

#[test]
fn test_concurrent_identical_uploads_from_one_owner() {
    let h = Harness::new();
    let alice = owner("alice");
    let barrier = Barrier::new(THREADS);

    thread::scope(|s| {
        for i in 0..THREADS {
            let (vault, barrier, alice) = (&h.vault, &barrier, &alice);
            s.spawn(move || {
                barrier.wait();
                vault
                    .create_reference(alice, &format!("copy-{i}.txt"), &b"one and the same"[..], None)
                    .unwrap();
            });
        }
    });

    let records = h.vault.ledger().records().unwrap();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].reference_count, THREADS as u64);
    assert_eq!(h.vault.current_usage(&alice).unwrap(), 16);
    h.assert_consistent();
}

#[test]
fn test_concurrent_upload_and_delete_of_same_content() {
    let h = Harness::new();
    let alice = owner("alice");
    let data = b"contended content".to_vec();
    let seed: Vec<ReferenceId> = (0..THREADS)
        .map(|i| {
            h.vault
                .create_reference(&alice, &format!("seed-{i}"), &data[..], None)
                .unwrap()
                .reference_id
        })
        .collect();
    let barrier = Barrier::new(THREADS * 2);

    thread::scope(|s| {
        for id in &seed {
            let (vault, barrier, alice) = (&h.vault, &barrier, &alice);
            s.spawn(move || {
                barrier.wait();
                vault.delete_reference(*id, alice).unwrap();
            });
        }
        for i in 0..THREADS {
            let (vault, barrier, alice, data) = (&h.vault, &barrier, &alice, &data);
            s.spawn(move || {
                barrier.wait();
                vault
                    .create_reference(alice, &format!("new-{i}"), &data[..], None)
                    .unwrap();
            });
        }
    });

    let records = h.vault.ledger().records().unwrap();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].reference_count, THREADS as u64);
    h.assert_consistent();
}

#[test]
fn test_strict_quota_holds_under_concurrent_uploads() {
    let h = Harness::with_options(VaultOptions {
        default_ceiling: 250,
        strict_quota: true,
        ..Default::default()
    });
    let alice = owner("alice");
    let barrier = Barrier::new(THREADS);

    let results: Vec<_> = thread::scope(|s| {
        let handles: Vec<_> = (0..THREADS)
            .map(|i| {
                let (vault, barrier, alice) = (&h.vault, &barrier, &alice);
                s.spawn(move || {
                    // Distinct content per thread
                    let data = vec![b'a' + i as u8; 100];
                    barrier.wait();
                    vault.create_reference(alice, &format!("f{i}.txt"), &data[..], None)
                })
            })
            .collect();
        handles.into_iter().map(|handle| handle.join().unwrap()).collect()
    });

    let accepted = results.iter().filter(|r| r.is_ok()).count();
    assert_eq!(accepted, 2);
    assert!(results
        .iter()
        .filter_map(|r| r.as_ref().err())
        .all(|e| matches!(e, VaultError::QuotaExceeded { .. })));
    assert_eq!(h.vault.current_usage(&alice).unwrap(), 200);
    h.assert_consistent();
}

/// Random interleavings of uploads and deletes across a few owners and
/// a small pool of contents. Counts must match bindings after every round.
#[test]
fn test_counts_match_references_after_random_workload() {
    let h = Harness::with_options(VaultOptions {
        default_ceiling: u64::MAX,
        ..Default::default()
    });
    let owners: Vec<OwnerId> = ["alice", "bob", "carol"].into_iter().map(owner).collect();
    let contents: Vec<Vec<u8>> = (0..5u8).map(|i| vec![b'A' + i; 10 + i as usize]).collect();

    for round in 0..4u64 {
        thread::scope(|s| {
            for (t, who) in owners.iter().enumerate() {
                let (vault, contents) = (&h.vault, &contents);
                s.spawn(move || {
                    let mut rng = StdRng::seed_from_u64(round * 31 + t as u64);
                    let mut held: Vec<ReferenceId> = Vec::new();
                    for step in 0..40 {
                        if held.is_empty() || rng.gen_bool(0.6) {
                            let data = &contents[rng.gen_range(0..contents.len())];
                            let receipt = vault
                                .create_reference(who, &format!("r{round}-{step}"), &data[..], None)
                                .unwrap();
                            held.push(receipt.reference_id);
                        } else {
                            let id = held.swap_remove(rng.gen_range(0..held.len()));
                            vault.delete_reference(id, who).unwrap();
                        }
                    }
                });
            }
        });
        h.assert_consistent();
    }

    // Drain everything and the store is empty
    for who in &owners {
        for listing in h
            .vault
            .list_references(who, &Default::default())
            .unwrap()
        {
            h.vault.delete_reference(listing.reference.id, who).unwrap();
        }
    }
    assert!(h.vault.ledger().records().unwrap().is_empty());
    assert_eq!(h.blobs.blob_count(), 0);
}
