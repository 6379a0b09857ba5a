//! Failures part-way through an upload or delete.

mod common;

use std::io::{self, Read};
use std::sync::atomic::Ordering;

use common::{owner, Harness};
use vault_cas::BlobStore;
use vault_core::{StorageFault, VaultError};

#[test]
fn test_failed_reference_insert_removes_new_content() {
    let h = Harness::new();
    h.references.fail_insert.store(true, Ordering::SeqCst);

    let err = h
        .vault
        .create_reference(&owner("alice"), "doomed.txt", &b"never lands"[..], None)
        .unwrap_err();
    assert!(matches!(
        err,
        VaultError::StorageFault(StorageFault::Ledger(_))
    ));
    assert!(!err.is_client_error());

    assert!(h.vault.ledger().records().unwrap().is_empty());
    assert_eq!(h.blobs.blob_count(), 0);
    assert_eq!(h.vault.current_usage(&owner("alice")).unwrap(), 0);
}

#[test]
fn test_failed_reference_insert_restores_existing_count() {
    let h = Harness::new();
    let alice = owner("alice");
    let data = b"already here".to_vec();
    let first = h.vault.create_reference(&alice, "one.txt", &data[..], None).unwrap();
    h.vault.create_reference(&owner("bob"), "two.txt", &data[..], None).unwrap();

    h.references.fail_insert.store(true, Ordering::SeqCst);
    assert!(h
        .vault
        .create_reference(&owner("carol"), "three.txt", &data[..], None)
        .is_err());
    h.references.fail_insert.store(false, Ordering::SeqCst);

    let record = h.vault.ledger().get(&first.fingerprint).unwrap().unwrap();
    assert_eq!(record.reference_count, 2);
    assert_eq!(h.blobs.blob_count(), 1);
    h.assert_consistent();
}

#[test]
fn test_failed_blob_publish_leaves_nothing() {
    let h = Harness::new();
    h.blobs.fail_store.store(true, Ordering::SeqCst);

    let err = h
        .vault
        .create_reference(&owner("alice"), "f.txt", &b"bytes"[..], None)
        .unwrap_err();
    assert!(matches!(err, VaultError::StorageFault(_)));
    assert!(h.vault.ledger().records().unwrap().is_empty());
    assert!(h
        .vault
        .list_references(&owner("alice"), &Default::default())
        .unwrap()
        .is_empty());
}

/// Client that hangs up after `remaining` bytes
struct Disconnecting {
    remaining: usize,
}

impl Read for Disconnecting {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.remaining == 0 {
            return Err(io::Error::new(io::ErrorKind::ConnectionReset, "client went away"));
        }
        let n = buf.len().min(self.remaining);
        buf[..n].fill(0x42);
        self.remaining -= n;
        Ok(n)
    }
}

#[test]
fn test_interrupted_upload_stream_leaves_nothing() {
    let h = Harness::new();
    let alice = owner("alice");

    let err = h
        .vault
        .create_reference(&alice, "partial.bin", Disconnecting { remaining: 300_000 }, None)
        .unwrap_err();
    assert!(matches!(err, VaultError::StorageFault(_)));

    assert!(h.vault.ledger().records().unwrap().is_empty());
    assert!(h.vault.references().all().unwrap().is_empty());
    assert_eq!(h.blobs.store_count(), 0);
    assert_eq!(h.blobs.blob_count(), 0);
    let staging = std::fs::read_dir(h.blobs.inner().staging_dir()).unwrap().count();
    assert_eq!(staging, 0);
    assert_eq!(h.vault.current_usage(&alice).unwrap(), 0);

    // A later complete upload is unaffected
    h.vault
        .create_reference(&alice, "whole.bin", &[0x42u8; 1000][..], None)
        .unwrap();
    h.assert_consistent();
}

#[test]
fn test_delete_succeeds_when_blob_erase_fails() {
    let h = Harness::new();
    let alice = owner("alice");
    let receipt = h.vault.create_reference(&alice, "f.txt", &b"sticky"[..], None).unwrap();

    h.blobs.fail_erase.store(true, Ordering::SeqCst);
    h.vault.delete_reference(receipt.reference_id, &alice).unwrap();

    // Row gone, bytes left behind as an orphan
    assert!(h.vault.ledger().records().unwrap().is_empty());
    let location = h.blobs.location(&receipt.fingerprint);
    assert!(h.blobs.exists(&location));
    assert!(matches!(
        h.vault.fetch_bytes_for(receipt.reference_id, &alice),
        Err(VaultError::NotFound(_))
    ));
}

#[test]
fn test_crash_during_reclaim_leaves_zero_count_row() {
    let h = Harness::new();
    let alice = owner("alice");
    let receipt = h.vault.create_reference(&alice, "f.txt", &b"half gone"[..], None).unwrap();

    h.blobs.panic_on_erase.store(true, Ordering::SeqCst);
    let outcome = std::thread::scope(|s| {
        s.spawn(|| h.vault.delete_reference(receipt.reference_id, &alice))
            .join()
    });
    assert!(outcome.is_err());
    h.blobs.panic_on_erase.store(false, Ordering::SeqCst);

    // The reference is gone and the count committed at zero
    let rows = h.vault.ledger().records().unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].reference_count, 0);
    assert!(h.vault.ledger().get(&receipt.fingerprint).unwrap().is_none());

    // The poisoned stripe is usable and a new upload revives the row
    let again = h.vault.create_reference(&alice, "g.txt", &b"half gone"[..], None).unwrap();
    assert!(!again.deduplicated);
    let record = h.vault.ledger().get(&receipt.fingerprint).unwrap().unwrap();
    assert_eq!(record.reference_count, 1);
    h.assert_consistent();
}
