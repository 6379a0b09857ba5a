//! End-to-end behaviour of uploads, deletes, downloads and quota.

mod common;

use std::io::Read;

use common::{owner, Harness};
use vault_core::{ReferenceFilter, VaultError, VaultOptions};

const MIB: u64 = 1024 * 1024;

#[test]
fn test_identical_bytes_from_two_owners_share_one_blob() {
    let h = Harness::new();
    let data = b"quarterly report, final version".to_vec();

    let a = h
        .vault
        .create_reference(&owner("alice"), "report.txt", &data[..], None)
        .unwrap();
    let b = h
        .vault
        .create_reference(&owner("bob"), "copy-of-report.txt", &data[..], None)
        .unwrap();

    assert_ne!(a.reference_id, b.reference_id);
    assert_eq!(a.fingerprint, b.fingerprint);
    assert!(!a.deduplicated);
    assert!(b.deduplicated);

    let record = h.vault.ledger().get(&a.fingerprint).unwrap().unwrap();
    assert_eq!(record.reference_count, 2);
    assert_eq!(h.blobs.store_count(), 1);
    assert_eq!(h.blobs.blob_count(), 1);
    h.assert_consistent();
}

#[test]
fn test_last_delete_reclaims_content() {
    let h = Harness::new();
    let alice = owner("alice");
    let bob = owner("bob");
    let data = b"shared bytes".to_vec();

    let a = h.vault.create_reference(&alice, "a.txt", &data[..], None).unwrap();
    let b = h.vault.create_reference(&bob, "b.txt", &data[..], None).unwrap();

    h.vault.delete_reference(a.reference_id, &alice).unwrap();
    let record = h.vault.ledger().get(&a.fingerprint).unwrap().unwrap();
    assert_eq!(record.reference_count, 1);
    let survivor = h
        .vault
        .fetch_bytes_for(b.reference_id, &bob)
        .unwrap()
        .into_bytes()
        .unwrap();
    assert_eq!(survivor, data);
    h.assert_consistent();

    h.vault.delete_reference(b.reference_id, &bob).unwrap();
    assert!(h.vault.ledger().get(&a.fingerprint).unwrap().is_none());
    assert!(h.vault.ledger().records().unwrap().is_empty());
    assert_eq!(h.blobs.blob_count(), 0);
}

#[test]
fn test_quota_charged_once_per_distinct_content() {
    let h = Harness::new();
    let alice = owner("alice");
    let bob = owner("bob");
    let data = vec![b'q'; 4096];

    let first = h.vault.create_reference(&alice, "1.txt", &data[..], None).unwrap();
    let second = h.vault.create_reference(&alice, "2.txt", &data[..], None).unwrap();
    let third = h.vault.create_reference(&alice, "3.txt", &data[..], None).unwrap();
    assert_eq!(first.charged, 4096);
    assert_eq!(second.charged, 0);
    assert_eq!(third.charged, 0);
    assert_eq!(h.vault.current_usage(&alice).unwrap(), 4096);

    let other = h.vault.create_reference(&bob, "mine.txt", &data[..], None).unwrap();
    assert_eq!(other.charged, 4096);
    assert_eq!(h.vault.current_usage(&bob).unwrap(), 4096);
    assert_eq!(h.vault.current_usage(&alice).unwrap(), 4096);
}

#[test]
fn test_owner_walkthrough_with_ten_mebibyte_file() {
    let h = Harness::with_options(VaultOptions {
        default_ceiling: 50 * MIB,
        ..Default::default()
    });
    let alice = owner("alice");
    let file = vec![b'x'; (10 * MIB) as usize];

    let first = h.vault.create_reference(&alice, "x.bin", &file[..], None).unwrap();
    assert_eq!(h.vault.current_usage(&alice).unwrap(), 10 * MIB);

    let second = h.vault.create_reference(&alice, "x-again.bin", &file[..], None).unwrap();
    assert_eq!(h.vault.current_usage(&alice).unwrap(), 10 * MIB);
    assert_eq!(
        h.vault
            .list_references(&alice, &ReferenceFilter::default())
            .unwrap()
            .len(),
        2
    );
    let record = h.vault.ledger().get(&first.fingerprint).unwrap().unwrap();
    assert_eq!(record.reference_count, 2);

    h.vault.delete_reference(first.reference_id, &alice).unwrap();
    assert_eq!(h.vault.current_usage(&alice).unwrap(), 10 * MIB);
    let record = h.vault.ledger().get(&first.fingerprint).unwrap().unwrap();
    assert_eq!(record.reference_count, 1);

    h.vault.delete_reference(second.reference_id, &alice).unwrap();
    assert_eq!(h.vault.current_usage(&alice).unwrap(), 0);
    assert!(h.vault.ledger().get(&first.fingerprint).unwrap().is_none());
    assert_eq!(h.blobs.blob_count(), 0);
}

#[test]
fn test_quota_rejection_writes_nothing() {
    let h = Harness::with_options(VaultOptions {
        default_ceiling: 100,
        ..Default::default()
    });
    let alice = owner("alice");

    h.vault.create_reference(&alice, "small.txt", &[b'a'; 80][..], None).unwrap();
    let err = h
        .vault
        .create_reference(&alice, "big.txt", &[b'b'; 21][..], None)
        .unwrap_err();
    match err {
        VaultError::QuotaExceeded {
            requested,
            usage,
            ceiling,
            ..
        } => {
            assert_eq!(requested, 21);
            assert_eq!(usage, 80);
            assert_eq!(ceiling, 100);
        }
        other => panic!("unexpected error: {other:?}"),
    }
    assert_eq!(h.blobs.store_count(), 1);
    assert_eq!(h.vault.ledger().records().unwrap().len(), 1);

    // Content the owner already holds is free at the ceiling
    let again = h
        .vault
        .create_reference(&alice, "small-copy.txt", &[b'a'; 80][..], None)
        .unwrap();
    assert_eq!(again.charged, 0);
}

#[test]
fn test_quota_override_raises_ceiling() {
    let h = Harness::with_options(VaultOptions {
        default_ceiling: 10,
        ..Default::default()
    });
    let alice = owner("alice");
    assert!(h
        .vault
        .create_reference(&alice, "f.txt", &[b'z'; 64][..], None)
        .is_err());

    h.vault.set_quota(&alice, Some(1000)).unwrap();
    h.vault.create_reference(&alice, "f.txt", &[b'z'; 64][..], None).unwrap();
    let stats = h.vault.owner_stats(&alice).unwrap();
    assert_eq!(stats.used, 64);
    assert_eq!(stats.ceiling, 1000);
    assert_eq!(stats.remaining, 936);
}

#[test]
fn test_media_type_mismatch_is_rejected_before_storing() {
    let h = Harness::new();
    let err = h
        .vault
        .create_reference(&owner("alice"), "cat.png", &b"not a png at all"[..], Some("image/png"))
        .unwrap_err();
    assert!(matches!(err, VaultError::ValidationFailed(_)));
    assert!(err.is_client_error());
    assert_eq!(h.blobs.store_count(), 0);
    assert!(h.vault.ledger().records().unwrap().is_empty());
}

#[test]
fn test_sniffed_media_type_recorded() {
    let h = Harness::new();
    let alice = owner("alice");
    let png = b"\x89PNG\r\n\x1a\n\0\0\0\rIHDR".to_vec();

    let receipt = h.vault.create_reference(&alice, "pic", &png[..], None).unwrap();
    assert_eq!(receipt.media_type, "image/png");

    let declared = h
        .vault
        .create_reference(&alice, "notes.csv", &b"a,b\n1,2\n"[..], Some("text/csv"))
        .unwrap();
    assert_eq!(declared.media_type, "text/csv");
}

#[test]
fn test_oversized_upload_is_a_validation_error() {
    let h = Harness::with_options(VaultOptions {
        upload: vault_core::UploadPolicy {
            max_file_size: 16,
            verify_media_type: true,
        },
        ..Default::default()
    });
    let err = h
        .vault
        .create_reference(&owner("alice"), "long.txt", &[b'l'; 17][..], None)
        .unwrap_err();
    assert!(matches!(err, VaultError::ValidationFailed(_)));
    assert_eq!(h.blobs.blob_count(), 0);
}

#[test]
fn test_invalid_display_name() {
    let h = Harness::new();
    for name in ["", "   ", "tab\tname"] {
        let err = h
            .vault
            .create_reference(&owner("alice"), name, &b"data"[..], None)
            .unwrap_err();
        assert!(matches!(err, VaultError::ValidationFailed(_)), "{name:?}");
    }
}

#[test]
fn test_not_found_and_forbidden() {
    let h = Harness::new();
    let alice = owner("alice");
    let mallory = owner("mallory");
    let receipt = h.vault.create_reference(&alice, "secret.txt", &b"s3cr3t"[..], None).unwrap();
    let id = receipt.reference_id;

    assert!(matches!(
        h.vault.fetch_bytes_for(id, &mallory),
        Err(VaultError::Forbidden(_))
    ));
    assert!(matches!(
        h.vault.delete_reference(id, &mallory),
        Err(VaultError::Forbidden(_))
    ));
    assert!(matches!(
        h.vault.set_public(id, &mallory, true),
        Err(VaultError::Forbidden(_))
    ));

    h.vault.delete_reference(id, &alice).unwrap();
    assert!(matches!(
        h.vault.delete_reference(id, &alice),
        Err(VaultError::NotFound(_))
    ));
    assert!(matches!(
        h.vault.fetch_bytes_for(id, &alice),
        Err(VaultError::NotFound(_))
    ));
}

#[test]
fn test_public_fetch_and_download_count() {
    let h = Harness::new();
    let alice = owner("alice");
    let receipt = h
        .vault
        .create_reference(&alice, "flyer.txt", &b"open day on friday"[..], None)
        .unwrap();
    let id = receipt.reference_id;

    assert!(matches!(
        h.vault.fetch_public(id),
        Err(VaultError::NotFound(_))
    ));

    let shared = h.vault.set_public(id, &alice, true).unwrap();
    assert!(shared.is_public);

    let mut body = String::new();
    let mut stream = h.vault.fetch_public(id).unwrap();
    assert_eq!(stream.byte_size(), 18);
    assert!(stream.media_type().starts_with("text/plain"));
    stream.read_to_string(&mut body).unwrap();
    assert_eq!(body, "open day on friday");

    h.vault.fetch_bytes_for(id, &alice).unwrap();
    let listing = h.vault.get_reference(id, &alice).unwrap();
    assert_eq!(listing.reference.download_count, 2);

    h.vault.set_public(id, &alice, false).unwrap();
    assert!(h.vault.fetch_public(id).is_err());
}

#[test]
fn test_list_references_filters_and_order() {
    let h = Harness::new();
    let alice = owner("alice");
    let png = b"\x89PNG\r\n\x1a\n\0\0\0\rIHDR".to_vec();

    let first = h.vault.create_reference(&alice, "Holiday.png", &png[..], None).unwrap();
    let second = h
        .vault
        .create_reference(&alice, "notes.txt", &[b'n'; 300][..], None)
        .unwrap();
    h.vault.create_reference(&owner("bob"), "bob.txt", &b"bob"[..], None).unwrap();

    let all = h.vault.list_references(&alice, &ReferenceFilter::default()).unwrap();
    assert_eq!(all.len(), 2);
    assert_eq!(all[0].reference.id, second.reference_id);
    assert_eq!(all[1].reference.id, first.reference_id);

    let images = h
        .vault
        .list_references(
            &alice,
            &ReferenceFilter {
                media_type_prefix: Some("image/".into()),
                ..Default::default()
            },
        )
        .unwrap();
    assert_eq!(images.len(), 1);
    assert_eq!(images[0].reference.display_name, "Holiday.png");

    let by_name = h
        .vault
        .list_references(
            &alice,
            &ReferenceFilter {
                name_contains: Some("holiday".into()),
                ..Default::default()
            },
        )
        .unwrap();
    assert_eq!(by_name.len(), 1);

    let large = h
        .vault
        .list_references(
            &alice,
            &ReferenceFilter {
                min_size: Some(100),
                ..Default::default()
            },
        )
        .unwrap();
    assert_eq!(large.len(), 1);
    assert_eq!(large[0].byte_size, 300);
}

#[test]
fn test_system_wide_savings() {
    let h = Harness::new();
    let data = vec![b'd'; 1000];
    for name in ["alice", "bob", "carol", "dave"] {
        h.vault.create_reference(&owner(name), "d.txt", &data[..], None).unwrap();
    }
    h.vault.create_reference(&owner("alice"), "e.txt", &[b'e'; 500][..], None).unwrap();

    let savings = h.vault.system_wide_savings().unwrap();
    assert_eq!(savings.logical_bytes, 4500);
    assert_eq!(savings.physical_bytes, 1500);
    assert_eq!(savings.saved(), 3000);
    assert_eq!(savings.reference_count, 5);
    assert_eq!(savings.content_count, 2);
}

#[test]
fn test_empty_file_is_content_like_any_other() {
    let h = Harness::new();
    let alice = owner("alice");
    let a = h.vault.create_reference(&alice, "empty", &b""[..], None).unwrap();
    let b = h.vault.create_reference(&alice, "empty2", &b""[..], None).unwrap();
    assert_eq!(a.byte_size, 0);
    assert!(b.deduplicated);
    assert!(h
        .vault
        .fetch_bytes_for(a.reference_id, &alice)
        .unwrap()
        .into_bytes()
        .unwrap()
        .is_empty());
    h.assert_consistent();
}

#[test]
fn test_listing_serializes_flat() {
    let h = Harness::new();
    let alice = owner("alice");
    let receipt = h.vault.create_reference(&alice, "doc.txt", &b"hello"[..], None).unwrap();

    let listing = h.vault.get_reference(receipt.reference_id, &alice).unwrap();
    let value = serde_json::to_value(&listing).unwrap();
    assert_eq!(value["id"], receipt.reference_id.get());
    assert_eq!(value["owner"], "alice");
    assert_eq!(value["display_name"], "doc.txt");
    assert_eq!(value["byte_size"], 5);
    assert_eq!(value["content"], receipt.fingerprint.to_hex());
}
