//! Shared harness: a vault over an isolated test environment whose blob
//! store and reference table can be told to fail.

#![allow(dead_code)]

use std::io::{self, Read};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use vault_cas::{BlobLocation, BlobStore, CasError, Fingerprint, FsBlobStore, StagedBlob, StoredBlob};
use vault_config::testing::TestEnvironment;
use vault_core::{Vault, VaultOptions};
use vault_ledger::{
    FileReference, LedgerError, LmdbReferences, MetaStore, NewReference, OwnerId, ReferenceId,
    ReferenceTable,
};

/// Filesystem blob store with counters and switches
pub struct FaultyBlobs {
    inner: FsBlobStore,
    pub stores: AtomicUsize,
    pub erases: AtomicUsize,
    pub fail_store: AtomicBool,
    pub fail_erase: AtomicBool,
    /// Simulate a crash in the middle of reclaiming content
    pub panic_on_erase: AtomicBool,
}

impl FaultyBlobs {
    pub fn new(inner: FsBlobStore) -> Self {
        Self {
            inner,
            stores: AtomicUsize::new(0),
            erases: AtomicUsize::new(0),
            fail_store: AtomicBool::new(false),
            fail_erase: AtomicBool::new(false),
            panic_on_erase: AtomicBool::new(false),
        }
    }

    pub fn inner(&self) -> &FsBlobStore {
        &self.inner
    }

    pub fn store_count(&self) -> usize {
        self.stores.load(Ordering::SeqCst)
    }

    pub fn blob_count(&self) -> usize {
        self.inner.list().unwrap().len()
    }
}

impl BlobStore for FaultyBlobs {
    fn location(&self, fingerprint: &Fingerprint) -> BlobLocation {
        self.inner.location(fingerprint)
    }

    fn stage(&self, reader: &mut dyn Read, limit: Option<u64>) -> vault_cas::Result<StagedBlob> {
        self.inner.stage(reader, limit)
    }

    fn store(&self, location: &BlobLocation, staged: StagedBlob) -> vault_cas::Result<()> {
        if self.fail_store.load(Ordering::SeqCst) {
            return Err(CasError::Io(io::Error::other("disk full")));
        }
        self.stores.fetch_add(1, Ordering::SeqCst);
        self.inner.store(location, staged)
    }

    fn fetch(&self, location: &BlobLocation) -> vault_cas::Result<Vec<u8>> {
        self.inner.fetch(location)
    }

    fn open(&self, location: &BlobLocation) -> vault_cas::Result<Box<dyn Read + Send>> {
        self.inner.open(location)
    }

    fn erase(&self, location: &BlobLocation) -> vault_cas::Result<()> {
        if self.panic_on_erase.load(Ordering::SeqCst) {
            panic!("simulated crash before erase");
        }
        if self.fail_erase.load(Ordering::SeqCst) {
            return Err(CasError::Io(io::Error::other("erase refused")));
        }
        self.erases.fetch_add(1, Ordering::SeqCst);
        self.inner.erase(location)
    }

    fn exists(&self, location: &BlobLocation) -> bool {
        self.inner.exists(location)
    }

    fn list(&self) -> vault_cas::Result<Vec<StoredBlob>> {
        self.inner.list()
    }
}

/// LMDB reference table whose writes can be made to fail
pub struct FaultyReferences {
    inner: LmdbReferences,
    pub fail_insert: AtomicBool,
}

impl FaultyReferences {
    pub fn new(inner: LmdbReferences) -> Self {
        Self {
            inner,
            fail_insert: AtomicBool::new(false),
        }
    }

    fn injected() -> LedgerError {
        LedgerError::Io(io::Error::other("injected reference table failure"))
    }
}

impl ReferenceTable for FaultyReferences {
    fn insert(&self, new: NewReference) -> vault_ledger::Result<FileReference> {
        if self.fail_insert.load(Ordering::SeqCst) {
            return Err(Self::injected());
        }
        self.inner.insert(new)
    }

    fn get(&self, id: ReferenceId) -> vault_ledger::Result<Option<FileReference>> {
        self.inner.get(id)
    }

    fn remove(&self, id: ReferenceId) -> vault_ledger::Result<Option<FileReference>> {
        self.inner.remove(id)
    }

    fn list_by_owner(&self, owner: &OwnerId) -> vault_ledger::Result<Vec<FileReference>> {
        self.inner.list_by_owner(owner)
    }

    fn owner_references_content(
        &self,
        owner: &OwnerId,
        content: &Fingerprint,
    ) -> vault_ledger::Result<bool> {
        self.inner.owner_references_content(owner, content)
    }

    fn count_for_content(&self, content: &Fingerprint) -> vault_ledger::Result<u64> {
        self.inner.count_for_content(content)
    }

    fn record_download(&self, id: ReferenceId) -> vault_ledger::Result<Option<FileReference>> {
        self.inner.record_download(id)
    }

    fn set_public(
        &self,
        id: ReferenceId,
        public: bool,
    ) -> vault_ledger::Result<Option<FileReference>> {
        self.inner.set_public(id, public)
    }

    fn all(&self) -> vault_ledger::Result<Vec<FileReference>> {
        self.inner.all()
    }
}

pub struct Harness {
    pub env: TestEnvironment,
    pub store: Arc<MetaStore>,
    pub blobs: Arc<FaultyBlobs>,
    pub references: Arc<FaultyReferences>,
    pub vault: Vault,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_options(VaultOptions::default())
    }

    pub fn with_options(options: VaultOptions) -> Self {
        let env = TestEnvironment::new().unwrap();
        let config = env.config();
        let store = Arc::new(
            MetaStore::open_with_map_size(config.storage.ledger_path(), config.storage.map_size)
                .unwrap(),
        );
        let blobs = Arc::new(FaultyBlobs::new(
            FsBlobStore::new(config.storage.root_path()).unwrap(),
        ));
        let references = Arc::new(FaultyReferences::new(LmdbReferences::new(Arc::clone(
            &store,
        ))));
        let vault = Vault::from_parts(
            Arc::clone(&store),
            blobs.clone(),
            references.clone(),
            options,
        );
        Self {
            env,
            store,
            blobs,
            references,
            vault,
        }
    }

    /// Number of references bound to each live record must match its count,
    /// and every live record must have its bytes.
    pub fn assert_consistent(&self) {
        for record in self.vault.ledger().records().unwrap() {
            assert!(record.is_live(), "zero-count row left for {}", record.fingerprint);
            let bound = self
                .references
                .count_for_content(&record.fingerprint)
                .unwrap();
            assert_eq!(
                record.reference_count, bound,
                "count mismatch for {}",
                record.fingerprint
            );
            assert!(
                self.blobs.exists(&record.location),
                "missing bytes for {}",
                record.fingerprint
            );
        }
        assert_eq!(
            self.blobs.blob_count(),
            self.vault.ledger().records().unwrap().len(),
            "blob count differs from record count"
        );
    }
}

pub fn owner(name: &str) -> OwnerId {
    OwnerId::new(name).unwrap()
}

pub fn no_grace() -> VaultOptions {
    VaultOptions {
        grace: std::time::Duration::ZERO,
        ..Default::default()
    }
}
