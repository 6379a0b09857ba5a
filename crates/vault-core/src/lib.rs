//! # vault-core
//!
//! Deduplicating, reference-counted file storage shared by many owners.
//!
//! Identical bytes are stored once no matter how many owners upload them.
//! Each upload becomes a [`FileReference`] bound to a content record; the
//! record counts its references and its bytes are erased when the last one
//! goes. Owners are charged quota on the distinct content they reference.
//!
//! ```text
//! upload ─▶ stage+hash ─▶ media check ─▶ quota ─▶ ledger resolve ─▶ reference insert
//! delete ─▶ reference remove ─▶ ledger release ─▶ (last one) blob erase
//! ```
//!
//! [`Vault`] wires the pieces together from a [`vault_config::Config`];
//! [`Vault::from_parts`] accepts injected backends.

pub mod error;
pub mod media;
pub mod quota;
pub mod reconcile;
pub mod references;
pub mod stats;

use std::io::Read;
use std::sync::Arc;
use std::time::Duration;

use vault_cas::{BlobStore, FsBlobStore};
use vault_config::Config;
use vault_ledger::{ContentLedger, LmdbReferences, MetaStore, ReferenceTable};

pub use error::{Result, StorageFault, VaultError};
pub use quota::{OwnerStats, QuotaGuard};
pub use reconcile::{CountRepair, ReconcileOptions, ReconcileReport, Reconciler};
pub use references::{
    ContentStream, FileListing, ReferenceFilter, ReferenceManager, UploadPolicy, UploadReceipt,
};
pub use stats::Savings;
pub use vault_cas::Fingerprint;
pub use vault_ledger::{ContentRecord, FileReference, OwnerId, ReferenceId};

/// Tunables for a [`Vault`]
#[derive(Debug, Clone, Copy)]
pub struct VaultOptions {
    pub default_ceiling: u64,
    pub strict_quota: bool,
    pub upload: UploadPolicy,
    pub grace: Duration,
}

impl Default for VaultOptions {
    fn default() -> Self {
        Self {
            default_ceiling: 10 * 1024 * 1024,
            strict_quota: true,
            upload: UploadPolicy::default(),
            grace: Duration::from_secs(3600),
        }
    }
}

impl From<&Config> for VaultOptions {
    fn from(config: &Config) -> Self {
        Self {
            default_ceiling: config.quota.default_ceiling,
            strict_quota: config.quota.strict,
            upload: UploadPolicy {
                max_file_size: config.upload.max_file_size,
                verify_media_type: config.upload.verify_media_type,
            },
            grace: Duration::from_secs(config.reconcile.grace_period_secs),
        }
    }
}

pub struct Vault {
    store: Arc<MetaStore>,
    ledger: Arc<ContentLedger>,
    references: Arc<dyn ReferenceTable>,
    quota: Arc<QuotaGuard>,
    manager: ReferenceManager,
    options: VaultOptions,
}

impl Vault {
    /// Open (creating if needed) the vault described by `config`.
    pub fn open(config: &Config) -> Result<Self> {
        let blobs: Arc<dyn BlobStore> = Arc::new(FsBlobStore::new(config.storage.root_path())?);
        let store = Arc::new(MetaStore::open_with_map_size(
            config.storage.ledger_path(),
            config.storage.map_size,
        )?);
        let references: Arc<dyn ReferenceTable> = Arc::new(LmdbReferences::new(Arc::clone(&store)));
        Ok(Self::from_parts(
            store,
            blobs,
            references,
            VaultOptions::from(config),
        ))
    }

    /// Assemble a vault from explicit backends.
    pub fn from_parts(
        store: Arc<MetaStore>,
        blobs: Arc<dyn BlobStore>,
        references: Arc<dyn ReferenceTable>,
        options: VaultOptions,
    ) -> Self {
        let ledger = Arc::new(ContentLedger::new(Arc::clone(&store), blobs));
        let quota = Arc::new(QuotaGuard::new(
            Arc::clone(&store),
            Arc::clone(&ledger),
            Arc::clone(&references),
            options.default_ceiling,
            options.strict_quota,
        ));
        let manager = ReferenceManager::new(
            Arc::clone(&ledger),
            Arc::clone(&references),
            Arc::clone(&quota),
            options.upload,
        );
        Self {
            store,
            ledger,
            references,
            quota,
            manager,
            options,
        }
    }

    pub fn options(&self) -> &VaultOptions {
        &self.options
    }

    pub fn ledger(&self) -> &Arc<ContentLedger> {
        &self.ledger
    }

    pub fn references(&self) -> &Arc<dyn ReferenceTable> {
        &self.references
    }

    pub fn quota(&self) -> &Arc<QuotaGuard> {
        &self.quota
    }

    pub fn create_reference<R: Read>(
        &self,
        owner: &OwnerId,
        display_name: &str,
        reader: R,
        declared_media_type: Option<&str>,
    ) -> Result<UploadReceipt> {
        self.manager
            .create_reference(owner, display_name, reader, declared_media_type)
    }

    pub fn delete_reference(&self, id: ReferenceId, owner: &OwnerId) -> Result<()> {
        self.manager.delete_reference(id, owner)
    }

    pub fn fetch_bytes_for(&self, id: ReferenceId, owner: &OwnerId) -> Result<ContentStream> {
        self.manager.fetch_bytes_for(id, owner)
    }

    pub fn fetch_public(&self, id: ReferenceId) -> Result<ContentStream> {
        self.manager.fetch_public(id)
    }

    pub fn set_public(&self, id: ReferenceId, owner: &OwnerId, public: bool) -> Result<FileReference> {
        self.manager.set_public(id, owner, public)
    }

    pub fn get_reference(&self, id: ReferenceId, owner: &OwnerId) -> Result<FileListing> {
        self.manager.get_reference(id, owner)
    }

    pub fn list_references(
        &self,
        owner: &OwnerId,
        filter: &ReferenceFilter,
    ) -> Result<Vec<FileListing>> {
        self.manager.list_references(owner, filter)
    }

    pub fn current_usage(&self, owner: &OwnerId) -> Result<u64> {
        self.quota.current_usage(owner)
    }

    pub fn would_exceed(&self, owner: &OwnerId, additional: u64) -> Result<bool> {
        self.quota.would_exceed(owner, additional)
    }

    pub fn owner_stats(&self, owner: &OwnerId) -> Result<OwnerStats> {
        self.quota.owner_stats(owner)
    }

    pub fn set_quota(&self, owner: &OwnerId, ceiling: Option<u64>) -> Result<()> {
        self.quota.set_ceiling(owner, ceiling)
    }

    pub fn system_wide_savings(&self) -> Result<Savings> {
        stats::system_wide_savings(&self.ledger, self.references.as_ref())
    }

    pub fn reconciler(&self) -> Reconciler {
        Reconciler::new(Arc::clone(&self.ledger), Arc::clone(&self.references))
    }

    /// One reconciliation pass with the configured grace period.
    pub fn reconcile(&self, dry_run: bool) -> Result<ReconcileReport> {
        self.reconciler().run(ReconcileOptions {
            dry_run,
            grace: self.options.grace,
        })
    }

    /// Flush the ledger to disk.
    pub fn sync(&self) -> Result<()> {
        self.store.sync()?;
        Ok(())
    }
}
