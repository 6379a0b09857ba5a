//! LMDB environment shared by the ledger tables.
//!
//! One environment holds every table so that a reference row and its
//! secondary index entries commit in the same write transaction.

use std::path::{Path, PathBuf};

use heed::types::{Bytes, SerdeBincode, Str, Unit};
use heed::{Database, Env, EnvOpenOptions};
use tracing::debug;

use crate::content::ContentRecord;
use crate::references::{FileReference, OwnerId};
use crate::Result;

/// Persistent metadata store
pub struct MetaStore {
    pub(crate) env: Env,
    path: PathBuf,

    /// Fingerprint → ContentRecord
    pub(crate) contents: Database<Bytes, SerdeBincode<ContentRecord>>,

    /// Reference id (big-endian) → FileReference
    pub(crate) references: Database<Bytes, SerdeBincode<FileReference>>,

    /// owner \0 id → ()
    pub(crate) owner_refs: Database<Bytes, Unit>,

    /// owner \0 fingerprint id → ()
    pub(crate) owner_content: Database<Bytes, Unit>,

    /// fingerprint id → ()
    pub(crate) content_refs: Database<Bytes, Unit>,

    /// Owner → quota ceiling override in bytes
    pub(crate) quotas: Database<Str, SerdeBincode<u64>>,

    /// Named monotonically increasing counters
    pub(crate) counters: Database<Str, SerdeBincode<u64>>,
}

impl MetaStore {
    /// Default LMDB map size: 1GB (expandable)
    pub const DEFAULT_MAP_SIZE: usize = 1024 * 1024 * 1024;

    /// Maximum readers
    const MAX_READERS: u32 = 126;

    const LOCK_DIR: &'static str = "locks";

    /// Open or create a store at `path` (a directory).
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        Self::open_with_map_size(path, Self::DEFAULT_MAP_SIZE)
    }

    pub fn open_with_map_size<P: AsRef<Path>>(path: P, map_size: usize) -> Result<Self> {
        let path = path.as_ref();
        std::fs::create_dir_all(path.join(Self::LOCK_DIR))?;

        let env = unsafe {
            EnvOpenOptions::new()
                .map_size(map_size)
                .max_readers(Self::MAX_READERS)
                .max_dbs(7)
                .open(path)?
        };

        let mut wtxn = env.write_txn()?;
        let contents = env.create_database(&mut wtxn, Some("contents"))?;
        let references = env.create_database(&mut wtxn, Some("references"))?;
        let owner_refs = env.create_database(&mut wtxn, Some("owner_refs"))?;
        let owner_content = env.create_database(&mut wtxn, Some("owner_content"))?;
        let content_refs = env.create_database(&mut wtxn, Some("content_refs"))?;
        let quotas = env.create_database(&mut wtxn, Some("quotas"))?;
        let counters = env.create_database(&mut wtxn, Some("counters"))?;
        wtxn.commit()?;

        debug!("Opened ledger at {:?}", path);

        Ok(Self {
            env,
            path: path.to_path_buf(),
            contents,
            references,
            owner_refs,
            owner_content,
            content_refs,
            quotas,
            counters,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Directory of the stripe lock files shared by every process that
    /// opens this store.
    pub fn lock_dir(&self) -> PathBuf {
        self.path.join(Self::LOCK_DIR)
    }

    /// Quota ceiling override for `owner`, if one was set.
    pub fn quota_ceiling(&self, owner: &OwnerId) -> Result<Option<u64>> {
        let rtxn = self.env.read_txn()?;
        Ok(self.quotas.get(&rtxn, owner.as_str())?)
    }

    pub fn set_quota_ceiling(&self, owner: &OwnerId, bytes: u64) -> Result<()> {
        let mut wtxn = self.env.write_txn()?;
        self.quotas.put(&mut wtxn, owner.as_str(), &bytes)?;
        wtxn.commit()?;
        Ok(())
    }

    /// Remove an override; the owner falls back to the default ceiling.
    pub fn clear_quota_ceiling(&self, owner: &OwnerId) -> Result<bool> {
        let mut wtxn = self.env.write_txn()?;
        let removed = self.quotas.delete(&mut wtxn, owner.as_str())?;
        wtxn.commit()?;
        Ok(removed)
    }

    /// Flush to disk
    pub fn sync(&self) -> Result<()> {
        self.env.force_sync()?;
        Ok(())
    }
}
