//! Reference-counted content records.
//!
//! Every distinct fingerprint has at most one row. Its `reference_count`
//! equals the number of file references pointing at it; the physical blob
//! exists while the count is positive.
//!
//! All mutations of one fingerprint run under that fingerprint's stripe of
//! a lock table backed by files in the store's lock directory, so ledgers in
//! other processes over the same store are excluded too. Callers that must
//! pair a ledger mutation with a reference mutation take a [`ContentLock`]
//! and keep it across both.
//!
//! Release is two-phase: the decrement to zero commits first, then the blob
//! is erased, then the row is deleted. A crash between phases leaves a
//! zero-count row that `resolve_or_create` revives and the reconciler purges.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use heed::{MdbError, PutFlags};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};
use vault_cas::{BlobLocation, BlobStore, Fingerprint, StagedBlob};

use crate::locks::{LockTable, StripeGuard};
use crate::store::MetaStore;
use crate::{LedgerError, Result};

/// One row per distinct fingerprint
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContentRecord {
    pub fingerprint: Fingerprint,
    pub byte_size: u64,
    /// Media type recorded on first upload
    pub media_type: String,
    pub location: BlobLocation,
    pub reference_count: u64,
    pub created_at: DateTime<Utc>,
}

impl ContentRecord {
    pub fn new(
        fingerprint: Fingerprint,
        byte_size: u64,
        media_type: impl Into<String>,
        location: BlobLocation,
    ) -> Self {
        Self {
            fingerprint,
            byte_size,
            media_type: media_type.into(),
            location,
            reference_count: 1,
            created_at: Utc::now(),
        }
    }

    /// A zero-count row is a leftover of an interrupted release.
    pub fn is_live(&self) -> bool {
        self.reference_count > 0
    }
}

/// Outcome of `resolve_or_create`
#[derive(Debug, Clone)]
pub struct Resolution {
    pub record: ContentRecord,
    /// True when this call published the bytes (or revived a zero-count row)
    pub created: bool,
}

/// Outcome of `release`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReleaseOutcome {
    /// Other references remain
    StillReferenced { remaining: u64 },
    /// Count reached zero; bytes and row reclaimed
    Erased,
    /// No live record for this fingerprint; nothing changed
    Untracked,
}

/// Aggregate over live records
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PhysicalUsage {
    pub records: u64,
    pub bytes: u64,
}

pub struct ContentLedger {
    store: Arc<MetaStore>,
    blobs: Arc<dyn BlobStore>,
    locks: LockTable,
}

impl ContentLedger {
    pub fn new(store: Arc<MetaStore>, blobs: Arc<dyn BlobStore>) -> Self {
        let locks = LockTable::with_lock_files(store.lock_dir(), "content");
        Self {
            store,
            blobs,
            locks,
        }
    }

    pub fn blobs(&self) -> &Arc<dyn BlobStore> {
        &self.blobs
    }

    pub fn store(&self) -> &Arc<MetaStore> {
        &self.store
    }

    /// Serialize all ledger work on `fingerprint` until the guard drops.
    pub fn lock(&self, fingerprint: &Fingerprint) -> Result<ContentLock<'_>> {
        let guard = self.locks.lock(fingerprint)?;
        Ok(ContentLock {
            ledger: self,
            fingerprint: *fingerprint,
            _guard: guard,
        })
    }

    /// Lock, resolve, unlock. See [`ContentLock::resolve_or_create`].
    pub fn resolve_or_create(&self, staged: StagedBlob, media_type: &str) -> Result<Resolution> {
        self.lock(&staged.fingerprint())?
            .resolve_or_create(staged, media_type)
    }

    /// Lock, release, unlock. See [`ContentLock::release`].
    pub fn release(&self, fingerprint: &Fingerprint) -> Result<ReleaseOutcome> {
        self.lock(fingerprint)?.release()
    }

    /// Live record for `fingerprint`. Zero-count rows read as absent.
    pub fn get(&self, fingerprint: &Fingerprint) -> Result<Option<ContentRecord>> {
        Ok(self.raw_record(fingerprint)?.filter(ContentRecord::is_live))
    }

    fn raw_record(&self, fingerprint: &Fingerprint) -> Result<Option<ContentRecord>> {
        let rtxn = self.store.env.read_txn()?;
        Ok(self.store.contents.get(&rtxn, fingerprint.as_bytes())?)
    }

    /// Every row, zero-count ones included.
    pub fn records(&self) -> Result<Vec<ContentRecord>> {
        let rtxn = self.store.env.read_txn()?;
        let mut records = Vec::new();
        for entry in self.store.contents.iter(&rtxn)? {
            let (_, record) = entry?;
            records.push(record);
        }
        Ok(records)
    }

    /// Rows left at zero by an interrupted release.
    pub fn zero_count_records(&self) -> Result<Vec<ContentRecord>> {
        Ok(self
            .records()?
            .into_iter()
            .filter(|r| !r.is_live())
            .collect())
    }

    /// Bytes actually occupied by live content.
    pub fn physical_usage(&self) -> Result<PhysicalUsage> {
        let rtxn = self.store.env.read_txn()?;
        let mut usage = PhysicalUsage::default();
        for entry in self.store.contents.iter(&rtxn)? {
            let (_, record) = entry?;
            if record.is_live() {
                usage.records += 1;
                usage.bytes += record.byte_size;
            }
        }
        Ok(usage)
    }
}

/// Exclusive hold on one fingerprint's ledger row.
pub struct ContentLock<'a> {
    ledger: &'a ContentLedger,
    fingerprint: Fingerprint,
    _guard: StripeGuard<'a>,
}

impl ContentLock<'_> {
    pub fn fingerprint(&self) -> &Fingerprint {
        &self.fingerprint
    }

    /// Current row, zero-count included.
    pub fn record(&self) -> Result<Option<ContentRecord>> {
        self.ledger.raw_record(&self.fingerprint)
    }

    /// Count an additional reference to the staged content, publishing its
    /// bytes if this fingerprint is new.
    ///
    /// On a hit the staged bytes are discarded without touching the blob
    /// store. On a miss the bytes are published before the row is inserted;
    /// if the insert fails the blob is erased again.
    pub fn resolve_or_create(&self, staged: StagedBlob, media_type: &str) -> Result<Resolution> {
        if staged.fingerprint() != self.fingerprint {
            return Err(LedgerError::LockMismatch {
                locked: self.fingerprint.to_hex(),
                requested: staged.fingerprint().to_hex(),
            });
        }

        if let Some(record) = self.increment_live()? {
            debug!(
                fingerprint = %self.fingerprint,
                count = record.reference_count,
                "dedup hit"
            );
            staged.discard();
            return Ok(Resolution {
                record,
                created: false,
            });
        }

        let blobs = &self.ledger.blobs;
        let location = blobs.location(&self.fingerprint);
        let size = staged.size();
        blobs.store(&location, staged)?;

        let candidate = ContentRecord::new(self.fingerprint, size, media_type, location.clone());
        match self.insert_or_increment(candidate) {
            Ok(resolution) => {
                debug!(
                    fingerprint = %self.fingerprint,
                    size,
                    created = resolution.created,
                    "content resolved"
                );
                Ok(resolution)
            }
            Err(e) => {
                if let Err(erase_err) = blobs.erase(&location) {
                    warn!(
                        fingerprint = %self.fingerprint,
                        error = %erase_err,
                        "failed to erase blob after ledger insert failure"
                    );
                }
                Err(e)
            }
        }
    }

    fn increment_live(&self) -> Result<Option<ContentRecord>> {
        let store = &self.ledger.store;
        let key = self.fingerprint.as_bytes();
        let mut wtxn = store.env.write_txn()?;

        match store.contents.get(&wtxn, key)? {
            Some(mut record) if record.is_live() => {
                record.reference_count += 1;
                store.contents.put(&mut wtxn, key, &record)?;
                wtxn.commit()?;
                Ok(Some(record))
            }
            _ => Ok(None),
        }
    }

    /// Insert with count 1, relying on the table's key uniqueness. If the
    /// key already exists, increment it instead (or revive it if it sits
    /// at zero).
    fn insert_or_increment(&self, candidate: ContentRecord) -> Result<Resolution> {
        let store = &self.ledger.store;
        let key = self.fingerprint.as_bytes();
        let mut wtxn = store.env.write_txn()?;

        let resolution = match store.contents.put_with_flags(
            &mut wtxn,
            PutFlags::NO_OVERWRITE,
            key,
            &candidate,
        ) {
            Ok(()) => Resolution {
                record: candidate,
                created: true,
            },
            Err(heed::Error::Mdb(MdbError::KeyExist)) => {
                let existing = store
                    .contents
                    .get(&wtxn, key)?
                    .ok_or_else(|| LedgerError::Corrupted(format!("{} vanished", self.fingerprint)))?;
                if existing.is_live() {
                    let mut record = existing;
                    record.reference_count += 1;
                    store.contents.put(&mut wtxn, key, &record)?;
                    Resolution {
                        record,
                        created: false,
                    }
                } else {
                    debug!(fingerprint = %self.fingerprint, "reviving zero-count record");
                    store.contents.put(&mut wtxn, key, &candidate)?;
                    Resolution {
                        record: candidate,
                        created: true,
                    }
                }
            }
            Err(e) => return Err(e.into()),
        };

        wtxn.commit()?;
        Ok(resolution)
    }

    /// Drop one reference. When the count reaches zero the blob is erased
    /// and the row deleted.
    ///
    /// A blob erase failure is logged and does not stop the row deletion;
    /// the leftover file is an orphan for the reconciler to collect.
    pub fn release(&self) -> Result<ReleaseOutcome> {
        let store = &self.ledger.store;
        let key = self.fingerprint.as_bytes();

        let mut wtxn = store.env.write_txn()?;
        let mut record = match store.contents.get(&wtxn, key)? {
            Some(record) if record.is_live() => record,
            _ => return Ok(ReleaseOutcome::Untracked),
        };
        record.reference_count -= 1;
        store.contents.put(&mut wtxn, key, &record)?;
        wtxn.commit()?;

        if record.is_live() {
            return Ok(ReleaseOutcome::StillReferenced {
                remaining: record.reference_count,
            });
        }

        self.reclaim(&record.location)?;
        Ok(ReleaseOutcome::Erased)
    }

    /// Erase the blob, then delete the row if it is still at zero.
    fn reclaim(&self, location: &BlobLocation) -> Result<()> {
        if let Err(e) = self.ledger.blobs.erase(location) {
            warn!(
                fingerprint = %self.fingerprint,
                error = %e,
                "failed to erase blob; leaving it to the reconciler"
            );
        }
        self.delete_if_zero()?;
        debug!(fingerprint = %self.fingerprint, "content reclaimed");
        Ok(())
    }

    fn delete_if_zero(&self) -> Result<bool> {
        let store = &self.ledger.store;
        let key = self.fingerprint.as_bytes();
        let mut wtxn = store.env.write_txn()?;
        match store.contents.get(&wtxn, key)? {
            Some(record) if !record.is_live() => {
                store.contents.delete(&mut wtxn, key)?;
                wtxn.commit()?;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    /// Overwrite the count with an externally computed value.
    ///
    /// Setting zero reclaims the content the same way the last release
    /// does. Returns the previous count, or `None` if there was no row.
    pub fn set_reference_count(&self, count: u64) -> Result<Option<u64>> {
        let store = &self.ledger.store;
        let key = self.fingerprint.as_bytes();

        let mut wtxn = store.env.write_txn()?;
        let mut record = match store.contents.get(&wtxn, key)? {
            Some(record) => record,
            None => return Ok(None),
        };
        let previous = record.reference_count;
        record.reference_count = count;
        store.contents.put(&mut wtxn, key, &record)?;
        wtxn.commit()?;

        if count == 0 {
            self.reclaim(&record.location)?;
        }
        Ok(Some(previous))
    }

    /// Delete a zero-count row and its blob. Live rows are left alone.
    ///
    /// Unlike `release`, a blob erase failure is returned and the row kept,
    /// so a later pass can retry.
    pub fn purge(&self) -> Result<bool> {
        let record = match self.record()? {
            Some(record) if !record.is_live() => record,
            _ => return Ok(false),
        };
        self.ledger.blobs.erase(&record.location)?;
        self.delete_if_zero()
    }
}
