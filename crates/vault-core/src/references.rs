//! Creating and destroying file references.
//!
//! Upload order: stage and hash, validate, check quota, then under the
//! content lock resolve the content and insert the reference. If the insert
//! fails the resolution is released under the same lock, so the upload
//! either produces a reference or leaves nothing behind.
//!
//! Delete order: under the content lock remove the reference first and
//! release the content second. A crash in between leaves the record
//! over-counted, which the reconciler lowers; it never leaves a reference
//! whose bytes were erased.

use std::collections::HashMap;
use std::fmt;
use std::io::{self, Read};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use vault_cas::{CasError, Fingerprint, VerifyingReader};
use vault_config::{log_ledger_error, log_store_debug, log_store_info, log_store_warn};
use vault_ledger::{
    ContentLedger, ContentLock, FileReference, NewReference, OwnerId, ReferenceId,
    ReferenceTable, ReleaseOutcome,
};

use crate::error::{Result, StorageFault, VaultError};
use crate::media;
use crate::quota::QuotaGuard;

const MAX_DISPLAY_NAME: usize = 255;

/// Upload limits and checks
#[derive(Debug, Clone, Copy)]
pub struct UploadPolicy {
    pub max_file_size: u64,
    pub verify_media_type: bool,
}

impl Default for UploadPolicy {
    fn default() -> Self {
        Self {
            max_file_size: 50 * 1024 * 1024,
            verify_media_type: true,
        }
    }
}

/// What an accepted upload produced
#[derive(Debug, Clone, Serialize)]
pub struct UploadReceipt {
    pub reference_id: ReferenceId,
    pub fingerprint: Fingerprint,
    pub byte_size: u64,
    pub media_type: String,
    /// The content was already stored and no bytes were written
    pub deduplicated: bool,
    /// Bytes added to the owner's quota usage
    pub charged: u64,
}

/// A reference together with the size and type of its content
#[derive(Debug, Clone, Serialize)]
pub struct FileListing {
    #[serde(flatten)]
    pub reference: FileReference,
    pub byte_size: u64,
    pub media_type: String,
}

/// Conditions for `list_references`. Unset fields match everything.
#[derive(Debug, Clone, Default)]
pub struct ReferenceFilter {
    /// Case-insensitive substring of the display name
    pub name_contains: Option<String>,
    /// Prefix of the media type, e.g. `image/`
    pub media_type_prefix: Option<String>,
    pub min_size: Option<u64>,
    pub max_size: Option<u64>,
    /// Inclusive
    pub created_after: Option<DateTime<Utc>>,
    /// Exclusive
    pub created_before: Option<DateTime<Utc>>,
}

impl ReferenceFilter {
    pub fn matches(&self, listing: &FileListing) -> bool {
        if let Some(needle) = &self.name_contains {
            let name = listing.reference.display_name.to_lowercase();
            if !name.contains(&needle.to_lowercase()) {
                return false;
            }
        }
        if let Some(prefix) = &self.media_type_prefix {
            let media_type = media::essence(&listing.media_type);
            if !media_type.starts_with(&prefix.to_ascii_lowercase()) {
                return false;
            }
        }
        if self.min_size.is_some_and(|min| listing.byte_size < min) {
            return false;
        }
        if self.max_size.is_some_and(|max| listing.byte_size > max) {
            return false;
        }
        let created = listing.reference.created_at;
        if self.created_after.is_some_and(|after| created < after) {
            return false;
        }
        if self.created_before.is_some_and(|before| created >= before) {
            return false;
        }
        true
    }
}

/// Download in progress. Reading to the end verifies the digest; a
/// mismatch surfaces as an `InvalidData` read error.
pub struct ContentStream {
    reference: FileReference,
    media_type: String,
    byte_size: u64,
    reader: VerifyingReader<Box<dyn Read + Send>>,
}

impl ContentStream {
    pub fn reference(&self) -> &FileReference {
        &self.reference
    }

    pub fn media_type(&self) -> &str {
        &self.media_type
    }

    pub fn byte_size(&self) -> u64 {
        self.byte_size
    }

    /// Read the whole stream into memory.
    pub fn into_bytes(mut self) -> Result<Vec<u8>> {
        let mut bytes = Vec::with_capacity(self.byte_size as usize);
        self.reader.read_to_end(&mut bytes)?;
        Ok(bytes)
    }
}

impl Read for ContentStream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.reader.read(buf)
    }
}

impl fmt::Debug for ContentStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ContentStream")
            .field("reference", &self.reference.id)
            .field("media_type", &self.media_type)
            .field("byte_size", &self.byte_size)
            .finish()
    }
}

pub struct ReferenceManager {
    ledger: Arc<ContentLedger>,
    references: Arc<dyn ReferenceTable>,
    quota: Arc<QuotaGuard>,
    policy: UploadPolicy,
}

impl ReferenceManager {
    pub fn new(
        ledger: Arc<ContentLedger>,
        references: Arc<dyn ReferenceTable>,
        quota: Arc<QuotaGuard>,
        policy: UploadPolicy,
    ) -> Self {
        Self {
            ledger,
            references,
            quota,
            policy,
        }
    }

    /// Store `reader`'s bytes as a new file of `owner`.
    pub fn create_reference<R: Read>(
        &self,
        owner: &OwnerId,
        display_name: &str,
        mut reader: R,
        declared_media_type: Option<&str>,
    ) -> Result<UploadReceipt> {
        validate_display_name(display_name)?;

        let staged = self
            .ledger
            .blobs()
            .stage(&mut reader, Some(self.policy.max_file_size))?;
        let media_type = media::resolve(
            declared_media_type,
            staged.head(),
            self.policy.verify_media_type,
        )?;
        let fingerprint = staged.fingerprint();
        let size = staged.size();

        let mut charged = self.quota.authorize(owner, &fingerprint, size)?;
        let owner_guard = self.quota.serialize(owner)?;
        if owner_guard.is_some() {
            // Usage may have moved while we waited for the owner's stripe
            charged = self.quota.authorize(owner, &fingerprint, size)?;
        }

        let lock = self.ledger.lock(&fingerprint)?;
        let resolution = lock.resolve_or_create(staged, &media_type)?;

        let inserted = self.references.insert(NewReference {
            owner: owner.clone(),
            display_name: display_name.to_string(),
            content: fingerprint,
            is_public: false,
        });
        let reference = match inserted {
            Ok(reference) => reference,
            Err(e) => {
                rollback(&lock);
                return Err(e.into());
            }
        };
        drop(lock);
        drop(owner_guard);

        log_store_info!(
            "Upload accepted",
            owner = owner.as_str(),
            reference = reference.id.get(),
            fingerprint = tracing::field::display(&fingerprint),
            bytes = size,
            deduplicated = !resolution.created
        );

        Ok(UploadReceipt {
            reference_id: reference.id,
            fingerprint,
            byte_size: resolution.record.byte_size,
            media_type: resolution.record.media_type,
            deduplicated: !resolution.created,
            charged,
        })
    }

    /// Remove a reference and release its content.
    ///
    /// Once the reference row is gone the delete has succeeded; a failure
    /// to release is logged and left for the reconciler.
    pub fn delete_reference(&self, id: ReferenceId, owner: &OwnerId) -> Result<()> {
        let reference = self.owned(id, owner)?;

        let lock = self.ledger.lock(&reference.content)?;
        if self.references.remove(id)?.is_none() {
            // Lost a race with another delete of the same id
            return Err(VaultError::NotFound(id));
        }

        match lock.release() {
            Ok(ReleaseOutcome::Untracked) => {
                log_store_warn!(
                    "Deleted reference had no live content record",
                    reference = id.get(),
                    fingerprint = tracing::field::display(&reference.content)
                );
            }
            Ok(outcome) => {
                log_store_debug!(
                    "Reference deleted",
                    reference = id.get(),
                    outcome = tracing::field::debug(outcome)
                );
            }
            Err(e) => {
                log_ledger_error!(
                    "Release after delete failed",
                    reference = id.get(),
                    fingerprint = tracing::field::display(&reference.content),
                    error = tracing::field::display(&e)
                );
            }
        }
        Ok(())
    }

    /// Open the content of one of `owner`'s references.
    pub fn fetch_bytes_for(&self, id: ReferenceId, owner: &OwnerId) -> Result<ContentStream> {
        let reference = self.owned(id, owner)?;
        let stream = self.open(reference)?;
        self.references.record_download(id)?;
        Ok(stream)
    }

    /// Open a public reference without an owner. Private references read
    /// as absent.
    pub fn fetch_public(&self, id: ReferenceId) -> Result<ContentStream> {
        let reference = self
            .references
            .get(id)?
            .filter(|r| r.is_public)
            .ok_or(VaultError::NotFound(id))?;
        let stream = self.open(reference)?;
        self.references.record_download(id)?;
        Ok(stream)
    }

    pub fn set_public(
        &self,
        id: ReferenceId,
        owner: &OwnerId,
        public: bool,
    ) -> Result<FileReference> {
        self.owned(id, owner)?;
        self.references
            .set_public(id, public)?
            .ok_or(VaultError::NotFound(id))
    }

    pub fn get_reference(&self, id: ReferenceId, owner: &OwnerId) -> Result<FileListing> {
        let reference = self.owned(id, owner)?;
        let mut cache = HashMap::new();
        self.listing(reference, &mut cache)
    }

    /// `owner`'s references matching `filter`, newest first.
    pub fn list_references(
        &self,
        owner: &OwnerId,
        filter: &ReferenceFilter,
    ) -> Result<Vec<FileListing>> {
        let mut cache = HashMap::new();
        let mut listings = Vec::new();
        for reference in self.references.list_by_owner(owner)? {
            let listing = self.listing(reference, &mut cache)?;
            if filter.matches(&listing) {
                listings.push(listing);
            }
        }

        listings.sort_by(|a, b| {
            b.reference
                .created_at
                .cmp(&a.reference.created_at)
                .then(b.reference.id.cmp(&a.reference.id))
        });
        Ok(listings)
    }

    fn owned(&self, id: ReferenceId, owner: &OwnerId) -> Result<FileReference> {
        let reference = self.references.get(id)?.ok_or(VaultError::NotFound(id))?;
        if reference.owner != *owner {
            return Err(VaultError::Forbidden(id));
        }
        Ok(reference)
    }

    fn listing(
        &self,
        reference: FileReference,
        cache: &mut HashMap<Fingerprint, (u64, String)>,
    ) -> Result<FileListing> {
        let (byte_size, media_type) = match cache.get(&reference.content) {
            Some(entry) => entry.clone(),
            None => {
                let entry = match self.ledger.get(&reference.content)? {
                    Some(record) => (record.byte_size, record.media_type),
                    None => (0, media::OCTET_STREAM.to_string()),
                };
                cache.insert(reference.content, entry.clone());
                entry
            }
        };
        Ok(FileListing {
            reference,
            byte_size,
            media_type,
        })
    }

    fn open(&self, reference: FileReference) -> Result<ContentStream> {
        let record = self
            .ledger
            .get(&reference.content)?
            .ok_or(StorageFault::MissingContent(reference.content))?;

        let reader = match self.ledger.blobs().open(&record.location) {
            Ok(reader) => reader,
            Err(CasError::NotFound { .. }) if self.references.get(reference.id)?.is_none() => {
                // Deleted while we were opening it
                return Err(VaultError::NotFound(reference.id));
            }
            Err(e) => return Err(e.into()),
        };

        Ok(ContentStream {
            media_type: record.media_type,
            byte_size: record.byte_size,
            reader: VerifyingReader::new(reader, reference.content),
            reference,
        })
    }
}

/// Undo a resolution whose reference insert failed.
fn rollback(lock: &ContentLock<'_>) {
    match lock.release() {
        Ok(outcome) => log_store_debug!(
            "Rolled back content resolution",
            fingerprint = tracing::field::display(lock.fingerprint()),
            outcome = tracing::field::debug(outcome)
        ),
        Err(e) => log_ledger_error!(
            "Rollback of content resolution failed",
            fingerprint = tracing::field::display(lock.fingerprint()),
            error = tracing::field::display(&e)
        ),
    }
}

fn validate_display_name(name: &str) -> Result<()> {
    if name.trim().is_empty() {
        return Err(VaultError::ValidationFailed("display name is empty".into()));
    }
    if name.len() > MAX_DISPLAY_NAME {
        return Err(VaultError::ValidationFailed(format!(
            "display name longer than {MAX_DISPLAY_NAME} bytes"
        )));
    }
    if name.chars().any(char::is_control) {
        return Err(VaultError::ValidationFailed(
            "display name contains control characters".into(),
        ));
    }
    Ok(())
}
