//! Blob repository interface.
//!
//! The content ledger is the only caller. It receives a `BlobStore` handle at
//! construction time, so tests can wrap the filesystem backend to count
//! writes or inject failures.

use std::fmt;
use std::io::{self, Read};
use std::path::Path;
use std::time::SystemTime;

use serde::{Deserialize, Serialize};
use tempfile::NamedTempFile;

use crate::hasher::{Digest, Fingerprint};
use crate::Result;

/// Opaque handle a backend uses to find a blob again.
///
/// Derived deterministically from the fingerprint; the ledger stores it
/// verbatim and never interprets it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BlobLocation(String);

impl BlobLocation {
    pub fn new(location: impl Into<String>) -> Self {
        Self(location.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for BlobLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// An upload that has been hashed and spooled to the staging area but not
/// yet published into the blob tree.
///
/// Dropping it deletes the spooled bytes, so an abandoned upload leaves
/// nothing behind.
#[derive(Debug)]
pub struct StagedBlob {
    digest: Digest,
    file: NamedTempFile,
}

impl StagedBlob {
    pub(crate) fn new(digest: Digest, file: NamedTempFile) -> Self {
        Self { digest, file }
    }

    pub fn fingerprint(&self) -> Fingerprint {
        self.digest.fingerprint
    }

    pub fn size(&self) -> u64 {
        self.digest.size
    }

    /// Leading bytes for media type sniffing.
    pub fn head(&self) -> &[u8] {
        &self.digest.head
    }

    /// Path of the spooled bytes (inside the staging directory).
    pub fn path(&self) -> &Path {
        self.file.path()
    }

    /// Atomically move the spooled bytes to `dest`.
    pub(crate) fn persist(self, dest: &Path) -> io::Result<()> {
        self.file.persist(dest).map(|_| ()).map_err(|e| e.error)
    }

    /// Drop the spooled bytes. Same as letting the value go out of scope.
    pub fn discard(self) {}
}

/// A blob found by walking the repository
#[derive(Debug, Clone)]
pub struct StoredBlob {
    pub fingerprint: Fingerprint,
    pub location: BlobLocation,
    pub size: u64,
    pub modified: SystemTime,
}

/// Physical persistence of bytes keyed by fingerprint.
///
/// Contract:
/// - `store` on an occupied location is a no-op (identical bytes by construction)
/// - `erase` on a missing location succeeds
/// - `location` is a pure function of the fingerprint
pub trait BlobStore: Send + Sync {
    /// Deterministic location for a fingerprint.
    fn location(&self, fingerprint: &Fingerprint) -> BlobLocation;

    /// Hash `reader` in a single pass while spooling it to staging.
    fn stage(&self, reader: &mut dyn Read, limit: Option<u64>) -> Result<StagedBlob>;

    /// Publish staged bytes at `location`.
    fn store(&self, location: &BlobLocation, staged: StagedBlob) -> Result<()>;

    /// Read a whole blob, verifying its digest.
    fn fetch(&self, location: &BlobLocation) -> Result<Vec<u8>>;

    /// Open a blob for streaming reads.
    fn open(&self, location: &BlobLocation) -> Result<Box<dyn Read + Send>>;

    /// Remove a blob. Missing blobs are not an error.
    fn erase(&self, location: &BlobLocation) -> Result<()>;

    fn exists(&self, location: &BlobLocation) -> bool;

    /// Every published blob (staging excluded).
    fn list(&self) -> Result<Vec<StoredBlob>>;
}
