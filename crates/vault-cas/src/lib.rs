//! # vault-cas
//!
//! Content-addressable blob storage for the file vault.
//!
//! Blobs are keyed by their BLAKE3 fingerprint and laid out with a 3-level
//! fan-out so no directory grows unbounded:
//!
//! ```text
//! <root>/
//! ├── staging/            # uploads being hashed (tempfiles)
//! └── blake3/
//!     └── ab/
//!         └── cd/
//!             └── abcd1234...ef   # full hex fingerprint
//! ```
//!
//! Uploads are spooled into `staging/` while they are hashed and then
//! published with an atomic rename, so a reader never observes a partially
//! written blob.

mod backend;
pub mod hasher;

pub use backend::{BlobLocation, BlobStore, StagedBlob, StoredBlob};
pub use hasher::{Digest, Fingerprint, StreamHasher, VerifyingReader, SNIFF_LEN};

use std::fs::{self, File};
use std::io::{self, BufReader, BufWriter, Read};
use std::path::{Path, PathBuf};

use tempfile::NamedTempFile;
use thiserror::Error;
use tracing::{debug, instrument};
use walkdir::WalkDir;

/// Directory holding published blobs
const BLOB_DIR: &str = "blake3";

/// Directory holding in-flight uploads
const STAGING_DIR: &str = "staging";

/// Errors that can occur during blob operations
#[derive(Error, Debug)]
pub enum CasError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("Blob not found: {fingerprint}")]
    NotFound { fingerprint: String },

    #[error("Hash mismatch: expected {expected}, got {actual}")]
    HashMismatch { expected: String, actual: String },

    #[error("Upload exceeds the {limit} byte limit")]
    TooLarge { limit: u64 },

    #[error("Invalid fingerprint: {0}")]
    InvalidFingerprint(String),

    #[error("Invalid blob location: {0}")]
    InvalidLocation(String),

    #[error("Directory walk failed: {0}")]
    Walk(#[from] walkdir::Error),
}

pub type Result<T> = std::result::Result<T, CasError>;

/// Filesystem blob repository
#[derive(Debug, Clone)]
pub struct FsBlobStore {
    root: PathBuf,
}

impl FsBlobStore {
    /// Open (or create) a repository rooted at `root`.
    pub fn new<P: AsRef<Path>>(root: P) -> Result<Self> {
        let root = root.as_ref().to_path_buf();
        fs::create_dir_all(root.join(BLOB_DIR))?;
        fs::create_dir_all(root.join(STAGING_DIR))?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn staging_dir(&self) -> PathBuf {
        self.root.join(STAGING_DIR)
    }

    /// `blake3/ab/cd/<hex>` for a fingerprint.
    pub fn location_for(fingerprint: &Fingerprint) -> BlobLocation {
        let hex = fingerprint.to_hex();
        BlobLocation::new(format!("{}/{}/{}/{}", BLOB_DIR, &hex[..2], &hex[2..4], hex))
    }

    /// Recover the fingerprint encoded in a location.
    pub fn fingerprint_of(location: &BlobLocation) -> Option<Fingerprint> {
        let mut parts = location.as_str().split('/');
        let (root, l1, l2, name) = (parts.next()?, parts.next()?, parts.next()?, parts.next()?);
        if parts.next().is_some() || root != BLOB_DIR {
            return None;
        }
        let fingerprint = Fingerprint::from_hex(name)?;
        let hex = fingerprint.to_hex();
        (l1 == &hex[..2] && l2 == &hex[2..4]).then_some(fingerprint)
    }

    /// Resolve a location to a path, rejecting anything that does not match
    /// the fan-out layout (keeps stray `..` components out of the root).
    fn path_of(&self, location: &BlobLocation) -> Result<(PathBuf, Fingerprint)> {
        let fingerprint = Self::fingerprint_of(location)
            .ok_or_else(|| CasError::InvalidLocation(location.to_string()))?;
        Ok((self.root.join(location.as_str()), fingerprint))
    }

    /// Blob count and total bytes.
    pub fn stats(&self) -> Result<BlobStats> {
        let mut stats = BlobStats::default();
        for blob in self.list()? {
            stats.blob_count += 1;
            stats.total_bytes += blob.size;
        }
        Ok(stats)
    }

    /// Blobs are immutable once published.
    #[cfg(unix)]
    fn set_readonly(path: &Path) -> io::Result<()> {
        use std::os::unix::fs::PermissionsExt;
        let mut perms = fs::metadata(path)?.permissions();
        perms.set_mode(0o444);
        fs::set_permissions(path, perms)
    }

    #[cfg(not(unix))]
    fn set_readonly(path: &Path) -> io::Result<()> {
        let mut perms = fs::metadata(path)?.permissions();
        perms.set_readonly(true);
        fs::set_permissions(path, perms)
    }
}

impl BlobStore for FsBlobStore {
    fn location(&self, fingerprint: &Fingerprint) -> BlobLocation {
        Self::location_for(fingerprint)
    }

    #[instrument(skip(self, reader), level = "debug")]
    fn stage(&self, reader: &mut dyn Read, limit: Option<u64>) -> Result<StagedBlob> {
        let file = NamedTempFile::new_in(self.staging_dir())?;
        let digest = StreamHasher::with_limit(limit).digest_into(reader, BufWriter::new(file.as_file()))?;
        // Durable before any caller lock is taken; publishing is then a rename
        file.as_file().sync_all()?;
        debug!(fingerprint = %digest.fingerprint, size = digest.size, "staged upload");
        Ok(StagedBlob::new(digest, file))
    }

    #[instrument(skip(self, staged), fields(fingerprint = %staged.fingerprint()), level = "debug")]
    fn store(&self, location: &BlobLocation, staged: StagedBlob) -> Result<()> {
        let (path, fingerprint) = self.path_of(location)?;
        if fingerprint != staged.fingerprint() {
            return Err(CasError::HashMismatch {
                expected: fingerprint.to_hex(),
                actual: staged.fingerprint().to_hex(),
            });
        }

        // Deduplication: identical bytes are already published
        if path.exists() {
            debug!("blob already present, dropping staged copy");
            return Ok(());
        }

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        if let Err(e) = staged.persist(&path) {
            // Lost a rename race against an identical upload
            if path.exists() {
                return Ok(());
            }
            return Err(CasError::Io(e));
        }

        Self::set_readonly(&path).ok();
        Ok(())
    }

    #[instrument(skip(self), level = "debug")]
    fn fetch(&self, location: &BlobLocation) -> Result<Vec<u8>> {
        let (path, fingerprint) = self.path_of(location)?;
        let data = match fs::read(&path) {
            Ok(data) => data,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                return Err(CasError::NotFound {
                    fingerprint: fingerprint.to_hex(),
                })
            }
            Err(e) => return Err(e.into()),
        };

        // Verify on read (integrity check)
        let actual = Fingerprint::of(&data);
        if actual != fingerprint {
            return Err(CasError::HashMismatch {
                expected: fingerprint.to_hex(),
                actual: actual.to_hex(),
            });
        }

        Ok(data)
    }

    fn open(&self, location: &BlobLocation) -> Result<Box<dyn Read + Send>> {
        let (path, fingerprint) = self.path_of(location)?;
        match File::open(&path) {
            Ok(file) => Ok(Box::new(BufReader::new(file))),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Err(CasError::NotFound {
                fingerprint: fingerprint.to_hex(),
            }),
            Err(e) => Err(e.into()),
        }
    }

    #[instrument(skip(self), level = "debug")]
    fn erase(&self, location: &BlobLocation) -> Result<()> {
        let (path, _) = self.path_of(location)?;
        match fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    fn exists(&self, location: &BlobLocation) -> bool {
        self.path_of(location)
            .map(|(path, _)| path.is_file())
            .unwrap_or(false)
    }

    fn list(&self) -> Result<Vec<StoredBlob>> {
        let mut blobs = Vec::new();
        for entry in WalkDir::new(self.root.join(BLOB_DIR)).min_depth(3).max_depth(3) {
            let entry = entry?;
            if !entry.file_type().is_file() {
                continue;
            }
            let Some(fingerprint) = entry.file_name().to_str().and_then(Fingerprint::from_hex) else {
                continue;
            };
            let metadata = entry.metadata()?;
            blobs.push(StoredBlob {
                fingerprint,
                location: Self::location_for(&fingerprint),
                size: metadata.len(),
                modified: metadata.modified()?,
            });
        }
        Ok(blobs)
    }
}

/// Statistics about the blob repository
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BlobStats {
    /// Number of unique blobs stored
    pub blob_count: u64,
    /// Total bytes stored (deduplicated)
    pub total_bytes: u64,
}

impl BlobStats {
    pub fn avg_blob_size(&self) -> u64 {
        if self.blob_count == 0 {
            0
        } else {
            self.total_bytes / self.blob_count
        }
    }
}
