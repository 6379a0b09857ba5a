//! # vault-ledger
//!
//! Metadata side of the deduplicating vault, kept in a single LMDB
//! environment:
//!
//! - [`ContentLedger`]: one reference-counted row per distinct fingerprint
//! - [`ReferenceTable`]: per-owner handles on content, with owner and
//!   content indexes
//! - quota ceiling overrides on [`MetaStore`]
//!
//! The ledger owns the only handle to the blob store; nothing else writes
//! or erases blobs during normal operation.

pub mod content;
pub mod locks;
pub mod references;
pub mod store;

use thiserror::Error;
use vault_cas::CasError;

pub use content::{
    ContentLedger, ContentLock, ContentRecord, PhysicalUsage, ReleaseOutcome, Resolution,
};
pub use locks::{LockTable, StripeGuard};
pub use references::{
    FileReference, LmdbReferences, NewReference, OwnerId, ReferenceId, ReferenceTable,
};
pub use store::MetaStore;

#[derive(Error, Debug)]
pub enum LedgerError {
    #[error("LMDB error: {0}")]
    Heed(#[from] heed::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Blob store error: {0}")]
    Blob(#[from] CasError),

    #[error("Invalid owner id: {0:?}")]
    InvalidOwner(String),

    #[error("Lock held on {locked} but content is {requested}")]
    LockMismatch { locked: String, requested: String },

    #[error("Corrupted ledger: {0}")]
    Corrupted(String),
}

pub type Result<T> = std::result::Result<T, LedgerError>;
