//! Error taxonomy seen by callers of the vault.
//!
//! `ValidationFailed`, `QuotaExceeded`, `NotFound` and `Forbidden` are the
//! caller's to fix and leave no side effects. `StorageFault` is a system
//! error from the blob store or the ledger.

use thiserror::Error;
use vault_cas::{CasError, Fingerprint};
use vault_ledger::{LedgerError, OwnerId, ReferenceId};

#[derive(Error, Debug)]
pub enum VaultError {
    #[error("Validation failed: {0}")]
    ValidationFailed(String),

    #[error(
        "Quota exceeded for {owner}: {requested} bytes requested, {usage} of {ceiling} bytes in use"
    )]
    QuotaExceeded {
        owner: OwnerId,
        requested: u64,
        usage: u64,
        ceiling: u64,
    },

    #[error("Reference {0} not found")]
    NotFound(ReferenceId),

    #[error("Reference {0} belongs to another owner")]
    Forbidden(ReferenceId),

    #[error("Storage fault: {0}")]
    StorageFault(#[from] StorageFault),
}

#[derive(Error, Debug)]
pub enum StorageFault {
    #[error(transparent)]
    Blob(CasError),

    #[error(transparent)]
    Ledger(LedgerError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("No content record for {0}")]
    MissingContent(Fingerprint),
}

impl VaultError {
    /// True for errors the caller caused and can correct.
    pub fn is_client_error(&self) -> bool {
        !matches!(self, VaultError::StorageFault(_))
    }
}

impl From<CasError> for VaultError {
    fn from(err: CasError) -> Self {
        match err {
            CasError::TooLarge { limit } => {
                VaultError::ValidationFailed(format!("file exceeds the {limit} byte upload limit"))
            }
            other => VaultError::StorageFault(StorageFault::Blob(other)),
        }
    }
}

impl From<LedgerError> for VaultError {
    fn from(err: LedgerError) -> Self {
        match err {
            LedgerError::InvalidOwner(owner) => {
                VaultError::ValidationFailed(format!("invalid owner id {owner:?}"))
            }
            LedgerError::Blob(cas) => cas.into(),
            other => VaultError::StorageFault(StorageFault::Ledger(other)),
        }
    }
}

impl From<std::io::Error> for VaultError {
    fn from(err: std::io::Error) -> Self {
        VaultError::StorageFault(StorageFault::Io(err))
    }
}

pub type Result<T> = std::result::Result<T, VaultError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_too_large_is_validation() {
        let err: VaultError = CasError::TooLarge { limit: 10 }.into();
        assert!(matches!(err, VaultError::ValidationFailed(_)));
        assert!(err.is_client_error());
    }

    #[test]
    fn test_ledger_errors_are_faults() {
        let err: VaultError = LedgerError::Corrupted("bad".into()).into();
        assert!(matches!(
            err,
            VaultError::StorageFault(StorageFault::Ledger(_))
        ));
        assert!(!err.is_client_error());

        let err: VaultError = LedgerError::InvalidOwner(String::new()).into();
        assert!(matches!(err, VaultError::ValidationFailed(_)));
    }

    #[test]
    fn test_blob_errors_through_ledger() {
        let err: VaultError = LedgerError::Blob(CasError::NotFound {
            fingerprint: "ab".into(),
        })
        .into();
        assert!(matches!(err, VaultError::StorageFault(StorageFault::Blob(_))));
    }
}
