//! Per-owner quota accounting on deduplicated bytes.
//!
//! An owner is charged once per distinct piece of content they reference,
//! however many references they hold to it. Two owners holding the same
//! content are each charged its full size.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use serde::Serialize;
use vault_cas::Fingerprint;
use vault_config::{log_quota_debug, log_quota_info};
use vault_ledger::{ContentLedger, LockTable, MetaStore, OwnerId, ReferenceTable, StripeGuard};

use crate::error::{Result, VaultError};

/// Per-owner storage statistics
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct OwnerStats {
    /// Deduplicated bytes charged against the quota
    pub used: u64,
    /// Bytes the owner would use without deduplication
    pub logical: u64,
    pub savings: u64,
    pub savings_pct: f64,
    pub ceiling: u64,
    pub remaining: u64,
    pub files: usize,
}

pub struct QuotaGuard {
    store: Arc<MetaStore>,
    ledger: Arc<ContentLedger>,
    references: Arc<dyn ReferenceTable>,
    default_ceiling: u64,
    strict: bool,
    owner_locks: LockTable,
}

impl QuotaGuard {
    pub fn new(
        store: Arc<MetaStore>,
        ledger: Arc<ContentLedger>,
        references: Arc<dyn ReferenceTable>,
        default_ceiling: u64,
        strict: bool,
    ) -> Self {
        let owner_locks = LockTable::with_lock_files(store.lock_dir(), "owner");
        Self {
            store,
            ledger,
            references,
            default_ceiling,
            strict,
            owner_locks,
        }
    }

    pub fn default_ceiling(&self) -> u64 {
        self.default_ceiling
    }

    /// Effective ceiling: the owner's override, else the default.
    pub fn ceiling(&self, owner: &OwnerId) -> Result<u64> {
        Ok(self
            .store
            .quota_ceiling(owner)?
            .unwrap_or(self.default_ceiling))
    }

    /// Set (`Some`) or clear (`None`) an owner's ceiling override.
    pub fn set_ceiling(&self, owner: &OwnerId, ceiling: Option<u64>) -> Result<()> {
        match ceiling {
            Some(bytes) => self.store.set_quota_ceiling(owner, bytes)?,
            None => {
                self.store.clear_quota_ceiling(owner)?;
            }
        }
        log_quota_info!(
            "Quota ceiling updated",
            owner = owner.as_str(),
            ceiling = ceiling.unwrap_or(self.default_ceiling)
        );
        Ok(())
    }

    /// Sum of the sizes of the distinct content the owner references.
    pub fn current_usage(&self, owner: &OwnerId) -> Result<u64> {
        let distinct: BTreeSet<Fingerprint> = self
            .references
            .list_by_owner(owner)?
            .into_iter()
            .map(|r| r.content)
            .collect();

        let mut usage = 0u64;
        for fp in distinct {
            if let Some(record) = self.ledger.get(&fp)? {
                usage = usage.saturating_add(record.byte_size);
            }
        }
        Ok(usage)
    }

    /// Bytes `owner` would be charged for adding `fingerprint`: zero if they
    /// already reference it, else its full size.
    pub fn charge_for(&self, owner: &OwnerId, fingerprint: &Fingerprint, size: u64) -> Result<u64> {
        if self.references.owner_references_content(owner, fingerprint)? {
            Ok(0)
        } else {
            Ok(size)
        }
    }

    pub fn would_exceed(&self, owner: &OwnerId, additional: u64) -> Result<bool> {
        if additional == 0 {
            return Ok(false);
        }
        let usage = self.current_usage(owner)?;
        Ok(usage.saturating_add(additional) > self.ceiling(owner)?)
    }

    /// Accept or reject adding `fingerprint` for `owner`. Returns the charge.
    pub fn authorize(&self, owner: &OwnerId, fingerprint: &Fingerprint, size: u64) -> Result<u64> {
        let charge = self.charge_for(owner, fingerprint, size)?;
        if charge == 0 {
            log_quota_debug!("Content already charged", owner = owner.as_str());
            return Ok(0);
        }

        let usage = self.current_usage(owner)?;
        let ceiling = self.ceiling(owner)?;
        if usage.saturating_add(charge) > ceiling {
            log_quota_info!(
                "Upload rejected",
                owner = owner.as_str(),
                requested = charge,
                usage = usage,
                ceiling = ceiling
            );
            return Err(VaultError::QuotaExceeded {
                owner: owner.clone(),
                requested: charge,
                usage,
                ceiling,
            });
        }
        Ok(charge)
    }

    /// In strict mode, hold the owner's stripe so that a check and the
    /// insert that follows it cannot interleave with another upload by the
    /// same owner, in this process or another. Returns `None` in
    /// best-effort mode.
    pub fn serialize(&self, owner: &OwnerId) -> Result<Option<StripeGuard<'_>>> {
        if !self.strict {
            return Ok(None);
        }
        Ok(Some(self.owner_locks.lock(owner)?))
    }

    pub fn owner_stats(&self, owner: &OwnerId) -> Result<OwnerStats> {
        let references = self.references.list_by_owner(owner)?;

        let mut sizes: HashMap<Fingerprint, u64> = HashMap::new();
        let mut logical = 0u64;
        for reference in &references {
            let size = match sizes.get(&reference.content) {
                Some(size) => *size,
                None => {
                    let size = self
                        .ledger
                        .get(&reference.content)?
                        .map(|r| r.byte_size)
                        .unwrap_or(0);
                    sizes.insert(reference.content, size);
                    size
                }
            };
            logical = logical.saturating_add(size);
        }

        let used: u64 = sizes.values().sum();
        let savings = logical.saturating_sub(used);
        let ceiling = self.ceiling(owner)?;
        Ok(OwnerStats {
            used,
            logical,
            savings,
            savings_pct: percentage(savings, logical),
            ceiling,
            remaining: ceiling.saturating_sub(used),
            files: references.len(),
        })
    }
}

pub(crate) fn percentage(part: u64, whole: u64) -> f64 {
    if whole == 0 {
        0.0
    } else {
        part as f64 / whole as f64 * 100.0
    }
}
