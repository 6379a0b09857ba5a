//! System-wide deduplication savings.

use std::collections::HashMap;

use serde::Serialize;
use vault_cas::Fingerprint;
use vault_ledger::{ContentLedger, ReferenceTable};

use crate::error::Result;
use crate::quota::percentage;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct Savings {
    /// Σ over references of their content's size
    pub logical_bytes: u64,
    /// Σ over live content records of their size
    pub physical_bytes: u64,
    pub reference_count: u64,
    pub content_count: u64,
}

impl Savings {
    /// Bytes not stored thanks to deduplication
    pub fn saved(&self) -> u64 {
        self.logical_bytes.saturating_sub(self.physical_bytes)
    }

    pub fn percentage(&self) -> f64 {
        percentage(self.saved(), self.logical_bytes)
    }

    /// Average number of references per stored content
    pub fn dedup_ratio(&self) -> f64 {
        if self.content_count == 0 {
            0.0
        } else {
            self.reference_count as f64 / self.content_count as f64
        }
    }
}

pub fn system_wide_savings(
    ledger: &ContentLedger,
    references: &dyn ReferenceTable,
) -> Result<Savings> {
    let mut sizes: HashMap<Fingerprint, u64> = HashMap::new();
    let mut savings = Savings::default();
    for record in ledger.records()? {
        if record.is_live() {
            savings.physical_bytes += record.byte_size;
            savings.content_count += 1;
            sizes.insert(record.fingerprint, record.byte_size);
        }
    }

    for reference in references.all()? {
        savings.reference_count += 1;
        savings.logical_bytes += sizes.get(&reference.content).copied().unwrap_or(0);
    }
    Ok(savings)
}
