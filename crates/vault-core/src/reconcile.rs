//! Background repair of ledger and blob state.
//!
//! Normal operation leaves the ledger consistent. Crashes between the
//! phases of an upload or delete can leave:
//! - zero-count rows (release committed, reclaim did not finish)
//! - over-counted rows (reference removed, release never ran)
//! - blobs without a row (publish finished, insert did not)
//!
//! Each pass takes the content lock of the fingerprint it is looking at,
//! so it never sees an upload or delete halfway through.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use serde::Serialize;
use vault_cas::Fingerprint;
use vault_config::{log_gc_error, log_gc_info, log_gc_warn, log_ledger_error};
use vault_ledger::{ContentLedger, ReferenceId, ReferenceTable};

use crate::error::Result;

#[derive(Debug, Clone, Copy)]
pub struct ReconcileOptions {
    /// Report what would change without changing it
    pub dry_run: bool,
    /// Blobs younger than this are never treated as orphans
    pub grace: Duration,
}

impl Default for ReconcileOptions {
    fn default() -> Self {
        Self {
            dry_run: false,
            grace: Duration::from_secs(3600),
        }
    }
}

/// A recorded count that disagreed with the references found
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CountRepair {
    pub fingerprint: Fingerprint,
    pub recorded: u64,
    pub actual: u64,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct ReconcileReport {
    pub dry_run: bool,
    /// Zero-count rows purged along with their bytes
    pub zero_count_purged: Vec<Fingerprint>,
    /// Over-counted rows lowered to the true count
    pub counts_lowered: Vec<CountRepair>,
    /// Under-counted rows raised to the true count
    pub counts_raised: Vec<CountRepair>,
    /// Blobs erased because no row claims them
    pub orphan_blobs: Vec<Fingerprint>,
    pub orphan_bytes: u64,
    /// Orphan candidates skipped for being inside the grace period
    pub orphans_in_grace: usize,
    /// Live rows whose bytes are missing
    pub dangling_records: Vec<Fingerprint>,
    /// References whose content has no live row
    pub dangling_references: Vec<ReferenceId>,
    /// Repairs that failed, with the reason
    pub failures: Vec<(Fingerprint, String)>,
}

impl ReconcileReport {
    /// Nothing found that needed repair
    pub fn is_clean(&self) -> bool {
        self.zero_count_purged.is_empty()
            && self.counts_lowered.is_empty()
            && self.counts_raised.is_empty()
            && self.orphan_blobs.is_empty()
            && self.dangling_records.is_empty()
            && self.dangling_references.is_empty()
            && self.failures.is_empty()
    }

    pub fn repairs(&self) -> usize {
        self.zero_count_purged.len()
            + self.counts_lowered.len()
            + self.counts_raised.len()
            + self.orphan_blobs.len()
    }
}

pub struct Reconciler {
    ledger: Arc<ContentLedger>,
    references: Arc<dyn ReferenceTable>,
}

impl Reconciler {
    pub fn new(ledger: Arc<ContentLedger>, references: Arc<dyn ReferenceTable>) -> Self {
        Self { ledger, references }
    }

    /// Run every pass once. Safe to repeat; a second run over an idle
    /// vault finds nothing.
    pub fn run(&self, options: ReconcileOptions) -> Result<ReconcileReport> {
        let mut report = ReconcileReport {
            dry_run: options.dry_run,
            ..Default::default()
        };

        self.purge_zero_counts(&options, &mut report)?;
        self.audit_counts(&options, &mut report)?;
        self.sweep_orphan_blobs(&options, &mut report)?;
        self.find_dangling(&mut report)?;

        log_gc_info!(
            "Reconcile finished",
            dry_run = options.dry_run,
            repairs = report.repairs(),
            dangling = report.dangling_records.len(),
            failures = report.failures.len()
        );
        Ok(report)
    }

    fn purge_zero_counts(
        &self,
        options: &ReconcileOptions,
        report: &mut ReconcileReport,
    ) -> Result<()> {
        for candidate in self.ledger.zero_count_records()? {
            let fp = candidate.fingerprint;
            let lock = self.ledger.lock(&fp)?;
            match lock.record()? {
                Some(record) if !record.is_live() => {}
                // Revived or purged since the scan
                _ => continue,
            }

            let actual = self.references.count_for_content(&fp)?;
            if actual > 0 {
                log_ledger_error!(
                    "Zero-count record is still referenced",
                    fingerprint = tracing::field::display(&fp),
                    actual = actual
                );
                if !options.dry_run {
                    if let Err(e) = lock.set_reference_count(actual) {
                        report.failures.push((fp, e.to_string()));
                        continue;
                    }
                }
                report.counts_raised.push(CountRepair {
                    fingerprint: fp,
                    recorded: 0,
                    actual,
                });
                continue;
            }

            if options.dry_run {
                report.zero_count_purged.push(fp);
                continue;
            }
            match lock.purge() {
                Ok(true) => {
                    log_gc_info!(
                        "Purged zero-count record",
                        fingerprint = tracing::field::display(&fp)
                    );
                    report.zero_count_purged.push(fp);
                }
                Ok(false) => {}
                Err(e) => {
                    log_gc_warn!(
                        "Failed to purge zero-count record",
                        fingerprint = tracing::field::display(&fp),
                        error = tracing::field::display(&e)
                    );
                    report.failures.push((fp, e.to_string()));
                }
            }
        }
        Ok(())
    }

    fn audit_counts(&self, options: &ReconcileOptions, report: &mut ReconcileReport) -> Result<()> {
        for candidate in self.ledger.records()? {
            let fp = candidate.fingerprint;
            let lock = self.ledger.lock(&fp)?;
            let Some(record) = lock.record()? else {
                continue;
            };
            if !record.is_live() {
                continue;
            }

            let actual = self.references.count_for_content(&fp)?;
            if actual == record.reference_count {
                continue;
            }

            let repair = CountRepair {
                fingerprint: fp,
                recorded: record.reference_count,
                actual,
            };
            if actual > record.reference_count {
                // Could have erased bytes a reference still needs
                log_ledger_error!(
                    "Content under-counted",
                    fingerprint = tracing::field::display(&fp),
                    recorded = record.reference_count,
                    actual = actual
                );
            } else {
                log_gc_info!(
                    "Content over-counted",
                    fingerprint = tracing::field::display(&fp),
                    recorded = record.reference_count,
                    actual = actual
                );
            }

            if !options.dry_run {
                if let Err(e) = lock.set_reference_count(actual) {
                    report.failures.push((fp, e.to_string()));
                    continue;
                }
            }
            if actual > record.reference_count {
                report.counts_raised.push(repair);
            } else {
                report.counts_lowered.push(repair);
            }
        }
        Ok(())
    }

    fn sweep_orphan_blobs(
        &self,
        options: &ReconcileOptions,
        report: &mut ReconcileReport,
    ) -> Result<()> {
        let now = SystemTime::now();
        let blobs = self.ledger.blobs();

        for blob in blobs.list()? {
            let fp = blob.fingerprint;
            let lock = self.ledger.lock(&fp)?;
            if lock.record()?.is_some() {
                continue;
            }
            if self.references.count_for_content(&fp)? > 0 {
                // Referenced bytes without a row are reported as dangling
                // references, never erased
                continue;
            }

            let age = now.duration_since(blob.modified).unwrap_or(Duration::ZERO);
            if age < options.grace {
                report.orphans_in_grace += 1;
                continue;
            }

            if !options.dry_run {
                if let Err(e) = blobs.erase(&blob.location) {
                    log_gc_warn!(
                        "Failed to erase orphan blob",
                        fingerprint = tracing::field::display(&fp),
                        error = tracing::field::display(&e)
                    );
                    report.failures.push((fp, e.to_string()));
                    continue;
                }
                log_gc_info!(
                    "Erased orphan blob",
                    fingerprint = tracing::field::display(&fp),
                    bytes = blob.size
                );
            }
            report.orphan_blobs.push(fp);
            report.orphan_bytes += blob.size;
        }
        Ok(())
    }

    /// Report only: the bytes are gone and nothing here can bring them back.
    fn find_dangling(&self, report: &mut ReconcileReport) -> Result<()> {
        let blobs = self.ledger.blobs();
        let mut live: HashSet<Fingerprint> = HashSet::new();

        for record in self.ledger.records()? {
            if !record.is_live() {
                continue;
            }
            if !blobs.exists(&record.location) {
                log_gc_error!(
                    "Content record has no bytes",
                    fingerprint = tracing::field::display(&record.fingerprint)
                );
                report.dangling_records.push(record.fingerprint);
            }
            live.insert(record.fingerprint);
        }

        for reference in self.references.all()? {
            if !live.contains(&reference.content) {
                report.dangling_references.push(reference.id);
            }
        }
        Ok(())
    }
}
