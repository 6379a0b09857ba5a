//! # Garbage Collection
//!
//! Ledger repair and orphan collection over the whole vault.

use std::time::Duration;

use anyhow::Result;
use clap::Args;
use vault_core::{ReconcileOptions, ReconcileReport, Vault};

use crate::format::{format_bytes, format_number};

#[derive(Args, Debug)]
pub struct GcArgs {
    /// Report what would be repaired without changing anything
    #[arg(long)]
    dry_run: bool,

    /// Only collect orphan blobs older than this many seconds
    /// (defaults to reconcile.grace_period_secs)
    #[arg(long, value_name = "SECS")]
    grace: Option<u64>,

    /// Skip the grace period and collect every orphan now
    #[arg(long, conflicts_with = "grace")]
    immediate: bool,

    #[arg(long)]
    json: bool,
}

pub fn run(vault: &Vault, args: GcArgs) -> Result<()> {
    let grace = if args.immediate {
        Duration::ZERO
    } else {
        args.grace
            .map(Duration::from_secs)
            .unwrap_or(vault.options().grace)
    };

    let report = vault.reconciler().run(ReconcileOptions {
        dry_run: args.dry_run,
        grace,
    })?;

    if args.json {
        println!("{}", serde_json::to_string_pretty(&report)?);
        return Ok(());
    }
    print_report(&report, grace);
    Ok(())
}

fn print_report(report: &ReconcileReport, grace: Duration) {
    println!();
    println!("  Vault Garbage Collection");
    println!("  ========================");
    println!();
    println!("  Ledger:");
    println!(
        "    🧹 Zero-count records purged:  {}",
        format_number(report.zero_count_purged.len() as u64)
    );
    println!(
        "    📉 Over-counts lowered:        {}",
        format_number(report.counts_lowered.len() as u64)
    );
    println!(
        "    📈 Under-counts raised:        {}",
        format_number(report.counts_raised.len() as u64)
    );
    for repair in report.counts_lowered.iter().chain(&report.counts_raised) {
        println!(
            "       {}  {} -> {}",
            repair.fingerprint, repair.recorded, repair.actual
        );
    }

    println!();
    println!("  Blobs:");
    println!(
        "    🗑️  Orphans collected:          {} ({})",
        format_number(report.orphan_blobs.len() as u64),
        format_bytes(report.orphan_bytes)
    );
    if report.orphans_in_grace > 0 {
        println!(
            "    ⏳ Orphans within {}s grace:   {}",
            grace.as_secs(),
            format_number(report.orphans_in_grace as u64)
        );
    }

    if !report.dangling_records.is_empty() || !report.dangling_references.is_empty() {
        println!();
        println!("  ⚠️  Missing content (cannot be repaired):");
        for fp in &report.dangling_records {
            println!("      record {} has no bytes", fp);
        }
        for id in &report.dangling_references {
            println!("      reference #{} has no content record", id);
        }
    }

    if !report.failures.is_empty() {
        println!();
        println!("  ❌ Failures:");
        for (fp, reason) in &report.failures {
            println!("      {}: {}", fp, reason);
        }
    }

    println!();
    if report.is_clean() {
        println!("  ✨ Nothing to repair.");
    } else if report.dry_run {
        println!(
            "  📋 Dry run complete. Would repair {} item(s); run without --dry-run to apply.",
            format_number(report.repairs() as u64)
        );
    } else {
        println!(
            "  ✅ Repaired {} item(s).",
            format_number(report.repairs() as u64)
        );
    }
    println!();
}
