//! Storage accounting commands: usage, stats, quota.

use anyhow::Result;
use clap::{Args, Subcommand};
use console::style;
use vault_core::{OwnerId, Vault};

use crate::files::parse_owner;
use crate::format::{format_bytes, format_number, parse_size};

#[derive(Args, Debug)]
pub struct UsageArgs {
    #[arg(long, env = "VAULT_OWNER", value_parser = parse_owner)]
    owner: OwnerId,

    #[arg(long)]
    json: bool,
}

#[derive(Subcommand, Debug)]
pub enum QuotaCommands {
    /// Show an owner's effective ceiling
    Show {
        #[arg(long, env = "VAULT_OWNER", value_parser = parse_owner)]
        owner: OwnerId,
    },

    /// Override an owner's ceiling, e.g. "250MB"
    Set {
        #[arg(long, env = "VAULT_OWNER", value_parser = parse_owner)]
        owner: OwnerId,

        #[arg(value_name = "SIZE", value_parser = parse_size)]
        ceiling: u64,
    },

    /// Drop an owner's override and fall back to the default ceiling
    Clear {
        #[arg(long, env = "VAULT_OWNER", value_parser = parse_owner)]
        owner: OwnerId,
    },
}

pub fn usage(vault: &Vault, args: UsageArgs) -> Result<()> {
    let stats = vault.owner_stats(&args.owner)?;
    if args.json {
        println!("{}", serde_json::to_string_pretty(&stats)?);
        return Ok(());
    }

    let used_pct = if stats.ceiling == 0 {
        100.0
    } else {
        stats.used as f64 / stats.ceiling as f64 * 100.0
    };
    let used = format!("{} of {}", format_bytes(stats.used), format_bytes(stats.ceiling));
    let used = if used_pct >= 90.0 {
        style(used).red().bold().to_string()
    } else {
        used
    };

    println!();
    println!("  Storage for {}", style(args.owner.as_str()).bold());
    println!("    Used:       {} ({:.1}%)", used, used_pct);
    println!("    Remaining:  {}", format_bytes(stats.remaining));
    println!("    Files:      {}", format_number(stats.files as u64));
    if stats.savings > 0 {
        println!(
            "    Saved:      {} by deduplication ({:.1}% of {})",
            format_bytes(stats.savings),
            stats.savings_pct,
            format_bytes(stats.logical)
        );
    }
    println!();
    Ok(())
}

pub fn stats(vault: &Vault, json: bool) -> Result<()> {
    let savings = vault.system_wide_savings()?;
    if json {
        let value = serde_json::json!({
            "logical_bytes": savings.logical_bytes,
            "physical_bytes": savings.physical_bytes,
            "saved_bytes": savings.saved(),
            "savings_pct": savings.percentage(),
            "reference_count": savings.reference_count,
            "content_count": savings.content_count,
            "dedup_ratio": savings.dedup_ratio(),
        });
        println!("{}", serde_json::to_string_pretty(&value)?);
        return Ok(());
    }

    println!();
    println!("  Vault Statistics");
    println!("  ================");
    println!(
        "    Files:        {} referencing {} stored contents",
        format_number(savings.reference_count),
        format_number(savings.content_count)
    );
    println!("    Logical:      {}", format_bytes(savings.logical_bytes));
    println!("    Physical:     {}", format_bytes(savings.physical_bytes));
    println!(
        "    Saved:        {} ({:.1}%)",
        style(format_bytes(savings.saved())).green(),
        savings.percentage()
    );
    if savings.content_count > 0 {
        println!("    Dedup ratio:  {:.2}x", savings.dedup_ratio());
    }
    println!();
    Ok(())
}

pub fn quota(vault: &Vault, command: QuotaCommands) -> Result<()> {
    match command {
        QuotaCommands::Show { owner } => {
            let ceiling = vault.quota().ceiling(&owner)?;
            let usage = vault.current_usage(&owner)?;
            println!(
                "{}: {} of {}",
                owner,
                format_bytes(usage),
                format_bytes(ceiling)
            );
        }
        QuotaCommands::Set { owner, ceiling } => {
            vault.set_quota(&owner, Some(ceiling))?;
            println!("{}: ceiling set to {}", owner, format_bytes(ceiling));
        }
        QuotaCommands::Clear { owner } => {
            vault.set_quota(&owner, None)?;
            println!(
                "{}: ceiling reset to the default ({})",
                owner,
                format_bytes(vault.quota().default_ceiling())
            );
        }
    }
    Ok(())
}
