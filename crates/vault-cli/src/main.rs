//! # vault CLI
//!
//! Command-line interface for the deduplicating file vault.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use console::style;
use vault_config::logging::{init_logging, LogLevel};
use vault_config::{log_cli_debug, Config, PROJECT_CONFIG};
use vault_core::Vault;

mod files;
mod format;
pub mod gc;
mod usage;

/// Vault - deduplicating file storage shared by many owners
#[derive(Parser)]
#[command(name = "vault")]
#[command(version, about, long_about = None)]
struct Cli {
    /// Blob repository root (overrides config files and VAULT_ROOT)
    #[arg(long, global = true, value_name = "DIR")]
    root: Option<PathBuf>,

    /// More log output (-v info, -vv debug, -vvv trace)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create the blob repository and ledger
    Init,

    /// Store a file for an owner
    Upload(files::UploadArgs),

    /// Write a file's content to disk or stdout
    Download(files::DownloadArgs),

    /// Delete one of an owner's files
    Delete(files::DeleteArgs),

    /// List an owner's files
    List(files::ListArgs),

    /// Make a file publicly downloadable, or private again
    Share(files::ShareArgs),

    /// Show an owner's storage usage
    Usage(usage::UsageArgs),

    /// Show system-wide deduplication savings
    Stats {
        #[arg(long)]
        json: bool,
    },

    /// Manage per-owner quota ceilings
    Quota {
        #[command(subcommand)]
        command: usage::QuotaCommands,
    },

    /// Repair the ledger and collect orphaned blobs
    Gc(gc::GcArgs),

    /// Inspect configuration
    Config {
        #[command(subcommand)]
        command: ConfigCommands,
    },
}

#[derive(Subcommand)]
enum ConfigCommands {
    /// Print the effective configuration as TOML
    Show,

    /// Print the configuration file locations
    Path,

    /// Write a default project config to .vault/config.toml
    Init {
        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(LogLevel::from_verbosity(cli.verbose));

    let mut config = Config::load().context("Failed to load configuration")?;
    if let Some(root) = cli.root {
        config.storage.root = root;
    }
    log_cli_debug!(
        "Configuration loaded",
        root = tracing::field::display(config.storage.root_path().display()),
        ledger = tracing::field::display(config.storage.ledger_path().display())
    );

    match cli.command {
        Commands::Init => cmd_init(&config),
        Commands::Config { command } => cmd_config(&config, command),
        Commands::Upload(args) => files::upload(&open_vault(&config)?, args),
        Commands::Download(args) => files::download(&open_vault(&config)?, args),
        Commands::Delete(args) => files::delete(&open_vault(&config)?, args),
        Commands::List(args) => files::list(&open_vault(&config)?, args),
        Commands::Share(args) => files::share(&open_vault(&config)?, args),
        Commands::Usage(args) => usage::usage(&open_vault(&config)?, args),
        Commands::Stats { json } => usage::stats(&open_vault(&config)?, json),
        Commands::Quota { command } => usage::quota(&open_vault(&config)?, command),
        Commands::Gc(args) => gc::run(&open_vault(&config)?, args),
    }
}

fn open_vault(config: &Config) -> Result<Vault> {
    Vault::open(config).with_context(|| {
        format!(
            "Failed to open vault at {}",
            config.storage.root_path().display()
        )
    })
}

fn cmd_init(config: &Config) -> Result<()> {
    let vault = open_vault(config)?;
    vault.sync()?;
    println!(
        "{} vault at {}",
        style("Initialized").green().bold(),
        config.storage.root_path().display()
    );
    println!("  Ledger:  {}", config.storage.ledger_path().display());
    Ok(())
}

fn cmd_config(config: &Config, command: ConfigCommands) -> Result<()> {
    match command {
        ConfigCommands::Show => {
            print!("{}", config.to_toml()?);
        }
        ConfigCommands::Path => {
            match Config::global_config_path() {
                Some(path) => println!("Global:  {}", path.display()),
                None => println!("Global:  (no home directory)"),
            }
            println!("Project: {}", Path::new(PROJECT_CONFIG).display());
        }
        ConfigCommands::Init { force } => {
            let path = Path::new(PROJECT_CONFIG);
            if path.exists() && !force {
                anyhow::bail!(
                    "{} already exists (use --force to overwrite)",
                    path.display()
                );
            }
            if let Some(parent) = path.parent() {
                fs::create_dir_all(parent)
                    .with_context(|| format!("Failed to create {}", parent.display()))?;
            }
            fs::write(path, Config::default_toml()?)
                .with_context(|| format!("Failed to write {}", path.display()))?;
            println!("Wrote {}", path.display());
        }
    }
    Ok(())
}
