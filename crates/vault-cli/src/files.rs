//! File commands: upload, download, delete, list, share.

use std::fs::File;
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use clap::Args;
use console::style;
use tempfile::NamedTempFile;
use vault_config::log_cli_info;
use vault_core::{OwnerId, ReferenceFilter, ReferenceId, Vault};

use crate::format::{format_bytes, format_time, parse_size, parse_time};

pub(crate) fn parse_owner(raw: &str) -> Result<OwnerId, String> {
    OwnerId::new(raw).map_err(|e| e.to_string())
}

#[derive(Args, Debug)]
pub struct UploadArgs {
    /// File to store ("-" reads stdin)
    #[arg(value_name = "FILE")]
    file: PathBuf,

    #[arg(long, env = "VAULT_OWNER", value_parser = parse_owner)]
    owner: OwnerId,

    /// Display name (defaults to the file name)
    #[arg(long)]
    name: Option<String>,

    /// Declared media type (sniffed from the content when omitted)
    #[arg(long = "type", value_name = "MEDIA_TYPE")]
    media_type: Option<String>,

    /// Share the file publicly right away
    #[arg(long)]
    public: bool,

    #[arg(long)]
    json: bool,
}

#[derive(Args, Debug)]
pub struct DownloadArgs {
    #[arg(value_name = "ID")]
    id: ReferenceId,

    #[arg(
        long,
        env = "VAULT_OWNER",
        value_parser = parse_owner,
        required_unless_present = "public"
    )]
    owner: Option<OwnerId>,

    /// Fetch a public file without an owner
    #[arg(long)]
    public: bool,

    /// Output path (stdout when omitted)
    #[arg(short, long)]
    output: Option<PathBuf>,
}

#[derive(Args, Debug)]
pub struct DeleteArgs {
    #[arg(value_name = "ID")]
    id: ReferenceId,

    #[arg(long, env = "VAULT_OWNER", value_parser = parse_owner)]
    owner: OwnerId,
}

#[derive(Args, Debug)]
pub struct ListArgs {
    #[arg(long, env = "VAULT_OWNER", value_parser = parse_owner)]
    owner: OwnerId,

    /// Only names containing this text (case-insensitive)
    #[arg(long)]
    name: Option<String>,

    /// Only media types starting with this prefix, e.g. "image/"
    #[arg(long = "type", value_name = "PREFIX")]
    media_type: Option<String>,

    #[arg(long, value_parser = parse_size)]
    min_size: Option<u64>,

    #[arg(long, value_parser = parse_size)]
    max_size: Option<u64>,

    /// Created on or after (YYYY-MM-DD or RFC 3339)
    #[arg(long, value_parser = parse_time)]
    after: Option<DateTime<Utc>>,

    /// Created before (YYYY-MM-DD or RFC 3339)
    #[arg(long, value_parser = parse_time)]
    before: Option<DateTime<Utc>>,

    #[arg(long)]
    json: bool,
}

#[derive(Args, Debug)]
pub struct ShareArgs {
    #[arg(value_name = "ID")]
    id: ReferenceId,

    #[arg(long, env = "VAULT_OWNER", value_parser = parse_owner)]
    owner: OwnerId,

    /// Make the file private again
    #[arg(long)]
    revoke: bool,
}

pub fn upload(vault: &Vault, args: UploadArgs) -> Result<()> {
    let from_stdin = args.file.as_os_str() == "-";
    let name = match (&args.name, from_stdin) {
        (Some(name), _) => name.clone(),
        (None, true) => anyhow::bail!("--name is required when reading stdin"),
        (None, false) => args
            .file
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .with_context(|| format!("{} has no file name", args.file.display()))?,
    };

    let reader: Box<dyn Read> = if from_stdin {
        Box::new(io::stdin().lock())
    } else {
        let file = File::open(&args.file)
            .with_context(|| format!("Failed to open {}", args.file.display()))?;
        Box::new(BufReader::new(file))
    };

    let receipt = vault.create_reference(&args.owner, &name, reader, args.media_type.as_deref())?;
    if args.public {
        vault.set_public(receipt.reference_id, &args.owner, true)?;
    }
    log_cli_info!(
        "Uploaded",
        owner = args.owner.as_str(),
        reference = receipt.reference_id.get()
    );

    if args.json {
        println!("{}", serde_json::to_string_pretty(&receipt)?);
        return Ok(());
    }

    println!(
        "{} {} as #{}",
        style("Stored").green().bold(),
        name,
        receipt.reference_id
    );
    println!("  Fingerprint: {}", receipt.fingerprint);
    println!("  Size:        {}", format_bytes(receipt.byte_size));
    println!("  Type:        {}", receipt.media_type);
    if receipt.deduplicated {
        println!(
            "  {}",
            style("Content already stored; no new bytes written").dim()
        );
    }
    if receipt.charged == 0 {
        println!("  {}", style("Quota unchanged").dim());
    } else {
        println!("  Charged:     {}", format_bytes(receipt.charged));
    }
    Ok(())
}

pub fn download(vault: &Vault, args: DownloadArgs) -> Result<()> {
    let mut stream = match &args.owner {
        Some(owner) if !args.public => vault.fetch_bytes_for(args.id, owner)?,
        _ => vault.fetch_public(args.id)?,
    };

    match &args.output {
        Some(path) => {
            let written = save_verified(&mut stream, path)
                .with_context(|| format!("Failed to read content of #{}", args.id))?;
            eprintln!(
                "{} {} ({}) to {}",
                style("Saved").green().bold(),
                stream.reference().display_name,
                format_bytes(written),
                path.display()
            );
        }
        None => {
            let stdout = io::stdout();
            let mut out = stdout.lock();
            io::copy(&mut stream, &mut out)
                .with_context(|| format!("Failed to read content of #{}", args.id))?;
            out.flush()?;
        }
    }
    Ok(())
}

/// Copy `stream` next to `path` and move it into place only once the
/// content has been read to the end and verified.
fn save_verified(stream: &mut impl Read, path: &Path) -> Result<u64> {
    let dir = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    let temp = NamedTempFile::new_in(dir)
        .with_context(|| format!("Failed to create a temporary file in {}", dir.display()))?;

    let mut out = BufWriter::new(temp);
    let written = io::copy(stream, &mut out)?;
    let temp = out.into_inner().map_err(|e| e.into_error())?;
    temp.persist(path)
        .map_err(|e| e.error)
        .with_context(|| format!("Failed to write {}", path.display()))?;
    Ok(written)
}

pub fn delete(vault: &Vault, args: DeleteArgs) -> Result<()> {
    vault.delete_reference(args.id, &args.owner)?;
    println!("{} #{}", style("Deleted").green().bold(), args.id);
    Ok(())
}

pub fn list(vault: &Vault, args: ListArgs) -> Result<()> {
    let filter = ReferenceFilter {
        name_contains: args.name,
        media_type_prefix: args.media_type,
        min_size: args.min_size,
        max_size: args.max_size,
        created_after: args.after,
        created_before: args.before,
    };
    let listings = vault.list_references(&args.owner, &filter)?;

    if args.json {
        println!("{}", serde_json::to_string_pretty(&listings)?);
        return Ok(());
    }
    if listings.is_empty() {
        println!("No files");
        return Ok(());
    }

    println!(
        "{:>6}  {:>10}  {:<24}  {:<16}  NAME",
        "ID", "SIZE", "TYPE", "CREATED"
    );
    for listing in &listings {
        let reference = &listing.reference;
        let name = if reference.is_public {
            format!("{} {}", reference.display_name, style("(public)").cyan())
        } else {
            reference.display_name.clone()
        };
        println!(
            "{:>6}  {:>10}  {:<24}  {:<16}  {}",
            reference.id.to_string(),
            format_bytes(listing.byte_size),
            vault_core::media::essence(&listing.media_type),
            format_time(&reference.created_at),
            name
        );
    }
    Ok(())
}

pub fn share(vault: &Vault, args: ShareArgs) -> Result<()> {
    let reference = vault.set_public(args.id, &args.owner, !args.revoke)?;
    if reference.is_public {
        println!(
            "#{} is public: vault download {} --public",
            reference.id, reference.id
        );
    } else {
        println!("#{} is private", reference.id);
    }
    Ok(())
}
