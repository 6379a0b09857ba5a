//! # vault-config
//!
//! Configuration management for the file vault.
//!
//! Loads configuration from:
//! 1. `~/.vault/config.toml` (global)
//! 2. `.vault/config.toml` (project-local, overrides global key by key)
//! 3. Environment variables (highest priority)
//!
//! Library crates never read the global instance; they take the values they
//! need as arguments. Only the CLI goes through [`config()`].

pub mod logging;
pub mod path;
pub mod testing;

use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::{PoisonError, RwLock};
use tracing::{debug, warn};

pub const KIB: u64 = 1024;
pub const MIB: u64 = 1024 * KIB;
pub const GIB: u64 = 1024 * MIB;

/// Project-local config file, relative to the working directory
pub const PROJECT_CONFIG: &str = ".vault/config.toml";

/// Global config instance
static CONFIG: Lazy<RwLock<Config>> = Lazy::new(|| RwLock::new(Config::load().unwrap_or_default()));

/// Get global config (read-only)
pub fn config() -> std::sync::RwLockReadGuard<'static, Config> {
    CONFIG.read().unwrap_or_else(PoisonError::into_inner)
}

/// Reload config from disk
pub fn reload() -> Result<(), ConfigError> {
    let new_config = Config::load()?;
    *CONFIG.write().unwrap_or_else(PoisonError::into_inner) = new_config;
    Ok(())
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),
    #[error("TOML serialize error: {0}")]
    Serialize(#[from] toml::ser::Error),
}

/// Main configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub storage: StorageConfig,
    pub quota: QuotaConfig,
    pub upload: UploadConfig,
    pub reconcile: ReconcileConfig,
}

impl Config {
    /// Load config from standard locations
    pub fn load() -> Result<Self, ConfigError> {
        let mut layers = Vec::new();

        // 1. Global config (~/.vault/config.toml)
        if let Some(global_path) = Self::global_config_path() {
            if global_path.exists() {
                debug!("Loading global config from {:?}", global_path);
                layers.push(std::fs::read_to_string(&global_path)?);
            }
        }

        // 2. Project config (.vault/config.toml)
        let project_path = Path::new(PROJECT_CONFIG);
        if project_path.exists() {
            debug!("Loading project config from {:?}", project_path);
            layers.push(std::fs::read_to_string(project_path)?);
        }

        let mut config = Self::from_layers(layers.iter().map(String::as_str))?;

        // 3. Environment
        config.apply_env_overrides();

        Ok(config)
    }

    /// Global config path: ~/.vault/config.toml
    pub fn global_config_path() -> Option<PathBuf> {
        dirs::home_dir().map(|h| h.join(".vault/config.toml"))
    }

    /// Build a config from TOML documents, later ones overriding earlier
    /// ones key by key. Keys absent from every layer keep their defaults.
    pub fn from_layers<'a>(layers: impl IntoIterator<Item = &'a str>) -> Result<Self, ConfigError> {
        let mut merged = toml::Table::new();
        for layer in layers {
            let table: toml::Table = toml::from_str(layer)?;
            merge_tables(&mut merged, table);
        }
        let config: Config = toml::Value::Table(merged).try_into()?;
        Ok(config)
    }

    /// Apply environment variable overrides
    pub fn apply_env_overrides(&mut self) {
        self.apply_overrides(|key| std::env::var(key).ok());
    }

    /// Apply overrides from an arbitrary lookup (the process environment in
    /// production, a map in tests). Unparseable values are ignored.
    pub fn apply_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(root) = lookup("VAULT_ROOT") {
            self.storage.root = PathBuf::from(root);
        }
        if let Some(ledger) = lookup("VAULT_LEDGER") {
            self.storage.ledger = Some(PathBuf::from(ledger));
        }
        if let Some(raw) = lookup("VAULT_STORAGE_QUOTA") {
            match parse_size(&raw) {
                Some(bytes) => self.quota.default_ceiling = bytes,
                None => warn!("Ignoring invalid VAULT_STORAGE_QUOTA: {:?}", raw),
            }
        }
        if let Some(raw) = lookup("VAULT_MAX_FILE_SIZE") {
            match parse_size(&raw) {
                Some(bytes) => self.upload.max_file_size = bytes,
                None => warn!("Ignoring invalid VAULT_MAX_FILE_SIZE: {:?}", raw),
            }
        }
        if let Some(raw) = lookup("VAULT_STRICT_QUOTA") {
            match parse_bool(&raw) {
                Some(strict) => self.quota.strict = strict,
                None => warn!("Ignoring invalid VAULT_STRICT_QUOTA: {:?}", raw),
            }
        }
    }

    pub fn to_toml(&self) -> Result<String, ConfigError> {
        Ok(toml::to_string_pretty(self)?)
    }

    /// Generate default config TOML string
    pub fn default_toml() -> Result<String, ConfigError> {
        Config::default().to_toml()
    }
}

fn merge_tables(base: &mut toml::Table, overlay: toml::Table) {
    for (key, value) in overlay {
        if let toml::Value::Table(incoming) = value {
            if let Some(toml::Value::Table(existing)) = base.get_mut(&key) {
                merge_tables(existing, incoming);
                continue;
            }
            base.insert(key, toml::Value::Table(incoming));
        } else {
            base.insert(key, value);
        }
    }
}

/// Parse a byte size such as `1048576`, `512K`, `10MB` or `2GiB`.
/// Suffixes are binary multiples and case-insensitive.
pub fn parse_size(raw: &str) -> Option<u64> {
    let raw = raw.trim();
    let split = raw
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(raw.len());
    let (digits, suffix) = raw.split_at(split);
    let value: u64 = digits.parse().ok()?;

    let multiplier = match suffix.trim().to_ascii_lowercase().as_str() {
        "" | "b" => 1,
        "k" | "kb" | "kib" => KIB,
        "m" | "mb" | "mib" => MIB,
        "g" | "gb" | "gib" => GIB,
        _ => return None,
    };
    value.checked_mul(multiplier)
}

fn parse_bool(raw: &str) -> Option<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

/// Storage configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Blob repository root
    pub root: PathBuf,
    /// LMDB directory (defaults to `<root>/ledger`)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ledger: Option<PathBuf>,
    /// LMDB map size in bytes
    pub map_size: usize,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            root: PathBuf::from("~/.vault/store"),
            ledger: None,
            map_size: 1024 * 1024 * 1024,
        }
    }
}

impl StorageConfig {
    /// Root with `~` expanded
    pub fn root_path(&self) -> PathBuf {
        path::expand_home(&self.root)
    }

    pub fn ledger_path(&self) -> PathBuf {
        match &self.ledger {
            Some(ledger) => path::expand_home(ledger),
            None => self.root_path().join("ledger"),
        }
    }
}

/// Quota configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QuotaConfig {
    /// Ceiling for owners without an override, in bytes
    pub default_ceiling: u64,
    /// Serialize each owner's quota check with the reference insert.
    /// When false the check is best-effort and concurrent uploads may
    /// jointly overshoot the ceiling.
    pub strict: bool,
}

impl Default for QuotaConfig {
    fn default() -> Self {
        Self {
            default_ceiling: 10 * MIB,
            strict: true,
        }
    }
}

/// Upload configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct UploadConfig {
    pub max_file_size: u64,
    /// Reject uploads whose declared media type disagrees with their bytes
    pub verify_media_type: bool,
}

impl Default for UploadConfig {
    fn default() -> Self {
        Self {
            max_file_size: 50 * MIB,
            verify_media_type: true,
        }
    }
}

/// Background reconciliation
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconcileConfig {
    /// Blobs younger than this are never treated as orphans, so an upload
    /// between publish and ledger insert is left alone.
    pub grace_period_secs: u64,
}

impl Default for ReconcileConfig {
    fn default() -> Self {
        Self {
            grace_period_secs: 3600,
        }
    }
}
