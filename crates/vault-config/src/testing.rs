//! Test environment abstraction for isolated testing.
//!
//! Provides `TestEnvironment` to manage:
//! - A temporary blob root and ledger directory
//! - A matching `Config`
//! - Scratch files to upload
//!
//! # Usage
//!
//! ```ignore
//! use vault_config::testing::TestEnvironment;
//!
//! #[test]
//! fn test_something() {
//!     let env = TestEnvironment::new().unwrap();
//!     let config = env.config();
//!     // config.storage.root and ledger_path() point into env's temp dir
//! }
//! ```

use std::path::PathBuf;
use std::sync::atomic::{AtomicU32, Ordering};
use tempfile::TempDir;

use crate::Config;

/// Atomic counter for unique test IDs
static TEST_COUNTER: AtomicU32 = AtomicU32::new(0);

/// Isolated test environment with unique paths
pub struct TestEnvironment {
    /// Temporary directory (dropped on cleanup)
    _temp_dir: TempDir,
    /// Blob repository root
    pub store_root: PathBuf,
    /// LMDB directory
    pub ledger_dir: PathBuf,
    /// Scratch area for source files
    pub work_dir: PathBuf,
    /// Unique test ID
    pub test_id: u32,
}

impl TestEnvironment {
    /// Create a new isolated test environment
    pub fn new() -> anyhow::Result<Self> {
        let test_id = TEST_COUNTER.fetch_add(1, Ordering::Relaxed);
        let temp_dir = TempDir::new()?;
        let root = temp_dir.path();

        let store_root = root.join("store");
        let ledger_dir = root.join("ledger");
        let work_dir = root.join("work");

        std::fs::create_dir_all(&store_root)?;
        std::fs::create_dir_all(&work_dir)?;

        Ok(Self {
            _temp_dir: temp_dir,
            store_root,
            ledger_dir,
            work_dir,
            test_id,
        })
    }

    /// Default config pointed at this environment's directories.
    ///
    /// The map size is kept small so many environments can coexist.
    pub fn config(&self) -> Config {
        let mut cfg = Config::default();
        cfg.storage.root = self.store_root.clone();
        cfg.storage.ledger = Some(self.ledger_dir.clone());
        cfg.storage.map_size = 64 * 1024 * 1024;
        cfg
    }

    /// Create a scratch file with content
    pub fn create_file(&self, relative_path: &str, content: &[u8]) -> anyhow::Result<PathBuf> {
        let path = self.work_dir.join(relative_path);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(&path, content)?;
        Ok(path)
    }

    /// Write `config` as TOML into the scratch area and return its path.
    pub fn write_config(&self, config: &Config) -> anyhow::Result<PathBuf> {
        let path = self.work_dir.join(".vault").join("config.toml");
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(&path, config.to_toml()?)?;
        Ok(path)
    }
}
