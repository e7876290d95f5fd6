//! Test environment abstraction for isolated testing.
//!
//! Provides `TestEnvironment` to manage:
//! - Temporary snapshot directories
//! - Throwaway config files
//!
//! # Usage
//!
//! ```ignore
//! use funex_config::testing::TestEnvironment;
//!
//! #[test]
//! fn test_something() {
//!     let env = TestEnvironment::new().unwrap();
//!     let path = env.snapshot_path("region-0");
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
    /// Root of the environment
    pub root: PathBuf,
    /// Directory for space-map snapshot images
    pub snapshot_dir: PathBuf,
    /// Directory holding `config.toml`
    pub config_dir: PathBuf,
    /// Unique test ID
    pub test_id: u32,
}

impl TestEnvironment {
    /// Create a new isolated test environment
    pub fn new() -> anyhow::Result<Self> {
        let test_id = TEST_COUNTER.fetch_add(1, Ordering::Relaxed);
        let temp_dir = TempDir::new()?;
        let root = temp_dir.path().to_path_buf();

        let snapshot_dir = root.join("snapshots");
        let config_dir = root.join(".funex");

        std::fs::create_dir_all(&snapshot_dir)?;
        std::fs::create_dir_all(&config_dir)?;

        Ok(Self {
            _temp_dir: temp_dir,
            root,
            snapshot_dir,
            config_dir,
            test_id,
        })
    }

    /// Path for a named snapshot image
    pub fn snapshot_path(&self, name: &str) -> PathBuf {
        self.snapshot_dir
            .join(format!("{}-{}.spmap", name, self.test_id))
    }

    /// Path of the environment's config file
    pub fn config_path(&self) -> PathBuf {
        self.config_dir.join("config.toml")
    }

    /// Write `contents` as the environment's config file
    pub fn write_config(&self, contents: &str) -> anyhow::Result<PathBuf> {
        let path = self.config_path();
        std::fs::write(&path, contents)?;
        Ok(path)
    }

    /// Load the environment's config file, validated
    pub fn load_config(&self) -> anyhow::Result<Config> {
        let config = Config::load_from(self.config_path())?;
        config.validate()?;
        Ok(config)
    }
}

impl Default for TestEnvironment {
    fn default() -> Self {
        Self::new().expect("Failed to create test environment")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_environment_creates_directories() {
        let env = TestEnvironment::new().unwrap();
        assert!(env.snapshot_dir.exists());
        assert!(env.config_dir.exists());
    }

    #[test]
    fn test_environment_has_unique_snapshot_paths() {
        let env1 = TestEnvironment::new().unwrap();
        let env2 = TestEnvironment::new().unwrap();
        assert_ne!(env1.snapshot_path("r0"), env2.snapshot_path("r0"));
    }

    #[test]
    fn test_write_and_load_config() {
        let env = TestEnvironment::new().unwrap();
        env.write_config("[space]\nregion_blocks = 32\n").unwrap();
        let config = env.load_config().unwrap();
        assert_eq!(config.space.region_blocks, 32);
        assert_eq!(config.space.fragment_size, 512);
    }

    #[test]
    fn test_load_config_rejects_invalid() {
        let env = TestEnvironment::new().unwrap();
        env.write_config("[space]\nfragment_size = 0\n").unwrap();
        assert!(env.load_config().is_err());
    }
}
