//! # funex-config
//!
//! Configuration management for the Funex space map.
//!
//! Loads configuration from:
//! 1. `~/.funex/config.toml` (global)
//! 2. `.funex/config.toml` (project-local, overrides global)
//! 3. Environment variables (highest priority)

pub mod logging;
pub mod testing;

pub use logging::{init_logging, init_test_logging, Component, LogLevel};

use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::RwLock;
use tracing::debug;

/// Global config instance
static CONFIG: Lazy<RwLock<Config>> = Lazy::new(|| RwLock::new(Config::load().unwrap_or_default()));

/// Get global config (read-only)
pub fn config() -> std::sync::RwLockReadGuard<'static, Config> {
    // A poisoned lock still holds a fully written config
    CONFIG.read().unwrap_or_else(|e| e.into_inner())
}

/// Reload config from disk
pub fn reload() -> Result<(), ConfigError> {
    let new_config = Config::load()?;
    *CONFIG.write().unwrap_or_else(|e| e.into_inner()) = new_config;
    Ok(())
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),
    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Main configuration structure
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub space: SpaceConfig,
    pub logging: LoggingConfig,
}

impl Config {
    /// Load config from standard locations
    pub fn load() -> Result<Self, ConfigError> {
        let mut config = Config::default();

        // 1. Load global config (~/.funex/config.toml)
        if let Some(global_path) = Self::global_config_path() {
            if global_path.exists() {
                debug!("Loading global config from {:?}", global_path);
                config = Self::load_from(&global_path)?;
            }
        }

        // 2. Load project config (.funex/config.toml) - overrides global
        let project_path = Path::new(".funex/config.toml");
        if project_path.exists() {
            debug!("Loading project config from {:?}", project_path);
            let project_config = Self::load_from(project_path)?;
            config.merge(project_config);
        }

        // 3. Apply environment variable overrides
        config.apply_env_overrides();

        config.validate()?;
        Ok(config)
    }

    /// Load a single config file without consulting the standard locations
    pub fn load_from<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&contents)?;
        Ok(config)
    }

    /// Global config path: ~/.funex/config.toml
    pub fn global_config_path() -> Option<PathBuf> {
        dirs::home_dir().map(|h| h.join(".funex/config.toml"))
    }

    /// Merge another config (project overrides)
    ///
    /// Merges field by field: values left at their defaults in `other` keep
    /// the current values.
    pub fn merge(&mut self, other: Config) {
        self.space.merge(other.space);
        if other.logging.level != LoggingConfig::default().level {
            self.logging.level = other.logging.level;
        }
    }

    /// Apply environment variable overrides
    fn apply_env_overrides(&mut self) {
        if let Some(n) = env_parse("FUNEX_FRAGMENT_SIZE") {
            self.space.fragment_size = n;
        }
        if let Some(n) = env_parse("FUNEX_BLOCK_FRAGMENTS") {
            self.space.block_fragments = n;
        }
        if let Some(n) = env_parse("FUNEX_REGION_BLOCKS") {
            self.space.region_blocks = n;
        }
        if let Ok(level) = std::env::var("FUNEX_LOG") {
            if let Some(level) = LogLevel::parse(&level) {
                self.logging.level = level;
            }
        }
    }

    /// Reject values no geometry could be built from
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.space.fragment_size == 0 {
            return Err(ConfigError::Invalid("space.fragment_size is zero".into()));
        }
        if self.space.block_fragments == 0 {
            return Err(ConfigError::Invalid("space.block_fragments is zero".into()));
        }
        if self.space.region_blocks == 0 {
            return Err(ConfigError::Invalid("space.region_blocks is zero".into()));
        }
        Ok(())
    }

    /// Generate default config TOML string
    pub fn default_toml() -> String {
        toml::to_string_pretty(&Config::default()).unwrap_or_default()
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|v| v.parse().ok())
}

/// Region geometry of a space map
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SpaceConfig {
    /// Minimal allocation unit, in bytes
    pub fragment_size: u32,
    /// Fragments per physical block
    pub block_fragments: u32,
    /// Blocks governed by a single space map, including its own block
    pub region_blocks: u64,
}

impl SpaceConfig {
    fn merge(&mut self, other: SpaceConfig) {
        let defaults = SpaceConfig::default();
        if other.fragment_size != defaults.fragment_size {
            self.fragment_size = other.fragment_size;
        }
        if other.block_fragments != defaults.block_fragments {
            self.block_fragments = other.block_fragments;
        }
        if other.region_blocks != defaults.region_blocks {
            self.region_blocks = other.region_blocks;
        }
    }
}

impl Default for SpaceConfig {
    fn default() -> Self {
        Self {
            fragment_size: 512,
            block_fragments: 16,
            region_blocks: 128,
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Default level when `RUST_LOG` is unset
    pub level: LogLevel,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: LogLevel::Warn,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.space.fragment_size, 512);
        assert_eq!(config.space.block_fragments, 16);
        assert_eq!(config.space.region_blocks, 128);
        assert_eq!(config.logging.level, LogLevel::Warn);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_default_toml_generation() {
        let toml_str = Config::default_toml();
        assert!(toml_str.contains("[space]"));
        assert!(toml_str.contains("[logging]"));
        assert!(toml_str.contains("fragment_size = 512"));
    }

    #[test]
    fn test_toml_roundtrip() {
        let config = Config::default();
        let toml_str = toml::to_string(&config).unwrap();
        let parsed: Config = toml::from_str(&toml_str).unwrap();
        assert_eq!(config, parsed);
    }

    #[test]
    fn test_merge_keeps_default_sections() {
        let mut config = Config::default();
        config.space.region_blocks = 64;

        let mut project = Config::default();
        project.logging.level = LogLevel::Debug;
        config.merge(project);

        assert_eq!(config.space.region_blocks, 64);
        assert_eq!(config.logging.level, LogLevel::Debug);
    }

    #[test]
    fn test_merge_space_field_by_field() {
        let mut config = Config::default();
        config.space.fragment_size = 1024;

        let mut project = Config::default();
        project.space.region_blocks = 64;
        config.merge(project);

        assert_eq!(config.space.fragment_size, 1024);
        assert_eq!(config.space.region_blocks, 64);
        assert_eq!(config.space.block_fragments, 16);
    }

    #[test]
    fn test_global_config_is_valid() {
        // Falls back to defaults when the files on disk are unusable
        assert!(config().validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_zero() {
        let mut config = Config::default();
        config.space.block_fragments = 0;
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
    }
}
