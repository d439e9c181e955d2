//! Configuration management for modsync
//!
//! This crate loads the static inputs of a sync run: where the repository is, which
//! packs map to which local directories, and how hard the engine should work.
//!
//! # Features
//!
//! - **Multiple formats**: YAML, TOML and JSON configuration files
//! - **Validation**: Rejects configurations the engine cannot run with
//! - **Environment overrides**: Override any value with `MODSYNC` prefixed variables
//! - **Defaults**: Every section has a usable default
//!
//! # Examples
//!
//! ```rust,no_run
//! use modsync_config::ConfigBuilder;
//!
//! let config = ConfigBuilder::new()
//!     .add_defaults()
//!     .add_source_file("modsync.yaml")
//!     .add_env_prefix("MODSYNC")
//!     .build()
//!     .expect("Failed to load configuration");
//!
//! println!("Repository: {}", config.connection.address);
//! ```

#![deny(missing_docs)]
#![warn(clippy::all, clippy::pedantic, clippy::nursery)]
#![allow(clippy::module_name_repetitions)]

use modsync_types::{
    DownloadConfig, ModpackDefinition, PathMapping, ProgressConfig, RepoConnectionInfo,
    RetryConfig, ScanConfig,
};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

pub mod builder;
pub mod error;
pub mod loader;

pub use builder::ConfigBuilder;
pub use error::{ConfigError, ConfigResult};
pub use loader::ConfigLoader;

/// Main configuration structure for modsync
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Remote repository connection
    pub connection: RepoConnectionInfo,
    /// Local game directory every pack is relative to
    pub local_base: PathBuf,
    /// Packs to keep in sync
    pub packs: Vec<ModpackDefinition>,
    /// Scanner tuning
    pub scan: ScanConfig,
    /// Download tuning
    pub download: DownloadConfig,
    /// Connection retry policy
    pub retry: RetryConfig,
    /// Progress reporting cadence
    pub progress: ProgressConfig,
    /// Logging configuration
    pub logging: LoggingConfig,
    /// Number of deletions above which the user is asked to confirm
    pub deletion_confirm_threshold: usize,
}

impl Config {
    /// Root mappings of every configured pack
    pub fn root_mappings(&self) -> Vec<PathMapping> {
        self.packs
            .iter()
            .map(|pack| pack.to_mapping(&self.connection, &self.local_base))
            .collect()
    }

    /// Number of scanner workers after applying the connection limit
    pub fn scan_workers(&self) -> usize {
        effective_workers(self.scan.workers, self.connection.max_connections)
    }

    /// Number of download workers after applying the connection limit
    pub fn download_workers(&self) -> usize {
        effective_workers(self.download.workers, self.connection.max_connections)
    }
}

fn effective_workers(requested: usize, max_connections: usize) -> usize {
    let limit = max_connections.max(1);
    if requested == 0 {
        limit
    } else {
        requested.min(limit)
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            connection: RepoConnectionInfo::default(),
            local_base: PathBuf::from("."),
            packs: Vec::new(),
            scan: ScanConfig::default(),
            download: DownloadConfig::default(),
            retry: RetryConfig::default(),
            progress: ProgressConfig::default(),
            logging: LoggingConfig::default(),
            deletion_confirm_threshold: 100,
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level
    pub level: String,
    /// Directory for rolling log files; console only when unset
    #[serde(skip_serializing_if = "Option::is_none")]
    pub directory: Option<PathBuf>,
    /// File name prefix of the rolling log files
    pub file_prefix: String,
    /// Enable JSON formatting for the log file
    pub json_format: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            directory: None,
            file_prefix: "modsync.log".to_string(),
            json_format: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.connection.max_connections, 5);
        assert_eq!(config.deletion_confirm_threshold, 100);
        assert!(config.packs.is_empty());
        assert_eq!(config.logging.level, "info");
    }

    #[test]
    fn test_effective_workers() {
        assert_eq!(effective_workers(0, 5), 5);
        assert_eq!(effective_workers(3, 5), 3);
        assert_eq!(effective_workers(8, 5), 5);
        assert_eq!(effective_workers(0, 0), 1);
    }

    #[test]
    fn test_root_mappings_follow_packs() {
        let mut config = Config::default();
        config.local_base = PathBuf::from("/games/ai");
        config.packs.push(ModpackDefinition::new(
            "Main",
            "mods/Sideloader Modpack",
            "mods/Sideloader Modpack",
            true,
        ));
        config.packs.push(ModpackDefinition::new("UserData", "UserData", "UserData", false));

        let roots = config.root_mappings();
        assert_eq!(roots.len(), 2);
        assert!(roots[0].delete_client_files());
        assert!(!roots[1].delete_client_files());
        assert_eq!(roots[1].remote_full_path(), "/AI/UserData");
    }
}
