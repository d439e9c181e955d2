//! Configuration loader utilities

use crate::{Config, ConfigBuilder, ConfigError, ConfigResult};
use std::path::{Path, PathBuf};

/// Environment variable prefix for overrides
pub const ENV_PREFIX: &str = "MODSYNC";

/// Configuration loader with common loading patterns
pub struct ConfigLoader;

impl ConfigLoader {
    /// Load configuration from the first default location that exists
    pub fn load_default() -> ConfigResult<Config> {
        let mut builder = ConfigBuilder::new().add_defaults();

        if let Some(path) = Self::config_exists() {
            builder = builder.add_source_file(path);
        }

        builder.add_env_prefix(ENV_PREFIX).build()
    }

    /// Load configuration from a specific file
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> ConfigResult<Config> {
        let path = path.as_ref();

        if !path.exists() {
            return Err(ConfigError::Io {
                path: path.to_path_buf(),
                source: std::io::Error::new(
                    std::io::ErrorKind::NotFound,
                    "Configuration file not found",
                ),
            });
        }

        ConfigBuilder::new()
            .add_defaults()
            .add_source_file(path)
            .add_env_prefix(ENV_PREFIX)
            .build()
    }

    /// Save configuration to a file; the format follows the extension
    pub fn save_to_file<P: AsRef<Path>>(config: &Config, path: P) -> ConfigResult<()> {
        let path = path.as_ref();

        let content = match path.extension().and_then(|ext| ext.to_str()) {
            Some("toml") => toml::to_string_pretty(config).map_err(|e| ConfigError::Serialization {
                message: format!("Failed to serialize to TOML: {e}"),
            })?,
            Some("json") => serde_json::to_string_pretty(config)?,
            _ => serde_yaml::to_string(config)?,
        };

        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|e| ConfigError::Io {
                path: parent.to_path_buf(),
                source: e,
            })?;
        }

        std::fs::write(path, content).map_err(|e| ConfigError::Io {
            path: path.to_path_buf(),
            source: e,
        })
    }

    /// Parse a configuration file without layering defaults or environment
    pub fn parse_file<P: AsRef<Path>>(path: P) -> ConfigResult<Config> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::Io {
            path: path.to_path_buf(),
            source: e,
        })?;

        let parsed = match path.extension().and_then(|ext| ext.to_str()) {
            Some("toml") => toml::from_str(&content).map_err(|e| e.to_string()),
            Some("json") => serde_json::from_str(&content).map_err(|e| e.to_string()),
            _ => serde_yaml::from_str(&content).map_err(|e| e.to_string()),
        };

        let config = parsed.map_err(|message| ConfigError::Parse {
            path: path.to_path_buf(),
            message,
        })?;
        ConfigBuilder::validate(&config)?;
        Ok(config)
    }

    /// Generate a default configuration file
    pub fn generate_default_config<P: AsRef<Path>>(path: P) -> ConfigResult<()> {
        Self::save_to_file(&Config::default(), path)
    }

    /// Preferred location for a new configuration file
    pub fn default_config_path() -> PathBuf {
        dirs::config_dir().map_or_else(
            || PathBuf::from("modsync.yaml"),
            |dir| dir.join("modsync").join("config.yaml"),
        )
    }

    /// Get default configuration file paths in order of preference
    fn get_default_config_paths() -> Vec<PathBuf> {
        let mut paths = vec![
            PathBuf::from("modsync.yaml"),
            PathBuf::from("modsync.yml"),
            PathBuf::from("modsync.toml"),
            PathBuf::from("modsync.json"),
        ];

        if let Some(config_dir) = dirs::config_dir() {
            let modsync_dir = config_dir.join("modsync");
            paths.push(modsync_dir.join("config.yaml"));
            paths.push(modsync_dir.join("config.yml"));
            paths.push(modsync_dir.join("config.toml"));
        }

        paths
    }

    /// Check if a configuration file exists in default locations
    pub fn config_exists() -> Option<PathBuf> {
        Self::get_default_config_paths()
            .into_iter()
            .find(|path| path.exists())
    }
}

mod dirs {
    use std::path::PathBuf;

    pub fn config_dir() -> Option<PathBuf> {
        #[cfg(target_os = "windows")]
        {
            std::env::var("APPDATA").ok().map(PathBuf::from)
        }
        #[cfg(target_os = "macos")]
        {
            std::env::var("HOME").ok().map(|home| {
                PathBuf::from(home)
                    .join("Library")
                    .join("Application Support")
            })
        }
        #[cfg(not(any(target_os = "windows", target_os = "macos")))]
        {
            std::env::var("XDG_CONFIG_HOME")
                .ok()
                .map(PathBuf::from)
                .or_else(|| {
                    std::env::var("HOME")
                        .ok()
                        .map(|home| PathBuf::from(home).join(".config"))
                })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use modsync_types::ModpackDefinition;
    use rstest::rstest;
    use tempfile::TempDir;

    fn sample_config() -> Config {
        let mut config = Config::default();
        config.connection.address = "/srv/repository".to_string();
        config.local_base = PathBuf::from("/games/ai");
        config.packs.push(ModpackDefinition::new(
            "Main",
            "mods/Sideloader Modpack",
            "mods/Sideloader Modpack",
            true,
        ));
        config.download.fault_budget = 7;
        config
    }

    #[rstest]
    #[case("config.yaml")]
    #[case("config.toml")]
    #[case("config.json")]
    fn test_save_and_parse(#[case] name: &str) {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nested").join(name);

        ConfigLoader::save_to_file(&sample_config(), &path).unwrap();
        let loaded = ConfigLoader::parse_file(&path).unwrap();

        assert_eq!(loaded.connection.address, "/srv/repository");
        assert_eq!(loaded.packs, sample_config().packs);
        assert_eq!(loaded.download.fault_budget, 7);
        assert_eq!(loaded.local_base, PathBuf::from("/games/ai"));
    }

    #[test]
    fn test_load_from_file_layers_defaults() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("modsync.toml");
        std::fs::write(&path, "local_base = \"/games/hs2\"\n").unwrap();

        let config = ConfigLoader::load_from_file(&path).unwrap();
        assert_eq!(config.local_base, PathBuf::from("/games/hs2"));
        assert_eq!(config.connection.max_connections, 5);
    }

    #[test]
    fn test_load_missing_file() {
        let result = ConfigLoader::load_from_file("/nonexistent/modsync.yaml");
        assert!(matches!(result, Err(ConfigError::Io { .. })));
    }

    #[test]
    fn test_parse_reports_path_on_garbage() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("broken.json");
        std::fs::write(&path, "{ not json").unwrap();

        let error = ConfigLoader::parse_file(&path).unwrap_err();
        assert!(matches!(error, ConfigError::Parse { .. }));
        assert!(error.to_string().contains("broken.json"));
    }
}
