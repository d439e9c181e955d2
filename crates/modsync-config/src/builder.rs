//! Configuration builder for layered configuration loading

use crate::{Config, ConfigError, ConfigResult};
use config::{ConfigBuilder as ConfigBuilderInner, Environment, File, FileFormat};
use std::collections::HashSet;
use std::path::{Component, Path, PathBuf};

/// Configuration builder for loading configuration from multiple sources
///
/// Sources are layered in the order they are added, on top of [`Config::default`].
/// Missing files are skipped silently; use [`crate::ConfigLoader::load_from_file`]
/// when a file must exist.
#[derive(Debug)]
pub struct ConfigBuilder {
    inner: ConfigBuilderInner<config::builder::DefaultState>,
    sources: Vec<ConfigSource>,
    env_separator: String,
}

#[derive(Debug, Clone)]
enum ConfigSource {
    File { path: PathBuf, format: FileFormat },
    Defaults,
    Environment { prefix: String },
}

impl ConfigBuilder {
    /// Create a new configuration builder
    pub fn new() -> Self {
        Self {
            inner: config::Config::builder(),
            sources: Vec::new(),
            env_separator: "__".to_string(),
        }
    }

    /// Add default configuration values
    pub fn add_defaults(mut self) -> Self {
        self.sources.push(ConfigSource::Defaults);
        self
    }

    /// Add a configuration file source
    pub fn add_source_file<P: AsRef<Path>>(mut self, path: P) -> Self {
        let path = path.as_ref().to_path_buf();
        let format = Self::detect_format(&path);
        self.sources.push(ConfigSource::File { path, format });
        self
    }

    /// Add environment variable source with prefix
    pub fn add_env_prefix<S: Into<String>>(mut self, prefix: S) -> Self {
        self.sources.push(ConfigSource::Environment {
            prefix: prefix.into(),
        });
        self
    }

    /// Set environment variable separator (default: "__")
    pub fn env_separator<S: Into<String>>(mut self, separator: S) -> Self {
        self.env_separator = separator.into();
        self
    }

    /// Build the configuration
    pub fn build(mut self) -> ConfigResult<Config> {
        let defaults_value = serde_yaml::to_value(Config::default())
            .map_err(|e| ConfigError::other(format!("Failed to serialize defaults: {e}")))?;
        self.inner = self
            .inner
            .add_source(config::Config::try_from(&defaults_value)?);

        for source in &self.sources {
            match source {
                ConfigSource::File { path, format } => {
                    if path.exists() {
                        self.inner = self
                            .inner
                            .add_source(File::from(path.clone()).format(*format));
                    }
                }
                ConfigSource::Environment { prefix } => {
                    self.inner = self.inner.add_source(
                        Environment::with_prefix(prefix)
                            .separator(&self.env_separator)
                            .try_parsing(true),
                    );
                }
                ConfigSource::Defaults => {}
            }
        }

        let config = self.inner.build()?;
        let result: Config = config.try_deserialize()?;

        Self::validate(&result)?;

        Ok(result)
    }

    /// Detect file format from extension
    pub(crate) fn detect_format(path: &Path) -> FileFormat {
        match path.extension().and_then(|ext| ext.to_str()) {
            Some("toml") => FileFormat::Toml,
            Some("json") => FileFormat::Json,
            _ => FileFormat::Yaml,
        }
    }

    /// Validate the configuration
    pub(crate) fn validate(config: &Config) -> ConfigResult<()> {
        if config.connection.max_connections == 0 {
            return Err(ConfigError::invalid_value(
                "connection.max_connections",
                "must be greater than 0",
            ));
        }

        if config.connection.address.trim().is_empty() {
            return Err(ConfigError::invalid_value(
                "connection.address",
                "must not be empty",
            ));
        }

        if config.download.chunk_size == 0 {
            return Err(ConfigError::invalid_value(
                "download.chunk_size",
                "must be greater than 0",
            ));
        }

        if config.download.buffer_size < 4096 {
            return Err(ConfigError::invalid_value(
                "download.buffer_size",
                "must be at least 4096 bytes",
            ));
        }

        if config.scan.max_listing_attempts == 0 {
            return Err(ConfigError::invalid_value(
                "scan.max_listing_attempts",
                "must be at least 1",
            ));
        }

        if config.retry.backoff_multiplier < 1.0
            || config.retry.initial_delay_ms > config.retry.max_delay_ms
        {
            return Err(ConfigError::validation(
                "retry backoff must not shrink and initial delay must not exceed max delay",
            ));
        }

        if !["trace", "debug", "info", "warn", "error"].contains(&config.logging.level.as_str()) {
            return Err(ConfigError::validation(
                "Log level must be one of: trace, debug, info, warn, error",
            ));
        }

        let mut names = HashSet::new();
        for pack in &config.packs {
            if !names.insert(pack.name.as_str()) {
                return Err(ConfigError::validation(format!(
                    "Pack '{}' is defined more than once",
                    pack.name
                )));
            }
            for relative in [&pack.local_relative_path, &pack.remote_relative_path] {
                if escapes_base(relative) {
                    return Err(ConfigError::invalid_value(
                        format!("packs.{}", pack.name),
                        format!("path '{relative}' must stay inside its base directory"),
                    ));
                }
            }
        }

        Ok(())
    }
}

fn escapes_base(relative: &str) -> bool {
    Path::new(relative)
        .components()
        .any(|c| matches!(c, Component::ParentDir | Component::Prefix(_)))
}

impl Default for ConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}
