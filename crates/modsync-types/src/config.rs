//! Configuration types for modsync
//!
//! These are the plain, serializable knobs consumed by the sync engine. Loading them
//! from disk is the job of `modsync-config`; the engine only reads them.

// Serde is imported conditionally through cfg_attr
use std::time::Duration;

/// Default size of a download chunk (10 MiB)
pub const DEFAULT_CHUNK_SIZE: u32 = 10 * 1024 * 1024;

/// Default size of a copy buffer (64 KiB)
pub const DEFAULT_BUFFER_SIZE: usize = 64 * 1024;

/// Connection descriptor for the remote repository
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct RepoConnectionInfo {
    /// Server address or location of the repository
    pub address: String,
    /// Login name
    pub username: String,
    /// Login password
    pub password: String,
    /// Server port
    pub port: u16,
    /// Remote directory all pack paths are relative to
    pub root_path: String,
    /// Upper bound on simultaneous connections
    pub max_connections: usize,
}

impl RepoConnectionInfo {
    /// Create a connection descriptor with default credentials
    pub fn new(address: impl Into<String>, root_path: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            root_path: root_path.into(),
            ..Self::default()
        }
    }

    /// Set the login credentials
    pub fn with_credentials(
        mut self,
        username: impl Into<String>,
        password: impl Into<String>,
    ) -> Self {
        self.username = username.into();
        self.password = password.into();
        self
    }

    /// Set the maximum number of connections
    pub fn with_max_connections(mut self, max_connections: usize) -> Self {
        self.max_connections = max_connections;
        self
    }
}

impl Default for RepoConnectionInfo {
    fn default() -> Self {
        Self {
            address: "sideload.betterrepack.com".to_string(),
            username: "sideloader".to_string(),
            password: "sideloader3".to_string(),
            port: 2121,
            root_path: "/AI/".to_string(),
            max_connections: 5,
        }
    }
}

/// Retry configuration for connection establishment
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct RetryConfig {
    /// Maximum number of retries after the first attempt
    pub max_retries: u32,
    /// Initial delay between retries in milliseconds
    pub initial_delay_ms: u64,
    /// Maximum delay between retries in milliseconds
    pub max_delay_ms: u64,
    /// Backoff multiplier
    pub backoff_multiplier: f64,
}

impl RetryConfig {
    /// Create a new retry configuration
    pub fn new(
        max_retries: u32,
        initial_delay: Duration,
        max_delay: Duration,
        backoff_multiplier: f64,
    ) -> Result<Self, String> {
        if backoff_multiplier < 1.0 {
            return Err("Backoff multiplier must be at least 1.0".to_string());
        }
        if initial_delay > max_delay {
            return Err("Initial delay cannot be greater than max delay".to_string());
        }
        Ok(Self {
            max_retries,
            initial_delay_ms: duration_to_ms(initial_delay),
            max_delay_ms: duration_to_ms(max_delay),
            backoff_multiplier,
        })
    }

    /// Retry without waiting; useful for tests
    pub fn immediate(max_retries: u32) -> Self {
        Self {
            max_retries,
            initial_delay_ms: 0,
            max_delay_ms: 0,
            backoff_multiplier: 1.0,
        }
    }

    /// Calculate the delay for a given retry attempt (zero-based)
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::from_millis(self.initial_delay_ms);
        }

        let exponent = i32::try_from(attempt).unwrap_or(i32::MAX);
        let delay_ms = self.initial_delay_ms as f64 * self.backoff_multiplier.powi(exponent);
        let delay_ms = delay_ms.min(self.max_delay_ms as f64);
        Duration::from_millis(delay_ms as u64)
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_delay_ms: 1000,
            max_delay_ms: 8000,
            backoff_multiplier: 2.0,
        }
    }
}

/// Remote scanner tuning
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct ScanConfig {
    /// Number of scanner workers; zero means use the connection limit
    pub workers: usize,
    /// Sleep between queue polls while a worker is idle, in milliseconds
    pub idle_poll_ms: u64,
    /// How many times an empty listing is re-queued before it is believed
    pub empty_listing_retries: u32,
    /// Listing attempts per directory before a transient fault becomes fatal
    pub max_listing_attempts: u32,
    /// Pause before re-queueing a directory whose listing failed, in milliseconds
    pub requeue_delay_ms: u64,
}

impl ScanConfig {
    /// Idle poll interval
    pub fn idle_poll(&self) -> Duration {
        Duration::from_millis(self.idle_poll_ms)
    }

    /// Delay before re-queueing a failed listing
    pub fn requeue_delay(&self) -> Duration {
        Duration::from_millis(self.requeue_delay_ms)
    }
}

impl Default for ScanConfig {
    fn default() -> Self {
        Self {
            workers: 0,
            idle_poll_ms: 500,
            empty_listing_retries: 2,
            max_listing_attempts: 3,
            requeue_delay_ms: 100,
        }
    }
}

/// Chunk download tuning
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct DownloadConfig {
    /// Number of download workers; zero means use the connection limit
    pub workers: usize,
    /// Copy buffer size in bytes
    pub buffer_size: usize,
    /// Chunk size in bytes
    pub chunk_size: u32,
    /// Extra attempts at opening a remote range stream
    pub open_retries: u32,
    /// Mid-chunk failures tolerated across the whole run
    pub fault_budget: u32,
}

impl Default for DownloadConfig {
    fn default() -> Self {
        Self {
            workers: 0,
            buffer_size: DEFAULT_BUFFER_SIZE,
            chunk_size: DEFAULT_CHUNK_SIZE,
            open_retries: 2,
            fault_budget: 3,
        }
    }
}

/// Progress reporting cadence
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct ProgressConfig {
    /// Minimum interval between UI updates, in milliseconds
    pub update_interval_ms: u64,
    /// Interval at which instantaneous speed is sampled, in milliseconds
    pub speed_sample_ms: u64,
}

impl ProgressConfig {
    /// UI update interval
    pub fn update_interval(&self) -> Duration {
        Duration::from_millis(self.update_interval_ms)
    }

    /// Speed sample interval
    pub fn speed_sample(&self) -> Duration {
        Duration::from_millis(self.speed_sample_ms)
    }
}

impl Default for ProgressConfig {
    fn default() -> Self {
        Self {
            update_interval_ms: 100,
            speed_sample_ms: 1000,
        }
    }
}

fn duration_to_ms(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}
