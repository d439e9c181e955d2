//! Core type system and error handling for modsync
//!
//! This crate provides the foundational types shared by every modsync crate:
//!
//! - **Error handling**: One error enum with an explicit kind, used to tell retryable faults from fatal ones
//! - **Path model**: Immutable mappings between the remote repository and the local tree
//! - **Chunk model**: Decomposition of a remote file into fixed-size download ranges
//! - **Capabilities**: Async traits for the protocol client and the progress sink
//! - **Configuration**: Serializable tuning knobs for scanning, downloading and reporting
//!
//! # Features
//!
//! - `std` (default): Enable standard library features
//! - `async`: Enable the async protocol-client traits
//! - `serde`: Enable serialization support
//!
//! # Examples
//!
//! ```rust
//! use modsync_types::{FileDownload, PathMapping, Result};
//!
//! fn plan() -> Result<usize> {
//!     let mapping = PathMapping::new("/AI/", "/games/ai", "mods/a.zipmod", "mods/a.zipmod")
//!         .with_size(Some(24 * 1024 * 1024));
//!     let download = FileDownload::from_mapping(&mapping, 10 * 1024 * 1024)?;
//!     Ok(download.chunks().len()) // 3
//! }
//! ```

#![deny(missing_docs)]
#![warn(clippy::all, clippy::pedantic, clippy::nursery)]
#![allow(clippy::module_name_repetitions)]

pub mod config;
pub mod error;
pub mod result;
pub mod traits;
pub mod types;

// Re-export commonly used types
pub use config::{
    DownloadConfig, ProgressConfig, RepoConnectionInfo, RetryConfig, ScanConfig,
    DEFAULT_BUFFER_SIZE, DEFAULT_CHUNK_SIZE,
};
pub use error::{Error, ErrorContext, ErrorKind, ErrorSeverity};
pub use result::Result;
pub use traits::*;
pub use types::*;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_severity() {
        let io_error = Error::from(std::io::Error::new(std::io::ErrorKind::Other, "test"));
        assert_eq!(io_error.severity(), ErrorSeverity::Medium);

        let config_error = Error::config("invalid config");
        assert_eq!(config_error.severity(), ErrorSeverity::High);
        assert!(!config_error.is_recoverable());
    }

    #[test]
    fn test_null_observer_accepts_everything() {
        let observer = NullObserver;
        assert!(observer
            .bytes_written(std::path::Path::new("a"), 10, 10)
            .is_ok());
    }
}
