//! Remote scanning, reconciliation and the sync pipeline for modsync
//!
//! This crate turns a remote repository and a set of pack roots into a local tree
//! that matches it:
//!
//! - **Remote Scanning**: a worker pool walks the remote trees into a flat file index
//! - **Reconciliation**: the index is compared against the local files by size
//! - **Deletion**: extra local files go away under packs that allow it, inside a hard-abort scope
//! - **Chunked Downloads**: missing or changed files are fetched in parallel, chunk by chunk
//! - **Progress Tracking**: per-file and run-wide byte counts, speed and ETA
//!
//! # Examples
//!
//! ```rust,no_run
//! use modsync_config::ConfigLoader;
//! use modsync_engine::CancelScopeStack;
//! use modsync_network::MirrorClientFactory;
//! use modsync_sync::{DownloadProgress, SyncEngine, SyncOptions, SyncSettings};
//! use std::sync::Arc;
//! use tokio_util::sync::CancellationToken;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let config = ConfigLoader::load_default()?;
//! let factory = Arc::new(MirrorClientFactory::from_connection(&config.connection)?);
//! let engine = SyncEngine::new(
//!     SyncSettings::from_config(&config),
//!     factory,
//!     CancelScopeStack::new(CancellationToken::new()),
//! );
//! let report = engine
//!     .sync(SyncOptions::new(), DownloadProgress::new(config.progress.clone()))
//!     .await;
//! println!("{report}");
//! # Ok(())
//! # }
//! ```

#![deny(missing_docs)]
#![warn(clippy::all, clippy::pedantic, clippy::nursery)]
#![allow(clippy::module_name_repetitions)]

pub mod diff;
pub mod engine;
pub mod progress;
pub mod scanner;

pub use diff::{DiffEngine, DiffResult};
pub use engine::{
    PackRoot, PackTotals, ScanOutcome, SyncEngine, SyncOptions, SyncOutcome, SyncPlan, SyncReport,
    SyncSettings, DELETION_SCOPE,
};
pub use progress::{
    format_bytes, format_duration, format_speed, pluralize, DownloadProgress, FileSnapshot,
    ProgressEvent, ProgressSnapshot,
};
pub use scanner::{index_explicit_files, RemoteIndex, RemoteScanner, ScanStats};
