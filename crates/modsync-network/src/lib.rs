//! Remote repository access for modsync
//!
//! This crate holds everything that talks to the repository or writes what comes
//! back from it:
//!
//! - **Mirror client**: A [`RemoteClient`](modsync_types::RemoteClient) over a local or mounted repository tree
//! - **Managed connections**: One long-lived connection per worker with bounded reconnects
//! - **Range locks**: In-process byte-range locks on destination files
//! - **Chunked downloads**: A shared chunk queue drained by parallel workers, with
//!   resume-from-remainder and a run-wide fault budget
//!
//! # Examples
//!
//! ```rust,no_run
//! use modsync_network::{ChunkDownloader, MirrorClientFactory};
//! use modsync_types::{DownloadConfig, FileDownload, NullObserver, RetryConfig};
//! use std::sync::Arc;
//! use tokio_util::sync::CancellationToken;
//!
//! # async fn example() -> modsync_types::Result<()> {
//! let factory = MirrorClientFactory::new("/srv/repository");
//! let downloader = ChunkDownloader::new(DownloadConfig::default(), Arc::new(NullObserver));
//! downloader.enqueue(FileDownload::new("mods/a.zipmod", "/AI/mods/a.zipmod", 4096, 1024)?);
//! downloader
//!     .run_worker(0, &factory, RetryConfig::default(), &CancellationToken::new())
//!     .await?;
//! # Ok(())
//! # }
//! ```

#![deny(missing_docs)]
#![warn(clippy::all, clippy::pedantic, clippy::nursery)]
#![allow(clippy::module_name_repetitions)]

pub mod client;
pub mod connection;
pub mod lock;
pub mod transfer;

pub use client::{MirrorClient, MirrorClientFactory};
pub use connection::{connect_with_retry, ManagedConnection};
pub use lock::{RangeGuard, RangeLockTable};
pub use transfer::{ChunkDownloader, ChunkQueue, FaultBudget, TransferStats, TransferSummary};
