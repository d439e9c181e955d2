//! Capabilities the sync engine consumes
//!
//! The protocol client and the progress sink are supplied from outside the core.
//! Everything the scanner and the download engine need from them goes through
//! these traits.

use crate::{RemoteEntry, RemoteStat, Result};
use std::path::Path;

#[cfg(feature = "async")]
use async_trait::async_trait;

/// Byte stream returned by a ranged remote read
#[cfg(feature = "async")]
pub type RemoteStream = Box<dyn tokio::io::AsyncRead + Send + Unpin>;

/// One connection to the remote repository
///
/// A client is owned by exactly one worker for that worker's lifetime. The engine
/// reconnects through [`RemoteClient::connect`] whenever [`RemoteClient::is_connected`]
/// reports a lost connection.
#[cfg(feature = "async")]
#[async_trait]
pub trait RemoteClient: Send {
    /// Establish the connection
    async fn connect(&mut self) -> Result<()>;

    /// Close the connection
    async fn disconnect(&mut self) -> Result<()>;

    /// Whether the connection is currently usable
    fn is_connected(&self) -> bool;

    /// List the entries of a remote directory
    async fn list_directory(&mut self, path: &str) -> Result<Vec<RemoteEntry>>;

    /// Open a stream over `[start, end)` of a remote file
    async fn open_read_range(&mut self, path: &str, start: u64, end: u64) -> Result<RemoteStream>;

    /// Query the size of a remote file
    async fn stat(&mut self, path: &str) -> Result<RemoteStat>;
}

/// Creates one client per worker
#[cfg(feature = "async")]
pub trait ClientFactory: Send + Sync {
    /// Build a fresh, unconnected client
    fn create(&self) -> Box<dyn RemoteClient>;

    /// Human readable description of the endpoint, for logs
    fn describe(&self) -> String;
}

/// Receives byte-level progress from download workers
///
/// Implementations must be cheap and thread-safe; they are called after every
/// buffer write.
pub trait TransferObserver: Send + Sync {
    /// `delta` more bytes of `file` (declared size `file_size`) are on disk
    ///
    /// Returning an error aborts the worker; it is reserved for internal
    /// consistency faults such as a counter overrunning the declared size.
    fn bytes_written(&self, file: &Path, file_size: u64, delta: u64) -> Result<()>;
}

/// Observer that discards everything
#[derive(Debug, Default, Clone, Copy)]
pub struct NullObserver;

impl TransferObserver for NullObserver {
    fn bytes_written(&self, _file: &Path, _file_size: u64, _delta: u64) -> Result<()> {
        Ok(())
    }
}
