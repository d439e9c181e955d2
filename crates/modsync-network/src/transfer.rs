//! Chunked parallel download engine
//!
//! Every planned file is split into [`DownloadChunk`]s which go into one shared
//! queue. Each worker owns a single connection and keeps taking chunks until the
//! queue is empty. A chunk that fails part way is re-queued from the first byte
//! that did not reach the disk, so progress counters never go backwards.
//!
//! Writes to a destination file are serialized per byte range by the
//! [`RangeLockTable`]; the lock is held for the seek and write of one buffer and
//! never while waiting on the network.

use crate::connection::ManagedConnection;
use crate::lock::RangeLockTable;
use modsync_types::{
    ClientFactory, DownloadChunk, DownloadConfig, Error, ErrorContext, FileDownload, RemoteStream,
    Result, RetryConfig, TransferObserver,
};
use std::collections::{HashSet, VecDeque};
use std::io::SeekFrom;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use tokio::fs::{self, File, OpenOptions};
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

/// FIFO of chunks shared by all download workers
#[derive(Debug, Default)]
pub struct ChunkQueue {
    chunks: Mutex<VecDeque<DownloadChunk>>,
}

impl ChunkQueue {
    /// Create an empty queue
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a chunk
    pub fn push(&self, chunk: DownloadChunk) {
        self.lock().push_back(chunk);
    }

    /// Append every chunk of a planned file
    pub fn extend(&self, chunks: impl IntoIterator<Item = DownloadChunk>) {
        self.lock().extend(chunks);
    }

    /// Take the next chunk
    pub fn pop(&self) -> Option<DownloadChunk> {
        self.lock().pop_front()
    }

    /// Chunks waiting to be downloaded
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    /// Whether no chunk is waiting
    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, VecDeque<DownloadChunk>> {
        self.chunks.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Run-wide allowance of mid-chunk failures
#[derive(Debug)]
pub struct FaultBudget {
    remaining: AtomicU32,
    spent: AtomicU32,
}

impl FaultBudget {
    /// Allow `limit` failures
    pub fn new(limit: u32) -> Self {
        Self {
            remaining: AtomicU32::new(limit),
            spent: AtomicU32::new(0),
        }
    }

    /// Spend one unit; `false` once the budget is gone
    pub fn consume(&self) -> bool {
        self.spent.fetch_add(1, Ordering::Relaxed);
        self.remaining
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |left| left.checked_sub(1))
            .is_ok()
    }

    /// Failures seen so far, including the one that exhausted the budget
    pub fn spent(&self) -> u32 {
        self.spent.load(Ordering::Relaxed)
    }

    /// Failures still tolerated
    pub fn remaining(&self) -> u32 {
        self.remaining.load(Ordering::Acquire)
    }
}

/// Counters maintained by the workers
#[derive(Debug, Default)]
pub struct TransferStats {
    bytes_written: AtomicU64,
    chunks_completed: AtomicU64,
    chunks_requeued: AtomicU64,
    empty_files: AtomicU64,
}

/// Point-in-time copy of [`TransferStats`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TransferSummary {
    /// Bytes written to destination files
    pub bytes_written: u64,
    /// Chunks written in full
    pub chunks_completed: u64,
    /// Chunk remainders put back after a failure
    pub chunks_requeued: u64,
    /// Zero-length files created without a transfer
    pub empty_files: u64,
}

impl TransferStats {
    /// Copy the counters
    pub fn snapshot(&self) -> TransferSummary {
        TransferSummary {
            bytes_written: self.bytes_written.load(Ordering::Relaxed),
            chunks_completed: self.chunks_completed.load(Ordering::Relaxed),
            chunks_requeued: self.chunks_requeued.load(Ordering::Relaxed),
            empty_files: self.empty_files.load(Ordering::Relaxed),
        }
    }
}

struct Shared {
    config: DownloadConfig,
    queue: ChunkQueue,
    touched: tokio::sync::Mutex<HashSet<PathBuf>>,
    locks: Arc<RangeLockTable>,
    budget: FaultBudget,
    stats: TransferStats,
    observer: Arc<dyn TransferObserver>,
}

/// Downloads queued chunks with any number of workers
///
/// Cloning is cheap; all clones share the queue, the lock table and the counters.
#[derive(Clone)]
pub struct ChunkDownloader {
    shared: Arc<Shared>,
}

impl std::fmt::Debug for ChunkDownloader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChunkDownloader")
            .field("queued", &self.shared.queue.len())
            .field("budget", &self.shared.budget.remaining())
            .field("stats", &self.shared.stats.snapshot())
            .finish_non_exhaustive()
    }
}

impl ChunkDownloader {
    /// Create a downloader reporting written bytes to `observer`
    pub fn new(config: DownloadConfig, observer: Arc<dyn TransferObserver>) -> Self {
        let budget = FaultBudget::new(config.fault_budget);
        Self {
            shared: Arc::new(Shared {
                config,
                queue: ChunkQueue::new(),
                touched: tokio::sync::Mutex::new(HashSet::new()),
                locks: RangeLockTable::new(),
                budget,
                stats: TransferStats::default(),
                observer,
            }),
        }
    }

    /// Queue every chunk of a planned file
    pub fn enqueue(&self, download: FileDownload) {
        self.shared.queue.extend(download.into_chunks());
    }

    /// Chunks still waiting
    pub fn queued(&self) -> usize {
        self.shared.queue.len()
    }

    /// Shared counters
    pub fn stats(&self) -> TransferSummary {
        self.shared.stats.snapshot()
    }

    /// Mid-chunk failures seen so far
    pub fn faults(&self) -> u32 {
        self.shared.budget.spent()
    }

    /// Every destination file a worker has opened
    pub async fn touched_files(&self) -> Vec<PathBuf> {
        let mut files: Vec<_> = self.shared.touched.lock().await.iter().cloned().collect();
        files.sort();
        files
    }

    /// Create or truncate a zero-length destination file
    pub async fn materialize_empty_file(&self, path: &Path) -> Result<()> {
        {
            let mut touched = self.shared.touched.lock().await;
            touched.insert(path.to_path_buf());
            create_parent(path).await?;
            File::create(path).await.map_err(|e| Error::io_at(path, &e))?;
        }
        self.shared.stats.empty_files.fetch_add(1, Ordering::Relaxed);
        self.shared.observer.bytes_written(path, 0, 0)?;
        debug!("Created empty file {}", path.display());
        Ok(())
    }

    /// Open a connection from `factory` and drain the queue with it
    pub async fn run_worker(
        &self,
        worker_id: usize,
        factory: &dyn ClientFactory,
        retry: RetryConfig,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let mut connection = ManagedConnection::new(worker_id, factory.create(), retry);
        let outcome = self.drain(worker_id, &mut connection, cancel).await;
        connection.close().await;
        outcome
    }

    /// Take chunks until the queue is empty, a fatal fault occurs or `cancel` fires
    pub async fn drain(
        &self,
        worker_id: usize,
        connection: &mut ManagedConnection,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let shared = &self.shared;
        loop {
            if cancel.is_cancelled() {
                return Err(Error::Cancelled);
            }
            let Some(chunk) = shared.queue.pop() else {
                debug!("Download worker {} found the queue empty", worker_id);
                return Ok(());
            };

            if let Err(error) = connection.ensure_connected(cancel).await {
                shared.queue.push(chunk);
                return Err(error);
            }

            let mut written = 0;
            match self.download_chunk(connection, &chunk, &mut written, cancel).await {
                Ok(()) => {
                    shared.stats.chunks_completed.fetch_add(1, Ordering::Relaxed);
                    trace!(
                        "Worker {} finished {}..{} of {}",
                        worker_id,
                        chunk.offset,
                        chunk.end(),
                        chunk.remote_path
                    );
                }
                Err(error) if error.is_cancellation() => return Err(error),
                Err(error) => {
                    if let Some(rest) = chunk.remainder(written) {
                        shared.queue.push(rest);
                        shared.stats.chunks_requeued.fetch_add(1, Ordering::Relaxed);
                    }
                    connection.mark_broken(&error).await;

                    if !error.is_recoverable() {
                        warn!(
                            "Worker {} hit a fatal fault on {}: {}",
                            worker_id, chunk.remote_path, error
                        );
                        return Err(error);
                    }
                    if !shared.budget.consume() {
                        return Err(Error::transient(format!(
                            "fault budget exhausted after {} faults; last: {}",
                            shared.budget.spent(),
                            error
                        )));
                    }
                    info!(
                        "Worker {} re-queued {} at byte {} after: {} ({} faults left)",
                        worker_id,
                        chunk.remote_path,
                        chunk.offset + written,
                        error,
                        shared.budget.remaining()
                    );
                }
            }
        }
    }

    async fn download_chunk(
        &self,
        connection: &mut ManagedConnection,
        chunk: &DownloadChunk,
        written: &mut u64,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let shared = &self.shared;
        let mut file = self.prepare_target(&chunk.local_path).await?;
        let mut stream = self.open_stream(connection, chunk, cancel).await?;

        let length = u64::from(chunk.length);
        let mut buffer = vec![0u8; shared.config.buffer_size.max(1)];

        while *written < length {
            let read = tokio::select! {
                () = cancel.cancelled() => return Err(Error::Cancelled),
                read = stream.read(&mut buffer) => read.map_err(|e| {
                    Error::transient(format!(
                        "reading '{}' at byte {}: {}",
                        chunk.remote_path,
                        chunk.offset + *written,
                        e
                    ))
                })?,
            };
            if read == 0 {
                return Err(Error::transient(format!(
                    "stream for '{}' ended after {} of {} bytes",
                    chunk.remote_path, *written, length
                )));
            }
            let read_len = read as u64;
            if *written + read_len > length {
                return Err(Error::internal_with_context(
                    "remote sent more bytes than requested",
                    ErrorContext::new("download chunk")
                        .with_detail("remote", &chunk.remote_path)
                        .with_detail("offset", chunk.offset)
                        .with_detail("length", length)
                        .with_detail("received", *written + read_len),
                ));
            }

            {
                let _range = shared
                    .locks
                    .lock(&chunk.local_path, chunk.offset, length)
                    .await;
                let position = chunk.offset + *written;
                let path = &chunk.local_path;
                file.seek(SeekFrom::Start(position))
                    .await
                    .map_err(|e| Error::io_at(path, &e))?;
                file.write_all(&buffer[..read])
                    .await
                    .map_err(|e| Error::io_at(path, &e))?;
                file.flush().await.map_err(|e| Error::io_at(path, &e))?;
            }

            *written += read_len;
            shared
                .stats
                .bytes_written
                .fetch_add(read_len, Ordering::Relaxed);
            shared
                .observer
                .bytes_written(&chunk.local_path, chunk.file_size, read_len)?;

            if cancel.is_cancelled() {
                return Err(Error::Cancelled);
            }
        }
        Ok(())
    }

    /// Open `path` for writing, truncating it the first time any worker touches it
    async fn prepare_target(&self, path: &Path) -> Result<File> {
        let mut touched = self.shared.touched.lock().await;
        let first = touched.insert(path.to_path_buf());
        let mut options = OpenOptions::new();
        options.write(true).create(true);
        if first {
            create_parent(path).await?;
            options.truncate(true);
            trace!("Truncated {}", path.display());
        }
        options.open(path).await.map_err(|e| Error::io_at(path, &e))
    }

    async fn open_stream(
        &self,
        connection: &mut ManagedConnection,
        chunk: &DownloadChunk,
        cancel: &CancellationToken,
    ) -> Result<RemoteStream> {
        let retries = self.shared.config.open_retries;
        let mut attempt = 0;
        loop {
            let opened = connection
                .client()
                .open_read_range(&chunk.remote_path, chunk.offset, chunk.end())
                .await;
            match opened {
                Ok(stream) => return Ok(stream),
                Err(error) if error.is_recoverable() && attempt < retries => {
                    attempt += 1;
                    debug!(
                        "Opening {} at {} failed ({}), attempt {}/{}",
                        chunk.remote_path,
                        chunk.offset,
                        error,
                        attempt,
                        retries
                    );
                    connection.mark_broken(&error).await;
                    connection.ensure_connected(cancel).await?;
                }
                Err(error) => return Err(error),
            }
        }
    }
}

async fn create_parent(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)
            .await
            .map_err(|e| Error::io_at(parent, &e))?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::MirrorClientFactory;
    use modsync_types::{ErrorKind, NullObserver};
    use tempfile::TempDir;

    fn pattern(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i % 251) as u8).collect()
    }

    fn config(chunk_size: u32) -> DownloadConfig {
        DownloadConfig {
            chunk_size,
            buffer_size: 4096,
            ..DownloadConfig::default()
        }
    }

    #[test]
    fn test_fault_budget() {
        let budget = FaultBudget::new(2);
        assert!(budget.consume());
        assert!(budget.consume());
        assert!(!budget.consume());
        assert_eq!(budget.spent(), 3);
        assert_eq!(budget.remaining(), 0);
    }

    #[test]
    fn test_queue_is_fifo() {
        let queue = ChunkQueue::new();
        let download = FileDownload::new("/a", "/a", 30, 10).unwrap();
        queue.extend(download.into_chunks());
        assert_eq!(queue.len(), 3);
        assert_eq!(queue.pop().map(|c| c.offset), Some(0));
        assert_eq!(queue.pop().map(|c| c.offset), Some(10));
    }

    #[tokio::test]
    async fn test_parallel_workers_reassemble_file() {
        let remote = TempDir::new().unwrap();
        let local = TempDir::new().unwrap();
        let content = pattern(100_000);
        std::fs::write(remote.path().join("pack.zipmod"), &content).unwrap();

        let target = local.path().join("mods").join("pack.zipmod");
        let downloader = ChunkDownloader::new(config(7_000), Arc::new(NullObserver));
        downloader.enqueue(
            FileDownload::new(&target, "/pack.zipmod", content.len() as u64, 7_000).unwrap(),
        );

        let factory = MirrorClientFactory::new(remote.path());
        let cancel = CancellationToken::new();
        let workers = (0..3).map(|id| {
            let downloader = downloader.clone();
            let factory = factory.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move {
                downloader
                    .run_worker(id, &factory, RetryConfig::immediate(1), &cancel)
                    .await
            })
        });
        for worker in futures::future::join_all(workers).await {
            worker.unwrap().unwrap();
        }

        assert_eq!(std::fs::read(&target).unwrap(), content);
        let stats = downloader.stats();
        assert_eq!(stats.bytes_written, content.len() as u64);
        assert_eq!(stats.chunks_completed, 15);
        assert_eq!(downloader.touched_files().await, vec![target]);
    }

    #[tokio::test]
    async fn test_first_touch_truncates_stale_file() {
        let remote = TempDir::new().unwrap();
        let local = TempDir::new().unwrap();
        std::fs::write(remote.path().join("small.bin"), b"fresh").unwrap();
        let target = local.path().join("small.bin");
        std::fs::write(&target, b"much longer stale content").unwrap();

        let downloader = ChunkDownloader::new(config(1024), Arc::new(NullObserver));
        downloader.enqueue(FileDownload::new(&target, "/small.bin", 5, 1024).unwrap());
        downloader
            .run_worker(
                0,
                &MirrorClientFactory::new(remote.path()),
                RetryConfig::immediate(0),
                &CancellationToken::new(),
            )
            .await
            .unwrap();

        assert_eq!(std::fs::read(&target).unwrap(), b"fresh");
    }

    #[tokio::test]
    async fn test_missing_remote_file_is_fatal_and_requeued() {
        let remote = TempDir::new().unwrap();
        let local = TempDir::new().unwrap();
        let downloader = ChunkDownloader::new(config(1024), Arc::new(NullObserver));
        downloader.enqueue(FileDownload::new(local.path().join("x"), "/x", 10, 1024).unwrap());

        let error = downloader
            .run_worker(
                0,
                &MirrorClientFactory::new(remote.path()),
                RetryConfig::immediate(0),
                &CancellationToken::new(),
            )
            .await
            .unwrap_err();
        assert_eq!(error.kind(), ErrorKind::Protocol);
        assert_eq!(downloader.queued(), 1);
        assert_eq!(downloader.faults(), 0);
    }

    #[tokio::test]
    async fn test_cancelled_worker_stops() {
        let remote = TempDir::new().unwrap();
        let local = TempDir::new().unwrap();
        let downloader = ChunkDownloader::new(config(1024), Arc::new(NullObserver));
        downloader.enqueue(FileDownload::new(local.path().join("x"), "/x", 10, 1024).unwrap());

        let cancel = CancellationToken::new();
        cancel.cancel();
        let error = downloader
            .run_worker(
                0,
                &MirrorClientFactory::new(remote.path()),
                RetryConfig::immediate(0),
                &cancel,
            )
            .await
            .unwrap_err();
        assert!(error.is_cancellation());
        assert_eq!(downloader.queued(), 1);
    }

    /// Serves `content`, but the first stream breaks after `keep` bytes
    struct DroppingClient {
        content: Arc<Vec<u8>>,
        keep: usize,
        opens: Arc<AtomicU32>,
    }

    struct BrokenRead;

    impl tokio::io::AsyncRead for BrokenRead {
        fn poll_read(
            self: std::pin::Pin<&mut Self>,
            _cx: &mut std::task::Context<'_>,
            _buf: &mut tokio::io::ReadBuf<'_>,
        ) -> std::task::Poll<std::io::Result<()>> {
            std::task::Poll::Ready(Err(std::io::Error::other("data connection dropped")))
        }
    }

    #[async_trait::async_trait]
    impl modsync_types::RemoteClient for DroppingClient {
        async fn connect(&mut self) -> Result<()> {
            Ok(())
        }

        async fn disconnect(&mut self) -> Result<()> {
            Ok(())
        }

        fn is_connected(&self) -> bool {
            true
        }

        async fn list_directory(
            &mut self,
            _path: &str,
        ) -> Result<Vec<modsync_types::RemoteEntry>> {
            Ok(Vec::new())
        }

        async fn open_read_range(
            &mut self,
            _path: &str,
            start: u64,
            end: u64,
        ) -> Result<RemoteStream> {
            let range = self.content[start as usize..end as usize].to_vec();
            if self.opens.fetch_add(1, Ordering::SeqCst) == 0 {
                let head = std::io::Cursor::new(range[..self.keep].to_vec());
                return Ok(Box::new(head.chain(BrokenRead)));
            }
            Ok(Box::new(std::io::Cursor::new(range)))
        }

        async fn stat(&mut self, _path: &str) -> Result<modsync_types::RemoteStat> {
            Err(Error::internal("not used"))
        }
    }

    struct DroppingFactory {
        content: Arc<Vec<u8>>,
        opens: Arc<AtomicU32>,
    }

    impl ClientFactory for DroppingFactory {
        fn create(&self) -> Box<dyn modsync_types::RemoteClient> {
            Box::new(DroppingClient {
                content: Arc::clone(&self.content),
                keep: 4,
                opens: Arc::clone(&self.opens),
            })
        }

        fn describe(&self) -> String {
            "dropping".to_string()
        }
    }

    #[tokio::test]
    async fn test_broken_stream_requeues_remainder() {
        let local = TempDir::new().unwrap();
        let content = Arc::new(pattern(20));
        let factory = DroppingFactory {
            content: Arc::clone(&content),
            opens: Arc::new(AtomicU32::new(0)),
        };
        let target = local.path().join("x.zipmod");
        let downloader = ChunkDownloader::new(config(1024), Arc::new(NullObserver));
        downloader.enqueue(FileDownload::new(&target, "/x.zipmod", 20, 1024).unwrap());

        downloader
            .run_worker(0, &factory, RetryConfig::immediate(1), &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(std::fs::read(&target).unwrap(), *content);
        assert_eq!(factory.opens.load(Ordering::SeqCst), 2);
        assert_eq!(downloader.faults(), 1);
        let stats = downloader.stats();
        assert_eq!(stats.chunks_requeued, 1);
        assert_eq!(stats.bytes_written, 20);
    }

    #[tokio::test]
    async fn test_materialize_empty_file() {
        let local = TempDir::new().unwrap();
        let target = local.path().join("deep").join("empty.txt");
        let downloader = ChunkDownloader::new(config(1024), Arc::new(NullObserver));
        downloader.materialize_empty_file(&target).await.unwrap();

        assert_eq!(std::fs::metadata(&target).unwrap().len(), 0);
        assert_eq!(downloader.stats().empty_files, 1);
    }
}
