//! Multi-worker remote tree scanner
//!
//! Workers share one queue of directories, seeded with the pack roots, and one
//! index of discovered files. A worker that finds the queue empty does not stop;
//! it goes idle and polls again, because a busy sibling may be about to enqueue
//! subdirectories. The scan is over once the queue is empty and no worker is busy.
//!
//! Taking an item and flagging the worker busy happen under the same lock, so a
//! worker can never look idle while it holds work.

use modsync_network::ManagedConnection;
use modsync_types::{
    ClientFactory, EntryType, Error, ErrorKind, IndexKey, PathMapping, Result, RetryConfig,
    ScanConfig,
};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

/// Remote files keyed by their normalized local path
pub type RemoteIndex = HashMap<IndexKey, PathMapping>;

#[derive(Debug, Clone)]
struct ScanItem {
    mapping: PathMapping,
    attempts: u32,
    empty_hits: u32,
}

impl ScanItem {
    fn new(mapping: PathMapping) -> Self {
        Self {
            mapping,
            attempts: 0,
            empty_hits: 0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum WorkerStatus {
    Busy,
    Idle,
    Stopped,
}

#[derive(Debug)]
struct ScanState {
    queue: VecDeque<ScanItem>,
    statuses: Vec<WorkerStatus>,
}

enum Poll {
    Work(ScanItem),
    Wait,
    Done,
}

/// Counters of a finished or running scan
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ScanStats {
    /// Successful directory listings
    pub directories_listed: u64,
    /// Files in the index
    pub files_found: usize,
    /// Directories whose listing came back non-empty after an empty one
    pub recovered_listings: u64,
    /// Listings retried after a transient fault
    pub retried_listings: u64,
}

#[derive(Debug)]
struct Shared {
    config: ScanConfig,
    state: Mutex<ScanState>,
    files: Mutex<RemoteIndex>,
    listed: AtomicU64,
    recovered: AtomicU64,
    retried: AtomicU64,
}

/// Walks the remote trees below a set of roots
///
/// Cloning is cheap; all clones share the queue and the index.
#[derive(Debug, Clone)]
pub struct RemoteScanner {
    shared: Arc<Shared>,
}

impl RemoteScanner {
    /// Prepare a scan of `roots` by `workers` workers
    pub fn new(roots: Vec<PathMapping>, workers: usize, config: ScanConfig) -> Self {
        Self {
            shared: Arc::new(Shared {
                config,
                state: Mutex::new(ScanState {
                    queue: roots.into_iter().map(ScanItem::new).collect(),
                    statuses: vec![WorkerStatus::Busy; workers],
                }),
                files: Mutex::new(RemoteIndex::new()),
                listed: AtomicU64::new(0),
                recovered: AtomicU64::new(0),
                retried: AtomicU64::new(0),
            }),
        }
    }

    /// Connect through `factory` and scan until the tree is exhausted
    ///
    /// The worker is marked stopped however it exits, so siblings never wait on it.
    pub async fn run_worker(
        &self,
        worker_id: usize,
        factory: &dyn ClientFactory,
        retry: RetryConfig,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let mut connection = ManagedConnection::new(worker_id, factory.create(), retry);
        let outcome = self.scan(worker_id, &mut connection, cancel).await;
        self.set_status(worker_id, WorkerStatus::Stopped);
        connection.close().await;
        outcome
    }

    /// Run the scan loop on an existing connection
    pub async fn scan(
        &self,
        worker_id: usize,
        connection: &mut ManagedConnection,
        cancel: &CancellationToken,
    ) -> Result<()> {
        connection.ensure_connected(cancel).await?;

        loop {
            if cancel.is_cancelled() {
                return Err(Error::Cancelled);
            }
            match self.poll(worker_id) {
                Poll::Work(item) => self.list(worker_id, connection, item, cancel).await?,
                Poll::Wait => {
                    tokio::select! {
                        () = cancel.cancelled() => return Err(Error::Cancelled),
                        () = tokio::time::sleep(self.shared.config.idle_poll()) => {}
                    }
                }
                Poll::Done => {
                    debug!("Scan worker {} found nothing left to do", worker_id);
                    return Ok(());
                }
            }
        }
    }

    /// Files discovered so far
    pub fn files_found(&self) -> usize {
        self.files().len()
    }

    /// Copy of the index
    pub fn index(&self) -> RemoteIndex {
        self.files().clone()
    }

    /// Take the index, leaving an empty one behind
    pub fn take_index(&self) -> RemoteIndex {
        std::mem::take(&mut *self.files())
    }

    /// Directories still waiting to be listed
    pub fn pending(&self) -> usize {
        self.state().queue.len()
    }

    /// Scan counters
    pub fn stats(&self) -> ScanStats {
        ScanStats {
            directories_listed: self.shared.listed.load(Ordering::Relaxed),
            files_found: self.files_found(),
            recovered_listings: self.shared.recovered.load(Ordering::Relaxed),
            retried_listings: self.shared.retried.load(Ordering::Relaxed),
        }
    }

    fn poll(&self, worker_id: usize) -> Poll {
        let mut state = self.state();
        if let Some(item) = state.queue.pop_front() {
            set(&mut state.statuses, worker_id, WorkerStatus::Busy);
            return Poll::Work(item);
        }
        set(&mut state.statuses, worker_id, WorkerStatus::Idle);
        if state.statuses.iter().any(|s| *s == WorkerStatus::Busy) {
            Poll::Wait
        } else {
            Poll::Done
        }
    }

    async fn list(
        &self,
        worker_id: usize,
        connection: &mut ManagedConnection,
        mut item: ScanItem,
        cancel: &CancellationToken,
    ) -> Result<()> {
        if let Err(error) = connection.ensure_connected(cancel).await {
            self.requeue(item);
            return Err(error);
        }

        let path = item.mapping.remote_full_path();
        let listing = tokio::select! {
            () = cancel.cancelled() => return Err(Error::Cancelled),
            listing = connection.client().list_directory(&path) => listing,
        };

        let entries = match listing {
            Ok(entries) => entries,
            Err(error) if error.is_cancellation() => return Err(error),
            Err(error) if error.is_recoverable() => {
                connection.mark_broken(&error).await;
                item.attempts += 1;
                if item.attempts >= self.shared.config.max_listing_attempts {
                    warn!(
                        "Scan worker {} giving up on {} after {} attempts: {}",
                        worker_id, path, item.attempts, error
                    );
                    return Err(error);
                }
                debug!(
                    "Listing {} failed ({}), retrying ({}/{})",
                    path, error, item.attempts, self.shared.config.max_listing_attempts
                );
                self.shared.retried.fetch_add(1, Ordering::Relaxed);
                tokio::select! {
                    () = cancel.cancelled() => return Err(Error::Cancelled),
                    () = tokio::time::sleep(self.shared.config.requeue_delay()) => {}
                }
                self.requeue(item);
                return Ok(());
            }
            Err(error) => {
                if error.kind() == ErrorKind::Protocol {
                    warn!("Listing {} was rejected: {}", path, error);
                }
                return Err(error);
            }
        };

        if entries.is_empty() {
            if item.empty_hits < self.shared.config.empty_listing_retries {
                item.empty_hits += 1;
                debug!(
                    "Listing of {} came back empty, checking again ({}/{})",
                    path, item.empty_hits, self.shared.config.empty_listing_retries
                );
                self.requeue(item);
            } else {
                trace!("{} is empty", path);
                self.shared.listed.fetch_add(1, Ordering::Relaxed);
            }
            return Ok(());
        }

        if item.empty_hits > 0 {
            info!(
                "Scan worker {} recovered from a faulty directory listing of {}",
                worker_id, path
            );
            self.shared.recovered.fetch_add(1, Ordering::Relaxed);
        }
        self.shared.listed.fetch_add(1, Ordering::Relaxed);

        let mut directories = Vec::new();
        {
            let mut files = self.files();
            for entry in entries {
                match entry.entry_type {
                    EntryType::File => {
                        let child = item.mapping.with_child(&entry.name, Some(entry.size));
                        files.entry(child.index_key()).or_insert(child);
                    }
                    EntryType::Directory => {
                        directories.push(ScanItem::new(item.mapping.with_child(&entry.name, None)));
                    }
                    EntryType::Link => trace!("Ignoring link {}/{}", path, entry.name),
                }
            }
        }
        if !directories.is_empty() {
            self.state().queue.extend(directories);
        }
        Ok(())
    }

    fn requeue(&self, item: ScanItem) {
        self.state().queue.push_back(item);
    }

    fn set_status(&self, worker_id: usize, status: WorkerStatus) {
        set(&mut self.state().statuses, worker_id, status);
    }

    fn state(&self) -> MutexGuard<'_, ScanState> {
        self.shared.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn files(&self) -> MutexGuard<'_, RemoteIndex> {
        self.shared.files.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn set(statuses: &mut [WorkerStatus], worker_id: usize, status: WorkerStatus) {
    if let Some(slot) = statuses.get_mut(worker_id) {
        *slot = status;
    }
}

/// Build an index from explicit file mappings instead of walking the tree
///
/// Every mapping is stat'ed for its size. Files the repository does not have are
/// skipped with a warning. Indexed mappings never allow deletions.
pub async fn index_explicit_files(
    mappings: Vec<PathMapping>,
    connection: &mut ManagedConnection,
    cancel: &CancellationToken,
) -> Result<RemoteIndex> {
    let mut index = RemoteIndex::new();
    for mapping in mappings {
        if cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }
        connection.ensure_connected(cancel).await?;
        let remote = mapping.remote_full_path();
        match connection.client().stat(&remote).await {
            Ok(stat) => {
                let file = mapping
                    .with_size(Some(stat.size))
                    .with_delete_client_files(false);
                index.insert(file.index_key(), file);
            }
            Err(error) if error.kind() == ErrorKind::Protocol => {
                warn!("Skipping {}: {}", remote, error);
            }
            Err(error) => return Err(error),
        }
    }
    info!("Indexed {} explicit file(s)", index.len());
    Ok(index)
}
