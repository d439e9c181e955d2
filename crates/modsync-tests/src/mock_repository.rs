//! In-memory repository with scripted faults
//!
//! [`MockRepository`] holds a directory tree in memory and serves it through the
//! same [`RemoteClient`] capability the real transports implement. Faults are
//! scripted per path and consumed as they fire, so a test can say "the first open
//! of this file fails" or "this directory lists empty twice" and then assert that
//! the engine recovered.

use async_trait::async_trait;
use modsync_types::{
    ClientFactory, Error, RemoteClient, RemoteEntry, RemoteStat, RemoteStream, Result,
};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::io::Cursor;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::io::AsyncWriteExt;

/// Normalize a repository path to `a/b/c`
fn key(path: &str) -> String {
    path.split(['/', '\\'])
        .filter(|segment| !segment.is_empty())
        .collect::<Vec<_>>()
        .join("/")
}

fn parent(path: &str) -> Option<&str> {
    path.rsplit_once('/').map(|(parent, _)| parent)
}

/// Remaining scripted faults, keyed by normalized path
#[derive(Debug, Default)]
struct Faults {
    failed_opens: HashMap<String, u32>,
    truncated_reads: HashMap<String, (u32, usize)>,
    empty_listings: HashMap<String, u32>,
    failed_listings: HashMap<String, u32>,
    rejected_listings: BTreeSet<String>,
    failed_connects: u32,
}

/// Take one shot of a per-path fault
fn consume(counts: &mut HashMap<String, u32>, path: &str) -> bool {
    match counts.get_mut(path) {
        Some(left) if *left > 0 => {
            *left -= 1;
            true
        }
        _ => false,
    }
}

/// Streams are handed out in pieces of `piece` bytes, `delay` apart
#[derive(Debug, Clone, Copy)]
struct Throttle {
    piece: usize,
    delay: Duration,
}

/// An in-memory repository tree
#[derive(Debug, Default)]
pub struct MockRepository {
    files: BTreeMap<String, Arc<Vec<u8>>>,
    directories: BTreeSet<String>,
    faults: Mutex<Faults>,
    listings: Mutex<HashMap<String, u32>>,
    list_delay: Option<Duration>,
    throttle: Option<Throttle>,
    clients: AtomicUsize,
    connects: AtomicUsize,
    opens: AtomicUsize,
}

impl MockRepository {
    /// Create an empty repository
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a file, creating its parent directories
    #[must_use]
    pub fn with_file(mut self, path: &str, contents: impl Into<Vec<u8>>) -> Self {
        let path = key(path);
        self.add_parents(&path);
        self.files.insert(path, Arc::new(contents.into()));
        self
    }

    /// Add a directory, even if it stays empty
    #[must_use]
    pub fn with_directory(mut self, path: &str) -> Self {
        let path = key(path);
        self.add_parents(&path);
        self.directories.insert(path);
        self
    }

    /// The next `times` opens of `path` fail with a transient fault
    #[must_use]
    pub fn fail_opens(mut self, path: &str, times: u32) -> Self {
        self.faults_mut().failed_opens.insert(key(path), times);
        self
    }

    /// The next `times` streams of `path` end after `keep` bytes
    #[must_use]
    pub fn truncate_reads(mut self, path: &str, times: u32, keep: usize) -> Self {
        self.faults_mut()
            .truncated_reads
            .insert(key(path), (times, keep));
        self
    }

    /// The next `times` listings of `path` come back empty
    #[must_use]
    pub fn empty_listings(mut self, path: &str, times: u32) -> Self {
        self.faults_mut().empty_listings.insert(key(path), times);
        self
    }

    /// The next `times` listings of `path` fail with a transient fault
    #[must_use]
    pub fn fail_listings(mut self, path: &str, times: u32) -> Self {
        self.faults_mut().failed_listings.insert(key(path), times);
        self
    }

    /// Every listing of `path` is rejected with a protocol error
    #[must_use]
    pub fn reject_listings(mut self, path: &str) -> Self {
        self.faults_mut().rejected_listings.insert(key(path));
        self
    }

    /// The next `times` connection attempts are refused
    #[must_use]
    pub fn fail_connects(mut self, times: u32) -> Self {
        self.faults_mut().failed_connects = times;
        self
    }

    /// Every listing takes `delay`
    #[must_use]
    pub fn with_list_delay(mut self, delay: Duration) -> Self {
        self.list_delay = Some(delay);
        self
    }

    /// Streams deliver `piece` bytes every `delay`
    #[must_use]
    pub fn throttled(mut self, piece: usize, delay: Duration) -> Self {
        self.throttle = Some(Throttle {
            piece: piece.max(1),
            delay,
        });
        self
    }

    /// Share the repository behind a client factory
    pub fn into_factory(self) -> MockFactory {
        MockFactory {
            repository: Arc::new(self),
        }
    }

    /// Contents of a file
    pub fn contents(&self, path: &str) -> Option<&[u8]> {
        self.files.get(&key(path)).map(|data| data.as_slice())
    }

    /// Paths of every file, sorted
    pub fn file_paths(&self) -> Vec<String> {
        self.files.keys().cloned().collect()
    }

    /// Clients created so far
    pub fn clients_created(&self) -> usize {
        self.clients.load(Ordering::SeqCst)
    }

    /// Successful connects so far
    pub fn connects(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }

    /// Open attempts so far, failed ones included
    pub fn opens(&self) -> usize {
        self.opens.load(Ordering::SeqCst)
    }

    /// How often `path` was listed, failed attempts included
    pub fn listing_count(&self, path: &str) -> u32 {
        lock(&self.listings).get(&key(path)).copied().unwrap_or(0)
    }

    fn add_parents(&mut self, path: &str) {
        let mut current = parent(path);
        while let Some(directory) = current {
            self.directories.insert(directory.to_string());
            current = parent(directory);
        }
    }

    fn faults_mut(&mut self) -> &mut Faults {
        self.faults.get_mut().unwrap_or_else(PoisonError::into_inner)
    }

    fn faults(&self) -> MutexGuard<'_, Faults> {
        lock(&self.faults)
    }

    fn children(&self, directory: &str) -> Vec<RemoteEntry> {
        let is_child = |path: &str| parent(path).unwrap_or("") == directory;
        let directories = self
            .directories
            .iter()
            .filter(|path| is_child(path))
            .map(|path| RemoteEntry::directory(name_of(path)));
        let files = self
            .files
            .iter()
            .filter(|(path, _)| is_child(path))
            .map(|(path, data)| RemoteEntry::file(name_of(path), data.len() as u64));
        directories.chain(files).collect()
    }
}

fn name_of(path: &str) -> &str {
    path.rsplit('/').next().unwrap_or(path)
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

fn missing(path: &str) -> Error {
    Error::protocol(Some(550), format!("'{path}': no such file or directory"))
}

fn to_usize(value: u64) -> Result<usize> {
    usize::try_from(value).map_err(|_| Error::internal(format!("offset {value} out of range")))
}

/// Creates [`MockClient`]s over one shared [`MockRepository`]
#[derive(Debug, Clone)]
pub struct MockFactory {
    repository: Arc<MockRepository>,
}

impl MockFactory {
    /// The repository every client serves
    pub fn repository(&self) -> &MockRepository {
        &self.repository
    }
}

impl ClientFactory for MockFactory {
    fn create(&self) -> Box<dyn RemoteClient> {
        self.repository.clients.fetch_add(1, Ordering::SeqCst);
        Box::new(MockClient {
            repository: Arc::clone(&self.repository),
            connected: false,
        })
    }

    fn describe(&self) -> String {
        "mock://repository".to_string()
    }
}

/// One connection to a [`MockRepository`]
#[derive(Debug)]
pub struct MockClient {
    repository: Arc<MockRepository>,
    connected: bool,
}

impl MockClient {
    fn ensure_connected(&self) -> Result<()> {
        if self.connected {
            Ok(())
        } else {
            Err(Error::connection("not connected"))
        }
    }
}

#[async_trait]
impl RemoteClient for MockClient {
    async fn connect(&mut self) -> Result<()> {
        {
            let mut faults = self.repository.faults();
            if faults.failed_connects > 0 {
                faults.failed_connects -= 1;
                return Err(Error::connection("connection refused"));
            }
        }
        self.connected = true;
        self.repository.connects.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn disconnect(&mut self) -> Result<()> {
        self.connected = false;
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected
    }

    async fn list_directory(&mut self, path: &str) -> Result<Vec<RemoteEntry>> {
        self.ensure_connected()?;
        let directory = key(path);
        *lock(&self.repository.listings)
            .entry(directory.clone())
            .or_default() += 1;

        if let Some(delay) = self.repository.list_delay {
            tokio::time::sleep(delay).await;
        }

        {
            let mut faults = self.repository.faults();
            if faults.rejected_listings.contains(&directory) {
                return Err(Error::protocol(Some(550), format!("'{path}': permission denied")));
            }
            if consume(&mut faults.failed_listings, &directory) {
                return Err(Error::transient(format!("listing of '{path}' was interrupted")));
            }
            if consume(&mut faults.empty_listings, &directory) {
                return Ok(Vec::new());
            }
        }

        if !directory.is_empty() && !self.repository.directories.contains(&directory) {
            return Err(missing(path));
        }
        Ok(self.repository.children(&directory))
    }

    async fn open_read_range(&mut self, path: &str, start: u64, end: u64) -> Result<RemoteStream> {
        self.ensure_connected()?;
        self.repository.opens.fetch_add(1, Ordering::SeqCst);
        let file = key(path);

        let truncate_to = {
            let mut faults = self.repository.faults();
            if consume(&mut faults.failed_opens, &file) {
                return Err(Error::transient(format!("data connection for '{path}' was reset")));
            }
            match faults.truncated_reads.get_mut(&file) {
                Some((left, keep)) if *left > 0 => {
                    *left -= 1;
                    Some(*keep)
                }
                _ => None,
            }
        };

        let data = self.repository.files.get(&file).ok_or_else(|| missing(path))?;
        let (start, end) = (to_usize(start)?, to_usize(end)?);
        if start > end || end > data.len() {
            return Err(Error::protocol(
                None,
                format!("range {start}..{end} is outside '{path}' ({} bytes)", data.len()),
            ));
        }
        let mut slice = data[start..end].to_vec();
        if let Some(keep) = truncate_to {
            slice.truncate(keep);
        }

        match self.repository.throttle {
            Some(throttle) => Ok(throttled_stream(slice, throttle)),
            None => Ok(Box::new(Cursor::new(slice))),
        }
    }

    async fn stat(&mut self, path: &str) -> Result<RemoteStat> {
        self.ensure_connected()?;
        self.repository
            .files
            .get(&key(path))
            .map(|data| RemoteStat {
                size: data.len() as u64,
            })
            .ok_or_else(|| missing(path))
    }
}

/// Feed `data` through a pipe a piece at a time; dropping the reader stops the feed
fn throttled_stream(data: Vec<u8>, throttle: Throttle) -> RemoteStream {
    let (mut writer, reader) = tokio::io::duplex(throttle.piece);
    tokio::spawn(async move {
        for piece in data.chunks(throttle.piece) {
            tokio::time::sleep(throttle.delay).await;
            if writer.write_all(piece).await.is_err() {
                return;
            }
        }
    });
    Box::new(reader)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncReadExt;

    #[tokio::test]
    async fn test_listing_shows_direct_children() {
        let factory = MockRepository::new()
            .with_file("AI/mods/a.zipmod", b"abc".to_vec())
            .with_file("AI/mods/sub/b.zipmod", b"de".to_vec())
            .with_directory("AI/mods/empty")
            .into_factory();
        let mut client = factory.create();
        client.connect().await.unwrap();

        let mut names: Vec<_> = client
            .list_directory("/AI/mods")
            .await
            .unwrap()
            .into_iter()
            .map(|entry| entry.name)
            .collect();
        names.sort();
        assert_eq!(names, ["a.zipmod", "empty", "sub"]);

        let error = client.list_directory("/AI/missing").await.unwrap_err();
        assert!(!error.is_recoverable());
    }

    #[tokio::test]
    async fn test_scripted_open_failure_fires_once() {
        let factory = MockRepository::new()
            .with_file("AI/a.bin", (0u8..10).collect::<Vec<_>>())
            .fail_opens("/AI/a.bin", 1)
            .into_factory();
        let mut client = factory.create();
        client.connect().await.unwrap();

        assert!(client.open_read_range("/AI/a.bin", 0, 4).await.is_err());
        let mut stream = client.open_read_range("/AI/a.bin", 2, 6).await.unwrap();
        let mut read = Vec::new();
        stream.read_to_end(&mut read).await.unwrap();
        assert_eq!(read, [2, 3, 4, 5]);
        assert_eq!(factory.repository().opens(), 2);
    }

    #[tokio::test]
    async fn test_throttled_stream_delivers_everything() {
        let factory = MockRepository::new()
            .with_file("a.bin", vec![7u8; 100])
            .throttled(16, Duration::from_millis(1))
            .into_factory();
        let mut client = factory.create();
        client.connect().await.unwrap();

        let mut stream = client.open_read_range("a.bin", 10, 90).await.unwrap();
        let mut read = Vec::new();
        stream.read_to_end(&mut read).await.unwrap();
        assert_eq!(read.len(), 80);
    }

    #[tokio::test]
    async fn test_refused_connects() {
        let factory = MockRepository::new().fail_connects(1).into_factory();
        let mut client = factory.create();
        tokio_test::assert_err!(client.connect().await);
        tokio_test::assert_ok!(client.connect().await);
        assert_eq!(factory.repository().connects(), 1);
    }
}
