//! Download progress tracking
//!
//! Workers report every buffer they write through [`TransferObserver`]. The
//! tracker folds those deltas into per-file and run-wide counters with atomics and
//! derives speeds and ETAs from them. Subscribers receive [`ProgressEvent`]s over
//! an unbounded channel, throttled to the configured UI interval; completions are
//! never throttled.

use modsync_types::{Error, ErrorContext, ProgressConfig, Result, TransferObserver};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tracing::debug;

/// Instantaneous speed measured as the byte delta across a fixed window
#[derive(Debug)]
struct SpeedSampler {
    window: Duration,
    state: Mutex<SamplerState>,
}

#[derive(Debug)]
struct SamplerState {
    taken_at: Instant,
    bytes_at: u64,
    speed: f64,
}

impl SpeedSampler {
    fn new(window: Duration) -> Self {
        Self {
            window,
            state: Mutex::new(SamplerState {
                taken_at: Instant::now(),
                bytes_at: 0,
                speed: 0.0,
            }),
        }
    }

    /// Update with the current byte count and return the latest speed
    fn sample(&self, bytes: u64) -> f64 {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        let elapsed = state.taken_at.elapsed();
        if elapsed >= self.window && !elapsed.is_zero() {
            state.speed = bytes.saturating_sub(state.bytes_at) as f64 / elapsed.as_secs_f64();
            state.bytes_at = bytes;
            state.taken_at = Instant::now();
        }
        state.speed
    }
}

/// Minimum spacing between emitted updates
#[derive(Debug)]
struct Throttle {
    interval: Duration,
    last: Mutex<Option<Instant>>,
}

impl Throttle {
    fn new(interval: Duration) -> Self {
        Self {
            interval,
            last: Mutex::new(None),
        }
    }

    fn ready(&self) -> bool {
        let mut last = self.last.lock().unwrap_or_else(PoisonError::into_inner);
        match *last {
            Some(at) if at.elapsed() < self.interval => false,
            _ => {
                *last = Some(Instant::now());
                true
            }
        }
    }
}

/// Progress of one destination file
#[derive(Debug)]
struct FileProgress {
    path: PathBuf,
    total: u64,
    downloaded: AtomicU64,
    complete: AtomicBool,
    started: Instant,
    speed: SpeedSampler,
    throttle: Throttle,
}

impl FileProgress {
    fn snapshot(&self) -> FileSnapshot {
        let downloaded = self.downloaded.load(Ordering::Acquire);
        let elapsed = self.started.elapsed();
        let average_speed = average(downloaded, elapsed);
        FileSnapshot {
            path: self.path.clone(),
            total: self.total,
            downloaded,
            current_speed: self.speed.sample(downloaded),
            average_speed,
            eta: eta(self.total.saturating_sub(downloaded), average_speed),
        }
    }
}

/// Point-in-time view of one file
#[derive(Debug, Clone, PartialEq)]
pub struct FileSnapshot {
    /// Destination file
    pub path: PathBuf,
    /// Declared size
    pub total: u64,
    /// Bytes on disk
    pub downloaded: u64,
    /// Speed over the last sample window, bytes per second
    pub current_speed: f64,
    /// Bytes per second since the first byte arrived
    pub average_speed: f64,
    /// Time left at the average speed
    pub eta: Option<Duration>,
}

/// Point-in-time view of the whole run
#[derive(Debug, Clone, PartialEq)]
pub struct ProgressSnapshot {
    /// Bytes planned for download
    pub total_bytes: u64,
    /// Bytes on disk
    pub downloaded_bytes: u64,
    /// Files planned for download
    pub total_files: usize,
    /// Files whose last byte arrived
    pub files_done: usize,
    /// Files that received bytes but are not done
    pub files_in_progress: usize,
    /// Files that have not received a byte yet
    pub files_queued: usize,
    /// Speed over the last sample window, bytes per second
    pub current_speed: f64,
    /// Bytes per second since tracking started
    pub average_speed: f64,
    /// Time left at the average speed
    pub eta: Option<Duration>,
    /// Time since tracking started
    pub elapsed: Duration,
}

impl ProgressSnapshot {
    /// Completed fraction in percent
    pub fn percent(&self) -> f64 {
        if self.total_bytes == 0 {
            if self.total_files == self.files_done {
                100.0
            } else {
                0.0
            }
        } else {
            self.downloaded_bytes as f64 / self.total_bytes as f64 * 100.0
        }
    }
}

impl std::fmt::Display for ProgressSnapshot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} done / {} in progress / {} remaining: {} / {} (current speed: {}) (average speed: {})",
            self.files_done,
            self.files_in_progress,
            self.files_queued,
            format_bytes(self.downloaded_bytes),
            format_bytes(self.total_bytes),
            format_speed(self.current_speed),
            format_speed(self.average_speed)
        )
    }
}

/// Progress event types
#[derive(Debug, Clone, PartialEq)]
pub enum ProgressEvent {
    /// The first byte of a file arrived
    FileStarted {
        /// Destination file
        path: PathBuf,
        /// Declared size
        total: u64,
    },
    /// A file made progress
    FileUpdated(FileSnapshot),
    /// The last byte of a file arrived
    FileCompleted {
        /// Destination file
        path: PathBuf,
        /// Declared size
        total: u64,
    },
    /// Run-wide progress
    Totals(ProgressSnapshot),
}

/// Shared progress context handed to every download worker
#[derive(Debug)]
pub struct DownloadProgress {
    files: RwLock<HashMap<PathBuf, Arc<FileProgress>>>,
    planned_files: AtomicUsize,
    planned_bytes: AtomicU64,
    downloaded: AtomicU64,
    completed: AtomicUsize,
    outstanding: AtomicUsize,
    started: Instant,
    speed: SpeedSampler,
    throttle: Throttle,
    config: ProgressConfig,
    event_tx: mpsc::UnboundedSender<ProgressEvent>,
    event_rx: Option<mpsc::UnboundedReceiver<ProgressEvent>>,
}

impl DownloadProgress {
    /// Create a tracker with the given cadence
    pub fn new(config: ProgressConfig) -> Self {
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        Self {
            files: RwLock::new(HashMap::new()),
            planned_files: AtomicUsize::new(0),
            planned_bytes: AtomicU64::new(0),
            downloaded: AtomicU64::new(0),
            completed: AtomicUsize::new(0),
            outstanding: AtomicUsize::new(0),
            started: Instant::now(),
            speed: SpeedSampler::new(config.speed_sample()),
            throttle: Throttle::new(config.update_interval()),
            config,
            event_tx,
            event_rx: Some(event_rx),
        }
    }

    /// Take the event receiver (can only be called once)
    pub fn take_event_receiver(&mut self) -> Option<mpsc::UnboundedReceiver<ProgressEvent>> {
        self.event_rx.take()
    }

    /// Declare a file that is going to be downloaded
    pub fn plan_file(&self, size: u64) {
        self.planned_files.fetch_add(1, Ordering::Relaxed);
        self.outstanding.fetch_add(1, Ordering::Relaxed);
        self.planned_bytes.fetch_add(size, Ordering::Relaxed);
    }

    /// Record `delta` more bytes of `path`
    ///
    /// Returns `true` when this call completed the file.
    pub fn record(&self, path: &Path, file_size: u64, delta: u64) -> Result<bool> {
        let file = self.entry(path, file_size);
        let downloaded = file
            .downloaded
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
                current.checked_add(delta).filter(|next| *next <= file.total)
            })
            .map(|previous| previous + delta)
            .map_err(|current| {
                Error::internal_with_context(
                    "downloaded bytes exceed the declared file size",
                    ErrorContext::new("record progress")
                        .with_detail("file", path.display())
                        .with_detail("size", file.total)
                        .with_detail("downloaded", current)
                        .with_detail("delta", delta),
                )
            })?;
        self.downloaded.fetch_add(delta, Ordering::AcqRel);

        let completed = downloaded == file.total && !file.complete.swap(true, Ordering::AcqRel);
        if completed {
            self.completed.fetch_add(1, Ordering::AcqRel);
            let left = self
                .outstanding
                .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1))
                .map_or(0, |n| n - 1);
            debug!(
                "Completed {}; {} remaining",
                path.display(),
                pluralize(left, "file")
            );
            self.emit(ProgressEvent::FileCompleted {
                path: file.path.clone(),
                total: file.total,
            });
        } else if file.throttle.ready() {
            self.emit(ProgressEvent::FileUpdated(file.snapshot()));
        }

        if completed || self.throttle.ready() {
            self.emit(ProgressEvent::Totals(self.snapshot()));
        }
        Ok(completed)
    }

    /// Whether the last byte of `path` arrived
    pub fn is_complete(&self, path: &Path) -> bool {
        self.read_files()
            .get(path)
            .is_some_and(|file| file.complete.load(Ordering::Acquire))
    }

    /// Bytes recorded for `path`
    pub fn downloaded(&self, path: &Path) -> u64 {
        self.read_files()
            .get(path)
            .map_or(0, |file| file.downloaded.load(Ordering::Acquire))
    }

    /// View of one file, if it started
    pub fn file_snapshot(&self, path: &Path) -> Option<FileSnapshot> {
        self.read_files().get(path).map(|file| file.snapshot())
    }

    /// Number of completed files
    pub fn completed_files(&self) -> usize {
        self.completed.load(Ordering::Acquire)
    }

    /// Planned files that have not completed
    pub fn outstanding_files(&self) -> usize {
        self.outstanding.load(Ordering::Acquire)
    }

    /// Total bytes recorded
    pub fn downloaded_bytes(&self) -> u64 {
        self.downloaded.load(Ordering::Acquire)
    }

    /// View of the whole run
    pub fn snapshot(&self) -> ProgressSnapshot {
        let downloaded_bytes = self.downloaded.load(Ordering::Acquire);
        let total_bytes = self.planned_bytes.load(Ordering::Relaxed);
        let total_files = self.planned_files.load(Ordering::Relaxed);
        let files_done = self.completed.load(Ordering::Acquire);
        let started = self.read_files().len();
        let elapsed = self.started.elapsed();
        let average_speed = average(downloaded_bytes, elapsed);

        ProgressSnapshot {
            total_bytes,
            downloaded_bytes,
            total_files,
            files_done,
            files_in_progress: started.saturating_sub(files_done),
            files_queued: total_files.saturating_sub(started),
            current_speed: self.speed.sample(downloaded_bytes),
            average_speed,
            eta: eta(total_bytes.saturating_sub(downloaded_bytes), average_speed),
            elapsed,
        }
    }

    /// Reporting cadence in use
    pub fn config(&self) -> &ProgressConfig {
        &self.config
    }

    fn entry(&self, path: &Path, file_size: u64) -> Arc<FileProgress> {
        if let Some(file) = self.read_files().get(path) {
            return Arc::clone(file);
        }
        let mut files = self.files.write().unwrap_or_else(PoisonError::into_inner);
        let mut created = false;
        let file = files
            .entry(path.to_path_buf())
            .or_insert_with(|| {
                created = true;
                Arc::new(FileProgress {
                    path: path.to_path_buf(),
                    total: file_size,
                    downloaded: AtomicU64::new(0),
                    complete: AtomicBool::new(false),
                    started: Instant::now(),
                    speed: SpeedSampler::new(self.config.speed_sample()),
                    throttle: Throttle::new(self.config.update_interval()),
                })
            })
            .clone();
        drop(files);
        if created {
            debug!("Download of {} started", path.display());
            self.emit(ProgressEvent::FileStarted {
                path: path.to_path_buf(),
                total: file_size,
            });
        }
        file
    }

    fn read_files(&self) -> std::sync::RwLockReadGuard<'_, HashMap<PathBuf, Arc<FileProgress>>> {
        self.files.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn emit(&self, event: ProgressEvent) {
        // Nobody subscribed yet
        if self.event_rx.is_some() {
            return;
        }
        let _ = self.event_tx.send(event);
    }
}

impl TransferObserver for DownloadProgress {
    fn bytes_written(&self, file: &Path, file_size: u64, delta: u64) -> Result<()> {
        self.record(file, file_size, delta).map(|_| ())
    }
}

fn average(bytes: u64, elapsed: Duration) -> f64 {
    let seconds = elapsed.as_secs_f64();
    if seconds > 0.0 {
        bytes as f64 / seconds
    } else {
        0.0
    }
}

fn eta(remaining: u64, speed: f64) -> Option<Duration> {
    if remaining == 0 {
        Some(Duration::ZERO)
    } else if speed > 0.0 {
        Some(Duration::from_secs_f64(remaining as f64 / speed))
    } else {
        None
    }
}

/// Format a byte count with binary units, moving up a unit past 1100
pub fn format_bytes(bytes: u64) -> String {
    format_byte_value(bytes as f64)
}

/// Format a transfer rate in bytes per second
pub fn format_speed(bytes_per_second: f64) -> String {
    format!("{}/s", format_byte_value(bytes_per_second))
}

fn format_byte_value(value: f64) -> String {
    const KIB: f64 = 1024.0;
    const THRESHOLD: f64 = 1100.0;

    if value.is_nan() {
        "unknown".to_string()
    } else if value < THRESHOLD {
        format!("{value:.2} B")
    } else if value < THRESHOLD * KIB {
        format!("{:.2} KiB", value / KIB)
    } else if value < THRESHOLD * KIB * KIB {
        format!("{:.2} MiB", value / (KIB * KIB))
    } else {
        format!("{:.2} GiB", value / (KIB * KIB * KIB))
    }
}

/// Format duration as human-readable string
pub fn format_duration(duration: Duration) -> String {
    let total_seconds = duration.as_secs();
    let hours = total_seconds / 3600;
    let minutes = (total_seconds % 3600) / 60;
    let seconds = total_seconds % 60;

    if hours > 0 {
        format!("{}h {}m {}s", hours, minutes, seconds)
    } else if minutes > 0 {
        format!("{}m {}s", minutes, seconds)
    } else {
        format!("{}s", seconds)
    }
}

/// "1 file", "2 files"
pub fn pluralize(count: usize, noun: &str) -> String {
    if count == 1 {
        format!("{count} {noun}")
    } else {
        format!("{count} {noun}s")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use modsync_types::ErrorKind;
    use rstest::rstest;

    fn tracker() -> DownloadProgress {
        DownloadProgress::new(ProgressConfig {
            update_interval_ms: 0,
            speed_sample_ms: 0,
        })
    }

    #[test]
    fn test_completion_fires_once() {
        let progress = tracker();
        let path = Path::new("/games/a.zipmod");
        progress.plan_file(10);

        assert!(!progress.record(path, 10, 4).unwrap());
        assert!(progress.record(path, 10, 6).unwrap());
        assert!(!progress.record(path, 10, 0).unwrap());

        assert!(progress.is_complete(path));
        assert_eq!(progress.completed_files(), 1);
        assert_eq!(progress.outstanding_files(), 0);
    }

    #[test]
    fn test_overrun_is_internal_fault() {
        let progress = tracker();
        let path = Path::new("/games/a.zipmod");
        progress.record(path, 10, 8).unwrap();

        let error = progress.record(path, 10, 3).unwrap_err();
        assert_eq!(error.kind(), ErrorKind::Internal);
        assert_eq!(progress.downloaded(path), 8);
        assert_eq!(progress.downloaded_bytes(), 8);
    }

    #[test]
    fn test_zero_length_file_completes_immediately() {
        let progress = tracker();
        progress.plan_file(0);
        assert!(progress.record(Path::new("/games/empty.txt"), 0, 0).unwrap());
        assert_eq!(progress.snapshot().files_done, 1);
    }

    #[test]
    fn test_snapshot_counts_states() {
        let progress = tracker();
        for _ in 0..3 {
            progress.plan_file(100);
        }
        progress.record(Path::new("/a"), 100, 100).unwrap();
        progress.record(Path::new("/b"), 100, 50).unwrap();

        let snapshot = progress.snapshot();
        assert_eq!(snapshot.files_done, 1);
        assert_eq!(snapshot.files_in_progress, 1);
        assert_eq!(snapshot.files_queued, 1);
        assert_eq!(snapshot.downloaded_bytes, 150);
        assert_eq!(snapshot.total_bytes, 300);
        assert!((snapshot.percent() - 50.0).abs() < f64::EPSILON);
    }

    #[tokio::test]
    async fn test_events_are_delivered() {
        let mut progress = tracker();
        let mut events = progress.take_event_receiver().unwrap();
        let path = Path::new("/games/a.zipmod");
        progress.plan_file(4);
        progress.record(path, 4, 4).unwrap();

        let first = events.recv().await.unwrap();
        assert!(matches!(first, ProgressEvent::FileStarted { total: 4, .. }));
        let second = events.recv().await.unwrap();
        assert!(matches!(second, ProgressEvent::FileCompleted { total: 4, .. }));
        let third = events.recv().await.unwrap();
        assert!(matches!(third, ProgressEvent::Totals(ref s) if s.files_done == 1));
    }

    #[test]
    fn test_updates_are_throttled() {
        let mut progress = DownloadProgress::new(ProgressConfig {
            update_interval_ms: 60_000,
            speed_sample_ms: 1000,
        });
        let mut events = progress.take_event_receiver().unwrap();
        let path = Path::new("/games/big.zipmod");
        for _ in 0..100 {
            progress.record(path, 1000, 1).unwrap();
        }

        let mut updates = 0;
        while let Ok(event) = events.try_recv() {
            if matches!(event, ProgressEvent::FileUpdated(_) | ProgressEvent::Totals(_)) {
                updates += 1;
            }
        }
        assert_eq!(updates, 2);
    }

    #[rstest]
    #[case(0, "0.00 B")]
    #[case(1099, "1099.00 B")]
    #[case(1100, "1.07 KiB")]
    #[case(10 * 1024 * 1024, "10.00 MiB")]
    #[case(1100 * 1024 * 1024, "1.07 GiB")]
    fn test_format_bytes(#[case] bytes: u64, #[case] expected: &str) {
        assert_eq!(format_bytes(bytes), expected);
    }

    #[rstest]
    #[case(0, "0 files")]
    #[case(1, "1 file")]
    #[case(2, "2 files")]
    fn test_pluralize(#[case] count: usize, #[case] expected: &str) {
        assert_eq!(pluralize(count, "file"), expected);
    }

    #[test]
    fn test_format_helpers() {
        assert_eq!(format_speed(512.0), "512.00 B/s");
        assert_eq!(format_speed(2048.0), "2.00 KiB/s");
        assert_eq!(format_duration(Duration::from_secs(65)), "1m 5s");
        assert_eq!(format_duration(Duration::from_secs(3665)), "1h 1m 5s");
    }
}
