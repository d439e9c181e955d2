//! The sync pipeline: scan, compare, delete, download, clean up

use crate::diff::{DiffEngine, DiffResult};
use crate::progress::{format_bytes, format_speed, pluralize, DownloadProgress};
use crate::scanner::{index_explicit_files, RemoteIndex, RemoteScanner, ScanStats};
use chrono::{DateTime, Local};
use modsync_config::Config;
use modsync_engine::{CancelScopeStack, InterruptPolicy, TaskOrchestrator};
use modsync_network::{ChunkDownloader, ManagedConnection};
use modsync_types::{
    ClientFactory, DownloadConfig, Error, ErrorKind, FileDownload, PathMapping, ProgressConfig,
    Result, RetryConfig, ScanConfig, TransferObserver,
};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Name of the scope the deletion pass runs in
pub const DELETION_SCOPE: &str = "File deletion";

/// Bucket for files outside every configured pack
const UNPACKED: &str = "other";

/// A configured pack root
#[derive(Debug, Clone)]
pub struct PackRoot {
    /// Display name
    pub name: String,
    /// Root directory mapping
    pub mapping: PathMapping,
}

/// Everything a run needs besides the remote itself
#[derive(Debug, Clone)]
pub struct SyncSettings {
    /// Pack roots to scan
    pub packs: Vec<PackRoot>,
    /// Scanner tuning
    pub scan: ScanConfig,
    /// Scanner pool size
    pub scan_workers: usize,
    /// Downloader tuning
    pub download: DownloadConfig,
    /// Upper bound on the downloader pool size
    pub download_workers: usize,
    /// Connect retry policy
    pub retry: RetryConfig,
    /// Progress cadence
    pub progress: ProgressConfig,
}

impl SyncSettings {
    /// Derive settings from a loaded configuration
    pub fn from_config(config: &Config) -> Self {
        let packs = config
            .packs
            .iter()
            .map(|pack| PackRoot {
                name: pack.name.clone(),
                mapping: pack.to_mapping(&config.connection, &config.local_base),
            })
            .collect();
        Self {
            packs,
            scan: config.scan.clone(),
            scan_workers: config.scan_workers(),
            download: config.download.clone(),
            download_workers: config.download_workers(),
            retry: config.retry.clone(),
            progress: config.progress.clone(),
        }
    }

    /// Root mappings of all packs
    pub fn roots(&self) -> Vec<PathMapping> {
        self.packs.iter().map(|pack| pack.mapping.clone()).collect()
    }

    fn pack_of(&self, local: &Path) -> &str {
        self.packs
            .iter()
            .filter(|pack| local.starts_with(pack.mapping.local_full_path()))
            .max_by_key(|pack| pack.mapping.local_full_path().components().count())
            .map_or(UNPACKED, |pack| pack.name.as_str())
    }
}

/// Per-run switches
#[derive(Debug, Clone, Default)]
pub struct SyncOptions {
    /// Plan only; touch nothing on disk
    pub dry_run: bool,
    /// Never delete local files
    pub no_delete: bool,
    /// Download these files instead of walking the pack roots
    pub explicit_files: Option<Vec<PathMapping>>,
}

impl SyncOptions {
    /// Options for a plain run
    pub fn new() -> Self {
        Self::default()
    }

    /// Plan only
    pub fn dry_run(mut self, dry_run: bool) -> Self {
        self.dry_run = dry_run;
        self
    }

    /// Keep extra local files
    pub fn no_delete(mut self, no_delete: bool) -> Self {
        self.no_delete = no_delete;
        self
    }

    /// Skip the tree walk and use `files` as the remote index
    pub fn explicit_files(mut self, files: Vec<PathMapping>) -> Self {
        self.explicit_files = Some(files);
        self
    }
}

/// Result of scanning the remote repository
#[derive(Debug)]
pub struct ScanOutcome {
    /// Discovered files
    pub index: RemoteIndex,
    /// Scanner counters
    pub stats: ScanStats,
    /// Faults raised by scanner workers
    pub faults: Vec<Error>,
    /// Every directory was listed
    pub complete: bool,
    /// Wall time of the scan
    pub elapsed: Duration,
}

impl ScanOutcome {
    /// Sum of all file sizes in the index
    pub fn total_bytes(&self) -> u64 {
        self.index.values().filter_map(PathMapping::file_size).sum()
    }
}

/// Files and bytes attributed to one pack
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PackTotals {
    /// File count
    pub files: usize,
    /// Byte count
    pub bytes: u64,
}

/// What a run is going to do, computed before anything is changed
#[derive(Debug)]
pub struct SyncPlan {
    run_id: Uuid,
    started: Instant,
    started_at: DateTime<Local>,
    options: SyncOptions,
    diff: DiffResult,
    scan: ScanStats,
    scan_faults: Vec<Error>,
    deletions_allowed: bool,
    pack_totals: BTreeMap<String, PackTotals>,
}

impl SyncPlan {
    /// Identifier carried into the report
    pub fn run_id(&self) -> Uuid {
        self.run_id
    }

    /// Reconciliation result
    pub fn diff(&self) -> &DiffResult {
        &self.diff
    }

    /// Files that will be downloaded
    pub fn downloads(&self) -> &[PathMapping] {
        &self.diff.to_download
    }

    /// Files that will be deleted; empty when deletion is not allowed
    pub fn deletions(&self) -> &[PathBuf] {
        if self.deletions_allowed {
            &self.diff.to_delete
        } else {
            &[]
        }
    }

    /// Pending downloads grouped by pack
    pub fn pack_totals(&self) -> &BTreeMap<String, PackTotals> {
        &self.pack_totals
    }

    /// Scanner counters
    pub fn scan_stats(&self) -> ScanStats {
        self.scan
    }

    /// Some scanner workers faulted, so the index may be missing files
    pub fn is_partial_scan(&self) -> bool {
        !self.scan_faults.is_empty()
    }

    /// Keep every local file this run
    pub fn skip_deletions(&mut self) {
        if self.deletions_allowed && !self.diff.to_delete.is_empty() {
            info!("Keeping {}", pluralize(self.diff.to_delete.len(), "file"));
        }
        self.deletions_allowed = false;
    }
}

/// Final state of a run
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncOutcome {
    /// Everything planned was done
    Completed,
    /// Some work succeeded, some faulted
    PartialSuccess,
    /// The run was interrupted
    Cancelled,
    /// Nothing useful happened
    Failed,
}

impl std::fmt::Display for SyncOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let text = match self {
            Self::Completed => "completed",
            Self::PartialSuccess => "partially completed",
            Self::Cancelled => "cancelled",
            Self::Failed => "failed",
        };
        f.write_str(text)
    }
}

/// Summary of a run
#[derive(Debug)]
pub struct SyncReport {
    /// Run identifier
    pub run_id: Uuid,
    /// Wall clock start
    pub started_at: DateTime<Local>,
    /// Total wall time
    pub elapsed: Duration,
    /// Nothing was changed on disk
    pub dry_run: bool,
    /// Files fully downloaded
    pub files_downloaded: usize,
    /// Bytes of fully downloaded files
    pub bytes_downloaded: u64,
    /// Files left unfinished because of the interrupt
    pub files_cancelled: usize,
    /// Files left unfinished because of faults
    pub files_failed: usize,
    /// Local files deleted
    pub files_deleted: usize,
    /// Local files that were already current
    pub files_up_to_date: usize,
    /// Files the run planned to download
    pub files_planned: usize,
    /// Local files the run planned to delete
    pub deletions_planned: usize,
    /// Downloaded bytes per pack
    pub pack_bytes: BTreeMap<String, u64>,
    /// Transfer rate over the download phase in bytes per second
    pub average_speed: f64,
    /// Scanner counters
    pub scan: ScanStats,
    /// Every fault of the run folded into one
    pub fault: Option<Error>,
    /// Final state
    pub outcome: SyncOutcome,
}

impl SyncReport {
    fn empty(run_id: Uuid, started_at: DateTime<Local>) -> Self {
        Self {
            run_id,
            started_at,
            elapsed: Duration::ZERO,
            dry_run: false,
            files_downloaded: 0,
            bytes_downloaded: 0,
            files_cancelled: 0,
            files_failed: 0,
            files_deleted: 0,
            files_up_to_date: 0,
            files_planned: 0,
            deletions_planned: 0,
            pack_bytes: BTreeMap::new(),
            average_speed: 0.0,
            scan: ScanStats::default(),
            fault: None,
            outcome: SyncOutcome::Completed,
        }
    }

    /// Report for a run that could not even be planned
    pub fn from_error(error: Error, started_at: DateTime<Local>, elapsed: Duration) -> Self {
        let outcome = if error.is_cancellation() {
            SyncOutcome::Cancelled
        } else {
            SyncOutcome::Failed
        };
        Self {
            elapsed,
            fault: (!error.is_cancellation()).then_some(error),
            outcome,
            ..Self::empty(Uuid::new_v4(), started_at)
        }
    }

    /// The run completed without a single fault
    pub fn is_success(&self) -> bool {
        self.outcome == SyncOutcome::Completed
    }
}

impl std::fmt::Display for SyncReport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Sync {} in {:.1?}: {} downloaded ({}, {}), {} deleted, {} up to date",
            self.outcome,
            self.elapsed,
            pluralize(self.files_downloaded, "file"),
            format_bytes(self.bytes_downloaded),
            format_speed(self.average_speed),
            pluralize(self.files_deleted, "file"),
            pluralize(self.files_up_to_date, "file"),
        )?;
        if self.files_failed > 0 {
            write!(f, ", {} failed", pluralize(self.files_failed, "file"))?;
        }
        if self.files_cancelled > 0 {
            write!(f, ", {} cancelled", pluralize(self.files_cancelled, "file"))?;
        }
        Ok(())
    }
}

/// Drives one repository through the pipeline
pub struct SyncEngine {
    settings: SyncSettings,
    factory: Arc<dyn ClientFactory>,
    scopes: CancelScopeStack,
    orchestrator: TaskOrchestrator,
    diff: DiffEngine,
}

impl std::fmt::Debug for SyncEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncEngine")
            .field("remote", &self.factory.describe())
            .field("packs", &self.settings.packs.len())
            .field("scopes", &self.scopes.depth())
            .finish_non_exhaustive()
    }
}

impl SyncEngine {
    /// Create an engine whose interrupts are routed through `scopes`
    pub fn new(
        settings: SyncSettings,
        factory: Arc<dyn ClientFactory>,
        scopes: CancelScopeStack,
    ) -> Self {
        let orchestrator = TaskOrchestrator::new(scopes.root_token());
        Self {
            settings,
            factory,
            scopes,
            orchestrator,
            diff: DiffEngine::new(),
        }
    }

    /// Settings in use
    pub fn settings(&self) -> &SyncSettings {
        &self.settings
    }

    /// The scope stack interrupts go through
    pub fn scopes(&self) -> &CancelScopeStack {
        &self.scopes
    }

    /// Walk every pack root on the remote
    ///
    /// Fails when the run is interrupted or when nothing usable came back. A scan
    /// where only some workers faulted returns the faults next to what was found.
    pub async fn scan(&self) -> Result<ScanOutcome> {
        let _scope = self.scopes.push("Scan", InterruptPolicy::Graceful);
        let workers = self.settings.scan_workers.max(1);
        let scanner =
            RemoteScanner::new(self.settings.roots(), workers, self.settings.scan.clone());

        let report = self
            .orchestrator
            .run_phase("scan", workers, |worker, token| {
                let scanner = scanner.clone();
                let factory = Arc::clone(&self.factory);
                let retry = self.settings.retry.clone();
                async move {
                    scanner
                        .run_worker(worker, factory.as_ref(), retry, &token)
                        .await
                }
            })
            .await;

        if report.interrupted {
            return Err(Error::Cancelled);
        }
        // An aborted phase cancelled its siblings mid-walk, so whatever they
        // returned is an incomplete index no matter who finished first
        let found_nothing = !report.faults.is_empty() && scanner.files_found() == 0;
        if report.aborted || report.succeeded() == 0 || found_nothing {
            return Err(report
                .into_fault()
                .unwrap_or_else(|| Error::internal("scan failed without a fault")));
        }

        let complete = report.is_clean() && scanner.pending() == 0;
        let elapsed = report.elapsed;
        let stats = scanner.stats();
        info!(
            "Scanned {} in {:.1?}",
            pluralize(stats.files_found, "file"),
            elapsed
        );
        Ok(ScanOutcome {
            index: scanner.take_index(),
            stats,
            faults: report.faults,
            complete,
            elapsed,
        })
    }

    /// Scan and compare, without changing anything
    pub async fn plan(&self, options: SyncOptions) -> Result<SyncPlan> {
        let started = Instant::now();
        let started_at = Local::now();

        let (index, roots, scan, scan_faults) = match &options.explicit_files {
            Some(files) => {
                info!("Skipping the scan, using {}", pluralize(files.len(), "explicit file"));
                let index = self.index_explicit(files.clone()).await?;
                let stats = ScanStats {
                    files_found: index.len(),
                    ..ScanStats::default()
                };
                (index, Vec::new(), stats, Vec::new())
            }
            None => {
                let outcome = self.scan().await?;
                if !outcome.complete && outcome.faults.is_empty() {
                    return Err(Error::internal("scan stopped with directories left to list"));
                }
                (outcome.index, self.settings.roots(), outcome.stats, outcome.faults)
            }
        };

        let diff = self.diff.reconcile_async(roots, index).await?;
        let deletions_allowed = scan_faults.is_empty() && !options.no_delete;
        if !scan_faults.is_empty() && !diff.to_delete.is_empty() {
            warn!(
                "The scan was incomplete, not deleting {}",
                pluralize(diff.to_delete.len(), "file")
            );
        }

        let mut pack_totals: BTreeMap<String, PackTotals> = BTreeMap::new();
        for mapping in &diff.to_download {
            let totals = pack_totals
                .entry(self.settings.pack_of(&mapping.local_full_path()).to_string())
                .or_default();
            totals.files += 1;
            totals.bytes += mapping.file_size().unwrap_or(0);
        }

        Ok(SyncPlan {
            run_id: Uuid::new_v4(),
            started,
            started_at,
            options,
            diff,
            scan,
            scan_faults,
            deletions_allowed,
            pack_totals,
        })
    }

    /// Carry out a plan
    pub async fn execute(&self, plan: SyncPlan, progress: DownloadProgress) -> SyncReport {
        let mut report = SyncReport::empty(plan.run_id, plan.started_at);
        report.dry_run = plan.options.dry_run;
        report.files_up_to_date = plan.diff.up_to_date;
        report.files_planned = plan.diff.to_download.len();
        report.deletions_planned = plan.deletions().len();
        report.scan = plan.scan;

        let mut faults = plan.scan_faults;
        if plan.options.dry_run {
            info!("Dry run, nothing was changed");
            return finish(report, faults, plan.started, Ending::Normal);
        }

        if plan.deletions_allowed && !plan.diff.to_delete.is_empty() {
            if self.orchestrator.is_cancelled() {
                report.files_cancelled = plan.diff.to_download.len();
                return finish(report, faults, plan.started, Ending::Interrupted);
            }
            let (deleted, outcome) = self.delete_files(&plan.diff.to_delete).await;
            report.files_deleted = deleted;
            match outcome {
                Ok(()) => {}
                Err(aborted) if aborted.kind() == ErrorKind::Internal => {
                    error!("{}", aborted);
                    faults.push(aborted);
                    report.files_failed = plan.diff.to_download.len();
                    return finish(report, faults, plan.started, Ending::Failed);
                }
                Err(failures) => faults.push(failures),
            }
        }

        let progress = Arc::new(progress);
        let download_started = Instant::now();
        let downloaded = self
            .download(&plan.diff.to_download, &progress, &mut faults)
            .await;

        for mapping in &plan.diff.to_download {
            if progress.is_complete(&mapping.local_full_path()) {
                let bytes = mapping.file_size().unwrap_or(0);
                report.files_downloaded += 1;
                report.bytes_downloaded += bytes;
                *report
                    .pack_bytes
                    .entry(self.settings.pack_of(&mapping.local_full_path()).to_string())
                    .or_default() += bytes;
            }
        }
        let unfinished = report.files_planned - report.files_downloaded;
        let interrupted = self.orchestrator.is_cancelled();
        if interrupted {
            report.files_cancelled = unfinished;
        } else {
            report.files_failed = unfinished;
        }
        let seconds = download_started.elapsed().as_secs_f64();
        if seconds > 0.0 {
            report.average_speed = progress.downloaded_bytes() as f64 / seconds;
        }

        let ending = if interrupted {
            Ending::Interrupted
        } else if downloaded.total_failure && report.files_downloaded == 0 {
            Ending::Failed
        } else {
            Ending::Normal
        };
        finish(report, faults, plan.started, ending)
    }

    /// Plan and execute in one go, deleting without asking
    pub async fn sync(&self, options: SyncOptions, progress: DownloadProgress) -> SyncReport {
        let started = Instant::now();
        let started_at = Local::now();
        match self.plan(options).await {
            Ok(plan) => self.execute(plan, progress).await,
            Err(error) => {
                if !error.is_cancellation() {
                    error!("Could not plan the sync: {}", error);
                }
                SyncReport::from_error(error, started_at, started.elapsed())
            }
        }
    }

    async fn index_explicit(&self, files: Vec<PathMapping>) -> Result<RemoteIndex> {
        let _scope = self.scopes.push("Scan", InterruptPolicy::Graceful);
        let token = self.orchestrator.root_token().child_token();
        let mut connection =
            ManagedConnection::new(0, self.factory.create(), self.settings.retry.clone());
        let index = index_explicit_files(files, &mut connection, &token).await;
        connection.close().await;
        index
    }

    /// Delete `paths` under a hard-abort scope
    ///
    /// An interrupt stops the pass before the next file with an internal fault.
    /// Failures to delete are collected and returned together.
    async fn delete_files(&self, paths: &[PathBuf]) -> (usize, Result<()>) {
        let scope = self.scopes.push(DELETION_SCOPE, InterruptPolicy::HardAbort);
        info!("Deleting {}", pluralize(paths.len(), "file"));

        let mut deleted = 0;
        let mut errors = Vec::new();
        for path in paths {
            if let Err(aborted) = scope.ensure_not_aborted() {
                return (deleted, Err(aborted));
            }
            match tokio::fs::remove_file(path).await {
                Ok(()) => {
                    info!("Deleted {}", path.display());
                    deleted += 1;
                }
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                    debug!("{} is already gone", path.display());
                }
                Err(e) => {
                    warn!("Could not delete {}: {}", path.display(), e);
                    errors.push(Error::io_at(path, &e));
                }
            }
        }

        info!("{} deleted", pluralize(deleted, "file"));
        if errors.is_empty() {
            (deleted, Ok(()))
        } else {
            error!("{} could not be deleted", pluralize(errors.len(), "file"));
            (deleted, Err(Error::aggregate(errors)))
        }
    }

    async fn download(
        &self,
        files: &[PathMapping],
        progress: &Arc<DownloadProgress>,
        faults: &mut Vec<Error>,
    ) -> DownloadPhase {
        let _scope = self.scopes.push("Download", InterruptPolicy::Graceful);
        let observer: Arc<dyn TransferObserver> = Arc::clone(progress) as Arc<dyn TransferObserver>;
        let downloader = ChunkDownloader::new(self.settings.download.clone(), observer);

        let mut empty = Vec::new();
        let mut chunks = 0;
        for mapping in files {
            match FileDownload::from_mapping(mapping, self.settings.download.chunk_size) {
                Ok(download) => {
                    progress.plan_file(download.total_file_size());
                    if download.chunks().is_empty() {
                        empty.push(download.local_path().to_path_buf());
                    } else {
                        chunks += download.chunks().len();
                        downloader.enqueue(download);
                    }
                }
                Err(e) => faults.push(e),
            }
        }
        if files.is_empty() {
            return DownloadPhase::default();
        }
        info!(
            "Downloading {} in {}",
            pluralize(files.len(), "file"),
            pluralize(chunks, "chunk")
        );

        for path in &empty {
            if self.orchestrator.is_cancelled() {
                break;
            }
            if let Err(e) = downloader.materialize_empty_file(path).await {
                warn!("Could not create {}: {}", path.display(), e);
                faults.push(e);
            }
        }

        let workers = self.settings.download_workers.max(1).min(chunks);
        let mut phase = DownloadPhase::default();
        if workers > 0 {
            let report = self
                .orchestrator
                .run_phase("download", workers, |worker, token| {
                    let downloader = downloader.clone();
                    let factory = Arc::clone(&self.factory);
                    let retry = self.settings.retry.clone();
                    async move {
                        downloader
                            .run_worker(worker, factory.as_ref(), retry, &token)
                            .await
                    }
                })
                .await;
            phase.total_failure = report.is_total_failure();
            faults.extend(report.faults);
            if downloader.queued() > 0 && !self.orchestrator.is_cancelled() {
                warn!("{} never downloaded", pluralize(downloader.queued(), "chunk"));
            }
        }

        let summary = downloader.stats();
        debug!(
            "Transfer finished: {} written, {} chunks completed, {} requeued",
            format_bytes(summary.bytes_written),
            summary.chunks_completed,
            summary.chunks_requeued
        );

        cleanup_incomplete(&downloader.touched_files().await, progress).await;
        phase
    }
}

#[derive(Debug, Default)]
struct DownloadPhase {
    total_failure: bool,
}

/// Remove every touched file whose last byte never arrived
async fn cleanup_incomplete(touched: &[PathBuf], progress: &DownloadProgress) -> usize {
    let mut removed = 0;
    for path in touched {
        if progress.is_complete(path) {
            continue;
        }
        match tokio::fs::remove_file(path).await {
            Ok(()) => {
                debug!("Removed incomplete {}", path.display());
                removed += 1;
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => warn!("Could not remove incomplete {}: {}", path.display(), e),
        }
    }
    if removed > 0 {
        info!("Cleaned up {}", pluralize(removed, "incomplete file"));
    }
    removed
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Ending {
    Normal,
    Interrupted,
    Failed,
}

fn finish(
    mut report: SyncReport,
    faults: Vec<Error>,
    started: Instant,
    ending: Ending,
) -> SyncReport {
    report.outcome = match ending {
        Ending::Failed => SyncOutcome::Failed,
        Ending::Interrupted => SyncOutcome::Cancelled,
        Ending::Normal if faults.is_empty() => SyncOutcome::Completed,
        Ending::Normal => SyncOutcome::PartialSuccess,
    };
    report.fault = (!faults.is_empty()).then(|| Error::aggregate(faults));
    report.elapsed = started.elapsed();
    info!("{}", report);
    report
}

#[cfg(test)]
mod tests {
    use super::*;
    use modsync_network::MirrorClientFactory;
    use modsync_types::ScanConfig;
    use tempfile::TempDir;
    use tokio_util::sync::CancellationToken;

    struct Fixture {
        remote: TempDir,
        local: TempDir,
    }

    impl Fixture {
        fn new() -> Self {
            Self {
                remote: TempDir::new().unwrap(),
                local: TempDir::new().unwrap(),
            }
        }

        fn remote_file(&self, relative: &str, contents: &[u8]) {
            write(&self.remote.path().join("AI").join(relative), contents);
        }

        fn remote_dir(&self, relative: &str) {
            std::fs::create_dir_all(self.remote.path().join("AI").join(relative)).unwrap();
        }

        fn local_file(&self, relative: &str, contents: &[u8]) {
            write(&self.local.path().join(relative), contents);
        }

        fn local(&self, relative: &str) -> PathBuf {
            self.local.path().join(relative)
        }

        fn engine(&self) -> SyncEngine {
            let pack = |name: &str, dir: &str, delete: bool| PackRoot {
                name: name.to_string(),
                mapping: PathMapping::new("/AI", self.local.path(), dir, dir)
                    .with_delete_client_files(delete),
            };
            let settings = SyncSettings {
                packs: vec![pack("Main", "mods", true), pack("UserData", "UserData", false)],
                scan: ScanConfig {
                    idle_poll_ms: 5,
                    requeue_delay_ms: 1,
                    ..ScanConfig::default()
                },
                scan_workers: 3,
                download: DownloadConfig {
                    chunk_size: 4,
                    buffer_size: 3,
                    ..DownloadConfig::default()
                },
                download_workers: 2,
                retry: RetryConfig::immediate(0),
                progress: ProgressConfig::default(),
            };
            let factory = Arc::new(MirrorClientFactory::new(self.remote.path()));
            SyncEngine::new(settings, factory, CancelScopeStack::new(CancellationToken::new()))
        }
    }

    fn write(path: &Path, contents: &[u8]) {
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(path, contents).unwrap();
    }

    #[tokio::test]
    async fn test_full_sync() {
        let fx = Fixture::new();
        fx.remote_file("mods/a.zipmod", b"hello world");
        fx.remote_file("mods/sub/b.zipmod", b"same");
        fx.remote_file("mods/empty.zipmod", b"");
        fx.remote_file("UserData/cards/c.png", b"png!");
        fx.local_file("mods/sub/b.zipmod", b"same");
        fx.local_file("mods/stale.zipmod", b"old");
        fx.local_file("UserData/mine.png", b"keep");

        let engine = fx.engine();
        let report = engine
            .sync(SyncOptions::new(), DownloadProgress::new(ProgressConfig::default()))
            .await;

        assert_eq!(report.outcome, SyncOutcome::Completed, "{:?}", report.fault);
        assert_eq!(report.files_downloaded, 3);
        assert_eq!(report.bytes_downloaded, 15);
        assert_eq!(report.files_deleted, 1);
        assert_eq!(report.files_up_to_date, 1);
        assert_eq!(report.pack_bytes.get("Main"), Some(&11));
        assert_eq!(report.pack_bytes.get("UserData"), Some(&4));

        assert_eq!(std::fs::read(fx.local("mods/a.zipmod")).unwrap(), b"hello world");
        assert_eq!(std::fs::read(fx.local("UserData/cards/c.png")).unwrap(), b"png!");
        assert_eq!(std::fs::metadata(fx.local("mods/empty.zipmod")).unwrap().len(), 0);
        assert!(!fx.local("mods/stale.zipmod").exists());
        assert!(fx.local("UserData/mine.png").exists());
    }

    #[tokio::test]
    async fn test_dry_run_changes_nothing() {
        let fx = Fixture::new();
        fx.remote_file("mods/a.zipmod", b"abc");
        fx.remote_dir("UserData");
        fx.local_file("mods/stale.zipmod", b"old");

        let engine = fx.engine();
        let plan = tokio_test::assert_ok!(engine.plan(SyncOptions::new().dry_run(true)).await);
        assert_eq!(plan.downloads().len(), 1);
        assert_eq!(plan.deletions().len(), 1);
        assert_eq!(plan.pack_totals()["Main"], PackTotals { files: 1, bytes: 3 });

        let report = engine
            .execute(plan, DownloadProgress::new(ProgressConfig::default()))
            .await;
        assert!(report.dry_run);
        assert_eq!(report.outcome, SyncOutcome::Completed);
        assert!(fx.local("mods/stale.zipmod").exists());
        assert!(!fx.local("mods/a.zipmod").exists());
    }

    #[tokio::test]
    async fn test_skipped_deletions() {
        let fx = Fixture::new();
        fx.remote_file("mods/a.zipmod", b"abc");
        fx.remote_dir("UserData");
        fx.local_file("mods/stale.zipmod", b"old");

        let engine = fx.engine();
        let mut plan = engine.plan(SyncOptions::new()).await.unwrap();
        plan.skip_deletions();
        assert!(plan.deletions().is_empty());

        let report = engine
            .execute(plan, DownloadProgress::new(ProgressConfig::default()))
            .await;
        assert_eq!(report.files_deleted, 0);
        assert!(fx.local("mods/stale.zipmod").exists());
    }

    #[tokio::test]
    async fn test_missing_remote_root_fails_the_run() {
        let fx = Fixture::new();
        let report = fx
            .engine()
            .sync(SyncOptions::new(), DownloadProgress::new(ProgressConfig::default()))
            .await;
        assert_eq!(report.outcome, SyncOutcome::Failed);
        assert!(report.fault.is_some());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_missing_pack_root_always_fails_the_run() {
        let fx = Fixture::new();
        for i in 0..12 {
            fx.remote_file(&format!("mods/d{i}/f.zipmod"), b"abc");
        }

        for _ in 0..20 {
            let engine = fx.engine();
            let error = engine
                .plan(SyncOptions::new().dry_run(true))
                .await
                .unwrap_err();
            assert!(!error.is_cancellation());

            let report = engine
                .sync(SyncOptions::new(), DownloadProgress::new(ProgressConfig::default()))
                .await;
            assert_eq!(report.outcome, SyncOutcome::Failed);
            assert_eq!(report.files_downloaded, 0);
        }
    }

    #[tokio::test]
    async fn test_interrupted_run_is_cancelled() {
        let fx = Fixture::new();
        fx.remote_file("mods/a.zipmod", b"abc");
        fx.remote_file("UserData/x", b"x");
        let engine = fx.engine();
        engine.scopes().interrupt();

        let report = engine
            .sync(SyncOptions::new(), DownloadProgress::new(ProgressConfig::default()))
            .await;
        assert_eq!(report.outcome, SyncOutcome::Cancelled);
        assert!(report.fault.is_none());
        assert!(!fx.local("mods/a.zipmod").exists());
    }

    #[tokio::test]
    async fn test_explicit_files_skip_the_scan() {
        let fx = Fixture::new();
        fx.remote_file("mods/a.zipmod", b"abc");
        fx.remote_file("mods/b.zipmod", b"not requested");
        fx.local_file("mods/stale.zipmod", b"old");

        let engine = fx.engine();
        let file = PathMapping::new("/AI", fx.local.path(), "mods/a.zipmod", "mods/a.zipmod");
        let report = engine
            .sync(
                SyncOptions::new().explicit_files(vec![file]),
                DownloadProgress::new(ProgressConfig::default()),
            )
            .await;

        assert_eq!(report.outcome, SyncOutcome::Completed);
        assert_eq!(report.files_downloaded, 1);
        assert!(!fx.local("mods/b.zipmod").exists());
        assert!(fx.local("mods/stale.zipmod").exists());
    }

    #[test]
    fn test_pack_of_prefers_deepest_root() {
        let base = Path::new("/games/ai");
        let pack = |name: &str, dir: &str| PackRoot {
            name: name.to_string(),
            mapping: PathMapping::new("/AI", base, dir, dir),
        };
        let settings = SyncSettings {
            packs: vec![pack("Mods", "mods"), pack("Studio", "mods/Studio")],
            scan: ScanConfig::default(),
            scan_workers: 1,
            download: DownloadConfig::default(),
            download_workers: 1,
            retry: RetryConfig::default(),
            progress: ProgressConfig::default(),
        };
        assert_eq!(settings.pack_of(&base.join("mods/Studio/x.zipmod")), "Studio");
        assert_eq!(settings.pack_of(&base.join("mods/x.zipmod")), "Mods");
        assert_eq!(settings.pack_of(&base.join("UserData/x.png")), UNPACKED);
    }
}
