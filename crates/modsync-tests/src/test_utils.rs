//! Unified test utilities for modsync tests and benchmarks
//!
//! Data generators, fixture trees and engine settings tuned for fast test runs.

use modsync_engine::CancelScopeStack;
use modsync_sync::{PackRoot, ProgressEvent, SyncEngine, SyncSettings};
use modsync_types::{DownloadConfig, PathMapping, ProgressConfig, RetryConfig, ScanConfig};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::mpsc::UnboundedReceiver;
use tokio_util::sync::CancellationToken;

use crate::mock_repository::{MockFactory, MockRepository};

/// Remote root every fixture pack hangs off
pub const REMOTE_ROOT: &str = "/AI";

/// Common sizes used across tests
pub struct CommonSizes;

impl CommonSizes {
    /// 1 KiB
    pub const KIB: usize = 1024;
    /// 1 MiB
    pub const MIB: usize = 1024 * 1024;
    /// Chunk size the default configuration splits files at
    pub const DEFAULT_CHUNK: usize = 10 * Self::MIB;
}

/// Deterministic, non-repeating-looking bytes; `seed` tells files apart
pub fn pattern_bytes(len: usize, seed: u8) -> Vec<u8> {
    (0..len)
        .map(|i| ((i * 7 + 13) % 251) as u8 ^ seed)
        .collect()
}

/// Write `contents` to `path`, creating parent directories
pub fn write_file(path: &Path, contents: &[u8]) {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).expect("Failed to create parent directory");
    }
    fs::write(path, contents).expect("Failed to write test file");
}

/// Every regular file under `root`, relative and `/`-separated, sorted
pub fn list_tree(root: &Path) -> Vec<String> {
    let mut files: Vec<String> = walkdir::WalkDir::new(root)
        .into_iter()
        .filter_map(std::result::Result::ok)
        .filter(|entry| entry.file_type().is_file())
        .filter_map(|entry| {
            entry.path().strip_prefix(root).ok().map(|relative| {
                relative
                    .components()
                    .map(|c| c.as_os_str().to_string_lossy().into_owned())
                    .collect::<Vec<_>>()
                    .join("/")
            })
        })
        .collect();
    files.sort();
    files
}

/// One pack of a fixture: name, directory under both roots, deletion flag
#[derive(Debug, Clone)]
pub struct PackSpec {
    /// Display name
    pub name: &'static str,
    /// Directory below the remote root and the local base
    pub directory: &'static str,
    /// Whether unmatched local files may be removed
    pub delete_client_files: bool,
}

impl PackSpec {
    /// A pack that may delete local files
    pub const fn managed(name: &'static str, directory: &'static str) -> Self {
        Self {
            name,
            directory,
            delete_client_files: true,
        }
    }

    /// A pack that never deletes local files
    pub const fn user(name: &'static str, directory: &'static str) -> Self {
        Self {
            name,
            directory,
            delete_client_files: false,
        }
    }

    /// Root mapping of this pack under `local_base`
    pub fn mapping(&self, local_base: &Path) -> PathMapping {
        PathMapping::new(REMOTE_ROOT, local_base, self.directory, self.directory)
            .with_delete_client_files(self.delete_client_files)
    }
}

/// Scanner tuning with short waits
pub fn fast_scan_config() -> ScanConfig {
    ScanConfig {
        idle_poll_ms: 2,
        requeue_delay_ms: 1,
        ..ScanConfig::default()
    }
}

/// Engine settings for `packs` under `local_base`
pub fn fast_settings(
    local_base: &Path,
    packs: &[PackSpec],
    download: DownloadConfig,
) -> SyncSettings {
    SyncSettings {
        packs: packs
            .iter()
            .map(|pack| PackRoot {
                name: pack.name.to_string(),
                mapping: pack.mapping(local_base),
            })
            .collect(),
        scan: fast_scan_config(),
        scan_workers: 3,
        download,
        download_workers: 4,
        retry: RetryConfig::immediate(1),
        progress: ProgressConfig {
            update_interval_ms: 0,
            ..ProgressConfig::default()
        },
    }
}

/// Local side of a test: a temporary base directory
pub struct LocalTree {
    dir: tempfile::TempDir,
}

impl LocalTree {
    /// Create an empty local tree
    pub fn new() -> Self {
        Self {
            dir: tempfile::TempDir::new().expect("Failed to create temp dir"),
        }
    }

    /// Base directory
    pub fn base(&self) -> &Path {
        self.dir.path()
    }

    /// Absolute path of `relative`
    pub fn path(&self, relative: &str) -> PathBuf {
        relative
            .split('/')
            .fold(self.dir.path().to_path_buf(), |path, part| path.join(part))
    }

    /// Write a local file
    pub fn write(&self, relative: &str, contents: &[u8]) {
        write_file(&self.path(relative), contents);
    }

    /// Read a local file
    pub fn read(&self, relative: &str) -> Vec<u8> {
        fs::read(self.path(relative)).expect("Failed to read local file")
    }

    /// Every file in the tree
    pub fn files(&self) -> Vec<String> {
        list_tree(self.base())
    }
}

impl Default for LocalTree {
    fn default() -> Self {
        Self::new()
    }
}

/// Build an engine over `repository` and hand back its factory for assertions
pub fn engine_for(repository: MockRepository, settings: SyncSettings) -> (SyncEngine, MockFactory) {
    let factory = repository.into_factory();
    let engine = SyncEngine::new(
        settings,
        Arc::new(factory.clone()),
        CancelScopeStack::new(CancellationToken::new()),
    );
    (engine, factory)
}

/// Drain every event the sender side left behind
pub async fn collect_events(mut events: UnboundedReceiver<ProgressEvent>) -> Vec<ProgressEvent> {
    let mut collected = Vec::new();
    while let Some(event) = events.recv().await {
        collected.push(event);
    }
    collected
}

/// How many completion events `events` holds for `path`
pub fn completions(events: &[ProgressEvent], path: &Path) -> usize {
    events
        .iter()
        .filter(|event| {
            matches!(event, ProgressEvent::FileCompleted { path: done, .. } if done == path)
        })
        .count()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pattern_bytes_differ_by_seed() {
        let a = pattern_bytes(CommonSizes::KIB, 0);
        let b = pattern_bytes(CommonSizes::KIB, 1);
        assert_eq!(a.len(), CommonSizes::KIB);
        assert_ne!(a, b);
        assert_eq!(a, pattern_bytes(CommonSizes::KIB, 0));
    }

    #[test]
    fn test_local_tree_lists_relative_paths() {
        let tree = LocalTree::new();
        tree.write("mods/sub/a.zipmod", b"a");
        tree.write("UserData/b.png", b"b");
        assert_eq!(tree.files(), ["UserData/b.png", "mods/sub/a.zipmod"]);
        assert_eq!(tree.read("mods/sub/a.zipmod"), b"a");
    }

    #[test]
    fn test_pack_mapping_points_at_remote_root() {
        let tree = LocalTree::new();
        let mapping = PackSpec::managed("Main", "mods").mapping(tree.base());
        assert_eq!(mapping.remote_full_path(), "/AI/mods");
        assert_eq!(mapping.local_full_path(), tree.path("mods"));
        assert!(mapping.delete_client_files());
    }
}
