//! Reconciliation of the remote file index against the local tree
//!
//! Every local file under a pack root is looked up in the remote index by its
//! normalized path. A size match means the file is current and drops out of the
//! index; whatever is left in the index afterwards has to be downloaded. Local files
//! without a match are deleted, but only under roots that allow it.

use crate::scanner::RemoteIndex;
use modsync_types::{normalize_key, Error, IndexKey, PathMapping, Result};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};
use walkdir::WalkDir;

/// Extension of an asset the user disabled locally
pub const DISABLED_EXTENSION: &str = "zi_mod";
/// Extension the repository serves the same asset under
pub const CANONICAL_EXTENSION: &str = "zipmod";

/// Outcome of a reconciliation
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DiffResult {
    /// Remote files missing or different locally, sorted by local path
    pub to_download: Vec<PathMapping>,
    /// Local files to remove, sorted
    pub to_delete: Vec<PathBuf>,
    /// Local files that already match the remote
    pub up_to_date: usize,
}

impl DiffResult {
    /// Bytes the download set adds up to
    pub fn download_bytes(&self) -> u64 {
        self.to_download
            .iter()
            .filter_map(PathMapping::file_size)
            .sum()
    }

    /// Nothing to download and nothing to delete
    pub fn is_empty(&self) -> bool {
        self.to_download.is_empty() && self.to_delete.is_empty()
    }
}

/// Compares a remote index with the local filesystem
#[derive(Debug, Clone, Default)]
pub struct DiffEngine;

impl DiffEngine {
    /// Create a new diff engine
    pub fn new() -> Self {
        Self
    }

    /// Reconcile on the blocking thread pool
    pub async fn reconcile_async(
        &self,
        roots: Vec<PathMapping>,
        index: RemoteIndex,
    ) -> Result<DiffResult> {
        let engine = self.clone();
        tokio::task::spawn_blocking(move || engine.reconcile(&roots, index))
            .await
            .map_err(|e| Error::internal(format!("diff task failed: {e}")))?
    }

    /// Classify every local file under `roots` against `index`
    ///
    /// Any error while walking a root discards that root's deletions and fails the
    /// whole reconciliation once all roots were visited.
    pub fn reconcile(&self, roots: &[PathMapping], mut index: RemoteIndex) -> Result<DiffResult> {
        let mut result = DiffResult::default();
        let mut matched: HashSet<IndexKey> = HashSet::new();
        let mut errors = Vec::new();

        for root in roots {
            let base = root.local_full_path();
            if !base.exists() {
                debug!("Local root {} does not exist yet", base.display());
                continue;
            }

            let mut deletions = Vec::new();
            let mut current = 0;
            let mut walk_failed = false;

            for entry in WalkDir::new(&base).follow_links(false) {
                let entry = match entry {
                    Ok(entry) => entry,
                    Err(error) => {
                        warn!("Could not access {}: {}", base.display(), error);
                        errors.push(walk_error(&base, &error));
                        walk_failed = true;
                        break;
                    }
                };
                if !entry.file_type().is_file() {
                    continue;
                }

                let size = match entry.metadata() {
                    Ok(metadata) => metadata.len(),
                    Err(error) => {
                        errors.push(walk_error(entry.path(), &error));
                        walk_failed = true;
                        break;
                    }
                };

                let (key, disabled) = lookup_key(entry.path());
                let is_current = match index.get(&key) {
                    Some(remote) => disabled || remote.file_size() == Some(size),
                    None => matched.contains(&key),
                };

                if is_current {
                    index.remove(&key);
                    matched.insert(key);
                    current += 1;
                } else if root.delete_client_files() {
                    deletions.push(entry.into_path());
                }
            }

            if walk_failed {
                continue;
            }
            debug!(
                "{}: {} current, {} to delete",
                base.display(),
                current,
                deletions.len()
            );
            result.up_to_date += current;
            result.to_delete.extend(deletions);
        }

        if !errors.is_empty() {
            return Err(Error::aggregate(errors));
        }

        result.to_download = index.into_values().collect();
        result
            .to_download
            .sort_by(|a, b| a.local_full_path().cmp(&b.local_full_path()));
        result.to_delete.sort();

        info!(
            "Comparison found {} file(s) to download, {} to delete, {} up to date",
            result.to_download.len(),
            result.to_delete.len(),
            result.up_to_date
        );
        Ok(result)
    }
}

/// Index key for a local file; a disabled asset maps onto its canonical name
fn lookup_key(path: &Path) -> (IndexKey, bool) {
    let disabled = path
        .extension()
        .is_some_and(|ext| ext.eq_ignore_ascii_case(DISABLED_EXTENSION));
    if disabled {
        (normalize_key(&path.with_extension(CANONICAL_EXTENSION)), true)
    } else {
        (normalize_key(path), false)
    }
}

fn walk_error(path: &Path, error: &walkdir::Error) -> Error {
    let at = error.path().unwrap_or(path);
    match error.io_error() {
        Some(io) => Error::io_at(at, io),
        None => Error::Io {
            message: format!("'{}': {}", at.display(), error),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use tempfile::TempDir;

    fn root(base: &Path, relative: &str, delete: bool) -> PathMapping {
        PathMapping::new("/AI", base, relative, relative).with_delete_client_files(delete)
    }

    fn index_of(files: &[(&PathMapping, &str, u64)]) -> RemoteIndex {
        files
            .iter()
            .map(|(root, name, size)| {
                let mapping = root.with_child(name, Some(*size));
                (mapping.index_key(), mapping)
            })
            .collect::<HashMap<_, _>>()
    }

    fn write(path: &Path, len: usize) {
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(path, vec![b'x'; len]).unwrap();
    }

    #[test]
    fn test_matching_size_is_current() {
        let dir = TempDir::new().unwrap();
        let mods = root(dir.path(), "mods", true);
        write(&dir.path().join("mods/a.zipmod"), 10);
        write(&dir.path().join("mods/b.zipmod"), 3);

        let index = index_of(&[(&mods, "a.zipmod", 10), (&mods, "b.zipmod", 5)]);
        let result = DiffEngine::new().reconcile(&[mods], index).unwrap();

        assert_eq!(result.up_to_date, 1);
        assert_eq!(result.to_download.len(), 1);
        assert!(result.to_download[0].remote_full_path().ends_with("b.zipmod"));
        assert_eq!(result.to_delete, vec![dir.path().join("mods/b.zipmod")]);
    }

    #[test]
    fn test_extra_local_files_deleted_only_when_allowed() {
        let dir = TempDir::new().unwrap();
        let mods = root(dir.path(), "mods", true);
        let userdata = root(dir.path(), "UserData", false);
        write(&dir.path().join("mods/stale.zipmod"), 1);
        write(&dir.path().join("UserData/mine.png"), 1);

        let result = DiffEngine::new()
            .reconcile(&[mods, userdata], RemoteIndex::new())
            .unwrap();

        assert_eq!(result.to_delete, vec![dir.path().join("mods/stale.zipmod")]);
    }

    #[test]
    fn test_disabled_asset_matches_regardless_of_size() {
        let dir = TempDir::new().unwrap();
        let mods = root(dir.path(), "mods", true);
        write(&dir.path().join("mods/Sub/Thing.zi_mod"), 1);

        let index = index_of(&[(&mods, "sub/thing.zipmod", 999)]);
        let result = DiffEngine::new().reconcile(&[mods], index).unwrap();

        assert!(result.is_empty());
        assert_eq!(result.up_to_date, 1);
    }

    #[test]
    fn test_lookup_is_case_insensitive() {
        let dir = TempDir::new().unwrap();
        let mods = root(dir.path(), "mods", true);
        write(&dir.path().join("mods/UPPER.zipmod"), 4);

        let index = index_of(&[(&mods, "upper.zipmod", 4)]);
        let result = DiffEngine::new().reconcile(&[mods], index).unwrap();
        assert!(result.is_empty());
    }

    #[test]
    fn test_missing_root_downloads_everything() {
        let dir = TempDir::new().unwrap();
        let mods = root(dir.path(), "mods", true);
        let index = index_of(&[(&mods, "a.zipmod", 1), (&mods, "deep/b.zipmod", 2)]);

        let result = DiffEngine::new().reconcile(&[mods], index).unwrap();
        assert_eq!(result.to_download.len(), 2);
        assert_eq!(result.download_bytes(), 3);
        assert!(result.to_delete.is_empty());
    }

    #[test]
    fn test_overlapping_roots_do_not_delete_current_files() {
        let dir = TempDir::new().unwrap();
        let outer = root(dir.path(), "mods", true);
        let inner = root(dir.path(), "mods/sub", true);
        write(&dir.path().join("mods/sub/a.zipmod"), 2);

        let index = index_of(&[(&inner, "a.zipmod", 2)]);
        let result = DiffEngine::new().reconcile(&[outer, inner], index).unwrap();
        assert!(result.to_delete.is_empty());
        assert_eq!(result.up_to_date, 2);
    }

    #[tokio::test]
    async fn test_reconcile_async() {
        let dir = TempDir::new().unwrap();
        let mods = root(dir.path(), "mods", false);
        write(&dir.path().join("mods/a.zipmod"), 1);
        let index = index_of(&[(&mods, "a.zipmod", 1)]);

        let result = DiffEngine::new().reconcile_async(vec![mods], index).await.unwrap();
        assert!(result.is_empty());
    }
}
