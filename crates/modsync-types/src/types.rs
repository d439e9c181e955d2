//! Core data types for modsync
//!
//! This module provides the value types shared by the scanner, the diff engine and
//! the download engine: path mappings between the remote repository and the local
//! tree, and the decomposition of a file into download chunks.

use crate::config::{RepoConnectionInfo, DEFAULT_CHUNK_SIZE};
use crate::{Error, ErrorContext, Result};
#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Normalized index key of a remote file: its lowercased local path
pub type IndexKey = String;

/// Build the lowercased, `/`-separated key used to index a local path
pub fn normalize_key(path: &Path) -> IndexKey {
    path.to_string_lossy()
        .replace('\\', "/")
        .trim_end_matches('/')
        .to_lowercase()
}

fn join_relative(base: &str, name: &str) -> String {
    let base = base.trim_end_matches(['/', '\\']);
    let name = name.trim_start_matches(['/', '\\']);
    if base.is_empty() {
        name.to_string()
    } else {
        format!("{base}/{name}")
    }
}

/// Association between a local filesystem location and a remote repository location
///
/// Mappings are immutable once built. Extending a mapping while walking the remote
/// tree produces a new value through [`PathMapping::with_child`], so workers can share
/// a base mapping freely.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct PathMapping {
    root_base: String,
    local_base: PathBuf,
    local_relative_path: String,
    remote_relative_path: String,
    file_size: Option<u64>,
    delete_client_files: bool,
}

impl PathMapping {
    /// Create a mapping for a directory or file of unknown size
    pub fn new(
        root_base: impl Into<String>,
        local_base: impl Into<PathBuf>,
        local_relative_path: impl Into<String>,
        remote_relative_path: impl Into<String>,
    ) -> Self {
        Self {
            root_base: root_base.into(),
            local_base: local_base.into(),
            local_relative_path: local_relative_path.into(),
            remote_relative_path: remote_relative_path.into(),
            file_size: None,
            delete_client_files: false,
        }
    }

    /// Copy with the deletion-eligibility flag replaced
    #[must_use]
    pub fn with_delete_client_files(&self, delete_client_files: bool) -> Self {
        Self {
            delete_client_files,
            ..self.clone()
        }
    }

    /// Copy with the file size replaced
    #[must_use]
    pub fn with_size(&self, file_size: Option<u64>) -> Self {
        Self {
            file_size,
            ..self.clone()
        }
    }

    /// Copy extended by one path segment on both the local and the remote side
    #[must_use]
    pub fn with_child(&self, name: &str, file_size: Option<u64>) -> Self {
        Self {
            root_base: self.root_base.clone(),
            local_base: self.local_base.clone(),
            local_relative_path: join_relative(&self.local_relative_path, name),
            remote_relative_path: join_relative(&self.remote_relative_path, name),
            file_size,
            delete_client_files: self.delete_client_files,
        }
    }

    /// Remote root every relative path hangs off
    pub fn root_base(&self) -> &str {
        &self.root_base
    }

    /// Local directory every relative path hangs off
    pub fn local_base(&self) -> &Path {
        &self.local_base
    }

    /// Path relative to the local base, `/`-separated
    pub fn local_relative_path(&self) -> &str {
        &self.local_relative_path
    }

    /// Path relative to the remote root, `/`-separated
    pub fn remote_relative_path(&self) -> &str {
        &self.remote_relative_path
    }

    /// Remote file size, when known
    pub fn file_size(&self) -> Option<u64> {
        self.file_size
    }

    /// Whether unmatched local files under this mapping may be deleted
    pub fn delete_client_files(&self) -> bool {
        self.delete_client_files
    }

    /// Absolute local path
    pub fn local_full_path(&self) -> PathBuf {
        self.local_relative_path
            .split(['/', '\\'])
            .filter(|segment| !segment.is_empty())
            .fold(self.local_base.clone(), |path, segment| path.join(segment))
    }

    /// Absolute remote path
    pub fn remote_full_path(&self) -> String {
        let root = self.root_base.trim_end_matches('/');
        let relative = self.remote_relative_path.trim_start_matches('/');
        match (root.is_empty(), relative.is_empty()) {
            (true, true) => "/".to_string(),
            (false, true) => root.to_string(),
            _ => format!("{root}/{relative}"),
        }
    }

    /// Unique key of this file in the remote index
    pub fn index_key(&self) -> IndexKey {
        normalize_key(&self.local_full_path())
    }
}

/// A fixed-size byte range of one file, the unit of download work
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct DownloadChunk {
    /// Destination file
    pub local_path: PathBuf,
    /// Source file on the remote
    pub remote_path: String,
    /// First byte of the range
    pub offset: u64,
    /// Number of bytes in the range
    pub length: u32,
    /// Declared size of the whole file
    pub file_size: u64,
}

impl DownloadChunk {
    /// One past the last byte of the range
    pub fn end(&self) -> u64 {
        self.offset + u64::from(self.length)
    }

    /// The part of this chunk still missing after `written` bytes landed on disk
    pub fn remainder(&self, written: u64) -> Option<Self> {
        let length = u64::from(self.length);
        if written >= length {
            return None;
        }
        Some(Self {
            offset: self.offset + written,
            // `written < length <= u32::MAX`
            length: u32::try_from(length - written).unwrap_or(self.length),
            ..self.clone()
        })
    }
}

/// A remote file decomposed into download chunks
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileDownload {
    local_path: PathBuf,
    remote_path: String,
    total_file_size: u64,
    chunk_size: u32,
    chunks: Vec<DownloadChunk>,
}

impl FileDownload {
    /// Split a file into `chunk_size` pieces; the last one absorbs the remainder
    pub fn new(
        local_path: impl Into<PathBuf>,
        remote_path: impl Into<String>,
        total_file_size: u64,
        chunk_size: u32,
    ) -> Result<Self> {
        if chunk_size == 0 {
            return Err(Error::config("Chunk size must be greater than zero"));
        }
        let local_path = local_path.into();
        let remote_path = remote_path.into();

        let step = u64::from(chunk_size);
        let full_chunks = total_file_size / step;
        let remainder = total_file_size % step;
        let count = usize::try_from(full_chunks + u64::from(remainder > 0)).map_err(|_| {
            Error::internal_with_context(
                "too many chunks for one file",
                ErrorContext::new("plan chunks").with_detail("size", total_file_size),
            )
        })?;

        let mut chunks = Vec::with_capacity(count);
        let mut offset = 0;
        while offset < total_file_size {
            let length = u32::try_from((total_file_size - offset).min(step)).unwrap_or(chunk_size);
            chunks.push(DownloadChunk {
                local_path: local_path.clone(),
                remote_path: remote_path.clone(),
                offset,
                length,
                file_size: total_file_size,
            });
            offset += u64::from(length);
        }

        Ok(Self {
            local_path,
            remote_path,
            total_file_size,
            chunk_size,
            chunks,
        })
    }

    /// Plan the download of a scanned file mapping
    pub fn from_mapping(mapping: &PathMapping, chunk_size: u32) -> Result<Self> {
        let size = mapping.file_size().ok_or_else(|| {
            Error::internal_with_context(
                "file mapping has no size",
                ErrorContext::new("plan download")
                    .with_detail("remote", mapping.remote_full_path()),
            )
        })?;
        Self::new(
            mapping.local_full_path(),
            mapping.remote_full_path(),
            size,
            chunk_size,
        )
    }

    /// Destination file
    pub fn local_path(&self) -> &Path {
        &self.local_path
    }

    /// Source file on the remote
    pub fn remote_path(&self) -> &str {
        &self.remote_path
    }

    /// Declared size of the file
    pub fn total_file_size(&self) -> u64 {
        self.total_file_size
    }

    /// Chunk size used for the split
    pub fn chunk_size(&self) -> u32 {
        self.chunk_size
    }

    /// Chunks in offset order
    pub fn chunks(&self) -> &[DownloadChunk] {
        &self.chunks
    }

    /// Consume the plan, yielding its chunks
    pub fn into_chunks(self) -> Vec<DownloadChunk> {
        self.chunks
    }
}

/// Static description of one modpack in the repository
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct ModpackDefinition {
    /// Display name
    pub name: String,
    /// Path of the pack below the repository root
    pub remote_relative_path: String,
    /// Path of the pack below the local game directory
    pub local_relative_path: String,
    /// Whether local files missing from the pack are deleted
    #[cfg_attr(feature = "serde", serde(default))]
    pub delete_client_files: bool,
}

impl ModpackDefinition {
    /// Create a new pack definition
    pub fn new(
        name: impl Into<String>,
        remote_relative_path: impl Into<String>,
        local_relative_path: impl Into<String>,
        delete_client_files: bool,
    ) -> Self {
        Self {
            name: name.into(),
            remote_relative_path: remote_relative_path.into(),
            local_relative_path: local_relative_path.into(),
            delete_client_files,
        }
    }

    /// Root mapping of this pack for a given repository and game directory
    pub fn to_mapping(&self, connection: &RepoConnectionInfo, local_base: &Path) -> PathMapping {
        PathMapping::new(
            connection.root_path.clone(),
            local_base,
            self.local_relative_path.clone(),
            self.remote_relative_path.clone(),
        )
        .with_delete_client_files(self.delete_client_files)
    }
}

/// Kind of entry in a remote directory listing
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum EntryType {
    /// Plain file
    File,
    /// Directory
    Directory,
    /// Symbolic link
    Link,
}

/// One entry of a remote directory listing
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct RemoteEntry {
    /// Entry name without any directory part
    pub name: String,
    /// Entry kind
    pub entry_type: EntryType,
    /// Size in bytes; zero for directories and links
    pub size: u64,
}

impl RemoteEntry {
    /// A plain file
    pub fn file(name: impl Into<String>, size: u64) -> Self {
        Self {
            name: name.into(),
            entry_type: EntryType::File,
            size,
        }
    }

    /// A directory
    pub fn directory(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            entry_type: EntryType::Directory,
            size: 0,
        }
    }

    /// A symbolic link
    pub fn link(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            entry_type: EntryType::Link,
            size: 0,
        }
    }
}

/// Result of a remote stat call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct RemoteStat {
    /// Size in bytes
    pub size: u64,
}

/// Plan a file with the default chunk size
pub fn plan_download(mapping: &PathMapping) -> Result<FileDownload> {
    FileDownload::from_mapping(mapping, DEFAULT_CHUNK_SIZE)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use rstest::rstest;

    const MIB: u64 = 1024 * 1024;

    fn assert_partition(download: &FileDownload) {
        let mut expected_offset = 0;
        for chunk in download.chunks() {
            assert_eq!(chunk.offset, expected_offset, "gap or overlap");
            assert!(chunk.length > 0);
            assert!(chunk.length <= download.chunk_size());
            assert_eq!(chunk.file_size, download.total_file_size());
            expected_offset = chunk.end();
        }
        assert_eq!(expected_offset, download.total_file_size());
    }

    #[rstest]
    #[case(0, 0)]
    #[case(1, 1)]
    #[case(10 * MIB - 1, 1)]
    #[case(10 * MIB, 1)]
    #[case(10 * MIB + 1, 2)]
    #[case(24 * MIB, 3)]
    #[case(35 * MIB + 17, 4)]
    fn test_chunk_partition(#[case] size: u64, #[case] expected_chunks: usize) {
        let download =
            FileDownload::new("/game/a.zipmod", "/AI/a.zipmod", size, DEFAULT_CHUNK_SIZE).unwrap();
        assert_eq!(download.chunks().len(), expected_chunks);
        assert_partition(&download);
    }

    #[test]
    fn test_last_chunk_absorbs_remainder() {
        let download = FileDownload::new("a", "a", 24 * MIB, DEFAULT_CHUNK_SIZE).unwrap();
        let lengths: Vec<u64> = download.chunks().iter().map(|c| u64::from(c.length)).collect();
        assert_eq!(lengths, vec![10 * MIB, 10 * MIB, 4 * MIB]);
    }

    #[test]
    fn test_zero_chunk_size_rejected() {
        assert!(FileDownload::new("a", "a", 10, 0).is_err());
    }

    proptest! {
        #[test]
        fn test_chunks_cover_file(
            size in 0u64..(64 * MIB),
            chunk_size in 1u32..(16 * 1024 * 1024),
        ) {
            let download = FileDownload::new("a", "a", size, chunk_size).unwrap();
            let total: u64 = download.chunks().iter().map(|c| u64::from(c.length)).sum();
            prop_assert_eq!(total, size);
            assert_partition(&download);
        }
    }

    #[test]
    fn test_chunk_remainder() {
        let chunk = DownloadChunk {
            local_path: PathBuf::from("a"),
            remote_path: "a".to_string(),
            offset: 100,
            length: 50,
            file_size: 1000,
        };
        let rest = chunk.remainder(20).unwrap();
        assert_eq!(rest.offset, 120);
        assert_eq!(rest.length, 30);
        assert_eq!(rest.end(), chunk.end());
        assert!(chunk.remainder(50).is_none());
    }

    #[test]
    fn test_with_child_extends_both_sides() {
        let root = PathMapping::new(
            "/AI/",
            "/games/ai",
            "mods/Sideloader Modpack",
            "mods/Sideloader Modpack",
        )
        .with_delete_client_files(true);
        let child = root.with_child("Pack", None).with_child("Item.zipmod", Some(42));

        assert_eq!(child.remote_full_path(), "/AI/mods/Sideloader Modpack/Pack/Item.zipmod");
        assert_eq!(
            child.local_full_path(),
            Path::new("/games/ai")
                .join("mods")
                .join("Sideloader Modpack")
                .join("Pack")
                .join("Item.zipmod")
        );
        assert_eq!(child.file_size(), Some(42));
        assert!(child.delete_client_files());
        // the base is untouched
        assert_eq!(root.remote_relative_path(), "mods/Sideloader Modpack");
        assert_eq!(root.file_size(), None);
    }

    #[test]
    fn test_index_key_is_case_insensitive() {
        let a = PathMapping::new("/", "/games", "Mods/A.ZIPMOD", "Mods/A.ZIPMOD");
        let b = PathMapping::new("/", "/games", "mods/a.zipmod", "mods/a.zipmod");
        assert_eq!(a.index_key(), b.index_key());
        assert_eq!(a.index_key(), normalize_key(&b.local_full_path()));
    }

    #[rstest]
    #[case("/AI/", "mods", "/AI/mods")]
    #[case("/AI", "/mods", "/AI/mods")]
    #[case("/", "mods", "/mods")]
    #[case("/AI/", "", "/AI")]
    #[case("", "", "/")]
    fn test_remote_full_path(#[case] root: &str, #[case] relative: &str, #[case] expected: &str) {
        let mapping = PathMapping::new(root, "/games", relative, relative);
        assert_eq!(mapping.remote_full_path(), expected);
    }

    #[test]
    fn test_from_mapping_requires_size() {
        let mapping = PathMapping::new("/", "/games", "a", "a");
        let error = FileDownload::from_mapping(&mapping, DEFAULT_CHUNK_SIZE).unwrap_err();
        assert_eq!(error.kind(), crate::ErrorKind::Internal);

        let sized = mapping.with_size(Some(3));
        let download = plan_download(&sized).unwrap();
        assert_eq!(download.remote_path(), "/a");
        assert_eq!(download.total_file_size(), 3);
    }

    #[test]
    fn test_pack_to_mapping() {
        let connection = RepoConnectionInfo::new("mirror", "/AI/");
        let pack = ModpackDefinition::new(
            "Main",
            "mods/Sideloader Modpack",
            "mods/Sideloader Modpack",
            true,
        );
        let mapping = pack.to_mapping(&connection, Path::new("/games/ai"));
        assert!(mapping.delete_client_files());
        assert_eq!(mapping.remote_full_path(), "/AI/mods/Sideloader Modpack");
    }
}
