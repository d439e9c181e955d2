//! Filesystem-backed repository client
//!
//! [`MirrorClient`] serves a repository that is reachable as a directory tree, such
//! as a local mirror or a mounted network share. It implements the same
//! [`RemoteClient`] capability a wire-protocol client would, so the scanner and the
//! download engine cannot tell the difference.

use async_trait::async_trait;
use modsync_types::{
    ClientFactory, Error, RemoteClient, RemoteEntry, RemoteStat, RemoteStream,
    RepoConnectionInfo, Result,
};
use std::io::SeekFrom;
use std::path::{Component, Path, PathBuf};
use tokio::fs;
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tracing::{debug, trace};

/// Client for a repository rooted at a local or mounted directory
#[derive(Debug)]
pub struct MirrorClient {
    root: PathBuf,
    connected: bool,
}

impl MirrorClient {
    /// Create a client for the repository at `root`
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            connected: false,
        }
    }

    /// Directory the repository is served from
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn ensure_connected(&self) -> Result<()> {
        if self.connected {
            Ok(())
        } else {
            Err(Error::connection(format!(
                "not connected to '{}'",
                self.root.display()
            )))
        }
    }

    /// Map a repository path onto the local directory, refusing to leave the root
    fn resolve(&self, remote_path: &str) -> Result<PathBuf> {
        let relative = Path::new(remote_path.trim_start_matches(['/', '\\']));
        let mut resolved = self.root.clone();
        for component in relative.components() {
            match component {
                Component::Normal(part) => resolved.push(part),
                Component::CurDir => {}
                _ => {
                    return Err(Error::protocol(
                        None,
                        format!("path '{remote_path}' escapes the repository"),
                    ))
                }
            }
        }
        Ok(resolved)
    }
}

/// A missing remote object is a definitive rejection, not a transient condition
fn remote_error(remote_path: &str, error: std::io::Error) -> Error {
    match error.kind() {
        std::io::ErrorKind::NotFound => {
            Error::protocol(Some(550), format!("'{remote_path}': no such file or directory"))
        }
        std::io::ErrorKind::PermissionDenied => {
            Error::protocol(Some(550), format!("'{remote_path}': permission denied"))
        }
        _ => Error::from(error),
    }
}

#[async_trait]
impl RemoteClient for MirrorClient {
    async fn connect(&mut self) -> Result<()> {
        let metadata = fs::metadata(&self.root).await.map_err(|e| {
            Error::connection(format!(
                "repository '{}' is not reachable: {}",
                self.root.display(),
                e
            ))
        })?;
        if !metadata.is_dir() {
            return Err(Error::protocol(
                None,
                format!("repository '{}' is not a directory", self.root.display()),
            ));
        }
        self.connected = true;
        debug!("Connected to repository at {}", self.root.display());
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
        let directory = self.resolve(path)?;
        let mut reader = fs::read_dir(&directory)
            .await
            .map_err(|e| remote_error(path, e))?;

        let mut entries = Vec::new();
        while let Some(entry) = reader.next_entry().await.map_err(|e| remote_error(path, e))? {
            let name = entry.file_name().to_string_lossy().into_owned();
            let file_type = entry.file_type().await.map_err(|e| remote_error(path, e))?;
            let listed = if file_type.is_symlink() {
                RemoteEntry::link(name)
            } else if file_type.is_dir() {
                RemoteEntry::directory(name)
            } else {
                let size = entry.metadata().await.map_err(|e| remote_error(path, e))?.len();
                RemoteEntry::file(name, size)
            };
            entries.push(listed);
        }

        trace!("Listed {} entries in {}", entries.len(), path);
        Ok(entries)
    }

    async fn open_read_range(&mut self, path: &str, start: u64, end: u64) -> Result<RemoteStream> {
        self.ensure_connected()?;
        if end < start {
            return Err(Error::internal(format!(
                "inverted range {start}..{end} requested for '{path}'"
            )));
        }
        let local = self.resolve(path)?;
        let mut file = fs::File::open(&local)
            .await
            .map_err(|e| remote_error(path, e))?;
        file.seek(SeekFrom::Start(start)).await?;
        Ok(Box::new(file.take(end - start)))
    }

    async fn stat(&mut self, path: &str) -> Result<RemoteStat> {
        self.ensure_connected()?;
        let local = self.resolve(path)?;
        let metadata = fs::metadata(&local)
            .await
            .map_err(|e| remote_error(path, e))?;
        if !metadata.is_file() {
            return Err(Error::protocol(Some(550), format!("'{path}' is not a file")));
        }
        Ok(RemoteStat {
            size: metadata.len(),
        })
    }
}

/// Creates [`MirrorClient`]s for a repository directory
#[derive(Debug, Clone)]
pub struct MirrorClientFactory {
    root: PathBuf,
}

impl MirrorClientFactory {
    /// Create a factory for the repository at `root`
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Build a factory from a connection descriptor
    ///
    /// The address must be a `file://` URL or a path to an existing directory.
    pub fn from_connection(connection: &RepoConnectionInfo) -> Result<Self> {
        let address = connection.address.trim();
        if let Some(path) = address.strip_prefix("file://") {
            return Ok(Self::new(path));
        }
        let candidate = Path::new(address);
        if candidate.is_dir() {
            return Ok(Self::new(candidate));
        }
        Err(Error::config(format!(
            "no transport available for '{address}'; point connection.address at a file:// repository"
        )))
    }
}

impl ClientFactory for MirrorClientFactory {
    fn create(&self) -> Box<dyn RemoteClient> {
        Box::new(MirrorClient::new(self.root.clone()))
    }

    fn describe(&self) -> String {
        format!("file://{}", self.root.display())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use modsync_types::{EntryType, ErrorKind};
    use tempfile::TempDir;
    use tokio::io::AsyncReadExt;

    async fn connected(dir: &TempDir) -> MirrorClient {
        let mut client = MirrorClient::new(dir.path());
        client.connect().await.unwrap();
        client
    }

    #[tokio::test]
    async fn test_list_directory_classifies_entries() {
        let dir = TempDir::new().unwrap();
        std::fs::create_dir_all(dir.path().join("AI/mods/sub")).unwrap();
        std::fs::write(dir.path().join("AI/mods/a.zipmod"), b"12345").unwrap();

        let mut client = connected(&dir).await;
        let mut entries = client.list_directory("/AI/mods").await.unwrap();
        entries.sort_by(|a, b| a.name.cmp(&b.name));

        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0], RemoteEntry::file("a.zipmod", 5));
        assert_eq!(entries[1].entry_type, EntryType::Directory);
    }

    #[tokio::test]
    async fn test_read_range() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("data.bin"), b"0123456789").unwrap();

        let mut client = connected(&dir).await;
        let mut stream = client.open_read_range("/data.bin", 3, 7).await.unwrap();
        let mut out = Vec::new();
        stream.read_to_end(&mut out).await.unwrap();
        assert_eq!(out, b"3456");
        assert_eq!(client.stat("data.bin").await.unwrap().size, 10);
    }

    #[tokio::test]
    async fn test_requires_connection() {
        let dir = TempDir::new().unwrap();
        let mut client = MirrorClient::new(dir.path());
        let error = client.list_directory("/").await.unwrap_err();
        assert_eq!(error.kind(), ErrorKind::Connection);
    }

    #[tokio::test]
    async fn test_missing_paths_are_permanent() {
        let dir = TempDir::new().unwrap();
        let mut client = connected(&dir).await;
        let error = client.stat("/nope.zipmod").await.unwrap_err();
        assert_eq!(error.kind(), ErrorKind::Protocol);
        assert!(!error.is_recoverable());
    }

    #[tokio::test]
    async fn test_escaping_paths_are_rejected() {
        let dir = TempDir::new().unwrap();
        let mut client = connected(&dir).await;
        assert!(client.list_directory("/../etc").await.is_err());
    }

    #[tokio::test]
    async fn test_unreachable_root_is_a_connection_fault() {
        let mut client = MirrorClient::new("/definitely/not/mounted");
        let error = client.connect().await.unwrap_err();
        assert_eq!(error.kind(), ErrorKind::Connection);
    }

    #[test]
    fn test_factory_from_connection() {
        let dir = TempDir::new().unwrap();
        let url = format!("file://{}", dir.path().display());
        let factory =
            MirrorClientFactory::from_connection(&RepoConnectionInfo::new(url, "/")).unwrap();
        assert!(factory.describe().starts_with("file://"));

        let remote = RepoConnectionInfo::new("sideload.example.com", "/AI/");
        assert!(MirrorClientFactory::from_connection(&remote).is_err());
    }
}
