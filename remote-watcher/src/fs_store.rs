//! A [`RemoteStore`] backed by a directory tree, e.g. a network mount.

use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use std::time::UNIX_EPOCH;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::fs;
use tracing::debug;

use crate::checksum::sha256_file;
use crate::entry::{DirectoryEntry, EntryType};
use crate::error::StoreError;
use crate::store::{ContentStream, ObjectMetadata, RemoteStore, StoreFactory, StoreResult};

/// Environment variable naming the root directory for [`FsStoreFactory::from_env`].
pub const ROOT_ENV_VAR: &str = "CODEX_REMOTE_WATCHER_ROOT";

/// Store that serves remote paths from a local root directory.
///
/// Remote path `/a/b` maps to `<root>/a/b`. Etags are derived from size and
/// modification time, checksums are computed on demand.
#[derive(Debug, Clone)]
pub struct FsStore {
    root: PathBuf,
}

impl FsStore {
    /// Create a store rooted at `root`.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Root directory.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Map a remote path under the root, refusing paths that would leave it.
    fn resolve(&self, remote: &str) -> StoreResult<PathBuf> {
        let relative = Path::new(remote.trim_start_matches('/'));
        let escapes = relative
            .components()
            .any(|c| !matches!(c, Component::Normal(_) | Component::CurDir));
        if escapes {
            return Err(StoreError::request(format!(
                "{remote} is outside the store root"
            )));
        }

        if relative.as_os_str().is_empty() {
            Ok(self.root.clone())
        } else {
            Ok(self.root.join(relative))
        }
    }
}

fn map_io(err: std::io::Error, remote: &str) -> StoreError {
    if err.kind() == std::io::ErrorKind::NotFound {
        StoreError::NotFound(remote.to_string())
    } else {
        StoreError::Io(err)
    }
}

fn modified_at(metadata: &std::fs::Metadata) -> DateTime<Utc> {
    metadata
        .modified()
        .map(DateTime::<Utc>::from)
        .unwrap_or_default()
}

fn etag_for(metadata: &std::fs::Metadata) -> String {
    let nanos = metadata
        .modified()
        .ok()
        .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
        .map_or(0, |d| d.as_nanos());
    format!("{:x}-{nanos:x}", metadata.len())
}

#[async_trait]
impl RemoteStore for FsStore {
    async fn list(&self, directory: &str) -> StoreResult<Vec<DirectoryEntry>> {
        let path = self.resolve(directory)?;
        let mut reader = fs::read_dir(&path)
            .await
            .map_err(|e| map_io(e, directory))?;

        let mut entries = Vec::new();
        while let Some(dirent) = reader.next_entry().await? {
            let Some(name) = dirent.file_name().to_str().map(str::to_string) else {
                debug!("Skipping non UTF-8 name in {}", path.display());
                continue;
            };
            // Entries can vanish between read_dir and metadata.
            let metadata = match dirent.metadata().await {
                Ok(metadata) => metadata,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
                Err(e) => return Err(StoreError::Io(e)),
            };

            let entry = if metadata.is_dir() {
                DirectoryEntry {
                    name,
                    entry_type: EntryType::Directory,
                    etag: None,
                    mtime: modified_at(&metadata),
                    parent: directory.to_string(),
                    size: None,
                }
            } else {
                DirectoryEntry {
                    name,
                    entry_type: EntryType::Object,
                    etag: Some(etag_for(&metadata)),
                    mtime: modified_at(&metadata),
                    parent: directory.to_string(),
                    size: Some(metadata.len()),
                }
            };
            entries.push(entry);
        }

        entries.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(entries)
    }

    async fn fetch_metadata(&self, path: &str) -> StoreResult<ObjectMetadata> {
        let local = self.resolve(path)?;
        let metadata = fs::metadata(&local).await.map_err(|e| map_io(e, path))?;
        let content_hash = sha256_file(&local).await.map_err(|e| map_io(e, path))?;

        Ok(ObjectMetadata {
            size: metadata.len(),
            content_hash: Some(content_hash),
        })
    }

    async fn fetch_content(&self, path: &str) -> StoreResult<ContentStream> {
        let file = fs::File::open(self.resolve(path)?)
            .await
            .map_err(|e| map_io(e, path))?;
        Ok(Box::new(file))
    }
}

/// Builds an [`FsStore`] from an explicit root or the environment.
#[derive(Debug, Clone, Default)]
pub struct FsStoreFactory {
    root: Option<PathBuf>,
}

impl FsStoreFactory {
    /// Factory with an explicit root.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: Some(root.into()),
        }
    }

    /// Factory that reads the root from [`ROOT_ENV_VAR`] when creating the store.
    pub fn from_env() -> Self {
        Self { root: None }
    }
}

impl StoreFactory for FsStoreFactory {
    fn create(&self) -> StoreResult<Arc<dyn RemoteStore>> {
        let root = match &self.root {
            Some(root) => root.clone(),
            None => std::env::var_os(ROOT_ENV_VAR)
                .map(PathBuf::from)
                .ok_or_else(|| StoreError::request(format!("{ROOT_ENV_VAR} is not set")))?,
        };
        Ok(Arc::new(FsStore::new(root)))
    }
}
