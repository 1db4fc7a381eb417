//! Materializes changes into the local mirror.

use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::entry::DirectoryEntry;
use crate::error::{Result, SyncFailure, WatchError};
use crate::event::{Change, PreviousState};
use crate::reconcile::TEMP_PREFIX;
use crate::store::RemoteStore;

/// What the applier did for one change.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncAction {
    /// Object content was written to the mirror.
    Downloaded,

    /// A mirrored path was removed.
    Removed,

    /// Nothing to do (directories, deletion disabled, dry run).
    Skipped,
}

/// Counts of sync actions for one poll.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SyncSummary {
    /// Objects written.
    pub downloaded: usize,

    /// Paths removed.
    pub removed: usize,

    /// Changes left untouched.
    pub skipped: usize,
}

impl SyncSummary {
    fn record(&mut self, action: SyncAction) {
        match action {
            SyncAction::Downloaded => self.downloaded += 1,
            SyncAction::Removed => self.removed += 1,
            SyncAction::Skipped => self.skipped += 1,
        }
    }
}

/// Applies create, update and delete changes to a mirror directory.
pub struct SyncApplier {
    store: Arc<dyn RemoteStore>,
    mirror: PathBuf,
    allow_deletion: bool,
    dry_run: bool,
}

impl SyncApplier {
    /// Create an applier for `mirror`.
    pub fn new(store: Arc<dyn RemoteStore>, mirror: impl Into<PathBuf>) -> Self {
        Self {
            store,
            mirror: mirror.into(),
            allow_deletion: false,
            dry_run: false,
        }
    }

    /// Remove mirrored files for delete changes.
    pub fn with_deletion(mut self, allow: bool) -> Self {
        self.allow_deletion = allow;
        self
    }

    /// Log instead of touching the filesystem.
    pub fn with_dry_run(mut self, dry_run: bool) -> Self {
        self.dry_run = dry_run;
        self
    }

    /// Apply changes in order, stopping at the first failure.
    pub async fn apply_all(&self, changes: &[Change]) -> Result<SyncSummary> {
        let mut summary = SyncSummary::default();
        for change in changes {
            summary.record(self.apply(change).await?);
        }
        Ok(summary)
    }

    /// Apply a single change.
    pub async fn apply(&self, change: &Change) -> Result<SyncAction> {
        match change {
            Change::Create { new } | Change::Update { new, .. } => self.download(new).await,
            Change::Delete { old } => self.delete(old).await,
        }
    }

    async fn download(&self, entry: &DirectoryEntry) -> Result<SyncAction> {
        if !entry.is_object() {
            debug!("Not mirroring directory entry {}", entry.name);
            return Ok(SyncAction::Skipped);
        }

        let Some(target) = self.local_path(&entry.name) else {
            warn!("Not mirroring {}: name cannot be used as a local file name", entry.path());
            return Ok(SyncAction::Skipped);
        };
        if self.dry_run {
            info!("[dry-run] would download {} to {}", entry.path(), target.display());
            return Ok(SyncAction::Skipped);
        }

        let to_error = |source: SyncFailure| WatchError::Sync {
            name: entry.name.clone(),
            path: target.clone(),
            source,
        };

        fs::create_dir_all(&self.mirror)
            .await
            .map_err(|e| to_error(e.into()))?;

        let temp = self
            .mirror
            .join(format!("{TEMP_PREFIX}{}-{}", Uuid::new_v4().simple(), entry.name));

        if let Err(err) = self.fetch_to(&entry.path(), &temp).await {
            remove_temp(&temp).await;
            return Err(to_error(err));
        }

        if let Err(err) = fs::rename(&temp, &target).await {
            remove_temp(&temp).await;
            return Err(to_error(err.into()));
        }

        info!("Downloaded {} to {}", entry.path(), target.display());
        Ok(SyncAction::Downloaded)
    }

    async fn fetch_to(&self, remote: &str, temp: &Path) -> std::result::Result<(), SyncFailure> {
        let mut content = self.store.fetch_content(remote).await?;
        let mut file = fs::File::create(temp).await?;
        let written = tokio::io::copy(&mut content, &mut file).await?;
        file.flush().await?;
        file.sync_all().await?;
        debug!("Wrote {written} bytes to {}", temp.display());
        Ok(())
    }

    async fn delete(&self, old: &PreviousState) -> Result<SyncAction> {
        if !self.allow_deletion {
            debug!("Mirror deletion disabled, keeping {}", old.name());
            return Ok(SyncAction::Skipped);
        }

        let target = match old {
            PreviousState::Local(dirent) => dirent.path.clone(),
            PreviousState::Remote(entry) => match self.local_path(&entry.name) {
                Some(target) => target,
                None => {
                    debug!("{} was never mirrored, nothing to remove", entry.path());
                    return Ok(SyncAction::Skipped);
                }
            },
        };

        if self.dry_run {
            info!("[dry-run] would remove {}", target.display());
            return Ok(SyncAction::Skipped);
        }

        match remove_recursive(&target).await {
            Ok(()) => {
                info!("Removed {}", target.display());
                Ok(SyncAction::Removed)
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                debug!("{} already gone", target.display());
                Ok(SyncAction::Skipped)
            }
            Err(e) => Err(WatchError::Sync {
                name: old.name().to_string(),
                path: target,
                source: e.into(),
            }),
        }
    }

    /// Local path for an entry name, or `None` for names that cannot live
    /// directly inside the mirror.
    fn local_path(&self, name: &str) -> Option<PathBuf> {
        let unmirrorable = name.is_empty()
            || name == "."
            || name == ".."
            || name.contains('/')
            || name.contains('\\')
            || name.starts_with(TEMP_PREFIX);

        (!unmirrorable).then(|| self.mirror.join(name))
    }
}

async fn remove_recursive(path: &Path) -> io::Result<()> {
    let metadata = fs::symlink_metadata(path).await?;
    if metadata.is_dir() {
        fs::remove_dir_all(path).await
    } else {
        fs::remove_file(path).await
    }
}

async fn remove_temp(temp: &Path) {
    match fs::remove_file(temp).await {
        Ok(()) => {}
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => warn!("Failed to remove temp file {}: {e}", temp.display()),
    }
}
