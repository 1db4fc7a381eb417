//! First-poll reconciliation against an existing local mirror.
//!
//! When the watcher starts with a mirror but no snapshot, the previous state
//! is inferred from the files already on disk: names only on disk are
//! deletes, names only remote are creates, and names on both sides are
//! compared by size and checksum.

use std::collections::HashMap;
use std::path::Path;

use chrono::{DateTime, Utc};
use tokio::fs;
use tracing::{debug, info};

use crate::checksum::sha256_file;
use crate::config::EntryFilter;
use crate::entry::{DirectoryEntry, LocalDirent, Snapshot};
use crate::error::{Result, WatchError};
use crate::event::{Change, PreviousState};
use crate::store::RemoteStore;

/// Prefix of in-progress download files inside the mirror.
pub const TEMP_PREFIX: &str = ".rw-partial-";

/// Outcome of reconciling a listing against the mirror.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Reconciliation {
    /// Changes in delivery order.
    pub changes: Vec<Change>,

    /// Names present both remotely and in the mirror.
    pub possible_updates: usize,
}

/// Read the mirrored files that pass the name filter.
///
/// A missing mirror is empty. Directories and leftover temp files are
/// skipped. Results are sorted by name.
pub async fn read_mirror(mirror: &Path, filter: &EntryFilter) -> Result<Vec<LocalDirent>> {
    let to_error = |source: std::io::Error| WatchError::Reconciliation {
        path: mirror.to_path_buf(),
        source,
    };

    let mut reader = match fs::read_dir(mirror).await {
        Ok(reader) => reader,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            debug!("Mirror {} does not exist yet", mirror.display());
            return Ok(Vec::new());
        }
        Err(e) => return Err(to_error(e)),
    };

    let mut dirents = Vec::new();
    while let Some(dirent) = reader.next_entry().await.map_err(to_error)? {
        let Some(name) = dirent.file_name().to_str().map(str::to_string) else {
            continue;
        };
        if name.starts_with(TEMP_PREFIX) || !filter.accepts_name(&name) {
            continue;
        }

        let metadata = dirent.metadata().await.map_err(to_error)?;
        if metadata.is_dir() {
            continue;
        }

        dirents.push(LocalDirent {
            name,
            path: dirent.path(),
            size: metadata.len(),
            mtime: metadata.modified().ok().map(DateTime::<Utc>::from),
            is_directory: false,
        });
    }

    dirents.sort_by(|a, b| a.name.cmp(&b.name));
    Ok(dirents)
}

/// Diff a remote listing against the mirror contents.
pub async fn reconcile(
    store: &dyn RemoteStore,
    mirror: &Path,
    filter: &EntryFilter,
    remote: &Snapshot,
) -> Result<Reconciliation> {
    let local = read_mirror(mirror, filter).await?;
    let local_by_name: HashMap<&str, &LocalDirent> =
        local.iter().map(|d| (d.name.as_str(), d)).collect();

    let mut changes = Vec::new();
    let mut possible_updates = 0;

    for entry in remote.entries() {
        let Some(dirent) = local_by_name.get(entry.name.as_str()) else {
            changes.push(Change::Create { new: entry.clone() });
            continue;
        };

        possible_updates += 1;
        if needs_update(store, entry, dirent).await? {
            changes.push(Change::Update {
                old: PreviousState::Local((*dirent).clone()),
                new: entry.clone(),
            });
        }
    }

    for dirent in &local {
        if !remote.contains(&dirent.name) {
            changes.push(Change::Delete {
                old: PreviousState::Local(dirent.clone()),
            });
        }
    }

    info!(
        "Reconciled {} remote entries against {} mirrored files in {} ({} changes, {possible_updates} checked)",
        remote.len(),
        local.len(),
        mirror.display(),
        changes.len()
    );

    Ok(Reconciliation {
        changes,
        possible_updates,
    })
}

/// Decide whether a mirrored file differs from its remote counterpart.
async fn needs_update(
    store: &dyn RemoteStore,
    entry: &DirectoryEntry,
    dirent: &LocalDirent,
) -> Result<bool> {
    if !entry.is_object() {
        return Ok(true);
    }

    let path = entry.path();
    let metadata = store
        .fetch_metadata(&path)
        .await
        .map_err(|source| WatchError::Metadata {
            path: path.clone(),
            source,
        })?;

    if metadata.size != dirent.size {
        debug!(
            "Size differs for {}: remote {} local {}",
            entry.name, metadata.size, dirent.size
        );
        return Ok(true);
    }

    let Some(remote_hash) = metadata.content_hash else {
        debug!("No checksum for {path}, treating as changed");
        return Ok(true);
    };

    let local_hash =
        sha256_file(&dirent.path)
            .await
            .map_err(|source| WatchError::Reconciliation {
                path: dirent.path.clone(),
                source,
            })?;

    Ok(remote_hash != local_hash)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::WatchConfig;
    use crate::event::ChangeAction;
    use crate::store::MemoryStore;
    use pretty_assertions::assert_eq;
    use tempfile::TempDir;

    fn now() -> DateTime<Utc> {
        DateTime::from_timestamp(1_700_000_000, 0).unwrap_or_default()
    }

    async fn listing(store: &MemoryStore, dir: &str) -> Snapshot {
        store.list(dir).await.unwrap().into_iter().collect()
    }

    fn actions(reconciliation: &Reconciliation) -> Vec<(ChangeAction, &str)> {
        reconciliation
            .changes
            .iter()
            .map(|c| (c.action(), c.name()))
            .collect()
    }

    #[tokio::test]
    async fn matching_file_is_not_updated() {
        let mirror = TempDir::new().unwrap();
        std::fs::write(mirror.path().join("a.txt"), b"0123456789").unwrap();

        let store = MemoryStore::new();
        store.put_object("/d", "a.txt", b"0123456789".to_vec(), now());
        store.put_object("/d", "b.txt", vec![1u8; 20], now());

        let result = reconcile(
            &store,
            mirror.path(),
            &EntryFilter::any(),
            &listing(&store, "/d").await,
        )
        .await
        .unwrap();

        assert_eq!(actions(&result), vec![(ChangeAction::Create, "b.txt")]);
        assert_eq!(result.possible_updates, 1);
        assert_eq!(store.metadata_calls(), 1);
    }

    #[tokio::test]
    async fn size_or_hash_mismatch_is_update() {
        let mirror = TempDir::new().unwrap();
        std::fs::write(mirror.path().join("short"), b"abc").unwrap();
        std::fs::write(mirror.path().join("same-size"), b"xxxx").unwrap();

        let store = MemoryStore::new();
        store.put_object("/d", "short", b"abcdef".to_vec(), now());
        store.put_object("/d", "same-size", b"yyyy".to_vec(), now());

        let result = reconcile(
            &store,
            mirror.path(),
            &EntryFilter::any(),
            &listing(&store, "/d").await,
        )
        .await
        .unwrap();

        assert_eq!(
            actions(&result),
            vec![
                (ChangeAction::Update, "short"),
                (ChangeAction::Update, "same-size"),
            ]
        );
        assert_eq!(result.possible_updates, 2);
    }

    #[tokio::test]
    async fn missing_checksum_is_update() {
        let mirror = TempDir::new().unwrap();
        std::fs::write(mirror.path().join("a"), b"same").unwrap();

        let store = MemoryStore::new();
        store.put_object("/d", "a", b"same".to_vec(), now());
        store.omit_hash("/d/a");

        let result = reconcile(
            &store,
            mirror.path(),
            &EntryFilter::any(),
            &listing(&store, "/d").await,
        )
        .await
        .unwrap();
        assert_eq!(actions(&result), vec![(ChangeAction::Update, "a")]);
    }

    #[tokio::test]
    async fn local_only_files_are_deleted_after_creates() {
        let mirror = TempDir::new().unwrap();
        std::fs::write(mirror.path().join("old-2"), b"2").unwrap();
        std::fs::write(mirror.path().join("old-1"), b"1").unwrap();
        std::fs::create_dir(mirror.path().join("nested")).unwrap();
        std::fs::write(mirror.path().join(format!("{TEMP_PREFIX}abc-new")), b"partial").unwrap();

        let store = MemoryStore::new();
        store.put_object("/d", "new", b"n".to_vec(), now());

        let result = reconcile(
            &store,
            mirror.path(),
            &EntryFilter::any(),
            &listing(&store, "/d").await,
        )
        .await
        .unwrap();

        assert_eq!(
            actions(&result),
            vec![
                (ChangeAction::Create, "new"),
                (ChangeAction::Delete, "old-1"),
                (ChangeAction::Delete, "old-2"),
            ]
        );
        assert_eq!(result.possible_updates, 0);
        assert_eq!(store.metadata_calls(), 0);
    }

    #[tokio::test]
    async fn mirror_filter_matches_remote_filter() {
        let mirror = TempDir::new().unwrap();
        std::fs::write(mirror.path().join("keep.log"), b"x").unwrap();
        std::fs::write(mirror.path().join("notes.txt"), b"x").unwrap();

        let filter = WatchConfig::new("/d")
            .with_name_filter("*.log")
            .entry_filter()
            .unwrap();
        let dirents = read_mirror(mirror.path(), &filter).await.unwrap();
        let names: Vec<_> = dirents.iter().map(|d| d.name.as_str()).collect();
        assert_eq!(names, vec!["keep.log"]);
    }

    #[tokio::test]
    async fn missing_mirror_is_empty() {
        let temp_dir = TempDir::new().unwrap();
        let mirror = temp_dir.path().join("not-yet");

        let store = MemoryStore::new();
        store.put_object("/d", "a", b"a".to_vec(), now());

        let result = reconcile(&store, &mirror, &EntryFilter::any(), &listing(&store, "/d").await)
            .await
            .unwrap();
        assert_eq!(actions(&result), vec![(ChangeAction::Create, "a")]);
    }

    #[tokio::test]
    async fn metadata_failure_aborts() {
        let mirror = TempDir::new().unwrap();
        std::fs::write(mirror.path().join("a"), b"a").unwrap();

        let store = MemoryStore::new();
        store.put_entry(DirectoryEntry::object("/d", "a", 1, "e", now()));

        let err = reconcile(
            &store,
            mirror.path(),
            &EntryFilter::any(),
            &listing(&store, "/d").await,
        )
        .await
        .unwrap_err();
        assert!(matches!(err, WatchError::Metadata { .. }));
    }
}
