//! Delete guard for the first reconciliation against a mirror.
//!
//! If every mirrored file would be deleted and no remote name overlaps the
//! mirror at all, the mirror path is most likely wrong. The poll is aborted
//! before anything is removed.

use std::path::Path;

use tracing::{error, warn};

use crate::error::{Result, WatchError};
use crate::event::Change;

/// Check a reconciled change set before destructive sync.
pub fn check_deletes(mirror: &Path, changes: &[Change], possible_updates: usize) -> Result<()> {
    let deletes = changes
        .iter()
        .filter(|c| matches!(c, Change::Delete { .. }))
        .count();

    if deletes == 0 {
        return Ok(());
    }

    if possible_updates == 0 {
        error!(
            "Refusing to delete {deletes} file(s) from {}: no mirrored file matches a remote entry",
            mirror.display()
        );
        return Err(WatchError::GuardTripped {
            mirror: mirror.to_path_buf(),
            deletes,
        });
    }

    warn!(
        "First poll will delete {deletes} file(s) from {}",
        mirror.display()
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entry::{DirectoryEntry, LocalDirent};
    use crate::event::PreviousState;
    use chrono::DateTime;
    use std::path::PathBuf;

    fn local_delete(name: &str) -> Change {
        Change::Delete {
            old: PreviousState::Local(LocalDirent {
                name: name.into(),
                path: PathBuf::from("/m").join(name),
                size: 1,
                mtime: None,
                is_directory: false,
            }),
        }
    }

    fn create(name: &str) -> Change {
        Change::Create {
            new: DirectoryEntry::object(
                "/d",
                name,
                1,
                "e",
                DateTime::from_timestamp(0, 0).unwrap_or_default(),
            ),
        }
    }

    #[test]
    fn no_deletes_passes() {
        check_deletes(Path::new("/m"), &[create("a")], 0).unwrap();
        check_deletes(Path::new("/m"), &[], 0).unwrap();
    }

    #[test]
    fn deletes_without_overlap_trip() {
        let changes = vec![create("x"), local_delete("a"), local_delete("b")];
        let err = check_deletes(Path::new("/m"), &changes, 0).unwrap_err();
        assert!(matches!(err, WatchError::GuardTripped { deletes: 2, .. }));
    }

    #[test]
    fn deletes_with_overlap_pass() {
        let changes = vec![local_delete("a")];
        check_deletes(Path::new("/m"), &changes, 1).unwrap();
    }
}
