//! Snapshot diffing.
//!
//! Pure comparison of two snapshots. Creates and updates come first in
//! listing order, followed by deletes in the old snapshot's order.

use crate::entry::Snapshot;
use crate::event::{Change, PreviousState};

/// Compute the changes that turn `old` into `new`.
///
/// Without an old snapshot nothing is reported: the first poll only
/// establishes the baseline.
pub fn diff_snapshots(old: Option<&Snapshot>, new: &Snapshot) -> Vec<Change> {
    let Some(old) = old else {
        return Vec::new();
    };

    let mut changes = Vec::new();

    for entry in new.entries() {
        match old.get(&entry.name) {
            None => changes.push(Change::Create { new: entry.clone() }),
            Some(previous) if previous.differs_from(entry) => changes.push(Change::Update {
                old: PreviousState::Remote(previous.clone()),
                new: entry.clone(),
            }),
            Some(_) => {}
        }
    }

    for entry in old.entries() {
        if !new.contains(&entry.name) {
            changes.push(Change::Delete {
                old: PreviousState::Remote(entry.clone()),
            });
        }
    }

    changes
}

/// Summary counts for a change set.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ChangeCounts {
    /// Number of creates.
    pub creates: usize,

    /// Number of updates.
    pub updates: usize,

    /// Number of deletes.
    pub deletes: usize,
}

impl ChangeCounts {
    /// Count the changes by action.
    pub fn of(changes: &[Change]) -> Self {
        let mut counts = Self::default();
        for change in changes {
            match change {
                Change::Create { .. } => counts.creates += 1,
                Change::Update { .. } => counts.updates += 1,
                Change::Delete { .. } => counts.deletes += 1,
            }
        }
        counts
    }

    /// Total number of changes.
    pub fn total(&self) -> usize {
        self.creates + self.updates + self.deletes
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entry::DirectoryEntry;
    use crate::event::ChangeAction;
    use chrono::{DateTime, Utc};
    use pretty_assertions::assert_eq;

    fn at(secs: i64) -> DateTime<Utc> {
        DateTime::from_timestamp(secs, 0).unwrap_or_default()
    }

    fn object(name: &str, etag: &str) -> DirectoryEntry {
        DirectoryEntry::object("/d", name, 1, etag, at(0))
    }

    fn actions(changes: &[Change]) -> Vec<(ChangeAction, &str)> {
        changes.iter().map(|c| (c.action(), c.name())).collect()
    }

    #[test]
    fn diff_against_self_is_empty() {
        let snapshot: Snapshot = vec![object("a", "1"), object("b", "2")].into_iter().collect();
        assert!(diff_snapshots(Some(&snapshot), &snapshot).is_empty());
        assert!(diff_snapshots(Some(&Snapshot::new()), &Snapshot::new()).is_empty());
    }

    #[test]
    fn bootstrap_is_silent() {
        let snapshot: Snapshot = vec![object("a", "1")].into_iter().collect();
        assert!(diff_snapshots(None, &snapshot).is_empty());
    }

    #[test]
    fn mtime_only_change_is_ignored() {
        let old: Snapshot = vec![object("a", "1")].into_iter().collect();
        let mut touched = object("a", "1");
        touched.mtime = at(999);
        let new: Snapshot = vec![touched].into_iter().collect();
        assert!(diff_snapshots(Some(&old), &new).is_empty());
    }

    #[test]
    fn creates_and_updates_precede_deletes() {
        let old: Snapshot = vec![object("gone1", "x"), object("kept", "1"), object("gone2", "y")]
            .into_iter()
            .collect();
        let new: Snapshot = vec![object("fresh", "z"), object("kept", "2"), object("later", "w")]
            .into_iter()
            .collect();

        let changes = diff_snapshots(Some(&old), &new);
        assert_eq!(
            actions(&changes),
            vec![
                (ChangeAction::Create, "fresh"),
                (ChangeAction::Update, "kept"),
                (ChangeAction::Create, "later"),
                (ChangeAction::Delete, "gone1"),
                (ChangeAction::Delete, "gone2"),
            ]
        );

        let Change::Update { old, new } = &changes[1] else {
            panic!("expected update");
        };
        assert_eq!(old, &PreviousState::Remote(object("kept", "1")));
        assert_eq!(new.etag.as_deref(), Some("2"));
    }

    #[test]
    fn type_change_is_update() {
        let old: Snapshot = vec![object("x", "1")].into_iter().collect();
        let new: Snapshot = vec![DirectoryEntry::directory("/d", "x", at(0))]
            .into_iter()
            .collect();
        assert_eq!(
            actions(&diff_snapshots(Some(&old), &new)),
            vec![(ChangeAction::Update, "x")]
        );
    }

    #[test]
    fn change_sets_are_disjoint() {
        let old: Snapshot = vec![object("a", "1"), object("b", "1"), object("c", "1")]
            .into_iter()
            .collect();
        let new: Snapshot = vec![object("b", "2"), object("c", "1"), object("d", "1")]
            .into_iter()
            .collect();

        let changes = diff_snapshots(Some(&old), &new);
        let counts = ChangeCounts::of(&changes);
        assert_eq!(
            counts,
            ChangeCounts {
                creates: 1,
                updates: 1,
                deletes: 1
            }
        );
        assert_eq!(counts.total(), 3);

        let mut names: Vec<&str> = changes.iter().map(Change::name).collect();
        names.sort_unstable();
        names.dedup();
        assert_eq!(names, vec!["a", "b", "d"]);
    }
}
