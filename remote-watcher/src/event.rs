//! Changes detected by a poll and the events delivered to consumers.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::entry::{DirectoryEntry, LocalDirent, join_remote};

/// Kind of change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeAction {
    /// Entry appeared.
    Create,

    /// Entry content or type changed.
    Update,

    /// Entry disappeared.
    Delete,
}

impl ChangeAction {
    /// Wire name of the action.
    pub fn as_str(self) -> &'static str {
        match self {
            ChangeAction::Create => "create",
            ChangeAction::Update => "update",
            ChangeAction::Delete => "delete",
        }
    }
}

impl std::fmt::Display for ChangeAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What an entry looked like before a change.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PreviousState {
    /// Known from the previous remote snapshot.
    Remote(DirectoryEntry),

    /// Known only from the local mirror (first poll).
    Local(LocalDirent),
}

impl PreviousState {
    /// Entry name.
    pub fn name(&self) -> &str {
        match self {
            PreviousState::Remote(entry) => &entry.name,
            PreviousState::Local(dirent) => &dirent.name,
        }
    }
}

/// A single change between two states of the watched directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Change {
    /// A new entry.
    Create {
        /// The entry as now listed.
        new: DirectoryEntry,
    },

    /// An entry whose content changed.
    Update {
        /// The entry before the change.
        old: PreviousState,
        /// The entry as now listed.
        new: DirectoryEntry,
    },

    /// An entry that is gone.
    Delete {
        /// The entry before it disappeared.
        old: PreviousState,
    },
}

impl Change {
    /// Kind of change.
    pub fn action(&self) -> ChangeAction {
        match self {
            Change::Create { .. } => ChangeAction::Create,
            Change::Update { .. } => ChangeAction::Update,
            Change::Delete { .. } => ChangeAction::Delete,
        }
    }

    /// Name of the affected entry.
    pub fn name(&self) -> &str {
        match self {
            Change::Create { new } | Change::Update { new, .. } => &new.name,
            Change::Delete { old } => old.name(),
        }
    }

    /// Build the externally visible event for this change.
    ///
    /// `directory` is the watched directory, used to derive the logical path
    /// of entries only known from the local mirror.
    pub fn to_event(&self, directory: &str, timestamp: DateTime<Utc>) -> Event {
        let (path, mtime) = match self {
            Change::Create { new } | Change::Update { new, .. } => (new.path(), Some(new.mtime)),
            Change::Delete {
                old: PreviousState::Remote(entry),
            } => (entry.path(), None),
            Change::Delete {
                old: PreviousState::Local(dirent),
            } => (join_remote(directory, &dirent.name), None),
        };

        Event {
            time_event: timestamp,
            action: self.action(),
            name: self.name().to_string(),
            path,
            mtime,
        }
    }
}

/// A change event as seen by consumers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Event {
    /// When the change was observed.
    pub time_event: DateTime<Utc>,

    /// Kind of change.
    pub action: ChangeAction,

    /// Entry name.
    pub name: String,

    /// Logical remote path of the entry.
    pub path: String,

    /// Entry modification time; absent for deletes.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mtime: Option<DateTime<Utc>>,
}

/// All events produced by one poll.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventGroup {
    /// Events in production order.
    pub events: Vec<Event>,
}

impl EventGroup {
    /// Build a group from a poll's changes, all stamped with the same time.
    pub fn from_changes(changes: &[Change], directory: &str, timestamp: DateTime<Utc>) -> Self {
        Self {
            events: changes
                .iter()
                .map(|change| change.to_event(directory, timestamp))
                .collect(),
        }
    }

    /// Check if the group is empty.
    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    /// Get the number of events.
    pub fn len(&self) -> usize {
        self.events.len()
    }

    /// Serialize the group to its JSON wire form.
    pub fn to_json(&self) -> crate::error::Result<String> {
        Ok(serde_json::to_string(self)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::path::PathBuf;

    fn at(secs: i64) -> DateTime<Utc> {
        DateTime::from_timestamp(secs, 0).unwrap_or_default()
    }

    #[test]
    fn create_event_carries_mtime() {
        let change = Change::Create {
            new: DirectoryEntry::object("/acct/stor/in", "y", 3, "e", at(10)),
        };
        let event = change.to_event("/acct/stor/in", at(20));
        assert_eq!(event.action, ChangeAction::Create);
        assert_eq!(event.name, "y");
        assert_eq!(event.path, "/acct/stor/in/y");
        assert_eq!(event.mtime, Some(at(10)));
    }

    #[test]
    fn local_delete_uses_watched_directory() {
        let change = Change::Delete {
            old: PreviousState::Local(LocalDirent {
                name: "stale.txt".into(),
                path: PathBuf::from("/mirror/stale.txt"),
                size: 4,
                mtime: None,
                is_directory: false,
            }),
        };
        let event = change.to_event("/acct/stor/in", at(0));
        assert_eq!(event.path, "/acct/stor/in/stale.txt");
        assert_eq!(event.mtime, None);
    }

    #[test]
    fn wire_shape() {
        let group = EventGroup::from_changes(
            &[
                Change::Create {
                    new: DirectoryEntry::object("/d", "a", 1, "e", at(0)),
                },
                Change::Delete {
                    old: PreviousState::Remote(DirectoryEntry::object("/d", "b", 1, "e", at(0))),
                },
            ],
            "/d",
            at(60),
        );

        let value: serde_json::Value = serde_json::from_str(&group.to_json().unwrap()).unwrap();
        let events = value["events"].as_array().unwrap();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0]["action"], "create");
        assert_eq!(events[0]["timeEvent"], "1970-01-01T00:01:00Z");
        assert_eq!(events[0]["mtime"], "1970-01-01T00:00:00Z");
        assert_eq!(events[1]["action"], "delete");
        assert_eq!(events[1]["path"], "/d/b");
        assert!(events[1].get("mtime").is_none());
    }
}
