//! Remote directory entries, snapshots and local mirror entries.

use std::path::PathBuf;

use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

/// Kind of a remote directory entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntryType {
    /// A stored object (file).
    Object,

    /// A directory.
    Directory,
}

/// One entry of a remote directory listing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DirectoryEntry {
    /// Entry name, unique within one listing.
    pub name: String,

    /// Object or directory.
    #[serde(rename = "type")]
    pub entry_type: EntryType,

    /// Opaque content version tag, if the store provides one.
    pub etag: Option<String>,

    /// Last modification time.
    pub mtime: DateTime<Utc>,

    /// Path of the directory containing the entry.
    pub parent: String,

    /// Size in bytes (objects only).
    pub size: Option<u64>,
}

impl DirectoryEntry {
    /// Create an object entry.
    pub fn object(
        parent: impl Into<String>,
        name: impl Into<String>,
        size: u64,
        etag: impl Into<String>,
        mtime: DateTime<Utc>,
    ) -> Self {
        Self {
            name: name.into(),
            entry_type: EntryType::Object,
            etag: Some(etag.into()),
            mtime,
            parent: parent.into(),
            size: Some(size),
        }
    }

    /// Create a directory entry.
    pub fn directory(
        parent: impl Into<String>,
        name: impl Into<String>,
        mtime: DateTime<Utc>,
    ) -> Self {
        Self {
            name: name.into(),
            entry_type: EntryType::Directory,
            etag: None,
            mtime,
            parent: parent.into(),
            size: None,
        }
    }

    /// Full remote path of the entry.
    pub fn path(&self) -> String {
        join_remote(&self.parent, &self.name)
    }

    /// Whether this entry is an object.
    pub fn is_object(&self) -> bool {
        self.entry_type == EntryType::Object
    }

    /// Whether the entry's content differs from `other`.
    ///
    /// Type and etag are authoritative. When either side lacks an etag the
    /// comparison falls back to mtime and size.
    pub fn differs_from(&self, other: &DirectoryEntry) -> bool {
        if self.entry_type != other.entry_type {
            return true;
        }
        match (&self.etag, &other.etag) {
            (Some(a), Some(b)) => a != b,
            _ => self.mtime != other.mtime || self.size != other.size,
        }
    }
}

/// Join a remote directory path and an entry name.
pub fn join_remote(parent: &str, name: &str) -> String {
    if parent.is_empty() {
        name.to_string()
    } else if parent.ends_with('/') {
        format!("{parent}{name}")
    } else {
        format!("{parent}/{name}")
    }
}

/// The watcher's view of the remote directory, keyed by entry name.
///
/// Iteration follows listing order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Snapshot {
    entries: IndexMap<String, DirectoryEntry>,
}

impl Snapshot {
    /// Create an empty snapshot.
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert an entry, replacing any entry with the same name.
    pub fn insert(&mut self, entry: DirectoryEntry) -> Option<DirectoryEntry> {
        self.entries.insert(entry.name.clone(), entry)
    }

    /// Look up an entry by name.
    pub fn get(&self, name: &str) -> Option<&DirectoryEntry> {
        self.entries.get(name)
    }

    /// Whether an entry with this name exists.
    pub fn contains(&self, name: &str) -> bool {
        self.entries.contains_key(name)
    }

    /// Entries in listing order.
    pub fn entries(&self) -> impl Iterator<Item = &DirectoryEntry> {
        self.entries.values()
    }

    /// Entry names in listing order.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(String::as_str)
    }

    /// Number of entries.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the snapshot is empty.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl FromIterator<DirectoryEntry> for Snapshot {
    fn from_iter<I: IntoIterator<Item = DirectoryEntry>>(iter: I) -> Self {
        let mut snapshot = Snapshot::new();
        for entry in iter {
            snapshot.insert(entry);
        }
        snapshot
    }
}

/// A file found in the local mirror directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalDirent {
    /// File name.
    pub name: String,

    /// Full local path.
    pub path: PathBuf,

    /// Size in bytes.
    pub size: u64,

    /// Last modification time, if the platform reports one.
    pub mtime: Option<DateTime<Utc>>,

    /// Whether the entry is a directory.
    pub is_directory: bool,
}
