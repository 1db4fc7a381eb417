//! # Remote Watcher
//!
//! This crate watches a directory on a remote store by polling it. Each
//! poll lists the directory, diffs the listing against the previous one and
//! emits the changes as an event group. Optionally the changes are mirrored
//! into a local directory.
//!
//! ## Features
//!
//! - **Polling**: Fixed interval measured from the end of the previous poll
//! - **Filtering**: Glob or regex on names, and entry type
//! - **Mirroring**: Atomic downloads, optional deletion, dry run
//! - **Delete Guard**: Refuses to wipe a mirror that shares nothing with the remote
//! - **Backpressure**: Buffered groups are delivered in order once the consumer reads
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                         Remote Watcher                          │
//! ├─────────────────────────────────────────────────────────────────┤
//! │  RemoteStore ──► diff / reconcile ──► guard ──► SyncApplier     │
//! │       │                                              │          │
//! │       ▼                                              ▼          │
//! │  PollScheduler ◄── Watcher task ──► BackpressureBuffer ──► recv │
//! └─────────────────────────────────────────────────────────────────┘
//! ```

pub mod buffer;
pub mod checksum;
pub mod config;
pub mod diff;
pub mod entry;
pub mod error;
pub mod event;
pub mod fs_store;
pub mod guard;
pub mod reconcile;
pub mod scheduler;
pub mod store;
pub mod sync;
pub mod watcher;

pub use config::{EntryFilter, NameFilter, WatchConfig};
pub use diff::{ChangeCounts, diff_snapshots};
pub use entry::{DirectoryEntry, EntryType, LocalDirent, Snapshot};
pub use error::{Result, StoreError, WatchError};
pub use event::{Change, ChangeAction, Event, EventGroup, PreviousState};
pub use fs_store::{FsStore, FsStoreFactory};
pub use store::{MemoryStore, ObjectMetadata, RemoteStore, StoreFactory};
pub use sync::{SyncAction, SyncApplier, SyncSummary};
pub use watcher::{
    EventReceiver, PollOutcome, Watcher, WatcherHandle, WatcherState, WatcherStatus,
    WatcherStreams,
};
