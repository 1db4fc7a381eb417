//! Remote storage collaborators.
//!
//! The watcher never talks to a transport directly. It receives a
//! [`RemoteStore`] that can list a directory, describe an object and stream
//! its content.

use std::collections::{HashMap, HashSet};
use std::io;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::task::{Context, Poll};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::io::{AsyncRead, ReadBuf};
use tokio::sync::Semaphore;
use tracing::debug;

use crate::checksum::sha256_bytes;
use crate::entry::{DirectoryEntry, join_remote};
use crate::error::StoreError;

/// Result type for store operations.
pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// A readable stream of object content.
pub type ContentStream = Box<dyn AsyncRead + Send + Unpin>;

/// Authoritative metadata of a remote object.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectMetadata {
    /// Size in bytes.
    pub size: u64,

    /// Base64 SHA-256 of the content, if the store knows it.
    pub content_hash: Option<String>,
}

/// Capability set the watcher needs from remote storage.
#[async_trait]
pub trait RemoteStore: Send + Sync {
    /// List the entries of a directory.
    ///
    /// A missing directory must be reported as [`StoreError::NotFound`].
    async fn list(&self, directory: &str) -> StoreResult<Vec<DirectoryEntry>>;

    /// Fetch size and checksum of an object.
    async fn fetch_metadata(&self, path: &str) -> StoreResult<ObjectMetadata>;

    /// Open a content stream for an object.
    async fn fetch_content(&self, path: &str) -> StoreResult<ContentStream>;

    /// Release any resources held by the store.
    async fn close(&self) -> StoreResult<()> {
        Ok(())
    }
}

/// Builds a store once, when a watcher is constructed.
///
/// Anything environment-derived (credentials, endpoints) is resolved here
/// so the engine only sees a ready store.
pub trait StoreFactory {
    /// Create the store.
    fn create(&self) -> StoreResult<Arc<dyn RemoteStore>>;
}

impl<F> StoreFactory for F
where
    F: Fn() -> StoreResult<Arc<dyn RemoteStore>>,
{
    fn create(&self) -> StoreResult<Arc<dyn RemoteStore>> {
        self()
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// An in-memory store.
///
/// Useful for embedding and for tests: listings and objects are set
/// directly, failures can be injected, and listings can be held open to
/// observe a poll in flight.
#[derive(Debug, Default)]
pub struct MemoryStore {
    directories: Mutex<HashMap<String, Vec<DirectoryEntry>>>,
    objects: Mutex<HashMap<String, Vec<u8>>>,
    list_error: Mutex<Option<String>>,
    content_failures: Mutex<HashMap<String, usize>>,
    missing_hashes: Mutex<HashSet<String>>,
    listing_gate: Mutex<Option<Arc<Semaphore>>>,
    list_calls: AtomicUsize,
    metadata_calls: AtomicUsize,
    content_calls: AtomicUsize,
    active_lists: AtomicUsize,
    max_active_lists: AtomicUsize,
    closed: AtomicBool,
}

impl MemoryStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create an empty directory.
    pub fn create_directory(&self, directory: &str) {
        lock(&self.directories)
            .entry(directory.to_string())
            .or_default();
    }

    /// Remove a directory and its listing.
    pub fn remove_directory(&self, directory: &str) {
        lock(&self.directories).remove(directory);
    }

    /// Store an object, replacing any entry with the same name.
    ///
    /// The etag is derived from the content so rewriting identical bytes
    /// keeps the etag stable.
    pub fn put_object(
        &self,
        directory: &str,
        name: &str,
        content: impl Into<Vec<u8>>,
        mtime: DateTime<Utc>,
    ) {
        let content = content.into();
        let etag = sha256_bytes(&content);
        let entry = DirectoryEntry::object(directory, name, content.len() as u64, etag, mtime);
        lock(&self.objects).insert(entry.path(), content);
        self.put_entry(entry);
    }

    /// Add a subdirectory entry.
    pub fn put_directory(&self, directory: &str, name: &str, mtime: DateTime<Utc>) {
        self.put_entry(DirectoryEntry::directory(directory, name, mtime));
    }

    /// Add or replace a raw entry without content.
    pub fn put_entry(&self, entry: DirectoryEntry) {
        let mut directories = lock(&self.directories);
        let listing = directories.entry(entry.parent.clone()).or_default();
        match listing.iter_mut().find(|e| e.name == entry.name) {
            Some(existing) => *existing = entry,
            None => listing.push(entry),
        }
    }

    /// Remove an entry from a listing.
    pub fn remove(&self, directory: &str, name: &str) {
        if let Some(listing) = lock(&self.directories).get_mut(directory) {
            listing.retain(|e| e.name != name);
        }
        lock(&self.objects).remove(&join_remote(directory, name));
    }

    /// Make every listing fail with this message, or clear the failure.
    pub fn set_list_error(&self, message: Option<&str>) {
        *lock(&self.list_error) = message.map(str::to_string);
    }

    /// Make content reads of `path` fail after `bytes` bytes.
    pub fn fail_content_after(&self, path: &str, bytes: usize) {
        lock(&self.content_failures).insert(path.to_string(), bytes);
    }

    /// Report no checksum in the metadata of `path`.
    pub fn omit_hash(&self, path: &str) {
        lock(&self.missing_hashes).insert(path.to_string());
    }

    /// Hold every listing until [`release_listings`](Self::release_listings) is called.
    pub fn hold_listings(&self) {
        *lock(&self.listing_gate) = Some(Arc::new(Semaphore::new(0)));
    }

    /// Let `count` held listings proceed.
    pub fn release_listings(&self, count: usize) {
        if let Some(gate) = lock(&self.listing_gate).as_ref() {
            gate.add_permits(count);
        }
    }

    /// Stop holding listings and release any that are waiting.
    pub fn open_listings(&self) {
        if let Some(gate) = lock(&self.listing_gate).take() {
            gate.close();
        }
    }

    /// Number of listing calls so far.
    pub fn list_calls(&self) -> usize {
        self.list_calls.load(Ordering::SeqCst)
    }

    /// Number of listings currently in progress.
    pub fn active_lists(&self) -> usize {
        self.active_lists.load(Ordering::SeqCst)
    }

    /// Highest number of listings ever in progress at once.
    pub fn max_active_lists(&self) -> usize {
        self.max_active_lists.load(Ordering::SeqCst)
    }

    /// Number of metadata calls so far.
    pub fn metadata_calls(&self) -> usize {
        self.metadata_calls.load(Ordering::SeqCst)
    }

    /// Number of content calls so far.
    pub fn content_calls(&self) -> usize {
        self.content_calls.load(Ordering::SeqCst)
    }

    /// Whether [`RemoteStore::close`] was called.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn ensure_open(&self) -> StoreResult<()> {
        if self.is_closed() {
            return Err(StoreError::Closed);
        }
        Ok(())
    }

    fn object(&self, path: &str) -> StoreResult<Vec<u8>> {
        lock(&self.objects)
            .get(path)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(path.to_string()))
    }
}

#[async_trait]
impl RemoteStore for MemoryStore {
    async fn list(&self, directory: &str) -> StoreResult<Vec<DirectoryEntry>> {
        self.ensure_open()?;
        self.list_calls.fetch_add(1, Ordering::SeqCst);
        let active = self.active_lists.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_active_lists.fetch_max(active, Ordering::SeqCst);

        let gate = lock(&self.listing_gate).clone();
        if let Some(gate) = gate {
            // A closed gate means listings were opened for good.
            if let Ok(permit) = gate.acquire().await {
                permit.forget();
            }
        }

        let result = match lock(&self.list_error).clone() {
            Some(message) => Err(StoreError::Request(message)),
            None => lock(&self.directories)
                .get(directory)
                .cloned()
                .ok_or_else(|| StoreError::NotFound(directory.to_string())),
        };

        self.active_lists.fetch_sub(1, Ordering::SeqCst);
        debug!("Listed {directory} (ok: {})", result.is_ok());
        result
    }

    async fn fetch_metadata(&self, path: &str) -> StoreResult<ObjectMetadata> {
        self.ensure_open()?;
        self.metadata_calls.fetch_add(1, Ordering::SeqCst);
        let content = self.object(path)?;
        let content_hash = if lock(&self.missing_hashes).contains(path) {
            None
        } else {
            Some(sha256_bytes(&content))
        };

        Ok(ObjectMetadata {
            size: content.len() as u64,
            content_hash,
        })
    }

    async fn fetch_content(&self, path: &str) -> StoreResult<ContentStream> {
        self.ensure_open()?;
        self.content_calls.fetch_add(1, Ordering::SeqCst);
        let content = self.object(path)?;
        let fail_after = lock(&self.content_failures).get(path).copied();

        Ok(Box::new(MemoryReader {
            content,
            position: 0,
            fail_after,
        }))
    }

    async fn close(&self) -> StoreResult<()> {
        self.closed.store(true, Ordering::SeqCst);
        self.open_listings();
        Ok(())
    }
}

/// Reader over an in-memory object with optional injected failure.
struct MemoryReader {
    content: Vec<u8>,
    position: usize,
    fail_after: Option<usize>,
}

impl AsyncRead for MemoryReader {
    fn poll_read(
        mut self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let limit = self
            .fail_after
            .map_or(self.content.len(), |n| n.min(self.content.len()));

        if self.position >= limit {
            if self.fail_after.is_some() {
                return Poll::Ready(Err(io::Error::new(
                    io::ErrorKind::ConnectionReset,
                    "connection reset while reading object",
                )));
            }
            return Poll::Ready(Ok(()));
        }

        let end = limit.min(self.position + buf.remaining());
        let start = self.position;
        buf.put_slice(&self.content[start..end]);
        self.position = end;
        Poll::Ready(Ok(()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use tokio::io::AsyncReadExt;

    fn now() -> DateTime<Utc> {
        DateTime::from_timestamp(1_700_000_000, 0).unwrap_or_default()
    }

    #[tokio::test]
    async fn missing_directory_is_not_found() {
        let store = MemoryStore::new();
        let err = store.list("/nope").await.unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn objects_round_trip() {
        let store = MemoryStore::new();
        store.put_object("/d", "a.txt", b"hello".to_vec(), now());
        store.put_directory("/d", "sub", now());

        let listing = store.list("/d").await.unwrap();
        assert_eq!(listing.len(), 2);
        assert_eq!(listing[0].size, Some(5));

        let meta = store.fetch_metadata("/d/a.txt").await.unwrap();
        assert_eq!(meta.size, 5);
        assert_eq!(meta.content_hash, Some(sha256_bytes(b"hello")));

        let mut content = Vec::new();
        store
            .fetch_content("/d/a.txt")
            .await
            .unwrap()
            .read_to_end(&mut content)
            .await
            .unwrap();
        assert_eq!(content, b"hello");
    }

    #[tokio::test]
    async fn injected_content_failure() {
        let store = MemoryStore::new();
        store.put_object("/d", "a", vec![7u8; 100], now());
        store.fail_content_after("/d/a", 10);

        let mut content = Vec::new();
        let err = store
            .fetch_content("/d/a")
            .await
            .unwrap()
            .read_to_end(&mut content)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::ConnectionReset);
        assert_eq!(content.len(), 10);
    }

    #[tokio::test]
    async fn closed_store_rejects_calls() {
        let store = MemoryStore::new();
        store.create_directory("/d");
        store.close().await.unwrap();
        assert!(store.is_closed());
        assert!(matches!(store.list("/d").await, Err(StoreError::Closed)));
    }

    #[test]
    fn closure_factory() {
        let factory = || -> StoreResult<Arc<dyn RemoteStore>> { Ok(Arc::new(MemoryStore::new())) };
        assert!(factory.create().is_ok());
    }
}
