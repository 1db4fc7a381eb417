//! Remote directory watcher.
//!
//! A [`Watcher`] runs as a single tokio task that owns the snapshot, the
//! backpressure buffer and the scheduler. Consumers talk to it through a
//! [`WatcherHandle`] and read from [`WatcherStreams`]. Control signals are
//! handled between polls, so polls never overlap.

use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use chrono::Utc;
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::buffer::{BackpressureBuffer, FlushOutcome};
use crate::config::{EntryFilter, WatchConfig};
use crate::diff::{ChangeCounts, diff_snapshots};
use crate::entry::Snapshot;
use crate::error::{Result, WatchError};
use crate::event::{Change, EventGroup};
use crate::guard::check_deletes;
use crate::reconcile::reconcile;
use crate::scheduler::{NextPoll, PollScheduler};
use crate::store::{RemoteStore, StoreFactory};
use crate::sync::{SyncApplier, SyncSummary};

/// Lifecycle state of a watcher.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatcherState {
    /// Constructed, never resumed.
    Idle,

    /// Not accepting new polls from the timer.
    Paused,

    /// Waiting for the next poll.
    Running,

    /// A poll is in progress.
    Polling,

    /// Terminated; no further polls.
    Closed,
}

/// Observable watcher status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WatcherStatus {
    /// Current state.
    pub state: WatcherState,

    /// Polls finished so far, successful or not.
    pub completed_polls: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Command {
    Pause,
    Resume,
    Poke,
    Close,
}

/// Controls a running watcher.
///
/// Every method is a no-op once the watcher is closed.
#[derive(Debug, Clone)]
pub struct WatcherHandle {
    commands: mpsc::UnboundedSender<Command>,
    status: watch::Receiver<WatcherStatus>,
    demand: Arc<AtomicBool>,
}

impl WatcherHandle {
    /// Start or continue polling, flushing buffered groups first.
    pub fn resume(&self) {
        self.send(Command::Resume);
    }

    /// Stop timer-driven polls and buffer new groups.
    ///
    /// A poll already in progress still completes.
    pub fn pause(&self) {
        self.demand.store(false, Ordering::SeqCst);
        self.send(Command::Pause);
    }

    /// Poll as soon as the current poll, if any, has finished.
    pub fn poke(&self) {
        self.send(Command::Poke);
    }

    /// Stop the watcher and end the event stream.
    pub fn close(&self) {
        self.send(Command::Close);
    }

    /// Current state.
    pub fn state(&self) -> WatcherState {
        self.status.borrow().state
    }

    /// Current status.
    pub fn status(&self) -> WatcherStatus {
        *self.status.borrow()
    }

    /// Wait until the status satisfies `predicate`.
    ///
    /// Returns the last known status if the watcher task has exited.
    pub async fn wait_for(
        &self,
        predicate: impl FnMut(&WatcherStatus) -> bool,
    ) -> WatcherStatus {
        let mut status = self.status.clone();
        let found = status.wait_for(predicate).await.map(|s| *s);
        found.unwrap_or_else(|_| *status.borrow())
    }

    /// Wait until the watcher reaches `state`.
    pub async fn wait_for_state(&self, state: WatcherState) -> WatcherStatus {
        self.wait_for(|s| s.state == state).await
    }

    /// Wait until the watcher is closed.
    pub async fn closed(&self) {
        self.wait_for_state(WatcherState::Closed).await;
    }

    fn send(&self, command: Command) {
        if self.commands.send(command).is_err() {
            debug!("Ignoring {command:?}: watcher is closed");
        }
    }
}

/// Pull side of the event stream.
///
/// [`recv`](Self::recv) resumes a watcher that was never started or that
/// stalled on a full channel. An explicit [`WatcherHandle::pause`] is not
/// undone by reading.
#[derive(Debug)]
pub struct EventReceiver {
    events: mpsc::Receiver<EventGroup>,
    commands: mpsc::UnboundedSender<Command>,
    demand: Arc<AtomicBool>,
}

impl EventReceiver {
    /// Receive the next event group; `None` once the watcher is closed.
    pub async fn recv(&mut self) -> Option<EventGroup> {
        if self.demand.swap(false, Ordering::SeqCst) {
            // The watcher may already be gone, in which case recv yields None.
            let _ = self.commands.send(Command::Resume);
        }
        self.events.recv().await
    }

    /// Take a group if one is ready, without signalling demand.
    pub fn try_recv(&mut self) -> Option<EventGroup> {
        self.events.try_recv().ok()
    }
}

/// Outputs of a spawned watcher.
#[derive(Debug)]
pub struct WatcherStreams {
    /// Event groups, one per poll with changes.
    pub events: EventReceiver,

    /// Poll errors, out of band from events.
    pub errors: mpsc::UnboundedReceiver<WatchError>,
}

/// Result of one successful poll.
#[derive(Debug, Clone, Default)]
pub struct PollOutcome {
    /// Entries in the filtered listing.
    pub entries: usize,

    /// Changes by action.
    pub counts: ChangeCounts,

    /// Mirror work performed.
    pub sync: SyncSummary,

    /// Whether the poll reconciled against the mirror.
    pub reconciled: bool,

    /// Events to deliver.
    pub group: EventGroup,

    /// Time spent polling.
    pub duration: Duration,
}

/// Per-poll working state, owned by the poll in flight.
#[derive(Debug, Default)]
struct PollContext {
    listing: Snapshot,
    changes: Vec<Change>,
    possible_updates: Option<usize>,
    sync: SyncSummary,
}

/// A configured, not yet running watcher.
pub struct Watcher {
    config: WatchConfig,
    filter: EntryFilter,
    store: Arc<dyn RemoteStore>,
    owns_store: bool,
}

impl Watcher {
    /// Create a watcher over a store the caller keeps ownership of.
    pub fn new(config: WatchConfig, store: Arc<dyn RemoteStore>) -> Result<Self> {
        config.validate()?;
        let filter = config.entry_filter()?;
        Ok(Self {
            config,
            filter,
            store,
            owns_store: false,
        })
    }

    /// Create a watcher whose store is built once by `factory` and closed with the watcher.
    pub fn from_factory(config: WatchConfig, factory: &dyn StoreFactory) -> Result<Self> {
        let store = factory
            .create()
            .map_err(|e| WatchError::Config(format!("failed to create store: {e}")))?;
        Ok(Self::new(config, store)?.owning_store())
    }

    /// Close the store when the watcher closes.
    pub fn owning_store(mut self) -> Self {
        self.owns_store = true;
        self
    }

    /// Start the watcher task. The watcher begins paused.
    ///
    /// Must be called from within a tokio runtime.
    pub fn spawn(self) -> (WatcherHandle, WatcherStreams) {
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (event_tx, event_rx) = mpsc::channel(self.config.channel_capacity);
        let (error_tx, error_rx) = mpsc::unbounded_channel();
        let (status_tx, status_rx) = watch::channel(WatcherStatus {
            state: WatcherState::Idle,
            completed_polls: 0,
        });
        let demand = Arc::new(AtomicBool::new(true));

        let applier = self.config.mirror_directory.as_ref().map(|mirror| {
            SyncApplier::new(self.store.clone(), mirror.clone())
                .with_deletion(self.config.allow_mirror_deletion)
                .with_dry_run(self.config.dry_run)
        });

        info!(
            "Watching {} every {:?}{}",
            self.config.watched_directory,
            self.config.poll_interval(),
            self.config
                .mirror_directory
                .as_ref()
                .map(|m| format!(", mirroring into {}", m.display()))
                .unwrap_or_default()
        );

        let task = WatcherTask {
            scheduler: PollScheduler::new(self.config.poll_interval()),
            config: self.config,
            filter: self.filter,
            store: self.store,
            owns_store: self.owns_store,
            applier,
            snapshot: None,
            buffer: BackpressureBuffer::new(),
            paused: true,
            finished: false,
            closed: false,
            commands: command_rx,
            events: event_tx,
            errors: error_tx,
            status: status_tx,
            demand: demand.clone(),
        };
        tokio::spawn(task.run());

        let handle = WatcherHandle {
            commands: command_tx.clone(),
            status: status_rx,
            demand: demand.clone(),
        };
        let streams = WatcherStreams {
            events: EventReceiver {
                events: event_rx,
                commands: command_tx,
                demand,
            },
            errors: error_rx,
        };
        (handle, streams)
    }
}

struct WatcherTask {
    config: WatchConfig,
    filter: EntryFilter,
    store: Arc<dyn RemoteStore>,
    owns_store: bool,
    applier: Option<SyncApplier>,
    snapshot: Option<Snapshot>,
    buffer: BackpressureBuffer,
    scheduler: PollScheduler,
    paused: bool,
    /// One-shot poll done; close once the buffer drains.
    finished: bool,
    closed: bool,
    commands: mpsc::UnboundedReceiver<Command>,
    events: mpsc::Sender<EventGroup>,
    errors: mpsc::UnboundedSender<WatchError>,
    status: watch::Sender<WatcherStatus>,
    demand: Arc<AtomicBool>,
}

async fn sleep_until_deadline(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

impl WatcherTask {
    async fn run(mut self) {
        while !self.closed {
            self.drain_commands();
            if self.closed {
                break;
            }
            if self.scheduler.take_due() && !self.finished {
                self.poll().await;
                continue;
            }

            let deadline = self.scheduler.deadline();
            tokio::select! {
                command = self.commands.recv() => match command {
                    Some(command) => self.handle(command),
                    None => {
                        debug!("All watcher handles dropped");
                        self.closed = true;
                    }
                },
                () = sleep_until_deadline(deadline) => self.scheduler.fire(),
                () = self.events.closed() => {
                    debug!("Event consumer went away");
                    self.closed = true;
                }
            }
        }

        self.shutdown().await;
    }

    /// Apply commands that queued up during a poll, so repeated pokes collapse.
    fn drain_commands(&mut self) {
        loop {
            match self.commands.try_recv() {
                Ok(command) => self.handle(command),
                Err(mpsc::error::TryRecvError::Empty) => break,
                Err(mpsc::error::TryRecvError::Disconnected) => {
                    self.closed = true;
                    break;
                }
            }
        }
    }

    fn handle(&mut self, command: Command) {
        debug!("Watcher command: {command:?}");
        match command {
            Command::Resume => self.resume(),
            Command::Pause => self.pause(),
            Command::Poke => self.scheduler.poke(),
            Command::Close => self.closed = true,
        }
    }

    fn resume(&mut self) {
        self.paused = false;

        match self.buffer.flush(&mut self.events) {
            FlushOutcome::Drained => {}
            FlushOutcome::Blocked => {
                self.stall();
                return;
            }
            FlushOutcome::Disconnected => {
                self.closed = true;
                return;
            }
        }

        if self.finished {
            self.closed = true;
            return;
        }

        match self.scheduler.schedule(Instant::now()) {
            NextPoll::Now => debug!("Polling immediately"),
            NextPoll::At(at) => debug!(
                "Next poll in {:?}",
                at.saturating_duration_since(Instant::now())
            ),
        }
        self.set_state(WatcherState::Running);
    }

    fn pause(&mut self) {
        self.paused = true;
        self.scheduler.cancel();
        self.set_state(WatcherState::Paused);
    }

    /// The consumer refused data: wait for demand before doing anything else.
    fn stall(&mut self) {
        debug!("Consumer is full, {} group(s) buffered", self.buffer.len());
        self.paused = true;
        self.scheduler.cancel();
        self.demand.store(true, Ordering::SeqCst);
        self.set_state(WatcherState::Paused);
    }

    async fn poll(&mut self) {
        self.set_state(WatcherState::Polling);
        let started = Instant::now();

        let result = self.run_pipeline(started).await;
        self.scheduler.completed(Instant::now());
        // A pause or close sent during the poll decides where its group goes.
        self.drain_commands();
        self.status.send_modify(|s| s.completed_polls += 1);

        match result {
            Ok(outcome) => {
                info!(
                    "Poll of {} finished in {:?}: {} entries, {} created, {} updated, {} deleted",
                    self.config.watched_directory,
                    outcome.duration,
                    outcome.entries,
                    outcome.counts.creates,
                    outcome.counts.updates,
                    outcome.counts.deletes
                );
                if self.closed {
                    debug!("Closed during poll, dropping {} event(s)", outcome.group.len());
                } else if !outcome.group.is_empty() {
                    self.deliver(outcome.group);
                }
            }
            Err(err) => {
                error!("Poll of {} failed: {err}", self.config.watched_directory);
                if self.errors.send(err).is_err() {
                    debug!("No error receiver");
                }
            }
        }

        if self.closed {
            return;
        }

        if self.config.one_shot {
            self.finished = true;
            self.scheduler.cancel();
            if self.buffer.is_empty() {
                self.closed = true;
            } else {
                self.set_state(WatcherState::Paused);
            }
            return;
        }

        if self.paused {
            self.set_state(WatcherState::Paused);
        } else {
            self.scheduler.schedule(Instant::now());
            self.set_state(WatcherState::Running);
        }
    }

    fn deliver(&mut self, group: EventGroup) {
        self.buffer.enqueue(group);
        if self.paused {
            debug!("Paused, {} group(s) buffered", self.buffer.len());
            return;
        }

        match self.buffer.flush(&mut self.events) {
            FlushOutcome::Drained => {}
            FlushOutcome::Blocked => self.stall(),
            FlushOutcome::Disconnected => self.closed = true,
        }
    }

    async fn run_pipeline(&mut self, started: Instant) -> Result<PollOutcome> {
        let mut ctx = PollContext::default();

        self.list_step(&mut ctx).await?;
        self.diff_step(&mut ctx).await?;
        self.guard_step(&ctx)?;
        self.sync_step(&mut ctx).await?;

        let group =
            EventGroup::from_changes(&ctx.changes, &self.config.watched_directory, Utc::now());
        let outcome = PollOutcome {
            entries: ctx.listing.len(),
            counts: ChangeCounts::of(&ctx.changes),
            sync: ctx.sync,
            reconciled: ctx.possible_updates.is_some(),
            group,
            duration: started.elapsed(),
        };

        self.snapshot = Some(ctx.listing);
        Ok(outcome)
    }

    async fn list_step(&self, ctx: &mut PollContext) -> Result<()> {
        let directory = &self.config.watched_directory;
        let entries = match self.store.list(directory).await {
            Ok(entries) => entries,
            Err(e) if e.is_not_found() => {
                debug!("{directory} does not exist, treating as empty");
                Vec::new()
            }
            Err(source) => {
                return Err(WatchError::Listing {
                    directory: directory.clone(),
                    source,
                });
            }
        };

        ctx.listing = entries
            .into_iter()
            .filter(|e| self.filter.accepts(e))
            .collect();
        Ok(())
    }

    async fn diff_step(&self, ctx: &mut PollContext) -> Result<()> {
        match (&self.snapshot, self.mirror()) {
            (None, Some(mirror)) => {
                let reconciliation =
                    reconcile(self.store.as_ref(), mirror, &self.filter, &ctx.listing).await?;
                ctx.changes = reconciliation.changes;
                ctx.possible_updates = Some(reconciliation.possible_updates);
            }
            (snapshot, _) => {
                ctx.changes = diff_snapshots(snapshot.as_ref(), &ctx.listing);
            }
        }
        Ok(())
    }

    fn guard_step(&self, ctx: &PollContext) -> Result<()> {
        let (Some(mirror), Some(possible_updates)) = (self.mirror(), ctx.possible_updates) else {
            return Ok(());
        };
        if !self.config.allow_mirror_deletion {
            return Ok(());
        }
        if self.config.disable_delete_guard {
            warn!("Delete guard disabled for {}", mirror.display());
            return Ok(());
        }
        check_deletes(mirror, &ctx.changes, possible_updates)
    }

    async fn sync_step(&self, ctx: &mut PollContext) -> Result<()> {
        if let Some(applier) = &self.applier {
            ctx.sync = applier.apply_all(&ctx.changes).await?;
        }
        Ok(())
    }

    fn mirror(&self) -> Option<&Path> {
        self.config.mirror_directory.as_deref()
    }

    fn set_state(&self, state: WatcherState) {
        self.status.send_if_modified(|s| {
            if s.state == state {
                return false;
            }
            debug!("Watcher state {:?} -> {state:?}", s.state);
            s.state = state;
            true
        });
    }

    async fn shutdown(mut self) {
        if !self.buffer.is_empty() {
            warn!(
                "Closing with {} undelivered event group(s)",
                self.buffer.len()
            );
        }
        self.scheduler.cancel();

        if self.owns_store {
            if let Err(e) = self.store.close().await {
                warn!("Failed to close store: {e}");
            }
        }

        self.set_state(WatcherState::Closed);
        info!("Stopped watching {}", self.config.watched_directory);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use pretty_assertions::assert_eq;

    #[tokio::test]
    async fn test_watcher_starts_idle() {
        let store = Arc::new(MemoryStore::new());
        let watcher = Watcher::new(WatchConfig::new("/d"), store.clone()).unwrap();
        let (handle, _streams) = watcher.spawn();

        assert_eq!(handle.state(), WatcherState::Idle);
        tokio::task::yield_now().await;
        assert_eq!(store.list_calls(), 0);
        handle.close();
        handle.closed().await;
    }

    #[tokio::test]
    async fn test_invalid_config_rejected() {
        let store: Arc<dyn RemoteStore> = Arc::new(MemoryStore::new());
        let mut config = WatchConfig::new("/d");
        config.poll_interval_ms = 0;
        assert!(matches!(
            Watcher::new(config, store),
            Err(WatchError::Config(_))
        ));
    }

    #[tokio::test]
    async fn test_pause_before_resume_keeps_polls_off() {
        let store = Arc::new(MemoryStore::new());
        store.create_directory("/d");
        let watcher = Watcher::new(WatchConfig::new("/d"), store.clone()).unwrap();
        let (handle, _streams) = watcher.spawn();

        handle.pause();
        let status = handle.wait_for_state(WatcherState::Paused).await;
        assert_eq!(status.completed_polls, 0);
        assert_eq!(store.list_calls(), 0);
        handle.close();
    }
}
