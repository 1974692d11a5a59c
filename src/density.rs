//! # Replication Density Watcher
//!
//! Tracks how often each content id has been seen arriving within a sliding
//! window and turns it into a normalized density in `[0, 1]`: the share of
//! all in-window observations that belong to that id. A high density means
//! the mesh is already saturated with the item.
//!
//! ## Access Discipline
//!
//! | Path | Caller | Cost |
//! |------|--------|------|
//! | `record_observation` | every ingest, any thread | `try_send`, no lock |
//! | `compute_metric` | scorer, every sampling attempt | short read lock |
//! | apply / prune | background actor only | short write lock |
//!
//! Producers never touch the table: observations are queued to the actor,
//! which applies them in batches. Readers take a read lock for one lookup.
//! The actor also prunes expired observations on a fixed interval.

use std::collections::VecDeque;
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};

use lru::LruCache;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, trace};

use crate::identity::ContentId;

/// Default observation window (one hour).
pub const DEFAULT_DENSITY_WINDOW: Duration = Duration::from_secs(3600);

/// Default interval between prune passes.
pub const DEFAULT_PRUNE_INTERVAL: Duration = Duration::from_secs(60);

/// Default capacity of the observation queue.
pub const DEFAULT_OBSERVATION_QUEUE: usize = 4096;

/// Maximum number of distinct content ids tracked.
/// SECURITY: Bounds memory if a peer floods unique ids.
pub const MAX_TRACKED_CONTENT: usize = 50_000;

/// Maximum observations kept per content id.
pub const MAX_OBSERVATIONS_PER_CONTENT: usize = 1024;

/// Floor for the prune interval; `tokio::time::interval` rejects zero.
pub const MIN_PRUNE_INTERVAL: Duration = Duration::from_millis(10);

/// Maximum observations applied per table lock acquisition.
const APPLY_BATCH: usize = 256;

/// Read side used by the scorer. Implemented by [`DensityWatcher`]; tests
/// substitute fixed tables.
pub trait DensitySource: Send + Sync {
    /// Normalized density in `[0, 1]`; 0 when the id was never observed.
    fn density(&self, id: &ContentId) -> f64;
}

#[derive(Clone, Debug)]
pub struct DensityConfig {
    pub window: Duration,
    pub prune_interval: Duration,
    pub queue_capacity: usize,
    pub max_tracked_content: usize,
    pub max_observations_per_content: usize,
}

impl Default for DensityConfig {
    fn default() -> Self {
        Self {
            window: DEFAULT_DENSITY_WINDOW,
            prune_interval: DEFAULT_PRUNE_INTERVAL,
            queue_capacity: DEFAULT_OBSERVATION_QUEUE,
            max_tracked_content: MAX_TRACKED_CONTENT,
            max_observations_per_content: MAX_OBSERVATIONS_PER_CONTENT,
        }
    }
}

impl DensityConfig {
    pub fn with_window(window: Duration) -> Self {
        Self {
            window,
            prune_interval: (window / 60).max(MIN_PRUNE_INTERVAL),
            ..Self::default()
        }
    }
}

// ============================================================================
// Observation Table
// ============================================================================

struct DensityTable {
    per_content: LruCache<ContentId, VecDeque<Instant>>,
    /// Sum of all deque lengths.
    total: usize,
    max_per_content: usize,
}

impl DensityTable {
    fn new(config: &DensityConfig) -> Self {
        let cap = NonZeroUsize::new(config.max_tracked_content)
            .unwrap_or(NonZeroUsize::new(1).expect("1 is non-zero"));
        Self {
            per_content: LruCache::new(cap),
            total: 0,
            max_per_content: config.max_observations_per_content.max(1),
        }
    }

    fn record(&mut self, id: ContentId, at: Instant) {
        if let Some(seen) = self.per_content.get_mut(&id) {
            seen.push_back(at);
            self.total += 1;
            if seen.len() > self.max_per_content {
                seen.pop_front();
                self.total -= 1;
            }
            return;
        }

        let mut seen = VecDeque::with_capacity(4);
        seen.push_back(at);
        self.total += 1;
        if let Some((_, evicted)) = self.per_content.push(id, seen) {
            self.total -= evicted.len();
        }
    }

    /// Drop observations older than `window`; forget ids with none left.
    fn prune(&mut self, now: Instant, window: Duration) -> usize {
        let mut emptied = Vec::new();
        let mut removed = 0;
        for (id, seen) in self.per_content.iter_mut() {
            while let Some(front) = seen.front() {
                if now.saturating_duration_since(*front) > window {
                    seen.pop_front();
                    removed += 1;
                } else {
                    break;
                }
            }
            if seen.is_empty() {
                emptied.push(*id);
            }
        }
        for id in emptied {
            self.per_content.pop(&id);
        }
        self.total -= removed;
        removed
    }

    fn metric(&self, id: &ContentId) -> f64 {
        if self.total == 0 {
            return 0.0;
        }
        match self.per_content.peek(id) {
            Some(seen) => seen.len() as f64 / self.total as f64,
            None => 0.0,
        }
    }
}

// ============================================================================
// Handle
// ============================================================================

enum Command {
    Observe(ContentId, Instant),
    Sync(oneshot::Sender<()>),
    Quit,
}

/// Cheap-to-clone handle to the density actor.
#[derive(Clone)]
pub struct DensityWatcher {
    cmd_tx: mpsc::Sender<Command>,
    table: Arc<RwLock<DensityTable>>,
    dropped: Arc<AtomicU64>,
}

impl DensityWatcher {
    /// Spawn the background actor. Must be called inside a tokio runtime.
    pub fn spawn(config: DensityConfig) -> Self {
        let (cmd_tx, cmd_rx) = mpsc::channel(config.queue_capacity.max(1));
        let table = Arc::new(RwLock::new(DensityTable::new(&config)));

        let actor = DensityActor {
            table: table.clone(),
            window: config.window,
            prune_interval: config.prune_interval.max(MIN_PRUNE_INTERVAL),
        };
        tokio::spawn(actor.run(cmd_rx));

        Self {
            cmd_tx,
            table,
            dropped: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Note that `id` was seen arriving. Never blocks; when the queue is
    /// full the observation is dropped and counted.
    pub fn record_observation(&self, id: ContentId) {
        if self.cmd_tx.try_send(Command::Observe(id, Instant::now())).is_err() {
            self.dropped.fetch_add(1, Ordering::Relaxed);
            trace!(content = %id, "density observation dropped");
        }
    }

    pub fn compute_metric(&self, id: &ContentId) -> f64 {
        let table = self.table.read().unwrap_or_else(|e| e.into_inner());
        table.metric(id)
    }

    /// Wait until every observation recorded before this call is applied.
    pub async fn sync(&self) {
        let (tx, rx) = oneshot::channel();
        if self.cmd_tx.send(Command::Sync(tx)).await.is_ok() {
            let _ = rx.await;
        }
    }

    /// Stop the actor. The last table stays readable.
    pub async fn stop(&self) {
        let _ = self.cmd_tx.send(Command::Quit).await;
    }

    pub fn tracked_content(&self) -> usize {
        self.table.read().unwrap_or_else(|e| e.into_inner()).per_content.len()
    }

    pub fn dropped_observations(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

impl DensitySource for DensityWatcher {
    fn density(&self, id: &ContentId) -> f64 {
        self.compute_metric(id)
    }
}

impl std::fmt::Debug for DensityWatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DensityWatcher")
            .field("tracked_content", &self.tracked_content())
            .finish_non_exhaustive()
    }
}

// ============================================================================
// Actor
// ============================================================================

struct DensityActor {
    table: Arc<RwLock<DensityTable>>,
    window: Duration,
    prune_interval: Duration,
}

impl DensityActor {
    async fn run(self, mut cmd_rx: mpsc::Receiver<Command>) {
        let mut prune_interval = tokio::time::interval(self.prune_interval);
        prune_interval.tick().await; // Skip initial tick

        let mut batch = Vec::with_capacity(APPLY_BATCH);
        loop {
            tokio::select! {
                cmd = cmd_rx.recv() => {
                    let Some(cmd) = cmd else { break };
                    batch.clear();
                    let mut pending = Some(cmd);
                    let mut quit = false;
                    // Drain whatever is queued so one lock covers a batch.
                    while let Some(cmd) = pending.take() {
                        match cmd {
                            Command::Observe(id, at) => batch.push((id, at)),
                            Command::Sync(reply) => {
                                self.apply(&mut batch);
                                let _ = reply.send(());
                            }
                            Command::Quit => {
                                quit = true;
                                break;
                            }
                        }
                        if batch.len() < APPLY_BATCH {
                            pending = cmd_rx.try_recv().ok();
                        }
                    }
                    self.apply(&mut batch);
                    if quit {
                        break;
                    }
                }

                _ = prune_interval.tick() => {
                    let removed = {
                        let mut table = self.table.write().unwrap_or_else(|e| e.into_inner());
                        table.prune(Instant::now(), self.window)
                    };
                    if removed > 0 {
                        trace!(removed, "pruned density observations");
                    }
                }
            }
        }
        debug!("density watcher stopped");
    }

    fn apply(&self, batch: &mut Vec<(ContentId, Instant)>) {
        if batch.is_empty() {
            return;
        }
        let mut table = self.table.write().unwrap_or_else(|e| e.into_inner());
        for (id, at) in batch.drain(..) {
            table.record(id, at);
        }
    }
}
