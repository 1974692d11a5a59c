//! # Per-Peer Dispatcher
//!
//! One [`PeerDispatcher`] runs for every connected peer. It keeps the
//! *working set* of items eligible for that peer and, whenever the link is
//! ready, picks exactly one of them to push next.
//!
//! ## State Machine
//!
//! ```text
//! Idle ──snapshot admitted──▶ Running ──drain / link loss──▶ Draining ──in-flight send done──▶ Stopped
//! ```
//!
//! Draining wakes any blocked [`PeerDispatcher::select_next`], which then
//! returns `None`, and ends the event subscription. A second drain is a
//! no-op.
//!
//! ## Selection: Stochastic-Acceptance Roulette
//!
//! Weighted-random choice proportional to score, without building a
//! cumulative table on every pick:
//!
//! 1. Make sure the cached maximum is valid; if its score fell to or below
//!    the threshold, rescan once and evict everything that decayed.
//! 2. Draw a member uniformly and score it (`s`).
//! 3. `s ≤ threshold`: evict and redraw.
//! 4. Accept with probability `s / s_max`, using an integer draw in
//!    `[0, s_max·K)` compared against `s·K`.
//! 5. Otherwise redraw.
//!
//! Expected draws are O(1) unless scores are heavily skewed. After
//! `max_rejections` consecutive rejections the pick falls back to one
//! exact cumulative pass, which has the same distribution.
//!
//! ## References
//!
//! Lipowski, A., & Lipowska, D. (2012). "Roulette-wheel selection via
//! stochastic acceptance"
//!
//! ## Concurrency
//!
//! One mutex covers the state, membership, cached maximum, sent-set and
//! rng. Nothing awaits while holding it and no store call happens under
//! it; "became non-empty" is signalled separately through a `Notify`.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use anyhow::{Context, Result};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tokio::sync::{watch, Notify};
use tracing::{debug, info, trace, warn};

use crate::content::{now_ms, ContentItem};
use crate::events::{ContentEvent, EventStream, Received, Subscription};
use crate::identity::{ContentId, ForwarderKey, GroupId};
use crate::protocols::{ContentFilter, ContentStore, PeerLink, QueryResult};
use crate::score::Scorer;

/// Items scoring at or below this are never admitted nor returned.
pub const DEFAULT_THRESHOLD: f64 = 0.0;

/// Integer scale of the acceptance draw.
pub const ACCEPTANCE_SCALE: f64 = 1_000_000.0;

/// Rejections in a row before falling back to an exact draw.
pub const DEFAULT_MAX_REJECTIONS: usize = 64;

/// Delay before a failed item becomes eligible again.
pub const DEFAULT_RETRY_BACKOFF: Duration = Duration::from_secs(1);

#[derive(Clone, Debug)]
pub struct DispatchConfig {
    pub threshold: f64,
    /// Only forward this group's content. `None` forwards every group.
    pub group: Option<GroupId>,
    pub max_rejections: usize,
    pub retry_backoff: Duration,
    /// Pause between two consecutive sends on the same link.
    pub send_interval: Duration,
    /// Seed for the selection rng; `None` seeds from the OS.
    pub rng_seed: Option<u64>,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            threshold: DEFAULT_THRESHOLD,
            group: Some(GroupId::public()),
            max_rejections: DEFAULT_MAX_REJECTIONS,
            retry_backoff: DEFAULT_RETRY_BACKOFF,
            send_interval: Duration::ZERO,
            rng_seed: None,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DispatcherState {
    Idle,
    Running,
    Draining,
    Stopped,
}

impl DispatcherState {
    /// Idle and Running dispatchers accept admissions and serve selections.
    pub fn is_live(self) -> bool {
        matches!(self, Self::Idle | Self::Running)
    }
}

/// Outcome of [`PeerDispatcher::admit`]. Rejections are normal steady-state
/// behavior, not errors.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Admission {
    Admitted,
    /// Already a member; its snapshot was replaced.
    Refreshed,
    BelowThreshold,
    AlreadySent,
    OtherGroup,
    /// The dispatcher is draining or stopped.
    Closed,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct DispatchStats {
    pub admitted: u64,
    pub discarded: u64,
    pub selected: u64,
    pub sent: u64,
    pub send_failures: u64,
}

#[derive(Clone, Debug)]
pub struct DispatcherTelemetry {
    pub peer_key: String,
    pub state: DispatcherState,
    pub working_set: usize,
    pub stats: DispatchStats,
}

// ============================================================================
// Working Set
// ============================================================================

struct Member {
    item: Arc<ContentItem>,
    /// Index into `WorkingSet::order`.
    slot: usize,
}

/// Eligible items for one peer, with O(1) uniform draws and a lazily
/// maintained pointer to the best-scoring member.
#[derive(Default)]
pub(crate) struct WorkingSet {
    members: HashMap<ContentId, Member>,
    order: Vec<ContentId>,
    max: Option<ContentId>,
}

impl WorkingSet {
    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    pub fn contains(&self, id: &ContentId) -> bool {
        self.members.contains_key(id)
    }

    /// Insert or replace `item`, whose score is `score`. Returns true when
    /// the id was not a member before.
    pub fn insert(&mut self, item: Arc<ContentItem>, score: f64, scorer: &Scorer, now: u64) -> bool {
        let id = item.id();
        let is_new = match self.members.get_mut(&id) {
            Some(member) => {
                member.item = item;
                false
            }
            None => {
                self.members.insert(id, Member { item, slot: self.order.len() });
                self.order.push(id);
                true
            }
        };

        match self.max {
            // The max itself was replaced and may have dropped; rescan lazily.
            Some(max) if max == id => self.max = None,
            Some(max) => {
                if let Some(current) = self.members.get(&max)
                    && score > scorer.score_at(&current.item, now)
                {
                    self.max = Some(id);
                }
            }
            None if self.order.len() == 1 => self.max = Some(id),
            None => {}
        }
        is_new
    }

    pub fn remove(&mut self, id: &ContentId) -> Option<Arc<ContentItem>> {
        let member = self.members.remove(id)?;
        self.order.swap_remove(member.slot);
        if let Some(moved) = self.order.get(member.slot)
            && let Some(moved_member) = self.members.get_mut(moved)
        {
            moved_member.slot = member.slot;
        }
        if self.max == Some(*id) {
            self.max = None;
        }
        Some(member.item)
    }

    pub fn clear(&mut self) {
        self.members.clear();
        self.order.clear();
        self.max = None;
    }

    /// Score of the cached maximum, rescanning (and evicting decayed
    /// members) when the cache is empty or no longer above threshold.
    /// `None` once the set is empty.
    fn refresh_max(&mut self, scorer: &Scorer, threshold: f64, now: u64) -> Option<f64> {
        if self.is_empty() {
            self.max = None;
            return None;
        }
        if let Some(max) = self.max
            && let Some(member) = self.members.get(&max)
        {
            let score = scorer.score_at(&member.item, now);
            if score > threshold {
                return Some(score);
            }
        }

        self.max = None;
        let mut best: Option<(ContentId, f64)> = None;
        let mut decayed = Vec::new();
        for (id, member) in &self.members {
            let score = scorer.score_at(&member.item, now);
            if score <= threshold {
                decayed.push(*id);
                continue;
            }
            if best.is_none_or(|(_, best_score)| score > best_score) {
                best = Some((*id, score));
            }
        }
        for id in &decayed {
            self.remove(id);
        }
        if !decayed.is_empty() {
            trace!(evicted = decayed.len(), "lazy eviction of decayed members");
        }

        let (id, score) = best?;
        self.max = Some(id);
        Some(score)
    }

    /// Pick and remove one member with probability proportional to score.
    pub fn select<R: Rng>(
        &mut self,
        rng: &mut R,
        scorer: &Scorer,
        threshold: f64,
        now: u64,
        max_rejections: usize,
    ) -> Option<Arc<ContentItem>> {
        let mut rejections = 0;
        loop {
            let max_score = self.refresh_max(scorer, threshold, now)?;
            if rejections >= max_rejections {
                return self.select_exact(rng, scorer, threshold, now);
            }

            let id = self.order[rng.gen_range(0..self.order.len())];
            let score = match self.members.get(&id) {
                Some(member) => scorer.score_at(&member.item, now),
                None => continue,
            };

            if score <= threshold {
                // Decayed between admission and draw.
                self.remove(&id);
                continue;
            }
            if score > max_score {
                // Stale maximum: adopt the better member and redraw.
                self.max = Some(id);
                continue;
            }

            let max_scaled = ((max_score * ACCEPTANCE_SCALE) as u64).max(1);
            let scaled = (score * ACCEPTANCE_SCALE) as u64;
            if rng.gen_range(0..max_scaled) < scaled {
                return self.remove(&id);
            }
            rejections += 1;
        }
    }

    /// One cumulative pass over the members.
    fn select_exact<R: Rng>(
        &mut self,
        rng: &mut R,
        scorer: &Scorer,
        threshold: f64,
        now: u64,
    ) -> Option<Arc<ContentItem>> {
        let mut scored = Vec::with_capacity(self.order.len());
        let mut decayed = Vec::new();
        let mut total = 0.0;
        for id in &self.order {
            let Some(member) = self.members.get(id) else { continue };
            let score = scorer.score_at(&member.item, now);
            if score <= threshold {
                decayed.push(*id);
            } else {
                total += score;
                scored.push((*id, total));
            }
        }
        for id in &decayed {
            self.remove(id);
        }

        let (last, _) = *scored.last()?;
        if total <= 0.0 {
            // Only reachable with a negative threshold.
            let (id, _) = scored[rng.gen_range(0..scored.len())];
            return self.remove(&id);
        }
        let target = rng.gen_range(0.0..total);
        let chosen = scored
            .iter()
            .find(|(_, cumulative)| target < *cumulative)
            .map(|(id, _)| *id)
            .unwrap_or(last);
        self.remove(&chosen)
    }
}

// ============================================================================
// Dispatcher
// ============================================================================

struct Inner {
    state: DispatcherState,
    launched: bool,
    working: WorkingSet,
    /// Items this dispatcher confirmed as delivered. Mirrors the peer's
    /// entry in the store's forwarder sets so stale snapshots replayed by
    /// the event stream cannot re-admit them.
    sent: HashSet<ContentId>,
    rng: StdRng,
    stats: DispatchStats,
}

struct Shared {
    peer_key: String,
    forwarder_key: ForwarderKey,
    config: DispatchConfig,
    scorer: Scorer,
    store: Arc<dyn ContentStore>,
    inner: Mutex<Inner>,
    not_empty: Notify,
    state_tx: watch::Sender<DispatcherState>,
}

/// Cheap-to-clone handle to one peer's dispatcher.
#[derive(Clone)]
pub struct PeerDispatcher {
    shared: Arc<Shared>,
}

impl PeerDispatcher {
    pub fn new(
        peer_key: impl Into<String>,
        forwarder_key: ForwarderKey,
        scorer: Scorer,
        store: Arc<dyn ContentStore>,
        config: DispatchConfig,
    ) -> Self {
        let rng = match config.rng_seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        let (state_tx, _) = watch::channel(DispatcherState::Idle);
        Self {
            shared: Arc::new(Shared {
                peer_key: peer_key.into(),
                forwarder_key,
                config,
                scorer,
                store,
                inner: Mutex::new(Inner {
                    state: DispatcherState::Idle,
                    launched: false,
                    working: WorkingSet::default(),
                    sent: HashSet::new(),
                    rng,
                    stats: DispatchStats::default(),
                }),
                not_empty: Notify::new(),
                state_tx,
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.shared.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn peer_key(&self) -> &str {
        &self.shared.peer_key
    }

    pub fn forwarder_key(&self) -> ForwarderKey {
        self.shared.forwarder_key
    }

    pub fn state(&self) -> DispatcherState {
        self.lock().state
    }

    pub fn is_live(&self) -> bool {
        self.state().is_live()
    }

    pub fn working_set_len(&self) -> usize {
        self.lock().working.len()
    }

    pub fn contains(&self, id: &ContentId) -> bool {
        self.lock().working.contains(id)
    }

    pub fn telemetry(&self) -> DispatcherTelemetry {
        let inner = self.lock();
        DispatcherTelemetry {
            peer_key: self.shared.peer_key.clone(),
            state: inner.state,
            working_set: inner.working.len(),
            stats: inner.stats.clone(),
        }
    }

    /// Offer an item to this peer's working set.
    pub fn admit(&self, item: Arc<ContentItem>) -> Admission {
        let config = &self.shared.config;
        let id = item.id();
        let outcome = {
            let mut inner = self.lock();
            if !inner.state.is_live() {
                return Admission::Closed;
            }

            let outcome = if config.group.is_some_and(|group| group != item.group) {
                Admission::OtherGroup
            } else if item.is_forwarded_to(&self.shared.forwarder_key) || inner.sent.contains(&id) {
                Admission::AlreadySent
            } else {
                let now = now_ms();
                let score = self.shared.scorer.score_at(&item, now);
                if score <= config.threshold {
                    Admission::BelowThreshold
                } else if inner.working.insert(item, score, &self.shared.scorer, now) {
                    Admission::Admitted
                } else {
                    Admission::Refreshed
                }
            };

            match outcome {
                Admission::Admitted | Admission::Refreshed => inner.stats.admitted += 1,
                _ => {
                    // A fresher snapshot can disqualify a current member.
                    inner.working.remove(&id);
                    inner.stats.discarded += 1;
                }
            }
            outcome
        };

        if matches!(outcome, Admission::Admitted | Admission::Refreshed) {
            self.shared.not_empty.notify_one();
        }
        trace!(peer = %self.shared.peer_key, content = %id, ?outcome, "admission");
        outcome
    }

    /// Remove `id` from the working set. Returns true if it was a member.
    pub fn evict(&self, id: &ContentId) -> bool {
        self.lock().working.remove(id).is_some()
    }

    /// Wait for the working set to be non-empty, then remove and return one
    /// item chosen by stochastic acceptance. Returns `None` once draining.
    pub async fn select_next(&self) -> Option<Arc<ContentItem>> {
        let config = &self.shared.config;
        loop {
            let notified = self.shared.not_empty.notified();
            tokio::pin!(notified);
            // Register before checking so an admission or drain in between
            // is not missed.
            notified.as_mut().enable();

            {
                let mut guard = self.lock();
                if !guard.state.is_live() {
                    return None;
                }
                let inner = &mut *guard;
                let picked = inner.working.select(
                    &mut inner.rng,
                    &self.shared.scorer,
                    config.threshold,
                    now_ms(),
                    config.max_rejections,
                );
                if let Some(item) = picked {
                    inner.stats.selected += 1;
                    return Some(item);
                }
            }

            notified.await;
        }
    }

    /// Record a confirmed delivery of `item` to this peer.
    ///
    /// Called after the transport reported success, never before, so a
    /// failed send leaves the item unmarked.
    pub async fn mark_sent(&self, item: &ContentItem) -> Result<()> {
        let id = item.id();
        {
            let mut inner = self.lock();
            inner.sent.insert(id);
            inner.working.remove(&id);
            inner.stats.sent += 1;
        }
        self.shared
            .store
            .mark_forwarded(&id, &self.shared.forwarder_key)
            .await
            .with_context(|| format!("marking {} forwarded to {}", id, self.shared.peer_key))
    }

    /// Stop serving this peer. Idempotent.
    pub fn drain(&self) {
        let next = {
            let mut inner = self.lock();
            if !inner.state.is_live() {
                return;
            }
            // Never launched: nothing in flight, no subscription to end.
            inner.state = if inner.launched {
                DispatcherState::Draining
            } else {
                inner.working.clear();
                DispatcherState::Stopped
            };
            inner.state
        };
        self.shared.state_tx.send_replace(next);
        self.shared.not_empty.notify_waiters();
        debug!(peer = %self.shared.peer_key, state = ?next, "dispatcher draining");
    }

    /// Wait until the dispatcher reached `Stopped`.
    pub async fn wait_stopped(&self) {
        let mut rx = self.shared.state_tx.subscribe();
        let _ = rx.wait_for(|state| *state == DispatcherState::Stopped).await;
    }

    async fn drained(&self) {
        let mut rx = self.shared.state_tx.subscribe();
        let _ = rx.wait_for(|state| !state.is_live()).await;
    }

    // ========================================================================
    // Worker
    // ========================================================================

    /// Subscribe to `events` now and run the dispatcher for `link` on a
    /// background task. Must be called inside a tokio runtime.
    pub(crate) fn launch(&self, link: Arc<dyn PeerLink>, events: &EventStream) {
        // Subscribe before the snapshot load so no insert falls in between.
        let subscription = events.subscribe();
        self.lock().launched = true;
        let this = self.clone();
        tokio::spawn(async move { this.run(link, subscription).await });
    }

    async fn run(self, link: Arc<dyn PeerLink>, subscription: Subscription) {
        self.load_snapshot().await;

        let started = {
            let mut inner = self.lock();
            if inner.state == DispatcherState::Idle {
                inner.state = DispatcherState::Running;
                true
            } else {
                false
            }
        };

        if started {
            self.shared.state_tx.send_replace(DispatcherState::Running);
            info!(
                peer = %self.shared.peer_key,
                eligible = self.working_set_len(),
                "dispatcher running"
            );
            tokio::join!(self.apply_events(subscription), self.forward(link.as_ref()));
        } else {
            drop(subscription);
        }

        {
            let mut inner = self.lock();
            inner.state = DispatcherState::Stopped;
            inner.working.clear();
        }
        self.shared.state_tx.send_replace(DispatcherState::Stopped);
        info!(peer = %self.shared.peer_key, "dispatcher stopped");
    }

    /// Admit every stored item eligible for this peer.
    async fn load_snapshot(&self) {
        let filter = ContentFilter::eligible_for(self.shared.config.group, self.shared.forwarder_key);
        let ids = match self.shared.store.query(&filter).await {
            Ok(QueryResult::Ids(ids)) => ids,
            Ok(QueryResult::Items(items)) => {
                for item in items {
                    self.admit(Arc::new(item));
                }
                return;
            }
            Ok(QueryResult::Count(_)) => {
                warn!(peer = %self.shared.peer_key, "store answered an id query with a count");
                return;
            }
            Err(e) => {
                warn!(peer = %self.shared.peer_key, error = %e, "initial catalog query failed");
                return;
            }
        };

        for id in ids {
            if !self.is_live() {
                return;
            }
            match self.shared.store.get(&id).await {
                Ok(Some(item)) => {
                    self.admit(Arc::new(item));
                }
                Ok(None) => {}
                Err(e) => debug!(content = %id, error = %e, "snapshot read failed"),
            }
        }
    }

    async fn apply_events(&self, mut subscription: Subscription) {
        loop {
            tokio::select! {
                biased;
                _ = self.drained() => break,
                received = subscription.recv() => match received {
                    Received::Event(ContentEvent::Inserted(item))
                    | Received::Event(ContentEvent::Updated(item)) => {
                        self.admit(item);
                    }
                    Received::Event(ContentEvent::Deleted(id)) => {
                        self.evict(&id);
                    }
                    Received::Event(ContentEvent::Duplicate(_)) => {}
                    Received::Lagged(missed) => {
                        warn!(peer = %self.shared.peer_key, missed, "event stream lagged, reloading snapshot");
                        self.load_snapshot().await;
                    }
                    Received::Closed => break,
                },
            }
        }
        trace!(peer = %self.shared.peer_key, "event subscription closed");
    }

    async fn forward(&self, link: &dyn PeerLink) {
        let config = &self.shared.config;
        while let Some(item) = self.select_next().await {
            match link.send(&item).await {
                Ok(()) => {
                    trace!(peer = %self.shared.peer_key, content = %item.id(), "item forwarded");
                    if let Err(e) = self.mark_sent(&item).await {
                        warn!(error = %e, "delivery mark failed");
                    }
                }
                Err(e) => {
                    self.lock().stats.send_failures += 1;
                    if !link.is_connected() {
                        debug!(peer = %self.shared.peer_key, error = %e, "link lost");
                        self.drain();
                        break;
                    }
                    debug!(peer = %self.shared.peer_key, error = %e, "send failed, will retry");
                    tokio::select! {
                        _ = tokio::time::sleep(config.retry_backoff) => {}
                        _ = self.drained() => break,
                    }
                    self.admit(item);
                }
            }

            if !config.send_interval.is_zero() {
                tokio::select! {
                    _ = tokio::time::sleep(config.send_interval) => {}
                    _ = self.drained() => break,
                }
            }
        }
    }
}

impl std::fmt::Debug for PeerDispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PeerDispatcher")
            .field("peer_key", &self.shared.peer_key)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::EventStream;
    use crate::identity::UserId;
    use crate::score::{RelevanceModel, ScoreWeights};
    use crate::store::MemoryStore;

    /// Relevance looked up by body text; everything else scores 0.
    struct ByBody(HashMap<String, f64>);

    impl RelevanceModel for ByBody {
        fn relevance(&self, item: &ContentItem) -> f64 {
            self.0.get(&item.body).copied().unwrap_or(0.0)
        }
    }

    /// Relevance that tests can change after admission.
    #[derive(Default)]
    struct Tunable(Mutex<HashMap<String, f64>>);

    impl Tunable {
        fn set(&self, body: &str, relevance: f64) {
            self.0.lock().unwrap().insert(body.to_string(), relevance);
        }
    }

    impl RelevanceModel for Tunable {
        fn relevance(&self, item: &ContentItem) -> f64 {
            self.0.lock().unwrap().get(&item.body).copied().unwrap_or(0.0)
        }
    }

    fn relevance_scorer(pairs: &[(&str, f64)]) -> Scorer {
        let map = pairs.iter().map(|(b, s)| (b.to_string(), *s)).collect();
        Scorer::without_density()
            .with_weights(ScoreWeights { relevance: 1.0, density: 0.0, quality: 0.0 })
            .with_relevance(Arc::new(ByBody(map)))
    }

    fn item(body: &str) -> Arc<ContentItem> {
        Arc::new(ContentItem::new(UserId::derive("hal", 0), GroupId::public(), body, now_ms()))
    }

    fn dispatcher(scorer: Scorer, threshold: f64) -> PeerDispatcher {
        let store = MemoryStore::new(EventStream::default());
        PeerDispatcher::new(
            "peer-1",
            ForwarderKey::derive("peer-1", "test"),
            scorer,
            store,
            DispatchConfig {
                threshold,
                rng_seed: Some(7),
                ..DispatchConfig::default()
            },
        )
    }

    #[test]
    fn working_set_swap_remove_keeps_slots() {
        let scorer = Scorer::without_density();
        let mut set = WorkingSet::default();
        let items: Vec<_> = (0..5).map(|i| item(&format!("w{}", i))).collect();
        for it in &items {
            set.insert(it.clone(), 0.6, &scorer, 0);
        }
        assert!(set.remove(&items[1].id()).is_some());
        assert!(set.remove(&items[4].id()).is_some());
        assert!(set.remove(&items[1].id()).is_none());
        assert_eq!(set.len(), 3);
        for id in &set.order {
            assert_eq!(set.order[set.members[id].slot], *id);
        }
    }

    #[test]
    fn cached_max_tracks_best_admission() {
        let scorer = relevance_scorer(&[("lo", 0.3), ("hi", 0.9)]);
        let mut set = WorkingSet::default();
        let lo = item("lo");
        let hi = item("hi");
        set.insert(lo.clone(), 0.3, &scorer, 0);
        assert_eq!(set.max, Some(lo.id()));
        set.insert(hi.clone(), 0.9, &scorer, 0);
        assert_eq!(set.max, Some(hi.id()));

        set.remove(&hi.id());
        assert_eq!(set.max, None);
        assert_eq!(set.refresh_max(&scorer, 0.0, 0), Some(0.3));
        assert_eq!(set.max, Some(lo.id()));
    }

    #[test]
    fn refresh_evicts_decayed_members() {
        let scorer = Scorer::without_density();
        let mut set = WorkingSet::default();
        let short = Arc::new(
            ContentItem::new(UserId::derive("hal", 0), GroupId::public(), "short", 1_000).with_ttl_ms(1_000),
        );
        let long = Arc::new(ContentItem::new(UserId::derive("hal", 0), GroupId::public(), "long", 1_000));
        set.insert(short.clone(), 0.6, &scorer, 1_000);
        set.insert(long.clone(), 0.6, &scorer, 1_000);
        set.max = None;

        assert!(set.refresh_max(&scorer, 0.0, 5_000).is_some());
        assert!(!set.contains(&short.id()));
        assert!(set.contains(&long.id()));
    }

    #[test]
    fn select_skips_items_that_decayed_after_admission() {
        let scorer = Scorer::without_density();
        let mut set = WorkingSet::default();
        let expiring = Arc::new(
            ContentItem::new(UserId::derive("hal", 0), GroupId::public(), "soon", 0).with_ttl_ms(100),
        );
        set.insert(expiring, 0.6, &scorer, 0);
        let mut rng = StdRng::seed_from_u64(1);

        assert!(set.select(&mut rng, &scorer, 0.0, 500, 64).is_none());
        assert!(set.is_empty());
    }

    #[test]
    fn selection_is_proportional_to_score() {
        let scorer = relevance_scorer(&[("big", 0.8), ("small", 0.2)]);
        let big = item("big");
        let small = item("small");
        let mut rng = StdRng::seed_from_u64(42);
        let mut big_count = 0;
        let trials = 10_000;

        for _ in 0..trials {
            let mut set = WorkingSet::default();
            set.insert(big.clone(), 0.8, &scorer, 0);
            set.insert(small.clone(), 0.2, &scorer, 0);
            let picked = set.select(&mut rng, &scorer, 0.0, 0, 64).expect("non-empty");
            if picked.id() == big.id() {
                big_count += 1;
            }
        }

        let share = big_count as f64 / trials as f64;
        assert!((share - 0.8).abs() < 0.03, "big share {}", share);
    }

    #[test]
    fn exact_fallback_keeps_distribution() {
        let scorer = relevance_scorer(&[("big", 0.75), ("small", 0.25)]);
        let big = item("big");
        let small = item("small");
        let mut rng = StdRng::seed_from_u64(9);
        let mut big_count = 0;
        let trials = 10_000;

        for _ in 0..trials {
            let mut set = WorkingSet::default();
            set.insert(big.clone(), 0.75, &scorer, 0);
            set.insert(small.clone(), 0.25, &scorer, 0);
            // Zero rejections allowed: always the exact pass.
            let picked = set.select(&mut rng, &scorer, 0.0, 0, 0).expect("non-empty");
            if picked.id() == big.id() {
                big_count += 1;
            }
        }

        let share = big_count as f64 / trials as f64;
        assert!((share - 0.75).abs() < 0.03, "big share {}", share);
    }

    #[test]
    fn below_threshold_is_discarded() {
        let d = dispatcher(relevance_scorer(&[("a", 0.9), ("b", 0.1)]), 0.2);
        assert_eq!(d.admit(item("a")), Admission::Admitted);
        assert_eq!(d.admit(item("b")), Admission::BelowThreshold);
        assert_eq!(d.admit(item("a")), Admission::Refreshed);
        assert_eq!(d.working_set_len(), 1);
        assert_eq!(d.telemetry().stats.discarded, 1);
    }

    #[test]
    fn other_groups_and_forwarded_items_are_rejected() {
        let d = dispatcher(Scorer::without_density(), 0.0);

        let hikers = Arc::new(ContentItem::new(
            UserId::derive("hal", 0),
            GroupId::derive("hikers", None),
            "trail",
            now_ms(),
        ));
        assert_eq!(d.admit(hikers), Admission::OtherGroup);

        let mut sent = ContentItem::new(UserId::derive("hal", 0), GroupId::public(), "old", now_ms());
        sent.add_forwarder(d.forwarder_key());
        assert_eq!(d.admit(Arc::new(sent)), Admission::AlreadySent);
    }

    #[tokio::test]
    async fn mark_sent_blocks_replayed_admission() {
        let d = dispatcher(Scorer::without_density(), 0.0);
        let it = item("once");
        assert_eq!(d.admit(it.clone()), Admission::Admitted);

        let picked = d.select_next().await.expect("item");
        d.mark_sent(&picked).await.expect("mark");

        // Same stale snapshot replayed from the event stream.
        assert_eq!(d.admit(it), Admission::AlreadySent);
        assert_eq!(d.working_set_len(), 0);
    }

    #[tokio::test]
    async fn downgraded_snapshot_evicts_member() {
        let d = dispatcher(Scorer::without_density(), 0.0);
        let fresh = item("news");
        assert_eq!(d.admit(fresh.clone()), Admission::Admitted);

        let mut expired = (*fresh).clone();
        expired.ttl_ms = 1;
        expired.created_at_ms = 0;
        assert_eq!(d.admit(Arc::new(expired)), Admission::BelowThreshold);
        assert!(!d.contains(&fresh.id()));
    }

    #[tokio::test]
    async fn select_next_waits_for_admission() {
        let d = dispatcher(Scorer::without_density(), 0.0);
        let waiter = {
            let d = d.clone();
            tokio::spawn(async move { d.select_next().await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());

        let it = item("late");
        d.admit(it.clone());
        let got = tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("woken")
            .expect("join")
            .expect("item");
        assert_eq!(got.id(), it.id());
    }

    #[tokio::test]
    async fn evicting_the_max_forces_a_rescan() {
        let model = Arc::new(Tunable::default());
        model.set("a", 0.9);
        model.set("b", 0.5);
        let scorer = Scorer::without_density()
            .with_weights(ScoreWeights { relevance: 1.0, density: 0.0, quality: 0.0 })
            .with_relevance(model.clone());
        let d = dispatcher(scorer, 0.2);
        let a = item("a");
        let b = item("b");
        assert_eq!(d.admit(a.clone()), Admission::Admitted);
        assert_eq!(d.admit(b.clone()), Admission::Admitted);
        assert_eq!(d.lock().working.max, Some(a.id()));

        assert!(d.evict(&a.id()));
        assert!(!d.evict(&a.id()));
        assert_eq!(d.lock().working.max, None);
        assert!(d.contains(&b.id()));

        // Only sub-threshold content left: the rescan drops it and the
        // selection keeps waiting.
        model.set("b", 0.1);
        let pending = tokio::time::timeout(Duration::from_millis(50), d.select_next()).await;
        assert!(pending.is_err());
        assert_eq!(d.working_set_len(), 0);

        let waiter = {
            let d = d.clone();
            tokio::spawn(async move { d.select_next().await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());

        model.set("c", 0.7);
        let c = item("c");
        assert_eq!(d.admit(c.clone()), Admission::Admitted);
        let got = tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("woken")
            .expect("join")
            .expect("item");
        assert_eq!(got.id(), c.id());
    }

    #[tokio::test]
    async fn drain_cancels_waiting_selection() {
        let d = dispatcher(Scorer::without_density(), 0.0);
        let waiter = {
            let d = d.clone();
            tokio::spawn(async move { d.select_next().await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;

        d.drain();
        d.drain();
        let got = tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("woken")
            .expect("join");
        assert!(got.is_none());
        assert_eq!(d.state(), DispatcherState::Stopped);
        assert_eq!(d.admit(item("after")), Admission::Closed);
    }
}
