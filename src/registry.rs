//! # Dispatch Registry
//!
//! Owns the density watcher and at most one live [`PeerDispatcher`] per
//! peer key. Transports call [`DispatchRegistry::bind`] when a link comes
//! up and [`DispatchRegistry::unbind`] when it goes away.
//!
//! ## Lifecycle
//!
//! | Operation | Effect |
//! |-----------|--------|
//! | `start` | spawns the density watcher, feeds it repeat arrivals |
//! | `bind` | creates, launches and records a dispatcher for the link |
//! | `unbind` | drains and forgets the peer's dispatcher |
//! | `stop` | drains every dispatcher, then stops the watcher |
//!
//! Density counts content seen arriving *again*, as reported by the
//! store's `Duplicate` event. A first copy is not evidence that the mesh is
//! saturated with it, however popular it was upstream.
//!
//! A dispatcher that drained on its own (its link died) no longer counts
//! as bound, so the same peer key can be bound again on reconnect.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::density::{DensityConfig, DensityWatcher};
use crate::dispatcher::{DispatchConfig, DispatcherTelemetry, PeerDispatcher};
use crate::events::{ContentEvent, EventStream, Received};
use crate::identity::ContentId;
use crate::protocols::{ContentStore, PeerLink};
use crate::score::{AlwaysNear, NoInterest, ProximityGate, RelevanceModel, ScoreWeights, Scorer};

#[derive(Clone, Debug, Default)]
pub struct RegistryConfig {
    pub dispatch: DispatchConfig,
    pub density: DensityConfig,
    pub weights: ScoreWeights,
}

/// Lifecycle errors of the registry.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum DispatchError {
    /// `bind` or `unbind` before `start` or after `stop`.
    NotStarted,
    /// The peer already has a live dispatcher.
    AlreadyBound(String),
    /// `unbind` for a peer that has no live dispatcher.
    NotBound(String),
}

impl std::fmt::Display for DispatchError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NotStarted => write!(f, "dispatch registry is not started"),
            Self::AlreadyBound(peer) => write!(f, "peer {} already has a live dispatcher", peer),
            Self::NotBound(peer) => write!(f, "peer {} has no dispatcher", peer),
        }
    }
}

impl std::error::Error for DispatchError {}

#[derive(Clone, Debug)]
pub struct RegistryTelemetry {
    pub started: bool,
    pub dispatchers: Vec<DispatcherTelemetry>,
    pub tracked_content: usize,
    pub dropped_observations: u64,
}

/// Present between `start` and `stop`.
struct Running {
    watcher: DensityWatcher,
    scorer: Scorer,
    observer: JoinHandle<()>,
}

#[derive(Default)]
struct RegistryState {
    running: Option<Running>,
    dispatchers: HashMap<String, PeerDispatcher>,
}

pub struct DispatchRegistry {
    store: Arc<dyn ContentStore>,
    events: EventStream,
    config: RegistryConfig,
    relevance: Arc<dyn RelevanceModel>,
    proximity: Arc<dyn ProximityGate>,
    state: Mutex<RegistryState>,
}

impl DispatchRegistry {
    pub fn new(store: Arc<dyn ContentStore>, events: EventStream, config: RegistryConfig) -> Self {
        Self {
            store,
            events,
            config,
            relevance: Arc::new(NoInterest),
            proximity: Arc::new(AlwaysNear),
            state: Mutex::new(RegistryState::default()),
        }
    }

    /// Interest model for every dispatcher bound after `start`.
    pub fn with_relevance(mut self, model: Arc<dyn RelevanceModel>) -> Self {
        self.relevance = model;
        self
    }

    pub fn with_proximity(mut self, gate: Arc<dyn ProximityGate>) -> Self {
        self.proximity = gate;
        self
    }

    fn lock(&self) -> MutexGuard<'_, RegistryState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Spawn the density watcher and begin observing repeat arrivals.
    /// Idempotent.
    /// Must be called inside a tokio runtime.
    pub fn start(&self) {
        let mut state = self.lock();
        if state.running.is_some() {
            return;
        }

        let watcher = DensityWatcher::spawn(self.config.density.clone());
        let scorer = Scorer::new(Arc::new(watcher.clone()))
            .with_weights(self.config.weights)
            .with_relevance(self.relevance.clone())
            .with_proximity(self.proximity.clone());

        let mut subscription = self.events.subscribe();
        let observed = watcher.clone();
        let observer = tokio::spawn(async move {
            loop {
                match subscription.recv().await {
                    Received::Event(ContentEvent::Duplicate(id)) => observed.record_observation(id),
                    Received::Event(_) => {}
                    Received::Lagged(missed) => warn!(missed, "density observer lagged"),
                    Received::Closed => break,
                }
            }
        });

        state.running = Some(Running { watcher, scorer, observer });
        info!("dispatch registry started");
    }

    /// Drain every dispatcher, wait for them to stop, and stop the watcher.
    pub async fn stop(&self) {
        let (running, dispatchers) = {
            let mut state = self.lock();
            let dispatchers: Vec<_> = state.dispatchers.drain().map(|(_, d)| d).collect();
            (state.running.take(), dispatchers)
        };

        for dispatcher in &dispatchers {
            dispatcher.drain();
        }
        for dispatcher in &dispatchers {
            dispatcher.wait_stopped().await;
        }

        if let Some(running) = running {
            running.observer.abort();
            running.watcher.stop().await;
            info!(dispatchers = dispatchers.len(), "dispatch registry stopped");
        }
    }

    pub fn is_started(&self) -> bool {
        self.lock().running.is_some()
    }

    /// Create and launch a dispatcher for `link`.
    ///
    /// Fails with `AlreadyBound` while the peer key has a live dispatcher.
    /// A drained one is replaced.
    pub fn bind(&self, link: Arc<dyn PeerLink>) -> Result<PeerDispatcher, DispatchError> {
        let mut state = self.lock();
        let scorer = match &state.running {
            Some(running) => running.scorer.clone(),
            None => return Err(DispatchError::NotStarted),
        };

        let peer_key = link.peer_key().to_string();
        if let Some(existing) = state.dispatchers.get(&peer_key)
            && existing.is_live()
        {
            return Err(DispatchError::AlreadyBound(peer_key));
        }

        let dispatcher = PeerDispatcher::new(
            peer_key.clone(),
            link.forwarder_key(),
            scorer,
            self.store.clone(),
            self.config.dispatch.clone(),
        );
        dispatcher.launch(link, &self.events);
        state.dispatchers.insert(peer_key.clone(), dispatcher.clone());
        debug!(peer = %peer_key, "peer bound");
        Ok(dispatcher)
    }

    /// Drain and forget the peer's dispatcher.
    ///
    /// A dispatcher that already drained on its own is forgotten too, but
    /// reported as `NotBound`, matching [`Self::is_bound`].
    pub fn unbind(&self, peer_key: &str) -> Result<(), DispatchError> {
        let removed = {
            let mut state = self.lock();
            if state.running.is_none() {
                return Err(DispatchError::NotStarted);
            }
            state.dispatchers.remove(peer_key)
        };
        match removed {
            Some(dispatcher) if dispatcher.is_live() => {
                dispatcher.drain();
                debug!(peer = %peer_key, "peer unbound");
                Ok(())
            }
            _ => Err(DispatchError::NotBound(peer_key.to_string())),
        }
    }

    /// Record that `id` was seen arriving, outside the event stream.
    pub fn observe(&self, id: ContentId) {
        if let Some(running) = &self.lock().running {
            running.watcher.record_observation(id);
        }
    }

    pub fn is_bound(&self, peer_key: &str) -> bool {
        self.lock()
            .dispatchers
            .get(peer_key)
            .is_some_and(|d| d.is_live())
    }

    /// Peer keys with a live dispatcher, sorted.
    pub fn bound_peers(&self) -> Vec<String> {
        let mut peers: Vec<_> = self
            .lock()
            .dispatchers
            .iter()
            .filter(|(_, d)| d.is_live())
            .map(|(key, _)| key.clone())
            .collect();
        peers.sort();
        peers
    }

    pub fn dispatcher(&self, peer_key: &str) -> Option<PeerDispatcher> {
        self.lock().dispatchers.get(peer_key).cloned()
    }

    pub fn density_watcher(&self) -> Option<DensityWatcher> {
        self.lock().running.as_ref().map(|r| r.watcher.clone())
    }

    pub fn telemetry(&self) -> RegistryTelemetry {
        let state = self.lock();
        let mut dispatchers: Vec<_> = state.dispatchers.values().map(|d| d.telemetry()).collect();
        dispatchers.sort_by(|a, b| a.peer_key.cmp(&b.peer_key));
        let (tracked_content, dropped_observations) = match &state.running {
            Some(running) => (running.watcher.tracked_content(), running.watcher.dropped_observations()),
            None => (0, 0),
        };
        RegistryTelemetry {
            started: state.running.is_some(),
            dispatchers,
            tracked_content,
            dropped_observations,
        }
    }
}

impl std::fmt::Debug for DispatchRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.lock();
        f.debug_struct("DispatchRegistry")
            .field("started", &state.running.is_some())
            .field("dispatchers", &state.dispatchers.len())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use anyhow::Result;
    use async_trait::async_trait;

    use super::*;
    use crate::content::ContentItem;
    use crate::dispatcher::DispatcherState;
    use crate::store::MemoryStore;

    struct NullLink {
        key: String,
    }

    #[async_trait]
    impl PeerLink for NullLink {
        fn peer_key(&self) -> &str {
            &self.key
        }

        fn remote_address(&self) -> &str {
            &self.key
        }

        fn protocol_id(&self) -> &str {
            "null"
        }

        async fn send(&self, _item: &ContentItem) -> Result<()> {
            Ok(())
        }
    }

    fn link(key: &str) -> Arc<dyn PeerLink> {
        Arc::new(NullLink { key: key.to_string() })
    }

    fn registry() -> (Arc<MemoryStore>, DispatchRegistry) {
        let events = EventStream::default();
        let store = MemoryStore::new(events.clone());
        let registry = DispatchRegistry::new(store.clone(), events, RegistryConfig::default());
        (store, registry)
    }

    #[tokio::test]
    async fn bind_requires_start() {
        let (_, registry) = registry();
        assert_eq!(registry.bind(link("p")).unwrap_err(), DispatchError::NotStarted);

        registry.start();
        assert!(registry.bind(link("p")).is_ok());
        registry.stop().await;
        assert_eq!(registry.bind(link("p")).unwrap_err(), DispatchError::NotStarted);
    }

    #[tokio::test]
    async fn unbind_requires_start() {
        let (_, registry) = registry();
        assert_eq!(registry.unbind("p").unwrap_err(), DispatchError::NotStarted);

        registry.start();
        registry.bind(link("p")).expect("bind");
        registry.stop().await;
        assert_eq!(registry.unbind("p").unwrap_err(), DispatchError::NotStarted);
    }

    #[tokio::test]
    async fn one_live_dispatcher_per_peer() {
        let (_, registry) = registry();
        registry.start();

        registry.bind(link("p")).expect("first bind");
        assert_eq!(
            registry.bind(link("p")).unwrap_err(),
            DispatchError::AlreadyBound("p".into())
        );
        registry.bind(link("q")).expect("other peer");
        assert_eq!(registry.bound_peers(), vec!["p".to_string(), "q".to_string()]);

        registry.unbind("p").expect("unbind");
        assert!(!registry.is_bound("p"));
        assert_eq!(registry.unbind("p").unwrap_err(), DispatchError::NotBound("p".into()));
        registry.bind(link("p")).expect("rebind");

        registry.stop().await;
        assert!(registry.bound_peers().is_empty());
    }

    #[tokio::test]
    async fn drained_dispatcher_can_be_replaced() {
        let (_, registry) = registry();
        registry.start();

        let first = registry.bind(link("p")).expect("bind");
        first.drain();
        tokio::time::timeout(Duration::from_secs(2), first.wait_stopped())
            .await
            .expect("stopped");
        assert!(!registry.is_bound("p"));

        // Not live, so not bound: unbind agrees with is_bound.
        assert_eq!(registry.unbind("p").unwrap_err(), DispatchError::NotBound("p".into()));
        assert!(registry.dispatcher("p").is_none());

        let second = registry.bind(link("p")).expect("rebind");
        assert!(second.is_live());
        assert_eq!(first.state(), DispatcherState::Stopped);
        registry.stop().await;
    }

    #[tokio::test]
    async fn repeat_arrivals_feed_density() {
        let (store, registry) = registry();
        registry.start();

        let item = ContentItem::new(
            crate::identity::UserId::derive("ivy", 0),
            crate::identity::GroupId::public(),
            "dense",
            0,
        );
        let id = item.id();
        store.ingest(item.clone()).await;
        let watcher = registry.density_watcher().expect("running");
        tokio::time::sleep(Duration::from_millis(20)).await;
        watcher.sync().await;
        assert_eq!(watcher.compute_metric(&id), 0.0);

        store.ingest(item).await;
        // The observer task forwards asynchronously; poll until it did.
        tokio::time::timeout(Duration::from_secs(2), async {
            loop {
                watcher.sync().await;
                if watcher.compute_metric(&id) > 0.0 {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("observed");
        assert_eq!(registry.telemetry().tracked_content, 1);
        registry.stop().await;
    }

    #[tokio::test]
    async fn first_copy_of_popular_content_is_not_saturated() {
        let (store, registry) = registry();
        registry.start();

        let mut upstream = ContentItem::new(
            crate::identity::UserId::derive("ivy", 0),
            crate::identity::GroupId::public(),
            "seen everywhere",
            0,
        );
        upstream.duplicates = 3;
        let arrived = upstream.received_from_peer(10);
        assert_eq!(store.ingest(arrived.clone()).await, crate::store::IngestOutcome::New);

        let watcher = registry.density_watcher().expect("running");
        tokio::time::sleep(Duration::from_millis(20)).await;
        watcher.sync().await;
        assert_eq!(watcher.compute_metric(&arrived.id()), 0.0);

        let scorer = Scorer::new(Arc::new(watcher.clone()));
        assert!(scorer.score(&arrived) > 0.0);
        registry.stop().await;
    }
}
