//! # Courier Node
//!
//! High-level API wiring one device's components together:
//!
//! | Component | Role |
//! |-----------|------|
//! | [`MemoryStore`] | local catalog, publishes content events |
//! | [`DispatchRegistry`] | density watcher plus one dispatcher per peer |
//! | [`Inbox`] | ingests items pushed by peers |
//!
//! Links are one-directional: `a.connect(&b)` lets `a` push to `b`. Use
//! [`Node::connect_pair`] for a symmetric encounter.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::info;

use crate::content::{now_ms, ContentItem};
use crate::events::EventStream;
use crate::identity::{ContentId, GroupId, UserId};
use crate::link::{inbox, link_peer_key, ChannelLink, Frame, DEFAULT_INBOX_CAPACITY};
use crate::registry::{DispatchError, DispatchRegistry, RegistryConfig, RegistryTelemetry};
use crate::store::MemoryStore;

/// Protocol id recorded for links created by [`Node::connect`].
pub const SIM_PROTOCOL: &str = "courier-sim";

#[derive(Clone, Debug)]
pub struct NodeTelemetry {
    pub address: String,
    pub items: usize,
    pub links: usize,
    pub registry: RegistryTelemetry,
}

pub struct Node {
    address: String,
    store: Arc<MemoryStore>,
    registry: DispatchRegistry,
    inbox_tx: mpsc::Sender<Frame>,
    inbox_task: JoinHandle<()>,
    links: Mutex<HashMap<String, Arc<ChannelLink>>>,
}

impl Node {
    /// Build a node and start its registry. Must be called inside a tokio
    /// runtime.
    pub fn spawn(address: impl Into<String>, config: RegistryConfig) -> Self {
        let address = address.into();
        let events = EventStream::default();
        let store = MemoryStore::new(events.clone());
        let registry = DispatchRegistry::new(store.clone(), events, config);
        registry.start();

        let (inbox_tx, inbox) = inbox(DEFAULT_INBOX_CAPACITY);
        let inbox_task = tokio::spawn(inbox.run(store.clone()));

        Self {
            address,
            store,
            registry,
            inbox_tx,
            inbox_task,
            links: Mutex::new(HashMap::new()),
        }
    }

    fn links(&self) -> MutexGuard<'_, HashMap<String, Arc<ChannelLink>>> {
        self.links.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn store(&self) -> &Arc<MemoryStore> {
        &self.store
    }

    pub fn registry(&self) -> &DispatchRegistry {
        &self.registry
    }

    /// Sender that links towards this node push into.
    pub fn inbox_sender(&self) -> mpsc::Sender<Frame> {
        self.inbox_tx.clone()
    }

    /// Publish a public status authored on this node.
    pub async fn post(&self, author: &UserId, body: &str) -> ContentId {
        self.post_item(ContentItem::new(*author, GroupId::public(), body, now_ms())).await
    }

    pub async fn post_item(&self, item: ContentItem) -> ContentId {
        let id = item.id();
        self.store.ingest(item).await;
        id
    }

    /// Open a link from this node to `remote` and bind a dispatcher for it.
    pub fn connect(&self, remote: &Node) -> Result<(), DispatchError> {
        let link = ChannelLink::new(
            self.address.clone(),
            remote.address.clone(),
            SIM_PROTOCOL,
            remote.inbox_sender(),
        );
        self.registry.bind(link.clone())?;
        if let Some(stale) = self.links().insert(remote.address.clone(), link) {
            stale.sever();
        }
        Ok(())
    }

    /// Symmetric encounter: each side pushes to the other.
    pub fn connect_pair(a: &Node, b: &Node) -> Result<(), DispatchError> {
        a.connect(b)?;
        b.connect(a)
    }

    /// Registry key of this node's link to `remote_address`.
    pub fn peer_key(remote_address: &str) -> String {
        link_peer_key(remote_address, SIM_PROTOCOL)
    }

    /// Sever the link to `remote_address` and unbind its dispatcher.
    pub fn disconnect(&self, remote_address: &str) -> Result<(), DispatchError> {
        if let Some(link) = self.links().remove(remote_address) {
            link.sever();
        }
        self.registry.unbind(&Self::peer_key(remote_address))
    }

    /// Sever the link without unbinding. The dispatcher notices on its
    /// next failed send and drains itself.
    pub fn sever(&self, remote_address: &str) -> bool {
        match self.links().get(remote_address) {
            Some(link) => {
                link.sever();
                true
            }
            None => false,
        }
    }

    pub fn is_connected_to(&self, remote_address: &str) -> bool {
        self.registry.is_bound(&Self::peer_key(remote_address))
    }

    pub async fn shutdown(&self) {
        for (_, link) in self.links().drain() {
            link.sever();
        }
        self.registry.stop().await;
        self.inbox_task.abort();
        info!(node = %self.address, "node shut down");
    }

    pub async fn telemetry(&self) -> NodeTelemetry {
        NodeTelemetry {
            address: self.address.clone(),
            items: self.store.len().await,
            links: self.links().len(),
            registry: self.registry.telemetry(),
        }
    }
}

impl std::fmt::Debug for Node {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Node")
            .field("address", &self.address)
            .field("registry", &self.registry)
            .finish_non_exhaustive()
    }
}
