//! Collaborator trait definitions for Courier's forwarding engine.
//!
//! The engine decides *what* to send; storing content and moving bytes are
//! done by collaborators behind these traits.
//!
//! ## Collaborator Traits
//!
//! | Collaborator | Trait | Purpose |
//! |--------------|-------|---------|
//! | Storage | [`ContentStore`] | Catalog queries, snapshots, delivery marks |
//! | Transport | [`PeerLink`] | One live link to one peer |
//!
//! Event delivery is a concrete typed channel, see [`crate::events`].
//!
//! ## Design
//!
//! Traits live apart from implementations so the dispatcher depends only
//! on the contract. The engine never holds a lock across a call into a
//! collaborator: store reads are by-value snapshots.

use anyhow::Result;
use async_trait::async_trait;

use crate::content::ContentItem;
use crate::identity::{ContentId, ForwarderKey, GroupId};

/// Requested shape of a catalog query result.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum ResultShape {
    Count,
    #[default]
    Ids,
    Items,
}

/// Catalog query filter.
#[derive(Clone, Debug, Default)]
pub struct ContentFilter {
    /// Restrict to these groups. Empty means every group.
    pub groups: Vec<GroupId>,
    /// Exclude items already forwarded to this peer.
    pub never_sent_to: Option<ForwarderKey>,
    pub shape: ResultShape,
}

impl ContentFilter {
    /// Ids in `group` that were never forwarded to `peer`.
    pub fn eligible_for(group: Option<GroupId>, peer: ForwarderKey) -> Self {
        Self {
            groups: group.into_iter().collect(),
            never_sent_to: Some(peer),
            shape: ResultShape::Ids,
        }
    }

    pub fn matches(&self, item: &ContentItem) -> bool {
        if !self.groups.is_empty() && !self.groups.contains(&item.group) {
            return false;
        }
        if let Some(key) = &self.never_sent_to
            && item.is_forwarded_to(key)
        {
            return false;
        }
        true
    }
}

#[derive(Clone, Debug)]
pub enum QueryResult {
    Count(usize),
    Ids(Vec<ContentId>),
    Items(Vec<ContentItem>),
}

impl QueryResult {
    pub fn len(&self) -> usize {
        match self {
            Self::Count(n) => *n,
            Self::Ids(ids) => ids.len(),
            Self::Items(items) => items.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Content catalog operations consumed by the engine.
#[async_trait]
pub trait ContentStore: Send + Sync + 'static {
    async fn query(&self, filter: &ContentFilter) -> Result<QueryResult>;

    /// By-value snapshot of one item, `None` if it was deleted.
    async fn get(&self, id: &ContentId) -> Result<Option<ContentItem>>;

    /// Add `peer` to the item's forwarder set. Idempotent.
    async fn mark_forwarded(&self, id: &ContentId, peer: &ForwarderKey) -> Result<()>;
}

/// A live link to one peer.
#[async_trait]
pub trait PeerLink: Send + Sync + 'static {
    /// Stable key used to bind at most one dispatcher per peer.
    fn peer_key(&self) -> &str;

    fn remote_address(&self) -> &str;

    fn protocol_id(&self) -> &str;

    /// Key recorded in forwarder sets for this (peer, protocol) pair.
    fn forwarder_key(&self) -> ForwarderKey {
        ForwarderKey::derive(self.remote_address(), self.protocol_id())
    }

    /// False once the underlying connection is gone for good. A failed
    /// send on a disconnected link drains the dispatcher instead of
    /// retrying.
    fn is_connected(&self) -> bool {
        true
    }

    /// Hand one item to the transport. `Ok` means the peer has it.
    async fn send(&self, item: &ContentItem) -> Result<()>;
}
