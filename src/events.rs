//! Typed content event stream.
//!
//! The store publishes every catalog change here; each dispatcher and the
//! registry hold their own [`Subscription`]. Dropping a subscription is the
//! unsubscribe, so teardown is tied to the owner's lifetime.

use std::sync::Arc;

use tokio::sync::broadcast;

use crate::content::ContentItem;
use crate::identity::ContentId;

/// Default buffered events per subscriber before it starts lagging.
pub const DEFAULT_EVENT_CAPACITY: usize = 1024;

#[derive(Clone, Debug)]
pub enum ContentEvent {
    /// Content was ingested: a new item, or another copy of a known one.
    Inserted(Arc<ContentItem>),
    /// Metadata of a known item changed (likes, read flag).
    Updated(Arc<ContentItem>),
    Deleted(ContentId),
    /// A copy of an item this store already held arrived again. Published
    /// after the matching `Inserted`; first copies never produce it.
    Duplicate(ContentId),
}

impl ContentEvent {
    pub fn content_id(&self) -> ContentId {
        match self {
            Self::Inserted(item) | Self::Updated(item) => item.id(),
            Self::Deleted(id) | Self::Duplicate(id) => *id,
        }
    }
}

/// Cheap-to-clone publisher side of the stream.
#[derive(Clone, Debug)]
pub struct EventStream {
    tx: broadcast::Sender<ContentEvent>,
}

impl EventStream {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    /// Deliver to every live subscriber. Having none is not an error.
    pub fn publish(&self, event: ContentEvent) {
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self) -> Subscription {
        Subscription { rx: self.tx.subscribe() }
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Default for EventStream {
    fn default() -> Self {
        Self::new(DEFAULT_EVENT_CAPACITY)
    }
}

/// Outcome of waiting on a subscription.
#[derive(Debug)]
pub enum Received {
    Event(ContentEvent),
    /// The subscriber fell behind and `n` events were dropped; its view of
    /// the catalog must be rebuilt from a snapshot.
    Lagged(u64),
    Closed,
}

#[derive(Debug)]
pub struct Subscription {
    rx: broadcast::Receiver<ContentEvent>,
}

impl Subscription {
    pub async fn recv(&mut self) -> Received {
        match self.rx.recv().await {
            Ok(event) => Received::Event(event),
            Err(broadcast::error::RecvError::Lagged(n)) => Received::Lagged(n),
            Err(broadcast::error::RecvError::Closed) => Received::Closed,
        }
    }
}
