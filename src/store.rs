//! In-process content catalog.
//!
//! [`MemoryStore`] implements [`ContentStore`] over a map and publishes each
//! mutation on an [`EventStream`]. It backs the simulator and the tests; a
//! real deployment plugs its own persistence behind the same trait.

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use tokio::sync::RwLock;
use tracing::trace;

use crate::content::ContentItem;
use crate::events::{ContentEvent, EventStream};
use crate::identity::{ContentId, ForwarderKey};
use crate::protocols::{ContentFilter, ContentStore, QueryResult, ResultShape};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum IngestOutcome {
    /// First copy of this item.
    New,
    /// Another copy of a known item; its duplicate counter went up.
    Duplicate,
}

#[derive(Debug)]
pub struct MemoryStore {
    items: RwLock<HashMap<ContentId, ContentItem>>,
    events: EventStream,
}

impl MemoryStore {
    pub fn new(events: EventStream) -> Arc<Self> {
        Arc::new(Self {
            items: RwLock::new(HashMap::new()),
            events,
        })
    }

    pub fn events(&self) -> &EventStream {
        &self.events
    }

    /// Store an item, deduplicating by content id.
    ///
    /// A repeat copy bumps the duplicate counter and unions the forwarder
    /// history carried by the copy. Both cases publish `Inserted`; a repeat
    /// copy also publishes `Duplicate`. The decision rests on what this
    /// store held, never on counters carried inside the copy.
    pub async fn ingest(&self, item: ContentItem) -> IngestOutcome {
        let id = item.id();
        let (outcome, snapshot) = {
            let mut items = self.items.write().await;
            match items.get_mut(&id) {
                Some(existing) => {
                    existing.duplicates = existing.duplicates.saturating_add(1);
                    existing.merge_forwarders(&item);
                    (IngestOutcome::Duplicate, existing.clone())
                }
                None => {
                    items.insert(id, item.clone());
                    (IngestOutcome::New, item)
                }
            }
        };
        trace!(content = %id, ?outcome, "ingested");
        self.events.publish(ContentEvent::Inserted(Arc::new(snapshot)));
        if outcome == IngestOutcome::Duplicate {
            self.events.publish(ContentEvent::Duplicate(id));
        }
        outcome
    }

    /// Increment the like counter. Returns false if the item is unknown.
    pub async fn like(&self, id: &ContentId) -> bool {
        self.update(id, |item| item.likes = item.likes.saturating_add(1)).await
    }

    pub async fn mark_read(&self, id: &ContentId) -> bool {
        self.update(id, |item| item.read = true).await
    }

    pub async fn delete(&self, id: &ContentId) -> bool {
        let removed = self.items.write().await.remove(id).is_some();
        if removed {
            self.events.publish(ContentEvent::Deleted(*id));
        }
        removed
    }

    pub async fn len(&self) -> usize {
        self.items.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.items.read().await.is_empty()
    }

    async fn update(&self, id: &ContentId, f: impl FnOnce(&mut ContentItem)) -> bool {
        let snapshot = {
            let mut items = self.items.write().await;
            let Some(item) = items.get_mut(id) else {
                return false;
            };
            f(item);
            item.clone()
        };
        self.events.publish(ContentEvent::Updated(Arc::new(snapshot)));
        true
    }
}

#[async_trait]
impl ContentStore for MemoryStore {
    async fn query(&self, filter: &ContentFilter) -> Result<QueryResult> {
        let items = self.items.read().await;
        let matching = items.values().filter(|item| filter.matches(item));
        Ok(match filter.shape {
            ResultShape::Count => QueryResult::Count(matching.count()),
            ResultShape::Ids => QueryResult::Ids(matching.map(|item| item.id()).collect()),
            ResultShape::Items => QueryResult::Items(matching.cloned().collect()),
        })
    }

    async fn get(&self, id: &ContentId) -> Result<Option<ContentItem>> {
        Ok(self.items.read().await.get(id).cloned())
    }

    async fn mark_forwarded(&self, id: &ContentId, peer: &ForwarderKey) -> Result<()> {
        if let Some(item) = self.items.write().await.get_mut(id) {
            item.add_forwarder(*peer);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::Received;
    use crate::identity::{GroupId, UserId};

    fn item(body: &str) -> ContentItem {
        ContentItem::new(UserId::derive("frank", 0), GroupId::public(), body, 100)
    }

    #[tokio::test]
    async fn ingest_deduplicates_and_counts() {
        let store = MemoryStore::new(EventStream::default());
        assert_eq!(store.ingest(item("a")).await, IngestOutcome::New);
        assert_eq!(store.ingest(item("a")).await, IngestOutcome::Duplicate);
        assert_eq!(store.len().await, 1);

        let got = store.get(&item("a").id()).await.unwrap().expect("present");
        assert_eq!(got.duplicates, 1);
    }

    #[tokio::test]
    async fn only_repeat_copies_publish_duplicate() {
        let store = MemoryStore::new(EventStream::default());
        let mut sub = store.events().subscribe();

        // Popular upstream, but the first copy this store has seen.
        let mut upstream = item("a");
        upstream.duplicates = 3;
        let arrived = upstream.received_from_peer(200);
        assert_eq!(store.ingest(arrived.clone()).await, IngestOutcome::New);
        assert!(matches!(sub.recv().await, Received::Event(ContentEvent::Inserted(_))));

        assert_eq!(store.ingest(arrived).await, IngestOutcome::Duplicate);
        assert!(matches!(sub.recv().await, Received::Event(ContentEvent::Inserted(_))));
        assert!(matches!(
            sub.recv().await,
            Received::Event(ContentEvent::Duplicate(d)) if d == item("a").id()
        ));
    }

    #[tokio::test]
    async fn duplicate_merges_forwarders() {
        let store = MemoryStore::new(EventStream::default());
        store.ingest(item("a")).await;

        let mut copy = item("a");
        copy.add_forwarder(ForwarderKey::derive("x", "bt"));
        store.ingest(copy).await;

        let got = store.get(&item("a").id()).await.unwrap().expect("present");
        assert!(got.is_forwarder("x", "bt"));
    }

    #[tokio::test]
    async fn mutations_publish_events() {
        let store = MemoryStore::new(EventStream::default());
        let mut sub = store.events().subscribe();
        let id = item("a").id();

        store.ingest(item("a")).await;
        assert!(store.like(&id).await);
        assert!(store.delete(&id).await);
        assert!(!store.delete(&id).await);

        assert!(matches!(sub.recv().await, Received::Event(ContentEvent::Inserted(_))));
        match sub.recv().await {
            Received::Event(ContentEvent::Updated(snapshot)) => assert_eq!(snapshot.likes, 1),
            other => panic!("unexpected {:?}", other),
        }
        assert!(matches!(sub.recv().await, Received::Event(ContentEvent::Deleted(d)) if d == id));
    }

    #[tokio::test]
    async fn query_shapes_and_never_sent_filter() {
        let store = MemoryStore::new(EventStream::default());
        let peer = ForwarderKey::derive("p", "bt");
        store.ingest(item("a")).await;
        store.ingest(item("b")).await;
        store.mark_forwarded(&item("a").id(), &peer).await.unwrap();

        let mut filter = ContentFilter::eligible_for(Some(GroupId::public()), peer);
        match store.query(&filter).await.unwrap() {
            QueryResult::Ids(ids) => assert_eq!(ids, vec![item("b").id()]),
            other => panic!("unexpected {:?}", other),
        }

        filter.shape = ResultShape::Count;
        assert!(matches!(store.query(&filter).await.unwrap(), QueryResult::Count(1)));

        filter.never_sent_to = None;
        filter.shape = ResultShape::Items;
        assert_eq!(store.query(&filter).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn updates_on_unknown_items_are_ignored() {
        let store = MemoryStore::new(EventStream::default());
        let id = item("ghost").id();
        assert!(!store.like(&id).await);
        assert!(!store.mark_read(&id).await);
        store.mark_forwarded(&id, &ForwarderKey::derive("p", "bt")).await.unwrap();
        assert!(store.is_empty().await);
    }
}
