//! # Disseminated Content
//!
//! A [`ContentItem`] is one unit of content travelling through the mesh: a
//! short status post with optional attachment, plus the metadata the
//! forwarding score depends on (age, TTL, likes, duplicate observations)
//! and the set of peers it has already been handed to.
//!
//! ## Lifecycle
//!
//! 1. **Created** locally via [`ContentItem::new`], or
//! 2. **Received** from a peer and localised via [`ContentItem::received_from_peer`]
//! 3. **Mutated** by the store (likes, read flag, duplicates) and by
//!    dispatchers (forwarder additions after a confirmed send)
//! 4. **Deleted** by the store, which propagates an eviction to dispatchers
//!
//! The forwarder set only grows. There is deliberately no way to remove a
//! forwarder: an item is never re-sent to a peer already in the set.

use std::collections::HashSet;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

use crate::identity::{ContentId, ForwarderKey, GroupId, UserId};

/// Maximum number of hashtags extracted from a single body.
pub const MAX_TAGS_PER_ITEM: usize = 32;

/// Returns current time as milliseconds since Unix epoch.
#[inline]
pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// File attached to an item. Only the reference travels with the item.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Attachment {
    pub name: String,
    pub size: u64,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ContentItem {
    id: ContentId,
    pub author: UserId,
    pub group: GroupId,
    pub body: String,
    pub tags: HashSet<String>,
    pub attachment: Option<Attachment>,
    pub created_at_ms: u64,
    /// Local arrival time; equals creation time for locally authored items.
    pub arrived_at_ms: u64,
    pub hop_count: u32,
    /// Relevance lifetime. Zero or negative means no expiry was configured.
    pub ttl_ms: i64,
    pub likes: u32,
    /// How many times this item has been observed arriving.
    pub duplicates: u32,
    pub read: bool,
    forwarders: HashSet<ForwarderKey>,
}

impl ContentItem {
    /// Author a new item in `group`. The id is derived from author, body and
    /// creation time and never changes afterwards.
    pub fn new(author: UserId, group: GroupId, body: impl Into<String>, created_at_ms: u64) -> Self {
        let body = body.into();
        let id = ContentId::derive(&author, &body, created_at_ms);
        let tags = extract_hashtags(&body);
        Self {
            id,
            author,
            group,
            body,
            tags,
            attachment: None,
            created_at_ms,
            arrived_at_ms: created_at_ms,
            hop_count: 0,
            ttl_ms: 0,
            likes: 0,
            duplicates: 0,
            read: true,
            forwarders: HashSet::new(),
        }
    }

    /// Builder-style TTL setter.
    pub fn with_ttl_ms(mut self, ttl_ms: i64) -> Self {
        self.ttl_ms = ttl_ms;
        self
    }

    /// Builder-style attachment setter.
    pub fn with_attachment(mut self, name: impl Into<String>, size: u64) -> Self {
        self.attachment = Some(Attachment { name: name.into(), size });
        self
    }

    /// The local copy of an item that just arrived over a link.
    ///
    /// Hop count goes up by one, arrival time is stamped, and the copy is
    /// unread. Popularity and forwarder history travel with the item.
    pub fn received_from_peer(&self, arrived_at_ms: u64) -> Self {
        let mut copy = self.clone();
        copy.hop_count = self.hop_count.saturating_add(1);
        copy.arrived_at_ms = arrived_at_ms;
        copy.read = false;
        copy
    }

    #[inline]
    pub fn id(&self) -> ContentId {
        self.id
    }

    pub fn add_tag(&mut self, tag: impl Into<String>) {
        if self.tags.len() < MAX_TAGS_PER_ITEM {
            self.tags.insert(tag.into());
        }
    }

    pub fn has_attachment(&self) -> bool {
        self.attachment.is_some()
    }

    /// Age of the item at `now_ms`. Clock skew yields zero, not an underflow.
    pub fn age_ms_at(&self, now_ms: u64) -> u64 {
        now_ms.saturating_sub(self.created_at_ms)
    }

    /// True once the TTL has fully elapsed. Items without TTL never expire.
    pub fn is_expired_at(&self, now_ms: u64) -> bool {
        self.ttl_ms > 0 && self.age_ms_at(now_ms) >= self.ttl_ms as u64
    }

    pub fn forwarders(&self) -> &HashSet<ForwarderKey> {
        &self.forwarders
    }

    /// Record that this item was delivered to `key`. Returns true if new.
    pub fn add_forwarder(&mut self, key: ForwarderKey) -> bool {
        self.forwarders.insert(key)
    }

    /// Union another copy's forwarder history into ours.
    pub fn merge_forwarders(&mut self, other: &ContentItem) {
        self.forwarders.extend(other.forwarders.iter().copied());
    }

    pub fn is_forwarded_to(&self, key: &ForwarderKey) -> bool {
        self.forwarders.contains(key)
    }

    /// Convenience for callers that hold a raw link address and protocol.
    pub fn is_forwarder(&self, link_address: &str, protocol_id: &str) -> bool {
        self.is_forwarded_to(&ForwarderKey::derive(link_address, protocol_id))
    }
}

/// Extract `#tag` tokens from a post body.
///
/// A tag is `#` followed by one or more alphanumeric or `_` characters; a
/// lone `#` is ignored. Case is preserved.
pub fn extract_hashtags(body: &str) -> HashSet<String> {
    let mut tags = HashSet::new();
    let mut chars = body.char_indices().peekable();

    while let Some((start, c)) = chars.next() {
        if c != '#' {
            continue;
        }
        let mut end = start + c.len_utf8();
        while let Some(&(idx, next)) = chars.peek() {
            if next.is_alphanumeric() || next == '_' {
                end = idx + next.len_utf8();
                chars.next();
            } else {
                break;
            }
        }
        if end > start + 1 {
            tags.insert(body[start..end].to_string());
            if tags.len() >= MAX_TAGS_PER_ITEM {
                break;
            }
        }
    }

    tags
}
