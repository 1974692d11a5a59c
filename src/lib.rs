//! # Courier - Opportunistic Content Forwarding
//!
//! Courier decides what a device pushes to a peer during a short,
//! unreliable encounter in a delay-tolerant mesh:
//!
//! - **Identity**: truncated content-addressed ids for items, users, groups
//! - **Density**: sliding-window replication density per content id
//! - **Scoring**: relevance, replication density, popularity and age folded into one score
//! - **Dispatch**: one worker per peer, drawing items by stochastic-acceptance roulette
//! - **Registry**: at most one live dispatcher per connected peer
//!
//! ## Architecture
//!
//! Long-lived components follow the handle pattern:
//! - The density watcher is an actor behind a cheap-to-clone handle
//! - Dispatchers share a small mutex-guarded working set with their worker task
//! - Catalog changes reach every dispatcher through a typed broadcast stream
//!
//! ## Data Flow
//!
//! ```text
//! store ──Inserted──▶ registry ──observe──▶ density watcher
//!   │                                           │
//!   └──Inserted/Updated/Deleted──▶ dispatcher ◀─┘ (score)
//!                                     │
//!                               select_next ──▶ link.send ──▶ mark_sent
//! ```
//!
//! ## Module Overview
//!
//! | Module | Purpose |
//! |--------|--------|
//! | `node` | High-level API combining store, registry and inbox |
//! | `identity` | Content, user, group and forwarder identifiers |
//! | `content` | The content item and its metadata |
//! | `messages` | Bounded bincode codec for pushed items |
//! | `events` | Typed catalog event stream |
//! | `protocols` | Collaborator traits (`ContentStore`, `PeerLink`) |
//! | `store` | In-memory `ContentStore` |
//! | `density` | Replication density watcher |
//! | `score` | Forwarding score |
//! | `dispatcher` | Per-peer working set and selection |
//! | `registry` | Dispatcher lifecycle per peer |
//! | `link` | In-memory `PeerLink` |

mod content;
mod density;
mod dispatcher;
mod events;
mod identity;
mod link;
mod messages;
mod node;
mod protocols;
mod registry;
mod score;
mod store;

pub use content::{extract_hashtags, now_ms, Attachment, ContentItem, MAX_TAGS_PER_ITEM};
pub use density::{
    DensityConfig, DensitySource, DensityWatcher, DEFAULT_DENSITY_WINDOW, DEFAULT_PRUNE_INTERVAL,
    MIN_PRUNE_INTERVAL,
};
pub use dispatcher::{
    Admission, DispatchConfig, DispatchStats, DispatcherState, DispatcherTelemetry, PeerDispatcher,
    DEFAULT_MAX_REJECTIONS, DEFAULT_RETRY_BACKOFF, DEFAULT_THRESHOLD,
};
pub use events::{ContentEvent, EventStream, Received, Subscription, DEFAULT_EVENT_CAPACITY};
pub use identity::{ContentId, ForwarderKey, GroupId, UserId, PUBLIC_GROUP_NAME};
pub use link::{deliver, inbox, link_peer_key, ChannelLink, Frame, Inbox, DEFAULT_INBOX_CAPACITY};
pub use messages::{decode_push, encode_push, CodecError, PushMessage, MAX_ITEM_SIZE};
pub use node::{Node, NodeTelemetry, SIM_PROTOCOL};
pub use protocols::{ContentFilter, ContentStore, PeerLink, QueryResult, ResultShape};
pub use registry::{DispatchError, DispatchRegistry, RegistryConfig, RegistryTelemetry};
pub use score::{
    age_decay, quality, AlwaysNear, NoInterest, ProximityGate, RelevanceModel, ScoreBreakdown,
    ScoreWeights, Scorer, Unobserved,
};
pub use store::{IngestOutcome, MemoryStore};
