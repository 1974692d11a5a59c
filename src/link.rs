//! In-memory transport.
//!
//! [`ChannelLink`] is a [`PeerLink`] that serializes each pushed item with
//! the bounded codec and drops the bytes into the remote node's [`Inbox`].
//! The receiving side decodes, stamps the local copy and ingests it into
//! its store. Used by the mesh simulator and integration tests.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use anyhow::{Context, Result, bail};
use async_trait::async_trait;
use tokio::sync::mpsc;
use tracing::{debug, trace};

use crate::content::{now_ms, ContentItem};
use crate::identity::ForwarderKey;
use crate::messages::{decode_push, encode_push, PushMessage};
use crate::protocols::PeerLink;
use crate::store::{IngestOutcome, MemoryStore};

/// Default number of frames buffered per inbox.
pub const DEFAULT_INBOX_CAPACITY: usize = 256;

/// One encoded push in flight.
#[derive(Clone, Debug)]
pub struct Frame {
    /// Address of the sending node.
    pub from: String,
    pub protocol: String,
    pub bytes: Vec<u8>,
}

/// Registry key of a link: `remote_address/protocol`. The same peer
/// reached over two protocols is bound twice.
pub fn link_peer_key(remote_address: &str, protocol: &str) -> String {
    format!("{}/{}", remote_address, protocol)
}

/// Create a node's inbox and the sender that links towards it clone.
pub fn inbox(capacity: usize) -> (mpsc::Sender<Frame>, Inbox) {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    (tx, Inbox { rx })
}

#[derive(Debug)]
pub struct ChannelLink {
    peer_key: String,
    local_address: String,
    remote_address: String,
    protocol: String,
    tx: mpsc::Sender<Frame>,
    severed: AtomicBool,
}

impl ChannelLink {
    /// A link from `local_address` to the node whose inbox `tx` feeds.
    pub fn new(
        local_address: impl Into<String>,
        remote_address: impl Into<String>,
        protocol: impl Into<String>,
        tx: mpsc::Sender<Frame>,
    ) -> Arc<Self> {
        let remote_address = remote_address.into();
        let protocol = protocol.into();
        Arc::new(Self {
            peer_key: link_peer_key(&remote_address, &protocol),
            local_address: local_address.into(),
            remote_address,
            protocol,
            tx,
            severed: AtomicBool::new(false),
        })
    }

    /// Simulate the peer walking out of range. Every later send fails.
    pub fn sever(&self) {
        if !self.severed.swap(true, Ordering::AcqRel) {
            debug!(from = %self.local_address, to = %self.remote_address, "link severed");
        }
    }

    pub fn is_severed(&self) -> bool {
        self.severed.load(Ordering::Acquire)
    }
}

#[async_trait]
impl PeerLink for ChannelLink {
    fn peer_key(&self) -> &str {
        &self.peer_key
    }

    fn remote_address(&self) -> &str {
        &self.remote_address
    }

    fn protocol_id(&self) -> &str {
        &self.protocol
    }

    fn is_connected(&self) -> bool {
        !self.is_severed() && !self.tx.is_closed()
    }

    async fn send(&self, item: &ContentItem) -> Result<()> {
        if self.is_severed() {
            bail!("link to {} is severed", self.remote_address);
        }
        let bytes = encode_push(&PushMessage::Content(item.clone()))
            .with_context(|| format!("encoding {}", item.id()))?;
        let frame = Frame {
            from: self.local_address.clone(),
            protocol: self.protocol.clone(),
            bytes,
        };
        self.tx
            .send(frame)
            .await
            .map_err(|_| anyhow::anyhow!("inbox of {} is closed", self.remote_address))?;
        trace!(to = %self.remote_address, content = %item.id(), "frame delivered");
        Ok(())
    }
}

/// Receiving end of a node's links.
#[derive(Debug)]
pub struct Inbox {
    rx: mpsc::Receiver<Frame>,
}

impl Inbox {
    pub async fn recv(&mut self) -> Option<Frame> {
        self.rx.recv().await
    }

    /// Ingest every arriving frame into `store` until all senders are gone.
    pub async fn run(mut self, store: Arc<MemoryStore>) {
        while let Some(frame) = self.rx.recv().await {
            let from = frame.from.clone();
            if let Err(e) = deliver(&store, frame).await {
                debug!(from = %from, error = %e, "dropping undecodable frame");
            }
        }
    }
}

/// Decode one frame and ingest the local copy.
///
/// The sender is recorded as a forwarder of the copy, so the receiver never
/// pushes the item straight back over the same link.
pub async fn deliver(store: &MemoryStore, frame: Frame) -> Result<IngestOutcome> {
    let PushMessage::Content(item) = decode_push(&frame.bytes).context("decoding frame")?;
    let mut copy = item.received_from_peer(now_ms());
    copy.add_forwarder(ForwarderKey::derive(&frame.from, &frame.protocol));
    Ok(store.ingest(copy).await)
}
