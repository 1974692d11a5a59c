//! # Link Payload Codec
//!
//! Items handed to a [`PeerLink`](crate::protocols::PeerLink) that crosses a
//! byte boundary are serialized with bincode. Decoding always goes through
//! size-limited options so a hostile or corrupt payload cannot force a large
//! allocation.
//!
//! Framing, retransmission and link security belong to the transport and
//! are not handled here.

use bincode::Options;
use serde::{Deserialize, Serialize};

use crate::content::ContentItem;

/// Maximum encoded size of a single pushed item (256 KiB).
pub const MAX_ITEM_SIZE: usize = 256 * 1024;

/// Deserialization limit, slightly above `MAX_ITEM_SIZE` for envelope overhead.
pub const MAX_DESERIALIZE_SIZE: u64 = (MAX_ITEM_SIZE as u64) + 1024;

/// Returns bincode options with size limits enforced.
/// SECURITY: Always use this for deserialization to prevent OOM attacks.
fn bincode_options() -> impl Options {
    bincode::DefaultOptions::new()
        .with_limit(MAX_DESERIALIZE_SIZE)
        .with_fixint_encoding()
}

/// Envelope for an item pushed to a peer.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum PushMessage {
    /// A content item selected by the sender's dispatcher for this link.
    Content(ContentItem),
}

#[derive(Debug)]
pub enum CodecError {
    /// Encoded payload exceeds `MAX_ITEM_SIZE`.
    TooLarge(usize),
    Bincode(bincode::Error),
}

impl std::fmt::Display for CodecError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::TooLarge(size) => write!(f, "encoded item is {} bytes, limit is {}", size, MAX_ITEM_SIZE),
            Self::Bincode(e) => write!(f, "bincode: {}", e),
        }
    }
}

impl std::error::Error for CodecError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::TooLarge(_) => None,
            Self::Bincode(e) => Some(e),
        }
    }
}

impl From<bincode::Error> for CodecError {
    fn from(e: bincode::Error) -> Self {
        Self::Bincode(e)
    }
}

pub fn encode_push(message: &PushMessage) -> Result<Vec<u8>, CodecError> {
    let bytes = bincode_options().serialize(message)?;
    if bytes.len() > MAX_ITEM_SIZE {
        return Err(CodecError::TooLarge(bytes.len()));
    }
    Ok(bytes)
}

pub fn decode_push(bytes: &[u8]) -> Result<PushMessage, CodecError> {
    if bytes.len() > MAX_ITEM_SIZE {
        return Err(CodecError::TooLarge(bytes.len()));
    }
    Ok(bincode_options().deserialize(bytes)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::{ForwarderKey, GroupId, UserId};

    #[test]
    fn pushed_item_keeps_metadata() {
        let mut item = ContentItem::new(UserId::derive("dan", 1), GroupId::public(), "water at #camp", 10)
            .with_ttl_ms(60_000)
            .with_attachment("camp.jpg", 100);
        item.likes = 4;
        item.add_forwarder(ForwarderKey::derive("a", "b"));

        let bytes = encode_push(&PushMessage::Content(item.clone())).expect("encode");
        let PushMessage::Content(decoded) = decode_push(&bytes).expect("decode");

        assert_eq!(decoded.id(), item.id());
        assert_eq!(decoded.likes, 4);
        assert_eq!(decoded.ttl_ms, 60_000);
        assert!(decoded.tags.contains("#camp"));
        assert_eq!(decoded.forwarders(), item.forwarders());
    }

    #[test]
    fn oversized_item_is_rejected() {
        let body = "x".repeat(MAX_ITEM_SIZE + 1);
        let item = ContentItem::new(UserId::derive("eve", 1), GroupId::public(), body, 0);
        assert!(matches!(
            encode_push(&PushMessage::Content(item)),
            Err(CodecError::TooLarge(_))
        ));
    }

    #[test]
    fn garbage_is_rejected() {
        assert!(decode_push(&[0xFF; 7]).is_err());
        assert!(matches!(
            decode_push(&vec![0u8; MAX_ITEM_SIZE + 1]),
            Err(CodecError::TooLarge(_))
        ));
    }
}
