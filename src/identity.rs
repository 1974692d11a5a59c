//! # Content and Peer Identifiers
//!
//! This module defines the fixed-length identifiers used throughout Courier:
//!
//! - [`ContentId`]: 16-byte content-addressed id of a disseminated item
//! - [`UserId`] / [`GroupId`]: 8-byte ids for authors and channels
//! - [`ForwarderKey`]: 16-byte id of a (link address, protocol) pair
//!
//! ## Derivation
//!
//! Every identifier is a truncated BLAKE3 digest over its inputs:
//!
//! | Id | Inputs | Length |
//! |----|--------|--------|
//! | `ContentId` | author ‖ body ‖ be64(created_at_ms) | 16 |
//! | `UserId` | name ‖ be64(t) | 8 |
//! | `GroupId` | name [‖ be64(nonce)] | 8 |
//! | `ForwarderKey` | len ‖ address ‖ len ‖ protocol | 16 |
//!
//! Two items with the same author, body and creation time collide on
//! purpose: the collision is how duplicates arriving over different links
//! are recognised.
//!
//! ## Invariants
//!
//! - Derivation is deterministic across processes and platforms
//! - `from_bytes(b).as_bytes() == b`
//! - Ids are opaque byte strings, safe to embed in any wire format

use serde::{Deserialize, Serialize};

/// Length of a content id in bytes.
pub const CONTENT_ID_LEN: usize = 16;

/// Length of a user id in bytes.
pub const USER_ID_LEN: usize = 8;

/// Length of a group id in bytes.
pub const GROUP_ID_LEN: usize = 8;

/// Length of a forwarder key in bytes.
pub const FORWARDER_KEY_LEN: usize = 16;

/// Name of the group every node implicitly belongs to.
pub const PUBLIC_GROUP_NAME: &str = "public";

const CONTENT_DOMAIN: &[u8] = b"courier-content-v1:";
const USER_DOMAIN: &[u8] = b"courier-user-v1:";
const GROUP_DOMAIN: &[u8] = b"courier-group-v1:";
const FORWARDER_DOMAIN: &[u8] = b"courier-forwarder-v1:";

/// Hash `parts` under `domain` and keep the first `N` bytes.
fn truncated_digest<const N: usize>(domain: &[u8], parts: &[&[u8]]) -> [u8; N] {
    let mut hasher = blake3::Hasher::new();
    hasher.update(domain);
    for part in parts {
        hasher.update(part);
    }
    let digest = hasher.finalize();
    let mut out = [0u8; N];
    out.copy_from_slice(&digest.as_bytes()[..N]);
    out
}

macro_rules! fixed_id {
    ($(#[$meta:meta])* $name:ident, $len:expr) => {
        $(#[$meta])*
        #[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        pub struct $name([u8; $len]);

        impl $name {
            #[inline]
            pub fn from_bytes(bytes: [u8; $len]) -> Self {
                Self(bytes)
            }

            #[inline]
            pub fn as_bytes(&self) -> &[u8; $len] {
                &self.0
            }

            pub fn to_hex(self) -> String {
                hex::encode(self.0)
            }

            pub fn from_hex(s: &str) -> Result<Self, hex::FromHexError> {
                let bytes = hex::decode(s)?;
                if bytes.len() != $len {
                    return Err(hex::FromHexError::InvalidStringLength);
                }
                let mut arr = [0u8; $len];
                arr.copy_from_slice(&bytes);
                Ok(Self(arr))
            }
        }

        impl std::fmt::Debug for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, "{}({})", stringify!($name), &self.to_hex()[..8])
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, "{}", self.to_hex())
            }
        }

        impl From<[u8; $len]> for $name {
            fn from(bytes: [u8; $len]) -> Self {
                Self(bytes)
            }
        }

        impl From<$name> for [u8; $len] {
            fn from(id: $name) -> Self {
                id.0
            }
        }

        impl AsRef<[u8]> for $name {
            fn as_ref(&self) -> &[u8] {
                &self.0
            }
        }
    };
}

// ============================================================================
// User and Group Identifiers
// ============================================================================

fixed_id!(
    /// 8-byte author identifier.
    UserId,
    USER_ID_LEN
);

fixed_id!(
    /// 8-byte group (channel) identifier.
    GroupId,
    GROUP_ID_LEN
);

impl UserId {
    /// Derive a user id from a display name and the account creation time.
    pub fn derive(name: &str, created_at_ms: u64) -> Self {
        Self(truncated_digest(
            USER_DOMAIN,
            &[name.as_bytes(), &created_at_ms.to_be_bytes()],
        ))
    }
}

impl GroupId {
    /// Derive a group id.
    ///
    /// Public groups are keyed by name alone so every node agrees on them.
    /// Private groups mix in a nonce (typically the creation time) so two
    /// private groups with the same name stay distinct.
    pub fn derive(name: &str, private_nonce: Option<u64>) -> Self {
        let bytes = match private_nonce {
            Some(nonce) => truncated_digest(GROUP_DOMAIN, &[name.as_bytes(), &nonce.to_be_bytes()]),
            None => truncated_digest(GROUP_DOMAIN, &[name.as_bytes()]),
        };
        Self(bytes)
    }

    /// The default public group.
    pub fn public() -> Self {
        Self::derive(PUBLIC_GROUP_NAME, None)
    }
}

// ============================================================================
// Content Identifier
// ============================================================================

fixed_id!(
    /// 16-byte content-addressed identifier of a disseminated item.
    ContentId,
    CONTENT_ID_LEN
);

impl ContentId {
    /// `BLAKE3(author ‖ body ‖ be64(created_at_ms))`, truncated to 16 bytes.
    pub fn derive(author: &UserId, body: &str, created_at_ms: u64) -> Self {
        Self(truncated_digest(
            CONTENT_DOMAIN,
            &[author.as_bytes(), body.as_bytes(), &created_at_ms.to_be_bytes()],
        ))
    }
}

// ============================================================================
// Forwarder Key
// ============================================================================

fixed_id!(
    /// Key of a peer as seen through one protocol instance.
    ///
    /// The same physical peer reached over Bluetooth and over Wi-Fi Direct
    /// has two forwarder keys, so delivery is tracked per link protocol.
    ForwarderKey,
    FORWARDER_KEY_LEN
);

impl ForwarderKey {
    /// Derive the key for a (link address, protocol) pair.
    ///
    /// Inputs are length-prefixed: `("ab", "c")` and `("a", "bc")` differ.
    pub fn derive(link_address: &str, protocol_id: &str) -> Self {
        let addr_len = (link_address.len() as u64).to_be_bytes();
        let proto_len = (protocol_id.len() as u64).to_be_bytes();
        Self(truncated_digest(
            FORWARDER_DOMAIN,
            &[
                &addr_len,
                link_address.as_bytes(),
                &proto_len,
                protocol_id.as_bytes(),
            ],
        ))
    }
}
