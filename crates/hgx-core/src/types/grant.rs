//! Share grants and static records

use serde::{Deserialize, Serialize};

use super::frame::{Frame, WrappedSecret};
use crate::identifiers::{Address, ApiId};

/// Sealed immutable object as stored by the persistence collaborator
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StaticRecord {
    /// Content address of the record
    pub address: Address,
    /// Identity that sealed the record
    pub author: Address,
    /// Schema of the payload
    pub api_id: Option<ApiId>,
    /// AEAD nonce
    pub nonce: [u8; 12],
    /// Sealed payload
    pub ciphertext: Vec<u8>,
    /// Author signature over [`StaticRecord::signing_bytes`]
    pub signature: Vec<u8>,
}

impl StaticRecord {
    /// Address for a sealed payload by `author`
    pub fn compute_address(author: &Address, nonce: &[u8; 12], ciphertext: &[u8]) -> Address {
        Address::from_parts(b"HGX_STATIC_v1", &[author.as_bytes(), nonce, ciphertext])
    }

    /// Canonical bytes covered by the author signature
    pub fn signing_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(64 + self.ciphertext.len());
        out.extend_from_slice(self.address.as_bytes());
        out.extend_from_slice(self.author.as_bytes());
        match &self.api_id {
            Some(api_id) => {
                out.push(1);
                out.extend_from_slice(api_id.as_bytes());
            }
            None => out.push(0),
        }
        out.extend_from_slice(&self.nonce);
        out.extend_from_slice(&self.ciphertext);
        out
    }
}

/// What a grant hands over
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum GrantBody {
    /// Head frame plus the ratchet position needed to follow the chain
    Dynamic {
        /// Current head frame
        head: Frame,
        /// Wrapped ratchet snapshot
        secret: WrappedSecret,
    },
    /// Sealed payload plus its wrapped content key
    Static {
        /// The sealed record
        record: StaticRecord,
        /// Wrapped content key
        key: WrappedSecret,
    },
}

/// Per-recipient package delivered by a share
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShareGrant {
    /// Object being shared
    pub object: Address,
    /// Author of the object
    pub author: Address,
    /// Identity performing the share
    pub sender: Address,
    /// Identity receiving the share
    pub recipient: Address,
    /// Schema of the object
    pub api_id: Option<ApiId>,
    /// Key material and content
    pub body: GrantBody,
}

impl ShareGrant {
    /// Whether the grant shares a dynamic object
    pub fn is_dynamic(&self) -> bool {
        matches!(self.body, GrantBody::Dynamic { .. })
    }
}
