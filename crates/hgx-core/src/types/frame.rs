//! Frames: sealed, signed versions of a dynamic object

use serde::{Deserialize, Serialize};

use crate::identifiers::Address;
use crate::Result;

/// One root secret wrapped for one recipient
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WrappedSecret {
    /// Identity able to unwrap the secret
    pub recipient: Address,
    /// AEAD nonce
    pub nonce: [u8; 12],
    /// Sealed secret
    pub ciphertext: Vec<u8>,
}

/// Fresh root key material for a new epoch, wrapped for every recipient
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Keyshare {
    /// Epoch the shared root opens
    pub epoch: u64,
    /// One entry per recipient, including the author's own devices
    pub wrapped: Vec<WrappedSecret>,
}

impl Keyshare {
    /// Entry addressed to `recipient`, if any
    pub fn for_recipient(&self, recipient: &Address) -> Option<&WrappedSecret> {
        self.wrapped.iter().find(|w| &w.recipient == recipient)
    }

    /// Identities the keyshare was issued to
    pub fn recipients(&self) -> impl Iterator<Item = &Address> {
        self.wrapped.iter().map(|w| &w.recipient)
    }

    fn canonical_bytes(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.epoch.to_le_bytes());
        out.extend_from_slice(&(self.wrapped.len() as u64).to_le_bytes());
        for entry in &self.wrapped {
            out.extend_from_slice(entry.recipient.as_bytes());
            out.extend_from_slice(&entry.nonce);
            out.extend_from_slice(&(entry.ciphertext.len() as u64).to_le_bytes());
            out.extend_from_slice(&entry.ciphertext);
        }
    }
}

/// One version of a dynamic object
///
/// `previous` is the address of the frame at `index - 1`; the genesis frame
/// links to the object address itself. Frames are immutable once signed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Frame {
    /// Dynamic object this frame belongs to
    pub object: Address,
    /// Position in the chain, starting at zero
    pub index: u64,
    /// Link to the preceding frame
    pub previous: Address,
    /// Keyshare epoch the frame key descends from
    pub epoch: u64,
    /// Fresh key material, present on genesis and re-key frames
    pub keyshare: Option<Keyshare>,
    /// AES-GCM ciphertext of the object state
    pub ciphertext: Vec<u8>,
    /// HMAC over header and ciphertext under the frame key
    pub tag: [u8; 32],
    /// Identity that sealed the frame
    pub author: Address,
    /// Author signature over [`Frame::signing_bytes`]
    pub signature: Vec<u8>,
}

impl Frame {
    /// Header bytes, bound into the AEAD as associated data
    pub fn header_bytes(object: &Address, index: u64, previous: &Address, epoch: u64) -> Vec<u8> {
        let mut out = Vec::with_capacity(32 + 8 + 32 + 8);
        out.extend_from_slice(object.as_bytes());
        out.extend_from_slice(&index.to_le_bytes());
        out.extend_from_slice(previous.as_bytes());
        out.extend_from_slice(&epoch.to_le_bytes());
        out
    }

    /// Bytes covered by the frame tag
    pub fn tag_input(
        object: &Address,
        index: u64,
        previous: &Address,
        epoch: u64,
        ciphertext: &[u8],
    ) -> Vec<u8> {
        let mut out = Self::header_bytes(object, index, previous, epoch);
        out.extend_from_slice(ciphertext);
        out
    }

    /// Canonical bytes covered by the author signature
    pub fn signing_bytes(&self) -> Vec<u8> {
        let mut out = Self::tag_input(
            &self.object,
            self.index,
            &self.previous,
            self.epoch,
            &self.ciphertext,
        );
        out.extend_from_slice(&self.tag);
        out.extend_from_slice(self.author.as_bytes());
        match &self.keyshare {
            Some(keyshare) => {
                out.push(1);
                keyshare.canonical_bytes(&mut out);
            }
            None => out.push(0),
        }
        out
    }

    /// Content address of the signed frame
    pub fn address(&self) -> Address {
        Address::from_parts(b"HGX_FRAME_v1", &[&self.signing_bytes(), &self.signature])
    }

    /// Encode for the wire
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        Ok(bincode::serialize(self)?)
    }

    /// Decode from the wire
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        Ok(bincode::deserialize(bytes)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame() -> Frame {
        Frame {
            object: Address::from_bytes([1u8; 32]),
            index: 0,
            previous: Address::from_bytes([1u8; 32]),
            epoch: 0,
            keyshare: Some(Keyshare {
                epoch: 0,
                wrapped: vec![WrappedSecret {
                    recipient: Address::from_bytes([2u8; 32]),
                    nonce: [0u8; 12],
                    ciphertext: vec![1, 2, 3],
                }],
            }),
            ciphertext: vec![4, 5, 6],
            tag: [7u8; 32],
            author: Address::from_bytes([2u8; 32]),
            signature: vec![8u8; 64],
        }
    }

    #[test]
    fn test_address_covers_keyshare() {
        let a = frame();
        let mut b = frame();
        b.keyshare = None;
        assert_ne!(a.address(), b.address());
    }

    #[test]
    fn test_address_covers_signature() {
        let a = frame();
        let mut b = frame();
        b.signature[0] ^= 1;
        assert_ne!(a.address(), b.address());
    }

    #[test]
    fn test_wire_roundtrip_preserves_address() {
        let a = frame();
        let decoded = Frame::from_bytes(&a.to_bytes().unwrap()).unwrap();
        assert_eq!(decoded.address(), a.address());
    }

    #[test]
    fn test_keyshare_lookup() {
        let a = frame();
        let keyshare = a.keyshare.unwrap();
        assert!(keyshare.for_recipient(&Address::from_bytes([2u8; 32])).is_some());
        assert!(keyshare.for_recipient(&Address::from_bytes([3u8; 32])).is_none());
    }
}
