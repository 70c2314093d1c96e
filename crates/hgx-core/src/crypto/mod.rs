//! Cryptographic domain types and utilities
//!
//! Pure functions only: key derivation for the frame ratchet, AEAD wrappers,
//! and the local Ed25519 identity. Nothing here touches the transport or the
//! connection core.

pub mod aead;
pub mod identity;
pub mod ratchet;

use serde::{Deserialize, Serialize};
use std::fmt;
use subtle::ConstantTimeEq;
use zeroize::{Zeroize, ZeroizeOnDrop};

pub use aead::{open, random_nonce, seal};
pub use identity::LocalIdentity;
pub use ratchet::{
    derive_frame_nonce, derive_ratchet_step, derive_wrapping_key, frame_tag, verify_frame_tag,
    RatchetStep,
};

/// 32 bytes of secret key material, zeroized on drop
#[derive(Clone, Zeroize, ZeroizeOnDrop, Serialize, Deserialize)]
pub struct KeyMaterial([u8; 32]);

impl KeyMaterial {
    /// Wrap raw key bytes
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    /// Fresh random key material from the OS RNG
    pub fn random() -> Self {
        use rand::RngCore;
        let mut bytes = [0u8; 32];
        rand::rngs::OsRng.fill_bytes(&mut bytes);
        Self(bytes)
    }

    /// Borrow the raw bytes
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl PartialEq for KeyMaterial {
    fn eq(&self, other: &Self) -> bool {
        self.0.ct_eq(&other.0).into()
    }
}

impl Eq for KeyMaterial {}

impl fmt::Debug for KeyMaterial {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("KeyMaterial(<redacted>)")
    }
}
