//! Frame ratchet key derivation
//!
//! Pure functions behind the dynamic-object ratchet: one HKDF path producing
//! the next root and the frame key, deterministic frame nonces, HMAC frame
//! tags and keyshare wrapping keys.
//!
//! ## KDF Chain
//!
//! ```text
//! okm = HKDF-Expand(
//!     HKDF-Extract(salt=previous_frame_address, ikm=root),
//!     info="HGX_RATCHET_v1" || object || epoch || index,
//!     L=64
//! )
//! next_root = okm[..32]
//! frame_key = okm[32..]
//! ```
//!
//! Binding the previous frame's address as salt ties every key to its chain
//! position. The root is replaced on each step, so holding the state at index
//! `n` reveals nothing about keys before `n`.

use hkdf::Hkdf;
use hmac::{Hmac, Mac};
use sha2::Sha256;

use super::KeyMaterial;
use crate::identifiers::Address;
use crate::{HgxError, Result};

type HmacSha256 = Hmac<Sha256>;

/// Output of one ratchet step
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RatchetStep {
    /// Root replacing the one the step consumed
    pub next_root: KeyMaterial,
    /// Symmetric key sealing the frame at this position
    pub frame_key: KeyMaterial,
}

/// Advance the ratchet by one frame.
pub fn derive_ratchet_step(
    root: &KeyMaterial,
    previous: &Address,
    object: &Address,
    epoch: u64,
    index: u64,
) -> Result<RatchetStep> {
    let hkdf = Hkdf::<Sha256>::new(Some(previous.as_bytes()), root.as_bytes());

    let mut info = Vec::with_capacity(14 + 32 + 16);
    info.extend_from_slice(b"HGX_RATCHET_v1");
    info.extend_from_slice(object.as_bytes());
    info.extend_from_slice(&epoch.to_le_bytes());
    info.extend_from_slice(&index.to_le_bytes());

    let mut okm = [0u8; 64];
    hkdf.expand(&info, &mut okm)
        .map_err(|e| HgxError::crypto(format!("HKDF expansion failed: {e}")))?;

    let mut next_root = [0u8; 32];
    let mut frame_key = [0u8; 32];
    next_root.copy_from_slice(&okm[..32]);
    frame_key.copy_from_slice(&okm[32..]);
    zeroize::Zeroize::zeroize(&mut okm);

    Ok(RatchetStep {
        next_root: KeyMaterial::from_bytes(next_root),
        frame_key: KeyMaterial::from_bytes(frame_key),
    })
}

/// Derive the AEAD nonce for a frame.
///
/// ```text
/// [index (8 bytes LE) | epoch (low 4 bytes LE)]
/// ```
///
/// Every frame key is used for exactly one frame, so the nonce only has to be
/// deterministic for the receiver to recompute it.
pub fn derive_frame_nonce(index: u64, epoch: u64) -> [u8; 12] {
    let mut nonce = [0u8; 12];
    nonce[..8].copy_from_slice(&index.to_le_bytes());
    nonce[8..].copy_from_slice(&epoch.to_le_bytes()[..4]);
    nonce
}

/// Compute the HMAC-SHA256 tag sealed into a frame.
pub fn frame_tag(frame_key: &KeyMaterial, input: &[u8]) -> Result<[u8; 32]> {
    let mut mac = <HmacSha256 as Mac>::new_from_slice(frame_key.as_bytes())
        .map_err(|e| HgxError::crypto(format!("HMAC key rejected: {e}")))?;
    mac.update(b"HGX_TAG_v1");
    mac.update(input);
    Ok(mac.finalize().into_bytes().into())
}

/// Check a frame tag in constant time.
pub fn verify_frame_tag(frame_key: &KeyMaterial, input: &[u8], tag: &[u8; 32]) -> bool {
    let Ok(mut mac) = <HmacSha256 as Mac>::new_from_slice(frame_key.as_bytes()) else {
        return false;
    };
    mac.update(b"HGX_TAG_v1");
    mac.update(input);
    mac.verify_slice(tag).is_ok()
}

/// Derive the key wrapping a secret for one recipient.
pub fn derive_wrapping_key(
    pairwise: &KeyMaterial,
    object: &Address,
    epoch: u64,
    context: &[u8],
) -> Result<KeyMaterial> {
    let hkdf = Hkdf::<Sha256>::new(Some(object.as_bytes()), pairwise.as_bytes());

    let mut info = Vec::with_capacity(16 + context.len() + 8);
    info.extend_from_slice(b"HGX_KEYSHARE_v1");
    info.extend_from_slice(context);
    info.extend_from_slice(&epoch.to_le_bytes());

    let mut output = [0u8; 32];
    hkdf.expand(&info, &mut output)
        .map_err(|e| HgxError::crypto(format!("HKDF expansion failed: {e}")))?;
    Ok(KeyMaterial::from_bytes(output))
}
