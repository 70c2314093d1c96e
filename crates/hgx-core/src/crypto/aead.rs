//! AES-256-GCM wrappers
//!
//! Used for frame payloads (deterministic nonce per frame key), static object
//! payloads and keyshare wrapping (random nonces).

use aes_gcm::{
    aead::{Aead, KeyInit, Payload},
    Aes256Gcm, Nonce,
};
use rand::RngCore;

use super::KeyMaterial;
use crate::{HgxError, Result};

/// Encrypt and authenticate `plaintext`, binding `aad`.
pub fn seal(key: &KeyMaterial, nonce: &[u8; 12], plaintext: &[u8], aad: &[u8]) -> Result<Vec<u8>> {
    let cipher = Aes256Gcm::new_from_slice(key.as_bytes())
        .map_err(|e| HgxError::crypto(format!("Failed to create cipher: {e}")))?;
    cipher
        .encrypt(
            Nonce::from_slice(nonce),
            Payload {
                msg: plaintext,
                aad,
            },
        )
        .map_err(|e| HgxError::crypto(format!("AES-GCM encryption failed: {e}")))
}

/// Decrypt and verify `ciphertext` sealed with [`seal`].
pub fn open(key: &KeyMaterial, nonce: &[u8; 12], ciphertext: &[u8], aad: &[u8]) -> Result<Vec<u8>> {
    let cipher = Aes256Gcm::new_from_slice(key.as_bytes())
        .map_err(|e| HgxError::crypto(format!("Failed to create cipher: {e}")))?;
    cipher
        .decrypt(
            Nonce::from_slice(nonce),
            Payload {
                msg: ciphertext,
                aad,
            },
        )
        .map_err(|e| HgxError::crypto(format!("AES-GCM decryption failed: {e}")))
}

/// Random 96-bit nonce for keys that seal more than one message
pub fn random_nonce() -> [u8; 12] {
    let mut nonce = [0u8; 12];
    rand::rngs::OsRng.fill_bytes(&mut nonce);
    nonce
}
