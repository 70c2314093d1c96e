//! Local Ed25519 identity
//!
//! In-process implementation of [`IdentityEffects`]. Frames are signed with
//! Ed25519; pairwise secrets for keyshare wrapping come from X25519 agreement
//! on the birationally equivalent Montgomery form of the same keys, so each
//! contact needs only its verifying key.

use curve25519_dalek::montgomery::MontgomeryPoint;
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use hkdf::Hkdf;
use parking_lot::RwLock;
use sha2::Sha256;
use std::collections::HashMap;

use super::KeyMaterial;
use crate::effects::IdentityEffects;
use crate::identifiers::Address;
use crate::{HgxError, Result};

/// Address of an identity holding `key`
pub fn identity_address(key: &VerifyingKey) -> Address {
    Address::from_parts(b"HGX_IDENTITY_v1", &[key.as_bytes()])
}

/// Identity backed by an Ed25519 signing key and a contact book
pub struct LocalIdentity {
    signing: SigningKey,
    address: Address,
    contacts: RwLock<HashMap<Address, VerifyingKey>>,
}

impl LocalIdentity {
    /// Generate a fresh identity from the OS RNG
    pub fn generate() -> Self {
        Self::from_signing_key(SigningKey::generate(&mut rand::rngs::OsRng))
    }

    /// Rebuild an identity from a 32-byte seed
    pub fn from_seed(seed: [u8; 32]) -> Self {
        Self::from_signing_key(SigningKey::from_bytes(&seed))
    }

    fn from_signing_key(signing: SigningKey) -> Self {
        let verifying = signing.verifying_key();
        let address = identity_address(&verifying);
        let mut contacts = HashMap::new();
        // Our own devices share this key.
        contacts.insert(address, verifying);
        Self {
            signing,
            address,
            contacts: RwLock::new(contacts),
        }
    }

    /// Public half of the signing key
    pub fn verifying_key(&self) -> VerifyingKey {
        self.signing.verifying_key()
    }

    /// Learn a contact's verifying key; returns the contact's address
    pub fn add_contact(&self, key: VerifyingKey) -> Address {
        let address = identity_address(&key);
        self.contacts.write().insert(address, key);
        address
    }

    /// Whether the contact book knows `address`
    pub fn knows(&self, address: &Address) -> bool {
        self.contacts.read().contains_key(address)
    }

    fn contact(&self, address: &Address) -> Result<VerifyingKey> {
        self.contacts
            .read()
            .get(address)
            .copied()
            .ok_or_else(|| HgxError::not_found(format!("unknown party {address}")))
    }
}

impl std::fmt::Debug for LocalIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalIdentity")
            .field("address", &self.address)
            .field("contacts", &self.contacts.read().len())
            .finish()
    }
}

impl IdentityEffects for LocalIdentity {
    fn address(&self) -> Address {
        self.address
    }

    fn sign(&self, message: &[u8]) -> Vec<u8> {
        self.signing.sign(message).to_bytes().to_vec()
    }

    fn verify(&self, author: &Address, message: &[u8], signature: &[u8]) -> Result<()> {
        let key = self.contact(author)?;
        let signature = Signature::from_slice(signature)
            .map_err(|e| HgxError::crypto(format!("Malformed signature: {e}")))?;
        key.verify(message, &signature)
            .map_err(|e| HgxError::crypto(format!("Signature verification failed: {e}")))
    }

    fn pairwise_secret(&self, peer: &Address) -> Result<KeyMaterial> {
        let peer_key = self.contact(peer)?;
        let shared: MontgomeryPoint = peer_key.to_montgomery() * self.signing.to_scalar();

        // Both sides must feed the same salt regardless of who is "local".
        let (low, high) = if self.address <= *peer {
            (self.address, *peer)
        } else {
            (*peer, self.address)
        };
        let mut salt = [0u8; 64];
        salt[..32].copy_from_slice(low.as_bytes());
        salt[32..].copy_from_slice(high.as_bytes());

        let hkdf = Hkdf::<Sha256>::new(Some(&salt), shared.as_bytes());
        let mut output = [0u8; 32];
        hkdf.expand(b"HGX_PAIRWISE_v1", &mut output)
            .map_err(|e| HgxError::crypto(format!("HKDF expansion failed: {e}")))?;
        Ok(KeyMaterial::from_bytes(output))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pair() -> (LocalIdentity, LocalIdentity) {
        let alice = LocalIdentity::from_seed([1u8; 32]);
        let bob = LocalIdentity::from_seed([2u8; 32]);
        alice.add_contact(bob.verifying_key());
        bob.add_contact(alice.verifying_key());
        (alice, bob)
    }

    #[test]
    fn test_pairwise_secret_agrees() {
        let (alice, bob) = pair();
        let ab = alice.pairwise_secret(&bob.address()).unwrap();
        let ba = bob.pairwise_secret(&alice.address()).unwrap();
        assert_eq!(ab, ba);
    }

    #[test]
    fn test_pairwise_secret_differs_per_peer() {
        let (alice, bob) = pair();
        let carol = LocalIdentity::from_seed([3u8; 32]);
        alice.add_contact(carol.verifying_key());
        assert_ne!(
            alice.pairwise_secret(&bob.address()).unwrap(),
            alice.pairwise_secret(&carol.address()).unwrap()
        );
    }

    #[test]
    fn test_sign_and_verify() {
        let (alice, bob) = pair();
        let sig = alice.sign(b"frame bytes");
        assert!(bob.verify(&alice.address(), b"frame bytes", &sig).is_ok());
        assert!(bob.verify(&alice.address(), b"other bytes", &sig).is_err());
    }

    #[test]
    fn test_unknown_party_rejected() {
        let alice = LocalIdentity::from_seed([1u8; 32]);
        let stranger = LocalIdentity::from_seed([4u8; 32]);
        let err = alice.pairwise_secret(&stranger.address()).unwrap_err();
        assert!(matches!(err, HgxError::NotFound { .. }));
    }

    #[test]
    fn test_own_address_is_a_contact() {
        let alice = LocalIdentity::from_seed([1u8; 32]);
        assert!(alice.knows(&alice.address()));
        assert!(alice.pairwise_secret(&alice.address()).is_ok());
    }
}
