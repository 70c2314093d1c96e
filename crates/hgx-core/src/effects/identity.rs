//! Identity capability interface

use crate::crypto::KeyMaterial;
use crate::identifiers::Address;
use crate::Result;

/// Signing, verification and pairwise secrets for the local identity
///
/// Implementations own the private key. The engine only ever sees signatures
/// and derived pairwise secrets.
pub trait IdentityEffects: Send + Sync {
    /// Address of the local identity
    fn address(&self) -> Address;

    /// Sign `message` with the local identity
    fn sign(&self, message: &[u8]) -> Vec<u8>;

    /// Verify that `author` signed `message`
    fn verify(&self, author: &Address, message: &[u8], signature: &[u8]) -> Result<()>;

    /// Secret shared only between the local identity and `peer`
    fn pairwise_secret(&self, peer: &Address) -> Result<KeyMaterial>;
}
