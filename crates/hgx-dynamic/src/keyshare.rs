//! Wrapping secrets for recipients
//!
//! A secret is sealed under a key derived from the pairwise secret between
//! sender and recipient, bound to the object, epoch and purpose. Only the two
//! parties of the pair can open it.

use hgx_core::crypto::{self, derive_wrapping_key, KeyMaterial};
use hgx_core::{Address, HgxError, IdentityEffects, Keyshare, Result, WrappedSecret};

/// Purpose tag for ratchet roots carried in frames
pub(crate) const ROOT_CONTEXT: &[u8] = b"root";
/// Purpose tag for ratchet snapshots carried in dynamic grants
pub(crate) const SNAPSHOT_CONTEXT: &[u8] = b"snapshot";
/// Purpose tag for static content keys carried in static grants
pub(crate) const STATIC_CONTEXT: &[u8] = b"static";

fn wrap_aad(object: &Address, epoch: u64, recipient: &Address, context: &[u8]) -> Vec<u8> {
    let mut aad = Vec::with_capacity(32 + 8 + 32 + context.len());
    aad.extend_from_slice(object.as_bytes());
    aad.extend_from_slice(&epoch.to_le_bytes());
    aad.extend_from_slice(recipient.as_bytes());
    aad.extend_from_slice(context);
    aad
}

/// Seal `secret` so only `recipient` (and the local identity) can open it
pub fn wrap_secret(
    identity: &dyn IdentityEffects,
    recipient: &Address,
    object: &Address,
    epoch: u64,
    context: &[u8],
    secret: &[u8],
) -> Result<WrappedSecret> {
    let pairwise = identity.pairwise_secret(recipient)?;
    let key = derive_wrapping_key(&pairwise, object, epoch, context)?;
    let nonce = crypto::random_nonce();
    let ciphertext = crypto::seal(
        &key,
        &nonce,
        secret,
        &wrap_aad(object, epoch, recipient, context),
    )?;
    Ok(WrappedSecret {
        recipient: *recipient,
        nonce,
        ciphertext,
    })
}

/// Open a secret `sender` wrapped for the local identity
pub fn unwrap_secret(
    identity: &dyn IdentityEffects,
    sender: &Address,
    object: &Address,
    epoch: u64,
    context: &[u8],
    wrapped: &WrappedSecret,
) -> Result<Vec<u8>> {
    if wrapped.recipient != identity.address() {
        return Err(HgxError::inaccessible(
            *object,
            "secret is addressed to another identity",
        ));
    }
    let pairwise = identity.pairwise_secret(sender)?;
    let key = derive_wrapping_key(&pairwise, object, epoch, context)?;
    crypto::open(
        &key,
        &wrapped.nonce,
        &wrapped.ciphertext,
        &wrap_aad(object, epoch, &wrapped.recipient, context),
    )
}

/// Open a wrapped 32-byte key
pub fn unwrap_key(
    identity: &dyn IdentityEffects,
    sender: &Address,
    object: &Address,
    epoch: u64,
    context: &[u8],
    wrapped: &WrappedSecret,
) -> Result<KeyMaterial> {
    let bytes = unwrap_secret(identity, sender, object, epoch, context, wrapped)?;
    let array: [u8; 32] = bytes
        .try_into()
        .map_err(|_| HgxError::crypto("wrapped key has the wrong length"))?;
    Ok(KeyMaterial::from_bytes(array))
}

/// Issue a keyshare for `epoch` to every recipient and to the author itself
///
/// The author entry lets the identity's other devices follow the chain.
pub fn issue_keyshare(
    identity: &dyn IdentityEffects,
    object: &Address,
    epoch: u64,
    root: &KeyMaterial,
    recipients: &[Address],
) -> Result<Keyshare> {
    let author = identity.address();
    let mut wrapped = Vec::with_capacity(recipients.len() + 1);
    wrapped.push(wrap_secret(
        identity,
        &author,
        object,
        epoch,
        ROOT_CONTEXT,
        root.as_bytes(),
    )?);
    for recipient in recipients.iter().filter(|r| **r != author) {
        wrapped.push(wrap_secret(
            identity,
            recipient,
            object,
            epoch,
            ROOT_CONTEXT,
            root.as_bytes(),
        )?);
    }
    Ok(Keyshare { epoch, wrapped })
}
