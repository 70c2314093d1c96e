//! Frame ratchet state
//!
//! Each frame of a dynamic object is sealed under a key derived from the
//! current root, the previous frame's address, the epoch and the frame index.
//! Deriving a frame replaces the root, so old roots cannot be recovered from
//! new ones.
//!
//! Lookahead ("legroom") bounds how many frames may be derived from one root
//! before a keyshare must start a new epoch. The frame that installs a fresh
//! root does not consume lookahead; every other frame consumes one unit. The
//! sender and every receiver apply the same rule, so a frame that should have
//! carried a keyshare is rejected.

use serde::{Deserialize, Serialize};

use hgx_core::crypto::{self, derive_frame_nonce, derive_ratchet_step, frame_tag, KeyMaterial};
use hgx_core::{Address, Frame, HgxError, IdentityEffects, Result};

use crate::keyshare::{self, ROOT_CONTEXT};

/// Position of one party in an object's frame chain
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RatchetState {
    object: Address,
    root: KeyMaterial,
    epoch: u64,
    next_index: u64,
    legroom: u32,
    remaining: u32,
    fresh: bool,
    #[serde(skip)]
    pending_rekey: bool,
    counter_width: u8,
    head: Address,
    head_key: Option<KeyMaterial>,
}

/// A frame sealed against a ratchet state but not yet committed
#[derive(Debug, Clone)]
pub struct SealedFrame {
    /// The signed frame
    pub frame: Frame,
    /// Ratchet state after the frame
    pub state: RatchetState,
    /// Whether the frame started a new epoch
    pub rekeyed: bool,
}

/// An incoming frame that passed validation
#[derive(Debug, Clone)]
pub struct AcceptedFrame {
    /// Ratchet state after the frame
    pub state: RatchetState,
    /// Decrypted payload
    pub plaintext: Vec<u8>,
    /// Whether the frame installed a keyshare
    pub rekeyed: bool,
}

impl RatchetState {
    /// State for a new object; the first sealed frame always carries a keyshare
    pub fn new(object: Address, legroom: u32, counter_width: u8) -> Self {
        Self {
            object,
            root: KeyMaterial::random(),
            epoch: 0,
            next_index: 0,
            legroom,
            remaining: legroom,
            fresh: false,
            pending_rekey: true,
            counter_width,
            head: object,
            head_key: None,
        }
    }

    /// Object the state derives keys for
    pub fn object(&self) -> &Address {
        &self.object
    }

    /// Keyshare epoch of the current root
    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    /// Index the next frame will carry
    pub fn next_index(&self) -> u64 {
        self.next_index
    }

    /// Frames derivable per keyshare
    pub fn legroom(&self) -> u32 {
        self.legroom
    }

    /// Frames derivable before a keyshare is required
    pub fn remaining(&self) -> u32 {
        self.remaining
    }

    /// Address of the last accepted frame, or the object address before genesis
    pub fn head(&self) -> &Address {
        &self.head
    }

    /// Largest index the counter can represent
    pub fn max_index(&self) -> u64 {
        if self.counter_width >= 64 {
            u64::MAX
        } else {
            (1u64 << self.counter_width) - 1
        }
    }

    /// Whether the counter has no indices left
    pub fn is_exhausted(&self) -> bool {
        self.next_index > self.max_index()
    }

    /// Whether the next sealed frame must carry a keyshare
    pub fn needs_rekey(&self) -> bool {
        self.pending_rekey || (!self.fresh && self.remaining == 0)
    }

    /// Force a keyshare on the next sealed frame
    pub fn request_rekey(&mut self) {
        self.pending_rekey = true;
    }

    /// Install a fresh root for `epoch`
    pub fn rekey(&self, epoch: u64, root: KeyMaterial) -> Self {
        Self {
            root,
            epoch,
            remaining: self.legroom,
            fresh: true,
            pending_rekey: false,
            ..self.clone()
        }
    }

    /// Derive the key for the frame at [`Self::next_index`]
    ///
    /// Returns the state after the frame together with the frame key. The
    /// head is left for the caller to set once the frame address is known.
    pub fn derive_next(&self) -> Result<(RatchetState, KeyMaterial)> {
        let index = self.next_index;
        if index > self.max_index() {
            return Err(HgxError::RatchetExhausted {
                address: self.object,
                width: self.counter_width,
            });
        }

        let (fresh, remaining) = if self.fresh {
            (false, self.remaining)
        } else if self.remaining == 0 {
            return Err(HgxError::ratchet_mismatch(
                self.object,
                index,
                "lookahead exhausted without a keyshare",
            ));
        } else {
            (false, self.remaining - 1)
        };

        let next_index = index.checked_add(1).ok_or(HgxError::RatchetExhausted {
            address: self.object,
            width: self.counter_width,
        })?;
        let step = derive_ratchet_step(&self.root, &self.head, &self.object, self.epoch, index)?;
        let next = Self {
            root: step.next_root,
            next_index,
            remaining,
            fresh,
            ..self.clone()
        };
        Ok((next, step.frame_key))
    }

    /// Record the frame just derived as the head
    pub fn with_head(mut self, head: Address, key: KeyMaterial) -> Self {
        self.head = head;
        self.head_key = Some(key);
        self
    }

    /// Key of the head frame, if any frame has been derived
    pub fn head_key(&self) -> Option<&KeyMaterial> {
        self.head_key.as_ref()
    }

    /// Serialize the state for a share grant
    pub fn to_snapshot(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    /// Rebuild a state received in a share grant
    pub fn from_snapshot(object: &Address, bytes: &[u8]) -> Result<Self> {
        let state: Self = serde_json::from_slice(bytes)?;
        if state.object != *object {
            return Err(HgxError::invalid("ratchet snapshot belongs to another object"));
        }
        if state.head_key.is_none() {
            return Err(HgxError::invalid("ratchet snapshot has no head key"));
        }
        Ok(state)
    }
}

/// Seal `plaintext` as the next frame of the chain
///
/// A keyshare for `recipients` (plus the author) is attached when the state
/// requires one or `force_keyshare` is set.
pub fn seal_frame(
    state: &RatchetState,
    identity: &dyn IdentityEffects,
    plaintext: &[u8],
    recipients: &[Address],
    force_keyshare: bool,
) -> Result<SealedFrame> {
    let object = state.object;
    if state.next_index > state.max_index() {
        return Err(HgxError::RatchetExhausted {
            address: object,
            width: state.counter_width,
        });
    }

    let rekeyed = force_keyshare || state.needs_rekey();
    let (base, keyshare) = if rekeyed {
        let epoch = if state.next_index == 0 {
            0
        } else {
            state.epoch + 1
        };
        let root = KeyMaterial::random();
        let keyshare = keyshare::issue_keyshare(identity, &object, epoch, &root, recipients)?;
        (state.rekey(epoch, root), Some(keyshare))
    } else {
        (state.clone(), None)
    };

    let (next, frame_key) = base.derive_next()?;
    let index = base.next_index;
    let previous = base.head;
    let epoch = base.epoch;

    let nonce = derive_frame_nonce(index, epoch);
    let header = Frame::header_bytes(&object, index, &previous, epoch);
    let ciphertext = crypto::seal(&frame_key, &nonce, plaintext, &header)?;
    let tag = frame_tag(
        &frame_key,
        &Frame::tag_input(&object, index, &previous, epoch, &ciphertext),
    )?;

    let mut frame = Frame {
        object,
        index,
        previous,
        epoch,
        keyshare,
        ciphertext,
        tag,
        author: identity.address(),
        signature: Vec::new(),
    };
    frame.signature = identity.sign(&frame.signing_bytes());

    let state = next.with_head(frame.address(), frame_key);
    Ok(SealedFrame {
        frame,
        state,
        rekeyed,
    })
}

/// Validate the frame at the state's next index and decrypt it
///
/// The caller classifies duplicates and gaps first; any frame reaching this
/// function must sit exactly at [`RatchetState::next_index`].
pub fn validate_incoming(
    state: &RatchetState,
    identity: &dyn IdentityEffects,
    frame: &Frame,
) -> Result<AcceptedFrame> {
    let object = state.object;
    let index = frame.index;
    if frame.object != object {
        return Err(HgxError::ratchet_mismatch(object, index, "frame names another object"));
    }
    if index != state.next_index {
        return Err(HgxError::ratchet_mismatch(
            object,
            index,
            format!("expected index {}", state.next_index),
        ));
    }
    if frame.previous != state.head {
        return Err(HgxError::ratchet_mismatch(
            object,
            index,
            "previous frame does not match the accepted head",
        ));
    }
    identity
        .verify(&frame.author, &frame.signing_bytes(), &frame.signature)
        .map_err(|e| HgxError::ratchet_mismatch(object, index, e.to_string()))?;

    let (base, rekeyed) = match &frame.keyshare {
        Some(share) => {
            let opens_epoch = if index == 0 {
                share.epoch == 0
            } else {
                share.epoch > state.epoch
            };
            if share.epoch != frame.epoch || !opens_epoch {
                return Err(HgxError::ratchet_mismatch(
                    object,
                    index,
                    format!("keyshare epoch {} out of sequence", share.epoch),
                ));
            }
            let entry = share.for_recipient(&identity.address()).ok_or_else(|| {
                HgxError::ratchet_mismatch(object, index, "keyshare does not include this party")
            })?;
            let root = keyshare::unwrap_key(
                identity,
                &frame.author,
                &object,
                share.epoch,
                ROOT_CONTEXT,
                entry,
            )
            .map_err(|e| HgxError::ratchet_mismatch(object, index, e.to_string()))?;
            (state.rekey(share.epoch, root), true)
        }
        None => {
            if index == 0 {
                return Err(HgxError::ratchet_mismatch(
                    object,
                    index,
                    "genesis frame carries no keyshare",
                ));
            }
            if frame.epoch != state.epoch {
                return Err(HgxError::ratchet_mismatch(
                    object,
                    index,
                    format!("epoch {} without a keyshare", frame.epoch),
                ));
            }
            (state.clone(), false)
        }
    };

    let (next, frame_key) = base.derive_next()?;
    let plaintext = open_with_key(&frame_key, frame)?;
    let state = next.with_head(frame.address(), frame_key);
    Ok(AcceptedFrame {
        state,
        plaintext,
        rekeyed,
    })
}

/// Check the tag and decrypt a frame with a known frame key
pub fn open_with_key(frame_key: &KeyMaterial, frame: &Frame) -> Result<Vec<u8>> {
    let tag_input = Frame::tag_input(
        &frame.object,
        frame.index,
        &frame.previous,
        frame.epoch,
        &frame.ciphertext,
    );
    if !crypto::verify_frame_tag(frame_key, &tag_input, &frame.tag) {
        return Err(HgxError::ratchet_mismatch(
            frame.object,
            frame.index,
            "frame tag does not verify",
        ));
    }
    let header = Frame::header_bytes(&frame.object, frame.index, &frame.previous, frame.epoch);
    crypto::open(
        frame_key,
        &derive_frame_nonce(frame.index, frame.epoch),
        &frame.ciphertext,
        &header,
    )
    .map_err(|e| HgxError::ratchet_mismatch(frame.object, frame.index, e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use hgx_core::LocalIdentity;

    fn pair() -> (LocalIdentity, LocalIdentity) {
        let alice = LocalIdentity::from_seed([1u8; 32]);
        let bob = LocalIdentity::from_seed([2u8; 32]);
        alice.add_contact(bob.verifying_key());
        bob.add_contact(alice.verifying_key());
        (alice, bob)
    }

    fn object() -> Address {
        Address::from_bytes([9u8; 32])
    }

    /// Seal `count` frames, returning every frame and the final state
    fn seal_chain(
        alice: &LocalIdentity,
        recipients: &[Address],
        legroom: u32,
        count: usize,
    ) -> (Vec<SealedFrame>, RatchetState) {
        let mut state = RatchetState::new(object(), legroom, 32);
        let mut out = Vec::new();
        for i in 0..count {
            let sealed =
                seal_frame(&state, alice, format!("state {i}").as_bytes(), recipients, false)
                    .unwrap();
            state = sealed.state.clone();
            out.push(sealed);
        }
        (out, state)
    }

    #[test]
    fn test_genesis_carries_keyshare() {
        let (alice, _) = pair();
        let (frames, _) = seal_chain(&alice, &[], 3, 1);
        let genesis = &frames[0].frame;
        assert_eq!(genesis.index, 0);
        assert_eq!(genesis.previous, object());
        assert!(genesis.keyshare.is_some());
        assert!(frames[0].rekeyed);
    }

    #[test]
    fn test_legroom_two_rekeys_on_third_update() {
        let (alice, _) = pair();
        // genesis, u1, u2, u3
        let (frames, _) = seal_chain(&alice, &[], 2, 4);
        let carries: Vec<bool> = frames.iter().map(|s| s.frame.keyshare.is_some()).collect();
        assert_eq!(carries, vec![true, false, false, true]);
        assert_eq!(frames[1].state.remaining(), 1);
        assert_eq!(frames[2].state.remaining(), 0);
        assert_eq!(frames[3].frame.epoch, 1);
    }

    #[test]
    fn test_indices_increase_and_chain_links() {
        let (alice, _) = pair();
        let (frames, _) = seal_chain(&alice, &[], 3, 6);
        for (i, sealed) in frames.iter().enumerate() {
            assert_eq!(sealed.frame.index, i as u64);
            if i > 0 {
                assert_eq!(sealed.frame.previous, frames[i - 1].frame.address());
            }
        }
    }

    #[test]
    fn test_recipient_follows_chain() {
        let (alice, bob) = pair();
        let (frames, _) = seal_chain(&alice, &[bob.address()], 2, 7);

        let mut state = RatchetState::new(object(), 2, 32);
        for (i, sealed) in frames.iter().enumerate() {
            let accepted = validate_incoming(&state, &bob, &sealed.frame).unwrap();
            assert_eq!(accepted.plaintext, format!("state {i}").into_bytes());
            assert_eq!(accepted.state.head(), &sealed.frame.address());
            state = accepted.state;
        }
    }

    #[test]
    fn test_missing_keyshare_rejected_when_lookahead_spent() {
        let (alice, bob) = pair();
        let (frames, state) = seal_chain(&alice, &[bob.address()], 1, 2);
        assert_eq!(state.remaining(), 0);

        // A sender ignoring the lookahead bound skips the keyshare.
        let mut rogue = state.clone();
        rogue.remaining = 1;
        let forged = seal_frame(&rogue, &alice, b"no keyshare", &[bob.address()], false).unwrap();
        assert!(forged.frame.keyshare.is_none());

        let mut receiver = RatchetState::new(object(), 1, 32);
        for sealed in &frames {
            receiver = validate_incoming(&receiver, &bob, &sealed.frame).unwrap().state;
        }
        assert_matches!(
            validate_incoming(&receiver, &bob, &forged.frame),
            Err(HgxError::RatchetMismatch { index: 2, .. })
        );
    }

    #[test]
    fn test_outsider_rejected_at_keyshare() {
        let (alice, bob) = pair();
        let carol = LocalIdentity::from_seed([3u8; 32]);
        carol.add_contact(alice.verifying_key());
        let (frames, _) = seal_chain(&alice, &[bob.address()], 3, 1);
        let receiver = RatchetState::new(object(), 3, 32);
        assert_matches!(
            validate_incoming(&receiver, &carol, &frames[0].frame),
            Err(HgxError::RatchetMismatch { .. })
        );
    }

    #[test]
    fn test_tampered_ciphertext_rejected() {
        let (alice, bob) = pair();
        let (frames, _) = seal_chain(&alice, &[bob.address()], 3, 1);
        let mut frame = frames[0].frame.clone();
        frame.ciphertext[0] ^= 1;
        let receiver = RatchetState::new(object(), 3, 32);
        assert!(validate_incoming(&receiver, &bob, &frame).is_err());
    }

    #[test]
    fn test_out_of_sequence_rejected() {
        let (alice, bob) = pair();
        let (frames, _) = seal_chain(&alice, &[bob.address()], 3, 3);
        let receiver = RatchetState::new(object(), 3, 32);
        assert_matches!(
            validate_incoming(&receiver, &bob, &frames[2].frame),
            Err(HgxError::RatchetMismatch { index: 2, .. })
        );
    }

    #[test]
    fn test_counter_width_exhaustion() {
        let (alice, _) = pair();
        let mut state = RatchetState::new(object(), 8, 2);
        for _ in 0..4 {
            state = seal_frame(&state, &alice, b"x", &[], false).unwrap().state;
        }
        assert_eq!(state.next_index(), 4);
        assert_matches!(
            seal_frame(&state, &alice, b"x", &[], false),
            Err(HgxError::RatchetExhausted { width: 2, .. })
        );
    }

    #[test]
    fn test_forced_keyshare_starts_epoch() {
        let (alice, _) = pair();
        let (_, mut state) = seal_chain(&alice, &[], 5, 2);
        state.request_rekey();
        assert!(state.needs_rekey());
        let sealed = seal_frame(&state, &alice, b"after revoke", &[], false).unwrap();
        assert!(sealed.frame.keyshare.is_some());
        assert_eq!(sealed.frame.epoch, 1);
        assert_eq!(sealed.state.remaining(), 5);
    }

    #[test]
    fn test_snapshot_resumes_chain() {
        let (alice, bob) = pair();
        let (frames, state) = seal_chain(&alice, &[bob.address()], 3, 2);
        let snapshot = state.to_snapshot().unwrap();
        let mut resumed = RatchetState::from_snapshot(&object(), &snapshot).unwrap();

        let head = &frames[1].frame;
        let plaintext = open_with_key(resumed.head_key().unwrap(), head).unwrap();
        assert_eq!(plaintext, b"state 1");

        let next = seal_frame(&state, &alice, b"state 2", &[bob.address()], false).unwrap();
        resumed = validate_incoming(&resumed, &bob, &next.frame).unwrap().state;
        assert_eq!(resumed.next_index(), 3);
    }

    #[test]
    fn test_snapshot_for_other_object_rejected() {
        let (alice, _) = pair();
        let (_, state) = seal_chain(&alice, &[], 3, 1);
        let snapshot = state.to_snapshot().unwrap();
        assert!(RatchetState::from_snapshot(&Address::from_bytes([1u8; 32]), &snapshot).is_err());
    }

    mod properties {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            #![proptest_config(ProptestConfig::with_cases(24))]

            #[test]
            fn keyshares_follow_legroom(legroom in 1u32..5, count in 1usize..14) {
                let (alice, bob) = pair();
                let (frames, _) = seal_chain(&alice, &[bob.address()], legroom, count);

                // genesis plus a keyshare after every `legroom` plain frames
                for (i, sealed) in frames.iter().enumerate() {
                    let expected = i % (legroom as usize + 1) == 0;
                    prop_assert_eq!(sealed.frame.keyshare.is_some(), expected);
                }

                let mut state = RatchetState::new(object(), legroom, 32);
                let mut keys = std::collections::HashSet::new();
                for sealed in &frames {
                    let accepted = validate_incoming(&state, &bob, &sealed.frame).unwrap();
                    state = accepted.state;
                    prop_assert!(keys.insert(state.head_key().unwrap().as_bytes().to_vec()));
                }
                prop_assert_eq!(state.next_index(), count as u64);
            }
        }
    }
}
